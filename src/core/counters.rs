//! Per-IP fixed-window traffic counters.
//!
//! Each observed IP owns a request window and, when the caller
//! supplies token estimates, a token window. Both reset wholesale at
//! the window boundary. The request buffer feeds pattern analysis and
//! is capped so a sustained flood cannot grow memory without bound.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::models::{EngineConfig, RequestSample};

/// Point-in-time view of one IP's counters, as consumed by the
/// anomaly detector and pattern classifier.
#[derive(Debug, Clone)]
pub struct TrafficSnapshot {
    /// Requests recorded in the current window
    pub rpm_count: u64,
    /// Token cost recorded in the current window
    pub tpm_tokens: u64,
    /// Whether the caller has ever supplied token estimates for this IP
    pub token_tracking: bool,
    /// Samples within the analysis window, oldest first
    pub recent_requests: Vec<RequestSample>,
}

#[derive(Debug)]
struct TrafficWindow {
    request_count: u64,
    window_start: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    samples: VecDeque<RequestSample>,
}

impl TrafficWindow {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            last_seen: now,
            samples: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
struct TokenWindow {
    tokens: u64,
    window_start: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Keyed store of per-IP windows. Entries are created lazily on first
/// request and evicted by the periodic sweep once idle.
pub struct WindowedCounters {
    windows: DashMap<String, TrafficWindow>,
    tokens: DashMap<String, TokenWindow>,
    window: Duration,
    analysis_window: Duration,
    max_samples: usize,
}

impl WindowedCounters {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            windows: DashMap::new(),
            tokens: DashMap::new(),
            window: Duration::seconds(config.window_seconds),
            analysis_window: Duration::seconds(config.analysis_window_seconds),
            max_samples: config.max_samples_per_ip,
        }
    }

    /// Record one request for `ip`. A stale window is cleared before
    /// the sample is counted, so a long-idle IP never inherits old
    /// counts.
    pub fn record(
        &self,
        ip: &str,
        sample: RequestSample,
        estimated_tokens: Option<u64>,
        now: DateTime<Utc>,
    ) {
        let mut entry = self
            .windows
            .entry(ip.to_string())
            .or_insert_with(|| TrafficWindow::new(now));

        if now - entry.window_start >= self.window {
            entry.request_count = 0;
            entry.samples.clear();
            entry.window_start = now;
        }
        entry.request_count += 1;
        entry.last_seen = now;
        if entry.samples.len() >= self.max_samples {
            entry.samples.pop_front();
        }
        entry.samples.push_back(sample);
        drop(entry);

        if let Some(tokens) = estimated_tokens {
            let mut entry = self.tokens.entry(ip.to_string()).or_insert(TokenWindow {
                tokens: 0,
                window_start: now,
                last_seen: now,
            });
            if now - entry.window_start >= self.window {
                entry.tokens = 0;
                entry.window_start = now;
            }
            entry.tokens += tokens;
            entry.last_seen = now;
        }
    }

    /// Counter view for `ip`. Recent requests are filtered to the
    /// analysis window; stale windows read as empty.
    pub fn snapshot(&self, ip: &str, now: DateTime<Utc>) -> TrafficSnapshot {
        let cutoff = now - self.analysis_window;

        let (rpm_count, recent_requests) = match self.windows.get(ip) {
            Some(entry) if now - entry.window_start < self.window => {
                let recent = entry
                    .samples
                    .iter()
                    .filter(|s| s.timestamp >= cutoff)
                    .cloned()
                    .collect();
                (entry.request_count, recent)
            }
            _ => (0, Vec::new()),
        };

        let (tpm_tokens, token_tracking) = match self.tokens.get(ip) {
            Some(entry) if now - entry.window_start < self.window => (entry.tokens, true),
            Some(_) => (0, true),
            None => (0, false),
        };

        TrafficSnapshot {
            rpm_count,
            tpm_tokens,
            token_tracking,
            recent_requests,
        }
    }

    /// Evict whole per-IP entries idle longer than twice the analysis
    /// window. Returns the number of evicted IPs.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let idle_cutoff = now - self.analysis_window * 2;
        let before = self.windows.len();
        self.windows.retain(|_, w| w.last_seen >= idle_cutoff);
        self.tokens.retain(|_, w| w.last_seen >= idle_cutoff);
        before - self.windows.len()
    }

    pub fn tracked_ips(&self) -> usize {
        self.windows.len()
    }
}
