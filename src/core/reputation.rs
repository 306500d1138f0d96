//! Per-IP reputation scoring.
//!
//! Detection events accumulate points per IP; a score that sits idle
//! for more than a day is halved before the next event lands. Decay
//! is computed from the last_seen value as it was before the current
//! touch, so an IP that keeps offending never decays.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::models::Severity;

/// Violation history cap per IP, oldest evicted first
const MAX_VIOLATIONS: usize = 100;
/// Idle time after which the score halves
const DECAY_IDLE_HOURS: i64 = 24;
/// Entries below this score are eligible for eviction once idle
const EVICTION_SCORE: f64 = 10.0;

/// Points for an anomaly detection at the given severity.
pub fn anomaly_points(severity: Severity) -> u32 {
    match severity {
        Severity::Critical => 20,
        _ => 10,
    }
}

/// Points for an attack-pattern detection at the given severity.
pub fn attack_points(severity: Severity) -> u32 {
    match severity {
        Severity::Critical => 30,
        _ => 15,
    }
}

#[derive(Debug, Clone)]
struct Violation {
    points: u32,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct ReputationEntry {
    score: f64,
    last_seen: DateTime<Utc>,
    violations: Vec<Violation>,
}

/// Keyed store of reputation entries, one per offending IP.
pub struct ReputationScorer {
    entries: DashMap<String, ReputationEntry>,
}

impl ReputationScorer {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Add points for `ip` and return the updated score. Idle decay
    /// is applied against the previous last_seen before the entry is
    /// touched.
    pub fn increase(&self, ip: &str, points: u32, now: DateTime<Utc>) -> f64 {
        let mut entry = self
            .entries
            .entry(ip.to_string())
            .or_insert_with(|| ReputationEntry {
                score: 0.0,
                last_seen: now,
                violations: Vec::new(),
            });

        if now - entry.last_seen > Duration::hours(DECAY_IDLE_HOURS) {
            entry.score /= 2.0;
        }
        entry.score += points as f64;
        entry.last_seen = now;

        if entry.violations.len() >= MAX_VIOLATIONS {
            entry.violations.remove(0);
        }
        entry.violations.push(Violation {
            points,
            timestamp: now,
        });

        entry.score
    }

    /// Current score for `ip`, zero when untracked.
    pub fn score(&self, ip: &str) -> f64 {
        self.entries.get(ip).map(|e| e.score).unwrap_or(0.0)
    }

    /// Number of retained violation entries for `ip`.
    pub fn violation_count(&self, ip: &str) -> usize {
        self.entries.get(ip).map(|e| e.violations.len()).unwrap_or(0)
    }

    /// Halve the score of an entry idle longer than the decay window.
    pub fn apply_decay(&self, ip: &str, now: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(ip) {
            if now - entry.last_seen > Duration::hours(DECAY_IDLE_HOURS) {
                entry.score /= 2.0;
                entry.last_seen = now;
            }
        }
    }

    /// Evict entries that have both decayed below the floor and sat
    /// idle past the decay window. Returns the number evicted.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            e.score >= EVICTION_SCORE || now - e.last_seen <= Duration::hours(DECAY_IDLE_HOURS)
        });
        before - self.entries.len()
    }

    pub fn tracked_ips(&self) -> usize {
        self.entries.len()
    }
}

impl Default for ReputationScorer {
    fn default() -> Self {
        Self::new()
    }
}
