//! Attack pattern classification.
//!
//! A stateless predicate set over the recent-request window. Patterns
//! are evaluated in a fixed priority order and the first match wins.

use std::collections::HashMap;

use crate::models::{AttackType, RequestSample, Severity};

/// Minimum samples before any pattern is evaluated
pub const MIN_SAMPLES: usize = 10;

/// Single-endpoint request count marking an HTTP flood
const HTTP_FLOOD_ENDPOINT_COUNT: usize = 100;
/// Average latency (ms) marking slow-and-low connections
const SLOWLORIS_AVG_LATENCY_MS: f64 = 5000.0;
const SLOWLORIS_MIN_COUNT: usize = 50;
/// Request count plus completion ratio marking a SYN-flood style burst
const SYN_FLOOD_MIN_COUNT: usize = 200;
const SYN_FLOOD_COMPLETION_RATIO: f64 = 0.3;
/// Sensitive-endpoint request count marking an application-layer attack
const APP_LAYER_SENSITIVE_COUNT: usize = 50;

const SENSITIVE_ENDPOINTS: [&str; 3] = ["/api/auth", "/api/payment", "/api/admin"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    pub attack_type: AttackType,
    pub severity: Severity,
}

/// Classify a batch of recent requests. Returns `None` below the
/// sample floor or when no pattern fires.
pub fn classify(samples: &[RequestSample]) -> Option<PatternMatch> {
    if samples.len() < MIN_SAMPLES {
        return None;
    }

    if let Some(m) = http_flood(samples) {
        return Some(m);
    }
    if let Some(m) = slowloris(samples) {
        return Some(m);
    }
    if let Some(m) = syn_flood(samples) {
        return Some(m);
    }
    app_layer(samples)
}

fn http_flood(samples: &[RequestSample]) -> Option<PatternMatch> {
    let mut per_endpoint: HashMap<&str, usize> = HashMap::new();
    for sample in samples {
        *per_endpoint.entry(sample.endpoint.as_str()).or_insert(0) += 1;
    }
    let max_single = per_endpoint.values().copied().max().unwrap_or(0);

    (max_single > HTTP_FLOOD_ENDPOINT_COUNT).then_some(PatternMatch {
        attack_type: AttackType::HttpFlood,
        severity: Severity::High,
    })
}

fn slowloris(samples: &[RequestSample]) -> Option<PatternMatch> {
    if samples.len() <= SLOWLORIS_MIN_COUNT {
        return None;
    }
    let total_latency: u64 = samples.iter().map(|s| s.latency_ms).sum();
    let avg_latency = total_latency as f64 / samples.len() as f64;

    (avg_latency > SLOWLORIS_AVG_LATENCY_MS).then_some(PatternMatch {
        attack_type: AttackType::Slowloris,
        severity: Severity::Medium,
    })
}

fn syn_flood(samples: &[RequestSample]) -> Option<PatternMatch> {
    if samples.len() <= SYN_FLOOD_MIN_COUNT {
        return None;
    }
    let completed = samples.iter().filter(|s| s.status_code < 500).count();
    let ratio = completed as f64 / samples.len() as f64;

    (ratio < SYN_FLOOD_COMPLETION_RATIO).then_some(PatternMatch {
        attack_type: AttackType::SynFlood,
        severity: Severity::Critical,
    })
}

fn app_layer(samples: &[RequestSample]) -> Option<PatternMatch> {
    let sensitive = samples
        .iter()
        .filter(|s| SENSITIVE_ENDPOINTS.iter().any(|e| s.endpoint.contains(e)))
        .count();

    (sensitive > APP_LAYER_SENSITIVE_COUNT).then_some(PatternMatch {
        attack_type: AttackType::ApplicationLayer,
        severity: Severity::High,
    })
}
