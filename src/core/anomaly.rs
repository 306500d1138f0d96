//! Volumetric and behavioral anomaly detection.
//!
//! Compares one IP's counter snapshot against the tenant's thresholds
//! and, failing that, looks for softer suspicious signals over the
//! analysis window. Checks run in a fixed order; the first volumetric
//! breach wins.

use std::collections::HashMap;

use crate::models::{AnomalyType, Severity, TenantDefenseSettings};

use super::counters::TrafficSnapshot;

/// Requests from one user agent marking a scripted client
const DOMINANT_USER_AGENT_COUNT: usize = 50;
/// Share of error responses marking probing traffic
const ERROR_SHARE: f64 = 0.5;
/// Mean gap between requests marking machine-speed traffic
const RAPID_FIRE_MEAN_GAP_MS: f64 = 10.0;

/// Outcome of an anomaly check.
#[derive(Debug, Clone)]
pub struct AnomalyResult {
    pub detected: bool,
    pub anomaly_type: Option<AnomalyType>,
    pub severity: Option<Severity>,
    /// Observed value for volumetric breaches
    pub value: Option<u64>,
    /// Threshold that was crossed
    pub threshold: Option<u64>,
    /// Suspicious signals that fired, for the suspicious_pattern type
    pub patterns: Vec<String>,
}

impl AnomalyResult {
    fn none() -> Self {
        Self {
            detected: false,
            anomaly_type: None,
            severity: None,
            value: None,
            threshold: None,
            patterns: Vec::new(),
        }
    }

    fn over_threshold(anomaly_type: AnomalyType, value: u64, threshold: u64) -> Self {
        let severity = if value > threshold * 2 {
            Severity::Critical
        } else {
            Severity::High
        };
        Self {
            detected: true,
            anomaly_type: Some(anomaly_type),
            severity: Some(severity),
            value: Some(value),
            threshold: Some(threshold),
            patterns: Vec::new(),
        }
    }

    fn suspicious(patterns: Vec<String>) -> Self {
        Self {
            detected: true,
            anomaly_type: Some(AnomalyType::SuspiciousPattern),
            severity: Some(Severity::Medium),
            value: None,
            threshold: None,
            patterns,
        }
    }
}

/// Stateless detector; all state lives in the snapshot and settings.
pub struct AnomalyDetector;

impl AnomalyDetector {
    /// Run the ordered checks for one IP.
    pub fn detect(settings: &TenantDefenseSettings, snapshot: &TrafficSnapshot) -> AnomalyResult {
        if snapshot.rpm_count > settings.rpm_threshold {
            return AnomalyResult::over_threshold(
                AnomalyType::HighRpm,
                snapshot.rpm_count,
                settings.rpm_threshold,
            );
        }

        if snapshot.token_tracking && snapshot.tpm_tokens > settings.tpm_threshold {
            return AnomalyResult::over_threshold(
                AnomalyType::HighTpm,
                snapshot.tpm_tokens,
                settings.tpm_threshold,
            );
        }

        let patterns = suspicious_signals(snapshot);
        if !patterns.is_empty() {
            return AnomalyResult::suspicious(patterns);
        }

        AnomalyResult::none()
    }
}

/// Independent secondary signals over the analysis window; every
/// firing signal is reported.
fn suspicious_signals(snapshot: &TrafficSnapshot) -> Vec<String> {
    let samples = &snapshot.recent_requests;
    let mut patterns = Vec::new();
    if samples.is_empty() {
        return patterns;
    }

    let mut per_agent: HashMap<&str, usize> = HashMap::new();
    for sample in samples {
        *per_agent.entry(sample.user_agent.as_str()).or_insert(0) += 1;
    }
    if per_agent.values().any(|&c| c > DOMINANT_USER_AGENT_COUNT) {
        patterns.push("dominant_user_agent".to_string());
    }

    let errors = samples.iter().filter(|s| s.status_code >= 400).count();
    if errors as f64 / samples.len() as f64 >= ERROR_SHARE {
        patterns.push("high_error_rate".to_string());
    }

    if samples.len() >= 2 {
        let gaps: i64 = samples
            .windows(2)
            .map(|pair| {
                (pair[1].timestamp - pair[0].timestamp)
                    .num_milliseconds()
                    .max(0)
            })
            .sum();
        let mean_gap = gaps as f64 / (samples.len() - 1) as f64;
        if mean_gap < RAPID_FIRE_MEAN_GAP_MS {
            patterns.push("rapid_fire".to_string());
        }
    }

    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestSample;
    use chrono::{Duration, Utc};

    fn snapshot(rpm: u64) -> TrafficSnapshot {
        TrafficSnapshot {
            rpm_count: rpm,
            tpm_tokens: 0,
            token_tracking: false,
            recent_requests: Vec::new(),
        }
    }

    fn sample(user_agent: &str, status_code: u16, at: chrono::DateTime<Utc>) -> RequestSample {
        RequestSample {
            endpoint: "/api/items".to_string(),
            method: "GET".to_string(),
            user_agent: user_agent.to_string(),
            status_code,
            latency_ms: 20,
            timestamp: at,
        }
    }

    #[test]
    fn rpm_over_threshold_is_high_severity() {
        let settings = TenantDefenseSettings::default();
        let result = AnomalyDetector::detect(&settings, &snapshot(1001));

        assert!(result.detected);
        assert_eq!(result.anomaly_type, Some(AnomalyType::HighRpm));
        assert_eq!(result.severity, Some(Severity::High));
        assert_eq!(result.value, Some(1001));
        assert_eq!(result.threshold, Some(1000));
    }

    #[test]
    fn rpm_over_double_threshold_is_critical() {
        let settings = TenantDefenseSettings::default();
        let result = AnomalyDetector::detect(&settings, &snapshot(2001));

        assert!(result.detected);
        assert_eq!(result.severity, Some(Severity::Critical));
    }

    #[test]
    fn rpm_at_threshold_is_not_detected() {
        let settings = TenantDefenseSettings::default();
        let result = AnomalyDetector::detect(&settings, &snapshot(1000));
        assert!(!result.detected);
    }

    #[test]
    fn tpm_only_counts_when_token_tracking_is_active() {
        let settings = TenantDefenseSettings::default();
        let mut snap = snapshot(10);
        snap.tpm_tokens = 500_000;

        // Token volume alone is not enough without tracking.
        assert!(!AnomalyDetector::detect(&settings, &snap).detected);

        snap.token_tracking = true;
        let result = AnomalyDetector::detect(&settings, &snap);
        assert!(result.detected);
        assert_eq!(result.anomaly_type, Some(AnomalyType::HighTpm));
        assert_eq!(result.severity, Some(Severity::Critical));
    }

    #[test]
    fn dominant_user_agent_and_errors_merge_into_one_result() {
        let settings = TenantDefenseSettings::default();
        let now = Utc::now();
        let mut snap = snapshot(10);
        snap.recent_requests = (0..60)
            .map(|i| sample("curl/8.0", 503, now + Duration::seconds(i)))
            .collect();

        let result = AnomalyDetector::detect(&settings, &snap);
        assert!(result.detected);
        assert_eq!(result.anomaly_type, Some(AnomalyType::SuspiciousPattern));
        assert_eq!(result.severity, Some(Severity::Medium));
        assert!(result.patterns.contains(&"dominant_user_agent".to_string()));
        assert!(result.patterns.contains(&"high_error_rate".to_string()));
        assert!(!result.patterns.contains(&"rapid_fire".to_string()));
    }

    #[test]
    fn machine_speed_gaps_are_rapid_fire() {
        let settings = TenantDefenseSettings::default();
        let now = Utc::now();
        let mut snap = snapshot(10);
        snap.recent_requests = (0..20)
            .map(|i| sample(&format!("agent-{}", i), 200, now + Duration::milliseconds(i * 2)))
            .collect();

        let result = AnomalyDetector::detect(&settings, &snap);
        assert!(result.detected);
        assert_eq!(result.patterns, vec!["rapid_fire".to_string()]);
    }

    #[test]
    fn normal_traffic_is_clean() {
        let settings = TenantDefenseSettings::default();
        let now = Utc::now();
        let mut snap = snapshot(10);
        snap.recent_requests = (0..20)
            .map(|i| sample(&format!("agent-{}", i % 5), 200, now + Duration::seconds(i)))
            .collect();

        let result = AnomalyDetector::detect(&settings, &snap);
        assert!(!result.detected);
        assert!(result.anomaly_type.is_none());
    }
}
