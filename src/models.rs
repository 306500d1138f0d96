//! Data model for the abuse defense engine.
//!
//! Holds the wire types exchanged with the request-handling layer,
//! the persisted records for blocks and attacks, per-tenant defense
//! settings, and the application configuration.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attack categories recognized by the pattern classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    HttpFlood,
    Slowloris,
    SynFlood,
    ApplicationLayer,
}

impl AttackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackType::HttpFlood => "http_flood",
            AttackType::Slowloris => "slowloris",
            AttackType::SynFlood => "syn_flood",
            AttackType::ApplicationLayer => "application_layer",
        }
    }
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anomaly categories reported by the anomaly detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    HighRpm,
    HighTpm,
    SuspiciousPattern,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::HighRpm => "high_rpm",
            AnomalyType::HighTpm => "high_tpm",
            AnomalyType::SuspiciousPattern => "suspicious_pattern",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a detection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request metadata supplied by the request-handling layer for each
/// inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Tenant whose thresholds and block state apply
    pub tenant_id: String,
    /// Request path
    pub endpoint: String,
    /// HTTP method
    pub method: String,
    /// User agent header, empty string when absent
    #[serde(default)]
    pub user_agent: String,
    /// Response status code
    pub status_code: u16,
    /// Time taken to serve the request
    pub latency_ms: u64,
    /// Optional caller-supplied cost estimate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens: Option<u64>,
}

/// A single observed request, as retained in the per-IP window buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSample {
    pub endpoint: String,
    pub method: String,
    pub user_agent: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl RequestSample {
    pub fn from_meta(meta: &RequestMeta, timestamp: DateTime<Utc>) -> Self {
        Self {
            endpoint: meta.endpoint.clone(),
            method: meta.method.clone(),
            user_agent: meta.user_agent.clone(),
            status_code: meta.status_code,
            latency_ms: meta.latency_ms,
            timestamp,
        }
    }
}

/// Verdict returned to the request-handling layer. Always a value,
/// never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_type: Option<AttackType>,
}

impl Decision {
    pub fn allow(reason: &str) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
            attack_type: None,
        }
    }

    pub fn deny(reason: &str, attack_type: Option<AttackType>) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
            attack_type,
        }
    }
}

/// Alert thresholds over the rolling attack count per tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub high: u64,
    pub critical: u64,
}

/// Per-tenant alert delivery configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub email: bool,
    pub webhook: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Per-tenant defense settings, persisted and cached with a short TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantDefenseSettings {
    pub auto_defense_enabled: bool,
    /// Requests per minute before an anomaly is raised
    pub rpm_threshold: u64,
    /// Token cost per minute before an anomaly is raised
    pub tpm_threshold: u64,
    /// Repeated detections on one open attack before auto-block
    pub attack_count_threshold: u32,
    /// Temporary block duration
    pub block_duration_seconds: i64,
    /// Historical block count at which a block becomes permanent
    pub permanent_block_after: u32,
    pub alert_thresholds: AlertThresholds,
    pub notification_settings: NotificationSettings,
    pub whitelist: HashSet<String>,
    pub blacklist: HashSet<String>,
}

impl Default for TenantDefenseSettings {
    fn default() -> Self {
        Self {
            auto_defense_enabled: true,
            rpm_threshold: 1000,
            tpm_threshold: 100_000,
            attack_count_threshold: 3,
            block_duration_seconds: 3600,
            permanent_block_after: 5,
            alert_thresholds: AlertThresholds {
                high: 10,
                critical: 50,
            },
            notification_settings: NotificationSettings::default(),
            whitelist: HashSet::new(),
            blacklist: HashSet::new(),
        }
    }
}

/// Partial settings update applied through the admin API. Absent
/// fields leave the current value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub auto_defense_enabled: Option<bool>,
    pub rpm_threshold: Option<u64>,
    pub tpm_threshold: Option<u64>,
    pub attack_count_threshold: Option<u32>,
    pub block_duration_seconds: Option<i64>,
    pub permanent_block_after: Option<u32>,
    pub alert_thresholds: Option<AlertThresholds>,
    pub notification_settings: Option<NotificationSettings>,
}

impl TenantDefenseSettings {
    pub fn apply(&mut self, update: SettingsUpdate) {
        if let Some(v) = update.auto_defense_enabled {
            self.auto_defense_enabled = v;
        }
        if let Some(v) = update.rpm_threshold {
            self.rpm_threshold = v;
        }
        if let Some(v) = update.tpm_threshold {
            self.tpm_threshold = v;
        }
        if let Some(v) = update.attack_count_threshold {
            self.attack_count_threshold = v;
        }
        if let Some(v) = update.block_duration_seconds {
            self.block_duration_seconds = v;
        }
        if let Some(v) = update.permanent_block_after {
            self.permanent_block_after = v;
        }
        if let Some(v) = update.alert_thresholds {
            self.alert_thresholds = v;
        }
        if let Some(v) = update.notification_settings {
            self.notification_settings = v;
        }
    }
}

/// Persisted block record. At most one active record exists per
/// (tenant, ip); re-blocking updates it in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedIpRecord {
    pub tenant_id: String,
    pub ip: String,
    pub reason: String,
    pub blocked_by: String,
    pub blocked_at: DateTime<Utc>,
    /// None for permanent blocks
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub is_permanent: bool,
    pub attack_count: u32,
    pub last_attack_at: DateTime<Utc>,
}

/// Persisted attack-log record, mirrored in memory while the attack
/// is open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackRecord {
    pub id: String,
    pub tenant_id: String,
    pub ip: String,
    pub attack_type: AttackType,
    pub severity: Severity,
    pub request_count: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub blocked: bool,
    pub auto_blocked: bool,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL; the literal value "memory" selects the
    /// in-memory store instead
    pub url: String,
    /// Redis connection pool size
    pub pool_size: u32,
}

/// Detection engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed counter window
    pub window_seconds: i64,
    /// Window over which recent requests are pattern-analyzed
    pub analysis_window_seconds: i64,
    /// Hard cap on the per-IP sample buffer
    pub max_samples_per_ip: usize,
    /// Idle-state sweep cadence
    pub sweep_interval_seconds: u64,
    /// Settings cache TTL
    pub settings_ttl_seconds: i64,
    /// Budget for the whole classify call; fails open when exceeded
    pub decision_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            analysis_window_seconds: 300,
            max_samples_per_ip: 10_000,
            sweep_interval_seconds: 60,
            settings_ttl_seconds: 60,
            decision_timeout_ms: 10,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Redis configuration
    pub redis: RedisConfig,
    /// Engine configuration
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                pool_size: 10,
            },
            engine: EngineConfig::default(),
        }
    }
}
