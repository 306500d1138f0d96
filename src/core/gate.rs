//! Ingest gate: the single entry point for request classification.
//!
//! Every inbound request flows through `classify`, which composes the
//! whitelist/block-state checks, counter updates, anomaly detection,
//! pattern classification, reputation scoring, and the auto-block
//! decision into one allow/deny verdict. The whole call runs under a
//! small time budget and fails open when the budget is exhausted.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::{AttackRecord, Decision, EngineConfig, RequestMeta, RequestSample};

use super::anomaly::AnomalyDetector;
use super::counters::WindowedCounters;
use super::defense::DefenseController;
use super::patterns::{self, PatternMatch};
use super::reputation::{anomaly_points, attack_points, ReputationScorer};

/// Reputation score above which an attack event triggers auto-block
const ATTACK_BLOCK_SCORE: f64 = 80.0;
/// Reputation score above which an anomaly alone triggers auto-block
const ANOMALY_BLOCK_SCORE: f64 = 100.0;

struct OpenAttack {
    record: AttackRecord,
    detections: u32,
    last_detected: DateTime<Utc>,
}

pub struct IngestGate {
    counters: WindowedCounters,
    reputation: ReputationScorer,
    defense: Arc<DefenseController>,
    open_attacks: DashMap<(String, String, String), OpenAttack>,
    config: EngineConfig,
}

impl IngestGate {
    pub fn new(defense: Arc<DefenseController>, config: EngineConfig) -> Self {
        Self {
            counters: WindowedCounters::new(&config),
            reputation: ReputationScorer::new(),
            defense,
            open_attacks: DashMap::new(),
            config,
        }
    }

    /// Classify one request. Never returns an error and never hangs:
    /// when the decision budget is exhausted the request is allowed.
    pub async fn classify(&self, ip: &str, meta: &RequestMeta) -> Decision {
        let budget = StdDuration::from_millis(self.config.decision_timeout_ms);
        match tokio::time::timeout(budget, self.classify_inner(ip, meta)).await {
            Ok(decision) => decision,
            Err(_) => {
                warn!("Classification timed out for {}; failing open", ip);
                counter!("defense_classify_timeouts_total", 1);
                Decision::allow("classification_timeout")
            }
        }
    }

    async fn classify_inner(&self, ip: &str, meta: &RequestMeta) -> Decision {
        let now = Utc::now();
        let tenant_id = meta.tenant_id.as_str();
        counter!("defense_requests_total", 1);

        if self.defense.is_whitelisted(tenant_id, ip).await {
            return Decision::allow("whitelisted");
        }
        if self.defense.is_blacklisted(tenant_id, ip).await {
            counter!("defense_requests_blocked_total", 1);
            return Decision::deny("ip_blacklisted", None);
        }
        if self.defense.is_blocked(tenant_id, ip, now).await {
            counter!("defense_requests_blocked_total", 1);
            return Decision::deny("ip_blocked", None);
        }

        self.counters
            .record(ip, RequestSample::from_meta(meta, now), meta.estimated_tokens, now);
        let snapshot = self.counters.snapshot(ip, now);
        let settings = self.defense.get_settings(tenant_id).await;

        let anomaly = AnomalyDetector::detect(&settings, &snapshot);
        if anomaly.detected {
            let severity = anomaly.severity.unwrap_or(crate::models::Severity::Medium);
            let score = self.reputation.increase(ip, anomaly_points(severity), now);
            counter!("defense_anomalies_total", 1);
            debug!(
                "Anomaly {:?} for {}/{}: score now {:.0}",
                anomaly.anomaly_type, tenant_id, ip, score
            );

            if score > ANOMALY_BLOCK_SCORE {
                let reason = match anomaly.anomaly_type {
                    Some(t) => format!("reputation {:.0} after {} anomaly", score, t),
                    None => format!("reputation {:.0}", score),
                };
                if self
                    .defense
                    .auto_block(tenant_id, ip, &reason, now)
                    .await
                    .is_some()
                {
                    counter!("defense_requests_blocked_total", 1);
                    self.spawn_alert_check(tenant_id, now);
                    return Decision::deny("anomaly_detected", None);
                }
            }
        }

        if let Some(pattern) = patterns::classify(&snapshot.recent_requests) {
            return self
                .handle_attack(tenant_id, ip, pattern, &snapshot.recent_requests, &settings, now)
                .await;
        }

        Decision::allow("ok")
    }

    async fn handle_attack(
        &self,
        tenant_id: &str,
        ip: &str,
        pattern: PatternMatch,
        recent: &[RequestSample],
        settings: &crate::models::TenantDefenseSettings,
        now: DateTime<Utc>,
    ) -> Decision {
        counter!("defense_attacks_detected_total", 1);
        // Open attacks are tracked per tenant: one IP hitting several
        // tenants yields a separate record, and a separate attack log
        // row, for each of them.
        let key = (
            tenant_id.to_string(),
            ip.to_string(),
            pattern.attack_type.as_str().to_string(),
        );

        let (record, detections) = {
            let mut entry = self.open_attacks.entry(key.clone()).or_insert_with(|| {
                OpenAttack {
                    record: AttackRecord {
                        id: Uuid::new_v4().to_string(),
                        tenant_id: tenant_id.to_string(),
                        ip: ip.to_string(),
                        attack_type: pattern.attack_type,
                        severity: pattern.severity,
                        request_count: recent.len() as u64,
                        start_time: now,
                        end_time: None,
                        blocked: false,
                        auto_blocked: false,
                    },
                    detections: 0,
                    last_detected: now,
                }
            });
            // request_count mirrors the sample buffer, which only
            // grows between detections of the same open attack.
            entry.record.request_count = entry.record.request_count.max(recent.len() as u64);
            entry.detections += 1;
            entry.last_detected = now;
            (entry.record.clone(), entry.detections)
        };
        self.defense.record_attack(record.clone());

        let score = self.reputation.increase(ip, attack_points(pattern.severity), now);
        let should_block = pattern.severity == crate::models::Severity::Critical
            || score > ATTACK_BLOCK_SCORE
            || detections >= settings.attack_count_threshold;

        if should_block {
            let reason = format!(
                "{} attack ({} severity, reputation {:.0})",
                pattern.attack_type, pattern.severity, score
            );
            if self
                .defense
                .auto_block(tenant_id, ip, &reason, now)
                .await
                .is_some()
            {
                if let Some((_, mut open)) = self.open_attacks.remove(&key) {
                    open.record.blocked = true;
                    open.record.auto_blocked = true;
                    open.record.end_time = Some(now);
                    self.defense.record_attack(open.record);
                }
                counter!("defense_requests_blocked_total", 1);
                self.spawn_alert_check(tenant_id, now);
                return Decision::deny("attack_detected", Some(pattern.attack_type));
            }
        }

        Decision::allow("ok")
    }

    fn spawn_alert_check(&self, tenant_id: &str, now: DateTime<Utc>) {
        let defense = Arc::clone(&self.defense);
        let tenant_id = tenant_id.to_string();
        tokio::spawn(async move {
            defense.check_and_alert(&tenant_id, now).await;
        });
    }

    /// Evict idle per-IP state: counters, reputation entries, and
    /// open attack records no detection has touched for twice the
    /// analysis window.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let attack_cutoff = now - Duration::seconds(self.config.analysis_window_seconds) * 2;
        let attacks_before = self.open_attacks.len();
        self.open_attacks
            .retain(|_, open| open.last_detected >= attack_cutoff);

        self.counters.sweep(now)
            + self.reputation.sweep(now)
            + (attacks_before - self.open_attacks.len())
    }

    pub fn tracked_ips(&self) -> usize {
        self.counters.tracked_ips()
    }
}

/// Run the periodic idle-state sweep until shutdown is signalled.
pub fn spawn_sweeper(
    gate: Arc<IngestGate>,
    interval_seconds: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = gate.sweep(Utc::now());
                    if evicted > 0 {
                        debug!("Sweeper evicted {} idle entries", evicted);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Sweeper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::LogAlertDispatcher;
    use crate::models::{
        AttackType, BlockedIpRecord, SettingsUpdate, TenantDefenseSettings,
    };
    use crate::store::{DefenseStore, MemoryStore, MockDefenseStore, StoreError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Store whose settings lookup never returns within a small
    /// decision budget.
    struct StallingStore;

    #[async_trait]
    impl DefenseStore for StallingStore {
        async fn load_settings(
            &self,
            _tenant_id: &str,
        ) -> Result<Option<TenantDefenseSettings>, StoreError> {
            tokio::time::sleep(StdDuration::from_millis(200)).await;
            Ok(None)
        }

        async fn save_settings(
            &self,
            _tenant_id: &str,
            _settings: &TenantDefenseSettings,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn current_block(
            &self,
            _tenant_id: &str,
            _ip: &str,
        ) -> Result<Option<BlockedIpRecord>, StoreError> {
            Ok(None)
        }

        async fn save_block(&self, _record: &BlockedIpRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn record_block_event(
            &self,
            _tenant_id: &str,
            _ip: &str,
        ) -> Result<u32, StoreError> {
            Ok(1)
        }

        async fn active_blocks(
            &self,
            _tenant_id: &str,
        ) -> Result<Vec<BlockedIpRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn append_attack(&self, _record: &AttackRecord) -> Result<(), StoreError> {
            Ok(())
        }

        async fn attack_count_since(
            &self,
            _tenant_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    fn meta(endpoint: &str) -> RequestMeta {
        RequestMeta {
            tenant_id: "t1".to_string(),
            endpoint: endpoint.to_string(),
            method: "GET".to_string(),
            user_agent: "test-agent".to_string(),
            status_code: 200,
            latency_ms: 20,
            estimated_tokens: None,
        }
    }

    fn gate_with(store: Arc<dyn DefenseStore>, config: EngineConfig) -> (Arc<IngestGate>, Arc<DefenseController>) {
        let defense = Arc::new(DefenseController::new(
            store,
            Arc::new(LogAlertDispatcher),
            60,
        ));
        (Arc::new(IngestGate::new(defense.clone(), config)), defense)
    }

    fn relaxed_timeout_config() -> EngineConfig {
        // Tests share a single-threaded runtime; give classify slack.
        EngineConfig {
            decision_timeout_ms: 5000,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn whitelisted_ip_always_passes() {
        let store = Arc::new(MemoryStore::new());
        let (gate, defense) = gate_with(store, relaxed_timeout_config());
        defense.add_to_whitelist("t1", "10.0.0.1").await.unwrap();
        defense
            .update_settings(
                "t1",
                SettingsUpdate {
                    rpm_threshold: Some(5),
                    ..SettingsUpdate::default()
                },
            )
            .await
            .unwrap();

        for _ in 0..500 {
            let decision = gate.classify("10.0.0.1", &meta("/api/auth/login")).await;
            assert!(decision.allowed);
            assert_eq!(decision.reason, "whitelisted");
        }
    }

    #[tokio::test]
    async fn blacklisted_ip_is_denied() {
        let store = Arc::new(MemoryStore::new());
        let (gate, defense) = gate_with(store, relaxed_timeout_config());
        defense.add_to_blacklist("t1", "10.0.0.9").await.unwrap();

        let decision = gate.classify("10.0.0.9", &meta("/api/items")).await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "ip_blacklisted");
    }

    #[tokio::test]
    async fn normal_traffic_is_allowed() {
        let store = Arc::new(MemoryStore::new());
        let (gate, _) = gate_with(store, relaxed_timeout_config());

        // Human-paced browsing: spaced requests over varied endpoints.
        for i in 0..20 {
            let decision = gate
                .classify("10.0.0.1", &meta(&format!("/api/items/{}", i)))
                .await;
            assert!(decision.allowed, "request {} should pass", i);
            tokio::time::sleep(StdDuration::from_millis(15)).await;
        }
    }

    #[tokio::test]
    async fn repeated_anomalies_escalate_to_block() {
        let store = Arc::new(MemoryStore::new());
        let (gate, defense) = gate_with(store, relaxed_timeout_config());
        defense
            .update_settings(
                "t1",
                SettingsUpdate {
                    rpm_threshold: Some(5),
                    ..SettingsUpdate::default()
                },
            )
            .await
            .unwrap();

        // Spread across endpoints so no attack pattern fires first;
        // each over-threshold request adds anomaly points until the
        // reputation score crosses the block line.
        let mut denied = None;
        for i in 0..40 {
            let decision = gate
                .classify("10.0.0.2", &meta(&format!("/api/items/{}", i % 7)))
                .await;
            if !decision.allowed {
                denied = Some(decision);
                break;
            }
        }

        let denied = denied.expect("escalating anomalies must end in a deny");
        assert_eq!(denied.reason, "anomaly_detected");

        let after = gate.classify("10.0.0.2", &meta("/api/items/1")).await;
        assert!(!after.allowed);
        assert_eq!(after.reason, "ip_blocked");
    }

    #[tokio::test]
    async fn endpoint_flood_is_blocked_as_attack() {
        let store = Arc::new(MemoryStore::new());
        let (gate, _) = gate_with(store, relaxed_timeout_config());

        // A botnet-style flood: one endpoint hammered with rotating
        // user agents, paced just below the rapid-fire signal so the
        // pattern classifier is what catches it.
        let mut denied = None;
        for i in 0..150 {
            let mut flood = meta("/api/search");
            flood.user_agent = format!("bot-agent/{}", i);
            let decision = gate.classify("10.0.0.3", &flood).await;
            if !decision.allowed {
                denied = Some(decision);
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(15)).await;
        }

        let denied = denied.expect("an endpoint flood must be denied");
        assert_eq!(denied.reason, "attack_detected");
        assert_eq!(denied.attack_type, Some(AttackType::HttpFlood));

        let after = gate.classify("10.0.0.3", &meta("/api/search")).await;
        assert!(!after.allowed);
        assert_eq!(after.reason, "ip_blocked");
    }

    #[tokio::test]
    async fn store_outage_still_returns_a_decision() {
        let mut store = MockDefenseStore::new();
        store
            .expect_load_settings()
            .returning(|_| Err(StoreError::Other("store down".to_string())));
        store
            .expect_current_block()
            .returning(|_, _| Err(StoreError::Other("store down".to_string())));
        store
            .expect_record_block_event()
            .returning(|_, _| Err(StoreError::Other("store down".to_string())));
        store
            .expect_append_attack()
            .returning(|_| Err(StoreError::Other("store down".to_string())));
        store
            .expect_attack_count_since()
            .returning(|_, _| Err(StoreError::Other("store down".to_string())));
        store
            .expect_save_settings()
            .returning(|_, _| Err(StoreError::Other("store down".to_string())));
        store
            .expect_save_block()
            .returning(|_| Err(StoreError::Other("store down".to_string())));

        let (gate, _) = gate_with(Arc::new(store), relaxed_timeout_config());

        // Legitimate traffic keeps flowing on a dead store.
        for i in 0..30 {
            let decision = gate
                .classify("10.0.0.4", &meta(&format!("/api/items/{}", i)))
                .await;
            assert!(decision.allowed, "request {} must fail open", i);
        }
    }

    #[tokio::test]
    async fn attack_rows_are_attributed_to_the_detecting_tenant() {
        let store = Arc::new(MemoryStore::new());
        let (gate, _) = gate_with(store.clone(), relaxed_timeout_config());
        let epoch = Utc::now() - Duration::hours(1);

        // Tenant t1 sees the flood first and ends up blocking the IP.
        for i in 0..150 {
            let mut flood = meta("/api/search");
            flood.user_agent = format!("bot-agent/{}", i);
            if !gate.classify("10.0.0.8", &flood).await.allowed {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(15)).await;
        }

        // The same IP then hits a second tenant. That detection must
        // open t2's own attack record, not fold into t1's.
        let mut cross = meta("/api/search");
        cross.tenant_id = "t2".to_string();
        gate.classify("10.0.0.8", &cross).await;

        // Attack rows are persisted off the decision path.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(store.attack_count_since("t2", epoch).await.unwrap() >= 1);
        assert!(store.attack_count_since("t1", epoch).await.unwrap() >= 1);
    }

    #[tokio::test]
    async fn stalled_store_fails_open_on_timeout() {
        let (gate, _) = gate_with(
            Arc::new(StallingStore),
            EngineConfig {
                decision_timeout_ms: 5,
                ..EngineConfig::default()
            },
        );

        let decision = gate.classify("10.0.0.6", &meta("/api/items")).await;
        assert!(decision.allowed);
        assert_eq!(decision.reason, "classification_timeout");
    }

    #[tokio::test]
    async fn attack_record_request_count_tracks_observed_samples() {
        let captured: Arc<Mutex<Vec<AttackRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();

        // Auto defense off so every detection stays on the allow path
        // and keeps appending to the same open record.
        let mut store = MockDefenseStore::new();
        store.expect_load_settings().returning(|_| {
            Ok(Some(TenantDefenseSettings {
                auto_defense_enabled: false,
                ..TenantDefenseSettings::default()
            }))
        });
        store.expect_current_block().returning(|_, _| Ok(None));
        store.expect_append_attack().returning(move |record| {
            sink.lock().unwrap().push(record.clone());
            Ok(())
        });

        let (gate, _) = gate_with(Arc::new(store), relaxed_timeout_config());

        for i in 0..110 {
            let mut flood = meta("/api/search");
            flood.user_agent = format!("bot-agent/{}", i);
            let decision = gate.classify("10.0.0.7", &flood).await;
            assert!(decision.allowed, "request {} stays on the allow path", i);
            tokio::time::sleep(StdDuration::from_millis(15)).await;
        }
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        let records = captured.lock().unwrap();
        assert!(!records.is_empty());
        // The record reports observed requests, not detection count:
        // the flood fires from the 101st sample onward and the final
        // detection sees all 110.
        let max_count = records.iter().map(|r| r.request_count).max().unwrap();
        assert_eq!(max_count, 110);
    }

    #[tokio::test]
    async fn sweep_clears_idle_state() {
        let store = Arc::new(MemoryStore::new());
        let (gate, _) = gate_with(store, relaxed_timeout_config());

        gate.classify("10.0.0.5", &meta("/api/items")).await;
        assert_eq!(gate.tracked_ips(), 1);

        let evicted = gate.sweep(Utc::now() + Duration::seconds(601));
        assert!(evicted >= 1);
        assert_eq!(gate.tracked_ips(), 0);
    }

    #[tokio::test]
    async fn sweeper_task_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let (gate, _) = gate_with(store, relaxed_timeout_config());

        let (tx, rx) = watch::channel(false);
        let handle = spawn_sweeper(gate, 3600, rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn default_settings_match_documented_constants() {
        let settings = TenantDefenseSettings::default();
        assert_eq!(settings.rpm_threshold, 1000);
        assert_eq!(settings.permanent_block_after, 5);
        assert!(settings.auto_defense_enabled);
    }
}
