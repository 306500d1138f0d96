//! Block lifecycle and tenant settings management.
//!
//! The controller owns the cached per-tenant settings, the
//! whitelist/blacklist membership checks, and the block state
//! machine: temporary blocks expire lazily on lookup, re-blocks merge
//! into the existing active record, and repeated offenses escalate to
//! a permanent block. Store failures on the allow path are logged and
//! treated as "not blocked" so a backing-store outage degrades to
//! no-defense, never to denial of service.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use tokio::sync::RwLock;

use crate::alerts::{Alert, AlertDispatcher};
use crate::models::{
    AttackRecord, BlockedIpRecord, Severity, SettingsUpdate, TenantDefenseSettings,
};
use crate::store::{DefenseStore, StoreError};

/// Window over which attack counts are compared to alert thresholds
const ALERT_WINDOW_HOURS: i64 = 1;

/// Who a block is attributed to when the engine blocks on its own
pub const AUTO_DEFENSE_ACTOR: &str = "auto_defense";

struct CachedSettings {
    settings: TenantDefenseSettings,
    fetched_at: DateTime<Utc>,
}

pub struct DefenseController {
    store: Arc<dyn DefenseStore>,
    alerts: Arc<dyn AlertDispatcher>,
    settings_cache: RwLock<HashMap<String, CachedSettings>>,
    settings_ttl: Duration,
}

impl DefenseController {
    pub fn new(
        store: Arc<dyn DefenseStore>,
        alerts: Arc<dyn AlertDispatcher>,
        settings_ttl_seconds: i64,
    ) -> Self {
        Self {
            store,
            alerts,
            settings_cache: RwLock::new(HashMap::new()),
            settings_ttl: Duration::seconds(settings_ttl_seconds),
        }
    }

    /// Settings for a tenant, from cache when fresh. A tenant seen for
    /// the first time is initialized with defaults; a failing store
    /// falls back to defaults without caching so recovery is quick.
    pub async fn get_settings(&self, tenant_id: &str) -> TenantDefenseSettings {
        let now = Utc::now();
        {
            let cache = self.settings_cache.read().await;
            if let Some(cached) = cache.get(tenant_id) {
                if now - cached.fetched_at < self.settings_ttl {
                    return cached.settings.clone();
                }
            }
        }

        let settings = match self.store.load_settings(tenant_id).await {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                let defaults = TenantDefenseSettings::default();
                if let Err(e) = self.store.save_settings(tenant_id, &defaults).await {
                    warn!("Failed to persist default settings for {}: {}", tenant_id, e);
                }
                defaults
            }
            Err(e) => {
                error!("Settings lookup failed for {}: {}", tenant_id, e);
                return TenantDefenseSettings::default();
            }
        };

        let mut cache = self.settings_cache.write().await;
        cache.insert(
            tenant_id.to_string(),
            CachedSettings {
                settings: settings.clone(),
                fetched_at: now,
            },
        );
        settings
    }

    /// Apply a partial update and invalidate the cache entry.
    pub async fn update_settings(
        &self,
        tenant_id: &str,
        update: SettingsUpdate,
    ) -> Result<TenantDefenseSettings, StoreError> {
        let mut settings = self.get_settings(tenant_id).await;
        settings.apply(update);
        self.store.save_settings(tenant_id, &settings).await?;
        self.invalidate(tenant_id).await;
        Ok(settings)
    }

    pub async fn add_to_whitelist(&self, tenant_id: &str, ip: &str) -> Result<(), StoreError> {
        let mut settings = self.get_settings(tenant_id).await;
        settings.whitelist.insert(ip.to_string());
        self.store.save_settings(tenant_id, &settings).await?;
        self.invalidate(tenant_id).await;
        Ok(())
    }

    pub async fn remove_from_whitelist(&self, tenant_id: &str, ip: &str) -> Result<(), StoreError> {
        let mut settings = self.get_settings(tenant_id).await;
        settings.whitelist.remove(ip);
        self.store.save_settings(tenant_id, &settings).await?;
        self.invalidate(tenant_id).await;
        Ok(())
    }

    pub async fn add_to_blacklist(&self, tenant_id: &str, ip: &str) -> Result<(), StoreError> {
        let mut settings = self.get_settings(tenant_id).await;
        settings.blacklist.insert(ip.to_string());
        self.store.save_settings(tenant_id, &settings).await?;
        self.invalidate(tenant_id).await;
        Ok(())
    }

    pub async fn remove_from_blacklist(&self, tenant_id: &str, ip: &str) -> Result<(), StoreError> {
        let mut settings = self.get_settings(tenant_id).await;
        settings.blacklist.remove(ip);
        self.store.save_settings(tenant_id, &settings).await?;
        self.invalidate(tenant_id).await;
        Ok(())
    }

    /// Whitelist membership takes precedence over every other rule,
    /// including pre-existing blocks.
    pub async fn is_whitelisted(&self, tenant_id: &str, ip: &str) -> bool {
        self.get_settings(tenant_id).await.whitelist.contains(ip)
    }

    pub async fn is_blacklisted(&self, tenant_id: &str, ip: &str) -> bool {
        self.get_settings(tenant_id).await.blacklist.contains(ip)
    }

    /// Whether an active block applies right now. Temporary blocks
    /// whose expiry has passed are deactivated here as a side effect;
    /// expired state is not guaranteed to be visible until this
    /// lookup runs.
    pub async fn is_blocked(&self, tenant_id: &str, ip: &str, now: DateTime<Utc>) -> bool {
        let record = match self.store.current_block(tenant_id, ip).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                error!("Block lookup failed for {}/{}: {}", tenant_id, ip, e);
                return false;
            }
        };

        if !record.is_active {
            return false;
        }
        if record.is_permanent {
            return true;
        }
        match record.expires_at {
            Some(expires_at) if expires_at <= now => {
                let mut expired = record;
                expired.is_active = false;
                if let Err(e) = self.store.save_block(&expired).await {
                    warn!("Failed to deactivate expired block for {}/{}: {}", tenant_id, ip, e);
                }
                info!("Block expired for {}/{}", tenant_id, ip);
                false
            }
            _ => true,
        }
    }

    /// Create or extend a block. An existing active record is updated
    /// in place: expiry extended, attack count incremented. The block
    /// becomes permanent when requested explicitly or when the
    /// historical block count reaches the tenant's escalation limit.
    pub async fn block(
        &self,
        tenant_id: &str,
        ip: &str,
        reason: &str,
        blocked_by: &str,
        permanent: bool,
        duration_seconds: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<BlockedIpRecord, StoreError> {
        let settings = self.get_settings(tenant_id).await;
        let history = self.store.record_block_event(tenant_id, ip).await?;
        let is_permanent = permanent || history >= settings.permanent_block_after;
        let duration = duration_seconds.unwrap_or(settings.block_duration_seconds);
        let expires_at = if is_permanent {
            None
        } else {
            Some(now + Duration::seconds(duration))
        };

        let existing = self.store.current_block(tenant_id, ip).await?;
        let record = match existing {
            Some(mut record) if record.is_active => {
                record.reason = reason.to_string();
                record.blocked_at = now;
                record.last_attack_at = now;
                record.attack_count += 1;
                record.is_permanent = record.is_permanent || is_permanent;
                record.expires_at = if record.is_permanent { None } else { expires_at };
                record
            }
            _ => BlockedIpRecord {
                tenant_id: tenant_id.to_string(),
                ip: ip.to_string(),
                reason: reason.to_string(),
                blocked_by: blocked_by.to_string(),
                blocked_at: now,
                expires_at,
                is_active: true,
                is_permanent,
                attack_count: 1,
                last_attack_at: now,
            },
        };

        self.store.save_block(&record).await?;
        info!(
            "Blocked {}/{} ({}): permanent={} attacks={}",
            tenant_id, ip, reason, record.is_permanent, record.attack_count
        );
        Ok(record)
    }

    /// Deactivate the active block. History is retained and still
    /// counts toward permanence.
    pub async fn unblock(&self, tenant_id: &str, ip: &str) -> Result<bool, StoreError> {
        match self.store.current_block(tenant_id, ip).await? {
            Some(mut record) if record.is_active => {
                record.is_active = false;
                self.store.save_block(&record).await?;
                info!("Unblocked {}/{}", tenant_id, ip);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Block on the engine's own initiative. No-op when auto defense
    /// is disabled for the tenant or the IP is already actively
    /// blocked; store failures are swallowed.
    pub async fn auto_block(
        &self,
        tenant_id: &str,
        ip: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Option<BlockedIpRecord> {
        let settings = self.get_settings(tenant_id).await;
        if !settings.auto_defense_enabled {
            return None;
        }
        if self.is_blocked(tenant_id, ip, now).await {
            return None;
        }

        match self
            .block(tenant_id, ip, reason, AUTO_DEFENSE_ACTOR, false, None, now)
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                error!("Auto-block failed for {}/{}: {}", tenant_id, ip, e);
                None
            }
        }
    }

    /// Persist an attack-log row off the decision path.
    pub fn record_attack(&self, record: AttackRecord) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.append_attack(&record).await {
                warn!(
                    "Failed to persist attack record for {}/{}: {}",
                    record.tenant_id, record.ip, e
                );
            }
        });
    }

    /// Compare the rolling attack count against the tenant's alert
    /// thresholds and notify the dispatcher on a crossing. Delivery
    /// failures are logged, never propagated.
    pub async fn check_and_alert(&self, tenant_id: &str, now: DateTime<Utc>) {
        let settings = self.get_settings(tenant_id).await;
        let since = now - Duration::hours(ALERT_WINDOW_HOURS);
        let count = match self.store.attack_count_since(tenant_id, since).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Attack count lookup failed for {}: {}", tenant_id, e);
                return;
            }
        };

        let (severity, threshold) = if count >= settings.alert_thresholds.critical {
            (Severity::Critical, settings.alert_thresholds.critical)
        } else if count >= settings.alert_thresholds.high {
            (Severity::High, settings.alert_thresholds.high)
        } else {
            return;
        };

        let alert = Alert::new(
            "attack_volume",
            severity,
            "Attack volume threshold crossed",
            &format!(
                "{} attacks detected for tenant {} in the last hour (threshold {})",
                count, tenant_id, threshold
            ),
        )
        .with_data(serde_json::json!({
            "tenant_id": tenant_id,
            "attack_count": count,
            "threshold": threshold,
        }));

        if let Err(e) = self
            .alerts
            .send_alert(&alert, &settings.notification_settings)
            .await
        {
            warn!("Alert delivery failed for {}: {}", tenant_id, e);
        }
    }

    /// Active block records for a tenant, empty on store failure.
    pub async fn active_blocks(&self, tenant_id: &str) -> Vec<BlockedIpRecord> {
        match self.store.active_blocks(tenant_id).await {
            Ok(records) => records,
            Err(e) => {
                error!("Active block listing failed for {}: {}", tenant_id, e);
                Vec::new()
            }
        }
    }

    async fn invalidate(&self, tenant_id: &str) {
        self.settings_cache.write().await.remove(tenant_id);
    }
}
