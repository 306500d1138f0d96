//! In-memory store implementation.
//!
//! Backs the test suite and deployments that run without a durable
//! store. State is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{DefenseStore, StoreError};
use crate::models::{AttackRecord, BlockedIpRecord, TenantDefenseSettings};

#[derive(Default)]
pub struct MemoryStore {
    settings: RwLock<HashMap<String, TenantDefenseSettings>>,
    blocks: RwLock<HashMap<(String, String), BlockedIpRecord>>,
    block_history: RwLock<HashMap<(String, String), u32>>,
    attacks: RwLock<Vec<AttackRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefenseStore for MemoryStore {
    async fn load_settings(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantDefenseSettings>, StoreError> {
        Ok(self.settings.read().await.get(tenant_id).cloned())
    }

    async fn save_settings(
        &self,
        tenant_id: &str,
        settings: &TenantDefenseSettings,
    ) -> Result<(), StoreError> {
        self.settings
            .write()
            .await
            .insert(tenant_id.to_string(), settings.clone());
        Ok(())
    }

    async fn current_block(
        &self,
        tenant_id: &str,
        ip: &str,
    ) -> Result<Option<BlockedIpRecord>, StoreError> {
        let key = (tenant_id.to_string(), ip.to_string());
        Ok(self.blocks.read().await.get(&key).cloned())
    }

    async fn save_block(&self, record: &BlockedIpRecord) -> Result<(), StoreError> {
        let key = (record.tenant_id.clone(), record.ip.clone());
        self.blocks.write().await.insert(key, record.clone());
        Ok(())
    }

    async fn record_block_event(&self, tenant_id: &str, ip: &str) -> Result<u32, StoreError> {
        let key = (tenant_id.to_string(), ip.to_string());
        let mut history = self.block_history.write().await;
        let count = history.entry(key).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn active_blocks(&self, tenant_id: &str) -> Result<Vec<BlockedIpRecord>, StoreError> {
        Ok(self
            .blocks
            .read()
            .await
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.is_active)
            .cloned()
            .collect())
    }

    async fn append_attack(&self, record: &AttackRecord) -> Result<(), StoreError> {
        self.attacks.write().await.push(record.clone());
        Ok(())
    }

    async fn attack_count_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        Ok(self
            .attacks
            .read()
            .await
            .iter()
            .filter(|a| a.tenant_id == tenant_id && a.start_time >= since)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttackType, Severity};
    use chrono::Duration;

    #[tokio::test]
    async fn settings_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load_settings("t1").await.unwrap().is_none());

        let settings = TenantDefenseSettings::default();
        store.save_settings("t1", &settings).await.unwrap();

        let loaded = store.load_settings("t1").await.unwrap().unwrap();
        assert_eq!(loaded.rpm_threshold, settings.rpm_threshold);
    }

    #[tokio::test]
    async fn block_history_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.record_block_event("t1", "10.0.0.1").await.unwrap(), 1);
        assert_eq!(store.record_block_event("t1", "10.0.0.1").await.unwrap(), 2);
        assert_eq!(store.record_block_event("t1", "10.0.0.2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn attack_count_filters_by_tenant_and_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = AttackRecord {
            id: "a1".to_string(),
            tenant_id: "t1".to_string(),
            ip: "10.0.0.1".to_string(),
            attack_type: AttackType::HttpFlood,
            severity: Severity::High,
            request_count: 150,
            start_time: now,
            end_time: None,
            blocked: false,
            auto_blocked: false,
        };
        store.append_attack(&record).await.unwrap();
        store
            .append_attack(&AttackRecord {
                tenant_id: "t2".to_string(),
                ..record.clone()
            })
            .await
            .unwrap();

        let count = store
            .attack_count_since("t1", now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let none = store
            .attack_count_since("t1", now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(none, 0);
    }
}
