//! Redis-backed store implementation.
//!
//! Settings and block records are kept as JSON blobs, block history
//! as plain counters, and attack logs as a per-tenant sorted set
//! scored by start time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;

use super::{DefenseStore, StoreError};
use crate::models::{AttackRecord, BlockedIpRecord, TenantDefenseSettings};
use crate::utils::{tenant_ip_key, tenant_key};

const SETTINGS_PREFIX: &str = "defense:settings";
const BLOCK_PREFIX: &str = "defense:block";
const BLOCK_HISTORY_PREFIX: &str = "defense:block_history";
const ACTIVE_SET_PREFIX: &str = "defense:blocks";
const ATTACK_LOG_PREFIX: &str = "defense:attacks";

pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        Ok(self.client.get_async_connection().await?)
    }
}

impl redis::FromRedisValue for TenantDefenseSettings {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let str_value: String = redis::FromRedisValue::from_redis_value(v)?;
        serde_json::from_str(&str_value).map_err(|e| {
            redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "Failed to parse TenantDefenseSettings from JSON",
                e.to_string(),
            ))
        })
    }
}

impl redis::FromRedisValue for BlockedIpRecord {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let str_value: String = redis::FromRedisValue::from_redis_value(v)?;
        serde_json::from_str(&str_value).map_err(|e| {
            redis::RedisError::from((
                redis::ErrorKind::TypeError,
                "Failed to parse BlockedIpRecord from JSON",
                e.to_string(),
            ))
        })
    }
}

#[async_trait]
impl DefenseStore for RedisStore {
    async fn load_settings(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantDefenseSettings>, StoreError> {
        let mut conn = self.connection().await?;
        let settings: Option<TenantDefenseSettings> =
            conn.get(tenant_key(SETTINGS_PREFIX, tenant_id)).await?;
        Ok(settings)
    }

    async fn save_settings(
        &self,
        tenant_id: &str,
        settings: &TenantDefenseSettings,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(settings)?;
        let _: () = conn.set(tenant_key(SETTINGS_PREFIX, tenant_id), json).await?;
        Ok(())
    }

    async fn current_block(
        &self,
        tenant_id: &str,
        ip: &str,
    ) -> Result<Option<BlockedIpRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let record: Option<BlockedIpRecord> =
            conn.get(tenant_ip_key(BLOCK_PREFIX, tenant_id, ip)).await?;
        Ok(record)
    }

    async fn save_block(&self, record: &BlockedIpRecord) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(record)?;
        let block_key = tenant_ip_key(BLOCK_PREFIX, record.tenant_id.as_str(), record.ip.as_str());
        let set_key = tenant_key(ACTIVE_SET_PREFIX, record.tenant_id.as_str());

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("SET").arg(&block_key).arg(json).ignore();
        if record.is_active {
            pipe.cmd("SADD").arg(&set_key).arg(&record.ip).ignore();
        } else {
            pipe.cmd("SREM").arg(&set_key).arg(&record.ip).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn record_block_event(&self, tenant_id: &str, ip: &str) -> Result<u32, StoreError> {
        let mut conn = self.connection().await?;
        let count: u32 = conn
            .incr(tenant_ip_key(BLOCK_HISTORY_PREFIX, tenant_id, ip), 1)
            .await?;
        Ok(count)
    }

    async fn active_blocks(&self, tenant_id: &str) -> Result<Vec<BlockedIpRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let ips: Vec<String> = conn.smembers(tenant_key(ACTIVE_SET_PREFIX, tenant_id)).await?;

        let mut records = Vec::with_capacity(ips.len());
        for ip in ips {
            let record: Option<BlockedIpRecord> =
                conn.get(tenant_ip_key(BLOCK_PREFIX, tenant_id, &ip)).await?;
            if let Some(record) = record {
                if record.is_active {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    async fn append_attack(&self, record: &AttackRecord) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let json = serde_json::to_string(record)?;
        let _: () = conn
            .zadd(
                tenant_key(ATTACK_LOG_PREFIX, record.tenant_id.as_str()),
                json,
                record.start_time.timestamp(),
            )
            .await?;
        Ok(())
    }

    async fn attack_count_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let count: u64 = conn
            .zcount(
                tenant_key(ATTACK_LOG_PREFIX, tenant_id),
                since.timestamp(),
                "+inf",
            )
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Requires a local Redis at 127.0.0.1:6379; run with --ignored.
    #[tokio::test]
    #[ignore]
    async fn settings_roundtrip_against_local_redis() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let store = RedisStore::new(client);

        let settings = TenantDefenseSettings::default();
        store.save_settings("redis_test", &settings).await.unwrap();

        let loaded = store.load_settings("redis_test").await.unwrap().unwrap();
        assert_eq!(loaded.rpm_threshold, settings.rpm_threshold);
    }
}
