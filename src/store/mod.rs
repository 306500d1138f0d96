//! Persistence seam for the abuse defense engine.
//!
//! The durable tables for tenant settings, blocked IPs, and attack
//! logs live in an external store. The engine only depends on the
//! `DefenseStore` trait; `RedisStore` is the production implementation
//! and `MemoryStore` backs tests and store-less deployments.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{AttackRecord, BlockedIpRecord, TenantDefenseSettings};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store error: {0}")]
    Other(String),
}

/// Durable storage contract consumed by the defense controller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DefenseStore: Send + Sync {
    /// Load settings for a tenant, `None` when the tenant has none yet.
    async fn load_settings(
        &self,
        tenant_id: &str,
    ) -> Result<Option<TenantDefenseSettings>, StoreError>;

    /// Persist settings for a tenant.
    async fn save_settings(
        &self,
        tenant_id: &str,
        settings: &TenantDefenseSettings,
    ) -> Result<(), StoreError>;

    /// Current block record for (tenant, ip), active or not.
    async fn current_block(
        &self,
        tenant_id: &str,
        ip: &str,
    ) -> Result<Option<BlockedIpRecord>, StoreError>;

    /// Upsert the block record for (tenant, ip).
    async fn save_block(&self, record: &BlockedIpRecord) -> Result<(), StoreError>;

    /// Count one more historical block event for (tenant, ip) and
    /// return the total. The counter survives unblocks; it feeds the
    /// permanence escalation.
    async fn record_block_event(&self, tenant_id: &str, ip: &str) -> Result<u32, StoreError>;

    /// All currently active block records for a tenant.
    async fn active_blocks(&self, tenant_id: &str) -> Result<Vec<BlockedIpRecord>, StoreError>;

    /// Append an attack-log row.
    async fn append_attack(&self, record: &AttackRecord) -> Result<(), StoreError>;

    /// Number of attack rows logged for a tenant since `since`.
    async fn attack_count_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
