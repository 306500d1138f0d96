//! Abuse Defense Service
//!
//! Real-time detection and mitigation of abusive traffic. Inbound
//! requests are classified against per-tenant thresholds, attack
//! pattern signatures, and per-IP reputation; offenders are blocked
//! automatically with escalation to permanent blocks for repeat
//! offenders.

pub mod alerts;
pub mod api;
pub mod config;
pub mod core;
pub mod models;
pub mod store;
pub mod utils;
