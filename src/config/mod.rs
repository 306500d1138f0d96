//! Configuration management for the abuse defense engine.
//!
//! This module handles loading and managing application configuration
//! from environment variables and configuration files.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use std::env;

use crate::models::Config;

/// Load configuration from a file (optional) layered with environment
/// variables, with hard-coded defaults underneath.
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default())
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("redis.pool_size", 10)?
        .set_default("engine.window_seconds", 60)?
        .set_default("engine.analysis_window_seconds", 300)?
        .set_default("engine.max_samples_per_ip", 10_000)?
        .set_default("engine.sweep_interval_seconds", 60)?
        .set_default("engine.settings_ttl_seconds", 60)?
        .set_default("engine.decision_timeout_ms", 10)?
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_config_file() {
        let config = load_config().unwrap();
        assert_eq!(config.engine.window_seconds, 60);
        assert_eq!(config.engine.max_samples_per_ip, 10_000);
        assert_eq!(config.server.port, 8080);
    }
}
