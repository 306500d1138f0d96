//! Abuse Defense Service
//!
//! This is the main entry point for the abuse defense service.
//! It initializes the application components and starts the web server.

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use redis::Client;
use std::sync::Arc;
use tokio::sync::watch;

use abuse_defense_service::alerts::WebhookAlertDispatcher;
use abuse_defense_service::api::{self, ApiState};
use abuse_defense_service::config::load_config;
use abuse_defense_service::core::{spawn_sweeper, DefenseController, IngestGate};
use abuse_defense_service::store::{DefenseStore, MemoryStore, RedisStore};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Abuse Defense Service...");

    // Load configuration
    let config = load_config().context("Failed to load configuration")?;

    // Select the backing store
    let store: Arc<dyn DefenseStore> = if config.redis.url == "memory" {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        info!("Using Redis store at {}", config.redis.url);
        let client = Client::open(config.redis.url.as_str())
            .context("Failed to create Redis client")?;
        Arc::new(RedisStore::new(client))
    };

    // Wire up the engine
    let defense = Arc::new(DefenseController::new(
        store,
        Arc::new(WebhookAlertDispatcher::new()),
        config.engine.settings_ttl_seconds,
    ));
    let engine = Arc::new(IngestGate::new(defense.clone(), config.engine.clone()));

    // Install the Prometheus recorder
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    // Start the background sweeper
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(
        engine.clone(),
        config.engine.sweep_interval_seconds,
        shutdown_rx,
    );

    // Create API state
    let state = web::Data::new(ApiState {
        engine,
        defense,
        metrics: Some(metrics),
    });

    // Start HTTP server
    info!(
        "Listening on {}:{}",
        config.server.host, config.server.port
    );
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await?;

    // Stop the sweeper once the server has drained
    let _ = shutdown_tx.send(true);
    sweeper.await.context("Sweeper task panicked")?;

    info!("Shutdown complete");
    Ok(())
}
