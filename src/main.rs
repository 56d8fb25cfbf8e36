//! Thin entrypoint: load config, init telemetry, load the account store into a pool, and
//! hand a ready `RetryEngine` to whatever ingress wires it up. The HTTP ingress server, admin
//! UI, and CLI account importer are external collaborators (§1) and are not built here.

use std::sync::Arc;

use switchboard_accounts::{AccountPool, JsonFileAccountStore};
use switchboard_core::clock::SystemClock;
use switchboard_core::GatewayConfig;
use switchboard_engine::RetryEngine;
use switchboard_providers::AdapterRegistry;
use switchboard_telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() {
    init_telemetry(TelemetryConfig::default());
    tracing::info!("starting switchboard core");

    let config = GatewayConfig::from_env();
    let store = Arc::new(JsonFileAccountStore::new(config.account_store_path.clone()));
    let registry = Arc::new(AdapterRegistry::new());
    let clock = Arc::new(SystemClock);

    let pool = match AccountPool::load(store, registry.clone(), clock.clone(), config.clone()).await {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            tracing::error!(error = %e, "failed to load account store");
            std::process::exit(1);
        }
    };

    let account_count = pool.account_count().await;
    tracing::info!(accounts = account_count, path = %config.account_store_path, "account pool ready");

    let _engine = RetryEngine::new(pool, registry, clock, config);
    tracing::info!("switchboard core ready; awaiting ingress wiring");

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    tracing::info!("shutting down");
}
