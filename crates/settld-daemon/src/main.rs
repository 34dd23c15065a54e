// SPDX-License-Identifier: MIT OR Apache-2.0
//! Daemon entrypoint: load config, pick the store driver, start the HTTP
//! server and the delivery worker.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use settld_config::{SettldConfig, StoreDriver};
use settld_daemon::{router, AppState};
use settld_outbox::{DeliveryWorker, Destination, RetryPolicy};
use settld_store::{MemoryStore, SqliteStore, Store};
use settld_telemetry::MetricsCollector;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = match std::env::var("SETTLD_CONFIG").ok() {
        Some(path) => SettldConfig::load(Path::new(&path))
            .with_context(|| format!("loading config from {path}"))?,
        None => SettldConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());
    config.validate().context("validating config")?;

    settld_telemetry::init_tracing(config.log_level.as_deref().unwrap_or("info"));

    let store: Arc<dyn Store> = match config.store.driver {
        StoreDriver::Memory => Arc::new(MemoryStore::new()),
        StoreDriver::Sqlite => {
            let path = config
                .store
                .path
                .as_deref()
                .context("store.path required for sqlite")?;
            Arc::new(SqliteStore::open(path).map_err(|e| anyhow::anyhow!("{e}"))?)
        }
    };

    let config = Arc::new(config);
    spawn_delivery_worker(store.clone(), config.clone());

    let state = Arc::new(AppState {
        store,
        config: config.clone(),
        metrics: MetricsCollector::new(),
        started_at: Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind(&config.http.bind)
        .await
        .with_context(|| format!("binding {}", config.http.bind))?;
    info!(bind = %config.http.bind, "settld daemon listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn spawn_delivery_worker(store: Arc<dyn Store>, config: Arc<SettldConfig>) {
    if config.tenants.is_empty() {
        warn!("no tenants configured; delivery worker idle");
        return;
    }
    let destinations: BTreeMap<String, Destination> = config
        .destinations
        .iter()
        .map(|(name, dest)| {
            (
                name.clone(),
                Destination {
                    url: dest.url.clone(),
                    secret: dest.secret.clone(),
                },
            )
        })
        .collect();
    let policy = RetryPolicy {
        base_delay_ms: config.worker.base_delay_ms,
        cap_delay_ms: config.worker.cap_delay_ms,
        jitter_band_ms: config.worker.jitter_band_ms,
        max_attempts: config.worker.max_attempts,
        lease_secs: config.worker.lease_secs,
        delivery_timeout_secs: config.worker.delivery_timeout_secs,
    };
    let worker = DeliveryWorker::new(store, destinations, policy);
    let batch = config.worker.batch;
    let tenants = config.tenants.clone();

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tick.tick().await;
            for tenant in &tenants {
                if let Err(e) = worker.run_once(tenant, batch).await {
                    warn!(%tenant, error = %e, "delivery pass failed");
                }
            }
        }
    });
}
