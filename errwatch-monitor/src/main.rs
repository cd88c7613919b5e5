//! errwatch monitor
//!
//! Loads the exception store settings, keeps every store's cached views
//! fresh on their poll intervals, and logs a per-store summary until Ctrl-C.

mod logging;

use std::sync::Arc;
use std::time::Duration;

use errwatch_core::{ConfigError, ExceptionsSettings};
use errwatch_storage::{build_stores, spawn_store_pollers, Store, StoreConnector, TracingSink};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::logging::{init_logging, LogFormat};

const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

#[tokio::main]
async fn main() -> Result<(), MonitorError> {
    init_logging(LogFormat::from_env()).map_err(MonitorError::Logging)?;

    let settings = ExceptionsSettings::load()?;
    let stores = build_stores(&settings, Arc::new(TracingSink))?;
    tracing::info!(
        stores = stores.len(),
        recent_seconds = settings.recent_seconds,
        "Starting errwatch monitor"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles: Vec<_> = stores
        .iter()
        .flat_map(|store| spawn_store_pollers(store, shutdown_rx.clone()))
        .collect();

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    report.tick().await;

    loop {
        tokio::select! {
            _ = report.tick() => {
                for store in &stores {
                    log_store_summary(store);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    signal_shutdown(&shutdown_tx);
    for handle in handles {
        match handle.await {
            Ok(metrics) => {
                let snapshot = metrics.snapshot();
                tracing::debug!(
                    ticks = snapshot.ticks,
                    refreshes = snapshot.refreshes,
                    skips = snapshot.skips,
                    failures = snapshot.failures,
                    "Poller joined"
                );
            }
            Err(e) => tracing::error!(error = %e, "Poller task failed"),
        }
    }

    tracing::info!("errwatch monitor stopped");
    Ok(())
}

/// Tell every poller to stop. Returns false when none was still listening.
fn signal_shutdown(shutdown_tx: &watch::Sender<bool>) -> bool {
    match shutdown_tx.send(true) {
        Ok(()) => true,
        Err(_) => {
            tracing::debug!("Every poller had already stopped");
            false
        }
    }
}

fn log_store_summary(store: &Store<StoreConnector>) {
    let apps = store.applications();
    let total: i64 = apps.iter().map(|a| a.exception_count).sum();
    let recent: i64 = apps.iter().map(|a| a.recent_exception_count).sum();
    let entry = store.applications_entry();

    match entry.last_error() {
        Some(failure) => {
            tracing::warn!(
                store = %store.name(),
                applications = apps.len(),
                total,
                recent,
                last_success = ?entry.last_success(),
                error = %failure.error,
                "Store summary (degraded)"
            );
        }
        None => {
            tracing::info!(
                store = %store.name(),
                applications = apps.len(),
                total,
                recent,
                last_success = ?entry.last_success(),
                "Store summary"
            );
        }
    }
}
