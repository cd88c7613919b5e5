//! Background refresh of a store's cache entries.
//!
//! One task per entry, ticking at the entry's TTL. Entries and stores never
//! wait on each other; a slow poll only delays the next tick of its own
//! entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::{RefreshOutcome, Refreshable};
use crate::connection::Connector;
use crate::store::Store;

/// Counters for one entry's poll loop.
#[derive(Debug, Default)]
pub struct PollerMetrics {
    pub ticks: AtomicU64,
    pub refreshes: AtomicU64,
    pub skips: AtomicU64,
    pub failures: AtomicU64,
}

impl PollerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PollerSnapshot {
        PollerSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: RefreshOutcome) {
        let counter = match outcome {
            RefreshOutcome::Updated => &self.refreshes,
            RefreshOutcome::Skipped => &self.skips,
            RefreshOutcome::Failed => &self.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerSnapshot {
    pub ticks: u64,
    pub refreshes: u64,
    pub skips: u64,
    pub failures: u64,
}

/// Refresh `entry` every TTL until shutdown is signalled or the sender is
/// dropped. The first refresh happens immediately.
pub async fn poll_entry(
    store_name: String,
    entry: Arc<dyn Refreshable>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<PollerMetrics> {
    let metrics = Arc::new(PollerMetrics::new());

    let mut ticker = interval(entry.ttl());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        store = %store_name,
        entry = entry.name(),
        interval_secs = entry.ttl().as_secs(),
        "Poller started"
    );

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown_rx) => break,

            _ = ticker.tick() => {
                metrics.ticks.fetch_add(1, Ordering::Relaxed);
                // Dropping an in-flight refresh releases its single-flight flag.
                tokio::select! {
                    outcome = entry.refresh() => metrics.record(outcome),
                    _ = shutdown_requested(&mut shutdown_rx) => {
                        tracing::debug!(
                            store = %store_name,
                            entry = entry.name(),
                            "Refresh abandoned on shutdown"
                        );
                        break;
                    }
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        store = %store_name,
        entry = entry.name(),
        ticks = snapshot.ticks,
        refreshes = snapshot.refreshes,
        skips = snapshot.skips,
        failures = snapshot.failures,
        "Poller stopped"
    );

    metrics
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Spawn one poller per cache entry of `store`.
pub fn spawn_store_pollers<K: Connector + 'static>(
    store: &Store<K>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<Arc<PollerMetrics>>> {
    store
        .data_pollers()
        .into_iter()
        .map(|entry| {
            tokio::spawn(poll_entry(
                store.name().to_string(),
                entry,
                shutdown_rx.clone(),
            ))
        })
        .collect()
}
