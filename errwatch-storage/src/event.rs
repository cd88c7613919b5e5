//! Structured events emitted by stores, executors and cache entries.
//!
//! The sink is injected at construction time. [`TracingSink`] forwards
//! events to `tracing`; [`MemorySink`] keeps them for inspection.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use errwatch_core::StoreError;

use crate::cache::RefreshOutcome;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A query or mutation finished.
    Step {
        store: String,
        label: String,
        elapsed: Duration,
        /// Rows returned for reads, rows affected for writes.
        rows: u64,
    },
    /// A query or mutation failed. Reads recover after reporting this.
    Failure {
        store: String,
        label: String,
        error: StoreError,
    },
    /// A cache entry refresh attempt finished.
    Refresh {
        entry: String,
        outcome: RefreshOutcome,
        elapsed: Duration,
    },
}

/// Receiver for store events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &StoreEvent);
}

/// Sink that writes every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Step {
                store,
                label,
                elapsed,
                rows,
            } => {
                tracing::debug!(
                    store = %store,
                    label = %label,
                    elapsed_ms = elapsed.as_millis() as u64,
                    rows,
                    "Store step completed"
                );
            }
            StoreEvent::Failure {
                store,
                label,
                error,
            } => {
                tracing::error!(store = %store, label = %label, error = %error, "Store step failed");
            }
            StoreEvent::Refresh {
                entry,
                outcome,
                elapsed,
            } => match outcome {
                RefreshOutcome::Updated => tracing::debug!(
                    entry = %entry,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Cache entry refreshed"
                ),
                RefreshOutcome::Skipped => {
                    tracing::trace!(entry = %entry, "Refresh already in flight, skipped")
                }
                RefreshOutcome::Failed => tracing::warn!(
                    entry = %entry,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Cache entry refresh failed, keeping last good value"
                ),
            },
        }
    }
}

/// Sink that retains events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StoreEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Errors from every recorded failure, in order.
    pub fn failures(&self) -> Vec<StoreError> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                StoreEvent::Failure { error, .. } => Some(error),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &StoreEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
