//! Scoped, timed execution of one operation over one connection.
//!
//! Every call opens its own connection, runs a single statement and closes
//! the connection again, whatever the outcome. Reads come in two flavours:
//! [`QueryExecutor::fetch_many`] degrades to an empty result, while
//! [`QueryExecutor::try_fetch_many`] hands the error back to callers that
//! need to tell "no rows" from "no store" (cache refresh, lookups).
//! Mutations always propagate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use errwatch_core::{StoreError, StoreResult};

use crate::connection::{Connector, ResilientConnection};
use crate::event::{EventSink, StoreEvent};
use crate::ops::{FromRows, ReadOp, WriteOp};

pub struct QueryExecutor<K: Connector> {
    connector: K,
    store_name: String,
    timeout: Option<Duration>,
    sink: Arc<dyn EventSink>,
}

impl<K: Connector> std::fmt::Debug for QueryExecutor<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("store_name", &self.store_name)
            .field("target", &self.connector.target())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<K: Connector> QueryExecutor<K> {
    /// `timeout` bounds both the connect and each statement; `None` leaves
    /// both to the driver.
    pub fn new(
        store_name: impl Into<String>,
        connector: K,
        timeout: Option<Duration>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            connector,
            store_name: store_name.into(),
            timeout: timeout.filter(|t| !t.is_zero()),
            sink,
        }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Run a read. Any failure is reported to the sink and yields no rows.
    pub async fn fetch_many<T: FromRows>(&self, label: &str, op: &ReadOp) -> Vec<T> {
        self.try_fetch_many(label, op).await.unwrap_or_default()
    }

    /// Run a read, reporting and returning any failure.
    pub async fn try_fetch_many<T: FromRows>(
        &self,
        label: &str,
        op: &ReadOp,
    ) -> StoreResult<Vec<T>> {
        let started = Instant::now();
        let result = self.read(label, op).await;
        match &result {
            Ok(rows) => self.step(label, started, rows.len() as u64),
            Err(error) => self.failure(label, error),
        }
        result
    }

    /// Run a mutation and return the affected-row count.
    pub async fn execute(&self, label: &str, op: &WriteOp) -> StoreResult<u64> {
        let started = Instant::now();
        let result = self.write(label, op).await;
        match &result {
            Ok(affected) => self.step(label, started, *affected),
            Err(error) => self.failure(label, error),
        }
        result
    }

    async fn read<T: FromRows>(&self, label: &str, op: &ReadOp) -> StoreResult<Vec<T>> {
        let mut conn = ResilientConnection::open(&self.connector, self.timeout).await?;
        let result = conn.query(op, self.timeout).await;
        conn.close().await;

        let query_failure = |source| StoreError::QueryFailure {
            label: label.to_string(),
            source,
        };
        let rows = result.map_err(query_failure)?;
        T::from_rows(rows).map_err(query_failure)
    }

    async fn write(&self, label: &str, op: &WriteOp) -> StoreResult<u64> {
        let mut conn = ResilientConnection::open(&self.connector, self.timeout).await?;
        let result = conn.execute(op, self.timeout).await;
        conn.close().await;

        result.map_err(|source| StoreError::MutationFailure {
            label: label.to_string(),
            source,
        })
    }

    fn step(&self, label: &str, started: Instant, rows: u64) {
        self.sink.record(&StoreEvent::Step {
            store: self.store_name.clone(),
            label: label.to_string(),
            elapsed: started.elapsed(),
            rows,
        });
    }

    fn failure(&self, label: &str, error: &StoreError) {
        self.sink.record(&StoreEvent::Failure {
            store: self.store_name.clone(),
            label: label.to_string(),
            error: error.clone(),
        });
    }
}
