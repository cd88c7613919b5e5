//! In-process exception table.
//!
//! Evaluates every [`ReadOp`] and [`WriteOp`] against a vector of rows with
//! the same semantics as the SQL backend. Faults can be injected at each
//! driver step, and every open session holds a live handle so tests can
//! check that nothing leaks.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use uuid::Uuid;

use errwatch_core::{Application, DriverError, ErrorRecord};

use crate::connection::{ConnectTarget, Connection, Connector};
use crate::ops::{ReadOp, ReadRows, WriteOp};
use crate::summary::{into_list_row, rank_per_application, sort_recent_first};

/// SQLSTATE raised when a statement exceeds its timeout.
pub const STATEMENT_TIMEOUT_CODE: &str = "57014";

/// Injectable failures and delays. All default to off.
#[derive(Debug, Default)]
pub struct Faults {
    connect_delay: Mutex<Option<Duration>>,
    connect_error: Mutex<Option<DriverError>>,
    isolation_error: Mutex<Option<DriverError>>,
    query_error: Mutex<Option<DriverError>>,
    mutation_error: Mutex<Option<DriverError>>,
    query_latency: Mutex<Option<Duration>>,
}

fn get<T: Clone>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn set<T>(slot: &Mutex<Option<T>>, value: Option<T>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

impl Faults {
    /// Delay before a connect attempt resolves.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        set(&self.connect_delay, delay);
    }

    pub fn set_connect_error(&self, error: Option<DriverError>) {
        set(&self.connect_error, error);
    }

    pub fn set_isolation_error(&self, error: Option<DriverError>) {
        set(&self.isolation_error, error);
    }

    pub fn set_query_error(&self, error: Option<DriverError>) {
        set(&self.query_error, error);
    }

    pub fn set_mutation_error(&self, error: Option<DriverError>) {
        set(&self.mutation_error, error);
    }

    /// Time every statement takes. Exceeding the command timeout fails the
    /// statement with [`STATEMENT_TIMEOUT_CODE`].
    pub fn set_query_latency(&self, latency: Option<Duration>) {
        set(&self.query_latency, latency);
    }

    pub fn clear(&self) {
        self.set_connect_delay(None);
        self.set_connect_error(None);
        self.set_isolation_error(None);
        self.set_query_error(None);
        self.set_mutation_error(None);
        self.set_query_latency(None);
    }
}

/// Counters observed by a [`MemoryDatabase`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub connect_attempts: u64,
    pub read_uncommitted_sessions: u64,
    pub queries: u64,
    pub mutations: u64,
    pub closes: u64,
}

#[derive(Debug, Default)]
struct Inner {
    rows: RwLock<Vec<ErrorRecord>>,
    faults: Faults,
    connect_attempts: AtomicU64,
    read_uncommitted_sessions: AtomicU64,
    queries: AtomicU64,
    mutations: AtomicU64,
    closes: AtomicU64,
    live_handles: AtomicUsize,
}

/// Shared in-memory exceptions table.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<ErrorRecord>) -> Self {
        let db = Self::new();
        db.insert_many(rows);
        db
    }

    pub fn insert(&self, row: ErrorRecord) {
        self.write_rows().push(row);
    }

    pub fn insert_many(&self, rows: impl IntoIterator<Item = ErrorRecord>) {
        self.write_rows().extend(rows);
    }

    /// Copy of every row, in insertion order.
    pub fn rows(&self) -> Vec<ErrorRecord> {
        self.read_rows().clone()
    }

    pub fn get(&self, guid: Uuid) -> Option<ErrorRecord> {
        self.read_rows().iter().find(|r| r.guid == guid).cloned()
    }

    pub fn faults(&self) -> &Faults {
        &self.inner.faults
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            connect_attempts: self.inner.connect_attempts.load(Ordering::SeqCst),
            read_uncommitted_sessions: self.inner.read_uncommitted_sessions.load(Ordering::SeqCst),
            queries: self.inner.queries.load(Ordering::SeqCst),
            mutations: self.inner.mutations.load(Ordering::SeqCst),
            closes: self.inner.closes.load(Ordering::SeqCst),
        }
    }

    /// Sessions currently open, including ones still connecting.
    pub fn live_handles(&self) -> usize {
        self.inner.live_handles.load(Ordering::SeqCst)
    }

    fn read_rows(&self) -> std::sync::RwLockReadGuard<'_, Vec<ErrorRecord>> {
        self.inner.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_rows(&self) -> std::sync::RwLockWriteGuard<'_, Vec<ErrorRecord>> {
        self.inner.rows.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts as one open session until dropped.
#[derive(Debug)]
struct LiveHandle {
    inner: Arc<Inner>,
}

impl LiveHandle {
    fn acquire(inner: &Arc<Inner>) -> Self {
        inner.live_handles.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.inner.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    db: MemoryDatabase,
    target: ConnectTarget,
}

impl MemoryConnector {
    pub fn new(db: MemoryDatabase, target: ConnectTarget) -> Self {
        Self { db, target }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn target(&self) -> ConnectTarget {
        self.target.clone()
    }

    async fn connect(&self) -> Result<MemoryConnection, DriverError> {
        self.db.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        // Taken before the delay: a socket exists while the handshake stalls.
        let handle = LiveHandle::acquire(&self.db.inner);

        if let Some(delay) = get(&self.db.inner.faults.connect_delay) {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = get(&self.db.inner.faults.connect_error) {
            return Err(error);
        }

        Ok(MemoryConnection {
            db: self.db.clone(),
            _handle: handle,
        })
    }
}

/// One session against a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
    _handle: LiveHandle,
}

impl MemoryConnection {
    async fn statement_delay(&self, timeout: Option<Duration>) -> Result<(), DriverError> {
        let Some(latency) = get(&self.db.inner.faults.query_latency) else {
            return Ok(());
        };
        match timeout {
            Some(limit) if latency > limit => {
                tokio::time::sleep(limit).await;
                Err(DriverError::new("canceling statement due to statement timeout")
                    .with_code(STATEMENT_TIMEOUT_CODE))
            }
            _ => {
                tokio::time::sleep(latency).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn set_read_uncommitted(&mut self) -> Result<(), DriverError> {
        if let Some(error) = get(&self.db.inner.faults.isolation_error) {
            return Err(error);
        }
        self.db
            .inner
            .read_uncommitted_sessions
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query(
        &mut self,
        op: &ReadOp,
        timeout: Option<Duration>,
    ) -> Result<ReadRows, DriverError> {
        self.db.inner.queries.fetch_add(1, Ordering::SeqCst);
        self.statement_delay(timeout).await?;
        if let Some(error) = get(&self.db.inner.faults.query_error) {
            return Err(error);
        }
        Ok(evaluate_read(&self.db.read_rows(), op))
    }

    async fn execute(
        &mut self,
        op: &WriteOp,
        timeout: Option<Duration>,
    ) -> Result<u64, DriverError> {
        self.db.inner.mutations.fetch_add(1, Ordering::SeqCst);
        self.statement_delay(timeout).await?;
        if let Some(error) = get(&self.db.inner.faults.mutation_error) {
            return Err(error);
        }
        Ok(evaluate_write(&mut self.db.write_rows(), op))
    }

    async fn close(self) {
        self.db.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn newest_first(mut rows: Vec<ErrorRecord>, max: usize) -> Vec<ErrorRecord> {
    sort_recent_first(&mut rows);
    rows.truncate(max);
    rows.into_iter()
        .map(|mut row| {
            row.full_json = None;
            row
        })
        .collect()
}

/// Start of the recent window. `None` when the window reaches past the
/// representable range, in which case every row is recent.
fn recent_cutoff(now: DateTime<Utc>, recent_seconds: u64) -> Option<DateTime<Utc>> {
    i64::try_from(recent_seconds)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|window| now.checked_sub_signed(window))
}

fn evaluate_read(rows: &[ErrorRecord], op: &ReadOp) -> ReadRows {
    match op {
        ReadOp::Applications(params) => {
            let recent_since = recent_cutoff(Utc::now(), params.recent_seconds);
            let mut apps: BTreeMap<&str, Application> = BTreeMap::new();
            for row in rows.iter().filter(|r| !r.is_deleted()) {
                let app = apps
                    .entry(row.application_name.as_str())
                    .or_insert_with(|| Application {
                        name: row.application_name.clone(),
                        exception_count: 0,
                        recent_exception_count: 0,
                        most_recent: None,
                        store_name: String::new(),
                    });
                let count = i64::from(row.duplicate_count);
                app.exception_count += count;
                if recent_since.map_or(true, |since| row.creation_date > since) {
                    app.recent_exception_count += count;
                }
                app.most_recent = app.most_recent.max(Some(row.creation_date));
            }
            ReadRows::Applications(apps.into_values().collect())
        }
        ReadOp::ErrorSummary(params) => {
            let live = rows
                .iter()
                .filter(|r| !r.is_deleted())
                .filter(|r| {
                    params
                        .app_name
                        .as_deref()
                        .map_or(true, |app| r.application_name == app)
                })
                .cloned()
                .collect();
            ReadRows::Errors(
                rank_per_application(live, params.max_per_app)
                    .into_iter()
                    .map(into_list_row)
                    .collect(),
            )
        }
        ReadOp::ErrorByGuid(params) => ReadRows::Errors(
            rows.iter()
                .find(|r| r.guid == params.guid)
                .cloned()
                .into_iter()
                .collect(),
        ),
        ReadOp::SimilarErrors(params) => {
            let matching = rows
                .iter()
                .filter(|r| r.application_name == params.application_name)
                .filter(|r| r.message == params.message)
                .cloned()
                .collect();
            ReadRows::Errors(newest_first(matching, params.max))
        }
        ReadOp::ErrorsInWindow(params) => {
            let matching = rows
                .iter()
                .filter(|r| r.creation_date >= params.start && r.creation_date <= params.end)
                .cloned()
                .collect();
            ReadRows::Errors(newest_first(matching, params.max))
        }
        ReadOp::Search(params) => {
            let matching = rows
                .iter()
                .filter(|r| params.include_deleted || !r.is_deleted())
                .filter(|r| {
                    params
                        .app_name
                        .as_deref()
                        .map_or(true, |app| r.application_name == app)
                })
                .filter(|r| params.matches(r))
                .cloned()
                .collect();
            ReadRows::Errors(newest_first(matching, params.max))
        }
    }
}

fn soft_delete(
    rows: &mut [ErrorRecord],
    now: DateTime<Utc>,
    selected: impl Fn(&ErrorRecord) -> bool,
) -> u64 {
    let mut affected = 0;
    for row in rows
        .iter_mut()
        .filter(|r| !r.is_deleted() && !r.is_protected && selected(r))
    {
        row.deletion_date = Some(now);
        affected += 1;
    }
    affected
}

fn evaluate_write(rows: &mut [ErrorRecord], op: &WriteOp) -> u64 {
    let now = Utc::now();
    match op {
        WriteOp::DeleteApplication { app_name } => {
            soft_delete(rows, now, |r| r.application_name == *app_name)
        }
        WriteOp::DeleteSimilar {
            application_name,
            message,
        } => soft_delete(rows, now, |r| {
            r.application_name == *application_name && r.message == *message
        }),
        WriteOp::DeleteByGuids { guids } => soft_delete(rows, now, |r| guids.contains(&r.guid)),
        WriteOp::DeleteByGuid { guid } => soft_delete(rows, now, |r| r.guid == *guid),
        WriteOp::Protect { guid } => {
            let mut affected = 0;
            for row in rows.iter_mut().filter(|r| r.guid == *guid) {
                row.is_protected = true;
                row.deletion_date = None;
                affected += 1;
            }
            affected
        }
    }
}
