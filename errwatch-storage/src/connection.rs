//! Connection acquisition with an application-level deadline.
//!
//! Driver connect timeouts only start counting once the driver believes it
//! is connecting. When the remote NIC silently drops traffic that point is
//! never reached, so the open is raced against our own timer. Losing the
//! race drops the in-flight open, which closes whatever socket it had.
//!
//! Every connection handed out has had its session isolation relaxed to
//! read uncommitted: monitoring reads must never queue behind writers.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use errwatch_core::{DriverError, StoreError, StoreResult};

use crate::ops::{ReadOp, ReadRows, WriteOp};

/// Host and database a connector points at, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub database: String,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.database, self.host)
    }
}

/// A single driver-level session.
#[async_trait]
pub trait Connection: Send {
    async fn set_read_uncommitted(&mut self) -> Result<(), DriverError>;

    async fn query(
        &mut self,
        op: &ReadOp,
        timeout: Option<Duration>,
    ) -> Result<ReadRows, DriverError>;

    async fn execute(&mut self, op: &WriteOp, timeout: Option<Duration>)
        -> Result<u64, DriverError>;

    async fn close(self);
}

/// Opens driver sessions against one configured target.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection + 'static;

    fn target(&self) -> ConnectTarget;

    /// Open a session using the driver's own blocking behaviour.
    async fn connect(&self) -> Result<Self::Connection, DriverError>;
}

/// Lifecycle of one acquisition.
///
/// `Idle -> Connecting -> {Open, TimedOut, Failed}`, and `Open -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    TimedOut,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Failed | Self::Closed)
    }
}

/// A read-uncommitted connection owned by exactly one caller.
pub struct ResilientConnection<C: Connection> {
    inner: Option<C>,
    state: ConnectionState,
    target: ConnectTarget,
}

impl<C: Connection> fmt::Debug for ResilientConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientConnection")
            .field("state", &self.state)
            .field("target", &self.target)
            .finish()
    }
}

impl<C: Connection> ResilientConnection<C> {
    /// Open a connection, optionally bounded by `deadline`.
    ///
    /// A zero deadline is treated as no deadline. On expiry the open is
    /// cancelled and [`StoreError::ConnectTimeout`] is returned; a driver
    /// error before expiry becomes [`StoreError::ConnectFailure`].
    pub async fn open<K>(connector: &K, deadline: Option<Duration>) -> StoreResult<Self>
    where
        K: Connector<Connection = C>,
    {
        let target = connector.target();
        let started = Instant::now();
        let state = transition(&target, ConnectionState::Idle, ConnectionState::Connecting);
        let attempt = open_read_uncommitted(connector);

        let result = match deadline.filter(|d| !d.is_zero()) {
            None => attempt.await,
            Some(budget) => match tokio::time::timeout(budget, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    // The attempt future is gone: any half-open socket with it.
                    transition(&target, state, ConnectionState::TimedOut);
                    let elapsed = started.elapsed();
                    tracing::warn!(
                        host = %target.host,
                        database = %target.database,
                        budget_ms = budget.as_millis() as u64,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Connection attempt timed out"
                    );
                    return Err(StoreError::ConnectTimeout {
                        host: target.host,
                        database: target.database,
                        budget_ms: budget.as_millis() as u64,
                        elapsed_ms: elapsed.as_millis() as u64,
                    });
                }
            },
        };

        match result {
            Ok(conn) => {
                let state = transition(&target, state, ConnectionState::Open);
                Ok(Self {
                    inner: Some(conn),
                    state,
                    target,
                })
            }
            Err(source) => {
                transition(&target, state, ConnectionState::Failed);
                Err(StoreError::ConnectFailure {
                    host: target.host,
                    database: target.database,
                    source,
                })
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn target(&self) -> &ConnectTarget {
        &self.target
    }

    pub async fn query(
        &mut self,
        op: &ReadOp,
        timeout: Option<Duration>,
    ) -> Result<ReadRows, DriverError> {
        self.session()?.query(op, timeout).await
    }

    pub async fn execute(
        &mut self,
        op: &WriteOp,
        timeout: Option<Duration>,
    ) -> Result<u64, DriverError> {
        self.session()?.execute(op, timeout).await
    }

    /// Close the session. Dropping the connection without calling this
    /// still releases the driver handle.
    pub async fn close(mut self) {
        if let Some(conn) = self.inner.take() {
            conn.close().await;
        }
        self.state = transition(&self.target, self.state, ConnectionState::Closed);
    }

    fn session(&mut self) -> Result<&mut C, DriverError> {
        self.inner
            .as_mut()
            .ok_or_else(|| DriverError::new("connection is closed"))
    }
}

/// Connect, then relax isolation. A session that cannot be relaxed is
/// closed rather than handed out.
async fn open_read_uncommitted<K: Connector>(connector: &K) -> Result<K::Connection, DriverError> {
    let mut conn = connector.connect().await?;
    if let Err(e) = conn.set_read_uncommitted().await {
        conn.close().await;
        return Err(e);
    }
    Ok(conn)
}

fn transition(
    target: &ConnectTarget,
    from: ConnectionState,
    to: ConnectionState,
) -> ConnectionState {
    tracing::trace!(
        host = %target.host,
        database = %target.database,
        ?from,
        ?to,
        "Connection state change"
    );
    to
}
