//! errwatch Storage - Exception stores and their refresh discipline
//!
//! Layers, leaves first:
//! - [`connection`]: deadline-bounded, read-uncommitted connection opening
//! - [`executor`]: one scoped connection per read or mutation
//! - [`cache`]: TTL-bound values with single-flight refresh
//! - [`store`]: cached summaries, lookups, search and soft-delete
//!
//! Backends implement [`Connector`]: [`postgres`] for real databases and
//! [`memory`] for tests and local development.

pub mod cache;
pub mod connection;
pub mod event;
pub mod executor;
pub mod factory;
pub mod memory;
pub mod ops;
pub mod poller;
pub mod postgres;
pub mod store;
pub mod summary;

pub use cache::{CacheEntry, CacheRead, Fetch, RefreshFailure, RefreshOutcome, Refreshable};
pub use connection::{ConnectTarget, Connection, ConnectionState, Connector, ResilientConnection};
pub use event::{EventSink, MemorySink, StoreEvent, TracingSink};
pub use executor::QueryExecutor;
pub use factory::{build_connector, build_stores, StoreConnection, StoreConnector};
pub use memory::{MemoryConnection, MemoryConnector, MemoryDatabase, MemoryStats};
pub use ops::{FromRows, ReadOp, ReadRows, WriteOp};
pub use poller::{poll_entry, spawn_store_pollers, PollerMetrics, PollerSnapshot};
pub use postgres::{PgConnection, PgConnector};
pub use store::{Store, APPLICATIONS_ENTRY, ERROR_SUMMARY_ENTRY};
