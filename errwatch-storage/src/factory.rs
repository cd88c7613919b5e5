//! Builds stores from settings, whatever their provider.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use errwatch_core::{
    ConfigError, DriverError, ExceptionsSettings, StoreProvider, StoreSettings,
};

use crate::connection::{ConnectTarget, Connection, Connector};
use crate::event::EventSink;
use crate::memory::{MemoryConnection, MemoryConnector, MemoryDatabase};
use crate::ops::{ReadOp, ReadRows, WriteOp};
use crate::postgres::{PgConnection, PgConnector};
use crate::store::Store;

/// Connector for any supported provider.
#[derive(Debug, Clone)]
pub enum StoreConnector {
    Postgres(PgConnector),
    Memory(MemoryConnector),
}

/// Session opened by a [`StoreConnector`].
pub enum StoreConnection {
    Postgres(PgConnection),
    Memory(MemoryConnection),
}

#[async_trait]
impl Connector for StoreConnector {
    type Connection = StoreConnection;

    fn target(&self) -> ConnectTarget {
        match self {
            Self::Postgres(c) => c.target(),
            Self::Memory(c) => c.target(),
        }
    }

    async fn connect(&self) -> Result<StoreConnection, DriverError> {
        match self {
            Self::Postgres(c) => c.connect().await.map(StoreConnection::Postgres),
            Self::Memory(c) => c.connect().await.map(StoreConnection::Memory),
        }
    }
}

#[async_trait]
impl Connection for StoreConnection {
    async fn set_read_uncommitted(&mut self) -> Result<(), DriverError> {
        match self {
            Self::Postgres(c) => c.set_read_uncommitted().await,
            Self::Memory(c) => c.set_read_uncommitted().await,
        }
    }

    async fn query(
        &mut self,
        op: &ReadOp,
        timeout: Option<Duration>,
    ) -> Result<ReadRows, DriverError> {
        match self {
            Self::Postgres(c) => c.query(op, timeout).await,
            Self::Memory(c) => c.query(op, timeout).await,
        }
    }

    async fn execute(
        &mut self,
        op: &WriteOp,
        timeout: Option<Duration>,
    ) -> Result<u64, DriverError> {
        match self {
            Self::Postgres(c) => c.execute(op, timeout).await,
            Self::Memory(c) => c.execute(op, timeout).await,
        }
    }

    async fn close(self) {
        match self {
            Self::Postgres(c) => c.close().await,
            Self::Memory(c) => c.close().await,
        }
    }
}

/// Connector described by one store's settings. Memory stores start empty.
pub fn build_connector(settings: &StoreSettings) -> Result<StoreConnector, ConfigError> {
    match settings.provider {
        StoreProvider::Postgres => {
            PgConnector::from_descriptor(&settings.name, &settings.connection_string)
                .map(StoreConnector::Postgres)
        }
        StoreProvider::Memory => Ok(StoreConnector::Memory(MemoryConnector::new(
            MemoryDatabase::new(),
            ConnectTarget::new("memory", settings.name.clone()),
        ))),
    }
}

/// Every configured store, in configuration order.
pub fn build_stores(
    settings: &ExceptionsSettings,
    sink: Arc<dyn EventSink>,
) -> Result<Vec<Arc<Store<StoreConnector>>>, ConfigError> {
    settings
        .stores
        .iter()
        .map(|store| {
            let connector = build_connector(store)?;
            tracing::debug!(
                store = %store.name,
                address = %connector.target(),
                "Store configured"
            );
            Ok(Arc::new(Store::new(
                store.clone(),
                settings,
                connector,
                Arc::clone(&sink),
            )))
        })
        .collect()
}
