//! errwatch Core - Exception store data types
//!
//! Entities, error taxonomy and settings shared by the storage layer and
//! the monitor process. This crate performs no I/O beyond reading the
//! settings file.

pub mod config;
pub mod entities;
pub mod error;

pub use config::{
    ExceptionsSettings, StoreProvider, StoreSettings, CONFIG_PATH_ENV,
    DEFAULT_PER_APP_SUMMARY_COUNT, DEFAULT_RECENT_SECONDS, MAX_RECENT_SECONDS,
    MIN_SECONDS_BETWEEN_POLLS,
};
pub use entities::{Application, ErrorLookup, ErrorRecord, ErrorSnapshot, NameValuePair};
pub use error::{ConfigError, DriverError, StoreError, StoreResult};

/// Timestamp type used across errwatch.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
