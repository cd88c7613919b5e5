//! Error types for errwatch operations

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A native driver error rendered into a backend-neutral form.
///
/// Keeps the driver's message and, when the driver reports one, its
/// error code (SQLSTATE for Postgres).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    message: String,
    code: Option<String>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DriverError {}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or ERRWATCH_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid connection string for store {store}: {reason}")]
    InvalidConnectionString { store: String, reason: String },
}

/// Errors raised by the connection, query and mutation layers of a store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error(
        "Timeout expired connecting to {database} on {host} in the allotted {budget_ms} ms \
         (elapsed {elapsed_ms} ms)"
    )]
    ConnectTimeout {
        host: String,
        database: String,
        budget_ms: u64,
        elapsed_ms: u64,
    },

    #[error("Error opening connection to {database} at {host}: {source}")]
    ConnectFailure {
        host: String,
        database: String,
        #[source]
        source: DriverError,
    },

    #[error("Query {label} failed: {source}")]
    QueryFailure {
        label: String,
        #[source]
        source: DriverError,
    },

    #[error("Mutation {label} failed: {source}")]
    MutationFailure {
        label: String,
        #[source]
        source: DriverError,
    },

    #[error("Stored snapshot for error {guid} is unusable: {reason}")]
    InvalidSnapshot { guid: Uuid, reason: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl StoreError {
    /// True for failures that happened before a connection was available.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::ConnectFailure { .. }
        )
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_connect_timeout_carries_target_and_budget() {
        let err = StoreError::ConnectTimeout {
            host: "db1.internal".to_string(),
            database: "exceptions".to_string(),
            budget_ms: 2000,
            elapsed_ms: 2003,
        };
        let msg = err.to_string();
        assert!(msg.contains("db1.internal"));
        assert!(msg.contains("exceptions"));
        assert!(msg.contains("2000 ms"));
        assert!(err.is_connect_error());
    }

    #[test]
    fn test_connect_failure_wraps_driver_error() {
        let err = StoreError::ConnectFailure {
            host: "db1".to_string(),
            database: "exceptions".to_string(),
            source: DriverError::new("password authentication failed").with_code("28P01"),
        };
        let msg = err.to_string();
        assert!(msg.contains("Error opening connection to exceptions at db1"));
        assert!(msg.contains("28P01"));

        let source = err.source().map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("password authentication failed (code 28P01)")
        );
    }

    #[test]
    fn test_query_failure_is_not_connect_error() {
        let err = StoreError::QueryFailure {
            label: "Applications".to_string(),
            source: DriverError::new("canceling statement due to statement timeout"),
        };
        assert!(!err.is_connect_error());
        assert!(err.to_string().contains("Applications"));
    }

    #[test]
    fn test_config_error_converts_into_store_error() {
        let err: StoreError = ConfigError::InvalidValue {
            field: "stores".to_string(),
            reason: "at least one store is required".to_string(),
        }
        .into();
        assert!(matches!(err, StoreError::Config(_)));
        assert!(err.to_string().contains("at least one store"));
    }
}
