//! Exception store entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::{StoreError, StoreResult};

/// One logged error as stored by the exception logger.
///
/// The column fields mirror the storage row. Collection-valued fields are
/// only populated when the record was re-derived from its JSON snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: i64,
    pub guid: Uuid,
    pub application_name: String,
    pub machine_name: String,
    pub creation_date: DateTime<Utc>,
    pub error_type: String,
    pub is_protected: bool,
    pub host: Option<String>,
    pub url: Option<String>,
    pub http_method: Option<String>,
    pub ip_address: Option<String>,
    pub source: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub status_code: Option<i32>,
    pub error_hash: Option<i32>,
    pub duplicate_count: i32,
    pub deletion_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_variables: Vec<NameValuePair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_string: Vec<NameValuePair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub form: Vec<NameValuePair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<NameValuePair>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_headers: Vec<NameValuePair>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_data: BTreeMap<String, String>,
    /// Full serialized snapshot written by the logger, if stored.
    #[serde(default, skip_serializing)]
    pub full_json: Option<String>,
}

impl ErrorRecord {
    pub fn is_deleted(&self) -> bool {
        self.deletion_date.is_some()
    }

    /// Re-derive this record from its stored JSON snapshot.
    ///
    /// The snapshot supplies the collection fields that are not stored as
    /// columns. Duplicate count, deletion date and application name are
    /// mutated in storage after the snapshot is written, so those always
    /// come from the row.
    pub fn from_snapshot(row: &ErrorRecord) -> StoreResult<ErrorRecord> {
        let json = row
            .full_json
            .as_deref()
            .filter(|j| !j.trim().is_empty())
            .ok_or_else(|| StoreError::InvalidSnapshot {
                guid: row.guid,
                reason: "no snapshot stored".to_string(),
            })?;

        let snapshot: ErrorSnapshot =
            serde_json::from_str(json).map_err(|e| StoreError::InvalidSnapshot {
                guid: row.guid,
                reason: e.to_string(),
            })?;

        Ok(ErrorRecord {
            id: row.id,
            guid: snapshot.guid.unwrap_or(row.guid),
            application_name: row.application_name.clone(),
            machine_name: snapshot
                .machine_name
                .unwrap_or_else(|| row.machine_name.clone()),
            creation_date: snapshot.creation_date.unwrap_or(row.creation_date),
            error_type: snapshot.error_type.unwrap_or_else(|| row.error_type.clone()),
            is_protected: row.is_protected,
            host: snapshot.host.or_else(|| row.host.clone()),
            url: snapshot.url.or_else(|| row.url.clone()),
            http_method: snapshot.http_method.or_else(|| row.http_method.clone()),
            ip_address: snapshot.ip_address.or_else(|| row.ip_address.clone()),
            source: snapshot.source.or_else(|| row.source.clone()),
            message: snapshot.message.unwrap_or_else(|| row.message.clone()),
            detail: snapshot.detail.or_else(|| row.detail.clone()),
            status_code: snapshot.status_code.or(row.status_code),
            error_hash: snapshot.error_hash.or(row.error_hash),
            duplicate_count: row.duplicate_count,
            deletion_date: row.deletion_date,
            server_variables: snapshot.server_variables,
            query_string: snapshot.query_string,
            form: snapshot.form,
            cookies: snapshot.cookies,
            request_headers: snapshot.request_headers,
            custom_data: snapshot.custom_data,
            full_json: row.full_json.clone(),
        })
    }
}

/// A name/value entry from a request collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NameValuePair {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// The JSON snapshot the logger stores next to each row.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ErrorSnapshot {
    #[serde(rename = "GUID")]
    pub guid: Option<Uuid>,
    pub application_name: Option<String>,
    pub machine_name: Option<String>,
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(rename = "Type")]
    pub error_type: Option<String>,
    pub host: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "HTTPMethod")]
    pub http_method: Option<String>,
    #[serde(rename = "IPAddress")]
    pub ip_address: Option<String>,
    pub source: Option<String>,
    pub message: Option<String>,
    pub detail: Option<String>,
    pub status_code: Option<i32>,
    pub error_hash: Option<i32>,
    pub server_variables: Vec<NameValuePair>,
    pub query_string: Vec<NameValuePair>,
    pub form: Vec<NameValuePair>,
    pub cookies: Vec<NameValuePair>,
    pub request_headers: Vec<NameValuePair>,
    pub custom_data: BTreeMap<String, String>,
}

/// Per-application aggregate over live (non-deleted) errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    /// Sum of duplicate counts.
    pub exception_count: i64,
    /// Sum of duplicate counts inside the recent window.
    pub recent_exception_count: i64,
    pub most_recent: Option<DateTime<Utc>>,
    /// Name of the store this aggregate was read from.
    pub store_name: String,
}

/// Outcome of a by-id retrieval.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorLookup {
    Found(Box<ErrorRecord>),
    NotFound,
    Failed(StoreError),
}

impl ErrorLookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    /// Collapse into the record, treating failures as not found.
    pub fn into_found(self) -> Option<ErrorRecord> {
        match self {
            Self::Found(record) => Some(*record),
            Self::NotFound | Self::Failed(_) => None,
        }
    }
}
