//! errwatch Test Utilities
//!
//! Shared test infrastructure for the errwatch workspace:
//! - Fixtures for error records and snapshots
//! - Proptest generators for error rows

pub use errwatch_core::{Application, ErrorLookup, ErrorRecord, StoreError, StoreResult};

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::collection::SizeRange;
use proptest::prelude::*;
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// FIXTURES
// ============================================================================

/// Fixed reference instant used by generated rows.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// A live, unprotected error with a deterministic GUID derived from `id`.
pub fn error_fixture(
    id: i64,
    application_name: &str,
    message: &str,
    creation_date: DateTime<Utc>,
) -> ErrorRecord {
    ErrorRecord {
        id,
        guid: Uuid::from_u128(id as u128),
        application_name: application_name.to_string(),
        machine_name: "web-01".to_string(),
        creation_date,
        error_type: "System.Exception".to_string(),
        is_protected: false,
        host: Some("example.com".to_string()),
        url: Some(format!("/orders/{id}")),
        http_method: Some("GET".to_string()),
        ip_address: Some("10.0.0.1".to_string()),
        source: Some("Orders".to_string()),
        message: message.to_string(),
        detail: Some(format!("{message}\n   at Orders.Load()")),
        status_code: Some(500),
        error_hash: Some(id as i32),
        duplicate_count: 1,
        deletion_date: None,
        server_variables: Vec::new(),
        query_string: Vec::new(),
        form: Vec::new(),
        cookies: Vec::new(),
        request_headers: Vec::new(),
        custom_data: BTreeMap::new(),
        full_json: None,
    }
}

/// `count` errors for one application, one second apart starting at `start`.
pub fn application_errors(
    first_id: i64,
    application_name: &str,
    count: usize,
    start: DateTime<Utc>,
) -> Vec<ErrorRecord> {
    (0..count as i64)
        .map(|i| {
            error_fixture(
                first_id + i,
                application_name,
                "Object reference not set to an instance of an object.",
                start + Duration::seconds(i),
            )
        })
        .collect()
}

/// JSON snapshot, as the logger writes it, for a record.
pub fn snapshot_json(record: &ErrorRecord) -> String {
    serde_json::json!({
        "GUID": record.guid,
        "ApplicationName": record.application_name,
        "MachineName": record.machine_name,
        "CreationDate": record.creation_date,
        "Type": record.error_type,
        "Host": record.host,
        "Url": record.url,
        "HTTPMethod": record.http_method,
        "IPAddress": record.ip_address,
        "Source": record.source,
        "Message": record.message,
        "Detail": record.detail,
        "StatusCode": record.status_code,
        "ErrorHash": record.error_hash,
        "DuplicateCount": 1,
        "ServerVariables": [{"Name": "HTTP_USER_AGENT", "Value": "probe/1.0"}],
        "QueryString": [{"Name": "page", "Value": "2"}],
        "CustomData": {"Tenant": "acme"},
    })
    .to_string()
}

/// A fixture carrying its own JSON snapshot.
pub fn error_with_snapshot(
    id: i64,
    application_name: &str,
    message: &str,
    creation_date: DateTime<Utc>,
) -> ErrorRecord {
    let mut record = error_fixture(id, application_name, message, creation_date);
    record.full_json = Some(snapshot_json(&record));
    record
}

// ============================================================================
// GENERATORS
// ============================================================================

pub fn arb_application_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("A".to_string()),
        Just("B".to_string()),
        Just("Checkout".to_string()),
        Just("Search.Api".to_string()),
    ]
}

pub fn arb_message() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("The operation has timed out".to_string()),
        Just("Connection reset by peer".to_string()),
        Just("Index was outside the bounds of the array.".to_string()),
    ]
}

/// One error row. Ids and GUIDs are placeholders; see [`arb_error_rows`].
pub fn arb_error_record() -> impl Strategy<Value = ErrorRecord> {
    (
        arb_application_name(),
        arb_message(),
        0i64..100_000,
        any::<bool>(),
        proptest::option::weighted(0.25, 0i64..100_000),
        1i32..50,
    )
        .prop_map(|(app, message, offset, protected, deleted, duplicates)| {
            let mut record = error_fixture(0, &app, &message, base_time() + Duration::seconds(offset));
            record.is_protected = protected;
            record.deletion_date = deleted.map(|d| base_time() + Duration::seconds(d));
            record.duplicate_count = duplicates;
            record
        })
}

/// Rows with unique ids and GUIDs.
pub fn arb_error_rows(size: impl Into<SizeRange>) -> impl Strategy<Value = Vec<ErrorRecord>> {
    proptest::collection::vec(arb_error_record(), size).prop_map(|mut rows| {
        for (i, row) in rows.iter_mut().enumerate() {
            let id = i as i64 + 1;
            row.id = id;
            row.guid = Uuid::from_u128(id as u128);
            row.url = Some(format!("/orders/{id}"));
        }
        rows
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_fixture_round_trips_through_core() {
        let record = error_with_snapshot(9, "A", "boom", base_time());
        let derived = ErrorRecord::from_snapshot(&record).unwrap();
        assert_eq!(derived.guid, record.guid);
        assert_eq!(derived.custom_data.get("Tenant").map(String::as_str), Some("acme"));
    }

    proptest! {
        #[test]
        fn prop_generated_rows_have_unique_guids(rows in arb_error_rows(0..50)) {
            let mut guids: Vec<_> = rows.iter().map(|r| r.guid).collect();
            guids.sort();
            guids.dedup();
            prop_assert_eq!(guids.len(), rows.len());
        }
    }
}
