//! Ranked, grouped, capped views over error rows.
//!
//! The result of a per-application cap is: partition by application, rank
//! each partition by creation time descending, keep rank <= N, then order
//! the survivors globally by creation time descending. Walking an already
//! globally sorted sequence and counting per application yields exactly
//! that set in exactly that order.

use std::collections::HashMap;

use errwatch_core::ErrorRecord;

/// Sort newest first. Ties fall back to the row id so output is stable.
pub fn sort_recent_first(rows: &mut [ErrorRecord]) {
    rows.sort_by(|a, b| {
        b.creation_date
            .cmp(&a.creation_date)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Keep at most `max_per_app` rows per application.
///
/// `rows` must already be newest first; the relative order is preserved.
pub fn cap_per_application(rows: Vec<ErrorRecord>, max_per_app: usize) -> Vec<ErrorRecord> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    rows.into_iter()
        .filter(|row| {
            let count = seen.entry(row.application_name.clone()).or_insert(0);
            *count += 1;
            *count <= max_per_app
        })
        .collect()
}

/// Sort then cap: the full ranked read.
pub fn rank_per_application(mut rows: Vec<ErrorRecord>, max_per_app: usize) -> Vec<ErrorRecord> {
    sort_recent_first(&mut rows);
    cap_per_application(rows, max_per_app)
}

/// Drop the large fields list views never display.
pub fn into_list_row(mut row: ErrorRecord) -> ErrorRecord {
    row.detail = None;
    row.full_json = None;
    row
}
