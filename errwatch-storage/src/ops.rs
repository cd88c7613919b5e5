//! Typed read and write operations.
//!
//! Each query shape the store issues has its own parameter struct. Backends
//! match on [`ReadOp`] / [`WriteOp`] exhaustively, so adding a shape forces
//! every backend to handle it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use errwatch_core::{Application, DriverError, ErrorRecord};
use uuid::Uuid;

/// Half-width of the window used by the similar-in-time lookup.
pub const SIMILAR_TIME_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationsParams {
    pub recent_seconds: u64,
}

/// Live errors ranked per application, capped at `max_per_app` each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSummaryParams {
    pub max_per_app: usize,
    pub app_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorByGuidParams {
    pub guid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimilarErrorsParams {
    pub application_name: String,
    pub message: String,
    pub max: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorsInWindowParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max: usize,
}

impl ErrorsInWindowParams {
    /// The window centred on `at`.
    pub fn around(at: DateTime<Utc>, max: usize) -> Self {
        let half = ChronoDuration::minutes(SIMILAR_TIME_WINDOW_MINUTES);
        Self {
            start: at - half,
            end: at + half,
            max,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub text: String,
    pub app_name: Option<String>,
    pub max: usize,
    pub include_deleted: bool,
}

impl SearchParams {
    /// `%text%` with LIKE wildcards in the text escaped by backslash.
    pub fn like_pattern(&self) -> String {
        let mut pattern = String::with_capacity(self.text.len() + 2);
        pattern.push('%');
        for c in self.text.chars() {
            if matches!(c, '%' | '_' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('%');
        pattern
    }

    /// Case-insensitive substring test used by in-process evaluation.
    pub fn matches(&self, record: &ErrorRecord) -> bool {
        let needle = self.text.to_lowercase();
        let contains = |field: Option<&str>| {
            field
                .map(|v| v.to_lowercase().contains(&needle))
                .unwrap_or(false)
        };
        contains(Some(&record.message))
            || contains(record.detail.as_deref())
            || contains(record.url.as_deref())
    }
}

/// A read-many operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOp {
    Applications(ApplicationsParams),
    ErrorSummary(ErrorSummaryParams),
    ErrorByGuid(ErrorByGuidParams),
    SimilarErrors(SimilarErrorsParams),
    ErrorsInWindow(ErrorsInWindowParams),
    Search(SearchParams),
}

impl ReadOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Applications(_) => "Applications",
            Self::ErrorSummary(_) => "ErrorSummary",
            Self::ErrorByGuid(_) => "ErrorByGuid",
            Self::SimilarErrors(_) => "SimilarErrors",
            Self::ErrorsInWindow(_) => "ErrorsInWindow",
            Self::Search(_) => "Search",
        }
    }
}

/// A soft-delete or protect mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Soft-delete every live, unprotected error of an application.
    DeleteApplication { app_name: String },
    /// Soft-delete every live, unprotected error sharing application and message.
    DeleteSimilar {
        application_name: String,
        message: String,
    },
    DeleteByGuids { guids: Vec<Uuid> },
    DeleteByGuid { guid: Uuid },
    /// Clear the deletion date and set the protected flag.
    Protect { guid: Uuid },
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeleteApplication { .. } => "DeleteApplication",
            Self::DeleteSimilar { .. } => "DeleteSimilar",
            Self::DeleteByGuids { .. } => "DeleteByGuids",
            Self::DeleteByGuid { .. } => "DeleteByGuid",
            Self::Protect { .. } => "Protect",
        }
    }
}

/// Rows produced by a [`ReadOp`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReadRows {
    Applications(Vec<Application>),
    Errors(Vec<ErrorRecord>),
}

impl ReadRows {
    pub fn len(&self) -> usize {
        match self {
            Self::Applications(rows) => rows.len(),
            Self::Errors(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extraction of a typed row sequence out of [`ReadRows`].
pub trait FromRows: Sized {
    fn from_rows(rows: ReadRows) -> Result<Vec<Self>, DriverError>;
}

impl FromRows for Application {
    fn from_rows(rows: ReadRows) -> Result<Vec<Self>, DriverError> {
        match rows {
            ReadRows::Applications(rows) => Ok(rows),
            ReadRows::Errors(_) => Err(DriverError::new(
                "expected application rows, got error rows",
            )),
        }
    }
}

impl FromRows for ErrorRecord {
    fn from_rows(rows: ReadRows) -> Result<Vec<Self>, DriverError> {
        match rows {
            ReadRows::Errors(rows) => Ok(rows),
            ReadRows::Applications(_) => Err(DriverError::new(
                "expected error rows, got application rows",
            )),
        }
    }
}
