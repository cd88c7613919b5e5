//! Cached views with single-flight refresh.
//!
//! A [`CacheEntry`] holds the last good value of one fetch. Reads never
//! wait; they return that value together with when it was fetched, so
//! staleness is explicit rather than hidden:
//!
//! ```ignore
//! if let Some(read) = store.error_summary_entry().read() {
//!     if read.is_stale() {
//!         tracing::warn!(age_secs = read.staleness().as_secs(), "Summary is stale");
//!     }
//! }
//! ```

pub mod entry;
pub mod freshness;

pub use entry::{CacheEntry, EntryStats, Fetch, RefreshFailure, RefreshOutcome, Refreshable};
pub use freshness::CacheRead;
