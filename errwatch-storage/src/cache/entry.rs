//! A named, TTL-bound cached result with single-flight refresh.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use errwatch_core::{StoreError, StoreResult};

use super::freshness::CacheRead;
use crate::event::{EventSink, StoreEvent};

/// What a call to [`CacheEntry::refresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A fetch ran and replaced the cached value.
    Updated,
    /// Another refresh was in flight; this call did nothing.
    Skipped,
    /// A fetch ran and failed; the cached value is unchanged.
    Failed,
}

/// Produces the value stored in a cache entry.
#[async_trait]
pub trait Fetch<T>: Send + Sync {
    async fn fetch(&self) -> StoreResult<T>;
}

#[async_trait]
impl<T, F, Fut> Fetch<T> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = StoreResult<T>> + Send + 'static,
    T: Send + 'static,
{
    async fn fetch(&self) -> StoreResult<T> {
        (self)().await
    }
}

/// The last failed refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshFailure {
    pub error: StoreError,
    pub at: DateTime<Utc>,
}

/// Counters for one entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryStats {
    pub fetches: u64,
    pub skipped: u64,
    pub failures: u64,
}

struct EntryState<T> {
    current: Option<CacheRead<T>>,
    last_error: Option<RefreshFailure>,
}

/// Cached value of one named fetch operation.
///
/// At most one refresh runs at a time; overlapping calls are dropped, not
/// queued. Only a successful fetch replaces the value. Reads take the
/// state lock just long enough to clone an `Arc`, never across a fetch.
pub struct CacheEntry<T> {
    name: String,
    ttl: Duration,
    fetcher: Box<dyn Fetch<T>>,
    state: RwLock<EntryState<T>>,
    refreshing: AtomicBool,
    sink: Option<Arc<dyn EventSink>>,
    fetches: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

impl<T> std::fmt::Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("refreshing", &self.refreshing.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Send + Sync + 'static> CacheEntry<T> {
    pub fn new(name: impl Into<String>, ttl: Duration, fetcher: impl Fetch<T> + 'static) -> Self {
        Self {
            name: name.into(),
            ttl,
            fetcher: Box::new(fetcher),
            state: RwLock::new(EntryState {
                current: None,
                last_error: None,
            }),
            refreshing: AtomicBool::new(false),
            sink: None,
            fetches: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Last successfully fetched value, if any.
    pub fn data(&self) -> Option<Arc<T>> {
        self.read().map(|read| read.shared())
    }

    /// Last successfully fetched value with its fetch time.
    pub fn read(&self) -> Option<CacheRead<T>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.read().map(|read| read.fetched_at())
    }

    pub fn last_error(&self) -> Option<RefreshFailure> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// True when nothing has been fetched yet or the value is past its TTL.
    pub fn is_stale(&self) -> bool {
        self.read().map(|read| read.is_stale()).unwrap_or(true)
    }

    pub fn stats(&self) -> EntryStats {
        EntryStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Run the fetch unless one is already in flight.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Some(_guard) = RefreshGuard::try_acquire(&self.refreshing) else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            self.emit(RefreshOutcome::Skipped, Duration::ZERO);
            return RefreshOutcome::Skipped;
        };

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = self.fetcher.fetch().await;
        let now = Utc::now();

        let outcome = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            match result {
                Ok(value) => {
                    state.current = Some(CacheRead::new(Arc::new(value), now, self.ttl));
                    state.last_error = None;
                    RefreshOutcome::Updated
                }
                Err(error) => {
                    state.last_error = Some(RefreshFailure { error, at: now });
                    RefreshOutcome::Failed
                }
            }
        };

        if outcome == RefreshOutcome::Failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.emit(outcome, started.elapsed());
        outcome
    }

    fn emit(&self, outcome: RefreshOutcome, elapsed: Duration) {
        if let Some(sink) = &self.sink {
            sink.record(&StoreEvent::Refresh {
                entry: self.name.clone(),
                outcome,
                elapsed,
            });
        }
    }
}

/// Holds the refresh flag; releases it on drop, including when the
/// refreshing future is cancelled.
struct RefreshGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RefreshGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Type-erased view of an entry for schedulers.
#[async_trait]
pub trait Refreshable: Send + Sync {
    fn name(&self) -> &str;
    fn ttl(&self) -> Duration;
    fn is_stale(&self) -> bool;
    fn stats(&self) -> EntryStats;
    async fn refresh(&self) -> RefreshOutcome;
}

#[async_trait]
impl<T: Send + Sync + 'static> Refreshable for CacheEntry<T> {
    fn name(&self) -> &str {
        CacheEntry::name(self)
    }

    fn ttl(&self) -> Duration {
        CacheEntry::ttl(self)
    }

    fn is_stale(&self) -> bool {
        CacheEntry::is_stale(self)
    }

    fn stats(&self) -> EntryStats {
        CacheEntry::stats(self)
    }

    async fn refresh(&self) -> RefreshOutcome {
        CacheEntry::refresh(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemorySink;
    use errwatch_core::DriverError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    fn query_failure() -> StoreError {
        StoreError::QueryFailure {
            label: "Applications".to_string(),
            source: DriverError::new("connection reset"),
        }
    }

    /// Test fetchers are shared with the test body through this handle.
    struct Shared<F>(Arc<F>);

    /// Fetcher that returns scripted results in order.
    struct Scripted {
        results: Mutex<Vec<StoreResult<u32>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut results: Vec<StoreResult<u32>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Fetch<u32> for Shared<Scripted> {
        async fn fetch(&self) -> StoreResult<u32> {
            self.0.calls.fetch_add(1, Ordering::SeqCst);
            self.0.results.lock().unwrap().pop().unwrap_or(Ok(0))
        }
    }

    /// Fetcher that blocks until released.
    struct Gated {
        started: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    impl Gated {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: Notify::new(),
                release: Notify::new(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetch<u32> for Shared<Gated> {
        async fn fetch(&self) -> StoreResult<u32> {
            let n = self.0.calls.fetch_add(1, Ordering::SeqCst) as u32;
            self.0.started.notify_one();
            self.0.release.notified().await;
            Ok(n + 1)
        }
    }

    #[tokio::test]
    async fn test_data_empty_until_first_success() {
        let fetcher = Arc::new(Scripted::new(vec![Ok(7)]));
        let entry = CacheEntry::new("Applications", Duration::from_secs(60), Shared(fetcher));

        assert!(entry.data().is_none());
        assert!(entry.last_success().is_none());
        assert!(entry.is_stale());

        assert_eq!(entry.refresh().await, RefreshOutcome::Updated);
        assert_eq!(entry.data().as_deref(), Some(&7));
        assert!(entry.last_success().is_some());
        assert!(!entry.is_stale());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_good_value() {
        let fetcher = Arc::new(Scripted::new(vec![Ok(1), Err(query_failure()), Ok(3)]));
        let entry = CacheEntry::new("ErrorSummary", Duration::from_secs(60), Shared(fetcher.clone()));

        assert_eq!(entry.refresh().await, RefreshOutcome::Updated);
        let first_success = entry.last_success();

        assert_eq!(entry.refresh().await, RefreshOutcome::Failed);
        assert_eq!(entry.data().as_deref(), Some(&1));
        assert_eq!(entry.last_success(), first_success);
        let failure = entry.last_error().unwrap();
        assert_eq!(failure.error, query_failure());

        assert_eq!(entry.refresh().await, RefreshOutcome::Updated);
        assert_eq!(entry.data().as_deref(), Some(&3));
        assert!(entry.last_error().is_none());

        assert_eq!(
            entry.stats(),
            EntryStats {
                fetches: 3,
                skipped: 0,
                failures: 1
            }
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_before_any_success_leaves_data_empty() {
        let fetcher = Arc::new(Scripted::new(vec![Err(query_failure())]));
        let entry = CacheEntry::new("Applications", Duration::from_secs(60), Shared(fetcher));

        assert_eq!(entry.refresh().await, RefreshOutcome::Failed);
        assert!(entry.data().is_none());
        assert!(entry.last_error().is_some());
    }

    #[tokio::test]
    async fn test_overlapping_refreshes_collapse_into_one_fetch() {
        let gate = Gated::new();
        let entry = Arc::new(CacheEntry::new(
            "ErrorSummary",
            Duration::from_secs(60),
            Shared(gate.clone()),
        ));

        let in_flight = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.refresh().await })
        };
        gate.started.notified().await;
        assert!(entry.is_refreshing());

        let mut overlapping = Vec::new();
        for _ in 0..9 {
            let entry = Arc::clone(&entry);
            overlapping.push(tokio::spawn(async move { entry.refresh().await }));
        }
        for handle in overlapping {
            assert_eq!(handle.await.unwrap(), RefreshOutcome::Skipped);
        }

        gate.release.notify_one();
        assert_eq!(in_flight.await.unwrap(), RefreshOutcome::Updated);

        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert_eq!(entry.data().as_deref(), Some(&1));
        assert_eq!(entry.stats().skipped, 9);
        assert!(!entry.is_refreshing());
    }

    #[tokio::test]
    async fn test_cancelled_refresh_releases_flag() {
        let gate = Gated::new();
        let entry = Arc::new(CacheEntry::new(
            "Applications",
            Duration::from_secs(60),
            Shared(gate.clone()),
        ));

        let in_flight = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.refresh().await })
        };
        gate.started.notified().await;
        in_flight.abort();
        assert!(in_flight.await.unwrap_err().is_cancelled());

        assert!(!entry.is_refreshing());
        assert!(entry.data().is_none());

        gate.release.notify_one();
        assert_eq!(entry.refresh().await, RefreshOutcome::Updated);
        assert_eq!(entry.data().as_deref(), Some(&2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_observe_partial_values() {
        let round = Arc::new(AtomicUsize::new(0));
        let fetcher = {
            let round = Arc::clone(&round);
            move || {
                let n = round.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, StoreError>(vec![n; 256]) }
            }
        };
        let entry = Arc::new(CacheEntry::new("Applications", Duration::from_secs(60), fetcher));

        let writer = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move {
                for _ in 0..200 {
                    entry.refresh().await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let entry = Arc::clone(&entry);
            readers.push(tokio::spawn(async move {
                for _ in 0..500 {
                    if let Some(values) = entry.data() {
                        assert!(values.iter().all(|v| *v == values[0]));
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_refresh_events_reach_sink() {
        let sink = Arc::new(MemorySink::new());
        let fetcher = Arc::new(Scripted::new(vec![Ok(1), Err(query_failure())]));
        let entry = CacheEntry::new("Applications", Duration::from_secs(60), Shared(fetcher))
            .with_sink(sink.clone());

        entry.refresh().await;
        entry.refresh().await;

        let outcomes: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|event| match event {
                StoreEvent::Refresh { outcome, entry, .. } => {
                    assert_eq!(entry, "Applications");
                    Some(outcome)
                }
                _ => None,
            })
            .collect();
        assert_eq!(outcomes, vec![RefreshOutcome::Updated, RefreshOutcome::Failed]);
    }

    #[tokio::test]
    async fn test_debug_reports_name_and_flag() {
        let gate = Gated::new();
        let entry = Arc::new(CacheEntry::new(
            "ErrorSummary",
            Duration::from_secs(60),
            Shared(gate.clone()),
        ));
        assert!(format!("{entry:?}").contains("refreshing: false"));

        let in_flight = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.refresh().await })
        };
        gate.started.notified().await;
        let rendered = format!("{entry:?}");
        assert!(rendered.contains("\"ErrorSummary\""));
        assert!(rendered.contains("refreshing: true"));

        gate.release.notify_one();
        in_flight.await.unwrap();
    }

    #[tokio::test]
    async fn test_refreshable_trait_object() {
        let fetcher = Arc::new(Scripted::new(vec![Ok(5)]));
        let entry: Arc<dyn Refreshable> = Arc::new(CacheEntry::new(
            "Applications",
            Duration::from_secs(30),
            Shared(fetcher),
        ));

        assert_eq!(entry.name(), "Applications");
        assert_eq!(entry.ttl(), Duration::from_secs(30));
        assert!(entry.is_stale());
        assert_eq!(entry.refresh().await, RefreshOutcome::Updated);
        assert!(!entry.is_stale());
        assert_eq!(entry.stats().fetches, 1);
    }
}
