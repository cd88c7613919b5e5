//! One configured exceptions database and its cached views.

use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use errwatch_core::{
    Application, ErrorLookup, ErrorRecord, ExceptionsSettings, StoreError, StoreResult,
    StoreSettings,
};

use crate::cache::{CacheEntry, RefreshOutcome, Refreshable};
use crate::connection::Connector;
use crate::event::{EventSink, StoreEvent};
use crate::executor::QueryExecutor;
use crate::ops::{
    ApplicationsParams, ErrorByGuidParams, ErrorSummaryParams, ErrorsInWindowParams, ReadOp,
    SearchParams, SimilarErrorsParams, WriteOp,
};
use crate::summary::cap_per_application;

pub const APPLICATIONS_ENTRY: &str = "Applications";
pub const ERROR_SUMMARY_ENTRY: &str = "ErrorSummary";

/// A store's cache entries, refreshed by the poll scheduler.
pub type DataPollers = Vec<Arc<dyn Refreshable>>;

/// An exceptions database: cached summaries plus direct queries and
/// mutations.
///
/// Reads never fail; an unreachable store reads as empty. Mutations return
/// the affected-row count or the error.
pub struct Store<K: Connector + 'static> {
    settings: StoreSettings,
    executor: Arc<QueryExecutor<K>>,
    per_app_summary_count: usize,
    applications: Arc<CacheEntry<Vec<Application>>>,
    error_summary: Arc<CacheEntry<Vec<ErrorRecord>>>,
}

impl<K: Connector + 'static> fmt::Display for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store: {}", self.settings.name)
    }
}

impl<K: Connector + 'static> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.settings.name)
            .field("executor", &self.executor)
            .field("per_app_summary_count", &self.per_app_summary_count)
            .finish()
    }
}

impl<K: Connector + 'static> Store<K> {
    /// Build a store and its cache entries. Nothing is fetched until the
    /// first refresh.
    pub fn new(
        settings: StoreSettings,
        shared: &ExceptionsSettings,
        connector: K,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let executor = Arc::new(QueryExecutor::new(
            settings.name.clone(),
            connector,
            settings.query_timeout(),
            Arc::clone(&sink),
        ));
        let ttl = settings.poll_interval();

        let applications = {
            let executor = Arc::clone(&executor);
            let store_name = settings.name.clone();
            let op = ReadOp::Applications(ApplicationsParams {
                recent_seconds: shared.recent_seconds,
            });
            CacheEntry::new(APPLICATIONS_ENTRY, ttl, move || {
                let executor = Arc::clone(&executor);
                let store_name = store_name.clone();
                let op = op.clone();
                async move {
                    let mut apps: Vec<Application> =
                        executor.try_fetch_many(APPLICATIONS_ENTRY, &op).await?;
                    for app in &mut apps {
                        app.store_name = store_name.clone();
                    }
                    Ok::<_, StoreError>(apps)
                }
            })
            .with_sink(Arc::clone(&sink))
        };

        let error_summary = {
            let executor = Arc::clone(&executor);
            let op = ReadOp::ErrorSummary(ErrorSummaryParams {
                max_per_app: shared.per_app_summary_count,
                app_name: None,
            });
            CacheEntry::new(ERROR_SUMMARY_ENTRY, ttl, move || {
                let executor = Arc::clone(&executor);
                let op = op.clone();
                async move {
                    executor
                        .try_fetch_many::<ErrorRecord>(ERROR_SUMMARY_ENTRY, &op)
                        .await
                }
            })
            .with_sink(sink)
        };

        Self {
            settings,
            executor,
            per_app_summary_count: shared.per_app_summary_count,
            applications: Arc::new(applications),
            error_summary: Arc::new(error_summary),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn description(&self) -> &str {
        self.settings.description()
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn executor(&self) -> &QueryExecutor<K> {
        &self.executor
    }

    pub fn applications_entry(&self) -> &CacheEntry<Vec<Application>> {
        &self.applications
    }

    pub fn error_summary_entry(&self) -> &CacheEntry<Vec<ErrorRecord>> {
        &self.error_summary
    }

    /// The entries a scheduler should poll, in refresh order.
    pub fn data_pollers(&self) -> DataPollers {
        vec![
            Arc::clone(&self.applications) as Arc<dyn Refreshable>,
            Arc::clone(&self.error_summary) as Arc<dyn Refreshable>,
        ]
    }

    /// Refresh every entry now. Entries already refreshing are skipped.
    pub async fn refresh_all(&self) -> Vec<(&'static str, RefreshOutcome)> {
        let (applications, summary) =
            tokio::join!(self.applications.refresh(), self.error_summary.refresh());
        vec![
            (APPLICATIONS_ENTRY, applications),
            (ERROR_SUMMARY_ENTRY, summary),
        ]
    }

    // ------------------------------------------------------------------
    // Cached reads
    // ------------------------------------------------------------------

    /// Per-application aggregates from the last successful poll.
    pub fn applications(&self) -> Arc<Vec<Application>> {
        self.applications.data().unwrap_or_default()
    }

    /// Most recent errors per application from the last successful poll.
    ///
    /// With `app_name` set, that application's first `max_per_app` rows.
    /// Otherwise every application capped at `max_per_app`, newest first.
    pub fn get_error_summary(&self, max_per_app: usize, app_name: Option<&str>) -> Vec<ErrorRecord> {
        let Some(errors) = self.error_summary.data() else {
            return Vec::new();
        };
        match app_name {
            Some(app) => errors
                .iter()
                .filter(|e| e.application_name == app)
                .take(max_per_app)
                .cloned()
                .collect(),
            None if max_per_app == self.per_app_summary_count => errors.as_ref().clone(),
            None => cap_per_application(errors.as_ref().clone(), max_per_app),
        }
    }

    // ------------------------------------------------------------------
    // Direct reads
    // ------------------------------------------------------------------

    /// Live errors ranked per application, straight from the database.
    /// Detail is not populated.
    pub async fn get_all_errors(&self, max_per_app: usize, app_name: Option<&str>) -> Vec<ErrorRecord> {
        let label = format!("GetAllErrors (app: {})", app_name.unwrap_or("All"));
        let op = ReadOp::ErrorSummary(ErrorSummaryParams {
            max_per_app,
            app_name: app_name.map(str::to_string),
        });
        self.executor.fetch_many(&label, &op).await
    }

    /// One error by GUID, re-derived from its stored snapshot.
    pub async fn get_error(&self, guid: Uuid) -> ErrorLookup {
        let label = format!("GetError (guid: {guid})");
        let op = ReadOp::ErrorByGuid(ErrorByGuidParams { guid });
        let row = match self.executor.try_fetch_many::<ErrorRecord>(&label, &op).await {
            Ok(rows) => rows.into_iter().next(),
            Err(error) => return ErrorLookup::Failed(error),
        };
        let Some(row) = row else {
            return ErrorLookup::NotFound;
        };

        match ErrorRecord::from_snapshot(&row) {
            Ok(full) => ErrorLookup::Found(Box::new(full)),
            Err(error) => {
                self.executor.sink().record(&StoreEvent::Failure {
                    store: self.name().to_string(),
                    label,
                    error,
                });
                ErrorLookup::Found(Box::new(row))
            }
        }
    }

    /// Errors with the same application and message, newest first.
    pub async fn get_similar_errors(&self, error: &ErrorRecord, max: usize) -> Vec<ErrorRecord> {
        let op = ReadOp::SimilarErrors(SimilarErrorsParams {
            application_name: error.application_name.clone(),
            message: error.message.clone(),
            max,
        });
        self.executor.fetch_many("GetSimilarErrors", &op).await
    }

    /// Errors logged within five minutes either side of `error`.
    pub async fn get_similar_errors_in_time(&self, error: &ErrorRecord, max: usize) -> Vec<ErrorRecord> {
        let op = ReadOp::ErrorsInWindow(ErrorsInWindowParams::around(error.creation_date, max));
        self.executor.fetch_many("GetSimilarErrorsInTime", &op).await
    }

    /// Substring search over message, detail and URL.
    pub async fn find_errors(
        &self,
        search_text: &str,
        app_name: Option<&str>,
        max: usize,
        include_deleted: bool,
    ) -> Vec<ErrorRecord> {
        let op = ReadOp::Search(SearchParams {
            text: search_text.to_string(),
            app_name: app_name.map(str::to_string),
            max,
            include_deleted,
        });
        self.executor.fetch_many("FindErrors", &op).await
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub async fn delete_all_errors(&self, app_name: &str) -> StoreResult<u64> {
        let label = format!("DeleteAllErrors (app: {app_name})");
        let op = WriteOp::DeleteApplication {
            app_name: app_name.to_string(),
        };
        self.executor.execute(&label, &op).await
    }

    pub async fn delete_similar_errors(&self, error: &ErrorRecord) -> StoreResult<u64> {
        let label = format!(
            "DeleteSimilarErrors ('{}') (app: {})",
            error.guid, error.application_name
        );
        let op = WriteOp::DeleteSimilar {
            application_name: error.application_name.clone(),
            message: error.message.clone(),
        };
        self.executor.execute(&label, &op).await
    }

    /// Soft-delete a batch. An empty batch touches nothing and never
    /// connects.
    pub async fn delete_errors(&self, guids: &[Uuid]) -> StoreResult<u64> {
        if guids.is_empty() {
            return Ok(0);
        }
        let label = format!("DeleteErrors ({} Guids)", guids.len());
        let op = WriteOp::DeleteByGuids {
            guids: guids.to_vec(),
        };
        self.executor.execute(&label, &op).await
    }

    pub async fn delete_error(&self, guid: Uuid) -> StoreResult<bool> {
        let label = format!("DeleteError (guid: {guid})");
        let affected = self
            .executor
            .execute(&label, &WriteOp::DeleteByGuid { guid })
            .await?;
        Ok(affected > 0)
    }

    /// Protect an error from soft-delete, restoring it if deleted.
    pub async fn protect_error(&self, guid: Uuid) -> StoreResult<bool> {
        let label = format!("ProtectError (guid: {guid})");
        let affected = self
            .executor
            .execute(&label, &WriteOp::Protect { guid })
            .await?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectTarget;
    use crate::event::MemorySink;
    use crate::memory::{MemoryConnector, MemoryDatabase};
    use chrono::{Duration as ChronoDuration, Utc};
    use errwatch_core::{DriverError, StoreError, StoreProvider};
    use errwatch_test_utils::{application_errors, base_time, error_fixture, error_with_snapshot};
    use std::collections::HashMap;

    fn shared() -> ExceptionsSettings {
        ExceptionsSettings {
            recent_seconds: 600,
            per_app_summary_count: 1000,
            stores: Vec::new(),
        }
    }

    fn store_settings() -> StoreSettings {
        StoreSettings {
            name: "primary".to_string(),
            description: Some("Primary exceptions".to_string()),
            connection_string: String::new(),
            provider: StoreProvider::Memory,
            poll_interval_seconds: 5,
            query_timeout_ms: Some(2000),
        }
    }

    fn store(db: &MemoryDatabase) -> (Store<MemoryConnector>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let connector = MemoryConnector::new(db.clone(), ConnectTarget::new("memory", "primary"));
        (
            Store::new(store_settings(), &shared(), connector, sink.clone()),
            sink,
        )
    }

    fn is_recent_first(rows: &[ErrorRecord]) -> bool {
        rows.windows(2)
            .all(|w| w[0].creation_date >= w[1].creation_date)
    }

    #[test]
    fn test_display_and_identity() {
        let (store, _) = store(&MemoryDatabase::new());
        assert_eq!(store.to_string(), "Store: primary");
        assert_eq!(store.description(), "Primary exceptions");
        assert_eq!(store.data_pollers().len(), 2);
        assert_eq!(
            store.applications_entry().ttl(),
            std::time::Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn test_cached_reads_empty_before_first_refresh() {
        let db = MemoryDatabase::with_rows(application_errors(1, "A", 5, base_time()));
        let (store, _) = store(&db);

        assert!(store.applications().is_empty());
        assert!(store.get_error_summary(1000, None).is_empty());
        assert_eq!(db.stats().connect_attempts, 0);
    }

    #[tokio::test]
    async fn test_applications_carry_store_name() {
        let now = Utc::now();
        let db = MemoryDatabase::with_rows(vec![
            error_fixture(1, "A", "boom", now - ChronoDuration::seconds(10)),
            error_fixture(2, "B", "boom", now - ChronoDuration::hours(3)),
        ]);
        let (store, _) = store(&db);

        let outcomes = store.refresh_all().await;
        assert!(outcomes.iter().all(|(_, o)| *o == RefreshOutcome::Updated));

        let apps = store.applications();
        assert_eq!(apps.len(), 2);
        assert!(apps.iter().all(|a| a.store_name == "primary"));
        assert_eq!(apps[0].recent_exception_count, 1);
        assert_eq!(apps[1].recent_exception_count, 0);
    }

    #[tokio::test]
    async fn test_error_summary_caps_each_application() {
        let start = base_time();
        let mut rows = application_errors(1, "A", 1500, start);
        rows.extend(application_errors(10_000, "B", 10, start + ChronoDuration::seconds(30)));
        let db = MemoryDatabase::with_rows(rows);
        let (store, _) = store(&db);
        store.refresh_all().await;

        let summary = store.get_error_summary(1000, None);
        let mut per_app: HashMap<&str, usize> = HashMap::new();
        for row in &summary {
            *per_app.entry(row.application_name.as_str()).or_insert(0) += 1;
        }
        assert_eq!(per_app["A"], 1000);
        assert_eq!(per_app["B"], 10);
        assert!(is_recent_first(&summary));
        assert!(summary.iter().all(|r| r.detail.is_none()));

        let smaller = store.get_error_summary(3, None);
        assert_eq!(smaller.len(), 6);
        assert!(is_recent_first(&smaller));

        let only_b = store.get_error_summary(4, Some("B"));
        assert_eq!(only_b.len(), 4);
        assert!(only_b.iter().all(|r| r.application_name == "B"));
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_summary() {
        let db = MemoryDatabase::with_rows(application_errors(1, "A", 5, base_time()));
        let (store, sink) = store(&db);
        store.refresh_all().await;
        assert_eq!(store.get_error_summary(1000, None).len(), 5);

        db.faults()
            .set_connect_error(Some(DriverError::new("connection refused")));
        let outcomes = store.refresh_all().await;
        assert!(outcomes.iter().all(|(_, o)| *o == RefreshOutcome::Failed));

        assert_eq!(store.get_error_summary(1000, None).len(), 5);
        assert_eq!(store.applications().len(), 1);
        assert!(store.error_summary_entry().last_error().is_some());
        assert!(sink
            .failures()
            .iter()
            .all(StoreError::is_connect_error));
    }

    #[tokio::test]
    async fn test_get_all_errors_goes_to_database() {
        let start = base_time();
        let mut rows = application_errors(1, "A", 20, start);
        rows.extend(application_errors(100, "B", 20, start));
        let db = MemoryDatabase::with_rows(rows);
        let (store, _) = store(&db);

        let all = store.get_all_errors(5, None).await;
        assert_eq!(all.len(), 10);
        assert!(is_recent_first(&all));

        let only_a = store.get_all_errors(5, Some("A")).await;
        assert_eq!(only_a.len(), 5);
        assert!(only_a.iter().all(|r| r.application_name == "A"));
    }

    #[tokio::test]
    async fn test_get_error_overlays_live_fields() {
        let mut row = error_with_snapshot(7, "Checkout", "boom", base_time());
        row.duplicate_count = 42;
        row.deletion_date = Some(base_time());
        row.application_name = "Checkout.Renamed".to_string();
        let db = MemoryDatabase::with_rows(vec![row.clone()]);
        let (store, _) = store(&db);

        let found = store.get_error(row.guid).await.into_found().unwrap();
        assert_eq!(found.duplicate_count, 42);
        assert_eq!(found.deletion_date, Some(base_time()));
        assert_eq!(found.application_name, "Checkout.Renamed");
        assert_eq!(found.server_variables.len(), 1);
        assert_eq!(found.custom_data.get("Tenant").map(String::as_str), Some("acme"));
    }

    #[tokio::test]
    async fn test_get_error_malformed_snapshot_falls_back_to_row() {
        let mut row = error_fixture(8, "A", "boom", base_time());
        row.full_json = Some("{not json".to_string());
        let db = MemoryDatabase::with_rows(vec![row.clone()]);
        let (store, sink) = store(&db);

        let found = store.get_error(row.guid).await.into_found().unwrap();
        assert_eq!(found.message, "boom");
        assert!(matches!(
            &sink.failures()[..],
            [StoreError::InvalidSnapshot { .. }]
        ));
    }

    #[tokio::test]
    async fn test_get_error_distinguishes_missing_from_unreachable() {
        let db = MemoryDatabase::new();
        let (store, _) = store(&db);
        assert!(matches!(
            store.get_error(Uuid::from_u128(99)).await,
            ErrorLookup::NotFound
        ));

        db.faults().set_query_error(Some(DriverError::new("gone")));
        assert!(matches!(
            store.get_error(Uuid::from_u128(99)).await,
            ErrorLookup::Failed(StoreError::QueryFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_similar_lookups() {
        let at = base_time() + ChronoDuration::hours(1);
        let reference = error_fixture(1, "A", "boom", at);
        let db = MemoryDatabase::with_rows(vec![
            reference.clone(),
            error_fixture(2, "A", "boom", at - ChronoDuration::hours(1)),
            error_fixture(3, "A", "other", at + ChronoDuration::minutes(2)),
            error_fixture(4, "B", "boom", at - ChronoDuration::minutes(4)),
            error_fixture(5, "B", "late", at + ChronoDuration::minutes(6)),
        ]);
        let (store, _) = store(&db);

        let similar: Vec<i64> = store
            .get_similar_errors(&reference, 10)
            .await
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(similar, vec![1, 2]);

        let in_time: Vec<i64> = store
            .get_similar_errors_in_time(&reference, 10)
            .await
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(in_time, vec![3, 1, 4]);

        assert_eq!(store.get_similar_errors_in_time(&reference, 2).await.len(), 2);
    }

    #[tokio::test]
    async fn test_find_errors_example() {
        let base = base_time();
        let mut rows = Vec::new();
        for i in 0..80 {
            let message = if i % 2 == 0 { "Request timeout" } else { "Null reference" };
            let app = if i % 3 == 0 { "B" } else { "A" };
            let mut row = error_fixture(i, app, message, base + ChronoDuration::seconds(i));
            if i % 5 == 0 {
                row.deletion_date = Some(base);
            }
            rows.push(row);
        }
        let db = MemoryDatabase::with_rows(rows);
        let (store, _) = store(&db);

        let found = store.find_errors("timeout", Some("A"), 50, false).await;
        assert!(!found.is_empty());
        assert!(found.len() <= 50);
        assert!(is_recent_first(&found));
        assert!(found.iter().all(|r| r.application_name == "A"));
        assert!(found.iter().all(|r| !r.is_deleted()));
        assert!(found
            .iter()
            .all(|r| r.message.to_lowercase().contains("timeout")));
    }

    #[tokio::test]
    async fn test_reads_degrade_to_empty() {
        let db = MemoryDatabase::with_rows(application_errors(1, "A", 5, base_time()));
        db.faults().set_query_error(Some(DriverError::new("down")));
        let (store, sink) = store(&db);
        let reference = error_fixture(1, "A", "boom", base_time());

        assert!(store.get_all_errors(10, None).await.is_empty());
        assert!(store.get_similar_errors(&reference, 10).await.is_empty());
        assert!(store.get_similar_errors_in_time(&reference, 10).await.is_empty());
        assert!(store.find_errors("boom", None, 10, true).await.is_empty());
        assert_eq!(sink.failures().len(), 4);
    }

    #[tokio::test]
    async fn test_mutations() {
        let mut protected = error_fixture(3, "A", "boom", base_time());
        protected.is_protected = true;
        let db = MemoryDatabase::with_rows(vec![
            error_fixture(1, "A", "boom", base_time()),
            error_fixture(2, "A", "boom", base_time()),
            protected.clone(),
            error_fixture(4, "A", "other", base_time()),
            error_fixture(5, "B", "boom", base_time()),
        ]);
        let (store, _) = store(&db);
        let reference = db.get(Uuid::from_u128(1)).unwrap();

        assert_eq!(store.delete_similar_errors(&reference).await.unwrap(), 2);
        assert!(db.get(protected.guid).unwrap().deletion_date.is_none());

        assert_eq!(store.delete_all_errors("A").await.unwrap(), 1);
        assert!(!store.delete_error(Uuid::from_u128(4)).await.unwrap());
        assert!(store.delete_error(Uuid::from_u128(5)).await.unwrap());

        assert!(store.protect_error(Uuid::from_u128(5)).await.unwrap());
        let restored = db.get(Uuid::from_u128(5)).unwrap();
        assert!(restored.is_protected);
        assert!(restored.deletion_date.is_none());
        assert!(!store.protect_error(Uuid::from_u128(404)).await.unwrap());

        let ids = [Uuid::from_u128(1), Uuid::from_u128(3), Uuid::from_u128(5)];
        assert_eq!(store.delete_errors(&ids).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_errors_empty_never_connects() {
        let db = MemoryDatabase::new();
        db.faults()
            .set_connect_error(Some(DriverError::new("unreachable")));
        let (store, _) = store(&db);

        assert_eq!(store.delete_errors(&[]).await.unwrap(), 0);
        assert_eq!(db.stats().connect_attempts, 0);
    }

    #[tokio::test]
    async fn test_mutation_failure_propagates() {
        let db = MemoryDatabase::with_rows(application_errors(1, "A", 2, base_time()));
        db.faults()
            .set_mutation_error(Some(DriverError::new("lock wait timeout")));
        let (store, _) = store(&db);

        let err = store.delete_all_errors("A").await.unwrap_err();
        assert!(matches!(err, StoreError::MutationFailure { .. }));
        assert!(store.protect_error(Uuid::from_u128(1)).await.is_err());
        assert!(db.rows().iter().all(|r| r.deletion_date.is_none()));
    }
}
