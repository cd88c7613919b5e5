//! PostgreSQL backend over `tokio-postgres`.
//!
//! Connections are opened on demand and never reused. The driver half of
//! each connection runs on its own task, which is aborted as soon as the
//! client side is closed or dropped.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::str::FromStr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::config::Host;
use tokio_postgres::types::{FromSqlOwned, ToSql};
use tokio_postgres::{Client, Config, NoTls, Row};

use errwatch_core::{Application, ConfigError, DriverError, ErrorRecord};

use crate::connection::{ConnectTarget, Connection, Connector};
use crate::ops::{ReadOp, ReadRows, WriteOp};

const SET_READ_UNCOMMITTED: &str =
    "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL READ UNCOMMITTED";

const LIST_COLUMNS: &str = r#""Id", "GUID", "ApplicationName", "MachineName", "CreationDate", "Type", "IsProtected", "Host", "Url", "HTTPMethod", "IPAddress", "Source", "Message", "StatusCode", "ErrorHash", "DuplicateCount""#;

const UTC_NOW: &str = "(now() at time zone 'utc')";

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// One SQL statement with its bound parameters.
pub struct Statement {
    pub sql: String,
    params: Vec<SqlParam>,
}

impl Statement {
    fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Bind a value and return its placeholder.
    fn bind(&mut self, value: impl ToSql + Sync + Send + 'static) -> String {
        self.params.push(Box::new(value));
        format!("${}", self.params.len())
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    fn sql_params(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("params", &self.params.len())
            .finish()
    }
}

fn limit(max: usize) -> i64 {
    i64::try_from(max).unwrap_or(i64::MAX)
}

fn detail_columns() -> String {
    format!(r#"{LIST_COLUMNS}, "Detail", "DeletionDate""#)
}

/// Build the statement for a read.
pub fn read_statement(op: &ReadOp) -> Statement {
    match op {
        ReadOp::Applications(params) => {
            let mut stmt = Statement::new("");
            let window = stmt.bind(params.recent_seconds as f64);
            stmt.sql = format!(
                r#"SELECT "ApplicationName" AS "Name",
       SUM("DuplicateCount")::bigint AS "ExceptionCount",
       SUM(CASE WHEN "CreationDate" > {UTC_NOW} - make_interval(secs => {window})
                THEN "DuplicateCount" ELSE 0 END)::bigint AS "RecentExceptionCount",
       MAX("CreationDate") AS "MostRecent"
  FROM "Exceptions"
 WHERE "DeletionDate" IS NULL
 GROUP BY "ApplicationName"
 ORDER BY "ApplicationName""#
            );
            stmt
        }
        ReadOp::ErrorSummary(params) => {
            let mut stmt = Statement::new("");
            let cap = stmt.bind(limit(params.max_per_app));
            let app_filter = match &params.app_name {
                Some(app) => format!(r#" AND "ApplicationName" = {}"#, stmt.bind(app.clone())),
                None => String::new(),
            };
            stmt.sql = format!(
                r#"SELECT {LIST_COLUMNS}
  FROM (SELECT e.*,
               ROW_NUMBER() OVER (PARTITION BY "ApplicationName"
                                  ORDER BY "CreationDate" DESC, "Id" DESC) AS row_rank
          FROM "Exceptions" e
         WHERE "DeletionDate" IS NULL{app_filter}) ranked
 WHERE row_rank <= {cap}
 ORDER BY "CreationDate" DESC, "Id" DESC"#
            );
            stmt
        }
        ReadOp::ErrorByGuid(params) => {
            let mut stmt = Statement::new("");
            let guid = stmt.bind(params.guid);
            stmt.sql = format!(
                r#"SELECT {}, "FullJson" FROM "Exceptions" WHERE "GUID" = {guid} LIMIT 1"#,
                detail_columns()
            );
            stmt
        }
        ReadOp::SimilarErrors(params) => {
            let mut stmt = Statement::new("");
            let app = stmt.bind(params.application_name.clone());
            let message = stmt.bind(params.message.clone());
            let max = stmt.bind(limit(params.max));
            stmt.sql = format!(
                r#"SELECT {}
  FROM "Exceptions"
 WHERE "ApplicationName" = {app}
   AND "Message" = {message}
 ORDER BY "CreationDate" DESC, "Id" DESC
 LIMIT {max}"#,
                detail_columns()
            );
            stmt
        }
        ReadOp::ErrorsInWindow(params) => {
            let mut stmt = Statement::new("");
            let start = stmt.bind(params.start.naive_utc());
            let end = stmt.bind(params.end.naive_utc());
            let max = stmt.bind(limit(params.max));
            stmt.sql = format!(
                r#"SELECT {}
  FROM "Exceptions"
 WHERE "CreationDate" BETWEEN {start} AND {end}
 ORDER BY "CreationDate" DESC, "Id" DESC
 LIMIT {max}"#,
                detail_columns()
            );
            stmt
        }
        ReadOp::Search(params) => {
            let mut stmt = Statement::new("");
            let pattern = stmt.bind(params.like_pattern());
            let mut filters = String::new();
            if let Some(app) = &params.app_name {
                filters.push_str(&format!(
                    r#" AND "ApplicationName" = {}"#,
                    stmt.bind(app.clone())
                ));
            }
            if !params.include_deleted {
                filters.push_str(r#" AND "DeletionDate" IS NULL"#);
            }
            let max = stmt.bind(limit(params.max));
            stmt.sql = format!(
                r#"SELECT {}
  FROM "Exceptions"
 WHERE ("Message" ILIKE {pattern} OR "Detail" ILIKE {pattern} OR "Url" ILIKE {pattern}){filters}
 ORDER BY "CreationDate" DESC, "Id" DESC
 LIMIT {max}"#,
                detail_columns()
            );
            stmt
        }
    }
}

/// Build the statement for a mutation.
pub fn write_statement(op: &WriteOp) -> Statement {
    let soft_delete = |condition: String| {
        format!(
            r#"UPDATE "Exceptions"
   SET "DeletionDate" = {UTC_NOW}
 WHERE "DeletionDate" IS NULL
   AND "IsProtected" = false
   AND {condition}"#
        )
    };

    let mut stmt = Statement::new("");
    stmt.sql = match op {
        WriteOp::DeleteApplication { app_name } => {
            let app = stmt.bind(app_name.clone());
            soft_delete(format!(r#""ApplicationName" = {app}"#))
        }
        WriteOp::DeleteSimilar {
            application_name,
            message,
        } => {
            let app = stmt.bind(application_name.clone());
            let message = stmt.bind(message.clone());
            soft_delete(format!(
                r#""ApplicationName" = {app} AND "Message" = {message}"#
            ))
        }
        WriteOp::DeleteByGuids { guids } => {
            let guids = stmt.bind(guids.clone());
            soft_delete(format!(r#""GUID" = ANY({guids})"#))
        }
        WriteOp::DeleteByGuid { guid } => {
            let guid = stmt.bind(*guid);
            soft_delete(format!(r#""GUID" = {guid}"#))
        }
        WriteOp::Protect { guid } => {
            let guid = stmt.bind(*guid);
            format!(
                r#"UPDATE "Exceptions"
   SET "IsProtected" = true, "DeletionDate" = NULL
 WHERE "GUID" = {guid}"#
            )
        }
    };
    stmt
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn utc(value: NaiveDateTime) -> DateTime<Utc> {
    value.and_utc()
}

/// A column that only some statements select.
fn optional<T: FromSqlOwned>(row: &Row, name: &str) -> Result<Option<T>, tokio_postgres::Error> {
    if row.columns().iter().any(|c| c.name() == name) {
        row.try_get::<_, Option<T>>(name)
    } else {
        Ok(None)
    }
}

fn error_from_row(row: &Row) -> Result<ErrorRecord, tokio_postgres::Error> {
    Ok(ErrorRecord {
        id: row.try_get("Id")?,
        guid: row.try_get("GUID")?,
        application_name: row.try_get("ApplicationName")?,
        machine_name: row.try_get("MachineName")?,
        creation_date: utc(row.try_get("CreationDate")?),
        error_type: row.try_get("Type")?,
        is_protected: row.try_get("IsProtected")?,
        host: row.try_get("Host")?,
        url: row.try_get("Url")?,
        http_method: row.try_get("HTTPMethod")?,
        ip_address: row.try_get("IPAddress")?,
        source: row.try_get("Source")?,
        message: row.try_get("Message")?,
        detail: optional(row, "Detail")?,
        status_code: row.try_get("StatusCode")?,
        error_hash: row.try_get("ErrorHash")?,
        duplicate_count: row.try_get("DuplicateCount")?,
        deletion_date: optional::<NaiveDateTime>(row, "DeletionDate")?.map(utc),
        server_variables: Vec::new(),
        query_string: Vec::new(),
        form: Vec::new(),
        cookies: Vec::new(),
        request_headers: Vec::new(),
        custom_data: Default::default(),
        full_json: optional(row, "FullJson")?,
    })
}

fn application_from_row(row: &Row) -> Result<Application, tokio_postgres::Error> {
    Ok(Application {
        name: row.try_get("Name")?,
        exception_count: row.try_get("ExceptionCount")?,
        recent_exception_count: row.try_get("RecentExceptionCount")?,
        most_recent: row
            .try_get::<_, Option<NaiveDateTime>>("MostRecent")?
            .map(utc),
        store_name: String::new(),
    })
}

fn driver_error(e: tokio_postgres::Error) -> DriverError {
    let message = match e.as_db_error() {
        Some(db) => db.message().to_string(),
        None => e.to_string(),
    };
    match e.code() {
        Some(state) => DriverError::new(message).with_code(state.code()),
        None => DriverError::new(message),
    }
}

// ============================================================================
// CONNECTOR
// ============================================================================

/// Connector for one Postgres exceptions database.
#[derive(Clone)]
pub struct PgConnector {
    config: Config,
    target: ConnectTarget,
}

impl std::fmt::Debug for PgConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnector")
            .field("target", &self.target)
            .finish()
    }
}

impl PgConnector {
    /// Parse a libpq key/value or URL descriptor.
    pub fn from_descriptor(store: &str, descriptor: &str) -> Result<Self, ConfigError> {
        let config =
            Config::from_str(descriptor).map_err(|e| ConfigError::InvalidConnectionString {
                store: store.to_string(),
                reason: e.to_string(),
            })?;
        let target = target_of(&config);
        Ok(Self { config, target })
    }
}

fn target_of(config: &Config) -> ConnectTarget {
    let host = config
        .get_hosts()
        .first()
        .map(|host| match host {
            Host::Tcp(name) => name.clone(),
            #[allow(unreachable_patterns)]
            other => format!("{other:?}"),
        })
        .unwrap_or_else(|| "localhost".to_string());
    let database = config
        .get_dbname()
        .or_else(|| config.get_user())
        .unwrap_or("postgres")
        .to_string();
    ConnectTarget::new(host, database)
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    fn target(&self) -> ConnectTarget {
        self.target.clone()
    }

    async fn connect(&self) -> Result<PgConnection, DriverError> {
        let (client, connection) = self.config.connect(NoTls).await.map_err(driver_error)?;
        let target = self.target.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(
                    host = %target.host,
                    database = %target.database,
                    error = %e,
                    "Postgres connection ended with error"
                );
            }
        });
        Ok(PgConnection { client, driver })
    }
}

/// One Postgres session.
pub struct PgConnection {
    client: Client,
    driver: JoinHandle<()>,
}

impl PgConnection {
    async fn apply_timeout(&self, timeout: Option<Duration>) -> Result<(), DriverError> {
        if let Some(timeout) = timeout {
            let sql = format!("SET statement_timeout = {}", timeout.as_millis());
            self.client.batch_execute(&sql).await.map_err(driver_error)?;
        }
        Ok(())
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn set_read_uncommitted(&mut self) -> Result<(), DriverError> {
        self.client
            .batch_execute(SET_READ_UNCOMMITTED)
            .await
            .map_err(driver_error)
    }

    async fn query(
        &mut self,
        op: &ReadOp,
        timeout: Option<Duration>,
    ) -> Result<ReadRows, DriverError> {
        self.apply_timeout(timeout).await?;
        let stmt = read_statement(op);
        let rows = self
            .client
            .query(stmt.sql.as_str(), &stmt.sql_params())
            .await
            .map_err(driver_error)?;

        let mapped = match op {
            ReadOp::Applications(_) => rows
                .iter()
                .map(application_from_row)
                .collect::<Result<Vec<_>, _>>()
                .map(ReadRows::Applications),
            _ => rows
                .iter()
                .map(error_from_row)
                .collect::<Result<Vec<_>, _>>()
                .map(ReadRows::Errors),
        };
        mapped.map_err(driver_error)
    }

    async fn execute(
        &mut self,
        op: &WriteOp,
        timeout: Option<Duration>,
    ) -> Result<u64, DriverError> {
        self.apply_timeout(timeout).await?;
        let stmt = write_statement(op);
        self.client
            .execute(stmt.sql.as_str(), &stmt.sql_params())
            .await
            .map_err(driver_error)
    }

    async fn close(self) {
        // Drop aborts the driver task.
    }
}
