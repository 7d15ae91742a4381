//! The target connection contract (§4.7): open/prepare/execute against one database,
//! plus the what-if decorator that intercepts writes.
//!
//! `TargetConnection` mirrors `refinery_core::traits::r#async::AsyncExecutor` /
//! `AsyncQuerySchemaHistory` but as a single `#[async_trait]` surface, since the
//! applicators need open/prepare/execute/dispose on one object rather than composing
//! separate executor and history traits.

use std::fmt;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::migration::{Migration, MigrationState, Phase};

/// The identifier threaded through `CONTEXT_INFO`/`SESSION_CONTEXT` for one seed run
/// against one target (§4.6 step 3, §6.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new_random() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the applied-migrations table (§6.2): `State` is derived, not stored.
#[derive(Clone, Debug)]
pub struct AppliedMigrationRow {
    pub name: String,
    pub hash: String,
    pub pre_run_date: Option<OffsetDateTime>,
    pub core_run_date: Option<OffsetDateTime>,
    pub post_run_date: Option<OffsetDateTime>,
}

impl AppliedMigrationRow {
    /// `State` derives from which `*RunDate` columns are non-null, per §6.2.
    pub fn state(&self) -> MigrationState {
        if self.post_run_date.is_some() {
            MigrationState::AppliedPost
        } else if self.core_run_date.is_some() {
            MigrationState::AppliedCore
        } else if self.pre_run_date.is_some() {
            MigrationState::AppliedPre
        } else {
            MigrationState::NotApplied
        }
    }
}

/// One SQL Server informational/error message raised during batch execution (§4.7).
#[derive(Clone, Debug)]
pub struct SqlMessage {
    pub procedure: Option<String>,
    pub line: u32,
    pub number: u32,
    pub severity: u8,
    pub message: String,
}

/// Messages at or below this severity are purely informational (`PRINT`, `RAISERROR`
/// with severity 10), per SQL Server convention; above it they carry error semantics
/// and get the structured `proc:line: E<number>:<severity>:` prefix.
pub const MAX_INFORMATIONAL_SEVERITY: u8 = 10;

pub fn render_sql_message(msg: &SqlMessage) -> String {
    if msg.severity <= MAX_INFORMATIONAL_SEVERITY {
        msg.message.clone()
    } else {
        format!(
            "{}:{}: E{}:{}: {}",
            msg.procedure.as_deref().unwrap_or("?"),
            msg.line,
            msg.number,
            msg.severity,
            msg.message
        )
    }
}

/// Receives SQL Server messages as they arrive during batch execution.
pub trait SqlLogger: Send + Sync {
    fn log(&self, msg: &SqlMessage);
}

/// A `SqlLogger` that forwards everything to the `log` facade.
pub struct FacadeSqlLogger;

impl SqlLogger for FacadeSqlLogger {
    fn log(&self, msg: &SqlMessage) {
        log::info!(target: "flotilla::connection", "{}", render_sql_message(msg));
    }
}

/// Operations exposed by a single target connection (§4.7).
#[async_trait]
pub trait TargetConnection: Send + Sync {
    async fn open(&mut self, cancel: &CancellationToken) -> Result<(), ConnectionError>;

    /// Idempotently ensures the migration-support schema exists (§6.2).
    async fn initialize_migration_support(&mut self, cancel: &CancellationToken) -> Result<(), ConnectionError>;

    /// Prepares a connection for a seed run: `CONTEXT_INFO`/`SESSION_CONTEXT('RunId', ..)`
    /// and `SESSION_CONTEXT('WorkerId', ..)` (§6.2).
    async fn prepare(&mut self, run_id: RunId, worker_id: i32, cancel: &CancellationToken) -> Result<(), ConnectionError>;

    async fn get_applied_migrations(
        &mut self,
        earliest_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<AppliedMigrationRow>, ConnectionError>;

    /// Executes one migration phase's content and marks it applied (§4.4, §6.2).
    async fn execute_migration_content(
        &mut self,
        migration: &Migration,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError>;

    async fn execute_seed_batch(&mut self, sql: &str, cancel: &CancellationToken) -> Result<(), ConnectionError>;

    async fn dispose(&mut self);
}

/// The applied-migrations table name, mirroring `refinery_core`'s
/// `assert_migrations_table_query` convention of a single well-known table.
pub const SCHEMA_HISTORY_TABLE: &str = "__FlotillaDeployMigrations";

/// Opens a fresh connection to one target. Applicators hold a factory rather than a
/// single connection so a worker pool (§4.6 step 4) can open one connection per
/// concurrent worker against the same target.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn open(&self, cancel: &CancellationToken) -> Result<Box<dyn TargetConnection>, ConnectionError>;
}

/// Forwarding impl so a boxed connection can itself be decorated, e.g. wrapped in a
/// [`WhatIfTargetConnection`] without unboxing it first.
#[async_trait]
impl TargetConnection for Box<dyn TargetConnection> {
    async fn open(&mut self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.as_mut().open(cancel).await
    }

    async fn initialize_migration_support(&mut self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.as_mut().initialize_migration_support(cancel).await
    }

    async fn prepare(&mut self, run_id: RunId, worker_id: i32, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.as_mut().prepare(run_id, worker_id, cancel).await
    }

    async fn get_applied_migrations(
        &mut self,
        earliest_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<AppliedMigrationRow>, ConnectionError> {
        self.as_mut().get_applied_migrations(earliest_name, cancel).await
    }

    async fn execute_migration_content(
        &mut self,
        migration: &Migration,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        self.as_mut().execute_migration_content(migration, phase, cancel).await
    }

    async fn execute_seed_batch(&mut self, sql: &str, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.as_mut().execute_seed_batch(sql, cancel).await
    }

    async fn dispose(&mut self) {
        self.as_mut().dispose().await
    }
}

/// Decorates a [`ConnectionFactory`] so every connection it opens is wrapped in a
/// [`WhatIfTargetConnection`] (§4.4: "what-if mode substitutes a connection variant
/// that... performs no writes"), used by [`crate::deployment::DeploymentApplicator`]
/// when `SessionOptions::is_what_if_mode` is set.
pub struct WhatIfConnectionFactory {
    inner: std::sync::Arc<dyn ConnectionFactory>,
}

impl WhatIfConnectionFactory {
    pub fn new(inner: std::sync::Arc<dyn ConnectionFactory>) -> Self {
        WhatIfConnectionFactory { inner }
    }
}

#[async_trait]
impl ConnectionFactory for WhatIfConnectionFactory {
    async fn open(&self, cancel: &CancellationToken) -> Result<Box<dyn TargetConnection>, ConnectionError> {
        let conn = self.inner.open(cancel).await?;
        Ok(Box::new(WhatIfTargetConnection::new(conn)))
    }
}

#[cfg(feature = "tiberius-driver")]
pub mod tiberius_driver {
    use super::*;
    use futures::io::{AsyncRead, AsyncWrite};
    use futures::TryStreamExt;
    use tiberius::{Client, QueryItem};
    use time::format_description::well_known::Rfc3339;

    /// The real connection, wrapping a `tiberius::Client<S>` exactly the way
    /// `refinery_core::drivers::tiberius` implements `AsyncExecutor` for it.
    pub struct SqlTargetConnection<S> {
        client: Client<S>,
        logger: std::sync::Arc<dyn SqlLogger>,
    }

    impl<S> SqlTargetConnection<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        pub fn new(client: Client<S>, logger: std::sync::Arc<dyn SqlLogger>) -> Self {
            SqlTargetConnection { client, logger }
        }

        async fn run(&mut self, sql: &str) -> Result<(), tiberius::error::Error> {
            self.client.simple_query(sql).await.map(drop)
        }

        fn assert_table_query() -> String {
            format!(
                "IF NOT EXISTS(SELECT 1 FROM sys.Tables WHERE Name = N'{table}')
                 BEGIN
                   CREATE TABLE {table}(
                     Name VARCHAR(255) PRIMARY KEY,
                     Hash VARCHAR(255) NOT NULL,
                     PreRunDate VARCHAR(255) NULL,
                     CoreRunDate VARCHAR(255) NULL,
                     PostRunDate VARCHAR(255) NULL);
                 END",
                table = SCHEMA_HISTORY_TABLE
            )
        }

        fn mark_applied_query(migration: &Migration, phase: Phase) -> String {
            let column = match phase {
                Phase::Pre => "PreRunDate",
                Phase::Core => "CoreRunDate",
                Phase::Post => "PostRunDate",
            };
            format!(
                "MERGE {table} AS target
                 USING (SELECT N'{name}' AS Name) AS src ON target.Name = src.Name
                 WHEN MATCHED THEN UPDATE SET {column} = SYSUTCDATETIME(), Hash = N'{hash}'
                 WHEN NOT MATCHED THEN INSERT (Name, Hash, {column}) VALUES (N'{name}', N'{hash}', SYSUTCDATETIME());",
                table = SCHEMA_HISTORY_TABLE,
                name = migration.name().replace('\'', "''"),
                hash = migration.hash(),
                column = column,
            )
        }
    }

    #[async_trait]
    impl<S> TargetConnection for SqlTargetConnection<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        async fn open(&mut self, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            // tiberius connections are opened by the caller-supplied factory before
            // construction; this is a no-op liveness check.
            self.run("SELECT 1;").await.map_err(|e| ConnectionError::new("open", e))
        }

        async fn initialize_migration_support(&mut self, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            self.run(&Self::assert_table_query())
                .await
                .map_err(|e| ConnectionError::new("initialize migration support schema", e))
        }

        async fn prepare(&mut self, run_id: RunId, worker_id: i32, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            let sql = format!(
                "EXEC sys.sp_set_session_context @key = N'RunId', @value = N'{run_id}', @read_only = 1;
                 EXEC sys.sp_set_session_context @key = N'WorkerId', @value = {worker_id}, @read_only = 1;"
            );
            self.run(&sql).await.map_err(|e| ConnectionError::new("prepare session context", e))
        }

        async fn get_applied_migrations(
            &mut self,
            earliest_name: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<Vec<AppliedMigrationRow>, ConnectionError> {
            let query = match earliest_name {
                Some(name) => format!(
                    "SELECT Name, Hash, PreRunDate, CoreRunDate, PostRunDate FROM {table} WHERE Name >= N'{name}'",
                    table = SCHEMA_HISTORY_TABLE,
                    name = name.replace('\'', "''"),
                ),
                None => format!("SELECT Name, Hash, PreRunDate, CoreRunDate, PostRunDate FROM {SCHEMA_HISTORY_TABLE}"),
            };

            let mut rows = self
                .client
                .simple_query(&query)
                .await
                .map_err(|e| ConnectionError::new("query applied migrations", e))?;
            let mut applied = Vec::new();
            while let Some(item) = rows
                .try_next()
                .await
                .map_err(|e| ConnectionError::new("read applied migrations", e))?
            {
                if let QueryItem::Row(row) = item {
                    let parse_date = |s: Option<&str>| s.and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());
                    applied.push(AppliedMigrationRow {
                        name: row.get::<&str, usize>(0).unwrap_or_default().to_string(),
                        hash: row.get::<&str, usize>(1).unwrap_or_default().to_string(),
                        pre_run_date: parse_date(row.get::<&str, usize>(2)),
                        core_run_date: parse_date(row.get::<&str, usize>(3)),
                        post_run_date: parse_date(row.get::<&str, usize>(4)),
                    });
                }
            }
            Ok(applied)
        }

        async fn execute_migration_content(
            &mut self,
            migration: &Migration,
            phase: Phase,
            _cancel: &CancellationToken,
        ) -> Result<(), ConnectionError> {
            let context = format!("execute migration {} phase {phase:?}", migration.name());
            self.run("BEGIN TRAN T1;").await.map_err(|e| ConnectionError::new(&context, e))?;
            let content = migration.content(phase);
            if !content.is_empty() {
                if let Some(sql) = &content.sql {
                    if let Err(e) = self.run(sql).await {
                        let _ = self.run("ROLLBACK TRAN T1;").await;
                        return Err(ConnectionError::new(&context, e));
                    }
                }
            }
            let mark = Self::mark_applied_query(migration, phase);
            if let Err(e) = self.run(&mark).await {
                let _ = self.run("ROLLBACK TRAN T1;").await;
                return Err(ConnectionError::new(&context, e));
            }
            self.run("COMMIT TRAN T1;").await.map_err(|e| ConnectionError::new(&context, e))?;
            self.logger.log(&SqlMessage {
                procedure: None,
                line: 0,
                number: 0,
                severity: 0,
                message: format!("applied {} ({phase:?})", migration.name()),
            });
            Ok(())
        }

        async fn execute_seed_batch(&mut self, sql: &str, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            self.run(sql).await.map_err(|e| ConnectionError::new("execute seed batch", e))
        }

        async fn dispose(&mut self) {
            let _ = self.client.simple_query("SELECT 1;").await;
        }
    }
}

/// First non-blank, non-`--`-comment line of `sql`, used for the what-if log message.
fn first_non_empty_line(sql: &str) -> &str {
    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        return trimmed;
    }
    ""
}

/// Decorates a real connection, intercepting the two mutating calls and logging
/// instead of delegating (§4.4, §4.7).
pub struct WhatIfTargetConnection<C> {
    inner: C,
}

impl<C: TargetConnection> WhatIfTargetConnection<C> {
    pub fn new(inner: C) -> Self {
        WhatIfTargetConnection { inner }
    }
}

#[async_trait]
impl<C: TargetConnection> TargetConnection for WhatIfTargetConnection<C> {
    async fn open(&mut self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.inner.open(cancel).await
    }

    async fn initialize_migration_support(&mut self, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.inner.initialize_migration_support(cancel).await
    }

    async fn prepare(&mut self, run_id: RunId, worker_id: i32, cancel: &CancellationToken) -> Result<(), ConnectionError> {
        self.inner.prepare(run_id, worker_id, cancel).await
    }

    async fn get_applied_migrations(
        &mut self,
        earliest_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<AppliedMigrationRow>, ConnectionError> {
        self.inner.get_applied_migrations(earliest_name, cancel).await
    }

    async fn execute_migration_content(
        &mut self,
        migration: &Migration,
        phase: Phase,
        _cancel: &CancellationToken,
    ) -> Result<(), ConnectionError> {
        if let Some(sql) = &migration.content(phase).sql {
            log::info!(
                target: "flotilla::whatif",
                "Would execute batch beginning with: {}",
                first_non_empty_line(sql)
            );
        }
        Ok(())
    }

    async fn execute_seed_batch(&mut self, sql: &str, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
        log::info!(
            target: "flotilla::whatif",
            "Would execute batch beginning with: {}",
            first_non_empty_line(sql)
        );
        Ok(())
    }

    async fn dispose(&mut self) {
        self.inner.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn first_non_empty_line_skips_blank_lines_and_comments() {
        let sql = "\n  \n-- a leading comment\n  select 1;\nselect 2;";
        assert_eq!(first_non_empty_line(sql), "select 1;");
    }

    #[test]
    fn first_non_empty_line_of_all_noise_is_empty() {
        assert_eq!(first_non_empty_line("\n-- only comments\n  \n"), "");
    }

    #[test]
    fn informational_severity_renders_as_bare_message() {
        let msg = SqlMessage {
            procedure: Some("usp_x".into()),
            line: 12,
            number: 50000,
            severity: 5,
            message: "hello".into(),
        };
        assert_eq!(render_sql_message(&msg), "hello");
    }

    #[test]
    fn error_severity_renders_with_structured_prefix() {
        let msg = SqlMessage {
            procedure: Some("usp_x".into()),
            line: 12,
            number: 50000,
            severity: 16,
            message: "boom".into(),
        };
        assert_eq!(render_sql_message(&msg), "usp_x:12: E50000:16: boom");
    }

    #[test]
    fn applied_row_state_derives_from_run_dates() {
        let row = AppliedMigrationRow {
            name: "M".into(),
            hash: "h".into(),
            pre_run_date: Some(OffsetDateTime::UNIX_EPOCH),
            core_run_date: None,
            post_run_date: None,
        };
        assert_eq!(row.state(), MigrationState::AppliedPre);
    }

    struct CountingConnection {
        execute_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TargetConnection for CountingConnection {
        async fn open(&mut self, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn initialize_migration_support(&mut self, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn prepare(&mut self, _run_id: RunId, _worker_id: i32, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn get_applied_migrations(
            &mut self,
            _earliest_name: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<Vec<AppliedMigrationRow>, ConnectionError> {
            Ok(Vec::new())
        }
        async fn execute_migration_content(
            &mut self,
            _migration: &Migration,
            _phase: Phase,
            _cancel: &CancellationToken,
        ) -> Result<(), ConnectionError> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn execute_seed_batch(&mut self, _sql: &str, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn dispose(&mut self) {}
    }

    struct CountingFactory {
        execute_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionFactory for CountingFactory {
        async fn open(&self, _cancel: &CancellationToken) -> Result<Box<dyn TargetConnection>, ConnectionError> {
            Ok(Box::new(CountingConnection { execute_calls: self.execute_calls.clone() }))
        }
    }

    #[tokio::test]
    async fn what_if_connection_factory_wraps_every_opened_connection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory: std::sync::Arc<dyn ConnectionFactory> =
            std::sync::Arc::new(CountingFactory { execute_calls: calls.clone() });
        let factory = WhatIfConnectionFactory::new(factory);
        let cancel = CancellationToken::new();
        let mut conn = factory.open(&cancel).await.unwrap();
        conn.execute_seed_batch("select 1;", &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn what_if_connection_never_delegates_mutating_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = CountingConnection { execute_calls: calls.clone() };
        let mut conn = WhatIfTargetConnection::new(inner);
        let cancel = CancellationToken::new();
        conn.execute_seed_batch("select 1;", &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
