//! A concrete [`TargetApplicator`] (§4.1, §9) wiring discovery/loading (done once by
//! the caller) through to execution for one target: builds a migration plan against
//! that target's applied state, runs it phase by phase, then schedules and runs the
//! seed graph, reporting every step through [`Console`] and honoring
//! `SessionOptions::is_what_if_mode` via [`WhatIfConnectionFactory`] (§4.4, §4.8).

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionFactory, WhatIfConnectionFactory};
use crate::console::{ApplyKind, Console, Disposition};
use crate::error::SessionFailure;
use crate::limiter::Limiter;
use crate::migration::{Diagnostic, Migration, Phase};
use crate::migration_applicator::apply_migration_phase;
use crate::plan::{build_plan, MigrationPlan};
use crate::seed_applicator::apply_seed;
use crate::seed_graph::SeedGraph;
use crate::session::{SessionOptions, TargetApplicator};
use crate::target::Target;

fn effective_or_cpus(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get()
    } else {
        requested
    }
}

/// Applies a fixed set of discovered migrations and, optionally, one loaded seed's
/// dependency graph to every target a [`crate::session::Session`] fans out to.
pub struct DeploymentApplicator {
    connection_factory: Arc<dyn ConnectionFactory>,
    console: Arc<dyn Console>,
    migrations: Vec<Migration>,
    seed: Option<(String, SeedGraph)>,
    seed_worker_count: usize,
}

impl DeploymentApplicator {
    pub fn new(
        connection_factory: Arc<dyn ConnectionFactory>,
        console: Arc<dyn Console>,
        migrations: Vec<Migration>,
        seed: Option<(String, SeedGraph)>,
        options: &SessionOptions,
    ) -> Self {
        let connection_factory = if options.is_what_if_mode {
            Arc::new(WhatIfConnectionFactory::new(connection_factory)) as Arc<dyn ConnectionFactory>
        } else {
            connection_factory
        };
        DeploymentApplicator {
            connection_factory,
            console,
            migrations,
            seed,
            seed_worker_count: effective_or_cpus(options.max_parallelism_per_target),
        }
    }

    async fn apply_migrations(
        &self,
        target: &Target,
        full_name: &str,
        limiter: &Arc<dyn Limiter>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionFailure> {
        let mut conn = self.connection_factory.open(cancel).await?;
        conn.initialize_migration_support(cancel).await?;

        let mut migrations = self.migrations.clone();
        let applied = conn.get_applied_migrations(None, cancel).await?;
        let plan = build_plan(&mut migrations, &applied)?;

        for phase in Phase::ALL {
            if plan.is_empty(phase, &migrations) {
                continue;
            }
            let kind = ApplyKind::Migration { phase };
            let names = phase_item_names(&migrations, &plan, phase);

            self.console.report_starting(full_name, &kind);
            let mut log = self.console.create_log(target.server_display_name(), target.database_display_name(), &kind);
            for name in &names {
                self.console.report_applying(full_name, &kind, name);
                log.write_line(&format!("applying {name}"));
            }

            let scope = limiter.acquire(cancel).await.map_err(|e| crate::error::ConnectionError::new("acquire limiter", e))?;
            let result = apply_migration_phase(conn.as_mut(), &mut migrations, &plan, phase, cancel).await;
            drop(scope);

            match result {
                Ok(()) => {
                    for name in &names {
                        self.console.report_applied(full_name, &kind, name);
                        log.write_line(&format!("applied {name}"));
                    }
                    log.finish(names.len(), Disposition::Successful);
                }
                Err(e) => {
                    self.console.report_problem(full_name, &Diagnostic::error(e.to_string()));
                    log.finish(0, Disposition::Failed);
                    return Err(e.into());
                }
            }
        }

        conn.dispose().await;
        Ok(())
    }

    async fn apply_seed_if_present(
        &self,
        target: &Target,
        full_name: &str,
        limiter: &Arc<dyn Limiter>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionFailure> {
        let Some((name, graph)) = &self.seed else {
            return Ok(());
        };

        let kind = ApplyKind::Seed { name: name.clone() };
        let module_count = graph.len();
        self.console.report_starting(full_name, &kind);
        let mut log = self.console.create_log(target.server_display_name(), target.database_display_name(), &kind);

        let result = apply_seed(graph.clone(), self.connection_factory.clone(), limiter.clone(), self.seed_worker_count, cancel.clone()).await;

        match result {
            Ok(()) => {
                self.console.report_applied(full_name, &kind, name);
                log.finish(module_count, Disposition::Successful);
                Ok(())
            }
            Err(e) => {
                self.console.report_problem(full_name, &Diagnostic::error(e.to_string()));
                log.finish(0, Disposition::Failed);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl TargetApplicator for DeploymentApplicator {
    async fn apply(&self, target: &Target, limiter: Arc<dyn Limiter>, cancel: CancellationToken) -> Result<(), SessionFailure> {
        let full_name = target.full_display_name();
        self.apply_migrations(target, &full_name, &limiter, &cancel).await?;
        self.apply_seed_if_present(target, &full_name, &limiter, &cancel).await?;
        Ok(())
    }
}

/// Names of the migrations eligible in `phase`, in plan order, for reporting.
fn phase_item_names(migrations: &[Migration], plan: &MigrationPlan, phase: Phase) -> Vec<String> {
    match phase {
        Phase::Pre => plan.pre.iter().map(|&i| migrations[i].name().to_string()).collect(),
        Phase::Core => plan.core.iter().map(|&(i, _)| migrations[i].name().to_string()).collect(),
        Phase::Post => plan.post.iter().map(|&i| migrations[i].name().to_string()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{AppliedMigrationRow, RunId, TargetConnection};
    use crate::console::NullConsole;
    use crate::error::ConnectionError;
    use crate::limiter::NullLimiter;
    use crate::seed::SeedModule;
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct RecordingConnection {
        executed: Arc<Mutex<Vec<String>>>,
        applied: Vec<AppliedMigrationRow>,
    }

    #[async_trait]
    impl TargetConnection for RecordingConnection {
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
            Ok(self.applied.clone())
        }
        async fn execute_migration_content(
            &mut self,
            migration: &Migration,
            phase: Phase,
            _cancel: &CancellationToken,
        ) -> Result<(), ConnectionError> {
            self.executed.lock().unwrap().push(format!("{}:{phase:?}", migration.name()));
            Ok(())
        }
        async fn execute_seed_batch(&mut self, sql: &str, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            self.executed.lock().unwrap().push(sql.to_string());
            Ok(())
        }
        async fn dispose(&mut self) {}
    }

    struct RecordingFactory {
        executed: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ConnectionFactory for RecordingFactory {
        async fn open(&self, _cancel: &CancellationToken) -> Result<Box<dyn TargetConnection>, ConnectionError> {
            Ok(Box::new(RecordingConnection { executed: self.executed.clone(), applied: Vec::new() }))
        }
    }

    fn target() -> Target {
        Target::new("conn", None, "srv01", "AppDb")
    }

    #[tokio::test]
    async fn applies_migrations_and_seed_through_the_apply_path() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let factory: Arc<dyn ConnectionFactory> = Arc::new(RecordingFactory { executed: executed.clone() });
        let migrations = vec![Migration::new(
            "A",
            Some(PathBuf::from("A/_Main.sql")),
            Some("select 1;".to_string()),
            None,
            None,
            Vec::new(),
        )];
        let mut init = SeedModule::new("init");
        init.batches = vec!["select 'seed';".to_string()];
        let graph = SeedGraph::build(vec![init]).unwrap();

        let applicator = DeploymentApplicator::new(
            factory,
            Arc::new(NullConsole),
            migrations,
            Some(("Lookups".to_string(), graph)),
            &SessionOptions::new(),
        );

        let limiter: Arc<dyn Limiter> = Arc::new(NullLimiter);
        applicator.apply(&target(), limiter, CancellationToken::new()).await.unwrap();

        let executed = executed.lock().unwrap();
        assert!(executed.contains(&"A:Pre".to_string()));
        assert!(executed.contains(&"select 'seed';".to_string()));
    }

    #[tokio::test]
    async fn what_if_mode_suppresses_migration_and_seed_writes() {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let factory: Arc<dyn ConnectionFactory> = Arc::new(RecordingFactory { executed: executed.clone() });
        let migrations = vec![Migration::new(
            "A",
            Some(PathBuf::from("A/_Main.sql")),
            Some("select 1;".to_string()),
            None,
            None,
            Vec::new(),
        )];

        let applicator = DeploymentApplicator::new(
            factory,
            Arc::new(NullConsole),
            migrations,
            None,
            &SessionOptions::new().with_what_if_mode(true),
        );

        let limiter: Arc<dyn Limiter> = Arc::new(NullLimiter);
        applicator.apply(&target(), limiter, CancellationToken::new()).await.unwrap();

        assert!(executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_failing_phase_is_reported_and_stops_before_the_seed() {
        struct FailingConnection;

        #[async_trait]
        impl TargetConnection for FailingConnection {
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
                Err(ConnectionError::new("execute", std::io::Error::new(std::io::ErrorKind::Other, "boom")))
            }
            async fn execute_seed_batch(&mut self, _sql: &str, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
                Ok(())
            }
            async fn dispose(&mut self) {}
        }

        struct FailingFactory;
        #[async_trait]
        impl ConnectionFactory for FailingFactory {
            async fn open(&self, _cancel: &CancellationToken) -> Result<Box<dyn TargetConnection>, ConnectionError> {
                Ok(Box::new(FailingConnection))
            }
        }

        let migrations = vec![Migration::new(
            "A",
            Some(PathBuf::from("A/_Main.sql")),
            Some("select 1;".to_string()),
            None,
            None,
            Vec::new(),
        )];
        let applicator = DeploymentApplicator::new(
            Arc::new(FailingFactory),
            Arc::new(NullConsole),
            migrations,
            None,
            &SessionOptions::new(),
        );

        let limiter: Arc<dyn Limiter> = Arc::new(NullLimiter);
        let result = applicator.apply(&target(), limiter, CancellationToken::new()).await;
        assert!(matches!(result, Err(SessionFailure::Migration(crate::error::MigrationError::Execution { .. }))));
    }
}
