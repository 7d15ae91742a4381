//! Dependency-ordered worker pool that executes a validated [`SeedGraph`] against one
//! target (§4.6 steps 3-5).
//!
//! Grounded on the same `Arc<Semaphore>` + `CancellationToken` + `tokio::spawn` fan-out
//! shape the Postgres fleet-migration tool in the corpus uses for
//! `phase_dump_all`/`phase_restore_all`, but fanned out over *modules* within one
//! target rather than over targets.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionFactory, RunId, TargetConnection};
use crate::error::{ConnectionError, SeedError};
use crate::limiter::Limiter;
use crate::seed::SeedModule;
use crate::seed_graph::SeedGraph;

struct QueueState {
    completed: BTreeSet<usize>,
    in_progress: BTreeSet<usize>,
}

/// Runs every module in `graph` against one target, fanning out `worker_count`
/// concurrent connections. Returns as soon as the first module execution fails,
/// cancelling sibling workers. An externally-cancelled token is treated as a graceful
/// stop, not a [`SeedError`] (§7: cancellation carries no error count).
pub async fn apply_seed(
    graph: SeedGraph,
    connection_factory: Arc<dyn ConnectionFactory>,
    limiter: Arc<dyn Limiter>,
    worker_count: usize,
    cancel: CancellationToken,
) -> Result<(), SeedError> {
    if graph.modules().iter().all(|m| m.batches.is_empty()) {
        return Ok(());
    }

    let run_id = RunId::new_random();
    let graph = Arc::new(graph);
    let all_module_indices: Arc<Vec<usize>> = Arc::new(
        graph
            .modules()
            .iter()
            .enumerate()
            .filter(|(_, m)| m.runs_on_every_worker())
            .map(|(i, _)| i)
            .collect(),
    );
    let state = Arc::new(Mutex::new(QueueState {
        completed: BTreeSet::new(),
        in_progress: BTreeSet::new(),
    }));
    let notify = Arc::new(Notify::new());

    let worker_count = worker_count.max(1);
    let mut handles = Vec::with_capacity(worker_count);
    for w in 0..worker_count {
        let physical_id = (w + 1) as i32;
        handles.push(tokio::spawn(run_worker(
            physical_id,
            graph.clone(),
            all_module_indices.clone(),
            state.clone(),
            notify.clone(),
            connection_factory.clone(),
            limiter.clone(),
            run_id,
            cancel.clone(),
        )));
    }

    let mut first_err = None;
    for handle in handles {
        if let Ok(Err(e)) = handle.await {
            cancel.cancel();
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_worker(
    physical_id: i32,
    graph: Arc<SeedGraph>,
    all_module_indices: Arc<Vec<usize>>,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    connection_factory: Arc<dyn ConnectionFactory>,
    limiter: Arc<dyn Limiter>,
    run_id: RunId,
    cancel: CancellationToken,
) -> Result<(), SeedError> {
    let mut conn = match connection_factory.open(&cancel).await {
        Ok(c) => c,
        Err(e) => return Err(wrap_execution_error("<open connection>", e)),
    };
    if let Err(e) = conn.prepare(run_id, physical_id, &cancel).await {
        return Err(wrap_execution_error("<prepare session>", e));
    }

    // A `WorkerId = -1` module runs once on every worker, before any ordinary module
    // that requires the `init` topic.
    for &idx in all_module_indices.iter() {
        let module = &graph.modules()[idx];
        if let Err(e) = run_module_batches(conn.as_mut(), module, &cancel).await {
            return Err(SeedError::Execution { module: module.name.clone(), source: e });
        }
        let mut guard = state.lock().await;
        guard.completed.insert(idx);
        drop(guard);
        notify.notify_waiters();
    }

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let picked = {
            let mut guard = state.lock().await;
            let pick = graph
                .ready(&guard.completed)
                .into_iter()
                .find(|i| !guard.in_progress.contains(i) && !all_module_indices.contains(i));
            if let Some(i) = pick {
                guard.in_progress.insert(i);
            }
            pick
        };

        let idx = match picked {
            Some(i) => i,
            None => {
                let guard = state.lock().await;
                let all_ordinary_done =
                    (0..graph.len()).filter(|i| !all_module_indices.contains(i)).all(|i| guard.completed.contains(&i));
                drop(guard);
                if all_ordinary_done {
                    break;
                }
                tokio::select! {
                    _ = notify.notified() => continue,
                    _ = cancel.cancelled() => break,
                }
            }
        };

        let scope = match limiter.acquire(&cancel).await {
            Ok(scope) => scope,
            Err(_) => break, // cancelled (or a closed limiter, which we treat the same way here)
        };

        let module = &graph.modules()[idx];
        let result = run_module_batches(conn.as_mut(), module, &cancel).await;
        drop(scope);

        match result {
            Ok(()) => {
                let mut guard = state.lock().await;
                guard.completed.insert(idx);
                guard.in_progress.remove(&idx);
                drop(guard);
                notify.notify_waiters();
            }
            Err(e) => return Err(SeedError::Execution { module: module.name.clone(), source: e }),
        }
    }

    conn.dispose().await;
    Ok(())
}

async fn run_module_batches(
    conn: &mut dyn TargetConnection,
    module: &SeedModule,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    for batch in &module.batches {
        conn.execute_seed_batch(batch, cancel).await?;
    }
    Ok(())
}

fn wrap_execution_error(module: &str, source: ConnectionError) -> SeedError {
    SeedError::Execution { module: module.to_string(), source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AppliedMigrationRow;
    use crate::migration::{Migration, Phase};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingConnection {
        log: Arc<AsyncMutex<Vec<String>>>,
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
            Ok(Vec::new())
        }
        async fn execute_migration_content(
            &mut self,
            _migration: &Migration,
            _phase: Phase,
            _cancel: &CancellationToken,
        ) -> Result<(), ConnectionError> {
            Ok(())
        }
        async fn execute_seed_batch(&mut self, sql: &str, _cancel: &CancellationToken) -> Result<(), ConnectionError> {
            self.log.lock().await.push(sql.to_string());
            Ok(())
        }
        async fn dispose(&mut self) {}
    }

    struct RecordingFactory {
        log: Arc<AsyncMutex<Vec<String>>>,
        opens: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConnectionFactory for RecordingFactory {
        async fn open(&self, _cancel: &CancellationToken) -> Result<Box<dyn TargetConnection>, ConnectionError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingConnection { log: self.log.clone() }))
        }
    }

    fn module(name: &str, worker_id: i32, provides: &[&str], requires: &[&str], batches: &[&str]) -> SeedModule {
        SeedModule {
            name: name.to_string(),
            worker_id,
            batches: batches.iter().map(|s| s.to_string()).collect(),
            provides: provides.iter().map(|s| s.to_string()).collect(),
            requires: requires.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn empty_graph_is_a_no_op() {
        let graph = SeedGraph::build(vec![module("init", 0, &[], &[], &[])]).unwrap();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let opens = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(RecordingFactory { log, opens: opens.clone() });
        let limiter: Arc<dyn Limiter> = Arc::new(crate::limiter::NullLimiter);
        apply_seed(graph, factory, limiter, 2, CancellationToken::new()).await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn executes_all_modules_respecting_dependencies() {
        let modules = vec![
            module("init", 0, &[], &[], &["select 0;"]),
            module("Lookups", 0, &["lookups"], &[], &["select 1;"]),
            module("Orders", 0, &[], &["lookups"], &["select 2;"]),
        ];
        let graph = SeedGraph::build(modules).unwrap();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let opens = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(RecordingFactory { log: log.clone(), opens: opens.clone() });
        let limiter: Arc<dyn Limiter> = Arc::new(crate::limiter::SemaphoreLimiter::new(2, 2));
        apply_seed(graph, factory, limiter, 2, CancellationToken::new()).await.unwrap();

        let executed = log.lock().await;
        assert_eq!(executed.len(), 3);
        let lookups_pos = executed.iter().position(|s| s == "select 1;").unwrap();
        let orders_pos = executed.iter().position(|s| s == "select 2;").unwrap();
        assert!(lookups_pos < orders_pos);
    }

    #[tokio::test]
    async fn worker_all_module_runs_on_every_worker() {
        let modules = vec![
            module("init", 0, &[], &[], &[]),
            module("PerWorkerSetup", -1, &[], &[], &["select 'setup';"]),
        ];
        let graph = SeedGraph::build(modules).unwrap();
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let opens = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(RecordingFactory { log: log.clone(), opens: opens.clone() });
        let limiter: Arc<dyn Limiter> = Arc::new(crate::limiter::SemaphoreLimiter::new(3, 3));
        apply_seed(graph, factory, limiter, 3, CancellationToken::new()).await.unwrap();

        assert_eq!(opens.load(Ordering::SeqCst), 3);
        let executed = log.lock().await;
        assert_eq!(executed.iter().filter(|s| s.as_str() == "select 'setup';").count(), 3);
    }
}
