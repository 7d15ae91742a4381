//! The fleet-wide deployment session (§4.1): accepts target/group registrations,
//! composes parallelism limiters, aggregates per-target errors, and drives
//! cancellation across every in-flight apply.
//!
//! Grounded on the same `tokio::spawn` + collect-and-await-all shape the corpus's
//! Postgres fleet-migration tool uses for `phase_dump_all`/`phase_restore_all`:
//! registration (`begin_applying*`) only constructs and spawns a task and never
//! suspends (§5); `complete_applying` is the sole `async fn` that awaits everything.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{SessionError, SessionFailure, TaggedError};
use crate::limiter::{CompositeLimiter, Limiter, SemaphoreLimiter};
use crate::target::{Target, TargetGroup};

/// Session-wide configuration (§1.1, §3.1), in the style of `refinery_core::config::Config`:
/// a plain, `serde`-derivable struct with a fluent `with_*` builder API.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SessionOptions {
    /// Global cap on concurrently running per-action operations. `0` means
    /// "use the logical CPU count."
    pub max_parallelism: usize,
    /// Cap on concurrent per-action operations for any one target. `0` means
    /// "use the logical CPU count."
    pub max_parallelism_per_target: usize,
    /// Threshold of tolerated failed targets before the session cancels remaining work.
    pub max_error_count: usize,
    /// Suppresses side effects at the connection layer (§4.7).
    pub is_what_if_mode: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            max_parallelism: 0,
            max_parallelism_per_target: 0,
            max_error_count: 0,
            is_what_if_mode: false,
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_parallelism(mut self, value: usize) -> Self {
        self.max_parallelism = value;
        self
    }

    pub fn with_max_parallelism_per_target(mut self, value: usize) -> Self {
        self.max_parallelism_per_target = value;
        self
    }

    pub fn with_max_error_count(mut self, value: usize) -> Self {
        self.max_error_count = value;
        self
    }

    pub fn with_what_if_mode(mut self, value: bool) -> Self {
        self.is_what_if_mode = value;
        self
    }

    fn effective_max_parallelism(&self) -> usize {
        effective_or_cpus(self.max_parallelism)
    }
}

fn effective_or_cpus(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get()
    } else {
        requested
    }
}

/// Strategy object standing in for the source design's mutable-base-class
/// `ApplyCoreAsync` override (§9 design note): the session drives parallelism and
/// error handling, the caller supplies *what* an apply against one target does.
#[async_trait]
pub trait TargetApplicator: Send + Sync {
    async fn apply(&self, target: &Target, limiter: Arc<dyn Limiter>, cancel: CancellationToken) -> Result<(), SessionFailure>;
}

/// A fleet-wide deployment session. Owns the cancellation token every registered
/// apply observes, the global parallelism limiter, and the running error tally.
pub struct Session {
    cancel: CancellationToken,
    global_limiter: Arc<dyn Limiter>,
    options: SessionOptions,
    error_count: Arc<AtomicUsize>,
    errors: Arc<Mutex<Vec<TaggedError>>>,
    handles: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        let effective = options.effective_max_parallelism();
        let global_limiter: Arc<dyn Limiter> = Arc::new(SemaphoreLimiter::new(effective, effective));
        Session {
            cancel: CancellationToken::new(),
            global_limiter,
            options,
            error_count: Arc::new(AtomicUsize::new(0)),
            errors: Arc::new(Mutex::new(Vec::new())),
            handles: Vec::new(),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// `HasErrors` (§4.1): observable while the session is still running.
    pub fn has_errors(&self) -> bool {
        self.error_count.load(Ordering::SeqCst) > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Explicit cancellation, for tests (§5: "`Cancel()` for tests").
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Registers a single-target apply with an explicit per-target action parallelism
    /// cap (§4.1: `BeginApplying(target, maxParallelism)`). Synchronous: only
    /// constructs the composed limiter and spawns a task.
    pub fn begin_applying(&mut self, target: Target, max_parallelism_per_target: usize, applicator: Arc<dyn TargetApplicator>) {
        let effective = effective_or_cpus(max_parallelism_per_target);
        let per_target: Arc<dyn Limiter> = Arc::new(SemaphoreLimiter::new(max_parallelism_per_target, effective));
        let limiter: Arc<dyn Limiter> = Arc::new(CompositeLimiter::new(self.global_limiter.clone(), per_target));
        self.spawn_target(target, limiter, applicator);
    }

    /// Registers a group apply (§4.1): one task per target in the group, each bounded
    /// by `min(global, groupPerTarget)` via a three-way composed limiter (§4.2). Every
    /// target's task is spawned immediately rather than gated behind a separate
    /// "max parallel targets" governor — see DESIGN.md ("group fan-out width").
    pub fn begin_applying_group(&mut self, group: TargetGroup, applicator: Arc<dyn TargetApplicator>) {
        let group_limiter: Arc<dyn Limiter> =
            Arc::new(SemaphoreLimiter::new(group.max_parallelism(), group.max_parallelism()));
        for target in group.targets().to_vec() {
            let per_target_limit = group.max_parallelism_per_target();
            let per_target: Arc<dyn Limiter> = Arc::new(SemaphoreLimiter::new(per_target_limit, per_target_limit));
            let group_and_global: Arc<dyn Limiter> = Arc::new(CompositeLimiter::new(self.global_limiter.clone(), group_limiter.clone()));
            let limiter: Arc<dyn Limiter> = Arc::new(CompositeLimiter::new(group_and_global, per_target));
            self.spawn_target(target, limiter, applicator.clone());
        }
    }

    fn spawn_target(&mut self, target: Target, limiter: Arc<dyn Limiter>, applicator: Arc<dyn TargetApplicator>) {
        let cancel = self.cancel.clone();
        let error_count = self.error_count.clone();
        let errors = self.errors.clone();
        let max_error_count = self.options.max_error_count;
        let session_cancel = self.cancel.clone();
        let full_name = target.full_display_name();

        let handle = tokio::spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = applicator.apply(&target, limiter, cancel.clone()).await {
                if cancel.is_cancelled() {
                    // A failing apply can race a cancellation that was already in
                    // flight; treat that as a graceful stop, not a reported error.
                    return;
                }
                let tagged = TaggedError::new(full_name, err);
                log::error!(target: "flotilla::session", "{tagged}");
                errors.lock().await.push(tagged);
                let n = error_count.fetch_add(1, Ordering::SeqCst) + 1;
                if n > max_error_count {
                    session_cancel.cancel();
                }
            }
        });
        self.handles.push(handle);
    }

    /// Awaits completion of every registered apply (§4.1). `external_cancel` is
    /// additionally observed for the duration of the wait.
    pub async fn complete_applying(mut self, external_cancel: CancellationToken) -> Result<(), SessionError> {
        let handles = std::mem::take(&mut self.handles);

        let watched_cancel = self.cancel.clone();
        let watcher = tokio::spawn(async move {
            external_cancel.cancelled().await;
            watched_cancel.cancel();
        });

        for handle in handles {
            let _ = handle.await;
        }
        watcher.abort();

        let was_cancelled = self.cancel.is_cancelled();
        let mut guard = self.errors.lock().await;
        let errors = std::mem::take(&mut *guard);
        drop(guard);

        if was_cancelled && errors.is_empty() {
            return Err(SessionError::Cancelled);
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(SessionError::Single(errors.into_iter().next().expect("len == 1"))),
            _ => Err(SessionError::Aggregate(errors)),
        }
    }
}
