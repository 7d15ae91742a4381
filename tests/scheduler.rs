//! Integration tests for the fleet-wide session scheduler (§4.1, §5), exercised
//! through the crate's public API rather than `session`'s own internal unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use flotilla_deploy::{
    ConnectionError, Limiter, Session, SessionError, SessionFailure, SessionOptions, Target, TargetApplicator, TargetGroup,
};

fn target(name: &str) -> Target {
    Target::new(format!("conn:{name}"), None, "fleet01", name)
}

struct CountingApplicator {
    fails: HashSet<String>,
    concurrent: Arc<AtomicUsize>,
    max_observed: Arc<AtomicUsize>,
}

#[async_trait]
impl TargetApplicator for CountingApplicator {
    async fn apply(&self, target: &Target, limiter: Arc<dyn Limiter>, cancel: CancellationToken) -> Result<(), SessionFailure> {
        let permit = limiter.acquire(&cancel).await.map_err(|e| ConnectionError::new("acquire", e))?;
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        if self.fails.contains(target.database_display_name()) {
            Err(ConnectionError::new("apply", std::io::Error::new(std::io::ErrorKind::Other, "boom")).into())
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn fleet_wide_apply_succeeds_when_every_target_succeeds() {
    let mut session = Session::new(SessionOptions::new().with_max_parallelism(4));
    let applicator: Arc<dyn TargetApplicator> = Arc::new(CountingApplicator {
        fails: HashSet::new(),
        concurrent: Arc::new(AtomicUsize::new(0)),
        max_observed: Arc::new(AtomicUsize::new(0)),
    });

    for name in ["Orders", "Billing", "Catalog"] {
        session.begin_applying(target(name), 2, applicator.clone());
    }

    let result = session.complete_applying(CancellationToken::new()).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn global_limiter_caps_concurrent_target_applies() {
    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let mut session = Session::new(SessionOptions::new().with_max_parallelism(2));
    let applicator: Arc<dyn TargetApplicator> = Arc::new(CountingApplicator {
        fails: HashSet::new(),
        concurrent: concurrent.clone(),
        max_observed: max_observed.clone(),
    });

    for name in ["A", "B", "C", "D", "E"] {
        session.begin_applying(target(name), 0, applicator.clone());
    }

    session.complete_applying(CancellationToken::new()).await.unwrap();
    assert!(max_observed.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn group_apply_reports_every_target_failure_once_threshold_allows_it() {
    let fails: HashSet<String> = ["Billing".to_string(), "Catalog".to_string()].into_iter().collect();
    let mut session = Session::new(SessionOptions::new().with_max_error_count(10));
    let applicator: Arc<dyn TargetApplicator> = Arc::new(CountingApplicator {
        fails,
        concurrent: Arc::new(AtomicUsize::new(0)),
        max_observed: Arc::new(AtomicUsize::new(0)),
    });

    let group = TargetGroup::new(vec![target("Orders"), target("Billing"), target("Catalog")], 3, 1).unwrap();
    session.begin_applying_group(group, applicator);

    let result = session.complete_applying(CancellationToken::new()).await;
    match result {
        Err(SessionError::Aggregate(errors)) => {
            let mut names: Vec<_> = errors.iter().map(|e| e.target.clone()).collect();
            names.sort();
            assert_eq!(names, vec!["fleet01.Billing".to_string(), "fleet01.Catalog".to_string()]);
        }
        other => panic!("expected Aggregate, got {other:?}"),
    }
}

#[tokio::test]
async fn crossing_max_error_count_cancels_targets_not_yet_started() {
    struct GatedApplicator {
        fails: HashSet<String>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl TargetApplicator for GatedApplicator {
        async fn apply(&self, target: &Target, _limiter: Arc<dyn Limiter>, cancel: CancellationToken) -> Result<(), SessionFailure> {
            if target.database_display_name() == "Orders" {
                // Fails immediately, crossing MaxErrorCount before Catalog starts.
            } else {
                tokio::select! {
                    _ = self.release.notified() => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
            if self.fails.contains(target.database_display_name()) {
                Err(ConnectionError::new("apply", std::io::Error::new(std::io::ErrorKind::Other, "boom")).into())
            } else {
                Ok(())
            }
        }
    }

    let mut session = Session::new(SessionOptions::new().with_max_error_count(0));
    let release = Arc::new(tokio::sync::Notify::new());
    let applicator: Arc<dyn TargetApplicator> = Arc::new(GatedApplicator {
        fails: ["Orders".to_string()].into_iter().collect(),
        release: release.clone(),
    });

    session.begin_applying(target("Orders"), 1, applicator.clone());
    session.begin_applying(target("Catalog"), 1, applicator);

    let result = session.complete_applying(CancellationToken::new()).await;
    release.notify_waiters();
    match result {
        Err(SessionError::Single(tagged)) => assert_eq!(tagged.target, "fleet01.Orders"),
        other => panic!("expected Single, got {other:?}"),
    }
}
