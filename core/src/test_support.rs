//! Shared conformance checks for `Backend` implementations.
//!
//! Each reference backend is a materially different implementation of the
//! same atomicity contract; rather than writing one bespoke test suite per
//! backend and hoping they drift in sync, this module holds the contract's
//! assertions once and both backend crates' own test modules run them
//! against their own instance. Gated behind the `test-support` feature so
//! it never ships in a release build of this crate.

use std::sync::Arc;

use crate::backend::Backend;
use crate::event::Event;
use crate::outcome::Outcome;
use crate::task::Task;

fn task(id: &str, group: &str, due_ts: u64) -> Task {
    Task::new(id.into(), group, "noop", vec![], due_ts, 60, due_ts)
}

/// `put_tasks` is a no-op for an id that already exists, rather than
/// overwriting it.
pub async fn assert_put_tasks_is_idempotent(backend: &dyn Backend) {
    backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
    backend
        .put_tasks(vec![Task::new("t1".into(), "g", "different", vec![1], 0, 60, 0)])
        .await
        .unwrap();
    let claimed = backend.claim_tasks("g", 10, 0, 30, "w1").await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].task.name, "noop");
}

/// Two concurrent claimers in the same group never observe overlapping
/// result sets.
pub async fn assert_claim_tasks_is_disjoint(backend: &dyn Backend) {
    backend
        .put_tasks(vec![task("t1", "g", 0), task("t2", "g", 0)])
        .await
        .unwrap();
    let a = backend.claim_tasks("g", 10, 0, 30, "worker-a").await.unwrap();
    let b = backend.claim_tasks("g", 10, 0, 30, "worker-b").await.unwrap();
    assert_eq!(a.len(), 2);
    assert!(b.is_empty());
}

/// A lease that expires without being renewed returns its task to the
/// claimable pool.
pub async fn assert_expired_lease_is_reclaimable(backend: &dyn Backend) {
    backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
    backend.claim_tasks("g", 10, 0, 10, "worker-a").await.unwrap();
    let reclaimed = backend.claim_tasks("g", 10, 20, 30, "worker-b").await.unwrap();
    assert_eq!(reclaimed.len(), 1);
}

/// `renew_lease` only succeeds for the worker currently holding the lease.
pub async fn assert_renew_lease_requires_holding_worker(backend: &dyn Backend) {
    backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
    backend.claim_tasks("g", 10, 0, 30, "worker-a").await.unwrap();
    assert!(!backend.renew_lease(&"t1".to_string(), "worker-b", 100).await.unwrap());
    assert!(backend.renew_lease(&"t1".to_string(), "worker-a", 100).await.unwrap());
}

/// `schedule_checkpoint` is a strict compare-and-set: only a strictly larger
/// timestamp than the stored one succeeds.
pub async fn assert_schedule_checkpoint_is_strict_cas(backend: &dyn Backend) {
    assert!(backend.schedule_checkpoint("g", "k", 100).await.unwrap());
    assert!(!backend.schedule_checkpoint("g", "k", 100).await.unwrap());
    assert!(!backend.schedule_checkpoint("g", "k", 50).await.unwrap());
    assert!(backend.schedule_checkpoint("g", "k", 101).await.unwrap());
}

/// A completed task stores its outcome and can never be claimed again.
pub async fn assert_complete_task_stores_result_and_releases_lease(backend: &dyn Backend) {
    backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
    backend.claim_tasks("g", 10, 0, 30, "worker-a").await.unwrap();
    backend
        .complete_task(&"t1".to_string(), Outcome::success(b"done".to_vec()))
        .await
        .unwrap();

    let result = backend.get_result(&"t1".to_string()).await.unwrap();
    assert_eq!(result, Some(Outcome::success(b"done".to_vec())));
    let reclaimed = backend.claim_tasks("g", 10, 100, 30, "worker-b").await.unwrap();
    assert!(reclaimed.is_empty());
}

/// `housekeeping` expires tasks that were never claimed before their
/// deadline passed.
pub async fn assert_housekeeping_expires_unrun_tasks_past_deadline(backend: &dyn Backend) {
    backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
    backend.housekeeping(100).await.unwrap();
    let result = backend.get_result(&"t1".to_string()).await.unwrap();
    assert_eq!(result, Some(Outcome::Expired));
}

/// A subscriber started before an event is published observes it.
pub async fn assert_publish_and_subscribe_round_trips_events(backend: &dyn Backend) {
    let mut sub = backend.subscribe_events().await.unwrap();
    backend.publish_event(Event::pause_all()).await.unwrap();
    assert_eq!(sub.recv().await, Some(Event::pause_all()));
}

/// Runs every conformance check above against a fresh `backend`, in
/// isolation from one another so earlier checks' state never leaks into
/// later ones. Call this once per backend implementation, with a factory
/// that returns a clean instance each time.
pub async fn run_all(new_backend: impl Fn() -> Arc<dyn Backend>) {
    assert_put_tasks_is_idempotent(new_backend().as_ref()).await;
    assert_claim_tasks_is_disjoint(new_backend().as_ref()).await;
    assert_expired_lease_is_reclaimable(new_backend().as_ref()).await;
    assert_renew_lease_requires_holding_worker(new_backend().as_ref()).await;
    assert_schedule_checkpoint_is_strict_cas(new_backend().as_ref()).await;
    assert_complete_task_stores_result_and_releases_lease(new_backend().as_ref()).await;
    assert_housekeeping_expires_unrun_tasks_past_deadline(new_backend().as_ref()).await;
    assert_publish_and_subscribe_round_trips_events(new_backend().as_ref()).await;
}
