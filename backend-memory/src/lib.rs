//! In-memory reference `Backend`.
//!
//! State lives behind a `tokio::sync::Mutex`, the same shape a queue manager
//! holds behind a `rusqlite::Connection` elsewhere in this workspace — a
//! status per item, a retry/lease expiry column, and indexed lookups — just
//! held in plain `HashMap`s instead of SQL tables, since nothing here needs
//! to survive a process restart. The event bus is a `tokio::sync::broadcast`
//! channel standing in for cluster-wide pub/sub.
//!
//! Single-process only: this backend does not implement "cluster-wide" in
//! the sense of surviving an OS-process restart — see `taskkit-backend-sqlite`
//! for the implementation that does.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace, warn};

use taskkit_core::{
    backend::EventSubscription, Backend, BackendError, ClaimedTask, Clock, Event, Outcome,
    SystemClock, Task, TaskId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Pending,
    Claimed { worker_id: String, expires_ts: u64 },
}

struct Entry {
    task: Task,
    status: Status,
}

struct State {
    tasks: HashMap<TaskId, Entry>,
    results: HashMap<TaskId, (Outcome, u64)>, // (outcome, stored_at_ts) for retention
    checkpoints: HashMap<(String, String), u64>,
}

/// In-memory `Backend`. Cheap to clone (it's an `Arc` handle internally);
/// every clone shares the same state and event bus.
pub struct MemoryBackend {
    state: Mutex<State>,
    events_tx: broadcast::Sender<Event>,
    result_retention_secs: u64,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Construct with an injectable clock — tests that need precise control
    /// over result-retention timing use a `TestClock` here instead of
    /// sleeping for real.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::new_with(clock, 3600)
    }

    pub fn with_result_retention(result_retention_secs: u64) -> Arc<Self> {
        Self::new_with(Arc::new(SystemClock), result_retention_secs)
    }

    fn new_with(clock: Arc<dyn Clock>, result_retention_secs: u64) -> Arc<Self> {
        let (events_tx, _rx) = broadcast::channel(1024);
        Arc::new(MemoryBackend {
            state: Mutex::new(State {
                tasks: HashMap::new(),
                results: HashMap::new(),
                checkpoints: HashMap::new(),
            }),
            events_tx,
            result_retention_secs,
            clock,
        })
    }
}

struct BroadcastSubscription {
    rx: broadcast::Receiver<Event>,
}

#[async_trait]
impl EventSubscription for BroadcastSubscription {
    async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, some events were dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn put_tasks(&self, tasks: Vec<Task>) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        for task in tasks {
            state.tasks.entry(task.id.clone()).or_insert_with(|| Entry {
                task,
                status: Status::Pending,
            });
        }
        Ok(())
    }

    async fn claim_tasks(
        &self,
        group: &str,
        limit: usize,
        now_ts: u64,
        lease_duration_secs: u64,
        worker_id: &str,
    ) -> Result<Vec<ClaimedTask>, BackendError> {
        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();

        let candidate_ids: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(_, entry)| {
                entry.task.group == group
                    && entry.task.due_ts <= now_ts
                    && match &entry.status {
                        Status::Pending => true,
                        Status::Claimed { expires_ts, .. } => *expires_ts <= now_ts,
                    }
            })
            .map(|(id, _)| id.clone())
            .take(limit)
            .collect();

        let lease_expires_ts = now_ts + lease_duration_secs;
        for id in candidate_ids {
            if let Some(entry) = state.tasks.get_mut(&id) {
                entry.status = Status::Claimed {
                    worker_id: worker_id.to_string(),
                    expires_ts: lease_expires_ts,
                };
                claimed.push(ClaimedTask {
                    task: entry.task.clone(),
                    worker_id: worker_id.to_string(),
                    lease_expires_ts,
                });
            }
        }
        trace!(group, claimed = claimed.len(), "claimed tasks");
        Ok(claimed)
    }

    async fn renew_lease(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        new_expiry_ts: u64,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(task_id) {
            Some(entry) => match &mut entry.status {
                Status::Claimed {
                    worker_id: held_by,
                    expires_ts,
                } if held_by == worker_id => {
                    *expires_ts = new_expiry_ts;
                    Ok(true)
                }
                _ => Ok(false),
            },
            None => Ok(false),
        }
    }

    async fn complete_task(&self, task_id: &TaskId, outcome: Outcome) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.tasks.remove(task_id);
        let now = self.clock.now_ts();
        state.results.insert(task_id.clone(), (outcome, now));
        Ok(())
    }

    async fn discard_task(&self, task_id: &TaskId, reason: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.tasks.remove(task_id);
        let now = self.clock.now_ts();
        state.results.insert(
            task_id.clone(),
            (Outcome::Discarded { reason: reason.to_string() }, now),
        );
        Ok(())
    }

    async fn get_result(&self, task_id: &TaskId) -> Result<Option<Outcome>, BackendError> {
        let state = self.state.lock().await;
        Ok(state.results.get(task_id).map(|(outcome, _)| outcome.clone()))
    }

    async fn publish_event(&self, event: Event) -> Result<(), BackendError> {
        // No subscribers is not an error: events published with nobody
        // listening are simply dropped, same as the sqlite backend's
        // equivalent case of every subscriber having polled past them.
        let _ = self.events_tx.send(event);
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<Box<dyn EventSubscription>, BackendError> {
        Ok(Box::new(BroadcastSubscription {
            rx: self.events_tx.subscribe(),
        }))
    }

    async fn schedule_checkpoint(
        &self,
        group: &str,
        key: &str,
        last_fired_ts: u64,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        let checkpoint_key = (group.to_string(), key.to_string());
        let current = state.checkpoints.get(&checkpoint_key).copied().unwrap_or(0);
        if last_fired_ts > current {
            state.checkpoints.insert(checkpoint_key, last_fired_ts);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn housekeeping(&self, now_ts: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;

        let expired_ids: Vec<TaskId> = state
            .tasks
            .iter()
            .filter(|(_, entry)| entry.task.is_expired(now_ts))
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired_ids {
            state.tasks.remove(&id);
            state.results.insert(id, (Outcome::Expired, now_ts));
        }

        // Reclaim leases whose holder never renewed in time — they just go
        // back to Pending; claim_tasks already treats an expired lease as
        // claimable, this pass just makes the state visible to inspection.
        for entry in state.tasks.values_mut() {
            if let Status::Claimed { expires_ts, .. } = entry.status {
                if expires_ts <= now_ts {
                    entry.status = Status::Pending;
                }
            }
        }

        let retention = self.result_retention_secs;
        state
            .results
            .retain(|_, (_, stored_at)| now_ts.saturating_sub(*stored_at) < retention);

        debug!(now_ts, "housekeeping pass complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskkit_core::clock::Clock as _;

    fn task(id: &str, group: &str, due_ts: u64) -> Task {
        Task::new(id.into(), group, "noop", vec![], due_ts, 60, due_ts)
    }

    #[tokio::test]
    async fn put_tasks_is_idempotent_per_id() {
        let backend = MemoryBackend::new();
        backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
        backend
            .put_tasks(vec![Task::new("t1".into(), "g", "different", vec![1], 0, 60, 0)])
            .await
            .unwrap();
        let claimed = backend.claim_tasks("g", 10, 0, 30, "w1").await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task.name, "noop");
    }

    #[tokio::test]
    async fn claim_tasks_is_disjoint_across_concurrent_claimers() {
        let backend = MemoryBackend::new();
        backend
            .put_tasks(vec![task("t1", "g", 0), task("t2", "g", 0)])
            .await
            .unwrap();

        let a = backend.claim_tasks("g", 10, 0, 30, "worker-a").await.unwrap();
        let b = backend.claim_tasks("g", 10, 0, 30, "worker-b").await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 0);
    }

    #[tokio::test]
    async fn lease_renewal_requires_holding_worker() {
        let backend = MemoryBackend::new();
        backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
        backend.claim_tasks("g", 10, 0, 30, "worker-a").await.unwrap();

        assert!(!backend
            .renew_lease(&"t1".to_string(), "worker-b", 100)
            .await
            .unwrap());
        assert!(backend
            .renew_lease(&"t1".to_string(), "worker-a", 100)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_lease_becomes_reclaimable() {
        let backend = MemoryBackend::new();
        backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
        backend.claim_tasks("g", 10, 0, 10, "worker-a").await.unwrap();

        // lease expired at ts=10; claiming at ts=20 should succeed again.
        let reclaimed = backend.claim_tasks("g", 10, 20, 30, "worker-b").await.unwrap();
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn schedule_checkpoint_is_strictly_monotonic() {
        let backend = MemoryBackend::new();
        assert!(backend.schedule_checkpoint("g", "k", 100).await.unwrap());
        assert!(!backend.schedule_checkpoint("g", "k", 100).await.unwrap());
        assert!(!backend.schedule_checkpoint("g", "k", 50).await.unwrap());
        assert!(backend.schedule_checkpoint("g", "k", 101).await.unwrap());
    }

    #[tokio::test]
    async fn complete_task_stores_result_and_releases_lease() {
        let backend = MemoryBackend::new();
        backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
        backend.claim_tasks("g", 10, 0, 30, "worker-a").await.unwrap();
        backend
            .complete_task(&"t1".to_string(), Outcome::success(b"done".to_vec()))
            .await
            .unwrap();

        let result = backend.get_result(&"t1".to_string()).await.unwrap();
        assert_eq!(result, Some(Outcome::success(b"done".to_vec())));
        // Completed tasks are no longer claimable.
        let reclaimed = backend.claim_tasks("g", 10, 100, 30, "worker-b").await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn housekeeping_expires_unrun_tasks_past_deadline() {
        let backend = MemoryBackend::new();
        backend.put_tasks(vec![task("t1", "g", 0)]).await.unwrap();
        backend.housekeeping(100).await.unwrap();
        let result = backend.get_result(&"t1".to_string()).await.unwrap();
        assert_eq!(result, Some(Outcome::Expired));
    }

    #[tokio::test]
    async fn publish_and_subscribe_round_trips_events() {
        let backend = MemoryBackend::new();
        let mut sub = backend.subscribe_events().await.unwrap();
        backend.publish_event(Event::pause_all()).await.unwrap();
        assert_eq!(sub.recv().await, Some(Event::pause_all()));
    }

    #[tokio::test]
    async fn conforms_to_the_shared_backend_contract() {
        taskkit_core::test_support::run_all(|| {
            MemoryBackend::new() as Arc<dyn taskkit_core::Backend>
        })
        .await;
    }
}
