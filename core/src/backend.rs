//! The `Backend` contract — the durable store and event bus every other
//! component is built on top of.

use async_trait::async_trait;

use crate::error::BackendError;
use crate::event::Event;
use crate::outcome::Outcome;
use crate::task::{ClaimedTask, Task, TaskId};

/// A live subscription to the backend's event bus, obtained from
/// `Backend::subscribe_events`. Delivery is at-least-once to every *live*
/// subscriber; a subscription that starts after an event was published does
/// not see it.
///
/// This is a hand-rolled async iterator rather than a `futures::Stream`
/// object: the crate has no other use for the `futures` ecosystem, and a
/// single `recv` method is all the Controller and process host need.
#[async_trait]
pub trait EventSubscription: Send {
    /// Waits for the next event. Returns `None` once the subscription is
    /// permanently closed (the backend handle it was created from was
    /// dropped).
    async fn recv(&mut self) -> Option<Event>;
}

/// The durable store and event bus a Scheduler, worker pool, and Controller
/// are built against. Two reference implementations ship with this crate —
/// see `taskkit-backend-memory` and `taskkit-backend-sqlite` — but the trait
/// itself is the stable contract; nothing else in this crate depends on
/// which implementation is behind it.
///
/// Atomicity obligations are documented per method; an implementation that
/// violates one breaks invariants the rest of the kit relies on (most
/// importantly: `claim_tasks` must be serializable per group, and
/// `schedule_checkpoint` must be a true compare-and-set).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Durably insert `tasks`. Idempotent per id: a task whose id already
    /// exists is a no-op for that id, so a scheduler materializing the same
    /// slot twice (e.g. after a restart) can't double-insert.
    async fn put_tasks(&self, tasks: Vec<Task>) -> Result<(), BackendError>;

    /// Atomically select up to `limit` tasks in `group` with `due_ts <=
    /// now_ts` that are not currently leased, mark them leased until
    /// `now_ts + lease_duration_secs`, and return them. Serializable per
    /// group: two concurrent callers never observe overlapping result sets.
    async fn claim_tasks(
        &self,
        group: &str,
        limit: usize,
        now_ts: u64,
        lease_duration_secs: u64,
        worker_id: &str,
    ) -> Result<Vec<ClaimedTask>, BackendError>;

    /// Extends a held lease. Returns `false` (not an error) if the lease was
    /// already lost — the caller must treat the task as no longer theirs.
    async fn renew_lease(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        new_expiry_ts: u64,
    ) -> Result<bool, BackendError>;

    /// Stores `outcome`, releases the lease, and prevents re-claim.
    async fn complete_task(&self, task_id: &TaskId, outcome: Outcome) -> Result<(), BackendError>;

    /// Terminal, no retry. Stores `Outcome::Discarded { reason }`.
    async fn discard_task(&self, task_id: &TaskId, reason: &str) -> Result<(), BackendError>;

    /// Read-only. `None` means pending (still in flight or not yet claimed).
    async fn get_result(&self, task_id: &TaskId) -> Result<Option<Outcome>, BackendError>;

    /// Publishes an event to every live subscriber, cluster-wide.
    async fn publish_event(&self, event: Event) -> Result<(), BackendError>;

    /// Subscribes to the event bus from this point forward.
    async fn subscribe_events(&self) -> Result<Box<dyn EventSubscription>, BackendError>;

    /// Compare-and-set: succeeds only if the currently stored checkpoint for
    /// `(group, key)` is strictly less than `last_fired_ts`. This is the
    /// sole serialization point preventing double materialization of a
    /// recurring schedule entry across the whole cluster.
    async fn schedule_checkpoint(
        &self,
        group: &str,
        key: &str,
        last_fired_ts: u64,
    ) -> Result<bool, BackendError>;

    /// Reclaims expired leases (returning those tasks to pending), deletes
    /// results past their retention window, and removes expired-but-un-run
    /// tasks. Called periodically by a process host, not safety-critical to
    /// call often — a missed housekeeping pass just delays cleanup.
    async fn housekeeping(&self, now_ts: u64) -> Result<(), BackendError>;
}
