//! The `Task` data model.

use serde::{Deserialize, Serialize};

/// A soft deadline applied when a schedule entry or `initiate_task` call
/// doesn't specify one.
pub const DEFAULT_TASK_TTL_SECS: u64 = 300;

/// Opaque unique task identifier. Deterministic ids (scheduler-materialized
/// tasks) and random ids (`initiate_task` ad-hoc calls) share this type.
pub type TaskId = String;

/// A single unit of work, durable once `put_tasks` has accepted it.
///
/// `state` is intentionally absent as a field: it's observable via which
/// Backend operation last touched the task (claimed vs. completed vs.
/// discarded), not a column every backend must maintain identically. See
/// [`TaskState`] for the abstract transition the worker pool reasons about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub group: String,
    pub name: String,
    pub data: Vec<u8>,
    pub due_ts: u64,
    pub ttl: u64,
    pub created_ts: u64,
}

impl Task {
    /// Construct a task, asserting the invariants `due_ts >= created_ts` and
    /// `ttl > 0`.
    pub fn new(
        id: TaskId,
        group: impl Into<String>,
        name: impl Into<String>,
        data: Vec<u8>,
        due_ts: u64,
        ttl: u64,
        created_ts: u64,
    ) -> Self {
        assert!(due_ts >= created_ts, "due_ts must not precede created_ts");
        assert!(ttl > 0, "ttl must be positive");
        Task {
            id,
            group: group.into(),
            name: name.into(),
            data,
            due_ts,
            ttl,
            created_ts,
        }
    }

    /// The instant beyond which an in-flight or un-run task is expired.
    pub fn expires_at(&self) -> u64 {
        self.due_ts + self.ttl
    }

    pub fn is_expired(&self, now_ts: u64) -> bool {
        now_ts >= self.expires_at()
    }
}

/// Abstract lifecycle state a task passes through. Backends aren't required
/// to store this literally, but reference implementations do, since it's
/// the cheapest way to implement `claim_tasks`/`housekeeping` correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Claimed,
    Done,
    Failed,
    Expired,
    Discarded,
}

/// A task as returned by `claim_tasks`, paired with the lease a worker now
/// holds on it. The lease triple (`task_id`, `worker_id`, `expires_ts`) is
/// folded into this rather than kept as a free-standing type, since it never
/// appears outside the context of a just-claimed task.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: Task,
    pub worker_id: String,
    pub lease_expires_ts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_at_adds_ttl_to_due() {
        let task = Task::new("t1".into(), "g", "n", vec![], 100, 30, 90);
        assert_eq!(task.expires_at(), 130);
        assert!(!task.is_expired(129));
        assert!(task.is_expired(130));
    }

    #[test]
    #[should_panic(expected = "due_ts")]
    fn rejects_due_before_created() {
        Task::new("t1".into(), "g", "n", vec![], 10, 30, 20);
    }

    #[test]
    #[should_panic(expected = "ttl")]
    fn rejects_zero_ttl() {
        Task::new("t1".into(), "g", "n", vec![], 10, 0, 10);
    }
}
