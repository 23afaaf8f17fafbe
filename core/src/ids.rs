//! Task id generation.

use crate::task::TaskId;

/// Deterministic id for a scheduler-materialized task: a content hash over
/// `(group, key, target_ts)`. Two hosts racing to materialize the same
/// schedule slot compute the same id, so `put_tasks`'s per-id idempotency
/// is what actually prevents the duplicate, not `schedule_checkpoint` alone.
///
/// Uses `blake3` rather than a second hashing scheme — the crate already
/// depends on it for config/content checksums.
pub fn deterministic_task_id(group: &str, key: &str, target_ts: u64) -> TaskId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(group.as_bytes());
    hasher.update(b"\0");
    hasher.update(key.as_bytes());
    hasher.update(b"\0");
    hasher.update(&target_ts.to_be_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Random id for an ad-hoc task submitted through `initiate_task`, which
/// has no schedule slot to derive determinism from.
pub fn random_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_id_is_stable() {
        let a = deterministic_task_id("g", "k", 1_000);
        let b = deterministic_task_id("g", "k", 1_000);
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_id_varies_with_inputs() {
        let a = deterministic_task_id("g", "k", 1_000);
        let b = deterministic_task_id("g", "k", 1_001);
        let c = deterministic_task_id("g", "k2", 1_000);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn random_ids_are_unique() {
        assert_ne!(random_task_id(), random_task_id());
    }
}
