//! Task scheduling for the runtime.
//!
//! One `Scheduler` runs per host process; running several is safe because
//! materialization is gated by the backend's `schedule_checkpoint`
//! compare-and-set, not by anything this struct does locally. The loop here
//! keeps a familiar shape — shared state behind an async lock, a broadcast
//! channel for shutdown, a small state enum — built around a single
//! cooperative timer: one sleep against the earliest due entry, interruptible
//! by shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

use taskkit_core::{deterministic_task_id, Backend, Clock, ScheduleEntry, Task};

/// How long the scheduler sleeps when it has no entries at all — just a
/// poll bound, not a meaningful interval.
const IDLE_POLL: Duration = Duration::from_secs(3600);

struct ScheduledItem {
    entry: ScheduleEntry,
    next_fire_ts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Owns a set of [`ScheduleEntry`] values and materializes `Task`s from them
/// as their recurrence rules come due.
pub struct Scheduler {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    items: Mutex<Vec<ScheduledItem>>,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    /// `entries` are seeded with `last_fire_ts = 0`, so the first tick's
    /// catch-up pass (see [`Self::fire_due`]) walks each entry's recurrence
    /// forward from the epoch to the first slot at or after now — this is
    /// deliberately not a read of the backend's stored checkpoint (the
    /// `Backend` trait has no such read, only the `schedule_checkpoint`
    /// CAS): a locally-guessed `next_fire_ts` that undershoots the backend's
    /// true checkpoint just fails its CAS and the loop naturally advances
    /// past it without ever double-materializing.
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, tz: Tz, entries: Vec<ScheduleEntry>) -> Self {
        let items = entries
            .into_iter()
            .map(|entry| ScheduledItem { entry, next_fire_ts: 0 })
            .collect();
        Scheduler {
            backend,
            clock,
            tz,
            items: Mutex::new(items),
            state: Mutex::new(SchedulerState::Stopped),
        }
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.lock().await
    }

    /// Runs the scheduler loop until `shutdown_rx` fires. Each iteration
    /// sleeps until the earliest entry's `next_fire_ts`, or `IDLE_POLL` if
    /// there are no entries, racing that sleep against the shutdown signal.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        *self.state.lock().await = SchedulerState::Running;
        info!("scheduler starting");

        loop {
            let now = self.clock.now_ts();
            let sleep_for = self.time_until_next_wake(now).await;

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {
                    if let Err(err) = self.fire_due(now).await {
                        warn!(%err, "scheduler tick failed");
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("scheduler received shutdown signal");
                    break;
                }
            }
        }

        *self.state.lock().await = SchedulerState::Stopped;
        info!("scheduler stopped");
    }

    async fn time_until_next_wake(&self, now: u64) -> Duration {
        let items = self.items.lock().await;
        match items.iter().map(|item| item.next_fire_ts).min() {
            None => IDLE_POLL,
            Some(ts) if ts <= now => Duration::ZERO,
            Some(ts) => Duration::from_secs(ts - now),
        }
    }

    /// Advances every entry whose `next_fire_ts` is due, attempting
    /// materialization of the resulting task(s).
    async fn fire_due(&self, now: u64) -> anyhow::Result<()> {
        let mut items = self.items.lock().await;
        for item in items.iter_mut() {
            if item.next_fire_ts > now {
                continue;
            }

            if item.entry.fire_all_missed {
                while item.next_fire_ts <= now {
                    let target_ts = item.next_fire_ts;
                    self.try_materialize(&item.entry, target_ts).await?;
                    item.next_fire_ts = item.entry.recurrence.next_fire_ts(target_ts, self.tz);
                }
            } else {
                let mut last_due = None;
                while item.next_fire_ts <= now {
                    last_due = Some(item.next_fire_ts);
                    item.next_fire_ts = item
                        .entry
                        .recurrence
                        .next_fire_ts(item.next_fire_ts, self.tz);
                }
                if let Some(target_ts) = last_due {
                    self.try_materialize(&item.entry, target_ts).await?;
                }
            }
        }
        Ok(())
    }

    async fn try_materialize(&self, entry: &ScheduleEntry, target_ts: u64) -> anyhow::Result<()> {
        let checkpointed = self
            .backend
            .schedule_checkpoint(&entry.group, &entry.key, target_ts)
            .await?;

        if !checkpointed {
            trace!(group = %entry.group, key = %entry.key, target_ts, "checkpoint lost the race, skipping materialization");
            return Ok(());
        }

        let id = deterministic_task_id(&entry.group, &entry.key, target_ts);
        let task = Task::new(
            id,
            entry.group.clone(),
            entry.name.clone(),
            entry.data.clone(),
            target_ts,
            entry.ttl,
            self.clock.now_ts(),
        );
        self.backend.put_tasks(vec![task]).await?;
        debug!(group = %entry.group, key = %entry.key, target_ts, "materialized task");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;
    use taskkit_backend_memory::MemoryBackend;
    use taskkit_core::{Backend, FixedInterval, TestClock};

    fn entry(key: &str, period_secs: u64) -> ScheduleEntry {
        ScheduleEntry::new(
            key,
            "g",
            "noop",
            vec![],
            60,
            Box::new(FixedInterval { period_secs }),
        )
    }

    #[tokio::test]
    async fn fires_due_entry_and_advances_past_it() {
        let backend = MemoryBackend::new();
        let clock = Arc::new(TestClock::new(100));
        let scheduler = Scheduler::new(backend.clone(), clock.clone(), UTC, vec![entry("k", 50)]);

        scheduler.fire_due(100).await.unwrap();
        let claimed = backend.claim_tasks("g", 10, 100, 30, "w1").await.unwrap();
        assert_eq!(claimed.len(), 1);

        let items = scheduler.items.lock().await;
        assert_eq!(items[0].next_fire_ts, 100 + 50);
    }

    #[tokio::test]
    async fn coalesces_missed_fires_by_default() {
        let backend = MemoryBackend::new();
        let clock = Arc::new(TestClock::new(0));
        let scheduler = Scheduler::new(backend.clone(), clock.clone(), UTC, vec![entry("k", 10)]);

        // Jump far into the future before the first tick ever runs.
        scheduler.fire_due(1000).await.unwrap();

        // Only one task should have materialized, not ~100.
        let claimed = backend.claim_tasks("g", 1000, 1000, 30, "w1").await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn fire_all_missed_materializes_every_slot() {
        let backend = MemoryBackend::new();
        let clock = Arc::new(TestClock::new(0));
        let mut e = entry("k", 10);
        e.fire_all_missed = true;
        let scheduler = Scheduler::new(backend.clone(), clock.clone(), UTC, vec![e]);

        scheduler.fire_due(35).await.unwrap();
        let claimed = backend.claim_tasks("g", 1000, 1000, 30, "w1").await.unwrap();
        // slots at 0, 10, 20, 30 are all <= 35
        assert_eq!(claimed.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_schedulers_never_double_materialize_same_slot() {
        let backend = MemoryBackend::new();
        let clock = Arc::new(TestClock::new(100));
        let a = Scheduler::new(backend.clone(), clock.clone(), UTC, vec![entry("k", 50)]);
        let b = Scheduler::new(backend.clone(), clock.clone(), UTC, vec![entry("k", 50)]);

        a.fire_due(100).await.unwrap();
        b.fire_due(100).await.unwrap();

        let claimed = backend.claim_tasks("g", 10, 100, 30, "w1").await.unwrap();
        assert_eq!(claimed.len(), 1);
    }
}
