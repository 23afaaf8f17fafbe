//! The process host: composes one [`Scheduler`] and one or more per-group
//! [`WorkerPool`]s inside a single OS process, and routes control events from
//! the backend's event bus to both.
//!
//! One top-level owner holds a scheduler, a shutdown broadcast channel, and a
//! `run()` loop that `tokio::select!`s between work and a stop signal, with a
//! dedicated `shutdown()` that signals first and then waits — generalized
//! here to N independent worker pools, each individually pausable and
//! shutdownable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskkit_core::{Backend, Clock, Controller, Event, HandlerRegistry, ScheduleEntry};

use crate::scheduler::Scheduler;
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// How often `Backend::housekeeping` is called while a host is running.
const DEFAULT_HOUSEKEEPING_INTERVAL_SECS: u64 = 30;

/// How long a shutting-down host waits for in-flight work to finish before
/// abandoning it.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Everything a [`ProcessHost`] needs beyond a `Backend`/`HandlerRegistry`
/// pair: the recurrence entries its scheduler owns, the group/thread-count
/// topology for its worker pools, and the host's local timezone.
pub struct HostConfig {
    pub tz: Tz,
    pub schedule_entries: Vec<ScheduleEntry>,
    pub worker_pools: Vec<WorkerPoolConfig>,
    pub housekeeping_interval_secs: u64,
    pub shutdown_grace: Duration,
}

impl HostConfig {
    pub fn new(tz: Tz) -> Self {
        HostConfig {
            tz,
            schedule_entries: Vec::new(),
            worker_pools: Vec::new(),
            housekeeping_interval_secs: DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_schedule_entries(mut self, entries: Vec<ScheduleEntry>) -> Self {
        self.schedule_entries = entries;
        self
    }

    pub fn with_worker_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.worker_pools.push(pool);
        self
    }
}

/// The lifecycle a `ProcessHost` passes through. Distinct from
/// [`crate::scheduler::SchedulerState`]/worker states: this is the
/// whole-process view the Supervisor (or an embedding test) cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// One OS process's worth of runtime: a Scheduler, one `WorkerPool` per
/// configured group, and the event-routing loop that keeps them in sync
/// with pause/resume/shutdown events.
///
/// `is_alive()` and `is_active()` are both local to this struct
/// rather than observed across a process boundary: when a `ProcessHost` is
/// the thing actually running inside the OS process the Supervisor spawned,
/// "alive" and the OS process being alive are the same fact, so the
/// Supervisor itself checks liveness via `std::process::Child::try_wait`
/// (see `taskkit-supervisor`) rather than calling back into this struct.
/// These methods exist for embedding code -- tests, and any caller that
/// constructs a `ProcessHost` directly instead of through the supervisor --
/// that needs to observe the host's own view of its lifecycle.
pub struct ProcessHost {
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    tz: Tz,
    schedule_entries: Mutex<Vec<ScheduleEntry>>,
    pool_configs: Vec<WorkerPoolConfig>,
    housekeeping_interval_secs: u64,
    shutdown_grace: Duration,
    state: Mutex<HostState>,
    stop_tx: broadcast::Sender<()>,
}

impl ProcessHost {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: HostConfig,
    ) -> Self {
        let (stop_tx, _rx) = broadcast::channel(4);
        ProcessHost {
            backend,
            registry,
            clock,
            tz: config.tz,
            schedule_entries: Mutex::new(config.schedule_entries),
            pool_configs: config.worker_pools,
            housekeeping_interval_secs: config.housekeeping_interval_secs,
            shutdown_grace: config.shutdown_grace,
            state: Mutex::new(HostState::Stopped),
            stop_tx,
        }
    }

    pub async fn state(&self) -> HostState {
        *self.state.lock().await
    }

    /// OS-level liveness, from this struct's own point of view -- see the
    /// struct docs for why a Supervisor-spawned host doesn't rely on this.
    pub async fn is_alive(&self) -> bool {
        !matches!(self.state().await, HostState::Stopped)
    }

    /// Logically running: started, not in the middle of (or past) shutdown.
    pub async fn is_active(&self) -> bool {
        matches!(self.state().await, HostState::Running)
    }

    /// Requests termination from outside the host's own event loop -- used
    /// by an embedding process (e.g. a signal handler) as an alternative to
    /// a `shutdown` control event arriving through the backend.
    pub fn request_shutdown(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Runs until a `shutdown{groups: None}` event is observed on the
    /// backend's event bus or [`Self::request_shutdown`] is called, then
    /// drains: scheduler stops, worker pools finish their current task
    /// within the grace window, then are abandoned.
    pub async fn run(&self) -> anyhow::Result<()> {
        *self.state.lock().await = HostState::Starting;
        info!("process host starting");

        let controller = Controller::new(Arc::clone(&self.backend));
        let mut events = controller.subscribe().await?;

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
            self.tz,
            std::mem::take(&mut *self.schedule_entries.lock().await),
        ));
        let (scheduler_stop_tx, scheduler_stop_rx) = broadcast::channel(1);
        let scheduler_handle: JoinHandle<()> = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(scheduler_stop_rx).await })
        };

        let mut pools: HashMap<String, Arc<WorkerPool>> = HashMap::new();
        let mut pool_stop_txs: HashMap<String, broadcast::Sender<()>> = HashMap::new();
        let mut worker_handles: Vec<JoinHandle<()>> = Vec::new();
        for pool_config in &self.pool_configs {
            let group = pool_config.group.clone();
            let pool = WorkerPool::new(
                Arc::clone(&self.backend),
                Arc::clone(&self.registry),
                Arc::clone(&self.clock),
                WorkerPoolConfig {
                    group: pool_config.group.clone(),
                    thread_count: pool_config.thread_count,
                    lease_duration_secs: pool_config.lease_duration_secs,
                    lease_max_secs: pool_config.lease_max_secs,
                },
            );
            let (pool_stop_tx, _rx) = broadcast::channel(1);
            worker_handles.extend(pool.spawn(&pool_stop_tx));
            pool_stop_txs.insert(group.clone(), pool_stop_tx);
            pools.insert(group, pool);
        }

        let housekeeping_handle = self.spawn_housekeeping();

        let mut local_stop_rx = self.stop_tx.subscribe();
        *self.state.lock().await = HostState::Running;
        info!(groups = pools.len(), "process host running");

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if self.dispatch_event(&pools, &pool_stop_txs, event) {
                                break;
                            }
                        }
                        None => {
                            debug!("event subscription closed, shutting down host");
                            break;
                        }
                    }
                }
                _ = local_stop_rx.recv() => {
                    debug!("local shutdown requested");
                    break;
                }
            }
        }

        *self.state.lock().await = HostState::ShuttingDown;
        info!("process host shutting down");

        let _ = scheduler_stop_tx.send(());
        for tx in pool_stop_txs.values() {
            let _ = tx.send(());
        }
        housekeeping_handle.abort();

        let drain = async {
            let _ = scheduler_handle.await;
            for handle in worker_handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!("shutdown grace window elapsed, abandoning outstanding tasks");
        }

        *self.state.lock().await = HostState::Stopped;
        info!("process host stopped");
        Ok(())
    }

    /// Applies one control event. Returns `true` if the whole host should
    /// stop (a `shutdown` with `groups: None`).
    fn dispatch_event(
        &self,
        pools: &HashMap<String, Arc<WorkerPool>>,
        pool_stop_txs: &HashMap<String, broadcast::Sender<()>>,
        event: Event,
    ) -> bool {
        match event {
            Event::Pause { groups } => {
                for (group, pool) in pools {
                    if Event::applies_to(&groups, group) {
                        pool.set_paused(true);
                    }
                }
                false
            }
            Event::Resume { groups } => {
                for (group, pool) in pools {
                    if Event::applies_to(&groups, group) {
                        pool.set_paused(false);
                    }
                }
                false
            }
            Event::Shutdown { groups: None } => true,
            Event::Shutdown { groups: Some(groups) } => {
                for group in &groups {
                    if let Some(tx) = pool_stop_txs.get(group) {
                        debug!(%group, "stopping worker pool by targeted shutdown event");
                        let _ = tx.send(());
                    }
                }
                false
            }
        }
    }

    fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let clock = Arc::clone(&self.clock);
        let interval = Duration::from_secs(self.housekeeping_interval_secs.max(1));
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = backend.housekeeping(clock.now_ts()).await {
                            warn!(%err, "housekeeping pass failed");
                        }
                    }
                    _ = stop_rx.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono_tz::UTC;
    use taskkit_backend_memory::MemoryBackend;
    use taskkit_core::{Outcome, SystemClock, Task, TaskFailure, TaskHandler};

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, data: &[u8], _ctx: &taskkit_core::TaskContext) -> Result<Vec<u8>, TaskFailure> {
            Ok(data.to_vec())
        }
    }

    fn registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register("g", "echo", Echo);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn runs_a_claimed_task_to_completion_and_shuts_down_on_request() {
        let backend = MemoryBackend::new();
        let clock = Arc::new(SystemClock);
        let config = HostConfig::new(UTC).with_worker_pool(WorkerPoolConfig {
            group: "g".into(),
            thread_count: 1,
            lease_duration_secs: 5,
            lease_max_secs: 60,
        });
        let host = Arc::new(ProcessHost::new(backend.clone(), registry(), clock.clone(), config));

        let now = clock.now_ts();
        backend
            .put_tasks(vec![Task::new("t1".into(), "g", "echo", b"hi".to_vec(), now, 60, now)])
            .await
            .unwrap();

        let run_handle = {
            let host = Arc::clone(&host);
            tokio::spawn(async move { host.run().await })
        };

        // Give the worker pool a moment to claim and complete the task.
        for _ in 0..50 {
            if backend.get_result(&"t1".to_string()).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            backend.get_result(&"t1".to_string()).await.unwrap(),
            Some(Outcome::success(b"hi".to_vec()))
        );

        host.request_shutdown();
        run_handle.await.unwrap().unwrap();
        assert_eq!(host.state().await, HostState::Stopped);
    }

    #[tokio::test]
    async fn pause_event_stops_new_claims_until_resume() {
        let backend = MemoryBackend::new();
        let clock = Arc::new(SystemClock);
        let config = HostConfig::new(UTC).with_worker_pool(WorkerPoolConfig {
            group: "g".into(),
            thread_count: 1,
            lease_duration_secs: 5,
            lease_max_secs: 60,
        });
        let host = Arc::new(ProcessHost::new(backend.clone(), registry(), clock.clone(), config));

        backend.publish_event(taskkit_core::Event::pause_all()).await.unwrap();

        let run_handle = {
            let host = Arc::clone(&host);
            tokio::spawn(async move { host.run().await })
        };
        // Let the host's event loop observe the pause before enqueuing work.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let now = clock.now_ts();
        backend
            .put_tasks(vec![Task::new("t1".into(), "g", "echo", b"hi".to_vec(), now, 60, now)])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(backend.get_result(&"t1".to_string()).await.unwrap().is_none());

        backend.publish_event(taskkit_core::Event::resume_all()).await.unwrap();
        for _ in 0..50 {
            if backend.get_result(&"t1".to_string()).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            backend.get_result(&"t1".to_string()).await.unwrap(),
            Some(Outcome::success(b"hi".to_vec()))
        );

        host.request_shutdown();
        run_handle.await.unwrap().unwrap();
    }
}
