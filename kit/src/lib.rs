//! The façade crate: ties a `Backend`, a `HandlerRegistry`, and the
//! runtime/supervisor crates together behind the handful of entry points a
//! caller actually needs — submit a task, start some hosts, signal a
//! running cluster.
//!
//! Built around the idea of "the one struct a `main()` constructs and calls
//! one method on"; this crate is the front door for a whole cluster of
//! hosts instead of a single process.

use std::collections::HashMap;
use std::sync::Arc;

use chrono_tz::Tz;
use tracing::info;

use taskkit_core::{
    Backend, BackendError, Clock, Controller, Event, HandlerRegistry, Outcome, ScheduleEntry,
    SystemClock, Task, DEFAULT_TASK_TTL_SECS,
};
use taskkit_runtime::{EagerWorker, HostConfig, ProcessHost, WorkerPoolConfig};
pub use taskkit_supervisor::{
    HostHandle, HostLauncher, NeverForceRestart, ReExecLauncher, RestartPolicy, Supervisor,
};

/// How long a claimed task's lease lasts before it must be renewed, for
/// hosts started through the convenience entry points below. Callers that
/// need per-group tuning build a [`HostConfig`]/[`ProcessHost`] directly
/// instead of going through `Kit`.
const DEFAULT_LEASE_DURATION_SECS: u64 = 30;
const DEFAULT_LEASE_MAX_SECS: u64 = 3600;
const DEFAULT_HOUSEKEEPING_INTERVAL_SECS: u64 = 30;

/// The handful of per-host knobs every group shares when a host is built
/// through `Kit` rather than directly through [`HostConfig`]. Mirrors the
/// tuning fields the demo binary's configuration file exposes.
#[derive(Debug, Clone, Copy)]
pub struct HostTuning {
    pub lease_duration_secs: u64,
    pub lease_max_secs: u64,
    pub housekeeping_interval_secs: u64,
}

impl Default for HostTuning {
    fn default() -> Self {
        HostTuning {
            lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
            lease_max_secs: DEFAULT_LEASE_MAX_SECS,
            housekeeping_interval_secs: DEFAULT_HOUSEKEEPING_INTERVAL_SECS,
        }
    }
}

/// The façade: a backend, a handler registry, and the clock they were
/// built against. Every `Kit` method is a thin composition of the
/// `taskkit-core`/`taskkit-runtime`/`taskkit-supervisor` primitives; none
/// of them hold state `Kit` doesn't already expose through its fields.
pub struct Kit {
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
}

impl Kit {
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<HandlerRegistry>) -> Self {
        Kit {
            backend,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(backend: Arc<dyn Backend>, registry: Arc<HandlerRegistry>, clock: Arc<dyn Clock>) -> Self {
        Kit { backend, registry, clock }
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    fn pool_configs(
        &self,
        threads_per_group: &HashMap<String, usize>,
        tuning: HostTuning,
    ) -> Vec<WorkerPoolConfig> {
        threads_per_group
            .iter()
            .map(|(group, &thread_count)| WorkerPoolConfig {
                group: group.clone(),
                thread_count,
                lease_duration_secs: tuning.lease_duration_secs,
                lease_max_secs: tuning.lease_max_secs,
            })
            .collect()
    }

    /// Submits `(group, name, data)`. `due_ts` defaults to now; `ttl`
    /// defaults to [`DEFAULT_TASK_TTL_SECS`]. With `eager = true` the
    /// backend is bypassed entirely and the handler runs synchronously in
    /// the caller; the returned `Outcome` is never `Pending` in that case
    /// since there is nothing asynchronous to wait on.
    ///
    /// Non-eager calls return as soon as the task is durably enqueued; the
    /// `Outcome` will read back `Pending`-equivalent (`get_result` ==
    /// `None`) until a worker completes it.
    pub async fn initiate_task(
        &self,
        group: &str,
        name: &str,
        data: Vec<u8>,
        due_ts: Option<u64>,
        ttl: Option<u64>,
        eager: bool,
    ) -> Result<Option<Outcome>, BackendError> {
        let ttl = ttl.unwrap_or(DEFAULT_TASK_TTL_SECS);

        if eager {
            let worker = EagerWorker::new(Arc::clone(&self.registry), Arc::clone(&self.clock));
            return Ok(Some(worker.run(group, name, &data, Some(ttl)).await));
        }

        let now = self.clock.now_ts();
        let due_ts = due_ts.unwrap_or(now);
        let id = taskkit_core::random_task_id();
        let task = Task::new(id, group, name, data, due_ts, ttl, now);
        self.backend.put_tasks(vec![task]).await?;
        Ok(None)
    }

    pub async fn get_result(&self, task_id: &str) -> Result<Option<Outcome>, BackendError> {
        self.backend.get_result(&task_id.to_string()).await
    }

    fn controller(&self) -> Controller {
        Controller::new(Arc::clone(&self.backend))
    }

    pub async fn send_shutdown_event(&self, groups: Option<std::collections::HashSet<String>>) -> Result<(), BackendError> {
        self.controller().shutdown(groups).await
    }

    pub async fn send_pause_event(&self, groups: Option<std::collections::HashSet<String>>) -> Result<(), BackendError> {
        self.controller().pause(groups).await
    }

    pub async fn send_resume_event(&self, groups: Option<std::collections::HashSet<String>>) -> Result<(), BackendError> {
        self.controller().resume(groups).await
    }

    /// Publishes a bare [`Event`] directly, for callers that already built
    /// one (e.g. the demo binary's one-shot operator commands).
    pub async fn send_event(&self, event: Event) -> Result<(), BackendError> {
        self.controller().send_event(event).await
    }

    /// Builds the one [`ProcessHost`] a single OS process hosts, wired to
    /// this `Kit`'s backend and registry, but does not run it.
    pub fn build_host(
        &self,
        threads_per_group: &HashMap<String, usize>,
        schedule_entries: Vec<ScheduleEntry>,
        tz: Tz,
        tuning: HostTuning,
    ) -> Arc<ProcessHost> {
        let mut config = HostConfig::new(tz).with_schedule_entries(schedule_entries);
        config.housekeeping_interval_secs = tuning.housekeeping_interval_secs;
        for pool_config in self.pool_configs(threads_per_group, tuning) {
            config = config.with_worker_pool(pool_config);
        }
        Arc::new(ProcessHost::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
            config,
        ))
    }

    /// Runs one [`ProcessHost`] in this process until it observes a
    /// cluster-wide shutdown event or this process itself receives
    /// `SIGTERM`/`SIGINT` — the entry point the demo binary's `run-host`
    /// mode (the side of `taskkit-demo run` that a re-exec'd child lands
    /// in) calls directly.
    pub async fn start_process(
        &self,
        threads_per_group: &HashMap<String, usize>,
        schedule_entries: Vec<ScheduleEntry>,
        tz: Tz,
        tuning: HostTuning,
    ) -> anyhow::Result<()> {
        let host = self.build_host(threads_per_group, schedule_entries, tz, tuning);
        let termination = taskkit_supervisor::signal::wait_for_termination();
        tokio::pin!(termination);

        let run_host = host.run();
        tokio::pin!(run_host);

        tokio::select! {
            result = &mut run_host => result,
            signal_result = &mut termination => {
                let exit_code = signal_result?;
                info!(exit_code, "host process received termination signal");
                host.request_shutdown();
                run_host.await?;
                if exit_code != 0 {
                    anyhow::bail!("host process exiting after a captured termination signal (status {exit_code})");
                }
                Ok(())
            }
        }
    }

    /// Non-blocking variant of [`Self::start_process`], run `n_procs`
    /// times: spawns `n_procs` independent [`ProcessHost`]s as `tokio`
    /// tasks sharing this process's backend/registry, and returns handles
    /// to both the hosts and their running tasks. Covers the common case
    /// where process-level isolation isn't needed — e.g. tests, or a
    /// single binary that just wants N independent worker-pool instances.
    /// Real OS-process isolation goes through [`Self::start`] instead.
    pub fn start_processes(
        &self,
        n_procs: usize,
        threads_per_group: &HashMap<String, usize>,
        schedule_entries: Vec<ScheduleEntry>,
        tz: Tz,
        tuning: HostTuning,
    ) -> Vec<(Arc<ProcessHost>, tokio::task::JoinHandle<anyhow::Result<()>>)> {
        (0..n_procs)
            .map(|_| {
                let host = self.build_host(threads_per_group, schedule_entries.clone(), tz, tuning);
                let handle = {
                    let host = Arc::clone(&host);
                    tokio::spawn(async move { host.run().await })
                };
                (host, handle)
            })
            .collect()
    }

    /// The blocking supervisor loop: spawns `n_procs` real OS processes via
    /// `launcher` (typically a
    /// [`taskkit_supervisor::ReExecLauncher`] pointed at this same
    /// binary's "run as host" mode) and restarts dead ones until a
    /// termination signal or explicit stop is observed. `Kit` itself takes
    /// no part in how a launched process reconstructs its backend and
    /// registry — that only the caller's own `main()` knows how to do —
    /// so this is a thin pass-through to [`Supervisor`].
    pub async fn start(
        &self,
        n_procs: usize,
        launcher: Arc<dyn HostLauncher>,
        should_restart: Option<Arc<dyn RestartPolicy>>,
    ) -> anyhow::Result<()> {
        let mut supervisor = Supervisor::new(n_procs, launcher);
        if let Some(policy) = should_restart {
            supervisor = supervisor.with_restart_policy(policy);
        }
        supervisor.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono_tz::UTC;
    use taskkit_backend_memory::MemoryBackend;
    use taskkit_core::{TaskContext, TaskFailure, TaskHandler};

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, data: &[u8], _ctx: &TaskContext) -> Result<Vec<u8>, TaskFailure> {
            Ok(data.to_vec())
        }
    }

    fn kit() -> Kit {
        let mut registry = HandlerRegistry::new();
        registry.register("math", "echo", Echo);
        Kit::new(MemoryBackend::new(), Arc::new(registry))
    }

    #[tokio::test]
    async fn eager_initiate_task_runs_synchronously() {
        let kit = kit();
        let outcome = kit
            .initiate_task("math", "echo", b"hi".to_vec(), None, None, true)
            .await
            .unwrap();
        assert_eq!(outcome, Some(Outcome::success(b"hi".to_vec())));
    }

    #[tokio::test]
    async fn durable_initiate_task_enqueues_and_defers_the_result() {
        let kit = kit();
        let outcome = kit
            .initiate_task("math", "echo", b"hi".to_vec(), None, None, false)
            .await
            .unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn a_started_process_completes_enqueued_tasks() {
        let kit = kit();
        let mut threads = HashMap::new();
        threads.insert("math".to_string(), 1);

        let handles = kit.start_processes(1, &threads, Vec::new(), UTC, HostTuning::default());
        assert_eq!(handles.len(), 1);
        let (host, join_handle) = &handles[0];

        let now = kit.clock.now_ts();
        kit.backend()
            .put_tasks(vec![Task::new("t1".into(), "math", "echo", b"hi".to_vec(), now, 60, now)])
            .await
            .unwrap();

        let mut result = None;
        for _ in 0..50 {
            result = kit.get_result("t1").await.unwrap();
            if result.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(result, Some(Outcome::success(b"hi".to_vec())));

        host.request_shutdown();
        join_handle.abort();
    }
}
