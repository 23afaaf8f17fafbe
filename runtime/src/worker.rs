//! The worker pool.
//!
//! Builds on an executor/result split between "what runs" and "what comes
//! back", generalized from a fixed menu of monitoring probes to whatever
//! `(group, name)` pairs are registered in a [`HandlerRegistry`]. "Thread"
//! here is a dedicated `tokio` task per logical worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskkit_core::{
    error::UNKNOWN_HANDLER, Backend, Clock, HandlerRegistry, Outcome, RenewHook, TaskContext,
    TaskId,
};

/// Bound on claim-empty backoff.
const MAX_CLAIM_BACKOFF: Duration = Duration::from_millis(900);
const MIN_CLAIM_BACKOFF: Duration = Duration::from_millis(100);
const PAUSED_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn jittered_claim_backoff() -> Duration {
    let span = (MAX_CLAIM_BACKOFF - MIN_CLAIM_BACKOFF).as_millis() as u64;
    MIN_CLAIM_BACKOFF + Duration::from_millis(rand::random::<u64>() % span.max(1))
}

pub struct WorkerPoolConfig {
    pub group: String,
    pub thread_count: usize,
    pub lease_duration_secs: u64,
    /// Upper bound on how long a single run may hold a lease, regardless of
    /// the task's own `ttl` — the deadline is `min(due_ts + ttl, lease_max)`.
    pub lease_max_secs: u64,
}

/// One independent pool of workers bound to a single group. Per-group
/// concurrency is exactly `config.thread_count`; there is no work stealing
/// across groups.
pub struct WorkerPool {
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: WorkerPoolConfig,
    paused: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: WorkerPoolConfig,
    ) -> Arc<Self> {
        Arc::new(WorkerPool {
            backend,
            registry,
            clock,
            config,
            paused: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn group(&self) -> &str {
        &self.config.group
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Spawns `thread_count` worker tasks, each independently running
    /// [`Self::worker_loop`] until `shutdown_rx` fires.
    pub fn spawn(self: &Arc<Self>, shutdown_rx: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        (0..self.config.thread_count)
            .map(|idx| {
                let pool = Arc::clone(self);
                let worker_id = format!("{}-w{}-pid{}", pool.config.group, idx, std::process::id());
                let rx = shutdown_rx.subscribe();
                tokio::spawn(async move { pool.worker_loop(worker_id, rx).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: String, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(worker_id, group = %self.config.group, "worker starting");
        loop {
            if self.is_paused() {
                tokio::select! {
                    _ = tokio::time::sleep(PAUSED_POLL_INTERVAL) => continue,
                    _ = shutdown_rx.recv() => break,
                }
            }

            let now = self.clock.now_ts();
            let claimed = self
                .backend
                .claim_tasks(&self.config.group, 1, now, self.config.lease_duration_secs, &worker_id)
                .await;

            let task = match claimed {
                Ok(mut tasks) if !tasks.is_empty() => tasks.remove(0),
                Ok(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(jittered_claim_backoff()) => continue,
                        _ = shutdown_rx.recv() => break,
                    }
                }
                Err(err) => {
                    warn!(worker_id, %err, "claim_tasks failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(jittered_claim_backoff()) => continue,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            };

            self.run_claimed_task(task, &worker_id).await;
        }
        info!(worker_id, group = %self.config.group, "worker stopped");
    }

    async fn run_claimed_task(&self, claimed: taskkit_core::ClaimedTask, worker_id: &str) {
        let taskkit_core::ClaimedTask { task, .. } = claimed;

        let handler = match self.registry.lookup(&task.group, &task.name) {
            Some(handler) => handler,
            None => {
                let message = format!("no handler registered for ({}, {})", task.group, task.name);
                if let Err(err) = self
                    .backend
                    .complete_task(&task.id, Outcome::error(UNKNOWN_HANDLER, message))
                    .await
                {
                    warn!(%err, task_id = %task.id, "failed to record unknown_handler outcome");
                }
                return;
            }
        };

        let now = self.clock.now_ts();
        let deadline_ts = task.expires_at().min(now + self.config.lease_max_secs);

        let cancel_flag = Arc::new(AtomicBool::new(false));
        let renew_hook = Arc::new(BackendRenewHook {
            backend: Arc::clone(&self.backend),
            task_id: task.id.clone(),
            worker_id: worker_id.to_string(),
            clock: Arc::clone(&self.clock),
            lease_duration_secs: self.config.lease_duration_secs,
        });
        let ctx = TaskContext::new(Arc::clone(&self.clock), deadline_ts, renew_hook);

        let renewal_handle = self.spawn_renewal_ticker(task.id.clone(), worker_id.to_string(), Arc::clone(&cancel_flag));

        let deadline_sleep_secs = deadline_ts.saturating_sub(now);
        let outcome = tokio::select! {
            result = handler.run(&task.data, &ctx) => {
                match result {
                    Ok(bytes) => Outcome::success(bytes),
                    Err(failure) => Outcome::from(failure),
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(deadline_sleep_secs)) => {
                debug!(task_id = %task.id, "task deadline exceeded, abandoning run");
                Outcome::Expired
            }
        };

        cancel_flag.store(true, Ordering::Relaxed);
        renewal_handle.abort();

        if let Err(err) = self.backend.complete_task(&task.id, outcome).await {
            warn!(%err, task_id = %task.id, "failed to record task outcome");
        }
    }

    fn spawn_renewal_ticker(
        &self,
        task_id: TaskId,
        worker_id: String,
        cancel_flag: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let clock = Arc::clone(&self.clock);
        let lease_duration_secs = self.config.lease_duration_secs;
        let interval = Duration::from_secs((lease_duration_secs / 2).max(1));

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if cancel_flag.load(Ordering::Relaxed) {
                    break;
                }
                let new_expiry = clock.now_ts() + lease_duration_secs;
                match backend.renew_lease(&task_id, &worker_id, new_expiry).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(%task_id, "lease lost, worker will abandon on next deadline check");
                        cancel_flag.store(true, Ordering::Relaxed);
                        break;
                    }
                    Err(err) => warn!(%err, %task_id, "lease renewal failed transiently"),
                }
            }
        })
    }
}

struct BackendRenewHook {
    backend: Arc<dyn Backend>,
    task_id: TaskId,
    worker_id: String,
    clock: Arc<dyn Clock>,
    lease_duration_secs: u64,
}

#[async_trait]
impl RenewHook for BackendRenewHook {
    async fn renew(&self) -> bool {
        let new_expiry = self.clock.now_ts() + self.lease_duration_secs;
        self.backend
            .renew_lease(&self.task_id, &self.worker_id, new_expiry)
            .await
            .unwrap_or(false)
    }
}
