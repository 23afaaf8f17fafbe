//! The handler registry: a mapping `(group, name) -> TaskLogic`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::TaskFailure;

/// Hook a worker wires into a [`TaskContext`] so a running handler can
/// proactively extend its own lease (e.g. before a long blocking step)
/// rather than relying solely on the worker's background renewal ticker.
#[async_trait]
pub trait RenewHook: Send + Sync {
    /// Returns `false` if the lease was already lost.
    async fn renew(&self) -> bool;
}

/// A no-op hook for contexts constructed outside a worker (eager execution,
/// tests) where there is no lease to renew.
pub struct NoopRenewHook;

#[async_trait]
impl RenewHook for NoopRenewHook {
    async fn renew(&self) -> bool {
        true
    }
}

/// Everything a running handler is handed: a clock, a deadline, a
/// cancellation check, and a lease-renewal hook.
pub struct TaskContext {
    clock: Arc<dyn Clock>,
    deadline_ts: u64,
    cancelled: Arc<AtomicBool>,
    renew_hook: Arc<dyn RenewHook>,
}

impl TaskContext {
    pub fn new(clock: Arc<dyn Clock>, deadline_ts: u64, renew_hook: Arc<dyn RenewHook>) -> Self {
        TaskContext {
            clock,
            deadline_ts,
            cancelled: Arc::new(AtomicBool::new(false)),
            renew_hook,
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// `min(due_ts + ttl, lease_max)` — the instant beyond which the worker
    /// pool abandons this run as expired.
    pub fn deadline_ts(&self) -> u64 {
        self.deadline_ts
    }

    /// Whether the worker pool has asked this run to stop (deadline
    /// exceeded, or the host is shutting down the task's group).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Used by the worker pool to signal cancellation; handlers only read
    /// `is_cancelled`.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub async fn renew_lease(&self) -> bool {
        self.renew_hook.renew().await
    }
}

/// A task handler, registered under `(group, name)`. Implementations own
/// their own decode/run/encode sequence so the registry can store them as
/// trait objects without a separate, non-object-safe generic `Encoder`
/// trait in the hot path — see `taskkit-core`'s `encoder` module for the
/// `JsonEncoder` helper most handlers build this on top of.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Decodes `data`, runs the handler's logic, and encodes the result.
    /// Errors at any stage are reported as the matching [`TaskFailure`]
    /// variant; the worker pool stores it verbatim as an `Outcome::Error`.
    async fn run(&self, data: &[u8], ctx: &TaskContext) -> Result<Vec<u8>, TaskFailure>;
}

/// A mapping `(group, name) -> TaskHandler`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        group: impl Into<String>,
        name: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) {
        self.handlers
            .insert((group.into(), name.into()), Arc::new(handler));
    }

    /// Returns the handler for `(group, name)`, or `None` if unregistered —
    /// the caller turns that into `Outcome::Error { kind: unknown_handler }`.
    pub fn lookup(&self, group: &str, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&(group.to_string(), name.to_string())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, data: &[u8], _ctx: &TaskContext) -> Result<Vec<u8>, TaskFailure> {
            Ok(data.to_vec())
        }
    }

    #[tokio::test]
    async fn unregistered_lookup_returns_none() {
        let registry = HandlerRegistry::new();
        assert!(registry.lookup("g", "n").is_none());
    }

    #[tokio::test]
    async fn registered_handler_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register("g", "echo", Echo);
        let handler = registry.lookup("g", "echo").expect("registered");
        let ctx = TaskContext::new(Arc::new(SystemClock), 0, Arc::new(NoopRenewHook));
        let out = handler.run(b"hello", &ctx).await.unwrap();
        assert_eq!(out, b"hello");
    }
}
