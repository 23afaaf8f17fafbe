//! Eager execution: bypasses the backend entirely and runs a handler
//! synchronously in the caller.
//!
//! A small, single-purpose struct rather than a free function, since the
//! operation needs a registry and a clock threaded through it — the same
//! shape the durable scheduler gives its own dependencies, just with nothing
//! durable to own.

use std::sync::Arc;

use taskkit_core::{
    error::UNKNOWN_HANDLER, Clock, HandlerRegistry, NoopRenewHook, Outcome, TaskContext,
    DEFAULT_TASK_TTL_SECS,
};

/// Runs a registered handler in-process, with no `Backend` call at all --
/// not even `put_tasks`. Used for in-process testing and "fan-in" callers
/// where latency matters more than durability.
pub struct EagerWorker {
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
}

impl EagerWorker {
    pub fn new(registry: Arc<HandlerRegistry>, clock: Arc<dyn Clock>) -> Self {
        EagerWorker { registry, clock }
    }

    /// Decodes/runs/encodes `(group, name)` against `data` and returns the
    /// completed `Outcome` synchronously. An unknown `(group, name)` pair
    /// reports `unknown_handler`, same as the worker pool's dispatch path.
    pub async fn run(&self, group: &str, name: &str, data: &[u8], ttl: Option<u64>) -> Outcome {
        let handler = match self.registry.lookup(group, name) {
            Some(handler) => handler,
            None => {
                return Outcome::error(
                    UNKNOWN_HANDLER,
                    format!("no handler registered for ({group}, {name})"),
                );
            }
        };

        let now = self.clock.now_ts();
        let deadline_ts = now + ttl.unwrap_or(DEFAULT_TASK_TTL_SECS);
        let ctx = TaskContext::new(Arc::clone(&self.clock), deadline_ts, Arc::new(NoopRenewHook));

        match handler.run(data, &ctx).await {
            Ok(bytes) => Outcome::success(bytes),
            Err(failure) => Outcome::from(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use taskkit_core::{SystemClock, TaskFailure, TaskHandler};

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(&self, data: &[u8], _ctx: &TaskContext) -> Result<Vec<u8>, TaskFailure> {
            Ok(data.to_vec())
        }
    }

    #[tokio::test]
    async fn runs_registered_handler_synchronously() {
        let mut registry = HandlerRegistry::new();
        registry.register("math", "echo", Echo);
        let worker = EagerWorker::new(Arc::new(registry), Arc::new(SystemClock));

        let outcome = worker.run("math", "echo", b"hi", None).await;
        assert_eq!(outcome, Outcome::success(b"hi".to_vec()));
    }

    #[tokio::test]
    async fn unregistered_handler_reports_unknown_handler() {
        let worker = EagerWorker::new(Arc::new(HandlerRegistry::new()), Arc::new(SystemClock));
        let outcome = worker.run("math", "missing", b"", None).await;
        match outcome {
            Outcome::Error { kind, .. } => assert_eq!(kind, UNKNOWN_HANDLER),
            other => panic!("expected unknown_handler error, got {other:?}"),
        }
    }
}
