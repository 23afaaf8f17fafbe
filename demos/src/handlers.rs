//! Example handlers for the demo binary: one ordinary handler and one built
//! specifically to exercise TTL/deadline handling.
//!
//! A small struct implementing the run trait, decoding its own JSON
//! parameters via the shared encoder rather than inventing a bespoke
//! format per handler.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use taskkit_core::{Clock, JsonEncoder, TaskContext, TaskFailure, TaskHandler};

#[derive(Debug, Serialize, Deserialize)]
struct AddParams {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize)]
struct AddResult {
    sum: i64,
}

/// Adds two integers. The simplest possible handler: decode, compute,
/// encode, no cancellation or renewal concerns at all.
pub struct AddHandler;

#[async_trait]
impl TaskHandler for AddHandler {
    async fn run(&self, data: &[u8], _ctx: &TaskContext) -> Result<Vec<u8>, TaskFailure> {
        let encoder = JsonEncoder;
        let params: AddParams = encoder.decode(data)?;
        encoder.encode(&AddResult { sum: params.a + params.b })
    }
}

#[derive(Debug, Deserialize)]
struct SleepParams {
    sleep_secs: u64,
}

/// Sleeps for `sleep_secs`, checking `ctx.is_cancelled()` between short
/// naps so a deadline-driven shutdown observes cooperative cancellation
/// rather than having to forcibly abandon the task. Meant to be configured
/// with a `sleep_secs` longer than the task's `ttl` to demonstrate expiry
/// in the demo.
pub struct SleepHandler;

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn run(&self, data: &[u8], ctx: &TaskContext) -> Result<Vec<u8>, TaskFailure> {
        let encoder = JsonEncoder;
        let params: SleepParams = encoder.decode(data)?;

        let mut remaining = Duration::from_secs(params.sleep_secs);
        let step = Duration::from_millis(200);
        while remaining > Duration::ZERO {
            if ctx.is_cancelled() {
                debug!("sleep handler observed cancellation, stopping early");
                return Err(TaskFailure::Handler {
                    kind: "cancelled".to_string(),
                    message: "sleep interrupted by cancellation".to_string(),
                });
            }
            let nap = step.min(remaining);
            tokio::time::sleep(nap).await;
            remaining = remaining.saturating_sub(nap);
        }

        encoder.encode(&serde_json::json!({ "slept_secs": params.sleep_secs }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use taskkit_core::SystemClock;

    fn ctx() -> TaskContext {
        TaskContext::new(
            Arc::new(SystemClock),
            SystemClock.now_ts() + 60,
            Arc::new(taskkit_core::NoopRenewHook),
        )
    }

    #[tokio::test]
    async fn add_handler_sums_operands() {
        let encoder = JsonEncoder;
        let data = encoder.encode(&AddParams { a: 2, b: 3 }).unwrap();
        let result = AddHandler.run(&data, &ctx()).await.unwrap();
        let decoded: AddResult = encoder.decode(&result).unwrap();
        assert_eq!(decoded.sum, 5);
    }

    #[tokio::test]
    async fn sleep_handler_reports_cancellation() {
        let encoder = JsonEncoder;
        let data = encoder.encode(&SleepParams { sleep_secs: 5 }).unwrap();
        let ctx = TaskContext::new(Arc::new(SystemClock), SystemClock.now_ts() + 60, Arc::new(taskkit_core::NoopRenewHook));
        let flag = ctx.cancel_flag();

        let handle = tokio::spawn(async move { SleepHandler.run(&data, &ctx).await });
        tokio::time::sleep(Duration::from_millis(250)).await;
        flag.store(true, std::sync::atomic::Ordering::Relaxed);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TaskFailure::Handler { ref kind, .. }) if kind == "cancelled"));
    }
}
