//! Signal capture, scoped to the supervisor's call to [`crate::Supervisor::run`]:
//! installed only for that duration, released on every exit path because the
//! `Signal` streams below are local to this one future and drop along with
//! it.
//!
//! Generalized from a unix/non-unix split that waits for one signal and then
//! shuts itself down, to one that waits for one signal and then tells the
//! caller which exit code its own shutdown should use.

use tracing::info;

/// Waits for `SIGTERM` or `SIGINT` (unix) or Ctrl+C (elsewhere), then
/// returns the process exit code the supervisor should use afterwards. A
/// captured signal exits with a failure status; a keyboard interrupt is left
/// to propagate with its own conventional status instead of being folded
/// into the same "failure" bucket.
pub async fn wait_for_termination() -> anyhow::Result<i32> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("supervisor received SIGTERM");
                Ok(1)
            }
            _ = sigint.recv() => {
                info!("supervisor received SIGINT");
                Ok(130)
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("supervisor received Ctrl+C");
        Ok(130)
    }
}
