//! Error taxonomy.
//!
//! Two layers: [`BackendError`] is what a `Backend` implementation raises for
//! its own I/O and conflict conditions (it's a control-flow signal as much as
//! an error — `Conflict` is expected and handled, not logged as a failure).
//! [`TaskFailure`] is what a handler's `run` returns when it can't produce a
//! value; the worker pool turns it into a stored [`crate::outcome::Outcome::Error`].

use thiserror::Error;

/// Well-known `Outcome::Error` kind strings for system-level failures.
/// Handler-specific failures use their own free-form kind string.
pub const DECODE_ERROR: &str = "decode_error";
pub const ENCODE_ERROR: &str = "encode_error";
pub const UNKNOWN_HANDLER: &str = "unknown_handler";

/// Errors a [`crate::backend::Backend`] implementation raises.
#[derive(Debug, Error)]
pub enum BackendError {
    /// I/O failure (disk, network, lock contention past a timeout). The
    /// caller should retry with bounded exponential backoff.
    #[error("backend transient error: {0}")]
    Transient(#[source] anyhow::Error),

    /// A logical conflict: a lease was lost, a CAS target moved, a claim
    /// raced another caller. Not a bug, not retried automatically — callers
    /// treat this as "try the next tick".
    #[error("backend conflict")]
    Conflict,
}

impl BackendError {
    pub fn transient<E: Into<anyhow::Error>>(err: E) -> Self {
        BackendError::Transient(err.into())
    }
}

/// What a [`crate::handler::TaskHandler`] returns when it can't produce a result.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("handler error ({kind}): {message}")]
    Handler { kind: String, message: String },
}
