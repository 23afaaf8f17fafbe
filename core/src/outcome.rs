//! The completed-task result data model — named `Outcome` here to avoid
//! colliding with `std::result::Result`, which every fallible operation in
//! this crate also returns.

use serde::{Deserialize, Serialize};

use crate::error::TaskFailure;

/// The eventual, durable outcome of a task. `Pending` is not a variant of
/// this type — `Backend::get_result` returns `Option<Outcome>`, and `None`
/// means pending.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// The handler returned a value; `data` is the encoded payload.
    Success { data: Vec<u8> },
    /// Terminal failure. `kind` is one of the well-known system kinds in
    /// [`crate::error`] or a handler-specific free-form string.
    Error { kind: String, message: String },
    /// The task's deadline passed before it completed.
    Expired,
    /// Deliberately abandoned, e.g. via `discard_task`.
    Discarded { reason: String },
}

impl Outcome {
    pub fn success(data: Vec<u8>) -> Self {
        Outcome::Success { data }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Outcome::Error {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Outcome::Error { .. } | Outcome::Expired)
    }
}

impl From<TaskFailure> for Outcome {
    fn from(failure: TaskFailure) -> Self {
        match failure {
            TaskFailure::Decode(message) => {
                Outcome::error(crate::error::DECODE_ERROR, message)
            }
            TaskFailure::Encode(message) => {
                Outcome::error(crate::error::ENCODE_ERROR, message)
            }
            TaskFailure::Handler { kind, message } => Outcome::error(kind, message),
        }
    }
}
