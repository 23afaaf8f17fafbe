//! Core data model and contracts for a distributed, backend-agnostic task
//! execution kit: `Task`/`ScheduleEntry`/`Outcome`/`Event`, the `Backend`
//! and handler-registry traits, and the small set of reference helpers
//! (JSON encoding, deterministic ids, injectable clock) every other crate
//! in the workspace builds on.

pub mod backend;
pub mod clock;
pub mod controller;
pub mod encoder;
pub mod error;
pub mod event;
pub mod handler;
pub mod ids;
pub mod outcome;
pub mod schedule;
pub mod task;

#[cfg(feature = "test-support")]
pub mod test_support;

pub use backend::{Backend, EventSubscription};
pub use clock::{Clock, SystemClock, TestClock};
pub use controller::Controller;
pub use encoder::JsonEncoder;
pub use error::{BackendError, TaskFailure};
pub use event::Event;
pub use handler::{HandlerRegistry, NoopRenewHook, RenewHook, TaskContext, TaskHandler};
pub use ids::{deterministic_task_id, random_task_id};
pub use outcome::Outcome;
pub use schedule::{BoxedRecurrence, DailyAt, FixedInterval, Recurrence, ScheduleEntry};
pub use task::{ClaimedTask, Task, TaskId, TaskState, DEFAULT_TASK_TTL_SECS};
