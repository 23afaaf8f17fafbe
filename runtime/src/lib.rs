//! Scheduler, worker pool, process host, and eager execution for the task
//! execution kit: everything that runs inside one OS process once a
//! `Backend` and a `HandlerRegistry` exist.

pub mod eager;
pub mod host;
pub mod scheduler;
pub mod worker;

pub use eager::EagerWorker;
pub use host::{HostConfig, ProcessHost};
pub use scheduler::{Scheduler, SchedulerState};
pub use worker::{WorkerPool, WorkerPoolConfig};
