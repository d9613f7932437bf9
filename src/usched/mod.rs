//! Cooperative userspace scheduler.
//!
//! N jobs multiplexed over M execution units. Each unit is a kernel thread
//! hosting one [`Scheduler`](scheduler::Scheduler) instance; the global
//! ready queue feeds the worker pool, detached units consume only their
//! pinned job. Within one unit scheduling is strictly cooperative: a job
//! runs until it yields, blocks or exits.

mod cond;
mod context;
mod job;
mod mutex;
mod scheduler;
mod xunit;

pub use cond::Condvar;
pub use job::{
    at_exit, current_job, detach, exit, join, queue, queue_with, sleep, tls_get, tls_set,
    yield_now, JobParameters,
};
pub use mutex::Mutex;
pub use xunit::ExecutionManager;

use thiserror::Error;

use crate::errors::OsStatus;

/// Identifier of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u32);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UschedError {
    #[error("the operation timed out")]
    TimedOut,
    #[error("the resource is busy")]
    Busy,
    #[error("the calling context is not a job")]
    NotAJob,
    #[error("the mutex is not owned by the calling job")]
    NotOwner,
    #[error("the mutex is already owned by the calling job")]
    AlreadyOwned,
    #[error("no job exists with that id")]
    UnknownJob,
    #[error("the requested stack size is below the minimum")]
    StackTooSmall,
    #[error("no such storage slot")]
    InvalidSlot,
    #[error("the operation is not supported")]
    NotSupported,
}

impl From<UschedError> for OsStatus {
    fn from(value: UschedError) -> Self {
        match value {
            UschedError::TimedOut => OsStatus::Timeout,
            UschedError::Busy => OsStatus::Busy,
            UschedError::UnknownJob => OsStatus::DoesNotExist,
            UschedError::NotSupported => OsStatus::NotSupported,
            UschedError::NotAJob
            | UschedError::NotOwner
            | UschedError::AlreadyOwned
            | UschedError::StackTooSmall
            | UschedError::InvalidSlot => OsStatus::InvalidParameters,
        }
    }
}
