//! Syscall surface and process/thread lifecycle.
//!
//! The [`Kernel`] is a service object: it owns the process and thread
//! registries, the image loader and the process-manager request queue.
//! Callers supply a [`SyscallContext`] naming the process and thread the
//! call executes for, standing in for the syscall frame.

mod dispatch;
mod kernel;
mod process;
mod thread;

pub use dispatch::{syscall_table, SyscallNumber, SYSCALL_TABLE_SIZE};
pub use kernel::Kernel;
pub use process::{FileMappingParameters, MemoryDescriptor, StartupInformation};

use thiserror::Error;

use crate::errors::OsStatus;
use crate::handles::{ProcessId, ThreadId};
use crate::ipc::IpcError;
use crate::memory::MemoryError;
use crate::pe::PeError;
use crate::usched::UschedError;

/// Identity a syscall executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallContext {
    pub process: ProcessId,
    pub thread: ThreadId,
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("no process with that id")]
    UnknownProcess,
    #[error("no thread with that id")]
    UnknownThread,
    #[error("the operation crosses a process boundary")]
    CrossProcess,
    #[error("a pipe already exists on port {0}")]
    PortExists(i32),
    #[error("invalid parameters")]
    InvalidParameters,
    #[error("out of memory")]
    OutOfMemory,
    #[error("the wait timed out")]
    Timeout,
    #[error(transparent)]
    Image(#[from] PeError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Jobs(#[from] UschedError),
}

impl From<SystemError> for OsStatus {
    fn from(value: SystemError) -> Self {
        match value {
            SystemError::UnknownProcess | SystemError::UnknownThread => OsStatus::DoesNotExist,
            SystemError::CrossProcess => OsStatus::AccessDenied,
            SystemError::PortExists(_) => OsStatus::Exists,
            SystemError::InvalidParameters => OsStatus::InvalidParameters,
            SystemError::OutOfMemory => OsStatus::OutOfMemory,
            SystemError::Timeout => OsStatus::Timeout,
            SystemError::Image(inner) => inner.into(),
            SystemError::Ipc(inner) => inner.into(),
            SystemError::Memory(inner) => inner.into(),
            SystemError::Jobs(inner) => inner.into(),
        }
    }
}
