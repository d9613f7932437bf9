//! Message-passing substrate: stream buffers, pipes and the RPC layer.

mod pipe;
mod rpc;
mod streambuffer;

pub use pipe::{Pipe, PIPE_DEFAULT_CAPACITY, PIPE_PORT_THREAD};
pub use rpc::{
    rpc_execute_on, rpc_listen_on, rpc_respond_on, rpc_response_on, Argument, RemoteAddress,
    RemoteCall, IPC_MAX_ARGUMENTS,
};
pub use streambuffer::{StreamBuffer, StreamFlags, StreamOptions};

use thiserror::Error;

use crate::errors::OsStatus;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("the channel is closed")]
    Closed,
    #[error("the packet does not fit the channel capacity")]
    PacketTooLarge,
    #[error("no pipe exists on port {0}")]
    InvalidPort(i32),
    #[error("the target does not exist")]
    InvalidTarget,
    #[error("malformed remote call")]
    InvalidCall,
    #[error("no reply was expected for this call")]
    NoReplyExpected,
}

impl From<IpcError> for OsStatus {
    fn from(value: IpcError) -> Self {
        match value {
            IpcError::Closed => OsStatus::ConnectionAborted,
            IpcError::PacketTooLarge => OsStatus::InvalidParameters,
            IpcError::InvalidPort(_) => OsStatus::DoesNotExist,
            IpcError::InvalidTarget => OsStatus::DoesNotExist,
            IpcError::InvalidCall => OsStatus::InvalidProtocol,
            IpcError::NoReplyExpected => OsStatus::InvalidParameters,
        }
    }
}
