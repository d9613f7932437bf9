//! Port-keyed pipe endpoints.

use std::sync::Arc;

use crate::handles::ProcessId;

use super::streambuffer::{StreamBuffer, StreamFlags, StreamOptions};
use super::IpcError;

pub const PIPE_DEFAULT_CAPACITY: u32 = 0x1000;

/// Port number used for a thread's built-in pipe.
pub const PIPE_PORT_THREAD: i32 = -1;

/// A bounded channel owned by a process (on a port) or by a thread (port
/// -1), backed by one stream buffer.
#[derive(Clone)]
pub struct Pipe {
    pub owner: ProcessId,
    pub port: i32,
    buffer: Arc<StreamBuffer>,
}

impl Pipe {
    pub fn new(owner: ProcessId, port: i32, capacity: u32, options: StreamOptions) -> Self {
        Pipe {
            owner,
            port,
            buffer: Arc::new(StreamBuffer::new(capacity, options)),
        }
    }

    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    pub fn read(&self, out: &mut [u8], flags: StreamFlags) -> Result<usize, IpcError> {
        self.buffer.read(out, flags)
    }

    pub fn write(&self, bytes: &[u8], flags: StreamFlags) -> Result<usize, IpcError> {
        self.buffer.write(bytes, flags)
    }

    pub fn close(&self) {
        self.buffer.close();
    }
}
