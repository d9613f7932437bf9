//! Remote calls over pipes.
//!
//! A remote call is one packet on the target pipe: a fixed-size header
//! (sender, receiver, function id, argument descriptors) followed by every
//! buffer argument in order. The packet reservation serializes concurrent
//! callers, which is what gives per-(sender, pipe) program-order delivery.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::trace;

use crate::handles::ProcessId;

use super::pipe::Pipe;
use super::streambuffer::StreamFlags;
use super::IpcError;

pub const IPC_MAX_ARGUMENTS: usize = 5;

const ARGUMENT_NOTUSED: u32 = 0;
const ARGUMENT_VALUE: u32 = 1;
const ARGUMENT_BUFFER: u32 = 2;

/// Reply route of a call; `kind == 1` designates a thread's built-in pipe
/// instead of a process-owned port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteAddress {
    pub process: u32,
    pub port: i32,
    pub kind: u32,
}

impl RemoteAddress {
    pub fn to_process(process: ProcessId, port: i32) -> Self {
        RemoteAddress {
            process: process.0,
            port,
            kind: 0,
        }
    }

    pub fn is_thread(&self) -> bool {
        self.kind == 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    NotUsed,
    Value(u64),
    Buffer(Vec<u8>),
}

impl Argument {
    fn type_tag(&self) -> u32 {
        match self {
            Argument::NotUsed => ARGUMENT_NOTUSED,
            Argument::Value(_) => ARGUMENT_VALUE,
            Argument::Buffer(_) => ARGUMENT_BUFFER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub from: RemoteAddress,
    pub to: RemoteAddress,
    pub function: u32,
    pub arguments: [Argument; IPC_MAX_ARGUMENTS],
    /// Expected byte length of the reply; zero means no reply.
    pub result_length: u32,
}

impl RemoteCall {
    pub fn new(to: RemoteAddress, function: u32) -> Self {
        RemoteCall {
            from: RemoteAddress::default(),
            to,
            function,
            arguments: [const { Argument::NotUsed }; IPC_MAX_ARGUMENTS],
            result_length: 0,
        }
    }

    pub fn set_argument(&mut self, index: usize, argument: Argument) {
        self.arguments[index] = argument;
    }

    pub fn expects_reply(&self) -> bool {
        self.result_length != 0
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(96);
        header.write_u32::<LittleEndian>(self.from.process).unwrap();
        header.write_i32::<LittleEndian>(self.from.port).unwrap();
        header.write_u32::<LittleEndian>(self.from.kind).unwrap();
        header.write_u32::<LittleEndian>(self.to.process).unwrap();
        header.write_i32::<LittleEndian>(self.to.port).unwrap();
        header.write_u32::<LittleEndian>(self.function).unwrap();
        for argument in &self.arguments {
            header.write_u32::<LittleEndian>(argument.type_tag()).unwrap();
            let value = match argument {
                Argument::NotUsed => 0,
                Argument::Value(value) => *value,
                Argument::Buffer(bytes) => bytes.len() as u64,
            };
            header.write_u64::<LittleEndian>(value).unwrap();
        }
        header.write_u32::<LittleEndian>(self.result_length).unwrap();
        header
    }

    fn parse(payload: &[u8]) -> Result<RemoteCall, IpcError> {
        let mut cursor = Cursor::new(payload);
        let mut read_u32 = |cursor: &mut Cursor<&[u8]>| {
            cursor.read_u32::<LittleEndian>().map_err(|_| IpcError::InvalidCall)
        };

        let from = RemoteAddress {
            process: read_u32(&mut cursor)?,
            port: cursor.read_i32::<LittleEndian>().map_err(|_| IpcError::InvalidCall)?,
            kind: read_u32(&mut cursor)?,
        };
        let to = RemoteAddress {
            process: read_u32(&mut cursor)?,
            port: cursor.read_i32::<LittleEndian>().map_err(|_| IpcError::InvalidCall)?,
            kind: 0,
        };
        let function = read_u32(&mut cursor)?;

        let mut arguments = [const { Argument::NotUsed }; IPC_MAX_ARGUMENTS];
        let mut buffer_lengths = [0usize; IPC_MAX_ARGUMENTS];
        for index in 0..IPC_MAX_ARGUMENTS {
            let tag = read_u32(&mut cursor)?;
            let value = cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| IpcError::InvalidCall)?;
            match tag {
                ARGUMENT_NOTUSED => {}
                ARGUMENT_VALUE => arguments[index] = Argument::Value(value),
                ARGUMENT_BUFFER => buffer_lengths[index] = value as usize,
                _ => return Err(IpcError::InvalidCall),
            }
        }
        let result_length = read_u32(&mut cursor)?;

        // Buffer payloads follow the header in argument order.
        let mut offset = cursor.position() as usize;
        for index in 0..IPC_MAX_ARGUMENTS {
            let length = buffer_lengths[index];
            if length == 0 {
                continue;
            }
            let bytes = payload
                .get(offset..offset + length)
                .ok_or(IpcError::InvalidCall)?;
            arguments[index] = Argument::Buffer(bytes.to_vec());
            offset += length;
        }

        Ok(RemoteCall {
            from,
            to,
            function,
            arguments,
            result_length,
        })
    }
}

/// Serialize `call` into `pipe` as one packet: header first, then each
/// buffer argument. The single reservation keeps concurrent callers whole.
pub fn rpc_execute_on(pipe: &Pipe, call: &RemoteCall) -> Result<(), IpcError> {
    trace!(
        "rpc_execute_on(target={}:{}, function={})",
        call.to.process,
        call.to.port,
        call.function
    );
    let header = call.header_bytes();
    let total: usize = header.len()
        + call
            .arguments
            .iter()
            .map(|argument| match argument {
                Argument::Buffer(bytes) => bytes.len(),
                _ => 0,
            })
            .sum::<usize>();

    // A blocking reservation only comes back empty if the channel closed
    // under us.
    let mut writer = pipe
        .buffer()
        .write_packet_start(total as u32, StreamFlags::empty())?
        .ok_or(IpcError::Closed)?;
    writer.write_data(&header);
    for argument in &call.arguments {
        if let Argument::Buffer(bytes) = argument {
            writer.write_data(bytes);
        }
    }
    writer.finish();
    Ok(())
}

/// Receive one remote call from `pipe`, blocking until a full call arrived.
pub fn rpc_listen_on(pipe: &Pipe) -> Result<RemoteCall, IpcError> {
    let payload = pipe
        .buffer()
        .read_packet(StreamFlags::empty())?
        .ok_or(IpcError::Closed)?;
    RemoteCall::parse(&payload)
}

/// Write a reply for `call` onto the reply pipe selected by the caller.
pub fn rpc_respond_on(reply_pipe: &Pipe, bytes: &[u8]) -> Result<(), IpcError> {
    reply_pipe.buffer().write_packet(bytes, StreamFlags::empty())?;
    Ok(())
}

/// Wait for the reply to `call` on the given reply pipe.
pub fn rpc_response_on(reply_pipe: &Pipe, call: &RemoteCall) -> Result<Vec<u8>, IpcError> {
    if !call.expects_reply() {
        return Err(IpcError::NoReplyExpected);
    }
    reply_pipe
        .buffer()
        .read_packet(StreamFlags::empty())?
        .ok_or(IpcError::Closed)
}
