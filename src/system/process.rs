//! Process objects.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use crate::handles::{ImageId, ProcessId, ThreadId};
use crate::ipc::Pipe;
use crate::memory::{BlockBitmap, MemorySpaceHandle, PAGE_SIZE};
use crate::mstring::MString;

/// Window the per-process heap bitmap allocates from.
pub(super) const HEAP_BASE: u64 = 0x2000_0000;
pub(super) const HEAP_SIZE: u64 = 0x1000_0000;
/// Window for shared-memory reservations (acquire, file mappings).
pub(super) const SHM_BASE: u64 = 0x3000_0000;
pub(super) const SHM_SIZE: u64 = 0x1000_0000;

/// Two length-prefixed byte ranges handed to a new process before its
/// entry runs; both are deep-copied at the spawn syscall so the caller can
/// free its own immediately.
#[derive(Debug, Clone, Default)]
pub struct StartupInformation {
    pub arguments: Vec<u8>,
    pub inheritance: Vec<u8>,
}

/// Result of the memory-query syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub page_size: u64,
    pub pages_total: u64,
    pub pages_allocated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMappingParameters {
    pub file_handle: u32,
    pub flags: u32,
    pub offset: u64,
    pub size: u64,
}

/// A live file mapping; pages materialize lazily through the page-sized
/// transfer buffer.
pub(super) struct FileMapping {
    pub file_handle: u32,
    pub base: u64,
    pub length: u64,
    pub flags: u32,
    pub offset: u64,
    pub transfer_buffer: Vec<u8>,
}

impl FileMapping {
    pub(super) fn new(parameters: &FileMappingParameters, base: u64) -> Self {
        FileMapping {
            file_handle: parameters.file_handle,
            base,
            length: parameters.size,
            flags: parameters.flags,
            offset: parameters.offset,
            transfer_buffer: vec![0; PAGE_SIZE as usize],
        }
    }

    pub(super) fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.length
    }
}

pub(super) struct Process {
    pub id: ProcessId,
    pub name: MString,
    pub full_path: MString,
    pub image: ImageId,
    pub main_thread: ThreadId,
    pub space: MemorySpaceHandle,
    pub heap: BlockBitmap,
    pub shm: BlockBitmap,
    pub file_mappings: Vec<FileMapping>,
    /// Port-keyed pipes; ports are unique within the process.
    pub pipes: HashMap<i32, Pipe>,
    pub working_directory: MString,
    pub base_directory: MString,
    pub startup_information: StartupInformation,
    pub signal_handler: Option<u64>,
    pub exit_code: i32,
    pub terminated: bool,
    /// Outstanding ipc-wake tokens.
    pub wake_tokens: u32,
}

/// Registry entry; the lifecycle condvar is notified on termination and on
/// ipc wakes.
pub(super) struct ProcessEntry {
    pub state: Mutex<Process>,
    pub lifecycle: Condvar,
}

impl Process {
    pub(super) fn new(
        id: ProcessId,
        name: MString,
        full_path: MString,
        image: ImageId,
        main_thread: ThreadId,
        space: MemorySpaceHandle,
        startup_information: StartupInformation,
    ) -> Self {
        let base_directory = match full_path.find_reverse('/' as u32) {
            Some(index) => full_path.substring(0, index as isize + 1),
            None => full_path.clone(),
        };
        Process {
            id,
            name,
            full_path,
            image,
            main_thread,
            space,
            heap: BlockBitmap::new(HEAP_BASE, HEAP_SIZE, PAGE_SIZE),
            shm: BlockBitmap::new(SHM_BASE, SHM_SIZE, PAGE_SIZE),
            file_mappings: Vec::new(),
            pipes: HashMap::new(),
            working_directory: base_directory.clone(),
            base_directory,
            startup_information,
            signal_handler: None,
            exit_code: 0,
            terminated: false,
            wake_tokens: 0,
        }
    }
}

/// Request consumed by the process-manager worker.
pub(super) enum PhoenixRequestKind {
    SpawnProcess {
        path: MString,
        startup: StartupInformation,
    },
    KillProcess {
        target: ProcessId,
    },
}

pub(super) struct PhoenixRequest {
    pub kind: PhoenixRequestKind,
    pub outcome: Mutex<Option<Result<ProcessId, super::SystemError>>>,
    pub done: Condvar,
}

impl PhoenixRequest {
    pub(super) fn new(kind: PhoenixRequestKind) -> Self {
        PhoenixRequest {
            kind,
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub(super) fn complete(&self, result: Result<ProcessId, super::SystemError>) {
        let mut outcome = self.outcome.lock().unwrap();
        *outcome = Some(result);
        self.done.notify_all();
    }

    /// Block until the worker completed the request; the single waiter
    /// takes the outcome. `None` on timeout.
    pub(super) fn wait(
        &self,
        timeout: Option<std::time::Duration>,
    ) -> Option<Result<ProcessId, super::SystemError>> {
        let mut outcome = self.outcome.lock().unwrap();
        loop {
            if outcome.is_some() {
                return outcome.take();
            }
            match timeout {
                Some(duration) => {
                    let (guard, wait) = self.done.wait_timeout(outcome, duration).unwrap();
                    outcome = guard;
                    if wait.timed_out() && outcome.is_none() {
                        return None;
                    }
                }
                None => {
                    outcome = self.done.wait(outcome).unwrap();
                }
            }
        }
    }
}

/// Queue feeding the worker.
pub(super) struct PhoenixQueue {
    pub requests: Mutex<VecDeque<std::sync::Arc<PhoenixRequest>>>,
    pub signal: Condvar,
    pub running: std::sync::atomic::AtomicBool,
}

impl PhoenixQueue {
    pub(super) fn new() -> Self {
        PhoenixQueue {
            requests: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            running: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub(super) fn push(&self, request: std::sync::Arc<PhoenixRequest>) {
        let mut requests = self.requests.lock().unwrap();
        requests.push_back(request);
        self.signal.notify_all();
    }

    /// Pop the next request, parking until one arrives or the queue shuts
    /// down.
    pub(super) fn pop(&self) -> Option<std::sync::Arc<PhoenixRequest>> {
        let mut requests = self.requests.lock().unwrap();
        loop {
            if let Some(request) = requests.pop_front() {
                return Some(request);
            }
            if !self.running.load(std::sync::atomic::Ordering::Acquire) {
                return None;
            }
            requests = self.signal.wait(requests).unwrap();
        }
    }

    pub(super) fn shutdown(&self) {
        self.running
            .store(false, std::sync::atomic::Ordering::Release);
        let _requests = self.requests.lock().unwrap();
        self.signal.notify_all();
    }
}
