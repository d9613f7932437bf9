//! The kernel service object and its syscall surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};

use crate::errors::OsStatus;
use crate::handles::{ImageId, ProcessId, ThreadId};
use crate::ipc::{
    rpc_execute_on, rpc_listen_on, rpc_respond_on, rpc_response_on, IpcError, Pipe, RemoteCall,
    StreamFlags, StreamOptions, PIPE_DEFAULT_CAPACITY, PIPE_PORT_THREAD,
};
use crate::memory::{AllocationFlags, MapFlags, PAGE_SIZE};
use crate::mstring::MString;
use crate::pe::{FileProvider, PeLoader};

use super::process::{
    FileMapping, PhoenixQueue, PhoenixRequest, PhoenixRequestKind, Process, ProcessEntry,
};
use super::thread::ThreadEntry;
use super::{
    FileMappingParameters, MemoryDescriptor, StartupInformation, SyscallContext, SystemError,
};

const KILL_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) struct KernelShared {
    processes: Mutex<HashMap<u32, Arc<ProcessEntry>>>,
    threads: Mutex<HashMap<u32, Arc<ThreadEntry>>>,
    loader: Mutex<PeLoader>,
    next_process_id: AtomicU32,
    next_thread_id: AtomicU32,
    boot: Instant,
    phoenix: PhoenixQueue,
}

impl KernelShared {
    fn process_entry(&self, id: ProcessId) -> Result<Arc<ProcessEntry>, SystemError> {
        self.processes
            .lock()
            .unwrap()
            .get(&id.0)
            .cloned()
            .ok_or(SystemError::UnknownProcess)
    }

    fn thread_entry(&self, id: ThreadId) -> Result<Arc<ThreadEntry>, SystemError> {
        self.threads
            .lock()
            .unwrap()
            .get(&id.0)
            .cloned()
            .ok_or(SystemError::UnknownThread)
    }

    /// Load the image and materialize the process plus its main thread.
    fn create_process(
        &self,
        path: &MString,
        startup: StartupInformation,
    ) -> Result<ProcessId, SystemError> {
        let pid = ProcessId(self.next_process_id.fetch_add(1, Ordering::Relaxed));
        let image = self.loader.lock().unwrap().load_image(pid, None, path)?;
        let (space, name, full_path) = {
            let loader = self.loader.lock().unwrap();
            let image = loader.image(image)?;
            (image.space.clone(), image.name.clone(), image.full_path.clone())
        };

        let main_thread = ThreadId(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(ThreadEntry::new(main_thread, pid, name.clone()));
        self.threads.lock().unwrap().insert(main_thread.0, thread);

        let process = Process::new(pid, name, full_path, image, main_thread, space, startup);
        self.processes.lock().unwrap().insert(
            pid.0,
            Arc::new(ProcessEntry {
                state: Mutex::new(process),
                lifecycle: Condvar::new(),
            }),
        );
        info!("spawned process {pid} from {path}");
        Ok(pid)
    }

    /// Mark the process terminated: record the code, finish its threads,
    /// close its pipes and wake joiners.
    fn terminate_process(&self, id: ProcessId, code: Option<i32>) -> Result<(), SystemError> {
        let entry = self.process_entry(id)?;

        let threads: Vec<Arc<ThreadEntry>> = self
            .threads
            .lock()
            .unwrap()
            .values()
            .filter(|thread| thread.process == id)
            .cloned()
            .collect();
        for thread in threads {
            thread.finish(0);
            thread.pipe.close();
        }

        {
            let mut state = entry.state.lock().unwrap();
            if let Some(code) = code {
                state.exit_code = code;
            }
            state.terminated = true;
            for pipe in state.pipes.values() {
                pipe.close();
            }
            trace!("process {} marked for reaping", state.id);
        }
        entry.lifecycle.notify_all();
        Ok(())
    }

    fn worker_loop(self: Arc<Self>) {
        while let Some(request) = self.phoenix.pop() {
            let result = match &request.kind {
                PhoenixRequestKind::SpawnProcess { path, startup } => {
                    self.create_process(path, startup.clone())
                }
                PhoenixRequestKind::KillProcess { target } => self
                    .terminate_process(*target, None)
                    .map(|_| *target),
            };
            if let Err(err) = &result {
                error!("process request failed: {err}");
            }
            request.complete(result);
        }
    }
}

/// The kernel core: registries, loader and the process manager.
pub struct Kernel {
    shared: Arc<KernelShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Kernel {
    pub fn new(provider: Box<dyn FileProvider>) -> Self {
        let shared = Arc::new(KernelShared {
            processes: Mutex::new(HashMap::new()),
            threads: Mutex::new(HashMap::new()),
            loader: Mutex::new(PeLoader::new(provider)),
            next_process_id: AtomicU32::new(1),
            next_thread_id: AtomicU32::new(1),
            boot: Instant::now(),
            phoenix: PhoenixQueue::new(),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("vali-processd".to_string())
            .spawn(move || worker_shared.worker_loop())
            .expect("failed to start the process manager");

        Kernel {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Loader access for introspection.
    pub fn loader(&self) -> &Mutex<PeLoader> {
        &self.shared.loader
    }

    /// Context of a process's main thread.
    pub fn primary_context(&self, process: ProcessId) -> Result<SyscallContext, SystemError> {
        let entry = self.shared.process_entry(process)?;
        let main_thread = entry.state.lock().unwrap().main_thread;
        Ok(SyscallContext {
            process,
            thread: main_thread,
        })
    }

    // ------------------------------------------------------------------
    // Debug
    // ------------------------------------------------------------------

    pub fn debug(&self, kind: u32, module: &str, message: &str) -> Result<(), SystemError> {
        match kind {
            0 => info!("{module}: {message}"),
            1 => debug!("{module}: {message}"),
            _ => error!("{module}: {message}"),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    /// Submit a spawn request to the process manager. The startup blobs
    /// are deep-copied so the caller may reuse its own immediately. An
    /// asynchronous spawn returns the invalid id.
    pub fn process_spawn(
        &self,
        path: &str,
        startup: &StartupInformation,
        asynchronous: bool,
    ) -> Result<ProcessId, SystemError> {
        let request = Arc::new(PhoenixRequest::new(PhoenixRequestKind::SpawnProcess {
            path: MString::from(path),
            startup: startup.clone(),
        }));
        self.shared.phoenix.push(request.clone());

        if asynchronous {
            return Ok(ProcessId::INVALID);
        }
        request.wait(None).unwrap_or(Err(SystemError::Timeout))
    }

    /// Sleep until the process terminates; returns its exit code.
    pub fn process_join(&self, target: ProcessId) -> Result<i32, SystemError> {
        let entry = self.shared.process_entry(target)?;
        let mut state = entry.state.lock().unwrap();
        while !state.terminated {
            state = entry.lifecycle.wait(state).unwrap();
        }
        Ok(state.exit_code)
    }

    /// Synchronous kill request, bounded by a one second wait.
    pub fn process_kill(&self, target: ProcessId) -> Result<(), SystemError> {
        let request = Arc::new(PhoenixRequest::new(PhoenixRequestKind::KillProcess {
            target,
        }));
        self.shared.phoenix.push(request.clone());
        match request.wait(Some(KILL_TIMEOUT)) {
            Some(result) => result.map(|_| ()),
            None => Err(SystemError::Timeout),
        }
    }

    /// Record the exit code, terminate the process's threads and mark it
    /// for reaping. The calling thread is expected to unwind afterwards.
    pub fn process_exit(&self, ctx: &SyscallContext, code: i32) -> Result<(), SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        {
            let state = entry.state.lock().unwrap();
            warn!("process {} terminated with code {code}", state.name);
        }
        self.shared.terminate_process(ctx.process, Some(code))
    }

    pub fn process_get_current_id(&self, ctx: &SyscallContext) -> Result<ProcessId, SystemError> {
        self.shared.process_entry(ctx.process)?;
        Ok(ctx.process)
    }

    /// Canonical path of the process's executable image.
    pub fn process_path(&self, target: ProcessId) -> Result<MString, SystemError> {
        let entry = self.shared.process_entry(target)?;
        let state = entry.state.lock().unwrap();
        Ok(state.full_path.clone())
    }

    pub fn process_get_startup_information(
        &self,
        ctx: &SyscallContext,
    ) -> Result<StartupInformation, SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let state = entry.state.lock().unwrap();
        Ok(state.startup_information.clone())
    }

    /// Install the process signal handler address.
    pub fn process_signal(&self, ctx: &SyscallContext, handler: u64) -> Result<(), SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let mut state = entry.state.lock().unwrap();
        state.signal_handler = if handler == 0 { None } else { Some(handler) };
        Ok(())
    }

    /// Post `signal` to the target process's main thread; the target pulls
    /// it at its next safe point.
    pub fn process_raise(&self, target: ProcessId, signal: i32) -> Result<(), SystemError> {
        let entry = self.shared.process_entry(target)?;
        let main_thread = entry.state.lock().unwrap().main_thread;
        let thread = self.shared.thread_entry(main_thread)?;
        thread.signals.lock().unwrap().push_back(signal);
        Ok(())
    }

    /// Pull one posted signal for the calling thread.
    pub fn poll_signal(&self, ctx: &SyscallContext) -> Result<Option<i32>, SystemError> {
        let thread = self.shared.thread_entry(ctx.thread)?;
        let signal = thread.signals.lock().unwrap().pop_front();
        Ok(signal)
    }

    pub fn get_working_directory(&self, ctx: &SyscallContext) -> Result<MString, SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let state = entry.state.lock().unwrap();
        Ok(state.working_directory.clone())
    }

    pub fn set_working_directory(
        &self,
        ctx: &SyscallContext,
        path: &str,
    ) -> Result<(), SystemError> {
        if path.is_empty() {
            return Err(SystemError::InvalidParameters);
        }
        let entry = self.shared.process_entry(ctx.process)?;
        let mut state = entry.state.lock().unwrap();
        state.working_directory = MString::from(path);
        Ok(())
    }

    pub fn get_assembly_directory(&self, ctx: &SyscallContext) -> Result<MString, SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let state = entry.state.lock().unwrap();
        Ok(state.base_directory.clone())
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Create a thread in the calling process; `entry` runs on a fresh
    /// kernel thread under the new context.
    pub fn thread_create<F>(
        &self,
        ctx: &SyscallContext,
        name: &str,
        entry: F,
    ) -> Result<ThreadId, SystemError>
    where
        F: FnOnce(SyscallContext) + Send + 'static,
    {
        self.shared.process_entry(ctx.process)?;
        let tid = ThreadId(self.shared.next_thread_id.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(ThreadEntry::new(tid, ctx.process, MString::from(name)));
        self.shared.threads.lock().unwrap().insert(tid.0, thread);

        let shared = self.shared.clone();
        let child_ctx = SyscallContext {
            process: ctx.process,
            thread: tid,
        };
        std::thread::Builder::new()
            .name(format!("vali-thread-{tid}"))
            .spawn(move || {
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry(child_ctx)));
                let code = match outcome {
                    Ok(()) => 0,
                    Err(_) => {
                        error!("thread {tid} terminated by panic");
                        -1
                    }
                };
                if let Ok(thread) = shared.thread_entry(tid) {
                    thread.finish(code);
                }
            })
            .map_err(|_| SystemError::OutOfMemory)?;
        Ok(tid)
    }

    pub fn thread_exit(&self, ctx: &SyscallContext, code: i32) -> Result<(), SystemError> {
        let thread = self.shared.thread_entry(ctx.thread)?;
        thread.finish(code);
        Ok(())
    }

    /// Join a thread of the calling process; cross-process joins are
    /// rejected.
    pub fn thread_join(&self, ctx: &SyscallContext, target: ThreadId) -> Result<i32, SystemError> {
        let thread = self.shared.thread_entry(target)?;
        if thread.process != ctx.process {
            return Err(SystemError::CrossProcess);
        }
        let mut state = thread.state.lock().unwrap();
        while !state.finished {
            state = thread.lifecycle.wait(state).unwrap();
        }
        Ok(state.exit_code)
    }

    pub fn thread_signal(
        &self,
        ctx: &SyscallContext,
        target: ThreadId,
        signal: i32,
    ) -> Result<(), SystemError> {
        let thread = self.shared.thread_entry(target)?;
        if thread.process != ctx.process {
            return Err(SystemError::CrossProcess);
        }
        thread.signals.lock().unwrap().push_back(signal);
        Ok(())
    }

    /// Sleep for `milliseconds`; returns the time actually slept as
    /// observed by the monotonic tick.
    pub fn thread_sleep(&self, milliseconds: u64) -> Result<u64, SystemError> {
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(milliseconds));
        Ok(start.elapsed().as_millis() as u64)
    }

    pub fn thread_yield(&self) {
        std::thread::yield_now();
    }

    pub fn thread_get_current_id(&self, ctx: &SyscallContext) -> Result<ThreadId, SystemError> {
        Ok(self.shared.thread_entry(ctx.thread)?.id)
    }

    pub fn thread_set_current_name(
        &self,
        ctx: &SyscallContext,
        name: &str,
    ) -> Result<(), SystemError> {
        let thread = self.shared.thread_entry(ctx.thread)?;
        thread.state.lock().unwrap().name = MString::from(name);
        Ok(())
    }

    pub fn thread_get_current_name(&self, ctx: &SyscallContext) -> Result<MString, SystemError> {
        let thread = self.shared.thread_entry(ctx.thread)?;
        let state = thread.state.lock().unwrap();
        Ok(state.name.clone())
    }

    // ------------------------------------------------------------------
    // Shared objects
    // ------------------------------------------------------------------

    /// Load a library for the calling process; `None` returns a handle to
    /// the process's own executable.
    pub fn so_load(
        &self,
        ctx: &SyscallContext,
        path: Option<&str>,
    ) -> Result<ImageId, SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let root = entry.state.lock().unwrap().image;
        match path {
            None => Ok(root),
            Some(path) => {
                let mut loader = self.shared.loader.lock().unwrap();
                loader
                    .resolve_library(root, &MString::from(path))
                    .map_err(SystemError::from)
            }
        }
    }

    pub fn so_get_function(
        &self,
        ctx: &SyscallContext,
        handle: ImageId,
        name: &str,
    ) -> Result<u64, SystemError> {
        self.shared.process_entry(ctx.process)?;
        let loader = self.shared.loader.lock().unwrap();
        let image = loader.image(handle)?;
        image
            .find_export(name)
            .map(|export| export.address)
            .ok_or(SystemError::Image(crate::pe::PeError::MissingSymbol(
                name.to_string(),
            )))
    }

    /// Unload a library handle; a process's own executable handle is a
    /// no-op.
    pub fn so_unload(&self, ctx: &SyscallContext, handle: ImageId) -> Result<(), SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let root = entry.state.lock().unwrap().image;
        if handle == root {
            return Ok(());
        }
        let mut loader = self.shared.loader.lock().unwrap();
        loader
            .unload_library(Some(root), handle)
            .map_err(SystemError::from)
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Reserve from the process heap; any flag implies COMMIT, which maps
    /// backing pages with the derived attributes. Returns (virtual,
    /// physical).
    pub fn mem_allocate(
        &self,
        ctx: &SyscallContext,
        size: u64,
        flags: AllocationFlags,
    ) -> Result<(u64, u64), SystemError> {
        if size == 0 {
            return Err(SystemError::InvalidParameters);
        }
        let entry = self.shared.process_entry(ctx.process)?;

        let (address, space) = {
            let mut state = entry.state.lock().unwrap();
            let address = state.heap.allocate(size).ok_or(SystemError::OutOfMemory)?;
            (address, state.space.clone())
        };

        let mut flags = flags;
        if !flags.is_empty() {
            flags |= AllocationFlags::COMMIT;
        }

        let mut physical = 0u64;
        if flags.contains(AllocationFlags::COMMIT) {
            let mut map_flags = MapFlags::READ | MapFlags::WRITE;
            if flags.contains(AllocationFlags::CONTIGUOUS) {
                map_flags |= MapFlags::CONTIGUOUS;
            }
            if flags.contains(AllocationFlags::NOCACHE) {
                map_flags |= MapFlags::NOCACHE;
            }

            let mapped = space.lock().unwrap().map(address, size, map_flags);
            if mapped.is_err() {
                let mut state = entry.state.lock().unwrap();
                state.heap.free(address, size);
                return Err(SystemError::OutOfMemory);
            }
            // Regions map zero-filled, which covers CLEAN.
            physical = address;
        }
        trace!("mem_allocate({size:#x}) => {address:#x}");
        Ok((address, physical))
    }

    pub fn mem_free(&self, ctx: &SyscallContext, address: u64, size: u64) -> Result<(), SystemError> {
        if size == 0 {
            return Err(SystemError::InvalidParameters);
        }
        let entry = self.shared.process_entry(ctx.process)?;
        let space = {
            let mut state = entry.state.lock().unwrap();
            state.heap.free(address, size);
            state.space.clone()
        };
        match space.lock().unwrap().unmap(address, size) {
            Ok(()) => Ok(()),
            // Reserve-only allocations have no backing pages.
            Err(crate::memory::MemoryError::NotMapped(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn mem_query(&self, ctx: &SyscallContext) -> Result<MemoryDescriptor, SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let space = entry.state.lock().unwrap().space.clone();
        let space = space.lock().unwrap();
        let (pages_total, pages_allocated) = space.page_stats();
        Ok(MemoryDescriptor {
            page_size: space.page_size(),
            pages_total,
            pages_allocated,
        })
    }

    /// Map a caller-supplied physical range into the process's
    /// shared-memory window; the low in-page offset is preserved.
    pub fn mem_acquire(
        &self,
        ctx: &SyscallContext,
        physical: u64,
        size: u64,
    ) -> Result<u64, SystemError> {
        if physical == 0 || size == 0 {
            return Err(SystemError::InvalidParameters);
        }
        let entry = self.shared.process_entry(ctx.process)?;

        let offset = physical % PAGE_SIZE;
        let span = (offset + size).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let (base, space) = {
            let mut state = entry.state.lock().unwrap();
            let base = state.shm.allocate(span).ok_or(SystemError::OutOfMemory)?;
            (base, state.space.clone())
        };
        space
            .lock()
            .unwrap()
            .map(base, span, MapFlags::READ | MapFlags::WRITE)?;
        Ok(base + offset)
    }

    pub fn mem_release(
        &self,
        ctx: &SyscallContext,
        address: u64,
        size: u64,
    ) -> Result<(), SystemError> {
        if address == 0 || size == 0 {
            return Err(SystemError::InvalidParameters);
        }
        let entry = self.shared.process_entry(ctx.process)?;
        let offset = address % PAGE_SIZE;
        let base = address - offset;
        let span = (offset + size).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let space = {
            let mut state = entry.state.lock().unwrap();
            state.shm.free(base, span);
            state.space.clone()
        };
        space.lock().unwrap().unmap(base, span)?;
        Ok(())
    }

    /// Change protection; returns the previous flags.
    pub fn mem_protect(
        &self,
        ctx: &SyscallContext,
        address: u64,
        flags: MapFlags,
    ) -> Result<MapFlags, SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let space = entry.state.lock().unwrap().space.clone();
        let previous = space.lock().unwrap().protect(address, flags)?;
        Ok(previous)
    }

    // ------------------------------------------------------------------
    // File mappings
    // ------------------------------------------------------------------

    /// Reserve shared-memory space for a file view; pages fault in lazily
    /// through the mapping's transfer buffer.
    pub fn file_mapping_create(
        &self,
        ctx: &SyscallContext,
        parameters: &FileMappingParameters,
    ) -> Result<u64, SystemError> {
        if parameters.size == 0 {
            return Err(SystemError::InvalidParameters);
        }
        let entry = self.shared.process_entry(ctx.process)?;
        let mut state = entry.state.lock().unwrap();
        let base = state
            .shm
            .allocate(parameters.size)
            .ok_or(SystemError::OutOfMemory)?;
        state.file_mappings.push(FileMapping::new(parameters, base));
        Ok(base)
    }

    /// Tear down the mapping containing `pointer`: unmap whatever pages
    /// materialized and release the reservation.
    pub fn file_mapping_destroy(
        &self,
        ctx: &SyscallContext,
        pointer: u64,
    ) -> Result<(), SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let (mapping, space) = {
            let mut state = entry.state.lock().unwrap();
            let index = state
                .file_mappings
                .iter()
                .position(|mapping| mapping.contains(pointer))
                .ok_or(SystemError::InvalidParameters)?;
            let mapping = state.file_mappings.remove(index);
            state.shm.free(mapping.base, mapping.length);
            (mapping, state.space.clone())
        };

        let mut space = space.lock().unwrap();
        let mut page = mapping.base;
        while page < mapping.base + mapping.length {
            if space.is_mapped(page) {
                let _ = space.unmap(page, PAGE_SIZE);
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Write-back is not implemented; the surface reports success.
    pub fn file_mapping_flush(
        &self,
        ctx: &SyscallContext,
        pointer: u64,
    ) -> Result<(), SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let state = entry.state.lock().unwrap();
        let mapping = state
            .file_mappings
            .iter()
            .find(|mapping| mapping.contains(pointer))
            .ok_or(SystemError::InvalidParameters)?;
        trace!(
            "file_mapping_flush(handle={}, flags={:#x}, offset={:#x}, window={})",
            mapping.file_handle,
            mapping.flags,
            mapping.offset,
            mapping.transfer_buffer.len()
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // IPC
    // ------------------------------------------------------------------

    /// Open a pipe on `port` for the calling process.
    pub fn pipe_open(&self, ctx: &SyscallContext, port: i32) -> Result<(), SystemError> {
        if port < 0 {
            return Err(SystemError::InvalidParameters);
        }
        let entry = self.shared.process_entry(ctx.process)?;
        let mut state = entry.state.lock().unwrap();
        if state.pipes.contains_key(&port) {
            return Err(SystemError::PortExists(port));
        }
        state.pipes.insert(
            port,
            Pipe::new(
                ctx.process,
                port,
                PIPE_DEFAULT_CAPACITY,
                StreamOptions::MULTIPLE_PRODUCERS,
            ),
        );
        Ok(())
    }

    pub fn pipe_close(&self, ctx: &SyscallContext, port: i32) -> Result<(), SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let mut state = entry.state.lock().unwrap();
        match state.pipes.remove(&port) {
            Some(pipe) => {
                pipe.close();
                Ok(())
            }
            None => Err(SystemError::Ipc(IpcError::InvalidPort(port))),
        }
    }

    /// Read from one of the caller's pipes; port -1 addresses the calling
    /// thread's built-in pipe.
    pub fn pipe_read(
        &self,
        ctx: &SyscallContext,
        port: i32,
        out: &mut [u8],
        flags: StreamFlags,
    ) -> Result<usize, SystemError> {
        if out.is_empty() {
            return Ok(0);
        }
        let pipe = if port == PIPE_PORT_THREAD {
            self.shared.thread_entry(ctx.thread)?.pipe.clone()
        } else {
            self.process_pipe(ctx.process, port)?
        };
        Ok(pipe.read(out, flags)?)
    }

    /// Write to a pipe of `target`; with port -1 the target names a thread
    /// and the write goes to its built-in pipe.
    pub fn pipe_write(
        &self,
        ctx: &SyscallContext,
        target: u32,
        port: i32,
        bytes: &[u8],
        flags: StreamFlags,
    ) -> Result<usize, SystemError> {
        if bytes.is_empty() {
            return Err(SystemError::InvalidParameters);
        }
        self.shared.process_entry(ctx.process)?;
        let pipe = if port == PIPE_PORT_THREAD {
            self.shared.thread_entry(ThreadId(target))?.pipe.clone()
        } else {
            self.process_pipe(ProcessId(target), port)?
        };
        Ok(pipe.write(bytes, flags)?)
    }

    /// Sleep until another process wakes us or the timeout elapses.
    pub fn ipc_sleep(&self, ctx: &SyscallContext, timeout: Duration) -> Result<(), SystemError> {
        let entry = self.shared.process_entry(ctx.process)?;
        let deadline = Instant::now() + timeout;
        let mut state = entry.state.lock().unwrap();
        while state.wake_tokens == 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(SystemError::Timeout);
            }
            let (guard, _) = entry
                .lifecycle
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
        }
        state.wake_tokens -= 1;
        Ok(())
    }

    pub fn ipc_wake(&self, target: ProcessId) -> Result<(), SystemError> {
        let entry = self.shared.process_entry(target)?;
        entry.state.lock().unwrap().wake_tokens += 1;
        entry.lifecycle.notify_all();
        Ok(())
    }

    /// Serialize `call` into the target pipe; synchronous calls wait for
    /// the reply.
    pub fn rpc_execute(
        &self,
        ctx: &SyscallContext,
        call: &mut RemoteCall,
        asynchronous: bool,
    ) -> Result<Option<Vec<u8>>, SystemError> {
        let pipe = self.process_pipe(ProcessId(call.to.process), call.to.port)?;

        // Install the sender; port -1 marks the reply target as the
        // calling thread's built-in pipe.
        if call.from.port == PIPE_PORT_THREAD {
            call.from.kind = 1;
            call.from.process = ctx.thread.0;
        } else {
            call.from.kind = 0;
            call.from.process = ctx.process.0;
        }

        rpc_execute_on(&pipe, call)?;
        if asynchronous {
            return Ok(None);
        }
        self.rpc_response(ctx, call).map(Some)
    }

    /// Wait for the reply to an executed call.
    pub fn rpc_response(
        &self,
        ctx: &SyscallContext,
        call: &RemoteCall,
    ) -> Result<Vec<u8>, SystemError> {
        let pipe = if call.from.is_thread() {
            self.shared.thread_entry(ctx.thread)?.pipe.clone()
        } else {
            self.process_pipe(ctx.process, call.from.port)?
        };
        Ok(rpc_response_on(&pipe, call)?)
    }

    /// Receive one remote call on the caller's pipe at `port`.
    pub fn rpc_listen(&self, ctx: &SyscallContext, port: i32) -> Result<RemoteCall, SystemError> {
        let pipe = self.process_pipe(ctx.process, port)?;
        Ok(rpc_listen_on(&pipe)?)
    }

    /// Send the reply bytes back over the route recorded in `call.from`.
    pub fn rpc_respond(
        &self,
        ctx: &SyscallContext,
        call: &RemoteCall,
        bytes: &[u8],
    ) -> Result<(), SystemError> {
        self.shared.process_entry(ctx.process)?;
        let pipe = if call.from.is_thread() {
            self.shared.thread_entry(ThreadId(call.from.process))?.pipe.clone()
        } else {
            self.process_pipe(ProcessId(call.from.process), call.from.port)?
        };
        Ok(rpc_respond_on(&pipe, bytes)?)
    }

    // ------------------------------------------------------------------
    // System
    // ------------------------------------------------------------------

    /// Milliseconds since the kernel object was constructed.
    pub fn system_tick(&self) -> u64 {
        self.shared.boot.elapsed().as_millis() as u64
    }

    fn process_pipe(&self, process: ProcessId, port: i32) -> Result<Pipe, SystemError> {
        let entry = self.shared.process_entry(process)?;
        let state = entry.state.lock().unwrap();
        state
            .pipes
            .get(&port)
            .cloned()
            .ok_or(SystemError::Ipc(IpcError::InvalidPort(port)))
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.shared.phoenix.shutdown();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}
