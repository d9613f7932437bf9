//! Job objects and the job-level API surface.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;

use super::context::Context;
use super::scheduler::{self, ParkAction};
use super::xunit::DetachedQueue;
use super::{JobId, UschedError};

pub(super) const STACK_MINIMUM: usize = 4096;
pub(super) const TLS_SLOTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum JobState {
    Created,
    Running,
    Blocked,
    Finishing,
}

/// Parameters for [`queue_with`].
#[derive(Debug, Clone)]
pub struct JobParameters {
    pub stack_size: usize,
    /// Detached jobs get their own execution unit instead of entering the
    /// worker pool.
    pub detached: bool,
    /// Advisory on the hosted runtime; unit threads are scheduled by the
    /// host kernel.
    pub affinity: Option<usize>,
}

impl Default for JobParameters {
    fn default() -> Self {
        JobParameters {
            stack_size: 256 * 1024,
            detached: false,
            affinity: None,
        }
    }
}

pub(super) struct Job {
    pub(super) id: JobId,
    pub(super) state: JobState,
    pub(super) context: Context,
    /// Owned stack; freed only after the job has switched away for good.
    stack: Box<[u8]>,
    pub(super) entry: Option<Box<dyn FnOnce() + Send>>,
    /// Detached jobs are re-queued onto their own unit, never the pool.
    pub(super) pinned: Option<Arc<DetachedQueue>>,
    pub(super) tls: [usize; TLS_SLOTS],
    pub(super) at_exit: Vec<Box<dyn FnOnce() + Send>>,
}

// Jobs migrate between execution units through the ready queue. The raw
// stack pointer inside `context` is only live while exactly one unit runs
// the job; every hand-over happens after the context has been saved.
unsafe impl Send for Job {}

impl Job {
    pub(super) fn new(
        id: JobId,
        entry: Box<dyn FnOnce() + Send>,
        params: &JobParameters,
    ) -> Result<Box<Job>, UschedError> {
        if params.stack_size < STACK_MINIMUM {
            return Err(UschedError::StackTooSmall);
        }

        let mut job = Box::new(Job {
            id,
            state: JobState::Created,
            context: Context::empty(),
            stack: vec![0u8; params.stack_size].into_boxed_slice(),
            entry: Some(entry),
            pinned: None,
            tls: [0; TLS_SLOTS],
            at_exit: Vec::new(),
        });

        // The first switch into the job enters the trampoline with this
        // pointer; the box gives it a stable address.
        let job_ptr: *mut Job = &mut *job;
        unsafe {
            let stack = std::slice::from_raw_parts_mut(
                (*job_ptr).stack.as_mut_ptr(),
                (&(*job_ptr).stack).len(),
            );
            (*job_ptr).context.prepare_first_run(stack, job_ptr);
        }
        Ok(job)
    }
}

/// Panic payload used by [`exit`] to unwind a job with a code.
struct JobExitPayload(i32);

/// First function executed on a fresh job stack; entered from the
/// trampoline with the job pointer in hand.
pub(super) unsafe extern "C" fn task_main(job: *mut Job) -> ! {
    // Dispose of whatever context switched into us.
    scheduler::run_pending_on_current();

    unsafe {
        (*job).state = JobState::Running;
    }
    let entry = unsafe { (*job).entry.take() }.expect("job started without an entry");

    let code = match panic::catch_unwind(AssertUnwindSafe(entry)) {
        Ok(()) => 0,
        Err(payload) => match payload.downcast::<JobExitPayload>() {
            Ok(exit) => exit.0,
            Err(payload) => {
                let description = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("job panicked: {description}");
                -1
            }
        },
    };

    unsafe { finalize(job, code) }
}

/// Run per-job destructors, publish the exit code and retire the job.
unsafe fn finalize(job: *mut Job, code: i32) -> ! {
    let callbacks = std::mem::take(unsafe { &mut (*job).at_exit });
    for callback in callbacks {
        let _ = panic::catch_unwind(AssertUnwindSafe(callback));
    }

    let id = unsafe { (*job).id };
    scheduler::with_manager(|manager| manager.complete_job(id, code));

    unsafe {
        (*job).state = JobState::Finishing;
        scheduler::finish_current()
    }
}

/// Voluntarily give up the unit; no-op when nothing else is ready.
pub fn yield_now() {
    unsafe { scheduler::yield_current() }
}

/// Park the calling job for at least `duration`. Outside of a job this
/// falls back to a plain thread sleep.
pub fn sleep(duration: Duration) {
    if !scheduler::in_job() {
        std::thread::sleep(duration);
        return;
    }
    let deadline = Instant::now() + duration;
    let timer = scheduler::allocate_timer(deadline).expect("job context without a manager");
    let timer_id = timer.id;
    unsafe {
        scheduler::park_current(move |mut job| {
            job.state = JobState::Blocked;
            ParkAction::Sleep { job, timer }
        });
    }
    let _ = scheduler::timeout_finish(timer_id);
}

/// End the calling job with `code`; unwinds so locals are dropped. No-op
/// outside a job.
pub fn exit(code: i32) {
    if scheduler::in_job() {
        panic::panic_any(JobExitPayload(code));
    }
}

pub fn current_job() -> Option<JobId> {
    scheduler::current_job_id()
}

/// Queue a new job into the worker pool from inside a running job.
pub fn queue<F>(entry: F) -> Result<JobId, UschedError>
where
    F: FnOnce() + Send + 'static,
{
    queue_with(entry, JobParameters::default())
}

pub fn queue_with<F>(entry: F, params: JobParameters) -> Result<JobId, UschedError>
where
    F: FnOnce() + Send + 'static,
{
    scheduler::with_manager(|manager| manager.queue_job(Box::new(entry), &params))
        .ok_or(UschedError::NotAJob)?
}

/// Wait until `id` finishes and return its exit code.
pub fn join(id: JobId) -> Result<i32, UschedError> {
    let entry = scheduler::with_manager(|manager| manager.job_entry(id))
        .ok_or(UschedError::NotAJob)?
        .ok_or(UschedError::UnknownJob)?;

    entry.mutex.lock()?;
    while !entry.is_finished() {
        entry.cond.wait(&entry.mutex)?;
    }
    let code = entry.exit_code();
    entry.mutex.unlock()?;
    Ok(code)
}

/// Detaching an already-queued job would require migrating it off
/// whichever unit currently runs it; request it at queue time instead.
pub fn detach(_id: JobId) -> Result<(), UschedError> {
    Err(UschedError::NotSupported)
}

/// Read the calling job's storage slot.
pub fn tls_get(slot: usize) -> Result<usize, UschedError> {
    if slot >= TLS_SLOTS {
        return Err(UschedError::InvalidSlot);
    }
    scheduler::with_current_job(|job| job.tls[slot]).ok_or(UschedError::NotAJob)
}

pub fn tls_set(slot: usize, value: usize) -> Result<(), UschedError> {
    if slot >= TLS_SLOTS {
        return Err(UschedError::InvalidSlot);
    }
    scheduler::with_current_job(|job| job.tls[slot] = value).ok_or(UschedError::NotAJob)
}

/// Register a destructor run when the calling job exits.
pub fn at_exit<F>(callback: F) -> Result<(), UschedError>
where
    F: FnOnce() + Send + 'static,
{
    scheduler::with_current_job(|job| job.at_exit.push(Box::new(callback)))
        .ok_or(UschedError::NotAJob)
}
