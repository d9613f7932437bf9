//! Per-unit scheduler state and the switch protocol.
//!
//! The disposition of a job that switches away (re-queue, wait-queue,
//! garbage) is carried as a [`ParkAction`] and executed by the *next*
//! context to run, after the outgoing context has been fully saved. That
//! closes the window where another unit could resume a job whose registers
//! were not stored yet.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Instant;

use super::cond::CondInner;
use super::context::Context;
use super::job::Job;
use super::mutex::{self, MutexInner};
use super::xunit::{DetachedQueue, ManagerShared};
use super::JobId;

thread_local! {
    static SCHEDULER: Cell<*mut Scheduler> = const { Cell::new(std::ptr::null_mut()) };
}

pub(super) struct TimerRequest {
    pub id: i32,
    pub deadline: Instant,
}

pub(super) enum ParkAction {
    /// Back onto the ready queue.
    Ready(Box<Job>),
    /// Job finished; destroy it from unit context.
    Garbage(Box<Job>),
    /// Held by its timer until the deadline passes.
    Sleep { job: Box<Job>, timer: TimerRequest },
    BlockOnMutex {
        job: Box<Job>,
        mutex: Arc<MutexInner>,
        timer: Option<TimerRequest>,
    },
    BlockOnCond {
        job: Box<Job>,
        cond: Arc<CondInner>,
        /// User mutex released once the job sits in the wait queue.
        release: Arc<MutexInner>,
        timer: Option<TimerRequest>,
    },
}

pub(super) struct Scheduler {
    pub(super) manager: Arc<ManagerShared>,
    /// Saved context of the unit's run loop.
    pub(super) context: Context,
    pub(super) current: Option<Box<Job>>,
    pub(super) pending: Option<ParkAction>,
    pub(super) garbage: Vec<Box<Job>>,
    /// Set on detached units; the only source of work for them.
    pub(super) pinned: Option<Arc<DetachedQueue>>,
}

impl Scheduler {
    pub(super) fn new(manager: Arc<ManagerShared>, pinned: Option<Arc<DetachedQueue>>) -> Self {
        Scheduler {
            manager,
            context: Context::empty(),
            current: None,
            pending: None,
            garbage: Vec::new(),
            pinned,
        }
    }

    pub(super) fn take_next_ready(&mut self) -> Option<Box<Job>> {
        match &self.pinned {
            Some(queue) => queue.pop(),
            None => self.manager.pop_ready(),
        }
    }

    /// Execute the deferred disposition of the job that switched away.
    pub(super) fn run_pending(&mut self) {
        let Some(action) = self.pending.take() else {
            return;
        };
        match action {
            ParkAction::Ready(job) => self.manager.push_ready(job),
            ParkAction::Garbage(job) => self.garbage.push(job),
            ParkAction::Sleep { job, timer } => {
                self.manager.insert_sleep_timer(timer, job);
            }
            ParkAction::BlockOnMutex { job, mutex, timer } => {
                let job_id = job.id;
                mutex::enqueue_blocked(&mutex, job, &self.manager);
                if let Some(timer) = timer {
                    self.manager.insert_mutex_timer(timer, mutex, job_id);
                }
            }
            ParkAction::BlockOnCond {
                job,
                cond,
                release,
                timer,
            } => {
                let job_id = job.id;
                cond.state.lock().unwrap().waiters.push_back(job);
                mutex::unlock_for_wait(&release, &self.manager);
                if let Some(timer) = timer {
                    self.manager.insert_cond_timer(timer, cond, job_id);
                }
            }
        }
    }

    pub(super) fn empty_garbage(&mut self) {
        self.garbage.clear();
    }
}

pub(super) fn install(sched: *mut Scheduler) {
    SCHEDULER.with(|cell| cell.set(sched));
}

pub(super) fn uninstall() {
    SCHEDULER.with(|cell| cell.set(std::ptr::null_mut()));
}

fn tls() -> *mut Scheduler {
    SCHEDULER.with(|cell| cell.get())
}

pub(super) fn in_job() -> bool {
    let sched = tls();
    !sched.is_null() && unsafe { (*sched).current.is_some() }
}

pub(super) fn current_job_id() -> Option<JobId> {
    let sched = tls();
    if sched.is_null() {
        return None;
    }
    unsafe { (*sched).current.as_ref().map(|job| job.id) }
}

pub(super) fn with_current_job<R>(operate: impl FnOnce(&mut Job) -> R) -> Option<R> {
    let sched = tls();
    if sched.is_null() {
        return None;
    }
    unsafe { (*sched).current.as_mut().map(|job| operate(job)) }
}

pub(super) fn with_manager<R>(operate: impl FnOnce(&Arc<ManagerShared>) -> R) -> Option<R> {
    let sched = tls();
    if sched.is_null() {
        return None;
    }
    Some(operate(unsafe { &(*sched).manager }))
}

pub(super) fn allocate_timer(deadline: Instant) -> Option<TimerRequest> {
    with_manager(|manager| TimerRequest {
        id: manager.allocate_timer_id(),
        deadline,
    })
}

/// Remove the timer; true when it had already fired.
pub(super) fn timeout_finish(id: i32) -> bool {
    with_manager(|manager| manager.timeout_finish(id)).unwrap_or(false)
}

pub(super) fn run_pending_on_current() {
    let sched = tls();
    if !sched.is_null() {
        unsafe { (*sched).run_pending() };
    }
}

/// Switch away from the current job. `build` turns the outgoing job into
/// its park action; `next` is the context to resume (the unit loop when
/// `None`).
///
/// # Safety
/// Must run on a job's stack with a scheduler installed.
unsafe fn switch_current(
    build: impl FnOnce(Box<Job>) -> ParkAction,
    next: Option<Box<Job>>,
) {
    let sched = tls();
    debug_assert!(!sched.is_null(), "switch outside an execution unit");
    unsafe {
        let mut job = (*sched)
            .current
            .take()
            .expect("switch without a current job");
        let save: *mut Context = &mut job.context;
        (*sched).pending = Some(build(job));

        match next {
            Some(next_job) => {
                (*sched).current = Some(next_job);
                let target: *mut Job = &mut **(*sched).current.as_mut().expect("just installed");
                Context::switch(save, &(*target).context);
            }
            None => {
                let unit_context: *const Context = &(*sched).context;
                Context::switch(save, unit_context);
            }
        }
    }

    // Resumed, possibly on a different unit; dispose of whoever switched
    // into us.
    run_pending_on_current();
}

/// Park the current job with `build`; picks the next ready job itself.
pub(super) unsafe fn park_current(build: impl FnOnce(Box<Job>) -> ParkAction) {
    let sched = tls();
    debug_assert!(!sched.is_null());
    let next = unsafe { (*sched).take_next_ready() };
    unsafe { switch_current(build, next) };
}

/// Cooperative yield; skips the switch entirely when nothing is ready.
pub(super) unsafe fn yield_current() {
    let sched = tls();
    if sched.is_null() {
        return;
    }
    unsafe {
        if (*sched).current.is_none() {
            return;
        }
        (*sched).manager.update_timers();
        let Some(next) = (*sched).take_next_ready() else {
            return;
        };
        switch_current(ParkAction::Ready, Some(next));
    }
}

/// Retire the current job into the garbage bin; never returns.
pub(super) unsafe fn finish_current() -> ! {
    let sched = tls();
    debug_assert!(!sched.is_null());
    unsafe {
        let next = (*sched).take_next_ready();
        switch_current(ParkAction::Garbage, next);
    }
    unreachable!("a finished job was resumed");
}
