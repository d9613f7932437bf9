//! Execution units and the execution manager.
//!
//! The primary unit runs on the caller of [`ExecutionManager::run`];
//! workers form a pool fed by the global ready queue; a detached unit is
//! spawned per detached job and consumes only its internal queue. When the
//! last job finishes the primary initiates shutdown and joins every unit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use log::trace;

use super::cond::CondInner;
use super::context::Context;
use super::job::{Job, JobParameters, JobState};
use super::mutex::{self, MutexInner};
use super::scheduler::{self, Scheduler, TimerRequest};
use super::{cond, JobId, UschedError};

/// Internal queue of a detached execution unit.
pub(super) struct DetachedQueue {
    queue: Mutex<VecDeque<Box<Job>>>,
    signal: Condvar,
}

impl DetachedQueue {
    fn new() -> Self {
        DetachedQueue {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    pub(super) fn push(&self, job: Box<Job>) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(job);
        self.signal.notify_all();
    }

    pub(super) fn pop(&self) -> Option<Box<Job>> {
        self.queue.lock().unwrap().pop_front()
    }

    fn wait(&self, deadline: Option<Instant>) {
        let queue = self.queue.lock().unwrap();
        if !queue.is_empty() {
            return;
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    let _ = self.signal.wait_timeout(queue, deadline - now).unwrap();
                }
            }
            None => {
                drop(self.signal.wait(queue).unwrap());
            }
        }
    }
}

enum TimerTarget {
    Sleep(Option<Box<Job>>),
    Mutex(Arc<MutexInner>),
    Cond(Arc<CondInner>),
}

struct TimerEntry {
    id: i32,
    deadline: Instant,
    active: bool,
    job: JobId,
    target: TimerTarget,
}

/// Per-job bookkeeping used by join.
pub(super) struct JobEntry {
    finished: AtomicBool,
    code: AtomicI32,
    pub(super) mutex: super::Mutex,
    pub(super) cond: super::Condvar,
}

impl JobEntry {
    fn new() -> Self {
        JobEntry {
            finished: AtomicBool::new(false),
            code: AtomicI32::new(0),
            mutex: super::Mutex::new(),
            cond: super::Condvar::new(),
        }
    }

    pub(super) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(super) fn exit_code(&self) -> i32 {
        self.code.load(Ordering::Acquire)
    }
}

pub(super) struct ManagerShared {
    ready: Mutex<VecDeque<Box<Job>>>,
    ready_signal: Condvar,
    timers: Mutex<Vec<TimerEntry>>,
    jobs: Mutex<HashMap<u32, Arc<JobEntry>>>,
    live_jobs: AtomicUsize,
    shutdown: AtomicBool,
    next_job_id: AtomicU32,
    next_timer_id: AtomicI32,
    units: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagerShared {
    fn new() -> Self {
        ManagerShared {
            ready: Mutex::new(VecDeque::new()),
            ready_signal: Condvar::new(),
            timers: Mutex::new(Vec::new()),
            jobs: Mutex::new(HashMap::new()),
            live_jobs: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            next_job_id: AtomicU32::new(1),
            next_timer_id: AtomicI32::new(1),
            units: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn push_ready(&self, job: Box<Job>) {
        if let Some(pinned) = job.pinned.clone() {
            pinned.push(job);
            return;
        }
        let mut ready = self.ready.lock().unwrap();
        ready.push_back(job);
        self.ready_signal.notify_all();
    }

    pub(super) fn pop_ready(&self) -> Option<Box<Job>> {
        self.ready.lock().unwrap().pop_front()
    }

    /// Park the unit until work may be available. The primary also wakes
    /// on the live-job count reaching zero so it can initiate shutdown;
    /// both conditions are re-checked under the ready lock to close the
    /// missed-wakeup window.
    fn wait_ready(&self, deadline: Option<Instant>, primary: bool) {
        let ready = self.ready.lock().unwrap();
        if !ready.is_empty() || self.is_shutdown() || (primary && self.live_jobs() == 0) {
            return;
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    let _ = self.ready_signal.wait_timeout(ready, deadline - now).unwrap();
                }
            }
            None => {
                drop(self.ready_signal.wait(ready).unwrap());
            }
        }
    }

    pub(super) fn live_jobs(&self) -> usize {
        self.live_jobs.load(Ordering::Acquire)
    }

    pub(super) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ready = self.ready.lock().unwrap();
        self.ready_signal.notify_all();
    }

    pub(super) fn allocate_timer_id(&self) -> i32 {
        self.next_timer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn insert_sleep_timer(&self, request: TimerRequest, job: Box<Job>) {
        let entry = TimerEntry {
            id: request.id,
            deadline: request.deadline,
            active: true,
            job: job.id,
            target: TimerTarget::Sleep(Some(job)),
        };
        self.timers.lock().unwrap().push(entry);
    }

    pub(super) fn insert_mutex_timer(
        &self,
        request: TimerRequest,
        target: Arc<MutexInner>,
        job: JobId,
    ) {
        self.timers.lock().unwrap().push(TimerEntry {
            id: request.id,
            deadline: request.deadline,
            active: true,
            job,
            target: TimerTarget::Mutex(target),
        });
    }

    pub(super) fn insert_cond_timer(
        &self,
        request: TimerRequest,
        target: Arc<CondInner>,
        job: JobId,
    ) {
        self.timers.lock().unwrap().push(TimerEntry {
            id: request.id,
            deadline: request.deadline,
            active: true,
            job,
            target: TimerTarget::Cond(target),
        });
    }

    /// Fire every expired timer: sleepers go back to ready, timed waiters
    /// are pulled out of their wait queues.
    pub(super) fn update_timers(self: &Arc<Self>) {
        enum Fired {
            Ready(Box<Job>),
            Mutex(Arc<MutexInner>, JobId),
            Cond(Arc<CondInner>, JobId),
        }

        let now = Instant::now();
        let mut fired = Vec::new();
        {
            let mut timers = self.timers.lock().unwrap();
            for entry in timers.iter_mut() {
                if !entry.active || entry.deadline > now {
                    continue;
                }
                entry.active = false;
                match &mut entry.target {
                    TimerTarget::Sleep(slot) => {
                        if let Some(mut job) = slot.take() {
                            job.state = JobState::Running;
                            fired.push(Fired::Ready(job));
                        }
                    }
                    TimerTarget::Mutex(inner) => {
                        fired.push(Fired::Mutex(inner.clone(), entry.job));
                    }
                    TimerTarget::Cond(inner) => {
                        fired.push(Fired::Cond(inner.clone(), entry.job));
                    }
                }
            }
        }

        for action in fired {
            match action {
                Fired::Ready(job) => self.push_ready(job),
                Fired::Mutex(inner, job) => mutex::notify_job(&inner, self, job),
                Fired::Cond(inner, job) => cond::notify_job(&inner, self, job),
            }
        }
    }

    /// Remove the timer; returns whether it had fired.
    pub(super) fn timeout_finish(&self, id: i32) -> bool {
        let mut timers = self.timers.lock().unwrap();
        match timers.iter().position(|entry| entry.id == id) {
            Some(index) => {
                let entry = timers.remove(index);
                !entry.active
            }
            None => false,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.active)
            .map(|entry| entry.deadline)
            .min()
    }

    pub(super) fn job_entry(&self, id: JobId) -> Option<Arc<JobEntry>> {
        self.jobs.lock().unwrap().get(&id.0).cloned()
    }

    /// Publish a finished job's exit code and wake its joiners.
    pub(super) fn complete_job(self: &Arc<Self>, id: JobId, code: i32) {
        let entry = self.job_entry(id);
        if let Some(entry) = entry {
            let _ = entry.mutex.lock();
            entry.code.store(code, Ordering::Release);
            entry.finished.store(true, Ordering::Release);
            let _ = entry.cond.notify_all();
            let _ = entry.mutex.unlock();
        }

        if self.live_jobs.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last job gone; wake idle units so the primary can shut down.
            let _ready = self.ready.lock().unwrap();
            self.ready_signal.notify_all();
        }
    }

    pub(super) fn queue_job(
        self: &Arc<Self>,
        entry: Box<dyn FnOnce() + Send>,
        params: &JobParameters,
    ) -> Result<JobId, UschedError> {
        let id = JobId(self.next_job_id.fetch_add(1, Ordering::Relaxed));
        let mut job = Job::new(id, entry, params)?;
        self.jobs
            .lock()
            .unwrap()
            .insert(id.0, Arc::new(JobEntry::new()));
        self.live_jobs.fetch_add(1, Ordering::AcqRel);

        if params.detached {
            self.spawn_detached_unit(job);
        } else {
            job.pinned = None;
            self.push_ready(job);
        }
        trace!("queued job {}", id.0);
        Ok(id)
    }

    fn spawn_detached_unit(self: &Arc<Self>, mut job: Box<Job>) {
        let queue = Arc::new(DetachedQueue::new());
        job.pinned = Some(queue.clone());
        let pinned_job = job.id;
        queue.push(job);

        let shared = self.clone();
        let handle = std::thread::Builder::new()
            .name("usched-xunit-detached".to_string())
            .spawn(move || {
                let mut sched = Box::new(Scheduler::new(shared, Some(queue)));
                unit_loop(&mut *sched, UnitRole::Detached(pinned_job));
            })
            .expect("failed to spawn a detached execution unit");
        self.units.lock().unwrap().push(handle);
    }

    fn spawn_worker(self: &Arc<Self>) {
        let shared = self.clone();
        let handle = std::thread::Builder::new()
            .name("usched-xunit".to_string())
            .spawn(move || {
                let mut sched = Box::new(Scheduler::new(shared, None));
                unit_loop(&mut *sched, UnitRole::Worker);
            })
            .expect("failed to spawn an execution unit");
        self.units.lock().unwrap().push(handle);
    }
}

#[derive(Clone, Copy)]
enum UnitRole {
    Primary,
    Worker,
    Detached(JobId),
}

fn unit_loop(sched: &mut Scheduler, role: UnitRole) {
    let sched: *mut Scheduler = sched;
    scheduler::install(sched);

    loop {
        let manager = unsafe { (*sched).manager.clone() };
        manager.update_timers();

        if let Some(job) = unsafe { (*sched).take_next_ready() } {
            unsafe {
                (*sched).pending = None;
                (*sched).current = Some(job);
                let target: *mut Job = &mut **(*sched).current.as_mut().expect("just installed");
                let unit_context: *mut Context = &mut (*sched).context;
                Context::switch(unit_context, &(*target).context);
                // A job ran out of ready work and returned to us.
                (*sched).run_pending();
                (*sched).empty_garbage();
            }
            continue;
        }

        match role {
            UnitRole::Primary => {
                if manager.live_jobs() == 0 {
                    manager.begin_shutdown();
                    break;
                }
            }
            UnitRole::Worker => {
                if manager.is_shutdown() {
                    break;
                }
            }
            UnitRole::Detached(job) => {
                let done = manager
                    .job_entry(job)
                    .map(|entry| entry.is_finished())
                    .unwrap_or(true);
                if done {
                    break;
                }
            }
        }

        let deadline = manager.next_deadline();
        unsafe {
            match &(*sched).pinned {
                Some(queue) => queue.wait(deadline),
                None => manager.wait_ready(deadline, matches!(role, UnitRole::Primary)),
            }
        }
    }

    unsafe {
        (*sched).empty_garbage();
    }
    scheduler::uninstall();
}

/// Owner of the execution-unit pool.
pub struct ExecutionManager {
    shared: Arc<ManagerShared>,
}

impl ExecutionManager {
    pub fn new() -> Self {
        ExecutionManager {
            shared: Arc::new(ManagerShared::new()),
        }
    }

    /// Add `count` worker units to the pool. May be called before or
    /// between runs.
    pub fn spawn_workers(&self, count: usize) {
        for _ in 0..count {
            self.shared.spawn_worker();
        }
    }

    /// Queue a job from outside the runtime.
    pub fn queue<F>(&self, entry: F) -> Result<JobId, UschedError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue_with(entry, JobParameters::default())
    }

    pub fn queue_with<F>(&self, entry: F, params: JobParameters) -> Result<JobId, UschedError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.queue_job(Box::new(entry), &params)
    }

    /// Queue `entry` and run the primary unit on the calling thread until
    /// every job has finished; joins all other units before returning.
    pub fn run<F>(&self, entry: F) -> Result<JobId, UschedError>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.queue(entry)?;
        let mut sched = Box::new(Scheduler::new(self.shared.clone(), None));
        unit_loop(&mut sched, UnitRole::Primary);

        loop {
            let handle = self.shared.units.lock().unwrap().pop();
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
        // Allow the manager to be reused for another run.
        self.shared.shutdown.store(false, Ordering::Release);
        Ok(id)
    }

    /// Exit code of a finished job.
    pub fn exit_code(&self, id: JobId) -> Option<i32> {
        let entry = self.shared.job_entry(id)?;
        if entry.is_finished() {
            Some(entry.exit_code())
        } else {
            None
        }
    }
}

impl Default for ExecutionManager {
    fn default() -> Self {
        ExecutionManager::new()
    }
}
