//! Job-level mutex.
//!
//! Ownership is handed off directly: unlock transfers the mutex to the
//! head waiter and readies it, so a lock is never stolen by a later
//! arrival. The internal lock is never held across a switch, and wakes
//! happen after it is released.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::job::{Job, JobState};
use super::scheduler::{self, ParkAction};
use super::xunit::ManagerShared;
use super::{JobId, UschedError};

pub(super) struct MutexState {
    pub owner: Option<JobId>,
    pub waiters: VecDeque<Box<Job>>,
}

pub(super) struct MutexInner {
    pub state: std::sync::Mutex<MutexState>,
}

#[derive(Clone)]
pub struct Mutex {
    inner: Arc<MutexInner>,
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            inner: Arc::new(MutexInner {
                state: std::sync::Mutex::new(MutexState {
                    owner: None,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub(super) fn inner(&self) -> &Arc<MutexInner> {
        &self.inner
    }

    /// Acquire, parking the calling job on contention.
    pub fn lock(&self) -> Result<(), UschedError> {
        self.lock_until(None)
    }

    /// Acquire or fail with [`UschedError::Busy`] without blocking.
    pub fn try_lock(&self) -> Result<(), UschedError> {
        let me = scheduler::current_job_id().ok_or(UschedError::NotAJob)?;
        let mut state = self.inner.state.lock().unwrap();
        match state.owner {
            None => {
                state.owner = Some(me);
                Ok(())
            }
            Some(owner) if owner == me => Err(UschedError::AlreadyOwned),
            Some(_) => Err(UschedError::Busy),
        }
    }

    /// Acquire with an upper bound; [`UschedError::TimedOut`] on expiry.
    pub fn timed_lock(&self, timeout: Duration) -> Result<(), UschedError> {
        self.lock_until(Some(Instant::now() + timeout))
    }

    fn lock_until(&self, deadline: Option<Instant>) -> Result<(), UschedError> {
        let me = scheduler::current_job_id().ok_or(UschedError::NotAJob)?;
        loop {
            {
                let mut state = self.inner.state.lock().unwrap();
                match state.owner {
                    None => {
                        state.owner = Some(me);
                        return Ok(());
                    }
                    Some(owner) if owner == me => return Err(UschedError::AlreadyOwned),
                    Some(_) => {}
                }
            }

            // Contended. Arm the timer and park; the wait-queue insertion
            // happens after the context is saved.
            let timer = match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(UschedError::TimedOut);
                    }
                    Some(scheduler::allocate_timer(deadline).ok_or(UschedError::NotAJob)?)
                }
                None => None,
            };
            let timer_id = timer.as_ref().map(|timer| timer.id);

            let inner = self.inner.clone();
            unsafe {
                scheduler::park_current(move |mut job| {
                    job.state = JobState::Blocked;
                    ParkAction::BlockOnMutex {
                        job,
                        mutex: inner,
                        timer,
                    }
                });
            }

            let fired = match timer_id {
                Some(id) => scheduler::timeout_finish(id),
                None => false,
            };
            // Ownership may have been handed to us directly, in which case
            // even a fired timer lost the race.
            if self.inner.state.lock().unwrap().owner == Some(me) {
                return Ok(());
            }
            if fired {
                return Err(UschedError::TimedOut);
            }
        }
    }

    /// Release; hands the mutex to the head waiter if any.
    pub fn unlock(&self) -> Result<(), UschedError> {
        let me = scheduler::current_job_id().ok_or(UschedError::NotAJob)?;
        let mut state = self.inner.state.lock().unwrap();
        if state.owner != Some(me) {
            return Err(UschedError::NotOwner);
        }

        match state.waiters.pop_front() {
            Some(mut next) => {
                state.owner = Some(next.id);
                drop(state);
                next.state = JobState::Running;
                scheduler::with_manager(|manager| manager.push_ready(next))
                    .ok_or(UschedError::NotAJob)?;
            }
            None => {
                state.owner = None;
            }
        }
        Ok(())
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::new()
    }
}

/// Deferred half of a contended lock: runs after the parked job's context
/// was saved. If the owner vanished in between, take the mutex on the
/// job's behalf and ready it again.
pub(super) fn enqueue_blocked(
    inner: &Arc<MutexInner>,
    mut job: Box<Job>,
    manager: &Arc<ManagerShared>,
) {
    let mut state = inner.state.lock().unwrap();
    if state.owner.is_none() {
        state.owner = Some(job.id);
        drop(state);
        job.state = JobState::Running;
        manager.push_ready(job);
    } else {
        state.waiters.push_back(job);
    }
}

/// Release `inner` on behalf of a job that is entering a condition wait.
pub(super) fn unlock_for_wait(inner: &Arc<MutexInner>, manager: &Arc<ManagerShared>) {
    let mut state = inner.state.lock().unwrap();
    match state.waiters.pop_front() {
        Some(mut next) => {
            state.owner = Some(next.id);
            drop(state);
            next.state = JobState::Running;
            manager.push_ready(next);
        }
        None => {
            state.owner = None;
        }
    }
}

/// Timed-lock expiry: pull `job` out of the wait queue and ready it so the
/// lock call can report the timeout.
pub(super) fn notify_job(inner: &Arc<MutexInner>, manager: &Arc<ManagerShared>, job: JobId) {
    let mut state = inner.state.lock().unwrap();
    if let Some(index) = state.waiters.iter().position(|waiting| waiting.id == job) {
        let mut woken = state.waiters.remove(index).expect("index just found");
        drop(state);
        woken.state = JobState::Running;
        manager.push_ready(woken);
    }
}
