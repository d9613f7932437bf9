//! Job-level condition variable.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::job::{Job, JobState};
use super::mutex::Mutex;
use super::scheduler::{self, ParkAction};
use super::xunit::ManagerShared;
use super::{JobId, UschedError};

pub(super) struct CondState {
    pub waiters: VecDeque<Box<Job>>,
}

pub(super) struct CondInner {
    pub state: std::sync::Mutex<CondState>,
}

#[derive(Clone)]
pub struct Condvar {
    inner: Arc<CondInner>,
}

impl Condvar {
    pub fn new() -> Self {
        Condvar {
            inner: Arc::new(CondInner {
                state: std::sync::Mutex::new(CondState {
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Release `mutex`, park until notified, reacquire.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), UschedError> {
        self.wait_until(mutex, None)
    }

    /// As [`Condvar::wait`] with a deadline; whichever of the notify and
    /// the timer fires first wins, expiry reported as
    /// [`UschedError::TimedOut`] after the mutex is reacquired.
    pub fn timed_wait(&self, mutex: &Mutex, timeout: Duration) -> Result<(), UschedError> {
        self.wait_until(mutex, Some(Instant::now() + timeout))
    }

    fn wait_until(&self, mutex: &Mutex, deadline: Option<Instant>) -> Result<(), UschedError> {
        let me = scheduler::current_job_id().ok_or(UschedError::NotAJob)?;
        {
            let state = mutex.inner().state.lock().unwrap();
            if state.owner != Some(me) {
                return Err(UschedError::NotOwner);
            }
        }

        let timer = match deadline {
            Some(deadline) => {
                Some(scheduler::allocate_timer(deadline).ok_or(UschedError::NotAJob)?)
            }
            None => None,
        };
        let timer_id = timer.as_ref().map(|timer| timer.id);

        // The wait-queue insertion and the mutex release both happen after
        // the context is saved, in that order, so a notifier holding the
        // mutex cannot miss us.
        let cond = self.inner.clone();
        let release = mutex.inner().clone();
        unsafe {
            scheduler::park_current(move |mut job| {
                job.state = JobState::Blocked;
                ParkAction::BlockOnCond {
                    job,
                    cond,
                    release,
                    timer,
                }
            });
        }

        let fired = match timer_id {
            Some(id) => scheduler::timeout_finish(id),
            None => false,
        };
        mutex.lock()?;
        if fired {
            return Err(UschedError::TimedOut);
        }
        Ok(())
    }

    /// Move the head waiter to the tail of the ready queue.
    pub fn notify_one(&self) -> Result<(), UschedError> {
        // The queue is only touched under a live manager; popping first
        // could otherwise drop a parked job on the floor.
        scheduler::with_manager(|manager| {
            let woken = self.inner.state.lock().unwrap().waiters.pop_front();
            if let Some(mut job) = woken {
                job.state = JobState::Running;
                manager.push_ready(job);
            }
        })
        .ok_or(UschedError::NotAJob)
    }

    pub fn notify_all(&self) -> Result<(), UschedError> {
        scheduler::with_manager(|manager| {
            let woken: Vec<Box<Job>> = {
                let mut state = self.inner.state.lock().unwrap();
                state.waiters.drain(..).collect()
            };
            for mut job in woken {
                job.state = JobState::Running;
                manager.push_ready(job);
            }
        })
        .ok_or(UschedError::NotAJob)
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Condvar::new()
    }
}

/// Timed-wait expiry: pull `job` out of the wait queue if it is still
/// there and ready it.
pub(super) fn notify_job(inner: &Arc<CondInner>, manager: &Arc<ManagerShared>, job: JobId) {
    let mut state = inner.state.lock().unwrap();
    if let Some(index) = state.waiters.iter().position(|waiting| waiting.id == job) {
        let mut woken = state.waiters.remove(index).expect("index just found");
        drop(state);
        woken.state = JobState::Running;
        manager.push_ready(woken);
    }
}
