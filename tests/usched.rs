use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use vali_core::usched::{self, Condvar, ExecutionManager, JobParameters, Mutex, UschedError};

/// Jobs of equal standing start in enqueue order.
#[test]
fn ready_queue_is_fifo() {
    let manager = ExecutionManager::new();
    let order = Arc::new(StdMutex::new(Vec::new()));

    let spawn_order = order.clone();
    manager
        .run(move || {
            for index in 0..8 {
                let order = spawn_order.clone();
                usched::queue(move || {
                    order.lock().unwrap().push(index);
                })
                .unwrap();
            }
        })
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
}

/// Two jobs hammering one mutex-protected counter lose no updates. The
/// read-modify-write is split by a yield to force interleaving.
#[test]
fn mutex_ping_pong_loses_no_updates() {
    let manager = ExecutionManager::new();
    let counter = Arc::new(AtomicU64::new(0));
    let mutex = Mutex::new();

    let iterations = 10_000u64;
    manager
        .run({
            let counter = counter.clone();
            move || {
                for _ in 0..2 {
                    let counter = counter.clone();
                    let mutex = mutex.clone();
                    usched::queue(move || {
                        for _ in 0..iterations {
                            mutex.lock().unwrap();
                            let seen = counter.load(Ordering::Relaxed);
                            usched::yield_now();
                            counter.store(seen + 1, Ordering::Relaxed);
                            mutex.unlock().unwrap();
                        }
                    })
                    .unwrap();
                }
            }
        })
        .unwrap();

    assert_eq!(counter.load(Ordering::Relaxed), iterations * 2);
}

/// At most one owner at any instant, also across worker units.
#[test]
fn mutex_excludes_across_units() {
    let manager = ExecutionManager::new();
    manager.spawn_workers(2);

    let mutex = Mutex::new();
    let in_critical = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicUsize::new(0));

    manager
        .run({
            let in_critical = in_critical.clone();
            let entered = entered.clone();
            move || {
                for _ in 0..6 {
                    let mutex = mutex.clone();
                    let in_critical = in_critical.clone();
                    let entered = entered.clone();
                    usched::queue(move || {
                        for _ in 0..200 {
                            mutex.lock().unwrap();
                            assert!(!in_critical.swap(true, Ordering::SeqCst));
                            usched::yield_now();
                            in_critical.store(false, Ordering::SeqCst);
                            entered.fetch_add(1, Ordering::SeqCst);
                            mutex.unlock().unwrap();
                        }
                    })
                    .unwrap();
                }
            }
        })
        .unwrap();

    assert_eq!(entered.load(Ordering::SeqCst), 6 * 200);
}

#[test]
fn try_lock_reports_busy() {
    let manager = ExecutionManager::new();
    let outcome = Arc::new(StdMutex::new(None));

    manager
        .run({
            let outcome = outcome.clone();
            move || {
                let mutex = Mutex::new();
                mutex.lock().unwrap();
                let holder = mutex.clone();
                let outcome = outcome.clone();
                usched::queue(move || {
                    *outcome.lock().unwrap() = Some(holder.try_lock());
                })
                .unwrap();
                usched::yield_now();
                mutex.unlock().unwrap();
            }
        })
        .unwrap();

    assert_eq!(*outcome.lock().unwrap(), Some(Err(UschedError::Busy)));
}

#[test]
fn timed_lock_expires_while_held() {
    let manager = ExecutionManager::new();
    let outcome = Arc::new(StdMutex::new(None));

    manager
        .run({
            let outcome = outcome.clone();
            move || {
                let mutex = Mutex::new();
                mutex.lock().unwrap();

                let contender = mutex.clone();
                let outcome = outcome.clone();
                usched::queue(move || {
                    let started = Instant::now();
                    let result = contender.timed_lock(Duration::from_millis(50));
                    *outcome.lock().unwrap() = Some((result, started.elapsed()));
                })
                .unwrap();

                usched::sleep(Duration::from_millis(200));
                mutex.unlock().unwrap();
            }
        })
        .unwrap();

    let (result, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(result, Err(UschedError::TimedOut));
    assert!(elapsed >= Duration::from_millis(50));
}

/// An untouched condition wait returns TimedOut at or after the deadline.
#[test]
fn timed_wait_expires_on_schedule() {
    let manager = ExecutionManager::new();
    let outcome = Arc::new(StdMutex::new(None));

    manager
        .run({
            let outcome = outcome.clone();
            move || {
                let mutex = Mutex::new();
                let cond = Condvar::new();
                mutex.lock().unwrap();
                let started = Instant::now();
                let result = cond.timed_wait(&mutex, Duration::from_millis(100));
                let elapsed = started.elapsed();
                mutex.unlock().unwrap();
                *outcome.lock().unwrap() = Some((result, elapsed));
            }
        })
        .unwrap();

    let (result, elapsed) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(result, Err(UschedError::TimedOut));
    assert!(elapsed >= Duration::from_millis(100));
    // Loose ceiling; the contract is the lower bound.
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn notify_beats_the_timer() {
    let manager = ExecutionManager::new();
    let outcome = Arc::new(StdMutex::new(None));

    manager
        .run({
            let outcome = outcome.clone();
            move || {
                let mutex = Mutex::new();
                let cond = Condvar::new();

                let notifier_cond = cond.clone();
                usched::queue(move || {
                    usched::sleep(Duration::from_millis(20));
                    notifier_cond.notify_one().unwrap();
                })
                .unwrap();

                let outcome = outcome.clone();
                mutex.lock().unwrap();
                let result = cond.timed_wait(&mutex, Duration::from_secs(5));
                mutex.unlock().unwrap();
                *outcome.lock().unwrap() = Some(result);
            }
        })
        .unwrap();

    assert_eq!(*outcome.lock().unwrap(), Some(Ok(())));
}

#[test]
fn notify_all_readies_waiters_in_order() {
    let manager = ExecutionManager::new();
    let woken = Arc::new(StdMutex::new(Vec::new()));

    manager
        .run({
            let woken = woken.clone();
            move || {
                let mutex = Mutex::new();
                let cond = Condvar::new();

                for index in 0..4 {
                    let mutex = mutex.clone();
                    let cond = cond.clone();
                    let woken = woken.clone();
                    usched::queue(move || {
                        mutex.lock().unwrap();
                        cond.wait(&mutex).unwrap();
                        woken.lock().unwrap().push(index);
                        mutex.unlock().unwrap();
                    })
                    .unwrap();
                }

                // Let all four park before broadcasting.
                for _ in 0..8 {
                    usched::yield_now();
                }
                cond.notify_all().unwrap();
            }
        })
        .unwrap();

    assert_eq!(*woken.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn join_returns_the_exit_code() {
    let manager = ExecutionManager::new();
    let observed = Arc::new(StdMutex::new(None));

    let worker_id = Arc::new(StdMutex::new(None));
    manager
        .run({
            let observed = observed.clone();
            let worker_id = worker_id.clone();
            move || {
                let id = usched::queue(|| {
                    usched::exit(42);
                    unreachable!("exit unwinds the job");
                })
                .unwrap();
                *worker_id.lock().unwrap() = Some(id);
                *observed.lock().unwrap() = Some(usched::join(id));
            }
        })
        .unwrap();

    assert_eq!(*observed.lock().unwrap(), Some(Ok(42)));
    let id = worker_id.lock().unwrap().unwrap();
    assert_eq!(manager.exit_code(id), Some(42));
}

#[test]
fn entry_return_exits_with_zero() {
    let manager = ExecutionManager::new();
    let id = manager.run(|| {}).unwrap();
    assert_eq!(manager.exit_code(id), Some(0));
}

#[test]
fn detached_job_runs_on_its_own_unit() {
    let manager = ExecutionManager::new();
    let ran_on = Arc::new(StdMutex::new(None));

    manager
        .run({
            let ran_on = ran_on.clone();
            move || {
                let ran_on = ran_on.clone();
                let params = JobParameters {
                    detached: true,
                    ..JobParameters::default()
                };
                let id = usched::queue_with(
                    move || {
                        *ran_on.lock().unwrap() =
                            Some(std::thread::current().name().map(str::to_string));
                    },
                    params,
                )
                .unwrap();
                let _ = usched::join(id);
            }
        })
        .unwrap();

    let name = ran_on.lock().unwrap().clone().flatten().unwrap_or_default();
    assert!(name.contains("detached"), "ran on {name}");
}

#[test]
fn sleep_lasts_at_least_the_duration() {
    let manager = ExecutionManager::new();
    let elapsed = Arc::new(StdMutex::new(None));

    manager
        .run({
            let elapsed = elapsed.clone();
            move || {
                let started = Instant::now();
                usched::sleep(Duration::from_millis(60));
                *elapsed.lock().unwrap() = Some(started.elapsed());
            }
        })
        .unwrap();

    assert!(elapsed.lock().unwrap().unwrap() >= Duration::from_millis(60));
}

#[test]
fn tls_slots_and_exit_callbacks() {
    let manager = ExecutionManager::new();
    let destructor_ran = Arc::new(AtomicBool::new(false));

    manager
        .run({
            let destructor_ran = destructor_ran.clone();
            move || {
                usched::tls_set(0, 0x1234).unwrap();
                assert_eq!(usched::tls_get(0), Ok(0x1234));
                assert!(usched::tls_set(99, 1).is_err());

                let destructor_ran = destructor_ran.clone();
                usched::at_exit(move || {
                    destructor_ran.store(true, Ordering::SeqCst);
                })
                .unwrap();
            }
        })
        .unwrap();

    assert!(destructor_ran.load(Ordering::SeqCst));
}

#[test]
fn detach_after_queue_is_unsupported() {
    let manager = ExecutionManager::new();
    let outcome = Arc::new(StdMutex::new(None));
    manager
        .run({
            let outcome = outcome.clone();
            move || {
                let id = usched::queue(|| {}).unwrap();
                *outcome.lock().unwrap() = Some(usched::detach(id));
            }
        })
        .unwrap();
    assert_eq!(
        *outcome.lock().unwrap(),
        Some(Err(UschedError::NotSupported))
    );
}

#[test]
fn unlocking_a_foreign_mutex_is_detected() {
    let manager = ExecutionManager::new();
    let outcome = Arc::new(StdMutex::new(None));
    manager
        .run({
            let outcome = outcome.clone();
            move || {
                let mutex = Mutex::new();
                *outcome.lock().unwrap() = Some(mutex.unlock());
            }
        })
        .unwrap();
    assert_eq!(*outcome.lock().unwrap(), Some(Err(UschedError::NotOwner)));
}
