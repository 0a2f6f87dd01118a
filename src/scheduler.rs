//! Timer scheduling for idle timeouts.
//!
//! The engine consumes the [`Scheduler`] trait only; [`ThreadScheduler`]
//! is the provided implementation, a binary heap drained by one worker
//! thread. Cancellation is race-safe: [`TimerHandle::cancel`] reports
//! whether the task was still pending, so callers can tell a cancelled
//! timer from one that already fired.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Schedules one-shot tasks after a delay.
pub trait Scheduler: Send + Sync {
    /// Schedule `task` to run once after `delay`.
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Handle to a scheduled task.
#[derive(Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    fn new() -> Self {
        TimerHandle {
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// Cancel the task. Returns true if the task was still pending and
    /// will not run; false if it already fired (or was cancelled).
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn try_fire(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    handle: TimerHandle,
    task: Option<Box<dyn FnOnce() + Send>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SchedulerState {
    heap: BinaryHeap<TimerEntry>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    cond: Condvar,
}

/// A [`Scheduler`] backed by a single worker thread.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    seq: AtomicU64,
}

impl ThreadScheduler {
    /// Create the scheduler and spawn its worker thread.
    pub fn new() -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("h2mux-timer".into())
            .spawn(move || Self::run(worker))
            .expect("failed to spawn timer thread");
        Arc::new(ThreadScheduler {
            shared,
            seq: AtomicU64::new(0),
        })
    }

    /// Stop the worker thread; pending tasks are dropped.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        state.heap.clear();
        self.shared.cond.notify_all();
    }

    fn run(shared: Arc<Shared>) {
        let mut state = shared.state.lock().unwrap();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            match state.heap.peek() {
                None => {
                    state = shared.cond.wait(state).unwrap();
                }
                Some(entry) if entry.deadline > now => {
                    let wait = entry.deadline - now;
                    let (guard, _) = shared.cond.wait_timeout(state, wait).unwrap();
                    state = guard;
                }
                Some(_) => {
                    let mut entry = state.heap.pop().unwrap();
                    drop(state);
                    if entry.handle.try_fire() {
                        if let Some(task) = entry.task.take() {
                            // A panicking task must not take the timer
                            // thread down with it.
                            let result = std::panic::catch_unwind(
                                std::panic::AssertUnwindSafe(task),
                            );
                            if result.is_err() {
                                tracing::warn!("timer task panicked");
                            }
                        }
                    }
                    state = shared.state.lock().unwrap();
                }
            }
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let handle = TimerHandle::new();
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            handle: handle.clone(),
            task: Some(task),
        };
        let mut state = self.shared.state.lock().unwrap();
        if !state.shutdown {
            state.heap.push(entry);
            self.shared.cond.notify_all();
        }
        handle
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    #[test]
    fn test_task_fires_after_delay() {
        let scheduler = ThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn test_cancel_before_fire() {
        let scheduler = ThreadScheduler::new();
        let hit = Arc::new(AtomicBool::new(false));
        let h = Arc::clone(&hit);
        let handle = scheduler.schedule(
            Duration::from_secs(60),
            Box::new(move || {
                h.store(true, Ordering::SeqCst);
            }),
        );
        assert!(handle.cancel());
        // Second cancel reports the timer was no longer pending.
        assert!(!handle.cancel());
        assert!(!hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_after_fire_reports_fired() {
        let scheduler = ThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        let handle = scheduler.schedule(
            Duration::from_millis(5),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!handle.cancel());
    }

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        let scheduler = ThreadScheduler::new();
        let (tx, rx) = mpsc::channel();
        for (i, delay) in [(2u32, 40u64), (1, 20), (0, 5)] {
            let tx = tx.clone();
            scheduler.schedule(
                Duration::from_millis(delay),
                Box::new(move || {
                    tx.send(i).unwrap();
                }),
            );
        }
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
    }
}
