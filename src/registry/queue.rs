//! Time-ordered task queue drained by a single thread.
//!
//! Tasks fire in order of their fire time; tasks with equal fire times keep
//! their submission order. A closed queue rejects new tasks but still hands
//! out tasks that were already due. A delayed task that is not yet due when
//! the queue closes is dropped, or replaced by its shutdown fallback which
//! becomes due immediately.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Unit of work executed on the queue's thread
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

struct Scheduled {
    fire_at: Instant,
    seq: u64,
    task: Task,
    on_close: Option<Task>,
}

// BinaryHeap is a max-heap; invert so the earliest (fire_at, seq) pops first.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

struct QueueState {
    pending: BinaryHeap<Scheduled>,
    next_seq: u64,
    closed: bool,
}

/// Task queue owned by a worker thread or the main loop
pub(crate) struct TaskQueue {
    name: String,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl TaskQueue {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                pending: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Schedule a task to run no earlier than `delay` from now.
    ///
    /// Hands the task back if the queue is closed.
    pub(crate) fn push(&self, task: Task, delay: Duration) -> Result<(), Task> {
        self.push_with_fallback(task, None, delay)
    }

    /// Like [`TaskQueue::push`]; `on_close` runs instead of `task` if the
    /// queue closes before `task` is due.
    pub(crate) fn push_with_fallback(
        &self,
        task: Task,
        on_close: Option<Task>,
        delay: Duration,
    ) -> Result<(), Task> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(task);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(Scheduled {
            fire_at: Instant::now() + delay,
            seq,
            task,
            on_close,
        });
        drop(state);

        self.ready.notify_one();
        Ok(())
    }

    /// Block until a task is due. Returns `None` once the queue is closed
    /// and nothing due remains.
    pub(crate) fn pop_blocking(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            match state.pending.peek().map(|s| s.fire_at) {
                Some(fire_at) if fire_at <= now => {
                    return state.pending.pop().map(|s| s.task);
                }
                _ if state.closed => return None,
                Some(fire_at) => {
                    self.ready.wait_until(&mut state, fire_at);
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    /// Take a due task without blocking
    pub(crate) fn try_pop(&self) -> Option<Task> {
        let mut state = self.state.lock();
        let due = state
            .pending
            .peek()
            .is_some_and(|s| s.fire_at <= Instant::now());
        if due {
            state.pending.pop().map(|s| s.task)
        } else {
            None
        }
    }

    /// Run tasks on the calling thread until `done` holds.
    ///
    /// Returns `false` if the queue closed first.
    pub(crate) fn run_until(&self, done: impl Fn() -> bool) -> bool {
        loop {
            if done() {
                return true;
            }
            match self.pop_blocking() {
                Some(task) => task(),
                None => return done(),
            }
        }
    }

    /// Reject further tasks and wake the draining thread
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;

        let now = Instant::now();
        let mut dropped = 0;
        let mut fallbacks = 0;
        let pending = std::mem::take(&mut state.pending).into_vec();
        for scheduled in pending {
            if scheduled.fire_at <= now {
                state.pending.push(scheduled);
                continue;
            }
            match scheduled.on_close {
                Some(on_close) => {
                    fallbacks += 1;
                    state.pending.push(Scheduled {
                        fire_at: now,
                        seq: scheduled.seq,
                        task: on_close,
                        on_close: None,
                    });
                }
                None => dropped += 1,
            }
        }
        drop(state);

        if fallbacks > 0 {
            tracing::debug!(queue = %self.name, fallbacks, "Delayed tasks replaced by their close fallback");
        }
        if dropped > 0 {
            tracing::warn!(queue = %self.name, dropped, "Dropped delayed tasks on close");
        }
        self.ready.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> Task {
        let log = Arc::clone(log);
        Box::new(move || log.lock().push(value))
    }

    #[test]
    fn test_fifo_for_immediate_tasks() {
        let queue = TaskQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            assert!(queue.push(recorder(&log, i), Duration::ZERO).is_ok());
        }
        while let Some(task) = queue.try_pop() {
            task();
        }

        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_delayed_task_fires_later() {
        let queue = TaskQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(queue
            .push(recorder(&log, 1), Duration::from_millis(30))
            .is_ok());
        assert!(queue.push(recorder(&log, 2), Duration::ZERO).is_ok());

        let start = Instant::now();
        queue.pop_blocking().unwrap()();
        queue.pop_blocking().unwrap()();

        assert_eq!(*log.lock(), vec![2, 1]);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_try_pop_skips_future_tasks() {
        let queue = TaskQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(queue
            .push(recorder(&log, 1), Duration::from_secs(60))
            .is_ok());

        assert!(queue.try_pop().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_closed_queue_rejects_and_drains_due_tasks() {
        let queue = TaskQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(queue.push(recorder(&log, 1), Duration::ZERO).is_ok());
        assert!(queue
            .push(recorder(&log, 2), Duration::from_secs(60))
            .is_ok());
        queue.close();

        assert!(queue.is_closed());
        assert!(queue.push(recorder(&log, 3), Duration::ZERO).is_err());
        queue.pop_blocking().unwrap()();
        assert!(queue.pop_blocking().is_none());
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_close_swaps_delayed_task_for_fallback() {
        let queue = TaskQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(queue.push(recorder(&log, 1), Duration::ZERO).is_ok());
        assert!(queue
            .push_with_fallback(
                recorder(&log, 2),
                Some(recorder(&log, 20)),
                Duration::from_secs(60),
            )
            .is_ok());
        assert!(queue
            .push_with_fallback(recorder(&log, 3), None, Duration::from_secs(60))
            .is_ok());
        queue.close();
        queue.close();

        assert_eq!(queue.len(), 2);
        while let Some(task) = queue.pop_blocking() {
            task();
        }
        assert_eq!(*log.lock(), vec![1, 20]);
    }

    #[test]
    fn test_run_until_from_other_thread() {
        let queue = Arc::new(TaskQueue::new("test"));
        let counter = Arc::new(AtomicUsize::new(0));

        let producer = {
            let queue = Arc::clone(&queue);
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                for _ in 0..3 {
                    let counter = Arc::clone(&counter);
                    let task: Task = Box::new(move || {
                        counter.fetch_add(1, AtomicOrdering::SeqCst);
                    });
                    assert!(queue.push(task, Duration::from_millis(5)).is_ok());
                }
            })
        };

        assert!(queue.run_until(|| counter.load(AtomicOrdering::SeqCst) == 3));
        producer.join().unwrap();
    }
}
