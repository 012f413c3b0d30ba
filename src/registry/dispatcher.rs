//! Dispatchers route a callback onto the thread that owns some resource.
//!
//! A wait handle is only ever signalled by a task running on its owner's
//! thread. Threads with a task queue (registry workers and the main loop)
//! get a queue-backed dispatcher; any other thread gets a direct dispatcher
//! that runs the callback immediately on whichever thread dispatches it.

use super::queue::{Task, TaskQueue};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Clone)]
enum Target {
    Queue(Arc<TaskQueue>),
    Direct,
}

/// Handle for running callbacks on a specific thread
#[derive(Clone)]
pub struct Dispatcher {
    target: Target,
}

impl Dispatcher {
    pub(crate) fn queue(queue: Arc<TaskQueue>) -> Self {
        Self {
            target: Target::Queue(queue),
        }
    }

    /// A dispatcher for threads without a task queue
    pub fn direct() -> Self {
        Self {
            target: Target::Direct,
        }
    }

    /// Name of the thread this dispatcher targets ("direct" for unmanaged threads)
    pub fn name(&self) -> &str {
        match &self.target {
            Target::Queue(queue) => queue.name(),
            Target::Direct => "direct",
        }
    }

    /// Whether callbacks run inline on the dispatching thread
    pub fn is_direct(&self) -> bool {
        matches!(self.target, Target::Direct)
    }

    /// Whether both dispatchers deliver to the same thread
    pub fn same_target(&self, other: &Dispatcher) -> bool {
        match (&self.target, &other.target) {
            (Target::Queue(a), Target::Queue(b)) => Arc::ptr_eq(a, b),
            (Target::Direct, Target::Direct) => true,
            _ => false,
        }
    }

    /// Run `f` on the target thread as soon as possible
    pub fn dispatch(&self, f: impl FnOnce() + Send + 'static) {
        self.dispatch_task(Box::new(f), Duration::ZERO);
    }

    /// Run `f` on the target thread no earlier than `delay` from now.
    ///
    /// Direct dispatchers have no thread of their own to defer to, so a
    /// delayed callback runs on a short-lived timer thread. The caller is
    /// never blocked.
    pub fn dispatch_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) {
        self.dispatch_task(Box::new(f), delay);
    }

    fn dispatch_task(&self, task: Task, delay: Duration) {
        match &self.target {
            Target::Queue(queue) => {
                if let Err(task) = queue.push(task, delay) {
                    warn!(queue = %queue.name(), "Queue closed, running task inline");
                    task();
                }
            }
            Target::Direct if delay.is_zero() => task(),
            Target::Direct => {
                let spawned = std::thread::Builder::new()
                    .name("nexus-timer".into())
                    .spawn(move || {
                        std::thread::sleep(delay);
                        task();
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "Could not spawn timer thread, dropping delayed task");
                }
            }
        }
    }

    /// Block the calling thread until `done` holds.
    ///
    /// Queue-backed dispatchers pump their queue while waiting, so this must
    /// be called on the dispatcher's own thread. Returns `false` if the queue
    /// closed before `done` held; the caller then falls back to a plain wait.
    pub(crate) fn pump_until(&self, done: impl Fn() -> bool) -> bool {
        match &self.target {
            Target::Queue(queue) => queue.run_until(done),
            Target::Direct => done(),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("target", &self.name())
            .field("direct", &self.is_direct())
            .finish()
    }
}
