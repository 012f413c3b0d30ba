//! Worker thread registry.
//!
//! The registry maps logical domain tags onto long-lived worker threads,
//! spawning each worker the first time one of its tags is resolved. It also
//! answers "which dispatcher reaches the calling thread?", which is how a
//! worker schedules a signal onto the thread that owns a wait handle instead
//! of touching that handle from a foreign thread.

pub mod dispatcher;
pub(crate) mod queue;

use crate::config::RegistryConfig;
use crate::error::{BridgeError, Result};
use crate::metrics::ExchangeMetrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use queue::{Task, TaskQueue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use dispatcher::Dispatcher;

/// Inner worker state
struct WorkerInner {
    /// Worker name (shared by all aliased tags)
    name: String,
    /// Task queue drained by the worker thread
    queue: Arc<TaskQueue>,
    /// OS thread id of the worker
    thread_id: ThreadId,
    /// Join handle, taken on shutdown
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a long-lived worker thread
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl WorkerHandle {
    /// Worker name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// OS thread id of the worker
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    /// Dispatcher running callbacks on this worker
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::queue(Arc::clone(&self.inner.queue))
    }

    /// Number of tasks waiting on this worker
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.len()
    }

    /// Enqueue a task; hands it back if the worker is shut down
    pub(crate) fn post(&self, task: Task, delay: Duration) -> std::result::Result<(), Task> {
        self.inner.queue.push(task, delay)
    }

    /// Enqueue a task whose `on_shutdown` replacement runs on this worker if
    /// the worker shuts down before `task` is due
    pub(crate) fn post_or_else(
        &self,
        task: Task,
        on_shutdown: Task,
        delay: Duration,
    ) -> std::result::Result<(), Task> {
        self.inner
            .queue
            .push_with_fallback(task, Some(on_shutdown), delay)
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WorkerHandle {}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.inner.name)
            .field("thread_id", &self.inner.thread_id)
            .finish()
    }
}

/// The designated main thread's task queue.
///
/// Answers and signals routed to the main thread wait here until the main
/// thread pumps the loop (or blocks in a synchronous wait, which pumps it).
pub struct MainLoop {
    queue: Arc<TaskQueue>,
    thread_id: ThreadId,
}

impl MainLoop {
    fn assert_main_thread(&self) {
        assert_eq!(
            thread::current().id(),
            self.thread_id,
            "the main loop may only be pumped from the main thread"
        );
    }

    /// Run every task that is currently due; returns how many ran
    pub fn run_pending(&self) -> usize {
        self.assert_main_thread();
        let mut ran = 0;
        while let Some(task) = self.queue.try_pop() {
            task();
            ran += 1;
        }
        ran
    }

    /// Pump the loop until `done` holds
    pub fn run_until(&self, done: impl Fn() -> bool) -> bool {
        self.assert_main_thread();
        self.queue.run_until(done)
    }

    /// Number of tasks waiting on the main loop
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }
}

/// Inner registry state
struct RegistryInner {
    /// Configuration
    config: RegistryConfig,
    /// Spawned workers by worker name
    workers: Mutex<HashMap<String, WorkerHandle>>,
    /// Queue-backed dispatchers by owning thread
    dispatchers: DashMap<ThreadId, Dispatcher>,
    /// The designated main thread and its loop
    main_loop: MainLoop,
    /// Exchange metrics
    metrics: Arc<ExchangeMetrics>,
    /// Shutdown flag
    shutdown: AtomicBool,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        // Let worker threads exit once nothing can reach them anymore.
        self.main_loop.queue.close();
        for worker in self.workers.get_mut().values() {
            worker.inner.queue.close();
        }
    }
}

/// Registry of domain worker threads
#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<RegistryInner>,
}

impl WorkerRegistry {
    /// Create a registry; the calling thread becomes the designated main thread
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;

        info!(
            domains = config.domains.len(),
            prefix = %config.thread_name_prefix,
            "Creating worker registry"
        );

        let main_loop = MainLoop {
            queue: Arc::new(TaskQueue::new(config.main_loop_name.clone())),
            thread_id: thread::current().id(),
        };

        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                workers: Mutex::new(HashMap::new()),
                dispatchers: DashMap::new(),
                main_loop,
                metrics: Arc::new(ExchangeMetrics::new()),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Get the worker for `tag`, spawning it on first use
    pub fn resolve(&self, tag: &str) -> Result<WorkerHandle> {
        let domain = self
            .inner
            .config
            .domain(tag)
            .ok_or_else(|| BridgeError::InvalidTag(tag.to_string()))?;

        if self.is_shut_down() {
            return Err(BridgeError::ShutDown("worker registry is shut down".into()));
        }

        let worker_name = domain.worker_name();
        let mut workers = self.inner.workers.lock();
        if let Some(worker) = workers.get(worker_name) {
            return Ok(worker.clone());
        }

        let worker = self.spawn_worker(worker_name)?;
        workers.insert(worker_name.to_string(), worker.clone());
        debug!(tag, worker = worker_name, "Resolved domain to new worker");
        Ok(worker)
    }

    fn spawn_worker(&self, name: &str) -> Result<WorkerHandle> {
        let config = &self.inner.config;
        let queue = Arc::new(TaskQueue::new(name));

        let mut builder =
            thread::Builder::new().name(format!("{}{}", config.thread_name_prefix, name));
        if let Some(stack) = config.stack_size_bytes {
            builder = builder.stack_size(stack);
        }

        let worker_queue = Arc::clone(&queue);
        let join = builder.spawn(move || {
            while let Some(task) = worker_queue.pop_blocking() {
                task();
            }
            debug!(worker = %worker_queue.name(), "Worker loop exited");
        })?;

        let thread_id = join.thread().id();
        self.inner
            .dispatchers
            .insert(thread_id, Dispatcher::queue(Arc::clone(&queue)));

        info!(worker = name, "Spawned worker thread");

        Ok(WorkerHandle {
            inner: Arc::new(WorkerInner {
                name: name.to_string(),
                queue,
                thread_id,
                join: Mutex::new(Some(join)),
            }),
        })
    }

    /// Dispatcher that delivers callbacks to the calling thread.
    ///
    /// The main thread gets the main loop, registry workers get their own
    /// queue, and unmanaged threads get a direct dispatcher.
    pub fn dispatcher_for_current_thread(&self) -> Dispatcher {
        let current = thread::current().id();
        if current == self.inner.main_loop.thread_id {
            return Dispatcher::queue(Arc::clone(&self.inner.main_loop.queue));
        }

        match self.inner.dispatchers.get(&current) {
            Some(dispatcher) => dispatcher.clone(),
            None => Dispatcher::direct(),
        }
    }

    /// The designated main thread's loop
    pub fn main_loop(&self) -> &MainLoop {
        &self.inner.main_loop
    }

    /// Whether the calling thread is the designated main thread
    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.inner.main_loop.thread_id
    }

    /// Tags this registry can resolve
    pub fn known_tags(&self) -> Vec<&str> {
        self.inner
            .config
            .domains
            .iter()
            .map(|d| d.tag.as_str())
            .collect()
    }

    /// Number of worker threads spawned so far
    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Exchange metrics shared by everything created against this registry
    pub fn metrics(&self) -> &ExchangeMetrics {
        &self.inner.metrics
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work and join all worker threads.
    ///
    /// Tasks already due still run. Delayed requests that are not yet due end
    /// as cancelled before handling; other delayed tasks are dropped.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker registry");

        let workers: Vec<WorkerHandle> = self.inner.workers.lock().values().cloned().collect();
        for worker in &workers {
            worker.inner.queue.close();
        }
        self.inner.main_loop.queue.close();

        let current = thread::current().id();
        for worker in workers {
            if worker.thread_id() == current {
                continue;
            }
            let join = worker.inner.join.lock().take();
            if let Some(join) = join {
                if join.join().is_err() {
                    warn!(worker = %worker.name(), "Worker thread panicked");
                }
            }
        }

        info!("Worker registry shut down");
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("domains", &self.inner.config.domains.len())
            .field("workers", &self.worker_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn create_registry() -> WorkerRegistry {
        let config = RegistryConfig::new()
            .with_domain("A")
            .with_aliased_domain("fs", "io")
            .with_aliased_domain("db", "io");
        WorkerRegistry::new(config).unwrap()
    }

    #[test]
    fn test_registry_rejects_invalid_config() {
        assert!(matches!(
            WorkerRegistry::new(RegistryConfig::new()),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let registry = create_registry();
        assert_eq!(registry.worker_count(), 0);

        let first = registry.resolve("A").unwrap();
        let second = registry.resolve("A").unwrap();

        assert_eq!(first, second);
        assert_eq!(first.thread_id(), second.thread_id());
        assert_eq!(registry.worker_count(), 1);
    }

    #[test]
    fn test_aliased_tags_share_worker() {
        let registry = create_registry();
        let fs = registry.resolve("fs").unwrap();
        let db = registry.resolve("db").unwrap();
        let a = registry.resolve("A").unwrap();

        assert_eq!(fs, db);
        assert_eq!(fs.name(), "io");
        assert_ne!(fs, a);
        assert_eq!(registry.worker_count(), 2);
    }

    #[test]
    fn test_resolve_unknown_tag() {
        let registry = create_registry();
        match registry.resolve("popup") {
            Err(BridgeError::InvalidTag(tag)) => assert_eq!(tag, "popup"),
            other => panic!("expected InvalidTag, got {:?}", other),
        }
    }

    #[test]
    fn test_worker_thread_is_named() {
        let registry = create_registry();
        let worker = registry.resolve("A").unwrap();
        let (tx, rx) = mpsc::channel();

        let task: Task = Box::new(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        });
        assert!(worker.post(task, Duration::ZERO).is_ok());

        assert_eq!(rx.recv().unwrap().as_deref(), Some("nexus-A"));
    }

    #[test]
    fn test_dispatcher_for_each_kind_of_thread() {
        let registry = create_registry();
        assert!(registry.is_main_thread());
        assert_eq!(registry.dispatcher_for_current_thread().name(), "main");

        let worker = registry.resolve("fs").unwrap();
        let (tx, rx) = mpsc::channel();
        let inner = registry.clone();
        let task: Task = Box::new(move || {
            let _ = tx.send(inner.dispatcher_for_current_thread());
        });
        assert!(worker.post(task, Duration::ZERO).is_ok());
        let on_worker = rx.recv().unwrap();
        assert!(on_worker.same_target(&worker.dispatcher()));

        let unmanaged = {
            let registry = registry.clone();
            thread::spawn(move || registry.dispatcher_for_current_thread())
        };
        assert!(unmanaged.join().unwrap().is_direct());
    }

    #[test]
    fn test_main_loop_runs_pending() {
        let registry = create_registry();
        let (tx, rx) = mpsc::channel();

        registry
            .dispatcher_for_current_thread()
            .dispatch(move || tx.send(7).unwrap());
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.main_loop().pending_tasks(), 1);

        assert_eq!(registry.main_loop().run_pending(), 1);
        assert_eq!(rx.try_recv().unwrap(), 7);
    }

    #[test]
    fn test_main_loop_requires_main_thread() {
        let registry = create_registry();
        let other = {
            let registry = registry.clone();
            thread::spawn(move || registry.main_loop().run_pending())
        };
        assert!(other.join().is_err());
    }

    #[test]
    fn test_shutdown() {
        let registry = create_registry();
        let worker = registry.resolve("A").unwrap();

        registry.shutdown();
        registry.shutdown();

        assert!(registry.is_shut_down());
        assert!(matches!(
            registry.resolve("A"),
            Err(BridgeError::ShutDown(_))
        ));
        assert!(worker.post(Box::new(|| {}), Duration::ZERO).is_err());
    }

    #[test]
    fn test_known_tags() {
        let registry = create_registry();
        assert_eq!(registry.known_tags(), vec!["A", "fs", "db"]);
    }
}
