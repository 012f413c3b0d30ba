//! Request side of an exchange: runs the handler on its domain worker.

use super::EventCallback;
use crate::error::{BridgeError, Result};
use crate::event::wait::WaitHandle;
use crate::event::{Abandoned, Event, EventState, Handling};
use crate::registry::{WorkerHandle, WorkerRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

struct RequestInner<T> {
    /// Domain tag the receiver was resolved from
    tag: String,
    /// Worker running the handler
    worker: WorkerHandle,
    /// Registry used for dispatcher lookup and metrics
    registry: WorkerRegistry,
    /// Handler invoked once per request
    on_request: EventCallback<T>,
    /// Cleanup for events cancelled before their handler ran
    on_cancel: Option<EventCallback<T>>,
}

/// Receives events on a domain worker and runs the request handler
pub struct RequestReceiver<T> {
    inner: Arc<RequestInner<T>>,
}

impl<T> Clone for RequestReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> RequestReceiver<T> {
    /// Create a receiver whose handler runs on the worker for `tag`
    pub fn new<F>(registry: &WorkerRegistry, tag: &str, on_request: F) -> Result<Self>
    where
        F: Fn(&Arc<Event<T>>) + Send + Sync + 'static,
    {
        Self::build(registry, tag, Arc::new(on_request), None)
    }

    /// Like [`RequestReceiver::new`], with a cleanup hook for events
    /// cancelled before their handler ran
    pub fn with_cancel_hook<F, C>(
        registry: &WorkerRegistry,
        tag: &str,
        on_request: F,
        on_cancel: C,
    ) -> Result<Self>
    where
        F: Fn(&Arc<Event<T>>) + Send + Sync + 'static,
        C: Fn(&Arc<Event<T>>) + Send + Sync + 'static,
    {
        Self::build(registry, tag, Arc::new(on_request), Some(Arc::new(on_cancel)))
    }

    fn build(
        registry: &WorkerRegistry,
        tag: &str,
        on_request: EventCallback<T>,
        on_cancel: Option<EventCallback<T>>,
    ) -> Result<Self> {
        let worker = registry.resolve(tag)?;
        Ok(Self {
            inner: Arc::new(RequestInner {
                tag: tag.to_string(),
                worker,
                registry: registry.clone(),
                on_request,
                on_cancel,
            }),
        })
    }

    /// Domain tag
    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    /// Worker running the handler
    pub fn worker(&self) -> &WorkerHandle {
        &self.inner.worker
    }

    /// Post an event to the handler thread.
    ///
    /// Synchronous events block here until answered and have ended by the
    /// time this returns. If the worker shuts down before handling the
    /// event, the event ends as cancelled and `BridgeError::ShutDown` is
    /// returned.
    pub fn post(&self, event: &Arc<Event<T>>) -> Result<()> {
        self.post_delayed(event, Duration::ZERO)
    }

    /// Post an event that the handler may not see before `delay` elapses
    #[instrument(skip(self, event), fields(event_id = %event.id(), tag = %self.inner.tag))]
    pub fn post_delayed(&self, event: &Arc<Event<T>>, delay: Duration) -> Result<()> {
        let registry = &self.inner.registry;
        let caller = registry.dispatcher_for_current_thread();

        let completion = {
            let mut inner = event.lock();
            assert_eq!(
                inner.state,
                EventState::Initial,
                "event {} was already posted",
                event.id()
            );
            assert_ne!(
                inner.handling,
                Handling::Unset,
                "event {} has no handling mode",
                event.id()
            );
            assert!(
                !inner.handling.is_async() || inner.answer_target.is_some(),
                "async event {} has no answer receiver",
                event.id()
            );

            event.bind_registry(registry);
            event.transition(&mut inner, EventState::RequestSent);
            if inner.handling.is_sync() {
                Some(
                    inner
                        .completion_wait
                        .get_or_insert_with(|| WaitHandle::new(caller))
                        .clone(),
                )
            } else {
                None
            }
        };

        registry.metrics().record_post();
        debug!(delay_ms = delay.as_millis() as u64, "Posting event");

        let task = {
            let receiver = self.clone();
            let posted = Arc::clone(event);
            Box::new(move || receiver.on_received(posted))
        };
        let on_shutdown = {
            let receiver = self.clone();
            let posted = Arc::clone(event);
            Box::new(move || receiver.on_shut_down(&posted))
        };
        if self
            .inner
            .worker
            .post_or_else(task, on_shutdown, delay)
            .is_err()
        {
            self.on_shut_down(event);
            return Err(self.shut_down_error());
        }

        if let Some(completion) = completion {
            completion.wait(registry.metrics());
            if !event.finish_synchronous() {
                return Err(self.shut_down_error());
            }
        }
        Ok(())
    }

    /// Send the answer of a manual-answer event
    pub fn manual_answer(&self, event: &Arc<Event<T>>) {
        let inner = event.lock();
        assert!(
            inner.handling.is_manual(),
            "manual_answer on event {} with {:?} handling",
            event.id(),
            inner.handling
        );
        assert_eq!(
            inner.state,
            EventState::RequestReceived,
            "manual_answer on event {} in state {}",
            event.id(),
            inner.state
        );
        event.deliver_answer(inner);
    }

    /// Runs on the worker, once per posted event
    fn on_received(&self, event: Arc<Event<T>>) {
        let unhandled = {
            let mut inner = event.lock();
            assert_eq!(
                inner.state,
                EventState::RequestSent,
                "event {} reached its handler in state {}",
                event.id(),
                inner.state
            );
            if inner.cancelled {
                Some(event.abandon(&mut inner))
            } else {
                event.transition(&mut inner, EventState::RequestReceived);
                None
            }
        };

        if let Some(abandoned) = unhandled {
            debug!(event_id = %event.id(), "Event cancelled before handling");
            self.finish_unhandled(&event, abandoned);
            return;
        }

        (self.inner.on_request)(&event);
        self.inner.registry.metrics().record_handled();

        // Checkpoint: a canceller arriving from here on must not wait.
        let mut inner = event.lock();
        inner.cancel_signal_ahead = true;
        if let Some(ack) = inner.cancel_ack_wait.clone() {
            ack.signal();
        }

        if inner.handling.is_manual() {
            return;
        }
        event.deliver_answer(inner);
    }

    /// Runs instead of `on_received` when the worker refused or dropped the
    /// request
    fn on_shut_down(&self, event: &Arc<Event<T>>) {
        warn!(
            event_id = %event.id(),
            worker = %self.inner.worker.name(),
            "Worker is shut down, ending event"
        );
        let abandoned = {
            let mut inner = event.lock();
            inner.cancelled = true;
            event.abandon(&mut inner)
        };
        self.finish_unhandled(event, abandoned);
    }

    fn finish_unhandled(&self, event: &Arc<Event<T>>, abandoned: Abandoned) {
        if let Some(on_cancel) = &self.inner.on_cancel {
            on_cancel(event);
        }
        self.inner
            .registry
            .metrics()
            .record_cancelled_before_handling();
        abandoned.signal_all();
    }

    fn shut_down_error(&self) -> BridgeError {
        BridgeError::ShutDown(format!(
            "worker '{}' is shut down",
            self.inner.worker.name()
        ))
    }
}

impl<T> std::fmt::Debug for RequestReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestReceiver")
            .field("tag", &self.inner.tag)
            .field("worker", &self.inner.worker.name())
            .field("cancel_hook", &self.inner.on_cancel.is_some())
            .finish()
    }
}
