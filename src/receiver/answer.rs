//! Answer side of an asynchronous exchange.

use super::EventCallback;
use crate::event::{Event, EventState};
use crate::registry::{Dispatcher, WorkerHandle, WorkerRegistry};
use std::sync::Arc;
use tracing::debug;

struct AnswerInner<T> {
    /// Thread the answer callback runs on
    dispatcher: Dispatcher,
    /// Callback invoked once per delivered answer
    on_answer: EventCallback<T>,
}

/// Receives answers of async events on the thread that issued them
pub struct AnswerReceiver<T> {
    inner: Arc<AnswerInner<T>>,
}

impl<T> Clone for AnswerReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> AnswerReceiver<T> {
    /// Create a receiver bound to the calling thread
    pub fn new<F>(registry: &WorkerRegistry, on_answer: F) -> Self
    where
        F: Fn(&Arc<Event<T>>) + Send + Sync + 'static,
    {
        Self::with_dispatcher(registry.dispatcher_for_current_thread(), on_answer)
    }

    /// Create a receiver whose callback runs on `worker`
    pub fn on_worker<F>(worker: &WorkerHandle, on_answer: F) -> Self
    where
        F: Fn(&Arc<Event<T>>) + Send + Sync + 'static,
    {
        Self::with_dispatcher(worker.dispatcher(), on_answer)
    }

    /// Create a receiver delivering through an explicit dispatcher
    pub fn with_dispatcher<F>(dispatcher: Dispatcher, on_answer: F) -> Self
    where
        F: Fn(&Arc<Event<T>>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(AnswerInner {
                dispatcher,
                on_answer: Arc::new(on_answer),
            }),
        }
    }

    /// Dispatcher the answer callback runs on
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Queue the answer onto this receiver's thread
    pub(crate) fn post_answer(&self, event: Arc<Event<T>>) {
        let receiver = self.clone();
        self.inner
            .dispatcher
            .dispatch(move || receiver.on_received(&event));
    }

    /// Run the answer callback and end the event.
    ///
    /// Does nothing if the caller made the event synchronous after the
    /// answer was already on its way.
    pub fn on_received(&self, event: &Arc<Event<T>>) {
        {
            let mut inner = event.lock();
            if matches!(
                inner.state,
                EventState::ChangedToSynchronous | EventState::Ended
            ) {
                debug!(event_id = %event.id(), state = %inner.state, "Skipping stale answer");
                event.registry().metrics().record_stale_answer();
                return;
            }
            event.transition(&mut inner, EventState::AnswerReceived);
        }

        (self.inner.on_answer)(event);
        event.registry().metrics().record_answer_received();

        let finished = {
            let mut inner = event.lock();
            event.terminate(&mut inner)
        };
        for handle in finished {
            handle.signal();
        }
        debug!(event_id = %event.id(), "Answer received");
    }
}

impl<T> std::fmt::Debug for AnswerReceiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerReceiver")
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}
