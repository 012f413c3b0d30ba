//! The cross-thread event: one request/answer exchange between two threads.
//!
//! An [`Event`] is created by the caller, posted to a
//! [`RequestReceiver`](crate::RequestReceiver) whose handler runs on a
//! registry worker, and answered either to the blocked caller (synchronous
//! modes) or to an [`AnswerReceiver`](crate::AnswerReceiver) on another thread
//! (asynchronous modes).
//!
//! ## State machine
//!
//! ```text
//! Initial ──post──▶ RequestSent ──handler──▶ RequestReceived ──answer──▶ AnswerSent
//!                        │                                                 │    │
//!                        │ cancelled                     make_synchronous  │    │ deliver
//!                        ▼                                                 ▼    ▼
//!                      Ended ◀── terminate ── AnswerReceived ◀── ChangedToSynchronous
//! ```
//!
//! All transitions happen under the event's own lock. User callbacks never
//! run with that lock held.

pub(crate) mod wait;

use crate::receiver::AnswerReceiver;
use crate::registry::WorkerRegistry;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;
use wait::WaitHandle;

/// Lifecycle state of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventState {
    /// Created, not yet posted
    Initial,
    /// Posted, waiting for the handler thread
    RequestSent,
    /// Handler is running (or finished without answering, in manual modes)
    RequestReceived,
    /// Answer is on its way to the caller
    AnswerSent,
    /// Answer is being consumed
    AnswerReceived,
    /// Exchange is over
    Ended,
    /// An async answer was already in flight when the caller went synchronous
    ChangedToSynchronous,
}

impl EventState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: EventState) -> bool {
        use EventState::*;
        matches!(
            (self, next),
            (Initial, RequestSent)
                | (RequestSent, RequestReceived)
                | (RequestSent, Ended)
                | (RequestReceived, AnswerSent)
                | (AnswerSent, AnswerReceived)
                | (AnswerSent, ChangedToSynchronous)
                | (ChangedToSynchronous, AnswerReceived)
                | (AnswerReceived, Ended)
        )
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the caller waits for the answer and who triggers it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Handling {
    /// Not chosen yet; posting requires a mode
    Unset,
    /// Caller blocks; answer sent when the handler returns
    Sync,
    /// Caller continues; answer posted to an answer receiver when the handler returns
    Async,
    /// Caller blocks; answer sent by an explicit `manual_answer`
    SyncManualAnswer,
    /// Caller continues; answer sent by an explicit `manual_answer`
    AsyncManualAnswer,
}

impl Handling {
    /// Caller blocks inside `post`
    pub fn is_sync(self) -> bool {
        matches!(self, Handling::Sync | Handling::SyncManualAnswer)
    }

    /// Answer goes to an answer receiver
    pub fn is_async(self) -> bool {
        matches!(self, Handling::Async | Handling::AsyncManualAnswer)
    }

    /// Answer waits for an explicit `manual_answer`
    pub fn is_manual(self) -> bool {
        matches!(self, Handling::SyncManualAnswer | Handling::AsyncManualAnswer)
    }

    /// The synchronous variant of this mode
    pub fn synchronous(self) -> Handling {
        if self.is_manual() {
            Handling::SyncManualAnswer
        } else {
            Handling::Sync
        }
    }

    /// The manual-answer variant of this mode
    pub fn manual(self) -> Handling {
        match self {
            Handling::Sync | Handling::SyncManualAnswer => Handling::SyncManualAnswer,
            Handling::Async | Handling::AsyncManualAnswer => Handling::AsyncManualAnswer,
            Handling::Unset => Handling::Unset,
        }
    }
}

/// Wait handles left behind by an event that ended without being handled
pub(crate) struct Abandoned {
    pub(crate) completion: Option<WaitHandle>,
    pub(crate) cancel_ack: Option<WaitHandle>,
    pub(crate) finished: Vec<WaitHandle>,
}

impl Abandoned {
    /// Wake everyone still waiting on the event
    pub(crate) fn signal_all(self) {
        let handles = self
            .completion
            .into_iter()
            .chain(self.cancel_ack)
            .chain(self.finished);
        for handle in handles {
            handle.signal();
        }
    }
}

/// Mutable exchange state guarded by the event lock
pub(crate) struct EventInner<T> {
    pub(crate) state: EventState,
    pub(crate) handling: Handling,
    pub(crate) cancelled: bool,
    pub(crate) cancel_allowed: bool,
    pub(crate) cancel_signal_ahead: bool,
    pub(crate) completion_wait: Option<WaitHandle>,
    /// One handle per waiting thread
    pub(crate) finished_wait: Vec<WaitHandle>,
    pub(crate) cancel_ack_wait: Option<WaitHandle>,
    pub(crate) answer_target: Option<AnswerReceiver<T>>,
}

/// One request/answer exchange carrying a payload of type `T`
pub struct Event<T> {
    id: Uuid,
    inner: Mutex<EventInner<T>>,
    payload: Mutex<T>,
    registry: OnceCell<WorkerRegistry>,
    state_tx: watch::Sender<EventState>,
}

impl<T: Send + 'static> Event<T> {
    /// Create an event with no handling mode chosen yet
    pub fn new(payload: T) -> Arc<Self> {
        let (state_tx, _) = watch::channel(EventState::Initial);
        Arc::new(Self {
            id: Uuid::new_v4(),
            inner: Mutex::new(EventInner {
                state: EventState::Initial,
                handling: Handling::Unset,
                cancelled: false,
                cancel_allowed: false,
                cancel_signal_ahead: false,
                completion_wait: None,
                finished_wait: Vec::new(),
                cancel_ack_wait: None,
                answer_target: None,
            }),
            payload: Mutex::new(payload),
            registry: OnceCell::new(),
            state_tx,
        })
    }

    /// Create an event with its handling mode already chosen
    pub fn with_handling(payload: T, handling: Handling) -> Arc<Self> {
        let event = Self::new(payload);
        event.set_handling(handling);
        event
    }

    /// Unique event id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state
    pub fn state(&self) -> EventState {
        self.inner.lock().state
    }

    /// Current handling mode
    pub fn handling(&self) -> Handling {
        self.inner.lock().handling
    }

    /// Choose the handling mode. Must be called exactly once, before posting.
    pub fn set_handling(&self, handling: Handling) {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            EventState::Initial,
            "handling of event {} can only be set before posting",
            self.id
        );
        assert_eq!(
            inner.handling,
            Handling::Unset,
            "handling of event {} was already set",
            self.id
        );
        assert_ne!(handling, Handling::Unset, "cannot set handling to Unset");
        inner.handling = handling;
    }

    /// Route the answer of an async event to `receiver`
    pub fn set_answer_receiver(&self, receiver: &AnswerReceiver<T>) {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            EventState::Initial,
            "answer receiver of event {} can only be set before posting",
            self.id
        );
        inner.answer_target = Some(receiver.clone());
    }

    /// Lock and access the payload
    pub fn payload(&self) -> MutexGuard<'_, T> {
        self.payload.lock()
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// The handler's decision on whether cancellation may take effect
    pub fn cancel_allowed(&self) -> bool {
        self.inner.lock().cancel_allowed
    }

    /// Record whether the in-flight operation can still be aborted cleanly.
    ///
    /// Handlers set this before returning; `cancel_request` reports it.
    pub fn set_cancel_allowed(&self, allowed: bool) {
        self.inner.lock().cancel_allowed = allowed;
    }

    /// Defer the answer until `RequestReceiver::manual_answer` is called
    pub fn enter_manual_answer(&self) {
        let mut inner = self.inner.lock();
        assert!(
            matches!(
                inner.state,
                EventState::Initial | EventState::RequestSent | EventState::RequestReceived
            ),
            "event {} cannot switch to manual answer in state {}",
            self.id,
            inner.state
        );
        assert_ne!(
            inner.handling,
            Handling::Unset,
            "event {} has no handling mode to make manual",
            self.id
        );
        inner.handling = inner.handling.manual();
    }

    /// Turn an async exchange into a synchronous one.
    ///
    /// Before posting this only switches the mode. After posting it blocks
    /// until the answer arrives and ends the event; the answer receiver will
    /// not see it. Returns `false` if the answer was already received, or if
    /// the request was dropped by a worker shutdown. Already synchronous
    /// events are left alone.
    pub fn make_synchronous(&self) -> bool {
        let wait = {
            let mut inner = self.inner.lock();
            match inner.state {
                EventState::AnswerReceived | EventState::Ended => return false,
                EventState::Initial => {
                    inner.handling = inner.handling.synchronous();
                    return true;
                }
                _ if !inner.handling.is_async() => return true,
                _ => {}
            }

            let registry = self.registry();
            let owner = registry.dispatcher_for_current_thread();
            inner.handling = inner.handling.synchronous();
            let wait = if inner.state == EventState::AnswerSent {
                // The answer is already queued for the answer receiver.
                self.transition(&mut inner, EventState::ChangedToSynchronous);
                WaitHandle::signalled(owner.clone())
            } else {
                WaitHandle::new(owner.clone())
            };
            let wait = self.claim(&mut inner.completion_wait, wait, &owner, "completion");
            registry.metrics().record_sync_promotion();
            debug!(event_id = %self.id, state = %inner.state, "Event made synchronous");
            wait
        };

        wait.wait(self.registry().metrics());
        self.finish_synchronous()
    }

    /// Ask for the in-flight operation to be cancelled.
    ///
    /// Blocks until the handler has passed its checkpoint, then returns the
    /// handler's `cancel_allowed` decision. Only async events can be cancelled.
    pub fn cancel_request(&self) -> bool {
        let wait = {
            let mut inner = self.inner.lock();
            assert_ne!(
                inner.state,
                EventState::Initial,
                "cannot cancel event {} before it is posted",
                self.id
            );
            assert!(
                inner.handling.is_async(),
                "cannot cancel synchronous event {}",
                self.id
            );

            let registry = self.registry();
            registry.metrics().record_cancel_request();
            match inner.state {
                EventState::AnswerReceived | EventState::Ended => {
                    debug!(event_id = %self.id, state = %inner.state, "Cancel arrived too late");
                    return false;
                }
                EventState::AnswerSent => {
                    inner.cancelled = true;
                    inner.cancel_ack_wait = None;
                    return inner.cancel_allowed;
                }
                _ => {}
            }

            inner.cancelled = true;
            if inner.cancel_signal_ahead {
                debug!(event_id = %self.id, "Handler already past checkpoint");
                return inner.cancel_allowed;
            }

            let owner = registry.dispatcher_for_current_thread();
            debug!(event_id = %self.id, state = %inner.state, "Waiting for cancel checkpoint");
            self.claim(
                &mut inner.cancel_ack_wait,
                WaitHandle::new(owner.clone()),
                &owner,
                "cancel acknowledgement",
            )
        };

        wait.wait(self.registry().metrics());

        let mut inner = self.inner.lock();
        inner.cancel_ack_wait = None;
        inner.cancel_allowed
    }

    /// Block until the exchange, including any deferred cleanup, is over.
    ///
    /// Any number of threads may wait; each gets a handle signalled on its
    /// own thread.
    pub fn wait_until_finished(&self) {
        let owner;
        let wait = {
            let mut inner = self.inner.lock();
            assert_ne!(
                inner.state,
                EventState::Initial,
                "event {} was never posted",
                self.id
            );
            if inner.state == EventState::Ended {
                return;
            }
            owner = self.registry().dispatcher_for_current_thread();
            let existing = inner
                .finished_wait
                .iter()
                .find(|handle| handle.owner().same_target(&owner))
                .cloned();
            match existing {
                Some(handle) => handle,
                None => {
                    let handle = WaitHandle::new(owner.clone());
                    inner.finished_wait.push(handle.clone());
                    handle
                }
            }
        };

        wait.wait(self.registry().metrics());
        self.inner
            .lock()
            .finished_wait
            .retain(|handle| !handle.owner().same_target(&owner));
    }

    /// Watch state changes without blocking a thread
    pub fn subscribe(&self) -> watch::Receiver<EventState> {
        self.state_tx.subscribe()
    }

    /// Resolve once the event has ended
    pub async fn finished(&self) {
        let mut updates = self.subscribe();
        if updates
            .wait_for(|state| *state == EventState::Ended)
            .await
            .is_err()
        {
            warn!(event_id = %self.id, "State channel closed before event ended");
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EventInner<T>> {
        self.inner.lock()
    }

    pub(crate) fn bind_registry(&self, registry: &WorkerRegistry) {
        // Already bound only if posted twice, which `post` rejects first.
        let _ = self.registry.set(registry.clone());
    }

    pub(crate) fn registry(&self) -> &WorkerRegistry {
        self.registry
            .get()
            .unwrap_or_else(|| panic!("event {} has not been posted", self.id))
    }

    pub(crate) fn has_completion_wait(&self) -> bool {
        self.inner.lock().completion_wait.is_some()
    }

    pub(crate) fn has_cancel_ack_wait(&self) -> bool {
        self.inner.lock().cancel_ack_wait.is_some()
    }

    pub(crate) fn passed_checkpoint(&self) -> bool {
        self.inner.lock().cancel_signal_ahead
    }

    /// Move to `next`, enforcing the transition table
    pub(crate) fn transition(&self, inner: &mut EventInner<T>, next: EventState) {
        let prev = inner.state;
        assert!(
            prev.can_transition_to(next),
            "illegal transition of event {}: {} -> {}",
            self.id,
            prev,
            next
        );
        inner.state = next;
        self.state_tx.send_replace(next);
        trace!(event_id = %self.id, from = %prev, to = %next, "State transition");
    }

    /// Reuse the existing wait handle in `slot` or install `fresh`.
    ///
    /// A handle is waited on by one thread only: its owner.
    fn claim(
        &self,
        slot: &mut Option<WaitHandle>,
        fresh: WaitHandle,
        owner: &crate::registry::Dispatcher,
        what: &str,
    ) -> WaitHandle {
        let handle = slot.get_or_insert(fresh);
        assert!(
            handle.owner().same_target(owner),
            "{} wait of event {} is owned by another thread",
            what,
            self.id
        );
        handle.clone()
    }

    /// `RequestReceived -> AnswerSent`, then route the answer by handling mode
    pub(crate) fn deliver_answer(self: &Arc<Self>, mut inner: MutexGuard<'_, EventInner<T>>) {
        self.transition(&mut inner, EventState::AnswerSent);
        let handling = inner.handling;
        let completion = inner.completion_wait.clone();
        let target = if handling.is_async() {
            inner.answer_target.clone()
        } else {
            None
        };
        drop(inner);

        self.registry().metrics().record_answer_delivered();
        debug!(event_id = %self.id, ?handling, "Answer sent");

        if let Some(target) = target {
            target.post_answer(Arc::clone(self));
        }
        // Only present if the caller blocks, or went synchronous mid-flight.
        if let Some(completion) = completion {
            completion.signal();
        }
    }

    /// `AnswerReceived -> Ended`; returns the finished handles to signal
    pub(crate) fn terminate(&self, inner: &mut EventInner<T>) -> Vec<WaitHandle> {
        self.transition(inner, EventState::Ended);
        inner.cancel_ack_wait = None;
        inner.finished_wait.clone()
    }

    /// `RequestSent -> Ended` for an event that will never be handled
    pub(crate) fn abandon(&self, inner: &mut EventInner<T>) -> Abandoned {
        self.transition(inner, EventState::Ended);
        inner.cancel_signal_ahead = true;
        Abandoned {
            completion: inner.completion_wait.take(),
            cancel_ack: inner.cancel_ack_wait.clone(),
            finished: inner.finished_wait.clone(),
        }
    }

    /// Consume the answer on the synchronous caller's thread and end the event.
    ///
    /// Returns `false` if the request was abandoned instead of answered.
    pub(crate) fn finish_synchronous(&self) -> bool {
        let finished = {
            let mut inner = self.inner.lock();
            inner.completion_wait = None;
            if inner.state == EventState::Ended {
                return false;
            }
            self.transition(&mut inner, EventState::AnswerReceived);
            self.terminate(&mut inner)
        };

        self.registry().metrics().record_answer_received();
        for handle in finished {
            handle.signal();
        }
        true
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("handling", &inner.handling)
            .field("cancelled", &inner.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use EventState::*;
        let all = [
            Initial,
            RequestSent,
            RequestReceived,
            AnswerSent,
            AnswerReceived,
            Ended,
            ChangedToSynchronous,
        ];
        let legal: Vec<(EventState, EventState)> = all
            .iter()
            .flat_map(|a| all.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a.can_transition_to(*b))
            .collect();

        assert_eq!(legal.len(), 8);
        assert!(!AnswerSent.can_transition_to(AnswerSent));
        assert!(!RequestReceived.can_transition_to(AnswerReceived));
        assert!(!Ended.can_transition_to(Initial));
        // AnswerReceived is only reachable through AnswerSent (or its detour).
        for (from, to) in &legal {
            if *to == AnswerReceived {
                assert!(matches!(from, AnswerSent | ChangedToSynchronous));
            }
        }
    }

    #[test]
    fn test_handling_variants() {
        assert_eq!(Handling::Async.synchronous(), Handling::Sync);
        assert_eq!(
            Handling::AsyncManualAnswer.synchronous(),
            Handling::SyncManualAnswer
        );
        assert_eq!(Handling::Sync.manual(), Handling::SyncManualAnswer);
        assert_eq!(Handling::Async.manual(), Handling::AsyncManualAnswer);
        assert!(Handling::AsyncManualAnswer.is_async());
        assert!(Handling::AsyncManualAnswer.is_manual());
        assert!(!Handling::Unset.is_sync());
        assert!(!Handling::Unset.is_async());
    }

    #[test]
    fn test_new_event_defaults() {
        let event = Event::new(5u32);
        assert_eq!(event.state(), EventState::Initial);
        assert_eq!(event.handling(), Handling::Unset);
        assert!(!event.is_cancelled());
        assert!(!event.cancel_allowed());
        assert!(!event.has_completion_wait());
        assert_eq!(*event.payload(), 5);
    }

    #[test]
    fn test_mode_changes_before_post() {
        let event = Event::with_handling((), Handling::Async);
        event.enter_manual_answer();
        assert_eq!(event.handling(), Handling::AsyncManualAnswer);

        assert!(event.make_synchronous());
        assert_eq!(event.handling(), Handling::SyncManualAnswer);
        assert_eq!(event.state(), EventState::Initial);
    }

    #[test]
    #[should_panic(expected = "already set")]
    fn test_handling_set_twice() {
        let event = Event::with_handling((), Handling::Sync);
        event.set_handling(Handling::Async);
    }

    #[test]
    #[should_panic(expected = "before it is posted")]
    fn test_cancel_before_post() {
        let event = Event::with_handling((), Handling::Async);
        event.cancel_request();
    }

    #[test]
    #[should_panic(expected = "never posted")]
    fn test_wait_finished_before_post() {
        let event = Event::with_handling((), Handling::Async);
        event.wait_until_finished();
    }

    #[test]
    fn test_debug_output() {
        let event = Event::with_handling("payload", Handling::Sync);
        let debug = format!("{:?}", event);
        assert!(debug.contains("Initial"));
        assert!(debug.contains("Sync"));
    }
}
