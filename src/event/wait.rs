//! One-shot wait handles owned by a single thread.

use crate::metrics::ExchangeMetrics;
use crate::registry::Dispatcher;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

struct WaitSlot {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl WaitSlot {
    fn set(&self) {
        *self.signalled.lock() = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.signalled.lock()
    }

    fn wait(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.cond.wait(&mut signalled);
        }
    }
}

/// A one-shot signal whose `set` always runs on the owner's thread.
///
/// Cloning shares the slot; the event keeps one clone in its `Option` field
/// and drops it once the waiter has observed the signal.
#[derive(Clone)]
pub(crate) struct WaitHandle {
    slot: Arc<WaitSlot>,
    owner: Dispatcher,
}

impl WaitHandle {
    pub(crate) fn new(owner: Dispatcher) -> Self {
        Self {
            slot: Arc::new(WaitSlot {
                signalled: Mutex::new(false),
                cond: Condvar::new(),
            }),
            owner,
        }
    }

    /// A handle that is already signalled, for answers that arrived first
    pub(crate) fn signalled(owner: Dispatcher) -> Self {
        let handle = Self::new(owner);
        handle.slot.set();
        handle
    }

    pub(crate) fn owner(&self) -> &Dispatcher {
        &self.owner
    }

    pub(crate) fn is_signalled(&self) -> bool {
        self.slot.is_set()
    }

    /// Schedule the signal on the owner's thread
    pub(crate) fn signal(&self) {
        let slot = Arc::clone(&self.slot);
        self.owner.dispatch(move || slot.set());
    }

    /// Block the owner's thread until signalled.
    ///
    /// Queue-backed owners keep running their queue while waiting, which is
    /// where the signal itself arrives.
    pub(crate) fn wait(&self, metrics: &ExchangeMetrics) {
        if self.slot.is_set() {
            return;
        }
        metrics.record_blocking_wait();

        let slot = Arc::clone(&self.slot);
        if !self.owner.pump_until(move || slot.is_set()) {
            self.slot.wait();
        }
    }
}
