//! Request and answer receivers.
//!
//! A component doing work owns a [`RequestReceiver`]; a component issuing
//! asynchronous requests owns an [`AnswerReceiver`]. Each wraps a callback
//! and performs its half of the event state machine around it.

pub mod answer;
pub mod request;

use crate::event::Event;
use std::sync::Arc;

pub use answer::AnswerReceiver;
pub use request::RequestReceiver;

/// Callback invoked with an event on a receiver's thread
pub type EventCallback<T> = Arc<dyn Fn(&Arc<Event<T>>) + Send + Sync>;
