//! # Nexus Event Bridge
//!
//! Request/answer exchanges between named worker threads. A caller posts an
//! [`Event`] to a [`RequestReceiver`], whose handler runs on the worker
//! assigned to its domain tag. The answer goes back either to the caller
//! blocked in `post` (synchronous modes) or to an [`AnswerReceiver`] on the
//! thread that asked for it (asynchronous modes).
//!
//! ## Architecture
//!
//! ```text
//! caller thread                     domain worker ("nexus-<worker>")
//!     │  RequestReceiver::post            │
//!     │ ───────── TaskQueue ────────────▶ │ on_request handler
//!     │                                   │ cancel checkpoint
//!     │ ◀──────── Dispatcher ──────────── │ answer
//!     ▼                                   ▼
//! AnswerReceiver (async) / resumed caller (sync)
//! ```
//!
//! ## Features
//!
//! - **Domain workers**: tags resolve to lazily spawned, named threads
//! - **Four handling modes**: sync, async and their manual-answer variants
//! - **Cancellation checkpoint**: advisory cancel with a handler decision
//! - **Promotion**: an async exchange can turn synchronous mid-flight
//! - **Metrics**: counters with a Prometheus text rendering

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod receiver;
pub mod registry;

// Re-export commonly used types
pub use config::{DomainConfig, RegistryConfig};
pub use error::{BridgeError, ErrorCode, OperationError, Result};
pub use event::{Event, EventState, Handling};
pub use metrics::{ExchangeMetrics, MetricsSnapshot};
pub use receiver::{AnswerReceiver, RequestReceiver};
pub use registry::{Dispatcher, MainLoop, WorkerHandle, WorkerRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "1.0.0");
    }
}
