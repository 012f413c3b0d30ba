//! Error types for the event bridge.
//!
//! Three kinds of failure exist around an exchange:
//!
//! - Contract violations (posting twice, cancelling a synchronous event, ...)
//!   are caller bugs and panic at the point of detection.
//! - Domain failures produced by a handler travel on the payload as an
//!   [`OperationError`]; the state machine never looks at them.
//! - Resolution and lifecycle failures are returned as [`BridgeError`].

use serde::{Deserialize, Serialize};

/// Error codes for categorizing handler failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The requested resource does not exist
    NotFound,
    /// The caller is not allowed to perform the operation
    PermissionDenied,
    /// Underlying I/O failed
    IoError,
    /// The operation was aborted by a cancellation request
    Cancelled,
    /// Invalid argument supplied with the request
    InvalidArgument,
    /// The handler does not support the request
    Unsupported,
    /// Internal error (bug)
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::NotFound => write!(f, "NOT_FOUND"),
            ErrorCode::PermissionDenied => write!(f, "PERMISSION_DENIED"),
            ErrorCode::IoError => write!(f, "IO_ERROR"),
            ErrorCode::Cancelled => write!(f, "CANCELLED"),
            ErrorCode::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            ErrorCode::Unsupported => write!(f, "UNSUPPORTED"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// A domain failure recorded by a handler on its payload.
///
/// The answer callback inspects it; the bridge itself only carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Additional context for debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl OperationError {
    /// Create a new operation error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, format!("'{}' not found", what.into()))
    }

    /// Create a permission denied error
    pub fn permission_denied(operation: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::PermissionDenied,
            format!("Permission denied: {}", operation.into()),
        )
    }

    /// Create an I/O error from a message
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IoError, message)
    }

    /// Create a cancellation error
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Operation cancelled")
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Add context
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for OperationError {}

impl From<std::io::Error> for OperationError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            _ => ErrorCode::IoError,
        };
        Self::new(code, e.to_string())
    }
}

/// Main error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The domain tag is not part of the configured domain set
    #[error("Invalid domain tag: {0}")]
    InvalidTag(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The registry or the target worker has been shut down
    #[error("Shut down: {0}")]
    ShutDown(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::NotFound.to_string(), "NOT_FOUND");
        assert_eq!(ErrorCode::PermissionDenied.to_string(), "PERMISSION_DENIED");
    }

    #[test]
    fn test_operation_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = OperationError::from(io);
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("no such file"));
    }

    #[test]
    fn test_operation_error_serialization() {
        let err = OperationError::permission_denied("write /etc/passwd")
            .with_context(serde_json::json!({ "path": "/etc/passwd" }));
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("PERMISSION_DENIED"));
        assert!(json.contains("\"context\""));

        let bare = serde_json::to_string(&OperationError::cancelled()).unwrap();
        assert!(!bare.contains("context"));
    }

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::InvalidTag("popup".into());
        assert_eq!(err.to_string(), "Invalid domain tag: popup");
    }
}
