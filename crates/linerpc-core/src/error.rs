//! Unified router error handling.
//!
//! [`RpcError`] is the single error type surfaced by the router: handler
//! failures, rejected outgoing requests, classifier rejections and transport
//! failures all use it. Each [`ErrorKind`] maps onto a JSON-RPC error code so
//! an error can always be put back on the wire.
//!
//! ```rust
//! use linerpc_core::error::{ErrorKind, RpcError, RpcResult};
//!
//! fn lookup(method: &str) -> RpcResult<()> {
//!     Err(RpcError::method_not_found(method))
//! }
//!
//! let err = lookup("tools/call").unwrap_err();
//! assert_eq!(err.kind, ErrorKind::MethodNotFound);
//! assert_eq!(err.jsonrpc_code(), -32601);
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::jsonrpc::{JsonRpcError, codes};

/// Result type alias for router operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Message used when pending work is torn down by a stop.
pub const STOPPED_MESSAGE: &str = "Router stopped";

/// Message used when a request arrives and nobody is there to answer it.
pub const NO_HANDLER_MESSAGE: &str = "No message handler registered";

/// Unified router error type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Additional structured data (sent as `error.data`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Error classification for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // === JSON-RPC Standard Errors ===
    /// Parse error (-32700)
    ParseError,
    /// Invalid request (-32600)
    InvalidRequest,
    /// Method not found (-32601)
    MethodNotFound,
    /// Invalid params (-32602)
    InvalidParams,
    /// Internal error (-32603)
    Internal,
    /// Peer error carrying a code outside the standard range
    Application(i32),

    // === Router-local Errors (-32603 on the wire) ===
    /// Outgoing request timed out
    Timeout,
    /// Router stopped before the operation completed
    Stopped,
    /// Reading or writing the stream failed
    Transport,
    /// A message could not be serialized
    Serialization,
    /// Too many outgoing requests in flight
    Overloaded,
}

impl RpcError {
    /// Create a new error with kind and message
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Create a parse error
    #[must_use]
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, message)
    }

    /// Create an invalid request error
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// Create a method not found error
    #[must_use]
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::MethodNotFound,
            format!("Method not found: {}", method.into()),
        )
    }

    /// Create an invalid params error
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Create the error returned when an outgoing request outlives its timer
    #[must_use]
    pub fn timeout(method: &str, elapsed: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!(
                "Request '{method}' timed out after {}ms",
                elapsed.as_millis()
            ),
        )
    }

    /// Create the error used to reject work torn down by a stop
    #[must_use]
    pub fn stopped() -> Self {
        Self::new(ErrorKind::Stopped, STOPPED_MESSAGE)
    }

    /// Create a transport error
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    /// Create an overloaded error
    #[must_use]
    pub fn overloaded(limit: usize) -> Self {
        Self::new(
            ErrorKind::Overloaded,
            format!("Too many pending requests (limit {limit})"),
        )
    }

    /// Create an error from a JSON-RPC error code
    #[must_use]
    pub fn from_rpc_code(code: i32, message: impl Into<String>) -> Self {
        let kind = match code {
            codes::PARSE_ERROR => ErrorKind::ParseError,
            codes::INVALID_REQUEST => ErrorKind::InvalidRequest,
            codes::METHOD_NOT_FOUND => ErrorKind::MethodNotFound,
            codes::INVALID_PARAMS => ErrorKind::InvalidParams,
            codes::INTERNAL_ERROR => ErrorKind::Internal,
            other => ErrorKind::Application(other),
        };
        Self::new(kind, message)
    }

    /// Get the JSON-RPC error code for this error
    #[must_use]
    pub const fn jsonrpc_code(&self) -> i32 {
        match self.kind {
            ErrorKind::ParseError => codes::PARSE_ERROR,
            ErrorKind::InvalidRequest => codes::INVALID_REQUEST,
            ErrorKind::MethodNotFound => codes::METHOD_NOT_FOUND,
            ErrorKind::InvalidParams => codes::INVALID_PARAMS,
            ErrorKind::Application(code) => code,
            ErrorKind::Internal
            | ErrorKind::Timeout
            | ErrorKind::Stopped
            | ErrorKind::Transport
            | ErrorKind::Serialization
            | ErrorKind::Overloaded => codes::INTERNAL_ERROR,
        }
    }

    /// Check if this is a timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Check if this error was caused by the router stopping
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        matches!(self.kind, ErrorKind::Stopped)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for JsonRpcError {
    fn from(err: RpcError) -> Self {
        Self {
            code: err.jsonrpc_code(),
            message: err.message,
            data: err.data,
        }
    }
}

impl From<JsonRpcError> for RpcError {
    fn from(err: JsonRpcError) -> Self {
        let mut rpc = Self::from_rpc_code(err.code, err.message);
        rpc.data = err.data;
        rpc
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
