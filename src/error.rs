//! Error types for the MCP connection pool.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use mcp_pool::{Pool, Result};
//!
//! async fn example(pool: &Pool) -> Result<()> {
//!     let result = pool.invoke("add", json!({"a": 1, "b": 2}), timeout).await?;
//!     println!("{}", result.text());
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Handshake | [`Error::Connect`], [`Error::VersionMismatch`] |
//! | Capacity | [`Error::AcquireTimeout`], [`Error::PoolClosed`] |
//! | Connection | [`Error::ConnectionLost`], [`Error::ConnectionClosed`] |
//! | Call | [`Error::Call`], [`Error::RequestTimeout`], [`Error::Timeout`] |
//! | Arguments | [`Error::UnknownTool`], [`Error::Schema`] |
//! | Protocol | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`], [`Error::Http`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use serde_json::Value;
use reqwest::Error as HttpError;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Every public operation either succeeds or fails with exactly one of
/// these variants.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when pool or endpoint configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Handshake Errors
    // ========================================================================
    /// Transport could not be established or the handshake failed.
    ///
    /// Fatal to that attempt. The factory never retries.
    #[error("Connect failed: {message}")]
    Connect {
        /// Description of the failure.
        message: String,
    },

    /// Server speaks a protocol version this client does not support.
    ///
    /// Never recoverable by retrying.
    #[error("Protocol version mismatch: requested {requested}, server offered {offered}")]
    VersionMismatch {
        /// Version the client asked for.
        requested: String,
        /// Version the server answered with.
        offered: String,
    },

    // ========================================================================
    // Capacity Errors
    // ========================================================================
    /// No connection became available before the acquire deadline.
    #[error("Acquire timed out after {timeout_ms}ms ({waiters} callers still waiting)")]
    AcquireTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
        /// Callers still queued when this one gave up.
        waiters: usize,
    },

    /// Operation attempted on a pool that is shutting down or shut down.
    #[error("Pool closed")]
    PoolClosed,

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport failed while the connection was in service.
    ///
    /// Every pending request on the connection fails with this.
    #[error("Connection lost: {message}")]
    ConnectionLost {
        /// Description of the transport failure.
        message: String,
    },

    /// Connection was closed deliberately.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Call Errors
    // ========================================================================
    /// Server returned a JSON-RPC error object.
    ///
    /// Surfaced verbatim. The connection stays healthy.
    #[error("Call failed ({code}): {message}")]
    Call {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the server.
        message: String,
        /// Optional structured error data.
        data: Option<Value>,
    },

    /// No response arrived before the call deadline.
    ///
    /// The connection that carried the request is marked unhealthy.
    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// The request ID that timed out.
        request_id: RequestId,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Operation timeout before anything was sent.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Argument Errors
    // ========================================================================
    /// Tool is not advertised by the server.
    #[error("Unknown tool: {name}")]
    UnknownTool {
        /// The requested tool name.
        name: String,
    },

    /// Tool arguments do not match the tool's input schema.
    #[error("Invalid arguments for {tool} at {path}: {message}")]
    Schema {
        /// Tool whose schema was violated.
        tool: String,
        /// JSON pointer to the offending value.
        path: String,
        /// Description of the violation.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected message shape.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connect error.
    #[inline]
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Creates a version mismatch error.
    #[inline]
    pub fn version_mismatch(requested: impl Into<String>, offered: impl Into<String>) -> Self {
        Self::VersionMismatch {
            requested: requested.into(),
            offered: offered.into(),
        }
    }

    /// Creates an acquire timeout error.
    #[inline]
    pub fn acquire_timeout(timeout_ms: u64, waiters: usize) -> Self {
        Self::AcquireTimeout {
            timeout_ms,
            waiters,
        }
    }

    /// Creates a connection lost error.
    #[inline]
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Creates a call error from a JSON-RPC error object.
    #[inline]
    pub fn call(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Call {
            code,
            message: message.into(),
            data,
        }
    }

    /// Creates a request timeout error.
    #[inline]
    pub fn request_timeout(request_id: RequestId, timeout_ms: u64) -> Self {
        Self::RequestTimeout {
            request_id,
            timeout_ms,
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates an unknown tool error.
    #[inline]
    pub fn unknown_tool(name: impl Into<String>) -> Self {
        Self::UnknownTool { name: name.into() }
    }

    /// Creates a schema violation error.
    #[inline]
    pub fn schema(
        tool: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Schema {
            tool: tool.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error of any kind.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout { .. } | Self::RequestTimeout { .. } | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this is a connection-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::VersionMismatch { .. }
                | Self::ConnectionLost { .. }
                | Self::ConnectionClosed
                | Self::WebSocket(_)
                | Self::Http(_)
        )
    }

    /// Returns `true` if the pool simply had no spare capacity.
    ///
    /// Capacity errors are reported apart from transport failures so
    /// callers can back off differently.
    #[inline]
    #[must_use]
    pub fn is_capacity_error(&self) -> bool {
        matches!(self, Self::AcquireTimeout { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::AcquireTimeout { .. }
                | Self::ConnectionLost { .. }
                | Self::ConnectionClosed
                | Self::RequestTimeout { .. }
                | Self::Timeout { .. }
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::ErrorKind;

    #[test]
    fn test_error_display() {
        let err = Error::connect("refused");
        assert_eq!(err.to_string(), "Connect failed: refused");
    }

    #[test]
    fn test_call_error_display() {
        let err = Error::call(-32602, "bad params", None);
        assert_eq!(err.to_string(), "Call failed (-32602): bad params");
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::acquire_timeout(50, 0).is_timeout());
        assert!(Error::request_timeout(RequestId::new(3), 10).is_timeout());
        assert!(!Error::PoolClosed.is_timeout());
    }

    #[test]
    fn test_is_connection_error() {
        assert!(Error::connection_lost("eof").is_connection_error());
        assert!(Error::ConnectionClosed.is_connection_error());
        assert!(Error::version_mismatch("a", "b").is_connection_error());
        assert!(!Error::acquire_timeout(1, 0).is_connection_error());
    }

    #[test]
    fn test_capacity_is_distinct_from_transport() {
        let capacity = Error::acquire_timeout(50, 0);
        let lost = Error::connection_lost("reset");

        assert!(capacity.is_capacity_error());
        assert!(!lost.is_capacity_error());
        assert!(!capacity.is_connection_error());
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::acquire_timeout(50, 0).is_recoverable());
        assert!(Error::connection_lost("eof").is_recoverable());
        assert!(Error::connect("refused").is_recoverable());

        assert!(!Error::version_mismatch("2025-06-18", "1.0").is_recoverable());
        assert!(!Error::call(-1, "nope", None).is_recoverable());
        assert!(!Error::PoolClosed.is_recoverable());
        assert!(!Error::schema("add", "/a", "expected integer").is_recoverable());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoError::new(ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
