//! JSON-RPC 2.0 envelope types.
//!
//! Requests carry a numeric [`RequestId`] allocated by the connection;
//! responses are matched back to requests by that id.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

// ============================================================================
// Constants
// ============================================================================

/// JSON-RPC protocol version tag.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes.
pub mod error_code {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ============================================================================
// Request
// ============================================================================

/// A method call from client to server.
///
/// # Format
///
/// ```json
/// {"jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": {...}}
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,

    /// Correlation id.
    pub id: RequestId,

    /// Method name.
    pub method: String,

    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Creates a new request.
    #[inline]
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

// ============================================================================
// Notification
// ============================================================================

/// A message that expects no response.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,

    /// Method name.
    pub method: String,

    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Creates a new notification.
    #[inline]
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }
}

// ============================================================================
// RpcError
// ============================================================================

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i64,

    /// Short description.
    pub message: String,

    /// Additional information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Creates an error object without data.
    #[inline]
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// A response to one request.
///
/// # Format
///
/// Success:
/// ```json
/// {"jsonrpc": "2.0", "id": 7, "result": {...}}
/// ```
///
/// Error:
/// ```json
/// {"jsonrpc": "2.0", "id": 7, "error": {"code": -32602, "message": "..."}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version tag.
    pub jsonrpc: String,

    /// Id of the request being answered (number or string on the wire).
    pub id: Value,

    /// Result data (if success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error object (if error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns the correlation id, if the wire id is one this client issued.
    ///
    /// Accepts numbers and numeric strings.
    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        match &self.id {
            Value::Number(n) => n.as_u64().map(RequestId::new),
            Value::String(s) => s.parse().ok().map(RequestId::new),
            _ => None,
        }
    }

    /// Returns `true` if this is an error response.
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Extracts the result value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Call`] carrying the server's error object verbatim.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(Error::call(err.code, err.message, err.data)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// ============================================================================
// Incoming
// ============================================================================

/// A classified frame received from the server.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Answer to one of our requests.
    Response(Response),

    /// Server-initiated request that needs an answer.
    Request {
        /// Server's id, echoed back verbatim.
        id: Value,
        /// Method name.
        method: String,
        /// Parameters.
        params: Option<Value>,
    },

    /// Server-initiated notification.
    Notification {
        /// Method name.
        method: String,
        /// Parameters.
        params: Option<Value>,
    },
}

impl Incoming {
    /// Parses and classifies a text frame.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the frame is not JSON
    /// - [`Error::Protocol`] if it is not a JSON-RPC message object
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut object) = value else {
            return Err(Error::protocol("Expected a JSON-RPC object"));
        };

        if let Some(method) = take_method(&mut object)? {
            let params = object.remove("params");
            return Ok(match object.remove("id") {
                Some(id) if !id.is_null() => Self::Request { id, method, params },
                _ => Self::Notification { method, params },
            });
        }

        if object.contains_key("id")
            && (object.contains_key("result") || object.contains_key("error"))
        {
            let response: Response = serde_json::from_value(Value::Object(object))?;
            return Ok(Self::Response(response));
        }

        Err(Error::protocol("Message is neither request nor response"))
    }
}

/// Removes and returns the `method` member, if present.
fn take_method(object: &mut Map<String, Value>) -> Result<Option<String>> {
    match object.remove("method") {
        None => Ok(None),
        Some(Value::String(method)) => Ok(Some(method)),
        Some(_) => Err(Error::protocol("Method must be a string")),
    }
}

// ============================================================================
// Tests
// ============================================================================
