//! JSON-RPC and MCP message types.
//!
//! This module defines the minimal message set the pool needs to frame
//! requests, complete the handshake, and call tools.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Request` | Client → Server | Method call with correlation id |
//! | `Notification` | Either | Fire-and-forget method |
//! | `Response` | Server → Client | Result or error for one request id |
//! | `Incoming` | Server → Client | Classified inbound frame |
//!
//! # Method Naming
//!
//! MCP methods follow `area/verb` format:
//!
//! - `initialize`
//! - `tools/list`, `tools/call`
//! - `notifications/initialized`
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | JSON-RPC 2.0 envelope types |
//! | `mcp` | Handshake, tool and prompt payloads |

// ============================================================================
// Submodules
// ============================================================================

/// MCP handshake, tool and prompt payloads.
pub mod mcp;

/// JSON-RPC 2.0 envelope types.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use mcp::{
    Capabilities, ClientCapabilities, ContentBlock, Implementation, InitializeParams,
    InitializeResult, ListCapability, PROTOCOL_VERSION, PromptArgument, PromptInfo,
    PromptsListResult, SUPPORTED_PROTOCOL_VERSIONS, ServerCapabilities, ToolCallParams,
    ToolCallResult, ToolInfo, ToolsListResult, method,
};
pub use message::{Incoming, Notification, Request, Response, RpcError, error_code};
