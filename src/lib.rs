//! MCP Pool - Connection pooling for Model Context Protocol tool servers.
//!
//! This library keeps a bounded set of live, handshaken MCP sessions to one
//! tool server and hands them to concurrent callers, so an agent can invoke
//! tools without paying a connect and handshake on every call.
//!
//! # Architecture
//!
//! The pool follows a checkout model:
//!
//! - **Pool**: Owns up to `max_size` connections, queues callers fairly
//! - **Connection**: One MCP session with its own dispatcher task
//! - **Transport**: Child-process stdio, WebSocket frames or Streamable HTTP
//!
//! Key design principles:
//!
//! - Each [`Connection`] owns: transport + dispatcher task + capability snapshot
//! - Checkouts are RAII guards; dropping any future never leaks capacity
//! - Failed connections are discarded, never handed out again
//! - Maintenance evicts idle connections and pings quiet ones
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use mcp_pool::{Endpoint, Pool, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Start a pool against a stdio server
//!     let pool = Pool::builder()
//!         .endpoint(Endpoint::stdio("mcp-server-calculator"))
//!         .max_size(4)
//!         .min_size(1)
//!         .start()
//!         .await?;
//!
//!     // Invoke a tool on any free connection
//!     let result = pool
//!         .invoke("add", json!({"a": 2, "b": 3}), Duration::from_secs(10))
//!         .await?;
//!     println!("2 + 3 = {}", result.text());
//!
//!     pool.shutdown(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`pool`] | [`Pool`], builder, configuration, checkout guard |
//! | [`transport`] | Connections, factory, stdio/WebSocket/HTTP/memory transports |
//! | [`protocol`] | JSON-RPC envelopes and MCP payloads |
//! | [`retry`] | Exponential backoff around pool operations |
//! | [`schema`] | Tool argument validation |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for connections and requests.
pub mod identifiers;

/// Connection pool.
///
/// Use [`Pool::builder()`] to configure and start a pool.
pub mod pool;

/// JSON-RPC and MCP message types.
pub mod protocol;

/// Retry policy for pool operations.
pub mod retry;

/// Tool argument validation against JSON Schema.
pub mod schema;

/// Transports, connections and the connection factory.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Pool types
pub use pool::{Pool, PoolBuilder, PoolConfig, PoolSettings, PoolStatus, PooledConnection};

// Transport types
pub use transport::{
    Connection, ConnectionFactory, ConnectionState, Connector, Endpoint, FactoryOptions,
    MemoryConnector, Transport,
};

// Protocol types
pub use protocol::{Capabilities, ContentBlock, PromptInfo, ToolCallResult, ToolInfo};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, RequestId};

// Utilities
pub use retry::RetryPolicy;
pub use schema::{ToolSchemas, validate_arguments};
