//! Transport layer.
//!
//! This module handles everything between the pool and the bytes on the
//! wire: raw frame transports, endpoint connectors, the per-connection
//! dispatcher, and the factory that turns a transport into a ready
//! [`Connection`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   call()    ┌──────────────┐   frames   ┌──────────────┐
//! │  Connection  │────────────►│  Dispatcher  │───────────►│  MCP server  │
//! │  (Arc, pool) │◄────────────│  (tokio task)│◄───────────│              │
//! └──────────────┘  by req id  └──────────────┘            └──────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Connector::connect` - Establish a raw [`Transport`]
//! 2. `Connection::start` - Spawn the dispatcher task (state `Connecting`)
//! 3. `ConnectionFactory::create` - Handshake, capability snapshot (state `Idle`)
//! 4. `Connection::call` - Correlated requests (pool toggles `InUse`/`Idle`)
//! 5. `Connection::close` - Fail pending requests, drop the transport
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | Connection state and call API |
//! | `dispatcher` | Event loop and request/response correlation |
//! | `endpoint` | Serializable endpoint descriptions |
//! | `factory` | Connect + handshake |
//! | `http` | Streamable HTTP client transport |
//! | `memory` | In-process transport pair |
//! | `stdio` | Child process transport |
//! | `websocket` | WebSocket client transport |

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;

use crate::error::Result;

// ============================================================================
// Submodules
// ============================================================================

/// Connection state and call API.
pub mod connection;

/// Event loop and request/response correlation.
pub(crate) mod dispatcher;

/// Serializable endpoint descriptions.
pub mod endpoint;

/// Connect + handshake.
pub mod factory;

/// Streamable HTTP client transport.
pub mod http;

/// In-process transport pair.
pub mod memory;

/// Child process stdio transport.
pub mod stdio;

/// WebSocket client transport.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{Connection, ConnectionState};
pub use endpoint::Endpoint;
pub use factory::{ConnectionFactory, FactoryOptions};
pub use memory::MemoryConnector;

// ============================================================================
// Frame Traits
// ============================================================================

/// Sending half of a transport.
///
/// Each call writes exactly one protocol message.
#[async_trait]
pub trait FrameWriter: Send {
    /// Writes one text frame.
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Flushes and closes the sending half.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Receiving half of a transport.
///
/// `recv` must be cancel safe: the dispatcher polls it inside `select!`
/// and drops the future whenever a command wins the race.
#[async_trait]
pub trait FrameReader: Send {
    /// Reads one text frame. `None` means the peer closed the stream.
    async fn recv(&mut self) -> Option<Result<String>>;
}

// ============================================================================
// Transport
// ============================================================================

/// An established, exclusively owned duplex frame channel.
pub struct Transport {
    writer: Box<dyn FrameWriter>,
    reader: Box<dyn FrameReader>,
}

impl Transport {
    /// Creates a transport from its two halves.
    #[must_use]
    pub fn new(writer: impl FrameWriter + 'static, reader: impl FrameReader + 'static) -> Self {
        Self {
            writer: Box::new(writer),
            reader: Box::new(reader),
        }
    }

    /// Splits into sending and receiving halves.
    #[must_use]
    pub fn split(self) -> (Box<dyn FrameWriter>, Box<dyn FrameReader>) {
        (self.writer, self.reader)
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Establishes raw transports to one logical server endpoint.
///
/// Implementations make exactly one attempt per call.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a new transport.
    async fn connect(&self) -> Result<Transport>;

    /// Short human readable description for logs.
    fn describe(&self) -> String;
}
