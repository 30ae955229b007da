//! In-process transport pair.
//!
//! Two [`Transport`]s joined by unbounded channels. Dropping or closing
//! either side ends the peer's stream, which is how a transport failure
//! is simulated.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::{Connector, FrameReader, FrameWriter, Transport};

// ============================================================================
// Halves
// ============================================================================

/// Sending half of an in-memory transport.
pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: String) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::ConnectionClosed)?;
        tx.send(frame)
            .map_err(|_| Error::connection_lost("peer dropped the in-memory transport"))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Receiving half of an in-memory transport.
pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Creates two connected transports.
///
/// Frames sent on one side are received on the other.
#[must_use]
pub fn pair() -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let left = Transport::new(MemoryWriter { tx: Some(a_tx) }, MemoryReader { rx: b_rx });
    let right = Transport::new(MemoryWriter { tx: Some(b_tx) }, MemoryReader { rx: a_rx });

    (left, right)
}

// ============================================================================
// MemoryConnector
// ============================================================================

/// Accept callback: receives the server end of every new pair.
type AcceptFn = dyn Fn(Transport) -> Result<()> + Send + Sync;

/// Connector that hands the server end of a fresh [`pair`] to a callback.
///
/// The callback typically spawns an in-process server task. Returning an
/// error refuses the connection.
#[derive(Clone)]
pub struct MemoryConnector {
    accept: Arc<AcceptFn>,
}

impl MemoryConnector {
    /// Creates a connector around an accept callback.
    pub fn new<F>(accept: F) -> Self
    where
        F: Fn(Transport) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            accept: Arc::new(accept),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Transport> {
        let (client, server) = pair();
        (self.accept)(server)?;
        Ok(client)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
