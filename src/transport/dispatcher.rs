//! Per-connection event loop.
//!
//! One tokio task per connection owns the reading half of the transport.
//! It handles:
//!
//! - Outgoing requests and notifications from the [`Connection`] API
//! - Incoming responses, routed to callers by request id
//! - Server-initiated `ping` requests and `list_changed` notifications
//! - Failing every pending request when the transport ends
//!
//! Frames are written by a separate writer task fed through a queue, so a
//! slow or blocked write never stops responses from being read.
//!
//! [`Connection`]: super::Connection

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::{Incoming, Notification, Request, Response, RpcError, error_code, method};

use super::connection::ConnectionState;
use super::{FrameWriter, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on flushing queued frames and closing the transport.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Types
// ============================================================================

/// Queue of serialized frames for the writer task.
type FrameQueue = mpsc::UnboundedSender<String>;

/// Map of request ids to response channels.
pub(crate) type CorrelationMap = FxHashMap<RequestId, oneshot::Sender<Result<Response>>>;

/// Internal commands for the event loop.
pub(crate) enum DispatchCommand {
    /// Write a request and route its response back.
    Send {
        request: Request,
        response_tx: oneshot::Sender<Result<Response>>,
    },
    /// Write a notification.
    Notify(Notification),
    /// Forget an abandoned request.
    Cancel(RequestId),
    /// Close the transport.
    Shutdown,
}

/// Why the event loop stopped.
enum Exit {
    /// Deliberate close.
    Closed,
    /// Transport failure.
    Lost(String),
}

// ============================================================================
// Shared
// ============================================================================

/// State shared between a [`Connection`](super::Connection) and its loop.
pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) correlation: Mutex<CorrelationMap>,
    pub(crate) state: Mutex<ConnectionState>,
    pub(crate) lost_reason: Mutex<Option<String>>,
    pub(crate) list_changed: AtomicBool,
}

impl Shared {
    pub(crate) fn new(id: ConnectionId) -> Self {
        Self {
            id,
            correlation: Mutex::new(CorrelationMap::default()),
            state: Mutex::new(ConnectionState::Connecting),
            lost_reason: Mutex::new(None),
            list_changed: AtomicBool::new(false),
        }
    }

    /// Moves to `Unhealthy` unless already terminal.
    pub(crate) fn mark_unhealthy(&self, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = ConnectionState::Unhealthy;
        *self.lost_reason.lock() = Some(reason.into());
        true
    }

    /// Error for calls made after the connection stopped serving.
    pub(crate) fn terminal_error(&self) -> Error {
        let state = *self.state.lock();
        match state {
            ConnectionState::Unhealthy => Error::connection_lost(
                self.lost_reason
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "connection unhealthy".to_string()),
            ),
            _ => Error::ConnectionClosed,
        }
    }

    /// Records the exit and fails everything still pending.
    fn finish(&self, exit: &Exit) {
        match exit {
            Exit::Closed => *self.state.lock() = ConnectionState::Closed,
            Exit::Lost(reason) => {
                if self.mark_unhealthy(reason.clone()) {
                    warn!(connection = %self.id, reason = %reason, "Connection lost");
                }
            }
        }

        let pending: Vec<_> = self.correlation.lock().drain().collect();
        if !pending.is_empty() {
            debug!(connection = %self.id, count = pending.len(), "Failing pending requests");
        }

        for (_, tx) in pending {
            let _ = tx.send(Err(self.terminal_error()));
        }
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Runs until the transport ends or the connection is closed.
pub(crate) async fn run(
    transport: Transport,
    mut command_rx: mpsc::UnboundedReceiver<DispatchCommand>,
    shared: Arc<Shared>,
) {
    let (writer, mut reader) = transport.split();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (failed_tx, mut failed_rx) = oneshot::channel();
    let mut write_task = tokio::spawn(write_frames(writer, frame_rx, failed_tx, shared.id));

    let exit = loop {
        tokio::select! {
            // Incoming frames from the server
            frame = reader.recv() => {
                match frame {
                    Some(Ok(text)) => {
                        if let Some(reply) = handle_incoming(&text, &shared)
                            && let Err(e) = enqueue_json(&frame_tx, &reply)
                        {
                            break Exit::Lost(format!("failed to answer server request: {e}"));
                        }
                    }

                    Some(Err(e)) => {
                        error!(connection = %shared.id, error = %e, "Transport error");
                        break Exit::Lost(e.to_string());
                    }

                    None => {
                        debug!(connection = %shared.id, "Transport stream ended");
                        break Exit::Lost("transport closed by server".to_string());
                    }
                }
            }

            // Write failures from the writer task
            reason = &mut failed_rx => {
                let reason = reason.unwrap_or_else(|_| "writer task stopped".to_string());
                break Exit::Lost(reason);
            }

            // Commands from the connection API
            command = command_rx.recv() => {
                match command {
                    Some(DispatchCommand::Send { request, response_tx }) => {
                        if let Err(e) = handle_send(request, response_tx, &frame_tx, &shared) {
                            break Exit::Lost(e);
                        }
                    }

                    Some(DispatchCommand::Notify(notification)) => {
                        if let Err(e) = enqueue_json(&frame_tx, &notification) {
                            break Exit::Lost(format!("failed to send notification: {e}"));
                        }
                    }

                    Some(DispatchCommand::Cancel(request_id)) => {
                        shared.correlation.lock().remove(&request_id);
                        debug!(connection = %shared.id, %request_id, "Removed abandoned correlation");
                    }

                    Some(DispatchCommand::Shutdown) => {
                        debug!(connection = %shared.id, "Shutdown command received");
                        break Exit::Closed;
                    }

                    None => {
                        debug!(connection = %shared.id, "Command channel closed");
                        break Exit::Closed;
                    }
                }
            }
        }
    };

    shared.finish(&exit);
    drop(frame_tx);

    match exit {
        Exit::Closed => {
            if timeout(CLOSE_TIMEOUT, &mut write_task).await.is_err() {
                warn!(connection = %shared.id, "Transport close timed out");
                write_task.abort();
            }
        }
        Exit::Lost(_) => write_task.abort(),
    }

    debug!(connection = %shared.id, "Event loop terminated");
}

/// Writes queued frames in order. Closes the transport once the queue ends.
///
/// Reports the first write failure through `failed` and stops.
async fn write_frames(
    mut writer: Box<dyn FrameWriter>,
    mut frames: mpsc::UnboundedReceiver<String>,
    failed: oneshot::Sender<String>,
    connection: ConnectionId,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.send(frame).await {
            let _ = failed.send(format!("failed to write frame: {e}"));
            return;
        }
    }

    if let Err(e) = writer.close().await {
        debug!(connection = %connection, error = %e, "Transport close failed");
    }
}

/// Registers the correlation, then queues the request.
///
/// Returns `Err` with a reason when the writer task is gone.
fn handle_send(
    request: Request,
    response_tx: oneshot::Sender<Result<Response>>,
    frame_tx: &FrameQueue,
    shared: &Shared,
) -> std::result::Result<(), String> {
    let request_id = request.id;

    let frame = match serde_json::to_string(&request) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = response_tx.send(Err(e.into()));
            return Ok(());
        }
    };

    shared.correlation.lock().insert(request_id, response_tx);
    trace!(connection = %shared.id, %request_id, method = %request.method, "Sending request");

    if frame_tx.send(frame).is_err() {
        let reason = "writer task stopped".to_string();
        if let Some(tx) = shared.correlation.lock().remove(&request_id) {
            let _ = tx.send(Err(Error::connection_lost(reason.clone())));
        }
        return Err(reason);
    }

    Ok(())
}

/// Handles one incoming frame. Returns a reply for server requests.
fn handle_incoming(text: &str, shared: &Shared) -> Option<Response> {
    match Incoming::parse(text) {
        Ok(Incoming::Response(response)) => {
            let tx = response
                .request_id()
                .and_then(|request_id| shared.correlation.lock().remove(&request_id));

            match tx {
                Some(tx) => {
                    let _ = tx.send(Ok(response));
                }
                None => {
                    warn!(connection = %shared.id, id = %response.id, "Response for unknown request");
                }
            }
            None
        }

        Ok(Incoming::Request { id, method: name, .. }) => {
            if name == method::PING {
                trace!(connection = %shared.id, "Answering server ping");
                Some(Response::success(id, json!({})))
            } else {
                debug!(connection = %shared.id, method = %name, "Rejecting server request");
                Some(Response::failure(
                    id,
                    RpcError::new(
                        error_code::METHOD_NOT_FOUND,
                        format!("Method not found: {name}"),
                    ),
                ))
            }
        }

        Ok(Incoming::Notification { method: name, .. }) => {
            if name == method::TOOLS_LIST_CHANGED || name == method::PROMPTS_LIST_CHANGED {
                debug!(connection = %shared.id, method = %name, "Server capabilities changed");
                shared.list_changed.store(true, Ordering::Release);
            } else {
                trace!(connection = %shared.id, method = %name, "Ignoring notification");
            }
            None
        }

        Err(e) => {
            warn!(connection = %shared.id, error = %e, "Dropping unparseable frame");
            None
        }
    }
}

/// Serializes one message and queues it for the writer task.
fn enqueue_json<T: Serialize>(frame_tx: &FrameQueue, message: &T) -> Result<()> {
    let frame = serde_json::to_string(message)?;
    frame_tx
        .send(frame)
        .map_err(|_| Error::connection_lost("writer task stopped"))
}

// ============================================================================
// Tests
// ============================================================================
