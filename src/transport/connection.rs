//! A single handshaken MCP session.
//!
//! A [`Connection`] wraps one transport and its dispatcher task. It tracks
//! its own lifecycle state, bounds the number of in-flight requests, and
//! holds the capability snapshot taken during the handshake.
//!
//! # State Machine
//!
//! ```text
//! Connecting ──► Idle ◄──► InUse
//!      │          │          │
//!      └──────────┴────┬─────┘
//!                      ▼
//!                  Unhealthy ──► Closed
//! ```
//!
//! `Unhealthy` and `Closed` are sticky: nothing moves a connection back
//! into service.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, RequestId};
use crate::protocol::{
    Capabilities, Notification, PromptInfo, PromptsListResult, Request, ToolCallParams,
    ToolCallResult, ToolInfo, ToolsListResult, method,
};
use crate::schema::ToolSchemas;

use super::Transport;
use super::dispatcher::{self, DispatchCommand, Shared};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on list pages followed in one listing.
const MAX_LIST_PAGES: usize = 64;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating at a far-future instant.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Transport open, handshake in progress.
    Connecting,
    /// Ready and parked in the pool.
    Idle,
    /// Checked out by a caller.
    InUse,
    /// Transport failed or a request timed out. Will be discarded.
    Unhealthy,
    /// Closed deliberately. Holds no transport.
    Closed,
}

impl ConnectionState {
    /// Returns `true` for states a connection never leaves.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Idle => "idle",
            Self::InUse => "in_use",
            Self::Unhealthy => "unhealthy",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One live MCP session over an exclusively owned transport.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync`. Up to `pipeline_depth` calls may be in
/// flight at once; further calls wait for a slot.
pub struct Connection {
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<DispatchCommand>,
    /// State shared with the event loop.
    shared: Arc<Shared>,
    /// Bounds in-flight requests.
    pipeline: Semaphore,
    /// Next request id.
    next_request_id: AtomicU64,
    /// Capability snapshot.
    capabilities: RwLock<Arc<Capabilities>>,
    /// Timeout applied to health checks.
    health_check_timeout: Duration,
    created_at: Instant,
    last_used: Mutex<Instant>,
    last_checked: Mutex<Instant>,
}

impl Connection {
    /// Spawns the event loop over `transport`.
    ///
    /// The connection starts in [`ConnectionState::Connecting`].
    pub(crate) fn start(
        transport: Transport,
        pipeline_depth: usize,
        health_check_timeout: Duration,
    ) -> Self {
        let id = ConnectionId::generate();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(id));

        tokio::spawn(dispatcher::run(transport, command_rx, Arc::clone(&shared)));

        let now = Instant::now();
        debug!(connection = %id, pipeline_depth, "Connection started");

        Self {
            command_tx,
            shared,
            pipeline: Semaphore::new(pipeline_depth.clamp(1, Semaphore::MAX_PERMITS)),
            next_request_id: AtomicU64::new(1),
            capabilities: RwLock::new(Arc::new(Capabilities::default())),
            health_check_timeout,
            created_at: now,
            last_used: Mutex::new(now),
            last_checked: Mutex::new(now),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Returns `true` if the connection can serve calls.
    #[inline]
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self.state(), ConnectionState::Idle | ConnectionState::InUse)
            && !self.command_tx.is_closed()
    }

    /// Returns the capability snapshot.
    #[must_use]
    pub fn capabilities(&self) -> Arc<Capabilities> {
        Arc::clone(&self.capabilities.read())
    }

    /// Returns `true` if the server announced a tool or prompt list change
    /// since the snapshot was taken.
    #[inline]
    #[must_use]
    pub fn capabilities_changed(&self) -> bool {
        self.shared.list_changed.load(Ordering::Acquire)
    }

    /// Returns the number of requests awaiting a response.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.correlation.lock().len()
    }

    /// Returns when the connection was created.
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Time since the last caller used the connection.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock())
    }

    /// Time since the connection was last used or health checked.
    #[must_use]
    pub fn quiet_for(&self, now: Instant) -> Duration {
        let last = (*self.last_used.lock()).max(*self.last_checked.lock());
        now.saturating_duration_since(last)
    }

    // ========================================================================
    // State Transitions
    // ========================================================================

    /// Sets a non-terminal state. Terminal states are kept.
    fn transition(&self, to: ConnectionState) {
        let mut state = self.shared.state.lock();
        if !state.is_terminal() {
            *state = to;
        }
    }

    pub(crate) fn mark_idle(&self) {
        self.transition(ConnectionState::Idle);
    }

    pub(crate) fn mark_in_use(&self) {
        self.transition(ConnectionState::InUse);
    }

    /// Marks the connection unhealthy so the pool discards it on release.
    pub fn mark_unhealthy(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.shared.mark_unhealthy(reason.clone()) {
            warn!(connection = %self.id(), reason = %reason, "Connection marked unhealthy");
        }
    }

    pub(crate) fn set_capabilities(&self, capabilities: Capabilities) {
        *self.capabilities.write() = Arc::new(capabilities);
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Sends a request and waits for its result.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no pipeline slot freed up in time (nothing was sent)
    /// - [`Error::RequestTimeout`] if the response did not arrive in time;
    ///   the connection is marked unhealthy
    /// - [`Error::Call`] if the server answered with an error object
    /// - [`Error::ConnectionLost`] / [`Error::ConnectionClosed`] if the
    ///   transport ended
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        *self.last_used.lock() = Instant::now();
        let result = self.request(method, params, timeout).await;
        *self.last_used.lock() = Instant::now();
        result
    }

    /// Invokes a tool.
    ///
    /// A result with `is_error` set is returned as `Ok`; only protocol-level
    /// failures are errors.
    ///
    /// # Errors
    ///
    /// See [`Connection::call`].
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallResult> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments,
        };
        let value = self
            .call(method::TOOLS_CALL, Some(serde_json::to_value(params)?), timeout)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| Error::protocol(format!("Invalid tools/call result: {e}")))
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Returns the terminal error if the connection stopped serving.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_open()?;
        self.command_tx
            .send(DispatchCommand::Notify(Notification::new(method, params)))
            .map_err(|_| self.shared.terminal_error())
    }

    /// Sends a request without touching usage timestamps.
    pub(crate) async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.ensure_open()?;

        let timeout_ms = timeout.as_millis() as u64;
        let deadline = deadline_after(timeout);

        let _permit = match timeout_at(deadline, self.pipeline.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.shared.terminal_error()),
            Err(_) => {
                return Err(Error::timeout(
                    format!("waiting for a pipeline slot on connection {}", self.id()),
                    timeout_ms,
                ));
            }
        };

        let request_id = RequestId::new(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(DispatchCommand::Send {
                request: Request::new(request_id, method, params),
                response_tx,
            })
            .map_err(|_| self.shared.terminal_error())?;

        let mut pending = PendingGuard::new(request_id, &self.command_tx);
        trace!(connection = %self.id(), %request_id, method, "Request queued");

        match timeout_at(deadline, response_rx).await {
            Ok(Ok(result)) => {
                pending.disarm();
                result?.into_result()
            }
            Ok(Err(_)) => {
                pending.disarm();
                Err(self.shared.terminal_error())
            }
            Err(_) => {
                self.mark_unhealthy(format!("request {request_id} ({method}) timed out"));
                Err(Error::request_timeout(request_id, timeout_ms))
            }
        }
    }

    /// Returns the terminal error if the connection stopped serving.
    fn ensure_open(&self) -> Result<()> {
        if self.state().is_terminal() || self.command_tx.is_closed() {
            return Err(self.shared.terminal_error());
        }
        Ok(())
    }

    // ========================================================================
    // Listings
    // ========================================================================

    /// Fetches every tool, following pagination cursors.
    ///
    /// # Errors
    ///
    /// See [`Connection::call`]; [`Error::Protocol`] on malformed pages.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = self.request(method::TOOLS_LIST, params, timeout).await?;
            let page: ToolsListResult = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("Invalid tools/list result: {e}")))?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        Err(Error::protocol(format!(
            "tools/list did not finish within {MAX_LIST_PAGES} pages"
        )))
    }

    /// Fetches every prompt, following pagination cursors.
    ///
    /// # Errors
    ///
    /// See [`Connection::list_tools`].
    pub async fn list_prompts(&self, timeout: Duration) -> Result<Vec<PromptInfo>> {
        let mut prompts = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = self.request(method::PROMPTS_LIST, params, timeout).await?;
            let page: PromptsListResult = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("Invalid prompts/list result: {e}")))?;

            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(prompts),
            }
        }

        Err(Error::protocol(format!(
            "prompts/list did not finish within {MAX_LIST_PAGES} pages"
        )))
    }

    /// Re-fetches the lists the server advertised and replaces the snapshot.
    ///
    /// # Errors
    ///
    /// See [`Connection::list_tools`]. The old snapshot is kept on error.
    pub async fn refresh_capabilities(&self, timeout: Duration) -> Result<Arc<Capabilities>> {
        self.shared.list_changed.store(false, Ordering::Release);

        let current = self.capabilities();
        let tools = if current.server.tools.is_some() {
            self.list_tools(timeout).await?
        } else {
            Vec::new()
        };
        let prompts = if current.server.prompts.is_some() {
            self.list_prompts(timeout).await?
        } else {
            Vec::new()
        };

        let refreshed = Arc::new(Capabilities {
            schemas: ToolSchemas::compile(&tools),
            tools,
            prompts,
            ..(*current).clone()
        });
        *self.capabilities.write() = Arc::clone(&refreshed);

        debug!(
            connection = %self.id(),
            tools = refreshed.tools.len(),
            "Capabilities refreshed"
        );
        Ok(refreshed)
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Checks liveness with a `ping`.
    ///
    /// A JSON-RPC error reply still proves the server is alive. Any other
    /// failure marks the connection unhealthy.
    pub async fn check_health(&self) -> bool {
        *self.last_checked.lock() = Instant::now();

        match self.request(method::PING, None, self.health_check_timeout).await {
            Ok(_) | Err(Error::Call { .. }) => self.is_healthy(),
            Err(e) => {
                self.mark_unhealthy(format!("health check failed: {e}"));
                false
            }
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Closes the connection. Idempotent.
    ///
    /// Pending requests fail with [`Error::ConnectionClosed`]; the transport
    /// is released by the event loop.
    pub fn close(&self) {
        let previous = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut *state, ConnectionState::Closed)
        };

        if previous == ConnectionState::Closed {
            return;
        }

        self.pipeline.close();
        let _ = self.command_tx.send(DispatchCommand::Shutdown);
        debug!(connection = %self.id(), from = %previous, "Connection closed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PendingGuard
// ============================================================================

/// Forgets the correlation entry if the waiting future is dropped.
struct PendingGuard<'a> {
    request_id: RequestId,
    command_tx: &'a mpsc::UnboundedSender<DispatchCommand>,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(request_id: RequestId, command_tx: &'a mpsc::UnboundedSender<DispatchCommand>) -> Self {
        Self {
            request_id,
            command_tx,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.command_tx.send(DispatchCommand::Cancel(self.request_id));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::MockServer;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_call_roundtrip() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let result = conn
            .call_tool("add", json!({"a": 2, "b": 3}), TIMEOUT)
            .await
            .expect("call");
        assert_eq!(result.text(), "5");
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_error_keeps_connection_healthy() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let err = conn.call_tool("fail", json!({}), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Call { code: -32000, .. }));
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_is_error_result_is_not_an_error() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let result = conn
            .call_tool("soft_fail", json!({}), TIMEOUT)
            .await
            .expect("call");
        assert!(result.is_error);
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_request_timeout_marks_unhealthy() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let err = conn
            .call_tool("sleep", json!({"ms": 500}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RequestTimeout { .. }));
        assert_eq!(conn.state(), ConnectionState::Unhealthy);
        assert!(!conn.is_healthy());

        let err = conn.call("ping", None, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { .. }));
    }

    #[tokio::test]
    async fn test_pipelined_calls_complete_out_of_order() {
        let server = MockServer::new();
        let conn = server
            .factory_with(|options| options.pipeline_depth = 4)
            .create()
            .await
            .expect("create");

        let slow = conn.call_tool("sleep", json!({"ms": 150}), TIMEOUT);
        let fast = conn.call_tool("sleep", json!({"ms": 10}), TIMEOUT);
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow.expect("slow").text(), "150");
        assert_eq!(fast.expect("fast").text(), "10");
        assert!(server.max_concurrent_calls() >= 2);
    }

    #[tokio::test]
    async fn test_pipeline_depth_one_serializes() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let a = conn.call_tool("sleep", json!({"ms": 30}), TIMEOUT);
        let b = conn.call_tool("sleep", json!({"ms": 30}), TIMEOUT);
        let (a, b) = tokio::join!(a, b);

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(server.max_concurrent_calls(), 1);
    }

    #[tokio::test]
    async fn test_pipeline_wait_timeout_sends_nothing() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let busy = conn.call_tool("sleep", json!({"ms": 200}), TIMEOUT);
        let starved = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conn.call_tool("add", json!({"a": 1, "b": 1}), Duration::from_millis(30))
                .await
        };
        let (busy, starved) = tokio::join!(busy, starved);

        assert!(busy.is_ok());
        assert!(matches!(starved, Err(Error::Timeout { .. })));
        assert!(conn.is_healthy());
    }

    #[tokio::test]
    async fn test_crash_fails_pending_with_connection_lost() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let err = conn.call_tool("crash", json!({}), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost { .. }));
        assert_eq!(conn.state(), ConnectionState::Unhealthy);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_transport() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");
        assert_eq!(server.live_sessions(), 1);

        conn.close();
        conn.close();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.call("ping", None, TIMEOUT).await,
            Err(Error::ConnectionClosed)
        ));
        server.wait_for_live_sessions(0).await;
    }

    #[tokio::test]
    async fn test_dropped_call_forgets_correlation() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let call = conn.call_tool("sleep", json!({"ms": 200}), TIMEOUT);
        let _ = tokio::time::timeout(Duration::from_millis(20), call).await;

        // The late response is dropped as unknown; the connection keeps serving.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(conn.pending_count(), 0);
        assert!(conn.is_healthy());
        assert!(conn.check_health().await);
    }

    #[tokio::test]
    async fn test_unhealthy_is_sticky() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        conn.mark_unhealthy("test");
        conn.mark_idle();
        conn.mark_in_use();
        assert_eq!(conn.state(), ConnectionState::Unhealthy);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_new_tools() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");
        assert!(conn.capabilities().tool("extra").is_none());

        conn.call_tool("mutate", json!({}), TIMEOUT).await.expect("mutate");
        assert!(conn.capabilities_changed());

        let refreshed = conn.refresh_capabilities(TIMEOUT).await.expect("refresh");
        assert!(refreshed.tool("extra").is_some());
        assert_eq!(refreshed.schemas.len(), refreshed.tools.len());
        assert!(!conn.capabilities_changed());
    }

    #[tokio::test]
    async fn test_refresh_follows_advertised_capabilities() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");
        let handshake = conn.capabilities();

        // Prompts are advertised even though the snapshot holds none.
        conn.set_capabilities(Capabilities {
            prompts: Vec::new(),
            ..(*handshake).clone()
        });
        let refreshed = conn.refresh_capabilities(TIMEOUT).await.expect("refresh");
        assert_eq!(refreshed.prompts.len(), 1);
        assert_eq!(refreshed.tools.len(), MockServer::TOOL_COUNT);

        // Tools are not advertised, so none are listed.
        let mut server_caps = handshake.server.clone();
        server_caps.tools = None;
        conn.set_capabilities(Capabilities {
            server: server_caps,
            ..(*handshake).clone()
        });
        let refreshed = conn.refresh_capabilities(TIMEOUT).await.expect("refresh");
        assert!(refreshed.tools.is_empty());
        assert!(refreshed.schemas.is_empty());
        assert_eq!(refreshed.prompts.len(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let result = conn
            .call_tool("add", json!({"a": 1, "b": 1}), Duration::MAX)
            .await
            .expect("call");
        assert_eq!(result.text(), "2");
        assert!(deadline_after(Duration::MAX) > Instant::now() + Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn test_huge_pipeline_depth_is_clamped() {
        let server = MockServer::new();
        let conn = server
            .factory_with(|options| options.pipeline_depth = usize::MAX)
            .create()
            .await
            .expect("create");

        assert!(conn.check_health().await);
    }
}
