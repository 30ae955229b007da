//! Pool core: checkout, release, creation and shutdown.
//!
//! All bookkeeping lives in one [`PoolState`] behind a `parking_lot`
//! mutex. The lock is held only for bookkeeping: never across an
//! `.await`, never while closing a connection, and never while a guard
//! that re-enters the pool is dropped.
//!
//! # Capacity Accounting
//!
//! `idle + in_use + creating <= max_size` at every instant. Capacity freed
//! by a discarded connection goes to the longest waiter as a
//! [`Grant::Create`] reservation, so a waiter never waits behind capacity
//! that nobody is using.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::{Capabilities, PromptInfo, ToolCallResult, ToolInfo};
use crate::transport::connection::deadline_after;
use crate::transport::{Connection, ConnectionFactory};

use super::builder::PoolBuilder;
use super::config::PoolConfig;
use super::guard::{PooledConnection, Reservation};
use super::maintenance;
use super::waiter::{Grant, WaiterHandle, WaiterQueue};

// ============================================================================
// PoolStatus
// ============================================================================

/// Point-in-time snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections parked and ready.
    pub idle: usize,
    /// Connections checked out.
    pub in_use: usize,
    /// Connections being created.
    pub creating: usize,
    /// Callers queued for a connection.
    pub waiters: usize,
    /// Configured maximum.
    pub max_size: usize,
    /// Configured minimum.
    pub min_size: usize,
    /// Whether shutdown has begun.
    pub closed: bool,
}

impl PoolStatus {
    /// Live plus in-creation connections.
    #[inline]
    #[must_use]
    pub const fn total(&self) -> usize {
        self.idle + self.in_use + self.creating
    }
}

// ============================================================================
// PoolState
// ============================================================================

/// Pool bookkeeping. Guarded by [`PoolInner::state`].
#[derive(Default)]
pub(super) struct PoolState {
    /// Ready connections; the top of the stack is the most recently used.
    pub(super) idle: Vec<Arc<Connection>>,
    /// Checked-out connections.
    pub(super) in_use: FxHashMap<ConnectionId, Arc<Connection>>,
    /// Reserved creation slots.
    pub(super) creating: usize,
    /// Callers waiting for a connection.
    pub(super) waiters: WaiterQueue,
    /// Set once by shutdown.
    pub(super) closed: bool,
}

impl PoolState {
    #[inline]
    pub(super) fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.creating
    }
}

/// Outcome of the locked part of an acquire.
enum Step {
    Ready(Arc<Connection>),
    Create,
    Wait(u64, oneshot::Receiver<Grant>),
}

// ============================================================================
// PoolInner
// ============================================================================

/// Shared pool internals.
pub(crate) struct PoolInner {
    pub(super) config: PoolConfig,
    pub(super) factory: ConnectionFactory,
    pub(super) state: Mutex<PoolState>,
    capabilities: RwLock<Arc<Capabilities>>,
    in_use_count: watch::Sender<usize>,
}

impl PoolInner {
    fn new(factory: ConnectionFactory, config: PoolConfig) -> Self {
        let (in_use_count, _) = watch::channel(0);
        Self {
            config,
            factory,
            state: Mutex::new(PoolState::default()),
            capabilities: RwLock::new(Arc::new(Capabilities::default())),
            in_use_count,
        }
    }

    pub(super) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    // ========================================================================
    // Acquire
    // ========================================================================

    async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledConnection> {
        let deadline = deadline_after(timeout);
        let timeout_ms = timeout.as_millis() as u64;

        let mut dead = Vec::new();
        let step = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            self.checkout_step(&mut state, &mut dead)
        };

        for conn in dead {
            debug!(connection = %conn.id(), state = %conn.state(), "Dropping dead idle connection");
            conn.close();
        }

        match step {
            Step::Ready(conn) => {
                trace!(connection = %conn.id(), "Reusing idle connection");
                Ok(PooledConnection::new(Arc::clone(self), conn))
            }
            Step::Create => {
                let reservation = Reservation::new(Arc::clone(self));
                self.create_checked_out(reservation, deadline, timeout_ms)
                    .await
            }
            Step::Wait(id, rx) => {
                let mut waiter = WaiterHandle::new(Arc::clone(self), id, rx);
                self.wait(&mut waiter, deadline, timeout_ms).await
            }
        }
    }

    /// Decides how an acquire proceeds. Runs under the lock.
    fn checkout_step(&self, state: &mut PoolState, dead: &mut Vec<Arc<Connection>>) -> Step {
        // Queued callers go first; a newcomer never overtakes them.
        if state.waiters.is_empty() {
            while let Some(conn) = state.idle.pop() {
                if conn.is_healthy() {
                    conn.mark_in_use();
                    state.in_use.insert(conn.id(), Arc::clone(&conn));
                    self.sync_in_use(state);
                    return Step::Ready(conn);
                }
                dead.push(conn);
            }

            if state.total() < self.config.max_size {
                state.creating += 1;
                return Step::Create;
            }
        }

        let (id, rx) = state.waiters.push();
        Step::Wait(id, rx)
    }

    async fn wait(
        self: &Arc<Self>,
        waiter: &mut WaiterHandle,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<PooledConnection> {
        trace!(timeout_ms, "Waiting for a connection");

        let grant = match timeout_at(deadline, waiter.recv()).await {
            Ok(Some(grant)) => grant,
            Ok(None) => return Err(Error::PoolClosed),
            Err(_) => match waiter.cancel() {
                Some(grant) => grant,
                None if self.is_closed() => return Err(Error::PoolClosed),
                None => {
                    let waiters = self.state.lock().waiters.len();
                    debug!(timeout_ms, waiters, "Acquire timed out");
                    return Err(Error::acquire_timeout(timeout_ms, waiters));
                }
            },
        };

        match grant {
            Grant::Ready(conn) => Ok(PooledConnection::new(Arc::clone(self), conn)),
            Grant::Create => {
                let reservation = Reservation::new(Arc::clone(self));
                self.create_checked_out(reservation, deadline, timeout_ms)
                    .await
            }
        }
    }

    async fn create_checked_out(
        self: &Arc<Self>,
        reservation: Reservation,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<PooledConnection> {
        match timeout_at(deadline, self.factory.create()).await {
            Ok(Ok(conn)) => reservation.checkout(conn),
            Ok(Err(e)) => {
                warn!(error = %e, "Connection creation failed");
                Err(e)
            }
            Err(_) => {
                let waiters = self.state.lock().waiters.len();
                Err(Error::acquire_timeout(timeout_ms, waiters))
            }
        }
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Registers a freshly created connection as checked out.
    pub(super) fn admit_in_use(&self, conn: Connection) -> Result<Arc<Connection>> {
        let conn = Arc::new(conn);
        {
            let mut state = self.state.lock();
            state.creating -= 1;

            if !state.closed {
                conn.mark_in_use();
                state.in_use.insert(conn.id(), Arc::clone(&conn));
                self.sync_in_use(&state);
                drop(state);

                self.publish_capabilities(&conn);
                return Ok(conn);
            }
        }

        conn.close();
        Err(Error::PoolClosed)
    }

    /// Registers a freshly created connection as available.
    pub(super) fn admit_idle(&self, conn: Connection) {
        let conn = Arc::new(conn);
        self.publish_capabilities(&conn);

        let mut state = self.state.lock();
        state.creating -= 1;

        if state.closed {
            drop(state);
            conn.close();
            return;
        }

        self.hand_off(&mut state, conn);
    }

    /// Gives a healthy connection to the longest waiter, or parks it.
    fn hand_off(&self, state: &mut PoolState, conn: Arc<Connection>) {
        while let Some(waiter) = state.waiters.pop_front() {
            conn.mark_in_use();
            state.in_use.insert(conn.id(), Arc::clone(&conn));

            if waiter.grant(Grant::Ready(Arc::clone(&conn))) {
                self.sync_in_use(state);
                return;
            }
            state.in_use.remove(&conn.id());
        }

        conn.mark_idle();
        state.idle.push(conn);
        self.sync_in_use(state);
    }

    /// Hands free capacity to waiters as creation reservations.
    pub(super) fn grant_capacity(&self, state: &mut PoolState) {
        while state.total() < self.config.max_size {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };

            state.creating += 1;
            if !waiter.grant(Grant::Create) {
                state.creating -= 1;
            }
        }
    }

    // ========================================================================
    // Release
    // ========================================================================

    /// Returns a checked-out connection.
    pub(super) fn release(self: &Arc<Self>, conn: Arc<Connection>) {
        let mut discard = None;
        let mut replenish = false;

        {
            let mut state = self.state.lock();
            if state.in_use.remove(&conn.id()).is_none() {
                return;
            }

            if state.closed {
                discard = Some(conn);
            } else if conn.is_healthy() {
                trace!(connection = %conn.id(), "Connection released");
                self.hand_off(&mut state, conn);
            } else {
                discard = Some(conn);
                self.grant_capacity(&mut state);
                replenish =
                    state.waiters.is_empty() && state.total() < self.config.min_size;
            }

            self.sync_in_use(&state);
        }

        if let Some(conn) = discard {
            debug!(connection = %conn.id(), state = %conn.state(), "Discarding connection");
            conn.close();
        }

        if replenish {
            self.spawn_replenish();
        }
    }

    /// Gives back a creation slot that was never used.
    pub(super) fn cancel_creation(&self) {
        let mut state = self.state.lock();
        state.creating -= 1;
        if !state.closed {
            self.grant_capacity(&mut state);
        }
    }

    /// Returns a grant whose waiter went away before claiming it.
    pub(super) fn return_grant(self: &Arc<Self>, grant: Grant) {
        match grant {
            Grant::Ready(conn) => self.release(conn),
            Grant::Create => self.cancel_creation(),
        }
    }

    pub(super) fn remove_waiter(&self, id: u64) -> bool {
        self.state.lock().waiters.remove(id)
    }

    pub(super) fn sync_in_use(&self, state: &PoolState) {
        self.in_use_count.send_replace(state.in_use.len());
    }

    // ========================================================================
    // Capabilities
    // ========================================================================

    pub(super) fn publish_capabilities(&self, conn: &Connection) {
        *self.capabilities.write() = conn.capabilities();
    }

    fn capabilities(&self) -> Arc<Capabilities> {
        Arc::clone(&self.capabilities.read())
    }

    // ========================================================================
    // Replenishment
    // ========================================================================

    /// Creates connections until `min_size` is reached.
    ///
    /// # Errors
    ///
    /// Returns the first creation failure.
    pub(super) async fn fill_to_min(self: &Arc<Self>) -> Result<()> {
        loop {
            let reservation = {
                let mut state = self.state.lock();
                if state.closed || state.total() >= self.config.min_size {
                    return Ok(());
                }
                state.creating += 1;
                Reservation::new(Arc::clone(self))
            };

            let conn = self.factory.create().await?;
            reservation.park(conn);
        }
    }

    fn spawn_replenish(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let pool = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(e) = pool.fill_to_min().await {
                warn!(error = %e, "Replenishing pool failed");
            }
        });
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    async fn shutdown(&self, drain_timeout: Duration) {
        let (idle, waiters, first, mut in_use_rx) = {
            let mut state = self.state.lock();
            let first = !state.closed;
            state.closed = true;
            self.sync_in_use(&state);
            (
                std::mem::take(&mut state.idle),
                state.waiters.drain(),
                first,
                self.in_use_count.subscribe(),
            )
        };

        if first {
            info!(
                idle = idle.len(),
                waiters = waiters.len(),
                in_use = *in_use_rx.borrow(),
                "Pool shutting down"
            );
        }

        // Dropping the senders wakes every waiter with `PoolClosed`.
        drop(waiters);

        for conn in idle {
            conn.close();
        }

        let drained = timeout(drain_timeout, in_use_rx.wait_for(|count| *count == 0))
            .await
            .is_ok();

        if !drained {
            let remaining: Vec<_> = self.state.lock().in_use.values().cloned().collect();
            warn!(count = remaining.len(), "Force-closing connections still checked out");
            for conn in remaining {
                conn.close();
            }
        }

        if first {
            info!(drained, "Pool shut down");
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// A bounded pool of MCP connections to one endpoint.
///
/// Cheap to clone; clones share the same connections.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use mcp_pool::{Endpoint, Pool};
/// use serde_json::json;
///
/// let pool = Pool::builder()
///     .endpoint(Endpoint::stdio("mcp-server-calculator"))
///     .max_size(4)
///     .start()
///     .await?;
///
/// let result = pool.invoke("add", json!({"a": 2, "b": 3}), Duration::from_secs(10)).await?;
/// println!("{}", result.text());
///
/// pool.shutdown(Duration::from_secs(5)).await;
/// ```
#[derive(Clone)]
pub struct Pool {
    pub(super) inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Starts a pool: creates `min_size` connections, then starts maintenance.
    ///
    /// The factory's own options govern handshake timeout and pipeline
    /// depth; [`PoolBuilder`] derives them from `config`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `config` is invalid
    /// - [`Error::Connect`] / [`Error::VersionMismatch`] if an eager connection fails
    pub async fn start(factory: ConnectionFactory, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner::new(factory, config));

        if let Err(e) = inner.fill_to_min().await {
            warn!(error = %e, "Pool start failed");
            inner.shutdown(Duration::ZERO).await;
            return Err(e);
        }

        tokio::spawn(maintenance::run(
            Arc::downgrade(&inner),
            inner.config.health_check_interval,
        ));

        info!(
            endpoint = %inner.factory.describe(),
            max_size = inner.config.max_size,
            min_size = inner.config.min_size,
            "Pool started"
        );

        Ok(Self { inner })
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    // ========================================================================
    // Checkout
    // ========================================================================

    /// Checks out a connection, waiting up to the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolClosed`] if shutdown has begun
    /// - [`Error::AcquireTimeout`] if nothing became available in time
    /// - [`Error::Connect`] if a new connection had to be created and failed
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_timeout(self.inner.config.acquire_timeout)
            .await
    }

    /// Checks out a connection, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Pool::acquire`].
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        self.inner.acquire(timeout).await
    }

    // ========================================================================
    // Tools
    // ========================================================================

    /// Invokes a tool on a pooled connection.
    ///
    /// `timeout` bounds the whole operation; acquiring is additionally
    /// bounded by the configured acquire timeout. A `null` argument value
    /// is sent as an empty object. Arguments are validated against the
    /// tool's input schema before anything is sent.
    ///
    /// The connection is released on every exit path, including when the
    /// returned future is dropped.
    ///
    /// # Errors
    ///
    /// - Acquire errors, see [`Pool::acquire`]
    /// - [`Error::UnknownTool`] / [`Error::Schema`] before dispatch
    /// - Call errors, see [`Connection::call`]
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallResult> {
        let deadline = deadline_after(timeout);
        let conn = self
            .acquire_timeout(timeout.min(self.inner.config.acquire_timeout))
            .await?;

        let arguments = if arguments.is_null() {
            Value::Object(Map::new())
        } else {
            arguments
        };

        let mut capabilities = conn.capabilities();
        if capabilities.tool(tool).is_none() && conn.capabilities_changed() {
            capabilities = conn
                .refresh_capabilities(time_left(deadline, timeout)?)
                .await?;
            self.inner.publish_capabilities(&conn);
        }

        capabilities.validate_arguments(tool, &arguments)?;

        trace!(connection = %conn.id(), tool, "Invoking tool");
        conn.call_tool(tool, arguments, time_left(deadline, timeout)?)
            .await
    }

    /// Tools from the most recent capability snapshot.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.inner.capabilities().tools.clone()
    }

    /// Prompts from the most recent capability snapshot.
    #[must_use]
    pub fn list_prompts(&self) -> Vec<PromptInfo> {
        self.inner.capabilities().prompts.clone()
    }

    /// The most recent capability snapshot.
    #[must_use]
    pub fn capabilities(&self) -> Arc<Capabilities> {
        self.inner.capabilities()
    }

    // ========================================================================
    // Status & Shutdown
    // ========================================================================

    /// Returns an occupancy snapshot.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            creating: state.creating,
            waiters: state.waiters.len(),
            max_size: self.inner.config.max_size,
            min_size: self.inner.config.min_size,
            closed: state.closed,
        }
    }

    /// Returns `true` once shutdown has begun.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Shuts the pool down. Idempotent.
    ///
    /// Rejects waiters with [`Error::PoolClosed`], closes idle connections,
    /// waits up to `drain_timeout` for checkouts to come back, then
    /// force-closes whatever is still out.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.inner.shutdown(drain_timeout).await;
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("endpoint", &self.inner.factory.describe())
            .field("status", &self.status())
            .finish()
    }
}

/// Time left before `deadline`, or a timeout error if none.
fn time_left(deadline: Instant, timeout: Duration) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(Error::timeout("invoke", timeout.as_millis() as u64));
    }
    Ok(left)
}
