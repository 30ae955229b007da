//! RAII guards owned by callers and creators.
//!
//! | Guard | Held by | On drop |
//! |-------|---------|---------|
//! | [`PooledConnection`] | caller holding a checked-out connection | release to pool |
//! | [`Reservation`] | task creating a connection | give the slot back |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::Result;
use crate::identifiers::ConnectionId;
use crate::transport::Connection;

use super::core::PoolInner;

// ============================================================================
// PooledConnection
// ============================================================================

/// A connection checked out of the pool.
///
/// Dereferences to [`Connection`]. Dropping it releases the connection:
/// healthy ones go to the next waiter or back to the idle set, unhealthy
/// ones are closed and their slot is freed.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Arc<Connection>,
}

impl PooledConnection {
    pub(crate) fn new(pool: Arc<PoolInner>, conn: Arc<Connection>) -> Self {
        Self { pool, conn }
    }

    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Releases the connection back to the pool.
    ///
    /// Equivalent to dropping the guard.
    #[inline]
    pub fn release(self) {
        drop(self);
    }

    /// Marks the connection unhealthy and releases it, so the pool closes it.
    pub fn discard(self, reason: impl Into<String>) {
        self.conn.mark_unhealthy(reason);
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.conn));
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&*self.conn).finish()
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// A counted creation slot.
///
/// The slot is already included in the pool's `creating` count. It is
/// consumed by [`Reservation::checkout`] or [`Reservation::park`]; if
/// dropped unconsumed the slot is returned and may be granted to a waiter.
pub(crate) struct Reservation {
    pool: Arc<PoolInner>,
    armed: bool,
}

impl Reservation {
    pub(crate) fn new(pool: Arc<PoolInner>) -> Self {
        Self { pool, armed: true }
    }

    /// Registers the new connection as checked out by the creator.
    pub(crate) fn checkout(mut self, conn: Connection) -> Result<PooledConnection> {
        self.armed = false;
        let conn = self.pool.admit_in_use(conn)?;
        Ok(PooledConnection::new(Arc::clone(&self.pool), conn))
    }

    /// Adds the new connection to the idle set (or hands it to a waiter).
    pub(crate) fn park(mut self, conn: Connection) {
        self.armed = false;
        self.pool.admit_idle(conn);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.cancel_creation();
        }
    }
}
