//! FIFO queue of callers waiting for a connection.
//!
//! A waiter is satisfied by a [`Grant`] sent through its oneshot channel
//! while the pool lock is held. The receiving side lives in a
//! [`WaiterHandle`], which removes the entry or returns an unclaimed
//! grant if the waiting future is dropped.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::trace;

use crate::transport::Connection;

use super::core::PoolInner;

// ============================================================================
// Grant
// ============================================================================

/// What a waiter receives.
pub(crate) enum Grant {
    /// A connection already checked out on the waiter's behalf.
    Ready(Arc<Connection>),
    /// A reserved creation slot; the waiter creates the connection.
    Create,
}

// ============================================================================
// Waiter
// ============================================================================

/// One queued caller.
pub(crate) struct Waiter {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Grant>,
}

impl Waiter {
    /// Delivers a grant. Returns `false` if the caller is gone.
    pub(crate) fn grant(self, grant: Grant) -> bool {
        trace!(
            waiter = self.id,
            waited_ms = self.enqueued_at.elapsed().as_millis() as u64,
            create = matches!(grant, Grant::Create),
            "Granting waiter"
        );
        self.tx.send(grant).is_ok()
    }
}

// ============================================================================
// WaiterQueue
// ============================================================================

/// FIFO queue of waiters.
#[derive(Default)]
pub(crate) struct WaiterQueue {
    entries: VecDeque<Waiter>,
    next_id: u64,
}

impl WaiterQueue {
    /// Appends a waiter and returns its id and receiver.
    pub(crate) fn push(&mut self) -> (u64, oneshot::Receiver<Grant>) {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.entries.push_back(Waiter {
            id,
            enqueued_at: Instant::now(),
            tx,
        });
        (id, rx)
    }

    /// Removes the longest-waiting caller.
    pub(crate) fn pop_front(&mut self) -> Option<Waiter> {
        self.entries.pop_front()
    }

    /// Removes a waiter by id. Returns `false` if it was already granted.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|waiter| waiter.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes every waiter.
    pub(crate) fn drain(&mut self) -> Vec<Waiter> {
        self.entries.drain(..).collect()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// WaiterHandle
// ============================================================================

/// Receiving side of a queued waiter.
///
/// Dropping an unsettled handle dequeues the waiter, or hands back a
/// grant that was delivered but never claimed.
pub(crate) struct WaiterHandle {
    pool: Arc<PoolInner>,
    id: u64,
    rx: oneshot::Receiver<Grant>,
    settled: bool,
}

impl WaiterHandle {
    pub(crate) fn new(pool: Arc<PoolInner>, id: u64, rx: oneshot::Receiver<Grant>) -> Self {
        Self {
            pool,
            id,
            rx,
            settled: false,
        }
    }

    /// Waits for a grant. `None` means the pool dropped the waiter on shutdown.
    pub(crate) async fn recv(&mut self) -> Option<Grant> {
        let result = (&mut self.rx).await;
        self.settled = true;
        result.ok()
    }

    /// Leaves the queue. Returns a grant that raced the cancellation.
    pub(crate) fn cancel(&mut self) -> Option<Grant> {
        if self.settled {
            return None;
        }
        self.settled = true;

        if self.pool.remove_waiter(self.id) {
            return None;
        }

        // Granted under the lock before we got it; the value is in the channel.
        self.rx.try_recv().ok()
    }
}

impl Drop for WaiterHandle {
    fn drop(&mut self) {
        if let Some(grant) = self.cancel() {
            self.pool.return_grant(grant);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
