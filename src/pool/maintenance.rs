//! Background maintenance.
//!
//! Every `health_check_interval` the pool:
//!
//! 1. Drops idle connections that died while parked
//! 2. Evicts connections idle longer than `idle_timeout`, oldest first,
//!    never going below `min_size`
//! 3. Pings idle connections with no activity for one interval; pinged
//!    connections are checked out so no caller sees them mid-check
//! 4. Refreshes the capability snapshot when a server reported a change
//! 5. Replenishes to `min_size`
//!
//! Checked-out connections are never touched.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, trace, warn};

use crate::transport::Connection;
use crate::transport::connection::deadline_after;

use super::core::PoolInner;
use super::guard::PooledConnection;

// ============================================================================
// Task
// ============================================================================

/// Runs maintenance until the pool is closed or dropped.
pub(crate) async fn run(pool: Weak<PoolInner>, period: Duration) {
    let mut ticker = interval_at(deadline_after(period), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.is_closed() {
            break;
        }

        pool.maintain().await;
    }

    debug!("Maintenance task stopped");
}

// ============================================================================
// Maintenance Pass
// ============================================================================

impl PoolInner {
    /// Runs one maintenance pass.
    pub(crate) async fn maintain(self: &Arc<Self>) {
        let now = Instant::now();
        let period = self.config.health_check_interval;

        let mut closing = Vec::new();
        let mut quiet = Vec::new();

        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }

            // Dead while parked.
            state.idle.retain(|conn| {
                if conn.is_healthy() {
                    true
                } else {
                    closing.push(Arc::clone(conn));
                    false
                }
            });

            // Expired, oldest first. The idle stack's bottom is the oldest.
            let mut surplus = state.total().saturating_sub(self.config.min_size);
            let idle_timeout = self.config.idle_timeout;
            state.idle.retain(|conn| {
                if surplus > 0 && conn.idle_for(now) >= idle_timeout {
                    surplus -= 1;
                    closing.push(Arc::clone(conn));
                    false
                } else {
                    true
                }
            });

            // Quiet for a full interval: check out for a ping.
            state.idle.retain(|conn| {
                if conn.quiet_for(now) >= period {
                    quiet.push(Arc::clone(conn));
                    false
                } else {
                    true
                }
            });
            for conn in &quiet {
                conn.mark_in_use();
                state.in_use.insert(conn.id(), Arc::clone(conn));
            }
            self.sync_in_use(&state);

            if !closing.is_empty() {
                self.grant_capacity(&mut state);
            }
        }

        for conn in closing {
            debug!(
                connection = %conn.id(),
                state = %conn.state(),
                idle_ms = conn.idle_for(now).as_millis() as u64,
                "Evicting idle connection"
            );
            conn.close();
        }

        if !quiet.is_empty() {
            trace!(count = quiet.len(), "Pinging idle connections");
            let checkouts: Vec<_> = quiet
                .into_iter()
                .map(|conn| PooledConnection::new(Arc::clone(self), conn))
                .collect();

            join_all(checkouts.iter().map(|conn| self.ping(conn))).await;

            // Releasing re-parks healthy connections and discards the rest.
            drop(checkouts);
        }

        if let Err(e) = self.fill_to_min().await {
            warn!(error = %e, "Replenishing pool failed");
        }
    }

    async fn ping(&self, conn: &Connection) {
        if !conn.check_health().await {
            warn!(connection = %conn.id(), "Health check failed");
            return;
        }

        if conn.capabilities_changed() {
            match conn
                .refresh_capabilities(self.config.health_check_timeout)
                .await
            {
                Ok(_) => self.publish_capabilities(conn),
                Err(e) => {
                    warn!(connection = %conn.id(), error = %e, "Capability refresh failed");
                }
            }
        }
    }
}
