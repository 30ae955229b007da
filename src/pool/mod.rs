//! Connection pool.
//!
//! A [`Pool`] owns up to `max_size` connections to one endpoint and hands
//! them out one caller at a time.
//!
//! # Checkout Order
//!
//! 1. Queued callers are served first, in arrival order
//! 2. The most recently released healthy idle connection
//! 3. A new connection, if below `max_size`
//! 4. Otherwise the caller queues until a release, a discard, or its timeout
//!
//! # Guards
//!
//! Every suspend point is covered by a guard, so dropping any pool future
//! leaves the accounting intact:
//!
//! | Guard | Covers |
//! |-------|--------|
//! | [`PooledConnection`] | A checked-out connection |
//! | `Reservation` | A creation slot while the handshake runs |
//! | `WaiterHandle` | A queue entry while the caller waits |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `builder` | Fluent pool construction |
//! | `config` | Pool limits and timers |
//! | `core` | Checkout, release, shutdown, tool invocation |
//! | `guard` | RAII checkout and creation guards |
//! | `maintenance` | Eviction, health checks, replenishment |
//! | `waiter` | FIFO wait queue |

// ============================================================================
// Submodules
// ============================================================================

/// Fluent pool construction.
mod builder;

/// Pool limits and timers.
pub mod config;

/// Checkout, release, shutdown, tool invocation.
mod core;

/// RAII checkout and creation guards.
mod guard;

/// Eviction, health checks, replenishment.
mod maintenance;

/// FIFO wait queue.
mod waiter;


// ============================================================================
// Re-exports
// ============================================================================

pub use self::builder::PoolBuilder;
pub use self::config::{PoolConfig, PoolSettings};
pub use self::core::{Pool, PoolStatus};
pub use self::guard::PooledConnection;
