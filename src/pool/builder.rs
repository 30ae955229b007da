//! Builder pattern for pool configuration.
//!
//! Provides a fluent API for configuring and starting [`Pool`] instances.
//!
//! # Example
//!
//! ```ignore
//! use mcp_pool::{Endpoint, Pool};
//!
//! let pool = Pool::builder()
//!     .endpoint(Endpoint::websocket("ws://127.0.0.1:8931/mcp")?)
//!     .max_size(8)
//!     .min_size(2)
//!     .start()
//!     .await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::{ConnectionFactory, Connector, Endpoint};

use super::config::PoolConfig;
use super::core::Pool;

// ============================================================================
// PoolBuilder
// ============================================================================

/// Where connections come from.
#[derive(Clone)]
enum Source {
    Endpoint(Endpoint),
    Connector(Arc<dyn Connector>),
}

/// Builder for configuring a [`Pool`].
///
/// Use [`Pool::builder()`] to create a new builder.
#[derive(Clone, Default)]
pub struct PoolBuilder {
    source: Option<Source>,
    config: PoolConfig,
}

// ============================================================================
// PoolBuilder Implementation
// ============================================================================

impl PoolBuilder {
    /// Creates a builder with default configuration and no endpoint.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server endpoint.
    #[inline]
    #[must_use]
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.source = Some(Source::Endpoint(endpoint));
        self
    }

    /// Sets a custom connector.
    #[inline]
    #[must_use]
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.source = Some(Source::Connector(Arc::new(connector)));
        self
    }

    /// Replaces the whole configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the maximum pool size.
    #[inline]
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.config.max_size = max_size;
        self
    }

    /// Sets the minimum pool size.
    #[inline]
    #[must_use]
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.config.min_size = min_size;
        self
    }

    /// Sets the per-connection pipeline depth.
    #[inline]
    #[must_use]
    pub fn pipeline_depth(mut self, depth: usize) -> Self {
        self.config.pipeline_depth = depth;
        self
    }

    /// Sets the default acquire timeout.
    #[inline]
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Sets the idle eviction timeout.
    #[inline]
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Sets the maintenance interval.
    #[inline]
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    /// Sets the health check timeout.
    #[inline]
    #[must_use]
    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.config.health_check_timeout = timeout;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Validates the configuration and builds the connection factory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no endpoint is set or a value is invalid.
    pub fn build_factory(&self) -> Result<ConnectionFactory> {
        self.config.validate()?;

        let connector: Arc<dyn Connector> = match &self.source {
            Some(Source::Endpoint(endpoint)) => {
                endpoint.validate()?;
                Arc::new(endpoint.clone())
            }
            Some(Source::Connector(connector)) => Arc::clone(connector),
            None => {
                return Err(Error::config(
                    "An endpoint is required. Use .endpoint() or .connector() to set it.\n\
                     Example: Pool::builder().endpoint(Endpoint::stdio(\"my-mcp-server\"))",
                ));
            }
        };

        Ok(ConnectionFactory::from_shared(
            connector,
            self.config.factory_options(),
        ))
    }

    /// Starts the pool.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the builder is incomplete or invalid
    /// - [`Error::Connect`] / [`Error::VersionMismatch`] if an eager connection fails
    pub async fn start(self) -> Result<Pool> {
        let factory = self.build_factory()?;
        Pool::start(factory, self.config).await
    }
}

impl fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Some(Source::Endpoint(endpoint)) => Some(endpoint.describe()),
            Some(Source::Connector(connector)) => Some(connector.describe()),
            None => None,
        };
        f.debug_struct("PoolBuilder")
            .field("source", &source)
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
