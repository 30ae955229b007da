//! Pool sizing and timing configuration.
//!
//! [`PoolConfig`] is the validated, strongly typed form. [`PoolSettings`]
//! is its serde-facing twin with millisecond fields, for loading from JSON.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use mcp_pool::PoolConfig;
//!
//! let config = PoolConfig::new()
//!     .with_max_size(8)
//!     .with_min_size(2)
//!     .with_acquire_timeout(Duration::from_secs(5));
//! config.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::protocol::Implementation;
use crate::transport::FactoryOptions;

// ============================================================================
// Defaults
// ============================================================================

/// Default maximum live connections.
pub const DEFAULT_MAX_SIZE: usize = 4;

/// Default minimum warm connections.
pub const DEFAULT_MIN_SIZE: usize = 1;

/// Default idle time before a surplus connection is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default interval between maintenance passes.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default bound on one health check.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default in-flight requests per connection.
pub const DEFAULT_PIPELINE_DEPTH: usize = 1;

/// Largest accepted pipeline depth.
pub const MAX_PIPELINE_DEPTH: usize = Semaphore::MAX_PERMITS;

/// Default bound on waiting for a connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on connect plus handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// PoolConfig
// ============================================================================

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Upper bound on live plus in-creation connections.
    pub max_size: usize,

    /// Connections kept warm. Creation starts eagerly at pool start.
    pub min_size: usize,

    /// Idle time after which a connection above `min_size` is evicted.
    pub idle_timeout: Duration,

    /// Interval between maintenance passes.
    pub health_check_interval: Duration,

    /// Bound on one health check.
    pub health_check_timeout: Duration,

    /// Maximum in-flight requests per connection.
    pub pipeline_depth: usize,

    /// Default bound on waiting for a connection.
    pub acquire_timeout: Duration,

    /// Bound on connect plus handshake.
    pub handshake_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl PoolConfig {
    /// Creates a configuration with default values.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            min_size: DEFAULT_MIN_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Parses and validates a JSON settings document.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if a value is out of range
    pub fn from_json(text: &str) -> Result<Self> {
        let settings: PoolSettings = serde_json::from_str(text)?;
        Self::try_from(settings)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl PoolConfig {
    /// Sets the maximum pool size.
    #[inline]
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the minimum pool size.
    #[inline]
    #[must_use]
    pub const fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Sets the idle eviction timeout.
    #[inline]
    #[must_use]
    pub const fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the maintenance interval.
    #[inline]
    #[must_use]
    pub const fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets the health check timeout.
    #[inline]
    #[must_use]
    pub const fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Sets the per-connection pipeline depth.
    #[inline]
    #[must_use]
    pub const fn with_pipeline_depth(mut self, depth: usize) -> Self {
        self.pipeline_depth = depth;
        self
    }

    /// Sets the default acquire timeout.
    #[inline]
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the handshake timeout.
    #[inline]
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl PoolConfig {
    /// Checks every invariant the pool relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::config("maxSize must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(Error::config(format!(
                "minSize ({}) must not exceed maxSize ({})",
                self.min_size, self.max_size
            )));
        }
        if self.pipeline_depth == 0 {
            return Err(Error::config("pipelineDepth must be at least 1"));
        }
        if self.pipeline_depth > MAX_PIPELINE_DEPTH {
            return Err(Error::config(format!(
                "pipelineDepth must not exceed {MAX_PIPELINE_DEPTH}"
            )));
        }

        let timers = [
            ("idleTimeoutMs", self.idle_timeout),
            ("healthCheckIntervalMs", self.health_check_interval),
            ("healthCheckTimeoutMs", self.health_check_timeout),
            ("acquireTimeoutMs", self.acquire_timeout),
            ("handshakeTimeoutMs", self.handshake_timeout),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, value)| value.is_zero()) {
            return Err(Error::config(format!("{name} must be greater than zero")));
        }

        Ok(())
    }

    /// Options handed to the connection factory.
    #[must_use]
    pub fn factory_options(&self) -> FactoryOptions {
        FactoryOptions {
            handshake_timeout: self.handshake_timeout,
            pipeline_depth: self.pipeline_depth,
            health_check_timeout: self.health_check_timeout,
            client_info: Implementation::this_crate(),
        }
    }
}

// ============================================================================
// PoolSettings
// ============================================================================

/// Serializable pool settings.
///
/// Field names match the JSON configuration document; missing fields take
/// their defaults.
///
/// ```json
/// {"maxSize": 8, "minSize": 2, "acquireTimeoutMs": 5000}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolSettings {
    /// See [`PoolConfig::max_size`].
    pub max_size: usize,
    /// See [`PoolConfig::min_size`].
    pub min_size: usize,
    /// See [`PoolConfig::idle_timeout`].
    pub idle_timeout_ms: u64,
    /// See [`PoolConfig::health_check_interval`].
    pub health_check_interval_ms: u64,
    /// See [`PoolConfig::health_check_timeout`].
    pub health_check_timeout_ms: u64,
    /// See [`PoolConfig::pipeline_depth`].
    pub pipeline_depth: usize,
    /// See [`PoolConfig::acquire_timeout`].
    pub acquire_timeout_ms: u64,
    /// See [`PoolConfig::handshake_timeout`].
    pub handshake_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&PoolConfig::new())
    }
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_size: config.max_size,
            min_size: config.min_size,
            idle_timeout_ms: config.idle_timeout.as_millis() as u64,
            health_check_interval_ms: config.health_check_interval.as_millis() as u64,
            health_check_timeout_ms: config.health_check_timeout.as_millis() as u64,
            pipeline_depth: config.pipeline_depth,
            acquire_timeout_ms: config.acquire_timeout.as_millis() as u64,
            handshake_timeout_ms: config.handshake_timeout.as_millis() as u64,
        }
    }
}

impl TryFrom<PoolSettings> for PoolConfig {
    type Error = Error;

    fn try_from(settings: PoolSettings) -> Result<Self> {
        let config = Self {
            max_size: settings.max_size,
            min_size: settings.min_size,
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
            health_check_interval: Duration::from_millis(settings.health_check_interval_ms),
            health_check_timeout: Duration::from_millis(settings.health_check_timeout_ms),
            pipeline_depth: settings.pipeline_depth,
            acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 4);
        assert_eq!(config.min_size, 1);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.health_check_timeout, Duration::from_secs(5));
        assert_eq!(config.pipeline_depth, 1);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = PoolConfig::new()
            .with_max_size(8)
            .with_min_size(2)
            .with_pipeline_depth(4)
            .with_acquire_timeout(Duration::from_millis(50));

        assert_eq!(config.max_size, 8);
        assert_eq!(config.min_size, 2);
        assert_eq!(config.pipeline_depth, 4);
        assert_eq!(config.acquire_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        assert!(PoolConfig::new().with_max_size(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .with_max_size(2)
                .with_min_size(3)
                .validate()
                .is_err()
        );
        assert!(PoolConfig::new().with_pipeline_depth(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .with_pipeline_depth(usize::MAX)
                .validate()
                .is_err()
        );
        assert!(
            PoolConfig::new()
                .with_pipeline_depth(MAX_PIPELINE_DEPTH)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_unbounded_timers_are_valid() {
        let config = PoolConfig::new()
            .with_acquire_timeout(Duration::MAX)
            .with_handshake_timeout(Duration::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timers() {
        let err = PoolConfig::new()
            .with_acquire_timeout(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("acquireTimeoutMs"));
    }

    #[test]
    fn test_min_size_zero_is_valid() {
        assert!(PoolConfig::new().with_min_size(0).validate().is_ok());
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let config =
            PoolConfig::from_json(r#"{"maxSize": 8, "acquireTimeoutMs": 50}"#).expect("parse");

        assert_eq!(config.max_size, 8);
        assert_eq!(config.min_size, DEFAULT_MIN_SIZE);
        assert_eq!(config.acquire_timeout, Duration::from_millis(50));
        assert_eq!(config.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(matches!(
            PoolConfig::from_json(r#"{"maxSize": 1, "minSize": 2}"#),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            PoolConfig::from_json(r#"{"maxSzie": 1}"#),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_settings_roundtrip_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(PoolConfig::try_from(settings).expect("valid"), PoolConfig::new());
    }
}
