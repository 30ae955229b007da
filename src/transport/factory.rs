//! Connection factory.
//!
//! Opens a transport and performs the MCP handshake:
//!
//! 1. `initialize` with the client's protocol version and identity
//! 2. Protocol version check
//! 3. `notifications/initialized`
//! 4. `tools/list` (all pages), then `prompts/list` when advertised
//!
//! The whole sequence is bounded by the handshake timeout. A failed
//! attempt releases its transport before returning; the factory never
//! retries.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{
    Capabilities, ClientCapabilities, Implementation, InitializeParams, InitializeResult,
    PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS, method,
};
use crate::schema::ToolSchemas;

use super::{Connection, Connector};

// ============================================================================
// Constants
// ============================================================================

/// Default bound on connect + handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a health check.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// FactoryOptions
// ============================================================================

/// Settings applied to every connection a factory creates.
#[derive(Debug, Clone)]
pub struct FactoryOptions {
    /// Bound on transport connect plus handshake.
    pub handshake_timeout: Duration,
    /// Maximum in-flight requests per connection.
    pub pipeline_depth: usize,
    /// Bound on a single health check.
    pub health_check_timeout: Duration,
    /// Identity sent in `initialize`.
    pub client_info: Implementation,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            pipeline_depth: 1,
            health_check_timeout: DEFAULT_HEALTH_CHECK_TIMEOUT,
            client_info: Implementation::this_crate(),
        }
    }
}

// ============================================================================
// ConnectionFactory
// ============================================================================

/// Creates handshaken connections to one endpoint.
#[derive(Clone)]
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    options: FactoryOptions,
}

impl ConnectionFactory {
    /// Creates a factory with default options.
    pub fn new(connector: impl Connector) -> Self {
        Self::with_options(connector, FactoryOptions::default())
    }

    /// Creates a factory with explicit options.
    pub fn with_options(connector: impl Connector, options: FactoryOptions) -> Self {
        Self {
            connector: Arc::new(connector),
            options,
        }
    }

    /// Creates a factory from a shared connector.
    pub fn from_shared(connector: Arc<dyn Connector>, options: FactoryOptions) -> Self {
        Self { connector, options }
    }

    /// Returns the options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &FactoryOptions {
        &self.options
    }

    /// Describes the endpoint for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// Opens a transport and performs the handshake.
    ///
    /// On success the connection is `Idle` and carries its capability
    /// snapshot.
    ///
    /// # Errors
    ///
    /// - [`Error::VersionMismatch`] if the server's protocol version is unsupported
    /// - [`Error::Connect`] for every other failure, including timeout
    pub async fn create(&self) -> Result<Connection> {
        let started = Instant::now();
        let budget = self.options.handshake_timeout;
        let budget_ms = budget.as_millis() as u64;

        let transport = match timeout(budget, self.connector.connect()).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(into_connect_error(e)),
            Err(_) => {
                return Err(Error::connect(format!(
                    "transport not established within {budget_ms}ms"
                )));
            }
        };

        let connection = Connection::start(
            transport,
            self.options.pipeline_depth,
            self.options.health_check_timeout,
        );

        let remaining = budget.saturating_sub(started.elapsed());
        match timeout(remaining, handshake(&connection, &self.options)).await {
            Ok(Ok(capabilities)) => {
                info!(
                    connection = %connection.id(),
                    endpoint = %self.connector.describe(),
                    protocol_version = %capabilities.protocol_version,
                    tools = capabilities.tools.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Connection established"
                );
                connection.set_capabilities(capabilities);
                connection.mark_idle();
                Ok(connection)
            }
            Ok(Err(e)) => {
                warn!(connection = %connection.id(), error = %e, "Handshake failed");
                connection.close();
                Err(into_connect_error(e))
            }
            Err(_) => {
                warn!(connection = %connection.id(), "Handshake timed out");
                connection.close();
                Err(Error::connect(format!(
                    "handshake not completed within {budget_ms}ms"
                )))
            }
        }
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("endpoint", &self.connector.describe())
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// Handshake
// ============================================================================

async fn handshake(connection: &Connection, options: &FactoryOptions) -> Result<Capabilities> {
    let step_timeout = options.handshake_timeout;

    let params = InitializeParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: options.client_info.clone(),
    };

    let value = connection
        .request(
            method::INITIALIZE,
            Some(serde_json::to_value(params)?),
            step_timeout,
        )
        .await?;
    let init: InitializeResult = serde_json::from_value(value)
        .map_err(|e| Error::protocol(format!("Invalid initialize result: {e}")))?;

    if !SUPPORTED_PROTOCOL_VERSIONS.contains(&init.protocol_version.as_str()) {
        return Err(Error::version_mismatch(
            PROTOCOL_VERSION,
            init.protocol_version,
        ));
    }

    connection.notify(method::INITIALIZED, None)?;

    let tools = if init.capabilities.tools.is_some() {
        connection.list_tools(step_timeout).await?
    } else {
        Vec::new()
    };

    let prompts = if init.capabilities.prompts.is_some() {
        connection.list_prompts(step_timeout).await?
    } else {
        Vec::new()
    };

    debug!(
        connection = %connection.id(),
        server = ?init.server_info.as_ref().map(|info| info.name.as_str()),
        "Handshake completed"
    );

    Ok(Capabilities {
        protocol_version: init.protocol_version,
        server_info: init.server_info,
        server: init.capabilities,
        instructions: init.instructions,
        schemas: ToolSchemas::compile(&tools),
        tools,
        prompts,
    })
}

/// Folds handshake failures into [`Error::Connect`], keeping version mismatches.
fn into_connect_error(error: Error) -> Error {
    match error {
        Error::Connect { .. } | Error::VersionMismatch { .. } => error,
        other => Error::connect(other.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::{MockServer, ServerMode};
    use crate::transport::{ConnectionState, MemoryConnector};

    #[tokio::test]
    async fn test_handshake_snapshots_all_tool_pages() {
        let server = MockServer::new();
        let conn = server.factory().create().await.expect("create");

        let caps = conn.capabilities();
        assert_eq!(caps.protocol_version, PROTOCOL_VERSION);
        assert_eq!(caps.tools.len(), MockServer::TOOL_COUNT);
        assert!(caps.tool("add").is_some());
        assert!(caps.tool("echo").is_some());
        assert_eq!(caps.prompts.len(), 1);
        assert!(caps.server.prompts.is_some());
        assert_eq!(caps.schemas.len(), MockServer::TOOL_COUNT);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(server.saw_initialized());
    }

    #[tokio::test]
    async fn test_older_supported_version_accepted() {
        let server = MockServer::new().with_protocol_version("2024-11-05");
        let conn = server.factory().create().await.expect("create");
        assert_eq!(conn.capabilities().protocol_version, "2024-11-05");
    }

    #[tokio::test]
    async fn test_version_mismatch_releases_transport() {
        let server = MockServer::new().with_protocol_version("1999-01-01");
        let err = server.factory().create().await.unwrap_err();

        match err {
            Error::VersionMismatch { requested, offered } => {
                assert_eq!(requested, PROTOCOL_VERSION);
                assert_eq!(offered, "1999-01-01");
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
        server.wait_for_live_sessions(0).await;
    }

    #[tokio::test]
    async fn test_initialize_error_becomes_connect_error() {
        let server = MockServer::new().with_mode(ServerMode::RejectInitialize);
        let err = server.factory().create().await.unwrap_err();

        assert!(matches!(err, Error::Connect { .. }));
        server.wait_for_live_sessions(0).await;
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let server = MockServer::new().with_mode(ServerMode::Silent);
        let factory = server.factory_with(|options| {
            options.handshake_timeout = Duration::from_millis(50);
        });

        let started = Instant::now();
        let err = factory.create().await.unwrap_err();

        assert!(matches!(err, Error::Connect { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        server.wait_for_live_sessions(0).await;
    }

    #[tokio::test]
    async fn test_refused_transport() {
        let factory = ConnectionFactory::new(MemoryConnector::new(|_| {
            Err(Error::Io(std::io::Error::other("refused")))
        }));

        let err = factory.create().await.unwrap_err();
        assert!(matches!(err, Error::Connect { .. }));
    }
}
