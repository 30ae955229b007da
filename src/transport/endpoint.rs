//! Endpoint descriptions.
//!
//! An [`Endpoint`] says how to reach one logical MCP server. It is
//! serializable so pools can be configured from JSON:
//!
//! ```json
//! {"transport": "stdio", "command": "mcp-server-git", "args": ["--repo", "."]}
//! {"transport": "websocket", "url": "ws://127.0.0.1:8931/mcp"}
//! {"transport": "http", "url": "http://127.0.0.1:8000/mcp"}
//! ```

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

use super::{Connector, Transport, http, stdio, websocket};

// ============================================================================
// Endpoint
// ============================================================================

/// How to reach an MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Endpoint {
    /// Spawn a child process and speak over its stdio.
    Stdio {
        /// Executable to run.
        command: String,
        /// Command line arguments.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        /// Extra environment variables.
        #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
        env: FxHashMap<String, String>,
    },

    /// Connect to a WebSocket server.
    WebSocket {
        /// Server URL (`ws://` or `wss://`).
        url: Url,
    },

    /// Post to a Streamable HTTP server.
    Http {
        /// Server URL (`http://` or `https://`).
        url: Url,
    },
}

impl Endpoint {
    /// Creates a stdio endpoint.
    #[must_use]
    pub fn stdio(command: impl Into<String>) -> Self {
        Self::Stdio {
            command: command.into(),
            args: Vec::new(),
            env: FxHashMap::default(),
        }
    }

    /// Creates a WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL is malformed or not `ws`/`wss`.
    pub fn websocket(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::config(format!("Invalid URL '{url}': {e}")))?;
        let endpoint = Self::WebSocket { url };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Creates a Streamable HTTP endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL is malformed or not `http`/`https`.
    pub fn http(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::config(format!("Invalid URL '{url}': {e}")))?;
        let endpoint = Self::Http { url };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Appends a command line argument. No effect on network endpoints.
    #[must_use]
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        if let Self::Stdio { args, .. } = &mut self {
            args.push(value.into());
        }
        self
    }

    /// Sets an environment variable. No effect on network endpoints.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Stdio { env, .. } = &mut self {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Checks the endpoint is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the problem.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Stdio { command, .. } if command.trim().is_empty() => {
                Err(Error::config("stdio endpoint requires a command"))
            }
            Self::WebSocket { url } if !matches!(url.scheme(), "ws" | "wss") => Err(Error::config(
                format!("WebSocket endpoint must use ws:// or wss://, got {}", url.scheme()),
            )),
            Self::Http { url } if !matches!(url.scheme(), "http" | "https") => Err(Error::config(
                format!("HTTP endpoint must use http:// or https://, got {}", url.scheme()),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Connector for Endpoint {
    async fn connect(&self) -> Result<Transport> {
        match self {
            Self::Stdio { command, args, env } => stdio::spawn(command, args, env),
            Self::WebSocket { url } => websocket::connect(url).await,
            Self::Http { url } => http::connect(url),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Stdio { command, .. } => format!("stdio:{command}"),
            Self::WebSocket { url } | Self::Http { url } => url.to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
