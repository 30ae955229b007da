//! MCP handshake, tool and prompt payloads.
//!
//! Only the fields the pool reads are modeled; unknown fields are ignored
//! on deserialization.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::ToolSchemas;

// ============================================================================
// Constants
// ============================================================================

/// Protocol version this client requests during `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Server protocol versions this client can talk to.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Method names used by the pool.
pub mod method {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Handshake confirmation notification.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness check (either direction).
    pub const PING: &str = "ping";
    /// List tools (paginated).
    pub const TOOLS_LIST: &str = "tools/list";
    /// Invoke a tool.
    pub const TOOLS_CALL: &str = "tools/call";
    /// List prompts (paginated).
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Server notification: tool list changed.
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// Server notification: prompt list changed.
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
}

// ============================================================================
// Initialize
// ============================================================================

/// Name and version of a protocol participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Participant name.
    pub name: String,
    /// Participant version.
    #[serde(default)]
    pub version: String,
}

impl Implementation {
    /// Identity of this crate as a client.
    #[must_use]
    pub fn this_crate() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Capabilities the client offers. The pool offers none.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientCapabilities {}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Requested protocol version.
    pub protocol_version: String,
    /// Client capabilities.
    pub capabilities: ClientCapabilities,
    /// Client identity.
    pub client_info: Implementation,
}

/// Presence marker for a list-style server capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCapability {
    /// Whether the server sends `list_changed` notifications.
    #[serde(default)]
    pub list_changed: bool,
}

/// Capabilities the server advertises.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerCapabilities {
    /// Tool support.
    #[serde(default)]
    pub tools: Option<ListCapability>,
    /// Prompt support.
    #[serde(default)]
    pub prompts: Option<ListCapability>,
    /// Resource support (not used by the pool).
    #[serde(default)]
    pub resources: Option<Value>,
}

/// `initialize` result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Version the server chose.
    pub protocol_version: String,
    /// Server capabilities.
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Server identity.
    #[serde(default)]
    pub server_info: Option<Implementation>,
    /// Free-form usage instructions for the model.
    #[serde(default)]
    pub instructions: Option<String>,
}

// ============================================================================
// Tools
// ============================================================================

/// A tool exposed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    /// Tool name, unique per server.
    pub name: String,
    /// Human readable title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Description shown to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the arguments object.
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object"})
}

/// `tools/list` result page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsListResult {
    /// Tools on this page.
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    /// Cursor for the next page.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// `tools/call` parameters.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallParams {
    /// Tool name.
    pub name: String,
    /// Arguments object.
    pub arguments: Value,
}

/// `tools/call` result.
///
/// `is_error` marks a tool-level failure; the RPC itself succeeded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Unstructured content blocks.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Structured result, when the tool declares an output schema.
    #[serde(default)]
    pub structured_content: Option<Value>,
    /// Tool reported failure.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Concatenates all text blocks, newline separated.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One block of tool output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Base64 image.
    Image {
        /// Base64 data.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Base64 audio.
    Audio {
        /// Base64 data.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Link to a server resource.
    ResourceLink {
        /// Resource URI.
        uri: String,
        /// Resource name.
        #[serde(default)]
        name: Option<String>,
    },
    /// Embedded resource contents.
    Resource {
        /// Raw resource object.
        resource: Value,
    },
    /// Block type this client does not model.
    #[serde(other)]
    Unknown,
}

// ============================================================================
// Prompts
// ============================================================================

/// A prompt template exposed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptInfo {
    /// Prompt name.
    pub name: String,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Template arguments.
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// One prompt template argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default)]
    pub required: bool,
}

/// `prompts/list` result page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptsListResult {
    /// Prompts on this page.
    #[serde(default)]
    pub prompts: Vec<PromptInfo>,
    /// Cursor for the next page.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

// ============================================================================
// Capabilities
// ============================================================================

/// What a server offered during one connection's handshake.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// Server identity.
    pub server_info: Option<Implementation>,
    /// Capabilities the server advertised in `initialize`.
    pub server: ServerCapabilities,
    /// Server usage instructions.
    pub instructions: Option<String>,
    /// Tools exposed by the server.
    pub tools: Vec<ToolInfo>,
    /// Prompts exposed by the server.
    pub prompts: Vec<PromptInfo>,
    /// Compiled input schemas of `tools`.
    pub schemas: ToolSchemas,
}

impl Capabilities {
    /// Looks up a tool by name.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&ToolInfo> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    /// Checks `arguments` against the input schema of tool `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTool`] if the server does not list the tool,
    /// or [`Error::Schema`] if the arguments violate its schema.
    pub fn validate_arguments(&self, name: &str, arguments: &Value) -> Result<()> {
        let tool = self.tool(name).ok_or_else(|| Error::unknown_tool(name))?;
        self.schemas.validate(tool, arguments)
    }
}

// ============================================================================
// Tests
// ============================================================================
