//! In-process MCP server for tests.
//!
//! [`MockServer`] speaks enough MCP over a memory transport to exercise
//! handshakes, pagination, pipelining, crashes and `list_changed`
//! notifications. Every session shares one set of counters so tests can
//! observe what the client did.
//!
//! | Tool | Behavior |
//! |------|----------|
//! | `add` | Sums integers `a` and `b` |
//! | `echo` | Returns `text` |
//! | `sleep` | Waits `ms` milliseconds, returns `ms` |
//! | `fail` | JSON-RPC error `-32000` |
//! | `soft_fail` | Result with `isError: true` |
//! | `crash` | Drops the session without replying |
//! | `mutate` | Adds tool `extra`, notifies, returns `ok` |
//! | `noop` | Returns `ok` |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use crate::error::Error;
use crate::protocol::{PROTOCOL_VERSION, method};
use crate::transport::{ConnectionFactory, FactoryOptions, MemoryConnector, Transport};

// ============================================================================
// Tracing
// ============================================================================

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MockServer
// ============================================================================

/// How a server answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerMode {
    /// Full protocol.
    Normal,
    /// `initialize` fails with an internal error.
    RejectInitialize,
    /// Reads frames and never answers.
    Silent,
}

const PAGE_SIZE: usize = 3;

struct Stats {
    live_sessions: AtomicUsize,
    sessions_opened: AtomicUsize,
    active_calls: AtomicUsize,
    max_concurrent_calls: AtomicUsize,
    tool_calls: AtomicUsize,
    initialized: AtomicBool,
    refusing: AtomicBool,
    extra_tool: AtomicBool,
    disconnect: watch::Sender<u64>,
}

impl Stats {
    fn new() -> Self {
        let (disconnect, _) = watch::channel(0);
        Self {
            live_sessions: AtomicUsize::new(0),
            sessions_opened: AtomicUsize::new(0),
            active_calls: AtomicUsize::new(0),
            max_concurrent_calls: AtomicUsize::new(0),
            tool_calls: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            refusing: AtomicBool::new(false),
            extra_tool: AtomicBool::new(false),
            disconnect,
        }
    }
}

/// In-process MCP server.
#[derive(Clone)]
pub(crate) struct MockServer {
    protocol_version: String,
    mode: ServerMode,
    stats: Arc<Stats>,
}

impl MockServer {
    /// Number of tools advertised before `mutate` runs.
    pub(crate) const TOOL_COUNT: usize = 8;

    pub(crate) fn new() -> Self {
        init_tracing();
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            mode: ServerMode::Normal,
            stats: Arc::new(Stats::new()),
        }
    }

    pub(crate) fn with_protocol_version(mut self, version: &str) -> Self {
        self.protocol_version = version.to_string();
        self
    }

    pub(crate) fn with_mode(mut self, mode: ServerMode) -> Self {
        self.mode = mode;
        self
    }

    /// Connector that starts one server session per connection.
    pub(crate) fn connector(&self) -> MemoryConnector {
        let server = self.clone();
        MemoryConnector::new(move |transport| {
            if server.stats.refusing.load(Ordering::SeqCst) {
                return Err(Error::connect("mock server refusing connections"));
            }
            tokio::spawn(server.clone().serve(transport));
            Ok(())
        })
    }

    pub(crate) fn factory(&self) -> ConnectionFactory {
        ConnectionFactory::new(self.connector())
    }

    pub(crate) fn factory_with(&self, configure: impl FnOnce(&mut FactoryOptions)) -> ConnectionFactory {
        let mut options = FactoryOptions::default();
        configure(&mut options);
        ConnectionFactory::with_options(self.connector(), options)
    }

    // ========================================================================
    // Observations
    // ========================================================================

    pub(crate) fn live_sessions(&self) -> usize {
        self.stats.live_sessions.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions_opened(&self) -> usize {
        self.stats.sessions_opened.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_calls(&self) -> usize {
        self.stats.max_concurrent_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn tool_calls(&self) -> usize {
        self.stats.tool_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn saw_initialized(&self) -> bool {
        self.stats.initialized.load(Ordering::SeqCst)
    }

    /// Waits until exactly `expected` sessions are open. Panics after 2s.
    pub(crate) async fn wait_for_live_sessions(&self, expected: usize) {
        let reached = tokio::time::timeout(Duration::from_secs(2), async {
            while self.live_sessions() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        assert!(
            reached.is_ok(),
            "expected {expected} live sessions, have {}",
            self.live_sessions()
        );
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub(crate) fn set_refusing(&self, refusing: bool) {
        self.stats.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Drops every open session.
    pub(crate) fn disconnect_all(&self) {
        self.stats.disconnect.send_modify(|epoch| *epoch += 1);
    }

    // ========================================================================
    // Session
    // ========================================================================

    async fn serve(self, transport: Transport) {
        let _session = Session::open(&self.stats);
        let (mut writer, mut reader) = transport.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let mut disconnect = self.stats.disconnect.subscribe();

        loop {
            tokio::select! {
                frame = reader.recv() => match frame {
                    Some(Ok(text)) => {
                        if !self.handle(&text, &out_tx) {
                            break;
                        }
                    }
                    _ => break,
                },
                Some(frame) = out_rx.recv() => {
                    if writer.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = disconnect.changed() => break,
            }
        }
    }

    /// Handles one inbound frame. Returns `false` to drop the session.
    fn handle(&self, text: &str, out: &mpsc::UnboundedSender<String>) -> bool {
        let Ok(message) = serde_json::from_str::<Value>(text) else {
            return true;
        };
        if self.mode == ServerMode::Silent {
            return true;
        }

        let Some(name) = message.get("method").and_then(Value::as_str) else {
            return true;
        };
        let Some(id) = message.get("id").cloned() else {
            if name == method::INITIALIZED {
                self.stats.initialized.store(true, Ordering::SeqCst);
            }
            return true;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match name {
            method::INITIALIZE if self.mode == ServerMode::RejectInitialize => {
                reply_error(out, id, -32603, "initialization refused");
            }
            method::INITIALIZE => reply(
                out,
                id,
                json!({
                    "protocolVersion": self.protocol_version,
                    "capabilities": {
                        "tools": {"listChanged": true},
                        "prompts": {}
                    },
                    "serverInfo": {"name": "mock-server", "version": "1.0.0"},
                    "instructions": "Test server."
                }),
            ),
            method::PING => reply(out, id, json!({})),
            method::TOOLS_LIST => {
                let tools = self.tools();
                let start = params
                    .get("cursor")
                    .and_then(Value::as_str)
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0)
                    .min(tools.len());
                let end = (start + PAGE_SIZE).min(tools.len());

                let mut page = json!({ "tools": tools[start..end].to_vec() });
                if end < tools.len() {
                    page["nextCursor"] = json!(end.to_string());
                }
                reply(out, id, page);
            }
            method::PROMPTS_LIST => reply(
                out,
                id,
                json!({
                    "prompts": [{
                        "name": "summarize",
                        "description": "Summarize a text",
                        "arguments": [{"name": "text", "required": true}]
                    }]
                }),
            ),
            method::TOOLS_CALL => return self.call_tool(id, &params, out),
            _ => reply_error(out, id, -32601, "method not found"),
        }
        true
    }

    fn call_tool(&self, id: Value, params: &Value, out: &mpsc::UnboundedSender<String>) -> bool {
        self.stats.tool_calls.fetch_add(1, Ordering::SeqCst);

        let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let args = params.get("arguments").cloned().unwrap_or(Value::Null);

        match tool {
            "crash" => return false,
            "mutate" => {
                self.stats.extra_tool.store(true, Ordering::SeqCst);
                notify(out, method::TOOLS_LIST_CHANGED);
                reply(out, id, text_result("ok"));
                return true;
            }
            _ => {}
        }

        let stats = Arc::clone(&self.stats);
        let out = out.clone();
        let tool = tool.to_string();
        tokio::spawn(async move {
            let active = stats.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
            stats.max_concurrent_calls.fetch_max(active, Ordering::SeqCst);

            let outcome = run_tool(&tool, &args).await;

            stats.active_calls.fetch_sub(1, Ordering::SeqCst);
            match outcome {
                Ok(result) => reply(&out, id, result),
                Err((code, message)) => reply_error(&out, id, code, message),
            }
        });
        true
    }

    fn tools(&self) -> Vec<Value> {
        let mut tools = vec![
            tool(
                "add",
                json!({
                    "type": "object",
                    "properties": {
                        "a": {"type": "integer"},
                        "b": {"type": "integer"}
                    },
                    "required": ["a", "b"],
                    "additionalProperties": false
                }),
            ),
            tool(
                "echo",
                json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            ),
            tool(
                "sleep",
                json!({
                    "type": "object",
                    "properties": {"ms": {"type": "integer", "minimum": 0}},
                    "required": ["ms"]
                }),
            ),
            tool("fail", json!({"type": "object"})),
            tool("soft_fail", json!({"type": "object"})),
            tool("crash", json!({"type": "object"})),
            tool("mutate", json!({"type": "object"})),
            tool("noop", json!({"type": "object", "additionalProperties": false})),
        ];
        if self.stats.extra_tool.load(Ordering::SeqCst) {
            tools.push(tool("extra", json!({"type": "object"})));
        }
        tools
    }
}

async fn run_tool(tool: &str, args: &Value) -> Result<Value, (i64, &'static str)> {
    match tool {
        "add" => {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or_default();
            let b = args.get("b").and_then(Value::as_i64).unwrap_or_default();
            Ok(text_result(&(a + b).to_string()))
        }
        "echo" => Ok(text_result(
            args.get("text").and_then(Value::as_str).unwrap_or_default(),
        )),
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text_result(&ms.to_string()))
        }
        "fail" => Err((-32000, "tool exploded")),
        "soft_fail" => Ok(json!({
            "content": [{"type": "text", "text": "soft failure"}],
            "isError": true
        })),
        "noop" | "extra" => Ok(text_result("ok")),
        _ => Err((-32602, "unknown tool")),
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Counts a session as live until dropped.
struct Session(Arc<Stats>);

impl Session {
    fn open(stats: &Arc<Stats>) -> Self {
        stats.live_sessions.fetch_add(1, Ordering::SeqCst);
        stats.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(stats))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.0.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

fn tool(name: &str, input_schema: Value) -> Value {
    json!({
        "name": name,
        "description": format!("Mock tool {name}"),
        "inputSchema": input_schema
    })
}

fn text_result(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}]})
}

fn reply(out: &mpsc::UnboundedSender<String>, id: Value, result: Value) {
    let _ = out.send(json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string());
}

fn reply_error(out: &mpsc::UnboundedSender<String>, id: Value, code: i64, message: &str) {
    let _ = out.send(
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        })
        .to_string(),
    );
}

fn notify(out: &mpsc::UnboundedSender<String>, name: &str) {
    let _ = out.send(json!({"jsonrpc": "2.0", "method": name}).to_string());
}
