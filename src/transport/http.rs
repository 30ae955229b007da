//! Streamable HTTP client transport.
//!
//! Every outgoing message is POSTed to the endpoint URL. The reply is
//! either one JSON message (`application/json`) or an event stream whose
//! `data:` events each carry one message (`text/event-stream`). The
//! `Mcp-Session-Id` the server assigns on `initialize` is sent with every
//! later request, and closing the transport ends the session with `DELETE`.
//!
//! Requests are posted concurrently so pipelined calls overlap.
//! Notifications and replies are posted in order before the next frame is
//! taken, which keeps `notifications/initialized` ahead of the first
//! listing.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace};
use url::{Host, Url};

use crate::error::{Error, Result};

use super::{FrameReader, FrameWriter, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Session header assigned by the server.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Content types the client accepts.
const ACCEPT_REPLIES: &str = "application/json, text/event-stream";

/// Event stream content type.
const EVENT_STREAM: &str = "text/event-stream";

/// Bound on the session `DELETE` sent on close.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Types
// ============================================================================

type FrameSender = mpsc::UnboundedSender<Result<String>>;

// ============================================================================
// Connect
// ============================================================================

/// Creates an HTTP transport for `url`.
///
/// Nothing is sent until the first frame; connection failures surface as
/// transport errors on that frame.
///
/// # Errors
///
/// Returns [`Error::Connect`] if the HTTP client cannot be built.
pub fn connect(url: &Url) -> Result<Transport> {
    let mut builder = Client::builder().user_agent(USER_AGENT);
    if is_loopback(url) {
        builder = builder.no_proxy();
    }
    let client = builder
        .build()
        .map_err(|e| Error::connect(format!("HTTP client for {url} failed: {e}")))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = HttpWriter {
        client,
        url: url.clone(),
        session: Arc::new(Mutex::new(None)),
        tx,
        posts: JoinSet::new(),
    };

    debug!(%url, "HTTP transport ready");
    Ok(Transport::new(writer, HttpReader { rx }))
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        Some(Host::Domain(name)) => name.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

// ============================================================================
// Writer
// ============================================================================

struct HttpWriter {
    client: Client,
    url: Url,
    session: Arc<Mutex<Option<String>>>,
    tx: FrameSender,
    /// In-flight request POSTs. Dropping the writer aborts them.
    posts: JoinSet<()>,
}

impl HttpWriter {
    fn post(&self, frame: String) -> RequestBuilder {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(ACCEPT, ACCEPT_REPLIES)
            .header(CONTENT_TYPE, "application/json")
            .body(frame);

        if let Some(session) = self.session.lock().clone() {
            request = request.header(SESSION_HEADER, session);
        }
        request
    }
}

#[async_trait]
impl FrameWriter for HttpWriter {
    async fn send(&mut self, frame: String) -> Result<()> {
        while self.posts.try_join_next().is_some() {}

        let is_request = serde_json::from_str::<Value>(&frame)
            .map(|message| message.get("id").is_some() && message.get("method").is_some())
            .unwrap_or(false);
        let request = self.post(frame);

        if is_request {
            let session = Arc::clone(&self.session);
            let tx = self.tx.clone();
            self.posts.spawn(async move {
                if let Err(e) = exchange(request, &session, &tx).await {
                    let _ = tx.send(Err(e));
                }
            });
            return Ok(());
        }

        exchange(request, &self.session, &self.tx).await
    }

    async fn close(&mut self) -> Result<()> {
        self.posts.abort_all();

        let session = self.session.lock().take();
        let Some(session) = session else {
            return Ok(());
        };

        let response = self
            .client
            .delete(self.url.clone())
            .header(SESSION_HEADER, session)
            .timeout(CLOSE_TIMEOUT)
            .send()
            .await?;
        debug!(url = %self.url, status = %response.status(), "HTTP session terminated");
        Ok(())
    }
}

/// Sends one POST and forwards every message in its reply.
async fn exchange(
    request: RequestBuilder,
    session: &Mutex<Option<String>>,
    tx: &FrameSender,
) -> Result<()> {
    let response = request.send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::connection_lost(format!(
            "server answered HTTP {status}: {}",
            body.trim()
        )));
    }

    if let Some(id) = header(&response, SESSION_HEADER) {
        *session.lock() = Some(id);
    }

    let content_type = header(&response, CONTENT_TYPE.as_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with(EVENT_STREAM) {
        let mut events = EventStreamDecoder::default();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            for data in events.feed(&chunk?) {
                if tx.send(Ok(data)).is_err() {
                    return Ok(());
                }
            }
        }
        if let Some(data) = events.finish() {
            let _ = tx.send(Ok(data));
        }
    } else {
        let body = response.text().await?;
        if body.trim().is_empty() {
            trace!(%status, "Empty HTTP reply");
        } else {
            let _ = tx.send(Ok(body));
        }
    }

    Ok(())
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

// ============================================================================
// Reader
// ============================================================================

struct HttpReader {
    rx: mpsc::UnboundedReceiver<Result<String>>,
}

#[async_trait]
impl FrameReader for HttpReader {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

// ============================================================================
// EventStreamDecoder
// ============================================================================

/// Incremental `text/event-stream` parser yielding each event's data.
///
/// Fields other than `data` and comment lines are ignored. Events without
/// data are skipped.
#[derive(Debug, Default)]
struct EventStreamDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl EventStreamDecoder {
    /// Consumes a chunk and returns the events it completed.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing event not followed by a blank line.
    fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            if let Some(event) = self.line(line.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }

    fn dispatch(&mut self) -> Option<String> {
        let data = self.data.join("\n");
        self.data.clear();
        (!data.trim().is_empty()).then_some(data)
    }
}

// ============================================================================
// Tests
// ============================================================================
