//! WebSocket client transport.
//!
//! One JSON-RPC message per text frame. Binary, ping and pong frames are
//! skipped; a close frame ends the stream.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

use super::{FrameReader, FrameWriter, Transport};

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Connect
// ============================================================================

/// Connects to a WebSocket MCP server.
///
/// # Errors
///
/// Returns [`Error::Connect`] if the connection or upgrade fails.
pub async fn connect(url: &Url) -> Result<Transport> {
    let (stream, response) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::connect(format!("WebSocket connect to {url} failed: {e}")))?;

    debug!(%url, status = %response.status(), "WebSocket connected");

    let (sink, stream) = stream.split();
    Ok(Transport::new(WsWriter { sink }, WsReader { stream }))
}

// ============================================================================
// Halves
// ============================================================================

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.sink.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsReader {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(e.into())),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn test_text_frames_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(tcp).await.expect("upgrade");
            ws.send(Message::Ping(Vec::new().into())).await.expect("ping");
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    ws.send(Message::Text(text)).await.expect("echo");
                }
            }
        });

        let url = Url::parse(&format!("ws://{addr}")).expect("url");
        let (mut writer, mut reader) = connect(&url).await.expect("connect").split();

        writer.send(r#"{"jsonrpc":"2.0"}"#.into()).await.expect("send");
        assert_eq!(
            reader.recv().await.expect("frame").expect("ok"),
            r#"{"jsonrpc":"2.0"}"#
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}")).expect("url");
        assert!(matches!(connect(&url).await, Err(Error::Connect { .. })));
    }
}
