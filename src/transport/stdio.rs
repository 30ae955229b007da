//! Child process transport.
//!
//! Frames are newline-delimited JSON on the child's stdin and stdout.
//! The child's stderr is forwarded to `tracing` at debug level. The child
//! is killed when the transport is dropped.

// ============================================================================
// Imports
// ============================================================================

use std::process::Stdio;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::{FrameReader, FrameWriter, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Buffered stdout lines before the reader task applies backpressure.
const LINE_BUFFER: usize = 64;

// ============================================================================
// Spawn
// ============================================================================

/// Spawns `command` and wraps its stdio as a transport.
///
/// # Errors
///
/// Returns [`Error::Connect`] if the process cannot be spawned.
pub fn spawn(command: &str, args: &[String], env: &FxHashMap<String, String>) -> Result<Transport> {
    let mut child = Command::new(command)
        .args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::connect(format!("failed to spawn '{command}': {e}")))?;

    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::connect("child stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::connect("child stdout not captured"))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(?pid, line = %line, "Server stderr");
            }
        });
    }

    let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if line_tx.send(Ok(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = line_tx.send(Err(Error::Io(e))).await;
                    break;
                }
            }
        }
        trace!(?pid, "Stdout reader finished");
    });

    debug!(?pid, command, "Spawned stdio server");

    Ok(Transport::new(
        ChildWriter { stdin, child },
        LineReader { rx: line_rx },
    ))
}

// ============================================================================
// Halves
// ============================================================================

/// Writes frames to the child's stdin. Owns the child process.
struct ChildWriter {
    stdin: ChildStdin,
    child: Child,
}

#[async_trait]
impl FrameWriter for ChildWriter {
    async fn send(&mut self, frame: String) -> Result<()> {
        self.stdin.write_all(frame.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.stdin.shutdown().await;
        self.child.start_kill()?;
        Ok(())
    }
}

/// Reads lines forwarded by the stdout task.
struct LineReader {
    rx: mpsc::Receiver<Result<String>>,
}

#[async_trait]
impl FrameReader for LineReader {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }
}

// ============================================================================
// Tests
// ============================================================================
