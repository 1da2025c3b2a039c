//! Stream multiplexer for interactive executions.
//!
//! Wires a running child's stdout/stderr to an outbound event channel and
//! feeds line-oriented input to its stdin. Chunks are forwarded in the order
//! the OS delivers them on each stream; no ordering is imposed between
//! stdout and stderr.
//!
//! The event channel is unbounded: a reader that stalls (or is busy
//! replacing the run) must never block the pumps, or the task waiting for
//! the child's teardown would wedge behind them.

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Which stream an output event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    System,
}

/// One chunk of output relayed to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEvent {
    #[serde(rename = "type")]
    pub stream: StreamKind,
    pub data: String,
}

impl OutputEvent {
    pub fn new(stream: StreamKind, data: impl Into<String>) -> Self {
        Self {
            stream,
            data: data.into(),
        }
    }

    pub fn system(data: impl Into<String>) -> Self {
        Self::new(StreamKind::System, data)
    }
}

/// Handles for the two output pump tasks
pub struct OutputPumps {
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl OutputPumps {
    /// Wait for both pumps to drain (they end at pipe EOF)
    pub async fn join(self) {
        if let Some(handle) = self.stdout {
            let _ = handle.await;
        }
        if let Some(handle) = self.stderr {
            let _ = handle.await;
        }
    }
}

/// Attach to a running child: spawn pump tasks for stdout/stderr and a
/// writer task feeding newline-terminated input lines to stdin.
///
/// Input arriving after the child exits makes the stdin write fail and is
/// silently dropped; the caller may race a final input against completion.
pub fn attach(
    child: &mut Child,
    events: mpsc::UnboundedSender<OutputEvent>,
    input_rx: mpsc::Receiver<String>,
) -> OutputPumps {
    let stdout = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(pump(pipe, StreamKind::Stdout, events.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(pump(pipe, StreamKind::Stderr, events)));

    if let Some(stdin) = child.stdin.take() {
        tokio::spawn(feed_stdin(stdin, input_rx));
    }

    OutputPumps { stdout, stderr }
}

/// Forward each chunk read from `reader` as one event
async fn pump(
    mut reader: impl AsyncRead + Unpin + Send + 'static,
    stream: StreamKind,
    events: mpsc::UnboundedSender<OutputEvent>,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                if events.send(OutputEvent::new(stream, data)).is_err() {
                    break;
                }
            }
        }
    }
}

/// Write each received input line, newline-terminated, to the child's stdin
async fn feed_stdin(mut stdin: ChildStdin, mut input_rx: mpsc::Receiver<String>) {
    while let Some(mut line) = input_rx.recv().await {
        line.push('\n');
        if stdin.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdin.flush().await;
    }
}
