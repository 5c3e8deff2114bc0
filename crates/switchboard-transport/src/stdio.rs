//! Child-process transport: newline-delimited JSON over stdin/stdout.
//!
//! The server runs as a child of this process. Frames go down its stdin and
//! come back on its stdout, one JSON envelope per line; stderr is piped
//! into tracing at debug level. A dead child surfaces as end-of-stream on
//! `receive`, and the supervising connection decides whether to restart.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::traits::{Transport, TransportKind, TransportState};

/// Largest frame a server may emit on one line.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;
/// Inbound frame buffer; a full buffer suspends the reader task.
const RECEIVE_BUFFER: usize = 256;

type StdinWriter = FramedWrite<ChildStdin, LinesCodec>;

/// Newline-delimited JSON over a spawned child process.
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    shutdown_grace: Duration,
    state: Arc<Mutex<TransportState>>,
    child: TokioMutex<Option<Child>>,
    writer: TokioMutex<Option<StdinWriter>>,
    receiver: TokioMutex<Option<mpsc::Receiver<String>>>,
    reader_task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
    stderr_task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioTransport {
    /// Transport that will spawn `command args…` on connect.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            shutdown_grace: Duration::from_secs(2),
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            child: TokioMutex::new(None),
            writer: TokioMutex::new(None),
            receiver: TokioMutex::new(None),
            reader_task: TokioMutex::new(None),
            stderr_task: TokioMutex::new(None),
        }
    }

    /// Override the terminate-to-kill grace window.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn endpoint(&self) -> String {
        format!("stdio://{}", self.command)
    }

    fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    async fn connect(&self) -> TransportResult<()> {
        if matches!(self.state(), TransportState::Connected) {
            return Ok(());
        }
        self.set_state(TransportState::Connecting);

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let error = TransportError::ConnectionFailed(format!(
                    "failed to spawn '{}': {e}",
                    self.command
                ));
                self.set_state(TransportState::Failed { reason: error.to_string() });
                error
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stdin was not piped".to_owned())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionFailed("child stdout was not piped".to_owned())
        })?;
        let stderr = child.stderr.take();

        *self.writer.lock().await =
            Some(FramedWrite::new(stdin, LinesCodec::new_with_max_length(MAX_LINE_BYTES)));

        let (tx, rx) = mpsc::channel(RECEIVE_BUFFER);
        *self.receiver.lock().await = Some(rx);

        let command = self.command.clone();
        let state = self.state.clone();
        let mut reader =
            FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let reader_task = tokio::spawn(async move {
            while let Some(result) = reader.next().await {
                match result {
                    Ok(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        // Suspends when the connection is slow to drain.
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(command = %command, error = %e, "stdio read error");
                        *state.lock() =
                            TransportState::Failed { reason: e.to_string() };
                        break;
                    }
                }
            }
            let mut state = state.lock();
            if matches!(*state, TransportState::Connected | TransportState::Connecting) {
                *state = TransportState::Failed { reason: "stream ended".to_owned() };
            }
            drop(state);
            debug!(command = %command, "stdio reader finished");
        });
        *self.reader_task.lock().await = Some(reader_task);

        if let Some(stderr) = stderr {
            let command = self.command.clone();
            let stderr_task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command, "stderr: {line}");
                }
            });
            *self.stderr_task.lock().await = Some(stderr_task);
        }

        *self.child.lock().await = Some(child);
        self.set_state(TransportState::Connected);
        debug!(command = %self.command, "stdio transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if matches!(self.state(), TransportState::Disconnected) {
            return Ok(());
        }

        // Dropping stdin is the terminate signal: a well-behaved server
        // exits on EOF. The hard kill follows after the grace window.
        *self.writer.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(command = %self.command, %status, "stdio child exited");
                }
                Ok(Err(e)) => warn!(command = %self.command, error = %e, "wait failed"),
                Err(_) => {
                    warn!(command = %self.command, "grace window elapsed, killing child");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.lock().await.take() {
            task.abort();
        }
        *self.receiver.lock().await = None;
        self.set_state(TransportState::Disconnected);
        Ok(())
    }

    async fn send(&self, frame: String) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::NotConnected)?;
        writer
            .send(frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        SinkExt::<String>::flush(writer)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(&self) -> TransportResult<Option<String>> {
        let mut receiver = self.receiver.lock().await;
        let receiver = receiver.as_mut().ok_or(TransportError::NotConnected)?;
        Ok(receiver.recv().await)
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.command)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // `cat` echoes stdin to stdout line by line, which makes it a perfect
    // loopback MCP stand-in for framing tests.
    #[tokio::test]
    async fn frames_round_trip_through_a_child_process() {
        let transport = StdioTransport::new("cat", vec![]);
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Connected);

        let frame = r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_owned();
        transport.send(frame.clone()).await.unwrap();
        let echoed = transport.receive().await.unwrap();
        assert_eq!(echoed, Some(frame));

        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn child_exit_surfaces_as_end_of_stream() {
        let transport = StdioTransport::new("true", vec![]);
        transport.connect().await.unwrap();
        // `true` exits immediately without output.
        let received = transport.receive().await.unwrap();
        assert_eq!(received, None);
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_reports_and_marks_failed() {
        let transport = StdioTransport::new("/nonexistent/definitely-not-a-binary", vec![]);
        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(matches!(transport.state(), TransportState::Failed { .. }));
    }

    #[tokio::test]
    async fn send_without_connect_is_rejected() {
        let transport = StdioTransport::new("cat", vec![]);
        let result = transport.send("{}".to_owned()).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }
}
