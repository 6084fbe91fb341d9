//! Byte pipes to the engine
//!
//! A transport splits into a [`LineSink`] (commands out) and a
//! [`LineSource`] (responses in) so the adapter can read on a dedicated task
//! while its worker writes. [`ProcessTransport`] talks to a child process
//! over stdin/stdout; [`ChannelTransport`] is an in-memory pair used for
//! embedded engines and tests.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Write half: one command per line.
#[async_trait]
pub trait LineSink: Send {
    async fn send_line(&mut self, line: &str) -> io::Result<()>;

    /// Release the pipe. Later sends fail.
    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read half. `Ok(None)` means the engine closed its output.
///
/// `next_line` must be cancellation safe.
#[async_trait]
pub trait LineSource: Send {
    async fn next_line(&mut self) -> io::Result<Option<String>>;
}

/// A connection to an engine, consumed when the adapter starts its worker.
pub trait EngineTransport: Send {
    fn split(self: Box<Self>) -> (Box<dyn LineSink>, Box<dyn LineSource>);
}

// ── Child process ────────────────────────────────────────────────────

/// Engine running as a child process.
pub struct ProcessTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ProcessTransport {
    /// Spawn `program` with piped stdin/stdout. Must run inside a Tokio
    /// runtime. The child is killed if the transport is dropped.
    pub fn spawn(program: &str, args: &[String]) -> io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "child stdout unavailable"))?;

        debug!(program, pid = child.id(), "Engine process spawned");
        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }
}

impl EngineTransport for ProcessTransport {
    fn split(self: Box<Self>) -> (Box<dyn LineSink>, Box<dyn LineSource>) {
        let sink = ProcessSink {
            child: self.child,
            stdin: Some(self.stdin),
        };
        let source = ProcessSource {
            lines: BufReader::new(self.stdout).lines(),
        };
        (Box::new(sink), Box::new(source))
    }
}

struct ProcessSink {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl LineSink for ProcessSink {
    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "engine stdin closed"))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        // Dropping stdin delivers EOF; give the engine a moment to exit on
        // its own before killing it.
        self.stdin.take();
        match tokio::time::timeout(std::time::Duration::from_millis(500), self.child.wait()).await
        {
            Ok(status) => {
                debug!(?status, "Engine process exited");
                Ok(())
            }
            Err(_) => {
                warn!("Engine process did not exit, killing");
                self.child.kill().await
            }
        }
    }
}

struct ProcessSource {
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl LineSource for ProcessSource {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }
}

// ── In-memory ────────────────────────────────────────────────────────

/// Adapter side of an in-memory engine connection.
pub struct ChannelTransport {
    commands: mpsc::UnboundedSender<String>,
    responses: mpsc::UnboundedReceiver<String>,
}

/// Engine side of an in-memory connection.
pub struct EngineEndpoint {
    /// Lines written by the adapter.
    pub commands: mpsc::UnboundedReceiver<String>,
    /// Lines delivered to the adapter. Dropping it closes the engine output.
    pub responses: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, EngineEndpoint) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        (
            Self {
                commands: cmd_tx,
                responses: resp_rx,
            },
            EngineEndpoint {
                commands: cmd_rx,
                responses: resp_tx,
            },
        )
    }
}

impl EngineEndpoint {
    /// Deliver one line to the adapter. False once the adapter is gone.
    pub fn reply(&self, line: impl Into<String>) -> bool {
        self.responses.send(line.into()).is_ok()
    }
}

impl EngineTransport for ChannelTransport {
    fn split(self: Box<Self>) -> (Box<dyn LineSink>, Box<dyn LineSource>) {
        (
            Box::new(ChannelSink {
                commands: Some(self.commands),
            }),
            Box::new(ChannelSource {
                responses: self.responses,
            }),
        )
    }
}

struct ChannelSink {
    commands: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl LineSink for ChannelSink {
    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "engine channel closed");
        self.commands
            .as_ref()
            .ok_or_else(closed)?
            .send(line.to_string())
            .map_err(|_| closed())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.commands.take();
        Ok(())
    }
}

struct ChannelSource {
    responses: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl LineSource for ChannelSource {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        Ok(self.responses.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_round_trip() {
        let (transport, mut engine) = ChannelTransport::pair();
        let (mut sink, mut source) = Box::new(transport).split();

        sink.send_line("init").await.unwrap();
        assert_eq!(engine.commands.recv().await.as_deref(), Some("init"));

        assert!(engine.reply("readyok"));
        assert_eq!(source.next_line().await.unwrap().as_deref(), Some("readyok"));

        drop(engine);
        assert_eq!(source.next_line().await.unwrap(), None);
        assert!(sink.send_line("stop").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_writes() {
        let (transport, _engine) = ChannelTransport::pair();
        let (mut sink, _source) = Box::new(transport).split();
        sink.close().await.unwrap();
        let err = sink.send_line("go depth 1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let result = ProcessTransport::spawn("definitely-not-a-chess-engine-binary", &[]);
        assert!(result.is_err());
    }
}
