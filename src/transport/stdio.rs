//! Process-backed transport session.
//!
//! Spawns the tool-execution process with piped stdio and speaks
//! line-delimited JSON: one request object per line out, one response
//! object per line back. A drain task logs the child's stderr and downs
//! the liveness flag when the child goes away, so even an idle session's
//! death is visible to the supervisor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::{Liveness, ToolTransport, TransportFactory};
use crate::error::TransportError;

#[derive(Debug, Serialize)]
struct RequestFrame<'a> {
    id: u64,
    tool: &'a str,
    args: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ResponseFrame {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<ErrorFrame>,
}

#[derive(Debug, Deserialize)]
struct ErrorFrame {
    message: String,
}

fn encode_request(id: u64, tool: &str, args: &serde_json::Value) -> String {
    let mut line = serde_json::to_string(&RequestFrame { id, tool, args })
        .expect("request frame serializes");
    line.push('\n');
    line
}

fn parse_response(line: &str, expect_id: u64) -> Result<serde_json::Value, TransportError> {
    let frame: ResponseFrame =
        serde_json::from_str(line).map_err(|e| TransportError::Decode {
            reason: format!("unparsable response frame: {e}"),
        })?;
    if frame.id != expect_id {
        return Err(TransportError::Decode {
            reason: format!("response id {} does not match request {expect_id}", frame.id),
        });
    }
    if let Some(err) = frame.error {
        return Err(TransportError::Tool {
            message: err.message,
        });
    }
    frame.result.ok_or_else(|| TransportError::Decode {
        reason: "response frame carries neither result nor error".to_string(),
    })
}

/// Transport over a spawned tool-server process.
pub struct StdioTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    live: Liveness,
    next_id: u64,
}

impl StdioTransport {
    /// Spawn `command` with the given arguments and environment and wire
    /// up the session.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| TransportError::Closed {
            reason: format!("failed to spawn {command}: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::Closed {
            reason: "failed to capture child stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Closed {
            reason: "failed to capture child stdout".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| TransportError::Closed {
            reason: "failed to capture child stderr".to_string(),
        })?;

        let live = Liveness::up();
        let live_for_drain = live.clone();
        let name = command.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(command = %name, "tool process stderr: {}", line);
            }
            // stderr EOF means the process is gone (or closed its end).
            live_for_drain.down();
            tracing::debug!(command = %name, "tool process stderr closed");
        });

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            live,
            next_id: 0,
        })
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
    async fn invoke(
        &mut self,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        if !self.live.is_up() {
            return Err(TransportError::Closed {
                reason: "session is no longer live".to_string(),
            });
        }

        self.next_id += 1;
        let id = self.next_id;
        let line = encode_request(id, tool, args);

        if let Err(e) = self.stdin.write_all(line.as_bytes()).await {
            self.live.down();
            return Err(TransportError::Closed {
                reason: format!("write failed: {e}"),
            });
        }
        if let Err(e) = self.stdin.flush().await {
            self.live.down();
            return Err(TransportError::Closed {
                reason: format!("flush failed: {e}"),
            });
        }

        let mut response = String::new();
        match self.stdout.read_line(&mut response).await {
            Ok(0) => {
                self.live.down();
                Err(TransportError::Closed {
                    reason: "tool process closed stdout".to_string(),
                })
            }
            Ok(_) => parse_response(response.trim(), id),
            Err(e) => {
                self.live.down();
                Err(TransportError::Closed {
                    reason: format!("read failed: {e}"),
                })
            }
        }
    }

    fn liveness(&self) -> Liveness {
        self.live.clone()
    }

    async fn close(&mut self) {
        self.live.down();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("kill on close failed (already dead?): {}", e);
        }
        let _ = self.child.wait().await;
    }
}

/// Factory producing `StdioTransport` sessions for the pool.
#[derive(Debug, Clone)]
pub struct StdioTransportFactory {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl StdioTransportFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

#[async_trait]
impl TransportFactory for StdioTransportFactory {
    async fn connect(&self) -> Result<Box<dyn ToolTransport>, TransportError> {
        let transport = StdioTransport::spawn(&self.command, &self.args, &self.env).await?;
        Ok(Box::new(transport))
    }
}
