use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::{CommandRequest, RemoteError, RemoteOutput, ShellTransport};
use crate::classify::SESSION_INVALID_SENTINEL;
use crate::error::InvokeError;
use crate::infra::{Credentials, InfrastructureDescriptor};

const AUTHENTICATE_COMMAND: &str = "__authenticate";
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Spawns a local shell running the infrastructure's bootstrap script and talks
/// newline-delimited JSON over its stdio.
pub struct LocalShellConnector {
    program: String,
    args: Vec<String>,
    ready_timeout: Duration,
}

#[derive(Serialize)]
struct Frame<'a> {
    id: u64,
    command: &'a str,
    parameters: &'a BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default)]
    errors: Vec<RemoteError>,
}

impl LocalShellConnector {
    pub fn new(program: impl Into<String>, ready_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: ["-NoLogo", "-NoProfile", "-NonInteractive", "-File"]
                .into_iter()
                .map(String::from)
                .collect(),
            ready_timeout,
        }
    }

    /// Replace the arguments placed between the program and the script path.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub async fn connect(
        &self,
        infrastructure: &InfrastructureDescriptor,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn ShellTransport>, InvokeError> {
        let script = infrastructure.bootstrap_script.as_ref().ok_or_else(|| {
            InvokeError::Unreachable(format!(
                "no bootstrap script configured for '{}'",
                infrastructure.id
            ))
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| InvokeError::Unreachable(format!("failed to spawn {}: {err}", self.program)))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(InvokeError::Unreachable("shell stdio unavailable".into()));
        };
        let mut transport = LocalShellTransport {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
        };

        match tokio::time::timeout(self.ready_timeout, transport.stdout.next_line()).await {
            Ok(Ok(Some(_banner))) => {}
            Ok(Ok(None)) => {
                return Err(InvokeError::Unreachable(
                    "shell exited before signalling readiness".into(),
                ))
            }
            Ok(Err(err)) => return Err(InvokeError::Unreachable(err.to_string())),
            Err(_) => {
                transport.close().await;
                return Err(InvokeError::Unreachable(format!(
                    "shell not ready within {}ms",
                    self.ready_timeout.as_millis()
                )));
            }
        }

        if let Some(credentials) = credentials {
            let mut parameters = BTreeMap::new();
            if let Some(domain) = &credentials.domain {
                parameters.insert("Domain".to_string(), Value::from(domain.as_str()));
            }
            parameters.insert("UserName".to_string(), Value::from(credentials.username.as_str()));
            parameters.insert("Password".to_string(), Value::from(credentials.password.as_str()));
            let request = CommandRequest {
                command: AUTHENTICATE_COMMAND.to_string(),
                parameters,
            };
            if let Err(err) = transport.invoke(&request).await?.into_result() {
                transport.close().await;
                return Err(InvokeError::Rejected {
                    message: format!("{SESSION_INVALID_SENTINEL}: local logon failed: {err}"),
                    category: Some("AuthenticationFailed".into()),
                });
            }
        }

        debug!(infrastructure = %infrastructure.id, program = %self.program, "local shell ready");
        Ok(Box::new(transport))
    }
}

pub struct LocalShellTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

#[async_trait]
impl ShellTransport for LocalShellTransport {
    async fn invoke(&mut self, request: &CommandRequest) -> Result<RemoteOutput, InvokeError> {
        self.next_id += 1;
        let id = self.next_id;
        let frame = Frame {
            id,
            command: &request.command,
            parameters: &request.parameters,
        };
        let mut line = serde_json::to_string(&frame)
            .map_err(|err| InvokeError::Dropped(format!("frame encode failed: {err}")))?;
        line.push('\n');

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| InvokeError::Dropped("shell input closed".into()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| InvokeError::Dropped(err.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|err| InvokeError::Dropped(err.to_string()))?;

        loop {
            let Some(raw) = self
                .stdout
                .next_line()
                .await
                .map_err(|err| InvokeError::Dropped(err.to_string()))?
            else {
                return Err(InvokeError::Dropped("shell exited mid-command".into()));
            };
            let reply: Reply = serde_json::from_str(&raw)
                .map_err(|err| InvokeError::Dropped(format!("unreadable shell reply: {err}")))?;
            if reply.id != id {
                warn!(expected = id, received = reply.id, "discarding out-of-order shell reply");
                continue;
            }
            return Ok(RemoteOutput {
                records: reply.records,
                errors: reply.errors,
            });
        }
    }

    async fn close(&mut self) {
        // closing stdin ends the bootstrap loop
        self.stdin.take();
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                if let Err(err) = self.child.kill().await {
                    warn!(error = %err, "failed to kill local shell");
                }
            }
        }
    }
}
