//! Remote shell transports.
//!
//! A [`ShellConnector`] performs the authentication handshake and yields one
//! [`ShellTransport`], which executes exactly one command at a time. Parameters always
//! travel as a structured map next to the command name so the remote side binds them;
//! nothing here concatenates values into command text.

mod http;
mod local;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InvokeError;
use crate::infra::{AuthMode, Credentials, InfrastructureDescriptor};

pub use http::{HttpConnector, HttpTransport};
pub use local::{LocalShellConnector, LocalShellTransport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Result stream of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteOutput {
    #[serde(default)]
    pub records: Vec<Value>,
    #[serde(default)]
    pub errors: Vec<RemoteError>,
}

impl RemoteOutput {
    pub fn records(records: Vec<Value>) -> Self {
        Self {
            records,
            errors: Vec::new(),
        }
    }

    /// A non-empty error stream turns the whole invocation into a rejection.
    pub fn into_result(self) -> Result<Vec<Value>, InvokeError> {
        if self.errors.is_empty() {
            return Ok(self.records);
        }
        let category = self.errors.iter().find_map(|e| e.category.clone());
        let message = self
            .errors
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("\n");
        Err(InvokeError::Rejected { message, category })
    }
}

#[async_trait]
pub trait ShellTransport: Send {
    async fn invoke(&mut self, request: &CommandRequest) -> Result<RemoteOutput, InvokeError>;

    /// Best-effort teardown; errors are logged by the implementation.
    async fn close(&mut self);
}

#[async_trait]
pub trait ShellConnector: Send + Sync {
    /// Open an authenticated transport. `credentials` overrides the descriptor's service
    /// account, which is how interactive logins are verified.
    async fn connect(
        &self,
        infrastructure: &InfrastructureDescriptor,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn ShellTransport>, InvokeError>;
}

/// Picks the HTTP remoting or local shell transport from the descriptor's auth mode.
pub struct DefaultConnector {
    http: HttpConnector,
    local: LocalShellConnector,
}

impl DefaultConnector {
    pub fn new(shell_program: impl Into<String>, connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: HttpConnector::new(connect_timeout)?,
            local: LocalShellConnector::new(shell_program, connect_timeout),
        })
    }
}

#[async_trait]
impl ShellConnector for DefaultConnector {
    async fn connect(
        &self,
        infrastructure: &InfrastructureDescriptor,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn ShellTransport>, InvokeError> {
        match infrastructure.auth {
            AuthMode::Basic | AuthMode::Kerberos => {
                self.http.connect(infrastructure, credentials).await
            }
            AuthMode::LocalShell => self.local.connect(infrastructure, credentials).await,
        }
    }
}
