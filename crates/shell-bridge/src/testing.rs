//! Scripted in-memory connector for exercising pools and executors without a remote shell.
//!
//! Replies are consumed in FIFO order across every transport the connector hands out; once
//! the script runs dry each invocation echoes the command name back as a single record.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::classify::SESSION_INVALID_SENTINEL;
use crate::error::InvokeError;
use crate::infra::{Credentials, InfrastructureDescriptor};
use crate::transport::{CommandRequest, RemoteOutput, ShellConnector, ShellTransport};

#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

#[derive(Default)]
struct Script {
    replies: Mutex<VecDeque<Result<RemoteOutput, InvokeError>>>,
    connect_failures: Mutex<VecDeque<InvokeError>>,
    accepted_password: Mutex<Option<String>>,
    invoke_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    next_transport: AtomicU64,
    connects: AtomicUsize,
    live: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    invocations: Mutex<Vec<(u64, CommandRequest)>>,
    closed: Mutex<Vec<u64>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: Result<RemoteOutput, InvokeError>) -> &Self {
        self.script.replies.lock().push_back(reply);
        self
    }

    pub fn push_records(&self, records: Vec<Value>) -> &Self {
        self.push_reply(Ok(RemoteOutput::records(records)))
    }

    pub fn push_failure(&self, err: InvokeError) -> &Self {
        self.push_reply(Err(err))
    }

    pub fn fail_next_connect(&self, err: InvokeError) -> &Self {
        self.script.connect_failures.lock().push_back(err);
        self
    }

    /// Explicit credentials must carry this password or the handshake is rejected.
    pub fn require_password(&self, password: impl Into<String>) -> &Self {
        *self.script.accepted_password.lock() = Some(password.into());
        self
    }

    pub fn set_invoke_delay(&self, delay: Duration) -> &Self {
        *self.script.invoke_delay.lock() = delay;
        self
    }

    pub fn set_connect_delay(&self, delay: Duration) -> &Self {
        *self.script.connect_delay.lock() = delay;
        self
    }

    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    /// Transports connected and not yet dropped.
    pub fn live_transports(&self) -> usize {
        self.script.live.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.script.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn invocation_count(&self) -> usize {
        self.script.invocations.lock().len()
    }

    /// Transport id that served each invocation, in call order.
    pub fn invoked_transports(&self) -> Vec<u64> {
        self.script.invocations.lock().iter().map(|(id, _)| *id).collect()
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.script
            .invocations
            .lock()
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn closed_transports(&self) -> Vec<u64> {
        self.script.closed.lock().clone()
    }
}

#[async_trait]
impl ShellConnector for ScriptedConnector {
    async fn connect(
        &self,
        _infrastructure: &InfrastructureDescriptor,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn ShellTransport>, InvokeError> {
        let delay = *self.script.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.script.connect_failures.lock().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        let expected = self.script.accepted_password.lock().clone();
        if let (Some(expected), Some(credentials)) = (expected, credentials) {
            if credentials.password != expected {
                return Err(InvokeError::Rejected {
                    message: format!("{SESSION_INVALID_SENTINEL}: logon failure for {}", credentials.principal()),
                    category: Some("AuthenticationFailed".into()),
                });
            }
        }

        let id = self.script.next_transport.fetch_add(1, Ordering::SeqCst);
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        self.script.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedTransport {
            id,
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedTransport {
    id: u64,
    script: Arc<Script>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShellTransport for ScriptedTransport {
    async fn invoke(&mut self, request: &CommandRequest) -> Result<RemoteOutput, InvokeError> {
        let current = self.script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.script.in_flight);
        self.script.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        self.script.invocations.lock().push((self.id, request.clone()));

        let delay = *self.script.invoke_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = self.script.replies.lock().pop_front();
        reply.unwrap_or_else(|| Ok(RemoteOutput::records(vec![json!({ "command": request.command })])))
    }

    async fn close(&mut self) {
        self.script.closed.lock().push(self.id);
    }
}

impl Drop for ScriptedTransport {
    fn drop(&mut self) {
        self.script.live.fetch_sub(1, Ordering::SeqCst);
    }
}
