//! Deadline-bounded command execution with retry on session-level faults.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, AuditStatus};
use crate::classify::classify_error;
use crate::error::BridgeError;
use crate::infra::InfrastructureRegistry;
use crate::pool::{PoolRegistry, SessionPool};
use crate::transport::{CommandRequest, RemoteOutput};

const MASKED: &str = "***";

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub default_timeout: Duration,
    pub default_retry_attempts: u32,
    /// Base delay; attempt `n` waits `n * retry_delay`, capped by the remaining deadline.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            default_retry_attempts: 2,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// One named command plus its bound parameters. Parameters are never spliced into the
/// command text.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDescriptor {
    pub command: String,
    pub parameters: BTreeMap<String, Value>,
    pub infrastructure: Option<String>,
    pub caller: Option<String>,
    pub timeout: Option<Duration>,
    pub retry_attempts: Option<u32>,
}

impl CommandDescriptor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameters: BTreeMap::new(),
            infrastructure: None,
            caller: None,
            timeout: None,
            retry_attempts: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Bind `value` only when present; absent optional arguments are simply not sent.
    pub fn param_opt(self, name: impl Into<String>, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    pub fn on(mut self, infrastructure: Option<impl Into<String>>) -> Self {
        self.infrastructure = infrastructure.map(Into::into);
        self
    }

    pub fn caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    /// Human-readable form for the audit trail, with credential-like values masked.
    pub fn audit_text(&self) -> String {
        let mut text = self.command.clone();
        for (name, value) in &self.parameters {
            let lowered = name.to_ascii_lowercase();
            if lowered.contains("password") || lowered.contains("secret") {
                let _ = write!(text, " -{name} {MASKED}");
                continue;
            }
            match value {
                Value::Bool(true) => {
                    let _ = write!(text, " -{name}");
                }
                Value::String(s) => {
                    let _ = write!(text, " -{name} '{}'", s.replace('\'', "''"));
                }
                other => {
                    let _ = write!(text, " -{name} {other}");
                }
            }
        }
        text
    }

    fn request(&self) -> CommandRequest {
        CommandRequest {
            command: self.command.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ExecutionResult {
    pub infrastructure_id: Option<String>,
    pub outcome: Result<Vec<Value>, BridgeError>,
    pub elapsed: Duration,
    pub attempts: u32,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn records(&self) -> Option<&[Value]> {
        self.outcome.as_deref().ok()
    }

    pub fn error(&self) -> Option<&BridgeError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<Vec<Value>, BridgeError> {
        self.outcome
    }
}

pub struct CommandExecutor {
    infrastructures: Arc<InfrastructureRegistry>,
    pools: Arc<PoolRegistry>,
    audit: Arc<AuditLog>,
    policy: RetryPolicy,
}

impl CommandExecutor {
    pub fn new(
        infrastructures: Arc<InfrastructureRegistry>,
        pools: Arc<PoolRegistry>,
        audit: Arc<AuditLog>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            infrastructures,
            pools,
            audit,
            policy,
        }
    }

    pub fn infrastructures(&self) -> &Arc<InfrastructureRegistry> {
        &self.infrastructures
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute(&self, descriptor: &CommandDescriptor) -> ExecutionResult {
        let started = Instant::now();
        let infrastructure = match self.infrastructures.resolve(descriptor.infrastructure.as_deref()) {
            Ok(infrastructure) => infrastructure,
            Err(err) => {
                return ExecutionResult {
                    infrastructure_id: None,
                    outcome: Err(err),
                    elapsed: started.elapsed(),
                    attempts: 0,
                }
            }
        };

        let timeout = descriptor.timeout.unwrap_or(self.policy.default_timeout);
        let retries = descriptor
            .retry_attempts
            .unwrap_or(self.policy.default_retry_attempts);
        let deadline = started + timeout;
        let pool = self.pools.pool(&infrastructure);
        let request = descriptor.request();
        let audit_text = descriptor.audit_text();

        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let token = self.audit.begin(
                &infrastructure.id,
                descriptor.caller.as_deref(),
                audit_text.clone(),
                attempt,
            );
            let attempt_started = Instant::now();
            let attempts_left = retries.saturating_add(2).saturating_sub(attempt).max(1);
            let result = self.attempt(&pool, &request, deadline, attempts_left).await;
            let took = attempt_started.elapsed();

            let err = match result {
                Ok(records) => {
                    self.audit.complete(token, AuditStatus::Completed, took, None);
                    debug!(
                        infrastructure = %infrastructure.id,
                        command = %descriptor.command,
                        attempt,
                        records = records.len(),
                        "command completed"
                    );
                    break Ok(records);
                }
                Err(err) => {
                    self.audit.complete(token, AuditStatus::Failed, took, Some(&err));
                    err
                }
            };

            if !err.is_retryable() || attempt > retries {
                warn!(
                    infrastructure = %infrastructure.id,
                    command = %descriptor.command,
                    attempt,
                    code = err.code(),
                    error = %err,
                    "command failed"
                );
                break Err(err);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    infrastructure = %infrastructure.id,
                    command = %descriptor.command,
                    attempt,
                    "deadline spent; not retrying"
                );
                break Err(err);
            }
            let backoff = self.policy.retry_delay.saturating_mul(attempt).min(remaining);
            info!(
                infrastructure = %infrastructure.id,
                command = %descriptor.command,
                attempt,
                code = err.code(),
                backoff_ms = backoff.as_millis() as u64,
                "retrying on a fresh session"
            );
            tokio::time::sleep(backoff).await;
        };

        ExecutionResult {
            infrastructure_id: Some(infrastructure.id.clone()),
            outcome,
            elapsed: started.elapsed(),
            attempts: attempt,
        }
    }

    /// One try on one session. The invoke timeout is an even share of what is left of the
    /// deadline across the attempts still allowed, so a hung command leaves room to retry.
    async fn attempt(
        &self,
        pool: &SessionPool,
        request: &CommandRequest,
        deadline: Instant,
        attempts_left: u32,
    ) -> Result<Vec<Value>, BridgeError> {
        let mut lease = pool.acquire(deadline).await?;
        let budget = deadline.saturating_duration_since(Instant::now()) / attempts_left;
        match lease
            .invoke(request, budget)
            .await
            .and_then(RemoteOutput::into_result)
        {
            Ok(records) => {
                lease.release(true);
                Ok(records)
            }
            Err(err) => {
                let class = classify_error(&err);
                lease.release(class.keeps_session());
                Err(BridgeError::from_invoke(class, err, pool.infrastructure_id()))
            }
        }
    }
}
