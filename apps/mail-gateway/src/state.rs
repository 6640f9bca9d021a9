use std::sync::Arc;

use serde_json::Value;
use shell_bridge::{
    AuditLog, BridgeError, CommandDescriptor, CommandExecutor, InfrastructureRegistry, PoolRegistry,
    ShellConnector,
};
use tracing::info;

use crate::auth::{Claims, CredentialVerifier, ShellCredentialVerifier, TokenIssuer};
use crate::config::{AppConfig, ConfigError};
use crate::metrics;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

struct StateInner {
    executor: CommandExecutor,
    tokens: TokenIssuer,
    verifier: Arc<dyn CredentialVerifier>,
}

impl AppState {
    /// Logins are verified with a handshake through the same connector the pools use.
    pub fn new(cfg: &AppConfig, connector: Arc<dyn ShellConnector>) -> Result<Self, ConfigError> {
        let verifier = Arc::new(ShellCredentialVerifier::new(
            Arc::clone(&connector),
            cfg.connect_timeout(),
        ));
        Self::with_verifier(cfg, connector, verifier)
    }

    pub fn with_verifier(
        cfg: &AppConfig,
        connector: Arc<dyn ShellConnector>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Result<Self, ConfigError> {
        let infrastructures = Arc::new(cfg.registry()?);
        let pools = Arc::new(PoolRegistry::new(connector, cfg.pool_config()));
        let audit = Arc::new(AuditLog::new(cfg.audit_capacity));
        let executor = CommandExecutor::new(infrastructures, pools, audit, cfg.retry_policy());
        Ok(Self {
            inner: Arc::new(StateInner {
                executor,
                tokens: TokenIssuer::new(&cfg.token_secret, cfg.token_issuer.clone(), cfg.token_ttl()),
                verifier,
            }),
        })
    }

    pub fn infrastructures(&self) -> &InfrastructureRegistry {
        self.inner.executor.infrastructures()
    }

    pub fn pools(&self) -> &PoolRegistry {
        self.inner.executor.pools()
    }

    pub fn audit(&self) -> &AuditLog {
        self.inner.executor.audit()
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.inner.tokens
    }

    pub fn verifier(&self) -> &dyn CredentialVerifier {
        self.inner.verifier.as_ref()
    }

    /// Run a command as the token's principal, on the infrastructure the token is pinned to.
    pub async fn execute(
        &self,
        claims: &Claims,
        descriptor: CommandDescriptor,
    ) -> Result<Vec<Value>, BridgeError> {
        let descriptor = descriptor
            .caller(claims.sub.clone())
            .on(Some(claims.infrastructure.clone()));
        let result = self.inner.executor.execute(&descriptor).await;
        metrics::record_execution(&result);
        result.into_result()
    }

    pub async fn shutdown(&self) {
        info!("closing pooled sessions");
        self.pools().shutdown().await;
    }
}
