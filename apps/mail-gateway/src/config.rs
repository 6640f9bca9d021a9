use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use shell_bridge::{
    InfrastructureDescriptor, InfrastructureRegistry, PoolConfig, RegistryError, RetryPolicy,
};
use thiserror::Error;

pub const CONFIG_PATH_VAR: &str = "MAIL_GATEWAY_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "mail-gateway.toml";
const ENV_PREFIX: &str = "MAIL_GATEWAY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("pool.min_sessions ({min}) exceeds pool.max_sessions ({max})")]
    PoolBounds { min: usize, max: usize },
    #[error("pool.max_sessions must be at least 1")]
    EmptyPool,
    #[error("token_secret must be set")]
    MissingTokenSecret,
    #[error("invalid bind_addr '{0}'")]
    BindAddr(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub token_secret: String,
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_token_issuer")]
    pub token_issuer: String,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
    #[serde(default = "default_shell_program")]
    pub shell_program: String,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub command: CommandSettings,
    #[serde(default)]
    pub infrastructures: Vec<InfrastructureDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub min_sessions: usize,
    pub max_sessions: usize,
    pub acquire_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_session_age_secs: u64,
    pub max_idle_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            max_sessions: 4,
            acquire_timeout_ms: 30_000,
            connect_timeout_ms: 15_000,
            max_session_age_secs: 30 * 60,
            max_idle_secs: 10 * 60,
            reap_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            retry_attempts: 2,
            retry_delay_ms: 250,
        }
    }
}

impl AppConfig {
    /// `.env`, then the optional TOML file, then `MAIL_GATEWAY_*` variables
    /// (`MAIL_GATEWAY_POOL__MAX_SESSIONS=8`).
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        cfg.normalize().validated()
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        cfg.normalize().validated()
    }

    fn normalize(mut self) -> Self {
        self.log_path = self
            .log_path
            .take()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        self.token_secret = self.token_secret.trim().to_string();
        self
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.token_secret.is_empty() {
            return Err(ConfigError::MissingTokenSecret);
        }
        if self.pool.max_sessions == 0 {
            return Err(ConfigError::EmptyPool);
        }
        if self.pool.min_sessions > self.pool.max_sessions {
            return Err(ConfigError::PoolBounds {
                min: self.pool.min_sessions,
                max: self.pool.max_sessions,
            });
        }
        self.socket_addr()?;
        self.registry()?;
        Ok(self)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::BindAddr(self.bind_addr.clone()))
    }

    pub fn registry(&self) -> Result<InfrastructureRegistry, ConfigError> {
        Ok(InfrastructureRegistry::new(self.infrastructures.clone())?)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_sessions: self.pool.min_sessions,
            max_sessions: self.pool.max_sessions,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            max_session_age: Duration::from_secs(self.pool.max_session_age_secs),
            max_idle: Duration::from_secs(self.pool.max_idle_secs),
            reap_interval: Duration::from_secs(self.pool.reap_interval_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            default_timeout: Duration::from_millis(self.command.timeout_ms),
            default_retry_attempts: self.command.retry_attempts,
            retry_delay: Duration::from_millis(self.command.retry_delay_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.connect_timeout_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_filter() -> String {
    "info,mail_gateway=debug,shell_bridge=debug".to_string()
}

fn default_token_ttl_secs() -> u64 {
    8 * 60 * 60
}

fn default_token_issuer() -> String {
    "mail-gateway".to_string()
}

fn default_audit_capacity() -> usize {
    shell_bridge::audit::DEFAULT_AUDIT_CAPACITY
}

fn default_shell_program() -> String {
    "pwsh".to_string()
}
