//! Bridge between HTTP callers and long-lived remote management-shell sessions.
//!
//! The crate owns the expensive part of talking to a mail server's administrative shell:
//! authenticated sessions are pooled per target infrastructure, commands are executed with
//! deadlines and bounded retries, and every failure is classified into a small closed
//! taxonomy that callers map to their own transport (see [`BridgeError`]).

pub mod audit;
pub mod classify;
pub mod error;
pub mod executor;
pub mod infra;
pub mod pool;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use audit::{AuditEntry, AuditLog, AuditStatus, AuditToken};
pub use classify::{carries_session_invalid_marker, classify, SESSION_INVALID_SENTINEL};
pub use error::{BridgeError, FailureClass, InvokeError, RegistryError};
pub use executor::{CommandDescriptor, CommandExecutor, ExecutionResult, RetryPolicy};
pub use infra::{
    AuthMode, Credentials, InfrastructureDescriptor, InfrastructureRegistry, InfrastructureSummary,
};
pub use pool::{PoolConfig, PoolRegistry, PoolStats, SessionLease, SessionPool};
pub use session::{Session, SessionState};
pub use transport::{
    CommandRequest, DefaultConnector, RemoteError, RemoteOutput, ShellConnector, ShellTransport,
};
