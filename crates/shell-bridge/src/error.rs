use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Outcome class of a failed remote invocation. Drives both the retry decision and the
/// status a caller reports upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    SessionInvalid,
    TransportBroken,
    CommandError,
    InfrastructureUnreachable,
}

impl FailureClass {
    /// Only session-level faults are worth another attempt on a fresh session.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::SessionInvalid | FailureClass::TransportBroken)
    }

    /// Whether the session that produced this failure can go back to the idle set.
    pub fn keeps_session(self) -> bool {
        matches!(self, FailureClass::CommandError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::SessionInvalid => "session_invalid",
            FailureClass::TransportBroken => "transport_broken",
            FailureClass::CommandError => "command_error",
            FailureClass::InfrastructureUnreachable => "infrastructure_unreachable",
        }
    }
}

/// Raw failure reported by a transport, before classification.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// Connection refused, reset or timed out before anything was submitted.
    #[error("remote endpoint unreachable: {0}")]
    Unreachable(String),
    /// Read/write fault on an established connection.
    #[error("connection dropped: {0}")]
    Dropped(String),
    #[error("command did not complete within {}ms", .0.as_millis())]
    TimedOut(Duration),
    /// The remote side executed the request and reported an error stream.
    #[error("{message}")]
    Rejected {
        message: String,
        category: Option<String>,
    },
}

impl InvokeError {
    /// Text the remote side produced alongside the failure, if any.
    pub fn raw_output(&self) -> &str {
        match self {
            InvokeError::Rejected { message, .. } => message,
            _ => "",
        }
    }
}

/// Error taxonomy surfaced by the bridge to its callers.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("unknown infrastructure '{0}'")]
    UnknownInfrastructure(String),
    #[error("remote session is no longer valid: {message}")]
    SessionInvalid { message: String },
    #[error("transport failed mid-command: {message}")]
    TransportBroken { message: String },
    #[error("infrastructure '{infrastructure}' is unreachable: {message}")]
    InfrastructureUnreachable {
        infrastructure: String,
        message: String,
    },
    #[error("{message}")]
    CommandError {
        message: String,
        category: Option<String>,
    },
    #[error("no session for '{infrastructure}' became available within {waited_ms}ms")]
    PoolExhausted {
        infrastructure: String,
        waited_ms: u64,
    },
}

impl BridgeError {
    pub fn from_invoke(class: FailureClass, err: InvokeError, infrastructure: &str) -> Self {
        let message = err.to_string();
        match class {
            FailureClass::SessionInvalid => BridgeError::SessionInvalid { message },
            FailureClass::TransportBroken => BridgeError::TransportBroken { message },
            FailureClass::InfrastructureUnreachable => BridgeError::InfrastructureUnreachable {
                infrastructure: infrastructure.to_string(),
                message,
            },
            FailureClass::CommandError => {
                let category = match err {
                    InvokeError::Rejected { category, .. } => category,
                    _ => None,
                };
                BridgeError::CommandError { message, category }
            }
        }
    }

    pub fn class(&self) -> Option<FailureClass> {
        match self {
            BridgeError::SessionInvalid { .. } => Some(FailureClass::SessionInvalid),
            BridgeError::TransportBroken { .. } => Some(FailureClass::TransportBroken),
            BridgeError::InfrastructureUnreachable { .. } => {
                Some(FailureClass::InfrastructureUnreachable)
            }
            BridgeError::CommandError { .. } => Some(FailureClass::CommandError),
            BridgeError::UnknownInfrastructure(_) | BridgeError::PoolExhausted { .. } => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_some_and(FailureClass::is_retryable)
    }

    /// Stable wire code consumed by the presentation layer.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::UnknownInfrastructure(_) => "UNKNOWN_INFRASTRUCTURE",
            BridgeError::SessionInvalid { .. } => "SESSION_INVALID",
            BridgeError::TransportBroken { .. } => "TRANSPORT_BROKEN",
            BridgeError::InfrastructureUnreachable { .. } => "INFRASTRUCTURE_UNREACHABLE",
            BridgeError::CommandError { .. } => "COMMAND_ERROR",
            BridgeError::PoolExhausted { .. } => "POOL_EXHAUSTED",
        }
    }

    /// True when the remote side reported that the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BridgeError::CommandError { category: Some(category), .. }
                if category.eq_ignore_ascii_case("ObjectNotFound")
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no infrastructures configured")]
    Empty,
    #[error("infrastructure id '{0}' is configured more than once")]
    DuplicateId(String),
    #[error("infrastructure '{0}' uses local shell auth but has no bootstrap script")]
    MissingBootstrapScript(String),
}
