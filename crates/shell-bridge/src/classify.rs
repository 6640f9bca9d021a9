use crate::error::{FailureClass, InvokeError};

/// Literal the remote side (and any layer that stringifies a [`FailureClass::SessionInvalid`]
/// error) emits when the session context was never established or has been lost.
pub const SESSION_INVALID_SENTINEL: &str = "SESSION_INVALID";

/// The one place that sniffs text for the session-invalid condition.
pub fn carries_session_invalid_marker(text: &str) -> bool {
    text.contains(SESSION_INVALID_SENTINEL)
}

/// Classify a transport failure together with whatever output the remote side produced.
///
/// Rules are checked in order: sentinel in output, unreachable before submit, dropped
/// mid-command (a per-attempt timeout counts as dropped since the remote state is unknown),
/// and finally a well-formed remote rejection.
pub fn classify(error: &InvokeError, output: &str) -> FailureClass {
    if carries_session_invalid_marker(output) {
        return FailureClass::SessionInvalid;
    }
    match error {
        InvokeError::Unreachable(_) => FailureClass::InfrastructureUnreachable,
        InvokeError::Dropped(_) | InvokeError::TimedOut(_) => FailureClass::TransportBroken,
        InvokeError::Rejected { .. } => FailureClass::CommandError,
    }
}

/// Shorthand for classifying an error against its own raw output.
pub fn classify_error(error: &InvokeError) -> FailureClass {
    classify(error, error.raw_output())
}
