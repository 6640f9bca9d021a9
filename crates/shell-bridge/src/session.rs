use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::InvokeError;
use crate::transport::{CommandRequest, RemoteOutput, ShellTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    InUse,
    Broken,
}

/// One authenticated connection to a remote shell. Executes one command at a time.
pub struct Session {
    id: Uuid,
    infrastructure_id: String,
    transport: Box<dyn ShellTransport>,
    created_at: Instant,
    last_used: Instant,
    state: SessionState,
}

impl Session {
    pub fn new(infrastructure_id: impl Into<String>, transport: Box<dyn ShellTransport>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            infrastructure_id: infrastructure_id.into(),
            transport,
            created_at: now,
            last_used: now,
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn infrastructure_id(&self) -> &str {
        &self.infrastructure_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Submit one command, bounded by `timeout`. A timeout leaves the remote side in an
    /// unknown state; callers must discard the session afterwards.
    pub async fn invoke(
        &mut self,
        request: &CommandRequest,
        timeout: Duration,
    ) -> Result<RemoteOutput, InvokeError> {
        if self.state == SessionState::Broken {
            return Err(InvokeError::Dropped("session already broken".into()));
        }
        let result = match tokio::time::timeout(timeout, self.transport.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(InvokeError::TimedOut(timeout)),
        };
        self.last_used = Instant::now();
        if matches!(result, Err(InvokeError::Dropped(_) | InvokeError::TimedOut(_))) {
            self.state = SessionState::Broken;
        }
        result
    }

    pub(crate) fn mark_in_use(&mut self) {
        self.state = SessionState::InUse;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = SessionState::Idle;
        self.last_used = Instant::now();
    }

    pub(crate) async fn close(mut self) {
        self.state = SessionState::Broken;
        self.transport.close().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("infrastructure_id", &self.infrastructure_id)
            .field("state", &self.state)
            .field("age", &self.age())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::descriptor;
    use crate::testing::ScriptedConnector;
    use crate::transport::ShellConnector;

    #[tokio::test]
    async fn dropped_transport_marks_the_session_broken() {
        let connector = ScriptedConnector::new();
        connector.push_failure(InvokeError::Dropped("reset".into()));
        let transport = connector.connect(&descriptor("eu"), None).await.unwrap();
        let mut session = Session::new("eu", transport);
        let request = CommandRequest {
            command: "Get-Queue".into(),
            parameters: Default::default(),
        };

        let err = session.invoke(&request, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, InvokeError::Dropped(_)));
        assert_eq!(session.state(), SessionState::Broken);

        let err = session.invoke(&request, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, InvokeError::Dropped(message) if message.contains("broken")));
        assert_eq!(connector.invocation_count(), 1);
    }
}
