use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CommandRequest, RemoteOutput, ShellTransport};
use crate::classify::SESSION_INVALID_SENTINEL;
use crate::error::InvokeError;
use crate::infra::{AuthMode, Credentials, InfrastructureDescriptor};

/// Opens remoting sessions against `{connection_uri}/sessions`.
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OpenSessionRequest<'a> {
    configuration_name: &'a str,
    auth: AuthMode,
    domain: Option<&'a str>,
    username: Option<&'a str>,
}

#[derive(Deserialize)]
struct OpenSessionResponse {
    session_id: String,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub async fn connect(
        &self,
        infrastructure: &InfrastructureDescriptor,
        credentials: Option<&Credentials>,
    ) -> Result<Box<dyn ShellTransport>, InvokeError> {
        // Caller-supplied credentials are a logon check and must prove the password even
        // where pooled sessions rely on the endpoint's integrated authentication.
        let verifying = credentials.is_some();
        let credentials = credentials.or(infrastructure.credentials.as_ref());
        let base = infrastructure.connection_uri.trim_end_matches('/').to_string();
        let body = OpenSessionRequest {
            configuration_name: &infrastructure.configuration_name,
            auth: infrastructure.auth,
            domain: credentials.and_then(|c| c.domain.as_deref()),
            username: credentials.map(|c| c.username.as_str()),
        };

        let mut request = self.client.post(format!("{base}/sessions")).json(&body);
        if infrastructure.auth == AuthMode::Basic || verifying {
            let Some(credentials) = credentials else {
                return Err(InvokeError::Rejected {
                    message: format!(
                        "{SESSION_INVALID_SENTINEL}: password logon requires credentials for '{}'",
                        infrastructure.id
                    ),
                    category: Some("AuthenticationFailed".into()),
                });
            };
            request = request.basic_auth(credentials.principal(), Some(&credentials.password));
        }

        // Nothing has been submitted yet, so every send failure means unreachable.
        let response = request
            .send()
            .await
            .map_err(|err| InvokeError::Unreachable(err.to_string()))?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(InvokeError::Rejected {
                message: format!("{SESSION_INVALID_SENTINEL}: authentication rejected ({status})"),
                category: Some("AuthenticationFailed".into()),
            });
        }
        if status.is_server_error() {
            return Err(InvokeError::Unreachable(format!(
                "session endpoint answered {status}"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InvokeError::Rejected {
                message: format!("session open failed ({status}): {text}"),
                category: None,
            });
        }

        let opened: OpenSessionResponse = response
            .json()
            .await
            .map_err(|err| InvokeError::Unreachable(format!("malformed handshake reply: {err}")))?;
        debug!(
            infrastructure = %infrastructure.id,
            remote_session = %opened.session_id,
            "remoting session opened"
        );
        Ok(Box::new(HttpTransport {
            client: self.client.clone(),
            base,
            session_id: opened.session_id,
        }))
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    base: String,
    session_id: String,
}

impl HttpTransport {
    fn session_url(&self) -> String {
        format!("{}/sessions/{}", self.base, self.session_id)
    }
}

#[async_trait]
impl ShellTransport for HttpTransport {
    async fn invoke(&mut self, request: &CommandRequest) -> Result<RemoteOutput, InvokeError> {
        let response = self
            .client
            .post(format!("{}/invoke", self.session_url()))
            .json(request)
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    InvokeError::Unreachable(err.to_string())
                } else {
                    InvokeError::Dropped(err.to_string())
                }
            })?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND
            | StatusCode::GONE => Err(InvokeError::Rejected {
                message: format!(
                    "{SESSION_INVALID_SENTINEL}: remote session {} rejected ({status})",
                    self.session_id
                ),
                category: None,
            }),
            s if s.is_success() || s == StatusCode::UNPROCESSABLE_ENTITY => response
                .json::<RemoteOutput>()
                .await
                .map_err(|err| InvokeError::Dropped(format!("incomplete result stream: {err}"))),
            _ => {
                let text = response.text().await.unwrap_or_default();
                Err(InvokeError::Dropped(format!("remote answered {status}: {text}")))
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.client.delete(self.session_url()).send().await {
            warn!(remote_session = %self.session_id, error = %err, "failed to close remoting session");
        }
    }
}
