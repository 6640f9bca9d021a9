use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shell_bridge::classify::classify_error;
use shell_bridge::{BridgeError, Credentials, InfrastructureDescriptor, ShellConnector};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("jwt validation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Identity carried by an issued bearer token. `infrastructure` pins every command the
/// caller submits to the infrastructure they logged in against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub domain: Option<String>,
    pub infrastructure: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

#[derive(Clone)]
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &str, issuer: impl Into<String>, ttl: Duration) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer,
            ttl,
        }
    }

    pub fn issue(
        &self,
        credentials: &Credentials,
        infrastructure: &str,
    ) -> Result<(String, Claims), AuthError> {
        self.issue_at(credentials, infrastructure, Utc::now())
    }

    pub fn issue_at(
        &self,
        credentials: &Credentials,
        infrastructure: &str,
        issued_at: DateTime<Utc>,
    ) -> Result<(String, Claims), AuthError> {
        let iat = issued_at.timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            sub: credentials.principal(),
            domain: credentials.domain.clone(),
            infrastructure: infrastructure.to_string(),
            iat,
            exp: iat.saturating_add(ttl),
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok((token, claims))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(decode::<Claims>(token, &self.decoding, &self.validation)?.claims)
    }
}

/// Decides whether a user's credentials are good for a given infrastructure.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(
        &self,
        infrastructure: &InfrastructureDescriptor,
        credentials: &Credentials,
    ) -> Result<(), BridgeError>;
}

/// Verifies by opening one session as the user and closing it straight away. The session
/// never enters a pool.
pub struct ShellCredentialVerifier {
    connector: Arc<dyn ShellConnector>,
    timeout: Duration,
}

impl ShellCredentialVerifier {
    pub fn new(connector: Arc<dyn ShellConnector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }
}

#[async_trait]
impl CredentialVerifier for ShellCredentialVerifier {
    async fn verify(
        &self,
        infrastructure: &InfrastructureDescriptor,
        credentials: &Credentials,
    ) -> Result<(), BridgeError> {
        let connect = self.connector.connect(infrastructure, Some(credentials));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(mut transport)) => {
                transport.close().await;
                debug!(
                    infrastructure = %infrastructure.id,
                    principal = %credentials.principal(),
                    "credentials verified"
                );
                Ok(())
            }
            Ok(Err(err)) => {
                let class = classify_error(&err);
                Err(BridgeError::from_invoke(class, err, &infrastructure.id))
            }
            Err(_) => Err(BridgeError::InfrastructureUnreachable {
                infrastructure: infrastructure.id.clone(),
                message: format!("logon handshake exceeded {}ms", self.timeout.as_millis()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn credentials() -> Credentials {
        Credentials::new(Some("CORP".into()), "alice", "pw")
    }

    #[test]
    fn issued_tokens_round_trip_with_identity() {
        let issuer = TokenIssuer::new("secret-key", "mail-gateway", Duration::from_secs(600));
        let (token, claims) = issuer.issue(&credentials(), "eu").unwrap();
        let verified = issuer.verify(&token).unwrap();
        assert_eq!(verified, claims);
        assert_eq!(verified.sub, "CORP\\alice");
        assert_eq!(verified.infrastructure, "eu");
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let issuer = TokenIssuer::new("secret-key", "mail-gateway", Duration::from_secs(60));
        let (token, _) = issuer
            .issue_at(&credentials(), "eu", Utc::now() - ChronoDuration::hours(2))
            .unwrap();
        assert!(matches!(issuer.verify(&token), Err(AuthError::Jwt(_))));
    }

    #[test]
    fn tokens_from_another_secret_or_issuer_are_rejected() {
        let ours = TokenIssuer::new("secret-key", "mail-gateway", Duration::from_secs(60));
        let forged = TokenIssuer::new("other-key", "mail-gateway", Duration::from_secs(60));
        let foreign = TokenIssuer::new("secret-key", "someone-else", Duration::from_secs(60));
        let (token, _) = forged.issue(&credentials(), "eu").unwrap();
        assert!(ours.verify(&token).is_err());
        let (token, _) = foreign.issue(&credentials(), "eu").unwrap();
        assert!(ours.verify(&token).is_err());
        assert!(matches!(ours.verify(""), Err(AuthError::MissingToken)));
    }
}
