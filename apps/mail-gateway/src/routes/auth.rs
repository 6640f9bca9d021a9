use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shell_bridge::{BridgeError, Credentials};
use tracing::{info, warn};

use super::{ApiError, ApiResponse, ApiResult};
use crate::{auth::Claims, metrics::LOGIN_RESULTS, state::AppState};

/// Verified bearer-token identity.
#[derive(Clone, Debug)]
pub struct AuthUser(pub Claims);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = extract_token(&parts.headers).ok_or(ApiError::Unauthorized("missing bearer token"))?;
        state
            .tokens()
            .verify(token)
            .map(AuthUser)
            .map_err(|err| {
                warn!(error = %err, "rejected bearer token");
                ApiError::Unauthorized("invalid or expired token")
            })
    }
}

fn extract_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[derive(Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub domain: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub infrastructure: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Identity {
    pub principal: String,
    pub domain: Option<String>,
    pub infrastructure: String,
}

impl From<&Claims> for Identity {
    fn from(claims: &Claims) -> Self {
        Self {
            principal: claims.sub.clone(),
            domain: claims.domain.clone(),
            infrastructure: claims.infrastructure.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: Identity,
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<LoginResponse> {
    if request.username.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest("username and password are required".into()));
    }
    let infrastructure = state
        .infrastructures()
        .resolve(request.infrastructure.as_deref())?;
    let credentials = Credentials::new(request.domain, request.username.trim(), request.password);

    if let Err(err) = state.verifier().verify(&infrastructure, &credentials).await {
        LOGIN_RESULTS.with_label_values(&[err.code()]).inc();
        warn!(
            infrastructure = %infrastructure.id,
            principal = %credentials.principal(),
            code = err.code(),
            "login failed"
        );
        return Err(match err {
            BridgeError::SessionInvalid { .. } | BridgeError::CommandError { .. } => {
                ApiError::Unauthorized("invalid credentials")
            }
            other => ApiError::Bridge(other),
        });
    }

    let (token, claims) = state
        .tokens()
        .issue(&credentials, &infrastructure.id)
        .map_err(|err| ApiError::Internal(format!("failed to issue token: {err}")))?;
    LOGIN_RESULTS.with_label_values(&["success"]).inc();
    info!(infrastructure = %infrastructure.id, principal = %claims.sub, "login succeeded");

    let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now);
    Ok(Json(
        ApiResponse::ok(LoginResponse {
            token,
            expires_at,
            user: Identity::from(&claims),
        })
        .with_message("logged in"),
    ))
}

pub async fn me(AuthUser(claims): AuthUser) -> ApiResult<Identity> {
    Ok(Json(ApiResponse::ok(Identity::from(&claims))))
}
