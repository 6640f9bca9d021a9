mod audit;
mod auth;
mod infrastructures;
mod mail;

use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use shell_bridge::BridgeError;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::{boundary, metrics, state::AppState};

pub use auth::AuthUser;

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/readyz", get(readiness))
        .route("/metrics", get(export_metrics))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        .route("/api/infrastructures", get(infrastructures::list_infrastructures))
        .route("/api/audit", get(audit::list_audit).delete(audit::clear_audit))
        .route("/api/mailboxes", get(mail::list_mailboxes))
        .route("/api/queues", get(mail::list_queues))
        .route(
            "/api/distribution-groups",
            get(mail::list_distribution_groups),
        )
        .route(
            "/api/transport-rules/:identity/enable",
            post(mail::enable_transport_rule),
        )
        .route(
            "/api/transport-rules/:identity/disable",
            post(mail::disable_transport_rule),
        )
        .with_state(state);
    with_edge_layers(router)
}

/// The boundary filter is the last layer that touches a response; only the request trace
/// sits outside it, so logged statuses match what the client receives.
fn with_edge_layers(router: Router) -> Router {
    router
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(boundary::normalize_session_expiry))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let pools = state.pools().stats();
    metrics::refresh_pool_gauges(&pools);
    Json(ApiResponse::ok(json!({
        "infrastructures": state.infrastructures().len(),
        "pools": pools,
    })))
}

async fn export_metrics(State(state): State<AppState>) -> impl IntoResponse {
    metrics::refresh_pool_gauges(&state.pools().stats());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::export_prometheus(),
    )
}

/// Envelope shared by every JSON response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            error: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Bridge(BridgeError),
    Unauthorized(&'static str),
    BadRequest(String),
    Internal(String),
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        ApiError::Bridge(err)
    }
}

/// The one place a bridge failure becomes an HTTP status.
pub fn status_for(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::SessionInvalid { .. } => StatusCode::UNAUTHORIZED,
        BridgeError::CommandError { .. } if err.is_not_found() => StatusCode::NOT_FOUND,
        BridgeError::CommandError { .. } => StatusCode::BAD_REQUEST,
        BridgeError::TransportBroken { .. } => StatusCode::BAD_GATEWAY,
        BridgeError::InfrastructureUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::PoolExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
        BridgeError::UnknownInfrastructure(_) => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Bridge(err) => (status_for(&err), err.code(), err.to_string()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg)
            }
        };
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            message: Some(message),
            error: Some(code),
        };
        (status, Json(body)).into_response()
    }
}
