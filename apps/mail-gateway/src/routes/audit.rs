use axum::{extract::State, Json};
use shell_bridge::AuditEntry;
use tracing::info;

use super::{ApiResponse, ApiResult, AuthUser};
use crate::state::AppState;

pub async fn list_audit(
    State(state): State<AppState>,
    _user: AuthUser,
) -> ApiResult<Vec<AuditEntry>> {
    Ok(Json(ApiResponse::ok(state.audit().list())))
}

pub async fn clear_audit(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> ApiResult<usize> {
    let cleared = state.audit().len();
    state.audit().clear();
    info!(principal = %claims.sub, cleared, "audit log cleared");
    Ok(Json(ApiResponse::ok(cleared).with_message("audit log cleared")))
}
