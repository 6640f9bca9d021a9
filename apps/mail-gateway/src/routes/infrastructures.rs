use axum::{extract::State, Json};
use shell_bridge::InfrastructureSummary;

use super::{ApiResponse, ApiResult};
use crate::state::AppState;

/// Public fields only; the login screen needs this before anyone holds a token.
pub async fn list_infrastructures(State(state): State<AppState>) -> ApiResult<Vec<InfrastructureSummary>> {
    Ok(Json(ApiResponse::ok(state.infrastructures().summaries())))
}
