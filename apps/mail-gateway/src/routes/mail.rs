//! Thin business callers: each route names one shell command, binds its parameters and
//! maps the records it returns.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use shell_bridge::CommandDescriptor;

use super::{ApiError, ApiResponse, ApiResult, AuthUser};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct MailboxQuery {
    pub identity: Option<String>,
    pub result_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    pub server: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GroupQuery {
    pub identity: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Mailbox {
    #[serde(rename(deserialize = "Identity"))]
    pub identity: String,
    #[serde(rename(deserialize = "DisplayName"), default)]
    pub display_name: Option<String>,
    #[serde(rename(deserialize = "Alias"), default)]
    pub alias: Option<String>,
    #[serde(rename(deserialize = "PrimarySmtpAddress"), default)]
    pub primary_smtp_address: Option<String>,
    #[serde(rename(deserialize = "Database"), default)]
    pub database: Option<String>,
    #[serde(rename(deserialize = "RecipientTypeDetails"), default)]
    pub recipient_type: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MailQueue {
    #[serde(rename(deserialize = "Identity"))]
    pub identity: String,
    #[serde(rename(deserialize = "DeliveryType"), default)]
    pub delivery_type: Option<String>,
    #[serde(rename(deserialize = "Status"), default)]
    pub status: Option<String>,
    #[serde(rename(deserialize = "MessageCount"), default)]
    pub message_count: Option<u64>,
    #[serde(rename(deserialize = "NextHopDomain"), default)]
    pub next_hop_domain: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DistributionGroup {
    #[serde(rename(deserialize = "Identity"))]
    pub identity: String,
    #[serde(rename(deserialize = "DisplayName"), default)]
    pub display_name: Option<String>,
    #[serde(rename(deserialize = "PrimarySmtpAddress"), default)]
    pub primary_smtp_address: Option<String>,
    #[serde(rename(deserialize = "GroupType"), default)]
    pub group_type: Option<String>,
    #[serde(rename(deserialize = "ManagedBy"), default)]
    pub managed_by: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TransportRuleState {
    pub identity: String,
    pub enabled: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn decode<T: DeserializeOwned>(command: &str, records: Vec<Value>) -> Result<Vec<T>, ApiError> {
    records
        .into_iter()
        .map(|record| {
            serde_json::from_value(record).map_err(|err| {
                ApiError::Internal(format!("unexpected {command} record: {err}"))
            })
        })
        .collect()
}

pub async fn list_mailboxes(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Query(query): Query<MailboxQuery>,
) -> ApiResult<Vec<Mailbox>> {
    let descriptor = CommandDescriptor::new("Get-Mailbox")
        .param_opt("Identity", non_empty(query.identity))
        .param_opt("ResultSize", query.result_size);
    let records = state.execute(&claims, descriptor).await?;
    Ok(Json(ApiResponse::ok(decode("Get-Mailbox", records)?)))
}

pub async fn list_queues(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Query(query): Query<QueueQuery>,
) -> ApiResult<Vec<MailQueue>> {
    let descriptor = CommandDescriptor::new("Get-Queue").param_opt("Server", non_empty(query.server));
    let records = state.execute(&claims, descriptor).await?;
    Ok(Json(ApiResponse::ok(decode("Get-Queue", records)?)))
}

pub async fn list_distribution_groups(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Query(query): Query<GroupQuery>,
) -> ApiResult<Vec<DistributionGroup>> {
    let descriptor = CommandDescriptor::new("Get-DistributionGroup")
        .param_opt("Identity", non_empty(query.identity));
    let records = state.execute(&claims, descriptor).await?;
    Ok(Json(ApiResponse::ok(decode("Get-DistributionGroup", records)?)))
}

pub async fn enable_transport_rule(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(identity): Path<String>,
) -> ApiResult<TransportRuleState> {
    set_transport_rule(&state, &claims, identity, true).await
}

pub async fn disable_transport_rule(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
    Path(identity): Path<String>,
) -> ApiResult<TransportRuleState> {
    set_transport_rule(&state, &claims, identity, false).await
}

async fn set_transport_rule(
    state: &AppState,
    claims: &crate::auth::Claims,
    identity: String,
    enabled: bool,
) -> ApiResult<TransportRuleState> {
    let command = if enabled {
        "Enable-TransportRule"
    } else {
        "Disable-TransportRule"
    };
    let descriptor = CommandDescriptor::new(command)
        .param("Identity", identity.clone())
        .param("Confirm", false);
    state.execute(claims, descriptor).await?;
    let message = format!("transport rule {}", if enabled { "enabled" } else { "disabled" });
    Ok(Json(
        ApiResponse::ok(TransportRuleState { identity, enabled }).with_message(message),
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_shell_records_into_snake_case_dtos() {
        let records = vec![json!({
            "Identity": "corp.local/Users/alice",
            "DisplayName": "Alice",
            "PrimarySmtpAddress": "alice@corp.example",
            "ExtraField": 42
        })];
        let mailboxes: Vec<Mailbox> = decode("Get-Mailbox", records).unwrap();
        let rendered = serde_json::to_value(&mailboxes[0]).unwrap();
        assert_eq!(rendered["display_name"], "Alice");
        assert_eq!(rendered["primary_smtp_address"], "alice@corp.example");
        assert!(rendered["alias"].is_null());
    }

    #[test]
    fn malformed_records_are_internal_errors() {
        let err = decode::<MailQueue>("Get-Queue", vec![json!({"Status": "Ready"})]).unwrap_err();
        assert!(matches!(err, ApiError::Internal(message) if message.contains("Get-Queue")));
    }

    #[test]
    fn blank_filters_are_not_bound() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some(" alice ".into())), Some("alice".into()));
    }
}
