use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use mail_gateway::{build_router, AppConfig, AppState};
use serde_json::{json, Value};
use shell_bridge::testing::ScriptedConnector;
use shell_bridge::{InvokeError, RemoteError, RemoteOutput};
use tower::util::ServiceExt;

const CONFIG: &str = r#"
token_secret = "integration-secret"
audit_capacity = 16

[pool]
min_sessions = 0
max_sessions = 2
reap_interval_secs = 0

[command]
timeout_ms = 5000
retry_attempts = 1
retry_delay_ms = 1

[[infrastructures]]
id = "eu"
label = "Exchange EU"
version = "2019"
server = "mail-eu.corp.local"
connection_uri = "https://mail-eu.corp.local/powershell"
auth = "basic"
credentials = { domain = "CORP", username = "svc-mail", password = "svc-pw" }

[[infrastructures]]
id = "us"
label = "Exchange US"
version = "2016"
server = "mail-us.corp.local"
connection_uri = "https://mail-us.corp.local/powershell"
auth = "kerberos"
"#;

struct TestApp {
    router: Router,
    connector: ScriptedConnector,
    state: AppState,
}

fn test_app() -> TestApp {
    let cfg = AppConfig::from_toml_str(CONFIG).unwrap();
    let connector = ScriptedConnector::new();
    connector.require_password("pw");
    let state = AppState::new(&cfg, Arc::new(connector.clone())).unwrap();
    TestApp {
        router: build_router(state.clone()),
        connector,
        state,
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, body)
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn login(app: &TestApp, infrastructure: Option<&str>) -> String {
    let (status, body) = send(
        app,
        post(
            "/api/auth/login",
            json!({"domain": "CORP", "username": "alice", "password": "pw", "infrastructure": infrastructure}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["data"]["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_and_infrastructures_are_public() {
    let app = test_app();
    let (status, body) = send(&app, get("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok");

    let (status, body) = send(&app, get("/api/infrastructures", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let list = body["data"].as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["id"], "eu");
    assert_eq!(list[0]["is_default"], true);
    assert_eq!(list[1]["auth"], "kerberos");
    assert!(list[0].get("credentials").is_none());
    assert!(list[0].get("connection_uri").is_none());
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() {
    let app = test_app();
    let (status, body) = send(&app, get("/api/mailboxes", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "UNAUTHORIZED");

    let (status, _) = send(&app, get("/api/audit", Some("not-a-jwt"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.connector.connects(), 0);
}

#[tokio::test]
async fn login_issues_a_token_pinned_to_the_infrastructure() {
    let app = test_app();
    let token = login(&app, Some("us")).await;
    let (status, body) = send(&app, get("/api/auth/me", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["principal"], "CORP\\alice");
    assert_eq!(body["data"]["infrastructure"], "us");

    app.connector.push_records(vec![json!({"Identity": "Submission", "MessageCount": 3})]);
    let (status, body) = send(&app, get("/api/queues?server=hub01", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["message_count"], 3);

    let request = app.connector.requests().pop().unwrap();
    assert_eq!(request.command, "Get-Queue");
    assert_eq!(request.parameters["Server"], "hub01");
    let audit = app.state.audit().list();
    assert_eq!(audit[0].infrastructure_id, "us");
    assert_eq!(audit[0].caller.as_deref(), Some("CORP\\alice"));
}

#[tokio::test]
async fn bad_credentials_and_unknown_infrastructures_are_rejected() {
    let app = test_app();
    let (status, body) = send(
        &app,
        post(
            "/api/auth/login",
            json!({"username": "alice", "password": "wrong"}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "UNAUTHORIZED");

    let (status, body) = send(
        &app,
        post(
            "/api/auth/login",
            json!({"domain": "CORP", "username": "alice", "password": "wrong", "infrastructure": "us"}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "invalid credentials");

    let (status, body) = send(
        &app,
        post(
            "/api/auth/login",
            json!({"username": "alice", "password": "pw", "infrastructure": "apac"}),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "UNKNOWN_INFRASTRUCTURE");
}

#[tokio::test]
async fn mailbox_listing_maps_records_and_binds_filters() {
    let app = test_app();
    let token = login(&app, None).await;
    app.connector.push_records(vec![json!({
        "Identity": "corp.local/Users/alice",
        "DisplayName": "Alice",
        "PrimarySmtpAddress": "alice@corp.example"
    })]);

    let (status, body) = send(
        &app,
        get("/api/mailboxes?identity=alice&result_size=10", Some(&token)),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"][0]["display_name"], "Alice");

    let request = app.connector.requests().pop().unwrap();
    assert_eq!(request.command, "Get-Mailbox");
    assert_eq!(request.parameters["Identity"], "alice");
    assert_eq!(request.parameters["ResultSize"], 10);
}

#[tokio::test]
async fn missing_objects_surface_as_not_found() {
    let app = test_app();
    let token = login(&app, None).await;
    app.connector.push_reply(Ok(RemoteOutput {
        records: Vec::new(),
        errors: vec![RemoteError {
            message: "The operation couldn't be performed because object 'ghost' couldn't be found."
                .into(),
            category: Some("ObjectNotFound".into()),
        }],
    }));
    let (status, body) = send(&app, get("/api/distribution-groups?identity=ghost", Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "COMMAND_ERROR");
    assert_eq!(app.connector.invocation_count(), 1);
}

#[tokio::test]
async fn expired_remote_sessions_become_unauthorized_after_retry() {
    let app = test_app();
    let token = login(&app, None).await;
    for _ in 0..2 {
        app.connector.push_failure(InvokeError::Rejected {
            message: "SESSION_INVALID: runspace was closed".into(),
            category: None,
        });
    }
    let (status, body) = send(&app, get("/api/mailboxes", Some(&token))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "SESSION_INVALID");
    assert_eq!(app.connector.invocation_count(), 2);
}

#[tokio::test]
async fn transport_and_reachability_failures_map_to_gateway_statuses() {
    let app = test_app();
    let token = login(&app, None).await;
    for _ in 0..2 {
        app.connector.push_failure(InvokeError::Dropped("connection reset".into()));
    }
    let (status, body) = send(&app, get("/api/queues", Some(&token))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "TRANSPORT_BROKEN");

    app.connector.fail_next_connect(InvokeError::Unreachable("no route to host".into()));
    let (status, body) = send(&app, get("/api/queues", Some(&token))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "INFRASTRUCTURE_UNREACHABLE");
}

#[tokio::test]
async fn transport_rules_toggle_with_bound_identity() {
    let app = test_app();
    let token = login(&app, None).await;
    let (status, body) = send(
        &app,
        post("/api/transport-rules/Block%20Spam/disable", json!({}), Some(&token)),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"], json!({"identity": "Block Spam", "enabled": false}));
    assert_eq!(body["message"], "transport rule disabled");

    let request = app.connector.requests().pop().unwrap();
    assert_eq!(request.command, "Disable-TransportRule");
    assert_eq!(request.parameters["Identity"], "Block Spam");
    assert_eq!(request.parameters["Confirm"], false);
}

#[tokio::test]
async fn unexpected_record_shapes_stay_server_errors() {
    let app = test_app();
    let token = login(&app, None).await;
    app.connector.push_records(vec![json!({"Status": "Ready"})]);
    let (status, body) = send(&app, get("/api/queues", Some(&token))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "INTERNAL");
}

#[tokio::test]
async fn audit_log_lists_and_clears() {
    let app = test_app();
    let token = login(&app, None).await;
    app.connector.push_failure(InvokeError::Dropped("reset".into()));
    app.connector.push_records(vec![json!({"Identity": "Submission"})]);
    let (status, body) = send(&app, get("/api/queues", Some(&token))).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = send(&app, get("/api/audit", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["data"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["status"], "completed");
    assert_eq!(entries[1]["status"], "failed");
    assert_eq!(entries[1]["error_code"], "TRANSPORT_BROKEN");

    let request = Request::builder()
        .method("DELETE")
        .uri("/api/audit")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], 2);
    assert!(app.state.audit().is_empty());
}

#[tokio::test]
async fn readiness_and_metrics_report_pool_state() {
    let app = test_app();
    let token = login(&app, None).await;
    app.connector.push_records(vec![json!({"Identity": "Submission"})]);
    let (status, body) = send(&app, get("/api/queues", Some(&token))).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = send(&app, get("/readyz", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pools"][0]["infrastructure_id"], "eu");
    assert_eq!(body["data"]["pools"][0]["idle"], 1);

    let (status, body) = send(&app, get("/metrics", None)).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("shell_commands_total"));
    assert!(text.contains("shell_pool_sessions"));
}
