//! Last-chance correction of responses that lost their session-expiry meaning on the way
//! out: a generic 500 whose body carries the session-invalid marker becomes a 401.

use axum::{
    body::{self, Body},
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use shell_bridge::carries_session_invalid_marker;
use tracing::{info, warn};

use crate::metrics::SESSION_EXPIRY_REWRITES;

const MAX_INSPECTED_BODY: usize = 16 * 1024 * 1024;

pub async fn normalize_session_expiry(request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    if response.status() != StatusCode::INTERNAL_SERVER_ERROR {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match body::to_bytes(body, MAX_INSPECTED_BODY).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to buffer error response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let status = rewrite_status(parts.status, &bytes);
    if status != parts.status {
        SESSION_EXPIRY_REWRITES.inc();
        info!("rewrote server error carrying session-invalid marker to 401");
        parts.status = status;
    }
    Response::from_parts(parts, Body::from(bytes))
}

pub fn rewrite_status(status: StatusCode, body: &[u8]) -> StatusCode {
    if status == StatusCode::INTERNAL_SERVER_ERROR
        && carries_session_invalid_marker(&String::from_utf8_lossy(body))
    {
        StatusCode::UNAUTHORIZED
    } else {
        status
    }
}

#[cfg(test)]
mod tests {
    use axum::{middleware, routing::get, Router};
    use tower::util::ServiceExt;

    use super::*;

    #[test]
    fn only_server_errors_with_the_marker_are_rewritten() {
        let marked = br#"{"success":false,"message":"SESSION_INVALID: runspace gone"}"#;
        assert_eq!(
            rewrite_status(StatusCode::INTERNAL_SERVER_ERROR, marked),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            rewrite_status(StatusCode::INTERNAL_SERVER_ERROR, b"disk full"),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(rewrite_status(StatusCode::BAD_GATEWAY, marked), StatusCode::BAD_GATEWAY);
        assert_eq!(rewrite_status(StatusCode::OK, marked), StatusCode::OK);
    }

    #[tokio::test]
    async fn middleware_preserves_the_buffered_body() {
        let app = Router::new()
            .route(
                "/boom",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "SESSION_INVALID: expired") }),
            )
            .layer(middleware::from_fn(normalize_session_expiry));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/boom")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"SESSION_INVALID: expired");
    }
}
