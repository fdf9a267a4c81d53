use axum::{
    body::{ Body, Bytes },
    extract::{ Path, State },
    http::{ header, HeaderMap, StatusCode },
    response::{ IntoResponse, Response },
    routing::{ get, post },
    Json,
    Router,
};
use futures::{ stream, StreamExt };
use log::{ debug, info, warn };
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::cors::{ Any, CorsLayer };

use super::{ handle_job, AppContext };
use crate::models::{ JobRequest, Token };

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

pub fn router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/runsync", post(runsync_handler))
        .route("/v2/{endpoint_id}/runsync", post(endpoint_runsync_handler))
        .layer(cors)
        .with_state(ctx)
}

async fn health_handler(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "engine": ctx.engine.name() }))
}

async fn endpoint_runsync_handler(
    State(ctx): State<Arc<AppContext>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    body: Bytes
) -> Response {
    debug!("Job submitted to endpoint {}", endpoint_id);
    run_job(ctx, headers, body).await
}

async fn runsync_handler(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    body: Bytes
) -> Response {
    run_job(ctx, headers, body).await
}

fn is_authorized(ctx: &AppContext, headers: &HeaderMap) -> bool {
    let expected = match &ctx.api_key {
        Some(key) => key,
        None => {
            return true;
        }
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(|provided| keys_match(provided, expected))
        .unwrap_or(false)
}

/// Token of an `Authorization: Bearer <token>` value. The scheme is
/// case-insensitive.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}

/// Constant-time in the key contents; only the length can differ early.
fn keys_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// One NDJSON line per token, then the completion marker.
fn output_line(token: &Token) -> String {
    format!("{}\n", json!({ "output": token.to_json() }))
}

async fn run_job(ctx: Arc<AppContext>, headers: HeaderMap, body: Bytes) -> Response {
    if !is_authorized(&ctx, &headers) {
        warn!("Job rejected: invalid or missing API key");
        return error_response(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    if ctx.limiter.check().is_err() {
        warn!("Job rate limit exceeded. Rejecting.");
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
    }

    let job: JobRequest = match serde_json::from_slice(&body) {
        Ok(job) => job,
        Err(e) => {
            warn!("Malformed job body: {}", e);
            return error_response(StatusCode::BAD_REQUEST, &format!("Invalid job body: {}", e));
        }
    };

    info!("Accepted job for {} engine", ctx.engine.name());
    let tokens = handle_job(ctx, job).await;
    let lines = tokens
        .map(|token| output_line(&token))
        .chain(stream::once(async { format!("{}\n", json!({ "status": "COMPLETED" })) }))
        .map(Ok::<_, Infallible>);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .body(Body::from_stream(lines))
        .unwrap_or_else(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("BEARER abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[test]
    fn test_keys_match() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secreT", "secret"));
        assert!(!keys_match("secret-longer", "secret"));
        assert!(!keys_match("", "secret"));
    }

    #[test]
    fn test_output_lines() {
        assert_eq!(output_line(&Token::Text("Hi".into())), "{\"output\":\"Hi\"}\n");
        assert_eq!(
            output_line(&Token::Error("boom".into())),
            "{\"output\":{\"error\":\"boom\"}}\n"
        );
    }
}
