//! Runtime API HTTP endpoints.
//!
//! The subset of <https://docs.aws.amazon.com/lambda/latest/dg/runtimes-api.html>
//! a runtime client needs: long-poll for work, reply, and report init failure.

use super::state::{ReplyOutcome, RuntimeReply, RuntimeState};
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use std::sync::Arc;

/// Header carrying the function error type on `/error` posts.
const FUNCTION_ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

#[derive(Clone)]
pub(crate) struct RuntimeApiState {
    pub runtime: Arc<RuntimeState>,
}

pub(crate) fn create_runtime_api_router(state: RuntimeApiState) -> Router {
    Router::new()
        .route("/2018-06-01/runtime/invocation/next", get(next_invocation))
        .route(
            "/2018-06-01/runtime/invocation/{request_id}/response",
            post(invocation_response),
        )
        .route(
            "/2018-06-01/runtime/invocation/{request_id}/error",
            post(invocation_error),
        )
        .route("/2018-06-01/runtime/init/error", post(init_error))
        .with_state(state)
}

#[allow(clippy::result_large_err)]
fn safe_header_insert(
    headers: &mut HeaderMap,
    name: &'static str,
    value: impl AsRef<str>,
) -> Result<(), Response> {
    match HeaderValue::from_str(value.as_ref()) {
        Ok(header_value) => {
            headers.insert(name, header_value);
            Ok(())
        }
        Err(_) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to create header {}", name),
        )
            .into_response()),
    }
}

/// GET /2018-06-01/runtime/invocation/next
///
/// Long-polls until an invocation is queued. The first call completes init.
async fn next_invocation(State(state): State<RuntimeApiState>) -> Response {
    if state.runtime.mark_ready() {
        tracing::debug!("Runtime polled for its first invocation; init complete");
    }

    let invocation = state.runtime.next_invocation().await;
    let request = &invocation.request;

    let mut headers = HeaderMap::new();

    if let Err(e) = safe_header_insert(&mut headers, "Lambda-Runtime-Aws-Request-Id", &request.id)
    {
        return e;
    }

    if let Err(e) = safe_header_insert(
        &mut headers,
        "Lambda-Runtime-Deadline-Ms",
        invocation.deadline_ms().to_string(),
    ) {
        return e;
    }

    if let Err(e) = safe_header_insert(
        &mut headers,
        "Lambda-Runtime-Invoked-Function-Arn",
        &request.invoked_function_arn,
    ) {
        return e;
    }

    if !request.trace_id.is_empty()
        && let Err(e) = safe_header_insert(&mut headers, "Lambda-Runtime-Trace-Id", &request.trace_id)
    {
        return e;
    }

    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );

    tracing::debug!(request_id = %request.id, "Handing invocation to runtime");

    (StatusCode::OK, headers, request.payload.clone()).into_response()
}

/// POST /2018-06-01/runtime/invocation/{request_id}/response
async fn invocation_response(
    State(state): State<RuntimeApiState>,
    Path(request_id): Path<String>,
    body: Bytes,
) -> Response {
    accept_reply(&state, &request_id, RuntimeReply::Response(body)).await
}

/// POST /2018-06-01/runtime/invocation/{request_id}/error
async fn invocation_error(
    State(state): State<RuntimeApiState>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let error_type = headers
        .get(FUNCTION_ERROR_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("Unhandled");
    tracing::debug!(%request_id, error_type, "Runtime reported a function error");

    accept_reply(&state, &request_id, RuntimeReply::Error(body)).await
}

async fn accept_reply(state: &RuntimeApiState, request_id: &str, reply: RuntimeReply) -> Response {
    match state.runtime.reply(request_id, reply).await {
        ReplyOutcome::Accepted => StatusCode::ACCEPTED.into_response(),
        ReplyOutcome::UnknownRequest => (
            StatusCode::NOT_FOUND,
            format!("Unknown request ID: {}", request_id),
        )
            .into_response(),
    }
}

/// POST /2018-06-01/runtime/init/error
async fn init_error(State(state): State<RuntimeApiState>, body: Bytes) -> Response {
    if state.runtime.fail_init(body) {
        tracing::warn!("Runtime reported an init error");
    } else {
        tracing::warn!("Ignoring init error reported after init settled");
    }

    StatusCode::ACCEPTED.into_response()
}
