//! The request dispatch pipeline.
//!
//! Every request lands here (the axum fallback). The pipeline:
//!
//! 1. gate the method (only GET/PUT/POST are recognized),
//! 2. resolve the path against the longest-prefix router,
//! 3. for hook chains: require POST and an exact path, check the
//!    `X-Gitlab-Token` ladder (401 missing, 403 unauthorized),
//! 4. collect the body up to the configured cap (413 past it),
//! 5. parse JSON (400 on garbage),
//! 6. walk the chain, aggregating per-hook outcomes into the response:
//!    any `Accepted` → 202, all `Ignored` → 204, a `Stop` ends the walk
//!    with the hook's own reply.
//!
//! Note the ordering: authorization happens before the body is read, so an
//! unauthorized client cannot make the daemon buffer uploads, and an
//! oversized body never reaches a hook.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::hooks::{HookChain, HookContext, HookError, Outcome, Reply};

use super::{AppState, RouteTarget, status};

/// Header carrying the shared secret.
const TOKEN_HEADER: &str = "x-gitlab-token";

/// Header naming the GitLab event kind.
const EVENT_HEADER: &str = "x-gitlab-event";

/// Fallback handler dispatching every request.
pub async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if !matches!(method, Method::GET | Method::PUT | Method::POST) {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let Some(target) = state.router().lookup(&path) else {
        return plain(StatusCode::NOT_FOUND, "not found");
    };

    match *target {
        RouteTarget::Status => serve_status(&state, &method),
        RouteTarget::Chain(index) => {
            let chain = &state.chains()[index];
            serve_chain(&state, chain, peer, &method, &path, request).await
        }
    }
}

/// `GET /status`: the counters as HTML.
fn serve_status(state: &AppState, method: &Method) -> Response {
    if method != Method::GET {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    Html(status::render(&state.stats().snapshot())).into_response()
}

/// A webhook delivery for a hook chain.
async fn serve_chain(
    state: &AppState,
    chain: &HookChain,
    peer: SocketAddr,
    method: &Method,
    path: &str,
    request: Request<Body>,
) -> Response {
    state.stats().request_received();
    let peer_address = peer.ip().to_string();

    if method != Method::POST {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    // The router matched a prefix; the hook itself owns only the exact path.
    if path != chain.uri_path() {
        return plain(StatusCode::NOT_FOUND, "not found");
    }

    let (parts, body) = request.into_parts();

    let Some(token) = header_str(&parts.headers, TOKEN_HEADER).filter(|t| !t.is_empty()) else {
        return plain(StatusCode::UNAUTHORIZED, "unauthorized");
    };
    let token = token.to_string();

    if !chain.authorizes(&token, &peer_address) {
        warn!(
            path = %path,
            peer = %peer_address,
            "rejecting request with unauthorized token or peer address"
        );
        return plain(StatusCode::FORBIDDEN, "forbidden");
    }

    let event = header_str(&parts.headers, EVENT_HEADER).map(str::to_string);

    // Upload. Past the cap the hook continuation never runs.
    let bytes = match axum::body::to_bytes(body, state.content_size_limit()).await {
        Ok(bytes) => bytes,
        Err(err) if is_length_limit(&err) => {
            warn!(path = %path, peer = %peer_address, "request body exceeds content size limit");
            return plain(StatusCode::PAYLOAD_TOO_LARGE, "payload too large");
        }
        Err(err) => {
            warn!(path = %path, peer = %peer_address, "failed to read request body: {err}");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
        }
    };

    state.stats().request_valid();

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(path = %path, "invalid request to {path}: {err}");
            return plain(StatusCode::BAD_REQUEST, err.to_string());
        }
    };

    log_request(path, &peer_address, event.as_deref(), &payload);

    let ctx = HookContext {
        queue: state.queue(),
        stats: state.stats(),
    };

    let mut accepted = 0usize;
    for hook in chain.hooks() {
        if !hook.authorizes(&token, &peer_address) {
            continue;
        }
        match hook.process(ctx, event.as_deref(), &payload) {
            Ok(Outcome::Stop(reply)) => return reply_response(reply),
            Ok(Outcome::Ignored) => {}
            Ok(Outcome::Accepted) => accepted += 1,
            Err(HookError::Payload(message)) => {
                warn!(path = %path, "invalid request to {path}: {message}");
                return plain(StatusCode::BAD_REQUEST, message);
            }
            Err(HookError::Internal(message)) => {
                error!(path = %path, "failed processing request to {path}: {message}");
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "internal server error");
            }
        }
    }

    if accepted > 0 {
        plain(StatusCode::ACCEPTED, "accepted")
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

/// The one-line delivery log.
fn log_request(path: &str, peer_address: &str, event: Option<&str>, payload: &Value) {
    let project = payload
        .pointer("/project/web_url")
        .and_then(Value::as_str)
        .unwrap_or("(none)");
    info!(
        "received '{}' from {} to {} for project {}",
        event.unwrap_or("(unspecified)"),
        peer_address,
        path,
        project
    );
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

/// Maps a hook's `Stop` reply onto an HTTP response.
fn reply_response(reply: Reply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, reply.body).into_response()
}

/// Whether a body-collection error is the length cap (as opposed to a
/// transport failure).
fn is_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if current.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}
