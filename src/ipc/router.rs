use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use std::time::Instant;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let started = Instant::now();
    let span = tracing::debug_span!("request", id = %req.id, method = %req.method);
    let _guard = span.enter();

    let resp = dispatch(state, &req);
    tracing::debug!(
        ok = resp.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        elapsed = ?started.elapsed(),
        "handled"
    );
    resp
}

fn dispatch(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::schools::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::sessions::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::classes::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::people::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::grading::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::scores::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::results::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::setup::try_handle(state, req) {
        return resp;
    }
    if let Some(resp) = handlers::dashboard::try_handle(state, req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
