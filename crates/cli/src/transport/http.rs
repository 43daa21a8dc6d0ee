// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP side-channels: health, version, and the Agent permission hook.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::transport::auth::validate_bearer;
use crate::transport::state::Store;

/// Maximum accepted `POST /permission` body.
pub const PERMISSION_BODY_CAP: usize = 64 * 1024;

/// `GET /` and `GET /health` — unauthenticated liveness probe.
pub async fn health(State(store): State<Arc<Store>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "mode": store.manager.default_variant().as_str(),
    }))
}

/// `GET /version` — bearer-authenticated build identity.
pub async fn version(
    State(store): State<Arc<Store>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if validate_bearer(&headers, store.settings.token.as_deref()).is_err() {
        return (StatusCode::FORBIDDEN, Json(json!({"error": "unauthorized"})));
    }
    (
        StatusCode::OK,
        Json(json!({
            "version": store.version.version,
            "gitCommit": store.version.git_commit,
            "gitBranch": store.version.git_branch,
            "uptime": store.uptime_secs(),
        })),
    )
}

#[derive(Debug, Deserialize)]
struct HookRequest {
    tool_name: String,
    #[serde(default)]
    tool_input: Value,
    /// Agent-side conversation id, used to find the owning session.
    #[serde(default)]
    session_id: Option<String>,
}

/// Removes the pending entry if the response is never produced (the hook
/// connection closed while the prompt was still waiting).
struct HookGuard {
    store: Arc<Store>,
    request_id: String,
    armed: bool,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if self.armed {
            self.store.broker.abandon(&self.request_id);
        }
    }
}

/// `POST /permission` — the Agent's pre-tool-use hook.
///
/// Held open until a client decides, the 5-minute timeout denies, or the
/// caller goes away. Oversize bodies are answered `413 {decision:"deny"}`.
pub async fn permission_hook(
    State(store): State<Arc<Store>>,
    headers: HeaderMap,
    body: Body,
) -> impl IntoResponse {
    if validate_bearer(&headers, store.settings.token.as_deref()).is_err() {
        return (StatusCode::FORBIDDEN, Json(json!({"decision": "deny"})));
    }

    let bytes = match axum::body::to_bytes(body, PERMISSION_BODY_CAP).await {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!("permission hook body over {PERMISSION_BODY_CAP} bytes, denying");
            return (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({"decision": "deny"})));
        }
    };
    let request: HookRequest = match serde_json::from_slice(&bytes) {
        Ok(req) => req,
        Err(e) => {
            debug!(err = %e, "malformed permission hook body, denying");
            return (StatusCode::OK, Json(json!({"decision": "deny"})));
        }
    };

    let Some(session_id) =
        store.manager.session_for_upstream(request.session_id.as_deref()).await
    else {
        debug!(tool = %request.tool_name, "no session matches hook, denying");
        return (StatusCode::OK, Json(json!({"decision": "deny"})));
    };

    let (request_id, decision_rx) =
        store
            .broker
            .create_permission(&session_id, &request.tool_name, request.tool_input);
    let mut guard = HookGuard { store: Arc::clone(&store), request_id, armed: true };

    let decision = match decision_rx.await {
        Ok(decision) => decision,
        Err(_) => crate::broker::Decision::Deny,
    };
    guard.armed = false;

    (StatusCode::OK, Json(json!({"decision": decision.as_str()})))
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
