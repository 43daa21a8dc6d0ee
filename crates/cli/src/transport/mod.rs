// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP and WebSocket server surface.

pub mod auth;
pub mod fanout;
pub mod http;
pub mod state;
pub mod ws;
pub mod ws_msg;

pub use state::Store;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

/// Build the worker's router: WebSocket endpoint plus HTTP side-channels.
pub fn build_router(store: Arc<Store>) -> Router {
    Router::new()
        .route("/", get(http::health))
        .route("/health", get(http::health))
        .route("/version", get(http::version))
        .route("/permission", post(http::permission_hook))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(store)
}
