//! Concierge server - bounded-context task router with human approval gating

pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod models;
pub mod store;
pub mod websocket;

use axum::{routing::get, Router};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Orchestrator;

/// Application state shared across handlers
pub struct AppState {
    pub store: store::Store,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(pool: SqlitePool, orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        Arc::new(Self {
            store: store::Store::new(pool),
            orchestrator,
        })
    }
}

/// HTTP routes: health check and the WebSocket endpoint
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket::handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
