pub mod cli;
pub mod config;
pub mod handlers;
pub mod meeting_id;
pub mod registry;
pub mod telemetry;
pub mod websocket;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, new_meeting_id, render_metrics};
use crate::registry::RoomRegistry;
use crate::websocket::websocket_handler;

/// State shared by every route; the registry is built once per process.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(RoomRegistry::new()))
    }

    pub fn with_registry(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/api/meeting-id", get(new_meeting_id))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
