//! `api` crate: HTTP REST API layer.
//!
//! Exposes:
//!   POST   /api/v1/workflows/:id/trigger-instances
//!   GET    /api/v1/workflows/:id/active-instances
//!   DELETE /api/v1/workflows/:id
//!   GET    /api/v1/trigger-instances/:id
//!   POST   /api/v1/trigger-instances/:id/cancel
//!   GET    /api/v1/trigger-instances/:id/executions

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use engine::{TriggerInstanceManager, WorkflowRemover};

pub mod error;
pub mod handlers;

pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TriggerInstanceManager>,
    pub workflows: Arc<dyn WorkflowRemover>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/workflows/:id/trigger-instances",
            post(handlers::trigger_instances::create),
        )
        .route(
            "/api/v1/workflows/:id/active-instances",
            get(handlers::workflows::active_instances),
        )
        .route(
            "/api/v1/workflows/:id",
            axum::routing::delete(handlers::workflows::delete),
        )
        .route(
            "/api/v1/trigger-instances/:id",
            get(handlers::trigger_instances::get),
        )
        .route(
            "/api/v1/trigger-instances/:id/cancel",
            post(handlers::trigger_instances::cancel),
        )
        .route(
            "/api/v1/trigger-instances/:id/executions",
            get(handlers::trigger_instances::executions),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(addr: &str, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}
