//! Web API
//!
//! ## Responsibilities
//!
//! - REST endpoints for monitors, groups, recordings and logs
//! - Live log feed over WebSocket
//! - HLS playlist/segment serving from shared memory
//!
//! Authentication, templates and the player are external collaborators;
//! this layer is the core's outward surface only.

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let monitors = state.monitor_manager.monitors_info().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "monitors": monitors.len(),
        "running": monitors.iter().filter(|m| m.running).count(),
    }))
}
