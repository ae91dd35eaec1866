//! Health check endpoint.

use axum::{Json, extract::State};
use serde::Serialize;

use crate::state::DiscoveryState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tokens: usize,
}

/// Basic health check (is the server running?)
pub async fn health_check(State(state): State<DiscoveryState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tokens: state.token_count(),
    })
}
