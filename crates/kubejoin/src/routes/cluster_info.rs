//! Signed cluster info endpoint, polled by joining nodes.

use axum::{
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::state::DiscoveryState;

#[derive(Deserialize)]
pub struct ClusterInfoQuery {
    /// Id half of the joiner's bootstrap token
    #[serde(rename = "token-id")]
    token_id: Option<String>,
}

/// Serve the trust bundle signed with the secret of the requested token
///
/// Returns:
/// - 200: Compact JWS envelope
/// - 400: No token id given
/// - 404: Unknown token id
pub async fn get_cluster_info(
    State(state): State<DiscoveryState>,
    Query(params): Query<ClusterInfoQuery>,
) -> Response {
    let Some(token_id) = params.token_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing token-id").into_response();
    };

    match state.signed_bundle(&token_id) {
        Some(Ok(envelope)) => {
            tracing::debug!(token_id = %token_id, "Serving cluster info");
            ([(header::CONTENT_TYPE, "application/jose")], envelope).into_response()
        }
        Some(Err(e)) => {
            tracing::error!(token_id = %token_id, error = %e, "Failed to sign cluster info");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        None => {
            tracing::warn!(token_id = %token_id, "Cluster info requested for unknown token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
