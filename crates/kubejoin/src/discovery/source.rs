//! Discovery wire call: fetch the signed bundle from a bootstrap endpoint.

use async_trait::async_trait;
use kubejoin_common::JoinError;
use kubejoin_common::constants::{DISCOVERY_PATH, DISCOVERY_TOKEN_ID_PARAM};

/// Where signed trust bundles come from
#[async_trait]
pub trait ClusterInfoSource: Send + Sync {
    /// Fetch the raw signed envelope for `token_id` from `endpoint` (`host:port`)
    async fn fetch(&self, endpoint: &str, token_id: &str) -> Result<String, JoinError>;
}

/// Unauthenticated HTTP source; trust comes from the envelope signature alone
#[derive(Clone, Default)]
pub struct HttpClusterInfoSource {
    client: reqwest::Client,
}

impl HttpClusterInfoSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterInfoSource for HttpClusterInfoSource {
    async fn fetch(&self, endpoint: &str, token_id: &str) -> Result<String, JoinError> {
        let url = cluster_info_url(endpoint, token_id);
        tracing::debug!(url = %url, "Requesting cluster info");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| JoinError::discovery(format!("failed to request cluster info: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JoinError::discovery(format!(
                "cluster info request returned {status}"
            )));
        }

        response
            .text()
            .await
            .map_err(|e| JoinError::discovery(format!("failed to read cluster info: {e}")))
    }
}

/// Build the discovery URL for an endpoint and token id
pub fn cluster_info_url(endpoint: &str, token_id: &str) -> String {
    format!(
        "http://{}{}?{}={}",
        endpoint,
        DISCOVERY_PATH,
        DISCOVERY_TOKEN_ID_PARAM,
        urlencoding::encode(token_id)
    )
}

/// Rebuild an address as `host:port` with the given port.
///
/// Accepts `host`, `host:port`, `[v6]:port`, bare IPv6, and an optional
/// scheme or path; any port already present is replaced.
pub fn socket_with_port(endpoint: &str, port: u16) -> String {
    let without_scheme = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or_default();

    let host = if let Some(rest) = authority.strip_prefix('[') {
        // [v6] or [v6]:port
        let v6 = rest.split(']').next().unwrap_or_default();
        format!("[{v6}]")
    } else if authority.matches(':').count() > 1 {
        // Bare IPv6 without a port
        format!("[{authority}]")
    } else {
        authority
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string()
    };

    format!("{host}:{port}")
}
