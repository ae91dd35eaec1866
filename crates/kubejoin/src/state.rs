//! Discovery server state.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use kubejoin_common::{BootstrapToken, JoinError, TrustBundle};

use crate::discovery::{bundle_from_store, sign_bundle};
use crate::pki::CertificateStore;

/// Shared state of the discovery server
#[derive(Clone)]
pub struct DiscoveryState {
    /// Unsigned bundle served to every joiner
    pub bundle: Arc<TrustBundle>,

    /// Token id to token secret
    tokens: Arc<HashMap<String, String>>,
}

impl DiscoveryState {
    pub fn new(bundle: TrustBundle, tokens: impl IntoIterator<Item = BootstrapToken>) -> Self {
        let tokens = tokens
            .into_iter()
            .map(|t| (t.id().to_string(), t.secret().to_string()))
            .collect();
        Self {
            bundle: Arc::new(bundle),
            tokens: Arc::new(tokens),
        }
    }

    /// Build the bundle from the authorities in a certificates directory
    pub fn from_store(
        store: &CertificateStore,
        tokens: Vec<BootstrapToken>,
        endpoints: Vec<String>,
    ) -> Result<Self> {
        let bundle = bundle_from_store(store, endpoints).with_context(|| {
            format!("Failed to load cluster authorities from {}", store.dir().display())
        })?;
        Ok(Self::new(bundle, tokens))
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Signed envelope for a token id, or `None` if the id is unknown
    pub fn signed_bundle(&self, token_id: &str) -> Option<Result<String, JoinError>> {
        self.tokens
            .get(token_id)
            .map(|secret| sign_bundle(&self.bundle, secret))
    }
}
