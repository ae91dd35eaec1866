//! Core types shared across kubejoin components.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::JoinError;

const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;
const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Short-lived `id.secret` credential used once to reach a running cluster.
///
/// The id selects the trust bundle on the discovery server; the secret is
/// the key the bundle is signed with and never travels over the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    id: String,
    secret: String,
}

impl BootstrapToken {
    /// Parse a token from its external `id.secret` form
    pub fn parse(raw: &str) -> Result<Self, JoinError> {
        let parts: Vec<&str> = raw.trim().split('.').collect();
        match parts.as_slice() {
            [id, secret] if !id.is_empty() && !secret.is_empty() => Ok(Self {
                id: (*id).to_string(),
                secret: (*secret).to_string(),
            }),
            _ => Err(JoinError::MalformedToken(format!(
                "expected two non-empty dot-separated parts, got {}",
                parts.iter().filter(|p| !p.is_empty()).count()
            ))),
        }
    }

    /// Generate a fresh token from the given random source
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            id: random_token_part(rng, TOKEN_ID_LEN),
            secret: random_token_part(rng, TOKEN_SECRET_LEN),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

fn random_token_part<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

impl fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.secret)
    }
}

impl fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose the secret half
        f.debug_struct("BootstrapToken")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Signed payload carrying the certificate authorities a joining node needs.
///
/// All PEM fields are optional on the wire; which ones are mandatory is
/// decided when the bundle is decoded into trust material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustBundle {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,

    /// API server CA certificate (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_certificate_authority: String,

    /// API server CA private key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_certificate_key: String,

    /// Storage cluster CA certificate (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_certificate_authority: String,

    /// Storage cluster CA private key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etcd_certificate_key: String,

    /// Front proxy CA certificate (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub front_proxy_certificate_authority: String,

    /// Front proxy CA private key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub front_proxy_certificate_key: String,

    /// Service account signing key (PEM)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_private_key: String,

    /// Control-plane endpoints, in the order the initializer listed them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
}

/// A member of the storage cluster as reported by its membership list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: u64,

    /// Empty while the member has been added but not yet started
    pub name: String,

    pub peer_urls: Vec<String>,
}

impl ClusterMember {
    /// An unstarted member has no name yet
    pub fn is_started(&self) -> bool {
        !self.name.is_empty()
    }

    /// The URL used when naming this member in an initial-cluster string
    pub fn primary_peer_url(&self) -> Option<&str> {
        self.peer_urls.first().map(String::as_str)
    }
}

/// Whether the local storage process starts a new cluster or joins one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    Fresh,
    Existing,
}

impl JoinMode {
    /// Value of the `initial-cluster-state` flag
    pub fn initial_cluster_state(&self) -> &'static str {
        match self {
            Self::Fresh => "new",
            Self::Existing => "existing",
        }
    }
}

/// Launch decision for the local storage process, fixed once computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPlan {
    pub mode: JoinMode,

    /// Comma-separated `name=peerURL` pairs
    pub initial_cluster: String,
}

impl JoinPlan {
    pub fn initial_cluster_state(&self) -> &'static str {
        self.mode.initial_cluster_state()
    }
}
