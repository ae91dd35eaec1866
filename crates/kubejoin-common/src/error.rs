//! Error taxonomy shared by the discovery and membership subsystems.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while joining a node to the cluster
#[derive(Debug, Clone, Error)]
pub enum JoinError {
    /// Bootstrap token is not of the form `id.secret`
    #[error("Malformed bootstrap token: {0}")]
    MalformedToken(String),

    /// Signed envelope or its payload failed verification
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Verified bundle lacks material required for issuance
    #[error("Incomplete trust bundle: {0}")]
    IncompleteBundle(String),

    /// Could not reach or read from a bootstrap endpoint
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// No discovery endpoint produced a verified bundle in time
    #[error("Discovery timed out after {timeout:?}")]
    DiscoveryTimeout { timeout: Duration },

    /// Storage cluster membership RPC failed
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Reading, writing, or issuing certificate material failed
    #[error("Certificate I/O error: {0}")]
    CertificateIo(String),

    /// Requested certificate or key does not exist on disk
    #[error("Certificate not found: {}", .0.display())]
    CertificateNotFound(PathBuf),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl JoinError {
    /// Returns true if this failure ends endpoint discovery for every candidate.
    ///
    /// Anything else is local to the endpoint that produced it and retried.
    pub fn aborts_discovery(&self) -> bool {
        matches!(self, Self::MalformedToken(_) | Self::CertificateIo(_))
    }

    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }

    pub fn certificate_io(msg: impl Into<String>) -> Self {
        Self::CertificateIo(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_local_fatal_failures_abort_discovery() {
        assert!(JoinError::certificate_io("disk full").aborts_discovery());
        assert!(JoinError::MalformedToken("abc".into()).aborts_discovery());

        // A bad or stale response from one endpoint must not stop the others
        assert!(!JoinError::IncompleteBundle("no etcd key".into()).aborts_discovery());
        assert!(!JoinError::verification("mac mismatch").aborts_discovery());
        assert!(!JoinError::discovery("timeout").aborts_discovery());
    }

    #[test]
    fn timeout_message_names_duration() {
        let err = JoinError::DiscoveryTimeout {
            timeout: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "Discovery timed out after 300s");
    }
}
