//! Bootstrap discovery and trust establishment.
//!
//! Implements:
//! - Signed trust bundle codec (JWS/HS256 keyed by the token secret)
//! - Discovery wire call against candidate control-plane endpoints
//! - Endpoint race with a single committed winner
//! - Persisting the winning trust material and issuing the storage client cert

pub mod bundle;
pub mod jws;
pub mod race;
pub mod source;

pub use bundle::{TrustMaterial, bundle_from_store, decode_material, parse_and_verify, sign_bundle};
pub use race::{RaceConfig, RaceWinner, race_endpoints};
pub use source::{ClusterInfoSource, HttpClusterInfoSource, socket_with_port};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kubejoin_common::constants::{cert_names, subjects};
use kubejoin_common::{BootstrapToken, JoinError};

use crate::pki::{CertSpec, CertificateStore, KeyUsage, WriteOutcome};

/// Discovery parameters
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// Port the discovery service listens on
    pub port: u16,
    pub retry_interval: Duration,
    pub timeout: Duration,
}

/// What a successful bootstrap produced
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
    /// Discovery socket that served the winning bundle
    pub endpoint: String,
    /// Control-plane endpoints advertised by the bundle
    pub cluster_endpoints: Vec<String>,
    /// Files created by this run; pre-existing material is left untouched
    pub created: Vec<PathBuf>,
    pub elapsed: Duration,
}

/// Establish trust with a running cluster using a bootstrap token.
///
/// The token is parsed before any I/O. Every candidate endpoint is raced;
/// the first verified and complete bundle is persisted exactly once, and
/// the storage cluster client certificate is issued from its CA.
pub async fn perform_tls_bootstrap(
    token: &str,
    endpoints: &[String],
    settings: &DiscoverySettings,
    source: Arc<dyn ClusterInfoSource>,
    store: &CertificateStore,
) -> Result<DiscoveryOutcome, JoinError> {
    let token = BootstrapToken::parse(token)?;
    let start = Instant::now();

    let sockets: Vec<String> = endpoints
        .iter()
        .map(|endpoint| socket_with_port(endpoint, settings.port))
        .collect();
    tracing::info!(endpoints = ?sockets, token_id = %token.id(), "Starting bootstrap discovery");

    let token = Arc::new(token);
    let race_config = RaceConfig {
        retry_interval: settings.retry_interval,
        timeout: settings.timeout,
    };
    let winner = race_endpoints(&sockets, &race_config, move |endpoint| {
        let source = source.clone();
        let token = token.clone();
        async move {
            let raw = source.fetch(&endpoint, token.id()).await?;
            let bundle = parse_and_verify(&raw, token.secret())?;
            tracing::debug!(endpoint = %endpoint, "Cluster info signature and contents are valid");
            decode_material(&bundle)
        }
    })
    .await?;
    tracing::debug!(
        endpoint = %winner.endpoint,
        attempts = winner.attempts,
        elapsed = ?winner.elapsed,
        "Discovery race won"
    );

    let created = persist_material(store, &winner.value)?;

    let outcome = DiscoveryOutcome {
        endpoint: winner.endpoint,
        cluster_endpoints: winner.value.endpoints,
        created,
        elapsed: start.elapsed(),
    };
    tracing::info!(
        endpoint = %outcome.endpoint,
        files = outcome.created.len(),
        elapsed = ?outcome.elapsed,
        "Trust established with cluster"
    );
    Ok(outcome)
}

/// Write the trust material and issue the storage cluster client certificate.
///
/// All writes are first-write-only; returns the paths actually created.
pub fn persist_material(
    store: &CertificateStore,
    material: &TrustMaterial,
) -> Result<Vec<PathBuf>, JoinError> {
    let mut created = Vec::new();
    let mut record = |outcome: WriteOutcome, path: PathBuf| {
        if outcome == WriteOutcome::Created {
            created.push(path);
        }
    };

    if let Some(cert) = &material.api_ca_cert {
        let outcome =
            store.write_cert_and_key(cert_names::CA, cert, material.api_ca_key.as_deref())?;
        record(outcome, store.cert_path(cert_names::CA));
    }

    let etcd_ca = &material.etcd_ca;
    let outcome = store.write_cert_and_key(
        cert_names::ETCD_CA,
        etcd_ca.cert_pem(),
        Some(etcd_ca.key_pem()),
    )?;
    record(outcome, store.cert_path(cert_names::ETCD_CA));

    if let Some(cert) = &material.front_proxy_ca_cert {
        let outcome = store.write_cert_and_key(
            cert_names::FRONT_PROXY_CA,
            cert,
            material.front_proxy_ca_key.as_deref(),
        )?;
        record(outcome, store.cert_path(cert_names::FRONT_PROXY_CA));
    }

    if let Some(key) = &material.service_account_key {
        let outcome = store.write_key(cert_names::SERVICE_ACCOUNT, key)?;
        record(outcome, store.key_path(cert_names::SERVICE_ACCOUNT));
    }

    // Issue from the CA now on disk, which may predate this bootstrap
    let etcd_ca = store.load_authority(cert_names::ETCD_CA)?;
    if !store.cert_path(cert_names::ETCD_CLIENT).exists() {
        let client = etcd_ca.issue(&CertSpec {
            common_name: subjects::ETCD_CLIENT_COMMON_NAME.to_string(),
            organizations: vec![subjects::NODES_GROUP.to_string()],
            usages: vec![KeyUsage::ClientAuth],
            alt_names: vec![],
        })?;
        let outcome = store.write_cert_and_key(
            cert_names::ETCD_CLIENT,
            &client.cert_pem,
            Some(&client.key_pem),
        )?;
        record(outcome, store.cert_path(cert_names::ETCD_CLIENT));
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::CertificateAuthority;
    use async_trait::async_trait;
    use kubejoin_common::TrustBundle;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::assert_err;

    const TOKEN: &str = "abcdef.0123456789abcdef";

    /// Serves a fixed envelope and counts calls
    struct StaticSource {
        envelope: Result<String, String>,
        calls: AtomicU32,
    }

    impl StaticSource {
        fn serving(envelope: String) -> Arc<Self> {
            Arc::new(Self {
                envelope: Ok(envelope),
                calls: AtomicU32::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                envelope: Err("connection refused".into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ClusterInfoSource for StaticSource {
        async fn fetch(&self, _endpoint: &str, token_id: &str) -> Result<String, JoinError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(token_id, "abcdef");
            self.envelope.clone().map_err(JoinError::discovery)
        }
    }

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            port: 9898,
            retry_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(300),
        }
    }

    fn endpoints() -> Vec<String> {
        vec!["10.0.0.1:6443".into(), "10.0.0.2:6443".into()]
    }

    #[tokio::test]
    async fn malformed_token_fails_before_any_network_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let source = StaticSource::failing();

        for token in ["", "abcdef", "abcdef.", ".secret"] {
            let err = assert_err!(
                perform_tls_bootstrap(token, &endpoints(), &settings(), source.clone(), &store)
                    .await
            );
            assert!(matches!(err, JoinError::MalformedToken(_)));
        }
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn verified_bundle_is_persisted_and_client_cert_issued() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let bundle = bundle::tests::complete_bundle();
        let source = StaticSource::serving(sign_bundle(&bundle, "0123456789abcdef").unwrap());

        let outcome = perform_tls_bootstrap(TOKEN, &endpoints(), &settings(), source, &store)
            .await
            .unwrap();

        assert!(outcome.endpoint.ends_with(":9898"));
        assert_eq!(outcome.cluster_endpoints, bundle.endpoints);
        assert_eq!(store.load_cert(cert_names::CA).unwrap(), bundle.api_certificate_authority);
        assert_eq!(
            store.load_cert(cert_names::ETCD_CA).unwrap(),
            bundle.etcd_certificate_authority
        );
        assert!(store.cert_path(cert_names::ETCD_CLIENT).exists());
        assert!(store.key_path(cert_names::ETCD_CLIENT).exists());
        assert!(outcome.created.contains(&store.cert_path(cert_names::ETCD_CLIENT)));
    }

    #[tokio::test]
    async fn wrong_secret_keeps_retrying_until_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let bundle = bundle::tests::complete_bundle();
        let source = StaticSource::serving(sign_bundle(&bundle, "someothersecret0").unwrap());

        let err = assert_err!(
            perform_tls_bootstrap(TOKEN, &endpoints(), &settings(), source.clone(), &store).await
        );
        assert!(matches!(err, JoinError::DiscoveryTimeout { .. }));
        assert!(source.calls() > 2, "endpoints should have been retried");
        assert!(!store.cert_path(cert_names::ETCD_CA).exists());
    }

    #[tokio::test]
    async fn incomplete_bundle_is_retried_until_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let mut bundle = bundle::tests::complete_bundle();
        bundle.etcd_certificate_key.clear();
        let source = StaticSource::serving(sign_bundle(&bundle, "0123456789abcdef").unwrap());

        let err = assert_err!(
            perform_tls_bootstrap(TOKEN, &endpoints(), &settings(), source.clone(), &store).await
        );
        assert!(matches!(err, JoinError::DiscoveryTimeout { .. }));
        assert!(source.calls() > 2, "endpoints should have been retried");
        assert!(!store.cert_path(cert_names::ETCD_CA).exists());
    }

    #[test]
    fn rerun_keeps_existing_authority_and_client_cert() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());

        let first = decode_material(&bundle::tests::complete_bundle()).unwrap();
        let created = persist_material(&store, &first).unwrap();
        assert!(created.contains(&store.cert_path(cert_names::ETCD_CA)));
        let client_cert = store.load_cert(cert_names::ETCD_CLIENT).unwrap();

        let second = decode_material(&bundle::tests::complete_bundle()).unwrap();
        let created = persist_material(&store, &second).unwrap();
        assert!(created.is_empty());

        assert_eq!(
            store.load_cert(cert_names::ETCD_CA).unwrap(),
            first.etcd_ca.cert_pem()
        );
        assert_eq!(store.load_cert(cert_names::ETCD_CLIENT).unwrap(), client_cert);
    }

    #[test]
    fn service_account_and_front_proxy_are_written_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let front_proxy = CertificateAuthority::new("front-proxy-ca").unwrap();
        let sa = CertificateAuthority::new("sa").unwrap();

        let bundle = TrustBundle {
            front_proxy_certificate_authority: front_proxy.cert_pem().to_string(),
            front_proxy_certificate_key: front_proxy.key_pem().to_string(),
            service_account_private_key: sa.key_pem().to_string(),
            ..bundle::tests::complete_bundle()
        };
        let material = decode_material(&bundle).unwrap();
        persist_material(&store, &material).unwrap();

        assert_eq!(
            store.load_cert(cert_names::FRONT_PROXY_CA).unwrap(),
            front_proxy.cert_pem()
        );
        assert_eq!(store.load_key(cert_names::SERVICE_ACCOUNT).unwrap(), sa.key_pem());
    }
}
