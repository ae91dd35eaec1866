//! Trust bundle codec.
//!
//! Verification and completeness are separate steps: a bundle that fails
//! its signature is a per-response problem (the endpoint is retried), while
//! a correctly signed bundle without the storage cluster CA means the
//! cluster itself is misconfigured.

use kubejoin_common::constants::{CLUSTER_INFO_API_VERSION, CLUSTER_INFO_KIND, cert_names};
use kubejoin_common::{JoinError, TrustBundle};

use super::jws;
use crate::pki::{CertificateAuthority, CertificateStore, parse_certificate_pem};

/// Certificate material decoded from a verified bundle
#[derive(Debug, Clone)]
pub struct TrustMaterial {
    pub api_ca_cert: Option<String>,
    pub api_ca_key: Option<String>,
    pub etcd_ca: CertificateAuthority,
    pub front_proxy_ca_cert: Option<String>,
    pub front_proxy_ca_key: Option<String>,
    pub service_account_key: Option<String>,
    pub endpoints: Vec<String>,
}

/// Verify a signed bundle envelope with the token secret and decode it
pub fn parse_and_verify(raw: &str, token_secret: &str) -> Result<TrustBundle, JoinError> {
    jws::verify(raw, token_secret.as_bytes())
}

/// Decode every certificate authority carried by a verified bundle.
///
/// The storage cluster CA certificate and key are mandatory; the rest are
/// decoded when present.
pub fn decode_material(bundle: &TrustBundle) -> Result<TrustMaterial, JoinError> {
    if bundle.etcd_certificate_authority.is_empty() {
        return Err(JoinError::IncompleteBundle(
            "no storage cluster CA certificate".into(),
        ));
    }
    if bundle.etcd_certificate_key.is_empty() {
        return Err(JoinError::IncompleteBundle("no storage cluster CA key".into()));
    }

    let etcd_ca =
        CertificateAuthority::from_pem(&bundle.etcd_certificate_authority, &bundle.etcd_certificate_key)
            .map_err(|e| JoinError::verification(format!("storage cluster CA: {e}")))?;

    Ok(TrustMaterial {
        api_ca_cert: optional_cert(&bundle.api_certificate_authority, "API server CA")?,
        api_ca_key: optional_key(&bundle.api_certificate_key, "API server CA key")?,
        etcd_ca,
        front_proxy_ca_cert: optional_cert(
            &bundle.front_proxy_certificate_authority,
            "front proxy CA",
        )?,
        front_proxy_ca_key: optional_key(&bundle.front_proxy_certificate_key, "front proxy CA key")?,
        service_account_key: optional_key(
            &bundle.service_account_private_key,
            "service account key",
        )?,
        endpoints: bundle.endpoints.clone(),
    })
}

/// Assemble a bundle from the authorities in a certificates directory.
///
/// The API server and storage cluster CAs are required; the front proxy CA
/// and service account key are included when present.
pub fn bundle_from_store(
    store: &CertificateStore,
    endpoints: Vec<String>,
) -> Result<TrustBundle, JoinError> {
    let api_ca = store.load_authority(cert_names::CA)?;
    let etcd_ca = store.load_authority(cert_names::ETCD_CA)?;
    let front_proxy_ca = optional(store.load_authority(cert_names::FRONT_PROXY_CA))?;
    let service_account_key = optional(store.load_key(cert_names::SERVICE_ACCOUNT))?;

    Ok(TrustBundle {
        kind: CLUSTER_INFO_KIND.to_string(),
        api_version: CLUSTER_INFO_API_VERSION.to_string(),
        api_certificate_authority: api_ca.cert_pem().to_string(),
        api_certificate_key: api_ca.key_pem().to_string(),
        etcd_certificate_authority: etcd_ca.cert_pem().to_string(),
        etcd_certificate_key: etcd_ca.key_pem().to_string(),
        front_proxy_certificate_authority: front_proxy_ca
            .as_ref()
            .map(|ca| ca.cert_pem().to_string())
            .unwrap_or_default(),
        front_proxy_certificate_key: front_proxy_ca
            .as_ref()
            .map(|ca| ca.key_pem().to_string())
            .unwrap_or_default(),
        service_account_private_key: service_account_key.unwrap_or_default(),
        endpoints,
    })
}

/// Sign a bundle with a token secret
pub fn sign_bundle(bundle: &TrustBundle, token_secret: &str) -> Result<String, JoinError> {
    jws::sign(bundle, token_secret.as_bytes())
}

fn optional<T>(result: Result<T, JoinError>) -> Result<Option<T>, JoinError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(JoinError::CertificateNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn optional_cert(pem: &str, what: &str) -> Result<Option<String>, JoinError> {
    if pem.is_empty() {
        return Ok(None);
    }
    parse_certificate_pem(pem).map_err(|e| JoinError::verification(format!("{what}: {e}")))?;
    Ok(Some(pem.to_string()))
}

fn optional_key(pem: &str, what: &str) -> Result<Option<String>, JoinError> {
    if pem.is_empty() {
        return Ok(None);
    }
    let block = ::pem::parse(pem.as_bytes())
        .map_err(|e| JoinError::verification(format!("{what}: {e}")))?;
    if !block.tag().ends_with("PRIVATE KEY") {
        return Err(JoinError::verification(format!(
            "{what}: expected a private key, found {}",
            block.tag()
        )));
    }
    Ok(Some(pem.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    pub(crate) fn complete_bundle() -> TrustBundle {
        let api_ca = CertificateAuthority::new("kubernetes").unwrap();
        let etcd_ca = CertificateAuthority::new("etcd-ca").unwrap();
        TrustBundle {
            api_certificate_authority: api_ca.cert_pem().to_string(),
            api_certificate_key: api_ca.key_pem().to_string(),
            etcd_certificate_authority: etcd_ca.cert_pem().to_string(),
            etcd_certificate_key: etcd_ca.key_pem().to_string(),
            endpoints: vec!["https://10.0.0.1:6443".into()],
            ..Default::default()
        }
    }

    #[test]
    fn bundle_verifies_with_token_secret() {
        let bundle = complete_bundle();
        let envelope = sign_bundle(&bundle, "0123456789abcdef").unwrap();

        let verified = assert_ok!(parse_and_verify(&envelope, "0123456789abcdef"));
        assert_eq!(verified, bundle);
    }

    #[test]
    fn bundle_signed_with_other_secret_fails_verification() {
        let envelope = sign_bundle(&complete_bundle(), "0123456789abcdef").unwrap();

        let err = assert_err!(parse_and_verify(&envelope, "fedcba9876543210"));
        assert!(matches!(err, JoinError::Verification(_)));
    }

    #[test]
    fn foreign_payload_fails_verification() {
        let envelope = jws::sign(&serde_json::json!({"kind": 7}), b"secret").unwrap();
        let err = assert_err!(parse_and_verify(&envelope, "secret"));
        assert!(matches!(err, JoinError::Verification(_)));
    }

    #[test]
    fn missing_etcd_ca_is_incomplete_not_unverified() {
        let strips: [fn(&mut TrustBundle); 2] = [
            |b| b.etcd_certificate_authority.clear(),
            |b| b.etcd_certificate_key.clear(),
        ];
        for strip in strips {
            let mut bundle = complete_bundle();
            strip(&mut bundle);
            let envelope = sign_bundle(&bundle, "secret").unwrap();

            let verified = assert_ok!(parse_and_verify(&envelope, "secret"));
            let err = assert_err!(decode_material(&verified));
            assert!(matches!(err, JoinError::IncompleteBundle(_)));
        }
    }

    #[test]
    fn optional_authorities_may_be_absent() {
        let mut bundle = complete_bundle();
        bundle.api_certificate_authority.clear();
        bundle.api_certificate_key.clear();

        let material = assert_ok!(decode_material(&bundle));
        assert!(material.api_ca_cert.is_none());
        assert!(material.front_proxy_ca_cert.is_none());
        assert!(material.service_account_key.is_none());
        assert_eq!(material.endpoints, vec!["https://10.0.0.1:6443".to_string()]);
    }

    #[test]
    fn corrupt_optional_certificate_fails_verification() {
        let mut bundle = complete_bundle();
        bundle.front_proxy_certificate_authority = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n".into();

        let err = assert_err!(decode_material(&bundle));
        assert!(matches!(err, JoinError::Verification(_)));
    }

    #[test]
    fn bundle_is_assembled_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let api_ca = CertificateAuthority::new("kubernetes").unwrap();
        let etcd_ca = CertificateAuthority::new("etcd-ca").unwrap();
        store
            .write_cert_and_key(cert_names::CA, api_ca.cert_pem(), Some(api_ca.key_pem()))
            .unwrap();
        store
            .write_cert_and_key(cert_names::ETCD_CA, etcd_ca.cert_pem(), Some(etcd_ca.key_pem()))
            .unwrap();

        let bundle =
            bundle_from_store(&store, vec!["https://10.0.0.1:6443".into()]).unwrap();
        assert_eq!(bundle.kind, "ClusterInfo");
        assert_eq!(bundle.etcd_certificate_authority, etcd_ca.cert_pem());
        assert!(bundle.front_proxy_certificate_authority.is_empty());
        assert!(bundle.service_account_private_key.is_empty());
    }

    #[test]
    fn bundle_requires_storage_ca_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let api_ca = CertificateAuthority::new("kubernetes").unwrap();
        store
            .write_cert_and_key(cert_names::CA, api_ca.cert_pem(), Some(api_ca.key_pem()))
            .unwrap();

        let err = assert_err!(bundle_from_store(&store, vec![]));
        assert!(matches!(err, JoinError::CertificateNotFound(_)));
    }
}
