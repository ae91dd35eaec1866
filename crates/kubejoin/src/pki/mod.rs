//! Certificate authorities and certificate issuance.
//!
//! Authorities arrive in the trust bundle (or, on the initializing node,
//! already sit in the certificates directory). Every certificate a joining
//! node needs is derived locally from them; the node never asks the cluster
//! to sign anything.

mod store;

pub use store::{CertificateStore, WriteOutcome};

use chrono::{Datelike, Duration as ChronoDuration, Utc};
use kubejoin_common::JoinError;
use kubejoin_common::constants::cert_names;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType, string::Ia5String,
};

const CA_VALIDITY_DAYS: i64 = 3650;
const ISSUED_VALIDITY_DAYS: i64 = 365;
const MAX_ORGANIZATIONS: usize = 2;
const ORGANIZATION_NAME_OID: [u64; 4] = [2, 5, 4, 10];

/// Extended key usages an issued certificate may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    ClientAuth,
    ServerAuth,
}

impl KeyUsage {
    fn purpose(self) -> rcgen::ExtendedKeyUsagePurpose {
        match self {
            Self::ClientAuth => rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            Self::ServerAuth => rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        }
    }
}

/// Subject and usages of a certificate to issue.
///
/// Issuance applies exactly these fields; nothing is filled in implicitly.
#[derive(Debug, Clone, Default)]
pub struct CertSpec {
    pub common_name: String,
    pub organizations: Vec<String>,
    pub usages: Vec<KeyUsage>,
    /// DNS names or IP addresses
    pub alt_names: Vec<String>,
}

/// A freshly issued certificate and its private key, both PEM
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Certificate authority able to sign derived certificates
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed authority
    pub fn new(common_name: &str) -> Result<Self, JoinError> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()
            .map_err(|e| JoinError::certificate_io(format!("failed to generate CA key: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| JoinError::certificate_io(format!("failed to create CA cert: {e}")))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load an authority from PEM, validating both halves and that the key
    /// belongs to the certificate
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, JoinError> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| JoinError::certificate_io(format!("failed to parse CA key: {e}")))?;
        let der = parse_certificate_pem(cert_pem)?;
        let (_, cert) = x509_parser::parse_x509_certificate(&der)
            .map_err(|e| JoinError::certificate_io(format!("invalid X.509 certificate: {e}")))?;
        if cert.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
            return Err(JoinError::certificate_io(
                "CA key does not match the CA certificate",
            ));
        }

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Issue a certificate with a fresh key pair, signed by this authority
    pub fn issue(&self, spec: &CertSpec) -> Result<IssuedCertificate, JoinError> {
        issue(&self.cert_pem, &self.key_pem, spec)
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

/// Issue a certificate signed by the given authority certificate and key
pub fn issue(
    authority_cert_pem: &str,
    authority_key_pem: &str,
    spec: &CertSpec,
) -> Result<IssuedCertificate, JoinError> {
    if spec.common_name.is_empty() {
        return Err(JoinError::certificate_io("certificate common name is empty"));
    }
    if spec.organizations.len() > MAX_ORGANIZATIONS {
        return Err(JoinError::certificate_io(format!(
            "at most {MAX_ORGANIZATIONS} organizations per certificate are supported, got {}",
            spec.organizations.len()
        )));
    }

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(spec.common_name.clone()));
    // rcgen keeps one value per attribute type, so the second O attribute
    // goes in under its raw OID
    let org_types = [
        DnType::OrganizationName,
        DnType::CustomDnType(ORGANIZATION_NAME_OID.to_vec()),
    ];
    for (ty, org) in org_types.into_iter().zip(&spec.organizations) {
        dn.push(ty, DnValue::Utf8String(org.clone()));
    }
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = spec.usages.iter().map(|u| u.purpose()).collect();
    params.subject_alt_names = spec
        .alt_names
        .iter()
        .map(|name| san_for(name))
        .collect::<Result<Vec<_>, _>>()?;
    set_validity(&mut params, ISSUED_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
        .map_err(|e| JoinError::certificate_io(format!("failed to generate key: {e}")))?;

    let ca_key = KeyPair::from_pem(authority_key_pem)
        .map_err(|e| JoinError::certificate_io(format!("failed to load CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(authority_cert_pem, &ca_key)
        .map_err(|e| JoinError::certificate_io(format!("failed to create issuer: {e}")))?;

    let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
        JoinError::certificate_io(format!("failed to sign {}: {e}", spec.common_name))
    })?;

    Ok(IssuedCertificate {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Issue the storage cluster serving and peer certificates for this node.
///
/// Both are written first-write-only, so a restarted node keeps its identity.
pub fn issue_member_certificates(
    store: &CertificateStore,
    etcd_ca: &CertificateAuthority,
    node_name: &str,
    advertise_address: &str,
) -> Result<Vec<WriteOutcome>, JoinError> {
    let alt_names = vec![
        node_name.to_string(),
        "localhost".to_string(),
        advertise_address.to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];

    let server = etcd_ca.issue(&CertSpec {
        common_name: node_name.to_string(),
        organizations: vec![],
        usages: vec![KeyUsage::ServerAuth, KeyUsage::ClientAuth],
        alt_names: alt_names.clone(),
    })?;
    let peer = etcd_ca.issue(&CertSpec {
        common_name: node_name.to_string(),
        organizations: vec![],
        usages: vec![KeyUsage::ServerAuth, KeyUsage::ClientAuth],
        alt_names,
    })?;

    Ok(vec![
        store.write_cert_and_key(cert_names::ETCD_SERVER, &server.cert_pem, Some(&server.key_pem))?,
        store.write_cert_and_key(cert_names::ETCD_PEER, &peer.cert_pem, Some(&peer.key_pem))?,
    ])
}

/// Create the cluster authorities and service account key on a first node.
///
/// Existing material is kept, so this is safe to rerun.
pub fn init_authorities(
    store: &CertificateStore,
) -> Result<Vec<(&'static str, WriteOutcome)>, JoinError> {
    let mut outcomes = Vec::new();
    for (base_name, common_name) in [
        (cert_names::CA, "kubernetes"),
        (cert_names::ETCD_CA, "etcd-ca"),
        (cert_names::FRONT_PROXY_CA, "front-proxy-ca"),
    ] {
        let outcome = if store.cert_path(base_name).exists() {
            WriteOutcome::AlreadyPresent
        } else {
            let ca = CertificateAuthority::new(common_name)?;
            store.write_cert_and_key(base_name, ca.cert_pem(), Some(ca.key_pem()))?
        };
        outcomes.push((base_name, outcome));
    }

    let outcome = if store.key_path(cert_names::SERVICE_ACCOUNT).exists() {
        WriteOutcome::AlreadyPresent
    } else {
        let key = KeyPair::generate()
            .map_err(|e| JoinError::certificate_io(format!("failed to generate key: {e}")))?;
        store.write_key(cert_names::SERVICE_ACCOUNT, &key.serialize_pem())?
    };
    outcomes.push((cert_names::SERVICE_ACCOUNT, outcome));

    Ok(outcomes)
}

/// Parse a PEM certificate and return its DER bytes
pub fn parse_certificate_pem(cert_pem: &str) -> Result<Vec<u8>, JoinError> {
    let block = ::pem::parse(cert_pem.as_bytes())
        .map_err(|e| JoinError::certificate_io(format!("failed to parse PEM: {e}")))?;
    if block.tag() != "CERTIFICATE" {
        return Err(JoinError::certificate_io(format!(
            "expected CERTIFICATE block, found {}",
            block.tag()
        )));
    }
    let der = block.contents().to_vec();
    x509_parser::parse_x509_certificate(&der)
        .map_err(|e| JoinError::certificate_io(format!("invalid X.509 certificate: {e}")))?;
    Ok(der)
}

fn san_for(name: &str) -> Result<SanType, JoinError> {
    if let Ok(ip) = name.parse::<std::net::IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| JoinError::certificate_io(format!("invalid DNS name '{name}': {e}")))
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    // Backdate a day to tolerate clock skew between nodes
    let not_before = Utc::now() - ChronoDuration::days(1);
    let not_after = not_before + ChronoDuration::days(days);
    params.not_before = rcgen::date_time_ymd(
        not_before.year(),
        not_before.month() as u8,
        not_before.day() as u8,
    );
    params.not_after = rcgen::date_time_ymd(
        not_after.year(),
        not_after.month() as u8,
        not_after.day() as u8,
    );
}
