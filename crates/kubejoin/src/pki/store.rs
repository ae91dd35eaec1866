//! On-disk certificate storage.
//!
//! Material is only ever created, never replaced: a node that already holds
//! an authority keeps it even if a later bootstrap attempt brings a
//! different one. Files are written in full to a temporary name and then
//! linked into place with no-replace semantics, so a reader never sees a
//! truncated file and concurrent writers cannot clobber each other.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use kubejoin_common::JoinError;

use super::CertificateAuthority;

const CERT_MODE: u32 = 0o644;
const KEY_MODE: u32 = 0o600;

/// Result of a first-write-only store operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    AlreadyPresent,
}

/// Certificates directory with fixed base names per role
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self, base_name: &str) -> PathBuf {
        self.dir.join(format!("{base_name}.crt"))
    }

    pub fn key_path(&self, base_name: &str) -> PathBuf {
        self.dir.join(format!("{base_name}.key"))
    }

    /// Load a certificate authority pair
    pub fn load_authority(&self, base_name: &str) -> Result<CertificateAuthority, JoinError> {
        let cert = self.load_cert(base_name)?;
        let key = self.load_key(base_name)?;
        CertificateAuthority::from_pem(&cert, &key)
    }

    pub fn load_cert(&self, base_name: &str) -> Result<String, JoinError> {
        read_pem(&self.cert_path(base_name))
    }

    pub fn load_key(&self, base_name: &str) -> Result<String, JoinError> {
        read_pem(&self.key_path(base_name))
    }

    /// Write a certificate and optional key unless the pair already exists.
    ///
    /// A pair is published whole or not at all: a key without its
    /// certificate (or a certificate missing the key being supplied) is a
    /// `CertificateIo` error rather than something to complete.
    pub fn write_cert_and_key(
        &self,
        base_name: &str,
        cert_pem: &str,
        key_pem: Option<&str>,
    ) -> Result<WriteOutcome, JoinError> {
        let cert_path = self.cert_path(base_name);
        let key_path = self.key_path(base_name);

        match (cert_path.exists(), key_path.exists()) {
            (true, false) if key_pem.is_some() => return Err(half_pair(&cert_path, &key_path)),
            (true, _) => {
                tracing::debug!(path = %cert_path.display(), "Certificate already present, keeping it");
                return Ok(WriteOutcome::AlreadyPresent);
            }
            (false, true) => return Err(half_pair(&cert_path, &key_path)),
            (false, false) => {}
        }

        // Whoever publishes the key owns the pair
        if let Some(key_pem) = key_pem {
            if publish(&key_path, key_pem, KEY_MODE)? == WriteOutcome::AlreadyPresent {
                tracing::debug!(path = %key_path.display(), "Pair written concurrently, keeping it");
                return Ok(WriteOutcome::AlreadyPresent);
            }
        }

        let outcome = publish(&cert_path, cert_pem, CERT_MODE);
        if key_pem.is_some() && !matches!(outcome, Ok(WriteOutcome::Created)) {
            if let Err(e) = fs::remove_file(&key_path) {
                tracing::error!(path = %key_path.display(), error = %e, "Failed to remove orphaned key");
            }
        }
        let outcome = outcome?;

        if outcome == WriteOutcome::Created {
            tracing::info!(path = %cert_path.display(), "Wrote certificate");
        }
        Ok(outcome)
    }

    /// Write a standalone private key unless it already exists
    pub fn write_key(&self, base_name: &str, key_pem: &str) -> Result<WriteOutcome, JoinError> {
        let key_path = self.key_path(base_name);
        let outcome = publish(&key_path, key_pem, KEY_MODE)?;
        if outcome == WriteOutcome::Created {
            tracing::info!(path = %key_path.display(), "Wrote key");
        }
        Ok(outcome)
    }
}

fn half_pair(cert_path: &Path, key_path: &Path) -> JoinError {
    JoinError::certificate_io(format!(
        "incomplete pair on disk: {} and {} must both exist or both be absent",
        cert_path.display(),
        key_path.display()
    ))
}

fn read_pem(path: &Path) -> Result<String, JoinError> {
    fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => JoinError::CertificateNotFound(path.to_path_buf()),
        _ => JoinError::certificate_io(format!("failed to read {}: {e}", path.display())),
    })
}

/// Write `contents` to a temporary file next to `path`, then link it into
/// place without replacing anything already there.
fn publish(path: &Path, contents: &str, mode: u32) -> Result<WriteOutcome, JoinError> {
    let Some(parent) = path.parent() else {
        return Err(JoinError::certificate_io(format!(
            "{} has no parent directory",
            path.display()
        )));
    };
    fs::create_dir_all(parent).map_err(|e| {
        JoinError::certificate_io(format!("failed to create {}: {e}", parent.display()))
    })?;

    let mut file = tempfile::Builder::new()
        .prefix(".kubejoin-")
        .tempfile_in(parent)
        .map_err(|e| {
            JoinError::certificate_io(format!("failed to create temp file in {}: {e}", parent.display()))
        })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| JoinError::certificate_io(format!("failed to set mode on {}: {e}", path.display())))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    file.write_all(contents.as_bytes())
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| JoinError::certificate_io(format!("failed to write {}: {e}", path.display())))?;

    match file.persist_noclobber(path) {
        Ok(_) => Ok(WriteOutcome::Created),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(WriteOutcome::AlreadyPresent),
        Err(e) => Err(JoinError::certificate_io(format!(
            "failed to publish {}: {}",
            path.display(),
            e.error
        ))),
    }
}
