//! Certificate trust evaluation.
//!
//! Generic chain validation cannot express "this CA is trusted even after it
//! expired" or "this certificate is revoked even though it chains fine", so
//! every certificate in the presented chain goes through [`evaluate`] with
//! the outcome of generic validation attached.

use crate::crypto::digest::{format_sha1_hex, parse_digest_list, parse_sha1_hex, sha1_digest, CertDigest};
use crate::GatesyncError;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Class of a generic chain validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainErrorClass {
    /// Certificate expired or not yet valid.
    ValidityPeriod,
    /// A signature in the chain did not verify.
    SignatureFailure,
    /// The chain does not lead to a trusted root.
    Untrusted,
    /// The certificate was explicitly rejected (purpose, name, policy).
    Rejected,
    /// Anything else.
    Other,
}

impl fmt::Display for ChainErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChainErrorClass::ValidityPeriod => "validity period",
            ChainErrorClass::SignatureFailure => "signature failure",
            ChainErrorClass::Untrusted => "untrusted",
            ChainErrorClass::Rejected => "rejected",
            ChainErrorClass::Other => "other",
        };
        f.write_str(s)
    }
}

/// Outcome of evaluating one certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Digest is a pinned trust anchor.
    AcceptedAnchor,
    /// Generic validation only complained about the validity period.
    AcceptedValidityIgnored,
    /// Generic validation passed.
    Accepted,
    /// Digest is on the revocation list.
    RejectedRevoked,
    /// Generic validation failed for a reason that is not overridable.
    RejectedChain(ChainErrorClass),
}

impl Verdict {
    /// Whether the certificate is acceptable.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Verdict::AcceptedAnchor | Verdict::AcceptedValidityIgnored | Verdict::Accepted
        )
    }
}

/// One certificate of the presented chain.
#[derive(Debug, Clone)]
pub struct PeerCertificate {
    /// SHA-1 digest of the DER encoding.
    pub digest: CertDigest,
    /// Position in the chain, 0 is the end-entity certificate.
    pub depth: usize,
    /// Generic validation failure attributed to this certificate.
    pub chain_error: Option<ChainErrorClass>,
}

impl PeerCertificate {
    /// Build from DER bytes.
    pub fn from_der(der: &[u8], depth: usize, chain_error: Option<ChainErrorClass>) -> Self {
        Self {
            digest: sha1_digest(der),
            depth,
            chain_error,
        }
    }
}

/// Pinned trust anchors and revoked certificates.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    anchors: HashSet<CertDigest>,
    revoked: HashSet<CertDigest>,
}

impl TrustStore {
    /// Create a store from raw digests.
    pub fn new(
        anchors: impl IntoIterator<Item = CertDigest>,
        revoked: impl IntoIterator<Item = CertDigest>,
    ) -> Self {
        Self {
            anchors: anchors.into_iter().collect(),
            revoked: revoked.into_iter().collect(),
        }
    }

    /// Load the store for one connection attempt.
    ///
    /// Anchors come from configuration (hex). The revocation file is read
    /// fresh each time; a missing file means nothing is revoked.
    ///
    /// # Errors
    /// `ConfigError` for a malformed anchor, `Io` when the revocation file
    /// exists but cannot be read.
    pub async fn load(
        anchor_hex: &[String],
        revoked_file: Option<&Path>,
    ) -> Result<Self, GatesyncError> {
        let anchors = anchor_hex
            .iter()
            .map(|hex| parse_sha1_hex(hex))
            .collect::<Result<Vec<_>, _>>()?;

        let revoked = match revoked_file {
            None => Vec::new(),
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => parse_digest_list(&text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    info!(path = %path.display(), "no revocation list, nothing revoked");
                    Vec::new()
                }
                Err(e) => {
                    return Err(GatesyncError::Io(format!(
                        "Failed to read revocation list {}: {}",
                        path.display(),
                        e
                    )))
                }
            },
        };

        debug!(anchors = anchors.len(), revoked = revoked.len(), "trust store loaded");
        Ok(Self::new(anchors, revoked))
    }

    /// Whether the digest is pinned.
    pub fn is_anchor(&self, digest: &CertDigest) -> bool {
        self.anchors.contains(digest)
    }

    /// Whether the digest is revoked.
    pub fn is_revoked(&self, digest: &CertDigest) -> bool {
        self.revoked.contains(digest)
    }

    /// Whether the digest is pinned and not revoked.
    pub fn is_usable_anchor(&self, digest: &CertDigest) -> bool {
        self.is_anchor(digest) && !self.is_revoked(digest)
    }
}

/// Decide whether one certificate is acceptable.
///
/// Revocation wins over everything. A pinned anchor is accepted whatever
/// generic validation said. Of the generic failures only the validity
/// period is forgiven.
pub fn evaluate(cert: &PeerCertificate, store: &TrustStore) -> Verdict {
    if store.is_revoked(&cert.digest) {
        return Verdict::RejectedRevoked;
    }
    if store.is_anchor(&cert.digest) {
        return Verdict::AcceptedAnchor;
    }
    match cert.chain_error {
        None => Verdict::Accepted,
        Some(ChainErrorClass::ValidityPeriod) => Verdict::AcceptedValidityIgnored,
        Some(class) => Verdict::RejectedChain(class),
    }
}

/// Log line friendly digest.
pub fn display_digest(cert: &PeerCertificate) -> String {
    format_sha1_hex(&cert.digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(der: &[u8], chain_error: Option<ChainErrorClass>) -> PeerCertificate {
        PeerCertificate::from_der(der, 0, chain_error)
    }

    #[test]
    fn test_revoked_anchor_is_rejected() {
        let c = cert(b"ca", None);
        let store = TrustStore::new([c.digest], [c.digest]);
        assert_eq!(evaluate(&c, &store), Verdict::RejectedRevoked);
    }

    #[test]
    fn test_revoked_rejected_without_generic_error() {
        let c = cert(b"leaf", None);
        let store = TrustStore::new([], [c.digest]);
        assert!(!evaluate(&c, &store).is_accepted());
    }

    #[test]
    fn test_anchor_accepted_despite_any_generic_error() {
        for class in [
            ChainErrorClass::SignatureFailure,
            ChainErrorClass::Untrusted,
            ChainErrorClass::Rejected,
            ChainErrorClass::Other,
            ChainErrorClass::ValidityPeriod,
        ] {
            let c = cert(b"ca", Some(class));
            let store = TrustStore::new([c.digest], []);
            assert_eq!(evaluate(&c, &store), Verdict::AcceptedAnchor);
        }
    }

    #[test]
    fn test_validity_period_forgiven() {
        let c = cert(b"leaf", Some(ChainErrorClass::ValidityPeriod));
        assert_eq!(
            evaluate(&c, &TrustStore::default()),
            Verdict::AcceptedValidityIgnored
        );
    }

    #[test]
    fn test_other_generic_errors_rejected() {
        for class in [
            ChainErrorClass::SignatureFailure,
            ChainErrorClass::Untrusted,
            ChainErrorClass::Rejected,
            ChainErrorClass::Other,
        ] {
            let c = cert(b"leaf", Some(class));
            assert_eq!(
                evaluate(&c, &TrustStore::default()),
                Verdict::RejectedChain(class)
            );
        }
    }

    #[test]
    fn test_clean_certificate_accepted() {
        let c = cert(b"leaf", None);
        assert_eq!(evaluate(&c, &TrustStore::default()), Verdict::Accepted);
    }

    #[tokio::test]
    async fn test_load_missing_revocation_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = TrustStore::load(
            &["889719910ed019d4bd14b2635e3f7161da57c85f".to_string()],
            Some(&dir.path().join("absent.txt")),
        )
        .await
        .unwrap();
        assert!(store.is_anchor(&parse_sha1_hex("889719910ed019d4bd14b2635e3f7161da57c85f").unwrap()));
    }

    #[tokio::test]
    async fn test_load_revocation_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("revoked.txt");
        std::fs::write(&path, "da39a3ee5e6b4b0d3255bfef95601890afd80709\n").unwrap();
        let store = TrustStore::load(&[], Some(&path)).await.unwrap();
        assert!(store.is_revoked(&sha1_digest(b"")));
    }
}
