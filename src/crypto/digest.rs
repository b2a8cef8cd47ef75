//! SHA-1 certificate fingerprints.
//!
//! Trust anchors and revocations are identified by the SHA-1 digest of the
//! certificate's DER encoding, written as 40 hex characters.

use crate::GatesyncError;
use sha1::{Digest, Sha1};
use tracing::warn;

/// Raw SHA-1 digest of a DER certificate.
pub type CertDigest = [u8; 20];

/// Compute the SHA-1 digest of DER bytes.
pub fn sha1_digest(der: &[u8]) -> CertDigest {
    Sha1::digest(der).into()
}

/// Format a digest as lowercase hex.
pub fn format_sha1_hex(digest: &CertDigest) -> String {
    hex::encode(digest)
}

/// Parse a hex digest.
///
/// Accepts upper or lower case and the colon separated form printed by
/// `openssl x509 -fingerprint`.
///
/// # Errors
/// Returns `ConfigError` unless the input is exactly 20 bytes of hex.
pub fn parse_sha1_hex(s: &str) -> Result<CertDigest, GatesyncError> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ':').collect();
    let mut out = [0u8; 20];
    hex::decode_to_slice(&cleaned, &mut out).map_err(|e| {
        GatesyncError::ConfigError(format!("Invalid SHA-1 digest {:?}: {}", s.trim(), e))
    })?;
    Ok(out)
}

/// Parse a digest list file, one digest per line.
///
/// Blank lines and `#` comments are ignored. Malformed lines are logged
/// and skipped so one bad entry never disables the rest of the list.
pub fn parse_digest_list(text: &str) -> Vec<CertDigest> {
    text.lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            match parse_sha1_hex(line) {
                Ok(digest) => Some(digest),
                Err(e) => {
                    warn!(line = index + 1, error = %e, "skipping malformed digest entry");
                    None
                }
            }
        })
        .collect()
}
