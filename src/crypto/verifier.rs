//! rustls server certificate verifier backed by the [`TrustStore`].
//!
//! The verifier replaces rustls' WebPKI verifier for the management
//! connection. Chain building still runs through rustls (so signatures are
//! checked), but with the presented certificates whose digests are pinned
//! as the only roots, and every failure is funnelled through
//! [`evaluate`] per certificate.

use crate::crypto::trust::{display_digest, evaluate, ChainErrorClass, PeerCertificate, TrustStore};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{CertificateError, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use std::iter;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum number of certificates accepted in a presented chain.
pub const MAX_CHAIN_DEPTH: usize = 8;

/// Map a rustls error to the class the trust evaluator understands.
pub fn classify_chain_error(err: &Error) -> ChainErrorClass {
    match err {
        Error::InvalidCertificate(cert_err) => match cert_err {
            CertificateError::Expired
            | CertificateError::NotValidYet
            | CertificateError::ExpiredContext { .. }
            | CertificateError::NotValidYetContext { .. } => ChainErrorClass::ValidityPeriod,
            CertificateError::BadSignature => ChainErrorClass::SignatureFailure,
            CertificateError::UnknownIssuer => ChainErrorClass::Untrusted,
            CertificateError::Revoked
            | CertificateError::NotValidForName
            | CertificateError::InvalidPurpose
            | CertificateError::ApplicationVerificationFailure => ChainErrorClass::Rejected,
            _ => ChainErrorClass::Other,
        },
        _ => ChainErrorClass::Other,
    }
}

/// Certificate verifier for the management connection.
#[derive(Debug)]
pub struct ManagementCertVerifier {
    trust: TrustStore,
    authenticated: bool,
    provider: Arc<CryptoProvider>,
}

impl ManagementCertVerifier {
    /// Create a verifier.
    ///
    /// With `authenticated == false` every chain is accepted unless one of
    /// its certificates is revoked.
    pub fn new(trust: TrustStore, authenticated: bool, provider: Arc<CryptoProvider>) -> Self {
        Self {
            trust,
            authenticated,
            provider,
        }
    }

    /// Run generic chain validation rooted at the pinned certificates that
    /// the server presented.
    fn generic_chain_error(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Option<ChainErrorClass> {
        let mut roots = RootCertStore::empty();
        for der in iter::once(end_entity).chain(intermediates.iter()) {
            let cert = PeerCertificate::from_der(der.as_ref(), 0, None);
            if self.trust.is_usable_anchor(&cert.digest) {
                if let Err(e) = roots.add(der.clone()) {
                    debug!(digest = %display_digest(&cert), error = %e, "pinned certificate unusable as root");
                }
            }
        }
        if roots.is_empty() {
            return Some(ChainErrorClass::Untrusted);
        }

        let parsed = match ParsedCertificate::try_from(end_entity) {
            Ok(parsed) => parsed,
            Err(e) => return Some(classify_chain_error(&e)),
        };

        match rustls::client::verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        ) {
            Ok(()) => None,
            Err(e) => {
                debug!(error = %e, "generic chain validation failed");
                Some(classify_chain_error(&e))
            }
        }
    }
}

impl ServerCertVerifier for ManagementCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        let chain_len = 1 + intermediates.len();
        if chain_len > MAX_CHAIN_DEPTH {
            warn!(chain_len, max = MAX_CHAIN_DEPTH, "server certificate chain too long");
            return Err(Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }

        let chain_error = if self.authenticated {
            self.generic_chain_error(end_entity, intermediates, now)
        } else {
            None
        };

        for (depth, der) in iter::once(end_entity).chain(intermediates.iter()).enumerate() {
            let attributed = if depth == 0 { chain_error } else { None };
            let cert = PeerCertificate::from_der(der.as_ref(), depth, attributed);
            let verdict = evaluate(&cert, &self.trust);
            if !verdict.is_accepted() {
                warn!(
                    depth,
                    digest = %display_digest(&cert),
                    verdict = ?verdict,
                    "server certificate rejected"
                );
                return Err(Error::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ));
            }
            debug!(depth, digest = %display_digest(&cert), verdict = ?verdict, "server certificate accepted");
        }

        if !self.authenticated {
            info!("management connection is not authenticated, chain accepted");
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
