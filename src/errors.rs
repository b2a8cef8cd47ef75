//! Gatesync error types.

use crate::protocol::models::RemoteErrorKind;
use std::fmt;
use thiserror::Error;

/// Errors that can occur in the management channel, the stores and the
/// reconciliation machinery.
#[derive(Debug, Error)]
pub enum GatesyncError {
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Local I/O failed (system commands, pid files, revocation list).
    #[error("I/O error: {0}")]
    Io(String),

    /// A device or license store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Persisted license file failed its integrity check.
    #[error("Store tampering detected")]
    StoreTampered,

    /// Malformed frame or unexpected message on the management channel.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// TCP level failure talking to the management server.
    #[error("Management transport error: {0}")]
    Transport(String),

    /// TLS setup or handshake failure not caused by certificate rejection.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The server certificate chain was rejected by the trust evaluator.
    #[error("Certificate rejected: {0}")]
    CertificateRejected(String),

    /// The server answered an RPC with a typed error.
    #[error("Remote error: {kind}")]
    Remote {
        /// Error type reported by the server.
        kind: RemoteErrorKind,
        /// Optional server supplied detail.
        detail: Option<String>,
    },

    /// An operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The management connection is not available.
    #[error("Management connection is not available")]
    Disconnected,

    /// A connection attempt ended before reaching Ready.
    #[error("Management connection failed: {0}")]
    ConnectionFailed(FailureReason),
}

/// Why a management connection attempt or session ended.
///
/// Reported to the [`Master`](crate::manager::Master) on every
/// `connection_down` and used by the supervisor to decide on license
/// invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// TCP connect, TLS handshake or stream I/O failed.
    Transport(String),
    /// The server certificate chain was rejected.
    CertificateRejected(String),
    /// The server answered Version or Identify with a typed error.
    Remote {
        /// Error type reported by the server.
        kind: RemoteErrorKind,
        /// Optional server supplied detail.
        detail: Option<String>,
    },
    /// The peer sent something the session could not interpret.
    ProtocolViolation(String),
    /// The handshake did not finish within one keepalive interval.
    HandshakeTimeout,
    /// A keepalive or reidentify RPC was not answered in time.
    KeepaliveTimeout,
    /// The server closed the connection.
    PeerClosed,
    /// The connection was closed locally on request.
    Disconnected,
}

impl FailureReason {
    /// Whether this failure is an authoritative statement that the
    /// license is no longer valid.
    pub fn invalidates_license(&self) -> bool {
        matches!(
            self,
            FailureReason::Remote {
                kind: RemoteErrorKind::InvalidLicense,
                ..
            }
        )
    }

    /// Whether this failure was requested locally.
    pub fn is_local_disconnect(&self) -> bool {
        matches!(self, FailureReason::Disconnected)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transport(msg) => write!(f, "transport failure: {}", msg),
            FailureReason::CertificateRejected(msg) => {
                write!(f, "server certificate rejected: {}", msg)
            }
            FailureReason::Remote { kind, detail } => match detail {
                Some(detail) => write!(f, "remote error {}: {}", kind, detail),
                None => write!(f, "remote error {}", kind),
            },
            FailureReason::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            FailureReason::HandshakeTimeout => write!(f, "handshake timed out"),
            FailureReason::KeepaliveTimeout => write!(f, "keepalive timed out"),
            FailureReason::PeerClosed => write!(f, "connection closed by server"),
            FailureReason::Disconnected => write!(f, "disconnected"),
        }
    }
}

impl From<GatesyncError> for FailureReason {
    fn from(err: GatesyncError) -> Self {
        match err {
            GatesyncError::CertificateRejected(msg) => FailureReason::CertificateRejected(msg),
            GatesyncError::Remote { kind, detail } => FailureReason::Remote { kind, detail },
            GatesyncError::ProtocolError(msg) => FailureReason::ProtocolViolation(msg),
            GatesyncError::Disconnected => FailureReason::Disconnected,
            GatesyncError::ConnectionFailed(reason) => reason,
            other => FailureReason::Transport(other.to_string()),
        }
    }
}
