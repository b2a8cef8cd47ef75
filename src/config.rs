//! Gatesync configuration.
//!
//! All durations are expressed in whole seconds when (de)serialized.

use crate::crypto::digest::parse_sha1_hex;
use crate::protocol::models::PROTOCOL_VERSION;
use crate::GatesyncError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesyncConfig {
    /// Management channel settings.
    pub management: ManagementConfig,

    /// Device reconciliation settings.
    pub reconcile: ReconcileConfig,

    /// Session admission settings.
    pub admission: AdmissionConfig,

    /// Namespace under the platform data directory for the license file.
    pub store_namespace: String,
}

impl Default for GatesyncConfig {
    fn default() -> Self {
        Self {
            management: ManagementConfig::default(),
            reconcile: ReconcileConfig::default(),
            admission: AdmissionConfig::default(),
            store_namespace: "gatesync".to_string(),
        }
    }
}

impl GatesyncConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, GatesyncError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GatesyncError::ConfigError(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub async fn from_file(path: &Path) -> Result<Self, GatesyncError> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatesyncError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), GatesyncError> {
        self.management.validate()?;
        self.reconcile.validate()?;
        self.admission.validate()?;
        if self.store_namespace.is_empty() {
            return Err(GatesyncError::ConfigError(
                "store_namespace cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Management channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// Management server host name.
    pub server_address: String,

    /// Management server TCP port.
    pub server_port: u16,

    /// Evaluate the server certificate chain against the trust store.
    /// When false any chain is accepted unless a certificate is revoked.
    pub authenticated: bool,

    /// Hex SHA-1 digests of pinned trust anchors (DER form).
    pub trusted_digests: Vec<String>,

    /// File with revoked certificate digests, one hex digest per line.
    pub revoked_digests_file: Option<PathBuf>,

    /// Limit for TCP connect and the TLS handshake.
    #[serde(with = "secs")]
    pub connect_timeout: Duration,

    /// Keepalive send interval. Also bounds the whole handshake.
    #[serde(with = "secs")]
    pub keepalive_interval: Duration,

    /// How long to wait for a keepalive or reidentify answer.
    #[serde(with = "secs")]
    pub keepalive_wait: Duration,

    /// Lower clamp for the scheduled reidentify delay.
    #[serde(with = "secs")]
    pub reidentify_min: Duration,

    /// Upper clamp for the scheduled reidentify delay.
    #[serde(with = "secs")]
    pub reidentify_max: Duration,

    /// Recheck deadline written into an invalidated license record.
    #[serde(with = "secs")]
    pub invalidated_recheck: Duration,

    /// Reconnect backoff for the primary connection.
    pub backoff: BackoffConfig,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            server_address: format!("v{}.management.vpnease.com", PROTOCOL_VERSION),
            server_port: 443,
            authenticated: true,
            trusted_digests: vec!["889719910ed019d4bd14b2635e3f7161da57c85f".to_string()],
            revoked_digests_file: Some(PathBuf::from(
                "/var/lib/l2tpgw/management-connection-revoked-certificates.txt",
            )),
            connect_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(5 * 60),
            keepalive_wait: Duration::from_secs(30),
            reidentify_min: Duration::from_secs(5 * 60),
            reidentify_max: Duration::from_secs(24 * 60 * 60),
            invalidated_recheck: Duration::from_secs(60 * 60),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ManagementConfig {
    /// Validate management settings.
    pub fn validate(&self) -> Result<(), GatesyncError> {
        if self.server_address.is_empty() {
            return Err(GatesyncError::ConfigError(
                "server_address cannot be empty".to_string(),
            ));
        }
        if self.reidentify_min > self.reidentify_max {
            return Err(GatesyncError::ConfigError(format!(
                "reidentify_min ({}s) exceeds reidentify_max ({}s)",
                self.reidentify_min.as_secs(),
                self.reidentify_max.as_secs()
            )));
        }
        if self.keepalive_interval.is_zero() || self.keepalive_wait.is_zero() {
            return Err(GatesyncError::ConfigError(
                "keepalive timers must be non-zero".to_string(),
            ));
        }
        for digest in &self.trusted_digests {
            parse_sha1_hex(digest)?;
        }
        self.backoff.validate()
    }
}

/// Exponential reconnect backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay after a failure.
    #[serde(with = "secs")]
    pub initial: Duration,

    /// Multiplier applied per consecutive failure.
    pub factor: f64,

    /// Symmetric relative jitter, in `[0, 1)`.
    pub jitter: f64,

    /// Upper bound for any delay.
    #[serde(with = "secs")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(3),
            factor: 1.5,
            jitter: 0.2,
            max: Duration::from_secs(5 * 60),
        }
    }
}

impl BackoffConfig {
    /// Validate backoff parameters.
    pub fn validate(&self) -> Result<(), GatesyncError> {
        if !(self.factor >= 1.0) {
            return Err(GatesyncError::ConfigError(format!(
                "backoff factor must be >= 1, got {}",
                self.factor
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(GatesyncError::ConfigError(format!(
                "backoff jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        if self.initial > self.max {
            return Err(GatesyncError::ConfigError(
                "backoff initial delay exceeds max delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Device reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Interval between reconciliation rounds.
    #[serde(with = "secs")]
    pub tick: Duration,

    /// A session with no traffic change for longer than this is inactive.
    #[serde(with = "secs")]
    pub idle_interval: Duration,

    /// Consecutive rounds a system device may lack a record before it is killed.
    pub system_failure_limit: u32,

    /// Consecutive rounds a record may lack a system device before it is deleted.
    pub store_failure_limit: u32,

    /// Name prefix of session devices, followed by `<N>-<N>`.
    pub session_device_prefix: String,

    /// Device name of the public link, if any.
    pub public_interface: Option<String>,

    /// Device name of the private link, if any.
    pub private_interface: Option<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            idle_interval: Duration::from_secs(30 * 60),
            system_failure_limit: 3,
            store_failure_limit: 3,
            session_device_prefix: "l2tp".to_string(),
            public_interface: None,
            private_interface: None,
        }
    }
}

impl ReconcileConfig {
    /// Validate reconciliation settings.
    pub fn validate(&self) -> Result<(), GatesyncError> {
        // A single round can see a device before its record is written.
        if self.system_failure_limit < 2 || self.store_failure_limit < 2 {
            return Err(GatesyncError::ConfigError(format!(
                "failure limits must be >= 2, got system={} store={}",
                self.system_failure_limit, self.store_failure_limit
            )));
        }
        if self.tick.is_zero() {
            return Err(GatesyncError::ConfigError(
                "reconcile tick must be non-zero".to_string(),
            ));
        }
        if self.session_device_prefix.is_empty() {
            return Err(GatesyncError::ConfigError(
                "session_device_prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Relative slack on the remote access limit.
    pub leeway: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { leeway: 0.02 }
    }
}

impl AdmissionConfig {
    /// Validate admission settings.
    pub fn validate(&self) -> Result<(), GatesyncError> {
        if !(0.0..1.0).contains(&self.leeway) {
            return Err(GatesyncError::ConfigError(format!(
                "leeway must be in [0, 1), got {}",
                self.leeway
            )));
        }
        Ok(())
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GatesyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.management.keepalive_interval, Duration::from_secs(300));
        assert_eq!(config.reconcile.system_failure_limit, 3);
    }

    #[test]
    fn test_from_json_partial() {
        let config = GatesyncConfig::from_json(
            r#"{"management": {"server_address": "mgmt.example.net", "keepalive_wait": 10},
                "reconcile": {"tick": 30}}"#,
        )
        .unwrap();
        assert_eq!(config.management.server_address, "mgmt.example.net");
        assert_eq!(config.management.keepalive_wait, Duration::from_secs(10));
        assert_eq!(config.management.server_port, 443);
        assert_eq!(config.reconcile.tick, Duration::from_secs(30));
    }

    #[test]
    fn test_failure_limit_below_two_rejected() {
        let mut config = GatesyncConfig::default();
        config.reconcile.store_failure_limit = 1;
        assert!(matches!(
            config.validate(),
            Err(GatesyncError::ConfigError(_))
        ));
    }

    #[test]
    fn test_reidentify_window_inverted_rejected() {
        let mut config = GatesyncConfig::default();
        config.management.reidentify_min = Duration::from_secs(3600);
        config.management.reidentify_max = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_trust_anchor_rejected() {
        let mut config = GatesyncConfig::default();
        config.management.trusted_digests = vec!["not-hex".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_range() {
        let mut config = GatesyncConfig::default();
        config.management.backoff.jitter = 1.0;
        assert!(config.validate().is_err());
    }
}
