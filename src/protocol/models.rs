//! Management protocol messages.
//!
//! Every frame on the management channel carries one [`Frame`] encoded as
//! JSON. Requests flow both ways: the gateway sends `Version`, `Identify`,
//! `Keepalive` and `RequestTestLicense`; the server sends `Keepalive` and
//! `RequestReidentify`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version announced in `Version`.
pub const PROTOCOL_VERSION: u32 = 4;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// A request expecting a response or error with the same id.
    Request {
        /// Sender chosen correlation id.
        id: u64,
        /// The call.
        request: Request,
    },
    /// Successful answer to a request.
    Response {
        /// Id of the answered request.
        id: u64,
        /// The result.
        response: Response,
    },
    /// Typed failure answer to a request.
    Error {
        /// Id of the answered request.
        id: u64,
        /// The failure.
        error: RemoteError,
    },
}

/// RPC calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "PascalCase")]
pub enum Request {
    /// Protocol version negotiation, first call after connect.
    Version(VersionArgs),
    /// Gateway identification, answered with license parameters.
    Identify(IdentifyArgs),
    /// Liveness probe, either direction.
    Keepalive,
    /// Server asks the gateway to identify again now.
    RequestReidentify(ReidentifyArgs),
    /// Gateway asks for a demo license key.
    RequestTestLicense,
}

impl Request {
    /// Command name for logging.
    pub fn command(&self) -> &'static str {
        match self {
            Request::Version(_) => "Version",
            Request::Identify(_) => "Identify",
            Request::Keepalive => "Keepalive",
            Request::RequestReidentify(_) => "RequestReidentify",
            Request::RequestTestLicense => "RequestTestLicense",
        }
    }
}

/// RPC results, tagged with the command they answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "PascalCase")]
pub enum Response {
    /// Answer to `Version`.
    Version(VersionReply),
    /// Answer to `Identify`.
    Identify(Box<IdentifyResult>),
    /// Answer to `Keepalive`.
    Keepalive,
    /// Answer to `RequestReidentify`.
    RequestReidentify,
    /// Answer to `RequestTestLicense`.
    RequestTestLicense(TestLicenseReply),
}

/// Arguments of `Version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionArgs {
    /// Protocol version spoken by the gateway.
    pub version: u32,
    /// Free form client description.
    #[serde(default)]
    pub info: String,
}

/// Result of `Version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionReply {
    /// Free form server description.
    #[serde(default)]
    pub info: String,
}

/// Arguments of `Identify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyArgs {
    /// Whether this is the long-lived primary connection.
    pub is_primary: bool,
    /// Configured license key, empty when none.
    pub license_key: String,
    /// Changes on every boot.
    pub boot_uuid: String,
    /// Stable across boots of one installation.
    pub installation_uuid: String,
    /// Opaque value handed out by the server in the previous identify.
    pub cookie_uuid: String,
    /// Local address of the management connection.
    pub address: String,
    /// Local port of the management connection.
    pub port: u16,
    /// Running software version.
    pub software_version: String,
    /// Build details of the running software.
    pub software_build_info: String,
    /// Hardware type string.
    pub hardware_type: String,
    /// Hardware details.
    pub hardware_info: String,
    /// Whether automatic updates are enabled.
    pub automatic_updates: bool,
    /// Whether the gateway runs from a live CD.
    pub is_live_cd: bool,
}

/// License status reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LicenseStatus {
    /// License is active.
    Valid,
    /// License was disabled by the vendor.
    Disabled,
    /// Server does not know the key, or sent something unrecognized.
    #[serde(other)]
    Unknown,
}

/// Result of `Identify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyResult {
    /// Server build description.
    #[serde(default)]
    pub software_build_info: String,
    /// Server description.
    #[serde(default)]
    pub server_info: String,
    /// Value to present in the next identify.
    #[serde(default)]
    pub cookie_uuid: String,
    /// Gateway address as seen by the server.
    pub client_address_seen_by_server: String,
    /// Gateway port as seen by the server.
    pub client_port_seen_by_server: u16,
    /// Server's opinion on whether the gateway is behind NAT.
    pub behind_nat: bool,
    /// Remote access session limit.
    pub license_max_remote_access_connections: u32,
    /// Site-to-site session limit.
    pub license_max_site_to_site_connections: u32,
    /// Start of the license validity period.
    pub license_validity_start: DateTime<Utc>,
    /// End of the license validity period.
    pub license_validity_end: DateTime<Utc>,
    /// Latest time by which the gateway must identify again.
    pub license_recheck_latest_at: DateTime<Utc>,
    /// Human readable license description.
    #[serde(default)]
    pub license_string: String,
    /// Status of the presented license key.
    pub license_status: LicenseStatus,
    /// Whether the gateway runs on a demo license.
    #[serde(default)]
    pub is_demo_license: bool,
    /// Start of the demo period, if any.
    #[serde(default)]
    pub demo_validity_start: Option<DateTime<Utc>>,
    /// End of the demo period, if any.
    #[serde(default)]
    pub demo_validity_end: Option<DateTime<Utc>>,
    /// Server wall clock at answer time.
    pub current_utc_time: DateTime<Utc>,
    /// A newer software version exists.
    #[serde(default)]
    pub update_available: bool,
    /// The running version must be updated.
    #[serde(default)]
    pub update_needed: bool,
    /// The update should be applied right away.
    #[serde(default)]
    pub update_immediately: bool,
    /// The update is applied regardless of local settings.
    #[serde(default)]
    pub update_forced: bool,
    /// Change log of the available update.
    #[serde(default)]
    pub change_log: String,
}

/// Arguments of `RequestReidentify`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReidentifyArgs {
    /// Why the server wants a fresh identify.
    #[serde(default)]
    pub reason: String,
}

/// Result of `RequestTestLicense`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestLicenseReply {
    /// Granted demo license key.
    pub license_key: String,
}

/// Typed remote errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Server does not speak the announced protocol version.
    UnsupportedProtocolVersion,
    /// Server side failure.
    InternalServer,
    /// Call not allowed in the current connection state.
    ProtocolState,
    /// License key is invalid.
    InvalidLicense,
    /// License key is not known to the server.
    UnknownLicense,
    /// Demo license was not granted.
    TestLicenseDenied,
    /// Error type not known to this client.
    #[serde(other)]
    Unrecognized,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error type.
    pub kind: RemoteErrorKind,
    /// Optional detail message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RemoteError {
    /// Error without detail.
    pub fn new(kind: RemoteErrorKind) -> Self {
        Self { kind, detail: None }
    }
}

/// Observed connectivity, refreshed on every successful identify.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectivityStatus {
    /// Whether the management connection is Ready.
    pub connected: bool,
    /// Server's opinion on whether the gateway is behind NAT.
    pub behind_nat: bool,
    /// Public address as seen by the server.
    pub public_address: Option<String>,
    /// Public port as seen by the server.
    pub public_port: Option<u16>,
    /// Server wall clock from the last identify.
    pub server_time: Option<DateTime<Utc>>,
    /// Update flags from the last identify.
    pub update: UpdateFlags,
}

/// Software update flags from the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateFlags {
    /// A newer version exists.
    pub available: bool,
    /// The running version must be updated.
    pub needed: bool,
    /// Update right away.
    pub immediately: bool,
    /// Update regardless of local settings.
    pub forced: bool,
}

impl ConnectivityStatus {
    /// Connectivity as implied by an identify result.
    pub fn from_identify(result: &IdentifyResult) -> Self {
        Self {
            connected: true,
            behind_nat: result.behind_nat,
            public_address: Some(result.client_address_seen_by_server.clone()),
            public_port: Some(result.client_port_seen_by_server),
            server_time: Some(result.current_utc_time),
            update: UpdateFlags {
                available: result.update_available,
                needed: result.update_needed,
                immediately: result.update_immediately,
                forced: result.update_forced,
            },
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_identify_result(now: DateTime<Utc>) -> IdentifyResult {
    IdentifyResult {
        software_build_info: "server-build".to_string(),
        server_info: "test server".to_string(),
        cookie_uuid: "cookie-1".to_string(),
        client_address_seen_by_server: "198.51.100.7".to_string(),
        client_port_seen_by_server: 40123,
        behind_nat: true,
        license_max_remote_access_connections: 10,
        license_max_site_to_site_connections: 2,
        license_validity_start: now - chrono::Duration::days(1),
        license_validity_end: now + chrono::Duration::days(30),
        license_recheck_latest_at: now + chrono::Duration::minutes(10),
        license_string: "10 remote access / 2 site-to-site".to_string(),
        license_status: LicenseStatus::Valid,
        is_demo_license: false,
        demo_validity_start: None,
        demo_validity_end: None,
        current_utc_time: now,
        update_available: false,
        update_needed: false,
        update_immediately: false,
        update_forced: false,
        change_log: String::new(),
    }
}
