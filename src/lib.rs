//! # Gatesync
//!
//! **Management channel and license reconciliation for VPN gateway
//! appliances.**
//!
//! Gatesync keeps a gateway connected to its vendor's management server
//! over pinned TLS, persists the license parameters the server hands out,
//! and decides whether new VPN sessions fit under those limits.
//!
//! ## Features
//!
//! - **Pinned TLS trust** - the server chain is accepted only through
//!   configured SHA-1 anchors, with a reloadable revocation list
//! - **Supervised channel** - Version/Identify handshake, keepalives,
//!   scheduled reidentify and jittered exponential reconnect
//! - **Device reconciliation** - kernel session devices and persisted
//!   records are reconciled with hysteresis and wrap-safe traffic counters
//! - **Admission** - per-category limits with leeway for remote access
//!
//! ## Quickstart
//!
//! ```no_run
//! use gatesync::{GatesyncConfig, GatewayManager, NullMaster, StaticIdentity};
//! use gatesync::protocol::models::IdentifyArgs;
//! use gatesync::devices::records::SessionCategory;
//! use std::sync::Arc;
//!
//! # async fn run(args: IdentifyArgs) -> Result<(), gatesync::GatesyncError> {
//! let config = GatesyncConfig::default();
//! let identity = Arc::new(StaticIdentity::new("gateway 1.0", args));
//! let manager = GatewayManager::new(config, identity, Arc::new(NullMaster)).await?;
//! manager.start()?;
//!
//! let license = manager.channel().wait_ready().await?;
//! println!("{} remote access sessions", license.license_max_remote_access_connections);
//!
//! if manager.admit_new_session(SessionCategory::RemoteAccess).await {
//!     // bring the session up
//! }
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure model
//!
//! Transport failures, certificate rejection and keepalive timeouts are
//! retried with backoff. Only an explicit `InvalidLicense` from the server
//! invalidates the stored license; being offline never does.

#![deny(missing_docs)]
#![deny(warnings)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Crypto layer
pub mod crypto;

// Protocol layer
pub mod protocol;

// Client layer
pub mod client;

// License persistence
pub mod cache;
pub mod license;

// Metering layer
pub mod meter;

// Session devices
pub mod devices;

// Policy layer
pub mod policy;

// Manager (main public API)
pub mod manager;

// Re-exports for public API
pub use client::session::{ChannelStatus, ConnectionState, IdentitySource, StaticIdentity};
pub use client::supervisor::ManagementChannel;
pub use clock::{Clock, SystemClock};
pub use config::GatesyncConfig;
pub use errors::{FailureReason, GatesyncError};
pub use license::{LicenseRecord, LicenseStore};
pub use manager::{GatewayManager, GatewayParts, Master, NullMaster};
pub use policy::admission::AdmissionGate;

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
