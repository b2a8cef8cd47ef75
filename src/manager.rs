//! Gateway manager - the main public API for gatesync.
//!
//! The `GatewayManager` wires the pieces of a gateway's control plane:
//! - The supervised management channel (handshake, keepalive, reidentify)
//! - The device reconciler running on a fixed tick
//! - The admission gate consulted when a VPN session is set up

use crate::cache::file::FileLicenseStore;
use crate::client::session::{IdentitySource, SessionContext};
use crate::client::supervisor::ManagementChannel;
use crate::client::transport::{Connector, TlsManagementConnector};
use crate::clock::{Clock, SystemClock};
use crate::config::GatesyncConfig;
use crate::devices::reconcile::DeviceReconciler;
use crate::devices::records::{DeviceStore, MemoryDeviceStore, SessionCategory};
use crate::devices::system::{IpLinkDevices, SystemDevices};
use crate::errors::FailureReason;
use crate::license::{LicenseBook, LicenseStore};
use crate::policy::admission::AdmissionGate;
use crate::protocol::models::IdentifyResult;
use crate::GatesyncError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

/// Receiver of management connection events.
///
/// All methods default to doing nothing.
#[async_trait]
pub trait Master: Send + Sync {
    /// The handshake completed.
    async fn connection_up(&self, _result: &IdentifyResult) {}

    /// A connection or connection attempt ended.
    async fn connection_down(&self, _reason: &FailureReason) {}

    /// A reidentify on the live connection succeeded.
    async fn reidentified(&self, _result: &IdentifyResult) {}
}

/// Master that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMaster;

impl Master for NullMaster {}

/// Collaborators of a [`GatewayManager`].
pub struct GatewayParts {
    /// License persistence.
    pub license_store: Arc<dyn LicenseStore>,
    /// Device and link records.
    pub device_store: Arc<dyn DeviceStore>,
    /// Kernel device access.
    pub system: Arc<dyn SystemDevices>,
    /// Management transport.
    pub connector: Arc<dyn Connector>,
    /// Handshake arguments.
    pub identity: Arc<dyn IdentitySource>,
    /// Connection event sink.
    pub master: Arc<dyn Master>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
}

/// Main control-plane manager for a gateway.
///
/// Create one instance per gateway process.
pub struct GatewayManager {
    config: GatesyncConfig,
    license: Arc<LicenseBook>,
    devices: Arc<dyn DeviceStore>,
    system: Arc<dyn SystemDevices>,
    clock: Arc<dyn Clock>,
    channel: ManagementChannel,
    admission: AdmissionGate,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayManager {
    /// Create a manager with the production collaborators.
    ///
    /// Uses the system clock, the file-backed license store under the
    /// platform data directory, an in-memory device store, `ip link` for
    /// the kernel device list and TLS for the management channel.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Configuration validation fails
    /// - The license store directory cannot be created
    pub async fn new(
        config: GatesyncConfig,
        identity: Arc<dyn IdentitySource>,
        master: Arc<dyn Master>,
    ) -> Result<Self, GatesyncError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let license_store = FileLicenseStore::new(&config.store_namespace, clock.clone()).await?;
        let parts = GatewayParts {
            license_store: Arc::new(license_store),
            device_store: Arc::new(MemoryDeviceStore::new()),
            system: Arc::new(IpLinkDevices::new()),
            connector: Arc::new(TlsManagementConnector::new(config.management.clone())),
            identity,
            master,
            clock,
        };
        Self::from_parts(config, parts)
    }

    /// Create a manager over caller supplied collaborators.
    ///
    /// # Errors
    /// Returns an error if configuration validation fails.
    pub fn from_parts(config: GatesyncConfig, parts: GatewayParts) -> Result<Self, GatesyncError> {
        config.validate()?;

        let license = Arc::new(LicenseBook::new(
            parts.license_store.clone(),
            config.management.invalidated_recheck,
        ));
        let ctx = SessionContext::new(
            license.clone(),
            parts.master,
            parts.identity,
            parts.clock.clone(),
        );
        let channel = ManagementChannel::new(config.management.clone(), ctx, parts.connector);
        let admission = AdmissionGate::new(
            parts.device_store.clone(),
            parts.license_store,
            parts.clock.clone(),
            config.admission.leeway,
        );

        Ok(Self {
            config,
            license,
            devices: parts.device_store,
            system: parts.system,
            clock: parts.clock,
            channel,
            admission,
            reconciler: Mutex::new(None),
        })
    }

    /// Start the primary management channel and the device reconciler.
    ///
    /// Calling `start` again while running does nothing.
    pub fn start(&self) -> Result<(), GatesyncError> {
        self.channel.start_primary()?;

        let mut reconciler = self
            .reconciler
            .lock()
            .map_err(|_| GatesyncError::Io("reconciler lock poisoned".to_string()))?;
        if reconciler.is_none() {
            let job = DeviceReconciler::new(
                self.config.reconcile.clone(),
                self.system.clone(),
                self.devices.clone(),
                self.clock.clone(),
            );
            *reconciler = Some(job.spawn());
        }
        info!("gateway manager started");
        Ok(())
    }

    /// Stop the management channel and the reconciler.
    pub async fn stop(&self) {
        let reconciler = match self.reconciler.lock() {
            Ok(mut reconciler) => reconciler.take(),
            Err(_) => None,
        };
        if let Some(job) = reconciler {
            job.abort();
            let _ = job.await;
        }
        self.channel.stop().await;
        info!("gateway manager stopped");
    }

    /// Whether a new session of `category` may start now.
    ///
    /// Requires a valid license and room under the category's limit.
    pub async fn admit_new_session(&self, category: SessionCategory) -> bool {
        self.admission.admit_new_session(category).await
    }

    /// The management channel.
    pub fn channel(&self) -> &ManagementChannel {
        &self.channel
    }

    /// The admission gate.
    pub fn admission(&self) -> &AdmissionGate {
        &self.admission
    }

    /// License persistence.
    pub fn license(&self) -> &Arc<LicenseBook> {
        &self.license
    }

    /// Device and link records.
    pub fn device_store(&self) -> &Arc<dyn DeviceStore> {
        &self.devices
    }

    /// Get the current configuration.
    pub fn config(&self) -> &GatesyncConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{harness, now, serve, Script, ServerLog};
    use crate::client::transport::BoxedStream;
    use crate::clock::MockClock;
    use crate::devices::records::{ConnectionType, DeviceRecord};
    use crate::devices::system::SystemDevice;
    use crate::license::MemoryLicenseStore;
    use tokio::sync::mpsc;

    struct ScriptedConnector {
        log: Arc<ServerLog>,
        push: Mutex<Vec<mpsc::UnboundedSender<crate::protocol::models::Request>>>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<BoxedStream, GatesyncError> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let (push, push_rx) = mpsc::unbounded_channel();
            self.push.lock().unwrap().push(push);
            tokio::spawn(serve(server, Script::default(), self.log.clone(), push_rx));
            Ok(Box::new(client))
        }
    }

    #[derive(Default)]
    struct NoDevices;

    #[async_trait]
    impl SystemDevices for NoDevices {
        async fn snapshot(&self) -> Result<Vec<SystemDevice>, GatesyncError> {
            Ok(Vec::new())
        }

        async fn kill_device(&self, _name: &str) -> Result<(), GatesyncError> {
            Ok(())
        }
    }

    fn manager(config: GatesyncConfig) -> Result<GatewayManager, GatesyncError> {
        let h = harness();
        let parts = GatewayParts {
            license_store: Arc::new(MemoryLicenseStore::new()),
            device_store: Arc::new(MemoryDeviceStore::new()),
            system: Arc::new(NoDevices),
            connector: Arc::new(ScriptedConnector {
                log: Arc::new(ServerLog::default()),
                push: Mutex::new(Vec::new()),
            }),
            identity: h.ctx.identity.clone(),
            master: Arc::new(NullMaster),
            clock: Arc::new(MockClock::new(now())),
        };
        GatewayManager::from_parts(config, parts)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = GatesyncConfig::default();
        config.reconcile.system_failure_limit = 1;
        assert!(matches!(
            manager(config),
            Err(GatesyncError::ConfigError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_admission_before_identify() {
        let manager = manager(GatesyncConfig::default()).unwrap();
        assert!(!manager.admit_new_session(SessionCategory::RemoteAccess).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_identify_admit_stop() {
        let manager = manager(GatesyncConfig::default()).unwrap();
        manager.start().unwrap();
        manager.start().unwrap();

        let result = manager.channel().wait_ready().await.unwrap();
        assert_eq!(result.license_max_remote_access_connections, 10);
        assert!(manager.admit_new_session(SessionCategory::RemoteAccess).await);

        for i in 0..2 {
            let record = DeviceRecord::new(
                format!("l2tp0-{}", i),
                ConnectionType::SiteToSiteClient,
                false,
                now(),
            );
            manager.device_store().put_device(&record).await.unwrap();
        }
        assert!(!manager.admit_new_session(SessionCategory::SiteToSite).await);

        manager.stop().await;
        assert!(manager.channel().status().stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciler_prunes_stale_records() {
        let manager = manager(GatesyncConfig::default()).unwrap();
        let record = DeviceRecord::new("l2tp0-1", ConnectionType::RemoteAccess, false, now());
        manager.device_store().put_device(&record).await.unwrap();

        manager.start().unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(5 * 60)).await;
        assert!(manager.device_store().list_devices().await.unwrap().is_empty());
        manager.stop().await;
    }
}
