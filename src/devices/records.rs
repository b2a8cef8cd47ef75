//! Persisted session device and link records.

use crate::meter::counter::TrafficCounters;
use crate::GatesyncError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// How a VPN session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    /// A remote user connected to the gateway.
    RemoteAccess,
    /// This gateway dialed out to another site.
    SiteToSiteClient,
    /// Another site dialed in to this gateway.
    SiteToSiteServer,
}

impl ConnectionType {
    /// License category the session counts against.
    pub fn category(self) -> SessionCategory {
        match self {
            ConnectionType::RemoteAccess => SessionCategory::RemoteAccess,
            ConnectionType::SiteToSiteClient | ConnectionType::SiteToSiteServer => {
                SessionCategory::SiteToSite
            }
        }
    }
}

/// License category for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionCategory {
    /// Remote access sessions.
    RemoteAccess,
    /// Site-to-site sessions, either direction.
    SiteToSite,
}

/// One VPN session device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Kernel device name, unique key.
    pub name: String,
    /// How the session was established.
    pub connection_type: ConnectionType,
    /// Restricted sessions (e.g. license-expired notice) never count.
    pub restricted: bool,
    /// Traffic seen within the idle window.
    pub active: bool,
    /// Received traffic.
    pub rx: TrafficCounters,
    /// Transmitted traffic.
    pub tx: TrafficCounters,
    /// Device MTU if known.
    pub mtu: Option<u32>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Record for a session that just came up.
    pub fn new(
        name: impl Into<String>,
        connection_type: ConnectionType,
        restricted: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            connection_type,
            restricted,
            active: true,
            rx: TrafficCounters::new(now),
            tx: TrafficCounters::new(now),
            mtu: None,
            created_at: now,
        }
    }

    /// Whether the record counts against its category's limit.
    pub fn counts_against_license(&self) -> bool {
        !self.restricted
    }
}

/// Role of a non-session network link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkRole {
    /// Internet facing link.
    Public,
    /// Internal network link.
    Private,
}

/// Statistics for the public or private link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    /// Which link this is.
    pub role: LinkRole,
    /// Kernel device name.
    pub name: String,
    /// Received traffic.
    pub rx: TrafficCounters,
    /// Transmitted traffic.
    pub tx: TrafficCounters,
    /// Device MTU if known.
    pub mtu: Option<u32>,
    /// Hardware address if known.
    pub mac: Option<String>,
}

impl LinkRecord {
    /// First record for a link, rates zero.
    pub fn new(role: LinkRole, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            role,
            name: name.into(),
            rx: TrafficCounters::new(now),
            tx: TrafficCounters::new(now),
            mtu: None,
            mac: None,
        }
    }
}

/// Storage for device and link records.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// All session device records.
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, GatesyncError>;

    /// One session device record by name.
    async fn get_device(&self, name: &str) -> Result<Option<DeviceRecord>, GatesyncError>;

    /// Insert or replace a session device record.
    async fn put_device(&self, record: &DeviceRecord) -> Result<(), GatesyncError>;

    /// Apply `update` to the current version of a record in one step.
    ///
    /// Returns the updated record, or `None` (without calling `update`)
    /// when the record no longer exists.
    async fn update_device(
        &self,
        name: &str,
        update: &mut (dyn for<'r> FnMut(&'r mut DeviceRecord) + Send),
    ) -> Result<Option<DeviceRecord>, GatesyncError>;

    /// Remove a session device record; removing a missing record is not an error.
    async fn delete_device(&self, name: &str) -> Result<(), GatesyncError>;

    /// The link record for a role.
    async fn get_link(&self, role: LinkRole) -> Result<Option<LinkRecord>, GatesyncError>;

    /// Insert or replace a link record.
    async fn put_link(&self, record: &LinkRecord) -> Result<(), GatesyncError>;
}

/// Process-local device store.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<BTreeMap<String, DeviceRecord>>,
    links: Mutex<HashMap<LinkRole, LinkRecord>>,
}

impl MemoryDeviceStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> GatesyncError {
    GatesyncError::Store("device store lock poisoned".to_string())
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, GatesyncError> {
        let devices = self.devices.lock().map_err(poisoned)?;
        Ok(devices.values().cloned().collect())
    }

    async fn get_device(&self, name: &str) -> Result<Option<DeviceRecord>, GatesyncError> {
        let devices = self.devices.lock().map_err(poisoned)?;
        Ok(devices.get(name).cloned())
    }

    async fn put_device(&self, record: &DeviceRecord) -> Result<(), GatesyncError> {
        let mut devices = self.devices.lock().map_err(poisoned)?;
        devices.insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn update_device(
        &self,
        name: &str,
        update: &mut (dyn for<'r> FnMut(&'r mut DeviceRecord) + Send),
    ) -> Result<Option<DeviceRecord>, GatesyncError> {
        let mut devices = self.devices.lock().map_err(poisoned)?;
        Ok(devices.get_mut(name).map(|record| {
            update(record);
            record.clone()
        }))
    }

    async fn delete_device(&self, name: &str) -> Result<(), GatesyncError> {
        let mut devices = self.devices.lock().map_err(poisoned)?;
        devices.remove(name);
        Ok(())
    }

    async fn get_link(&self, role: LinkRole) -> Result<Option<LinkRecord>, GatesyncError> {
        let links = self.links.lock().map_err(poisoned)?;
        Ok(links.get(&role).cloned())
    }

    async fn put_link(&self, record: &LinkRecord) -> Result<(), GatesyncError> {
        let mut links = self.links.lock().map_err(poisoned)?;
        links.insert(record.role, record.clone());
        Ok(())
    }
}
