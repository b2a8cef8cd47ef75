//! Persisted license parameters.
//!
//! The [`LicenseRecord`] is written only from a successful identify and is
//! replaced as a whole, so an invalidation is never observed half applied.

use crate::protocol::models::{IdentifyResult, LicenseStatus};
use crate::GatesyncError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// License parameters as last confirmed by the management server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseRecord {
    /// License key presented in the identify that produced this record.
    pub license_key: String,
    /// Remote access session limit.
    pub max_remote_access: u32,
    /// Site-to-site session limit.
    pub max_site_to_site: u32,
    /// Start of the validity period.
    pub validity_start: DateTime<Utc>,
    /// End of the validity period.
    pub validity_end: DateTime<Utc>,
    /// Latest time by which the license must be rechecked.
    pub recheck_latest_at: DateTime<Utc>,
    /// Human readable license description.
    pub license_string: String,
    /// Whether this is a demo license.
    pub is_demo: bool,
    /// Demo period start.
    pub demo_start: Option<DateTime<Utc>>,
    /// Demo period end.
    pub demo_end: Option<DateTime<Utc>>,
}

impl LicenseRecord {
    /// Record from a `VALID` identify answer.
    pub fn from_identify(result: &IdentifyResult, license_key: &str) -> Self {
        Self {
            license_key: license_key.to_string(),
            max_remote_access: result.license_max_remote_access_connections,
            max_site_to_site: result.license_max_site_to_site_connections,
            validity_start: result.license_validity_start,
            validity_end: result.license_validity_end,
            recheck_latest_at: result.license_recheck_latest_at,
            license_string: result.license_string.clone(),
            is_demo: result.is_demo_license,
            demo_start: result.demo_validity_start,
            demo_end: result.demo_validity_end,
        }
    }

    /// Record that grants nothing.
    ///
    /// Limits are zero and the validity period ended just before `now`, so
    /// no session is admitted until the next successful identify.
    pub fn invalidated(license_key: &str, now: DateTime<Utc>, recheck_after: Duration) -> Self {
        let recheck = chrono::Duration::from_std(recheck_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        Self {
            license_key: license_key.to_string(),
            max_remote_access: 0,
            max_site_to_site: 0,
            validity_start: now - chrono::Duration::seconds(1),
            validity_end: now - chrono::Duration::seconds(1),
            recheck_latest_at: now + recheck,
            license_string: String::new(),
            is_demo: false,
            demo_start: None,
            demo_end: None,
        }
    }

    /// Whether `now` lies inside the validity period (inclusive).
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.validity_start <= now && now <= self.validity_end
    }
}

/// Storage for the single license record.
#[async_trait]
pub trait LicenseStore: Send + Sync {
    /// Read the record, `None` if nothing was ever stored.
    async fn get_license(&self) -> Result<Option<LicenseRecord>, GatesyncError>;

    /// Replace the record.
    async fn put_license(&self, record: &LicenseRecord) -> Result<(), GatesyncError>;
}

/// Process-local license store.
#[derive(Debug, Default)]
pub struct MemoryLicenseStore {
    record: RwLock<Option<LicenseRecord>>,
}

impl MemoryLicenseStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LicenseStore for MemoryLicenseStore {
    async fn get_license(&self) -> Result<Option<LicenseRecord>, GatesyncError> {
        self.record
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| GatesyncError::Store("license store lock poisoned".to_string()))
    }

    async fn put_license(&self, record: &LicenseRecord) -> Result<(), GatesyncError> {
        let mut guard = self
            .record
            .write()
            .map_err(|_| GatesyncError::Store("license store lock poisoned".to_string()))?;
        *guard = Some(record.clone());
        Ok(())
    }
}

/// What an identify answer did to the stored license.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseUpdate {
    /// Record replaced with the server's parameters.
    Stored,
    /// Record invalidated because the server did not confirm the key.
    Invalidated(LicenseStatus),
}

/// Applies management channel outcomes to the [`LicenseStore`].
pub struct LicenseBook {
    store: Arc<dyn LicenseStore>,
    invalidated_recheck: Duration,
}

impl LicenseBook {
    /// Create a book over a store.
    pub fn new(store: Arc<dyn LicenseStore>, invalidated_recheck: Duration) -> Self {
        Self {
            store,
            invalidated_recheck,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn LicenseStore> {
        &self.store
    }

    /// Current record, if any.
    pub async fn current(&self) -> Result<Option<LicenseRecord>, GatesyncError> {
        self.store.get_license().await
    }

    /// Persist the outcome of a successful identify.
    ///
    /// Only a `VALID` status stores the server's parameters; any other
    /// status invalidates the record.
    pub async fn apply_identify(
        &self,
        result: &IdentifyResult,
        license_key: &str,
        now: DateTime<Utc>,
    ) -> Result<LicenseUpdate, GatesyncError> {
        match result.license_status {
            LicenseStatus::Valid => {
                let record = LicenseRecord::from_identify(result, license_key);
                self.store.put_license(&record).await?;
                info!(
                    remote_access = record.max_remote_access,
                    site_to_site = record.max_site_to_site,
                    valid_until = %record.validity_end,
                    demo = record.is_demo,
                    "license parameters stored"
                );
                Ok(LicenseUpdate::Stored)
            }
            status => {
                warn!(status = ?status, "license not confirmed by server");
                self.write_invalidated(license_key, now).await?;
                Ok(LicenseUpdate::Invalidated(status))
            }
        }
    }

    /// Invalidate the stored license in one write.
    pub async fn invalidate(&self, now: DateTime<Utc>) -> Result<(), GatesyncError> {
        let key = self
            .store
            .get_license()
            .await
            .ok()
            .flatten()
            .map(|record| record.license_key)
            .unwrap_or_default();
        self.write_invalidated(&key, now).await?;
        warn!("license invalidated");
        Ok(())
    }

    async fn write_invalidated(
        &self,
        license_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), GatesyncError> {
        let record = LicenseRecord::invalidated(license_key, now, self.invalidated_recheck);
        self.store.put_license(&record).await
    }
}
