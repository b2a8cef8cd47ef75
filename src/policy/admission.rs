//! Session admission against license limits.
//!
//! This module decides whether a new VPN session may start based on:
//! - License validity (now within the validity period)
//! - Per-category session counts from the device records
//! - The license limit for the category, with leeway for remote access
//!
//! Counting includes inactive sessions: a session that went quiet still
//! holds a kernel device and can resume at any time.

use crate::clock::Clock;
use crate::devices::records::{DeviceStore, SessionCategory};
use crate::license::{LicenseRecord, LicenseStore};
use crate::GatesyncError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Products within this distance above an integer round down to it.
const LEEWAY_EPSILON: f64 = 1e-9;

/// Apply relative leeway to a limit, rounding up.
///
/// `add_leeway(10, 0.02) == 11`; a zero limit stays zero. The product is
/// nudged down by [`LEEWAY_EPSILON`] before rounding so binary
/// representation error (`10 * 1.1 == 11.000000000000002`) does not grant
/// an extra session.
pub fn add_leeway(limit: u32, leeway: f64) -> u32 {
    let scaled = f64::from(limit) * (1.0 + leeway) - LEEWAY_EPSILON;
    scaled.ceil().max(0.0) as u32
}

/// Session count and limits for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCount {
    /// Non-restricted sessions currently recorded.
    pub count: u32,
    /// License limit.
    pub limit: u32,
    /// License limit with leeway applied.
    pub limit_with_leeway: u32,
}

impl SessionCount {
    /// Whether one more session of `category` fits.
    ///
    /// Remote access gets the leeway; site-to-site does not, because
    /// site-to-site tunnels are torn down promptly when they drop.
    pub fn admits(&self, category: SessionCategory) -> bool {
        match category {
            SessionCategory::RemoteAccess => self.count < self.limit_with_leeway,
            SessionCategory::SiteToSite => self.count < self.limit,
        }
    }
}

/// Counts for both categories, gathered in one store pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BothCounts {
    /// Remote access sessions.
    pub remote_access: SessionCount,
    /// Site-to-site sessions.
    pub site_to_site: SessionCount,
}

impl BothCounts {
    /// The count for a category.
    pub fn get(&self, category: SessionCategory) -> SessionCount {
        match category {
            SessionCategory::RemoteAccess => self.remote_access,
            SessionCategory::SiteToSite => self.site_to_site,
        }
    }
}

/// Demo license state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoStatus {
    /// Whether a demo license is in effect.
    pub is_demo: bool,
    /// When the demo ends.
    pub expires_at: Option<DateTime<Utc>>,
    /// Time left, never negative.
    pub remaining: Option<chrono::Duration>,
}

impl DemoStatus {
    fn not_demo() -> Self {
        Self {
            is_demo: false,
            expires_at: None,
            remaining: None,
        }
    }
}

/// Admission decisions over the device and license stores.
pub struct AdmissionGate {
    devices: Arc<dyn DeviceStore>,
    license: Arc<dyn LicenseStore>,
    clock: Arc<dyn Clock>,
    leeway: f64,
}

impl AdmissionGate {
    /// Create a gate.
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        license: Arc<dyn LicenseStore>,
        clock: Arc<dyn Clock>,
        leeway: f64,
    ) -> Self {
        Self {
            devices,
            license,
            clock,
            leeway,
        }
    }

    /// Count both categories.
    ///
    /// A missing license record counts as limits of zero.
    pub async fn count_both(&self) -> Result<BothCounts, GatesyncError> {
        let record = self.license.get_license().await?;
        let (limit, s2s_limit) = record
            .as_ref()
            .map(|r| (r.max_remote_access, r.max_site_to_site))
            .unwrap_or((0, 0));

        let mut count = 0u32;
        let mut s2s_count = 0u32;
        for device in self.devices.list_devices().await? {
            if !device.counts_against_license() {
                continue;
            }
            match device.connection_type.category() {
                SessionCategory::RemoteAccess => count += 1,
                SessionCategory::SiteToSite => s2s_count += 1,
            }
        }

        Ok(BothCounts {
            remote_access: SessionCount {
                count,
                limit,
                limit_with_leeway: add_leeway(limit, self.leeway),
            },
            site_to_site: SessionCount {
                count: s2s_count,
                limit: s2s_limit,
                limit_with_leeway: add_leeway(s2s_limit, self.leeway),
            },
        })
    }

    /// Count one category.
    pub async fn count(&self, category: SessionCategory) -> Result<SessionCount, GatesyncError> {
        Ok(self.count_both().await?.get(category))
    }

    /// Whether one more session of `category` fits the license limit.
    ///
    /// Any read failure denies.
    pub async fn admit(&self, category: SessionCategory) -> bool {
        match self.count(category).await {
            Ok(counts) => {
                let admitted = counts.admits(category);
                debug!(
                    category = ?category,
                    count = counts.count,
                    limit = counts.limit,
                    limit_with_leeway = counts.limit_with_leeway,
                    admitted,
                    "admission check"
                );
                admitted
            }
            Err(e) => {
                warn!(category = ?category, error = %e, "cannot count sessions, denying");
                false
            }
        }
    }

    /// Whether the stored license is valid right now.
    ///
    /// A missing record or a read failure is treated as invalid.
    pub async fn valid_license(&self) -> bool {
        let now = self.clock.now_utc();
        match self.license.get_license().await {
            Ok(Some(record)) => {
                let valid = record.is_valid_at(now);
                if !valid {
                    warn!(
                        validity_start = %record.validity_start,
                        validity_end = %record.validity_end,
                        now = %now,
                        "license is not valid"
                    );
                }
                valid
            }
            Ok(None) => {
                warn!("no license record, assuming invalid");
                false
            }
            Err(e) => {
                warn!(error = %e, "cannot check license validity, assuming invalid");
                false
            }
        }
    }

    /// Validity and category limit combined, as checked when a session
    /// is being set up.
    pub async fn admit_new_session(&self, category: SessionCategory) -> bool {
        self.valid_license().await && self.admit(category).await
    }

    /// Demo license state; read failures report "not a demo".
    pub async fn demo_status(&self) -> DemoStatus {
        match self.license.get_license().await {
            Ok(Some(record)) => demo_status_of(&record, self.clock.now_utc()),
            Ok(None) => DemoStatus::not_demo(),
            Err(e) => {
                warn!(error = %e, "cannot check demo license");
                DemoStatus::not_demo()
            }
        }
    }
}

fn demo_status_of(record: &LicenseRecord, now: DateTime<Utc>) -> DemoStatus {
    if !record.is_demo {
        return DemoStatus::not_demo();
    }
    let remaining = record
        .demo_end
        .map(|end| (end - now).max(chrono::Duration::zero()));
    DemoStatus {
        is_demo: true,
        expires_at: record.demo_end,
        remaining,
    }
}
