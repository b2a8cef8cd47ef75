//! On-disk license record format.
//!
//! The stored envelope carries the record, the time it was written and a
//! SHA-256 checksum over the record's canonical JSON. On load, we:
//! 1. Parse the envelope
//! 2. Recompute the checksum over the embedded record
//!
//! `stored_at` is informational only. Time sync may step the wall clock
//! backwards, so it is never compared against the current time.

use crate::clock::Clock;
use crate::license::LicenseRecord;
use crate::GatesyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Integrity-checked license file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLicense {
    /// The license record.
    pub record: LicenseRecord,

    /// When this envelope was written.
    pub stored_at: DateTime<Utc>,

    /// Hex SHA-256 of the record's JSON encoding.
    pub checksum: String,
}

impl StoredLicense {
    /// Wrap a record, computing its checksum.
    pub fn new(record: LicenseRecord, clock: &dyn Clock) -> Result<Self, GatesyncError> {
        let checksum = record_checksum(&record)?;
        Ok(Self {
            record,
            stored_at: clock.now_utc(),
            checksum,
        })
    }

    /// Serialize the envelope to JSON.
    pub fn to_json(&self) -> Result<String, GatesyncError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| GatesyncError::Store(format!("Failed to serialize license: {}", e)))
    }

    /// Deserialize an envelope from JSON.
    pub fn from_json(json: &str) -> Result<Self, GatesyncError> {
        serde_json::from_str(json)
            .map_err(|e| GatesyncError::Store(format!("Failed to deserialize license: {}", e)))
    }

    /// Check the envelope was not edited behind our back.
    pub fn verify(&self) -> Result<(), GatesyncError> {
        let expected = record_checksum(&self.record)?;
        if expected != self.checksum {
            return Err(GatesyncError::StoreTampered);
        }
        Ok(())
    }

    /// Consume the envelope, returning the record.
    pub fn into_record(self) -> LicenseRecord {
        self.record
    }
}

fn record_checksum(record: &LicenseRecord) -> Result<String, GatesyncError> {
    let canonical = serde_json::to_vec(record)
        .map_err(|e| GatesyncError::Store(format!("Failed to encode license: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
