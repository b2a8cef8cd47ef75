//! File-backed license store with atomic writes.
//!
//! Stores the license envelope under `dirs::data_dir()/<namespace>/`.
//! Uses temp file + rename for atomic writes.

use crate::cache::format::StoredLicense;
use crate::clock::Clock;
use crate::license::{LicenseRecord, LicenseStore};
use crate::GatesyncError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

const LICENSE_FILE: &str = "license.json";
const LICENSE_TEMP_FILE: &str = "license.json.tmp";

/// File-backed [`LicenseStore`].
pub struct FileLicenseStore {
    /// Directory holding the license file.
    store_dir: PathBuf,
    clock: Arc<dyn Clock>,
    /// Serializes writers so two temp files never race on the rename.
    write_lock: Mutex<()>,
}

impl FileLicenseStore {
    /// Create a store with the given namespace.
    ///
    /// Files are stored under `dirs::data_dir()/<namespace>/`.
    pub async fn new(namespace: &str, clock: Arc<dyn Clock>) -> Result<Self, GatesyncError> {
        let base_dir = dirs::data_dir()
            .ok_or_else(|| GatesyncError::Store("Could not find data directory".to_string()))?;
        Self::with_path(base_dir.join(namespace), clock).await
    }

    /// Create a store in a specific directory.
    pub async fn with_path(store_dir: PathBuf, clock: Arc<dyn Clock>) -> Result<Self, GatesyncError> {
        fs::create_dir_all(&store_dir)
            .await
            .map_err(|e| GatesyncError::Store(format!("Failed to create store dir: {}", e)))?;
        Ok(Self {
            store_dir,
            clock,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the license file.
    pub fn license_path(&self) -> PathBuf {
        self.store_dir.join(LICENSE_FILE)
    }

    /// Remove the license file.
    pub async fn delete(&self) -> Result<(), GatesyncError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.license_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatesyncError::Store(format!("Failed to delete license: {}", e))),
        }
    }
}

#[async_trait]
impl LicenseStore for FileLicenseStore {
    async fn get_license(&self) -> Result<Option<LicenseRecord>, GatesyncError> {
        let json = match fs::read_to_string(self.license_path()).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GatesyncError::Store(format!(
                    "Failed to read license file: {}",
                    e
                )))
            }
        };

        let stored = StoredLicense::from_json(&json)?;
        stored.verify()?;
        Ok(Some(stored.into_record()))
    }

    async fn put_license(&self, record: &LicenseRecord) -> Result<(), GatesyncError> {
        let stored = StoredLicense::new(record.clone(), self.clock.as_ref())?;
        let json = stored.to_json()?;

        let _guard = self.write_lock.lock().await;
        let temp_path = self.store_dir.join(LICENSE_TEMP_FILE);

        // Write to temp file
        fs::write(&temp_path, &json)
            .await
            .map_err(|e| GatesyncError::Store(format!("Failed to write temp file: {}", e)))?;

        // Atomic rename
        fs::rename(&temp_path, self.license_path())
            .await
            .map_err(|e| GatesyncError::Store(format!("Failed to rename license file: {}", e)))?;

        Ok(())
    }
}
