//! File-backed store for the device configuration blob.
//!
//! The blob is small (well under the 2 KiB payload budget) so it is always read and
//! written whole. Writes go to a sibling temporary file that is renamed over the target,
//! so a reboot in the middle of a save leaves either the old or the new blob on disk.

use super::{DeviceConfig, MaskedConfig};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while persisting the device configuration
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to write config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted config, falling back to the empty default when the blob is
    /// missing, unreadable or not valid JSON.
    pub async fn load(&self) -> DeviceConfig {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No device config at {}, using default", self.path.display());
                return DeviceConfig::default();
            }
            Err(e) => {
                warn!("Unable to read {}: {}, using default", self.path.display(), e);
                return DeviceConfig::default();
            }
        };

        match serde_json::from_str::<DeviceConfig>(&content) {
            Ok(config) => {
                info!("Device config loaded: {}", config.masked());
                config
            }
            Err(e) => {
                warn!("Device config is corrupt ({}), using default", e);
                DeviceConfig::default()
            }
        }
    }

    /// Overwrites the persisted config.
    pub async fn save(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        let content = serde_json::to_vec(config)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }

        let staging = self.staging_path();
        tokio::fs::write(&staging, &content)
            .await
            .map_err(|source| self.io_error(source))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|source| self.io_error(source))?;

        debug!("Device config saved to {}", self.path.display());
        Ok(())
    }

    /// Replaces the persisted config with the empty default and returns it.
    pub async fn reset(&self) -> Result<DeviceConfig, StoreError> {
        let config = DeviceConfig::default();
        self.save(&config).await?;
        info!("Device config reset to default");
        Ok(config)
    }

    pub fn masked(config: &DeviceConfig) -> MaskedConfig {
        config.masked()
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
