//! Manager configuration
//!
//! Loaded from YAML; every field has a default so an empty file is valid.
//!
//! ```yaml
//! driver: dir
//! volumesRoot: /var/lib/volumes
//! backupDir: /var/backups/volumes
//! snapshotSpacePercent: 20
//! compressionLevel: 3
//! definitionsFile: /etc/volumes/definitions.yaml
//! imageStoreDir: /var/lib/volumes-images
//! memoryCapacity: 1Gi
//! ```

use crate::domain::backup::DEFAULT_SNAPSHOT_SPACE_PERCENT;
use crate::drivers::{
    DirectoryDriverConfig, MemoryDriverConfig, DEFAULT_COMPRESSION_LEVEL, DIRECTORY_DRIVER,
};
use crate::error::{Error, Result};
use crate::units::parse_capacity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Configuration for the volume manager and its built-in drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Driver type used for tenant volumes
    pub driver: String,
    /// Root path the driver is bound to
    pub volumes_root: PathBuf,
    /// Default destination for backup archives
    pub backup_dir: PathBuf,
    /// Headroom reserved for backup snapshots, as a percentage of volume bytes
    pub snapshot_space_percent: u32,
    /// zstd level for snapshot exports and backup archives
    pub compression_level: i32,
    /// Service templates and definitions (JSON or YAML); defaults to
    /// `<volumesRoot>/definitions.yaml`
    pub definitions_file: Option<PathBuf>,
    /// Directory of the local image store; defaults to `<volumesRoot>/images`
    pub image_store_dir: Option<PathBuf>,
    /// Pool capacity of the in-memory driver, e.g. `1Gi`
    pub memory_capacity: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            driver: DIRECTORY_DRIVER.to_string(),
            volumes_root: PathBuf::from("/var/lib/volume-manager"),
            backup_dir: PathBuf::from("/var/backups/volume-manager"),
            snapshot_space_percent: DEFAULT_SNAPSHOT_SPACE_PERCENT,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            definitions_file: None,
            image_store_dir: None,
            memory_capacity: "1Gi".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Load and validate configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml_str(&content)?;
        debug!(path = %path.display(), ?config, "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver.trim().is_empty() {
            return Err(Error::Configuration("driver must not be empty".into()));
        }
        if self.volumes_root.as_os_str().is_empty() {
            return Err(Error::Configuration("volumesRoot must not be empty".into()));
        }
        if self.snapshot_space_percent > 100 {
            return Err(Error::Configuration(format!(
                "snapshotSpacePercent must be within 0..=100, got {}",
                self.snapshot_space_percent
            )));
        }
        if !zstd::compression_level_range().contains(&self.compression_level) {
            return Err(Error::Configuration(format!(
                "compressionLevel {} is not a valid zstd level",
                self.compression_level
            )));
        }
        self.memory_capacity_bytes()?;
        Ok(())
    }

    pub fn memory_capacity_bytes(&self) -> Result<u64> {
        parse_capacity(&self.memory_capacity)
            .map_err(|e| Error::Configuration(format!("memoryCapacity: {}", e)))
    }

    pub fn definitions_path(&self) -> PathBuf {
        self.definitions_file
            .clone()
            .unwrap_or_else(|| self.volumes_root.join("definitions.yaml"))
    }

    pub fn image_store_path(&self) -> PathBuf {
        self.image_store_dir
            .clone()
            .unwrap_or_else(|| self.volumes_root.join("images"))
    }

    /// Settings for the in-memory driver
    pub fn memory_driver(&self) -> Result<MemoryDriverConfig> {
        Ok(MemoryDriverConfig {
            capacity_bytes: self.memory_capacity_bytes()?,
            compression_level: self.compression_level,
        })
    }

    /// Settings for the directory driver
    pub fn directory_driver(&self) -> DirectoryDriverConfig {
        DirectoryDriverConfig {
            compression_level: self.compression_level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = ManagerConfig::from_yaml_str("").unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.snapshot_space_percent, 20);
        assert_eq!(config.memory_capacity_bytes().unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let yaml = r#"
driver: mem
volumesRoot: /r1
memoryCapacity: 256Mi
"#;
        let config = ManagerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.driver, "mem");
        assert_eq!(config.volumes_root, PathBuf::from("/r1"));
        assert_eq!(config.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(config.memory_driver().unwrap().capacity_bytes, 256 * 1024 * 1024);
        assert_eq!(config.definitions_path(), PathBuf::from("/r1/definitions.yaml"));
        assert_eq!(config.image_store_path(), PathBuf::from("/r1/images"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_matches!(
            ManagerConfig::from_yaml_str("snapshotSpacePercent: 150"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ManagerConfig::from_yaml_str("memoryCapacity: lots"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ManagerConfig::from_yaml_str("compressionLevel: 99"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            ManagerConfig::from_yaml_str("unknownKey: 1"),
            Err(Error::YamlParse(_))
        );
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        let config = ManagerConfig {
            driver: "mem".into(),
            definitions_file: Some(PathBuf::from("/etc/defs.yaml")),
            ..Default::default()
        };
        std::fs::write(&path, config.to_yaml().unwrap()).unwrap();

        assert_eq!(ManagerConfig::from_yaml_file(&path).unwrap(), config);
        assert_matches!(
            ManagerConfig::from_yaml_file(tmp.path().join("missing.yaml")),
            Err(Error::Configuration(_))
        );
    }
}
