//! Backup and restore request, estimate and manifest types

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default share of volume data reserved for the transient backup snapshot
pub const DEFAULT_SNAPSHOT_SPACE_PERCENT: u32 = 20;

/// Archive layout version written into every manifest
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Request to estimate or perform a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRequest {
    /// Directory the archive is written into
    pub dirpath: PathBuf,
    /// Paths, relative to each tenant volume, left out of the backup
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Proceed even when the estimate exceeds the available space
    #[serde(default)]
    pub force: bool,
    /// Headroom reserved for the backup snapshot, as a percentage of volume data
    #[serde(default = "default_snapshot_space_percent")]
    pub snapshot_space_percent: u32,
}

fn default_snapshot_space_percent() -> u32 {
    DEFAULT_SNAPSHOT_SPACE_PERCENT
}

impl BackupRequest {
    pub fn new(dirpath: impl Into<PathBuf>) -> Self {
        Self {
            dirpath: dirpath.into(),
            excludes: Vec::new(),
            force: false,
            snapshot_space_percent: DEFAULT_SNAPSHOT_SPACE_PERCENT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dirpath.as_os_str().is_empty() {
            return Err(Error::InvalidBackupRequest("backup directory is empty".into()));
        }
        if self.snapshot_space_percent > 100 {
            return Err(Error::InvalidBackupRequest(format!(
                "snapshot space percent {} is above 100",
                self.snapshot_space_percent
            )));
        }
        for exclude in &self.excludes {
            let path = std::path::Path::new(exclude);
            let escapes = path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir));
            if exclude.is_empty() || escapes {
                return Err(Error::InvalidBackupRequest(format!(
                    "exclude {:?} must be a path inside the volume",
                    exclude
                )));
            }
        }
        Ok(())
    }
}

/// Pre-flight projection of the space a backup needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEstimate {
    /// Canonical destination directory
    pub backup_path: PathBuf,
    pub available_bytes: u64,
    /// Total projected requirement, snapshot headroom included
    pub estimated_bytes: u64,
    pub volume_bytes: u64,
    pub image_bytes: u64,
    pub definition_bytes: u64,
    pub snapshot_overhead_bytes: u64,
    pub available_string: String,
    pub estimated_string: String,
    pub allow_backup: bool,
}

/// Request to restore from an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub filename: PathBuf,
}

/// What a restore brought back
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub archive: PathBuf,
    pub templates: usize,
    pub services: usize,
    pub images: Vec<String>,
    pub volumes: Vec<String>,
}

/// One tenant volume inside an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestVolume {
    /// Volume name, restored under the same name
    pub volume: String,
    /// Tenant the volume belongs to
    pub tenant: String,
    /// Snapshot label the export was taken from
    pub label: String,
    /// Export file, relative to the archive root
    pub file: String,
}

/// Table of contents of a backup archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// Driver type the volumes were exported with
    pub driver: String,
    pub templates_file: String,
    pub services_file: String,
    /// Image archive, absent when no service references an image
    pub images_file: Option<String>,
    pub images: Vec<String>,
    pub volumes: Vec<ManifestVolume>,
    pub excludes: Vec<String>,
}

impl BackupManifest {
    pub const FILE_NAME: &'static str = "manifest.json";

    /// Check the manifest only names files inside the archive
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.format_version != MANIFEST_FORMAT_VERSION {
            return Err(format!(
                "unsupported manifest version {} (expected {})",
                self.format_version, MANIFEST_FORMAT_VERSION
            ));
        }
        let files = [&self.templates_file, &self.services_file]
            .into_iter()
            .chain(self.images_file.iter())
            .chain(self.volumes.iter().map(|v| &v.file));
        for file in files {
            let path = std::path::Path::new(file);
            let escapes = path.is_absolute()
                || path
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir));
            if file.is_empty() || escapes {
                return Err(format!("manifest entry {:?} points outside the archive", file));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_request_validation() {
        let mut req = BackupRequest::new("/backups");
        assert!(req.validate().is_ok());

        req.snapshot_space_percent = 101;
        assert!(req.validate().is_err());

        req.snapshot_space_percent = 20;
        req.excludes = vec!["var/log".into()];
        assert!(req.validate().is_ok());

        req.excludes = vec!["../etc".into()];
        assert!(req.validate().is_err());

        req.excludes = vec!["/etc".into()];
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_backup_request_defaults() {
        let req: BackupRequest = serde_json::from_str(r#"{"dirpath":"/backups"}"#).unwrap();
        assert_eq!(req.snapshot_space_percent, DEFAULT_SNAPSHOT_SPACE_PERCENT);
        assert!(!req.force);
        assert!(req.excludes.is_empty());
    }

    #[test]
    fn test_manifest_rejects_escaping_entries() {
        let mut manifest = BackupManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            created_at: Utc::now(),
            driver: "dir".into(),
            templates_file: "templates.json".into(),
            services_file: "services.json".into(),
            images_file: None,
            images: vec![],
            volumes: vec![ManifestVolume {
                volume: "app1".into(),
                tenant: "app1".into(),
                label: "backup".into(),
                file: "snapshots/app1.snap".into(),
            }],
            excludes: vec![],
        };
        assert!(manifest.validate().is_ok());

        manifest.volumes[0].file = "../../etc/passwd".into();
        assert!(manifest.validate().is_err());

        manifest.volumes[0].file = "snapshots/app1.snap".into();
        manifest.format_version = 99;
        assert!(manifest.validate().is_err());
    }
}
