//! Domain Ports - Core trait definitions for the volume manager
//!
//! These traits define the boundaries between the lifecycle logic and the
//! storage backends, definition stores and image registries it coordinates.
//! Backends implement [`Driver`] and [`Volume`]; the backup orchestrator talks
//! to the rest of the control plane through [`DefinitionStore`],
//! [`ImageStore`] and [`DiskSpace`].

use crate::domain::service::{ServiceDefinition, ServiceTemplate};
use crate::error::{Error, FailedItem, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Resize
// =============================================================================

/// Request to change the allocation of a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    /// Name of the volume to resize
    pub volume_name: String,
    /// New allocation in bytes
    pub size: u64,
}

impl ResizeRequest {
    pub fn new(volume_name: impl Into<String>, size: u64) -> Self {
        Self {
            volume_name: volume_name.into(),
            size,
        }
    }

    /// Reject requests no driver could satisfy
    pub fn validate(&self) -> Result<()> {
        if self.volume_name.trim().is_empty() {
            return Err(Error::InvalidResize("volume name is empty".into()));
        }
        if self.size == 0 {
            return Err(Error::InvalidResize(format!(
                "size for volume {} must be greater than zero",
                self.volume_name
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Resource utilization of one driver's backing store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub driver: String,
    pub data_space_available: u64,
    pub data_space_used: u64,
    pub data_space_total: u64,
    pub metadata_space_available: u64,
    pub metadata_space_used: u64,
    pub metadata_space_total: u64,
    pub pool_name: String,
    pub data_file: String,
    pub data_loopback: String,
    pub metadata_file: String,
    pub metadata_loopback: String,
    pub sector_size: u64,
    pub udev_sync_supported: bool,
}

/// Aggregated status across drivers
///
/// Keyed by root path when every driver was asked, by volume name when
/// specific volumes were requested. Failures are reported next to the
/// successful entries instead of aborting the aggregation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statuses {
    pub status_map: BTreeMap<String, Status>,
    pub failures: Vec<FailedItem>,
}

impl Statuses {
    /// True when no driver failed during aggregation
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// Driver Port
// =============================================================================

/// A storage backend bound to one filesystem root
///
/// Creates, manages and destroys volumes beneath [`Driver::root`].
#[async_trait]
pub trait Driver: Send + Sync {
    /// The filesystem root this driver acts on
    fn root(&self) -> &Path;

    /// The driver type name this instance was created for
    fn driver_type(&self) -> &str;

    /// Create a volume; the volume must not exist already
    async fn create(&self, volume_name: &str) -> Result<Arc<dyn Volume>>;

    /// Get an existing volume
    async fn get(&self, volume_name: &str) -> Result<Arc<dyn Volume>>;

    /// Remove a volume and all of its snapshots; no-op if absent
    async fn remove(&self, volume_name: &str) -> Result<()>;

    /// Release runtime resources held for a volume without deleting data
    async fn release(&self, volume_name: &str) -> Result<()>;

    /// Whether a volume with this name exists. Must not have side effects.
    async fn exists(&self, volume_name: &str) -> bool;

    /// Names of all volumes managed by this driver
    async fn list(&self) -> Result<Vec<String>>;

    /// Release runtime resources held by the driver itself
    async fn cleanup(&self) -> Result<()>;

    /// Current utilization of the backing store
    async fn status(&self) -> Result<Status>;

    /// Grow or shrink a volume's allocation
    async fn resize(&self, request: &ResizeRequest) -> Result<()>;
}

// =============================================================================
// Volume Port
// =============================================================================

/// A named directory of application data that can be snapshotted, rolled
/// back, exported to a file and imported from a file.
#[async_trait]
pub trait Volume: Send + Sync {
    fn name(&self) -> &str;

    fn path(&self) -> &Path;

    /// The driver managing this volume, if it is still alive
    fn driver(&self) -> Option<Arc<dyn Driver>>;

    /// The top-level application this volume's data belongs to
    fn tenant(&self) -> &str;

    /// Capture the current state under `label`
    async fn snapshot(&self, label: &str) -> Result<()>;

    /// Directory holding descriptive metadata for a snapshot
    fn snapshot_metadata_path(&self, label: &str) -> PathBuf;

    /// Labels of all snapshots; empty when there are none
    async fn snapshots(&self) -> Result<Vec<String>>;

    async fn remove_snapshot(&self, label: &str) -> Result<()>;

    /// Replace the live state with the snapshot stored as `label`
    async fn rollback(&self, label: &str) -> Result<()>;

    /// Export the snapshot `label` to `filename`, as a delta against
    /// `parent` when one is given
    async fn export(&self, label: &str, parent: Option<&str>, filename: &Path) -> Result<()> {
        self.export_filtered(label, parent, filename, &[]).await
    }

    /// Export leaving out paths (relative to the volume root) listed in
    /// `excludes`
    async fn export_filtered(
        &self,
        label: &str,
        parent: Option<&str>,
        filename: &Path,
        excludes: &[String],
    ) -> Result<()>;

    /// Materialize the export at `filename` as snapshot `label`
    async fn import(&self, label: &str, filename: &Path) -> Result<()>;

    /// Bytes used by the live volume, leaving out `excludes`
    async fn usage(&self, excludes: &[String]) -> Result<u64>;
}

impl std::fmt::Debug for dyn Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("type", &self.driver_type())
            .field("root", &self.root())
            .finish()
    }
}

impl std::fmt::Debug for dyn Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name())
            .field("path", &self.path())
            .finish()
    }
}

// =============================================================================
// Driver Factory
// =============================================================================

/// Initializes a driver for a root path
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn init(&self, root: &Path) -> Result<Arc<dyn Driver>>;
}

#[async_trait]
impl<F, Fut> DriverFactory for F
where
    F: Fn(PathBuf) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Arc<dyn Driver>>> + Send + 'static,
{
    async fn init(&self, root: &Path) -> Result<Arc<dyn Driver>> {
        (self)(root.to_path_buf()).await
    }
}

// =============================================================================
// Backup Collaborator Ports
// =============================================================================

/// Source and sink of service templates and service definitions
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn templates(&self) -> Result<Vec<ServiceTemplate>>;

    async fn services(&self) -> Result<Vec<ServiceDefinition>>;

    async fn restore_templates(&self, templates: Vec<ServiceTemplate>) -> Result<()>;

    async fn restore_services(&self, services: Vec<ServiceDefinition>) -> Result<()>;
}

/// Container image storage used to archive the images services reference
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Size in bytes of a stored image
    async fn image_size(&self, image_id: &str) -> Result<u64>;

    /// Write the listed images into a single file
    async fn export_images(&self, image_ids: &[String], filename: &Path) -> Result<()>;

    /// Load images from a file written by [`ImageStore::export_images`]
    async fn import_images(&self, filename: &Path) -> Result<Vec<String>>;
}

/// Free-space probe for backup destinations
pub trait DiskSpace: Send + Sync {
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_request_validation() {
        assert!(ResizeRequest::new("app1", 1024).validate().is_ok());

        let err = ResizeRequest::new("", 1024).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidResize(_)));

        let err = ResizeRequest::new("app1", 0).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidResize(_)));
    }

    #[test]
    fn test_statuses_completeness() {
        let mut statuses = Statuses::default();
        assert!(statuses.is_complete());

        statuses.failures.push(FailedItem::new(
            "/r1",
            &Error::BackendUnavailable {
                driver: "dir".into(),
                reason: "gone".into(),
            },
        ));
        assert!(!statuses.is_complete());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = Status {
            driver: "mem".into(),
            data_space_total: 10,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["driver"], "mem");
        assert_eq!(json["dataSpaceTotal"], 10);
        assert_eq!(json["udevSyncSupported"], false);
    }
}
