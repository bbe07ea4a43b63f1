//! Backup/Restore Orchestrator
//!
//! A backup is one zstd-compressed tar archive holding the service
//! templates, the service definitions, one snapshot export per tenant volume
//! and the images the services reference:
//!
//! ```text
//! manifest.json
//! templates.json
//! services.json
//! snapshots/<volume>.snap
//! images.tar            (only when a service references an image)
//! ```
//!
//! Restore reverses the process: templates first, then images, then every
//! tenant volume (mount, import, rollback), and services last.

mod archive;
mod sources;

pub use sources::{DefinitionsDocument, DirectoryImageStore, MemoryDefinitionStore, StatvfsDiskSpace};

use crate::config::ManagerConfig;
use crate::controlplane::orchestrator::VolumeOrchestrator;
use crate::domain::backup::{
    BackupEstimate, BackupManifest, BackupRequest, ManifestVolume, RestoreReport, RestoreRequest,
    MANIFEST_FORMAT_VERSION,
};
use crate::domain::names::validate_name;
use crate::domain::ports::{DefinitionStore, DiskSpace, ImageStore, Volume};
use crate::domain::service::{referenced_images, tenant_ids, ServiceDefinition, ServiceTemplate};
use crate::error::{Error, Result};
use crate::fsutil::{absolute_clean, blocking};
use crate::units::format_bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

const TEMPLATES_FILE: &str = "templates.json";
const SERVICES_FILE: &str = "services.json";
const IMAGES_FILE: &str = "images.tar";
const SNAPSHOTS_DIR: &str = "snapshots";

/// Where tenant volumes live and how archives are compressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSettings {
    pub driver: String,
    pub volumes_root: PathBuf,
    pub compression_level: i32,
}

impl From<&ManagerConfig> for BackupSettings {
    fn from(config: &ManagerConfig) -> Self {
        Self {
            driver: config.driver.clone(),
            volumes_root: config.volumes_root.clone(),
            compression_level: config.compression_level,
        }
    }
}

/// Everything a backup needs, gathered once by the estimate
struct BackupPlan {
    estimate: BackupEstimate,
    templates_json: Vec<u8>,
    services_json: Vec<u8>,
    images: Vec<String>,
    volumes: Vec<Arc<dyn Volume>>,
}

/// Coordinates whole-system backups and restores
pub struct BackupManager {
    orchestrator: Arc<VolumeOrchestrator>,
    settings: BackupSettings,
    definitions: Arc<dyn DefinitionStore>,
    images: Arc<dyn ImageStore>,
    disk: Arc<dyn DiskSpace>,
    /// Held for the whole of a backup or restore
    exclusive: AsyncMutex<()>,
}

impl BackupManager {
    pub fn new(
        orchestrator: Arc<VolumeOrchestrator>,
        settings: BackupSettings,
        definitions: Arc<dyn DefinitionStore>,
        images: Arc<dyn ImageStore>,
        disk: Arc<dyn DiskSpace>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            settings,
            definitions,
            images,
            disk,
            exclusive: AsyncMutex::new(()),
        })
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Project the space a backup into `request.dirpath` would need
    pub async fn get_backup_estimate(&self, request: &BackupRequest) -> Result<BackupEstimate> {
        let started = Instant::now();
        let result = self.estimate_inner(request).await;
        self.orchestrator
            .metrics()
            .observe("backup_estimate", started, &result);
        result
    }

    async fn estimate_inner(&self, request: &BackupRequest) -> Result<BackupEstimate> {
        request.validate()?;
        let dirpath = absolute_clean(&request.dirpath)?;
        Ok(self.plan(request, dirpath).await?.estimate)
    }

    async fn plan(&self, request: &BackupRequest, dirpath: PathBuf) -> Result<BackupPlan> {
        let templates = self.definitions.templates().await?;
        let services = self.definitions.services().await?;
        let templates_json = serde_json::to_vec_pretty(&templates)?;
        let services_json = serde_json::to_vec_pretty(&services)?;
        let definition_bytes = (templates_json.len() + services_json.len()) as u64;

        let images = referenced_images(&services);
        let mut image_bytes = 0u64;
        for image in &images {
            image_bytes = image_bytes.saturating_add(self.images.image_size(image).await?);
        }

        let driver = self
            .orchestrator
            .registry()
            .get_driver(&self.settings.driver, &self.settings.volumes_root)
            .await?;
        let tenants = tenant_ids(&services);
        let mut names = driver.list().await?;
        names.sort();
        let mut volumes = Vec::new();
        let mut volume_bytes = 0u64;
        for name in names {
            let volume = driver.get(&name).await?;
            if !tenants.iter().any(|t| t == volume.tenant()) {
                debug!(volume = %name, tenant = volume.tenant(), "Volume outside backed-up tenants");
                continue;
            }
            volume_bytes = volume_bytes.saturating_add(volume.usage(&request.excludes).await?);
            volumes.push(volume);
        }

        let snapshot_overhead_bytes =
            volume_bytes.saturating_mul(u64::from(request.snapshot_space_percent)) / 100;
        let estimated_bytes = volume_bytes
            .saturating_add(image_bytes)
            .saturating_add(definition_bytes)
            .saturating_add(snapshot_overhead_bytes);
        let available_bytes = self.disk.available_bytes(&dirpath)?;

        let estimate = BackupEstimate {
            backup_path: dirpath,
            available_bytes,
            estimated_bytes,
            volume_bytes,
            image_bytes,
            definition_bytes,
            snapshot_overhead_bytes,
            available_string: format_bytes(available_bytes),
            estimated_string: format_bytes(estimated_bytes),
            allow_backup: estimated_bytes <= available_bytes,
        };
        debug!(?estimate, "Computed backup estimate");

        Ok(BackupPlan {
            estimate,
            templates_json,
            services_json,
            images,
            volumes,
        })
    }

    /// Write a backup archive into `request.dirpath` and return its path
    pub async fn backup(&self, request: &BackupRequest) -> Result<PathBuf> {
        let _exclusive = self.exclusive.lock().await;
        let started = Instant::now();
        let result = self.backup_inner(request).await;
        let metrics = self.orchestrator.metrics();
        metrics.observe("backup", started, &result);
        result
    }

    async fn backup_inner(&self, request: &BackupRequest) -> Result<PathBuf> {
        request.validate()?;
        let dirpath = absolute_clean(&request.dirpath)?;
        let plan = self.plan(request, dirpath.clone()).await?;

        let estimate = &plan.estimate;
        if !estimate.allow_backup {
            if !request.force {
                warn!(
                    path = %dirpath.display(),
                    estimated = %estimate.estimated_string,
                    available = %estimate.available_string,
                    "Not enough space for backup"
                );
                return Err(Error::InsufficientSpace {
                    requested: estimate.estimated_bytes,
                    available: estimate.available_bytes,
                });
            }
            warn!(
                path = %dirpath.display(),
                estimated = %estimate.estimated_string,
                available = %estimate.available_string,
                "Backup may not fit, continuing because force is set"
            );
        }

        let created_dir = !tokio::fs::try_exists(&dirpath).await?;
        tokio::fs::create_dir_all(&dirpath).await?;

        let result = self.write_archive(&plan, request, &dirpath).await;
        if result.is_err() && created_dir {
            if let Err(e) = tokio::fs::remove_dir(&dirpath).await {
                debug!(path = %dirpath.display(), error = %e, "Backup directory left in place");
            }
        }
        result
    }

    async fn write_archive(
        &self,
        plan: &BackupPlan,
        request: &BackupRequest,
        dirpath: &Path,
    ) -> Result<PathBuf> {
        let now = Utc::now();
        // The archive stem doubles as the snapshot label so that archives
        // taken in quick succession never share either
        let (label, target) = archive::unique_target(dirpath, now)?;
        let staging = tempfile::Builder::new()
            .prefix(".backup-staging-")
            .tempdir_in(dirpath)?;
        let manifest = self
            .stage(plan, request, staging.path(), &label, now)
            .await?;

        let source = staging.path().to_path_buf();
        let archive_path = target.clone();
        let level = self.settings.compression_level;
        let size = blocking(move || {
            let size = archive::pack(&source, &archive_path, level)?;
            staging.close()?;
            Ok(size)
        })
        .await?;

        self.orchestrator.metrics().set_last_archive_bytes(size);
        info!(
            archive = %target.display(),
            bytes = size,
            volumes = manifest.volumes.len(),
            images = manifest.images.len(),
            "Backup complete"
        );
        Ok(target)
    }

    /// Fill `staging` with every archive member and return the manifest
    async fn stage(
        &self,
        plan: &BackupPlan,
        request: &BackupRequest,
        staging: &Path,
        label: &str,
        now: DateTime<Utc>,
    ) -> Result<BackupManifest> {
        tokio::fs::write(staging.join(TEMPLATES_FILE), &plan.templates_json).await?;
        tokio::fs::write(staging.join(SERVICES_FILE), &plan.services_json).await?;

        tokio::fs::create_dir_all(staging.join(SNAPSHOTS_DIR)).await?;
        let mut volumes = Vec::with_capacity(plan.volumes.len());
        for volume in &plan.volumes {
            let file = format!("{}/{}.snap", SNAPSHOTS_DIR, volume.name());
            export_tenant(volume.as_ref(), label, &staging.join(&file), &request.excludes)
                .await?;
            volumes.push(ManifestVolume {
                volume: volume.name().to_string(),
                tenant: volume.tenant().to_string(),
                label: label.to_string(),
                file,
            });
        }

        let images_file = if plan.images.is_empty() {
            None
        } else {
            self.images
                .export_images(&plan.images, &staging.join(IMAGES_FILE))
                .await?;
            Some(IMAGES_FILE.to_string())
        };

        let manifest = BackupManifest {
            format_version: MANIFEST_FORMAT_VERSION,
            created_at: now,
            driver: self.settings.driver.clone(),
            templates_file: TEMPLATES_FILE.to_string(),
            services_file: SERVICES_FILE.to_string(),
            images_file,
            images: plan.images.clone(),
            volumes,
            excludes: request.excludes.clone(),
        };
        tokio::fs::write(
            staging.join(BackupManifest::FILE_NAME),
            serde_json::to_vec_pretty(&manifest)?,
        )
        .await?;
        Ok(manifest)
    }

    /// Restore templates, images, tenant volumes and services from an archive
    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        let _exclusive = self.exclusive.lock().await;
        let started = Instant::now();
        let result = self.restore_inner(request).await;
        self.orchestrator
            .metrics()
            .observe("restore", started, &result);
        result
    }

    async fn restore_inner(&self, request: &RestoreRequest) -> Result<RestoreReport> {
        let archive_path = absolute_clean(&request.filename)?;
        let is_file = tokio::fs::metadata(&archive_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(Error::ResourceNotFound {
                kind: "archive".into(),
                name: archive_path.display().to_string(),
            });
        }

        let staging = tempfile::Builder::new()
            .prefix("volume-restore-")
            .tempdir()?;
        let source = archive_path.clone();
        let dest = staging.path().to_path_buf();
        blocking(move || archive::unpack(&source, &dest)).await?;

        let manifest = self.read_manifest(&archive_path, staging.path()).await?;
        let templates: Vec<ServiceTemplate> =
            read_member(&archive_path, &staging.path().join(&manifest.templates_file)).await?;
        let services: Vec<ServiceDefinition> =
            read_member(&archive_path, &staging.path().join(&manifest.services_file)).await?;

        let report = RestoreReport {
            archive: archive_path.clone(),
            templates: templates.len(),
            services: services.len(),
            images: Vec::new(),
            volumes: manifest.volumes.iter().map(|v| v.volume.clone()).collect(),
        };

        self.definitions.restore_templates(templates).await?;

        let images = match &manifest.images_file {
            Some(file) => self.images.import_images(&staging.path().join(file)).await?,
            None => Vec::new(),
        };

        for entry in &manifest.volumes {
            self.restore_volume(entry, &staging.path().join(&entry.file))
                .await?;
        }

        self.definitions.restore_services(services).await?;

        info!(
            archive = %archive_path.display(),
            templates = report.templates,
            services = report.services,
            images = images.len(),
            volumes = report.volumes.len(),
            "Restore complete"
        );
        Ok(RestoreReport { images, ..report })
    }

    /// Load and check the manifest before anything is restored
    async fn read_manifest(&self, archive_path: &Path, staging: &Path) -> Result<BackupManifest> {
        let invalid = |reason: String| Error::InvalidArchive {
            path: archive_path.to_path_buf(),
            reason,
        };

        let manifest: BackupManifest =
            read_member(archive_path, &staging.join(BackupManifest::FILE_NAME)).await?;
        manifest.validate().map_err(invalid)?;

        if manifest.driver != self.settings.driver {
            return Err(invalid(format!(
                "volumes were exported with driver {}, configured driver is {}",
                manifest.driver, self.settings.driver
            )));
        }
        for entry in &manifest.volumes {
            validate_name("volume", &entry.volume)
                .map_err(|e| invalid(format!("bad volume entry: {}", e)))?;
            if !tokio::fs::try_exists(staging.join(&entry.file)).await? {
                return Err(invalid(format!("missing volume export {}", entry.file)));
            }
        }
        if let Some(file) = &manifest.images_file {
            if !tokio::fs::try_exists(staging.join(file)).await? {
                return Err(invalid(format!("missing image archive {}", file)));
            }
        }
        Ok(manifest)
    }

    async fn restore_volume(&self, entry: &ManifestVolume, export: &Path) -> Result<()> {
        let volume = self
            .orchestrator
            .mount(&self.settings.driver, &entry.volume, &self.settings.volumes_root)
            .await?;

        if volume.snapshots().await?.iter().any(|l| l == &entry.label) {
            warn!(
                volume = %entry.volume,
                label = %entry.label,
                "Snapshot already present, reusing it"
            );
        } else {
            volume.import(&entry.label, export).await?;
        }
        volume.rollback(&entry.label).await?;

        info!(volume = %entry.volume, tenant = %entry.tenant, label = %entry.label, "Restored volume");
        Ok(())
    }
}

/// Snapshot a tenant volume, export it and drop the snapshot again
async fn export_tenant(
    volume: &dyn Volume,
    label: &str,
    filename: &Path,
    excludes: &[String],
) -> Result<()> {
    volume.snapshot(label).await?;
    let exported = volume
        .export_filtered(label, None, filename, excludes)
        .await;
    let removed = volume.remove_snapshot(label).await;
    if let Err(e) = &removed {
        warn!(volume = volume.name(), label, error = %e, "Failed to remove backup snapshot");
    }
    exported?;
    removed?;
    debug!(volume = volume.name(), label, "Exported tenant volume");
    Ok(())
}

async fn read_member<T: DeserializeOwned>(archive_path: &Path, member: &Path) -> Result<T> {
    let invalid = |reason: String| Error::InvalidArchive {
        path: archive_path.to_path_buf(),
        reason,
    };
    let data = tokio::fs::read(member)
        .await
        .map_err(|e| invalid(format!("cannot read {}: {}", member.display(), e)))?;
    serde_json::from_slice(&data)
        .map_err(|e| invalid(format!("cannot parse {}: {}", member.display(), e)))
}
