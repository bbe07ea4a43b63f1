//! In-Memory Volume Driver
//!
//! Volumes live in a DashMap keyed by name; each volume keeps its files and
//! snapshots behind one mutex so every snapshot, rollback and import is
//! applied as a unit. Exports are zstd-compressed JSON documents.

use crate::domain::names::{tenant_of, validate_name};
use crate::domain::ports::{Driver, DriverFactory, ResizeRequest, Status, Volume};
use crate::drivers::{DEFAULT_COMPRESSION_LEVEL, MEMORY_DRIVER};
use crate::error::{Error, Result};
use crate::fsutil::{blocking, clean_path, is_excluded, write_atomic};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Format tag written into every memory export
const EXPORT_FORMAT: &str = "mem-export-v1";

// =============================================================================
// Memory Driver Configuration
// =============================================================================

/// Configuration for the in-memory driver
#[derive(Debug, Clone)]
pub struct MemoryDriverConfig {
    /// Pool capacity reported by `status()`; also the upper bound for quotas
    pub capacity_bytes: u64,
    /// zstd level used for exports
    pub compression_level: i32,
}

impl Default for MemoryDriverConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 1024 * 1024 * 1024, // 1 GiB
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

// =============================================================================
// Memory Driver
// =============================================================================

/// Driver keeping all volume content in process memory
pub struct MemoryDriver {
    me: Weak<MemoryDriver>,
    driver_type: String,
    root: PathBuf,
    config: MemoryDriverConfig,
    volumes: DashMap<String, Arc<MemoryVolume>>,
}

impl MemoryDriver {
    /// Create a driver with default config
    pub fn new(driver_type: &str, root: impl Into<PathBuf>) -> Arc<Self> {
        Self::with_config(driver_type, root, MemoryDriverConfig::default())
    }

    /// Create a driver with full config
    pub fn with_config(
        driver_type: &str,
        root: impl Into<PathBuf>,
        config: MemoryDriverConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            driver_type: driver_type.to_string(),
            root: root.into(),
            config,
            volumes: DashMap::new(),
        })
    }

    /// Factory producing one memory driver per root
    pub fn factory(config: MemoryDriverConfig) -> impl DriverFactory {
        move |root: PathBuf| {
            let config = config.clone();
            async move {
                let driver: Arc<dyn Driver> = MemoryDriver::with_config(MEMORY_DRIVER, root, config);
                Ok::<_, Error>(driver)
            }
        }
    }

    /// Concrete handle to a volume, for callers that read and write content
    pub fn volume(&self, name: &str) -> Option<Arc<MemoryVolume>> {
        self.volumes.get(name).map(|v| v.value().clone())
    }

    /// Bytes held by live data and snapshots of every volume
    pub fn used_bytes(&self) -> u64 {
        let volumes: Vec<Arc<MemoryVolume>> =
            self.volumes.iter().map(|v| v.value().clone()).collect();
        volumes.iter().map(|v| v.stored_bytes()).sum()
    }

    fn lookup(&self, name: &str) -> Result<Arc<MemoryVolume>> {
        self.volume(name).ok_or_else(|| Error::VolumeNotFound {
            volume: name.to_string(),
        })
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn root(&self) -> &Path {
        &self.root
    }

    fn driver_type(&self) -> &str {
        &self.driver_type
    }

    async fn create(&self, volume_name: &str) -> Result<Arc<dyn Volume>> {
        validate_name("volume", volume_name)?;

        let volume: Arc<dyn Volume> = match self.volumes.entry(volume_name.to_string()) {
            Entry::Occupied(_) => {
                return Err(Error::VolumeExists {
                    volume: volume_name.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                let volume = Arc::new(MemoryVolume {
                    name: volume_name.to_string(),
                    path: self.root.join(volume_name),
                    snapshot_root: self.root.join(".snapshots").join(volume_name),
                    compression_level: self.config.compression_level,
                    driver: self.me.clone(),
                    state: Mutex::new(VolumeState::default()),
                });
                slot.insert(volume.clone());
                volume
            }
        };

        info!(driver = %self.driver_type, volume = volume_name, "Created volume");
        Ok(volume)
    }

    async fn get(&self, volume_name: &str) -> Result<Arc<dyn Volume>> {
        validate_name("volume", volume_name)?;
        let volume: Arc<dyn Volume> = self.lookup(volume_name)?;
        Ok(volume)
    }

    async fn remove(&self, volume_name: &str) -> Result<()> {
        if self.volumes.remove(volume_name).is_some() {
            info!(driver = %self.driver_type, volume = volume_name, "Removed volume");
        }
        Ok(())
    }

    async fn release(&self, volume_name: &str) -> Result<()> {
        debug!(driver = %self.driver_type, volume = volume_name, "Released volume");
        Ok(())
    }

    async fn exists(&self, volume_name: &str) -> bool {
        self.volumes.contains_key(volume_name)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.volumes.iter().map(|v| v.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn cleanup(&self) -> Result<()> {
        debug!(
            driver = %self.driver_type,
            root = %self.root.display(),
            volumes = self.volumes.len(),
            "Memory driver cleanup"
        );
        Ok(())
    }

    async fn status(&self) -> Result<Status> {
        let used = self.used_bytes();
        Ok(Status {
            driver: self.driver_type.clone(),
            data_space_available: self.config.capacity_bytes.saturating_sub(used),
            data_space_used: used,
            data_space_total: self.config.capacity_bytes,
            pool_name: format!("mem:{}", self.root.display()),
            sector_size: 512,
            ..Default::default()
        })
    }

    async fn resize(&self, request: &ResizeRequest) -> Result<()> {
        request.validate()?;
        let volume = self.lookup(&request.volume_name)?;

        if request.size > self.config.capacity_bytes {
            return Err(Error::InvalidResize(format!(
                "size {} exceeds pool capacity {}",
                request.size, self.config.capacity_bytes
            )));
        }

        let mut state = volume.state.lock();
        let live = state.live_bytes();
        if request.size < live {
            return Err(Error::InvalidResize(format!(
                "volume {} uses {} bytes, cannot shrink to {}",
                request.volume_name, live, request.size
            )));
        }
        let previous = state.quota.replace(request.size);
        drop(state);

        info!(
            volume = %request.volume_name,
            from = ?previous,
            to = request.size,
            "Resized volume"
        );
        Ok(())
    }
}

// =============================================================================
// Memory Volume
// =============================================================================

#[derive(Debug, Clone)]
struct MemorySnapshot {
    files: BTreeMap<String, Bytes>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct VolumeState {
    files: BTreeMap<String, Bytes>,
    snapshots: BTreeMap<String, MemorySnapshot>,
    quota: Option<u64>,
}

impl VolumeState {
    fn live_bytes(&self) -> u64 {
        self.files.values().map(|b| b.len() as u64).sum()
    }
}

/// Serialized form of an exported memory snapshot
#[derive(Debug, Serialize, Deserialize)]
struct MemoryExport {
    format: String,
    volume: String,
    label: String,
    parent: Option<String>,
    created_at: DateTime<Utc>,
    files: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    deleted: Vec<String>,
}

/// A volume of the in-memory driver
pub struct MemoryVolume {
    name: String,
    path: PathBuf,
    snapshot_root: PathBuf,
    compression_level: i32,
    driver: Weak<MemoryDriver>,
    state: Mutex<VolumeState>,
}

impl MemoryVolume {
    /// Write a file at `rel`, a path relative to the volume root
    pub fn write_file(&self, rel: &str, data: impl Into<Bytes>) -> Result<()> {
        let key = file_key(rel)?;
        let data = data.into();

        let mut state = self.state.lock();
        if let Some(quota) = state.quota {
            let current = state.files.get(&key).map(|b| b.len() as u64).unwrap_or(0);
            let after = state.live_bytes() - current + data.len() as u64;
            if after > quota {
                return Err(Error::InsufficientSpace {
                    requested: after,
                    available: quota,
                });
            }
        }
        state.files.insert(key, data);
        Ok(())
    }

    pub fn read_file(&self, rel: &str) -> Option<Bytes> {
        let key = file_key(rel).ok()?;
        self.state.lock().files.get(&key).cloned()
    }

    /// Delete a file; returns whether it was present
    pub fn remove_file(&self, rel: &str) -> bool {
        match file_key(rel) {
            Ok(key) => self.state.lock().files.remove(&key).is_some(),
            Err(_) => false,
        }
    }

    /// Relative paths of all live files
    pub fn files(&self) -> Vec<String> {
        self.state.lock().files.keys().cloned().collect()
    }

    /// Allocation set by the last resize, if any
    pub fn quota(&self) -> Option<u64> {
        self.state.lock().quota
    }

    fn stored_bytes(&self) -> u64 {
        let state = self.state.lock();
        let snapshots: u64 = state
            .snapshots
            .values()
            .flat_map(|s| s.files.values())
            .map(|b| b.len() as u64)
            .sum();
        state.live_bytes() + snapshots
    }

    fn not_found(&self, label: &str) -> Error {
        Error::SnapshotDoesNotExist {
            volume: self.name.clone(),
            label: label.to_string(),
        }
    }

    fn build_export(
        &self,
        label: &str,
        parent: Option<&str>,
        excludes: &[String],
    ) -> Result<MemoryExport> {
        let state = self.state.lock();
        let snapshot = state.snapshots.get(label).ok_or_else(|| self.not_found(label))?;
        let base = match parent {
            Some(p) => Some(state.snapshots.get(p).ok_or_else(|| self.not_found(p))?),
            None => None,
        };

        let kept = |path: &str| !is_excluded(Path::new(path), excludes);

        let files = snapshot
            .files
            .iter()
            .filter(|(path, _)| kept(path.as_str()))
            .filter(|(path, data)| base.and_then(|b| b.files.get(*path)) != Some(*data))
            .map(|(path, data)| (path.clone(), data.to_vec()))
            .collect();

        let deleted = base
            .map(|b| {
                b.files
                    .keys()
                    .filter(|path| kept(path.as_str()) && !snapshot.files.contains_key(*path))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(MemoryExport {
            format: EXPORT_FORMAT.to_string(),
            volume: self.name.clone(),
            label: label.to_string(),
            parent: parent.map(str::to_string),
            created_at: snapshot.created_at,
            files,
            deleted,
        })
    }
}

#[async_trait]
impl Volume for MemoryVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn driver(&self) -> Option<Arc<dyn Driver>> {
        self.driver.upgrade().map(|d| d as Arc<dyn Driver>)
    }

    fn tenant(&self) -> &str {
        tenant_of(&self.name)
    }

    async fn snapshot(&self, label: &str) -> Result<()> {
        validate_name("snapshot", label)?;

        let mut state = self.state.lock();
        if state.snapshots.contains_key(label) {
            return Err(Error::SnapshotExists {
                volume: self.name.clone(),
                label: label.to_string(),
            });
        }
        let snapshot = MemorySnapshot {
            files: state.files.clone(),
            created_at: Utc::now(),
        };
        state.snapshots.insert(label.to_string(), snapshot);
        drop(state);

        info!(volume = %self.name, label, "Created snapshot");
        Ok(())
    }

    fn snapshot_metadata_path(&self, label: &str) -> PathBuf {
        self.snapshot_root.join(label).join("metadata")
    }

    async fn snapshots(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().snapshots.keys().cloned().collect())
    }

    async fn remove_snapshot(&self, label: &str) -> Result<()> {
        if self.state.lock().snapshots.remove(label).is_none() {
            return Err(self.not_found(label));
        }
        info!(volume = %self.name, label, "Removed snapshot");
        Ok(())
    }

    async fn rollback(&self, label: &str) -> Result<()> {
        let mut state = self.state.lock();
        let files = state
            .snapshots
            .get(label)
            .map(|s| s.files.clone())
            .ok_or_else(|| self.not_found(label))?;
        state.files = files;
        drop(state);

        info!(volume = %self.name, label, "Rolled back volume");
        Ok(())
    }

    async fn export_filtered(
        &self,
        label: &str,
        parent: Option<&str>,
        filename: &Path,
        excludes: &[String],
    ) -> Result<()> {
        let export = self.build_export(label, parent, excludes)?;
        let files = export.files.len();
        let level = self.compression_level;
        let target = filename.to_path_buf();

        blocking(move || {
            let json = serde_json::to_vec(&export)?;
            let compressed = zstd::encode_all(json.as_slice(), level)?;
            write_atomic(&target, &compressed)
        })
        .await?;

        info!(
            volume = %self.name,
            label,
            parent = ?parent,
            files,
            path = %filename.display(),
            "Exported snapshot"
        );
        Ok(())
    }

    async fn import(&self, label: &str, filename: &Path) -> Result<()> {
        validate_name("snapshot", label)?;
        if self.state.lock().snapshots.contains_key(label) {
            return Err(Error::SnapshotExists {
                volume: self.name.clone(),
                label: label.to_string(),
            });
        }

        let source = filename.to_path_buf();
        let export: MemoryExport = blocking(move || {
            let compressed = std::fs::read(&source)?;
            let json = zstd::decode_all(compressed.as_slice()).map_err(|e| Error::InvalidExport {
                path: source.clone(),
                reason: e.to_string(),
            })?;
            serde_json::from_slice(&json).map_err(|e| Error::InvalidExport {
                path: source.clone(),
                reason: e.to_string(),
            })
        })
        .await?;

        if export.format != EXPORT_FORMAT {
            return Err(Error::InvalidExport {
                path: filename.to_path_buf(),
                reason: format!("unsupported format {:?}", export.format),
            });
        }
        if export.volume != self.name {
            warn!(
                volume = %self.name,
                source_volume = %export.volume,
                "Importing snapshot exported from a different volume"
            );
        }

        let mut state = self.state.lock();
        if state.snapshots.contains_key(label) {
            return Err(Error::SnapshotExists {
                volume: self.name.clone(),
                label: label.to_string(),
            });
        }

        let mut files = match &export.parent {
            Some(parent) => state
                .snapshots
                .get(parent)
                .map(|s| s.files.clone())
                .ok_or_else(|| self.not_found(parent))?,
            None => BTreeMap::new(),
        };
        for path in &export.deleted {
            files.remove(path);
        }
        for (path, data) in export.files {
            files.insert(file_key(&path)?, Bytes::from(data));
        }

        state.snapshots.insert(
            label.to_string(),
            MemorySnapshot {
                files,
                created_at: export.created_at,
            },
        );
        drop(state);

        info!(volume = %self.name, label, parent = ?export.parent, "Imported snapshot");
        Ok(())
    }

    async fn usage(&self, excludes: &[String]) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .files
            .iter()
            .filter(|(path, _)| !is_excluded(Path::new(path), excludes))
            .map(|(_, data)| data.len() as u64)
            .sum())
    }
}

/// Normalize a volume-relative file path into its map key
fn file_key(rel: &str) -> Result<String> {
    let cleaned = clean_path(Path::new(rel));
    let valid = !rel.is_empty()
        && cleaned
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        return Err(Error::InvalidName {
            kind: "file",
            name: rel.to_string(),
        });
    }
    Ok(cleaned.to_string_lossy().into_owned())
}
