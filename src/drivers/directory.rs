//! Directory Volume Driver
//!
//! Volumes are plain directory trees beneath the driver root:
//!
//! ```text
//! volumes/<name>/                        live data
//! snapshots/<name>/<label>/data/         snapshot content
//! snapshots/<name>/<label>/metadata/     snapshot metadata
//! meta/<name>.json                       volume metadata
//! ```
//!
//! Entries whose names start with `.` are staging areas. Every mutation is
//! built in staging and renamed into place, so an interrupted operation leaves
//! the old tree or the new one. Staging leftovers are recovered or swept when
//! a driver is initialized for the root.

use crate::domain::names::{tenant_of, validate_name};
use crate::domain::ports::{Driver, DriverFactory, ResizeRequest, Status, Volume};
use crate::drivers::{DEFAULT_COMPRESSION_LEVEL, DIRECTORY_DRIVER};
use crate::error::{Error, Result};
use crate::fsutil::{
    blocking, clean_path, copy_tree, dir_size, fs_usage, is_excluded, remove_if_present,
    walk_error, write_atomic,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const VOLUMES_DIR: &str = "volumes";
const SNAPSHOTS_DIR: &str = "snapshots";
const META_DIR: &str = "meta";
const DATA_DIR: &str = "data";
const METADATA_DIR: &str = "metadata";
const SNAPSHOT_INFO_FILE: &str = "snapshot.json";
const EXPORT_HEADER_FILE: &str = "export.json";
const EXPORT_FORMAT: &str = "dir-export-v1";
/// Suffix of the directory holding live data while a rollback swaps it out
const ROLLBACK_SUFFIX: &str = ".old";

/// Configuration for the directory driver
#[derive(Debug, Clone)]
pub struct DirectoryDriverConfig {
    /// zstd level used for exports
    pub compression_level: i32,
}

impl Default for DirectoryDriverConfig {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Persisted per-volume metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeMetadata {
    name: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    quota_bytes: Option<u64>,
}

/// Descriptive metadata stored with every snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotInfo {
    volume: String,
    label: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    parent: Option<String>,
    data_bytes: u64,
}

/// First entry of every export archive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportHeader {
    format: String,
    driver: String,
    volume: String,
    label: String,
    parent: Option<String>,
    created_at: DateTime<Utc>,
    /// Paths present in the parent that the importer must delete
    #[serde(default)]
    deleted: Vec<String>,
    #[serde(default)]
    excludes: Vec<String>,
}

// =============================================================================
// Directory Driver
// =============================================================================

/// Driver storing volumes as directory trees
pub struct DirectoryDriver {
    me: Weak<DirectoryDriver>,
    driver_type: String,
    root: PathBuf,
    config: DirectoryDriverConfig,
    /// One async lock per volume, shared by every handle to that volume
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl DirectoryDriver {
    pub async fn new(driver_type: &str, root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        Self::with_config(driver_type, root, DirectoryDriverConfig::default()).await
    }

    /// Create the root layout and recover staging leftovers
    pub async fn with_config(
        driver_type: &str,
        root: impl Into<PathBuf>,
        config: DirectoryDriverConfig,
    ) -> Result<Arc<Self>> {
        let root = root.into();
        let layout_root = root.clone();
        let (recovered, swept) = blocking(move || prepare_root(&layout_root))
            .await
            .map_err(|e| Error::BackendUnavailable {
                driver: driver_type.to_string(),
                reason: format!("cannot prepare {}: {}", root.display(), e),
            })?;

        if recovered > 0 || swept > 0 {
            warn!(
                root = %root.display(),
                recovered,
                swept,
                "Cleaned up interrupted operations"
            );
        }
        info!(driver = driver_type, root = %root.display(), "Directory driver initialized");

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            driver_type: driver_type.to_string(),
            root,
            config,
            locks: DashMap::new(),
        }))
    }

    /// Factory producing one directory driver per root
    pub fn factory(config: DirectoryDriverConfig) -> impl DriverFactory {
        move |root: PathBuf| {
            let config = config.clone();
            async move {
                let driver: Arc<dyn Driver> =
                    DirectoryDriver::with_config(DIRECTORY_DRIVER, root, config).await?;
                Ok::<_, Error>(driver)
            }
        }
    }

    fn volumes_dir(&self) -> PathBuf {
        self.root.join(VOLUMES_DIR)
    }

    fn volume_path(&self, name: &str) -> PathBuf {
        self.volumes_dir().join(name)
    }

    fn meta_path(&self, name: &str) -> PathBuf {
        self.root.join(META_DIR).join(format!("{}.json", name))
    }

    fn volume_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.locks.entry(name.to_string()).or_default().clone()
    }

    fn handle(&self, name: &str) -> Arc<DirectoryVolume> {
        Arc::new(DirectoryVolume {
            name: name.to_string(),
            path: self.volume_path(name),
            volumes_dir: self.volumes_dir(),
            snapshots_dir: self.root.join(SNAPSHOTS_DIR).join(name),
            driver: self.me.clone(),
            driver_type: self.driver_type.clone(),
            compression_level: self.config.compression_level,
            lock: self.volume_lock(name),
        })
    }
}

#[async_trait]
impl Driver for DirectoryDriver {
    fn root(&self) -> &Path {
        &self.root
    }

    fn driver_type(&self) -> &str {
        &self.driver_type
    }

    async fn create(&self, volume_name: &str) -> Result<Arc<dyn Volume>> {
        validate_name("volume", volume_name)?;
        let volume = self.handle(volume_name);
        let guard = volume.lock.lock().await;

        let name = volume_name.to_string();
        let live = volume.path.clone();
        let snapshots = volume.snapshots_dir.clone();
        let meta_path = self.meta_path(volume_name);
        let driver_type = self.driver_type.clone();
        blocking(move || {
            match fs::create_dir(&live) {
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(Error::VolumeExists { volume: name })
                }
                other => other?,
            }
            let populated = fs::create_dir_all(&snapshots)
                .map_err(Error::from)
                .and_then(|_| {
                    let metadata = VolumeMetadata {
                        name: name.clone(),
                        created_at: Utc::now(),
                        quota_bytes: None,
                    };
                    write_atomic(&meta_path, &serde_json::to_vec_pretty(&metadata)?)
                });
            if let Err(e) = populated {
                // A half-created volume would block the next create
                if let Err(cleanup) = remove_if_present(&live) {
                    warn!(volume = %name, error = %cleanup, "Failed to remove partial volume");
                }
                return Err(Error::backend(driver_type, format!("create {}", name), e));
            }
            Ok(())
        })
        .await?;

        info!(driver = %self.driver_type, volume = volume_name, "Created volume");
        drop(guard);
        let volume: Arc<dyn Volume> = volume;
        Ok(volume)
    }

    async fn get(&self, volume_name: &str) -> Result<Arc<dyn Volume>> {
        validate_name("volume", volume_name)?;
        if !self.exists(volume_name).await {
            return Err(Error::VolumeNotFound {
                volume: volume_name.to_string(),
            });
        }
        let volume: Arc<dyn Volume> = self.handle(volume_name);
        Ok(volume)
    }

    async fn remove(&self, volume_name: &str) -> Result<()> {
        validate_name("volume", volume_name)?;
        let volume = self.handle(volume_name);
        let _guard = volume.lock.lock().await;

        let live = volume.path.clone();
        let snapshots = volume.snapshots_dir.clone();
        let meta_path = self.meta_path(volume_name);
        let existed = blocking(move || {
            let existed = live.exists();
            remove_if_present(&snapshots)?;
            remove_if_present(&live)?;
            remove_if_present(&meta_path)?;
            Ok(existed)
        })
        .await?;

        if existed {
            info!(driver = %self.driver_type, volume = volume_name, "Removed volume");
        }
        Ok(())
    }

    async fn release(&self, volume_name: &str) -> Result<()> {
        let released = self
            .locks
            .remove_if(volume_name, |_, lock| Arc::strong_count(lock) == 1)
            .is_some();
        debug!(volume = volume_name, released, "Released volume");
        Ok(())
    }

    async fn exists(&self, volume_name: &str) -> bool {
        if validate_name("volume", volume_name).is_err() {
            return false;
        }
        tokio::fs::metadata(self.volume_path(volume_name))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let dir = self.volumes_dir();
        blocking(move || visible_dirs(&dir)).await
    }

    async fn cleanup(&self) -> Result<()> {
        // Locks still shared with live handles stay so later handles queue
        // behind them
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        debug!(
            driver = %self.driver_type,
            root = %self.root.display(),
            released = before - self.locks.len(),
            held = self.locks.len(),
            "Directory driver cleanup"
        );
        Ok(())
    }

    async fn status(&self) -> Result<Status> {
        let root = self.root.clone();
        let driver_type = self.driver_type.clone();
        blocking(move || {
            let usage = fs_usage(&root).map_err(|e| Error::BackendUnavailable {
                driver: driver_type.clone(),
                reason: format!("statvfs {}: {}", root.display(), e),
            })?;
            let meta_dir = root.join(META_DIR);
            let metadata_used = dir_size(&meta_dir, &[])?;

            Ok(Status {
                driver: driver_type,
                data_space_available: usage.available_bytes,
                data_space_used: usage.used_bytes(),
                data_space_total: usage.total_bytes,
                metadata_space_available: usage.available_bytes,
                metadata_space_used: metadata_used,
                metadata_space_total: usage.total_bytes,
                pool_name: root.display().to_string(),
                data_file: root.join(VOLUMES_DIR).display().to_string(),
                metadata_file: meta_dir.display().to_string(),
                sector_size: usage.block_size,
                ..Default::default()
            })
        })
        .await
    }

    async fn resize(&self, request: &ResizeRequest) -> Result<()> {
        request.validate()?;
        validate_name("volume", &request.volume_name)?;
        let volume = self.handle(&request.volume_name);
        let _guard = volume.lock.lock().await;

        let name = request.volume_name.clone();
        let size = request.size;
        let live = volume.path.clone();
        let meta_path = self.meta_path(&request.volume_name);
        let previous = blocking(move || {
            if !live.is_dir() {
                return Err(Error::VolumeNotFound { volume: name });
            }
            let used = dir_size(&live, &[])?;
            if size < used {
                return Err(Error::InvalidResize(format!(
                    "volume {} uses {} bytes, cannot shrink to {}",
                    name, used, size
                )));
            }
            let mut metadata = match fs::read(&meta_path) {
                Ok(raw) => serde_json::from_slice::<VolumeMetadata>(&raw)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => VolumeMetadata {
                    name: name.clone(),
                    created_at: Utc::now(),
                    quota_bytes: None,
                },
                Err(e) => return Err(e.into()),
            };
            let previous = metadata.quota_bytes.replace(size);
            write_atomic(&meta_path, &serde_json::to_vec_pretty(&metadata)?)?;
            Ok(previous)
        })
        .await?;

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
// Directory Volume
// =============================================================================

/// Handle to one volume of a [`DirectoryDriver`]
pub struct DirectoryVolume {
    name: String,
    path: PathBuf,
    volumes_dir: PathBuf,
    snapshots_dir: PathBuf,
    driver: Weak<DirectoryDriver>,
    driver_type: String,
    compression_level: i32,
    lock: Arc<AsyncMutex<()>>,
}

impl DirectoryVolume {
    fn snapshot_dir(&self, label: &str) -> PathBuf {
        self.snapshots_dir.join(label)
    }

    fn not_found(&self, label: &str) -> Error {
        Error::SnapshotDoesNotExist {
            volume: self.name.clone(),
            label: label.to_string(),
        }
    }
}

#[async_trait]
impl Volume for DirectoryVolume {
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
        let _guard = self.lock.lock().await;

        let name = self.name.clone();
        let label_owned = label.to_string();
        let live = self.path.clone();
        let snapshots_dir = self.snapshots_dir.clone();
        let dest = self.snapshot_dir(label);
        let bytes = blocking(move || {
            if !live.is_dir() {
                return Err(Error::VolumeNotFound { volume: name });
            }
            if dest.exists() {
                return Err(Error::SnapshotExists {
                    volume: name,
                    label: label_owned,
                });
            }
            fs::create_dir_all(&snapshots_dir)?;
            let staging = tempfile::Builder::new()
                .prefix(".snapshot-")
                .tempdir_in(&snapshots_dir)?;
            let bytes = copy_tree(&live, &staging.path().join(DATA_DIR), &[])?;
            let info = SnapshotInfo {
                volume: name,
                label: label_owned,
                created_at: Utc::now(),
                parent: None,
                data_bytes: bytes,
            };
            write_snapshot_info(staging.path(), &info)?;
            fs::rename(staging.path(), &dest)?;
            Ok(bytes)
        })
        .await?;

        info!(volume = %self.name, label, bytes, "Created snapshot");
        Ok(())
    }

    fn snapshot_metadata_path(&self, label: &str) -> PathBuf {
        self.snapshot_dir(label).join(METADATA_DIR)
    }

    async fn snapshots(&self) -> Result<Vec<String>> {
        let dir = self.snapshots_dir.clone();
        blocking(move || visible_dirs(&dir)).await
    }

    async fn remove_snapshot(&self, label: &str) -> Result<()> {
        validate_name("snapshot", label)?;
        let _guard = self.lock.lock().await;

        let dest = self.snapshot_dir(label);
        if !tokio::fs::metadata(&dest).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(self.not_found(label));
        }
        blocking(move || fs::remove_dir_all(&dest).map_err(Error::from))
            .await
            .map_err(|e| Error::RemovingSnapshot {
                volume: self.name.clone(),
                label: label.to_string(),
                reason: e.to_string(),
            })?;

        info!(volume = %self.name, label, "Removed snapshot");
        Ok(())
    }

    async fn rollback(&self, label: &str) -> Result<()> {
        validate_name("snapshot", label)?;
        let _guard = self.lock.lock().await;

        let source = self.snapshot_dir(label).join(DATA_DIR);
        if !tokio::fs::metadata(&source).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(self.not_found(label));
        }

        let name = self.name.clone();
        let live = self.path.clone();
        let volumes_dir = self.volumes_dir.clone();
        blocking(move || {
            let staging = tempfile::Builder::new()
                .prefix(&format!(".{}.rollback-", name))
                .tempdir_in(&volumes_dir)?;
            let replacement = staging.path().join(DATA_DIR);
            copy_tree(&source, &replacement, &[])?;

            let old = volumes_dir.join(format!(".{}{}", name, ROLLBACK_SUFFIX));
            remove_if_present(&old)?;
            let had_live = live.exists();
            if had_live {
                fs::rename(&live, &old)?;
            }
            if let Err(e) = fs::rename(&replacement, &live) {
                if had_live {
                    if let Err(restore) = fs::rename(&old, &live) {
                        warn!(volume = %name, error = %restore, "Failed to restore live data");
                    }
                }
                return Err(e.into());
            }
            if let Err(e) = remove_if_present(&old) {
                warn!(volume = %name, error = %e, "Failed to remove replaced live data");
            }
            Ok(())
        })
        .await?;

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
        validate_name("snapshot", label)?;
        if let Some(p) = parent {
            validate_name("snapshot", p)?;
        }
        let _guard = self.lock.lock().await;

        let data = self.snapshot_dir(label).join(DATA_DIR);
        if !data.is_dir() {
            return Err(self.not_found(label));
        }
        let parent_data = match parent {
            Some(p) => {
                let dir = self.snapshot_dir(p).join(DATA_DIR);
                if !dir.is_dir() {
                    return Err(self.not_found(p));
                }
                Some(dir)
            }
            None => None,
        };

        let header = ExportHeader {
            format: EXPORT_FORMAT.to_string(),
            driver: self.driver_type.clone(),
            volume: self.name.clone(),
            label: label.to_string(),
            parent: parent.map(str::to_string),
            created_at: Utc::now(),
            deleted: Vec::new(),
            excludes: excludes.to_vec(),
        };
        let metadata = self.snapshot_metadata_path(label);
        let target = filename.to_path_buf();
        let level = self.compression_level;
        let entries = blocking(move || {
            write_export(header, &data, parent_data.as_deref(), &metadata, &target, level)
        })
        .await?;

        info!(
            volume = %self.name,
            label,
            parent = ?parent,
            entries,
            path = %filename.display(),
            "Exported snapshot"
        );
        Ok(())
    }

    async fn import(&self, label: &str, filename: &Path) -> Result<()> {
        validate_name("snapshot", label)?;
        let _guard = self.lock.lock().await;

        let name = self.name.clone();
        let label_owned = label.to_string();
        let snapshots_dir = self.snapshots_dir.clone();
        let source = filename.to_path_buf();
        let parent = blocking(move || import_archive(&name, &label_owned, &snapshots_dir, &source))
            .await?;

        info!(volume = %self.name, label, parent = ?parent, "Imported snapshot");
        Ok(())
    }

    async fn usage(&self, excludes: &[String]) -> Result<u64> {
        let live = self.path.clone();
        let excludes = excludes.to_vec();
        blocking(move || dir_size(&live, &excludes)).await
    }
}

// =============================================================================
// Blocking helpers
// =============================================================================

/// Create the root layout; returns (recovered volumes, swept staging entries)
fn prepare_root(root: &Path) -> Result<(usize, usize)> {
    let volumes = root.join(VOLUMES_DIR);
    let snapshots = root.join(SNAPSHOTS_DIR);
    fs::create_dir_all(&volumes)?;
    fs::create_dir_all(&snapshots)?;
    fs::create_dir_all(root.join(META_DIR))?;

    let mut recovered = 0;
    let mut swept = 0;

    for entry in fs::read_dir(&volumes)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(hidden) = file_name.strip_prefix('.') else {
            continue;
        };
        // A rollback interrupted between its two renames leaves live data
        // only in the swapped-out directory
        if let Some(volume) = hidden.strip_suffix(ROLLBACK_SUFFIX) {
            let live = volumes.join(volume);
            if !volume.is_empty() && !live.exists() {
                fs::rename(entry.path(), &live)?;
                recovered += 1;
                continue;
            }
        }
        remove_if_present(&entry.path())?;
        swept += 1;
    }

    for volume in fs::read_dir(&snapshots)? {
        let volume = volume?;
        if !volume.file_type()?.is_dir() {
            continue;
        }
        for entry in fs::read_dir(volume.path())? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with('.') {
                remove_if_present(&entry.path())?;
                swept += 1;
            }
        }
    }

    Ok((recovered, swept))
}

/// Sorted names of non-hidden subdirectories; empty if `dir` is absent
fn visible_dirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') && entry.file_type()?.is_dir() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn write_snapshot_info(snapshot_dir: &Path, info: &SnapshotInfo) -> Result<()> {
    let metadata = snapshot_dir.join(METADATA_DIR);
    fs::create_dir_all(&metadata)?;
    fs::write(
        metadata.join(SNAPSHOT_INFO_FILE),
        serde_json::to_vec_pretty(info)?,
    )?;
    Ok(())
}

fn relative(path: &Path, base: &Path) -> Result<PathBuf> {
    path.strip_prefix(base)
        .map(Path::to_path_buf)
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Paths present in `parent` but absent from (or of another type in) `data`
fn deleted_since(parent: &Path, data: &Path, excludes: &[String]) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    let mut walker = WalkDir::new(parent).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(walk_error)?;
        let rel = relative(entry.path(), parent)?;
        let is_dir = entry.file_type().is_dir();
        if is_excluded(&rel, excludes) {
            if is_dir {
                walker.skip_current_dir();
            }
            continue;
        }
        let gone = match fs::symlink_metadata(data.join(&rel)) {
            Ok(meta) => meta.file_type() != entry.file_type(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if gone {
            deleted.push(rel.to_string_lossy().into_owned());
            // Children go with their directory
            if is_dir {
                walker.skip_current_dir();
            }
        }
    }
    Ok(deleted)
}

/// Whether `ours` and `theirs` are regular files with identical content
fn same_contents(ours: &Path, theirs: &Path) -> io::Result<bool> {
    // Missing or shadowed by a file in place of a parent directory
    let their_meta = match fs::symlink_metadata(theirs) {
        Ok(meta) => meta,
        Err(_) => return Ok(false),
    };
    if !their_meta.is_file() || fs::metadata(ours)?.len() != their_meta.len() {
        return Ok(false);
    }

    let mut a = BufReader::new(File::open(ours)?);
    let mut b = BufReader::new(File::open(theirs)?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];
    loop {
        let n = a.read(&mut buf_a)?;
        if n == 0 {
            return Ok(true);
        }
        b.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

fn same_link(ours: &Path, theirs: &Path) -> bool {
    match (fs::read_link(ours), fs::read_link(theirs)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}

/// Write a snapshot export archive; returns the number of data entries
fn write_export(
    mut header: ExportHeader,
    data: &Path,
    parent: Option<&Path>,
    metadata: &Path,
    target: &Path,
    level: i32,
) -> Result<usize> {
    if let Some(parent) = parent {
        header.deleted = deleted_since(parent, data, &header.excludes)?;
    }

    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".export-")
        .tempfile_in(dir)?;

    let mut entries = 0usize;
    {
        let encoder = zstd::Encoder::new(tmp.as_file_mut(), level)?;
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        append_bytes(&mut builder, EXPORT_HEADER_FILE, &serde_json::to_vec_pretty(&header)?)?;
        builder.append_dir(DATA_DIR, data)?;

        let walker = WalkDir::new(data)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.path()
                    .strip_prefix(data)
                    .map(|rel| !is_excluded(rel, &header.excludes))
                    .unwrap_or(true)
            });
        for entry in walker {
            let entry = entry.map_err(walk_error)?;
            let rel = relative(entry.path(), data)?;
            let name = Path::new(DATA_DIR).join(&rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                builder.append_dir(&name, entry.path())?;
                continue;
            }
            if let Some(parent) = parent {
                let previous = parent.join(&rel);
                let unchanged = if file_type.is_symlink() {
                    same_link(entry.path(), &previous)
                } else {
                    same_contents(entry.path(), &previous)?
                };
                if unchanged {
                    continue;
                }
            }
            builder.append_path_with_name(entry.path(), &name)?;
            entries += 1;
        }

        if metadata.is_dir() {
            builder.append_dir_all(METADATA_DIR, metadata)?;
        }

        let encoder = builder.into_inner()?;
        encoder.finish()?;
    }

    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| Error::Io(e.error))?;
    Ok(entries)
}

/// Unpack an export archive as snapshot `label`; returns the delta parent
fn import_archive(
    volume: &str,
    label: &str,
    snapshots_dir: &Path,
    source: &Path,
) -> Result<Option<String>> {
    let dest = snapshots_dir.join(label);
    if dest.exists() {
        return Err(Error::SnapshotExists {
            volume: volume.to_string(),
            label: label.to_string(),
        });
    }
    let invalid = |reason: String| Error::InvalidExport {
        path: source.to_path_buf(),
        reason,
    };

    fs::create_dir_all(snapshots_dir)?;
    let staging = tempfile::Builder::new()
        .prefix(".import-")
        .tempdir_in(snapshots_dir)?;

    let file = File::open(source)?;
    let decoder = zstd::Decoder::new(file).map_err(|e| invalid(e.to_string()))?;
    tar::Archive::new(decoder)
        .unpack(staging.path())
        .map_err(|e| invalid(e.to_string()))?;

    let header_path = staging.path().join(EXPORT_HEADER_FILE);
    let raw = fs::read(&header_path).map_err(|_| invalid("missing export header".into()))?;
    let header: ExportHeader =
        serde_json::from_slice(&raw).map_err(|e| invalid(format!("bad export header: {}", e)))?;
    if header.format != EXPORT_FORMAT {
        return Err(invalid(format!("unsupported format {:?}", header.format)));
    }
    fs::remove_file(&header_path)?;

    for path in &header.deleted {
        let escapes = clean_path(Path::new(path))
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(invalid(format!("deleted entry {:?} escapes the volume", path)));
        }
    }

    let delta = staging.path().join(DATA_DIR);
    fs::create_dir_all(&delta)?;

    if let Some(parent) = &header.parent {
        let parent_data = snapshots_dir.join(parent).join(DATA_DIR);
        if !parent_data.is_dir() {
            return Err(Error::SnapshotDoesNotExist {
                volume: volume.to_string(),
                label: parent.clone(),
            });
        }
        let full = staging.path().join(".full");
        copy_tree(&parent_data, &full, &[])?;
        for path in &header.deleted {
            remove_if_present(&full.join(path))?;
        }
        copy_tree(&delta, &full, &[])?;
        fs::remove_dir_all(&delta)?;
        fs::rename(&full, &delta)?;
    }

    let info = SnapshotInfo {
        volume: volume.to_string(),
        label: label.to_string(),
        created_at: header.created_at,
        parent: header.parent.clone(),
        data_bytes: dir_size(&delta, &[])?,
    };
    write_snapshot_info(staging.path(), &info)?;

    if header.volume != volume {
        debug!(volume, source_volume = %header.volume, "Imported export of another volume");
    }
    fs::rename(staging.path(), &dest)?;
    Ok(header.parent)
}
