//! Test doubles shared by unit tests across modules

use crate::domain::names::tenant_of;
use crate::domain::ports::{Driver, DriverFactory, ResizeRequest, Status, Volume};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Factory creating a fresh healthy [`StubDriver`] per root
pub fn stub_factory() -> impl DriverFactory {
    |root: PathBuf| async move {
        let driver: Arc<dyn Driver> = StubDriver::builder(root).build();
        Ok::<_, Error>(driver)
    }
}

/// Factory handing out one prepared instance for every root
pub fn fixed_factory(driver: Arc<StubDriver>) -> impl DriverFactory {
    move |_root: PathBuf| {
        let driver: Arc<dyn Driver> = driver.clone();
        async move { Ok::<_, Error>(driver) }
    }
}

pub struct StubDriverBuilder {
    root: PathBuf,
    driver_type: String,
    fail_cleanup: bool,
    fail_status: bool,
    status: Status,
}

impl StubDriverBuilder {
    pub fn driver_type(mut self, driver_type: &str) -> Self {
        self.driver_type = driver_type.to_string();
        self
    }

    pub fn fail_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    pub fn fail_status(mut self) -> Self {
        self.fail_status = true;
        self
    }

    pub fn data_space_available(mut self, bytes: u64) -> Self {
        self.status.data_space_available = bytes;
        self
    }

    pub fn build(self) -> Arc<StubDriver> {
        Arc::new_cyclic(|me| StubDriver {
            me: me.clone(),
            root: self.root,
            status: Status {
                driver: self.driver_type.clone(),
                ..self.status
            },
            driver_type: self.driver_type,
            fail_cleanup: self.fail_cleanup,
            fail_status: self.fail_status,
            volumes: Mutex::new(BTreeMap::new()),
            cleanups: AtomicUsize::new(0),
            resizes: Mutex::new(Vec::new()),
        })
    }
}

/// Driver whose volumes report a configured usage without holding data
pub struct StubDriver {
    me: Weak<StubDriver>,
    root: PathBuf,
    driver_type: String,
    fail_cleanup: bool,
    fail_status: bool,
    status: Status,
    volumes: Mutex<BTreeMap<String, Arc<StubVolume>>>,
    cleanups: AtomicUsize,
    resizes: Mutex<Vec<ResizeRequest>>,
}

impl StubDriver {
    pub fn builder(root: impl Into<PathBuf>) -> StubDriverBuilder {
        StubDriverBuilder {
            root: root.into(),
            driver_type: "stub".to_string(),
            fail_cleanup: false,
            fail_status: false,
            status: Status::default(),
        }
    }

    pub fn add_volume(&self, name: &str, usage: u64) -> Arc<StubVolume> {
        let volume = Arc::new(StubVolume {
            name: name.to_string(),
            path: self.root.join(name),
            usage,
            driver: self.me.clone(),
            labels: Mutex::new(BTreeSet::new()),
        });
        self.volumes.lock().insert(name.to_string(), volume.clone());
        volume
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub fn resizes(&self) -> Vec<ResizeRequest> {
        self.resizes.lock().clone()
    }
}

#[async_trait]
impl Driver for StubDriver {
    fn root(&self) -> &Path {
        &self.root
    }

    fn driver_type(&self) -> &str {
        &self.driver_type
    }

    async fn create(&self, volume_name: &str) -> Result<Arc<dyn Volume>> {
        if self.volumes.lock().contains_key(volume_name) {
            return Err(Error::VolumeExists {
                volume: volume_name.to_string(),
            });
        }
        Ok(self.add_volume(volume_name, 0))
    }

    async fn get(&self, volume_name: &str) -> Result<Arc<dyn Volume>> {
        self.volumes
            .lock()
            .get(volume_name)
            .map(|v| v.clone() as Arc<dyn Volume>)
            .ok_or_else(|| Error::VolumeNotFound {
                volume: volume_name.to_string(),
            })
    }

    async fn remove(&self, volume_name: &str) -> Result<()> {
        self.volumes.lock().remove(volume_name);
        Ok(())
    }

    async fn release(&self, _volume_name: &str) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, volume_name: &str) -> bool {
        self.volumes.lock().contains_key(volume_name)
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.volumes.lock().keys().cloned().collect())
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup {
            return Err(Error::backend(&self.driver_type, "cleanup", "device busy"));
        }
        Ok(())
    }

    async fn status(&self) -> Result<Status> {
        if self.fail_status {
            return Err(Error::BackendUnavailable {
                driver: self.driver_type.clone(),
                reason: "pool offline".into(),
            });
        }
        Ok(self.status.clone())
    }

    async fn resize(&self, request: &ResizeRequest) -> Result<()> {
        if !self.volumes.lock().contains_key(&request.volume_name) {
            return Err(Error::VolumeNotFound {
                volume: request.volume_name.clone(),
            });
        }
        self.resizes.lock().push(request.clone());
        Ok(())
    }
}

/// Volume reporting a fixed usage; exports write a small marker file
pub struct StubVolume {
    name: String,
    path: PathBuf,
    usage: u64,
    driver: Weak<StubDriver>,
    labels: Mutex<BTreeSet<String>>,
}

#[async_trait]
impl Volume for StubVolume {
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
        if !self.labels.lock().insert(label.to_string()) {
            return Err(Error::SnapshotExists {
                volume: self.name.clone(),
                label: label.to_string(),
            });
        }
        Ok(())
    }

    fn snapshot_metadata_path(&self, label: &str) -> PathBuf {
        self.path.join(".snapshots").join(label)
    }

    async fn snapshots(&self) -> Result<Vec<String>> {
        Ok(self.labels.lock().iter().cloned().collect())
    }

    async fn remove_snapshot(&self, label: &str) -> Result<()> {
        if !self.labels.lock().remove(label) {
            return Err(Error::SnapshotDoesNotExist {
                volume: self.name.clone(),
                label: label.to_string(),
            });
        }
        Ok(())
    }

    async fn rollback(&self, label: &str) -> Result<()> {
        if !self.labels.lock().contains(label) {
            return Err(Error::SnapshotDoesNotExist {
                volume: self.name.clone(),
                label: label.to_string(),
            });
        }
        Ok(())
    }

    async fn export_filtered(
        &self,
        label: &str,
        _parent: Option<&str>,
        filename: &Path,
        _excludes: &[String],
    ) -> Result<()> {
        if !self.labels.lock().contains(label) {
            return Err(Error::SnapshotDoesNotExist {
                volume: self.name.clone(),
                label: label.to_string(),
            });
        }
        tokio::fs::write(filename, format!("{}:{}", self.name, label)).await?;
        Ok(())
    }

    async fn import(&self, label: &str, filename: &Path) -> Result<()> {
        tokio::fs::metadata(filename).await?;
        self.snapshot(label).await
    }

    async fn usage(&self, _excludes: &[String]) -> Result<u64> {
        Ok(self.usage)
    }
}

/// Free-space probe reporting a fixed amount for every path
pub struct FixedDiskSpace(pub u64);

impl crate::domain::ports::DiskSpace for FixedDiskSpace {
    fn available_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.0)
    }
}
