//! Volume Orchestrator
//!
//! Front door for the RPC layer: mounts volumes through the driver registry,
//! aggregates driver status and routes resize requests to the driver that
//! owns a volume.

use crate::domain::ports::{Driver, ResizeRequest, Statuses, Volume};
use crate::error::{Error, FailedItem, Result};
use crate::metrics::VolumeMetrics;
use crate::registry::{DriverRegistry, RegistryStatsSnapshot};
use futures::future::join_all;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Coordinates mount, status and resize across all cached drivers
pub struct VolumeOrchestrator {
    registry: Arc<DriverRegistry>,
    metrics: Arc<VolumeMetrics>,
}

impl VolumeOrchestrator {
    pub fn new(registry: Arc<DriverRegistry>, metrics: Arc<VolumeMetrics>) -> Arc<Self> {
        Arc::new(Self { registry, metrics })
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<VolumeMetrics> {
        &self.metrics
    }

    /// Get or create `volume_name` on the `driver_name` driver bound to `root`
    pub async fn mount(
        &self,
        driver_name: &str,
        volume_name: &str,
        root: impl AsRef<Path>,
    ) -> Result<Arc<dyn Volume>> {
        let started = Instant::now();
        let result = self.mount_inner(driver_name, volume_name, root.as_ref()).await;
        self.metrics.observe("mount", started, &result);
        self.metrics.set_cached_drivers(self.registry.driver_count());
        result
    }

    async fn mount_inner(
        &self,
        driver_name: &str,
        volume_name: &str,
        root: &Path,
    ) -> Result<Arc<dyn Volume>> {
        let driver = self.registry.get_driver(driver_name, root).await?;

        if driver.exists(volume_name).await {
            debug!(driver = driver_name, volume = volume_name, "Mounting existing volume");
            return driver.get(volume_name).await;
        }

        match driver.create(volume_name).await {
            Ok(volume) => {
                info!(
                    driver = driver_name,
                    root = %root.display(),
                    volume = volume_name,
                    "Mounted new volume"
                );
                Ok(volume)
            }
            // Another caller created it between the probe and our create
            Err(Error::VolumeExists { .. }) => driver.get(volume_name).await,
            Err(e) => Err(e),
        }
    }

    /// Status per cached driver (keyed by root) when `volume_names` is empty,
    /// otherwise status of each named volume's owning driver (keyed by name).
    ///
    /// Never fails as a whole: unknown names are skipped and driver errors
    /// are reported in [`Statuses::failures`].
    pub async fn get_status(&self, volume_names: &[String]) -> Statuses {
        let started = Instant::now();
        let mut statuses = Statuses::default();

        if volume_names.is_empty() {
            let drivers = self.registry.drivers();
            let results = join_all(drivers.iter().map(|(_, driver)| driver.status())).await;
            for ((root, _), result) in drivers.iter().zip(results) {
                let key = root.display().to_string();
                match result {
                    Ok(status) => {
                        statuses.status_map.insert(key, status);
                    }
                    Err(e) => {
                        warn!(root = %key, error = %e, "Driver status failed");
                        statuses.failures.push(FailedItem::new(key, &e));
                    }
                }
            }
        } else {
            for name in volume_names {
                let driver = match self.resolve_owner(name).await {
                    Ok(Some(driver)) => driver,
                    Ok(None) => {
                        debug!(volume = %name, "No driver owns volume, skipping");
                        continue;
                    }
                    Err(e) => {
                        warn!(volume = %name, error = %e, "Cannot resolve volume owner");
                        statuses.failures.push(FailedItem::new(name.clone(), &e));
                        continue;
                    }
                };
                match driver.status().await {
                    Ok(status) => {
                        statuses.status_map.insert(name.clone(), status);
                    }
                    Err(e) => {
                        warn!(volume = %name, error = %e, "Driver status failed");
                        statuses.failures.push(FailedItem::new(name.clone(), &e));
                    }
                }
            }
        }

        let outcome = if statuses.is_complete() { "success" } else { "partial" };
        self.metrics.observe_outcome("status", outcome, started);
        statuses
    }

    /// Validate and route a resize to the volume's owning driver
    pub async fn resize(&self, request: &ResizeRequest) -> Result<()> {
        let started = Instant::now();
        let result = self.resize_inner(request).await;
        self.metrics.observe("resize", started, &result);
        result
    }

    async fn resize_inner(&self, request: &ResizeRequest) -> Result<()> {
        request.validate()?;
        let driver = self
            .resolve_owner(&request.volume_name)
            .await?
            .ok_or_else(|| Error::DriverNotFound {
                volume: request.volume_name.clone(),
            })?;

        driver.resize(request).await?;
        info!(
            volume = %request.volume_name,
            root = %driver.root().display(),
            size = request.size,
            "Resize delegated"
        );
        Ok(())
    }

    /// Find the single cached driver holding `volume_name`
    ///
    /// Every cached driver is probed with `exists`, concurrently. No match
    /// yields `None`; more than one is a configuration error.
    pub async fn resolve_owner(&self, volume_name: &str) -> Result<Option<Arc<dyn Driver>>> {
        let drivers = self.registry.drivers();
        let found = join_all(drivers.iter().map(|(_, driver)| driver.exists(volume_name))).await;
        let mut owners: Vec<(PathBuf, Arc<dyn Driver>)> = drivers
            .into_iter()
            .zip(found)
            .filter_map(|(entry, exists)| exists.then_some(entry))
            .collect();

        match owners.len() {
            0 => Ok(None),
            1 => Ok(owners.pop().map(|(_, driver)| driver)),
            _ => Err(Error::AmbiguousVolume {
                volume: volume_name.to_string(),
                roots: owners
                    .iter()
                    .map(|(root, _)| root.display().to_string())
                    .collect(),
            }),
        }
    }

    /// Summary of registry state
    pub fn summary(&self) -> OrchestratorSummary {
        OrchestratorSummary {
            driver_types: self.registry.registered_types(),
            cached_roots: self
                .registry
                .drivers()
                .into_iter()
                .map(|(root, driver)| CachedDriver {
                    root: root.display().to_string(),
                    driver_type: driver.driver_type().to_string(),
                })
                .collect(),
            stats: self.registry.stats(),
        }
    }
}

/// A cached driver instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedDriver {
    pub root: String,
    pub driver_type: String,
}

/// Orchestrator state summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorSummary {
    pub driver_types: Vec<String>,
    pub cached_roots: Vec<CachedDriver>,
    pub stats: RegistryStatsSnapshot,
}
