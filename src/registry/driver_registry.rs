//! Driver Registry
//!
//! Maps driver type names to factories and root paths to the one live
//! driver instance bound there. Both maps sit behind a single lock that is
//! held only for the map operation itself: factories and `cleanup()` run
//! with the lock released so slow backend I/O never blocks unrelated drivers.

use crate::domain::ports::{Driver, DriverFactory};
use crate::error::{Error, FailedItem, Result};
use crate::fsutil::clean_path;
use crate::registry::RegistryEvent;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Capacity of the registry event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Registry Statistics
// =============================================================================

/// Counters kept by the registry
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Driver types registered
    pub registrations: AtomicU64,
    /// Driver types unregistered
    pub unregistrations: AtomicU64,
    /// Driver instances created by factories and cached
    pub initializations: AtomicU64,
    /// Lookups answered from the instance cache
    pub cache_hits: AtomicU64,
    /// Instances evicted by unregister
    pub evictions: AtomicU64,
}

impl RegistryStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            registrations: self.registrations.load(Ordering::Relaxed),
            unregistrations: self.unregistrations.load(Ordering::Relaxed),
            initializations: self.initializations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of registry statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatsSnapshot {
    pub registrations: u64,
    pub unregistrations: u64,
    pub initializations: u64,
    pub cache_hits: u64,
    pub evictions: u64,
}

// =============================================================================
// Driver Registry
// =============================================================================

#[derive(Default)]
struct RegistryState {
    /// Factories by driver type
    drivers: HashMap<String, Arc<dyn DriverFactory>>,
    /// Live instances by cleaned root path
    drivers_by_root: BTreeMap<PathBuf, Arc<dyn Driver>>,
}

/// Registry of driver factories and live driver instances
pub struct DriverRegistry {
    state: RwLock<RegistryState>,
    stats: RegistryStats,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("DriverRegistry")
            .field("drivers", &state.drivers.keys().collect::<Vec<_>>())
            .field("roots", &state.drivers_by_root.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(RegistryState::default()),
            stats: RegistryStats::default(),
            event_sender,
        }
    }
}

impl DriverRegistry {
    /// Create a new, empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        debug!(event = event.name(), "{}", event);
        let _ = self.event_sender.send(event);
    }

    /// Register a driver factory under `name`
    pub fn register<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: DriverFactory + 'static,
    {
        if name.trim().is_empty() {
            return Err(Error::InvalidDriverInit(
                "driver type name must not be empty".into(),
            ));
        }

        {
            let mut state = self.state.write();
            if state.drivers.contains_key(name) {
                return Err(Error::DriverExists {
                    driver: name.to_string(),
                });
            }
            state.drivers.insert(name.to_string(), Arc::new(factory));
        }

        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        info!(driver = name, "Registered volume driver");
        self.emit(RegistryEvent::DriverRegistered {
            driver: name.to_string(),
        });
        Ok(())
    }

    /// Remove the factory for `name` and evict every live instance reporting
    /// that type, whatever its root. Unknown names are a no-op.
    ///
    /// Returns the roots whose instances were evicted.
    pub fn unregister(&self, name: &str) -> Vec<PathBuf> {
        let (removed, evicted) = {
            let mut state = self.state.write();
            let removed = state.drivers.remove(name).is_some();
            let evicted: Vec<PathBuf> = state
                .drivers_by_root
                .iter()
                .filter(|(_, driver)| driver.driver_type() == name)
                .map(|(root, _)| root.clone())
                .collect();
            for root in &evicted {
                state.drivers_by_root.remove(root);
            }
            (removed, evicted)
        };

        if removed || !evicted.is_empty() {
            self.stats.unregistrations.fetch_add(1, Ordering::Relaxed);
            self.stats
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            info!(
                driver = name,
                evicted = evicted.len(),
                "Unregistered volume driver"
            );
            self.emit(RegistryEvent::DriverUnregistered {
                driver: name.to_string(),
                evicted_roots: evicted.clone(),
            });
        }

        evicted
    }

    /// Whether a driver type has been registered
    pub fn registered(&self, name: &str) -> bool {
        self.state.read().drivers.contains_key(name)
    }

    /// Names of all registered driver types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the driver of type `name` bound to `root`
    ///
    /// The same instance is returned for a root every time, whatever type is
    /// requested; callers must not ask for conflicting types on one root.
    pub async fn get_driver(&self, name: &str, root: impl AsRef<Path>) -> Result<Arc<dyn Driver>> {
        let root = clean_path(root.as_ref());
        debug!(driver = name, root = %root.display(), "Looking up driver");

        let factory = {
            let state = self.state.read();
            let factory = state
                .drivers
                .get(name)
                .cloned()
                .ok_or_else(|| Error::DriverNotSupported {
                    driver: name.to_string(),
                })?;
            if let Some(driver) = state.drivers_by_root.get(&root) {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(driver.clone());
            }
            factory
        };

        // No instance yet: initialize without holding the lock
        let created = factory.init(&root).await.map_err(|e| {
            error!(driver = name, root = %root.display(), error = %e, "Driver initialization failed");
            e
        })?;

        let (driver, discarded) = {
            let mut state = self.state.write();
            match state.drivers_by_root.get(&root) {
                Some(existing) => (existing.clone(), Some(created)),
                None => {
                    state.drivers_by_root.insert(root.clone(), created.clone());
                    (created, None)
                }
            }
        };

        match discarded {
            Some(duplicate) => {
                debug!(driver = name, root = %root.display(), "Lost initialization race; discarding instance");
                if let Err(e) = duplicate.cleanup().await {
                    warn!(driver = name, root = %root.display(), error = %e, "Cleanup of discarded driver failed");
                }
                self.emit(RegistryEvent::DriverDiscarded {
                    driver: name.to_string(),
                    root,
                });
            }
            None => {
                self.stats.initializations.fetch_add(1, Ordering::Relaxed);
                info!(driver = name, root = %root.display(), "Initialized volume driver");
                self.emit(RegistryEvent::DriverInitialized {
                    driver: name.to_string(),
                    root,
                });
            }
        }

        Ok(driver)
    }

    /// The cached instance for `root`, if any
    pub fn cached(&self, root: impl AsRef<Path>) -> Option<Arc<dyn Driver>> {
        let root = clean_path(root.as_ref());
        self.state.read().drivers_by_root.get(&root).cloned()
    }

    /// Snapshot of all cached instances keyed by root
    ///
    /// The snapshot holds its own references, so instances evicted while a
    /// caller iterates stay usable until dropped.
    pub fn drivers(&self) -> Vec<(PathBuf, Arc<dyn Driver>)> {
        self.state
            .read()
            .drivers_by_root
            .iter()
            .map(|(root, driver)| (root.clone(), driver.clone()))
            .collect()
    }

    /// Number of cached instances
    pub fn driver_count(&self) -> usize {
        self.state.read().drivers_by_root.len()
    }

    /// Clean up every cached instance
    ///
    /// Every instance is attempted even after failures; failures are
    /// collected into [`Error::BadDriverShutdown`].
    pub async fn shutdown_all(&self) -> Result<()> {
        let drivers = self.drivers();
        let mut failures = Vec::new();

        for (root, driver) in &drivers {
            debug!(driver = driver.driver_type(), root = %root.display(), "Shutting down driver");
            if let Err(e) = driver.cleanup().await {
                error!(
                    driver = driver.driver_type(),
                    root = %root.display(),
                    error = %e,
                    "Unable to clean up driver"
                );
                self.emit(RegistryEvent::DriverCleanupFailed {
                    root: root.clone(),
                    reason: e.to_string(),
                });
                failures.push(FailedItem::new(root.display().to_string(), &e));
            }
        }

        self.emit(RegistryEvent::ShutdownCompleted {
            drivers: drivers.len(),
            failures: failures.len(),
        });

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::BadDriverShutdown { failures })
        }
    }

    /// Get registry statistics
    pub fn stats(&self) -> RegistryStatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MemoryDriver;
    use crate::error::ErrorKind;
    use crate::testing::{stub_factory, StubDriver};
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn memory_factory() -> impl DriverFactory {
        |root: PathBuf| async move {
            let driver: Arc<dyn Driver> = MemoryDriver::new("mem", root);
            Ok::<_, Error>(driver)
        }
    }

    #[test]
    fn test_register_duplicate_and_invalid() {
        let registry = DriverRegistry::new();

        registry.register("mem", memory_factory()).unwrap();
        assert!(registry.registered("mem"));
        assert!(!registry.registered("dir"));

        let err = registry.register("mem", memory_factory()).unwrap_err();
        assert_matches!(err, Error::DriverExists { ref driver } if driver == "mem");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let err = registry.register("  ", memory_factory()).unwrap_err();
        assert_matches!(err, Error::InvalidDriverInit(_));

        assert_eq!(registry.registered_types(), vec!["mem".to_string()]);
        assert_eq!(registry.stats().registrations, 1);
    }

    #[tokio::test]
    async fn test_get_driver_identity_stability() {
        let registry = DriverRegistry::new();
        registry.register("mem", memory_factory()).unwrap();

        let first = registry.get_driver("mem", "/r1").await.unwrap();
        let second = registry.get_driver("mem", "/r1/").await.unwrap();
        let other = registry.get_driver("mem", "/r2").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.root(), Path::new("/r1"));
        assert_eq!(registry.driver_count(), 2);

        let stats = registry.stats();
        assert_eq!(stats.initializations, 2);
        assert_eq!(stats.cache_hits, 1);
    }

    #[tokio::test]
    async fn test_get_driver_not_supported() {
        let registry = DriverRegistry::new();
        let err = registry.get_driver("btrfs", "/r1").await.unwrap_err();
        assert_matches!(err, Error::DriverNotSupported { .. });
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(registry.driver_count(), 0);
    }

    #[tokio::test]
    async fn test_cached_root_returned_regardless_of_type() {
        let registry = DriverRegistry::new();
        registry.register("mem", memory_factory()).unwrap();
        registry
            .register("mem2", |root: PathBuf| async move {
                let driver: Arc<dyn Driver> = MemoryDriver::new("mem2", root);
                Ok::<_, Error>(driver)
            })
            .unwrap();

        let first = registry.get_driver("mem", "/r1").await.unwrap();
        let second = registry.get_driver("mem2", "/r1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.driver_type(), "mem");
    }

    #[tokio::test]
    async fn test_factory_failure_is_not_cached() {
        let registry = DriverRegistry::new();
        registry
            .register("broken", |root: PathBuf| async move {
                Err::<Arc<dyn Driver>, _>(Error::BackendUnavailable {
                    driver: "broken".into(),
                    reason: format!("cannot open {}", root.display()),
                })
            })
            .unwrap();

        let err = registry.get_driver("broken", "/r1").await.unwrap_err();
        assert_matches!(err, Error::BackendUnavailable { .. });
        assert!(registry.cached("/r1").is_none());
    }

    #[tokio::test]
    async fn test_unregister_evicts_instances_of_that_type() {
        let registry = DriverRegistry::new();
        registry.register("mem", memory_factory()).unwrap();
        registry.register("stub", stub_factory()).unwrap();
        let mut events = registry.subscribe();

        registry.get_driver("mem", "/r1").await.unwrap();
        registry.get_driver("mem", "/r2").await.unwrap();
        registry.get_driver("stub", "/r3").await.unwrap();

        let evicted = registry.unregister("mem");
        assert_eq!(evicted, vec![PathBuf::from("/r1"), PathBuf::from("/r2")]);
        assert!(!registry.registered("mem"));
        assert!(registry.cached("/r1").is_none());
        assert!(registry.cached("/r3").is_some());

        // Unknown names are a no-op
        assert!(registry.unregister("nope").is_empty());

        let mut saw_unregister = false;
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::DriverUnregistered { driver, evicted_roots } = event {
                assert_eq!(driver, "mem");
                assert_eq!(evicted_roots.len(), 2);
                saw_unregister = true;
            }
        }
        assert!(saw_unregister);
        assert_eq!(registry.stats().evictions, 2);
    }

    #[tokio::test]
    async fn test_concurrent_get_driver_yields_one_instance() {
        let registry = DriverRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry
            .register("mem", move |root: PathBuf| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    let driver: Arc<dyn Driver> = MemoryDriver::new("mem", root);
                    Ok::<_, Error>(driver)
                }
            })
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_driver("mem", "/shared").await })
            })
            .collect();

        let mut drivers = Vec::new();
        for handle in handles {
            drivers.push(handle.await.unwrap().unwrap());
        }

        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert!(drivers.iter().all(|d| Arc::ptr_eq(d, &drivers[0])));
        assert_eq!(registry.driver_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_attempts_every_driver() {
        let registry = DriverRegistry::new();
        let failing = StubDriver::builder("/failing").fail_cleanup().build();
        let healthy = StubDriver::builder("/healthy").build();

        let (f, h) = (failing.clone(), healthy.clone());
        registry
            .register("stub", move |root: PathBuf| {
                let driver: Arc<dyn Driver> = if root == Path::new("/failing") {
                    f.clone()
                } else {
                    h.clone()
                };
                async move { Ok::<_, Error>(driver) }
            })
            .unwrap();

        registry.get_driver("stub", "/failing").await.unwrap();
        registry.get_driver("stub", "/healthy").await.unwrap();

        let err = registry.shutdown_all().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AggregateFailure);
        assert_matches!(err, Error::BadDriverShutdown { ref failures } if failures.len() == 1 && failures[0].key == "/failing");

        assert_eq!(failing.cleanup_calls(), 1);
        assert_eq!(healthy.cleanup_calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_success() {
        let registry = DriverRegistry::new();
        registry.register("mem", memory_factory()).unwrap();
        registry.get_driver("mem", "/r1").await.unwrap();

        assert!(registry.shutdown_all().await.is_ok());
    }
}
