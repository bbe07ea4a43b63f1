//! Registry Events
//!
//! Events emitted by the driver registry for external consumers to react to
//! driver lifecycle changes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Events emitted by the driver registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A driver type was registered
    DriverRegistered { driver: String },

    /// A driver type was unregistered and its live instances evicted
    DriverUnregistered {
        driver: String,
        evicted_roots: Vec<PathBuf>,
    },

    /// A driver instance was initialized and cached for a root
    DriverInitialized { driver: String, root: PathBuf },

    /// A concurrently initialized instance lost the race for a root and was
    /// cleaned up
    DriverDiscarded { driver: String, root: PathBuf },

    /// Cleanup of a cached instance failed during shutdown
    DriverCleanupFailed { root: PathBuf, reason: String },

    /// All cached instances were shut down
    ShutdownCompleted { drivers: usize, failures: usize },
}

impl RegistryEvent {
    /// Short event name for logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            RegistryEvent::DriverRegistered { .. } => "driver_registered",
            RegistryEvent::DriverUnregistered { .. } => "driver_unregistered",
            RegistryEvent::DriverInitialized { .. } => "driver_initialized",
            RegistryEvent::DriverDiscarded { .. } => "driver_discarded",
            RegistryEvent::DriverCleanupFailed { .. } => "driver_cleanup_failed",
            RegistryEvent::ShutdownCompleted { .. } => "shutdown_completed",
        }
    }
}

impl std::fmt::Display for RegistryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryEvent::DriverRegistered { driver } => write!(f, "registered {}", driver),
            RegistryEvent::DriverUnregistered {
                driver,
                evicted_roots,
            } => write!(
                f,
                "unregistered {} ({} instance(s) evicted)",
                driver,
                evicted_roots.len()
            ),
            RegistryEvent::DriverInitialized { driver, root } => {
                write!(f, "initialized {} at {}", driver, root.display())
            }
            RegistryEvent::DriverDiscarded { driver, root } => {
                write!(f, "discarded duplicate {} at {}", driver, root.display())
            }
            RegistryEvent::DriverCleanupFailed { root, reason } => {
                write!(f, "cleanup failed at {}: {}", root.display(), reason)
            }
            RegistryEvent::ShutdownCompleted { drivers, failures } => {
                write!(f, "shut down {} driver(s), {} failure(s)", drivers, failures)
            }
        }
    }
}
