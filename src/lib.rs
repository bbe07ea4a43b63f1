//! Volume Lifecycle Manager
//!
//! A pluggable volume driver framework: storage backends register a driver
//! type, the registry binds one driver instance per filesystem root, and the
//! orchestrators build mount, status, resize and backup/restore on top.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Control Plane                           │
//! │  ┌───────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │    VolumeOrchestrator     │  │       BackupManager         │  │
//! │  │  mount / status / resize  │  │  estimate / backup / restore│  │
//! │  └─────────────┬─────────────┘  └──────────────┬──────────────┘  │
//! │                └───────────────┬───────────────┘                 │
//! │                    ┌───────────┴───────────┐                     │
//! │                    │    DriverRegistry     │                     │
//! │                    │ type → factory        │                     │
//! │                    │ root → driver         │                     │
//! │                    └───────────┬───────────┘                     │
//! ├────────────────────────────────┼─────────────────────────────────┤
//! │                     Drivers (Driver + Volume)                    │
//! │  ┌─────────────────────────┐  ┌────────────────────────────────┐ │
//! │  │   mem (in-process)      │  │   dir (directory trees)        │ │
//! │  └─────────────────────────┘  └────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: volume and backup orchestrators
//! - [`registry`]: driver type and instance registry
//! - [`drivers`]: built-in `mem` and `dir` backends
//! - [`domain`]: driver/volume ports and request types
//! - [`config`]: YAML configuration
//! - [`error`]: error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod drivers;
pub mod error;
pub mod fsutil;
pub mod metrics;
pub mod registry;
pub mod units;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::ManagerConfig;

pub use controlplane::{
    BackupManager, BackupSettings, DirectoryImageStore, MemoryDefinitionStore,
    OrchestratorSummary, StatvfsDiskSpace, VolumeOrchestrator,
};

pub use domain::{
    BackupEstimate, BackupRequest, DefinitionStore, DiskSpace, Driver, DriverFactory,
    ImageStore, ResizeRequest, RestoreReport, RestoreRequest, ServiceDefinition,
    ServiceTemplate, Status, Statuses, Volume,
};

pub use drivers::{register_builtin, DirectoryDriver, MemoryDriver};

pub use error::{Error, ErrorKind, Result};

pub use metrics::VolumeMetrics;

pub use registry::{DriverRegistry, RegistryEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
