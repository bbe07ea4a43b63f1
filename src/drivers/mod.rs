//! Built-in Volume Drivers
//!
//! - `mem`: volumes held in process memory, for tests and ephemeral roots
//! - `dir`: volumes as plain directory trees beneath the driver root

pub mod directory;
pub mod memory;

pub use directory::{DirectoryDriver, DirectoryDriverConfig, DirectoryVolume};
pub use memory::{MemoryDriver, MemoryDriverConfig, MemoryVolume};

use crate::error::Result;
use crate::registry::DriverRegistry;
use tracing::info;

/// Type name of the in-memory driver
pub const MEMORY_DRIVER: &str = "mem";

/// Type name of the directory driver
pub const DIRECTORY_DRIVER: &str = "dir";

/// Default zstd level for snapshot exports
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Register every built-in driver type with `registry`
pub fn register_builtin(
    registry: &DriverRegistry,
    memory: MemoryDriverConfig,
    directory: DirectoryDriverConfig,
) -> Result<()> {
    registry.register(MEMORY_DRIVER, MemoryDriver::factory(memory))?;
    registry.register(DIRECTORY_DRIVER, DirectoryDriver::factory(directory))?;
    info!(
        drivers = ?[MEMORY_DRIVER, DIRECTORY_DRIVER],
        "Registered built-in drivers"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_register_builtin_drivers() {
        let registry = DriverRegistry::new();
        register_builtin(
            &registry,
            MemoryDriverConfig::default(),
            DirectoryDriverConfig::default(),
        )
        .unwrap();

        assert!(registry.registered(MEMORY_DRIVER));
        assert!(registry.registered(DIRECTORY_DRIVER));

        let err = register_builtin(
            &registry,
            MemoryDriverConfig::default(),
            DirectoryDriverConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let tmp = TempDir::new().unwrap();
        let driver = registry.get_driver(DIRECTORY_DRIVER, tmp.path()).await.unwrap();
        assert_eq!(driver.driver_type(), DIRECTORY_DRIVER);
    }
}
