//! volumectl - Volume Lifecycle Manager CLI
//!
//! Drives the built-in `mem` and `dir` volume drivers and the backup
//! orchestrator from the command line. Results are printed to stdout as
//! JSON; logs go to stderr.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_lifecycle::{
    config::ManagerConfig,
    controlplane::{
        BackupManager, BackupSettings, DirectoryImageStore, MemoryDefinitionStore,
        StatvfsDiskSpace, VolumeOrchestrator,
    },
    domain::{BackupRequest, Driver, ResizeRequest, RestoreRequest, Volume},
    drivers::register_builtin,
    metrics::VolumeMetrics,
    registry::DriverRegistry,
    units::parse_capacity,
    Error, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Lifecycle Manager - snapshots, rollback and backup/restore of
/// application volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML)
    #[arg(long, short, env = "VOLUMECTL_CONFIG")]
    config: Option<PathBuf>,

    /// Driver type, overriding the configuration
    #[arg(long, env = "VOLUMECTL_DRIVER")]
    driver: Option<String>,

    /// Volumes root, overriding the configuration
    #[arg(long, env = "VOLUMECTL_ROOT")]
    root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Get or create a volume
    Mount { volume: String },

    /// Driver status, per root or for the drivers owning the named volumes
    Status { volumes: Vec<String> },

    /// Change a volume's allocation, e.g. `10Gi`
    Resize { volume: String, size: String },

    /// Snapshot a volume
    Snapshot { volume: String, label: String },

    /// List a volume's snapshots
    Snapshots { volume: String },

    /// Delete a snapshot
    RemoveSnapshot { volume: String, label: String },

    /// Restore a volume to a snapshot
    Rollback { volume: String, label: String },

    /// Export a snapshot to a file
    Export {
        volume: String,
        label: String,
        output: PathBuf,
        /// Export only the changes since this snapshot
        #[arg(long)]
        parent: Option<String>,
        /// Path inside the volume to leave out (repeatable)
        #[arg(long = "exclude")]
        excludes: Vec<String>,
    },

    /// Import an exported snapshot under a label
    Import {
        volume: String,
        label: String,
        input: PathBuf,
    },

    /// Estimate the space a backup needs
    Estimate(BackupArgs),

    /// Write a backup archive
    Backup {
        #[command(flatten)]
        backup: BackupArgs,
        /// Proceed even when the estimate exceeds free space
        #[arg(long)]
        force: bool,
    },

    /// Restore from a backup archive
    Restore { archive: PathBuf },

    /// Registered driver types and cached driver instances
    Drivers,
}

#[derive(clap::Args, Debug)]
struct BackupArgs {
    /// Destination directory, defaults to the configured backup directory
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Path inside each tenant volume to leave out (repeatable)
    #[arg(long = "exclude")]
    excludes: Vec<String>,

    /// Snapshot headroom as a percentage of volume data
    #[arg(long)]
    snapshot_space_percent: Option<u32>,
}

impl BackupArgs {
    fn request(&self, config: &ManagerConfig, force: bool) -> BackupRequest {
        BackupRequest {
            dirpath: self.dir.clone().unwrap_or_else(|| config.backup_dir.clone()),
            excludes: self.excludes.clone(),
            force,
            snapshot_space_percent: self
                .snapshot_space_percent
                .unwrap_or(config.snapshot_space_percent),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;
    info!(
        version = volume_lifecycle::VERSION,
        driver = %config.driver,
        root = %config.volumes_root.display(),
        "Starting volumectl"
    );

    let registry = DriverRegistry::new();
    register_builtin(&registry, config.memory_driver()?, config.directory_driver())?;
    let metrics = Arc::new(VolumeMetrics::new()?);
    let orchestrator = VolumeOrchestrator::new(registry.clone(), metrics);

    let result = run(args.command, &config, &orchestrator).await;

    registry.shutdown_all().await?;
    result
}

fn load_config(args: &Args) -> Result<ManagerConfig> {
    let mut config = match &args.config {
        Some(path) => ManagerConfig::from_yaml_file(path)?,
        None => ManagerConfig::default(),
    };
    if let Some(driver) = &args.driver {
        config.driver = driver.clone();
    }
    if let Some(root) = &args.root {
        config.volumes_root = root.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(
    command: Command,
    config: &ManagerConfig,
    orchestrator: &Arc<VolumeOrchestrator>,
) -> Result<()> {
    match command {
        Command::Mount { volume } => {
            let volume = orchestrator
                .mount(&config.driver, &volume, &config.volumes_root)
                .await?;
            print_json(&VolumeInfo::of(volume.as_ref()))
        }
        Command::Status { volumes } => {
            // Bind the configured root so the registry knows about it
            driver(config, orchestrator).await?;
            print_json(&orchestrator.get_status(&volumes).await)
        }
        Command::Resize { volume, size } => {
            let request = ResizeRequest::new(volume, parse_capacity(&size)?);
            driver(config, orchestrator).await?;
            orchestrator.resize(&request).await?;
            print_json(&request)
        }
        Command::Snapshot { volume, label } => {
            let volume = existing_volume(config, orchestrator, &volume).await?;
            volume.snapshot(&label).await?;
            print_json(&volume.snapshots().await?)
        }
        Command::Snapshots { volume } => {
            let volume = existing_volume(config, orchestrator, &volume).await?;
            print_json(&volume.snapshots().await?)
        }
        Command::RemoveSnapshot { volume, label } => {
            let volume = existing_volume(config, orchestrator, &volume).await?;
            volume.remove_snapshot(&label).await?;
            print_json(&volume.snapshots().await?)
        }
        Command::Rollback { volume, label } => {
            let volume = existing_volume(config, orchestrator, &volume).await?;
            volume.rollback(&label).await?;
            print_json(&VolumeInfo::of(volume.as_ref()))
        }
        Command::Export {
            volume,
            label,
            output,
            parent,
            excludes,
        } => {
            let volume = existing_volume(config, orchestrator, &volume).await?;
            volume
                .export_filtered(&label, parent.as_deref(), &output, &excludes)
                .await?;
            print_json(&output)
        }
        Command::Import {
            volume,
            label,
            input,
        } => {
            let volume = orchestrator
                .mount(&config.driver, &volume, &config.volumes_root)
                .await?;
            volume.import(&label, &input).await?;
            print_json(&volume.snapshots().await?)
        }
        Command::Estimate(backup) => {
            let manager = backup_manager(config, orchestrator)?;
            let estimate = manager
                .get_backup_estimate(&backup.request(config, false))
                .await?;
            print_json(&estimate)
        }
        Command::Backup { backup, force } => {
            let manager = backup_manager(config, orchestrator)?;
            let archive = manager.backup(&backup.request(config, force)).await?;
            print_json(&archive)
        }
        Command::Restore { archive } => {
            let manager = backup_manager(config, orchestrator)?;
            let report = manager.restore(&RestoreRequest { filename: archive }).await?;
            print_json(&report)
        }
        Command::Drivers => print_json(&orchestrator.summary()),
    }
}

async fn driver(
    config: &ManagerConfig,
    orchestrator: &VolumeOrchestrator,
) -> Result<Arc<dyn Driver>> {
    orchestrator
        .registry()
        .get_driver(&config.driver, &config.volumes_root)
        .await
}

async fn existing_volume(
    config: &ManagerConfig,
    orchestrator: &VolumeOrchestrator,
    name: &str,
) -> Result<Arc<dyn Volume>> {
    driver(config, orchestrator).await?.get(name).await
}

fn backup_manager(
    config: &ManagerConfig,
    orchestrator: &Arc<VolumeOrchestrator>,
) -> Result<Arc<BackupManager>> {
    let definitions = MemoryDefinitionStore::from_file(config.definitions_path())?;
    Ok(BackupManager::new(
        orchestrator.clone(),
        BackupSettings::from(config),
        Arc::new(definitions),
        Arc::new(DirectoryImageStore::new(config.image_store_path())),
        Arc::new(StatvfsDiskSpace),
    ))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VolumeInfo {
    name: String,
    tenant: String,
    path: PathBuf,
}

impl VolumeInfo {
    fn of(volume: &dyn Volume) -> Self {
        Self {
            name: volume.name().to_string(),
            tenant: volume.tenant().to_string(),
            path: volume.path().to_path_buf(),
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(Error::from)?;
    println!("{}", rendered);
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
