//! Error types for the Volume Lifecycle Manager
//!
//! Provides structured error types for the driver registry, the volume and
//! snapshot contracts, status aggregation and backup/restore orchestration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// A single failed item inside an aggregate operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Root path or volume name the failure belongs to
    pub key: String,
    /// Error category of the failure
    pub kind: ErrorKind,
    /// Rendered error message
    pub reason: String,
}

impl FailedItem {
    pub fn new(key: impl Into<String>, error: &Error) -> Self {
        Self {
            key: key.into(),
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

impl std::fmt::Display for FailedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.reason)
    }
}

/// Unified error type for the volume manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Driver Registry Errors
    // =========================================================================
    #[error("Invalid driver initializer: {0}")]
    InvalidDriverInit(String),

    #[error("Driver exists: {driver}")]
    DriverExists { driver: String },

    #[error("Driver not supported: {driver}")]
    DriverNotSupported { driver: String },

    #[error("Driver not found for volume {volume}")]
    DriverNotFound { volume: String },

    #[error("Volume {volume} is claimed by more than one driver: {roots:?}")]
    AmbiguousVolume { volume: String, roots: Vec<String> },

    #[error("Unable to shutdown {} driver(s): {}", failures.len(), join_failures(failures))]
    BadDriverShutdown { failures: Vec<FailedItem> },

    // =========================================================================
    // Volume Errors
    // =========================================================================
    #[error("Volume not found: {volume}")]
    VolumeNotFound { volume: String },

    #[error("Volume exists: {volume}")]
    VolumeExists { volume: String },

    #[error("Invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("Invalid resize request: {0}")]
    InvalidResize(String),

    // =========================================================================
    // Snapshot Errors
    // =========================================================================
    #[error("Snapshot exists: {volume}/{label}")]
    SnapshotExists { volume: String, label: String },

    #[error("Snapshot does not exist: {volume}/{label}")]
    SnapshotDoesNotExist { volume: String, label: String },

    #[error("Could not remove snapshot {volume}/{label}: {reason}")]
    RemovingSnapshot {
        volume: String,
        label: String,
        reason: String,
    },

    #[error("Invalid snapshot export {path}: {reason}")]
    InvalidExport { path: PathBuf, reason: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {driver} - {reason}")]
    BackendUnavailable { driver: String, reason: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Backup/Restore Errors
    // =========================================================================
    #[error("Insufficient space: requested {requested} bytes, available {available} bytes")]
    InsufficientSpace { requested: u64, available: u64 },

    #[error("Invalid backup request: {0}")]
    InvalidBackupRequest(String),

    #[error("Invalid backup archive {path}: {reason}")]
    InvalidArchive { path: PathBuf, reason: String },

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error category shared by every operation in the crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Driver type, volume, snapshot or resource absent
    NotFound,
    /// Driver, volume or snapshot present when absence was required
    AlreadyExists,
    /// Malformed request, name or initializer
    InvalidInput,
    /// Backing store inaccessible or failing
    BackendUnavailable,
    /// Partial failure across several drivers
    AggregateFailure,
    /// Backup estimate exceeds available capacity
    InsufficientSpace,
    /// Everything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::AlreadyExists => write!(f, "already_exists"),
            ErrorKind::InvalidInput => write!(f, "invalid_input"),
            ErrorKind::BackendUnavailable => write!(f, "backend_unavailable"),
            ErrorKind::AggregateFailure => write!(f, "aggregate_failure"),
            ErrorKind::InsufficientSpace => write!(f, "insufficient_space"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Map this error onto the shared taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DriverNotSupported { .. }
            | Error::DriverNotFound { .. }
            | Error::VolumeNotFound { .. }
            | Error::SnapshotDoesNotExist { .. }
            | Error::ResourceNotFound { .. } => ErrorKind::NotFound,

            Error::DriverExists { .. }
            | Error::VolumeExists { .. }
            | Error::SnapshotExists { .. } => ErrorKind::AlreadyExists,

            Error::InvalidDriverInit(_)
            | Error::InvalidName { .. }
            | Error::InvalidResize(_)
            | Error::InvalidExport { .. }
            | Error::InvalidBackupRequest(_)
            | Error::InvalidArchive { .. }
            | Error::AmbiguousVolume { .. }
            | Error::Configuration(_)
            | Error::CapacityParse(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorKind::InvalidInput,

            Error::BackendUnavailable { .. }
            | Error::BackendOperationFailed { .. }
            | Error::RemovingSnapshot { .. } => ErrorKind::BackendUnavailable,

            Error::BadDriverShutdown { .. } => ErrorKind::AggregateFailure,

            Error::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,

            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                std::io::ErrorKind::InvalidInput => ErrorKind::InvalidInput,
                _ => ErrorKind::BackendUnavailable,
            },

            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Wrap a backend failure for the given driver and operation
    pub fn backend(
        backend: impl Into<String>,
        operation: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        Error::BackendOperationFailed {
            backend: backend.into(),
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

fn join_failures(failures: &[FailedItem]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for the volume manager
pub type Result<T> = std::result::Result<T, Error>;
