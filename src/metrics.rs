//! Prometheus metrics for volume operations
//!
//! Metrics live in a private registry per [`VolumeMetrics`] so several
//! orchestrators (and parallel tests) never collide on metric names.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

const NAMESPACE: &str = "volume_manager";

/// Metric bundle owned by the orchestrators
pub struct VolumeMetrics {
    registry: Registry,
    operations: IntCounterVec,
    durations: HistogramVec,
    cached_drivers: IntGauge,
    last_archive_bytes: IntGauge,
}

impl VolumeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Volume operations by name and outcome")
                .namespace(NAMESPACE),
            &["operation", "outcome"],
        )
        .map_err(metric_error)?;
        let durations = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Duration of volume operations")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
            &["operation"],
        )
        .map_err(metric_error)?;
        let cached_drivers = IntGauge::with_opts(
            Opts::new("cached_drivers", "Driver instances cached by root").namespace(NAMESPACE),
        )
        .map_err(metric_error)?;
        let last_archive_bytes = IntGauge::with_opts(
            Opts::new("last_backup_archive_bytes", "Size of the most recent backup archive")
                .namespace(NAMESPACE),
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(durations.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(cached_drivers.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(last_archive_bytes.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            operations,
            durations,
            cached_drivers,
            last_archive_bytes,
        })
    }

    /// Record one finished operation
    pub fn observe<T>(&self, operation: &str, started: Instant, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => "success",
            Err(e) => match e.kind() {
                crate::error::ErrorKind::NotFound => "not_found",
                crate::error::ErrorKind::AlreadyExists => "already_exists",
                crate::error::ErrorKind::InvalidInput => "invalid_input",
                crate::error::ErrorKind::InsufficientSpace => "insufficient_space",
                _ => "error",
            },
        };
        self.observe_outcome(operation, outcome, started);
    }

    /// Record one finished operation with an explicit outcome label
    pub fn observe_outcome(&self, operation: &str, outcome: &str, started: Instant) {
        self.operations
            .with_label_values(&[operation, outcome])
            .inc();
        self.durations
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn set_cached_drivers(&self, count: usize) {
        self.cached_drivers.set(count as i64);
    }

    pub fn set_last_archive_bytes(&self, bytes: u64) {
        self.last_archive_bytes.set(bytes.min(i64::MAX as u64) as i64);
    }

    /// Count of recorded operations with the given name and outcome
    pub fn operation_count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, outcome])
            .get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metric_error(err: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", err))
}
