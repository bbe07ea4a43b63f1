//! Control Plane Module
//!
//! Orchestrators coordinating drivers and volumes: mount, status and
//! resize across every cached driver, plus whole-system backup and restore.

pub mod backup;
pub mod orchestrator;

pub use backup::*;
pub use orchestrator::*;
