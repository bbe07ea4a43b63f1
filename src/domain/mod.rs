//! Domain layer - Core types and port definitions
//!
//! This module defines the driver and volume contracts that backends
//! implement, plus the request and manifest types used by the
//! orchestrators, following hexagonal architecture principles.

pub mod backup;
pub mod names;
pub mod ports;
pub mod service;

pub use backup::*;
pub use names::*;
pub use ports::*;
pub use service::*;
