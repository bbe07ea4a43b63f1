//! Driver Registry Module
//!
//! Process-wide mapping of driver types to factories and of root paths to
//! the single live driver instance bound there.

pub mod driver_registry;
pub mod events;

pub use driver_registry::*;
pub use events::*;
