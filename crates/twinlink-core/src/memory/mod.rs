//! In-memory collaborators for testing, development and simulation

pub mod cloud;
pub mod instrument;

pub use cloud::{MemoryChannel, MemoryCloud};
pub use instrument::{MemoryInstrument, MemorySession};
