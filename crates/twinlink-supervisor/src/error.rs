use thiserror::Error;

/// Errors that prevent a fleet from running
#[derive(Debug, Error)]
pub enum FleetError {
    /// Missing or malformed configuration; nothing was started
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every configured device failed to initialize
    #[error("no device could be initialized ({failed} failed)")]
    NoDevices { failed: usize },
}
