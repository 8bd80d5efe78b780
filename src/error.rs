//! Error type shared by the library.
//!
//! Device-level failures carry their own transient/fatal classification in
//! [`DeviceError`](crate::capture::DeviceError); this enum is what setup and
//! finalization surface to the caller.

use std::path::PathBuf;

use thiserror::Error;

use crate::capture::DeviceError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    InvalidConfig(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Camera configuration failed at '{step}': {reason}")]
    Configure { step: &'static str, reason: String },

    #[error("Camera index {index} not found ({available} cameras available)")]
    CameraNotFound { index: usize, available: usize },

    #[error("Cannot release device system: {0} camera handle(s) still open")]
    HandlesOutstanding(usize),

    #[error("Failed to write metadata to '{}': {source}", path.display())]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to serialize camera parameters: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Thread error: {0}")]
    Thread(String),
}
