//! The per-frame pull primitive the acquisition loop is written against.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::frame::Frame;

/// Whether retrying the failed operation can be expected to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Not ready yet or busy; retry after a short backoff.
    Transient,
    /// Retrying will not help.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => f.write_str("transient"),
            ErrorKind::Fatal => f.write_str("fatal"),
        }
    }
}

/// Error reported by a camera backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} device error: {msg}")]
pub struct DeviceError {
    kind: ErrorKind,
    msg: String,
}

impl DeviceError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            msg: msg.into(),
        }
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            msg: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn message(&self) -> &str {
        &self.msg
    }
}

/// A grabbed frame still backed by a device buffer slot.
///
/// Dropping the buffer hands the slot back to the device.
pub trait FrameBuffer {
    fn timestamp_ns(&self) -> u64;

    /// Copy the pixel payload out of the device slot.
    fn extract(&self) -> Frame;
}

/// Outcome of a single bounded grab.
pub enum GrabOutcome<B> {
    Success(B),
    NotYetAvailable,
    StreamEnded,
}

impl<B> fmt::Debug for GrabOutcome<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrabOutcome::Success(_) => f.write_str("Success"),
            GrabOutcome::NotYetAvailable => f.write_str("NotYetAvailable"),
            GrabOutcome::StreamEnded => f.write_str("StreamEnded"),
        }
    }
}

/// Streaming side of a camera handle.
pub trait FrameSource: Send {
    type Buffer: FrameBuffer;

    fn start_streaming(&mut self) -> Result<(), DeviceError>;

    fn is_streaming(&self) -> bool;

    /// Wait at most `timeout` for the next frame.
    fn grab(&mut self, timeout: Duration) -> Result<GrabOutcome<Self::Buffer>, DeviceError>;

    fn stop_streaming(&mut self) -> Result<(), DeviceError>;

    /// Release the device handle. Streaming must already be stopped.
    fn close(&mut self) -> Result<(), DeviceError>;
}
