//! Relay Error Types
//!
//! Synchronous failures of handle operations. Asynchronous failures travel
//! through the `event::Error` event instead.

use crate::buffer::Buffer;
use std::io;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// IO error reported by the OS at submission time
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Handle is closing or closed
    #[error("handle is closed")]
    Closed,

    /// Operation does not fit the handle's current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Address could not be parsed or has the wrong family
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Descriptors can only travel over a cross-process pipe
    #[error("pipe is not in cross-process mode")]
    NotCrossProcess,

    /// The loop that should run a submitted job is gone
    #[error("event loop is gone")]
    LoopGone,
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Create an invalid address error
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// True when the OS asked us to retry later.
    #[must_use]
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// Negative errno matching this error, in the engine's status convention.
    #[must_use]
    pub fn status(&self) -> i32 {
        match self {
            Self::Io(e) => status_of(e),
            Self::Closed => -libc::EBADF,
            Self::InvalidState(_) | Self::NotCrossProcess => -libc::EINVAL,
            Self::InvalidAddress(_) => -libc::EADDRNOTAVAIL,
            Self::LoopGone => -libc::ESHUTDOWN,
        }
    }
}

/// Negative errno for an IO error; errors without an OS code map to `-EIO`.
#[must_use]
pub fn status_of(err: &io::Error) -> i32 {
    -err.raw_os_error().unwrap_or(libc::EIO)
}

/// A write the stream refused to queue. The caller gets its buffer back.
#[derive(Error, Debug)]
#[error("write rejected: {reason}")]
pub struct WriteRejected {
    pub buffer: Buffer,
    #[source]
    pub reason: RelayError,
}

impl WriteRejected {
    pub(crate) fn new(buffer: Buffer, reason: RelayError) -> Self {
        Self { buffer, reason }
    }

    /// Recover the rejected buffer.
    #[must_use]
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}
