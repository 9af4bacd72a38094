//! Error types for the Conduit core.

use crate::endpoint::Endpoint;
use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum Error {
    /// Wire framing error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Async handle error
    #[error("handle error: {0}")]
    Handle(#[from] HandleError),

    /// Connection registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Wire framing errors.
///
/// Both variants are fatal to the connection that produced them and to
/// nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Header byte uses a reserved length code (0x1B-0xFF)
    #[error("corrupted frame: invalid length header 0x{0:02X}")]
    CorruptedFrame(u8),

    /// Declared or requested frame length exceeds the configured maximum
    #[error("frame too large: {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared payload length
        len: u64,
        /// Configured maximum payload length
        max: usize,
    },
}

/// Errors observed while waiting on an async handle.
///
/// Cloneable so that a single recorded outcome can be handed to every
/// waiter of the same handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// The operation was cancelled before it completed
    #[error("operation was cancelled")]
    Cancelled,

    /// The wait budget ran out before the operation completed
    #[error("operation timed out")]
    Timeout,

    /// The operation completed with a failure
    #[error("operation failed: {0}")]
    Failed(String),
}

impl HandleError {
    /// Build a `Failed` error from anything displayable.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

/// Connection registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No live connection is registered for the endpoint
    #[error("unknown connection: {0}")]
    UnknownConnection(Endpoint),
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
