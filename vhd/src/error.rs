//! Error types for VHD operations

use std::io;
use thiserror::Error;

/// Result type alias for VHD operations
pub type Result<T> = std::result::Result<T, VhdError>;

/// Errors that can occur during VHD operations
#[derive(Error, Debug)]
pub enum VhdError {
    /// I/O error from the backing file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Structure signature does not match (e.g. parsing a buffer that isn't a footer)
    #[error("invalid signature {found:?}: expected {expected:?}")]
    InvalidSignature {
        found: String,
        expected: &'static str,
    },

    /// Structurally invalid data (truncated buffer, impossible sizes)
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Stored checksum differs from the computed one
    #[error("{structure} checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        structure: &'static str,
        expected: u32,
        actual: u32,
    },

    /// Physical read or write transferred fewer bytes than requested
    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },

    /// Bitmap access against a sector that has no backing storage
    #[error("sector {0} not allocated")]
    SectorNotAllocated(u32),

    /// Operation the engine deliberately does not implement
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Caller passed an argument the operation cannot honor
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Footer names a disk type with no backend
    #[error("unknown disk type: {0}")]
    UnknownDiskType(u32),

    /// Operation attempted after the image was closed
    #[error("image is closed")]
    Closed,
}

impl From<VhdError> for io::Error {
    fn from(err: VhdError) -> Self {
        match err {
            VhdError::Io(e) => e,
            VhdError::ShortTransfer { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            VhdError::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, err),
            VhdError::InvalidArgument(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            VhdError::Closed => io::Error::new(io::ErrorKind::NotConnected, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
