//! Error types shared by the reader, the manager and the transports.

use std::sync::Arc;

use thiserror::Error;

/// Result type for zipfetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by catalog loads and entry fetches.
///
/// The type is `Clone` because a single failure is delivered to every
/// caller that joined the same in-flight request.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Network failure, timeout or non-2xx status reported by the transport
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered a range request with the full body
    #[error("server ignored the range request (status {0})")]
    RangeNotSupported(u16),

    /// A partial response did not report the total resource length
    #[error("response does not report the total resource length")]
    MissingContentLength,

    /// The response body ended before the requested range did
    #[error("short read at offset {offset}: expected {expected} bytes, received {received}")]
    ShortRead {
        offset: u64,
        expected: u64,
        received: u64,
    },

    /// No end of central directory record in the tail window
    #[error("end of central directory record not found")]
    EocdNotFound,

    #[error("malformed central directory: {0}")]
    MalformedCentralDirectory(String),

    #[error("malformed local file header: {0}")]
    MalformedLocalHeader(String),

    /// A central directory record failed validation
    #[error("malformed entry '{path}': {reason}")]
    MalformedEntry { path: String, reason: String },

    #[error("ZIP64 archives are not supported")]
    Zip64NotSupported,

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    /// Payload checksum differs from the one declared in the central directory
    #[error("CRC-32 mismatch for '{path}': expected {expected:#010x}, computed {actual:#010x}")]
    IntegrityCheckFailed {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error("entry is a directory: {0}")]
    EntryIsDirectory(String),

    /// A durable cache record could not be decoded
    #[error("cache record corrupted: {0}")]
    CacheCorrupted(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl Error {
    /// Whether the failure concerns only one entry, leaving the catalog usable.
    pub fn is_entry_scoped(&self) -> bool {
        matches!(
            self,
            Error::DecompressionFailed(_)
                | Error::IntegrityCheckFailed { .. }
                | Error::MalformedLocalHeader(_)
                | Error::EntryNotFound(_)
                | Error::EntryIsDirectory(_)
        )
    }
}
