//! Runtime configuration for archive managers and transports.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Extra bytes requested after an entry's compressed data to cover the
/// local file name and extra field, whose lengths are unknown up front.
pub const DEFAULT_LOCAL_HEADER_SLACK: u64 = 256;

/// Configuration shared by the registry, its managers and the HTTP transport.
#[derive(Debug, Clone)]
pub struct Config {
    /// Durable cache directory. `None` selects [`default_cache_dir`].
    pub cache_dir: Option<PathBuf>,
    /// Persist catalog snapshots and entry payloads to the durable store
    pub durable_cache: bool,
    /// Keep fetched payloads in memory
    pub memory_cache: bool,
    /// Per-request timeout applied by the HTTP transport
    pub request_timeout: Duration,
    /// Retries of connect/timeout failures inside the HTTP transport
    pub max_retry: u32,
    pub local_header_slack: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            durable_cache: true,
            memory_cache: true,
            request_timeout: Duration::from_secs(30),
            max_retry: 10,
            local_header_slack: DEFAULT_LOCAL_HEADER_SLACK,
        }
    }
}

impl Config {
    /// Resolve the directory used by the durable disk store.
    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_cache_dir(),
        }
    }
}

/// Get the platform cache directory for zipfetch
///
/// Returns a path like:
/// - Linux: `~/.cache/zipfetch`
/// - macOS: `~/Library/Caches/zipfetch`
/// - Windows: `C:\Users\{user}\AppData\Local\zipfetch`
pub fn default_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|dir| dir.join("zipfetch"))
        .ok_or_else(|| {
            Error::from(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine cache directory for the current platform",
            ))
        })
}
