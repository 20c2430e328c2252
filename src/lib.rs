//! # zipfetch
//!
//! Enumerate and fetch individual files of a ZIP archive on a remote server
//! without downloading the whole archive.
//!
//! The archive's central directory is located with a range request for the
//! file's tail, entries are listed from it, and a single entry is fetched
//! with one range request sized to that entry, then decompressed and
//! checked against its CRC-32. Catalogs and payloads are cached in memory
//! and in a durable store, and concurrent requests for the same archive or
//! entry share one network fetch.
//!
//! ## Features
//!
//! - Catalog of entries in at most two range requests
//! - Entry data located through the local file header
//! - STORED and DEFLATE entries, verified by CRC-32
//! - Memory and on-disk caches with a versioned record format
//! - Request coalescing per archive and per entry
//! - Progress callbacks while an entry downloads
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use zipfetch::{ArchiveRegistry, Config, HttpRangeFetcher};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let fetcher = Arc::new(HttpRangeFetcher::new(&config)?);
//!     let registry = ArchiveRegistry::with_config(fetcher, config).await?;
//!
//!     let uri = "https://example.com/archive.zip";
//!     let catalog = registry.load_catalog(uri).await?;
//!     for entry in catalog.entries() {
//!         println!("{}", entry.path);
//!     }
//!
//!     let data = registry.fetch_entry_data(uri, "readme.txt").await?;
//!     println!("{} bytes", data.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod manager;
pub mod progress;
pub mod zip;

pub use cache::{CacheStore, DiskStore, MemoryStore};
pub use cli::Cli;
pub use config::Config;
pub use error::{Error, Result};
pub use io::{ByteRange, HttpRangeFetcher, LocalFileFetcher, RangeFetch, RangeResponse};
pub use manager::{ArchiveManager, ArchiveRegistry, LoadState};
pub use progress::Progress;
pub use zip::{ArchiveReader, Catalog, CompressionMethod, Entry, Folder};
