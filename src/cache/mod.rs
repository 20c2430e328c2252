//! Durable byte-blob stores for catalog snapshots and entry payloads.
//!
//! Records are keyed by archive URI, plus the entry path for payloads.
//! Stores never interpret the bytes; encoding lives in [`crate::zip::entry`].

mod disk;
mod memory;

pub use disk::DiskStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Key/value store for cache records
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read the record for `archive` (catalog) or `(archive, entry)` (payload).
    async fn get(&self, archive: &str, entry: Option<&str>) -> Result<Option<Bytes>>;

    /// Write or overwrite a record as a whole.
    async fn put(&self, archive: &str, entry: Option<&str>, data: &[u8]) -> Result<()>;

    /// Drop all records of `archive`, or of every archive when `None`.
    async fn clear(&self, archive: Option<&str>) -> Result<()>;
}
