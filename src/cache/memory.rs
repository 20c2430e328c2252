use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::CacheStore;
use crate::error::Result;

/// In-process cache store.
///
/// Useful for embedding without a cache directory and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<(String, Option<String>), Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn key(archive: &str, entry: Option<&str>) -> (String, Option<String>) {
    (archive.to_string(), entry.map(str::to_string))
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, archive: &str, entry: Option<&str>) -> Result<Option<Bytes>> {
        Ok(self.records.get(&key(archive, entry)).map(|r| r.value().clone()))
    }

    async fn put(&self, archive: &str, entry: Option<&str>, data: &[u8]) -> Result<()> {
        self.records
            .insert(key(archive, entry), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn clear(&self, archive: Option<&str>) -> Result<()> {
        match archive {
            Some(archive) => self.records.retain(|(a, _), _| a != archive),
            None => self.records.clear(),
        }
        Ok(())
    }
}
