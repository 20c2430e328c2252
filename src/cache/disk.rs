use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

use super::CacheStore;
use crate::error::Result;

const CATALOG_FILE: &str = "catalog.bin";
const ENTRIES_DIR: &str = "entries";

/// Cache store backed by a directory tree
///
/// ```text
/// <base>/<md5(archive uri)>/catalog.bin
/// <base>/<md5(archive uri)>/entries/<md5(entry path)>.bin
/// ```
pub struct DiskStore {
    base_dir: PathBuf,
    temp_counter: AtomicU64,
}

impl DiskStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed.
    pub async fn with_base_dir(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        ensure_dir(&base_dir).await?;
        debug!("Initialized disk cache at: {:?}", base_dir);

        Ok(Self {
            base_dir,
            temp_counter: AtomicU64::new(0),
        })
    }

    /// Get the base directory of this cache
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn archive_dir(&self, archive: &str) -> PathBuf {
        self.base_dir.join(digest(archive))
    }

    /// Path of the record for `archive` or `(archive, entry)`
    pub fn record_path(&self, archive: &str, entry: Option<&str>) -> PathBuf {
        let dir = self.archive_dir(archive);
        match entry {
            Some(path) => dir.join(ENTRIES_DIR).join(format!("{}.bin", digest(path))),
            None => dir.join(CATALOG_FILE),
        }
    }
}

fn digest(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

async fn ensure_dir(path: &Path) -> Result<()> {
    if tokio::fs::metadata(path).await.is_err() {
        tokio::fs::create_dir_all(path).await?;
    }
    Ok(())
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn get(&self, archive: &str, entry: Option<&str>) -> Result<Option<Bytes>> {
        let path = self.record_path(archive, entry);
        trace!("Reading cache record: {:?}", path);

        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, archive: &str, entry: Option<&str>, data: &[u8]) -> Result<()> {
        let path = self.record_path(archive, entry);
        if let Some(parent) = path.parent() {
            ensure_dir(parent).await?;
        }

        // Write aside and rename so readers never see a partial record
        let seq = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let temp = path.with_extension(format!("tmp.{}.{}", std::process::id(), seq));

        trace!("Writing {} bytes to cache record: {:?}", data.len(), path);
        tokio::fs::write(&temp, data).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn clear(&self, archive: Option<&str>) -> Result<()> {
        match archive {
            Some(archive) => {
                debug!("Clearing disk cache for {}", archive);
                remove_dir_if_exists(&self.archive_dir(archive)).await
            }
            None => {
                debug!("Clearing all entries in disk cache");
                remove_dir_if_exists(&self.base_dir).await?;
                ensure_dir(&self.base_dir).await
            }
        }
    }
}
