use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use super::{ByteRange, RangeFetch, RangeResponse, STATUS_PARTIAL_CONTENT};
use crate::error::{Error, Result};

/// Serves byte ranges of local files, treating the URI as a filesystem path.
///
/// Every request is answered like a range-capable server would: status 206
/// with the file length, and ranges clamped to the end of the file.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileFetcher;

impl LocalFileFetcher {
    pub fn new() -> Self {
        Self
    }
}

fn read_range(path: &Path, range: ByteRange) -> Result<RangeResponse> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();

    let (start, end) = match range {
        ByteRange::Bounded { start, end } => (start.min(size), end.min(size)),
        ByteRange::Suffix(n) => (size.saturating_sub(n), size),
    };

    let mut buf = Vec::with_capacity(end.saturating_sub(start) as usize);
    file.seek(SeekFrom::Start(start))?;
    file.take(end.saturating_sub(start)).read_to_end(&mut buf)?;

    Ok(RangeResponse {
        status: STATUS_PARTIAL_CONTENT,
        total_length: Some(size),
        body: Bytes::from(buf),
    })
}

#[async_trait]
impl RangeFetch for LocalFileFetcher {
    async fn fetch(&self, uri: &str, range: ByteRange) -> Result<RangeResponse> {
        let path = uri.strip_prefix("file://").unwrap_or(uri).to_owned();
        tokio::task::spawn_blocking(move || read_range(Path::new(&path), range))
            .await
            .map_err(|e| Error::Transport(format!("local read task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ranges_are_clamped_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let uri = path.to_string_lossy().to_string();

        let fetcher = LocalFileFetcher::new();

        let resp = fetcher.fetch(&uri, ByteRange::bounded(2, 5)).await.unwrap();
        assert!(resp.is_partial());
        assert_eq!(&resp.body[..], b"234");
        assert_eq!(resp.total_length, Some(10));

        let resp = fetcher.fetch(&uri, ByteRange::bounded(8, 50)).await.unwrap();
        assert_eq!(&resp.body[..], b"89");

        let resp = fetcher.fetch(&uri, ByteRange::Suffix(100)).await.unwrap();
        assert_eq!(&resp.body[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = LocalFileFetcher::new()
            .fetch("/definitely/not/here.zip", ByteRange::Suffix(22))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
