//! Remote archive access over byte-range requests.
//!
//! Listing an archive costs at most two requests: the tail window holding
//! the EOCD, then the central directory (skipped when the tail already
//! covers it). Fetching one entry costs one request in the common case,
//! plus one corrective request when the local header's variable fields
//! outgrow the slack.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::entry::{Catalog, Entry};
use super::parser::{TAIL_WINDOW, decode_payload, locate_eocd, parse_central_directory};
use super::structures::LocalFileHeader;
use crate::config::DEFAULT_LOCAL_HEADER_SLACK;
use crate::error::{Error, Result};
use crate::io::{ByteRange, RangeFetch, RangeResponse};
use crate::progress::Progress;

/// Reads catalogs and entry payloads of remote ZIP archives.
///
/// Stateless apart from the transport: every call names the archive URI.
pub struct ArchiveReader<F: RangeFetch> {
    fetcher: Arc<F>,
    slack: u64,
}

impl<F: RangeFetch> ArchiveReader<F> {
    pub fn new(fetcher: Arc<F>) -> Self {
        Self {
            fetcher,
            slack: DEFAULT_LOCAL_HEADER_SLACK,
        }
    }

    /// Set the margin requested past an entry's data for the local name and extra field.
    pub fn with_slack(mut self, slack: u64) -> Self {
        self.slack = slack;
        self
    }

    pub fn fetcher(&self) -> &Arc<F> {
        &self.fetcher
    }

    /// Issue a range request and insist on a partial-content answer.
    async fn fetch_range(
        &self,
        uri: &str,
        range: ByteRange,
        on_chunk: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> Result<RangeResponse> {
        trace!("Fetching {:?} of {}", range, uri);
        let resp = match on_chunk {
            Some(on_chunk) => self.fetcher.fetch_streaming(uri, range, on_chunk).await?,
            None => self.fetcher.fetch(uri, range).await?,
        };
        if !resp.is_partial() {
            return Err(Error::RangeNotSupported(resp.status));
        }
        Ok(resp)
    }

    /// Locate and parse the central directory of the archive at `uri`.
    pub async fn load_catalog(&self, uri: &str) -> Result<Catalog> {
        let tail = self.fetch_range(uri, ByteRange::Suffix(TAIL_WINDOW), None).await?;
        let archive_length = tail.total_length.ok_or(Error::MissingContentLength)?;
        let tail_start = archive_length.saturating_sub(tail.body.len() as u64);

        let (eocd, eocd_pos) = locate_eocd(&tail.body)?;
        if eocd.is_zip64() {
            return Err(Error::Zip64NotSupported);
        }

        let cd_offset = eocd.cd_offset as u64;
        let cd_end = cd_offset + eocd.cd_size as u64;
        let eocd_offset = tail_start + eocd_pos as u64;
        if cd_end > eocd_offset {
            return Err(Error::MalformedCentralDirectory(format!(
                "directory [{}, {}) overlaps the EOCD at {}",
                cd_offset, cd_end, eocd_offset
            )));
        }

        let cd_data = if cd_offset >= tail_start {
            debug!("Central directory of {} is inside the tail window", uri);
            let from = (cd_offset - tail_start) as usize;
            tail.body.slice(from..from + eocd.cd_size as usize)
        } else {
            let resp = self
                .fetch_range(uri, ByteRange::bounded(cd_offset, cd_end), None)
                .await?;
            if resp.body.len() as u64 != eocd.cd_size as u64 {
                return Err(Error::ShortRead {
                    offset: cd_offset,
                    expected: eocd.cd_size as u64,
                    received: resp.body.len() as u64,
                });
            }
            resp.body
        };

        let entries = parse_central_directory(&cd_data, eocd.total_entries)?;
        debug!(
            "Loaded {} entries from {} ({} bytes)",
            entries.len(),
            uri,
            archive_length
        );

        Catalog::new(archive_length, entries)
    }

    /// Fetch, decompress and verify the payload of `entry`.
    ///
    /// The data offset is derived from the entry's local header, never from
    /// the central directory's copies of the name and extra field lengths.
    /// `archive_length` clamps the request to the end of the resource.
    pub async fn fetch_entry(
        &self,
        uri: &str,
        entry: &Entry,
        archive_length: Option<u64>,
    ) -> Result<Bytes> {
        self.fetch_entry_with_progress(uri, entry, archive_length, None)
            .await
    }

    /// [`fetch_entry`](Self::fetch_entry), reporting the share of the
    /// entry's byte range received so far to `progress`.
    pub async fn fetch_entry_with_progress(
        &self,
        uri: &str,
        entry: &Entry,
        archive_length: Option<u64>,
        progress: Option<&Progress>,
    ) -> Result<Bytes> {
        let out_of_range = || {
            Error::MalformedLocalHeader(format!(
                "'{}' at offset {} with {} bytes is out of range",
                entry.path, entry.offset, entry.compressed_size
            ))
        };

        let start = entry.offset;
        let mut end = start
            .checked_add(LocalFileHeader::SIZE as u64)
            .and_then(|end| end.checked_add(entry.compressed_size))
            .and_then(|end| end.checked_add(self.slack))
            .ok_or_else(out_of_range)?;
        if let Some(len) = archive_length {
            end = end.min(len);
        }
        if end <= start {
            return Err(Error::MalformedLocalHeader(format!(
                "header offset {} is past the end of the archive",
                start
            )));
        }

        let requested = end - start;
        let first = ByteRange::bounded(start, end);
        let resp = match progress {
            Some(progress) => {
                let on_chunk = |received: u64| progress.update(received, requested);
                self.fetch_range(uri, first, Some(&on_chunk)).await?
            }
            None => self.fetch_range(uri, first, None).await?,
        };
        let mut buf = resp.body;

        let header = LocalFileHeader::from_bytes(&buf)?;
        if header.compression_method != entry.method.as_u16() {
            warn!(
                "Local header of '{}' declares method {}, central directory {}",
                entry.path,
                header.compression_method,
                entry.method.as_u16()
            );
        }

        let data_start = header.data_offset();
        let data_end = data_start
            .checked_add(entry.compressed_size)
            .ok_or_else(out_of_range)?;

        if (buf.len() as u64) < data_end {
            let missing_start = start + buf.len() as u64;
            let missing_end = start.checked_add(data_end).ok_or_else(out_of_range)?;
            debug!(
                "Slack too small for '{}', fetching {} more bytes",
                entry.path,
                missing_end - missing_start
            );

            let rest_range = ByteRange::bounded(missing_start, missing_end);
            let rest = match progress {
                Some(progress) => {
                    let received = buf.len() as u64;
                    let on_chunk = |more: u64| progress.update(received + more, data_end);
                    self.fetch_range(uri, rest_range, Some(&on_chunk)).await?
                }
                None => self.fetch_range(uri, rest_range, None).await?,
            };

            let mut joined = BytesMut::with_capacity(buf.len() + rest.body.len());
            joined.extend_from_slice(&buf);
            joined.extend_from_slice(&rest.body);
            buf = joined.freeze();

            if (buf.len() as u64) < data_end {
                return Err(Error::ShortRead {
                    offset: start,
                    expected: data_end,
                    received: buf.len() as u64,
                });
            }
        }

        let compressed = buf.slice(data_start as usize..data_end as usize);
        let target = entry.clone();
        let data = tokio::task::spawn_blocking(move || decode_payload(&target, &compressed))
            .await
            .map_err(|e| Error::DecompressionFailed(format!("decode task failed: {}", e)))??;

        trace!("Fetched '{}' ({} bytes)", entry.path, data.len());
        if let Some(progress) = progress {
            progress.finish();
        }
        Ok(Bytes::from(data))
    }
}
