mod http;
mod local;

pub use http::HttpRangeFetcher;
pub use local::LocalFileFetcher;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// HTTP status for a served byte range
pub const STATUS_PARTIAL_CONTENT: u16 = 206;

/// Byte range of a remote resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Half-open range `[start, end)`
    Bounded { start: u64, end: u64 },
    /// The last `n` bytes, or the whole resource when it is shorter
    Suffix(u64),
}

impl ByteRange {
    pub fn bounded(start: u64, end: u64) -> Self {
        ByteRange::Bounded { start, end }
    }

    /// Value of the HTTP `Range` header for this range.
    pub fn header_value(&self) -> String {
        match *self {
            ByteRange::Bounded { start, end } => {
                format!("bytes={}-{}", start, end.saturating_sub(1))
            }
            ByteRange::Suffix(n) => format!("bytes=-{}", n),
        }
    }

    /// Number of bytes requested, ignoring the resource length
    pub fn len(&self) -> u64 {
        match *self {
            ByteRange::Bounded { start, end } => end.saturating_sub(start),
            ByteRange::Suffix(n) => n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Response to a single range request
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub status: u16,
    /// Total length of the resource, when the server reported it
    pub total_length: Option<u64>,
    pub body: Bytes,
}

impl RangeResponse {
    /// Whether the server honored the range (206) rather than sending the full body.
    pub fn is_partial(&self) -> bool {
        self.status == STATUS_PARTIAL_CONTENT
    }
}

/// Trait for fetching byte ranges of a resource identified by URI
#[async_trait]
pub trait RangeFetch: Send + Sync {
    /// Fetch `range` of the resource at `uri`.
    ///
    /// Non-2xx statuses and network failures are reported as
    /// [`Error::Transport`](crate::Error::Transport); a 2xx response is
    /// returned as-is so the caller can tell 206 from 200.
    async fn fetch(&self, uri: &str, range: ByteRange) -> Result<RangeResponse>;

    /// Like [`fetch`](RangeFetch::fetch), calling `on_chunk` with the number
    /// of body bytes received so far as the body arrives.
    ///
    /// The default reads the whole body first and reports it once.
    async fn fetch_streaming(
        &self,
        uri: &str,
        range: ByteRange,
        on_chunk: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<RangeResponse> {
        let resp = self.fetch(uri, range).await?;
        on_chunk(resp.body.len() as u64);
        Ok(resp)
    }
}

/// Parse a `Content-Range` header value such as `bytes 0-99/1234`.
///
/// Returns `(start, end_inclusive, total)`; `total` is `None` for `*`.
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (span, total) = rest.split_once('/')?;
    let (start, end) = span.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header_values() {
        assert_eq!(ByteRange::bounded(0, 100).header_value(), "bytes=0-99");
        assert_eq!(ByteRange::Suffix(65557).header_value(), "bytes=-65557");
        assert_eq!(ByteRange::bounded(10, 30).len(), 20);
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-99/1234"),
            Some((0, 99, Some(1234)))
        );
        assert_eq!(parse_content_range("bytes 5-9/*"), Some((5, 9, None)));
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes garbage"), None);
    }
}
