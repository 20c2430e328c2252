use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{trace, warn};

use super::{ByteRange, RangeFetch, RangeResponse, parse_content_range};
use crate::config::Config;
use crate::error::{Error, Result};

/// HTTP Range fetcher for remote ZIP files
pub struct HttpRangeFetcher {
    client: Client,
    transferred_bytes: AtomicU64,
    max_retry: u32,
}

impl HttpRangeFetcher {
    /// Create a fetcher using the timeout and retry settings of `config`.
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self::with_client(client, config.max_retry))
    }

    pub fn with_client(client: Client, max_retry: u32) -> Self {
        Self {
            client,
            transferred_bytes: AtomicU64::new(0),
            max_retry,
        }
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }
}

impl HttpRangeFetcher {
    /// Send a range request, retrying connect and timeout failures.
    async fn send(&self, uri: &str, range: ByteRange) -> Result<Response> {
        let header = range.header_value();
        let mut retry_count = 0;

        loop {
            trace!("GET {} Range: {}", uri, header);

            let result = self
                .client
                .get(uri)
                .header(RANGE, &header)
                // Compressed transfer encoding would break byte offsets
                .header("Accept-Encoding", "identity")
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    return Err(Error::Transport(format!(
                        "HTTP request failed with status: {}",
                        resp.status()
                    )));
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    retry_count += 1;
                    if retry_count >= self.max_retry {
                        return Err(Error::Transport(format!("max retries exceeded: {}", e)));
                    }
                    warn!(
                        "Connection error, retry {}/{}: {}",
                        retry_count, self.max_retry, e
                    );
                    tokio::time::sleep(Duration::from_millis(500 * retry_count as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn request(
        &self,
        uri: &str,
        range: ByteRange,
        on_chunk: Option<&(dyn Fn(u64) + Send + Sync)>,
    ) -> Result<RangeResponse> {
        let resp = self.send(uri, range).await?;
        let status = resp.status();

        let total_length = if status == StatusCode::PARTIAL_CONTENT {
            let served = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range);
            if let Some((start, end, total)) = served {
                check_served_range(range, start, end, total)?;
            }
            served.and_then(|(_, _, total)| total)
        } else {
            resp.content_length()
        };

        let body = match on_chunk {
            None => resp.bytes().await?,
            Some(on_chunk) => {
                let mut buf = BytesMut::with_capacity(range.len().min(64 * 1024 * 1024) as usize);
                let mut stream = resp.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                    on_chunk(buf.len() as u64);
                }
                buf.freeze()
            }
        };
        self.transferred_bytes
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        Ok(RangeResponse {
            status: status.as_u16(),
            total_length,
            body,
        })
    }
}

/// Reject a partial response that does not start where the request did.
fn check_served_range(requested: ByteRange, start: u64, end: u64, total: Option<u64>) -> Result<()> {
    let matches = match requested {
        ByteRange::Bounded { start: wanted, .. } => start == wanted,
        // A suffix must run to the end of the resource
        ByteRange::Suffix(n) => {
            total.is_none_or(|total| {
                end.checked_add(1) == Some(total) && start == total.saturating_sub(n)
            })
        }
    };

    if !matches {
        return Err(Error::Transport(format!(
            "server returned bytes {}-{} for Range: {}",
            start,
            end,
            requested.header_value()
        )));
    }
    Ok(())
}

#[async_trait]
impl RangeFetch for HttpRangeFetcher {
    async fn fetch(&self, uri: &str, range: ByteRange) -> Result<RangeResponse> {
        self.request(uri, range, None).await
    }

    async fn fetch_streaming(
        &self,
        uri: &str,
        range: ByteRange,
        on_chunk: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<RangeResponse> {
        self.request(uri, range, Some(on_chunk)).await
    }
}
