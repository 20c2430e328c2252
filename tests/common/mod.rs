//! Shared fixtures: an in-memory range server and a ZIP archive builder.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::DeflateEncoder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use zipfetch::{ByteRange, Error, Progress, RangeFetch, RangeResponse, Result};

/// Range-capable server over in-memory archives, recording every request.
#[derive(Default)]
pub struct MockFetcher {
    archives: Mutex<HashMap<String, Bytes>>,
    requests: Mutex<Vec<(String, ByteRange)>>,
    ignore_ranges: AtomicBool,
    delay_ms: AtomicU64,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_archive(uri: &str, data: Vec<u8>) -> Self {
        let fetcher = Self::new();
        fetcher.insert(uri, data);
        fetcher
    }

    pub fn insert(&self, uri: &str, data: Vec<u8>) {
        self.archives.lock().insert(uri.to_string(), Bytes::from(data));
    }

    /// Answer every request with the full body and status 200
    pub fn ignore_ranges(&self, ignore: bool) {
        self.ignore_ranges.store(ignore, Ordering::SeqCst);
    }

    /// Hold every response for `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(String, ByteRange)> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests that were not tail (suffix) requests
    pub fn bounded_requests(&self) -> Vec<(u64, u64)> {
        self.requests
            .lock()
            .iter()
            .filter_map(|(_, r)| match *r {
                ByteRange::Bounded { start, end } => Some((start, end)),
                ByteRange::Suffix(_) => None,
            })
            .collect()
    }

    pub fn reset_requests(&self) {
        self.requests.lock().clear();
    }
}

#[async_trait]
impl RangeFetch for MockFetcher {
    async fn fetch(&self, uri: &str, range: ByteRange) -> Result<RangeResponse> {
        self.requests.lock().push((uri.to_string(), range));

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let data = self
            .archives
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| Error::Transport("HTTP request failed with status: 404".into()))?;
        let len = data.len() as u64;

        if self.ignore_ranges.load(Ordering::SeqCst) {
            return Ok(RangeResponse {
                status: 200,
                total_length: Some(len),
                body: data,
            });
        }

        let (start, end) = match range {
            ByteRange::Bounded { start, end } => (start, end.min(len)),
            ByteRange::Suffix(n) => (len.saturating_sub(n), len),
        };
        if start >= len && len > 0 {
            return Err(Error::Transport("HTTP request failed with status: 416".into()));
        }

        Ok(RangeResponse {
            status: 206,
            total_length: Some(len),
            body: data.slice(start as usize..end as usize),
        })
    }

    /// Delivers the body in chunks of `CHUNK_SIZE` bytes
    async fn fetch_streaming(
        &self,
        uri: &str,
        range: ByteRange,
        on_chunk: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<RangeResponse> {
        let resp = self.fetch(uri, range).await?;
        let len = resp.body.len() as u64;
        let mut received = 0;
        while received < len {
            received = (received + CHUNK_SIZE).min(len);
            on_chunk(received);
        }
        Ok(resp)
    }
}

/// Chunk size of streamed mock responses
pub const CHUNK_SIZE: u64 = 256;

/// Description of one member written by [`ZipBuilder`]
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub offset: u64,
}

/// Writes ZIP archives byte by byte, allowing local and central extra
/// fields to differ.
#[derive(Default)]
pub struct ZipBuilder {
    buf: Vec<u8>,
    central: Vec<u8>,
    members: Vec<Member>,
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// An extra field block of exactly `len` bytes (0 or at least 4)
fn extra_field(len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    assert!(len >= 4);
    let mut field = Vec::with_capacity(len);
    field.extend_from_slice(&0xCAFEu16.to_le_bytes());
    field.extend_from_slice(&((len - 4) as u16).to_le_bytes());
    field.resize(len, 0xEE);
    field
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.member(name, data, false, 0, 0)
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        self.member(name, data, true, 0, 0)
    }

    pub fn directory(self, name: &str) -> Self {
        self.member(name, b"", false, 0, 0)
    }

    /// Add a member whose local and central extra fields have the given lengths.
    pub fn member(
        mut self,
        name: &str,
        data: &[u8],
        compress: bool,
        local_extra: usize,
        central_extra: usize,
    ) -> Self {
        let (method, payload) = if compress {
            (8u16, deflate(data))
        } else {
            (0u16, data.to_vec())
        };
        let crc = crc32fast::hash(data);
        let offset = self.buf.len() as u64;
        let local_extra = extra_field(local_extra);
        let central_extra = extra_field(central_extra);

        // Local file header
        self.buf.extend_from_slice(b"PK\x03\x04");
        self.buf.extend_from_slice(&20u16.to_le_bytes());
        self.buf.extend_from_slice(&0u16.to_le_bytes());
        self.buf.extend_from_slice(&method.to_le_bytes());
        self.buf.extend_from_slice(&0x6B5Au16.to_le_bytes());
        self.buf.extend_from_slice(&0x5A21u16.to_le_bytes());
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(&(local_extra.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.extend_from_slice(&local_extra);
        self.buf.extend_from_slice(&payload);

        // Central directory record
        self.central.extend_from_slice(b"PK\x01\x02");
        self.central.extend_from_slice(&20u16.to_le_bytes());
        self.central.extend_from_slice(&20u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&method.to_le_bytes());
        self.central.extend_from_slice(&0x6B5Au16.to_le_bytes());
        self.central.extend_from_slice(&0x5A21u16.to_le_bytes());
        self.central.extend_from_slice(&crc.to_le_bytes());
        self.central.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        self.central.extend_from_slice(&(central_extra.len() as u16).to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u16.to_le_bytes());
        self.central.extend_from_slice(&0u32.to_le_bytes());
        self.central.extend_from_slice(&(offset as u32).to_le_bytes());
        self.central.extend_from_slice(name.as_bytes());
        self.central.extend_from_slice(&central_extra);

        self.members.push(Member {
            name: name.to_string(),
            method,
            crc32: crc,
            compressed_size: payload.len() as u64,
            uncompressed_size: data.len() as u64,
            offset,
        });
        self
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn build(self) -> Vec<u8> {
        self.build_with_comment(b"")
    }

    pub fn build_with_comment(self, comment: &[u8]) -> Vec<u8> {
        let mut out = self.buf;
        let cd_offset = out.len() as u32;
        out.extend_from_slice(&self.central);

        out.extend_from_slice(b"PK\x05\x06");
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(self.members.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.members.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.central.len() as u32).to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        out.extend_from_slice(comment);
        out
    }
}

/// Deterministic, poorly compressible bytes
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// The two-member archive used across tests: a stored image and a deflated document.
pub fn photos_zip() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let image = noise(1024, 7);
    let json = br#"{"id": 1, "title": "nebula", "tags": ["space", "hubble"]}"#
        .iter()
        .copied()
        .cycle()
        .take(500)
        .collect::<Vec<u8>>();

    let archive = ZipBuilder::new()
        .stored("a.jpg", &image)
        .deflated("b.json", &json)
        .build();
    (archive, image, json)
}

/// A progress callback that records every value it receives
pub fn progress_recorder(buffer_size: u64) -> (Progress, Arc<Mutex<Vec<f64>>>) {
    let values = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&values);
    let progress = Progress::with_buffer_size(buffer_size, move |v| sink.lock().push(v));
    (progress, values)
}

/// Values strictly increase and end at completion
pub fn assert_progress_completes(values: &[f64]) {
    assert!(!values.is_empty());
    assert!(values.windows(2).all(|w| w[0] < w[1]), "not increasing: {:?}", values);
    assert!(values.iter().all(|v| *v > 0.0 && *v <= 1.0));
    assert_eq!(values.last(), Some(&1.0));
}
