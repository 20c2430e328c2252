//! Low-level ZIP parsing over in-memory buffers.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) in the file's tail
//! 2. Read the Central Directory to get metadata for all files
//! 3. For extraction, read each file's Local File Header and data
//!
//! Everything here works on byte buffers already fetched by the
//! [`ArchiveReader`](super::ArchiveReader), so it has no I/O of its own.

use flate2::read::DeflateDecoder;
use std::io::{Cursor, Read};
use tracing::{debug, warn};

use super::entry::Entry;
use super::structures::*;
use crate::error::{Error, Result};

/// Maximum ZIP comment size allowed by the format (65535 bytes).
pub const MAX_COMMENT_SIZE: u64 = 65535;

/// Size of the tail window that is guaranteed to contain the EOCD.
pub const TAIL_WINDOW: u64 = MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64;

/// Find the EOCD record in a buffer holding the tail of an archive.
///
/// Searches backwards for the signature. A candidate whose comment length
/// matches the bytes that follow it is preferred; failing that, the
/// candidate closest to the end is used, tolerating trailing data.
///
/// Returns the record and its offset within `tail`.
pub fn locate_eocd(tail: &[u8]) -> Result<(EndOfCentralDirectory, usize)> {
    if tail.len() < EndOfCentralDirectory::SIZE {
        return Err(Error::EocdNotFound);
    }

    let mut fallback = None;

    for i in (0..=tail.len() - EndOfCentralDirectory::SIZE).rev() {
        if &tail[i..i + 4] != EndOfCentralDirectory::SIGNATURE {
            continue;
        }

        let eocd = EndOfCentralDirectory::from_bytes(&tail[i..i + EndOfCentralDirectory::SIZE])?;
        if eocd.comment_len as usize == tail.len() - i - EndOfCentralDirectory::SIZE {
            return Ok((eocd, i));
        }
        if fallback.is_none() {
            fallback = Some((eocd, i));
        }
    }

    match fallback {
        Some((eocd, i)) => {
            warn!(
                "EOCD comment length {} does not match {} trailing bytes",
                eocd.comment_len,
                tail.len() - i - EndOfCentralDirectory::SIZE
            );
            Ok((eocd, i))
        }
        None => Err(Error::EocdNotFound),
    }
}

/// Parse exactly `total_entries` records from a central directory buffer.
pub fn parse_central_directory(data: &[u8], total_entries: u16) -> Result<Vec<Entry>> {
    let mut entries = Vec::with_capacity(total_entries as usize);
    let mut cursor = Cursor::new(data);

    for index in 0..total_entries {
        if cursor.position() as usize >= data.len() {
            return Err(Error::MalformedCentralDirectory(format!(
                "found {} records, {} declared",
                index, total_entries
            )));
        }

        let header = CentralDirectoryHeader::parse(&mut cursor)?;
        entries.push(Entry::from_central_header(&header)?);
    }

    if (cursor.position() as usize) < data.len() {
        debug!(
            "{} bytes left in central directory after {} records",
            data.len() - cursor.position() as usize,
            total_entries
        );
    }

    Ok(entries)
}

/// Decompress `compressed` per the entry's method and verify its checksum.
///
/// CPU bound; the reader runs it on the blocking pool.
pub fn decode_payload(entry: &Entry, compressed: &[u8]) -> Result<Vec<u8>> {
    let data = match entry.method {
        CompressionMethod::Stored => compressed.to_vec(),
        CompressionMethod::Deflate => inflate(compressed, entry.uncompressed_size)?,
        CompressionMethod::Unknown(m) => {
            return Err(Error::MalformedEntry {
                path: entry.path.clone(),
                reason: format!("unsupported compression method {}", m),
            });
        }
    };

    let actual = crc32fast::hash(&data);
    if actual != entry.crc32 || data.len() as u64 != entry.uncompressed_size {
        return Err(Error::IntegrityCheckFailed {
            path: entry.path.clone(),
            expected: entry.crc32,
            actual,
        });
    }

    Ok(data)
}

/// Inflate a raw DEFLATE stream that must produce exactly `expected_size` bytes.
pub fn inflate(compressed: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_size.min(64 * 1024 * 1024) as usize);

    // Read one byte past the declared size to detect oversized streams
    DeflateDecoder::new(compressed)
        .take(expected_size + 1)
        .read_to_end(&mut out)
        .map_err(|e| Error::DecompressionFailed(e.to_string()))?;

    if out.len() as u64 != expected_size {
        return Err(Error::DecompressionFailed(format!(
            "inflated {} bytes, expected {}",
            out.len(),
            expected_size
        )));
    }

    Ok(out)
}
