//! Archive entries, catalogs and their durable cache encoding.
//!
//! Cache records are a small versioned binary format:
//!
//! ```text
//! entry record:    "ZFER" u16 version | entry fields | u8 has_data [u64 len | data] | u32 crc
//! catalog record:  "ZFCT" u16 version | u64 archive_length | u32 count | entry fields... | u32 crc
//! ```
//!
//! All integers are little endian. The trailing CRC-32 covers every byte
//! before it. A record whose magic, version or checksum does not match is
//! rejected with [`Error::CacheCorrupted`], and decoded catalogs are
//! validated like freshly parsed ones.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Cursor, Read};

use super::structures::{CentralDirectoryHeader, CompressionMethod, LocalFileHeader};
use crate::error::{Error, Result};

/// Version of the cache record layout
pub const SCHEMA_VERSION: u16 = 2;

const ENTRY_MAGIC: &[u8; 4] = b"ZFER";
const CATALOG_MAGIC: &[u8; 4] = b"ZFCT";

/// One member of a remote archive, as described by the central directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Archive-relative path, unique within a catalog
    pub path: String,
    /// Offset of the local file header (not of the data)
    pub offset: u64,
    pub method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    /// Name length as recorded in the central directory
    pub filename_length: u16,
    /// Extra field length as recorded in the central directory.
    /// The local header's copy may differ and is the one used to locate data.
    pub extra_field_length: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    /// Verified payload, once fetched
    pub data: Option<Bytes>,
}

impl Entry {
    /// Build an entry from a parsed central directory record, validating it.
    pub fn from_central_header(header: &CentralDirectoryHeader) -> Result<Self> {
        // Non-UTF8 names are converted lossily
        let path = String::from_utf8_lossy(&header.file_name).to_string();
        if header.is_encrypted() {
            return Err(Error::MalformedEntry {
                path,
                reason: "encrypted entries are not supported".to_string(),
            });
        }

        let entry = Self {
            path,
            offset: header.lfh_offset as u64,
            method: CompressionMethod::from_u16(header.compression_method),
            compressed_size: header.compressed_size as u64,
            uncompressed_size: header.uncompressed_size as u64,
            crc32: header.crc32,
            filename_length: header.file_name_length,
            extra_field_length: header.extra_field_length,
            last_mod_time: header.last_mod_time,
            last_mod_date: header.last_mod_date,
            data: None,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Check the invariants every catalog entry holds: a non-empty path, a
    /// supported method and equal sizes for stored data.
    pub fn validate(&self) -> Result<()> {
        let malformed = |reason: String| Error::MalformedEntry {
            path: self.path.clone(),
            reason,
        };

        if self.path.is_empty() {
            return Err(malformed("empty path".to_string()));
        }
        if !self.method.is_supported() {
            return Err(malformed(format!(
                "unsupported compression method {}",
                self.method.as_u16()
            )));
        }
        if self.method == CompressionMethod::Stored && self.compressed_size != self.uncompressed_size {
            return Err(malformed("stored entry sizes differ".to_string()));
        }
        Ok(())
    }

    /// End of the entry's local header and data, assuming empty name and
    /// extra field. `None` when it does not fit in a `u64`.
    fn min_end(&self) -> Option<u64> {
        self.offset
            .checked_add(LocalFileHeader::SIZE as u64)?
            .checked_add(self.compressed_size)
    }

    /// Directory entries end with '/'
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }

    /// Last path component, empty for directories
    pub fn file_name(&self) -> &str {
        if self.is_directory() {
            return "";
        }
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }

    /// Whether `data` is a payload this entry declares: right length and checksum.
    pub fn verifies(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.uncompressed_size && crc32fast::hash(data) == self.crc32
    }

    /// Copy of this entry with `data` attached
    pub fn with_data(&self, data: Bytes) -> Self {
        Self {
            data: Some(data),
            ..self.clone()
        }
    }

    /// Encode this entry, including its payload, as a cache record.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.path.len());
        buf.extend_from_slice(ENTRY_MAGIC);
        write_u16(&mut buf, SCHEMA_VERSION);
        self.encode_fields(&mut buf);

        match &self.data {
            Some(data) => {
                buf.push(1);
                write_u64(&mut buf, data.len() as u64);
                buf.extend_from_slice(data);
            }
            None => buf.push(0),
        }
        push_checksum(&mut buf);
        buf
    }

    /// Decode a cache record produced by [`Entry::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(verified_body(bytes)?);
        read_header(&mut cursor, ENTRY_MAGIC)?;
        let mut entry = Self::decode_fields(&mut cursor)?;

        let has_data = cursor.read_u8().map_err(truncated)?;
        entry.data = match has_data {
            0 => None,
            1 => {
                let len = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
                Some(Bytes::from(read_vec(&mut cursor, len)?))
            }
            other => {
                return Err(Error::CacheCorrupted(format!("bad data marker {}", other)));
            }
        };

        ensure_consumed(&cursor)?;
        Ok(entry)
    }

    fn encode_fields(&self, buf: &mut Vec<u8>) {
        let path = self.path.as_bytes();
        write_u32(buf, path.len() as u32);
        buf.extend_from_slice(path);
        write_u64(buf, self.offset);
        write_u16(buf, self.method.as_u16());
        write_u64(buf, self.compressed_size);
        write_u64(buf, self.uncompressed_size);
        write_u32(buf, self.crc32);
        write_u16(buf, self.filename_length);
        write_u16(buf, self.extra_field_length);
        write_u16(buf, self.last_mod_time);
        write_u16(buf, self.last_mod_date);
    }

    fn decode_fields(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let path_len = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let path = String::from_utf8(read_vec(cursor, path_len as u64)?)
            .map_err(|e| Error::CacheCorrupted(format!("path is not UTF-8: {}", e)))?;

        Ok(Self {
            path,
            offset: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            method: CompressionMethod::from_u16(
                cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            ),
            compressed_size: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            uncompressed_size: cursor.read_u64::<LittleEndian>().map_err(truncated)?,
            crc32: cursor.read_u32::<LittleEndian>().map_err(truncated)?,
            filename_length: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            extra_field_length: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            last_mod_time: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            last_mod_date: cursor.read_u16::<LittleEndian>().map_err(truncated)?,
            data: None,
        })
    }
}

/// Ordered entries of one archive plus a path index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    archive_length: u64,
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Catalog {
    /// Build a catalog, rejecting invalid entries, entries reaching past the
    /// end of the archive, and duplicate paths.
    pub fn new(archive_length: u64, entries: Vec<Entry>) -> Result<Self> {
        let mut index = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            entry.validate()?;
            if entry.min_end().is_none_or(|end| end > archive_length) {
                return Err(Error::MalformedEntry {
                    path: entry.path.clone(),
                    reason: format!(
                        "{} bytes at offset {} exceed the archive length {}",
                        entry.compressed_size, entry.offset, archive_length
                    ),
                });
            }
            if index.insert(entry.path.clone(), i).is_some() {
                return Err(Error::MalformedCentralDirectory(format!(
                    "duplicate path '{}'",
                    entry.path
                )));
            }
        }

        Ok(Self {
            archive_length,
            entries,
            index,
        })
    }

    /// Total length of the archive resource in bytes
    pub fn archive_length(&self) -> u64 {
        self.archive_length
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&Entry> {
        self.index.get(path).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode a snapshot of the catalog metadata. Payloads are not included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.entries.len() * 64);
        buf.extend_from_slice(CATALOG_MAGIC);
        write_u16(&mut buf, SCHEMA_VERSION);
        write_u64(&mut buf, self.archive_length);
        write_u32(&mut buf, self.entries.len() as u32);
        for entry in &self.entries {
            entry.encode_fields(&mut buf);
        }
        push_checksum(&mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes = verified_body(bytes)?;
        let mut cursor = Cursor::new(bytes);
        read_header(&mut cursor, CATALOG_MAGIC)?;
        let archive_length = cursor.read_u64::<LittleEndian>().map_err(truncated)?;
        let count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;

        let mut entries = Vec::with_capacity((count as usize).min(bytes.len() / 40 + 1));
        for _ in 0..count {
            entries.push(Entry::decode_fields(&mut cursor)?);
        }
        ensure_consumed(&cursor)?;

        Self::new(archive_length, entries)
            .map_err(|e| Error::CacheCorrupted(e.to_string()))
    }
}

fn push_checksum(buf: &mut Vec<u8>) {
    let crc = crc32fast::hash(buf);
    write_u32(buf, crc);
}

/// Strip and check the trailing CRC-32 of a record.
fn verified_body(bytes: &[u8]) -> Result<&[u8]> {
    let Some(split) = bytes.len().checked_sub(4) else {
        return Err(Error::CacheCorrupted("record is truncated".to_string()));
    };
    let (body, trailer) = bytes.split_at(split);
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let actual = crc32fast::hash(body);
    if stored != actual {
        return Err(Error::CacheCorrupted(format!(
            "record checksum {:#010x}, computed {:#010x}",
            stored, actual
        )));
    }
    Ok(body)
}

fn truncated(_: std::io::Error) -> Error {
    Error::CacheCorrupted("record is truncated".to_string())
}

fn read_header(cursor: &mut Cursor<&[u8]>, magic: &[u8; 4]) -> Result<()> {
    let mut found = [0u8; 4];
    cursor.read_exact(&mut found).map_err(truncated)?;
    if &found != magic {
        return Err(Error::CacheCorrupted("bad record magic".to_string()));
    }

    let version = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    if version != SCHEMA_VERSION {
        return Err(Error::CacheCorrupted(format!(
            "schema version {} (expected {})",
            version, SCHEMA_VERSION
        )));
    }
    Ok(())
}

fn read_vec(cursor: &mut Cursor<&[u8]>, len: u64) -> Result<Vec<u8>> {
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len > remaining {
        return Err(Error::CacheCorrupted("record is truncated".to_string()));
    }
    let mut buf = vec![0u8; len as usize];
    cursor.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn ensure_consumed(cursor: &Cursor<&[u8]>) -> Result<()> {
    if cursor.position() != cursor.get_ref().len() as u64 {
        return Err(Error::CacheCorrupted("trailing bytes after record".to_string()));
    }
    Ok(())
}

// Writes into a Vec cannot fail
fn write_u16(buf: &mut Vec<u8>, v: u16) {
    let _ = buf.write_u16::<LittleEndian>(v);
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    let _ = buf.write_u32::<LittleEndian>(v);
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    let _ = buf.write_u64::<LittleEndian>(v);
}
