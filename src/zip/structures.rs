use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, CompressionMethod::Unknown(_))
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(Error::EocdNotFound);
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == 0xFFFF
            || self.total_entries == 0xFFFF
            || self.cd_size == 0xFFFFFFFF
            || self.cd_offset == 0xFFFFFFFF
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
    pub file_comment_length: u16,
    pub lfh_offset: u32,
    /// Raw file name bytes
    pub file_name: Vec<u8>,
}

impl CentralDirectoryHeader {
    pub const SIGNATURE: &'static [u8] = b"PK\x01\x02";
    pub const MIN_SIZE: usize = 46;

    /// Parse one record and advance `cursor` past its name, extra field and comment.
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let start = cursor.position();
        let remaining = cursor.get_ref().len() as u64 - start;
        if remaining < Self::MIN_SIZE as u64 {
            return Err(Error::MalformedCentralDirectory(format!(
                "record at offset {} is truncated",
                start
            )));
        }

        let mut sig = [0u8; 4];
        cursor.read_exact(&mut sig)?;
        if sig != Self::SIGNATURE {
            return Err(Error::MalformedCentralDirectory(format!(
                "bad record signature at offset {}",
                start
            )));
        }

        let _version_made_by = cursor.read_u16::<LittleEndian>()?;
        let _version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let compression_method = cursor.read_u16::<LittleEndian>()?;
        let last_mod_time = cursor.read_u16::<LittleEndian>()?;
        let last_mod_date = cursor.read_u16::<LittleEndian>()?;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let compressed_size = cursor.read_u32::<LittleEndian>()?;
        let uncompressed_size = cursor.read_u32::<LittleEndian>()?;
        let file_name_length = cursor.read_u16::<LittleEndian>()?;
        let extra_field_length = cursor.read_u16::<LittleEndian>()?;
        let file_comment_length = cursor.read_u16::<LittleEndian>()?;
        let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
        let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
        let _external_attrs = cursor.read_u32::<LittleEndian>()?;
        let lfh_offset = cursor.read_u32::<LittleEndian>()?;

        let variable_len =
            file_name_length as u64 + extra_field_length as u64 + file_comment_length as u64;
        if cursor.get_ref().len() as u64 - cursor.position() < variable_len {
            return Err(Error::MalformedCentralDirectory(format!(
                "record at offset {} overruns the directory",
                start
            )));
        }

        let mut file_name = vec![0u8; file_name_length as usize];
        cursor.read_exact(&mut file_name)?;

        // Extra field and comment are not needed for locating data
        cursor.set_position(
            cursor.position() + extra_field_length as u64 + file_comment_length as u64,
        );

        Ok(Self {
            flags,
            compression_method,
            last_mod_time,
            last_mod_date,
            crc32,
            compressed_size,
            uncompressed_size,
            file_name_length,
            extra_field_length,
            file_comment_length,
            lfh_offset,
            file_name,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & 0x0001 != 0
    }
}

/// Local File Header (LFH) - 30 bytes fixed part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub compression_method: u16,
    pub file_name_length: u16,
    pub extra_field_length: u16,
}

impl LocalFileHeader {
    pub const SIGNATURE: &'static [u8] = b"PK\x03\x04";
    pub const SIZE: usize = 30;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::MalformedLocalHeader(format!(
                "expected {} header bytes, received {}",
                Self::SIZE,
                data.len()
            )));
        }

        if &data[0..4] != Self::SIGNATURE {
            return Err(Error::MalformedLocalHeader("bad signature".to_string()));
        }

        let mut cursor = Cursor::new(data);
        cursor.set_position(8);
        let compression_method = cursor.read_u16::<LittleEndian>()?;

        // Offset to filename length field
        cursor.set_position(26);
        let file_name_length = cursor.read_u16::<LittleEndian>()?;
        let extra_field_length = cursor.read_u16::<LittleEndian>()?;

        Ok(Self {
            compression_method,
            file_name_length,
            extra_field_length,
        })
    }

    /// Offset of the entry data relative to the start of this header
    pub fn data_offset(&self) -> u64 {
        Self::SIZE as u64 + self.file_name_length as u64 + self.extra_field_length as u64
    }
}
