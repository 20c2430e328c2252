//! ZIP archive parsing and remote entry extraction.
//!
//! ## Architecture
//!
//! - [`structures`]: ZIP binary records (EOCD, central directory and local headers)
//! - [`entry`]: archive entries, catalogs and their cache encoding
//! - [`parser`]: buffer-level parsing, decompression and verification
//! - [`reader`]: range-request orchestration for catalogs and entries
//! - [`folder`]: folder tree view of a catalog
//!
//! ## Reading Order
//!
//! Members sit at the front of the file, each behind a local header. The
//! central directory follows them and the EOCD record closes the file, so
//! the archive is read back to front: EOCD from the tail, then the central
//! directory, then a single member through its local header.
//!
//! Only STORED and DEFLATE members are read. ZIP64, encrypted and
//! multi-disk archives are rejected.

pub mod entry;
pub mod folder;
pub mod parser;
mod reader;
pub mod structures;

pub use entry::{Catalog, Entry, SCHEMA_VERSION};
pub use folder::Folder;
pub use reader::ArchiveReader;
pub use structures::CompressionMethod;
