use std::path::Path;

use xxhash_rust::xxh64::xxh64;

use crate::error::StorageError;

/// Magic bytes identifying a skycat tablet file.
pub const MAGIC: &[u8; 4] = b"SKYT";

/// Current tablet format version.
pub const VERSION: u32 = 1;

/// Size of the fixed header at the start of every tablet.
pub const HEADER_SIZE: usize = 64;

/// Header checksum covers bytes `[0..48]`.
const CHECKSUM_RANGE_END: usize = 48;

/// The checksum is stored at bytes `[48..56]`.
const CHECKSUM_OFFSET: usize = 48;

/// Set when the tablet's table carries a primary key (and so a live serial counter).
pub const FLAG_PRIMARY: u32 = 1;

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Tablet header, rewritten after every committed append.
///
/// Header layout:
/// ```text
/// [0..4]   magic: "SKYT" (4 bytes)
/// [4..8]   version: u32 (1) little-endian
/// [8..16]  next_serial: u64 little-endian
/// [16..24] row_count: u64 little-endian (committed rows)
/// [24..28] row_width: u32 little-endian
/// [28..32] schema_len: u32 little-endian (JSON schema bytes after the header)
/// [32..36] flags: u32 little-endian
/// [36..48] reserved (zero)
/// [48..56] xxhash64 checksum (of bytes 0..48) little-endian
/// [56..64] reserved (zero)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletHeader {
    pub next_serial: u64,
    pub row_count: u64,
    pub row_width: u32,
    pub schema_len: u32,
    pub flags: u32,
}

impl TabletHeader {
    /// Header of a freshly created, empty tablet. The serial counter starts at 1.
    pub fn new(row_width: usize, schema_len: usize, primary: bool) -> Self {
        Self {
            next_serial: 1,
            row_count: 0,
            row_width: row_width as u32,
            schema_len: schema_len as u32,
            flags: if primary { FLAG_PRIMARY } else { 0 },
        }
    }

    pub fn is_primary(&self) -> bool {
        self.flags & FLAG_PRIMARY != 0
    }

    /// Byte offset of the first row.
    pub fn data_offset(&self) -> u64 {
        HEADER_SIZE as u64 + self.schema_len as u64
    }

    /// Byte offset one past the last committed row.
    pub fn data_end(&self) -> u64 {
        self.data_offset() + self.row_count * self.row_width as u64
    }

    /// Parse a header, validating magic, version, and checksum.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE], path: &Path) -> Result<Self, StorageError> {
        if &buf[0..4] != MAGIC {
            return Err(StorageError::InvalidMagic(path.to_path_buf()));
        }

        let version = read_u32(buf, 4);
        if version != VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }

        let stored_checksum = read_u64(buf, CHECKSUM_OFFSET);
        let computed_checksum = xxh64(&buf[..CHECKSUM_RANGE_END], 0);
        if stored_checksum != computed_checksum {
            return Err(StorageError::CorruptedTablet {
                path: path.to_path_buf(),
                reason: format!(
                    "header checksum mismatch: stored={stored_checksum:#018x}, computed={computed_checksum:#018x}"
                ),
            });
        }

        Ok(Self {
            next_serial: read_u64(buf, 8),
            row_count: read_u64(buf, 16),
            row_width: read_u32(buf, 24),
            schema_len: read_u32(buf, 28),
            flags: read_u32(buf, 32),
        })
    }

    /// Serialize this header, including magic, version, and the checksum.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.next_serial.to_le_bytes());
        buf[16..24].copy_from_slice(&self.row_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.row_width.to_le_bytes());
        buf[28..32].copy_from_slice(&self.schema_len.to_le_bytes());
        buf[32..36].copy_from_slice(&self.flags.to_le_bytes());
        let checksum = xxh64(&buf[..CHECKSUM_RANGE_END], 0);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 8].copy_from_slice(&checksum.to_le_bytes());
        buf
    }
}
