//! Sector pointer encoding.
//!
//! Layout (12 bytes, little-endian):
//! - `raw`: 8 bytes. Bits 8..64 hold the position (granule aligned, negative
//!   for unallocated sectors). The low byte holds the sector length as
//!   `granules - 1` for B+Tree and blob sectors, or the capped longest free
//!   run for allocator sectors.
//! - `checksum`: 4 bytes, CRC32 of the whole sector.
//!
//! A raw value of zero is the null pointer; position zero is the header.

use super::{GRANULE_SIZE, SECTOR_PTR_SIZE, bytes};

const LOW_MASK: u64 = 0xFF;

/// Reference to a sector: position plus integrity checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectorPtr {
    raw: u64,
    checksum: u32,
}

impl SectorPtr {
    /// Pointer to nothing.
    pub const NULL: Self = Self { raw: 0, checksum: 0 };

    #[must_use]
    pub const fn from_raw(raw: u64, checksum: u32) -> Self {
        Self { raw, checksum }
    }

    /// Pointer whose low byte encodes the sector length.
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub const fn with_length(position: i64, len: usize, checksum: u32) -> Self {
        let granules = len.div_ceil(GRANULE_SIZE as usize);
        let low = if granules == 0 { 0 } else { (granules - 1) as u64 & LOW_MASK };
        Self {
            raw: (position as u64 & !LOW_MASK) | low,
            checksum,
        }
    }

    /// Pointer whose low byte carries an allocator free-run hint.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn with_hint(position: i64, hint: u8, checksum: u32) -> Self {
        Self {
            raw: (position as u64 & !LOW_MASK) | hint as u64,
            checksum,
        }
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.raw
    }

    #[must_use]
    pub const fn checksum(self) -> u32 {
        self.checksum
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn position(self) -> i64 {
        (self.raw & !LOW_MASK) as i64
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.raw == 0
    }

    /// Points at a sector that has a real disk position.
    #[must_use]
    pub const fn is_allocated(self) -> bool {
        self.position() > 0
    }

    /// Points at a sector still owned by the writer's arena.
    #[must_use]
    pub const fn is_unallocated(self) -> bool {
        self.position() < 0
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn low_byte(self) -> u8 {
        (self.raw & LOW_MASK) as u8
    }

    /// Sector length for length-encoded pointers.
    #[must_use]
    pub const fn length(self) -> usize {
        (self.low_byte() as usize + 1) * GRANULE_SIZE as usize
    }

    /// Largest free run hint for allocator pointers.
    #[must_use]
    pub const fn free_run_hint(self) -> u8 {
        self.low_byte()
    }

    /// Same low byte and checksum at another position.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn moved_to(self, position: i64) -> Self {
        Self {
            raw: (position as u64 & !LOW_MASK) | (self.raw & LOW_MASK),
            checksum: self.checksum,
        }
    }

    /// Decode a pointer stored at `offset`.
    #[must_use]
    pub fn read(data: &[u8], offset: usize) -> Self {
        Self {
            raw: bytes::read_u64(data, offset),
            checksum: bytes::read_u32(data, offset + 8),
        }
    }

    /// Encode the pointer at `offset`.
    pub fn write(self, data: &mut [u8], offset: usize) {
        bytes::write_u64(data, offset, self.raw);
        bytes::write_u32(data, offset + 8, self.checksum);
    }

    #[must_use]
    pub fn to_bytes(self) -> [u8; SECTOR_PTR_SIZE] {
        let mut buf = [0u8; SECTOR_PTR_SIZE];
        self.write(&mut buf, 0);
        buf
    }
}
