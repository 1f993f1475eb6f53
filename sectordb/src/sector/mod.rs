//! Sectors and sector pointers.
//!
//! A sector is the engine's page: a block of bytes whose length is a whole
//! number of granules. Sectors reference each other through [`SectorPtr`]s
//! stored inside their parent's bytes.

mod ptr;

pub use ptr::SectorPtr;

/// Allocation granule in bytes.
pub const GRANULE_SIZE: u64 = 256;

/// Largest sector a pointer can describe (256 granules).
pub const MAX_SECTOR_SIZE: usize = 256 * GRANULE_SIZE as usize;

/// Encoded size of a [`SectorPtr`].
pub const SECTOR_PTR_SIZE: usize = 12;

/// Child slots in allocator and blob index nodes.
pub const INDEX_SLOTS: usize = 256;

/// Size of an allocator or blob index node.
pub const INDEX_NODE_SIZE: usize = INDEX_SLOTS * SECTOR_PTR_SIZE;

/// Handle of a sector owned by a write transaction's arena.
///
/// Ids are negative multiples of [`GRANULE_SIZE`] and double as the synthetic
/// position stored in a parent's pointer until the sector is allocated.
pub type SectorId = i64;

/// Role of a sector, which decides how its bytes are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SectorType {
    /// B+Tree leaf holding key/value entries.
    BTreeLeaf = 1,
    /// B+Tree internal node holding separators and child pointers.
    BTreeInternal = 2,
    /// Allocator bitmap, one bit per granule.
    AllocLeaf = 3,
    /// Allocator index node with 256 child slots.
    AllocInternal = 4,
    /// Raw bytes of an externalized key or value.
    BlobLeaf = 5,
    /// Blob index node with 256 child slots.
    BlobInternal = 6,
}

impl SectorType {
    #[must_use]
    pub const fn is_alloc(self) -> bool {
        matches!(self, Self::AllocLeaf | Self::AllocInternal)
    }

    #[must_use]
    pub const fn is_btree(self) -> bool {
        matches!(self, Self::BTreeLeaf | Self::BTreeInternal)
    }

    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(self, Self::BlobLeaf | Self::BlobInternal)
    }
}

impl TryFrom<u8> for SectorType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::BTreeLeaf),
            2 => Ok(Self::BTreeInternal),
            3 => Ok(Self::AllocLeaf),
            4 => Ok(Self::AllocInternal),
            5 => Ok(Self::BlobLeaf),
            6 => Ok(Self::BlobInternal),
            _ => Err(value),
        }
    }
}

/// Checksum stored next to every pointer and in the header slots.
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Round a byte length up to whole granules.
#[must_use]
pub const fn round_to_granules(len: usize) -> usize {
    let granule = GRANULE_SIZE as usize;
    len.div_ceil(granule) * granule
}

/// Number of granules needed to hold `len` bytes.
#[must_use]
pub const fn granules_for(len: usize) -> u64 {
    len.div_ceil(GRANULE_SIZE as usize) as u64
}

/// In-memory state of a sector owned by the active write transaction.
///
/// Committed sectors shared with readers live in the cache as immutable
/// copies; a `Sector` only exists for content the writer has created or
/// cloned. `parent` is the arena id of the node whose bytes point at this
/// sector, or `None` when the sector is a tree root referenced by the State.
#[derive(Debug, Clone)]
pub struct Sector {
    kind: SectorType,
    id: SectorId,
    position: i64,
    data: Vec<u8>,
    dirty: bool,
    in_transaction: bool,
    parent: Option<SectorId>,
}

impl Sector {
    /// A new unallocated sector. Its position is the synthetic id.
    #[must_use]
    pub const fn new(kind: SectorType, id: SectorId, data: Vec<u8>, parent: Option<SectorId>) -> Self {
        Self {
            kind,
            id,
            position: id,
            data,
            dirty: true,
            in_transaction: true,
            parent,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SectorType {
        self.kind
    }

    #[must_use]
    pub const fn id(&self) -> SectorId {
        self.id
    }

    /// Disk offset once allocated, the synthetic id before.
    #[must_use]
    pub const fn position(&self) -> i64 {
        self.position
    }

    #[must_use]
    pub const fn allocated(&self) -> bool {
        self.position > 0
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub const fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    #[must_use]
    pub const fn parent(&self) -> Option<SectorId> {
        self.parent
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable bytes. Only legal on a dirty sector.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        debug_assert!(self.dirty, "mutating a clean sector");
        &mut self.data
    }

    /// Replace the content, padding it to whole granules.
    pub fn set_data(&mut self, mut data: Vec<u8>) {
        data.resize(round_to_granules(data.len().max(1)), 0);
        self.data = data;
    }

    /// Length on disk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub const fn set_parent(&mut self, parent: Option<SectorId>) {
        self.parent = parent;
    }

    pub const fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub const fn set_position(&mut self, position: i64) {
        self.position = position;
    }

    /// Bytes reached storage; further writes need `mark_dirty` first.
    pub const fn mark_flushed(&mut self) {
        self.dirty = false;
    }

    /// The owning transaction finished; the sector is an ordinary cached one.
    pub const fn leave_transaction(&mut self) {
        self.in_transaction = false;
    }

    /// Consume the sector, returning its bytes.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Little-endian field access over raw sector bytes.
pub(crate) mod bytes {
    #[must_use]
    pub fn read_u16(data: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes([data[offset], data[offset + 1]])
    }

    pub fn write_u16(data: &mut [u8], offset: usize, value: u16) {
        data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn read_u32(data: &[u8], offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&data[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    pub fn write_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn read_u64(data: &[u8], offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    pub fn write_u64(data: &mut [u8], offset: usize, value: u64) {
        data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_type_conversion() {
        assert_eq!(SectorType::try_from(1), Ok(SectorType::BTreeLeaf));
        assert_eq!(SectorType::try_from(6), Ok(SectorType::BlobInternal));
        assert!(SectorType::try_from(0).is_err());
        assert!(SectorType::AllocInternal.is_alloc());
        assert!(SectorType::BlobLeaf.is_blob());
        assert!(!SectorType::BlobLeaf.is_btree());
    }

    #[test]
    fn test_granule_rounding() {
        assert_eq!(round_to_granules(1), 256);
        assert_eq!(round_to_granules(256), 256);
        assert_eq!(round_to_granules(257), 512);
        assert_eq!(granules_for(0), 0);
        assert_eq!(granules_for(513), 3);
    }

    #[test]
    fn test_sector_lifecycle_flags() {
        let mut sector = Sector::new(SectorType::BTreeLeaf, -256, vec![0; 256], None);
        assert!(sector.is_dirty());
        assert!(sector.in_transaction());
        assert!(!sector.allocated());

        sector.set_position(4096);
        sector.mark_flushed();
        assert!(sector.allocated());
        assert!(!sector.is_dirty());

        sector.leave_transaction();
        assert!(!sector.in_transaction());
    }

    #[test]
    fn test_set_data_pads_to_granules() {
        let mut sector = Sector::new(SectorType::BlobLeaf, -512, vec![0; 256], Some(-256));
        sector.set_data(vec![1; 300]);
        assert_eq!(sector.len(), 512);
        assert_eq!(sector.data()[299], 1);
        assert_eq!(sector.data()[300], 0);
        assert_eq!(sector.parent(), Some(-256));
    }

    #[test]
    fn test_byte_helpers() {
        let mut data = vec![0u8; 16];
        bytes::write_u16(&mut data, 0, 0xBEEF);
        bytes::write_u32(&mut data, 2, 0x1234_5678);
        bytes::write_u64(&mut data, 6, 0x0102_0304_0506_0708);
        assert_eq!(bytes::read_u16(&data, 0), 0xBEEF);
        assert_eq!(bytes::read_u32(&data, 2), 0x1234_5678);
        assert_eq!(bytes::read_u64(&data, 6), 0x0102_0304_0506_0708);
    }
}
