//! File header and root records.
//!
//! The header occupies the first 512 bytes of the storage:
//! - bytes 0..8: magic `SECTRDB1`
//! - two 128-byte root slots at offsets 64 and 192
//!
//! Each commit writes the slot selected by the parity of its transaction
//! counter, so the previous root record survives a torn header write. On
//! open, the valid slot with the higher counter wins.

// Slot fields hold small configuration values that fit their encoded widths.
#![allow(clippy::cast_possible_truncation)]

use crate::config::Format;
use crate::error::EngineError;
use crate::sector::{SectorPtr, bytes, checksum};
use crate::storage::{BlockStorage, StorageError};

/// Magic bytes identifying a database file.
pub const MAGIC: [u8; 8] = *b"SECTRDB1";

/// Bytes reserved for the header at the start of the storage.
pub const HEADER_SIZE: u64 = 512;

/// Size of one root slot.
pub const SLOT_SIZE: usize = 128;

const SLOT_OFFSETS: [u64; 2] = [64, 192];

/// Root slot field offsets.
mod offsets {
    pub const BTREE_ROOT: usize = 0;
    pub const BTREE_DEPTH: usize = 12;
    pub const ALLOC_ROOT: usize = 16;
    pub const ALLOC_DEPTH: usize = 28;
    pub const KEY_VALUE_COUNT: usize = 32;
    pub const USED_SIZE: usize = 40;
    pub const TRANSACTION_COUNTER: usize = 48;
    pub const WANTED_SIZE: usize = 56;
    pub const TXLOG_POSITION: usize = 64;
    pub const TXLOG_SIZE: usize = 72;
    pub const KEY_INLINE_CAP: usize = 80;
    pub const VALUE_INLINE_CAP: usize = 82;
    pub const ALLOC_LEAF_BYTES: usize = 84;
    pub const CHECKSUM: usize = 88;
}

/// Root record of one committed version of the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct State {
    /// Root of the key/value B+Tree, null when the tree is empty.
    pub btree_root: SectorPtr,
    /// Levels in the B+Tree; the root is a leaf at depth 1.
    pub btree_depth: u32,
    /// Root of the allocator tree.
    pub alloc_root: SectorPtr,
    /// Internal levels above the allocator leaves.
    pub alloc_depth: u32,
    pub key_value_count: u64,
    /// Bytes marked used in the allocator, header included.
    pub used_size: u64,
    pub transaction_counter: u64,
    /// Storage size needed to hold every allocated sector.
    pub wanted_size: u64,
    /// Opaque transaction-log pointer recorded on behalf of the caller.
    pub transaction_log_position: u64,
    pub transaction_log_size: u64,
}

impl State {
    /// State of a freshly created database.
    #[must_use]
    pub const fn initial() -> Self {
        Self {
            btree_root: SectorPtr::NULL,
            btree_depth: 0,
            alloc_root: SectorPtr::NULL,
            alloc_depth: 0,
            key_value_count: 0,
            used_size: HEADER_SIZE,
            transaction_counter: 0,
            wanted_size: HEADER_SIZE,
            transaction_log_position: 0,
            transaction_log_size: 0,
        }
    }

    /// Starting point for the next write transaction.
    #[must_use]
    pub const fn next(&self) -> Self {
        let mut next = *self;
        next.transaction_counter += 1;
        next
    }

    /// Whether `other` matches `self` in everything but the counter.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        let mut normalized = *other;
        normalized.transaction_counter = self.transaction_counter;
        *self == normalized
    }
}

/// Encode `state` and `format` into one slot.
#[must_use]
pub fn encode_slot(state: &State, format: &Format) -> [u8; SLOT_SIZE] {
    let mut slot = [0u8; SLOT_SIZE];
    state.btree_root.write(&mut slot, offsets::BTREE_ROOT);
    bytes::write_u32(&mut slot, offsets::BTREE_DEPTH, state.btree_depth);
    state.alloc_root.write(&mut slot, offsets::ALLOC_ROOT);
    bytes::write_u32(&mut slot, offsets::ALLOC_DEPTH, state.alloc_depth);
    bytes::write_u64(&mut slot, offsets::KEY_VALUE_COUNT, state.key_value_count);
    bytes::write_u64(&mut slot, offsets::USED_SIZE, state.used_size);
    bytes::write_u64(&mut slot, offsets::TRANSACTION_COUNTER, state.transaction_counter);
    bytes::write_u64(&mut slot, offsets::WANTED_SIZE, state.wanted_size);
    bytes::write_u64(&mut slot, offsets::TXLOG_POSITION, state.transaction_log_position);
    bytes::write_u64(&mut slot, offsets::TXLOG_SIZE, state.transaction_log_size);
    bytes::write_u16(&mut slot, offsets::KEY_INLINE_CAP, format.key_inline_cap as u16);
    bytes::write_u16(&mut slot, offsets::VALUE_INLINE_CAP, format.value_inline_cap as u16);
    bytes::write_u32(&mut slot, offsets::ALLOC_LEAF_BYTES, format.alloc_leaf_bytes as u32);
    let crc = checksum(&slot[..offsets::CHECKSUM]);
    bytes::write_u32(&mut slot, offsets::CHECKSUM, crc);
    slot
}

/// Decode a slot, rejecting it when the checksum does not match.
pub fn decode_slot(slot: &[u8]) -> Result<(State, Format), EngineError> {
    if slot.len() < SLOT_SIZE {
        return Err(EngineError::corruption("root slot truncated"));
    }
    let stored = bytes::read_u32(slot, offsets::CHECKSUM);
    if checksum(&slot[..offsets::CHECKSUM]) != stored {
        return Err(EngineError::corruption("root slot checksum mismatch"));
    }
    let state = State {
        btree_root: SectorPtr::read(slot, offsets::BTREE_ROOT),
        btree_depth: bytes::read_u32(slot, offsets::BTREE_DEPTH),
        alloc_root: SectorPtr::read(slot, offsets::ALLOC_ROOT),
        alloc_depth: bytes::read_u32(slot, offsets::ALLOC_DEPTH),
        key_value_count: bytes::read_u64(slot, offsets::KEY_VALUE_COUNT),
        used_size: bytes::read_u64(slot, offsets::USED_SIZE),
        transaction_counter: bytes::read_u64(slot, offsets::TRANSACTION_COUNTER),
        wanted_size: bytes::read_u64(slot, offsets::WANTED_SIZE),
        transaction_log_position: bytes::read_u64(slot, offsets::TXLOG_POSITION),
        transaction_log_size: bytes::read_u64(slot, offsets::TXLOG_SIZE),
    };
    let format = Format {
        key_inline_cap: usize::from(bytes::read_u16(slot, offsets::KEY_INLINE_CAP)),
        value_inline_cap: usize::from(bytes::read_u16(slot, offsets::VALUE_INLINE_CAP)),
        alloc_leaf_bytes: bytes::read_u32(slot, offsets::ALLOC_LEAF_BYTES) as usize,
    };
    format
        .validate()
        .map_err(|e| EngineError::corruption(format!("root slot holds invalid format: {e}")))?;
    Ok((state, format))
}

/// Offset of the slot written by the commit with `transaction_counter`.
#[must_use]
pub const fn slot_offset(transaction_counter: u64) -> u64 {
    SLOT_OFFSETS[(transaction_counter % 2) as usize]
}

/// Write a brand-new header: magic and both slots holding `state`.
pub fn initialize(storage: &dyn BlockStorage, state: &State, format: &Format) -> Result<(), StorageError> {
    let mut header = vec![0u8; HEADER_SIZE as usize];
    header[..MAGIC.len()].copy_from_slice(&MAGIC);
    let slot = encode_slot(state, format);
    for offset in SLOT_OFFSETS {
        let start = offset as usize;
        header[start..start + SLOT_SIZE].copy_from_slice(&slot);
    }
    storage.write(&header, 0)
}

/// Write the slot selected by the state's counter.
pub fn write_state(storage: &dyn BlockStorage, state: &State, format: &Format) -> Result<(), StorageError> {
    let slot = encode_slot(state, format);
    storage.write(&slot, slot_offset(state.transaction_counter))
}

/// Read the header and choose the newest valid root slot.
///
/// # Errors
///
/// Returns [`EngineError::Corruption`] when the magic is wrong or neither
/// slot passes validation.
pub fn read(storage: &dyn BlockStorage) -> Result<(State, Format), EngineError> {
    let mut header = vec![0u8; HEADER_SIZE as usize];
    match storage.read_exact(&mut header, 0) {
        Ok(()) => {}
        Err(StorageError::ShortRead { .. }) => {
            return Err(EngineError::corruption("storage too small to hold a header"));
        }
        Err(e) => return Err(e.into()),
    }
    if header[..MAGIC.len()] != MAGIC {
        return Err(EngineError::corruption("bad magic"));
    }

    let mut best: Option<(State, Format)> = None;
    for (index, offset) in SLOT_OFFSETS.iter().enumerate() {
        let start = *offset as usize;
        match decode_slot(&header[start..start + SLOT_SIZE]) {
            Ok(candidate) => {
                let newer = best
                    .as_ref()
                    .is_none_or(|(state, _)| candidate.0.transaction_counter > state.transaction_counter);
                if newer {
                    best = Some(candidate);
                }
            }
            Err(e) => tracing::warn!("ignoring root slot {index}: {e}"),
        }
    }
    best.ok_or_else(|| EngineError::corruption("both root slots are invalid"))
}
