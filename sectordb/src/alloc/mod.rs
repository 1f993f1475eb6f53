//! Hierarchical bitmap allocator.
//!
//! Free space is tracked in granules by a radix-256 tree:
//! - `AllocLeaf` sectors hold one bit per granule (1 = used).
//! - `AllocInternal` sectors hold 256 child pointers, each covering an equal
//!   share of the parent's range. A null child is a never-touched, entirely
//!   free subtree.
//!
//! When every leaf is exhausted, a new internal root is placed above the old
//! one, multiplying coverage by 256. The low byte of each allocator pointer
//! carries the longest free run below it (capped at 255), letting the
//! search skip packed subtrees without loading them.
//!
//! The allocator itself is copy-on-write like every other structure: the
//! bitmap sectors it touches become private clones and are allocated and
//! flushed by the same commit.
//!
//! # Invariants
//!
//! - An allocation never straddles two leaves.
//! - Ranges reserved for readers or freed by the running transaction are
//!   never handed out, even when their bits are clear.
//! - `used_size` equals the number of set bits times the granule size.

// Bit and slot indexes are bounded by the leaf and node sizes.
#![allow(clippy::cast_possible_truncation)]

pub mod locality;

pub use locality::LocalityCache;

use crate::config::Format;
use crate::error::EngineError;
use crate::header::{HEADER_SIZE, State};
use crate::interval::IntervalSet;
use crate::sector::{GRANULE_SIZE, INDEX_NODE_SIZE, INDEX_SLOTS, SECTOR_PTR_SIZE, SectorId, SectorPtr, SectorType};
use crate::store::{Reader, Writer};

/// Largest hint value; means "at least this many".
const HINT_CAP: u8 = u8::MAX;

/// Granules reserved for the file header.
const HEADER_GRANULES: u64 = HEADER_SIZE / GRANULE_SIZE;

/// Largest single allocation in granules.
pub const MAX_ALLOCATION_GRANULES: u64 = INDEX_SLOTS as u64;

const fn kind_at(level: u32) -> SectorType {
    if level == 0 {
        SectorType::AllocLeaf
    } else {
        SectorType::AllocInternal
    }
}

/// Granules covered by one node at `level`.
#[must_use]
pub fn span_granules(level: u32, format: &Format) -> u64 {
    (0..level).fold(format.alloc_leaf_granules(), |span, _| {
        span.saturating_mul(INDEX_SLOTS as u64)
    })
}

fn is_set(bits: &[u8], index: u64) -> bool {
    let byte = (index / 8) as usize;
    bits[byte] & (1 << (index % 8)) != 0
}

fn set_bit(bits: &mut [u8], index: u64, used: bool) {
    let byte = (index / 8) as usize;
    if used {
        bits[byte] |= 1 << (index % 8);
    } else {
        bits[byte] &= !(1 << (index % 8));
    }
}

/// Longest run of clear bits among the first `nbits`.
#[must_use]
pub fn longest_free_run(bits: &[u8], nbits: u64) -> u64 {
    let mut longest = 0;
    let mut current = 0;
    let mut index = 0;
    while index < nbits {
        if index % 8 == 0 && index + 8 <= nbits {
            match bits[(index / 8) as usize] {
                0x00 => {
                    current += 8;
                    longest = longest.max(current);
                    index += 8;
                    continue;
                }
                0xFF => {
                    current = 0;
                    index += 8;
                    continue;
                }
                _ => {}
            }
        }
        if is_set(bits, index) {
            current = 0;
        } else {
            current += 1;
            longest = longest.max(current);
        }
        index += 1;
    }
    longest
}

/// Bitmap of a leaf that was never materialized.
fn virtual_leaf(base: u64, format: &Format) -> Vec<u8> {
    let mut bits = vec![0u8; format.alloc_leaf_bytes];
    if base == 0 {
        for granule in 0..HEADER_GRANULES {
            set_bit(&mut bits, granule, true);
        }
    }
    bits
}

/// Free-run hint stored in the pointer to an allocator node.
#[must_use]
pub fn node_hint(kind: SectorType, data: &[u8], format: &Format) -> u8 {
    if kind == SectorType::AllocLeaf {
        let run = longest_free_run(data, format.alloc_leaf_granules());
        return u8::try_from(run).unwrap_or(HINT_CAP);
    }
    (0..INDEX_SLOTS)
        .map(|slot| {
            let child = SectorPtr::read(data, slot * SECTOR_PTR_SIZE);
            if child.is_null() {
                HINT_CAP
            } else {
                child.free_run_hint()
            }
        })
        .max()
        .unwrap_or(HINT_CAP)
}

/// First run of `count` clear bits that no reserved range overlaps.
///
/// Returns the bit index, or the leaf's longest free run when none fits.
fn find_run(bits: &[u8], nbits: u64, count: u64, base: u64, reserved: &[&IntervalSet]) -> Result<u64, u64> {
    let mut start = 0;
    while start + count <= nbits {
        if start % 8 == 0 && bits[(start / 8) as usize] == 0xFF {
            start += 8;
            continue;
        }
        if is_set(bits, start) {
            start += 1;
            continue;
        }
        let mut end = start + 1;
        while end < start + count && !is_set(bits, end) {
            end += 1;
        }
        if end - start < count {
            start = end + 1;
            continue;
        }

        let byte_start = (base + start) * GRANULE_SIZE;
        let blocked = reserved
            .iter()
            .filter_map(|set| set.first_overlap_end(byte_start, count * GRANULE_SIZE))
            .max();
        match blocked {
            None => return Ok(start),
            Some(end_byte) => start = (end_byte.div_ceil(GRANULE_SIZE) - base).max(start + 1),
        }
    }
    Err(longest_free_run(bits, nbits))
}

fn index_children(reader: Reader<'_>, ptr: SectorPtr, deepness: usize) -> Result<Vec<SectorPtr>, EngineError> {
    if ptr.is_null() {
        return Ok(vec![SectorPtr::NULL; INDEX_SLOTS]);
    }
    let view = reader.view(ptr, SectorType::AllocInternal, deepness)?;
    let data = view.data();
    Ok((0..INDEX_SLOTS)
        .map(|slot| SectorPtr::read(data, slot * SECTOR_PTR_SIZE))
        .collect())
}

struct Search<'s> {
    reserved: [&'s IntervalSet; 2],
    count: u64,
    depth: u32,
}

fn search(
    reader: Reader<'_>,
    locality: &mut LocalityCache,
    params: &Search<'_>,
    ptr: SectorPtr,
    level: u32,
    base: u64,
) -> Result<Option<u64>, EngineError> {
    let format = reader.format();
    let deepness = (params.depth - level) as usize;
    if level == 0 {
        if let Some(bound) = locality.query(base * GRANULE_SIZE) {
            if bound < params.count {
                return Ok(None);
            }
        }
        let virtual_bits;
        let view;
        let bits: &[u8] = if ptr.is_null() {
            virtual_bits = virtual_leaf(base, format);
            &virtual_bits
        } else {
            view = reader.view(ptr, SectorType::AllocLeaf, deepness)?;
            view.data()
        };
        return match find_run(bits, format.alloc_leaf_granules(), params.count, base, &params.reserved) {
            Ok(offset) => Ok(Some(base + offset)),
            Err(longest) => {
                locality.update(base * GRANULE_SIZE, longest);
                Ok(None)
            }
        };
    }

    let child_span = span_granules(level - 1, format);
    for (slot, child) in index_children(reader, ptr, deepness)?.into_iter().enumerate() {
        let hint = child.free_run_hint();
        if !child.is_null() && hint < HINT_CAP && u64::from(hint) < params.count {
            continue;
        }
        let child_base = base + slot as u64 * child_span;
        if let Some(granule) = search(reader, locality, params, child, level - 1, child_base)? {
            return Ok(Some(granule));
        }
    }
    Ok(None)
}

/// Make every node from the root down to the leaf covering `granule`
/// private, creating never-materialized nodes when `create` is set.
///
/// Returns the arena ids from root to leaf.
fn private_path(w: &mut Writer<'_>, granule: u64, create: bool) -> Result<Vec<SectorId>, EngineError> {
    let format = *w.format();
    let depth = w.state().alloc_depth;
    let mut ids: Vec<SectorId> = Vec::with_capacity(depth as usize + 1);
    let mut ptr = w.state().alloc_root;
    let mut base = 0;
    let mut slot = 0;

    for level in (0..=depth).rev() {
        let kind = kind_at(level);
        let parent = ids.last().copied();
        let id = if ptr.is_null() {
            if !create {
                return Err(EngineError::internal(format!(
                    "granule {granule} lies in an unmaterialized allocator subtree"
                )));
            }
            let data = if level == 0 {
                virtual_leaf(base, &format)
            } else {
                vec![0u8; INDEX_NODE_SIZE]
            };
            let id = w.new_sector(kind, data, parent);
            let new_ptr = SectorPtr::with_hint(id, HINT_CAP, 0);
            match parent {
                Some(parent) => {
                    let offset = slot * SECTOR_PTR_SIZE;
                    let sector = w.sector_mut(parent)?;
                    new_ptr.write(sector.data_mut(), offset);
                }
                None => w.state_mut().alloc_root = new_ptr,
            }
            id
        } else {
            w.dirtize(ptr, kind, parent, ids.len())?
        };
        ids.push(id);

        if level > 0 {
            let child_span = span_granules(level - 1, &format);
            slot = usize::try_from((granule - base) / child_span)
                .map_err(|_| EngineError::internal("allocator slot out of range"))?;
            ptr = SectorPtr::read(w.sector(id)?.data(), slot * SECTOR_PTR_SIZE);
            base += slot as u64 * child_span;
        }
    }
    Ok(ids)
}

/// Recompute hints from the leaf up to the root along `path`.
fn refresh_hints(w: &mut Writer<'_>, path: &[SectorId]) -> Result<(), EngineError> {
    let format = *w.format();
    for (depth, &id) in path.iter().enumerate().rev() {
        let (hint, position) = {
            let sector = w.sector(id)?;
            (node_hint(sector.kind(), sector.data(), &format), sector.position())
        };
        if depth == 0 {
            let root = &mut w.state_mut().alloc_root;
            *root = SectorPtr::with_hint(position, hint, root.checksum());
            continue;
        }
        let sector = w.sector_mut(path[depth - 1])?;
        let (offset, old) = (0..INDEX_SLOTS)
            .map(|slot| slot * SECTOR_PTR_SIZE)
            .map(|offset| (offset, SectorPtr::read(sector.data(), offset)))
            .find(|(_, child)| child.position() == position)
            .ok_or_else(|| EngineError::internal("child not found while patching parent pointer"))?;
        SectorPtr::with_hint(position, hint, old.checksum()).write(sector.data_mut(), offset);
    }
    Ok(())
}

/// Set or clear `count` bits starting at `granule`, which must all hold
/// the opposite value.
fn mark(w: &mut Writer<'_>, granule: u64, count: u64, used: bool, create: bool) -> Result<(), EngineError> {
    let leaf_granules = w.format().alloc_leaf_granules();
    let offset = granule % leaf_granules;
    if offset + count > leaf_granules {
        return Err(EngineError::internal(format!(
            "range of {count} granules at {granule} straddles allocator leaves"
        )));
    }
    let path = private_path(w, granule, create)?;
    let leaf = *path
        .last()
        .ok_or_else(|| EngineError::internal("empty allocator path"))?;
    {
        let sector = w.sector_mut(leaf)?;
        let bits = sector.data_mut();
        for index in offset..offset + count {
            if is_set(bits, index) == used {
                return Err(EngineError::internal(format!(
                    "granule {} already {}",
                    granule - offset + index,
                    if used { "used" } else { "free" }
                )));
            }
            set_bit(bits, index, used);
        }
    }
    refresh_hints(w, &path)
}

/// Put a new internal root above the current allocator root.
fn grow(w: &mut Writer<'_>) -> Result<(), EngineError> {
    let old_root = w.state().alloc_root;
    let mut data = vec![0u8; INDEX_NODE_SIZE];
    old_root.write(&mut data, 0);
    let id = w.new_sector(SectorType::AllocInternal, data, None);
    if let Some(child) = w.resolve(old_root) {
        w.sector_mut(child)?.set_parent(Some(id));
    }
    let hint = node_hint(SectorType::AllocInternal, w.sector(id)?.data(), w.format());
    let state = w.state_mut();
    state.alloc_root = SectorPtr::with_hint(id, hint, 0);
    state.alloc_depth += 1;
    tracing::debug!("allocator tree grew to depth {}", state.alloc_depth);
    Ok(())
}

/// Claim `granules` consecutive granules and return their byte offset.
///
/// Ranges in `readers` (space a live snapshot may still reference) and
/// ranges freed by the running transaction are skipped.
pub fn allocate(
    w: &mut Writer<'_>,
    locality: &mut LocalityCache,
    readers: &IntervalSet,
    granules: u64,
) -> Result<u64, EngineError> {
    if granules == 0 || granules > MAX_ALLOCATION_GRANULES {
        return Err(EngineError::internal(format!("cannot allocate {granules} granules")));
    }
    loop {
        let found = {
            let params = Search {
                reserved: [readers, &w.write_state().deallocated],
                count: granules,
                depth: w.state().alloc_depth,
            };
            let root = w.state().alloc_root;
            search(w.reader(), locality, &params, root, params.depth, 0)?
        };
        let Some(granule) = found else {
            grow(w)?;
            continue;
        };

        mark(w, granule, granules, true, true)?;
        let offset = granule * GRANULE_SIZE;
        let bytes = granules * GRANULE_SIZE;
        let state = w.state_mut();
        state.used_size += bytes;
        state.wanted_size = state.wanted_size.max(offset + bytes);
        tracing::trace!("allocated {bytes} bytes at {offset}");
        return Ok(offset);
    }
}

/// Return `granules` granules at byte `offset` to the free pool.
pub fn free(w: &mut Writer<'_>, locality: &mut LocalityCache, offset: u64, granules: u64) -> Result<(), EngineError> {
    if offset % GRANULE_SIZE != 0 {
        return Err(EngineError::internal(format!("free of unaligned offset {offset}")));
    }
    let granule = offset / GRANULE_SIZE;
    mark(w, granule, granules, false, false)?;
    let bytes = granules * GRANULE_SIZE;
    let state = w.state_mut();
    state.used_size = state
        .used_size
        .checked_sub(bytes)
        .ok_or_else(|| EngineError::internal("used size underflow"))?;
    locality.invalidate(granule, granules);
    tracing::trace!("freed {bytes} bytes at {offset}");
    Ok(())
}

/// Whether every granule of `[offset, offset + len)` is marked used.
pub fn is_range_used(reader: Reader<'_>, state: &State, offset: u64, len: u64) -> Result<bool, EngineError> {
    let format = reader.format();
    let first = offset / GRANULE_SIZE;
    let last = (offset + len.max(1)).div_ceil(GRANULE_SIZE);
    for granule in first..last {
        let mut ptr = state.alloc_root;
        let mut base = 0;
        for level in (0..=state.alloc_depth).rev() {
            let deepness = (state.alloc_depth - level) as usize;
            if level == 0 {
                let bits = if ptr.is_null() {
                    virtual_leaf(base, format)
                } else {
                    reader.view(ptr, SectorType::AllocLeaf, deepness)?.data().to_vec()
                };
                if !is_set(&bits, granule - base) {
                    return Ok(false);
                }
                break;
            }
            let child_span = span_granules(level - 1, format);
            let slot = ((granule - base) / child_span) as usize;
            if slot >= INDEX_SLOTS {
                return Ok(false);
            }
            ptr = index_children(reader, ptr, deepness)?[slot];
            base += slot as u64 * child_span;
        }
    }
    Ok(true)
}

/// Bytes marked used across the whole bitmap.
pub fn count_used(reader: Reader<'_>, state: &State) -> Result<u64, EngineError> {
    fn count_node(reader: Reader<'_>, ptr: SectorPtr, level: u32, base: u64, depth: u32) -> Result<u64, EngineError> {
        let format = reader.format();
        if ptr.is_null() {
            return Ok(if base == 0 { HEADER_GRANULES } else { 0 });
        }
        let deepness = (depth - level) as usize;
        if level == 0 {
            let view = reader.view(ptr, SectorType::AllocLeaf, deepness)?;
            let leaf_bytes = format.alloc_leaf_bytes.min(view.data().len());
            return Ok(view.data()[..leaf_bytes]
                .iter()
                .map(|byte| u64::from(byte.count_ones()))
                .sum());
        }
        let child_span = span_granules(level - 1, format);
        let mut total = 0;
        for (slot, child) in index_children(reader, ptr, deepness)?.into_iter().enumerate() {
            if child.is_null() && slot > 0 {
                continue;
            }
            total += count_node(reader, child, level - 1, base + slot as u64 * child_span, depth)?;
        }
        Ok(total)
    }

    Ok(count_node(reader, state.alloc_root, state.alloc_depth, 0, state.alloc_depth)? * GRANULE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SectorCache, StoreContext, WriteState};
    use crate::storage::MemoryStorage;

    fn store(format: Format) -> StoreContext {
        StoreContext::new(Box::new(MemoryStorage::new()), format, SectorCache::new())
    }

    fn small_format() -> Format {
        Format {
            alloc_leaf_bytes: 256,
            ..Format::default()
        }
    }

    #[test]
    fn test_longest_free_run() {
        let mut bits = vec![0u8; 4];
        assert_eq!(longest_free_run(&bits, 32), 32);
        bits[0] = 0b0000_0011;
        bits[2] = 0xFF;
        assert_eq!(longest_free_run(&bits, 32), 14);
        assert_eq!(longest_free_run(&bits, 20), 14);
    }

    #[test]
    fn test_find_run_respects_reserved_ranges() {
        let bits = vec![0u8; 8];
        let mut reserved = IntervalSet::new();
        reserved.insert(0, 4 * GRANULE_SIZE);
        let empty = IntervalSet::new();
        assert_eq!(find_run(&bits, 64, 2, 0, &[&reserved, &empty]), Ok(4));

        let mut bits = vec![0u8; 1];
        bits[0] = 0b0101_0101;
        assert_eq!(find_run(&bits, 8, 2, 0, &[&empty]), Err(1));
    }

    #[test]
    fn test_first_allocations_follow_header() {
        let store = store(Format::default());
        let mut ws = WriteState::new(State::initial());
        let mut locality = LocalityCache::new(Format::default().alloc_leaf_granules());
        let readers = IntervalSet::new();
        let mut w = Writer::new(&store, &mut ws);

        let a = allocate(&mut w, &mut locality, &readers, 1).unwrap();
        let b = allocate(&mut w, &mut locality, &readers, 4).unwrap();
        assert_eq!(a, HEADER_SIZE);
        assert_eq!(b, HEADER_SIZE + GRANULE_SIZE);
        assert_eq!(w.state().used_size, HEADER_SIZE + 5 * GRANULE_SIZE);
        assert_eq!(count_used(w.reader(), w.state()).unwrap(), w.state().used_size);
        assert!(is_range_used(w.reader(), w.state(), a, 5 * GRANULE_SIZE).unwrap());
        assert!(!is_range_used(w.reader(), w.state(), b + 4 * GRANULE_SIZE, 1).unwrap());
    }

    #[test]
    fn test_free_then_reuse_only_after_reservation_ends() {
        let store = store(Format::default());
        let mut ws = WriteState::new(State::initial());
        let mut locality = LocalityCache::new(Format::default().alloc_leaf_granules());
        let readers = IntervalSet::new();
        let mut w = Writer::new(&store, &mut ws);

        let a = allocate(&mut w, &mut locality, &readers, 2).unwrap();
        free(&mut w, &mut locality, a, 2).unwrap();
        assert_eq!(w.state().used_size, HEADER_SIZE);

        let mut reserved = IntervalSet::new();
        reserved.insert(a, 2 * GRANULE_SIZE);
        let b = allocate(&mut w, &mut locality, &reserved, 2).unwrap();
        assert_eq!(b, a + 2 * GRANULE_SIZE);

        let c = allocate(&mut w, &mut locality, &readers, 2).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_double_free_is_internal_error() {
        let store = store(Format::default());
        let mut ws = WriteState::new(State::initial());
        let mut locality = LocalityCache::new(Format::default().alloc_leaf_granules());
        let readers = IntervalSet::new();
        let mut w = Writer::new(&store, &mut ws);

        let a = allocate(&mut w, &mut locality, &readers, 1).unwrap();
        free(&mut w, &mut locality, a, 1).unwrap();
        assert!(matches!(
            free(&mut w, &mut locality, a, 1),
            Err(EngineError::Internal(_))
        ));
    }

    #[test]
    fn test_tree_grows_when_leaf_is_full() {
        let format = small_format();
        let store = store(format);
        let mut ws = WriteState::new(State::initial());
        let mut locality = LocalityCache::new(format.alloc_leaf_granules());
        let readers = IntervalSet::new();
        let mut w = Writer::new(&store, &mut ws);

        let mut offsets = Vec::new();
        for _ in 0..9 {
            offsets.push(allocate(&mut w, &mut locality, &readers, 256).unwrap());
        }
        // Seven runs fit after the header; the eighth opens a second leaf.
        assert_eq!(w.state().alloc_depth, 1);
        assert_eq!(offsets[7], 2048 * GRANULE_SIZE);

        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            assert!(pair[0] + 256 * GRANULE_SIZE <= pair[1], "allocations overlap");
        }
        assert_eq!(count_used(w.reader(), w.state()).unwrap(), w.state().used_size);
        assert_eq!(w.state().used_size, HEADER_SIZE + 9 * 256 * GRANULE_SIZE);
    }

    #[test]
    fn test_hints_skip_full_leaves() {
        let format = small_format();
        let store = store(format);
        let mut ws = WriteState::new(State::initial());
        let mut locality = LocalityCache::new(format.alloc_leaf_granules());
        let readers = IntervalSet::new();
        let mut w = Writer::new(&store, &mut ws);

        for _ in 0..9 {
            allocate(&mut w, &mut locality, &readers, 256).unwrap();
        }
        let root = w.resolve(w.state().alloc_root).unwrap();
        let first_leaf = SectorPtr::read(w.sector(root).unwrap().data(), 0);
        // 2048 - 2 header granules - 7 * 256 leaves 254 free.
        assert_eq!(first_leaf.free_run_hint(), 254);
    }

    #[test]
    fn test_locality_skips_regions_until_rolled_back() {
        let format = small_format();
        let store = store(format);
        let mut ws = WriteState::new(State::initial());
        let mut locality = LocalityCache::new(format.alloc_leaf_granules());
        let readers = IntervalSet::new();
        let mut w = Writer::new(&store, &mut ws);

        // Eight runs of 255 leave 6 free granules at the end of the first leaf.
        for _ in 0..8 {
            allocate(&mut w, &mut locality, &readers, 255).unwrap();
        }
        assert_eq!(w.state().alloc_depth, 0);
        assert_eq!(locality.query(0), None);

        let second_leaf = allocate(&mut w, &mut locality, &readers, 10).unwrap();
        assert_eq!(second_leaf, 2048 * GRANULE_SIZE);
        assert_eq!(w.state().alloc_depth, 1);
        assert_eq!(locality.query(0), Some(6));

        // Free space behind the cache's back: the pointer hint sees it, the
        // stale locality entry still steers the search to the next leaf.
        mark(&mut w, 2, 20, false, false).unwrap();
        let skipped = allocate(&mut w, &mut locality, &readers, 20).unwrap();
        assert_eq!(skipped, (2048 + 10) * GRANULE_SIZE);

        locality.rollback();
        assert_eq!(locality.query(0), None);
        let reused = allocate(&mut w, &mut locality, &readers, 20).unwrap();
        assert_eq!(reused, 2 * GRANULE_SIZE);
    }

    #[test]
    fn test_free_invalidates_committed_locality() {
        let format = small_format();
        let store = store(format);
        let mut ws = WriteState::new(State::initial());
        let mut locality = LocalityCache::new(format.alloc_leaf_granules());
        let readers = IntervalSet::new();
        let mut w = Writer::new(&store, &mut ws);

        let mut offsets = Vec::new();
        for _ in 0..8 {
            offsets.push(allocate(&mut w, &mut locality, &readers, 255).unwrap());
        }
        allocate(&mut w, &mut locality, &readers, 10).unwrap();
        locality.commit();
        assert_eq!(locality.query(0), Some(6));

        free(&mut w, &mut locality, offsets[0], 255).unwrap();
        assert_eq!(locality.query(0), None);
        assert_eq!(allocate(&mut w, &mut locality, &readers, 100).unwrap(), offsets[0]);
    }

    #[test]
    fn test_span_granules() {
        let format = Format::default();
        assert_eq!(span_granules(0, &format), 32768);
        assert_eq!(span_granules(1, &format), 32768 * 256);
    }
}
