//! Blob trees for externalized key and value bytes.
//!
//! A blob of `len` bytes is a tree of fixed fan-out:
//! - level 0 is a single `BlobLeaf` of up to 4096 bytes
//! - level `n` is a `BlobInternal` node with up to 256 children of level
//!   `n - 1`, each full except the last
//!
//! The level is the smallest one whose capacity holds `len`, so the shape
//! follows from the length alone and nothing but the root pointer needs to
//! be stored by the owner.
//!
//! Every function that changes a blob keeps the owner's slot pointing at the
//! current root; callers re-read the slot or use the returned pointer.

// Blob offsets inside one node are bounded by the node capacity.
#![allow(clippy::cast_possible_truncation)]

use crate::error::EngineError;
use crate::sector::{INDEX_NODE_SIZE, INDEX_SLOTS, SECTOR_PTR_SIZE, SectorId, SectorPtr, SectorType};
use crate::store::{Reader, Writer};

/// Bytes held by one blob leaf.
pub const BLOB_LEAF_SIZE: u64 = 4096;

const FANOUT: u64 = INDEX_SLOTS as u64;

/// Bytes a blob tree of `level` can hold.
#[must_use]
pub fn capacity(level: u32) -> u64 {
    (0..level).fold(BLOB_LEAF_SIZE, |cap, _| cap.saturating_mul(FANOUT))
}

/// Smallest level whose capacity holds `len` bytes.
#[must_use]
pub fn level_for(len: u64) -> u32 {
    let mut level = 0;
    while capacity(level) < len {
        level += 1;
    }
    level
}

const fn kind_at(level: u32) -> SectorType {
    if level == 0 {
        SectorType::BlobLeaf
    } else {
        SectorType::BlobInternal
    }
}

fn to_usize(value: u64) -> Result<usize, EngineError> {
    usize::try_from(value).map_err(|_| EngineError::internal(format!("blob offset {value} exceeds address space")))
}

/// Length of child `index` of a node holding `node_len` bytes.
fn child_len(level: u32, node_len: u64, index: u64) -> u64 {
    let child_cap = capacity(level - 1);
    node_len.saturating_sub(index * child_cap).min(child_cap)
}

fn child_count(level: u32, node_len: u64) -> u64 {
    node_len.div_ceil(capacity(level - 1))
}

fn slot_ptr(data: &[u8], index: u64) -> SectorPtr {
    SectorPtr::read(data, index as usize * SECTOR_PTR_SIZE)
}

/// Copy `buf.len()` bytes starting at `offset` out of the blob.
pub fn read(reader: Reader<'_>, root: SectorPtr, len: u64, offset: u64, buf: &mut [u8], deepness: usize) -> Result<(), EngineError> {
    if offset.checked_add(buf.len() as u64).is_none_or(|end| end > len) {
        return Err(EngineError::internal(format!(
            "read of {} bytes at {offset} past blob of {len}",
            buf.len()
        )));
    }
    if buf.is_empty() {
        return Ok(());
    }
    read_node(reader, root, level_for(len), offset, buf, deepness)
}

fn read_node(reader: Reader<'_>, ptr: SectorPtr, level: u32, offset: u64, buf: &mut [u8], deepness: usize) -> Result<(), EngineError> {
    let view = reader.view(ptr, kind_at(level), deepness)?;
    let data = view.data();
    if level == 0 {
        let start = to_usize(offset)?;
        let end = start + buf.len();
        let bytes = data
            .get(start..end)
            .ok_or_else(|| EngineError::corruption(format!("blob leaf shorter than {end} bytes")))?;
        buf.copy_from_slice(bytes);
        return Ok(());
    }

    let child_cap = capacity(level - 1);
    let mut done = 0usize;
    while done < buf.len() {
        let position = offset + done as u64;
        let index = position / child_cap;
        let within = position % child_cap;
        let take = (buf.len() - done).min(to_usize(child_cap - within)?);
        if index >= FANOUT {
            return Err(EngineError::corruption("blob index beyond node fan-out"));
        }
        let child = slot_ptr(data, index);
        read_node(reader, child, level - 1, within, &mut buf[done..done + take], deepness + 1)?;
        done += take;
    }
    Ok(())
}

/// The whole blob.
pub fn read_all(reader: Reader<'_>, root: SectorPtr, len: u64) -> Result<Vec<u8>, EngineError> {
    let mut buf = vec![0u8; to_usize(len)?];
    read(reader, root, len, 0, &mut buf, 0)?;
    Ok(buf)
}

/// Build a new blob holding `data` below `parent`.
pub fn create(w: &mut Writer<'_>, data: &[u8], parent: SectorId) -> Result<SectorPtr, EngineError> {
    let len = data.len() as u64;
    build(w, level_for(len), len, Some(data), parent)
}

/// Build a new blob of `len` zero bytes below `parent`.
pub fn create_zeroed(w: &mut Writer<'_>, len: u64, parent: SectorId) -> Result<SectorPtr, EngineError> {
    build(w, level_for(len), len, None, parent)
}

fn build(w: &mut Writer<'_>, level: u32, len: u64, fill: Option<&[u8]>, parent: SectorId) -> Result<SectorPtr, EngineError> {
    if level == 0 {
        let data = fill.map_or_else(|| vec![0u8; len as usize], <[u8]>::to_vec);
        let id = w.new_sector(SectorType::BlobLeaf, data, Some(parent));
        return w.ptr_of(id);
    }

    let id = w.new_sector(SectorType::BlobInternal, vec![0u8; INDEX_NODE_SIZE], Some(parent));
    let child_cap = capacity(level - 1);
    for index in 0..child_count(level, len) {
        let start = index * child_cap;
        let piece_len = child_len(level, len, index);
        let piece = match fill {
            Some(data) => Some(&data[to_usize(start)?..to_usize(start + piece_len)?]),
            None => None,
        };
        let child = build(w, level - 1, piece_len, piece, id)?;
        child.write(w.sector_mut(id)?.data_mut(), index as usize * SECTOR_PTR_SIZE);
    }
    w.ptr_of(id)
}

/// Overwrite `data.len()` bytes at `offset` inside a blob of `len` bytes.
///
/// Touched nodes are dirtized top-down starting at `root`, whose pointer
/// lives in `parent`.
pub fn write(w: &mut Writer<'_>, root: SectorPtr, parent: SectorId, len: u64, offset: u64, data: &[u8]) -> Result<(), EngineError> {
    if offset.checked_add(data.len() as u64).is_none_or(|end| end > len) {
        return Err(EngineError::internal(format!(
            "write of {} bytes at {offset} past blob of {len}",
            data.len()
        )));
    }
    if data.is_empty() {
        return Ok(());
    }
    write_node(w, root, parent, level_for(len), offset, data)
}

fn write_node(w: &mut Writer<'_>, ptr: SectorPtr, parent: SectorId, level: u32, offset: u64, data: &[u8]) -> Result<(), EngineError> {
    let deepness = w.write_state().arena.deepness(parent) + 1;
    let id = w.dirtize(ptr, kind_at(level), Some(parent), deepness)?;
    if level == 0 {
        let start = to_usize(offset)?;
        let bytes = w.sector_mut(id)?.data_mut();
        let target = bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| EngineError::internal("blob leaf shorter than its length"))?;
        target.copy_from_slice(data);
        return Ok(());
    }

    let child_cap = capacity(level - 1);
    let mut done = 0usize;
    while done < data.len() {
        let position = offset + done as u64;
        let index = position / child_cap;
        let within = position % child_cap;
        let take = (data.len() - done).min(to_usize(child_cap - within)?);
        let child = slot_ptr(w.sector(id)?.data(), index);
        write_node(w, child, id, level - 1, within, &data[done..done + take])?;
        done += take;
    }
    Ok(())
}

/// Release every sector of a blob of `len` bytes.
pub fn free(w: &mut Writer<'_>, root: SectorPtr, len: u64) -> Result<(), EngineError> {
    free_node(w, root, level_for(len), len)
}

fn free_node(w: &mut Writer<'_>, ptr: SectorPtr, level: u32, len: u64) -> Result<(), EngineError> {
    if level > 0 {
        let children: Vec<SectorPtr> = {
            let view = w.reader().view(ptr, SectorType::BlobInternal, 0)?;
            (0..child_count(level, len)).map(|index| slot_ptr(view.data(), index)).collect()
        };
        for (index, child) in children.into_iter().enumerate() {
            free_node(w, child, level - 1, child_len(level, len, index as u64))?;
        }
    }
    w.deallocate(ptr, kind_at(level))
}

/// Change a blob's length from `old_len` to `new_len`, zero-filling growth.
///
/// The tree gains levels by wrapping the root in a new internal node and
/// loses them by promoting the first child. Returns the new root, which
/// `parent` already points at.
///
/// Pre-conditions:
/// - both lengths are non-zero.
pub fn resize(w: &mut Writer<'_>, root: SectorPtr, parent: SectorId, old_len: u64, new_len: u64) -> Result<SectorPtr, EngineError> {
    if old_len == 0 || new_len == 0 {
        return Err(EngineError::internal("blob resize to or from zero length"));
    }
    let target = level_for(new_len);
    let mut level = level_for(old_len);
    let mut root = root;
    let mut len = old_len;

    while level > target {
        let keep = capacity(level - 1).min(len);
        root = resize_node(w, root, parent, level, len, keep)?;
        let root_id = w
            .resolve(root)
            .ok_or_else(|| EngineError::internal("resized blob root is not private"))?;
        let child = slot_ptr(w.sector(root_id)?.data(), 0);
        w.replace_child_ptr(Some(parent), SectorType::BlobInternal, root.position(), child)?;
        if let Some(child_id) = w.resolve(child) {
            w.sector_mut(child_id)?.set_parent(Some(parent));
        }
        w.deallocate(root, SectorType::BlobInternal)?;
        root = child;
        level -= 1;
        len = keep;
    }

    while level < target {
        let full = capacity(level);
        root = resize_node(w, root, parent, level, len, full)?;
        let mut data = vec![0u8; INDEX_NODE_SIZE];
        root.write(&mut data, 0);
        let wrapper = w.new_sector(SectorType::BlobInternal, data, Some(parent));
        let wrapper_ptr = w.ptr_of(wrapper)?;
        w.replace_child_ptr(Some(parent), kind_at(level), root.position(), wrapper_ptr)?;
        if let Some(child_id) = w.resolve(root) {
            w.sector_mut(child_id)?.set_parent(Some(wrapper));
        }
        root = wrapper_ptr;
        level += 1;
        len = full;
    }

    resize_node(w, root, parent, level, len, new_len)
}

/// Resize a node without changing its level.
fn resize_node(w: &mut Writer<'_>, ptr: SectorPtr, parent: SectorId, level: u32, old_len: u64, new_len: u64) -> Result<SectorPtr, EngineError> {
    if old_len == new_len {
        return Ok(ptr);
    }
    let deepness = w.write_state().arena.deepness(parent) + 1;
    let id = w.dirtize(ptr, kind_at(level), Some(parent), deepness)?;

    if level == 0 {
        w.resize(id, to_usize(new_len)?)?;
        return relink(w, id, parent, level);
    }

    let old_children = child_count(level, old_len);
    let new_children = child_count(level, new_len);

    for index in new_children..old_children {
        let child = slot_ptr(w.sector(id)?.data(), index);
        free_node(w, child, level - 1, child_len(level, old_len, index))?;
        SectorPtr::NULL.write(w.sector_mut(id)?.data_mut(), index as usize * SECTOR_PTR_SIZE);
    }

    let last_kept = old_children.min(new_children) - 1;
    let child = slot_ptr(w.sector(id)?.data(), last_kept);
    resize_node(
        w,
        child,
        id,
        level - 1,
        child_len(level, old_len, last_kept),
        child_len(level, new_len, last_kept),
    )?;

    for index in old_children..new_children {
        let child = build(w, level - 1, child_len(level, new_len, index), None, id)?;
        child.write(w.sector_mut(id)?.data_mut(), index as usize * SECTOR_PTR_SIZE);
    }
    relink(w, id, parent, level)
}

/// Store the node's current length in its parent's slot.
fn relink(w: &mut Writer<'_>, id: SectorId, parent: SectorId, level: u32) -> Result<SectorPtr, EngineError> {
    let ptr = w.ptr_of(id)?;
    w.replace_child_ptr(Some(parent), kind_at(level), id, ptr)?;
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Format;
    use crate::header::State;
    use crate::sector::SectorType;
    use crate::storage::MemoryStorage;
    use crate::store::{SectorCache, StoreContext, WriteState};

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    struct Fixture {
        store: StoreContext,
        ws: WriteState,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: StoreContext::new(Box::new(MemoryStorage::new()), Format::default(), SectorCache::new()),
                ws: WriteState::new(State::initial()),
            }
        }

        fn writer(&mut self) -> Writer<'_> {
            Writer::new(&self.store, &mut self.ws)
        }
    }

    /// An owner sector whose first pointer slot holds the blob root.
    fn owner(w: &mut Writer<'_>) -> SectorId {
        w.new_sector(SectorType::BlobInternal, vec![0u8; INDEX_NODE_SIZE], None)
    }

    fn root_of(w: &Writer<'_>, owner: SectorId) -> SectorPtr {
        slot_ptr(w.sector(owner).unwrap().data(), 0)
    }

    fn make(w: &mut Writer<'_>, data: &[u8]) -> SectorId {
        let owner = owner(w);
        let root = create(w, data, owner).unwrap();
        root.write(w.sector_mut(owner).unwrap().data_mut(), 0);
        owner
    }

    #[test]
    fn test_levels() {
        assert_eq!(level_for(1), 0);
        assert_eq!(level_for(4096), 0);
        assert_eq!(level_for(4097), 1);
        assert_eq!(level_for(4096 * 256), 1);
        assert_eq!(level_for(4096 * 256 + 1), 2);
    }

    #[test]
    fn test_create_and_read_across_leaves() {
        let mut fixture = Fixture::new();
        let mut w = fixture.writer();
        let data = pattern(10_000);
        let owner = make(&mut w, &data);
        let root = root_of(&w, owner);

        assert_eq!(read_all(w.reader(), root, 10_000).unwrap(), data);
        let mut buf = vec![0u8; 200];
        read(w.reader(), root, 10_000, 4000, &mut buf, 0).unwrap();
        assert_eq!(buf, &data[4000..4200]);
        assert!(read(w.reader(), root, 10_000, 9_900, &mut buf, 0).is_err());
        assert!(read(w.reader(), root, 10_000, u64::MAX, &mut buf, 0).is_err());
    }

    #[test]
    fn test_write_in_place() {
        let mut fixture = Fixture::new();
        let mut w = fixture.writer();
        let mut data = pattern(9000);
        let owner = make(&mut w, &data);

        let patch = vec![0xEE; 300];
        let root = root_of(&w, owner);
        write(&mut w, root, owner, 9000, 4000, &patch).unwrap();
        data[4000..4300].copy_from_slice(&patch);
        assert!(write(&mut w, root, owner, 9000, u64::MAX - 10, &patch).is_err());
        assert_eq!(read_all(w.reader(), root_of(&w, owner), 9000).unwrap(), data);
    }

    #[test]
    fn test_grow_across_levels_zero_fills() {
        let mut fixture = Fixture::new();
        let mut w = fixture.writer();
        let data = pattern(1000);
        let owner = make(&mut w, &data);

        let root = root_of(&w, owner);
        let root = resize(&mut w, root, owner, 1000, 20_000).unwrap();
        assert_eq!(root, root_of(&w, owner));
        let contents = read_all(w.reader(), root, 20_000).unwrap();
        assert_eq!(&contents[..1000], &data[..]);
        assert!(contents[1000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shrink_promotes_first_child_and_frees_rest() {
        let mut fixture = Fixture::new();
        let mut w = fixture.writer();
        let data = pattern(20_000);
        let owner = make(&mut w, &data);
        let sectors_before = w.write_state().arena.len();
        assert_eq!(sectors_before, 1 + 1 + 5);

        let root = root_of(&w, owner);
        let root = resize(&mut w, root, owner, 20_000, 100).unwrap();
        assert_eq!(root, root_of(&w, owner));
        assert_eq!(read_all(w.reader(), root, 100).unwrap(), &data[..100]);
        // Owner plus the single remaining leaf.
        assert_eq!(w.write_state().arena.len(), 2);

        let root = resize(&mut w, root, owner, 100, 5000).unwrap();
        let contents = read_all(w.reader(), root, 5000).unwrap();
        assert_eq!(&contents[..100], &data[..100]);
        assert!(contents[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_shrink_within_level_clears_tail() {
        let mut fixture = Fixture::new();
        let mut w = fixture.writer();
        let data = pattern(3000);
        let owner = make(&mut w, &data);

        let root = root_of(&w, owner);
        let root = resize(&mut w, root, owner, 3000, 10).unwrap();
        let root = resize(&mut w, root, owner, 10, 3000).unwrap();
        let contents = read_all(w.reader(), root, 3000).unwrap();
        assert_eq!(&contents[..10], &data[..10]);
        assert!(contents[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_free_drops_private_sectors() {
        let mut fixture = Fixture::new();
        let mut w = fixture.writer();
        let owner = make(&mut w, &pattern(9000));
        let root = root_of(&w, owner);
        free(&mut w, root, 9000).unwrap();
        assert_eq!(w.write_state().arena.len(), 1);
        assert!(w.write_state().pending_free.is_empty());
    }
}
