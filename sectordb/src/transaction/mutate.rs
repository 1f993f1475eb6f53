//! Structural changes to the writer's B+Tree.
//!
//! Every change starts by dirtizing the cursor's root-to-leaf path, so all
//! nodes touched below are private to the writer. Parents keep exact
//! per-child key counts: inserts and erases adjust every ancestor on the
//! path, splits hand the counts over to the new siblings.
//!
//! # Invariants
//!
//! - No leaf reachable from the root is empty; removing the last entry of
//!   a leaf removes the leaf and any ancestor left without children.
//! - The separator of child `i` is a lower bound of every key below it.
//! - An internal root always has at least two children.

#![allow(clippy::cast_possible_truncation)]

use crate::blob;
use crate::btree::{encode_key_part, internal, leaf};
use crate::config::{MAX_INTERNAL_CHILDREN, MAX_NODE_BYTES, Tweaks};
use crate::error::EngineError;
use crate::sector::{SectorId, SectorPtr, SectorType, bytes};
use crate::store::Writer;
use crate::transaction::cursor::Cursor;

/// Private copies of the nodes on one cursor path.
#[derive(Debug)]
pub struct PrivatePath {
    /// Internal node ids with the child index taken, root first.
    pub internal: Vec<(SectorId, usize)>,
    pub leaf: SectorId,
    pub entry: usize,
}

/// Make every node on the cursor's path writable.
pub fn dirtize_path(w: &mut Writer<'_>, cursor: &Cursor) -> Result<PrivatePath, EngineError> {
    let format = w.format();
    let mut parent = None;
    let mut ptr = w.state().btree_root;
    let mut internal_ids = Vec::with_capacity(cursor.internal.len());
    for (level, step) in cursor.internal.iter().enumerate() {
        let id = w.dirtize(ptr, SectorType::BTreeInternal, parent, level)?;
        ptr = {
            let data = w.sector(id)?.data();
            let slots = internal::parse(data, format)?;
            let slot = slots
                .get(step.index)
                .ok_or_else(|| EngineError::internal("cursor child index out of range"))?;
            internal::child_ptr(data, slot)
        };
        internal_ids.push((id, step.index));
        parent = Some(id);
    }
    let leaf = w.dirtize(ptr, SectorType::BTreeLeaf, parent, cursor.internal.len())?;
    Ok(PrivatePath {
        internal: internal_ids,
        leaf,
        entry: cursor.leaf.index,
    })
}

fn adjust_counts(w: &mut Writer<'_>, path: &PrivatePath, delta: i64) -> Result<(), EngineError> {
    let format = w.format();
    for &(id, index) in &path.internal {
        let slots = internal::parse(w.sector(id)?.data(), format)?;
        let slot = slots
            .get(index)
            .ok_or_else(|| EngineError::internal("cursor child index out of range"))?;
        internal::add_to_subtree_count(w.sector_mut(id)?.data_mut(), slot, delta)?;
    }
    Ok(())
}

/// Encode `key` as a separator, spilling its tail into a new blob.
fn make_key_part(w: &mut Writer<'_>, key: &[u8], parent: SectorId) -> Result<Vec<u8>, EngineError> {
    let inline = key.len().min(w.format().key_inline_cap);
    let ext = if key.len() > inline {
        Some(blob::create(w, &key[inline..], parent)?)
    } else {
        None
    };
    Ok(encode_key_part(key.len() as u64, &key[..inline], ext))
}

fn free_key_part(w: &mut Writer<'_>, part: &[u8]) -> Result<(), EngineError> {
    let format = *w.format();
    if let Some(ptr) = internal::key_part_ext(part, &format) {
        let len = u64::from(bytes::read_u32(part, 0));
        blob::free(w, ptr, len - format.key_inline_cap as u64)?;
    }
    Ok(())
}

/// Insert `key` with an empty value.
///
/// `cursor` is the insertion point returned by a failed search, or `None`
/// when the tree is empty.
pub fn insert(w: &mut Writer<'_>, tweaks: &dyn Tweaks, cursor: Option<&Cursor>, key: &[u8]) -> Result<(), EngineError> {
    let Some(cursor) = cursor else {
        let id = w.new_sector(SectorType::BTreeLeaf, leaf::empty(), None);
        let entry = new_entry(w, key, id)?;
        w.set_data(id, leaf::from_entries(&[entry.as_slice()]))?;
        let ptr = w.ptr_of(id)?;
        let state = w.state_mut();
        state.btree_root = ptr;
        state.btree_depth = 1;
        state.key_value_count = 1;
        return Ok(());
    };

    let path = dirtize_path(w, cursor)?;
    let entry = new_entry(w, key, path.leaf)?;
    let data = leaf::add_entry(w.sector(path.leaf)?.data(), path.entry, &entry);
    w.set_data(path.leaf, data)?;
    adjust_counts(w, &path, 1)?;
    w.state_mut().key_value_count += 1;
    maybe_split_leaf(w, tweaks, &path)
}

fn new_entry(w: &mut Writer<'_>, key: &[u8], leaf_id: SectorId) -> Result<Vec<u8>, EngineError> {
    let inline = key.len().min(w.format().key_inline_cap);
    let ext = if key.len() > inline {
        Some(blob::create(w, &key[inline..], leaf_id)?)
    } else {
        None
    };
    Ok(leaf::build_entry(key.len() as u64, &key[..inline], ext, 0, &[], None))
}

/// Split the path's leaf when it grew past the threshold.
///
/// The right half's first key becomes the separator in the parent.
fn maybe_split_leaf(w: &mut Writer<'_>, tweaks: &dyn Tweaks, path: &PrivatePath) -> Result<(), EngineError> {
    let (size, count) = {
        let data = w.sector(path.leaf)?.data();
        (leaf::encoded_size(data), leaf::count(data))
    };
    if count < 2 || !(size > MAX_NODE_BYTES || tweaks.should_split_leaf(size, count)) {
        return Ok(());
    }

    let format = *w.format();
    let (at, left, right, separator) = {
        let data = w.sector(path.leaf)?.data();
        let at = leaf::split_point(data);
        let (left, right) = leaf::split(data, at);
        let reader = w.reader();
        let first = leaf::layout(&right, 0, &format);
        let separator = first
            .key(&right)
            .to_vec(&mut |ptr: SectorPtr, len: u64| blob::read_all(reader, ptr, len))?;
        (at, left, right, separator)
    };

    w.set_data(path.leaf, left)?;
    let parent = path.internal.last().map(|&(id, _)| id);
    let right_id = w.new_sector(SectorType::BTreeLeaf, right, parent);
    w.reparent_children(right_id)?;
    let separator = make_key_part(w, &separator, right_id)?;
    tracing::debug!("split leaf {} at entry {at} of {count} ({size} bytes)", path.leaf);

    insert_into_parent(
        w,
        tweaks,
        &path.internal,
        path.leaf,
        at as u64,
        separator,
        right_id,
        (count - at) as u64,
    )
}

/// Link the new sibling `right` after `left` in their parent.
///
/// Creates a new root when `left` was the root and splits the parent when
/// it overflows, recursing towards the root.
#[allow(clippy::too_many_arguments)]
fn insert_into_parent(
    w: &mut Writer<'_>,
    tweaks: &dyn Tweaks,
    ancestors: &[(SectorId, usize)],
    left: SectorId,
    left_keys: u64,
    separator: Vec<u8>,
    right: SectorId,
    right_keys: u64,
) -> Result<(), EngineError> {
    let left_ptr = w.ptr_of(left)?;
    let right_ptr = w.ptr_of(right)?;

    let Some((&(parent, index), rest)) = ancestors.split_last() else {
        let children = [
            internal::ChildEntry {
                key: Vec::new(),
                child: left_ptr,
                keys: left_keys,
            },
            internal::ChildEntry {
                key: separator,
                child: right_ptr,
                keys: right_keys,
            },
        ];
        let root = w.new_sector(SectorType::BTreeInternal, internal::build(&children)?, None);
        w.reparent_children(root)?;
        let root_ptr = w.ptr_of(root)?;
        let state = w.state_mut();
        state.btree_root = root_ptr;
        state.btree_depth += 1;
        tracing::debug!("tree grew to depth {}", state.btree_depth);
        return Ok(());
    };

    let format = *w.format();
    let mut children = internal::entries(w.sector(parent)?.data(), &format)?;
    let slot = children
        .get_mut(index)
        .ok_or_else(|| EngineError::internal("split child not found in parent"))?;
    slot.child = left_ptr;
    slot.keys = left_keys;
    children.insert(
        index + 1,
        internal::ChildEntry {
            key: separator,
            child: right_ptr,
            keys: right_keys,
        },
    );

    let size = internal::encoded_size(&children);
    let overflow = children.len() > MAX_INTERNAL_CHILDREN
        || size > MAX_NODE_BYTES
        || tweaks.should_split_internal(size, children.len());
    if !overflow {
        w.set_data(parent, internal::build(&children)?)?;
        return w.reparent_children(parent);
    }

    let at = internal::split_point(&children);
    let mut right_children = children.split_off(at);
    let promoted = std::mem::take(&mut right_children[0].key);
    let left_total = children.iter().map(|child| child.keys).sum();
    let right_total = right_children.iter().map(|child| child.keys).sum();

    w.set_data(parent, internal::build(&children)?)?;
    let grandparent = rest.last().map(|&(id, _)| id);
    let sibling = w.new_sector(SectorType::BTreeInternal, internal::build(&right_children)?, grandparent);
    w.reparent_children(parent)?;
    w.reparent_children(sibling)?;
    tracing::debug!("split internal node {parent} at child {at} ({size} bytes)");

    insert_into_parent(w, tweaks, rest, parent, left_total, promoted, sibling, right_total)
}

/// Remove the cursor's entry, its blobs and any node left empty.
pub fn erase(w: &mut Writer<'_>, cursor: &Cursor) -> Result<(), EngineError> {
    let path = dirtize_path(w, cursor)?;
    let format = *w.format();
    let (layout, key_ext, value_ext, remaining) = {
        let data = w.sector(path.leaf)?.data();
        if path.entry >= leaf::count(data) {
            return Err(EngineError::internal("erase past the end of a leaf"));
        }
        let layout = leaf::layout(data, path.entry, &format);
        let key_ext = layout.key_ext_ptr(data);
        let value_ext = layout.value_ext_ptr(data);
        (layout, key_ext, value_ext, leaf::remove_entry(data, path.entry))
    };

    if let Some(ptr) = key_ext {
        blob::free(w, ptr, layout.key_ext_len())?;
    }
    if let Some(ptr) = value_ext {
        blob::free(w, ptr, layout.value_ext_len())?;
    }
    adjust_counts(w, &path, -1)?;
    let state = w.state_mut();
    state.key_value_count = state
        .key_value_count
        .checked_sub(1)
        .ok_or_else(|| EngineError::internal("key count underflow"))?;

    if leaf::count(&remaining) > 0 {
        return w.set_data(path.leaf, remaining);
    }
    let leaf_ptr = w.ptr_of(path.leaf)?;
    w.deallocate(leaf_ptr, SectorType::BTreeLeaf)?;
    remove_child(w, &path.internal)?;
    collapse_root(w)
}

/// Drop the child the last ancestor points at through the path.
fn remove_child(w: &mut Writer<'_>, ancestors: &[(SectorId, usize)]) -> Result<(), EngineError> {
    let Some((&(parent, index), rest)) = ancestors.split_last() else {
        let state = w.state_mut();
        state.btree_root = SectorPtr::NULL;
        state.btree_depth = 0;
        return Ok(());
    };

    let format = *w.format();
    let mut children = internal::entries(w.sector(parent)?.data(), &format)?;
    if index >= children.len() {
        return Err(EngineError::internal("removed child not found in parent"));
    }
    let removed = children.remove(index);
    if index == 0 {
        // The new first child has no lower bound.
        if let Some(first) = children.first_mut() {
            let part = std::mem::take(&mut first.key);
            free_key_part(w, &part)?;
        }
    } else {
        free_key_part(w, &removed.key)?;
    }

    if !children.is_empty() {
        return w.set_data(parent, internal::build(&children)?);
    }
    let ptr = w.ptr_of(parent)?;
    w.deallocate(ptr, SectorType::BTreeInternal)?;
    remove_child(w, rest)
}

/// Replace an internal root holding a single child by that child.
fn collapse_root(w: &mut Writer<'_>) -> Result<(), EngineError> {
    loop {
        let state = *w.state();
        if state.btree_depth < 2 {
            return Ok(());
        }
        let child = {
            let view = w.reader().view(state.btree_root, SectorType::BTreeInternal, 0)?;
            let slots = internal::parse(view.data(), w.format())?;
            if slots.len() != 1 {
                return Ok(());
            }
            internal::child_ptr(view.data(), &slots[0])
        };
        w.deallocate(state.btree_root, SectorType::BTreeInternal)?;
        if let Some(id) = w.resolve(child) {
            w.sector_mut(id)?.set_parent(None);
        }
        let state = w.state_mut();
        state.btree_root = child;
        state.btree_depth -= 1;
        tracing::debug!("tree shrank to depth {}", state.btree_depth);
    }
}

/// Change the value length of the cursor's entry.
///
/// Moves the value tail between the leaf and a blob as the length crosses
/// the inline cap; growth reads as zeros.
pub fn set_value_size(w: &mut Writer<'_>, tweaks: &dyn Tweaks, cursor: &Cursor, new_len: u64) -> Result<(), EngineError> {
    let path = dirtize_path(w, cursor)?;
    let format = *w.format();
    let (layout, value_ext) = {
        let data = w.sector(path.leaf)?.data();
        if path.entry >= leaf::count(data) {
            return Err(EngineError::internal("resize past the end of a leaf"));
        }
        let layout = leaf::layout(data, path.entry, &format);
        let value_ext = layout.value_ext_ptr(data);
        (layout, value_ext)
    };
    if layout.value_len == new_len {
        return Ok(());
    }

    let new_ext_len = new_len.saturating_sub(format.value_inline_cap as u64);
    let ext = match (value_ext, new_ext_len > 0) {
        (None, false) => None,
        (None, true) => Some(blob::create_zeroed(w, new_ext_len, path.leaf)?),
        (Some(ptr), false) => {
            blob::free(w, ptr, layout.value_ext_len())?;
            None
        }
        (Some(ptr), true) => Some(blob::resize(w, ptr, path.leaf, layout.value_ext_len(), new_ext_len)?),
    };
    let data = leaf::resize_value(w.sector(path.leaf)?.data(), path.entry, &format, new_len, ext);
    w.set_data(path.leaf, data)?;
    maybe_split_leaf(w, tweaks, &path)
}

/// Overwrite value bytes of the cursor's entry starting at `offset`.
pub fn write_value(w: &mut Writer<'_>, cursor: &Cursor, offset: u64, data: &[u8]) -> Result<(), EngineError> {
    let path = dirtize_path(w, cursor)?;
    let format = *w.format();
    let (layout, value_ext) = {
        let leaf_data = w.sector(path.leaf)?.data();
        if path.entry >= leaf::count(leaf_data) {
            return Err(EngineError::internal("write past the end of a leaf"));
        }
        let layout = leaf::layout(leaf_data, path.entry, &format);
        let value_ext = layout.value_ext_ptr(leaf_data);
        (layout, value_ext)
    };
    let end = offset
        .checked_add(data.len() as u64)
        .filter(|&end| end <= layout.value_len)
        .ok_or(EngineError::InvalidOperation("value write past its end"))?;

    let inline_len = layout.value_inline.len() as u64;
    let mut done = 0usize;
    if offset < inline_len {
        let take = (end.min(inline_len) - offset) as usize;
        let start = layout.value_inline.start + offset as usize;
        w.sector_mut(path.leaf)?.data_mut()[start..start + take].copy_from_slice(&data[..take]);
        done = take;
    }
    if done < data.len() {
        let ext = value_ext.ok_or_else(|| EngineError::corruption("value longer than its inline part has no blob"))?;
        let ext_offset = offset + done as u64 - inline_len;
        blob::write(w, ext, path.leaf, layout.value_ext_len(), ext_offset, &data[done..])?;
    }
    Ok(())
}
