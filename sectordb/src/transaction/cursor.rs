//! Read-only navigation over one version of the B+Tree.
//!
//! A [`Cursor`] records the path from the root to one leaf entry together
//! with the entry's rank. Paths are plain pointers and child indices, so a
//! cursor stays valid for as long as the version it was built from does;
//! the writer rebuilds its cursor after every structural change.

use crate::blob;
use crate::btree::{SearchKey, internal, leaf};
use crate::error::EngineError;
use crate::header::State;
use crate::sector::{SectorPtr, SectorType};
use crate::store::{Reader, View};

/// One visited node and the child (or entry) taken in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub ptr: SectorPtr,
    pub index: usize,
}

/// Position of one entry, or of an insertion point, in a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// Internal nodes from the root down.
    pub internal: Vec<Step>,
    pub leaf: Step,
    /// Rank of the entry among all keys of the tree.
    pub key_index: u64,
}

/// Node type at `level` of a tree with `depth` levels.
#[must_use]
pub const fn node_kind(level: usize, depth: usize) -> SectorType {
    if level + 1 == depth {
        SectorType::BTreeLeaf
    } else {
        SectorType::BTreeInternal
    }
}

/// The B+Tree of one [`State`] seen through a [`Reader`].
#[derive(Debug, Clone, Copy)]
pub struct Tree<'a> {
    reader: Reader<'a>,
    root: SectorPtr,
    depth: usize,
    keys: u64,
}

impl<'a> Tree<'a> {
    #[must_use]
    pub const fn new(reader: Reader<'a>, state: &State) -> Self {
        Self {
            reader,
            root: state.btree_root,
            depth: state.btree_depth as usize,
            keys: state.key_value_count,
        }
    }

    #[must_use]
    pub const fn reader(&self) -> Reader<'a> {
        self.reader
    }

    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub const fn root(&self) -> SectorPtr {
        self.root
    }

    /// Number of keys in the whole tree.
    #[must_use]
    pub const fn keys(&self) -> u64 {
        self.keys
    }

    fn node(&self, ptr: SectorPtr, level: usize) -> Result<View<'a>, EngineError> {
        self.reader.view(ptr, node_kind(level, self.depth), level)
    }

    fn check_shape(&self) -> Result<bool, EngineError> {
        if self.root.is_null() {
            return Ok(false);
        }
        if self.depth == 0 {
            return Err(EngineError::corruption("non-empty tree with depth 0"));
        }
        Ok(true)
    }

    /// Leaf entry matching `key`, or the insertion point for it.
    ///
    /// Returns `None` for an empty tree, otherwise the cursor and whether
    /// the key exists.
    pub fn descend(&self, key: &SearchKey<'_>) -> Result<Option<(Cursor, bool)>, EngineError> {
        if !self.check_shape()? {
            return Ok(None);
        }
        let format = self.reader.format();
        let reader = self.reader;
        let mut tail = |ptr: SectorPtr, len: u64| blob::read_all(reader, ptr, len);

        let mut steps = Vec::with_capacity(self.depth - 1);
        let mut key_index = 0;
        let mut ptr = self.root;
        for level in 0..self.depth - 1 {
            let view = self.node(ptr, level)?;
            let data = view.data();
            let slots = internal::parse(data, format)?;
            let child = internal::find_child(data, format, key, &mut tail)?;
            key_index += internal::keys_before(data, &slots, child);
            steps.push(Step { ptr, index: child });
            ptr = internal::child_ptr(data, &slots[child]);
        }

        let view = self.node(ptr, self.depth - 1)?;
        let found = leaf::binary_search(view.data(), format, key, &mut tail)?;
        let index = found / 2;
        let cursor = Cursor {
            internal: steps,
            leaf: Step { ptr, index },
            key_index: key_index + index as u64,
        };
        Ok(Some((cursor, found % 2 == 1)))
    }

    /// Entry with rank `index`.
    ///
    /// Pre-conditions:
    /// - `index` is below the tree's key count.
    pub fn descend_by_index(&self, index: u64) -> Result<Cursor, EngineError> {
        if index >= self.keys || !self.check_shape()? {
            return Err(EngineError::internal(format!(
                "key index {index} beyond {} keys",
                self.keys
            )));
        }
        let format = self.reader.format();
        let mut steps = Vec::with_capacity(self.depth - 1);
        let mut remaining = index;
        let mut ptr = self.root;
        for level in 0..self.depth - 1 {
            let view = self.node(ptr, level)?;
            let data = view.data();
            let (child, rest) = internal::find_child_by_index(data, format, remaining)?;
            let slots = internal::parse(data, format)?;
            steps.push(Step { ptr, index: child });
            ptr = internal::child_ptr(data, &slots[child]);
            remaining = rest;
        }

        let count = leaf::count(self.node(ptr, self.depth - 1)?.data());
        let entry = usize::try_from(remaining)
            .ok()
            .filter(|&entry| entry < count)
            .ok_or_else(|| EngineError::corruption("leaf holds fewer keys than its parent records"))?;
        Ok(Cursor {
            internal: steps,
            leaf: Step { ptr, index: entry },
            key_index: index,
        })
    }

    /// Descend from `ptr` along first (or last) children to a leaf entry.
    fn extend_edge(&self, cursor: &mut Cursor, ptr: SectorPtr, last: bool) -> Result<(), EngineError> {
        let format = self.reader.format();
        let mut ptr = ptr;
        for level in cursor.internal.len()..self.depth - 1 {
            let view = self.node(ptr, level)?;
            let slots = internal::parse(view.data(), format)?;
            let index = if last { slots.len() - 1 } else { 0 };
            cursor.internal.push(Step { ptr, index });
            ptr = internal::child_ptr(view.data(), &slots[index]);
        }
        let count = leaf::count(self.node(ptr, self.depth - 1)?.data());
        if count == 0 {
            return Err(EngineError::corruption("empty leaf reachable from the root"));
        }
        cursor.leaf = Step {
            ptr,
            index: if last { count - 1 } else { 0 },
        };
        Ok(())
    }

    fn edge(&self, last: bool) -> Result<Option<Cursor>, EngineError> {
        if !self.check_shape()? {
            return Ok(None);
        }
        let mut cursor = Cursor {
            internal: Vec::with_capacity(self.depth - 1),
            leaf: Step {
                ptr: SectorPtr::NULL,
                index: 0,
            },
            key_index: if last { self.keys.saturating_sub(1) } else { 0 },
        };
        self.extend_edge(&mut cursor, self.root, last)?;
        Ok(Some(cursor))
    }

    /// Smallest key of the tree.
    pub fn first(&self) -> Result<Option<Cursor>, EngineError> {
        self.edge(false)
    }

    /// Largest key of the tree.
    pub fn last(&self) -> Result<Option<Cursor>, EngineError> {
        self.edge(true)
    }

    /// Number of entries in the cursor's leaf.
    pub fn leaf_len(&self, cursor: &Cursor) -> Result<usize, EngineError> {
        Ok(leaf::count(self.node(cursor.leaf.ptr, self.depth - 1)?.data()))
    }

    /// Entry following the cursor, crossing leaf boundaries.
    pub fn next(&self, cursor: &Cursor) -> Result<Option<Cursor>, EngineError> {
        let mut cursor = cursor.clone();
        if cursor.leaf.index + 1 < self.leaf_len(&cursor)? {
            cursor.leaf.index += 1;
            cursor.key_index += 1;
            return Ok(Some(cursor));
        }

        let format = self.reader.format();
        while let Some(mut step) = cursor.internal.pop() {
            let view = self.node(step.ptr, cursor.internal.len())?;
            let slots = internal::parse(view.data(), format)?;
            if step.index + 1 < slots.len() {
                step.index += 1;
                let child = internal::child_ptr(view.data(), &slots[step.index]);
                cursor.internal.push(step);
                self.extend_edge(&mut cursor, child, false)?;
                cursor.key_index += 1;
                return Ok(Some(cursor));
            }
        }
        Ok(None)
    }

    /// Entry preceding the cursor, crossing leaf boundaries.
    pub fn previous(&self, cursor: &Cursor) -> Result<Option<Cursor>, EngineError> {
        let mut cursor = cursor.clone();
        if cursor.leaf.index > 0 {
            cursor.leaf.index -= 1;
            cursor.key_index -= 1;
            return Ok(Some(cursor));
        }

        let format = self.reader.format();
        while let Some(mut step) = cursor.internal.pop() {
            if step.index > 0 {
                let view = self.node(step.ptr, cursor.internal.len())?;
                let slots = internal::parse(view.data(), format)?;
                step.index -= 1;
                let child = internal::child_ptr(view.data(), &slots[step.index]);
                cursor.internal.push(step);
                self.extend_edge(&mut cursor, child, true)?;
                cursor.key_index -= 1;
                return Ok(Some(cursor));
            }
        }
        Ok(None)
    }

    /// Leaf bytes and the field layout of the cursor's entry.
    pub fn entry(&self, cursor: &Cursor) -> Result<(View<'a>, leaf::EntryLayout), EngineError> {
        let view = self.node(cursor.leaf.ptr, self.depth - 1)?;
        if cursor.leaf.index >= leaf::count(view.data()) {
            return Err(EngineError::internal("cursor is past the end of its leaf"));
        }
        let layout = leaf::layout(view.data(), cursor.leaf.index, self.reader.format());
        Ok((view, layout))
    }

    /// Full key of the cursor's entry.
    pub fn key(&self, cursor: &Cursor) -> Result<Vec<u8>, EngineError> {
        let (view, layout) = self.entry(cursor)?;
        let reader = self.reader;
        layout
            .key(view.data())
            .to_vec(&mut |ptr: SectorPtr, len: u64| blob::read_all(reader, ptr, len))
    }

    /// Copy value bytes `[offset, offset + buf.len())` of the cursor's entry.
    pub fn read_value(&self, cursor: &Cursor, offset: u64, buf: &mut [u8]) -> Result<(), EngineError> {
        let (view, layout) = self.entry(cursor)?;
        let end = offset
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= layout.value_len)
            .ok_or(EngineError::InvalidOperation("value read past its end"))?;
        let inline = &view.data()[layout.value_inline.clone()];
        let inline_len = inline.len() as u64;

        let mut done = 0usize;
        if offset < inline_len {
            let take = usize::try_from(end.min(inline_len) - offset)
                .map_err(|_| EngineError::internal("inline value range overflow"))?;
            let start = usize::try_from(offset).map_err(|_| EngineError::internal("inline value offset overflow"))?;
            buf[..take].copy_from_slice(&inline[start..start + take]);
            done = take;
        }
        if done < buf.len() {
            let ext = layout
                .value_ext_ptr(view.data())
                .ok_or_else(|| EngineError::corruption("value longer than its inline part has no blob"))?;
            let ext_offset = offset + done as u64 - inline_len;
            blob::read(self.reader, ext, layout.value_ext_len(), ext_offset, &mut buf[done..], self.depth)?;
        }
        Ok(())
    }
}
