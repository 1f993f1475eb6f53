//! Leaf node codec.
//!
//! Layout:
//! - `count`: 2 bytes
//! - `count` cumulative end offsets, 2 bytes each, relative to the start of
//!   the entry area
//! - entries, each:
//!   - `key_len`: 4 bytes
//!   - `value_len`: 8 bytes
//!   - inline key bytes (at most `key_inline_cap`)
//!   - key blob pointer, only when the key is longer than the cap
//!   - inline value bytes (at most `value_inline_cap`)
//!   - value blob pointer, only when the value is longer than the cap
//!
//! Edits rebuild the byte array while copying every untouched entry
//! verbatim, so only the offset table shifts.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;
use std::ops::Range;

use crate::btree::key::{KeyTail, SearchKey, StoredKey, compare_key};
use crate::config::Format;
use crate::error::EngineError;
use crate::sector::{SECTOR_PTR_SIZE, SectorPtr, bytes};

/// Size of the entry count header.
pub const HEADER_SIZE: usize = 2;

/// Key length plus value length fields.
const ENTRY_FIXED_SIZE: usize = 12;

/// Bytes of an empty leaf.
#[must_use]
pub fn empty() -> Vec<u8> {
    vec![0; HEADER_SIZE]
}

#[must_use]
pub fn count(data: &[u8]) -> usize {
    usize::from(bytes::read_u16(data, 0))
}

const fn entries_start(count: usize) -> usize {
    HEADER_SIZE + 2 * count
}

fn end_offset(data: &[u8], index: usize) -> usize {
    usize::from(bytes::read_u16(data, HEADER_SIZE + 2 * index))
}

fn start_offset(data: &[u8], index: usize) -> usize {
    if index == 0 {
        0
    } else {
        end_offset(data, index - 1)
    }
}

/// Absolute byte range of entry `index`.
#[must_use]
pub fn entry_range(data: &[u8], index: usize) -> Range<usize> {
    let base = entries_start(count(data));
    base + start_offset(data, index)..base + end_offset(data, index)
}

#[must_use]
pub fn entry_bytes(data: &[u8], index: usize) -> &[u8] {
    &data[entry_range(data, index)]
}

/// Bytes actually used by the node (excluding granule padding).
#[must_use]
pub fn encoded_size(data: &[u8]) -> usize {
    let n = count(data);
    if n == 0 {
        HEADER_SIZE
    } else {
        entries_start(n) + end_offset(data, n - 1)
    }
}

pub(crate) fn inline_len(len: u64, cap: usize) -> usize {
    usize::try_from(len).map_or(cap, |len| len.min(cap))
}

/// Size of an entry with the given lengths, excluding its offset slot.
#[must_use]
pub fn calc_entry_size(key_len: u64, value_len: u64, format: &Format) -> usize {
    let key_inline = inline_len(key_len, format.key_inline_cap);
    let value_inline = inline_len(value_len, format.value_inline_cap);
    let mut size = ENTRY_FIXED_SIZE + key_inline + value_inline;
    if key_len > key_inline as u64 {
        size += SECTOR_PTR_SIZE;
    }
    if value_len > value_inline as u64 {
        size += SECTOR_PTR_SIZE;
    }
    size
}

/// Decoded positions of one entry's fields, as absolute offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLayout {
    pub key_len: u64,
    pub value_len: u64,
    pub key_inline: Range<usize>,
    pub key_ext: Option<usize>,
    pub value_inline: Range<usize>,
    pub value_ext: Option<usize>,
}

impl EntryLayout {
    #[must_use]
    pub fn key<'a>(&self, data: &'a [u8]) -> StoredKey<'a> {
        StoredKey {
            len: self.key_len,
            inline: &data[self.key_inline.clone()],
            ext: self.key_ext_ptr(data),
        }
    }

    #[must_use]
    pub fn key_ext_ptr(&self, data: &[u8]) -> Option<SectorPtr> {
        self.key_ext.map(|offset| SectorPtr::read(data, offset))
    }

    #[must_use]
    pub fn value_ext_ptr(&self, data: &[u8]) -> Option<SectorPtr> {
        self.value_ext.map(|offset| SectorPtr::read(data, offset))
    }

    /// Length of the value tail stored in the blob tree.
    #[must_use]
    pub fn value_ext_len(&self) -> u64 {
        self.value_len - self.value_inline.len() as u64
    }

    /// Length of the key tail stored in the blob tree.
    #[must_use]
    pub fn key_ext_len(&self) -> u64 {
        self.key_len - self.key_inline.len() as u64
    }
}

/// Decode the field positions of entry `index`.
#[must_use]
pub fn layout(data: &[u8], index: usize, format: &Format) -> EntryLayout {
    let mut offset = entry_range(data, index).start;
    let key_len = u64::from(bytes::read_u32(data, offset));
    let value_len = bytes::read_u64(data, offset + 4);
    offset += ENTRY_FIXED_SIZE;

    let key_inline_len = inline_len(key_len, format.key_inline_cap);
    let key_inline = offset..offset + key_inline_len;
    offset += key_inline_len;
    let key_ext = (key_len > key_inline_len as u64).then_some(offset);
    if key_ext.is_some() {
        offset += SECTOR_PTR_SIZE;
    }

    let value_inline_len = inline_len(value_len, format.value_inline_cap);
    let value_inline = offset..offset + value_inline_len;
    offset += value_inline_len;
    let value_ext = (value_len > value_inline_len as u64).then_some(offset);

    EntryLayout {
        key_len,
        value_len,
        key_inline,
        key_ext,
        value_inline,
        value_ext,
    }
}

/// Encode one entry.
#[must_use]
pub fn build_entry(
    key_len: u64,
    key_inline: &[u8],
    key_ext: Option<SectorPtr>,
    value_len: u64,
    value_inline: &[u8],
    value_ext: Option<SectorPtr>,
) -> Vec<u8> {
    let mut entry =
        Vec::with_capacity(ENTRY_FIXED_SIZE + key_inline.len() + value_inline.len() + 2 * SECTOR_PTR_SIZE);
    entry.extend_from_slice(&(key_len as u32).to_le_bytes());
    entry.extend_from_slice(&value_len.to_le_bytes());
    entry.extend_from_slice(key_inline);
    if let Some(ptr) = key_ext {
        entry.extend_from_slice(&ptr.to_bytes());
    }
    entry.extend_from_slice(value_inline);
    if let Some(ptr) = value_ext {
        entry.extend_from_slice(&ptr.to_bytes());
    }
    entry
}

/// Build a leaf from already encoded entries.
#[must_use]
pub fn from_entries(entries: &[&[u8]]) -> Vec<u8> {
    let body: usize = entries.iter().map(|e| e.len()).sum();
    let mut data = Vec::with_capacity(entries_start(entries.len()) + body);
    data.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    let mut end = 0usize;
    for entry in entries {
        end += entry.len();
        data.extend_from_slice(&(end as u16).to_le_bytes());
    }
    for entry in entries {
        data.extend_from_slice(entry);
    }
    data
}

fn all_entries(data: &[u8]) -> Vec<&[u8]> {
    (0..count(data)).map(|i| entry_bytes(data, i)).collect()
}

/// Insert `entry` so it becomes entry `index`.
#[must_use]
pub fn add_entry(data: &[u8], index: usize, entry: &[u8]) -> Vec<u8> {
    let mut entries = all_entries(data);
    entries.insert(index, entry);
    from_entries(&entries)
}

/// Remove entry `index`.
#[must_use]
pub fn remove_entry(data: &[u8], index: usize) -> Vec<u8> {
    let mut entries = all_entries(data);
    entries.remove(index);
    from_entries(&entries)
}

/// Replace entry `index` with `entry`.
#[must_use]
pub fn replace_entry(data: &[u8], index: usize, entry: &[u8]) -> Vec<u8> {
    let mut entries = all_entries(data);
    entries[index] = entry;
    from_entries(&entries)
}

/// Change the value length of entry `index`.
///
/// Inline value bytes up to the new inline length are preserved and any
/// growth is zero-filled. `value_ext` must be `Some` exactly when the new
/// length exceeds the inline cap.
#[must_use]
pub fn resize_value(
    data: &[u8],
    index: usize,
    format: &Format,
    new_len: u64,
    value_ext: Option<SectorPtr>,
) -> Vec<u8> {
    let entry = layout(data, index, format);
    let new_inline_len = inline_len(new_len, format.value_inline_cap);
    let old_inline = &data[entry.value_inline.clone()];
    let keep = old_inline.len().min(new_inline_len);
    let mut value_inline = old_inline[..keep].to_vec();
    value_inline.resize(new_inline_len, 0);

    let rebuilt = build_entry(
        entry.key_len,
        &data[entry.key_inline.clone()],
        entry.key_ext_ptr(data),
        new_len,
        &value_inline,
        value_ext,
    );
    replace_entry(data, index, &rebuilt)
}

/// Find `key` among the entries.
///
/// Returns `index * 2 + 1` on an exact match at `index`, or `index * 2`
/// where `index` is the insertion point.
pub fn binary_search(
    data: &[u8],
    format: &Format,
    key: &SearchKey<'_>,
    tail: &mut KeyTail<'_>,
) -> Result<usize, EngineError> {
    let mut low = 0;
    let mut high = count(data);
    while low < high {
        let mid = low + (high - low) / 2;
        let entry = layout(data, mid, format);
        match compare_key(key, &entry.key(data), tail)? {
            Ordering::Less => high = mid,
            Ordering::Greater => low = mid + 1,
            Ordering::Equal => return Ok(mid * 2 + 1),
        }
    }
    Ok(low * 2)
}

/// Offsets of every blob pointer stored in the leaf.
#[must_use]
pub fn ptr_offsets(data: &[u8], format: &Format) -> Vec<usize> {
    let mut offsets = Vec::new();
    for i in 0..count(data) {
        let entry = layout(data, i, format);
        offsets.extend(entry.key_ext);
        offsets.extend(entry.value_ext);
    }
    offsets
}

/// Entry index that splits the leaf closest to its byte midpoint.
///
/// Always leaves at least one entry on each side. Requires two entries.
#[must_use]
pub fn split_point(data: &[u8]) -> usize {
    let n = count(data);
    let total = end_offset(data, n - 1) + 2 * n;
    let mut best = 1;
    let mut best_distance = usize::MAX;
    for k in 1..n {
        let left = end_offset(data, k - 1) + 2 * k;
        let distance = (2 * left).abs_diff(total);
        if distance < best_distance {
            best = k;
            best_distance = distance;
        }
    }
    best
}

/// Split into `[0, at)` and `[at, count)`.
#[must_use]
pub fn split(data: &[u8], at: usize) -> (Vec<u8>, Vec<u8>) {
    let entries = all_entries(data);
    (from_entries(&entries[..at]), from_entries(&entries[at..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> Format {
        Format {
            key_inline_cap: 4,
            value_inline_cap: 8,
            alloc_leaf_bytes: 256,
        }
    }

    fn entry(key: &[u8], value: &[u8]) -> Vec<u8> {
        build_entry(
            key.len() as u64,
            key,
            None,
            value.len() as u64,
            value,
            None,
        )
    }

    fn leaf(pairs: &[(&str, &str)]) -> Vec<u8> {
        let entries: Vec<Vec<u8>> = pairs
            .iter()
            .map(|(k, v)| entry(k.as_bytes(), v.as_bytes()))
            .collect();
        let refs: Vec<&[u8]> = entries.iter().map(Vec::as_slice).collect();
        from_entries(&refs)
    }

    fn search(data: &[u8], key: &[u8]) -> usize {
        let mut tail = |_: SectorPtr, _: u64| Err::<Vec<u8>, _>(EngineError::internal("no blobs"));
        binary_search(data, &format(), &SearchKey::new(b"", key), &mut tail).expect("search")
    }

    #[test]
    fn test_empty_leaf() {
        let data = empty();
        assert_eq!(count(&data), 0);
        assert_eq!(encoded_size(&data), HEADER_SIZE);
        assert_eq!(search(&data, b"a"), 0);
    }

    #[test]
    fn test_binary_search_results() {
        let data = leaf(&[("b", "2"), ("d", "4"), ("f", "6")]);
        assert_eq!(search(&data, b"a"), 0);
        assert_eq!(search(&data, b"b"), 1);
        assert_eq!(search(&data, b"c"), 2);
        assert_eq!(search(&data, b"d"), 3);
        assert_eq!(search(&data, b"f"), 5);
        assert_eq!(search(&data, b"g"), 6);
    }

    #[test]
    fn test_add_entry_keeps_other_entries() {
        let data = leaf(&[("a", "1"), ("c", "3")]);
        let data = add_entry(&data, 1, &entry(b"b", b"22"));
        assert_eq!(count(&data), 3);

        let fmt = format();
        let middle = layout(&data, 1, &fmt);
        assert_eq!(&data[middle.key_inline.clone()], b"b");
        assert_eq!(&data[middle.value_inline.clone()], b"22");
        let last = layout(&data, 2, &fmt);
        assert_eq!(&data[last.value_inline], b"3");
        assert_eq!(
            encoded_size(&data),
            HEADER_SIZE + 3 * 2 + 2 * calc_entry_size(1, 1, &fmt) + calc_entry_size(1, 2, &fmt)
        );
    }

    #[test]
    fn test_remove_entry() {
        let data = leaf(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let data = remove_entry(&data, 0);
        assert_eq!(count(&data), 2);
        assert_eq!(search(&data, b"b"), 1);
        assert_eq!(search(&data, b"a"), 0);
    }

    #[test]
    fn test_resize_value_inline() {
        let fmt = format();
        let data = leaf(&[("a", "12345"), ("b", "x")]);

        let grown = resize_value(&data, 0, &fmt, 7, None);
        let e = layout(&grown, 0, &fmt);
        assert_eq!(&grown[e.value_inline], b"12345\0\0");
        assert_eq!(&grown[layout(&grown, 1, &fmt).value_inline], b"x");

        let shrunk = resize_value(&grown, 0, &fmt, 2, None);
        let e = layout(&shrunk, 0, &fmt);
        assert_eq!(&shrunk[e.value_inline], b"12");
    }

    #[test]
    fn test_external_value_layout() {
        let fmt = format();
        let data = leaf(&[("a", "12345678")]);
        let ptr = SectorPtr::with_length(-512, 300, 0);
        let data = resize_value(&data, 0, &fmt, 100, Some(ptr));

        let e = layout(&data, 0, &fmt);
        assert_eq!(e.value_len, 100);
        assert_eq!(e.value_inline.len(), 8);
        assert_eq!(e.value_ext_ptr(&data), Some(ptr));
        assert_eq!(e.value_ext_len(), 92);
        assert_eq!(ptr_offsets(&data, &fmt), vec![e.value_ext.unwrap_or_default()]);
        assert_eq!(calc_entry_size(1, 100, &fmt), 12 + 1 + 8 + SECTOR_PTR_SIZE);
    }

    #[test]
    fn test_external_key_comparison() {
        let fmt = format();
        let key_ptr = SectorPtr::with_length(-256, 256, 0);
        let long = build_entry(7, b"abcd", Some(key_ptr), 0, b"", None);
        let first = entry(b"abc", b"");
        let last = entry(b"b", b"");
        let data = from_entries(&[first.as_slice(), long.as_slice(), last.as_slice()]);

        let mut tail = |ptr: SectorPtr, len: u64| {
            assert_eq!(ptr, key_ptr);
            assert_eq!(len, 3);
            Ok::<_, EngineError>(b"efg".to_vec())
        };
        let found = binary_search(&data, &fmt, &SearchKey::new(b"ab", b"cdefg"), &mut tail)
            .expect("search");
        assert_eq!(found, 3);

        let e = layout(&data, 1, &fmt);
        assert_eq!(e.key_ext_len(), 3);
        assert_eq!(e.key(&data).ext, Some(key_ptr));
    }

    #[test]
    fn test_split_point_follows_bytes_not_count() {
        let data = leaf(&[
            ("a", "77777777"),
            ("b", "77777777"),
            ("c", ""),
            ("d", ""),
            ("e", ""),
            ("f", ""),
        ]);
        let at = split_point(&data);
        assert_eq!(at, 2);

        let (left, right) = split(&data, at);
        assert_eq!(count(&left), 2);
        assert_eq!(count(&right), 4);
        assert_eq!(search(&right, b"c"), 1);
    }
}
