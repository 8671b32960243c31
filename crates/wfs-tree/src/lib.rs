#![forbid(unsafe_code)]
//! Tree traversal over parsed btrfs nodes.
//!
//! I/O-agnostic: callers provide a read callback that fetches `nodesize`
//! bytes for a logical address (resolving mirrors however they like). Two
//! entry points:
//!
//! - [`walk_tree`]: left-to-right DFS collecting every leaf item, used to
//!   load the chunk and root trees at open time.
//! - [`search_nearest_le`]: descend to the leaf position for a key with
//!   "find nearest ≤" semantics, used by the backward metadata scan.
//!
//! Both bound the descent: levels above 7 are rejected and revisiting a
//! logical address is an error, so malformed sibling pointers cannot loop.

use std::collections::HashSet;
use wfs_ondisk::{Key, LeafItem, NodeHeader, parse_internal_items, parse_leaf_items};
use wfs_types::ParseError;

/// Read callback: fetch the `nodesize`-byte tree block at a logical address.
pub type ReadBlock<'a> = &'a mut dyn FnMut(u64) -> Result<Vec<u8>, ParseError>;

/// A leaf item plus its payload bytes, yielded by [`walk_tree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Key,
    pub data: Vec<u8>,
}

/// Walk the tree rooted at `root_logical`, collecting all leaf items in key
/// order.
pub fn walk_tree(
    read_block: ReadBlock<'_>,
    root_logical: u64,
    nodesize: u32,
) -> Result<Vec<LeafEntry>, ParseError> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    walk_node(read_block, root_logical, nodesize, &mut out, &mut visited)?;
    Ok(out)
}

fn load_node(
    read_block: &mut dyn FnMut(u64) -> Result<Vec<u8>, ParseError>,
    logical: u64,
    nodesize: u32,
) -> Result<(Vec<u8>, NodeHeader), ParseError> {
    let block = read_block(logical)?;
    let expected = wfs_types::u64_to_usize(u64::from(nodesize), "nodesize")?;
    if block.len() != expected {
        return Err(ParseError::InsufficientData {
            needed: expected,
            offset: 0,
            actual: block.len(),
        });
    }
    let header = NodeHeader::parse_from_block(&block)?;
    header.validate(block.len(), Some(logical))?;
    Ok((block, header))
}

fn walk_node(
    read_block: &mut dyn FnMut(u64) -> Result<Vec<u8>, ParseError>,
    logical: u64,
    nodesize: u32,
    out: &mut Vec<LeafEntry>,
    visited: &mut HashSet<u64>,
) -> Result<(), ParseError> {
    if !visited.insert(logical) {
        return Err(ParseError::InvalidField {
            field: "logical_address",
            reason: "cycle or duplicate reference in tree pointers",
        });
    }

    let (block, header) = load_node(read_block, logical, nodesize)?;
    if header.level == 0 {
        let (_, items) = parse_leaf_items(&block)?;
        for item in &items {
            let range = item.payload_range(block.len())?;
            out.push(LeafEntry {
                key: item.key,
                data: block[range].to_vec(),
            });
        }
    } else {
        let (_, ptrs) = parse_internal_items(&block)?;
        for ptr in &ptrs {
            walk_node(read_block, ptr.blockptr, nodesize, out, visited)?;
        }
    }
    Ok(())
}

// ── Nearest-≤ search ────────────────────────────────────────────────────────

/// Where a search landed within one leaf. Holds a copy of the leaf's item
/// table; intended to be held for a single scan step and then dropped.
#[derive(Debug, Clone)]
pub struct LeafCursor {
    /// Logical address of the leaf the search ended in.
    pub leaf_logical: u64,
    /// Slot of the exact match, or the insertion slot of the missed key
    /// (which may equal `items.len()` when the key sorts past the leaf's
    /// last item).
    pub slot: usize,
    /// Whether `slot` is an exact key match.
    pub exact: bool,
    /// The leaf's item table.
    pub items: Vec<LeafItem>,
}

impl LeafCursor {
    /// Key at `slot`, when in range.
    #[must_use]
    pub fn key_at(&self, slot: usize) -> Option<Key> {
        self.items.get(slot).map(|item| item.key)
    }
}

/// Descend from `root_logical` to the leaf position for `key`.
///
/// Internal nodes follow btrfs descent: the child chosen is the last entry
/// whose key is ≤ the target (or the first entry when the target sorts before
/// everything). In the leaf, an exact hit yields `exact = true` at the match
/// slot; otherwise `slot` is the insertion point, and the caller steps back
/// one slot to reach the nearest record below the key.
pub fn search_nearest_le(
    read_block: ReadBlock<'_>,
    root_logical: u64,
    nodesize: u32,
    key: Key,
) -> Result<LeafCursor, ParseError> {
    let mut logical = root_logical;
    let mut visited = HashSet::new();

    loop {
        if !visited.insert(logical) {
            return Err(ParseError::InvalidField {
                field: "logical_address",
                reason: "cycle in tree pointers during search",
            });
        }

        let (block, header) = load_node(read_block, logical, nodesize)?;
        if header.level == 0 {
            let (_, items) = parse_leaf_items(&block)?;
            let slot = items.partition_point(|item| item.key < key);
            let exact = items.get(slot).is_some_and(|item| item.key == key);
            return Ok(LeafCursor {
                leaf_logical: logical,
                slot,
                exact,
                items,
            });
        }

        let (_, ptrs) = parse_internal_items(&block)?;
        if ptrs.is_empty() {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "internal node has no children",
            });
        }
        let after = ptrs.partition_point(|ptr| ptr.key <= key);
        let child = after.saturating_sub(1);
        logical = ptrs[child].blockptr;
    }
}

/// Step a scan key backward: decrement the offset field, or signal the end
/// of the scan once the offset has reached zero.
///
/// Used with [`search_nearest_le`] to revisit a shrinking key until every
/// record below the starting position has been seen. The produced sequence
/// of offsets is strictly decreasing and bounded by zero, so any scan built
/// on this terminates.
#[must_use]
pub fn step_back(key: Key) -> Option<Key> {
    if key.offset == 0 {
        return None;
    }
    Some(Key {
        offset: key.offset - 1,
        ..key
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use wfs_ondisk::{BTRFS_HEADER_SIZE, BTRFS_ITEM_SIZE, BTRFS_KEY_PTR_SIZE};

    const NODESIZE: u32 = 4096;

    fn key(objectid: u64, item_type: u8, offset: u64) -> Key {
        Key {
            objectid,
            item_type,
            offset,
        }
    }

    fn write_header(block: &mut [u8], bytenr: u64, nritems: u32, level: u8) {
        block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
        block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
        block[0x64] = level;
    }

    /// Leaf builder: items get equal payload slots at the tail of the block.
    fn build_leaf(bytenr: u64, keys: &[Key]) -> Vec<u8> {
        let mut block = vec![0_u8; NODESIZE as usize];
        let nritems = u32::try_from(keys.len()).expect("test item count");
        write_header(&mut block, bytenr, nritems, 0);
        for (idx, k) in keys.iter().enumerate() {
            let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
            block[base..base + 8].copy_from_slice(&k.objectid.to_le_bytes());
            block[base + 8] = k.item_type;
            block[base + 9..base + 17].copy_from_slice(&k.offset.to_le_bytes());
            let data_off = u32::try_from(3000 + idx * 16).expect("offset");
            block[base + 17..base + 21].copy_from_slice(&data_off.to_le_bytes());
            block[base + 21..base + 25].copy_from_slice(&16_u32.to_le_bytes());
        }
        block
    }

    fn build_internal(bytenr: u64, children: &[(Key, u64)]) -> Vec<u8> {
        let mut block = vec![0_u8; NODESIZE as usize];
        let nritems = u32::try_from(children.len()).expect("test item count");
        write_header(&mut block, bytenr, nritems, 1);
        for (idx, (k, blockptr)) in children.iter().enumerate() {
            let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
            block[base..base + 8].copy_from_slice(&k.objectid.to_le_bytes());
            block[base + 8] = k.item_type;
            block[base + 9..base + 17].copy_from_slice(&k.offset.to_le_bytes());
            block[base + 17..base + 25].copy_from_slice(&blockptr.to_le_bytes());
            block[base + 25..base + 33].copy_from_slice(&7_u64.to_le_bytes());
        }
        block
    }

    fn reader(blocks: HashMap<u64, Vec<u8>>) -> impl FnMut(u64) -> Result<Vec<u8>, ParseError> {
        move |logical| {
            blocks
                .get(&logical)
                .cloned()
                .ok_or(ParseError::InvalidField {
                    field: "logical_address",
                    reason: "block not in test image",
                })
        }
    }

    #[test]
    fn walk_collects_leaves_in_order() {
        let root = 0x1_0000_u64;
        let left = 0x2_0000_u64;
        let right = 0x3_0000_u64;

        let blocks: HashMap<u64, Vec<u8>> = [
            (
                root,
                build_internal(root, &[(key(1, 0, 0), left), (key(9, 0, 0), right)]),
            ),
            (left, build_leaf(left, &[key(1, 0, 0), key(2, 0, 0)])),
            (right, build_leaf(right, &[key(9, 0, 0)])),
        ]
        .into();

        let mut read = reader(blocks);
        let entries = walk_tree(&mut read, root, NODESIZE).expect("walk");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, key(1, 0, 0));
        assert_eq!(entries[1].key, key(2, 0, 0));
        assert_eq!(entries[2].key, key(9, 0, 0));
        assert_eq!(entries[0].data.len(), 16);
    }

    #[test]
    fn walk_rejects_cycles() {
        let root = 0x1_0000_u64;
        let blocks: HashMap<u64, Vec<u8>> =
            [(root, build_internal(root, &[(key(1, 0, 0), root)]))].into();
        let mut read = reader(blocks);
        let err = walk_tree(&mut read, root, NODESIZE).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "logical_address",
                ..
            }
        ));
    }

    #[test]
    fn search_exact_hit() {
        let leaf = 0x4000_u64;
        let keys = [key(100, 168, 4096), key(100, 178, 10), key(200, 168, 0)];
        let blocks: HashMap<u64, Vec<u8>> = [(leaf, build_leaf(leaf, &keys))].into();
        let mut read = reader(blocks);

        let cursor = search_nearest_le(&mut read, leaf, NODESIZE, key(100, 178, 10)).expect("hit");
        assert!(cursor.exact);
        assert_eq!(cursor.slot, 1);
        assert_eq!(cursor.key_at(1), Some(key(100, 178, 10)));
    }

    #[test]
    fn search_miss_lands_at_insertion_slot() {
        let leaf = 0x4000_u64;
        let keys = [key(100, 168, 4096), key(200, 168, 0)];
        let blocks: HashMap<u64, Vec<u8>> = [(leaf, build_leaf(leaf, &keys))].into();
        let mut read = reader(blocks);

        // Between the two records: the backward scan steps to slot - 1.
        let cursor =
            search_nearest_le(&mut read, leaf, NODESIZE, key(150, 0, 0)).expect("search");
        assert!(!cursor.exact);
        assert_eq!(cursor.slot, 1);

        // Before everything: slot 0, nothing below.
        let cursor = search_nearest_le(&mut read, leaf, NODESIZE, key(1, 0, 0)).expect("search");
        assert!(!cursor.exact);
        assert_eq!(cursor.slot, 0);

        // Past everything: insertion slot equals the item count.
        let cursor =
            search_nearest_le(&mut read, leaf, NODESIZE, key(900, 255, u64::MAX)).expect("search");
        assert!(!cursor.exact);
        assert_eq!(cursor.slot, 2);
        assert_eq!(cursor.key_at(cursor.slot - 1), Some(key(200, 168, 0)));
    }

    #[test]
    fn search_descends_internal_nodes() {
        let root = 0x1_0000_u64;
        let left = 0x2_0000_u64;
        let right = 0x3_0000_u64;

        let blocks: HashMap<u64, Vec<u8>> = [
            (
                root,
                build_internal(root, &[(key(1, 0, 0), left), (key(100, 0, 0), right)]),
            ),
            (left, build_leaf(left, &[key(1, 0, 0), key(50, 0, 0)])),
            (right, build_leaf(right, &[key(100, 0, 0), key(150, 0, 0)])),
        ]
        .into();
        let mut read = reader(blocks);

        let cursor =
            search_nearest_le(&mut read, root, NODESIZE, key(150, 0, 0)).expect("search");
        assert_eq!(cursor.leaf_logical, right);
        assert!(cursor.exact);
        assert_eq!(cursor.slot, 1);

        // A key below every separator still descends into the leftmost leaf.
        let mut read = reader(
            [
                (
                    root,
                    build_internal(root, &[(key(10, 0, 0), left), (key(100, 0, 0), right)]),
                ),
                (left, build_leaf(left, &[key(10, 0, 0)])),
                (right, build_leaf(right, &[key(100, 0, 0)])),
            ]
            .into(),
        );
        let cursor = search_nearest_le(&mut read, root, NODESIZE, key(2, 0, 0)).expect("search");
        assert_eq!(cursor.leaf_logical, left);
        assert_eq!(cursor.slot, 0);
        assert!(!cursor.exact);
    }

    #[test]
    fn search_empty_leaf_misses_at_zero() {
        let leaf = 0x4000_u64;
        let blocks: HashMap<u64, Vec<u8>> = [(leaf, build_leaf(leaf, &[]))].into();
        let mut read = reader(blocks);
        let cursor =
            search_nearest_le(&mut read, leaf, NODESIZE, key(5, 5, 5)).expect("search");
        assert_eq!(cursor.slot, 0);
        assert!(!cursor.exact);
        assert!(cursor.items.is_empty());
    }

    #[test]
    fn step_back_decrements_until_zero() {
        let mut k = key(8192, 168, 3);
        let mut offsets = Vec::new();
        loop {
            offsets.push(k.offset);
            match step_back(k) {
                Some(next) => k = next,
                None => break,
            }
        }
        assert_eq!(offsets, vec![3, 2, 1, 0]);
    }

    proptest! {
        #[test]
        fn step_back_is_strictly_decreasing_and_terminates(start in 0_u64..10_000) {
            let mut k = key(1, 168, start);
            let mut steps = 0_u64;
            while let Some(next) = step_back(k) {
                prop_assert!(next.offset < k.offset);
                prop_assert_eq!(next.objectid, k.objectid);
                prop_assert_eq!(next.item_type, k.item_type);
                k = next;
                steps += 1;
            }
            prop_assert_eq!(k.offset, 0);
            prop_assert_eq!(steps, start);
        }
    }
}
