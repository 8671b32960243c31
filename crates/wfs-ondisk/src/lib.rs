#![forbid(unsafe_code)]
//! btrfs on-disk structure parsing for WreckFS.
//!
//! Pure byte-level parsing plus the logical→physical mirror mapping. No I/O
//! happens here; callers hand in block images and get structured views back.
//! Only the structures this tool touches are modeled: the superblock, the
//! chunk map (bootstrap array and chunk-tree items), tree node headers,
//! leaf/internal item tables, and root items.

use serde::{Deserialize, Serialize};
use wfs_types::{
    BTRFS_MAGIC, BTRFS_MIRRORED_PROFILES, BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE, DevId,
    LogicalAddr, ParseError, read_fixed, read_le_u16, read_le_u32, read_le_u64, trim_nul_padded,
};

/// Size of a tree node header on disk.
pub const BTRFS_HEADER_SIZE: usize = 101;
/// Size of one leaf item table entry (key:17 + data_offset:u32 + data_size:u32).
pub const BTRFS_ITEM_SIZE: usize = 25;
/// Size of a btrfs_key_ptr on disk (key:17 + blockptr:u64 + generation:u64).
pub const BTRFS_KEY_PTR_SIZE: usize = 33;
/// Size of a btrfs_disk_key on disk (objectid:u64 + type:u8 + offset:u64).
pub const BTRFS_DISK_KEY_SIZE: usize = 17;
/// Maximum tree depth (kernel enforces levels 0-7).
pub const BTRFS_MAX_LEVEL: u8 = 7;

const BTRFS_SUPER_LABEL_OFFSET: usize = 0x12B;
const BTRFS_SUPER_LABEL_LEN: usize = 256;
const BTRFS_SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;
const BTRFS_SYS_CHUNK_ARRAY_MAX: usize = 2048;
/// Fixed chunk-item fields before the embedded stripe array.
const BTRFS_CHUNK_FIXED_SIZE: usize = 48;
/// Size of one btrfs_stripe on disk (devid:u64 + offset:u64 + dev_uuid:16).
const BTRFS_STRIPE_SIZE: usize = 32;
/// Offset of `bytenr` within a btrfs_root_item (after the embedded inode
/// item and generation/root_dirid).
const BTRFS_ROOT_ITEM_BYTENR_OFFSET: usize = 176;
/// Offset of `level` within a btrfs_root_item.
const BTRFS_ROOT_ITEM_LEVEL_OFFSET: usize = 238;
const BTRFS_ROOT_ITEM_MIN_SIZE: usize = 239;

// ── Keys ────────────────────────────────────────────────────────────────────

/// A btrfs tree key. The derived ordering is objectid-major, then type, then
/// offset — the on-disk tree order, and the order the backward metadata scan
/// relies on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    /// The last representable key for an objectid: `{id, max, max}`.
    #[must_use]
    pub fn last_for_object(objectid: u64) -> Self {
        Self {
            objectid,
            item_type: u8::MAX,
            offset: u64::MAX,
        }
    }
}

fn parse_disk_key(data: &[u8], offset: usize) -> Result<Key, ParseError> {
    Ok(Key {
        objectid: read_le_u64(data, offset)?,
        item_type: *data
            .get(offset + 8)
            .ok_or(ParseError::InsufficientData {
                needed: BTRFS_DISK_KEY_SIZE,
                offset,
                actual: data.len().saturating_sub(offset),
            })?,
        offset: read_le_u64(data, offset + 9)?,
    })
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// The subset of the btrfs superblock this tool consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub magic: u64,
    pub generation: u64,
    /// Logical address of the root of the tree of tree roots.
    pub root: u64,
    /// Logical address of the chunk tree root.
    pub chunk_root: u64,
    pub total_bytes: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub label: String,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    /// Parse the 4 KiB superblock region (already extracted from offset 64 KiB).
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < BTRFS_SUPER_INFO_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_SUPER_INFO_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != BTRFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: BTRFS_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;
        if sectorsize == 0 || !sectorsize.is_power_of_two() || sectorsize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be a power of two no larger than 256K",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() || nodesize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be a power of two no larger than 256K",
            });
        }
        if nodesize < sectorsize {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "smaller than sectorsize",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len = wfs_types::u64_to_usize(
            u64::from(sys_chunk_array_size),
            "sys_chunk_array_size",
        )?;
        if sys_array_len > BTRFS_SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }
        let array_end = BTRFS_SYS_CHUNK_ARRAY_OFFSET + sys_array_len;
        if array_end > region.len() {
            return Err(ParseError::InsufficientData {
                needed: sys_array_len,
                offset: BTRFS_SYS_CHUNK_ARRAY_OFFSET,
                actual: region.len().saturating_sub(BTRFS_SYS_CHUNK_ARRAY_OFFSET),
            });
        }

        Ok(Self {
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            total_bytes: read_le_u64(region, 0x70)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            root_level: region[0xC6],
            chunk_root_level: region[0xC7],
            label: trim_nul_padded(&read_fixed::<BTRFS_SUPER_LABEL_LEN>(
                region,
                BTRFS_SUPER_LABEL_OFFSET,
            )?),
            sys_chunk_array: region[BTRFS_SYS_CHUNK_ARRAY_OFFSET..array_end].to_vec(),
        })
    }

    /// Parse the superblock out of a whole-image byte slice.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let end = BTRFS_SUPER_INFO_OFFSET + BTRFS_SUPER_INFO_SIZE;
        if image.len() < end {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_SUPER_INFO_SIZE,
                offset: BTRFS_SUPER_INFO_OFFSET,
                actual: image.len().saturating_sub(BTRFS_SUPER_INFO_OFFSET),
            });
        }
        Self::parse_region(&image[BTRFS_SUPER_INFO_OFFSET..end])
    }
}

// ── Chunk map ───────────────────────────────────────────────────────────────

/// One stripe within a chunk: a physical placement on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// A chunk: a contiguous logical range with one or more physical stripes.
///
/// `logical` comes from the chunk item's key offset; the remaining fields are
/// the btrfs_chunk payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub logical: u64,
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl Chunk {
    /// Number of complete copies of this chunk's data.
    ///
    /// Mirrored profiles (RAID1/RAID1C3/RAID1C4/DUP) keep one full copy per
    /// stripe. Everything else is treated as a single copy; striped data
    /// layout is not this tool's concern.
    #[must_use]
    pub fn num_copies(&self) -> u32 {
        if self.chunk_type & BTRFS_MIRRORED_PROFILES != 0 {
            u32::from(self.num_stripes)
        } else {
            1
        }
    }

    fn contains(&self, logical: u64) -> bool {
        logical >= self.logical
            && self
                .logical
                .checked_add(self.length)
                .is_some_and(|end| logical < end)
    }
}

/// Parse one btrfs_chunk payload starting at `cur`. Returns the chunk and the
/// number of bytes consumed. `logical` is the chunk's starting address (the
/// key offset of the chunk item).
fn parse_chunk_payload(
    data: &[u8],
    cur: usize,
    logical: u64,
) -> Result<(Chunk, usize), ParseError> {
    if cur + BTRFS_CHUNK_FIXED_SIZE > data.len() {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_CHUNK_FIXED_SIZE,
            offset: cur,
            actual: data.len().saturating_sub(cur),
        });
    }

    let length = read_le_u64(data, cur)?;
    let owner = read_le_u64(data, cur + 8)?;
    let stripe_len = read_le_u64(data, cur + 16)?;
    let chunk_type = read_le_u64(data, cur + 24)?;
    let num_stripes = read_le_u16(data, cur + 44)?;
    let sub_stripes = read_le_u16(data, cur + 46)?;

    if num_stripes == 0 {
        return Err(ParseError::InvalidField {
            field: "num_stripes",
            reason: "chunk must have at least one stripe",
        });
    }

    let stripes_count = usize::from(num_stripes);
    let stripes_bytes = stripes_count * BTRFS_STRIPE_SIZE;
    let mut at = cur + BTRFS_CHUNK_FIXED_SIZE;
    if at + stripes_bytes > data.len() {
        return Err(ParseError::InsufficientData {
            needed: stripes_bytes,
            offset: at,
            actual: data.len().saturating_sub(at),
        });
    }

    let mut stripes = Vec::with_capacity(stripes_count);
    for _ in 0..stripes_count {
        stripes.push(Stripe {
            devid: read_le_u64(data, at)?,
            offset: read_le_u64(data, at + 8)?,
            dev_uuid: read_fixed::<16>(data, at + 16)?,
        });
        at += BTRFS_STRIPE_SIZE;
    }

    Ok((
        Chunk {
            logical,
            length,
            owner,
            stripe_len,
            chunk_type,
            num_stripes,
            sub_stripes,
            stripes,
        },
        at - cur,
    ))
}

/// Parse the superblock's bootstrap chunk array: alternating disk keys and
/// chunk payloads.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<Chunk>, ParseError> {
    let mut chunks = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        if cur + BTRFS_DISK_KEY_SIZE > data.len() {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_DISK_KEY_SIZE,
                offset: cur,
                actual: data.len() - cur,
            });
        }
        let key = parse_disk_key(data, cur)?;
        cur += BTRFS_DISK_KEY_SIZE;

        let (chunk, consumed) = parse_chunk_payload(data, cur, key.offset)?;
        cur += consumed;
        chunks.push(chunk);
    }

    Ok(chunks)
}

/// Parse a chunk item found in a chunk-tree leaf. `key` is the item's key
/// (its offset is the chunk's logical start); `payload` is the item data.
pub fn parse_chunk_item(key: Key, payload: &[u8]) -> Result<Chunk, ParseError> {
    let (chunk, consumed) = parse_chunk_payload(payload, 0, key.offset)?;
    if consumed != payload.len() {
        return Err(ParseError::InvalidField {
            field: "chunk_item",
            reason: "trailing bytes after stripe array",
        });
    }
    Ok(chunk)
}

// ── Logical → physical mirror resolution ────────────────────────────────────

/// One physical replica of a logical address: device plus byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorLocation {
    pub devid: DevId,
    pub physical: u64,
}

/// Resolve mirror `mirror_num` (1-based) of the `length`-byte range starting
/// at `logical` against the chunk map.
///
/// For mirrored profiles, mirror `m` is stripe `m-1` and every stripe covers
/// the chunk's whole logical range at the same intra-chunk offset. For
/// single-copy chunks only mirror 1 resolves, through stripe 0.
///
/// Returns `Ok(None)` when no chunk covers `logical`, the range runs past
/// the covering chunk's end, or the chunk has no stripe for that mirror;
/// `Err` only on arithmetic violations in the map.
pub fn map_logical_to_physical(
    chunks: &[Chunk],
    logical: LogicalAddr,
    length: u64,
    mirror_num: u32,
) -> Result<Option<MirrorLocation>, ParseError> {
    if mirror_num == 0 {
        return Err(ParseError::InvalidField {
            field: "mirror_num",
            reason: "mirror numbers start at 1",
        });
    }

    let Some(chunk) = chunks.iter().find(|c| c.contains(logical.0)) else {
        return Ok(None);
    };

    // A single chunk must cover the whole range; resolution never straddles
    // a chunk boundary.
    let range_end = logical
        .0
        .checked_add(length)
        .ok_or(ParseError::InvalidField {
            field: "length",
            reason: "range end overflows",
        })?;
    let chunk_end = chunk
        .logical
        .checked_add(chunk.length)
        .ok_or(ParseError::InvalidField {
            field: "chunk_length",
            reason: "chunk end overflows",
        })?;
    if range_end > chunk_end {
        return Ok(None);
    }

    if mirror_num > chunk.num_copies() {
        return Ok(None);
    }
    let stripe_index = if chunk.chunk_type & BTRFS_MIRRORED_PROFILES != 0 {
        usize::try_from(mirror_num - 1)
            .map_err(|_| ParseError::IntegerConversion { field: "mirror_num" })?
    } else {
        0
    };
    let Some(stripe) = chunk.stripes.get(stripe_index) else {
        return Ok(None);
    };

    let offset_within = logical.0 - chunk.logical;
    let physical = stripe
        .offset
        .checked_add(offset_within)
        .ok_or(ParseError::InvalidField {
            field: "stripe_offset",
            reason: "physical address overflow",
        })?;

    Ok(Some(MirrorLocation {
        devid: DevId(stripe.devid),
        physical,
    }))
}

/// Number of complete copies of the chunk covering `logical`, or `None` when
/// no chunk covers it.
#[must_use]
pub fn count_mirrors(chunks: &[Chunk], logical: LogicalAddr) -> Option<u32> {
    chunks
        .iter()
        .find(|c| c.contains(logical.0))
        .map(Chunk::num_copies)
}

// ── Tree nodes ──────────────────────────────────────────────────────────────

/// Parsed tree node header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeader {
    pub bytenr: u64,
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl NodeHeader {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < BTRFS_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BTRFS_HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        Ok(Self {
            bytenr: read_le_u64(block, 0x30)?,
            generation: read_le_u64(block, 0x50)?,
            owner: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: block[0x64],
        })
    }

    /// Validate against the containing block: bytenr echo, level bound, and
    /// item count vs block capacity.
    pub fn validate(
        &self,
        block_size: usize,
        expected_bytenr: Option<u64>,
    ) -> Result<(), ParseError> {
        if let Some(expected) = expected_bytenr {
            if self.bytenr != expected {
                return Err(ParseError::InvalidField {
                    field: "bytenr",
                    reason: "header bytenr does not match expected",
                });
            }
        }
        if self.level > BTRFS_MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let entry_size = if self.level == 0 {
            BTRFS_ITEM_SIZE
        } else {
            BTRFS_KEY_PTR_SIZE
        };
        let max_items = block_size.saturating_sub(BTRFS_HEADER_SIZE) / entry_size;
        let nritems = wfs_types::u64_to_usize(u64::from(self.nritems), "nritems")?;
        if nritems > max_items {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }
        Ok(())
    }
}

/// A leaf item table entry: key plus the location of its payload within the
/// block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafItem {
    pub key: Key,
    pub data_offset: u32,
    pub data_size: u32,
}

impl LeafItem {
    /// Byte range of this item's payload within its block.
    pub fn payload_range(&self, block_len: usize) -> Result<std::ops::Range<usize>, ParseError> {
        let start = wfs_types::u64_to_usize(u64::from(self.data_offset), "data_offset")?;
        let size = wfs_types::u64_to_usize(u64::from(self.data_size), "data_size")?;
        let end = start.checked_add(size).ok_or(ParseError::InvalidField {
            field: "data_offset",
            reason: "overflow",
        })?;
        if end > block_len {
            return Err(ParseError::InvalidField {
                field: "data_offset",
                reason: "item payload extends past block",
            });
        }
        Ok(start..end)
    }
}

/// An internal node entry: key plus child block pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: u64,
    pub generation: u64,
}

/// Parse a leaf block's item table.
pub fn parse_leaf_items(block: &[u8]) -> Result<(NodeHeader, Vec<LeafItem>), ParseError> {
    let header = NodeHeader::parse_from_block(block)?;
    if header.level != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }
    header.validate(block.len(), None)?;

    let nritems = wfs_types::u64_to_usize(u64::from(header.nritems), "nritems")?;
    let mut items = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        let item = LeafItem {
            key: parse_disk_key(block, base)?,
            data_offset: read_le_u32(block, base + 17)?,
            data_size: read_le_u32(block, base + 21)?,
        };
        // Reject items whose payload cannot be addressed within the block.
        let _ = item.payload_range(block.len())?;
        items.push(item);
    }

    Ok((header, items))
}

/// Parse an internal block's key-pointer table.
pub fn parse_internal_items(block: &[u8]) -> Result<(NodeHeader, Vec<KeyPtr>), ParseError> {
    let header = NodeHeader::parse_from_block(block)?;
    if header.level == 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }
    header.validate(block.len(), None)?;

    let nritems = wfs_types::u64_to_usize(u64::from(header.nritems), "nritems")?;
    let mut ptrs = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_KEY_PTR_SIZE;
        let key = parse_disk_key(block, base)?;
        let blockptr = read_le_u64(block, base + 17)?;
        let generation = read_le_u64(block, base + 25)?;
        if blockptr == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }
        ptrs.push(KeyPtr {
            key,
            blockptr,
            generation,
        });
    }

    Ok((header, ptrs))
}

// ── Root items ──────────────────────────────────────────────────────────────

/// The two fields of a btrfs_root_item this tool needs: where the tree lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRef {
    pub bytenr: u64,
    pub level: u8,
}

/// Parse a ROOT_ITEM payload down to its tree root pointer.
pub fn parse_root_item(payload: &[u8]) -> Result<RootRef, ParseError> {
    if payload.len() < BTRFS_ROOT_ITEM_MIN_SIZE {
        return Err(ParseError::InsufficientData {
            needed: BTRFS_ROOT_ITEM_MIN_SIZE,
            offset: 0,
            actual: payload.len(),
        });
    }
    Ok(RootRef {
        bytenr: read_le_u64(payload, BTRFS_ROOT_ITEM_BYTENR_OFFSET)?,
        level: payload[BTRFS_ROOT_ITEM_LEVEL_OFFSET],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wfs_types::{BTRFS_BLOCK_GROUP_METADATA, BTRFS_BLOCK_GROUP_RAID1, BTRFS_BLOCK_GROUP_SYSTEM};

    fn single_chunk(logical: u64, length: u64, physical: u64) -> Chunk {
        Chunk {
            logical,
            length,
            owner: 2,
            stripe_len: 0x1_0000,
            chunk_type: BTRFS_BLOCK_GROUP_SYSTEM,
            num_stripes: 1,
            sub_stripes: 0,
            stripes: vec![Stripe {
                devid: 1,
                offset: physical,
                dev_uuid: [0; 16],
            }],
        }
    }

    fn raid1_chunk(logical: u64, length: u64, phys_a: u64, phys_b: u64) -> Chunk {
        Chunk {
            logical,
            length,
            owner: 2,
            stripe_len: 0x1_0000,
            chunk_type: BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID1,
            num_stripes: 2,
            sub_stripes: 0,
            stripes: vec![
                Stripe {
                    devid: 1,
                    offset: phys_a,
                    dev_uuid: [0; 16],
                },
                Stripe {
                    devid: 1,
                    offset: phys_b,
                    dev_uuid: [0; 16],
                },
            ],
        }
    }

    #[test]
    fn superblock_smoke() {
        let mut sb = [0_u8; BTRFS_SUPER_INFO_SIZE];
        sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
        sb[0x30..0x38].copy_from_slice(&(BTRFS_SUPER_INFO_OFFSET as u64).to_le_bytes());
        sb[0x48..0x50].copy_from_slice(&7_u64.to_le_bytes());
        sb[0x50..0x58].copy_from_slice(&0x20_0000_u64.to_le_bytes());
        sb[0x58..0x60].copy_from_slice(&0x10_0000_u64.to_le_bytes());
        sb[0x70..0x78].copy_from_slice(&0x100_0000_u64.to_le_bytes());
        sb[0x88..0x90].copy_from_slice(&1_u64.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&4096_u32.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&4096_u32.to_le_bytes());
        sb[BTRFS_SUPER_LABEL_OFFSET..BTRFS_SUPER_LABEL_OFFSET + 5].copy_from_slice(b"wreck");

        let parsed = Superblock::parse_region(&sb).expect("superblock parse");
        assert_eq!(parsed.root, 0x20_0000);
        assert_eq!(parsed.chunk_root, 0x10_0000);
        assert_eq!(parsed.sectorsize, 4096);
        assert_eq!(parsed.label, "wreck");
        assert!(parsed.sys_chunk_array.is_empty());
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let sb = [0_u8; BTRFS_SUPER_INFO_SIZE];
        assert!(matches!(
            Superblock::parse_region(&sb),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn superblock_rejects_nodesize_below_sectorsize() {
        let mut sb = [0_u8; BTRFS_SUPER_INFO_SIZE];
        sb[0x40..0x48].copy_from_slice(&BTRFS_MAGIC.to_le_bytes());
        sb[0x90..0x94].copy_from_slice(&16384_u32.to_le_bytes());
        sb[0x94..0x98].copy_from_slice(&4096_u32.to_le_bytes());
        let err = Superblock::parse_region(&sb).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "nodesize",
                ..
            }
        ));
    }

    /// Serialize a chunk the way the sys array stores it: disk key + payload.
    fn encode_sys_entry(chunk: &Chunk) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&256_u64.to_le_bytes());
        out.push(wfs_types::BTRFS_CHUNK_ITEM_KEY);
        out.extend_from_slice(&chunk.logical.to_le_bytes());
        out.extend_from_slice(&encode_chunk_payload(chunk));
        out
    }

    fn encode_chunk_payload(chunk: &Chunk) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&chunk.length.to_le_bytes());
        out.extend_from_slice(&chunk.owner.to_le_bytes());
        out.extend_from_slice(&chunk.stripe_len.to_le_bytes());
        out.extend_from_slice(&chunk.chunk_type.to_le_bytes());
        out.extend_from_slice(&4096_u32.to_le_bytes()); // io_align
        out.extend_from_slice(&4096_u32.to_le_bytes()); // io_width
        out.extend_from_slice(&4096_u32.to_le_bytes()); // sector_size
        out.extend_from_slice(&chunk.num_stripes.to_le_bytes());
        out.extend_from_slice(&chunk.sub_stripes.to_le_bytes());
        for stripe in &chunk.stripes {
            out.extend_from_slice(&stripe.devid.to_le_bytes());
            out.extend_from_slice(&stripe.offset.to_le_bytes());
            out.extend_from_slice(&stripe.dev_uuid);
        }
        out
    }

    #[test]
    fn sys_chunk_array_round_trips() {
        let chunk = single_chunk(0x10_0000, 0x10_0000, 0x2_0000);
        let data = encode_sys_entry(&chunk);
        let parsed = parse_sys_chunk_array(&data).expect("parse");
        assert_eq!(parsed, vec![chunk]);
    }

    #[test]
    fn sys_chunk_array_truncated_fails() {
        let chunk = single_chunk(0x10_0000, 0x10_0000, 0x2_0000);
        let mut data = encode_sys_entry(&chunk);
        data.truncate(data.len() - 5);
        assert!(matches!(
            parse_sys_chunk_array(&data),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn chunk_item_rejects_trailing_bytes() {
        let chunk = raid1_chunk(0x20_0000, 0x10_0000, 0x4_0000, 0x8_0000);
        let mut payload = encode_chunk_payload(&chunk);
        payload.push(0);
        let key = Key {
            objectid: 256,
            item_type: wfs_types::BTRFS_CHUNK_ITEM_KEY,
            offset: chunk.logical,
        };
        assert!(matches!(
            parse_chunk_item(key, &payload),
            Err(ParseError::InvalidField {
                field: "chunk_item",
                ..
            })
        ));
        payload.pop();
        assert_eq!(parse_chunk_item(key, &payload).expect("parse"), chunk);
    }

    #[test]
    fn mirror_mapping_single_copy() {
        let chunks = vec![single_chunk(0x10_0000, 0x10_0000, 0x2_0000)];
        let loc = map_logical_to_physical(&chunks, LogicalAddr(0x10_1000), 4096, 1)
            .expect("map")
            .expect("covered");
        assert_eq!(loc.devid, DevId(1));
        assert_eq!(loc.physical, 0x2_1000);

        // Mirror 2 of a single-copy chunk does not resolve.
        assert!(
            map_logical_to_physical(&chunks, LogicalAddr(0x10_1000), 4096, 2)
                .expect("map")
                .is_none()
        );
        assert_eq!(count_mirrors(&chunks, LogicalAddr(0x10_1000)), Some(1));
    }

    #[test]
    fn mirror_mapping_raid1_both_copies() {
        let chunks = vec![raid1_chunk(0x20_0000, 0x10_0000, 0x4_0000, 0x8_0000)];
        let m1 = map_logical_to_physical(&chunks, LogicalAddr(0x20_3000), 4096, 1)
            .expect("map")
            .expect("covered");
        let m2 = map_logical_to_physical(&chunks, LogicalAddr(0x20_3000), 4096, 2)
            .expect("map")
            .expect("covered");
        assert_eq!(m1.physical, 0x4_3000);
        assert_eq!(m2.physical, 0x8_3000);
        assert_eq!(count_mirrors(&chunks, LogicalAddr(0x20_3000)), Some(2));
        assert!(
            map_logical_to_physical(&chunks, LogicalAddr(0x20_3000), 4096, 3)
                .expect("map")
                .is_none()
        );
    }

    #[test]
    fn mirror_mapping_uncovered_address() {
        let chunks = vec![single_chunk(0x10_0000, 0x10_0000, 0x2_0000)];
        assert!(
            map_logical_to_physical(&chunks, LogicalAddr(0x90_0000), 4096, 1)
                .expect("map")
                .is_none()
        );
        assert_eq!(count_mirrors(&chunks, LogicalAddr(0x90_0000)), None);
    }

    #[test]
    fn mirror_mapping_rejects_range_past_chunk_end() {
        // Chunk covers 0x10_0000..0x20_0000.
        let chunks = vec![single_chunk(0x10_0000, 0x10_0000, 0x2_0000)];

        // The last block inside the chunk resolves.
        assert!(
            map_logical_to_physical(&chunks, LogicalAddr(0x1F_F000), 4096, 1)
                .expect("map")
                .is_some()
        );
        // One byte more straddles the boundary.
        assert!(
            map_logical_to_physical(&chunks, LogicalAddr(0x1F_F000), 4097, 1)
                .expect("map")
                .is_none()
        );
        // Overflowing range end is an arithmetic violation, not a miss.
        assert!(matches!(
            map_logical_to_physical(&chunks, LogicalAddr(0x10_1000), u64::MAX, 1),
            Err(ParseError::InvalidField { field: "length", .. })
        ));
    }

    #[test]
    fn mirror_zero_is_rejected() {
        let chunks = vec![single_chunk(0x10_0000, 0x10_0000, 0x2_0000)];
        assert!(matches!(
            map_logical_to_physical(&chunks, LogicalAddr(0x10_0000), 4096, 0),
            Err(ParseError::InvalidField {
                field: "mirror_num",
                ..
            })
        ));
    }

    #[test]
    fn key_ordering_is_objectid_major() {
        let a = Key {
            objectid: 1,
            item_type: 200,
            offset: u64::MAX,
        };
        let b = Key {
            objectid: 2,
            item_type: 0,
            offset: 0,
        };
        assert!(a < b);

        let c = Key {
            objectid: 2,
            item_type: 1,
            offset: 5,
        };
        let d = Key {
            objectid: 2,
            item_type: 1,
            offset: 6,
        };
        assert!(c < d);
        assert_eq!(Key::last_for_object(2).objectid, 2);
        assert!(d < Key::last_for_object(2));
    }

    fn make_block(size: usize, nritems: u32, level: u8) -> Vec<u8> {
        let mut block = vec![0_u8; size];
        block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
        block[0x64] = level;
        block
    }

    fn write_leaf_item(block: &mut [u8], idx: usize, key: Key, data_off: u32, data_sz: u32) {
        let base = BTRFS_HEADER_SIZE + idx * BTRFS_ITEM_SIZE;
        block[base..base + 8].copy_from_slice(&key.objectid.to_le_bytes());
        block[base + 8] = key.item_type;
        block[base + 9..base + 17].copy_from_slice(&key.offset.to_le_bytes());
        block[base + 17..base + 21].copy_from_slice(&data_off.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&data_sz.to_le_bytes());
    }

    #[test]
    fn leaf_items_parse_and_bound_payloads() {
        let mut block = make_block(4096, 2, 0);
        write_leaf_item(
            &mut block,
            0,
            Key {
                objectid: 8192,
                item_type: 168,
                offset: 4096,
            },
            3000,
            24,
        );
        write_leaf_item(
            &mut block,
            1,
            Key {
                objectid: 8192,
                item_type: 178,
                offset: 10,
            },
            3024,
            28,
        );

        let (header, items) = parse_leaf_items(&block).expect("leaf parse");
        assert_eq!(header.level, 0);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key.objectid, 8192);
        assert_eq!(items[0].payload_range(block.len()).expect("range"), 3000..3024);
        assert_eq!(items[1].payload_range(block.len()).expect("range"), 3024..3052);
    }

    #[test]
    fn leaf_item_payload_past_block_fails() {
        let mut block = make_block(512, 1, 0);
        write_leaf_item(
            &mut block,
            0,
            Key {
                objectid: 1,
                item_type: 1,
                offset: 0,
            },
            600,
            10,
        );
        assert!(matches!(
            parse_leaf_items(&block),
            Err(ParseError::InvalidField {
                field: "data_offset",
                ..
            })
        ));
    }

    #[test]
    fn internal_items_parse() {
        let mut block = make_block(4096, 1, 1);
        let base = BTRFS_HEADER_SIZE;
        block[base..base + 8].copy_from_slice(&256_u64.to_le_bytes());
        block[base + 8] = 168;
        block[base + 9..base + 17].copy_from_slice(&0_u64.to_le_bytes());
        block[base + 17..base + 25].copy_from_slice(&0x4000_u64.to_le_bytes());
        block[base + 25..base + 33].copy_from_slice(&9_u64.to_le_bytes());

        let (header, ptrs) = parse_internal_items(&block).expect("internal parse");
        assert_eq!(header.level, 1);
        assert_eq!(ptrs.len(), 1);
        assert_eq!(ptrs[0].blockptr, 0x4000);
        assert_eq!(ptrs[0].generation, 9);
    }

    #[test]
    fn internal_items_reject_zero_blockptr() {
        let mut block = make_block(4096, 1, 1);
        let base = BTRFS_HEADER_SIZE;
        block[base..base + 8].copy_from_slice(&256_u64.to_le_bytes());
        assert!(matches!(
            parse_internal_items(&block),
            Err(ParseError::InvalidField {
                field: "blockptr",
                ..
            })
        ));
    }

    #[test]
    fn header_validate_rejects_overfull_leaf() {
        // A 4096-byte block holds (4096-101)/25 = 159 leaf items at most.
        let block = make_block(4096, 200, 0);
        let header = NodeHeader::parse_from_block(&block).expect("parse");
        assert!(matches!(
            header.validate(4096, None),
            Err(ParseError::InvalidField {
                field: "nritems",
                ..
            })
        ));
    }

    #[test]
    fn header_validate_bytenr_echo() {
        let mut block = make_block(4096, 0, 0);
        block[0x30..0x38].copy_from_slice(&0x4000_u64.to_le_bytes());
        let header = NodeHeader::parse_from_block(&block).expect("parse");
        header.validate(4096, Some(0x4000)).expect("match");
        assert!(header.validate(4096, Some(0x8000)).is_err());
    }

    #[test]
    fn root_item_parses_bytenr_and_level() {
        let mut payload = vec![0_u8; 239];
        payload[176..184].copy_from_slice(&0x20_1000_u64.to_le_bytes());
        payload[238] = 1;
        let root = parse_root_item(&payload).expect("root item");
        assert_eq!(root.bytenr, 0x20_1000);
        assert_eq!(root.level, 1);

        assert!(matches!(
            parse_root_item(&payload[..100]),
            Err(ParseError::InsufficientData { .. })
        ));
    }
}
