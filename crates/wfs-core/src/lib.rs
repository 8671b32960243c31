#![forbid(unsafe_code)]
//! WreckFS corruption engine.
//!
//! Owns the [`Filesystem`] handle (open, mirror resolution, block I/O,
//! close), the [`Transaction`] used by metadata mutation, and the two
//! corruption operations:
//!
//! - [`corrupt_mirrors`] / [`corrupt_byte_range`]: zero one or all physical
//!   replicas of a logical block range.
//! - [`corrupt_extent_refs`]: scan backward through the extent tree and zero
//!   the payloads of every extent-reference record for one extent, inside a
//!   single transaction.
//!
//! Boundary rule: `wfs_types::ParseError` never escapes this crate; it is
//! converted into `WreckError` variants here.

mod corrupt;
mod extent_refs;

pub use corrupt::{MirrorVisit, TreeBlockBuffer, corrupt_byte_range, corrupt_mirrors};
pub use extent_refs::{ExtentRefKind, ExtentRefReport, corrupt_extent_refs};
pub use wfs_ondisk::Key;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use wfs_device::{Device, DeviceTable, FileByteDevice};
use wfs_error::{Result, WreckError};
use wfs_ondisk::{
    Chunk, MirrorLocation, Superblock, map_logical_to_physical, parse_chunk_item,
    parse_root_item, parse_sys_chunk_array,
};
use wfs_tree::{LeafCursor, search_nearest_le, walk_tree};
use wfs_types::{
    BTRFS_CHUNK_ITEM_KEY, BTRFS_EXTENT_TREE_OBJECTID, BTRFS_ROOT_ITEM_KEY,
    BTRFS_SUPER_INFO_OFFSET, BTRFS_SUPER_INFO_SIZE, DevId, LogicalAddr, ParseError,
};

fn parse_failure(err: &ParseError) -> WreckError {
    WreckError::Parse(err.to_string())
}

fn open_failure(context: &str, detail: impl std::fmt::Display) -> WreckError {
    WreckError::Open(format!("{context}: {detail}"))
}

/// Read `len` bytes at mirror `mirror_num` of `logical` through the chunk
/// map. Shared by the open-time bootstrap and the live handle.
fn read_mapped(
    devices: &DeviceTable,
    chunks: &[Chunk],
    logical: LogicalAddr,
    len: usize,
    mirror_num: u32,
) -> Result<Vec<u8>> {
    let length = u64::try_from(len)
        .map_err(|_| WreckError::Parse("read length does not fit u64".into()))?;
    let (location, device) = resolve_mapped(devices, chunks, logical, length, mirror_num)?;
    let mut buf = vec![0_u8; len];
    device.device().read_exact_at(location.physical, &mut buf)?;
    Ok(buf)
}

fn resolve_mapped(
    devices: &DeviceTable,
    chunks: &[Chunk],
    logical: LogicalAddr,
    length: u64,
    mirror_num: u32,
) -> Result<(MirrorLocation, Arc<Device>)> {
    let location = map_logical_to_physical(chunks, logical, length, mirror_num)
        .map_err(|err| parse_failure(&err))?
        .ok_or(WreckError::MappingInvariant {
            logical: logical.0,
            mirror: mirror_num,
        })?;
    let device = devices
        .get(location.devid)
        .ok_or(WreckError::MappingInvariant {
            logical: logical.0,
            mirror: mirror_num,
        })?;
    Ok((location, Arc::clone(device)))
}

fn register_stripe_devices(devices: &mut DeviceTable, chunks: &[Chunk], image: &Arc<Device>) {
    for chunk in chunks {
        for stripe in &chunk.stripes {
            if devices.get(DevId(stripe.devid)).is_none() {
                devices.register(DevId(stripe.devid), Arc::clone(image));
            }
        }
    }
}

/// An open btrfs image: devices, chunk map, and the extent tree root.
///
/// Assumes an unmounted image with exclusive access; performs no locking.
pub struct Filesystem {
    devices: DeviceTable,
    superblock: Superblock,
    chunks: Vec<Chunk>,
    extent_root: u64,
}

impl Filesystem {
    /// Open a btrfs image and bootstrap enough state to resolve mirrors and
    /// search the extent tree: superblock → sys chunk array → chunk tree →
    /// root tree → extent tree root.
    ///
    /// Every failure in this sequence is an open failure; nothing has been
    /// mutated yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = FileByteDevice::open(path)
            .map_err(|err| open_failure(&path.display().to_string(), err))?;
        let image = Arc::new(Device::new(path.display().to_string(), Arc::new(file)));

        let mut region = vec![0_u8; BTRFS_SUPER_INFO_SIZE];
        let super_offset = u64::try_from(BTRFS_SUPER_INFO_OFFSET)
            .map_err(|_| open_failure("superblock", "offset does not fit u64"))?;
        image
            .device()
            .read_exact_at(super_offset, &mut region)
            .map_err(|err| open_failure("superblock read", err))?;
        let superblock = Superblock::parse_region(&region)
            .map_err(|err| open_failure("superblock parse", err))?;
        info!(
            label = %superblock.label,
            sectorsize = superblock.sectorsize,
            nodesize = superblock.nodesize,
            generation = superblock.generation,
            "superblock parsed"
        );

        let bootstrap = parse_sys_chunk_array(&superblock.sys_chunk_array)
            .map_err(|err| open_failure("sys_chunk_array", err))?;
        let mut devices = DeviceTable::new();
        register_stripe_devices(&mut devices, &bootstrap, &image);
        // The image itself is always addressable even before any chunk is
        // known (single-device tool).
        if devices.get(DevId(1)).is_none() {
            devices.register(DevId(1), Arc::clone(&image));
        }

        // The chunk tree supersedes the bootstrap array; read it through the
        // bootstrap mapping at mirror 1.
        let chunk_entries = Self::walk_via(
            &devices,
            &bootstrap,
            superblock.chunk_root,
            superblock.nodesize,
        )
        .map_err(|err| open_failure("chunk tree", err))?;
        let mut chunks = bootstrap;
        for entry in chunk_entries {
            if entry.key.item_type != BTRFS_CHUNK_ITEM_KEY {
                continue;
            }
            let chunk = parse_chunk_item(entry.key, &entry.data)
                .map_err(|err| open_failure("chunk item", err))?;
            chunks.retain(|existing| existing.logical != chunk.logical);
            chunks.push(chunk);
        }
        chunks.sort_by_key(|chunk| chunk.logical);
        register_stripe_devices(&mut devices, &chunks, &image);
        debug!(chunks = chunks.len(), "chunk map loaded");

        let root_entries =
            Self::walk_via(&devices, &chunks, superblock.root, superblock.nodesize)
                .map_err(|err| open_failure("root tree", err))?;
        let extent_root = root_entries
            .iter()
            .find(|entry| {
                entry.key.objectid == BTRFS_EXTENT_TREE_OBJECTID
                    && entry.key.item_type == BTRFS_ROOT_ITEM_KEY
            })
            .map(|entry| parse_root_item(&entry.data))
            .transpose()
            .map_err(|err| open_failure("extent root item", err))?
            .ok_or_else(|| open_failure("root tree", "no extent tree root item"))?;
        info!(extent_root = extent_root.bytenr, "extent tree located");

        Ok(Self {
            devices,
            superblock,
            chunks,
            extent_root: extent_root.bytenr,
        })
    }

    fn walk_via(
        devices: &DeviceTable,
        chunks: &[Chunk],
        root_logical: u64,
        nodesize: u32,
    ) -> Result<Vec<wfs_tree::LeafEntry>> {
        let len = wfs_types::u64_to_usize(u64::from(nodesize), "nodesize")
            .map_err(|err| parse_failure(&err))?;
        let mut io_failure: Option<WreckError> = None;
        let mut read = |logical: u64| -> std::result::Result<Vec<u8>, ParseError> {
            read_mapped(devices, chunks, LogicalAddr(logical), len, 1).map_err(|err| {
                io_failure = Some(err);
                ParseError::InvalidField {
                    field: "tree_block",
                    reason: "physical read failed",
                }
            })
        };
        let walked = walk_tree(&mut read, root_logical, nodesize);
        if let Some(err) = io_failure {
            return Err(err);
        }
        walked.map_err(|err| parse_failure(&err))
    }

    #[must_use]
    pub fn sectorsize(&self) -> u32 {
        self.superblock.sectorsize
    }

    #[must_use]
    pub fn nodesize(&self) -> u32 {
        self.superblock.nodesize
    }

    #[must_use]
    pub fn extent_root(&self) -> u64 {
        self.extent_root
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Resolve mirror `mirror_num` of the `length`-byte range at `logical`
    /// to its physical location and owning device. Failure to resolve a
    /// mirror the image claims to have is a mapping invariant violation,
    /// never retried.
    pub fn resolve_mirror(
        &self,
        logical: LogicalAddr,
        length: u64,
        mirror_num: u32,
    ) -> Result<(MirrorLocation, Arc<Device>)> {
        resolve_mapped(&self.devices, &self.chunks, logical, length, mirror_num)
    }

    /// Number of complete copies of the chunk covering `logical`.
    ///
    /// Re-queried by the mirror loop after every physical access so a
    /// changed mapping is observed mid-scan.
    pub fn count_mirrors(&self, logical: LogicalAddr) -> Result<u32> {
        wfs_ondisk::count_mirrors(&self.chunks, logical).ok_or(WreckError::MappingInvariant {
            logical: logical.0,
            mirror: 1,
        })
    }

    /// Read `len` bytes at mirror `mirror_num` of `logical`.
    pub fn read_block(
        &self,
        logical: LogicalAddr,
        len: usize,
        mirror_num: u32,
    ) -> Result<Vec<u8>> {
        read_mapped(&self.devices, &self.chunks, logical, len, mirror_num)
    }

    /// Write `data` at mirror `mirror_num` of `logical`.
    pub fn write_block(&self, logical: LogicalAddr, mirror_num: u32, data: &[u8]) -> Result<()> {
        let length = u64::try_from(data.len())
            .map_err(|_| WreckError::Parse("write length does not fit u64".into()))?;
        let (location, device) = self.resolve_mirror(logical, length, mirror_num)?;
        device.device().write_all_at(location.physical, data)?;
        Ok(())
    }

    /// Flush every device once.
    pub fn flush(&self) -> Result<()> {
        self.devices.flush_all()
    }

    /// Begin a transaction for tree mutations. All mutations are staged in
    /// memory until [`Transaction::commit`].
    #[must_use]
    pub fn begin_transaction(&self) -> Transaction<'_> {
        Transaction {
            fs: self,
            dirty: HashMap::new(),
        }
    }

    /// Flush and release the handle. Failure here is fatal to the run.
    pub fn close(self) -> Result<()> {
        self.devices
            .flush_all()
            .map_err(|err| WreckError::Close(err.to_string()))
    }
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("label", &self.superblock.label)
            .field("chunks", &self.chunks.len())
            .field("extent_root", &self.extent_root)
            .finish()
    }
}

/// A scope binding tree mutations to one atomic commit.
///
/// Reads issued through the transaction see staged content; nothing reaches
/// the device until `commit`, which writes every dirty block to all of its
/// mirrors and flushes once. Committing with no staged mutations is valid
/// and still flushes.
pub struct Transaction<'fs> {
    fs: &'fs Filesystem,
    dirty: HashMap<u64, Vec<u8>>,
}

impl Transaction<'_> {
    /// Nearest-≤ search for `key` in the tree rooted at `root_logical`,
    /// reading through the staged view. Any failure during the search —
    /// parse or physical — is reported as a recoverable search error.
    pub fn search(&mut self, root_logical: u64, key: Key) -> Result<LeafCursor> {
        let len = wfs_types::u64_to_usize(u64::from(self.fs.nodesize()), "nodesize")
            .map_err(|err| WreckError::Search(err.to_string()))?;
        let dirty = &self.dirty;
        let fs = self.fs;
        let mut io_failure: Option<WreckError> = None;
        let mut read = |logical: u64| -> std::result::Result<Vec<u8>, ParseError> {
            if let Some(staged) = dirty.get(&logical) {
                return Ok(staged.clone());
            }
            read_mapped(&fs.devices, &fs.chunks, LogicalAddr(logical), len, 1).map_err(|err| {
                io_failure = Some(err);
                ParseError::InvalidField {
                    field: "tree_block",
                    reason: "physical read failed",
                }
            })
        };
        let found = search_nearest_le(&mut read, root_logical, self.fs.nodesize(), key);
        drop(read);
        if let Some(err) = io_failure {
            return Err(WreckError::Search(err.to_string()));
        }
        found.map_err(|err| WreckError::Search(err.to_string()))
    }

    /// Zero the payload bytes of the item at `slot` in the leaf at
    /// `leaf_logical`, leaving the key untouched, and mark the block dirty.
    pub fn zero_item_payload(&mut self, leaf_logical: u64, slot: usize) -> Result<()> {
        let len = wfs_types::u64_to_usize(u64::from(self.fs.nodesize()), "nodesize")
            .map_err(|err| parse_failure(&err))?;
        if !self.dirty.contains_key(&leaf_logical) {
            let fresh = self.fs.read_block(LogicalAddr(leaf_logical), len, 1)?;
            self.dirty.insert(leaf_logical, fresh);
        }
        let block = self
            .dirty
            .get_mut(&leaf_logical)
            .ok_or_else(|| WreckError::Parse("dirty block vanished".into()))?;

        let (_, items) = wfs_ondisk::parse_leaf_items(block).map_err(|err| parse_failure(&err))?;
        let item = items.get(slot).ok_or_else(|| {
            WreckError::Parse(format!(
                "slot {slot} out of range in leaf {leaf_logical} ({} items)",
                items.len()
            ))
        })?;
        let range = item
            .payload_range(block.len())
            .map_err(|err| parse_failure(&err))?;
        block[range].fill(0);
        debug!(leaf = leaf_logical, slot, "item payload zeroed");
        Ok(())
    }

    /// Number of staged dirty blocks.
    #[must_use]
    pub fn dirty_blocks(&self) -> usize {
        self.dirty.len()
    }

    /// Write every staged block to all of its mirrors, then flush once.
    /// Consumes the transaction; failure is fatal to the run.
    pub fn commit(self) -> Result<()> {
        let mut staged: Vec<(u64, Vec<u8>)> = self.dirty.into_iter().collect();
        staged.sort_by_key(|(logical, _)| *logical);

        let blocks = staged.len();
        for (logical, block) in staged {
            let logical = LogicalAddr(logical);
            let copies = self
                .fs
                .count_mirrors(logical)
                .map_err(|err| WreckError::Commit(err.to_string()))?;
            for mirror in 1..=copies {
                self.fs
                    .write_block(logical, mirror, &block)
                    .map_err(|err| WreckError::Commit(err.to_string()))?;
            }
        }
        self.fs
            .flush()
            .map_err(|err| WreckError::Commit(err.to_string()))?;
        info!(blocks, "transaction committed");
        Ok(())
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("dirty_blocks", &self.dirty.len())
            .finish()
    }
}
