//! Mirror-aware block corruption.
//!
//! Visits every physical replica of a logical block range in mirror order
//! and zeroes the targeted copies. The copy count is re-queried from the
//! chunk map after every mirror so a mapping change mid-loop is observed
//! rather than assumed away.

use serde::Serialize;
use tracing::{info, warn};
use wfs_error::{Result, WreckError};
use wfs_types::{ByteCount, LogicalAddr};

use crate::Filesystem;

/// The block content most recently written back by the mirror loop, handed
/// to callers so they can inspect what now sits on disk.
#[derive(Debug, Clone)]
pub struct TreeBlockBuffer {
    pub logical: LogicalAddr,
    pub data: Vec<u8>,
}

/// One physical access during a mirror loop, reported through the visit
/// callback as it happens.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorVisit {
    pub mirror: u32,
    pub logical: u64,
    pub physical: u64,
    pub device: String,
    /// Whether this copy was zeroed and written back (false when a specific
    /// copy was requested and this is not it).
    pub zeroed: bool,
}

/// Zero `block_len` bytes at `logical` across its mirrors.
///
/// Every mirror is resolved, counted against its device, and reported
/// through `visit`, whether or not it ends up zeroed. When `target` is
/// `None` every copy is zeroed; when it names a copy only that mirror is
/// touched. Each zeroing write is followed by a device sync before the next
/// mirror is visited.
///
/// Returns the buffer from the last zeroing write, bound to `logical`.
pub fn corrupt_mirrors(
    fs: &Filesystem,
    logical: LogicalAddr,
    block_len: ByteCount,
    target: Option<u32>,
    visit: &mut dyn FnMut(&MirrorVisit),
) -> Result<TreeBlockBuffer> {
    let len = block_len.to_usize().map_err(|err| {
        WreckError::Usage(format!("block length does not fit memory: {err}"))
    })?;
    if len == 0 {
        return Err(WreckError::Usage("cannot corrupt zero bytes".into()));
    }

    let mut mirror = 1_u32;
    let mut last = vec![0_u8; len];
    loop {
        let (location, device) = fs.resolve_mirror(logical, block_len.0, mirror)?;
        device.count_io();
        let zeroed = target.map_or(true, |copy| copy == mirror);
        visit(&MirrorVisit {
            mirror,
            logical: logical.0,
            physical: location.physical,
            device: device.name().to_string(),
            zeroed,
        });

        if zeroed {
            // Fresh buffer per replica: read, zero, write back, flush.
            let mut block = vec![0_u8; len];
            device
                .device()
                .read_exact_at(location.physical, &mut block)?;
            block.fill(0);
            device.device().write_all_at(location.physical, &block)?;
            device.device().sync()?;
            info!(
                logical = logical.0,
                physical = location.physical,
                mirror,
                "zeroed mirror"
            );
            last = block;
        }

        // The map is authoritative, not the loop counter: ask again before
        // deciding whether another copy exists.
        let copies = fs.count_mirrors(logical)?;
        if copies == 1 {
            break;
        }
        mirror += 1;
        if mirror > copies {
            break;
        }
    }

    Ok(TreeBlockBuffer {
        logical,
        data: last,
    })
}

/// Zero `bytes` of data starting at `logical`, one sector-sized block at a
/// time across each block's mirrors.
///
/// A zero byte count is promoted to one sector, and the count is rounded up
/// to a whole number of sectors before the loop starts.
pub fn corrupt_byte_range(
    fs: &Filesystem,
    logical: LogicalAddr,
    bytes: ByteCount,
    target: Option<u32>,
    visit: &mut dyn FnMut(&MirrorVisit),
) -> Result<()> {
    let sectorsize = u64::from(fs.sectorsize());
    let requested = if bytes.0 == 0 {
        ByteCount(sectorsize)
    } else {
        bytes
    };
    let rounded = requested.align_up(sectorsize).ok_or_else(|| {
        WreckError::Usage(format!("byte count overflows when rounded: {requested}"))
    })?;
    if rounded != requested {
        warn!(
            requested = requested.0,
            rounded = rounded.0,
            "byte count rounded up to sector boundary"
        );
    }

    let mut at = logical;
    let mut remaining = rounded.0;
    while remaining > 0 {
        corrupt_mirrors(fs, at, ByteCount(sectorsize), target, visit)?;
        at = at.checked_add(sectorsize).ok_or(WreckError::MappingInvariant {
            logical: at.0,
            mirror: target.unwrap_or(1),
        })?;
        remaining -= sectorsize;
    }
    Ok(())
}
