//! Backward scan over extent tree metadata.
//!
//! Given an extent's starting address, walks the extent tree from the last
//! possible key for that address down toward offset zero, zeroing the
//! payload of every reference-carrying record it finds along the way. All
//! mutations are staged in one transaction and committed at the end, even
//! when the scan stops early on a search failure.

use serde::Serialize;
use tracing::{info, warn};
use wfs_error::Result;
use wfs_ondisk::Key;
use wfs_tree::step_back;
use wfs_types::{
    BTRFS_EXTENT_DATA_REF_KEY, BTRFS_EXTENT_ITEM_KEY, BTRFS_EXTENT_REF_V0_KEY,
    BTRFS_SHARED_BLOCK_REF_KEY, BTRFS_SHARED_DATA_REF_KEY, BTRFS_TREE_BLOCK_REF_KEY, LogicalAddr,
};

use crate::Filesystem;

/// The extent tree record kinds whose payloads the scan zeroes. Records of
/// any other kind under the same objectid are stepped over untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExtentRefKind {
    ExtentItem,
    TreeBlockRef,
    ExtentDataRef,
    ExtentRefV0,
    SharedBlockRef,
    SharedDataRef,
}

impl ExtentRefKind {
    /// Classify an item type, or `None` for types the scan leaves alone.
    #[must_use]
    pub fn from_item_type(item_type: u8) -> Option<Self> {
        match item_type {
            BTRFS_EXTENT_ITEM_KEY => Some(Self::ExtentItem),
            BTRFS_TREE_BLOCK_REF_KEY => Some(Self::TreeBlockRef),
            BTRFS_EXTENT_DATA_REF_KEY => Some(Self::ExtentDataRef),
            BTRFS_EXTENT_REF_V0_KEY => Some(Self::ExtentRefV0),
            BTRFS_SHARED_BLOCK_REF_KEY => Some(Self::SharedBlockRef),
            BTRFS_SHARED_DATA_REF_KEY => Some(Self::SharedDataRef),
            _ => None,
        }
    }
}

/// What a reference scan did: the keys whose payloads were zeroed, in the
/// order they were visited (descending), and whether the scan was cut short
/// by a failed search.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtentRefReport {
    pub records_zeroed: Vec<Key>,
    pub search_failed: bool,
}

/// Zero the payload of every reference record for the extent starting at
/// `bytenr`, inside one transaction.
///
/// The scan seeds at the last representable key for `bytenr` and repeatedly
/// searches nearest-below, so it visits records in descending key order. It
/// stops when it runs off the front of the tree, when the found record
/// belongs to a different extent, or when the scan key's offset exhausts.
/// A search failure ends the scan but does not discard staged work; the
/// transaction commits either way.
///
/// `visit` fires for each record as it is zeroed, before commit, so callers
/// keep a diagnostic trail even when a later step aborts the run.
pub fn corrupt_extent_refs(
    fs: &Filesystem,
    bytenr: LogicalAddr,
    visit: &mut dyn FnMut(&Key),
) -> Result<ExtentRefReport> {
    let mut tx = fs.begin_transaction();
    let mut report = ExtentRefReport::default();
    let mut key = Key::last_for_object(bytenr.0);

    loop {
        let cursor = match tx.search(fs.extent_root(), key) {
            Ok(cursor) => cursor,
            Err(err) if err.is_scan_recoverable() => {
                warn!(error = %err, "reference scan ended early");
                report.search_failed = true;
                break;
            }
            Err(err) => return Err(err),
        };

        let slot = if cursor.exact {
            cursor.slot
        } else if cursor.slot == 0 {
            // Nothing sorts below the scan key.
            break;
        } else {
            cursor.slot - 1
        };
        let Some(found) = cursor.key_at(slot) else {
            break;
        };

        // Continue from the key actually found, not the probe key.
        key = found;
        if key.objectid != bytenr.0 {
            break;
        }

        if ExtentRefKind::from_item_type(key.item_type).is_some() {
            visit(&key);
            tx.zero_item_payload(cursor.leaf_logical, slot)?;
            report.records_zeroed.push(key);
        }

        match step_back(key) {
            Some(next) => key = next,
            None => break,
        }
    }

    let zeroed = report.records_zeroed.len();
    tx.commit()?;
    info!(
        bytenr = bytenr.0,
        zeroed,
        ended_early = report.search_failed,
        "extent reference scan committed"
    );
    Ok(report)
}
