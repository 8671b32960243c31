#![forbid(unsafe_code)]
//! Error types for WreckFS.
//!
//! One user-facing enum, `WreckError`, covering the whole runtime taxonomy:
//!
//! | Variant | Meaning | Recovery |
//! |---------|---------|----------|
//! | `Usage` | malformed CLI input | print usage, exit 1, nothing mutated |
//! | `Open` | image cannot be opened or its metadata bootstrap fails | exit 1 |
//! | `Io` | a physical read/write/flush failed | run aborts, no retry |
//! | `MappingInvariant` | the chunk map cannot resolve a mirror the image claims to have | run aborts |
//! | `Parse` | on-disk bytes violated the format mid-run | run aborts |
//! | `Search` | tree search failed during a metadata scan | scan ends early, staged work still commits |
//! | `Commit` | transaction commit failed | run aborts |
//! | `Close` | final flush/close failed | run aborts |
//!
//! This crate deliberately depends on nothing else in the workspace so it can
//! be consumed from any layer. `wfs-types::ParseError` is converted into
//! `WreckError::Parse` at the `wfs-core` boundary via its `Display` output.

use thiserror::Error;

/// Unified error type for all WreckFS operations.
#[derive(Debug, Error)]
pub enum WreckError {
    /// Malformed or missing command-line input.
    #[error("usage error: {0}")]
    Usage(String),

    /// The filesystem image could not be opened or bootstrapped.
    #[error("open failed: {0}")]
    Open(String),

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The mapping layer cannot resolve a mirror for an address the
    /// filesystem claims is valid. Indicates corruption beyond the tool's
    /// assumptions; never retried.
    #[error("mapping invariant violated: no mirror {mirror} for logical {logical}")]
    MappingInvariant { logical: u64, mirror: u32 },

    /// On-disk bytes violated the format while the run was underway.
    #[error("parse error: {0}")]
    Parse(String),

    /// Tree search failed during a metadata scan. The scan stops; the
    /// transaction still commits whatever was already staged.
    #[error("tree search failed: {0}")]
    Search(String),

    /// Transaction commit failed.
    #[error("commit failed: {0}")]
    Commit(String),

    /// Final flush/close of the filesystem handle failed.
    #[error("close failed: {0}")]
    Close(String),
}

impl WreckError {
    /// Whether a metadata scan may swallow this error and fall through to
    /// commit. Only search failures are locally recoverable; everything else
    /// aborts the run.
    #[must_use]
    pub fn is_scan_recoverable(&self) -> bool {
        matches!(self, Self::Search(_))
    }
}

/// Result alias using `WreckError`.
pub type Result<T> = std::result::Result<T, WreckError>;
