#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use wfs_core::{Filesystem, MirrorVisit, corrupt_byte_range, corrupt_extent_refs};
use wfs_error::WreckError;
use wfs_types::{ByteCount, LogicalAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Options {
    image: PathBuf,
    logical: u64,
    /// `None` corrupts every copy; `Some(n)` only mirror `n`.
    copy: Option<u32>,
    /// `None` defaults to one sectorsize inside the engine.
    bytes: Option<u64>,
    extent_rec: bool,
    json: bool,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        if error
            .downcast_ref::<WreckError>()
            .is_some_and(|err| matches!(err, WreckError::Usage(_)))
        {
            print_usage();
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_usage();
        return Ok(());
    }

    let opts = parse_args(&args)?;
    let fs = Filesystem::open(&opts.image)
        .with_context(|| format!("failed to open image: {}", opts.image.display()))?;

    if opts.extent_rec {
        let json = opts.json;
        // Emitted as each record is zeroed so the trail survives a run that
        // aborts before the scan finishes.
        let mut emit = |key: &wfs_core::Key| {
            if json {
                if let Ok(line) = serde_json::to_string(key) {
                    println!("{line}");
                }
            } else {
                eprintln!(
                    "corrupting extent record: key {} {} {}",
                    key.objectid, key.item_type, key.offset
                );
            }
        };
        let report = corrupt_extent_refs(&fs, LogicalAddr(opts.logical), &mut emit)
            .context("extent record corruption failed")?;
        if report.search_failed {
            eprintln!("extent record scan ended early; staged corruption was committed");
        }
    } else {
        let json = opts.json;
        let mut emit = |visit: &MirrorVisit| {
            if json {
                if let Ok(line) = serde_json::to_string(visit) {
                    println!("{line}");
                }
            } else {
                println!(
                    "mirror {} logical {} physical {} device {}",
                    visit.mirror, visit.logical, visit.physical, visit.device
                );
                if visit.zeroed {
                    println!("corrupting {} copy {}", visit.logical, visit.mirror);
                }
            }
        };
        corrupt_byte_range(
            &fs,
            LogicalAddr(opts.logical),
            ByteCount(opts.bytes.unwrap_or(0)),
            opts.copy,
            &mut emit,
        )
        .context("block corruption failed")?;
    }

    fs.close().context("close failed")?;
    Ok(())
}

fn print_usage() {
    eprintln!("usage: wfs-corrupt [options] <image>");
    eprintln!("\t-l <logical>  logical extent to corrupt (required)");
    eprintln!("\t-c <copy>     mirror number to corrupt (absent: all copies)");
    eprintln!("\t-b <bytes>    byte count, rounded up to a sectorsize multiple");
    eprintln!("\t-e            corrupt the extent reference records instead");
    eprintln!("\t--json        emit diagnostics as JSON lines");
}

fn usage_error(message: impl Into<String>) -> WreckError {
    WreckError::Usage(message.into())
}

/// Accepts decimal or `0x`-prefixed hex, the way disk addresses are usually
/// quoted.
fn parse_u64(value: &str, what: &str) -> Result<u64, WreckError> {
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|_| usage_error(format!("invalid {what}: {value}")))
}

fn parse_args(args: &[String]) -> Result<Options, WreckError> {
    let mut logical = None;
    let mut copy = None;
    let mut bytes = None;
    let mut extent_rec = false;
    let mut json = false;
    let mut image = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-l" => {
                let value = iter.next().ok_or_else(|| usage_error("-l requires a value"))?;
                let value = parse_u64(value, "extent number")?;
                if value == 0 {
                    return Err(usage_error("invalid extent number"));
                }
                logical = Some(value);
            }
            "-c" => {
                let value = iter.next().ok_or_else(|| usage_error("-c requires a value"))?;
                if value.starts_with('-') {
                    return Err(usage_error("invalid copy number"));
                }
                let value: u32 = value
                    .parse()
                    .map_err(|_| usage_error(format!("invalid copy number: {value}")))?;
                if value == 0 {
                    return Err(usage_error("invalid copy number"));
                }
                copy = Some(value);
            }
            "-b" => {
                let value = iter.next().ok_or_else(|| usage_error("-b requires a value"))?;
                let value = parse_u64(value, "byte count")?;
                if value == 0 {
                    return Err(usage_error("invalid byte count"));
                }
                bytes = Some(value);
            }
            "-e" => extent_rec = true,
            "--json" => json = true,
            other if other.starts_with('-') => {
                return Err(usage_error(format!("unknown option: {other}")));
            }
            other => {
                if image.is_some() {
                    return Err(usage_error(format!("unexpected argument: {other}")));
                }
                image = Some(PathBuf::from(other));
            }
        }
    }

    let image = image.ok_or_else(|| usage_error("missing image path"))?;
    let logical = logical.ok_or_else(|| usage_error("invalid extent number"))?;

    Ok(Options {
        image,
        logical,
        copy,
        bytes,
        extent_rec,
        json,
    })
}
