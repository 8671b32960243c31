#![forbid(unsafe_code)]
//! Byte-addressed device I/O.
//!
//! Provides the `ByteDevice` trait (pread/pwrite semantics with strict
//! bounds checks), a file-backed implementation, and the `DeviceTable` that
//! resolves on-disk devids to open devices. Each table entry carries a
//! display name and a total-I/O counter; the counter is an observability
//! signal only.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use wfs_error::{Result, WreckError};
use wfs_types::DevId;

fn bounds_error(op: &str, offset: u64, len: usize, device_len: u64) -> WreckError {
    WreckError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("{op} out of bounds: offset={offset} len={len} device_len={device_len}"),
    ))
}

/// Byte-addressed device with positional I/O.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Force pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style positional I/O.
///
/// Opens read-write when possible, read-only otherwise; writes against a
/// read-only device fail rather than silently succeeding.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn check_range(&self, op: &str, offset: u64, len: usize) -> Result<()> {
        let len_u64 =
            u64::try_from(len).map_err(|_| bounds_error(op, offset, len, self.len))?;
        let end = offset
            .checked_add(len_u64)
            .ok_or_else(|| bounds_error(op, offset, len, self.len))?;
        if end > self.len {
            return Err(bounds_error(op, offset, len, self.len));
        }
        Ok(())
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range("read", offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(WreckError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        self.check_range("write", offset, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// An open device plus its bookkeeping: display name and I/O counter.
pub struct Device {
    name: String,
    inner: Arc<dyn ByteDevice>,
    total_ios: Mutex<u64>,
}

impl Device {
    pub fn new(name: impl Into<String>, inner: Arc<dyn ByteDevice>) -> Self {
        Self {
            name: name.into(),
            inner,
            total_ios: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.inner
    }

    /// Record one I/O against this device and return the new total.
    pub fn count_io(&self) -> u64 {
        let mut ios = self.total_ios.lock();
        *ios += 1;
        *ios
    }

    #[must_use]
    pub fn total_ios(&self) -> u64 {
        *self.total_ios.lock()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("len_bytes", &self.inner.len_bytes())
            .field("total_ios", &self.total_ios())
            .finish()
    }
}

/// Resolves on-disk devids to open devices.
#[derive(Debug, Default)]
pub struct DeviceTable {
    entries: Vec<(DevId, Arc<Device>)>,
}

impl DeviceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` under `devid`. Re-registering a devid replaces the
    /// earlier entry.
    pub fn register(&mut self, devid: DevId, device: Arc<Device>) {
        if let Some(slot) = self.entries.iter_mut().find(|(id, _)| *id == devid) {
            slot.1 = device;
        } else {
            self.entries.push((devid, device));
        }
    }

    #[must_use]
    pub fn get(&self, devid: DevId) -> Option<&Arc<Device>> {
        self.entries
            .iter()
            .find(|(id, _)| *id == devid)
            .map(|(_, dev)| dev)
    }

    /// Flush every registered device once, even when several devids share
    /// one underlying device.
    pub fn flush_all(&self) -> Result<()> {
        let mut flushed: Vec<*const Device> = Vec::new();
        for (_, device) in &self.entries {
            let ptr: *const Device = Arc::as_ptr(device);
            if flushed.contains(&ptr) {
                continue;
            }
            device.device().sync()?;
            flushed.push(ptr);
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (DevId, &Arc<Device>)> {
        self.entries.iter().map(|(id, dev)| (*id, dev))
    }
}
