//! Block device abstraction.
//!
//! The storage core talks to media only through the synchronous
//! [`BlockDevice`] trait. Two implementations ship with the crate:
//! [`MemDevice`], a RAM-backed device with fault injection used by tests and
//! the exercise tool, and [`FileDevice`], which maps sectors onto a regular
//! file with positioned I/O.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::address::Addr;
use crate::error::{Hn4Error, Hn4Result};
use crate::profile::DeviceClass;

/// Pattern left behind by discard on devices that zero-fill with poison.
pub const POISON_WORD: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// Capabilities reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Logical sector size in bytes
    pub sector_size: u32,
    /// Device capacity in sectors
    pub total_sectors: Addr,
    /// Media class used to pick a tuning profile
    pub class: DeviceClass,
    /// Sequential-write-only media (ZNS, SMR)
    pub zoned: bool,
    /// Byte-addressable persistent memory
    pub persistent_memory: bool,
}

impl DeviceCaps {
    /// Capacity in bytes, if it fits in 64 bits.
    pub fn capacity_bytes(&self) -> Option<u64> {
        self.total_sectors
            .checked_mul_u64(u64::from(self.sector_size))
            .and_then(Addr::try_to_u64)
    }
}

/// I/O statistics of a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoStats {
    /// Completed sector reads (calls)
    pub reads: u64,
    /// Completed sector writes (calls)
    pub writes: u64,
    /// Flush barriers issued
    pub flushes: u64,
    /// Discard calls
    pub discards: u64,
    /// Bytes read
    pub bytes_read: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// Failed calls, injected or real
    pub errors: u64,
}

/// Synchronous sector-granular block device.
pub trait BlockDevice: Send + Sync {
    /// Device capabilities.
    fn caps(&self) -> DeviceCaps;

    /// Reads `buf.len()` bytes starting at sector `lba`.
    fn read_sectors(&self, lba: Addr, buf: &mut [u8]) -> Hn4Result<()>;

    /// Writes `buf` starting at sector `lba`.
    fn write_sectors(&self, lba: Addr, buf: &[u8]) -> Hn4Result<()>;

    /// Durability barrier: everything written before returns persisted.
    fn flush(&self) -> Hn4Result<()>;

    /// Hints that `count` sectors starting at `lba` are unused.
    fn discard(&self, lba: Addr, count: u64) -> Hn4Result<()>;

    /// Returns a snapshot of I/O statistics.
    fn stats(&self) -> IoStats;
}

/// Checks a request against sector alignment and capacity and returns the
/// byte range it covers.
fn byte_range(caps: &DeviceCaps, lba: Addr, len: usize) -> Hn4Result<(u64, u64)> {
    let sector = u64::from(caps.sector_size);
    if len as u64 % sector != 0 {
        return Err(Hn4Error::NotAligned {
            offset: len as u64,
            alignment: sector,
        });
    }
    let sectors = len as u64 / sector;
    let end = lba
        .checked_add_u64(sectors)
        .ok_or(Hn4Error::AddressOverflow { context: "device range" })?;
    if end > caps.total_sectors {
        return Err(Hn4Error::Geometry {
            reason: format!(
                "sectors {}..{} beyond capacity {}",
                lba, end, caps.total_sectors
            ),
        });
    }
    let start = lba
        .checked_mul_u64(sector)
        .ok_or(Hn4Error::AddressOverflow { context: "device offset" })?
        .to_u64("device offset")?;
    Ok((start, len as u64))
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_writes: u32,
    lost_write_acks: u32,
    failing_read_sectors: HashSet<u64>,
}

/// RAM-backed block device with fault injection.
pub struct MemDevice {
    caps: DeviceCaps,
    data: RwLock<Vec<u8>>,
    faults: Mutex<FaultPlan>,
    stats: Mutex<IoStats>,
}

impl MemDevice {
    /// Creates a zeroed device of `total_sectors` sectors.
    pub fn new(sector_size: u32, total_sectors: u64, class: DeviceClass) -> Hn4Result<Self> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(Hn4Error::Geometry {
                reason: format!("sector size {} is not a power of two", sector_size),
            });
        }
        let bytes = total_sectors
            .checked_mul(u64::from(sector_size))
            .and_then(|b| usize::try_from(b).ok())
            .ok_or(Hn4Error::AddressOverflow { context: "mem device size" })?;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| Hn4Error::OutOfMemory { bytes })?;
        data.resize(bytes, 0);

        info!(sector_size, total_sectors, ?class, "created memory device");
        Ok(Self {
            caps: DeviceCaps {
                sector_size,
                total_sectors: Addr::from_u64(total_sectors),
                class,
                zoned: class == DeviceClass::Zns,
                persistent_memory: class == DeviceClass::Pmem,
            },
            data: RwLock::new(data),
            faults: Mutex::new(FaultPlan::default()),
            stats: Mutex::new(IoStats::default()),
        })
    }

    /// Creates a device of `bytes` capacity with 4 KiB sectors.
    pub fn with_capacity(bytes: u64, class: DeviceClass) -> Hn4Result<Self> {
        Self::new(4096, bytes / 4096, class)
    }

    /// Overrides the zoned and persistent-memory flags.
    pub fn with_flags(mut self, zoned: bool, persistent_memory: bool) -> Self {
        self.caps.zoned = zoned;
        self.caps.persistent_memory = persistent_memory;
        self
    }

    fn update_stats<F>(&self, f: F)
    where
        F: FnOnce(&mut IoStats),
    {
        f(&mut self.stats.lock());
    }

    /// Makes the next `count` writes fail without touching media.
    pub fn fail_next_writes(&self, count: u32) {
        self.faults.lock().fail_writes = count;
    }

    /// Makes the next `count` writes land on media but report failure.
    pub fn lose_next_write_acks(&self, count: u32) {
        self.faults.lock().lost_write_acks = count;
    }

    /// Makes every read touching `sector` fail.
    pub fn fail_reads_at(&self, sector: u64) {
        self.faults.lock().failing_read_sectors.insert(sector);
    }

    /// Clears every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = FaultPlan::default();
    }

    /// Flips one bit at a raw byte offset.
    pub fn flip_bit(&self, byte_offset: u64, bit: u8) {
        let mut data = self.data.write();
        if let Some(b) = data.get_mut(byte_offset as usize) {
            *b ^= 1 << (bit & 7);
        }
    }

    /// Copies raw bytes out of the device, bypassing stats and faults.
    pub fn peek(&self, byte_offset: u64, len: usize) -> Vec<u8> {
        let data = self.data.read();
        let start = (byte_offset as usize).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        data[start..end].to_vec()
    }

    /// Overwrites raw bytes, bypassing stats and faults.
    pub fn poke(&self, byte_offset: u64, bytes: &[u8]) {
        let mut data = self.data.write();
        let start = (byte_offset as usize).min(data.len());
        let end = start.saturating_add(bytes.len()).min(data.len());
        data[start..end].copy_from_slice(&bytes[..end - start]);
    }
}

impl BlockDevice for MemDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn read_sectors(&self, lba: Addr, buf: &mut [u8]) -> Hn4Result<()> {
        let (start, len) = byte_range(&self.caps, lba, buf.len())?;
        {
            let faults = self.faults.lock();
            if !faults.failing_read_sectors.is_empty() {
                let first = start / u64::from(self.caps.sector_size);
                let count = len / u64::from(self.caps.sector_size);
                if (first..first + count).any(|s| faults.failing_read_sectors.contains(&s)) {
                    drop(faults);
                    self.update_stats(|s| s.errors += 1);
                    return Err(Hn4Error::DeviceError {
                        reason: format!("injected read failure at sector {}", lba),
                    });
                }
            }
        }
        let data = self.data.read();
        buf.copy_from_slice(&data[start as usize..(start + len) as usize]);
        drop(data);
        self.update_stats(|s| {
            s.reads += 1;
            s.bytes_read += len;
        });
        Ok(())
    }

    fn write_sectors(&self, lba: Addr, buf: &[u8]) -> Hn4Result<()> {
        let (start, len) = byte_range(&self.caps, lba, buf.len())?;
        let lose_ack = {
            let mut faults = self.faults.lock();
            if faults.fail_writes > 0 {
                faults.fail_writes -= 1;
                drop(faults);
                self.update_stats(|s| s.errors += 1);
                debug!(sector = %lba, "injected write failure");
                return Err(Hn4Error::DeviceError {
                    reason: format!("injected write failure at sector {}", lba),
                });
            }
            if faults.lost_write_acks > 0 {
                faults.lost_write_acks -= 1;
                true
            } else {
                false
            }
        };
        let mut data = self.data.write();
        data[start as usize..(start + len) as usize].copy_from_slice(buf);
        drop(data);
        if lose_ack {
            self.update_stats(|s| s.errors += 1);
            return Err(Hn4Error::DeviceError {
                reason: format!("write completion lost at sector {}", lba),
            });
        }
        self.update_stats(|s| {
            s.writes += 1;
            s.bytes_written += len;
        });
        Ok(())
    }

    fn flush(&self) -> Hn4Result<()> {
        self.update_stats(|s| s.flushes += 1);
        Ok(())
    }

    fn discard(&self, lba: Addr, count: u64) -> Hn4Result<()> {
        let bytes = count
            .checked_mul(u64::from(self.caps.sector_size))
            .and_then(|b| usize::try_from(b).ok())
            .ok_or(Hn4Error::AddressOverflow { context: "discard length" })?;
        let (start, len) = byte_range(&self.caps, lba, bytes)?;
        let mut data = self.data.write();
        for chunk in data[start as usize..(start + len) as usize].chunks_mut(8) {
            let poison = POISON_WORD.to_le_bytes();
            chunk.copy_from_slice(&poison[..chunk.len()]);
        }
        drop(data);
        self.update_stats(|s| s.discards += 1);
        Ok(())
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}

/// Block device backed by a regular file.
pub struct FileDevice {
    file: File,
    caps: DeviceCaps,
    stats: Mutex<IoStats>,
}

impl FileDevice {
    /// Creates (or truncates) an image file of `total_sectors` sectors.
    pub fn create(
        path: impl AsRef<Path>,
        sector_size: u32,
        total_sectors: u64,
        class: DeviceClass,
    ) -> Hn4Result<Self> {
        let len = total_sectors
            .checked_mul(u64::from(sector_size))
            .ok_or(Hn4Error::AddressOverflow { context: "image size" })?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        info!(path = %path.as_ref().display(), bytes = len, "created image file");
        Ok(Self {
            file,
            caps: DeviceCaps {
                sector_size,
                total_sectors: Addr::from_u64(total_sectors),
                class,
                zoned: false,
                persistent_memory: false,
            },
            stats: Mutex::new(IoStats::default()),
        })
    }

    /// Opens an existing image file; capacity is taken from the file length.
    pub fn open(path: impl AsRef<Path>, sector_size: u32, class: DeviceClass) -> Hn4Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            caps: DeviceCaps {
                sector_size,
                total_sectors: Addr::from_u64(len / u64::from(sector_size)),
                class,
                zoned: false,
                persistent_memory: false,
            },
            stats: Mutex::new(IoStats::default()),
        })
    }
}

impl BlockDevice for FileDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn read_sectors(&self, lba: Addr, buf: &mut [u8]) -> Hn4Result<()> {
        let (start, len) = byte_range(&self.caps, lba, buf.len())?;
        if let Err(e) = self.file.read_exact_at(buf, start) {
            self.stats.lock().errors += 1;
            return Err(e.into());
        }
        let mut stats = self.stats.lock();
        stats.reads += 1;
        stats.bytes_read += len;
        Ok(())
    }

    fn write_sectors(&self, lba: Addr, buf: &[u8]) -> Hn4Result<()> {
        let (start, len) = byte_range(&self.caps, lba, buf.len())?;
        if let Err(e) = self.file.write_all_at(buf, start) {
            self.stats.lock().errors += 1;
            return Err(e.into());
        }
        let mut stats = self.stats.lock();
        stats.writes += 1;
        stats.bytes_written += len;
        Ok(())
    }

    fn flush(&self) -> Hn4Result<()> {
        self.file.sync_data()?;
        self.stats.lock().flushes += 1;
        Ok(())
    }

    fn discard(&self, _lba: Addr, _count: u64) -> Hn4Result<()> {
        self.stats.lock().discards += 1;
        Ok(())
    }

    fn stats(&self) -> IoStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> MemDevice {
        MemDevice::new(512, 64, DeviceClass::Ssd).unwrap()
    }

    #[test]
    fn test_mem_write_read_roundtrip() {
        let d = dev();
        let data = vec![0xAB; 1024];
        d.write_sectors(Addr::from_u64(3), &data).unwrap();
        let mut out = vec![0u8; 1024];
        d.read_sectors(Addr::from_u64(3), &mut out).unwrap();
        assert_eq!(out, data);
        let stats = d.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_read, 1024);
    }

    #[test]
    fn test_caps_capacity_bytes() {
        let caps = dev().caps();
        assert_eq!(caps.capacity_bytes(), Some(512 * 64));
        assert!(!caps.zoned);
    }

    #[test]
    fn test_unaligned_length_rejected() {
        let d = dev();
        let err = d.write_sectors(Addr::ZERO, &[0u8; 100]).unwrap_err();
        assert!(matches!(err, Hn4Error::NotAligned { alignment: 512, .. }));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let d = dev();
        let mut buf = vec![0u8; 1024];
        let err = d.read_sectors(Addr::from_u64(63), &mut buf).unwrap_err();
        assert!(matches!(err, Hn4Error::Geometry { .. }));
    }

    #[test]
    fn test_injected_write_failure() {
        let d = dev();
        d.fail_next_writes(1);
        assert!(d.write_sectors(Addr::ZERO, &[1u8; 512]).is_err());
        assert_eq!(d.peek(0, 4), vec![0; 4]);
        d.write_sectors(Addr::ZERO, &[1u8; 512]).unwrap();
        assert_eq!(d.stats().errors, 1);
    }

    #[test]
    fn test_lost_ack_still_lands() {
        let d = dev();
        d.lose_next_write_acks(1);
        assert!(d.write_sectors(Addr::from_u64(1), &[7u8; 512]).is_err());
        assert_eq!(d.peek(512, 2), vec![7, 7]);
    }

    #[test]
    fn test_injected_read_failure() {
        let d = dev();
        d.fail_reads_at(5);
        let mut buf = vec![0u8; 1024];
        assert!(d.read_sectors(Addr::from_u64(4), &mut buf).is_err());
        d.clear_faults();
        d.read_sectors(Addr::from_u64(4), &mut buf).unwrap();
    }

    #[test]
    fn test_discard_writes_poison() {
        let d = dev();
        d.discard(Addr::from_u64(2), 1).unwrap();
        let raw = d.peek(1024, 8);
        assert_eq!(raw, POISON_WORD.to_le_bytes().to_vec());
    }

    #[test]
    fn test_flip_bit() {
        let d = dev();
        d.flip_bit(10, 3);
        assert_eq!(d.peek(10, 1), vec![8]);
    }

    #[test]
    fn test_file_device_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hn4.img");
        {
            let f = FileDevice::create(&path, 512, 32, DeviceClass::Ssd).unwrap();
            f.write_sectors(Addr::from_u64(4), &[0x5Au8; 512]).unwrap();
            f.flush().unwrap();
        }
        let f = FileDevice::open(&path, 512, DeviceClass::Ssd).unwrap();
        assert_eq!(f.caps().total_sectors, Addr::from_u64(32));
        let mut buf = vec![0u8; 512];
        f.read_sectors(Addr::from_u64(4), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x5A));
    }
}
