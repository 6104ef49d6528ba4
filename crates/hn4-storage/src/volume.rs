//! Volume: the entry point of the storage core.
//!
//! A volume owns the device, the allocator, the anchor table and the device
//! context. [`Volume::format`] lays out a fresh volume in memory:
//!
//! ```text
//! [0 reserved] [bitmap] [quality] [flux: ballistic data ...] [horizon ring]
//! ```
//!
//! Block-level writes and reads live in [`crate::write`] and [`crate::read`];
//! this module adds the byte-range API on top of them.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::address::Addr;
use crate::allocator::Allocator;
use crate::anchor::{Anchor, AnchorFlags, AnchorId, AnchorTable, Permissions, Priority};
use crate::bitmap::{Bitmap, BitmapMode, RmwStore};
use crate::block::{alloc_buffer, payload_capacity};
use crate::cell::ARMORED_WORD_BYTES;
use crate::config::VolumeConfig;
use crate::device::{BlockDevice, IoStats};
use crate::error::{Hn4Error, Hn4Result};
use crate::horizon::Horizon;
use crate::profile::{DeviceClass, DeviceContext};
use crate::read::ReadStatus;
use crate::trajectory::{self, Candidate, Geometry, TrajectoryParams, ORBIT_MASK};

/// Region boundaries of a formatted volume, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Block size in bytes
    pub block_size: u32,
    /// Device sectors per block
    pub sectors_per_block: u64,
    /// Blocks on the volume
    pub total_blocks: u64,
    /// First bitmap block
    pub bitmap_start: u64,
    /// Bitmap blocks
    pub bitmap_blocks: u64,
    /// First quality-map block
    pub quality_start: u64,
    /// Quality-map blocks
    pub quality_blocks: u64,
    /// First flux block
    pub flux_start: u64,
    /// Flux blocks
    pub flux_blocks: u64,
    /// First horizon block
    pub horizon_start: u64,
    /// Horizon blocks
    pub horizon_blocks: u64,
}

impl Layout {
    /// Computes the layout for a device of `total_blocks` blocks.
    pub fn compute(block_size: u32, sectors_per_block: u64, total_blocks: u64, horizon_pct: u8) -> Hn4Result<Self> {
        let bs = u64::from(block_size);
        let bitmap_bytes = total_blocks.div_ceil(64) * ARMORED_WORD_BYTES as u64;
        let bitmap_blocks = bitmap_bytes.div_ceil(bs);
        let quality_blocks = total_blocks.div_ceil(4).div_ceil(bs);
        let horizon_blocks = total_blocks * u64::from(horizon_pct) / 100;
        let flux_start = 1 + bitmap_blocks + quality_blocks;
        let reserved = flux_start + horizon_blocks;
        if horizon_blocks == 0 || reserved >= total_blocks {
            return Err(Hn4Error::Geometry {
                reason: format!(
                    "{} blocks cannot hold metadata ({}) and horizon ({})",
                    total_blocks, flux_start, horizon_blocks
                ),
            });
        }
        let flux_blocks = total_blocks - reserved;
        Ok(Self {
            block_size,
            sectors_per_block,
            total_blocks,
            bitmap_start: 1,
            bitmap_blocks,
            quality_start: 1 + bitmap_blocks,
            quality_blocks,
            flux_start,
            flux_blocks,
            horizon_start: flux_start + flux_blocks,
            horizon_blocks,
        })
    }

    /// Flux window for the trajectory engine.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            flux_start: self.flux_start,
            flux_blocks: self.flux_blocks,
        }
    }
}

/// Options for a new anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnchorOptions {
    /// Extra classification flags (VALID is always set)
    pub flags: AnchorFlags,
    /// Access permissions
    pub permissions: Permissions,
    /// Placement priority
    pub priority: Priority,
    /// Fractal scale; the configured default when unset
    pub fractal_scale: Option<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) writes: AtomicU64,
    pub(crate) reads: AtomicU64,
    pub(crate) sparse_reads: AtomicU64,
    pub(crate) commit_retries: AtomicU64,
    pub(crate) rescues: AtomicU64,
    pub(crate) heals_attempted: AtomicU64,
    pub(crate) heals_succeeded: AtomicU64,
    pub(crate) writes_in_flight: AtomicU64,
}

/// Statistics snapshot of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStats {
    /// Volume identity
    pub volume_id: Uuid,
    /// Effective device class
    pub device_class: DeviceClass,
    /// Blocks on the volume
    pub total_blocks: u64,
    /// Allocated blocks, metadata included
    pub used_blocks: u64,
    /// Flux blocks
    pub flux_blocks: u64,
    /// Horizon blocks
    pub horizon_blocks: u64,
    /// Allocated horizon slots
    pub horizon_used: u64,
    /// Whether saturation mode is active
    pub saturated: bool,
    /// Bitmap words healed after a single-bit error
    pub bitmap_heals: u64,
    /// Uncorrectable bitmap words rebuilt by force-clear
    pub bitmap_forced_repairs: u64,
    /// Straggler rewrites attempted by reads
    pub heals_attempted: u64,
    /// Straggler rewrites that succeeded
    pub heals_succeeded: u64,
    /// Blocks leaked on append-only media
    pub leaked_blocks: u64,
    /// Write protocol restarts after a lost commit race
    pub commit_retries: u64,
    /// Failed writes accepted after read-back
    pub rescues: u64,
    /// Committed block writes
    pub writes: u64,
    /// Block reads
    pub reads: u64,
    /// Block reads that found no data
    pub sparse_reads: u64,
    /// Rolling read health, 0..=100
    pub health: u32,
    /// Anchors in the table
    pub anchors: usize,
    /// Milliseconds since format
    pub uptime_ms: u64,
    /// Device I/O statistics
    pub io: IoStats,
}

/// A formatted HN4 volume.
pub struct Volume {
    pub(crate) id: Uuid,
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) ctx: DeviceContext,
    pub(crate) config: VolumeConfig,
    pub(crate) layout: Layout,
    pub(crate) allocator: Allocator,
    pub(crate) anchors: AnchorTable,
    pub(crate) read_only: AtomicBool,
    pub(crate) health: AtomicU32,
    pub(crate) counters: Counters,
    #[cfg(test)]
    pub(crate) crash_at: parking_lot::Mutex<Option<crate::write::CrashPoint>>,
}

impl Volume {
    /// Lays out a fresh volume on `device`.
    pub fn format(device: Arc<dyn BlockDevice>, config: VolumeConfig) -> Hn4Result<Self> {
        config.validate()?;
        let caps = device.caps();
        let bs = u64::from(config.block_size);
        let sector = u64::from(caps.sector_size);
        if sector == 0 || bs < sector || bs % sector != 0 {
            return Err(Hn4Error::Geometry {
                reason: format!("block size {} is not a multiple of sector size {}", bs, sector),
            });
        }
        let sectors_per_block = bs / sector;
        let total_blocks = caps
            .total_sectors
            .div_u64(sectors_per_block)
            .to_u64("volume block count")?;
        let layout = Layout::compute(config.block_size, sectors_per_block, total_blocks, config.horizon_pct)?;

        let words = Bitmap::words_for(total_blocks);
        let bitmap = match config.bitmap_mode {
            BitmapMode::Cas => Bitmap::new(total_blocks),
            BitmapMode::SectorRmw => {
                let region = Addr::from_u64(layout.bitmap_start)
                    .checked_mul_u64(sectors_per_block)
                    .ok_or(Hn4Error::AddressOverflow { context: "bitmap region" })?;
                let store = RmwStore::format(Arc::clone(&device), region, words)?;
                Bitmap::with_store(Box::new(store), total_blocks)
            }
        };
        for block in 0..layout.flux_start {
            bitmap.set(block)?;
        }

        let ctx = DeviceContext::new(caps, config.device_class, config.system_profile, config.rng_seed);
        let allocator = Allocator::new(
            bitmap,
            layout.geometry(),
            Horizon::new(layout.horizon_start, layout.horizon_blocks, config.horizon_probe_limit),
            config.saturation(),
            caps.zoned,
        );

        let id = Uuid::new_v4();
        info!(
            volume = %id,
            class = ?ctx.class(),
            total_blocks,
            flux_start = layout.flux_start,
            flux_blocks = layout.flux_blocks,
            horizon_blocks = layout.horizon_blocks,
            "formatted volume"
        );

        Ok(Self {
            id,
            device,
            ctx,
            config,
            layout,
            allocator,
            anchors: AnchorTable::new(),
            read_only: AtomicBool::new(false),
            health: AtomicU32::new(100),
            counters: Counters::default(),
            #[cfg(test)]
            crash_at: parking_lot::Mutex::new(None),
        })
    }

    /// Volume identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Region layout.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Configuration the volume was formatted with.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Device context.
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Allocator (bitmap, quality map, horizon).
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Usable payload bytes per block.
    pub fn payload_capacity(&self) -> usize {
        payload_capacity(self.config.block_size as usize)
    }

    /// Returns whether writes are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Switches the volume between read-write and read-only.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
        info!(read_only, "volume mode changed");
    }

    /// Creates an object with default options. A random identity is drawn
    /// when `id` is `None`.
    pub fn create_anchor(&self, id: Option<AnchorId>) -> Hn4Result<AnchorId> {
        self.create_anchor_with(id, AnchorOptions::default())
    }

    /// Creates an object: picks a gravity center and orbit vector and
    /// inserts the descriptor at generation 1.
    pub fn create_anchor_with(&self, id: Option<AnchorId>, opts: AnchorOptions) -> Hn4Result<AnchorId> {
        if self.is_read_only() {
            return Err(Hn4Error::ReadOnly);
        }
        let id = id.unwrap_or_else(|| Uuid::new_v4().as_u128());
        let m = opts.fractal_scale.unwrap_or(self.config.default_fractal_scale);
        let horizon_only = self.ctx.profile().horizon_only;
        // Saturated volumes place in the horizon, so no gravity center is needed.
        let gravity = if horizon_only || self.allocator.is_saturated() {
            0
        } else {
            self.allocator.alloc_genesis(m, &self.ctx)?
        };
        let orbit = (self.ctx.random_u64() & ORBIT_MASK) | 1;

        let mut anchor = Anchor::new(id, gravity, orbit, m);
        anchor.flags.insert(opts.flags);
        if horizon_only {
            anchor.flags.insert(AnchorFlags::LINEAR);
        }
        anchor.permissions = opts.permissions;
        anchor.priority = opts.priority;
        self.anchors.insert(anchor)?;
        debug!(id = %format!("{:#x}", id), gravity, m, "created anchor");
        Ok(id)
    }

    /// Inserts a descriptor built elsewhere.
    pub fn insert_anchor(&self, anchor: Anchor) -> Hn4Result<()> {
        self.anchors.insert(anchor)
    }

    /// Snapshot of a descriptor.
    pub fn anchor(&self, id: AnchorId) -> Hn4Result<Anchor> {
        self.anchors.snapshot(id)
    }

    /// Applies `f` to a descriptor under its lock.
    pub fn update_anchor<F>(&self, id: AnchorId, f: F) -> Hn4Result<()>
    where
        F: FnOnce(&mut Anchor),
    {
        let handle = self.anchors.get(id)?;
        f(&mut handle.lock());
        Ok(())
    }

    /// Tombstones an object. Its blocks stay allocated until reclaimed.
    pub fn delete(&self, id: AnchorId) -> Hn4Result<()> {
        if self.is_read_only() {
            return Err(Hn4Error::ReadOnly);
        }
        let handle = self.anchors.get(id)?;
        let mut anchor = handle.lock();
        if anchor.permissions.immutable {
            return Err(Hn4Error::Immutable { id });
        }
        if !anchor.permissions.write {
            return Err(Hn4Error::AccessDenied { id });
        }
        anchor.flags.insert(AnchorFlags::TOMBSTONE);
        anchor.flags.remove(AnchorFlags::VALID);
        info!(id = %format!("{:#x}", id), "object tombstoned");
        Ok(())
    }

    /// Trajectory parameters of this volume's profile.
    pub fn trajectory_params(&self) -> TrajectoryParams {
        TrajectoryParams::from(self.ctx.profile())
    }

    /// Physical block of `index` at collision index `k` for a descriptor.
    pub fn locate(&self, anchor: &Anchor, index: u64, k: u8) -> u64 {
        trajectory::locate(
            &self.layout.geometry(),
            anchor.gravity_center,
            anchor.orbit_vector,
            index,
            anchor.fractal_scale,
            k,
            &self.trajectory_params(),
        )
    }

    /// Candidates `k = 0..=depth` for `index`, first occurrence of each block only.
    pub(crate) fn trajectory(&self, anchor: &Anchor, index: u64, depth: u8) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = Vec::with_capacity(usize::from(depth) + 1);
        for c in trajectory::candidates(
            &self.layout.geometry(),
            anchor.gravity_center,
            anchor.orbit_vector,
            index,
            anchor.fractal_scale,
            depth,
            &self.trajectory_params(),
        ) {
            if !out.iter().any(|seen| seen.lba == c.lba) {
                out.push(c);
            }
        }
        out
    }

    fn sector_of(&self, lba: u64) -> Hn4Result<Addr> {
        Addr::from_u64(lba)
            .checked_mul_u64(self.layout.sectors_per_block)
            .ok_or(Hn4Error::AddressOverflow { context: "block to sector" })
    }

    pub(crate) fn read_image(&self, lba: u64) -> Hn4Result<Vec<u8>> {
        let mut buf = alloc_buffer(self.config.block_size as usize)?;
        self.device.read_sectors(self.sector_of(lba)?, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn write_image(&self, lba: u64, image: &[u8]) -> Hn4Result<()> {
        self.device.write_sectors(self.sector_of(lba)?, image)
    }

    /// Writes `data` at byte `offset` of an object. Partial blocks are
    /// read, merged and rewritten. Returns the number of blocks written.
    pub fn write_bytes(&self, id: AnchorId, offset: u64, data: &[u8]) -> Hn4Result<u64> {
        if data.is_empty() {
            return Ok(0);
        }
        let cap = self.payload_capacity() as u64;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Hn4Error::AddressOverflow { context: "write range" })?;
        let first = offset / cap;
        let last = (end - 1) / cap;

        for index in first..=last {
            let block_start = index * cap;
            let lo = offset.max(block_start) - block_start;
            let hi = end.min(block_start + cap) - block_start;
            let src_from = (block_start + lo - offset) as usize;
            let src = &data[src_from..src_from + (hi - lo) as usize];

            if lo == 0 && hi == cap {
                self.write_block(id, index, src)?;
                continue;
            }
            let existing = self.read_block(id, index)?;
            let mut payload = match existing.status {
                ReadStatus::Sparse => Vec::new(),
                ReadStatus::Ok | ReadStatus::Healed => existing.data,
            };
            if payload.len() < hi as usize {
                payload.resize(hi as usize, 0);
            }
            payload[lo as usize..hi as usize].copy_from_slice(src);
            self.write_block(id, index, &payload)?;
        }
        Ok(last - first + 1)
    }

    /// Reads up to `len` bytes at `offset`, clamped to the object length.
    /// Holes read as zeros.
    pub fn read_bytes(&self, id: AnchorId, offset: u64, len: u64) -> Hn4Result<Vec<u8>> {
        let length = self.anchors.snapshot(id)?.length;
        let end = offset.saturating_add(len).min(length);
        if offset >= end {
            return Ok(Vec::new());
        }
        let cap = self.payload_capacity() as u64;
        let mut out = alloc_buffer((end - offset) as usize)?;
        let first = offset / cap;
        let last = (end - 1) / cap;

        for index in first..=last {
            let block_start = index * cap;
            let lo = offset.max(block_start) - block_start;
            let hi = end.min(block_start + cap) - block_start;
            let outcome = self.read_block(id, index)?;
            let dst_from = (block_start + lo - offset) as usize;
            let available = (outcome.data.len() as u64).min(hi);
            if available > lo {
                let n = (available - lo) as usize;
                out[dst_from..dst_from + n]
                    .copy_from_slice(&outcome.data[lo as usize..available as usize]);
            }
        }
        Ok(out)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> VolumeStats {
        let a = self.allocator.stats();
        let c = &self.counters;
        VolumeStats {
            volume_id: self.id,
            device_class: self.ctx.class(),
            total_blocks: a.total_blocks,
            used_blocks: a.used_blocks,
            flux_blocks: self.layout.flux_blocks,
            horizon_blocks: self.layout.horizon_blocks,
            horizon_used: a.horizon_used,
            saturated: a.saturated,
            bitmap_heals: self.allocator.bitmap().heal_count(),
            bitmap_forced_repairs: self.allocator.bitmap().forced_repairs(),
            heals_attempted: c.heals_attempted.load(Ordering::Relaxed),
            heals_succeeded: c.heals_succeeded.load(Ordering::Relaxed),
            leaked_blocks: a.leaked_blocks,
            commit_retries: c.commit_retries.load(Ordering::Relaxed),
            rescues: c.rescues.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            sparse_reads: c.sparse_reads.load(Ordering::Relaxed),
            health: self.health.load(Ordering::Relaxed),
            anchors: self.anchors.len(),
            uptime_ms: self.ctx.elapsed().as_millis() as u64,
            io: self.device.stats(),
        }
    }
}
