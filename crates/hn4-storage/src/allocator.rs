//! Block allocator.
//!
//! Combines the armored bitmap, the quality map, the horizon ring and the
//! saturation guard. Placement policy (which trajectory candidate to try) is
//! the caller's; the allocator only claims, vetoes and releases blocks.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::capacity::{usage_pct, SaturationConfig, SaturationGuard};
use crate::error::{Hn4Error, Hn4Result};
use crate::horizon::Horizon;
use crate::profile::DeviceContext;
use crate::quality::QualityMap;
use crate::trajectory::Geometry;

/// Allocator statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Allocated blocks, metadata included
    pub used_blocks: u64,
    /// Blocks covered by the bitmap
    pub total_blocks: u64,
    /// Allocated horizon slots
    pub horizon_used: u64,
    /// Claims abandoned on append-only media
    pub leaked_blocks: u64,
    /// Whether saturation mode is active
    pub saturated: bool,
}

/// Claims and releases blocks.
pub struct Allocator {
    bitmap: Bitmap,
    quality: QualityMap,
    horizon: Horizon,
    saturation: SaturationGuard,
    geometry: Geometry,
    append_only: bool,
    horizon_used: AtomicU64,
    leaked: AtomicU64,
    /// Blocks being rewritten in place by a heal; the value records a free
    /// that arrived meanwhile.
    pins: DashMap<u64, bool>,
}

impl Allocator {
    /// Creates an allocator over a freshly formatted bitmap.
    pub fn new(
        bitmap: Bitmap,
        geometry: Geometry,
        horizon: Horizon,
        saturation: SaturationConfig,
        append_only: bool,
    ) -> Self {
        let quality = QualityMap::new(bitmap.total_blocks());
        Self {
            bitmap,
            quality,
            horizon,
            saturation: SaturationGuard::new(saturation),
            geometry,
            append_only,
            horizon_used: AtomicU64::new(0),
            leaked: AtomicU64::new(0),
            pins: DashMap::new(),
        }
    }

    /// The allocation bitmap.
    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// The quality map.
    pub fn quality(&self) -> &QualityMap {
        &self.quality
    }

    /// The overflow ring.
    pub fn horizon(&self) -> &Horizon {
        &self.horizon
    }

    /// The flux window.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Re-evaluates and returns the saturation mode.
    ///
    /// Usage is measured over the ballistic area only: the horizon ring and
    /// the slots claimed in it are left out.
    pub fn is_saturated(&self) -> bool {
        let (used, capacity) = self.ballistic_usage();
        self.saturation.observe(used, capacity)
    }

    /// Used share of the ballistic area (metadata and flux), in percent.
    pub fn ballistic_usage_pct(&self) -> u8 {
        let (used, capacity) = self.ballistic_usage();
        usage_pct(used, capacity)
    }

    fn ballistic_usage(&self) -> (u64, u64) {
        let used = self
            .bitmap
            .used_blocks()
            .saturating_sub(self.horizon_used.load(Ordering::Relaxed));
        let capacity = self
            .bitmap
            .total_blocks()
            .saturating_sub(self.horizon.len());
        (used, capacity)
    }

    /// Claims `lba` if the quality map admits it and it is free.
    pub fn try_claim(&self, lba: u64, high_priority: bool) -> Hn4Result<bool> {
        if !self.quality.admits(lba, high_priority) {
            debug!(lba, high_priority, "quality veto");
            return Ok(false);
        }
        self.bitmap.set(lba)
    }

    /// Claims the next horizon slot.
    pub fn claim_horizon(&self) -> Hn4Result<u64> {
        let lba = self.horizon.claim(&self.bitmap)?;
        self.horizon_used.fetch_add(1, Ordering::Relaxed);
        Ok(lba)
    }

    /// Undoes a claim whose write failed or lost its commit race.
    ///
    /// Append-only media cannot reuse the block before a zone reset, so the
    /// claim is leaked and counted instead.
    pub fn rollback(&self, lba: u64) -> Hn4Result<()> {
        if self.append_only {
            self.leaked.fetch_add(1, Ordering::Relaxed);
            warn!(lba, "append-only media: leaking abandoned block");
            return Ok(());
        }
        self.free(lba)
    }

    /// Frees a block that no longer holds live data.
    ///
    /// A pinned block keeps its bit until [`Allocator::unpin`], so nobody
    /// can claim it while a heal still writes to it.
    pub fn free(&self, lba: u64) -> Hn4Result<()> {
        match self.pins.entry(lba) {
            Entry::Occupied(mut pin) => {
                *pin.get_mut() = true;
                debug!(lba, "free deferred until heal completes");
                Ok(())
            }
            Entry::Vacant(guard) => {
                let result = self.clear(lba);
                drop(guard);
                result
            }
        }
    }

    fn clear(&self, lba: u64) -> Hn4Result<()> {
        if self.bitmap.clear(lba)? && self.horizon.contains(lba) {
            self.horizon_used.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Pins an allocated block against [`Allocator::free`]. Returns `false`
    /// if the block is free or already pinned.
    pub fn pin(&self, lba: u64) -> Hn4Result<bool> {
        match self.pins.entry(lba) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                if !self.bitmap.test(lba)? {
                    return Ok(false);
                }
                slot.insert(false);
                Ok(true)
            }
        }
    }

    /// Releases a pin, performing any free deferred while it was held.
    pub fn unpin(&self, lba: u64) -> Hn4Result<()> {
        match self.pins.entry(lba) {
            Entry::Occupied(pin) => {
                let result = if *pin.get() { self.clear(lba) } else { Ok(()) };
                pin.remove();
                result
            }
            Entry::Vacant(_) => Ok(()),
        }
    }

    /// Picks a gravity center for a new object at fractal scale `m`.
    ///
    /// A random stride-aligned slot is reserved, the `genesis_run` blocks
    /// after it are checked free, and the reservation is dropped again so the
    /// first write claims the slot through its trajectory. Returns the
    /// gravity center relative to the aligned flux window.
    pub fn alloc_genesis(&self, m: u8, ctx: &DeviceContext) -> Hn4Result<u64> {
        let (base, phi) = self.geometry.window(m).ok_or_else(|| Hn4Error::Geometry {
            reason: format!("flux window holds no slot at scale {}", m),
        })?;
        let profile = ctx.profile();
        for probe in 0..profile.probe_budget {
            let slot = ctx.random_below(phi);
            let lba = base + (slot << m);
            if !self.try_claim(lba, false)? {
                continue;
            }
            let run_free = self.bitmap.is_range_free(lba + 1, profile.genesis_run);
            self.free(lba)?;
            if run_free? {
                debug!(lba, probe, "genesis gravity center");
                return Ok(slot << m);
            }
        }
        Err(Hn4Error::BallisticExhausted {
            probes: profile.probe_budget,
        })
    }

    /// Blocks leaked on append-only media.
    pub fn leaked_blocks(&self) -> u64 {
        self.leaked.load(Ordering::Relaxed)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            used_blocks: self.bitmap.used_blocks(),
            total_blocks: self.bitmap.total_blocks(),
            horizon_used: self.horizon_used.load(Ordering::Relaxed),
            leaked_blocks: self.leaked_blocks(),
            saturated: self.saturation.is_saturated(),
        }
    }
}
