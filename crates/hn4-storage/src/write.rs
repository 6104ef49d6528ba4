//! Shadow Hop write pipeline.
//!
//! A block is never overwritten in place. Each write claims a fresh shadow
//! block, writes and seals it, then commits by advancing the object
//! generation from the exact value observed at the start. Only after the
//! commit is the previous residency released. A writer that loses the
//! commit race releases its shadow and restarts; that restart is the only
//! retry loop.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::anchor::{Anchor, AnchorFlags, AnchorId, Priority};
use crate::block::{build_image, BlockIdentity};
use crate::config::DurabilityPolicy;
use crate::error::{Hn4Error, Hn4Result};
use crate::header::BlockHeader;
use crate::volume::Volume;

/// Result of a committed block write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReceipt {
    /// Physical block now holding the data
    pub lba: u64,
    /// Collision index of the placement; `None` for horizon slots
    pub k: Option<u8>,
    /// Generation stamped into the block and committed to the object
    pub generation: u32,
    /// Block landed in the horizon ring
    pub linear: bool,
}

/// Protocol stages at which tests can abort a write without cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CrashPoint {
    AfterShadowAlloc,
    AfterSealed,
}

/// Where a logical block currently lives.
#[derive(Debug, Default)]
struct Residency {
    /// Blocks holding the newest committed copy
    priors: Vec<u64>,
    /// Highest generation found on media for this block, committed or not
    seen: u32,
}

#[derive(Debug, Clone, Copy)]
struct Shadow {
    lba: u64,
    k: Option<u8>,
}

/// Counts a write as in flight until dropped.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Commit {
    Done,
    Raced,
    Tombstoned,
}

impl Volume {
    /// Writes one logical block of an object.
    ///
    /// `payload` must fit into [`Volume::payload_capacity`]. The object's
    /// length grows to cover the block.
    pub fn write_block(&self, id: AnchorId, index: u64, payload: &[u8]) -> Hn4Result<WriteReceipt> {
        if self.is_read_only() {
            return Err(Hn4Error::ReadOnly);
        }
        let cap = self.payload_capacity();
        if payload.len() > cap {
            return Err(Hn4Error::PayloadTooLarge {
                len: payload.len(),
                capacity: cap,
            });
        }
        let end = index
            .checked_mul(cap as u64)
            .and_then(|start| start.checked_add(payload.len() as u64))
            .ok_or(Hn4Error::AddressOverflow { context: "block index" })?;

        let handle = self.anchors.get(id)?;
        let attempts = self.config.max_commit_retries;
        let _in_flight = InFlight::enter(&self.counters.writes_in_flight);

        for attempt in 0..attempts {
            let snapshot = handle.lock().clone();
            self.check_writable(&snapshot, index, payload)?;

            let residency = self.find_residency(&snapshot, index)?;
            let ticket = handle.lock().reserve_generation(index, residency.seen)?;

            let shadow = match self.claim_shadow(&snapshot, index) {
                Ok(shadow) => shadow,
                Err(err) => {
                    handle.lock().abandon_generation(ticket);
                    return Err(err);
                }
            };
            self.crash_point(CrashPoint::AfterShadowAlloc)?;

            let in_place = residency.priors.contains(&shadow.lba);
            let compress = snapshot.flags.contains(AnchorFlags::COMPRESSED)
                && !snapshot.flags.contains(AnchorFlags::ENCRYPTED)
                && self.config.compress_payloads
                && !in_place;
            let identity = BlockIdentity {
                owner: id,
                index,
                generation: ticket,
            };

            let written = build_image(self.config.block_size as usize, identity, payload, compress)
                .and_then(|image| self.write_with_rescue(shadow.lba, &image))
                .and_then(|()| self.seal());
            if let Err(err) = written {
                handle.lock().abandon_generation(ticket);
                self.release_shadow(shadow.lba);
                return Err(err);
            }
            self.crash_point(CrashPoint::AfterSealed)?;

            let outcome = {
                let mut anchor = handle.lock();
                if anchor.is_tombstoned() {
                    anchor.abandon_generation(ticket);
                    Commit::Tombstoned
                } else if anchor.generation != snapshot.generation {
                    anchor.abandon_generation(ticket);
                    Commit::Raced
                } else {
                    anchor.commit_generation(ticket, index);
                    anchor.length = anchor.length.max(end);
                    match shadow.k {
                        Some(k) => {
                            anchor.record_hint(index, k);
                            anchor.linear_map.remove(&index);
                        }
                        None => {
                            anchor.linear_map.insert(index, shadow.lba);
                            anchor.flags.insert(AnchorFlags::LINEAR);
                        }
                    }
                    Commit::Done
                }
            };

            match outcome {
                Commit::Done => {}
                Commit::Tombstoned => {
                    self.release_shadow(shadow.lba);
                    return Err(Hn4Error::Tombstoned { id });
                }
                Commit::Raced => {
                    self.release_shadow(shadow.lba);
                    self.counters.commit_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %format!("{:#x}", id), index, attempt, "lost commit race, restarting");
                    continue;
                }
            }

            for prior in residency.priors.iter().filter(|&&lba| lba != shadow.lba) {
                self.allocator.free(*prior)?;
            }
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
            debug!(
                id = %format!("{:#x}", id),
                index,
                lba = shadow.lba,
                k = ?shadow.k,
                generation = ticket,
                "block committed"
            );
            return Ok(WriteReceipt {
                lba: shadow.lba,
                k: shadow.k,
                generation: ticket,
                linear: shadow.k.is_none(),
            });
        }

        warn!(id = %format!("{:#x}", id), index, attempts, "commit contention");
        Err(Hn4Error::CommitContention { id, attempts })
    }

    fn check_writable(&self, anchor: &Anchor, index: u64, payload: &[u8]) -> Hn4Result<()> {
        let id = anchor.id;
        if anchor.is_tombstoned() {
            return Err(Hn4Error::Tombstoned { id });
        }
        if anchor.permissions.immutable {
            return Err(Hn4Error::Immutable { id });
        }
        if !anchor.permissions.write {
            return Err(Hn4Error::AccessDenied { id });
        }
        if anchor.permissions.append_only {
            let start = index.saturating_mul(self.payload_capacity() as u64);
            if start < anchor.length {
                let existing = self.read_block(id, index)?.data;
                if payload.len() <= existing.len() || !payload.starts_with(&existing) {
                    return Err(Hn4Error::AppendViolation { id, index });
                }
            }
        }
        Ok(())
    }

    /// Finds the blocks holding the newest committed copy of `index`.
    ///
    /// Only headers are checked. Copies stamped above the committed
    /// generation belong to in-flight or abandoned writes; they are not
    /// priors but raise `seen` so the new ticket outranks them.
    fn find_residency(&self, anchor: &Anchor, index: u64) -> Hn4Result<Residency> {
        let lbas: Vec<u64> = match anchor.linear_map.get(&index) {
            Some(&lba) => vec![lba],
            None if self.ctx.profile().horizon_only => Vec::new(),
            None => self
                .trajectory(anchor, index, self.ctx.profile().read_depth)
                .into_iter()
                .map(|c| c.lba)
                .collect(),
        };

        let mut residency = Residency::default();
        let mut best = 0u32;
        for lba in lbas {
            if !self.allocator.bitmap().test(lba)? {
                continue;
            }
            let header = match self.read_image(lba).and_then(|img| BlockHeader::decode(&img, lba)) {
                Ok(h) => h,
                Err(err) => {
                    debug!(lba, error = %err, "skipping unreadable candidate");
                    continue;
                }
            };
            if header.owner != anchor.id || header.index != index {
                continue;
            }
            residency.seen = residency.seen.max(header.generation);
            if header.generation > anchor.generation || anchor.is_retired(header.generation) {
                continue;
            }
            if header.generation > best {
                best = header.generation;
                residency.priors.clear();
            }
            if header.generation == best {
                residency.priors.push(lba);
            }
        }
        Ok(residency)
    }

    fn claim_shadow(&self, anchor: &Anchor, index: u64) -> Hn4Result<Shadow> {
        let profile = self.ctx.profile();
        let prefer_horizon =
            profile.horizon_only || anchor.is_linear() || self.allocator.is_saturated();

        if !prefer_horizon {
            if let Some(shadow) = self.claim_ballistic(anchor, index)? {
                return Ok(shadow);
            }
            debug!(index, "trajectory exhausted, falling back to horizon");
        }

        match self.allocator.claim_horizon() {
            Ok(lba) => Ok(Shadow { lba, k: None }),
            Err(Hn4Error::HorizonExhausted { probes }) => {
                if profile.horizon_only {
                    return Err(Hn4Error::HorizonExhausted { probes });
                }
                if prefer_horizon {
                    if let Some(shadow) = self.claim_ballistic(anchor, index)? {
                        return Ok(shadow);
                    }
                }
                warn!(index, probes, "ballistic and horizon allocation both failed");
                Err(Hn4Error::CapacityCollapse)
            }
            Err(err) => Err(err),
        }
    }

    fn claim_ballistic(&self, anchor: &Anchor, index: u64) -> Hn4Result<Option<Shadow>> {
        let high_priority = anchor.priority == Priority::High;
        for c in self.trajectory(anchor, index, self.ctx.profile().max_k) {
            if self.allocator.try_claim(c.lba, high_priority)? {
                return Ok(Some(Shadow {
                    lba: c.lba,
                    k: Some(c.k),
                }));
            }
        }
        Ok(None)
    }

    /// Rolls back a shadow claim. A failed rollback leaves the block
    /// allocated; its generation is already retired, so it stays invisible.
    fn release_shadow(&self, lba: u64) {
        if let Err(err) = self.allocator.rollback(lba) {
            warn!(lba, error = %err, "shadow rollback failed, block leaked");
        }
    }

    /// Writes `image`; on failure flushes, reads back and accepts the block
    /// if the device holds exactly the image anyway.
    fn write_with_rescue(&self, lba: u64, image: &[u8]) -> Hn4Result<()> {
        let err = match self.write_image(lba, image) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        warn!(lba, error = %err, "block write failed, attempting rescue");
        if self.device.flush().is_err() {
            return Err(err);
        }
        match self.read_image(lba) {
            Ok(readback) if readback == image => {
                self.counters.rescues.fetch_add(1, Ordering::Relaxed);
                warn!(lba, "write rescued by read-back");
                Ok(())
            }
            _ => Err(err),
        }
    }

    /// Durability barrier before the commit.
    fn seal(&self) -> Hn4Result<()> {
        let certified = self.config.durability == DurabilityPolicy::PersistentMemory
            && self.ctx.caps().persistent_memory;
        if certified {
            return Ok(());
        }
        self.device.flush()
    }

    #[cfg(test)]
    fn crash_point(&self, at: CrashPoint) -> Hn4Result<()> {
        if *self.crash_at.lock() != Some(at) {
            return Ok(());
        }
        let stage = match at {
            CrashPoint::AfterShadowAlloc => "shadow allocated",
            CrashPoint::AfterSealed => "sealed",
        };
        Err(Hn4Error::InjectedCrash { stage })
    }

    #[cfg(not(test))]
    #[inline(always)]
    fn crash_point(&self, _at: CrashPoint) -> Hn4Result<()> {
        Ok(())
    }
}
