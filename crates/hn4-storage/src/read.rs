//! Shotgun read pipeline.
//!
//! A logical block may have several candidate locations. The reader tries
//! the hinted candidate first, then reads every allocated candidate and
//! keeps the valid copy with the highest visible generation. Damaged or
//! stale copies of the same block are rewritten with the winning image
//! when the volume is writable.

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::anchor::{Anchor, AnchorFlags, AnchorId};
use crate::block::{validate, Expectation, ValidBlock};
use crate::error::{Hn4Error, Hn4Result};
use crate::header::BlockHeader;
use crate::trajectory::INVALID_LBA;
use crate::volume::Volume;

const HEALTH_MAX: u32 = 100;
const HEALTH_PENALTY: u32 = 5;
const MAX_BACKOFF_SHIFT: u32 = 6;

/// How a read was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    /// A valid copy was found
    Ok,
    /// A valid copy was found and at least one damaged copy was repaired
    Healed,
    /// The block was never written; `data` is empty
    Sparse,
}

/// Result of a block read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Payload bytes
    pub data: Vec<u8>,
    /// How the read was satisfied
    pub status: ReadStatus,
    /// Physical block of the winning copy
    pub lba: Option<u64>,
    /// Generation of the winning copy; 0 when sparse
    pub generation: u32,
}

impl ReadOutcome {
    fn sparse() -> Self {
        Self {
            data: Vec::new(),
            status: ReadStatus::Sparse,
            lba: None,
            generation: 0,
        }
    }
}

struct Probe {
    lba: u64,
    image: Option<Vec<u8>>,
    verdict: Hn4Result<ValidBlock>,
}

impl Volume {
    /// Reads one logical block of an object.
    ///
    /// A read that finds no valid copy while a concurrent write commits is
    /// retried against the new descriptor, so a racing reader sees either
    /// the old or the new payload.
    pub fn read_block(&self, id: AnchorId, index: u64) -> Hn4Result<ReadOutcome> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let handle = self.anchors.get(id)?;
        let mut attempt = 1;
        loop {
            let anchor = handle.lock().clone();
            let result = self.read_snapshot(&anchor, index);
            let settled = matches!(&result, Ok(out) if out.status != ReadStatus::Sparse);
            if settled
                || attempt >= self.config.max_commit_retries
                || handle.lock().generation == anchor.generation
            {
                if matches!(&result, Ok(out) if out.status == ReadStatus::Sparse) {
                    self.counters.sparse_reads.fetch_add(1, Ordering::Relaxed);
                }
                return result;
            }
            debug!(id = %format!("{:#x}", id), index, attempt, "object changed during read, retrying");
            attempt += 1;
        }
    }

    fn read_snapshot(&self, anchor: &Anchor, index: u64) -> Hn4Result<ReadOutcome> {
        let id = anchor.id;
        if !anchor.permissions.read {
            return Err(Hn4Error::AccessDenied { id });
        }
        if anchor.is_tombstoned() {
            return Err(Hn4Error::Tombstoned { id });
        }
        if index.saturating_mul(self.payload_capacity() as u64) >= anchor.length {
            return Ok(ReadOutcome::sparse());
        }

        let expect = Expectation {
            owner: id,
            index,
            committed: anchor.generation,
            encrypted: anchor.flags.contains(AnchorFlags::ENCRYPTED),
        };
        let profile = *self.ctx.profile();

        let lbas: Vec<u64> = match anchor.linear_map.get(&index) {
            Some(&lba) => vec![lba],
            None if profile.horizon_only => return Ok(ReadOutcome::sparse()),
            None => {
                if let Some(outcome) = self.read_hinted(anchor, index, &expect)? {
                    return Ok(outcome);
                }
                self.trajectory(anchor, index, profile.read_depth)
                    .into_iter()
                    .map(|c| c.lba)
                    .collect()
            }
        };

        let mut allocated = Vec::with_capacity(lbas.len());
        for lba in lbas {
            if self.allocator.bitmap().test(lba)? {
                allocated.push(lba);
            }
        }
        if allocated.is_empty() {
            return Ok(ReadOutcome::sparse());
        }
        if profile.sort_candidates {
            allocated.sort_unstable();
        }

        let probes = if profile.prefetch {
            let images: Vec<_> = allocated
                .iter()
                .map(|&lba| (lba, self.read_image(lba)))
                .collect();
            images
                .into_iter()
                .map(|(lba, image)| self.judge(lba, image, anchor, &expect))
                .collect::<Vec<_>>()
        } else {
            let mut failures = 0u32;
            let mut probes = Vec::with_capacity(allocated.len());
            for &lba in &allocated {
                let probe = self.judge(lba, self.read_image(lba), anchor, &expect);
                if probe.verdict.is_err() {
                    failures += 1;
                    self.backoff(failures);
                }
                probes.push(probe);
            }
            probes
        };

        let winner = probes
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.verdict.as_ref().ok().map(|block| (i, block)))
            .max_by_key(|(_, block)| block.header.generation);
        let Some((win, block)) = winner else {
            return self.no_valid_copy(id, index, probes);
        };

        let healed = self.heal_losers(&probes, win, block.header.generation, &expect);
        Ok(ReadOutcome {
            data: block.data.clone(),
            status: if healed { ReadStatus::Healed } else { ReadStatus::Ok },
            lba: Some(probes[win].lba),
            generation: block.header.generation,
        })
    }

    /// Tries the candidate predicted by the placement hint.
    fn read_hinted(
        &self,
        anchor: &Anchor,
        index: u64,
        expect: &Expectation,
    ) -> Hn4Result<Option<ReadOutcome>> {
        let k = anchor.hint(index);
        if k > self.ctx.profile().read_depth {
            return Ok(None);
        }
        let lba = self.locate(anchor, index, k);
        if lba == INVALID_LBA || !self.allocator.bitmap().test(lba)? {
            return Ok(None);
        }
        let probe = self.judge(lba, self.read_image(lba), anchor, expect);
        match probe.verdict {
            Ok(block) => Ok(Some(ReadOutcome {
                generation: block.header.generation,
                data: block.data,
                status: ReadStatus::Ok,
                lba: Some(lba),
            })),
            Err(err) => {
                debug!(lba, k, error = %err, "hint miss");
                Ok(None)
            }
        }
    }

    /// Validates one candidate and updates the health score.
    fn judge(
        &self,
        lba: u64,
        image: Hn4Result<Vec<u8>>,
        anchor: &Anchor,
        expect: &Expectation,
    ) -> Probe {
        let (image, verdict) = match image {
            Ok(image) => {
                let verdict = validate(&image, lba, expect).and_then(|block| {
                    if anchor.is_retired(block.header.generation) {
                        Err(Hn4Error::GenerationSkew {
                            lba,
                            found: u64::from(block.header.generation),
                            committed: u64::from(anchor.generation),
                        })
                    } else {
                        Ok(block)
                    }
                });
                (Some(image), verdict)
            }
            Err(err) => (None, Err(err)),
        };
        self.adjust_health(verdict.is_ok());
        Probe { lba, image, verdict }
    }

    fn no_valid_copy(&self, id: AnchorId, index: u64, probes: Vec<Probe>) -> Hn4Result<ReadOutcome> {
        // Blocks of other objects, of uncommitted writes, or claimed and
        // never written all leave the logical block a hole.
        let foreign_only = probes.iter().all(|p| {
            matches!(
                p.verdict,
                Err(Hn4Error::IdentityMismatch { .. })
                    | Err(Hn4Error::GenerationSkew { .. })
                    | Err(Hn4Error::Phantom { .. })
            )
        });
        if foreign_only {
            return Ok(ReadOutcome::sparse());
        }
        let mut worst: Option<Hn4Error> = None;
        for probe in probes {
            if let Err(err) = probe.verdict {
                worst = Some(Hn4Error::most_severe(worst, err));
            }
        }
        let err = worst.unwrap_or(Hn4Error::ObjectNotFound { id });
        warn!(id = %format!("{:#x}", id), index, error = %err, "no valid copy");
        Err(err)
    }

    /// Rewrites damaged or stale copies with the winning image. Returns
    /// whether any rewrite succeeded.
    fn heal_losers(
        &self,
        probes: &[Probe],
        win: usize,
        win_generation: u32,
        expect: &Expectation,
    ) -> bool {
        if !self.config.heal_on_read || self.is_read_only() {
            return false;
        }
        let Some(image) = probes[win].image.as_deref() else {
            return false;
        };

        let mut healed = false;
        for (i, probe) in probes.iter().enumerate() {
            let repairable = match &probe.verdict {
                Ok(block) => i != win && block.header.generation < win_generation,
                Err(Hn4Error::PayloadRot { .. }) => true,
                Err(_) => false,
            };
            if !repairable {
                continue;
            }
            self.counters.heals_attempted.fetch_add(1, Ordering::Relaxed);
            match self.heal_one(probe.lba, image, win_generation, expect) {
                Ok(true) => {
                    healed = true;
                    self.counters.heals_succeeded.fetch_add(1, Ordering::Relaxed);
                    warn!(lba = probe.lba, from = probes[win].lba, "healed straggler copy");
                }
                Ok(false) => debug!(lba = probe.lba, "straggler busy or reassigned, not healed"),
                Err(err) => debug!(lba = probe.lba, error = %err, "heal failed"),
            }
        }
        healed
    }

    /// Writes `image` over `lba` if no write is in flight, the block is
    /// still allocated, and its header still names the same owner and index
    /// at a generation no newer than the winner's.
    ///
    /// The block is pinned first: a free that arrives during the heal is
    /// deferred, so the block cannot be reclaimed and refilled under us. A
    /// writer that claimed it before the pin is still counted in flight.
    fn heal_one(&self, lba: u64, image: &[u8], win_generation: u32, expect: &Expectation) -> Hn4Result<bool> {
        if !self.allocator.pin(lba)? {
            return Ok(false);
        }
        let healed = if self.counters.writes_in_flight.load(Ordering::SeqCst) != 0 {
            Ok(false)
        } else {
            self.heal_pinned(lba, image, win_generation, expect)
        };
        let unpinned = self.allocator.unpin(lba);
        let healed = healed?;
        unpinned?;
        Ok(healed)
    }

    fn heal_pinned(&self, lba: u64, image: &[u8], win_generation: u32, expect: &Expectation) -> Hn4Result<bool> {
        let current = self.read_image(lba)?;
        let header = BlockHeader::decode(&current, lba)?;
        if header.owner != expect.owner
            || header.index != expect.index
            || header.generation > win_generation
        {
            return Ok(false);
        }
        self.write_image(lba, image)?;
        Ok(true)
    }

    fn adjust_health(&self, ok: bool) {
        let _ = self
            .health
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |h| {
                Some(if ok {
                    (h + 1).min(HEALTH_MAX)
                } else {
                    h.saturating_sub(HEALTH_PENALTY)
                })
            });
    }

    /// Sleeps between failed candidates on seek-bound media, longer as
    /// failures accumulate and health drops.
    fn backoff(&self, failures: u32) {
        let base = self.ctx.profile().base_backoff_us;
        if base == 0 {
            return;
        }
        let health = u64::from(self.health.load(Ordering::Relaxed).min(HEALTH_MAX));
        let micros = (base << failures.min(MAX_BACKOFF_SHIFT)) * (u64::from(HEALTH_MAX) - health)
            / u64::from(HEALTH_MAX);
        if micros > 0 {
            std::thread::sleep(Duration::from_micros(micros));
        }
    }

    /// Health score in `0..=100`.
    pub fn health(&self) -> u32 {
        self.health.load(Ordering::Relaxed)
    }
}
