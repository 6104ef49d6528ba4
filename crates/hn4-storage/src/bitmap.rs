//! ECC-armored allocation bitmap.
//!
//! One bit per block, 1 = allocated. Bits are grouped into 64-bit words, each
//! stored with a version and an ECC byte in a 128-bit armored cell (see
//! [`crate::cell`]). Every access decodes the ECC; single-bit rot is healed
//! in place and an uncorrectable word aborts the operation.
//!
//! Two word stores implement the same state machine:
//!
//! * [`CasStore`]: cells in RAM mutated by 128-bit compare-exchange.
//! * [`RmwStore`]: degraded mode for RAM-constrained targets. Words live in
//!   the bitmap region on the block device and every operation is a sector
//!   read-modify-write under a per-shard lock.
//!
//! A second-level summary bitmap keeps one bit per word meaning "this word has
//! at least one allocated block", letting range scans skip empty words.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::address::Addr;
use crate::cell::{ArmoredWord, CellArray, Version, ARMORED_WORD_BYTES};
use crate::device::BlockDevice;
use crate::ecc::{self, EccStatus};
use crate::error::{Hn4Error, Hn4Result};

const SUMMARY_SHARDS: usize = 64;
const RMW_SHARDS: usize = 64;

/// How bitmap words are stored and mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitmapMode {
    /// In-memory cells with 128-bit compare-exchange
    #[default]
    Cas,
    /// On-device words with locked sector read-modify-write
    SectorRmw,
}

/// Bitmap operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    /// Report the bit
    Test,
    /// Set if clear
    Set,
    /// Clear if set
    Clear,
    /// Clear, rebuilding the word if its ECC is beyond repair
    ForceClear,
}

/// Storage for armored words.
pub trait WordStore: Send + Sync {
    /// Number of words.
    fn word_count(&self) -> usize;

    /// Loads one packed word.
    fn load(&self, word: usize) -> Hn4Result<u128>;

    /// Replaces `word` with `new` if it still equals `current`. The inner
    /// `Err` carries the value found instead.
    fn compare_exchange(&self, word: usize, current: u128, new: u128)
        -> Hn4Result<Result<(), u128>>;

    /// Lock to hold for a whole operation, if the store needs one.
    fn lock_word(&self, word: usize) -> Option<MutexGuard<'_, ()>>;

    /// Overwrites a word unconditionally.
    fn store_raw(&self, word: usize, raw: u128) -> Hn4Result<()>;
}

/// In-memory store mutated by compare-exchange.
pub struct CasStore {
    cells: CellArray,
}

impl CasStore {
    /// Creates `words` zeroed cells.
    pub fn new(words: usize) -> Self {
        Self {
            cells: CellArray::new(words),
        }
    }
}

impl WordStore for CasStore {
    fn word_count(&self) -> usize {
        self.cells.len()
    }

    fn load(&self, word: usize) -> Hn4Result<u128> {
        Ok(self.cells.load(word))
    }

    fn compare_exchange(
        &self,
        word: usize,
        current: u128,
        new: u128,
    ) -> Hn4Result<Result<(), u128>> {
        Ok(self.cells.compare_exchange(word, current, new).map(|_| ()))
    }

    fn lock_word(&self, _word: usize) -> Option<MutexGuard<'_, ()>> {
        None
    }

    fn store_raw(&self, word: usize, raw: u128) -> Hn4Result<()> {
        self.cells.store(word, raw);
        Ok(())
    }
}

/// On-device store: sector read-modify-write under a per-shard lock.
pub struct RmwStore {
    device: Arc<dyn BlockDevice>,
    region_start: Addr,
    sector_size: usize,
    words: usize,
    shards: Box<[Mutex<()>]>,
}

impl RmwStore {
    /// Creates a store over the sectors starting at `region_start` and zeroes
    /// them. A zero word with a zero ECC byte is a valid empty word.
    pub fn format(device: Arc<dyn BlockDevice>, region_start: Addr, words: usize) -> Hn4Result<Self> {
        let sector_size = device.caps().sector_size as usize;
        let bytes = words * ARMORED_WORD_BYTES;
        let sectors = bytes.div_ceil(sector_size);
        let zero = vec![0u8; sector_size];
        for s in 0..sectors as u64 {
            let lba = region_start
                .checked_add_u64(s)
                .ok_or(Hn4Error::AddressOverflow { context: "bitmap region" })?;
            device.write_sectors(lba, &zero)?;
        }
        device.flush()?;
        Ok(Self {
            device,
            region_start,
            sector_size,
            words,
            shards: (0..RMW_SHARDS).map(|_| Mutex::new(())).collect(),
        })
    }

    fn locate(&self, word: usize) -> Hn4Result<(Addr, usize)> {
        let byte = word * ARMORED_WORD_BYTES;
        let sector = (byte / self.sector_size) as u64;
        let lba = self
            .region_start
            .checked_add_u64(sector)
            .ok_or(Hn4Error::AddressOverflow { context: "bitmap sector" })?;
        Ok((lba, byte % self.sector_size))
    }

    fn read_sector(&self, lba: Addr) -> Hn4Result<Vec<u8>> {
        let mut buf = vec![0u8; self.sector_size];
        self.device.read_sectors(lba, &mut buf)?;
        Ok(buf)
    }

    fn word_at(buf: &[u8], offset: usize) -> u128 {
        let mut bytes = [0u8; ARMORED_WORD_BYTES];
        bytes.copy_from_slice(&buf[offset..offset + ARMORED_WORD_BYTES]);
        u128::from_le_bytes(bytes)
    }
}

impl WordStore for RmwStore {
    fn word_count(&self) -> usize {
        self.words
    }

    fn load(&self, word: usize) -> Hn4Result<u128> {
        let (lba, offset) = self.locate(word)?;
        let buf = self.read_sector(lba)?;
        Ok(Self::word_at(&buf, offset))
    }

    fn compare_exchange(
        &self,
        word: usize,
        current: u128,
        new: u128,
    ) -> Hn4Result<Result<(), u128>> {
        let (lba, offset) = self.locate(word)?;
        let mut buf = self.read_sector(lba)?;
        let found = Self::word_at(&buf, offset);
        if found != current {
            return Ok(Err(found));
        }
        buf[offset..offset + ARMORED_WORD_BYTES].copy_from_slice(&new.to_le_bytes());
        self.device.write_sectors(lba, &buf)?;
        Ok(Ok(()))
    }

    fn lock_word(&self, word: usize) -> Option<MutexGuard<'_, ()>> {
        let sector = word * ARMORED_WORD_BYTES / self.sector_size;
        Some(self.shards[sector % self.shards.len()].lock())
    }

    fn store_raw(&self, word: usize, raw: u128) -> Hn4Result<()> {
        let _guard = self.lock_word(word);
        let (lba, offset) = self.locate(word)?;
        let mut buf = self.read_sector(lba)?;
        buf[offset..offset + ARMORED_WORD_BYTES].copy_from_slice(&raw.to_le_bytes());
        self.device.write_sectors(lba, &buf)
    }
}

/// The allocation bitmap.
pub struct Bitmap {
    store: Box<dyn WordStore>,
    total_blocks: u64,
    summary: Box<[AtomicU64]>,
    summary_shards: Box<[Mutex<()>]>,
    used: AtomicU64,
    heals: AtomicU64,
    forced_repairs: AtomicU64,
}

impl Bitmap {
    /// Number of armored words needed for `total_blocks`.
    pub fn words_for(total_blocks: u64) -> usize {
        total_blocks.div_ceil(64) as usize
    }

    /// Creates an in-memory CAS bitmap with every block free.
    pub fn new(total_blocks: u64) -> Self {
        let words = Self::words_for(total_blocks);
        Self::with_store(Box::new(CasStore::new(words)), total_blocks)
    }

    /// Creates a bitmap over an arbitrary store. The store must start empty.
    pub fn with_store(store: Box<dyn WordStore>, total_blocks: u64) -> Self {
        let words = store.word_count();
        let summary_words = words.div_ceil(64).max(1);
        Self {
            store,
            total_blocks,
            summary: (0..summary_words).map(|_| AtomicU64::new(0)).collect(),
            summary_shards: (0..SUMMARY_SHARDS).map(|_| Mutex::new(())).collect(),
            used: AtomicU64::new(0),
            heals: AtomicU64::new(0),
            forced_repairs: AtomicU64::new(0),
        }
    }

    /// Number of blocks covered.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Number of allocated blocks.
    pub fn used_blocks(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Number of single-bit corrections written back.
    pub fn heal_count(&self) -> u64 {
        self.heals.load(Ordering::Relaxed)
    }

    /// Number of uncorrectable words rebuilt by force-clear.
    pub fn forced_repairs(&self) -> u64 {
        self.forced_repairs.load(Ordering::Relaxed)
    }

    /// Returns whether `block` is allocated.
    pub fn test(&self, block: u64) -> Hn4Result<bool> {
        self.apply(block, BitOp::Test)
    }

    /// Sets `block` if clear. Returns whether this call claimed it.
    pub fn set(&self, block: u64) -> Hn4Result<bool> {
        self.apply(block, BitOp::Set)
    }

    /// Clears `block` if set. Returns whether this call freed it.
    pub fn clear(&self, block: u64) -> Hn4Result<bool> {
        self.apply(block, BitOp::Clear)
    }

    /// Clears `block` even if its word is uncorrectable.
    pub fn force_clear(&self, block: u64) -> Hn4Result<bool> {
        self.apply(block, BitOp::ForceClear)
    }

    /// Version of the word holding `block`.
    pub fn version_of(&self, block: u64) -> Hn4Result<u64> {
        self.check_block(block)?;
        let raw = self.store.load((block / 64) as usize)?;
        Ok(ArmoredWord::unpack(raw).version.get())
    }

    /// Raw armored word, without decoding.
    pub fn raw_word(&self, word: usize) -> Hn4Result<ArmoredWord> {
        Ok(ArmoredWord::unpack(self.store.load(word)?))
    }

    pub(crate) fn store_raw(&self, word: usize, w: ArmoredWord) -> Hn4Result<()> {
        self.store.store_raw(word, w.pack())
    }

    fn check_block(&self, block: u64) -> Hn4Result<()> {
        if block >= self.total_blocks {
            return Err(Hn4Error::Geometry {
                reason: format!("block {} beyond bitmap of {}", block, self.total_blocks),
            });
        }
        Ok(())
    }

    /// Runs one operation through the decode / modify / encode / commit loop.
    ///
    /// `Test` returns the bit; the others return whether the bit changed.
    pub fn apply(&self, block: u64, op: BitOp) -> Hn4Result<bool> {
        self.check_block(block)?;
        let word = (block / 64) as usize;
        let mask = 1u64 << (block % 64);
        let _serial = self.store.lock_word(word);

        loop {
            let raw = self.store.load(word)?;
            let cell = ArmoredWord::unpack(raw);

            let (data, healed, forced) = match ecc::decode_and_fix(cell.data, cell.ecc) {
                Ok(d) => (d.data, d.status == EccStatus::Corrected, false),
                Err(e) if op == BitOp::ForceClear => {
                    warn!(word, syndrome = e.syndrome, "rebuilding uncorrectable bitmap word");
                    (cell.data, false, true)
                }
                Err(e) => {
                    error!(word, syndrome = e.syndrome, "uncorrectable bitmap word");
                    return Err(Hn4Error::BitmapCorruption { word: word as u64 });
                }
            };

            let was_set = data & mask != 0;
            let new_data = match op {
                BitOp::Test => data,
                BitOp::Set => data | mask,
                BitOp::Clear | BitOp::ForceClear => data & !mask,
            };
            let changed = new_data != data;

            if !changed && !healed && !forced {
                return Ok(op == BitOp::Test && was_set);
            }

            let version: Version = if changed || forced {
                cell.version.next()
            } else {
                cell.version
            };
            let next = ArmoredWord {
                data: new_data,
                version,
                ecc: ecc::encode(new_data),
            };

            if self.store.compare_exchange(word, raw, next.pack())?.is_err() {
                debug!(word, "bitmap CAS lost, retrying");
                continue;
            }

            if healed {
                self.heals.fetch_add(1, Ordering::Relaxed);
                warn!(word, "healed single-bit error in bitmap word");
            }
            if forced {
                self.forced_repairs.fetch_add(1, Ordering::Relaxed);
            }

            let before = u64::from(data.count_ones());
            let after = u64::from(new_data.count_ones());
            if after > before {
                self.used.fetch_add(after - before, Ordering::Relaxed);
            } else if before > after {
                self.used.fetch_sub(before - after, Ordering::Relaxed);
            }

            if changed || forced {
                if new_data != 0 {
                    self.mark_summary(word);
                } else {
                    self.recheck_summary(word);
                }
            }

            return Ok(if op == BitOp::Test { was_set } else { changed });
        }
    }

    fn summary_shard(&self, word: usize) -> &Mutex<()> {
        &self.summary_shards[(word / 64) % self.summary_shards.len()]
    }

    fn mark_summary(&self, word: usize) {
        let _guard = self.summary_shard(word).lock();
        self.summary[word / 64].fetch_or(1 << (word % 64), Ordering::Release);
    }

    fn recheck_summary(&self, word: usize) {
        let _guard = self.summary_shard(word).lock();
        let empty = match self.store.load(word) {
            Ok(raw) => {
                let cell = ArmoredWord::unpack(raw);
                matches!(ecc::decode_and_fix(cell.data, cell.ecc), Ok(d) if d.data == 0)
            }
            Err(_) => false,
        };
        if empty {
            self.summary[word / 64].fetch_and(!(1 << (word % 64)), Ordering::Release);
        }
    }

    fn word_may_be_empty(&self, word: usize) -> bool {
        self.summary[word / 64].load(Ordering::Acquire) & (1 << (word % 64)) == 0
    }

    /// Returns whether `word` has at least one allocated block, per the summary.
    pub fn summary_bit(&self, word: usize) -> bool {
        !self.word_may_be_empty(word)
    }

    /// First free block in `[start, start + len)`, skipping words the summary
    /// reports empty without loading them.
    pub fn find_free_in_range(&self, start: u64, len: u64) -> Hn4Result<Option<u64>> {
        let end = start.saturating_add(len).min(self.total_blocks);
        let mut block = start;
        while block < end {
            let word = (block / 64) as usize;
            let word_end = ((word as u64 + 1) * 64).min(end);
            if self.word_may_be_empty(word) {
                return Ok(Some(block));
            }
            let data = self.decoded(word)?;
            for b in block..word_end {
                if data & (1 << (b % 64)) == 0 {
                    return Ok(Some(b));
                }
            }
            block = word_end;
        }
        Ok(None)
    }

    /// Returns whether every block of `[start, start + len)` is free.
    pub fn is_range_free(&self, start: u64, len: u64) -> Hn4Result<bool> {
        let end = start.saturating_add(len);
        if end > self.total_blocks {
            return Ok(false);
        }
        let mut block = start;
        while block < end {
            let word = (block / 64) as usize;
            let word_end = ((word as u64 + 1) * 64).min(end);
            if !self.word_may_be_empty(word) {
                let data = self.decoded(word)?;
                if (block..word_end).any(|b| data & (1 << (b % 64)) != 0) {
                    return Ok(false);
                }
            }
            block = word_end;
        }
        Ok(true)
    }

    fn decoded(&self, word: usize) -> Hn4Result<u64> {
        let cell = ArmoredWord::unpack(self.store.load(word)?);
        ecc::decode_and_fix(cell.data, cell.ecc)
            .map(|d| d.data)
            .map_err(|_| Hn4Error::BitmapCorruption { word: word as u64 })
    }
}
