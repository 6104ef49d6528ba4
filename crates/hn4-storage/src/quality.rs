//! Per-block media quality tiers, 2 bits per block.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Quality tier of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quality {
    /// Never place data here
    Toxic = 0,
    /// Suspect; vetoed for high-priority objects
    Bronze = 1,
    /// Normal media
    Silver = 2,
    /// Verified good media
    Gold = 3,
}

impl Quality {
    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => Quality::Toxic,
            1 => Quality::Bronze,
            2 => Quality::Silver,
            _ => Quality::Gold,
        }
    }
}

const SILVER_WORD: u64 = 0xAAAA_AAAA_AAAA_AAAA;

/// In-memory quality map, every block Silver at creation.
pub struct QualityMap {
    words: Box<[AtomicU64]>,
    blocks: u64,
}

impl QualityMap {
    /// Creates a map for `blocks` blocks.
    pub fn new(blocks: u64) -> Self {
        let words = blocks.div_ceil(32) as usize;
        Self {
            words: (0..words).map(|_| AtomicU64::new(SILVER_WORD)).collect(),
            blocks,
        }
    }

    /// Tier of `block`; blocks outside the map are Toxic.
    pub fn get(&self, block: u64) -> Quality {
        if block >= self.blocks {
            return Quality::Toxic;
        }
        let word = self.words[(block / 32) as usize].load(Ordering::Relaxed);
        Quality::from_bits(word >> ((block % 32) * 2))
    }

    /// Sets the tier of `block`. Out-of-range blocks are ignored.
    pub fn set(&self, block: u64, quality: Quality) {
        if block >= self.blocks {
            return;
        }
        let shift = (block % 32) * 2;
        let word = &self.words[(block / 32) as usize];
        let mut cur = word.load(Ordering::Relaxed);
        loop {
            let next = (cur & !(0b11 << shift)) | ((quality as u64) << shift);
            match word.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(found) => cur = found,
            }
        }
    }

    /// Whether a block may hold data for an object of the given priority.
    pub fn admits(&self, block: u64, high_priority: bool) -> bool {
        match self.get(block) {
            Quality::Toxic => false,
            Quality::Bronze => !high_priority,
            Quality::Silver | Quality::Gold => true,
        }
    }
}
