//! Horizon: linear overflow ring at the end of the volume.
//!
//! Claims walk a monotonic cursor modulo the ring length and try a few
//! set-if-clear probes before giving up. The cursor never rewinds, so slots
//! are reused in ring order as earlier claims are released.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::bitmap::Bitmap;
use crate::error::{Hn4Error, Hn4Result};

/// The overflow ring.
#[derive(Debug)]
pub struct Horizon {
    start: u64,
    len: u64,
    probe_limit: u32,
    cursor: AtomicU64,
}

impl Horizon {
    /// Ring over blocks `[start, start + len)`.
    pub fn new(start: u64, len: u64, probe_limit: u32) -> Self {
        Self {
            start,
            len,
            probe_limit: probe_limit.max(1),
            cursor: AtomicU64::new(0),
        }
    }

    /// First block of the ring.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Number of blocks in the ring.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns whether the ring has no blocks.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether `lba` lies inside the ring.
    pub fn contains(&self, lba: u64) -> bool {
        lba >= self.start && lba - self.start < self.len
    }

    /// Claims the next free slot within the probe limit.
    pub fn claim(&self, bitmap: &Bitmap) -> Hn4Result<u64> {
        if self.len == 0 {
            return Err(Hn4Error::HorizonExhausted { probes: 0 });
        }
        for _ in 0..self.probe_limit {
            let slot = self.cursor.fetch_add(1, Ordering::AcqRel) % self.len;
            let lba = self.start + slot;
            if bitmap.set(lba)? {
                debug!(lba, "claimed horizon slot");
                return Ok(lba);
            }
        }
        Err(Hn4Error::HorizonExhausted {
            probes: self.probe_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_in_ring_order() {
        let bm = Bitmap::new(100);
        let h = Horizon::new(90, 10, 4);
        assert_eq!(h.claim(&bm).unwrap(), 90);
        assert_eq!(h.claim(&bm).unwrap(), 91);
        assert!(h.contains(99));
        assert!(!h.contains(100));
        assert!(!h.contains(89));
    }

    #[test]
    fn test_skips_occupied_slots() {
        let bm = Bitmap::new(100);
        bm.set(90).unwrap();
        bm.set(91).unwrap();
        let h = Horizon::new(90, 10, 4);
        assert_eq!(h.claim(&bm).unwrap(), 92);
    }

    #[test]
    fn test_exhaustion_after_claim_limit() {
        let bm = Bitmap::new(100);
        for b in 90..100 {
            bm.set(b).unwrap();
        }
        let h = Horizon::new(90, 10, 4);
        assert!(matches!(
            h.claim(&bm),
            Err(Hn4Error::HorizonExhausted { probes: 4 })
        ));
    }

    #[test]
    fn test_wraps_and_reuses_released_slots() {
        let bm = Bitmap::new(4);
        let h = Horizon::new(0, 4, 4);
        for _ in 0..4 {
            h.claim(&bm).unwrap();
        }
        bm.clear(1).unwrap();
        assert_eq!(h.claim(&bm).unwrap(), 1);
    }

    #[test]
    fn test_empty_ring() {
        let bm = Bitmap::new(4);
        let h = Horizon::new(4, 0, 4);
        assert!(h.is_empty());
        assert!(h.claim(&bm).is_err());
    }
}
