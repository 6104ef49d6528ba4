//! Armored words and the 128-bit atomic cell array that stores them.
//!
//! An armored word packs one 64-bit bitmap word, a 56-bit version, and an
//! 8-bit ECC byte into 16 bytes. On media the layout is little-endian:
//! bytes `[0..8)` data, `[8..15)` version, `[15]` ECC.
//!
//! [`CellArray`] is the one implementation of the atomic 128-bit cell
//! interface. Stable Rust has no 128-bit atomic, so each cell is a
//! 16-byte-aligned pair of `AtomicU64` and every load and compare-exchange
//! runs under one of a fixed set of striped locks. Loads therefore never
//! observe a torn cell.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Size of an armored word on media.
pub const ARMORED_WORD_BYTES: usize = 16;
/// Mask of the 56-bit version field.
pub const VERSION_MASK: u64 = (1 << 56) - 1;

const LOCK_STRIPES: usize = 64;

/// 56-bit version counter that wraps past its maximum to 1, never to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Version(u64);

impl Version {
    /// Creates a version, truncating to 56 bits.
    pub fn new(raw: u64) -> Self {
        Version(raw & VERSION_MASK)
    }

    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Successor, skipping zero on wrap.
    pub fn next(self) -> Self {
        match (self.0 + 1) & VERSION_MASK {
            0 => Version(1),
            v => Version(v),
        }
    }
}

/// Unpacked contents of one bitmap cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmoredWord {
    /// One bit per block; 1 means allocated.
    pub data: u64,
    /// Transaction counter.
    pub version: Version,
    /// ECC over `data`.
    pub ecc: u8,
}

impl ArmoredWord {
    /// Packs into the 128-bit cell representation.
    pub fn pack(&self) -> u128 {
        u128::from(self.data)
            | (u128::from(self.version.get()) << 64)
            | (u128::from(self.ecc) << 120)
    }

    /// Unpacks a 128-bit cell.
    pub fn unpack(raw: u128) -> Self {
        Self {
            data: raw as u64,
            version: Version::new((raw >> 64) as u64),
            ecc: (raw >> 120) as u8,
        }
    }

    /// Serializes to the 16-byte on-media layout.
    pub fn to_bytes(&self) -> [u8; ARMORED_WORD_BYTES] {
        self.pack().to_le_bytes()
    }

    /// Parses the 16-byte on-media layout.
    pub fn from_bytes(bytes: [u8; ARMORED_WORD_BYTES]) -> Self {
        Self::unpack(u128::from_le_bytes(bytes))
    }
}

#[repr(C, align(16))]
#[derive(Debug, Default)]
struct Slot {
    lo: AtomicU64,
    hi: AtomicU64,
}

/// Fixed-size array of 128-bit cells with load and compare-exchange.
#[derive(Debug)]
pub struct CellArray {
    slots: Box<[Slot]>,
    stripes: Box<[Mutex<()>]>,
}

impl CellArray {
    /// Creates `len` zeroed cells.
    pub fn new(len: usize) -> Self {
        let slots = (0..len).map(|_| Slot::default()).collect::<Vec<_>>();
        let stripes = (0..LOCK_STRIPES)
            .map(|_| Mutex::new(()))
            .collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            stripes: stripes.into_boxed_slice(),
        }
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns whether the array holds no cells.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn stripe(&self, idx: usize) -> &Mutex<()> {
        &self.stripes[idx % self.stripes.len()]
    }

    /// Loads cell `idx` as one untorn 128-bit value.
    pub fn load(&self, idx: usize) -> u128 {
        let _guard = self.stripe(idx).lock();
        let slot = &self.slots[idx];
        u128::from(slot.lo.load(Ordering::Relaxed))
            | (u128::from(slot.hi.load(Ordering::Relaxed)) << 64)
    }

    /// Replaces cell `idx` with `new` if it still equals `current`.
    /// On failure returns the value actually found.
    pub fn compare_exchange(&self, idx: usize, current: u128, new: u128) -> Result<u128, u128> {
        let _guard = self.stripe(idx).lock();
        let slot = &self.slots[idx];
        let found = u128::from(slot.lo.load(Ordering::Relaxed))
            | (u128::from(slot.hi.load(Ordering::Relaxed)) << 64);
        if found != current {
            return Err(found);
        }
        slot.lo.store(new as u64, Ordering::Relaxed);
        slot.hi.store((new >> 64) as u64, Ordering::Relaxed);
        Ok(found)
    }

    /// Unconditionally overwrites a cell. Used to seed cells and to inject faults.
    pub fn store(&self, idx: usize, value: u128) {
        let _guard = self.stripe(idx).lock();
        let slot = &self.slots[idx];
        slot.lo.store(value as u64, Ordering::Relaxed);
        slot.hi.store((value >> 64) as u64, Ordering::Relaxed);
    }
}
