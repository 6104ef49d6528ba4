//! Object descriptors ("anchors") and the in-memory anchor table.
//!
//! An anchor carries everything [`crate::trajectory::locate`] needs to find
//! an object's blocks, plus the generation counter the write pipeline
//! compare-and-swaps to commit. The table hands out `Arc<Mutex<Anchor>>`;
//! the mutex is held only to snapshot or update a descriptor, never across
//! device I/O.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Hn4Error, Hn4Result};
use crate::trajectory::ORBIT_MASK;

/// 128-bit object identity.
pub type AnchorId = u128;

/// Classification flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorFlags(u32);

impl AnchorFlags {
    /// Descriptor is live
    pub const VALID: AnchorFlags = AnchorFlags(1 << 0);
    /// Object was deleted
    pub const TOMBSTONE: AnchorFlags = AnchorFlags(1 << 1);
    /// Blocks live in the horizon ring
    pub const LINEAR: AnchorFlags = AnchorFlags(1 << 2);
    /// Payloads may be compressed
    pub const COMPRESSED: AnchorFlags = AnchorFlags(1 << 3);
    /// Payloads are encrypted by an upper layer
    pub const ENCRYPTED: AnchorFlags = AnchorFlags(1 << 4);
    /// Exempt from background relocation
    pub const PINNED: AnchorFlags = AnchorFlags(1 << 5);

    /// No flags.
    pub const fn empty() -> Self {
        AnchorFlags(0)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns whether every flag of `other` is set.
    pub const fn contains(self, other: AnchorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the flags of `other`.
    pub fn insert(&mut self, other: AnchorFlags) {
        self.0 |= other.0;
    }

    /// Clears the flags of `other`.
    pub fn remove(&mut self, other: AnchorFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for AnchorFlags {
    type Output = AnchorFlags;

    fn bitor(self, rhs: AnchorFlags) -> AnchorFlags {
        AnchorFlags(self.0 | rhs.0)
    }
}

/// Access permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions {
    /// Reads allowed
    pub read: bool,
    /// Writes allowed
    pub write: bool,
    /// Existing blocks may not be rewritten
    pub append_only: bool,
    /// No writes at all
    pub immutable: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            append_only: false,
            immutable: false,
        }
    }
}

/// Priority class. High-priority objects refuse suspect media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Normal placement
    #[default]
    Normal,
    /// Bronze blocks are vetoed
    High,
}

/// A generation handed to a write, with the logical block it was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reservation {
    /// Reserved generation
    pub generation: u32,
    /// Logical block the write targeted
    pub index: u64,
}

/// Object descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    /// Seed identity
    pub id: AnchorId,
    /// Gravity center, relative to the aligned flux window
    pub gravity_center: u64,
    /// 48-bit orbit vector
    pub orbit_vector: u64,
    /// Fractal scale M (stride 2^M)
    pub fractal_scale: u8,
    /// Generation of the most recent committed write
    pub generation: u32,
    /// Highest generation handed to a write, committed or not
    pub reserved_generation: u32,
    /// Logical length in bytes
    pub length: u64,
    /// Classification flags
    pub flags: AnchorFlags,
    /// Access permissions
    pub permissions: Permissions,
    /// Placement priority
    pub priority: Priority,
    /// 2-bit collision-index hint per cluster, 16 clusters
    pub orbit_hints: u32,
    /// Horizon residency of linear blocks
    pub linear_map: BTreeMap<u64, u64>,
    /// Reservations of writes still in flight
    #[serde(default)]
    pub pending_generations: Vec<Reservation>,
    /// Reservations that can no longer commit and whose block has not been
    /// rewritten since, ascending by generation
    #[serde(default)]
    pub retired_generations: Vec<Reservation>,
}

impl Anchor {
    /// Creates a live descriptor at generation 1.
    pub fn new(id: AnchorId, gravity_center: u64, orbit_vector: u64, fractal_scale: u8) -> Self {
        Self {
            id,
            gravity_center,
            orbit_vector: orbit_vector & ORBIT_MASK,
            fractal_scale,
            generation: 1,
            reserved_generation: 1,
            length: 0,
            flags: AnchorFlags::VALID,
            permissions: Permissions::default(),
            priority: Priority::Normal,
            orbit_hints: 0,
            linear_map: BTreeMap::new(),
            pending_generations: Vec::new(),
            retired_generations: Vec::new(),
        }
    }

    fn hint_slot(index: u64) -> u32 {
        ((index >> 4) & 15) as u32 * 2
    }

    /// Predicted collision index for logical block `index`.
    pub fn hint(&self, index: u64) -> u8 {
        ((self.orbit_hints >> Self::hint_slot(index)) & 0b11) as u8
    }

    /// Records the collision index of a committed write. Indices above 3
    /// do not fit and leave the hint unchanged.
    pub fn record_hint(&mut self, index: u64, k: u8) {
        if k > 3 {
            return;
        }
        let shift = Self::hint_slot(index);
        self.orbit_hints = (self.orbit_hints & !(0b11 << shift)) | (u32::from(k) << shift);
    }

    /// Reserves a generation for a write of logical block `index`. It
    /// exceeds the committed generation, every earlier reservation, and
    /// `seen`, the highest generation found on media for that block.
    pub fn reserve_generation(&mut self, index: u64, seen: u32) -> Hn4Result<u32> {
        let next = self
            .reserved_generation
            .max(self.generation)
            .max(seen)
            .checked_add(1)
            .ok_or(Hn4Error::GenerationOverflow { id: self.id })?;
        self.reserved_generation = next;
        self.pending_generations.push(Reservation {
            generation: next,
            index,
        });
        Ok(next)
    }

    /// Commits `ticket`, reserved for logical block `index`, as the object
    /// generation.
    ///
    /// Pending reservations below `ticket` can no longer commit and are
    /// retired, so blocks stamped with them stay invisible. Retired entries
    /// of `index` below `ticket` are dropped: the committed copy outranks
    /// them from now on.
    pub fn commit_generation(&mut self, ticket: u32, index: u64) {
        self.pending_generations.retain(|r| r.generation != ticket);
        if ticket <= self.generation {
            return;
        }
        let (lost, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_generations)
            .into_iter()
            .partition(|r| r.generation < ticket);
        self.pending_generations = pending;
        for r in lost {
            self.retire(r);
        }
        self.retired_generations
            .retain(|r| r.index != index || r.generation > ticket);
        self.generation = ticket;
    }

    /// Gives up `ticket` after a failed or raced write.
    pub fn abandon_generation(&mut self, ticket: u32) {
        if let Some(pos) = self
            .pending_generations
            .iter()
            .position(|r| r.generation == ticket)
        {
            let r = self.pending_generations.swap_remove(pos);
            self.retire(r);
        }
    }

    fn retire(&mut self, r: Reservation) {
        if let Err(pos) = self
            .retired_generations
            .binary_search_by_key(&r.generation, |x| x.generation)
        {
            self.retired_generations.insert(pos, r);
        }
    }

    /// Returns whether `generation` belongs to an abandoned write.
    pub fn is_retired(&self, generation: u32) -> bool {
        self.retired_generations
            .binary_search_by_key(&generation, |x| x.generation)
            .is_ok()
    }

    /// Returns whether the object was deleted.
    pub fn is_tombstoned(&self) -> bool {
        self.flags.contains(AnchorFlags::TOMBSTONE)
    }

    /// Returns whether the object lives in the horizon ring.
    pub fn is_linear(&self) -> bool {
        self.flags.contains(AnchorFlags::LINEAR)
    }
}

/// Concurrent map of anchors.
#[derive(Default)]
pub struct AnchorTable {
    anchors: DashMap<AnchorId, Arc<Mutex<Anchor>>>,
}

impl AnchorTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new anchor.
    pub fn insert(&self, anchor: Anchor) -> Hn4Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.anchors.entry(anchor.id) {
            Entry::Occupied(_) => Err(Hn4Error::ObjectExists { id: anchor.id }),
            Entry::Vacant(v) => {
                v.insert(Arc::new(Mutex::new(anchor)));
                Ok(())
            }
        }
    }

    /// Shared handle to an anchor.
    pub fn get(&self, id: AnchorId) -> Hn4Result<Arc<Mutex<Anchor>>> {
        self.anchors
            .get(&id)
            .map(|a| Arc::clone(a.value()))
            .ok_or(Hn4Error::ObjectNotFound { id })
    }

    /// Copy of an anchor taken under its lock.
    pub fn snapshot(&self, id: AnchorId) -> Hn4Result<Anchor> {
        let handle = self.get(id)?;
        let anchor = handle.lock().clone();
        Ok(anchor)
    }

    /// Number of anchors, tombstoned included.
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Returns whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}
