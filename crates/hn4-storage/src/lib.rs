#![warn(missing_docs)]

//! HN4 storage core: ballistic trajectory addressing, ECC-armored allocation
//! bitmap, Shadow Hop writes and Shotgun reads
//!
//! Data blocks carry no per-file extent tree. A block's location is
//! computed from its object's descriptor with [`trajectory::locate`]; on
//! collision the writer moves to the next collision index, and the reader
//! probes every candidate and validates the block headers. The allocation
//! bitmap stores each 64-bit word with a version and a SEC-DED code and is
//! mutated with a 128-bit compare-and-swap.

pub mod address;
pub mod allocator;
pub mod anchor;
pub mod bitmap;
pub mod block;
pub mod capacity;
pub mod cell;
pub mod compression;
pub mod config;
pub mod device;
pub mod ecc;
pub mod error;
pub mod header;
pub mod horizon;
pub mod profile;
pub mod quality;
pub mod read;
pub mod trajectory;
pub mod volume;
pub mod write;

pub use address::Addr;
pub use allocator::{Allocator, AllocatorStats};
pub use anchor::{Anchor, AnchorFlags, AnchorId, AnchorTable, Permissions, Priority, Reservation};
pub use bitmap::{BitOp, Bitmap, BitmapMode};
pub use capacity::{SaturationConfig, SaturationGuard};
pub use config::{DurabilityPolicy, VolumeConfig};
pub use device::{BlockDevice, DeviceCaps, FileDevice, IoStats, MemDevice};
pub use error::{ErrorClass, Hn4Error, Hn4Result};
pub use header::{BlockHeader, Codec};
pub use profile::{DeviceClass, DeviceContext, Profile};
pub use quality::{Quality, QualityMap};
pub use read::{ReadOutcome, ReadStatus};
pub use trajectory::{locate, Candidate, Geometry, TrajectoryParams, COPRIME_CYCLE_BOUND, INVALID_LBA};
pub use volume::{AnchorOptions, Layout, Volume, VolumeStats};
pub use write::WriteReceipt;
