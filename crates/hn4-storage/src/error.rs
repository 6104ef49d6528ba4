//! Error types for the HN4 storage core.
//!
//! Every variant belongs to one [`ErrorClass`]; the read pipeline uses
//! [`Hn4Error::severity`] to surface the most actionable failure when every
//! candidate of a block fails validation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for HN4 operations.
pub type Hn4Result<T> = Result<T, Hn4Error>;

/// Broad category of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Primary or overflow space exhausted.
    Capacity,
    /// On-media data failed verification.
    Integrity,
    /// The request violates object or volume policy.
    Policy,
    /// Device, geometry, or memory failure.
    Hardware,
    /// The object does not exist.
    NotFound,
    /// Bounded optimistic retry gave up.
    Transient,
    /// Rejected configuration.
    Config,
}

/// Error variants for HN4 operations.
#[derive(Debug, Error)]
pub enum Hn4Error {
    /// Wraps standard I/O errors from the device layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Device-level failure reported by a block device implementation.
    #[error("Device error: {reason}")]
    DeviceError {
        /// Description of the failure.
        reason: String,
    },

    /// An I/O request was not aligned to the device sector size.
    #[error("Not aligned: offset {offset} is not aligned to {alignment}")]
    NotAligned {
        /// Offending offset or length.
        offset: u64,
        /// Required alignment.
        alignment: u64,
    },

    /// A block index or layout parameter falls outside the volume geometry.
    #[error("Geometry violation: {reason}")]
    Geometry {
        /// Description of the violation.
        reason: String,
    },

    /// A wide address could not be narrowed without losing high bits.
    #[error("Address overflow: {context}")]
    AddressOverflow {
        /// What was being converted.
        context: &'static str,
    },

    /// A buffer could not be allocated.
    #[error("Out of memory allocating {bytes} bytes")]
    OutOfMemory {
        /// Requested size.
        bytes: usize,
    },

    /// No trajectory candidate could be claimed.
    #[error("Ballistic allocation exhausted after {probes} probes")]
    BallisticExhausted {
        /// Number of candidates tried.
        probes: u32,
    },

    /// The linear overflow ring has no free slot within the probe limit.
    #[error("Horizon exhausted after {probes} probes")]
    HorizonExhausted {
        /// Number of ring slots tried.
        probes: u32,
    },

    /// Both the ballistic region and the horizon are exhausted.
    #[error("Capacity collapse: ballistic and horizon allocation both failed")]
    CapacityCollapse,

    /// The object's generation counter cannot advance any further.
    #[error("Generation overflow on object {id:#x}")]
    GenerationOverflow {
        /// Object identity.
        id: u128,
    },

    /// A bitmap word failed ECC decode with an uncorrectable syndrome.
    #[error("Bitmap corruption: word {word} is uncorrectable")]
    BitmapCorruption {
        /// Index of the armored word.
        word: u64,
    },

    /// Block header failed magic or CRC verification.
    #[error("Header rot at block {lba}")]
    HeaderRot {
        /// Physical block index.
        lba: u64,
    },

    /// Payload CRC did not match the header.
    #[error("Payload rot at block {lba}: expected {expected:#x}, actual {actual:#x}")]
    PayloadRot {
        /// Physical block index.
        lba: u64,
        /// CRC recorded in the header.
        expected: u32,
        /// CRC computed over the stored payload.
        actual: u32,
    },

    /// The block carries a poison pattern or was never written.
    #[error("Phantom block at {lba}")]
    Phantom {
        /// Physical block index.
        lba: u64,
    },

    /// Header owner or logical index belongs to a different object/block.
    #[error("Identity mismatch at block {lba}: owner {owner:#x}, index {index}")]
    IdentityMismatch {
        /// Physical block index.
        lba: u64,
        /// Owner recorded on media.
        owner: u128,
        /// Logical index recorded on media.
        index: u64,
    },

    /// Block generation is newer than the committed object generation.
    #[error("Generation skew at block {lba}: found {found}, committed {committed}")]
    GenerationSkew {
        /// Physical block index.
        lba: u64,
        /// Generation recorded on media.
        found: u64,
        /// Committed generation of the object.
        committed: u64,
    },

    /// Stored payload could not be decompressed.
    #[error("Decompression failed at block {lba}: {reason}")]
    DecompressionFailed {
        /// Physical block index.
        lba: u64,
        /// Codec error text.
        reason: String,
    },

    /// The volume is mounted read-only.
    #[error("Volume is read-only")]
    ReadOnly,

    /// Permission bits forbid the operation.
    #[error("Access denied on object {id:#x}")]
    AccessDenied {
        /// Object identity.
        id: u128,
    },

    /// The object is immutable.
    #[error("Object {id:#x} is immutable")]
    Immutable {
        /// Object identity.
        id: u128,
    },

    /// The object was deleted.
    #[error("Object {id:#x} is tombstoned")]
    Tombstoned {
        /// Object identity.
        id: u128,
    },

    /// A write on an append-only object would modify existing data.
    #[error("Append violation on object {id:#x} at block {index}")]
    AppendViolation {
        /// Object identity.
        id: u128,
        /// Logical block index.
        index: u64,
    },

    /// An encrypted object carries a compressed payload.
    #[error("Tamper evidence at block {lba}")]
    TamperEvidence {
        /// Physical block index.
        lba: u64,
    },

    /// Payload does not fit into one block.
    #[error("Payload of {len} bytes exceeds block capacity {capacity}")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Usable payload bytes per block.
        capacity: usize,
    },

    /// No descriptor exists for the object.
    #[error("Object not found: {id:#x}")]
    ObjectNotFound {
        /// Object identity.
        id: u128,
    },

    /// An object with this identity already exists.
    #[error("Object already exists: {id:#x}")]
    ObjectExists {
        /// Object identity.
        id: u128,
    },

    /// The generation CAS kept losing races.
    #[error("Commit contention on object {id:#x} after {attempts} attempts")]
    CommitContention {
        /// Object identity.
        id: u128,
        /// Number of protocol restarts.
        attempts: u32,
    },

    /// Configuration failed validation or could not be loaded.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// Test-only crash point reached.
    #[error("Injected crash at {stage}")]
    InjectedCrash {
        /// Protocol stage at which the crash was injected.
        stage: &'static str,
    },
}

impl Hn4Error {
    /// Returns the class of this error.
    pub fn class(&self) -> ErrorClass {
        use Hn4Error::*;
        match self {
            Io(_) | DeviceError { .. } | NotAligned { .. } | Geometry { .. }
            | AddressOverflow { .. } | OutOfMemory { .. } => ErrorClass::Hardware,
            BallisticExhausted { .. } | HorizonExhausted { .. } | CapacityCollapse
            | GenerationOverflow { .. } | PayloadTooLarge { .. } => ErrorClass::Capacity,
            BitmapCorruption { .. } | HeaderRot { .. } | PayloadRot { .. } | Phantom { .. }
            | IdentityMismatch { .. } | GenerationSkew { .. } | DecompressionFailed { .. } => {
                ErrorClass::Integrity
            }
            ReadOnly | AccessDenied { .. } | Immutable { .. } | Tombstoned { .. }
            | AppendViolation { .. } | TamperEvidence { .. } | ObjectExists { .. } => {
                ErrorClass::Policy
            }
            ObjectNotFound { .. } => ErrorClass::NotFound,
            CommitContention { .. } | InjectedCrash { .. } => ErrorClass::Transient,
            InvalidConfig { .. } => ErrorClass::Config,
        }
    }

    /// Severity rank; higher means more actionable.
    ///
    /// Hardware and memory-safety failures outrank integrity failures, which
    /// outrank policy and capacity, which outrank not-found.
    pub fn severity(&self) -> u8 {
        match self.class() {
            ErrorClass::Hardware => 5,
            ErrorClass::Integrity => 4,
            ErrorClass::Policy | ErrorClass::Capacity => 3,
            ErrorClass::Transient | ErrorClass::Config => 2,
            ErrorClass::NotFound => 1,
        }
    }

    /// Keeps whichever of `current` and `candidate` is more severe.
    ///
    /// Ties keep the earlier error.
    pub fn most_severe(current: Option<Hn4Error>, candidate: Hn4Error) -> Hn4Error {
        match current {
            Some(existing) if existing.severity() >= candidate.severity() => existing,
            _ => candidate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hn4_result_alias() {
        let ok: Hn4Result<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: Hn4Result<i32> = Err(Hn4Error::CapacityCollapse);
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::Other, "media gone");
        let err: Hn4Error = std_err.into();
        assert!(matches!(err, Hn4Error::Io(_)));
        assert_eq!(err.class(), ErrorClass::Hardware);
    }

    #[test]
    fn test_classes() {
        assert_eq!(
            Hn4Error::BitmapCorruption { word: 3 }.class(),
            ErrorClass::Integrity
        );
        assert_eq!(
            Hn4Error::HorizonExhausted { probes: 4 }.class(),
            ErrorClass::Capacity
        );
        assert_eq!(
            Hn4Error::TamperEvidence { lba: 9 }.class(),
            ErrorClass::Policy
        );
        assert_eq!(
            Hn4Error::ObjectNotFound { id: 1 }.class(),
            ErrorClass::NotFound
        );
    }

    #[test]
    fn test_severity_ordering() {
        let hw = Hn4Error::DeviceError {
            reason: "link down".to_string(),
        };
        let integrity = Hn4Error::HeaderRot { lba: 7 };
        let missing = Hn4Error::ObjectNotFound { id: 1 };
        assert!(hw.severity() > integrity.severity());
        assert!(integrity.severity() > missing.severity());
    }

    #[test]
    fn test_most_severe_keeps_hardware() {
        let first = Hn4Error::Phantom { lba: 1 };
        let picked = Hn4Error::most_severe(None, first);
        let picked = Hn4Error::most_severe(
            Some(picked),
            Hn4Error::DeviceError {
                reason: "timeout".to_string(),
            },
        );
        let picked = Hn4Error::most_severe(Some(picked), Hn4Error::HeaderRot { lba: 2 });
        assert!(matches!(picked, Hn4Error::DeviceError { .. }));
    }

    #[test]
    fn test_most_severe_tie_keeps_first() {
        let picked = Hn4Error::most_severe(
            Some(Hn4Error::Phantom { lba: 1 }),
            Hn4Error::HeaderRot { lba: 2 },
        );
        assert!(matches!(picked, Hn4Error::Phantom { lba: 1 }));
    }

    #[test]
    fn test_payload_rot_display() {
        let err = Hn4Error::PayloadRot {
            lba: 100,
            expected: 0xDEADBEEF,
            actual: 0xCAFEBABE,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0xdeadbeef"));
        assert!(msg.contains("0xcafebabe"));
    }

    #[test]
    fn test_not_aligned_display() {
        let err = Hn4Error::NotAligned {
            offset: 100,
            alignment: 512,
        };
        assert_eq!(
            format!("{}", err),
            "Not aligned: offset 100 is not aligned to 512"
        );
    }
}
