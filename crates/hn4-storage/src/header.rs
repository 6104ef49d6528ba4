//! On-disk block header.
//!
//! Every data block starts with a 48-byte little-endian header:
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0  | 4  | magic `0x484E3442` ("HN4B") |
//! | 4  | 16 | owner identity |
//! | 20 | 8  | logical block index |
//! | 28 | 8  | generation (high 32 bits reserved, zero) |
//! | 36 | 4  | payload CRC-32 |
//! | 40 | 4  | compression metadata |
//! | 44 | 4  | header CRC-32 over bytes 0..44 |

use serde::{Deserialize, Serialize};

use crate::device::POISON_WORD;
use crate::error::{Hn4Error, Hn4Result};

const STORED_LEN_MASK: u32 = 0x0FFF_FFFF;
const CODEC_SHIFT: u32 = 28;

/// Payload codec tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Codec {
    /// Stored as-is
    #[default]
    None = 0,
    /// LZ4 block with prepended size
    Lz4 = 1,
}

/// Compression metadata: stored payload length packed with a codec tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CompressionMeta {
    /// Codec of the stored payload
    pub codec: Codec,
    /// Bytes of payload stored after the header
    pub stored_len: u32,
}

impl CompressionMeta {
    /// Packs into the on-disk 32-bit word.
    pub fn pack(&self) -> u32 {
        (self.stored_len & STORED_LEN_MASK) | ((self.codec as u32) << CODEC_SHIFT)
    }

    /// Unpacks the on-disk word; `None` for an unknown codec tag.
    pub fn unpack(raw: u32) -> Option<Self> {
        let codec = match raw >> CODEC_SHIFT {
            0 => Codec::None,
            1 => Codec::Lz4,
            _ => return None,
        };
        Some(Self {
            codec,
            stored_len: raw & STORED_LEN_MASK,
        })
    }
}

/// Block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHeader {
    /// Owning object
    pub owner: u128,
    /// Logical block index within the object
    pub index: u64,
    /// Object generation at write time
    pub generation: u32,
    /// CRC-32 of the stored payload
    pub payload_crc: u32,
    /// Stored length and codec
    pub compression: CompressionMeta,
}

impl BlockHeader {
    /// Magic number: 0x484E3442 = "HN4B"
    pub const MAGIC: u32 = 0x484E_3442;

    /// Size of the header in bytes
    pub const SIZE: usize = 48;

    /// Serializes the header, computing its CRC.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&Self::MAGIC.to_le_bytes());
        buf[4..20].copy_from_slice(&self.owner.to_le_bytes());
        buf[20..28].copy_from_slice(&self.index.to_le_bytes());
        buf[28..36].copy_from_slice(&u64::from(self.generation).to_le_bytes());
        buf[36..40].copy_from_slice(&self.payload_crc.to_le_bytes());
        buf[40..44].copy_from_slice(&self.compression.pack().to_le_bytes());
        let crc = crc32fast::hash(&buf[0..44]);
        buf[44..48].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses and verifies a header read from block `lba`.
    ///
    /// Poisoned or never-written blocks are reported as [`Hn4Error::Phantom`];
    /// any other magic, CRC, reserved-bit or codec defect is
    /// [`Hn4Error::HeaderRot`].
    pub fn decode(buf: &[u8], lba: u64) -> Hn4Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Hn4Error::HeaderRot { lba });
        }
        let first = u64::from_le_bytes(le(&buf[0..8]));
        let magic = u32::from_le_bytes(le(&buf[0..4]));
        if first == POISON_WORD || magic == 0 {
            return Err(Hn4Error::Phantom { lba });
        }
        if magic != Self::MAGIC {
            return Err(Hn4Error::HeaderRot { lba });
        }
        let stored_crc = u32::from_le_bytes(le(&buf[44..48]));
        if crc32fast::hash(&buf[0..44]) != stored_crc {
            return Err(Hn4Error::HeaderRot { lba });
        }
        let generation = u64::from_le_bytes(le(&buf[28..36]));
        let generation = u32::try_from(generation).map_err(|_| Hn4Error::HeaderRot { lba })?;
        let compression = CompressionMeta::unpack(u32::from_le_bytes(le(&buf[40..44])))
            .ok_or(Hn4Error::HeaderRot { lba })?;
        Ok(Self {
            owner: u128::from_le_bytes(le(&buf[4..20])),
            index: u64::from_le_bytes(le(&buf[20..28])),
            generation,
            payload_crc: u32::from_le_bytes(le(&buf[36..40])),
            compression,
        })
    }
}

fn le<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BlockHeader {
        BlockHeader {
            owner: 0x1111,
            index: 7,
            generation: 3,
            payload_crc: 0xCAFE_BABE,
            compression: CompressionMeta {
                codec: Codec::Lz4,
                stored_len: 1234,
            },
        }
    }

    #[test]
    fn test_header_size_and_magic_bytes() {
        let buf = sample().encode();
        assert_eq!(buf.len(), 48);
        assert_eq!(&buf[0..4], b"B4NH");
        assert_eq!(&buf[32..36], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_decode() {
        let h = sample();
        assert_eq!(BlockHeader::decode(&h.encode(), 9).unwrap(), h);
    }

    #[test]
    fn test_compression_meta_packing() {
        let m = CompressionMeta {
            codec: Codec::Lz4,
            stored_len: 4000,
        };
        assert_eq!(m.pack(), (1 << 28) | 4000);
        assert_eq!(CompressionMeta::unpack(m.pack()), Some(m));
        assert_eq!(CompressionMeta::unpack(0xF000_0000), None);
    }

    #[test]
    fn test_header_crc_detects_rot() {
        let mut buf = sample().encode();
        buf[21] ^= 0x10;
        assert!(matches!(
            BlockHeader::decode(&buf, 5),
            Err(Hn4Error::HeaderRot { lba: 5 })
        ));
    }

    #[test]
    fn test_poison_and_zero_are_phantom() {
        let mut poison = [0u8; 48];
        poison[0..8].copy_from_slice(&POISON_WORD.to_le_bytes());
        assert!(matches!(
            BlockHeader::decode(&poison, 1),
            Err(Hn4Error::Phantom { lba: 1 })
        ));
        assert!(matches!(
            BlockHeader::decode(&[0u8; 48], 2),
            Err(Hn4Error::Phantom { lba: 2 })
        ));
    }

    #[test]
    fn test_reserved_generation_bits_rejected() {
        let mut buf = sample().encode();
        buf[35] = 1;
        let crc = crc32fast::hash(&buf[0..44]);
        buf[44..48].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            BlockHeader::decode(&buf, 3),
            Err(Hn4Error::HeaderRot { .. })
        ));
    }

    #[test]
    fn test_short_buffer() {
        assert!(BlockHeader::decode(&[1u8; 10], 0).is_err());
    }
}
