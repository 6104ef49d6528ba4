//! Block images: header plus stored payload, zero-padded to the block size.

use crate::compression;
use crate::error::{Hn4Error, Hn4Result};
use crate::header::{BlockHeader, Codec, CompressionMeta};

/// Usable payload bytes in a block of `block_size` bytes.
pub fn payload_capacity(block_size: usize) -> usize {
    block_size.saturating_sub(BlockHeader::SIZE)
}

/// Allocates a zeroed buffer, reporting allocation failure instead of aborting.
pub fn alloc_buffer(len: usize) -> Hn4Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Hn4Error::OutOfMemory { bytes: len })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// Identity a block image is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockIdentity {
    /// Owning object
    pub owner: u128,
    /// Logical block index
    pub index: u64,
    /// Generation stamped into the header
    pub generation: u32,
}

/// Builds a full block image. With `compress` set, the payload is stored
/// LZ4-compressed when that makes it smaller.
pub fn build_image(
    block_size: usize,
    id: BlockIdentity,
    payload: &[u8],
    compress: bool,
) -> Hn4Result<Vec<u8>> {
    let capacity = payload_capacity(block_size);
    if payload.len() > capacity {
        return Err(Hn4Error::PayloadTooLarge {
            len: payload.len(),
            capacity,
        });
    }

    let packed = if compress {
        compression::compress_if_smaller(payload)
    } else {
        None
    };
    let (codec, stored): (Codec, &[u8]) = match &packed {
        Some(p) => (Codec::Lz4, p.as_slice()),
        None => (Codec::None, payload),
    };

    let header = BlockHeader {
        owner: id.owner,
        index: id.index,
        generation: id.generation,
        payload_crc: crc32fast::hash(stored),
        compression: CompressionMeta {
            codec,
            stored_len: stored.len() as u32,
        },
    };

    let mut image = alloc_buffer(block_size)?;
    image[..BlockHeader::SIZE].copy_from_slice(&header.encode());
    image[BlockHeader::SIZE..BlockHeader::SIZE + stored.len()].copy_from_slice(stored);
    Ok(image)
}

/// What a reader expects to find in a candidate block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    /// Owning object
    pub owner: u128,
    /// Logical block index
    pub index: u64,
    /// Committed generation of the object; newer blocks are rejected
    pub committed: u32,
    /// Object is encrypted; compressed payloads are tamper evidence
    pub encrypted: bool,
}

/// A candidate that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidBlock {
    /// Verified header
    pub header: BlockHeader,
    /// Decoded payload
    pub data: Vec<u8>,
}

/// Validates a block image read from `lba`.
///
/// Checks run in order: poison and header CRC, owner and index, generation,
/// payload CRC, tamper evidence, decompression.
pub fn validate(image: &[u8], lba: u64, expect: &Expectation) -> Hn4Result<ValidBlock> {
    let header = BlockHeader::decode(image, lba)?;

    if header.owner != expect.owner || header.index != expect.index {
        return Err(Hn4Error::IdentityMismatch {
            lba,
            owner: header.owner,
            index: header.index,
        });
    }
    if header.generation > expect.committed {
        return Err(Hn4Error::GenerationSkew {
            lba,
            found: u64::from(header.generation),
            committed: u64::from(expect.committed),
        });
    }

    let capacity = payload_capacity(image.len());
    let stored_len = header.compression.stored_len as usize;
    if stored_len > capacity {
        return Err(Hn4Error::HeaderRot { lba });
    }
    let stored = &image[BlockHeader::SIZE..BlockHeader::SIZE + stored_len];
    let actual = crc32fast::hash(stored);
    if actual != header.payload_crc {
        return Err(Hn4Error::PayloadRot {
            lba,
            expected: header.payload_crc,
            actual,
        });
    }

    if expect.encrypted && header.compression.codec != Codec::None {
        return Err(Hn4Error::TamperEvidence { lba });
    }

    let data = compression::decompress(stored, header.compression.codec, capacity, lba)?;
    Ok(ValidBlock { header, data })
}
