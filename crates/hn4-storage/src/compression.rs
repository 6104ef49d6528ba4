//! LZ4 payload codec.

use crate::error::{Hn4Error, Hn4Result};
use crate::header::Codec;

/// Compresses `data`, returning `None` unless the result is strictly smaller.
pub fn compress_if_smaller(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }
    let packed = lz4_flex::compress_prepend_size(data);
    if packed.len() < data.len() {
        Some(packed)
    } else {
        None
    }
}

/// Decodes a stored payload of block `lba`. Decoded output larger than
/// `limit` bytes is rejected before any allocation.
pub fn decompress(stored: &[u8], codec: Codec, limit: usize, lba: u64) -> Hn4Result<Vec<u8>> {
    match codec {
        Codec::None => Ok(stored.to_vec()),
        Codec::Lz4 => {
            if stored.len() < 4 {
                return Err(Hn4Error::DecompressionFailed {
                    lba,
                    reason: "missing size prefix".to_string(),
                });
            }
            let declared = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]) as usize;
            if declared > limit {
                return Err(Hn4Error::DecompressionFailed {
                    lba,
                    reason: format!("declared size {} exceeds {}", declared, limit),
                });
            }
            lz4_flex::decompress_size_prepended(stored).map_err(|e| Hn4Error::DecompressionFailed {
                lba,
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetitive_data_compresses() {
        let data = vec![b'a'; 4000];
        let packed = compress_if_smaller(&data).unwrap();
        assert!(packed.len() < 200);
        assert_eq!(decompress(&packed, Codec::Lz4, 4048, 0).unwrap(), data);
    }

    #[test]
    fn test_incompressible_data_is_left_alone() {
        let data: Vec<u8> = (0..256u32).map(|i| (i.wrapping_mul(197) ^ 0x5A) as u8).collect();
        assert!(compress_if_smaller(&data[..8]).is_none());
        assert!(compress_if_smaller(&[]).is_none());
    }

    #[test]
    fn test_declared_size_limit() {
        let packed = compress_if_smaller(&vec![0u8; 8000]).unwrap();
        assert!(matches!(
            decompress(&packed, Codec::Lz4, 4048, 3),
            Err(Hn4Error::DecompressionFailed { lba: 3, .. })
        ));
    }

    #[test]
    fn test_garbage_fails() {
        let garbage = [10u8, 0, 0, 0, 0xFF, 0xFF];
        assert!(decompress(&garbage, Codec::Lz4, 4048, 1).is_err());
        assert_eq!(decompress(&garbage, Codec::None, 4048, 1).unwrap(), garbage.to_vec());
    }
}
