//! SEC-DED code for 64-bit bitmap words.
//!
//! Code byte layout:
//!
//! | bits | meaning |
//! |------|---------|
//! | 0..=5 | Hamming parity over the position groups {1, 2, 4, 8, 16, 32} |
//! | 6 | copy of data bit 63 |
//! | 7 | overall parity of `data ^ (code & 0x3F)` |
//!
//! Data bit `i` (for `i < 63`) sits at Hamming position `i + 1`, so the six
//! parity bits address bits 0..=62. Bit 63 is covered by its copy in code
//! bit 6, which stays out of the overall parity; a flip of data bit 63 then
//! shows up as a single error instead of a double one.
//!
//! A lone flip of Hamming bit `j` has the same signature as a flip of data
//! bit `2^j - 1` and is repaired as the latter.

use serde::{Deserialize, Serialize};

/// Number of Hamming parity bits.
pub const HAMMING_BITS: u32 = 6;

/// Code bit holding the copy of data bit 63.
pub const MIRROR_BIT: u32 = 6;

const HAMMING_MASK: u8 = 0x3F;
const MIRROR: u8 = 1 << MIRROR_BIT;
const OVERALL_PARITY: u8 = 1 << 7;

const fn build_parity_masks() -> [u64; HAMMING_BITS as usize] {
    let mut masks = [0u64; HAMMING_BITS as usize];
    let mut j = 0;
    while j < HAMMING_BITS as usize {
        let mut i = 0;
        while i < 63 {
            if (i + 1) & (1 << j) != 0 {
                masks[j] |= 1u64 << i;
            }
            i += 1;
        }
        j += 1;
    }
    masks
}

const PARITY_MASKS: [u64; HAMMING_BITS as usize] = build_parity_masks();

/// Outcome of a successful decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EccStatus {
    /// Data and code were consistent.
    Clean,
    /// A single flipped bit was repaired (in the data or in the code).
    Corrected,
}

/// Decoded word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EccDecoded {
    /// Data after correction.
    pub data: u64,
    /// Whether a correction happened.
    pub status: EccStatus,
}

/// Two or more bits are flipped; the word cannot be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uncorrectable {
    /// Hamming syndrome in bits 0..=5, mirror mismatch in bit 6.
    pub syndrome: u8,
}

#[inline]
fn hamming(data: u64) -> u8 {
    let mut code = 0u8;
    for (j, mask) in PARITY_MASKS.iter().enumerate() {
        code |= (((data & mask).count_ones() & 1) as u8) << j;
    }
    code
}

#[inline]
fn parity_of(data: u64, code: u8) -> u8 {
    ((data ^ u64::from(code & HAMMING_MASK)).count_ones() & 1) as u8
}

/// Computes the 8-bit ECC for a data word.
#[inline]
pub fn encode(data: u64) -> u8 {
    let code = hamming(data) | (((data >> 63) as u8) << MIRROR_BIT);
    code | (parity_of(data, code) << 7)
}

/// Checks `data` against `code`, repairing a single flipped bit.
#[inline]
pub fn decode_and_fix(data: u64, code: u8) -> Result<EccDecoded, Uncorrectable> {
    let syndrome = (hamming(data) ^ code) & HAMMING_MASK;
    let mirror = ((data >> 63) as u8) ^ ((code & MIRROR) >> MIRROR_BIT);
    let parity_odd = parity_of(data, code) != (code & OVERALL_PARITY) >> 7;

    let fixed = match (syndrome, mirror, parity_odd) {
        (0, 0, false) => {
            return Ok(EccDecoded {
                data,
                status: EccStatus::Clean,
            })
        }
        // Overall parity bit or the mirror bit itself flipped.
        (0, 0, true) | (0, 1, false) => data,
        (0, 1, true) => data ^ (1 << 63),
        (s, 0, true) => data ^ (1u64 << (s - 1)),
        (s, m, _) => {
            return Err(Uncorrectable {
                syndrome: s | (m << MIRROR_BIT),
            })
        }
    };
    Ok(EccDecoded {
        data: fixed,
        status: EccStatus::Corrected,
    })
}

/// Returns whether `code` has the overall parity bit set (diagnostics).
pub fn overall_parity(code: u8) -> bool {
    code & OVERALL_PARITY != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: [u64; 8] = [
        0,
        u64::MAX,
        1,
        1 << 63,
        0xDEAD_BEEF_CAFE_BABE,
        0x5555_5555_5555_5555,
        0xAAAA_AAAA_AAAA_AAAA,
        0x0123_4567_89AB_CDEF,
    ];

    #[test]
    fn test_zero_word_has_zero_code() {
        assert_eq!(encode(0), 0);
    }

    #[test]
    fn test_mirror_bit_copies_data_bit_63() {
        for &d in SAMPLES.iter().chain([1u64 << 57, (1 << 63) | 1].iter()) {
            assert_eq!(u64::from((encode(d) >> 6) & 1), d >> 63, "{:#x}", d);
        }
        assert_eq!(encode(1 << 57) & MIRROR, 0);
    }

    #[test]
    fn test_overall_parity_masks_mirror_bit() {
        // Bit 63 alone: no Hamming bits, mirror set, parity odd over data only.
        assert_eq!(encode(1 << 63), MIRROR | OVERALL_PARITY);
        // Bit 0 sits at position 1: Hamming bit 0 set, data and code cancel.
        assert_eq!(encode(1), 0b0000_0001);
    }

    #[test]
    fn test_clean_roundtrip() {
        for &d in SAMPLES.iter() {
            let out = decode_and_fix(d, encode(d)).unwrap();
            assert_eq!(out.data, d);
            assert_eq!(out.status, EccStatus::Clean);
        }
    }

    #[test]
    fn test_every_single_data_flip_is_corrected() {
        for &d in SAMPLES.iter() {
            let code = encode(d);
            for bit in 0..64 {
                let out = decode_and_fix(d ^ (1 << bit), code).unwrap();
                assert_eq!(out.data, d, "bit {} of {:#x}", bit, d);
                assert_eq!(out.status, EccStatus::Corrected);
            }
        }
    }

    #[test]
    fn test_bit_63_flip_is_single_error() {
        let d = 0x0F0F_0000_1234_5678;
        let out = decode_and_fix(d ^ (1 << 63), encode(d)).unwrap();
        assert_eq!(out.data, d);
        assert_eq!(out.status, EccStatus::Corrected);
    }

    #[test]
    fn test_mirror_and_parity_flips_keep_data() {
        for &d in SAMPLES.iter() {
            let code = encode(d);
            for bit in [6, 7] {
                let out = decode_and_fix(d, code ^ (1 << bit)).unwrap();
                assert_eq!(out.data, d);
                assert_eq!(out.status, EccStatus::Corrected);
            }
        }
    }

    #[test]
    fn test_hamming_bit_flip_aliases_data_position() {
        let d = 0xDEAD_BEEF_CAFE_BABE;
        let out = decode_and_fix(d, encode(d) ^ (1 << 3)).unwrap();
        assert_eq!(out.data, d ^ (1 << 7));
        assert_eq!(out.status, EccStatus::Corrected);
    }

    #[test]
    fn test_double_data_flips_are_uncorrectable() {
        let d = 0xDEAD_BEEF_CAFE_BABE;
        let code = encode(d);
        for a in 0..64u32 {
            for b in (a + 1)..64u32 {
                assert!(
                    decode_and_fix(d ^ (1 << a) ^ (1 << b), code).is_err(),
                    "double flip {} {} went undetected",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_data_flip_with_mirror_flip_is_uncorrectable() {
        let d = 0x0123_4567_89AB_CDEF;
        let err = decode_and_fix(d ^ (1 << 5), encode(d) ^ MIRROR).unwrap_err();
        assert_eq!(err.syndrome, 6 | MIRROR);
    }

    #[test]
    fn test_overall_parity_helper() {
        assert!(!overall_parity(0));
        assert!(overall_parity(0x80));
    }
}
