//! Property-based tests for hn4-storage using proptest.
//!
//! These tests check invariants of the pure building blocks (ECC, trajectory
//! math, header codec, bitmap accounting) over generated inputs.

use hn4_storage::{
    address::wide,
    bitmap::Bitmap,
    ecc::{self, EccStatus},
    header::{BlockHeader, CompressionMeta},
    locate, Addr, Codec, DeviceClass, Geometry, Hn4Error, TrajectoryParams, INVALID_LBA,
};
use proptest::prelude::*;
use std::collections::HashSet;

fn ssd() -> TrajectoryParams {
    TrajectoryParams::from(DeviceClass::Ssd.profile())
}

/// Generator for block headers.
fn any_header() -> impl Strategy<Value = BlockHeader> {
    (
        any::<u128>(),
        any::<u64>(),
        any::<u32>(),
        any::<u32>(),
        prop_oneof![Just(Codec::None), Just(Codec::Lz4)],
        0u32..4048,
    )
        .prop_map(|(owner, index, generation, payload_crc, codec, stored_len)| BlockHeader {
            owner,
            index,
            generation,
            payload_crc,
            compression: CompressionMeta { codec, stored_len },
        })
}

proptest! {
    /// Any single flip of a data bit, the mirror bit or the parity bit is repaired.
    #[test]
    fn test_ecc_corrects_any_single_flip(data in any::<u64>(), bit in 0u32..66) {
        let code = ecc::encode(data);
        let (d, c) = if bit < 64 {
            (data ^ (1u64 << bit), code)
        } else {
            (data, code ^ (1u8 << (bit - 58)))
        };
        let decoded = ecc::decode_and_fix(d, c).unwrap();
        prop_assert_eq!(decoded.data, data);
        prop_assert_eq!(decoded.status, EccStatus::Corrected);
    }

    /// Any two distinct data flips are reported, never miscorrected.
    #[test]
    fn test_ecc_detects_double_flip(data in any::<u64>(), a in 0u32..64, b in 0u32..64) {
        prop_assume!(a != b);
        let code = ecc::encode(data);
        prop_assert!(ecc::decode_and_fix(data ^ (1u64 << a) ^ (1u64 << b), code).is_err());
    }

    /// Code bit 6 always mirrors data bit 63.
    #[test]
    fn test_ecc_mirror_bit(data in any::<u64>()) {
        prop_assert_eq!(u64::from((ecc::encode(data) >> 6) & 1), data >> 63);
    }

    /// mul_mod agrees with reduced-operand arithmetic and stays below m.
    #[test]
    fn test_mul_mod_in_range(a in any::<u64>(), b in any::<u64>(), m in 1u64..) {
        let r = wide::mul_mod(a, b, m);
        prop_assert!(r < m);
        let reduced = (u128::from(a % m) * u128::from(b % m) % u128::from(m)) as u64;
        prop_assert_eq!(r, reduced);
    }

    /// Narrowing fails exactly when the high word is nonzero.
    #[test]
    fn test_narrow_never_wraps(hi in any::<u64>(), lo in any::<u64>()) {
        let v = (u128::from(hi) << 64) | u128::from(lo);
        match wide::narrow(v) {
            Some(n) => {
                prop_assert_eq!(hi, 0);
                prop_assert_eq!(n, lo);
            }
            None => prop_assert_ne!(hi, 0),
        }
    }

    /// Address addition reports overflow instead of truncating.
    #[test]
    fn test_addr_add_never_truncates(a in any::<u64>(), b in any::<u64>()) {
        let sum = Addr::from_u64(a).checked_add_u64(b);
        match a.checked_add(b) {
            Some(exact) => prop_assert_eq!(sum.and_then(Addr::try_to_u64), Some(exact)),
            None => prop_assert!(sum.and_then(Addr::try_to_u64).is_none()),
        }
        let (wide_sum, carry) = wide::add_carry(u128::from(a), u128::from(b));
        prop_assert!(!carry);
        prop_assert_eq!(wide_sum, u128::from(a) + u128::from(b));
    }

    /// locate stays inside the flux window and is deterministic.
    #[test]
    fn test_locate_in_window(
        flux_start in 1u64..10_000,
        flux_blocks in 1u64..1_000_000,
        g in any::<u64>(),
        v in any::<u64>(),
        n in any::<u64>(),
        m in 0u8..=16,
        k in 0u8..=11,
    ) {
        let geo = Geometry { flux_start, flux_blocks };
        let lba = locate(&geo, g, v, n, m, k, &ssd());
        prop_assert_eq!(lba, locate(&geo, g, v, n, m, k, &ssd()));
        if lba != INVALID_LBA {
            prop_assert!(lba >= flux_start);
            prop_assert!(lba < flux_start + flux_blocks);
        } else {
            prop_assert!(geo.window(m).is_none());
        }
    }

    /// Collision indices 0..=11 give pairwise distinct blocks on windows
    /// wider than the largest jitter offset.
    #[test]
    fn test_collision_indices_distinct(
        phi in 1_057u64..200_000,
        g in any::<u64>(),
        v in any::<u64>(),
        n in any::<u64>(),
    ) {
        let geo = Geometry { flux_start: 0, flux_blocks: phi };
        let seen: HashSet<u64> = (0..=11u8)
            .map(|k| locate(&geo, g, v, n, 0, k, &ssd()))
            .collect();
        prop_assert_eq!(seen.len(), 12);
    }

    /// Consecutive blocks of one cluster land on consecutive slots.
    #[test]
    fn test_cluster_lanes_adjacent(
        phi in 64u64..100_000,
        g in any::<u64>(),
        v in any::<u64>(),
        cluster in 0u64..1_000_000,
    ) {
        let geo = Geometry { flux_start: 0, flux_blocks: phi };
        let first = locate(&geo, g, v, cluster * 16, 0, 0, &ssd());
        let second = locate(&geo, g, v, cluster * 16 + 1, 0, 0, &ssd());
        prop_assert_eq!(second, (first + 1) % phi);
    }

    /// Any single flipped header bit is caught by the header CRC.
    #[test]
    fn test_header_bit_flip_detected(h in any_header(), bit in 0usize..(48 * 8)) {
        let mut raw = h.encode();
        prop_assert_eq!(BlockHeader::decode(&raw, 0).unwrap(), h);
        raw[bit / 8] ^= 1 << (bit % 8);
        let is_rot = matches!(BlockHeader::decode(&raw, 0), Err(Hn4Error::HeaderRot { .. }));
        prop_assert!(is_rot);
    }

    /// used_blocks tracks a set-based model under arbitrary set/clear sequences.
    #[test]
    fn test_bitmap_matches_model(ops in proptest::collection::vec((any::<bool>(), 0u64..500), 1..300)) {
        let bm = Bitmap::new(500);
        let mut model = HashSet::new();
        for (set, block) in ops {
            if set {
                prop_assert_eq!(bm.set(block).unwrap(), model.insert(block));
            } else {
                prop_assert_eq!(bm.clear(block).unwrap(), model.remove(&block));
            }
        }
        prop_assert_eq!(bm.used_blocks(), model.len() as u64);
        for block in 0..500 {
            prop_assert_eq!(bm.test(block).unwrap(), model.contains(&block));
        }
    }
}
