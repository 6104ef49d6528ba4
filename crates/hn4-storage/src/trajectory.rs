//! Ballistic trajectory addressing.
//!
//! [`locate`] maps (gravity center, orbit vector, logical index, fractal
//! scale, collision index) to a physical block of the flux region. It is a
//! pure function shared by allocation, reads, writes and repair; the same
//! inputs always give the same block.
//!
//! The flux window is aligned to the stride `S = 2^M` and split into
//! `Φ = usable >> M` fractal slots. Logical blocks are grouped in clusters of
//! 16: the cluster index `N >> 4` is multiplied by the orbit vector modulo Φ,
//! and the in-cluster lane `N & 15` is added so neighbours stay adjacent.
//! Successive collision indices are pushed apart by a triangular jitter.

use serde::{Deserialize, Serialize};

use crate::address::wide;
use crate::profile::Profile;

/// Sentinel returned for any invalid input or overflow.
pub const INVALID_LBA: u64 = u64::MAX;
/// Highest collision index.
pub const MAX_TRAJECTORY_K: u8 = 11;
/// Highest fractal scale accepted.
pub const MAX_FRACTAL_SCALE: u8 = 16;
/// Product of the projection primes and 2. Windows whose size divides a
/// power of this product's primes get a collision-free orbit.
pub const COPRIME_CYCLE_BOUND: u64 = 30_030;
/// Orbit vectors are 48 bits wide.
pub const ORBIT_MASK: u64 = (1 << 48) - 1;

const ORBIT_SALT: u64 = 0x9E37_79B9_7F4A;
const ORBIT_ROTATION: u32 = 17;
const SMALL_PRIMES: [u64; 5] = [3, 5, 7, 11, 13];
const LANES: u64 = 16;
const THETA: [u64; MAX_TRAJECTORY_K as usize + 1] = [0, 1, 3, 6, 10, 15, 21, 28, 36, 45, 55, 66];

/// Flux window of a volume, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// First block of the flux region
    pub flux_start: u64,
    /// Number of blocks in the flux region
    pub flux_blocks: u64,
}

impl Geometry {
    /// Aligned window base and slot count for scale `m`, or `None` if the
    /// window holds no slot.
    pub fn window(&self, m: u8) -> Option<(u64, u64)> {
        if m > MAX_FRACTAL_SCALE {
            return None;
        }
        let stride = 1u64 << m;
        let end = self.flux_start.checked_add(self.flux_blocks)?;
        let base = self.flux_start.checked_add(stride - 1)? & !(stride - 1);
        if base >= end {
            return None;
        }
        let phi = (end - base) >> m;
        if phi == 0 {
            None
        } else {
            Some((base, phi))
        }
    }
}

/// Profile-derived tuning for [`locate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrajectoryParams {
    /// Collision index from which the orbit vector is rotated
    pub k_rotate_threshold: u8,
    /// Slots per triangular jitter step; 0 disables jitter
    pub jitter_stride: u64,
}

impl From<&Profile> for TrajectoryParams {
    fn from(p: &Profile) -> Self {
        Self {
            k_rotate_threshold: p.k_rotate_threshold,
            jitter_stride: p.jitter_stride,
        }
    }
}

/// One candidate physical location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Physical block
    pub lba: u64,
    /// Collision index that produced it
    pub k: u8,
}

/// Forces `v` odd and steps it by 2 until it shares none of the small
/// primes with `phi`.
fn project_coprime(v: u64, phi: u64) -> u64 {
    let mut v = v | 1;
    while SMALL_PRIMES.iter().any(|&p| phi % p == 0 && v % p == 0) {
        v += 2;
    }
    v
}

fn rotate_orbit(v: u64) -> u64 {
    let rotated = ((v << ORBIT_ROTATION) | (v >> (48 - ORBIT_ROTATION))) & ORBIT_MASK;
    (rotated ^ ORBIT_SALT) & ORBIT_MASK
}

/// Effective orbit vector for window size `phi` at collision index `k`.
pub fn effective_orbit(v: u64, phi: u64, k: u8, params: &TrajectoryParams) -> u64 {
    let mut v = v & ORBIT_MASK;
    if k >= params.k_rotate_threshold {
        v = rotate_orbit(v);
    }
    project_coprime(v, phi)
}

/// Physical block for logical block `n` at collision index `k`.
///
/// `g` is the gravity center relative to the flux window. Returns
/// [`INVALID_LBA`] when `m` or `k` is out of range, the window is empty, or
/// any step overflows.
pub fn locate(
    geo: &Geometry,
    g: u64,
    v: u64,
    n: u64,
    m: u8,
    k: u8,
    params: &TrajectoryParams,
) -> u64 {
    if k > MAX_TRAJECTORY_K {
        return INVALID_LBA;
    }
    let Some((base, phi)) = geo.window(m) else {
        return INVALID_LBA;
    };
    let stride = 1u64 << m;

    let g_fractal = (g >> m) % phi;
    let g_rem = g & (stride - 1);

    let orbit = effective_orbit(v, phi, k, params);
    let offset = wide::mul_mod(n >> 4, orbit, phi);
    let lane = n & (LANES - 1);
    let jitter = THETA[k as usize].saturating_mul(params.jitter_stride);

    let rel = ((u128::from(g_fractal)
        + u128::from(offset)
        + u128::from(lane)
        + u128::from(jitter))
        % u128::from(phi)) as u64;

    rel.checked_mul(stride)
        .and_then(|r| r.checked_add(g_rem))
        .and_then(|r| base.checked_add(r))
        .unwrap_or(INVALID_LBA)
}

/// Candidates for `k = 0..=max_k`, skipping invalid results.
pub fn candidates(
    geo: &Geometry,
    g: u64,
    v: u64,
    n: u64,
    m: u8,
    max_k: u8,
    params: &TrajectoryParams,
) -> Vec<Candidate> {
    (0..=max_k.min(MAX_TRAJECTORY_K))
        .map(|k| Candidate {
            lba: locate(geo, g, v, n, m, k, params),
            k,
        })
        .filter(|c| c.lba != INVALID_LBA)
        .collect()
}
