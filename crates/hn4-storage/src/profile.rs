//! Device class profiles and the per-volume device context.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::device::DeviceCaps;

/// Media class. Selects a [`Profile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// NVMe flash
    Nvme,
    /// SATA/SAS flash
    #[default]
    Ssd,
    /// Byte-addressable persistent memory
    Pmem,
    /// Removable flash with weak controllers
    Usb,
    /// Rotational disk
    Hdd,
    /// Zoned namespace / append-only media
    Zns,
}

impl DeviceClass {
    /// All classes, in table order.
    pub const ALL: [DeviceClass; 6] = [
        DeviceClass::Nvme,
        DeviceClass::Ssd,
        DeviceClass::Pmem,
        DeviceClass::Usb,
        DeviceClass::Hdd,
        DeviceClass::Zns,
    ];

    /// Tuning profile of this class.
    pub fn profile(self) -> &'static Profile {
        &PROFILES[self as usize]
    }
}

impl std::str::FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nvme" => Ok(DeviceClass::Nvme),
            "ssd" => Ok(DeviceClass::Ssd),
            "pmem" => Ok(DeviceClass::Pmem),
            "usb" => Ok(DeviceClass::Usb),
            "hdd" => Ok(DeviceClass::Hdd),
            "zns" => Ok(DeviceClass::Zns),
            other => Err(format!("unknown device class '{}'", other)),
        }
    }
}

/// Device-tuned constants for placement and read scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Profile {
    /// Seek-expensive or append-only media
    pub sequential: bool,
    /// Highest collision index the write path tries
    pub max_k: u8,
    /// Collision index at which the orbit vector is rotated
    pub k_rotate_threshold: u8,
    /// Slots between successive collision indices (0 disables jitter)
    pub jitter_stride: u64,
    /// Genesis probe budget
    pub probe_budget: u32,
    /// Free blocks required after a genesis gravity center
    pub genesis_run: u64,
    /// Highest collision index the read path scans
    pub read_depth: u8,
    /// Sort read candidates by physical address
    pub sort_candidates: bool,
    /// Read every allocated candidate before validating
    pub prefetch: bool,
    /// Base of the exponential back-off between failed reads
    pub base_backoff_us: u64,
    /// Writes go to the horizon ring only
    pub horizon_only: bool,
}

const PROFILES: [Profile; 6] = [
    // Nvme
    Profile {
        sequential: false,
        max_k: 11,
        k_rotate_threshold: 12,
        jitter_stride: 16,
        probe_budget: 16,
        genesis_run: 4,
        read_depth: 11,
        sort_candidates: false,
        prefetch: true,
        base_backoff_us: 0,
        horizon_only: false,
    },
    // Ssd
    Profile {
        sequential: false,
        max_k: 11,
        k_rotate_threshold: 12,
        jitter_stride: 16,
        probe_budget: 32,
        genesis_run: 4,
        read_depth: 11,
        sort_candidates: false,
        prefetch: true,
        base_backoff_us: 0,
        horizon_only: false,
    },
    // Pmem
    Profile {
        sequential: false,
        max_k: 11,
        k_rotate_threshold: 12,
        jitter_stride: 16,
        probe_budget: 16,
        genesis_run: 2,
        read_depth: 11,
        sort_candidates: false,
        prefetch: false,
        base_backoff_us: 0,
        horizon_only: false,
    },
    // Usb
    Profile {
        sequential: false,
        max_k: 7,
        k_rotate_threshold: 6,
        jitter_stride: 4,
        probe_budget: 64,
        genesis_run: 8,
        read_depth: 7,
        sort_candidates: false,
        prefetch: false,
        base_backoff_us: 50,
        horizon_only: false,
    },
    // Hdd
    Profile {
        sequential: true,
        max_k: 1,
        k_rotate_threshold: 1,
        jitter_stride: 0,
        probe_budget: 128,
        genesis_run: 16,
        read_depth: 1,
        sort_candidates: true,
        prefetch: false,
        base_backoff_us: 200,
        horizon_only: false,
    },
    // Zns
    Profile {
        sequential: true,
        max_k: 0,
        k_rotate_threshold: 1,
        jitter_stride: 0,
        probe_budget: 64,
        genesis_run: 16,
        read_depth: 0,
        sort_candidates: true,
        prefetch: false,
        base_backoff_us: 100,
        horizon_only: true,
    },
];

/// Per-volume device state: capability cache, tuning, PRNG and clock.
pub struct DeviceContext {
    caps: DeviceCaps,
    class: DeviceClass,
    profile: Profile,
    rng: Mutex<StdRng>,
    epoch: Instant,
}

impl DeviceContext {
    /// Builds a context. `class` overrides the class the device reports;
    /// `system_profile` disables jitter; `seed` makes the PRNG deterministic.
    pub fn new(
        caps: DeviceCaps,
        class: Option<DeviceClass>,
        system_profile: bool,
        seed: Option<u64>,
    ) -> Self {
        let class = class.unwrap_or(caps.class);
        let mut profile = *class.profile();
        if system_profile {
            profile.jitter_stride = 0;
        }
        if caps.zoned {
            profile.horizon_only = true;
            profile.sequential = true;
        }
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            caps,
            class,
            profile,
            rng: Mutex::new(rng),
            epoch: Instant::now(),
        }
    }

    /// Cached device capabilities.
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    /// Effective device class.
    pub fn class(&self) -> DeviceClass {
        self.class
    }

    /// Effective tuning profile.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Uniform random value in `0..bound`; 0 when `bound` is 0.
    pub fn random_below(&self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.rng.lock().gen_range(0..bound)
    }

    /// Random 64-bit value.
    pub fn random_u64(&self) -> u64 {
        self.rng.lock().gen()
    }

    /// Time elapsed since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Addr;

    fn caps(class: DeviceClass) -> DeviceCaps {
        DeviceCaps {
            sector_size: 4096,
            total_sectors: Addr::from_u64(1024),
            class,
            zoned: false,
            persistent_memory: false,
        }
    }

    #[test]
    fn test_table_order_matches_enum() {
        for class in DeviceClass::ALL {
            let p = class.profile();
            assert!(p.read_depth >= p.max_k, "{:?} cannot read its own writes", class);
        }
        assert!(DeviceClass::Hdd.profile().sequential);
        assert!(DeviceClass::Zns.profile().horizon_only);
        assert_eq!(DeviceClass::Ssd.profile().jitter_stride, 16);
    }

    #[test]
    fn test_seek_expensive_media_search_deeper() {
        assert!(DeviceClass::Hdd.profile().probe_budget > DeviceClass::Nvme.profile().probe_budget);
        assert!(DeviceClass::Hdd.profile().read_depth < DeviceClass::Nvme.profile().read_depth);
    }

    #[test]
    fn test_system_profile_disables_jitter() {
        let ctx = DeviceContext::new(caps(DeviceClass::Ssd), None, true, Some(1));
        assert_eq!(ctx.profile().jitter_stride, 0);
    }

    #[test]
    fn test_class_override_and_zoned_caps() {
        let ctx = DeviceContext::new(caps(DeviceClass::Ssd), Some(DeviceClass::Hdd), false, None);
        assert_eq!(ctx.class(), DeviceClass::Hdd);
        let mut zoned = caps(DeviceClass::Ssd);
        zoned.zoned = true;
        let ctx = DeviceContext::new(zoned, None, false, None);
        assert!(ctx.profile().horizon_only);
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let a = DeviceContext::new(caps(DeviceClass::Ssd), None, false, Some(42));
        let b = DeviceContext::new(caps(DeviceClass::Ssd), None, false, Some(42));
        for _ in 0..8 {
            assert_eq!(a.random_below(1000), b.random_below(1000));
        }
        assert_eq!(a.random_below(0), 0);
    }

    #[test]
    fn test_parse_class() {
        assert_eq!("HDD".parse::<DeviceClass>().unwrap(), DeviceClass::Hdd);
        assert!("floppy".parse::<DeviceClass>().is_err());
    }
}
