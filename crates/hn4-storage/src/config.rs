//! Volume configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bitmap::BitmapMode;
use crate::capacity::SaturationConfig;
use crate::error::{Hn4Error, Hn4Result};
use crate::profile::DeviceClass;
use crate::trajectory::MAX_FRACTAL_SCALE;

/// When a write may skip the flush barrier before committing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityPolicy {
    /// Always flush before the generation commit
    #[default]
    Flush,
    /// Skip the flush on devices reporting persistent memory
    PersistentMemory,
}

/// Tunables of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Block size in bytes; a power of two and a multiple of the sector size
    pub block_size: u32,
    /// Share of the volume reserved for the horizon ring, in percent
    pub horizon_pct: u8,
    /// Usage percentage that enters saturation mode
    pub saturation_enter_pct: u8,
    /// Usage percentage below which saturation mode ends
    pub saturation_exit_pct: u8,
    /// Horizon claim probes before reporting exhaustion
    pub horizon_probe_limit: u32,
    /// Write protocol restarts before reporting contention
    pub max_commit_retries: u32,
    /// Flush policy of the write pipeline
    pub durability: DurabilityPolicy,
    /// Rewrite damaged read candidates with the winning image
    pub heal_on_read: bool,
    /// Compress payloads of objects flagged compressed
    pub compress_payloads: bool,
    /// Overrides the device class reported by the device
    pub device_class: Option<DeviceClass>,
    /// Disables trajectory jitter (system volumes)
    pub system_profile: bool,
    /// Seed for the placement PRNG; entropy when unset
    pub rng_seed: Option<u64>,
    /// Bitmap storage mode
    pub bitmap_mode: BitmapMode,
    /// Fractal scale given to new anchors
    pub default_fractal_scale: u8,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        let saturation = SaturationConfig::default();
        Self {
            block_size: 4096,
            horizon_pct: 10,
            saturation_enter_pct: saturation.enter_pct,
            saturation_exit_pct: saturation.exit_pct,
            horizon_probe_limit: 4,
            max_commit_retries: 8,
            durability: DurabilityPolicy::Flush,
            heal_on_read: true,
            compress_payloads: true,
            device_class: None,
            system_profile: false,
            rng_seed: None,
            bitmap_mode: BitmapMode::Cas,
            default_fractal_scale: 0,
        }
    }
}

impl VolumeConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Hn4Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: VolumeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| Hn4Error::InvalidConfig {
                reason: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| Hn4Error::InvalidConfig {
                reason: e.to_string(),
            })?,
            _ => {
                return Err(Hn4Error::InvalidConfig {
                    reason: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Saturation watermarks.
    pub fn saturation(&self) -> SaturationConfig {
        SaturationConfig {
            enter_pct: self.saturation_enter_pct,
            exit_pct: self.saturation_exit_pct,
        }
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Hn4Result<()> {
        let fail = |reason: String| Err(Hn4Error::InvalidConfig { reason });
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return fail(format!("block size {} is not a power of two >= 512", self.block_size));
        }
        if self.horizon_pct == 0 || self.horizon_pct >= 50 {
            return fail(format!("horizon_pct {} outside 1..50", self.horizon_pct));
        }
        if self.saturation_enter_pct > 100 || self.saturation_exit_pct >= self.saturation_enter_pct {
            return fail(format!(
                "saturation watermarks {}/{} must satisfy exit < enter <= 100",
                self.saturation_exit_pct, self.saturation_enter_pct
            ));
        }
        if self.horizon_probe_limit == 0 {
            return fail("horizon_probe_limit must be at least 1".to_string());
        }
        if self.max_commit_retries == 0 {
            return fail("max_commit_retries must be at least 1".to_string());
        }
        if self.default_fractal_scale > MAX_FRACTAL_SCALE {
            return fail(format!(
                "default_fractal_scale {} exceeds {}",
                self.default_fractal_scale, MAX_FRACTAL_SCALE
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let c = VolumeConfig::default();
        assert_eq!(c.block_size, 4096);
        assert_eq!(c.horizon_pct, 10);
        assert_eq!(c.saturation_enter_pct, 90);
        assert_eq!(c.saturation_exit_pct, 85);
        assert_eq!(c.max_commit_retries, 8);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let mut c = VolumeConfig::default();
        c.block_size = 3000;
        assert!(c.validate().is_err());

        let mut c = VolumeConfig::default();
        c.saturation_exit_pct = 95;
        assert!(matches!(c.validate(), Err(Hn4Error::InvalidConfig { .. })));

        let mut c = VolumeConfig::default();
        c.horizon_pct = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
block_size = 8192
heal_on_read = false
device_class = "hdd"
bitmap_mode = "sector_rmw"
durability = "persistent_memory"
"#
        )
        .unwrap();
        let c = VolumeConfig::from_file(file.path()).unwrap();
        assert_eq!(c.block_size, 8192);
        assert!(!c.heal_on_read);
        assert_eq!(c.device_class, Some(DeviceClass::Hdd));
        assert_eq!(c.bitmap_mode, BitmapMode::SectorRmw);
        assert_eq!(c.durability, DurabilityPolicy::PersistentMemory);
        assert_eq!(c.horizon_pct, 10);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"rng_seed": 42, "system_profile": true}}"#).unwrap();
        let c = VolumeConfig::from_file(file.path()).unwrap();
        assert_eq!(c.rng_seed, Some(42));
        assert!(c.system_profile);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "saturation_enter_pct = 50\nsaturation_exit_pct = 60").unwrap();
        assert!(VolumeConfig::from_file(file.path()).is_err());

        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            VolumeConfig::from_file(file.path()),
            Err(Hn4Error::InvalidConfig { .. })
        ));
    }
}
