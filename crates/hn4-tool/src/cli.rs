use crate::exercise::run_scenario;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use hn4_storage::{
    locate, BlockDevice, DeviceClass, FileDevice, Geometry, Layout, MemDevice, TrajectoryParams,
    Volume, VolumeConfig, INVALID_LBA,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Sector size of the devices the tool creates.
const SECTOR_SIZE: u32 = 4096;

/// Top-level arguments.
#[derive(Parser)]
#[command(name = "hn4")]
#[command(about = "HN4 ballistic storage tool", long_about = None)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Print the trajectory candidates of one logical block
    Locate {
        /// Gravity center G
        #[arg(short, long)]
        gravity: u64,
        /// Orbit vector V
        #[arg(short, long)]
        orbit: u64,
        /// Logical block index N
        #[arg(short, long)]
        index: u64,
        /// Fractal scale M
        #[arg(short = 'm', long, default_value = "0")]
        scale: u8,
        /// Single collision index; all indices of the class when omitted
        #[arg(short, long)]
        k: Option<u8>,
        /// First flux block; defaults to a 64 MiB volume layout
        #[arg(long)]
        flux_start: Option<u64>,
        /// Flux window size in blocks; defaults to a 64 MiB volume layout
        #[arg(long)]
        flux_blocks: Option<u64>,
        /// Device class whose profile drives the trajectory
        #[arg(short, long, value_enum, default_value = "ssd")]
        class: ClassArg,
    },
    /// Format a volume and run the end-to-end write/read/overwrite scenario
    Exercise {
        /// File-backed image to create; RAM when omitted
        #[arg(long)]
        image: Option<PathBuf>,
        /// Volume size in MiB
        #[arg(long, default_value = "64")]
        size_mib: u64,
        /// Block size in bytes, overriding the configuration
        #[arg(long)]
        block_size: Option<u32>,
        /// Volume configuration (.toml or .json)
        #[arg(short, long, env = "HN4_CONFIG")]
        config: Option<PathBuf>,
        /// Device class, overriding the configuration
        #[arg(long, value_enum)]
        class: Option<ClassArg>,
    },
}

/// Device class argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClassArg {
    /// NVMe flash
    Nvme,
    /// SATA/SAS flash
    Ssd,
    /// Persistent memory
    Pmem,
    /// Removable flash
    Usb,
    /// Rotational disk
    Hdd,
    /// Zoned namespace
    Zns,
}

impl From<ClassArg> for DeviceClass {
    fn from(c: ClassArg) -> Self {
        match c {
            ClassArg::Nvme => DeviceClass::Nvme,
            ClassArg::Ssd => DeviceClass::Ssd,
            ClassArg::Pmem => DeviceClass::Pmem,
            ClassArg::Usb => DeviceClass::Usb,
            ClassArg::Hdd => DeviceClass::Hdd,
            ClassArg::Zns => DeviceClass::Zns,
        }
    }
}

#[derive(Debug, Serialize)]
struct CandidateLine {
    k: u8,
    lba: Option<u64>,
}

impl Cli {
    /// Runs the selected subcommand.
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Locate {
                gravity,
                orbit,
                index,
                scale,
                k,
                flux_start,
                flux_blocks,
                class,
            } => {
                let geo = default_geometry(flux_start, flux_blocks)?;
                let lines = locate_lines(&geo, gravity, orbit, index, scale, k, class.into());
                println!("{}", serde_json::to_string_pretty(&lines)?);
                Ok(())
            }
            Command::Exercise {
                image,
                size_mib,
                block_size,
                config,
                class,
            } => exercise(image, size_mib, block_size, config, class),
        }
    }
}

fn default_geometry(flux_start: Option<u64>, flux_blocks: Option<u64>) -> Result<Geometry> {
    let layout = Layout::compute(4096, 1, (64 << 20) / 4096, 10)?;
    Ok(Geometry {
        flux_start: flux_start.unwrap_or(layout.flux_start),
        flux_blocks: flux_blocks.unwrap_or(layout.flux_blocks),
    })
}

fn locate_lines(
    geo: &Geometry,
    gravity: u64,
    orbit: u64,
    index: u64,
    scale: u8,
    k: Option<u8>,
    class: DeviceClass,
) -> Vec<CandidateLine> {
    let profile = class.profile();
    let params = TrajectoryParams::from(profile);
    let ks = match k {
        Some(k) => k..=k,
        None => 0..=profile.max_k,
    };
    ks.map(|k| {
        let lba = locate(geo, gravity, orbit, index, scale, k, &params);
        CandidateLine {
            k,
            lba: (lba != INVALID_LBA).then_some(lba),
        }
    })
    .collect()
}

fn exercise(
    image: Option<PathBuf>,
    size_mib: u64,
    block_size: Option<u32>,
    config_path: Option<PathBuf>,
    class: Option<ClassArg>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => VolumeConfig::from_file(&path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => VolumeConfig::default(),
    };
    if let Some(bs) = block_size {
        config.block_size = bs;
    }
    if let Some(c) = class {
        config.device_class = Some(c.into());
    }
    let device_class = config.device_class.unwrap_or_default();

    let bytes = size_mib
        .checked_mul(1 << 20)
        .context("volume size overflows")?;
    if bytes == 0 {
        bail!("volume size must be nonzero");
    }
    let sectors = bytes / u64::from(SECTOR_SIZE);

    let device: Arc<dyn BlockDevice> = match &image {
        Some(path) => {
            info!(path = %path.display(), size_mib, "creating image");
            Arc::new(FileDevice::create(path, SECTOR_SIZE, sectors, device_class)?)
        }
        None => Arc::new(MemDevice::new(SECTOR_SIZE, sectors, device_class)?),
    };

    let vol = Volume::format(device, config)?;
    let report = run_scenario(&vol)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_locate() {
        let cli = Cli::try_parse_from([
            "hn4", "locate", "--gravity", "100", "--orbit", "7", "--index", "3", "-k", "2",
        ])
        .unwrap();
        match cli.command {
            Command::Locate { gravity, k, class, .. } => {
                assert_eq!(gravity, 100);
                assert_eq!(k, Some(2));
                assert_eq!(class, ClassArg::Ssd);
            }
            _ => panic!("expected locate"),
        }
    }

    #[test]
    fn test_locate_lines_cover_profile() {
        let geo = default_geometry(None, None).unwrap();
        let all = locate_lines(&geo, 5, 7, 0, 0, None, DeviceClass::Nvme);
        assert_eq!(all.len(), usize::from(DeviceClass::Nvme.profile().max_k) + 1);
        assert!(all.iter().all(|c| c.lba.is_some()));

        let one = locate_lines(&geo, 5, 7, 0, 0, Some(3), DeviceClass::Nvme);
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].lba, all[3].lba);
    }

    #[test]
    fn test_locate_outside_window_is_none() {
        let geo = Geometry {
            flux_start: 3,
            flux_blocks: 4,
        };
        let lines = locate_lines(&geo, 0, 1, 0, 4, Some(0), DeviceClass::Ssd);
        assert_eq!(lines[0].lba, None);
    }

    #[test]
    fn test_exercise_on_file_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("vol.img");
        exercise(Some(image.clone()), 16, None, None, None).unwrap();
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 16 << 20);
    }

    #[test]
    fn test_exercise_with_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hn4.toml");
        std::fs::write(&path, "heal_on_read = false\nrng_seed = 3\n").unwrap();
        exercise(None, 16, Some(4096), Some(path), Some(ClassArg::Hdd)).unwrap();
    }

    #[test]
    fn test_exercise_rejects_zero_size() {
        assert!(exercise(None, 0, None, None, None).is_err());
    }
}
