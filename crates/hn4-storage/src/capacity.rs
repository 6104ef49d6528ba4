//! Saturation tracking with hysteresis.
//!
//! Above the enter watermark the allocator stops searching ballistic
//! trajectories and sends every new block to the horizon ring. It resumes
//! ballistic placement only after usage drops below the exit watermark.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Saturation watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaturationConfig {
    /// Usage percentage at which saturation mode starts. Default: 90
    pub enter_pct: u8,
    /// Usage percentage below which saturation mode ends. Default: 85
    pub exit_pct: u8,
}

impl Default for SaturationConfig {
    fn default() -> Self {
        Self {
            enter_pct: 90,
            exit_pct: 85,
        }
    }
}

/// Usage as an integer percentage, clamped to 100. Zero capacity counts as full.
pub fn usage_pct(used: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (u128::from(used) * 100) / u128::from(total);
    pct.min(100) as u8
}

/// Saturation mode flag.
#[derive(Debug)]
pub struct SaturationGuard {
    config: SaturationConfig,
    saturated: AtomicBool,
}

impl SaturationGuard {
    /// Creates a guard in normal mode.
    pub fn new(config: SaturationConfig) -> Self {
        Self {
            config,
            saturated: AtomicBool::new(false),
        }
    }

    /// Current mode, without re-evaluating.
    pub fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::Acquire)
    }

    /// Re-evaluates the mode for the given usage and returns it.
    pub fn observe(&self, used: u64, total: u64) -> bool {
        let pct = usage_pct(used, total);
        let current = self.is_saturated();
        let next = if current {
            pct >= self.config.exit_pct
        } else {
            pct >= self.config.enter_pct
        };
        if next != current
            && self
                .saturated
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            if next {
                info!(usage_pct = pct, "entering saturation mode: ballistic placement bypassed");
            } else {
                info!(usage_pct = pct, "leaving saturation mode");
            }
        }
        self.is_saturated()
    }
}
