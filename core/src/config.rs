//! Controller configuration

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Largest synchronous REQ/ACK offset the chip supports
pub const SPC_MAX_SYNC_OFFSET: u8 = 8;

/// Largest transfer width exponent (0 = 8 bit, 1 = 16 bit, 2 = 32 bit)
pub const SPC_MAX_WIDTH: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpcConfig {
    /// Our own SCSI id
    pub initiator_id: u8,

    /// Chip clock in MHz
    pub clock_mhz: u32,

    /// Negotiate synchronous transfers
    pub use_sync: bool,

    /// Negotiate wide transfers
    pub use_wide: bool,

    pub sync_offset: u8,
    pub max_width: u8,

    /// Number of command blocks in the pool
    pub acb_count: usize,

    /// Iterations a register wait may spin before giving up
    pub poll_budget: u32,

    pub selection_timeout_ms: u32,

    /// Grant targets the disconnect privilege in IDENTIFY
    pub allow_disconnect: bool,
}

impl Default for SpcConfig {
    fn default() -> Self {
        Self {
            initiator_id: 7,
            clock_mhz: 20,
            use_sync: false,
            use_wide: false,
            sync_offset: SPC_MAX_SYNC_OFFSET,
            max_width: 0,
            acb_count: 8,
            poll_budget: 100_000,
            selection_timeout_ms: 250,
            allow_disconnect: true,
        }
    }
}

impl SpcConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Cannot parse SPC configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initiator_id > 7 {
            bail!("Initiator id {} out of range", self.initiator_id);
        }
        if self.clock_mhz == 0 {
            bail!("Clock frequency cannot be zero");
        }
        if self.sync_offset > SPC_MAX_SYNC_OFFSET {
            bail!(
                "Sync offset {} exceeds maximum of {}",
                self.sync_offset,
                SPC_MAX_SYNC_OFFSET
            );
        }
        if self.max_width > SPC_MAX_WIDTH {
            bail!("Width {} not supported", self.max_width);
        }
        if self.acb_count == 0 {
            bail!("Command block pool cannot be empty");
        }
        if self.poll_budget == 0 {
            bail!("Poll budget cannot be zero");
        }
        Ok(())
    }

    /// Fastest sync period factor (in 4ns units) for the chip clock
    pub fn min_sync_period(&self) -> u8 {
        (2 * 250 / self.clock_mhz.max(1)).min(0xFF) as u8
    }

    /// Slowest sync period factor (in 4ns units) for the chip clock
    pub fn max_sync_period(&self) -> u8 {
        (9 * 250 / self.clock_mhz.max(1)).min(0xFF) as u8
    }
}
