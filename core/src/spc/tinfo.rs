//! Per-target negotiated transfer parameters

use serde::{Deserialize, Serialize};

use crate::config::SpcConfig;

pub const MAX_TARGETS: usize = 8;
pub const MAX_LUNS: u8 = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    /// SDTR still to be exchanged
    pub sync_pending: bool,
    /// WDTR still to be exchanged
    pub wide_pending: bool,

    /// Sync period factor (4ns units)
    pub period: u8,
    /// Sync REQ/ACK offset, 0 is asynchronous
    pub offset: u8,
    pub width: u8,

    /// Bitmap of luns with a command in the current nexus or nexus list
    pub lubusy: u8,

    pub cmds: u64,
    pub disconnects: u64,
    pub timeouts: u64,
}

impl TargetInfo {
    pub fn lun_busy(&self, lun: u8) -> bool {
        self.lubusy & (1 << (lun & 7)) != 0
    }

    pub fn set_lun_busy(&mut self, lun: u8, busy: bool) {
        if busy {
            self.lubusy |= 1 << (lun & 7);
        } else {
            self.lubusy &= !(1 << (lun & 7));
        }
    }

    pub fn disable_sync(&mut self) {
        self.sync_pending = false;
        self.period = 0;
        self.offset = 0;
    }

    pub fn disable_wide(&mut self) {
        self.wide_pending = false;
        self.width = 0;
    }

    /// Arms negotiation from configuration. Counters and busy luns are kept.
    pub fn arm_negotiation(&mut self, config: &SpcConfig) {
        if config.use_sync {
            self.sync_pending = true;
            self.period = config.min_sync_period();
            self.offset = config.sync_offset;
        } else {
            self.disable_sync();
        }
        if config.use_wide {
            self.wide_pending = true;
            self.width = config.max_width;
        } else {
            self.disable_wide();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetTable([TargetInfo; MAX_TARGETS]);

impl TargetTable {
    pub fn get(&self, target: u8) -> &TargetInfo {
        &self.0[usize::from(target) % MAX_TARGETS]
    }

    pub fn get_mut(&mut self, target: u8) -> &mut TargetInfo {
        &mut self.0[usize::from(target) % MAX_TARGETS]
    }

    pub fn arm_negotiation(&mut self, config: &SpcConfig) {
        for ti in &mut self.0 {
            ti.arm_negotiation(config);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetInfo> {
        self.0.iter()
    }
}
