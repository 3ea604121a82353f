//! MB89352 register map and typed register views

use arrayvec::ArrayVec;
use num_derive::FromPrimitive;
use proc_bitfield::bitfield;
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::bus::SpcBus;
use crate::scsi::ScsiPhase;

/// Depth of the data register FIFO
pub const FIFO_DEPTH: usize = 8;

/// Register offsets
#[allow(clippy::upper_case_acronyms)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    FromPrimitive,
    IntoStaticStr,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum SpcReg {
    /// Bus device ID
    BDID = 0,
    /// SPC control
    SCTL = 1,
    /// Command
    SCMD = 2,
    /// Transfer mode
    TMOD = 3,
    /// Interrupt sense (write 1 to clear)
    INTS = 4,
    /// Phase sense (read), diagnostic control SDGC (write)
    PSNS = 5,
    /// SPC status
    SSTS = 6,
    /// SPC error status
    SERR = 7,
    /// Phase control
    PCTL = 8,
    /// Modified byte counter
    MBC = 9,
    /// Data register (FIFO)
    DREG = 10,
    /// Temporary register
    TEMP = 11,
    /// Transfer counter high
    TCH = 12,
    /// Transfer counter middle
    TCM = 13,
    /// Transfer counter low
    TCL = 14,
    /// External buffer
    EXBF = 15,
}

bitfield! {
    /// SCTL - SPC control
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RegSctl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub intr_enab: bool @ 0,
        pub resel_enab: bool @ 1,
        pub sel_enab: bool @ 2,
        pub parity_enab: bool @ 3,
        pub abrt_enab: bool @ 4,
        pub diag: bool @ 5,
        pub ctrl_reset: bool @ 6,
        pub disable: bool @ 7,
    }
}

bitfield! {
    /// SCMD - command register
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RegScmd(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub pad: bool @ 0,
        pub perr_stop: bool @ 1,
        pub prog_xfr: bool @ 2,
        pub icpt_xfr: bool @ 3,
        /// Assert SCSI RST
        pub rst: bool @ 4,
        pub op: u8 @ 5..=7,
    }
}

bitfield! {
    /// INTS - interrupt sense, write 1 to clear
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RegInts(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub rst: bool @ 0,
        pub hard_err: bool @ 1,
        pub timeout: bool @ 2,
        pub sr_req: bool @ 3,
        pub cmd_done: bool @ 4,
        pub discon: bool @ 5,
        pub resel: bool @ 6,
        pub sel: bool @ 7,
    }
}

impl RegInts {
    /// Target changed phase, dropped off the bus or the bus was reset
    pub fn target_left(self) -> bool {
        self.sr_req() || self.discon() || self.rst()
    }
}

bitfield! {
    /// PSNS - SCSI bus phase sense
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RegPsns(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub phase: u8 @ 0..=2,
        pub io: bool @ 0,
        pub cd: bool @ 1,
        pub msg: bool @ 2,
        pub bsy: bool @ 3,
        pub sel: bool @ 4,
        pub atn: bool @ 5,
        pub ack: bool @ 6,
        pub req: bool @ 7,
    }
}

bitfield! {
    /// SSTS - SPC status
    #[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RegSsts(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub dreg_empty: bool @ 0,
        pub dreg_full: bool @ 1,
        pub tc0: bool @ 2,
        pub rst: bool @ 3,
        pub xfr: bool @ 4,
        pub spc_busy: bool @ 5,
        pub target: bool @ 6,
        pub initiator: bool @ 7,
    }
}

bitfield! {
    /// SERR - SPC error status
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RegSerr(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub offset_err: bool @ 0,
        pub short_xfr: bool @ 1,
        pub phase_err: bool @ 2,
        pub tc_parity: bool @ 3,
        pub spc_parity: bool @ 6,
        pub scsi_parity: bool @ 7,
    }
}

impl RegSerr {
    pub fn parity(self) -> bool {
        self.scsi_parity() || self.spc_parity()
    }
}

bitfield! {
    /// PCTL - phase control
    #[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RegPctl(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub phase: u8 @ 0..=2,
        pub busfree_int_enab: bool @ 7,
    }
}

impl RegPctl {
    /// Expected phase with the bus free interrupt enabled
    pub fn expect(phase: ScsiPhase) -> Self {
        Self(0)
            .with_phase(phase as u8)
            .with_busfree_int_enab(true)
    }
}

/// SCMD command codes (bits 5..=7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoStaticStr)]
pub enum SpcCmd {
    BusRelease = 0,
    Select = 1,
    ResetAtn = 2,
    SetAtn = 3,
    Transfer = 4,
    TransferPause = 5,
    ResetAck = 6,
    SetAck = 7,
}

impl SpcCmd {
    /// Plain SCMD value for this command
    pub fn scmd(self) -> u8 {
        RegScmd(0).with_op(self as u8).0
    }
}

/// Largest count the 24 bit transfer counter holds
pub const MAX_TRANSFER: usize = 0xFF_FFFF;

/// Splits a transfer count over TCH, TCM and TCL
pub fn tc_bytes(count: usize) -> [u8; 3] {
    let count = count.min(MAX_TRANSFER) as u32;
    [(count >> 16) as u8, (count >> 8) as u8, count as u8]
}

/// An ordered list of register writes.
///
/// The chip latches several registers on the command write, so programming
/// is always expressed as a sequence that is applied front to back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegSequence(ArrayVec<(SpcReg, u8), 16>);

impl RegSequence {
    pub fn new() -> Self {
        Self(ArrayVec::new())
    }

    pub fn write(mut self, reg: SpcReg, val: u8) -> Self {
        if self.0.try_push((reg, val)).is_err() {
            log::error!("Register sequence overflow, dropped write {:?}", reg);
        }
        self
    }

    pub fn transfer_count(self, count: usize) -> Self {
        let [h, m, l] = tc_bytes(count);
        self.write(SpcReg::TCH, h)
            .write(SpcReg::TCM, m)
            .write(SpcReg::TCL, l)
    }

    /// Programmed transfer of `count` bytes in `phase`. A count of 0 is
    /// unlimited.
    pub fn transfer(phase: ScsiPhase, count: usize) -> Self {
        Self::new()
            .transfer_count(count)
            .write(SpcReg::PCTL, RegPctl::expect(phase).0)
            .write(
                SpcReg::SCMD,
                RegScmd(0)
                    .with_op(SpcCmd::Transfer as u8)
                    .with_prog_xfr(true)
                    .0,
            )
    }

    pub fn apply<B: SpcBus + ?Sized>(&self, bus: &mut B) {
        for &(reg, val) in &self.0 {
            bus.write(reg, val);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(SpcReg, u8)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
