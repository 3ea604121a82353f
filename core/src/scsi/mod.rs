//! SCSI-2 bus protocol constants shared by the controller and the simulator

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;
pub const STATUS_BUSY: u8 = 0x08;

pub const MSG_CMDCOMPLETE: u8 = 0x00;
pub const MSG_EXTENDED: u8 = 0x01;
pub const MSG_SAVEDATAPOINTER: u8 = 0x02;
pub const MSG_RESTOREPOINTERS: u8 = 0x03;
pub const MSG_DISCONNECT: u8 = 0x04;
pub const MSG_INITIATOR_DET_ERR: u8 = 0x05;
pub const MSG_ABORT: u8 = 0x06;
pub const MSG_MESSAGE_REJECT: u8 = 0x07;
pub const MSG_NOOP: u8 = 0x08;
pub const MSG_PARITY_ERROR: u8 = 0x09;
pub const MSG_BUS_DEV_RESET: u8 = 0x0C;

pub const MSG_EXT_SDTR: u8 = 0x01;
pub const MSG_EXT_SDTR_LEN: u8 = 0x03;
pub const MSG_EXT_WDTR: u8 = 0x03;
pub const MSG_EXT_WDTR_LEN: u8 = 0x02;

/// IDENTIFY message for `lun`, optionally granting the disconnect privilege
pub const fn msg_identify(lun: u8, disconnect: bool) -> u8 {
    0x80 | if disconnect { 0x40 } else { 0 } | (lun & 7)
}

pub const fn msg_is_identify(m: u8) -> bool {
    m & 0x80 != 0
}

pub const fn msg_is_1byte(m: u8) -> bool {
    (m != MSG_EXTENDED && m < 0x20) || msg_is_identify(m)
}

pub const fn msg_is_2byte(m: u8) -> bool {
    m & 0xF0 == 0x20
}

/// True once `msg` holds a whole message
pub fn msg_complete(msg: &[u8]) -> bool {
    match msg {
        [] => false,
        [m] => msg_is_1byte(*m),
        [m, _] => msg_is_2byte(*m),
        [m, len, ..] => *m == MSG_EXTENDED && msg.len() == *len as usize + 2,
    }
}

/// SCSI bus information transfer phases, encoded as MSG/CD/IO
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    FromPrimitive,
    IntoStaticStr,
    Display,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum ScsiPhase {
    DataOut = 0,
    DataIn = 1,
    Command = 2,
    Status = 3,
    MessageOut = 6,
    MessageIn = 7,
}

impl ScsiPhase {
    /// Decodes the low 3 bits of a phase register. Codes 4 and 5 are
    /// reserved and yield None.
    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::from_u8(bits & 7)
    }

    /// Target to initiator
    pub fn is_input(self) -> bool {
        self as u8 & 1 != 0
    }
}

/// Length of a command descriptor block, by group code
pub const fn scsi_cmd_len(cmdnum: u8) -> Option<usize> {
    match cmdnum >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        5 => Some(12),
        _ => None,
    }
}
