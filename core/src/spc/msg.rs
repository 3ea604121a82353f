//! SCSI message engine: outgoing priority queue, MESSAGE OUT and MESSAGE IN
//! phases, and negotiation.

use log::*;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use strum::{Display, IntoStaticStr};

use super::acb::AcbHandle;
use super::error::{ScsiError, SpcError};
use super::pio;
use super::regs::{RegInts, RegPctl, SpcCmd, SpcReg};
use super::{SPC_MAX_MSG_LEN, Spc, SpcState};
use crate::bus::SpcBus;
use crate::config::SPC_MAX_SYNC_OFFSET;
use crate::scsi::*;

/// Messages the initiator sends. The discriminant is the queue bit; lower
/// bits go out first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoStaticStr, Display)]
#[repr(u8)]
pub enum OutMsg {
    DevReset = 0x01,
    ParityError = 0x02,
    InitDetErr = 0x04,
    Reject = 0x08,
    Identify = 0x10,
    Abort = 0x20,
    Wdtr = 0x40,
    Sdtr = 0x80,
}

/// Set of pending outgoing messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgQueue(u8);

impl MsgQueue {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, m: OutMsg) {
        self.0 |= m as u8;
    }

    pub fn contains(self, m: OutMsg) -> bool {
        self.0 & m as u8 != 0
    }

    pub fn merge(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Removes and returns the message that goes out next
    pub fn pop(&mut self) -> Option<OutMsg> {
        let bit = self.0 & self.0.wrapping_neg();
        if bit == 0 {
            return None;
        }
        self.0 &= !bit;
        OutMsg::from_u8(bit)
    }
}

impl<B: SpcBus> Spc<B> {
    /// Queues a message and raises ATN if it is the first one
    pub(super) fn sched_msgout(&mut self, m: OutMsg) {
        if self.msgpriq.is_empty() {
            self.command(SpcCmd::SetAtn);
        }
        self.msgpriq.insert(m);
    }

    fn set_omess(&mut self, bytes: &[u8]) {
        self.omess.clear();
        self.omess_sent = 0;
        if self.omess.try_extend_from_slice(bytes).is_err() {
            error!("Outgoing message too long: {:02X?}", bytes);
        }
    }

    fn build_msgout(&mut self, m: Option<OutMsg>) {
        let current = self.pool.current();
        match (m, current) {
            (Some(OutMsg::Identify), Some(h)) => {
                let lun = self.pool[h].lun;
                self.set_omess(&[msg_identify(lun, self.config.allow_disconnect)]);
            }
            (Some(OutMsg::Sdtr), Some(h)) => {
                let ti = self.tinfo.get(self.pool[h].target);
                let (period, offset) = (ti.period, ti.offset);
                self.set_omess(&[MSG_EXTENDED, MSG_EXT_SDTR_LEN, MSG_EXT_SDTR, period, offset]);
            }
            (Some(OutMsg::Wdtr), Some(h)) => {
                let width = self.tinfo.get(self.pool[h].target).width;
                self.set_omess(&[MSG_EXTENDED, MSG_EXT_WDTR_LEN, MSG_EXT_WDTR, width]);
            }
            (Some(OutMsg::DevReset), _) => {
                self.flags.aborting = true;
                self.set_omess(&[MSG_BUS_DEV_RESET]);
            }
            (Some(OutMsg::Abort), _) => {
                self.flags.aborting = true;
                self.set_omess(&[MSG_ABORT]);
            }
            (Some(OutMsg::Reject), _) => self.set_omess(&[MSG_MESSAGE_REJECT]),
            (Some(OutMsg::ParityError), _) => self.set_omess(&[MSG_PARITY_ERROR]),
            (Some(OutMsg::InitDetErr), _) => self.set_omess(&[MSG_INITIATOR_DET_ERR]),
            (Some(m), None) => {
                warn!("{} without a nexus, sending NOOP", m);
                self.set_omess(&[MSG_NOOP]);
            }
            (None, _) => {
                debug!("Nothing to send in MESSAGE OUT, sending NOOP");
                self.set_omess(&[MSG_NOOP]);
            }
        }
    }

    /// The target left MESSAGE OUT before we were done
    fn msgout_interrupted(&mut self) {
        if self.omess_sent < self.omess.len() {
            if let Some(m) = self.currmsg {
                debug!("Target left MESSAGE OUT during {}, re-arming", m);
                self.msgpriq.insert(m);
            }
            self.omess.clear();
            self.omess_sent = 0;
        }
        if !self.msgpriq.is_empty() {
            self.command(SpcCmd::SetAtn);
        }
    }

    pub(super) fn msgout(&mut self) -> Result<(), SpcError> {
        let budget = self.config.poll_budget;

        if self.prevphase == Some(ScsiPhase::MessageOut)
            && !self.omess.is_empty()
            && self.omess_sent == self.omess.len()
        {
            // Target wants the whole group again
            debug!("Retransmitting messages");
            self.msgpriq.merge(self.msgoutq);
            self.command(SpcCmd::SetAtn);
        }
        self.msgoutq = MsgQueue::empty();
        self.lastmsg = None;

        loop {
            let m = self.msgpriq.pop();
            if let Some(m) = m {
                self.msgoutq.insert(m);
            }
            self.currmsg = m;
            self.build_msgout(m);
            let n = self.omess.len();

            pio::start_transfer(&mut self.bus, ScsiPhase::MessageOut, n);
            let mut spins = 0;
            while !self.read_ssts().spc_busy() {
                if self.read_ints().target_left() {
                    self.msgout_interrupted();
                    return Ok(());
                }
                spins += 1;
                if spins > budget {
                    return Err(SpcError::PollTimeout("MESSAGE OUT start"));
                }
                self.bus.delay(1);
            }

            while self.omess_sent < n {
                if self.read_ints().target_left() {
                    self.msgout_interrupted();
                    return Ok(());
                }
                if self.omess_sent + 1 == n && self.msgpriq.is_empty() {
                    self.command(SpcCmd::ResetAtn);
                }
                let mut spins = 0;
                while self.read_ssts().dreg_full() {
                    spins += 1;
                    if spins > budget {
                        return Err(SpcError::PollTimeout("MESSAGE OUT FIFO"));
                    }
                    self.bus.delay(1);
                }
                self.bus.write(SpcReg::DREG, self.omess[self.omess_sent]);
                self.omess_sent += 1;
                self.lastmsg = self.currmsg;
            }
            debug!("Sent message {:02X?}", self.omess);

            if self.msgpriq.is_empty() {
                break;
            }
            // Previous message must be off the chip before the next transfer
            let mut spins = 0;
            while !self.read_ssts().dreg_empty() && !self.read_ints().target_left() {
                spins += 1;
                if spins > budget {
                    return Err(SpcError::PollTimeout("MESSAGE OUT drain"));
                }
                self.bus.delay(1);
            }
            self.bus
                .write(SpcReg::INTS, RegInts(0).with_cmd_done(true).0);
        }
        Ok(())
    }

    pub(super) fn msgin(&mut self) -> Result<(), SpcError> {
        let budget = self.config.poll_budget;
        let mut continuation = self.prevphase == Some(ScsiPhase::MessageIn);
        if !continuation {
            self.flags.drop_msgin = false;
        }

        loop {
            if !continuation {
                self.imess.clear();
            }
            continuation = false;

            loop {
                self.bus.write(
                    SpcReg::PCTL,
                    RegPctl::expect(ScsiPhase::MessageIn).0,
                );

                // Wait for the next byte, unless the target moves on
                let mut spins = 0;
                loop {
                    let psns = self.read_psns();
                    if psns.phase() != ScsiPhase::MessageIn as u8 {
                        return Ok(());
                    }
                    if psns.req() {
                        break;
                    }
                    if self.read_ints().0 != 0 {
                        return Ok(());
                    }
                    spins += 1;
                    if spins > budget {
                        debug!("No REQ in MESSAGE IN");
                        return Ok(());
                    }
                    self.bus.delay(1);
                }

                let byte = self.bus.read(SpcReg::TEMP);
                if self.read_serr().parity() {
                    warn!("Parity error in MESSAGE IN");
                    self.flags.drop_msgin = true;
                    self.sched_msgout(OutMsg::ParityError);
                }

                if !self.flags.drop_msgin {
                    if self.imess.try_push(byte).is_err() {
                        warn!("Incoming message too long: {:02X?}", self.imess);
                        self.flags.drop_msgin = true;
                        self.sched_msgout(OutMsg::Reject);
                    } else if msg_complete(&self.imess) {
                        break;
                    }
                }
                self.ack_byte()?;
            }

            debug!("Received message {:02X?}", self.imess);
            self.parse_msgin();
            // The last byte stays unacknowledged until here, so a reply can
            // raise ATN before the target moves on
            self.ack_byte()?;
        }
    }

    fn parse_msgin(&mut self) {
        match self.state {
            SpcState::Connected => match self.pool.current() {
                Some(h) => self.msgin_connected(h),
                None => self.sched_msgout(OutMsg::DevReset),
            },
            SpcState::Reselected => {
                let m = self.imess[0];
                if msg_is_identify(m) {
                    self.reselect(m);
                } else {
                    warn!("Reselection without IDENTIFY, sending DEVICE RESET");
                    self.sched_msgout(OutMsg::DevReset);
                }
            }
            _ => {
                warn!("Message in state {}, sending DEVICE RESET", self.state);
                self.sched_msgout(OutMsg::DevReset);
            }
        }
    }

    fn msgin_connected(&mut self, h: AcbHandle) {
        let target = self.pool[h].target;
        match self.imess[0] {
            MSG_CMDCOMPLETE => {
                self.pool[h].data_length = self.dleft;
                self.state = SpcState::CmdComplete;
            }
            MSG_PARITY_ERROR => match self.lastmsg {
                Some(m) => {
                    debug!("Target saw parity error, resending {}", m);
                    self.sched_msgout(m);
                }
                None => warn!("MESSAGE PARITY ERROR with nothing to resend"),
            },
            MSG_MESSAGE_REJECT => self.msgin_reject(h),
            MSG_NOOP => (),
            MSG_DISCONNECT => {
                self.tinfo.get_mut(target).disconnects += 1;
                self.state = SpcState::Disconnect;
            }
            MSG_SAVEDATAPOINTER => self.save_pointers(h),
            MSG_RESTOREPOINTERS => self.restore_pointers(h),
            MSG_EXTENDED => match self.imess.get(2).copied() {
                Some(MSG_EXT_SDTR) if self.imess[1] == MSG_EXT_SDTR_LEN => self.msgin_sdtr(target),
                Some(MSG_EXT_WDTR) if self.imess[1] == MSG_EXT_WDTR_LEN => self.msgin_wdtr(target),
                _ => {
                    warn!("Unknown extended message {:02X?}, rejecting", self.imess);
                    self.sched_msgout(OutMsg::Reject);
                }
            },
            m => {
                warn!("Unknown message {:02X}, rejecting", m);
                self.sched_msgout(OutMsg::Reject);
            }
        }
    }

    fn msgin_reject(&mut self, h: AcbHandle) {
        let target = self.pool[h].target;
        match self.lastmsg {
            Some(OutMsg::Identify) => {
                // Target does not take extended messages at all
                let ti = self.tinfo.get_mut(target);
                ti.disable_sync();
                ti.disable_wide();
                self.setsync(target);
            }
            Some(OutMsg::Sdtr) => {
                info!("Target {} rejected SDTR, using asynchronous transfers", target);
                self.tinfo.get_mut(target).disable_sync();
                self.setsync(target);
            }
            Some(OutMsg::Wdtr) => {
                info!("Target {} rejected WDTR, using 8 bit transfers", target);
                self.tinfo.get_mut(target).disable_wide();
            }
            Some(OutMsg::InitDetErr) => {
                self.pool[h].set_error(ScsiError::BusParityError);
                self.sched_msgout(OutMsg::Abort);
            }
            Some(OutMsg::Abort | OutMsg::DevReset) => {
                self.pool[h].set_error(ScsiError::MessageRejected);
            }
            m => debug!("Target {} rejected {:?}", target, m),
        }
    }

    fn msgin_sdtr(&mut self, target: u8) {
        let (period, offset) = (self.imess[3], self.imess[4]);
        let ours = self.msgoutq.contains(OutMsg::Sdtr);
        let (minsync, maxsync) = (self.minsync, self.maxsync);
        let use_sync = self.config.use_sync;
        let ti = self.tinfo.get_mut(target);
        ti.sync_pending = false;

        let reply = if !use_sync {
            ti.period = 0;
            ti.offset = 0;
            offset != 0 || !ours
        } else if offset == 0 {
            ti.period = period;
            ti.offset = 0;
            !ours
        } else if period < minsync || period > maxsync || offset > SPC_MAX_SYNC_OFFSET {
            info!(
                "Target {} offered unusable sync period {} offset {}, going asynchronous",
                target, period, offset
            );
            ti.period = 0;
            ti.offset = 0;
            true
        } else {
            info!(
                "Target {}: synchronous, offset {}, period {}ns",
                target,
                offset,
                u32::from(period) * 4
            );
            ti.period = period;
            ti.offset = offset;
            !ours
        };
        if reply {
            self.sched_msgout(OutMsg::Sdtr);
        }
        self.setsync(target);
    }

    fn msgin_wdtr(&mut self, target: u8) {
        let width = self.imess[3];
        let ours = self.msgoutq.contains(OutMsg::Wdtr);
        let (use_wide, max_width) = (self.config.use_wide, self.config.max_width);
        let ti = self.tinfo.get_mut(target);
        ti.wide_pending = false;

        let reply = if !use_wide {
            ti.width = 0;
            width != 0 || !ours
        } else if width > max_width {
            ti.width = max_width;
            true
        } else {
            ti.width = width;
            !ours
        };
        if reply {
            self.sched_msgout(OutMsg::Wdtr);
        }
    }
}
