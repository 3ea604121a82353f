//! Scheduling, selection, reselection and command completion

use log::*;

use super::acb::{AcbHandle, AcbQueue};
use super::error::ScsiError;
use super::msg::{MsgQueue, OutMsg};
use super::regs::{RegSequence, SpcCmd, SpcReg};
use super::{Completion, SPC_ABORT_TIMEOUT, Spc, SpcState};
use crate::bus::SpcBus;
use crate::scsi::{STATUS_BUSY, STATUS_CHECK_CONDITION, STATUS_GOOD};

impl<B: SpcBus> Spc<B> {
    /// Starts the first ready command whose lun is idle
    pub(super) fn sched(&mut self) {
        let Some(h) = self.pool.dequeue_ready_for_idle_target(&self.tinfo) else {
            return;
        };
        let (target, lun) = (self.pool[h].target, self.pool[h].lun);
        debug!("Selecting {}:{}", target, lun);
        self.tinfo.get_mut(target).set_lun_busy(lun, true);
        self.pool.set_current(h);
        self.select(h);
    }

    /// TCH/TCM for the configured selection timeout.
    /// The chip waits (X * 256 + 15) * Tclf * 2, with X = TCH:TCM.
    pub(super) fn selection_timeout_regs(&self) -> (u8, u8) {
        let ns = u64::from(self.config.selection_timeout_ms) * 1_000_000;
        let x = (ns * u64::from(self.config.clock_mhz) / 2000).saturating_sub(15) / 256;
        let x = x.min(0xFFFF);
        ((x >> 8) as u8, x as u8)
    }

    fn select(&mut self, h: AcbHandle) {
        let target = self.pool[h].target;
        self.setsync(target);
        self.msgpriq = MsgQueue::empty();
        let (tch, tcm) = self.selection_timeout_regs();
        RegSequence::new()
            .write(SpcReg::SCMD, SpcCmd::SetAtn.scmd())
            .write(SpcReg::PCTL, 0)
            .write(
                SpcReg::TEMP,
                (1 << self.config.initiator_id) | (1 << target),
            )
            .write(SpcReg::TCH, tch)
            .write(SpcReg::TCM, tcm)
            .write(SpcReg::TCL, 3)
            .write(SpcReg::SCMD, SpcCmd::Select.scmd())
            .apply(&mut self.bus);
        self.state = SpcState::Selecting;
    }

    /// Programs TMOD for the negotiated sync parameters of `target`
    pub(super) fn setsync(&mut self, target: u8) {
        let ti = self.tinfo.get(target);
        let tmod = if ti.offset != 0 {
            let cycles = (u32::from(ti.period) * self.config.clock_mhz) / 250;
            ((cycles.saturating_sub(2) as u8) << 4) | ti.offset
        } else {
            0
        };
        self.bus.write(SpcReg::TMOD, tmod);
    }

    /// The selection went through, the target is ours
    pub(super) fn selected(&mut self, h: AcbHandle) {
        let target = self.pool[h].target;
        let ti = *self.tinfo.get(target);
        let flags = self.pool[h].flags;

        let mut q = MsgQueue::empty();
        q.insert(OutMsg::Identify);
        if flags.reset() {
            q.insert(OutMsg::DevReset);
        } else if flags.abort() {
            q.insert(OutMsg::Abort);
        } else {
            if ti.sync_pending {
                q.insert(OutMsg::Sdtr);
            }
            if ti.wide_pending {
                q.insert(OutMsg::Wdtr);
            }
        }
        self.msgpriq = q;

        let acb = &mut self.pool[h];
        acb.flags.set_nexus(true);
        if !acb.poll && acb.timeout > 0 {
            acb.timer = Some(acb.timeout);
        }
        self.restore_pointers(h);
        self.state = SpcState::Connected;
    }

    /// A target reselected us; the selection in flight loses
    pub(super) fn reselected(&mut self, selid: u8) {
        if let Some(h) = self.pool.current() {
            let (target, lun) = (self.pool[h].target, self.pool[h].lun);
            debug!("Reselection beat selection of {}:{}", target, lun);
            self.tinfo.get_mut(target).set_lun_busy(lun, false);
            self.pool.push_ready_front(h);
            self.command(SpcCmd::ResetAtn);
        }
        self.selid = selid;
        self.msgpriq = MsgQueue::empty();
        self.state = SpcState::Reselected;
    }

    /// IDENTIFY received after reselection
    pub(super) fn reselect(&mut self, identify: u8) {
        let selid = self.selid & !(1 << self.config.initiator_id);
        if selid == 0 || selid & (selid - 1) != 0 {
            error!(
                "Reselection with invalid id bits {:02X}, sending DEVICE RESET",
                self.selid
            );
            self.sched_msgout(OutMsg::DevReset);
            return;
        }
        let target = selid.trailing_zeros() as u8;
        let lun = identify & 7;

        let Some(h) = self.pool.remove_from_nexus(target, lun) else {
            warn!(
                "Reselection from {}:{} with no disconnected command, sending ABORT",
                target, lun
            );
            self.sched_msgout(OutMsg::Abort);
            return;
        };
        debug!("Reselected by {}:{}", target, lun);

        self.pool.set_current(h);
        self.tinfo.get_mut(target).set_lun_busy(lun, true);
        self.state = SpcState::Connected;
        self.setsync(target);

        let flags = self.pool[h].flags;
        if flags.reset() {
            self.sched_msgout(OutMsg::DevReset);
        } else if flags.abort() {
            self.sched_msgout(OutMsg::Abort);
        }
        self.restore_pointers(h);
    }

    /// Reports the result of `h` and releases it
    pub(super) fn done(&mut self, h: AcbHandle) {
        let was_current = self.pool.current() == Some(h);
        let acb = &mut self.pool[h];

        if acb.error.is_none() {
            if acb.flags.abort() {
                acb.error = Some(ScsiError::Aborted);
            } else if !matches!(
                acb.target_stat,
                STATUS_GOOD | STATUS_CHECK_CONDITION | STATUS_BUSY
            ) {
                warn!("Unexpected target status {:02X}", acb.target_stat);
                acb.error = Some(ScsiError::ProtocolViolation("unexpected status byte"));
            }
        }
        let result = match acb.error {
            Some(e) => Err(e),
            None => Ok(acb.target_stat),
        };
        let (target, lun, poll) = (acb.target, acb.lun, acb.poll);
        let completion = Completion {
            handle: h,
            target,
            lun,
            result,
            resid: acb.data_length,
            data: std::mem::take(&mut acb.data),
        };
        debug!("Done {}:{}: {:?}", target, lun, completion.result);

        if matches!(acb.queue(), AcbQueue::Current | AcbQueue::Nexus) {
            self.tinfo.get_mut(target).set_lun_busy(lun, false);
        }
        self.tinfo.get_mut(target).cmds += 1;
        self.pool.free(h);

        if poll {
            self.polled = Some(completion);
        } else if self.completions.send(completion).is_err() {
            debug!("Completion receiver gone");
        }

        if was_current && self.state != SpcState::Cleaning {
            self.state = SpcState::Idle;
            self.sched();
        }
    }

    /// Stops `h`: ABORT if it is connected, otherwise it is reselected from
    /// the ready list to deliver the ABORT.
    pub(super) fn abort(&mut self, h: AcbHandle) {
        let acb = &mut self.pool[h];
        acb.timeout = SPC_ABORT_TIMEOUT;
        if !acb.poll {
            acb.timer = Some(SPC_ABORT_TIMEOUT);
        }
        acb.flags.set_abort(true);
        let (target, lun) = (acb.target, acb.lun);
        info!("Aborting {}:{}", target, lun);

        match acb.queue() {
            AcbQueue::Current => {
                if self.state == SpcState::Connected {
                    self.sched_msgout(OutMsg::Abort);
                }
                // Still selecting: ABORT follows IDENTIFY once connected
            }
            AcbQueue::Nexus => {
                self.tinfo.get_mut(target).set_lun_busy(lun, false);
                self.pool.push_ready_front(h);
                if self.state == SpcState::Idle {
                    self.sched();
                }
            }
            AcbQueue::Ready => {
                self.pool.push_ready_front(h);
                if self.state == SpcState::Idle {
                    self.sched();
                }
            }
            AcbQueue::Free | AcbQueue::Detached => (),
        }
    }

    /// Timer of `h` ran out
    pub(super) fn timeout(&mut self, h: AcbHandle) {
        let Some(acb) = self.pool.get_mut(h) else {
            return;
        };
        let (target, lun) = (acb.target, acb.lun);
        if acb.flags.abort() {
            error!("{}:{} timed out again during abort, resetting", target, lun);
            self.tinfo.get_mut(target).timeouts += 1;
            self.init(true);
            return;
        }
        warn!("{}:{} timed out", target, lun);
        acb.set_error(ScsiError::CommandTimeout);
        self.tinfo.get_mut(target).timeouts += 1;
        self.abort(h);
    }
}
