//! Interrupt handler and phase dispatcher

use log::*;

use super::acb::AcbHandle;
use super::error::{ScsiError, SpcError};
use super::msg::OutMsg;
use super::pio;
use super::regs::{RegInts, RegPctl, SpcReg};
use super::{SPC_TRACE, Spc, SpcState};
use crate::bus::SpcBus;
use crate::scsi::{STATUS_CHECK_CONDITION, STATUS_GOOD, ScsiPhase};

/// Next step of the interrupt handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Re-read the interrupt status and decide
    Loop,
    /// Serve the phase the target requests
    DoPhase,
    /// Complete a command
    Finish(AcbHandle),
    /// Bus is free, start the next command
    Sched,
    /// Give up and reset everything
    Reset,
    Out,
}

impl<B: SpcBus> Spc<B> {
    /// Interrupt entry. Returns false if the chip had nothing pending.
    pub fn intr(&mut self) -> bool {
        if self.read_ints().0 == 0 {
            return false;
        }
        self.set_intr_enable(false);

        let mut ints = RegInts(0);
        let mut flow = Flow::Loop;
        loop {
            flow = match flow {
                Flow::Loop => {
                    ints = self.read_ints();
                    if SPC_TRACE {
                        trace!(
                            "intr state {} ints {:?} psns {:?}",
                            self.state,
                            ints,
                            self.read_psns()
                        );
                    }
                    self.check_conditions(&mut ints)
                }
                Flow::DoPhase => {
                    self.bus.write(SpcReg::INTS, ints.0);
                    ints = RegInts(0);
                    match self.dophase() {
                        Ok(f) => f,
                        Err(e) => {
                            error!("{}, resetting", e);
                            Flow::Reset
                        }
                    }
                }
                Flow::Finish(h) => {
                    self.pool[h].timer = None;
                    self.bus.write(SpcReg::INTS, ints.0);
                    ints = RegInts(0);
                    self.done(h);
                    Flow::Out
                }
                Flow::Sched => {
                    self.bus.write(SpcReg::INTS, ints.0);
                    ints = RegInts(0);
                    self.state = SpcState::Idle;
                    self.sched();
                    Flow::Out
                }
                Flow::Reset => {
                    // Re-enables interrupts on its own
                    self.init(true);
                    return true;
                }
                Flow::Out => break,
            };
        }

        if ints.0 != 0 {
            self.bus.write(SpcReg::INTS, ints.0);
        }
        self.set_intr_enable(true);
        true
    }

    fn check_conditions(&mut self, ints: &mut RegInts) -> Flow {
        if ints.rst() {
            error!("{}", SpcError::BusReset);
            return Flow::Reset;
        }

        // Parity errors from hardware transfers
        if self.read_serr().parity() {
            if self.prevphase == Some(ScsiPhase::MessageIn) {
                warn!("Parity error after MESSAGE IN");
                self.flags.drop_msgin = true;
                self.sched_msgout(OutMsg::ParityError);
            } else {
                warn!("Parity error in {:?}", self.prevphase);
                self.sched_msgout(OutMsg::InitDetErr);
            }
        }

        match self.state {
            SpcState::Idle | SpcState::Selecting => return self.selection_event(*ints),
            _ => (),
        }

        if ints.discon() {
            return self.bus_free(ints);
        }

        if ints.cmd_done()
            && self.prevphase == Some(ScsiPhase::MessageIn)
            && self.state != SpcState::Connected
        {
            // Waiting for the bus free that follows
            return Flow::Out;
        }

        Flow::DoPhase
    }

    fn selection_event(&mut self, ints: RegInts) -> Flow {
        if ints.sel() {
            warn!("Selected as a target, ignoring");
            return Flow::Sched;
        }

        let selecting = self.state == SpcState::Selecting;
        if ints.resel() {
            let selid = self.bus.read(SpcReg::TEMP);
            self.reselected(selid);
        } else if selecting && ints.cmd_done() {
            let Some(h) = self.pool.current() else {
                error!("{}", SpcError::InvalidState("selected without a command"));
                return Flow::Reset;
            };
            let (target, lun) = (self.pool[h].target, self.pool[h].lun);
            debug!("Selected {}:{}", target, lun);
            self.selected(h);
        } else if selecting && ints.timeout() {
            let Some(h) = self.pool.current() else {
                error!("{}", SpcError::InvalidState("selection timeout without a command"));
                return Flow::Reset;
            };
            // Selection timeout leaves the chip busy for a bit
            self.bus.delay(250);
            let acb = &mut self.pool[h];
            debug!("Selection timeout on {}:{}", acb.target, acb.lun);
            acb.set_error(ScsiError::SelectionTimeout);
            return Flow::Finish(h);
        } else if ints.cmd_done() || ints.timeout() {
            let what = if ints.cmd_done() {
                "selection done while idle"
            } else {
                "selection timeout while idle"
            };
            error!("{}", SpcError::InvalidState(what));
            return Flow::Reset;
        } else if self.state == SpcState::Idle {
            return Flow::Sched;
        } else {
            return Flow::Out;
        }

        self.flags = Default::default();
        self.prevphase = None;
        Flow::DoPhase
    }

    /// Target released the bus
    fn bus_free(&mut self, ints: &mut RegInts) -> Flow {
        let pctl = RegPctl(self.bus.read(SpcReg::PCTL)).with_busfree_int_enab(false);
        self.bus.write(SpcReg::PCTL, pctl.0);
        self.bus.write(SpcReg::INTS, ints.0);
        *ints = RegInts(0);

        match self.state {
            SpcState::Reselected => Flow::Sched,
            SpcState::Connected => {
                let Some(h) = self.pool.current() else {
                    error!("{}", SpcError::InvalidState("connected without a nexus"));
                    return Flow::Reset;
                };
                let target = self.pool[h].target;
                if self.prevphase == Some(ScsiPhase::MessageOut) {
                    // Target dropped off rather than answer the negotiation
                    match self.lastmsg {
                        Some(OutMsg::Sdtr) => {
                            info!("Target {} dropped off on SDTR, disabling sync", target);
                            self.tinfo.get_mut(target).disable_sync();
                        }
                        Some(OutMsg::Wdtr) => {
                            info!("Target {} dropped off on WDTR, disabling wide", target);
                            self.tinfo.get_mut(target).disable_wide();
                        }
                        _ => (),
                    }
                }

                let reset_done = self.lastmsg == Some(OutMsg::DevReset);
                let acb = &mut self.pool[h];
                if !self.flags.aborting {
                    warn!(
                        "Unexpected disconnect from {}:{}, reporting CHECK CONDITION",
                        acb.target, acb.lun
                    );
                    acb.target_stat = STATUS_CHECK_CONDITION;
                } else if acb.flags.reset() && reset_done {
                    info!("Device reset of target {} done", acb.target);
                    acb.target_stat = STATUS_GOOD;
                } else {
                    acb.set_error(ScsiError::UnexpectedDisconnect);
                }
                Flow::Finish(h)
            }
            SpcState::Disconnect => {
                let Some(h) = self.pool.current() else {
                    error!("{}", SpcError::InvalidState("disconnect without a nexus"));
                    return Flow::Reset;
                };
                self.pool.move_to_nexus(h);
                Flow::Sched
            }
            SpcState::CmdComplete => match self.pool.current() {
                Some(h) => Flow::Finish(h),
                None => {
                    error!("{}", SpcError::InvalidState("complete without a nexus"));
                    Flow::Reset
                }
            },
            state => {
                warn!("Bus free in state {}", state);
                Flow::Out
            }
        }
    }

    fn dophase(&mut self) -> Result<Flow, SpcError> {
        let mut spins = 0;
        let psns = loop {
            let psns = self.read_psns();
            if psns.req() {
                break psns;
            }
            if self.read_ints().0 != 0 {
                return Ok(Flow::Loop);
            }
            spins += 1;
            if spins > self.config.poll_budget {
                // Target went quiet, the command timer takes it from here
                debug!("No REQ from target in state {}", self.state);
                return Ok(Flow::Out);
            }
            self.bus.delay(1);
        };
        let Some(phase) = ScsiPhase::from_bits(psns.phase()) else {
            error!("{}", SpcError::UnexpectedPhase(psns.phase()));
            return Ok(Flow::Reset);
        };
        self.phase = Some(phase);
        let budget = self.config.poll_budget;

        let nexus = match self.state {
            SpcState::Connected => self.pool.current(),
            _ => None,
        };
        match (phase, nexus) {
            (ScsiPhase::MessageOut, _)
                if matches!(self.state, SpcState::Connected | SpcState::Reselected) =>
            {
                self.msgout()?;
            }
            (ScsiPhase::MessageIn, _)
                if matches!(self.state, SpcState::Connected | SpcState::Reselected) =>
            {
                self.msgin()?;
            }
            (ScsiPhase::Command, Some(h)) => {
                let cdb = &self.pool[h].cdb[self.cp..(self.cp + self.cleft)];
                let n = pio::transfer_out(&mut self.bus, phase, cdb, budget)?;
                self.cp += n;
                self.cleft -= n;
            }
            (ScsiPhase::DataOut, Some(h)) => {
                let data = &self.pool[h].data[self.dp..(self.dp + self.dleft)];
                let n = pio::transfer_out(&mut self.bus, phase, data, budget)?;
                self.dp += n;
                self.dleft -= n;
            }
            (ScsiPhase::DataIn, Some(h)) => {
                let (dp, dleft) = (self.dp, self.dleft);
                let data = &mut self.pool[h].data[dp..(dp + dleft)];
                let n = pio::transfer_in(&mut self.bus, phase, data, budget)?;
                self.dp += n;
                self.dleft -= n;
            }
            (ScsiPhase::Status, Some(h)) => self.status_in(h)?,
            _ => {
                error!("Unexpected phase {} in state {}", phase, self.state);
                return Ok(Flow::Reset);
            }
        }

        self.prevphase = Some(phase);
        Ok(Flow::Loop)
    }

    fn status_in(&mut self, h: AcbHandle) -> Result<(), SpcError> {
        self.bus
            .write(SpcReg::PCTL, RegPctl::expect(ScsiPhase::Status).0);
        self.wait_psns("status byte", |p| p.req())?;
        let status = self.bus.read(SpcReg::TEMP);
        self.pool[h].target_stat = status;
        self.ack_byte()?;
        debug!("Status {:02X}", status);
        Ok(())
    }
}
