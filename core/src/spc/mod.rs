//! Fujitsu MB89352 SCSI Protocol Controller, initiator side
//!
//! Commands enter as [`ScsiRequest`]s and are queued in command control
//! blocks (ACBs). The scheduler selects targets one at a time; the interrupt
//! handler then follows whatever phase the target drives until the command
//! completes or the target disconnects. Completions are delivered through a
//! channel, or returned directly in poll mode.

pub mod acb;
pub mod error;
mod intr;
pub mod msg;
pub mod pio;
pub mod regs;
mod select;
pub mod tinfo;

use arrayvec::ArrayVec;
use crossbeam_channel::{Receiver, Sender};
use log::*;
use strum::{Display, IntoStaticStr};

use crate::bus::SpcBus;
use crate::config::SpcConfig;
use crate::scsi::ScsiPhase;
use crate::tickable::{Tickable, Ticks};

use acb::{AcbHandle, AcbPool, AcbQueue, MAX_CDB_LEN};
use error::{ScsiError, SpcError};
use msg::{MsgQueue, OutMsg};
use regs::{RegInts, RegPsns, RegSctl, RegSerr, RegSsts, SpcCmd, SpcReg};
use tinfo::{MAX_LUNS, MAX_TARGETS, TargetInfo, TargetTable};

/// Register-level trace output
const SPC_TRACE: bool = false;

/// Time an abort gets before the controller is reset (ms)
pub const SPC_ABORT_TIMEOUT: Ticks = 2000;

/// Default command timeout (ms)
pub const SPC_DEFAULT_TIMEOUT: Ticks = 10_000;

pub const SPC_MAX_MSG_LEN: usize = 8;

pub type CompletionSender = Sender<Completion>;
pub type CompletionReceiver = Receiver<Completion>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr, Display)]
pub enum SpcState {
    Init,
    Idle,
    Selecting,
    Reselected,
    Connected,
    /// DISCONNECT received, waiting for bus free
    Disconnect,
    /// COMMAND COMPLETE received, waiting for bus free
    CmdComplete,
    /// Failing everything during a reset
    Cleaning,
}

/// Flags of the connection in progress
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ConnFlags {
    /// Discard the rest of the incoming message
    drop_msgin: bool,
    /// ABORT or BUS DEVICE RESET went out, bus free is expected
    aborting: bool,
}

/// A command for a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiRequest {
    pub target: u8,
    pub lun: u8,
    pub cdb: Vec<u8>,
    /// Outgoing data, or a buffer sized for incoming data
    pub data: Vec<u8>,
    /// Ticks (ms) before the command is aborted, 0 waits forever
    pub timeout: Ticks,
    /// Send BUS DEVICE RESET instead of a command
    pub reset: bool,
}

impl ScsiRequest {
    pub fn new(target: u8, lun: u8, cdb: &[u8]) -> Self {
        Self {
            target,
            lun,
            cdb: cdb.to_vec(),
            data: vec![],
            timeout: SPC_DEFAULT_TIMEOUT,
            reset: false,
        }
    }

    pub fn device_reset(target: u8) -> Self {
        Self {
            reset: true,
            ..Self::new(target, 0, &[])
        }
    }

    pub fn with_data(self, data: Vec<u8>) -> Self {
        Self { data, ..self }
    }

    pub fn with_timeout(self, timeout: Ticks) -> Self {
        Self { timeout, ..self }
    }
}

/// Outcome of a submitted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub handle: AcbHandle,
    pub target: u8,
    pub lun: u8,
    /// Status byte from the target, or why there is none
    pub result: Result<u8, ScsiError>,
    /// Bytes of the data buffer not transferred
    pub resid: usize,
    pub data: Vec<u8>,
}

pub struct Spc<B: SpcBus> {
    bus: B,
    config: SpcConfig,
    state: SpcState,

    phase: Option<ScsiPhase>,
    prevphase: Option<ScsiPhase>,
    flags: ConnFlags,

    pool: AcbPool,
    tinfo: TargetTable,

    /// Messages waiting to go out
    msgpriq: MsgQueue,
    /// Messages sent in the current MESSAGE OUT phase
    msgoutq: MsgQueue,
    currmsg: Option<OutMsg>,
    lastmsg: Option<OutMsg>,
    omess: ArrayVec<u8, SPC_MAX_MSG_LEN>,
    omess_sent: usize,
    imess: ArrayVec<u8, SPC_MAX_MSG_LEN>,

    /// Id bits latched on reselection
    selid: u8,

    // Active pointers of the connected command
    dp: usize,
    dleft: usize,
    cp: usize,
    cleft: usize,

    minsync: u8,
    maxsync: u8,

    completions: CompletionSender,
    polled: Option<Completion>,
}

impl<B: SpcBus> Spc<B> {
    /// Resets the chip and the bus, returns the controller and the receiving
    /// end of the completion channel.
    pub fn new(bus: B, config: SpcConfig) -> anyhow::Result<(Self, CompletionReceiver)> {
        config.validate()?;
        let (sender, receiver) = crossbeam_channel::unbounded();

        let mut spc = Self {
            bus,
            minsync: config.min_sync_period(),
            maxsync: config.max_sync_period(),
            pool: AcbPool::new(config.acb_count),
            tinfo: TargetTable::default(),
            config,
            state: SpcState::Init,
            phase: None,
            prevphase: None,
            flags: ConnFlags::default(),
            msgpriq: MsgQueue::empty(),
            msgoutq: MsgQueue::empty(),
            currmsg: None,
            lastmsg: None,
            omess: ArrayVec::new(),
            omess_sent: 0,
            imess: ArrayVec::new(),
            selid: 0,
            dp: 0,
            dleft: 0,
            cp: 0,
            cleft: 0,
            completions: sender,
            polled: None,
        };
        spc.init(true);
        Ok((spc, receiver))
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn config(&self) -> &SpcConfig {
        &self.config
    }

    pub fn state(&self) -> SpcState {
        self.state
    }

    pub fn target_info(&self, target: u8) -> &TargetInfo {
        self.tinfo.get(target)
    }

    /// Command blocks not in use
    pub fn free_acbs(&self) -> usize {
        self.pool.free_count()
    }

    /// Negotiate transfer parameters again on the next selection of `target`
    pub fn renegotiate(&mut self, target: u8) {
        self.tinfo.get_mut(target).arm_negotiation(&self.config);
    }

    /// Queues a request. The completion arrives on the channel.
    pub fn submit(&mut self, req: ScsiRequest) -> Result<AcbHandle, ScsiError> {
        let h = self.queue_request(req, false)?;
        if self.state == SpcState::Idle {
            self.sched();
        }
        Ok(h)
    }

    /// Runs a request to completion without interrupts
    pub fn submit_poll(&mut self, req: ScsiRequest) -> Result<Completion, ScsiError> {
        let timeout = if req.timeout == 0 {
            SPC_DEFAULT_TIMEOUT
        } else {
            req.timeout
        };
        let h = self.queue_request(req, true)?;
        if self.state == SpcState::Idle {
            self.sched();
        }
        if !self.poll(h, timeout) {
            self.timeout(h);
            if !self.poll(h, timeout) {
                self.timeout(h);
            }
        }
        match self.polled.take() {
            Some(c) if c.handle == h => Ok(c),
            _ => Err(ScsiError::CommandTimeout),
        }
    }

    /// Aborts a request. Returns false if the handle is no longer live.
    pub fn cancel(&mut self, h: AcbHandle) -> bool {
        let Some(acb) = self.pool.get_mut(h) else {
            return false;
        };
        acb.set_error(ScsiError::Aborted);
        if acb.queue() == AcbQueue::Ready && !acb.flags.nexus() {
            debug!("Cancelling {}:{} before selection", acb.target, acb.lun);
            self.done(h);
        } else if !acb.flags.abort() {
            self.abort(h);
        }
        true
    }

    /// Resets the chip, and the SCSI bus if `bus_reset`. Everything in
    /// flight is failed with ControllerReset.
    pub fn init(&mut self, bus_reset: bool) {
        if bus_reset {
            self.chip_reset();
            self.scsi_reset();
        }
        self.chip_reset();

        if self.state != SpcState::Init {
            self.state = SpcState::Cleaning;
            loop {
                let next = self
                    .pool
                    .current()
                    .or_else(|| self.pool.nexus_front())
                    .or_else(|| self.pool.ready_front());
                let Some(h) = next else {
                    break;
                };
                let acb = &mut self.pool[h];
                acb.set_error(ScsiError::ControllerReset);
                acb.timer = None;
                self.done(h);
            }
        }

        self.phase = None;
        self.prevphase = None;
        self.flags = ConnFlags::default();
        self.msgpriq = MsgQueue::empty();
        self.msgoutq = MsgQueue::empty();
        self.currmsg = None;
        self.lastmsg = None;
        self.tinfo.arm_negotiation(&self.config);
        self.state = SpcState::Idle;
        self.set_intr_enable(true);
    }

    /// Checks the queue membership and lun-busy bookkeeping
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        self.pool.check_invariants()?;
        anyhow::ensure!(
            self.pool.capacity() == self.config.acb_count,
            "Pool of {} blocks, configured for {}",
            self.pool.capacity(),
            self.config.acb_count
        );
        for h in self.pool.ready() {
            let acb = &self.pool[h];
            anyhow::ensure!(
                usize::from(acb.target) < MAX_TARGETS
                    && acb.target != self.config.initiator_id
                    && acb.lun < MAX_LUNS,
                "Ready block addressed to {}:{}",
                acb.target,
                acb.lun
            );
        }
        let mut busy = [0u8; MAX_TARGETS];
        for h in self.pool.current().into_iter().chain(self.pool.nexus()) {
            let acb = &self.pool[h];
            let bit = 1 << acb.lun;
            anyhow::ensure!(
                busy[usize::from(acb.target)] & bit == 0,
                "Two commands connected to {}:{}",
                acb.target,
                acb.lun
            );
            busy[usize::from(acb.target)] |= bit;
        }
        for (target, ti) in self.tinfo.iter().enumerate() {
            anyhow::ensure!(
                ti.lubusy == busy[target],
                "Target {} lun busy {:02X} does not match nexus {:02X}",
                target,
                ti.lubusy,
                busy[target]
            );
        }
        Ok(())
    }

    fn queue_request(&mut self, req: ScsiRequest, poll: bool) -> Result<AcbHandle, ScsiError> {
        if usize::from(req.target) >= MAX_TARGETS {
            return Err(ScsiError::InvalidRequest("target id out of range"));
        }
        if req.target == self.config.initiator_id {
            return Err(ScsiError::InvalidRequest("target id is the initiator id"));
        }
        if req.lun >= MAX_LUNS {
            return Err(ScsiError::InvalidRequest("lun out of range"));
        }
        if !req.reset && (req.cdb.is_empty() || req.cdb.len() > MAX_CDB_LEN) {
            return Err(ScsiError::InvalidRequest("command length"));
        }

        let Some(h) = self.pool.allocate() else {
            warn!("Unable to allocate command block");
            return Err(ScsiError::ResourceExhausted);
        };
        let acb = &mut self.pool[h];
        acb.target = req.target;
        acb.lun = req.lun;
        if req.reset {
            acb.flags.set_reset(true);
        } else {
            acb.cdb.clear();
            acb.cdb.extend(req.cdb.iter().copied());
        }
        acb.data_addr = 0;
        acb.data_length = req.data.len();
        acb.data = req.data;
        acb.timeout = req.timeout;
        acb.poll = poll;
        self.pool.enqueue_ready(h);

        debug!(
            "Queued {}:{} cmd {:02X?}",
            req.target, req.lun, self.pool[h].cdb
        );
        Ok(h)
    }

    /// Polls the chip until `h` completes, for `count` ms at most
    fn poll(&mut self, h: AcbHandle, count: Ticks) -> bool {
        for _ in 0..count.max(1) {
            if self.read_ints().0 != 0 {
                self.intr();
            }
            if self.polled.as_ref().is_some_and(|c| c.handle == h) {
                return true;
            }
            self.bus.delay(1000);
        }
        false
    }

    fn chip_reset(&mut self) {
        let id = self.config.initiator_id;
        regs::RegSequence::new()
            .write(
                SpcReg::SCTL,
                RegSctl(0).with_disable(true).with_ctrl_reset(true).0,
            )
            .write(SpcReg::SCMD, 0)
            .write(SpcReg::TMOD, 0)
            .write(SpcReg::PCTL, 0)
            .write(SpcReg::TEMP, 0)
            .write(SpcReg::TCH, 0)
            .write(SpcReg::TCM, 0)
            .write(SpcReg::TCL, 0)
            .write(SpcReg::INTS, 0)
            .write(
                SpcReg::SCTL,
                RegSctl(0)
                    .with_disable(true)
                    .with_abrt_enab(true)
                    .with_parity_enab(true)
                    .with_resel_enab(true)
                    .0,
            )
            .write(SpcReg::BDID, id)
            .apply(&mut self.bus);
        self.bus.delay(400);
        let sctl = RegSctl(self.bus.read(SpcReg::SCTL)).with_disable(false);
        self.bus.write(SpcReg::SCTL, sctl.0);
    }

    fn scsi_reset(&mut self) {
        info!("Resetting SCSI bus");
        let scmd = regs::RegScmd(self.bus.read(SpcReg::SCMD));
        self.bus.write(SpcReg::SCMD, scmd.with_rst(true).0);
        self.bus.delay(500);
        self.bus.write(SpcReg::SCMD, scmd.with_rst(false).0);
        self.bus.delay(50);
    }

    fn set_intr_enable(&mut self, enable: bool) {
        let sctl = RegSctl(self.bus.read(SpcReg::SCTL)).with_intr_enab(enable);
        self.bus.write(SpcReg::SCTL, sctl.0);
    }

    fn command(&mut self, cmd: SpcCmd) {
        if SPC_TRACE {
            let name: &'static str = cmd.into();
            trace!("SCMD {}", name);
        }
        self.bus.write(SpcReg::SCMD, cmd.scmd());
    }

    fn read_ints(&mut self) -> RegInts {
        RegInts(self.bus.read(SpcReg::INTS))
    }

    fn read_psns(&mut self) -> RegPsns {
        RegPsns(self.bus.read(SpcReg::PSNS))
    }

    fn read_ssts(&mut self) -> RegSsts {
        RegSsts(self.bus.read(SpcReg::SSTS))
    }

    fn read_serr(&mut self) -> RegSerr {
        RegSerr(self.bus.read(SpcReg::SERR))
    }

    /// Spins until PSNS satisfies `cond`, within the poll budget
    fn wait_psns<F>(&mut self, what: &'static str, cond: F) -> Result<RegPsns, SpcError>
    where
        F: Fn(RegPsns) -> bool,
    {
        for _ in 0..self.config.poll_budget {
            let psns = self.read_psns();
            if cond(psns) {
                return Ok(psns);
            }
            self.bus.delay(1);
        }
        Err(SpcError::PollTimeout(what))
    }

    /// Finishes a manual REQ/ACK handshake on the byte currently on the bus
    fn ack_byte(&mut self) -> Result<(), SpcError> {
        self.command(SpcCmd::SetAck);
        self.wait_psns("REQ negation", |p| !p.req())?;
        self.command(SpcCmd::ResetAck);
        Ok(())
    }

    fn restore_pointers(&mut self, h: AcbHandle) {
        let acb = &self.pool[h];
        self.dp = acb.data_addr;
        self.dleft = acb.data_length;
        self.cp = 0;
        self.cleft = acb.cdb.len();
    }

    fn save_pointers(&mut self, h: AcbHandle) {
        let acb = &mut self.pool[h];
        acb.data_addr = self.dp;
        acb.data_length = self.dleft;
    }

    fn run_timers(&mut self, ticks: Ticks) {
        for h in self.pool.expire_timers(ticks) {
            self.timeout(h);
        }
    }
}

impl<B: SpcBus> Tickable for Spc<B> {
    fn tick(&mut self, ticks: Ticks) -> anyhow::Result<Ticks> {
        self.bus.tick(ticks)?;
        self.run_timers(ticks);
        Ok(ticks)
    }
}
