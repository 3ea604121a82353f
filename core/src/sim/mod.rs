//! Simulated MB89352 on a SCSI bus with targets
//!
//! The chip model answers the same registers the controller programs, and the
//! targets run their side of the bus protocol directly from the register
//! accesses. Time only advances through [`SpcBus::delay`] and
//! [`Tickable::tick`], so selection timeouts and reselections are
//! deterministic.

pub mod disk;
pub mod target;

use std::collections::VecDeque;

use anyhow::{Result, bail};
use log::*;
use num_traits::FromPrimitive;

use crate::bus::{IrqSource, SpcBus};
use crate::scsi::*;
use crate::spc::regs::{
    FIFO_DEPTH, RegInts, RegPctl, RegPsns, RegScmd, RegSctl, RegSerr, RegSsts, SpcCmd, SpcReg,
};
use crate::tickable::{Tickable, Ticks};

use target::{ScsiCmdResult, ScsiTarget};

const SIM_TRACE: bool = false;

/// Fastest period factor the simulated targets accept
const SIM_MIN_PERIOD: u8 = 25;
/// Largest offset the simulated targets accept
const SIM_MAX_OFFSET: u8 = 8;

/// A message code no target or initiator implements
pub const SIM_UNKNOWN_MSG: u8 = 0x0F;

/// When a target gives up the bus in the middle of a command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisconnectAt {
    #[default]
    Never,
    /// Right after the command bytes
    AfterCommand,
    /// After this many bytes of DATA IN, saving the data pointer first
    MidData(usize),
}

/// Target misbehaviour and protocol options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quirks {
    /// Disconnect if the initiator allows it
    pub disconnect: DisconnectAt,
    /// Time before a disconnected target reselects (ms)
    pub reselect_delay: Ticks,
    /// Answer (or propose) SDTR with this (period, offset)
    pub sdtr_offer: Option<(u8, u8)>,
    /// MESSAGE REJECT any SDTR
    pub reject_sdtr: bool,
    /// Answer the first SDTR with MESSAGE PARITY ERROR
    pub parity_error_on_msgout: bool,
    /// Ask for the MESSAGE OUT bytes again once
    pub retransmit_msgout_once: bool,
    /// Keep the bus without REQ after the command bytes
    pub hang_after_command: bool,
    /// Never answer ATN while hanging
    pub ignore_atn: bool,
    /// Send COMMAND COMPLETE after ABORT instead of going bus free
    pub complete_on_abort: bool,
    /// Drop off the bus after the command bytes
    pub bus_free_after_command: bool,
    /// First MESSAGE IN byte has bad parity
    pub msgin_parity_once: bool,
    /// First DATA IN byte has bad parity
    pub data_parity_once: bool,
    /// Send a message nobody knows before the command phase
    pub unknown_msg: bool,
    /// MESSAGE REJECT this single-byte message as soon as it arrives
    pub reject_msg: Option<u8>,
    /// Take BUS DEVICE RESET like a NOOP
    pub ignore_dev_reset: bool,
    /// Drop off the bus once a MESSAGE OUT phase ends
    pub bus_free_after_msgout: bool,
    /// Report this status byte whatever the command did
    pub status: Option<u8>,
}

/// Progress of the command on the target side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Command,
    DataIn,
    DataOut,
    Status,
    Complete,
    Hang,
}

/// What the target does next on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Assert REQ for the next byte
    Req,
    /// Keep the bus, no REQ
    Hold,
    BusFree,
    /// Disconnect and reselect later
    Park,
}

/// Target side of an I_T_L nexus
struct Connection {
    target: u8,
    lun: u8,
    disc_priv: bool,
    quirks: Quirks,

    phase: ScsiPhase,
    req: bool,
    /// REQ is held back until the reselection interrupt is cleared
    hold_req: bool,
    /// Byte on the bus has bad parity
    corrupt: bool,

    /// Bytes left in the current input phase
    inbuf: VecDeque<u8>,
    /// Message being received
    msgbuf: Vec<u8>,
    /// All bytes of the current MESSAGE OUT phase
    msgout: Vec<u8>,
    /// Finished MESSAGE OUT phase, for the log
    logged: Option<Vec<u8>>,
    msg_in: VecDeque<Vec<u8>>,
    last_msg_in: Vec<u8>,

    stage: Stage,
    cdb: Vec<u8>,
    data_in: VecDeque<u8>,
    data_out: Vec<u8>,
    want: usize,
    data_sent: usize,
    status: u8,

    exit: Option<Step>,
    /// ABORT or BUS DEVICE RESET, leave the bus at once
    drop_bus: bool,
    /// Message just received is rejected, reply before taking more
    refused: bool,
    aborted: bool,
    reset: bool,
    disconnected: bool,
    /// Our SDTR is out, the next one is the answer
    sdtr_sent: bool,
    /// Agreed (period, offset)
    sync: (u8, u8),
}

impl Connection {
    fn new(target: u8, t: &SimTarget) -> Self {
        Self {
            target,
            lun: 0,
            disc_priv: false,
            quirks: t.quirks,
            phase: ScsiPhase::MessageOut,
            req: false,
            hold_req: false,
            corrupt: false,
            inbuf: VecDeque::new(),
            msgbuf: vec![],
            msgout: vec![],
            logged: None,
            msg_in: VecDeque::new(),
            last_msg_in: vec![],
            stage: Stage::Command,
            cdb: vec![],
            data_in: VecDeque::new(),
            data_out: vec![],
            want: 0,
            data_sent: 0,
            status: STATUS_GOOD,
            exit: None,
            drop_bus: false,
            refused: false,
            aborted: false,
            reset: false,
            disconnected: false,
            sdtr_sent: false,
            sync: t.sync,
        }
    }

    /// Byte the target drives in an input phase
    fn bus_byte(&self) -> Option<u8> {
        if self.req && !self.hold_req && self.phase.is_input() {
            self.inbuf.front().copied()
        } else {
            None
        }
    }

    /// The initiator took the byte on the bus
    fn take_in(&mut self) {
        self.req = false;
        self.corrupt = false;
        if self.inbuf.pop_front().is_some() && self.phase == ScsiPhase::DataIn {
            self.data_sent += 1;
        }
    }

    /// The initiator handed over a byte
    fn put_out(&mut self, b: u8) {
        self.req = false;
        match self.phase {
            ScsiPhase::Command => self.cdb.push(b),
            ScsiPhase::DataOut => {
                self.data_out.push(b);
                self.want = self.want.saturating_sub(1);
            }
            ScsiPhase::MessageOut => {
                self.msgbuf.push(b);
                self.msgout.push(b);
            }
            _ => (),
        }
    }

    /// Byte handshake is over, decide what comes next
    fn next(&mut self, atn: bool, dev: &mut dyn ScsiTarget) -> Step {
        match self.phase {
            ScsiPhase::Command => {
                let len = self.cdb.first().and_then(|&c| scsi_cmd_len(c)).unwrap_or(6);
                if self.cdb.len() < len {
                    return Step::Req;
                }
                self.execute(dev);
            }
            ScsiPhase::DataOut => {
                if self.want > 0 {
                    return Step::Req;
                }
                let data = std::mem::take(&mut self.data_out);
                let result = dev.cmd(&self.cdb, Some(&data));
                self.finish(result, dev);
            }
            ScsiPhase::DataIn => {
                if let DisconnectAt::MidData(n) = self.quirks.disconnect {
                    if self.disc_priv
                        && !self.disconnected
                        && self.data_sent == n
                        && !self.inbuf.is_empty()
                    {
                        self.disconnected = true;
                        self.data_in = std::mem::take(&mut self.inbuf);
                        self.msg_in.push_back(vec![MSG_SAVEDATAPOINTER]);
                        self.msg_in.push_back(vec![MSG_DISCONNECT]);
                        self.exit = Some(Step::Park);
                        return self.advance(atn, dev);
                    }
                }
                if !self.inbuf.is_empty() {
                    return Step::Req;
                }
                self.stage = Stage::Status;
            }
            ScsiPhase::Status => self.stage = Stage::Complete,
            ScsiPhase::MessageIn => {
                if !self.inbuf.is_empty() {
                    return Step::Req;
                }
            }
            ScsiPhase::MessageOut => {
                if msg_complete(&self.msgbuf) {
                    let msg = std::mem::take(&mut self.msgbuf);
                    self.receive_message(&msg);
                    if self.drop_bus {
                        self.logged = Some(std::mem::take(&mut self.msgout));
                        return Step::BusFree;
                    }
                    if self.refused {
                        self.refused = false;
                        self.logged = Some(std::mem::take(&mut self.msgout));
                        return self.advance(atn, dev);
                    }
                }
                if atn || !self.msgbuf.is_empty() {
                    return Step::Req;
                }
                self.logged = Some(std::mem::take(&mut self.msgout));
                if self.quirks.retransmit_msgout_once {
                    self.quirks.retransmit_msgout_once = false;
                    debug!("Target {} requests MESSAGE OUT again", self.target);
                    return Step::Req;
                }
                if self.quirks.bus_free_after_msgout {
                    return Step::BusFree;
                }
            }
        }
        self.advance(atn, dev)
    }

    /// Enters the next phase
    fn advance(&mut self, atn: bool, dev: &mut dyn ScsiTarget) -> Step {
        if let Some(msg) = self.msg_in.pop_front() {
            self.last_msg_in.clone_from(&msg);
            self.inbuf = msg.into();
            self.phase = ScsiPhase::MessageIn;
            if self.quirks.msgin_parity_once {
                self.quirks.msgin_parity_once = false;
                self.corrupt = true;
            }
            return Step::Req;
        }
        if atn {
            self.phase = ScsiPhase::MessageOut;
            self.msgbuf.clear();
            return Step::Req;
        }
        if let Some(exit) = self.exit.take() {
            return exit;
        }

        match self.stage {
            Stage::Command => {
                if self.quirks.unknown_msg {
                    self.quirks.unknown_msg = false;
                    self.msg_in.push_back(vec![SIM_UNKNOWN_MSG]);
                    return self.advance(atn, dev);
                }
                if !self.sdtr_sent {
                    if let Some((period, offset)) = self.quirks.sdtr_offer.take() {
                        self.sdtr_sent = true;
                        self.msg_in.push_back(sdtr(period, offset));
                        return self.advance(atn, dev);
                    }
                }
                self.phase = ScsiPhase::Command;
                self.cdb.clear();
                Step::Req
            }
            Stage::DataIn => {
                self.inbuf = std::mem::take(&mut self.data_in);
                if self.inbuf.is_empty() {
                    self.stage = Stage::Status;
                    return self.advance(atn, dev);
                }
                self.phase = ScsiPhase::DataIn;
                if self.quirks.data_parity_once {
                    self.quirks.data_parity_once = false;
                    self.corrupt = true;
                }
                Step::Req
            }
            Stage::DataOut => {
                self.phase = ScsiPhase::DataOut;
                Step::Req
            }
            Stage::Status => {
                self.phase = ScsiPhase::Status;
                self.inbuf = VecDeque::from([self.quirks.status.unwrap_or(self.status)]);
                Step::Req
            }
            Stage::Complete => {
                self.msg_in.push_back(vec![MSG_CMDCOMPLETE]);
                self.exit = Some(Step::BusFree);
                self.advance(atn, dev)
            }
            Stage::Hang => Step::Hold,
        }
    }

    fn execute(&mut self, dev: &mut dyn ScsiTarget) {
        if SIM_TRACE {
            trace!("Target {} command {:02X?}", self.target, self.cdb);
        }
        if self.quirks.bus_free_after_command {
            self.exit = Some(Step::BusFree);
            return;
        }
        if self.quirks.hang_after_command {
            self.stage = Stage::Hang;
            return;
        }
        let result = dev.cmd(&self.cdb, None);
        self.finish(result, dev);

        if self.quirks.disconnect == DisconnectAt::AfterCommand
            && self.disc_priv
            && !self.disconnected
        {
            self.disconnected = true;
            self.msg_in.push_back(vec![MSG_DISCONNECT]);
            self.exit = Some(Step::Park);
        }
    }

    fn finish(&mut self, result: Result<ScsiCmdResult>, dev: &mut dyn ScsiTarget) {
        match result {
            Ok(ScsiCmdResult::Status(status)) => {
                self.status = status;
                self.stage = Stage::Status;
            }
            Ok(ScsiCmdResult::DataIn(data)) => {
                self.status = STATUS_GOOD;
                self.data_in = data.into();
                self.stage = Stage::DataIn;
            }
            Ok(ScsiCmdResult::DataOut(0)) => {
                let result = dev.cmd(&self.cdb, Some(&[]));
                self.finish(result, dev);
            }
            Ok(ScsiCmdResult::DataOut(len)) => {
                self.want = len;
                self.data_out.clear();
                self.stage = Stage::DataOut;
            }
            Err(e) => {
                error!("Command {:02X?} failed: {:#}", self.cdb, e);
                self.status = STATUS_CHECK_CONDITION;
                self.stage = Stage::Status;
            }
        }
    }

    fn receive_message(&mut self, msg: &[u8]) {
        if msg.len() == 1 && self.quirks.reject_msg == Some(msg[0]) {
            debug!("Target {} rejects message {:02X}", self.target, msg[0]);
            self.msg_in.push_front(vec![MSG_MESSAGE_REJECT]);
            self.refused = true;
            return;
        }
        match *msg {
            [m] if msg_is_identify(m) => {
                self.lun = m & 7;
                self.disc_priv = m & 0x40 != 0;
            }
            [MSG_EXTENDED, MSG_EXT_SDTR_LEN, MSG_EXT_SDTR, period, offset] => {
                self.receive_sdtr(period, offset);
            }
            [MSG_EXTENDED, MSG_EXT_WDTR_LEN, MSG_EXT_WDTR, _] => {
                // 8 bit only
                self.msg_in.retain(|m| !is_ext(m, MSG_EXT_WDTR));
                self.msg_in
                    .push_back(vec![MSG_EXTENDED, MSG_EXT_WDTR_LEN, MSG_EXT_WDTR, 0]);
            }
            [MSG_ABORT] => {
                info!("Target {} lun {} aborted", self.target, self.lun);
                self.aborted = true;
                self.msg_in.clear();
                if self.quirks.complete_on_abort {
                    self.msg_in.push_back(vec![MSG_CMDCOMPLETE]);
                    self.exit = Some(Step::BusFree);
                } else {
                    self.drop_bus = true;
                }
            }
            [MSG_BUS_DEV_RESET] if self.quirks.ignore_dev_reset => {
                debug!("Target {} ignores BUS DEVICE RESET", self.target);
            }
            [MSG_BUS_DEV_RESET] => {
                info!("Target {} reset", self.target);
                self.reset = true;
                self.msg_in.clear();
                self.drop_bus = true;
            }
            [MSG_PARITY_ERROR] => {
                if !self.last_msg_in.is_empty() {
                    self.msg_in.push_front(self.last_msg_in.clone());
                }
            }
            [MSG_INITIATOR_DET_ERR | MSG_MESSAGE_REJECT | MSG_NOOP] => {
                debug!("Target {} got message {:02X}", self.target, msg[0]);
            }
            _ => {
                warn!("Target {} rejects message {:02X?}", self.target, msg);
                self.msg_in.push_back(vec![MSG_MESSAGE_REJECT]);
            }
        }
    }

    fn receive_sdtr(&mut self, period: u8, offset: u8) {
        if self.quirks.parity_error_on_msgout {
            self.quirks.parity_error_on_msgout = false;
            self.msg_in.push_back(vec![MSG_PARITY_ERROR]);
            return;
        }
        if self.quirks.reject_sdtr {
            self.msg_in.push_back(vec![MSG_MESSAGE_REJECT]);
            return;
        }
        if self.sdtr_sent {
            // Answer to our proposal
            self.sdtr_sent = false;
            self.sync = (period, offset);
            return;
        }
        let (period, offset) = self.quirks.sdtr_offer.take().unwrap_or((
            period.max(SIM_MIN_PERIOD),
            offset.min(SIM_MAX_OFFSET),
        ));
        self.sync = (period, offset);
        self.sdtr_sent = true;
        self.msg_in.retain(|m| !is_ext(m, MSG_EXT_SDTR));
        self.msg_in.push_back(sdtr(period, offset));
    }
}

fn sdtr(period: u8, offset: u8) -> Vec<u8> {
    vec![MSG_EXTENDED, MSG_EXT_SDTR_LEN, MSG_EXT_SDTR, period, offset]
}

fn is_ext(msg: &[u8], code: u8) -> bool {
    msg.first() == Some(&MSG_EXTENDED) && msg.get(2) == Some(&code)
}

/// A device on the bus
pub struct SimTarget {
    pub dev: Box<dyn ScsiTarget>,
    pub quirks: Quirks,
    /// Agreed (period, offset), kept across connections
    pub sync: (u8, u8),
}

/// Disconnected nexus waiting to reselect
struct Parked {
    conn: Connection,
    due_us: u64,
}

/// MB89352 with its SCSI bus
pub struct SimSpc {
    clock_mhz: u32,
    time_us: u64,

    bdid: u8,
    sctl: RegSctl,
    scmd: RegScmd,
    tmod: u8,
    ints: RegInts,
    serr: RegSerr,
    pctl: RegPctl,
    /// Last value written to TEMP
    temp: u8,
    /// Id bits seen during reselection
    temp_latch: u8,
    tc: usize,
    fifo: VecDeque<u8>,
    /// Programmed transfer in progress
    xfer: bool,
    /// Transfer started with a zero count
    unlimited: bool,

    // Initiator driven bus signals
    atn: bool,
    ack: bool,

    /// Selection timeout deadline
    selecting: Option<u64>,

    targets: [Option<SimTarget>; 8],
    conn: Option<Connection>,
    parked: Vec<Parked>,
    resel_beats_select: bool,

    /// (target, bytes) of every MESSAGE OUT phase
    msgout_log: Vec<(u8, Vec<u8>)>,
}

impl SimSpc {
    pub fn new(clock_mhz: u32) -> Self {
        Self {
            clock_mhz: clock_mhz.max(1),
            time_us: 0,
            bdid: 0,
            sctl: RegSctl(0).with_disable(true),
            scmd: RegScmd(0),
            tmod: 0,
            ints: RegInts(0),
            serr: RegSerr(0),
            pctl: RegPctl(0),
            temp: 0,
            temp_latch: 0,
            tc: 0,
            fifo: VecDeque::with_capacity(FIFO_DEPTH),
            xfer: false,
            unlimited: false,
            atn: false,
            ack: false,
            selecting: None,
            targets: Default::default(),
            conn: None,
            parked: vec![],
            resel_beats_select: false,
            msgout_log: vec![],
        }
    }

    pub fn attach(&mut self, id: u8, dev: Box<dyn ScsiTarget>, quirks: Quirks) -> Result<()> {
        if id > 7 {
            bail!("SCSI ID out of range: {}", id);
        }
        self.targets[usize::from(id)] = Some(SimTarget {
            dev,
            quirks,
            sync: (0, 0),
        });
        Ok(())
    }

    pub fn detach(&mut self, id: u8) {
        if let Some(t) = self.targets.get_mut(usize::from(id)) {
            *t = None;
        }
    }

    /// Changes the behaviour of `id` for following connections
    pub fn set_quirks(&mut self, id: u8, quirks: Quirks) {
        if let Some(Some(t)) = self.targets.get_mut(usize::from(id)) {
            t.quirks = quirks;
        }
    }

    pub fn target(&self, id: u8) -> Option<&SimTarget> {
        self.targets.get(usize::from(id)).and_then(Option::as_ref)
    }

    /// Every MESSAGE OUT phase seen so far, as (target, bytes)
    pub fn msgout_log(&self) -> &[(u8, Vec<u8>)] {
        &self.msgout_log
    }

    /// Message bytes sent to `target`, in order
    pub fn msgout_to(&self, target: u8) -> Vec<Vec<u8>> {
        self.msgout_log
            .iter()
            .filter(|(t, _)| *t == target)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Synchronous parameters `target` agreed to
    pub fn agreed_sync(&self, target: u8) -> Option<(u8, u8)> {
        self.target(target).map(|t| t.sync)
    }

    /// Number of disconnected nexuses
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    pub fn connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn time_ms(&self) -> Ticks {
        self.time_us / 1000
    }

    /// A disconnected target wins the next arbitration against our SELECT
    pub fn set_resel_beats_select(&mut self, v: bool) {
        self.resel_beats_select = v;
    }

    /// Makes `target` reselect with `lun` although no command is disconnected
    pub fn inject_reselect(&mut self, target: u8, lun: u8) -> Result<()> {
        let Some(t) = self.target(target) else {
            bail!("No target at id {}", target);
        };
        let mut conn = Connection::new(target, t);
        conn.lun = lun;
        conn.disc_priv = true;
        conn.stage = Stage::Status;
        self.parked.push(Parked {
            conn,
            due_us: self.time_us,
        });
        self.pump();
        Ok(())
    }

    /// Another initiator pulls RST
    pub fn assert_bus_reset(&mut self) {
        self.bus_reset();
        self.pump();
    }

    fn bus_reset(&mut self) {
        info!("SCSI bus reset");
        self.conn = None;
        self.parked.clear();
        self.selecting = None;
        self.xfer = false;
        self.fifo.clear();
        self.atn = false;
        self.ack = false;
        self.ints.set_rst(true);
    }

    fn chip_reset(&mut self) {
        self.scmd = RegScmd(0);
        self.tmod = 0;
        self.ints = RegInts(0);
        self.serr = RegSerr(0);
        self.pctl = RegPctl(0);
        self.tc = 0;
        self.fifo.clear();
        self.xfer = false;
        self.unlimited = false;
        self.selecting = None;
        self.atn = false;
        self.ack = false;
    }

    fn psns(&self) -> RegPsns {
        let Some(c) = &self.conn else {
            return RegPsns(0).with_atn(self.atn);
        };
        RegPsns(0)
            .with_phase(c.phase as u8)
            .with_bsy(true)
            .with_atn(self.atn)
            .with_ack(self.ack)
            .with_req(c.req && !c.hold_req)
    }

    fn ssts(&self) -> RegSsts {
        let busy = self.conn.is_some() || self.selecting.is_some();
        RegSsts(0)
            .with_initiator(self.conn.is_some())
            .with_spc_busy(busy)
            .with_xfr(self.xfer)
            .with_tc0(self.tc == 0)
            .with_dreg_full(self.fifo.len() >= FIFO_DEPTH)
            .with_dreg_empty(self.fifo.is_empty())
    }

    /// Selection timeout in us for the TCH/TCM setting
    fn selection_window_us(&self) -> u64 {
        let x = (self.tc >> 8) as u64;
        (x * 256 + 15) * 2 / u64::from(self.clock_mhz)
    }

    fn command(&mut self, val: u8) {
        let scmd = RegScmd(val);
        if scmd.rst() && !self.scmd.rst() {
            self.bus_reset();
        }
        self.scmd = scmd;

        let Some(cmd) = SpcCmd::from_u8(scmd.op()) else {
            return;
        };
        if SIM_TRACE {
            let name: &'static str = cmd.into();
            trace!("Sim command {}", name);
        }
        match cmd {
            SpcCmd::BusRelease => (),
            SpcCmd::Select => self.select(),
            SpcCmd::ResetAtn => self.atn = false,
            SpcCmd::SetAtn => self.attention(),
            SpcCmd::Transfer => {
                self.fifo.clear();
                self.xfer = true;
                self.unlimited = self.tc == 0;
            }
            SpcCmd::TransferPause => self.xfer = false,
            SpcCmd::SetAck => self.set_ack(),
            SpcCmd::ResetAck => {
                if self.ack {
                    self.ack = false;
                    self.target_next();
                }
            }
        }
    }

    fn select(&mut self) {
        if self.conn.is_some() || self.selecting.is_some() {
            warn!("SELECT while the bus is busy");
            return;
        }
        self.xfer = false;
        if self.resel_beats_select && !self.parked.is_empty() {
            self.resel_beats_select = false;
            debug!("Reselection wins arbitration");
            self.reselect(0);
            return;
        }

        let ids = self.temp & !(1 << self.bdid);
        let window = self.selection_window_us();
        if ids.count_ones() != 1 {
            warn!("SELECT with id bits {:02X}", self.temp);
            self.selecting = Some(self.time_us + window);
            return;
        }
        let id = ids.trailing_zeros() as u8;
        let Some(t) = self.targets[usize::from(id)].as_mut() else {
            self.selecting = Some(self.time_us + window);
            return;
        };

        let mut conn = Connection::new(id, t);
        let step = conn.advance(self.atn, t.dev.as_mut());
        self.conn = Some(conn);
        self.ints.set_cmd_done(true);
        self.apply(step);
    }

    fn reselect(&mut self, idx: usize) {
        let mut conn = self.parked.remove(idx).conn;
        let Some(t) = self.targets[usize::from(conn.target)].as_mut() else {
            return;
        };
        debug!("Target {} lun {} reselects", conn.target, conn.lun);
        self.temp_latch = (1 << self.bdid) | (1 << conn.target);
        conn.hold_req = true;
        conn.msg_in
            .push_front(vec![msg_identify(conn.lun, conn.disc_priv)]);
        let step = conn.advance(self.atn, t.dev.as_mut());
        self.conn = Some(conn);
        self.ints.set_resel(true);
        self.apply(step);
    }

    fn attention(&mut self) {
        self.atn = true;
        let Some(c) = self.conn.as_mut() else {
            return;
        };
        if c.stage != Stage::Hang || c.req || self.ack || c.quirks.ignore_atn {
            return;
        }
        let Some(t) = self.targets[usize::from(c.target)].as_mut() else {
            return;
        };
        let step = c.advance(true, t.dev.as_mut());
        self.apply(step);
    }

    fn set_ack(&mut self) {
        let Some(c) = self.conn.as_mut() else {
            return;
        };
        if self.ack || !c.req || c.hold_req {
            return;
        }
        self.ack = true;
        if c.phase.is_input() {
            c.take_in();
        } else {
            c.put_out(self.temp);
        }
    }

    /// Lets the connected target continue after a byte
    fn target_next(&mut self) {
        let Some(c) = self.conn.as_mut() else {
            return;
        };
        let Some(t) = self.targets[usize::from(c.target)].as_mut() else {
            return;
        };
        let step = c.next(self.atn, t.dev.as_mut());
        self.apply(step);
    }

    fn apply(&mut self, step: Step) {
        if let Some(c) = self.conn.as_mut() {
            if let Some(bytes) = c.logged.take() {
                self.msgout_log.push((c.target, bytes));
            }
        }
        match step {
            Step::Req => self.raise_req(),
            Step::Hold => (),
            Step::BusFree => self.bus_free(),
            Step::Park => self.park(),
        }
    }

    fn raise_req(&mut self) {
        let Some(c) = self.conn.as_mut() else {
            return;
        };
        c.req = true;
        if !c.hold_req && c.phase as u8 != self.pctl.phase() {
            self.ints.set_sr_req(true);
        }
    }

    fn bus_free(&mut self) {
        let Some(c) = self.conn.take() else {
            return;
        };
        if c.reset {
            self.parked.retain(|p| p.conn.target != c.target);
        } else if c.aborted {
            self.parked
                .retain(|p| p.conn.target != c.target || p.conn.lun != c.lun);
        }
        self.end_connection(&c);
    }

    fn park(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        conn.req = false;
        let due_us = self.time_us + conn.quirks.reselect_delay * 1000;
        self.end_connection(&conn);
        self.parked.push(Parked { conn, due_us });
    }

    fn end_connection(&mut self, conn: &Connection) {
        if let Some(t) = self.targets[usize::from(conn.target)].as_mut() {
            t.sync = conn.sync;
        }
        self.ints.set_discon(true);
        self.atn = false;
        self.ack = false;
        self.xfer = false;
    }

    /// Runs everything that happens without the initiator
    fn pump(&mut self) {
        if let Some(deadline) = self.selecting {
            if self.time_us >= deadline {
                self.selecting = None;
                self.ints.set_timeout(true);
            }
        } else if self.conn.is_none()
            && self.ints.0 == 0
            && self.sctl.resel_enab()
            && !self.sctl.disable()
        {
            if let Some(idx) = self.parked.iter().position(|p| p.due_us <= self.time_us) {
                self.reselect(idx);
            }
        }
        while self.transfer_step() {}
    }

    /// Moves one byte of a programmed transfer. Returns false once nothing
    /// can move.
    fn transfer_step(&mut self) -> bool {
        if !self.xfer {
            return false;
        }
        if !self.unlimited && self.tc == 0 {
            self.xfer = false;
            self.ints.set_cmd_done(true);
            return false;
        }
        let Some(c) = self.conn.as_mut() else {
            return false;
        };
        if !c.req || c.hold_req || self.ack {
            return false;
        }
        if c.phase as u8 != self.pctl.phase() {
            // Phase mismatch stops the transfer
            self.xfer = false;
            self.ints.set_sr_req(true);
            return false;
        }

        if c.phase.is_input() {
            if self.fifo.len() >= FIFO_DEPTH {
                return false;
            }
            let Some(b) = c.inbuf.front().copied() else {
                return false;
            };
            if c.corrupt {
                self.serr.set_scsi_parity(true);
            }
            self.fifo.push_back(b);
            c.take_in();
        } else {
            let b = match self.fifo.pop_front() {
                Some(b) => b,
                None if self.unlimited => 0,
                None => return false,
            };
            c.put_out(b);
        }
        if !self.unlimited {
            self.tc -= 1;
        }
        self.target_next();
        true
    }

    fn set_tc_byte(&mut self, shift: usize, val: u8) {
        self.tc = (self.tc & !(0xFF << shift)) | (usize::from(val) << shift);
    }

    fn advance_time(&mut self, us: u64) {
        self.time_us += us;
        self.pump();
    }
}

impl SpcBus for SimSpc {
    fn read(&mut self, reg: SpcReg) -> u8 {
        let val = match reg {
            SpcReg::BDID => 1 << self.bdid,
            SpcReg::SCTL => self.sctl.0,
            SpcReg::SCMD => self.scmd.0,
            SpcReg::TMOD => self.tmod,
            SpcReg::INTS => self.ints.0,
            SpcReg::PSNS => self.psns().0,
            SpcReg::SSTS => self.ssts().0,
            SpcReg::SERR => std::mem::take(&mut self.serr).0,
            SpcReg::PCTL => self.pctl.0,
            SpcReg::MBC => (self.fifo.len() & 0x0F) as u8,
            SpcReg::DREG => self.fifo.pop_front().unwrap_or(0),
            SpcReg::TEMP => match self.conn.as_ref().and_then(Connection::bus_byte) {
                Some(b) => {
                    if self.conn.as_ref().is_some_and(|c| c.corrupt) {
                        self.serr.set_scsi_parity(true);
                    }
                    b
                }
                None => self.temp_latch,
            },
            SpcReg::TCH => (self.tc >> 16) as u8,
            SpcReg::TCM => (self.tc >> 8) as u8,
            SpcReg::TCL => self.tc as u8,
            SpcReg::EXBF => 0,
        };
        self.pump();
        val
    }

    fn write(&mut self, reg: SpcReg, val: u8) {
        match reg {
            SpcReg::BDID => self.bdid = val & 7,
            SpcReg::SCTL => {
                let sctl = RegSctl(val);
                if sctl.ctrl_reset() {
                    self.chip_reset();
                }
                self.sctl = sctl;
            }
            SpcReg::SCMD => self.command(val),
            SpcReg::TMOD => self.tmod = val,
            SpcReg::INTS => {
                self.ints.0 &= !val;
                if RegInts(val).resel() {
                    if let Some(c) = self.conn.as_mut() {
                        if c.hold_req {
                            c.hold_req = false;
                            if c.req {
                                self.raise_req();
                            }
                        }
                    }
                }
            }
            SpcReg::PCTL => self.pctl = RegPctl(val),
            SpcReg::DREG => {
                if self.fifo.len() < FIFO_DEPTH {
                    self.fifo.push_back(val);
                } else {
                    warn!("DREG write with full FIFO");
                }
            }
            SpcReg::TEMP => self.temp = val,
            SpcReg::TCH => self.set_tc_byte(16, val),
            SpcReg::TCM => self.set_tc_byte(8, val),
            SpcReg::TCL => self.set_tc_byte(0, val),
            SpcReg::PSNS | SpcReg::SSTS | SpcReg::SERR | SpcReg::MBC | SpcReg::EXBF => (),
        }
        self.pump();
    }

    fn delay(&mut self, us: u32) {
        self.advance_time(u64::from(us));
    }
}

impl Tickable for SimSpc {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks> {
        self.advance_time(ticks * 1000);
        Ok(ticks)
    }
}

impl IrqSource for SimSpc {
    fn get_irq(&mut self) -> Option<u8> {
        (self.sctl.intr_enab() && self.ints.0 != 0).then_some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::disk::ScsiTargetDisk;
    use super::*;
    use crate::spc::regs::RegSequence;

    fn sim() -> SimSpc {
        let mut s = SimSpc::new(20);
        s.write(SpcReg::SCTL, RegSctl(0).with_resel_enab(true).0);
        s.write(SpcReg::BDID, 7);
        s
    }

    fn select(s: &mut SimSpc, target: u8) {
        RegSequence::new()
            .write(SpcReg::SCMD, SpcCmd::SetAtn.scmd())
            .write(SpcReg::TEMP, 0x80 | (1 << target))
            .write(SpcReg::TCH, 38)
            .write(SpcReg::TCM, 37)
            .write(SpcReg::TCL, 3)
            .write(SpcReg::SCMD, SpcCmd::Select.scmd())
            .apply(s);
    }

    #[test]
    fn selection_timeout_window() {
        let mut s = sim();
        select(&mut s, 3);
        assert_eq!(s.read(SpcReg::INTS), 0);
        assert!(RegSsts(s.read(SpcReg::SSTS)).spc_busy());

        s.tick(249).unwrap();
        assert_eq!(s.read(SpcReg::INTS), 0);
        s.tick(1).unwrap();
        assert!(RegInts(s.read(SpcReg::INTS)).timeout());
        assert!(!s.connected());
    }

    #[test]
    fn selection_goes_to_message_out() {
        let mut s = sim();
        s.attach(2, Box::new(ScsiTargetDisk::new(16)), Quirks::default())
            .unwrap();
        select(&mut s, 2);

        let ints = RegInts(s.read(SpcReg::INTS));
        assert!(ints.cmd_done());
        let psns = RegPsns(s.read(SpcReg::PSNS));
        assert!(psns.req());
        assert!(psns.atn());
        assert_eq!(psns.phase(), ScsiPhase::MessageOut as u8);
    }

    #[test]
    fn manual_message_in() {
        let mut s = sim();
        s.attach(2, Box::new(ScsiTargetDisk::new(16)), Quirks::default())
            .unwrap();
        s.inject_reselect(2, 1).unwrap();

        assert!(RegInts(s.read(SpcReg::INTS)).resel());
        assert_eq!(s.read(SpcReg::TEMP), 0x84);
        // No REQ until the interrupt is cleared
        assert!(!RegPsns(s.read(SpcReg::PSNS)).req());
        s.write(SpcReg::INTS, RegInts(0).with_resel(true).0);

        let psns = RegPsns(s.read(SpcReg::PSNS));
        assert!(psns.req());
        assert_eq!(psns.phase(), ScsiPhase::MessageIn as u8);
        assert_eq!(s.read(SpcReg::TEMP), msg_identify(1, true));

        s.write(SpcReg::SCMD, SpcCmd::SetAck.scmd());
        assert!(!RegPsns(s.read(SpcReg::PSNS)).req());
        s.write(SpcReg::SCMD, SpcCmd::ResetAck.scmd());
        // Status byte follows
        let psns = RegPsns(s.read(SpcReg::PSNS));
        assert!(psns.req());
        assert_eq!(psns.phase(), ScsiPhase::Status as u8);
    }

    #[test]
    fn bus_reset_drops_everything() {
        let mut s = sim();
        s.attach(2, Box::new(ScsiTargetDisk::new(16)), Quirks::default())
            .unwrap();
        select(&mut s, 2);
        assert!(s.connected());
        s.assert_bus_reset();
        assert!(!s.connected());
        assert!(RegInts(s.read(SpcReg::INTS)).rst());
    }
}
