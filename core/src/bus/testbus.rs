use anyhow::Result;

use super::SpcBus;
use crate::scsi::ScsiPhase;
use crate::spc::regs::{FIFO_DEPTH, RegPctl, RegSsts, SpcReg};
use crate::tickable::{Tickable, Ticks};

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TraceEntry {
    pub reg: SpcReg,
    pub access: Access,
    pub val: u8,
    pub time_us: u64,
}

/// Plain register file with an access trace
pub struct Testbus {
    pub regs: HashMap<SpcReg, u8>,
    trace: RefCell<Vec<TraceEntry>>,
    time_us: u64,
    trace_enabled: bool,
}

impl Testbus {
    pub fn new() -> Self {
        Self {
            regs: HashMap::new(),
            trace: RefCell::new(vec![]),
            time_us: 0,
            trace_enabled: false,
        }
    }

    pub fn reset_trace(&mut self) {
        self.trace.borrow_mut().clear();
        self.trace_enabled = true;
    }

    pub fn get_trace(&self) -> Vec<TraceEntry> {
        self.trace.borrow().clone()
    }

    /// Only the writes of the trace, as (register, value)
    pub fn get_writes(&self) -> Vec<(SpcReg, u8)> {
        self.trace
            .borrow()
            .iter()
            .filter(|e| e.access == Access::Write)
            .map(|e| (e.reg, e.val))
            .collect()
    }

    /// Time spent in delays
    pub fn elapsed_us(&self) -> u64 {
        self.time_us
    }

    fn record(&self, reg: SpcReg, access: Access, val: u8) {
        if self.trace_enabled {
            self.trace.borrow_mut().push(TraceEntry {
                reg,
                access,
                val,
                time_us: self.time_us,
            });
        }
    }
}

impl SpcBus for Testbus {
    fn read(&mut self, reg: SpcReg) -> u8 {
        let val = self.regs.get(&reg).copied().unwrap_or(0);
        self.record(reg, Access::Read, val);
        val
    }

    fn write(&mut self, reg: SpcReg, val: u8) {
        self.record(reg, Access::Write, val);
        self.regs.insert(reg, val);
    }

    fn delay(&mut self, us: u32) {
        self.time_us += u64::from(us);
    }
}

impl Tickable for Testbus {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks> {
        self.time_us += ticks * 1000;
        Ok(ticks)
    }
}

/// Bus that feeds everything written to DREG during an outgoing phase back
/// as incoming data. The FIFO status reflects the wire contents.
pub struct LoopbackBus {
    regs: Testbus,
    wire: VecDeque<u8>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self {
            regs: Testbus::new(),
            wire: VecDeque::new(),
        }
    }

    /// Bytes written but not read back yet
    pub fn pending(&self) -> usize {
        self.wire.len()
    }

    fn phase(&mut self) -> Option<ScsiPhase> {
        ScsiPhase::from_bits(RegPctl(self.regs.read(SpcReg::PCTL)).phase())
    }
}

impl SpcBus for LoopbackBus {
    fn read(&mut self, reg: SpcReg) -> u8 {
        match reg {
            SpcReg::SSTS => {
                let ssts = RegSsts(0).with_initiator(true).with_spc_busy(true);
                let ssts = match self.phase() {
                    Some(p) if p.is_input() => ssts
                        .with_dreg_full(self.wire.len() >= FIFO_DEPTH)
                        .with_dreg_empty(self.wire.is_empty()),
                    _ => ssts.with_dreg_empty(true),
                };
                ssts.0
            }
            SpcReg::INTS | SpcReg::SERR => 0,
            SpcReg::DREG => self.wire.pop_front().unwrap_or(0),
            _ => self.regs.read(reg),
        }
    }

    fn write(&mut self, reg: SpcReg, val: u8) {
        match reg {
            SpcReg::DREG => self.wire.push_back(val),
            _ => self.regs.write(reg, val),
        }
    }

    fn delay(&mut self, us: u32) {
        self.regs.delay(us);
    }
}

impl Tickable for LoopbackBus {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks> {
        self.regs.tick(ticks)
    }
}
