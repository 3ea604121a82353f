//! Programmed I/O through the data register FIFO

use log::*;

use super::error::SpcError;
use super::regs::{FIFO_DEPTH, MAX_TRANSFER, RegInts, RegSequence, RegSsts, SpcReg};
use crate::bus::SpcBus;
use crate::scsi::ScsiPhase;

fn ssts<B: SpcBus + ?Sized>(bus: &mut B) -> RegSsts {
    RegSsts(bus.read(SpcReg::SSTS))
}

fn ints<B: SpcBus + ?Sized>(bus: &mut B) -> RegInts {
    RegInts(bus.read(SpcReg::INTS))
}

/// Spins on `cond` at most `budget` times, 1us apart
pub fn wait<B, F>(bus: &mut B, budget: u32, what: &'static str, mut cond: F) -> Result<(), SpcError>
where
    B: SpcBus + ?Sized,
    F: FnMut(&mut B) -> bool,
{
    for _ in 0..budget {
        if cond(bus) {
            return Ok(());
        }
        bus.delay(1);
    }
    if cond(bus) {
        Ok(())
    } else {
        Err(SpcError::PollTimeout(what))
    }
}

/// Bytes left in the transfer counter
pub fn read_tc<B: SpcBus + ?Sized>(bus: &mut B) -> usize {
    (usize::from(bus.read(SpcReg::TCH)) << 16)
        | (usize::from(bus.read(SpcReg::TCM)) << 8)
        | usize::from(bus.read(SpcReg::TCL))
}

/// Programs the transfer counter and starts a programmed transfer
pub fn start_transfer<B: SpcBus + ?Sized>(bus: &mut B, phase: ScsiPhase, count: usize) {
    RegSequence::transfer(phase, count).apply(bus);
}

/// Sends `buf` in `phase`. Returns the number of bytes the target took,
/// which is less than requested when it changed phase early or `buf` does
/// not fit the transfer counter.
pub fn transfer_out<B: SpcBus + ?Sized>(
    bus: &mut B,
    phase: ScsiPhase,
    buf: &[u8],
    budget: u32,
) -> Result<usize, SpcError> {
    let n = buf.len().min(MAX_TRANSFER);
    start_transfer(bus, phase, n);
    wait(bus, budget, "transfer start", |bus| {
        ssts(bus).spc_busy() || ints(bus).0 != 0
    })?;

    let mut out = 0;
    let mut intstat = RegInts(0);
    'xfer: while out < n {
        let mut spins = 0;
        loop {
            intstat = ints(bus);
            if ssts(bus).dreg_empty() {
                break;
            }
            if intstat.0 != 0 {
                break 'xfer;
            }
            spins += 1;
            if spins > budget {
                return Err(SpcError::PollTimeout("FIFO drain"));
            }
            bus.delay(1);
        }
        let chunk = (n - out).min(FIFO_DEPTH);
        bus.write_multi(SpcReg::DREG, &buf[out..(out + chunk)]);
        out += chunk;
    }

    if n == 0 {
        // Unlimited transfer, the chip pads until the target moves on
        wait(bus, budget, "end of padding", |bus| ints(bus).0 != 0)?;
    } else if intstat.0 == 0 {
        wait(bus, budget, "FIFO drain", |bus| {
            ssts(bus).dreg_empty() || ints(bus).0 != 0
        })?;
    }

    if ints(bus).0 != 0 {
        let remaining = read_tc(bus);
        if remaining > 0 && remaining <= n {
            out = n - remaining;
        }
    }
    Ok(out)
}

/// Receives into `buf` in `phase`. Returns the number of bytes received.
///
/// An empty `buf` starts an unlimited transfer; whatever the target sends is
/// drained and thrown away. At most `MAX_TRANSFER` bytes go in one call.
pub fn transfer_in<B: SpcBus + ?Sized>(
    bus: &mut B,
    phase: ScsiPhase,
    buf: &mut [u8],
    budget: u32,
) -> Result<usize, SpcError> {
    let n = buf.len().min(MAX_TRANSFER);
    start_transfer(bus, phase, n);

    let mut got = 0;
    let mut idle = 0;
    let mut intstat = RegInts(0);
    while got < n {
        let ssts = ssts(bus);
        if ssts.dreg_full() && n - got >= FIFO_DEPTH {
            bus.read_multi(SpcReg::DREG, &mut buf[got..(got + FIFO_DEPTH)]);
            got += FIFO_DEPTH;
            idle = 0;
        } else if !ssts.dreg_empty() {
            buf[got] = bus.read(SpcReg::DREG);
            got += 1;
            idle = 0;
        } else if intstat.0 != 0 {
            break;
        } else {
            intstat = ints(bus);
            idle += 1;
            if idle > budget {
                return Err(SpcError::PollTimeout("FIFO fill"));
            }
            if intstat.0 == 0 {
                bus.delay(1);
            }
        }
    }

    if n == 0 {
        let mut extra = 0usize;
        loop {
            if !ssts(bus).dreg_empty() {
                let _ = bus.read(SpcReg::DREG);
                extra += 1;
                idle = 0;
            } else if intstat.0 != 0 {
                break;
            } else {
                intstat = ints(bus);
                idle += 1;
                if idle > budget {
                    return Err(SpcError::PollTimeout("extra data"));
                }
                if intstat.0 == 0 {
                    bus.delay(1);
                }
            }
        }
        if extra > 0 {
            warn!("Target sent {} bytes of extra data in {}", extra, phase);
        }
    }
    Ok(got)
}
