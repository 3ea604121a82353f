pub mod testbus;

use crate::spc::regs::SpcReg;
use crate::tickable::Tickable;

/// Register-level access to an MB89352.
///
/// Implementors are the real chip behind some host bus, or a model of it.
/// Reads may have side effects (SERR, DREG), so there is no inspection
/// interface.
pub trait SpcBus: Tickable {
    fn read(&mut self, reg: SpcReg) -> u8;
    fn write(&mut self, reg: SpcReg, val: u8);

    /// Burst read of the same register
    fn read_multi(&mut self, reg: SpcReg, buf: &mut [u8]) {
        for b in buf {
            *b = self.read(reg);
        }
    }

    /// Burst write to the same register
    fn write_multi(&mut self, reg: SpcReg, buf: &[u8]) {
        for &b in buf {
            self.write(reg, b);
        }
    }

    /// Busy-waits for the given amount of microseconds
    fn delay(&mut self, us: u32);
}

pub trait IrqSource {
    fn get_irq(&mut self) -> Option<u8>;
}
