//! Controller against the simulated chip and targets

mod messages;
mod scenarios;

use crate::bus::IrqSource;
use crate::config::SpcConfig;
use crate::sim::disk::ScsiTargetDisk;
use crate::sim::{Quirks, SimSpc};
use crate::spc::acb::AcbHandle;
use crate::spc::{Completion, CompletionReceiver, ScsiRequest, Spc};
use crate::tickable::{Tickable, Ticks};

/// Interrupts served per call before the handler is considered stuck
const MAX_INTR_BURST: usize = 64;

const DISK_BLOCKS: usize = 64;

pub const TUR: [u8; 6] = [0x00, 0, 0, 0, 0, 0];
pub const INQUIRY: [u8; 6] = [0x12, 0, 0, 0, 36, 0];

pub fn read10(lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![0x28, 0];
    cdb.extend(lba.to_be_bytes());
    cdb.push(0);
    cdb.extend(blocks.to_be_bytes());
    cdb.push(0);
    cdb
}

pub fn write6(lba: u8, blocks: u8) -> Vec<u8> {
    vec![0x0A, 0, 0, lba, blocks, 0]
}

pub struct Harness {
    pub spc: Spc<SimSpc>,
    pub rx: CompletionReceiver,
    /// Completions not yet picked up by a test
    pub done: Vec<Completion>,
}

impl Harness {
    /// Disks of 64 blocks at the given ids
    pub fn new(config: SpcConfig, disks: &[(u8, Quirks)]) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut sim = SimSpc::new(config.clock_mhz);
        for &(id, quirks) in disks {
            let image = (0..DISK_BLOCKS).flat_map(disk_block).collect();
            let disk = ScsiTargetDisk::from_image(image).unwrap();
            sim.attach(id, Box::new(disk), quirks).unwrap();
        }
        let (spc, rx) = Spc::new(sim, config).unwrap();
        Self {
            spc,
            rx,
            done: vec![],
        }
    }

    pub fn sim(&mut self) -> &mut SimSpc {
        self.spc.bus_mut()
    }

    /// Runs the interrupt handler while the chip asserts its interrupt
    pub fn service(&mut self) {
        let mut burst = 0;
        while self.spc.bus_mut().get_irq().is_some() {
            assert!(burst < MAX_INTR_BURST, "interrupt storm");
            self.spc.intr();
            self.spc.check_invariants().unwrap();
            burst += 1;
        }
        self.done.extend(self.rx.try_iter());
    }

    pub fn run_for(&mut self, ms: Ticks) {
        self.service();
        for _ in 0..ms {
            self.spc.tick(1).unwrap();
            self.service();
        }
    }

    pub fn take(&mut self, h: AcbHandle) -> Option<Completion> {
        let pos = self.done.iter().position(|c| c.handle == h)?;
        Some(self.done.remove(pos))
    }

    /// Runs until `h` completes, for `max_ms` at most
    pub fn run_until(&mut self, h: AcbHandle, max_ms: Ticks) -> Completion {
        self.service();
        for _ in 0..max_ms {
            if let Some(c) = self.take(h) {
                return c;
            }
            self.spc.tick(1).unwrap();
            self.service();
        }
        self.take(h)
            .unwrap_or_else(|| panic!("no completion within {} ms", max_ms))
    }

    pub fn run(&mut self, req: ScsiRequest) -> Completion {
        let h = self.spc.submit(req).unwrap();
        self.run_until(h, 5000)
    }
}

fn harness(disks: &[(u8, Quirks)]) -> Harness {
    Harness::new(SpcConfig::default(), disks)
}

fn sync_config() -> SpcConfig {
    SpcConfig {
        use_sync: true,
        ..Default::default()
    }
}

/// Recognizable disk contents, per block
fn disk_block(lba: usize) -> Vec<u8> {
    (lba * 512..(lba + 1) * 512)
        .map(|i| (i / 512 + i % 251) as u8)
        .collect()
}
