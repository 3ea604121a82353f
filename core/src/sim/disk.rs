//! Memory-backed SCSI hard disk (block device)

use anyhow::{Result, bail};

use super::target::{ScsiTarget, Sense};

pub const DISK_BLOCKSIZE: usize = 512;

pub struct ScsiTargetDisk {
    /// Disk contents
    disk: Vec<u8>,

    sense: Sense,
}

impl ScsiTargetDisk {
    /// Zero-filled disk of `blocks` blocks
    pub fn new(blocks: usize) -> Self {
        Self {
            disk: vec![0; blocks * DISK_BLOCKSIZE],
            sense: Sense::default(),
        }
    }

    pub fn from_image(disk: Vec<u8>) -> Result<Self> {
        if disk.is_empty() || disk.len() % DISK_BLOCKSIZE != 0 {
            bail!(
                "Cannot use disk image of {} bytes: not multiple of {}",
                disk.len(),
                DISK_BLOCKSIZE
            );
        }
        Ok(Self {
            disk,
            sense: Sense::default(),
        })
    }

    pub fn contents(&self) -> &[u8] {
        &self.disk
    }

    fn range(lba: usize, len: usize) -> std::ops::Range<usize> {
        let start = lba * DISK_BLOCKSIZE;
        start..start + len
    }
}

impl ScsiTarget for ScsiTargetDisk {
    fn inquiry_data(&self) -> [u8; 36] {
        let mut data = [0; 36];
        // Direct access device, SCSI-2, sync and 16-bit wide capable
        data[2] = 0x02;
        data[3] = 0x02;
        data[4] = (data.len() - 5) as u8;
        data[7] = 0x30;
        data[8..16].copy_from_slice(b"SPCSIM  ");
        data[16..32].copy_from_slice(b"MEMORY DISK     ");
        data[32..36].copy_from_slice(b"1.0 ");
        data
    }

    fn sense(&self) -> Sense {
        self.sense
    }

    fn set_sense(&mut self, sense: Sense) {
        self.sense = sense;
    }

    fn block_size(&self) -> usize {
        DISK_BLOCKSIZE
    }

    fn block_count(&self) -> usize {
        self.disk.len() / DISK_BLOCKSIZE
    }

    fn read_blocks(&self, lba: usize, count: usize) -> &[u8] {
        &self.disk[Self::range(lba, count * DISK_BLOCKSIZE)]
    }

    fn write_blocks(&mut self, lba: usize, data: &[u8]) {
        self.disk[Self::range(lba, data.len())].copy_from_slice(data);
    }
}
