//! Target-side command set of the simulated devices

use anyhow::Result;

use crate::scsi::{STATUS_CHECK_CONDITION, STATUS_GOOD};

/// Sense key ILLEGAL REQUEST
pub const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
/// ASC/ASCQ: logical block address out of range
pub const ASC_LBA_OUT_OF_RANGE: u16 = 0x2100;
/// ASC/ASCQ: invalid command operation code
pub const ASC_INVALID_COMMAND: u16 = 0x2000;

/// Length of fixed-format sense data
const SENSE_LEN: usize = 18;

/// Latched sense: key and ASC/ASCQ
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Sense {
    pub key: u8,
    pub asc: u16,
}

impl Sense {
    pub const fn new(key: u8, asc: u16) -> Self {
        Self { key, asc }
    }

    /// Fixed-format (0x70) sense data, cut to the allocation length
    fn encode(self, alloc: usize) -> Vec<u8> {
        let mut data = vec![0; SENSE_LEN];
        data[0] = 0x70;
        data[2] = self.key & 0x0F;
        data[7] = (SENSE_LEN - 8) as u8;
        data[12..14].copy_from_slice(&self.asc.to_be_bytes());
        data.truncate(alloc);
        data
    }
}

/// What a target does after the command phase
pub enum ScsiCmdResult {
    /// Straight to STATUS
    Status(u8),
    /// DATA IN with these bytes, then STATUS
    DataIn(Vec<u8>),
    /// DATA OUT of this many bytes; the command runs again with the data
    DataOut(usize),
}

/// A logical unit behind the simulated bus.
///
/// Devices supply storage and identity; `cmd` decodes the CDB.
pub trait ScsiTarget {
    /// Standard INQUIRY data
    fn inquiry_data(&self) -> [u8; 36];

    fn sense(&self) -> Sense;
    fn set_sense(&mut self, sense: Sense);

    fn block_size(&self) -> usize;
    fn block_count(&self) -> usize;
    fn read_blocks(&self, lba: usize, count: usize) -> &[u8];
    fn write_blocks(&mut self, lba: usize, data: &[u8]);

    /// Capacity in bytes
    fn capacity(&self) -> usize {
        self.block_size() * self.block_count()
    }

    /// Runs a CDB. DATA OUT commands are first called without `outdata`
    /// to learn the transfer length.
    fn cmd(&mut self, cdb: &[u8], outdata: Option<&[u8]>) -> Result<ScsiCmdResult> {
        let alloc = |i: usize| usize::from(cdb.get(i).copied().unwrap_or(0));
        match cdb[0] {
            0x00 => Ok(ScsiCmdResult::Status(STATUS_GOOD)),
            0x03 => {
                let data = self.sense().encode(alloc(4));
                self.set_sense(Sense::default());
                Ok(ScsiCmdResult::DataIn(data))
            }
            0x08 | 0x0A => {
                let (lba, count) = rw6_args(cdb)?;
                self.block_io(cdb[0] == 0x0A, lba, count, outdata)
            }
            0x12 => {
                let mut data = self.inquiry_data().to_vec();
                data.truncate(alloc(4));
                Ok(ScsiCmdResult::DataIn(data))
            }
            0x25 => {
                let last = self.block_count().saturating_sub(1) as u32;
                let mut data = last.to_be_bytes().to_vec();
                data.extend((self.block_size() as u32).to_be_bytes());
                Ok(ScsiCmdResult::DataIn(data))
            }
            0x28 | 0x2A => {
                let (lba, count) = rw10_args(cdb)?;
                self.block_io(cdb[0] == 0x2A, lba, count, outdata)
            }
            op => {
                log::warn!("Unsupported command {:02X}", op);
                self.set_sense(Sense::new(SENSE_ILLEGAL_REQUEST, ASC_INVALID_COMMAND));
                Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION))
            }
        }
    }

    fn block_io(
        &mut self,
        write: bool,
        lba: usize,
        count: usize,
        outdata: Option<&[u8]>,
    ) -> Result<ScsiCmdResult> {
        if lba + count > self.block_count() {
            log::error!("Access beyond end of unit: lba {} count {}", lba, count);
            self.set_sense(Sense::new(SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE));
            return Ok(ScsiCmdResult::Status(STATUS_CHECK_CONDITION));
        }
        match (write, outdata) {
            (false, _) => Ok(ScsiCmdResult::DataIn(
                self.read_blocks(lba, count).to_vec(),
            )),
            (true, None) => Ok(ScsiCmdResult::DataOut(count * self.block_size())),
            (true, Some(data)) => {
                self.write_blocks(lba, data);
                Ok(ScsiCmdResult::Status(STATUS_GOOD))
            }
        }
    }
}

/// LBA and length of a 6-byte READ/WRITE; a length of 0 means 256
fn rw6_args(cdb: &[u8]) -> Result<(usize, usize)> {
    let lba = u32::from_be_bytes(cdb[0..4].try_into()?) & 0x1F_FFFF;
    let count = match cdb[4] {
        0 => 256,
        n => usize::from(n),
    };
    Ok((lba as usize, count))
}

fn rw10_args(cdb: &[u8]) -> Result<(usize, usize)> {
    let lba = u32::from_be_bytes(cdb[2..6].try_into()?);
    let count = u16::from_be_bytes(cdb[7..9].try_into()?);
    Ok((lba as usize, usize::from(count)))
}
