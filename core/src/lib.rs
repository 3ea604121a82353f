pub mod bus;
pub mod config;
pub mod scsi;
pub mod sim;
pub mod spc;
pub mod tickable;

#[cfg(test)]
pub mod test;
