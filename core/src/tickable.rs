use anyhow::Result;

/// Representation of X amount of ticks of the host timer.
/// One tick is one millisecond.
pub type Ticks = u64;

pub trait Tickable {
    fn tick(&mut self, ticks: Ticks) -> Result<Ticks>;
}
