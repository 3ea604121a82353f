//! Command control blocks, the pool they live in and the queues they move
//! through

use std::collections::VecDeque;
use std::ops::{Index, IndexMut};

use anyhow::{Result, bail, ensure};
use arrayvec::ArrayVec;
use proc_bitfield::bitfield;
use strum::IntoStaticStr;

use super::error::ScsiError;
use super::tinfo::TargetTable;
use crate::tickable::Ticks;

/// Largest command descriptor block
pub const MAX_CDB_LEN: usize = 12;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct AcbFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub allocated: bool @ 0,
        /// Has been connected to its target at least once
        pub nexus: bool @ 1,
        /// Bus device reset request rather than a command
        pub reset: bool @ 2,
        pub abort: bool @ 3,
    }
}

/// The list an ACB is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum AcbQueue {
    Free,
    Ready,
    Nexus,
    Current,
    /// Between allocation and queueing, or on the way to being freed
    Detached,
}

/// Opaque reference to a submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcbHandle {
    slot: usize,
    generation: u32,
}

#[derive(Debug, Clone)]
pub struct Acb {
    pub target: u8,
    pub lun: u8,
    pub cdb: ArrayVec<u8, MAX_CDB_LEN>,
    pub data: Vec<u8>,

    /// Saved data pointer (offset into data)
    pub data_addr: usize,
    /// Saved remaining length
    pub data_length: usize,

    pub target_stat: u8,

    /// Command timeout in ticks, 0 disables
    pub timeout: Ticks,
    /// Remaining ticks of the armed timer
    pub timer: Option<Ticks>,

    pub flags: AcbFlags,
    /// Completion is collected by the polling loop
    pub poll: bool,
    pub error: Option<ScsiError>,

    queue: AcbQueue,
    generation: u32,
}

impl Acb {
    fn new() -> Self {
        Self {
            target: 0,
            lun: 0,
            cdb: ArrayVec::new(),
            data: vec![],
            data_addr: 0,
            data_length: 0,
            target_stat: 0,
            timeout: 0,
            timer: None,
            flags: AcbFlags(0),
            poll: false,
            error: None,
            queue: AcbQueue::Free,
            generation: 0,
        }
    }

    /// Records an error, unless one was recorded before
    pub fn set_error(&mut self, err: ScsiError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    pub fn queue(&self) -> AcbQueue {
        self.queue
    }
}

pub struct AcbPool {
    acbs: Vec<Acb>,
    free: VecDeque<usize>,
    ready: VecDeque<usize>,
    nexus: VecDeque<usize>,
    current: Option<usize>,
}

impl AcbPool {
    pub fn new(count: usize) -> Self {
        Self {
            acbs: (0..count).map(|_| Acb::new()).collect(),
            free: (0..count).collect(),
            ready: VecDeque::with_capacity(count),
            nexus: VecDeque::with_capacity(count),
            current: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.acbs.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    fn handle(&self, slot: usize) -> AcbHandle {
        AcbHandle {
            slot,
            generation: self.acbs[slot].generation,
        }
    }

    /// Looks up a handle, None if stale or freed
    pub fn get(&self, h: AcbHandle) -> Option<&Acb> {
        self.acbs
            .get(h.slot)
            .filter(|a| a.generation == h.generation && a.flags.allocated())
    }

    pub fn get_mut(&mut self, h: AcbHandle) -> Option<&mut Acb> {
        self.acbs
            .get_mut(h.slot)
            .filter(|a| a.generation == h.generation && a.flags.allocated())
    }

    /// Takes a block off the free list. It is detached until queued.
    pub fn allocate(&mut self) -> Option<AcbHandle> {
        let slot = self.free.pop_front()?;
        let acb = &mut self.acbs[slot];
        let generation = acb.generation.wrapping_add(1);
        *acb = Acb::new();
        acb.generation = generation;
        acb.flags.set_allocated(true);
        acb.queue = AcbQueue::Detached;
        Some(self.handle(slot))
    }

    /// Returns a detached block to the free list
    pub fn free(&mut self, h: AcbHandle) {
        self.detach(h);
        let acb = &mut self.acbs[h.slot];
        acb.flags = AcbFlags(0);
        acb.timer = None;
        acb.data = vec![];
        acb.queue = AcbQueue::Free;
        self.free.push_front(h.slot);
    }

    pub fn enqueue_ready(&mut self, h: AcbHandle) {
        self.detach(h);
        self.acbs[h.slot].queue = AcbQueue::Ready;
        self.ready.push_back(h.slot);
    }

    pub fn push_ready_front(&mut self, h: AcbHandle) {
        self.detach(h);
        self.acbs[h.slot].queue = AcbQueue::Ready;
        self.ready.push_front(h.slot);
    }

    /// Removes the first ready block whose target lun is idle
    pub fn dequeue_ready_for_idle_target(&mut self, tinfo: &TargetTable) -> Option<AcbHandle> {
        let pos = self.ready.iter().position(|&slot| {
            let acb = &self.acbs[slot];
            !tinfo.get(acb.target).lun_busy(acb.lun)
        })?;
        let slot = self.ready.remove(pos)?;
        self.acbs[slot].queue = AcbQueue::Detached;
        Some(self.handle(slot))
    }

    pub fn set_current(&mut self, h: AcbHandle) {
        self.detach(h);
        if let Some(old) = self.current.take() {
            log::error!("Replacing current nexus {}", old);
            self.acbs[old].queue = AcbQueue::Detached;
        }
        self.acbs[h.slot].queue = AcbQueue::Current;
        self.current = Some(h.slot);
    }

    pub fn current(&self) -> Option<AcbHandle> {
        self.current.map(|slot| self.handle(slot))
    }

    /// Parks the current nexus on the disconnected list
    pub fn move_to_nexus(&mut self, h: AcbHandle) {
        self.detach(h);
        self.acbs[h.slot].queue = AcbQueue::Nexus;
        self.nexus.push_front(h.slot);
    }

    pub fn remove_from_nexus(&mut self, target: u8, lun: u8) -> Option<AcbHandle> {
        let pos = self.nexus.iter().position(|&slot| {
            let acb = &self.acbs[slot];
            acb.target == target && acb.lun == lun
        })?;
        let slot = self.nexus.remove(pos)?;
        self.acbs[slot].queue = AcbQueue::Detached;
        Some(self.handle(slot))
    }

    /// Takes a block off whatever list it is on
    pub fn detach(&mut self, h: AcbHandle) {
        let slot = h.slot;
        match self.acbs[slot].queue {
            AcbQueue::Ready => self.ready.retain(|&s| s != slot),
            AcbQueue::Nexus => self.nexus.retain(|&s| s != slot),
            AcbQueue::Current => {
                if self.current == Some(slot) {
                    self.current = None;
                }
            }
            AcbQueue::Free => self.free.retain(|&s| s != slot),
            AcbQueue::Detached => (),
        }
        self.acbs[slot].queue = AcbQueue::Detached;
    }

    pub fn ready_front(&self) -> Option<AcbHandle> {
        self.ready.front().map(|&slot| self.handle(slot))
    }

    pub fn nexus_front(&self) -> Option<AcbHandle> {
        self.nexus.front().map(|&slot| self.handle(slot))
    }

    pub fn ready(&self) -> impl Iterator<Item = AcbHandle> + '_ {
        self.ready.iter().map(|&slot| self.handle(slot))
    }

    pub fn nexus(&self) -> impl Iterator<Item = AcbHandle> + '_ {
        self.nexus.iter().map(|&slot| self.handle(slot))
    }

    /// Runs down the armed timers, returns the blocks whose timer expired
    pub fn expire_timers(&mut self, ticks: Ticks) -> Vec<AcbHandle> {
        let mut expired = vec![];
        for slot in 0..self.acbs.len() {
            let acb = &mut self.acbs[slot];
            if !acb.flags.allocated() {
                continue;
            }
            if let Some(t) = acb.timer {
                if t <= ticks {
                    acb.timer = None;
                    expired.push(self.handle(slot));
                } else {
                    acb.timer = Some(t - ticks);
                }
            }
        }
        expired
    }

    /// Every allocated block is on exactly one of ready, nexus and current,
    /// and the queue tags agree with the lists.
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = vec![0u32; self.acbs.len()];
        for (list, tag) in [
            (&self.free, AcbQueue::Free),
            (&self.ready, AcbQueue::Ready),
            (&self.nexus, AcbQueue::Nexus),
        ] {
            for &slot in list {
                seen[slot] += 1;
                ensure!(
                    self.acbs[slot].queue == tag,
                    "ACB {} on {:?} list tagged {:?}",
                    slot,
                    tag,
                    self.acbs[slot].queue
                );
            }
        }
        if let Some(slot) = self.current {
            seen[slot] += 1;
            ensure!(
                self.acbs[slot].queue == AcbQueue::Current,
                "current ACB {} tagged {:?}",
                slot,
                self.acbs[slot].queue
            );
        }
        for (slot, acb) in self.acbs.iter().enumerate() {
            if seen[slot] != 1 {
                bail!("ACB {} is on {} lists", slot, seen[slot]);
            }
            ensure!(
                acb.flags.allocated() == (acb.queue != AcbQueue::Free),
                "ACB {} allocation flag disagrees with queue {:?}",
                slot,
                acb.queue
            );
        }
        Ok(())
    }
}

impl Index<AcbHandle> for AcbPool {
    type Output = Acb;

    fn index(&self, h: AcbHandle) -> &Acb {
        &self.acbs[h.slot]
    }
}

impl IndexMut<AcbHandle> for AcbPool {
    fn index_mut(&mut self, h: AcbHandle) -> &mut Acb {
        &mut self.acbs[h.slot]
    }
}
