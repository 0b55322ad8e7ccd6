use std::collections::VecDeque;

use crate::PoolKind;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub usize);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub busy_misses: u64,
}

#[derive(Debug)]
struct Slot<H> {
    handle: H,
    owner: Option<TaskId>,
    refs: u32,
}

/// Fixed set of device handles, each free or held by exactly one owner.
///
/// `acquire` hands a slot to an owner with one reference. Tasks that alias the
/// slot through their DPB view call `add_ref`; the slot only returns to the
/// free list when the last reference is released.
#[derive(Debug)]
pub struct ResourcePool<H> {
    kind: PoolKind,
    slots: Vec<Slot<H>>,
    free: VecDeque<usize>,
    peak_in_use: usize,
    busy_misses: u64,
}

impl<H: Copy> ResourcePool<H> {
    pub fn new(kind: PoolKind, handles: Vec<H>) -> Self {
        let free = (0..handles.len()).collect();
        let slots = handles
            .into_iter()
            .map(|handle| Slot {
                handle,
                owner: None,
                refs: 0,
            })
            .collect();
        Self {
            kind,
            slots,
            free,
            peak_in_use: 0,
            busy_misses: 0,
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Returns `None` when every slot is held; the caller defers, never blocks.
    pub fn acquire(&mut self, owner: TaskId) -> Option<SlotId> {
        let Some(index) = self.free.pop_front() else {
            self.busy_misses = self.busy_misses.saturating_add(1);
            return None;
        };
        let slot = &mut self.slots[index];
        assert!(
            slot.owner.is_none() && slot.refs == 0,
            "{} slot {index} on the free list is still held",
            self.kind
        );
        slot.owner = Some(owner);
        slot.refs = 1;
        self.peak_in_use = self.peak_in_use.max(self.in_use());
        Some(SlotId(index))
    }

    /// # Panics
    /// If the slot is free; aliasing a free slot is an invariant violation.
    pub fn add_ref(&mut self, slot: SlotId) {
        let entry = &mut self.slots[slot.0];
        assert!(entry.refs > 0, "{} slot {} aliased while free", self.kind, slot.0);
        entry.refs += 1;
    }

    /// Drops one reference; returns `true` when the slot went back to the free list.
    ///
    /// # Panics
    /// On release of a slot that holds no reference.
    pub fn release(&mut self, slot: SlotId) -> bool {
        let entry = &mut self.slots[slot.0];
        assert!(entry.refs > 0, "{} slot {} released twice", self.kind, slot.0);
        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }
        entry.owner = None;
        self.free.push_back(slot.0);
        true
    }

    pub fn handle(&self, slot: SlotId) -> H {
        self.slots[slot.0].handle
    }

    pub fn owner(&self, slot: SlotId) -> Option<TaskId> {
        self.slots[slot.0].owner
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            in_use: self.in_use(),
            peak_in_use: self.peak_in_use,
            busy_misses: self.busy_misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> ResourcePool<u64> {
        ResourcePool::new(PoolKind::Recon, (0..n as u64).collect())
    }

    #[test]
    fn acquire_reports_busy_when_exhausted() {
        let mut pool = pool(2);
        let a = pool.acquire(TaskId(0)).unwrap();
        let b = pool.acquire(TaskId(1)).unwrap();
        assert_ne!(a, b);
        assert!(pool.acquire(TaskId(2)).is_none());
        assert_eq!(pool.stats().busy_misses, 1);
        assert!(pool.release(a));
        assert_eq!(pool.acquire(TaskId(2)), Some(a));
        assert_eq!(pool.owner(a), Some(TaskId(2)));
    }

    #[test]
    fn aliased_slot_survives_owner_release() {
        let mut pool = pool(1);
        let slot = pool.acquire(TaskId(0)).unwrap();
        pool.add_ref(slot);
        pool.add_ref(slot);
        assert!(!pool.release(slot));
        assert!(pool.acquire(TaskId(1)).is_none());
        assert!(!pool.release(slot));
        assert!(pool.release(slot));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.owner(slot), None);
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let mut pool = pool(3);
        let a = pool.acquire(TaskId(0)).unwrap();
        let b = pool.acquire(TaskId(1)).unwrap();
        pool.release(a);
        pool.release(b);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.peak_in_use, 2);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn double_release_is_fatal() {
        let mut pool = pool(1);
        let slot = pool.acquire(TaskId(0)).unwrap();
        pool.release(slot);
        pool.release(slot);
    }
}
