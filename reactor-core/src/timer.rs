// Copyright (c) 2026 Reactor Core Contributors. Licensed under Apache License, Version 2.0.

//! The timer heap (C3): a 2-ary min-heap of timer watchers keyed on absolute monotonic
//! fire time, backed by a generation-checked slab instead of raw pointers.
//!
//! The source stores the heap index directly on the watcher so `remove` can run in
//! O(log n) without a linear scan. Translated here as: the heap holds slab keys, not
//! watchers directly, and each slab entry caches its own current heap position
//! (`heap_pos`) so `remove` can still jump straight to its slot.

use crate::events::Revents;
use crate::watcher::{Callback, TimerHandle};

pub(crate) struct TimerSlot {
    pub(crate) at: i64,
    pub(crate) repeat: i64,
    generation: u32,
    /// 1-based position in `TimerHeap::heap`. Always valid while the slot is occupied;
    /// the timer heap invariant (§8) requires `heap[heap_pos] == key`.
    heap_pos: u32,
    pub(crate) callback: Callback,
    pub(crate) revents: Revents,
    pub(crate) pending: usize,
}

/// Min-heap of active timers plus the free-list slab backing their storage.
#[derive(Default)]
pub struct TimerHeap {
    slots: Vec<Option<TimerSlot>>,
    free: Vec<u32>,
    /// Slot 0 is the unused sentinel; the root lives at index 1.
    heap: Vec<u32>,
    next_generation: u32,
}

impl std::fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHeap").field("count", &self.count()).finish_non_exhaustive()
    }
}

impl TimerHeap {
    #[must_use]
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), heap: vec![0], next_generation: 1 }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.heap.len() - 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The fire time of the soonest timer, if any are active.
    #[must_use]
    pub fn root_at(&self) -> Option<i64> {
        self.root_key().map(|key| self.slots[key as usize].as_ref().unwrap().at)
    }

    fn root_key(&self) -> Option<u32> {
        self.heap.get(1).copied()
    }

    /// Inserts a new timer at absolute monotonic fire time `at`, returning a handle
    /// valid until it fires (for one-shot timers) or is explicitly removed.
    pub fn insert(&mut self, at: i64, repeat: i64, callback: Callback) -> TimerHandle {
        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1).max(1);

        let slot = TimerSlot { at, repeat, generation, heap_pos: 0, callback, revents: 0, pending: 0 };
        let key = if let Some(key) = self.free.pop() {
            self.slots[key as usize] = Some(slot);
            key
        } else {
            self.slots.push(Some(slot));
            u32::try_from(self.slots.len() - 1).expect("timer slab index overflow")
        };

        self.heap.push(key);
        let pos = u32::try_from(self.heap.len() - 1).expect("timer heap index overflow");
        self.slots[key as usize].as_mut().unwrap().heap_pos = pos;
        self.sift_up(pos);

        TimerHandle { slot: key, generation }
    }

    /// Removes the timer named by `handle`, restoring heap invariants via
    /// swap-with-last-then-adjust, and releases its slab slot. Returns its callback if
    /// the handle was still live (in the heap or merely detached-and-awaiting-dispatch).
    pub fn remove(&mut self, handle: TimerHandle) -> Option<Callback> {
        let key = handle.slot;
        let slot_ref = self.slots.get(key as usize)?.as_ref()?;
        if slot_ref.generation != handle.generation {
            return None;
        }
        if slot_ref.heap_pos != 0 {
            self.detach_from_heap(handle);
        }

        let slot = self.slots[key as usize].take().unwrap();
        self.free.push(key);
        Some(slot.callback)
    }

    /// Removes `handle` from the heap only, leaving its slab slot (and callback) alive.
    /// Used when a one-shot timer fires: the timer must stop being scheduled
    /// immediately, but its callback is still owed a dispatch through the pending
    /// queue. [`Self::free_if_detached`] releases the slot once that dispatch happens.
    pub(crate) fn detach_from_heap(&mut self, handle: TimerHandle) -> bool {
        let Some(slot_ref) = self.slots.get(handle.slot as usize).and_then(|s| s.as_ref()) else {
            return false;
        };
        if slot_ref.generation != handle.generation || slot_ref.heap_pos == 0 {
            return false;
        }
        self.remove_at(slot_ref.heap_pos);
        self.slots[handle.slot as usize].as_mut().unwrap().heap_pos = 0;
        true
    }

    /// Releases `handle`'s slab slot if it is currently detached from the heap (a
    /// one-shot timer whose callback has just been dispatched). No-op if `handle` is
    /// still in the heap, stale, or already freed.
    pub(crate) fn free_if_detached(&mut self, handle: TimerHandle) {
        let detached = self.slots.get(handle.slot as usize).and_then(|s| s.as_ref()).is_some_and(|slot| {
            slot.generation == handle.generation && slot.heap_pos == 0
        });
        if detached {
            self.slots[handle.slot as usize] = None;
            self.free.push(handle.slot);
        }
    }

    /// Removes the heap entry at 1-based position `pos`, per §4.3's `remove` algorithm.
    fn remove_at(&mut self, pos: u32) {
        let last_pos = u32::try_from(self.heap.len() - 1).expect("timer heap index overflow");
        if pos == last_pos {
            self.heap.pop();
            return;
        }

        let last_key = *self.heap.last().unwrap();
        self.heap.pop();
        self.heap[pos as usize] = last_key;
        self.slots[last_key as usize].as_mut().unwrap().heap_pos = pos;

        let parent = pos / 2;
        if pos > 1 && self.at_of(last_key) <= self.at_of(self.heap[parent as usize]) {
            self.sift_up(pos);
        } else {
            self.sift_down(pos);
        }
    }

    fn at_of(&self, key: u32) -> i64 {
        self.slots[key as usize].as_ref().unwrap().at
    }

    fn sift_up(&mut self, mut i: u32) {
        while i > 1 {
            let parent = i / 2;
            if self.at_of(self.heap[parent as usize]) <= self.at_of(self.heap[i as usize]) {
                break;
            }
            self.heap.swap(i as usize, parent as usize);
            self.slots[self.heap[i as usize] as usize].as_mut().unwrap().heap_pos = i;
            self.slots[self.heap[parent as usize] as usize].as_mut().unwrap().heap_pos = parent;
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: u32) {
        let n = u32::try_from(self.count()).expect("timer heap count overflow");
        loop {
            let left = 2 * i;
            let right = left + 1;
            if left > n {
                break;
            }
            let smaller_child =
                if right <= n && self.at_of(self.heap[right as usize]) < self.at_of(self.heap[left as usize]) {
                    right
                } else {
                    left
                };
            if self.at_of(self.heap[i as usize]) <= self.at_of(self.heap[smaller_child as usize]) {
                break;
            }
            self.heap.swap(i as usize, smaller_child as usize);
            self.slots[self.heap[i as usize] as usize].as_mut().unwrap().heap_pos = i;
            self.slots[self.heap[smaller_child as usize] as usize].as_mut().unwrap().heap_pos = smaller_child;
            i = smaller_child;
        }
    }

    /// Re-settles the root after its `at` field was advanced in place (the repeat-timer
    /// rearm path); equivalent to `sift_down` starting from the root.
    pub(crate) fn sift_down_root(&mut self) {
        self.sift_down(1);
    }

    pub(crate) fn root_handle(&self) -> Option<TimerHandle> {
        let key = self.root_key()?;
        let generation = self.slots[key as usize].as_ref()?.generation;
        Some(TimerHandle { slot: key, generation })
    }

    pub(crate) fn slot_mut(&mut self, handle: TimerHandle) -> Option<&mut TimerSlot> {
        let slot = self.slots.get_mut(handle.slot as usize)?.as_mut()?;
        (slot.generation == handle.generation).then_some(slot)
    }

    #[cfg(test)]
    pub(crate) fn assert_heap_property(&self) {
        for i in 1..=self.count() {
            let i = u32::try_from(i).unwrap();
            assert_eq!(self.slots[self.heap[i as usize] as usize].as_ref().unwrap().heap_pos, i);
            let parent = i / 2;
            if parent >= 1 {
                assert!(self.at_of(self.heap[parent as usize]) <= self.at_of(self.heap[i as usize]));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Box::new(|_, _| {})
    }

    #[test]
    fn insert_maintains_heap_order() {
        let mut heap = TimerHeap::new();
        for at in [50, 10, 30, 20, 40] {
            heap.insert(at, 0, noop());
            heap.assert_heap_property();
        }
        assert_eq!(heap.root_at(), Some(10));
        assert_eq!(heap.count(), 5);
    }

    #[test]
    fn remove_arbitrary_element_keeps_property() {
        let mut heap = TimerHeap::new();
        let handles: Vec<_> = [50, 10, 30, 20, 40].into_iter().map(|at| heap.insert(at, 0, noop())).collect();
        heap.remove(handles[2]); // removes the `at = 30` entry
        heap.assert_heap_property();
        assert_eq!(heap.count(), 4);
        assert_eq!(heap.root_at(), Some(10));
    }

    #[test]
    fn remove_is_idempotent_on_stale_handle() {
        let mut heap = TimerHeap::new();
        let handle = heap.insert(10, 0, noop());
        assert!(heap.remove(handle).is_some());
        assert!(heap.remove(handle).is_none());
    }

    #[test]
    fn removing_last_slot_shrinks_without_reheap() {
        let mut heap = TimerHeap::new();
        let handle = heap.insert(10, 0, noop());
        heap.remove(handle);
        assert!(heap.is_empty());
    }
}
