//! Remembered set and write barrier entry points.
//!
//! Old-to-nursery references are remembered in one of two places:
//!
//! - **Cards** for every slot inside a managed object outside the nursery
//!   (major sections, pinned chunks, large objects). Minor collections find
//!   the covering objects by walking the old generation.
//! - **The remembered set** for slots the collector cannot walk to: words in
//!   runtime-owned memory registered as [`RootKind::Barriered`] roots.
//!   Minor collections visit only the recorded slots of those roots.
//!
//! Major-to-major references are never remembered; a major collection
//! traces the whole heap.
//!
//! [`RootKind::Barriered`]: crate::RootKind::Barriered

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::card_table::CardTable;
use crate::object::{ObjectRef, Slot};
use crate::stw::CriticalRegion;

/// Explicit set of off-heap slots that may hold nursery references.
pub struct RememberedSet {
    entries: Mutex<FxHashSet<Slot>>,
}

impl RememberedSet {
    /// Create a new remembered set
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(FxHashSet::default()),
        }
    }

    /// Run `f` on the entries. The lock is held inside a critical region,
    /// so a stopped mutator never owns it while the collector drains.
    fn with_entries<R>(&self, f: impl FnOnce(&mut FxHashSet<Slot>) -> R) -> R {
        let _region = CriticalRegion::enter();
        let mut entries = self.entries.lock();
        f(&mut entries)
    }

    /// Remember a slot
    pub fn add(&self, slot: Slot) {
        self.with_entries(|entries| entries.insert(slot));
    }

    /// Check if the slot is remembered
    pub fn contains(&self, slot: Slot) -> bool {
        self.with_entries(|entries| entries.contains(&slot))
    }

    /// Number of remembered slots
    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.with_entries(|entries| entries.is_empty())
    }

    /// Remove and return every slot
    pub fn drain(&self) -> Vec<Slot> {
        self.with_entries(|entries| entries.drain().collect())
    }

    /// Forget every slot (after a major collection).
    pub fn clear(&self) {
        self.with_entries(|entries| entries.clear());
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Store barrier handed to interpreter and JIT code.
///
/// Every reference store into a managed object or a barriered root must go
/// through one of these methods between collections.
#[derive(Clone)]
pub struct WriteBarrier {
    cards: Arc<CardTable>,
    remset: Arc<RememberedSet>,
    nursery_start: usize,
    nursery_end: usize,
}

impl WriteBarrier {
    pub(crate) fn new(
        cards: Arc<CardTable>,
        remset: Arc<RememberedSet>,
        nursery_start: usize,
        nursery_end: usize,
    ) -> Self {
        Self {
            cards,
            remset,
            nursery_start,
            nursery_end,
        }
    }

    #[inline]
    fn in_nursery(&self, addr: usize) -> bool {
        addr >= self.nursery_start && addr < self.nursery_end
    }

    /// Store `value` into word `index` of `obj`.
    ///
    /// # Safety
    /// `obj` must be a live managed object and word `index` a reference slot.
    #[inline]
    pub unsafe fn set_field(&self, obj: ObjectRef, index: usize, value: Option<ObjectRef>) {
        // SAFETY: guaranteed by the caller
        unsafe { self.store_in_heap(obj.slot(index), value) }
    }

    /// Store `value` into a slot that lies inside a managed object.
    ///
    /// # Safety
    /// `slot` must be a reference slot of a live managed object.
    #[inline]
    pub unsafe fn store_in_heap(&self, slot: Slot, value: Option<ObjectRef>) {
        let raw = value.map_or(0, ObjectRef::addr);
        if self.in_nursery(raw) && !self.in_nursery(slot.addr()) {
            // store and card mark are one step for a stopping collector
            let _region = CriticalRegion::enter();
            // SAFETY: guaranteed by the caller
            unsafe { slot.store(raw) };
            self.cards.mark(slot.addr());
        } else {
            // SAFETY: guaranteed by the caller
            unsafe { slot.store(raw) };
        }
    }

    /// Store `value` into a barriered root outside the heap.
    ///
    /// # Safety
    /// `slot` must stay valid until it is unregistered from the root
    /// provider.
    #[inline]
    pub unsafe fn set_root(&self, slot: Slot, value: Option<ObjectRef>) {
        let raw = value.map_or(0, ObjectRef::addr);
        if self.in_nursery(raw) {
            let _region = CriticalRegion::enter();
            // SAFETY: guaranteed by the caller
            unsafe { slot.store(raw) };
            self.remset.add(slot);
        } else {
            // SAFETY: guaranteed by the caller
            unsafe { slot.store(raw) };
        }
    }

    /// Copy `count` reference words from `src` to `dst` inside the heap.
    ///
    /// # Safety
    /// Both ranges must be reference slots of live managed objects.
    pub unsafe fn copy_slots(&self, dst: Slot, src: Slot, count: usize) {
        if count == 0 {
            return;
        }
        // SAFETY: guaranteed by the caller
        let words = unsafe { std::slice::from_raw_parts(src.addr() as *const usize, count) };
        let young = !self.in_nursery(dst.addr()) && words.iter().any(|&w| self.in_nursery(w));
        let _region = young.then(CriticalRegion::enter);
        // SAFETY: guaranteed by the caller; ranges may overlap
        unsafe {
            std::ptr::copy(src.addr() as *const usize, dst.addr() as *mut usize, count);
        }
        if young {
            let bytes = count * crate::object::WORD_SIZE;
            self.cards.mark_range(dst.addr(), dst.addr() + bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn barrier_with_nursery(start: usize, end: usize) -> (WriteBarrier, Arc<CardTable>, Arc<RememberedSet>) {
        let cards = Arc::new(CardTable::new(9, 12));
        let remset = Arc::new(RememberedSet::new());
        (
            WriteBarrier::new(cards.clone(), remset.clone(), start, end),
            cards,
            remset,
        )
    }

    #[test]
    fn test_remembered_set_basic() {
        let set = RememberedSet::new();
        let slot = Slot::from_ptr(0x1000 as *mut usize);
        assert!(set.is_empty());
        set.add(slot);
        set.add(slot);
        assert_eq!(set.len(), 1);
        assert!(set.contains(slot));
        assert_eq!(set.drain(), vec![slot]);
        assert!(set.is_empty());
    }

    #[test]
    fn test_field_store_marks_card_only_for_young_values() {
        let nursery = vec![0usize; 64];
        let n_start = nursery.as_ptr() as usize;
        let n_end = n_start + 64 * 8;
        let (barrier, cards, _) = barrier_with_nursery(n_start, n_end);

        let mut old = [0usize; 4];
        let old_obj = ObjectRef::from_addr(old.as_mut_ptr() as usize).unwrap();
        let young = ObjectRef::from_addr(n_start + 16).unwrap();

        // SAFETY: old_obj is a local 4-word buffer
        unsafe { barrier.set_field(old_obj, 1, Some(old_obj)) };
        assert!(!cards.is_marked(old_obj.slot(1).addr()));

        // SAFETY: as above
        unsafe { barrier.set_field(old_obj, 2, Some(young)) };
        assert_eq!(old[2], young.addr());
        assert!(cards.is_marked(old_obj.slot(2).addr()));
    }

    #[test]
    fn test_store_inside_nursery_skips_card() {
        let mut nursery = vec![0usize; 64];
        let n_start = nursery.as_mut_ptr() as usize;
        let (barrier, cards, _) = barrier_with_nursery(n_start, n_start + 64 * 8);
        let obj = ObjectRef::from_addr(n_start).unwrap();
        let other = ObjectRef::from_addr(n_start + 64).unwrap();
        // SAFETY: obj is inside the local buffer
        unsafe { barrier.set_field(obj, 1, Some(other)) };
        assert_eq!(cards.dirty_count(), 0);
    }

    #[test]
    fn test_root_store_uses_remset() {
        let nursery = vec![0usize; 64];
        let n_start = nursery.as_ptr() as usize;
        let (barrier, cards, remset) = barrier_with_nursery(n_start, n_start + 64 * 8);
        let mut root = 0usize;
        let slot = Slot::from_ptr(&mut root);
        // SAFETY: slot is a live local
        unsafe { barrier.set_root(slot, ObjectRef::from_addr(n_start + 8)) };
        assert!(remset.contains(slot));
        assert_eq!(cards.dirty_count(), 0);
    }

    #[test]
    fn test_copy_slots_marks_destination_range() {
        let nursery = vec![0usize; 64];
        let n_start = nursery.as_ptr() as usize;
        let (barrier, cards, _) = barrier_with_nursery(n_start, n_start + 64 * 8);
        let src = [0usize, n_start + 8, 0];
        let mut dst = [0usize; 3];
        // SAFETY: both are local arrays of 3 words
        unsafe {
            barrier.copy_slots(
                Slot::from_ptr(dst.as_mut_ptr()),
                Slot::from_ptr(src.as_ptr() as *mut usize),
                3,
            )
        };
        assert_eq!(dst, src);
        assert!(cards.is_marked(dst.as_ptr() as usize));
    }
}
