//! Object scanning, evacuation and in-place marking.
//!
//! One [`Tracer`] runs per participating thread. It owns a gray queue and
//! a local allocation buffer (LAB) carved from shared to-space sections.
//!
//! Evacuation copies first and publishes second: the object body is copied
//! into the LAB, then the forwarding address is installed with a single
//! compare-and-swap on the original header. The thread whose CAS fails
//! zeroes its copy, rolls the LAB back and adopts the winner's address, so
//! every object is copied and queued exactly once.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::card_table::CardTable;
use crate::error::{FatalError, fatal};
use crate::gray_queue::GrayQueue;
use crate::major::Section;
use crate::memory::{BlockHeader, BlockRole, HeapAccounting, zero_range};
use crate::object::{HEADER_SIZE, HeaderState, LiveHeader, ObjectModel, ObjectRef, Slot};
use crate::region;

/// Preferred size of a local allocation buffer.
pub const LAB_SIZE: usize = 4096;

/// What a collection may touch, shared read-only by all tracers.
pub(crate) struct TraceSpace {
    pub model: Arc<dyn ObjectModel>,
    pub cards: Arc<CardTable>,
    pub nursery_start: usize,
    pub nursery_end: usize,
    /// Old objects are evacuated or marked only in a major cycle.
    pub major: bool,
    pub block_mask: usize,
    pub large_threshold: usize,
}

impl TraceSpace {
    #[inline]
    pub(crate) fn in_nursery(&self, addr: usize) -> bool {
        addr >= self.nursery_start && addr < self.nursery_end
    }
}

/// Sections receiving evacuated objects.
///
/// In a minor cycle the first section may be a partially filled one lent
/// by the major heap; all later sections are fresh and flagged as to-space.
pub(crate) struct ToSpace {
    sections: Mutex<Vec<Section>>,
    seeded: bool,
    section_size: usize,
    accounting: Arc<HeapAccounting>,
}

impl ToSpace {
    pub(crate) fn new(section_size: usize, accounting: Arc<HeapAccounting>, seed: Option<Section>) -> Self {
        let seeded = seed.is_some();
        Self {
            sections: Mutex::new(seed.into_iter().collect()),
            seeded,
            section_size,
            accounting,
        }
    }

    /// A fresh buffer of at least `min` bytes, `preferred` when possible.
    fn refill(&self, min: usize, preferred: usize) -> (usize, usize) {
        let mut sections = self.sections.lock();
        if let Some(range) = sections.last_mut().and_then(|s| s.carve(min, preferred)) {
            return range;
        }
        let mut section = Section::new(self.section_size, &self.accounting);
        section.header().set_to_space(true);
        let range = match section.carve(min, preferred) {
            Some(range) => range,
            None => fatal(FatalError::Invariant(format!(
                "LAB of {min} bytes does not fit an empty section"
            ))),
        };
        sections.push(section);
        range
    }

    fn give_back(&self, start: usize, end: usize) {
        let mut sections = self.sections.lock();
        if let Some(section) = sections.iter_mut().rev().find(|s| s.contains(start)) {
            section.give_back(start, end);
        }
    }

    /// Split into the lent section (if any) and the fresh ones.
    pub(crate) fn into_sections(self) -> (Option<Section>, Vec<Section>) {
        let mut sections = self.sections.into_inner();
        if self.seeded && !sections.is_empty() {
            let seed = sections.remove(0);
            (Some(seed), sections)
        } else {
            (None, sections)
        }
    }
}

/// Per-tracer counters, summed into the cycle statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TracerStats {
    /// Objects this tracer evacuated
    pub copied_objects: usize,
    /// Bytes this tracer evacuated
    pub copied_bytes: usize,
    /// Objects marked in place (pinned chunks and LOS)
    pub marked_objects: usize,
    /// Objects scanned
    pub scanned_objects: usize,
    /// Copies discarded because another tracer forwarded first
    pub lost_races: usize,
}

impl TracerStats {
    pub(crate) fn merge(&mut self, other: &TracerStats) {
        self.copied_objects += other.copied_objects;
        self.copied_bytes += other.copied_bytes;
        self.marked_objects += other.marked_objects;
        self.scanned_objects += other.scanned_objects;
        self.lost_races += other.lost_races;
    }
}

#[derive(Default)]
struct Lab {
    ptr: usize,
    limit: usize,
}

pub(crate) struct Tracer<'a> {
    space: &'a TraceSpace,
    to_space: &'a ToSpace,
    pub(crate) queue: GrayQueue,
    lab: Lab,
    pub(crate) stats: TracerStats,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(space: &'a TraceSpace, to_space: &'a ToSpace, queue: GrayQueue) -> Self {
        Self {
            space,
            to_space,
            queue,
            lab: Lab::default(),
            stats: TracerStats::default(),
        }
    }

    /// Forward the value of one reference slot and return the new value.
    ///
    /// Nursery objects are evacuated unless pinned. In a major cycle, old
    /// section objects are evacuated unless pinned or already in to-space,
    /// and pinned-chunk and LOS objects are marked in place. Anything newly
    /// copied or marked is queued for scanning.
    pub(crate) fn copy_or_mark(&mut self, addr: usize) -> usize {
        let Some(obj) = ObjectRef::from_addr(addr) else {
            return addr;
        };
        let in_nursery = self.space.in_nursery(addr);
        if !in_nursery && !self.space.major {
            return addr;
        }
        let word = obj.header_cell().load(Ordering::Acquire);
        let header = match HeaderState::decode(word) {
            HeaderState::Forwarded(to) => return to.addr(),
            HeaderState::Live(header) => header,
            HeaderState::Empty => fatal(FatalError::Invariant(format!(
                "reference to empty memory at {addr:#x}"
            ))),
        };
        if header.is_pinned() {
            // queued when it was pinned
            return addr;
        }
        let size = self.object_size(obj, header);
        if in_nursery {
            return self.evacuate(obj, word, header, size);
        }
        if size > self.space.large_threshold {
            self.mark_in_place(obj);
            return addr;
        }
        // SAFETY: old objects up to the threshold live in sections or chunks
        let block = unsafe { BlockHeader::of(addr, self.space.block_mask) };
        match block.role() {
            BlockRole::PinnedChunk => {
                self.mark_in_place(obj);
                addr
            }
            BlockRole::Section if block.is_to_space() => addr,
            BlockRole::Section => self.evacuate(obj, word, header, size),
        }
    }

    #[inline]
    fn object_size(&self, obj: ObjectRef, header: LiveHeader) -> usize {
        crate::object::align_size(self.space.model.object_size(obj, header))
    }

    fn mark_in_place(&mut self, obj: ObjectRef) {
        if obj.try_mark() {
            self.stats.marked_objects += 1;
            self.queue.enqueue(obj);
        }
    }

    fn evacuate(&mut self, obj: ObjectRef, mut word: usize, mut header: LiveHeader, size: usize) -> usize {
        loop {
            let dst = self.lab_alloc(size);
            // SAFETY: the source is a live object of `size` bytes and the
            // destination a fresh LAB range of the same size.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (obj.addr() + HEADER_SIZE) as *const u8,
                    (dst + HEADER_SIZE) as *mut u8,
                    size - HEADER_SIZE,
                );
            }
            let Some(copy) = ObjectRef::from_addr(dst) else {
                fatal(FatalError::Invariant("null LAB allocation".into()));
            };
            copy.set_header(HeaderState::Live(LiveHeader::new(header.shape())));

            let forwarded = HeaderState::Forwarded(copy).encode();
            match obj
                .header_cell()
                .compare_exchange(word, forwarded, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.stats.copied_objects += 1;
                    self.stats.copied_bytes += size;
                    self.queue.enqueue(copy);
                    return dst;
                }
                Err(current) => {
                    zero_range(dst, dst + size);
                    self.lab.ptr = dst;
                    self.stats.lost_races += 1;
                    match HeaderState::decode(current) {
                        HeaderState::Forwarded(to) => return to.addr(),
                        HeaderState::Live(now) if now.is_pinned() => return obj.addr(),
                        HeaderState::Live(now) => {
                            word = current;
                            header = now;
                        }
                        HeaderState::Empty => fatal(FatalError::Invariant(format!(
                            "object {obj:?} vanished during evacuation"
                        ))),
                    }
                }
            }
        }
    }

    fn lab_alloc(&mut self, size: usize) -> usize {
        if self.lab.limit - self.lab.ptr < size {
            let (start, end) = self.to_space.refill(size, size.max(LAB_SIZE));
            self.lab = Lab { ptr: start, limit: end };
        }
        let addr = self.lab.ptr;
        self.lab.ptr += size;
        addr
    }

    /// Scan every reference slot of `obj`.
    ///
    /// The object model is asked for the descriptor exactly once. A slot
    /// outside the nursery that still refers into it afterwards (a pinned
    /// nursery object) gets its card re-marked.
    pub(crate) fn scan_object(&mut self, obj: ObjectRef) {
        let space = self.space;
        let header = obj.live_header();
        let size = region::live_size(space.model.as_ref(), obj);
        let descriptor = space.model.descriptor(obj, header);
        let old_object = !space.in_nursery(obj.addr());
        descriptor.for_each_slot(obj, size, |slot| {
            // SAFETY: descriptor slots lie inside a live object
            let old = unsafe { slot.load() };
            if old == 0 {
                return;
            }
            let new = self.copy_or_mark(old);
            if new != old {
                // SAFETY: as above; only this tracer scans `obj`
                unsafe { slot.store(new) };
            }
            if old_object && space.in_nursery(new) {
                space.cards.mark(slot.addr());
            }
        });
        self.stats.scanned_objects += 1;
    }

    /// Forward a root slot in place and return its new value.
    ///
    /// # Safety
    /// `slot` must be valid for reads and writes.
    pub(crate) unsafe fn trace_root(&mut self, slot: Slot) -> usize {
        // SAFETY: guaranteed by the caller
        let old = unsafe { slot.load() };
        let new = self.copy_or_mark(old);
        if new != old {
            // SAFETY: guaranteed by the caller
            unsafe { slot.store(new) };
        }
        new
    }

    #[cfg(test)]
    /// Scan queued objects until the local queue is empty.
    pub(crate) fn drain_local(&mut self) {
        while let Some(obj) = self.queue.dequeue() {
            self.scan_object(obj);
        }
    }

    /// Return the unused LAB tail and hand back the queue.
    pub(crate) fn finish(mut self) -> (GrayQueue, TracerStats) {
        if self.lab.limit > self.lab.ptr {
            self.to_space.give_back(self.lab.ptr, self.lab.limit);
        }
        self.lab = Lab::default();
        (self.queue, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card_table::CardTable;
    use crate::major::MajorHeap;
    use crate::nursery::Nursery;
    use crate::region::test_model::WordsModel;

    struct Fixture {
        accounting: Arc<HeapAccounting>,
        nursery: Nursery,
        major: MajorHeap,
        cards: Arc<CardTable>,
    }

    impl Fixture {
        fn new() -> Self {
            let accounting = Arc::new(HeapAccounting::new(None, None));
            Self {
                nursery: Nursery::new(64 * 1024, &accounting),
                major: MajorHeap::new(64 * 1024, 64 * 1024, 8192, 1 << 20, accounting.clone()),
                cards: Arc::new(CardTable::new(9, 20)),
                accounting,
            }
        }

        fn space(&self, major: bool) -> TraceSpace {
            TraceSpace {
                model: Arc::new(WordsModel),
                cards: self.cards.clone(),
                nursery_start: self.nursery.start(),
                nursery_end: self.nursery.end(),
                major,
                block_mask: self.major.block_mask(),
                large_threshold: self.major.large_threshold(),
            }
        }

        fn to_space(&self) -> ToSpace {
            ToSpace::new(64 * 1024, self.accounting.clone(), None)
        }
    }

    // shape 3: [header, ref, ref]
    fn link(obj: ObjectRef, index: usize, target: ObjectRef) {
        unsafe { obj.write_word(index, target.addr()) };
    }

    #[test]
    fn test_evacuate_forwards_once() {
        let mut f = Fixture::new();
        let a = f.nursery.alloc(24, LiveHeader::new(3)).unwrap();
        unsafe { a.write_word(1, 0xdead_0000) };
        let space = f.space(false);
        let to_space = f.to_space();
        let mut tracer = Tracer::new(&space, &to_space, GrayQueue::new());

        let new = tracer.copy_or_mark(a.addr());
        assert_ne!(new, a.addr());
        assert_eq!(a.header_state(), HeaderState::Forwarded(ObjectRef::from_addr(new).unwrap()));
        // the second visit follows the forwarding address
        assert_eq!(tracer.copy_or_mark(a.addr()), new);
        let copy = ObjectRef::from_addr(new).unwrap();
        assert_eq!(unsafe { copy.read_word(1) }, 0xdead_0000);
        assert_eq!(copy.live_header(), LiveHeader::new(3));
        assert_eq!(tracer.queue.len(), 1);
        assert_eq!(tracer.stats.copied_objects, 1);
        tracer.finish();
    }

    #[test]
    fn test_minor_leaves_old_objects_alone() {
        let mut f = Fixture::new();
        let old = f.major.alloc_small(24, LiveHeader::new(3));
        let space = f.space(false);
        let to_space = f.to_space();
        let mut tracer = Tracer::new(&space, &to_space, GrayQueue::new());
        assert_eq!(tracer.copy_or_mark(old.addr()), old.addr());
        assert_eq!(tracer.copy_or_mark(0), 0);
        assert!(tracer.queue.is_empty());
    }

    #[test]
    fn test_scan_updates_slots_and_marks_cards() {
        let mut f = Fixture::new();
        let young = f.nursery.alloc(24, LiveHeader::new(3)).unwrap();
        let pinned = f.nursery.alloc(24, LiveHeader::new(3)).unwrap();
        f.nursery.pin_objects(&WordsModel, &[pinned.addr()]);
        let old = f.major.alloc_small(24, LiveHeader::new(3));
        link(old, 1, young);
        link(old, 2, pinned);

        let space = f.space(false);
        let to_space = f.to_space();
        let mut tracer = Tracer::new(&space, &to_space, GrayQueue::new());
        tracer.scan_object(old);

        let moved = unsafe { old.read_word(1) };
        assert_ne!(moved, young.addr());
        assert!(!space.in_nursery(moved));
        assert_eq!(unsafe { old.read_word(2) }, pinned.addr());
        // the slot still pointing at the pinned nursery object is carded
        assert!(f.cards.is_marked(old.slot(2).addr()));
        tracer.drain_local();
        assert_eq!(tracer.stats.scanned_objects, 2);
    }

    #[test]
    fn test_major_marks_chunk_and_los_objects() {
        let mut f = Fixture::new();
        let slot = f.major.alloc_pinned(24, LiveHeader::new(3));
        let large = f.major.alloc_large(16_384, LiveHeader::new(2048));
        let space = f.space(true);
        let to_space = f.to_space();
        let mut tracer = Tracer::new(&space, &to_space, GrayQueue::new());

        assert_eq!(tracer.copy_or_mark(slot.addr()), slot.addr());
        assert_eq!(tracer.copy_or_mark(large.addr()), large.addr());
        assert_eq!(tracer.copy_or_mark(slot.addr()), slot.addr());
        assert!(slot.live_header().is_marked());
        assert!(large.live_header().is_marked());
        assert_eq!(tracer.queue.len(), 2);
        assert_eq!(tracer.stats.marked_objects, 2);
    }

    #[test]
    fn test_major_evacuates_sections_into_to_space() {
        let mut f = Fixture::new();
        let a = f.major.alloc_small(24, LiveHeader::new(3));
        let b = f.major.alloc_small(24, LiveHeader::new(3));
        link(a, 1, b);
        let space = f.space(true);
        let to_space = f.to_space();
        let mut tracer = Tracer::new(&space, &to_space, GrayQueue::new());

        let new_a = tracer.copy_or_mark(a.addr());
        tracer.drain_local();
        let new_a = ObjectRef::from_addr(new_a).unwrap();
        let new_b = unsafe { new_a.read_word(1) };
        assert_ne!(new_b, b.addr());
        // to-space objects are left where they are
        assert_eq!(tracer.copy_or_mark(new_b), new_b);
        tracer.finish();

        let (seed, fresh) = to_space.into_sections();
        assert!(seed.is_none());
        assert_eq!(fresh.len(), 1);
        assert!(fresh[0].header().is_to_space());
        // the unused LAB tail went back to the section
        assert_eq!(fresh[0].used_bytes(), 48);
    }

    #[test]
    fn test_parallel_evacuation_race() {
        let mut f = Fixture::new();
        let objs: Vec<_> = (0..500).map(|_| f.nursery.alloc(32, LiveHeader::new(4)).unwrap()).collect();
        let space = f.space(false);
        let to_space = f.to_space();

        let results: Vec<Vec<usize>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let (space, to_space, objs) = (&space, &to_space, &objs);
                    s.spawn(move || {
                        let mut tracer = Tracer::new(space, to_space, GrayQueue::new());
                        let out = objs.iter().map(|o| tracer.copy_or_mark(o.addr())).collect();
                        tracer.finish();
                        out
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        // every tracer agrees on every destination
        for other in &results[1..] {
            assert_eq!(other, &results[0]);
        }
        let (_, fresh) = to_space.into_sections();
        let mut live = 0;
        for section in &fresh {
            section.for_each_object(&WordsModel, |_, _| live += 1);
        }
        assert_eq!(live, objs.len());
    }
}
