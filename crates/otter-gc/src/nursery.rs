//! Nursery: bump allocation over a fragment list.
//!
//! The nursery is one size-aligned block. Allocation bumps through the
//! current fragment and moves on to the next one when it runs out. After a
//! collection every unpinned object has been evacuated, so the free space is
//! everything except the pinned objects; it is zeroed and rebuilt into
//! fragments in address order.

use std::sync::Arc;

use crate::memory::{HeapAccounting, MemoryBlock, zero_range};
use crate::object::{HeaderState, LiveHeader, ObjectModel, ObjectRef};
use crate::region::{self, FRAGMENT_MIN_SIZE, Fragment, ScanStarts};

pub(crate) struct Nursery {
    block: MemoryBlock,
    fragments: Vec<Fragment>,
    next_fragment: usize,
    alloc_ptr: usize,
    alloc_limit: usize,
    /// Highest address allocation has reached since the last rebuild.
    dirty_end: usize,
    allocated: usize,
    scan_starts: ScanStarts,
    pinned: Vec<ObjectRef>,
}

impl Nursery {
    pub(crate) fn new(size: usize, accounting: &Arc<HeapAccounting>) -> Self {
        let block = MemoryBlock::allocate(size, size, accounting);
        let (start, end) = (block.start(), block.end());
        let mut nursery = Self {
            scan_starts: ScanStarts::new(start, size),
            block,
            fragments: vec![Fragment { start, end }],
            next_fragment: 0,
            alloc_ptr: start,
            alloc_limit: start,
            dirty_end: start,
            allocated: 0,
            pinned: Vec::new(),
        };
        nursery.advance_fragment();
        nursery
    }

    #[inline]
    pub(crate) fn start(&self) -> usize {
        self.block.start()
    }

    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.block.end()
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.block.contains(addr)
    }

    pub(crate) fn size(&self) -> usize {
        self.block.size()
    }

    /// Current bump pointer.
    pub(crate) fn alloc_ptr(&self) -> usize {
        self.alloc_ptr
    }

    /// Bytes handed out (plus pinned survivors) since the last rebuild.
    pub(crate) fn used_bytes(&self) -> usize {
        self.allocated
    }

    pub(crate) fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    fn advance_fragment(&mut self) -> bool {
        match self.fragments.get(self.next_fragment) {
            Some(fragment) => {
                self.alloc_ptr = fragment.start;
                self.alloc_limit = fragment.end;
                self.next_fragment += 1;
                true
            }
            None => false,
        }
    }

    /// Bump-allocate `size` (aligned) bytes. `None` when the nursery is full.
    pub(crate) fn alloc(&mut self, size: usize, header: LiveHeader) -> Option<ObjectRef> {
        loop {
            if self.alloc_limit - self.alloc_ptr >= size {
                let obj = ObjectRef::from_addr(self.alloc_ptr)?;
                self.alloc_ptr += size;
                self.dirty_end = self.dirty_end.max(self.alloc_ptr);
                self.allocated += size;
                obj.set_header(HeaderState::Live(header));
                self.scan_starts.record(obj.addr());
                return Some(obj);
            }
            if !self.advance_fragment() {
                return None;
            }
        }
    }

    /// Nursery object containing `addr`.
    pub(crate) fn find_object(&self, model: &dyn ObjectModel, addr: usize) -> Option<ObjectRef> {
        if !self.contains(addr) || addr >= self.dirty_end {
            return None;
        }
        let from = self.scan_starts.search_start(addr);
        region::object_containing(model, from, self.dirty_end, addr)
    }

    /// Pin the objects containing `candidates` (sorted, deduplicated).
    /// Returns the objects pinned by this call.
    pub(crate) fn pin_objects(&mut self, model: &dyn ObjectModel, candidates: &[usize]) -> Vec<ObjectRef> {
        let mut newly_pinned = Vec::new();
        for &addr in candidates {
            let Some(obj) = self.find_object(model, addr) else {
                continue;
            };
            let header = obj.live_header();
            if header.is_pinned() {
                continue;
            }
            obj.set_header(HeaderState::Live(header.with_pinned(true)));
            self.pinned.push(obj);
            newly_pinned.push(obj);
        }
        newly_pinned
    }

    /// Objects pinned during the current cycle.
    pub(crate) fn pinned(&self) -> &[ObjectRef] {
        &self.pinned
    }

    /// Rebuild the fragment list around the pinned survivors.
    ///
    /// Everything else in the nursery is dead or evacuated and is zeroed.
    /// Returns the free bytes available for allocation.
    pub(crate) fn build_fragments(&mut self, model: &dyn ObjectModel) -> usize {
        let mut pinned = std::mem::take(&mut self.pinned);
        pinned.sort_unstable();
        pinned.dedup();

        self.scan_starts.clear();
        self.fragments.clear();
        self.allocated = 0;

        let mut frag_start = self.start();
        for &obj in &pinned {
            let header = obj.live_header();
            let size = region::live_size(model, obj);
            obj.set_header(HeaderState::Live(header.with_pinned(false)));
            self.scan_starts.record(obj.addr());
            self.allocated += size;
            if obj.addr() > frag_start {
                self.add_fragment(frag_start, obj.addr());
            }
            frag_start = obj.addr() + size;
        }
        self.add_fragment(frag_start, self.end());

        self.dirty_end = pinned
            .last()
            .map_or(self.start(), |&obj| obj.addr() + region::live_size(model, obj));
        self.next_fragment = 0;
        self.alloc_ptr = self.start();
        self.alloc_limit = self.start();
        self.advance_fragment();
        self.fragments.iter().map(Fragment::len).sum()
    }

    fn add_fragment(&mut self, start: usize, end: usize) {
        // memory at or past dirty_end was never handed out
        let zero_end = end.min(self.dirty_end);
        if zero_end > start {
            zero_range(start, zero_end);
        }
        if end - start >= FRAGMENT_MIN_SIZE {
            self.fragments.push(Fragment { start, end });
        }
    }

    /// Visit every live object as `(object, size)`.
    pub(crate) fn for_each_object(&self, model: &dyn ObjectModel, f: impl FnMut(ObjectRef, usize)) {
        region::for_each_object(model, self.start(), self.dirty_end, f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::test_model::WordsModel;

    const SIZE: usize = 64 * 1024;

    fn nursery() -> Nursery {
        Nursery::new(SIZE, &Arc::new(HeapAccounting::new(None, None)))
    }

    #[test]
    fn test_bump_allocation() {
        let mut n = nursery();
        assert_eq!(n.start() % SIZE, 0);
        let a = n.alloc(32, LiveHeader::new(4)).unwrap();
        let b = n.alloc(16, LiveHeader::new(2)).unwrap();
        assert_eq!(a.addr(), n.start());
        assert_eq!(b.addr(), n.start() + 32);
        assert_eq!(n.alloc_ptr(), n.start() + 48);
        assert_eq!(n.used_bytes(), 48);
    }

    #[test]
    fn test_exhaustion() {
        let mut n = nursery();
        let mut count = 0;
        while n.alloc(1024, LiveHeader::new(128)).is_some() {
            count += 1;
        }
        assert_eq!(count, SIZE / 1024);
    }

    #[test]
    fn test_find_object_interior() {
        let mut n = nursery();
        let objs: Vec<_> = (0..2000).map(|_| n.alloc(40, LiveHeader::new(5)).unwrap()).collect();
        let target = objs[1500];
        assert_eq!(n.find_object(&WordsModel, target.addr() + 17), Some(target));
        assert_eq!(n.find_object(&WordsModel, target.addr()), Some(target));
        // beyond the bump pointer nothing lives
        assert_eq!(n.find_object(&WordsModel, n.alloc_ptr() + 8), None);
    }

    #[test]
    fn test_rebuild_without_pins_resets_bump_pointer() {
        let mut n = nursery();
        for _ in 0..100 {
            n.alloc(64, LiveHeader::new(8)).unwrap();
        }
        let free = n.build_fragments(&WordsModel);
        assert_eq!(free, SIZE);
        assert_eq!(n.alloc_ptr(), n.start());
        assert_eq!(n.fragments().len(), 1);
        let mut seen = 0;
        n.for_each_object(&WordsModel, |_, _| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_pinned_objects_split_fragments() {
        let mut n = nursery();
        let objs: Vec<_> = (0..512).map(|_| n.alloc(64, LiveHeader::new(8)).unwrap()).collect();
        let first = objs[100];
        let second = objs[400];
        let pinned = n.pin_objects(&WordsModel, &[first.addr() + 8, second.addr() + 63]);
        assert_eq!(pinned, vec![first, second]);
        assert!(first.live_header().is_pinned());

        // pinning twice is a no-op
        assert!(n.pin_objects(&WordsModel, &[first.addr()]).is_empty());

        let free = n.build_fragments(&WordsModel);
        assert_eq!(free, SIZE - 128);
        assert_eq!(n.fragments().len(), 3);
        assert!(!first.live_header().is_pinned());
        assert_eq!(n.used_bytes(), 128);

        // survivors are findable, the space between them is not
        assert_eq!(n.find_object(&WordsModel, second.addr() + 8), Some(second));
        assert_eq!(n.find_object(&WordsModel, first.addr() + 64), None);

        let mut seen = Vec::new();
        n.for_each_object(&WordsModel, |o, _| seen.push(o));
        assert_eq!(seen, vec![first, second]);
    }

    #[test]
    fn test_small_gaps_are_dropped() {
        let mut n = nursery();
        let objs: Vec<_> = (0..16).map(|_| n.alloc(64, LiveHeader::new(8)).unwrap()).collect();
        // two pinned objects with a 128-byte gap between them
        n.pin_objects(&WordsModel, &[objs[0].addr(), objs[3].addr()]);
        n.build_fragments(&WordsModel);
        assert!(n.fragments().iter().all(|f| f.len() >= FRAGMENT_MIN_SIZE));
        assert_eq!(n.fragments().len(), 1);
        assert_eq!(n.fragments()[0].start, objs[3].addr() + 64);

        // allocation skips the pinned objects
        let c = n.alloc(64, LiveHeader::new(8)).unwrap();
        assert_eq!(c.addr(), objs[3].addr() + 64);
    }
}
