//! Major heap: copying sections, pinned chunks and the large object space.
//!
//! Small old objects live in sections, size-aligned blocks filled by bump
//! allocation. A major collection evacuates every reachable, unpinned
//! section object into fresh to-space sections; from-space sections without
//! pinned survivors are then released whole. Sections holding pinned
//! objects stay, and the space around the pins becomes fragments.
//!
//! Objects that must never move go to pinned chunks (small) or the large
//! object space (big). Both are marked in place and swept.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::card_table::CardTable;
use crate::error::{FatalError, fatal};
use crate::los::{LargeObjectSpace, LosSweep};
use crate::memory::{BLOCK_HEADER_SIZE, BlockHeader, BlockRole, HeapAccounting, MemoryBlock, zero_range};
use crate::object::{HeaderState, LiveHeader, ObjectModel, ObjectRef};
use crate::pinned_chunk::{PinnedChunk, slot_class};
use crate::region::{self, Fragment, ScanStarts};

/// Lower bound on the section allowance, in nursery-sized units.
const MIN_ALLOWANCE_NURSERY_MULTIPLE: usize = 3;

/// A bump-allocated block of old objects.
pub(crate) struct Section {
    block: MemoryBlock,
    data_start: usize,
    next_data: usize,
    scan_starts: ScanStarts,
    fragments: Vec<Fragment>,
    pinned: Vec<ObjectRef>,
}

impl Section {
    pub(crate) fn new(size: usize, accounting: &Arc<HeapAccounting>) -> Self {
        let block = MemoryBlock::allocate(size, size, accounting);
        BlockHeader::init(&block, BlockRole::Section);
        let data_start = block.start() + BLOCK_HEADER_SIZE;
        Self {
            scan_starts: ScanStarts::new(data_start, size - BLOCK_HEADER_SIZE),
            block,
            data_start,
            next_data: data_start,
            fragments: Vec::new(),
            pinned: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> usize {
        self.block.start()
    }

    pub(crate) fn header(&self) -> &BlockHeader {
        // SAFETY: the block is a live section aligned to its own size
        unsafe { BlockHeader::of(self.base(), self.block.size() - 1) }
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.block.contains(addr)
    }

    /// Bytes left in the bump tail.
    #[inline]
    pub(crate) fn tail_room(&self) -> usize {
        self.block.end() - self.next_data
    }

    pub(crate) fn next_data(&self) -> usize {
        self.next_data
    }

    pub(crate) fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// Allocate from a fragment, else from the bump tail.
    pub(crate) fn alloc(&mut self, size: usize, header: LiveHeader) -> Option<ObjectRef> {
        let addr = match self.fragments.iter().position(|f| f.len() >= size) {
            Some(index) => {
                let fragment = &mut self.fragments[index];
                let addr = fragment.start;
                fragment.start += size;
                if fragment.len() == 0 {
                    self.fragments.remove(index);
                }
                addr
            }
            None if self.tail_room() >= size => {
                let addr = self.next_data;
                self.next_data += size;
                addr
            }
            None => return None,
        };
        let obj = ObjectRef::from_addr(addr)?;
        obj.set_header(HeaderState::Live(header));
        self.scan_starts.record(addr);
        Some(obj)
    }

    /// Cut `[start, end)` off the bump tail: `preferred` bytes if there is
    /// room, otherwise whatever is left as long as it is at least `min`.
    pub(crate) fn carve(&mut self, min: usize, preferred: usize) -> Option<(usize, usize)> {
        let len = preferred.min(self.tail_room());
        if len < min {
            return None;
        }
        let start = self.next_data;
        self.next_data += len;
        Some((start, start + len))
    }

    /// Return an unused carved tail. Only the range ending at the bump
    /// pointer can be taken back; anything else stays as a zeroed gap.
    pub(crate) fn give_back(&mut self, start: usize, end: usize) {
        if end == self.next_data && start >= self.data_start {
            self.next_data = start;
        }
    }

    /// Object containing `addr`.
    pub(crate) fn find_object(&self, model: &dyn ObjectModel, addr: usize) -> Option<ObjectRef> {
        if addr < self.data_start || addr >= self.next_data {
            return None;
        }
        let from = self.scan_starts.search_start(addr);
        region::object_containing(model, from, self.next_data, addr)
    }

    /// Pin `obj`. Returns `false` if it was already pinned.
    pub(crate) fn pin(&mut self, obj: ObjectRef) -> bool {
        let header = obj.live_header();
        if header.is_pinned() {
            return false;
        }
        obj.set_header(HeaderState::Live(header.with_pinned(true)));
        self.pinned.push(obj);
        true
    }

    pub(crate) fn has_pins(&self) -> bool {
        !self.pinned.is_empty()
    }

    /// After a major collection: keep only the pinned objects and turn the
    /// space between them into fragments. Returns the bytes freed.
    fn build_fragments(&mut self, model: &dyn ObjectModel) -> usize {
        let mut pinned = std::mem::take(&mut self.pinned);
        pinned.sort_unstable();
        pinned.dedup();

        let old_used = self.used_bytes();
        self.fragments.clear();
        self.scan_starts.clear();

        let mut cursor = self.data_start;
        for &obj in &pinned {
            let header = obj.live_header();
            let size = region::live_size(model, obj);
            obj.set_header(HeaderState::Live(header.with_pinned(false).with_marked(false)));
            self.scan_starts.record(obj.addr());
            if let Some(fragment) = region::make_fragment(cursor, obj.addr()) {
                self.fragments.push(fragment);
            }
            cursor = obj.addr() + size;
        }
        zero_range(cursor, self.next_data);
        self.next_data = cursor;
        old_used.saturating_sub(self.used_bytes())
    }

    pub(crate) fn rebuild_scan_starts(&mut self, model: &dyn ObjectModel) {
        self.scan_starts.clear();
        let starts = &mut self.scan_starts;
        region::for_each_object(model, self.data_start, self.next_data, |obj, _| {
            starts.record(obj.addr());
        });
    }

    /// Visit every object as `(object, size)`.
    pub(crate) fn for_each_object(&self, model: &dyn ObjectModel, f: impl FnMut(ObjectRef, usize)) {
        region::for_each_object(model, self.data_start, self.next_data, f);
    }

    /// Bytes below the bump pointer that are not free fragments.
    pub(crate) fn used_bytes(&self) -> usize {
        let free: usize = self.fragments.iter().map(Fragment::len).sum();
        self.next_data - self.data_start - free
    }
}

/// Footprint of the major heap.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MajorUsage {
    pub sections: usize,
    pub section_bytes: usize,
    pub chunks: usize,
    pub chunk_bytes: usize,
    pub los_objects: usize,
    pub los_bytes: usize,
}

/// What a major sweep reclaimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MajorSweep {
    pub sections_freed: usize,
    pub section_bytes_freed: usize,
    pub chunk_bytes_freed: usize,
    pub los: LosSweep,
}

pub(crate) struct MajorHeap {
    section_size: usize,
    large_threshold: usize,
    sections: Vec<Section>,
    chunks: Vec<PinnedChunk>,
    los: LargeObjectSpace,
    alloc_cursor: usize,
    /// Sections (and chunks) allocated since the last major collection.
    sections_alloced: usize,
    allowance: usize,
    min_allowance: usize,
    /// Section base -> index, valid during the pin phase of a major cycle.
    section_index: FxHashMap<usize, usize>,
    accounting: Arc<HeapAccounting>,
}

impl MajorHeap {
    pub(crate) fn new(
        section_size: usize,
        nursery_size: usize,
        large_threshold: usize,
        los_target: usize,
        accounting: Arc<HeapAccounting>,
    ) -> Self {
        let min_allowance = (nursery_size * MIN_ALLOWANCE_NURSERY_MULTIPLE / section_size).max(1);
        Self {
            section_size,
            large_threshold,
            sections: Vec::new(),
            chunks: Vec::new(),
            los: LargeObjectSpace::new(los_target),
            alloc_cursor: 0,
            sections_alloced: 0,
            allowance: min_allowance,
            min_allowance,
            section_index: FxHashMap::default(),
            accounting,
        }
    }

    /// Mask that maps an address inside a section or chunk to its base.
    #[inline]
    pub(crate) fn block_mask(&self) -> usize {
        self.section_size - 1
    }

    pub(crate) fn section_size(&self) -> usize {
        self.section_size
    }

    pub(crate) fn large_threshold(&self) -> usize {
        self.large_threshold
    }

    pub(crate) fn accounting(&self) -> &Arc<HeapAccounting> {
        &self.accounting
    }

    pub(crate) fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub(crate) fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub(crate) fn sections_alloced(&self) -> usize {
        self.sections_alloced
    }

    pub(crate) fn allowance(&self) -> usize {
        self.allowance
    }

    fn new_section(&mut self) -> Section {
        self.sections_alloced += 1;
        Section::new(self.section_size, &self.accounting)
    }

    /// Allocate a movable old object. Sizes above the large-object
    /// threshold go to the large object space.
    pub(crate) fn alloc_small(&mut self, size: usize, header: LiveHeader) -> ObjectRef {
        if size > self.large_threshold {
            return self.alloc_large(size, header);
        }
        while self.alloc_cursor < self.sections.len() {
            if let Some(obj) = self.sections[self.alloc_cursor].alloc(size, header) {
                return obj;
            }
            self.alloc_cursor += 1;
        }
        let mut section = self.new_section();
        let obj = section.alloc(size, header);
        self.sections.push(section);
        self.alloc_cursor = self.sections.len() - 1;
        match obj {
            Some(obj) => obj,
            None => fatal(FatalError::Invariant(format!(
                "{size} bytes do not fit an empty section"
            ))),
        }
    }

    /// Allocate an object that never moves.
    pub(crate) fn alloc_pinned(&mut self, size: usize, header: LiveHeader) -> ObjectRef {
        let Some(class) = slot_class(size) else {
            return self.los.alloc(size, header, &self.accounting);
        };
        let addr = match self.chunks.iter_mut().find_map(|chunk| chunk.alloc(class)) {
            Some(addr) => addr,
            None => {
                self.sections_alloced += 1;
                let mut chunk = PinnedChunk::new(self.section_size, &self.accounting);
                let addr = chunk.alloc(class);
                self.chunks.push(chunk);
                match addr {
                    Some(addr) => addr,
                    None => fatal(FatalError::Invariant(format!(
                        "slot class {class} does not fit an empty chunk"
                    ))),
                }
            }
        };
        match ObjectRef::from_addr(addr) {
            Some(obj) => {
                obj.set_header(HeaderState::Live(header));
                obj
            }
            None => fatal(FatalError::Invariant("null chunk slot".into())),
        }
    }

    /// Allocate a non-moving object. Objects at or below the large-object
    /// threshold use a pinned slot so that size alone identifies LOS objects.
    pub(crate) fn alloc_large(&mut self, size: usize, header: LiveHeader) -> ObjectRef {
        if size <= self.large_threshold {
            return self.alloc_pinned(size, header);
        }
        self.los.alloc(size, header, &self.accounting)
    }

    /// Too many sections since the last major collection, or the LOS grew
    /// past its trigger.
    pub(crate) fn need_major_collection(&self) -> bool {
        self.sections_alloced > self.allowance || self.los.needs_collection()
    }

    pub(crate) fn los_needs_collection(&self) -> bool {
        self.los.needs_collection()
    }

    /// Lend the last section to a minor collection as promotion space when
    /// its tail has at least `min_room` bytes.
    pub(crate) fn take_to_space_seed(&mut self, min_room: usize) -> Option<Section> {
        if self.sections.last()?.tail_room() < min_room {
            return None;
        }
        let section = self.sections.pop()?;
        self.alloc_cursor = self.alloc_cursor.min(self.sections.len());
        Some(section)
    }

    /// Resolve sorted ambiguous words against the major heap for a major
    /// collection. Section objects are pinned; chunk and LOS objects are
    /// marked. Objects that now need scanning are pushed onto `found`.
    pub(crate) fn pin_candidates(
        &mut self,
        model: &dyn ObjectModel,
        candidates: &[usize],
        found: &mut Vec<ObjectRef>,
    ) -> usize {
        self.section_index.clear();
        for (index, section) in self.sections.iter().enumerate() {
            self.section_index.insert(section.base(), index);
        }
        let chunk_index: FxHashMap<usize, usize> =
            self.chunks.iter().enumerate().map(|(i, c)| (c.base(), i)).collect();

        let mask = self.block_mask();
        let mut pinned = 0;
        for &addr in candidates {
            let base = addr & !mask;
            if let Some(&index) = self.section_index.get(&base) {
                let section = &mut self.sections[index];
                if let Some(obj) = section.find_object(model, addr) {
                    if section.pin(obj) {
                        pinned += 1;
                        found.push(obj);
                    }
                }
            } else if let Some(&index) = chunk_index.get(&base) {
                if let Some(obj) = self.chunks[index].find_object(addr) {
                    if obj.try_mark() {
                        pinned += 1;
                        found.push(obj);
                    }
                }
            } else if let Some(obj) = self.los.find_object(addr) {
                if obj.try_mark() {
                    pinned += 1;
                    found.push(obj);
                }
            }
        }
        pinned
    }

    /// Old objects overlapping a dirty card, for a minor collection.
    pub(crate) fn collect_card_marked(
        &self,
        model: &dyn ObjectModel,
        cards: &CardTable,
        found: &mut Vec<ObjectRef>,
    ) {
        for section in &self.sections {
            if !cards.is_region_marked(section.data_start, section.next_data) {
                continue;
            }
            section.for_each_object(model, |obj, size| {
                if cards.is_region_marked(obj.addr(), obj.addr() + size) {
                    found.push(obj);
                }
            });
        }
        for chunk in &self.chunks {
            chunk.for_each_object(|obj, size| {
                if cards.is_region_marked(obj.addr(), obj.addr() + size) {
                    found.push(obj);
                }
            });
        }
        self.los.for_each_object(|obj, size| {
            if cards.is_region_marked(obj.addr(), obj.addr() + size) {
                found.push(obj);
            }
        });
    }

    /// Reclaim after a major collection's trace. Every current section is
    /// from-space; to-space sections are adopted afterwards.
    pub(crate) fn sweep(&mut self, model: &dyn ObjectModel) -> MajorSweep {
        let mut result = MajorSweep {
            los: self.los.sweep(),
            ..MajorSweep::default()
        };
        result.chunk_bytes_freed = self.chunks.iter_mut().map(PinnedChunk::sweep).sum();

        let mut freed_sections = 0;
        let mut freed_bytes = 0;
        self.sections.retain_mut(|section| {
            if section.has_pins() {
                freed_bytes += section.build_fragments(model);
                true
            } else {
                freed_sections += 1;
                freed_bytes += section.used_bytes();
                false
            }
        });
        result.sections_freed = freed_sections;
        result.section_bytes_freed = freed_bytes;
        self.alloc_cursor = 0;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "otter::gc",
            sections_freed = freed_sections,
            section_bytes_freed = freed_bytes,
            los_freed = result.los.freed_objects,
            "major sweep complete"
        );
        result
    }

    /// Take back the sections a collection copied into.
    ///
    /// `seed` is the section lent by [`take_to_space_seed`](Self::take_to_space_seed);
    /// `fresh` were allocated during the cycle and count toward the allowance.
    pub(crate) fn adopt_to_space(
        &mut self,
        model: &dyn ObjectModel,
        seed: Option<Section>,
        fresh: Vec<Section>,
    ) {
        if let Some(mut section) = seed {
            section.rebuild_scan_starts(model);
            self.sections.push(section);
        }
        for mut section in fresh {
            section.header().set_to_space(false);
            section.rebuild_scan_starts(model);
            self.sections_alloced += 1;
            self.sections.push(section);
        }
    }

    /// Recompute the section allowance after a major collection.
    ///
    /// `old_count` is the number of sections before the collection. The
    /// more sections a collection frees relative to what was allocated since
    /// the previous one, the longer the heap may grow before the next.
    pub(crate) fn update_allowance(&mut self, old_count: usize) {
        let num = self.sections.len();
        let saved = old_count.saturating_sub(num).max(1);
        let save_target = num / 2;
        let target = save_target * self.sections_alloced / saved;
        self.allowance = target.min(num).max(self.min_allowance);
        self.sections_alloced = 0;
        self.los.reset_trigger();
    }

    /// Visit every major-heap object as `(object, size)`.
    pub(crate) fn for_each_object(&self, model: &dyn ObjectModel, mut f: impl FnMut(ObjectRef, usize)) {
        for section in &self.sections {
            section.for_each_object(model, &mut f);
        }
        for chunk in &self.chunks {
            chunk.for_each_object(&mut f);
        }
        self.los.for_each_object(&mut f);
    }

    /// Major-heap object containing `addr`, if any.
    pub(crate) fn find_object(&self, model: &dyn ObjectModel, addr: usize) -> Option<ObjectRef> {
        let base = addr & !self.block_mask();
        if let Some(section) = self.sections.iter().find(|s| s.base() == base) {
            return section.find_object(model, addr);
        }
        if let Some(chunk) = self.chunks.iter().find(|c| c.base() == base) {
            return chunk.find_object(addr);
        }
        self.los.find_object(addr)
    }

    /// Base addresses of every section and pinned chunk.
    pub(crate) fn block_bases(&self) -> FxHashSet<usize> {
        self.sections
            .iter()
            .map(Section::base)
            .chain(self.chunks.iter().map(PinnedChunk::base))
            .collect()
    }

    pub(crate) fn in_large_object(&self, addr: usize) -> bool {
        self.los.find_object(addr).is_some()
    }

    pub(crate) fn usage(&self) -> MajorUsage {
        MajorUsage {
            sections: self.sections.len(),
            section_bytes: self.sections.iter().map(Section::used_bytes).sum(),
            chunks: self.chunks.len(),
            chunk_bytes: self.chunks.iter().map(PinnedChunk::used_bytes).sum(),
            los_objects: self.los.len(),
            los_bytes: self.los.memory_usage(),
        }
    }
}
