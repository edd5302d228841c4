//! Pinned chunks: slot allocation for objects that must never move.
//!
//! A chunk is one section-sized, section-aligned block split into 16KB
//! pages. A page is dedicated to one slot size the first time a request of
//! that size needs room, and goes back to the unassigned pool once a sweep
//! empties it. Chunks themselves are never freed.
//!
//! ## Layout
//!
//! ```text
//! PinnedChunk (section_size bytes, aligned to section_size):
//! ┌──────────────────────────────┐
//! │ BlockHeader (role, to-space) │
//! │ Page 0: slots of size A      │
//! │ Page 1: unassigned           │
//! │ Page 2: slots of size B      │
//! │ ...                          │
//! └──────────────────────────────┘
//!
//! Per page, stored separately:
//!   - free_bits: 1 = free slot, 0 = allocated
//! ```

use std::sync::Arc;

use crate::memory::{BLOCK_HEADER_SIZE, BlockHeader, BlockRole, HeapAccounting, MemoryBlock, zero_range};
use crate::object::{HeaderState, ObjectRef};

/// Page size inside a pinned chunk.
pub const PINNED_PAGE_SIZE: usize = 16 * 1024;

/// Slot sizes. Requests are rounded up to the nearest one.
pub const SLOT_SIZES: &[usize] = &[
    16, 32, 48, 64, 96, 128, 192, 256, 384, 512, 1024, 2048, 4096, 8192,
];

/// Largest slot; bigger objects go to the large object space.
pub const MAX_SLOT_SIZE: usize = 8192;

/// Index of the smallest slot size that fits `size`.
#[inline]
pub fn slot_class(size: usize) -> Option<usize> {
    SLOT_SIZES.iter().position(|&s| s >= size)
}

struct PinnedPage {
    start: usize,
    /// 0 while unassigned
    slot_size: usize,
    num_slots: usize,
    free_bits: Vec<u64>,
    live: usize,
}

impl PinnedPage {
    fn unassigned(start: usize) -> Self {
        Self {
            start,
            slot_size: 0,
            num_slots: 0,
            free_bits: Vec::new(),
            live: 0,
        }
    }

    fn assign(&mut self, slot_size: usize) {
        let num_slots = PINNED_PAGE_SIZE / slot_size;
        let num_words = num_slots.div_ceil(64);
        let mut free_bits = vec![u64::MAX; num_words];
        let remainder = num_slots % 64;
        if remainder != 0 {
            free_bits[num_words - 1] = (1u64 << remainder) - 1;
        }
        self.slot_size = slot_size;
        self.num_slots = num_slots;
        self.free_bits = free_bits;
        self.live = 0;
    }

    fn release(&mut self) {
        self.slot_size = 0;
        self.num_slots = 0;
        self.free_bits.clear();
        self.live = 0;
    }

    #[inline]
    fn is_assigned(&self) -> bool {
        self.slot_size != 0
    }

    #[inline]
    fn is_free(&self, slot: usize) -> bool {
        self.free_bits[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    fn alloc(&mut self) -> Option<usize> {
        for (word_idx, word) in self.free_bits.iter_mut().enumerate() {
            if *word == 0 {
                continue;
            }
            let bit_idx = word.trailing_zeros() as usize;
            let slot = word_idx * 64 + bit_idx;
            if slot >= self.num_slots {
                return None;
            }
            *word &= !(1u64 << bit_idx);
            self.live += 1;
            return Some(self.start + slot * self.slot_size);
        }
        None
    }

    fn object_at(&self, addr: usize) -> Option<ObjectRef> {
        if !self.is_assigned() {
            return None;
        }
        let slot = (addr - self.start) / self.slot_size;
        if slot >= self.num_slots || self.is_free(slot) {
            return None;
        }
        ObjectRef::from_addr(self.start + slot * self.slot_size)
    }

    fn for_each_allocated(&self, f: &mut dyn FnMut(ObjectRef, usize)) {
        if !self.is_assigned() {
            return;
        }
        for slot in 0..self.num_slots {
            if self.is_free(slot) {
                continue;
            }
            if let Some(obj) = ObjectRef::from_addr(self.start + slot * self.slot_size) {
                f(obj, self.slot_size);
            }
        }
    }

    /// Free unmarked slots, unmark the rest. Returns reclaimed bytes.
    fn sweep(&mut self) -> usize {
        if !self.is_assigned() {
            return 0;
        }
        let mut reclaimed = 0;
        for slot in 0..self.num_slots {
            if self.is_free(slot) {
                continue;
            }
            let addr = self.start + slot * self.slot_size;
            let Some(obj) = ObjectRef::from_addr(addr) else {
                continue;
            };
            match obj.header_state() {
                HeaderState::Live(header) if header.is_marked() => {
                    obj.set_header(HeaderState::Live(header.with_marked(false).with_pinned(false)));
                }
                _ => {
                    zero_range(addr, addr + self.slot_size);
                    self.free_bits[slot / 64] |= 1u64 << (slot % 64);
                    self.live -= 1;
                    reclaimed += self.slot_size;
                }
            }
        }
        if self.live == 0 {
            self.release();
        }
        reclaimed
    }
}

/// A section-sized arena of pinned slots.
pub(crate) struct PinnedChunk {
    block: MemoryBlock,
    data_start: usize,
    pages: Vec<PinnedPage>,
}

impl PinnedChunk {
    pub(crate) fn new(chunk_size: usize, accounting: &Arc<HeapAccounting>) -> Self {
        let block = MemoryBlock::allocate(chunk_size, chunk_size, accounting);
        BlockHeader::init(&block, BlockRole::PinnedChunk);
        let data_start = block.start() + BLOCK_HEADER_SIZE;
        let page_count = (chunk_size - BLOCK_HEADER_SIZE) / PINNED_PAGE_SIZE;
        let pages = (0..page_count)
            .map(|i| PinnedPage::unassigned(data_start + i * PINNED_PAGE_SIZE))
            .collect();
        Self {
            block,
            data_start,
            pages,
        }
    }

    /// Base address (the block header).
    pub(crate) fn base(&self) -> usize {
        self.block.start()
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.block.contains(addr)
    }

    /// Allocate a slot of class `class`, assigning a page if needed.
    pub(crate) fn alloc(&mut self, class: usize) -> Option<usize> {
        let slot_size = SLOT_SIZES[class];
        for page in self.pages.iter_mut().filter(|p| p.slot_size == slot_size) {
            if let Some(addr) = page.alloc() {
                return Some(addr);
            }
        }
        let page = self.pages.iter_mut().find(|p| !p.is_assigned())?;
        page.assign(slot_size);
        page.alloc()
    }

    /// Allocated object whose slot contains `addr`.
    pub(crate) fn find_object(&self, addr: usize) -> Option<ObjectRef> {
        if addr < self.data_start {
            return None;
        }
        let page = self.pages.get((addr - self.data_start) / PINNED_PAGE_SIZE)?;
        page.object_at(addr)
    }

    /// Visit every allocated slot as `(object, slot_size)`.
    pub(crate) fn for_each_object(&self, mut f: impl FnMut(ObjectRef, usize)) {
        for page in &self.pages {
            page.for_each_allocated(&mut f);
        }
    }

    /// Return unmarked slots to the freelists. Returns reclaimed bytes.
    pub(crate) fn sweep(&mut self) -> usize {
        self.pages.iter_mut().map(PinnedPage::sweep).sum()
    }

    /// Bytes held by allocated slots.
    pub(crate) fn used_bytes(&self) -> usize {
        self.pages.iter().map(|p| p.live * p.slot_size).sum()
    }

    /// Committed size of the chunk.
    pub(crate) fn size(&self) -> usize {
        self.block.size()
    }
}
