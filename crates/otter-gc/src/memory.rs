//! Aligned heap memory and committed-byte accounting.
//!
//! Every region the collector owns (nursery, sections, pinned chunks, large
//! objects) is one `MemoryBlock`. Blocks come from `std::alloc` with the
//! requested alignment and are handed out zeroed. Sections and pinned chunks
//! are aligned to their own size and start with a [`BlockHeader`], so the
//! block owning any interior address is found by masking.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::error::{FatalError, OomCallback, fatal};

/// Bytes reserved at the start of sections and pinned chunks.
pub(crate) const BLOCK_HEADER_SIZE: usize = 64;

/// Committed heap bytes with an optional hard limit.
pub(crate) struct HeapAccounting {
    committed: AtomicUsize,
    peak: AtomicUsize,
    limit: Option<usize>,
    oom_callback: Option<OomCallback>,
}

impl HeapAccounting {
    pub(crate) fn new(limit: Option<usize>, oom_callback: Option<OomCallback>) -> Self {
        Self {
            committed: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
            oom_callback,
        }
    }

    /// Bytes currently committed.
    pub(crate) fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    /// Highest committed value seen.
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    fn reserve(&self, bytes: usize) {
        let now = self.committed.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if let Some(limit) = self.limit {
            if now > limit {
                self.committed.fetch_sub(bytes, Ordering::Relaxed);
                self.out_of_memory(FatalError::HeapLimit {
                    limit,
                    requested: bytes,
                });
            }
        }
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    fn release(&self, bytes: usize) {
        self.committed.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Run the OOM callback, then abort.
    pub(crate) fn out_of_memory(&self, error: FatalError) -> ! {
        if let Some(callback) = &self.oom_callback {
            callback.invoke(&error);
        }
        fatal(error)
    }
}

/// An owned, zero-initialised, aligned block of heap memory.
pub(crate) struct MemoryBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    accounting: Arc<HeapAccounting>,
}

// SAFETY: MemoryBlock owns its allocation exclusively. Concurrent access to
// the bytes inside is coordinated by the collector (stop-the-world plus
// atomic header updates during parallel tracing).
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    /// Allocate `size` zeroed bytes aligned to `align`. Aborts on failure.
    pub(crate) fn allocate(size: usize, align: usize, accounting: &Arc<HeapAccounting>) -> Self {
        let layout = match Layout::from_size_align(size, align) {
            Ok(layout) if size > 0 => layout,
            _ => fatal(FatalError::Invariant(format!(
                "invalid block layout: size {size}, align {align}"
            ))),
        };
        accounting.reserve(size);
        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            accounting.release(size);
            accounting.out_of_memory(FatalError::OutOfMemory {
                requested: size,
                committed: accounting.committed(),
            });
        };
        Self {
            ptr,
            layout,
            accounting: accounting.clone(),
        }
    }

    #[inline]
    pub(crate) fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.start() + self.layout.size()
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        self.accounting.release(self.layout.size());
    }
}

/// Zero `[start, end)`.
#[inline]
pub(crate) fn zero_range(start: usize, end: usize) {
    if end > start {
        // SAFETY: callers pass ranges inside blocks they own
        unsafe { std::ptr::write_bytes(start as *mut u8, 0, end - start) };
    }
}

/// What a size-aligned block is used for.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockRole {
    Section = 1,
    PinnedChunk = 2,
}

/// Metadata at the start of every section and pinned chunk.
///
/// Workers read it to classify a reference without consulting the heap's
/// section list, which is not shared with them.
#[repr(C)]
pub(crate) struct BlockHeader {
    role: AtomicU8,
    to_space: AtomicBool,
}

impl BlockHeader {
    pub(crate) fn init(block: &MemoryBlock, role: BlockRole) -> &BlockHeader {
        // SAFETY: the block is at least BLOCK_HEADER_SIZE bytes, aligned and
        // zeroed, which is a valid BlockHeader bit pattern.
        let header = unsafe { &*(block.start() as *const BlockHeader) };
        header.role.store(role as u8, Ordering::Relaxed);
        header.to_space.store(false, Ordering::Relaxed);
        header
    }

    /// Header of the block containing `addr`.
    ///
    /// # Safety
    /// `addr` must lie inside a live section or pinned chunk whose size is
    /// `block_mask + 1`.
    #[inline]
    pub(crate) unsafe fn of<'a>(addr: usize, block_mask: usize) -> &'a BlockHeader {
        // SAFETY: guaranteed by the caller
        unsafe { &*((addr & !block_mask) as *const BlockHeader) }
    }

    #[inline]
    pub(crate) fn role(&self) -> BlockRole {
        match self.role.load(Ordering::Relaxed) {
            1 => BlockRole::Section,
            2 => BlockRole::PinnedChunk,
            other => fatal(FatalError::Invariant(format!("bad block role {other}"))),
        }
    }

    #[inline]
    pub(crate) fn is_to_space(&self) -> bool {
        self.to_space.load(Ordering::Acquire)
    }

    pub(crate) fn set_to_space(&self, value: bool) {
        self.to_space.store(value, Ordering::Release);
    }
}
