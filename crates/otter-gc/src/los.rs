//! Large object space.
//!
//! Objects above the large-object threshold get their own page-rounded
//! block, are never copied, and are kept in an address-ordered map so
//! ambiguous roots pointing anywhere inside one can be resolved. The mark
//! bit in the header is the "still referenced" flag a major collection
//! sweeps by.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::memory::{HeapAccounting, MemoryBlock};
use crate::object::{HeaderState, LiveHeader, ObjectRef};

/// LOS allocations are rounded up to this.
pub const LOS_PAGE_SIZE: usize = 4096;

struct LargeObject {
    block: MemoryBlock,
    size: usize,
}

/// Result of a LOS sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LosSweep {
    pub freed_objects: usize,
    pub freed_bytes: usize,
}

pub(crate) struct LargeObjectSpace {
    objects: BTreeMap<usize, LargeObject>,
    memory_usage: usize,
    next_collection: usize,
    collection_target: usize,
}

impl LargeObjectSpace {
    pub(crate) fn new(collection_target: usize) -> Self {
        Self {
            objects: BTreeMap::new(),
            memory_usage: 0,
            next_collection: collection_target,
            collection_target,
        }
    }

    /// Allocate a zeroed object of `size` bytes with `header` installed.
    pub(crate) fn alloc(
        &mut self,
        size: usize,
        header: LiveHeader,
        accounting: &Arc<HeapAccounting>,
    ) -> ObjectRef {
        let alloc_size = size.next_multiple_of(LOS_PAGE_SIZE);
        let block = MemoryBlock::allocate(alloc_size, LOS_PAGE_SIZE, accounting);
        let addr = block.start();
        self.memory_usage += alloc_size;
        self.objects.insert(addr, LargeObject { block, size });
        let obj = ObjectRef::from_addr(addr)
            .unwrap_or_else(|| unreachable!("MemoryBlock start is non-null"));
        obj.set_header(HeaderState::Live(header));
        obj
    }

    /// Object containing `addr`, interior pointers included.
    pub(crate) fn find_object(&self, addr: usize) -> Option<ObjectRef> {
        let (&start, object) = self.objects.range(..=addr).next_back()?;
        if addr < start + object.size {
            ObjectRef::from_addr(start)
        } else {
            None
        }
    }

    #[cfg(test)]
    /// Is `obj` exactly the start of a large object?
    pub(crate) fn contains_object(&self, obj: ObjectRef) -> bool {
        self.objects.contains_key(&obj.addr())
    }

    /// Visit every object as `(object, size)`.
    pub(crate) fn for_each_object(&self, mut f: impl FnMut(ObjectRef, usize)) {
        for (&start, object) in &self.objects {
            if let Some(obj) = ObjectRef::from_addr(start) {
                f(obj, object.size);
            }
        }
    }

    /// Free unmarked objects and unmark survivors.
    pub(crate) fn sweep(&mut self) -> LosSweep {
        let mut result = LosSweep::default();
        let mut freed_bytes = 0;
        self.objects.retain(|&start, object| {
            let Some(obj) = ObjectRef::from_addr(start) else {
                return false;
            };
            match obj.header_state() {
                HeaderState::Live(header) if header.is_marked() => {
                    obj.set_header(HeaderState::Live(header.with_marked(false).with_pinned(false)));
                    true
                }
                _ => {
                    result.freed_objects += 1;
                    freed_bytes += object.block.size();
                    false
                }
            }
        });
        result.freed_bytes = freed_bytes;
        self.memory_usage -= freed_bytes;
        result
    }

    /// LOS growth since the last major collection passed the target.
    pub(crate) fn needs_collection(&self) -> bool {
        self.memory_usage > self.next_collection
    }

    /// Re-arm the trigger after a major collection.
    pub(crate) fn reset_trigger(&mut self) {
        self.next_collection = self.memory_usage + self.collection_target;
    }

    /// Page-rounded bytes held by large objects.
    pub(crate) fn memory_usage(&self) -> usize {
        self.memory_usage
    }

    pub(crate) fn len(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn los(target: usize) -> (LargeObjectSpace, Arc<HeapAccounting>) {
        (LargeObjectSpace::new(target), Arc::new(HeapAccounting::new(None, None)))
    }

    #[test]
    fn test_alloc_rounds_to_pages() {
        let (mut los, acc) = los(1 << 20);
        let obj = los.alloc(10_000, LiveHeader::new(4), &acc);
        assert_eq!(obj.addr() % LOS_PAGE_SIZE, 0);
        assert_eq!(los.memory_usage(), 12_288);
        assert_eq!(acc.committed(), 12_288);
        assert_eq!(obj.live_header().shape(), 4);
        assert_eq!(los.len(), 1);
    }

    #[test]
    fn test_find_object_interior() {
        let (mut los, acc) = los(1 << 20);
        let obj = los.alloc(9000, LiveHeader::new(1), &acc);
        assert_eq!(los.find_object(obj.addr()), Some(obj));
        assert_eq!(los.find_object(obj.addr() + 8999), Some(obj));
        // past the object but inside its page rounding
        assert_eq!(los.find_object(obj.addr() + 9000), None);
        assert!(los.contains_object(obj));
    }

    #[test]
    fn test_sweep_keeps_marked() {
        let (mut los, acc) = los(1 << 20);
        let keep = los.alloc(9000, LiveHeader::new(1), &acc);
        let _drop = los.alloc(20_000, LiveHeader::new(1), &acc);
        assert!(keep.try_mark());

        let result = los.sweep();
        assert_eq!(result.freed_objects, 1);
        assert_eq!(result.freed_bytes, 20_480);
        assert_eq!(los.len(), 1);
        assert_eq!(los.memory_usage(), 12_288);
        assert_eq!(acc.committed(), 12_288);
        assert!(!keep.live_header().is_marked());
    }

    #[test]
    fn test_collection_trigger() {
        let (mut los, acc) = los(16 * 1024);
        los.alloc(9000, LiveHeader::new(1), &acc);
        assert!(!los.needs_collection());
        los.alloc(9000, LiveHeader::new(1), &acc);
        assert!(los.needs_collection());
        los.reset_trigger();
        assert!(!los.needs_collection());
    }
}
