//! Helpers shared by bump-allocated regions (the nursery and sections).

use crate::error::{FatalError, fatal};
use crate::memory::zero_range;
use crate::object::{ALLOC_ALIGN, HeaderState, ObjectModel, ObjectRef, align_size};

/// Granularity of the scan-start index.
pub const SCAN_START_SIZE: usize = 8 * 1024;

/// Free ranges smaller than this are not worth allocating into.
pub const FRAGMENT_MIN_SIZE: usize = 512;

/// A free, zeroed range inside a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub start: usize,
    pub end: usize,
}

impl Fragment {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Coarse address-to-object index.
///
/// Entry `i` holds the start of some object beginning in window `i`, or 0.
/// Every non-zero entry is a valid object start.
pub(crate) struct ScanStarts {
    base: usize,
    entries: Box<[usize]>,
}

impl ScanStarts {
    pub(crate) fn new(base: usize, len: usize) -> Self {
        Self {
            base,
            entries: vec![0; len.div_ceil(SCAN_START_SIZE)].into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn record(&mut self, obj: usize) {
        let index = (obj - self.base) / SCAN_START_SIZE;
        self.entries[index] = obj;
    }

    pub(crate) fn clear(&mut self) {
        self.entries.fill(0);
    }

    /// Nearest recorded object start at or before `addr`.
    pub(crate) fn search_start(&self, addr: usize) -> usize {
        let mut index = ((addr - self.base) / SCAN_START_SIZE).min(self.entries.len() - 1);
        loop {
            let start = self.entries[index];
            if start != 0 && start <= addr {
                return start;
            }
            if index == 0 {
                return self.base;
            }
            index -= 1;
        }
    }
}

/// Size of the live object at `obj`.
#[inline]
pub(crate) fn live_size(model: &dyn ObjectModel, obj: ObjectRef) -> usize {
    let size = align_size(model.object_size(obj, obj.live_header()));
    if size < ALLOC_ALIGN {
        fatal(FatalError::Invariant(format!("object {obj:?} reports size {size}")));
    }
    size
}

/// Walk `[from, limit)` and return the object containing `addr`.
///
/// `from` must be an object start or zeroed memory.
pub(crate) fn object_containing(
    model: &dyn ObjectModel,
    from: usize,
    limit: usize,
    addr: usize,
) -> Option<ObjectRef> {
    let mut cursor = from;
    while cursor <= addr && cursor < limit {
        let obj = ObjectRef::from_addr(cursor)?;
        match obj.header_state() {
            HeaderState::Empty => cursor += ALLOC_ALIGN,
            HeaderState::Live(_) => {
                let size = live_size(model, obj);
                if addr < cursor + size {
                    return Some(obj);
                }
                cursor += size;
            }
            HeaderState::Forwarded(_) => fatal(FatalError::Invariant(format!(
                "forwarded object {obj:?} found while resolving {addr:#x}"
            ))),
        }
    }
    None
}

/// Visit every live object in `[from, limit)` as `(object, size)`.
///
/// A forwarded header is skipped by the size of its copy.
pub(crate) fn for_each_object(
    model: &dyn ObjectModel,
    from: usize,
    limit: usize,
    mut f: impl FnMut(ObjectRef, usize),
) {
    let mut cursor = from;
    while cursor < limit {
        let Some(obj) = ObjectRef::from_addr(cursor) else {
            return;
        };
        match obj.header_state() {
            HeaderState::Empty => cursor += ALLOC_ALIGN,
            HeaderState::Live(_) => {
                let size = live_size(model, obj);
                f(obj, size);
                cursor += size;
            }
            HeaderState::Forwarded(to) => {
                // the copy carries the same size
                let size = live_size(model, to);
                cursor += size;
            }
        }
    }
}

/// Zero `[start, end)` and return it as a fragment when big enough.
pub(crate) fn make_fragment(start: usize, end: usize) -> Option<Fragment> {
    zero_range(start, end);
    (end.saturating_sub(start) >= FRAGMENT_MIN_SIZE).then_some(Fragment { start, end })
}

#[cfg(test)]
pub(crate) mod test_model {
    use crate::object::{Descriptor, LiveHeader, ObjectModel, ObjectRef};

    /// Shape id is the object size in words; word 1 onward are references
    /// when the shape is odd.
    pub(crate) struct WordsModel;

    impl ObjectModel for WordsModel {
        fn object_size(&self, _obj: ObjectRef, header: LiveHeader) -> usize {
            header.shape() as usize * 8
        }

        fn descriptor(&self, _obj: ObjectRef, header: LiveHeader) -> Descriptor {
            if header.shape() % 2 == 1 {
                Descriptor::RefArray { first_slot: 1 }
            } else {
                Descriptor::NoPointers
            }
        }
    }
}
