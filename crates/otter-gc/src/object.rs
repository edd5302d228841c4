//! Object references, the GC header word and the object-model interface.
//!
//! Word 0 of every managed object is the GC header, a small tagged union:
//!
//! ```text
//! 0                               Empty      free, zeroed memory
//! [shape:32][....][M][P][01]      Live       shape id, pinned, marked
//! [new address       ][10]        Forwarded  object was copied away
//! ```
//!
//! Free memory is always zeroed, so every heap region can be walked object
//! by object: a zero word is skipped by [`ALLOC_ALIGN`], a live header by the
//! object's size.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("otter-gc requires a 64-bit target");

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{FatalError, fatal};

/// Size of a machine word.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();
/// Size of the GC header.
pub const HEADER_SIZE: usize = WORD_SIZE;
/// Allocation granularity; every object size is rounded up to it.
pub const ALLOC_ALIGN: usize = 8;

const TAG_MASK: usize = 0b11;
const TAG_LIVE: usize = 0b01;
const TAG_FORWARDED: usize = 0b10;
const PINNED_BIT: usize = 1 << 2;
const MARKED_BIT: usize = 1 << 3;
const SHAPE_SHIFT: u32 = 32;

/// Round `size` up to [`ALLOC_ALIGN`].
#[inline]
pub const fn align_size(size: usize) -> usize {
    (size + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1)
}

/// Header of an object that has not been copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiveHeader {
    shape: u32,
    pinned: bool,
    marked: bool,
}

impl LiveHeader {
    /// Header for a freshly allocated object of the given shape.
    pub const fn new(shape: u32) -> Self {
        Self {
            shape,
            pinned: false,
            marked: false,
        }
    }

    /// Shape id assigned by the object model at allocation.
    #[inline]
    pub fn shape(self) -> u32 {
        self.shape
    }

    /// Pinned by an ambiguous root for the current cycle.
    #[inline]
    pub fn is_pinned(self) -> bool {
        self.pinned
    }

    /// Marked live in place (LOS and pinned-chunk objects).
    #[inline]
    pub fn is_marked(self) -> bool {
        self.marked
    }

    pub(crate) fn with_pinned(self, pinned: bool) -> Self {
        Self { pinned, ..self }
    }

    pub(crate) fn with_marked(self, marked: bool) -> Self {
        Self { marked, ..self }
    }

    fn encode(self) -> usize {
        let mut word = TAG_LIVE | ((self.shape as usize) << SHAPE_SHIFT);
        if self.pinned {
            word |= PINNED_BIT;
        }
        if self.marked {
            word |= MARKED_BIT;
        }
        word
    }
}

/// Decoded GC header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// No object starts here.
    Empty,
    /// A live (or not yet traced) object.
    Live(LiveHeader),
    /// The object was evacuated; the payload is its new location.
    Forwarded(ObjectRef),
}

impl HeaderState {
    /// Decode a raw header word. Aborts on a malformed word.
    pub fn decode(word: usize) -> Self {
        if word == 0 {
            return HeaderState::Empty;
        }
        match word & TAG_MASK {
            TAG_LIVE => HeaderState::Live(LiveHeader {
                shape: (word >> SHAPE_SHIFT) as u32,
                pinned: word & PINNED_BIT != 0,
                marked: word & MARKED_BIT != 0,
            }),
            TAG_FORWARDED => match ObjectRef::from_addr(word & !TAG_MASK) {
                Some(to) => HeaderState::Forwarded(to),
                None => fatal(FatalError::Invariant(format!("forwarding to null: {word:#x}"))),
            },
            _ => fatal(FatalError::Invariant(format!("corrupt object header {word:#x}"))),
        }
    }

    /// Encode into a header word.
    pub fn encode(self) -> usize {
        match self {
            HeaderState::Empty => 0,
            HeaderState::Live(header) => header.encode(),
            HeaderState::Forwarded(to) => to.addr() | TAG_FORWARDED,
        }
    }
}

/// Address of a managed object (its header word).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjectRef(NonZeroUsize);

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

impl ObjectRef {
    /// Wrap a non-null address.
    #[inline]
    pub fn from_addr(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// Raw address.
    #[inline]
    pub fn addr(self) -> usize {
        self.0.get()
    }

    /// Slot holding word `index` of this object.
    #[inline]
    pub fn slot(self, index: usize) -> Slot {
        Slot(self.addr() + index * WORD_SIZE)
    }

    /// Decode this object's header.
    ///
    /// # Safety
    /// The object must lie in memory owned by a live collector.
    pub unsafe fn header(self) -> HeaderState {
        HeaderState::decode(self.header_cell().load(Ordering::Acquire))
    }

    /// Read word `index` of this object.
    ///
    /// # Safety
    /// The object must be live and `index` within its size.
    pub unsafe fn read_word(self, index: usize) -> usize {
        // SAFETY: guaranteed by the caller
        unsafe { std::ptr::read((self.addr() + index * WORD_SIZE) as *const usize) }
    }

    /// Write word `index` of this object without a barrier.
    ///
    /// # Safety
    /// The object must be live and `index` within its size. Reference
    /// stores must go through the [`WriteBarrier`](crate::WriteBarrier).
    pub unsafe fn write_word(self, index: usize, value: usize) {
        // SAFETY: guaranteed by the caller
        unsafe { std::ptr::write((self.addr() + index * WORD_SIZE) as *mut usize, value) }
    }

    /// The header word as an atomic.
    ///
    /// Collector-internal: every `ObjectRef` the collector handles points
    /// at a header inside a region it owns.
    #[inline]
    pub(crate) fn header_cell<'a>(self) -> &'a AtomicUsize {
        // SAFETY: headers are word aligned and live inside collector-owned
        // memory for as long as the object is reachable from the collector.
        unsafe { &*(self.addr() as *const AtomicUsize) }
    }

    #[inline]
    pub(crate) fn header_state(self) -> HeaderState {
        HeaderState::decode(self.header_cell().load(Ordering::Acquire))
    }

    pub(crate) fn set_header(self, state: HeaderState) {
        self.header_cell().store(state.encode(), Ordering::Release);
    }

    /// Live header or abort.
    pub(crate) fn live_header(self) -> LiveHeader {
        match self.header_state() {
            HeaderState::Live(header) => header,
            other => fatal(FatalError::Invariant(format!(
                "expected live object at {self:?}, found {other:?}"
            ))),
        }
    }

    /// Set the in-place mark bit. Returns `true` when this call set it.
    pub(crate) fn try_mark(self) -> bool {
        let cell = self.header_cell();
        let mut word = cell.load(Ordering::Acquire);
        loop {
            let header = match HeaderState::decode(word) {
                HeaderState::Live(header) => header,
                other => fatal(FatalError::Invariant(format!(
                    "marking non-live object {self:?}: {other:?}"
                ))),
            };
            if header.is_marked() {
                return false;
            }
            let marked = header.with_marked(true).encode();
            match cell.compare_exchange_weak(word, marked, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }
}

/// Address of a word that may hold an object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Slot(usize);

impl Slot {
    /// Slot at a raw pointer. Dereferencing happens only during collection.
    #[inline]
    pub fn from_ptr(ptr: *mut usize) -> Self {
        Self(ptr as usize)
    }

    /// Raw address of the slot.
    #[inline]
    pub fn addr(self) -> usize {
        self.0
    }

    /// Read the slot.
    ///
    /// # Safety
    /// The slot must be valid for reads.
    #[inline]
    pub unsafe fn load(self) -> usize {
        // SAFETY: guaranteed by the caller
        unsafe { std::ptr::read(self.0 as *const usize) }
    }

    /// Write the slot.
    ///
    /// # Safety
    /// The slot must be valid for writes.
    #[inline]
    pub unsafe fn store(self, value: usize) {
        // SAFETY: guaranteed by the caller
        unsafe { std::ptr::write(self.0 as *mut usize, value) }
    }

    /// Read the slot as an object reference.
    ///
    /// # Safety
    /// The slot must be valid for reads.
    #[inline]
    pub unsafe fn load_ref(self) -> Option<ObjectRef> {
        // SAFETY: guaranteed by the caller
        ObjectRef::from_addr(unsafe { self.load() })
    }
}

/// Where an object keeps its references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// No reference fields.
    NoPointers,
    /// Bit `i` set means word `i` holds a reference. Bit 0 (the header)
    /// must be clear.
    Bitmap(u64),
    /// Every word from `first_slot` to the end of the object is a reference.
    RefArray {
        /// Index of the first reference word
        first_slot: usize,
    },
}

impl Descriptor {
    /// Visit every reference slot of an object of `size` bytes.
    pub fn for_each_slot(self, obj: ObjectRef, size: usize, mut visit: impl FnMut(Slot)) {
        match self {
            Descriptor::NoPointers => {}
            Descriptor::Bitmap(bits) => {
                let words = size / WORD_SIZE;
                let mut bits = bits & !1;
                while bits != 0 {
                    let index = bits.trailing_zeros() as usize;
                    if index >= words {
                        break;
                    }
                    visit(obj.slot(index));
                    bits &= bits - 1;
                }
            }
            Descriptor::RefArray { first_slot } => {
                for index in first_slot.max(1)..size / WORD_SIZE {
                    visit(obj.slot(index));
                }
            }
        }
    }
}

/// The runtime's object layout, consumed by the scanner.
///
/// Both methods receive the decoded live header so an implementation never
/// reads the header word itself (it may be changing under a parallel copy).
/// Anything else, such as an array length, is read from the object body.
pub trait ObjectModel: Send + Sync {
    /// Total object size in bytes, header included.
    fn object_size(&self, obj: ObjectRef, header: LiveHeader) -> usize;

    /// Reference layout of the object.
    fn descriptor(&self, obj: ObjectRef, header: LiveHeader) -> Descriptor;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_size() {
        assert_eq!(align_size(1), 8);
        assert_eq!(align_size(8), 8);
        assert_eq!(align_size(13), 16);
    }

    #[test]
    fn test_header_encoding() {
        assert_eq!(HeaderState::decode(0), HeaderState::Empty);

        let header = LiveHeader::new(0xdead_beef).with_pinned(true);
        let word = HeaderState::Live(header).encode();
        assert_ne!(word, 0);
        match HeaderState::decode(word) {
            HeaderState::Live(h) => {
                assert_eq!(h.shape(), 0xdead_beef);
                assert!(h.is_pinned());
                assert!(!h.is_marked());
            }
            other => panic!("unexpected {other:?}"),
        }

        let target = ObjectRef::from_addr(0x1000).unwrap();
        let word = HeaderState::Forwarded(target).encode();
        assert_eq!(HeaderState::decode(word), HeaderState::Forwarded(target));
    }

    #[test]
    fn test_shape_zero_is_not_empty() {
        let word = HeaderState::Live(LiveHeader::new(0)).encode();
        assert_eq!(HeaderState::decode(word), HeaderState::Live(LiveHeader::new(0)));
    }

    #[test]
    fn test_try_mark() {
        let mut cell = [HeaderState::Live(LiveHeader::new(3)).encode(), 0usize];
        let obj = ObjectRef::from_addr(cell.as_mut_ptr() as usize).unwrap();
        assert!(obj.try_mark());
        assert!(!obj.try_mark());
        assert!(obj.live_header().is_marked());
        assert_eq!(obj.live_header().shape(), 3);
    }

    #[test]
    fn test_descriptor_slots() {
        let obj = ObjectRef::from_addr(0x1000).unwrap();

        let mut seen = Vec::new();
        Descriptor::Bitmap(0b1011).for_each_slot(obj, 32, |s| seen.push(s.addr()));
        // bit 0 is the header and never visited
        assert_eq!(seen, vec![0x1008, 0x1018]);

        seen.clear();
        Descriptor::RefArray { first_slot: 2 }.for_each_slot(obj, 40, |s| seen.push(s.addr()));
        assert_eq!(seen, vec![0x1010, 0x1018, 0x1020]);

        seen.clear();
        Descriptor::NoPointers.for_each_slot(obj, 64, |s| seen.push(s.addr()));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_bitmap_ignores_bits_past_size() {
        let obj = ObjectRef::from_addr(0x2000).unwrap();
        let mut count = 0;
        Descriptor::Bitmap(0b1_0000_0010).for_each_slot(obj, 16, |_| count += 1);
        assert_eq!(count, 1);
    }
}
