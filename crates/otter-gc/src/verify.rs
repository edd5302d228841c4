//! Heap consistency checker.
//!
//! Walks every object outside a collection and checks that:
//! - no header is forwarded or still carries a pin or mark bit,
//! - every reference slot points at the start of a live object,
//! - every old-to-nursery reference is covered by a dirty card,
//! - no section is still flagged as to-space.

use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::card_table::CardTable;
use crate::major::MajorHeap;
use crate::nursery::Nursery;
use crate::object::{ObjectModel, ObjectRef};

/// The first inconsistency found by the heap checker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapCorruption {
    /// An object still carries a per-cycle flag.
    #[error("object {object:#x} is still {flag} outside a collection")]
    StaleFlag {
        /// Object address
        object: usize,
        /// `pinned` or `marked`
        flag: &'static str,
    },
    /// A reference slot does not point at an object start.
    #[error("slot {slot:#x} of object {object:#x} refers to {target:#x}, which is not a live object")]
    DanglingReference {
        /// Object holding the slot
        object: usize,
        /// Slot address
        slot: usize,
        /// Referenced address
        target: usize,
    },
    /// An old object refers into the nursery without a dirty card.
    #[error("slot {slot:#x} of old object {object:#x} refers to nursery object {target:#x} but its card is clean")]
    MissingCard {
        /// Object holding the slot
        object: usize,
        /// Slot address
        slot: usize,
        /// Referenced nursery address
        target: usize,
    },
    /// A section kept its to-space flag after a collection.
    #[error("section {section:#x} is still flagged as to-space")]
    ToSpaceLeft {
        /// Section base
        section: usize,
    },
}

/// What a successful check covered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    /// Objects walked
    pub objects: usize,
    /// Non-null references checked
    pub references: usize,
}

pub(crate) fn check_heap(
    model: &dyn ObjectModel,
    nursery: &Nursery,
    major: &MajorHeap,
    cards: &CardTable,
) -> Result<VerifyReport, HeapCorruption> {
    for section in major.sections() {
        if section.header().is_to_space() {
            return Err(HeapCorruption::ToSpaceLeft {
                section: section.base(),
            });
        }
    }

    let mut objects: Vec<(ObjectRef, usize)> = Vec::new();
    nursery.for_each_object(model, |obj, size| objects.push((obj, size)));
    major.for_each_object(model, |obj, size| objects.push((obj, size)));
    let starts: FxHashSet<usize> = objects.iter().map(|(obj, _)| obj.addr()).collect();

    let mut report = VerifyReport {
        objects: objects.len(),
        references: 0,
    };
    for &(obj, size) in &objects {
        let header = obj.live_header();
        if header.is_pinned() {
            return Err(HeapCorruption::StaleFlag {
                object: obj.addr(),
                flag: "pinned",
            });
        }
        if header.is_marked() {
            return Err(HeapCorruption::StaleFlag {
                object: obj.addr(),
                flag: "marked",
            });
        }

        let old_object = !nursery.contains(obj.addr());
        let mut failure = None;
        model.descriptor(obj, header).for_each_slot(obj, size, |slot| {
            if failure.is_some() {
                return;
            }
            // SAFETY: descriptor slots lie inside a live object
            let target = unsafe { slot.load() };
            if target == 0 {
                return;
            }
            report.references += 1;
            if !starts.contains(&target) {
                failure = Some(HeapCorruption::DanglingReference {
                    object: obj.addr(),
                    slot: slot.addr(),
                    target,
                });
            } else if old_object && nursery.contains(target) && !cards.is_marked(slot.addr()) {
                failure = Some(HeapCorruption::MissingCard {
                    object: obj.addr(),
                    slot: slot.addr(),
                    target,
                });
            }
        });
        if let Some(error) = failure {
            return Err(error);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapAccounting;
    use crate::object::LiveHeader;
    use crate::region::test_model::WordsModel;
    use std::sync::Arc;

    struct Heap {
        nursery: Nursery,
        major: MajorHeap,
        cards: CardTable,
    }

    fn heap() -> Heap {
        let accounting = Arc::new(HeapAccounting::new(None, None));
        Heap {
            nursery: Nursery::new(64 * 1024, &accounting),
            major: MajorHeap::new(64 * 1024, 64 * 1024, 8192, 1 << 20, accounting),
            cards: CardTable::new(9, 20),
        }
    }

    impl Heap {
        fn check(&self) -> Result<VerifyReport, HeapCorruption> {
            check_heap(&WordsModel, &self.nursery, &self.major, &self.cards)
        }
    }

    #[test]
    fn test_consistent_heap() {
        let mut h = heap();
        let young = h.nursery.alloc(24, LiveHeader::new(3)).unwrap();
        let old = h.major.alloc_small(24, LiveHeader::new(3));
        unsafe { young.write_word(1, old.addr()) };
        unsafe { old.write_word(1, young.addr()) };
        h.cards.mark(old.slot(1).addr());
        let report = h.check().unwrap();
        assert_eq!(report.objects, 2);
        assert_eq!(report.references, 2);
    }

    #[test]
    fn test_missing_card() {
        let mut h = heap();
        let young = h.nursery.alloc(24, LiveHeader::new(3)).unwrap();
        let old = h.major.alloc_small(24, LiveHeader::new(3));
        unsafe { old.write_word(2, young.addr()) };
        assert!(matches!(h.check(), Err(HeapCorruption::MissingCard { .. })));
    }

    #[test]
    fn test_dangling_interior_reference() {
        let mut h = heap();
        let a = h.nursery.alloc(24, LiveHeader::new(3)).unwrap();
        let b = h.nursery.alloc(24, LiveHeader::new(3)).unwrap();
        unsafe { a.write_word(1, b.addr() + 8) };
        let err = h.check().unwrap_err();
        assert_eq!(
            err,
            HeapCorruption::DanglingReference {
                object: a.addr(),
                slot: a.slot(1).addr(),
                target: b.addr() + 8,
            }
        );
    }

    #[test]
    fn test_stale_mark() {
        let mut h = heap();
        let slot = h.major.alloc_pinned(32, LiveHeader::new(4));
        assert!(slot.try_mark());
        assert!(matches!(h.check(), Err(HeapCorruption::StaleFlag { flag: "marked", .. })));
    }
}
