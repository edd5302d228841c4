//! Card table for generational write barriers.
//!
//! One byte per card. A card is marked when a reference to a nursery object
//! is stored into a slot outside the nursery; the next minor collection
//! rescans objects overlapping marked cards and clears them.
//!
//! The table is indexed by `(addr >> card_bits) & mask`, so it covers every
//! address the system allocator can hand back without reserving a heap
//! range up front. Two addresses a multiple of the table span apart share a
//! card: aliasing can only add false positives.

use std::sync::atomic::{AtomicU8, Ordering};

/// Default log2 card size (512-byte cards).
pub const DEFAULT_CARD_BITS: u32 = 9;

/// Card state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    /// No old-to-young store since the last scan
    Clean = 0,
    /// May cover an old-to-young reference
    Dirty = 1,
}

/// Byte-per-card dirty map.
pub struct CardTable {
    cards: Box<[AtomicU8]>,
    card_bits: u32,
    mask: usize,
}

impl CardTable {
    /// Table of `1 << card_count_bits` cards of `1 << card_bits` bytes.
    pub fn new(card_bits: u32, card_count_bits: u32) -> Self {
        let count = 1usize << card_count_bits;
        Self {
            cards: (0..count).map(|_| AtomicU8::new(CardState::Clean as u8)).collect(),
            card_bits,
            mask: count - 1,
        }
    }

    /// Bytes covered by one card.
    #[inline]
    pub fn card_size(&self) -> usize {
        1 << self.card_bits
    }

    /// Number of cards.
    #[inline]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Always false; a table has at least one card.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    #[inline]
    fn card(&self, addr: usize) -> &AtomicU8 {
        &self.cards[(addr >> self.card_bits) & self.mask]
    }

    /// Start of the card containing `addr`.
    #[inline]
    pub fn align_down(&self, addr: usize) -> usize {
        addr & !(self.card_size() - 1)
    }

    /// Mark the card covering `addr`.
    ///
    /// A plain byte store: concurrent marks are idempotent.
    #[inline]
    pub fn mark(&self, addr: usize) {
        self.card(addr).store(CardState::Dirty as u8, Ordering::Relaxed);
    }

    /// Mark every card overlapping `[start, end)`.
    pub fn mark_range(&self, start: usize, end: usize) {
        let mut card = self.align_down(start);
        while card < end {
            self.mark(card);
            card += self.card_size();
        }
    }

    /// Is the card covering `addr` marked?
    #[inline]
    pub fn is_marked(&self, addr: usize) -> bool {
        self.card(addr).load(Ordering::Relaxed) != CardState::Clean as u8
    }

    /// Is any card overlapping `[start, end)` marked?
    pub fn is_region_marked(&self, start: usize, end: usize) -> bool {
        let mut card = self.align_down(start);
        while card < end {
            if self.is_marked(card) {
                return true;
            }
            card += self.card_size();
        }
        false
    }

    /// Clear every card overlapping `[start, end)`.
    pub fn reset_region(&self, start: usize, end: usize) {
        let mut card = self.align_down(start);
        while card < end {
            self.card(card).store(CardState::Clean as u8, Ordering::Relaxed);
            card += self.card_size();
        }
    }

    /// Clear the whole table.
    pub fn clear(&self) {
        for card in self.cards.iter() {
            card.store(CardState::Clean as u8, Ordering::Relaxed);
        }
    }

    /// Number of marked cards.
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|card| card.load(Ordering::Relaxed) != CardState::Clean as u8)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mark_and_query() {
        let table = CardTable::new(DEFAULT_CARD_BITS, 12);
        assert_eq!(table.card_size(), 512);
        assert_eq!(table.len(), 4096);

        table.mark(0x10_0000 + 700);
        assert!(table.is_marked(0x10_0000 + 512));
        assert!(table.is_marked(0x10_0000 + 1023));
        assert!(!table.is_marked(0x10_0000 + 1024));
        assert!(!table.is_marked(0x10_0000));
        assert_eq!(table.dirty_count(), 1);
    }

    #[test]
    fn test_region_queries() {
        let table = CardTable::new(DEFAULT_CARD_BITS, 12);
        let base = 0x40_0000;
        table.mark(base + 3000);

        assert!(table.is_region_marked(base, base + 4096));
        assert!(table.is_region_marked(base + 2600, base + 2700));
        assert!(!table.is_region_marked(base, base + 2048));
        // empty region
        assert!(!table.is_region_marked(base + 3000, base + 3000));

        table.reset_region(base + 2600, base + 2601);
        assert!(!table.is_region_marked(base, base + 4096));
    }

    #[test]
    fn test_mark_range_and_clear() {
        let table = CardTable::new(DEFAULT_CARD_BITS, 12);
        table.mark_range(0x8000 + 100, 0x8000 + 1500);
        assert_eq!(table.dirty_count(), 3);
        table.clear();
        assert_eq!(table.dirty_count(), 0);
    }

    #[test]
    fn test_aliasing_is_a_false_positive() {
        let table = CardTable::new(DEFAULT_CARD_BITS, 8);
        let span = table.len() * table.card_size();
        table.mark(0x1000);
        assert!(table.is_marked(0x1000 + span));
    }

    #[test]
    fn test_concurrent_marks() {
        let table = Arc::new(CardTable::new(DEFAULT_CARD_BITS, 12));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..256 {
                        table.mark((i * 2 + (t % 2)) * 512);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.dirty_count(), 512);
    }
}
