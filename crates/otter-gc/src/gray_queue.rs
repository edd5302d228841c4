//! Segmented gray queue.
//!
//! Objects that are live but not yet scanned sit in fixed-capacity
//! segments. A thread pushes and pops within its own queue without
//! synchronisation; whole segments move between threads through the
//! worker ring, so sharing cost does not depend on object fan-out.

use std::collections::VecDeque;

use crate::object::ObjectRef;

/// Objects per segment.
pub const GRAY_SECTION_SIZE: usize = 125;

/// Cached empty segments kept across cycles.
pub const GRAY_QUEUE_LENGTH_LIMIT: usize = 64;

/// Fixed-capacity block of gray objects.
#[derive(Debug)]
pub struct GraySection {
    len: usize,
    objects: [usize; GRAY_SECTION_SIZE],
}

impl GraySection {
    /// Empty boxed segment
    pub fn new() -> Box<Self> {
        Box::new(Self {
            len: 0,
            objects: [0; GRAY_SECTION_SIZE],
        })
    }

    /// Number of objects
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if full
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == GRAY_SECTION_SIZE
    }

    #[inline]
    fn push(&mut self, obj: ObjectRef) {
        self.objects[self.len] = obj.addr();
        self.len += 1;
    }

    #[inline]
    fn pop(&mut self) -> Option<ObjectRef> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        ObjectRef::from_addr(self.objects[self.len])
    }
}

/// Per-thread queue of gray segments.
///
/// The back segment is the active one; full segments accumulate in front of
/// it and are the ones given away.
pub struct GrayQueue {
    sections: VecDeque<Box<GraySection>>,
    free_list: Vec<Box<GraySection>>,
}

impl GrayQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self {
            sections: VecDeque::new(),
            free_list: Vec::new(),
        }
    }

    fn fresh_section(&mut self) -> Box<GraySection> {
        self.free_list.pop().unwrap_or_else(GraySection::new)
    }

    /// Push an object.
    pub fn enqueue(&mut self, obj: ObjectRef) {
        let needs_section = self.sections.back().is_none_or(|s| s.is_full());
        if needs_section {
            let section = self.fresh_section();
            self.sections.push_back(section);
        }
        if let Some(section) = self.sections.back_mut() {
            section.push(obj);
        }
    }

    /// Pop an object, most recent first.
    pub fn dequeue(&mut self) -> Option<ObjectRef> {
        loop {
            let section = self.sections.back_mut()?;
            if let Some(obj) = section.pop() {
                return Some(obj);
            }
            if let Some(empty) = self.sections.pop_back() {
                self.free_list.push(empty);
            }
        }
    }

    /// Take the oldest non-empty segment for transfer to another thread.
    pub fn dequeue_section(&mut self) -> Option<Box<GraySection>> {
        while let Some(section) = self.sections.pop_front() {
            if !section.is_empty() {
                return Some(section);
            }
            self.free_list.push(section);
        }
        None
    }

    /// Take a full segment, leaving the active one in place.
    pub fn take_full_section(&mut self) -> Option<Box<GraySection>> {
        if self.sections.len() < 2 || !self.sections[0].is_full() {
            return None;
        }
        self.sections.pop_front()
    }

    /// Adopt a segment handed over by another thread.
    pub fn enqueue_section(&mut self, section: Box<GraySection>) {
        if section.is_empty() {
            self.free_list.push(section);
            return;
        }
        // keep the partially filled active segment at the back
        self.sections.push_front(section);
    }

    /// Check if no objects are queued
    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.is_empty())
    }

    /// Number of queued objects
    pub fn len(&self) -> usize {
        self.sections.iter().map(|s| s.len()).sum()
    }

    /// Number of segments holding objects or active
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    #[cfg(test)]
    /// Cached empty segments
    pub fn free_sections(&self) -> usize {
        self.free_list.len()
    }

    /// Drop cached empty segments above `limit`.
    pub fn trim_free_list(&mut self, limit: usize) {
        self.free_list.truncate(limit);
    }
}

impl Default for GrayQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(i: usize) -> ObjectRef {
        ObjectRef::from_addr(0x1000 + i * 8).unwrap()
    }

    #[test]
    fn test_enqueue_dequeue_lifo() {
        let mut queue = GrayQueue::new();
        assert!(queue.is_empty());
        for i in 0..3 {
            queue.enqueue(obj(i));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue(), Some(obj(2)));
        assert_eq!(queue.dequeue(), Some(obj(1)));
        assert_eq!(queue.dequeue(), Some(obj(0)));
        assert_eq!(queue.dequeue(), None);
        assert!(queue.is_empty());
        // the drained segment was cached
        assert_eq!(queue.free_sections(), 1);
    }

    #[test]
    fn test_segments_roll_over() {
        let mut queue = GrayQueue::new();
        for i in 0..GRAY_SECTION_SIZE * 2 + 1 {
            queue.enqueue(obj(i));
        }
        assert_eq!(queue.section_count(), 3);
        assert_eq!(queue.len(), GRAY_SECTION_SIZE * 2 + 1);

        let mut count = 0;
        while queue.dequeue().is_some() {
            count += 1;
        }
        assert_eq!(count, GRAY_SECTION_SIZE * 2 + 1);
        assert_eq!(queue.free_sections(), 3);
    }

    #[test]
    fn test_section_transfer_moves_every_object_once() {
        let mut a = GrayQueue::new();
        let mut b = GrayQueue::new();
        let total = GRAY_SECTION_SIZE * 3 + 10;
        for i in 0..total {
            a.enqueue(obj(i));
        }

        let section = a.take_full_section().unwrap();
        assert_eq!(section.len(), GRAY_SECTION_SIZE);
        b.enqueue_section(section);

        let mut seen = std::collections::HashSet::new();
        while let Some(o) = a.dequeue() {
            assert!(seen.insert(o));
        }
        while let Some(o) = b.dequeue() {
            assert!(seen.insert(o));
        }
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn test_take_full_section_keeps_active_segment() {
        let mut queue = GrayQueue::new();
        for i in 0..GRAY_SECTION_SIZE {
            queue.enqueue(obj(i));
        }
        // only one segment: it is the active one
        assert!(queue.take_full_section().is_none());
        assert!(queue.dequeue_section().is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_trim_free_list() {
        let mut queue = GrayQueue::new();
        for i in 0..GRAY_SECTION_SIZE * 5 {
            queue.enqueue(obj(i));
        }
        while queue.dequeue().is_some() {}
        assert_eq!(queue.free_sections(), 5);
        queue.trim_free_list(2);
        assert_eq!(queue.free_sections(), 2);
    }

    #[test]
    fn test_enqueue_section_recycles_empty() {
        let mut queue = GrayQueue::new();
        queue.enqueue_section(GraySection::new());
        assert!(queue.is_empty());
        assert_eq!(queue.section_count(), 0);
        assert_eq!(queue.free_sections(), 1);
    }
}
