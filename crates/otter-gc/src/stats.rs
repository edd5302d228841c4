//! Collection statistics.

use std::time::Duration;

use crate::scanner::TracerStats;

/// Which generation a cycle collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Nursery only
    Minor,
    /// Nursery and major heap
    Major,
}

/// Outcome of one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Objects copied out of the nursery or into to-space
    pub copied_objects: usize,
    /// Bytes copied
    pub copied_bytes: usize,
    /// Objects marked in place
    pub marked_objects: usize,
    /// Objects scanned
    pub scanned_objects: usize,
    /// Objects kept in place by ambiguous roots
    pub pinned_objects: usize,
    /// Old objects rescanned because of dirty cards
    pub card_objects: usize,
    /// Remembered root slots processed
    pub remset_slots: usize,
    /// Mutator threads stopped
    pub stopped_threads: usize,
    /// Sections released by the major sweep
    pub sections_freed: usize,
    /// Large objects released by the major sweep
    pub large_objects_freed: usize,
    /// Bytes released by the major sweep
    pub bytes_freed: usize,
    /// Counters per tracing thread, the driving thread first
    pub workers: Vec<TracerStats>,
    /// Stop-the-world pause
    pub pause: Duration,
}

impl CycleStats {
    pub(crate) fn absorb_tracers(&mut self, tracers: Vec<TracerStats>) {
        let mut total = TracerStats::default();
        for stats in &tracers {
            total.merge(stats);
        }
        self.copied_objects = total.copied_objects;
        self.copied_bytes = total.copied_bytes;
        self.marked_objects = total.marked_objects;
        self.scanned_objects = total.scanned_objects;
        self.workers = tracers;
    }
}

/// Cumulative collector statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Minor collections run
    pub minor_collections: u64,
    /// Major collections run
    pub major_collections: u64,
    /// Minor collections that overflowed into a major one
    pub minor_overflows: u64,
    /// Allocations served from the major heap because the nursery stayed full
    pub degraded_allocations: u64,
    /// Total pause time
    pub total_pause: Duration,
    /// Longest pause
    pub max_pause: Duration,
    /// Bytes copied over all cycles
    pub total_copied_bytes: u64,
    /// Committed heap bytes after the last cycle
    pub committed_bytes: usize,
    /// Highest committed heap bytes
    pub peak_committed_bytes: usize,
    /// Major heap sections after the last cycle
    pub sections: usize,
    /// Large objects after the last cycle
    pub large_objects: usize,
    /// Most recent cycle, if any
    pub last_cycle: Option<(Generation, CycleStats)>,
}

impl GcStats {
    pub(crate) fn record(&mut self, generation: Generation, cycle: CycleStats) {
        match generation {
            Generation::Minor => self.minor_collections += 1,
            Generation::Major => self.major_collections += 1,
        }
        self.total_pause += cycle.pause;
        self.max_pause = self.max_pause.max(cycle.pause);
        self.total_copied_bytes += cycle.copied_bytes as u64;
        self.last_cycle = Some((generation, cycle));
    }

    /// Total collections of either kind
    pub fn collections(&self) -> u64 {
        self.minor_collections + self.major_collections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let mut stats = GcStats::default();
        let mut cycle = CycleStats {
            pause: Duration::from_millis(3),
            ..CycleStats::default()
        };
        cycle.absorb_tracers(vec![
            TracerStats {
                copied_objects: 2,
                copied_bytes: 64,
                ..TracerStats::default()
            },
            TracerStats {
                copied_objects: 1,
                copied_bytes: 32,
                ..TracerStats::default()
            },
        ]);
        assert_eq!(cycle.copied_objects, 3);
        stats.record(Generation::Minor, cycle);
        stats.record(
            Generation::Major,
            CycleStats {
                pause: Duration::from_millis(1),
                ..CycleStats::default()
            },
        );
        assert_eq!(stats.collections(), 2);
        assert_eq!(stats.total_copied_bytes, 96);
        assert_eq!(stats.max_pause, Duration::from_millis(3));
        assert_eq!(stats.total_pause, Duration::from_millis(4));
        assert!(matches!(stats.last_cycle, Some((Generation::Major, _))));
    }
}
