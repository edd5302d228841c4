//! Collector backends.
//!
//! The runtime picks a backend once at startup and talks to it through
//! [`GcBackend`]. `CopyingMajor` is the generational collector driven by
//! [`CollectorContext`]; `Null` bump-allocates from major-heap sections and
//! never reclaims anything, which is useful for short-lived tools and for
//! telling collector bugs apart from mutator bugs.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::GcConfig;
use crate::driver::{CollectorContext, RootProvider};
use crate::error::GcError;
use crate::major::MajorHeap;
use crate::memory::HeapAccounting;
use crate::object::{LiveHeader, ObjectModel, ObjectRef, align_size};
use crate::stats::{GcStats, Generation};

/// Available collector backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Copying nursery plus copying major heap
    CopyingMajor,
    /// Allocation only
    Null,
}

/// Allocation and collection interface shared by every backend.
pub trait GcBackend: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> BackendKind;

    /// Allocate a movable object of `size` bytes with header `header`.
    fn alloc(&self, size: usize, header: LiveHeader) -> ObjectRef;

    /// Allocate an object that is never moved.
    fn alloc_pinned(&self, size: usize, header: LiveHeader) -> ObjectRef;

    /// Allocate a large, non-moving object.
    fn alloc_large(&self, size: usize, header: LiveHeader) -> ObjectRef;

    /// Run a collection of `generation` now.
    fn collect(&self, generation: Generation);

    /// Counters snapshot
    fn stats(&self) -> GcStats;
}

impl GcBackend for CollectorContext {
    fn kind(&self) -> BackendKind {
        BackendKind::CopyingMajor
    }

    fn alloc(&self, size: usize, header: LiveHeader) -> ObjectRef {
        CollectorContext::alloc(self, size, header)
    }

    fn alloc_pinned(&self, size: usize, header: LiveHeader) -> ObjectRef {
        CollectorContext::alloc_pinned(self, size, header)
    }

    fn alloc_large(&self, size: usize, header: LiveHeader) -> ObjectRef {
        CollectorContext::alloc_large(self, size, header)
    }

    fn collect(&self, generation: Generation) {
        CollectorContext::collect(self, generation)
    }

    fn stats(&self) -> GcStats {
        CollectorContext::stats(self)
    }
}

/// Backend that never collects.
pub struct NullBackend {
    heap: Mutex<MajorHeap>,
    accounting: Arc<HeapAccounting>,
}

impl NullBackend {
    /// Build from a validated configuration.
    pub fn new(config: &GcConfig) -> Result<Self, GcError> {
        config.validate()?;
        let accounting = Arc::new(HeapAccounting::new(
            config.max_heap_size,
            config.on_out_of_memory.clone(),
        ));
        let heap = MajorHeap::new(
            config.section_size,
            config.nursery_size,
            config.large_object_threshold,
            config.los_collection_target,
            accounting.clone(),
        );
        Ok(Self {
            heap: Mutex::new(heap),
            accounting,
        })
    }
}

impl GcBackend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    fn alloc(&self, size: usize, header: LiveHeader) -> ObjectRef {
        self.heap.lock().alloc_small(align_size(size), header)
    }

    fn alloc_pinned(&self, size: usize, header: LiveHeader) -> ObjectRef {
        self.heap.lock().alloc_pinned(align_size(size), header)
    }

    fn alloc_large(&self, size: usize, header: LiveHeader) -> ObjectRef {
        self.heap.lock().alloc_large(align_size(size), header)
    }

    fn collect(&self, _generation: Generation) {
        #[cfg(feature = "gc_logging")]
        tracing::trace!(target: "otter::gc", "null backend ignores collection request");
    }

    fn stats(&self) -> GcStats {
        let usage = self.heap.lock().usage();
        GcStats {
            committed_bytes: self.accounting.committed(),
            peak_committed_bytes: self.accounting.peak(),
            sections: usage.sections,
            large_objects: usage.los_objects,
            ..GcStats::default()
        }
    }
}

/// Build the backend selected by `config.backend`.
pub fn create_backend(
    config: GcConfig,
    model: Arc<dyn ObjectModel>,
    roots: Arc<dyn RootProvider>,
) -> Result<Box<dyn GcBackend>, GcError> {
    match config.backend {
        BackendKind::CopyingMajor => Ok(Box::new(CollectorContext::init(config, model, roots)?)),
        BackendKind::Null => Ok(Box::new(NullBackend::new(&config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuspendMode;
    use crate::driver::RootKind;
    use crate::object::Slot;
    use crate::region::test_model::WordsModel;

    struct NoRoots;

    impl RootProvider for NoRoots {
        fn for_each_root(&self, _kind: RootKind, _visit: &mut dyn FnMut(Slot)) {}
    }

    fn config(backend: BackendKind) -> GcConfig {
        GcConfig {
            nursery_size: 64 * 1024,
            section_size: 64 * 1024,
            workers: 0,
            suspend_mode: SuspendMode::Safepoints,
            backend,
            ..GcConfig::default()
        }
    }

    #[test]
    fn test_null_backend_never_collects() {
        let backend =
            create_backend(config(BackendKind::Null), Arc::new(WordsModel), Arc::new(NoRoots)).unwrap();
        assert_eq!(backend.kind(), BackendKind::Null);
        let first = backend.alloc(24, LiveHeader::new(3));
        for _ in 0..10_000 {
            backend.alloc(24, LiveHeader::new(3));
        }
        backend.collect(Generation::Major);
        assert_eq!(first.live_header().shape(), 3);
        let stats = backend.stats();
        assert_eq!(stats.collections(), 0);
        assert!(stats.sections >= 3);
    }

    #[test]
    fn test_null_backend_large_and_pinned() {
        let backend = NullBackend::new(&config(BackendKind::Null)).unwrap();
        let big = backend.alloc_large(64 * 1024, LiveHeader::new(8192));
        let small = backend.alloc_pinned(32, LiveHeader::new(4));
        assert_ne!(big, small);
        assert_eq!(backend.stats().large_objects, 1);
    }

    #[test]
    fn test_copying_backend_selected() {
        let backend = create_backend(
            config(BackendKind::CopyingMajor),
            Arc::new(WordsModel),
            Arc::new(NoRoots),
        )
        .unwrap();
        assert_eq!(backend.kind(), BackendKind::CopyingMajor);
        backend.collect(Generation::Minor);
        assert_eq!(backend.stats().minor_collections, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config(BackendKind::Null);
        bad.section_size = 1000;
        assert!(NullBackend::new(&bad).is_err());
    }
}
