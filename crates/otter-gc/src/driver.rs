//! Collector driver.
//!
//! [`CollectorContext`] owns every piece of collector state and runs the
//! cycle state machine:
//!
//! ```text
//! Idle -> Suspended -> RootsPinned -> Tracing -> Sweeping -> Idle
//! ```
//!
//! Minor and major cycles share it. A minor cycle promotes nursery
//! survivors into the major heap; a major cycle also evacuates every
//! section and sweeps pinned chunks and the large object space.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashSet;

use crate::card_table::CardTable;
use crate::config::{GcConfig, SuspendMode};
use crate::error::{FatalError, GcError, fatal, gc_assert};
use crate::gray_queue::{GRAY_QUEUE_LENGTH_LIMIT, GrayQueue};
use crate::major::MajorHeap;
use crate::memory::HeapAccounting;
use crate::nursery::Nursery;
use crate::object::{HEADER_SIZE, LiveHeader, ObjectModel, ObjectRef, Slot, WORD_SIZE, align_size};
use crate::remset::{RememberedSet, WriteBarrier};
use crate::scanner::{LAB_SIZE, ToSpace, TraceSpace, Tracer, TracerStats};
use crate::stats::{CycleStats, GcStats, Generation};
use crate::stw::{
    CriticalRegion, MutatorRegistry, SafepointController, StopTheWorld, SuspendedWorld, ThreadSuspendController,
    safepoint, spill_registers, with_current,
};
use crate::verify::{self, HeapCorruption, VerifyReport};
use crate::workers::{TraceJob, WorkerPool};

/// How long an allocating thread waits for the heap lock before polling
/// its safepoint again.
const HEAP_LOCK_POLL: Duration = Duration::from_micros(100);

/// Precise root categories, visited once per cycle each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootKind {
    /// Exact stack maps
    Stack,
    /// Saved register files with exact layouts
    Registers,
    /// Static tables
    Statics,
    /// Handle scopes
    Handles,
    /// Off-heap slots written through [`WriteBarrier::set_root`]. Only
    /// visited by major cycles; minor cycles use the remembered set.
    Barriered,
}

impl RootKind {
    /// Every kind, in visiting order.
    pub const ALL: [RootKind; 5] = [
        RootKind::Stack,
        RootKind::Registers,
        RootKind::Statics,
        RootKind::Handles,
        RootKind::Barriered,
    ];
}

/// The runtime's root set.
pub trait RootProvider: Send + Sync {
    /// Visit every slot of `kind`. The collector may rewrite a slot in
    /// place; slots must stay valid until the call returns.
    fn for_each_root(&self, kind: RootKind, visit: &mut dyn FnMut(Slot));

    /// Memory ranges `[low, high)` to scan conservatively in addition to
    /// the stacks of stopped threads. Any word that points into the heap
    /// pins its object for the cycle.
    fn for_each_ambiguous_range(&self, _visit: &mut dyn FnMut(usize, usize)) {}
}

/// Where the collector is in its cycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    /// No collection running
    Idle = 0,
    /// Mutators are stopped
    Suspended = 1,
    /// Conservative roots have pinned their objects
    RootsPinned = 2,
    /// Workers are tracing
    Tracing = 3,
    /// Dead memory is being reclaimed
    Sweeping = 4,
}

impl From<u8> for CyclePhase {
    fn from(v: u8) -> Self {
        match v {
            1 => CyclePhase::Suspended,
            2 => CyclePhase::RootsPinned,
            3 => CyclePhase::Tracing,
            4 => CyclePhase::Sweeping,
            _ => CyclePhase::Idle,
        }
    }
}

pub(crate) struct Heap {
    nursery: Nursery,
    major: MajorHeap,
}

/// Cheap membership test for conservative candidates.
struct HeapFilter<'a> {
    nursery_start: usize,
    nursery_end: usize,
    block_mask: usize,
    blocks: FxHashSet<usize>,
    major: &'a MajorHeap,
}

impl<'a> HeapFilter<'a> {
    fn new(heap: &'a Heap) -> Self {
        Self {
            nursery_start: heap.nursery.start(),
            nursery_end: heap.nursery.end(),
            block_mask: heap.major.block_mask(),
            blocks: heap.major.block_bases(),
            major: &heap.major,
        }
    }

    fn accepts(&self, word: usize) -> bool {
        if word < WORD_SIZE {
            return false;
        }
        (word >= self.nursery_start && word < self.nursery_end)
            || self.blocks.contains(&(word & !self.block_mask))
            || self.major.in_large_object(word)
    }
}

/// Conservative candidates for one cycle.
#[derive(Default)]
struct PinQueue {
    candidates: Vec<usize>,
}

impl PinQueue {
    fn add_word(&mut self, word: usize, filter: &HeapFilter<'_>) {
        if filter.accepts(word) {
            self.candidates.push(word);
        }
    }

    /// Scan the aligned words of `[low, high)`.
    ///
    /// # Safety
    /// The range must be readable.
    unsafe fn add_range(&mut self, low: usize, high: usize, filter: &HeapFilter<'_>) {
        let mut addr = (low + WORD_SIZE - 1) & !(WORD_SIZE - 1);
        while addr + WORD_SIZE <= high {
            // SAFETY: guaranteed by the caller
            let word = unsafe { std::ptr::read_volatile(addr as *const usize) };
            self.add_word(word, filter);
            addr += WORD_SIZE;
        }
    }

    /// Sorted, deduplicated candidates.
    fn finish(&mut self) -> &[usize] {
        self.candidates.sort_unstable();
        self.candidates.dedup();
        &self.candidates
    }
}

/// All collector state for one heap.
pub struct CollectorContext {
    config: GcConfig,
    model: Arc<dyn ObjectModel>,
    roots: Arc<dyn RootProvider>,
    heap: Mutex<Heap>,
    cards: Arc<CardTable>,
    remset: Arc<RememberedSet>,
    barrier: WriteBarrier,
    workers: WorkerPool,
    stw: StopTheWorld,
    registry: Arc<MutatorRegistry>,
    accounting: Arc<HeapAccounting>,
    stats: Mutex<GcStats>,
    phase: AtomicU8,
    gray: Mutex<GrayQueue>,
}

impl CollectorContext {
    /// Build a collector with its own thread registry and the suspend
    /// controller selected by `config.suspend_mode`.
    pub fn init(
        config: GcConfig,
        model: Arc<dyn ObjectModel>,
        roots: Arc<dyn RootProvider>,
    ) -> Result<Self, GcError> {
        config.validate()?;
        let controller = suspend_controller(&config)?;
        Self::with_threads(config, model, roots, MutatorRegistry::new(), controller)
    }

    /// Build a collector around an existing registry and controller.
    pub fn with_threads(
        config: GcConfig,
        model: Arc<dyn ObjectModel>,
        roots: Arc<dyn RootProvider>,
        registry: Arc<MutatorRegistry>,
        controller: Arc<dyn ThreadSuspendController>,
    ) -> Result<Self, GcError> {
        config.validate()?;
        let accounting = Arc::new(HeapAccounting::new(
            config.max_heap_size,
            config.on_out_of_memory.clone(),
        ));
        let nursery = Nursery::new(config.nursery_size, &accounting);
        let major = MajorHeap::new(
            config.section_size,
            config.nursery_size,
            config.large_object_threshold,
            config.los_collection_target,
            accounting.clone(),
        );
        let cards = Arc::new(CardTable::new(config.card_bits, config.card_count_bits));
        let remset = Arc::new(RememberedSet::new());
        let barrier = WriteBarrier::new(cards.clone(), remset.clone(), nursery.start(), nursery.end());
        let workers = WorkerPool::new(config.workers);
        let stw = StopTheWorld::new(controller, registry.clone(), config.suspend_attempts);

        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "otter::gc",
            nursery_size = config.nursery_size,
            section_size = config.section_size,
            workers = workers.len(),
            suspend = ?config.suspend_mode,
            "collector initialised"
        );

        Ok(Self {
            config,
            model,
            roots,
            heap: Mutex::new(Heap { nursery, major }),
            cards,
            remset,
            barrier,
            workers,
            stw,
            registry,
            accounting,
            stats: Mutex::new(GcStats::default()),
            phase: AtomicU8::new(CyclePhase::Idle as u8),
            gray: Mutex::new(GrayQueue::new()),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Registry mutator threads join before touching the heap.
    pub fn registry(&self) -> &Arc<MutatorRegistry> {
        &self.registry
    }

    /// Store barrier for interpreter and JIT code.
    pub fn write_barrier(&self) -> &WriteBarrier {
        &self.barrier
    }

    /// Current cycle phase
    pub fn phase(&self) -> CyclePhase {
        CyclePhase::from(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: CyclePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Take the heap lock. A thread that has to wait keeps polling its
    /// safepoint, since the holder may be collecting and waiting for it.
    fn lock_heap(&self) -> MutexGuard<'_, Heap> {
        loop {
            let guard = {
                let _region = CriticalRegion::enter();
                self.heap.try_lock_for(HEAP_LOCK_POLL)
            };
            if let Some(guard) = guard {
                return guard;
            }
            safepoint();
        }
    }

    /// Allocate a movable object of `size` bytes.
    ///
    /// `size` must equal what the object model reports for `header`. The
    /// body is zeroed. Objects above the large-object threshold go to the
    /// large object space.
    pub fn alloc(&self, size: usize, header: LiveHeader) -> ObjectRef {
        self.alloc_with(size, header, |_| {})
    }

    /// Like [`alloc`](Self::alloc), running `init` on the new object before
    /// any collection can see it. Use it to write fields the object model
    /// reads, such as an array length.
    pub fn alloc_with(&self, size: usize, header: LiveHeader, init: impl FnOnce(ObjectRef)) -> ObjectRef {
        let size = align_size(size.max(HEADER_SIZE));
        let mut heap = self.lock_heap();
        let obj = if size > self.config.large_object_threshold {
            self.alloc_large_locked(&mut heap, size, header)
        } else {
            self.alloc_young_locked(&mut heap, size, header)
        };
        init(obj);
        obj
    }

    fn alloc_young_locked(&self, heap: &mut Heap, size: usize, header: LiveHeader) -> ObjectRef {
        if let Some(obj) = heap.nursery.alloc(size, header) {
            return obj;
        }
        self.collect_locked(heap, Generation::Minor, "nursery full");
        if heap.major.need_major_collection() {
            self.stats.lock().minor_overflows += 1;
            self.collect_locked(heap, Generation::Major, "minor overflow");
        }
        if let Some(obj) = heap.nursery.alloc(size, header) {
            return obj;
        }

        // pinned objects left no fragment big enough
        self.stats.lock().degraded_allocations += 1;
        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", size, "degraded allocation into the major heap");
        heap.major.alloc_small(size, header)
    }

    /// Allocate a movable object directly in the major heap.
    pub fn alloc_small(&self, size: usize, header: LiveHeader) -> ObjectRef {
        let size = align_size(size.max(HEADER_SIZE));
        let mut heap = self.lock_heap();
        if heap.major.need_major_collection() {
            self.collect_locked(&mut heap, Generation::Major, "section allowance");
        }
        heap.major.alloc_small(size, header)
    }

    /// Allocate an object that never moves.
    pub fn alloc_pinned(&self, size: usize, header: LiveHeader) -> ObjectRef {
        let size = align_size(size.max(HEADER_SIZE));
        let mut heap = self.lock_heap();
        if heap.major.need_major_collection() {
            self.collect_locked(&mut heap, Generation::Major, "section allowance");
        }
        heap.major.alloc_pinned(size, header)
    }

    /// Allocate a large, non-moving object.
    pub fn alloc_large(&self, size: usize, header: LiveHeader) -> ObjectRef {
        let size = align_size(size.max(HEADER_SIZE));
        let mut heap = self.lock_heap();
        self.alloc_large_locked(&mut heap, size, header)
    }

    fn alloc_large_locked(&self, heap: &mut Heap, size: usize, header: LiveHeader) -> ObjectRef {
        if heap.major.los_needs_collection() {
            self.collect_locked(heap, Generation::Major, "large object space");
        }
        heap.major.alloc_large(size, header)
    }

    /// Run a collection of `generation` now.
    pub fn collect(&self, generation: Generation) {
        let mut heap = self.lock_heap();
        self.collect_locked(&mut heap, generation, "explicit");
    }

    fn collect_locked(&self, heap: &mut Heap, generation: Generation, reason: &'static str) {
        let start = Instant::now();
        let major = generation == Generation::Major;
        let model = self.model.as_ref();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", ?generation, reason, "collection starting");

        self.set_phase(CyclePhase::Suspended);
        let world = self.stw.suspend_all();
        let mut cycle = CycleStats {
            stopped_threads: world.len(),
            ..CycleStats::default()
        };

        // Conservative roots pin what they refer to.
        let mut pins = PinQueue::default();
        self.gather_ambiguous_roots(heap, &world, &mut pins);
        let candidates = pins.finish();

        let mut queue = std::mem::take(&mut *self.gray.lock());
        queue.trim_free_list(GRAY_QUEUE_LENGTH_LIMIT);
        let young_pins = heap.nursery.pin_objects(model, candidates);
        cycle.pinned_objects = young_pins.len();
        for obj in young_pins {
            queue.enqueue(obj);
        }
        let old_sections = heap.major.section_count();
        if major {
            let mut found = Vec::new();
            cycle.pinned_objects += heap.major.pin_candidates(model, candidates, &mut found);
            for obj in found {
                queue.enqueue(obj);
            }
        }
        self.set_phase(CyclePhase::RootsPinned);

        // Old objects with dirty cards are minor roots. Collected before the
        // last section is lent out as promotion space.
        let mut card_objects = Vec::new();
        if major {
            self.remset.clear();
        } else {
            heap.major.collect_card_marked(model, &self.cards, &mut card_objects);
        }
        self.cards.clear();
        cycle.card_objects = card_objects.len();
        for &obj in &card_objects {
            queue.enqueue(obj);
        }

        let seed = if major {
            None
        } else {
            heap.major.take_to_space_seed(LAB_SIZE)
        };
        let space = TraceSpace {
            model: self.model.clone(),
            cards: self.cards.clone(),
            nursery_start: heap.nursery.start(),
            nursery_end: heap.nursery.end(),
            major,
            block_mask: heap.major.block_mask(),
            large_threshold: heap.major.large_threshold(),
        };
        let to_space = ToSpace::new(heap.major.section_size(), self.accounting.clone(), seed);
        let job = Arc::new(TraceJob::new(space, to_space, self.workers.len() + 1));

        let (queue, root_stats) = self.trace_precise_roots(&job, queue, major, &mut cycle);

        self.set_phase(CyclePhase::Tracing);
        let mut queue = self.workers.run(job.clone(), queue);
        let mut tracers = job.take_stats();
        let job = match Arc::try_unwrap(job) {
            Ok(job) => job,
            Err(_) => fatal(FatalError::Invariant("trace job still shared after tracing".into())),
        };
        gc_assert!(
            queue.is_empty() && !job.work_left(),
            "gray objects left after tracing"
        );
        if let Some(driver) = tracers.first_mut() {
            driver.merge(&root_stats);
        }
        cycle.absorb_tracers(tracers);
        queue.trim_free_list(GRAY_QUEUE_LENGTH_LIMIT);
        *self.gray.lock() = queue;

        self.set_phase(CyclePhase::Sweeping);
        let (seed, fresh) = job.to_space.into_sections();
        if major {
            let sweep = heap.major.sweep(model);
            cycle.sections_freed = sweep.sections_freed;
            cycle.large_objects_freed = sweep.los.freed_objects;
            cycle.bytes_freed =
                sweep.section_bytes_freed + sweep.chunk_bytes_freed + sweep.los.freed_bytes;
        }
        heap.major.adopt_to_space(model, seed, fresh);
        if major {
            heap.major.update_allowance(old_sections);
        }
        heap.nursery.build_fragments(model);

        let verify = if major {
            self.config.verify_at_major
        } else {
            self.config.verify_at_minor
        };
        if verify {
            if let Err(error) = verify::check_heap(model, &heap.nursery, &heap.major, &self.cards) {
                fatal(FatalError::Invariant(format!(
                    "heap check after {generation:?} collection failed: {error}"
                )));
            }
        }

        self.stw.resume_all(world);
        self.set_phase(CyclePhase::Idle);
        cycle.pause = start.elapsed();
        self.record_cycle(heap, generation, reason, cycle);
    }

    /// Forward precise roots and, in a minor cycle, remembered slots.
    fn trace_precise_roots(
        &self,
        job: &TraceJob,
        queue: GrayQueue,
        major: bool,
        cycle: &mut CycleStats,
    ) -> (GrayQueue, TracerStats) {
        let mut tracer = Tracer::new(&job.space, &job.to_space, queue);
        let remset = &self.remset;
        for kind in RootKind::ALL {
            if kind == RootKind::Barriered && !major {
                continue;
            }
            self.roots.for_each_root(kind, &mut |slot| {
                // SAFETY: the provider hands out valid slots
                let new = unsafe { tracer.trace_root(slot) };
                if kind == RootKind::Barriered && job.space.in_nursery(new) {
                    remset.add(slot);
                }
            });
        }
        if !major {
            for slot in remset.drain() {
                cycle.remset_slots += 1;
                // SAFETY: remembered slots stay valid while registered
                let new = unsafe { tracer.trace_root(slot) };
                if job.space.in_nursery(new) {
                    remset.add(slot);
                }
            }
        }
        tracer.finish()
    }

    fn gather_ambiguous_roots(&self, heap: &Heap, world: &SuspendedWorld, pins: &mut PinQueue) {
        let filter = HeapFilter::new(heap);
        for snapshot in world.snapshots() {
            let (low, high) = snapshot.stack_range();
            // SAFETY: the thread is stopped and its stack is mapped
            unsafe { pins.add_range(low, high, &filter) };
            for &register in &snapshot.registers {
                pins.add_word(register, &filter);
            }
        }
        self.roots.for_each_ambiguous_range(&mut |low, high| {
            // SAFETY: the provider only reports readable ranges
            unsafe { pins.add_range(low, high, &filter) }
        });

        // The collecting thread, if it is a mutator, is not stopped: scan
        // its registers and everything above this frame.
        let registers = spill_registers();
        let registered = with_current(|thread| {
            let marker = 0usize;
            let low = std::hint::black_box(&marker) as *const usize as usize;
            // SAFETY: [low, stack_base) is this thread's live stack
            unsafe { pins.add_range(low, thread.stack_base(), &filter) };
        });
        if registered.is_some() {
            for &register in registers.as_slice() {
                pins.add_word(register, &filter);
            }
        }
    }

    fn record_cycle(&self, heap: &Heap, generation: Generation, reason: &'static str, cycle: CycleStats) {
        let usage = heap.major.usage();
        #[cfg(feature = "gc_logging")]
        tracing::info!(
            target: "otter::gc",
            ?generation,
            reason,
            pause_us = cycle.pause.as_micros() as u64,
            promoted_bytes = cycle.copied_bytes,
            major_bytes = usage.section_bytes + usage.chunk_bytes,
            los_bytes = usage.los_bytes,
            sections_freed = cycle.sections_freed,
            pinned = cycle.pinned_objects,
            "collection complete"
        );
        #[cfg(not(feature = "gc_logging"))]
        let _ = reason;

        let mut stats = self.stats.lock();
        stats.record(generation, cycle);
        stats.committed_bytes = self.accounting.committed();
        stats.peak_committed_bytes = self.accounting.peak();
        stats.sections = usage.sections;
        stats.large_objects = usage.los_objects;
    }

    /// Counters snapshot
    pub fn stats(&self) -> GcStats {
        let mut stats = {
            let _region = CriticalRegion::enter();
            self.stats.lock().clone()
        };
        stats.committed_bytes = self.accounting.committed();
        stats.peak_committed_bytes = self.accounting.peak();
        stats
    }

    /// Stop the world and run the heap checker.
    pub fn check_heap(&self) -> Result<VerifyReport, HeapCorruption> {
        let heap = self.lock_heap();
        let world = self.stw.suspend_all();
        let result = verify::check_heap(self.model.as_ref(), &heap.nursery, &heap.major, &self.cards);
        self.stw.resume_all(world);
        result
    }

    /// Whether `obj` lives in the nursery.
    pub fn in_nursery(&self, obj: ObjectRef) -> bool {
        self.lock_heap().nursery.contains(obj.addr())
    }

    /// Nursery bump pointer. Equals the nursery start right after a
    /// collection that left no pinned objects.
    pub fn nursery_alloc_ptr(&self) -> usize {
        self.lock_heap().nursery.alloc_ptr()
    }

    /// `[start, end)` of the nursery
    pub fn nursery_range(&self) -> (usize, usize) {
        let heap = self.lock_heap();
        (heap.nursery.start(), heap.nursery.end())
    }

    /// Major heap sections currently held
    pub fn section_count(&self) -> usize {
        self.lock_heap().major.section_count()
    }

    /// Stop the worker threads and release the heap.
    pub fn shutdown(self) {
        #[cfg(feature = "gc_logging")]
        {
            let stats = self.stats();
            tracing::info!(
                target: "otter::gc",
                minor = stats.minor_collections,
                major = stats.major_collections,
                total_pause_us = stats.total_pause.as_micros() as u64,
                peak_bytes = stats.peak_committed_bytes,
                "collector shut down"
            );
        }
        drop(self);
    }
}

fn suspend_controller(config: &GcConfig) -> Result<Arc<dyn ThreadSuspendController>, GcError> {
    match config.suspend_mode {
        #[cfg(target_os = "linux")]
        SuspendMode::Signals => Ok(Arc::new(crate::signal::SignalSuspendController::new(
            config.suspend_timeout,
        )?)),
        #[cfg(not(target_os = "linux"))]
        SuspendMode::Signals => {
            #[cfg(feature = "gc_logging")]
            tracing::warn!(target: "otter::gc", "signal suspension unavailable, using safepoints");
            Ok(Arc::new(SafepointController::new(config.suspend_timeout)))
        }
        SuspendMode::Safepoints => Ok(Arc::new(SafepointController::new(config.suspend_timeout))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Descriptor;
    use std::sync::atomic::AtomicUsize;

    /// Shape 1: 4-word pair, words 2 and 3 are references.
    /// Shape 3: 2-word leaf without references.
    struct PairModel;

    const PAIR: u32 = 1;
    const LEAF: u32 = 3;

    impl ObjectModel for PairModel {
        fn object_size(&self, _obj: ObjectRef, header: LiveHeader) -> usize {
            match header.shape() {
                PAIR => 32,
                _ => 16,
            }
        }

        fn descriptor(&self, _obj: ObjectRef, header: LiveHeader) -> Descriptor {
            match header.shape() {
                PAIR => Descriptor::Bitmap(0b1100),
                _ => Descriptor::NoPointers,
            }
        }
    }

    #[derive(Default)]
    struct Roots {
        slots: Vec<AtomicUsize>,
        barriered: Vec<AtomicUsize>,
    }

    impl Roots {
        fn with(stack: usize, barriered: usize) -> Arc<Self> {
            Arc::new(Self {
                slots: (0..stack).map(|_| AtomicUsize::new(0)).collect(),
                barriered: (0..barriered).map(|_| AtomicUsize::new(0)).collect(),
            })
        }

        fn slot(cell: &AtomicUsize) -> Slot {
            Slot::from_ptr(cell.as_ptr())
        }

        fn get(&self, index: usize) -> usize {
            self.slots[index].load(Ordering::Relaxed)
        }

        fn set(&self, index: usize, obj: ObjectRef) {
            self.slots[index].store(obj.addr(), Ordering::Relaxed);
        }
    }

    impl RootProvider for Roots {
        fn for_each_root(&self, kind: RootKind, visit: &mut dyn FnMut(Slot)) {
            match kind {
                RootKind::Stack => self.slots.iter().for_each(|c| visit(Self::slot(c))),
                RootKind::Barriered => self.barriered.iter().for_each(|c| visit(Self::slot(c))),
                _ => {}
            }
        }
    }

    fn context(roots: Arc<Roots>) -> CollectorContext {
        let config = GcConfig {
            nursery_size: 64 * 1024,
            section_size: 64 * 1024,
            workers: 1,
            suspend_mode: SuspendMode::Safepoints,
            verify_at_minor: true,
            verify_at_major: true,
            ..GcConfig::default()
        };
        CollectorContext::init(config, Arc::new(PairModel), roots).unwrap()
    }

    fn pair(gc: &CollectorContext, left: Option<ObjectRef>, right: Option<ObjectRef>) -> ObjectRef {
        let obj = gc.alloc(32, LiveHeader::new(PAIR));
        // SAFETY: fresh pair with reference words 2 and 3
        unsafe {
            gc.write_barrier().set_field(obj, 2, left);
            gc.write_barrier().set_field(obj, 3, right);
        }
        obj
    }

    #[test]
    fn test_minor_promotes_rooted_chain() {
        let roots = Roots::with(1, 0);
        let gc = context(roots.clone());
        let leaf = gc.alloc(16, LiveHeader::new(LEAF));
        unsafe { leaf.write_word(1, 0xfeed) };
        let head = pair(&gc, Some(leaf), None);
        roots.set(0, head);
        pair(&gc, None, None);

        gc.collect(Generation::Minor);

        let moved = ObjectRef::from_addr(roots.get(0)).unwrap();
        assert!(!gc.in_nursery(moved));
        let moved_leaf = ObjectRef::from_addr(unsafe { moved.read_word(2) }).unwrap();
        assert!(!gc.in_nursery(moved_leaf));
        assert_eq!(unsafe { moved_leaf.read_word(1) }, 0xfeed);
        assert_eq!(gc.nursery_alloc_ptr(), gc.nursery_range().0);
        let stats = gc.stats();
        assert_eq!(stats.minor_collections, 1);
        assert_eq!(stats.last_cycle.unwrap().1.copied_objects, 2);
        assert_eq!(gc.phase(), CyclePhase::Idle);
    }

    #[test]
    fn test_card_keeps_young_object_alive() {
        let roots = Roots::with(1, 0);
        let gc = context(roots.clone());
        let old = gc.alloc_small(32, LiveHeader::new(PAIR));
        roots.set(0, old);
        let young = gc.alloc(16, LiveHeader::new(LEAF));
        unsafe {
            young.write_word(1, 7);
            gc.write_barrier().set_field(old, 3, Some(young));
        }

        gc.collect(Generation::Minor);

        assert_eq!(roots.get(0), old.addr());
        let promoted = ObjectRef::from_addr(unsafe { old.read_word(3) }).unwrap();
        assert_ne!(promoted, young);
        assert_eq!(unsafe { promoted.read_word(1) }, 7);
        assert_eq!(gc.stats().last_cycle.unwrap().1.card_objects, 1);
    }

    #[test]
    fn test_barriered_root_is_remembered() {
        let roots = Roots::with(0, 1);
        let gc = context(roots.clone());
        let young = gc.alloc(16, LiveHeader::new(LEAF));
        let slot = Roots::slot(&roots.barriered[0]);
        unsafe { gc.write_barrier().set_root(slot, Some(young)) };

        gc.collect(Generation::Minor);
        let promoted = roots.barriered[0].load(Ordering::Relaxed);
        assert_ne!(promoted, young.addr());
        assert_eq!(gc.stats().last_cycle.unwrap().1.remset_slots, 1);

        gc.collect(Generation::Major);
        let moved = roots.barriered[0].load(Ordering::Relaxed);
        assert_ne!(moved, 0);
        assert_ne!(moved, promoted);
    }

    #[test]
    fn test_ambiguous_range_pins_nursery_object() {
        struct Ambiguous {
            word: AtomicUsize,
        }
        impl RootProvider for Ambiguous {
            fn for_each_root(&self, _kind: RootKind, _visit: &mut dyn FnMut(Slot)) {}
            fn for_each_ambiguous_range(&self, visit: &mut dyn FnMut(usize, usize)) {
                let addr = self.word.as_ptr() as usize;
                visit(addr, addr + WORD_SIZE);
            }
        }

        let roots = Arc::new(Ambiguous {
            word: AtomicUsize::new(0),
        });
        let config = GcConfig {
            nursery_size: 64 * 1024,
            section_size: 64 * 1024,
            workers: 0,
            suspend_mode: SuspendMode::Safepoints,
            verify_at_minor: true,
            ..GcConfig::default()
        };
        let gc = CollectorContext::init(config, Arc::new(PairModel), roots.clone()).unwrap();
        gc.alloc(16, LiveHeader::new(LEAF));
        let pinned = gc.alloc(16, LiveHeader::new(LEAF));
        unsafe { pinned.write_word(1, 99) };
        // interior pointer
        roots.word.store(pinned.addr() + 8, Ordering::Relaxed);

        gc.collect(Generation::Minor);

        assert!(gc.in_nursery(pinned));
        assert_eq!(unsafe { pinned.read_word(1) }, 99);
        assert_eq!(gc.stats().last_cycle.unwrap().1.pinned_objects, 1);
        // the gap before the pin is too small to become a fragment
        assert!(gc.nursery_alloc_ptr() > pinned.addr());
    }

    #[test]
    fn test_full_nursery_triggers_minor() {
        let roots = Roots::with(1, 0);
        let gc = context(roots.clone());
        let keep = gc.alloc(16, LiveHeader::new(LEAF));
        roots.set(0, keep);
        for _ in 0..(64 * 1024 / 16) {
            gc.alloc(16, LiveHeader::new(LEAF));
        }
        assert!(gc.stats().minor_collections >= 1);
        assert!(!gc.in_nursery(ObjectRef::from_addr(roots.get(0)).unwrap()));
    }

    #[test]
    fn test_major_releases_dead_sections() {
        let roots = Roots::with(0, 0);
        let gc = context(roots);
        // two sections' worth, below the allowance
        for _ in 0..4000 {
            gc.alloc_small(32, LiveHeader::new(PAIR));
        }
        assert_eq!(gc.section_count(), 2);
        gc.collect(Generation::Major);
        assert_eq!(gc.section_count(), 0);
        let cycle = gc.stats().last_cycle.unwrap().1;
        assert_eq!(cycle.sections_freed, 2);
    }

    #[test]
    fn test_phase_round_trip() {
        for phase in [
            CyclePhase::Idle,
            CyclePhase::Suspended,
            CyclePhase::RootsPinned,
            CyclePhase::Tracing,
            CyclePhase::Sweeping,
        ] {
            assert_eq!(CyclePhase::from(phase as u8), phase);
        }
    }
}
