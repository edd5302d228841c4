//! Parallel tracing workers.
//!
//! Workers are persistent threads parked on a start semaphore. For each
//! collection the driver builds a [`TraceJob`], hands it to every worker and
//! drains alongside them. Work is shared a whole gray segment at a time
//! through a fixed ring of slots; termination uses a shared count of active
//! participants.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::gray_queue::{GRAY_QUEUE_LENGTH_LIMIT, GrayQueue, GraySection};
use crate::scanner::{ToSpace, TraceSpace, Tracer, TracerStats};

/// Slots in the section exchange ring.
pub const SECTION_RING_SIZE: usize = 64;

/// Per-participant probe strides. All odd, so each visits every ring slot.
const STRIDES: &[usize] = &[3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61];

/// A counting semaphore.
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }
}

/// Lock-free exchange of full gray segments between participants.
pub(crate) struct SectionRing {
    slots: [AtomicPtr<GraySection>; SECTION_RING_SIZE],
}

impl SectionRing {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        }
    }

    /// Store `section` in the first empty slot probed from `start`.
    /// Hands it back when the ring is full.
    pub(crate) fn publish(
        &self,
        section: Box<GraySection>,
        start: usize,
        stride: usize,
    ) -> Result<(), Box<GraySection>> {
        let raw = Box::into_raw(section);
        let mut index = start % SECTION_RING_SIZE;
        for _ in 0..SECTION_RING_SIZE {
            if self.slots[index]
                .compare_exchange(std::ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            index = (index + stride) % SECTION_RING_SIZE;
        }
        // SAFETY: raw came from Box::into_raw above and was not published
        Err(unsafe { Box::from_raw(raw) })
    }

    /// Take any published section, probing from `start`.
    pub(crate) fn claim(&self, start: usize, stride: usize) -> Option<Box<GraySection>> {
        let mut index = start % SECTION_RING_SIZE;
        for _ in 0..SECTION_RING_SIZE {
            let slot = &self.slots[index];
            if !slot.load(Ordering::Relaxed).is_null() {
                let raw = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
                if !raw.is_null() {
                    // SAFETY: non-null slots hold pointers from Box::into_raw,
                    // and the swap made this thread their only owner.
                    return Some(unsafe { Box::from_raw(raw) });
                }
            }
            index = (index + stride) % SECTION_RING_SIZE;
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.load(Ordering::Acquire).is_null())
    }
}

impl Drop for SectionRing {
    fn drop(&mut self) {
        for slot in &self.slots {
            let raw = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // SAFETY: see claim
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

/// Counts participants that may still produce work.
pub(crate) struct Terminator {
    participants: usize,
    active: CachePadded<AtomicUsize>,
}

impl Terminator {
    pub(crate) fn new(participants: usize) -> Self {
        Self {
            participants,
            active: CachePadded::new(AtomicUsize::new(participants)),
        }
    }

    /// Offer to stop. `true` once every participant is idle; `false` means
    /// someone is still working and the caller should look for work again.
    pub(crate) fn try_terminate(&self) -> bool {
        if self.participants == 1 {
            return true;
        }
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            return true;
        }
        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase()
    }

    fn zero_or_increase(&self) -> bool {
        let mut active = self.active.load(Ordering::Acquire);
        loop {
            if active == 0 {
                return true;
            }
            match self
                .active
                .compare_exchange(active, active + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return false,
                Err(current) => active = current,
            }
        }
    }
}

/// Everything one collection's tracers share.
pub(crate) struct TraceJob {
    pub space: TraceSpace,
    pub to_space: ToSpace,
    ring: SectionRing,
    terminator: Terminator,
    participants: usize,
    stats: Mutex<Vec<TracerStats>>,
}

impl TraceJob {
    pub(crate) fn new(space: TraceSpace, to_space: ToSpace, participants: usize) -> Self {
        Self {
            space,
            to_space,
            ring: SectionRing::new(),
            terminator: Terminator::new(participants),
            participants,
            stats: Mutex::new(vec![TracerStats::default(); participants]),
        }
    }

    fn stride(index: usize) -> usize {
        STRIDES[index % STRIDES.len()]
    }

    /// Move every segment of `queue` except the active one into the ring
    /// so idle workers start with something to do.
    pub(crate) fn share_work(&self, queue: &mut GrayQueue) {
        if self.participants == 1 {
            return;
        }
        let stride = Self::stride(0);
        let mut start = 0;
        while queue.section_count() > 1 {
            let Some(section) = queue.dequeue_section() else {
                break;
            };
            if let Err(section) = self.ring.publish(section, start, stride) {
                queue.enqueue_section(section);
                return;
            }
            start += 1;
        }
    }

    /// Scan until no participant has work left.
    pub(crate) fn drain(&self, tracer: &mut Tracer<'_>, index: usize) {
        let stride = Self::stride(index);
        let mut start = index;
        loop {
            while let Some(obj) = tracer.queue.dequeue() {
                tracer.scan_object(obj);
                if self.participants > 1 && tracer.queue.section_count() > 2 {
                    if let Some(section) = tracer.queue.take_full_section() {
                        start = start.wrapping_add(1);
                        if let Err(section) = self.ring.publish(section, start, stride) {
                            tracer.queue.enqueue_section(section);
                        }
                    }
                }
            }
            if let Some(section) = self.ring.claim(start, stride) {
                tracer.queue.enqueue_section(section);
                continue;
            }
            if self.terminator.try_terminate() {
                break;
            }
        }
    }

    pub(crate) fn record_stats(&self, index: usize, stats: TracerStats) {
        if let Some(slot) = self.stats.lock().get_mut(index) {
            *slot = stats;
        }
    }

    /// Per-participant counters, the driver first.
    pub(crate) fn take_stats(&self) -> Vec<TracerStats> {
        std::mem::take(&mut *self.stats.lock())
    }

    pub(crate) fn work_left(&self) -> bool {
        !self.ring.is_empty()
    }
}

struct WorkerShared {
    start: Semaphore,
    done: Semaphore,
    job: Mutex<Option<Arc<TraceJob>>>,
    shutdown: AtomicBool,
}

struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

/// Persistent tracing threads.
pub(crate) struct WorkerPool {
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Spawn up to `count` workers. A worker that fails to spawn is skipped.
    pub(crate) fn new(count: usize) -> Self {
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let shared = Arc::new(WorkerShared {
                start: Semaphore::new(),
                done: Semaphore::new(),
                job: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            });
            let thread_shared = shared.clone();
            // participant 0 is the driver
            let participant = index + 1;
            let spawned = thread::Builder::new()
                .name(format!("otter-gc-worker-{index}"))
                .spawn(move || worker_loop(thread_shared, participant));
            match spawned {
                Ok(handle) => workers.push(Worker {
                    shared,
                    thread: Some(handle),
                }),
                Err(_err) => {
                    #[cfg(feature = "gc_logging")]
                    tracing::warn!(target: "otter::gc", worker = index, error = %_err, "failed to spawn GC worker");
                }
            }
        }
        Self { workers }
    }

    /// Number of worker threads (the driver not included).
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Run `job` on every worker while the calling thread drains as
    /// participant 0 with `queue`. Returns the driver's queue.
    pub(crate) fn run(&self, job: Arc<TraceJob>, queue: GrayQueue) -> GrayQueue {
        let queue = {
            let mut tracer = Tracer::new(&job.space, &job.to_space, queue);
            job.share_work(&mut tracer.queue);

            for worker in &self.workers {
                *worker.shared.job.lock() = Some(job.clone());
                worker.shared.start.post();
            }

            job.drain(&mut tracer, 0);
            let (queue, stats) = tracer.finish();
            job.record_stats(0, stats);
            queue
        };

        for worker in &self.workers {
            worker.shared.done.wait();
        }
        queue
    }
}

fn worker_loop(shared: Arc<WorkerShared>, participant: usize) {
    let mut queue = GrayQueue::new();
    loop {
        shared.start.wait();
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let job = shared.job.lock().take();
        if let Some(job) = job {
            let mut tracer = Tracer::new(&job.space, &job.to_space, std::mem::take(&mut queue));
            job.drain(&mut tracer, participant);
            let (mut drained, stats) = tracer.finish();
            drained.trim_free_list(GRAY_QUEUE_LENGTH_LIMIT);
            job.record_stats(participant, stats);
            queue = drained;
            // the driver owns the to-space once every worker is done
            drop(job);
        }
        shared.done.post();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.shared.shutdown.store(true, Ordering::Release);
            worker.shared.start.post();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
        }
    }
}
