//! Mutator registration and stop-the-world coordination.
//!
//! Every thread that touches the heap registers with a [`MutatorRegistry`].
//! Before a collection the driver asks a [`ThreadSuspendController`] to stop
//! each registered thread (other than itself) and gets back a
//! [`ThreadSnapshot`]: the live stack range plus saved registers, which the
//! driver then scans conservatively.
//!
//! Two controllers exist: [`SafepointController`], where mutators park
//! themselves at poll points, and on Linux the signal-based
//! [`SignalSuspendController`](crate::SignalSuspendController), which stops
//! threads wherever they are.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering, compiler_fence};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::error::{FatalError, SuspendError, fatal};

/// Registers a stopped thread can record.
pub const MAX_SAVED_REGISTERS: usize = 32;

/// Suspension handshake state of a mutator.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing normally
    Running = 0,
    /// A collector asked the thread to stop
    SuspendRequested = 1,
    /// Stopped; its snapshot is valid
    Suspended = 2,
    /// The collector released it; it has not resumed yet
    ResumeRequested = 3,
}

impl From<u8> for ThreadState {
    fn from(v: u8) -> Self {
        match v {
            1 => ThreadState::SuspendRequested,
            2 => ThreadState::Suspended,
            3 => ThreadState::ResumeRequested,
            _ => ThreadState::Running,
        }
    }
}

/// A registered mutator thread.
pub struct MutatorThread {
    id: u64,
    thread_id: ThreadId,
    stack_base: usize,
    #[cfg(unix)]
    pthread: libc::pthread_t,
    state: AtomicU8,
    stack_pointer: AtomicUsize,
    instruction_pointer: AtomicUsize,
    registers: [AtomicUsize; MAX_SAVED_REGISTERS],
    register_count: AtomicUsize,
    /// Runtime-defined tag recorded alongside the snapshot (for example,
    /// whether the thread was stopped in managed or native code).
    context: AtomicUsize,
    /// Nesting depth of [`CriticalRegion`]s on this thread
    critical: AtomicUsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl std::fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id)
            .field("thread_id", &self.thread_id)
            .field("stack_base", &format_args!("{:#x}", self.stack_base))
            .field("state", &self.state())
            .finish()
    }
}

impl MutatorThread {
    fn for_current(id: u64, stack_base: usize) -> Self {
        Self {
            id,
            thread_id: thread::current().id(),
            stack_base,
            // SAFETY: pthread_self has no preconditions
            #[cfg(unix)]
            pthread: unsafe { libc::pthread_self() },
            state: AtomicU8::new(ThreadState::Running as u8),
            stack_pointer: AtomicUsize::new(0),
            instruction_pointer: AtomicUsize::new(0),
            registers: std::array::from_fn(|_| AtomicUsize::new(0)),
            register_count: AtomicUsize::new(0),
            context: AtomicUsize::new(0),
            critical: AtomicUsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Registry id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Rust thread id
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Highest stack address (the stack grows down from here)
    pub fn stack_base(&self) -> usize {
        self.stack_base
    }

    #[cfg(unix)]
    pub(crate) fn pthread(&self) -> libc::pthread_t {
        self.pthread
    }

    /// Current handshake state
    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Tag stored in the next snapshot.
    pub fn set_context(&self, context: usize) {
        self.context.store(context, Ordering::Relaxed);
    }

    /// Save where the thread stopped. Must not allocate: it runs inside the
    /// suspend signal handler.
    pub(crate) fn record_stop(&self, stack_pointer: usize, instruction_pointer: usize, registers: &[usize]) {
        let count = registers.len().min(MAX_SAVED_REGISTERS);
        for (slot, &value) in self.registers.iter().zip(&registers[..count]) {
            slot.store(value, Ordering::Relaxed);
        }
        self.register_count.store(count, Ordering::Relaxed);
        self.instruction_pointer.store(instruction_pointer, Ordering::Relaxed);
        self.stack_pointer.store(stack_pointer, Ordering::Relaxed);
    }

    /// Snapshot of a suspended thread.
    pub(crate) fn snapshot(&self) -> ThreadSnapshot {
        let count = self.register_count.load(Ordering::Relaxed);
        ThreadSnapshot {
            thread: self.id,
            stack_pointer: self.stack_pointer.load(Ordering::Relaxed),
            stack_base: self.stack_base,
            instruction_pointer: self.instruction_pointer.load(Ordering::Relaxed),
            registers: self.registers[..count]
                .iter()
                .map(|r| r.load(Ordering::Relaxed))
                .collect(),
            context: self.context.load(Ordering::Relaxed),
        }
    }

    /// Park here if a collection asked this thread to stop.
    #[inline]
    pub fn safepoint(&self) {
        if self.state() == ThreadState::SuspendRequested {
            self.park();
        }
    }

    #[cold]
    #[inline(never)]
    fn park(&self) {
        // no signal stop inside the condvar machinery
        self.enter_critical();
        let registers = spill_registers();
        let marker = 0usize;
        let stack_pointer = std::hint::black_box(&marker) as *const usize as usize;
        self.record_stop(stack_pointer, 0, registers.as_slice());

        {
            let mut guard = self.lock.lock();
            // the request may have been withdrawn after a timeout
            if self.transition(ThreadState::SuspendRequested, ThreadState::Suspended) {
                while self.state() != ThreadState::ResumeRequested {
                    self.cond.wait(&mut guard);
                }
                self.set_state(ThreadState::Running);
            }
        }
        self.pop_critical();
    }

    /// Whether the thread is inside a [`CriticalRegion`]. Read by the
    /// suspend signal handler on the same thread.
    #[inline]
    pub(crate) fn in_critical_region(&self) -> bool {
        self.critical.load(Ordering::Relaxed) != 0
    }

    // Only the owning thread writes the depth; the handler that reads it
    // runs on the same thread, so compiler fences are enough.
    fn enter_critical(&self) {
        let depth = self.critical.load(Ordering::Relaxed);
        self.critical.store(depth + 1, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    /// Drop one level and return the depth before it.
    fn pop_critical(&self) -> usize {
        compiler_fence(Ordering::SeqCst);
        let depth = self.critical.load(Ordering::Relaxed);
        if depth == 0 {
            // registered while the region was open
            return 0;
        }
        self.critical.store(depth - 1, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        depth
    }

    /// Leaving the outermost region honours a suspend request the signal
    /// handler had to decline.
    fn leave_critical(&self) {
        if self.pop_critical() == 1 {
            self.safepoint();
        }
    }

    pub(crate) fn wake(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

/// Where a stopped thread's roots may be.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadSnapshot {
    /// Registry id of the thread
    pub thread: u64,
    /// Lowest live stack address
    pub stack_pointer: usize,
    /// Highest stack address
    pub stack_base: usize,
    /// Where the thread stopped, 0 if unknown
    pub instruction_pointer: usize,
    /// Saved register values
    pub registers: Vec<usize>,
    /// Runtime-defined tag, see [`MutatorThread::set_context`]
    pub context: usize,
}

impl ThreadSnapshot {
    /// Live stack as `[low, high)`.
    pub fn stack_range(&self) -> (usize, usize) {
        (self.stack_pointer, self.stack_base.max(self.stack_pointer))
    }
}

/// Register values captured on the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SavedRegisters {
    values: [usize; 12],
    len: usize,
}

impl SavedRegisters {
    pub(crate) fn as_slice(&self) -> &[usize] {
        &self.values[..self.len]
    }
}

/// Read the callee-saved registers so values a caller keeps only in
/// registers are visible to the conservative scan.
#[inline(never)]
pub(crate) fn spill_registers() -> SavedRegisters {
    #[allow(unused_mut)]
    let mut saved = SavedRegisters::default();
    #[cfg(target_arch = "x86_64")]
    {
        let (rbx, rbp, r12, r13, r14, r15): (usize, usize, usize, usize, usize, usize);
        // SAFETY: plain register reads
        unsafe {
            std::arch::asm!("mov {}, rbx", out(reg) rbx, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, r12", out(reg) r12, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, r13", out(reg) r13, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, r14", out(reg) r14, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, r15", out(reg) r15, options(nomem, nostack, preserves_flags));
        }
        saved.values[..6].copy_from_slice(&[rbx, rbp, r12, r13, r14, r15]);
        saved.len = 6;
    }
    #[cfg(target_arch = "aarch64")]
    {
        let (x19, x20, x21, x22, x23, x24): (usize, usize, usize, usize, usize, usize);
        let (x25, x26, x27, x28, x29): (usize, usize, usize, usize, usize);
        // SAFETY: plain register reads
        unsafe {
            std::arch::asm!("mov {}, x19", out(reg) x19, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x20", out(reg) x20, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x21", out(reg) x21, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x22", out(reg) x22, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x23", out(reg) x23, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x24", out(reg) x24, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x25", out(reg) x25, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x26", out(reg) x26, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x27", out(reg) x27, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x28", out(reg) x28, options(nomem, nostack, preserves_flags));
            std::arch::asm!("mov {}, x29", out(reg) x29, options(nomem, nostack, preserves_flags));
        }
        saved.values[..11].copy_from_slice(&[x19, x20, x21, x22, x23, x24, x25, x26, x27, x28, x29]);
        saved.len = 11;
    }
    saved
}

thread_local! {
    static CURRENT_MUTATOR: Cell<*const MutatorThread> = const { Cell::new(std::ptr::null()) };
}

/// Run `f` with the calling thread's registration, if any.
///
/// Reads a const-initialised thread local and takes no locks, so it is
/// usable from a signal handler.
pub(crate) fn with_current<R>(f: impl FnOnce(&MutatorThread) -> R) -> Option<R> {
    let ptr = CURRENT_MUTATOR.with(Cell::get);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: the pointer is set by MutatorGuard, which keeps the Arc alive
    // and clears the pointer before releasing it.
    Some(f(unsafe { &*ptr }))
}

/// A stretch of mutator code that signal suspension must not interrupt.
///
/// Anything here that takes a lock the collector also takes while the world
/// is stopped (the remembered set, the heap lock wait) runs inside one. The
/// suspend handler leaves a thread in a region running; the thread parks
/// itself when the outermost region ends. Regions must stay short and must
/// not block on the collector. A no-op on unregistered threads.
pub struct CriticalRegion {
    _not_send: PhantomData<*const ()>,
}

impl CriticalRegion {
    /// Enter a region on the calling thread.
    #[inline]
    pub fn enter() -> Self {
        with_current(MutatorThread::enter_critical);
        Self { _not_send: PhantomData }
    }
}

impl Drop for CriticalRegion {
    #[inline]
    fn drop(&mut self) {
        with_current(MutatorThread::leave_critical);
    }
}

/// Poll point for the calling thread. A no-op unless the thread is
/// registered and a collection is waiting for it.
#[inline]
pub fn safepoint() {
    with_current(MutatorThread::safepoint);
}

/// Source of the threads a collection must stop.
pub trait ThreadRegistry: Send + Sync {
    /// Visit every registered mutator.
    fn for_each_mutator_thread(&self, f: &mut dyn FnMut(&Arc<MutatorThread>));
}

/// Default [`ThreadRegistry`].
#[derive(Default)]
pub struct MutatorRegistry {
    threads: Mutex<Vec<Arc<MutatorThread>>>,
    next_id: AtomicU64,
}

impl MutatorRegistry {
    /// Empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the calling thread, locating its stack from the OS.
    ///
    /// Where the stack bounds are unavailable the current frame is used as
    /// the base, so only frames below this call are scanned.
    ///
    /// # Panics
    /// If the thread is already registered.
    pub fn register_current(self: &Arc<Self>) -> MutatorGuard {
        let marker = 0usize;
        let fallback = std::hint::black_box(&marker) as *const usize as usize;
        let base = current_stack_base().unwrap_or(fallback);
        self.register_current_with_base(base)
    }

    /// Register the calling thread with an explicit stack base.
    ///
    /// # Panics
    /// If the thread is already registered.
    pub fn register_current_with_base(self: &Arc<Self>, stack_base: usize) -> MutatorGuard {
        assert!(
            with_current(|_| ()).is_none(),
            "thread is already registered with a collector"
        );
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let thread = Arc::new(MutatorThread::for_current(id, stack_base));
        self.threads.lock().push(thread.clone());
        CURRENT_MUTATOR.with(|current| current.set(Arc::as_ptr(&thread)));

        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "otter::gc", thread = id, stack_base = format_args!("{stack_base:#x}"), "mutator registered");

        MutatorGuard {
            registry: self.clone(),
            thread,
            _not_send: PhantomData,
        }
    }

    /// Number of registered threads
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Check if no thread is registered
    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    fn unregister(&self, thread: &Arc<MutatorThread>) {
        self.threads.lock().retain(|t| !Arc::ptr_eq(t, thread));
    }
}

impl ThreadRegistry for MutatorRegistry {
    fn for_each_mutator_thread(&self, f: &mut dyn FnMut(&Arc<MutatorThread>)) {
        let threads = self.threads.lock().clone();
        for thread in &threads {
            f(thread);
        }
    }
}

/// Keeps the calling thread registered; unregisters on drop.
pub struct MutatorGuard {
    registry: Arc<MutatorRegistry>,
    thread: Arc<MutatorThread>,
    _not_send: PhantomData<*const ()>,
}

impl MutatorGuard {
    /// The registration
    pub fn thread(&self) -> &Arc<MutatorThread> {
        &self.thread
    }
}

impl Drop for MutatorGuard {
    fn drop(&mut self) {
        CURRENT_MUTATOR.with(|current| current.set(std::ptr::null()));
        self.registry.unregister(&self.thread);
    }
}

#[cfg(target_os = "linux")]
fn current_stack_base() -> Option<usize> {
    // SAFETY: attr is initialised by pthread_getattr_np before use and
    // destroyed afterwards.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        (rc == 0).then(|| addr as usize + size)
    }
}

#[cfg(target_os = "macos")]
fn current_stack_base() -> Option<usize> {
    // SAFETY: pthread_self is always valid for the calling thread
    let addr = unsafe { libc::pthread_get_stackaddr_np(libc::pthread_self()) };
    (!addr.is_null()).then_some(addr as usize)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn current_stack_base() -> Option<usize> {
    None
}

/// Stops and restarts one mutator.
pub trait ThreadSuspendController: Send + Sync {
    /// Stop `thread` and describe where it stopped.
    fn suspend(&self, thread: &MutatorThread) -> Result<ThreadSnapshot, SuspendError>;

    /// Let a thread stopped by [`suspend`](Self::suspend) continue.
    fn resume(&self, thread: &MutatorThread) -> Result<(), SuspendError>;
}

fn pause(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::sleep(Duration::from_micros(50));
    } else {
        backoff.snooze();
    }
}

/// Move `thread` from Running to SuspendRequested, waiting out a resume
/// still in flight from the previous cycle.
pub(crate) fn request_suspend(thread: &MutatorThread, deadline: Instant) -> Result<(), SuspendError> {
    let backoff = Backoff::new();
    loop {
        match thread.state() {
            ThreadState::Running => {
                if thread.transition(ThreadState::Running, ThreadState::SuspendRequested) {
                    return Ok(());
                }
            }
            ThreadState::ResumeRequested => {}
            ThreadState::SuspendRequested | ThreadState::Suspended => {
                return Err(SuspendError::InvalidState(thread.id()));
            }
        }
        if Instant::now() >= deadline {
            return Err(SuspendError::Timeout {
                thread: thread.id(),
                timeout: Duration::ZERO,
            });
        }
        pause(&backoff);
    }
}

/// Wait until `thread` acknowledges the request. On timeout the request is
/// withdrawn, unless the thread stopped in the meantime.
pub(crate) fn await_suspended(
    thread: &MutatorThread,
    deadline: Instant,
    timeout: Duration,
) -> Result<ThreadSnapshot, SuspendError> {
    let backoff = Backoff::new();
    loop {
        if thread.state() == ThreadState::Suspended {
            return Ok(thread.snapshot());
        }
        if Instant::now() >= deadline {
            if thread.transition(ThreadState::SuspendRequested, ThreadState::Running) {
                return Err(SuspendError::Timeout {
                    thread: thread.id(),
                    timeout,
                });
            }
            // lost the race with the acknowledgement
            continue;
        }
        pause(&backoff);
    }
}

/// Cooperative suspension: threads stop when they next call
/// [`safepoint`] (or [`MutatorThread::safepoint`]).
#[derive(Debug, Clone)]
pub struct SafepointController {
    timeout: Duration,
}

impl SafepointController {
    /// Controller that waits up to `timeout` per attempt.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ThreadSuspendController for SafepointController {
    fn suspend(&self, thread: &MutatorThread) -> Result<ThreadSnapshot, SuspendError> {
        let deadline = Instant::now() + self.timeout;
        request_suspend(thread, deadline)?;
        await_suspended(thread, deadline, self.timeout)
    }

    fn resume(&self, thread: &MutatorThread) -> Result<(), SuspendError> {
        if !thread.transition(ThreadState::Suspended, ThreadState::ResumeRequested) {
            return Err(SuspendError::InvalidState(thread.id()));
        }
        thread.wake();
        Ok(())
    }
}

/// Threads stopped for one collection.
#[derive(Default)]
pub struct SuspendedWorld {
    threads: Vec<(Arc<MutatorThread>, ThreadSnapshot)>,
}

impl SuspendedWorld {
    /// Snapshots of every stopped thread
    pub fn snapshots(&self) -> impl Iterator<Item = &ThreadSnapshot> {
        self.threads.iter().map(|(_, snapshot)| snapshot)
    }

    /// Number of stopped threads
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Check if no thread was stopped
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// Stops every registered mutator except the caller.
pub struct StopTheWorld {
    controller: Arc<dyn ThreadSuspendController>,
    registry: Arc<dyn ThreadRegistry>,
    attempts: u32,
}

impl StopTheWorld {
    /// Coordinator retrying each thread up to `attempts` times.
    pub fn new(
        controller: Arc<dyn ThreadSuspendController>,
        registry: Arc<dyn ThreadRegistry>,
        attempts: u32,
    ) -> Self {
        Self {
            controller,
            registry,
            attempts: attempts.max(1),
        }
    }

    /// Stop all other mutators. Aborts if one cannot be stopped.
    pub fn suspend_all(&self) -> SuspendedWorld {
        let current = thread::current().id();
        let mut targets = Vec::new();
        self.registry.for_each_mutator_thread(&mut |thread| {
            if thread.thread_id() != current {
                targets.push(thread.clone());
            }
        });

        let mut world = SuspendedWorld {
            threads: Vec::with_capacity(targets.len()),
        };
        for thread in targets {
            let snapshot = self.suspend_with_retry(&thread);
            world.threads.push((thread, snapshot));
        }
        world
    }

    fn suspend_with_retry(&self, thread: &MutatorThread) -> ThreadSnapshot {
        let backoff = Backoff::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.controller.suspend(thread) {
                Ok(snapshot) => return snapshot,
                Err(error) if attempt >= self.attempts => fatal(FatalError::SuspendFailed {
                    thread: thread.id(),
                    attempts: attempt,
                    source: error,
                }),
                Err(_error) => {
                    #[cfg(feature = "gc_logging")]
                    tracing::warn!(target: "otter::gc", thread = thread.id(), attempt, error = %_error, "suspend attempt failed");
                    pause(&backoff);
                }
            }
        }
    }

    /// Restart every thread in `world`.
    pub fn resume_all(&self, world: SuspendedWorld) {
        for (thread, _) in world.threads {
            if let Err(error) = self.controller.resume(&thread) {
                fatal(FatalError::Invariant(format!("failed to resume thread {}: {error}", thread.id())));
            }
        }
    }
}
