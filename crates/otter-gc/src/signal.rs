//! Signal-based thread suspension (Linux).
//!
//! The collector sends `SIGPWR` to a registered thread. Its handler records
//! the interrupted stack pointer and register file, publishes `Suspended`,
//! then sleeps in `sigsuspend` until the state becomes `ResumeRequested`
//! and a `SIGXCPU` wakes it. Everything the handler touches is an atomic or
//! a const thread local, so it is async-signal-safe.
//!
//! A thread inside a [`CriticalRegion`](crate::CriticalRegion) is left
//! running: it holds a lock the stopped world may need, and parks through
//! its safepoint as soon as the region ends. A thread can also reach a
//! safepoint before the signal arrives; it then parks on its condvar, so
//! resuming always wakes that too.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::SuspendError;
use crate::stw::{
    MAX_SAVED_REGISTERS, MutatorThread, ThreadSnapshot, ThreadState, ThreadSuspendController,
    await_suspended, request_suspend, with_current,
};

/// Signal that stops a mutator.
pub const SUSPEND_SIGNAL: libc::c_int = libc::SIGPWR;
/// Signal that wakes a stopped mutator.
pub const RESTART_SIGNAL: libc::c_int = libc::SIGXCPU;

/// Stops mutators asynchronously with POSIX signals.
#[derive(Debug, Clone)]
pub struct SignalSuspendController {
    timeout: Duration,
}

impl SignalSuspendController {
    /// Install the handlers (once per process) and build a controller that
    /// waits up to `timeout` per attempt.
    pub fn new(timeout: Duration) -> Result<Self, SuspendError> {
        install_handlers()?;
        Ok(Self { timeout })
    }
}

impl ThreadSuspendController for SignalSuspendController {
    fn suspend(&self, thread: &MutatorThread) -> Result<ThreadSnapshot, SuspendError> {
        let deadline = Instant::now() + self.timeout;
        request_suspend(thread, deadline)?;
        // SAFETY: the pthread handle belongs to a registered, live thread
        let rc = unsafe { libc::pthread_kill(thread.pthread(), SUSPEND_SIGNAL) };
        if rc != 0 {
            thread.transition(ThreadState::SuspendRequested, ThreadState::Running);
            return Err(SuspendError::Signal {
                thread: thread.id(),
                errno: rc,
            });
        }
        await_suspended(thread, deadline, self.timeout)
    }

    fn resume(&self, thread: &MutatorThread) -> Result<(), SuspendError> {
        if !thread.transition(ThreadState::Suspended, ThreadState::ResumeRequested) {
            return Err(SuspendError::InvalidState(thread.id()));
        }
        // SAFETY: as in suspend
        let rc = unsafe { libc::pthread_kill(thread.pthread(), RESTART_SIGNAL) };
        if rc != 0 {
            return Err(SuspendError::Signal {
                thread: thread.id(),
                errno: rc,
            });
        }
        // a thread that reached a safepoint first is parked on its condvar
        thread.wake();
        Ok(())
    }
}

fn install_handlers() -> Result<(), SuspendError> {
    static INSTALLED: OnceLock<Result<(), SuspendError>> = OnceLock::new();
    INSTALLED
        .get_or_init(|| {
            // SAFETY: the sigaction structs are fully initialised before use
            // and the handlers are extern "C" functions with the SA_SIGINFO
            // signature.
            unsafe {
                let mut suspend: libc::sigaction = std::mem::zeroed();
                suspend.sa_sigaction = suspend_handler as libc::sighandler_t;
                suspend.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
                libc::sigfillset(&mut suspend.sa_mask);
                if libc::sigaction(SUSPEND_SIGNAL, &suspend, std::ptr::null_mut()) != 0 {
                    return Err(SuspendError::Install(last_errno()));
                }

                let mut restart: libc::sigaction = std::mem::zeroed();
                restart.sa_sigaction = restart_handler as libc::sighandler_t;
                restart.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
                libc::sigemptyset(&mut restart.sa_mask);
                if libc::sigaction(RESTART_SIGNAL, &restart, std::ptr::null_mut()) != 0 {
                    return Err(SuspendError::Install(last_errno()));
                }
            }
            #[cfg(feature = "gc_logging")]
            tracing::debug!(target: "otter::gc", "suspend signal handlers installed");
            Ok(())
        })
        .clone()
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

extern "C" fn suspend_handler(_signal: libc::c_int, _info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    // SAFETY: __errno_location returns the calling thread's errno slot
    let saved_errno = unsafe { *libc::__errno_location() };
    let marker = 0usize;
    let stack_pointer = std::hint::black_box(&marker) as *const usize as usize;

    with_current(|thread| {
        // A thread inside a critical region parks itself when it leaves.
        if thread.state() != ThreadState::SuspendRequested || thread.in_critical_region() {
            return;
        }
        let mut registers = [0usize; MAX_SAVED_REGISTERS];
        let (ip, count) = read_context(context, &mut registers);
        thread.record_stop(stack_pointer, ip, &registers[..count]);
        if !thread.transition(ThreadState::SuspendRequested, ThreadState::Suspended) {
            return;
        }

        // SAFETY: mask is initialised by sigfillset before use
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut mask);
            libc::sigdelset(&mut mask, RESTART_SIGNAL);
            while thread.state() != ThreadState::ResumeRequested {
                libc::sigsuspend(&mask);
            }
        }
        thread.set_state(ThreadState::Running);
    });

    // SAFETY: as above
    unsafe { *libc::__errno_location() = saved_errno };
}

extern "C" fn restart_handler(_signal: libc::c_int, _info: *mut libc::siginfo_t, _context: *mut libc::c_void) {
    // only interrupts sigsuspend
}

/// Copy the interrupted register file. Returns the instruction pointer and
/// the number of registers written.
#[cfg(all(target_arch = "x86_64", target_env = "gnu"))]
fn read_context(context: *mut libc::c_void, out: &mut [usize; MAX_SAVED_REGISTERS]) -> (usize, usize) {
    if context.is_null() {
        return (0, 0);
    }
    // SAFETY: the kernel passes a ucontext_t to SA_SIGINFO handlers
    let gregs = unsafe { &(*(context as *const libc::ucontext_t)).uc_mcontext.gregs };
    let count = gregs.len().min(MAX_SAVED_REGISTERS);
    for (slot, &value) in out.iter_mut().zip(gregs.iter()).take(count) {
        *slot = value as usize;
    }
    (gregs[libc::REG_RIP as usize] as usize, count)
}

#[cfg(all(target_arch = "aarch64", target_env = "gnu"))]
fn read_context(context: *mut libc::c_void, out: &mut [usize; MAX_SAVED_REGISTERS]) -> (usize, usize) {
    if context.is_null() {
        return (0, 0);
    }
    // SAFETY: the kernel passes a ucontext_t to SA_SIGINFO handlers
    let mcontext = unsafe { &(*(context as *const libc::ucontext_t)).uc_mcontext };
    let count = mcontext.regs.len().min(MAX_SAVED_REGISTERS);
    for (slot, &value) in out.iter_mut().zip(mcontext.regs.iter()).take(count) {
        *slot = value as usize;
    }
    (mcontext.pc as usize, count)
}

#[cfg(not(all(any(target_arch = "x86_64", target_arch = "aarch64"), target_env = "gnu")))]
fn read_context(_context: *mut libc::c_void, _out: &mut [usize; MAX_SAVED_REGISTERS]) -> (usize, usize) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stw::MutatorRegistry;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SENTINEL: usize = 0x5eed_0bad_cafe_f00d;

    #[test]
    fn test_signal_suspend_captures_stack() {
        let controller = SignalSuspendController::new(Duration::from_secs(5)).unwrap();
        let registry = MutatorRegistry::new();
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let guard = registry.register_current();
                let words = [SENTINEL; 4];
                tx.send(guard.thread().clone()).unwrap();
                // spins without ever polling a safepoint
                while !stop.load(Ordering::Acquire) {
                    std::hint::black_box(&words);
                    std::hint::spin_loop();
                }
            })
        };
        let thread = rx.recv().unwrap();

        let snapshot = controller.suspend(&thread).unwrap();
        assert_eq!(thread.state(), ThreadState::Suspended);
        let (low, high) = snapshot.stack_range();
        assert!(low < high);
        let found = (low..high)
            .step_by(std::mem::size_of::<usize>())
            // SAFETY: the thread is stopped and its stack is mapped
            .any(|addr| unsafe { std::ptr::read(addr as *const usize) } == SENTINEL);
        assert!(found, "sentinel not found between {low:#x} and {high:#x}");

        controller.resume(&thread).unwrap();
        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_critical_region_defers_signal_stop() {
        let controller = SignalSuspendController::new(Duration::from_secs(5)).unwrap();
        let registry = MutatorRegistry::new();
        let leave = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = {
            let registry = registry.clone();
            let (leave, stop) = (leave.clone(), stop.clone());
            std::thread::spawn(move || {
                let guard = registry.register_current();
                {
                    let _region = crate::stw::CriticalRegion::enter();
                    tx.send(guard.thread().clone()).unwrap();
                    while !leave.load(Ordering::Acquire) {
                        std::hint::spin_loop();
                    }
                }
                while !stop.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
            })
        };
        let thread = rx.recv().unwrap();

        let suspender = {
            let (controller, thread) = (controller.clone(), thread.clone());
            std::thread::spawn(move || controller.suspend(&thread))
        };
        std::thread::sleep(Duration::from_millis(50));
        // the handler declined while the region was open
        assert_eq!(thread.state(), ThreadState::SuspendRequested);

        leave.store(true, Ordering::Release);
        let snapshot = suspender.join().unwrap().unwrap();
        assert_eq!(thread.state(), ThreadState::Suspended);
        assert_ne!(snapshot.stack_pointer, 0);

        controller.resume(&thread).unwrap();
        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_resume_wakes_thread_parked_at_safepoint() {
        let controller = SignalSuspendController::new(Duration::from_secs(5)).unwrap();
        let registry = MutatorRegistry::new();
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        let handle = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let guard = registry.register_current();
                tx.send(guard.thread().clone()).unwrap();
                while !stop.load(Ordering::Acquire) {
                    crate::stw::safepoint();
                    std::hint::spin_loop();
                }
                done_tx.send(()).unwrap();
            })
        };
        let thread = rx.recv().unwrap();

        // request without a signal, so the thread parks on its condvar
        let deadline = Instant::now() + Duration::from_secs(5);
        request_suspend(&thread, deadline).unwrap();
        await_suspended(&thread, deadline, Duration::from_secs(5)).unwrap();

        stop.store(true, Ordering::Release);
        controller.resume(&thread).unwrap();
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("mutator still parked after resume");
        handle.join().unwrap();
    }

    #[test]
    fn test_handlers_install_once() {
        assert!(install_handlers().is_ok());
        assert!(install_handlers().is_ok());
    }
}
