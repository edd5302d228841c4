//! Collector error types and the fatal-abort path.
//!
//! Configuration and controller installation report ordinary `Result`s.
//! Everything that goes wrong once the heap is live (out of memory, a broken
//! heap invariant, a thread that cannot be stopped) aborts the process: a
//! moving collector has no consistent state to unwind to halfway through a
//! cycle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while parsing or validating a [`GcConfig`](crate::GcConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A `key=value` entry had a value that could not be parsed.
    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue {
        /// Option name
        key: String,
        /// Offending value
        value: String,
    },
    /// The option name is not recognised.
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    /// A size that must be a power of two is not.
    #[error("{name} must be a power of two, got {value}")]
    NotPowerOfTwo {
        /// Option name
        name: &'static str,
        /// Offending value
        value: usize,
    },
    /// A size is below its minimum.
    #[error("{name} must be at least {min}, got {value}")]
    TooSmall {
        /// Option name
        name: &'static str,
        /// Minimum accepted value
        min: usize,
        /// Offending value
        value: usize,
    },
    /// A value is above its maximum.
    #[error("{name} must be at most {max}, got {value}")]
    TooLarge {
        /// Option name
        name: &'static str,
        /// Maximum accepted value
        max: usize,
        /// Offending value
        value: usize,
    },
    /// The requested backend is not available.
    #[error("backend `{0}` is not supported")]
    UnsupportedBackend(String),
}

/// Errors reported by a [`ThreadSuspendController`](crate::ThreadSuspendController).
///
/// The coordinator retries these; only repeated failure becomes fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SuspendError {
    /// The OS refused to deliver the suspend or restart signal.
    #[error("failed to signal thread {thread}: errno {errno}")]
    Signal {
        /// Registry id of the target thread
        thread: u64,
        /// OS error code
        errno: i32,
    },
    /// The thread did not acknowledge the request in time.
    #[error("thread {thread} did not acknowledge within {timeout:?}")]
    Timeout {
        /// Registry id of the target thread
        thread: u64,
        /// Time waited
        timeout: Duration,
    },
    /// Installing the signal handlers failed.
    #[error("failed to install suspend handlers: errno {0}")]
    Install(i32),
    /// The thread is not in a state the request applies to.
    #[error("thread {0} is not in a suspendable state")]
    InvalidState(u64),
}

/// Umbrella error for collector construction.
#[derive(Debug, Error)]
pub enum GcError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The suspend controller could not be set up.
    #[error(transparent)]
    Suspend(#[from] SuspendError),
}

/// Conditions that terminate the process.
#[derive(Debug, Error)]
pub enum FatalError {
    /// The system allocator could not provide heap memory.
    #[error("out of memory: failed to obtain {requested} bytes ({committed} bytes committed)")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Bytes committed before the request
        committed: usize,
    },
    /// Growing the heap would exceed the configured maximum.
    #[error("heap limit of {limit} bytes exceeded by a request of {requested} bytes")]
    HeapLimit {
        /// Configured maximum heap size
        limit: usize,
        /// Bytes requested
        requested: usize,
    },
    /// A mutator thread could not be stopped.
    #[error("could not suspend thread {thread} after {attempts} attempts: {source}")]
    SuspendFailed {
        /// Registry id of the thread
        thread: u64,
        /// Attempts made
        attempts: u32,
        /// Last controller error
        #[source]
        source: SuspendError,
    },
    /// A heap invariant does not hold.
    #[error("heap invariant violated: {0}")]
    Invariant(String),
}

impl FatalError {
    /// Bytes requested when the error is a memory failure.
    pub fn requested_bytes(&self) -> Option<usize> {
        match self {
            FatalError::OutOfMemory { requested, .. } | FatalError::HeapLimit { requested, .. } => {
                Some(*requested)
            }
            _ => None,
        }
    }
}

/// Callback invoked with the failing request before an out-of-memory abort.
#[derive(Clone)]
pub struct OomCallback(Arc<dyn Fn(&FatalError) + Send + Sync>);

impl OomCallback {
    /// Wrap a closure.
    pub fn new(callback: impl Fn(&FatalError) + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    pub(crate) fn invoke(&self, error: &FatalError) {
        (self.0)(error)
    }
}

impl fmt::Debug for OomCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OomCallback(..)")
    }
}

/// Log `error` and abort the process.
#[cold]
#[inline(never)]
pub fn fatal(error: FatalError) -> ! {
    #[cfg(feature = "gc_logging")]
    tracing::error!(target: "otter::gc", %error, "fatal collector error");
    eprintln!("otter-gc: fatal: {error}");
    std::process::abort()
}

/// Abort with [`FatalError::Invariant`] when the condition is false.
///
/// Unlike `debug_assert!` this is never compiled out.
macro_rules! gc_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::error::fatal($crate::error::FatalError::Invariant(format!($($arg)+)))
        }
    };
}

pub(crate) use gc_assert;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_bytes() {
        let oom = FatalError::OutOfMemory {
            requested: 4096,
            committed: 0,
        };
        assert_eq!(oom.requested_bytes(), Some(4096));
        assert_eq!(FatalError::Invariant("x".into()).requested_bytes(), None);
    }

    #[test]
    fn test_error_display() {
        let err = ConfigError::NotPowerOfTwo {
            name: "nursery-size",
            value: 3000,
        };
        assert_eq!(err.to_string(), "nursery-size must be a power of two, got 3000");

        let err: GcError = SuspendError::InvalidState(7).into();
        assert_eq!(err.to_string(), "thread 7 is not in a suspendable state");
    }

    #[test]
    fn test_oom_callback_invoked() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let cb = OomCallback::new(move |e| {
            seen2.store(e.requested_bytes().unwrap_or(0), Ordering::SeqCst);
        });
        cb.invoke(&FatalError::HeapLimit {
            limit: 10,
            requested: 64,
        });
        assert_eq!(seen.load(Ordering::SeqCst), 64);
        assert_eq!(format!("{cb:?}"), "OomCallback(..)");
    }
}
