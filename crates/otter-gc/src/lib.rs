//! # Otter GC
//!
//! Generational, parallel, copying garbage collector.
//!
//! ## Design
//!
//! - **Nursery**: one aligned block, bump allocation through a fragment list.
//!   Survivors are promoted into the major heap by a minor collection.
//! - **Major heap**: size-aligned sections evacuated by a major collection,
//!   pinned chunks for objects that must never move, and a large object
//!   space for objects above the large-object threshold.
//! - **Roots**: precise slots from a [`RootProvider`], plus conservative
//!   scanning of stopped mutator stacks. Objects reached conservatively are
//!   pinned for the cycle instead of moved.
//! - **Barriers**: a card table for slots inside managed objects and a
//!   remembered set for barriered off-heap slots.
//! - **Parallelism**: the driving thread and a persistent worker pool share
//!   gray-queue segments through a lock-free ring; copy races are settled by
//!   a compare-and-swap on the header word.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod backend;
pub mod card_table;
pub mod config;
pub mod driver;
pub mod error;
pub mod object;
pub mod remset;
#[cfg(target_os = "linux")]
pub mod signal;
pub mod stats;
pub mod stw;
pub mod verify;

mod gray_queue;
mod los;
mod major;
mod memory;
mod nursery;
mod pinned_chunk;
mod region;
mod scanner;
mod workers;

pub use backend::{BackendKind, GcBackend, NullBackend, create_backend};
pub use card_table::CardTable;
pub use config::{GcConfig, SuspendMode};
pub use driver::{CollectorContext, CyclePhase, RootKind, RootProvider};
pub use error::{ConfigError, FatalError, GcError, OomCallback, SuspendError};
pub use object::{Descriptor, HeaderState, LiveHeader, ObjectModel, ObjectRef, Slot};
pub use remset::{RememberedSet, WriteBarrier};
pub use scanner::TracerStats;
#[cfg(target_os = "linux")]
pub use signal::SignalSuspendController;
pub use stats::{CycleStats, GcStats, Generation};
pub use stw::{
    CriticalRegion, MutatorGuard, MutatorRegistry, MutatorThread, SafepointController, StopTheWorld,
    SuspendedWorld, ThreadRegistry, ThreadSnapshot, ThreadState, ThreadSuspendController,
    safepoint,
};
pub use verify::{HeapCorruption, VerifyReport};
