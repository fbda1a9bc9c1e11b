//! # SafeMemory Runtime
//!
//! Deterministic use-after-free detection for heap objects reached through
//! many references, without a tracing collector and without reference
//! counting on access.
//!
//! The runtime provides:
//!
//! - **Owning references**: sole owners that invalidate every soft
//!   reference when they destroy their object
//! - **Soft references**: non-owning references that turn null, observably
//!   and without touching freed memory, once their object is gone
//! - **Control blocks**: per-object slot tables with `O(1)` registration
//! - **Zombie allocator**: freed objects stay reserved until an explicit reap
//! - **Zombie detector**: classifies raw addresses that point into zombies
//! - **Iterator registry**: invalidates a container's heap-safe iterators
//!   when the container is moved, reassigned or destroyed
//! - **Safety modes**: the same code compiles to checked references or to
//!   plain pointers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SAFEMEMORY RUNTIME                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Iterator   │  │ Safety modes │  │    Naked     │          │
//! │  │   registry   │  │  (mode.rs)   │  │   pointers   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │  ┌──────────────┐  ┌──────────────┐         │                   │
//! │  │    Owning    │──│     Soft     │         │                   │
//! │  │ (owning.rs)  │  │  (soft.rs)   │         │                   │
//! │  └──────────────┘  └──────────────┘         │                   │
//! │         │                 │                 │                   │
//! │  ┌──────────────┐  ┌──────────────────────────────────┐        │
//! │  │   Control    │  │   Heap: zombie allocator and     │        │
//! │  │    block     │  │   zombie detector (alloc.rs)     │        │
//! │  └──────────────┘  └──────────────────────────────────┘        │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use safememory_runtime::{Heap, MemoryError};
//!
//! let mut heap = Heap::new();
//! {
//!     let mut owner = heap.make_owning(vec![1, 2, 3]);
//!     let soft = owner.soft();
//!     assert_eq!(soft.with(|v| v.len()), Ok(3));
//!
//!     owner.reset();
//!     assert_eq!(soft.with(|v| v.len()), Err(MemoryError::NullAccess));
//! }
//! // No reference into the heap is left, so zombies can be reaped.
//! assert_eq!(heap.kill_all_zombies(), 1);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod config;
pub mod control_block;
pub mod error;
pub mod log;
pub mod mode;
pub mod naked;
mod object;
pub mod owning;
pub mod registry;
pub mod soft;

// Re-exports
pub use alloc::{BlockState, Heap, HeapStats};
pub use config::{ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use control_block::{ControlBlock, SlotIndex, INLINE_SLOTS};
pub use error::{CorruptionError, MemoryError, MemoryResult};
pub use mode::{Checked, MemorySafety, OwningPointer, Raw, RawOwning, RawSoft, SafetyMode, SoftPointer};
pub use naked::NakedPtr;
pub use owning::Owning;
pub use registry::{IteratorRegistry, IteratorTracking, NoRegistry, RegistryLink};
pub use soft::{Soft, SoftRef};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a heap configured by `config`, installing logging first.
///
/// Logging is only installed if no global `tracing` subscriber exists yet.
pub fn init(config: &RuntimeConfig) -> Heap {
    log::init(&config.log);
    tracing::debug!(
        version = VERSION,
        early_detection = config.zombie.early_detection,
        "safememory runtime initialized"
    );
    Heap::with_config(config)
}

/// Create a heap configured from `SAFEMEMORY_*` environment variables.
///
/// See [`RuntimeConfig::from_env`] for the supported variables.
pub fn init_from_env() -> Heap {
    init(&RuntimeConfig::from_env())
}
