//! Error types for reference and iterator access.
//!
//! Only conditions a caller can trigger through ordinary use are reported as
//! [`MemoryError`]. Violations of the runtime's own invariants (a corrupted
//! control block, slot index exhaustion, destroying an object while a borrow
//! of it is active, allocator exhaustion) panic instead.

use thiserror::Error;

/// A recoverable access failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Access through an empty owning reference or through a soft reference
    /// whose owner has already destroyed the object.
    #[error("access through a null or invalidated reference")]
    NullAccess,

    /// A raw pointer was found to point into a zombie block.
    ///
    /// Only reported while early zombie detection is enabled on the heap.
    #[error("early-detected access to zombie memory at {address:#x}")]
    ZombieAccess {
        /// The offending address.
        address: usize,
    },

    /// An interior soft reference was requested for an address outside the
    /// owner's object.
    #[error("address {address:#x} lies outside the owning object")]
    PointerOutOfRange {
        /// The projected address.
        address: usize,
    },

    /// A heap-safe iterator was used after its container was moved from,
    /// copy-assigned over, or destroyed.
    #[error("iterator used after its container was moved, reassigned or destroyed")]
    InvalidatedIterator,

    /// A heap-safe iterator points past the container's current length.
    #[error("iterator position {position} is out of range for length {len}")]
    IteratorOutOfRange {
        /// The iterator's position.
        position: usize,
        /// The container's length at the time of access.
        len: usize,
    },
}

/// Result alias for fallible accesses.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// A control block failed its consistency check.
///
/// Returned by [`ControlBlock::validate`](crate::control_block::ControlBlock::validate),
/// which exists for tests and debug assertions. The runtime itself treats
/// corruption as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("control block corrupted at slot {slot}: {reason}")]
pub struct CorruptionError {
    /// Global index of the first inconsistent slot.
    pub slot: usize,
    /// What was wrong with it.
    pub reason: &'static str,
}
