//! # Iterator Validity Registry
//!
//! Tracks a container's heap-safe iterators so that moving, reassigning or
//! destroying the container invalidates all of them at once.
//!
//! ## Design
//!
//! The registry owns a small *anchor* object allocated in the heap that
//! records the container's current length. Every iterator holds a
//! [`RegistryLink`], which is a soft reference to that anchor. The anchor's
//! control block is therefore the per-container list of live iterators:
//! constructing an iterator registers a slot, cloning it registers another,
//! dropping it releases its slot.
//!
//! Invalidation destroys the anchor, which nulls every link in one control
//! block sweep, and installs a fresh anchor for iterators created afterwards.
//!
//! | Container event | Registry operation | Outstanding iterators |
//! |-----------------|--------------------|-----------------------|
//! | copy-construct | [`Clone::clone`] | untouched; the copy starts empty |
//! | copy-assign over | [`Clone::clone_from`] | invalidated |
//! | move-from | [`IteratorRegistry::take`] | invalidated |
//! | destroy | `Drop` | invalidated |
//! | length change | [`IteratorRegistry::set_size`] | bounds-checked on next access |
//!
//! In raw mode containers use [`NoRegistry`], which stores nothing.

use std::cell::Cell;
use std::fmt;

use crate::alloc::Heap;
use crate::error::{MemoryError, MemoryResult};
use crate::owning::Owning;
use crate::soft::Soft;

/// The registry interface a container is generic over.
pub trait IteratorTracking<'h>: Clone + fmt::Debug {
    /// A fresh registry with no iterators and length 0.
    fn new_in(heap: &'h Heap) -> Self;

    /// Record the container's current length.
    fn set_size(&self, len: usize);

    /// Invalidate every outstanding iterator, returning how many there were.
    fn invalidate_all(&mut self) -> usize;

    /// Move-from: invalidate every outstanding iterator and return a fresh
    /// registry with the same recorded length for the moved-to container.
    fn take(&mut self) -> Self;
}

struct Anchor {
    len: Cell<usize>,
}

/// Registry of a container's heap-safe iterators.
pub struct IteratorRegistry<'h> {
    anchor: Owning<'h, Anchor>,
}

impl<'h> IteratorRegistry<'h> {
    /// A registry with no iterators and length 0.
    pub fn new(heap: &'h Heap) -> Self {
        Self::with_size(heap, 0)
    }

    fn with_size(heap: &'h Heap, len: usize) -> Self {
        IteratorRegistry {
            anchor: heap.make_owning(Anchor { len: Cell::new(len) }),
        }
    }

    fn anchor(&self) -> &Anchor {
        match self.anchor.get() {
            Ok(anchor) => anchor,
            Err(_) => unreachable!("registry anchor is always allocated"),
        }
    }

    /// Register a new iterator.
    pub fn register(&self) -> RegistryLink<'h> {
        RegistryLink {
            anchor: self.anchor.soft(),
        }
    }

    /// The recorded container length.
    pub fn size(&self) -> usize {
        self.anchor().len.get()
    }

    /// Record the container's current length.
    pub fn set_size(&self, len: usize) {
        self.anchor().len.set(len);
    }

    /// Number of live iterators.
    pub fn len(&self) -> usize {
        self.anchor.soft_count()
    }

    /// Whether no iterator is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalidate every outstanding iterator, returning how many there were.
    pub fn invalidate_all(&mut self) -> usize {
        let invalidated = self.len();
        let len = self.size();
        self.anchor.reset_with(Anchor { len: Cell::new(len) });
        if invalidated > 0 {
            tracing::trace!(iterators = invalidated, "iterator registry invalidated");
        }
        invalidated
    }

    /// Move-from: invalidate every outstanding iterator and return a fresh
    /// registry, with the same recorded length, for the moved-to container.
    pub fn take(&mut self) -> Self {
        self.invalidate_all();
        Self::with_size(self.anchor.heap(), self.size())
    }
}

impl Clone for IteratorRegistry<'_> {
    /// Copy-construct: a fresh registry with the same recorded length.
    fn clone(&self) -> Self {
        Self::with_size(self.anchor.heap(), self.size())
    }

    /// Copy-assign: invalidate this registry's iterators and adopt the
    /// source's length.
    fn clone_from(&mut self, source: &Self) {
        self.invalidate_all();
        self.set_size(source.size());
    }
}

impl fmt::Debug for IteratorRegistry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IteratorRegistry")
            .field("size", &self.size())
            .field("iterators", &self.len())
            .finish()
    }
}

impl<'h> IteratorTracking<'h> for IteratorRegistry<'h> {
    fn new_in(heap: &'h Heap) -> Self {
        IteratorRegistry::new(heap)
    }

    fn set_size(&self, len: usize) {
        IteratorRegistry::set_size(self, len);
    }

    fn invalidate_all(&mut self) -> usize {
        IteratorRegistry::invalidate_all(self)
    }

    fn take(&mut self) -> Self {
        IteratorRegistry::take(self)
    }
}

/// An iterator's membership in its container's registry.
///
/// Also how the iterator reads the container's current length.
#[derive(Clone)]
pub struct RegistryLink<'h> {
    anchor: Soft<'h, Anchor>,
}

impl RegistryLink<'_> {
    /// The container's current length.
    ///
    /// Fails with [`MemoryError::InvalidatedIterator`] once the registry has
    /// invalidated this link.
    pub fn size(&self) -> MemoryResult<usize> {
        self.anchor
            .with(|anchor| anchor.len.get())
            .map_err(|_| MemoryError::InvalidatedIterator)
    }

    /// Check `position` against the container's current length.
    pub fn check(&self, position: usize) -> MemoryResult<usize> {
        let len = self.size()?;
        if position < len {
            Ok(len)
        } else {
            Err(MemoryError::IteratorOutOfRange { position, len })
        }
    }

    /// Whether the link is still registered.
    pub fn is_valid(&self) -> bool {
        self.anchor.is_alive()
    }

    /// Whether both links belong to the same registry generation.
    pub fn same_registry(&self, other: &RegistryLink<'_>) -> bool {
        self.is_valid() && self.anchor.as_ptr() as usize == other.anchor.as_ptr() as usize
    }
}

impl fmt::Debug for RegistryLink<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryLink").field("valid", &self.is_valid()).finish()
    }
}

/// Registry used in raw mode: stores nothing and tracks nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRegistry;

impl<'h> IteratorTracking<'h> for NoRegistry {
    fn new_in(_heap: &'h Heap) -> Self {
        NoRegistry
    }

    fn set_size(&self, _len: usize) {}

    fn invalidate_all(&mut self) -> usize {
        0
    }

    fn take(&mut self) -> Self {
        NoRegistry
    }
}
