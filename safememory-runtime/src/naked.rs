//! Unchecked pointers with zombie detection.
//!
//! A [`NakedPtr`] is a plain address into a heap object that skips the
//! control block entirely. It is the fast path: no registration, no
//! invalidation. The only protection left is the heap's zombie detector,
//! which turns an access to a destroyed object into
//! [`MemoryError::ZombieAccess`](crate::error::MemoryError::ZombieAccess)
//! while early detection is on.

use std::fmt;
use std::ptr::{self, NonNull};

use crate::alloc::Heap;
use crate::error::MemoryResult;

/// A raw pointer into a heap, checked only against the zombie detector.
pub struct NakedPtr<'h, T> {
    heap: &'h Heap,
    ptr: *const T,
}

impl<'h, T> NakedPtr<'h, T> {
    /// Wrap `ptr`, which should point into a block of `heap`.
    pub fn new(heap: &'h Heap, ptr: *const T) -> Self {
        NakedPtr { heap, ptr }
    }

    /// A null pointer.
    pub fn null(heap: &'h Heap) -> Self {
        Self::new(heap, ptr::null())
    }

    /// Whether the pointer is null.
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// The wrapped address.
    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }

    /// Run the zombie detector on the pointer.
    ///
    /// `Ok` means only that the address is not known to be a zombie.
    pub fn check(&self) -> MemoryResult<NonNull<T>> {
        self.heap.dezombiefy(self.ptr)
    }

    /// Dereference after the zombie check.
    ///
    /// # Safety
    ///
    /// The pointee must be live and not mutably aliased for `'a`. The zombie
    /// check catches a destroyed pointee only while early detection is on,
    /// and never catches one whose value is being dropped.
    pub unsafe fn get<'a>(&'a self) -> MemoryResult<&'a T> {
        self.check().map(|p| &*p.as_ptr())
    }
}

impl<T> Clone for NakedPtr<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NakedPtr<'_, T> {}

impl<T> PartialEq for NakedPtr<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> fmt::Debug for NakedPtr<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NakedPtr").field(&self.ptr).finish()
    }
}
