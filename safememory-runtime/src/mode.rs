//! # Safety Modes
//!
//! Every reference and container type can be instantiated in one of two
//! modes, fixed at compile time through a [`SafetyMode`] type parameter:
//!
//! | Mode | Owning | Soft | Iterator registry |
//! |------|--------|------|-------------------|
//! | [`Checked`] | [`Owning`] (control block, zombie allocation) | [`Soft`] (registered, nulls on destruction) | [`IteratorRegistry`] |
//! | [`Raw`] | [`RawOwning`] (a bare boxed value, freed immediately) | [`RawSoft`] (a bare pointer) | [`NoRegistry`] |
//!
//! Code written against [`OwningPointer`] and [`SoftPointer`] compiles in
//! either mode. Raw mode adds no storage and no checks: a [`RawOwning`] and a
//! [`RawSoft`] are each exactly one pointer wide, and dereferencing a
//! [`RawSoft`] is `unsafe`.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::alloc::Heap;
use crate::error::{MemoryError, MemoryResult};
use crate::owning::Owning;
use crate::registry::{IteratorRegistry, IteratorTracking, NoRegistry};
use crate::soft::Soft;

/// The two-valued safety setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySafety {
    /// Liveness-checked references.
    Safe,
    /// Plain pointers.
    None,
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Checked {}
    impl Sealed for super::Raw {}
}

/// Selects a reference family at compile time.
pub trait SafetyMode: sealed::Sealed + Copy + Default + fmt::Debug + 'static {
    /// The mode's safety setting.
    const SAFETY: MemorySafety;

    /// Owning reference type.
    type Owning<'h, T: 'h>: OwningPointer<'h, T>;

    /// Soft reference type.
    type Soft<'h, T: 'h>: SoftPointer<'h, T, Owner = Self::Owning<'h, T>>;

    /// Iterator registry type for containers.
    type Registry<'h>: IteratorTracking<'h>;
}

/// Liveness-checked references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checked;

/// Plain, unchecked pointers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Raw;

impl SafetyMode for Checked {
    const SAFETY: MemorySafety = MemorySafety::Safe;
    type Owning<'h, T: 'h> = Owning<'h, T>;
    type Soft<'h, T: 'h> = Soft<'h, T>;
    type Registry<'h> = IteratorRegistry<'h>;
}

impl SafetyMode for Raw {
    const SAFETY: MemorySafety = MemorySafety::None;
    type Owning<'h, T: 'h> = RawOwning<'h, T>;
    type Soft<'h, T: 'h> = RawSoft<'h, T>;
    type Registry<'h> = NoRegistry;
}

// ============================================================================
// Shared interface
// ============================================================================

/// Operations common to both owning reference types.
pub trait OwningPointer<'h, T>: Sized {
    /// Allocate `value` in `heap`.
    fn new_in(heap: &'h Heap, value: T) -> Self;

    /// An owner of nothing.
    fn empty(heap: &'h Heap) -> Self;

    /// Borrow the owned value.
    fn get(&self) -> MemoryResult<&T>;

    /// Whether nothing is owned.
    fn is_null(&self) -> bool;

    /// Destroy the owned value, if any.
    fn reset(&mut self);

    /// Raw pointer to the value, or null.
    fn as_ptr(&self) -> *const T;
}

/// Operations common to both soft reference types.
pub trait SoftPointer<'h, T>: Sized + Clone + Default {
    /// The matching owning reference type.
    type Owner: OwningPointer<'h, T>;

    /// A soft reference to `owner`'s value.
    fn from_owning(owner: &Self::Owner) -> Self;

    /// Whether the reference is null. A raw soft reference cannot tell
    /// whether its target was destroyed, only whether it was ever set.
    fn is_null(&self) -> bool;

    /// Raw pointer to the value, or null.
    fn as_ptr(&self) -> *const T;
}

impl<'h, T> OwningPointer<'h, T> for Owning<'h, T> {
    fn new_in(heap: &'h Heap, value: T) -> Self {
        heap.make_owning(value)
    }

    fn empty(heap: &'h Heap) -> Self {
        Owning::empty(heap)
    }

    fn get(&self) -> MemoryResult<&T> {
        Owning::get(self)
    }

    fn is_null(&self) -> bool {
        Owning::is_null(self)
    }

    fn reset(&mut self) {
        Owning::reset(self)
    }

    fn as_ptr(&self) -> *const T {
        Owning::as_ptr(self)
    }
}

impl<'h, T> SoftPointer<'h, T> for Soft<'h, T> {
    type Owner = Owning<'h, T>;

    fn from_owning(owner: &Owning<'h, T>) -> Self {
        owner.soft()
    }

    fn is_null(&self) -> bool {
        Soft::is_null(self)
    }

    fn as_ptr(&self) -> *const T {
        Soft::as_ptr(self)
    }
}

// ============================================================================
// Raw family
// ============================================================================

/// Owning reference without a control block.
///
/// A plain boxed value: no block prefix, no heap bookkeeping. The heap only
/// bounds the lifetime so both modes share one signature. The value is freed
/// as soon as the owner resets; nothing tracks the raw soft references taken
/// from it.
pub struct RawOwning<'h, T> {
    ptr: Option<NonNull<T>>,
    _heap: PhantomData<&'h Heap>,
    _owns: PhantomData<T>,
}

impl<'h, T> RawOwning<'h, T> {
    /// Allocate `value` in `heap`.
    pub fn new_in(_heap: &'h Heap, value: T) -> Self {
        RawOwning {
            ptr: Some(NonNull::from(Box::leak(Box::new(value)))),
            _heap: PhantomData,
            _owns: PhantomData,
        }
    }

    /// An owner of nothing.
    pub fn empty(_heap: &'h Heap) -> Self {
        RawOwning {
            ptr: None,
            _heap: PhantomData,
            _owns: PhantomData,
        }
    }

    /// Borrow the owned value.
    pub fn get(&self) -> MemoryResult<&T> {
        match self.ptr {
            // SAFETY: owned and live until reset, which needs `&mut self`.
            Some(ptr) => Ok(unsafe { ptr.as_ref() }),
            None => Err(MemoryError::NullAccess),
        }
    }

    /// Whether nothing is owned.
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// Raw pointer to the value, or null.
    pub fn as_ptr(&self) -> *const T {
        self.ptr.map_or(ptr::null(), |p| p.as_ptr() as *const T)
    }

    /// Drop the value and free its memory immediately.
    pub fn reset(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: leaked from a `Box` in `new_in` and taken out of
            // `self.ptr`, so reclaimed once.
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }

    /// Exchange the values owned by `self` and `other`.
    pub fn swap(&mut self, other: &mut RawOwning<'h, T>) {
        mem::swap(&mut self.ptr, &mut other.ptr);
    }

    /// A raw soft reference to the value.
    pub fn soft(&self) -> RawSoft<'h, T> {
        RawSoft {
            ptr: self.ptr,
            _heap: PhantomData,
        }
    }
}

impl<T> Drop for RawOwning<'_, T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: fmt::Debug> fmt::Debug for RawOwning<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Ok(value) => f.debug_tuple("RawOwning").field(value).finish(),
            Err(_) => f.write_str("RawOwning(null)"),
        }
    }
}

impl<'h, T> OwningPointer<'h, T> for RawOwning<'h, T> {
    fn new_in(heap: &'h Heap, value: T) -> Self {
        RawOwning::new_in(heap, value)
    }

    fn empty(heap: &'h Heap) -> Self {
        RawOwning::empty(heap)
    }

    fn get(&self) -> MemoryResult<&T> {
        RawOwning::get(self)
    }

    fn is_null(&self) -> bool {
        RawOwning::is_null(self)
    }

    fn reset(&mut self) {
        RawOwning::reset(self)
    }

    fn as_ptr(&self) -> *const T {
        RawOwning::as_ptr(self)
    }
}

/// A bare, untracked pointer. Exactly one pointer wide.
pub struct RawSoft<'h, T> {
    ptr: Option<NonNull<T>>,
    _heap: PhantomData<&'h Heap>,
}

impl<'h, T> RawSoft<'h, T> {
    /// A null reference.
    pub fn null() -> Self {
        RawSoft {
            ptr: None,
            _heap: PhantomData,
        }
    }

    /// Whether the pointer is null.
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// The pointer, or null.
    pub fn as_ptr(&self) -> *const T {
        self.ptr.map_or(ptr::null(), |p| p.as_ptr() as *const T)
    }

    /// Dereference without any check.
    ///
    /// # Safety
    ///
    /// The owner must still hold the value, and must not reset it while the
    /// returned reference is alive.
    pub unsafe fn get(&self) -> &T {
        match self.ptr {
            Some(ptr) => &*ptr.as_ptr(),
            None => panic!("dereferenced a null raw soft reference"),
        }
    }
}

impl<T> Clone for RawSoft<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RawSoft<'_, T> {}

impl<T> Default for RawSoft<'_, T> {
    fn default() -> Self {
        RawSoft::null()
    }
}

impl<T> PartialEq for RawSoft<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> fmt::Debug for RawSoft<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RawSoft").field(&self.as_ptr()).finish()
    }
}

impl<'h, T> SoftPointer<'h, T> for RawSoft<'h, T> {
    type Owner = RawOwning<'h, T>;

    fn from_owning(owner: &RawOwning<'h, T>) -> Self {
        owner.soft()
    }

    fn is_null(&self) -> bool {
        RawSoft::is_null(self)
    }

    fn as_ptr(&self) -> *const T {
        RawSoft::as_ptr(self)
    }
}
