//! # Soft References
//!
//! A [`Soft`] reference points at an object without owning it. Each live
//! soft reference occupies exactly one slot in the object's control block:
//! cloning registers a new slot, [`Soft::take`] hands the slot to a new
//! holder through `reset_ptr`, and dropping releases it.
//!
//! Once the owner destroys the object every soft reference reports null, and
//! access fails with [`MemoryError::NullAccess`]. The object's block stays
//! reserved as a zombie until the heap is reaped, which the heap's borrow
//! rules only allow after every soft reference is gone, so the null check
//! never reads reused memory.
//!
//! A soft reference may also point at a part of its object
//! ([`Owning::soft_field`]). It registers with the object's control block
//! like any other and is nulled with it.
//!
//! ## Borrowing
//!
//! [`Soft::get`] returns a [`SoftRef`] guard. While any guard is alive the
//! owner cannot destroy the object; trying to is a fatal error.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::ptr::{self, NonNull};

use crate::alloc::Heap;
use crate::control_block::{RefToken, SlotIndex};
use crate::error::{MemoryError, MemoryResult};
use crate::object::{ObjectBox, ObjectHeader, ObjectState};
use crate::owning::Owning;

struct Link<T> {
    header: NonNull<ObjectHeader>,
    value: NonNull<T>,
    slot: SlotIndex,
    token: RefToken,
}

impl<T> Link<T> {
    fn header<'a>(&self) -> &'a ObjectHeader {
        // SAFETY: blocks are not reaped while a `'h` reference exists.
        unsafe { ObjectHeader::from_ptr(self.header) }
    }
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Link<T> {}

/// Non-owning reference that turns null when its object is destroyed.
pub struct Soft<'h, T> {
    link: Option<Link<T>>,
    _heap: PhantomData<&'h Heap>,
}

impl<'h, T> Soft<'h, T> {
    /// A soft reference to nothing.
    pub fn null() -> Self {
        Soft {
            link: None,
            _heap: PhantomData,
        }
    }

    /// Register a soft reference to `owner`'s object (null if `owner` is empty).
    pub fn new(owner: &Owning<'h, T>) -> Self {
        owner.soft()
    }

    /// Register with the object whose header is `header`, pointing at `value`.
    ///
    /// # Safety
    ///
    /// `header` must be the header of an object block of a heap borrowed for
    /// `'h`, and `value` must point into that block's value.
    pub(crate) unsafe fn register(header: NonNull<ObjectHeader>, value: NonNull<T>) -> Self {
        match ObjectHeader::from_ptr(header).register() {
            Some((slot, token)) => Soft {
                link: Some(Link {
                    header,
                    value,
                    slot,
                    token,
                }),
                _heap: PhantomData,
            },
            None => Soft::null(),
        }
    }

    /// Reconstruct a soft reference from a pointer to a heap object's value.
    ///
    /// The control block is found at a fixed offset before the value.
    ///
    /// # Safety
    ///
    /// `value` must point at the value of an object created by
    /// [`Heap::make_owning`] (or [`Heap::make_owning_cyclic`]) on a heap that
    /// stays borrowed for `'h`, and that object's block must not have been
    /// reaped.
    pub unsafe fn from_value_ptr(value: NonNull<T>) -> Self {
        let block = ObjectBox::from_value_ptr(value);
        Self::register(ObjectBox::header_ptr(block), value)
    }

    fn state(&self) -> Option<ObjectState> {
        self.link.map(|link| link.header().state.get())
    }

    /// Whether the object is gone (or this reference never had one).
    ///
    /// Also true while the object is still under construction.
    pub fn is_null(&self) -> bool {
        !self.is_alive()
    }

    /// Whether the object is live and accessible.
    pub fn is_alive(&self) -> bool {
        self.state() == Some(ObjectState::Live)
    }

    /// Raw pointer to the target, or null unless the object is live.
    pub fn as_ptr(&self) -> *const T {
        match self.link {
            Some(link) if self.is_alive() => link.value.as_ptr(),
            _ => ptr::null(),
        }
    }

    /// Borrow the target.
    ///
    /// Fails with [`MemoryError::NullAccess`] if the object is gone.
    pub fn get(&self) -> MemoryResult<SoftRef<'_, T>> {
        match self.link {
            Some(link) if self.is_alive() => {
                let header = link.header();
                header.borrows.set(header.borrows.get() + 1);
                Ok(SoftRef {
                    header: link.header,
                    value: link.value,
                    _borrow: PhantomData,
                })
            }
            _ => Err(MemoryError::NullAccess),
        }
    }

    /// Run `f` on the target.
    pub fn with<R, F>(&self, f: F) -> MemoryResult<R>
    where
        F: FnOnce(&T) -> R,
    {
        let value = self.get()?;
        Ok(f(&value))
    }

    /// Move this reference's registration into a new holder, leaving `self` null.
    ///
    /// The slot is re-targeted in place, so the object's registration count
    /// does not change.
    pub fn take(&mut self) -> Soft<'h, T> {
        let Some(link) = self.link.take() else {
            return Soft::null();
        };
        let header = link.header();
        if header.state.get() == ObjectState::Destroyed {
            return Soft::null();
        }
        let token = {
            let mut control = header.control.borrow_mut();
            let token = control.mint_token();
            control.reset_ptr(link.slot, token);
            token
        };
        Soft {
            link: Some(Link { token, ..link }),
            _heap: PhantomData,
        }
    }

    /// Release the registration, leaving `self` null.
    pub fn reset(&mut self) {
        *self = Soft::null();
    }

    /// Exchange the targets of `self` and `other`.
    pub fn swap(&mut self, other: &mut Soft<'h, T>) {
        mem::swap(self, other);
    }

    /// Whether this reference's slot holds this reference's registration.
    ///
    /// True for every live soft reference; false once the object is gone.
    pub fn is_registered(&self) -> bool {
        match self.link {
            Some(link) if self.state() != Some(ObjectState::Destroyed) => {
                let owner = link.header().control.borrow().owner_of(link.slot);
                owner == Some(link.token)
            }
            _ => false,
        }
    }
}

impl<T> Clone for Soft<'_, T> {
    fn clone(&self) -> Self {
        match self.link {
            // SAFETY: the link's header and value came from a registered block.
            Some(link) => unsafe { Self::register(link.header, link.value) },
            None => Soft::null(),
        }
    }
}

impl<T> Default for Soft<'_, T> {
    fn default() -> Self {
        Soft::null()
    }
}

impl<'h, T> From<&Owning<'h, T>> for Soft<'h, T> {
    fn from(owner: &Owning<'h, T>) -> Self {
        owner.soft()
    }
}

impl<T> Drop for Soft<'_, T> {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            let header = link.header();
            if header.state.get() != ObjectState::Destroyed {
                let mut control = header.control.borrow_mut();
                debug_assert_eq!(control.owner_of(link.slot), Some(link.token));
                control.remove(link.slot);
            }
        }
    }
}

impl<T> PartialEq for Soft<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl<T> PartialEq<Owning<'_, T>> for Soft<'_, T> {
    fn eq(&self, other: &Owning<'_, T>) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl<T> fmt::Debug for Soft<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Soft")
            .field("ptr", &self.as_ptr())
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Active borrow of a soft reference's target.
pub struct SoftRef<'a, T> {
    header: NonNull<ObjectHeader>,
    value: NonNull<T>,
    _borrow: PhantomData<&'a T>,
}

impl<T> Deref for SoftRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the borrow count keeps the owner from dropping the value.
        unsafe { self.value.as_ref() }
    }
}

impl<T> Drop for SoftRef<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the block outlives every guard on it.
        let header = unsafe { ObjectHeader::from_ptr(self.header) };
        header.borrows.set(header.borrows.get() - 1);
    }
}

impl<T: fmt::Debug> fmt::Debug for SoftRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
