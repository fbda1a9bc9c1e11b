//! # Owning References
//!
//! [`Owning`] is the sole owner of a heap object. Dropping or resetting it
//! invalidates every [`Soft`] reference to the object, drops the value, and
//! hands the block to the zombie allocator, in that order.
//!
//! ```rust
//! use safememory_runtime::{Heap, MemoryError, Soft};
//!
//! let heap = Heap::new();
//! let mut owner = heap.make_owning(String::from("payload"));
//! let soft = Soft::new(&owner);
//! assert_eq!(soft.with(|s| s.len()), Ok(7));
//!
//! owner.reset();
//! assert!(soft.is_null());
//! assert_eq!(soft.with(|s| s.len()), Err(MemoryError::NullAccess));
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};

use crate::alloc::Heap;
use crate::error::{MemoryError, MemoryResult};
use crate::naked::NakedPtr;
use crate::object::ObjectBox;
use crate::soft::Soft;

/// Exclusive owner of a heap object.
pub struct Owning<'h, T> {
    heap: &'h Heap,
    ptr: Option<NonNull<ObjectBox<T>>>,
    _owns: PhantomData<T>,
}

impl Heap {
    /// Allocate an object and return its owner.
    pub fn make_owning<T>(&self, value: T) -> Owning<'_, T> {
        let block = ObjectBox::allocate(self);
        // SAFETY: fresh block in the `Constructing` state.
        unsafe { ObjectBox::write(block, value) };
        Owning {
            heap: self,
            ptr: Some(block),
            _owns: PhantomData,
        }
    }

    /// Allocate an object whose constructor receives a soft reference to the
    /// object being built.
    ///
    /// The soft reference reports null until construction finishes; after
    /// that it (and any clone kept inside the value) behaves like any other.
    /// If `build` panics, the block is destroyed before the panic resumes and
    /// every soft reference taken from it reports null.
    ///
    /// ```rust
    /// use safememory_runtime::{Heap, Soft};
    ///
    /// struct Node<'h> {
    ///     this: Soft<'h, Node<'h>>,
    /// }
    ///
    /// let heap = Heap::new();
    /// let node = heap.make_owning_cyclic(|this| Node { this });
    /// assert!(node.get().unwrap().this == node);
    /// ```
    pub fn make_owning_cyclic<'h, T, F>(&'h self, build: F) -> Owning<'h, T>
    where
        F: FnOnce(Soft<'h, T>) -> T,
    {
        let block = ObjectBox::<T>::allocate(self);
        // SAFETY: the block is fresh and not destroyed.
        let this = unsafe { Soft::register(ObjectBox::header_ptr(block), ObjectBox::value_ptr(block)) };

        match panic::catch_unwind(AssertUnwindSafe(|| build(this))) {
            Ok(value) => {
                // SAFETY: still `Constructing`; `build` had no way to write it.
                unsafe { ObjectBox::write(block, value) };
                Owning {
                    heap: self,
                    ptr: Some(block),
                    _owns: PhantomData,
                }
            }
            Err(payload) => {
                // SAFETY: never handed to an owner, so this is the only destroy.
                unsafe { ObjectBox::destroy(self, block) };
                panic::resume_unwind(payload)
            }
        }
    }
}

impl<'h, T> Owning<'h, T> {
    /// Allocate `value` in `heap`. Same as [`Heap::make_owning`].
    pub fn new_in(heap: &'h Heap, value: T) -> Self {
        heap.make_owning(value)
    }

    /// An owner of nothing.
    pub fn empty(heap: &'h Heap) -> Self {
        Owning {
            heap,
            ptr: None,
            _owns: PhantomData,
        }
    }

    /// The heap this owner allocates from.
    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Borrow the owned value.
    pub fn get(&self) -> MemoryResult<&T> {
        match self.ptr {
            // SAFETY: an owned block is live until this owner destroys it,
            // which needs `&mut self`.
            Some(block) => Ok(unsafe { ObjectBox::value_ptr(block).as_ref() }),
            None => Err(MemoryError::NullAccess),
        }
    }

    /// Whether this owner holds nothing.
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// Raw pointer to the value, or null.
    pub fn as_ptr(&self) -> *const T {
        match self.ptr {
            // SAFETY: owned blocks are never reaped while owned.
            Some(block) => unsafe { ObjectBox::value_ptr(block).as_ptr() },
            None => ptr::null(),
        }
    }

    /// Destroy the owned object, if any.
    ///
    /// Every soft reference to it becomes null before the value is dropped.
    /// Resetting an empty owner does nothing.
    ///
    /// # Panics
    ///
    /// Panics if a soft reference borrow of the value is still active.
    pub fn reset(&mut self) {
        if let Some(block) = self.ptr.take() {
            // SAFETY: taken out of `self.ptr`, so destroyed exactly once.
            unsafe { ObjectBox::destroy(self.heap, block) };
        }
    }

    /// Destroy the owned object, then own a new one holding `value`.
    pub fn reset_with(&mut self, value: T) {
        self.reset();
        *self = self.heap.make_owning(value);
    }

    /// Move the owned object out, leaving this owner empty.
    pub fn take(&mut self) -> Owning<'h, T> {
        Owning {
            heap: self.heap,
            ptr: self.ptr.take(),
            _owns: PhantomData,
        }
    }

    /// Exchange the objects owned by `self` and `other`.
    pub fn swap(&mut self, other: &mut Owning<'h, T>) {
        mem::swap(&mut self.ptr, &mut other.ptr);
        mem::swap(&mut self.heap, &mut other.heap);
    }

    /// A new soft reference to the owned object (null if empty).
    pub fn soft(&self) -> Soft<'h, T> {
        match self.ptr {
            // SAFETY: the value pointer of a live owned block.
            Some(block) => unsafe { Soft::from_value_ptr(ObjectBox::value_ptr(block)) },
            None => Soft::null(),
        }
    }

    /// A soft reference to a part of the owned value, such as a field.
    ///
    /// The reference registers with this object's control block and is
    /// nulled when the object is destroyed. `project` must return a place
    /// inside the owned value's block; any other address fails with
    /// [`MemoryError::PointerOutOfRange`].
    ///
    /// ```rust
    /// use safememory_runtime::Heap;
    ///
    /// struct Pair {
    ///     left: u32,
    ///     right: u32,
    /// }
    ///
    /// let heap = Heap::new();
    /// let mut pair = heap.make_owning(Pair { left: 1, right: 2 });
    /// let right = pair.soft_field(|p| &p.right).unwrap();
    /// assert_eq!(right.with(|r| *r), Ok(2));
    ///
    /// pair.reset();
    /// assert!(right.is_null());
    /// ```
    pub fn soft_field<U, F>(&self, project: F) -> MemoryResult<Soft<'h, U>>
    where
        F: FnOnce(&T) -> &U,
    {
        let block = self.ptr.ok_or(MemoryError::NullAccess)?;
        // SAFETY: owned blocks are live.
        let field = NonNull::from(project(unsafe { ObjectBox::value_ptr(block).as_ref() }));
        let start = field.as_ptr() as *const u8;
        let last = start.wrapping_add(mem::size_of::<U>().saturating_sub(1));
        let allocated = block.cast::<u8>();
        // SAFETY: `allocated` is this owner's unreaped block.
        let inside = unsafe {
            self.heap.is_zombieable_pointer_in_block(allocated, start)
                && self.heap.is_zombieable_pointer_in_block(allocated, last)
        };
        if !inside {
            return Err(MemoryError::PointerOutOfRange { address: start as usize });
        }
        // SAFETY: the field lies inside this owner's live block.
        Ok(unsafe { Soft::register(ObjectBox::header_ptr(block), field) })
    }

    /// Number of soft references currently registered with the object.
    pub fn soft_count(&self) -> usize {
        match self.ptr {
            // SAFETY: owned blocks are live.
            Some(block) => unsafe { ObjectBox::header(block).control.borrow().used() },
            None => 0,
        }
    }

    /// Unchecked pointer to the value for fast-path access.
    pub fn naked(&self) -> NakedPtr<'h, T> {
        NakedPtr::new(self.heap, self.as_ptr())
    }
}

impl<T> Drop for Owning<'_, T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T> PartialEq for Owning<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> PartialEq<Soft<'_, T>> for Owning<'_, T> {
    fn eq(&self, other: &Soft<'_, T>) -> bool {
        self.as_ptr() == other.as_ptr()
    }
}

impl<T: fmt::Debug> fmt::Debug for Owning<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Ok(value) => f.debug_tuple("Owning").field(value).finish(),
            Err(_) => f.write_str("Owning(null)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct DropCounter(Rc<Cell<usize>>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_make_owning_and_get() {
        let heap = Heap::new();
        let owner = heap.make_owning(41u32);
        assert!(!owner.is_null());
        assert_eq!(*owner.get().unwrap(), 41);
        assert_eq!(heap.live_blocks(), 1);
    }

    #[test]
    fn test_empty_owner() {
        let heap = Heap::new();
        let owner: Owning<'_, u32> = Owning::empty(&heap);
        assert!(owner.is_null());
        assert!(owner.as_ptr().is_null());
        assert_eq!(owner.get(), Err(MemoryError::NullAccess));
        assert_eq!(owner.soft_count(), 0);
        assert!(owner.soft().is_null());
    }

    #[test]
    fn test_drop_runs_destructor_and_zombifies() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        {
            let _owner = heap.make_owning(DropCounter(drops.clone()));
            assert_eq!(drops.get(), 0);
        }
        assert_eq!(drops.get(), 1);
        assert_eq!(heap.live_blocks(), 0);
        assert_eq!(heap.zombie_count(), 1);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let heap = Heap::new();
        let drops = Rc::new(Cell::new(0));
        let mut owner = heap.make_owning(DropCounter(drops.clone()));
        let soft = owner.soft();

        owner.reset();
        owner.reset();
        assert!(owner.is_null());
        assert!(soft.is_null());
        assert_eq!(drops.get(), 1);
        assert_eq!(heap.zombie_count(), 1);
        assert_eq!(heap.stats().soft_invalidations, 1);

        drop(owner);
        assert_eq!(drops.get(), 1);
        assert_eq!(heap.zombie_count(), 1);
    }

    #[test]
    fn test_reset_with_replaces_object() {
        let heap = Heap::new();
        let mut owner = heap.make_owning(String::from("old"));
        let old_soft = owner.soft();

        owner.reset_with(String::from("new"));
        assert!(old_soft.is_null());
        assert_eq!(owner.get().unwrap(), "new");
        assert_eq!(owner.soft_count(), 0);
    }

    #[test]
    fn test_take_transfers_ownership() {
        let heap = Heap::new();
        let mut a = heap.make_owning(7i64);
        let soft = a.soft();
        let b = a.take();

        assert!(a.is_null());
        assert_eq!(*b.get().unwrap(), 7);
        assert!(soft.is_alive());
        assert_eq!(b.soft_count(), 1);
        drop(a);
        assert!(soft.is_alive());
        drop(b);
        assert!(soft.is_null());
    }

    #[test]
    fn test_swap() {
        let heap = Heap::new();
        let mut a = heap.make_owning(1u8);
        let mut b = heap.make_owning(2u8);
        let soft_a = a.soft();

        a.swap(&mut b);
        assert_eq!(*a.get().unwrap(), 2);
        assert_eq!(*b.get().unwrap(), 1);
        assert!(b == soft_a);

        b.reset();
        assert!(soft_a.is_null());
        assert_eq!(*a.get().unwrap(), 2);
    }

    #[test]
    fn test_equality() {
        let heap = Heap::new();
        let a = heap.make_owning(0u8);
        let b = heap.make_owning(0u8);
        assert!(a == a);
        assert!(a != b);
        assert!(Owning::<u8>::empty(&heap) == Owning::empty(&heap));
        assert!(a == a.soft());
        assert!(b != a.soft());
    }

    #[test]
    fn test_cyclic_construction() {
        struct Node<'h> {
            this: Soft<'h, Node<'h>>,
            value: u32,
        }

        let heap = Heap::new();
        let node = heap.make_owning_cyclic(|this| {
            assert!(this.is_null(), "self reference must not be usable mid-construction");
            Node { this, value: 9 }
        });
        let inner = &node.get().unwrap().this;
        assert!(inner.is_alive());
        assert_eq!(inner.with(|n| n.value), Ok(9));
        assert_eq!(node.soft_count(), 1);
    }

    #[test]
    fn test_cyclic_construction_panic_destroys_block() {
        let heap = Heap::new();
        let escaped = std::cell::RefCell::new(Vec::new());

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            heap.make_owning_cyclic(|this| -> u8 {
                escaped.borrow_mut().push(this.clone());
                panic!("constructor failed");
            })
        }));
        assert!(result.is_err());
        assert_eq!(heap.live_blocks(), 0);
        assert_eq!(heap.zombie_count(), 1);
        assert_eq!(heap.stats().soft_invalidations, 1);
        assert!(escaped.borrow()[0].is_null());
    }

    #[test]
    #[should_panic(expected = "borrow of it is active")]
    fn test_reset_while_borrowed_panics() {
        let heap = Heap::new();
        let mut owner = heap.make_owning(5u32);
        let soft = owner.soft();
        let guard = soft.get().unwrap();
        owner.reset();
        drop(guard);
    }

    #[test]
    fn test_naked_pointer_detects_destroyed_object() {
        let heap = Heap::new();
        let mut owner = heap.make_owning([0u64; 4]);
        let naked = owner.naked();
        assert!(naked.check().is_ok());

        owner.reset();
        assert!(matches!(naked.check(), Err(MemoryError::ZombieAccess { .. })));
    }

    #[test]
    fn test_soft_field_tracks_owner() {
        struct Pair {
            left: String,
            right: u64,
        }

        let heap = Heap::new();
        let mut pair = heap.make_owning(Pair {
            left: String::from("l"),
            right: 8,
        });
        let left = pair.soft_field(|p| &p.left).unwrap();
        let right = pair.soft_field(|p| &p.right).unwrap();
        assert_eq!(pair.soft_count(), 2);
        assert!(right.is_registered());
        assert_eq!(left.with(|s| s.clone()), Ok(String::from("l")));
        assert_eq!(right.as_ptr(), &pair.get().unwrap().right as *const u64);

        let copy = right.clone();
        assert_eq!(pair.soft_count(), 3);
        drop(copy);

        pair.reset();
        assert!(left.is_null());
        assert!(right.is_null());
        assert_eq!(right.get().err(), Some(MemoryError::NullAccess));
        assert_eq!(heap.stats().soft_invalidations, 2);
    }

    #[test]
    fn test_soft_field_rejects_outside_address() {
        static ELSEWHERE: u64 = 0;

        let heap = Heap::new();
        let owner = heap.make_owning(1u64);

        let err = owner.soft_field(|_| &ELSEWHERE).unwrap_err();
        assert_eq!(err, MemoryError::PointerOutOfRange { address: &ELSEWHERE as *const u64 as usize });
        assert_eq!(owner.soft_count(), 0);
        assert!(owner.soft_field(|v| v).is_ok());
    }

    #[test]
    fn test_soft_field_of_empty_owner() {
        let heap = Heap::new();
        let owner: Owning<'_, (u8, u8)> = Owning::empty(&heap);
        assert_eq!(owner.soft_field(|p| &p.1).err(), Some(MemoryError::NullAccess));
    }

    #[test]
    #[should_panic(expected = "borrow of it is active")]
    fn test_reset_while_field_borrowed_panics() {
        let heap = Heap::new();
        let mut owner = heap.make_owning((1u16, 2u16));
        let second = owner.soft_field(|p| &p.1).unwrap();
        let guard = second.get().unwrap();
        owner.reset();
        drop(guard);
    }
}
