//! Heap object layout shared by owning and soft references.
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────┬───────────┐
//! │ block prefix │ ObjectHeader                          │ value: T  │
//! │ (allocator)  │ control block · state · borrow count  │           │
//! └──────────────┴──────────────────────────────────────┴───────────┘
//! ```
//!
//! The header sits at a fixed offset before the value, so a pointer to the
//! value is enough to find the control block again.
//!
//! All access goes through raw pointers: the header uses only interior
//! mutability, and the value is never borrowed mutably once constructed.

use std::alloc::Layout;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::mem::{self, MaybeUninit};
use std::ptr::{self, NonNull};

use crate::alloc::Heap;
use crate::control_block::{ControlBlock, RefToken, SlotIndex};

/// Where an object is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectState {
    /// Allocated; the value is not yet written.
    Constructing,
    /// The value is readable.
    Live,
    /// The value was dropped (or never written); the block is, or is about
    /// to become, a zombie.
    Destroyed,
}

pub(crate) struct ObjectHeader {
    pub(crate) control: RefCell<ControlBlock>,
    pub(crate) state: Cell<ObjectState>,
    /// Outstanding soft-reference borrow guards.
    pub(crate) borrows: Cell<usize>,
}

impl ObjectHeader {
    /// # Safety
    ///
    /// `this` must come from [`ObjectBox::header_ptr`] on a block whose heap
    /// has not reaped it.
    pub(crate) unsafe fn from_ptr<'a>(this: NonNull<ObjectHeader>) -> &'a ObjectHeader {
        &*this.as_ptr()
    }

    /// Register a new soft reference, or `None` if the object is destroyed.
    pub(crate) fn register(&self) -> Option<(SlotIndex, RefToken)> {
        if self.state.get() == ObjectState::Destroyed {
            return None;
        }
        let mut control = self.control.borrow_mut();
        let token = control.mint_token();
        Some((control.insert(token), token))
    }
}

#[repr(C)]
pub(crate) struct ObjectBox<T> {
    header: ObjectHeader,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> ObjectBox<T> {
    /// Allocate a block in the `Constructing` state.
    pub(crate) fn allocate(heap: &Heap) -> NonNull<ObjectBox<T>> {
        let block = heap.zombie_allocate(Layout::new::<ObjectBox<T>>()).cast::<ObjectBox<T>>();
        // SAFETY: freshly allocated with the right layout; only the header is
        // initialized, the value stays uninit until `write`.
        unsafe {
            ptr::write(
                ptr::addr_of_mut!((*block.as_ptr()).header),
                ObjectHeader {
                    control: RefCell::new(ControlBlock::new()),
                    state: Cell::new(ObjectState::Constructing),
                    borrows: Cell::new(0),
                },
            );
        }
        block
    }

    /// # Safety
    ///
    /// `this` must point at a block produced by [`allocate`](Self::allocate)
    /// whose heap has not reaped it.
    pub(crate) unsafe fn header<'a>(this: NonNull<ObjectBox<T>>) -> &'a ObjectHeader {
        &*ptr::addr_of!((*this.as_ptr()).header)
    }

    /// # Safety
    ///
    /// As for [`header`](Self::header).
    pub(crate) unsafe fn value_ptr(this: NonNull<ObjectBox<T>>) -> NonNull<T> {
        NonNull::new_unchecked(UnsafeCell::raw_get(ptr::addr_of!((*this.as_ptr()).value)).cast::<T>())
    }

    /// Map a value pointer back to its block.
    ///
    /// # Safety
    ///
    /// `value` must point at the value of a block produced by
    /// [`allocate`](Self::allocate).
    pub(crate) unsafe fn from_value_ptr(value: NonNull<T>) -> NonNull<ObjectBox<T>> {
        let offset = mem::offset_of!(ObjectBox<T>, value);
        NonNull::new_unchecked(value.as_ptr().cast::<u8>().sub(offset).cast::<ObjectBox<T>>())
    }

    /// Store the value and mark the object live.
    ///
    /// # Safety
    ///
    /// `this` must be in the `Constructing` state.
    pub(crate) unsafe fn write(this: NonNull<ObjectBox<T>>, value: T) {
        let header = Self::header(this);
        debug_assert_eq!(header.state.get(), ObjectState::Constructing);
        ptr::write(Self::value_ptr(this).as_ptr(), value);
        header.state.set(ObjectState::Live);
    }

    /// The header as an untyped pointer, shared by soft references to the
    /// value and to parts of it.
    pub(crate) fn header_ptr(this: NonNull<ObjectBox<T>>) -> NonNull<ObjectHeader> {
        // `header` is the first field of a `repr(C)` struct.
        this.cast::<ObjectHeader>()
    }

    /// Destroy the object: invalidate every soft reference, drop the value if
    /// it was written, and hand the block to the zombie allocator.
    ///
    /// # Safety
    ///
    /// `this` must be a block of `heap` that is not yet destroyed, and the
    /// caller must be its sole owner.
    ///
    /// # Panics
    ///
    /// Panics if a soft-reference borrow of the value is still active.
    pub(crate) unsafe fn destroy(heap: &Heap, this: NonNull<ObjectBox<T>>) {
        let header = Self::header(this);
        assert_eq!(
            header.borrows.get(),
            0,
            "object destroyed while a soft reference borrow of it is active"
        );
        let was_live = header.state.replace(ObjectState::Destroyed) == ObjectState::Live;

        let invalidated = {
            let mut control = header.control.borrow_mut();
            // Soft references null themselves by re-reading `state`, so the
            // sweep only has to account for them.
            let count = control.invalidate_all(|_, _| {});
            control.clear();
            count
        };
        heap.record_invalidations(invalidated);
        if invalidated > 0 {
            tracing::trace!(soft_refs = invalidated, "owner invalidated soft references");
        }

        // Zombify even if the value's destructor unwinds.
        let _zombify = Zombify { heap, block: this.cast::<u8>() };
        if was_live {
            ptr::drop_in_place(Self::value_ptr(this).as_ptr());
        }
    }
}

struct Zombify<'h> {
    heap: &'h Heap,
    block: NonNull<u8>,
}

impl Drop for Zombify<'_> {
    fn drop(&mut self) {
        // SAFETY: the block came from `zombie_allocate` and `destroy` runs
        // once per object. The header needs no drop: `clear` released the
        // control block's only heap allocation.
        unsafe { self.heap.zombie_deallocate(self.block) }
    }
}
