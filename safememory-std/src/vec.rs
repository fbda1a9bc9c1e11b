//! # SafeVec
//!
//! A growable array whose elements live in one owned heap object.
//!
//! ```text
//!   SafeVec ──owns──▶ [ RefCell<Vec<T>> ]  ◀──soft── SafeIter ─┐
//!      │                                                      │
//!      └──owns──▶ IteratorRegistry anchor ◀──RegistryLink─────┘
//! ```
//!
//! A [`SafeIter`] holds a soft reference to the element storage and a link
//! into the vector's registry. Access checks the link first, so an iterator
//! fails with [`MemoryError::InvalidatedIterator`] once the vector was moved
//! from ([`SafeVec::take`]), assigned over ([`Clone::clone_from`]) or
//! dropped, and with [`MemoryError::IteratorOutOfRange`] once the vector
//! shrank below its position.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::mem;

use safememory_runtime::{
    Checked, Heap, IteratorTracking, MemoryError, MemoryResult, OwningPointer, RegistryLink,
    SafetyMode, Soft,
};

type Storage<T> = RefCell<Vec<T>>;

/// Growable array with registry-tracked iterators.
pub struct SafeVec<'h, T: 'h, M: SafetyMode = Checked> {
    heap: &'h Heap,
    storage: M::Owning<'h, Storage<T>>,
    registry: M::Registry<'h>,
}

impl<'h, T: 'h, M: SafetyMode> SafeVec<'h, T, M> {
    /// An empty vector whose storage lives in `heap`.
    pub fn new_in(heap: &'h Heap) -> Self {
        Self::from_vec_in(heap, Vec::new())
    }

    /// A vector holding `items`.
    pub fn from_vec_in(heap: &'h Heap, items: Vec<T>) -> Self {
        let registry = <M::Registry<'h> as IteratorTracking<'h>>::new_in(heap);
        registry.set_size(items.len());
        SafeVec {
            heap,
            storage: Self::allocate(heap, items),
            registry,
        }
    }

    fn allocate(heap: &'h Heap, items: Vec<T>) -> M::Owning<'h, Storage<T>> {
        <M::Owning<'h, Storage<T>> as OwningPointer<'h, Storage<T>>>::new_in(heap, RefCell::new(items))
    }

    fn data(&self) -> &Storage<T> {
        match self.storage.get() {
            Ok(data) => data,
            Err(_) => unreachable!("vector storage is always allocated"),
        }
    }

    /// # Panics
    ///
    /// Panics if a [`SafeIter::with`] call is reading an element.
    fn items_mut(&self) -> RefMut<'_, Vec<T>> {
        match self.data().try_borrow_mut() {
            Ok(items) => items,
            Err(_) => panic!("SafeVec mutated while a heap-safe iterator is reading one of its elements"),
        }
    }

    fn update<R>(&mut self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        let mut items = self.items_mut();
        let result = f(&mut items);
        self.registry.set_size(items.len());
        result
    }

    /// The heap the storage lives in.
    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data().borrow().len()
    }

    /// Whether the vector holds no element.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `value`.
    pub fn push(&mut self, value: T) {
        self.update(|items| items.push(value));
    }

    /// Remove and return the last element.
    pub fn pop(&mut self) -> Option<T> {
        self.update(Vec::pop)
    }

    /// Insert `value` at `index`, shifting later elements.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn insert(&mut self, index: usize, value: T) {
        self.update(|items| items.insert(index, value));
    }

    /// Remove and return the element at `index`, if there is one.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        self.update(|items| (index < items.len()).then(|| items.remove(index)))
    }

    /// Shorten the vector to `len` elements.
    pub fn truncate(&mut self, len: usize) {
        self.update(|items| items.truncate(len));
    }

    /// Remove every element.
    pub fn clear(&mut self) {
        self.update(Vec::clear);
    }

    /// A copy of the element at `index`.
    pub fn get(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        self.data().borrow().get(index).cloned()
    }

    /// Borrow the elements as a slice.
    ///
    /// Iterators over the slice are the stack-only kind: the borrow checker
    /// keeps them from outliving or observing a mutation of the vector.
    pub fn as_slice(&self) -> Ref<'_, [T]> {
        Ref::map(self.data().borrow(), Vec::as_slice)
    }

    /// Copy the elements into a plain `Vec`.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.data().borrow().clone()
    }

    /// Move the contents out into a new vector, leaving `self` empty.
    ///
    /// Every heap-safe iterator of `self` is invalidated; the returned vector
    /// starts without iterators.
    pub fn take(&mut self) -> Self {
        let storage = mem::replace(&mut self.storage, Self::allocate(self.heap, Vec::new()));
        let registry = self.registry.take();
        self.registry.set_size(0);
        SafeVec {
            heap: self.heap,
            storage,
            registry,
        }
    }
}

impl<'h, T: 'h> SafeVec<'h, T, Checked> {
    /// Heap-safe iterator at the first element.
    pub fn begin_safe(&self) -> SafeIter<'h, T> {
        self.safe_iter_at(0)
    }

    /// Heap-safe iterator one past the last element.
    pub fn end_safe(&self) -> SafeIter<'h, T> {
        self.safe_iter_at(self.len())
    }

    /// Heap-safe iterator at `position`.
    pub fn safe_iter_at(&self, position: usize) -> SafeIter<'h, T> {
        SafeIter {
            storage: self.storage.soft(),
            link: self.registry.register(),
            position,
        }
    }

    /// Number of heap-safe iterators currently registered.
    pub fn live_iterators(&self) -> usize {
        self.registry.len()
    }
}

impl<'h, T: Clone + 'h, M: SafetyMode> Clone for SafeVec<'h, T, M> {
    /// Copy the elements into fresh storage. Iterators of `self` stay valid
    /// and the copy starts without iterators.
    fn clone(&self) -> Self {
        SafeVec {
            heap: self.heap,
            storage: Self::allocate(self.heap, self.to_vec()),
            registry: self.registry.clone(),
        }
    }

    /// Assign over `self`, invalidating every heap-safe iterator of `self`.
    fn clone_from(&mut self, source: &Self) {
        self.items_mut().clone_from(&source.data().borrow());
        self.registry.clone_from(&source.registry);
    }
}

impl<'h, T: 'h, M: SafetyMode> Extend<T> for SafeVec<'h, T, M> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        self.update(|items| items.extend(iter));
    }
}

impl<'h, T: fmt::Debug + 'h, M: SafetyMode> fmt::Debug for SafeVec<'h, T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice().iter()).finish()
    }
}

// ============================================================================
// Heap-safe iterator
// ============================================================================

/// Position in a [`SafeVec`] that may be stored anywhere.
///
/// Every access checks that the vector still tracks this iterator and that
/// the position is in bounds.
pub struct SafeIter<'h, T> {
    storage: Soft<'h, Storage<T>>,
    link: RegistryLink<'h>,
    position: usize,
}

impl<'h, T> SafeIter<'h, T> {
    /// The iterator's index into the vector.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether the vector still tracks this iterator.
    pub fn is_valid(&self) -> bool {
        self.link.is_valid()
    }

    /// Run `f` on the element at the iterator's position.
    ///
    /// # Panics
    ///
    /// The element stays borrowed while `f` runs. Mutating the vector from
    /// `f` panics, and dropping the vector from `f` is fatal.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> MemoryResult<R> {
        self.link.check(self.position)?;
        let storage = self.storage.get().map_err(|_| MemoryError::InvalidatedIterator)?;
        let items = storage.borrow();
        match items.get(self.position) {
            Some(item) => Ok(f(item)),
            None => Err(MemoryError::IteratorOutOfRange {
                position: self.position,
                len: items.len(),
            }),
        }
    }

    /// A copy of the element at the iterator's position.
    pub fn read(&self) -> MemoryResult<T>
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Step forward. Stepping past the end is an error.
    pub fn advance(&mut self) -> MemoryResult<()> {
        self.link.check(self.position)?;
        self.position += 1;
        Ok(())
    }

    /// Step back. Stepping before the start is an error.
    pub fn retreat(&mut self) -> MemoryResult<()> {
        let len = self.link.size()?;
        match self.position.checked_sub(1) {
            Some(position) if position < len => {
                self.position = position;
                Ok(())
            }
            _ => Err(MemoryError::IteratorOutOfRange {
                position: self.position,
                len,
            }),
        }
    }
}

impl<T> Clone for SafeIter<'_, T> {
    /// The copy registers with the same vector.
    fn clone(&self) -> Self {
        SafeIter {
            storage: self.storage.clone(),
            link: self.link.clone(),
            position: self.position,
        }
    }
}

impl<T> PartialEq for SafeIter<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.link.same_registry(&other.link) && self.position == other.position
    }
}

impl<T> fmt::Debug for SafeIter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeIter")
            .field("position", &self.position)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safememory_runtime::Raw;

    #[test]
    fn test_push_pop_and_len() {
        let heap = Heap::new();
        let mut v: SafeVec<'_, u32> = SafeVec::new_in(&heap);
        assert!(v.is_empty());
        v.push(1);
        v.push(2);
        v.insert(0, 0);
        assert_eq!(&*v.as_slice(), &[0, 1, 2]);
        assert_eq!(v.remove(1), Some(1));
        assert_eq!(v.remove(7), None);
        assert_eq!(v.pop(), Some(2));
        assert_eq!(v.len(), 1);
        assert_eq!(v.get(0), Some(0));
        v.clear();
        assert_eq!(v.pop(), None);
    }

    #[test]
    #[should_panic]
    fn test_insert_past_end_panics() {
        let heap = Heap::new();
        let mut v: SafeVec<'_, u32> = SafeVec::new_in(&heap);
        v.insert(1, 5);
    }

    #[test]
    fn test_iterator_walks_elements() {
        let heap = Heap::new();
        let v: SafeVec<'_, char> = SafeVec::from_vec_in(&heap, vec!['a', 'b']);
        let mut it = v.begin_safe();
        assert_eq!(it.read(), Ok('a'));
        it.advance().unwrap();
        assert_eq!(it.read(), Ok('b'));
        it.advance().unwrap();
        assert!(it == v.end_safe());
        assert_eq!(it.advance(), Err(MemoryError::IteratorOutOfRange { position: 2, len: 2 }));
        it.retreat().unwrap();
        assert_eq!(it.position(), 1);
    }

    #[test]
    fn test_retreat_before_start() {
        let heap = Heap::new();
        let v: SafeVec<'_, u8> = SafeVec::from_vec_in(&heap, vec![1]);
        let mut it = v.begin_safe();
        assert_eq!(it.retreat(), Err(MemoryError::IteratorOutOfRange { position: 0, len: 1 }));
    }

    #[test]
    fn test_iterators_register_and_release() {
        let heap = Heap::new();
        let v: SafeVec<'_, u8> = SafeVec::from_vec_in(&heap, vec![1, 2, 3]);
        let a = v.begin_safe();
        let b = a.clone();
        assert_eq!(v.live_iterators(), 2);
        assert!(a == b);
        drop(a);
        drop(b);
        assert_eq!(v.live_iterators(), 0);
    }

    #[test]
    fn test_extend_updates_bounds() {
        let heap = Heap::new();
        let mut v: SafeVec<'_, u8> = SafeVec::new_in(&heap);
        let it = v.safe_iter_at(2);
        assert!(it.read().is_err());
        v.extend([4, 5, 6]);
        assert_eq!(it.read(), Ok(6));
        v.truncate(1);
        assert_eq!(it.read(), Err(MemoryError::IteratorOutOfRange { position: 2, len: 1 }));
    }

    #[test]
    fn test_debug_lists_elements() {
        let heap = Heap::new();
        let v: SafeVec<'_, u8> = SafeVec::from_vec_in(&heap, vec![1, 2]);
        assert_eq!(format!("{:?}", v), "[1, 2]");
        assert!(format!("{:?}", v.begin_safe()).contains("valid: true"));
    }

    #[test]
    fn test_raw_mode_take() {
        let heap = Heap::new();
        let mut v: SafeVec<'_, String, Raw> = SafeVec::new_in(&heap);
        v.push(String::from("x"));
        let moved = v.take();
        assert!(v.is_empty());
        assert_eq!(moved.get(0).as_deref(), Some("x"));
        drop(moved);
        drop(v);
        assert_eq!(heap.live_blocks(), 0);
        assert_eq!(heap.zombie_count(), 0);
    }

    #[test]
    #[should_panic(expected = "mutated while a heap-safe iterator")]
    fn test_mutating_from_iterator_closure_panics() {
        let heap = Heap::new();
        let mut v: SafeVec<'_, u32> = SafeVec::from_vec_in(&heap, vec![1, 2]);
        let it = v.begin_safe();
        let _ = it.with(|x| v.push(*x));
    }

    #[test]
    #[should_panic(expected = "mutated while a heap-safe iterator")]
    fn test_assigning_from_iterator_closure_panics() {
        let heap = Heap::new();
        let mut v: SafeVec<'_, u32> = SafeVec::from_vec_in(&heap, vec![1, 2]);
        let source = SafeVec::from_vec_in(&heap, vec![3]);
        let it = v.begin_safe();
        let _ = it.with(|_| v.clone_from(&source));
    }

    #[test]
    #[should_panic(expected = "borrow of it is active")]
    fn test_dropping_from_iterator_closure_is_fatal() {
        let heap = Heap::new();
        let v: SafeVec<'_, u32> = SafeVec::from_vec_in(&heap, vec![1, 2]);
        let it = v.begin_safe();
        let _ = it.with(move |_| drop(v));
    }

    #[test]
    fn test_mutation_after_iterator_read_succeeds() {
        let heap = Heap::new();
        let mut v: SafeVec<'_, u32> = SafeVec::from_vec_in(&heap, vec![1, 2]);
        let it = v.begin_safe();
        let first = it.read().unwrap();
        v.push(first);
        assert_eq!(&*v.as_slice(), &[1, 2, 1]);
        assert_eq!(it.read(), Ok(1));
    }
}
