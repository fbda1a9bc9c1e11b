//! # Control Block
//!
//! Per-object registry of the soft references pointing at that object.
//!
//! ## Slots
//!
//! A control block owns [`INLINE_SLOTS`] slots stored in place plus an
//! index-addressed overflow table that is only allocated once the inline
//! slots run out. Slot indices are global: `0..INLINE_SLOTS` address the
//! inline array and everything above addresses the overflow table.
//!
//! Every slot is in exactly one of two states:
//!
//! - **free**: linked into the single free list rooted at `first_free`
//! - **used**: holding the [`RefToken`] of the soft reference registered in it
//!
//! Insertion pops the free list head, removal pushes onto it (LIFO), and
//! [`ControlBlock::reset_ptr`] re-targets a used slot in place; all three
//! are `O(1)`.
//!
//! ## Overflow growth
//!
//! The first overflow table holds [`OVERFLOW_START_SLOTS`] slots. Each later
//! growth resizes a table of `n` slots to `2n + 2`, threading the new slots
//! onto the free list. Slot indices are `u32`; exhausting them is fatal.
//!
//! ## Invalidation
//!
//! When the owning reference destroys the object it calls
//! [`ControlBlock::invalidate_all`], which visits every used slot, inline and
//! overflow, exactly once, and then [`ControlBlock::clear`], which releases
//! the overflow table and marks the block as belonging to a destroyed object.

use std::fmt;

use crate::error::CorruptionError;

/// Number of slots stored inline in every control block.
pub const INLINE_SLOTS: usize = 5;

/// Size of the first overflow table.
pub const OVERFLOW_START_SLOTS: usize = 8;

/// Global index of a slot within a control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotIndex(u32);

impl SlotIndex {
    /// Index as `usize`.
    pub fn get(self) -> usize {
        self.0 as usize
    }

    /// Whether this index addresses the inline slot array.
    pub fn is_inline(self) -> bool {
        self.get() < INLINE_SLOTS
    }

    fn new(index: usize) -> Self {
        match u32::try_from(index) {
            Ok(i) => SlotIndex(i),
            Err(_) => panic!("control block slot index space exhausted"),
        }
    }
}

/// Identity of a registered soft reference.
///
/// Stands in for the back-pointer a slot would otherwise store: the slot
/// records which reference occupies it, and that reference records the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefToken(u64);

/// Physical block a slot lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotBlock {
    /// The inline array.
    Inline,
    /// The overflow table.
    Overflow,
}

/// Free-or-used state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// On the free list, linking to the next free slot.
    Free {
        /// Next free slot, if any.
        next: Option<SlotIndex>,
    },
    /// Holding a registration.
    Used {
        /// The registered reference.
        owner: RefToken,
    },
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    block: SlotBlock,
    state: SlotState,
}

/// Per-object soft reference registry.
pub struct ControlBlock {
    inline: [Slot; INLINE_SLOTS],
    overflow: Vec<Slot>,
    first_free: Option<SlotIndex>,
    used: usize,
    next_token: u64,
    zombie: bool,
}

impl ControlBlock {
    /// Create a control block with every inline slot on the free list.
    pub fn new() -> Self {
        let mut cb = ControlBlock {
            inline: [Slot {
                block: SlotBlock::Inline,
                state: SlotState::Free { next: None },
            }; INLINE_SLOTS],
            overflow: Vec::new(),
            first_free: None,
            used: 0,
            next_token: 1,
            zombie: false,
        };
        cb.init();
        cb
    }

    /// Rebuild the free list across the inline array and drop any overflow.
    pub fn init(&mut self) {
        for (i, slot) in self.inline.iter_mut().enumerate() {
            let next = if i + 1 < INLINE_SLOTS { Some(SlotIndex::new(i + 1)) } else { None };
            *slot = Slot {
                block: SlotBlock::Inline,
                state: SlotState::Free { next },
            };
        }
        self.overflow = Vec::new();
        self.first_free = Some(SlotIndex::new(0));
        self.used = 0;
        self.zombie = false;
    }

    /// Mint a token for a reference about to be registered or re-targeted.
    pub fn mint_token(&mut self) -> RefToken {
        let token = RefToken(self.next_token);
        self.next_token += 1;
        token
    }

    /// Register `owner` in a free slot, growing the overflow table if needed.
    ///
    /// # Panics
    ///
    /// Panics if the object has been destroyed or the free list is corrupt.
    pub fn insert(&mut self, owner: RefToken) -> SlotIndex {
        assert!(!self.zombie, "cannot register a reference with a destroyed object");
        let index = match self.first_free {
            Some(index) => index,
            None => self.grow(),
        };
        let next = match self.slot(index).state {
            SlotState::Free { next } => next,
            SlotState::Used { .. } => corrupted(index, "free list head is in use"),
        };
        self.first_free = next;
        self.slot_mut(index).state = SlotState::Used { owner };
        self.used += 1;
        index
    }

    /// Re-target a used slot at a new owner without changing its state.
    pub fn reset_ptr(&mut self, index: SlotIndex, owner: RefToken) {
        let slot = self.slot_mut(index);
        match slot.state {
            SlotState::Used { .. } => slot.state = SlotState::Used { owner },
            SlotState::Free { .. } => corrupted(index, "reset_ptr on a free slot"),
        }
    }

    /// Release a used slot back onto the free list.
    pub fn remove(&mut self, index: SlotIndex) {
        let next = self.first_free;
        let slot = self.slot_mut(index);
        if let SlotState::Free { .. } = slot.state {
            corrupted(index, "remove on a free slot");
        }
        slot.state = SlotState::Free { next };
        self.first_free = Some(index);
        self.used -= 1;
    }

    /// The reference registered in `index`, if the slot is used.
    pub fn owner_of(&self, index: SlotIndex) -> Option<RefToken> {
        match self.slot(index).state {
            SlotState::Used { owner } => Some(owner),
            SlotState::Free { .. } => None,
        }
    }

    /// Visit every used slot, inline then overflow, returning how many there were.
    ///
    /// The slots themselves are left untouched; [`clear`](Self::clear)
    /// follows once the sweep is done.
    pub fn invalidate_all<F>(&self, mut visit: F) -> usize
    where
        F: FnMut(SlotIndex, RefToken),
    {
        let mut visited = 0;
        for (i, slot) in self.inline.iter().chain(self.overflow.iter()).enumerate() {
            if let SlotState::Used { owner } = slot.state {
                visit(SlotIndex::new(i), owner);
                visited += 1;
            }
        }
        debug_assert_eq!(visited, self.used, "used slot count out of sync");
        visited
    }

    /// Release the overflow table and mark the block as belonging to a
    /// destroyed object. Further insertions are fatal.
    pub fn clear(&mut self) {
        self.init();
        self.first_free = None;
        self.zombie = true;
    }

    /// Whether [`clear`](Self::clear) has run.
    pub fn is_zombie(&self) -> bool {
        self.zombie
    }

    /// Number of used slots.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total number of slots, inline and overflow.
    pub fn capacity(&self) -> usize {
        INLINE_SLOTS + self.overflow.len()
    }

    /// Number of overflow slots currently allocated.
    pub fn overflow_capacity(&self) -> usize {
        self.overflow.len()
    }

    /// Check the free/used partition.
    ///
    /// Walks the free list and verifies that it is acyclic, contains only free
    /// slots, and together with the used slots accounts for every slot
    /// exactly once, and that every slot's block tag matches its index.
    pub fn validate(&self) -> Result<(), CorruptionError> {
        let capacity = self.capacity();
        for i in 0..capacity {
            let expected = if i < INLINE_SLOTS { SlotBlock::Inline } else { SlotBlock::Overflow };
            if self.slot(SlotIndex::new(i)).block != expected {
                return Err(CorruptionError { slot: i, reason: "slot tagged with the wrong block" });
            }
        }
        if self.zombie {
            return match self.first_free {
                None if self.used == 0 => Ok(()),
                _ => Err(CorruptionError { slot: 0, reason: "cleared block still has slots in play" }),
            };
        }

        let mut on_free_list = vec![false; capacity];
        let mut free = 0;
        let mut cursor = self.first_free;
        while let Some(index) = cursor {
            let i = index.get();
            if i >= capacity {
                return Err(CorruptionError { slot: i, reason: "free list points out of range" });
            }
            if on_free_list[i] {
                return Err(CorruptionError { slot: i, reason: "free list contains a cycle" });
            }
            on_free_list[i] = true;
            free += 1;
            cursor = match self.slot(index).state {
                SlotState::Free { next } => next,
                SlotState::Used { .. } => {
                    return Err(CorruptionError { slot: i, reason: "used slot reachable from the free list" })
                }
            };
        }

        let mut used = 0;
        for (i, reachable) in on_free_list.iter().enumerate() {
            match self.slot(SlotIndex::new(i)).state {
                SlotState::Used { .. } => used += 1,
                SlotState::Free { .. } if !reachable => {
                    return Err(CorruptionError { slot: i, reason: "free slot missing from the free list" })
                }
                SlotState::Free { .. } => {}
            }
        }
        if used != self.used || used + free != capacity {
            return Err(CorruptionError { slot: 0, reason: "slot counts out of sync" });
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Grow the overflow table and return the new free list head.
    fn grow(&mut self) -> SlotIndex {
        let old = self.overflow.len();
        let new = if old == 0 { OVERFLOW_START_SLOTS } else { old * 2 + 2 };
        let base = INLINE_SLOTS + old;
        let end = INLINE_SLOTS + new;
        if end > u32::MAX as usize {
            panic!("control block slot index space exhausted");
        }

        self.overflow.reserve_exact(new - old);
        for i in base..end {
            let next = if i + 1 < end { Some(SlotIndex::new(i + 1)) } else { self.first_free };
            self.overflow.push(Slot {
                block: SlotBlock::Overflow,
                state: SlotState::Free { next },
            });
        }
        let head = SlotIndex::new(base);
        self.first_free = Some(head);

        tracing::debug!(from = old, to = new, used = self.used, "control block overflow grown");
        head
    }

    fn slot(&self, index: SlotIndex) -> &Slot {
        let i = index.get();
        if i < INLINE_SLOTS {
            &self.inline[i]
        } else {
            match self.overflow.get(i - INLINE_SLOTS) {
                Some(slot) => slot,
                None => corrupted(index, "slot index out of range"),
            }
        }
    }

    fn slot_mut(&mut self, index: SlotIndex) -> &mut Slot {
        let i = index.get();
        if i < INLINE_SLOTS {
            &mut self.inline[i]
        } else {
            match self.overflow.get_mut(i - INLINE_SLOTS) {
                Some(slot) => slot,
                None => corrupted(index, "slot index out of range"),
            }
        }
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("used", &self.used)
            .field("capacity", &self.capacity())
            .field("first_free", &self.first_free)
            .field("zombie", &self.zombie)
            .finish()
    }
}

#[cold]
#[track_caller]
fn corrupted(index: SlotIndex, reason: &str) -> ! {
    panic!("control block corrupted at slot {}: {}", index.get(), reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(cb: &mut ControlBlock) -> (SlotIndex, RefToken) {
        let token = cb.mint_token();
        (cb.insert(token), token)
    }

    #[test]
    fn test_new_block_is_all_free() {
        let cb = ControlBlock::new();
        assert_eq!(cb.used(), 0);
        assert_eq!(cb.capacity(), INLINE_SLOTS);
        assert_eq!(cb.overflow_capacity(), 0);
        assert!(!cb.is_zombie());
        cb.validate().unwrap();
    }

    #[test]
    fn test_inline_slots_fill_in_order() {
        let mut cb = ControlBlock::new();
        for expected in 0..INLINE_SLOTS {
            let (index, token) = register(&mut cb);
            assert_eq!(index.get(), expected);
            assert!(index.is_inline());
            assert_eq!(cb.owner_of(index), Some(token));
        }
        assert_eq!(cb.overflow_capacity(), 0);
        cb.validate().unwrap();
    }

    #[test]
    fn test_overflow_growth_policy() {
        let mut cb = ControlBlock::new();
        for _ in 0..INLINE_SLOTS {
            register(&mut cb);
        }
        let (index, _) = register(&mut cb);
        assert_eq!(index.get(), INLINE_SLOTS);
        assert!(!index.is_inline());
        assert_eq!(cb.overflow_capacity(), OVERFLOW_START_SLOTS);

        while cb.used() < cb.capacity() {
            register(&mut cb);
        }
        register(&mut cb);
        assert_eq!(cb.overflow_capacity(), OVERFLOW_START_SLOTS * 2 + 2);

        while cb.used() < cb.capacity() {
            register(&mut cb);
        }
        register(&mut cb);
        assert_eq!(cb.overflow_capacity(), (OVERFLOW_START_SLOTS * 2 + 2) * 2 + 2);
        cb.validate().unwrap();
    }

    #[test]
    fn test_remove_is_lifo() {
        let mut cb = ControlBlock::new();
        let (a, _) = register(&mut cb);
        let (b, _) = register(&mut cb);
        register(&mut cb);

        cb.remove(a);
        cb.remove(b);
        assert_eq!(cb.used(), 1);
        cb.validate().unwrap();

        let (first, _) = register(&mut cb);
        let (second, _) = register(&mut cb);
        assert_eq!(first, b);
        assert_eq!(second, a);
    }

    #[test]
    fn test_reset_ptr_keeps_slot_used() {
        let mut cb = ControlBlock::new();
        let (index, old) = register(&mut cb);
        let new = cb.mint_token();
        assert_ne!(old, new);

        cb.reset_ptr(index, new);
        assert_eq!(cb.owner_of(index), Some(new));
        assert_eq!(cb.used(), 1);
        cb.validate().unwrap();
    }

    #[test]
    fn test_invalidate_all_visits_every_used_slot_once() {
        let mut cb = ControlBlock::new();
        let mut registered = Vec::new();
        for _ in 0..40 {
            registered.push(register(&mut cb));
        }
        // Punch holes in both the inline and overflow regions.
        for &(index, _) in registered.iter().step_by(3) {
            cb.remove(index);
        }
        let mut expected: Vec<_> = registered
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 3 != 0)
            .map(|(_, &(_, token))| token)
            .collect();

        let mut seen = Vec::new();
        let count = cb.invalidate_all(|_, token| seen.push(token));
        assert_eq!(count, expected.len());

        seen.sort();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_clear_marks_zombie() {
        let mut cb = ControlBlock::new();
        for _ in 0..20 {
            register(&mut cb);
        }
        cb.clear();
        assert!(cb.is_zombie());
        assert_eq!(cb.used(), 0);
        assert_eq!(cb.overflow_capacity(), 0);
        assert_eq!(cb.invalidate_all(|_, _| unreachable!()), 0);
        cb.validate().unwrap();
    }

    #[test]
    #[should_panic(expected = "destroyed object")]
    fn test_insert_after_clear_panics() {
        let mut cb = ControlBlock::new();
        cb.clear();
        let token = cb.mint_token();
        cb.insert(token);
    }

    #[test]
    #[should_panic(expected = "remove on a free slot")]
    fn test_double_remove_panics() {
        let mut cb = ControlBlock::new();
        let (index, _) = register(&mut cb);
        cb.remove(index);
        cb.remove(index);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_index_panics() {
        let cb = ControlBlock::new();
        cb.owner_of(SlotIndex::new(INLINE_SLOTS + 3));
    }
}
