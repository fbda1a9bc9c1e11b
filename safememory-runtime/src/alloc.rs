//! # Zombie Allocator
//!
//! The allocation substrate every reference in this crate is built on.
//!
//! ## Block lifecycle
//!
//! ```text
//!   zombie_allocate          zombie_deallocate          kill_all_zombies
//! ─────────────────► Live ─────────────────────► Zombie ─────────────────► Reclaimed
//! ```
//!
//! A zombie block has been logically freed (its value was dropped and its
//! control block cleared) but its memory is still mapped and is never handed
//! out again until the next reap. A stale reference therefore keeps reading
//! the block's own header, never an unrelated object that happened to reuse
//! the address.
//!
//! Plain [`Heap::allocate`] / [`Heap::deallocate`] blocks skip the zombie
//! stage and are returned to the system allocator immediately.
//!
//! ## Block prefix
//!
//! Every block starts with a [`BlockPrefix`] recording the requested size,
//! alignment and lifecycle state, so deallocation and the membership test
//! need only the user pointer:
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────────────────┐
//! │ padding      │ BlockPrefix │ user region (size bytes) │
//! └──────────────┴─────────────┴──────────────────────────┘
//!                               ▲ pointer handed to the caller
//! ```
//!
//! ## Early detection
//!
//! With early detection enabled, each zombie block's user span is recorded in
//! an ordered address map so an arbitrary raw pointer can be classified in
//! `O(log n)` by [`Heap::dezombiefy`].
//!
//! ## Threading
//!
//! A `Heap` is neither `Send` nor `Sync`. Each thread creates its own, and
//! every reference allocated from it borrows it, which also means
//! [`Heap::kill_all_zombies`] (taking `&mut self`) can only run once no
//! reference into the heap remains.

use std::alloc::{self, handle_alloc_error, Layout};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use crate::config::{RuntimeConfig, ZombieConfig};
use crate::error::{MemoryError, MemoryResult};

// ============================================================================
// Block prefix
// ============================================================================

/// Lifecycle state recorded in a block's prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockState {
    /// Allocated with [`Heap::allocate`]; freed immediately on deallocation.
    Plain = 0x504c_4e31,
    /// Allocated with [`Heap::zombie_allocate`] and not yet zombie-deallocated.
    Live = 0x4c49_5645,
    /// Zombie-deallocated, awaiting the next reap.
    Zombie = 0x5a4f_4d42,
}

/// Header stored immediately before every user region.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BlockPrefix {
    /// Requested size of the user region in bytes.
    pub size: usize,
    /// Requested alignment of the user region.
    pub align: u32,
    /// Lifecycle state.
    pub state: BlockState,
}

const PREFIX_SIZE: usize = mem::size_of::<BlockPrefix>();
const PREFIX_ALIGN: usize = mem::align_of::<BlockPrefix>();

/// Offset from the start of the underlying allocation to the user region.
fn user_offset(align: usize) -> usize {
    let align = align.max(PREFIX_ALIGN);
    (PREFIX_SIZE + align - 1) & !(align - 1)
}

/// Layout of the underlying allocation for a user layout.
fn block_layout(user: Layout) -> Layout {
    let align = user.align().max(PREFIX_ALIGN);
    let total = user_offset(user.align())
        .checked_add(user.size())
        .unwrap_or_else(|| handle_alloc_error(user));
    Layout::from_size_align(total, align).unwrap_or_else(|_| handle_alloc_error(user))
}

/// # Safety
///
/// `user` must be a pointer returned by a `Heap` allocation that has not
/// been reclaimed.
unsafe fn prefix_of(user: *const u8) -> *mut BlockPrefix {
    user.sub(PREFIX_SIZE) as *mut BlockPrefix
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of a heap's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Plain allocations.
    pub allocations: u64,
    /// Plain deallocations.
    pub deallocations: u64,
    /// Zombie-capable allocations.
    pub zombie_allocations: u64,
    /// Zombie deallocations (blocks that entered the zombie state).
    pub zombie_deallocations: u64,
    /// Zombie blocks returned to the system allocator.
    pub zombies_reclaimed: u64,
    /// Reap sweeps performed.
    pub reaps: u64,
    /// Soft references invalidated by owner destruction.
    pub soft_invalidations: u64,
    /// Bytes in live blocks (plain and zombie-capable).
    pub live_bytes: usize,
    /// Bytes in zombie blocks awaiting reap.
    pub zombie_bytes: usize,
}

#[derive(Default)]
struct Counters {
    allocations: Cell<u64>,
    deallocations: Cell<u64>,
    zombie_allocations: Cell<u64>,
    zombie_deallocations: Cell<u64>,
    zombies_reclaimed: Cell<u64>,
    reaps: Cell<u64>,
    soft_invalidations: Cell<u64>,
    live_blocks: Cell<usize>,
    live_bytes: Cell<usize>,
    zombie_bytes: Cell<usize>,
}

fn bump(cell: &Cell<u64>, by: u64) {
    cell.set(cell.get() + by);
}

// ============================================================================
// Heap
// ============================================================================

/// A single-threaded allocator context with deferred (zombie) reclamation.
pub struct Heap {
    early_detection: Cell<bool>,
    warn_bytes: usize,
    warned: Cell<bool>,
    /// User pointers of every zombie block, in deallocation order.
    zombies: RefCell<Vec<NonNull<u8>>>,
    /// Zombie user spans, `start -> end`, while early detection is on.
    zombie_spans: RefCell<BTreeMap<usize, usize>>,
    counters: Counters,
    _not_send_sync: PhantomData<*mut u8>,
}

impl Heap {
    /// Create a heap with the default configuration.
    pub fn new() -> Self {
        Self::with_zombie_config(&ZombieConfig::default())
    }

    /// Create a heap configured by `config`.
    pub fn with_config(config: &RuntimeConfig) -> Self {
        Self::with_zombie_config(&config.zombie)
    }

    /// Create a heap from its zombie allocator settings.
    pub fn with_zombie_config(config: &ZombieConfig) -> Self {
        Self {
            early_detection: Cell::new(config.early_detection),
            warn_bytes: config.warn_bytes,
            warned: Cell::new(false),
            zombies: RefCell::new(Vec::new()),
            zombie_spans: RefCell::new(BTreeMap::new()),
            counters: Counters::default(),
            _not_send_sync: PhantomData,
        }
    }

    // ------------------------------------------------------------------------
    // Plain allocation
    // ------------------------------------------------------------------------

    /// Allocate a block that is freed immediately on [`deallocate`](Self::deallocate).
    ///
    /// Aborts through [`handle_alloc_error`] if the system allocator fails.
    pub fn allocate(&self, layout: Layout) -> NonNull<u8> {
        let user = self.raw_allocate(layout, BlockState::Plain);
        bump(&self.counters.allocations, 1);
        user
    }

    /// Return a plain block to the system allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap and must
    /// not have been deallocated already.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let prefix = prefix_of(ptr.as_ptr());
        assert_eq!(
            (*prefix).state,
            BlockState::Plain,
            "deallocate called on a block that was not plainly allocated"
        );
        bump(&self.counters.deallocations, 1);
        self.raw_free(ptr);
    }

    // ------------------------------------------------------------------------
    // Zombie allocation
    // ------------------------------------------------------------------------

    /// Allocate a block that passes through the zombie state when freed.
    pub fn zombie_allocate(&self, layout: Layout) -> NonNull<u8> {
        let user = self.raw_allocate(layout, BlockState::Live);
        bump(&self.counters.zombie_allocations, 1);
        user
    }

    /// Logically free a block, keeping its memory reserved until the next reap.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`zombie_allocate`](Self::zombie_allocate) on this
    /// heap. The block must not be zombie-deallocated twice.
    pub unsafe fn zombie_deallocate(&self, ptr: NonNull<u8>) {
        let prefix = prefix_of(ptr.as_ptr());
        assert_eq!(
            (*prefix).state,
            BlockState::Live,
            "zombie_deallocate called on a block that is not live and zombie-capable"
        );
        (*prefix).state = BlockState::Zombie;
        let size = (*prefix).size;

        self.zombies.borrow_mut().push(ptr);
        if self.early_detection.get() {
            let start = ptr.as_ptr() as usize;
            self.zombie_spans.borrow_mut().insert(start, start + size);
        }

        bump(&self.counters.zombie_deallocations, 1);
        self.counters.live_bytes.set(self.counters.live_bytes.get() - size);
        self.counters.live_blocks.set(self.counters.live_blocks.get() - 1);
        let zombie_bytes = self.counters.zombie_bytes.get() + size;
        self.counters.zombie_bytes.set(zombie_bytes);

        if self.warn_bytes != 0 && zombie_bytes >= self.warn_bytes && !self.warned.replace(true) {
            tracing::warn!(
                zombie_bytes,
                zombie_blocks = self.zombies.borrow().len(),
                threshold = self.warn_bytes,
                "zombie memory exceeds threshold; consider reaping more often"
            );
        }
    }

    /// Whether `ptr` lies within the user region of the block at `allocated`.
    ///
    /// The answer depends only on the span the block was allocated with, so it
    /// is the same before and after the block becomes a zombie.
    ///
    /// # Safety
    ///
    /// `allocated` must be a pointer returned by this heap whose block has not
    /// been reclaimed.
    pub unsafe fn is_zombieable_pointer_in_block(&self, allocated: NonNull<u8>, ptr: *const u8) -> bool {
        let start = allocated.as_ptr() as usize;
        let size = (*prefix_of(allocated.as_ptr())).size;
        let addr = ptr as usize;
        addr >= start && addr < start + size
    }

    /// Lifecycle state of the block at `allocated`.
    ///
    /// # Safety
    ///
    /// Same contract as [`is_zombieable_pointer_in_block`](Self::is_zombieable_pointer_in_block).
    pub unsafe fn block_state(&self, allocated: NonNull<u8>) -> BlockState {
        (*prefix_of(allocated.as_ptr())).state
    }

    // ------------------------------------------------------------------------
    // Zombie detector
    // ------------------------------------------------------------------------

    /// Whether early zombie detection is active.
    pub fn early_detection(&self) -> bool {
        self.early_detection.get()
    }

    /// Switch early zombie detection on or off, returning the previous setting.
    ///
    /// # Panics
    ///
    /// Panics if zombies are outstanding: their spans would be missing from
    /// (or stale in) the detector. Reap first.
    pub fn set_early_detection(&self, enabled: bool) -> bool {
        assert!(
            self.zombies.borrow().is_empty(),
            "early detection can only be toggled while no zombie blocks are outstanding"
        );
        self.early_detection.replace(enabled)
    }

    /// Whether `ptr` is outside every recorded zombie span.
    ///
    /// Always `true` while early detection is off.
    pub fn is_pointer_not_zombie(&self, ptr: *const u8) -> bool {
        if !self.early_detection.get() {
            return true;
        }
        let addr = ptr as usize;
        match self.zombie_spans.borrow().range(..=addr).next_back() {
            Some((_, &end)) => addr >= end,
            None => true,
        }
    }

    /// Check a raw pointer before it is dereferenced.
    ///
    /// Returns [`MemoryError::NullAccess`] for null and
    /// [`MemoryError::ZombieAccess`] for a pointer into a zombie block (early
    /// detection only). A pointer that passes is not thereby proven valid; this
    /// is the deterministic-failure fast path, not a full check.
    pub fn dezombiefy<T>(&self, ptr: *const T) -> MemoryResult<NonNull<T>> {
        let checked = NonNull::new(ptr as *mut T).ok_or(MemoryError::NullAccess)?;
        if self.is_pointer_not_zombie(ptr as *const u8) {
            Ok(checked)
        } else {
            Err(MemoryError::ZombieAccess { address: ptr as usize })
        }
    }

    /// Return every zombie block to the system allocator.
    ///
    /// Taking `&mut self` proves no owning or soft reference into this heap is
    /// alive, so nothing can observe the reclaimed memory.
    pub fn kill_all_zombies(&mut self) -> usize {
        let zombies = mem::take(self.zombies.get_mut());
        self.zombie_spans.get_mut().clear();

        let count = zombies.len();
        let bytes = self.counters.zombie_bytes.replace(0);
        for ptr in zombies {
            // SAFETY: every entry was zombie-deallocated on this heap and is
            // listed exactly once.
            unsafe { self.raw_free(ptr) };
        }

        bump(&self.counters.zombies_reclaimed, count as u64);
        bump(&self.counters.reaps, 1);
        self.warned.set(false);
        if count > 0 {
            tracing::debug!(blocks = count, bytes, "reaped zombie blocks");
        }
        count
    }

    /// Number of zombie blocks awaiting reap.
    pub fn zombie_count(&self) -> usize {
        self.zombies.borrow().len()
    }

    /// Number of live (not yet freed or zombified) blocks.
    pub fn live_blocks(&self) -> usize {
        self.counters.live_blocks.get()
    }

    /// Snapshot the heap's counters.
    pub fn stats(&self) -> HeapStats {
        let c = &self.counters;
        HeapStats {
            allocations: c.allocations.get(),
            deallocations: c.deallocations.get(),
            zombie_allocations: c.zombie_allocations.get(),
            zombie_deallocations: c.zombie_deallocations.get(),
            zombies_reclaimed: c.zombies_reclaimed.get(),
            reaps: c.reaps.get(),
            soft_invalidations: c.soft_invalidations.get(),
            live_bytes: c.live_bytes.get(),
            zombie_bytes: c.zombie_bytes.get(),
        }
    }

    pub(crate) fn record_invalidations(&self, count: usize) {
        bump(&self.counters.soft_invalidations, count as u64);
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn raw_allocate(&self, layout: Layout, state: BlockState) -> NonNull<u8> {
        let align = u32::try_from(layout.align()).unwrap_or_else(|_| handle_alloc_error(layout));
        let block = block_layout(layout);
        // SAFETY: block layouts always include the prefix, so are non-zero sized.
        let base = unsafe { alloc::alloc(block) };
        if base.is_null() {
            handle_alloc_error(block);
        }
        // SAFETY: the user offset lies inside the allocation and leaves room
        // for an aligned prefix right before it.
        unsafe {
            let user = base.add(user_offset(layout.align()));
            ptr::write(
                prefix_of(user),
                BlockPrefix {
                    size: layout.size(),
                    align,
                    state,
                },
            );
            self.counters.live_blocks.set(self.counters.live_blocks.get() + 1);
            self.counters.live_bytes.set(self.counters.live_bytes.get() + layout.size());
            NonNull::new_unchecked(user)
        }
    }

    /// # Safety
    ///
    /// `user` must be a block of this heap that is freed exactly once.
    unsafe fn raw_free(&self, user: NonNull<u8>) {
        let prefix = *prefix_of(user.as_ptr());
        if prefix.state != BlockState::Zombie {
            self.counters.live_bytes.set(self.counters.live_bytes.get() - prefix.size);
            self.counters.live_blocks.set(self.counters.live_blocks.get() - 1);
        }
        let user_layout = Layout::from_size_align_unchecked(prefix.size, prefix.align as usize);
        let base = user.as_ptr().sub(user_offset(user_layout.align()));
        alloc::dealloc(base, block_layout(user_layout));
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("early_detection", &self.early_detection.get())
            .field("live_blocks", &self.live_blocks())
            .field("zombie_blocks", &self.zombie_count())
            .finish()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.kill_all_zombies();
        let live = self.counters.live_blocks.get();
        if live > 0 {
            // Only reachable through mem::forget on an owner; the memory is
            // leaked rather than freed under a reference that may still exist.
            tracing::warn!(
                blocks = live,
                bytes = self.counters.live_bytes.get(),
                "heap dropped with live blocks; leaking them"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn test_user_offset_respects_alignment() {
        assert_eq!(user_offset(1), PREFIX_SIZE);
        assert_eq!(user_offset(8), PREFIX_SIZE);
        assert_eq!(user_offset(64), 64);
        for align in [1, 2, 4, 8, 16, 32, 64, 128] {
            assert_eq!(user_offset(align) % align, 0);
            assert!(user_offset(align) >= PREFIX_SIZE);
        }
    }

    #[test]
    fn test_plain_allocate_deallocate() {
        let heap = Heap::new();
        let p = heap.allocate(layout(48, 16));
        assert_eq!(p.as_ptr() as usize % 16, 0);
        assert_eq!(heap.live_blocks(), 1);
        assert_eq!(heap.stats().live_bytes, 48);
        unsafe {
            assert_eq!(heap.block_state(p), BlockState::Plain);
            ptr::write_bytes(p.as_ptr(), 0xAB, 48);
            heap.deallocate(p);
        }
        assert_eq!(heap.live_blocks(), 0);
        assert_eq!(heap.zombie_count(), 0);
        let stats = heap.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.deallocations, 1);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_zero_sized_allocation() {
        let heap = Heap::new();
        let p = heap.zombie_allocate(layout(0, 1));
        unsafe {
            assert!(!heap.is_zombieable_pointer_in_block(p, p.as_ptr()));
            heap.zombie_deallocate(p);
        }
        assert_eq!(heap.zombie_count(), 1);
    }

    #[test]
    fn test_zombie_lifecycle() {
        let mut heap = Heap::new();
        let p = heap.zombie_allocate(layout(32, 8));
        unsafe {
            assert_eq!(heap.block_state(p), BlockState::Live);
            heap.zombie_deallocate(p);
            assert_eq!(heap.block_state(p), BlockState::Zombie);
        }
        assert_eq!(heap.zombie_count(), 1);
        assert_eq!(heap.live_blocks(), 0);
        assert_eq!(heap.stats().zombie_bytes, 32);

        assert_eq!(heap.kill_all_zombies(), 1);
        assert_eq!(heap.zombie_count(), 0);
        let stats = heap.stats();
        assert_eq!(stats.zombies_reclaimed, 1);
        assert_eq!(stats.zombie_bytes, 0);
        assert_eq!(stats.reaps, 1);
    }

    #[test]
    fn test_membership_before_and_after_zombie_deallocate() {
        let heap = Heap::new();
        let p = heap.zombie_allocate(layout(24, 8));
        let base = p.as_ptr() as *const u8;
        unsafe {
            for state in 0..2 {
                if state == 1 {
                    heap.zombie_deallocate(p);
                }
                for offset in 0..24 {
                    assert!(heap.is_zombieable_pointer_in_block(p, base.add(offset)));
                }
                assert!(!heap.is_zombieable_pointer_in_block(p, base.add(24)));
                assert!(!heap.is_zombieable_pointer_in_block(p, base.wrapping_sub(1)));
            }
        }
    }

    #[test]
    fn test_detector_classifies_zombie_spans() {
        let heap = Heap::new();
        let a = heap.zombie_allocate(layout(16, 8));
        let b = heap.zombie_allocate(layout(16, 8));
        unsafe { heap.zombie_deallocate(a) };

        let a_ptr = a.as_ptr() as *const u8;
        assert!(!heap.is_pointer_not_zombie(a_ptr));
        assert!(!heap.is_pointer_not_zombie(a_ptr.wrapping_add(15)));
        assert!(heap.is_pointer_not_zombie(a_ptr.wrapping_add(16)));
        assert!(heap.is_pointer_not_zombie(b.as_ptr()));

        assert_eq!(
            heap.dezombiefy(a_ptr.wrapping_add(4)),
            Err(MemoryError::ZombieAccess { address: a_ptr as usize + 4 })
        );
        assert!(heap.dezombiefy(b.as_ptr() as *const u8).is_ok());
        assert_eq!(heap.dezombiefy(ptr::null::<u8>()), Err(MemoryError::NullAccess));

        unsafe { heap.zombie_deallocate(b) };
    }

    #[test]
    fn test_detection_disabled_reports_nothing() {
        let heap = Heap::with_config(&RuntimeConfig::builder().early_detection(false).build().unwrap());
        assert!(!heap.early_detection());
        let p = heap.zombie_allocate(layout(16, 8));
        unsafe { heap.zombie_deallocate(p) };
        assert!(heap.is_pointer_not_zombie(p.as_ptr()));
        assert!(heap.dezombiefy(p.as_ptr() as *const u8).is_ok());
    }

    #[test]
    fn test_toggle_detection_when_empty() {
        let mut heap = Heap::new();
        assert!(heap.set_early_detection(false));
        assert!(!heap.set_early_detection(true));

        let p = heap.zombie_allocate(layout(8, 8));
        unsafe { heap.zombie_deallocate(p) };
        heap.kill_all_zombies();
        assert!(heap.set_early_detection(false));
    }

    #[test]
    #[should_panic(expected = "no zombie blocks are outstanding")]
    fn test_toggle_detection_with_zombies_panics() {
        let heap = Heap::new();
        let p = heap.zombie_allocate(layout(8, 8));
        unsafe { heap.zombie_deallocate(p) };
        heap.set_early_detection(false);
    }

    #[test]
    #[should_panic(expected = "not live and zombie-capable")]
    fn test_double_zombie_deallocate_panics() {
        let heap = Heap::new();
        let p = heap.zombie_allocate(layout(8, 8));
        unsafe {
            heap.zombie_deallocate(p);
            heap.zombie_deallocate(p);
        }
    }

    #[test]
    fn test_reaped_addresses_are_no_longer_zombie() {
        let mut heap = Heap::new();
        let p = heap.zombie_allocate(layout(64, 8));
        unsafe { heap.zombie_deallocate(p) };
        assert!(!heap.is_pointer_not_zombie(p.as_ptr()));
        heap.kill_all_zombies();
        assert!(heap.is_pointer_not_zombie(p.as_ptr()));
    }

    #[test]
    fn test_drop_reaps_outstanding_zombies() {
        let heap = Heap::new();
        for _ in 0..10 {
            let p = heap.zombie_allocate(layout(128, 8));
            unsafe { heap.zombie_deallocate(p) };
        }
        assert_eq!(heap.zombie_count(), 10);
        drop(heap);
    }
}
