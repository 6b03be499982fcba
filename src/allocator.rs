//! Allocator capability (component A): the core never calls a global
//! allocator directly. Every data structure that owns memory receives its
//! allocator at construction, per the external ABI.
//!
//! This crate ships exactly one concrete implementation, [`SystemAllocator`],
//! as a stand-in for the caller-supplied allocators this crate leaves out of
//! scope (linear, pool, arena, global — those are the host's job). The one
//! allocator this crate *does* own end-to-end is [`TemporaryArena`], built on
//! `bumpalo`, which backs the world's command stream (component I).

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Single-threaded allocator capability.
///
/// # Safety
/// Implementors must return memory that is valid for `size` bytes aligned to
/// `align`, and `dealloc` must only ever be called with a pointer previously
/// returned by `alloc` on the same instance.
pub unsafe trait Allocator {
    fn alloc(&self, size: usize, align: usize) -> NonNull<u8>;
    /// # Safety
    /// `ptr` must have been returned by `alloc` on this same allocator.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// Thread-safe allocator capability, required by the world's temporary arena
/// since concurrent workers record commands.
///
/// # Safety
/// Same contract as [`Allocator`], additionally safe to call from any thread
/// concurrently with calls on other threads.
pub unsafe trait ThreadSafeAllocator: Send + Sync {
    fn alloc_ts(&self, size: usize, align: usize) -> NonNull<u8>;
    /// # Safety
    /// `ptr` must have been returned by `alloc_ts` on this same allocator.
    unsafe fn dealloc_ts(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// Default single-threaded allocator: a thin wrapper over `std::alloc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

unsafe impl Allocator for SystemAllocator {
    fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        if size == 0 {
            return NonNull::dangling();
        }
        let layout = Layout::from_size_align(size, align).expect("invalid layout");
        // SAFETY: layout has non-zero size, checked above.
        let ptr = unsafe { alloc::alloc(layout) };
        NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout))
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        if size == 0 {
            return;
        }
        let layout = Layout::from_size_align(size, align).expect("invalid layout");
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

unsafe impl ThreadSafeAllocator for SystemAllocator {
    fn alloc_ts(&self, size: usize, align: usize) -> NonNull<u8> {
        self.alloc(size, align)
    }

    unsafe fn dealloc_ts(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.dealloc(ptr, size, align);
    }
}

/// Thread-safe bump allocator backing the world's command stream.
///
/// Records allocated from this arena stay valid until the next [`rewind`]
/// (called by `World::flush`). Internally a `bumpalo::Bump`
/// guarded by a `parking_lot::Mutex`, acting as its own spin lock
/// (parking_lot's mutex spins briefly before parking, matching the
/// contention profile of a structure many workers append to).
///
/// [`rewind`]: TemporaryArena::rewind
pub struct TemporaryArena {
    bump: parking_lot::Mutex<bumpalo::Bump>,
}

impl Default for TemporaryArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporaryArena {
    pub fn new() -> Self {
        Self {
            bump: parking_lot::Mutex::new(bumpalo::Bump::new()),
        }
    }

    /// Copies `bytes` into the arena and returns an owning, 'static-lifetime
    /// slice. Safety of the 'static lifetime depends entirely on callers
    /// never reading it past the next `rewind` — documented, not enforced,
    /// matching the "valid until the next flush" contract.
    pub fn alloc_copy(&self, bytes: &[u8]) -> NonNull<[u8]> {
        let mut bump = self.bump.lock();
        let slice = bump.alloc_slice_copy(bytes);
        NonNull::from(slice)
    }

    /// Total bytes currently allocated from this arena (its "top").
    pub fn allocated_bytes(&self) -> usize {
        self.bump.lock().allocated_bytes()
    }

    /// Frees every allocation made since the arena was created or last
    /// rewound. Called by `World::flush` once the command stream has been
    /// fully drained.
    pub fn rewind(&self) {
        self.bump.lock().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_allocator_round_trips() {
        let alloc = SystemAllocator;
        let ptr = alloc.alloc(64, 8);
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 64);
            alloc.dealloc(ptr, 64, 8);
        }
    }

    #[test]
    fn temporary_arena_copies_and_rewinds() {
        let arena = TemporaryArena::new();
        let data = arena.alloc_copy(&[1, 2, 3, 4]);
        // SAFETY: still within the arena's lifetime, not yet rewound.
        let slice = unsafe { data.as_ref() };
        assert_eq!(slice, &[1, 2, 3, 4]);
        assert!(arena.allocated_bytes() > 0);
        arena.rewind();
        assert_eq!(arena.allocated_bytes(), 0);
    }
}
