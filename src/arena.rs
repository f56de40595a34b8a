//! Per-worker LIFO arena allocator.
//!
//! Each worker creates its tasks and deque nodes out of a private bump
//! arena: allocation is a pointer bump, there is no individual
//! deallocation, and the whole arena is released when the worker is
//! dropped. Other workers may *read and write through* pointers into the
//! arena (a stolen task lives in its creator's arena) but never allocate
//! from it, so allocation needs no synchronization at all.
//!
//! Addresses are stable: chunks are raw heap blocks that are never moved
//! or reused, so a `NonNull` handed out here stays valid for the arena's
//! lifetime.
//!
//! The arena does not run `Drop` for its contents. Callers that place
//! droppable values here own their destruction (the task completion path
//! drops payloads in place).

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

/// Minimum chunk size. Small allocations dominate (task cells of a few
/// hundred bytes), so starting at a page keeps chunk churn negligible.
const MIN_CHUNK: usize = 4096;

struct Chunk {
    base: *mut u8,
    layout: Layout,
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in `LifoArena::grow`.
        unsafe { dealloc(self.base, self.layout) }
    }
}

/// Bump allocator with stable addresses and bulk free.
pub struct LifoArena {
    chunks: Vec<Chunk>,
    /// Bump cursor into the last chunk.
    cursor: usize,
    /// Capacity of the last chunk.
    cap: usize,
}

impl LifoArena {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            cursor: 0,
            cap: 0,
        }
    }

    /// Move `value` into the arena and return a stable pointer to it.
    ///
    /// The value's `Drop` will not be run by the arena.
    pub fn alloc<T>(&mut self, value: T) -> NonNull<T> {
        let size = std::mem::size_of::<T>();
        let align = std::mem::align_of::<T>();

        let ptr = self.alloc_raw(size.max(1), align) as *mut T;
        // SAFETY: alloc_raw returns a fresh, aligned, non-null region of at
        // least `size` bytes.
        unsafe {
            ptr.write(value);
            NonNull::new_unchecked(ptr)
        }
    }

    fn alloc_raw(&mut self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two());

        if let Some(chunk) = self.chunks.last() {
            let base = chunk.base as usize;
            let aligned = (base + self.cursor + align - 1) & !(align - 1);
            let end = aligned - base + size;
            if end <= self.cap {
                self.cursor = end;
                return aligned as *mut u8;
            }
        }

        self.grow(size, align);
        // Fresh chunk: its base is aligned to `align` by construction.
        let chunk = self.chunks.last().expect("grow pushed a chunk");
        self.cursor = size;
        chunk.base
    }

    /// Allocate a new chunk that fits `size` at `align`, doubling capacity.
    ///
    /// Exhaustion of the underlying allocator is fatal by design: task
    /// storage cannot degrade gracefully mid-tree.
    fn grow(&mut self, size: usize, align: usize) {
        let next_cap = self.cap.max(MIN_CHUNK / 2).saturating_mul(2).max(size);
        let layout = Layout::from_size_align(next_cap, align.max(std::mem::align_of::<usize>()))
            .expect("arena layout overflow");

        // SAFETY: layout has non-zero size.
        let base = unsafe { alloc(layout) };
        if base.is_null() {
            handle_alloc_error(layout);
        }

        self.chunks.push(Chunk { base, layout });
        self.cap = next_cap;
        self.cursor = 0;
    }

    /// Total bytes of chunk capacity currently held.
    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.chunks.iter().map(|c| c.layout.size()).sum()
    }
}

impl Default for LifoArena {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the arena itself is only touched by its owning worker; pointers
// into it may travel to other threads, which is a property of the pointee
// types, not of the arena.
unsafe impl Send for LifoArena {}
