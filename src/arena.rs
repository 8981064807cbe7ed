//! The bump arena allocator.
//!
//! A [`BumpArena`] owns one fixed-capacity buffer and serves allocations by
//! rounding the current offset up to the requested alignment and advancing
//! it past the request. Individual deallocation does not exist; the whole
//! arena is recycled at once with [`reset`](struct.BumpArena.html#method.reset),
//! which rewinds the offset to zero in O(1). A high-water mark records the
//! most the arena has ever held, across resets, for capacity tuning.

use core::alloc::Layout;
use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;

use crate::blocks::{round_up, AllocationFailure};

/// Arena buffers are aligned to 16 bytes, so any power-of-two alignment up
/// to 16 can be honored anywhere in the buffer.
pub const BUFFER_ALIGN: usize = 16;

/// An aligned request did not fit in the arena's remaining capacity.
///
/// Arenas never grow; the caller can [`reset`](BumpArena::reset) or build a
/// bigger arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityExceeded {
    pub size: usize,
    pub align: usize,
    pub available: usize,
}

impl fmt::Display for CapacityExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arena cannot fit {} bytes (align {}); {} bytes remain",
            self.size, self.align, self.available
        )
    }
}

/// A bump allocator over one owned, fixed-capacity buffer.
///
/// ```
/// use core::alloc::Layout;
/// use pool_arena::BumpArena;
///
/// let arena = BumpArena::new(1024)?;
/// let a = arena.allocate(Layout::from_size_align(100, 8).unwrap()).unwrap();
/// unsafe { a.as_ptr().write(42) };
/// assert_eq!(arena.used(), 100);
///
/// arena.reset();
/// assert_eq!(arena.used(), 0);
/// assert_eq!(arena.peak_usage(), 100);
/// # Ok::<(), pool_arena::AllocationFailure>(())
/// ```
///
/// The arena is the sole owner of its buffer and is therefore not `Clone`;
/// moving it transfers the buffer. It is single-threaded by design and not
/// `Sync`.
pub struct BumpArena {
    buf: NonNull<u8>,
    capacity: usize,
    offset: Cell<usize>,
    peak: Cell<usize>,
}

// The arena owns its buffer outright, so it can move between threads; the
// interior Cells keep it from being shared between them.
unsafe impl Send for BumpArena {}

impl BumpArena {
    /// Allocate an arena holding `capacity` bytes.
    pub fn new(capacity: usize) -> Result<BumpArena, AllocationFailure> {
        let buf = if capacity == 0 {
            // Well-aligned and never dereferenced: every allocation fails
            unsafe { NonNull::new_unchecked(BUFFER_ALIGN as *mut u8) }
        } else {
            let layout = Self::buffer_layout(capacity);
            let raw = unsafe { alloc::alloc::alloc(layout) };
            NonNull::new(raw).ok_or(AllocationFailure {
                size: layout.size(),
                align: layout.align(),
            })?
        };
        Ok(BumpArena {
            buf,
            capacity,
            offset: Cell::new(0),
            peak: Cell::new(0),
        })
    }

    fn buffer_layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity, BUFFER_ALIGN).expect("arena capacity overflows")
    }

    /// Serve `layout` from the buffer.
    ///
    /// The returned storage is uninitialized and stays valid until the next
    /// [`reset`](Self::reset) or until the arena is dropped, whichever comes
    /// first.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, CapacityExceeded> {
        let base = self.buf.as_ptr() as usize;
        let aligned = round_up(base + self.offset.get(), layout.align());
        let end = aligned.checked_add(layout.size());
        let fits = match end {
            Some(end) => end <= base + self.capacity,
            None => false,
        };
        if !fits {
            return Err(CapacityExceeded {
                size: layout.size(),
                align: layout.align(),
                available: self.available(),
            });
        }

        self.offset.set(end.unwrap() - base);
        if self.offset.get() > self.peak.get() {
            self.peak.set(self.offset.get());
        }
        log::trace!(
            "arena served {} bytes at {:?} ({} of {} used)",
            layout.size(),
            aligned as *mut u8,
            self.offset.get(),
            self.capacity,
        );
        // aligned >= base >= 1
        Ok(unsafe { NonNull::new_unchecked(aligned as *mut u8) })
    }

    /// Rewind the offset to zero, recycling the whole buffer at once.
    ///
    /// Memory is not zeroed and the high-water mark is untouched. Every
    /// pointer previously returned by [`allocate`](Self::allocate) becomes
    /// invalid: reading or writing through one afterwards is undefined
    /// behavior, and this contract is the caller's to uphold - the arena
    /// cannot detect violations.
    pub fn reset(&self) {
        log::debug!(
            "arena reset, dropping {} used bytes",
            self.offset.get()
        );
        self.offset.set(0);
    }

    /// Bytes currently allocated (the bump offset).
    pub fn used(&self) -> usize {
        self.offset.get()
    }

    /// Bytes left before the next unaligned allocation fails.
    pub fn available(&self) -> usize {
        self.capacity - self.offset.get()
    }

    /// The most bytes this arena has ever held at once, across resets.
    pub fn peak_usage(&self) -> usize {
        self.peak.get()
    }

    /// The buffer's total capacity.
    pub fn total_size(&self) -> usize {
        self.capacity
    }
}

impl Drop for BumpArena {
    fn drop(&mut self) {
        if self.capacity > 0 {
            unsafe {
                alloc::alloc::dealloc(self.buf.as_ptr(), Self::buffer_layout(self.capacity));
            }
        }
    }
}

impl fmt::Debug for BumpArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BumpArena")
            .field("used", &self.used())
            .field("capacity", &self.capacity)
            .field("peak", &self.peak.get())
            .finish()
    }
}

/// A borrowed, copyable view of an arena, shaped for container adapters.
///
/// Handles compare by identity: two handles are equal exactly when they
/// reference the same arena, which is what lets container algorithms that
/// move storage across adapters detect an arena mismatch.
#[derive(Clone, Copy, Debug)]
pub struct ArenaHandle<'a> {
    arena: &'a BumpArena,
}

impl<'a> ArenaHandle<'a> {
    pub fn new(arena: &'a BumpArena) -> ArenaHandle<'a> {
        ArenaHandle { arena }
    }

    /// Serve `layout` from the referenced arena.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, CapacityExceeded> {
        self.arena.allocate(layout)
    }

    /// A no-op: arenas only release storage through
    /// [`BumpArena::reset`].
    pub fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {}

    pub fn arena(&self) -> &'a BumpArena {
        self.arena
    }
}

impl<'a, 'b> PartialEq<ArenaHandle<'b>> for ArenaHandle<'a> {
    fn eq(&self, other: &ArenaHandle<'b>) -> bool {
        core::ptr::eq(self.arena, other.arena)
    }
}

impl<'a> Eq for ArenaHandle<'a> {}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn serves_aligned_addresses() {
        let arena = BumpArena::new(1024).unwrap();

        for &align in &[1usize, 2, 4, 8, 16] {
            let ptr = arena.allocate(layout(3, align)).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
        }
        assert!(arena.used() <= 1024);
    }

    #[test]
    fn offset_is_monotonic_and_bounded() {
        let arena = BumpArena::new(256).unwrap();
        let base = arena.allocate(layout(1, 1)).unwrap().as_ptr() as usize;

        let mut last_used = arena.used();
        for size in &[7usize, 16, 3, 32, 9] {
            let ptr = arena.allocate(layout(*size, 8)).unwrap();
            let addr = ptr.as_ptr() as usize;

            assert!(arena.used() >= last_used);
            assert!(addr + size <= base + 256);
            assert_eq!(arena.available(), 256 - arena.used());
            last_used = arena.used();
        }
    }

    #[test]
    fn fails_without_growing() {
        let arena = BumpArena::new(64).unwrap();
        arena.allocate(layout(48, 8)).unwrap();

        let failure = arena.allocate(layout(32, 8)).unwrap_err();
        assert_eq!(
            failure,
            CapacityExceeded {
                size: 32,
                align: 8,
                available: 16
            }
        );
        log::info!("expected failure: {}", failure);

        // The failed request changed nothing
        assert_eq!(arena.used(), 48);
        arena.allocate(layout(16, 8)).unwrap();
        assert_eq!(arena.available(), 0);
    }

    #[test]
    fn reset_rewinds_to_the_base() {
        let arena = BumpArena::new(128).unwrap();
        let first = arena.allocate(layout(100, 8)).unwrap();

        arena.reset();
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.available(), 128);

        // The next allocation starts over at the buffer's base address
        let again = arena.allocate(layout(64, 8)).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn peak_survives_reset() {
        let arena = BumpArena::new(256).unwrap();

        arena.allocate(layout(100, 1)).unwrap();
        assert_eq!(arena.peak_usage(), 100);

        arena.reset();
        assert_eq!(arena.peak_usage(), 100);

        arena.allocate(layout(40, 1)).unwrap();
        assert_eq!(arena.peak_usage(), 100);

        arena.allocate(layout(120, 1)).unwrap();
        assert_eq!(arena.peak_usage(), 160);
    }

    #[test]
    fn moving_transfers_the_buffer() {
        let (arena, ptr) = {
            let arena = BumpArena::new(64).unwrap();
            let ptr = arena.allocate(layout(8, 8)).unwrap();
            unsafe { ptr.as_ptr().write(0xAB) };
            (arena, ptr)
        };

        // The buffer moved with the arena; contents are intact
        assert_eq!(unsafe { ptr.as_ptr().read() }, 0xAB);
        assert_eq!(arena.used(), 8);
    }

    #[test]
    fn handles_compare_by_identity() {
        let left = BumpArena::new(64).unwrap();
        let right = BumpArena::new(64).unwrap();

        let a = ArenaHandle::new(&left);
        let b = ArenaHandle::new(&left);
        let c = ArenaHandle::new(&right);
        assert_eq!(a, b);
        assert_ne!(a, c);

        // deallocate is a no-op; only reset gives the bytes back
        let ptr = a.allocate(layout(16, 8)).unwrap();
        b.deallocate(ptr, layout(16, 8));
        assert_eq!(left.used(), 16);
        left.reset();
        assert_eq!(left.used(), 0);
    }

    #[test]
    fn zero_capacity_never_serves() {
        let arena = BumpArena::new(0).unwrap();
        assert_eq!(arena.total_size(), 0);
        assert!(arena.allocate(layout(1, 1)).is_err());
    }
}
