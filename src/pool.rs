//! The fixed-block pool allocator.
//!
//! ## [`FixedBlockPool`](struct.FixedBlockPool.html)
//!
//! A `FixedBlockPool<T>` hands out blocks sized and aligned for single `T`
//! elements in O(1) by popping an intrusive free list, and takes them back
//! in O(1) by pushing. When the free list runs dry it grows by one chunk of
//! blocks drawn from its [`ChunkSource`]; chunks are only returned when the
//! last handle to the pool is dropped. Multi-element requests are not
//! pooled and fall through to the source directly.
//!
//! The pool is single-threaded by design: handles are cheap `Clone`s that
//! share one state through reference counting, but none of it is `Sync`.
//! For concurrent callers, see
//! [`ConcurrentFixedBlockPool`](../concurrent/struct.ConcurrentFixedBlockPool.html),
//! which runs this same state under a lock.

use core::alloc::Layout;
use core::cell::RefCell;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

use alloc::rc::Rc;

use crate::blocks::{
    block_layout, AllocationFailure, ChunkChain, ChunkSource, FreeList, SystemSource,
};

/// Default backing-chunk size, in bytes, for pools that don't choose one.
pub const DEFAULT_CHUNK_BYTES: usize = 1024;

/// A point-in-time view of a pool's accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Single blocks handed out over the pool's lifetime.
    pub acquired: usize,
    /// Single blocks returned over the pool's lifetime.
    pub released: usize,
    /// Blocks currently held by callers (`acquired - released`).
    pub in_use: usize,
    /// Blocks currently sitting on the free list.
    pub free_blocks: usize,
    /// Backing chunks allocated so far.
    pub chunks: usize,
}

// The layout of a bulk region of `count` elements. Bulk requests bypass the
// block machinery entirely, so this is the element's own array layout.
fn bulk_layout(element: Layout, count: usize) -> Result<Layout, AllocationFailure> {
    let size = element
        .size()
        .checked_mul(count)
        .ok_or(AllocationFailure {
            size: usize::MAX,
            align: element.align(),
        })?;
    Layout::from_size_align(size, element.align()).map_err(|_| AllocationFailure {
        size,
        align: element.align(),
    })
}

fn dangling_for(align: usize) -> NonNull<u8> {
    // align is a power of two, so never zero
    unsafe { NonNull::new_unchecked(align as *mut u8) }
}

/// The state behind every handle of one pool: the free list, the chunk
/// chain, the source they draw from, and the acquire/release counters used
/// for leak detection at teardown.
///
/// Shared by reference counting so that cloned handles keep feeding one
/// free list rather than fragmenting it.
pub(crate) struct PoolState<S: ChunkSource> {
    free: FreeList,
    chunks: ChunkChain,
    element: Layout,
    total_acquired: usize,
    total_released: usize,
    source: S,
}

impl<S: ChunkSource> PoolState<S> {
    pub(crate) fn new(element: Layout, chunk_bytes: usize, source: S) -> PoolState<S> {
        let block = block_layout(element);
        let blocks_per_chunk = core::cmp::max(1, chunk_bytes / block.size());
        PoolState {
            free: FreeList::new(),
            chunks: ChunkChain::new(block, blocks_per_chunk),
            element,
            total_acquired: 0,
            total_released: 0,
            source,
        }
    }

    pub(crate) fn acquire(&mut self, count: usize) -> Result<NonNull<u8>, AllocationFailure> {
        if count != 1 {
            return self.acquire_bulk(count);
        }
        if self.free.is_empty() {
            self.chunks.grow(&mut self.source, &mut self.free)?;
        }
        let ptr = self.free.pop().expect("grow left the free list empty");
        self.total_acquired += 1;
        Ok(ptr)
    }

    fn acquire_bulk(&mut self, count: usize) -> Result<NonNull<u8>, AllocationFailure> {
        if count == 0 || self.element.size() == 0 {
            return Ok(dangling_for(self.element.align()));
        }
        let layout = bulk_layout(self.element, count)?;
        unsafe { self.source.allocate(layout) }
    }

    pub(crate) unsafe fn release(&mut self, ptr: NonNull<u8>, count: usize) {
        if count != 1 {
            if count == 0 || self.element.size() == 0 {
                return;
            }
            let layout =
                bulk_layout(self.element, count).expect("released a region never acquired");
            self.source.deallocate(ptr, layout);
            return;
        }
        self.free.push(ptr);
        self.total_released += 1;
    }

    pub(crate) fn total_acquired(&self) -> usize {
        self.total_acquired
    }

    pub(crate) fn total_released(&self) -> usize {
        self.total_released
    }

    pub(crate) fn blocks_per_chunk(&self) -> usize {
        self.chunks.blocks_per_chunk()
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.total_acquired,
            released: self.total_released,
            in_use: self.total_acquired - self.total_released,
            free_blocks: self.free.len(),
            chunks: self.chunks.len(),
        }
    }
}

impl<S: ChunkSource> Drop for PoolState<S> {
    fn drop(&mut self) {
        if self.total_acquired != self.total_released {
            log::warn!(
                "pool state dropped with {} blocks still outstanding ({} acquired, {} released)",
                self.total_acquired - self.total_released,
                self.total_acquired,
                self.total_released,
            );
        }
        // The free list is threaded through the chunks; drop it first so no
        // link survives the chunks it points into.
        self.free = FreeList::new();
        unsafe { self.chunks.release_all(&mut self.source) };
    }
}

/// A pool of fixed-size blocks for elements of type `T`.
///
/// See the [module documentation](index.html) for an overview. The handle
/// itself is lightweight; clones share the underlying state:
///
/// ```
/// use pool_arena::FixedBlockPool;
///
/// let pool = FixedBlockPool::<u64>::new();
/// let ptr = pool.acquire(1)?;
/// unsafe {
///     ptr.as_ptr().write(7);
///     pool.clone().release(ptr, 1);
/// }
/// assert_eq!(pool.in_use(), 0);
/// # Ok::<(), pool_arena::AllocationFailure>(())
/// ```
pub struct FixedBlockPool<T, S: ChunkSource = SystemSource> {
    state: Rc<RefCell<PoolState<S>>>,
    marker: PhantomData<T>,
}

impl<T> FixedBlockPool<T, SystemSource> {
    /// A pool backed by the global allocator, with the default chunk size.
    pub fn new() -> FixedBlockPool<T, SystemSource> {
        FixedBlockPool::with_chunk_bytes(DEFAULT_CHUNK_BYTES)
    }

    /// A pool whose chunks are roughly `chunk_bytes` large; each holds
    /// `chunk_bytes / block_size` blocks (at least one).
    pub fn with_chunk_bytes(chunk_bytes: usize) -> FixedBlockPool<T, SystemSource> {
        FixedBlockPool::with_source(SystemSource::new(), chunk_bytes)
    }
}

impl<T> Default for FixedBlockPool<T, SystemSource> {
    fn default() -> Self {
        FixedBlockPool::new()
    }
}

impl<T, S: ChunkSource> FixedBlockPool<T, S> {
    /// A pool drawing chunks and bulk regions from `source`.
    pub fn with_source(source: S, chunk_bytes: usize) -> FixedBlockPool<T, S> {
        let state = PoolState::new(Layout::new::<T>(), chunk_bytes, source);
        FixedBlockPool {
            state: Rc::new(RefCell::new(state)),
            marker: PhantomData,
        }
    }

    /// Acquire storage for `count` elements.
    ///
    /// `count == 1` is the pooled fast path and may grow the pool by one
    /// chunk; any other count goes straight to the backing source
    /// (`count == 0` returns a dangling, well-aligned pointer). The storage
    /// is uninitialized; the failure is the source's, propagated as-is.
    pub fn acquire(&self, count: usize) -> Result<NonNull<T>, AllocationFailure> {
        self.state.borrow_mut().acquire(count).map(NonNull::cast)
    }

    /// Release storage previously acquired from this pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`acquire`](Self::acquire) on this pool (or
    /// a clone of it) with this exact `count`, must not have been released
    /// already, and must not be used afterwards. Any element left in the
    /// storage is not dropped.
    pub unsafe fn release(&self, ptr: NonNull<T>, count: usize) {
        self.state.borrow_mut().release(ptr.cast(), count)
    }

    /// Single blocks handed out over the pool's lifetime.
    pub fn acquired_count(&self) -> usize {
        self.state.borrow().total_acquired()
    }

    /// Single blocks returned over the pool's lifetime.
    pub fn released_count(&self) -> usize {
        self.state.borrow().total_released()
    }

    /// Blocks currently held by callers.
    pub fn in_use(&self) -> usize {
        let state = self.state.borrow();
        state.total_acquired() - state.total_released()
    }

    /// How many blocks each backing chunk holds.
    pub fn blocks_per_chunk(&self) -> usize {
        self.state.borrow().blocks_per_chunk()
    }

    /// Current accounting, including a walk of the free list.
    pub fn stats(&self) -> PoolStats {
        self.state.borrow().stats()
    }
}

impl<T, S: ChunkSource> Clone for FixedBlockPool<T, S> {
    fn clone(&self) -> Self {
        FixedBlockPool {
            state: Rc::clone(&self.state),
            marker: PhantomData,
        }
    }
}

// Pool handles are interchangeable for container swap semantics: blocks
// released through one handle are acquirable through any other of the same
// element type, so distinguishing them buys nothing.
impl<T, S: ChunkSource> PartialEq for FixedBlockPool<T, S> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T, S: ChunkSource> Eq for FixedBlockPool<T, S> {}

impl<T, S: ChunkSource> fmt::Debug for FixedBlockPool<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("FixedBlockPool")
            .field("in_use", &stats.in_use)
            .field("free_blocks", &stats.free_blocks)
            .field("chunks", &stats.chunks)
            .finish()
    }
}
