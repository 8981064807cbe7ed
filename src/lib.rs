#![no_std]

//! Fixed-block pool and bump arena allocators.
//!
//! ## The types
//!
//! ### [`FixedBlockPool`](pool/struct.FixedBlockPool.html)
//!
//! An O(1) allocator for same-sized objects: free blocks form an intrusive
//! LIFO list threaded through the blocks themselves, and the pool grows one
//! chunk at a time when the list runs dry. Handles are cheap clones sharing
//! one reference-counted state, and the state reports a leak diagnostic at
//! teardown if acquires and releases don't balance. Single-threaded.
//!
//! ### [`BumpArena`](arena/struct.BumpArena.html)
//!
//! A fixed-capacity buffer served by bumping an offset, with alignment
//! handled per request. Everything is released at once by `reset`, in O(1);
//! a high-water mark survives resets for capacity tuning.
//!
//! ### [`ConcurrentFixedBlockPool`](concurrent/struct.ConcurrentFixedBlockPool.html)
//!
//! The pool's algorithm under a spin lock, safe for concurrent acquire and
//! release from many threads.
//!
//! ### [`ChunkSource`](blocks/trait.ChunkSource.html)
//!
//! The seam through which the pools draw backing memory. [`SystemSource`]
//! is the global allocator; [`BoundedSource`] is a byte-budgeted source for
//! tests that need allocation failure on demand; [`TrackingSource`] wraps
//! any source with byte and call accounting.
//!
//! None of these is a general-purpose heap: pools and arenas grow
//! monotonically and hand their memory back only at teardown (or, for the
//! arena, at `reset`). That trade is what makes every hot-path operation a
//! few pointer moves.

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod arena;
pub mod blocks;
pub mod concurrent;
pub mod pool;

pub use arena::{ArenaHandle, BumpArena, CapacityExceeded, BUFFER_ALIGN};
pub use blocks::{
    AllocationFailure, BoundedSource, ChunkSource, SystemSource, TrackingSource, TrackingStats,
};
pub use concurrent::ConcurrentFixedBlockPool;
pub use pool::{FixedBlockPool, PoolStats, DEFAULT_CHUNK_BYTES};
