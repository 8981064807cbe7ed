//! Low-level storage primitives shared by the pool allocators.
//!
//! A pool hands out fixed-size blocks carved from larger chunks. While a
//! block is free, its own storage holds the link to the next free block, so
//! the free list costs no memory beyond the blocks themselves. This module
//! provides that intrusive [`FreeList`], the [`ChunkChain`] of backing
//! allocations, and the [`ChunkSource`] seam through which chunks and bulk
//! regions are obtained from the underlying system allocator.

use core::alloc::Layout;
use core::cmp;
use core::fmt;
use core::ptr::NonNull;

use static_assertions::const_assert;

/// The in-place header of a free block.
///
/// This is all a free block stores: the link to the next free block. When
/// the block is handed out, the same bytes hold the caller's element
/// instead. The two interpretations are never live at the same time; the
/// header is written on release and consumed on acquire.
#[repr(C)]
pub struct FreeCell {
    next: Option<FreeBlock>,
}

// A free block must be able to hold its own link, so every block the pools
// hand out is at least pointer-sized and pointer-aligned; `block_layout`
// enforces that. The cell itself must not be any bigger than that promise.
const_assert!(core::mem::size_of::<FreeCell>() == core::mem::size_of::<*mut u8>());
const_assert!(core::mem::align_of::<FreeCell>() == core::mem::align_of::<*mut u8>());

/// A `FreeBlock` is an owning wrapper around a pointer to one free,
/// fixed-size block on a [`FreeList`].
///
/// Note that this is very similar to `Box`, except that it doesn't assume a
/// heap or memory allocator, so it doesn't implement `Clone` or `Drop`.
pub struct FreeBlock {
    cell: NonNull<FreeCell>,
}

// A FreeBlock is sendable - as long as the whole chain is maintained across
// threads, its fine. The concurrent pool relies on this, and guards the
// chain with a lock.
unsafe impl Send for FreeBlock {}

impl FreeBlock {
    /// Construct a `FreeBlock` in the storage at `ptr`, linking it to
    /// `next`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least pointer-sized, pointer-aligned storage
    /// not in use by or accessible to any other program logic; ownership of
    /// that storage transfers to the returned block.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<u8>, next: Option<FreeBlock>) -> FreeBlock {
        let cell: NonNull<FreeCell> = ptr.cast();
        cell.as_ptr().write(FreeCell { next });
        FreeBlock { cell }
    }

    /// Consume this block, returning its storage and the next block in the
    /// list.
    #[must_use]
    pub fn decompose(self) -> (NonNull<u8>, Option<FreeBlock>) {
        let next = unsafe { core::ptr::read(self.cell.as_ptr()).next };
        (self.cell.cast(), next)
    }

    /// The address of this block's storage.
    pub fn as_ptr(&self) -> *mut u8 {
        self.cell.as_ptr() as *mut u8
    }

    fn next(&self) -> Option<&FreeBlock> {
        unsafe { self.cell.as_ref().next.as_ref() }
    }
}

/// A LIFO intrusive list of free blocks.
///
/// The invariant mirrors what the pools promise: every block is either
/// reachable from `head` (free) or held by exactly one caller (acquired) -
/// never both, never neither while the owning pool state is alive. Push and
/// pop are both O(1) and touch only the head.
pub struct FreeList {
    head: Option<FreeBlock>,
}

impl Default for FreeList {
    fn default() -> Self {
        FreeList { head: None }
    }
}

impl FreeList {
    pub const fn new() -> FreeList {
        FreeList { head: None }
    }

    /// Push the storage at `ptr` onto the head of the list.
    ///
    /// # Safety
    ///
    /// `ptr` must satisfy the contract of [`FreeBlock::from_raw`], and the
    /// storage must have been carved with the same block layout as every
    /// other block on this list.
    pub unsafe fn push(&mut self, ptr: NonNull<u8>) {
        let block = FreeBlock::from_raw(ptr, self.head.take());
        self.head = Some(block);
    }

    /// Pop the most recently pushed block, handing its storage back to the
    /// caller.
    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = self.head.take()?;
        let (ptr, next) = block.decompose();
        self.head = next;
        Some(ptr)
    }

    pub fn iter(&self) -> BlockIter {
        BlockIter {
            next: self.head.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

pub struct BlockIter<'list> {
    next: Option<&'list FreeBlock>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = &'list FreeBlock;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = next.next();
        Some(next)
    }
}

impl<'list> IntoIterator for &'list FreeList {
    type Item = &'list FreeBlock;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block.as_ptr())?;
        }
        write!(f, ")")
    }
}

// Round up value to the nearest multiple of increment
pub(crate) fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// The layout of one pool block for elements of layout `element`.
///
/// A block must be able to hold either one element or one [`FreeCell`], so
/// its size and alignment are the maximum of the two, with the size rounded
/// up so blocks tile contiguously inside a chunk.
pub fn block_layout(element: Layout) -> Layout {
    let cell = Layout::new::<FreeCell>();
    let size = cmp::max(element.size(), cell.size());
    let align = cmp::max(element.align(), cell.align());
    Layout::from_size_align(round_up(size, align), align).expect("element layout overflows")
}

/// A chunk or bulk request could not be satisfied by the backing source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationFailure {
    pub size: usize,
    pub align: usize,
}

impl AllocationFailure {
    pub(crate) fn of(layout: Layout) -> AllocationFailure {
        AllocationFailure {
            size: layout.size(),
            align: layout.align(),
        }
    }
}

impl fmt::Display for AllocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "backing allocation of {} bytes (align {}) failed",
            self.size, self.align
        )
    }
}

/// The seam through which pools obtain chunks and bulk regions.
///
/// This abstracts over the underlying system allocator the same way the
/// pools will be asked to abstract over it by their own callers: request a
/// region, later return it. [`SystemSource`] is the real implementation;
/// [`BoundedSource`] exists for tests that need to provoke failure.
pub trait ChunkSource {
    /// Obtain a region satisfying `layout`.
    ///
    /// # Safety
    ///
    /// `layout` must have a non-zero size.
    unsafe fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocationFailure>;

    /// Return a region previously obtained from this source.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from `allocate` on this source with this exact
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// The process's global allocator, with a little bookkeeping.
#[derive(Default)]
pub struct SystemSource {
    // Just for tracking, not really needed
    growths: usize,
}

impl SystemSource {
    pub const fn new() -> SystemSource {
        SystemSource { growths: 0 }
    }

    /// How many regions this source has handed out so far.
    pub fn growths(&self) -> usize {
        self.growths
    }
}

impl ChunkSource for SystemSource {
    unsafe fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocationFailure> {
        match NonNull::new(alloc::alloc::alloc(layout)) {
            Some(ptr) => {
                self.growths += 1;
                Ok(ptr)
            }
            None => Err(AllocationFailure::of(layout)),
        }
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        alloc::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// A byte-budgeted source, mainly useful for testing.
///
/// Requests are served by the global allocator until the budget is
/// exhausted, at which point `allocate` fails the way a real source does
/// when the system is out of memory. Returned regions refund the budget.
pub struct BoundedSource {
    budget: usize,
    used: usize,
    system: SystemSource,
}

impl BoundedSource {
    pub fn new(budget: usize) -> BoundedSource {
        BoundedSource {
            budget,
            used: 0,
            system: SystemSource::new(),
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

impl ChunkSource for BoundedSource {
    unsafe fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocationFailure> {
        if self.used + layout.size() > self.budget {
            return Err(AllocationFailure::of(layout));
        }
        let ptr = self.system.allocate(layout)?;
        self.used += layout.size();
        Ok(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        self.used -= layout.size();
        self.system.deallocate(ptr, layout);
    }
}

/// Byte and call counters recorded by a [`TrackingSource`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrackingStats {
    pub allocated_bytes: usize,
    pub freed_bytes: usize,
    pub allocations: usize,
    pub deallocations: usize,
    pub current_bytes: usize,
    pub peak_bytes: usize,
}

/// A source wrapper that records every request flowing through it.
///
/// Useful for profiling how much backing memory a pool actually draws, and
/// for spotting leaks at the source level: after everything is torn down,
/// `allocated_bytes` and `freed_bytes` should match.
pub struct TrackingSource<S> {
    inner: S,
    stats: TrackingStats,
}

impl<S: ChunkSource> TrackingSource<S> {
    pub fn new(inner: S) -> TrackingSource<S> {
        TrackingSource {
            inner,
            stats: TrackingStats::default(),
        }
    }

    pub fn stats(&self) -> TrackingStats {
        self.stats
    }
}

impl<S: ChunkSource + Default> Default for TrackingSource<S> {
    fn default() -> Self {
        TrackingSource::new(S::default())
    }
}

impl<S: ChunkSource> ChunkSource for TrackingSource<S> {
    unsafe fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, AllocationFailure> {
        let ptr = self.inner.allocate(layout)?;
        let stats = &mut self.stats;
        stats.allocated_bytes += layout.size();
        stats.allocations += 1;
        stats.current_bytes += layout.size();
        stats.peak_bytes = cmp::max(stats.peak_bytes, stats.current_bytes);
        Ok(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, layout: Layout) {
        let stats = &mut self.stats;
        stats.freed_bytes += layout.size();
        stats.deallocations += 1;
        stats.current_bytes -= layout.size();
        self.inner.deallocate(ptr, layout);
    }
}

// The in-place header of a chunk: just the link to the chunk allocated
// before it. The blocks follow the header in the same allocation.
struct ChunkHeader {
    next: Option<NonNull<ChunkHeader>>,
}

/// The chain of backing chunks owned by one pool state.
///
/// Chunks grow monotonically: once allocated, a chunk stays in the chain
/// until [`ChunkChain::release_all`], so every block handed out remains
/// valid for the life of the pool state. Each chunk holds a fixed number of
/// blocks determined at construction.
pub struct ChunkChain {
    head: Option<NonNull<ChunkHeader>>,
    chunks: usize,
    block: Layout,
    blocks_per_chunk: usize,
    // Layout of one whole chunk allocation, and the offset of the first
    // block within it.
    chunk_layout: Layout,
    blocks_offset: usize,
}

// The chain is a plain linked structure; moving it between threads is fine
// as long as it moves as a whole. The concurrent pool keeps it under a lock.
unsafe impl Send for ChunkChain {}

impl ChunkChain {
    /// A chain whose chunks each hold `blocks_per_chunk` blocks of layout
    /// `block`. Nothing is allocated until the first [`grow`](Self::grow).
    pub fn new(block: Layout, blocks_per_chunk: usize) -> ChunkChain {
        assert!(blocks_per_chunk > 0, "a chunk must hold at least one block");
        let header = Layout::new::<ChunkHeader>();
        let blocks = Layout::from_size_align(
            block.size() * blocks_per_chunk,
            block.align(),
        )
        .expect("chunk layout overflows");
        let (chunk_layout, blocks_offset) =
            header.extend(blocks).expect("chunk layout overflows");
        ChunkChain {
            head: None,
            chunks: 0,
            block,
            blocks_per_chunk,
            chunk_layout: chunk_layout.pad_to_align(),
            blocks_offset,
        }
    }

    pub fn block(&self) -> Layout {
        self.block
    }

    pub fn blocks_per_chunk(&self) -> usize {
        self.blocks_per_chunk
    }

    /// How many chunks have been allocated so far.
    pub fn len(&self) -> usize {
        self.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }

    /// Allocate one more chunk from `source` and thread every block in it
    /// onto `free`.
    ///
    /// Blocks are pushed in reverse so the lowest-addressed block ends up at
    /// the head and the chunk's last block links to whatever headed the list
    /// before the growth.
    pub fn grow<S: ChunkSource>(
        &mut self,
        source: &mut S,
        free: &mut FreeList,
    ) -> Result<(), AllocationFailure> {
        let raw = unsafe { source.allocate(self.chunk_layout)? };
        log::debug!(
            "chunk {} allocated at {:?} ({} blocks of {} bytes)",
            self.chunks + 1,
            raw.as_ptr(),
            self.blocks_per_chunk,
            self.block.size(),
        );

        let header: NonNull<ChunkHeader> = raw.cast();
        unsafe {
            header.as_ptr().write(ChunkHeader {
                next: self.head.take(),
            });
        }
        self.head = Some(header);
        self.chunks += 1;

        unsafe {
            let first = raw.as_ptr().add(self.blocks_offset);
            for index in (0..self.blocks_per_chunk).rev() {
                let ptr = first.add(index * self.block.size());
                free.push(NonNull::new_unchecked(ptr));
            }
        }
        Ok(())
    }

    /// Return every chunk to `source`.
    ///
    /// # Safety
    ///
    /// All blocks carved from this chain - free-listed or acquired - become
    /// dangling. The caller must guarantee none of them is used again, and
    /// must drop any free list threaded through them.
    pub unsafe fn release_all<S: ChunkSource>(&mut self, source: &mut S) {
        let mut next = self.head.take();
        while let Some(chunk) = next {
            next = chunk.as_ref().next;
            source.deallocate(chunk.cast(), self.chunk_layout);
        }
        self.chunks = 0;
    }
}
