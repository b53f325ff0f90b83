//! The binary-buddy allocator.

use std::cmp;
use std::fmt::{self, Write as _};

use tracing::{debug, trace};

use crate::arena::{Arena, BlockState, HEADER_SIZE};
use crate::list::FreeList;
use crate::math::{level_of, round_up_pow2, MAX_ARENA_SIZE};
use crate::{AllocError, BlockHandle};

/// A binary-buddy allocator over a single owned arena.
///
/// The allocator is constructed from two parameters, a basic block size and a
/// total memory size, both of which round up to powers of two. Block sizes
/// form size classes `block_size * 2^level` for levels `0..=L`, each with its
/// own free list; level `L` spans the whole arena. Allocation takes the head
/// of the smallest sufficient class, splitting a larger block downward when
/// that class is empty. Deallocation returns the block to its class and
/// eagerly merges it with its buddy, the equal-sized sibling at
/// `offset XOR size`, as long as that buddy is free.
///
/// Every operation is synchronous and bounded by the level count. The
/// allocator is a plain owned value with `&mut self` operations, so exclusive
/// access is enforced by the borrow checker rather than by locking; wrap it
/// in a `Mutex` if multiple threads must share one instance. Dropping the
/// allocator releases the arena in one unit.
pub struct BuddyAllocator {
    arena: Arena,
    block_size: usize,
    memory_size: usize,
    levels: Vec<FreeList>,
}

impl BuddyAllocator {
    /// Bytes of bookkeeping prefixed to every allocation.
    ///
    /// A request for `length` bytes occupies the smallest size class that
    /// holds `length + BLOCK_OVERHEAD` bytes.
    pub const BLOCK_OVERHEAD: usize = HEADER_SIZE;

    /// Constructs an allocator managing a fresh arena.
    ///
    /// Both parameters round up to the nearest power of two, and the basic
    /// block size additionally rounds up to at least
    /// [`BLOCK_OVERHEAD`](Self::BLOCK_OVERHEAD) so a block can hold its own
    /// header. The effective geometry is observable through
    /// [`block_size`](Self::block_size) and
    /// [`memory_size`](Self::memory_size) and may exceed what was requested.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if either parameter is zero,
    /// if `total_memory_size < basic_block_size`, if the total exceeds
    /// 2^31 bytes, or if the normalized arena is too small to hold a single
    /// block.
    pub fn new(
        basic_block_size: usize,
        total_memory_size: usize,
    ) -> Result<BuddyAllocator, AllocError> {
        if basic_block_size == 0 {
            return Err(AllocError::InvalidArgument(
                "basic block size must be positive",
            ));
        }
        if total_memory_size == 0 {
            return Err(AllocError::InvalidArgument(
                "total memory size must be positive",
            ));
        }
        if total_memory_size < basic_block_size {
            return Err(AllocError::InvalidArgument(
                "total memory size must be at least the basic block size",
            ));
        }
        if total_memory_size > MAX_ARENA_SIZE {
            return Err(AllocError::InvalidArgument(
                "total memory size exceeds the 2^31-byte arena limit",
            ));
        }

        let block_size = round_up_pow2(cmp::max(basic_block_size, HEADER_SIZE));
        let memory_size = round_up_pow2(total_memory_size);
        if memory_size < block_size {
            return Err(AllocError::InvalidArgument(
                "total memory size cannot hold a single block",
            ));
        }

        let num_levels = level_of(block_size, memory_size) + 1;
        let mut levels: Vec<FreeList> = (0..num_levels).map(|_| FreeList::new()).collect();

        // Seed the arena with one free block spanning the whole region.
        let mut arena = Arena::new(memory_size);
        arena.init_header(0, memory_size, BlockState::Free);
        levels[num_levels - 1].push(&mut arena, 0);

        debug!(
            block_size,
            memory_size,
            size_classes = num_levels,
            "buddy arena initialized"
        );

        Ok(BuddyAllocator {
            arena,
            block_size,
            memory_size,
            levels,
        })
    }

    /// The effective basic block size, after rounding.
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The effective arena size in bytes, after rounding.
    #[inline]
    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    /// The number of size classes, from `block_size` up to the
    /// arena-spanning block.
    #[inline]
    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    /// Allocates a region of at least `length` usable bytes.
    ///
    /// The request is normalized to the smallest size class holding
    /// `length + BLOCK_OVERHEAD` bytes. If that class has no free block, a
    /// larger block is split down; reachability is established before any
    /// split, so a failed allocation never mutates allocator state.
    /// `alloc(0)` succeeds and consumes one minimum-size block.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfMemory`] if no free block anywhere in the
    /// arena can satisfy the request.
    pub fn alloc(&mut self, length: usize) -> Result<BlockHandle, AllocError> {
        let oom = AllocError::OutOfMemory { requested: length };

        let needed = match length.checked_add(HEADER_SIZE) {
            Some(n) if n <= self.memory_size => cmp::max(round_up_pow2(n), self.block_size),
            _ => {
                debug!(length, "allocation request exceeds arena capacity");
                return Err(oom);
            }
        };

        let target = level_of(self.block_size, needed);

        // Scan upward for the smallest class with a free block. Finding one
        // proves the request is satisfiable before anything is touched.
        let source = match (target..self.levels.len()).find(|&l| !self.levels[l].is_empty()) {
            Some(level) => level,
            None => {
                debug!(length, needed, "no free block large enough");
                return Err(oom);
            }
        };

        let block = self.levels[source]
            .pop(&mut self.arena)
            .expect("scanned level has a free head");

        // Split down to the target class, keeping the front half and
        // assigning each back half to the level below.
        let mut size = self.block_size << source;
        for level in (target..source).rev() {
            size /= 2;
            let buddy = block + size;
            self.arena.set_block_size(block, size);
            self.arena.init_header(buddy, size, BlockState::Free);
            self.levels[level].push(&mut self.arena, buddy);
            trace!(offset = block, size, "split block");
        }

        self.arena.set_state(block, BlockState::Allocated);
        trace!(offset = block, size, length, "allocated");

        Ok(BlockHandle {
            offset: block + HEADER_SIZE,
        })
    }

    /// Returns an allocated region to the free-list structure.
    ///
    /// The block is reinserted into its size class and then merged with its
    /// buddy repeatedly, while the buddy is free and of equal size, so the
    /// structure stays maximally coalesced at all times.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if the handle is empty, lies
    /// outside the arena, does not address a block, or refers to a block
    /// that is already free. A failed call changes nothing.
    ///
    /// # Panics
    ///
    /// Panics if block metadata contradicts the arena tiling (for example a
    /// buddy offset beyond the arena bounds). That indicates corruption from
    /// a use-after-free or an overrun, not a recoverable condition.
    pub fn free(&mut self, handle: BlockHandle) -> Result<(), AllocError> {
        let mut block = self.block_of(handle)?;
        if self.arena.state(block) == BlockState::Free {
            return Err(AllocError::InvalidArgument("block is already free"));
        }

        let mut size = self.arena.block_size(block);
        let mut level = level_of(self.block_size, size);
        self.arena.set_state(block, BlockState::Free);
        self.levels[level].push(&mut self.arena, block);
        trace!(offset = block, size, "freed block");

        // Merge with the buddy while it is free and of equal size. A buddy
        // recorded at a smaller size has been split further and cannot merge
        // yet; its remnants coalesce later, when they are freed themselves.
        while size < self.memory_size {
            let buddy = block ^ size;
            assert!(
                buddy + size <= self.memory_size,
                "corrupt metadata: buddy of block {block} lies outside the arena"
            );

            if self.arena.state(buddy) != BlockState::Free
                || self.arena.block_size(buddy) != size
            {
                break;
            }

            self.levels[level].remove(&mut self.arena, block);
            self.levels[level].remove(&mut self.arena, buddy);

            // The merged block starts at the lower of the two offsets.
            block = cmp::min(block, buddy);
            size *= 2;
            level += 1;
            self.arena.set_block_size(block, size);
            self.levels[level].push(&mut self.arena, block);
            trace!(offset = block, size, "merged with buddy");
        }

        Ok(())
    }

    /// Borrows the usable bytes of a live allocation.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if the handle is empty,
    /// malformed, or does not refer to a currently allocated block.
    pub fn region(&self, handle: BlockHandle) -> Result<&[u8], AllocError> {
        let block = self.live_block_of(handle)?;
        let size = self.arena.block_size(block);
        Ok(self.arena.region(block + HEADER_SIZE, size - HEADER_SIZE))
    }

    /// Mutably borrows the usable bytes of a live allocation.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidArgument`] if the handle is empty,
    /// malformed, or does not refer to a currently allocated block.
    pub fn region_mut(&mut self, handle: BlockHandle) -> Result<&mut [u8], AllocError> {
        let block = self.live_block_of(handle)?;
        let size = self.arena.block_size(block);
        Ok(self.arena.region_mut(block + HEADER_SIZE, size - HEADER_SIZE))
    }

    /// Renders the free-list structure, one line per size class from the
    /// smallest to the largest, in the format `<size in bytes>: <free count>`.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (level, list) in self.levels.iter().enumerate() {
            let _ = writeln!(out, "{}: {}", self.block_size << level, list.len());
        }
        out
    }

    /// The number of free blocks in each size class, smallest first.
    pub fn free_counts(&self) -> Vec<usize> {
        self.levels.iter().map(FreeList::len).collect()
    }

    /// The arena offsets of the free blocks in each size class, smallest
    /// first. Diagnostic companion to [`report`](Self::report) for tests and
    /// inspection; ordering within a class is unspecified.
    pub fn free_offsets(&self) -> Vec<Vec<usize>> {
        self.levels
            .iter()
            .map(|list| list.iter(&self.arena).collect())
            .collect()
    }

    /// Recovers and sanity-checks the block offset behind `handle`.
    fn block_of(&self, handle: BlockHandle) -> Result<usize, AllocError> {
        if handle.is_empty() {
            return Err(AllocError::InvalidArgument("empty handle"));
        }
        if handle.offset < HEADER_SIZE || handle.offset > self.memory_size {
            return Err(AllocError::InvalidArgument("handle lies outside the arena"));
        }

        let block = handle.offset - HEADER_SIZE;
        if block % self.block_size != 0 {
            return Err(AllocError::InvalidArgument(
                "handle does not address a block",
            ));
        }

        let size = self.arena.block_size(block);
        assert!(
            size.is_power_of_two()
                && size >= self.block_size
                && size <= self.memory_size
                && block % size == 0,
            "corrupt block header at offset {block}: recorded size {size}"
        );

        Ok(block)
    }

    fn live_block_of(&self, handle: BlockHandle) -> Result<usize, AllocError> {
        let block = self.block_of(handle)?;
        if self.arena.state(block) != BlockState::Allocated {
            return Err(AllocError::InvalidArgument(
                "handle does not refer to a live allocation",
            ));
        }
        Ok(block)
    }

    /// Walks the arena and asserts the tiling invariant: blocks cover the
    /// region exactly, and every free block is registered in the one free
    /// list matching its size.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let mut free_seen = vec![0usize; self.levels.len()];

        let mut ofs = 0;
        while ofs < self.memory_size {
            let size = self.arena.block_size(ofs);
            assert!(
                size.is_power_of_two() && size >= self.block_size && size <= self.memory_size,
                "block at {ofs} has invalid size {size}"
            );
            assert_eq!(ofs % size, 0, "block at {ofs} is not aligned to its size");

            if self.arena.state(ofs) == BlockState::Free {
                free_seen[level_of(self.block_size, size)] += 1;
            }
            ofs += size;
        }
        assert_eq!(ofs, self.memory_size, "blocks do not tile the arena");

        for (level, list) in self.levels.iter().enumerate() {
            assert_eq!(
                list.len(),
                free_seen[level],
                "free-list count mismatch at level {level}"
            );
            for block in list.iter(&self.arena) {
                assert_eq!(self.arena.block_size(block), self.block_size << level);
                assert_eq!(self.arena.state(block), BlockState::Free);
            }
        }
    }
}

impl fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("block_size", &self.block_size)
            .field("memory_size", &self.memory_size)
            .field("free_counts", &self.free_counts())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_validates_arguments() {
        assert!(matches!(
            BuddyAllocator::new(0, 1024),
            Err(AllocError::InvalidArgument(_))
        ));
        assert!(matches!(
            BuddyAllocator::new(128, 0),
            Err(AllocError::InvalidArgument(_))
        ));
        assert!(matches!(
            BuddyAllocator::new(1024, 128),
            Err(AllocError::InvalidArgument(_))
        ));
        assert!(matches!(
            BuddyAllocator::new(128, (1 << 31) + 1),
            Err(AllocError::InvalidArgument(_))
        ));
        // Arena too small to hold even one block header.
        assert!(matches!(
            BuddyAllocator::new(2, 4),
            Err(AllocError::InvalidArgument(_))
        ));
    }

    #[test]
    fn effective_sizes_round_up() {
        let arena = BuddyAllocator::new(100, 1000).unwrap();
        assert_eq!(arena.block_size(), 128);
        assert_eq!(arena.memory_size(), 1024);
        assert_eq!(arena.levels(), 4);

        // A tiny basic block size rounds up to the header size.
        let arena = BuddyAllocator::new(1, 256).unwrap();
        assert_eq!(arena.block_size(), 16);
    }

    #[test]
    fn fresh_arena_has_one_top_level_block() {
        let arena = BuddyAllocator::new(128, 1024).unwrap();
        assert_eq!(arena.free_counts(), vec![0, 0, 0, 1]);
        assert_eq!(arena.report(), "128: 0\n256: 0\n512: 0\n1024: 1\n");
        assert_eq!(arena.free_offsets(), vec![vec![], vec![], vec![], vec![0]]);
        arena.assert_consistent();
    }

    #[test]
    fn small_allocation_splits_down_and_coalesces_back() {
        let mut arena = BuddyAllocator::new(128, 1024).unwrap();

        // 50 + 16 bytes of header fit a 128-byte block; the 1024 block
        // splits into 128/128/256/512 and one 128 block is consumed.
        let handle = arena.alloc(50).unwrap();
        assert_eq!(arena.free_counts(), vec![1, 1, 1, 0]);
        assert_eq!(arena.report(), "128: 1\n256: 1\n512: 1\n1024: 0\n");
        arena.assert_consistent();

        // Freeing it merges all the way back to a single arena-spanning block.
        arena.free(handle).unwrap();
        assert_eq!(arena.free_counts(), vec![0, 0, 0, 1]);
        arena.assert_consistent();
    }

    #[test]
    fn oversized_requests_fail_without_mutation() {
        let mut arena = BuddyAllocator::new(128, 1024).unwrap();

        let req = 1024 - BuddyAllocator::BLOCK_OVERHEAD + 1;
        assert_eq!(
            arena.alloc(req),
            Err(AllocError::OutOfMemory { requested: req })
        );
        assert_eq!(
            arena.alloc(usize::MAX),
            Err(AllocError::OutOfMemory {
                requested: usize::MAX
            })
        );
        assert_eq!(arena.free_counts(), vec![0, 0, 0, 1]);
        arena.assert_consistent();
    }

    #[test]
    fn exact_fit_consumes_the_whole_arena() {
        let mut arena = BuddyAllocator::new(128, 1024).unwrap();

        let handle = arena.alloc(1024 - BuddyAllocator::BLOCK_OVERHEAD).unwrap();
        assert_eq!(arena.free_counts(), vec![0, 0, 0, 0]);
        arena.assert_consistent();

        assert!(matches!(
            arena.alloc(0),
            Err(AllocError::OutOfMemory { .. })
        ));

        arena.free(handle).unwrap();
        assert_eq!(arena.free_counts(), vec![0, 0, 0, 1]);
    }

    #[test]
    fn buddy_offset_is_an_involution() {
        for level in 0..4 {
            let size = 128usize << level;
            for index in 0..(1024 / size) {
                let ofs = index * size;
                assert_eq!((ofs ^ size) ^ size, ofs);
                // A block and its buddy share a parent-aligned pair.
                assert_eq!(cmp::min(ofs, ofs ^ size) % (2 * size), 0);
            }
        }
    }

    #[test]
    fn merge_waits_for_the_true_buddy() {
        let mut arena = BuddyAllocator::new(128, 512).unwrap();

        let a = arena.alloc(1).unwrap(); // block at 0
        let b = arena.alloc(1).unwrap(); // block at 128
        let c = arena.alloc(1).unwrap(); // block at 256, leaving 384 free

        // Freeing 0 cannot merge: its buddy at 128 is still allocated.
        arena.free(a).unwrap();
        assert_eq!(arena.free_counts(), vec![2, 0, 0]);
        arena.assert_consistent();

        // Freeing 128 merges with 0; 256 still holds back the top merge.
        arena.free(b).unwrap();
        assert_eq!(arena.free_counts(), vec![1, 1, 0]);
        arena.assert_consistent();

        // Freeing 256 merges with 384, then with 0..256, into the full arena.
        arena.free(c).unwrap();
        assert_eq!(arena.free_counts(), vec![0, 0, 1]);
        arena.assert_consistent();
    }

    #[test]
    fn free_rejects_bad_handles() {
        let mut arena = BuddyAllocator::new(128, 1024).unwrap();

        assert_eq!(
            arena.free(BlockHandle::EMPTY),
            Err(AllocError::InvalidArgument("empty handle"))
        );
        assert_eq!(
            arena.free(BlockHandle { offset: 4096 }),
            Err(AllocError::InvalidArgument("handle lies outside the arena"))
        );
        assert_eq!(
            arena.free(BlockHandle {
                offset: HEADER_SIZE + 1
            }),
            Err(AllocError::InvalidArgument("handle does not address a block"))
        );

        let handle = arena.alloc(10).unwrap();
        arena.free(handle).unwrap();
        assert_eq!(
            arena.free(handle),
            Err(AllocError::InvalidArgument("block is already free"))
        );
        arena.assert_consistent();
    }

    #[test]
    fn regions_are_usable_and_scoped_to_the_allocation() {
        let mut arena = BuddyAllocator::new(128, 1024).unwrap();

        let handle = arena.alloc(50).unwrap();
        assert_eq!(arena.region(handle).unwrap().len(), 128 - HEADER_SIZE);

        arena.region_mut(handle).unwrap().fill(0x5A);
        assert!(arena.region(handle).unwrap().iter().all(|&b| b == 0x5A));

        arena.free(handle).unwrap();
        assert!(matches!(
            arena.region(handle),
            Err(AllocError::InvalidArgument(_))
        ));
    }

    #[test]
    fn single_class_arena() {
        let mut arena = BuddyAllocator::new(16, 16).unwrap();
        assert_eq!(arena.levels(), 1);

        let handle = arena.alloc(0).unwrap();
        assert!(matches!(
            arena.alloc(0),
            Err(AllocError::OutOfMemory { .. })
        ));
        arena.free(handle).unwrap();
        assert_eq!(arena.free_counts(), vec![1]);
    }

    #[test]
    fn instances_are_independent() {
        let mut first = BuddyAllocator::new(128, 1024).unwrap();
        let mut second = BuddyAllocator::new(128, 1024).unwrap();

        let handle = first.alloc(50).unwrap();
        assert_eq!(second.free_counts(), vec![0, 0, 0, 1]);

        second.alloc(200).unwrap();
        first.free(handle).unwrap();
        assert_eq!(first.free_counts(), vec![0, 0, 0, 1]);
        assert_eq!(second.free_counts(), vec![0, 1, 1, 0]);
    }
}
