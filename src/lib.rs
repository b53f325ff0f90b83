//! Arena-backed binary-buddy memory allocation.
//!
//! A [`BuddyAllocator`] owns a single contiguous arena and hands out
//! power-of-two sized blocks from it: requests round up to the nearest size
//! class, larger free blocks split in half on demand, and freed blocks merge
//! eagerly with their address-symmetric buddies. This is the allocator shape
//! a kernel or embedded runtime uses to serve variable-sized regions from a
//! preallocated pool without touching a general-purpose heap.
//!
//! The arena is an owned byte buffer and every block is identified by its
//! offset into it, so the whole crate is free of raw pointer arithmetic.
//!
//! ```
//! use buddy_arena::BuddyAllocator;
//!
//! let mut arena = BuddyAllocator::new(128, 1024)?;
//!
//! let handle = arena.alloc(50)?;
//! arena.region_mut(handle)?.fill(0xAB);
//! arena.free(handle)?;
//! # Ok::<(), buddy_arena::AllocError>(())
//! ```

#![doc(html_root_url = "https://docs.rs/buddy_arena/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod arena;
mod buddy;
mod list;
mod math;


use thiserror::Error;

pub use crate::buddy::BuddyAllocator;

/// The error type for allocator operations.
///
/// Both variants leave the allocator untouched; a failed call never mutates
/// free-list state. Metadata corruption (a block header contradicting the
/// arena tiling) is not an error value: it panics, since continuing would
/// propagate the corruption.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// A construction parameter or handle is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No free block large enough for the request exists anywhere in the
    /// arena. Recoverable: freeing other allocations may make room.
    #[error("out of memory (requested {requested} bytes)")]
    OutOfMemory {
        /// The requested usable length, in bytes.
        requested: usize,
    },
}

/// An opaque handle to a region allocated from a [`BuddyAllocator`].
///
/// A handle is only meaningful to the allocator that issued it. The usable
/// bytes behind a live handle are reached through
/// [`BuddyAllocator::region`] and [`BuddyAllocator::region_mut`].
///
/// The default value is [`BlockHandle::EMPTY`], which no live allocation
/// ever equals; passing it to [`BuddyAllocator::free`] fails with
/// [`AllocError::InvalidArgument`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    /// Offset of the usable region from the arena base. Usable regions
    /// always start past a block header, so zero marks the empty handle.
    pub(crate) offset: usize,
}

impl BlockHandle {
    /// The empty handle: refers to no allocation.
    pub const EMPTY: BlockHandle = BlockHandle { offset: 0 };

    /// Returns `true` if this is the empty handle.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.offset == 0
    }
}
