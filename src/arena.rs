//! The owned arena and the block-header codec.
//!
//! Every block, free or allocated, begins with a fixed 16-byte header encoded
//! little-endian into the arena bytes at the block's offset:
//!
//! ```text
//! bytes 0..4    size   current block size in bytes, header included
//! bytes 4..8    state  0 = free, 1 = allocated
//! bytes 8..12   prev   free-list link, u32::MAX = none
//! bytes 12..16  next   free-list link, u32::MAX = none
//! ```
//!
//! The link fields are meaningful only while the block is free. Blocks are
//! identified by plain byte offsets rather than pointers; any access to a
//! block's metadata or payload goes through the [`Arena`], which owns the
//! backing buffer outright.

/// Size in bytes of the header prefixed to every block.
pub(crate) const HEADER_SIZE: usize = 16;

const SIZE_FIELD: usize = 0;
const STATE_FIELD: usize = 4;
const PREV_FIELD: usize = 8;
const NEXT_FIELD: usize = 12;

/// Sentinel link value marking the end of a free list.
const NIL: u32 = u32::MAX;

/// Allocation state of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// The block is free and registered in the free list of its size class.
    Free,
    /// The block is held by a caller.
    Allocated,
}

impl BlockState {
    #[inline]
    const fn as_bits(self) -> u32 {
        match self {
            BlockState::Free => 0,
            BlockState::Allocated => 1,
        }
    }

    /// Decodes a state field. Any value other than the two defined states
    /// means the header bytes were overwritten; that is metadata corruption,
    /// not a recoverable condition.
    #[inline]
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => BlockState::Free,
            1 => BlockState::Allocated,
            other => panic!("corrupt block header: state field holds {other}"),
        }
    }
}

/// The contiguous byte region managed by an allocator, plus the header codec.
pub(crate) struct Arena {
    bytes: Box<[u8]>,
}

impl Arena {
    /// Allocates a zeroed arena of `len` bytes.
    pub(crate) fn new(len: usize) -> Arena {
        Arena {
            bytes: vec![0u8; len].into_boxed_slice(),
        }
    }

    #[inline]
    fn field(&self, at: usize) -> u32 {
        let raw: [u8; 4] = self.bytes[at..at + 4]
            .try_into()
            .expect("header field is four bytes");
        u32::from_le_bytes(raw)
    }

    #[inline]
    fn set_field(&mut self, at: usize, value: u32) {
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Reads the recorded size of the block at `block`.
    #[inline]
    pub(crate) fn block_size(&self, block: usize) -> usize {
        self.field(block + SIZE_FIELD) as usize
    }

    /// Records a new size for the block at `block`.
    #[inline]
    pub(crate) fn set_block_size(&mut self, block: usize, size: usize) {
        self.set_field(block + SIZE_FIELD, size as u32);
    }

    /// Reads the allocation state of the block at `block`.
    #[inline]
    pub(crate) fn state(&self, block: usize) -> BlockState {
        BlockState::from_bits(self.field(block + STATE_FIELD))
    }

    /// Records the allocation state of the block at `block`.
    #[inline]
    pub(crate) fn set_state(&mut self, block: usize, state: BlockState) {
        self.set_field(block + STATE_FIELD, state.as_bits());
    }

    /// Reads the backward free-list link of the block at `block`.
    #[inline]
    pub(crate) fn prev(&self, block: usize) -> Option<usize> {
        decode_link(self.field(block + PREV_FIELD))
    }

    /// Writes the backward free-list link of the block at `block`.
    #[inline]
    pub(crate) fn set_prev(&mut self, block: usize, prev: Option<usize>) {
        self.set_field(block + PREV_FIELD, encode_link(prev));
    }

    /// Reads the forward free-list link of the block at `block`.
    #[inline]
    pub(crate) fn next(&self, block: usize) -> Option<usize> {
        decode_link(self.field(block + NEXT_FIELD))
    }

    /// Writes the forward free-list link of the block at `block`.
    #[inline]
    pub(crate) fn set_next(&mut self, block: usize, next: Option<usize>) {
        self.set_field(block + NEXT_FIELD, encode_link(next));
    }

    /// Writes a complete header at `block` with cleared links.
    pub(crate) fn init_header(&mut self, block: usize, size: usize, state: BlockState) {
        self.set_block_size(block, size);
        self.set_state(block, state);
        self.set_prev(block, None);
        self.set_next(block, None);
    }

    /// Borrows `len` bytes starting at `start`.
    #[inline]
    pub(crate) fn region(&self, start: usize, len: usize) -> &[u8] {
        &self.bytes[start..start + len]
    }

    /// Mutably borrows `len` bytes starting at `start`.
    #[inline]
    pub(crate) fn region_mut(&mut self, start: usize, len: usize) -> &mut [u8] {
        &mut self.bytes[start..start + len]
    }
}

#[inline]
fn encode_link(link: Option<usize>) -> u32 {
    match link {
        Some(block) => block as u32,
        None => NIL,
    }
}

#[inline]
fn decode_link(raw: u32) -> Option<usize> {
    (raw != NIL).then_some(raw as usize)
}
