//! Block chain: the allocator's free-list manager.
//!
//! Block descriptors live in an arena indexed by [`BlockId`]. The chain links
//! them through `next` handles in creation order, not address order. Owning
//! blocks are located from payload addresses through an index map, so a
//! caller's pointer is never stepped back to find its header.

#![allow(unsafe_code)]

use std::collections::HashMap;

use super::header::{self, BlockHeader, BlockId, HEADER_SIZE, Origin};

/// Arena descriptor for one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    pub(crate) header: BlockHeader,
    /// Start of the region (header stamp).
    pub(crate) region: usize,
    pub(crate) origin: Origin,
}

impl Block {
    pub(crate) fn new(region: usize, size: usize, free: bool, origin: Origin) -> Self {
        Self {
            header: BlockHeader::new(size, free),
            region,
            origin,
        }
    }

    pub(crate) fn payload(&self) -> usize {
        self.region + HEADER_SIZE
    }

    fn view(&self, id: BlockId) -> BlockView {
        BlockView {
            id,
            payload: self.payload(),
            size: self.header.size,
            free: self.header.free,
            next: self.header.next,
            origin: self.origin,
        }
    }
}

/// Read-only snapshot of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockView {
    pub id: BlockId,
    /// Address handed to callers.
    pub payload: usize,
    pub size: usize,
    pub free: bool,
    pub next: Option<BlockId>,
    pub origin: Origin,
}

impl BlockView {
    /// Address of the header stamp.
    #[must_use]
    pub fn region(&self) -> usize {
        self.payload - HEADER_SIZE
    }

    /// One past the last payload byte.
    #[must_use]
    pub fn end(&self) -> usize {
        self.payload + self.size
    }
}

/// Creation-ordered chain of every block the allocator has created.
///
/// Invariants: every arena slot is reachable from `base` exactly once, `tail`
/// is the last block reached, and `by_payload` maps each block's payload
/// address to its handle.
#[derive(Debug)]
pub struct BlockChain {
    blocks: Vec<Block>,
    base: Option<BlockId>,
    tail: Option<BlockId>,
    by_payload: HashMap<usize, BlockId>,
    max_blocks: usize,
}

// Every handle is a non-zero u32 one past its slot index.
const MAX_BLOCKS: usize = u32::MAX as usize;

impl Default for BlockChain {
    fn default() -> Self {
        Self::with_max_blocks(MAX_BLOCKS)
    }
}

impl BlockChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain whose arena refuses to grow past `max_blocks` descriptors.
    #[must_use]
    pub(crate) fn with_max_blocks(max_blocks: usize) -> Self {
        Self {
            blocks: Vec::new(),
            base: None,
            tail: None,
            by_payload: HashMap::new(),
            max_blocks: max_blocks.min(MAX_BLOCKS),
        }
    }

    /// Number of blocks ever created.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.base.is_none()
    }

    /// Head of the chain.
    #[must_use]
    pub fn base(&self) -> Option<BlockId> {
        self.base
    }

    #[must_use]
    pub fn get(&self, id: BlockId) -> Option<BlockView> {
        self.blocks.get(id.index()).map(|b| b.view(id))
    }

    /// First block, in creation order, that is free and holds `size` bytes.
    ///
    /// Always scans from the head (first-fit).
    #[must_use]
    pub fn find_fit(&self, size: usize) -> Option<BlockId> {
        self.iter()
            .find(|view| view.free && view.size >= size)
            .map(|view| view.id)
    }

    /// Owning block of a payload address.
    #[must_use]
    pub fn locate(&self, payload: usize) -> Option<BlockId> {
        self.by_payload.get(&payload).copied()
    }

    /// Blocks in chain order.
    pub fn iter(&self) -> ChainIter<'_> {
        ChainIter {
            chain: self,
            cursor: self.base,
        }
    }

    /// Whether `count` more blocks can be inserted.
    #[must_use]
    pub(crate) fn has_room(&self, count: usize) -> bool {
        self.blocks
            .len()
            .checked_add(count)
            .is_some_and(|end| end <= self.max_blocks)
    }

    /// Registers a block produced by a backend and stamps its header.
    ///
    /// The block is not reachable until [`append`](Self::append) links it.
    /// Returns `None` when the arena has run out of handles.
    pub(crate) fn insert(&mut self, block: Block) -> Option<BlockId> {
        if !self.has_room(1) {
            return None;
        }
        let id = BlockId::from_index(self.blocks.len())?;
        self.by_payload.insert(block.payload(), id);
        self.blocks.push(block);
        self.write_back(id);
        Some(id)
    }

    /// Sets `next` on an unlinked block. Used to hang a mapping remainder
    /// behind its mapping before the pair is appended.
    pub(crate) fn link(&mut self, id: BlockId, next: BlockId) {
        debug_assert_ne!(id, next, "a block cannot follow itself");
        self.blocks[id.index()].header.next = Some(next);
        self.write_back(id);
    }

    /// Links `id`, and any sub-chain already hanging off it, at the tail.
    pub(crate) fn append(&mut self, id: BlockId) {
        match self.tail {
            None => self.base = Some(id),
            Some(tail) => {
                debug_assert!(self.blocks[tail.index()].header.next.is_none());
                self.blocks[tail.index()].header.next = Some(id);
                self.write_back(tail);
            }
        }
        let mut last = id;
        while let Some(next) = self.blocks[last.index()].header.next {
            last = next;
        }
        self.tail = Some(last);
    }

    /// Flips the free flag and rewrites the header stamp.
    pub(crate) fn set_free(&mut self, id: BlockId, free: bool) {
        self.blocks[id.index()].header.free = free;
        self.write_back(id);
    }

    pub(crate) fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    fn write_back(&self, id: BlockId) {
        let block = &self.blocks[id.index()];
        // SAFETY: every block's region came from a backend that guarantees at
        // least HEADER_SIZE writable bytes at its start.
        unsafe { header::stamp(block.region, block.header) };
    }

    /// Header stamp currently in memory for `id`.
    #[must_use]
    pub fn stamped_header(&self, id: BlockId) -> Option<BlockHeader> {
        let block = self.blocks.get(id.index())?;
        // SAFETY: insert() stamped this region and write_back() keeps it current.
        Some(unsafe { header::read_stamp(block.region) })
    }
}

/// Iterator over a [`BlockChain`] in chain order.
pub struct ChainIter<'a> {
    chain: &'a BlockChain,
    cursor: Option<BlockId>,
}

impl Iterator for ChainIter<'_> {
    type Item = BlockView;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let block = &self.chain.blocks[id.index()];
        self.cursor = block.header.next;
        Some(block.view(id))
    }
}
