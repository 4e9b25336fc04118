//! Per-size-class block ownership.
//!
//! A [`CellAllocator`] owns every [`HeapBlock`] of one cell size, split into
//! a usable list (blocks with free slots) and a full list. The sweeper
//! reports transitions back through [`CellAllocator::block_did_become_empty`]
//! and [`CellAllocator::block_did_become_usable`].

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::cell::CellHeader;
use crate::heap_block::HeapBlock;

/// Owns the blocks of one size class and serves allocations from them.
pub struct CellAllocator {
    cell_size: usize,
    usable_blocks: RefCell<Vec<NonNull<HeapBlock>>>,
    full_blocks: RefCell<Vec<NonNull<HeapBlock>>>,
}

fn remove_block(list: &RefCell<Vec<NonNull<HeapBlock>>>, block: NonNull<HeapBlock>) -> bool {
    let mut list = list.borrow_mut();
    match list.iter().position(|b| *b == block) {
        Some(index) => {
            list.swap_remove(index);
            true
        }
        None => false,
    }
}

impl CellAllocator {
    /// Create an allocator for one cell size.
    pub fn new(cell_size: usize) -> CellAllocator {
        CellAllocator {
            cell_size,
            usable_blocks: RefCell::new(Vec::new()),
            full_blocks: RefCell::new(Vec::new()),
        }
    }

    /// Cell size served by this allocator.
    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Hand out a zeroed slot, carving a new block if every owned block is
    /// full.
    pub(crate) fn allocate_cell(&self) -> NonNull<CellHeader> {
        let mut usable = self.usable_blocks.borrow_mut();
        if usable.is_empty() {
            usable.push(HeapBlock::create(self.cell_size));
            #[cfg(feature = "heap_debug")]
            tracing::trace!(
                target: "stoat::gc",
                cell_size = self.cell_size,
                "new heap block"
            );
        }

        let block_ptr = *usable.last().expect("usable block list is not empty");
        // SAFETY: blocks stay mapped while owned by this allocator.
        let block = unsafe { block_ptr.as_ref() };
        let cell = block.allocate().expect("usable block has a free slot");
        if block.is_full() {
            usable.pop();
            self.full_blocks.borrow_mut().push(block_ptr);
        }
        cell
    }

    /// Sweeper callback: the block has no live cells left; unmap it.
    pub(crate) fn block_did_become_empty(&self, block: NonNull<HeapBlock>) {
        let removed =
            remove_block(&self.usable_blocks, block) || remove_block(&self.full_blocks, block);
        assert!(removed, "sweeper reported a block this allocator does not own");
        // SAFETY: the block was owned by this allocator and is now unlinked.
        unsafe { HeapBlock::destroy(block) };
    }

    /// Sweeper callback: a previously full block has free slots again.
    pub(crate) fn block_did_become_usable(&self, block: NonNull<HeapBlock>) {
        let removed = remove_block(&self.full_blocks, block);
        assert!(removed, "block was not on the full list");
        self.usable_blocks.borrow_mut().push(block);
    }

    /// Iterate every owned block.
    ///
    /// The callback must not allocate from or report transitions to this
    /// allocator.
    pub(crate) fn for_each_block(&self, mut f: impl FnMut(NonNull<HeapBlock>)) {
        for block in self.usable_blocks.borrow().iter() {
            f(*block);
        }
        for block in self.full_blocks.borrow().iter() {
            f(*block);
        }
    }
}

impl Drop for CellAllocator {
    fn drop(&mut self) {
        // Teardown already ran its sweep; any cells still live here opted out
        // of collection, and only the memory is returned.
        for block in self.usable_blocks.get_mut().drain(..) {
            // SAFETY: owned block, unlinked above.
            unsafe { HeapBlock::destroy(block) };
        }
        for block in self.full_blocks.get_mut().drain(..) {
            // SAFETY: owned block, unlinked above.
            unsafe { HeapBlock::destroy(block) };
        }
    }
}
