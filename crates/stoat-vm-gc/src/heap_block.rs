//! Block-based cell storage.
//!
//! Cells are allocated in 16KB blocks. Each block is dedicated to a single
//! size class and is aligned to its own size, so the owning block of any
//! candidate pointer is a mask away ([`HeapBlock::from_cell`]).
//!
//! ## Layout
//!
//! ```text
//! HeapBlock (16KB total storage, 16KB aligned):
//! ┌──────────────────────────────┐
//! │ block header (this struct)   │
//! │ Cell 0: [u8; cell_size]      │  (CellHeader + body written by caller)
//! │ Cell 1: [u8; cell_size]      │
//! │ ...                          │
//! │ Cell K: [u8; cell_size]      │
//! └──────────────────────────────┘
//! ```
//!
//! Free slots are either past the lazy bump index (never handed out) or hold
//! a [`FreelistEntry`] overlay linking them into the block freelist.

use std::alloc::{self, Layout};
use std::cell::Cell as StdCell;
use std::mem;
use std::ptr::{self, NonNull};

use crate::cell::{CellHeader, CellPtr, CellState};

/// Block size. Power of two: candidate pointers are resolved to their block
/// by masking.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Cell slots are carved at this alignment; every size class is a multiple.
pub(crate) const CELL_ALIGN: usize = 16;

/// Dead-slot overlay: the header plus the freelist link.
#[repr(C)]
pub(crate) struct FreelistEntry {
    header: CellHeader,
    next: Option<NonNull<CellHeader>>,
}

/// The smallest slot that can still hold a freelist entry when dead.
/// Size classes below this are not instantiated.
pub(crate) const MIN_POSSIBLE_CELL_SIZE: usize = mem::size_of::<FreelistEntry>();

const _: () = assert!(MIN_POSSIBLE_CELL_SIZE <= 24, "cell tracking uses too much data");

/// Offset of the first cell slot from the block base.
const STORAGE_OFFSET: usize =
    (mem::size_of::<HeapBlock>() + CELL_ALIGN - 1) & !(CELL_ALIGN - 1);

/// A fixed-size slab of equal-sized cell slots with a freelist.
///
/// The struct itself lives at the base of its 16KB allocation; cell storage
/// follows at [`STORAGE_OFFSET`].
#[repr(C)]
pub struct HeapBlock {
    cell_size: usize,
    /// Slots at indices >= this have never been handed out. Bump allocation
    /// consumes them before the freelist is ever populated.
    next_lazy_freelist_index: StdCell<usize>,
    freelist: StdCell<Option<NonNull<CellHeader>>>,
}

impl HeapBlock {
    /// Map a new block for the given cell size. The storage area is zeroed,
    /// which is a valid `Dead` header for every slot.
    pub(crate) fn create(cell_size: usize) -> NonNull<HeapBlock> {
        assert!(cell_size >= MIN_POSSIBLE_CELL_SIZE);
        assert!(cell_size % CELL_ALIGN == 0);

        let layout = Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE)
            .expect("block layout is valid");
        // SAFETY: layout is non-zero sized.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }

        let block = base.cast::<HeapBlock>();
        // SAFETY: base is a fresh, aligned allocation large enough for the
        // header.
        unsafe {
            ptr::write(
                block,
                HeapBlock {
                    cell_size,
                    next_lazy_freelist_index: StdCell::new(0),
                    freelist: StdCell::new(None),
                },
            );
        }
        // SAFETY: base is non-null.
        unsafe { NonNull::new_unchecked(block) }
    }

    /// Unmap a block. Remaining cell bodies are not dropped; the sweeper or
    /// teardown pass has already reclaimed them.
    ///
    /// # Safety
    /// `block` must have come from [`HeapBlock::create`] and must not be used
    /// afterwards.
    pub(crate) unsafe fn destroy(block: NonNull<HeapBlock>) {
        let layout = Layout::from_size_align(BLOCK_SIZE, BLOCK_SIZE)
            .expect("block layout is valid");
        // SAFETY: allocated in create() with the same layout.
        unsafe { alloc::dealloc(block.as_ptr().cast::<u8>(), layout) };
    }

    /// The owning block of a candidate cell pointer, by alignment arithmetic.
    ///
    /// Only meaningful if the address actually lies inside a live block; the
    /// caller validates membership before dereferencing.
    pub fn from_cell(addr: usize) -> *mut HeapBlock {
        (addr & !(BLOCK_SIZE - 1)) as *mut HeapBlock
    }

    /// Cell size served by this block.
    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Number of cell slots in this block.
    pub fn cell_count(&self) -> usize {
        (BLOCK_SIZE - STORAGE_OFFSET) / self.cell_size
    }

    fn storage_base(&self) -> usize {
        self as *const HeapBlock as usize + STORAGE_OFFSET
    }

    fn cell(&self, index: usize) -> NonNull<CellHeader> {
        debug_assert!(index < self.cell_count());
        let addr = self.storage_base() + index * self.cell_size;
        // SAFETY: storage addresses are non-null.
        unsafe { NonNull::new_unchecked(addr as *mut CellHeader) }
    }

    fn has_lazy_freelist(&self) -> bool {
        self.next_lazy_freelist_index.get() < self.cell_count()
    }

    /// Whether every slot has been handed out.
    pub fn is_full(&self) -> bool {
        self.freelist.get().is_none() && !self.has_lazy_freelist()
    }

    /// Hand out a free slot, zeroed, or `None` if the block is full.
    ///
    /// The caller writes the slot header and the cell body before the next
    /// collection can observe the slot.
    pub(crate) fn allocate(&self) -> Option<NonNull<CellHeader>> {
        if let Some(entry) = self.freelist.get() {
            // SAFETY: freelist entries are dead slots holding a FreelistEntry
            // overlay.
            let next = unsafe { (*entry.as_ptr().cast::<FreelistEntry>()).next };
            self.freelist.set(next);
            // SAFETY: the slot is cell_size bytes inside this block.
            unsafe { ptr::write_bytes(entry.as_ptr().cast::<u8>(), 0, self.cell_size) };
            return Some(entry);
        }
        if self.has_lazy_freelist() {
            let index = self.next_lazy_freelist_index.get();
            self.next_lazy_freelist_index.set(index + 1);
            // Lazily handed-out slots are still zeroed from block creation.
            return Some(self.cell(index));
        }
        None
    }

    /// Reclaim a live, unmarked slot: drop the stored value and link the slot
    /// into the freelist as `Dead`.
    pub(crate) fn deallocate(&self, cell: CellPtr) {
        assert_eq!(cell.state(), CellState::Live);
        assert!(!cell.is_marked());

        // SAFETY: the slot is live, so as_dyn yields the stored value.
        unsafe { ptr::drop_in_place(cell.as_dyn()) };

        let slot = cell.addr() as *mut FreelistEntry;
        // SAFETY: every size class admits the FreelistEntry overlay.
        unsafe {
            ptr::write(
                slot,
                FreelistEntry {
                    header: CellHeader::new_dead(),
                    next: self.freelist.get(),
                },
            );
            self.freelist
                .set(Some(NonNull::new_unchecked(slot.cast::<CellHeader>())));
        }
    }

    /// Iterate the live cells of this block.
    pub(crate) fn for_each_live_cell(&self, mut f: impl FnMut(CellPtr)) {
        for index in 0..self.next_lazy_freelist_index.get() {
            let cell = CellPtr::from_header(self.cell(index));
            if cell.state() == CellState::Live {
                f(cell);
            }
        }
    }

    /// Resolve a candidate pointer to the live cell whose slot covers it.
    ///
    /// Slots the allocator has not handed out yet never resolve, so memory
    /// reserved but unused cannot be misread as a cell.
    pub fn cell_from_possible_pointer(&self, addr: usize) -> Option<CellPtr> {
        let storage = self.storage_base();
        if addr < storage {
            return None;
        }
        let index = (addr - storage) / self.cell_size;
        if index >= self.next_lazy_freelist_index.get() {
            return None;
        }
        let cell = CellPtr::from_header(self.cell(index));
        (cell.state() == CellState::Live).then_some(cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Cell;
    use std::rc::Rc;

    struct Payload {
        dropped: Rc<StdCell<bool>>,
    }

    impl Cell for Payload {
        fn class_name(&self) -> &'static str {
            "Payload"
        }
    }

    impl Drop for Payload {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    fn allocate_payload(block: &HeapBlock, dropped: Rc<StdCell<bool>>) -> CellPtr {
        let header = block.allocate().expect("block has a free slot");
        // SAFETY: fresh slot; write the header then the body at its offset.
        unsafe {
            ptr::write(header.as_ptr(), CellHeader::new_live::<Payload>());
            let body = header
                .as_ptr()
                .cast::<u8>()
                .add(mem::size_of::<CellHeader>())
                .cast::<Payload>();
            ptr::write(body, Payload { dropped });
        }
        CellPtr::from_header(header)
    }

    #[test]
    fn test_block_creation() {
        let block = HeapBlock::create(64);
        let b = unsafe { block.as_ref() };
        assert_eq!(b.cell_size(), 64);
        assert_eq!(b.cell_count(), (BLOCK_SIZE - STORAGE_OFFSET) / 64);
        assert!(!b.is_full());
        unsafe { HeapBlock::destroy(block) };
    }

    #[test]
    fn test_allocate_strides_by_cell_size() {
        let block = HeapBlock::create(64);
        let b = unsafe { block.as_ref() };
        let a = b.allocate().unwrap().as_ptr() as usize;
        let c = b.allocate().unwrap().as_ptr() as usize;
        assert_eq!(c - a, 64);
        unsafe { HeapBlock::destroy(block) };
    }

    #[test]
    fn test_fill_block_to_full() {
        let block = HeapBlock::create(1024);
        let b = unsafe { block.as_ref() };
        for _ in 0..b.cell_count() {
            assert!(b.allocate().is_some());
        }
        assert!(b.is_full());
        assert!(b.allocate().is_none());
        unsafe { HeapBlock::destroy(block) };
    }

    #[test]
    fn test_deallocate_drops_and_reuses_slot() {
        let block = HeapBlock::create(64);
        let b = unsafe { block.as_ref() };

        let dropped = Rc::new(StdCell::new(false));
        let cell = allocate_payload(b, dropped.clone());
        assert_eq!(cell.state(), CellState::Live);

        b.deallocate(cell);
        assert!(dropped.get());
        assert_eq!(cell.state(), CellState::Dead);

        // Freelist is LIFO: the slot comes straight back.
        let again = b.allocate().unwrap();
        assert_eq!(again.as_ptr() as usize, cell.addr());
        unsafe { HeapBlock::destroy(block) };
    }

    #[test]
    fn test_cell_from_possible_pointer() {
        let block = HeapBlock::create(64);
        let b = unsafe { block.as_ref() };

        let dropped = Rc::new(StdCell::new(false));
        let cell = allocate_payload(b, dropped);

        // Exact and interior pointers resolve to the covering cell.
        assert_eq!(b.cell_from_possible_pointer(cell.addr()), Some(cell));
        assert_eq!(b.cell_from_possible_pointer(cell.addr() + 40), Some(cell));

        // The block header region never resolves.
        assert_eq!(b.cell_from_possible_pointer(block.as_ptr() as usize), None);

        // Slots past the lazy bump index never resolve.
        assert_eq!(b.cell_from_possible_pointer(cell.addr() + 64), None);

        // Dead slots never resolve.
        b.deallocate(cell);
        assert_eq!(b.cell_from_possible_pointer(cell.addr()), None);

        unsafe { HeapBlock::destroy(block) };
    }

    #[test]
    fn test_from_cell_masks_to_block_base() {
        let block = HeapBlock::create(64);
        let b = unsafe { block.as_ref() };
        let cell = b.allocate().unwrap();
        assert_eq!(
            HeapBlock::from_cell(cell.as_ptr() as usize),
            block.as_ptr()
        );
        unsafe { HeapBlock::destroy(block) };
    }
}
