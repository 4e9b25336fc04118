//! # Stoat VM Garbage Collector
//!
//! Mark-and-sweep garbage collector with conservative stack scanning.
//!
//! ## Design
//!
//! - **Size-classed blocks**: cells live in 16KB blocks aligned to their own
//!   size, one size class per block, so any candidate pointer resolves to its
//!   block by masking.
//! - **Mixed root discovery**: precise roots (handles, marked vectors, VM
//!   callback) merged with a conservative scan of the native stack, a saved
//!   register snapshot and registered closure-capture ranges.
//! - **Worklist marking**: transitive closure over `Cell::visit_edges`
//!   without native recursion.
//! - **Finalize, then sweep**: unmarked cells get user-observable cleanup
//!   before their slots return to the block freelists.
//! - **Adaptive scheduling**: a byte threshold retargeted to the live set
//!   after every sweep, with counted deferral windows for critical sections.
//!
//! One heap serves one VM on one thread; nothing here is thread-safe across
//! heaps.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod allocator;
pub mod cell;
pub mod conservative;
mod graph;
pub mod heap;
pub mod heap_block;
mod marking;
pub mod roots;
pub mod stack;

pub use allocator::CellAllocator;
pub use cell::{Cell, CellPtr, CellState, GcPtr, Visitor};
pub use conservative::{
    extract_pointer_bits, IS_CELL_PATTERN, SHIFTED_IS_CELL_PATTERN, TAG_SHIFT,
};
pub use heap::{CollectionType, GcStats, Heap, Vm, GC_MIN_BYTES_THRESHOLD};
pub use heap_block::{HeapBlock, BLOCK_SIZE};
pub use roots::{
    DeferGc, Handle, HeapRootOrigin, MarkedVector, RootSet, SourceLocation, WeakCellSet,
    WeakContainer,
};
pub use stack::StackInfo;
