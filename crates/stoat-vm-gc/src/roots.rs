//! Precise roots and their registrations.
//!
//! [`Handle`], [`MarkedVector`] and [`WeakCellSet`] are RAII registrations
//! against the owning [`Heap`]: creating one registers it, dropping it
//! unregisters it, and the borrow on the heap keeps every registration from
//! outliving the collector. [`DeferGc`] is the counted deferral scope.

use std::fmt;
use std::ptr::NonNull;

use rustc_hash::FxHashMap;

use crate::cell::{CellPtr, CellState};
use crate::heap::Heap;

/// Attribution for a root found in a registered closure range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    /// Enclosing function of the closure's registration site.
    pub function: &'static str,
    /// File of the registration site.
    pub file: &'static str,
    /// Line of the registration site.
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.function, self.file, self.line)
    }
}

/// Where a root came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapRootOrigin {
    /// A registered [`Handle`].
    Handle,
    /// An element of a registered [`MarkedVector`].
    MarkedVector,
    /// A word from the saved register snapshot.
    RegisterPointer,
    /// A word from the native stack walk.
    StackPointer,
    /// A precise VM root (globals, current activation).
    Vm,
    /// A word from a registered closure-capture range.
    SafeFunction(SourceLocation),
}

/// The roots of one collection cycle, keyed by cell with their origin.
pub type RootSet = FxHashMap<CellPtr, HeapRootOrigin>;

/// A precise, externally registered strong reference to a cell.
///
/// The target survives every collection while the handle is alive.
pub struct Handle<'heap> {
    heap: &'heap Heap,
    id: u64,
    cell: CellPtr,
}

impl<'heap> Handle<'heap> {
    /// Register a strong root for `cell`.
    pub fn new(heap: &'heap Heap, cell: CellPtr) -> Handle<'heap> {
        let id = heap.did_create_handle(cell);
        Handle { heap, id, cell }
    }

    /// The pinned cell.
    pub fn cell(&self) -> CellPtr {
        self.cell
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        self.heap.did_destroy_handle(self.id);
    }
}

/// A growable collection whose elements are precise roots for every cycle.
pub struct MarkedVector<'heap> {
    heap: &'heap Heap,
    // Boxed so the element vector has a stable address for the registry.
    cells: Box<Vec<CellPtr>>,
}

impl<'heap> MarkedVector<'heap> {
    /// Register an empty marked vector.
    pub fn new(heap: &'heap Heap) -> MarkedVector<'heap> {
        let cells: Box<Vec<CellPtr>> = Box::default();
        heap.did_create_marked_vector(NonNull::from(&*cells));
        MarkedVector { heap, cells }
    }

    /// Append a cell; it is a root from now on.
    pub fn push(&mut self, cell: CellPtr) {
        self.cells.push(cell);
    }

    /// Drop all elements.
    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the vector is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Iterate the elements.
    pub fn iter(&self) -> impl Iterator<Item = CellPtr> + '_ {
        self.cells.iter().copied()
    }
}

impl Drop for MarkedVector<'_> {
    fn drop(&mut self) {
        self.heap.did_destroy_marked_vector(NonNull::from(&*self.cells));
    }
}

/// A collection purged after marking; membership does not keep cells alive.
pub trait WeakContainer {
    /// Drop references whose target did not survive the cycle. Runs during
    /// the sweep, after the per-cell pass and before block reclamation.
    fn remove_dead_cells(&mut self);
}

struct WeakCells {
    cells: Vec<CellPtr>,
}

impl WeakContainer for WeakCells {
    fn remove_dead_cells(&mut self) {
        self.cells.retain(|cell| cell.state() == CellState::Live);
    }
}

/// A registered weak set of cells, purged by the sweeper each cycle.
pub struct WeakCellSet<'heap> {
    heap: &'heap Heap,
    cells: Box<WeakCells>,
}

impl<'heap> WeakCellSet<'heap> {
    /// Register an empty weak set.
    pub fn new(heap: &'heap Heap) -> WeakCellSet<'heap> {
        let mut cells = Box::new(WeakCells { cells: Vec::new() });
        let container = NonNull::from(&mut *cells as &mut dyn WeakContainer);
        heap.did_create_weak_container(container);
        WeakCellSet { heap, cells }
    }

    /// Add a weak reference to `cell`.
    pub fn add(&mut self, cell: CellPtr) {
        self.cells.cells.push(cell);
    }

    /// Whether the set still holds `cell`.
    pub fn contains(&self, cell: CellPtr) -> bool {
        self.cells.cells.contains(&cell)
    }

    /// Number of surviving references.
    pub fn len(&self) -> usize {
        self.cells.cells.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.cells.is_empty()
    }
}

impl Drop for WeakCellSet<'_> {
    fn drop(&mut self) {
        let container = NonNull::from(&mut *self.cells as &mut dyn WeakContainer);
        self.heap.did_destroy_weak_container(container);
    }
}

/// Counted scope during which automatic collection is postponed.
///
/// A collection requested while any deferral is active runs once, when the
/// last deferral ends.
pub struct DeferGc<'heap> {
    heap: &'heap Heap,
}

impl<'heap> DeferGc<'heap> {
    /// Enter a deferral scope.
    pub fn new(heap: &'heap Heap) -> DeferGc<'heap> {
        heap.defer_gc();
        DeferGc { heap }
    }
}

impl Drop for DeferGc<'_> {
    fn drop(&mut self) {
        self.heap.undefer_gc();
    }
}
