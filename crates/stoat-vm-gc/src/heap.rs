//! The heap: allocation front end, root registries and the collection driver.
//!
//! One `Heap` serves one VM instance, bound to one native thread. Allocation
//! may synchronously run a full collection; during a collection no mutator
//! code runs except finalizers, which must not allocate or re-enter the
//! collector.

use std::cell::{Cell as StdCell, Ref, RefCell};
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::allocator::CellAllocator;
use crate::cell::{Cell, CellHeader, CellPtr, GcPtr, Visitor};
use crate::heap_block::{HeapBlock, BLOCK_SIZE, CELL_ALIGN, MIN_POSSIBLE_CELL_SIZE};
use crate::marking::MarkingVisitor;
use crate::roots::{HeapRootOrigin, RootSet, SourceLocation, WeakContainer};
use crate::stack::StackInfo;

/// Floor for the adaptive collection threshold: a cycle is not retriggered
/// before at least this many bytes have been allocated.
pub const GC_MIN_BYTES_THRESHOLD: usize = 4 * 1024 * 1024;

/// What a collection cycle does about roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionType {
    /// Gather roots, mark, then reclaim what is unreachable.
    CollectGarbage,
    /// Skip marking entirely: nothing is a root, every cell that does not
    /// insist on surviving is collected. Used at heap teardown.
    CollectEverything,
}

/// Counters from the most recent completed collection.
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Completed collections.
    pub collections: u64,
    /// Cells that survived the last sweep.
    pub live_cells: usize,
    /// Bytes occupied by surviving cells.
    pub live_cell_bytes: usize,
    /// Cells reclaimed by the last sweep.
    pub collected_cells: usize,
    /// Bytes reclaimed by the last sweep.
    pub collected_cell_bytes: usize,
    /// Wall-clock duration of the last collection.
    pub last_gc_duration: Duration,
}

/// The VM protocol consumed by the heap.
pub trait Vm {
    /// Populate `roots` with precise VM roots (globals, the current
    /// activation), tagged [`HeapRootOrigin::Vm`].
    fn gather_roots(&self, roots: &mut RootSet);

    /// Enumerate interpreter-internal roots (operand stacks, register files)
    /// that the precise registries do not own.
    fn visit_interpreter_edges(&self, visitor: &mut dyn Visitor);

    /// Native stack bounds of the thread this VM is bound to.
    fn stack_info(&self) -> &StackInfo;

    /// Drop VM-side string caches. Called once, before the final teardown
    /// collection.
    fn clear_string_caches(&self) {}
}

/// A registered closure-capture range, scanned conservatively each cycle.
pub(crate) struct ConservativeRange {
    pub(crate) word_count: usize,
    pub(crate) location: SourceLocation,
}

/// Clears the collection-in-progress flag on every exit path.
struct FlagGuard<'a>(&'a StdCell<bool>);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// The per-VM collector instance.
pub struct Heap {
    vm: Rc<dyn Vm>,
    /// Ordered by increasing cell size.
    allocators: Vec<CellAllocator>,
    handles: RefCell<Vec<(u64, CellPtr)>>,
    next_handle_id: StdCell<u64>,
    marked_vectors: RefCell<Vec<NonNull<Vec<CellPtr>>>>,
    weak_containers: RefCell<Vec<NonNull<dyn WeakContainer>>>,
    uprooted_cells: RefCell<Vec<CellPtr>>,
    custom_ranges: RefCell<FxHashMap<usize, ConservativeRange>>,
    gc_deferrals: StdCell<usize>,
    should_gc_when_deferral_ends: StdCell<bool>,
    collecting_garbage: StdCell<bool>,
    gc_bytes_threshold: StdCell<usize>,
    allocated_bytes_since_last_gc: StdCell<usize>,
    collect_on_every_allocation: StdCell<bool>,
    stats: RefCell<GcStats>,
}

impl Heap {
    /// Create a heap for the given VM, bound to the calling thread.
    pub fn new(vm: Rc<dyn Vm>) -> Heap {
        let mut allocators = Vec::new();
        if MIN_POSSIBLE_CELL_SIZE <= 16 {
            allocators.push(CellAllocator::new(16));
        }
        for cell_size in [32, 64, 96, 128, 256, 512, 1024, 3072] {
            allocators.push(CellAllocator::new(cell_size));
        }

        Heap {
            vm,
            allocators,
            handles: RefCell::new(Vec::new()),
            next_handle_id: StdCell::new(0),
            marked_vectors: RefCell::new(Vec::new()),
            weak_containers: RefCell::new(Vec::new()),
            uprooted_cells: RefCell::new(Vec::new()),
            custom_ranges: RefCell::new(FxHashMap::default()),
            gc_deferrals: StdCell::new(0),
            should_gc_when_deferral_ends: StdCell::new(false),
            collecting_garbage: StdCell::new(false),
            gc_bytes_threshold: StdCell::new(GC_MIN_BYTES_THRESHOLD),
            allocated_bytes_since_last_gc: StdCell::new(0),
            collect_on_every_allocation: StdCell::new(false),
            stats: RefCell::new(GcStats::default()),
        }
    }

    // ---------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------

    /// Allocate a cell, collecting first if the adaptive threshold says so.
    ///
    /// The value lands in a zeroed slot of the smallest size class that fits.
    /// Fatal if the value exceeds the largest class.
    pub fn allocate<T: Cell>(&self, value: T) -> GcPtr<T> {
        assert!(
            mem::align_of::<T>() <= CELL_ALIGN,
            "cell alignment exceeds slot alignment"
        );
        let size = mem::size_of::<CellHeader>() + mem::size_of::<T>();

        if self.collect_on_every_allocation.get() {
            self.allocated_bytes_since_last_gc.set(0);
            self.collect_garbage(CollectionType::CollectGarbage, false);
        } else if self.allocated_bytes_since_last_gc.get() + size > self.gc_bytes_threshold.get()
        {
            self.allocated_bytes_since_last_gc.set(0);
            self.collect_garbage(CollectionType::CollectGarbage, false);
        }
        self.allocated_bytes_since_last_gc
            .set(self.allocated_bytes_since_last_gc.get() + size);

        let header = self.allocator_for_size(size).allocate_cell();
        // SAFETY: a fresh slot of at least `size` bytes, zeroed; header first,
        // body at the fixed offset behind it.
        let body = unsafe {
            ptr::write(header.as_ptr(), CellHeader::new_live::<T>());
            let body = header
                .as_ptr()
                .cast::<u8>()
                .add(mem::size_of::<CellHeader>())
                .cast::<T>();
            ptr::write(body, value);
            NonNull::new_unchecked(body)
        };
        GcPtr::from_body(body)
    }

    fn allocator_for_size(&self, cell_size: usize) -> &CellAllocator {
        for allocator in &self.allocators {
            if allocator.cell_size() >= cell_size {
                return allocator;
            }
        }
        let largest = self
            .allocators
            .last()
            .expect("heap has allocators")
            .cell_size();
        panic!("no cell allocator for cell size {cell_size}, largest available is {largest}");
    }

    // ---------------------------------------------------------------
    // Collection driver
    // ---------------------------------------------------------------

    /// Run a collection. Non-reentrant; a `CollectGarbage` request during an
    /// active deferral is recorded and runs when the deferral window closes.
    pub fn collect_garbage(&self, collection_type: CollectionType, print_report: bool) {
        assert!(
            !self.collecting_garbage.get(),
            "reentrant garbage collection"
        );
        self.collecting_garbage.set(true);
        let _collecting = FlagGuard(&self.collecting_garbage);

        let start = Instant::now();

        if collection_type == CollectionType::CollectGarbage {
            if self.gc_deferrals.get() > 0 {
                self.should_gc_when_deferral_ends.set(true);
                return;
            }
            let mut roots = RootSet::default();
            self.gather_roots(&mut roots);
            self.mark_live_cells(&roots);
        }
        self.finalize_unmarked_cells();
        self.sweep_dead_cells(print_report, start);
    }

    /// Assemble the cycle's roots: precise VM roots, conservative scan,
    /// handles, marked vectors.
    pub(crate) fn gather_roots(&self, roots: &mut RootSet) {
        self.vm.gather_roots(roots);
        self.gather_conservative_roots(roots);

        for &(_, cell) in self.handles.borrow().iter() {
            roots.insert(cell, HeapRootOrigin::Handle);
        }
        for vector in self.marked_vectors.borrow().iter() {
            // SAFETY: registered vectors are Box-pinned by MarkedVector and
            // unregister before they drop.
            for &cell in unsafe { vector.as_ref() } {
                roots.insert(cell, HeapRootOrigin::MarkedVector);
            }
        }

        #[cfg(feature = "heap_debug")]
        for (cell, origin) in roots.iter() {
            tracing::trace!(target: "stoat::gc", ?cell, ?origin, "+ root");
        }
    }

    fn mark_live_cells(&self, roots: &RootSet) {
        #[cfg(feature = "heap_debug")]
        tracing::trace!(target: "stoat::gc", roots = roots.len(), "mark_live_cells");

        let mut visitor = MarkingVisitor::new(roots);
        self.vm.visit_interpreter_edges(&mut visitor);
        visitor.mark_all_live_cells();

        for cell in self.uprooted_cells.borrow_mut().drain(..) {
            cell.set_marked(false);
        }
    }

    fn cell_must_survive_garbage_collection(cell: CellPtr) -> bool {
        // SAFETY: only called on live cells while the collector has exclusive
        // access.
        let cell_ref = unsafe { &*cell.as_dyn() };
        cell_ref.overrides_must_survive_garbage_collection()
            && cell_ref.must_survive_garbage_collection()
    }

    fn finalize_unmarked_cells(&self) {
        self.for_each_block(|block| {
            // SAFETY: blocks stay mapped for the whole collection.
            unsafe { block.as_ref() }.for_each_live_cell(|cell| {
                if !cell.is_marked() && !Self::cell_must_survive_garbage_collection(cell) {
                    // SAFETY: live, unmarked cell; finalizers run exactly once
                    // before the sweep reclaims the slot.
                    unsafe { (*cell.as_dyn()).finalize() };
                }
            });
        });
    }

    fn sweep_dead_cells(&self, print_report: bool, start: Instant) {
        #[cfg(feature = "heap_debug")]
        tracing::trace!(target: "stoat::gc", "sweep_dead_cells");

        let mut empty_blocks = Vec::new();
        let mut full_blocks_that_became_usable = Vec::new();

        let mut collected_cells = 0usize;
        let mut live_cells = 0usize;
        let mut collected_cell_bytes = 0usize;
        let mut live_cell_bytes = 0usize;

        self.for_each_block(|block_ptr| {
            // SAFETY: blocks stay mapped until the notifications below.
            let block = unsafe { block_ptr.as_ref() };
            let mut block_has_live_cells = false;
            let block_was_full = block.is_full();
            block.for_each_live_cell(|cell| {
                if !cell.is_marked() && !Self::cell_must_survive_garbage_collection(cell) {
                    #[cfg(feature = "heap_debug")]
                    tracing::trace!(target: "stoat::gc", ?cell, "~ sweep");
                    block.deallocate(cell);
                    collected_cells += 1;
                    collected_cell_bytes += block.cell_size();
                } else {
                    cell.set_marked(false);
                    block_has_live_cells = true;
                    live_cells += 1;
                    live_cell_bytes += block.cell_size();
                }
            });
            if !block_has_live_cells {
                empty_blocks.push(block_ptr);
            } else if block_was_full != block.is_full() {
                full_blocks_that_became_usable.push(block_ptr);
            }
        });

        // Weak containers purge before any block is unmapped: "dead" is
        // observed through slot state.
        for container in self.weak_containers.borrow().iter() {
            // SAFETY: registered containers are Box-pinned and unregister
            // before they drop; nothing aliases them during the sweep.
            unsafe { (*container.as_ptr()).remove_dead_cells() };
        }

        for &block in &empty_blocks {
            // SAFETY: still mapped; the allocator unmaps it.
            let cell_size = unsafe { block.as_ref() }.cell_size();
            self.allocator_for_size(cell_size).block_did_become_empty(block);
        }
        for &block in &full_blocks_that_became_usable {
            // SAFETY: blocks with live cells stay mapped.
            let cell_size = unsafe { block.as_ref() }.cell_size();
            self.allocator_for_size(cell_size)
                .block_did_become_usable(block);
        }

        self.gc_bytes_threshold
            .set(live_cell_bytes.max(GC_MIN_BYTES_THRESHOLD));

        let duration = start.elapsed();
        {
            let mut stats = self.stats.borrow_mut();
            stats.collections += 1;
            stats.live_cells = live_cells;
            stats.live_cell_bytes = live_cell_bytes;
            stats.collected_cells = collected_cells;
            stats.collected_cell_bytes = collected_cell_bytes;
            stats.last_gc_duration = duration;
        }

        if print_report {
            let mut live_block_count = 0usize;
            self.for_each_block(|_| live_block_count += 1);
            tracing::info!(
                target: "stoat::gc",
                time_ms = duration.as_millis() as u64,
                live_cells,
                live_cell_bytes,
                collected_cells,
                collected_cell_bytes,
                live_blocks = live_block_count,
                live_block_bytes = live_block_count * BLOCK_SIZE,
                freed_blocks = empty_blocks.len(),
                freed_block_bytes = empty_blocks.len() * BLOCK_SIZE,
                "garbage collection report"
            );
        }
    }

    // ---------------------------------------------------------------
    // Deferral and uprooting
    // ---------------------------------------------------------------

    /// Open a deferral window; automatic collections are postponed until the
    /// matching [`Heap::undefer_gc`].
    pub fn defer_gc(&self) {
        self.gc_deferrals.set(self.gc_deferrals.get() + 1);
    }

    /// Close one deferral window; runs the pending collection when the last
    /// window closes.
    pub fn undefer_gc(&self) {
        let deferrals = self.gc_deferrals.get();
        assert!(deferrals > 0, "unbalanced undefer_gc");
        self.gc_deferrals.set(deferrals - 1);

        if deferrals == 1 && self.should_gc_when_deferral_ends.replace(false) {
            self.collect_garbage(CollectionType::CollectGarbage, false);
        }
    }

    /// Exclude `cell` from surviving the next cycle: its mark is forcibly
    /// cleared once marking finishes, even if a registered root reaches it.
    pub fn uproot_cell(&self, cell: CellPtr) {
        self.uprooted_cells.borrow_mut().push(cell);
    }

    // ---------------------------------------------------------------
    // Conservative range registration
    // ---------------------------------------------------------------

    /// Declare an embedder buffer (e.g. a capturing closure) to be scanned
    /// conservatively each cycle. Registering the same base twice is fatal.
    pub fn register_safe_function_closure(
        &self,
        base: *const u8,
        size: usize,
        location: SourceLocation,
    ) {
        assert!(!base.is_null());
        let range = ConservativeRange {
            word_count: size / mem::size_of::<usize>(),
            location,
        };
        let previous = self.custom_ranges.borrow_mut().insert(base as usize, range);
        assert!(previous.is_none(), "closure range registered twice");
    }

    /// Remove a registered closure range; it must have been registered.
    pub fn unregister_safe_function_closure(
        &self,
        base: *const u8,
        _size: usize,
        _location: SourceLocation,
    ) {
        let removed = self.custom_ranges.borrow_mut().remove(&(base as usize));
        assert!(removed.is_some(), "closure range was not registered");
    }

    // ---------------------------------------------------------------
    // Registry callbacks
    // ---------------------------------------------------------------

    pub(crate) fn did_create_handle(&self, cell: CellPtr) -> u64 {
        let id = self.next_handle_id.get();
        self.next_handle_id.set(id + 1);
        self.handles.borrow_mut().push((id, cell));
        id
    }

    pub(crate) fn did_destroy_handle(&self, id: u64) {
        let mut handles = self.handles.borrow_mut();
        let index = handles
            .iter()
            .position(|(handle_id, _)| *handle_id == id)
            .expect("handle was not registered");
        handles.swap_remove(index);
    }

    pub(crate) fn did_create_marked_vector(&self, vector: NonNull<Vec<CellPtr>>) {
        let mut vectors = self.marked_vectors.borrow_mut();
        assert!(!vectors.contains(&vector), "marked vector registered twice");
        vectors.push(vector);
    }

    pub(crate) fn did_destroy_marked_vector(&self, vector: NonNull<Vec<CellPtr>>) {
        let mut vectors = self.marked_vectors.borrow_mut();
        let index = vectors
            .iter()
            .position(|v| *v == vector)
            .expect("marked vector was not registered");
        vectors.swap_remove(index);
    }

    pub(crate) fn did_create_weak_container(&self, container: NonNull<dyn WeakContainer>) {
        let mut containers = self.weak_containers.borrow_mut();
        assert!(
            !containers
                .iter()
                .any(|c| c.cast::<()>() == container.cast::<()>()),
            "weak container registered twice"
        );
        containers.push(container);
    }

    pub(crate) fn did_destroy_weak_container(&self, container: NonNull<dyn WeakContainer>) {
        let mut containers = self.weak_containers.borrow_mut();
        let index = containers
            .iter()
            .position(|c| c.cast::<()>() == container.cast::<()>())
            .expect("weak container was not registered");
        containers.swap_remove(index);
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    pub(crate) fn vm(&self) -> &dyn Vm {
        &*self.vm
    }

    pub(crate) fn custom_ranges(&self) -> Ref<'_, FxHashMap<usize, ConservativeRange>> {
        self.custom_ranges.borrow()
    }

    pub(crate) fn for_each_block(&self, mut f: impl FnMut(NonNull<HeapBlock>)) {
        for allocator in &self.allocators {
            allocator.for_each_block(&mut f);
        }
    }

    /// Counters from the most recent collection.
    pub fn stats(&self) -> GcStats {
        self.stats.borrow().clone()
    }

    /// Current adaptive threshold in bytes.
    pub fn gc_bytes_threshold(&self) -> usize {
        self.gc_bytes_threshold.get()
    }

    /// Test toggle: collect on every single allocation.
    pub fn set_should_collect_on_every_allocation(&self, enabled: bool) {
        self.collect_on_every_allocation.set(enabled);
    }

    /// Whether a collection was requested during the current deferral window.
    pub fn should_gc_when_deferral_ends(&self) -> bool {
        self.should_gc_when_deferral_ends.get()
    }

    /// True only on the collector's own stack.
    pub fn collecting_garbage(&self) -> bool {
        self.collecting_garbage.get()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.vm.clear_string_caches();
        self.collect_garbage(CollectionType::CollectEverything, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellState;

    struct NullVm {
        stack_info: StackInfo,
    }

    impl NullVm {
        fn new() -> Rc<NullVm> {
            Rc::new(NullVm {
                stack_info: StackInfo::new(),
            })
        }
    }

    impl Vm for NullVm {
        fn gather_roots(&self, _roots: &mut RootSet) {}
        fn visit_interpreter_edges(&self, _visitor: &mut dyn Visitor) {}
        fn stack_info(&self) -> &StackInfo {
            &self.stack_info
        }
    }

    struct Blob<const N: usize> {
        bytes: [u8; N],
    }

    impl<const N: usize> Cell for Blob<N> {
        fn class_name(&self) -> &'static str {
            "Blob"
        }
    }

    #[test]
    fn test_allocator_consistency() {
        let heap = Heap::new(NullVm::new());
        let ptr = heap.allocate(Blob::<40> { bytes: [7; 40] });
        let cell = ptr.cell();

        let block = HeapBlock::from_cell(cell.addr());
        // SAFETY: freshly allocated cell, its block is live.
        let block = unsafe { &*block };
        assert!(block.cell_size() >= mem::size_of::<CellHeader>() + 40);
        assert_eq!(block.cell_from_possible_pointer(cell.addr()), Some(cell));
        assert_eq!(cell.state(), CellState::Live);
        assert_eq!(unsafe { ptr.as_ref() }.bytes[0], 7);
    }

    #[test]
    fn test_smallest_fitting_size_class() {
        let heap = Heap::new(NullVm::new());
        // 16-byte header + 8 bytes of body lands in the 32-byte class.
        let small = heap.allocate(Blob::<8> { bytes: [0; 8] });
        let block = unsafe { &*HeapBlock::from_cell(small.cell().addr()) };
        assert_eq!(block.cell_size(), 32);

        // 16 + 100 needs the 128-byte class.
        let medium = heap.allocate(Blob::<100> { bytes: [0; 100] });
        let block = unsafe { &*HeapBlock::from_cell(medium.cell().addr()) };
        assert_eq!(block.cell_size(), 128);
    }

    #[test]
    #[should_panic(expected = "no cell allocator")]
    fn test_oversized_allocation_is_fatal() {
        let heap = Heap::new(NullVm::new());
        heap.allocate(Blob::<4000> { bytes: [0; 4000] });
    }

    #[test]
    fn test_collect_on_every_allocation() {
        let heap = Heap::new(NullVm::new());
        heap.set_should_collect_on_every_allocation(true);
        let before = heap.stats().collections;
        let _a = heap.allocate(Blob::<8> { bytes: [0; 8] });
        let _b = heap.allocate(Blob::<8> { bytes: [0; 8] });
        assert!(heap.stats().collections >= before + 2);
    }

    #[test]
    fn test_threshold_floor() {
        let heap = Heap::new(NullVm::new());
        assert_eq!(heap.gc_bytes_threshold(), GC_MIN_BYTES_THRESHOLD);
        let _cell = heap.allocate(Blob::<8> { bytes: [0; 8] });
        heap.collect_garbage(CollectionType::CollectGarbage, false);
        // Live bytes are far below the floor, so the floor holds.
        assert_eq!(heap.gc_bytes_threshold(), GC_MIN_BYTES_THRESHOLD);
    }

    #[test]
    #[should_panic(expected = "unbalanced undefer_gc")]
    fn test_unbalanced_undefer_is_fatal() {
        let heap = Heap::new(NullVm::new());
        heap.undefer_gc();
    }
}
