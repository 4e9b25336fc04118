//! Worklist-based transitive closure over cell edges.

use crate::cell::{CellPtr, Visitor};
use crate::roots::RootSet;

/// The marking visitor: marks on first visit, enumerates edges from an
/// explicit worklist so deep object graphs never recurse on the native stack.
pub(crate) struct MarkingVisitor {
    work_queue: Vec<CellPtr>,
}

impl MarkingVisitor {
    /// Seed the worklist with every gathered root.
    pub(crate) fn new(roots: &RootSet) -> MarkingVisitor {
        let mut visitor = MarkingVisitor {
            work_queue: Vec::new(),
        };
        for cell in roots.keys() {
            visitor.visit(*cell);
        }
        visitor
    }

    /// Drain the worklist, enumerating the outbound edges of each cell.
    pub(crate) fn mark_all_live_cells(&mut self) {
        while let Some(cell) = self.work_queue.pop() {
            // SAFETY: the cell was live when marked and nothing is reclaimed
            // during marking.
            let cell_ref = unsafe { &*cell.as_dyn() };
            cell_ref.visit_edges(self);
        }
    }
}

impl Visitor for MarkingVisitor {
    fn visit(&mut self, cell: CellPtr) {
        if cell.is_marked() {
            return;
        }
        #[cfg(feature = "heap_debug")]
        tracing::trace!(target: "stoat::gc", ?cell, "mark");
        cell.set_marked(true);
        self.work_queue.push(cell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, CellHeader};
    use crate::roots::HeapRootOrigin;
    use std::cell::Cell as StdCell;
    use std::ptr::NonNull;

    struct Node {
        edge: StdCell<Option<CellPtr>>,
    }

    impl Cell for Node {
        fn visit_edges(&self, visitor: &mut dyn Visitor) {
            if let Some(edge) = self.edge.get() {
                visitor.visit(edge);
            }
        }

        fn class_name(&self) -> &'static str {
            "Node"
        }
    }

    #[repr(C)]
    struct Slot {
        header: CellHeader,
        body: Node,
    }

    fn slot() -> Slot {
        Slot {
            header: CellHeader::new_live::<Node>(),
            body: Node {
                edge: StdCell::new(None),
            },
        }
    }

    #[test]
    fn test_marking_terminates_on_cycles() {
        let a = slot();
        let b = slot();
        let a_ptr = CellPtr::from_header(NonNull::from(&a.header));
        let b_ptr = CellPtr::from_header(NonNull::from(&b.header));
        a.body.edge.set(Some(b_ptr));
        b.body.edge.set(Some(a_ptr));

        let mut roots = RootSet::default();
        roots.insert(a_ptr, HeapRootOrigin::Handle);

        let mut visitor = MarkingVisitor::new(&roots);
        visitor.mark_all_live_cells();

        assert!(a_ptr.is_marked());
        assert!(b_ptr.is_marked());
    }

    #[test]
    fn test_unreachable_cell_stays_unmarked() {
        let a = slot();
        let b = slot();
        let a_ptr = CellPtr::from_header(NonNull::from(&a.header));
        let b_ptr = CellPtr::from_header(NonNull::from(&b.header));

        let mut roots = RootSet::default();
        roots.insert(a_ptr, HeapRootOrigin::Handle);

        let mut visitor = MarkingVisitor::new(&roots);
        visitor.mark_all_live_cells();

        assert!(a_ptr.is_marked());
        assert!(!b_ptr.is_marked());
    }
}
