//! Diagnostic heap-graph dump.
//!
//! A second consumer of the visitor protocol: instead of marking, it records
//! a node per cell with its outbound edge addresses, class name and — for
//! roots — the root origin, then renders the graph as JSON. Never invoked by
//! the collection path.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Map, Value};

use crate::cell::{CellPtr, Visitor};
use crate::heap::Heap;
use crate::roots::{HeapRootOrigin, RootSet};

struct GraphNode {
    class_name: &'static str,
    root_origin: Option<HeapRootOrigin>,
    edges: FxHashSet<usize>,
}

pub(crate) struct GraphConstructorVisitor {
    graph: FxHashMap<usize, GraphNode>,
    node_being_visited: Option<usize>,
    work_queue: Vec<CellPtr>,
}

impl GraphConstructorVisitor {
    pub(crate) fn new(roots: &RootSet) -> GraphConstructorVisitor {
        let mut visitor = GraphConstructorVisitor {
            graph: FxHashMap::default(),
            node_being_visited: None,
            work_queue: Vec::new(),
        };
        for (&cell, &origin) in roots.iter() {
            visitor.visit(cell);
            if let Some(node) = visitor.graph.get_mut(&cell.addr()) {
                node.root_origin = Some(origin);
            }
        }
        visitor
    }

    pub(crate) fn visit_all_cells(&mut self) {
        while let Some(cell) = self.work_queue.pop() {
            self.node_being_visited = Some(cell.addr());
            // SAFETY: graph nodes are live cells; nothing is reclaimed while
            // the dumper runs.
            unsafe { &*cell.as_dyn() }.visit_edges(self);
            self.node_being_visited = None;
        }
    }

    pub(crate) fn into_json(self) -> Value {
        let mut graph = Map::new();
        for (addr, node) in self.graph {
            let mut entry = Map::new();
            if let Some(origin) = node.root_origin {
                let root = match origin {
                    HeapRootOrigin::Handle => "Handle".to_string(),
                    HeapRootOrigin::MarkedVector => "MarkedVector".to_string(),
                    HeapRootOrigin::RegisterPointer => "RegisterPointer".to_string(),
                    HeapRootOrigin::StackPointer => "StackPointer".to_string(),
                    HeapRootOrigin::Vm => "VM".to_string(),
                    HeapRootOrigin::SafeFunction(location) => {
                        format!("SafeFunction {location}")
                    }
                };
                entry.insert("root".into(), Value::String(root));
            }
            entry.insert(
                "class_name".into(),
                Value::String(node.class_name.to_string()),
            );
            let mut edges: Vec<usize> = node.edges.into_iter().collect();
            edges.sort_unstable();
            entry.insert("edges".into(), json!(edges));
            graph.insert(addr.to_string(), Value::Object(entry));
        }
        Value::Object(graph)
    }
}

impl Visitor for GraphConstructorVisitor {
    fn visit(&mut self, cell: CellPtr) {
        if let Some(current) = self.node_being_visited {
            if let Some(node) = self.graph.get_mut(&current) {
                node.edges.insert(cell.addr());
            }
        }
        if self.graph.contains_key(&cell.addr()) {
            return;
        }
        self.graph.insert(
            cell.addr(),
            GraphNode {
                class_name: cell.class_name(),
                root_origin: None,
                edges: FxHashSet::default(),
            },
        );
        self.work_queue.push(cell);
    }
}

impl Heap {
    /// Build a node-per-cell graph of everything reachable from the current
    /// roots and log it to the debug channel. Diagnostic only.
    pub fn dump_graph(&self) -> Value {
        let mut roots = RootSet::default();
        self.gather_roots(&mut roots);
        let mut visitor = GraphConstructorVisitor::new(&roots);
        self.vm().visit_interpreter_edges(&mut visitor);
        visitor.visit_all_cells();
        let graph = visitor.into_json();
        tracing::debug!(target: "stoat::gc", graph = %graph, "heap graph");
        graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, CellHeader};
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

    #[test]
    fn test_graph_records_edges_and_roots() {
        let a = Slot {
            header: CellHeader::new_live::<Node>(),
            body: Node {
                edge: StdCell::new(None),
            },
        };
        let b = Slot {
            header: CellHeader::new_live::<Node>(),
            body: Node {
                edge: StdCell::new(None),
            },
        };
        let a_ptr = CellPtr::from_header(NonNull::from(&a.header));
        let b_ptr = CellPtr::from_header(NonNull::from(&b.header));
        a.body.edge.set(Some(b_ptr));

        let mut roots = RootSet::default();
        roots.insert(a_ptr, HeapRootOrigin::Handle);

        let mut visitor = GraphConstructorVisitor::new(&roots);
        visitor.visit_all_cells();
        let graph = visitor.into_json();

        let a_node = &graph[&a_ptr.addr().to_string()];
        assert_eq!(a_node["root"], "Handle");
        assert_eq!(a_node["class_name"], "Node");
        assert_eq!(a_node["edges"][0], b_ptr.addr());

        let b_node = &graph[&b_ptr.addr().to_string()];
        assert!(b_node.get("root").is_none());
    }
}
