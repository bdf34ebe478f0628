//! Managed object and type trees.
//!
//! The resolved stream carries the per-GC object graph as a flat DFS
//! pre-order list of `e` records. This view rebuilds the trees, then
//! aggregates them bottom-up by class: for every object type, which types
//! hold references to it and how much memory those references keep alive.

use rustc_hash::FxHashSet;
use serde::Serialize;

use heapscope_format::StringIndex;

use crate::trace_data::{AccumulatedTraceData, ReadError};

struct GraphNode {
    class_index: StringIndex,
    object_ptr: u64,
    gc_num: u32,
    size: u64,
    children: Vec<GraphNode>,
}

/// One row of the type tree; children are the referencing types.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObjectRow {
    pub gc_num: u32,
    pub class_name: String,
    /// Number of distinct objects of this type.
    pub allocations: u64,
    /// Bytes owned by those objects.
    pub allocated: u64,
    /// Bytes kept alive through this reference chain.
    pub referenced: u64,
    pub children: Vec<ObjectRow>,
}

fn build_graph(
    data: &AccumulatedTraceData,
    cursor: &mut usize,
) -> Result<GraphNode, ReadError> {
    let Some(flat) = data.object_tree_nodes.get(*cursor) else {
        return Err(ReadError::CorruptObjectGraph(
            "object record stream ended mid-node".into(),
        ));
    };
    let size = flat
        .alloc_index
        .slot(data.allocation_infos.len())
        .map(|slot| data.allocation_infos[slot].size)
        .unwrap_or(0);
    let mut node = GraphNode {
        class_index: flat.class_index,
        object_ptr: flat.object_ptr,
        gc_num: flat.gc_num,
        size,
        children: Vec::with_capacity(flat.num_children as usize),
    };
    let num_children = flat.num_children;
    *cursor += 1;

    for _ in 0..num_children {
        match data.object_tree_nodes.get(*cursor) {
            Some(child) if child.gc_num == node.gc_num => {
                node.children.push(build_graph(data, cursor)?);
            }
            Some(child) => {
                // a child from another collection means the snapshot is
                // torn; aggregating it would produce nonsense
                return Err(ReadError::CorruptObjectGraph(format!(
                    "object in gc {} references object in gc {}",
                    node.gc_num, child.gc_num
                )));
            }
            None => {
                return Err(ReadError::CorruptObjectGraph(
                    "object record stream ended mid-node".into(),
                ));
            }
        }
    }
    Ok(node)
}

struct TypeTree {
    class_index: StringIndex,
    gc_num: u32,
    parents: Vec<TypeTree>,
    unique_objects: FxHashSet<u64>,
    total_size: u64,
    referenced_size: u64,
}

impl TypeTree {
    fn leaf(node: &GraphNode) -> TypeTree {
        let mut unique_objects = FxHashSet::default();
        unique_objects.insert(node.object_ptr);
        TypeTree {
            class_index: node.class_index,
            gc_num: node.gc_num,
            parents: Vec::new(),
            unique_objects,
            total_size: node.size,
            referenced_size: node.size,
        }
    }

    /// Turn one object tree into leaf-rooted chains: every type appears
    /// with the chain of types referencing it above.
    fn create_bottom_up(node: &GraphNode) -> Vec<TypeTree> {
        let mut result = Vec::new();
        if !node.class_index.is_valid() && node.children.is_empty() {
            return result;
        }
        if node.children.is_empty() {
            result.push(TypeTree::leaf(node));
            return result;
        }

        for child in &node.children {
            for mut leaf in TypeTree::create_bottom_up(child) {
                let mut parent = TypeTree::leaf(node);
                parent.referenced_size = leaf.referenced_size;

                // hang the parent at the top of the existing chain
                let mut top = &mut leaf;
                while !top.parents.is_empty() {
                    debug_assert_eq!(top.parents.len(), 1);
                    top = &mut top.parents[0];
                }
                top.parents.push(parent);

                result.push(leaf);
                // the referencing type also shows up as its own row
                result.push(TypeTree::leaf(node));
            }
        }
        result
    }

    /// Merge sibling chains by class, recursively.
    fn merge_subtrees(&mut self) {
        let mut merged: Vec<TypeTree> = Vec::new();
        for parent in std::mem::take(&mut self.parents) {
            match merged
                .iter_mut()
                .find(|candidate| candidate.class_index == parent.class_index)
            {
                Some(combined) => {
                    combined.referenced_size += parent.referenced_size;
                    for object in &parent.unique_objects {
                        if combined.unique_objects.insert(*object) {
                            combined.total_size += parent.total_size;
                        }
                    }
                    combined.parents.extend(parent.parents);
                }
                None => {
                    merged.push(TypeTree {
                        class_index: parent.class_index,
                        gc_num: self.gc_num,
                        parents: parent.parents,
                        unique_objects: parent.unique_objects,
                        total_size: parent.total_size,
                        referenced_size: parent.referenced_size,
                    });
                }
            }
        }
        for combined in &mut merged {
            combined.merge_subtrees();
        }
        self.parents = merged;
    }

    fn into_row(self, data: &AccumulatedTraceData) -> ObjectRow {
        ObjectRow {
            gc_num: self.gc_num,
            class_name: data.stringify(self.class_index).to_owned(),
            allocations: self.unique_objects.len() as u64,
            allocated: self.total_size,
            referenced: self.referenced_size,
            children: self
                .parents
                .into_iter()
                .map(|parent| parent.into_row(data))
                .collect(),
        }
    }
}

/// Build the per-GC type trees from the flattened object records.
pub fn build_object_tree(data: &AccumulatedTraceData) -> Result<Vec<ObjectRow>, ReadError> {
    let mut rows = Vec::new();
    let mut cursor = 0usize;
    while cursor < data.object_tree_nodes.len() {
        let graph = build_graph(data, &mut cursor)?;

        let mut root = TypeTree {
            class_index: StringIndex::NONE,
            gc_num: graph.gc_num,
            parents: TypeTree::create_bottom_up(&graph),
            unique_objects: FxHashSet::default(),
            total_size: 0,
            referenced_size: 0,
        };
        root.merge_subtrees();

        for tree in root.parents {
            rows.push(tree.into_row(data));
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_data::{NoHooks, ParsePass, ReadConfig};
    use std::io::Cursor;

    fn dataset(stream: &str) -> AccumulatedTraceData {
        let mut data = AccumulatedTraceData::new(ReadConfig::default());
        let mut bytes = Cursor::new(stream.as_bytes().to_vec());
        data.read(&mut bytes, ParsePass::First, &mut NoHooks).unwrap();
        data
    }

    /// root(synthetic, class 0) -> List(0x1000) -> Node(0x2000)
    const STREAM: &str = "\
v 10100 2
s [List]
s [Node]
a 20 1 1
a 10 1 1
^ 1
^ 2
e 1 1 0 0 0
e 1 1 1000 1 1
e 1 0 2000 2 2
";

    #[test]
    fn test_type_tree_aggregates() {
        let data = dataset(STREAM);
        let rows = build_object_tree(&data).unwrap();

        // synthetic root contributes no row; List and Node both appear
        let node = rows
            .iter()
            .find(|row| row.class_name == "[Node]")
            .expect("Node row");
        assert_eq!(node.allocations, 1);
        assert_eq!(node.allocated, 0x10);
        // Node is kept alive by List
        assert_eq!(node.children.len(), 1);
        assert_eq!(node.children[0].class_name, "[List]");

        let list = rows
            .iter()
            .find(|row| row.class_name == "[List]")
            .expect("List row");
        assert_eq!(list.allocated, 0x20);
    }

    #[test]
    fn test_gc_mismatch_is_fatal() {
        let torn = "\
v 10100 2
s [List]
a 20 1 1
^ 1
e 1 1 0 0 0
e 2 0 1000 1 1
";
        let data = dataset(torn);
        assert!(matches!(
            build_object_tree(&data),
            Err(ReadError::CorruptObjectGraph(_))
        ));
    }

    #[test]
    fn test_truncated_stream_is_fatal() {
        let truncated = "\
v 10100 2
e 1 2 0 0 0
e 1 0 1000 1 0
";
        let data = dataset(truncated);
        assert!(matches!(
            build_object_tree(&data),
            Err(ReadError::CorruptObjectGraph(_))
        ));
    }
}
