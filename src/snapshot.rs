//! Point-in-time structural copies of the tree containers.
//!
//! A snapshot is a flattened, index-addressed view: node records in DFS
//! preorder from the root (children visited in in-node order, left first)
//! plus one `parent -> child` edge per link. It is the only representation
//! that crosses the library boundary, e.g. toward a viewer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub parent: usize,
    pub child: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<R> {
    pub nodes: Vec<R>,
    pub edges: Vec<SnapshotEdge>,
}

impl<R> Snapshot<R> {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<R> Default for Snapshot<R> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }
}

/// One B-tree node: parallel sorted key/value arrays plus child links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTreeNodeRecord<K, V> {
    pub keys: Vec<K>,
    pub values: Vec<V>,
    pub child_indices: Vec<usize>,
    pub is_leaf: bool,
    pub access_count: u32,
}

/// One binary splay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplayNodeRecord<K, V> {
    pub key: K,
    pub value: V,
    pub child_indices: Vec<usize>,
    pub access_count: u32,
    pub subtree_size: usize,
}

/// One n-ary splay node; `max_children` is the node's current fan-out bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NaryNodeRecord<K, V> {
    pub key: K,
    pub value: V,
    pub child_indices: Vec<usize>,
    pub access_count: u32,
    pub subtree_size: usize,
    pub max_children: usize,
}
