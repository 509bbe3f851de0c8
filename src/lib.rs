//! Three cooperating in-memory ordered containers behind one contract
//! (insert, search, remove, ordered traversal, snapshots) with different
//! balancing and memory disciplines:
//!
//! - [`BTree`]: classic B-tree with a configurable minimum degree and
//!   worst-case logarithmic operations.
//! - [`CircularSplayTree`]: splay tree whose nodes live in a fixed ring of
//!   slots; filling the ring evicts the oldest allocation, wherever it sits
//!   in the tree.
//! - [`NarySplayTree`]: splay tree generalized to n-ary nodes whose
//!   fan-out adapts to subtree size, with a [`BlockIndex`] specialization
//!   for locating content-defined blocks by rolling checksum.
//!
//! Each container guards its structure with a single mutex, exposes a
//! point-in-time [`Snapshot`], and offers asynchronous variants of its
//! operations through an internal [`WorkerPool`].

#![forbid(unsafe_code)]

pub mod btree;
pub mod circular_splay;
pub mod config;
pub mod error;
pub mod nary;
pub mod pool;
pub mod snapshot;
pub mod types;

pub use crate::btree::BTree;
pub use crate::circular_splay::{CircularSplayTree, KeyComparator, SortMode, SortOrder};
pub use crate::config::{BTreeConfig, CircularSplayConfig, NaryConfig};
pub use crate::error::{GroveError, Result};
pub use crate::nary::blocks::BlockIndex;
pub use crate::nary::NarySplayTree;
pub use crate::pool::{Completion, WorkerPool};
pub use crate::snapshot::{
    BTreeNodeRecord, NaryNodeRecord, Snapshot, SnapshotEdge, SplayNodeRecord,
};
pub use crate::types::{BlockMetadata, RollingChecksum};
