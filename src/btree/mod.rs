//! Height-balanced B-tree keyed by any `Ord` type.
//!
//! The minimum degree `t` bounds every non-root node to `[t-1, 2t-1]` keys;
//! all leaves sit at the same depth. Inserts reject duplicates without
//! mutating, removals rebalance by borrow-then-merge on the way down.

use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::config::BTreeConfig;
use crate::pool::{Completion, WorkerPool};
use crate::snapshot::{BTreeNodeRecord, Snapshot, SnapshotEdge};

/// Visits past this count reset the node's access counter and fire the
/// promotion hook.
const ACCESS_PROMOTE_THRESHOLD: u32 = 10;

#[derive(Debug)]
struct BTreeNode<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
    children: Vec<Box<BTreeNode<K, V>>>,
    is_leaf: bool,
    access_count: u32,
}

impl<K: Ord, V> BTreeNode<K, V> {
    fn new(is_leaf: bool) -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            is_leaf,
            access_count: 0,
        }
    }

    fn is_full(&self, t: usize) -> bool {
        self.keys.len() >= 2 * t - 1
    }

    fn note_access(&mut self) {
        self.access_count += 1;
        if self.access_count > ACCESS_PROMOTE_THRESHOLD {
            self.access_count = 0;
            self.promote();
        }
    }

    // Hot-node hook: counters only. Rotating here would break the
    // equal-leaf-depth invariant, so the structure is never touched.
    fn promote(&mut self) {}

    fn search(&mut self, key: &K) -> Option<&mut V> {
        self.note_access();
        match self.keys.binary_search(key) {
            Ok(idx) => Some(&mut self.values[idx]),
            Err(idx) => {
                if self.is_leaf {
                    None
                } else {
                    self.children.get_mut(idx).and_then(|c| c.search(key))
                }
            }
        }
    }

    fn contains(&self, key: &K) -> bool {
        let mut node = self;
        loop {
            match node.keys.binary_search(key) {
                Ok(_) => return true,
                Err(idx) => {
                    if node.is_leaf {
                        return false;
                    }
                    match node.children.get(idx) {
                        Some(child) => node = child,
                        None => return false,
                    }
                }
            }
        }
    }

    fn insert_non_full(&mut self, key: K, value: V, t: usize) {
        match self.keys.binary_search(&key) {
            Ok(idx) => {
                // duplicates are rejected before descent; refresh the slot
                // if one ever reaches here
                self.values[idx] = value;
            }
            Err(mut idx) => {
                if self.is_leaf {
                    self.keys.insert(idx, key);
                    self.values.insert(idx, value);
                    return;
                }
                if self.children[idx].is_full(t) {
                    self.split_child(idx, t);
                    // re-decide against the freshly lifted median
                    if key > self.keys[idx] {
                        idx += 1;
                    } else if key == self.keys[idx] {
                        self.values[idx] = value;
                        return;
                    }
                }
                self.children[idx].insert_non_full(key, value, t);
            }
        }
    }

    /// Splits the full child at `idx`; its median moves up into `self`.
    fn split_child(&mut self, idx: usize, t: usize) {
        let child = &mut self.children[idx];
        let mut right = Box::new(BTreeNode::new(child.is_leaf));
        right.keys = child.keys.split_off(t);
        right.values = child.values.split_off(t);
        if !child.is_leaf {
            right.children = child.children.split_off(t);
        }
        let mid_key = child.keys.remove(t - 1);
        let mid_value = child.values.remove(t - 1);
        self.keys.insert(idx, mid_key);
        self.values.insert(idx, mid_value);
        self.children.insert(idx + 1, right);
    }

    fn remove(&mut self, key: &K, t: usize) -> Option<V>
    where
        K: Clone,
    {
        match self.keys.binary_search(key) {
            Ok(idx) => {
                if self.is_leaf {
                    self.keys.remove(idx);
                    Some(self.values.remove(idx))
                } else if self.children[idx].keys.len() >= t {
                    let pred_key = self.children[idx].max_key()?.clone();
                    let pred_value = self.children[idx].remove(&pred_key, t)?;
                    self.keys[idx] = pred_key;
                    Some(std::mem::replace(&mut self.values[idx], pred_value))
                } else if self.children[idx + 1].keys.len() >= t {
                    let succ_key = self.children[idx + 1].min_key()?.clone();
                    let succ_value = self.children[idx + 1].remove(&succ_key, t)?;
                    self.keys[idx] = succ_key;
                    Some(std::mem::replace(&mut self.values[idx], succ_value))
                } else {
                    self.merge_children(idx);
                    self.children[idx].remove(key, t)
                }
            }
            Err(idx) => {
                if self.is_leaf {
                    return None;
                }
                if self.children[idx].keys.len() < t {
                    self.fix_child(idx, t);
                    // rebalancing can pull the target into this node or
                    // shift the descent index; restart the case analysis
                    return self.remove(key, t);
                }
                self.children[idx].remove(key, t)
            }
        }
    }

    fn max_key(&self) -> Option<&K> {
        let mut node = self;
        while !node.is_leaf {
            node = node.children.last()?;
        }
        node.keys.last()
    }

    fn min_key(&self) -> Option<&K> {
        let mut node = self;
        while !node.is_leaf {
            node = node.children.first()?;
        }
        node.keys.first()
    }

    /// Brings the child at `idx` up to `t` keys before descending into it:
    /// borrow from a richer sibling (left preferred), otherwise merge.
    fn fix_child(&mut self, idx: usize, t: usize) {
        if idx > 0 && self.children[idx - 1].keys.len() >= t {
            self.borrow_from_left(idx);
        } else if idx + 1 < self.children.len() && self.children[idx + 1].keys.len() >= t {
            self.borrow_from_right(idx);
        } else if idx > 0 {
            self.merge_children(idx - 1);
        } else {
            self.merge_children(idx);
        }
    }

    fn borrow_from_left(&mut self, idx: usize) {
        if idx == 0 {
            return;
        }
        let (left_part, right_part) = self.children.split_at_mut(idx);
        let (Some(left), Some(child)) = (left_part.last_mut(), right_part.first_mut()) else {
            return;
        };
        let (Some(borrowed_key), Some(borrowed_value)) = (left.keys.pop(), left.values.pop())
        else {
            return;
        };
        let parent_key = std::mem::replace(&mut self.keys[idx - 1], borrowed_key);
        let parent_value = std::mem::replace(&mut self.values[idx - 1], borrowed_value);
        child.keys.insert(0, parent_key);
        child.values.insert(0, parent_value);
        if !child.is_leaf {
            if let Some(borrowed_child) = left.children.pop() {
                child.children.insert(0, borrowed_child);
            }
        }
    }

    fn borrow_from_right(&mut self, idx: usize) {
        if idx >= self.keys.len() {
            return;
        }
        let (left_part, right_part) = self.children.split_at_mut(idx + 1);
        let (Some(child), Some(right)) = (left_part.last_mut(), right_part.first_mut()) else {
            return;
        };
        if right.keys.is_empty() {
            return;
        }
        let borrowed_key = right.keys.remove(0);
        let borrowed_value = right.values.remove(0);
        let parent_key = std::mem::replace(&mut self.keys[idx], borrowed_key);
        let parent_value = std::mem::replace(&mut self.values[idx], borrowed_value);
        child.keys.push(parent_key);
        child.values.push(parent_value);
        if !child.is_leaf && !right.children.is_empty() {
            child.children.push(right.children.remove(0));
        }
    }

    /// Merges the child at `idx + 1` into the child at `idx`, drawing the
    /// separating key down between them.
    fn merge_children(&mut self, idx: usize) {
        let key = self.keys.remove(idx);
        let value = self.values.remove(idx);
        let right = *self.children.remove(idx + 1);
        let BTreeNode {
            keys,
            values,
            children,
            ..
        } = right;
        let left = &mut self.children[idx];
        left.keys.push(key);
        left.values.push(value);
        left.keys.extend(keys);
        left.values.extend(values);
        if !left.is_leaf {
            left.children.extend(children);
        }
    }

    fn collect_entries(&self, out: &mut Vec<(K, V)>)
    where
        K: Clone,
        V: Clone,
    {
        for i in 0..self.keys.len() {
            if !self.is_leaf {
                if let Some(child) = self.children.get(i) {
                    child.collect_entries(out);
                }
            }
            out.push((self.keys[i].clone(), self.values[i].clone()));
        }
        if !self.is_leaf {
            if let Some(last) = self.children.last() {
                last.collect_entries(out);
            }
        }
    }
}

pub(crate) struct BTreeCore<K, V> {
    root: Box<BTreeNode<K, V>>,
    min_degree: usize,
    len: usize,
}

impl<K: Ord, V> BTreeCore<K, V> {
    fn new(config: BTreeConfig) -> Self {
        Self {
            root: Box::new(BTreeNode::new(true)),
            min_degree: config.min_degree.max(2),
            len: 0,
        }
    }

    fn insert(&mut self, key: K, value: V) -> bool {
        if self.root.contains(&key) {
            return false;
        }
        let t = self.min_degree;
        if self.root.is_full(t) {
            let old_root = std::mem::replace(&mut self.root, Box::new(BTreeNode::new(false)));
            self.root.children.push(old_root);
            self.root.split_child(0, t);
        }
        self.root.insert_non_full(key, value, t);
        self.len += 1;
        true
    }

    fn search(&mut self, key: &K) -> Option<&mut V> {
        self.root.search(key)
    }

    fn remove(&mut self, key: &K) -> bool
    where
        K: Clone,
    {
        if !self.root.contains(key) {
            return false;
        }
        let t = self.min_degree;
        if self.root.remove(key, t).is_none() {
            return false;
        }
        self.len -= 1;
        if self.root.keys.is_empty() && !self.root.is_leaf && !self.root.children.is_empty() {
            self.root = self.root.children.remove(0);
        }
        true
    }

    fn len(&self) -> usize {
        self.len
    }

    fn height(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        let mut height = 0;
        let mut node = &self.root;
        loop {
            height += 1;
            if node.is_leaf {
                return height;
            }
            match node.children.first() {
                Some(child) => node = child,
                None => return height,
            }
        }
    }

    fn in_order(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let mut out = Vec::with_capacity(self.len);
        if self.len > 0 {
            self.root.collect_entries(&mut out);
        }
        out
    }

    fn snapshot(&self) -> Snapshot<BTreeNodeRecord<K, V>>
    where
        K: Clone,
        V: Clone,
    {
        let mut snap = Snapshot::default();
        if self.len > 0 {
            Self::snapshot_node(&self.root, &mut snap);
        }
        snap
    }

    fn snapshot_node(node: &BTreeNode<K, V>, snap: &mut Snapshot<BTreeNodeRecord<K, V>>)
    where
        K: Clone,
        V: Clone,
    {
        let index = snap.nodes.len();
        snap.nodes.push(BTreeNodeRecord {
            keys: node.keys.clone(),
            values: node.values.clone(),
            child_indices: Vec::with_capacity(node.children.len()),
            is_leaf: node.is_leaf,
            access_count: node.access_count,
        });
        for child in &node.children {
            // preorder: the child claims the next free index on first visit
            let child_index = snap.nodes.len();
            snap.nodes[index].child_indices.push(child_index);
            snap.edges.push(SnapshotEdge {
                parent: index,
                child: child_index,
            });
            Self::snapshot_node(child, snap);
        }
    }
}

struct BTreeInner<K, V> {
    core: Mutex<BTreeCore<K, V>>,
    pool: WorkerPool,
}

impl<K, V> Drop for BTreeInner<K, V> {
    fn drop(&mut self) {
        self.pool.stop();
    }
}

/// Shared handle to a B-tree. Every public operation takes the container
/// mutex for its full duration; clones refer to the same tree.
pub struct BTree<K, V> {
    inner: Arc<BTreeInner<K, V>>,
}

impl<K, V> Clone for BTree<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> BTree<K, V>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
{
    pub fn new(config: BTreeConfig) -> Self {
        Self {
            inner: Arc::new(BTreeInner {
                core: Mutex::new(BTreeCore::new(config)),
                pool: WorkerPool::new(),
            }),
        }
    }

    /// Inserts a pair; returns false (without mutating) when the key is
    /// already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.inner.core.lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> bool
    where
        K: Clone,
    {
        self.inner.core.lock().remove(key)
    }

    /// Looks a key up, returning a guard that keeps the tree locked while
    /// the value reference is alive.
    pub fn search(&self, key: &K) -> Option<MappedMutexGuard<'_, V>> {
        MutexGuard::try_map(self.inner.core.lock(), |core| core.search(key)).ok()
    }

    pub fn len(&self) -> usize {
        self.inner.core.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Node count along the longest root-to-leaf path; 0 when empty.
    pub fn height(&self) -> usize {
        self.inner.core.lock().height()
    }

    pub fn min_degree(&self) -> usize {
        self.inner.core.lock().min_degree
    }

    /// Soft setting: affects future splits and rebalances only, existing
    /// nodes are left as they are.
    pub fn set_min_degree(&self, min_degree: usize) {
        self.inner.core.lock().min_degree = min_degree.max(2);
    }

    pub fn in_order(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.inner.core.lock().in_order()
    }

    pub fn snapshot(&self) -> Snapshot<BTreeNodeRecord<K, V>>
    where
        K: Clone,
        V: Clone,
    {
        self.inner.core.lock().snapshot()
    }

    pub fn start_workers(&self, workers: usize) {
        self.inner.pool.start(workers);
    }

    pub fn stop_workers(&self) {
        self.inner.pool.stop();
    }

    pub fn insert_async(&self, key: K, value: V, completion: Option<Completion<bool>>) {
        let inner = Arc::downgrade(&self.inner);
        self.inner.pool.enqueue(Box::new(move || {
            let Some(inner) = inner.upgrade() else { return };
            let result = inner.core.lock().insert(key, value);
            if let Some(done) = completion {
                done(result);
            }
        }));
    }

    pub fn remove_async(&self, key: K, completion: Option<Completion<bool>>)
    where
        K: Clone,
    {
        let inner = Arc::downgrade(&self.inner);
        self.inner.pool.enqueue(Box::new(move || {
            let Some(inner) = inner.upgrade() else { return };
            let result = inner.core.lock().remove(&key);
            if let Some(done) = completion {
                done(result);
            }
        }));
    }

    pub fn search_async(&self, key: K, completion: Option<Completion<Option<V>>>)
    where
        V: Clone,
    {
        let inner = Arc::downgrade(&self.inner);
        self.inner.pool.enqueue(Box::new(move || {
            let Some(inner) = inner.upgrade() else { return };
            let result = inner.core.lock().search(&key).map(|v| v.clone());
            if let Some(done) = completion {
                done(result);
            }
        }));
    }

    pub fn in_order_async(&self, completion: Option<Completion<Vec<(K, V)>>>)
    where
        K: Clone,
        V: Clone,
    {
        let inner = Arc::downgrade(&self.inner);
        self.inner.pool.enqueue(Box::new(move || {
            let Some(inner) = inner.upgrade() else { return };
            let result = inner.core.lock().in_order();
            if let Some(done) = completion {
                done(result);
            }
        }));
    }
}

impl<K, V> Default for BTree<K, V>
where
    K: Ord + Send + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new(BTreeConfig::default())
    }
}
