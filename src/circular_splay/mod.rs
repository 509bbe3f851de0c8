//! Splay tree whose nodes live in a fixed ring of slots.
//!
//! The ring bounds resident nodes: allocating into an occupied slot evicts
//! the resident first, wherever it sits in the tree. Eviction therefore
//! follows slot-recycling order (roughly FIFO over allocations), not access
//! recency: an insert can silently drop a key that was inserted earlier,
//! which is what makes the structure a bounded working-set container rather
//! than an LRU. Accessed nodes are splayed to the root, so `search` mutates
//! the shape observably.

use std::fmt;
use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CircularSplayConfig;
use crate::error::{GroveError, Result};
use crate::pool::{Completion, WorkerPool};
use crate::snapshot::{Snapshot, SnapshotEdge, SplayNodeRecord};

/// Which comparator slot an operation routes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortMode {
    Lexicographic,
    Numeric,
    Semantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Strict less-than predicate over keys. Equality is derived as
/// `!less(a, b) && !less(b, a)`.
pub type KeyComparator<K> = Box<dyn Fn(&K, &K) -> bool + Send>;

struct Comparators<K> {
    lexicographic: KeyComparator<K>,
    numeric: KeyComparator<K>,
    semantic: KeyComparator<K>,
}

impl<K: Ord + fmt::Display> Comparators<K> {
    fn natural() -> Self {
        Self {
            lexicographic: Box::new(|a, b| a.to_string() < b.to_string()),
            numeric: Box::new(|a, b| a < b),
            semantic: Box::new(|a, b| a < b),
        }
    }
}

struct SplayNode<K, V> {
    key: K,
    value: V,
    left: Option<usize>,
    right: Option<usize>,
    parent: Option<usize>,
    access_count: u32,
    subtree_size: usize,
    slot: usize,
}

pub(crate) struct CircularSplayCore<K, V> {
    slots: Vec<Option<SplayNode<K, V>>>,
    root: Option<usize>,
    next: usize,
    live: usize,
    default_mode: SortMode,
    comparators: Comparators<K>,
}

impl<K, V> CircularSplayCore<K, V> {
    fn new(config: CircularSplayConfig, comparators: Comparators<K>) -> Self {
        let capacity = config.buffer_size.max(1);
        let mut slots = Vec::new();
        slots.resize_with(capacity, || None);
        Self {
            slots,
            root: None,
            next: 0,
            live: 0,
            default_mode: config.default_mode,
            comparators,
        }
    }

    fn less(&self, a: &K, b: &K, mode: SortMode) -> bool {
        let cmp = match mode {
            SortMode::Lexicographic => &self.comparators.lexicographic,
            SortMode::Numeric => &self.comparators.numeric,
            SortMode::Semantic => &self.comparators.semantic,
        };
        cmp(a, b)
    }

    fn ordering(&self, a: &K, b: &K, mode: SortMode) -> std::cmp::Ordering {
        if self.less(a, b, mode) {
            std::cmp::Ordering::Less
        } else if self.less(b, a, mode) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    }

    // -- slot accessors; all tolerate empty slots -------------------------

    fn left_of(&self, slot: usize) -> Option<usize> {
        self.slots[slot].as_ref().and_then(|n| n.left)
    }

    fn right_of(&self, slot: usize) -> Option<usize> {
        self.slots[slot].as_ref().and_then(|n| n.right)
    }

    fn parent_of(&self, slot: usize) -> Option<usize> {
        self.slots[slot].as_ref().and_then(|n| n.parent)
    }

    fn size_of(&self, slot: Option<usize>) -> usize {
        slot.and_then(|s| self.slots[s].as_ref())
            .map_or(0, |n| n.subtree_size)
    }

    fn set_left(&mut self, slot: usize, child: Option<usize>) {
        if let Some(n) = self.slots[slot].as_mut() {
            n.left = child;
        }
    }

    fn set_right(&mut self, slot: usize, child: Option<usize>) {
        if let Some(n) = self.slots[slot].as_mut() {
            n.right = child;
        }
    }

    fn set_parent(&mut self, slot: Option<usize>, parent: Option<usize>) {
        if let Some(s) = slot {
            if let Some(n) = self.slots[s].as_mut() {
                n.parent = parent;
            }
        }
    }

    /// Rewires `parent`'s link that pointed at `old` to `new`; with no
    /// parent the root pointer is rewired instead.
    fn replace_child_link(&mut self, parent: Option<usize>, old: usize, new: Option<usize>) {
        let Some(p) = parent else {
            self.root = new;
            return;
        };
        if let Some(n) = self.slots[p].as_mut() {
            if n.left == Some(old) {
                n.left = new;
            } else if n.right == Some(old) {
                n.right = new;
            }
        }
    }

    fn refresh_size(&mut self, slot: usize) {
        let size = 1 + self.size_of(self.left_of(slot)) + self.size_of(self.right_of(slot));
        if let Some(n) = self.slots[slot].as_mut() {
            n.subtree_size = size;
        }
    }

    fn refresh_upward(&mut self, from: Option<usize>) {
        let mut cur = from;
        while let Some(slot) = cur {
            self.refresh_size(slot);
            cur = self.parent_of(slot);
        }
    }

    fn leftmost(&self, mut slot: usize) -> usize {
        while let Some(left) = self.left_of(slot) {
            slot = left;
        }
        slot
    }

    // -- ring allocation --------------------------------------------------

    /// Places a new node at the write cursor, evicting the resident first
    /// when the slot is occupied, and advances the cursor.
    fn allocate(&mut self, key: K, value: V) -> usize {
        let slot = self.next;
        if self.slots[slot].is_some() {
            self.evict(slot);
        }
        self.slots[slot] = Some(SplayNode {
            key,
            value,
            left: None,
            right: None,
            parent: None,
            access_count: 0,
            subtree_size: 1,
            slot,
        });
        self.live += 1;
        self.next = (self.next + 1) % self.slots.len();
        slot
    }

    fn evict(&mut self, slot: usize) {
        debug!(slot, "circular_splay.evict");
        self.detach(slot);
        self.slots[slot] = None;
        self.live -= 1;
    }

    /// Splices the node at `slot` out of the tree, re-attaching its subtrees
    /// so only this node's pair disappears. The slot itself is untouched.
    fn detach(&mut self, slot: usize) {
        let Some((left, right, parent)) = self
            .slots[slot]
            .as_ref()
            .map(|n| (n.left, n.right, n.parent))
        else {
            return;
        };
        let (replacement, refresh_from) = match (left, right) {
            (None, None) => (None, parent),
            (Some(only), None) | (None, Some(only)) => (Some(only), parent),
            (Some(l), Some(r)) => {
                let succ = self.leftmost(r);
                let mut refresh = Some(succ);
                if succ != r {
                    // unlink the successor (it has no left child), then let
                    // it adopt the victim's right subtree
                    let succ_parent = self.parent_of(succ);
                    let succ_right = self.right_of(succ);
                    self.replace_child_link(succ_parent, succ, succ_right);
                    self.set_parent(succ_right, succ_parent);
                    self.set_right(succ, Some(r));
                    self.set_parent(Some(r), Some(succ));
                    refresh = succ_parent;
                }
                self.set_left(succ, Some(l));
                self.set_parent(Some(l), Some(succ));
                (Some(succ), refresh)
            }
        };
        self.replace_child_link(parent, slot, replacement);
        self.set_parent(replacement, parent);
        self.refresh_upward(refresh_from);
    }

    // -- splay rotations ---------------------------------------------------

    /// Single right rotation: promotes a left child over its parent.
    fn zig(&mut self, x: usize) {
        let Some(p) = self.parent_of(x) else { return };
        let g = self.parent_of(p);
        let inner = self.right_of(x);
        self.set_left(p, inner);
        self.set_parent(inner, Some(p));
        self.set_right(x, Some(p));
        self.set_parent(Some(p), Some(x));
        self.replace_child_link(g, p, Some(x));
        self.set_parent(Some(x), g);
        self.refresh_size(p);
        self.refresh_size(x);
    }

    /// Single left rotation: promotes a right child over its parent.
    fn zag(&mut self, x: usize) {
        let Some(p) = self.parent_of(x) else { return };
        let g = self.parent_of(p);
        let inner = self.left_of(x);
        self.set_right(p, inner);
        self.set_parent(inner, Some(p));
        self.set_left(x, Some(p));
        self.set_parent(Some(p), Some(x));
        self.replace_child_link(g, p, Some(x));
        self.set_parent(Some(x), g);
        self.refresh_size(p);
        self.refresh_size(x);
    }

    fn zig_zig(&mut self, x: usize) {
        if let Some(p) = self.parent_of(x) {
            self.zig(p);
        }
        self.zig(x);
    }

    fn zag_zag(&mut self, x: usize) {
        if let Some(p) = self.parent_of(x) {
            self.zag(p);
        }
        self.zag(x);
    }

    fn zig_zag(&mut self, x: usize) {
        self.zag(x);
        self.zig(x);
    }

    fn zag_zig(&mut self, x: usize) {
        self.zig(x);
        self.zag(x);
    }

    /// Promotes `slot` to the root through the rotation repertoire.
    fn splay(&mut self, slot: usize) {
        while let Some(p) = self.parent_of(slot) {
            match self.parent_of(p) {
                None => {
                    if self.left_of(p) == Some(slot) {
                        self.zig(slot);
                    } else {
                        self.zag(slot);
                    }
                }
                Some(g) => {
                    let p_left = self.left_of(g) == Some(p);
                    let x_left = self.left_of(p) == Some(slot);
                    match (p_left, x_left) {
                        (true, true) => self.zig_zig(slot),
                        (false, false) => self.zag_zag(slot),
                        (true, false) => self.zig_zag(slot),
                        (false, true) => self.zag_zig(slot),
                    }
                }
            }
        }
        self.root = Some(slot);
    }

    // -- core operations ---------------------------------------------------

    fn find(&self, key: &K) -> Option<usize> {
        let mode = self.default_mode;
        let mut cur = self.root;
        while let Some(slot) = cur {
            let node = self.slots[slot].as_ref()?;
            if self.less(key, &node.key, mode) {
                cur = node.left;
            } else if self.less(&node.key, key, mode) {
                cur = node.right;
            } else {
                return Some(slot);
            }
        }
        None
    }

    fn insert(&mut self, key: K, value: V) -> bool {
        if self.root.is_none() {
            let slot = self.allocate(key, value);
            self.root = Some(slot);
            return true;
        }
        if let Some(existing) = self.find(&key) {
            if let Some(n) = self.slots[existing].as_mut() {
                n.value = value;
            }
            self.splay(existing);
            return false;
        }
        let slot = self.allocate(key, value);
        // the allocation may have evicted everything reachable
        if self.root.is_none() {
            self.root = Some(slot);
            return true;
        }
        self.attach_leaf(slot);
        self.splay(slot);
        true
    }

    fn attach_leaf(&mut self, slot: usize) {
        let mode = self.default_mode;
        let Some(mut cur) = self.root else {
            self.root = Some(slot);
            return;
        };
        loop {
            let go_left = {
                let (Some(new_node), Some(cur_node)) =
                    (self.slots[slot].as_ref(), self.slots[cur].as_ref())
                else {
                    return;
                };
                self.less(&new_node.key, &cur_node.key, mode)
            };
            let next = if go_left {
                self.left_of(cur)
            } else {
                self.right_of(cur)
            };
            match next {
                Some(child) => cur = child,
                None => {
                    if go_left {
                        self.set_left(cur, Some(slot));
                    } else {
                        self.set_right(cur, Some(slot));
                    }
                    self.set_parent(Some(slot), Some(cur));
                    break;
                }
            }
        }
        self.refresh_upward(Some(cur));
    }

    fn search(&mut self, key: &K) -> Option<&mut V> {
        let slot = self.find(key)?;
        if let Some(n) = self.slots[slot].as_mut() {
            n.access_count += 1;
        }
        self.splay(slot);
        self.slots[slot].as_mut().map(|n| &mut n.value)
    }

    fn remove(&mut self, key: &K) -> bool {
        let Some(slot) = self.find(key) else {
            return false;
        };
        self.splay(slot);
        self.remove_node(slot);
        true
    }

    /// Direct BST deletion of the node at `slot`: leaves and single-child
    /// nodes unlink, two-child nodes take over their in-order successor's
    /// pair and the successor node is deleted instead.
    fn remove_node(&mut self, slot: usize) -> Option<(K, V)> {
        let (left, right, parent) = {
            let n = self.slots[slot].as_ref()?;
            (n.left, n.right, n.parent)
        };
        if let (Some(_), Some(r)) = (left, right) {
            let succ = self.leftmost(r);
            let pair = self.remove_node(succ)?;
            let node = self.slots[slot].as_mut()?;
            let old_key = std::mem::replace(&mut node.key, pair.0);
            let old_value = std::mem::replace(&mut node.value, pair.1);
            return Some((old_key, old_value));
        }
        let child = left.or(right);
        self.replace_child_link(parent, slot, child);
        self.set_parent(child, parent);
        let node = self.slots[slot].take()?;
        self.live -= 1;
        self.refresh_upward(parent);
        Some((node.key, node.value))
    }

    fn len(&self) -> usize {
        self.live
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn in_order_ascending(&self, out: &mut Vec<(K, V)>)
    where
        K: Clone,
        V: Clone,
    {
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur.is_some() || !stack.is_empty() {
            while let Some(slot) = cur {
                stack.push(slot);
                cur = self.left_of(slot);
            }
            if let Some(slot) = stack.pop() {
                if let Some(n) = self.slots[slot].as_ref() {
                    out.push((n.key.clone(), n.value.clone()));
                }
                cur = self.right_of(slot);
            }
        }
    }

    fn sorted(&self, order: SortOrder, mode: SortMode) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let mut out = Vec::with_capacity(self.live);
        self.in_order_ascending(&mut out);
        if mode != self.default_mode {
            out.sort_by(|a, b| self.ordering(&a.0, &b.0, mode));
        }
        if order == SortOrder::Descending {
            out.reverse();
        }
        out
    }

    fn depth_stats(&self) -> (usize, u64, usize) {
        let mut max_depth = 0usize;
        let mut depth_sum = 0u64;
        let mut count = 0usize;
        let mut stack: Vec<(usize, usize)> = self.root.map(|r| (r, 0)).into_iter().collect();
        while let Some((slot, depth)) = stack.pop() {
            max_depth = max_depth.max(depth + 1);
            depth_sum += depth as u64;
            count += 1;
            if let Some(l) = self.left_of(slot) {
                stack.push((l, depth + 1));
            }
            if let Some(r) = self.right_of(slot) {
                stack.push((r, depth + 1));
            }
        }
        (max_depth, depth_sum, count)
    }

    fn set_buffer_size(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(GroveError::Invalid("buffer size must be positive"));
        }
        if size < self.live {
            return Err(GroveError::Invalid("buffer smaller than live node count"));
        }
        use std::cmp::Ordering as O;
        match size.cmp(&self.slots.len()) {
            O::Equal => return Ok(()),
            O::Greater => self.slots.resize_with(size, || None),
            O::Less => {
                // compact residents into the low slots before truncating
                for high in size..self.slots.len() {
                    if self.slots[high].is_some() {
                        if let Some(low) = self.slots[..size].iter().position(|s| s.is_none()) {
                            self.relocate(high, low);
                        }
                    }
                }
                self.slots.truncate(size);
                self.next %= size;
            }
        }
        debug!(size, live = self.live, "circular_splay.resize");
        Ok(())
    }

    /// Moves a resident between slots, rewiring every link that named the
    /// old slot.
    fn relocate(&mut self, from: usize, to: usize) {
        let Some(mut node) = self.slots[from].take() else {
            return;
        };
        node.slot = to;
        let (left, right, parent) = (node.left, node.right, node.parent);
        self.slots[to] = Some(node);
        self.set_parent(left, Some(to));
        self.set_parent(right, Some(to));
        self.replace_child_link(parent, from, Some(to));
    }

    fn snapshot(&self) -> Snapshot<SplayNodeRecord<K, V>>
    where
        K: Clone,
        V: Clone,
    {
        let mut snap = Snapshot::default();
        let Some(root) = self.root else {
            return snap;
        };
        let mut stack: Vec<(usize, Option<usize>)> = vec![(root, None)];
        while let Some((slot, parent_index)) = stack.pop() {
            let Some(node) = self.slots[slot].as_ref() else {
                continue;
            };
            let index = snap.nodes.len();
            snap.nodes.push(SplayNodeRecord {
                key: node.key.clone(),
                value: node.value.clone(),
                child_indices: Vec::new(),
                access_count: node.access_count,
                subtree_size: node.subtree_size,
            });
            if let Some(parent) = parent_index {
                snap.nodes[parent].child_indices.push(index);
                snap.edges.push(SnapshotEdge {
                    parent,
                    child: index,
                });
            }
            // right pushed first so the left child pops (and numbers) first
            if let Some(r) = node.right {
                stack.push((r, Some(index)));
            }
            if let Some(l) = node.left {
                stack.push((l, Some(index)));
            }
        }
        snap
    }
}

struct CircularSplayInner<K, V> {
    core: Mutex<CircularSplayCore<K, V>>,
    pool: WorkerPool,
}

impl<K, V> Drop for CircularSplayInner<K, V> {
    fn drop(&mut self) {
        self.pool.stop();
    }
}

/// Shared handle to a ring-buffer splay tree. See the module docs for the
/// eviction contract.
pub struct CircularSplayTree<K, V> {
    inner: Arc<CircularSplayInner<K, V>>,
}

impl<K, V> Clone for CircularSplayTree<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> CircularSplayTree<K, V>
where
    K: Ord + fmt::Display + Send + 'static,
    V: Send + 'static,
{
    pub fn new(config: CircularSplayConfig) -> Self {
        Self {
            inner: Arc::new(CircularSplayInner {
                core: Mutex::new(CircularSplayCore::new(config, Comparators::natural())),
                pool: WorkerPool::new(),
            }),
        }
    }

    /// Inserts a pair, splaying it to the root. Overwrites (and returns
    /// false) when the key already exists under the default sort mode. The
    /// backing ring may evict an unrelated resident to make room.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.inner.core.lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.inner.core.lock().remove(key)
    }

    /// Looks a key up under the default sort mode; a hit is splayed to the
    /// root before the guarded value reference is returned.
    pub fn search(&self, key: &K) -> Option<MappedMutexGuard<'_, V>> {
        MutexGuard::try_map(self.inner.core.lock(), |core| core.search(key)).ok()
    }

    pub fn len(&self) -> usize {
        self.inner.core.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.core.lock().capacity()
    }

    pub fn default_mode(&self) -> SortMode {
        self.inner.core.lock().default_mode
    }

    /// Grows losslessly; shrinking below the live node count is rejected,
    /// shrinking above it compacts residents into the surviving slots.
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        self.inner.core.lock().set_buffer_size(size)
    }

    pub fn set_lexicographic_comparator(&self, cmp: KeyComparator<K>) {
        self.inner.core.lock().comparators.lexicographic = cmp;
    }

    pub fn set_numeric_comparator(&self, cmp: KeyComparator<K>) {
        self.inner.core.lock().comparators.numeric = cmp;
    }

    pub fn set_semantic_comparator(&self, cmp: KeyComparator<K>) {
        self.inner.core.lock().comparators.semantic = cmp;
    }

    pub fn height(&self) -> usize {
        self.inner.core.lock().depth_stats().0
    }

    /// Mean node depth with the root at depth 0; 0.0 when empty.
    pub fn average_depth(&self) -> f64 {
        let (_, sum, count) = self.inner.core.lock().depth_stats();
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    pub fn sorted(&self, order: SortOrder, mode: SortMode) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        self.inner.core.lock().sorted(order, mode)
    }

    pub fn in_order(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let core = self.inner.core.lock();
        let mode = core.default_mode;
        core.sorted(SortOrder::Ascending, mode)
    }

    pub fn snapshot(&self) -> Snapshot<SplayNodeRecord<K, V>>
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

    pub fn remove_async(&self, key: K, completion: Option<Completion<bool>>) {
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

    pub fn sorted_async(
        &self,
        order: SortOrder,
        mode: SortMode,
        completion: Option<Completion<Vec<(K, V)>>>,
    ) where
        K: Clone,
        V: Clone,
    {
        let inner = Arc::downgrade(&self.inner);
        self.inner.pool.enqueue(Box::new(move || {
            let Some(inner) = inner.upgrade() else { return };
            let result = inner.core.lock().sorted(order, mode);
            if let Some(done) = completion {
                done(result);
            }
        }));
    }
}

impl<K, V> Default for CircularSplayTree<K, V>
where
    K: Ord + fmt::Display + Send + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new(CircularSplayConfig::default())
    }
}
