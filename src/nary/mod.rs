//! Splay tree generalized to n-ary nodes with adaptive fan-out.
//!
//! Every node carries its own pair plus a key-sorted child list bounded by a
//! per-node `max_children`, retargeted to `round(sqrt(subtree_size))` after
//! each splay. With a single key per node, the ordered children partition
//! admits exactly one consistent reading: a child's subtree spans from the
//! child's own key up to the next boundary (the next sibling's key, the
//! node's own key for the last child below it, or the inherited upper
//! bound). Only the root can hold children below its own key. Rotations
//! therefore re-partition the whole child list of the demoted node by key
//! range, and overflowing nodes split by folding their tail into the median
//! child. In-order enumeration is globally ascending and descent alone
//! locates every key.

pub mod blocks;

use std::sync::Arc;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::trace;

use crate::config::NaryConfig;
use crate::pool::{Completion, WorkerPool};
use crate::snapshot::{NaryNodeRecord, Snapshot, SnapshotEdge};

struct NaryNode<K, V> {
    key: K,
    value: V,
    children: Vec<usize>,
    parent: Option<usize>,
    access_count: u32,
    subtree_size: usize,
    max_children: usize,
}

pub(crate) struct NaryCore<K, V> {
    arena: Vec<Option<NaryNode<K, V>>>,
    free: Vec<usize>,
    root: Option<usize>,
    len: usize,
    initial_branching: usize,
    max_branching: usize,
}

enum Walk {
    Visit(usize),
    Emit(usize),
}

enum Descent {
    Hit(usize),
    Miss(usize),
}

impl<K, V> NaryCore<K, V>
where
    K: Ord + Clone,
{
    fn new(config: NaryConfig) -> Self {
        let initial_branching = config.initial_branching.max(2);
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            root: None,
            len: 0,
            initial_branching,
            max_branching: config.max_branching.max(initial_branching),
        }
    }

    // -- arena accessors ---------------------------------------------------

    fn parent_of(&self, id: usize) -> Option<usize> {
        self.arena[id].as_ref().and_then(|n| n.parent)
    }

    fn first_child(&self, id: usize) -> Option<usize> {
        self.arena[id].as_ref().and_then(|n| n.children.first().copied())
    }

    fn size_of(&self, id: usize) -> usize {
        self.arena[id].as_ref().map_or(0, |n| n.subtree_size)
    }

    fn child_count(&self, id: usize) -> usize {
        self.arena[id].as_ref().map_or(0, |n| n.children.len())
    }

    fn key_of(&self, id: usize) -> Option<K> {
        self.arena[id].as_ref().map(|n| n.key.clone())
    }

    /// Key order stands in for child position: `a` counts as the left-hand
    /// party when its key ranks below `b`'s.
    fn is_left_of(&self, a: usize, b: usize) -> bool {
        match (self.arena[a].as_ref(), self.arena[b].as_ref()) {
            (Some(a), Some(b)) => a.key < b.key,
            _ => true,
        }
    }

    fn overflowing(&self, id: usize) -> bool {
        self.arena[id]
            .as_ref()
            .is_some_and(|n| n.children.len() > n.max_children)
    }

    fn alloc(&mut self, key: K, value: V) -> usize {
        let node = NaryNode {
            key,
            value,
            children: Vec::new(),
            parent: None,
            access_count: 0,
            subtree_size: 1,
            max_children: self.initial_branching,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.arena[id] = Some(node);
                id
            }
            None => {
                self.arena.push(Some(node));
                self.arena.len() - 1
            }
        };
        self.len += 1;
        id
    }

    // -- child-list surgery ------------------------------------------------

    fn insert_child_sorted(&mut self, parent: usize, child: usize) {
        let pos = {
            let (Some(p), Some(c)) = (self.arena[parent].as_ref(), self.arena[child].as_ref())
            else {
                return;
            };
            match p.children.binary_search_by(|&s| match self.arena[s].as_ref() {
                Some(n) => n.key.cmp(&c.key),
                None => std::cmp::Ordering::Less,
            }) {
                Ok(i) | Err(i) => i,
            }
        };
        if let Some(p) = self.arena[parent].as_mut() {
            p.children.insert(pos, child);
        }
        if let Some(c) = self.arena[child].as_mut() {
            c.parent = Some(parent);
        }
    }

    fn remove_child_link(&mut self, parent: usize, child: usize) {
        if let Some(p) = self.arena[parent].as_mut() {
            if let Some(pos) = p.children.iter().position(|&c| c == child) {
                p.children.remove(pos);
            }
        }
    }

    /// Detaches the children of `node` whose keys satisfy `pred`, in list
    /// order. The caller re-homes them; their parent links are stale until
    /// then.
    fn drain_children_by<F>(&mut self, node: usize, pred: F) -> Vec<usize>
    where
        F: Fn(&K) -> bool,
    {
        let (taken, kept): (Vec<usize>, Vec<usize>) = match self.arena[node].as_ref() {
            Some(n) => n.children.iter().copied().partition(|&c| {
                self.arena[c].as_ref().is_some_and(|cn| pred(&cn.key))
            }),
            None => return Vec::new(),
        };
        if let Some(n) = self.arena[node].as_mut() {
            n.children = kept;
        }
        taken
    }

    fn refresh_size(&mut self, id: usize) {
        let size = match self.arena[id].as_ref() {
            Some(n) => 1 + n.children.iter().map(|&c| self.size_of(c)).sum::<usize>(),
            None => return,
        };
        if let Some(n) = self.arena[id].as_mut() {
            n.subtree_size = size;
        }
    }

    fn refresh_upward(&mut self, from: Option<usize>) {
        let mut cur = from;
        while let Some(id) = cur {
            self.refresh_size(id);
            cur = self.parent_of(id);
        }
    }

    // -- rotations ---------------------------------------------------------

    /// Promotes a low-side child over its parent. The parent keeps only the
    /// children above its own key; everything below drops to the promoted
    /// node, so both subtrees keep contiguous key intervals.
    fn zig(&mut self, x: usize) {
        let Some(p) = self.parent_of(x) else { return };
        let Some(p_key) = self.key_of(p) else { return };
        let g = self.parent_of(p);
        self.remove_child_link(p, x);
        let to_x = self.drain_children_by(p, |k| *k < p_key);
        match g {
            Some(g) => {
                self.remove_child_link(g, p);
                self.insert_child_sorted(g, x);
            }
            None => {
                if let Some(n) = self.arena[x].as_mut() {
                    n.parent = None;
                }
                self.root = Some(x);
            }
        }
        for child in to_x {
            self.insert_child_sorted(x, child);
        }
        self.insert_child_sorted(x, p);
        self.refresh_size(p);
        self.refresh_size(x);
    }

    /// True mirror of [`Self::zig`], promoting a high-side child. The
    /// demoted parent keeps exactly the children between its key and the
    /// promoted node's key, takes over the promoted node's children in that
    /// range, and hands everything outside it upward.
    fn zag(&mut self, x: usize) {
        let Some(p) = self.parent_of(x) else { return };
        let (Some(p_key), Some(x_key)) = (self.key_of(p), self.key_of(x)) else {
            return;
        };
        let g = self.parent_of(p);
        self.remove_child_link(p, x);
        let to_x = self.drain_children_by(p, |k| *k > x_key || *k < p_key);
        let to_p = self.drain_children_by(x, |k| *k > p_key && *k < x_key);
        for child in to_p {
            self.insert_child_sorted(p, child);
        }
        match g {
            Some(g) => {
                self.remove_child_link(g, p);
                self.insert_child_sorted(g, x);
            }
            None => {
                if let Some(n) = self.arena[x].as_mut() {
                    n.parent = None;
                }
                self.root = Some(x);
            }
        }
        for child in to_x {
            self.insert_child_sorted(x, child);
        }
        self.insert_child_sorted(x, p);
        self.refresh_size(p);
        self.refresh_size(x);
        // the hand-off can push the demoted parent past its bound
        if self.overflowing(p) {
            self.split(p);
        }
    }

    fn rotate_up(&mut self, x: usize) {
        let Some(p) = self.parent_of(x) else { return };
        if self.is_left_of(x, p) {
            self.zig(x);
        } else {
            self.zag(x);
        }
    }

    fn splay(&mut self, x: usize) {
        while let Some(p) = self.parent_of(x) {
            match self.parent_of(p) {
                // zig / zag
                None => self.rotate_up(x),
                Some(g) => {
                    if self.is_left_of(x, p) == self.is_left_of(p, g) {
                        // zig-zig / zag-zag: the parent rotates first
                        self.rotate_up(p);
                        self.rotate_up(x);
                    } else {
                        // zig-zag / zag-zig: the target rotates twice
                        self.rotate_up(x);
                        self.rotate_up(x);
                    }
                }
            }
        }
        self.root = Some(x);
    }

    // -- fan-out management ------------------------------------------------

    /// Shrinks an overflowing node's child list. With a parent, the node
    /// keeps the low half while the median child absorbs the tail and moves
    /// up beside it (splitting onward as needed). The root instead folds the
    /// tail of its longer same-side run into that run's median, because its
    /// own key is a partition barrier and a payload-free root cannot exist.
    fn split(&mut self, id: usize) {
        let (children, parent) = match self.arena[id].as_ref() {
            Some(n) => (n.children.clone(), n.parent),
            None => return,
        };
        if children.len() < 2 {
            return;
        }
        match parent {
            Some(p) => {
                let mid = children.len() / 2;
                let sibling = children[mid];
                trace!(
                    node = id,
                    sibling,
                    moved = children.len() - mid - 1,
                    "nary.split"
                );
                if let Some(n) = self.arena[id].as_mut() {
                    n.children.truncate(mid);
                }
                for &child in &children[mid + 1..] {
                    self.insert_child_sorted(sibling, child);
                }
                self.refresh_size(id);
                self.refresh_size(sibling);
                self.insert_child_sorted(p, sibling);
                if self.overflowing(sibling) {
                    self.split(sibling);
                }
                if self.overflowing(p) {
                    self.split(p);
                }
            }
            None => {
                let Some(root_key) = self.key_of(id) else { return };
                let (lows, highs): (Vec<usize>, Vec<usize>) =
                    children.iter().copied().partition(|&c| {
                        self.arena[c].as_ref().is_some_and(|n| n.key < root_key)
                    });
                let run = if lows.len() >= highs.len() { lows } else { highs };
                if run.len() < 2 {
                    return;
                }
                let before = children.len();
                let pivot = (run.len() - 1) / 2;
                let sibling = run[pivot];
                let tail = run[pivot + 1..].to_vec();
                trace!(node = id, sibling, moved = tail.len(), "nary.split");
                if let Some(n) = self.arena[id].as_mut() {
                    n.children.retain(|c| !tail.contains(c));
                }
                for &child in &tail {
                    self.insert_child_sorted(sibling, child);
                }
                self.refresh_size(sibling);
                self.refresh_size(id);
                if self.overflowing(sibling) {
                    self.split(sibling);
                }
                if self.overflowing(id) && self.child_count(id) < before {
                    self.split(id);
                }
            }
        }
    }

    /// Retargets the fan-out bound of a freshly splayed node to
    /// `round(sqrt(subtree_size))`, clamped to the branching range, and
    /// splits while the child list exceeds it.
    fn adjust_branching(&mut self, id: usize) {
        let Some(size) = self.arena[id].as_ref().map(|n| n.subtree_size) else {
            return;
        };
        let target = ((size as f64).sqrt().round() as usize)
            .clamp(self.initial_branching, self.max_branching);
        if let Some(n) = self.arena[id].as_mut() {
            n.max_children = target;
        }
        loop {
            if !self.overflowing(id) {
                break;
            }
            let before = self.child_count(id);
            self.split(id);
            if self.child_count(id) >= before {
                break;
            }
        }
    }

    // -- core operations ---------------------------------------------------

    /// Ordered-partition descent. A child covers the keys from its own key
    /// up to the next boundary, and the node's key fences its low-side
    /// children off from its high side, so the step is: greatest child key
    /// not above the target, discarded when it sits on the wrong side of
    /// this node's key. No eligible child means the search bottoms out here.
    fn descend(&self, key: &K) -> Option<Descent> {
        let mut cur = self.root?;
        loop {
            let node = self.arena[cur].as_ref()?;
            if *key == node.key {
                return Some(Descent::Hit(cur));
            }
            let next = match node.children.binary_search_by(|&c| {
                match self.arena[c].as_ref() {
                    Some(n) => n.key.cmp(key),
                    None => std::cmp::Ordering::Less,
                }
            }) {
                Ok(i) => Some(node.children[i]),
                Err(0) => None,
                Err(i) => {
                    let candidate = node.children[i - 1];
                    let low_side = self.arena[candidate]
                        .as_ref()
                        .is_some_and(|n| n.key < node.key);
                    if *key > node.key && low_side {
                        None
                    } else {
                        Some(candidate)
                    }
                }
            };
            match next {
                Some(child) => cur = child,
                None => return Some(Descent::Miss(cur)),
            }
        }
    }

    fn insert(&mut self, key: K, value: V) -> bool {
        match self.descend(&key) {
            Some(Descent::Hit(id)) => {
                if let Some(n) = self.arena[id].as_mut() {
                    n.value = value;
                }
                self.splay(id);
                self.adjust_branching(id);
                false
            }
            Some(Descent::Miss(parent)) => {
                let id = self.alloc(key, value);
                self.insert_child_sorted(parent, id);
                self.refresh_upward(Some(parent));
                if self.overflowing(parent) {
                    self.split(parent);
                }
                self.splay(id);
                self.adjust_branching(id);
                true
            }
            None => {
                let id = self.alloc(key, value);
                self.root = Some(id);
                true
            }
        }
    }

    fn search(&mut self, key: &K) -> Option<&mut V> {
        let Some(Descent::Hit(id)) = self.descend(key) else {
            return None;
        };
        if let Some(n) = self.arena[id].as_mut() {
            n.access_count += 1;
        }
        self.splay(id);
        self.adjust_branching(id);
        self.arena[id].as_mut().map(|n| &mut n.value)
    }

    fn remove(&mut self, key: &K) -> bool {
        let Some(Descent::Hit(id)) = self.descend(key) else {
            return false;
        };
        self.splay(id);
        self.remove_node(id);
        if let Some(root) = self.root {
            self.adjust_branching(root);
        }
        true
    }

    /// Removes the pair held by `id`. A childless node unlinks; otherwise
    /// the first child's pair (the next pair in order once this one is
    /// gone, since a child's key floors its subtree) moves up and the
    /// removal cascades down the first-child chain to a leaf.
    fn remove_node(&mut self, id: usize) -> Option<(K, V)> {
        match self.first_child(id) {
            None => {
                let parent = self.parent_of(id);
                match parent {
                    Some(p) => self.remove_child_link(p, id),
                    None => self.root = None,
                }
                let node = self.arena[id].take()?;
                self.free.push(id);
                self.len -= 1;
                self.refresh_upward(parent);
                Some((node.key, node.value))
            }
            Some(first) => {
                let pair = self.remove_node(first)?;
                let node = self.arena[id].as_mut()?;
                let old_key = std::mem::replace(&mut node.key, pair.0);
                let old_value = std::mem::replace(&mut node.value, pair.1);
                Some((old_key, old_value))
            }
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn depth_stats(&self) -> (usize, u64, usize) {
        let mut max_depth = 0usize;
        let mut depth_sum = 0u64;
        let mut count = 0usize;
        let mut stack: Vec<(usize, usize)> = self.root.map(|r| (r, 0)).into_iter().collect();
        while let Some((id, depth)) = stack.pop() {
            max_depth = max_depth.max(depth + 1);
            depth_sum += depth as u64;
            count += 1;
            if let Some(node) = self.arena[id].as_ref() {
                for &child in &node.children {
                    stack.push((child, depth + 1));
                }
            }
        }
        (max_depth, depth_sum, count)
    }

    /// Emit-once in-order rule: children ranking below the node's own key
    /// first, then the node's pair, then the remaining children. Under the
    /// interval discipline the output is globally ascending.
    fn in_order(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        let mut out = Vec::with_capacity(self.len);
        let mut stack: Vec<Walk> = self.root.map(Walk::Visit).into_iter().collect();
        while let Some(step) = stack.pop() {
            match step {
                Walk::Emit(id) => {
                    if let Some(n) = self.arena[id].as_ref() {
                        out.push((n.key.clone(), n.value.clone()));
                    }
                }
                Walk::Visit(id) => {
                    let Some(node) = self.arena[id].as_ref() else {
                        continue;
                    };
                    let pivot = node.children.partition_point(|&c| {
                        self.arena[c].as_ref().is_some_and(|n| n.key < node.key)
                    });
                    // stacked in reverse of the intended visit order
                    for &child in node.children[pivot..].iter().rev() {
                        stack.push(Walk::Visit(child));
                    }
                    stack.push(Walk::Emit(id));
                    for &child in node.children[..pivot].iter().rev() {
                        stack.push(Walk::Visit(child));
                    }
                }
            }
        }
        out
    }

    fn snapshot(&self) -> Snapshot<NaryNodeRecord<K, V>>
    where
        V: Clone,
    {
        let mut snap = Snapshot::default();
        let Some(root) = self.root else {
            return snap;
        };
        let mut stack: Vec<(usize, Option<usize>)> = vec![(root, None)];
        while let Some((id, parent_index)) = stack.pop() {
            let Some(node) = self.arena[id].as_ref() else {
                continue;
            };
            let index = snap.nodes.len();
            snap.nodes.push(NaryNodeRecord {
                key: node.key.clone(),
                value: node.value.clone(),
                child_indices: Vec::new(),
                access_count: node.access_count,
                subtree_size: node.subtree_size,
                max_children: node.max_children,
            });
            if let Some(parent) = parent_index {
                snap.nodes[parent].child_indices.push(index);
                snap.edges.push(SnapshotEdge {
                    parent,
                    child: index,
                });
            }
            for &child in node.children.iter().rev() {
                stack.push((child, Some(index)));
            }
        }
        snap
    }
}

struct NaryInner<K, V> {
    core: Mutex<NaryCore<K, V>>,
    pool: WorkerPool,
}

impl<K, V> Drop for NaryInner<K, V> {
    fn drop(&mut self) {
        self.pool.stop();
    }
}

/// Shared handle to an n-ary adaptive splay tree.
pub struct NarySplayTree<K, V> {
    inner: Arc<NaryInner<K, V>>,
}

impl<K, V> Clone for NarySplayTree<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> NarySplayTree<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(config: NaryConfig) -> Self {
        Self {
            inner: Arc::new(NaryInner {
                core: Mutex::new(NaryCore::new(config)),
                pool: WorkerPool::new(),
            }),
        }
    }

    /// Inserts a pair and splays it to the root; an existing key has its
    /// value overwritten instead and the call returns false.
    pub fn insert(&self, key: K, value: V) -> bool {
        self.inner.core.lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.inner.core.lock().remove(key)
    }

    /// Point lookup; a hit is splayed to the root before the guarded value
    /// reference is returned.
    pub fn search(&self, key: &K) -> Option<MappedMutexGuard<'_, V>> {
        MutexGuard::try_map(self.inner.core.lock(), |core| core.search(key)).ok()
    }

    pub fn len(&self) -> usize {
        self.inner.core.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
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

    pub fn initial_branching(&self) -> usize {
        self.inner.core.lock().initial_branching
    }

    pub fn max_branching(&self) -> usize {
        self.inner.core.lock().max_branching
    }

    /// Soft setting: caps future fan-out retargeting, existing nodes keep
    /// their bound until their next splay.
    pub fn set_max_branching(&self, max_branching: usize) {
        let mut core = self.inner.core.lock();
        core.max_branching = max_branching.max(core.initial_branching);
    }

    /// Ascending enumeration of the live pairs.
    pub fn in_order(&self) -> Vec<(K, V)>
    where
        V: Clone,
    {
        self.inner.core.lock().in_order()
    }

    pub fn snapshot(&self) -> Snapshot<NaryNodeRecord<K, V>>
    where
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

    pub fn in_order_async(&self, completion: Option<Completion<Vec<(K, V)>>>)
    where
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

impl<K, V> Default for NarySplayTree<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new(NaryConfig::default())
    }
}
