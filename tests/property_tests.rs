use std::collections::BTreeMap;

use proptest::prelude::*;

use grove::{
    BTree, BTreeConfig, BTreeNodeRecord, CircularSplayConfig, CircularSplayTree, NaryConfig,
    NarySplayTree, Snapshot, SortMode,
};

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u32),
    Remove(u64),
    Search(u64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    // a narrow key space keeps collisions and re-removals frequent
    prop_oneof![
        (0u64..64, any::<u32>()).prop_map(|(k, v)| Op::Insert(k, v)),
        (0u64..64).prop_map(Op::Remove),
        (0u64..64).prop_map(Op::Search),
    ]
}

fn check_btree_structure(snap: &Snapshot<BTreeNodeRecord<u64, u32>>, t: usize) {
    if snap.is_empty() {
        return;
    }
    let mut depth = vec![0usize; snap.node_count()];
    let mut leaf_depth: Option<usize> = None;
    for (i, node) in snap.nodes.iter().enumerate() {
        assert!(node.keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(node.keys.len(), node.values.len());
        if i != 0 {
            assert!(node.keys.len() >= t - 1, "underfull node");
            assert!(node.keys.len() <= 2 * t - 1, "overfull node");
        }
        if node.is_leaf {
            assert!(node.child_indices.is_empty());
            match leaf_depth {
                Some(d) => assert_eq!(d, depth[i], "leaves at unequal depth"),
                None => leaf_depth = Some(depth[i]),
            }
        } else {
            assert_eq!(node.child_indices.len(), node.keys.len() + 1);
            for &child in &node.child_indices {
                // preorder guarantees parents number before their children
                assert!(child > i);
                depth[child] = depth[i] + 1;
            }
        }
    }
    assert_eq!(snap.edge_count(), snap.node_count() - 1);
}

proptest! {
    #[test]
    fn btree_matches_model(ops in prop::collection::vec(arb_op(), 1..200)) {
        let tree: BTree<u64, u32> = BTree::new(BTreeConfig::new(2));
        let mut model: BTreeMap<u64, u32> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let fresh = !model.contains_key(&k);
                    prop_assert_eq!(tree.insert(k, v), fresh);
                    // duplicates are rejected outright, the model keeps the
                    // original value
                    model.entry(k).or_insert(v);
                }
                Op::Remove(k) => {
                    prop_assert_eq!(tree.remove(&k), model.remove(&k).is_some());
                }
                Op::Search(k) => {
                    prop_assert_eq!(tree.search(&k).map(|g| *g), model.get(&k).copied());
                }
            }
            prop_assert_eq!(tree.len(), model.len());
        }

        let entries: Vec<(u64, u32)> = tree.in_order();
        let expected: Vec<(u64, u32)> = model.iter().map(|(&k, &v)| (k, v)).collect();
        prop_assert_eq!(entries, expected);
        check_btree_structure(&tree.snapshot(), 2);
    }

    #[test]
    fn circular_splay_matches_model_without_eviction(
        ops in prop::collection::vec(arb_op(), 1..200)
    ) {
        // the ring is larger than the key space, so nothing is ever evicted
        let tree: CircularSplayTree<u64, u32> = CircularSplayTree::new(CircularSplayConfig {
            buffer_size: 256,
            default_mode: SortMode::Numeric,
        });
        let mut model: BTreeMap<u64, u32> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let fresh = !model.contains_key(&k);
                    prop_assert_eq!(tree.insert(k, v), fresh);
                    model.insert(k, v);
                    // the touched node is splayed to the root
                    prop_assert_eq!(tree.snapshot().nodes[0].key, k);
                }
                Op::Remove(k) => {
                    prop_assert_eq!(tree.remove(&k), model.remove(&k).is_some());
                }
                Op::Search(k) => {
                    let hit = model.get(&k).copied();
                    prop_assert_eq!(tree.search(&k).map(|g| *g), hit);
                    if hit.is_some() {
                        prop_assert_eq!(tree.snapshot().nodes[0].key, k);
                    }
                }
            }
            prop_assert_eq!(tree.len(), model.len());
        }

        let entries: Vec<(u64, u32)> = tree.in_order();
        let expected: Vec<(u64, u32)> = model.iter().map(|(&k, &v)| (k, v)).collect();
        prop_assert_eq!(entries, expected);
    }

    #[test]
    fn circular_splay_bounded_by_small_ring(
        keys in prop::collection::vec(0u64..512, 1..300),
        buffer in 1usize..24,
    ) {
        let tree: CircularSplayTree<u64, u64> = CircularSplayTree::new(CircularSplayConfig {
            buffer_size: buffer,
            default_mode: SortMode::Numeric,
        });
        let mut inserted: Vec<u64> = Vec::new();
        for &k in &keys {
            tree.insert(k, k);
            if !inserted.contains(&k) {
                inserted.push(k);
            }
            prop_assert!(tree.len() <= buffer);
        }
        // whatever survived is a subset of what went in, in ascending order
        let entries: Vec<u64> = tree.in_order().into_iter().map(|(k, _)| k).collect();
        prop_assert!(entries.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(entries.iter().all(|k| inserted.contains(k)));
        let snap = tree.snapshot();
        prop_assert_eq!(snap.node_count(), tree.len());
        if snap.node_count() > 0 {
            prop_assert_eq!(snap.edge_count(), snap.node_count() - 1);
        }
    }

    #[test]
    fn nary_matches_model(ops in prop::collection::vec(arb_op(), 1..200)) {
        let tree: NarySplayTree<u64, u32> = NarySplayTree::new(NaryConfig::new(2, 8));
        let mut model: BTreeMap<u64, u32> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let fresh = !model.contains_key(&k);
                    prop_assert_eq!(tree.insert(k, v), fresh);
                    model.insert(k, v);
                }
                Op::Remove(k) => {
                    prop_assert_eq!(tree.remove(&k), model.remove(&k).is_some());
                }
                Op::Search(k) => {
                    prop_assert_eq!(tree.search(&k).map(|g| *g), model.get(&k).copied());
                }
            }
            prop_assert_eq!(tree.len(), model.len());
        }

        // every surviving key is addressable and the tree respects its
        // fan-out bounds
        for (&k, &v) in &model {
            prop_assert_eq!(tree.search(&k).map(|g| *g), Some(v));
        }
        let snap = tree.snapshot();
        prop_assert_eq!(snap.node_count(), model.len());
        for node in &snap.nodes {
            prop_assert!(node.child_indices.len() <= node.max_children);
            prop_assert!(node.max_children <= 8);
        }
        // the emit-once walk is globally ascending, pair for pair
        let entries: Vec<(u64, u32)> = tree.in_order();
        let expected: Vec<(u64, u32)> = model.iter().map(|(&k, &v)| (k, v)).collect();
        prop_assert_eq!(entries, expected);
    }
}
