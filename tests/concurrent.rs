use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use grove::{
    BTree, BTreeConfig, CircularSplayConfig, CircularSplayTree, NaryConfig, NarySplayTree,
    SortMode, SortOrder,
};

const NUM_THREADS: usize = 8;
const OPS_PER_THREAD: usize = 100;

#[test]
fn concurrent_btree_inserts_are_all_visible() {
    let tree: BTree<u64, u64> = BTree::new(BTreeConfig::new(3));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();

    for thread_id in 0..NUM_THREADS {
        let tree = tree.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            let base = (thread_id * OPS_PER_THREAD) as u64;
            for i in 0..OPS_PER_THREAD as u64 {
                assert!(tree.insert(base + i, thread_id as u64));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(tree.len(), NUM_THREADS * OPS_PER_THREAD);
    let keys: Vec<u64> = tree.in_order().into_iter().map(|(k, _)| k).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    for key in 0..(NUM_THREADS * OPS_PER_THREAD) as u64 {
        assert!(tree.search(&key).is_some());
    }
}

#[test]
fn concurrent_splay_traffic_respects_ring_bound() {
    let tree: CircularSplayTree<u64, u64> = CircularSplayTree::new(CircularSplayConfig {
        buffer_size: 64,
        default_mode: SortMode::Numeric,
    });
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();

    for thread_id in 0..NUM_THREADS {
        let tree = tree.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..OPS_PER_THREAD as u64 {
                let key = (thread_id as u64 * 37 + i * 13) % 200;
                if i % 3 == 0 {
                    tree.search(&key);
                } else {
                    tree.insert(key, key);
                }
                assert!(tree.len() <= 64);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(tree.len() <= 64);
    let keys: Vec<u64> = tree.in_order().into_iter().map(|(k, _)| k).collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn concurrent_nary_removals_stay_consistent() {
    let tree: NarySplayTree<u64, u64> = NarySplayTree::new(NaryConfig::new(2, 8));
    for key in 0..400u64 {
        tree.insert(key, key);
    }
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = Vec::new();

    for thread_id in 0..NUM_THREADS {
        let tree = tree.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            // each thread owns a disjoint slice of keys to delete
            let base = (thread_id * 50) as u64;
            for i in 0..25u64 {
                assert!(tree.remove(&(base + i)));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(tree.len(), 200);
    for thread_id in 0..NUM_THREADS {
        let base = (thread_id * 50) as u64;
        for i in 0..25u64 {
            assert!(tree.search(&(base + i)).is_none());
        }
        for i in 25..50u64 {
            assert!(tree.search(&(base + i)).is_some());
        }
    }
}

#[test]
fn async_insert_completions_report_results() {
    let tree: BTree<u64, u64> = BTree::default();
    tree.start_workers(4);

    let (tx, rx) = mpsc::channel();
    for key in 0..100u64 {
        let tx = tx.clone();
        tree.insert_async(
            key % 50,
            key,
            Some(Box::new(move |fresh| {
                let _ = tx.send((key, fresh));
            })),
        );
    }
    drop(tx);
    let results: Vec<(u64, bool)> = rx.into_iter().collect();
    assert_eq!(results.len(), 100);
    // 50 distinct keys, each duplicated exactly once
    assert_eq!(results.iter().filter(|(_, fresh)| *fresh).count(), 50);
    assert_eq!(tree.len(), 50);
    tree.stop_workers();
}

#[test]
fn async_search_and_enumerate_round_trip() {
    let tree: NarySplayTree<u64, u64> = NarySplayTree::default();
    // a single worker drains the queue strictly in FIFO order
    tree.start_workers(1);

    let (tx, rx) = mpsc::channel();
    for key in 0..20u64 {
        // fire-and-forget inserts
        tree.insert_async(key, key * 3, None);
    }
    let done = tx.clone();
    tree.in_order_async(Some(Box::new(move |entries| {
        let _ = done.send(entries);
    })));
    drop(tx);
    // FIFO queue order: the enumerate observes every earlier insert
    let entries = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("enumerate completion");
    assert_eq!(entries.len(), 20);

    let (tx, rx) = mpsc::channel();
    tree.search_async(
        7,
        Some(Box::new(move |found| {
            let _ = tx.send(found);
        })),
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(21));
    tree.stop_workers();
}

#[test]
fn async_sorted_runs_on_splay_workers() {
    let tree: CircularSplayTree<u64, u64> = CircularSplayTree::default();
    tree.start_workers(2);
    for key in [3u64, 1, 2] {
        tree.insert(key, key);
    }
    let (tx, rx) = mpsc::channel();
    tree.sorted_async(
        SortOrder::Descending,
        SortMode::Numeric,
        Some(Box::new(move |entries| {
            let _ = tx.send(entries);
        })),
    );
    let entries = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let keys: Vec<u64> = entries.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![3, 2, 1]);
    tree.stop_workers();
}

#[test]
fn worker_lifecycle_is_idempotent_per_container() {
    let tree: BTree<u64, u64> = BTree::default();
    tree.start_workers(2);
    tree.start_workers(4);
    let (tx, rx) = mpsc::channel();
    tree.insert_async(
        1,
        1,
        Some(Box::new(move |fresh| {
            let _ = tx.send(fresh);
        })),
    );
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    tree.stop_workers();
    tree.stop_workers();

    // restart still serves requests
    tree.start_workers(1);
    let (tx, rx) = mpsc::channel();
    tree.search_async(
        1,
        Some(Box::new(move |found| {
            let _ = tx.send(found);
        })),
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(1));
    tree.stop_workers();
}

#[test]
fn dropping_every_handle_stops_the_pool() {
    let (tx, rx) = mpsc::channel();
    {
        let tree: BTree<u64, u64> = BTree::default();
        tree.start_workers(2);
        let tx = tx.clone();
        tree.insert_async(
            9,
            9,
            Some(Box::new(move |fresh| {
                let _ = tx.send(fresh);
            })),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        // tree dropped here; its workers are joined on the way out
    }
    drop(tx);
    assert!(rx.recv().is_err());
}
