//! Fixed worker-thread pool backing the asynchronous container operations.
//!
//! Tasks are boxed closures drained in FIFO order from a condvar-guarded
//! queue. Enqueueing while the pool is stopped is allowed; such tasks sit in
//! the queue until the next `start`. `stop` lets in-flight tasks finish,
//! joins every worker, then drops whatever was still queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Caller-supplied completion for an asynchronous operation. Passing `None`
/// to an async method makes it fire-and-forget.
pub type Completion<T> = Box<dyn FnOnce(T) + Send + 'static>;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

struct PoolState {
    tasks: VecDeque<Task>,
    running: bool,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub const DEFAULT_WORKERS: usize = 4;

    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    tasks: VecDeque::new(),
                    running: false,
                    workers: Vec::new(),
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Spawns `workers` threads. A no-op when the pool is already running.
    pub fn start(&self, workers: usize) {
        let workers = workers.max(1);
        let mut state = self.shared.state.lock();
        if state.running {
            return;
        }
        state.running = true;
        debug!(workers, "pool.start");
        for _ in 0..workers {
            let shared = Arc::clone(&self.shared);
            state.workers.push(thread::spawn(move || worker_loop(&shared)));
        }
        drop(state);
        // queued work may predate the start
        self.shared.available.notify_all();
    }

    /// Signals shutdown, wakes and joins every worker, then drops the queued
    /// backlog. In-flight tasks run to completion. A no-op when already
    /// stopped.
    pub fn stop(&self) {
        let workers = {
            let mut state = self.shared.state.lock();
            state.running = false;
            std::mem::take(&mut state.workers)
        };
        self.shared.available.notify_all();
        let joined = workers.len();
        // stop can run on a worker itself (a task holding the last handle
        // to a container); that thread must not join its own handle
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        let mut state = self.shared.state.lock();
        let dropped = state.tasks.len();
        state.tasks.clear();
        if joined > 0 || dropped > 0 {
            debug!(joined, dropped, "pool.stop");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn queued_tasks(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn enqueue(&self, task: Task) {
        let mut state = self.shared.state.lock();
        state.tasks.push_back(task);
        drop(state);
        self.shared.available.notify_one();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if !state.running {
                    return;
                }
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                shared.available.wait(&mut state);
            }
        };
        task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_enqueued_tasks() {
        let pool = WorkerPool::new();
        pool.start(2);
        let (tx, rx) = mpsc::channel();
        for i in 0..16 {
            let tx = tx.clone();
            pool.enqueue(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        let mut seen: Vec<i32> = (0..16).map(|_| rx.recv().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..16).collect::<Vec<_>>());
        pool.stop();
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let pool = WorkerPool::new();
        let (tx, rx) = mpsc::channel();
        // queue first so the lone worker drains a fully-formed backlog
        for i in 0..32 {
            let tx = tx.clone();
            pool.enqueue(Box::new(move || {
                let _ = tx.send(i);
            }));
        }
        pool.start(1);
        let seen: Vec<i32> = (0..32).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
        pool.stop();
    }

    #[test]
    fn start_is_idempotent() {
        let pool = WorkerPool::new();
        pool.start(2);
        pool.start(8);
        assert!(pool.is_running());
        pool.stop();
        assert!(!pool.is_running());
        pool.stop();
    }

    #[test]
    fn stop_drops_backlog_and_allows_restart() {
        let pool = WorkerPool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.enqueue(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // never started: stop clears the backlog without running anything
        pool.stop();
        assert_eq!(pool.queued_tasks(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.start(1);
        let (tx, rx) = mpsc::channel();
        let counter2 = Arc::clone(&counter);
        pool.enqueue(Box::new(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.stop();
    }
}
