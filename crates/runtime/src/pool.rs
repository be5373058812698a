//! Priority thread pool.
//!
//! A fixed set of worker threads drains a single priority queue of
//! `(function, argument, priority)` items. Higher priorities drain first;
//! items of equal priority drain in push order. The queue is guarded by
//! one mutex, and a [`VSem`] counts available work so idle workers park
//! instead of spinning.
//!
//! # Shutdown
//!
//! [`ThreadPool::shutdown`] marks the pool stopped, wakes every worker
//! and joins them. Workers keep draining until the queue is empty, so
//! shutdown is a graceful drain rather than an abandonment; pushes that
//! race with shutdown are rejected. Dropping the pool runs the same path.
//!
//! # Panics in work items
//!
//! A work item that panics is caught at the pool boundary, logged, and
//! the worker moves on to the next item. Work functions therefore use the
//! `extern "C-unwind"` ABI so the unwind may legally cross the call.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::rt_log;
use crate::vsem::VSem;

/// ABI of a queued work function. Lowered bodies and task wrappers are
/// plain C functions; "C-unwind" additionally keeps a panicking Rust test
/// callback catchable at the pool boundary.
pub type WorkFn = unsafe extern "C-unwind" fn(*mut c_void);

struct WorkItem {
    priority: i32,
    /// Push sequence number; ties on priority drain FIFO.
    seq: u64,
    func: WorkFn,
    /// The argument pointer, stored as an address so the heap is Send.
    arg: usize,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.priority, Reverse(self.seq)).cmp(&(other.priority, Reverse(other.seq)))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<WorkItem>>,
    /// Counts queued items, plus one wake token per worker at shutdown.
    work: VSem,
    running: AtomicBool,
    next_seq: AtomicU64,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, BinaryHeap<WorkItem>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<WorkItem> {
        self.lock_queue().pop()
    }

    fn run_item(item: &WorkItem) {
        let result = catch_unwind(AssertUnwindSafe(|| unsafe {
            (item.func)(item.arg as *mut c_void);
        }));
        if result.is_err() {
            rt_log("work item panicked; worker continues");
        }
    }
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ThreadPool {
    /// Spawns a pool with `workers` threads; 0 selects the default
    /// (the `STRAND_WORKERS` environment variable, else the machine's
    /// available parallelism).
    pub fn new(workers: usize) -> Self {
        let worker_count = if workers == 0 {
            Self::default_workers()
        } else {
            workers
        };
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            work: VSem::new(0),
            running: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
        });
        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let s = Arc::clone(&shared);
            handles.push(thread::spawn(move || Self::worker_loop(s)));
        }
        ThreadPool {
            shared,
            workers: Mutex::new(handles),
            worker_count,
        }
    }

    pub fn default_workers() -> usize {
        if let Ok(v) = std::env::var("STRAND_WORKERS")
            && let Ok(n) = v.parse::<usize>()
            && n > 0
        {
            return n;
        }
        thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Enqueues a work item. Items are dequeued highest priority first;
    /// equal priorities dequeue in push order.
    pub fn push(&self, func: WorkFn, arg: *mut c_void, priority: i32) {
        if !self.shared.running.load(Ordering::SeqCst) {
            rt_log("push after shutdown dropped");
            return;
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        self.shared.lock_queue().push(WorkItem {
            priority,
            seq,
            func,
            arg: arg as usize,
        });
        self.shared.work.release();
    }

    /// Runs one pending item on the calling thread, if any is immediately
    /// available. Returns whether an item was run.
    ///
    /// This is how a thread blocked on a task future keeps the queue
    /// moving: nested task graphs would otherwise park every worker on a
    /// child future with the children still queued behind them.
    pub fn try_run_one(&self) -> bool {
        if !self.shared.work.try_acquire() {
            return false;
        }
        match self.shared.pop() {
            Some(item) => {
                Shared::run_item(&item);
                true
            }
            None => {
                // Consumed a shutdown wake token, not an item; put it back.
                self.shared.work.release();
                false
            }
        }
    }

    /// Drains the queue and joins every worker. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handles = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *workers)
        };
        for _ in 0..handles.len() {
            self.shared.work.release();
        }
        for h in handles {
            let _ = h.join();
        }
        rt_log("thread pool stopped");
    }

    fn worker_loop(shared: Arc<Shared>) {
        loop {
            shared.work.acquire();
            match shared.pop() {
                Some(item) => Shared::run_item(&item),
                // A wake with an empty queue is the shutdown signal; the
                // queue is already drained at this point.
                None => {
                    if !shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn priority_then_fifo_dequeue_order() {
        static ORDER: Mutex<Vec<i32>> = Mutex::new(Vec::new());
        static GATE: AtomicBool = AtomicBool::new(false);

        unsafe extern "C-unwind" fn record(arg: *mut c_void) {
            ORDER.lock().unwrap().push(arg as usize as i32);
        }
        unsafe extern "C-unwind" fn block_on_gate(_arg: *mut c_void) {
            while !GATE.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }

        let pool = ThreadPool::new(1);
        // Park the single worker so every later push is ordered purely by
        // the queue, not by arrival timing.
        pool.push(block_on_gate, std::ptr::null_mut(), 100);

        // 100 low-priority items, then 100 high-priority items.
        for i in 0usize..100 {
            pool.push(record, i as *mut c_void, 0);
        }
        for i in 100usize..200 {
            pool.push(record, i as *mut c_void, 1);
        }
        GATE.store(true, Ordering::SeqCst);
        pool.shutdown();

        let order = ORDER.lock().unwrap();
        assert_eq!(order.len(), 200);
        // Every priority-1 item drained before any priority-0 item, and
        // each band kept its push order.
        let expected: Vec<i32> = (100..200).chain(0..100).collect();
        assert_eq!(*order, expected);
    }

    #[test]
    fn shutdown_drains_queue() {
        static DONE: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C-unwind" fn bump(_arg: *mut c_void) {
            DONE.fetch_add(1, Ordering::SeqCst);
        }

        let pool = ThreadPool::new(2);
        for _ in 0..500 {
            pool.push(bump, std::ptr::null_mut(), 0);
        }
        pool.shutdown();
        assert_eq!(DONE.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn panicking_item_does_not_kill_worker() {
        static AFTER: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C-unwind" fn explode(_arg: *mut c_void) {
            panic!("boom");
        }
        unsafe extern "C-unwind" fn bump_after(_arg: *mut c_void) {
            AFTER.fetch_add(1, Ordering::SeqCst);
        }

        let pool = ThreadPool::new(1);
        pool.push(explode, std::ptr::null_mut(), 0);
        pool.push(bump_after, std::ptr::null_mut(), 0);
        pool.shutdown();
        assert_eq!(AFTER.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn push_after_shutdown_is_rejected() {
        static LATE: AtomicUsize = AtomicUsize::new(0);
        unsafe extern "C-unwind" fn bump_late(_arg: *mut c_void) {
            LATE.fetch_add(1, Ordering::SeqCst);
        }

        let pool = ThreadPool::new(1);
        pool.shutdown();
        pool.push(bump_late, std::ptr::null_mut(), 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(LATE.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn try_run_one_executes_inline() {
        static DONE: AtomicUsize = AtomicUsize::new(0);
        static GATE: AtomicBool = AtomicBool::new(false);
        static BLOCKED: AtomicBool = AtomicBool::new(false);
        unsafe extern "C-unwind" fn bump(_arg: *mut c_void) {
            DONE.fetch_add(1, Ordering::SeqCst);
        }
        unsafe extern "C-unwind" fn block_on_gate(_arg: *mut c_void) {
            BLOCKED.store(true, Ordering::SeqCst);
            while !GATE.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }

        // Park the lone worker, then drain the pending item inline.
        let pool = ThreadPool::new(1);
        pool.push(block_on_gate, std::ptr::null_mut(), 10);
        while !BLOCKED.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        pool.push(bump, std::ptr::null_mut(), 0);
        assert!(pool.try_run_one());
        assert_eq!(DONE.load(Ordering::SeqCst), 1);
        GATE.store(true, Ordering::SeqCst);
        pool.shutdown();
    }
}
