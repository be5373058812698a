//! C ABI exports for the runtime. This module centralizes all C-callable
//! symbols (`#[unsafe(no_mangle)] extern "C"` functions) so the public ABI
//! is easy to audit and maintain. These symbols are the binary contract
//! with lowered IR: their names, signatures, and semantics must not drift.
//!
//! The process-wide thread pool lives behind a `OnceLock`. `__strand_init`
//! seeds it explicitly; any facade call will otherwise initialize it
//! lazily with default sizing, so compiled programs need no startup
//! boilerplate.

use libc::c_void;
use std::sync::OnceLock;

use crate::pool::{ThreadPool, WorkFn};
use crate::sync::{FuncArg, Synch, TaskArg};
use crate::{init_log_from_env, rt_log};

static POOL: OnceLock<ThreadPool> = OnceLock::new();

/// The process-wide pool, created on first use.
pub fn pool() -> &'static ThreadPool {
    POOL.get_or_init(|| {
        init_log_from_env();
        rt_log("thread pool starting");
        ThreadPool::new(0)
    })
}

/// Initializes the runtime with an explicit worker count (idempotent;
/// 0 selects the default sizing). Later calls do not resize the pool.
#[unsafe(no_mangle)]
pub extern "C" fn __strand_init(workers: i32) {
    POOL.get_or_init(|| {
        init_log_from_env();
        rt_log("thread pool starting");
        ThreadPool::new(workers.max(0) as usize)
    });
}

/// Drains the queue and joins the workers. Safe to call more than once,
/// or without a prior `__strand_init`.
#[unsafe(no_mangle)]
pub extern "C" fn __strand_shutdown() {
    if let Some(p) = POOL.get() {
        p.shutdown();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn __strand_num_workers() -> i32 {
    pool().worker_count() as i32
}

/// Allocates the completion latch for a parallel loop of `n` iterations.
///
/// The latch starts at `-(n-1)`, so the n-th `release` raises it to +1
/// and the single awaiter proceeds. Ownership passes to the awaiter,
/// which frees it in `__strand_await_synch`.
#[unsafe(no_mangle)]
pub extern "C" fn __strand_create_synch(n: i32) -> *mut c_void {
    Box::into_raw(Box::new(Synch::latch(n))) as *mut c_void
}

/// Queues one loop iteration: packs the `{synch, index, args}` triple and
/// pushes `(func, triple)` at the given priority.
///
/// # Safety
/// `synch` must come from `__strand_create_synch` and `func` must be a
/// `void(void*)` function; both stay valid until the iteration finishes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __strand_queue_func(
    synch: *mut c_void,
    args: *mut c_void,
    func: *mut c_void,
    index: i32,
    priority: i32,
) {
    let triple = Box::into_raw(Box::new(FuncArg {
        synch: synch as *mut Synch,
        index,
        args,
    }));
    let func: WorkFn = unsafe { std::mem::transmute(func) };
    pool().push(func, triple as *mut c_void, priority);
}

/// Body epilogue: releases the iteration's latch and frees the triple the
/// runtime packed in `__strand_queue_func`.
///
/// # Safety
/// `triple` must be a pointer previously handed to the body by the pool,
/// and must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __strand_finish_func(triple: *mut c_void) {
    let triple = triple as *mut FuncArg;
    unsafe {
        (*(*triple).synch).release();
        drop(Box::from_raw(triple));
    }
}

/// Coordinator side of the latch: waits for the last release, then frees
/// the latch.
///
/// # Safety
/// `synch` must come from `__strand_create_synch` and must not be used
/// after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __strand_await_synch(synch: *mut c_void) {
    let synch = synch as *mut Synch;
    unsafe {
        (*synch).wait();
        drop(Box::from_raw(synch));
    }
}

/// Plain heap allocation for lowered code; returns null on failure.
#[unsafe(no_mangle)]
pub extern "C" fn __strand_alloc(bytes: i64) -> *mut c_void {
    let p = unsafe { libc::malloc(bytes.max(0) as usize) };
    if p.is_null() {
        rt_log("allocation failed");
    }
    p
}

/// # Safety
/// `p` must be null or a live pointer from `__strand_alloc`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __strand_free(p: *mut c_void) {
    unsafe { libc::free(p) }
}

/// Launches a task: installs a fresh future into the blob header, zeroes
/// the depth counter, and queues the wrapper at priority 0.
///
/// # Safety
/// `args` must point at a blob whose head is a [`TaskArg`] and `func`
/// must be the task's `void(void*)` wrapper.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __strand_task_queue(func: *mut c_void, args: *mut c_void) {
    let head = args as *mut TaskArg;
    unsafe {
        (*head).future = Box::into_raw(Box::new(Synch::future()));
        (*head).depth = 0;
    }
    let func: WorkFn = unsafe { std::mem::transmute(func) };
    pool().push(func, args, 0);
}

/// Blocks until the task's wrapper has released the future.
///
/// While the future is pending this thread runs queued items inline, so
/// a worker awaiting a nested task cannot starve the children queued
/// behind it.
///
/// # Safety
/// `args` must be a blob previously passed to `__strand_task_queue`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __strand_task_await_future(args: *mut c_void) {
    let head = args as *mut TaskArg;
    let future = unsafe { &*(*head).future };
    loop {
        if future.try_wait() {
            return;
        }
        if pool().try_run_one() {
            continue;
        }
        // Nothing runnable: the producer is mid-flight on another thread.
        if future.wait_timeout(0.001) {
            return;
        }
    }
}

/// Wrapper epilogue: signals the future. The return value store must
/// precede this call in the wrapper (same thread, program order).
///
/// # Safety
/// `args` must be a blob previously passed to `__strand_task_queue`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __strand_task_release_future(args: *mut c_void) {
    let head = args as *mut TaskArg;
    unsafe { (*(*head).future).release() }
}

/// Frees a task's future and its argument blob. Lowered code calls this
/// once the awaited return value has been loaded out of the blob.
///
/// # Safety
/// `args` must be a blob previously passed to `__strand_task_queue` whose
/// future has been awaited; the blob must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __strand_task_destroy(args: *mut c_void) {
    let head = args as *mut TaskArg;
    unsafe {
        drop(Box::from_raw((*head).future));
        libc::free(args);
    }
}

// Facade-level tests live here rather than in `tests/` so they can call
// the exported symbols directly even when the crate is built as a
// staticlib for linking into compiled programs.
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn num_workers_is_positive() {
        assert!(__strand_num_workers() >= 1);
    }

    #[test]
    fn empty_latch_await_returns_immediately() {
        // A loop over zero iterations queues nothing; the await must fall
        // straight through.
        let synch = __strand_create_synch(0);
        unsafe { __strand_await_synch(synch) };
    }

    // The lowered parallel-for protocol, driven by hand: queue N bodies
    // against one latch, each writing A[i] = 2*i, then await.
    unsafe extern "C-unwind" fn fill_body(triple: *mut c_void) {
        unsafe {
            let t = triple as *mut FuncArg;
            let base = (*t).args as *mut i32;
            let i = (*t).index;
            *base.add(i as usize) = i * 2;
            __strand_finish_func(triple);
        }
    }

    #[test]
    fn parallel_fill_writes_every_index() {
        const N: i32 = 1000;
        let mut data = vec![0i32; N as usize];
        let base = data.as_mut_ptr() as *mut c_void;

        let synch = __strand_create_synch(N);
        unsafe {
            for i in 0..N {
                __strand_queue_func(synch, base, fill_body as *mut c_void, i, 1);
            }
            __strand_await_synch(synch);
        }
        for (i, v) in data.iter().enumerate() {
            assert_eq!(*v, (i as i32) * 2);
        }
    }

    // The lowered task protocol, driven by hand: the blob mirrors the
    // struct the task pass builds ({future, depth, ret, n}), and the
    // wrapper mirrors the synthesized task wrapper.
    #[repr(C)]
    struct FibBlob {
        future: *mut c_void,
        depth: u32,
        ret: i32,
        n: i32,
    }

    unsafe extern "C-unwind" fn fib_wrapper(args: *mut c_void) {
        unsafe {
            let blob = args as *mut FibBlob;
            (*blob).ret = fib((*blob).n);
            __strand_task_release_future(args);
        }
    }

    fn spawn_fib(n: i32) -> *mut FibBlob {
        let blob = __strand_alloc(std::mem::size_of::<FibBlob>() as i64) as *mut FibBlob;
        assert!(!blob.is_null());
        unsafe {
            (*blob).n = n;
            __strand_task_queue(fib_wrapper as *mut c_void, blob as *mut c_void);
        }
        blob
    }

    fn force_fib(blob: *mut FibBlob) -> i32 {
        unsafe {
            __strand_task_await_future(blob as *mut c_void);
            let ret = (*blob).ret;
            __strand_task_destroy(blob as *mut c_void);
            ret
        }
    }

    fn fib(n: i32) -> i32 {
        if n < 2 {
            return n;
        }
        let a = spawn_fib(n - 1);
        let b = spawn_fib(n - 2);
        force_fib(a) + force_fib(b)
    }

    #[test]
    fn task_futures_compute_fib() {
        assert_eq!(fib(10), 55);
        assert_eq!(fib(15), 610);
    }

    #[test]
    fn unobserved_task_still_runs() {
        static RAN: AtomicBool = AtomicBool::new(false);
        unsafe extern "C-unwind" fn observer(args: *mut c_void) {
            RAN.store(true, Ordering::SeqCst);
            unsafe { __strand_task_release_future(args) };
        }

        // Queue and never await: the wrapper still runs to completion and
        // nothing blocks. The blob is deliberately never reclaimed.
        let blob = __strand_alloc(std::mem::size_of::<TaskArg>() as i64);
        unsafe { __strand_task_queue(observer as *mut c_void, blob) };
        while !RAN.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn task_depth_starts_at_zero() {
        unsafe extern "C-unwind" fn noop_wrapper(args: *mut c_void) {
            unsafe { __strand_task_release_future(args) };
        }

        let blob = __strand_alloc(std::mem::size_of::<TaskArg>() as i64);
        unsafe {
            // Poison the header so an uninitialized read would show.
            (*(blob as *mut TaskArg)).depth = 0xdead_beef;
            __strand_task_queue(noop_wrapper as *mut c_void, blob);
            assert_eq!((*(blob as *mut TaskArg)).depth, 0);
            __strand_task_await_future(blob);
            __strand_task_destroy(blob);
        }
    }
}
