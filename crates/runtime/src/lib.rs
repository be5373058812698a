// Runtime for Strand parallel constructs.
//
// Compiled programs drive this crate entirely through the C-ABI facade in
// `ffi.rs`: a parallel-for queues one body invocation per index against a
// completion latch, a task queues a wrapper function against a fresh
// future, and both kinds of work drain through one priority thread pool.
// The primitives underneath (virtual semaphore, latch/future protocol,
// pool) are ordinary Rust and are usable directly by embedders.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

pub mod ffi;
pub mod pool;
pub mod sync;
pub mod vsem;

pub use pool::{ThreadPool, WorkFn};
pub use sync::{FuncArg, Synch, TaskArg};
pub use vsem::VSem;

/// Gates the runtime's stderr logging. Off by default; enabled by
/// `STRAND_RUNTIME_LOG` when the global pool is created, or directly by
/// an embedder.
pub static RUNTIME_LOG: AtomicBool = AtomicBool::new(false);

pub(crate) fn init_log_from_env() {
    if std::env::var_os("STRAND_RUNTIME_LOG").is_some() {
        RUNTIME_LOG.store(true, Ordering::Relaxed);
    }
}

/// Unbuffered stderr line with the runtime prefix, when logging is on.
/// Deliberately avoids panicking or allocating fancier machinery; this
/// can be called from worker threads mid-teardown.
pub(crate) fn rt_log(msg: &str) {
    if RUNTIME_LOG.load(Ordering::Relaxed) {
        let _ = io::stderr().write_all(format!("[strand runtime] {}\n", msg).as_bytes());
    }
}
