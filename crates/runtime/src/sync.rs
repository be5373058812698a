//! Completion latches, task futures, and the ABI-visible argument headers.
//!
//! `Synch` is the protocol object shared between lowered IR and the
//! runtime. A parallel-for creates one latch for the whole loop; every
//! iteration releases it once and the coordinator waits for the last
//! release. A task creates one future; the task wrapper releases it once
//! when the call has finished and its return value is in place.

use std::ffi::c_void;

use crate::vsem::VSem;

pub struct Synch {
    sem: VSem,
}

impl Synch {
    /// An n-party completion latch: n releases gate one successful wait.
    ///
    /// `latch(0)` starts at +1, so waiting on an empty loop falls through
    /// immediately.
    pub fn latch(n: i32) -> Self {
        Synch {
            sem: VSem::new(1 - n),
        }
    }

    /// A single-shot future: one release, then one wait succeeds.
    pub fn future() -> Self {
        Synch { sem: VSem::new(0) }
    }

    pub fn release(&self) {
        self.sem.release();
    }

    pub fn wait(&self) {
        self.sem.acquire();
    }

    pub fn try_wait(&self) -> bool {
        self.sem.try_acquire()
    }

    pub fn wait_timeout(&self, seconds: f64) -> bool {
        self.sem.acquire_timeout(seconds)
    }
}

/// Per-iteration argument triple for a queued parallel-for body.
///
/// Layout is ABI: lowered bodies read it as `{ ptr, i32, ptr }`. The
/// runtime allocates one per queued iteration and frees it again in
/// `__strand_finish_func` on the body's behalf.
#[repr(C)]
pub struct FuncArg {
    pub synch: *mut Synch,
    pub index: i32,
    pub args: *mut c_void,
}

/// Head of every task argument blob.
///
/// The lowered blob continues past this header with the return slot
/// (field 2) and the call arguments (fields 3..). Only the header is the
/// runtime's business: the future is installed by `__strand_task_queue`
/// and `depth` is zeroed there so its first read is defined.
#[repr(C)]
pub struct TaskArg {
    pub future: *mut Synch,
    pub depth: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_latch_is_open() {
        let s = Synch::latch(0);
        s.wait();
    }

    #[test]
    fn latch_counts_parties() {
        let s = Synch::latch(3);
        s.release();
        s.release();
        assert!(!s.try_wait());
        s.release();
        assert!(s.try_wait());
    }

    #[test]
    fn future_is_single_shot() {
        let f = Synch::future();
        assert!(!f.try_wait());
        f.release();
        assert!(f.try_wait());
        assert!(!f.try_wait());
    }

    #[test]
    fn func_arg_matches_lowered_triple_layout() {
        // The body reads the triple as { ptr, i32, ptr } at offsets 0/8/16.
        assert_eq!(std::mem::offset_of!(FuncArg, synch), 0);
        assert_eq!(std::mem::offset_of!(FuncArg, index), 8);
        assert_eq!(std::mem::offset_of!(FuncArg, args), 16);
        assert_eq!(std::mem::offset_of!(TaskArg, future), 0);
        assert_eq!(std::mem::offset_of!(TaskArg, depth), 8);
    }
}
