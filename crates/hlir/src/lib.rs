//! HLIR: high-level parallel constructs over LLVM IR.
//!
//! A front-end emits three kinds of parallel regions against an ordinary
//! LLVM module: `parallel_for` (a bounded index range executed
//! concurrently), `parallel_reduce` (a fold over an index range), and
//! `task` (an asynchronous call whose result is a future). Each construct
//! synthesizes its scaffolding eagerly so the emitter can write the
//! user's code into a normal function body; `lower_to_ir` then rewrites
//! every construct into plain IR plus calls into the `strand-runtime`
//! C-ABI facade (`__strand_*`).
//!
//! The emitter protocol, in order:
//! 1. [`HlirModule::attach`] to the module being emitted.
//! 2. Create constructs; write body IR at each construct's insertion
//!    point; plant the launch marker with `insert_marker` where the
//!    region runs; supply ranges / the task's function.
//! 3. [`HlirModule::lower_to_ir`] once emission is done.

pub mod constructs;
pub mod diagnostics;
pub mod lower;
pub mod module;
pub mod runtime_decls;

pub use constructs::{HlirParallelFor, HlirParallelReduce, HlirTask};
pub use diagnostics::{Diagnostic, LowerResult};
pub use module::HlirModule;
