//! Runtime function declarations.
//!
//! This module handles declaring the external `__strand_*` runtime
//! functions that lowered code calls. These are added as declarations
//! (no body) so the runtime library provides the implementation at link
//! time. Declarations are idempotent: a function is only added if it
//! isn't already present in the module, so emitters and repeated lowering
//! runs agree on one declaration per symbol.

use inkwell::AddressSpace;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::{BasicType, BasicTypeEnum};
use inkwell::values::FunctionValue;

/// Symbol names of the runtime facade. These are the binary contract
/// with `strand-runtime`; changing one breaks every compiled program.
pub mod names {
    pub const CREATE_SYNCH: &str = "__strand_create_synch";
    pub const QUEUE_FUNC: &str = "__strand_queue_func";
    pub const FINISH_FUNC: &str = "__strand_finish_func";
    pub const AWAIT_SYNCH: &str = "__strand_await_synch";
    pub const ALLOC: &str = "__strand_alloc";
    pub const FREE: &str = "__strand_free";
    pub const TASK_QUEUE: &str = "__strand_task_queue";
    pub const TASK_AWAIT_FUTURE: &str = "__strand_task_await_future";
    pub const TASK_RELEASE_FUTURE: &str = "__strand_task_release_future";
    pub const TASK_DESTROY: &str = "__strand_task_destroy";
    pub const NUM_WORKERS: &str = "__strand_num_workers";

    /// Do-nothing anchor the construct API plants for markers and
    /// insertion points; every call to it is erased during lowering.
    pub const NOOP: &str = "hlir.noop";
}

/// Handles to the declared runtime functions, resolved once per
/// lowering run.
pub struct RuntimeDecls<'ctx> {
    pub create_synch: FunctionValue<'ctx>,
    pub queue_func: FunctionValue<'ctx>,
    pub finish_func: FunctionValue<'ctx>,
    pub await_synch: FunctionValue<'ctx>,
    pub alloc: FunctionValue<'ctx>,
    pub free: FunctionValue<'ctx>,
    pub task_queue: FunctionValue<'ctx>,
    pub task_await_future: FunctionValue<'ctx>,
    pub task_release_future: FunctionValue<'ctx>,
    pub task_destroy: FunctionValue<'ctx>,
    pub num_workers: FunctionValue<'ctx>,
}

fn declare_if_missing<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    name: &str,
    param_types: &[BasicTypeEnum<'ctx>],
    return_type: Option<BasicTypeEnum<'ctx>>,
) -> FunctionValue<'ctx> {
    if let Some(f) = module.get_function(name) {
        return f;
    }
    let params: Vec<_> = param_types.iter().map(|&t| t.into()).collect();
    let fn_ty = match return_type {
        Some(rt) => rt.fn_type(&params, false),
        None => context.void_type().fn_type(&params, false),
    };
    module.add_function(name, fn_ty, None)
}

impl<'ctx> RuntimeDecls<'ctx> {
    pub fn declare(context: &'ctx Context, module: &Module<'ctx>) -> Self {
        let ptr: BasicTypeEnum = context.i8_type().ptr_type(AddressSpace::default()).into();
        let i32_t: BasicTypeEnum = context.i32_type().into();
        let i64_t: BasicTypeEnum = context.i64_type().into();

        RuntimeDecls {
            create_synch: declare_if_missing(
                context,
                module,
                names::CREATE_SYNCH,
                &[i32_t],
                Some(ptr),
            ),
            queue_func: declare_if_missing(
                context,
                module,
                names::QUEUE_FUNC,
                &[ptr, ptr, ptr, i32_t, i32_t],
                None,
            ),
            finish_func: declare_if_missing(context, module, names::FINISH_FUNC, &[ptr], None),
            await_synch: declare_if_missing(context, module, names::AWAIT_SYNCH, &[ptr], None),
            alloc: declare_if_missing(context, module, names::ALLOC, &[i64_t], Some(ptr)),
            free: declare_if_missing(context, module, names::FREE, &[ptr], None),
            task_queue: declare_if_missing(context, module, names::TASK_QUEUE, &[ptr, ptr], None),
            task_await_future: declare_if_missing(
                context,
                module,
                names::TASK_AWAIT_FUTURE,
                &[ptr],
                None,
            ),
            task_release_future: declare_if_missing(
                context,
                module,
                names::TASK_RELEASE_FUTURE,
                &[ptr],
                None,
            ),
            task_destroy: declare_if_missing(context, module, names::TASK_DESTROY, &[ptr], None),
            num_workers: declare_if_missing(context, module, names::NUM_WORKERS, &[], Some(i32_t)),
        }
    }
}

/// The marker/insertion anchor function. Calls to it carry position, not
/// behavior; lowering erases every one.
pub fn declare_noop<'ctx>(context: &'ctx Context, module: &Module<'ctx>) -> FunctionValue<'ctx> {
    declare_if_missing(context, module, names::NOOP, &[], None)
}
