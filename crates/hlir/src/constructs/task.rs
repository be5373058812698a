//! The task construct.
//!
//! A task turns direct calls of a user function `F` into asynchronous
//! launches. `set_function` synthesizes the wrapper the pool dispatches
//! to: it unpacks `F`'s arguments from the task blob (fields 3..), calls
//! `F`, stores the return value into the blob's return slot (field 2),
//! and releases the blob's future. The lowering pass later rewrites each
//! call site of `F` to allocate a blob, queue the wrapper, and force the
//! future at the first use of the result.

use std::cell::Cell;

use inkwell::AddressSpace;
use inkwell::context::Context;
use inkwell::types::StructType;
use inkwell::values::{BasicMetadataValueEnum, FunctionValue};

use crate::diagnostics::{Diagnostic, LowerResult};
use crate::module::HlirModule;
use crate::runtime_decls::RuntimeDecls;

/// The blob layout for one task launch of `func`:
/// `{ future, depth, ret, arg0, arg1, .. }`. A void-returning function
/// gets an i32 placeholder so the return slot always exists.
pub fn task_args_struct<'ctx>(
    context: &'ctx Context,
    func: FunctionValue<'ctx>,
) -> StructType<'ctx> {
    let ptr = context.ptr_type(AddressSpace::default());
    let i32_t = context.i32_type();
    let mut fields = vec![ptr.into(), i32_t.into()];
    fields.push(
        func.get_type()
            .get_return_type()
            .unwrap_or_else(|| i32_t.into()),
    );
    for param in func.get_param_iter() {
        fields.push(param.get_type());
    }
    context.struct_type(&fields, false)
}

pub struct HlirTask<'ctx> {
    name: String,
    function: Cell<Option<FunctionValue<'ctx>>>,
    wrapper: Cell<Option<FunctionValue<'ctx>>>,
}

impl<'ctx> HlirTask<'ctx> {
    pub(crate) fn build(name: String) -> Self {
        HlirTask {
            name,
            function: Cell::new(None),
            wrapper: Cell::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self) -> Option<FunctionValue<'ctx>> {
        self.function.get()
    }

    pub fn wrapper(&self) -> Option<FunctionValue<'ctx>> {
        self.wrapper.get()
    }

    /// Binds the task to `func` and synthesizes its wrapper.
    pub fn set_function(
        &self,
        hlir: &HlirModule<'ctx>,
        func: FunctionValue<'ctx>,
    ) -> LowerResult<()> {
        if self.function.get().is_some() {
            return Err(Diagnostic::simple(format!(
                "task '{}' is already bound to a function",
                self.name
            )));
        }
        let context = hlir.context();
        let module = hlir.module();
        let decls = RuntimeDecls::declare(context, module);

        let ptr = context.ptr_type(AddressSpace::default());
        let wrapper_ty = context.void_type().fn_type(&[ptr.into()], false);
        let wrapper =
            module.add_function(&format!("hlir.task_wrapper.{}", self.name), wrapper_ty, None);

        let b = context.create_builder();
        let entry = context.append_basic_block(wrapper, "entry");
        b.position_at_end(entry);

        let args_ptr = wrapper
            .get_nth_param(0)
            .ok_or_else(|| Diagnostic::simple("wrapper lost its argument"))?
            .into_pointer_value();
        let args_ty = task_args_struct(context, func);

        let mut call_args: Vec<BasicMetadataValueEnum> =
            Vec::with_capacity(func.count_params() as usize);
        for (j, param) in func.get_param_iter().enumerate() {
            let slot = b.build_struct_gep(args_ty, args_ptr, (3 + j) as u32, "arg.ptr")?;
            let arg = b.build_load(param.get_type(), slot, "arg")?;
            call_args.push(arg.into());
        }

        let ret = b.build_call(func, &call_args, "ret")?;
        if let Some(ret_val) = ret.try_as_basic_value().left() {
            let ret_ptr = b.build_struct_gep(args_ty, args_ptr, 2, "ret.ptr")?;
            b.build_store(ret_ptr, ret_val)?;
        }

        b.build_call(decls.task_release_future, &[args_ptr.into()], "")?;
        b.build_return(None)?;

        self.function.set(Some(func));
        self.wrapper.set(Some(wrapper));
        Ok(())
    }
}
