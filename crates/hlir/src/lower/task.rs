//! Task lowering.
//!
//! Every direct call of the task's function (outside its wrapper) turns
//! into a launch:
//!
//! ```text
//!   %args.ptr = call @__strand_alloc(sizeof blob)
//!   store 0, %depth.ptr                          ; field 1
//!   store %a0, field 3; store %a1, field 4; ...
//!   call @__strand_task_queue(@wrapper, %args.ptr)
//! ```
//!
//! and the future is forced immediately before the first instruction that
//! uses the call's result: await, load the return slot (field 2), destroy
//! the blob, then rewrite every use to the loaded value. A call whose
//! result is never used stays a pure launch; nothing awaits it and its
//! blob is never reclaimed.

use either::Either;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::values::{AsValueRef, BasicValue, InstructionOpcode, InstructionValue};

use crate::constructs::{HlirTask, task_args_struct};
use crate::diagnostics::{Diagnostic, LowerResult};
use crate::lower::find_first_use;
use crate::runtime_decls::RuntimeDecls;

pub(crate) fn lower<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    decls: &RuntimeDecls<'ctx>,
    task: &HlirTask<'ctx>,
) -> LowerResult<()> {
    let func = task.function().ok_or_else(|| {
        Diagnostic::with_note(
            format!("task '{}' has no function", task.name()),
            "call set_function before lowering",
        )
    })?;
    let wrapper = task
        .wrapper()
        .ok_or_else(|| Diagnostic::simple(format!("task '{}' has no wrapper", task.name())))?;

    let args_ty = task_args_struct(context, func);
    let i32_t = context.i32_type();
    let ret_ty = func
        .get_type()
        .get_return_type()
        .unwrap_or_else(|| i32_t.into());

    // Collect the direct call sites first; rewriting invalidates the
    // instruction walk.
    let func_ref = func.as_value_ref();
    let mut sites: Vec<InstructionValue<'ctx>> = Vec::new();
    let mut f = module.get_first_function();
    while let Some(cur) = f {
        if cur != wrapper {
            let mut block = cur.get_first_basic_block();
            while let Some(bb) = block {
                let mut inst = bb.get_first_instruction();
                while let Some(i) = inst {
                    if i.get_opcode() == InstructionOpcode::Call {
                        // The callee is the call's last operand.
                        let n = i.get_num_operands();
                        if n > 0
                            && let Some(Either::Left(callee)) = i.get_operand(n - 1)
                            && callee.as_value_ref() == func_ref
                        {
                            sites.push(i);
                        }
                    }
                    inst = i.get_next_instruction();
                }
                block = bb.get_next_basic_block();
            }
        }
        f = cur.get_next_function();
    }

    let b = context.create_builder();
    for call in sites {
        b.position_before(&call);

        let size = args_ty
            .size_of()
            .ok_or_else(|| Diagnostic::simple("task argument struct is unsized"))?;
        let blob = b
            .build_call(decls.alloc, &[size.into()], "args.ptr")?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| Diagnostic::simple("alloc declaration returns void"))?
            .into_pointer_value();

        // Field 1 is the recursion-depth counter; give its first read a
        // defined value.
        let depth_ptr = b.build_struct_gep(args_ty, blob, 1, "depth.ptr")?;
        b.build_store(depth_ptr, i32_t.const_zero())?;

        let argc = call.get_num_operands() - 1;
        for j in 0..argc {
            let Some(Either::Left(arg)) = call.get_operand(j) else {
                return Err(Diagnostic::simple(format!(
                    "call of task '{}' has a non-value argument",
                    task.name()
                )));
            };
            let slot = b.build_struct_gep(args_ty, blob, 3 + j, "arg.ptr")?;
            b.build_store(slot, arg)?;
        }

        let wrapper_ptr = wrapper.as_global_value().as_pointer_value();
        b.build_call(decls.task_queue, &[wrapper_ptr.into(), blob.into()], "")?;

        if let Some(first_use) = find_first_use(call) {
            b.position_before(&first_use);
            b.build_call(decls.task_await_future, &[blob.into()], "")?;
            let ret_ptr = b.build_struct_gep(args_ty, blob, 2, "ret.ptr")?;
            let ret_val = b.build_load(ret_ty, ret_ptr, "ret")?;
            b.build_call(decls.task_destroy, &[blob.into()], "")?;
            let ret_inst = ret_val
                .as_instruction_value()
                .ok_or_else(|| Diagnostic::simple("return load is not an instruction"))?;
            call.replace_all_uses_with(&ret_inst);
        }
        call.erase_from_basic_block();
    }
    Ok(())
}
