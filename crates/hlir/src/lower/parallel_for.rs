//! Parallel-for lowering.
//!
//! At the marker, the loop `[start, end)` becomes:
//!
//! ```text
//!   %pfor.args = alloca { captures... }          ; store each capture
//!   %n         = sub %end, %start
//!   %synch     = call @__strand_create_synch(%n)
//!   %index.ptr = alloca i32                      ; store %start
//!   br (start < end), %pfor.queue.loop, %pfor.queue.exit
//! pfor.queue.loop:
//!   call @__strand_queue_func(%synch, %pfor.args, @body, %index, 1)
//!   ...increment, loop while index < end
//! pfor.queue.exit:
//!   call @__strand_await_synch(%synch)
//!   br %pfor.merge                               ; the code after the marker
//! ```
//!
//! and the body's prologue gains one load per captured value, with every
//! in-body use of the original rewritten to the load. The queue loop is
//! pre-tested: an empty range queues nothing and the await falls through
//! on the latch's initial +1.

use inkwell::IntPredicate;
use inkwell::context::Context;
use inkwell::types::BasicTypeEnum;
use inkwell::values::BasicMetadataValueEnum;

use crate::constructs::HlirParallelFor;
use crate::diagnostics::{Diagnostic, LowerResult};
use crate::lower::{find_external_values, replace_uses_in_function, split_block_at_marker};
use crate::runtime_decls::RuntimeDecls;

pub(crate) fn lower<'ctx>(
    context: &'ctx Context,
    decls: &RuntimeDecls<'ctx>,
    pf: &HlirParallelFor<'ctx>,
) -> LowerResult<()> {
    let marker = pf.marker().ok_or_else(|| {
        Diagnostic::with_note(
            format!("parallel_for '{}' was never placed", pf.name()),
            "call insert_marker at the launch point before lowering",
        )
    })?;
    let (start, end) = pf.range().ok_or_else(|| {
        Diagnostic::simple(format!("parallel_for '{}' has no iteration range", pf.name()))
    })?;
    let body = pf.body();
    let i32_t = context.i32_type();

    // Capture set and the struct that carries it.
    let captured = find_external_values(body);
    let field_tys: Vec<BasicTypeEnum> = captured.iter().map(|v| v.get_type()).collect();
    let args_ty = context.struct_type(&field_tys, false);

    // Body side: unpack each capture ahead of the user's code and route
    // every in-body use through the unpacked copy.
    let b = context.create_builder();
    let args_insertion = pf.args_insertion();
    b.position_before(&args_insertion);
    let typed_args_ptr = b.build_pointer_cast(
        pf.args(),
        args_ty.ptr_type(inkwell::AddressSpace::default()),
        "pfor.args.typed",
    )?;
    for (i, v) in captured.iter().enumerate() {
        let slot = b.build_struct_gep(typed_args_ptr, i as u32, &format!("cap{}.ptr", i))?;
        let unpacked = b.build_load(slot, &format!("cap{}", i))?;
        replace_uses_in_function(body, *v, unpacked);
    }
    args_insertion.erase_from_basic_block();

    // Caller side. Split first so the launch block ends where the marker
    // stood, then grow it.
    let caller_block = marker
        .get_parent()
        .ok_or_else(|| Diagnostic::simple("marker is not attached to a block"))?;
    let caller_fn = caller_block
        .get_parent()
        .ok_or_else(|| Diagnostic::simple("marker block is not attached to a function"))?;
    let merge = split_block_at_marker(context, marker, "pfor.merge")?;

    b.position_at_end(caller_block);
    let args_ptr = b.build_alloca(args_ty, "pfor.args")?;
    for (i, v) in captured.iter().enumerate() {
        let slot = b.build_struct_gep(args_ptr, i as u32, "cap.slot")?;
        b.build_store(slot, *v)?;
    }

    let n = b.build_int_sub(end, start, "n")?;
    let synch = b
        .build_call(decls.create_synch, &[n.into()], "synch.ptr")?
        .try_as_basic_value()
        .left()
        .ok_or_else(|| Diagnostic::simple("create_synch declaration returns void"))?
        .into_pointer_value();

    let index_ptr = b.build_alloca(i32_t, "index.ptr")?;
    b.build_store(index_ptr, start)?;

    let loop_bb = context.append_basic_block(caller_fn, "pfor.queue.loop");
    let exit_bb = context.append_basic_block(caller_fn, "pfor.queue.exit");

    let nonempty = b.build_int_compare(IntPredicate::SLT, start, end, "pfor.nonempty")?;
    b.build_conditional_branch(nonempty, loop_bb, exit_bb)?;

    b.position_at_end(loop_bb);
    let index = b.build_load(index_ptr, "index")?.into_int_value();
    let one = i32_t.const_int(1, false);
    let generic_ptr_ty = context.i8_type().ptr_type(inkwell::AddressSpace::default());
    let args_ptr_generic = b.build_pointer_cast(args_ptr, generic_ptr_ty, "pfor.args.generic")?;
    let body_ptr = b.build_pointer_cast(
        body.as_global_value().as_pointer_value(),
        generic_ptr_ty,
        "pfor.body.generic",
    )?;
    let queue_args: [BasicMetadataValueEnum; 5] = [
        synch.into(),
        args_ptr_generic.into(),
        body_ptr.into(),
        index.into(),
        // Loop iterations outrank queued tasks.
        one.into(),
    ];
    b.build_call(decls.queue_func, &queue_args, "")?;
    let next = b.build_int_add(index, one, "index.next")?;
    b.build_store(index_ptr, next)?;
    let again = b.build_int_compare(IntPredicate::SLT, next, end, "pfor.more")?;
    b.build_conditional_branch(again, loop_bb, exit_bb)?;

    b.position_at_end(exit_bb);
    b.build_call(decls.await_synch, &[synch.into()], "")?;
    b.build_unconditional_branch(merge)?;

    Ok(())
}
