//! Parallel-reduce lowering: fan-out over worker slices, fold, combine.
//!
//! The body computes one index's contribution; queueing it once per index
//! would pay a queue round-trip per element, so the pass synthesizes a
//! *driver* function and queues that once per slice instead:
//!
//! ```text
//! driver(triple):                       ; triple = {synch, slice, rargs}
//!   [i0, i1) = balanced bounds of slice in [start, end)
//!   acc = body(i0); for i in (i0, i1): acc = combine(acc, body(i))
//!   partials[slice] = acc
//!   finish_func(triple)                 ; release the latch, free triple
//! ```
//!
//! The driver re-stores the running index into the triple's index field
//! before each body call, so the body's induction pointer works exactly
//! as in a parallel-for. After the await the caller folds `partials`
//! pairwise (stride 1, 2, 4, ...), stores `partials[0]` to the result
//! slot and frees the buffer. Slice count is `min(num_workers, n)` with
//! bounds `start + s*n/m`, so every slice is non-empty and the fold needs
//! no identity element; an empty range skips the whole region and leaves
//! the zero-initialized result.

use inkwell::IntPredicate;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::{BasicTypeEnum, StructType};
use inkwell::values::{BasicMetadataValueEnum, FunctionValue, IntValue};

use crate::constructs::HlirParallelReduce;
use crate::diagnostics::{Diagnostic, LowerResult};
use crate::lower::{find_external_values, replace_uses_in_function, split_block_at_marker};
use crate::runtime_decls::RuntimeDecls;

/// Constant byte size of a first-class type.
fn size_of_type<'ctx>(ty: BasicTypeEnum<'ctx>) -> Option<IntValue<'ctx>> {
    match ty {
        BasicTypeEnum::IntType(t) => Some(t.size_of()),
        BasicTypeEnum::FloatType(t) => Some(t.size_of()),
        BasicTypeEnum::PointerType(t) => Some(t.size_of()),
        BasicTypeEnum::StructType(t) => t.size_of(),
        BasicTypeEnum::ArrayType(t) => t.size_of(),
        _ => None,
    }
}

pub(crate) fn lower<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    decls: &RuntimeDecls<'ctx>,
    r: &HlirParallelReduce<'ctx>,
) -> LowerResult<()> {
    let marker = r.marker().ok_or_else(|| {
        Diagnostic::with_note(
            format!("parallel_reduce '{}' was never placed", r.name()),
            "call insert_marker at the launch point before lowering",
        )
    })?;
    let (start, end) = r.range().ok_or_else(|| {
        Diagnostic::simple(format!(
            "parallel_reduce '{}' has no iteration range",
            r.name()
        ))
    })?;
    let result_ptr = r
        .result_ptr()
        .ok_or_else(|| Diagnostic::simple("marker placed without a result slot"))?;
    let combine = r.combine();
    let combine_finished = combine
        .get_first_basic_block()
        .and_then(|bb| bb.get_terminator())
        .is_some();
    if !combine_finished {
        return Err(Diagnostic::with_note(
            format!("parallel_reduce '{}' has an unfinished combine function", r.name()),
            "emit the fold operator and its return before lowering",
        ));
    }

    let body = r.body();
    let t = r.reduce_ty();
    let ptr_t = context.ptr_type(inkwell::AddressSpace::default());
    let i32_t = context.i32_type();
    let i64_t = context.i64_type();
    let one = i32_t.const_int(1, false);

    // Slice arguments: bookkeeping head, then the captures.
    let captured = find_external_values(body);
    let mut field_tys: Vec<BasicTypeEnum> = vec![
        ptr_t.into(), // partials
        i32_t.into(), // start
        i32_t.into(), // end
        i32_t.into(), // slice count m
    ];
    field_tys.extend(captured.iter().map(|v| v.get_type()));
    let rargs_ty = context.struct_type(&field_tys, false);
    let triple_ty = context.struct_type(&[ptr_t.into(), i32_t.into(), ptr_t.into()], false);

    // Body side: unpack captures past the bookkeeping fields.
    let b = context.create_builder();
    let args_insertion = r.args_insertion();
    b.position_before(&args_insertion);
    for (i, v) in captured.iter().enumerate() {
        let slot =
            b.build_struct_gep(rargs_ty, r.args(), (4 + i) as u32, &format!("cap{}.ptr", i))?;
        let unpacked = b.build_load(v.get_type(), slot, &format!("cap{}", i))?;
        replace_uses_in_function(body, *v, unpacked);
    }
    args_insertion.erase_from_basic_block();

    let driver = synthesize_driver(context, module, decls, r, rargs_ty, triple_ty)?;

    // Caller side.
    let caller_block = marker
        .get_parent()
        .ok_or_else(|| Diagnostic::simple("marker is not attached to a block"))?;
    let caller_fn = caller_block
        .get_parent()
        .ok_or_else(|| Diagnostic::simple("marker block is not attached to a function"))?;
    let merge = split_block_at_marker(context, marker, "reduce.merge")?;

    b.position_at_end(caller_block);
    let rargs = b.build_alloca(rargs_ty, "reduce.args")?;
    for (i, v) in captured.iter().enumerate() {
        let slot = b.build_struct_gep(rargs_ty, rargs, (4 + i) as u32, "cap.slot")?;
        b.build_store(slot, *v)?;
    }
    let n = b.build_int_sub(end, start, "n")?;
    let nonempty = b.build_int_compare(IntPredicate::SGT, n, i32_t.const_zero(), "reduce.nonempty")?;

    let setup_bb = context.append_basic_block(caller_fn, "reduce.setup");
    b.build_conditional_branch(nonempty, setup_bb, merge)?;

    b.position_at_end(setup_bb);
    let workers = b
        .build_call(decls.num_workers, &[], "workers")?
        .try_as_basic_value()
        .left()
        .ok_or_else(|| Diagnostic::simple("num_workers declaration returns void"))?
        .into_int_value();
    let n_smaller = b.build_int_compare(IntPredicate::SLT, n, workers, "n.smaller")?;
    let m = b
        .build_select(n_smaller, n, workers, "m")?
        .into_int_value();

    let elem_size =
        size_of_type(t).ok_or_else(|| Diagnostic::simple("reduce type has no constant size"))?;
    let m64 = b.build_int_s_extend(m, i64_t, "m64")?;
    let bytes = b.build_int_mul(m64, elem_size, "partials.bytes")?;
    let partials = b
        .build_call(decls.alloc, &[bytes.into()], "partials")?
        .try_as_basic_value()
        .left()
        .ok_or_else(|| Diagnostic::simple("alloc declaration returns void"))?
        .into_pointer_value();

    // Bookkeeping stores (partials, start, end, m).
    let slot = b.build_struct_gep(rargs_ty, rargs, 0, "partials.slot")?;
    b.build_store(slot, partials)?;
    let slot = b.build_struct_gep(rargs_ty, rargs, 1, "start.slot")?;
    b.build_store(slot, start)?;
    let slot = b.build_struct_gep(rargs_ty, rargs, 2, "end.slot")?;
    b.build_store(slot, end)?;
    let slot = b.build_struct_gep(rargs_ty, rargs, 3, "m.slot")?;
    b.build_store(slot, m)?;

    let synch = b
        .build_call(decls.create_synch, &[m.into()], "synch.ptr")?
        .try_as_basic_value()
        .left()
        .ok_or_else(|| Diagnostic::simple("create_synch declaration returns void"))?
        .into_pointer_value();

    let slice_ptr = b.build_alloca(i32_t, "slice.ptr")?;
    b.build_store(slice_ptr, i32_t.const_zero())?;
    let stride_ptr = b.build_alloca(i32_t, "stride.ptr")?;
    let scan_ptr = b.build_alloca(i32_t, "scan.ptr")?;

    let qloop_bb = context.append_basic_block(caller_fn, "reduce.queue.loop");
    let qexit_bb = context.append_basic_block(caller_fn, "reduce.queue.exit");
    b.build_unconditional_branch(qloop_bb)?;

    b.position_at_end(qloop_bb);
    let s = b.build_load(i32_t, slice_ptr, "slice")?.into_int_value();
    let driver_ptr = driver.as_global_value().as_pointer_value();
    let queue_args: [BasicMetadataValueEnum; 5] = [
        synch.into(),
        rargs.into(),
        driver_ptr.into(),
        s.into(),
        one.into(),
    ];
    b.build_call(decls.queue_func, &queue_args, "")?;
    let s_next = b.build_int_add(s, one, "slice.next")?;
    b.build_store(slice_ptr, s_next)?;
    let more = b.build_int_compare(IntPredicate::SLT, s_next, m, "reduce.more")?;
    b.build_conditional_branch(more, qloop_bb, qexit_bb)?;

    b.position_at_end(qexit_bb);
    b.build_call(decls.await_synch, &[synch.into()], "")?;
    b.build_store(stride_ptr, one)?;

    // Pairwise tree fold of the partials: for each stride, combine
    // partials[i] with partials[i + stride] for i = 0, 2*stride, ...
    let outer_bb = context.append_basic_block(caller_fn, "reduce.comb.cond");
    let pass_bb = context.append_basic_block(caller_fn, "reduce.comb.pass");
    let scan_bb = context.append_basic_block(caller_fn, "reduce.comb.scan");
    let fold_bb = context.append_basic_block(caller_fn, "reduce.comb.fold");
    let bump_bb = context.append_basic_block(caller_fn, "reduce.comb.next");
    let done_bb = context.append_basic_block(caller_fn, "reduce.comb.done");
    b.build_unconditional_branch(outer_bb)?;

    b.position_at_end(outer_bb);
    let stride = b.build_load(i32_t, stride_ptr, "stride")?.into_int_value();
    let rounds_left = b.build_int_compare(IntPredicate::SLT, stride, m, "rounds.left")?;
    b.build_conditional_branch(rounds_left, pass_bb, done_bb)?;

    b.position_at_end(pass_bb);
    b.build_store(scan_ptr, i32_t.const_zero())?;
    b.build_unconditional_branch(scan_bb)?;

    b.position_at_end(scan_bb);
    let i = b.build_load(i32_t, scan_ptr, "i")?.into_int_value();
    let partner = b.build_int_add(i, stride, "partner")?;
    let in_range = b.build_int_compare(IntPredicate::SLT, partner, m, "partner.in")?;
    b.build_conditional_branch(in_range, fold_bb, bump_bb)?;

    b.position_at_end(fold_bb);
    let left_ptr = unsafe { b.build_gep(t, partials, &[i], "left.ptr") }?;
    let right_ptr = unsafe { b.build_gep(t, partials, &[partner], "right.ptr") }?;
    let left = b.build_load(t, left_ptr, "left")?;
    let right = b.build_load(t, right_ptr, "right")?;
    let folded = b
        .build_call(combine, &[left.into(), right.into()], "folded")?
        .try_as_basic_value()
        .left()
        .ok_or_else(|| Diagnostic::simple("combine function returns void"))?;
    b.build_store(left_ptr, folded)?;
    let two_strides = b.build_int_add(stride, stride, "stride.x2")?;
    let i_next = b.build_int_add(i, two_strides, "i.next")?;
    b.build_store(scan_ptr, i_next)?;
    b.build_unconditional_branch(scan_bb)?;

    b.position_at_end(bump_bb);
    let stride_next = b.build_int_add(stride, stride, "stride.next")?;
    b.build_store(stride_ptr, stride_next)?;
    b.build_unconditional_branch(outer_bb)?;

    b.position_at_end(done_bb);
    let total = b.build_load(t, partials, "reduce.total")?;
    b.build_store(result_ptr, total)?;
    b.build_call(decls.free, &[partials.into()], "")?;
    b.build_unconditional_branch(merge)?;

    Ok(())
}

/// Builds the per-slice driver for one reduce construct.
fn synthesize_driver<'ctx>(
    context: &'ctx Context,
    module: &Module<'ctx>,
    decls: &RuntimeDecls<'ctx>,
    r: &HlirParallelReduce<'ctx>,
    rargs_ty: StructType<'ctx>,
    triple_ty: StructType<'ctx>,
) -> LowerResult<FunctionValue<'ctx>> {
    let ptr_t = context.ptr_type(inkwell::AddressSpace::default());
    let i32_t = context.i32_type();
    let one = i32_t.const_int(1, false);
    let t = r.reduce_ty();

    let fn_ty = context.void_type().fn_type(&[ptr_t.into()], false);
    let driver = module.add_function(
        &format!("hlir.parallel_reduce.driver.{}", r.name()),
        fn_ty,
        None,
    );

    let b = context.create_builder();
    let entry = context.append_basic_block(driver, "entry");
    let cond_bb = context.append_basic_block(driver, "slice.cond");
    let step_bb = context.append_basic_block(driver, "slice.step");
    let done_bb = context.append_basic_block(driver, "slice.done");

    b.position_at_end(entry);
    let triple = driver
        .get_nth_param(0)
        .ok_or_else(|| Diagnostic::simple("driver lost its argument"))?
        .into_pointer_value();
    let index_slot = b.build_struct_gep(triple_ty, triple, 1, "index.slot")?;
    let s = b.build_load(i32_t, index_slot, "slice")?.into_int_value();
    let rargs_slot = b.build_struct_gep(triple_ty, triple, 2, "rargs.slot")?;
    let rargs = b.build_load(ptr_t, rargs_slot, "rargs")?.into_pointer_value();

    let partials_slot = b.build_struct_gep(rargs_ty, rargs, 0, "partials.slot")?;
    let partials = b
        .build_load(ptr_t, partials_slot, "partials")?
        .into_pointer_value();
    let start_slot = b.build_struct_gep(rargs_ty, rargs, 1, "start.slot")?;
    let start = b.build_load(i32_t, start_slot, "start")?.into_int_value();
    let end_slot = b.build_struct_gep(rargs_ty, rargs, 2, "end.slot")?;
    let end = b.build_load(i32_t, end_slot, "end")?.into_int_value();
    let m_slot = b.build_struct_gep(rargs_ty, rargs, 3, "m.slot")?;
    let m = b.build_load(i32_t, m_slot, "m")?.into_int_value();

    // Balanced slice bounds: [start + s*n/m, start + (s+1)*n/m). With
    // m <= n, no slice is empty, so the first iteration can seed the
    // accumulator directly.
    let n = b.build_int_sub(end, start, "n")?;
    let lo_scaled = b.build_int_mul(s, n, "lo.scaled")?;
    let lo_off = b.build_int_signed_div(lo_scaled, m, "lo.off")?;
    let i0 = b.build_int_add(start, lo_off, "i0")?;
    let s1 = b.build_int_add(s, one, "s1")?;
    let hi_scaled = b.build_int_mul(s1, n, "hi.scaled")?;
    let hi_off = b.build_int_signed_div(hi_scaled, m, "hi.off")?;
    let i1 = b.build_int_add(start, hi_off, "i1")?;

    let acc = b.build_alloca(t, "acc")?;
    let iv = b.build_alloca(i32_t, "i.ptr")?;
    b.build_store(index_slot, i0)?;
    let first = b
        .build_call(r.body(), &[triple.into()], "first")?
        .try_as_basic_value()
        .left()
        .ok_or_else(|| Diagnostic::simple("reduce body returns void"))?;
    b.build_store(acc, first)?;
    let i0_next = b.build_int_add(i0, one, "i0.next")?;
    b.build_store(iv, i0_next)?;
    b.build_unconditional_branch(cond_bb)?;

    b.position_at_end(cond_bb);
    let i = b.build_load(i32_t, iv, "i")?.into_int_value();
    let more = b.build_int_compare(IntPredicate::SLT, i, i1, "slice.more")?;
    b.build_conditional_branch(more, step_bb, done_bb)?;

    b.position_at_end(step_bb);
    b.build_store(index_slot, i)?;
    let v = b
        .build_call(r.body(), &[triple.into()], "v")?
        .try_as_basic_value()
        .left()
        .ok_or_else(|| Diagnostic::simple("reduce body returns void"))?;
    let prev = b.build_load(t, acc, "prev")?;
    let folded = b
        .build_call(r.combine(), &[prev.into(), v.into()], "folded")?
        .try_as_basic_value()
        .left()
        .ok_or_else(|| Diagnostic::simple("combine function returns void"))?;
    b.build_store(acc, folded)?;
    let i_next = b.build_int_add(i, one, "i.next")?;
    b.build_store(iv, i_next)?;
    b.build_unconditional_branch(cond_bb)?;

    b.position_at_end(done_bb);
    let total = b.build_load(t, acc, "slice.total")?;
    let slot = unsafe { b.build_gep(t, partials, &[s], "partial.ptr") }?;
    b.build_store(slot, total)?;
    b.build_call(decls.finish_func, &[triple.into()], "")?;
    b.build_return(None)?;

    Ok(driver)
}
