//! IR-shape tests: emit a construct by hand, lower it, verify the module
//! and assert on the printed IR.

use anyhow::{Result, anyhow};
use inkwell::AddressSpace;
use inkwell::context::Context;

use strand_hlir::HlirModule;

#[test]
fn lower_parallel_for_emits_queue_loop() -> Result<()> {
    let context = Context::create();
    let hlir = HlirModule::attach(&context, context.create_module("pfor_shape"))?;
    let ptr = context.ptr_type(AddressSpace::default());
    let i32_t = context.i32_type();

    // void kernel(ptr %out, i32 %k), with both values reloaded through
    // locals so the body captures instructions.
    let fn_ty = context.void_type().fn_type(&[ptr.into(), i32_t.into()], false);
    let kernel = hlir.module().add_function("kernel", fn_ty, None);
    let b = context.create_builder();
    b.position_at_end(context.append_basic_block(kernel, "entry"));
    let out_slot = b.build_alloca(ptr, "out.slot")?;
    b.build_store(out_slot, kernel.get_nth_param(0).unwrap())?;
    let out = b.build_load(ptr, out_slot, "out")?.into_pointer_value();
    let k_slot = b.build_alloca(i32_t, "k.slot")?;
    b.build_store(k_slot, kernel.get_nth_param(1).unwrap())?;
    let k = b.build_load(i32_t, k_slot, "k")?.into_int_value();

    // Body: out[index] = k + k. `k` is used twice but must be captured
    // once.
    let pf = hlir.create_parallel_for()?;
    let bb = context.create_builder();
    bb.position_before(&pf.insertion());
    let idx = bb.build_load(i32_t, pf.index_ptr(), "idx")?.into_int_value();
    let kk = bb.build_int_add(k, k, "kk")?;
    let slot = unsafe { bb.build_gep(i32_t, out, &[idx], "slot")? };
    bb.build_store(slot, kk)?;

    pf.set_range(i32_t.const_zero(), i32_t.const_int(8, false));
    pf.insert_marker(&b)?;
    b.build_return(None)?;

    hlir.lower_to_ir()?;
    hlir.module().verify().map_err(|e| anyhow!(e.to_string()))?;

    let ir = hlir.module().print_to_string().to_string();
    assert!(ir.contains("__strand_create_synch"));
    assert!(ir.contains("pfor.queue.loop"));
    assert!(ir.contains("__strand_queue_func"));
    assert!(ir.contains("__strand_await_synch"));
    assert!(ir.contains("pfor.merge"));
    // One capture struct with one field per distinct capture.
    assert!(ir.contains("alloca { ptr, i32 }"));
    assert!(!ir.contains("{ ptr, i32, i32 }"));
    // Every marker and anchor is gone.
    assert!(!ir.contains("call void @hlir.noop"));
    Ok(())
}

#[test]
fn lower_task_queues_and_forces_future() -> Result<()> {
    let context = Context::create();
    let hlir = HlirModule::attach(&context, context.create_module("task_shape"))?;
    let i32_t = context.i32_type();

    // i32 work(i32 %a, i32 %b) { ret a + b }
    let work_ty = i32_t.fn_type(&[i32_t.into(), i32_t.into()], false);
    let work = hlir.module().add_function("work", work_ty, None);
    let b = context.create_builder();
    b.position_at_end(context.append_basic_block(work, "entry"));
    let sum = b.build_int_add(
        work.get_nth_param(0).unwrap().into_int_value(),
        work.get_nth_param(1).unwrap().into_int_value(),
        "sum",
    )?;
    b.build_return(Some(&sum))?;

    // i32 caller(i32 %x) { %c = work(x, 1); ret c + 2 }
    let caller_ty = i32_t.fn_type(&[i32_t.into()], false);
    let caller = hlir.module().add_function("caller", caller_ty, None);
    b.position_at_end(context.append_basic_block(caller, "entry"));
    let x = caller.get_nth_param(0).unwrap().into_int_value();
    let c = b
        .build_call(work, &[x.into(), i32_t.const_int(1, false).into()], "c")?
        .try_as_basic_value()
        .left()
        .unwrap()
        .into_int_value();
    let out = b.build_int_add(c, i32_t.const_int(2, false), "out")?;
    b.build_return(Some(&out))?;

    let task = hlir.create_task();
    task.set_function(&hlir, work)?;
    hlir.lower_to_ir()?;
    hlir.module().verify().map_err(|e| anyhow!(e.to_string()))?;

    let ir = hlir.module().print_to_string().to_string();
    assert!(ir.contains("__strand_task_queue"));
    assert!(ir.contains("__strand_task_await_future"));
    assert!(ir.contains("__strand_task_destroy"));
    assert!(ir.contains("hlir.task_wrapper"));
    // The depth slot is written before the launch.
    assert!(ir.contains("depth.ptr"));
    // The only surviving direct call of @work is the wrapper's.
    assert_eq!(ir.matches("call i32 @work(").count(), 1);
    Ok(())
}

#[test]
fn task_unused_result_is_not_awaited() -> Result<()> {
    let context = Context::create();
    let hlir = HlirModule::attach(&context, context.create_module("task_unused"))?;
    let i32_t = context.i32_type();

    let work_ty = i32_t.fn_type(&[i32_t.into()], false);
    let work = hlir.module().add_function("work", work_ty, None);
    let b = context.create_builder();
    b.position_at_end(context.append_basic_block(work, "entry"));
    let n = work.get_nth_param(0).unwrap().into_int_value();
    b.build_return(Some(&n))?;

    // The result of the launch is never read: fire and forget.
    let caller_ty = i32_t.fn_type(&[i32_t.into()], false);
    let caller = hlir.module().add_function("caller", caller_ty, None);
    b.position_at_end(context.append_basic_block(caller, "entry"));
    let x = caller.get_nth_param(0).unwrap().into_int_value();
    b.build_call(work, &[x.into()], "ignored")?;
    b.build_return(Some(&x))?;

    let task = hlir.create_task();
    task.set_function(&hlir, work)?;
    hlir.lower_to_ir()?;
    hlir.module().verify().map_err(|e| anyhow!(e.to_string()))?;

    let ir = hlir.module().print_to_string().to_string();
    assert!(ir.contains("__strand_task_queue"));
    assert!(!ir.contains("__strand_task_await_future"));
    assert!(!ir.contains("__strand_task_destroy"));
    Ok(())
}

#[test]
fn lower_parallel_reduce_emits_driver_and_combine() -> Result<()> {
    let context = Context::create();
    let hlir = HlirModule::attach(&context, context.create_module("reduce_shape"))?;
    let i32_t = context.i32_type();

    let r = hlir.create_parallel_reduce(i32_t.into())?;

    // Body: contribution is the index itself.
    let bb = context.create_builder();
    bb.position_before(&r.insertion());
    let idx = bb.build_load(i32_t, r.index_ptr(), "idx")?.into_int_value();
    bb.build_store(r.reduce_var(), idx)?;

    // Combine: addition.
    let cb = context.create_builder();
    cb.position_at_end(r.combine().get_first_basic_block().unwrap());
    let folded = cb.build_int_add(
        r.combine().get_nth_param(0).unwrap().into_int_value(),
        r.combine().get_nth_param(1).unwrap().into_int_value(),
        "folded",
    )?;
    cb.build_return(Some(&folded))?;

    let sum_ty = i32_t.fn_type(&[], false);
    let sum = hlir.module().add_function("sum", sum_ty, None);
    let b = context.create_builder();
    b.position_at_end(context.append_basic_block(sum, "entry"));
    r.set_range(i32_t.const_zero(), i32_t.const_int(100, false));
    r.insert_marker(&b)?;
    let total = b.build_load(i32_t, r.result_ptr().unwrap(), "total")?;
    b.build_return(Some(&total))?;

    hlir.lower_to_ir()?;
    hlir.module().verify().map_err(|e| anyhow!(e.to_string()))?;

    let ir = hlir.module().print_to_string().to_string();
    assert!(ir.contains("hlir.parallel_reduce.driver"));
    assert!(ir.contains("__strand_num_workers"));
    assert!(ir.contains("reduce.queue.loop"));
    assert!(ir.contains("reduce.comb.fold"));
    assert!(ir.contains("__strand_free"));
    assert!(!ir.contains("call void @hlir.noop"));
    Ok(())
}

#[test]
fn lowering_without_marker_is_an_error() -> Result<()> {
    let context = Context::create();
    let hlir = HlirModule::attach(&context, context.create_module("no_marker"))?;
    let i32_t = context.i32_type();

    let pf = hlir.create_parallel_for()?;
    pf.set_range(i32_t.const_zero(), i32_t.const_int(4, false));

    let err = hlir.lower_to_ir().unwrap_err();
    assert!(err.message.contains("never placed"));
    Ok(())
}

#[test]
fn unfinished_combine_is_an_error() -> Result<()> {
    let context = Context::create();
    let hlir = HlirModule::attach(&context, context.create_module("bad_combine"))?;
    let i32_t = context.i32_type();

    let r = hlir.create_parallel_reduce(i32_t.into())?;
    let bb = context.create_builder();
    bb.position_before(&r.insertion());
    let idx = bb.build_load(i32_t, r.index_ptr(), "idx")?.into_int_value();
    bb.build_store(r.reduce_var(), idx)?;

    let host_ty = context.void_type().fn_type(&[], false);
    let host = hlir.module().add_function("host", host_ty, None);
    let b = context.create_builder();
    b.position_at_end(context.append_basic_block(host, "entry"));
    r.set_range(i32_t.const_zero(), i32_t.const_int(10, false));
    r.insert_marker(&b)?;
    b.build_return(None)?;

    let err = hlir.lower_to_ir().unwrap_err();
    assert!(err.message.contains("combine"));
    Ok(())
}

#[test]
fn attaching_twice_is_an_error() -> Result<()> {
    let context = Context::create();
    let first = HlirModule::attach(&context, context.create_module("dup_mod"))?;
    let second = HlirModule::attach(&context, context.create_module("dup_mod"));
    assert!(second.is_err());
    drop(first);
    Ok(())
}
