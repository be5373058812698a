//! The parallel-for construct.
//!
//! `create_parallel_for` synthesizes a body function that the runtime
//! invokes once per index. The body receives one opaque pointer, the
//! per-iteration triple `{synch, index, captured_args}` packed by
//! `__strand_queue_func`; its prologue unpacks the triple and its
//! epilogue hands the triple back to `__strand_finish_func`, which
//! releases the loop's completion latch. The emitter writes the user's
//! code between the two.

use std::cell::Cell;

use inkwell::AddressSpace;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::values::{FunctionValue, InstructionValue, IntValue, PointerValue};

use crate::diagnostics::{Diagnostic, LowerResult};
use crate::runtime_decls::{RuntimeDecls, declare_noop};

pub struct HlirParallelFor<'ctx> {
    name: String,
    body: FunctionValue<'ctx>,
    /// Pointer to the iteration index (i32) inside the triple; the body
    /// reads the induction variable through this.
    index_ptr: PointerValue<'ctx>,
    /// The captured-args pointer loaded out of the triple.
    args_ptr: PointerValue<'ctx>,
    /// The epilogue call; the emitter positions its builder before this
    /// instruction to write the loop body.
    insertion: InstructionValue<'ctx>,
    /// Anchor where lowering will unpack the capture struct.
    args_insertion: InstructionValue<'ctx>,
    noop: FunctionValue<'ctx>,
    marker: Cell<Option<InstructionValue<'ctx>>>,
    range: Cell<Option<(IntValue<'ctx>, IntValue<'ctx>)>>,
}

impl<'ctx> HlirParallelFor<'ctx> {
    pub(crate) fn build(
        context: &'ctx Context,
        module: &Module<'ctx>,
        name: String,
    ) -> LowerResult<Self> {
        let decls = RuntimeDecls::declare(context, module);
        let noop = declare_noop(context, module);

        let ptr = context.i8_type().ptr_type(AddressSpace::default());
        let i32_t = context.i32_type();
        let fn_ty = context.void_type().fn_type(&[ptr.into()], false);
        let body = module.add_function(&format!("hlir.parallel_for.body.{}", name), fn_ty, None);

        let b = context.create_builder();
        let entry = context.append_basic_block(body, "entry");
        b.position_at_end(entry);

        let triple_ty = context.struct_type(&[ptr.into(), i32_t.into(), ptr.into()], false);
        let triple_raw = body
            .get_nth_param(0)
            .ok_or_else(|| Diagnostic::simple("body function lost its argument"))?
            .into_pointer_value();
        let triple = b.build_pointer_cast(
            triple_raw,
            triple_ty.ptr_type(AddressSpace::default()),
            "triple",
        )?;

        let index_ptr = b.build_struct_gep(triple, 1, "index.ptr")?;
        let args_slot = b.build_struct_gep(triple, 2, "funcargs.slot")?;
        let args_ptr = b.build_load(args_slot, "funcargs.ptr")?.into_pointer_value();

        let args_insertion = b
            .build_call(noop, &[], "")?
            .try_as_basic_value()
            .right()
            .ok_or_else(|| Diagnostic::simple("anchor call yielded a value"))?;

        let insertion = b
            .build_call(decls.finish_func, &[triple_raw.into()], "")?
            .try_as_basic_value()
            .right()
            .ok_or_else(|| Diagnostic::simple("epilogue call yielded a value"))?;
        b.build_return(None)?;

        Ok(HlirParallelFor {
            name,
            body,
            index_ptr,
            args_ptr,
            insertion,
            args_insertion,
            noop,
            marker: Cell::new(None),
            range: Cell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> FunctionValue<'ctx> {
        self.body
    }

    /// Pointer to the i32 induction variable, valid inside the body.
    pub fn index_ptr(&self) -> PointerValue<'ctx> {
        self.index_ptr
    }

    /// The opaque captured-args pointer, valid inside the body. Lowering
    /// gives it a concrete struct type once the capture set is known.
    pub fn args(&self) -> PointerValue<'ctx> {
        self.args_ptr
    }

    /// The emitter writes the loop body immediately before this
    /// instruction (the epilogue call).
    pub fn insertion(&self) -> InstructionValue<'ctx> {
        self.insertion
    }

    pub(crate) fn args_insertion(&self) -> InstructionValue<'ctx> {
        self.args_insertion
    }

    /// Plants the launch marker at the builder's current position. The
    /// lowering pass replaces the marker with the capture/queue/await
    /// sequence and resumes the surrounding code after it.
    pub fn insert_marker(&self, builder: &Builder<'ctx>) -> LowerResult<()> {
        let marker = builder
            .build_call(self.noop, &[], "")?
            .try_as_basic_value()
            .right()
            .ok_or_else(|| Diagnostic::simple("marker call yielded a value"))?;
        self.marker.set(Some(marker));
        Ok(())
    }

    /// Sets the half-open iteration range `[start, end)`.
    pub fn set_range(&self, start: IntValue<'ctx>, end: IntValue<'ctx>) {
        self.range.set(Some((start, end)));
    }

    pub(crate) fn marker(&self) -> Option<InstructionValue<'ctx>> {
        self.marker.get()
    }

    pub(crate) fn range(&self) -> Option<(IntValue<'ctx>, IntValue<'ctx>)> {
        self.range.get()
    }
}
