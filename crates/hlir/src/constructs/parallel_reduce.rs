//! The parallel-reduce construct.
//!
//! A reduce has two emitter-visible functions. The *body* runs once per
//! index like a parallel-for body, but instead of an epilogue it leaves
//! that iteration's contribution in `reduce_var` and returns it. The
//! *combine* function folds two partial results into one; the emitter
//! fills its (empty) entry block with an associative operator and a
//! return. Lowering fans the index range out over worker slices, folds
//! each slice with `combine`, and folds the slice totals again after the
//! await, so a non-associative operator produces nonsense by contract.

use std::cell::Cell;

use inkwell::AddressSpace;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::Module;
use inkwell::types::{BasicType, BasicTypeEnum};
use inkwell::values::{
    BasicValue, BasicValueEnum, FunctionValue, InstructionValue, IntValue, PointerValue,
};

use crate::diagnostics::{Diagnostic, LowerResult};
use crate::runtime_decls::declare_noop;

/// Zero of the reduce type; seeds the result slot so an empty range
/// reduces to zero rather than garbage.
pub(crate) fn const_zero<'ctx>(ty: BasicTypeEnum<'ctx>) -> LowerResult<BasicValueEnum<'ctx>> {
    Ok(match ty {
        BasicTypeEnum::IntType(t) => t.const_zero().into(),
        BasicTypeEnum::FloatType(t) => t.const_zero().into(),
        BasicTypeEnum::PointerType(t) => t.const_null().into(),
        other => {
            return Err(Diagnostic::simple(format!(
                "unsupported reduce type {:?}",
                other
            )));
        }
    })
}

pub struct HlirParallelReduce<'ctx> {
    name: String,
    body: FunctionValue<'ctx>,
    combine: FunctionValue<'ctx>,
    reduce_ty: BasicTypeEnum<'ctx>,
    /// Per-iteration accumulator slot in the body's frame.
    reduce_var: PointerValue<'ctx>,
    index_ptr: PointerValue<'ctx>,
    args_ptr: PointerValue<'ctx>,
    /// The final load of `reduce_var`; the emitter writes the iteration's
    /// code immediately before it.
    insertion: InstructionValue<'ctx>,
    args_insertion: InstructionValue<'ctx>,
    noop: FunctionValue<'ctx>,
    marker: Cell<Option<InstructionValue<'ctx>>>,
    range: Cell<Option<(IntValue<'ctx>, IntValue<'ctx>)>>,
    result_ptr: Cell<Option<PointerValue<'ctx>>>,
}

impl<'ctx> HlirParallelReduce<'ctx> {
    pub(crate) fn build(
        context: &'ctx Context,
        module: &Module<'ctx>,
        name: String,
        reduce_ty: BasicTypeEnum<'ctx>,
    ) -> LowerResult<Self> {
        // Reject types with no zero up front rather than at marker time.
        const_zero(reduce_ty)?;
        let noop = declare_noop(context, module);

        let ptr = context.i8_type().ptr_type(AddressSpace::default());
        let i32_t = context.i32_type();

        let body_ty = reduce_ty.fn_type(&[ptr.into()], false);
        let body = module.add_function(&format!("hlir.parallel_reduce.body.{}", name), body_ty, None);

        let b = context.create_builder();
        let entry = context.append_basic_block(body, "entry");
        b.position_at_end(entry);

        let reduce_var = b.build_alloca(reduce_ty, "reduce.var")?;

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

        let ret_val = b.build_load(reduce_var, "reduce.ret")?;
        let insertion = ret_val
            .as_instruction_value()
            .ok_or_else(|| Diagnostic::simple("return load is not an instruction"))?;
        b.build_return(Some(&ret_val))?;

        // The combine skeleton: `T combine(T, T)` with an empty entry
        // block the emitter must terminate with `ret`.
        let combine_ty = reduce_ty.fn_type(&[reduce_ty.into(), reduce_ty.into()], false);
        let combine = module.add_function(
            &format!("hlir.parallel_reduce.combine.{}", name),
            combine_ty,
            None,
        );
        context.append_basic_block(combine, "entry");

        Ok(HlirParallelReduce {
            name,
            body,
            combine,
            reduce_ty,
            reduce_var,
            index_ptr,
            args_ptr,
            insertion,
            args_insertion,
            noop,
            marker: Cell::new(None),
            range: Cell::new(None),
            result_ptr: Cell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn body(&self) -> FunctionValue<'ctx> {
        self.body
    }

    /// The two-argument fold function. Its entry block is empty; the
    /// emitter writes the operator and the return.
    pub fn combine(&self) -> FunctionValue<'ctx> {
        self.combine
    }

    pub fn reduce_ty(&self) -> BasicTypeEnum<'ctx> {
        self.reduce_ty
    }

    /// The iteration's accumulator slot; the body stores its contribution
    /// for the current index here.
    pub fn reduce_var(&self) -> PointerValue<'ctx> {
        self.reduce_var
    }

    pub fn index_ptr(&self) -> PointerValue<'ctx> {
        self.index_ptr
    }

    pub fn args(&self) -> PointerValue<'ctx> {
        self.args_ptr
    }

    pub fn insertion(&self) -> InstructionValue<'ctx> {
        self.insertion
    }

    pub(crate) fn args_insertion(&self) -> InstructionValue<'ctx> {
        self.args_insertion
    }

    /// Plants the launch marker and reserves the caller-side result slot,
    /// zero-initialized so an empty range reduces to zero. After the
    /// marker, the emitter reads the reduction out of
    /// [`result_ptr`](Self::result_ptr).
    pub fn insert_marker(&self, builder: &Builder<'ctx>) -> LowerResult<()> {
        let result = builder.build_alloca(self.reduce_ty, "reduce.result")?;
        builder.build_store(result, const_zero(self.reduce_ty)?)?;
        let marker = builder
            .build_call(self.noop, &[], "")?
            .try_as_basic_value()
            .right()
            .ok_or_else(|| Diagnostic::simple("marker call yielded a value"))?;
        self.result_ptr.set(Some(result));
        self.marker.set(Some(marker));
        Ok(())
    }

    pub fn set_range(&self, start: IntValue<'ctx>, end: IntValue<'ctx>) {
        self.range.set(Some((start, end)));
    }

    /// Caller-side slot holding the final reduction once the lowered
    /// region has run. Present after [`insert_marker`](Self::insert_marker).
    pub fn result_ptr(&self) -> Option<PointerValue<'ctx>> {
        self.result_ptr.get()
    }

    pub(crate) fn marker(&self) -> Option<InstructionValue<'ctx>> {
        self.marker.get()
    }

    pub(crate) fn range(&self) -> Option<(IntValue<'ctx>, IntValue<'ctx>)> {
        self.range.get()
    }
}
