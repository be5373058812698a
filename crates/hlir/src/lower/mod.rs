//! Lowering passes: one per construct kind, plus the IR surgery they
//! share.
//!
//! The passes rewrite in place. Capture discovery and use-rewriting walk
//! instruction operands directly; the block split at a marker is the one
//! mutation inkwell's safe surface does not expose, so it detaches the
//! tail instructions and re-inserts them through a builder via the C API.

pub mod parallel_for;
pub mod parallel_reduce;
pub mod task;

use std::collections::HashSet;

use either::Either;
use inkwell::basic_block::BasicBlock;
use inkwell::context::Context;
use inkwell::values::{AsValueRef, BasicValue, BasicValueEnum, FunctionValue, InstructionValue};
use llvm_sys::core::{LLVMInsertIntoBuilder, LLVMInstructionRemoveFromParent};

use crate::diagnostics::{Diagnostic, LowerResult};

/// Values used by instructions of `body` whose defining instruction lives
/// in a different function: the capture set, in first-encounter order,
/// deduplicated.
pub(crate) fn find_external_values<'ctx>(
    body: FunctionValue<'ctx>,
) -> Vec<BasicValueEnum<'ctx>> {
    let mut seen = HashSet::new();
    let mut captured = Vec::new();
    let mut block = body.get_first_basic_block();
    while let Some(bb) = block {
        let mut inst = bb.get_first_instruction();
        while let Some(i) = inst {
            for idx in 0..i.get_num_operands() {
                let Some(Either::Left(op)) = i.get_operand(idx) else {
                    continue;
                };
                let Some(def) = op.as_instruction_value() else {
                    continue;
                };
                let defined_here = def
                    .get_parent()
                    .and_then(|b| b.get_parent())
                    .is_some_and(|f| f == body);
                if !defined_here && seen.insert(op.as_value_ref() as usize) {
                    captured.push(op);
                }
            }
            inst = i.get_next_instruction();
        }
        block = bb.get_next_basic_block();
    }
    captured
}

/// Rewrites every operand inside `func` that is `from` to `to`. Uses in
/// other functions are untouched.
pub(crate) fn replace_uses_in_function<'ctx>(
    func: FunctionValue<'ctx>,
    from: BasicValueEnum<'ctx>,
    to: BasicValueEnum<'ctx>,
) {
    let from_ref = from.as_value_ref();
    let mut block = func.get_first_basic_block();
    while let Some(bb) = block {
        let mut inst = bb.get_first_instruction();
        while let Some(i) = inst {
            for idx in 0..i.get_num_operands() {
                if let Some(Either::Left(op)) = i.get_operand(idx)
                    && op.as_value_ref() == from_ref
                {
                    i.set_operand(idx, to);
                }
            }
            inst = i.get_next_instruction();
        }
        block = bb.get_next_basic_block();
    }
}

/// Splits the marker's block: every instruction after the marker moves
/// into a fresh block named `merge_name`, the marker itself is erased,
/// and the truncated block is left without a terminator for the pass to
/// extend. Returns the continuation block.
///
/// Phi nodes in the moved terminator's successors keep naming the
/// original block; the emitter contract is that a marker's block has no
/// phi-carrying successors (markers sit in straight-line code).
pub(crate) fn split_block_at_marker<'ctx>(
    context: &'ctx Context,
    marker: InstructionValue<'ctx>,
    merge_name: &str,
) -> LowerResult<BasicBlock<'ctx>> {
    let block = marker
        .get_parent()
        .ok_or_else(|| Diagnostic::simple("marker is not attached to a block"))?;
    let func = block
        .get_parent()
        .ok_or_else(|| Diagnostic::simple("marker block is not attached to a function"))?;
    let merge = context.append_basic_block(func, merge_name);

    let mut tail = Vec::new();
    let mut inst = marker.get_next_instruction();
    while let Some(i) = inst {
        tail.push(i);
        inst = i.get_next_instruction();
    }

    let mover = context.create_builder();
    mover.position_at_end(merge);
    for i in tail {
        unsafe {
            LLVMInstructionRemoveFromParent(i.as_value_ref());
            LLVMInsertIntoBuilder(mover.as_mut_ptr(), i.as_value_ref());
        }
    }
    marker.erase_from_basic_block();
    Ok(merge)
}

/// The first instruction using `value`, scanning program order from the
/// defining call: the rest of its block, then later blocks in layout
/// order. A use that only occurs in an earlier block (a back edge) is
/// not found; forcing a future across a loop back edge is outside the
/// lowering's contract.
pub(crate) fn find_first_use<'ctx>(
    value: InstructionValue<'ctx>,
) -> Option<InstructionValue<'ctx>> {
    let value_ref = value.as_value_ref();
    let uses_value = |i: InstructionValue<'ctx>| {
        (0..i.get_num_operands()).any(|idx| {
            matches!(i.get_operand(idx), Some(Either::Left(op)) if op.as_value_ref() == value_ref)
        })
    };

    let mut inst = value.get_next_instruction();
    while let Some(i) = inst {
        if uses_value(i) {
            return Some(i);
        }
        inst = i.get_next_instruction();
    }
    let mut block = value.get_parent()?.get_next_basic_block();
    while let Some(bb) = block {
        let mut inst = bb.get_first_instruction();
        while let Some(i) = inst {
            if uses_value(i) {
                return Some(i);
            }
            inst = i.get_next_instruction();
        }
        block = bb.get_next_basic_block();
    }
    None
}
