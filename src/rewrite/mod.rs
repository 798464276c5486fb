// This module hosts the canonicalization engine: a registry of rewrite rules keyed by root op
// tag, the greedy driver that applies them to a fixed point, and the rule families. Folds
// forward existing values (identity casts, constant conditions, tuple extraction); the
// layout family pushes change_layout ops towards their users or removes them; the sign
// cast family does the same for signedness reinterpretation; the retain family removes
// trivially paired retain/release; the environment region family merges, cleans and
// inlines environment regions. The helpers below are shared by the families.

//! Rewrite rules and the greedy driver.

pub mod driver;
pub mod env_region;
pub mod folds;
pub mod layout;
pub mod registry;
pub mod retain;
pub mod sign_cast;

pub use driver::apply_rules_greedily;
pub use registry::{Rule, RuleFn, RuleSet};

use crate::ir::builder::Builder;
use crate::ir::module::{Module, OpId, ValueId};
use crate::ir::ops::{OpKind, OpTag};
use crate::ir::types::Type;

/// When `value` is produced by an op tagged `tag`, that op and its first operand.
pub(crate) fn source_of(m: &Module, value: ValueId, tag: OpTag) -> Option<(OpId, ValueId)> {
    let op = m.defining_op_of(value, tag)?;
    Some((op, m.operand(op, 0)))
}

/// Integer value of a constant.
pub(crate) fn const_int(m: &Module, value: ValueId) -> Option<i64> {
    let op = m.defining_op_of(value, OpTag::Constant)?;
    match m.kind(op) {
        OpKind::Constant(c) => c.as_int(),
        _ => None,
    }
}

pub(crate) fn is_constant(m: &Module, value: ValueId) -> bool {
    m.defining_op_of(value, OpTag::Constant).is_some()
}

/// Memref cast from `value` to `ty` right after its definition point `anchor`,
/// folded when the types match.
pub(crate) fn cast_before(m: &mut Module, anchor: OpId, value: ValueId, ty: &Type) -> ValueId {
    Builder::before(m, anchor).memref_cast_or_fold(value, ty.clone())
}

/// Retype result `index` of `op` to `new_ty`, then insert a cast op built by
/// `make_cast` right after `op` that converts back to the old type, and route
/// every other user through it.
pub(crate) fn retype_result<F>(m: &mut Module, op: OpId, index: usize, new_ty: Type, make_cast: F)
where
    F: FnOnce(&mut Builder<'_>, ValueId, Type) -> ValueId,
{
    let result = m.result(op, index);
    let old_ty = m.value_type(result).clone();
    if old_ty == new_ty {
        return;
    }
    m.set_value_type(result, new_ty);
    let mut b = Builder::after(m, op);
    let back = make_cast(&mut b, result, old_ty);
    if let Some(cast_op) = m.defining_op(back) {
        m.replace_all_uses_except(result, back, cast_op);
    }
}

/// Retype block argument `index` of `block` and convert back at the start of
/// the block with `make_cast`.
pub(crate) fn retype_block_arg<F>(
    m: &mut Module,
    block: crate::ir::module::BlockId,
    index: usize,
    new_ty: Type,
    make_cast: F,
) where
    F: FnOnce(&mut Builder<'_>, ValueId, Type) -> ValueId,
{
    let arg = m.block_arg(block, index);
    let old_ty = m.value_type(arg).clone();
    if old_ty == new_ty {
        return;
    }
    m.set_value_type(arg, new_ty);
    let mut b = Builder::at_start(m, block);
    let back = make_cast(&mut b, arg, old_ty);
    if let Some(cast_op) = m.defining_op(back) {
        m.replace_all_uses_except(arg, back, cast_op);
    }
}

/// Move the single block of region `region_index` of `op` in front of `op`,
/// replace the results of `op` by the operands of the block terminator and
/// erase both.
pub(crate) fn inline_into_parent(m: &mut Module, op: OpId, region_index: usize) {
    let Some(parent) = m.parent_block(op) else {
        return;
    };
    let block = m.body_block(op, region_index);
    let yielded: Vec<ValueId> = match m.terminator(block) {
        Some(term) => {
            let values = m.operands(term).to_vec();
            m.erase_op(term);
            values
        }
        None => Vec::new(),
    };
    let args: Vec<ValueId> = Vec::new();
    m.inline_block(block, parent, Some(op), &args);
    let results = m.results(op).to_vec();
    for (old, new) in results.into_iter().zip(yielded) {
        m.replace_all_uses(old, new);
    }
    m.erase_op(op);
}
