// This module checks the structural invariants that the rewrite rules and lowering passes
// rely on: every block of a function or structured op ends in a terminator, structured ops
// yield exactly as many values as they produce (with matching types for if/for/env regions),
// branch successors are live blocks of the same region with argument counts matching the
// successor block, operands refer to live values, and operands of a region-holding op's
// body are either defined inside it or visible from an enclosing region. It runs after each
// pass when `verify_each` is set and is used directly by tests.

//! Structural verifier.

use super::module::{Module, OpId, ValueDef, ValueId};
use super::ops::{OpKind, OpTag};
use crate::core::error::{IrError, IrResult};

fn fail(reason: String) -> IrResult<()> {
    Err(IrError::Verification { reason })
}

/// Verify the whole module.
pub fn verify_module(m: &Module) -> IrResult<()> {
    for op in m.walk() {
        verify_op(m, op)?;
    }
    Ok(())
}

fn value_is_live(m: &Module, v: ValueId) -> bool {
    match m.value_def(v) {
        ValueDef::OpResult { op, .. } => m.is_alive(op),
        ValueDef::BlockArg { block, .. } => m.is_block_alive(block),
    }
}

/// `v` is visible at `user`: defined in a region enclosing the user.
fn value_visible_at(m: &Module, v: ValueId, user: OpId) -> bool {
    let Some(def_block) = m.value_parent_block(v) else {
        return false;
    };
    let mut block = m.parent_block(user);
    while let Some(b) = block {
        if b == def_block {
            return true;
        }
        // same region: any block of an unstructured CFG may be visible through dominance
        if m.block_parent_region(b).is_some() && m.block_parent_region(b) == m.block_parent_region(def_block) {
            return true;
        }
        block = m.block_parent_op(b).and_then(|p| m.parent_block(p));
    }
    false
}

fn yield_arity(m: &Module, op: OpId, region: usize) -> Option<(OpId, usize)> {
    let block = m.entry_block(m.region(op, region))?;
    let term = m.terminator(block)?;
    Some((term, m.num_operands(term)))
}

fn verify_op(m: &Module, op: OpId) -> IrResult<()> {
    let name = m.kind(op).name();
    for v in m.operands(op) {
        if !value_is_live(m, *v) {
            return fail(format!("{} uses an erased value", name));
        }
        if !value_visible_at(m, *v, op) {
            return fail(format!("{} uses a value not visible at its position", name));
        }
    }

    // blocks of regions must be terminated
    let is_decl = matches!(m.kind(op), OpKind::Func { .. }) && m.region_blocks(m.region(op, 0)).is_empty();
    if !is_decl {
        for region in m.regions(op) {
            for block in m.region_blocks(*region) {
                if m.terminator(*block).is_none() {
                    return Err(IrError::MissingTerminator { op: name });
                }
            }
        }
    }

    match m.kind(op) {
        OpKind::If => {
            for r in 0..2 {
                if let Some((term, n)) = yield_arity(m, op, r) {
                    if n != m.num_results(op) {
                        return Err(IrError::OperandCount {
                            op: "scf.yield",
                            expected: m.num_results(op),
                            found: n,
                        });
                    }
                    for (y, res) in m.operands(term).iter().zip(m.results(op)) {
                        if m.value_type(*y) != m.value_type(*res) {
                            return Err(IrError::TypeMismatch {
                                op: "scf.if",
                                reason: format!("yield {} vs result {}", m.value_type(*y), m.value_type(*res)),
                            });
                        }
                    }
                }
            }
        }
        OpKind::For => {
            let inits = m.num_operands(op).saturating_sub(3);
            if inits != m.num_results(op) {
                return Err(IrError::OperandCount {
                    op: "scf.for",
                    expected: m.num_results(op),
                    found: inits,
                });
            }
            let body = m.body_block(op, 0);
            if m.block_args(body).len() != inits + 1 {
                return Err(IrError::OperandCount {
                    op: "scf.for body",
                    expected: inits + 1,
                    found: m.block_args(body).len(),
                });
            }
            if let Some((term, n)) = yield_arity(m, op, 0) {
                if n != inits {
                    return Err(IrError::OperandCount {
                        op: "scf.yield",
                        expected: inits,
                        found: n,
                    });
                }
                for i in 0..inits {
                    let init_ty = m.value_type(m.operand(op, 3 + i));
                    let arg_ty = m.value_type(m.block_arg(body, 1 + i));
                    let yield_ty = m.value_type(m.operand(term, i));
                    let res_ty = m.value_type(m.result(op, i));
                    if init_ty != arg_ty || arg_ty != yield_ty || yield_ty != res_ty {
                        return Err(IrError::TypeMismatch {
                            op: "scf.for",
                            reason: format!("loop-carried value {} has inconsistent types", i),
                        });
                    }
                }
            }
        }
        OpKind::EnvRegion { .. } => {
            if let Some((term, n)) = yield_arity(m, op, 0) {
                if m.tag(term) != OpTag::EnvYield || n != m.num_results(op) {
                    return Err(IrError::OperandCount {
                        op: "util.env_region_yield",
                        expected: m.num_results(op),
                        found: n,
                    });
                }
            }
        }
        OpKind::Br | OpKind::CondBr { .. } => {
            let region = m.parent_block(op).and_then(|b| m.block_parent_region(b));
            for (i, succ) in m.successors(op).iter().enumerate() {
                if !m.is_block_alive(*succ) || m.block_parent_region(*succ) != region {
                    return fail(format!("{} branches to a block outside its region", name));
                }
                let passed = branch_args(m, op, i).len();
                if passed != m.block_args(*succ).len() {
                    return Err(IrError::OperandCount {
                        op: "cf.br",
                        expected: m.block_args(*succ).len(),
                        found: passed,
                    });
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Arguments a branch passes to successor `index`.
pub fn branch_args(m: &Module, op: OpId, index: usize) -> Vec<ValueId> {
    match m.kind(op) {
        OpKind::Br => m.operands(op).to_vec(),
        OpKind::CondBr { true_args } => {
            let ops = m.operands(op);
            if index == 0 {
                ops[1..1 + true_args].to_vec()
            } else {
                ops[1 + true_args..].to_vec()
            }
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use crate::ir::ops::Visibility;
    use crate::ir::types::{FunctionType, Type};

    #[test]
    fn test_missing_terminator_is_reported() {
        let mut m = Module::new("verify");
        let body = m.body();
        let f = Builder::at_end(&mut m, body).func("f", FunctionType::new(vec![], vec![]), Visibility::Public);
        assert!(matches!(verify_module(&m), Err(IrError::MissingTerminator { .. })));

        let entry = m.body_block(f, 0);
        Builder::at_end(&mut m, entry).return_(vec![]);
        assert_eq!(verify_module(&m), Ok(()));
    }

    #[test]
    fn test_if_yield_arity() {
        let mut m = Module::new("verify");
        let body = m.body();
        let f = Builder::at_end(&mut m, body).func("f", FunctionType::new(vec![Type::i1()], vec![]), Visibility::Public);
        let entry = m.body_block(f, 0);
        let cond = m.block_arg(entry, 0);
        let if_op = Builder::at_end(&mut m, entry).if_(cond, vec![Type::Index]);
        let then_block = m.body_block(if_op, 0);
        let else_block = m.body_block(if_op, 1);
        let c = Builder::at_end(&mut m, then_block).const_index(1);
        Builder::at_end(&mut m, then_block).yield_(vec![c]);
        Builder::at_end(&mut m, else_block).yield_(vec![]);
        Builder::at_end(&mut m, entry).return_(vec![]);
        assert!(matches!(verify_module(&m), Err(IrError::OperandCount { .. })));
    }
}
