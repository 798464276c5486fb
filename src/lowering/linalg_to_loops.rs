//! Lowering of linalg ops and memref copies to `scf.for` nests.
//!
//! Every op iterates the full index space of its (first) output with one loop
//! per dimension, innermost dimension last. `bufferization.clone` becomes an
//! allocation plus the same copy nest.

use hashbrown::HashMap;

use super::{pass_failure, Pass};
use crate::core::error::PassResult;
use crate::core::session::PipelineSession;
use crate::ir::builder::Builder;
use crate::ir::module::{Module, OpId, ValueId};
use crate::ir::ops::{OpKind, OpTag};
use crate::ir::types::{Dim, Layout, Type};

pub struct LinalgToLoops;

impl Pass for LinalgToLoops {
    fn name(&self) -> &'static str {
        "linalg-to-loops"
    }

    fn run(&self, m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()> {
        let start = session.diagnostic_count();
        let targets: Vec<OpId> = m
            .walk()
            .into_iter()
            .filter(|op| {
                matches!(
                    m.tag(*op),
                    OpTag::LinalgFill | OpTag::LinalgGeneric | OpTag::Copy | OpTag::Clone
                )
            })
            .collect();
        for op in targets {
            let lowered = match m.kind(op).clone() {
                OpKind::LinalgFill => lower_fill(m, op),
                OpKind::LinalgGeneric { num_inputs } => lower_generic(m, op, num_inputs),
                OpKind::Copy => lower_copy(m, op),
                OpKind::Clone => lower_clone(m, op),
                _ => true,
            };
            if !lowered {
                session.error(Some(op), format!("cannot lower {} to loops", m.kind(op).name()));
            }
        }
        match session.first_error_since(start) {
            Some(_) => Err(pass_failure(self.name(), session, start, "")),
            None => Ok(()),
        }
    }
}

/// Extents of every dimension of `memref`, materialized before `anchor`.
fn extents(m: &mut Module, anchor: OpId, memref: ValueId) -> Option<Vec<ValueId>> {
    let shape = m.value_type(memref).as_memref()?.shape.clone();
    let mut b = Builder::before(m, anchor);
    Some(
        shape
            .iter()
            .enumerate()
            .map(|(i, d)| match d {
                Dim::Static(n) => b.const_index(*n),
                Dim::Dynamic => {
                    let idx = b.const_index(i as i64);
                    b.dim(memref, idx)
                }
            })
            .collect(),
    )
}

/// Unit-step loop nest over `extents` before `anchor`. Returns the induction
/// variables and the op new body ops go in front of.
fn loop_nest(m: &mut Module, anchor: OpId, extents: &[ValueId]) -> (Vec<ValueId>, OpId) {
    let mut ivs = Vec::with_capacity(extents.len());
    let mut insert_before = anchor;
    for extent in extents {
        let mut b = Builder::before(m, insert_before);
        let zero = b.const_index(0);
        let one = b.const_index(1);
        let for_op = b.for_(zero, *extent, one, vec![]);
        let body = m.body_block(for_op, 0);
        ivs.push(m.block_arg(body, 0));
        insert_before = Builder::at_end(m, body).yield_(vec![]);
    }
    (ivs, insert_before)
}

fn lower_fill(m: &mut Module, op: OpId) -> bool {
    let value = m.operand(op, 0);
    let output = m.operand(op, 1);
    let Some(extents) = extents(m, op, output) else {
        return false;
    };
    let (ivs, at) = loop_nest(m, op, &extents);
    Builder::before(m, at).store(value, output, ivs);
    m.erase_op(op);
    true
}

fn lower_copy(m: &mut Module, op: OpId) -> bool {
    let source = m.operand(op, 0);
    let target = m.operand(op, 1);
    if !emit_copy(m, op, source, target) {
        return false;
    }
    m.erase_op(op);
    true
}

fn emit_copy(m: &mut Module, anchor: OpId, source: ValueId, target: ValueId) -> bool {
    let Some(extents) = extents(m, anchor, target) else {
        return false;
    };
    let (ivs, at) = loop_nest(m, anchor, &extents);
    let mut b = Builder::before(m, at);
    let v = b.load(source, ivs.clone());
    b.store(v, target, ivs);
    true
}

fn lower_clone(m: &mut Module, op: OpId) -> bool {
    let source = m.operand(op, 0);
    let result = m.result(op, 0);
    let Some(result_ty) = m.value_type(result).as_memref().cloned() else {
        return false;
    };
    let alloc_ty = result_ty.with_layout(Layout::Identity);
    let dynamic: Vec<usize> = alloc_ty
        .shape
        .iter()
        .enumerate()
        .filter(|(_, d)| d.is_dynamic())
        .map(|(i, _)| i)
        .collect();
    let mut b = Builder::before(m, op);
    let sizes: Vec<ValueId> = dynamic
        .into_iter()
        .map(|i| {
            let idx = b.const_index(i as i64);
            b.dim(source, idx)
        })
        .collect();
    let fresh = b.alloc(Type::MemRef(alloc_ty), sizes);
    let replacement = b.memref_cast_or_fold(fresh, Type::MemRef(result_ty));
    if !emit_copy(m, op, source, fresh) {
        return false;
    }
    m.replace_op(op, &[replacement]);
    true
}

fn lower_generic(m: &mut Module, op: OpId, num_inputs: usize) -> bool {
    let operands = m.operands(op).to_vec();
    let outputs = &operands[num_inputs.min(operands.len())..];
    let Some(first_output) = outputs.first().copied() else {
        return false;
    };
    let Some(extents) = extents(m, op, first_output) else {
        return false;
    };
    let body = m.body_block(op, 0);
    let Some(term) = m.terminator(body) else {
        return false;
    };
    let (ivs, at) = loop_nest(m, op, &extents);

    let mut mapping: HashMap<ValueId, ValueId> = HashMap::new();
    let mut b = Builder::before(m, at);
    for (i, operand) in operands.iter().enumerate() {
        let scalar = b.load(*operand, ivs.clone());
        let arg = b.module().block_arg(body, i);
        mapping.insert(arg, scalar);
    }
    for inner in m.block_ops(body).to_vec() {
        if inner == term {
            continue;
        }
        let cloned = m.clone_op(inner, &mut mapping);
        m.insert_op_before(at, cloned);
    }
    let yielded: Vec<ValueId> = m
        .operands(term)
        .iter()
        .map(|v| *mapping.get(v).unwrap_or(v))
        .collect();
    let mut b = Builder::before(m, at);
    for (value, output) in yielded.into_iter().zip(outputs) {
        b.store(value, *output, ivs.clone());
    }
    m.erase_op(op);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{build_func, TestContext};
    use crate::ir::ops::BinOp;
    use crate::ir::verify::verify_module;

    fn count(m: &Module, tag: OpTag) -> usize {
        m.walk().into_iter().filter(|o| m.tag(*o) == tag).count()
    }

    #[test]
    fn test_fill_becomes_loop_nest() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("fill");
        let mem = Type::memref(Type::f32(), vec![Dim::Static(4), Dim::Dynamic]);
        let (_, entry) = build_func(&mut m, "f", vec![mem], vec![]);
        let out = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let zero = b.const_float(0.0, Type::f32());
        b.linalg_fill(zero, out);
        b.return_(vec![]);

        LinalgToLoops.run(&mut m, &session).unwrap();
        verify_module(&m).unwrap();
        assert_eq!(count(&m, OpTag::For), 2);
        assert_eq!(count(&m, OpTag::Store), 1);
        assert_eq!(count(&m, OpTag::Dim), 1);
        assert_eq!(count(&m, OpTag::LinalgFill), 0);
    }

    #[test]
    fn test_generic_body_is_inlined() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("generic");
        let mem = Type::memref(Type::f64(), vec![Dim::Dynamic]);
        let (_, entry) = build_func(&mut m, "add", vec![mem.clone(), mem.clone(), mem], vec![]);
        let a = m.block_arg(entry, 0);
        let c = m.block_arg(entry, 1);
        let out = m.block_arg(entry, 2);
        let mut b = Builder::at_end(&mut m, entry);
        let generic = b.linalg_generic(vec![a, c], vec![out]);
        b.return_(vec![]);
        let body = m.body_block(generic, 0);
        let x = m.block_arg(body, 0);
        let y = m.block_arg(body, 1);
        let mut gb = Builder::at_end(&mut m, body);
        let sum = gb.binary(BinOp::AddF, x, y);
        gb.yield_(vec![sum]);

        LinalgToLoops.run(&mut m, &session).unwrap();
        verify_module(&m).unwrap();
        assert_eq!(count(&m, OpTag::LinalgGeneric), 0);
        assert_eq!(count(&m, OpTag::Load), 3);
        assert_eq!(count(&m, OpTag::Binary), 1);
        assert_eq!(count(&m, OpTag::Store), 1);
    }

    #[test]
    fn test_clone_allocates_and_copies() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("clone");
        let mem = Type::memref(Type::i64(), vec![Dim::Dynamic]);
        let (_, entry) = build_func(&mut m, "dup", vec![mem.clone()], vec![mem.clone()]);
        let src = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let cloned = b.create(OpKind::Clone, vec![src], mem);
        let ret = b.return_(vec![cloned]);

        LinalgToLoops.run(&mut m, &session).unwrap();
        verify_module(&m).unwrap();
        let result = m.operand(ret, 0);
        assert!(m.defining_op_of(result, OpTag::Alloc).is_some());
        assert_eq!(count(&m, OpTag::For), 1);
        assert_eq!(count(&m, OpTag::Clone), 0);
    }
}
