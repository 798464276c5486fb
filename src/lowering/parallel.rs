// This module removes the parallel constructs of the shaped-array layer. Environment regions
// tagged `parallel` are only a scheduling hint, so `RemoveParallelRegion` unwraps them into
// their parent. `LowerParallelToCfg` outlines every `scf.parallel` loop nest into a private
// function `<parent>_outlined[_N]` with the runtime body signature `(ranges, thread_index,
// context)`. Values the loop body captures from the enclosing function are spilled into a
// stack-allocated context struct and reloaded at the top of the outlined body (captured
// constants are rematerialized there instead); the loop
// bounds are written into a stack array of `{lower, upper, step}` triples, one per loop
// dimension. The outlined body rebuilds the nest as sequential `scf.for` loops over the
// bounds it receives, so a scheduler may hand it any sub-range. The parallel op itself is
// replaced by a call to `nmrtParallelFor(ranges, num_loops, body, context)`.

//! Parallel region removal and parallel loop outlining.

use hashbrown::{HashMap, HashSet};

use super::{declare_function, func_name, unique_function_name, Pass};
use crate::core::error::PassResult;
use crate::core::session::PipelineSession;
use crate::ir::attrs::EnvAttr;
use crate::ir::builder::{Builder, InsertPoint};
use crate::ir::module::{Module, OpId, ValueId};
use crate::ir::ops::{GepIndex, OpKind, OpTag, Visibility};
use crate::ir::types::{FunctionType, Type};
use crate::rewrite::inline_into_parent;

pub const PARALLEL_FOR: &str = "nmrtParallelFor";

/// Inline every `parallel` environment region into its parent.
pub struct RemoveParallelRegion;

impl Pass for RemoveParallelRegion {
    fn name(&self) -> &'static str {
        "remove-parallel-region"
    }

    fn run(&self, m: &mut Module, _session: &PipelineSession<'_>) -> PassResult<()> {
        let regions: Vec<OpId> = m
            .walk()
            .into_iter()
            .filter(|op| matches!(m.kind(*op), OpKind::EnvRegion { env: EnvAttr::Parallel }))
            .collect();
        // innermost first
        for op in regions.into_iter().rev() {
            inline_into_parent(m, op, 0);
        }
        Ok(())
    }
}

/// Outline `scf.parallel` nests into runtime parallel-for calls.
pub struct LowerParallelToCfg;

impl Pass for LowerParallelToCfg {
    fn name(&self) -> &'static str {
        "lower-parallel-to-cfg"
    }

    fn run(&self, m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()> {
        while let Some(op) = next_outermost_parallel(m) {
            let name = outline(m, op);
            session.record_function_outlined(&name);
        }
        Ok(())
    }
}

fn next_outermost_parallel(m: &Module) -> Option<OpId> {
    m.walk().into_iter().find(|op| {
        m.tag(*op) == OpTag::Parallel && m.parent_of_tag(*op, OpTag::Parallel).is_none()
    })
}

/// Values used inside `op` but defined outside it, in first-use order.
pub(crate) fn captured_values(m: &Module, op: OpId) -> Vec<ValueId> {
    let region = m.region(op, 0);
    let mut seen = HashSet::new();
    let mut captured = Vec::new();
    for inner in m.walk_op(op).into_iter().skip(1) {
        for v in m.operands(inner) {
            if !m.is_defined_in_region(*v, region) && seen.insert(*v) {
                captured.push(*v);
            }
        }
    }
    captured
}

fn range_array_type(num_dims: usize) -> Type {
    Type::Array(
        Box::new(Type::Struct(vec![Type::Index, Type::Index, Type::Index])),
        num_dims as u64,
    )
}

fn outline(m: &mut Module, op: OpId) -> String {
    let OpKind::Parallel { num_dims } = *m.kind(op) else {
        return String::new();
    };
    let parent_name = m
        .parent_func(op)
        .and_then(|f| func_name(m, f))
        .unwrap_or("parallel")
        .to_string();
    let name = unique_function_name(m, &format!("{}_outlined", parent_name));
    let bounds = m.operands(op).to_vec();
    let (constants, captured): (Vec<ValueId>, Vec<ValueId>) = captured_values(m, op)
        .into_iter()
        .partition(|v| m.defining_op_of(*v, OpTag::Constant).is_some());
    let capture_types: Vec<Type> = captured.iter().map(|v| m.value_type(*v).clone()).collect();
    let ctx_ty = Type::Struct(capture_types.clone());
    let ranges_ty = range_array_type(num_dims);

    // call site
    declare_function(
        m,
        PARALLEL_FOR,
        FunctionType::new(vec![Type::Ptr, Type::Index, Type::Ptr, Type::Ptr], vec![]),
    );
    {
        let mut b = Builder::before(m, op);
        let one = b.const_index(1);
        let ctx = if captured.is_empty() {
            b.null_ptr()
        } else {
            let ctx = b.l_alloca(ctx_ty.clone(), one);
            for (i, v) in captured.iter().enumerate() {
                let slot = b.struct_gep(ctx, ctx_ty.clone(), i as i32);
                b.l_store(*v, slot);
            }
            ctx
        };
        let ranges = b.l_alloca(ranges_ty.clone(), one);
        for d in 0..num_dims {
            for j in 0..3 {
                let slot = b.gep(
                    ranges,
                    ranges_ty.clone(),
                    vec![GepIndex::Const(0), GepIndex::Const(d as i32), GepIndex::Const(j)],
                    vec![],
                );
                b.l_store(bounds[j as usize * num_dims + d], slot);
            }
        }
        let count = b.const_index(num_dims as i64);
        let body_ptr = b.address_of(&name);
        b.call(PARALLEL_FOR, vec![ranges, count, body_ptr, ctx], vec![]);
    }

    // outlined body
    let module_body = m.body();
    let func = Builder::at_end(m, module_body).func(
        &name,
        FunctionType::new(vec![Type::Ptr, Type::Index, Type::Ptr], vec![]),
        Visibility::Private,
    );
    let entry = m.body_block(func, 0);
    let ranges_arg = m.block_arg(entry, 0);
    let ctx_arg = m.block_arg(entry, 2);
    let mut mapping: HashMap<ValueId, ValueId> = HashMap::new();
    // constants are rematerialized, not captured
    for c in constants {
        if let Some(def) = m.defining_op(c) {
            let cloned = m.clone_op(def, &mut mapping);
            m.append_op(entry, cloned);
        }
    }
    let mut b = Builder::at_end(m, entry);
    for (i, (v, ty)) in captured.iter().zip(&capture_types).enumerate() {
        let slot = b.struct_gep(ctx_arg, ctx_ty.clone(), i as i32);
        let loaded = b.l_load(slot, ty.clone());
        mapping.insert(*v, loaded);
    }
    let bound = |b: &mut Builder<'_>, d: usize, j: i32| {
        let slot = b.gep(
            ranges_arg,
            ranges_ty.clone(),
            vec![GepIndex::Const(0), GepIndex::Const(d as i32), GepIndex::Const(j)],
            vec![],
        );
        b.l_load(slot, Type::Index)
    };
    let mut loops = Vec::with_capacity(num_dims);
    for d in 0..num_dims {
        let lower = bound(&mut b, d, 0);
        let upper = bound(&mut b, d, 1);
        let step = bound(&mut b, d, 2);
        let for_op = b.for_(lower, upper, step, vec![]);
        loops.push(for_op);
        let body = b.module().body_block(for_op, 0);
        b.set_insert_point(InsertPoint::End(body));
    }
    drop(b);

    let par_body = m.body_block(op, 0);
    for d in 0..num_dims {
        let iv = m.block_arg(m.body_block(loops[d], 0), 0);
        mapping.insert(m.block_arg(par_body, d), iv);
    }
    let innermost = m.body_block(loops[num_dims - 1], 0);
    for inner in m.block_ops(par_body).to_vec() {
        if m.tag(inner) == OpTag::Yield {
            continue;
        }
        let cloned = m.clone_op(inner, &mut mapping);
        m.append_op(innermost, cloned);
    }
    for for_op in loops.iter().rev() {
        let body = m.body_block(*for_op, 0);
        Builder::at_end(m, body).yield_(vec![]);
    }
    Builder::at_end(m, entry).return_(vec![]);
    m.erase_op(op);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{build_func, TestContext};
    use crate::ir::ops::{BinOp, ConstValue};
    use crate::ir::types::Dim;
    use crate::ir::verify::verify_module;

    fn is_null_ptr(m: &Module, v: ValueId) -> bool {
        m.defining_op(v)
            .is_some_and(|op| matches!(m.kind(op), OpKind::Constant(ConstValue::Null)))
    }

    #[test]
    fn test_parallel_region_is_unwrapped() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("unwrap");
        let (_, entry) = build_func(&mut m, "f", vec![Type::Index], vec![Type::Index]);
        let x = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let region = b.env_region(EnvAttr::Parallel, vec![], vec![Type::Index]);
        let r = b.module().result(region, 0);
        let ret = b.return_(vec![r]);
        let body = m.body_block(region, 0);
        let mut bb = Builder::at_end(&mut m, body);
        let y = bb.binary(BinOp::AddI, x, x);
        bb.env_yield(vec![y]);

        RemoveParallelRegion.run(&mut m, &session).unwrap();
        assert_eq!(m.operand(ret, 0), y);
        assert!(m.walk().iter().all(|o| m.tag(*o) != OpTag::EnvRegion));
        verify_module(&m).unwrap();
    }

    #[test]
    fn test_parallel_loop_is_outlined() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("outline");
        let mem = Type::memref(Type::f64(), vec![Dim::Dynamic]);
        let (_, entry) = build_func(&mut m, "kernel", vec![mem, Type::f64()], vec![]);
        let out = m.block_arg(entry, 0);
        let value = m.block_arg(entry, 1);
        let mut b = Builder::at_end(&mut m, entry);
        let zero = b.const_index(0);
        let n = b.const_index(16);
        let one = b.const_index(1);
        let par = b.parallel(vec![zero], vec![n], vec![one]);
        b.return_(vec![]);
        let body = m.body_block(par, 0);
        let iv = m.block_arg(body, 0);
        let mut pb = Builder::at_end(&mut m, body);
        pb.store(value, out, vec![iv]);
        pb.yield_(vec![]);

        LowerParallelToCfg.run(&mut m, &session).unwrap();
        verify_module(&m).unwrap();

        let outlined = m.lookup_function("kernel_outlined").unwrap();
        assert!(m.lookup_function(PARALLEL_FOR).is_some());
        let call = m
            .walk()
            .into_iter()
            .find(|o| matches!(m.kind(*o), OpKind::Call { callee } if callee == PARALLEL_FOR))
            .unwrap();
        assert!(!is_null_ptr(&m, m.operand(call, 3)));
        assert_eq!(m.parent_func(call).and_then(|f| func_name(&m, f)), Some("kernel"));
        let fors = m
            .walk_op(outlined)
            .into_iter()
            .filter(|o| m.tag(*o) == OpTag::For)
            .count();
        assert_eq!(fors, 1);
        assert_eq!(session.stats().functions_outlined, 1);
        assert!(m.walk().iter().all(|o| m.tag(*o) != OpTag::Parallel));
    }

    #[test]
    fn test_constants_are_rematerialized() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("consts");
        let mem = Type::memref(Type::f64(), vec![Dim::Dynamic]);
        let (_, entry) = build_func(&mut m, "fill", vec![mem], vec![]);
        let out = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let zero = b.const_index(0);
        let n = b.const_index(8);
        let one = b.const_index(1);
        let value = b.const_float(2.5, Type::f64());
        let par = b.parallel(vec![zero], vec![n], vec![one]);
        b.return_(vec![]);
        let body = m.body_block(par, 0);
        let iv = m.block_arg(body, 0);
        let mut pb = Builder::at_end(&mut m, body);
        pb.store(value, out, vec![iv]);
        pb.yield_(vec![]);

        LowerParallelToCfg.run(&mut m, &session).unwrap();
        verify_module(&m).unwrap();

        let outlined = m.lookup_function("fill_outlined").unwrap();
        let float_consts = m
            .walk_op(outlined)
            .into_iter()
            .filter(|o| matches!(m.kind(*o), OpKind::Constant(ConstValue::Float(_))))
            .count();
        assert_eq!(float_consts, 1);
        // only the memref is spilled into the context
        let ctx_alloca = m
            .walk()
            .into_iter()
            .find(|o| matches!(m.kind(*o), OpKind::LAlloca { elem: Type::Struct(_) }))
            .unwrap();
        assert_eq!(
            m.kind(ctx_alloca),
            &OpKind::LAlloca {
                elem: Type::Struct(vec![Type::memref(Type::f64(), vec![Dim::Dynamic])])
            }
        );
    }

    #[test]
    fn test_outlined_names_are_unique() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("names");
        let (_, entry) = build_func(&mut m, "k", vec![], vec![]);
        let mut b = Builder::at_end(&mut m, entry);
        let zero = b.const_index(0);
        let n = b.const_index(4);
        let one = b.const_index(1);
        let p1 = b.parallel(vec![zero], vec![n], vec![one]);
        let p2 = b.parallel(vec![zero], vec![n], vec![one]);
        b.return_(vec![]);
        for p in [p1, p2] {
            let body = m.body_block(p, 0);
            Builder::at_end(&mut m, body).yield_(vec![]);
        }

        LowerParallelToCfg.run(&mut m, &session).unwrap();
        assert!(m.lookup_function("k_outlined").is_some());
        assert!(m.lookup_function("k_outlined_1").is_some());
    }
}
