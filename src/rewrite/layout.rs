// This module implements the layout family: rewrites that push `change_layout` ops away from
// the values they reinterpret so that consumers see the most specific layout available,
// and that remove them where a plain memref cast suffices. A change_layout whose relaxation
// is legal becomes a memref cast. Consumers that do not care about the static layout (dim,
// load, store, atomic rmw, copy, linalg ops, slice getitem) read the source directly. View-producing ops
// (subview, expand_shape, clone, 1-D reshape) are rebuilt on the source and followed by a
// change_layout back to their original result type. For control flow, the yielded
// change_layout is moved out of the region: if/for/while results and loop-carried block
// arguments are retyped in place to the source type and a change_layout back is inserted
// for the existing users, so result counts and positions never change. Environment region
// results follow the same scheme.

//! Layout reinterpretation propagation.

use super::registry::RuleSet;
use super::{retype_block_arg, retype_result, source_of};
use crate::ir::builder::{infer_subview_type, Builder};
use crate::ir::module::{Module, OpId, ValueId};
use crate::ir::ops::{OpKind, OpTag, SliceParams};
use crate::ir::types::{can_relax_layout, fully_dynamic_type, Dim, Layout, MemRefType, StridedLayout, Type};

pub fn register(set: &mut RuleSet) {
    set.add("change-layout-identity", OpTag::ChangeLayout, identity_to_cast)
        .add("change-layout-from-cast", OpTag::ChangeLayout, from_cast)
        .add("change-layout-dim", OpTag::Dim, |m, op| forward_operand(m, op, 0))
        .add("change-layout-load", OpTag::Load, |m, op| forward_operand(m, op, 0))
        .add("change-layout-store", OpTag::Store, |m, op| forward_operand(m, op, 1))
        .add("change-layout-atomic-rmw", OpTag::AtomicRmw, |m, op| forward_operand(m, op, 1))
        .add("change-layout-slice-getitem", OpTag::SliceGetItem, |m, op| forward_operand(m, op, 1))
        .add("change-layout-linalg-fill", OpTag::LinalgFill, |m, op| forward_operand(m, op, 1))
        .add("change-layout-linalg-generic", OpTag::LinalgGeneric, linalg_generic)
        .add("change-layout-copy", OpTag::Copy, copy)
        .add("change-layout-clone", OpTag::Clone, clone)
        .add("propagate-clone-type", OpTag::Clone, propagate_clone_type)
        .add("change-layout-cast", OpTag::MemrefCast, cast)
        .add("change-layout-subview", OpTag::Subview, subview)
        .add("change-layout-expand-shape", OpTag::ExpandShape, expand_shape)
        .add("change-layout-1d-reshape", OpTag::Reshape, reshape_1d)
        .add("change-layout-select", OpTag::Select, select)
        .add("change-layout-if", OpTag::Yield, if_yield)
        .add("change-layout-for", OpTag::Yield, for_yield)
        .add("change-layout-while-after", OpTag::Yield, while_after)
        .add("change-layout-while-before", OpTag::Condition, while_before)
        .add("change-layout-while-init", OpTag::While, while_init)
        .add("change-layout-env-region", OpTag::EnvYield, env_region);
}

fn cl_source(m: &Module, value: ValueId) -> Option<ValueId> {
    source_of(m, value, OpTag::ChangeLayout).map(|(_, src)| src)
}

fn ty(m: &Module, value: ValueId) -> Type {
    m.value_type(value).clone()
}

fn change_layout_back(b: &mut Builder<'_>, value: ValueId, old: Type) -> ValueId {
    b.change_layout(value, old)
}

fn identity_to_cast(m: &mut Module, op: OpId) -> bool {
    let src = m.operand(op, 0);
    let dst_ty = ty(m, m.result(op, 0));
    if !can_relax_layout(m.value_type(src), &dst_ty) {
        return false;
    }
    let cast = Builder::before(m, op).memref_cast(src, dst_ty);
    m.replace_op(op, &[cast]);
    true
}

/// `change_layout(memref.cast(x))` where `x` already fits the result.
fn from_cast(m: &mut Module, op: OpId) -> bool {
    let Some((_, src)) = source_of(m, m.operand(op, 0), OpTag::MemrefCast) else {
        return false;
    };
    let src_ty = ty(m, src);
    let dst_ty = ty(m, m.result(op, 0));
    if src_ty == dst_ty {
        m.replace_op(op, &[src]);
        return true;
    }
    if can_relax_layout(&src_ty, &dst_ty) {
        let cast = Builder::before(m, op).memref_cast(src, dst_ty);
        m.replace_op(op, &[cast]);
        return true;
    }
    false
}

/// Read memref operand `index` through a change_layout.
fn forward_operand(m: &mut Module, op: OpId, index: usize) -> bool {
    if index >= m.num_operands(op) {
        return false;
    }
    match cl_source(m, m.operand(op, index)) {
        Some(src) => {
            m.set_operand(op, index, src);
            true
        }
        None => false,
    }
}

fn linalg_generic(m: &mut Module, op: OpId) -> bool {
    let mut changed = false;
    for i in 0..m.num_operands(op) {
        changed |= forward_operand(m, op, i);
    }
    changed
}

fn copy(m: &mut Module, op: OpId) -> bool {
    let source = forward_operand(m, op, 0);
    let target = forward_operand(m, op, 1);
    source || target
}

/// `clone(change_layout(x))` -> `change_layout(clone(x))`.
fn clone(m: &mut Module, op: OpId) -> bool {
    let Some(src) = cl_source(m, m.operand(op, 0)) else {
        return false;
    };
    let dst_ty = ty(m, m.result(op, 0));
    let src_ty = ty(m, src);
    let mut b = Builder::before(m, op);
    let cloned = b.create(OpKind::Clone, vec![src], src_ty);
    let res = b.change_layout(cloned, dst_ty);
    m.replace_op(op, &[res]);
    true
}

/// A clone whose result type differs from its input clones at the input type.
fn propagate_clone_type(m: &mut Module, op: OpId) -> bool {
    let src = m.operand(op, 0);
    let src_ty = ty(m, src);
    let dst_ty = ty(m, m.result(op, 0));
    if src_ty == dst_ty {
        return false;
    }
    let mut b = Builder::before(m, op);
    let cloned = b.create(OpKind::Clone, vec![src], src_ty);
    let res = b.change_layout(cloned, dst_ty);
    m.replace_op(op, &[res]);
    true
}

/// `memref.cast(change_layout(x))`: merge into one cast when possible,
/// otherwise cast at the source layout and change the layout last.
fn cast(m: &mut Module, op: OpId) -> bool {
    let Some(src) = cl_source(m, m.operand(op, 0)) else {
        return false;
    };
    let src_ty = ty(m, src);
    let dst_ty = ty(m, m.result(op, 0));
    if src_ty == dst_ty {
        m.replace_op(op, &[src]);
        return true;
    }
    if can_relax_layout(&src_ty, &dst_ty) {
        let cast = Builder::before(m, op).memref_cast(src, dst_ty);
        m.replace_op(op, &[cast]);
        return true;
    }
    let (Some(src_m), Some(dst_m)) = (src_ty.as_memref(), dst_ty.as_memref()) else {
        return false;
    };
    let shaped = Type::MemRef(src_m.with_shape(dst_m.shape.clone()));
    let mut b = Builder::before(m, op);
    let reshaped = b.memref_cast_or_fold(src, shaped);
    let res = b.change_layout(reshaped, dst_ty);
    m.replace_op(op, &[res]);
    true
}

fn subview(m: &mut Module, op: OpId) -> bool {
    let Some(src) = cl_source(m, m.operand(op, 0)) else {
        return false;
    };
    let OpKind::Subview(params) = m.kind(op).clone() else {
        return false;
    };
    let dst_ty = ty(m, m.result(op, 0));
    let src_ty = ty(m, src);
    let same_rank = match (src_ty.as_memref(), dst_ty.as_memref()) {
        (Some(s), Some(d)) => s.rank() == d.rank(),
        _ => false,
    };
    if !same_rank {
        return false;
    }
    let Some(new_ty) = infer_subview_type(&src_ty, &params) else {
        return false;
    };
    let dynamic = m.operands(op)[1..].to_vec();
    let mut b = Builder::before(m, op);
    let mut res = b.subview_typed(src, params, dynamic, new_ty.clone());
    if new_ty != dst_ty {
        res = b.change_layout(res, dst_ty);
    }
    m.replace_op(op, &[res]);
    true
}

/// Strided type of expanding `src` into `shape` along `reassociation`.
fn expanded_type(src: &MemRefType, shape: &[Dim], reassociation: &[Vec<usize>]) -> Option<MemRefType> {
    if reassociation.len() != src.rank() {
        return None;
    }
    let layout = src.strides_and_offset();
    let mut strides = vec![Dim::Dynamic; shape.len()];
    for (group, src_stride) in reassociation.iter().zip(&layout.strides) {
        let mut running = *src_stride;
        for &d in group.iter().rev() {
            let size = *shape.get(d)?;
            strides[d] = running;
            running = match (running, size) {
                (Dim::Static(s), Dim::Static(n)) => Dim::Static(s * n),
                _ => Dim::Dynamic,
            };
        }
    }
    Some(MemRefType {
        elem: src.elem.clone(),
        shape: shape.to_vec(),
        layout: Layout::Strided(StridedLayout::new(layout.offset, strides)),
        memory_space: src.memory_space,
    })
}

fn expand_shape(m: &mut Module, op: OpId) -> bool {
    let Some(src) = cl_source(m, m.operand(op, 0)) else {
        return false;
    };
    let OpKind::ExpandShape { reassociation } = m.kind(op).clone() else {
        return false;
    };
    let dst_ty = ty(m, m.result(op, 0));
    let Some(dst) = dst_ty.as_memref() else {
        return false;
    };
    if dst.layout != Layout::Identity {
        return false;
    }
    let Some(src_m) = m.value_type(src).as_memref() else {
        return false;
    };
    let Some(new_ty) = expanded_type(src_m, &dst.shape, &reassociation) else {
        return false;
    };
    let mut b = Builder::before(m, op);
    let expanded = b.create(OpKind::ExpandShape { reassociation }, vec![src], Type::MemRef(new_ty));
    let res = b.change_layout(expanded, dst_ty);
    m.replace_op(op, &[res]);
    true
}

/// Index of the only dynamic extent when every other extent is 1.
fn single_dynamic_dim(ty: &MemRefType) -> Option<usize> {
    let mut found = None;
    for (i, d) in ty.shape.iter().enumerate() {
        match d {
            Dim::Dynamic if found.is_none() => found = Some(i),
            Dim::Dynamic => return None,
            Dim::Static(1) => {}
            Dim::Static(_) => return None,
        }
    }
    found
}

/// Reshape of a memref with a single non-unit extent into 1-D becomes a
/// subview (collapsed when the source is not 1-D) plus a change_layout.
fn reshape_1d(m: &mut Module, op: OpId) -> bool {
    let src = m.operand(op, 0);
    let Some(src_ty) = m.value_type(src).as_memref().cloned() else {
        return false;
    };
    let dst_ty = ty(m, m.result(op, 0));
    if dst_ty.as_memref().map(MemRefType::rank) != Some(1) || m.num_operands(op) != 2 {
        return false;
    }
    let Some(dyn_dim) = single_dynamic_dim(&src_ty) else {
        return false;
    };
    let extent = m.operand(op, 1);
    let rank = src_ty.rank();
    let mut sizes = vec![Dim::Static(1); rank];
    sizes[dyn_dim] = Dim::Dynamic;
    let params = SliceParams {
        offsets: vec![Dim::Static(0); rank],
        sizes,
        strides: vec![Dim::Static(1); rank],
    };
    let Some(view_ty) = infer_subview_type(&Type::MemRef(src_ty), &params) else {
        return false;
    };
    let Some(view_m) = view_ty.as_memref().cloned() else {
        return false;
    };

    let mut b = Builder::before(m, op);
    let mut view = b.subview_typed(src, params, vec![extent], view_ty);
    if rank != 1 {
        let layout = view_m.strides_and_offset();
        let collapsed = MemRefType {
            elem: view_m.elem.clone(),
            shape: vec![Dim::Dynamic],
            layout: Layout::Strided(StridedLayout::new(layout.offset, vec![layout.strides[dyn_dim]])),
            memory_space: view_m.memory_space,
        };
        view = b.create(
            OpKind::CollapseShape {
                reassociation: vec![(0..rank).collect()],
            },
            vec![view],
            Type::MemRef(collapsed),
        );
    }
    let res = b.change_layout(view, dst_ty);
    m.replace_op(op, &[res]);
    true
}

/// `select(c, change_layout(x), y)` selects at the layout of `x` (or the
/// fully dynamic one) and changes the layout of the result.
fn select(m: &mut Module, op: OpId) -> bool {
    let result_ty = ty(m, m.result(op, 0));
    if !result_ty.is_memref() {
        return false;
    }
    let cond = m.operand(op, 0);
    for reverse in [false, true] {
        let (arg_index, other_index) = if reverse { (2, 1) } else { (1, 2) };
        let arg = m.operand(op, arg_index);
        let Some(mut src) = cl_source(m, arg) else {
            continue;
        };
        let mut src_ty = ty(m, src);
        let other = m.operand(op, other_index);
        let other_ty = ty(m, other);

        let mut relax_src = false;
        if !can_relax_layout(&other_ty, &src_ty) {
            let Some(dynamic) = fully_dynamic_type(&src_ty) else {
                continue;
            };
            if !can_relax_layout(&other_ty, &dynamic) {
                continue;
            }
            src_ty = dynamic;
            relax_src = true;
        }

        let mut b = Builder::before(m, op);
        if relax_src {
            src = b.memref_cast_or_fold(src, src_ty.clone());
        }
        let other_cast = b.memref_cast_or_fold(other, src_ty);
        let (t, f) = if reverse { (other_cast, src) } else { (src, other_cast) };
        let selected = b.select(cond, t, f);
        let res = b.change_layout(selected, result_ty);
        m.replace_op(op, &[res]);
        return true;
    }
    false
}

fn if_yield(m: &mut Module, op: OpId) -> bool {
    if m.num_operands(op) == 0 {
        return false;
    }
    let Some(if_op) = m.parent_op(op).filter(|p| m.tag(*p) == OpTag::If) else {
        return false;
    };
    let (Some(then_yield), Some(else_yield)) = (
        m.terminator(m.body_block(if_op, 0)),
        m.terminator(m.body_block(if_op, 1)),
    ) else {
        return false;
    };

    let mut changed = false;
    for i in 0..m.num_results(if_op) {
        let orig_ty = ty(m, m.result(if_op, i));
        let mut new_ty = None;
        for reverse in [true, false] {
            let (cl_yield, other_yield) = if reverse {
                (else_yield, then_yield)
            } else {
                (then_yield, else_yield)
            };
            let arg = m.operand(cl_yield, i);
            if !m.value_type(arg).is_memref() {
                continue;
            }
            let Some(src) = cl_source(m, arg) else {
                continue;
            };
            let src_ty = ty(m, src);
            let other = m.operand(other_yield, i);

            if let Some(other_src) = cl_source(m, other) {
                if *m.value_type(other_src) == src_ty {
                    m.set_operand(cl_yield, i, src);
                    m.set_operand(other_yield, i, other_src);
                    new_ty = Some(src_ty);
                    break;
                }
            }

            let candidates = [Some(src_ty.clone()), fully_dynamic_type(&src_ty)];
            let Some(dst_ty) = candidates
                .into_iter()
                .flatten()
                .find(|t| can_relax_layout(&orig_ty, t))
            else {
                continue;
            };
            let yielded = Builder::before(m, cl_yield).memref_cast_or_fold(src, dst_ty.clone());
            m.set_operand(cl_yield, i, yielded);
            let other_res = Builder::before(m, other_yield).memref_cast_or_fold(other, dst_ty.clone());
            m.set_operand(other_yield, i, other_res);
            new_ty = Some(dst_ty);
            break;
        }

        if let Some(new_ty) = new_ty {
            if new_ty != orig_ty {
                retype_result(m, if_op, i, new_ty, change_layout_back);
            }
            changed = true;
        }
    }
    changed
}

fn for_yield(m: &mut Module, op: OpId) -> bool {
    let Some(for_op) = m.parent_op(op).filter(|p| m.tag(*p) == OpTag::For) else {
        return false;
    };
    let body = m.body_block(for_op, 0);
    let mut changed = false;
    for i in 0..m.num_operands(op) {
        let arg = m.operand(op, i);
        if !m.value_type(arg).is_memref() {
            continue;
        }
        let Some(src) = cl_source(m, arg) else {
            continue;
        };
        let src_ty = ty(m, src);
        if src_ty == *m.value_type(arg) {
            continue;
        }
        m.set_operand(op, i, src);

        let init = m.operand(for_op, 3 + i);
        let new_init = Builder::before(m, for_op).change_layout(init, src_ty.clone());
        m.set_operand(for_op, 3 + i, new_init);
        retype_block_arg(m, body, i + 1, src_ty.clone(), change_layout_back);
        retype_result(m, for_op, i, src_ty, change_layout_back);
        changed = true;
    }
    changed
}

/// Forwarded change_layout values of `scf.condition` leave the loop at the
/// source type.
fn while_before(m: &mut Module, op: OpId) -> bool {
    let Some(while_op) = m.parent_op(op).filter(|p| m.tag(*p) == OpTag::While) else {
        return false;
    };
    let after = m.body_block(while_op, 1);
    let mut changed = false;
    for i in 0..m.num_operands(op).saturating_sub(1) {
        let arg = m.operand(op, i + 1);
        if !m.value_type(arg).is_memref() {
            continue;
        }
        let Some(src) = cl_source(m, arg) else {
            continue;
        };
        let src_ty = ty(m, src);
        if src_ty == *m.value_type(arg) {
            continue;
        }
        m.set_operand(op, i + 1, src);
        retype_block_arg(m, after, i, src_ty.clone(), change_layout_back);
        retype_result(m, while_op, i, src_ty, change_layout_back);
        changed = true;
    }
    changed
}

/// Loop-carried change_layout values yielded by the after region, when the
/// carried type relaxes to the source type.
fn while_after(m: &mut Module, op: OpId) -> bool {
    let Some(while_op) = m.parent_op(op).filter(|p| m.tag(*p) == OpTag::While) else {
        return false;
    };
    if m.parent_block(op) != Some(m.body_block(while_op, 1)) {
        return false;
    }
    let before = m.body_block(while_op, 0);
    let mut changed = false;
    for i in 0..m.num_operands(op) {
        let arg = m.operand(op, i);
        let dst_ty = ty(m, arg);
        if !dst_ty.is_memref() {
            continue;
        }
        let Some(src) = cl_source(m, arg) else {
            continue;
        };
        let src_ty = ty(m, src);
        if src_ty == dst_ty || !can_relax_layout(&dst_ty, &src_ty) {
            continue;
        }
        m.set_operand(op, i, src);
        let init = m.operand(while_op, i);
        let new_init = Builder::before(m, while_op).memref_cast_or_fold(init, src_ty.clone());
        m.set_operand(while_op, i, new_init);
        retype_block_arg(m, before, i, src_ty, change_layout_back);
        changed = true;
    }
    changed
}

/// change_layout inits enter the loop at the source type.
fn while_init(m: &mut Module, op: OpId) -> bool {
    let before = m.body_block(op, 0);
    let after = m.body_block(op, 1);
    let Some(yield_op) = m.terminator(after) else {
        return false;
    };
    let mut changed = false;
    for i in 0..m.num_operands(op) {
        let init = m.operand(op, i);
        if !m.value_type(init).is_memref() {
            continue;
        }
        let Some(src) = cl_source(m, init) else {
            continue;
        };
        let src_ty = ty(m, src);
        if src_ty == *m.value_type(init) {
            continue;
        }
        m.set_operand(op, i, src);
        retype_block_arg(m, before, i, src_ty.clone(), change_layout_back);
        let yielded = m.operand(yield_op, i);
        let converted = Builder::before(m, yield_op).change_layout(yielded, src_ty);
        m.set_operand(yield_op, i, converted);
        changed = true;
    }
    changed
}

fn env_region(m: &mut Module, op: OpId) -> bool {
    let Some(region) = m.parent_op(op).filter(|p| m.tag(*p) == OpTag::EnvRegion) else {
        return false;
    };
    let mut changed = false;
    for i in 0..m.num_operands(op) {
        let Some(src) = cl_source(m, m.operand(op, i)) else {
            continue;
        };
        m.set_operand(op, i, src);
        let src_ty = ty(m, src);
        retype_result(m, region, i, src_ty, change_layout_back);
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{build_func, TestContext};
    use crate::ir::attrs::EnvAttr;
    use crate::ir::verify::verify_module;
    use crate::rewrite::{apply_rules_greedily, RuleSet};

    fn contiguous() -> Type {
        Type::MemRef(MemRefType::strided(
            Type::f64(),
            vec![Dim::Dynamic],
            StridedLayout::new(Dim::Static(0), vec![Dim::Static(1)]),
        ))
    }

    fn dynamic() -> Type {
        Type::MemRef(MemRefType::strided(
            Type::f64(),
            vec![Dim::Dynamic],
            StridedLayout::fully_dynamic(1),
        ))
    }

    fn count(m: &Module, tag: OpTag) -> usize {
        m.walk().into_iter().filter(|op| m.tag(*op) == tag).count()
    }

    fn canonicalize(m: &mut Module) {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        apply_rules_greedily(m, &RuleSet::canonical(), &session, 16).unwrap();
    }

    #[test]
    fn test_load_reads_through_change_layout() {
        let mut m = Module::new("load");
        let (_, entry) = build_func(&mut m, "f", vec![dynamic()], vec![Type::f64()]);
        let arg = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let cl = b.change_layout(arg, contiguous());
        let zero = b.const_index(0);
        let v = b.load(cl, vec![zero]);
        b.return_(vec![v]);

        let load = m.defining_op(v).unwrap();
        assert!(forward_operand(&mut m, load, 0));
        assert_eq!(m.operand(load, 0), arg);
        canonicalize(&mut m);
        assert_eq!(count(&m, OpTag::ChangeLayout), 0);
    }

    #[test]
    fn test_slice_getitem_reads_through_change_layout() {
        let mut m = Module::new("slice");
        let (_, entry) = build_func(
            &mut m,
            "f",
            vec![dynamic(), Type::Index, Type::Index, Type::Index],
            vec![Type::Index],
        );
        let arg = m.block_arg(entry, 0);
        let bounds: Vec<ValueId> = (1..4).map(|i| m.block_arg(entry, i)).collect();
        let mut b = Builder::at_end(&mut m, entry);
        let slice = b.build_tuple(bounds);
        let cl = b.change_layout(arg, contiguous());
        let count_index = b.const_index(3);
        let n = b.slice_getitem(slice, cl, count_index, 0);
        b.return_(vec![n]);

        canonicalize(&mut m);
        let getitem = m.defining_op(n).unwrap();
        assert_eq!(m.kind(getitem), &OpKind::SliceGetItem { dim: 0 });
        assert_eq!(m.operand(getitem, 1), arg);
        assert_eq!(count(&m, OpTag::ChangeLayout), 0);
        verify_module(&m).unwrap();
    }

    #[test]
    fn test_relaxable_change_layout_becomes_cast() {
        let mut m = Module::new("relax");
        let (_, entry) = build_func(&mut m, "f", vec![contiguous()], vec![dynamic()]);
        let arg = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let cl = b.change_layout(arg, dynamic());
        let ret = b.return_(vec![cl]);

        let root = m.defining_op(cl).unwrap();

        assert!(identity_to_cast(&mut m, root));
        let cast = m.defining_op(m.operand(ret, 0)).unwrap();
        assert_eq!(m.tag(cast), OpTag::MemrefCast);

        let mut m2 = Module::new("tighten");
        let (_, entry) = build_func(&mut m2, "f", vec![dynamic()], vec![contiguous()]);
        let arg = m2.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m2, entry);
        let cl = b.change_layout(arg, contiguous());
        b.return_(vec![cl]);
        let root = m2.defining_op(cl).unwrap();
        assert!(!identity_to_cast(&mut m2, root));
    }

    #[test]
    fn test_if_with_change_layout_in_both_branches() {
        let mut m = Module::new("if");
        let (_, entry) = build_func(&mut m, "f", vec![Type::i1(), dynamic(), dynamic()], vec![contiguous()]);
        let cond = m.block_arg(entry, 0);
        let x = m.block_arg(entry, 1);
        let y = m.block_arg(entry, 2);
        let mut b = Builder::at_end(&mut m, entry);
        let if_op = b.if_(cond, vec![contiguous()]);
        let res = b.module().result(if_op, 0);
        let ret = b.return_(vec![res]);

        let then_block = m.body_block(if_op, 0);
        let else_block = m.body_block(if_op, 1);
        let mut tb = Builder::at_end(&mut m, then_block);
        let cx = tb.change_layout(x, contiguous());
        let then_yield = tb.yield_(vec![cx]);
        let mut eb = Builder::at_end(&mut m, else_block);
        let cy = eb.change_layout(y, contiguous());
        let else_yield = eb.yield_(vec![cy]);

        assert!(if_yield(&mut m, then_yield));
        assert_eq!(m.operand(then_yield, 0), x);
        assert_eq!(m.operand(else_yield, 0), y);
        assert_eq!(*m.value_type(res), dynamic());
        let back = m.defining_op(m.operand(ret, 0)).unwrap();
        assert_eq!(m.tag(back), OpTag::ChangeLayout);
        assert_eq!(m.operand(back, 0), res);
        verify_module(&m).unwrap();
    }

    #[test]
    fn test_for_loop_carried_change_layout_is_hoisted() {
        let mut m = Module::new("for");
        let (_, entry) = build_func(&mut m, "f", vec![contiguous(), dynamic()], vec![contiguous()]);
        let init = m.block_arg(entry, 0);
        let other = m.block_arg(entry, 1);
        let mut b = Builder::at_end(&mut m, entry);
        let lb = b.const_index(0);
        let ub = b.const_index(4);
        let step = b.const_index(1);
        let for_op = b.for_(lb, ub, step, vec![init]);
        let res = b.module().result(for_op, 0);
        let ret = b.return_(vec![res]);

        let body = m.body_block(for_op, 0);
        let mut bb = Builder::at_end(&mut m, body);
        let cl = bb.change_layout(other, contiguous());
        let y = bb.yield_(vec![cl]);

        assert!(for_yield(&mut m, y));
        assert_eq!(m.operand(y, 0), other);
        assert_eq!(*m.value_type(m.block_arg(body, 1)), dynamic());
        assert_eq!(*m.value_type(res), dynamic());
        assert_eq!(m.tag(m.defining_op(m.operand(ret, 0)).unwrap()), OpTag::ChangeLayout);
        verify_module(&m).unwrap();
        assert!(!for_yield(&mut m, y));
    }

    #[test]
    fn test_select_relaxes_other_operand() {
        let mut m = Module::new("select");
        let (_, entry) = build_func(&mut m, "f", vec![Type::i1(), dynamic(), contiguous()], vec![contiguous()]);
        let c = m.block_arg(entry, 0);
        let x = m.block_arg(entry, 1);
        let y = m.block_arg(entry, 2);
        let mut b = Builder::at_end(&mut m, entry);
        let cl = b.change_layout(x, contiguous());
        let s = b.select(c, cl, y);
        let ret = b.return_(vec![s]);

        let root = m.defining_op(s).unwrap();

        assert!(select(&mut m, root));
        let back = m.defining_op(m.operand(ret, 0)).unwrap();
        assert_eq!(m.tag(back), OpTag::ChangeLayout);
        let new_select = m.defining_op(m.operand(back, 0)).unwrap();
        assert_eq!(m.operand(new_select, 1), x);
        assert_eq!(*m.value_type(m.result(new_select, 0)), dynamic());
    }

    #[test]
    fn test_env_region_result_is_retyped() {
        let mut m = Module::new("env");
        let (_, entry) = build_func(&mut m, "f", vec![dynamic()], vec![contiguous()]);
        let x = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let region = b.env_region(EnvAttr::Parallel, vec![], vec![contiguous()]);
        let res = b.module().result(region, 0);
        let ret = b.return_(vec![res]);
        let inner = m.body_block(region, 0);
        let mut ib = Builder::at_end(&mut m, inner);
        let cl = ib.change_layout(x, contiguous());
        let y = ib.env_yield(vec![cl]);

        assert!(env_region(&mut m, y));
        assert_eq!(m.operand(y, 0), x);
        assert_eq!(*m.value_type(res), dynamic());
        assert_eq!(m.tag(m.defining_op(m.operand(ret, 0)).unwrap()), OpTag::ChangeLayout);
    }

    #[test]
    fn test_reshape_to_1d_becomes_subview() {
        let mut m = Module::new("reshape");
        let src_ty = Type::memref(Type::f32(), vec![Dim::Static(1), Dim::Dynamic]);
        let dst_ty = Type::memref(Type::f32(), vec![Dim::Dynamic]);
        let (_, entry) = build_func(&mut m, "f", vec![src_ty, Type::Index], vec![dst_ty.clone()]);
        let src = m.block_arg(entry, 0);
        let n = m.block_arg(entry, 1);
        let mut b = Builder::at_end(&mut m, entry);
        let r = b.create(OpKind::Reshape, vec![src, n], dst_ty.clone());
        let ret = b.return_(vec![r]);

        let root = m.defining_op(r).unwrap();

        assert!(reshape_1d(&mut m, root));
        let cl = m.defining_op(m.operand(ret, 0)).unwrap();
        assert_eq!(m.tag(cl), OpTag::ChangeLayout);
        let collapse = m.defining_op(m.operand(cl, 0)).unwrap();
        assert_eq!(m.tag(collapse), OpTag::CollapseShape);
        let view = m.defining_op(m.operand(collapse, 0)).unwrap();
        assert_eq!(m.tag(view), OpTag::Subview);
        assert_eq!(m.operand(view, 1), n);
    }

    #[test]
    fn test_expanded_type_strides() {
        let src = MemRefType::new(Type::f32(), vec![Dim::Static(12)]);
        let ty = expanded_type(&src, &[Dim::Static(3), Dim::Static(4)], &[vec![0, 1]]).unwrap();
        assert_eq!(
            ty.strides_and_offset(),
            StridedLayout::new(Dim::Static(0), vec![Dim::Static(4), Dim::Static(1)])
        );
    }
}
