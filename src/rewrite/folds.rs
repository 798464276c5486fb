// This module holds the folds: rules that replace an op by a value that already exists or by a
// constant, plus the few simplifications that only shorten a chain of reinterpretations.
// Layout and sign casts fold to an earlier value of the same type found along their source
// chain. Tuple extraction with a constant index reads through tuple construction; bit casts,
// memref casts and tensor casts between identical types vanish; alloc token queries look
// through views and casts to the underlying allocation. A dim of an enforce_shape with a
// constant index reads the asserted extent. Integer arithmetic and comparisons
// with constant operands are evaluated, selects and ifs with constant conditions pick
// their branch. Reshape simplification turns 1-D tensor reshapes into slices and
// unit-dimension reshapes into shape expansion.

//! Value-forwarding folds and constant evaluation.

use super::registry::RuleSet;
use super::{const_int, inline_into_parent, source_of};
use crate::ir::builder::Builder;
use crate::ir::module::{Module, OpId, ValueId};
use crate::ir::ops::{BinOp, IntPredicate, OpKind, OpTag, SliceParams};
use crate::ir::types::{Dim, TensorType, Type};

pub fn register(set: &mut RuleSet) {
    set.add("change-layout-fold", OpTag::ChangeLayout, fold_change_layout)
        .add("sign-cast-fold", OpTag::SignCast, fold_sign_cast)
        .add("tuple-extract-fold", OpTag::TupleExtract, fold_tuple_extract)
        .add("bitcast-fold", OpTag::Bitcast, fold_bitcast)
        .add("memref-bitcast-fold", OpTag::MemrefBitcast, fold_same_type)
        .add("memref-cast-fold", OpTag::MemrefCast, fold_same_type)
        .add("tensor-cast-fold", OpTag::TensorCast, fold_same_type)
        .add("alloc-token-casts", OpTag::GetAllocToken, propagate_alloc_token_casts)
        .add("enforce-shape-dim", OpTag::Dim, fold_enforce_shape_dim)
        .add("reshape-same-type", OpTag::Reshape, fold_reshape_same_type)
        .add("reshape-of-reshape", OpTag::Reshape, fold_reshape_of_reshape)
        .add("reshape-simplify", OpTag::Reshape, simplify_tensor_reshape)
        .add("binary-const-fold", OpTag::Binary, fold_binary)
        .add("cmpi-const-fold", OpTag::CmpI, fold_cmpi)
        .add("select-const-cond", OpTag::Select, fold_select)
        .add("if-const-cond", OpTag::If, fold_if);
}

fn result_type(m: &Module, op: OpId) -> Type {
    m.value_type(m.result(op, 0)).clone()
}

/// Walk the `tag` chain starting at the operand of `op` and return the first
/// value whose type is the result type of `op`.
fn find_in_chain(m: &Module, op: OpId, tag: OpTag) -> Option<ValueId> {
    let ty = result_type(m, op);
    let mut src = m.operand(op, 0);
    loop {
        if *m.value_type(src) == ty {
            return Some(src);
        }
        src = source_of(m, src, tag)?.1;
    }
}

pub(crate) fn fold_change_layout(m: &mut Module, op: OpId) -> bool {
    match find_in_chain(m, op, OpTag::ChangeLayout) {
        Some(v) => {
            m.replace_op(op, &[v]);
            true
        }
        None => false,
    }
}

fn fold_sign_cast(m: &mut Module, op: OpId) -> bool {
    match find_in_chain(m, op, OpTag::SignCast) {
        Some(v) => {
            m.replace_op(op, &[v]);
            true
        }
        None => false,
    }
}

fn fold_tuple_extract(m: &mut Module, op: OpId) -> bool {
    let Some(index) = const_int(m, m.operand(op, 1)) else {
        return false;
    };
    let Some(tuple) = m.defining_op_of(m.operand(op, 0), OpTag::BuildTuple) else {
        return false;
    };
    let Some(arg) = usize::try_from(index)
        .ok()
        .and_then(|i| m.operands(tuple).get(i).copied())
    else {
        return false;
    };
    if *m.value_type(arg) != result_type(m, op) {
        return false;
    }
    m.replace_op(op, &[arg]);
    true
}

fn fold_enforce_shape_dim(m: &mut Module, op: OpId) -> bool {
    let Some(enforce) = m.defining_op_of(m.operand(op, 0), OpTag::EnforceShape) else {
        return false;
    };
    let Some(index) = const_int(m, m.operand(op, 1)) else {
        return false;
    };
    let Some(size) = usize::try_from(index)
        .ok()
        .and_then(|i| m.operands(enforce)[1..].get(i).copied())
    else {
        return false;
    };
    m.replace_op(op, &[size]);
    true
}

fn fold_same_type(m: &mut Module, op: OpId) -> bool {
    let src = m.operand(op, 0);
    if *m.value_type(src) != result_type(m, op) {
        return false;
    }
    m.replace_op(op, &[src]);
    true
}

fn fold_bitcast(m: &mut Module, op: OpId) -> bool {
    if fold_same_type(m, op) {
        return true;
    }
    match source_of(m, m.operand(op, 0), OpTag::Bitcast) {
        Some((_, inner)) => {
            m.set_operand(op, 0, inner);
            fold_same_type(m, op);
            true
        }
        None => false,
    }
}

fn propagate_alloc_token_casts(m: &mut Module, op: OpId) -> bool {
    let src = m.operand(op, 0);
    let mut current = src;
    while let Some(def) = m.defining_op(current) {
        match m.tag(def) {
            OpTag::MemrefCast
            | OpTag::ReinterpretCast
            | OpTag::Subview
            | OpTag::ChangeLayout
            | OpTag::SignCast => current = m.operand(def, 0),
            _ => break,
        }
    }
    if current == src {
        return false;
    }
    m.set_operand(op, 0, current);
    true
}

fn fold_reshape_same_type(m: &mut Module, op: OpId) -> bool {
    let src = m.operand(op, 0);
    let ty = result_type(m, op);
    let is_static = ty
        .shape()
        .is_some_and(|s| s.iter().all(|d| !d.is_dynamic()));
    if !is_static || *m.value_type(src) != ty {
        return false;
    }
    m.replace_op(op, &[src]);
    true
}

fn fold_reshape_of_reshape(m: &mut Module, op: OpId) -> bool {
    match source_of(m, m.operand(op, 0), OpTag::Reshape) {
        Some((_, inner)) => {
            m.set_operand(op, 0, inner);
            true
        }
        None => false,
    }
}

fn tensor_type(elem: &Type, shape: Vec<Dim>) -> Type {
    Type::Tensor(TensorType {
        elem: Box::new(elem.clone()),
        shape,
    })
}

/// Tensor reshapes that are a slice (1-D to 1-D) or only add unit dimensions.
fn simplify_tensor_reshape(m: &mut Module, op: OpId) -> bool {
    let src = m.operand(op, 0);
    let Some(src_ty) = m.value_type(src).as_tensor().cloned() else {
        return false;
    };
    if src_ty.shape.len() != 1 {
        return false;
    }
    let dst_ty = result_type(m, op);
    let Some(dst) = dst_ty.as_tensor().cloned() else {
        return false;
    };
    let extents: Vec<ValueId> = m.operands(op)[1..].to_vec();
    if extents.len() != dst.shape.len() {
        return false;
    }

    if dst.shape.len() == 1 {
        let params = SliceParams {
            offsets: vec![Dim::Static(0)],
            sizes: vec![Dim::Dynamic],
            strides: vec![Dim::Static(1)],
        };
        let mut b = Builder::before(m, op);
        let slice_ty = tensor_type(&src_ty.elem, vec![Dim::Dynamic]);
        let mut res = b.create(OpKind::ExtractSlice(params), vec![src, extents[0]], slice_ty.clone());
        if slice_ty != dst_ty {
            res = b.create(OpKind::TensorCast, vec![res], dst_ty);
        }
        m.replace_op(op, &[res]);
        return true;
    }

    let is_unit: Vec<bool> = extents.iter().map(|e| const_int(m, *e) == Some(1)).collect();
    let unit_count = is_unit.iter().filter(|u| **u).count();
    if dst.shape.len() != 1 + unit_count {
        return false;
    }

    let mut reassociation: Vec<Vec<usize>> = vec![Vec::new()];
    let mut expand_shape = Vec::with_capacity(dst.shape.len());
    let mut current: isize = -1;
    for (i, unit) in is_unit.iter().enumerate() {
        if *unit {
            expand_shape.push(Dim::Static(1));
        } else {
            current += 1;
            expand_shape.push(Dim::Dynamic);
        }
        reassociation[current.max(0) as usize].push(i);
    }

    let mut b = Builder::before(m, op);
    let dyn_src_ty = tensor_type(&src_ty.elem, vec![Dim::Dynamic]);
    let mut input = src;
    if dyn_src_ty != Type::Tensor(src_ty.clone()) {
        input = b.create(OpKind::TensorCast, vec![src], dyn_src_ty);
    }
    let expand_ty = tensor_type(&dst.elem, expand_shape);
    let mut res = b.create(OpKind::ExpandShape { reassociation }, vec![input], expand_ty.clone());
    if expand_ty != dst_ty {
        res = b.create(OpKind::TensorCast, vec![res], dst_ty);
    }
    m.replace_op(op, &[res]);
    true
}

/// Sign-extend the low `width` bits of `value`.
fn wrap_to_width(value: i64, width: u32) -> i64 {
    if width == 0 || width >= 64 {
        return value;
    }
    let shift = 64 - width;
    (value << shift) >> shift
}

fn evaluate(op: BinOp, a: i64, b: i64, width: u32) -> Option<i64> {
    let ua = (a as u64) & mask(width);
    let ub = (b as u64) & mask(width);
    let value = match op {
        BinOp::AddI => a.wrapping_add(b),
        BinOp::SubI => a.wrapping_sub(b),
        BinOp::MulI => a.wrapping_mul(b),
        BinOp::DivSI => a.checked_div(b)?,
        BinOp::RemSI => a.checked_rem(b)?,
        BinOp::DivUI => ua.checked_div(ub)? as i64,
        BinOp::RemUI => ua.checked_rem(ub)? as i64,
        BinOp::AndI => a & b,
        BinOp::OrI => a | b,
        BinOp::XorI => a ^ b,
        BinOp::ShlI => a.checked_shl(u32::try_from(b).ok().filter(|s| *s < width)?)?,
        BinOp::ShrSI => a.checked_shr(u32::try_from(b).ok().filter(|s| *s < width)?)?,
        BinOp::ShrUI => (ua >> u32::try_from(b).ok().filter(|s| *s < width)?) as i64,
        BinOp::MaxSI => a.max(b),
        BinOp::MinSI => a.min(b),
        _ => return None,
    };
    Some(wrap_to_width(value, width))
}

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn fold_binary(m: &mut Module, op: OpId) -> bool {
    let OpKind::Binary(bin) = *m.kind(op) else {
        return false;
    };
    if bin.is_float() {
        return false;
    }
    let (Some(a), Some(b)) = (const_int(m, m.operand(op, 0)), const_int(m, m.operand(op, 1))) else {
        return false;
    };
    let ty = result_type(m, op);
    let Some(width) = ty.bit_width().filter(|_| ty.is_int_or_index()) else {
        return false;
    };
    let Some(value) = evaluate(bin, a, b, width) else {
        return false;
    };
    let c = Builder::before(m, op).const_int(value, ty);
    m.replace_op(op, &[c]);
    true
}

fn fold_cmpi(m: &mut Module, op: OpId) -> bool {
    let OpKind::CmpI(pred) = *m.kind(op) else {
        return false;
    };
    let (Some(a), Some(b)) = (const_int(m, m.operand(op, 0)), const_int(m, m.operand(op, 1))) else {
        return false;
    };
    let width = m.value_type(m.operand(op, 0)).bit_width().unwrap_or(64);
    let (a, b) = match pred {
        IntPredicate::Ult | IntPredicate::Ule | IntPredicate::Ugt | IntPredicate::Uge => {
            ((a as u64 & mask(width)) as i64, (b as u64 & mask(width)) as i64)
        }
        _ => (a, b),
    };
    let value = i64::from(pred.evaluate(a, b));
    let c = Builder::before(m, op).const_int(value, Type::i1());
    m.replace_op(op, &[c]);
    true
}

fn fold_select(m: &mut Module, op: OpId) -> bool {
    let Some(cond) = const_int(m, m.operand(op, 0)) else {
        return false;
    };
    let picked = if cond != 0 { m.operand(op, 1) } else { m.operand(op, 2) };
    m.replace_op(op, &[picked]);
    true
}

fn fold_if(m: &mut Module, op: OpId) -> bool {
    let Some(cond) = const_int(m, m.operand(op, 0)) else {
        return false;
    };
    let region = if cond != 0 { 0 } else { 1 };
    if m.region_blocks(m.region(op, region)).len() != 1 {
        return false;
    }
    inline_into_parent(m, op, region);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::build_func;
    use crate::ir::types::{Layout, MemRefType, StridedLayout};

    fn strided_1d(offset: Dim, stride: Dim) -> Type {
        Type::MemRef(MemRefType::strided(
            Type::f64(),
            vec![Dim::Dynamic],
            StridedLayout::new(offset, vec![stride]),
        ))
    }

    #[test]
    fn test_change_layout_identity_fold_leaves_no_op() {
        let mut m = Module::new("fold");
        let ty = Type::memref(Type::f64(), vec![Dim::Dynamic]);
        let (_, entry) = build_func(&mut m, "f", vec![ty.clone()], vec![ty.clone()]);
        let arg = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let cl = b.change_layout(arg, ty);
        let ret = b.return_(vec![cl]);

        let op = m.defining_op(cl).unwrap();
        assert!(fold_change_layout(&mut m, op));
        assert_eq!(m.operand(ret, 0), arg);
        assert!(!m.is_alive(op));
        assert_eq!(m.block_ops(entry).len(), 1);
    }

    #[test]
    fn test_change_layout_chain_fold() {
        let mut m = Module::new("chain");
        let ty = strided_1d(Dim::Static(0), Dim::Static(1));
        let other = strided_1d(Dim::Dynamic, Dim::Dynamic);
        let (_, entry) = build_func(&mut m, "f", vec![ty.clone()], vec![ty.clone()]);
        let arg = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let a = b.change_layout(arg, other);
        let back = b.change_layout(a, ty);
        let ret = b.return_(vec![back]);

        let op = m.defining_op(back).unwrap();
        assert!(fold_change_layout(&mut m, op));
        assert_eq!(m.operand(ret, 0), arg);

        let unrelated = m.defining_op(a).unwrap();
        assert!(!fold_change_layout(&mut m, unrelated));
    }

    #[test]
    fn test_tuple_extract_of_build_tuple() {
        let mut m = Module::new("tuple");
        let (_, entry) = build_func(&mut m, "f", vec![Type::i64(), Type::f64()], vec![Type::f64()]);
        let x = m.block_arg(entry, 0);
        let y = m.block_arg(entry, 1);
        let mut b = Builder::at_end(&mut m, entry);
        let t = b.build_tuple(vec![x, y]);
        let idx = b.const_index(1);
        let e = b.tuple_extract(t, idx, Type::f64());
        let bad_idx = b.const_index(0);
        let wrong = b.tuple_extract(t, bad_idx, Type::f64());
        b.return_(vec![e]);

        let root = m.defining_op(e).unwrap();

        assert!(fold_tuple_extract(&mut m, root));
        let root = m.defining_op(wrong).unwrap();
        assert!(!fold_tuple_extract(&mut m, root));
    }

    #[test]
    fn test_dim_of_enforce_shape_reads_size() {
        let mut m = Module::new("enforce");
        let mem = Type::memref(Type::f32(), vec![Dim::Dynamic, Dim::Dynamic]);
        let (_, entry) = build_func(&mut m, "f", vec![mem, Type::Index, Type::Index], vec![Type::Index]);
        let x = m.block_arg(entry, 0);
        let rows = m.block_arg(entry, 1);
        let cols = m.block_arg(entry, 2);
        let mut b = Builder::at_end(&mut m, entry);
        let shaped = b.enforce_shape(x, vec![rows, cols]);
        let one = b.const_index(1);
        let d1 = b.dim(shaped, one);
        let two = b.const_index(2);
        let out_of_range = b.dim(shaped, two);
        let ret = b.return_(vec![d1]);

        let root = m.defining_op(d1).unwrap();
        assert!(fold_enforce_shape_dim(&mut m, root));
        assert_eq!(m.operand(ret, 0), cols);
        let root = m.defining_op(out_of_range).unwrap();
        assert!(!fold_enforce_shape_dim(&mut m, root));
        let direct = Builder::before(&mut m, ret).dim(x, one);
        let root = m.defining_op(direct).unwrap();
        assert!(!fold_enforce_shape_dim(&mut m, root));
    }

    #[test]
    fn test_integer_constant_folding() {
        let mut m = Module::new("consts");
        let (_, entry) = build_func(&mut m, "f", vec![], vec![Type::i32()]);
        let mut b = Builder::at_end(&mut m, entry);
        let a = b.const_int(i64::from(i32::MAX), Type::i32());
        let one = b.const_int(1, Type::i32());
        let sum = b.binary(BinOp::AddI, a, one);
        let zero = b.const_int(0, Type::i32());
        let div = b.binary(BinOp::DivSI, a, zero);
        let ret = b.return_(vec![sum]);

        let root = m.defining_op(sum).unwrap();

        assert!(fold_binary(&mut m, root));
        assert_eq!(const_int(&m, m.operand(ret, 0)), Some(i64::from(i32::MIN)));
        let root = m.defining_op(div).unwrap();
        assert!(!fold_binary(&mut m, root));
    }

    #[test]
    fn test_unsigned_compare_uses_width() {
        let mut m = Module::new("cmp");
        let (_, entry) = build_func(&mut m, "f", vec![], vec![Type::i1()]);
        let mut b = Builder::at_end(&mut m, entry);
        let minus_one = b.const_int(-1, Type::i8());
        let one = b.const_int(1, Type::i8());
        let c = b.cmpi(IntPredicate::Ugt, minus_one, one);
        let ret = b.return_(vec![c]);

        let root = m.defining_op(c).unwrap();

        assert!(fold_cmpi(&mut m, root));
        assert_eq!(const_int(&m, m.operand(ret, 0)), Some(1));
    }

    #[test]
    fn test_if_with_constant_condition_inlines_branch() {
        let mut m = Module::new("if");
        let (_, entry) = build_func(&mut m, "f", vec![], vec![Type::Index]);
        let mut b = Builder::at_end(&mut m, entry);
        let cond = b.const_int(0, Type::i1());
        let if_op = b.if_(cond, vec![Type::Index]);
        let if_result = b.module().result(if_op, 0);
        let ret = b.return_(vec![if_result]);

        let then_block = m.body_block(if_op, 0);
        let else_block = m.body_block(if_op, 1);
        let mut tb = Builder::at_end(&mut m, then_block);
        let t = tb.const_index(1);
        tb.yield_(vec![t]);
        let mut eb = Builder::at_end(&mut m, else_block);
        let e = eb.const_index(2);
        eb.yield_(vec![e]);

        assert!(fold_if(&mut m, if_op));
        assert!(!m.is_alive(if_op));
        assert_eq!(m.operand(ret, 0), e);
        assert_eq!(m.parent_block(m.defining_op(e).unwrap()), Some(entry));
    }

    #[test]
    fn test_alloc_token_looks_through_views() {
        let mut m = Module::new("token");
        let ty = Type::memref(Type::f32(), vec![Dim::Static(16)]);
        let (_, entry) = build_func(&mut m, "f", vec![], vec![Type::Index]);
        let mut b = Builder::at_end(&mut m, entry);
        let alloc = b.alloc(ty, vec![]);
        let relaxed = b.memref_cast(
            alloc,
            Type::MemRef(MemRefType::new(Type::f32(), vec![Dim::Static(16)]).with_layout(Layout::Strided(
                StridedLayout::fully_dynamic(1),
            ))),
        );
        let token = b.get_alloc_token(relaxed);
        b.return_(vec![token]);

        let op = m.defining_op(token).unwrap();
        assert!(propagate_alloc_token_casts(&mut m, op));
        assert_eq!(m.operand(op, 0), alloc);
        assert!(!propagate_alloc_token_casts(&mut m, op));
    }

    #[test]
    fn test_tensor_reshape_adding_unit_dims_becomes_expand() {
        let mut m = Module::new("reshape");
        let src_ty = tensor_type(&Type::f32(), vec![Dim::Static(8)]);
        let dst_ty = tensor_type(&Type::f32(), vec![Dim::Dynamic, Dim::Dynamic, Dim::Dynamic]);
        let (_, entry) = build_func(&mut m, "f", vec![src_ty], vec![dst_ty.clone()]);
        let src = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let one = b.const_index(1);
        let eight = b.const_index(8);
        let reshape = b.create(OpKind::Reshape, vec![src, one, eight, one], dst_ty.clone());
        let ret = b.return_(vec![reshape]);

        let root = m.defining_op(reshape).unwrap();

        assert!(simplify_tensor_reshape(&mut m, root));
        let cast = m.defining_op_of(m.operand(ret, 0), OpTag::TensorCast).unwrap();
        let expand = m.defining_op(m.operand(cast, 0)).unwrap();
        match m.kind(expand) {
            OpKind::ExpandShape { reassociation } => {
                assert_eq!(reassociation, &vec![vec![0, 1, 2]]);
            }
            other => panic!("expected expand_shape, got {:?}", other),
        }
        assert_eq!(
            m.value_type(m.result(expand, 0)).shape().unwrap(),
            &[Dim::Static(1), Dim::Dynamic, Dim::Static(1)]
        );
    }
}
