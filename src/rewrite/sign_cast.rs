// This module implements the sign cast family. A `sign_cast` reinterprets integer signedness
// (or the element signedness of a shaped value) without touching the bits. The rules move
// these casts off memory and shape operations so arithmetic-free consumers work on the
// signless source: dims, loads, stores, atomic updates, views and extracts read through the
// cast (re-casting a scalar result where the element type differs), allocations and
// element lists are created at the target element type directly, casts and views are
// rebuilt on the source element type with the sign cast moved last, and loop-carried sign
// casts leave `scf.for` by retyping the iteration argument in place.

//! Signedness reinterpretation propagation.

use super::registry::RuleSet;
use super::{retype_block_arg, retype_result, source_of};
use crate::ir::builder::Builder;
use crate::ir::module::{Module, OpId, ValueId};
use crate::ir::ops::{OpKind, OpTag};
use crate::ir::types::{memrefs_cast_compatible, Dim, MemRefType, Type};

pub fn register(set: &mut RuleSet) {
    set.add("sign-cast-chain", OpTag::SignCast, chain)
        .add("sign-cast-poison", OpTag::SignCast, poison)
        .add("sign-cast-alloc", OpTag::SignCast, alloc)
        .add("sign-cast-from-elements", OpTag::SignCast, from_elements)
        .add("sign-cast-collapse-shape", OpTag::SignCast, collapse_shape)
        .add("sign-cast-dim", OpTag::Dim, dim)
        .add("sign-cast-memref-cast", OpTag::MemrefCast, cast_like)
        .add("sign-cast-tensor-cast", OpTag::TensorCast, cast_like)
        .add("sign-cast-change-layout", OpTag::ChangeLayout, cast_like)
        .add("sign-cast-reinterpret", OpTag::ReinterpretCast, reinterpret)
        .add("sign-cast-load", OpTag::Load, load)
        .add("sign-cast-store", OpTag::Store, store)
        .add("sign-cast-realloc", OpTag::Realloc, realloc)
        .add("sign-cast-extract", OpTag::Extract, extract)
        .add("sign-cast-atomic-rmw", OpTag::AtomicRmw, atomic_rmw)
        .add("sign-cast-subview", OpTag::Subview, view)
        .add("sign-cast-extract-slice", OpTag::ExtractSlice, view)
        .add("sign-cast-for", OpTag::For, for_loop);
}

fn signcast_source(m: &Module, value: ValueId) -> Option<ValueId> {
    source_of(m, value, OpTag::SignCast).map(|(_, src)| src)
}

fn ty(m: &Module, value: ValueId) -> Type {
    m.value_type(value).clone()
}

fn elem(m: &Module, value: ValueId) -> Option<Type> {
    m.value_type(value).element_type().cloned()
}

fn sign_cast_back(b: &mut Builder<'_>, value: ValueId, old: Type) -> ValueId {
    b.sign_cast(value, old)
}

/// `sign_cast(sign_cast(x))` casts `x` directly.
fn chain(m: &mut Module, op: OpId) -> bool {
    let Some(src) = signcast_source(m, m.operand(op, 0)) else {
        return false;
    };
    if *m.value_type(src) == ty(m, m.result(op, 0)) {
        m.replace_op(op, &[src]);
    } else {
        m.set_operand(op, 0, src);
    }
    true
}

fn poison(m: &mut Module, op: OpId) -> bool {
    if m.defining_op_of(m.operand(op, 0), OpTag::Undef).is_none() {
        return false;
    }
    let dst_ty = ty(m, m.result(op, 0));
    let undef = Builder::before(m, op).undef(dst_ty);
    m.replace_op(op, &[undef]);
    true
}

/// A single-use allocation is made at the element type of its sign cast.
fn alloc(m: &mut Module, op: OpId) -> bool {
    let src = m.operand(op, 0);
    let Some(alloc_op) = m
        .defining_op(src)
        .filter(|a| matches!(m.tag(*a), OpTag::Alloc | OpTag::Alloca))
    else {
        return false;
    };
    if !m.has_one_use(src) {
        return false;
    }
    let (Some(orig), Some(dst)) = (
        m.value_type(src).as_memref().cloned(),
        ty(m, m.result(op, 0)).as_memref().cloned(),
    ) else {
        return false;
    };
    if orig.elem == dst.elem {
        return false;
    }
    let alloc_ty = MemRefType {
        memory_space: orig.memory_space,
        ..dst.clone()
    };
    let kind = m.kind(alloc_op).clone();
    let sizes = m.operands(alloc_op).to_vec();
    let mut b = Builder::before(m, op);
    let mut res = b.create(kind, sizes, Type::MemRef(alloc_ty.clone()));
    if alloc_ty != dst {
        res = b.sign_cast(res, Type::MemRef(dst));
    }
    m.replace_op(op, &[res]);
    m.erase_op(alloc_op);
    true
}

fn from_elements(m: &mut Module, op: OpId) -> bool {
    let Some(fe) = m.defining_op_of(m.operand(op, 0), OpTag::FromElements) else {
        return false;
    };
    let dst_ty = ty(m, m.result(op, 0));
    let Some(elem_ty) = dst_ty.element_type().cloned() else {
        return false;
    };
    let elements = m.operands(fe).to_vec();
    let mut b = Builder::before(m, op);
    let casted: Vec<ValueId> = elements
        .into_iter()
        .map(|e| b.sign_cast(e, elem_ty.clone()))
        .collect();
    let res = b.create(OpKind::FromElements, casted, dst_ty);
    m.replace_op(op, &[res]);
    true
}

fn collapse_shape(m: &mut Module, op: OpId) -> bool {
    let Some(prev) = m.defining_op_of(m.operand(op, 0), OpTag::CollapseShape) else {
        return false;
    };
    let src = m.operand(prev, 0);
    let dst_ty = ty(m, m.result(op, 0));
    let Some(elem_ty) = dst_ty.element_type().cloned() else {
        return false;
    };
    let Some(new_src_ty) = m.value_type(src).with_element_type(elem_ty) else {
        return false;
    };
    let kind = m.kind(prev).clone();
    let mut b = Builder::before(m, op);
    let new_src = b.sign_cast(src, new_src_ty);
    let res = b.create(kind, vec![new_src], dst_ty);
    m.replace_op(op, &[res]);
    true
}

fn dim(m: &mut Module, op: OpId) -> bool {
    match signcast_source(m, m.operand(op, 0)) {
        Some(src) => {
            m.set_operand(op, 0, src);
            true
        }
        None => false,
    }
}

fn shapes_compatible(a: &[Dim], b: &[Dim]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|pair| match pair {
            (Dim::Static(x), Dim::Static(y)) => x == y,
            _ => true,
        })
}

/// `cast(sign_cast(x))` -> `sign_cast(cast(x))` with the cast kept at the
/// element type of `x`. Applies to memref casts, tensor casts and layout changes.
fn cast_like(m: &mut Module, op: OpId) -> bool {
    let Some(src) = signcast_source(m, m.operand(op, 0)) else {
        return false;
    };
    let intermediate = ty(m, m.operand(op, 0));
    let dst_ty = ty(m, m.result(op, 0));
    if intermediate.element_type() != dst_ty.element_type() {
        return false;
    }
    let src_ty = ty(m, src);
    let new_ty = match (&src_ty, &dst_ty) {
        (Type::MemRef(s), Type::MemRef(d)) => {
            let t = MemRefType {
                elem: s.elem.clone(),
                memory_space: s.memory_space,
                ..d.clone()
            };
            if !memrefs_cast_compatible(s, &t) {
                return false;
            }
            Type::MemRef(t)
        }
        (Type::Tensor(s), Type::Tensor(d)) => {
            if !shapes_compatible(&s.shape, &d.shape) {
                return false;
            }
            match dst_ty.with_element_type((*s.elem).clone()) {
                Some(t) => t,
                None => return false,
            }
        }
        _ => return false,
    };
    let kind = m.kind(op).clone();
    let mut b = Builder::before(m, op);
    let cast = b.create(kind, vec![src], new_ty);
    let res = b.sign_cast(cast, dst_ty);
    m.replace_op(op, &[res]);
    true
}

fn reinterpret(m: &mut Module, op: OpId) -> bool {
    let Some(src) = signcast_source(m, m.operand(op, 0)) else {
        return false;
    };
    let intermediate = ty(m, m.operand(op, 0));
    let dst_ty = ty(m, m.result(op, 0));
    if intermediate.element_type() != dst_ty.element_type() {
        return false;
    }
    let (Some(src_m), Some(dst_m)) = (m.value_type(src).as_memref(), dst_ty.as_memref()) else {
        return false;
    };
    let new_ty = Type::MemRef(MemRefType {
        elem: src_m.elem.clone(),
        memory_space: src_m.memory_space,
        ..dst_m.clone()
    });
    let kind = m.kind(op).clone();
    let mut operands = m.operands(op).to_vec();
    operands[0] = src;
    let mut b = Builder::before(m, op);
    let cast = b.create(kind, operands, new_ty);
    let res = b.sign_cast(cast, dst_ty);
    m.replace_op(op, &[res]);
    true
}

fn load(m: &mut Module, op: OpId) -> bool {
    let Some(src) = signcast_source(m, m.operand(op, 0)) else {
        return false;
    };
    let old_ty = ty(m, m.result(op, 0));
    let indices = m.operands(op)[1..].to_vec();
    let mut b = Builder::before(m, op);
    let mut res = b.load(src, indices);
    if *b.module().value_type(res) != old_ty {
        res = b.sign_cast(res, old_ty);
    }
    m.replace_op(op, &[res]);
    true
}

fn store(m: &mut Module, op: OpId) -> bool {
    let Some(src) = signcast_source(m, m.operand(op, 1)) else {
        return false;
    };
    let Some(src_elem) = elem(m, src) else {
        return false;
    };
    let mut value = m.operand(op, 0);
    if *m.value_type(value) != src_elem {
        value = Builder::before(m, op).sign_cast(value, src_elem);
    }
    m.set_operand(op, 0, value);
    m.set_operand(op, 1, src);
    true
}

/// `realloc(sign_cast(x), n)` -> `sign_cast(realloc(x, n))`.
fn realloc(m: &mut Module, op: OpId) -> bool {
    let Some(src) = signcast_source(m, m.operand(op, 0)) else {
        return false;
    };
    let dst_ty = ty(m, m.result(op, 0));
    let Some(src_elem) = elem(m, src) else {
        return false;
    };
    let Some(new_ty) = dst_ty.with_element_type(src_elem) else {
        return false;
    };
    let mut operands = m.operands(op).to_vec();
    operands[0] = src;
    let mut b = Builder::before(m, op);
    let res = b.create(OpKind::Realloc, operands, new_ty);
    let back = b.sign_cast(res, dst_ty);
    m.replace_op(op, &[back]);
    true
}

fn extract(m: &mut Module, op: OpId) -> bool {
    let Some(src) = signcast_source(m, m.operand(op, 0)) else {
        return false;
    };
    let old_ty = ty(m, m.result(op, 0));
    let Some(src_elem) = elem(m, src) else {
        return false;
    };
    let mut operands = m.operands(op).to_vec();
    operands[0] = src;
    let mut b = Builder::before(m, op);
    let mut res = b.create(OpKind::Extract, operands, src_elem.clone());
    if src_elem != old_ty {
        res = b.sign_cast(res, old_ty);
    }
    m.replace_op(op, &[res]);
    true
}

fn atomic_rmw(m: &mut Module, op: OpId) -> bool {
    let Some(src) = signcast_source(m, m.operand(op, 1)) else {
        return false;
    };
    let Some(new_elem) = elem(m, src) else {
        return false;
    };
    if matches!(new_elem, Type::Int(_)) && !new_elem.is_signless_int() {
        return false;
    }
    let OpKind::AtomicRmw(kind) = *m.kind(op) else {
        return false;
    };
    let old_ty = ty(m, m.result(op, 0));
    let indices = m.operands(op)[2..].to_vec();
    let mut value = m.operand(op, 0);
    let mut b = Builder::before(m, op);
    if *b.module().value_type(value) != new_elem {
        value = b.sign_cast(value, new_elem.clone());
    }
    let mut res = b.atomic_rmw(kind, value, src, indices);
    if new_elem != old_ty {
        res = b.sign_cast(res, old_ty);
    }
    m.replace_op(op, &[res]);
    true
}

/// Subview or extract_slice of a sign cast slices the source.
fn view(m: &mut Module, op: OpId) -> bool {
    let Some(src) = signcast_source(m, m.operand(op, 0)) else {
        return false;
    };
    let dst_ty = ty(m, m.result(op, 0));
    let src_ty = ty(m, src);
    let Some(src_elem) = src_ty.element_type().cloned() else {
        return false;
    };
    let new_ty = match (&src_ty, &dst_ty) {
        (Type::MemRef(s), Type::MemRef(d)) => Type::MemRef(MemRefType {
            elem: Box::new(src_elem),
            memory_space: s.memory_space,
            ..d.clone()
        }),
        _ => match dst_ty.with_element_type(src_elem) {
            Some(t) => t,
            None => return false,
        },
    };
    let kind = m.kind(op).clone();
    let mut operands = m.operands(op).to_vec();
    operands[0] = src;
    let mut b = Builder::before(m, op);
    let res = b.create(kind, operands, new_ty);
    let back = b.sign_cast(res, dst_ty);
    m.replace_op(op, &[back]);
    true
}

/// Loop-carried values yielded through a sign cast are carried at the
/// source type.
fn for_loop(m: &mut Module, op: OpId) -> bool {
    let body = m.body_block(op, 0);
    let Some(term) = m.terminator(body) else {
        return false;
    };
    let mut changed = false;
    for i in 0..m.num_operands(term) {
        let yielded = m.operand(term, i);
        let Some(src) = signcast_source(m, yielded) else {
            continue;
        };
        let new_ty = ty(m, src);
        if new_ty == *m.value_type(yielded) {
            continue;
        }
        m.set_operand(term, i, src);
        let init = m.operand(op, 3 + i);
        let new_init = Builder::before(m, op).sign_cast(init, new_ty.clone());
        m.set_operand(op, 3 + i, new_init);
        retype_block_arg(m, body, i + 1, new_ty.clone(), sign_cast_back);
        retype_result(m, op, i, new_ty, sign_cast_back);
        changed = true;
    }
    changed
}
