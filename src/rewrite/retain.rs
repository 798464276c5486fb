//! Retain canonicalization.
//!
//! A retain paired with a later release of the same allocation in the same
//! block is a no-op: both are removed and users of the retained value read
//! the source directly.

use super::registry::RuleSet;
use super::source_of;
use crate::ir::builder::Builder;
use crate::ir::module::{Module, OpId};
use crate::ir::ops::OpTag;
use crate::ir::types::memrefs_cast_compatible;

pub fn register(set: &mut RuleSet) {
    set.add("dim-of-retain", OpTag::Dim, dim_of_retain)
        .add("retain-trivial-dealloc", OpTag::Retain, trivial_dealloc);
}

fn dim_of_retain(m: &mut Module, op: OpId) -> bool {
    match source_of(m, m.operand(op, 0), OpTag::Retain) {
        Some((_, src)) => {
            m.set_operand(op, 0, src);
            true
        }
        None => false,
    }
}

fn trivial_dealloc(m: &mut Module, op: OpId) -> bool {
    let src = m.operand(op, 0);
    let res = m.result(op, 0);
    let src_ty = m.value_type(src).clone();
    let dst_ty = m.value_type(res).clone();
    if src_ty != dst_ty {
        let compatible = match (src_ty.as_memref(), dst_ty.as_memref()) {
            (Some(a), Some(b)) => memrefs_cast_compatible(a, b),
            _ => false,
        };
        if !compatible {
            return false;
        }
    }

    let Some(block) = m.parent_block(op) else {
        return false;
    };
    let pos = m.op_position(op);
    let dealloc = m
        .users(src)
        .into_iter()
        .chain(m.users(res))
        .filter(|u| m.tag(*u) == OpTag::Dealloc && m.parent_block(*u) == Some(block))
        .map(|u| (m.op_position(u), u))
        .filter(|(p, _)| *p > pos)
        .min_by_key(|(p, _)| *p)
        .map(|(_, u)| u);
    let Some(dealloc) = dealloc else {
        return false;
    };

    let replacement = if src_ty != dst_ty {
        Builder::before(m, op).memref_cast(src, dst_ty)
    } else {
        src
    };
    m.replace_op(op, &[replacement]);
    m.erase_op(dealloc);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::build_func;
    use crate::ir::types::{Dim, Type};

    fn mem() -> Type {
        Type::memref(Type::f64(), vec![Dim::Dynamic])
    }

    #[test]
    fn test_retain_followed_by_dealloc_cancels() {
        let mut m = Module::new("retain");
        let (_, entry) = build_func(&mut m, "f", vec![mem()], vec![Type::Index]);
        let arg = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let r = b.retain(arg);
        let zero = b.const_index(0);
        let d = b.dim(r, zero);
        b.dealloc(arg);
        let ret = b.return_(vec![d]);

        let root = m.defining_op(r).unwrap();
        assert!(trivial_dealloc(&mut m, root));
        assert!(!m.is_alive(root));
        let dim_op = m.defining_op(m.operand(ret, 0)).unwrap();
        assert_eq!(m.operand(dim_op, 0), arg);
        assert!(m
            .block_ops(entry)
            .iter()
            .all(|o| m.tag(*o) != OpTag::Dealloc));
    }

    #[test]
    fn test_dealloc_before_retain_is_kept() {
        let mut m = Module::new("retain");
        let (_, entry) = build_func(&mut m, "f", vec![mem()], vec![mem()]);
        let arg = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        b.dealloc(arg);
        let r = b.retain(arg);
        b.return_(vec![r]);

        let root = m.defining_op(r).unwrap();
        assert!(!trivial_dealloc(&mut m, root));
    }

    #[test]
    fn test_dim_reads_through_retain() {
        let mut m = Module::new("dim");
        let (_, entry) = build_func(&mut m, "f", vec![mem()], vec![Type::Index]);
        let arg = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let r = b.retain(arg);
        let zero = b.const_index(0);
        let d = b.dim(r, zero);
        b.return_(vec![d]);

        let root = m.defining_op(d).unwrap();
        assert!(dim_of_retain(&mut m, root));
        assert_eq!(m.operand(root, 0), arg);
    }
}
