// This module canonicalizes environment regions. Four rules apply to an `env_region` root:
// values the region yields but that are defined outside it are forwarded straight to the
// users; a region nested in a parent with the same environment and arguments is inlined
// into it; duplicate and unused yields are pruned with downstream uses remapped; and two
// adjacent regions with identical arguments whose environments merge become one region,
// with uses of the first region's results inside the second one rewired to the yielded
// values so no yield round trip is left behind. Dropping results needs a new op, so the
// rules that shrink or grow the result list rebuild the region op and move the body over.

//! Environment region canonicalization.

use hashbrown::HashMap;

use super::inline_into_parent;
use super::registry::RuleSet;
use crate::ir::attrs::{merge_env_attrs, EnvAttr};
use crate::ir::builder::Builder;
use crate::ir::module::{Module, OpId, ValueId};
use crate::ir::ops::{OpKind, OpTag};
use crate::ir::types::Type;

pub fn register(set: &mut RuleSet) {
    set.add("env-region-outside-values", OpTag::EnvRegion, propagate_outside_values)
        .add("env-region-merge-nested", OpTag::EnvRegion, merge_nested)
        .add("env-region-cleanup-yields", OpTag::EnvRegion, cleanup_yields)
        .add("env-region-merge-adjacent", OpTag::EnvRegion, merge_adjacent);
}

pub(crate) fn env_of(m: &Module, op: OpId) -> Option<&EnvAttr> {
    match m.kind(op) {
        OpKind::EnvRegion { env } => Some(env),
        _ => None,
    }
}

fn body_terminator(m: &Module, op: OpId) -> Option<OpId> {
    m.terminator(m.body_block(op, 0))
        .filter(|t| m.tag(*t) == OpTag::EnvYield)
}

/// Replace `op` by a new region op yielding `yields`, moving the body over.
/// `env` overrides the environment when given.
fn rebuild(m: &mut Module, op: OpId, yields: Vec<ValueId>, env: Option<EnvAttr>) -> OpId {
    let env = match env {
        Some(e) => e,
        None => env_of(m, op).cloned().unwrap_or(EnvAttr::Parallel),
    };
    let args = m.operands(op).to_vec();
    let types: Vec<Type> = yields.iter().map(|v| m.value_type(*v).clone()).collect();
    if let Some(term) = body_terminator(m, op) {
        m.set_operands(term, yields);
    }
    let new_op = Builder::before(m, op).insert(OpKind::EnvRegion { env }, args, types, 1);
    let (src, dest) = (m.region(op, 0), m.region(new_op, 0));
    m.take_region_blocks(src, dest);
    new_op
}

/// Route uses of the results of `op` to `replacements` (unused results map to
/// `None`) and erase it.
fn replace_results(m: &mut Module, op: OpId, replacements: &[Option<ValueId>]) {
    let results = m.results(op).to_vec();
    for (old, new) in results.into_iter().zip(replacements) {
        if let Some(new) = new {
            m.replace_all_uses(old, *new);
        }
    }
    m.erase_op(op);
}

fn propagate_outside_values(m: &mut Module, op: OpId) -> bool {
    let Some(term) = body_terminator(m, op) else {
        return false;
    };
    let region = m.region(op, 0);
    let yielded = m.operands(term).to_vec();
    let mut kept = Vec::new();
    let mut forwarded: Vec<Option<ValueId>> = Vec::with_capacity(yielded.len());
    for v in &yielded {
        if m.is_defined_in_region(*v, region) {
            kept.push(*v);
            forwarded.push(None);
        } else {
            forwarded.push(Some(*v));
        }
    }
    if kept.len() == yielded.len() {
        return false;
    }
    let new_op = rebuild(m, op, kept, None);
    let mut next = 0;
    let replacements: Vec<Option<ValueId>> = forwarded
        .into_iter()
        .map(|f| {
            f.or_else(|| {
                let r = m.result(new_op, next);
                next += 1;
                Some(r)
            })
        })
        .collect();
    replace_results(m, op, &replacements);
    true
}

fn merge_nested(m: &mut Module, op: OpId) -> bool {
    let Some(parent) = m.parent_of_tag(op, OpTag::EnvRegion) else {
        return false;
    };
    if env_of(m, parent) != env_of(m, op) || m.operands(parent) != m.operands(op) {
        return false;
    }
    if body_terminator(m, op).is_none() {
        return false;
    }
    inline_into_parent(m, op, 0);
    true
}

fn cleanup_yields(m: &mut Module, op: OpId) -> bool {
    let Some(term) = body_terminator(m, op) else {
        return false;
    };
    let yielded = m.operands(term).to_vec();
    let mut new_yields: Vec<ValueId> = Vec::new();
    let mut index_of: HashMap<ValueId, usize> = HashMap::new();
    let mut mapping: Vec<Option<usize>> = vec![None; yielded.len()];
    for (i, v) in yielded.iter().enumerate() {
        if !m.has_uses(m.result(op, i)) {
            continue;
        }
        let idx = *index_of.entry(*v).or_insert_with(|| {
            new_yields.push(*v);
            new_yields.len() - 1
        });
        mapping[i] = Some(idx);
    }
    if new_yields.len() == yielded.len() {
        return false;
    }
    let new_op = rebuild(m, op, new_yields, None);
    let replacements: Vec<Option<ValueId>> = mapping
        .into_iter()
        .map(|idx| idx.map(|i| m.result(new_op, i)))
        .collect();
    replace_results(m, op, &replacements);
    true
}

fn merge_adjacent(m: &mut Module, op: OpId) -> bool {
    let Some(next) = m.next_op(op).filter(|n| m.tag(*n) == OpTag::EnvRegion) else {
        return false;
    };
    if m.operands(next) != m.operands(op) {
        return false;
    }
    let Some(env) = merge_env_attrs(env_of(m, op), env_of(m, next)) else {
        return false;
    };
    let (Some(term), Some(next_term)) = (body_terminator(m, op), body_terminator(m, next)) else {
        return false;
    };

    let yielded = m.operands(term).to_vec();
    for (i, value) in yielded.iter().enumerate() {
        let res = m.result(op, i);
        m.replace_uses_if(res, *value, |m, u| m.is_proper_ancestor(next, u.op));
    }

    let count = yielded.len();
    let mut merged = yielded;
    merged.extend_from_slice(m.operands(next_term));
    m.erase_op(next_term);
    let body = m.body_block(op, 0);
    let next_body = m.body_block(next, 0);
    m.inline_block(next_body, body, Some(term), &[]);

    let new_op = rebuild(m, op, merged, Some(env));
    let first: Vec<Option<ValueId>> = (0..count).map(|i| Some(m.result(new_op, i))).collect();
    let second: Vec<Option<ValueId>> = (count..m.num_results(new_op))
        .map(|i| Some(m.result(new_op, i)))
        .collect();
    replace_results(m, op, &first);
    replace_results(m, next, &second);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{build_func, TestContext};
    use crate::ir::attrs::DeviceCaps;
    use crate::ir::ops::BinOp;
    use crate::ir::verify::verify_module;
    use crate::rewrite::{apply_rules_greedily, RuleSet};

    fn region_ops(m: &Module, block: crate::ir::module::BlockId) -> Vec<OpId> {
        m.block_ops(block)
            .iter()
            .copied()
            .filter(|o| m.tag(*o) == OpTag::EnvRegion)
            .collect()
    }

    #[test]
    fn test_outside_values_are_forwarded() {
        let mut m = Module::new("outside");
        let (_, entry) = build_func(&mut m, "f", vec![Type::Index], vec![Type::Index, Type::Index]);
        let x = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let region = b.env_region(EnvAttr::Parallel, vec![], vec![Type::Index, Type::Index]);
        let r0 = b.module().result(region, 0);
        let r1 = b.module().result(region, 1);
        let ret = b.return_(vec![r0, r1]);
        let body = m.body_block(region, 0);
        let mut bb = Builder::at_end(&mut m, body);
        let y = bb.binary(BinOp::AddI, x, x);
        bb.env_yield(vec![x, y]);

        assert!(propagate_outside_values(&mut m, region));
        assert_eq!(m.operand(ret, 0), x);
        let new_region = region_ops(&m, entry)[0];
        assert_eq!(m.num_results(new_region), 1);
        assert_eq!(m.operand(ret, 1), m.result(new_region, 0));
        verify_module(&m).unwrap();
    }

    #[test]
    fn test_duplicate_and_unused_yields_are_pruned() {
        let mut m = Module::new("cleanup");
        let (_, entry) = build_func(&mut m, "f", vec![Type::Index], vec![Type::Index, Type::Index]);
        let x = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let region = b.env_region(EnvAttr::Parallel, vec![], vec![Type::Index; 3]);
        let r0 = b.module().result(region, 0);
        let r2 = b.module().result(region, 2);
        let ret = b.return_(vec![r0, r2]);
        let body = m.body_block(region, 0);
        let mut bb = Builder::at_end(&mut m, body);
        let y = bb.binary(BinOp::MulI, x, x);
        bb.env_yield(vec![y, y, y]);

        assert!(cleanup_yields(&mut m, region));
        let new_region = region_ops(&m, entry)[0];
        assert_eq!(m.num_results(new_region), 1);
        assert_eq!(m.operand(ret, 0), m.operand(ret, 1));
        verify_module(&m).unwrap();
    }

    #[test]
    fn test_nested_region_with_same_env_is_inlined() {
        let mut m = Module::new("nested");
        let (_, entry) = build_func(&mut m, "f", vec![Type::Index], vec![Type::Index]);
        let x = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let outer = b.env_region(EnvAttr::Parallel, vec![], vec![Type::Index]);
        let r = b.module().result(outer, 0);
        b.return_(vec![r]);
        let outer_body = m.body_block(outer, 0);
        let mut ob = Builder::at_end(&mut m, outer_body);
        let inner = ob.env_region(EnvAttr::Parallel, vec![], vec![Type::Index]);
        let ir = ob.module().result(inner, 0);
        ob.env_yield(vec![ir]);
        let inner_body = m.body_block(inner, 0);
        let mut ib = Builder::at_end(&mut m, inner_body);
        let y = ib.binary(BinOp::AddI, x, x);
        ib.env_yield(vec![y]);

        assert!(merge_nested(&mut m, inner));
        let term = m.terminator(outer_body).unwrap();
        assert_eq!(m.operand(term, 0), y);
        assert!(region_ops(&m, outer_body).is_empty());
        verify_module(&m).unwrap();
    }

    #[test]
    fn test_adjacent_regions_merge_and_resolve_uses() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("adjacent");
        let (_, entry) = build_func(&mut m, "f", vec![Type::Index], vec![Type::Index, Type::Index]);
        let x = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let first = b.env_region(EnvAttr::Parallel, vec![], vec![Type::Index]);
        let second = b.env_region(EnvAttr::Parallel, vec![], vec![Type::Index]);
        let a = b.module().result(first, 0);
        let c = b.module().result(second, 0);
        let ret = b.return_(vec![a, c]);

        let body1 = m.body_block(first, 0);
        let mut b1 = Builder::at_end(&mut m, body1);
        let y = b1.binary(BinOp::AddI, x, x);
        b1.env_yield(vec![y]);
        let body2 = m.body_block(second, 0);
        let mut b2 = Builder::at_end(&mut m, body2);
        let z = b2.binary(BinOp::MulI, a, x);
        b2.env_yield(vec![z]);

        apply_rules_greedily(&mut m, &RuleSet::canonical(), &session, 10).unwrap();
        let regions = region_ops(&m, entry);
        assert_eq!(regions.len(), 1);
        let merged = regions[0];
        assert_eq!(m.num_results(merged), 2);
        let z_op = m.defining_op(z).unwrap();
        assert_eq!(m.operand(z_op, 0), y);
        assert_eq!(m.operand(ret, 0), m.result(merged, 0));
        assert_eq!(m.operand(ret, 1), m.result(merged, 1));
        verify_module(&m).unwrap();
    }

    #[test]
    fn test_conflicting_devices_do_not_merge() {
        let mut m = Module::new("devices");
        let (_, entry) = build_func(&mut m, "f", vec![], vec![]);
        let caps = DeviceCaps { fp16: true, fp64: false };
        let mut b = Builder::at_end(&mut m, entry);
        let first = b.env_region(EnvAttr::Device { name: "gpu0".into(), caps }, vec![], vec![]);
        let second = b.env_region(EnvAttr::Device { name: "gpu1".into(), caps }, vec![], vec![]);
        b.return_(vec![]);
        for r in [first, second] {
            let body = m.body_block(r, 0);
            Builder::at_end(&mut m, body).env_yield(vec![]);
        }

        assert!(!merge_adjacent(&mut m, first));
    }
}
