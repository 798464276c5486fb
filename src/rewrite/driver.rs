// This module implements the greedy fixed-point driver that applies a rule set to a module.
// Each sweep seeds a worklist with every live op in pre-order. Popping an op first checks
// whether it is trivially dead (pure, all results unused) and erases it; otherwise the rules
// registered for its tag are tried in order until one reports a change. After a successful
// rewrite the module's dirty list (ops created or modified by the rule) and the producers of
// the root's former operands are pushed back onto the worklist, since those producers may
// have become dead or newly matchable. A sweep that changes nothing ends the run; when
// `max_iterations` sweeps all change something, or a single sweep exceeds its rewrite budget,
// the driver reports non-convergence instead of looping forever.

//! Greedy worklist rewrite driver.

use hashbrown::HashSet;
use log::trace;
use std::collections::VecDeque;

use super::registry::RuleSet;
use crate::core::error::{PassError, PassResult};
use crate::core::session::PipelineSession;
use crate::ir::module::{Module, OpId};
use crate::ir::ops::OpTag;

/// Rewrites allowed per sweep for each op present at the start of the sweep.
const REWRITES_PER_OP: usize = 32;

fn is_live(m: &Module, op: OpId) -> bool {
    m.is_alive(op)
        && m
            .parent_block(op)
            .is_some_and(|b| m.is_block_alive(b))
}

/// Pure op whose results are all unused.
pub fn is_trivially_dead(m: &Module, op: OpId) -> bool {
    m.tag(op) != OpTag::Func
        && m.kind(op).is_pure()
        && m.results(op).iter().all(|r| !m.has_uses(*r))
}

fn operand_producers(m: &Module, op: OpId) -> Vec<OpId> {
    m.operands(op)
        .iter()
        .filter_map(|v| m.defining_op(*v))
        .collect()
}

/// Apply `rules` until no rule matches anywhere. Returns whether anything
/// changed.
pub fn apply_rules_greedily(
    m: &mut Module,
    rules: &RuleSet,
    session: &PipelineSession<'_>,
    max_iterations: usize,
) -> PassResult<bool> {
    m.set_track_changes(true);
    let result = run_sweeps(m, rules, session, max_iterations);
    m.set_track_changes(false);
    result
}

fn run_sweeps(
    m: &mut Module,
    rules: &RuleSet,
    session: &PipelineSession<'_>,
    max_iterations: usize,
) -> PassResult<bool> {
    let mut changed_any = false;
    for iteration in 0..max_iterations {
        let ops_before = m.allocated_op_count();
        let mut worklist: VecDeque<OpId> = m.walk().into_iter().collect();
        let mut queued: HashSet<OpId> = worklist.iter().copied().collect();
        let budget = worklist.len().max(1) * REWRITES_PER_OP;
        let mut rewrites = 0usize;
        let mut changed = false;
        m.take_dirty();

        while let Some(op) = worklist.pop_front() {
            queued.remove(&op);
            if !is_live(m, op) {
                continue;
            }
            let producers = operand_producers(m, op);

            if is_trivially_dead(m, op) {
                trace!("erasing dead {}", m.kind(op).name());
                m.erase_op(op);
                session.record_ops_erased(1);
                changed = true;
                for p in producers {
                    if queued.insert(p) {
                        worklist.push_back(p);
                    }
                }
                continue;
            }

            let tag = m.tag(op);
            for rule in rules.rules_for(tag) {
                if !(rule.apply)(m, op) {
                    continue;
                }
                trace!("applied {} on {}", rule.name, tag.name());
                session.record_rule_fired(rule.name);
                rewrites += 1;
                changed = true;
                let touched = m.take_dirty();
                for d in touched.into_iter().chain(producers) {
                    if queued.insert(d) {
                        worklist.push_back(d);
                    }
                }
                if m.is_alive(op) && queued.insert(op) {
                    worklist.push_back(op);
                }
                break;
            }

            if rewrites > budget {
                log::warn!(
                    "rewrite budget of {} exhausted in sweep {}",
                    budget,
                    iteration
                );
                return Err(PassError::NoConvergence {
                    iterations: iteration + 1,
                });
            }
        }

        session.record_ops_created(m.allocated_op_count() - ops_before);
        if !changed {
            return Ok(changed_any);
        }
        changed_any = true;
    }
    Err(PassError::NoConvergence {
        iterations: max_iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::TestContext;
    use crate::ir::builder::Builder;
    use crate::ir::ops::{BinOp, Visibility};
    use crate::ir::types::{FunctionType, Type};

    #[test]
    fn test_dead_pure_ops_are_erased() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("dce");
        let body = m.body();
        let f = Builder::at_end(&mut m, body).func("f", FunctionType::new(vec![], vec![]), Visibility::Public);
        let entry = m.body_block(f, 0);
        {
            let mut b = Builder::at_end(&mut m, entry);
            let a = b.const_index(1);
            let c = b.const_index(2);
            b.binary(BinOp::AddI, a, c);
            b.return_(vec![]);
        }

        let changed = apply_rules_greedily(&mut m, &RuleSet::new(), &session, 10).unwrap();
        assert!(changed);
        assert_eq!(m.block_ops(entry).len(), 1);
        assert_eq!(session.stats().ops_erased, 3);
    }

    fn grow(m: &mut Module, op: OpId) -> bool {
        let v = m.result(op, 0);
        let mut b = Builder::after(m, op);
        let one = b.const_index(1);
        let sum = b.binary(BinOp::AddI, v, one);
        let grown = m.defining_op(sum).unwrap();
        m.replace_all_uses_except(v, sum, grown);
        true
    }

    #[test]
    fn test_non_terminating_rules_are_reported() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("loop");
        let body = m.body();
        let f = Builder::at_end(&mut m, body).func("f", FunctionType::new(vec![], vec![Type::Index]), Visibility::Public);
        let entry = m.body_block(f, 0);
        {
            let mut b = Builder::at_end(&mut m, entry);
            let a = b.const_index(1);
            let c = b.const_index(2);
            let s = b.binary(BinOp::AddI, a, c);
            b.return_(vec![s]);
        }
        let mut rules = RuleSet::new();
        rules.add("grow", OpTag::Binary, grow);
        let err = apply_rules_greedily(&mut m, &rules, &session, 4).unwrap_err();
        assert!(matches!(err, PassError::NoConvergence { .. }));
    }
}
