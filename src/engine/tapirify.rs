// This module turns canonical counted loops of a lowered module into task-parallel loops.
// A loop qualifies when its header carries an induction variable that enters as the
// constant zero from outside the loop and comes back on the single back edge as
// `iv + 1`, when that increment feeds a compare whose only user is the latch branch, and
// when the loop has a single exit. Loops are visited innermost first within each nest and
// the first qualifying loop of a nest is the only one split, so an outer loop is never
// parallelized around an already parallel inner loop.
//
// Splitting moves the loop body into a task: the header detaches to the body and
// continues at a new latch block holding the increment, compare and branch; the body ends
// in a reattach to the latch; the exit block syncs before falling through to its old
// contents. A sync region is started at the top of the entry block. The latch branch gets
// the spawning strategy and target hints. A body whose values are needed after the task
// (loop-carried registers, values used by the latch or after the loop) is left alone,
// since a detached task can only communicate through memory.

//! Loop tapirification.

use hashbrown::HashSet;
use log::{debug, trace};

use super::config::TapirTarget;
use crate::ir::attrs::{names, Attribute};
use crate::ir::builder::Builder;
use crate::ir::cfg::{Loop, LoopInfo};
use crate::ir::module::{BlockId, Module, OpId, RegionId, ValueId};
use crate::ir::ops::{BinOp, ConstValue, OpKind, OpTag};
use crate::ir::verify::branch_args;

pub const SPAWN_STRATEGY_HINT: &str = "tapir.loop.spawn.strategy";
pub const LOOP_TARGET_HINT: &str = "tapir.loop.target";
/// Divide-and-conquer spawning.
const STRATEGY_DAC: i64 = 1;

/// Split the qualifying loops of every function. Returns how many were split.
pub fn tapirify_module(m: &mut Module, target: TapirTarget) -> usize {
    let mut split = 0;
    for func in m.functions() {
        let region = m.region(func, 0);
        if m.region_blocks(region).is_empty() {
            continue;
        }
        split += tapirify_function(m, func, region, target);
    }
    debug!("tapirified {} loops for {}", split, target);
    split
}

fn tapirify_function(m: &mut Module, func: OpId, region: RegionId, target: TapirTarget) -> usize {
    let info = LoopInfo::compute(m, region);
    let nests: Vec<Vec<BlockId>> = info
        .nests()
        .into_iter()
        .map(|nest| nest.into_iter().rev().map(|i| info.loops[i].header).collect())
        .collect();
    let mut split = 0;
    for nest in nests {
        for header in nest {
            // splitting changes the block sets, recompute per candidate
            let info = LoopInfo::compute(m, region);
            let Some(index) = info.loops.iter().position(|l| l.header == header) else {
                continue;
            };
            if split_loop(m, func, region, &info, index, target) {
                split += 1;
                break;
            }
        }
    }
    split
}

struct CountedLoop {
    increment: OpId,
    compare: OpId,
    branch: OpId,
    exit: BlockId,
    /// The increment is the first op of the header rather than part of the latch.
    increment_first: bool,
}

fn const_int(m: &Module, value: ValueId) -> Option<i64> {
    let op = m.defining_op(value)?;
    match m.kind(op) {
        OpKind::Constant(ConstValue::Int(v)) => Some(*v),
        _ => None,
    }
}

/// Values passed to argument `index` of `header`, with the branching block.
fn incoming(m: &Module, region: RegionId, header: BlockId, index: usize) -> Vec<(BlockId, ValueId)> {
    let mut out = Vec::new();
    for block in m.region_blocks(region) {
        let Some(term) = m.terminator(*block) else {
            continue;
        };
        for (s, succ) in m.successors(term).iter().enumerate() {
            if *succ != header {
                continue;
            }
            if let Some(v) = branch_args(m, term, s).get(index) {
                out.push((*block, *v));
            }
        }
    }
    out
}

/// `iv + 1` with `iv` the given block argument.
fn is_unit_increment(m: &Module, op: OpId, iv: ValueId) -> bool {
    if m.kind(op) != &OpKind::Binary(BinOp::AddI) {
        return false;
    }
    let (a, b) = (m.operand(op, 0), m.operand(op, 1));
    (a == iv && const_int(m, b) == Some(1)) || (b == iv && const_int(m, a) == Some(1))
}

fn match_counted_loop(m: &Module, region: RegionId, info: &LoopInfo, index: usize) -> Option<CountedLoop> {
    let l = &info.loops[index];
    if l.latches.len() != 1 {
        return None;
    }
    let latch = l.latches[0];
    let exit = info.exit_block(m, index)?;
    for (i, iv) in m.block_args(l.header).iter().enumerate() {
        let edges = incoming(m, region, l.header, i);
        if edges.len() != 2 {
            continue;
        }
        let Some((_, init)) = edges.iter().find(|(from, _)| !l.contains(*from)) else {
            continue;
        };
        let Some((_, next)) = edges.iter().find(|(from, _)| *from == latch) else {
            continue;
        };
        if const_int(m, *init) != Some(0) {
            continue;
        }
        let Some(increment) = m.defining_op(*next).filter(|op| is_unit_increment(m, *op, *iv)) else {
            continue;
        };
        let Some(compare) = m
            .users(*next)
            .into_iter()
            .find(|u| m.tag(*u) == OpTag::CmpI)
        else {
            continue;
        };
        let cmp_result = m.result(compare, 0);
        let branch = m.terminator(latch)?;
        if m.tag(branch) != OpTag::CondBr
            || m.operand(branch, 0) != cmp_result
            || m.users(cmp_result).len() != 1
            || m.successors(branch)[0] != l.header
            || m.successors(branch)[1] != exit
            || m.next_op(compare) != Some(branch)
        {
            continue;
        }
        let increment_first = if m.next_op(increment) == Some(compare) {
            false
        } else if m.parent_block(increment) == Some(l.header) && m.op_position(increment) == 0 {
            true
        } else {
            continue;
        };
        return Some(CountedLoop {
            increment,
            compare,
            branch,
            exit,
            increment_first,
        });
    }
    None
}

/// Whether a value computed inside the would-be task is used outside it.
fn task_escapes(m: &Module, l: &Loop, parent_side: &HashSet<OpId>) -> bool {
    for block in &l.blocks {
        for op in m.block_ops(*block) {
            if parent_side.contains(op) {
                continue;
            }
            for result in m.results(*op) {
                for user in m.users(*result) {
                    let inside = m.parent_block(user).map_or(false, |b| l.contains(b));
                    if !inside || parent_side.contains(&user) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn split_loop(
    m: &mut Module,
    func: OpId,
    region: RegionId,
    info: &LoopInfo,
    index: usize,
    target: TapirTarget,
) -> bool {
    let Some(counted) = match_counted_loop(m, region, info, index) else {
        return false;
    };
    let l = &info.loops[index];
    let entry = m.body_block(func, 0);
    // constants feeding the latch move to the entry block so the task does not define them
    let hoisted: Vec<OpId> = [counted.increment, counted.compare]
        .into_iter()
        .flat_map(|op| m.operands(op).to_vec())
        .filter_map(|operand| m.defining_op(operand))
        .filter(|def| m.tag(*def) == OpTag::Constant && m.parent_block(*def).map_or(false, |b| l.contains(b)))
        .collect();
    let parent_side: HashSet<OpId> = [counted.increment, counted.compare, counted.branch]
        .into_iter()
        .chain(hoisted.iter().copied())
        .collect();
    if task_escapes(m, l, &parent_side) {
        trace!("loop at {:?} carries values out of its body", l.header);
        return false;
    }
    if let Some(term) = m.terminator(entry) {
        for def in hoisted {
            if m.parent_block(def) != Some(entry) {
                m.move_op_before(def, term);
            }
        }
    }

    // [task start, latch start)
    let (first_block, first_pos, second) = if counted.increment_first {
        (l.header, 1, counted.compare)
    } else {
        (l.header, 0, counted.increment)
    };
    let body = m.split_block(first_block, first_pos);
    let Some(task_end) = m.parent_block(second) else {
        return false;
    };
    let latch = m.split_block(task_end, m.op_position(second));

    let sync_region = Builder::at_start(m, entry).sync_region_start();
    Builder::at_end(m, first_block).detach(sync_region, body, latch);
    Builder::at_end(m, task_end).reattach(sync_region, latch);

    let exit_tail = m.split_block(counted.exit, 0);
    Builder::at_end(m, counted.exit).sync(sync_region, exit_tail);

    m.set_attr(
        counted.branch,
        names::LOOP_METADATA,
        Attribute::LoopHints(vec![
            (SPAWN_STRATEGY_HINT.to_string(), STRATEGY_DAC),
            (LOOP_TARGET_HINT.to_string(), target.id()),
        ]),
    );
    trace!("split loop at {:?} into task {:?} and latch {:?}", l.header, body, latch);
    true
}
