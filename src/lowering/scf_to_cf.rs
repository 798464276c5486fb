// This module flattens structured control flow into an unstructured CFG of branches. Ops are
// processed innermost first so that, by the time an op is lowered, every block directly inside
// its regions ends either in its own structured terminator (yield, condition, env yield) or in a
// branch produced by an inner lowering. Lowering an op splits its parent block after it; the
// continuation block receives the op's results as block arguments. The region blocks are moved
// into the parent region and their structured terminators are replaced by branches.
//
// Loops are emitted in rotated form: the entry guard `lb < ub` branches either into the body
// (with `lb` and the initial iteration values) or straight to the continuation, and the latch
// computes `iv + step` and repeats the comparison. This keeps one compare per iteration at the
// bottom of the body, which is the shape tapirification and the LLVM loop passes recognise.

//! Structured control flow to CFG.

use super::Pass;
use crate::core::error::PassResult;
use crate::core::session::PipelineSession;
use crate::ir::builder::Builder;
use crate::ir::module::{BlockId, Module, OpId, RegionId, ValueId};
use crate::ir::ops::{BinOp, IntPredicate, OpTag};

pub struct ScfToCf;

impl Pass for ScfToCf {
    fn name(&self) -> &'static str {
        "scf-to-cf"
    }

    fn run(&self, m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()> {
        let ops: Vec<OpId> = m
            .walk()
            .into_iter()
            .filter(|op| {
                matches!(
                    m.tag(*op),
                    OpTag::If | OpTag::For | OpTag::While | OpTag::EnvRegion | OpTag::Parallel
                )
            })
            .collect();
        // reverse pre-order visits children before their parents
        for op in ops.into_iter().rev() {
            match m.tag(op) {
                OpTag::If => lower_if(m, op),
                OpTag::For => lower_for(m, op),
                OpTag::While => lower_while(m, op),
                OpTag::EnvRegion => lower_env_region(m, op),
                _ => {
                    session.error(Some(op), "parallel loop must be outlined before scf-to-cf");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Split the block of `op` right after it and turn the results of `op` into
/// arguments of the continuation block.
fn split_after(m: &mut Module, op: OpId) -> Option<(BlockId, RegionId, BlockId)> {
    let block = m.parent_block(op)?;
    let region = m.block_parent_region(block)?;
    let pos = m.op_position(op) + 1;
    let cont = m.split_block(block, pos);
    for result in m.results(op).to_vec() {
        let ty = m.value_type(result).clone();
        let arg = m.add_block_arg(cont, ty);
        m.replace_all_uses(result, arg);
    }
    Some((block, region, cont))
}

/// Blocks of region `index` of `op`, moved to the end of `dest`.
fn move_region(m: &mut Module, op: OpId, index: usize, dest: RegionId) -> Vec<BlockId> {
    let src = m.region(op, index);
    let blocks = m.region_blocks(src).to_vec();
    m.take_region_blocks(src, dest);
    blocks
}

/// Terminators of `blocks` with tag `tag`, removed; returns their blocks and operands.
fn take_terminators(m: &mut Module, blocks: &[BlockId], tag: OpTag) -> Vec<(BlockId, Vec<ValueId>)> {
    let mut out = Vec::new();
    for block in blocks {
        if let Some(term) = m.terminator(*block) {
            if m.tag(term) == tag {
                out.push((*block, m.operands(term).to_vec()));
                m.erase_op(term);
            }
        }
    }
    out
}

fn lower_if(m: &mut Module, op: OpId) {
    let cond = m.operand(op, 0);
    let Some((block, region, cont)) = split_after(m, op) else {
        return;
    };
    let then_entry = m.body_block(op, 0);
    let else_entry = m.body_block(op, 1);
    let mut blocks = move_region(m, op, 0, region);
    blocks.extend(move_region(m, op, 1, region));
    for (yield_block, values) in take_terminators(m, &blocks, OpTag::Yield) {
        Builder::at_end(m, yield_block).br(cont, values);
    }
    m.erase_op(op);
    Builder::at_end(m, block).cond_br(cond, then_entry, vec![], else_entry, vec![]);
}

fn lower_for(m: &mut Module, op: OpId) {
    let operands = m.operands(op).to_vec();
    let (lower, upper, step) = (operands[0], operands[1], operands[2]);
    let inits = operands[3..].to_vec();
    let Some((block, region, cont)) = split_after(m, op) else {
        return;
    };
    let body = m.body_block(op, 0);
    let iv = m.block_arg(body, 0);
    let blocks = move_region(m, op, 0, region);
    for (latch, values) in take_terminators(m, &blocks, OpTag::Yield) {
        let mut b = Builder::at_end(m, latch);
        let next = b.binary(BinOp::AddI, iv, step);
        let again = b.cmpi(IntPredicate::Slt, next, upper);
        let mut body_args = vec![next];
        body_args.extend(values.iter().copied());
        b.cond_br(again, body, body_args, cont, values);
    }
    m.erase_op(op);

    let mut b = Builder::at_end(m, block);
    let enter = b.cmpi(IntPredicate::Slt, lower, upper);
    let mut body_args = vec![lower];
    body_args.extend(inits.iter().copied());
    b.cond_br(enter, body, body_args, cont, inits);
}

fn lower_while(m: &mut Module, op: OpId) {
    let inits = m.operands(op).to_vec();
    let Some((block, region, cont)) = split_after(m, op) else {
        return;
    };
    let before = m.body_block(op, 0);
    let after = m.body_block(op, 1);
    let before_blocks = move_region(m, op, 0, region);
    let after_blocks = move_region(m, op, 1, region);
    for (cond_block, operands) in take_terminators(m, &before_blocks, OpTag::Condition) {
        let Some((cond, forwarded)) = operands.split_first() else {
            continue;
        };
        Builder::at_end(m, cond_block).cond_br(*cond, after, forwarded.to_vec(), cont, forwarded.to_vec());
    }
    for (yield_block, values) in take_terminators(m, &after_blocks, OpTag::Yield) {
        Builder::at_end(m, yield_block).br(before, values);
    }
    m.erase_op(op);
    Builder::at_end(m, block).br(before, inits);
}

fn lower_env_region(m: &mut Module, op: OpId) {
    let Some((block, region, cont)) = split_after(m, op) else {
        return;
    };
    let entry = m.body_block(op, 0);
    let blocks = move_region(m, op, 0, region);
    for (yield_block, values) in take_terminators(m, &blocks, OpTag::EnvYield) {
        Builder::at_end(m, yield_block).br(cont, values);
    }
    m.erase_op(op);
    Builder::at_end(m, block).br(entry, vec![]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::{build_func, TestContext};
    use crate::ir::attrs::{DeviceCaps, EnvAttr};
    use crate::ir::types::Type;
    use crate::ir::verify::verify_module;

    fn structured_left(m: &Module) -> bool {
        m.walk().into_iter().any(|o| {
            matches!(
                m.tag(o),
                OpTag::If | OpTag::For | OpTag::While | OpTag::EnvRegion | OpTag::Yield
            )
        })
    }

    #[test]
    fn test_for_becomes_rotated_loop() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("for");
        let (f, entry) = build_func(&mut m, "sum", vec![Type::Index], vec![Type::Index]);
        let n = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let zero = b.const_index(0);
        let one = b.const_index(1);
        let for_op = b.for_(zero, n, one, vec![zero]);
        let total = b.module().result(for_op, 0);
        b.return_(vec![total]);
        let body = m.body_block(for_op, 0);
        let iv = m.block_arg(body, 0);
        let acc = m.block_arg(body, 1);
        let mut fb = Builder::at_end(&mut m, body);
        let next = fb.binary(BinOp::AddI, acc, iv);
        fb.yield_(vec![next]);

        ScfToCf.run(&mut m, &session).unwrap();
        verify_module(&m).unwrap();
        assert!(!structured_left(&m));

        let blocks = m.region_blocks(m.region(f, 0)).to_vec();
        assert_eq!(blocks.len(), 3);
        let guard = m.terminator(entry).unwrap();
        assert_eq!(m.tag(guard), OpTag::CondBr);
        assert_eq!(m.successors(guard), &[body, blocks[1]][..]);
        let latch = m.terminator(body).unwrap();
        assert_eq!(m.tag(latch), OpTag::CondBr);
        assert_eq!(m.successors(latch)[0], body);
    }

    #[test]
    fn test_nested_if_in_loop() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("nested");
        let (_, entry) = build_func(&mut m, "f", vec![Type::Index, Type::i1()], vec![Type::Index]);
        let n = m.block_arg(entry, 0);
        let flag = m.block_arg(entry, 1);
        let mut b = Builder::at_end(&mut m, entry);
        let zero = b.const_index(0);
        let one = b.const_index(1);
        let for_op = b.for_(zero, n, one, vec![zero]);
        let total = b.module().result(for_op, 0);
        b.return_(vec![total]);
        let body = m.body_block(for_op, 0);
        let iv = m.block_arg(body, 0);
        let acc = m.block_arg(body, 1);
        let mut fb = Builder::at_end(&mut m, body);
        let if_op = fb.if_(flag, vec![Type::Index]);
        let picked = fb.module().result(if_op, 0);
        fb.yield_(vec![picked]);
        let then_block = m.body_block(if_op, 0);
        let else_block = m.body_block(if_op, 1);
        let mut tb = Builder::at_end(&mut m, then_block);
        let s = tb.binary(BinOp::AddI, acc, iv);
        tb.yield_(vec![s]);
        Builder::at_end(&mut m, else_block).yield_(vec![acc]);

        ScfToCf.run(&mut m, &session).unwrap();
        verify_module(&m).unwrap();
        assert!(!structured_left(&m));
    }

    #[test]
    fn test_while_and_env_region() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut m = Module::new("while");
        let (_, entry) = build_func(&mut m, "f", vec![Type::Index], vec![Type::Index]);
        let n = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let zero = b.const_index(0);
        let env = EnvAttr::Device {
            name: "gpu".into(),
            caps: DeviceCaps { fp16: true, fp64: true },
        };
        let region = b.env_region(env, vec![], vec![Type::Index]);
        let region_result = b.module().result(region, 0);
        let w = b.while_(vec![zero], vec![Type::Index]);
        let out = b.module().result(w, 0);
        let sum = b.binary(BinOp::AddI, out, region_result);
        b.return_(vec![sum]);

        let rb = m.body_block(region, 0);
        Builder::at_end(&mut m, rb).env_yield(vec![n]);
        let before = m.body_block(w, 0);
        let after = m.body_block(w, 1);
        let i = m.block_arg(before, 0);
        let mut bb = Builder::at_end(&mut m, before);
        let c = bb.cmpi(IntPredicate::Slt, i, n);
        bb.condition(c, vec![i]);
        let j = m.block_arg(after, 0);
        let mut ab = Builder::at_end(&mut m, after);
        let one = ab.const_index(1);
        let k = ab.binary(BinOp::AddI, j, one);
        ab.yield_(vec![k]);

        ScfToCf.run(&mut m, &session).unwrap();
        verify_module(&m).unwrap();
        assert!(!structured_left(&m));
        assert!(m.walk().iter().all(|o| m.tag(*o) != OpTag::Condition));
    }
}
