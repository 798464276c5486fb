//! Block-local common subexpression elimination of pure ops.

use hashbrown::HashMap;

use super::Pass;
use crate::core::error::PassResult;
use crate::core::session::PipelineSession;
use crate::ir::module::{BlockId, Module, OpId, ValueId};
use crate::ir::ops::OpTag;
use crate::ir::types::Type;

pub struct Cse;

impl Pass for Cse {
    fn name(&self) -> &'static str {
        "cse"
    }

    fn run(&self, m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()> {
        let mut blocks = vec![m.body()];
        for op in m.walk() {
            for region in m.regions(op) {
                blocks.extend(m.region_blocks(*region).iter().copied());
            }
        }
        let erased: usize = blocks.into_iter().map(|block| cse_block(m, block)).sum();
        session.record_ops_erased(erased);
        Ok(())
    }
}

/// Replace every pure op equal to an earlier one in `block`. Returns the
/// number of ops erased.
fn cse_block(m: &mut Module, block: BlockId) -> usize {
    let mut seen: HashMap<(OpTag, Vec<ValueId>), Vec<OpId>> = HashMap::new();
    let mut erased = 0;
    for op in m.block_ops(block).to_vec() {
        if !m.kind(op).is_pure() || !m.regions(op).is_empty() {
            continue;
        }
        let key = (m.tag(op), m.operands(op).to_vec());
        let types: Vec<Type> = m.results(op).iter().map(|r| m.value_type(*r).clone()).collect();
        let candidates = seen.entry(key).or_default();
        let existing = candidates.iter().copied().find(|prev| {
            m.kind(*prev) == m.kind(op)
                && same_attrs(m, *prev, op)
                && m.results(*prev)
                    .iter()
                    .map(|r| m.value_type(*r))
                    .eq(types.iter())
        });
        match existing {
            Some(prev) => {
                let results = m.results(prev).to_vec();
                m.replace_op(op, &results);
                erased += 1;
            }
            None => candidates.push(op),
        }
    }
    erased
}

fn same_attrs(m: &Module, a: OpId, b: OpId) -> bool {
    m.attrs(a).count() == m.attrs(b).count() && m.attrs(a).all(|(name, value)| m.attr(b, name) == Some(value))
}
