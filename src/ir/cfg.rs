// This module provides control-flow analyses over an unstructured region (a function body
// after structured control flow has been lowered to branches): predecessor maps, reverse
// post-order, the dominator tree computed with the iterative Cooper-Harvey-Kennedy scheme,
// and natural loop discovery with nesting. Loop nests are exposed outermost first; the
// tapirification pass walks each nest in reverse to visit inner loops before outer ones.

//! CFG analyses: dominators and natural loops.

use hashbrown::{HashMap, HashSet};

use super::module::{BlockId, Module, RegionId};

/// Predecessor lists of every block in a region.
pub fn predecessors(m: &Module, region: RegionId) -> HashMap<BlockId, Vec<BlockId>> {
    let mut preds: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
    for block in m.region_blocks(region) {
        preds.entry(*block).or_default();
        if let Some(term) = m.terminator(*block) {
            for succ in m.successors(term) {
                preds.entry(*succ).or_default().push(*block);
            }
        }
    }
    preds
}

fn successors(m: &Module, block: BlockId) -> Vec<BlockId> {
    m.terminator(block)
        .map(|t| m.successors(t).to_vec())
        .unwrap_or_default()
}

/// Blocks reachable from the entry, in reverse post-order.
pub fn reverse_post_order(m: &Module, region: RegionId) -> Vec<BlockId> {
    let Some(entry) = m.entry_block(region) else {
        return Vec::new();
    };
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![(entry, 0usize)];
    visited.insert(entry);
    while let Some((block, next)) = stack.pop() {
        let succs = successors(m, block);
        if next < succs.len() {
            stack.push((block, next + 1));
            let s = succs[next];
            if visited.insert(s) {
                stack.push((s, 0));
            }
        } else {
            order.push(block);
        }
    }
    order.reverse();
    order
}

/// Immediate dominators of the reachable blocks of a region.
#[derive(Debug, Clone)]
pub struct Dominators {
    idom: HashMap<BlockId, BlockId>,
    entry: Option<BlockId>,
}

impl Dominators {
    pub fn compute(m: &Module, region: RegionId) -> Self {
        let rpo = reverse_post_order(m, region);
        let index: HashMap<BlockId, usize> = rpo.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let preds = predecessors(m, region);
        let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
        let Some(&entry) = rpo.first() else {
            return Self { idom, entry: None };
        };
        idom.insert(entry, entry);

        let intersect = |idom: &HashMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| {
            while a != b {
                while index[&a] > index[&b] {
                    a = idom[&a];
                }
                while index[&b] > index[&a] {
                    b = idom[&b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for block in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for p in preds.get(block).into_iter().flatten() {
                    if !idom.contains_key(p) {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => *p,
                        Some(current) => intersect(&idom, *p, current),
                    });
                }
                if let Some(n) = new_idom {
                    if idom.get(block) != Some(&n) {
                        idom.insert(*block, n);
                        changed = true;
                    }
                }
            }
        }
        Self {
            idom,
            entry: Some(entry),
        }
    }

    /// `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.idom.contains_key(&b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            if Some(current) == self.entry {
                return false;
            }
            current = self.idom[&current];
        }
    }

    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied().filter(|d| *d != block)
    }
}

/// A natural loop.
#[derive(Debug, Clone)]
pub struct Loop {
    pub header: BlockId,
    pub latches: Vec<BlockId>,
    pub blocks: HashSet<BlockId>,
    pub parent: Option<usize>,
    pub depth: usize,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }
}

/// Natural loops of a region with their nesting.
#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub loops: Vec<Loop>,
}

impl LoopInfo {
    pub fn compute(m: &Module, region: RegionId) -> Self {
        let doms = Dominators::compute(m, region);
        let preds = predecessors(m, region);
        let rpo = reverse_post_order(m, region);

        let mut by_header: Vec<(BlockId, Vec<BlockId>)> = Vec::new();
        for block in &rpo {
            for succ in successors(m, *block) {
                if doms.dominates(succ, *block) {
                    match by_header.iter_mut().find(|(h, _)| *h == succ) {
                        Some((_, latches)) => latches.push(*block),
                        None => by_header.push((succ, vec![*block])),
                    }
                }
            }
        }

        let mut loops: Vec<Loop> = by_header
            .into_iter()
            .map(|(header, latches)| {
                let mut blocks = HashSet::new();
                blocks.insert(header);
                let mut work: Vec<BlockId> = latches.clone();
                while let Some(b) = work.pop() {
                    if blocks.insert(b) {
                        work.extend(preds.get(&b).into_iter().flatten().copied());
                    }
                }
                Loop {
                    header,
                    latches,
                    blocks,
                    parent: None,
                    depth: 1,
                }
            })
            .collect();

        // parent = smallest other loop containing this header
        for i in 0..loops.len() {
            let header = loops[i].header;
            let parent = (0..loops.len())
                .filter(|j| *j != i && loops[*j].contains(header) && loops[*j].blocks.len() > loops[i].blocks.len())
                .min_by_key(|j| loops[*j].blocks.len());
            loops[i].parent = parent;
        }
        for i in 0..loops.len() {
            let mut depth = 1;
            let mut p = loops[i].parent;
            while let Some(j) = p {
                depth += 1;
                p = loops[j].parent;
            }
            loops[i].depth = depth;
        }
        Self { loops }
    }

    /// Loop nests, each listed outermost first (breadth-first).
    pub fn nests(&self) -> Vec<Vec<usize>> {
        let mut nests = Vec::new();
        for (i, l) in self.loops.iter().enumerate() {
            if l.parent.is_some() {
                continue;
            }
            let mut nest = vec![i];
            let mut cursor = 0;
            while cursor < nest.len() {
                let current = nest[cursor];
                for (j, inner) in self.loops.iter().enumerate() {
                    if inner.parent == Some(current) {
                        nest.push(j);
                    }
                }
                cursor += 1;
            }
            nests.push(nest);
        }
        nests
    }

    /// Single block outside the loop that loop blocks branch to.
    pub fn exit_block(&self, m: &Module, index: usize) -> Option<BlockId> {
        let l = &self.loops[index];
        let mut exit = None;
        for block in &l.blocks {
            for succ in successors(m, *block) {
                if l.contains(succ) {
                    continue;
                }
                match exit {
                    None => exit = Some(succ),
                    Some(e) if e == succ => {}
                    Some(_) => return None,
                }
            }
        }
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use crate::ir::ops::Visibility;
    use crate::ir::types::{FunctionType, Type};

    /// entry -> outer(header) -> inner(header, self loop) -> outer_latch -> outer | exit
    #[test]
    fn test_nested_loops() {
        let mut m = Module::new("loops");
        let body = m.body();
        let f = Builder::at_end(&mut m, body).func("f", FunctionType::new(vec![Type::i1()], vec![]), Visibility::Public);
        let region = m.region(f, 0);
        let entry = m.body_block(f, 0);
        let cond = m.block_arg(entry, 0);
        let outer = m.create_block(&[]);
        let inner = m.create_block(&[]);
        let latch = m.create_block(&[]);
        let exit = m.create_block(&[]);
        for b in [outer, inner, latch, exit] {
            m.push_block(region, b);
        }
        Builder::at_end(&mut m, entry).br(outer, vec![]);
        Builder::at_end(&mut m, outer).br(inner, vec![]);
        Builder::at_end(&mut m, inner).cond_br(cond, inner, vec![], latch, vec![]);
        Builder::at_end(&mut m, latch).cond_br(cond, outer, vec![], exit, vec![]);
        Builder::at_end(&mut m, exit).return_(vec![]);

        let doms = Dominators::compute(&m, region);
        assert!(doms.dominates(entry, exit));
        assert!(doms.dominates(outer, latch));
        assert!(!doms.dominates(latch, outer));

        let info = LoopInfo::compute(&m, region);
        assert_eq!(info.loops.len(), 2);
        let nests = info.nests();
        assert_eq!(nests.len(), 1);
        let outer_idx = nests[0][0];
        let inner_idx = nests[0][1];
        assert_eq!(info.loops[outer_idx].header, outer);
        assert_eq!(info.loops[inner_idx].header, inner);
        assert_eq!(info.loops[inner_idx].depth, 2);
        assert_eq!(info.exit_block(&m, outer_idx), Some(exit));
        assert_eq!(info.exit_block(&m, inner_idx), Some(latch));
    }
}
