// This module implements the arena that stores an IR module. Operations, values, blocks and
// regions live in four vectors and are addressed by stable `u32` handles, so rewriting never
// invalidates a handle held elsewhere: erased operations are tombstoned and simply ignored
// by walkers and the rewrite driver. Every value tracks its uses (owner op plus operand
// index) so replacement is a direct walk over the use list. The mutation API covers what
// the canonicalizer and the lowering passes need: creating and placing ops, operand and use
// rewiring, result retyping, block splitting and inlining, region moves, deep cloning, and
// ancestry queries. When change tracking is on, every created or modified op is appended to
// a dirty list that the greedy rewrite driver drains into its worklist.

//! Arena storage for an IR module.

use hashbrown::HashMap;

use super::attrs::Attribute;
use super::ops::{OpKind, OpTag};
use super::types::Type;
use crate::core::error::{IrError, IrResult};

macro_rules! handle {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

handle!(OpId);
handle!(ValueId);
handle!(BlockId);
handle!(RegionId);

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef {
    OpResult { op: OpId, index: usize },
    BlockArg { block: BlockId, index: usize },
}

/// One use of a value: the owning op and the operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub op: OpId,
    pub index: usize,
}

#[derive(Debug, Clone)]
struct OpData {
    kind: OpKind,
    operands: Vec<ValueId>,
    results: Vec<ValueId>,
    regions: Vec<RegionId>,
    successors: Vec<BlockId>,
    attrs: HashMap<String, Attribute>,
    parent: Option<BlockId>,
    erased: bool,
}

#[derive(Debug, Clone)]
struct ValueData {
    ty: Type,
    def: ValueDef,
    uses: Vec<Use>,
}

#[derive(Debug, Clone)]
struct BlockData {
    args: Vec<ValueId>,
    ops: Vec<OpId>,
    parent: Option<RegionId>,
    erased: bool,
}

#[derive(Debug, Clone)]
struct RegionData {
    blocks: Vec<BlockId>,
    parent: Option<OpId>,
}

/// An IR module: a named top-level block holding functions.
#[derive(Debug, Clone)]
pub struct Module {
    name: String,
    ops: Vec<OpData>,
    values: Vec<ValueData>,
    blocks: Vec<BlockData>,
    regions: Vec<RegionData>,
    body: BlockId,
    track_changes: bool,
    dirty: Vec<OpId>,
}

impl Module {
    /// Create an empty module. The name doubles as the object cache key.
    pub fn new(name: impl Into<String>) -> Self {
        let mut module = Self {
            name: name.into(),
            ops: Vec::new(),
            values: Vec::new(),
            blocks: Vec::new(),
            regions: vec![RegionData {
                blocks: Vec::new(),
                parent: None,
            }],
            body: BlockId(0),
            track_changes: false,
            dirty: Vec::new(),
        };
        let body = module.create_block(&[]);
        module.push_block(RegionId(0), body);
        module.body = body;
        module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Top-level block holding the functions.
    pub fn body(&self) -> BlockId {
        self.body
    }

    // ---------------------------------------------------------------------
    // Change tracking
    // ---------------------------------------------------------------------

    pub fn set_track_changes(&mut self, enabled: bool) {
        self.track_changes = enabled;
        self.dirty.clear();
    }

    /// Ops created or modified since the last call.
    pub fn take_dirty(&mut self) -> Vec<OpId> {
        std::mem::take(&mut self.dirty)
    }

    fn touch(&mut self, op: OpId) {
        if self.track_changes {
            self.dirty.push(op);
        }
    }

    // ---------------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------------

    /// Create a detached op with fresh results and empty regions.
    pub fn create_op(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
        num_regions: usize,
    ) -> OpId {
        let id = OpId(self.ops.len() as u32);
        let results = result_types
            .into_iter()
            .enumerate()
            .map(|(index, ty)| self.new_value(ty, ValueDef::OpResult { op: id, index }))
            .collect();
        let regions = (0..num_regions)
            .map(|_| {
                let rid = RegionId(self.regions.len() as u32);
                self.regions.push(RegionData {
                    blocks: Vec::new(),
                    parent: Some(id),
                });
                rid
            })
            .collect();
        for (index, value) in operands.iter().enumerate() {
            self.values[value.index()].uses.push(Use { op: id, index });
        }
        self.ops.push(OpData {
            kind,
            operands,
            results,
            regions,
            successors: Vec::new(),
            attrs: HashMap::new(),
            parent: None,
            erased: false,
        });
        self.touch(id);
        id
    }

    /// Create a detached block with the given argument types.
    pub fn create_block(&mut self, arg_types: &[Type]) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData {
            args: Vec::new(),
            ops: Vec::new(),
            parent: None,
            erased: false,
        });
        for ty in arg_types {
            self.add_block_arg(id, ty.clone());
        }
        id
    }

    fn new_value(&mut self, ty: Type, def: ValueDef) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueData {
            ty,
            def,
            uses: Vec::new(),
        });
        id
    }

    pub fn add_block_arg(&mut self, block: BlockId, ty: Type) -> ValueId {
        let index = self.blocks[block.index()].args.len();
        let value = self.new_value(ty, ValueDef::BlockArg { block, index });
        self.blocks[block.index()].args.push(value);
        value
    }

    /// Remove an unused block argument, renumbering the ones after it.
    pub fn erase_block_arg(&mut self, block: BlockId, index: usize) -> IrResult<()> {
        let value = self.blocks[block.index()].args[index];
        if !self.values[value.index()].uses.is_empty() {
            return Err(IrError::StillInUse {
                what: format!("block argument {}", index),
            });
        }
        self.blocks[block.index()].args.remove(index);
        let args = self.blocks[block.index()].args.clone();
        for (i, arg) in args.into_iter().enumerate().skip(index) {
            self.values[arg.index()].def = ValueDef::BlockArg { block, index: i };
        }
        Ok(())
    }

    /// Append a detached block to a region.
    pub fn push_block(&mut self, region: RegionId, block: BlockId) {
        self.blocks[block.index()].parent = Some(region);
        self.regions[region.index()].blocks.push(block);
    }

    /// Insert a detached block into a region right after `after`.
    pub fn insert_block_after(&mut self, after: BlockId, block: BlockId) {
        let region = self.blocks[after.index()]
            .parent
            .expect("anchor block must be attached");
        let pos = self.block_position(region, after) + 1;
        self.blocks[block.index()].parent = Some(region);
        self.regions[region.index()].blocks.insert(pos, block);
    }

    /// Insert a detached block into a region right before `before`.
    pub fn insert_block_before(&mut self, before: BlockId, block: BlockId) {
        let region = self.blocks[before.index()]
            .parent
            .expect("anchor block must be attached");
        let pos = self.block_position(region, before);
        self.blocks[block.index()].parent = Some(region);
        self.regions[region.index()].blocks.insert(pos, block);
    }

    fn block_position(&self, region: RegionId, block: BlockId) -> usize {
        self.regions[region.index()]
            .blocks
            .iter()
            .position(|b| *b == block)
            .expect("block must belong to its parent region")
    }

    // ---------------------------------------------------------------------
    // Placement
    // ---------------------------------------------------------------------

    pub fn append_op(&mut self, block: BlockId, op: OpId) {
        self.ops[op.index()].parent = Some(block);
        self.blocks[block.index()].ops.push(op);
        self.touch(op);
    }

    pub fn insert_op(&mut self, block: BlockId, pos: usize, op: OpId) {
        self.ops[op.index()].parent = Some(block);
        self.blocks[block.index()].ops.insert(pos, op);
        self.touch(op);
    }

    pub fn insert_op_before(&mut self, anchor: OpId, op: OpId) {
        let block = self.parent_block(anchor).expect("anchor op must be attached");
        let pos = self.op_position(anchor);
        self.insert_op(block, pos, op);
    }

    pub fn insert_op_after(&mut self, anchor: OpId, op: OpId) {
        let block = self.parent_block(anchor).expect("anchor op must be attached");
        let pos = self.op_position(anchor) + 1;
        self.insert_op(block, pos, op);
    }

    /// Position of an attached op inside its block.
    pub fn op_position(&self, op: OpId) -> usize {
        let block = self.ops[op.index()].parent.expect("op must be attached");
        self.blocks[block.index()]
            .ops
            .iter()
            .position(|o| *o == op)
            .expect("op must belong to its parent block")
    }

    /// Remove an op from its block without erasing it.
    pub fn detach_op(&mut self, op: OpId) {
        if let Some(block) = self.ops[op.index()].parent.take() {
            self.blocks[block.index()].ops.retain(|o| *o != op);
        }
    }

    pub fn move_op_before(&mut self, op: OpId, anchor: OpId) {
        self.detach_op(op);
        self.insert_op_before(anchor, op);
    }

    pub fn move_op_to_end(&mut self, op: OpId, block: BlockId) {
        self.detach_op(op);
        self.append_op(block, op);
    }

    // ---------------------------------------------------------------------
    // Op accessors
    // ---------------------------------------------------------------------

    pub fn is_alive(&self, op: OpId) -> bool {
        !self.ops[op.index()].erased
    }

    pub fn kind(&self, op: OpId) -> &OpKind {
        &self.ops[op.index()].kind
    }

    pub fn set_kind(&mut self, op: OpId, kind: OpKind) {
        self.ops[op.index()].kind = kind;
        self.touch(op);
    }

    pub fn tag(&self, op: OpId) -> OpTag {
        self.ops[op.index()].kind.tag()
    }

    pub fn operands(&self, op: OpId) -> &[ValueId] {
        &self.ops[op.index()].operands
    }

    pub fn operand(&self, op: OpId, index: usize) -> ValueId {
        self.ops[op.index()].operands[index]
    }

    pub fn num_operands(&self, op: OpId) -> usize {
        self.ops[op.index()].operands.len()
    }

    pub fn results(&self, op: OpId) -> &[ValueId] {
        &self.ops[op.index()].results
    }

    pub fn result(&self, op: OpId, index: usize) -> ValueId {
        self.ops[op.index()].results[index]
    }

    pub fn num_results(&self, op: OpId) -> usize {
        self.ops[op.index()].results.len()
    }

    pub fn regions(&self, op: OpId) -> &[RegionId] {
        &self.ops[op.index()].regions
    }

    pub fn region(&self, op: OpId, index: usize) -> RegionId {
        self.ops[op.index()].regions[index]
    }

    pub fn successors(&self, op: OpId) -> &[BlockId] {
        &self.ops[op.index()].successors
    }

    pub fn set_successors(&mut self, op: OpId, successors: Vec<BlockId>) {
        self.ops[op.index()].successors = successors;
        self.touch(op);
    }

    pub fn set_successor(&mut self, op: OpId, index: usize, block: BlockId) {
        self.ops[op.index()].successors[index] = block;
        self.touch(op);
    }

    pub fn attr(&self, op: OpId, name: &str) -> Option<&Attribute> {
        self.ops[op.index()].attrs.get(name)
    }

    pub fn attrs(&self, op: OpId) -> impl Iterator<Item = (&String, &Attribute)> {
        self.ops[op.index()].attrs.iter()
    }

    pub fn set_attr(&mut self, op: OpId, name: &str, value: Attribute) {
        self.ops[op.index()].attrs.insert(name.to_string(), value);
    }

    pub fn remove_attr(&mut self, op: OpId, name: &str) -> Option<Attribute> {
        self.ops[op.index()].attrs.remove(name)
    }

    pub fn parent_block(&self, op: OpId) -> Option<BlockId> {
        self.ops[op.index()].parent
    }

    /// Op owning the region that contains `op`.
    pub fn parent_op(&self, op: OpId) -> Option<OpId> {
        let block = self.parent_block(op)?;
        self.block_parent_op(block)
    }

    /// Closest enclosing op with the given tag.
    pub fn parent_of_tag(&self, op: OpId, tag: OpTag) -> Option<OpId> {
        let mut current = self.parent_op(op);
        while let Some(p) = current {
            if self.tag(p) == tag {
                return Some(p);
            }
            current = self.parent_op(p);
        }
        None
    }

    /// Enclosing function of an op.
    pub fn parent_func(&self, op: OpId) -> Option<OpId> {
        if self.tag(op) == OpTag::Func {
            return Some(op);
        }
        self.parent_of_tag(op, OpTag::Func)
    }

    /// Next op in the same block.
    pub fn next_op(&self, op: OpId) -> Option<OpId> {
        let block = self.parent_block(op)?;
        let pos = self.op_position(op);
        self.blocks[block.index()].ops.get(pos + 1).copied()
    }

    pub fn prev_op(&self, op: OpId) -> Option<OpId> {
        let block = self.parent_block(op)?;
        let pos = self.op_position(op);
        pos.checked_sub(1)
            .map(|p| self.blocks[block.index()].ops[p])
    }

    // ---------------------------------------------------------------------
    // Block and region accessors
    // ---------------------------------------------------------------------

    pub fn block_ops(&self, block: BlockId) -> &[OpId] {
        &self.blocks[block.index()].ops
    }

    pub fn block_args(&self, block: BlockId) -> &[ValueId] {
        &self.blocks[block.index()].args
    }

    pub fn block_arg(&self, block: BlockId, index: usize) -> ValueId {
        self.blocks[block.index()].args[index]
    }

    pub fn block_parent_region(&self, block: BlockId) -> Option<RegionId> {
        self.blocks[block.index()].parent
    }

    pub fn block_parent_op(&self, block: BlockId) -> Option<OpId> {
        let region = self.blocks[block.index()].parent?;
        self.regions[region.index()].parent
    }

    pub fn is_block_alive(&self, block: BlockId) -> bool {
        !self.blocks[block.index()].erased
    }

    /// Last op of a block if it is a terminator.
    pub fn terminator(&self, block: BlockId) -> Option<OpId> {
        let last = *self.blocks[block.index()].ops.last()?;
        self.kind(last).is_terminator().then_some(last)
    }

    pub fn region_blocks(&self, region: RegionId) -> &[BlockId] {
        &self.regions[region.index()].blocks
    }

    pub fn region_parent(&self, region: RegionId) -> Option<OpId> {
        self.regions[region.index()].parent
    }

    pub fn entry_block(&self, region: RegionId) -> Option<BlockId> {
        self.regions[region.index()].blocks.first().copied()
    }

    /// Entry block of region `index` of `op`; structured ops always have one.
    pub fn body_block(&self, op: OpId, index: usize) -> BlockId {
        self.entry_block(self.region(op, index))
            .expect("structured region must have an entry block")
    }

    // ---------------------------------------------------------------------
    // Values
    // ---------------------------------------------------------------------

    pub fn value_type(&self, value: ValueId) -> &Type {
        &self.values[value.index()].ty
    }

    /// Retype a value in place; users are responsible for consistency.
    pub fn set_value_type(&mut self, value: ValueId, ty: Type) {
        self.values[value.index()].ty = ty;
        if let ValueDef::OpResult { op, .. } = self.values[value.index()].def {
            self.touch(op);
        }
    }

    pub fn value_def(&self, value: ValueId) -> ValueDef {
        self.values[value.index()].def
    }

    pub fn defining_op(&self, value: ValueId) -> Option<OpId> {
        match self.values[value.index()].def {
            ValueDef::OpResult { op, .. } => Some(op),
            ValueDef::BlockArg { .. } => None,
        }
    }

    /// Defining op if it has the given tag.
    pub fn defining_op_of(&self, value: ValueId, tag: OpTag) -> Option<OpId> {
        self.defining_op(value).filter(|op| self.tag(*op) == tag)
    }

    pub fn uses(&self, value: ValueId) -> &[Use] {
        &self.values[value.index()].uses
    }

    pub fn has_uses(&self, value: ValueId) -> bool {
        !self.values[value.index()].uses.is_empty()
    }

    pub fn has_one_use(&self, value: ValueId) -> bool {
        self.values[value.index()].uses.len() == 1
    }

    /// Distinct ops using a value, in use order.
    pub fn users(&self, value: ValueId) -> Vec<OpId> {
        let mut users: Vec<OpId> = Vec::new();
        for u in &self.values[value.index()].uses {
            if !users.contains(&u.op) {
                users.push(u.op);
            }
        }
        users
    }

    /// Block a value is defined in.
    pub fn value_parent_block(&self, value: ValueId) -> Option<BlockId> {
        match self.values[value.index()].def {
            ValueDef::OpResult { op, .. } => self.parent_block(op),
            ValueDef::BlockArg { block, .. } => Some(block),
        }
    }

    pub fn value_parent_region(&self, value: ValueId) -> Option<RegionId> {
        self.value_parent_block(value)
            .and_then(|b| self.block_parent_region(b))
    }

    /// `value` is defined inside `region`, at any nesting depth.
    pub fn is_defined_in_region(&self, value: ValueId, region: RegionId) -> bool {
        let mut current = self.value_parent_region(value);
        while let Some(r) = current {
            if r == region {
                return true;
            }
            current = self
                .region_parent(r)
                .and_then(|op| self.parent_block(op))
                .and_then(|b| self.block_parent_region(b));
        }
        false
    }

    /// `op` is nested (strictly) inside `ancestor`.
    pub fn is_proper_ancestor(&self, ancestor: OpId, op: OpId) -> bool {
        let mut current = self.parent_op(op);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent_op(p);
        }
        false
    }

    // ---------------------------------------------------------------------
    // Use rewiring
    // ---------------------------------------------------------------------

    pub fn set_operand(&mut self, op: OpId, index: usize, value: ValueId) {
        let old = self.ops[op.index()].operands[index];
        if old == value {
            return;
        }
        self.remove_use(old, Use { op, index });
        self.values[value.index()].uses.push(Use { op, index });
        self.ops[op.index()].operands[index] = value;
        self.touch(op);
    }

    /// Replace the whole operand list.
    pub fn set_operands(&mut self, op: OpId, operands: Vec<ValueId>) {
        self.drop_operand_uses(op);
        for (index, value) in operands.iter().enumerate() {
            self.values[value.index()].uses.push(Use { op, index });
        }
        self.ops[op.index()].operands = operands;
        self.touch(op);
    }

    fn drop_operand_uses(&mut self, op: OpId) {
        let operands = std::mem::take(&mut self.ops[op.index()].operands);
        for (index, value) in operands.iter().enumerate() {
            self.remove_use(*value, Use { op, index });
        }
    }

    fn remove_use(&mut self, value: ValueId, u: Use) {
        let uses = &mut self.values[value.index()].uses;
        if let Some(pos) = uses.iter().position(|x| *x == u) {
            uses.swap_remove(pos);
        }
    }

    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        self.replace_uses_if(old, new, |_, _| true);
    }

    pub fn replace_all_uses_except(&mut self, old: ValueId, new: ValueId, except: OpId) {
        self.replace_uses_if(old, new, |_, u| u.op != except);
    }

    /// Replace the uses of `old` selected by `pred`.
    pub fn replace_uses_if<F>(&mut self, old: ValueId, new: ValueId, pred: F)
    where
        F: Fn(&Module, Use) -> bool,
    {
        if old == new {
            return;
        }
        let uses: Vec<Use> = self.values[old.index()].uses.clone();
        for u in uses {
            if pred(self, u) {
                self.set_operand(u.op, u.index, new);
            }
        }
    }

    /// Replace every result of `op` by the matching value and erase `op`.
    pub fn replace_op(&mut self, op: OpId, values: &[ValueId]) {
        let results = self.ops[op.index()].results.clone();
        debug_assert_eq!(results.len(), values.len(), "replacement arity mismatch");
        for (old, new) in results.into_iter().zip(values) {
            self.replace_all_uses(old, *new);
        }
        self.erase_op(op);
    }

    /// Erase an op with its nested regions. Results must be unused.
    pub fn erase_op(&mut self, op: OpId) {
        if self.ops[op.index()].erased {
            return;
        }
        debug_assert!(
            self.ops[op.index()]
                .results
                .iter()
                .all(|r| self.values[r.index()].uses.iter().all(|u| self.is_proper_ancestor(op, u.op) || u.op == op)),
            "erasing {} whose results are still used",
            self.kind(op).name()
        );
        let regions = self.ops[op.index()].regions.clone();
        for region in regions {
            let blocks = self.regions[region.index()].blocks.clone();
            for block in blocks {
                self.erase_block_contents(block);
            }
        }
        self.detach_op(op);
        self.drop_operand_uses(op);
        self.ops[op.index()].erased = true;
    }

    fn erase_block_contents(&mut self, block: BlockId) {
        let ops = self.blocks[block.index()].ops.clone();
        for op in ops.into_iter().rev() {
            let regions = self.ops[op.index()].regions.clone();
            for region in regions {
                let blocks = self.regions[region.index()].blocks.clone();
                for b in blocks {
                    self.erase_block_contents(b);
                }
            }
            self.drop_operand_uses(op);
            self.ops[op.index()].erased = true;
            self.ops[op.index()].parent = None;
        }
        self.blocks[block.index()].ops.clear();
        self.blocks[block.index()].erased = true;
    }

    /// Erase a block (and its ops) from its region.
    pub fn erase_block(&mut self, block: BlockId) {
        if let Some(region) = self.blocks[block.index()].parent.take() {
            self.regions[region.index()].blocks.retain(|b| *b != block);
        }
        self.erase_block_contents(block);
    }

    // ---------------------------------------------------------------------
    // Structural moves
    // ---------------------------------------------------------------------

    /// Move all ops of `src` before `anchor` (or to the end of `dest` when
    /// `anchor` is `None`), substituting `args` for the block arguments of
    /// `src`. `src` is erased afterwards.
    pub fn inline_block(
        &mut self,
        src: BlockId,
        dest: BlockId,
        anchor: Option<OpId>,
        args: &[ValueId],
    ) {
        let src_args = self.blocks[src.index()].args.clone();
        debug_assert_eq!(src_args.len(), args.len(), "block argument count mismatch");
        for (old, new) in src_args.iter().zip(args) {
            self.replace_all_uses(*old, *new);
        }
        let ops = std::mem::take(&mut self.blocks[src.index()].ops);
        let mut pos = match anchor {
            Some(a) => self.op_position(a),
            None => self.blocks[dest.index()].ops.len(),
        };
        for op in ops {
            self.insert_op(dest, pos, op);
            pos += 1;
        }
        self.erase_block(src);
    }

    /// Move the blocks of `src` to the end of `dest`.
    pub fn take_region_blocks(&mut self, src: RegionId, dest: RegionId) {
        let blocks = std::mem::take(&mut self.regions[src.index()].blocks);
        for block in blocks {
            self.push_block(dest, block);
        }
    }

    /// Split `block` before the op at `pos`; the tail moves to a new block
    /// placed right after it.
    pub fn split_block(&mut self, block: BlockId, pos: usize) -> BlockId {
        let new_block = self.create_block(&[]);
        self.insert_block_after(block, new_block);
        let tail: Vec<OpId> = self.blocks[block.index()].ops.split_off(pos);
        for op in tail {
            self.ops[op.index()].parent = Some(new_block);
            self.blocks[new_block.index()].ops.push(op);
            self.touch(op);
        }
        new_block
    }

    /// Deep copy of `op` (detached). `mapping` maps values of the source to
    /// values of the clone and is extended with results and block arguments.
    pub fn clone_op(&mut self, op: OpId, mapping: &mut HashMap<ValueId, ValueId>) -> OpId {
        let data = self.ops[op.index()].clone();
        let operands = data
            .operands
            .iter()
            .map(|v| *mapping.get(v).unwrap_or(v))
            .collect();
        let result_types = data
            .results
            .iter()
            .map(|r| self.values[r.index()].ty.clone())
            .collect();
        let new_op = self.create_op(data.kind.clone(), operands, result_types, data.regions.len());
        self.ops[new_op.index()].attrs = data.attrs.clone();
        for (old, new) in data.results.iter().zip(self.ops[new_op.index()].results.clone()) {
            mapping.insert(*old, new);
        }
        let mut block_map: HashMap<BlockId, BlockId> = HashMap::new();
        for (i, region) in data.regions.iter().enumerate() {
            let new_region = self.ops[new_op.index()].regions[i];
            let blocks = self.regions[region.index()].blocks.clone();
            for block in &blocks {
                let arg_types: Vec<Type> = self.blocks[block.index()]
                    .args
                    .iter()
                    .map(|a| self.values[a.index()].ty.clone())
                    .collect();
                let new_block = self.create_block(&arg_types);
                for (old, new) in self.blocks[block.index()]
                    .args
                    .clone()
                    .into_iter()
                    .zip(self.blocks[new_block.index()].args.clone())
                {
                    mapping.insert(old, new);
                }
                self.push_block(new_region, new_block);
                block_map.insert(*block, new_block);
            }
            for block in &blocks {
                let new_block = block_map[block];
                for inner in self.blocks[block.index()].ops.clone() {
                    let cloned = self.clone_op(inner, mapping);
                    let succs = self.ops[inner.index()]
                        .successors
                        .iter()
                        .map(|s| *block_map.get(s).unwrap_or(s))
                        .collect();
                    self.ops[cloned.index()].successors = succs;
                    self.append_op(new_block, cloned);
                }
            }
        }
        new_op
    }

    // ---------------------------------------------------------------------
    // Walking
    // ---------------------------------------------------------------------

    /// All live ops nested in a block, pre-order.
    pub fn walk_block(&self, block: BlockId) -> Vec<OpId> {
        let mut out = Vec::new();
        self.walk_block_into(block, &mut out);
        out
    }

    fn walk_block_into(&self, block: BlockId, out: &mut Vec<OpId>) {
        for op in &self.blocks[block.index()].ops {
            self.walk_op_into(*op, out);
        }
    }

    fn walk_op_into(&self, op: OpId, out: &mut Vec<OpId>) {
        out.push(op);
        for region in &self.ops[op.index()].regions {
            for block in &self.regions[region.index()].blocks {
                self.walk_block_into(*block, out);
            }
        }
    }

    /// `op` and everything nested in it, pre-order.
    pub fn walk_op(&self, op: OpId) -> Vec<OpId> {
        let mut out = Vec::new();
        self.walk_op_into(op, &mut out);
        out
    }

    /// Every live op in the module, pre-order.
    pub fn walk(&self) -> Vec<OpId> {
        self.walk_block(self.body)
    }

    /// Function ops in definition order.
    pub fn functions(&self) -> Vec<OpId> {
        self.blocks[self.body.index()]
            .ops
            .iter()
            .copied()
            .filter(|op| self.tag(*op) == OpTag::Func)
            .collect()
    }

    pub fn lookup_function(&self, name: &str) -> Option<OpId> {
        self.functions().into_iter().find(|f| match self.kind(*f) {
            OpKind::Func { name: n, .. } => n == name,
            _ => false,
        })
    }

    /// Number of live ops, for statistics.
    pub fn live_op_count(&self) -> usize {
        self.walk().len()
    }

    /// Ops ever created, erased ones included.
    pub fn allocated_op_count(&self) -> usize {
        self.ops.len()
    }
}
