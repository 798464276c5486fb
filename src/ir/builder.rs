// This module provides the op builder used by rewrite rules, lowering passes and tests. A
// Builder borrows the module mutably together with an insertion point (before an op, at the
// end of a block, or at the start of a block) and offers one typed constructor per op kind.
// Constructors of single-result ops return the result value; structured ops (if, for,
// parallel, env regions, functions) return the op so callers can fill the bodies with a
// second builder positioned inside. Result types that follow from the operands (loads,
// dims, comparisons, subview layouts) are inferred here so every caller agrees on them.

//! Positioned op construction.

use super::attrs::EnvAttr;
use super::module::{BlockId, Module, OpId, ValueId};
use super::ops::*;
use super::types::{Dim, FunctionType, Layout, MemRefType, StridedLayout, Type};

/// Where new ops go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    Before(OpId),
    End(BlockId),
    Start(BlockId),
}

/// Positioned builder over a module.
pub struct Builder<'m> {
    module: &'m mut Module,
    ip: InsertPoint,
}

impl<'m> Builder<'m> {
    pub fn new(module: &'m mut Module, ip: InsertPoint) -> Self {
        Self { module, ip }
    }

    pub fn before(module: &'m mut Module, op: OpId) -> Self {
        Self::new(module, InsertPoint::Before(op))
    }

    /// Insert right after `op`.
    pub fn after(module: &'m mut Module, op: OpId) -> Self {
        let ip = match (module.next_op(op), module.parent_block(op)) {
            (Some(next), _) => InsertPoint::Before(next),
            (None, Some(block)) => InsertPoint::End(block),
            (None, None) => InsertPoint::End(module.body()),
        };
        Self::new(module, ip)
    }

    pub fn at_end(module: &'m mut Module, block: BlockId) -> Self {
        Self::new(module, InsertPoint::End(block))
    }

    pub fn at_start(module: &'m mut Module, block: BlockId) -> Self {
        Self::new(module, InsertPoint::Start(block))
    }

    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    pub fn set_insert_point(&mut self, ip: InsertPoint) {
        self.ip = ip;
    }

    /// Create an op at the insertion point.
    pub fn insert(
        &mut self,
        kind: OpKind,
        operands: Vec<ValueId>,
        result_types: Vec<Type>,
        num_regions: usize,
    ) -> OpId {
        let op = self.module.create_op(kind, operands, result_types, num_regions);
        match self.ip {
            InsertPoint::Before(anchor) => self.module.insert_op_before(anchor, op),
            InsertPoint::End(block) => self.module.append_op(block, op),
            InsertPoint::Start(block) => {
                self.module.insert_op(block, 0, op);
                // keep program order for subsequent inserts
                self.ip = match self.module.next_op(op) {
                    Some(next) => InsertPoint::Before(next),
                    None => InsertPoint::End(block),
                };
            }
        }
        op
    }

    /// Single-result op without regions; for kinds with no dedicated constructor.
    pub fn create(&mut self, kind: OpKind, operands: Vec<ValueId>, ty: Type) -> ValueId {
        self.single(kind, operands, ty)
    }

    fn single(&mut self, kind: OpKind, operands: Vec<ValueId>, ty: Type) -> ValueId {
        let op = self.insert(kind, operands, vec![ty], 0);
        self.module.result(op, 0)
    }

    fn ty(&self, value: ValueId) -> Type {
        self.module.value_type(value).clone()
    }

    // ---------------------------------------------------------------------
    // Functions and calls
    // ---------------------------------------------------------------------

    /// Function with an entry block whose args match the inputs. Declarations
    /// are made with [`Builder::func_decl`].
    pub fn func(&mut self, name: &str, ty: FunctionType, visibility: Visibility) -> OpId {
        let inputs = ty.inputs.clone();
        let op = self.insert(
            OpKind::Func {
                name: name.to_string(),
                ty,
                visibility,
            },
            vec![],
            vec![],
            1,
        );
        let entry = self.module.create_block(&inputs);
        let region = self.module.region(op, 0);
        self.module.push_block(region, entry);
        op
    }

    pub fn func_decl(&mut self, name: &str, ty: FunctionType) -> OpId {
        self.insert(
            OpKind::Func {
                name: name.to_string(),
                ty,
                visibility: Visibility::Private,
            },
            vec![],
            vec![],
            1,
        )
    }

    pub fn call(&mut self, callee: &str, args: Vec<ValueId>, results: Vec<Type>) -> OpId {
        self.insert(
            OpKind::Call {
                callee: callee.to_string(),
            },
            args,
            results,
            0,
        )
    }

    pub fn return_(&mut self, values: Vec<ValueId>) -> OpId {
        self.insert(OpKind::Return, values, vec![], 0)
    }

    // ---------------------------------------------------------------------
    // Arithmetic
    // ---------------------------------------------------------------------

    pub fn constant(&mut self, value: ConstValue, ty: Type) -> ValueId {
        self.single(OpKind::Constant(value), vec![], ty)
    }

    pub fn const_index(&mut self, value: i64) -> ValueId {
        self.constant(ConstValue::Int(value), Type::Index)
    }

    pub fn const_int(&mut self, value: i64, ty: Type) -> ValueId {
        self.constant(ConstValue::Int(value), ty)
    }

    pub fn const_float(&mut self, value: f64, ty: Type) -> ValueId {
        self.constant(ConstValue::Float(value), ty)
    }

    pub fn null_ptr(&mut self) -> ValueId {
        self.constant(ConstValue::Null, Type::Ptr)
    }

    pub fn binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.ty(lhs);
        self.single(OpKind::Binary(op), vec![lhs, rhs], ty)
    }

    pub fn cmpi(&mut self, pred: IntPredicate, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.single(OpKind::CmpI(pred), vec![lhs, rhs], Type::i1())
    }

    pub fn cmpf(&mut self, pred: FloatPredicate, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.single(OpKind::CmpF(pred), vec![lhs, rhs], Type::i1())
    }

    pub fn select(&mut self, cond: ValueId, t: ValueId, f: ValueId) -> ValueId {
        let ty = self.ty(t);
        self.single(OpKind::Select, vec![cond, t, f], ty)
    }

    pub fn cast(&mut self, kind: CastKind, value: ValueId, ty: Type) -> ValueId {
        self.single(OpKind::Cast(kind), vec![value], ty)
    }

    pub fn undef(&mut self, ty: Type) -> ValueId {
        self.single(OpKind::Undef, vec![], ty)
    }

    // ---------------------------------------------------------------------
    // Structured control flow
    // ---------------------------------------------------------------------

    /// `scf.if` with empty then/else blocks.
    pub fn if_(&mut self, cond: ValueId, results: Vec<Type>) -> OpId {
        let op = self.insert(OpKind::If, vec![cond], results, 2);
        for i in 0..2 {
            let block = self.module.create_block(&[]);
            let region = self.module.region(op, i);
            self.module.push_block(region, block);
        }
        op
    }

    /// `scf.for` with a body block taking the iv and the iter values.
    pub fn for_(&mut self, lower: ValueId, upper: ValueId, step: ValueId, inits: Vec<ValueId>) -> OpId {
        let types: Vec<Type> = inits.iter().map(|v| self.ty(*v)).collect();
        let mut operands = vec![lower, upper, step];
        operands.extend(inits);
        let op = self.insert(OpKind::For, operands, types.clone(), 1);
        let mut arg_types = vec![Type::Index];
        arg_types.extend(types);
        let body = self.module.create_block(&arg_types);
        let region = self.module.region(op, 0);
        self.module.push_block(region, body);
        op
    }

    /// `scf.while`; the before block takes the inits, the after block the
    /// forwarded `after_types`.
    pub fn while_(&mut self, inits: Vec<ValueId>, after_types: Vec<Type>) -> OpId {
        let types: Vec<Type> = inits.iter().map(|v| self.ty(*v)).collect();
        let op = self.insert(OpKind::While, inits, after_types.clone(), 2);
        let before = self.module.create_block(&types);
        let after = self.module.create_block(&after_types);
        let r0 = self.module.region(op, 0);
        let r1 = self.module.region(op, 1);
        self.module.push_block(r0, before);
        self.module.push_block(r1, after);
        op
    }

    pub fn parallel(&mut self, lowers: Vec<ValueId>, uppers: Vec<ValueId>, steps: Vec<ValueId>) -> OpId {
        let num_dims = lowers.len();
        let mut operands = lowers;
        operands.extend(uppers);
        operands.extend(steps);
        let op = self.insert(OpKind::Parallel { num_dims }, operands, vec![], 1);
        let body = self.module.create_block(&vec![Type::Index; num_dims]);
        let region = self.module.region(op, 0);
        self.module.push_block(region, body);
        op
    }

    pub fn yield_(&mut self, values: Vec<ValueId>) -> OpId {
        self.insert(OpKind::Yield, values, vec![], 0)
    }

    pub fn condition(&mut self, cond: ValueId, forwarded: Vec<ValueId>) -> OpId {
        let mut operands = vec![cond];
        operands.extend(forwarded);
        self.insert(OpKind::Condition, operands, vec![], 0)
    }

    pub fn env_region(&mut self, env: EnvAttr, args: Vec<ValueId>, results: Vec<Type>) -> OpId {
        let op = self.insert(OpKind::EnvRegion { env }, args, results, 1);
        let block = self.module.create_block(&[]);
        let region = self.module.region(op, 0);
        self.module.push_block(region, block);
        op
    }

    pub fn env_yield(&mut self, values: Vec<ValueId>) -> OpId {
        self.insert(OpKind::EnvYield, values, vec![], 0)
    }

    // ---------------------------------------------------------------------
    // Shaped arrays
    // ---------------------------------------------------------------------

    pub fn alloc(&mut self, ty: Type, dynamic_sizes: Vec<ValueId>) -> ValueId {
        self.single(OpKind::Alloc, dynamic_sizes, ty)
    }

    pub fn alloca(&mut self, ty: Type, dynamic_sizes: Vec<ValueId>) -> ValueId {
        self.single(OpKind::Alloca, dynamic_sizes, ty)
    }

    pub fn dealloc(&mut self, memref: ValueId) -> OpId {
        self.insert(OpKind::Dealloc, vec![memref], vec![], 0)
    }

    pub fn retain(&mut self, memref: ValueId) -> ValueId {
        let ty = self.ty(memref);
        self.single(OpKind::Retain, vec![memref], ty)
    }

    pub fn load(&mut self, memref: ValueId, indices: Vec<ValueId>) -> ValueId {
        let ty = self
            .ty(memref)
            .element_type()
            .cloned()
            .unwrap_or(Type::None);
        let mut operands = vec![memref];
        operands.extend(indices);
        self.single(OpKind::Load, operands, ty)
    }

    pub fn store(&mut self, value: ValueId, memref: ValueId, indices: Vec<ValueId>) -> OpId {
        let mut operands = vec![value, memref];
        operands.extend(indices);
        self.insert(OpKind::Store, operands, vec![], 0)
    }

    pub fn atomic_rmw(
        &mut self,
        kind: AtomicRmwKind,
        value: ValueId,
        memref: ValueId,
        indices: Vec<ValueId>,
    ) -> ValueId {
        let ty = self.ty(value);
        let mut operands = vec![value, memref];
        operands.extend(indices);
        self.single(OpKind::AtomicRmw(kind), operands, ty)
    }

    pub fn dim(&mut self, source: ValueId, index: ValueId) -> ValueId {
        self.single(OpKind::Dim, vec![source, index], Type::Index)
    }

    /// Subview with its result type inferred from the source.
    pub fn subview(&mut self, source: ValueId, params: SliceParams, dynamic: Vec<ValueId>) -> ValueId {
        let ty = infer_subview_type(&self.ty(source), &params).unwrap_or(Type::None);
        self.subview_typed(source, params, dynamic, ty)
    }

    pub fn subview_typed(
        &mut self,
        source: ValueId,
        params: SliceParams,
        dynamic: Vec<ValueId>,
        ty: Type,
    ) -> ValueId {
        let mut operands = vec![source];
        operands.extend(dynamic);
        self.single(OpKind::Subview(params), operands, ty)
    }

    pub fn memref_cast(&mut self, source: ValueId, ty: Type) -> ValueId {
        self.single(OpKind::MemrefCast, vec![source], ty)
    }

    /// Cast folded away when the types already match.
    pub fn memref_cast_or_fold(&mut self, source: ValueId, ty: Type) -> ValueId {
        if self.ty(source) == ty {
            return source;
        }
        self.memref_cast(source, ty)
    }

    pub fn change_layout(&mut self, source: ValueId, ty: Type) -> ValueId {
        self.single(OpKind::ChangeLayout, vec![source], ty)
    }

    pub fn sign_cast(&mut self, source: ValueId, ty: Type) -> ValueId {
        self.single(OpKind::SignCast, vec![source], ty)
    }

    pub fn copy(&mut self, source: ValueId, target: ValueId) -> OpId {
        self.insert(OpKind::Copy, vec![source, target], vec![], 0)
    }

    pub fn linalg_fill(&mut self, value: ValueId, output: ValueId) -> OpId {
        self.insert(OpKind::LinalgFill, vec![value, output], vec![], 0)
    }

    /// Elementwise generic; the body block takes one element per operand.
    pub fn linalg_generic(&mut self, inputs: Vec<ValueId>, outputs: Vec<ValueId>) -> OpId {
        let num_inputs = inputs.len();
        let mut operands = inputs;
        operands.extend(outputs);
        let arg_types: Vec<Type> = operands
            .iter()
            .map(|v| self.ty(*v).element_type().cloned().unwrap_or(Type::None))
            .collect();
        let op = self.insert(OpKind::LinalgGeneric { num_inputs }, operands, vec![], 1);
        let block = self.module.create_block(&arg_types);
        let region = self.module.region(op, 0);
        self.module.push_block(region, block);
        op
    }

    pub fn build_tuple(&mut self, elements: Vec<ValueId>) -> ValueId {
        let ty = Type::Tuple(elements.iter().map(|v| self.ty(*v)).collect());
        self.single(OpKind::BuildTuple, elements, ty)
    }

    pub fn tuple_extract(&mut self, tuple: ValueId, index: ValueId, ty: Type) -> ValueId {
        self.single(OpKind::TupleExtract, vec![tuple, index], ty)
    }

    pub fn enforce_shape(&mut self, value: ValueId, sizes: Vec<ValueId>) -> ValueId {
        let ty = self.ty(value);
        let mut operands = vec![value];
        operands.extend(sizes);
        self.single(OpKind::EnforceShape, operands, ty)
    }

    pub fn slice_getitem(&mut self, slice: ValueId, array: ValueId, index: ValueId, dim: usize) -> ValueId {
        self.single(OpKind::SliceGetItem { dim }, vec![slice, array, index], Type::Index)
    }

    pub fn get_alloc_token(&mut self, memref: ValueId) -> ValueId {
        self.single(OpKind::GetAllocToken, vec![memref], Type::Index)
    }

    // ---------------------------------------------------------------------
    // Low-level
    // ---------------------------------------------------------------------

    pub fn l_alloca(&mut self, elem: Type, count: ValueId) -> ValueId {
        self.single(OpKind::LAlloca { elem }, vec![count], Type::Ptr)
    }

    pub fn l_load(&mut self, ptr: ValueId, ty: Type) -> ValueId {
        self.single(OpKind::LLoad, vec![ptr], ty)
    }

    pub fn l_store(&mut self, value: ValueId, ptr: ValueId) -> OpId {
        self.insert(OpKind::LStore, vec![value, ptr], vec![], 0)
    }

    pub fn gep(&mut self, base: ValueId, elem: Type, indices: Vec<GepIndex>, dynamic: Vec<ValueId>) -> ValueId {
        let mut operands = vec![base];
        operands.extend(dynamic);
        self.single(OpKind::Gep { elem, indices }, operands, Type::Ptr)
    }

    /// Pointer to field `field` of a struct at `base`.
    pub fn struct_gep(&mut self, base: ValueId, elem: Type, field: i32) -> ValueId {
        self.gep(base, elem, vec![GepIndex::Const(0), GepIndex::Const(field)], vec![])
    }

    pub fn insert_value(&mut self, aggregate: ValueId, value: ValueId, position: Vec<u32>) -> ValueId {
        let ty = self.ty(aggregate);
        self.single(OpKind::InsertValue { position }, vec![aggregate, value], ty)
    }

    pub fn extract_value(&mut self, aggregate: ValueId, position: Vec<u32>) -> ValueId {
        let ty = aggregate_member(&self.ty(aggregate), &position).unwrap_or(Type::None);
        self.single(OpKind::ExtractValue { position }, vec![aggregate], ty)
    }

    pub fn l_atomic_rmw(&mut self, kind: LowRmwKind, ordering: AtomicOrdering, ptr: ValueId, value: ValueId) -> ValueId {
        let ty = self.ty(value);
        self.single(OpKind::LAtomicRmw { kind, ordering }, vec![ptr, value], ty)
    }

    pub fn address_of(&mut self, symbol: &str) -> ValueId {
        self.single(
            OpKind::AddressOf {
                symbol: symbol.to_string(),
            },
            vec![],
            Type::Ptr,
        )
    }

    pub fn ptr_to_int(&mut self, ptr: ValueId) -> ValueId {
        self.single(OpKind::PtrToInt, vec![ptr], Type::i64())
    }

    pub fn int_to_ptr(&mut self, value: ValueId) -> ValueId {
        self.single(OpKind::IntToPtr, vec![value], Type::Ptr)
    }

    pub fn br(&mut self, dest: BlockId, args: Vec<ValueId>) -> OpId {
        let op = self.insert(OpKind::Br, args, vec![], 0);
        self.module.set_successors(op, vec![dest]);
        op
    }

    pub fn cond_br(
        &mut self,
        cond: ValueId,
        true_dest: BlockId,
        true_args: Vec<ValueId>,
        false_dest: BlockId,
        false_args: Vec<ValueId>,
    ) -> OpId {
        let n = true_args.len();
        let mut operands = vec![cond];
        operands.extend(true_args);
        operands.extend(false_args);
        let op = self.insert(OpKind::CondBr { true_args: n }, operands, vec![], 0);
        self.module.set_successors(op, vec![true_dest, false_dest]);
        op
    }

    // ---------------------------------------------------------------------
    // Task parallelism
    // ---------------------------------------------------------------------

    pub fn sync_region_start(&mut self) -> ValueId {
        self.single(OpKind::SyncRegionStart, vec![], Type::Token)
    }

    /// Spawn `task`; the parent continues at `cont`.
    pub fn detach(&mut self, region: ValueId, task: BlockId, cont: BlockId) -> OpId {
        let op = self.insert(OpKind::Detach, vec![region], vec![], 0);
        self.module.set_successors(op, vec![task, cont]);
        op
    }

    pub fn reattach(&mut self, region: ValueId, cont: BlockId) -> OpId {
        let op = self.insert(OpKind::Reattach, vec![region], vec![], 0);
        self.module.set_successors(op, vec![cont]);
        op
    }

    pub fn sync(&mut self, region: ValueId, cont: BlockId) -> OpId {
        let op = self.insert(OpKind::Sync, vec![region], vec![], 0);
        self.module.set_successors(op, vec![cont]);
        op
    }
}

/// Member type of a low-level aggregate at `position`.
pub fn aggregate_member(ty: &Type, position: &[u32]) -> Option<Type> {
    let mut current = ty.clone();
    for p in position {
        current = match current {
            Type::Struct(fields) => fields.get(*p as usize)?.clone(),
            Type::Array(elem, n) if u64::from(*p) < n => *elem,
            _ => return None,
        };
    }
    Some(current)
}

/// Result type of a subview: sizes from the params, strides multiplied by
/// the steps, offset accumulated from the source layout. Products involving
/// a dynamic value are dynamic.
pub fn infer_subview_type(source: &Type, params: &SliceParams) -> Option<Type> {
    let src = source.as_memref()?;
    if params.offsets.len() != src.rank()
        || params.sizes.len() != src.rank()
        || params.strides.len() != src.rank()
    {
        return None;
    }
    let layout = src.strides_and_offset();
    let mut offset = layout.offset;
    let mut strides = Vec::with_capacity(src.rank());
    for i in 0..src.rank() {
        offset = match (offset, params.offsets[i], layout.strides[i]) {
            (Dim::Static(o), Dim::Static(off), Dim::Static(s)) => Dim::Static(o + off * s),
            _ => Dim::Dynamic,
        };
        strides.push(match (params.strides[i], layout.strides[i]) {
            (Dim::Static(step), Dim::Static(s)) => Dim::Static(step * s),
            _ => Dim::Dynamic,
        });
    }
    Some(Type::MemRef(MemRefType {
        elem: src.elem.clone(),
        shape: params.sizes.clone(),
        layout: Layout::Strided(StridedLayout::new(offset, strides)),
        memory_space: src.memory_space,
    }))
}
