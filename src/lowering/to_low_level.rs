// This module lowers the shaped-array layer to the low-level layer the LLVM translator accepts.
// It runs in three steps. First every value, block argument and function signature is retyped
// in place: index becomes i64, signed and unsigned integers become signless, tuples become
// literal structs and a memref becomes its descriptor struct. The memref type of each retyped
// value is remembered, because the ops that consume it still need its shape and layout. Then
// each shaped-array op is rewritten into descriptor field reads, pointer arithmetic, loads,
// stores and runtime calls.
//
// A descriptor always holds the actual value of every field, static or not, so memref casts,
// layout changes, sign casts and memref bitcasts all lower to their operand. Reads of
// statically known sizes, strides and offsets are emitted as constants instead of field
// extractions.
//
// Allocations go through the meminfo runtime. Retain and dealloc call two private helpers
// emitted once per module; both skip a null meminfo. With alloc tokens enabled, the allocation
// pointer field holds a token cell instead of the meminfo pointer, so two descriptors never
// share the same allocation handle. The helpers for creating, reading and destroying tokens
// are runtime calls and plain loads and stores.
//
// Finally every public function with a body is given the external calling convention. A new
// entry block takes the result slot, the exception slot and the flattened arguments, rebuilds
// each memref argument through `__convert_to_memref_*` and branches to the old entry. Returns
// store their values through `__convert_from_memref_*` into the result slot and return status 0.
// With tokens, the function owns the cells made for its arguments on entry and frees them on
// every return, along with the cells of returned arrays it does not already free.

//! Shaped-array ops to low-level ops.

use hashbrown::HashMap;
use log::debug;

use super::{declare_function, func_name, pass_failure, Pass};
use crate::core::error::PassResult;
use crate::core::session::PipelineSession;
use crate::ir::attrs::{names, Attribute};
use crate::ir::builder::Builder;
use crate::ir::module::{BlockId, Module, OpId, ValueId};
use crate::ir::ops::{AtomicOrdering, BinOp, GepIndex, IntPredicate, LowRmwKind, OpKind, OpTag, SliceParams, Visibility};
use crate::ir::types::{Dim, FunctionType, Layout, MemRefType, Type};
use crate::rewrite::const_int;

pub const ALLOC_FN: &str = "NRT_MemInfo_alloc_safe_aligned";
pub const CALL_DTOR_FN: &str = "NRT_MemInfo_call_dtor";
pub const ALLOC_MEMINFO_FN: &str = "nmrtAllocMemInfo";
pub const CREATE_TOKEN_FN: &str = "nmrtCreateAllocToken";
pub const DESTROY_TOKEN_FN: &str = "nmrtDestroyAllocToken";
pub const INCREF_FN: &str = "NRT_incref";
pub const DECREF_FN: &str = "NRT_decref";

const ALLOC_ALIGNMENT: i64 = 32;
const MEMINFO_DATA_FIELD: i32 = 3;

/// `{refcnt, dtor, dtor_info, data, size, external_allocator}`
pub fn meminfo_type() -> Type {
    Type::Struct(vec![Type::i64(), Type::Ptr, Type::Ptr, Type::Ptr, Type::i64(), Type::Ptr])
}

/// `{allocated, aligned, offset, sizes, strides}`; rank 0 has no arrays.
pub fn descriptor_type(rank: usize) -> Type {
    let mut fields = vec![Type::Ptr, Type::Ptr, Type::i64()];
    if rank > 0 {
        fields.push(Type::Array(Box::new(Type::i64()), rank as u64));
        fields.push(Type::Array(Box::new(Type::i64()), rank as u64));
    }
    Type::Struct(fields)
}

/// External array struct `{meminfo, parent, nitems, itemsize, data, shape, strides}`
/// with strides in bytes.
pub fn array_struct_type(rank: usize) -> Type {
    let mut fields = vec![Type::Ptr, Type::Ptr, Type::i64(), Type::i64(), Type::Ptr];
    if rank > 0 {
        fields.push(Type::Array(Box::new(Type::i64()), rank as u64));
        fields.push(Type::Array(Box::new(Type::i64()), rank as u64));
    }
    Type::Struct(fields)
}

/// Low-level form of `ty`, or `None` when it has none.
pub fn convert_type(ty: &Type) -> Option<Type> {
    Some(match ty {
        Type::Index => Type::i64(),
        Type::Int(_) => ty.to_signless(),
        Type::Float(_) | Type::None | Type::Ptr | Type::Token => ty.clone(),
        Type::MemRef(mt) => descriptor_type(mt.rank()),
        Type::Tuple(elems) | Type::Struct(elems) => {
            Type::Struct(elems.iter().map(convert_type).collect::<Option<Vec<_>>>()?)
        }
        Type::Array(elem, n) => Type::Array(Box::new(convert_type(elem)?), *n),
        Type::Opaque(_) => Type::Ptr,
        Type::TypeVar(_) => Type::Struct(vec![]),
        Type::Tensor(_) | Type::Function(_) => return None,
    })
}

fn convert_function_type(ty: &FunctionType) -> Option<FunctionType> {
    Some(FunctionType::new(
        ty.inputs.iter().map(convert_type).collect::<Option<Vec<_>>>()?,
        ty.results.iter().map(convert_type).collect::<Option<Vec<_>>>()?,
    ))
}

/// Ops the LLVM translator handles.
pub fn is_low_level(tag: OpTag) -> bool {
    matches!(
        tag,
        OpTag::Func
            | OpTag::Return
            | OpTag::Call
            | OpTag::Constant
            | OpTag::Binary
            | OpTag::CmpI
            | OpTag::CmpF
            | OpTag::Select
            | OpTag::Cast
            | OpTag::Undef
            | OpTag::Bitcast
            | OpTag::LAlloca
            | OpTag::LLoad
            | OpTag::LStore
            | OpTag::Gep
            | OpTag::InsertValue
            | OpTag::ExtractValue
            | OpTag::LAtomicRmw
            | OpTag::AddressOf
            | OpTag::PtrToInt
            | OpTag::IntToPtr
            | OpTag::Br
            | OpTag::CondBr
            | OpTag::Unreachable
            | OpTag::SyncRegionStart
            | OpTag::Detach
            | OpTag::Reattach
            | OpTag::Sync
    )
}

pub struct LowerToLowLevel {
    use_alloc_tokens: bool,
}

impl LowerToLowLevel {
    pub fn new(use_alloc_tokens: bool) -> Self {
        Self { use_alloc_tokens }
    }
}

impl Pass for LowerToLowLevel {
    fn name(&self) -> &'static str {
        "lower-to-low-level"
    }

    fn run(&self, m: &mut Module, session: &PipelineSession<'_>) -> PassResult<()> {
        let start = session.diagnostic_count();
        let mut cx = Lowering {
            m,
            session,
            tokens: self.use_alloc_tokens,
            memrefs: HashMap::new(),
            signatures: HashMap::new(),
        };
        cx.retype();
        if session.first_error_since(start).is_none() {
            cx.lower_ops();
        }
        if session.first_error_since(start).is_none() {
            cx.shape_public_functions();
        }
        if session.first_error_since(start).is_none() {
            cx.check_low_level();
        }
        match session.first_error_since(start) {
            Some(_) => Err(pass_failure(self.name(), session, start, "")),
            None => Ok(()),
        }
    }
}

struct Lowering<'a, 's> {
    m: &'a mut Module,
    session: &'a PipelineSession<'s>,
    tokens: bool,
    /// Memref type of every value retyped to a descriptor.
    memrefs: HashMap<ValueId, MemRefType>,
    /// Signature of every function before retyping.
    signatures: HashMap<OpId, FunctionType>,
}

impl Lowering<'_, '_> {
    fn retype(&mut self) {
        for op in self.m.walk() {
            match self.m.kind(op).clone() {
                OpKind::Func { name, ty, visibility } => match convert_function_type(&ty) {
                    Some(converted) => {
                        self.signatures.insert(op, ty);
                        self.m.set_kind(
                            op,
                            OpKind::Func {
                                name,
                                ty: converted,
                                visibility,
                            },
                        );
                    }
                    None => self.session.error(Some(op), format!("cannot lower signature of @{}", name)),
                },
                OpKind::LAlloca { elem } => {
                    if let Some(elem) = convert_type(&elem) {
                        self.m.set_kind(op, OpKind::LAlloca { elem });
                    }
                }
                OpKind::Gep { elem, indices } => {
                    if let Some(elem) = convert_type(&elem) {
                        self.m.set_kind(op, OpKind::Gep { elem, indices });
                    }
                }
                _ => {}
            }
            for result in self.m.results(op).to_vec() {
                self.retype_value(op, result);
            }
            for region in self.m.regions(op).to_vec() {
                for block in self.m.region_blocks(region).to_vec() {
                    for arg in self.m.block_args(block).to_vec() {
                        self.retype_value(op, arg);
                    }
                }
            }
        }
    }

    fn retype_value(&mut self, op: OpId, value: ValueId) {
        let ty = self.m.value_type(value).clone();
        match convert_type(&ty) {
            Some(converted) => {
                if let Type::MemRef(mt) = ty {
                    self.memrefs.insert(value, mt);
                }
                self.m.set_value_type(value, converted);
            }
            None => self
                .session
                .error(Some(op), format!("cannot lower {} value of type {}", self.m.kind(op).name(), ty)),
        }
    }

    fn memref(&self, value: ValueId) -> Option<MemRefType> {
        self.memrefs.get(&value).cloned()
    }

    /// Replace the single memref result of `op` by `desc`, carrying its
    /// memref type over so later uses of `desc` can still be lowered.
    fn replace_with_descriptor(&mut self, op: OpId, desc: ValueId) {
        let result = self.m.result(op, 0);
        if let Some(mt) = self.memrefs.get(&result).cloned() {
            self.memrefs.entry(desc).or_insert(mt);
        }
        self.m.replace_op(op, &[desc]);
    }

    fn lower_ops(&mut self) {
        let ops: Vec<OpId> = self
            .m
            .walk()
            .into_iter()
            .filter(|op| !is_low_level(self.m.tag(*op)))
            .collect();
        for op in ops {
            if !self.m.is_alive(op) {
                continue;
            }
            if !self.lower_op(op) {
                self.session
                    .error(Some(op), format!("cannot lower {} to low-level ops", self.m.kind(op).name()));
            }
        }
    }

    fn lower_op(&mut self, op: OpId) -> bool {
        match self.m.kind(op).clone() {
            OpKind::Alloc => self.lower_alloc(op, false),
            OpKind::Alloca => self.lower_alloc(op, true),
            OpKind::Dealloc => self.lower_dealloc(op),
            OpKind::Retain => self.lower_retain(op),
            OpKind::Load => self.lower_load(op),
            OpKind::Store => self.lower_store(op),
            OpKind::AtomicRmw(kind) => self.lower_atomic_rmw(op, kind.into()),
            OpKind::Dim => self.lower_dim(op),
            OpKind::Subview(params) => self.lower_subview(op, &params),
            OpKind::ReinterpretCast { offset, sizes, strides } => {
                self.lower_reinterpret_cast(op, offset, &sizes, &strides)
            }
            OpKind::ExpandShape { reassociation } => self.lower_expand_shape(op, &reassociation),
            OpKind::CollapseShape { reassociation } => self.lower_collapse_shape(op, &reassociation),
            OpKind::Reshape => self.lower_reshape(op),
            OpKind::MemrefCast
            | OpKind::ChangeLayout
            | OpKind::SignCast
            | OpKind::MemrefBitcast
            | OpKind::EnforceShape => {
                let source = self.m.operand(op, 0);
                self.m.replace_op(op, &[source]);
                true
            }
            OpKind::SliceGetItem { dim } => self.lower_slice_getitem(op, dim),
            OpKind::GetAllocToken => self.lower_get_alloc_token(op),
            OpKind::WrapAllocatedPointer { dtor } => self.lower_wrap_pointer(op, &dtor),
            OpKind::BuildTuple => self.lower_build_tuple(op),
            OpKind::TupleExtract => self.lower_tuple_extract(op),
            _ => false,
        }
    }

    fn lower_alloc(&mut self, op: OpId, on_stack: bool) -> bool {
        let result = self.m.result(op, 0);
        let Some(mt) = self.memref(result) else {
            return false;
        };
        let Some(elem) = convert_type(&mt.elem) else {
            return false;
        };
        let Some(elem_size) = elem.size_in_bytes() else {
            return false;
        };
        let dynamic = self.m.operands(op).to_vec();
        let tokens = self.tokens;
        let mut b = Builder::before(self.m, op);
        let mut dynamic = dynamic.into_iter();
        let mut sizes = Vec::with_capacity(mt.rank());
        for d in &mt.shape {
            sizes.push(match d {
                Dim::Static(n) => b.const_int(*n, Type::i64()),
                Dim::Dynamic => match dynamic.next() {
                    Some(v) => v,
                    None => return false,
                },
            });
        }
        let (strides, offset) = match &mt.layout {
            Layout::Strided(layout) if layout.strides.iter().all(|s| !s.is_dynamic()) => {
                let strides = layout
                    .strides
                    .iter()
                    .map(|s| b.const_int(s.as_static().unwrap_or(1), Type::i64()))
                    .collect();
                let offset = b.const_int(layout.offset.as_static().unwrap_or(0), Type::i64());
                (strides, offset)
            }
            _ => (row_major_strides(&mut b, &sizes), b.const_int(0, Type::i64())),
        };
        let mut count = b.const_int(1, Type::i64());
        for size in &sizes {
            count = b.binary(BinOp::MulI, count, *size);
        }

        let (allocated, aligned) = if on_stack {
            let data = b.l_alloca(elem, count);
            let null = b.null_ptr();
            (wrap_meminfo(&mut b, tokens, null), data)
        } else {
            let elem_bytes = b.const_int(elem_size as i64, Type::i64());
            let bytes = b.binary(BinOp::MulI, count, elem_bytes);
            let align = b.const_int(ALLOC_ALIGNMENT, Type::i32());
            declare_function(
                b.module(),
                ALLOC_FN,
                FunctionType::new(vec![Type::i64(), Type::i32()], vec![Type::Ptr]),
            );
            let call = b.call(ALLOC_FN, vec![bytes, align], vec![Type::Ptr]);
            let meminfo = b.module().result(call, 0);
            let data_field = b.struct_gep(meminfo, meminfo_type(), MEMINFO_DATA_FIELD);
            let data = b.l_load(data_field, Type::Ptr);
            (wrap_meminfo(&mut b, tokens, meminfo), data)
        };
        let desc = build_descriptor(&mut b, allocated, aligned, offset, &sizes, &strides);
        self.replace_with_descriptor(op, desc);
        true
    }

    fn lower_dealloc(&mut self, op: OpId) -> bool {
        let source = self.m.operand(op, 0);
        let tokens = self.tokens;
        ensure_refcount_helpers(self.m);
        let mut b = Builder::before(self.m, op);
        let allocated = b.extract_value(source, vec![0]);
        let meminfo = unwrap_meminfo(&mut b, tokens, allocated);
        b.call(DECREF_FN, vec![meminfo], vec![]);
        if tokens {
            destroy_token(&mut b, allocated);
        }
        self.m.erase_op(op);
        true
    }

    fn lower_retain(&mut self, op: OpId) -> bool {
        let source = self.m.operand(op, 0);
        let tokens = self.tokens;
        ensure_refcount_helpers(self.m);
        let mut b = Builder::before(self.m, op);
        let allocated = b.extract_value(source, vec![0]);
        let meminfo = unwrap_meminfo(&mut b, tokens, allocated);
        b.call(INCREF_FN, vec![meminfo], vec![]);
        let retained = if tokens {
            let token = wrap_meminfo(&mut b, tokens, meminfo);
            b.insert_value(source, token, vec![0])
        } else {
            source
        };
        self.replace_with_descriptor(op, retained);
        true
    }

    fn lower_load(&mut self, op: OpId) -> bool {
        let operands = self.m.operands(op).to_vec();
        let Some(mt) = self.memref(operands[0]) else {
            return false;
        };
        let ty = self.m.value_type(self.m.result(op, 0)).clone();
        let mut b = Builder::before(self.m, op);
        let Some(ptr) = element_ptr(&mut b, operands[0], &mt, &operands[1..]) else {
            return false;
        };
        let value = b.l_load(ptr, ty);
        self.m.replace_op(op, &[value]);
        true
    }

    fn lower_store(&mut self, op: OpId) -> bool {
        let operands = self.m.operands(op).to_vec();
        let Some(mt) = self.memref(operands[1]) else {
            return false;
        };
        let mut b = Builder::before(self.m, op);
        let Some(ptr) = element_ptr(&mut b, operands[1], &mt, &operands[2..]) else {
            return false;
        };
        b.l_store(operands[0], ptr);
        self.m.erase_op(op);
        true
    }

    fn lower_atomic_rmw(&mut self, op: OpId, kind: LowRmwKind) -> bool {
        let operands = self.m.operands(op).to_vec();
        let Some(mt) = self.memref(operands[1]) else {
            return false;
        };
        let mut b = Builder::before(self.m, op);
        let Some(ptr) = element_ptr(&mut b, operands[1], &mt, &operands[2..]) else {
            return false;
        };
        let old = b.l_atomic_rmw(kind, AtomicOrdering::AcqRel, ptr, operands[0]);
        self.m.replace_op(op, &[old]);
        true
    }

    fn lower_dim(&mut self, op: OpId) -> bool {
        let source = self.m.operand(op, 0);
        let index = self.m.operand(op, 1);
        let Some(mt) = self.memref(source) else {
            return false;
        };
        if mt.rank() == 0 {
            return false;
        }
        let constant = const_int(self.m, index);
        let mut b = Builder::before(self.m, op);
        let size = match constant {
            Some(i) if i >= 0 && (i as usize) < mt.rank() => field(&mut b, source, mt.shape[i as usize], SIZES, i as u32),
            Some(_) => return false,
            None => {
                // dynamic dimension index: spill the sizes array and index it
                let array_ty = Type::Array(Box::new(Type::i64()), mt.rank() as u64);
                let sizes = b.extract_value(source, vec![3]);
                let one = b.const_int(1, Type::i64());
                let slot = b.l_alloca(array_ty.clone(), one);
                b.l_store(sizes, slot);
                let ptr = b.gep(slot, array_ty, vec![GepIndex::Const(0), GepIndex::Dynamic], vec![index]);
                b.l_load(ptr, Type::i64())
            }
        };
        self.m.replace_op(op, &[size]);
        true
    }

    fn lower_subview(&mut self, op: OpId, params: &SliceParams) -> bool {
        let operands = self.m.operands(op).to_vec();
        let source = operands[0];
        let Some(mt) = self.memref(source) else {
            return false;
        };
        if params.offsets.len() != mt.rank() {
            return false;
        }
        let src_layout = mt.strides_and_offset();
        let mut b = Builder::before(self.m, op);
        let mut dynamic = operands[1..].iter().copied();
        let mut param = |b: &mut Builder<'_>, d: &Dim| match d {
            Dim::Static(v) => Some(b.const_int(*v, Type::i64())),
            Dim::Dynamic => dynamic.next(),
        };
        let mut offsets = Vec::new();
        for d in &params.offsets {
            let Some(v) = param(&mut b, d) else { return false };
            offsets.push(v);
        }
        let mut sizes = Vec::new();
        for d in &params.sizes {
            let Some(v) = param(&mut b, d) else { return false };
            sizes.push(v);
        }
        let mut steps = Vec::new();
        for d in &params.strides {
            let Some(v) = param(&mut b, d) else { return false };
            steps.push(v);
        }

        let mut offset = offset_of(&mut b, source, src_layout.offset);
        let mut strides = Vec::with_capacity(mt.rank());
        for i in 0..mt.rank() {
            let src_stride = field(&mut b, source, src_layout.strides[i], STRIDES, i as u32);
            let scaled = b.binary(BinOp::MulI, offsets[i], src_stride);
            offset = b.binary(BinOp::AddI, offset, scaled);
            strides.push(b.binary(BinOp::MulI, steps[i], src_stride));
        }
        let allocated = b.extract_value(source, vec![0]);
        let aligned = b.extract_value(source, vec![1]);
        let desc = build_descriptor(&mut b, allocated, aligned, offset, &sizes, &strides);
        self.replace_with_descriptor(op, desc);
        true
    }

    fn lower_reinterpret_cast(&mut self, op: OpId, offset: Dim, sizes: &[Dim], strides: &[Dim]) -> bool {
        let operands = self.m.operands(op).to_vec();
        let source = operands[0];
        let mut b = Builder::before(self.m, op);
        let mut dynamic = operands[1..].iter().copied();
        let mut param = |b: &mut Builder<'_>, d: &Dim| match d {
            Dim::Static(v) => Some(b.const_int(*v, Type::i64())),
            Dim::Dynamic => dynamic.next(),
        };
        let Some(offset) = param(&mut b, &offset) else {
            return false;
        };
        let mut size_values = Vec::new();
        for d in sizes {
            let Some(v) = param(&mut b, d) else { return false };
            size_values.push(v);
        }
        let mut stride_values = Vec::new();
        for d in strides {
            let Some(v) = param(&mut b, d) else { return false };
            stride_values.push(v);
        }
        let allocated = b.extract_value(source, vec![0]);
        let aligned = b.extract_value(source, vec![1]);
        let desc = build_descriptor(&mut b, allocated, aligned, offset, &size_values, &stride_values);
        self.replace_with_descriptor(op, desc);
        true
    }

    fn lower_collapse_shape(&mut self, op: OpId, reassociation: &[Vec<usize>]) -> bool {
        let source = self.m.operand(op, 0);
        let Some(mt) = self.memref(source) else {
            return false;
        };
        let layout = mt.strides_and_offset();
        let mut b = Builder::before(self.m, op);
        let mut sizes = Vec::with_capacity(reassociation.len());
        let mut strides = Vec::with_capacity(reassociation.len());
        for group in reassociation {
            let Some(&innermost) = group.last() else {
                return false;
            };
            if innermost >= mt.rank() {
                return false;
            }
            let mut size = b.const_int(1, Type::i64());
            for &d in group {
                let extent = field(&mut b, source, mt.shape[d], SIZES, d as u32);
                size = b.binary(BinOp::MulI, size, extent);
            }
            sizes.push(size);
            strides.push(field(&mut b, source, layout.strides[innermost], STRIDES, innermost as u32));
        }
        let offset = offset_of(&mut b, source, layout.offset);
        let allocated = b.extract_value(source, vec![0]);
        let aligned = b.extract_value(source, vec![1]);
        let desc = build_descriptor(&mut b, allocated, aligned, offset, &sizes, &strides);
        self.replace_with_descriptor(op, desc);
        true
    }

    fn lower_expand_shape(&mut self, op: OpId, reassociation: &[Vec<usize>]) -> bool {
        let source = self.m.operand(op, 0);
        let result = self.m.result(op, 0);
        let (Some(src_ty), Some(res_ty)) = (self.memref(source), self.memref(result)) else {
            return false;
        };
        if reassociation.len() != src_ty.rank() {
            return false;
        }
        let layout = src_ty.strides_and_offset();
        let mut b = Builder::before(self.m, op);
        let mut sizes = vec![None; res_ty.rank()];
        let mut strides = vec![None; res_ty.rank()];
        for (src_dim, group) in reassociation.iter().enumerate() {
            if group.iter().any(|&d| d >= res_ty.rank()) {
                return false;
            }
            let src_size = field(&mut b, source, src_ty.shape[src_dim], SIZES, src_dim as u32);
            let known: i64 = group.iter().filter_map(|&d| res_ty.shape[d].as_static()).product();
            for &d in group {
                sizes[d] = Some(match res_ty.shape[d] {
                    Dim::Static(n) => b.const_int(n, Type::i64()),
                    Dim::Dynamic => {
                        let known = b.const_int(known.max(1), Type::i64());
                        b.binary(BinOp::DivSI, src_size, known)
                    }
                });
            }
            let mut running = field(&mut b, source, layout.strides[src_dim], STRIDES, src_dim as u32);
            for &d in group.iter().rev() {
                strides[d] = Some(running);
                if let Some(size) = sizes[d] {
                    running = b.binary(BinOp::MulI, running, size);
                }
            }
        }
        let (Some(sizes), Some(strides)) = (
            sizes.into_iter().collect::<Option<Vec<_>>>(),
            strides.into_iter().collect::<Option<Vec<_>>>(),
        ) else {
            return false;
        };
        let offset = offset_of(&mut b, source, layout.offset);
        let allocated = b.extract_value(source, vec![0]);
        let aligned = b.extract_value(source, vec![1]);
        let desc = build_descriptor(&mut b, allocated, aligned, offset, &sizes, &strides);
        self.replace_with_descriptor(op, desc);
        true
    }

    /// Reshape of a contiguous memref to new extents.
    fn lower_reshape(&mut self, op: OpId) -> bool {
        let operands = self.m.operands(op).to_vec();
        let source = operands[0];
        let Some(src_ty) = self.memref(source) else {
            return false;
        };
        let mut b = Builder::before(self.m, op);
        let sizes = operands[1..].to_vec();
        let strides = row_major_strides(&mut b, &sizes);
        let offset = offset_of(&mut b, source, src_ty.strides_and_offset().offset);
        let allocated = b.extract_value(source, vec![0]);
        let aligned = b.extract_value(source, vec![1]);
        let desc = build_descriptor(&mut b, allocated, aligned, offset, &sizes, &strides);
        self.replace_with_descriptor(op, desc);
        true
    }

    /// Slice component normalized against an extent of the array. Negative
    /// bounds count from the end, and both bounds are clamped to the extent.
    /// The step must be positive.
    fn lower_slice_getitem(&mut self, op: OpId, dim: usize) -> bool {
        let slice = self.m.operand(op, 0);
        let array = self.m.operand(op, 1);
        let Some(mt) = self.memref(array) else {
            return false;
        };
        if dim >= mt.rank() {
            return false;
        }
        let Some(component) = const_int(self.m, self.m.operand(op, 2)) else {
            return false;
        };
        let mut b = Builder::before(self.m, op);
        let size = field(&mut b, array, mt.shape[dim], SIZES, dim as u32);
        let value = match component {
            0 => slice_bound(&mut b, slice, 0, size),
            1 => slice_bound(&mut b, slice, 1, size),
            2 => b.extract_value(slice, vec![2]),
            3 => {
                let begin = slice_bound(&mut b, slice, 0, size);
                let end = slice_bound(&mut b, slice, 1, size);
                let step = b.extract_value(slice, vec![2]);
                let one = b.const_int(1, Type::i64());
                let span = b.binary(BinOp::SubI, end, begin);
                let span = b.binary(BinOp::AddI, span, step);
                let span = b.binary(BinOp::SubI, span, one);
                let count = b.binary(BinOp::DivSI, span, step);
                let zero = b.const_int(0, Type::i64());
                b.binary(BinOp::MaxSI, count, zero)
            }
            _ => return false,
        };
        self.m.replace_op(op, &[value]);
        true
    }

    fn lower_get_alloc_token(&mut self, op: OpId) -> bool {
        let source = self.m.operand(op, 0);
        let mut b = Builder::before(self.m, op);
        let allocated = b.extract_value(source, vec![0]);
        let token = b.ptr_to_int(allocated);
        self.m.replace_op(op, &[token]);
        true
    }

    fn lower_wrap_pointer(&mut self, op: OpId, dtor: &str) -> bool {
        let data = self.m.operand(op, 0);
        let dtor_data = self.m.operand(op, 1);
        if self.m.lookup_function(dtor).is_none() {
            return false;
        }
        let wrapper = dtor_wrapper(self.m, dtor);
        let tokens = self.tokens;
        declare_function(
            self.m,
            ALLOC_MEMINFO_FN,
            FunctionType::new(vec![Type::Ptr, Type::i64(), Type::Ptr, Type::Ptr], vec![Type::Ptr]),
        );
        let mut b = Builder::before(self.m, op);
        let size = b.const_int(0, Type::i64());
        let dtor_ptr = b.address_of(&wrapper);
        let call = b.call(ALLOC_MEMINFO_FN, vec![data, size, dtor_ptr, dtor_data], vec![Type::Ptr]);
        let meminfo = b.module().result(call, 0);
        let handle = wrap_meminfo(&mut b, tokens, meminfo);
        self.replace_with_descriptor(op, handle);
        true
    }

    fn lower_build_tuple(&mut self, op: OpId) -> bool {
        let elements = self.m.operands(op).to_vec();
        let ty = self.m.value_type(self.m.result(op, 0)).clone();
        let mut b = Builder::before(self.m, op);
        let mut tuple = b.undef(ty);
        for (i, element) in elements.into_iter().enumerate() {
            tuple = b.insert_value(tuple, element, vec![i as u32]);
        }
        self.m.replace_op(op, &[tuple]);
        true
    }

    fn lower_tuple_extract(&mut self, op: OpId) -> bool {
        let tuple = self.m.operand(op, 0);
        let Some(index) = const_int(self.m, self.m.operand(op, 1)) else {
            return false;
        };
        if index < 0 {
            return false;
        }
        let element = Builder::before(self.m, op).extract_value(tuple, vec![index as u32]);
        self.m.replace_op(op, &[element]);
        true
    }

    fn shape_public_functions(&mut self) {
        let funcs: Vec<OpId> = self
            .m
            .functions()
            .into_iter()
            .filter(|f| {
                matches!(self.m.kind(*f), OpKind::Func { visibility: Visibility::Public, .. })
                    && !self.m.region_blocks(self.m.region(*f, 0)).is_empty()
            })
            .collect();
        for func in funcs {
            let Some(signature) = self.signatures.get(&func).cloned() else {
                continue;
            };
            debug!("Shaping external signature of @{}", func_name(self.m, func).unwrap_or("?"));
            if !self.shape_function(func, &signature) {
                self.session.error(Some(func), "cannot shape external signature");
            }
        }
    }

    fn shape_function(&mut self, func: OpId, signature: &FunctionType) -> bool {
        let OpKind::Func { name, visibility, .. } = self.m.kind(func).clone() else {
            return false;
        };
        let old_entry = self.m.body_block(func, 0);
        let tokens = self.tokens;

        let mut inputs = vec![Type::Ptr, Type::Ptr];
        for ty in &signature.inputs {
            match ty {
                Type::MemRef(mt) => match array_struct_type(mt.rank()) {
                    Type::Struct(fields) => inputs.extend(fields.into_iter().flat_map(flatten_field)),
                    _ => return false,
                },
                other => match convert_type(other) {
                    Some(t) => inputs.push(t),
                    None => return false,
                },
            }
        }

        let entry = self.m.create_block(&inputs);
        self.m.insert_block_before(old_entry, entry);
        let args = self.m.block_args(entry).to_vec();
        let result_out = args[0];
        let mut next = args[2..].iter().copied();
        let mut forwarded = Vec::with_capacity(signature.inputs.len());
        let mut arg_tokens = Vec::new();
        for ty in &signature.inputs {
            match ty {
                Type::MemRef(mt) => {
                    let convert = convert_to_memref(self.m, mt, tokens);
                    let array_ty = array_struct_type(mt.rank());
                    let mut b = Builder::at_end(self.m, entry);
                    let mut array = b.undef(array_ty);
                    for i in 0..5u32 {
                        let Some(v) = next.next() else { return false };
                        array = b.insert_value(array, v, vec![i]);
                    }
                    if mt.rank() > 0 {
                        for part in [5u32, 6] {
                            let mut values = Vec::with_capacity(mt.rank());
                            for _ in 0..mt.rank() {
                                let Some(v) = next.next() else { return false };
                                values.push(v);
                            }
                            let packed = i64_array(&mut b, &values);
                            array = b.insert_value(array, packed, vec![part]);
                        }
                    }
                    let call = b.call(&convert, vec![array], vec![descriptor_type(mt.rank())]);
                    let desc = b.module().result(call, 0);
                    if tokens {
                        arg_tokens.push(b.extract_value(desc, vec![0]));
                    }
                    forwarded.push(desc);
                }
                _ => match next.next() {
                    Some(v) => forwarded.push(v),
                    None => return false,
                },
            }
        }
        Builder::at_end(self.m, entry).br(old_entry, forwarded);

        let returns: Vec<OpId> = self
            .m
            .walk_op(func)
            .into_iter()
            .filter(|op| self.m.tag(*op) == OpTag::Return)
            .collect();
        for ret in returns {
            let values = self.m.operands(ret).to_vec();
            let mut stored = Vec::with_capacity(values.len());
            for (value, ty) in values.iter().zip(&signature.results) {
                match ty {
                    Type::MemRef(mt) => {
                        let convert = convert_from_memref(self.m, mt, tokens);
                        let call = Builder::before(self.m, ret).call(&convert, vec![*value], vec![array_struct_type(mt.rank())]);
                        stored.push(self.m.result(call, 0));
                    }
                    _ => stored.push(*value),
                }
            }
            if tokens {
                let handles: Vec<ValueId> = values
                    .iter()
                    .zip(&signature.results)
                    .filter(|(_, ty)| matches!(ty, Type::MemRef(_)))
                    .map(|(value, _)| *value)
                    .collect();
                release_return_tokens(&mut Builder::before(self.m, ret), &handles, &arg_tokens);
            }
            let mut b = Builder::before(self.m, ret);
            match stored.len() {
                0 => {}
                1 => {
                    b.l_store(stored[0], result_out);
                }
                n => {
                    let types: Vec<Type> = stored.iter().map(|v| b.module().value_type(*v).clone()).collect();
                    let packed_ty = if types.windows(2).all(|w| w[0] == w[1]) {
                        Type::Array(Box::new(types[0].clone()), n as u64)
                    } else {
                        Type::Struct(types)
                    };
                    let mut packed = b.undef(packed_ty);
                    for (i, v) in stored.into_iter().enumerate() {
                        packed = b.insert_value(packed, v, vec![i as u32]);
                    }
                    b.l_store(packed, result_out);
                }
            }
            let status = b.const_int(0, Type::i32());
            b.return_(vec![status]);
            self.m.erase_op(ret);
        }

        self.m.set_kind(
            func,
            OpKind::Func {
                name,
                ty: FunctionType::new(inputs, vec![Type::i32()]),
                visibility,
            },
        );
        true
    }

    fn check_low_level(&self) {
        for op in self.m.walk() {
            if !is_low_level(self.m.tag(op)) {
                self.session
                    .error(Some(op), format!("{} survived low-level lowering", self.m.kind(op).name()));
            }
        }
    }
}

/// Scalar members of a struct field, arrays expanded.
fn flatten_field(ty: Type) -> Vec<Type> {
    match ty {
        Type::Array(elem, n) => vec![*elem; n as usize],
        other => vec![other],
    }
}

const SIZES: u32 = 3;
const STRIDES: u32 = 4;

/// Descriptor offset, or the constant when `known` is static.
fn offset_of(b: &mut Builder<'_>, desc: ValueId, known: Dim) -> ValueId {
    match known {
        Dim::Static(v) => b.const_int(v, Type::i64()),
        Dim::Dynamic => b.extract_value(desc, vec![2]),
    }
}

/// Element `index` of the sizes or strides array, or the constant when
/// `known` is static.
fn field(b: &mut Builder<'_>, desc: ValueId, known: Dim, array: u32, index: u32) -> ValueId {
    match known {
        Dim::Static(v) => b.const_int(v, Type::i64()),
        Dim::Dynamic => b.extract_value(desc, vec![array, index]),
    }
}

/// Bound `position` of a slice tuple, wrapped and clamped to `[0, size]`.
fn slice_bound(b: &mut Builder<'_>, slice: ValueId, position: u32, size: ValueId) -> ValueId {
    let raw = b.extract_value(slice, vec![position]);
    let zero = b.const_int(0, Type::i64());
    let negative = b.cmpi(IntPredicate::Slt, raw, zero);
    let wrapped = b.binary(BinOp::AddI, raw, size);
    let bound = b.select(negative, wrapped, raw);
    let bound = b.binary(BinOp::MaxSI, bound, zero);
    b.binary(BinOp::MinSI, bound, size)
}

/// Row-major strides for `sizes`, in elements.
fn row_major_strides(b: &mut Builder<'_>, sizes: &[ValueId]) -> Vec<ValueId> {
    let mut strides = Vec::with_capacity(sizes.len());
    let mut running = b.const_int(1, Type::i64());
    for (i, size) in sizes.iter().enumerate().rev() {
        strides.push(running);
        if i > 0 {
            running = b.binary(BinOp::MulI, running, *size);
        }
    }
    strides.reverse();
    strides
}

fn i64_array(b: &mut Builder<'_>, values: &[ValueId]) -> ValueId {
    let mut array = b.undef(Type::Array(Box::new(Type::i64()), values.len() as u64));
    for (i, v) in values.iter().enumerate() {
        array = b.insert_value(array, *v, vec![i as u32]);
    }
    array
}

fn build_descriptor(
    b: &mut Builder<'_>,
    allocated: ValueId,
    aligned: ValueId,
    offset: ValueId,
    sizes: &[ValueId],
    strides: &[ValueId],
) -> ValueId {
    let mut desc = b.undef(descriptor_type(sizes.len()));
    desc = b.insert_value(desc, allocated, vec![0]);
    desc = b.insert_value(desc, aligned, vec![1]);
    desc = b.insert_value(desc, offset, vec![2]);
    if !sizes.is_empty() {
        let sizes = i64_array(b, sizes);
        desc = b.insert_value(desc, sizes, vec![3]);
        let strides = i64_array(b, strides);
        desc = b.insert_value(desc, strides, vec![4]);
    }
    desc
}

/// Pointer to the element at `indices`: `aligned + offset + sum(index * stride)`.
fn element_ptr(b: &mut Builder<'_>, desc: ValueId, mt: &MemRefType, indices: &[ValueId]) -> Option<ValueId> {
    if indices.len() != mt.rank() {
        return None;
    }
    let elem = convert_type(&mt.elem)?;
    let layout = mt.strides_and_offset();
    let mut linear = offset_of(b, desc, layout.offset);
    for (i, index) in indices.iter().enumerate() {
        let stride = field(b, desc, layout.strides[i], STRIDES, i as u32);
        let scaled = b.binary(BinOp::MulI, *index, stride);
        linear = b.binary(BinOp::AddI, linear, scaled);
    }
    let aligned = b.extract_value(desc, vec![1]);
    Some(b.gep(aligned, elem, vec![GepIndex::Dynamic], vec![linear]))
}

/// Allocation handle for `meminfo`: the pointer itself, or a fresh token cell
/// holding it.
fn wrap_meminfo(b: &mut Builder<'_>, tokens: bool, meminfo: ValueId) -> ValueId {
    if !tokens {
        return meminfo;
    }
    declare_function(b.module(), CREATE_TOKEN_FN, FunctionType::new(vec![], vec![Type::Ptr]));
    let call = b.call(CREATE_TOKEN_FN, vec![], vec![Type::Ptr]);
    let token = b.module().result(call, 0);
    b.l_store(meminfo, token);
    token
}

fn unwrap_meminfo(b: &mut Builder<'_>, tokens: bool, handle: ValueId) -> ValueId {
    if tokens {
        b.l_load(handle, Type::Ptr)
    } else {
        handle
    }
}

fn destroy_token(b: &mut Builder<'_>, token: ValueId) {
    declare_function(b.module(), DESTROY_TOKEN_FN, FunctionType::new(vec![Type::Ptr], vec![]));
    b.call(DESTROY_TOKEN_FN, vec![token], vec![]);
}

/// Destroy the token cells a public function owns when it returns: every
/// cell created for an argument on entry, and the cell of each returned
/// descriptor that is neither an argument cell nor returned earlier in the
/// same statement. Duplicates are compared at run time and replaced by null,
/// which `nmrtDestroyAllocToken` ignores.
fn release_return_tokens(b: &mut Builder<'_>, returned: &[ValueId], arg_tokens: &[ValueId]) {
    let arg_bits: Vec<ValueId> = arg_tokens.iter().map(|t| b.ptr_to_int(*t)).collect();
    let mut seen = arg_bits.clone();
    for desc in returned {
        let handle = b.extract_value(*desc, vec![0]);
        let bits = b.ptr_to_int(handle);
        let mut owned = b.const_int(1, Type::i1());
        for other in &seen {
            let distinct = b.cmpi(IntPredicate::Ne, bits, *other);
            owned = b.binary(BinOp::AndI, owned, distinct);
        }
        let null = b.null_ptr();
        let victim = b.select(owned, handle, null);
        destroy_token(b, victim);
        seen.push(bits);
    }
    for token in arg_tokens {
        destroy_token(b, *token);
    }
}

/// Private function `name` with an entry block, appended to the module.
fn private_function(m: &mut Module, name: &str, ty: FunctionType) -> (OpId, BlockId) {
    let body = m.body();
    let func = Builder::at_end(m, body).func(name, ty, Visibility::Private);
    let entry = m.body_block(func, 0);
    (func, entry)
}

/// Blocks for a null check of `ptr` at the end of `entry`: returns the
/// non-null block and the exit block, which already returns.
fn null_guard(m: &mut Module, func: OpId, entry: BlockId, ptr: ValueId) -> (BlockId, BlockId) {
    let region = m.region(func, 0);
    let work = m.create_block(&[]);
    m.push_block(region, work);
    let exit = m.create_block(&[]);
    m.push_block(region, exit);
    Builder::at_end(m, exit).return_(vec![]);
    let mut b = Builder::at_end(m, entry);
    let address = b.ptr_to_int(ptr);
    let zero = b.const_int(0, Type::i64());
    let is_null = b.cmpi(IntPredicate::Eq, address, zero);
    b.cond_br(is_null, exit, vec![], work, vec![]);
    (work, exit)
}

/// Emit `NRT_incref` and `NRT_decref` once per module.
fn ensure_refcount_helpers(m: &mut Module) {
    if m.lookup_function(INCREF_FN).is_some() {
        return;
    }
    let ty = FunctionType::new(vec![Type::Ptr], vec![]);

    let (incref, entry) = private_function(m, INCREF_FN, ty.clone());
    let meminfo = m.block_arg(entry, 0);
    let (work, exit) = null_guard(m, incref, entry, meminfo);
    let mut b = Builder::at_end(m, work);
    let refcnt = b.struct_gep(meminfo, meminfo_type(), 0);
    let one = b.const_int(1, Type::i64());
    b.l_atomic_rmw(LowRmwKind::Add, AtomicOrdering::SeqCst, refcnt, one);
    b.br(exit, vec![]);

    declare_function(m, CALL_DTOR_FN, ty.clone());
    let (decref, entry) = private_function(m, DECREF_FN, ty);
    let meminfo = m.block_arg(entry, 0);
    let (work, exit) = null_guard(m, decref, entry, meminfo);
    let release = m.create_block(&[]);
    m.insert_block_before(exit, release);
    let mut b = Builder::at_end(m, work);
    let refcnt = b.struct_gep(meminfo, meminfo_type(), 0);
    let one = b.const_int(1, Type::i64());
    let old = b.l_atomic_rmw(LowRmwKind::Sub, AtomicOrdering::SeqCst, refcnt, one);
    let last = b.cmpi(IntPredicate::Eq, old, one);
    b.cond_br(last, release, vec![], exit, vec![]);
    let mut b = Builder::at_end(m, release);
    b.call(CALL_DTOR_FN, vec![meminfo], vec![]);
    b.br(exit, vec![]);
}

/// `<dtor>_wrapper(ptr, size, dtor_data)` calling `dtor(dtor_data, ptr)`.
fn dtor_wrapper(m: &mut Module, dtor: &str) -> String {
    let name = format!("{}_wrapper", dtor);
    if m.lookup_function(&name).is_some() {
        return name;
    }
    let ty = FunctionType::new(vec![Type::Ptr, Type::i64(), Type::Ptr], vec![]);
    let (_, entry) = private_function(m, &name, ty);
    let ptr = m.block_arg(entry, 0);
    let data = m.block_arg(entry, 2);
    let mut b = Builder::at_end(m, entry);
    b.call(dtor, vec![data, ptr], vec![]);
    b.return_(vec![]);
    name
}

fn conversion_suffix(mt: &MemRefType) -> String {
    if mt.rank() == 0 {
        mt.elem.to_string()
    } else {
        format!("{}x{}", mt.rank(), mt.elem)
    }
}

fn elem_size(mt: &MemRefType) -> i64 {
    convert_type(&mt.elem)
        .and_then(|t| t.size_in_bytes())
        .map_or(1, |s| s as i64)
}

/// `__convert_to_memref_*`: external array struct to descriptor.
fn convert_to_memref(m: &mut Module, mt: &MemRefType, tokens: bool) -> String {
    let name = format!("__convert_to_memref_{}", conversion_suffix(mt));
    if m.lookup_function(&name).is_some() {
        return name;
    }
    let rank = mt.rank();
    let ty = FunctionType::new(vec![array_struct_type(rank)], vec![descriptor_type(rank)]);
    let (func, entry) = private_function(m, &name, ty);
    m.set_attr(func, names::FORCE_INLINE, Attribute::Unit);
    let array = m.block_arg(entry, 0);
    let mut b = Builder::at_end(m, entry);
    let meminfo = b.extract_value(array, vec![0]);
    let data = b.extract_value(array, vec![4]);
    let allocated = wrap_meminfo(&mut b, tokens, meminfo);
    let offset = b.const_int(0, Type::i64());
    let itemsize = b.const_int(elem_size(mt), Type::i64());
    let mut sizes = Vec::with_capacity(rank);
    let mut strides = Vec::with_capacity(rank);
    for i in 0..rank as u32 {
        sizes.push(b.extract_value(array, vec![5, i]));
        let bytes = b.extract_value(array, vec![6, i]);
        strides.push(b.binary(BinOp::DivSI, bytes, itemsize));
    }
    let desc = build_descriptor(&mut b, allocated, data, offset, &sizes, &strides);
    b.return_(vec![desc]);
    name
}

/// `__convert_from_memref_*`: descriptor to external array struct.
fn convert_from_memref(m: &mut Module, mt: &MemRefType, tokens: bool) -> String {
    let name = format!("__convert_from_memref_{}", conversion_suffix(mt));
    if m.lookup_function(&name).is_some() {
        return name;
    }
    let rank = mt.rank();
    let elem = convert_type(&mt.elem).unwrap_or(Type::i8());
    let ty = FunctionType::new(vec![descriptor_type(rank)], vec![array_struct_type(rank)]);
    let (func, entry) = private_function(m, &name, ty);
    m.set_attr(func, names::FORCE_INLINE, Attribute::Unit);
    let desc = m.block_arg(entry, 0);
    let mut b = Builder::at_end(m, entry);
    let allocated = b.extract_value(desc, vec![0]);
    let meminfo = unwrap_meminfo(&mut b, tokens, allocated);
    let aligned = b.extract_value(desc, vec![1]);
    let offset = b.extract_value(desc, vec![2]);
    let data = b.gep(aligned, elem, vec![GepIndex::Dynamic], vec![offset]);
    let itemsize = b.const_int(elem_size(mt), Type::i64());
    let mut nitems = b.const_int(1, Type::i64());
    let mut sizes = Vec::with_capacity(rank);
    let mut strides = Vec::with_capacity(rank);
    for i in 0..rank as u32 {
        let size = b.extract_value(desc, vec![3, i]);
        nitems = b.binary(BinOp::MulI, nitems, size);
        sizes.push(size);
        let stride = b.extract_value(desc, vec![4, i]);
        strides.push(b.binary(BinOp::MulI, stride, itemsize));
    }
    let parent = b.null_ptr();
    let mut array = b.undef(array_struct_type(rank));
    array = b.insert_value(array, meminfo, vec![0]);
    array = b.insert_value(array, parent, vec![1]);
    array = b.insert_value(array, nitems, vec![2]);
    array = b.insert_value(array, itemsize, vec![3]);
    array = b.insert_value(array, data, vec![4]);
    if rank > 0 {
        let shape = i64_array(&mut b, &sizes);
        array = b.insert_value(array, shape, vec![5]);
        let strides = i64_array(&mut b, &strides);
        array = b.insert_value(array, strides, vec![6]);
    }
    b.return_(vec![array]);
    name
}
