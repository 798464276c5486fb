// This module defines the closed operation catalog of the IR as one tagged enum. Each variant
// carries only its static properties (predicates, static offsets/sizes/strides, callee names,
// element types of low-level memory ops); operands, results, regions and successors live in
// the module arena. The catalog spans four levels: function and arithmetic ops, structured
// control flow (if/for/while/parallel), the shaped-array layer (memref, tensor, linalg and
// the layout/provenance ops: change_layout, sign_cast, environment regions, retain,
// tuples, alloc tokens), and the low-level layer that maps one-to-one onto LLVM IR
// (alloca, load/store through pointers, GEP, aggregates, atomics, branches and the task
// parallel detach/reattach/sync terminators). `OpTag` is the field-less discriminant used
// to key rewrite rules; it also provides the printable op name.

//! Operation kinds.

use super::attrs::EnvAttr;
use super::types::{Dim, Type};

/// Constant payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Float(f64),
    /// Null pointer.
    Null,
}

impl ConstValue {
    pub fn as_int(self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    AddI,
    SubI,
    MulI,
    DivSI,
    DivUI,
    RemSI,
    RemUI,
    AndI,
    OrI,
    XorI,
    ShlI,
    ShrSI,
    ShrUI,
    MaxSI,
    MinSI,
    AddF,
    SubF,
    MulF,
    DivF,
    MaxF,
    MinF,
}

impl BinOp {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            BinOp::AddF | BinOp::SubF | BinOp::MulF | BinOp::DivF | BinOp::MaxF | BinOp::MinF
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::AddI
                | BinOp::MulI
                | BinOp::AndI
                | BinOp::OrI
                | BinOp::XorI
                | BinOp::MaxSI
                | BinOp::MinSI
                | BinOp::AddF
                | BinOp::MulF
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            BinOp::AddI => "arith.addi",
            BinOp::SubI => "arith.subi",
            BinOp::MulI => "arith.muli",
            BinOp::DivSI => "arith.divsi",
            BinOp::DivUI => "arith.divui",
            BinOp::RemSI => "arith.remsi",
            BinOp::RemUI => "arith.remui",
            BinOp::AndI => "arith.andi",
            BinOp::OrI => "arith.ori",
            BinOp::XorI => "arith.xori",
            BinOp::ShlI => "arith.shli",
            BinOp::ShrSI => "arith.shrsi",
            BinOp::ShrUI => "arith.shrui",
            BinOp::MaxSI => "arith.maxsi",
            BinOp::MinSI => "arith.minsi",
            BinOp::AddF => "arith.addf",
            BinOp::SubF => "arith.subf",
            BinOp::MulF => "arith.mulf",
            BinOp::DivF => "arith.divf",
            BinOp::MaxF => "arith.maxf",
            BinOp::MinF => "arith.minf",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl IntPredicate {
    pub fn evaluate(self, a: i64, b: i64) -> bool {
        let (ua, ub) = (a as u64, b as u64);
        match self {
            IntPredicate::Eq => a == b,
            IntPredicate::Ne => a != b,
            IntPredicate::Slt => a < b,
            IntPredicate::Sle => a <= b,
            IntPredicate::Sgt => a > b,
            IntPredicate::Sge => a >= b,
            IntPredicate::Ult => ua < ub,
            IntPredicate::Ule => ua <= ub,
            IntPredicate::Ugt => ua > ub,
            IntPredicate::Uge => ua >= ub,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatPredicate {
    OEq,
    ONe,
    OLt,
    OLe,
    OGt,
    OGe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastKind {
    IndexCast,
    ExtSI,
    ExtUI,
    TruncI,
    SIToFP,
    UIToFP,
    FPToSI,
    FPToUI,
    ExtF,
    TruncF,
}

/// Read-modify-write kinds of the shaped-array layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicRmwKind {
    AddF,
    AddI,
    Assign,
    MaxS,
    MaxU,
    MinS,
    MinU,
    OrI,
    AndI,
}

/// Read-modify-write kinds of the low-level layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LowRmwKind {
    Add,
    Sub,
    FAdd,
    Xchg,
    Max,
    UMax,
    Min,
    UMin,
    Or,
    And,
}

impl From<AtomicRmwKind> for LowRmwKind {
    fn from(kind: AtomicRmwKind) -> Self {
        match kind {
            AtomicRmwKind::AddF => LowRmwKind::FAdd,
            AtomicRmwKind::AddI => LowRmwKind::Add,
            AtomicRmwKind::Assign => LowRmwKind::Xchg,
            AtomicRmwKind::MaxS => LowRmwKind::Max,
            AtomicRmwKind::MaxU => LowRmwKind::UMax,
            AtomicRmwKind::MinS => LowRmwKind::Min,
            AtomicRmwKind::MinU => LowRmwKind::UMin,
            AtomicRmwKind::OrI => LowRmwKind::Or,
            AtomicRmwKind::AndI => LowRmwKind::And,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOrdering {
    Monotonic,
    AcqRel,
    SeqCst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    Private,
}

/// One GEP index: a constant (required for struct fields) or the next dynamic operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GepIndex {
    Const(i32),
    Dynamic,
}

/// Static slicing parameters shared by subview and extract_slice. Dynamic
/// entries are supplied by operands, in offsets/sizes/strides order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SliceParams {
    pub offsets: Vec<Dim>,
    pub sizes: Vec<Dim>,
    pub strides: Vec<Dim>,
}

impl SliceParams {
    pub fn num_dynamic(&self) -> usize {
        self.offsets
            .iter()
            .chain(&self.sizes)
            .chain(&self.strides)
            .filter(|d| d.is_dynamic())
            .count()
    }
}

/// Operation kind with its static properties.
///
/// Operand, result and region conventions are listed per variant.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Region 0 is the body; an empty region is an external declaration.
    Func {
        name: String,
        ty: crate::ir::types::FunctionType,
        visibility: Visibility,
    },
    /// Operands: returned values.
    Return,
    /// Operands: arguments.
    Call { callee: String },

    Constant(ConstValue),
    /// Operands: lhs, rhs.
    Binary(BinOp),
    CmpI(IntPredicate),
    CmpF(FloatPredicate),
    /// Operands: condition, true value, false value.
    Select,
    Cast(CastKind),

    /// Operands: condition. Regions: then, else; each ends in `Yield`.
    If,
    /// Operands: lower, upper, step, inits. Body block args: iv, iter values.
    For,
    /// Operands: inits. Region 0 (before) ends in `Condition`, region 1
    /// (after) receives the forwarded values and ends in `Yield`.
    While,
    /// Operands: lowers, uppers, steps (`num_dims` each). Body block args: ivs.
    Parallel { num_dims: usize },
    Yield,
    /// Operands: condition, forwarded values.
    Condition,

    /// Operands: dynamic extents.
    Alloc,
    Alloca,
    /// Operands: source, new extent.
    Realloc,
    Dealloc,
    /// Operands: memref, indices.
    Load,
    /// Operands: value, memref, indices.
    Store,
    /// Operands: value, memref, indices.
    AtomicRmw(AtomicRmwKind),
    /// Operands: source, dimension index.
    Dim,
    /// Operands: source, dynamic slice parameters.
    Subview(SliceParams),
    MemrefCast,
    /// Operands: source, dynamic offset/sizes/strides.
    ReinterpretCast {
        offset: Dim,
        sizes: Vec<Dim>,
        strides: Vec<Dim>,
    },
    ExpandShape { reassociation: Vec<Vec<usize>> },
    CollapseShape { reassociation: Vec<Vec<usize>> },
    /// Operands: source, target.
    Copy,
    Clone,

    TensorCast,
    FromElements,
    /// Operands: tensor, indices.
    Extract,
    ExtractSlice(SliceParams),

    /// Operands: fill value, output memref.
    LinalgFill,
    /// Elementwise generic with identity indexing. Operands: inputs then
    /// outputs. Body block args: one scalar per operand; yields output scalars.
    LinalgGeneric { num_inputs: usize },

    ChangeLayout,
    SignCast,
    /// Operands: environment args. Region 0 ends in `EnvYield`.
    EnvRegion { env: EnvAttr },
    EnvYield,
    Retain,
    BuildTuple,
    /// Operands: tuple, index.
    TupleExtract,
    Bitcast,
    MemrefBitcast,
    GetAllocToken,
    /// Operands: data pointer, destructor data. Result: allocation handle.
    WrapAllocatedPointer { dtor: String },
    /// Operands: source, target extents.
    Reshape,
    /// Operands: value, one extent per dimension. The result is the value,
    /// asserted to have those extents.
    EnforceShape,
    /// Operands: slice `(begin, end, step)` tuple, array, component index.
    /// Component 0, 1, 2 or 3 (begin, end, step, count) of the slice,
    /// normalized against extent `dim` of the array.
    SliceGetItem { dim: usize },
    Undef,

    /// Operands: element count.
    LAlloca { elem: Type },
    /// Operands: pointer.
    LLoad,
    /// Operands: value, pointer.
    LStore,
    /// Operands: base pointer, dynamic indices.
    Gep { elem: Type, indices: Vec<GepIndex> },
    /// Operands: aggregate, value.
    InsertValue { position: Vec<u32> },
    ExtractValue { position: Vec<u32> },
    /// Operands: pointer, value.
    LAtomicRmw {
        kind: LowRmwKind,
        ordering: AtomicOrdering,
    },
    AddressOf { symbol: String },
    PtrToInt,
    IntToPtr,
    /// Successor 0; operands are its block arguments.
    Br,
    /// Operands: condition, `true_args` true arguments, false arguments.
    CondBr { true_args: usize },
    Unreachable,
    SyncRegionStart,
    /// Operands: sync region. Successors: detached block, continuation.
    Detach,
    Reattach,
    Sync,
}

/// Field-less discriminant of [`OpKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpTag {
    Func,
    Return,
    Call,
    Constant,
    Binary,
    CmpI,
    CmpF,
    Select,
    Cast,
    If,
    For,
    While,
    Parallel,
    Yield,
    Condition,
    Alloc,
    Alloca,
    Realloc,
    Dealloc,
    Load,
    Store,
    AtomicRmw,
    Dim,
    Subview,
    MemrefCast,
    ReinterpretCast,
    ExpandShape,
    CollapseShape,
    Copy,
    Clone,
    TensorCast,
    FromElements,
    Extract,
    ExtractSlice,
    LinalgFill,
    LinalgGeneric,
    ChangeLayout,
    SignCast,
    EnvRegion,
    EnvYield,
    Retain,
    BuildTuple,
    TupleExtract,
    Bitcast,
    MemrefBitcast,
    GetAllocToken,
    WrapAllocatedPointer,
    Reshape,
    EnforceShape,
    SliceGetItem,
    Undef,
    LAlloca,
    LLoad,
    LStore,
    Gep,
    InsertValue,
    ExtractValue,
    LAtomicRmw,
    AddressOf,
    PtrToInt,
    IntToPtr,
    Br,
    CondBr,
    Unreachable,
    SyncRegionStart,
    Detach,
    Reattach,
    Sync,
}

impl OpKind {
    pub fn tag(&self) -> OpTag {
        match self {
            OpKind::Func { .. } => OpTag::Func,
            OpKind::Return => OpTag::Return,
            OpKind::Call { .. } => OpTag::Call,
            OpKind::Constant(_) => OpTag::Constant,
            OpKind::Binary(_) => OpTag::Binary,
            OpKind::CmpI(_) => OpTag::CmpI,
            OpKind::CmpF(_) => OpTag::CmpF,
            OpKind::Select => OpTag::Select,
            OpKind::Cast(_) => OpTag::Cast,
            OpKind::If => OpTag::If,
            OpKind::For => OpTag::For,
            OpKind::While => OpTag::While,
            OpKind::Parallel { .. } => OpTag::Parallel,
            OpKind::Yield => OpTag::Yield,
            OpKind::Condition => OpTag::Condition,
            OpKind::Alloc => OpTag::Alloc,
            OpKind::Alloca => OpTag::Alloca,
            OpKind::Realloc => OpTag::Realloc,
            OpKind::Dealloc => OpTag::Dealloc,
            OpKind::Load => OpTag::Load,
            OpKind::Store => OpTag::Store,
            OpKind::AtomicRmw(_) => OpTag::AtomicRmw,
            OpKind::Dim => OpTag::Dim,
            OpKind::Subview(_) => OpTag::Subview,
            OpKind::MemrefCast => OpTag::MemrefCast,
            OpKind::ReinterpretCast { .. } => OpTag::ReinterpretCast,
            OpKind::ExpandShape { .. } => OpTag::ExpandShape,
            OpKind::CollapseShape { .. } => OpTag::CollapseShape,
            OpKind::Copy => OpTag::Copy,
            OpKind::Clone => OpTag::Clone,
            OpKind::TensorCast => OpTag::TensorCast,
            OpKind::FromElements => OpTag::FromElements,
            OpKind::Extract => OpTag::Extract,
            OpKind::ExtractSlice(_) => OpTag::ExtractSlice,
            OpKind::LinalgFill => OpTag::LinalgFill,
            OpKind::LinalgGeneric { .. } => OpTag::LinalgGeneric,
            OpKind::ChangeLayout => OpTag::ChangeLayout,
            OpKind::SignCast => OpTag::SignCast,
            OpKind::EnvRegion { .. } => OpTag::EnvRegion,
            OpKind::EnvYield => OpTag::EnvYield,
            OpKind::Retain => OpTag::Retain,
            OpKind::BuildTuple => OpTag::BuildTuple,
            OpKind::TupleExtract => OpTag::TupleExtract,
            OpKind::Bitcast => OpTag::Bitcast,
            OpKind::MemrefBitcast => OpTag::MemrefBitcast,
            OpKind::GetAllocToken => OpTag::GetAllocToken,
            OpKind::WrapAllocatedPointer { .. } => OpTag::WrapAllocatedPointer,
            OpKind::Reshape => OpTag::Reshape,
            OpKind::EnforceShape => OpTag::EnforceShape,
            OpKind::SliceGetItem { .. } => OpTag::SliceGetItem,
            OpKind::Undef => OpTag::Undef,
            OpKind::LAlloca { .. } => OpTag::LAlloca,
            OpKind::LLoad => OpTag::LLoad,
            OpKind::LStore => OpTag::LStore,
            OpKind::Gep { .. } => OpTag::Gep,
            OpKind::InsertValue { .. } => OpTag::InsertValue,
            OpKind::ExtractValue { .. } => OpTag::ExtractValue,
            OpKind::LAtomicRmw { .. } => OpTag::LAtomicRmw,
            OpKind::AddressOf { .. } => OpTag::AddressOf,
            OpKind::PtrToInt => OpTag::PtrToInt,
            OpKind::IntToPtr => OpTag::IntToPtr,
            OpKind::Br => OpTag::Br,
            OpKind::CondBr { .. } => OpTag::CondBr,
            OpKind::Unreachable => OpTag::Unreachable,
            OpKind::SyncRegionStart => OpTag::SyncRegionStart,
            OpKind::Detach => OpTag::Detach,
            OpKind::Reattach => OpTag::Reattach,
            OpKind::Sync => OpTag::Sync,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Binary(op) => op.name(),
            _ => self.tag().name(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.tag().is_terminator()
    }

    /// No side effects: may be erased when unused and deduplicated.
    pub fn is_pure(&self) -> bool {
        use OpTag::*;
        matches!(
            self.tag(),
            Constant
                | Binary
                | CmpI
                | CmpF
                | Select
                | Cast
                | Dim
                | Subview
                | MemrefCast
                | ReinterpretCast
                | ExpandShape
                | CollapseShape
                | TensorCast
                | FromElements
                | Extract
                | ExtractSlice
                | ChangeLayout
                | SignCast
                | BuildTuple
                | TupleExtract
                | Bitcast
                | MemrefBitcast
                | GetAllocToken
                | Reshape
                | EnforceShape
                | SliceGetItem
                | Undef
                | Gep
                | InsertValue
                | ExtractValue
                | AddressOf
                | PtrToInt
                | IntToPtr
        )
    }
}

impl OpTag {
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            OpTag::Return
                | OpTag::Yield
                | OpTag::Condition
                | OpTag::EnvYield
                | OpTag::Br
                | OpTag::CondBr
                | OpTag::Unreachable
                | OpTag::Detach
                | OpTag::Reattach
                | OpTag::Sync
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            OpTag::Func => "func.func",
            OpTag::Return => "func.return",
            OpTag::Call => "func.call",
            OpTag::Constant => "arith.constant",
            OpTag::Binary => "arith.binary",
            OpTag::CmpI => "arith.cmpi",
            OpTag::CmpF => "arith.cmpf",
            OpTag::Select => "arith.select",
            OpTag::Cast => "arith.cast",
            OpTag::If => "scf.if",
            OpTag::For => "scf.for",
            OpTag::While => "scf.while",
            OpTag::Parallel => "scf.parallel",
            OpTag::Yield => "scf.yield",
            OpTag::Condition => "scf.condition",
            OpTag::Alloc => "memref.alloc",
            OpTag::Alloca => "memref.alloca",
            OpTag::Realloc => "memref.realloc",
            OpTag::Dealloc => "memref.dealloc",
            OpTag::Load => "memref.load",
            OpTag::Store => "memref.store",
            OpTag::AtomicRmw => "memref.atomic_rmw",
            OpTag::Dim => "memref.dim",
            OpTag::Subview => "memref.subview",
            OpTag::MemrefCast => "memref.cast",
            OpTag::ReinterpretCast => "memref.reinterpret_cast",
            OpTag::ExpandShape => "memref.expand_shape",
            OpTag::CollapseShape => "memref.collapse_shape",
            OpTag::Copy => "memref.copy",
            OpTag::Clone => "bufferization.clone",
            OpTag::TensorCast => "tensor.cast",
            OpTag::FromElements => "tensor.from_elements",
            OpTag::Extract => "tensor.extract",
            OpTag::ExtractSlice => "tensor.extract_slice",
            OpTag::LinalgFill => "linalg.fill",
            OpTag::LinalgGeneric => "linalg.generic",
            OpTag::ChangeLayout => "util.change_layout",
            OpTag::SignCast => "util.sign_cast",
            OpTag::EnvRegion => "util.env_region",
            OpTag::EnvYield => "util.env_region_yield",
            OpTag::Retain => "util.retain",
            OpTag::BuildTuple => "util.build_tuple",
            OpTag::TupleExtract => "util.tuple_extract",
            OpTag::Bitcast => "util.bitcast",
            OpTag::MemrefBitcast => "util.memref_bitcast",
            OpTag::GetAllocToken => "util.get_alloc_token",
            OpTag::WrapAllocatedPointer => "util.wrap_allocated_pointer",
            OpTag::Reshape => "util.reshape",
            OpTag::EnforceShape => "util.enforce_shape",
            OpTag::SliceGetItem => "plier.slice_getitem",
            OpTag::Undef => "ub.poison",
            OpTag::LAlloca => "llvm.alloca",
            OpTag::LLoad => "llvm.load",
            OpTag::LStore => "llvm.store",
            OpTag::Gep => "llvm.getelementptr",
            OpTag::InsertValue => "llvm.insertvalue",
            OpTag::ExtractValue => "llvm.extractvalue",
            OpTag::LAtomicRmw => "llvm.atomicrmw",
            OpTag::AddressOf => "llvm.mlir.addressof",
            OpTag::PtrToInt => "llvm.ptrtoint",
            OpTag::IntToPtr => "llvm.inttoptr",
            OpTag::Br => "cf.br",
            OpTag::CondBr => "cf.cond_br",
            OpTag::Unreachable => "llvm.unreachable",
            OpTag::SyncRegionStart => "tapir.syncregion_start",
            OpTag::Detach => "tapir.detach",
            OpTag::Reattach => "tapir.reattach",
            OpTag::Sync => "tapir.sync",
        }
    }
}
