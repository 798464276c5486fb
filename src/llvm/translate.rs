// This module translates a fully lowered module into an LLVM module through inkwell. Every
// function is declared first so calls and address-of can refer to functions defined later;
// private functions with bodies get internal linkage, everything else is external. Bodies are
// emitted block by block in reverse post-order. Entry block arguments map to the function
// parameters, the arguments of other blocks become phi nodes whose incoming values are filled
// once the whole function has been emitted, so back edges can refer to values defined later.
// Low-level ops map one-to-one onto LLVM instructions; the task-parallel terminators
// (detach/reattach/sync) serialize to plain branches since a stock LLVM has no tapir
// instructions, and the loop hints attached by tapirification become `llvm.loop` metadata on
// the latch branch. Functions returning several values return a literal struct.

//! Low-level IR to LLVM IR.

use std::ffi::c_char;

use hashbrown::HashMap;
use inkwell::attributes::{Attribute as LlvmAttribute, AttributeLoc};
use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder as LlvmBuilder;
use inkwell::context::Context;
use inkwell::module::{Linkage, Module as LlvmModule};
use inkwell::types::{AsTypeRef, BasicMetadataTypeEnum, BasicType, BasicTypeEnum, FunctionType as LlvmFunctionType};
use inkwell::values::{
    AggregateValueEnum, AsValueRef, BasicMetadataValueEnum, BasicValue, BasicValueEnum, FunctionValue,
    InstructionValue, PhiValue,
};
use inkwell::{AddressSpace, FloatPredicate as LlvmFloatPredicate, IntPredicate as LlvmIntPredicate};
use log::{debug, trace};

use crate::core::error::{TranslateError, TranslateResult};
use crate::ir::attrs::{names, Attribute};
use crate::ir::cfg::reverse_post_order;
use crate::ir::module::{BlockId, Module, OpId, ValueId};
use crate::ir::ops::{
    AtomicOrdering, BinOp, CastKind, ConstValue, FloatPredicate, GepIndex, IntPredicate, LowRmwKind, OpKind,
    OpTag, Visibility,
};
use crate::ir::types::{FloatKind, FunctionType, Type};
use crate::ir::verify::branch_args;

/// Function-level string attributes implied by fastmath.
const FASTMATH_FN_ATTRS: [&str; 5] = [
    "unsafe-fp-math",
    "no-infs-fp-math",
    "no-nans-fp-math",
    "no-signed-zeros-fp-math",
    "approx-func-fp-math",
];

/// Translate `ir` into a fresh LLVM module owned by `context`. The module is
/// verified before it is returned.
pub fn translate_module<'ctx>(context: &'ctx Context, ir: &Module) -> TranslateResult<LlvmModule<'ctx>> {
    let mut translator = Translator::new(context, ir);
    translator.declare_functions()?;
    for func in ir.functions() {
        if !ir.region_blocks(ir.region(func, 0)).is_empty() {
            translator.translate_function(func)?;
        }
    }
    translator
        .module
        .verify()
        .map_err(|e| TranslateError::Verify { reason: e.to_string() })?;
    debug!("translated module {}", ir.name());
    Ok(translator.module)
}

struct Translator<'ctx, 'ir> {
    context: &'ctx Context,
    module: LlvmModule<'ctx>,
    builder: LlvmBuilder<'ctx>,
    ir: &'ir Module,
    functions: HashMap<String, FunctionValue<'ctx>>,

    // per function
    current: Option<(FunctionValue<'ctx>, String)>,
    values: HashMap<ValueId, BasicValueEnum<'ctx>>,
    blocks: HashMap<BlockId, BasicBlock<'ctx>>,
    phis: HashMap<BlockId, Vec<PhiValue<'ctx>>>,
    incoming: Vec<(BlockId, BasicBlock<'ctx>, Vec<ValueId>)>,
    insert_block: Option<BasicBlock<'ctx>>,
}

impl<'ctx, 'ir> Translator<'ctx, 'ir> {
    fn new(context: &'ctx Context, ir: &'ir Module) -> Self {
        Self {
            context,
            module: context.create_module(ir.name()),
            builder: context.create_builder(),
            ir,
            functions: HashMap::new(),
            current: None,
            values: HashMap::new(),
            blocks: HashMap::new(),
            phis: HashMap::new(),
            incoming: Vec::new(),
            insert_block: None,
        }
    }

    // ---------------------------------------------------------------------
    // Types
    // ---------------------------------------------------------------------

    fn basic_type(&self, ty: &Type) -> TranslateResult<BasicTypeEnum<'ctx>> {
        Ok(match ty {
            Type::Index => self.context.i64_type().into(),
            Type::Int(int) => self.context.custom_width_int_type(int.width).into(),
            Type::Float(FloatKind::F16) => self.context.f16_type().into(),
            Type::Float(FloatKind::F32) => self.context.f32_type().into(),
            Type::Float(FloatKind::F64) => self.context.f64_type().into(),
            Type::Ptr => self.context.ptr_type(AddressSpace::default()).into(),
            Type::Struct(fields) => {
                let fields = fields
                    .iter()
                    .map(|f| self.basic_type(f))
                    .collect::<TranslateResult<Vec<_>>>()?;
                self.context.struct_type(&fields, false).into()
            }
            Type::Array(elem, len) => self.basic_type(elem)?.array_type(*len as u32).into(),
            other => {
                return Err(TranslateError::UnsupportedType { ty: other.to_string() });
            }
        })
    }

    fn function_type(&self, ty: &FunctionType) -> TranslateResult<LlvmFunctionType<'ctx>> {
        let params = ty
            .inputs
            .iter()
            .map(|t| self.basic_type(t).map(BasicMetadataTypeEnum::from))
            .collect::<TranslateResult<Vec<_>>>()?;
        Ok(match ty.results.as_slice() {
            [] => self.context.void_type().fn_type(&params, false),
            [single] => self.basic_type(single)?.fn_type(&params, false),
            many => self.basic_type(&Type::Struct(many.to_vec()))?.fn_type(&params, false),
        })
    }

    fn result_type(&self, op: OpId) -> TranslateResult<BasicTypeEnum<'ctx>> {
        self.basic_type(self.ir.value_type(self.ir.result(op, 0)))
    }

    // ---------------------------------------------------------------------
    // Functions
    // ---------------------------------------------------------------------

    fn declare_functions(&mut self) -> TranslateResult<()> {
        for func in self.ir.functions() {
            let OpKind::Func { name, ty, visibility } = self.ir.kind(func) else {
                continue;
            };
            let has_body = !self.ir.region_blocks(self.ir.region(func, 0)).is_empty();
            let linkage = match (visibility, has_body) {
                (Visibility::Private, true) => Linkage::Internal,
                _ => Linkage::External,
            };
            let function = self.module.add_function(name, self.function_type(ty)?, Some(linkage));
            if self.ir.attr(func, names::FORCE_INLINE).is_some() {
                let kind = LlvmAttribute::get_named_enum_kind_id("alwaysinline");
                function.add_attribute(AttributeLoc::Function, self.context.create_enum_attribute(kind, 0));
            }
            if self.ir.attr(func, names::FASTMATH).is_some() {
                for key in FASTMATH_FN_ATTRS {
                    function.add_attribute(AttributeLoc::Function, self.context.create_string_attribute(key, "true"));
                }
            }
            trace!("declared @{} ({:?})", name, linkage);
            self.functions.insert(name.clone(), function);
        }
        Ok(())
    }

    fn translate_function(&mut self, func: OpId) -> TranslateResult<()> {
        let ir = self.ir;
        let name = match ir.kind(func) {
            OpKind::Func { name, .. } => name.clone(),
            _ => return Err(TranslateError::UnsupportedOp { op: ir.tag(func).name() }),
        };
        let function = *self
            .functions
            .get(&name)
            .ok_or_else(|| TranslateError::UndefinedValue { function: name.clone() })?;
        self.current = Some((function, name));
        self.values.clear();
        self.blocks.clear();
        self.phis.clear();
        self.incoming.clear();

        let region = ir.region(func, 0);
        let order = reverse_post_order(ir, region);
        for block in &order {
            let bb = self.context.append_basic_block(function, "");
            self.blocks.insert(*block, bb);
        }
        for (i, block) in order.iter().enumerate() {
            let bb = self.blocks[block];
            self.builder.position_at_end(bb);
            self.insert_block = Some(bb);
            if i == 0 {
                for (index, arg) in ir.block_args(*block).iter().enumerate() {
                    let param = function
                        .get_nth_param(index as u32)
                        .ok_or_else(|| self.undefined())?;
                    self.values.insert(*arg, param);
                }
            } else {
                let mut phis = Vec::new();
                for arg in ir.block_args(*block) {
                    let phi = self.builder.build_phi(self.basic_type(ir.value_type(*arg))?, "")?;
                    self.values.insert(*arg, phi.as_basic_value());
                    phis.push(phi);
                }
                self.phis.insert(*block, phis);
            }
            for op in ir.block_ops(*block) {
                self.translate_op(*op)?;
            }
        }
        self.resolve_phis()
    }

    fn resolve_phis(&mut self) -> TranslateResult<()> {
        let incoming = std::mem::take(&mut self.incoming);
        for (dest, from, args) in incoming {
            let Some(phis) = self.phis.get(&dest) else {
                continue;
            };
            for (phi, arg) in phis.iter().zip(&args) {
                let value = self.value(*arg)?;
                phi.add_incoming(&[(&value as &dyn BasicValue<'ctx>, from)]);
            }
        }
        Ok(())
    }

    fn undefined(&self) -> TranslateError {
        TranslateError::UndefinedValue {
            function: self.current.as_ref().map(|(_, n)| n.clone()).unwrap_or_default(),
        }
    }

    fn value(&self, v: ValueId) -> TranslateResult<BasicValueEnum<'ctx>> {
        self.values.get(&v).copied().ok_or_else(|| self.undefined())
    }

    fn operand(&self, op: OpId, index: usize) -> TranslateResult<BasicValueEnum<'ctx>> {
        self.value(self.ir.operand(op, index))
    }

    fn block(&self, block: BlockId) -> TranslateResult<BasicBlock<'ctx>> {
        self.blocks.get(&block).copied().ok_or_else(|| self.undefined())
    }

    fn branch_to(&mut self, op: OpId, index: usize) -> TranslateResult<BasicBlock<'ctx>> {
        let dest = self.ir.successors(op)[index];
        let from = self.insert_block.ok_or_else(|| self.undefined())?;
        self.incoming.push((dest, from, branch_args(self.ir, op, index)));
        self.block(dest)
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    fn translate_op(&mut self, op: OpId) -> TranslateResult<()> {
        let ir = self.ir;
        let b = &self.builder;
        let result: Option<BasicValueEnum<'ctx>> = match ir.kind(op) {
            OpKind::Constant(value) => Some(self.constant(*value, self.result_type(op)?)?),
            OpKind::Binary(kind) => Some(self.binary(*kind, self.operand(op, 0)?, self.operand(op, 1)?)?),
            OpKind::CmpI(pred) => {
                let (l, r) = (self.operand(op, 0)?, self.operand(op, 1)?);
                Some(
                    b.build_int_compare(int_predicate(*pred), l.into_int_value(), r.into_int_value(), "")?
                        .into(),
                )
            }
            OpKind::CmpF(pred) => {
                let (l, r) = (self.operand(op, 0)?, self.operand(op, 1)?);
                Some(
                    b.build_float_compare(float_predicate(*pred), l.into_float_value(), r.into_float_value(), "")?
                        .into(),
                )
            }
            OpKind::Select => {
                let cond = self.operand(op, 0)?.into_int_value();
                Some(b.build_select(cond, self.operand(op, 1)?, self.operand(op, 2)?, "")?)
            }
            OpKind::Cast(kind) => Some(self.cast(*kind, self.operand(op, 0)?, self.result_type(op)?)?),
            OpKind::Bitcast => Some(b.build_bit_cast(self.operand(op, 0)?, self.result_type(op)?, "")?),
            OpKind::Undef => {
                let ty = self.result_type(op)?;
                // SAFETY: LLVMGetUndef returns a constant of the given first-class type.
                Some(unsafe { BasicValueEnum::new(llvm_sys::core::LLVMGetUndef(ty.as_type_ref())) })
            }

            OpKind::Call { callee } => {
                let function = *self
                    .functions
                    .get(callee)
                    .ok_or_else(|| self.undefined())?;
                let args = ir
                    .operands(op)
                    .iter()
                    .map(|a| self.value(*a).map(BasicMetadataValueEnum::from))
                    .collect::<TranslateResult<Vec<_>>>()?;
                let call = self.builder.build_call(function, &args, "")?;
                let returned = call.try_as_basic_value().basic();
                match (ir.num_results(op), returned) {
                    (0, _) => None,
                    (1, Some(v)) => Some(v),
                    (n, Some(v)) => {
                        let agg = aggregate(v)?;
                        for i in 0..n {
                            let member = self.builder.build_extract_value(agg, i as u32, "")?;
                            self.values.insert(ir.result(op, i), member);
                        }
                        None
                    }
                    (_, None) => return Err(self.undefined()),
                }
            }
            OpKind::Return => {
                let values = ir
                    .operands(op)
                    .iter()
                    .map(|v| self.value(*v))
                    .collect::<TranslateResult<Vec<_>>>()?;
                match values.as_slice() {
                    [] => b.build_return(None)?,
                    [single] => b.build_return(Some(single as &dyn BasicValue<'ctx>))?,
                    many => b.build_aggregate_return(many)?,
                };
                None
            }

            OpKind::LAlloca { elem } => {
                let ty = self.basic_type(elem)?;
                let count = self.operand(op, 0)?.into_int_value();
                Some(b.build_array_alloca(ty, count, "")?.into())
            }
            OpKind::LLoad => {
                let ptr = self.operand(op, 0)?.into_pointer_value();
                Some(b.build_load(self.result_type(op)?, ptr, "")?)
            }
            OpKind::LStore => {
                let (value, ptr) = (self.operand(op, 0)?, self.operand(op, 1)?);
                b.build_store(ptr.into_pointer_value(), value)?;
                None
            }
            OpKind::Gep { elem, indices } => {
                let base = self.operand(op, 0)?.into_pointer_value();
                let mut dynamic = ir.operands(op)[1..].iter();
                let mut llvm_indices = Vec::with_capacity(indices.len());
                for index in indices {
                    llvm_indices.push(match index {
                        GepIndex::Const(c) => self.context.i32_type().const_int(*c as u64, true),
                        GepIndex::Dynamic => {
                            let v = dynamic.next().ok_or_else(|| self.undefined())?;
                            self.value(*v)?.into_int_value()
                        }
                    });
                }
                let elem = self.basic_type(elem)?;
                // SAFETY: indices were produced by lowering against the element type.
                Some(unsafe { b.build_gep(elem, base, &llvm_indices, "")? }.into())
            }
            OpKind::InsertValue { position } => {
                let (agg, value) = (self.operand(op, 0)?, self.operand(op, 1)?);
                Some(self.insert_at(agg, value, position)?)
            }
            OpKind::ExtractValue { position } => {
                let mut value = self.operand(op, 0)?;
                for index in position {
                    value = b.build_extract_value(aggregate(value)?, *index, "")?;
                }
                Some(value)
            }
            OpKind::LAtomicRmw { kind, ordering } => {
                let (ptr, value) = (self.operand(op, 0)?, self.operand(op, 1)?);
                Some(self.atomic_rmw(*kind, *ordering, ptr, value))
            }
            OpKind::AddressOf { symbol } => {
                let ptr = match self.functions.get(symbol) {
                    Some(f) => f.as_global_value().as_pointer_value(),
                    None => self
                        .module
                        .get_global(symbol)
                        .ok_or_else(|| self.undefined())?
                        .as_pointer_value(),
                };
                Some(ptr.into())
            }
            OpKind::PtrToInt => {
                let ptr = self.operand(op, 0)?.into_pointer_value();
                Some(b.build_ptr_to_int(ptr, self.result_type(op)?.into_int_type(), "")?.into())
            }
            OpKind::IntToPtr => {
                let int = self.operand(op, 0)?.into_int_value();
                Some(b.build_int_to_ptr(int, self.context.ptr_type(AddressSpace::default()), "")?.into())
            }

            OpKind::Br => {
                let dest = self.branch_to(op, 0)?;
                let branch = self.builder.build_unconditional_branch(dest)?;
                self.attach_loop_hints(op, branch);
                None
            }
            OpKind::CondBr { .. } => {
                let cond = self.operand(op, 0)?.into_int_value();
                let then_bb = self.branch_to(op, 0)?;
                let else_bb = self.branch_to(op, 1)?;
                let branch = self.builder.build_conditional_branch(cond, then_bb, else_bb)?;
                self.attach_loop_hints(op, branch);
                None
            }
            OpKind::Unreachable => {
                b.build_unreachable()?;
                None
            }
            OpKind::SyncRegionStart => None,
            OpKind::Detach | OpKind::Reattach | OpKind::Sync => {
                let dest = self.branch_to(op, 0)?;
                self.builder.build_unconditional_branch(dest)?;
                None
            }
            _ => return Err(TranslateError::UnsupportedOp { op: ir.tag(op).name() }),
        };

        if let Some(value) = result {
            if ir.attr(op, names::FASTMATH).is_some() {
                set_fastmath(value);
            }
            self.values.insert(ir.result(op, 0), value);
        }
        Ok(())
    }

    fn constant(&self, value: ConstValue, ty: BasicTypeEnum<'ctx>) -> TranslateResult<BasicValueEnum<'ctx>> {
        Ok(match (value, ty) {
            (ConstValue::Int(v), BasicTypeEnum::IntType(t)) => t.const_int(v as u64, true).into(),
            (ConstValue::Float(v), BasicTypeEnum::FloatType(t)) => t.const_float(v).into(),
            (ConstValue::Null, BasicTypeEnum::PointerType(t)) => t.const_null().into(),
            (ConstValue::Null, other) => other.const_zero(),
            _ => return Err(TranslateError::UnsupportedOp { op: OpTag::Constant.name() }),
        })
    }

    fn binary(&self, kind: BinOp, l: BasicValueEnum<'ctx>, r: BasicValueEnum<'ctx>) -> TranslateResult<BasicValueEnum<'ctx>> {
        let b = &self.builder;
        if kind.is_float() {
            let (l, r) = (l.into_float_value(), r.into_float_value());
            return Ok(match kind {
                BinOp::AddF => b.build_float_add(l, r, "")?.into(),
                BinOp::SubF => b.build_float_sub(l, r, "")?.into(),
                BinOp::MulF => b.build_float_mul(l, r, "")?.into(),
                BinOp::DivF => b.build_float_div(l, r, "")?.into(),
                BinOp::MaxF | BinOp::MinF => {
                    let pred = if kind == BinOp::MaxF {
                        LlvmFloatPredicate::OGT
                    } else {
                        LlvmFloatPredicate::OLT
                    };
                    let c = b.build_float_compare(pred, l, r, "")?;
                    b.build_select(c, l, r, "")?
                }
                _ => return Err(TranslateError::UnsupportedOp { op: kind.name() }),
            });
        }
        let (l, r) = (l.into_int_value(), r.into_int_value());
        Ok(match kind {
            BinOp::AddI => b.build_int_add(l, r, "")?.into(),
            BinOp::SubI => b.build_int_sub(l, r, "")?.into(),
            BinOp::MulI => b.build_int_mul(l, r, "")?.into(),
            BinOp::DivSI => b.build_int_signed_div(l, r, "")?.into(),
            BinOp::DivUI => b.build_int_unsigned_div(l, r, "")?.into(),
            BinOp::RemSI => b.build_int_signed_rem(l, r, "")?.into(),
            BinOp::RemUI => b.build_int_unsigned_rem(l, r, "")?.into(),
            BinOp::AndI => b.build_and(l, r, "")?.into(),
            BinOp::OrI => b.build_or(l, r, "")?.into(),
            BinOp::XorI => b.build_xor(l, r, "")?.into(),
            BinOp::ShlI => b.build_left_shift(l, r, "")?.into(),
            BinOp::ShrSI => b.build_right_shift(l, r, true, "")?.into(),
            BinOp::ShrUI => b.build_right_shift(l, r, false, "")?.into(),
            BinOp::MaxSI | BinOp::MinSI => {
                let pred = if kind == BinOp::MaxSI {
                    LlvmIntPredicate::SGT
                } else {
                    LlvmIntPredicate::SLT
                };
                let c = b.build_int_compare(pred, l, r, "")?;
                b.build_select(c, l, r, "")?
            }
            _ => return Err(TranslateError::UnsupportedOp { op: kind.name() }),
        })
    }

    fn cast(&self, kind: CastKind, v: BasicValueEnum<'ctx>, ty: BasicTypeEnum<'ctx>) -> TranslateResult<BasicValueEnum<'ctx>> {
        let b = &self.builder;
        Ok(match kind {
            // int casts between equal widths fold to the operand
            CastKind::IndexCast | CastKind::ExtSI | CastKind::TruncI => b
                .build_int_cast_sign_flag(v.into_int_value(), ty.into_int_type(), true, "")?
                .into(),
            CastKind::ExtUI => b
                .build_int_cast_sign_flag(v.into_int_value(), ty.into_int_type(), false, "")?
                .into(),
            CastKind::SIToFP => b
                .build_signed_int_to_float(v.into_int_value(), ty.into_float_type(), "")?
                .into(),
            CastKind::UIToFP => b
                .build_unsigned_int_to_float(v.into_int_value(), ty.into_float_type(), "")?
                .into(),
            CastKind::FPToSI => b
                .build_float_to_signed_int(v.into_float_value(), ty.into_int_type(), "")?
                .into(),
            CastKind::FPToUI => b
                .build_float_to_unsigned_int(v.into_float_value(), ty.into_int_type(), "")?
                .into(),
            CastKind::ExtF | CastKind::TruncF => b
                .build_float_cast(v.into_float_value(), ty.into_float_type(), "")?
                .into(),
        })
    }

    fn insert_at(
        &self,
        agg: BasicValueEnum<'ctx>,
        value: BasicValueEnum<'ctx>,
        position: &[u32],
    ) -> TranslateResult<BasicValueEnum<'ctx>> {
        let Some((first, rest)) = position.split_first() else {
            return Ok(value);
        };
        let member = if rest.is_empty() {
            value
        } else {
            let inner = self.builder.build_extract_value(aggregate(agg)?, *first, "")?;
            self.insert_at(inner, value, rest)?
        };
        let inserted = self.builder.build_insert_value(aggregate(agg)?, member, *first, "")?;
        Ok(match inserted {
            AggregateValueEnum::ArrayValue(a) => a.into(),
            AggregateValueEnum::StructValue(s) => s.into(),
        })
    }

    fn atomic_rmw(
        &self,
        kind: LowRmwKind,
        ordering: AtomicOrdering,
        ptr: BasicValueEnum<'ctx>,
        value: BasicValueEnum<'ctx>,
    ) -> BasicValueEnum<'ctx> {
        use llvm_sys::LLVMAtomicOrdering::*;
        use llvm_sys::LLVMAtomicRMWBinOp::*;
        let op = match kind {
            LowRmwKind::Add => LLVMAtomicRMWBinOpAdd,
            LowRmwKind::Sub => LLVMAtomicRMWBinOpSub,
            LowRmwKind::FAdd => LLVMAtomicRMWBinOpFAdd,
            LowRmwKind::Xchg => LLVMAtomicRMWBinOpXchg,
            LowRmwKind::Max => LLVMAtomicRMWBinOpMax,
            LowRmwKind::UMax => LLVMAtomicRMWBinOpUMax,
            LowRmwKind::Min => LLVMAtomicRMWBinOpMin,
            LowRmwKind::UMin => LLVMAtomicRMWBinOpUMin,
            LowRmwKind::Or => LLVMAtomicRMWBinOpOr,
            LowRmwKind::And => LLVMAtomicRMWBinOpAnd,
        };
        let ordering = match ordering {
            AtomicOrdering::Monotonic => LLVMAtomicOrderingMonotonic,
            AtomicOrdering::AcqRel => LLVMAtomicOrderingAcquireRelease,
            AtomicOrdering::SeqCst => LLVMAtomicOrderingSequentiallyConsistent,
        };
        // SAFETY: inkwell's atomicrmw only accepts integers; the raw builder
        // call covers float add too. Operands come from this builder's context.
        unsafe {
            let raw = llvm_sys::core::LLVMBuildAtomicRMW(
                self.builder.as_mut_ptr(),
                op,
                ptr.as_value_ref(),
                value.as_value_ref(),
                ordering,
                0,
            );
            BasicValueEnum::new(raw)
        }
    }

    /// Self-referential `llvm.loop` node holding one `{name, i32 value}` pair
    /// per hint.
    fn attach_loop_hints(&self, op: OpId, branch: InstructionValue<'ctx>) {
        let Some(Attribute::LoopHints(hints)) = self.ir.attr(op, names::LOOP_METADATA) else {
            return;
        };
        use llvm_sys::core::*;
        use llvm_sys::debuginfo::{LLVMMetadataReplaceAllUsesWith, LLVMTemporaryMDNode};
        // SAFETY: all metadata is created in the module's context and the
        // temporary node is consumed by the RAUW.
        unsafe {
            let ctx = self.context.raw();
            let i32_ty = LLVMInt32TypeInContext(ctx);
            let temp = LLVMTemporaryMDNode(ctx, std::ptr::null_mut(), 0);
            let mut operands = vec![temp];
            for (key, value) in hints {
                let name = LLVMMDStringInContext2(ctx, key.as_ptr() as *const c_char, key.len());
                let value = LLVMValueAsMetadata(LLVMConstInt(i32_ty, *value as u64, 0));
                let mut pair = [name, value];
                operands.push(LLVMMDNodeInContext2(ctx, pair.as_mut_ptr(), pair.len()));
            }
            let node = LLVMMDNodeInContext2(ctx, operands.as_mut_ptr(), operands.len());
            LLVMMetadataReplaceAllUsesWith(temp, node);
            let kind_name = names::LOOP_METADATA;
            let kind = LLVMGetMDKindIDInContext(ctx, kind_name.as_ptr() as *const c_char, kind_name.len() as u32);
            LLVMSetMetadata(branch.as_value_ref(), kind, LLVMMetadataAsValue(ctx, node));
        }
    }
}

fn aggregate(value: BasicValueEnum<'_>) -> TranslateResult<AggregateValueEnum<'_>> {
    match value {
        BasicValueEnum::StructValue(s) => Ok(s.into()),
        BasicValueEnum::ArrayValue(a) => Ok(a.into()),
        _ => Err(TranslateError::UnsupportedType {
            ty: "non-aggregate value".to_string(),
        }),
    }
}

fn set_fastmath(value: BasicValueEnum<'_>) {
    if let Some(inst) = value.as_instruction_value() {
        // SAFETY: only called on float arithmetic, compares and casts.
        unsafe { llvm_sys::core::LLVMSetFastMathFlags(inst.as_value_ref(), llvm_sys::LLVMFastMathAll) };
    }
}

fn int_predicate(pred: IntPredicate) -> LlvmIntPredicate {
    match pred {
        IntPredicate::Eq => LlvmIntPredicate::EQ,
        IntPredicate::Ne => LlvmIntPredicate::NE,
        IntPredicate::Slt => LlvmIntPredicate::SLT,
        IntPredicate::Sle => LlvmIntPredicate::SLE,
        IntPredicate::Sgt => LlvmIntPredicate::SGT,
        IntPredicate::Sge => LlvmIntPredicate::SGE,
        IntPredicate::Ult => LlvmIntPredicate::ULT,
        IntPredicate::Ule => LlvmIntPredicate::ULE,
        IntPredicate::Ugt => LlvmIntPredicate::UGT,
        IntPredicate::Uge => LlvmIntPredicate::UGE,
    }
}

fn float_predicate(pred: FloatPredicate) -> LlvmFloatPredicate {
    match pred {
        FloatPredicate::OEq => LlvmFloatPredicate::OEQ,
        FloatPredicate::ONe => LlvmFloatPredicate::ONE,
        FloatPredicate::OLt => LlvmFloatPredicate::OLT,
        FloatPredicate::OLe => LlvmFloatPredicate::OLE,
        FloatPredicate::OGt => LlvmFloatPredicate::OGT,
        FloatPredicate::OGe => LlvmFloatPredicate::OGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::build_func;
    use crate::ir::builder::Builder;

    #[test]
    fn test_arithmetic_function() {
        let context = Context::create();
        let mut m = Module::new("arith");
        let (_, entry) = build_func(&mut m, "axpy", vec![Type::f64(), Type::f64(), Type::f64()], vec![Type::f64()]);
        let a = m.block_arg(entry, 0);
        let x = m.block_arg(entry, 1);
        let y = m.block_arg(entry, 2);
        let mut b = Builder::at_end(&mut m, entry);
        let ax = b.binary(BinOp::MulF, a, x);
        let r = b.binary(BinOp::AddF, ax, y);
        b.return_(vec![r]);
        let fmul = m.defining_op(ax).unwrap();
        m.set_attr(fmul, names::FASTMATH, Attribute::Unit);

        let module = translate_module(&context, &m).unwrap();
        let text = module.print_to_string().to_string();
        assert!(text.contains("fmul fast double"), "{}", text);
        assert!(text.contains("fadd double"), "{}", text);
        assert!(module.get_function("axpy").is_some());
    }

    #[test]
    fn test_loop_with_phis_and_hints() {
        let context = Context::create();
        let mut m = Module::new("loop");
        let (f, entry) = build_func(&mut m, "count", vec![Type::i64()], vec![Type::i64()]);
        let n = m.block_arg(entry, 0);
        let body = m.create_block(&[Type::i64()]);
        let exit = m.create_block(&[Type::i64()]);
        let region = m.region(f, 0);
        m.push_block(region, body);
        m.push_block(region, exit);
        let mut b = Builder::at_end(&mut m, entry);
        let zero = b.const_int(0, Type::i64());
        b.br(body, vec![zero]);
        let iv = m.block_arg(body, 0);
        let mut b = Builder::at_end(&mut m, body);
        let one = b.const_int(1, Type::i64());
        let next = b.binary(BinOp::AddI, iv, one);
        let again = b.cmpi(IntPredicate::Slt, next, n);
        let latch = b.cond_br(again, body, vec![next], exit, vec![next]);
        let out = m.block_arg(exit, 0);
        Builder::at_end(&mut m, exit).return_(vec![out]);
        m.set_attr(
            latch,
            names::LOOP_METADATA,
            Attribute::LoopHints(vec![("tapir.loop.spawn.strategy".into(), 1)]),
        );

        let module = translate_module(&context, &m).unwrap();
        let text = module.print_to_string().to_string();
        assert!(text.contains("phi i64"), "{}", text);
        assert!(text.contains("!llvm.loop"), "{}", text);
        assert!(text.contains("tapir.loop.spawn.strategy"), "{}", text);
    }

    #[test]
    fn test_declarations_and_multiple_results() {
        let context = Context::create();
        let mut m = Module::new("calls");
        let body = m.body();
        Builder::at_end(&mut m, body).func_decl("ext", FunctionType::new(vec![Type::Ptr], vec![Type::i32()]));
        let (_, entry) = build_func(&mut m, "pair", vec![Type::Ptr], vec![Type::i32(), Type::Ptr]);
        let p = m.block_arg(entry, 0);
        let mut b = Builder::at_end(&mut m, entry);
        let call = b.call("ext", vec![p], vec![Type::i32()]);
        let status = b.module().result(call, 0);
        b.return_(vec![status, p]);

        let module = translate_module(&context, &m).unwrap();
        let ext = module.get_function("ext").unwrap();
        assert_eq!(ext.get_linkage(), Linkage::External);
        assert!(ext.get_first_basic_block().is_none());
        let text = module.print_to_string().to_string();
        assert!(text.contains("ret { i32, ptr }"), "{}", text);
    }

    #[test]
    fn test_shaped_ops_are_rejected() {
        let context = Context::create();
        let mut m = Module::new("shaped");
        let (_, entry) = build_func(&mut m, "f", vec![], vec![]);
        let mut b = Builder::at_end(&mut m, entry);
        b.alloc(Type::memref(Type::f64(), vec![crate::ir::types::Dim::Static(4)]), vec![]);
        b.return_(vec![]);

        assert!(matches!(
            translate_module(&context, &m),
            Err(TranslateError::UnsupportedType { .. }) | Err(TranslateError::UnsupportedOp { .. })
        ));
    }
}
