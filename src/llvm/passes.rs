// This module holds everything that runs on the translated LLVM module before machine code
// is emitted: the target annotations stamped at load time (module flags for the code model,
// position independence and direct access to external data; target cpu and features on
// every function lacking them), the managed-allocation substitution used by the cuda tapir
// target, and the two-stage new-pass-manager pipeline. Stage one is a reduced O1 pipeline
// with loop unrolling and vectorization disabled; stage two is the requested level, with the
// verifier run after each pass when verification is on. Both stages go through inkwell's
// `run_passes`, which takes textual pipelines.

//! LLVM module annotations and optimization stages.

use inkwell::attributes::AttributeLoc;
use inkwell::module::{FlagBehavior, Module as LlvmModule};
use inkwell::passes::PassBuilderOptions;
use inkwell::targets::{CodeModel, InitializationConfig, RelocMode, Target, TargetMachine};
use inkwell::OptimizationLevel;
use log::{debug, trace};

use crate::core::error::{EngineError, EngineResult};
use crate::lowering::to_low_level::ALLOC_FN;

/// Managed-memory allocator with the signature of [`ALLOC_FN`].
pub const MANAGED_ALLOC_FN: &str = "__kitcuda_mem_alloc_managed_numba";

/// Optimization level of the second pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    Less,
    #[default]
    Default,
    Aggressive,
}

impl OptLevel {
    pub fn pipeline(self) -> &'static str {
        match self {
            OptLevel::None => "default<O0>",
            OptLevel::Less => "default<O1>",
            OptLevel::Default => "default<O2>",
            OptLevel::Aggressive => "default<O3>",
        }
    }

    fn codegen(self) -> OptimizationLevel {
        match self {
            OptLevel::None => OptimizationLevel::None,
            OptLevel::Less => OptimizationLevel::Less,
            OptLevel::Default => OptimizationLevel::Default,
            OptLevel::Aggressive => OptimizationLevel::Aggressive,
        }
    }
}

fn code_model() -> CodeModel {
    if cfg!(target_arch = "x86_64") {
        CodeModel::Large
    } else {
        CodeModel::Default
    }
}

/// Target machine for the host.
pub fn host_target_machine(level: OptLevel) -> EngineResult<TargetMachine> {
    Target::initialize_native(&InitializationConfig::default()).map_err(EngineError::Codegen)?;
    let triple = TargetMachine::get_default_triple();
    let target = Target::from_triple(&triple).map_err(|e| EngineError::Codegen(e.to_string()))?;
    let cpu = TargetMachine::get_host_cpu_name();
    let features = TargetMachine::get_host_cpu_features();
    target
        .create_target_machine(
            &triple,
            &cpu.to_string(),
            &features.to_string(),
            level.codegen(),
            RelocMode::PIC,
            code_model(),
        )
        .ok_or_else(|| EngineError::Codegen(format!("no target machine for {}", triple)))
}

/// Module flags for the JIT: code model, PIC and PIE levels and direct access
/// to external data. Also sets the triple and data layout of `machine`.
pub fn annotate_module(module: &LlvmModule<'_>, machine: &TargetMachine) {
    let i32_ty = module.get_context().i32_type();
    module.set_triple(&machine.get_triple());
    module.set_data_layout(&machine.get_target_data().get_data_layout());
    if code_model() == CodeModel::Large {
        // llvm::CodeModel::Large
        module.add_basic_value_flag("Code Model", FlagBehavior::Error, i32_ty.const_int(4, false));
    }
    // PICLevel::BigPIC and PIELevel::Large
    module.add_basic_value_flag("PIC Level", FlagBehavior::Override, i32_ty.const_int(2, false));
    module.add_basic_value_flag("PIE Level", FlagBehavior::Override, i32_ty.const_int(2, false));
    module.add_basic_value_flag("direct-access-external-data", FlagBehavior::Override, i32_ty.const_int(1, false));
}

/// Add `target-cpu` and `target-features` to every function that lacks them.
pub fn stamp_target_attributes(module: &LlvmModule<'_>, machine: &TargetMachine) {
    let context = module.get_context();
    let cpu = machine.get_cpu().to_string();
    let features = machine.get_feature_string().to_string_lossy().into_owned();
    let mut stamped = 0;
    for function in module.get_functions() {
        if function.get_string_attribute(AttributeLoc::Function, "target-cpu").is_none() {
            function.add_attribute(AttributeLoc::Function, context.create_string_attribute("target-cpu", &cpu));
            stamped += 1;
        }
        if function
            .get_string_attribute(AttributeLoc::Function, "target-features")
            .is_none()
        {
            function.add_attribute(
                AttributeLoc::Function,
                context.create_string_attribute("target-features", &features),
            );
        }
    }
    trace!("stamped target attributes on {} functions", stamped);
}

/// Redirect every use of the runtime allocator to the managed allocator.
/// Returns whether the module referenced the allocator.
pub fn substitute_allocator(module: &LlvmModule<'_>) -> bool {
    let Some(alloc) = module.get_function(ALLOC_FN) else {
        return false;
    };
    let managed = module
        .get_function(MANAGED_ALLOC_FN)
        .unwrap_or_else(|| module.add_function(MANAGED_ALLOC_FN, alloc.get_type(), None));
    alloc.replace_all_uses_with(managed);
    debug!("{} redirected to {}", ALLOC_FN, MANAGED_ALLOC_FN);
    true
}

/// Reduced O1 pipeline without loop unrolling or vectorization.
pub fn run_stage_one(module: &LlvmModule<'_>, machine: &TargetMachine) -> EngineResult<()> {
    let options = PassBuilderOptions::create();
    options.set_loop_unrolling(false);
    options.set_loop_vectorization(false);
    options.set_loop_slp_vectorization(false);
    options.set_loop_interleaving(false);
    module
        .run_passes("default<O1>", machine, options)
        .map_err(|e| EngineError::Optimization(e.to_string()))
}

/// Pass pipeline text for stage two: the level's default pipeline, preceded by
/// a single module verifier when `verify` is set.
pub fn stage_two_pipeline(level: OptLevel, verify: bool) -> String {
    if verify {
        format!("verify,{}", level.pipeline())
    } else {
        level.pipeline().to_string()
    }
}

/// Full pipeline at `level`.
pub fn run_stage_two(
    module: &LlvmModule<'_>,
    machine: &TargetMachine,
    level: OptLevel,
    verify: bool,
) -> EngineResult<()> {
    let options = PassBuilderOptions::create();
    let vectorize = matches!(level, OptLevel::Default | OptLevel::Aggressive);
    options.set_loop_unrolling(level != OptLevel::None);
    options.set_loop_vectorization(vectorize);
    options.set_loop_slp_vectorization(vectorize);
    module
        .run_passes(&stage_two_pipeline(level, verify), machine, options)
        .map_err(|e| EngineError::Optimization(e.to_string()))
}
