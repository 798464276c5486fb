//! Shared helpers for the integration tests.

#![allow(dead_code)]

use arrayjit::engine::{EngineOptions, ExecutionEngine, TapirTarget};
use arrayjit::ir::module::{BlockId, OpId};
use arrayjit::ir::ops::Visibility;
use arrayjit::ir::types::{Dim, FunctionType};
use arrayjit::{Builder, Module, PipelineSession, Type};
use arrayjit::{lower_module, LoweringOptions};
use bumpalo::Bump;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Public function `name` appended to `m` with its entry block.
pub fn public_func(m: &mut Module, name: &str, inputs: Vec<Type>, results: Vec<Type>) -> (OpId, BlockId) {
    let body = m.body();
    let f = Builder::at_end(m, body).func(name, FunctionType::new(inputs, results), Visibility::Public);
    let entry = m.body_block(f, 0);
    (f, entry)
}

pub fn vector(elem: Type) -> Type {
    Type::memref(elem, vec![Dim::Dynamic])
}

/// Run the default lowering pipeline on `m`.
pub fn lower(m: &mut Module, options: &LoweringOptions) {
    let arena = Bump::new();
    let session = PipelineSession::new(&arena);
    if let Err(err) = lower_module(m, options, &session) {
        panic!("lowering {} failed: {}\n{}", m.name(), err, m);
    }
}

/// Engine resolving runtime calls against the in-process runtime.
pub fn engine() -> ExecutionEngine {
    init_logging();
    ExecutionEngine::new(EngineOptions {
        symbol_map: arrayjit::runtime::symbol_map(),
        tapir_target: Some(TapirTarget::Serial),
        runtime_libraries: Some(Vec::new()),
        ..Default::default()
    })
}
