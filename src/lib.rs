//! arrayjit - array compiler back-end and JIT.
//!
//! arrayjit takes modules in a typed SSA IR whose values include strided
//! multi-dimensional arrays, canonicalizes them with a rule engine, lowers
//! them step by step to a low-level form, translates that to LLVM and
//! executes it through an ORC JIT with a runtime-support symbol table.
//!
//! # Primary Usage
//!
//! ```ignore
//! use arrayjit::core::PipelineSession;
//! use arrayjit::engine::{EngineOptions, ExecutionEngine};
//! use arrayjit::lowering::{lower_module, LoweringOptions};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = PipelineSession::new(&arena);
//! lower_module(&mut module, &LoweringOptions::default(), &session)?;
//!
//! let mut engine = ExecutionEngine::new(EngineOptions {
//!     symbol_map: arrayjit::runtime::symbol_map(),
//!     ..Default::default()
//! });
//! let handle = engine.load_module(&module)?;
//! let entry = engine.lookup(handle, "main")?;
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - Types, attributes, ops, the arena module, builder and analyses
//! - [`rewrite`] - Canonicalization rules and the greedy driver
//! - [`lowering`] - Passes from the shaped-array layer to the low-level layer
//! - [`llvm`] - Translation to LLVM and the optimization stages
//! - [`engine`] - Object cache, runtime symbols, tapirify and the JIT
//! - [`runtime`] - In-process runtime-support library
//! - [`core`] - Errors, pipeline session and test utilities

pub mod core;
pub mod engine;
pub mod ir;
pub mod llvm;
pub mod lowering;
pub mod rewrite;
pub mod runtime;

pub use core::{EngineError, PassError, PipelineSession, TranslateError};
pub use engine::{EngineOptions, ExecutionEngine, ModuleHandle, TapirTarget};
pub use ir::{Builder, Module, Type};
pub use lowering::{lower_module, LoweringOptions};
