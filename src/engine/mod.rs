// This module hosts the JIT side of the compiler. `config` carries the engine options and the
// tapir target selection, `cache` keeps compiled objects by module identity, `symbols`
// resolves the runtime-support entry points once per engine, `tapirify` splits counted loops
// into detach/reattach/sync form on the low-level IR, and `jit` ties them together into the
// execution engine that compiles, loads, looks up and releases modules.

//! Execution engine.
//!
//! # Example
//! ```ignore
//! use arrayjit::engine::{EngineOptions, ExecutionEngine};
//!
//! let mut engine = ExecutionEngine::new(EngineOptions::default());
//! let handle = engine.load_module(&lowered)?;
//! let entry = engine.lookup(handle, "main")?;
//! engine.release_module(handle)?;
//! ```

pub mod cache;
pub mod config;
pub mod jit;
pub mod symbols;
pub mod tapirify;

pub use cache::ObjectCache;
pub use config::{CompileConfig, EngineOptions, TapirTarget};
pub use jit::{compile_object, ExecutionEngine, ModuleHandle};
pub use symbols::RuntimeSymbols;
pub use tapirify::tapirify_module;
