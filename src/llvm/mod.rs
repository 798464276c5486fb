//! LLVM translation and optimization.
//!
//! `translate` turns a fully lowered module into an inkwell module;
//! `passes` annotates it for the JIT and runs the two optimization stages.
//!
//! # Example
//! ```ignore
//! use arrayjit::llvm::{translate_module, passes};
//! use inkwell::context::Context;
//!
//! let context = Context::create();
//! let module = translate_module(&context, &lowered)?;
//! let machine = passes::host_target_machine(OptLevel::Default)?;
//! passes::annotate_module(&module, &machine);
//! ```

pub mod passes;
pub mod translate;

pub use passes::OptLevel;
pub use translate::translate_module;
