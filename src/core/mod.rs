// This module holds the infrastructure shared by every stage of the compiler: the error
// enums of each subsystem boundary, the arena-backed pipeline session that carries
// diagnostics and statistics through a pipeline run, and the test context used by unit
// tests to scope one session per test.

//! Core infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - One thiserror enum per boundary: IR, passes, translation, engine
//!
//! ## Session Management (`session`)
//! - Arena-based name interning using `bumpalo`
//! - Diagnostics and pipeline statistics

pub mod error;
pub mod session;
pub mod test_utils;

pub use error::{
    EngineError, EngineResult, IrError, IrResult, PassError, PassResult, TranslateError,
    TranslateResult,
};

pub use session::{Diagnostic, PipelineSession, PipelineStats, Severity};
