// This module defines the error types of the compiler using the thiserror crate. Each subsystem
// boundary has its own enum: IrError for structural problems detected while building or
// mutating IR (dangling handles, values still in use, arity and type mismatches, verifier
// failures), PassError for a lowering pass that could not lower a construct (it names the
// pass and carries the diagnostic that caused the abort), TranslateError for constructs
// that have no LLVM counterpart or builder failures during translation, and EngineError for
// the execution engine boundary (translation, codegen, linking, symbol lookup, the object
// cache and support-library loading). Each enum has a Result alias. Rewrite rules never
// produce errors: a rule that does not apply simply reports no match.

//! Error types for the array compiler.
//!
//! Using thiserror for idiomatic error handling.

use thiserror::Error;

/// Structural IR errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IrError {
    #[error("{what} is still in use")]
    StillInUse { what: String },

    #[error("{op}: expected {expected} operands, found {found}")]
    OperandCount {
        op: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{op}: type mismatch: {reason}")]
    TypeMismatch { op: &'static str, reason: String },

    #[error("Block without terminator in {op}")]
    MissingTerminator { op: &'static str },

    #[error("Function not found: {name}")]
    FunctionNotFound { name: String },

    #[error("Verification failed: {reason}")]
    Verification { reason: String },
}

/// Result type alias for IR operations.
pub type IrResult<T> = Result<T, IrError>;

/// A lowering pass failed; the pipeline stops at the first failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PassError {
    #[error("{pass}: {message}")]
    Failed { pass: &'static str, message: String },

    #[error("{pass}: {source}")]
    Ir {
        pass: &'static str,
        #[source]
        source: IrError,
    },

    #[error("Canonicalization did not converge after {iterations} iterations")]
    NoConvergence { iterations: usize },
}

/// Result type alias for pass execution.
pub type PassResult<T> = Result<T, PassError>;

/// Low-level IR to LLVM translation errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslateError {
    #[error("Unsupported op in translation: {op}")]
    UnsupportedOp { op: &'static str },

    #[error("Unsupported type in translation: {ty}")]
    UnsupportedType { ty: String },

    #[error("Value used before definition in {function}")]
    UndefinedValue { function: String },

    #[error("LLVM builder error: {reason}")]
    Builder { reason: String },

    #[error("LLVM module verification failed: {reason}")]
    Verify { reason: String },
}

impl From<inkwell::builder::BuilderError> for TranslateError {
    fn from(err: inkwell::builder::BuilderError) -> Self {
        TranslateError::Builder {
            reason: err.to_string(),
        }
    }
}

/// Result type alias for translation.
pub type TranslateResult<T> = Result<T, TranslateError>;

/// Execution engine errors. Messages are owned copies, never borrowed from
/// JIT-internal storage.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("could not convert to LLVM IR: {0}")]
    Translation(#[from] TranslateError),

    #[error("Module transformer failed: {0}")]
    Transform(String),

    #[error("Code generation failed: {0}")]
    Codegen(String),

    #[error("Optimization pipeline failed: {0}")]
    Optimization(String),

    #[error("JIT error: {0}")]
    Jit(String),

    #[error("Symbol lookup failed: {0}")]
    Lookup(String),

    #[error("looked up function is null")]
    NullSymbol,

    #[error("Unknown module handle {0}")]
    UnknownHandle(u64),

    #[error("Object cache error: {0}")]
    Cache(String),

    #[error("Runtime symbol {symbol} not found in {library}")]
    MissingRuntimeSymbol { symbol: String, library: String },

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
