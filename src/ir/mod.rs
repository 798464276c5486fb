// This module defines the intermediate representation the compiler operates on: a typed SSA
// graph stored in an arena module. Types carry shape, strided layout and signedness;
// attributes carry environment (device/parallel) information; the op catalog is a closed
// enum spanning the shaped-array, structured control flow and low-level layers. The builder
// constructs ops at an insertion point, the printer renders modules for logs, the CFG
// analyses serve unstructured function bodies and the verifier checks structural
// invariants between passes.

//! Typed SSA intermediate representation.

pub mod attrs;
pub mod builder;
pub mod cfg;
pub mod module;
pub mod ops;
pub mod printer;
pub mod types;
pub mod verify;

pub use attrs::{merge_env_attrs, Attribute, DeviceCaps, EnvAttr};
pub use builder::{Builder, InsertPoint};
pub use module::{BlockId, Module, OpId, RegionId, Use, ValueDef, ValueId};
pub use ops::{OpKind, OpTag};
pub use types::{layouts_compatible, Dim, Layout, MemRefType, StridedLayout, Type};
pub use verify::verify_module;
