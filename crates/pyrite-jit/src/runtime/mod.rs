//! Runtime-facing metadata
//!
//! The compiler core consumes the object-model runtime only through fixed
//! entry points and a fixed object layout. This module describes both, plus
//! the records for compiled functions and where their code lives.

pub mod code_cache;
pub mod compiled;
pub mod entry_points;
pub mod object;

pub use code_cache::CodeCache;
pub use compiled::{CodeRef, CompiledFunction, FunctionSpecialization, OsrEntryDescriptor};
pub use entry_points::{CallArity, ExceptionStyle, RuntimeFn};
pub use object::{ClassAttr, ClassId, ClassInfo, FuncId, FunctionInfo, GlobalRef};
