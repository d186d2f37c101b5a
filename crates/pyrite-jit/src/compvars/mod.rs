//! Compile-time types and the variables that carry them
//!
//! The emission driver works on `VarRef`s: typed handles over IR values.
//! Each operation on a variable asks its type how to lower itself, so
//! statically known shapes (unboxed numbers, fixed-arity tuples, methods of
//! closed classes) get specialized code and everything else goes through the
//! generic runtime.

mod ops;
pub mod types;
pub mod var;

pub use ops::CallattrFlags;
pub use types::{Truth, TypeKind, TypeRef, TypeRegistry};
pub use var::{deserialize_from_frame, CompilerVariable, DupCache, FrameValue, UnboxedVal, VarRef, VarValue};
