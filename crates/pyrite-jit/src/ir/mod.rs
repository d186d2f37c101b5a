//! Native-code IR
//!
//! The SSA-form IR that the emission driver produces and the refcount pass
//! rewrites in place. Heap-object values carry ownership tags in a side table
//! on the function; everything else is plain machine data.

pub mod builder;
pub mod display;
pub mod instr;
pub mod types;

pub use builder::IrBuilder;
pub use instr::{
    BlockId, Callee, CmpCond, FloatBinOp, Instr, IntBinOp, IrBlock, IrFunction, Terminator,
    Value, ValueOrigin,
};
pub use types::{IrType, RefInfo, RefType};
