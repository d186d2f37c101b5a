//! Pyrite JIT core
//!
//! Tiered native compilation for a dynamically typed, reference-counted
//! object language:
//! - **Type lattice and compiler variables**: what is statically known about
//!   each value, lazily boxed (`compvars`)
//! - **IR emission**: CFG + analyses -> SSA IR with phis, OSR entry and
//!   tier-up hooks (`irgen`)
//! - **Refcount insertion**: backward dataflow placing increfs/decrefs on
//!   every path (`refcount`)
//! - **Backends**: a stub and a Cranelift lowering behind the `jit` feature
//!   (`backend`), glued together by `pipeline`
//! - **Patch points**: the x86-64 writer inline caches use (`mcwriter`)
//!
//! # Example
//!
//! ```rust,ignore
//! use pyrite_jit::{JitPipeline, StubBackend, CompileRequest, EntryKind};
//!
//! let pipeline = JitPipeline::new(StubBackend::new(), linker);
//! let compiled = pipeline.compile(&request)?;
//! println!("{:x}", compiled.code_address().unwrap());
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

pub mod error;

pub mod analysis;
pub mod backend;
pub mod cfg;
pub mod compvars;
pub mod config;
pub mod ir;
pub mod irgen;
pub mod mcwriter;
pub mod pipeline;
pub mod profiling;
pub mod refcount;
pub mod runtime;

pub use backend::{CodegenBackend, CodegenError, StubBackend};
#[cfg(feature = "jit")]
pub use backend::CraneliftBackend;
pub use cfg::{Cfg, CfgBlockId, CfgBuilder};
pub use compvars::{TypeRef, TypeRegistry, VarRef};
pub use config::JitConfig;
pub use error::{ConfigError, PipelineError};
pub use ir::{IrFunction, IrType, RefType};
pub use irgen::{do_compile, CompileRequest, EntryKind};
pub use mcwriter::PatchpointError;
pub use pipeline::{JitPipeline, RuntimeLinker};
pub use profiling::EffortLevel;
pub use refcount::{add_refcounts, RefcountStats};
pub use runtime::{CodeRef, CompiledFunction, ExceptionStyle, RuntimeFn};
