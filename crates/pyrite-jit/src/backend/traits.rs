//! The seam between refcounted IR and machine code
//!
//! Defines the `CodegenBackend` trait that pluggable backends implement,
//! along with the types for compiled and executable code. The refcount pass
//! has already materialized every reference-count update by the time a
//! function reaches a backend.

use crate::ir::IrFunction;
use crate::runtime::{CodeRef, GlobalRef, RuntimeFn};

/// Instruction set a backend emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    AArch64,
}

/// What a backend knows about its target
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: usize,
}

/// Lowering or finalization failed
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("Backend error: {0}")]
    BackendError(String),
    #[error("Unsupported instruction: {0}")]
    UnsupportedInstruction(String),
    #[error("Unresolved symbol: {0}")]
    UnresolvedSymbol(String),
}

/// Resolver for the addresses compiled code refers to
pub trait SymbolResolver {
    fn resolve_runtime(&self, func: RuntimeFn) -> Option<usize>;
    /// Entry address of another compiled version
    fn resolve_function(&self, code: CodeRef) -> Option<usize>;
    /// Address of a process-wide constant, counter or record
    fn resolve_global(&self, global: &GlobalRef) -> Option<usize>;
}

/// Machine code in a plain buffer
#[derive(Debug)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    /// Where execution starts within `code`
    pub entry_offset: usize,
}

/// Code placed in executable memory
pub struct ExecutableCode {
    pub code_ptr: *const u8,
    /// Bytes from `code_ptr`
    pub code_size: usize,
    pub entry_offset: usize,
}

// Safety: code_ptr points to memory that is never written again once
// finalized and stays mapped for the lifetime of the owning backend.
unsafe impl Send for ExecutableCode {}
unsafe impl Sync for ExecutableCode {}

impl ExecutableCode {
    pub fn entry_address(&self) -> usize {
        self.code_ptr as usize + self.entry_offset
    }
}

/// A code generator: `compile_function` turns IR into bytes, `finalize`
/// makes them runnable
pub trait CodegenBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Compile a refcounted IR function to machine code. Every runtime
    /// entry point, global and direct callee is resolved through `resolver`.
    fn compile_function(
        &self,
        func: &IrFunction,
        resolver: &dyn SymbolResolver,
    ) -> Result<CompiledCode, CodegenError>;

    /// Place the code in memory it can run from
    fn finalize(&self, code: &CompiledCode) -> Result<ExecutableCode, CodegenError>;

    fn target_info(&self) -> TargetInfo;
}
