//! Backend-agnostic code generation traits and implementations

pub mod stub;
pub mod traits;

#[cfg(feature = "jit")]
pub mod cranelift;

#[cfg(feature = "jit")]
pub use self::cranelift::CraneliftBackend;
pub use stub::StubBackend;
pub use traits::{
    CodegenBackend, CodegenError, CompiledCode, ExecutableCode, SymbolResolver, TargetArch, TargetInfo,
};
