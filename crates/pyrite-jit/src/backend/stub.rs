//! Stub backend for testing the pipeline without real codegen
//!
//! Resolves every symbol the function refers to, then produces placeholder
//! machine code (INT3 / BRK). Finalized regions are plain heap memory and
//! must never be called.

use parking_lot::Mutex;

use super::traits::*;
use crate::ir::{Callee, Instr, IrFunction, Terminator, Value};

/// A stub backend that produces placeholder code (INT3 on x86, BRK on ARM)
#[derive(Default)]
pub struct StubBackend {
    /// Keeps finalized regions alive for as long as the backend
    regions: Mutex<Vec<Box<[u8]>>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn resolve_callee(callee: &Callee, resolver: &dyn SymbolResolver) -> Result<(), CodegenError> {
    match callee {
        Callee::Runtime(f) => resolver
            .resolve_runtime(*f)
            .map(|_| ())
            .ok_or_else(|| CodegenError::UnresolvedSymbol(f.symbol())),
        Callee::Direct(code) => resolver
            .resolve_function(*code)
            .map(|_| ())
            .ok_or_else(|| CodegenError::UnresolvedSymbol(code.to_string())),
        Callee::Indirect(_) => Ok(()),
    }
}

impl CodegenBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn compile_function(
        &self,
        func: &IrFunction,
        resolver: &dyn SymbolResolver,
    ) -> Result<CompiledCode, CodegenError> {
        for block in &func.blocks {
            for instr in &block.instrs {
                match instr {
                    Instr::Call { callee, .. } => resolve_callee(callee, resolver)?,
                    Instr::Incref { .. } | Instr::Decref { .. } => {
                        crate::ice!("{} reached the backend unexpanded in {}", instr, func.name)
                    }
                    _ => {}
                }
            }
            match &block.terminator {
                Terminator::Invoke { callee, .. } => resolve_callee(callee, resolver)?,
                Terminator::None => crate::ice!("{} of {} is not terminated", block.id, func.name),
                _ => {}
            }
        }
        for v in (0..func.num_values()).map(|i| Value(i as u32)) {
            if let Some(g) = func.global_of(v) {
                resolver
                    .resolve_global(g)
                    .ok_or_else(|| CodegenError::UnresolvedSymbol(g.to_string()))?;
            }
        }

        // Emit a single-byte trap instruction as placeholder
        let trap_byte = match self.target_info().arch {
            TargetArch::X86_64 => 0xCC,  // INT3
            TargetArch::AArch64 => 0x00, // BRK #0 (placeholder)
        };
        Ok(CompiledCode { code: vec![trap_byte], entry_offset: 0 })
    }

    fn finalize(&self, code: &CompiledCode) -> Result<ExecutableCode, CodegenError> {
        let region: Box<[u8]> = code.code.clone().into_boxed_slice();
        let exec = ExecutableCode {
            code_ptr: region.as_ptr(),
            code_size: region.len(),
            entry_offset: code.entry_offset,
        };
        self.regions.lock().push(region);
        Ok(exec)
    }

    fn target_info(&self) -> TargetInfo {
        #[cfg(target_arch = "aarch64")]
        {
            TargetInfo { arch: TargetArch::AArch64, pointer_size: 8 }
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            TargetInfo { arch: TargetArch::X86_64, pointer_size: 8 }
        }
    }
}
