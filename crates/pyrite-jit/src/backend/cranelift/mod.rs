//! Cranelift code generation backend
//!
//! Implements `CodegenBackend` using Cranelift to produce real native code
//! from refcounted IR. Finalized code lives in a `JITModule` owned by the
//! backend and stays mapped until the backend is dropped.

pub mod lowering;

use std::sync::Arc;

use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{ir, Context};
use cranelift_frontend::FunctionBuilderContext;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::Module;
use parking_lot::Mutex;
use target_lexicon::Architecture;

use self::lowering::{entry_signature, LowerError, LoweringContext};
use crate::backend::traits::*;
use crate::ir::IrFunction;

/// Alignment of finalized function bodies
const CODE_ALIGNMENT: u64 = 16;

/// Cranelift-based code generation backend
pub struct CraneliftBackend {
    /// The target ISA (instruction set architecture)
    isa: Arc<dyn TargetIsa>,
    /// Executable memory for finalized code
    module: Mutex<JITModule>,
}

// Safety: the JITModule is only touched under the mutex, and the code it
// hands out is never written again after finalize_definitions.
unsafe impl Send for CraneliftBackend {}
unsafe impl Sync for CraneliftBackend {}

impl CraneliftBackend {
    /// Create a backend targeting the host machine
    pub fn host() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::BackendError(format!("Failed to set opt_level: {}", e)))?;
        // Code embeds absolute addresses and is copied into the JIT arena
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| CodegenError::BackendError(format!("Failed to set is_pic: {}", e)))?;

        let flags = settings::Flags::new(flag_builder);
        let isa = cranelift_native::builder()
            .map_err(|e| CodegenError::BackendError(format!("Failed to create native ISA builder: {}", e)))?
            .finish(flags)
            .map_err(|e| CodegenError::BackendError(format!("Failed to finish ISA: {}", e)))?;

        Ok(Self::with_isa(isa))
    }

    /// Create a backend with a specific ISA
    pub fn with_isa(isa: Arc<dyn TargetIsa>) -> Self {
        let builder = JITBuilder::with_isa(isa.clone(), cranelift_module::default_libcall_names());
        CraneliftBackend { isa, module: Mutex::new(JITModule::new(builder)) }
    }
}

impl CodegenBackend for CraneliftBackend {
    fn name(&self) -> &str {
        "cranelift"
    }

    fn compile_function(
        &self,
        func: &IrFunction,
        resolver: &dyn SymbolResolver,
    ) -> Result<CompiledCode, CodegenError> {
        let mut codegen_ctx = Context::new();
        let mut func_builder_ctx = FunctionBuilderContext::new();

        let call_conv = self.isa.default_call_conv();
        let pointer_type = self.isa.pointer_type();
        codegen_ctx.func.signature = entry_signature(func, call_conv, pointer_type);
        codegen_ctx.func.name = ir::UserFuncName::testcase(&func.name);

        {
            let builder = cranelift_frontend::FunctionBuilder::new(&mut codegen_ctx.func, &mut func_builder_ctx);
            // lower() takes ownership of builder (finalize() consumes it)
            LoweringContext::lower(func, resolver, builder, call_conv, pointer_type).map_err(|e| match e {
                LowerError::UnresolvedSymbol(s) => CodegenError::UnresolvedSymbol(s),
                LowerError::UnsupportedInstruction(s) => CodegenError::UnsupportedInstruction(s),
                other => CodegenError::BackendError(format!("Lowering failed: {}", other)),
            })?;
        }

        let mut ctrl_plane = ControlPlane::default();
        let code = codegen_ctx
            .compile(&*self.isa, &mut ctrl_plane)
            .map_err(|e| CodegenError::BackendError(format!("Cranelift compilation failed: {:?}", e)))?;
        let code_bytes = code.code_buffer().to_vec();
        tracing::debug!(function = %func.name, bytes = code_bytes.len(), "lowered");

        Ok(CompiledCode { code: code_bytes, entry_offset: 0 })
    }

    fn finalize(&self, code: &CompiledCode) -> Result<ExecutableCode, CodegenError> {
        let mut module = self.module.lock();
        let sig = module.make_signature();
        let id = module
            .declare_anonymous_function(&sig)
            .map_err(|e| CodegenError::BackendError(format!("Failed to declare function: {}", e)))?;
        module
            .define_function_bytes(id, CODE_ALIGNMENT, &code.code, &[])
            .map_err(|e| CodegenError::BackendError(format!("Failed to define function: {}", e)))?;
        module
            .finalize_definitions()
            .map_err(|e| CodegenError::BackendError(format!("Failed to finalize: {}", e)))?;
        let code_ptr = module.get_finalized_function(id);
        Ok(ExecutableCode { code_ptr, code_size: code.code.len(), entry_offset: code.entry_offset })
    }

    fn target_info(&self) -> TargetInfo {
        let arch = match self.isa.triple().architecture {
            Architecture::Aarch64(_) => TargetArch::AArch64,
            _ => TargetArch::X86_64,
        };
        TargetInfo { arch, pointer_size: self.isa.pointer_bytes() as usize }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Callee, CmpCond, IntBinOp, IrBuilder, IrType, RefType, Terminator};
    use crate::runtime::{CodeRef, GlobalRef, RuntimeFn};

    extern "C" fn fake_len(_obj: *const u8) -> i64 {
        7
    }

    extern "C" fn no_exception() -> u8 {
        0
    }

    static FAKE_NONE: [u64; 4] = [1, 0, 0, 0];

    struct Resolver;
    impl SymbolResolver for Resolver {
        fn resolve_runtime(&self, f: RuntimeFn) -> Option<usize> {
            match f {
                RuntimeFn::Len => Some(fake_len as usize),
                RuntimeFn::ExceptionPending => Some(no_exception as usize),
                _ => None,
            }
        }
        fn resolve_function(&self, _: CodeRef) -> Option<usize> {
            None
        }
        fn resolve_global(&self, g: &GlobalRef) -> Option<usize> {
            match g {
                GlobalRef::None => Some(FAKE_NONE.as_ptr() as usize),
                _ => None,
            }
        }
    }

    /// abs(x) * 2 + 1 over a diamond with a phi
    fn abs_twice_plus_one() -> IrFunction {
        let mut func = IrFunction::new("abs2", &[IrType::I64], IrType::I64);
        let x = func.param(0);
        let entry = func.entry;
        let mut b = IrBuilder::new(&mut func, entry);
        let neg = b.create_block();
        let join = b.create_block();
        let zero = b.const_int(0);
        let is_neg = b.int_cmp(CmpCond::Lt, x, zero);
        b.terminate(Terminator::Branch { cond: is_neg, then_block: neg, else_block: join });
        b.switch_to_block(neg);
        let zero2 = b.const_int(0);
        let flipped = b.int_binary(IntBinOp::Sub, zero2, x);
        b.terminate(Terminator::Jump(join));
        b.switch_to_block(join);
        let abs = b.phi(IrType::I64);
        let two = b.const_int(2);
        let doubled = b.int_binary(IntBinOp::Mul, abs, two);
        let one = b.const_int(1);
        let out = b.int_binary(IntBinOp::Add, doubled, one);
        b.terminate(Terminator::Return(Some(out)));
        crate::ir::builder::add_phi_incoming(&mut func, join, abs, entry, x);
        crate::ir::builder::add_phi_incoming(&mut func, join, abs, neg, flipped);
        func
    }

    #[test]
    fn test_cranelift_backend_creation() {
        let backend = CraneliftBackend::host().unwrap();
        assert_eq!(backend.name(), "cranelift");
        assert_eq!(backend.target_info().pointer_size, 8);
    }

    #[test]
    fn test_cranelift_runs_diamond_with_phi() {
        let backend = CraneliftBackend::host().unwrap();
        let compiled = backend.compile_function(&abs_twice_plus_one(), &Resolver).unwrap();
        assert!(compiled.code.len() > 4);
        let exec = backend.finalize(&compiled).unwrap();
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(exec.entry_address()) };
        assert_eq!(f(5), 11);
        assert_eq!(f(-4), 9);
    }

    #[test]
    fn test_cranelift_reports_multiply_overflow() {
        // a * b, or -1 when the product leaves the i64 range
        let mut func = IrFunction::new("mul_or_flag", &[IrType::I64, IrType::I64], IrType::I64);
        let a = func.param(0);
        let c = func.param(1);
        let entry = func.entry;
        let mut b = IrBuilder::new(&mut func, entry);
        let overflows = b.int_overflows(IntBinOp::Mul, a, c);
        let product = b.int_binary(IntBinOp::Mul, a, c);
        let flag = b.const_int(-1);
        let out = b.select(overflows, flag, product);
        b.terminate(Terminator::Return(Some(out)));

        let backend = CraneliftBackend::host().unwrap();
        let exec = backend.finalize(&backend.compile_function(&func, &Resolver).unwrap()).unwrap();
        let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(exec.entry_address()) };
        assert_eq!(f(6, 7), 42);
        assert_eq!(f(i64::MAX, 2), -1);
        assert_eq!(f(i64::MIN, -1), -1);
    }

    #[test]
    fn test_cranelift_calls_runtime_through_invoke() {
        let mut func = IrFunction::new("len", &[IrType::Obj], IrType::I64);
        let p = func.param(0);
        func.set_ref_type(p, RefType::Borrowed, false);
        let entry = func.entry;
        let normal = func.add_block();
        let unwind = func.add_block();
        let n = func.new_value(IrType::I64);
        func.block_mut(entry).terminator = Terminator::Invoke {
            dest: Some(n),
            callee: Callee::Runtime(RuntimeFn::Len),
            args: vec![p],
            consumed: vec![],
            normal,
            unwind,
        };
        func.block_mut(normal).terminator = Terminator::Return(Some(n));
        let mut b = IrBuilder::new(&mut func, unwind);
        let minus = b.const_int(-1);
        b.terminate(Terminator::Return(Some(minus)));

        let backend = CraneliftBackend::host().unwrap();
        let compiled = backend.compile_function(&func, &Resolver).unwrap();
        let exec = backend.finalize(&compiled).unwrap();
        let f: extern "C" fn(*const u8) -> i64 = unsafe { std::mem::transmute(exec.entry_address()) };
        assert_eq!(f(std::ptr::null()), 7);
    }

    #[test]
    fn test_cranelift_loads_through_global() {
        let mut func = IrFunction::new("refcnt", &[], IrType::I64);
        let none = func.global(GlobalRef::None);
        let entry = func.entry;
        let mut b = IrBuilder::new(&mut func, entry);
        let count = b.load(IrType::I64, none, 0);
        b.terminate(Terminator::Return(Some(count)));

        let backend = CraneliftBackend::host().unwrap();
        let exec = backend.finalize(&backend.compile_function(&func, &Resolver).unwrap()).unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(exec.entry_address()) };
        assert_eq!(f(), 1);
    }

    #[test]
    fn test_cranelift_reports_unresolved_runtime_fn() {
        let mut func = IrFunction::new("raise", &[IrType::Obj], IrType::Void);
        let p = func.param(0);
        let entry = func.entry;
        let mut b = IrBuilder::new(&mut func, entry);
        b.call(Callee::Runtime(RuntimeFn::Raise), vec![p], vec![], IrType::Void);
        b.terminate(Terminator::Unreachable);

        let backend = CraneliftBackend::host().unwrap();
        let err = backend.compile_function(&func, &Resolver).unwrap_err();
        assert!(matches!(err, CodegenError::UnresolvedSymbol(ref s) if s == "raise"));
    }
}
