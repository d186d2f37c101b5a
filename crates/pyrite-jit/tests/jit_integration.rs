#![cfg(feature = "jit")]

//! Native compilation through Cranelift.
//!
//! Compiles CFGs end to end on the host ISA and publishes the code. The
//! runtime is not linked in, so the generated code is never called here;
//! execution of lowered IR is covered by the backend's own tests.

use std::sync::Arc;

use pyrite_jit::analysis::{CfgPhiAnalysis, FunctionScope, PropagatingTypeAnalysis};
use pyrite_jit::backend::CodegenBackend;
use pyrite_jit::cfg::{BinOpKind, CompareOp, Expr, Stmt};
use pyrite_jit::runtime::{FunctionSpecialization, GlobalRef};
use pyrite_jit::{
    Cfg, CfgBuilder, CompileRequest, CompiledFunction, CraneliftBackend, EffortLevel, EntryKind, ExceptionStyle,
    JitConfig, JitPipeline, PipelineError, RuntimeFn, RuntimeLinker,
};

/// Points every symbol at a never-called fake address
struct Linker;

impl RuntimeLinker for Linker {
    fn runtime_fn(&self, f: RuntimeFn) -> Option<usize> {
        Some(0x6000_0000 + 64 * f.symbol().len())
    }

    fn global(&self, g: &GlobalRef) -> Option<usize> {
        Some(0x6100_0000 + 64 * g.to_string().len())
    }
}

fn pipeline() -> JitPipeline<CraneliftBackend> {
    let backend = CraneliftBackend::host().expect("host ISA");
    let config = JitConfig { verify_refcount_tags: true, ..JitConfig::default() };
    JitPipeline::with_config(backend, Arc::new(Linker), config)
}

fn compile(
    p: &JitPipeline<CraneliftBackend>,
    cfg: &Cfg,
    effort: EffortLevel,
    style: ExceptionStyle,
) -> Result<Arc<CompiledFunction>, PipelineError> {
    let spec = FunctionSpecialization::generic(p.types(), cfg.params.len());
    let types = PropagatingTypeAnalysis::new(cfg, p.types(), &spec.arg_types);
    let phis = CfgPhiAnalysis::new(cfg);
    let scope = FunctionScope::default();
    let req = CompileRequest { cfg, scope: &scope, types: &types, phis: &phis, entry: EntryKind::Fresh(spec), effort, style };
    p.compile(&req)
}

/// s = 0; i = 0; while i < n: s = s + i * 2.5; i = i + 1; return s
fn mixed_sum() -> Cfg {
    let mut b = CfgBuilder::new("mixed_sum", &["n"]);
    let entry = b.add_block();
    let header = b.add_block();
    let body = b.add_block();
    let exit = b.add_block();
    b.push(entry, Stmt::assign("s", Expr::Float(0.0)));
    b.push(entry, Stmt::assign("i", Expr::Int(0)));
    b.push(entry, Stmt::Jump(header));
    b.push(
        header,
        Stmt::Branch {
            test: Expr::compare(CompareOp::Lt, Expr::name("i"), Expr::name("n")),
            then_block: body,
            else_block: exit,
        },
    );
    let step = Expr::binop(BinOpKind::Mul, Expr::name("i"), Expr::Float(2.5));
    b.push(body, Stmt::assign("s", Expr::binop(BinOpKind::Add, Expr::name("s"), step)));
    b.push(body, Stmt::assign("i", Expr::binop(BinOpKind::Add, Expr::name("i"), Expr::Int(1))));
    b.push(body, Stmt::Jump(header));
    b.push(exit, Stmt::Return(Some(Expr::name("s"))));
    b.finish()
}

/// try: r = o.get(k) except e: r = None; return r
fn guarded_method() -> Cfg {
    let mut b = CfgBuilder::new("guarded_method", &["o", "k"]);
    let entry = b.add_block();
    let normal = b.add_block();
    let handler = b.add_block();
    let join = b.add_block();
    let call = Expr::call_attr(Expr::name("o"), "get", vec![Expr::name("k")]);
    b.push(entry, Stmt::invoke(Stmt::assign("r", call), normal, handler));
    b.push(normal, Stmt::Jump(join));
    b.push(handler, Stmt::assign("e", Expr::LandingPad));
    b.push(handler, Stmt::assign("r", Expr::None));
    b.push(handler, Stmt::Jump(join));
    b.push(join, Stmt::Return(Some(Expr::name("r"))));
    b.finish()
}

#[test]
fn test_loop_compiles_natively_at_every_tier() {
    let p = pipeline();
    assert_eq!(p.backend().name(), "cranelift");
    let cfg = mixed_sum();
    for effort in [EffortLevel::Minimal, EffortLevel::Moderate, EffortLevel::Maximal] {
        let compiled = compile(&p, &cfg, effort, ExceptionStyle::Cxx).unwrap();
        let address = compiled.code_address().expect("published");
        assert_ne!(address, 0);
        assert_eq!(p.cache().entry_address(compiled.code_ref), Some(address));
    }
    assert!(p.cache().total_code_size() > 0);
}

#[test]
fn test_both_exception_styles_lower() {
    let p = pipeline();
    let cfg = guarded_method();
    let cxx = compile(&p, &cfg, EffortLevel::Maximal, ExceptionStyle::Cxx).unwrap();
    let capi = compile(&p, &cfg, EffortLevel::Maximal, ExceptionStyle::Capi).unwrap();
    assert_ne!(cxx.code_address(), capi.code_address());
    assert_eq!(p.cache().len(), 2);
}
