//! IR emission driver
//!
//! `do_compile` turns one CFG into a `CompiledFunction`: it emits IR block
//! by block against the analyses in a `CompileRequest`, drops blocks no
//! entry reaches, and runs refcount insertion over the result.

mod driver;
mod emitter;
mod generator;
mod order;
mod tiering;

use std::sync::Arc;

use crate::analysis::{PhiAnalysis, ScopeInfo, TypeAnalysis};
use crate::cfg::Cfg;
use crate::compvars::TypeRegistry;
use crate::config::JitConfig;
use crate::profiling::EffortLevel;
use crate::refcount;
use crate::runtime::{CodeRef, CompiledFunction, ExceptionStyle, FunctionSpecialization, OsrEntryDescriptor};

pub use driver::EmittedFunction;
pub use emitter::IrEmitter;
pub use order::{block_order, Scheduled};

/// How the compiled code is entered
#[derive(Debug, Clone)]
pub enum EntryKind {
    /// A normal call with arguments of these types
    Fresh(FunctionSpecialization),
    /// Mid-loop, from the back-edge the descriptor describes
    Osr(Arc<OsrEntryDescriptor>),
}

/// Everything the driver needs to compile one function version
pub struct CompileRequest<'a> {
    pub cfg: &'a Cfg,
    pub scope: &'a dyn ScopeInfo,
    pub types: &'a dyn TypeAnalysis,
    pub phis: &'a dyn PhiAnalysis,
    pub entry: EntryKind,
    pub effort: EffortLevel,
    /// Convention callers use to learn of a raised exception
    pub style: ExceptionStyle,
}

/// Emit IR for `req` without cleanup or refcounting
pub fn emit_function(req: &CompileRequest<'_>, types: &TypeRegistry, config: &JitConfig) -> EmittedFunction {
    driver::FunctionGenerator::new(req, types, config, CodeRef::fresh()).run()
}

#[tracing::instrument(level = "debug", skip_all, fields(function = %req.cfg.name, effort = %req.effort))]
pub fn do_compile(req: &CompileRequest<'_>, types: &TypeRegistry, config: &JitConfig) -> CompiledFunction {
    let EmittedFunction { mut ir, code_ref, osr_exits } = emit_function(req, types, config);
    let removed = ir.remove_unreachable_blocks();
    let stats = refcount::add_refcounts(&mut ir, config);
    tracing::debug!(
        %code_ref,
        removed,
        increfs = stats.increfs,
        decrefs = stats.decrefs,
        "compiled"
    );

    let (spec, osr_entry) = match &req.entry {
        EntryKind::Fresh(spec) => (spec.clone(), None),
        EntryKind::Osr(desc) => {
            let spec = FunctionSpecialization {
                arg_types: desc.args.iter().map(|(_, ty)| ty.clone()).collect(),
                ret_type: types.unknown(),
            };
            (spec, Some(desc.clone()))
        }
    };
    CompiledFunction::new(code_ref, req.cfg.name.clone(), spec, req.style, req.effort, osr_entry, osr_exits, ir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{CfgPhiAnalysis, FunctionScope, PropagatingTypeAnalysis};
    use crate::cfg::{BinOpKind, CfgBlockId, CfgBuilder, Expr, Name, Stmt};
    use crate::compvars::TypeRef;
    use crate::ir::{Callee, Instr, IrFunction, IrType, Terminator, Value};
    use crate::runtime::{GlobalRef, RuntimeFn};

    fn runtime_calls(func: &IrFunction, f: RuntimeFn) -> usize {
        let in_instrs = func
            .blocks
            .iter()
            .flat_map(|b| &b.instrs)
            .filter(|i| matches!(i, Instr::Call { callee: Callee::Runtime(c), .. } if *c == f))
            .count();
        let in_invokes = func
            .blocks
            .iter()
            .filter(|b| matches!(&b.terminator, Terminator::Invoke { callee: Callee::Runtime(c), .. } if *c == f))
            .count();
        in_instrs + in_invokes
    }

    /// (phi value, type, incoming count) of every phi
    fn phis(func: &IrFunction) -> Vec<(Value, IrType, usize)> {
        func.blocks
            .iter()
            .flat_map(|b| &b.instrs)
            .filter_map(|i| match i {
                Instr::Phi { dest, incoming } => Some((*dest, func.value_type(*dest), incoming.len())),
                _ => None,
            })
            .collect()
    }

    fn has_global(func: &IrFunction, pred: impl Fn(&GlobalRef) -> bool) -> bool {
        (0..func.num_values()).any(|i| func.global_of(Value(i as u32)).is_some_and(&pred))
    }

    fn checked() -> JitConfig {
        JitConfig { verify_refcount_tags: true, ..JitConfig::default() }
    }

    fn emit(cfg: &Cfg, reg: &TypeRegistry, effort: EffortLevel) -> EmittedFunction {
        let spec = FunctionSpecialization::generic(reg, cfg.params.len());
        let types = PropagatingTypeAnalysis::new(cfg, reg, &spec.arg_types);
        let phis = CfgPhiAnalysis::new(cfg);
        let scope = FunctionScope::default();
        let req = CompileRequest {
            cfg,
            scope: &scope,
            types: &types,
            phis: &phis,
            entry: EntryKind::Fresh(spec),
            effort,
            style: ExceptionStyle::Cxx,
        };
        emit_function(&req, reg, &checked())
    }

    /// i = 0; while c: i = i ^ 1; return i
    fn counting_loop() -> (Cfg, CfgBlockId) {
        toggling_loop(BinOpKind::BitXor)
    }

    /// i = 0; while c: i = i <op> 1; return i
    fn toggling_loop(op: BinOpKind) -> (Cfg, CfgBlockId) {
        let mut b = CfgBuilder::new("count", &["c"]);
        let entry = b.add_block();
        let header = b.add_block();
        let body = b.add_block();
        let exit = b.add_block();
        b.push(entry, Stmt::assign("i", Expr::Int(0)));
        b.push(entry, Stmt::Jump(header));
        b.push(header, Stmt::Branch { test: Expr::name("c"), then_block: body, else_block: exit });
        b.push(body, Stmt::assign("i", Expr::binop(op, Expr::name("i"), Expr::Int(1))));
        b.push(body, Stmt::Jump(header));
        b.push(exit, Stmt::Return(Some(Expr::name("i"))));
        (b.finish(), header)
    }

    /// if c: x = left else: x = right; return x
    fn diamond(left: Expr, right: Expr) -> Cfg {
        let mut b = CfgBuilder::new("pick", &["c"]);
        let entry = b.add_block();
        let l = b.add_block();
        let r = b.add_block();
        let join = b.add_block();
        b.push(entry, Stmt::Branch { test: Expr::name("c"), then_block: l, else_block: r });
        b.push(l, Stmt::assign("x", left));
        b.push(l, Stmt::Jump(join));
        b.push(r, Stmt::assign("x", right));
        b.push(r, Stmt::Jump(join));
        b.push(join, Stmt::Return(Some(Expr::name("x"))));
        b.finish()
    }

    #[test]
    fn test_loop_header_gets_typed_phis() {
        let reg = TypeRegistry::new();
        let (cfg, _) = counting_loop();
        let out = emit(&cfg, &reg, EffortLevel::Maximal);
        let mut phis = phis(&out.ir);
        phis.sort_by_key(|(v, _, _)| *v);
        let types: Vec<IrType> = phis.iter().map(|(_, t, _)| *t).collect();
        assert_eq!(types.len(), 2);
        assert!(types.contains(&IrType::I64));
        assert!(types.contains(&IrType::Obj));
        assert!(phis.iter().all(|(_, _, n)| *n == 2));
        // function entry and the loop header
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::Safepoint), 2);
        assert!(out.osr_exits.is_empty());
    }

    #[test]
    fn test_adding_loop_counter_is_boxed() {
        let reg = TypeRegistry::new();
        let (cfg, _) = toggling_loop(BinOpKind::Add);
        let out = emit(&cfg, &reg, EffortLevel::Maximal);
        let phis = phis(&out.ir);
        assert!(phis.iter().any(|(_, t, _)| *t == IrType::Obj));
        assert!(phis.iter().all(|(_, t, _)| *t != IrType::I64));
        // i starts as the constant 0, so the body sees an object
        let checked = out.ir.blocks.iter().flat_map(|b| &b.instrs).filter(|i| matches!(i, Instr::IntOverflows { .. }));
        assert_eq!(checked.count(), 0);
        let generic = runtime_calls(&out.ir, RuntimeFn::Binop(ExceptionStyle::Cxx))
            + runtime_calls(&out.ir, RuntimeFn::Binop(ExceptionStyle::Capi));
        assert_eq!(generic, 1);
    }

    #[test]
    fn test_object_phi_is_owned() {
        let reg = TypeRegistry::new();
        let (cfg, _) = counting_loop();
        let out = emit(&cfg, &reg, EffortLevel::Maximal);
        let (obj_phi, _, _) = phis(&out.ir).into_iter().find(|(_, t, _)| *t == IrType::Obj).unwrap();
        let info = out.ir.ref_info(obj_phi).unwrap();
        assert!(info.is_owned());
        assert!(!info.nullable);
    }

    #[test]
    fn test_unoptimized_tier_counts_calls_and_backedges() {
        let reg = TypeRegistry::new();
        let (cfg, header) = counting_loop();
        let out = emit(&cfg, &reg, EffortLevel::Minimal);
        assert!(has_global(&out.ir, |g| matches!(g, GlobalRef::CallCounter(c) if *c == out.code_ref)));
        assert!(has_global(&out.ir, |g| matches!(g, GlobalRef::BackedgeCounter(c, 0) if *c == out.code_ref)));
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::Reoptimize), 1);
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::OnStackReplace), 1);

        assert_eq!(out.osr_exits.len(), 1);
        let desc = &out.osr_exits[0];
        assert_eq!(desc.source, out.code_ref);
        assert_eq!(desc.backedge_target, header);
        let args: Vec<(&str, TypeRef)> = desc.args.iter().map(|(n, t)| (&**n, t.clone())).collect();
        assert_eq!(args, vec![("c", reg.unknown()), ("i", reg.int())]);
    }

    #[test]
    fn test_module_code_has_no_reopt_prologue() {
        let reg = TypeRegistry::new();
        let mut b = CfgBuilder::module("main");
        let entry = b.add_block();
        b.push(entry, Stmt::Return(None));
        let cfg = b.finish();
        let out = emit(&cfg, &reg, EffortLevel::Minimal);
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::Reoptimize), 0);
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::Safepoint), 1);
    }

    #[test]
    fn test_mixed_join_boxes_each_arm() {
        let reg = TypeRegistry::new();
        let cfg = diamond(Expr::Int(1), Expr::Float(2.5));
        let out = emit(&cfg, &reg, EffortLevel::Maximal);
        let phis = phis(&out.ir);
        assert_eq!(phis.len(), 1);
        let (phi, ty, incoming) = phis[0];
        assert_eq!((ty, incoming), (IrType::Obj, 2));
        assert!(out.ir.ref_info(phi).unwrap().is_owned());
        // 1 is a cached small int; only the float allocates
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::BoxFloat), 1);
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::BoxInt), 0);
    }

    #[test]
    fn test_agreeing_join_stays_unboxed() {
        let reg = TypeRegistry::new();
        let cfg = diamond(Expr::Int(1), Expr::Int(1000));
        let out = emit(&cfg, &reg, EffortLevel::Maximal);
        let phis = phis(&out.ir);
        assert_eq!(phis.len(), 1);
        assert_eq!(phis[0].1, IrType::I64);
        // boxed once, for the return
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::BoxInt), 1);
    }

    #[test]
    fn test_conditionally_bound_name_is_checked() {
        let reg = TypeRegistry::new();
        let mut b = CfgBuilder::new("maybe", &["c"]);
        let entry = b.add_block();
        let set = b.add_block();
        let join = b.add_block();
        b.push(entry, Stmt::Branch { test: Expr::name("c"), then_block: set, else_block: join });
        b.push(set, Stmt::assign("x", Expr::Int(1)));
        b.push(set, Stmt::Jump(join));
        b.push(join, Stmt::Return(Some(Expr::name("x"))));
        let cfg = b.finish();

        let out = emit(&cfg, &reg, EffortLevel::Maximal);
        let types: Vec<IrType> = phis(&out.ir).iter().map(|(_, t, _)| *t).collect();
        assert_eq!(types.len(), 2);
        assert!(types.contains(&IrType::I64));
        assert!(types.contains(&IrType::I1));
        assert!(phis(&out.ir).iter().all(|(_, _, n)| *n == 2));
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::RaiseUnboundLocal), 1);
    }

    #[test]
    fn test_exception_edge_does_not_see_invoke_target() {
        let reg = TypeRegistry::new();
        let mut b = CfgBuilder::new("guarded", &["f"]);
        let entry = b.add_block();
        let normal = b.add_block();
        let handler = b.add_block();
        b.push(entry, Stmt::invoke(Stmt::assign("r", Expr::call(Expr::name("f"), vec![])), normal, handler));
        b.push(normal, Stmt::Return(Some(Expr::name("r"))));
        b.push(handler, Stmt::Return(Some(Expr::name("r"))));
        let cfg = b.finish();

        let out = emit(&cfg, &reg, EffortLevel::Maximal);
        let invokes: Vec<&Terminator> = out
            .ir
            .blocks
            .iter()
            .map(|b| &b.terminator)
            .filter(|t| matches!(t, Terminator::Invoke { callee: Callee::Runtime(RuntimeFn::RuntimeCall(..)), .. }))
            .collect();
        assert_eq!(invokes.len(), 1);
        // only the handler's read of r is unbound
        assert_eq!(runtime_calls(&out.ir, RuntimeFn::RaiseUnboundLocal), 1);
    }

    #[test]
    fn test_params_past_inline_limit_are_spilled() {
        let reg = TypeRegistry::new();
        let mut b = CfgBuilder::new("wide", &["a", "b", "c", "d"]);
        let entry = b.add_block();
        b.push(entry, Stmt::Return(Some(Expr::name("d"))));
        let cfg = b.finish();
        let out = emit(&cfg, &reg, EffortLevel::Maximal);
        let params: Vec<IrType> = out.ir.params.iter().map(|p| out.ir.value_type(*p)).collect();
        assert_eq!(params, vec![IrType::Obj, IrType::Obj, IrType::Obj, IrType::RawPtr]);
        let spill = out.ir.param(3);
        let loads = out.ir.blocks[0]
            .instrs
            .iter()
            .filter(|i| matches!(i, Instr::Load { base, offset: 0, .. } if *base == spill))
            .count();
        assert_eq!(loads, 1);
    }

    fn osr_request<'a>(
        cfg: &'a Cfg,
        scope: &'a FunctionScope,
        types: &'a dyn TypeAnalysis,
        phis: &'a CfgPhiAnalysis,
        desc: OsrEntryDescriptor,
    ) -> CompileRequest<'a> {
        CompileRequest {
            cfg,
            scope,
            types,
            phis,
            entry: EntryKind::Osr(Arc::new(desc)),
            effort: EffortLevel::Maximal,
            style: ExceptionStyle::Cxx,
        }
    }

    #[test]
    fn test_osr_entry_feeds_header_phis() {
        let reg = TypeRegistry::new();
        let (cfg, header) = counting_loop();
        let args = vec![(Name::from("c"), reg.unknown()), (Name::from("i"), reg.int())];
        let types = PropagatingTypeAnalysis::for_osr(&cfg, &reg, header, &args);
        let phis_analysis = CfgPhiAnalysis::new(&cfg);
        let scope = FunctionScope::default();
        let desc = OsrEntryDescriptor { source: CodeRef(1), backedge_target: header, args };
        let req = osr_request(&cfg, &scope, &types, &phis_analysis, desc);

        let mut out = emit_function(&req, &reg, &JitConfig::default());
        let params: Vec<IrType> = out.ir.params.iter().map(|p| out.ir.value_type(*p)).collect();
        assert_eq!(params, vec![IrType::Obj, IrType::I64]);
        assert!(out.osr_exits.is_empty());

        // the function's own entry block survives emission but not cleanup
        assert!(out.ir.remove_unreachable_blocks() > 0);
        let header_phis: Vec<usize> = phis(&out.ir).iter().map(|(_, _, n)| *n).collect();
        assert_eq!(header_phis, vec![2, 2]);
    }

    #[test]
    #[should_panic(expected = "cannot upgrade i")]
    fn test_osr_entry_rejects_narrowing() {
        let reg = TypeRegistry::new();
        let (cfg, header) = counting_loop();
        // this version believes i is an int at the header; the source only knows an object
        let types = PropagatingTypeAnalysis::new(&cfg, &reg, &[reg.unknown()]);
        let phis_analysis = CfgPhiAnalysis::new(&cfg);
        let scope = FunctionScope::default();
        let args = vec![(Name::from("c"), reg.unknown()), (Name::from("i"), reg.unknown())];
        let desc = OsrEntryDescriptor { source: CodeRef(1), backedge_target: header, args };
        let req = osr_request(&cfg, &scope, &types, &phis_analysis, desc);
        emit_function(&req, &reg, &JitConfig::default());
    }

    /// Claims one type for every name everywhere
    struct FixedTypes(TypeRef);

    impl TypeAnalysis for FixedTypes {
        fn type_at_block_start(&self, _name: &str, _block: CfgBlockId) -> TypeRef {
            self.0.clone()
        }
    }

    /// Real phi analysis plus one extra name required at one block
    struct ExtraName<'a> {
        inner: &'a CfgPhiAnalysis,
        block: CfgBlockId,
        name: Name,
    }

    impl PhiAnalysis for ExtraName<'_> {
        fn required_at_start(&self, block: CfgBlockId) -> Vec<Name> {
            let mut names = self.inner.required_at_start(block);
            if block == self.block {
                names.push(self.name.clone());
                names.sort();
            }
            names
        }

        fn is_potentially_undefined_at(&self, name: &str, block: CfgBlockId) -> bool {
            self.inner.is_potentially_undefined_at(name, block)
        }
    }

    #[test]
    #[should_panic(expected = "type mismatch at join")]
    fn test_join_type_disagreement_is_fatal() {
        let reg = TypeRegistry::new();
        let cfg = diamond(Expr::attr(Expr::name("c"), "a"), Expr::attr(Expr::name("c"), "b"));
        let types = FixedTypes(reg.int());
        let phis = CfgPhiAnalysis::new(&cfg);
        let scope = FunctionScope::default();
        let req = CompileRequest {
            cfg: &cfg,
            scope: &scope,
            types: &types,
            phis: &phis,
            entry: EntryKind::Fresh(FunctionSpecialization::generic(&reg, 1)),
            effort: EffortLevel::Maximal,
            style: ExceptionStyle::Cxx,
        };
        emit_function(&req, &reg, &JitConfig::default());
    }

    #[test]
    #[should_panic(expected = "keyset mismatch")]
    fn test_join_keyset_disagreement_is_fatal() {
        let reg = TypeRegistry::new();
        let cfg = diamond(Expr::Int(1), Expr::Int(2));
        let spec = FunctionSpecialization::generic(&reg, 1);
        let types = PropagatingTypeAnalysis::new(&cfg, &reg, &spec.arg_types);
        let inner = CfgPhiAnalysis::new(&cfg);
        let join = CfgBlockId(3);
        let phis = ExtraName { inner: &inner, block: join, name: Name::from("ghost") };
        let scope = FunctionScope::default();
        let req = CompileRequest {
            cfg: &cfg,
            scope: &scope,
            types: &types,
            phis: &phis,
            entry: EntryKind::Fresh(spec),
            effort: EffortLevel::Maximal,
            style: ExceptionStyle::Cxx,
        };
        emit_function(&req, &reg, &JitConfig::default());
    }

    #[test]
    fn test_do_compile_publishes_record() {
        let reg = TypeRegistry::new();
        let (cfg, _) = counting_loop();
        let spec = FunctionSpecialization::generic(&reg, 1);
        let types = PropagatingTypeAnalysis::new(&cfg, &reg, &spec.arg_types);
        let phis = CfgPhiAnalysis::new(&cfg);
        let scope = FunctionScope::default();
        let req = CompileRequest {
            cfg: &cfg,
            scope: &scope,
            types: &types,
            phis: &phis,
            entry: EntryKind::Fresh(spec),
            effort: EffortLevel::Minimal,
            style: ExceptionStyle::Capi,
        };
        let compiled = do_compile(&req, &reg, &checked());
        assert_eq!(compiled.name, "count");
        assert_eq!(compiled.exception_style, ExceptionStyle::Capi);
        assert_eq!(compiled.osr_exits.len(), 1);
        assert!(!compiled.is_osr());
        assert!(compiled.ir.reachable().iter().all(|r| *r));
        let pseudo = compiled.ir.blocks.iter().flat_map(|b| &b.instrs).filter(|i| i.is_refcount_op()).count();
        assert_eq!(pseudo, 0);
    }
}
