//! Per-function emission: prologues, block traversal, joins
//!
//! Blocks are emitted in `block_order`. A block with one already emitted
//! predecessor inherits that predecessor's symbol table; a join gets one
//! phi per live name, typed by the type analysis. Values flowing into a
//! join are converted on the incoming edge and parked until every block is
//! emitted, then wired into the phis in one back-patching sweep.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::generator::{is_shadow, shadow_name, BlockGenerator, SymbolTable};
use super::order::block_order;
use super::tiering;
use super::{CompileRequest, EntryKind, IrEmitter};
use crate::analysis::reachable_from;
use crate::cfg::{CfgBlockId, Name, Stmt};
use crate::compvars::{TypeRef, TypeRegistry, VarRef, VarValue};
use crate::config::JitConfig;
use crate::ir::builder::add_phi_incoming;
use crate::ir::{BlockId, IrFunction, IrType, RefType, Terminator, Value};
use crate::profiling::TierPolicy;
use crate::runtime::{CodeRef, FunctionSpecialization, OsrEntryDescriptor, RuntimeFn};

/// Source of an edge into a join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Pred {
    Block(CfgBlockId),
    /// The prologue of an OSR entry
    OsrEntry,
}

impl std::fmt::Display for Pred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pred::Block(b) => write!(f, "{}", b),
            Pred::OsrEntry => write!(f, "osr entry"),
        }
    }
}

/// A name carried into a join, with its shadow if it may be unbound
struct JoinVar {
    name: Name,
    ty: TypeRef,
    shadow: Option<Name>,
}

/// Phis of one join, in creation order
struct JoinBlock {
    block: CfgBlockId,
    phis: Vec<(Name, TypeRef, Value)>,
}

/// Values converted for a join, waiting for back-patching
struct PendingEdge {
    from: BlockId,
    values: SymbolTable,
}

/// Symbol tables a block leaves to its single-predecessor successors
#[derive(Default)]
struct BlockEnd {
    normal: SymbolTable,
    /// Successors still to inherit `normal`
    normal_users: usize,
    /// Exception successor of an invoke and the table it starts with
    exc: Option<(CfgBlockId, SymbolTable)>,
}

/// Output of IR emission, before cleanup and refcounting
pub struct EmittedFunction {
    pub ir: IrFunction,
    pub code_ref: CodeRef,
    pub osr_exits: Vec<Arc<OsrEntryDescriptor>>,
}

pub(super) struct FunctionGenerator<'a> {
    req: &'a CompileRequest<'a>,
    em: IrEmitter<'a>,
    code_ref: CodeRef,
    policy: TierPolicy,
    start: CfgBlockId,
    osr: bool,
    ir_blocks: Vec<BlockId>,
    reachable: Vec<bool>,
    forced: Vec<bool>,
    ends: Vec<Option<BlockEnd>>,
    joins: Vec<JoinBlock>,
    pending: FxHashMap<(Pred, CfgBlockId), PendingEdge>,
    osr_exits: Vec<Arc<OsrEntryDescriptor>>,
}

/// Native parameter types of the entry point
fn entry_params(req: &CompileRequest<'_>, config: &JitConfig) -> Vec<IrType> {
    let inline = config.num_inline_args;
    match &req.entry {
        EntryKind::Fresh(spec) => {
            let mut params = Vec::new();
            if req.scope.takes_closure() {
                params.push(IrType::RawPtr);
            }
            if req.scope.is_generator() {
                params.push(IrType::RawPtr);
            }
            params.extend(spec.arg_types.iter().take(inline).map(|t| t.ir_type()));
            if spec.arg_types.len() > inline {
                params.push(IrType::RawPtr);
            }
            params
        }
        EntryKind::Osr(desc) => desc.param_types(inline),
    }
}

impl<'a> FunctionGenerator<'a> {
    pub(super) fn new(
        req: &'a CompileRequest<'a>,
        types: &'a TypeRegistry,
        config: &'a JitConfig,
        code_ref: CodeRef,
    ) -> Self {
        let cfg = req.cfg;
        let (start, osr) = match &req.entry {
            EntryKind::Fresh(_) => (cfg.entry(), false),
            EntryKind::Osr(desc) => (desc.backedge_target, true),
        };
        let func = IrFunction::new(cfg.name.clone(), &entry_params(req, config), IrType::Obj);
        let mut em = IrEmitter::new(func, types, config, req.style);
        let ir_blocks = cfg.block_ids().map(|_| em.create_block()).collect();
        let n = cfg.num_blocks();
        FunctionGenerator {
            req,
            em,
            code_ref,
            policy: TierPolicy::new(config),
            start,
            osr,
            ir_blocks,
            reachable: reachable_from(cfg, start),
            forced: vec![false; n],
            ends: (0..n).map(|_| None).collect(),
            joins: Vec::new(),
            pending: FxHashMap::default(),
            osr_exits: Vec::new(),
        }
    }

    pub(super) fn run(mut self) -> EmittedFunction {
        let cfg = self.req.cfg;
        let order = block_order(cfg, self.start);
        for s in &order {
            self.forced[s.block.index()] = s.forced;
        }

        let req = self.req;
        let mut entry_table = match &req.entry {
            EntryKind::Fresh(spec) => self.fresh_prologue(spec),
            EntryKind::Osr(desc) => {
                self.osr_prologue(desc);
                SymbolTable::new()
            }
        };

        for s in &order {
            let b = s.block;
            let table = if b == self.start && !self.osr {
                std::mem::take(&mut entry_table)
            } else if self.is_join(b) {
                self.create_phis(b)
            } else {
                self.inherit(b)
            };
            self.emit_block(b, table);
        }

        self.backpatch();
        tracing::debug!(
            function = %cfg.name,
            blocks = self.em.func().blocks.len(),
            joins = self.joins.len(),
            osr_exits = self.osr_exits.len(),
            "emitted ir"
        );
        EmittedFunction { ir: self.em.into_func(), code_ref: self.code_ref, osr_exits: self.osr_exits }
    }

    fn ir_block(&self, b: CfgBlockId) -> BlockId {
        self.ir_blocks[b.index()]
    }

    /// Blocks whose entry values come from phis
    fn is_join(&self, b: CfgBlockId) -> bool {
        self.forced[b.index()] || (self.osr && b == self.start) || self.req.cfg.preds(b).len() > 1
    }

    fn safepoint(&mut self) {
        self.em.call_runtime(RuntimeFn::Safepoint, vec![], vec![]);
    }

    /// Parameter at `index`, or slot `index - inline` of the spill array
    fn entry_arg(&mut self, first: usize, index: usize, total: usize, ty: IrType) -> Value {
        let inline = self.em.config().num_inline_args;
        if index < inline {
            return self.em.func().param(first + index);
        }
        if total <= inline {
            crate::ice!("argument {} of {} has no slot", index, total);
        }
        let spill = self.em.func().param(first + inline);
        self.em.builder().load(ty, spill, 8 * (index - inline) as i32)
    }

    fn fresh_prologue(&mut self, spec: &FunctionSpecialization) -> SymbolTable {
        let cfg = self.req.cfg;
        if spec.arg_types.len() != cfg.params.len() {
            crate::ice!(
                "{} takes {} parameters, specialization has {}",
                cfg.name,
                cfg.params.len(),
                spec.arg_types.len()
            );
        }
        let first = usize::from(self.req.scope.takes_closure()) + usize::from(self.req.scope.is_generator());
        let n = cfg.params.len();
        let mut table = SymbolTable::new();
        for (i, (name, ty)) in cfg.params.iter().zip(&spec.arg_types).enumerate() {
            if !ty.is_concrete() {
                crate::ice!("parameter {} of {} has non-concrete type {}", name, cfg.name, ty);
            }
            let v = self.entry_arg(first, i, n, ty.ir_type());
            if ty.ir_type().is_object() {
                self.em.tag_borrowed(v);
            }
            table.insert(name.clone(), VarRef::ir(ty.clone(), v));
        }

        let effort = self.req.effort;
        if self.policy.wants_reopt_prologue(effort, cfg.is_module, false) {
            if let Some(threshold) = self.policy.reopt_threshold(effort) {
                let params = self.em.func().params.clone();
                tiering::emit_reopt_prologue(&mut self.em, self.code_ref, threshold, params);
            }
        }
        self.safepoint();
        let target = self.ir_block(self.start);
        self.em.jump(target);
        table
    }

    /// Receive the live set of a back-edge and widen each value to what
    /// this version expects at the loop header
    fn osr_prologue(&mut self, desc: &OsrEntryDescriptor) {
        let target = self.start;
        let n = desc.args.len();
        let mut table = SymbolTable::new();
        for (i, (name, ty)) in desc.args.iter().enumerate() {
            let v = self.entry_arg(0, i, n, ty.ir_type());
            if ty.ir_type().is_object() {
                self.em.tag_borrowed(v);
            }
            table.insert(name.clone(), VarRef::ir(ty.clone(), v));
        }

        let mut expected: Vec<(Name, TypeRef)> = Vec::new();
        let bool_ty = self.em.types().bool_();
        for jv in self.join_vars(target) {
            if let Some(shadow) = jv.shadow {
                expected.push((shadow, bool_ty.clone()));
            }
            expected.push((jv.name, jv.ty));
        }
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        if !table.keys().eq(expected.iter().map(|(name, _)| name)) {
            crate::ice!(
                "OSR entry into {} offers [{}], expected [{}]",
                target,
                join_names(table.keys()),
                join_names(expected.iter().map(|(name, _)| name))
            );
        }
        for (name, ty) in &expected {
            let offered = table[name].ty();
            if !offered.can_convert_to(ty) {
                crate::ice!("cannot upgrade {} from {} to {} on OSR entry into {}", name, offered, ty, target);
            }
        }

        self.safepoint();
        let values = self.convert_for_join(&table, Pred::OsrEntry, target);
        let from = self.em.current_block();
        self.pending.insert((Pred::OsrEntry, target), PendingEdge { from, values });
        let ir_target = self.ir_block(target);
        self.em.jump(ir_target);
    }

    fn join_vars(&self, b: CfgBlockId) -> Vec<JoinVar> {
        self.req
            .phis
            .required_at_start(b)
            .into_iter()
            .map(|name| {
                let ty = self.req.types.type_at_block_start(&name, b).concrete();
                let shadow = self.req.phis.is_potentially_undefined_at(&name, b).then(|| shadow_name(&name));
                JoinVar { name, ty, shadow }
            })
            .collect()
    }

    fn create_phis(&mut self, b: CfgBlockId) -> SymbolTable {
        let ir_block = self.ir_block(b);
        self.em.switch_to(ir_block);
        let bool_ty = self.em.types().bool_();
        let mut table = SymbolTable::new();
        let mut phis = Vec::new();
        for jv in self.join_vars(b) {
            let ir_ty = jv.ty.ir_type();
            let v = self.em.builder().phi(ir_ty);
            if ir_ty.is_object() {
                self.em.tag(v, RefType::Owned, jv.shadow.is_some());
            }
            table.insert(jv.name.clone(), VarRef::ir(jv.ty.clone(), v));
            phis.push((jv.name, jv.ty, v));
            if let Some(shadow) = jv.shadow {
                let s = self.em.builder().phi(IrType::I1);
                table.insert(shadow.clone(), VarRef::ir(bool_ty.clone(), s));
                phis.push((shadow, bool_ty.clone(), s));
            }
        }
        tracing::trace!(block = %b, phis = phis.len(), forced = self.forced[b.index()], "join");
        if self.reachable[b.index()] {
            self.joins.push(JoinBlock { block: b, phis });
        }
        table
    }

    /// Start from the predecessor's symbol table, keeping what is live
    fn inherit(&mut self, b: CfgBlockId) -> SymbolTable {
        let pred = match self.req.cfg.preds(b) {
            [p] => *p,
            preds => crate::ice!("{} has {} predecessors but no phis", b, preds.len()),
        };
        let Some(end) = self.ends[pred.index()].as_mut() else {
            crate::ice!("{} scheduled before its predecessor {}", b, pred)
        };
        let table = match &mut end.exc {
            Some((exc, t)) if *exc == b => std::mem::take(t),
            _ => {
                end.normal_users = end.normal_users.saturating_sub(1);
                if end.normal_users == 0 {
                    std::mem::take(&mut end.normal)
                } else {
                    end.normal.clone()
                }
            }
        };

        let required = self.req.phis.required_at_start(b);
        let keep = |name: &Name| {
            required.iter().any(|r| r == name || (is_shadow(name) && shadow_name(r) == *name))
        };
        table.into_iter().filter(|(name, _)| keep(name)).map(|(name, v)| (name, v.split())).collect()
    }

    fn emit_block(&mut self, b: CfgBlockId, mut table: SymbolTable) {
        let cfg = self.req.cfg;
        let block = cfg.block(b);
        let ir_block = self.ir_block(b);
        self.em.switch_to(ir_block);
        tracing::trace!(block = %b, ir_block = %ir_block, vars = table.len(), "emitting block");
        if cfg.is_backedge_target(b) {
            self.safepoint();
        }
        for stmt in block.body() {
            BlockGenerator::new(&mut self.em, &mut table).stmt(stmt);
        }

        let mut exc = None;
        match block.terminator() {
            Stmt::Jump(to) => {
                if self.reachable[b.index()] && self.is_join(*to) {
                    let values = self.convert_for_join(&table, Pred::Block(b), *to);
                    if cfg.is_backedge(b, *to) {
                        self.osr_exit(*to, &values);
                    }
                    let from = self.em.current_block();
                    self.pending.insert((Pred::Block(b), *to), PendingEdge { from, values });
                }
                let target = self.ir_block(*to);
                self.em.jump(target);
            }
            Stmt::Branch { test, then_block, else_block } => {
                self.check_plain_edge(b, *then_block);
                self.check_plain_edge(b, *else_block);
                let test = BlockGenerator::new(&mut self.em, &mut table).expr(test);
                let cond = test.nonzero(&mut self.em);
                if cond.ty().is_undef() {
                    self.em.terminate(Terminator::Unreachable);
                } else {
                    let (t, e) = (self.ir_block(*then_block), self.ir_block(*else_block));
                    self.em.branch(cond.ir_value(), t, e);
                }
            }
            Stmt::Invoke { stmt, normal, exc: handler } => {
                self.check_plain_edge(b, *normal);
                self.check_plain_edge(b, *handler);
                let bound: Vec<Name> = stmt.target().map(|t| vec![t.clone(), shadow_name(t)]).unwrap_or_default();
                let snapshot: SymbolTable = table
                    .iter()
                    .filter(|(name, _)| !bound.contains(name))
                    .map(|(name, v)| (name.clone(), v.fork()))
                    .collect();
                let prev = self.em.set_unwind(Some(self.ir_block(*handler)));
                BlockGenerator::new(&mut self.em, &mut table).stmt(stmt);
                self.em.set_unwind(prev);
                let target = self.ir_block(*normal);
                self.em.jump(target);
                exc = Some((*handler, snapshot));
            }
            Stmt::Return(value) => {
                let v = match value {
                    Some(e) => BlockGenerator::new(&mut self.em, &mut table).expr(e),
                    None => {
                        let none = self.em.global(crate::runtime::GlobalRef::None);
                        VarRef::ir(self.em.types().none(), none)
                    }
                };
                let boxed = v.boxed(&mut self.em).ir_value();
                self.em.terminate(Terminator::Return(Some(boxed)));
            }
            Stmt::Raise(e) => {
                let v = BlockGenerator::new(&mut self.em, &mut table).expr(e);
                let boxed = v.boxed(&mut self.em).ir_value();
                self.em.call_runtime(RuntimeFn::Raise, vec![boxed], vec![boxed]);
                self.em.terminate(Terminator::Unreachable);
            }
            other => crate::ice!("{} ends in non-terminator {:?}", b, other),
        }

        let exc_block = exc.as_ref().map(|(h, _)| *h);
        let mut succs: Vec<CfgBlockId> = block.terminator().successors();
        succs.dedup();
        let normal_users = succs
            .iter()
            .filter(|s| Some(**s) != exc_block && !self.is_join(**s))
            .count();
        self.ends[b.index()] = Some(BlockEnd { normal: table, normal_users, exc });
    }

    /// Only jumps may enter a join from emitted code
    fn check_plain_edge(&self, from: CfgBlockId, to: CfgBlockId) {
        if self.reachable[from.index()] && self.is_join(to) {
            crate::ice!("{} enters join {} through a branching terminator", from, to);
        }
    }

    /// Convert `table` to the types the phis of `to` expect
    fn convert_for_join(&mut self, table: &SymbolTable, from: Pred, to: CfgBlockId) -> SymbolTable {
        let types = self.em.types();
        let mut out = SymbolTable::new();
        for jv in self.join_vars(to) {
            match table.get(&jv.name) {
                Some(v) => {
                    if !v.ty().can_convert_to(&jv.ty) {
                        crate::ice!(
                            "type mismatch at join {}: {} is {} leaving {}, phi expects {}",
                            to,
                            jv.name,
                            v.ty(),
                            from,
                            jv.ty
                        );
                    }
                    let converted = v.make_converted(&mut self.em, &jv.ty);
                    out.insert(jv.name.clone(), converted);
                }
                None if jv.shadow.is_some() => {
                    let undef = VarRef::new(types.undef(), VarValue::Undef);
                    let converted = undef.make_converted(&mut self.em, &jv.ty);
                    out.insert(jv.name.clone(), converted);
                }
                None => {}
            }
            if let Some(shadow) = jv.shadow {
                let defined = match table.get(&shadow) {
                    Some(s) => s.clone(),
                    None => {
                        let bound = table.contains_key(&jv.name);
                        VarRef::ir(types.bool_(), self.em.builder().const_bool(bound))
                    }
                };
                out.insert(shadow, defined);
            }
        }
        out
    }

    fn osr_exit(&mut self, target: CfgBlockId, values: &SymbolTable) {
        let effort = self.req.effort;
        if !self.policy.wants_osr_exits(effort, self.osr) {
            return;
        }
        let Some(threshold) = self.policy.osr_threshold(effort) else { return };
        let index = self.osr_exits.len() as u32;
        let descriptor = OsrEntryDescriptor {
            source: self.code_ref,
            backedge_target: target,
            args: values.iter().map(|(name, v)| (name.clone(), v.ty().clone())).collect(),
        };
        tiering::emit_osr_exit(&mut self.em, self.code_ref, index, threshold, values);
        self.osr_exits.push(Arc::new(descriptor));
    }

    /// Wire every parked edge into the phis of its join
    fn backpatch(&mut self) {
        let cfg = self.req.cfg;
        for join in &self.joins {
            let mut preds: Vec<Pred> = cfg
                .preds(join.block)
                .iter()
                .filter(|p| self.reachable[p.index()])
                .map(|p| Pred::Block(*p))
                .collect();
            if self.osr && join.block == self.start {
                preds.push(Pred::OsrEntry);
            }
            let mut phi_names: Vec<&Name> = join.phis.iter().map(|(name, _, _)| name).collect();
            phi_names.sort();

            for pred in preds {
                let Some(edge) = self.pending.remove(&(pred, join.block)) else {
                    crate::ice!("no values recorded on edge {} -> {}", pred, join.block)
                };
                if !edge.values.keys().eq(phi_names.iter().copied()) {
                    crate::ice!(
                        "keyset mismatch on edge {} -> {}: phis [{}], incoming [{}]",
                        pred,
                        join.block,
                        join_names(phi_names.iter().copied()),
                        join_names(edge.values.keys())
                    );
                }
                let ir_block = self.ir_blocks[join.block.index()];
                for (name, ty, phi) in &join.phis {
                    let v = &edge.values[name];
                    if v.ty() != ty {
                        crate::ice!(
                            "type mismatch at join {}: phi {} is {}, {} from {}",
                            join.block,
                            name,
                            ty,
                            v.ty(),
                            pred
                        );
                    }
                    add_phi_incoming(self.em.func_mut(), ir_block, *phi, edge.from, v.ir_value());
                }
            }
        }
    }
}

fn join_names<'n>(names: impl Iterator<Item = &'n Name>) -> String {
    names.map(|n| &**n).collect::<Vec<_>>().join(", ")
}
