//! Forward type propagation over the CFG
//!
//! Expression types come from the type lattice's own typing rules, so the
//! types reported here describe what the emitted code will produce, or
//! something it converts to. Types are made concrete at block boundaries;
//! where predecessors disagree the result is `unknown`.

use rustc_hash::FxHashMap;

use super::{reverse_postorder, TypeAnalysis};
use crate::cfg::{Cfg, CfgBlock, CfgBlockId, Expr, Name, Stmt};
use crate::compvars::{TypeRef, TypeRegistry};

type TypeEnv = FxHashMap<Name, TypeRef>;

pub struct PropagatingTypeAnalysis {
    /// Concrete types on block entry; `None` for blocks never reached
    at_start: Vec<Option<TypeEnv>>,
    unknown: TypeRef,
}

impl PropagatingTypeAnalysis {
    /// Types for a fresh call with the given argument types
    pub fn new(cfg: &Cfg, reg: &TypeRegistry, arg_types: &[TypeRef]) -> Self {
        if arg_types.len() != cfg.params.len() {
            crate::ice!("{} takes {} arguments, typed {}", cfg.name, cfg.params.len(), arg_types.len());
        }
        let seed = cfg.params.iter().cloned().zip(arg_types.iter().cloned()).collect();
        Self::run(cfg, reg, cfg.entry(), seed)
    }

    /// Types for a version entered at a loop header with the given live
    /// values
    pub fn for_osr(cfg: &Cfg, reg: &TypeRegistry, target: CfgBlockId, args: &[(Name, TypeRef)]) -> Self {
        Self::run(cfg, reg, target, args.iter().cloned().collect())
    }

    fn run(cfg: &Cfg, reg: &TypeRegistry, start: CfgBlockId, seed: TypeEnv) -> Self {
        let rpo = reverse_postorder(cfg, start);
        let mut at_start: Vec<Option<TypeEnv>> = vec![None; cfg.num_blocks()];
        let mut sweeps = 0u32;
        let mut changed = true;
        while changed {
            changed = false;
            sweeps += 1;
            for &b in &rpo {
                let mut incoming: Vec<TypeEnv> = Vec::new();
                if b == start {
                    incoming.push(seed.clone());
                }
                for &p in cfg.preds(b) {
                    let Some(env) = &at_start[p.index()] else { continue };
                    let out = transfer(cfg.block(p), env.clone(), reg);
                    if let Some((_, env)) = out.into_iter().find(|(s, _)| *s == b) {
                        incoming.push(env);
                    }
                }
                if incoming.is_empty() {
                    continue;
                }
                let merged = Some(merge(incoming, reg));
                if merged != at_start[b.index()] {
                    at_start[b.index()] = merged;
                    changed = true;
                }
            }
        }
        tracing::trace!(function = %cfg.name, sweeps, "type propagation converged");
        PropagatingTypeAnalysis { at_start, unknown: reg.unknown() }
    }

    pub fn is_reached(&self, block: CfgBlockId) -> bool {
        self.at_start[block.index()].is_some()
    }
}

impl TypeAnalysis for PropagatingTypeAnalysis {
    fn type_at_block_start(&self, name: &str, block: CfgBlockId) -> TypeRef {
        self.at_start[block.index()]
            .as_ref()
            .and_then(|env| env.get(name).cloned())
            .unwrap_or_else(|| self.unknown.clone())
    }
}

/// Merge predecessor environments into concrete block-entry types
fn merge(incoming: Vec<TypeEnv>, reg: &TypeRegistry) -> TypeEnv {
    let mut seen: FxHashMap<Name, Vec<TypeRef>> = FxHashMap::default();
    for env in incoming {
        for (name, ty) in env {
            seen.entry(name).or_default().push(ty.concrete());
        }
    }
    seen.into_iter()
        .map(|(name, types)| {
            // undef contributes nothing: that path never produces a value
            let mut defined = types.iter().filter(|t| !t.is_undef());
            let ty = match defined.next() {
                None => reg.undef().concrete(),
                Some(first) if defined.all(|t| t == first) => first.clone(),
                Some(_) => reg.unknown(),
            };
            (name, ty)
        })
        .collect()
}

fn transfer(block: &CfgBlock, mut env: TypeEnv, reg: &TypeRegistry) -> Vec<(CfgBlockId, TypeEnv)> {
    for stmt in block.body() {
        assign(stmt, &mut env, reg);
    }
    match block.terminator() {
        Stmt::Invoke { stmt, normal, exc } => {
            let mut exc_env = env.clone();
            if let Some(target) = stmt.target() {
                exc_env.remove(target);
            }
            assign(stmt, &mut env, reg);
            vec![(*normal, env), (*exc, exc_env)]
        }
        term => term.successors().into_iter().map(|s| (s, env.clone())).collect(),
    }
}

fn assign(stmt: &Stmt, env: &mut TypeEnv, reg: &TypeRegistry) {
    if let Stmt::Assign { target, value } = stmt {
        let ty = expr_type(value, env, reg);
        env.insert(target.clone(), ty);
    }
}

/// Static type of an expression under `env`
pub fn expr_type(expr: &Expr, env: &TypeEnv, reg: &TypeRegistry) -> TypeRef {
    let ty = |e: &Expr| expr_type(e, env, reg);
    match expr {
        Expr::Name(n) => env.get(n).cloned().unwrap_or_else(|| reg.undef()),
        Expr::Int(_) => reg.int(),
        Expr::Float(_) => reg.float(),
        Expr::Bool(_) => reg.bool_(),
        Expr::None => reg.none(),
        Expr::Str(_) => reg.str_constant(),
        Expr::Tuple(elts) => reg.tuple(elts.iter().map(ty).collect()),
        Expr::Attribute { value, attr } => ty(value).getattr_type(reg, attr),
        Expr::Call { func, args } => {
            let args: Vec<TypeRef> = args.iter().map(ty).collect();
            ty(func).call_type(reg, &args)
        }
        Expr::CallAttr { value, attr, args } => {
            let args: Vec<TypeRef> = args.iter().map(ty).collect();
            ty(value).callattr_type(reg, attr, &args)
        }
        Expr::BinOp { op, left, right } => ty(left).binexp_type(reg, *op, &ty(right)),
        Expr::Compare { op, left, right } => ty(left).compare_type(reg, *op, &ty(right)),
        Expr::UnaryOp { op, operand } => ty(operand).unaryop_type(reg, *op),
        Expr::Subscript { value, index } => {
            let constant = match **index {
                Expr::Int(i) => Some(i),
                _ => None,
            };
            ty(value).getitem_type(reg, &ty(index), constant)
        }
        Expr::GetIter(_) | Expr::LandingPad | Expr::Global(_) => reg.unknown(),
        Expr::HasNext(_) => reg.bool_(),
        Expr::Nonzero(value) => ty(value).nonzero_type(reg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BinOpKind, CfgBuilder};

    /// i = 0; while c: i = i <op> step; return i
    fn counting_loop(op: BinOpKind, step: Expr) -> (Cfg, CfgBlockId) {
        let mut b = CfgBuilder::new("f", &["c"]);
        let entry = b.add_block();
        let header = b.add_block();
        let body = b.add_block();
        let exit = b.add_block();
        b.push(entry, Stmt::assign("i", Expr::Int(0)));
        b.push(entry, Stmt::Jump(header));
        b.push(header, Stmt::Branch { test: Expr::name("c"), then_block: body, else_block: exit });
        b.push(body, Stmt::assign("i", Expr::binop(op, Expr::name("i"), step)));
        b.push(body, Stmt::Jump(header));
        b.push(exit, Stmt::Return(Some(Expr::name("i"))));
        (b.finish(), header)
    }

    #[test]
    fn test_bitwise_loop_counter_stays_int() {
        let reg = TypeRegistry::new();
        let (cfg, header) = counting_loop(BinOpKind::BitXor, Expr::Int(1));
        let types = PropagatingTypeAnalysis::new(&cfg, &reg, &[reg.unknown()]);
        assert_eq!(types.type_at_block_start("i", header), reg.int());
        assert_eq!(types.type_at_block_start("c", header), reg.unknown());
    }

    #[test]
    fn test_adding_loop_counter_widens() {
        let reg = TypeRegistry::new();
        let (cfg, header) = counting_loop(BinOpKind::Add, Expr::Int(1));
        let types = PropagatingTypeAnalysis::new(&cfg, &reg, &[reg.unknown()]);
        assert_eq!(types.type_at_block_start("i", header), reg.unknown());
    }

    #[test]
    fn test_disagreeing_types_widen_to_unknown() {
        let reg = TypeRegistry::new();
        let (cfg, header) = counting_loop(BinOpKind::Add, Expr::Float(0.5));
        let types = PropagatingTypeAnalysis::new(&cfg, &reg, &[reg.unknown()]);
        assert_eq!(types.type_at_block_start("i", header), reg.unknown());
    }

    #[test]
    fn test_tuples_are_concrete_at_block_start() {
        let reg = TypeRegistry::new();
        let mut b = CfgBuilder::new("f", &[]);
        let entry = b.add_block();
        let next = b.add_block();
        b.push(entry, Stmt::assign("t", Expr::Tuple(vec![Expr::Int(1), Expr::Int(2)])));
        b.push(entry, Stmt::Jump(next));
        b.push(next, Stmt::Return(Some(Expr::name("t"))));
        let cfg = b.finish();
        let types = PropagatingTypeAnalysis::new(&cfg, &reg, &[]);
        assert_eq!(types.type_at_block_start("t", next), reg.boxed_tuple());
    }

    #[test]
    fn test_osr_seed_merges_with_back_edge() {
        let reg = TypeRegistry::new();
        let (cfg, header) = counting_loop(BinOpKind::BitXor, Expr::Int(1));
        let args = vec![(Name::from("c"), reg.unknown()), (Name::from("i"), reg.int())];
        let types = PropagatingTypeAnalysis::for_osr(&cfg, &reg, header, &args);
        assert_eq!(types.type_at_block_start("i", header), reg.int());
        assert!(!types.is_reached(cfg.entry()));
    }
}
