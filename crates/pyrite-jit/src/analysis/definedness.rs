//! Forward definedness of CFG variable names

use rustc_hash::FxHashMap;

use super::reverse_postorder;
use crate::cfg::{Cfg, CfgBlock, CfgBlockId, Name, Stmt};

/// Whether a name holds a value at a program point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionStatus {
    Defined,
    /// Defined along some paths only
    PotentiallyDefined,
    Undefined,
}

impl DefinitionStatus {
    fn merge(self, other: DefinitionStatus) -> DefinitionStatus {
        if self == other {
            self
        } else {
            DefinitionStatus::PotentiallyDefined
        }
    }
}

/// Names absent from the map are undefined
type DefState = FxHashMap<Name, DefinitionStatus>;

pub struct DefinednessAnalysis {
    /// `None` for blocks never reached from the entry
    at_start: Vec<Option<DefState>>,
}

impl DefinednessAnalysis {
    pub fn new(cfg: &Cfg) -> Self {
        let n = cfg.num_blocks();
        let rpo = reverse_postorder(cfg, cfg.entry());
        let mut at_start: Vec<Option<DefState>> = vec![None; n];
        let mut entry_state = DefState::default();
        for p in &cfg.params {
            entry_state.insert(p.clone(), DefinitionStatus::Defined);
        }
        at_start[cfg.entry().index()] = Some(entry_state);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let merged = merge_preds(cfg, b, &at_start);
                if merged.is_some() && merged != at_start[b.index()] {
                    at_start[b.index()] = merged;
                    changed = true;
                }
            }
        }
        DefinednessAnalysis { at_start }
    }

    pub fn status_at_start(&self, name: &str, block: CfgBlockId) -> DefinitionStatus {
        self.at_start[block.index()]
            .as_ref()
            .and_then(|s| s.get(name).copied())
            .unwrap_or(DefinitionStatus::Undefined)
    }

    pub fn is_reached(&self, block: CfgBlockId) -> bool {
        self.at_start[block.index()].is_some()
    }
}

/// Merge over the predecessors reached so far
fn merge_preds(cfg: &Cfg, b: CfgBlockId, at_start: &[Option<DefState>]) -> Option<DefState> {
    let mut incoming: Vec<DefState> = Vec::new();
    for &p in cfg.preds(b) {
        let Some(state) = &at_start[p.index()] else { continue };
        if let Some((_, out)) = transfer(cfg.block(p), state.clone()).into_iter().find(|(s, _)| *s == b) {
            incoming.push(out);
        }
    }
    let (first, rest) = incoming.split_first()?;
    let mut merged = first.clone();
    for state in rest {
        for (name, status) in merged.iter_mut() {
            let other = state.get(name).copied().unwrap_or(DefinitionStatus::Undefined);
            *status = status.merge(other);
        }
        for (name, status) in state {
            merged.entry(name.clone()).or_insert(status.merge(DefinitionStatus::Undefined));
        }
    }
    Some(merged)
}

/// Out-state along each successor edge
fn transfer(block: &CfgBlock, mut state: DefState) -> Vec<(CfgBlockId, DefState)> {
    for stmt in block.body() {
        if let Some(target) = stmt.target() {
            state.insert(target.clone(), DefinitionStatus::Defined);
        }
    }
    match block.terminator() {
        Stmt::Invoke { stmt, normal, exc } => {
            let mut exc_state = state.clone();
            if let Some(target) = stmt.target() {
                // the exceptional edge leaves before the target is bound
                exc_state.remove(target);
                state.insert(target.clone(), DefinitionStatus::Defined);
            }
            vec![(*normal, state), (*exc, exc_state)]
        }
        term => term.successors().into_iter().map(|s| (s, state.clone())).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{CfgBuilder, Expr};

    #[test]
    fn test_one_sided_assignment_is_potentially_defined() {
        // if c: x = 1; return x
        let mut b = CfgBuilder::new("f", &["c"]);
        let entry = b.add_block();
        let then = b.add_block();
        let other = b.add_block();
        let join = b.add_block();
        b.push(entry, Stmt::Branch { test: Expr::name("c"), then_block: then, else_block: other });
        b.push(then, Stmt::assign("x", Expr::Int(1)));
        b.push(then, Stmt::Jump(join));
        b.push(other, Stmt::Jump(join));
        b.push(join, Stmt::Return(Some(Expr::name("x"))));
        let cfg = b.finish();
        let defs = DefinednessAnalysis::new(&cfg);
        assert_eq!(defs.status_at_start("x", join), DefinitionStatus::PotentiallyDefined);
        assert_eq!(defs.status_at_start("c", join), DefinitionStatus::Defined);
        assert_eq!(defs.status_at_start("x", then), DefinitionStatus::Undefined);
    }

    #[test]
    fn test_loop_assignment_reaches_header_potentially() {
        // while c: x = 1
        let mut b = CfgBuilder::new("f", &["c"]);
        let entry = b.add_block();
        let header = b.add_block();
        let body = b.add_block();
        let exit = b.add_block();
        b.push(entry, Stmt::Jump(header));
        b.push(header, Stmt::Branch { test: Expr::name("c"), then_block: body, else_block: exit });
        b.push(body, Stmt::assign("x", Expr::Int(1)));
        b.push(body, Stmt::Jump(header));
        b.push(exit, Stmt::Return(None));
        let cfg = b.finish();
        let defs = DefinednessAnalysis::new(&cfg);
        assert_eq!(defs.status_at_start("x", header), DefinitionStatus::PotentiallyDefined);
        assert_eq!(defs.status_at_start("x", exit), DefinitionStatus::PotentiallyDefined);
    }

    #[test]
    fn test_invoke_target_undefined_on_exception_edge() {
        let mut b = CfgBuilder::new("f", &[]);
        let entry = b.add_block();
        let normal = b.add_block();
        let exc = b.add_block();
        b.push(entry, Stmt::invoke(Stmt::assign("x", Expr::call(Expr::Global("g".into()), vec![])), normal, exc));
        b.push(normal, Stmt::Return(Some(Expr::name("x"))));
        b.push(exc, Stmt::Return(None));
        let cfg = b.finish();
        let defs = DefinednessAnalysis::new(&cfg);
        assert_eq!(defs.status_at_start("x", normal), DefinitionStatus::Defined);
        assert_eq!(defs.status_at_start("x", exc), DefinitionStatus::Undefined);
    }

    #[test]
    fn test_unreached_block_reports_undefined() {
        let mut b = CfgBuilder::new("f", &["a"]);
        let entry = b.add_block();
        let dead = b.add_block();
        b.push(entry, Stmt::Return(None));
        b.push(dead, Stmt::Return(Some(Expr::name("a"))));
        let cfg = b.finish();
        let defs = DefinednessAnalysis::new(&cfg);
        assert!(!defs.is_reached(dead));
        assert_eq!(defs.status_at_start("a", dead), DefinitionStatus::Undefined);
    }
}
