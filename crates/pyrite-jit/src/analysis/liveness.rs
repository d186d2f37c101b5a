//! Backward liveness of CFG variable names
//!
//! `live_in(B) = reads before defs in B ∪ (live_out(B) - defs in B)`,
//! iterated to a fixed point. An invoke binds its target only along the
//! normal edge, so the target's liveness on the exception edge flows
//! through the invoke untouched.

use rustc_hash::FxHashSet;

use crate::cfg::{Cfg, CfgBlock, CfgBlockId, Name, Stmt};

pub type LiveSet = FxHashSet<Name>;

pub struct LivenessAnalysis {
    live_in: Vec<LiveSet>,
}

impl LivenessAnalysis {
    pub fn new(cfg: &Cfg) -> Self {
        let n = cfg.num_blocks();
        let mut live_in: Vec<LiveSet> = vec![LiveSet::default(); n];
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            let mut changed = false;
            // reverse index order approximates postorder for most CFGs
            for block in cfg.blocks.iter().rev() {
                let new_in = transfer(block, &live_in);
                if new_in != live_in[block.id.index()] {
                    live_in[block.id.index()] = new_in;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        tracing::trace!(function = %cfg.name, iterations, "liveness converged");
        LivenessAnalysis { live_in }
    }

    pub fn is_live_at_start(&self, name: &str, block: CfgBlockId) -> bool {
        self.live_in[block.index()].contains(name)
    }

    /// Live names on entry to `block`, sorted
    pub fn live_at_start(&self, block: CfgBlockId) -> Vec<Name> {
        let mut names: Vec<Name> = self.live_in[block.index()].iter().cloned().collect();
        names.sort();
        names
    }
}

fn transfer(block: &CfgBlock, live_in: &[LiveSet]) -> LiveSet {
    let mut live = LiveSet::default();
    match block.terminator() {
        Stmt::Invoke { stmt, normal, exc } => {
            live.extend(live_in[normal.index()].iter().cloned());
            if let Some(target) = stmt.target() {
                live.remove(target);
            }
            live.extend(live_in[exc.index()].iter().cloned());
            live.extend(stmt.reads());
        }
        term => {
            for s in &block.succs {
                live.extend(live_in[s.index()].iter().cloned());
            }
            live.extend(term.reads());
        }
    }
    for stmt in block.body().iter().rev() {
        if let Some(target) = stmt.target() {
            live.remove(target);
        }
        live.extend(stmt.reads());
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BinOpKind, CfgBuilder, Expr};

    fn names(v: &[&str]) -> Vec<Name> {
        v.iter().map(|s| Name::from(*s)).collect()
    }

    #[test]
    fn test_loop_carried_names_are_live_at_header() {
        // i = 0; while n: i = i + 1; return i
        let mut b = CfgBuilder::new("f", &["n"]);
        let entry = b.add_block();
        let header = b.add_block();
        let body = b.add_block();
        let exit = b.add_block();
        b.push(entry, Stmt::assign("i", Expr::Int(0)));
        b.push(entry, Stmt::Jump(header));
        b.push(header, Stmt::Branch { test: Expr::name("n"), then_block: body, else_block: exit });
        b.push(body, Stmt::assign("i", Expr::binop(BinOpKind::Add, Expr::name("i"), Expr::Int(1))));
        b.push(body, Stmt::Jump(header));
        b.push(exit, Stmt::Return(Some(Expr::name("i"))));
        let cfg = b.finish();
        let live = LivenessAnalysis::new(&cfg);
        assert_eq!(live.live_at_start(header), names(&["i", "n"]));
        assert_eq!(live.live_at_start(entry), names(&["n"]));
        assert_eq!(live.live_at_start(exit), names(&["i"]));
    }

    #[test]
    fn test_invoke_target_stays_live_on_exception_edge() {
        // x = 1; invoke x = f() -> normal / exc; exc returns x
        let mut b = CfgBuilder::new("f", &[]);
        let entry = b.add_block();
        let call = b.add_block();
        let normal = b.add_block();
        let exc = b.add_block();
        b.push(entry, Stmt::assign("x", Expr::Int(1)));
        b.push(entry, Stmt::Jump(call));
        b.push(call, Stmt::invoke(Stmt::assign("x", Expr::call(Expr::Global("f".into()), vec![])), normal, exc));
        b.push(normal, Stmt::Return(Some(Expr::name("x"))));
        b.push(exc, Stmt::Return(Some(Expr::name("x"))));
        let cfg = b.finish();
        let live = LivenessAnalysis::new(&cfg);
        assert!(live.is_live_at_start("x", call));
        assert!(!live.is_live_at_start("x", entry));
    }
}
