//! Input control-flow graph
//!
//! The IR emission driver consumes a CFG of basic blocks holding statement
//! nodes. `CfgBuilder::finish` computes edges, gives the entry block no
//! predecessors, and breaks critical edges so that every edge into a block
//! with several predecessors leaves a block with a single successor.

pub mod node;

use std::sync::Arc;

use rustc_hash::FxHashSet;

pub use node::{BinOpKind, CompareOp, Expr, Stmt, UnaryOpKind};

/// Variable name
pub type Name = Arc<str>;

/// Basic block identifier in the input CFG
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CfgBlockId(pub u32);

impl CfgBlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for CfgBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block{}", self.0)
    }
}

/// A basic block in the CFG
#[derive(Debug, Clone)]
pub struct CfgBlock {
    pub id: CfgBlockId,
    pub stmts: Vec<Stmt>,
    /// Distinct predecessors, ascending
    pub preds: Vec<CfgBlockId>,
    /// Distinct successors in edge order
    pub succs: Vec<CfgBlockId>,
}

impl CfgBlock {
    /// The block's terminating statement
    pub fn terminator(&self) -> &Stmt {
        match self.stmts.last() {
            Some(stmt) => stmt,
            None => crate::ice!("{} has no statements", self.id),
        }
    }

    /// Statements before the terminator
    pub fn body(&self) -> &[Stmt] {
        &self.stmts[..self.stmts.len().saturating_sub(1)]
    }
}

/// A finished control-flow graph
#[derive(Debug, Clone)]
pub struct Cfg {
    pub name: String,
    pub params: Vec<Name>,
    /// Module-level code: no reoptimization prologue
    pub is_module: bool,
    pub blocks: Vec<CfgBlock>,
    backedges: FxHashSet<(CfgBlockId, CfgBlockId)>,
}

impl Cfg {
    pub fn entry(&self) -> CfgBlockId {
        CfgBlockId(0)
    }

    pub fn block(&self, id: CfgBlockId) -> &CfgBlock {
        &self.blocks[id.index()]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = CfgBlockId> + '_ {
        self.blocks.iter().map(|b| b.id)
    }

    pub fn preds(&self, id: CfgBlockId) -> &[CfgBlockId] {
        &self.block(id).preds
    }

    pub fn succs(&self, id: CfgBlockId) -> &[CfgBlockId] {
        &self.block(id).succs
    }

    /// Whether `from -> to` closes a loop (found by DFS from the entry)
    pub fn is_backedge(&self, from: CfgBlockId, to: CfgBlockId) -> bool {
        self.backedges.contains(&(from, to))
    }

    /// Whether the block is a loop header
    pub fn is_backedge_target(&self, id: CfgBlockId) -> bool {
        self.preds(id).iter().any(|p| self.is_backedge(*p, id))
    }

    /// Every back-edge, sorted
    pub fn backedges(&self) -> Vec<(CfgBlockId, CfgBlockId)> {
        let mut edges: Vec<_> = self.backedges.iter().copied().collect();
        edges.sort();
        edges
    }
}

/// Incrementally builds a `Cfg`
pub struct CfgBuilder {
    name: String,
    params: Vec<Name>,
    is_module: bool,
    blocks: Vec<Vec<Stmt>>,
}

impl CfgBuilder {
    /// A function taking `params`
    pub fn new(name: &str, params: &[&str]) -> Self {
        CfgBuilder {
            name: name.to_string(),
            params: params.iter().map(|p| Name::from(*p)).collect(),
            is_module: false,
            blocks: Vec::new(),
        }
    }

    /// Module-level code
    pub fn module(name: &str) -> Self {
        CfgBuilder { is_module: true, ..Self::new(name, &[]) }
    }

    pub fn add_block(&mut self) -> CfgBlockId {
        self.blocks.push(Vec::new());
        CfgBlockId(self.blocks.len() as u32 - 1)
    }

    pub fn push(&mut self, block: CfgBlockId, stmt: Stmt) {
        self.blocks[block.index()].push(stmt);
    }

    pub fn finish(self) -> Cfg {
        let CfgBuilder { name, params, is_module, mut blocks } = self;
        if blocks.is_empty() {
            crate::ice!("cfg for {} has no blocks", name);
        }
        for (i, stmts) in blocks.iter().enumerate() {
            match stmts.split_last() {
                Some((last, body)) if last.is_terminator() => {
                    if body.iter().any(|s| s.is_terminator()) {
                        crate::ice!("block{} of {} has a terminator before its end", i, name);
                    }
                }
                _ => crate::ice!("block{} of {} does not end in a terminator", i, name),
            }
        }

        if blocks.iter().flat_map(|s| s.last().map(|t| t.successors()).unwrap_or_default()).any(|t| t.0 == 0) {
            // the entry may not be a jump target; prepend a fresh one
            for stmts in &mut blocks {
                if let Some(term) = stmts.last_mut() {
                    term.map_targets(&mut |b| CfgBlockId(b.0 + 1));
                }
            }
            blocks.insert(0, vec![Stmt::Jump(CfgBlockId(1))]);
        }

        let preds = compute_preds(&blocks);
        let mut breakers = 0;
        for from in 0..blocks.len() {
            let succs = distinct_succs(&blocks[from]);
            if succs.len() < 2 {
                continue;
            }
            for to in succs {
                if preds[to.index()].len() < 2 {
                    continue;
                }
                let mid = CfgBlockId(blocks.len() as u32);
                blocks.push(vec![Stmt::Jump(to)]);
                if let Some(term) = blocks[from].last_mut() {
                    term.map_targets(&mut |b| if b == to { mid } else { b });
                }
                breakers += 1;
            }
        }

        let preds = compute_preds(&blocks);
        let blocks: Vec<CfgBlock> = blocks
            .into_iter()
            .enumerate()
            .map(|(i, stmts)| {
                let succs = distinct_succs(&stmts);
                CfgBlock { id: CfgBlockId(i as u32), stmts, preds: preds[i].clone(), succs }
            })
            .collect();
        let backedges = find_backedges(&blocks);
        tracing::trace!(function = %name, blocks = blocks.len(), breakers, "built cfg");
        Cfg { name, params, is_module, blocks, backedges }
    }
}

fn distinct_succs(stmts: &[Stmt]) -> Vec<CfgBlockId> {
    let mut succs = Vec::new();
    for s in stmts.last().map(|t| t.successors()).unwrap_or_default() {
        if !succs.contains(&s) {
            succs.push(s);
        }
    }
    succs
}

fn compute_preds(blocks: &[Vec<Stmt>]) -> Vec<Vec<CfgBlockId>> {
    let mut preds: Vec<Vec<CfgBlockId>> = vec![Vec::new(); blocks.len()];
    for (i, stmts) in blocks.iter().enumerate() {
        for s in distinct_succs(stmts) {
            if s.index() >= blocks.len() {
                crate::ice!("block{} jumps to missing {}", i, s);
            }
            preds[s.index()].push(CfgBlockId(i as u32));
        }
    }
    preds
}

/// Edges into a block still on the DFS stack
fn find_backedges(blocks: &[CfgBlock]) -> FxHashSet<(CfgBlockId, CfgBlockId)> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        OnStack,
        Done,
    }
    let mut marks = vec![Mark::New; blocks.len()];
    let mut backedges = FxHashSet::default();
    // (block, index of next successor to visit)
    let mut stack = vec![(CfgBlockId(0), 0usize)];
    marks[0] = Mark::OnStack;
    while let Some((b, next)) = stack.pop() {
        let succs = &blocks[b.index()].succs;
        if next == succs.len() {
            marks[b.index()] = Mark::Done;
            continue;
        }
        stack.push((b, next + 1));
        let s = succs[next];
        match marks[s.index()] {
            Mark::OnStack => {
                backedges.insert((b, s));
            }
            Mark::New => {
                marks[s.index()] = Mark::OnStack;
                stack.push((s, 0));
            }
            Mark::Done => {}
        }
    }
    backedges
}

#[cfg(test)]
mod tests {
    use super::*;

    /// entry -> header; header -> body | exit; body -> header
    fn simple_loop() -> Cfg {
        let mut b = CfgBuilder::new("loop", &["n"]);
        let entry = b.add_block();
        let header = b.add_block();
        let body = b.add_block();
        let exit = b.add_block();
        b.push(entry, Stmt::Jump(header));
        b.push(header, Stmt::Branch { test: Expr::name("n"), then_block: body, else_block: exit });
        b.push(body, Stmt::Jump(header));
        b.push(exit, Stmt::Return(None));
        b.finish()
    }

    #[test]
    fn test_edges() {
        let cfg = simple_loop();
        assert_eq!(cfg.preds(CfgBlockId(1)), &[CfgBlockId(0), CfgBlockId(2)]);
        assert_eq!(cfg.succs(CfgBlockId(1)), &[CfgBlockId(2), CfgBlockId(3)]);
        assert!(cfg.preds(cfg.entry()).is_empty());
    }

    #[test]
    fn test_backedge_detection() {
        let cfg = simple_loop();
        assert_eq!(cfg.backedges(), vec![(CfgBlockId(2), CfgBlockId(1))]);
        assert!(cfg.is_backedge_target(CfgBlockId(1)));
        assert!(!cfg.is_backedge_target(CfgBlockId(3)));
    }

    #[test]
    fn test_critical_edges_broken() {
        // entry branches to join and to mid; mid jumps to join
        let mut b = CfgBuilder::new("crit", &["c"]);
        let entry = b.add_block();
        let mid = b.add_block();
        let join = b.add_block();
        b.push(entry, Stmt::Branch { test: Expr::name("c"), then_block: join, else_block: mid });
        b.push(mid, Stmt::Jump(join));
        b.push(join, Stmt::Return(None));
        let cfg = b.finish();
        assert_eq!(cfg.num_blocks(), 4);
        let breaker = CfgBlockId(3);
        assert_eq!(cfg.succs(entry), &[breaker, mid]);
        assert_eq!(cfg.block(breaker).stmts, vec![Stmt::Jump(join)]);
        assert_eq!(cfg.preds(join), &[mid, breaker]);
    }

    #[test]
    fn test_entry_target_gets_fresh_entry() {
        let mut b = CfgBuilder::new("spin", &[]);
        let only = b.add_block();
        b.push(only, Stmt::Jump(only));
        let cfg = b.finish();
        assert_eq!(cfg.num_blocks(), 2);
        assert!(cfg.preds(cfg.entry()).is_empty());
        assert!(cfg.is_backedge_target(CfgBlockId(1)));
    }

    #[test]
    fn test_breaker_is_not_a_loop_header() {
        // the breaker on the loop-exit edge has a high index but no back-edge
        let mut b = CfgBuilder::new("exit_edge", &["c"]);
        let entry = b.add_block();
        let header = b.add_block();
        let exit = b.add_block();
        b.push(entry, Stmt::Branch { test: Expr::name("c"), then_block: header, else_block: exit });
        b.push(header, Stmt::Branch { test: Expr::name("c"), then_block: header, else_block: exit });
        b.push(exit, Stmt::Return(None));
        let cfg = b.finish();
        assert!(cfg.is_backedge_target(header));
        assert!(!cfg.is_backedge_target(exit));
        for (_, to) in cfg.backedges() {
            assert_eq!(to, header);
        }
    }

    #[test]
    #[should_panic(expected = "does not end in a terminator")]
    fn test_missing_terminator_is_fatal() {
        let mut b = CfgBuilder::new("bad", &[]);
        let entry = b.add_block();
        b.push(entry, Stmt::Expr(Expr::None));
        b.finish();
    }
}
