//! Analyses the emission driver consults
//!
//! The driver is written against three narrow interfaces: per-block types
//! (`TypeAnalysis`), which names need phis (`PhiAnalysis`) and the shape of
//! the function's scope (`ScopeInfo`). The concrete analyses here compute
//! them from a `Cfg`; tests substitute map-backed stubs through the same
//! traits.

pub mod definedness;
pub mod liveness;
pub mod phis;
pub mod types;

use crate::cfg::{Cfg, CfgBlockId, Name};
use crate::compvars::TypeRef;

pub use definedness::{DefinednessAnalysis, DefinitionStatus};
pub use liveness::LivenessAnalysis;
pub use phis::CfgPhiAnalysis;
pub use types::PropagatingTypeAnalysis;

/// Static types at block boundaries
pub trait TypeAnalysis {
    /// Concrete type `name` holds on entry to `block`
    fn type_at_block_start(&self, name: &str, block: CfgBlockId) -> TypeRef;
}

/// Which names are carried into a block
pub trait PhiAnalysis {
    /// Names that are live and possibly defined on entry to `block`, sorted
    fn required_at_start(&self, block: CfgBlockId) -> Vec<Name>;

    /// Whether `name` is defined along some paths into `block` but not all
    fn is_potentially_undefined_at(&self, name: &str, block: CfgBlockId) -> bool;
}

/// Facts about the function's scope that shape its calling convention
pub trait ScopeInfo {
    /// The function receives a closure cell pointer
    fn takes_closure(&self) -> bool;

    /// The function is a generator and receives its state pointer
    fn is_generator(&self) -> bool;
}

/// A `ScopeInfo` with fixed answers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionScope {
    pub takes_closure: bool,
    pub is_generator: bool,
}

impl ScopeInfo for FunctionScope {
    fn takes_closure(&self) -> bool {
        self.takes_closure
    }

    fn is_generator(&self) -> bool {
        self.is_generator
    }
}

/// Blocks reachable from `start` along forward edges
pub fn reachable_from(cfg: &Cfg, start: CfgBlockId) -> Vec<bool> {
    let mut seen = vec![false; cfg.num_blocks()];
    let mut stack = vec![start];
    seen[start.index()] = true;
    while let Some(b) = stack.pop() {
        for &s in cfg.succs(b) {
            if !seen[s.index()] {
                seen[s.index()] = true;
                stack.push(s);
            }
        }
    }
    seen
}

/// Reverse postorder from `start`; unreachable blocks are omitted
pub(crate) fn reverse_postorder(cfg: &Cfg, start: CfgBlockId) -> Vec<CfgBlockId> {
    let mut visited = vec![false; cfg.num_blocks()];
    let mut postorder = Vec::with_capacity(cfg.num_blocks());
    let mut stack = vec![(start, 0usize)];
    visited[start.index()] = true;
    while let Some((b, next)) = stack.pop() {
        let succs = cfg.succs(b);
        if next == succs.len() {
            postorder.push(b);
            continue;
        }
        stack.push((b, next + 1));
        let s = succs[next];
        if !visited[s.index()] {
            visited[s.index()] = true;
            stack.push((s, 0));
        }
    }
    postorder.reverse();
    postorder
}
