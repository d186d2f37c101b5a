//! Refcount insertion
//!
//! Runs over emitted IR in which every heap-object value carries an
//! ownership tag. A backward dataflow decides how many references the
//! function must hold for each value at each point; the differences become
//! `Incref`/`Decref` pseudo-instructions, placed on split edges where a
//! branch needs them on one side only. A second stage expands the
//! pseudo-instructions into plain loads, stores and a deallocation call.

mod dataflow;
mod materialize;
mod placement;
mod verify;

use crate::config::JitConfig;
use crate::ir::IrFunction;

pub use verify::verify_ref_tags;

/// What refcount insertion added to a function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefcountStats {
    pub increfs: usize,
    pub decrefs: usize,
    /// Edges split to hold updates for one side of a branch
    pub broken_edges: usize,
    /// Blocks added by null checks and deallocation paths
    pub expansion_blocks: usize,
}

/// Insert and materialize all refcount operations in `func`
pub fn add_refcounts(func: &mut IrFunction, config: &JitConfig) -> RefcountStats {
    if config.verify_refcount_tags {
        verify_ref_tags(func);
    }
    let mut stats = insert_refcount_ops(func, config);
    stats.expansion_blocks = materialize::materialize(func);
    tracing::debug!(
        function = %func.name,
        increfs = stats.increfs,
        decrefs = stats.decrefs,
        broken_edges = stats.broken_edges,
        blocks = func.blocks.len(),
        "inserted refcounts"
    );
    stats
}

/// Place refcount updates as pseudo-instructions without expanding them
pub fn insert_refcount_ops(func: &mut IrFunction, config: &JitConfig) -> RefcountStats {
    let updates = dataflow::RefcountAnalysis::new(func).run(config);
    placement::insert_updates(func, updates)
}
