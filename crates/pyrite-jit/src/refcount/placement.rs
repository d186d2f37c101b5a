//! Placing scheduled updates as refcount pseudo-instructions
//!
//! An update on an edge lands at the start of the destination when that
//! has a single predecessor, else at the end of the source when that has a
//! single successor, else in a fresh block splitting the edge.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use super::dataflow::{Site, Update};
use super::RefcountStats;
use crate::ir::{BlockId, Instr, IrFunction, Terminator, Value};

/// Position inside one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    /// After the phis and any landing pad
    Start,
    /// After the instruction at this index
    After(usize),
    /// Before the terminator
    End,
}

pub(super) fn insert_updates(func: &mut IrFunction, updates: Vec<Update>) -> RefcountStats {
    let mut net: BTreeMap<(Site, Value), i64> = BTreeMap::new();
    for u in updates {
        *net.entry((u.site, u.value)).or_insert(0) += u.delta;
    }

    let preds = func.predecessors();
    let mut breakers: FxHashMap<(BlockId, BlockId), BlockId> = FxHashMap::default();
    let mut by_block: BTreeMap<BlockId, Vec<(Slot, Value, i64)>> = BTreeMap::new();
    for ((site, value), delta) in net {
        if delta == 0 {
            continue;
        }
        let (block, slot) = match site {
            Site::After(b, i) => (b, Slot::After(i)),
            Site::BlockStart(b) => (b, Slot::Start),
            Site::Edge(from, to) => edge_slot(func, &preds, &mut breakers, from, to),
        };
        by_block.entry(block).or_default().push((slot, value, delta));
    }

    let mut stats = RefcountStats { broken_edges: breakers.len(), ..RefcountStats::default() };
    for (b, mut ops) in by_block {
        // increfs first so a shared object is never freed in between
        ops.sort_by_key(|(slot, value, delta)| (*slot, *delta < 0, *value));
        let pseudo: Vec<(Slot, Instr)> = ops
            .into_iter()
            .map(|(slot, value, delta)| {
                let nullable = func.ref_info(value).is_some_and(|r| r.nullable);
                let amount = delta.unsigned_abs() as u32;
                let instr = if delta > 0 {
                    stats.increfs += 1;
                    Instr::Incref { value, amount, nullable }
                } else {
                    stats.decrefs += 1;
                    Instr::Decref { value, amount, nullable }
                };
                (slot, instr)
            })
            .collect();
        splice(func, b, pseudo);
    }
    stats
}

fn edge_slot(
    func: &mut IrFunction,
    preds: &[Vec<BlockId>],
    breakers: &mut FxHashMap<(BlockId, BlockId), BlockId>,
    from: BlockId,
    to: BlockId,
) -> (BlockId, Slot) {
    if let Some(mid) = breakers.get(&(from, to)) {
        return (*mid, Slot::Start);
    }
    if preds[to.index()].len() == 1 {
        return (to, Slot::Start);
    }
    let mut succs = func.successors(from);
    succs.dedup();
    let plain = !matches!(func.block(from).terminator, Terminator::Invoke { .. });
    if plain && succs.len() == 1 {
        return (from, Slot::End);
    }
    let mid = func.break_edge(from, to);
    tracing::trace!(function = %func.name, %from, %to, %mid, "split critical edge");
    breakers.insert((from, to), mid);
    (mid, Slot::Start)
}

/// Merge `pseudo` into the instructions of `b`
fn splice(func: &mut IrFunction, b: BlockId, pseudo: Vec<(Slot, Instr)>) {
    let mut slots: BTreeMap<Slot, Vec<Instr>> = BTreeMap::new();
    for (slot, instr) in pseudo {
        slots.entry(slot).or_default().push(instr);
    }
    let old = std::mem::take(&mut func.block_mut(b).instrs);
    let head = old.iter().take_while(|i| i.is_phi() || matches!(i, Instr::LandingPad { .. })).count();
    let mut out = Vec::with_capacity(old.len() + slots.values().map(Vec::len).sum::<usize>());
    for (i, instr) in old.into_iter().enumerate() {
        if i == head {
            out.extend(slots.remove(&Slot::Start).unwrap_or_default());
        }
        out.push(instr);
        out.extend(slots.remove(&Slot::After(i)).unwrap_or_default());
    }
    out.extend(slots.remove(&Slot::Start).unwrap_or_default());
    out.extend(slots.remove(&Slot::End).unwrap_or_default());
    if let Some(slot) = slots.keys().next() {
        crate::ice!("refcount update placed at missing position {:?} of {} in {}", slot, b, func.name);
    }
    func.block_mut(b).instrs = out;
}
