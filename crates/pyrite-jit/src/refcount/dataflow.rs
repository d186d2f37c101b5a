//! Backward refcount dataflow
//!
//! For every heap-object value the analysis tracks how many references the
//! function must hold at each program point. Walking a block backwards, a
//! consuming use adds one; the last use of an owned value that does not
//! consume it schedules a decref right after it. At a definition the count
//! is compared with what the definition hands over (one reference for an
//! owned value, none for a borrowed one) and the difference becomes an
//! incref or decref. At the end of a block every successor edge is
//! reconciled against the minimum any successor requires.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::config::JitConfig;
use crate::ir::{BlockId, Instr, IrFunction, RefType, Terminator, Value, ValueOrigin};

/// References required per live heap value at one program point. A
/// borrowed value may be live with a requirement of zero.
pub(super) type RefState = BTreeMap<Value, u32>;

/// Where a scheduled update takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(super) enum Site {
    /// Right after instruction `index` of the block
    After(BlockId, usize),
    /// After the phis of the block
    BlockStart(BlockId),
    /// On the control-flow edge `from -> to`
    Edge(BlockId, BlockId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Update {
    pub site: Site,
    pub value: Value,
    /// Positive for increfs, negative for decrefs
    pub delta: i64,
}

pub(super) struct RefcountAnalysis<'f> {
    func: &'f IrFunction,
    preds: Vec<Vec<BlockId>>,
    /// Requirement at the start of each block, once computed
    start: Vec<Option<RefState>>,
}

/// Blocks in DFS postorder from the entry. Every block must be reachable.
fn postorder(func: &IrFunction) -> Vec<BlockId> {
    let n = func.blocks.len();
    let mut seen = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut stack = vec![(func.entry, 0usize)];
    seen[func.entry.index()] = true;
    while let Some((b, next)) = stack.pop() {
        let succs = func.successors(b);
        if next == succs.len() {
            order.push(b);
            continue;
        }
        stack.push((b, next + 1));
        let s = succs[next];
        if !seen[s.index()] {
            seen[s.index()] = true;
            stack.push((s, 0));
        }
    }
    if let Some(b) = seen.iter().position(|s| !s) {
        crate::ice!("unreachable block bb{} reached refcount insertion in {}", b, func.name);
    }
    order
}

fn distinct(blocks: Vec<BlockId>) -> Vec<BlockId> {
    let mut out: Vec<BlockId> = Vec::with_capacity(blocks.len());
    for b in blocks {
        if !out.contains(&b) {
            out.push(b);
        }
    }
    out
}

impl<'f> RefcountAnalysis<'f> {
    pub(super) fn new(func: &'f IrFunction) -> Self {
        RefcountAnalysis { func, preds: func.predecessors(), start: vec![None; func.blocks.len()] }
    }

    /// Iterate to a fixed point, then collect every update the final
    /// requirements call for
    pub(super) fn run(mut self, config: &JitConfig) -> Vec<Update> {
        let func = self.func;
        if !self.preds[func.entry.index()].is_empty() {
            crate::ice!("entry block {} of {} has predecessors", func.entry, func.name);
        }
        let order = postorder(func);
        let n = func.blocks.len();
        let mut queued = vec![false; n];
        let mut visits = vec![0usize; n];
        let mut worklist: VecDeque<BlockId> = order.iter().copied().collect();
        for b in &order {
            queued[b.index()] = true;
        }

        while let Some(b) = worklist.pop_front() {
            queued[b.index()] = false;
            visits[b.index()] += 1;
            if visits[b.index()] > config.max_dataflow_visits_per_block {
                crate::ice!(
                    "refcount dataflow did not settle at {} in {} after {} visits",
                    b,
                    func.name,
                    visits[b.index()] - 1
                );
            }
            let (start, _) = self.scan_block(b);
            if self.start[b.index()].as_ref() != Some(&start) {
                self.start[b.index()] = Some(start);
                for p in &self.preds[b.index()] {
                    if !std::mem::replace(&mut queued[p.index()], true) {
                        worklist.push_back(*p);
                    }
                }
            }
        }
        tracing::trace!(function = %func.name, blocks = n, visits = visits.iter().sum::<usize>(), "refcount fixed point");

        let mut updates = Vec::new();
        for b in &order {
            let (_, block_updates) = self.scan_block(*b);
            updates.extend(block_updates);
        }
        self.resolve_entry(&mut updates);
        updates
    }

    fn is_heap(&self, v: Value) -> bool {
        self.func.value_type(v).is_object()
    }

    fn owned(&self, v: Value) -> bool {
        match self.func.ref_info(v) {
            Some(info) => match info.ref_type {
                RefType::Owned => true,
                RefType::Borrowed => false,
                RefType::Unknown => crate::ice!("{} in {} has an undecided ref type", v, self.func.name),
            },
            None => crate::ice!("heap value {} in {} has no ref-type tag", v, self.func.name),
        }
    }

    /// Requirement at the start of `b` and the updates inside and below it
    fn scan_block(&self, b: BlockId) -> (RefState, Vec<Update>) {
        let block = self.func.block(b);
        if block.terminator.is_none() {
            crate::ice!("{} in {} is not terminated", b, self.func.name);
        }
        let mut updates = Vec::new();
        let succs = distinct(block.terminator.successors());
        let mut state = self.merge_successors(b, &succs, &block.terminator, &mut updates);

        let release: Vec<Site> = succs.iter().map(|s| Site::Edge(b, *s)).collect();
        let term = &block.terminator;
        self.record_uses(&term.operands(), &term.consumed(), &release, &mut state, &mut updates);

        let phis = block.phi_count();
        for (i, instr) in block.instrs.iter().enumerate().skip(phis).rev() {
            if instr.is_refcount_op() {
                crate::ice!("{} in {} already holds refcount operations", b, self.func.name);
            }
            let site = Site::After(b, i);
            if let Some(dest) = instr.dest() {
                self.record_def(dest, site, &mut state, &mut updates);
            }
            self.record_uses(&instr.operands(), instr.consumed(), &[site], &mut state, &mut updates);
        }
        for instr in &block.instrs[..phis] {
            if let Some(dest) = instr.dest() {
                self.record_def(dest, Site::BlockStart(b), &mut state, &mut updates);
            }
        }
        (state, updates)
    }

    /// What the edge `from -> to` needs: the start requirement of `to` plus
    /// one reference for every owned phi input flowing along the edge
    fn edge_requirement(&self, from: BlockId, to: BlockId, start: &RefState) -> RefState {
        let mut req = start.clone();
        for instr in &self.func.block(to).instrs {
            let Instr::Phi { dest, incoming } = instr else { break };
            let Some((_, v)) = incoming.iter().find(|(src, _)| *src == from) else {
                crate::ice!("phi {} in {} has no input from {}", dest, to, from)
            };
            if !self.is_heap(*v) {
                continue;
            }
            let slot = req.entry(*v).or_insert(0);
            if self.owned(*dest) {
                *slot += 1;
            }
        }
        req
    }

    fn merge_successors(
        &self,
        b: BlockId,
        succs: &[BlockId],
        term: &Terminator,
        updates: &mut Vec<Update>,
    ) -> RefState {
        let invoke_dest = term.dest().filter(|d| self.is_heap(*d));
        let normal = match term {
            Terminator::Invoke { normal, .. } => Some(*normal),
            _ => None,
        };

        let mut reqs: Vec<(BlockId, RefState)> = Vec::with_capacity(succs.len());
        for s in succs {
            // not yet computed: contributes once it is
            let Some(start) = &self.start[s.index()] else { continue };
            let mut req = self.edge_requirement(b, *s, start);
            if let Some(dest) = invoke_dest {
                let need = req.remove(&dest);
                if Some(*s) == normal {
                    let need = i64::from(need.unwrap_or(0));
                    let have = i64::from(self.owned(dest));
                    if need != have {
                        updates.push(Update { site: Site::Edge(b, *s), value: dest, delta: need - have });
                    }
                } else if need.is_some() {
                    crate::ice!("{} is live on the unwind edge {} -> {} of the invoke defining it", dest, b, s);
                }
            }
            reqs.push((*s, req));
        }

        let live: BTreeSet<Value> = reqs.iter().flat_map(|(_, r)| r.keys().copied()).collect();
        let mut state = RefState::new();
        for v in live {
            let min = reqs.iter().map(|(_, r)| r.get(&v).copied().unwrap_or(0)).min().unwrap_or(0);
            // an owned value still live somewhere keeps its own reference
            let end = if self.owned(v) { min.max(1) } else { min };
            for (s, r) in &reqs {
                let want = r.get(&v).copied().unwrap_or(0);
                if want != end {
                    updates.push(Update { site: Site::Edge(b, *s), value: v, delta: i64::from(want) - i64::from(end) });
                }
            }
            state.insert(v, end);
        }
        state
    }

    fn record_def(&self, v: Value, site: Site, state: &mut RefState, updates: &mut Vec<Update>) {
        if !self.is_heap(v) {
            return;
        }
        let have = i64::from(self.owned(v));
        let need = i64::from(state.remove(&v).unwrap_or(0));
        if need != have {
            updates.push(Update { site, value: v, delta: need - have });
        }
    }

    /// Account for one instruction's operands. `release` is where an owned
    /// value whose last use this is gets released.
    fn record_uses(
        &self,
        operands: &[Value],
        consumed: &[Value],
        release: &[Site],
        state: &mut RefState,
        updates: &mut Vec<Update>,
    ) {
        let mut counts: BTreeMap<Value, u32> = BTreeMap::new();
        for v in operands.iter().filter(|v| self.is_heap(**v)) {
            counts.entry(*v).or_insert(0);
        }
        for v in consumed.iter().filter(|v| self.is_heap(**v)) {
            *counts.entry(*v).or_insert(0) += 1;
        }

        for (v, consumed) in counts {
            if let Some(n) = state.get_mut(&v) {
                *n += consumed;
                continue;
            }
            let mut after = 0;
            if consumed == 0 && self.owned(v) {
                if release.is_empty() {
                    crate::ice!("nowhere to release {} after its last use in {}", v, self.func.name);
                }
                for site in release {
                    updates.push(Update { site: *site, value: v, delta: -1 });
                }
                after = 1;
            }
            state.insert(v, after + consumed);
        }
    }

    /// Whatever the entry block still requires was handed in from outside:
    /// parameters and globals, all borrowed. Acquire them up front.
    fn resolve_entry(&self, updates: &mut Vec<Update>) {
        let func = self.func;
        let entry = func.entry;
        let Some(start) = &self.start[entry.index()] else {
            crate::ice!("entry block of {} was never scanned", func.name)
        };
        for (v, n) in start {
            match func.value_origin(*v) {
                ValueOrigin::Instr => crate::ice!("{} is used before its definition in {}", v, func.name),
                ValueOrigin::Param(_) | ValueOrigin::Global(_) => {
                    if self.owned(*v) {
                        crate::ice!("incoming value {} of {} is tagged owned", v, func.name);
                    }
                    if *n > 0 {
                        updates.push(Update { site: Site::BlockStart(entry), value: *v, delta: i64::from(*n) });
                    }
                }
            }
        }
    }
}
