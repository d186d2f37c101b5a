//! Block visitation order for the emission driver

use crate::cfg::{Cfg, CfgBlockId};

/// One block in visitation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub block: CfgBlockId,
    /// No predecessor had been emitted when the block was picked
    pub forced: bool,
}

/// `start` first; then, repeatedly, the lowest-indexed block with an
/// emitted predecessor. When no block qualifies the lowest-indexed
/// remaining block is taken as a forced seed.
pub fn block_order(cfg: &Cfg, start: CfgBlockId) -> Vec<Scheduled> {
    let n = cfg.num_blocks();
    let mut done = vec![false; n];
    let mut order = Vec::with_capacity(n);
    done[start.index()] = true;
    order.push(Scheduled { block: start, forced: false });

    while order.len() < n {
        let ready = cfg
            .block_ids()
            .find(|b| !done[b.index()] && cfg.preds(*b).iter().any(|p| done[p.index()]));
        let next = match ready {
            Some(block) => Scheduled { block, forced: false },
            None => match cfg.block_ids().find(|b| !done[b.index()]) {
                Some(block) => Scheduled { block, forced: true },
                None => break,
            },
        };
        done[next.block.index()] = true;
        order.push(next);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{CfgBuilder, Expr, Stmt};

    /// entry -> pre -> header <-> body; header -> exit
    fn loop_cfg() -> Cfg {
        let mut b = CfgBuilder::new("f", &["c"]);
        let entry = b.add_block();
        let pre = b.add_block();
        let header = b.add_block();
        let body = b.add_block();
        let exit = b.add_block();
        b.push(entry, Stmt::Jump(pre));
        b.push(pre, Stmt::Jump(header));
        b.push(header, Stmt::Branch { test: Expr::name("c"), then_block: body, else_block: exit });
        b.push(body, Stmt::Jump(header));
        b.push(exit, Stmt::Return(None));
        b.finish()
    }

    fn ids(order: &[Scheduled]) -> Vec<u32> {
        order.iter().map(|s| s.block.0).collect()
    }

    #[test]
    fn test_fresh_order_follows_edges() {
        let cfg = loop_cfg();
        let order = block_order(&cfg, cfg.entry());
        assert_eq!(ids(&order), vec![0, 1, 2, 3, 4]);
        assert!(order.iter().all(|s| !s.forced));
    }

    #[test]
    fn test_osr_order_seeds_unreached_blocks() {
        let cfg = loop_cfg();
        let order = block_order(&cfg, CfgBlockId(2));
        assert_eq!(ids(&order), vec![2, 3, 4, 0, 1]);
        assert!(order[3].forced);
        assert!(!order[4].forced);
    }

    #[test]
    fn test_lowest_index_breaks_ties() {
        // entry branches to 2 and 1; both are ready after entry
        let mut b = CfgBuilder::new("f", &["c"]);
        let entry = b.add_block();
        let one = b.add_block();
        let two = b.add_block();
        b.push(entry, Stmt::Branch { test: Expr::name("c"), then_block: two, else_block: one });
        b.push(one, Stmt::Return(None));
        b.push(two, Stmt::Return(None));
        let cfg = b.finish();
        assert_eq!(ids(&block_order(&cfg, entry)), vec![0, 1, 2]);
    }
}
