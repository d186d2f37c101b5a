//! Phi placement from liveness and definedness

use super::{DefinednessAnalysis, DefinitionStatus, LivenessAnalysis, PhiAnalysis};
use crate::cfg::{Cfg, CfgBlockId, Name};

/// A name needs a phi where it is live and defined along at least one path.
/// Blocks the entry never reaches get a phi for every live name, each
/// treated as possibly undefined.
pub struct CfgPhiAnalysis {
    liveness: LivenessAnalysis,
    definedness: DefinednessAnalysis,
}

impl CfgPhiAnalysis {
    pub fn new(cfg: &Cfg) -> Self {
        CfgPhiAnalysis { liveness: LivenessAnalysis::new(cfg), definedness: DefinednessAnalysis::new(cfg) }
    }

    pub fn liveness(&self) -> &LivenessAnalysis {
        &self.liveness
    }

    pub fn definedness(&self) -> &DefinednessAnalysis {
        &self.definedness
    }
}

impl PhiAnalysis for CfgPhiAnalysis {
    fn required_at_start(&self, block: CfgBlockId) -> Vec<Name> {
        let live = self.liveness.live_at_start(block);
        if !self.definedness.is_reached(block) {
            return live;
        }
        live.into_iter()
            .filter(|n| self.definedness.status_at_start(n, block) != DefinitionStatus::Undefined)
            .collect()
    }

    fn is_potentially_undefined_at(&self, name: &str, block: CfgBlockId) -> bool {
        !self.definedness.is_reached(block)
            || self.definedness.status_at_start(name, block) == DefinitionStatus::PotentiallyDefined
    }
}
