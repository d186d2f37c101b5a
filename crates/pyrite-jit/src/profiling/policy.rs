//! Tiering policy: which effort level to compile at next, and when

use super::counters::CallCounter;
use crate::config::JitConfig;

/// How much optimization effort a compiled version received
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EffortLevel {
    /// Not compiled; run by the interpreter
    Interpreted,
    /// Unoptimized tier: carries reoptimization and OSR counters
    Minimal,
    /// Type-specialized, still counts calls
    Moderate,
    /// Final tier
    Maximal,
}

impl std::fmt::Display for EffortLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffortLevel::Interpreted => write!(f, "interpreted"),
            EffortLevel::Minimal => write!(f, "minimal"),
            EffortLevel::Moderate => write!(f, "moderate"),
            EffortLevel::Maximal => write!(f, "maximal"),
        }
    }
}

/// Thresholds and switches for tier transitions
#[derive(Debug, Clone)]
pub struct TierPolicy {
    pub reopt_threshold_baseline: i64,
    pub reopt_threshold_t2: i64,
    pub osr_threshold_baseline: i64,
    pub osr_threshold_t2: i64,
    pub enable_reopt: bool,
    pub enable_osr: bool,
}

impl TierPolicy {
    pub fn new(config: &JitConfig) -> Self {
        TierPolicy {
            reopt_threshold_baseline: config.reopt_threshold_baseline,
            reopt_threshold_t2: config.reopt_threshold_t2,
            osr_threshold_baseline: config.osr_threshold_baseline,
            osr_threshold_t2: config.osr_threshold_t2,
            enable_reopt: config.enable_reopt,
            enable_osr: config.enable_osr,
        }
    }

    /// Calls after which a version at `effort` asks to be replaced
    pub fn reopt_threshold(&self, effort: EffortLevel) -> Option<i64> {
        match effort {
            EffortLevel::Minimal => Some(self.reopt_threshold_baseline),
            EffortLevel::Moderate => Some(self.reopt_threshold_t2),
            EffortLevel::Interpreted | EffortLevel::Maximal => None,
        }
    }

    /// Back-edges after which a version at `effort` transfers by OSR
    pub fn osr_threshold(&self, effort: EffortLevel) -> Option<i64> {
        match effort {
            EffortLevel::Minimal => Some(self.osr_threshold_baseline),
            EffortLevel::Moderate => Some(self.osr_threshold_t2),
            EffortLevel::Interpreted | EffortLevel::Maximal => None,
        }
    }

    /// The tier to recompile into
    pub fn next_effort(&self, current: EffortLevel) -> Option<EffortLevel> {
        match current {
            EffortLevel::Interpreted => Some(EffortLevel::Minimal),
            EffortLevel::Minimal | EffortLevel::Moderate => Some(EffortLevel::Maximal),
            EffortLevel::Maximal => None,
        }
    }

    /// Whether a version gets the call-counting reoptimization prologue.
    /// Only the unoptimized tier does, and never for module code or an OSR entry.
    pub fn wants_reopt_prologue(&self, effort: EffortLevel, is_module: bool, is_osr: bool) -> bool {
        self.enable_reopt && effort == EffortLevel::Minimal && !is_module && !is_osr
    }

    /// Whether a version gets back-edge counters and OSR exits
    pub fn wants_osr_exits(&self, effort: EffortLevel, is_osr: bool) -> bool {
        self.enable_osr && effort == EffortLevel::Minimal && !is_osr
    }

    /// Whether a counter has crossed the reoptimization threshold
    pub fn should_reoptimize(&self, effort: EffortLevel, calls: &CallCounter) -> bool {
        self.reopt_threshold(effort).is_some_and(|t| calls.get() > t)
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(&JitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_effort() {
        let policy = TierPolicy::default();
        assert_eq!(policy.next_effort(EffortLevel::Interpreted), Some(EffortLevel::Minimal));
        assert_eq!(policy.next_effort(EffortLevel::Minimal), Some(EffortLevel::Maximal));
        assert_eq!(policy.next_effort(EffortLevel::Maximal), None);
    }

    #[test]
    fn test_reopt_prologue_only_in_baseline_tier() {
        let policy = TierPolicy::default();
        assert!(policy.wants_reopt_prologue(EffortLevel::Minimal, false, false));
        assert!(!policy.wants_reopt_prologue(EffortLevel::Minimal, true, false));
        assert!(!policy.wants_reopt_prologue(EffortLevel::Minimal, false, true));
        assert!(!policy.wants_reopt_prologue(EffortLevel::Maximal, false, false));
    }

    #[test]
    fn test_reopt_prologue_disabled_by_config() {
        let config = JitConfig { enable_reopt: false, ..JitConfig::default() };
        let policy = TierPolicy::new(&config);
        assert!(!policy.wants_reopt_prologue(EffortLevel::Minimal, false, false));
    }

    #[test]
    fn test_threshold_crossing() {
        let config = JitConfig { reopt_threshold_baseline: 2, ..JitConfig::default() };
        let policy = TierPolicy::new(&config);
        let calls = CallCounter::new();
        calls.record();
        calls.record();
        assert!(!policy.should_reoptimize(EffortLevel::Minimal, &calls));
        calls.record();
        assert!(policy.should_reoptimize(EffortLevel::Minimal, &calls));
        assert!(!policy.should_reoptimize(EffortLevel::Maximal, &calls));
    }
}
