//! JIT configuration
//!
//! `JitConfig` is a plain struct with tier thresholds and feature switches.
//! Defaults match the production tuning; `from_env` overlays `PYRITE_*`
//! environment variables on top of them.

use std::env;
use std::str::FromStr;

use crate::error::ConfigError;

/// Configuration for the compilation tiers and the passes they run
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Calls into the baseline tier before asking for reoptimization
    pub reopt_threshold_baseline: i64,
    /// Calls into the second tier before asking for reoptimization
    pub reopt_threshold_t2: i64,
    /// Back-edges taken in the baseline tier before attempting OSR
    pub osr_threshold_baseline: i64,
    /// Back-edges taken in the second tier before attempting OSR
    pub osr_threshold_t2: i64,
    /// Emit the call-counter reoptimization prologue
    pub enable_reopt: bool,
    /// Emit back-edge counters and OSR exits
    pub enable_osr: bool,
    /// Route generic operations through inline caches. Accepted but
    /// currently always lowered as direct runtime calls.
    pub enable_ics: bool,
    /// Scan every heap-pointer value for a ref-type tag before refcount insertion
    pub verify_refcount_tags: bool,
    /// Positional arguments passed in registers before spilling to an array
    pub num_inline_args: usize,
    /// Upper bound on how often the refcount dataflow may revisit one block
    pub max_dataflow_visits_per_block: usize,
    /// Maximum total size of finalized code, in bytes
    pub code_cache_size: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            reopt_threshold_baseline: 1500,
            reopt_threshold_t2: 10_000,
            osr_threshold_baseline: 2500,
            osr_threshold_t2: 10_000,
            enable_reopt: true,
            enable_osr: true,
            enable_ics: false,
            verify_refcount_tags: cfg!(debug_assertions),
            num_inline_args: 3,
            max_dataflow_visits_per_block: 1000,
            code_cache_size: 64 * 1024 * 1024,
        }
    }
}

impl JitConfig {
    /// Defaults overlaid with any `PYRITE_*` environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Defaults overlaid with overrides from an arbitrary lookup function
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = JitConfig::default();
        override_num(&lookup, "PYRITE_REOPT_THRESHOLD", &mut config.reopt_threshold_baseline)?;
        override_num(&lookup, "PYRITE_REOPT_THRESHOLD_T2", &mut config.reopt_threshold_t2)?;
        override_num(&lookup, "PYRITE_OSR_THRESHOLD", &mut config.osr_threshold_baseline)?;
        override_num(&lookup, "PYRITE_OSR_THRESHOLD_T2", &mut config.osr_threshold_t2)?;
        override_flag(&lookup, "PYRITE_ENABLE_REOPT", &mut config.enable_reopt)?;
        override_flag(&lookup, "PYRITE_ENABLE_OSR", &mut config.enable_osr)?;
        override_flag(&lookup, "PYRITE_ENABLE_ICS", &mut config.enable_ics)?;
        override_flag(&lookup, "PYRITE_VERIFY_REFCOUNTS", &mut config.verify_refcount_tags)?;
        tracing::debug!(?config, "loaded jit configuration");
        Ok(config)
    }
}

fn override_num<F, T>(lookup: &F, var: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(var) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var,
            value: raw.clone(),
            expected: "an integer",
        })?;
    }
    Ok(())
}

fn override_flag<F>(lookup: &F, var: &'static str, slot: &mut bool) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(var) {
        *slot = match raw.trim() {
            "1" | "true" | "on" | "yes" => true,
            "0" | "false" | "off" | "no" => false,
            _ => {
                return Err(ConfigError::InvalidValue {
                    var,
                    value: raw,
                    expected: "a boolean (0/1/true/false)",
                })
            }
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: FxHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = JitConfig::default();
        assert_eq!(config.reopt_threshold_baseline, 1500);
        assert_eq!(config.osr_threshold_baseline, 2500);
        assert_eq!(config.num_inline_args, 3);
        assert!(config.enable_reopt);
        assert!(!config.enable_ics);
    }

    #[test]
    fn test_overrides_applied() {
        let config = JitConfig::from_lookup(lookup_from(&[
            ("PYRITE_REOPT_THRESHOLD", "20"),
            ("PYRITE_ENABLE_OSR", "off"),
            ("PYRITE_VERIFY_REFCOUNTS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.reopt_threshold_baseline, 20);
        assert!(!config.enable_osr);
        assert!(config.verify_refcount_tags);
        assert_eq!(config.reopt_threshold_t2, 10_000);
    }

    #[test]
    fn test_bad_number_rejected() {
        let err = JitConfig::from_lookup(lookup_from(&[("PYRITE_OSR_THRESHOLD", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "PYRITE_OSR_THRESHOLD", .. }
        ));
    }

    #[test]
    fn test_bad_flag_rejected() {
        assert!(JitConfig::from_lookup(lookup_from(&[("PYRITE_ENABLE_ICS", "maybe")])).is_err());
    }
}
