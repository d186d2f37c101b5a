//! Relaxed profiling counters
//!
//! The generated code increments these without synchronization from every
//! thread running a version; the trigger point is approximate.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// A call or back-edge counter the generated code loads, bumps and stores
#[derive(Debug, Default)]
pub struct CallCounter(AtomicI64);

impl CallCounter {
    pub fn new() -> Self {
        CallCounter(AtomicI64::new(0))
    }

    /// Record one event, return the new count
    pub fn record(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    /// Address the generated code reads and writes
    pub fn as_ptr(&self) -> *mut i64 {
        self.0.as_ptr()
    }
}

/// Tier-up state shared by every version of one function
#[derive(Debug, Default)]
pub struct VersionProfile {
    /// A recompilation has been claimed and not yet published
    compiling: AtomicBool,
    /// Number of versions published so far
    versions: AtomicI64,
}

impl VersionProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the function for recompilation.
    /// Returns true if we successfully claimed it.
    pub fn try_start_compile(&self) -> bool {
        self.compiling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the claim after a version was published
    pub fn finish_compile(&self) {
        self.versions.fetch_add(1, Ordering::Relaxed);
        self.compiling.store(false, Ordering::Release);
    }

    /// Release the claim without publishing
    pub fn abandon_compile(&self) {
        self.compiling.store(false, Ordering::Release);
    }

    pub fn is_compiling(&self) -> bool {
        self.compiling.load(Ordering::Acquire)
    }

    pub fn num_versions(&self) -> i64 {
        self.versions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_counter() {
        let counter = CallCounter::new();
        assert_eq!(counter.record(), 1);
        assert_eq!(counter.record(), 2);
        assert_eq!(counter.get(), 2);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_counter_pointer_sees_generated_code_writes() {
        let counter = CallCounter::new();
        // what the reoptimization prologue does: load, add, store
        unsafe {
            let p = counter.as_ptr();
            *p += 5;
        }
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_compile_claim_lifecycle() {
        let profile = VersionProfile::new();
        assert!(profile.try_start_compile());
        assert!(!profile.try_start_compile());
        profile.finish_compile();
        assert!(!profile.is_compiling());
        assert_eq!(profile.num_versions(), 1);

        assert!(profile.try_start_compile());
        profile.abandon_compile();
        assert_eq!(profile.num_versions(), 1);
    }
}
