//! Code cache for finalized compiled functions
//!
//! Stores executable code keyed by compiled-version identity, with size
//! accounting and invalidation (when a version is superseded by a
//! reoptimized one).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::compiled::CodeRef;
use crate::backend::traits::ExecutableCode;

/// Entry in the code cache
pub struct CacheEntry {
    pub code: ExecutableCode,
    /// Set once a newer version replaces this one
    pub invalidated: AtomicBool,
}

/// Thread-safe cache of finalized code
pub struct CodeCache {
    entries: RwLock<FxHashMap<CodeRef, CacheEntry>>,
    total_code_size: AtomicUsize,
    max_size: usize,
}

impl CodeCache {
    /// Create a cache holding at most `max_size` bytes of code
    pub fn new(max_size: usize) -> Self {
        CodeCache {
            entries: RwLock::new(FxHashMap::default()),
            total_code_size: AtomicUsize::new(0),
            max_size,
        }
    }

    /// Insert finalized code. Returns false if it does not fit.
    pub fn insert(&self, code_ref: CodeRef, code: ExecutableCode) -> bool {
        let mut entries = self.entries.write();
        let replaced = entries.get(&code_ref).map_or(0, |old| old.code.code_size);
        let current = self.total_code_size.load(Ordering::Relaxed) - replaced;
        if current + code.code_size > self.max_size {
            tracing::warn!(%code_ref, size = code.code_size, current, "code cache full");
            return false;
        }
        self.total_code_size.store(current + code.code_size, Ordering::Relaxed);
        entries.insert(code_ref, CacheEntry { code, invalidated: AtomicBool::new(false) });
        true
    }

    /// Entry address of a live version
    pub fn entry_address(&self, code_ref: CodeRef) -> Option<usize> {
        let entries = self.entries.read();
        let entry = entries.get(&code_ref)?;
        if entry.invalidated.load(Ordering::Acquire) {
            return None;
        }
        Some(entry.code.code_ptr as usize + entry.code.entry_offset)
    }

    /// Stop handing out a version; its code stays mapped for frames still running it
    pub fn invalidate(&self, code_ref: CodeRef) {
        if let Some(entry) = self.entries.read().get(&code_ref) {
            entry.invalidated.store(true, Ordering::Release);
        }
    }

    pub fn total_code_size(&self) -> usize {
        self.total_code_size.load(Ordering::Relaxed)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_code(size: usize) -> ExecutableCode {
        ExecutableCode { code_ptr: 0x4000 as *const u8, code_size: size, entry_offset: 16 }
    }

    #[test]
    fn test_insert_and_lookup() {
        let cache = CodeCache::new(1024);
        assert!(cache.insert(CodeRef(1), fake_code(100)));
        assert_eq!(cache.entry_address(CodeRef(1)), Some(0x4010));
        assert_eq!(cache.total_code_size(), 100);
    }

    #[test]
    fn test_size_limit() {
        let cache = CodeCache::new(150);
        assert!(cache.insert(CodeRef(1), fake_code(100)));
        assert!(!cache.insert(CodeRef(2), fake_code(100)));
        // replacing an entry frees its old size first
        assert!(cache.insert(CodeRef(1), fake_code(140)));
        assert_eq!(cache.total_code_size(), 140);
    }

    #[test]
    fn test_invalidate() {
        let cache = CodeCache::new(1024);
        cache.insert(CodeRef(3), fake_code(10));
        cache.invalidate(CodeRef(3));
        assert_eq!(cache.entry_address(CodeRef(3)), None);
        assert_eq!(cache.len(), 1);
    }
}
