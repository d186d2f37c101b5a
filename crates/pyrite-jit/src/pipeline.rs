//! Compilation pipeline: CFG -> IR -> refcounted IR -> backend
//!
//! The pipeline chains the stages of one compile:
//! 1. Emit IR from the CFG and its analyses
//! 2. Drop unreachable blocks and insert refcount operations
//! 3. Lower to the backend, resolving runtime symbols and the version's own counters
//! 4. Finalize, publish into the code cache, and record the entry address
//!
//! Versions compiled for a known function are registered with it, so direct
//! calls can bind to them, and dropped from it again when superseded.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::backend::traits::{CodegenBackend, SymbolResolver};
use crate::compvars::TypeRegistry;
use crate::config::JitConfig;
use crate::error::PipelineError;
use crate::irgen::{self, CompileRequest};
use crate::profiling::{TierPolicy, VersionProfile};
use crate::runtime::{CodeCache, CodeRef, CompiledFunction, FunctionInfo, GlobalRef, RuntimeFn};

/// Addresses the object-model runtime provides to generated code
pub trait RuntimeLinker: Send + Sync {
    /// Entry point of a runtime function
    fn runtime_fn(&self, f: RuntimeFn) -> Option<usize>;

    /// Address of a process-wide object or record
    fn global(&self, g: &GlobalRef) -> Option<usize>;
}

/// Resolves symbols for one version being compiled. Its own counters and
/// descriptors live in the record; everything else goes to the linker or
/// the code cache.
struct VersionResolver<'a> {
    linker: &'a dyn RuntimeLinker,
    cache: &'a CodeCache,
    compiled: &'a CompiledFunction,
}

impl SymbolResolver for VersionResolver<'_> {
    fn resolve_runtime(&self, f: RuntimeFn) -> Option<usize> {
        self.linker.runtime_fn(f)
    }

    fn resolve_function(&self, code: CodeRef) -> Option<usize> {
        self.cache.entry_address(code)
    }

    fn resolve_global(&self, g: &GlobalRef) -> Option<usize> {
        let own = self.compiled.code_ref;
        let exit = |index: u32| self.compiled.osr_exits.get(index as usize);
        match g {
            GlobalRef::CallCounter(c) if *c == own => Some(self.compiled.times_called.as_ptr() as usize),
            GlobalRef::BackedgeCounter(c, i) if *c == own => exit(*i).map(|e| e.counter.as_ptr() as usize),
            GlobalRef::OsrDescriptor(c, i) if *c == own => exit(*i).map(|e| Arc::as_ptr(&e.descriptor) as usize),
            GlobalRef::CompiledFunction(c) if *c == own => Some(self.compiled as *const CompiledFunction as usize),
            _ => self.linker.global(g),
        }
    }
}

/// Complete JIT compilation pipeline
pub struct JitPipeline<B: CodegenBackend> {
    backend: B,
    linker: Arc<dyn RuntimeLinker>,
    config: JitConfig,
    policy: TierPolicy,
    types: TypeRegistry,
    cache: CodeCache,
    /// Function each registered version belongs to
    owners: Mutex<FxHashMap<CodeRef, Arc<FunctionInfo>>>,
}

impl<B: CodegenBackend> JitPipeline<B> {
    pub fn new(backend: B, linker: Arc<dyn RuntimeLinker>) -> Self {
        Self::with_config(backend, linker, JitConfig::default())
    }

    pub fn with_config(backend: B, linker: Arc<dyn RuntimeLinker>, config: JitConfig) -> Self {
        let cache = CodeCache::new(config.code_cache_size);
        let policy = TierPolicy::new(&config);
        JitPipeline {
            backend,
            linker,
            config,
            policy,
            types: TypeRegistry::new(),
            cache,
            owners: Mutex::new(FxHashMap::default()),
        }
    }

    /// Compile one version through every stage and publish it
    #[tracing::instrument(level = "debug", skip_all, fields(function = %req.cfg.name, backend = self.backend.name()))]
    pub fn compile(&self, req: &CompileRequest<'_>) -> Result<Arc<CompiledFunction>, PipelineError> {
        // counters are baked into the code by address, so the record must not move
        let compiled = Arc::new(irgen::do_compile(req, &self.types, &self.config));
        let resolver = VersionResolver { linker: self.linker.as_ref(), cache: &self.cache, compiled: &compiled };
        let code = self.backend.compile_function(&compiled.ir, &resolver)?;
        let exec = self.backend.finalize(&code)?;
        let address = exec.entry_address();
        let size = exec.code_size;

        if !self.cache.insert(compiled.code_ref, exec) {
            return Err(PipelineError::CodeCacheFull {
                used: self.cache.total_code_size(),
                limit: self.cache.max_size(),
            });
        }
        if !compiled.set_code_address(address) {
            crate::ice!("{} was published twice", compiled.code_ref);
        }
        tracing::debug!(code_ref = %compiled.code_ref, size, address, "published");
        Ok(compiled)
    }

    /// Compile a version of `func` and register it for direct calls
    pub fn compile_for(
        &self,
        func: &Arc<FunctionInfo>,
        req: &CompileRequest<'_>,
    ) -> Result<Arc<CompiledFunction>, PipelineError> {
        let compiled = self.compile(req)?;
        func.add_version(compiled.clone());
        self.owners.lock().insert(compiled.code_ref, func.clone());
        tracing::debug!(function = %func.name, code_ref = %compiled.code_ref, "registered version");
        Ok(compiled)
    }

    /// Replace a hot version with one compiled at the next tier.
    ///
    /// Returns `None` when `current` is not hot yet, is already at the top
    /// tier, or another thread holds the function's recompilation claim.
    /// `req` must ask for the tier the policy picks. The new version is
    /// registered with whatever function `current` was registered with.
    pub fn tier_up(
        &self,
        current: &CompiledFunction,
        profile: &VersionProfile,
        req: &CompileRequest<'_>,
    ) -> Result<Option<Arc<CompiledFunction>>, PipelineError> {
        if !self.policy.should_reoptimize(current.effort, &current.times_called) {
            return Ok(None);
        }
        let Some(next) = self.policy.next_effort(current.effort) else {
            return Ok(None);
        };
        if req.effort != next {
            crate::ice!("tier-up of {} asked for {:?}, policy picks {:?}", current.code_ref, req.effort, next);
        }
        if !profile.try_start_compile() {
            return Ok(None);
        }
        let owner = self.owners.lock().get(&current.code_ref).cloned();
        let result = match &owner {
            Some(func) => self.compile_for(func, req),
            None => self.compile(req),
        };
        match result {
            Ok(compiled) => {
                self.supersede(current.code_ref);
                profile.finish_compile();
                tracing::info!(from = %current.code_ref, to = %compiled.code_ref, ?next, "tiered up");
                Ok(Some(compiled))
            }
            Err(e) => {
                profile.abandon_compile();
                Err(e)
            }
        }
    }

    /// Retire a version a newer one replaces. Its code leaves the cache and,
    /// if it was registered, its function stops offering it to direct calls.
    pub fn supersede(&self, old: CodeRef) {
        tracing::debug!(code_ref = %old, "superseded");
        if let Some(func) = self.owners.lock().remove(&old) {
            func.retire_version(old);
        }
        self.cache.invalidate(old);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Registry the analyses of every request must share
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }
}
