//! Compiled-function records
//!
//! A `CompiledFunction` is what one run of the emission driver produces: the
//! finished IR, the signature it was specialized for, the exception style
//! its callers must expect, and the counters the tiering machinery reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use super::entry_points::ExceptionStyle;
use crate::cfg::{CfgBlockId, Name};
use crate::compvars::{TypeRef, TypeRegistry};
use crate::ir::{IrFunction, IrType};
use crate::profiling::{CallCounter, EffortLevel};

/// Identity of one compiled version of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeRef(pub u64);

static NEXT_CODE_REF: AtomicU64 = AtomicU64::new(1);

impl CodeRef {
    /// Allocate a process-unique identity
    pub fn fresh() -> Self {
        CodeRef(NEXT_CODE_REF.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for CodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code#{}", self.0)
    }
}

/// Argument and return types a version was compiled for
#[derive(Debug, Clone)]
pub struct FunctionSpecialization {
    pub arg_types: Vec<TypeRef>,
    pub ret_type: TypeRef,
}

impl FunctionSpecialization {
    /// Every argument and the result typed as Unknown
    pub fn generic(types: &TypeRegistry, nargs: usize) -> Self {
        FunctionSpecialization {
            arg_types: vec![types.unknown(); nargs],
            ret_type: types.unknown(),
        }
    }

    /// Whether every argument type is Unknown
    pub fn is_generic(&self) -> bool {
        self.arg_types.iter().all(|t| t.is_unknown())
    }
}

/// Live state at a loop back-edge, in the order the OSR entry receives it
#[derive(Debug, Clone)]
pub struct OsrEntryDescriptor {
    /// Version the state is transferred out of
    pub source: CodeRef,
    /// Loop header the new version resumes at
    pub backedge_target: CfgBlockId,
    /// Live variables with the concrete type each is passed as
    pub args: Vec<(Name, TypeRef)>,
}

impl OsrEntryDescriptor {
    /// Native parameter types of the OSR entry
    pub fn param_types(&self, num_inline_args: usize) -> Vec<IrType> {
        let mut params: Vec<IrType> = self
            .args
            .iter()
            .take(num_inline_args)
            .map(|(_, ty)| ty.ir_type())
            .collect();
        if self.args.len() > num_inline_args {
            params.push(IrType::RawPtr);
        }
        params
    }
}

/// One back-edge that can transfer into an OSR version
#[derive(Debug)]
pub struct OsrExit {
    pub descriptor: Arc<OsrEntryDescriptor>,
    /// Times the back-edge was taken
    pub counter: CallCounter,
}

/// The result of compiling one function version
#[derive(Debug)]
pub struct CompiledFunction {
    pub code_ref: CodeRef,
    pub name: String,
    pub spec: FunctionSpecialization,
    pub exception_style: ExceptionStyle,
    pub effort: EffortLevel,
    /// Incremented by the reoptimization prologue on every call
    pub times_called: CallCounter,
    /// Set when this version was compiled as an OSR entry
    pub osr_entry: Option<Arc<OsrEntryDescriptor>>,
    pub osr_exits: Vec<OsrExit>,
    pub ir: IrFunction,
    code_address: OnceCell<usize>,
}

impl CompiledFunction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        code_ref: CodeRef,
        name: String,
        spec: FunctionSpecialization,
        exception_style: ExceptionStyle,
        effort: EffortLevel,
        osr_entry: Option<Arc<OsrEntryDescriptor>>,
        osr_exits: Vec<Arc<OsrEntryDescriptor>>,
        ir: IrFunction,
    ) -> Self {
        CompiledFunction {
            code_ref,
            name,
            spec,
            exception_style,
            effort,
            times_called: CallCounter::new(),
            osr_entry,
            osr_exits: osr_exits
                .into_iter()
                .map(|descriptor| OsrExit { descriptor, counter: CallCounter::new() })
                .collect(),
            ir,
            code_address: OnceCell::new(),
        }
    }

    /// Native parameter and return types of the entry point
    pub fn entry_signature(&self) -> (Vec<IrType>, IrType) {
        let params = self.ir.params.iter().map(|p| self.ir.value_type(*p)).collect();
        (params, self.ir.ret)
    }

    pub fn is_osr(&self) -> bool {
        self.osr_entry.is_some()
    }

    /// Publish the finalized entry address. Returns false if already set.
    pub fn set_code_address(&self, address: usize) -> bool {
        self.code_address.set(address).is_ok()
    }

    pub fn code_address(&self) -> Option<usize> {
        self.code_address.get().copied()
    }
}
