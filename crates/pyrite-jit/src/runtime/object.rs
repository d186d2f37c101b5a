//! Object layout and class/function metadata
//!
//! The generated code touches heap objects only at the fixed offsets below;
//! everything else goes through runtime entry points. Classes and functions
//! are described by metadata the type lattice consults for static
//! attribute resolution.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::compiled::{CodeRef, CompiledFunction};
use crate::ir::IrType;

/// Offset of the reference count in every heap object
pub const REFCOUNT_OFFSET: i32 = 0;
/// Offset of the class pointer in every heap object
pub const CLASS_OFFSET: i32 = 8;
/// Offset of the payload of a boxed int
pub const INT_VALUE_OFFSET: i32 = 16;
/// Offset of the payload of a boxed float
pub const FLOAT_VALUE_OFFSET: i32 = 16;
/// Offset of the destructor function pointer in a class object
pub const TP_DEALLOC_OFFSET: i32 = 48;

/// Ints in this range are served from the canonical boxed small-int cache
pub const SMALL_INT_RANGE: std::ops::RangeInclusive<i64> = -5..=256;

/// Class identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Function identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// A process-wide constant or global the generated code refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GlobalRef {
    None,
    True,
    False,
    /// Entry of the boxed small-int cache
    SmallInt(i64),
    /// Interned string
    Str(Arc<str>),
    Class(ClassId),
    Function(FuncId),
    /// Call counter of a compiled function
    CallCounter(CodeRef),
    /// Back-edge counter of one loop in a compiled function
    BackedgeCounter(CodeRef, u32),
    /// OSR entry descriptor recorded for one back-edge
    OsrDescriptor(CodeRef, u32),
    /// The compiled-function record itself
    CompiledFunction(CodeRef),
}

impl GlobalRef {
    pub fn ir_type(&self) -> IrType {
        match self {
            GlobalRef::None
            | GlobalRef::True
            | GlobalRef::False
            | GlobalRef::SmallInt(_)
            | GlobalRef::Str(_)
            | GlobalRef::Class(_)
            | GlobalRef::Function(_) => IrType::Obj,
            GlobalRef::CallCounter(_)
            | GlobalRef::BackedgeCounter(..)
            | GlobalRef::OsrDescriptor(..)
            | GlobalRef::CompiledFunction(_) => IrType::RawPtr,
        }
    }
}

impl std::fmt::Display for GlobalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GlobalRef::None => write!(f, "None"),
            GlobalRef::True => write!(f, "True"),
            GlobalRef::False => write!(f, "False"),
            GlobalRef::SmallInt(i) => write!(f, "int({})", i),
            GlobalRef::Str(s) => write!(f, "{:?}", s),
            GlobalRef::Class(c) => write!(f, "class#{}", c.0),
            GlobalRef::Function(func) => write!(f, "function#{}", func.0),
            GlobalRef::CallCounter(code) => write!(f, "{}.calls", code),
            GlobalRef::BackedgeCounter(code, i) => write!(f, "{}.backedge{}", code, i),
            GlobalRef::OsrDescriptor(code, i) => write!(f, "{}.osr{}", code, i),
            GlobalRef::CompiledFunction(code) => write!(f, "{}", code),
        }
    }
}

/// Attribute stored on a class
#[derive(Clone)]
pub enum ClassAttr {
    /// A plain function, bound as a method on instance lookup
    Function(Arc<FunctionInfo>),
    /// Any other value
    Value,
}

/// Class metadata
pub struct ClassInfo {
    pub id: ClassId,
    pub name: Arc<str>,
    /// No instance dict, no metaclass hooks, default attribute lookup
    closed: bool,
    attrs: RwLock<FxHashMap<Arc<str>, ClassAttr>>,
}

impl ClassInfo {
    pub fn new(id: ClassId, name: &str, closed: bool) -> Arc<Self> {
        Arc::new(ClassInfo {
            id,
            name: Arc::from(name),
            closed,
            attrs: RwLock::new(FxHashMap::default()),
        })
    }

    /// Whether attribute lookups can be resolved from the class alone
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_attr(&self, name: &str, attr: ClassAttr) {
        self.attrs.write().insert(Arc::from(name), attr);
    }

    pub fn lookup(&self, name: &str) -> Option<ClassAttr> {
        self.attrs.read().get(name).cloned()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.read().contains_key(name)
    }
}

impl std::fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Function metadata and its compiled versions
pub struct FunctionInfo {
    pub id: FuncId,
    pub name: Arc<str>,
    /// Positional parameters, including `self` for methods
    pub num_params: usize,
    /// Defaults for the trailing parameters
    pub defaults: Vec<GlobalRef>,
    pub takes_varargs: bool,
    pub takes_kwargs: bool,
    versions: RwLock<Vec<Arc<CompiledFunction>>>,
}

impl FunctionInfo {
    pub fn new(id: FuncId, name: &str, num_params: usize, defaults: Vec<GlobalRef>) -> Arc<Self> {
        Arc::new(FunctionInfo {
            id,
            name: Arc::from(name),
            num_params,
            defaults,
            takes_varargs: false,
            takes_kwargs: false,
            versions: RwLock::new(Vec::new()),
        })
    }

    /// Whether a positional call with `nargs` arguments can bind directly
    pub fn accepts_positional(&self, nargs: usize) -> bool {
        if self.takes_varargs || self.takes_kwargs {
            return false;
        }
        let required = self.num_params.saturating_sub(self.defaults.len());
        nargs >= required && nargs <= self.num_params
    }

    pub fn add_version(&self, version: Arc<CompiledFunction>) {
        self.versions.write().push(version);
    }

    /// Drop a replaced version so direct calls stop binding to it.
    /// Returns false if it was not registered here.
    pub fn retire_version(&self, code: CodeRef) -> bool {
        let mut versions = self.versions.write();
        let before = versions.len();
        versions.retain(|v| v.code_ref != code);
        versions.len() != before
    }

    /// Snapshot of the compiled versions, oldest first
    pub fn versions(&self) -> Vec<Arc<CompiledFunction>> {
        self.versions.read().clone()
    }
}

impl std::fmt::Debug for FunctionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("num_params", &self.num_params)
            .finish()
    }
}

/// The builtin classes the type lattice knows about
#[derive(Debug, Clone)]
pub struct BuiltinClasses {
    pub object: Arc<ClassInfo>,
    pub int: Arc<ClassInfo>,
    pub float: Arc<ClassInfo>,
    pub bool_: Arc<ClassInfo>,
    pub tuple: Arc<ClassInfo>,
    pub str_: Arc<ClassInfo>,
    pub none: Arc<ClassInfo>,
    pub function: Arc<ClassInfo>,
    pub instancemethod: Arc<ClassInfo>,
}

impl BuiltinClasses {
    /// First id available for user classes
    pub const FIRST_USER_CLASS: u32 = 16;

    pub fn new() -> Self {
        // builtin attribute tables are not modelled, so none are closed
        let class = |id, name| ClassInfo::new(ClassId(id), name, false);
        BuiltinClasses {
            object: class(0, "object"),
            int: class(1, "int"),
            float: class(2, "float"),
            bool_: class(3, "bool"),
            tuple: class(4, "tuple"),
            str_: class(5, "str"),
            none: class(6, "NoneType"),
            function: class(7, "function"),
            instancemethod: class(8, "instancemethod"),
        }
    }
}

impl Default for BuiltinClasses {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_positional_with_defaults() {
        let f = FunctionInfo::new(FuncId(1), "f", 3, vec![GlobalRef::None]);
        assert!(!f.accepts_positional(1));
        assert!(f.accepts_positional(2));
        assert!(f.accepts_positional(3));
        assert!(!f.accepts_positional(4));
    }

    #[test]
    fn test_retire_version() {
        let types = crate::compvars::TypeRegistry::new();
        let f = FunctionInfo::new(FuncId(4), "g", 0, vec![]);
        let version = |code| {
            Arc::new(CompiledFunction::new(
                CodeRef(code),
                "g".to_string(),
                crate::runtime::FunctionSpecialization::generic(&types, 0),
                crate::runtime::ExceptionStyle::Cxx,
                crate::profiling::EffortLevel::Minimal,
                None,
                vec![],
                crate::ir::IrFunction::new("g", &[], IrType::Obj),
            ))
        };
        f.add_version(version(10));
        f.add_version(version(11));
        assert!(f.retire_version(CodeRef(10)));
        assert!(!f.retire_version(CodeRef(10)));
        let left: Vec<CodeRef> = f.versions().iter().map(|v| v.code_ref).collect();
        assert_eq!(left, vec![CodeRef(11)]);
    }

    #[test]
    fn test_class_attrs() {
        let cls = ClassInfo::new(ClassId(20), "Point", true);
        let f = FunctionInfo::new(FuncId(2), "norm", 1, vec![]);
        cls.set_attr("norm", ClassAttr::Function(f));
        assert!(cls.is_closed());
        assert!(matches!(cls.lookup("norm"), Some(ClassAttr::Function(_))));
        assert!(cls.lookup("missing").is_none());
    }

    #[test]
    fn test_global_types() {
        assert_eq!(GlobalRef::True.ir_type(), IrType::Obj);
        assert_eq!(GlobalRef::CallCounter(CodeRef(1)).ir_type(), IrType::RawPtr);
    }
}
