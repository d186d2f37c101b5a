//! IR value types and ownership tags

/// Machine-level type of an IR value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IrType {
    /// One-bit condition
    I1,
    /// 64-bit integer
    I64,
    /// 64-bit float
    F64,
    /// Pointer to a refcounted heap object
    Obj,
    /// Untracked pointer (counters, stack arrays, code addresses, class slots)
    RawPtr,
    /// No value
    Void,
}

impl IrType {
    /// Whether values of this type are tracked by the refcount pass
    pub fn is_object(&self) -> bool {
        matches!(self, IrType::Obj)
    }

    /// Whether this type can be compared with integer comparisons
    pub fn is_integer_like(&self) -> bool {
        matches!(self, IrType::I1 | IrType::I64 | IrType::Obj | IrType::RawPtr)
    }

    /// Size in bytes when spilled to memory
    pub fn size_bytes(&self) -> usize {
        match self {
            IrType::Void => 0,
            IrType::I1 => 1,
            _ => 8,
        }
    }
}

impl std::fmt::Display for IrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrType::I1 => write!(f, "i1"),
            IrType::I64 => write!(f, "i64"),
            IrType::F64 => write!(f, "f64"),
            IrType::Obj => write!(f, "obj"),
            IrType::RawPtr => write!(f, "ptr"),
            IrType::Void => write!(f, "void"),
        }
    }
}

/// Ownership of a heap-object value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    /// The producer handed over one reference that must be released exactly once
    Owned,
    /// Kept alive by someone else for the duration of every use
    Borrowed,
    /// Not yet decided; never valid once refcount insertion starts
    Unknown,
}

/// Ownership tag attached to a heap-object value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefInfo {
    pub ref_type: RefType,
    /// The value may be null; refcount updates must be guarded
    pub nullable: bool,
}

impl RefInfo {
    pub fn owned() -> Self {
        RefInfo { ref_type: RefType::Owned, nullable: false }
    }

    pub fn borrowed() -> Self {
        RefInfo { ref_type: RefType::Borrowed, nullable: false }
    }

    pub fn is_owned(&self) -> bool {
        self.ref_type == RefType::Owned
    }
}

impl std::fmt::Display for RefInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.ref_type {
            RefType::Owned => "owned",
            RefType::Borrowed => "borrowed",
            RefType::Unknown => "unknown",
        };
        if self.nullable {
            write!(f, "{}?", name)
        } else {
            write!(f, "{}", name)
        }
    }
}
