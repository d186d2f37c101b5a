//! Compile-time type lattice
//!
//! A `TypeRef` describes what is statically known about a value: its
//! machine representation, its canonical boxed form, and how attribute
//! access, calls and operators are typed. Types are interned by a
//! `TypeRegistry`, so two requests for the same shape yield the same
//! identity and equality is pointer equality.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cfg::{BinOpKind, CompareOp, UnaryOpKind};
use crate::ir::IrType;
use crate::runtime::object::{BuiltinClasses, ClassAttr, ClassId, FuncId};
use crate::runtime::{ClassInfo, FunctionInfo};

/// The shape a type describes
#[derive(Debug)]
pub enum TypeKind {
    /// Top: any boxed object
    Unknown,
    /// Bottom: the value is never produced or the operation always fails
    Undef,
    /// Unboxed 64-bit integer with a lazily created box
    Int,
    /// Unboxed double with a lazily created box
    Float,
    /// Unboxed condition bit
    Bool,
    /// Compile-time string constant
    StrConstant,
    /// Tuple of statically known arity and element types
    Tuple(Vec<TypeRef>),
    /// A method looked up on an object and not yet bound
    InstanceMethod { obj: TypeRef, func: Arc<FunctionInfo> },
    /// Boxed instance of a known class
    Class(Arc<ClassInfo>),
    /// Closure cell pointer passed to the function
    Closure,
    /// Generator state pointer passed to the function
    Generator,
}

#[derive(Debug)]
pub struct TypeData {
    name: String,
    kind: TypeKind,
    /// `None` when the type is its own concrete form
    concrete: Option<TypeRef>,
    /// `None` when the type is its own box type
    boxed: Option<TypeRef>,
}

/// Interned compile-time type
#[derive(Clone)]
pub struct TypeRef(Arc<TypeData>);

impl PartialEq for TypeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TypeRef {}

impl Hash for TypeRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl std::fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

impl std::fmt::Display for TypeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// Three-valued answer to a static query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    Yes,
    No,
    Maybe,
}

impl TypeRef {
    fn new(name: impl Into<String>, kind: TypeKind, concrete: Option<TypeRef>, boxed: Option<TypeRef>) -> Self {
        TypeRef(Arc::new(TypeData { name: name.into(), kind, concrete, boxed }))
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Stable diagnostic name
    pub fn debug_name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> &TypeKind {
        &self.0.kind
    }

    /// The type as represented at the machine level
    pub fn concrete(&self) -> TypeRef {
        self.0.concrete.clone().unwrap_or_else(|| self.clone())
    }

    /// The canonical heap-object representation
    pub fn box_type(&self) -> TypeRef {
        self.0.boxed.clone().unwrap_or_else(|| self.clone())
    }

    pub fn is_concrete(&self) -> bool {
        self.0.concrete.is_none()
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self.kind(), TypeKind::Unknown)
    }

    pub fn is_undef(&self) -> bool {
        matches!(self.kind(), TypeKind::Undef)
    }

    /// Whether values have an unboxed form with a lazily created box
    pub fn has_lazy_box(&self) -> bool {
        matches!(self.kind(), TypeKind::Int | TypeKind::Float)
    }

    /// Machine type of the concrete representation
    pub fn ir_type(&self) -> IrType {
        match self.concrete().kind() {
            TypeKind::Int => IrType::I64,
            TypeKind::Float => IrType::F64,
            TypeKind::Bool => IrType::I1,
            _ => IrType::Obj,
        }
    }

    /// The class of a boxed value of this type, when statically known
    pub fn class(&self) -> Option<&Arc<ClassInfo>> {
        match self.kind() {
            TypeKind::Class(cls) => Some(cls),
            _ => None,
        }
    }

    /// Number of 8-byte frame slots a value of this concrete type occupies
    /// when spilled for OSR. A lazily boxed type spills a discriminant
    /// followed by room for the larger of its two representations.
    pub fn num_frame_args(&self) -> usize {
        if !self.is_concrete() {
            crate::ice!("num_frame_args on non-concrete type {}", self);
        }
        match self.kind() {
            TypeKind::Int | TypeKind::Float => 1 + 1usize.max(self.box_type().num_frame_args()),
            TypeKind::Bool
            | TypeKind::Unknown
            | TypeKind::Undef
            | TypeKind::Class(_)
            | TypeKind::Closure
            | TypeKind::Generator => 1,
            TypeKind::StrConstant | TypeKind::Tuple(_) | TypeKind::InstanceMethod { .. } => {
                crate::ice!("{} is not concrete", self)
            }
        }
    }

    /// Whether a value of this type may be converted to `other`
    pub fn can_convert_to(&self, other: &TypeRef) -> bool {
        if self == other {
            return true;
        }
        if other.is_unknown() {
            return !matches!(self.kind(), TypeKind::Closure | TypeKind::Generator);
        }
        match self.kind() {
            TypeKind::Undef => true,
            TypeKind::Int | TypeKind::Float | TypeKind::Bool => *other == self.box_type(),
            TypeKind::Class(_) => match other.kind() {
                // a known boxed int or float may be unboxed
                TypeKind::Int | TypeKind::Float => other.box_type() == *self,
                _ => false,
            },
            TypeKind::StrConstant | TypeKind::InstanceMethod { .. } => *other == self.concrete(),
            TypeKind::Tuple(elts) => match other.kind() {
                TypeKind::Tuple(others) => {
                    elts.len() == others.len() && elts.iter().zip(others).all(|(a, b)| a.can_convert_to(b))
                }
                _ => *other == self.concrete(),
            },
            TypeKind::Unknown | TypeKind::Closure | TypeKind::Generator => false,
        }
    }

    /// Static type of `self.attr`. Undef when the attribute provably does
    /// not exist.
    pub fn getattr_type(&self, reg: &TypeRegistry, attr: &str) -> TypeRef {
        match self.kind() {
            TypeKind::Undef => reg.undef(),
            TypeKind::Class(cls) if cls.is_closed() => match cls.lookup(attr) {
                Some(ClassAttr::Function(func)) => reg.instance_method(self, &func),
                Some(ClassAttr::Value) => reg.unknown(),
                None => reg.undef(),
            },
            _ => reg.unknown(),
        }
    }

    /// Static type of calling a value of this type
    pub fn call_type(&self, reg: &TypeRegistry, _args: &[TypeRef]) -> TypeRef {
        match self.kind() {
            TypeKind::Undef => reg.undef(),
            _ => reg.unknown(),
        }
    }

    /// Static type of `self.attr(args)`
    pub fn callattr_type(&self, reg: &TypeRegistry, attr: &str, args: &[TypeRef]) -> TypeRef {
        self.getattr_type(reg, attr).call_type(reg, args)
    }

    pub fn hasattr(&self, attr: &str) -> Truth {
        match self.kind() {
            TypeKind::Undef => Truth::No,
            TypeKind::Class(cls) if cls.is_closed() => {
                if cls.has_attr(attr) {
                    Truth::Yes
                } else {
                    Truth::No
                }
            }
            _ => Truth::Maybe,
        }
    }

    /// Static type of `self <op> rhs`
    pub fn binexp_type(&self, reg: &TypeRegistry, op: BinOpKind, rhs: &TypeRef) -> TypeRef {
        use TypeKind::*;
        if self.is_undef() || rhs.is_undef() {
            return reg.undef();
        }
        match (self.kind(), rhs.kind()) {
            (Int, Int) if int_op_stays_unboxed(op) => reg.int(),
            (Int, Int) => reg.unknown(),
            (Int | Float, Int | Float) if float_op_stays_unboxed(op) => reg.float(),
            _ => reg.unknown(),
        }
    }

    /// Static type of `self <op> rhs` for comparisons
    pub fn compare_type(&self, reg: &TypeRegistry, op: CompareOp, rhs: &TypeRef) -> TypeRef {
        use TypeKind::*;
        if self.is_undef() || rhs.is_undef() {
            return reg.undef();
        }
        match (op, self.kind(), rhs.kind()) {
            (CompareOp::Is | CompareOp::IsNot, _, _) => reg.bool_(),
            (CompareOp::In | CompareOp::NotIn, _, Tuple(_)) => reg.bool_(),
            (CompareOp::In | CompareOp::NotIn, _, _) => reg.unknown(),
            (_, Int | Float, Int | Float) => reg.bool_(),
            _ => reg.unknown(),
        }
    }

    pub fn unaryop_type(&self, reg: &TypeRegistry, op: UnaryOpKind) -> TypeRef {
        use TypeKind::*;
        match (op, self.kind()) {
            (_, Undef) => reg.undef(),
            (UnaryOpKind::Not, _) => reg.bool_(),
            (UnaryOpKind::Pos, Int | Float) => self.clone(),
            (UnaryOpKind::Neg, Float) => reg.float(),
            (UnaryOpKind::Invert, Int) => reg.int(),
            _ => reg.unknown(),
        }
    }

    /// Static type of `self[index]`. `constant` is the index when it is a
    /// compile-time integer.
    pub fn getitem_type(&self, reg: &TypeRegistry, _index: &TypeRef, constant: Option<i64>) -> TypeRef {
        match (self.kind(), constant) {
            (TypeKind::Undef, _) => reg.undef(),
            (TypeKind::Tuple(elts), Some(i)) => match resolve_index(i, elts.len()) {
                Some(i) => elts[i].clone(),
                None => reg.undef(),
            },
            _ => reg.unknown(),
        }
    }

    pub fn nonzero_type(&self, reg: &TypeRegistry) -> TypeRef {
        if self.is_undef() {
            reg.undef()
        } else {
            reg.bool_()
        }
    }
}

/// Int operations whose result is always an int
pub(crate) fn int_op_stays_unboxed(op: BinOpKind) -> bool {
    matches!(op, BinOpKind::BitAnd | BinOpKind::BitOr | BinOpKind::BitXor)
}

/// Int operations done natively with an overflow check. The result is
/// boxed, since an overflowing one comes back from the generic path.
pub(crate) fn int_op_is_checked(op: BinOpKind) -> bool {
    matches!(op, BinOpKind::Add | BinOpKind::Sub | BinOpKind::Mul)
}

/// Float operations kept unboxed (natively or through a float helper)
pub(crate) fn float_op_stays_unboxed(op: BinOpKind) -> bool {
    matches!(
        op,
        BinOpKind::Add
            | BinOpKind::Sub
            | BinOpKind::Mul
            | BinOpKind::Div
            | BinOpKind::FloorDiv
            | BinOpKind::Mod
            | BinOpKind::Pow
    )
}

/// Resolve a possibly negative index against a length
pub(crate) fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { index + len } else { index };
    (0..len).contains(&resolved).then_some(resolved as usize)
}

/// Process-scoped interning table for compile-time types
pub struct TypeRegistry {
    builtins: BuiltinClasses,
    unknown: TypeRef,
    undef: TypeRef,
    int: TypeRef,
    float: TypeRef,
    bool_: TypeRef,
    str_constant: TypeRef,
    closure: TypeRef,
    generator: TypeRef,
    classes: Mutex<FxHashMap<ClassId, TypeRef>>,
    tuples: Mutex<FxHashMap<Vec<usize>, TypeRef>>,
    methods: Mutex<FxHashMap<(usize, FuncId), TypeRef>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::with_builtins(BuiltinClasses::new())
    }

    pub fn with_builtins(builtins: BuiltinClasses) -> Self {
        let mut classes = FxHashMap::default();
        let mut class_type = |cls: &Arc<ClassInfo>| {
            let ty = TypeRef::new(cls.name.to_string(), TypeKind::Class(cls.clone()), None, None);
            classes.insert(cls.id, ty.clone());
            ty
        };
        let boxed_int = class_type(&builtins.int);
        let boxed_float = class_type(&builtins.float);
        let boxed_bool = class_type(&builtins.bool_);
        let str_ = class_type(&builtins.str_);
        for cls in [&builtins.object, &builtins.tuple, &builtins.none, &builtins.function, &builtins.instancemethod] {
            class_type(cls);
        }

        let unknown = TypeRef::new("unknown", TypeKind::Unknown, None, None);
        TypeRegistry {
            undef: TypeRef::new("undef", TypeKind::Undef, Some(unknown.clone()), Some(unknown.clone())),
            int: TypeRef::new("int", TypeKind::Int, None, Some(boxed_int)),
            float: TypeRef::new("float", TypeKind::Float, None, Some(boxed_float)),
            bool_: TypeRef::new("bool", TypeKind::Bool, None, Some(boxed_bool)),
            str_constant: TypeRef::new("str_constant", TypeKind::StrConstant, Some(str_.clone()), Some(str_)),
            closure: TypeRef::new("closure", TypeKind::Closure, None, None),
            generator: TypeRef::new("generator", TypeKind::Generator, None, None),
            unknown,
            builtins,
            classes: Mutex::new(classes),
            tuples: Mutex::new(FxHashMap::default()),
            methods: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn builtins(&self) -> &BuiltinClasses {
        &self.builtins
    }

    pub fn unknown(&self) -> TypeRef {
        self.unknown.clone()
    }

    pub fn undef(&self) -> TypeRef {
        self.undef.clone()
    }

    pub fn int(&self) -> TypeRef {
        self.int.clone()
    }

    pub fn float(&self) -> TypeRef {
        self.float.clone()
    }

    pub fn bool_(&self) -> TypeRef {
        self.bool_.clone()
    }

    pub fn str_constant(&self) -> TypeRef {
        self.str_constant.clone()
    }

    pub fn closure(&self) -> TypeRef {
        self.closure.clone()
    }

    pub fn generator(&self) -> TypeRef {
        self.generator.clone()
    }

    pub fn boxed_int(&self) -> TypeRef {
        self.int.box_type()
    }

    pub fn boxed_float(&self) -> TypeRef {
        self.float.box_type()
    }

    pub fn boxed_bool(&self) -> TypeRef {
        self.bool_.box_type()
    }

    pub fn boxed_tuple(&self) -> TypeRef {
        self.for_class(&self.builtins.tuple)
    }

    pub fn str_(&self) -> TypeRef {
        self.str_constant.box_type()
    }

    pub fn none(&self) -> TypeRef {
        self.for_class(&self.builtins.none)
    }

    pub fn boxed_instancemethod(&self) -> TypeRef {
        self.for_class(&self.builtins.instancemethod)
    }

    /// The type of boxed instances of `cls`; one identity per class
    pub fn for_class(&self, cls: &Arc<ClassInfo>) -> TypeRef {
        self.classes
            .lock()
            .entry(cls.id)
            .or_insert_with(|| TypeRef::new(cls.name.to_string(), TypeKind::Class(cls.clone()), None, None))
            .clone()
    }

    /// One identity per element-type sequence
    pub fn tuple(&self, elts: Vec<TypeRef>) -> TypeRef {
        let key: Vec<usize> = elts.iter().map(|t| t.addr()).collect();
        if let Some(ty) = self.tuples.lock().get(&key) {
            return ty.clone();
        }
        let names: Vec<&str> = elts.iter().map(|t| t.debug_name()).collect();
        let name = format!("tuple({})", names.join(", "));
        let boxed = self.boxed_tuple();
        let ty = TypeRef::new(name, TypeKind::Tuple(elts), Some(boxed.clone()), Some(boxed));
        self.tuples.lock().entry(key).or_insert(ty).clone()
    }

    /// One identity per (object type, function)
    pub fn instance_method(&self, obj: &TypeRef, func: &Arc<FunctionInfo>) -> TypeRef {
        let key = (obj.addr(), func.id);
        if let Some(ty) = self.methods.lock().get(&key) {
            return ty.clone();
        }
        let name = format!("instancemethod({}.{})", obj.debug_name(), func.name);
        let boxed = self.boxed_instancemethod();
        let kind = TypeKind::InstanceMethod { obj: obj.clone(), func: func.clone() };
        let ty = TypeRef::new(name, kind, Some(boxed.clone()), Some(boxed));
        self.methods.lock().entry(key).or_insert(ty).clone()
    }

    /// Every singleton and builtin class type
    pub fn all_basic_types(&self) -> Vec<TypeRef> {
        let mut types = vec![
            self.unknown(),
            self.undef(),
            self.int(),
            self.float(),
            self.bool_(),
            self.str_constant(),
            self.closure(),
            self.generator(),
        ];
        types.extend(self.classes.lock().values().cloned());
        types
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("classes", &self.classes.lock().len())
            .field("tuples", &self.tuples.lock().len())
            .finish()
    }
}
