//! Compiler variables
//!
//! A `VarRef` pairs a type with the native value(s) standing for it during
//! emission. Handles are reference counted at compile time: the number of
//! live handles is the variable's `vrefs`, and the handle count reaching
//! zero drops the variable (never the runtime object it describes).

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::types::{TypeKind, TypeRef};
use crate::ir::{IrType, Value};
use crate::irgen::IrEmitter;

/// Unboxed value plus a box created on demand and shared by duplicates
#[derive(Debug, Clone)]
pub struct UnboxedVal {
    pub unboxed: Value,
    /// Compile-time integer value, when known
    pub constant: Option<i64>,
    boxed: Rc<RefCell<Option<Value>>>,
}

impl UnboxedVal {
    pub fn new(unboxed: Value, constant: Option<i64>) -> Self {
        UnboxedVal { unboxed, constant, boxed: Rc::new(RefCell::new(None)) }
    }

    /// An unboxed value whose box already exists
    pub fn with_box(unboxed: Value, boxed: Value) -> Self {
        UnboxedVal { unboxed, constant: None, boxed: Rc::new(RefCell::new(Some(boxed))) }
    }

    pub fn cached_box(&self) -> Option<Value> {
        *self.boxed.borrow()
    }

    pub fn cache_box(&self, boxed: Value) {
        *self.boxed.borrow_mut() = Some(boxed);
    }

    /// Same value with its own box cell, seeded with the current contents
    fn fork(&self) -> Self {
        UnboxedVal { boxed: Rc::new(RefCell::new(self.cached_box())), ..self.clone() }
    }

    pub fn shares_box_with(&self, other: &UnboxedVal) -> bool {
        Rc::ptr_eq(&self.boxed, &other.boxed)
    }
}

/// What a variable's native representation is
#[derive(Debug, Clone)]
pub enum VarValue {
    /// A single IR value of the type's concrete machine type
    Ir(Value),
    Unboxed(UnboxedVal),
    /// Elements of a tuple that has not been allocated
    Tuple(Vec<VarRef>),
    StrConstant(Arc<str>),
    /// Receiver of a method that has not been bound
    InstanceMethod { obj: VarRef },
    /// No runtime value
    Undef,
}

#[derive(Debug)]
pub struct CompilerVariable {
    ty: TypeRef,
    value: VarValue,
    grabbed: Cell<bool>,
}

/// Handle to a compiler variable
#[derive(Debug, Clone)]
pub struct VarRef(Rc<CompilerVariable>);

/// Memo for `VarRef::dup`, keyed by variable identity
pub type DupCache = FxHashMap<usize, VarRef>;

impl VarRef {
    pub fn new(ty: TypeRef, value: VarValue) -> Self {
        VarRef(Rc::new(CompilerVariable { ty, value, grabbed: Cell::new(false) }))
    }

    /// A variable held in one IR value
    pub fn ir(ty: TypeRef, v: Value) -> Self {
        if ty.has_lazy_box() {
            return Self::new(ty, VarValue::Unboxed(UnboxedVal::new(v, None)));
        }
        Self::new(ty, VarValue::Ir(v))
    }

    pub fn ty(&self) -> &TypeRef {
        &self.0.ty
    }

    pub fn value(&self) -> &VarValue {
        &self.0.value
    }

    fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    /// Whether both handles refer to the same variable
    pub fn same_var(&self, other: &VarRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles
    pub fn vrefs(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn is_grabbed(&self) -> bool {
        self.0.grabbed.get()
    }

    pub fn ensure_grabbed(&self) {
        self.0.grabbed.set(true);
    }

    /// The single IR value for a concrete machine type. Unboxed variables
    /// yield their unboxed value.
    pub fn ir_value(&self) -> Value {
        match self.value() {
            VarValue::Ir(v) => *v,
            VarValue::Unboxed(u) => u.unboxed,
            other => crate::ice!("{} has no single IR value ({:?})", self.ty(), other),
        }
    }

    pub fn unboxed(&self) -> &UnboxedVal {
        match self.value() {
            VarValue::Unboxed(u) => u,
            _ => crate::ice!("{} is not an unboxed variable", self.ty()),
        }
    }

    /// Compile-time integer, when known
    pub fn int_constant(&self) -> Option<i64> {
        match self.value() {
            VarValue::Unboxed(u) if matches!(self.ty().kind(), TypeKind::Int) => u.constant,
            _ => None,
        }
    }

    /// Hand this handle to one of several independent continuations. The
    /// sole handle is returned as is; otherwise this handle's share is
    /// given up for a fresh handle whose lazy state no longer aliases the
    /// other continuations'.
    pub fn split(self) -> VarRef {
        if self.vrefs() == 1 {
            self.ensure_grabbed();
            return self;
        }
        let forked = self.fork();
        drop(self);
        forked
    }

    /// Independent handle over the same value, with private lazy state
    pub fn fork(&self) -> VarRef {
        let value = match self.value() {
            VarValue::Unboxed(u) => VarValue::Unboxed(u.fork()),
            VarValue::Tuple(elts) => VarValue::Tuple(elts.iter().map(|e| e.fork()).collect()),
            VarValue::InstanceMethod { obj } => VarValue::InstanceMethod { obj: obj.fork() },
            other => other.clone(),
        };
        let forked = VarRef::new(self.ty().clone(), value);
        forked.ensure_grabbed();
        forked
    }

    /// Duplicate for use in a parallel context. A variable reachable twice
    /// through `cache` is duplicated once. Unboxed parts are copied; a lazy
    /// box is shared.
    pub fn dup(&self, cache: &mut DupCache) -> VarRef {
        if let Some(d) = cache.get(&self.id()) {
            return d.clone();
        }
        let value = match self.value() {
            VarValue::Tuple(elts) => VarValue::Tuple(elts.iter().map(|e| e.dup(cache)).collect()),
            VarValue::InstanceMethod { obj } => VarValue::InstanceMethod { obj: obj.dup(cache) },
            other => other.clone(),
        };
        let d = VarRef::new(self.ty().clone(), value);
        if self.is_grabbed() {
            d.ensure_grabbed();
        }
        cache.insert(self.id(), d.clone());
        d
    }

    /// Spill into 8-byte frame slots, exactly `num_frame_args` of them
    pub fn serialize_to_frame(&self, em: &mut IrEmitter<'_>, out: &mut Vec<Value>) {
        let before = out.len();
        match self.value() {
            VarValue::Ir(v) => {
                let v = *v;
                let slot = match em.func().value_type(v) {
                    IrType::Obj => v,
                    _ => em.builder().bitcast(v),
                };
                out.push(slot);
            }
            VarValue::Unboxed(u) => match u.cached_box() {
                Some(boxed) => {
                    let disc = em.builder().const_int(FRAME_BOXED);
                    out.extend([disc, boxed]);
                }
                None => {
                    let disc = em.builder().const_int(FRAME_UNBOXED);
                    let bits = em.builder().bitcast(u.unboxed);
                    out.extend([disc, bits]);
                }
            },
            other => crate::ice!("cannot spill {} ({:?}) to a frame", self.ty(), other),
        }
        let written = out.len() - before;
        if written != self.ty().num_frame_args() {
            crate::ice!("{} wrote {} frame slots, declares {}", self.ty(), written, self.ty().num_frame_args());
        }
    }
}

/// Discriminant slot values for lazily boxed types
pub const FRAME_UNBOXED: i64 = 0;
pub const FRAME_BOXED: i64 = 1;

/// A value reconstructed from frame slots
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Pointer to a boxed object
    Object(u64),
}

/// Rebuild a value of concrete type `ty` from the front of `slots`.
/// Returns the value and the number of slots consumed.
pub fn deserialize_from_frame(ty: &TypeRef, slots: &[u64]) -> (FrameValue, usize) {
    let n = ty.num_frame_args();
    if slots.len() < n {
        crate::ice!("{} needs {} frame slots, {} left", ty, n, slots.len());
    }
    let value = match ty.kind() {
        TypeKind::Int | TypeKind::Float if slots[0] == FRAME_BOXED as u64 => FrameValue::Object(slots[1]),
        TypeKind::Int => FrameValue::Int(slots[1] as i64),
        TypeKind::Float => FrameValue::Float(f64::from_bits(slots[1])),
        TypeKind::Bool => FrameValue::Bool(slots[0] & 1 != 0),
        _ => FrameValue::Object(slots[0]),
    };
    (value, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compvars::TypeRegistry;

    #[test]
    fn test_split_sole_handle_is_identity() {
        let reg = TypeRegistry::new();
        let v = VarRef::ir(reg.unknown(), Value(0));
        let id = v.id();
        let s = v.split();
        assert!(s.is_grabbed());
        assert_eq!(s.vrefs(), 1);
        assert_eq!(s.id(), id);
    }

    #[test]
    fn test_split_shared_handle_forks_lazy_box() {
        let reg = TypeRegistry::new();
        let v = VarRef::ir(reg.int(), Value(1));
        let other = v.clone();
        assert_eq!(other.vrefs(), 2);
        let s = v.split();
        assert_eq!(other.vrefs(), 1);
        assert!(!s.same_var(&other));
        assert!(s.is_grabbed());
        s.unboxed().cache_box(Value(9));
        assert_eq!(other.unboxed().cached_box(), None);
    }

    #[test]
    fn test_ensure_grabbed_idempotent() {
        let reg = TypeRegistry::new();
        let v = VarRef::ir(reg.unknown(), Value(0));
        v.ensure_grabbed();
        v.ensure_grabbed();
        assert!(v.is_grabbed());
    }

    #[test]
    fn test_dup_shares_box_and_dedups() {
        let reg = TypeRegistry::new();
        let a = VarRef::ir(reg.int(), Value(3));
        let t = VarRef::new(reg.tuple(vec![reg.int(), reg.int()]), VarValue::Tuple(vec![a.clone(), a.clone()]));
        let mut cache = DupCache::default();
        let d = t.dup(&mut cache);
        let VarValue::Tuple(elts) = d.value() else { panic!("expected tuple") };
        assert!(elts[0].same_var(&elts[1]));
        assert!(!elts[0].same_var(&a));
        assert!(elts[0].unboxed().shares_box_with(a.unboxed()));
        // a second dup through the same cache returns the same duplicate
        assert!(t.dup(&mut cache).same_var(&d));
    }

    #[test]
    fn test_deserialize_lazy_int() {
        let reg = TypeRegistry::new();
        assert_eq!(deserialize_from_frame(&reg.int(), &[0, 42, 7]), (FrameValue::Int(42), 2));
        assert_eq!(deserialize_from_frame(&reg.int(), &[1, 0x1000]), (FrameValue::Object(0x1000), 2));
        let bits = 2.5f64.to_bits();
        assert_eq!(deserialize_from_frame(&reg.float(), &[0, bits]), (FrameValue::Float(2.5), 2));
        assert_eq!(deserialize_from_frame(&reg.bool_(), &[1]), (FrameValue::Bool(true), 1));
        assert_eq!(deserialize_from_frame(&reg.unknown(), &[0x2000]), (FrameValue::Object(0x2000), 1));
    }
}
