//! Operations on compiler variables
//!
//! Each operation dispatches on the variable's type kind. Types with a fast
//! path emit specialized code; everything else converts to the boxed
//! representation and calls the generic runtime entry point. Undef
//! propagates without emitting code. Closure and generator pointers support
//! no operations at all.

mod class;
mod generic;
mod numeric;
mod tuple;

use super::types::{TypeKind, TypeRef};
use super::var::{VarRef, VarValue};
use crate::cfg::{BinOpKind, CompareOp, UnaryOpKind};
use crate::ir::{IrType, RefType};
use crate::irgen::IrEmitter;

/// Options for `callattr`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallattrFlags {
    /// Report a provably missing attribute as `None` instead of raising
    pub null_on_missing: bool,
}

fn unsupported(var: &VarRef, op: &str) -> ! {
    crate::ice!("{} not supported on {}", op, var.ty().debug_name())
}

fn undef_var(em: &IrEmitter<'_>) -> VarRef {
    VarRef::new(em.types().undef(), VarValue::Undef)
}

fn is_pointer_kind(ty: &TypeRef) -> bool {
    matches!(ty.kind(), TypeKind::Closure | TypeKind::Generator)
}

impl VarRef {
    /// Convert to `other`, which `can_convert_to` must allow
    pub fn make_converted(&self, em: &mut IrEmitter<'_>, other: &TypeRef) -> VarRef {
        if self.ty() == other {
            return self.clone();
        }
        if !self.ty().can_convert_to(other) {
            crate::ice!("cannot convert {} to {}", self.ty(), other);
        }
        match self.ty().kind() {
            TypeKind::Undef => undef_as(em, other),
            TypeKind::Int | TypeKind::Float => VarRef::ir(other.clone(), numeric::box_lazy(self, em)),
            TypeKind::Bool => VarRef::ir(other.clone(), numeric::box_bool(self, em)),
            TypeKind::Class(_) => match other.kind() {
                TypeKind::Int | TypeKind::Float => numeric::unbox(self, em, other),
                _ => VarRef::ir(other.clone(), self.ir_value()),
            },
            TypeKind::StrConstant => match self.value() {
                VarValue::StrConstant(s) => {
                    let s = s.clone();
                    VarRef::ir(other.clone(), em.str_const(&s))
                }
                v => crate::ice!("str constant holds {:?}", v),
            },
            TypeKind::Tuple(_) => tuple::convert(self, em, other),
            TypeKind::InstanceMethod { .. } => VarRef::ir(other.clone(), class::box_instance_method(self, em)),
            TypeKind::Unknown | TypeKind::Closure | TypeKind::Generator => unsupported(self, "conversion"),
        }
    }

    /// The boxed object for this value
    pub fn boxed(&self, em: &mut IrEmitter<'_>) -> VarRef {
        let unknown = em.types().unknown();
        self.make_converted(em, &unknown)
    }

    /// The value as a single IR value of its concrete type
    pub fn concrete_value(&self, em: &mut IrEmitter<'_>) -> VarRef {
        let concrete = self.ty().concrete();
        self.make_converted(em, &concrete)
    }

    pub fn getattr(&self, em: &mut IrEmitter<'_>, attr: &str) -> VarRef {
        match self.ty().kind() {
            TypeKind::Undef => undef_var(em),
            TypeKind::Unknown => generic::getattr(self, em, attr),
            TypeKind::Class(_) => class::getattr(self, em, attr),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "getattr"),
            _ => generic::getattr(&self.boxed(em), em, attr),
        }
    }

    pub fn setattr(&self, em: &mut IrEmitter<'_>, attr: &str, value: &VarRef) {
        match self.ty().kind() {
            TypeKind::Undef => {}
            _ if is_pointer_kind(self.ty()) => unsupported(self, "setattr"),
            _ => {
                let target = self.boxed(em);
                generic::setattr(&target, em, attr, value)
            }
        }
    }

    pub fn call(&self, em: &mut IrEmitter<'_>, args: &[VarRef]) -> VarRef {
        match self.ty().kind() {
            TypeKind::Undef => undef_var(em),
            TypeKind::Unknown => generic::call(self, em, args),
            TypeKind::InstanceMethod { .. } => class::call_instance_method(self, em, args),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "call"),
            _ => generic::call(&self.boxed(em), em, args),
        }
    }

    /// `self.attr(args)`. Returns `None` only when `flags.null_on_missing`
    /// is set and the attribute provably does not exist.
    pub fn callattr(&self, em: &mut IrEmitter<'_>, attr: &str, args: &[VarRef], flags: CallattrFlags) -> Option<VarRef> {
        match self.ty().kind() {
            TypeKind::Undef => Some(undef_var(em)),
            TypeKind::Unknown => Some(generic::callattr(self, em, attr, args)),
            TypeKind::Class(_) => class::callattr(self, em, attr, args, flags),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "callattr"),
            _ => Some(generic::callattr(&self.boxed(em), em, attr, args)),
        }
    }

    pub fn binexp(&self, em: &mut IrEmitter<'_>, op: BinOpKind, rhs: &VarRef) -> VarRef {
        if self.ty().is_undef() || rhs.ty().is_undef() {
            return undef_var(em);
        }
        if is_pointer_kind(self.ty()) || is_pointer_kind(rhs.ty()) {
            unsupported(self, "binexp");
        }
        match (self.ty().kind(), rhs.ty().kind()) {
            (TypeKind::Int | TypeKind::Float, TypeKind::Int | TypeKind::Float) => numeric::binexp(self, em, op, rhs),
            _ => generic::binexp(self, em, op, rhs),
        }
    }

    pub fn compare(&self, em: &mut IrEmitter<'_>, op: CompareOp, rhs: &VarRef) -> VarRef {
        if self.ty().is_undef() || rhs.ty().is_undef() {
            return undef_var(em);
        }
        if is_pointer_kind(self.ty()) || is_pointer_kind(rhs.ty()) {
            unsupported(self, "compare");
        }
        match (op, self.ty().kind(), rhs.ty().kind()) {
            (CompareOp::Is | CompareOp::IsNot, _, _) => generic::identity(self, em, op, rhs),
            (CompareOp::In | CompareOp::NotIn, _, TypeKind::Tuple(_)) => {
                let found = rhs.contains(em, self);
                if op == CompareOp::NotIn {
                    numeric::negate(&found, em)
                } else {
                    found
                }
            }
            (CompareOp::In | CompareOp::NotIn, _, _) => generic::compare(self, em, op, rhs),
            (_, TypeKind::Int | TypeKind::Float, TypeKind::Int | TypeKind::Float) => {
                numeric::compare(self, em, op, rhs)
            }
            _ => generic::compare(self, em, op, rhs),
        }
    }

    pub fn unaryop(&self, em: &mut IrEmitter<'_>, op: UnaryOpKind) -> VarRef {
        match (op, self.ty().kind()) {
            (_, TypeKind::Undef) => undef_var(em),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "unaryop"),
            (UnaryOpKind::Not, _) => {
                let truth = self.nonzero(em);
                numeric::negate(&truth, em)
            }
            (UnaryOpKind::Pos, TypeKind::Int | TypeKind::Float) => self.clone(),
            (UnaryOpKind::Neg, TypeKind::Int) => numeric::int_neg(self, em),
            (UnaryOpKind::Neg, TypeKind::Float) => numeric::float_neg(self, em),
            (UnaryOpKind::Invert, TypeKind::Int) => numeric::int_invert(self, em),
            _ => generic::unaryop(&self.boxed(em), em, op),
        }
    }

    /// Truth value, as a `bool` variable
    pub fn nonzero(&self, em: &mut IrEmitter<'_>) -> VarRef {
        match self.ty().kind() {
            TypeKind::Undef => undef_var(em),
            TypeKind::Bool => self.clone(),
            TypeKind::Int | TypeKind::Float => numeric::nonzero(self, em),
            TypeKind::Tuple(elts) => {
                let truth = em.builder().const_bool(!elts.is_empty());
                VarRef::ir(em.types().bool_(), truth)
            }
            TypeKind::Class(_) => class::nonzero(self, em),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "nonzero"),
            _ => generic::nonzero(&self.boxed(em), em),
        }
    }

    pub fn hasnext(&self, em: &mut IrEmitter<'_>) -> VarRef {
        match self.ty().kind() {
            TypeKind::Undef => undef_var(em),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "hasnext"),
            _ => generic::hasnext(&self.boxed(em), em),
        }
    }

    pub fn getitem(&self, em: &mut IrEmitter<'_>, index: &VarRef) -> VarRef {
        if self.ty().is_undef() || index.ty().is_undef() {
            return undef_var(em);
        }
        match self.ty().kind() {
            TypeKind::Tuple(_) => tuple::getitem(self, em, index),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "getitem"),
            _ => generic::getitem(&self.boxed(em), em, index),
        }
    }

    pub fn len(&self, em: &mut IrEmitter<'_>) -> VarRef {
        match self.ty().kind() {
            TypeKind::Undef => undef_var(em),
            TypeKind::Tuple(elts) => numeric::int_constant(em, elts.len() as i64),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "len"),
            _ => generic::len(&self.boxed(em), em),
        }
    }

    /// `needle in self`
    pub fn contains(&self, em: &mut IrEmitter<'_>, needle: &VarRef) -> VarRef {
        match self.ty().kind() {
            TypeKind::Undef => undef_var(em),
            TypeKind::Tuple(_) => tuple::contains(self, em, needle),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "contains"),
            _ => {
                let container = self.boxed(em);
                generic::compare(needle, em, CompareOp::In, &container)
            }
        }
    }

    /// Iterator over the value, with `hasnext` support
    pub fn get_pyston_iter(&self, em: &mut IrEmitter<'_>) -> VarRef {
        match self.ty().kind() {
            TypeKind::Undef => undef_var(em),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "iteration"),
            _ => generic::get_pyston_iter(&self.boxed(em), em),
        }
    }

    /// Destructure into exactly `n` values
    pub fn unpack(&self, em: &mut IrEmitter<'_>, n: usize) -> Vec<VarRef> {
        match (self.ty().kind(), self.value()) {
            (TypeKind::Undef, _) => (0..n).map(|_| undef_var(em)).collect(),
            (TypeKind::Tuple(elts), VarValue::Tuple(vals)) if elts.len() == n => vals.clone(),
            _ if is_pointer_kind(self.ty()) => unsupported(self, "unpack"),
            _ => generic::unpack(&self.boxed(em), em, n),
        }
    }
}

/// A well-typed value with an unspecified bit pattern
fn undef_as(em: &mut IrEmitter<'_>, other: &TypeRef) -> VarRef {
    match other.kind() {
        TypeKind::Tuple(elts) => {
            let elts = elts.iter().map(|t| undef_as(em, t)).collect();
            VarRef::new(other.clone(), VarValue::Tuple(elts))
        }
        TypeKind::StrConstant | TypeKind::InstanceMethod { .. } => {
            crate::ice!("undef cannot stand in for {}", other)
        }
        _ => {
            let ty = other.ir_type();
            let v = if ty == IrType::Obj {
                em.null_obj()
            } else {
                em.builder().undef(ty)
            };
            VarRef::ir(other.clone(), v)
        }
    }
}

/// Object result of a runtime call, as an unknown variable
fn unknown_result(em: &IrEmitter<'_>, v: crate::ir::Value) -> VarRef {
    debug_assert!(em.func().ref_info(v).map(|i| i.ref_type) == Some(RefType::Owned));
    VarRef::ir(em.types().unknown(), v)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::class::call_function_direct;
    use super::*;
    use crate::compvars::{TypeRegistry, UnboxedVal};
    use crate::config::JitConfig;
    use crate::ir::{Callee, Instr, IrFunction, Terminator};
    use crate::profiling::EffortLevel;
    use crate::runtime::object::{ClassAttr, ClassId, FuncId};
    use crate::runtime::{
        ClassInfo, CodeRef, CompiledFunction, ExceptionStyle, FunctionInfo, FunctionSpecialization, RuntimeFn,
    };

    fn emitter<'a>(types: &'a TypeRegistry, config: &'a JitConfig, params: &[IrType]) -> IrEmitter<'a> {
        IrEmitter::new(IrFunction::new("f", params, IrType::Obj), types, config, ExceptionStyle::Cxx)
    }

    fn calls_to(func: &IrFunction, pred: impl Fn(&Callee) -> bool) -> usize {
        func.blocks
            .iter()
            .flat_map(|b| &b.instrs)
            .filter(|i| matches!(i, Instr::Call { callee, .. } if pred(callee)))
            .count()
    }

    fn int_const(em: &mut IrEmitter<'_>, n: i64) -> VarRef {
        let v = em.builder().const_int(n);
        VarRef::new(em.types().int(), VarValue::Unboxed(UnboxedVal::new(v, Some(n))))
    }

    fn point_class(types: &TypeRegistry) -> (Arc<ClassInfo>, Arc<FunctionInfo>, TypeRef) {
        let cls = ClassInfo::new(ClassId(20), "Point", true);
        let norm = FunctionInfo::new(FuncId(3), "norm", 1, vec![]);
        cls.set_attr("norm", ClassAttr::Function(norm.clone()));
        cls.set_attr("x", ClassAttr::Value);
        let ty = types.for_class(&cls);
        (cls, norm, ty)
    }

    #[test]
    fn test_int_constants_fold() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[]);
        let a = int_const(&mut em, 6);
        let b = int_const(&mut em, 7);
        let product = a.binexp(&mut em, BinOpKind::Mul, &b);
        assert_eq!(product.int_constant(), Some(42));
        let inverted = product.unaryop(&mut em, UnaryOpKind::Invert);
        assert_eq!(inverted.int_constant(), Some(!42));
    }

    #[test]
    fn test_int_true_division_is_generic() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[IrType::I64, IrType::I64]);
        let a = VarRef::ir(types.int(), em.func().param(0));
        let b = VarRef::ir(types.int(), em.func().param(1));
        let q = a.binexp(&mut em, BinOpKind::Div, &b);
        assert!(q.ty().is_unknown());
        assert_eq!(calls_to(em.func(), |c| *c == Callee::Runtime(RuntimeFn::Binop(ExceptionStyle::Cxx))), 1);
    }

    #[test]
    fn test_mixed_numeric_promotes_to_float() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[IrType::I64, IrType::F64]);
        let a = VarRef::ir(types.int(), em.func().param(0));
        let b = VarRef::ir(types.float(), em.func().param(1));
        let sum = a.binexp(&mut em, BinOpKind::Add, &b);
        let quotient = a.binexp(&mut em, BinOpKind::Div, &b);
        assert_eq!(sum.ty(), &types.float());
        assert_eq!(quotient.ty(), &types.float());
        let func = em.into_func();
        assert_eq!(calls_to(&func, |c| *c == Callee::Runtime(RuntimeFn::FloatDiv)), 1);
        assert!(func.blocks[0].instrs.iter().any(|i| matches!(i, Instr::IntToFloat { .. })));
    }

    #[test]
    fn test_int_negation_has_overflow_arm() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[IrType::I64]);
        let a = VarRef::ir(types.int(), em.func().param(0));
        let neg = a.unaryop(&mut em, UnaryOpKind::Neg);
        assert!(neg.ty().is_unknown());
        let join = em.current_block();
        let func = em.into_func();
        assert_eq!(func.block(join).phi_count(), 1);
        assert_eq!(func.ref_info(neg.ir_value()).map(|i| i.ref_type), Some(RefType::Owned));
        assert_eq!(calls_to(&func, |c| *c == Callee::Runtime(RuntimeFn::Unaryop(ExceptionStyle::Cxx))), 1);
    }

    #[test]
    fn test_overflowing_constants_take_the_generic_path() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[]);
        let a = int_const(&mut em, i64::MAX);
        let b = int_const(&mut em, 1);
        let sum = a.binexp(&mut em, BinOpKind::Add, &b);
        assert!(sum.ty().is_unknown());
        assert_eq!(sum.int_constant(), None);
        let a = int_const(&mut em, i64::MIN);
        let b = int_const(&mut em, 2);
        let product = a.binexp(&mut em, BinOpKind::Mul, &b);
        assert!(product.ty().is_unknown());
        assert_eq!(calls_to(em.func(), |c| *c == Callee::Runtime(RuntimeFn::Binop(ExceptionStyle::Cxx))), 2);
    }

    #[test]
    fn test_int_arithmetic_checks_overflow() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        for op in [BinOpKind::Add, BinOpKind::Sub, BinOpKind::Mul] {
            let mut em = emitter(&types, &config, &[IrType::I64, IrType::I64]);
            let a = VarRef::ir(types.int(), em.func().param(0));
            let b = VarRef::ir(types.int(), em.func().param(1));
            let result = a.binexp(&mut em, op, &b);
            assert!(result.ty().is_unknown());
            let join = em.current_block();
            let func = em.into_func();
            assert_eq!(func.block(join).phi_count(), 1);
            assert_eq!(func.ref_info(result.ir_value()).map(|i| i.ref_type), Some(RefType::Owned));
            let checks = func.blocks.iter().flat_map(|b| &b.instrs).filter(|i| matches!(i, Instr::IntOverflows { .. }));
            assert_eq!(checks.count(), 1);
            // slow arm redoes the operation boxed, fast arm boxes the native result
            assert_eq!(calls_to(&func, |c| *c == Callee::Runtime(RuntimeFn::Binop(ExceptionStyle::Cxx))), 1);
            assert_eq!(calls_to(&func, |c| *c == Callee::Runtime(RuntimeFn::BoxInt)), 3);
        }
    }

    #[test]
    fn test_bitwise_int_ops_stay_native() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[IrType::I64, IrType::I64]);
        let a = VarRef::ir(types.int(), em.func().param(0));
        let b = VarRef::ir(types.int(), em.func().param(1));
        let result = a.binexp(&mut em, BinOpKind::BitAnd, &b);
        assert_eq!(result.ty(), &types.int());
        assert_eq!(calls_to(em.func(), |_| true), 0);
    }

    #[test]
    fn test_is_compares_pointers() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[IrType::Obj, IrType::Obj]);
        let a = VarRef::ir(types.unknown(), em.func().param(0));
        let b = VarRef::ir(types.unknown(), em.func().param(1));
        let same = a.compare(&mut em, CompareOp::Is, &b);
        assert_eq!(same.ty(), &types.bool_());
        assert_eq!(calls_to(em.func(), |_| true), 0);
    }

    #[test]
    fn test_tuple_membership_joins_in_a_bool_phi() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[IrType::Obj, IrType::Obj, IrType::Obj]);
        let needle = VarRef::ir(types.unknown(), em.func().param(0));
        let elts = vec![
            VarRef::ir(types.unknown(), em.func().param(1)),
            VarRef::ir(types.unknown(), em.func().param(2)),
        ];
        let tuple = VarRef::new(types.tuple(vec![types.unknown(); 2]), VarValue::Tuple(elts));
        let found = needle.compare(&mut em, CompareOp::In, &tuple);
        assert_eq!(found.ty(), &types.bool_());
        let join = em.current_block();
        let func = em.into_func();
        match &func.block(join).instrs[0] {
            // two identity hits, two equality hits, one miss
            Instr::Phi { incoming, .. } => assert_eq!(incoming.len(), 5),
            other => panic!("expected phi, got {:?}", other),
        }
    }

    #[test]
    fn test_not_in_negates_membership() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[IrType::Obj]);
        let needle = VarRef::ir(types.unknown(), em.func().param(0));
        let empty = VarRef::new(types.tuple(vec![]), VarValue::Tuple(vec![]));
        let missing = needle.compare(&mut em, CompareOp::NotIn, &empty);
        assert_eq!(missing.ty(), &types.bool_());
        let func = em.into_func();
        assert!(func.blocks[0].instrs.iter().any(|i| matches!(i, Instr::Not { .. })));
    }

    #[test]
    fn test_closed_class_method_stays_unbound() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let (_cls, norm, ty) = point_class(&types);
        let mut em = emitter(&types, &config, &[IrType::Obj]);
        let p = VarRef::ir(ty.clone(), em.func().param(0));
        let m = p.getattr(&mut em, "norm");
        assert_eq!(m.ty(), &types.instance_method(&ty, &norm));
        assert!(matches!(m.value(), VarValue::InstanceMethod { obj } if obj.same_var(&p)));
        assert_eq!(calls_to(em.func(), |_| true), 0);
    }

    #[test]
    fn test_closed_class_missing_attribute_raises() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let (_cls, _norm, ty) = point_class(&types);
        let mut em = emitter(&types, &config, &[IrType::Obj]);
        let p = VarRef::ir(ty, em.func().param(0));
        let missing = p.getattr(&mut em, "z");
        assert!(missing.ty().is_undef());
        let flags = CallattrFlags { null_on_missing: true };
        assert!(p.callattr(&mut em, "z", &[], flags).is_none());
        let func = em.into_func();
        assert_eq!(calls_to(&func, |c| *c == Callee::Runtime(RuntimeFn::RaiseAttributeError)), 1);
        assert_eq!(func.blocks[func.entry.index()].terminator, Terminator::Unreachable);
    }

    #[test]
    fn test_method_call_uses_compiled_version() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let (_cls, norm, ty) = point_class(&types);
        let spec = FunctionSpecialization { arg_types: vec![ty.clone()], ret_type: types.unknown() };
        let version = CompiledFunction::new(
            CodeRef::fresh(),
            "norm".to_string(),
            spec,
            ExceptionStyle::Cxx,
            EffortLevel::Minimal,
            None,
            vec![],
            IrFunction::new("norm", &[IrType::Obj], IrType::Obj),
        );
        let code_ref = version.code_ref;
        norm.add_version(Arc::new(version));

        let mut em = emitter(&types, &config, &[IrType::Obj]);
        let p = VarRef::ir(ty, em.func().param(0));
        let r = p.callattr(&mut em, "norm", &[], CallattrFlags::default());
        assert!(r.is_some_and(|r| r.ty().is_unknown()));
        let func = em.into_func();
        assert_eq!(calls_to(&func, |c| *c == Callee::Direct(code_ref)), 1);
    }

    #[test]
    fn test_direct_call_prefers_specialized_version() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let (_cls, norm, ty) = point_class(&types);
        let version = |spec, style| {
            Arc::new(CompiledFunction::new(
                CodeRef::fresh(),
                "norm".to_string(),
                spec,
                style,
                EffortLevel::Minimal,
                None,
                vec![],
                IrFunction::new("norm", &[IrType::Obj], IrType::Obj),
            ))
        };
        let generic = version(FunctionSpecialization::generic(&types, 1), ExceptionStyle::Cxx);
        let specialized = version(
            FunctionSpecialization { arg_types: vec![ty.clone()], ret_type: types.unknown() },
            ExceptionStyle::Capi,
        );
        norm.add_version(generic.clone());
        norm.add_version(specialized.clone());

        let direct_target = |norm: &FunctionInfo| {
            let mut em = emitter(&types, &config, &[IrType::Obj]);
            let p = VarRef::ir(ty.clone(), em.func().param(0));
            assert!(call_function_direct(&mut em, norm, &[p]).is_some());
            let func = em.into_func();
            let direct: Vec<CodeRef> = func
                .blocks
                .iter()
                .flat_map(|b| &b.instrs)
                .filter_map(|i| match i {
                    Instr::Call { callee: Callee::Direct(c), .. } => Some(*c),
                    _ => None,
                })
                .collect();
            direct
        };
        assert_eq!(direct_target(&norm), vec![specialized.code_ref]);

        // once retired, only the generic version is left to bind
        assert!(norm.retire_version(specialized.code_ref));
        assert_eq!(direct_target(&norm), vec![generic.code_ref]);
    }

    #[test]
    fn test_method_call_without_version_goes_generic() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let (_cls, _norm, ty) = point_class(&types);
        let mut em = emitter(&types, &config, &[IrType::Obj]);
        let p = VarRef::ir(ty, em.func().param(0));
        let m = p.getattr(&mut em, "norm");
        m.call(&mut em, &[]);
        let func = em.into_func();
        assert_eq!(calls_to(&func, |c| *c == Callee::Runtime(RuntimeFn::BoxInstanceMethod)), 1);
        assert_eq!(
            calls_to(&func, |c| matches!(c, Callee::Runtime(RuntimeFn::RuntimeCall(_, ExceptionStyle::Cxx)))),
            1
        );
    }

    #[test]
    fn test_closed_class_without_bool_or_len_is_true() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let (_cls, _norm, ty) = point_class(&types);
        let mut em = emitter(&types, &config, &[IrType::Obj]);
        let p = VarRef::ir(ty, em.func().param(0));
        let truth = p.nonzero(&mut em);
        assert_eq!(truth.ty(), &types.bool_());
        assert_eq!(calls_to(em.func(), |_| true), 0);
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn test_closure_pointer_rejects_attribute_access() {
        let types = TypeRegistry::new();
        let config = JitConfig::default();
        let mut em = emitter(&types, &config, &[IrType::RawPtr]);
        let c = VarRef::ir(types.closure(), em.func().param(0));
        c.getattr(&mut em, "x");
    }
}
