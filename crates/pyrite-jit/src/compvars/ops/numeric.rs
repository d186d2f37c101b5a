//! Unboxed int, float and bool fast paths

use super::super::types::{float_op_stays_unboxed, int_op_is_checked, int_op_stays_unboxed, TypeKind, TypeRef};
use super::super::var::{UnboxedVal, VarRef, VarValue};
use super::generic;
use crate::cfg::{BinOpKind, CompareOp, UnaryOpKind};
use crate::ir::{CmpCond, FloatBinOp, IntBinOp, IrType, Value};
use crate::irgen::IrEmitter;
use crate::runtime::object::{FLOAT_VALUE_OFFSET, INT_VALUE_OFFSET, SMALL_INT_RANGE};
use crate::runtime::{GlobalRef, RuntimeFn};

/// An int variable with a known value
pub(super) fn int_constant(em: &mut IrEmitter<'_>, n: i64) -> VarRef {
    let v = em.builder().const_int(n);
    VarRef::new(em.types().int(), VarValue::Unboxed(UnboxedVal::new(v, Some(n))))
}

/// The boxed form, created on first request and reused afterwards
pub(super) fn box_lazy(var: &VarRef, em: &mut IrEmitter<'_>) -> Value {
    let u = var.unboxed();
    if let Some(boxed) = u.cached_box() {
        return boxed;
    }
    let boxed = box_uncached(em, var.ty(), u);
    u.cache_box(boxed);
    boxed
}

/// Box without touching the cache, for code that does not dominate later uses
fn box_uncached(em: &mut IrEmitter<'_>, ty: &TypeRef, u: &UnboxedVal) -> Value {
    match ty.kind() {
        TypeKind::Int => match u.constant {
            // canonical small ints are borrowed from the cache
            Some(c) if SMALL_INT_RANGE.contains(&c) => em.global(GlobalRef::SmallInt(c)),
            _ => em.call_runtime_value(RuntimeFn::BoxInt, vec![u.unboxed]),
        },
        TypeKind::Float => em.call_runtime_value(RuntimeFn::BoxFloat, vec![u.unboxed]),
        _ => crate::ice!("{} has no lazy box", ty),
    }
}

/// `True` or `False`, borrowed
pub(super) fn box_bool(var: &VarRef, em: &mut IrEmitter<'_>) -> Value {
    let t = em.global(GlobalRef::True);
    let f = em.global(GlobalRef::False);
    let cond = var.ir_value();
    let boxed = em.builder().select(cond, t, f);
    em.tag_borrowed(boxed);
    boxed
}

/// Read the payload of a boxed int or float; the box stays cached
pub(super) fn unbox(var: &VarRef, em: &mut IrEmitter<'_>, to: &TypeRef) -> VarRef {
    let boxed = var.ir_value();
    let (ty, offset) = match to.kind() {
        TypeKind::Int => (IrType::I64, INT_VALUE_OFFSET),
        TypeKind::Float => (IrType::F64, FLOAT_VALUE_OFFSET),
        _ => crate::ice!("cannot unbox {} to {}", var.ty(), to),
    };
    let unboxed = em.builder().load(ty, boxed, offset);
    VarRef::new(to.clone(), VarValue::Unboxed(UnboxedVal::with_box(unboxed, boxed)))
}

fn int_op(op: BinOpKind) -> IntBinOp {
    match op {
        BinOpKind::Add => IntBinOp::Add,
        BinOpKind::Sub => IntBinOp::Sub,
        BinOpKind::Mul => IntBinOp::Mul,
        BinOpKind::BitAnd => IntBinOp::And,
        BinOpKind::BitOr => IntBinOp::Or,
        BinOpKind::BitXor => IntBinOp::Xor,
        other => crate::ice!("{:?} is not a native int op", other),
    }
}

/// Constant result, or `None` when it leaves the i64 range
fn fold(op: BinOpKind, a: i64, b: i64) -> Option<i64> {
    match op {
        BinOpKind::Add => a.checked_add(b),
        BinOpKind::Sub => a.checked_sub(b),
        BinOpKind::Mul => a.checked_mul(b),
        BinOpKind::BitAnd => Some(a & b),
        BinOpKind::BitOr => Some(a | b),
        BinOpKind::BitXor => Some(a ^ b),
        other => crate::ice!("{:?} is not a native int op", other),
    }
}

fn as_float(var: &VarRef, em: &mut IrEmitter<'_>) -> Value {
    let v = var.ir_value();
    match var.ty().kind() {
        TypeKind::Int => em.builder().int_to_float(v),
        _ => v,
    }
}

pub(super) fn binexp(lhs: &VarRef, em: &mut IrEmitter<'_>, op: BinOpKind, rhs: &VarRef) -> VarRef {
    let both_int = matches!((lhs.ty().kind(), rhs.ty().kind()), (TypeKind::Int, TypeKind::Int));
    if both_int {
        if !int_op_stays_unboxed(op) && !int_op_is_checked(op) {
            return generic::binexp(lhs, em, op, rhs);
        }
        if let (Some(a), Some(b)) = (lhs.int_constant(), rhs.int_constant()) {
            return match fold(op, a, b) {
                Some(n) => int_constant(em, n),
                None => generic::binexp(lhs, em, op, rhs),
            };
        }
        if int_op_is_checked(op) {
            return checked_int_binexp(lhs, em, op, rhs);
        }
        let v = em.builder().int_binary(int_op(op), lhs.ir_value(), rhs.ir_value());
        return VarRef::ir(em.types().int(), v);
    }
    if !float_op_stays_unboxed(op) {
        return generic::binexp(lhs, em, op, rhs);
    }
    let l = as_float(lhs, em);
    let r = as_float(rhs, em);
    let v = match op {
        BinOpKind::Add => em.builder().float_binary(FloatBinOp::Add, l, r),
        BinOpKind::Sub => em.builder().float_binary(FloatBinOp::Sub, l, r),
        BinOpKind::Mul => em.builder().float_binary(FloatBinOp::Mul, l, r),
        // helpers raise on a zero divisor and follow the language's
        // remainder and power rules
        BinOpKind::Div => em.call_runtime_value(RuntimeFn::FloatDiv, vec![l, r]),
        BinOpKind::FloorDiv => em.call_runtime_value(RuntimeFn::FloatFloorDiv, vec![l, r]),
        BinOpKind::Mod => em.call_runtime_value(RuntimeFn::FloatMod, vec![l, r]),
        BinOpKind::Pow => em.call_runtime_value(RuntimeFn::FloatPow, vec![l, r]),
        other => crate::ice!("{:?} is not a float op", other),
    };
    VarRef::ir(em.types().float(), v)
}

/// Add, subtract or multiply natively, redoing the operation on boxed
/// operands when it overflows. Both arms produce a boxed result.
fn checked_int_binexp(lhs: &VarRef, em: &mut IrEmitter<'_>, op: BinOpKind, rhs: &VarRef) -> VarRef {
    let (l, r) = (lhs.ir_value(), rhs.ir_value());
    let overflows = em.builder().int_overflows(int_op(op), l, r);
    let slow = em.create_block();
    let fast = em.create_block();
    let join = em.create_block();
    em.branch(overflows, slow, fast);

    em.switch_to(slow);
    let boxed_l = boxed_in_branch(lhs, em);
    let boxed_r = boxed_in_branch(rhs, em);
    let slow_result = generic::binexp(&boxed_l, em, op, &boxed_r).ir_value();
    let slow_end = em.current_block();
    em.jump(join);

    em.switch_to(fast);
    let v = em.builder().int_binary(int_op(op), l, r);
    let fast_result = em.call_runtime_value(RuntimeFn::BoxInt, vec![v]);
    let fast_end = em.current_block();
    em.jump(join);

    em.switch_to(join);
    let result = em.builder().phi(IrType::Obj);
    em.tag_owned(result);
    let func = em.func_mut();
    crate::ir::builder::add_phi_incoming(func, join, result, slow_end, slow_result);
    crate::ir::builder::add_phi_incoming(func, join, result, fast_end, fast_result);
    VarRef::ir(em.types().unknown(), result)
}

/// Boxed view of an int in a block that does not dominate later uses
fn boxed_in_branch(var: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    let u = var.unboxed();
    let boxed = match u.cached_box() {
        Some(b) => b,
        None => box_uncached(em, var.ty(), u),
    };
    VarRef::ir(em.types().unknown(), boxed)
}

fn cmp_cond(op: CompareOp) -> CmpCond {
    match op {
        CompareOp::Eq => CmpCond::Eq,
        CompareOp::NotEq => CmpCond::Ne,
        CompareOp::Lt => CmpCond::Lt,
        CompareOp::LtE => CmpCond::Le,
        CompareOp::Gt => CmpCond::Gt,
        CompareOp::GtE => CmpCond::Ge,
        other => crate::ice!("{:?} is not a numeric comparison", other),
    }
}

pub(super) fn compare(lhs: &VarRef, em: &mut IrEmitter<'_>, op: CompareOp, rhs: &VarRef) -> VarRef {
    let cond = cmp_cond(op);
    let v = match (lhs.ty().kind(), rhs.ty().kind()) {
        (TypeKind::Int, TypeKind::Int) => em.builder().int_cmp(cond, lhs.ir_value(), rhs.ir_value()),
        _ => {
            let l = as_float(lhs, em);
            let r = as_float(rhs, em);
            em.builder().float_cmp(cond, l, r)
        }
    };
    VarRef::ir(em.types().bool_(), v)
}

/// Negation overflows only for `i64::MIN`; that case goes through the
/// generic path. Both arms produce a boxed result.
pub(super) fn int_neg(var: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    let x = var.ir_value();
    let min = em.builder().const_int(i64::MIN);
    let is_min = em.builder().int_cmp(CmpCond::Eq, x, min);
    let slow = em.create_block();
    let fast = em.create_block();
    let join = em.create_block();
    em.branch(is_min, slow, fast);

    em.switch_to(slow);
    let boxed = boxed_in_branch(var, em);
    let slow_result = generic::unaryop(&boxed, em, UnaryOpKind::Neg).ir_value();
    let slow_end = em.current_block();
    em.jump(join);

    em.switch_to(fast);
    let zero = em.builder().const_int(0);
    let negated = em.builder().int_binary(IntBinOp::Sub, zero, x);
    let fast_result = em.call_runtime_value(RuntimeFn::BoxInt, vec![negated]);
    let fast_end = em.current_block();
    em.jump(join);

    em.switch_to(join);
    let result = em.builder().phi(IrType::Obj);
    em.tag_owned(result);
    let func = em.func_mut();
    crate::ir::builder::add_phi_incoming(func, join, result, slow_end, slow_result);
    crate::ir::builder::add_phi_incoming(func, join, result, fast_end, fast_result);
    VarRef::ir(em.types().unknown(), result)
}

pub(super) fn float_neg(var: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    let v = em.builder().float_neg(var.ir_value());
    VarRef::ir(em.types().float(), v)
}

pub(super) fn int_invert(var: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    if let Some(c) = var.int_constant() {
        return int_constant(em, !c);
    }
    let ones = em.builder().const_int(-1);
    let v = em.builder().int_binary(IntBinOp::Xor, var.ir_value(), ones);
    VarRef::ir(em.types().int(), v)
}

pub(super) fn nonzero(var: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    let v = var.ir_value();
    let truth = match var.ty().kind() {
        TypeKind::Int => {
            let zero = em.builder().const_int(0);
            em.builder().int_cmp(CmpCond::Ne, v, zero)
        }
        _ => {
            let zero = em.builder().const_float(0.0);
            em.builder().float_cmp(CmpCond::Ne, v, zero)
        }
    };
    VarRef::ir(em.types().bool_(), truth)
}

/// Logical negation of a bool variable
pub(super) fn negate(var: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    if var.ty().is_undef() {
        return var.clone();
    }
    let v = em.builder().not(var.ir_value());
    VarRef::ir(em.types().bool_(), v)
}
