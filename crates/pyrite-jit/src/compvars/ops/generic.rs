//! Generic object protocol through runtime entry points

use super::super::var::VarRef;
use super::unknown_result;
use crate::cfg::{BinOpKind, CompareOp, UnaryOpKind};
use crate::ir::{CmpCond, IrType, RefType, Value};
use crate::irgen::IrEmitter;
use crate::runtime::{CallArity, RuntimeFn};

/// Boxed IR values for `args`
fn boxed_values(em: &mut IrEmitter<'_>, args: &[VarRef]) -> Vec<Value> {
    args.iter().map(|a| a.boxed(em).ir_value()).collect()
}

/// Append the argument count and arguments in the arity-specialized layout
fn push_call_args(em: &mut IrEmitter<'_>, args: Vec<Value>, out: &mut Vec<Value>) -> CallArity {
    let arity = CallArity::for_count(args.len());
    let argc = em.builder().const_int(args.len() as i64);
    out.push(argc);
    let direct = arity.direct_args().min(args.len());
    out.extend_from_slice(&args[..direct]);
    if arity == CallArity::Many {
        let rest = em.builder().stack_array(args[direct..].to_vec());
        out.push(rest);
    }
    arity
}

pub(super) fn getattr(obj: &VarRef, em: &mut IrEmitter<'_>, attr: &str) -> VarRef {
    let name = em.str_const(attr);
    let style = em.preferred_style();
    let r = em.call_runtime_value(RuntimeFn::Getattr(style), vec![obj.ir_value(), name]);
    unknown_result(em, r)
}

pub(super) fn setattr(obj: &VarRef, em: &mut IrEmitter<'_>, attr: &str, value: &VarRef) {
    let v = value.boxed(em).ir_value();
    let name = em.str_const(attr);
    em.call_runtime(RuntimeFn::Setattr, vec![obj.ir_value(), name, v], vec![]);
}

pub(super) fn call(func: &VarRef, em: &mut IrEmitter<'_>, args: &[VarRef]) -> VarRef {
    let vals = boxed_values(em, args);
    let mut call_args = vec![func.ir_value()];
    let arity = push_call_args(em, vals, &mut call_args);
    let style = em.preferred_style();
    let r = em.call_runtime_value(RuntimeFn::RuntimeCall(arity, style), call_args);
    unknown_result(em, r)
}

pub(super) fn callattr(obj: &VarRef, em: &mut IrEmitter<'_>, attr: &str, args: &[VarRef]) -> VarRef {
    let vals = boxed_values(em, args);
    let name = em.str_const(attr);
    let mut call_args = vec![obj.ir_value(), name];
    let arity = push_call_args(em, vals, &mut call_args);
    let style = em.preferred_style();
    let r = em.call_runtime_value(RuntimeFn::Callattr(arity, style), call_args);
    unknown_result(em, r)
}

pub(super) fn binexp(lhs: &VarRef, em: &mut IrEmitter<'_>, op: BinOpKind, rhs: &VarRef) -> VarRef {
    let l = lhs.boxed(em).ir_value();
    let r = rhs.boxed(em).ir_value();
    let code = em.builder().const_int(op.code());
    let style = em.preferred_style();
    let result = em.call_runtime_value(RuntimeFn::Binop(style), vec![l, r, code]);
    unknown_result(em, result)
}

pub(super) fn compare(lhs: &VarRef, em: &mut IrEmitter<'_>, op: CompareOp, rhs: &VarRef) -> VarRef {
    let l = lhs.boxed(em).ir_value();
    let r = rhs.boxed(em).ir_value();
    let code = em.builder().const_int(op.code());
    let style = em.preferred_style();
    let result = em.call_runtime_value(RuntimeFn::Compare(style), vec![l, r, code]);
    unknown_result(em, result)
}

/// `is` / `is not`: pointer comparison of the boxed objects
pub(super) fn identity(lhs: &VarRef, em: &mut IrEmitter<'_>, op: CompareOp, rhs: &VarRef) -> VarRef {
    let l = lhs.boxed(em).ir_value();
    let r = rhs.boxed(em).ir_value();
    let cond = if op == CompareOp::IsNot { CmpCond::Ne } else { CmpCond::Eq };
    let same = em.builder().int_cmp(cond, l, r);
    VarRef::ir(em.types().bool_(), same)
}

pub(super) fn unaryop(operand: &VarRef, em: &mut IrEmitter<'_>, op: UnaryOpKind) -> VarRef {
    let code = em.builder().const_int(op.code());
    let style = em.preferred_style();
    let r = em.call_runtime_value(RuntimeFn::Unaryop(style), vec![operand.ir_value(), code]);
    unknown_result(em, r)
}

pub(super) fn nonzero(obj: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    let truth = em.call_runtime_value(RuntimeFn::Nonzero, vec![obj.ir_value()]);
    VarRef::ir(em.types().bool_(), truth)
}

pub(super) fn hasnext(obj: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    let more = em.call_runtime_value(RuntimeFn::Hasnext, vec![obj.ir_value()]);
    VarRef::ir(em.types().bool_(), more)
}

pub(super) fn getitem(obj: &VarRef, em: &mut IrEmitter<'_>, index: &VarRef) -> VarRef {
    let idx = index.boxed(em).ir_value();
    let style = em.preferred_style();
    let r = em.call_runtime_value(RuntimeFn::Getitem(style), vec![obj.ir_value(), idx]);
    unknown_result(em, r)
}

pub(super) fn len(obj: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    let n = em.call_runtime_value(RuntimeFn::Len, vec![obj.ir_value()]);
    VarRef::ir(em.types().int(), n)
}

/// `iter(obj)`, wrapped so the result supports `hasnext`
pub(super) fn get_pyston_iter(obj: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    let iter = em.call_runtime_value(RuntimeFn::GetIter, vec![obj.ir_value()]);
    let r = em.call_runtime_value(RuntimeFn::GetPystonIter, vec![iter]);
    unknown_result(em, r)
}

/// The runtime fills an array with one new reference per element
pub(super) fn unpack(obj: &VarRef, em: &mut IrEmitter<'_>, n: usize) -> Vec<VarRef> {
    let count = em.builder().const_int(n as i64);
    let array = em.call_runtime_value(RuntimeFn::UnpackIntoArray, vec![obj.ir_value(), count]);
    (0..n)
        .map(|i| {
            let elt = em.builder().load(IrType::Obj, array, 8 * i as i32);
            em.tag(elt, RefType::Owned, false);
            VarRef::ir(em.types().unknown(), elt)
        })
        .collect()
}
