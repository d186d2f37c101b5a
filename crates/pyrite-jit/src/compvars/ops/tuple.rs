//! Unallocated tuples of statically known arity

use super::super::types::{resolve_index, TypeKind, TypeRef};
use super::super::var::{VarRef, VarValue};
use super::{generic, undef_var};
use crate::cfg::CompareOp;
use crate::ir::{builder::add_phi_incoming, CmpCond, IrType, Value};
use crate::irgen::IrEmitter;
use crate::runtime::RuntimeFn;

fn elements(tuple: &VarRef) -> &[VarRef] {
    match tuple.value() {
        VarValue::Tuple(elts) => elts,
        other => crate::ice!("{} holds {:?}", tuple.ty(), other),
    }
}

/// Elementwise conversion to another tuple type, or allocation of the box
pub(super) fn convert(tuple: &VarRef, em: &mut IrEmitter<'_>, other: &TypeRef) -> VarRef {
    let elts = elements(tuple);
    if let TypeKind::Tuple(targets) = other.kind() {
        let converted = elts.iter().zip(targets).map(|(e, t)| e.make_converted(em, t)).collect();
        return VarRef::new(other.clone(), VarValue::Tuple(converted));
    }
    let boxed: Vec<Value> = elts.iter().map(|e| e.boxed(em).ir_value()).collect();
    let n = em.builder().const_int(boxed.len() as i64);
    let array = em.builder().stack_array(boxed);
    let created = em.call_runtime_value(RuntimeFn::CreateTuple, vec![n, array]);
    VarRef::ir(other.clone(), created)
}

/// Constant indices resolve at compile time; an out-of-range constant
/// raises `IndexError` and leaves nothing to bind.
pub(super) fn getitem(tuple: &VarRef, em: &mut IrEmitter<'_>, index: &VarRef) -> VarRef {
    let elts = elements(tuple);
    let Some(i) = index.int_constant() else {
        let boxed = tuple.boxed(em);
        return generic::getitem(&boxed, em, index);
    };
    match resolve_index(i, elts.len()) {
        Some(k) => elts[k].clone(),
        None => {
            let c = em.builder().const_int(i);
            em.call_runtime(RuntimeFn::RaiseIndexError, vec![c], vec![]);
            undef_var(em)
        }
    }
}

/// Identity first, then `==`, element by element
pub(super) fn contains(tuple: &VarRef, em: &mut IrEmitter<'_>, needle: &VarRef) -> VarRef {
    let elts = elements(tuple).to_vec();
    let bool_ty = em.types().bool_();
    if elts.is_empty() {
        let no = em.builder().const_bool(false);
        return VarRef::ir(bool_ty, no);
    }

    // boxes are created up front so the cache only holds values that
    // dominate whatever follows the membership test
    let needle = needle.boxed(em).ir_value();
    let boxes: Vec<Value> = elts.iter().map(|e| e.boxed(em).ir_value()).collect();
    let yes = em.builder().const_bool(true);
    let join = em.create_block();
    let mut found = Vec::with_capacity(2 * boxes.len());

    for elt in boxes {
        let same = em.builder().int_cmp(CmpCond::Eq, needle, elt);
        let check_eq = em.create_block();
        found.push(em.current_block());
        em.branch(same, join, check_eq);

        em.switch_to(check_eq);
        let code = em.builder().const_int(CompareOp::Eq.code());
        let style = em.preferred_style();
        let eq = em.call_runtime_value(RuntimeFn::Compare(style), vec![needle, elt, code]);
        let truth = em.call_runtime_value(RuntimeFn::Nonzero, vec![eq]);
        let next = em.create_block();
        found.push(em.current_block());
        em.branch(truth, join, next);
        em.switch_to(next);
    }

    let no = em.builder().const_bool(false);
    let missed = em.current_block();
    em.jump(join);

    em.switch_to(join);
    let result = em.builder().phi(IrType::I1);
    for from in found {
        add_phi_incoming(em.func_mut(), join, result, from, yes);
    }
    add_phi_incoming(em.func_mut(), join, result, missed, no);
    VarRef::ir(bool_ty, result)
}
