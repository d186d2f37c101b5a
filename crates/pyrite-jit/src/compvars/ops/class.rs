//! Instances of known classes and their methods
//!
//! Attribute lookups on a closed class resolve at compile time. Methods
//! found that way stay unbound until they are called, and calls to a
//! function with a compatible compiled version go straight to its code.

use std::sync::Arc;

use super::super::types::{TypeKind, Truth};
use super::super::var::{VarRef, VarValue};
use super::{generic, undef_var, CallattrFlags};
use crate::ir::{Callee, IrType, Value};
use crate::irgen::IrEmitter;
use crate::runtime::object::ClassAttr;
use crate::runtime::{CompiledFunction, FunctionInfo, GlobalRef, RuntimeFn};

fn closed_lookup(obj: &VarRef, attr: &str) -> Option<Option<ClassAttr>> {
    match obj.ty().class() {
        Some(cls) if cls.is_closed() => Some(cls.lookup(attr)),
        _ => None,
    }
}

fn raise_attribute_error(obj: &VarRef, em: &mut IrEmitter<'_>, attr: &str) {
    let name = em.str_const(attr);
    em.call_runtime(RuntimeFn::RaiseAttributeError, vec![obj.ir_value(), name], vec![]);
}

pub(super) fn getattr(obj: &VarRef, em: &mut IrEmitter<'_>, attr: &str) -> VarRef {
    match closed_lookup(obj, attr) {
        Some(Some(ClassAttr::Function(func))) => {
            let ty = em.types().instance_method(obj.ty(), &func);
            VarRef::new(ty, VarValue::InstanceMethod { obj: obj.clone() })
        }
        Some(None) => {
            raise_attribute_error(obj, em, attr);
            undef_var(em)
        }
        Some(Some(ClassAttr::Value)) | None => generic::getattr(obj, em, attr),
    }
}

pub(super) fn callattr(
    obj: &VarRef,
    em: &mut IrEmitter<'_>,
    attr: &str,
    args: &[VarRef],
    flags: CallattrFlags,
) -> Option<VarRef> {
    match closed_lookup(obj, attr) {
        Some(Some(ClassAttr::Function(func))) => {
            let mut bound = Vec::with_capacity(args.len() + 1);
            bound.push(obj.clone());
            bound.extend_from_slice(args);
            if let Some(r) = call_function_direct(em, &func, &bound) {
                return Some(r);
            }
            tracing::warn!(class = %obj.ty(), attr, "no compiled version fits, calling through the runtime");
        }
        Some(None) => {
            if flags.null_on_missing {
                return None;
            }
            raise_attribute_error(obj, em, attr);
            return Some(undef_var(em));
        }
        Some(Some(ClassAttr::Value)) | None => {}
    }
    Some(generic::callattr(obj, em, attr, args))
}

/// `__bool__` if the class defines it; instances of a closed class with
/// neither `__bool__` nor `__len__` are always true.
pub(super) fn nonzero(obj: &VarRef, em: &mut IrEmitter<'_>) -> VarRef {
    if closed_lookup(obj, "__bool__").is_some() {
        let flags = CallattrFlags { null_on_missing: true };
        match obj.callattr(em, "__bool__", &[], flags) {
            Some(r) => return r.nonzero(em),
            None if obj.ty().hasattr("__len__") == Truth::No => {
                let yes = em.builder().const_bool(true);
                return VarRef::ir(em.types().bool_(), yes);
            }
            None => {}
        }
    }
    generic::nonzero(obj, em)
}

fn method_parts(method: &VarRef) -> (VarRef, Arc<FunctionInfo>) {
    match (method.value(), method.ty().kind()) {
        (VarValue::InstanceMethod { obj }, TypeKind::InstanceMethod { func, .. }) => (obj.clone(), func.clone()),
        (other, _) => crate::ice!("{} holds {:?}", method.ty(), other),
    }
}

pub(super) fn call_instance_method(method: &VarRef, em: &mut IrEmitter<'_>, args: &[VarRef]) -> VarRef {
    let (obj, func) = method_parts(method);
    let mut bound = Vec::with_capacity(args.len() + 1);
    bound.push(obj);
    bound.extend_from_slice(args);
    if let Some(r) = call_function_direct(em, &func, &bound) {
        return r;
    }
    let boxed = method.boxed(em);
    generic::call(&boxed, em, args)
}

/// Allocate the bound method object
pub(super) fn box_instance_method(method: &VarRef, em: &mut IrEmitter<'_>) -> Value {
    let (obj, func) = method_parts(method);
    let f = em.global(GlobalRef::Function(func.id));
    let o = obj.boxed(em).ir_value();
    em.call_runtime_value(RuntimeFn::BoxInstanceMethod, vec![f, o])
}

/// Native parameter count of an entry taking `n` positional arguments
fn entry_param_count(n: usize, num_inline_args: usize) -> usize {
    n.min(num_inline_args) + usize::from(n > num_inline_args)
}

fn version_accepts(version: &CompiledFunction, func: &FunctionInfo, args: &[VarRef], num_inline_args: usize) -> bool {
    let spec = &version.spec.arg_types;
    !version.is_osr()
        && spec.len() == func.num_params
        && version.ir.params.len() == entry_param_count(func.num_params, num_inline_args)
        && spec.iter().all(|t| t.is_concrete())
        && args.iter().zip(spec).all(|(a, t)| a.ty().can_convert_to(t))
        // defaults are passed boxed
        && spec[args.len()..].iter().all(|t| t.is_unknown())
}

/// Call a compiled version of `func` directly, skipping the runtime's
/// dispatch. Returns `None` when no version can take these arguments.
pub(crate) fn call_function_direct(em: &mut IrEmitter<'_>, func: &FunctionInfo, args: &[VarRef]) -> Option<VarRef> {
    if !func.accepts_positional(args.len()) {
        return None;
    }
    let inline = em.config().num_inline_args;
    let versions = func.versions();
    let preferred = em.preferred_style();
    // specialized over generic, then a matching exception style, then newest
    let (_, chosen) = versions
        .iter()
        .enumerate()
        .filter(|(_, v)| version_accepts(v, func, args, inline))
        .max_by_key(|(i, v)| (!v.spec.is_generic(), v.exception_style == preferred, *i))?;

    let mut values: Vec<Value> = args
        .iter()
        .zip(&chosen.spec.arg_types)
        .map(|(a, t)| a.make_converted(em, t).ir_value())
        .collect();
    let first_default = func.num_params - func.defaults.len();
    for i in args.len()..func.num_params {
        let default = func.defaults[i - first_default].clone();
        values.push(em.global(default));
    }

    let mut call_args: Vec<Value> = values.iter().take(inline).copied().collect();
    if values.len() > inline {
        let spill = em.builder().stack_array(values[inline..].to_vec());
        call_args.push(spill);
    }
    tracing::trace!(function = %func.name, version = %chosen.code_ref, "direct call");
    let r = em.emit_call(
        Callee::Direct(chosen.code_ref),
        Some(chosen.exception_style),
        false,
        call_args,
        vec![],
        IrType::Obj,
    )?;
    Some(VarRef::ir(em.types().unknown(), r))
}
