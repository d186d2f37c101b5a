//! Runtime entry points
//!
//! Every runtime function the generated code may call, with its fixed
//! signature. Operations that can raise come in two exception styles:
//! `Cxx` unwinds to the caller's landing pad, `Capi` returns null and leaves
//! the exception set in thread state.

use crate::ir::IrType;

/// How a call signals a raised exception
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionStyle {
    /// Unwind to a landing pad
    Cxx,
    /// Return a null sentinel
    Capi,
}

impl std::fmt::Display for ExceptionStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionStyle::Cxx => write!(f, "cxx"),
            ExceptionStyle::Capi => write!(f, "capi"),
        }
    }
}

/// Arity-specialized call entry point. Up to three arguments are passed
/// directly; `Many` passes the first three directly and the rest in an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallArity {
    Zero,
    One,
    Two,
    Three,
    Many,
}

impl CallArity {
    pub fn for_count(n: usize) -> Self {
        match n {
            0 => CallArity::Zero,
            1 => CallArity::One,
            2 => CallArity::Two,
            3 => CallArity::Three,
            _ => CallArity::Many,
        }
    }

    /// Arguments passed in registers
    pub fn direct_args(&self) -> usize {
        match self {
            CallArity::Zero => 0,
            CallArity::One => 1,
            CallArity::Two => 2,
            CallArity::Three | CallArity::Many => 3,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            CallArity::Zero => "0",
            CallArity::One => "1",
            CallArity::Two => "2",
            CallArity::Three => "3",
            CallArity::Many => "n",
        }
    }
}

/// A runtime entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    // Generic object protocol
    Getattr(ExceptionStyle),
    Setattr,
    Callattr(CallArity, ExceptionStyle),
    RuntimeCall(CallArity, ExceptionStyle),
    Binop(ExceptionStyle),
    Compare(ExceptionStyle),
    Unaryop(ExceptionStyle),
    Getitem(ExceptionStyle),
    GetGlobal(ExceptionStyle),
    Nonzero,
    Hasnext,
    GetIter,
    GetPystonIter,
    UnpackIntoArray,
    Len,

    // Boxing and construction
    BoxInt,
    BoxFloat,
    BoxInstanceMethod,
    CreateTuple,

    // Float helpers
    FloatDiv,
    FloatFloorDiv,
    FloatMod,
    FloatPow,

    // Raising
    Raise,
    RaiseIndexError,
    RaiseAttributeError,
    RaiseUnboundLocal,
    /// Rethrow the exception set in thread state by a CAPI-style call
    ThrowCapiException,
    /// Store a caught exception into thread state for CAPI propagation
    RestoreCapiException,
    /// Fetch the in-flight exception at a landing pad
    FetchException,
    /// Whether a CXX-style callee left an exception pending
    ExceptionPending,

    // Tiering
    Safepoint,
    Reoptimize,
    OnStackReplace,
}

/// Native signature of a runtime entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSignature {
    pub params: Vec<IrType>,
    pub ret: IrType,
}

impl RuntimeFn {
    /// Exported symbol name
    pub fn symbol(&self) -> String {
        fn styled(base: &str, style: ExceptionStyle) -> String {
            match style {
                ExceptionStyle::Cxx => base.to_string(),
                ExceptionStyle::Capi => format!("{}_capi", base),
            }
        }
        match self {
            RuntimeFn::Getattr(s) => styled("getattr", *s),
            RuntimeFn::Setattr => "setattr".to_string(),
            RuntimeFn::Callattr(a, s) => styled(&format!("callattr{}", a.suffix()), *s),
            RuntimeFn::RuntimeCall(a, s) => styled(&format!("runtime_call{}", a.suffix()), *s),
            RuntimeFn::Binop(s) => styled("binop", *s),
            RuntimeFn::Compare(s) => styled("compare", *s),
            RuntimeFn::Unaryop(s) => styled("unaryop", *s),
            RuntimeFn::Getitem(s) => styled("getitem", *s),
            RuntimeFn::GetGlobal(s) => styled("get_global", *s),
            RuntimeFn::Nonzero => "nonzero".to_string(),
            RuntimeFn::Hasnext => "hasnext".to_string(),
            RuntimeFn::GetIter => "get_iter".to_string(),
            RuntimeFn::GetPystonIter => "get_pyston_iter".to_string(),
            RuntimeFn::UnpackIntoArray => "unpack_into_array".to_string(),
            RuntimeFn::Len => "len".to_string(),
            RuntimeFn::BoxInt => "box_int".to_string(),
            RuntimeFn::BoxFloat => "box_float".to_string(),
            RuntimeFn::BoxInstanceMethod => "box_instance_method".to_string(),
            RuntimeFn::CreateTuple => "create_tuple".to_string(),
            RuntimeFn::FloatDiv => "float_div".to_string(),
            RuntimeFn::FloatFloorDiv => "float_floordiv".to_string(),
            RuntimeFn::FloatMod => "float_mod".to_string(),
            RuntimeFn::FloatPow => "float_pow".to_string(),
            RuntimeFn::Raise => "raise".to_string(),
            RuntimeFn::RaiseIndexError => "raise_index_error".to_string(),
            RuntimeFn::RaiseAttributeError => "raise_attribute_error".to_string(),
            RuntimeFn::RaiseUnboundLocal => "raise_unbound_local".to_string(),
            RuntimeFn::ThrowCapiException => "throw_capi_exception".to_string(),
            RuntimeFn::RestoreCapiException => "restore_capi_exception".to_string(),
            RuntimeFn::FetchException => "fetch_exception".to_string(),
            RuntimeFn::ExceptionPending => "exception_pending".to_string(),
            RuntimeFn::Safepoint => "safepoint".to_string(),
            RuntimeFn::Reoptimize => "reoptimize".to_string(),
            RuntimeFn::OnStackReplace => "on_stack_replace".to_string(),
        }
    }

    pub fn signature(&self) -> RuntimeSignature {
        use IrType::*;
        let (params, ret) = match self {
            RuntimeFn::Getattr(_) => (vec![Obj, Obj], Obj),
            RuntimeFn::Setattr => (vec![Obj, Obj, Obj], Void),
            RuntimeFn::Callattr(arity, _) => (call_params(&[Obj, Obj, I64], *arity), Obj),
            RuntimeFn::RuntimeCall(arity, _) => (call_params(&[Obj, I64], *arity), Obj),
            RuntimeFn::Binop(_) | RuntimeFn::Compare(_) => (vec![Obj, Obj, I64], Obj),
            RuntimeFn::Unaryop(_) => (vec![Obj, I64], Obj),
            RuntimeFn::Getitem(_) => (vec![Obj, Obj], Obj),
            RuntimeFn::GetGlobal(_) => (vec![Obj], Obj),
            RuntimeFn::Nonzero | RuntimeFn::Hasnext => (vec![Obj], I1),
            RuntimeFn::GetIter | RuntimeFn::GetPystonIter => (vec![Obj], Obj),
            RuntimeFn::UnpackIntoArray => (vec![Obj, I64], RawPtr),
            RuntimeFn::Len => (vec![Obj], I64),
            RuntimeFn::BoxInt => (vec![I64], Obj),
            RuntimeFn::BoxFloat => (vec![F64], Obj),
            RuntimeFn::BoxInstanceMethod => (vec![Obj, Obj], Obj),
            RuntimeFn::CreateTuple => (vec![I64, RawPtr], Obj),
            RuntimeFn::FloatDiv
            | RuntimeFn::FloatFloorDiv
            | RuntimeFn::FloatMod
            | RuntimeFn::FloatPow => (vec![F64, F64], F64),
            RuntimeFn::Raise => (vec![Obj], Void),
            RuntimeFn::RaiseIndexError => (vec![I64], Void),
            RuntimeFn::RaiseAttributeError => (vec![Obj, Obj], Void),
            RuntimeFn::RaiseUnboundLocal => (vec![Obj], Void),
            RuntimeFn::ThrowCapiException => (vec![], Void),
            RuntimeFn::RestoreCapiException => (vec![Obj], Void),
            RuntimeFn::FetchException => (vec![], Obj),
            RuntimeFn::ExceptionPending => (vec![], I1),
            RuntimeFn::Safepoint => (vec![], Void),
            RuntimeFn::Reoptimize => (vec![RawPtr], RawPtr),
            RuntimeFn::OnStackReplace => (vec![RawPtr, RawPtr], Obj),
        };
        RuntimeSignature { params, ret }
    }

    /// The exception style this entry point reports failures with, or
    /// `None` if it cannot raise
    pub fn exception_style(&self) -> Option<ExceptionStyle> {
        match self {
            RuntimeFn::Getattr(s)
            | RuntimeFn::Callattr(_, s)
            | RuntimeFn::RuntimeCall(_, s)
            | RuntimeFn::Binop(s)
            | RuntimeFn::Compare(s)
            | RuntimeFn::Unaryop(s)
            | RuntimeFn::Getitem(s)
            | RuntimeFn::GetGlobal(s) => Some(*s),
            RuntimeFn::Setattr
            | RuntimeFn::Nonzero
            | RuntimeFn::Hasnext
            | RuntimeFn::GetIter
            | RuntimeFn::GetPystonIter
            | RuntimeFn::UnpackIntoArray
            | RuntimeFn::Len
            | RuntimeFn::FloatDiv
            | RuntimeFn::FloatFloorDiv
            | RuntimeFn::FloatMod
            | RuntimeFn::FloatPow
            | RuntimeFn::Raise
            | RuntimeFn::RaiseIndexError
            | RuntimeFn::RaiseAttributeError
            | RuntimeFn::RaiseUnboundLocal
            | RuntimeFn::ThrowCapiException
            | RuntimeFn::OnStackReplace => Some(ExceptionStyle::Cxx),
            RuntimeFn::BoxInt
            | RuntimeFn::BoxFloat
            | RuntimeFn::BoxInstanceMethod
            | RuntimeFn::CreateTuple
            | RuntimeFn::RestoreCapiException
            | RuntimeFn::FetchException
            | RuntimeFn::ExceptionPending
            | RuntimeFn::Safepoint
            | RuntimeFn::Reoptimize => None,
        }
    }

    /// Whether the entry point never returns normally
    pub fn is_noreturn(&self) -> bool {
        matches!(
            self,
            RuntimeFn::Raise
                | RuntimeFn::RaiseIndexError
                | RuntimeFn::RaiseAttributeError
                | RuntimeFn::RaiseUnboundLocal
                | RuntimeFn::ThrowCapiException
        )
    }

    /// Every entry point, in a stable order
    pub fn all() -> Vec<RuntimeFn> {
        use CallArity::*;
        use ExceptionStyle::*;
        let mut all = Vec::new();
        for style in [Cxx, Capi] {
            all.push(RuntimeFn::Getattr(style));
            for arity in [Zero, One, Two, Three, Many] {
                all.push(RuntimeFn::Callattr(arity, style));
                all.push(RuntimeFn::RuntimeCall(arity, style));
            }
            all.push(RuntimeFn::Binop(style));
            all.push(RuntimeFn::Compare(style));
            all.push(RuntimeFn::Unaryop(style));
            all.push(RuntimeFn::Getitem(style));
            all.push(RuntimeFn::GetGlobal(style));
        }
        all.extend([
            RuntimeFn::Setattr,
            RuntimeFn::Nonzero,
            RuntimeFn::Hasnext,
            RuntimeFn::GetIter,
            RuntimeFn::GetPystonIter,
            RuntimeFn::UnpackIntoArray,
            RuntimeFn::Len,
            RuntimeFn::BoxInt,
            RuntimeFn::BoxFloat,
            RuntimeFn::BoxInstanceMethod,
            RuntimeFn::CreateTuple,
            RuntimeFn::FloatDiv,
            RuntimeFn::FloatFloorDiv,
            RuntimeFn::FloatMod,
            RuntimeFn::FloatPow,
            RuntimeFn::Raise,
            RuntimeFn::RaiseIndexError,
            RuntimeFn::RaiseAttributeError,
            RuntimeFn::RaiseUnboundLocal,
            RuntimeFn::ThrowCapiException,
            RuntimeFn::RestoreCapiException,
            RuntimeFn::FetchException,
            RuntimeFn::ExceptionPending,
            RuntimeFn::Safepoint,
            RuntimeFn::Reoptimize,
            RuntimeFn::OnStackReplace,
        ]);
        all
    }
}

fn call_params(prefix: &[IrType], arity: CallArity) -> Vec<IrType> {
    let mut params = prefix.to_vec();
    params.extend(std::iter::repeat(IrType::Obj).take(arity.direct_args()));
    if arity == CallArity::Many {
        params.push(IrType::RawPtr);
    }
    params
}
