//! Emission cursor shared by the driver and the type lattice
//!
//! `IrEmitter` owns the function being built and a current block. Calls go
//! through `emit_call`, which lowers the two exception conventions: an
//! unwinding call becomes an `Invoke` when there is somewhere in this
//! function to unwind to, and a sentinel-style call is followed by a null
//! check that branches to the handler or to the shared propagation block.

use std::sync::Arc;

use crate::compvars::TypeRegistry;
use crate::config::JitConfig;
use crate::ir::{BlockId, Callee, CmpCond, IrBuilder, IrFunction, IrType, RefType, Terminator, Value};
use crate::runtime::{ExceptionStyle, GlobalRef, RuntimeFn};

pub struct IrEmitter<'a> {
    func: IrFunction,
    block: BlockId,
    types: &'a TypeRegistry,
    config: &'a JitConfig,
    /// Exception convention of the function being compiled
    style: ExceptionStyle,
    /// In-function handler for the statement being emitted
    unwind: Option<BlockId>,
    propagate: Option<BlockId>,
    capi_landing: Option<BlockId>,
}

impl<'a> IrEmitter<'a> {
    pub fn new(func: IrFunction, types: &'a TypeRegistry, config: &'a JitConfig, style: ExceptionStyle) -> Self {
        let block = func.entry;
        IrEmitter { func, block, types, config, style, unwind: None, propagate: None, capi_landing: None }
    }

    pub fn types(&self) -> &'a TypeRegistry {
        self.types
    }

    pub fn config(&self) -> &'a JitConfig {
        self.config
    }

    pub fn func(&self) -> &IrFunction {
        &self.func
    }

    pub fn func_mut(&mut self) -> &mut IrFunction {
        &mut self.func
    }

    pub fn into_func(self) -> IrFunction {
        self.func
    }

    pub fn style(&self) -> ExceptionStyle {
        self.style
    }

    /// Builder positioned at the current block
    pub fn builder(&mut self) -> IrBuilder<'_> {
        IrBuilder::new(&mut self.func, self.block)
    }

    pub fn current_block(&self) -> BlockId {
        self.block
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.block = block;
    }

    pub fn create_block(&mut self) -> BlockId {
        self.func.add_block()
    }

    pub fn is_terminated(&self) -> bool {
        !self.func.block(self.block).terminator.is_none()
    }

    pub fn terminate(&mut self, term: Terminator) {
        self.builder().terminate(term);
    }

    pub fn jump(&mut self, target: BlockId) {
        self.terminate(Terminator::Jump(target));
    }

    pub fn branch(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::Branch { cond, then_block, else_block });
    }

    /// End the current block as unreachable and continue in a fresh block
    /// no edge leads to
    pub fn dead_end(&mut self) {
        if !self.is_terminated() {
            self.terminate(Terminator::Unreachable);
        }
        self.block = self.func.add_block();
    }

    /// Set the handler for calls that raise; returns the previous one
    pub fn set_unwind(&mut self, unwind: Option<BlockId>) -> Option<BlockId> {
        std::mem::replace(&mut self.unwind, unwind)
    }

    pub fn unwind(&self) -> Option<BlockId> {
        self.unwind
    }

    /// Exception style for a call emitted at the current point. Calls with
    /// an in-function handler unwind to it; others follow the function.
    pub fn preferred_style(&self) -> ExceptionStyle {
        if self.unwind.is_some() {
            ExceptionStyle::Cxx
        } else {
            self.style
        }
    }

    pub fn tag(&mut self, v: Value, ref_type: RefType, nullable: bool) {
        self.func.set_ref_type(v, ref_type, nullable);
    }

    pub fn tag_owned(&mut self, v: Value) {
        self.tag(v, RefType::Owned, false);
    }

    pub fn tag_borrowed(&mut self, v: Value) {
        self.tag(v, RefType::Borrowed, false);
    }

    pub fn global(&mut self, global: GlobalRef) -> Value {
        self.func.global(global)
    }

    /// Interned string object
    pub fn str_const(&mut self, s: &str) -> Value {
        self.global(GlobalRef::Str(Arc::from(s)))
    }

    /// Null object pointer, tagged borrowed and nullable
    pub fn null_obj(&mut self) -> Value {
        let null = self.builder().null(IrType::Obj);
        self.tag(null, RefType::Borrowed, true);
        null
    }

    pub fn is_null(&mut self, v: Value) -> Value {
        let null = self.null_obj();
        self.builder().int_cmp(CmpCond::Eq, v, null)
    }

    pub fn call_runtime(&mut self, f: RuntimeFn, args: Vec<Value>, consumed: Vec<Value>) -> Option<Value> {
        let sig = f.signature();
        if sig.params.len() != args.len() {
            crate::ice!("{} takes {} arguments, got {}", f.symbol(), sig.params.len(), args.len());
        }
        self.emit_call(Callee::Runtime(f), f.exception_style(), f.is_noreturn(), args, consumed, sig.ret)
    }

    /// Runtime call whose result is required
    pub fn call_runtime_value(&mut self, f: RuntimeFn, args: Vec<Value>) -> Value {
        match self.call_runtime(f, args, vec![]) {
            Some(v) => v,
            None => crate::ice!("{} returns no value", f.symbol()),
        }
    }

    /// Emit a call with the given failure convention. Object results are
    /// new references; sentinel-style results are nullable.
    pub fn emit_call(
        &mut self,
        callee: Callee,
        style: Option<ExceptionStyle>,
        noreturn: bool,
        args: Vec<Value>,
        consumed: Vec<Value>,
        ret: IrType,
    ) -> Option<Value> {
        let invoke_target = match style {
            Some(ExceptionStyle::Cxx) => match (self.unwind, self.style) {
                (Some(unwind), _) => Some(unwind),
                (None, ExceptionStyle::Capi) => Some(self.capi_landing_block()),
                (None, ExceptionStyle::Cxx) => None,
            },
            _ => None,
        };
        let result = match invoke_target {
            Some(unwind) => {
                let normal = self.func.add_block();
                let dest = (ret != IrType::Void).then(|| self.func.new_value(ret));
                self.terminate(Terminator::Invoke { dest, callee, args, consumed, normal, unwind });
                self.block = normal;
                dest
            }
            None => self.builder().call(callee, args, consumed, ret),
        };

        let capi = style == Some(ExceptionStyle::Capi);
        if let Some(v) = result.filter(|_| ret.is_object()) {
            self.tag(v, RefType::Owned, capi);
            if capi && !noreturn {
                let failed = self.is_null(v);
                let target = match self.unwind {
                    Some(unwind) => unwind,
                    None => self.propagate_block(),
                };
                let cont = self.func.add_block();
                self.branch(failed, target, cont);
                self.block = cont;
            }
        }
        if noreturn {
            self.dead_end();
        }
        result
    }

    /// Shared block that reports a pending exception to the caller in the
    /// function's own convention
    pub fn propagate_block(&mut self) -> BlockId {
        if let Some(b) = self.propagate {
            return b;
        }
        let saved = self.block;
        let b = self.func.add_block();
        self.block = b;
        match self.style {
            ExceptionStyle::Capi => {
                let null = self.builder().null(IrType::Obj);
                self.tag(null, RefType::Owned, true);
                self.terminate(Terminator::Return(Some(null)));
            }
            ExceptionStyle::Cxx => {
                self.builder().call(Callee::Runtime(RuntimeFn::ThrowCapiException), vec![], vec![], IrType::Void);
                self.terminate(Terminator::Unreachable);
            }
        }
        self.block = saved;
        self.propagate = Some(b);
        b
    }

    /// Landing block that turns an unwinding exception back into a pending
    /// one, for sentinel-style functions
    fn capi_landing_block(&mut self) -> BlockId {
        if let Some(b) = self.capi_landing {
            return b;
        }
        let saved = self.block;
        let b = self.func.add_block();
        self.block = b;
        let exc = self.builder().landing_pad();
        self.tag_owned(exc);
        self.builder().call(Callee::Runtime(RuntimeFn::RestoreCapiException), vec![exc], vec![exc], IrType::Void);
        let propagate = self.propagate_block();
        self.jump(propagate);
        self.block = saved;
        self.capi_landing = Some(b);
        b
    }
}
