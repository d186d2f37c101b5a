//! IR → Cranelift IR lowering
//!
//! Translates refcounted SSA IR into Cranelift IR. Every value becomes a
//! Cranelift `Variable`; phis are resolved by defining the phi's variable at
//! the end of each predecessor and letting Cranelift's SSA construction
//! merge them. Runtime entry points, globals and direct callees are baked in
//! as absolute addresses, so the resulting code carries no relocations.
//!
//! `Invoke` lowers to a call followed by a pending-exception check that
//! branches to the unwind block; the CAPI style needs nothing here since its
//! null checks are already explicit compares in the IR.

use cranelift_codegen::ir::{self, condcodes, types, AbiParam, InstBuilder, MemFlags};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, Variable};
use rustc_hash::FxHashMap;

use crate::backend::traits::SymbolResolver;
use crate::ir::{BlockId, Callee, CmpCond, FloatBinOp, Instr, IntBinOp, IrFunction, IrType, Terminator, Value};
use crate::runtime::RuntimeFn;

/// User trap code for `Unreachable` terminators
const UNREACHABLE_TRAP: u8 = 1;

/// Cranelift type of an IR type; `Void` has none
pub fn cl_type(ty: IrType, pointer_type: ir::Type) -> Option<ir::Type> {
    match ty {
        IrType::I1 => Some(types::I8),
        IrType::I64 => Some(types::I64),
        IrType::F64 => Some(types::F64),
        IrType::Obj | IrType::RawPtr => Some(pointer_type),
        IrType::Void => None,
    }
}

/// Native signature of a compiled function's entry point
pub fn entry_signature(func: &IrFunction, call_conv: CallConv, pointer_type: ir::Type) -> ir::Signature {
    let mut sig = ir::Signature::new(call_conv);
    for p in &func.params {
        if let Some(ty) = cl_type(func.value_type(*p), pointer_type) {
            sig.params.push(AbiParam::new(ty));
        }
    }
    if let Some(ty) = cl_type(func.ret, pointer_type) {
        sig.returns.push(AbiParam::new(ty));
    }
    sig
}

/// Error during Cranelift lowering
#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error("Unsupported instruction: {0}")]
    UnsupportedInstruction(String),
    #[error("Unresolved symbol: {0}")]
    UnresolvedSymbol(String),
    #[error("Cranelift error: {0}")]
    CraneliftError(String),
}

/// State maintained during lowering of a single function
pub struct LoweringContext<'a> {
    func: &'a IrFunction,
    resolver: &'a dyn SymbolResolver,
    vars: FxHashMap<Value, Variable>,
    block_map: FxHashMap<BlockId, ir::Block>,
    /// For each predecessor, the (phi, incoming value) pairs it feeds
    phi_copies: FxHashMap<BlockId, Vec<(Value, Value)>>,
    call_conv: CallConv,
    pointer_type: ir::Type,
}

fn build_phi_copies(func: &IrFunction) -> FxHashMap<BlockId, Vec<(Value, Value)>> {
    let mut copies: FxHashMap<BlockId, Vec<(Value, Value)>> = FxHashMap::default();
    for block in &func.blocks {
        for instr in &block.instrs {
            let Instr::Phi { dest, incoming } = instr else { break };
            for (src_block, src) in incoming {
                copies.entry(*src_block).or_default().push((*dest, *src));
            }
        }
    }
    copies
}

impl<'a> LoweringContext<'a> {
    /// Lower an entire function into Cranelift IR.
    /// Takes ownership of the FunctionBuilder since finalize() consumes it.
    pub fn lower(
        func: &'a IrFunction,
        resolver: &'a dyn SymbolResolver,
        mut builder: FunctionBuilder<'_>,
        call_conv: CallConv,
        pointer_type: ir::Type,
    ) -> Result<(), LowerError> {
        let mut block_map = FxHashMap::default();
        for block in &func.blocks {
            block_map.insert(block.id, builder.create_block());
        }

        let mut ctx = LoweringContext {
            func,
            resolver,
            vars: FxHashMap::default(),
            block_map,
            phi_copies: build_phi_copies(func),
            call_conv,
            pointer_type,
        };
        ctx.declare_all_values(&mut builder);

        let entry_block = ctx.block_map[&func.entry];
        builder.append_block_params_for_function_params(entry_block);
        builder.switch_to_block(entry_block);
        let params = builder.block_params(entry_block).to_vec();
        for (p, val) in func.params.iter().zip(params) {
            ctx.def_value(&mut builder, *p, val);
        }
        ctx.materialize_globals(&mut builder)?;
        ctx.lower_block(func.entry, &mut builder)?;

        for block in func.blocks.iter().filter(|b| b.id != func.entry) {
            builder.switch_to_block(ctx.block_map[&block.id]);
            ctx.lower_block(block.id, &mut builder)?;
        }

        builder.seal_all_blocks();
        builder.finalize();
        Ok(())
    }

    fn declare_all_values(&mut self, builder: &mut FunctionBuilder<'_>) {
        for i in 0..self.func.num_values() {
            let v = Value(i as u32);
            if let Some(ty) = cl_type(self.func.value_type(v), self.pointer_type) {
                let var = builder.declare_var(ty);
                self.vars.insert(v, var);
            }
        }
    }

    /// Globals are constants for the lifetime of the code; define them once
    /// in the entry block, which dominates every use
    fn materialize_globals(&self, builder: &mut FunctionBuilder<'_>) -> Result<(), LowerError> {
        for i in 0..self.func.num_values() {
            let v = Value(i as u32);
            let Some(global) = self.func.global_of(v) else { continue };
            let addr = self
                .resolver
                .resolve_global(global)
                .ok_or_else(|| LowerError::UnresolvedSymbol(global.to_string()))?;
            let val = builder.ins().iconst(self.pointer_type, addr as i64);
            self.def_value(builder, v, val);
        }
        Ok(())
    }

    fn var_for(&self, v: Value) -> Variable {
        match self.vars.get(&v) {
            Some(var) => *var,
            None => crate::ice!("{} in {} has no machine type", v, self.func.name),
        }
    }

    fn use_value(&self, builder: &mut FunctionBuilder<'_>, v: Value) -> ir::Value {
        builder.use_var(self.var_for(v))
    }

    fn def_value(&self, builder: &mut FunctionBuilder<'_>, v: Value, val: ir::Value) {
        builder.def_var(self.var_for(v), val);
    }

    fn machine_type(&self, v: Value) -> ir::Type {
        match cl_type(self.func.value_type(v), self.pointer_type) {
            Some(ty) => ty,
            None => crate::ice!("{} in {} has no machine type", v, self.func.name),
        }
    }

    fn zero(&self, builder: &mut FunctionBuilder<'_>, v: Value) -> ir::Value {
        let ty = self.machine_type(v);
        if ty == types::F64 {
            builder.ins().f64const(0.0)
        } else {
            builder.ins().iconst(ty, 0)
        }
    }

    fn lower_block(&self, b: BlockId, builder: &mut FunctionBuilder<'_>) -> Result<(), LowerError> {
        let func = self.func;
        let block = func.block(b);
        for instr in &block.instrs {
            self.lower_instr(instr, builder)?;
        }
        match &block.terminator {
            Terminator::Invoke { dest, callee, args, normal, unwind, .. } => {
                self.lower_call(builder, callee, args, *dest)?;
                self.emit_phi_copies(b, builder);
                let pending = self.call_runtime(builder, RuntimeFn::ExceptionPending, &[])?;
                let Some(pending) = pending else {
                    crate::ice!("exception check returned no value in {}", self.func.name)
                };
                builder.ins().brif(pending, self.block_map[unwind], &[], self.block_map[normal], &[]);
            }
            term => {
                self.emit_phi_copies(b, builder);
                self.lower_terminator(term, builder)?;
            }
        }
        Ok(())
    }

    /// Define every successor phi fed by `b`. All sources are read before
    /// any phi is written, so phis feeding each other swap correctly.
    fn emit_phi_copies(&self, b: BlockId, builder: &mut FunctionBuilder<'_>) {
        let Some(copies) = self.phi_copies.get(&b) else { return };
        let vals: Vec<ir::Value> = copies.iter().map(|(_, src)| self.use_value(builder, *src)).collect();
        for ((phi, _), val) in copies.iter().zip(vals) {
            self.def_value(builder, *phi, val);
        }
    }

    fn lower_instr(&self, instr: &Instr, builder: &mut FunctionBuilder<'_>) -> Result<(), LowerError> {
        match instr {
            // ===== Constants =====
            Instr::ConstInt { dest, value } => {
                let val = builder.ins().iconst(types::I64, *value);
                self.def_value(builder, *dest, val);
            }
            Instr::ConstFloat { dest, value } => {
                let val = builder.ins().f64const(*value);
                self.def_value(builder, *dest, val);
            }
            Instr::ConstBool { dest, value } => {
                let val = builder.ins().iconst(types::I8, i64::from(*value));
                self.def_value(builder, *dest, val);
            }
            Instr::Null { dest } | Instr::Undef { dest } => {
                let val = self.zero(builder, *dest);
                self.def_value(builder, *dest, val);
            }

            // ===== Arithmetic =====
            Instr::IntBinary { dest, op, lhs, rhs } => {
                let l = self.use_value(builder, *lhs);
                let r = self.use_value(builder, *rhs);
                let result = match op {
                    IntBinOp::Add => builder.ins().iadd(l, r),
                    IntBinOp::Sub => builder.ins().isub(l, r),
                    IntBinOp::Mul => builder.ins().imul(l, r),
                    IntBinOp::And => builder.ins().band(l, r),
                    IntBinOp::Or => builder.ins().bor(l, r),
                    IntBinOp::Xor => builder.ins().bxor(l, r),
                };
                self.def_value(builder, *dest, result);
            }
            Instr::IntOverflows { dest, op, lhs, rhs } => {
                let l = self.use_value(builder, *lhs);
                let r = self.use_value(builder, *rhs);
                let (_, overflow) = match op {
                    IntBinOp::Add => builder.ins().sadd_overflow(l, r),
                    IntBinOp::Sub => builder.ins().ssub_overflow(l, r),
                    IntBinOp::Mul => builder.ins().smul_overflow(l, r),
                    IntBinOp::And | IntBinOp::Or | IntBinOp::Xor => {
                        return Err(LowerError::UnsupportedInstruction(format!("{}.overflows", op)));
                    }
                };
                self.def_value(builder, *dest, overflow);
            }
            Instr::FloatBinary { dest, op, lhs, rhs } => {
                let l = self.use_value(builder, *lhs);
                let r = self.use_value(builder, *rhs);
                let result = match op {
                    FloatBinOp::Add => builder.ins().fadd(l, r),
                    FloatBinOp::Sub => builder.ins().fsub(l, r),
                    FloatBinOp::Mul => builder.ins().fmul(l, r),
                };
                self.def_value(builder, *dest, result);
            }
            Instr::FloatNeg { dest, src } => {
                let v = self.use_value(builder, *src);
                let result = builder.ins().fneg(v);
                self.def_value(builder, *dest, result);
            }
            Instr::IntCmp { dest, cond, lhs, rhs } => {
                let l = self.use_value(builder, *lhs);
                let r = self.use_value(builder, *rhs);
                let result = builder.ins().icmp(int_cc(*cond), l, r);
                self.def_value(builder, *dest, result);
            }
            Instr::FloatCmp { dest, cond, lhs, rhs } => {
                let l = self.use_value(builder, *lhs);
                let r = self.use_value(builder, *rhs);
                let result = builder.ins().fcmp(float_cc(*cond), l, r);
                self.def_value(builder, *dest, result);
            }
            Instr::IntToFloat { dest, src } => {
                let v = self.use_value(builder, *src);
                let result = builder.ins().fcvt_from_sint(types::F64, v);
                self.def_value(builder, *dest, result);
            }
            Instr::Not { dest, src } => {
                let v = self.use_value(builder, *src);
                // Boolean not: XOR with 1
                let one = builder.ins().iconst(types::I8, 1);
                let result = builder.ins().bxor(v, one);
                self.def_value(builder, *dest, result);
            }
            Instr::Select { dest, cond, if_true, if_false } => {
                let c = self.use_value(builder, *cond);
                let t = self.use_value(builder, *if_true);
                let f = self.use_value(builder, *if_false);
                let result = builder.ins().select(c, t, f);
                self.def_value(builder, *dest, result);
            }
            Instr::Bitcast { dest, src } => {
                let v = self.use_value(builder, *src);
                let ty = self.machine_type(*src);
                let result = if ty == types::F64 {
                    builder.ins().bitcast(types::I64, MemFlags::new(), v)
                } else if ty == types::I8 {
                    builder.ins().uextend(types::I64, v)
                } else {
                    v
                };
                self.def_value(builder, *dest, result);
            }

            // ===== Memory =====
            Instr::Load { dest, base, offset } => {
                let b = self.use_value(builder, *base);
                let ty = self.machine_type(*dest);
                let val = builder.ins().load(ty, MemFlags::trusted(), b, *offset);
                self.def_value(builder, *dest, val);
            }
            Instr::Store { value, base, offset } => {
                let v = self.use_value(builder, *value);
                let b = self.use_value(builder, *base);
                builder.ins().store(MemFlags::trusted(), v, b, *offset);
            }
            Instr::StackArray { dest, elems } => {
                let size = (8 * elems.len().max(1)) as u32;
                let slot = builder.create_sized_stack_slot(ir::StackSlotData::new(
                    ir::StackSlotKind::ExplicitSlot,
                    size,
                    3,
                ));
                for (i, elem) in elems.iter().enumerate() {
                    let v = self.use_value(builder, *elem);
                    builder.ins().stack_store(v, slot, (8 * i) as i32);
                }
                let addr = builder.ins().stack_addr(self.pointer_type, slot, 0);
                self.def_value(builder, *dest, addr);
            }

            // ===== Calls =====
            Instr::Call { dest, callee, args, .. } => {
                self.lower_call(builder, callee, args, *dest)?;
            }
            Instr::LandingPad { dest } => {
                let Some(exc) = self.call_runtime(builder, RuntimeFn::FetchException, &[])? else {
                    crate::ice!("landing pad fetched no exception in {}", self.func.name)
                };
                self.def_value(builder, *dest, exc);
            }
            Instr::Phi { .. } => {
                // resolved by emit_phi_copies in each predecessor
            }

            Instr::Incref { .. } | Instr::Decref { .. } => {
                crate::ice!("{} reached the backend unexpanded in {}", instr, self.func.name)
            }
        }
        Ok(())
    }

    fn resolved(
        &self,
        builder: &mut FunctionBuilder<'_>,
        addr: Option<usize>,
        what: impl FnOnce() -> String,
    ) -> Result<ir::Value, LowerError> {
        let addr = addr.ok_or_else(|| LowerError::UnresolvedSymbol(what()))?;
        Ok(builder.ins().iconst(self.pointer_type, addr as i64))
    }

    fn lower_call(
        &self,
        builder: &mut FunctionBuilder<'_>,
        callee: &Callee,
        args: &[Value],
        dest: Option<Value>,
    ) -> Result<(), LowerError> {
        let mut sig = ir::Signature::new(self.call_conv);
        for a in args {
            sig.params.push(AbiParam::new(self.machine_type(*a)));
        }
        if let Some(d) = dest {
            sig.returns.push(AbiParam::new(self.machine_type(d)));
        }
        let target = match callee {
            Callee::Runtime(f) => self.resolved(builder, self.resolver.resolve_runtime(*f), || f.symbol())?,
            Callee::Direct(code) => self.resolved(builder, self.resolver.resolve_function(*code), || code.to_string())?,
            Callee::Indirect(v) => self.use_value(builder, *v),
        };
        let arg_vals: Vec<ir::Value> = args.iter().map(|a| self.use_value(builder, *a)).collect();
        let sig_ref = builder.import_signature(sig);
        let call = builder.ins().call_indirect(sig_ref, target, &arg_vals);
        if let Some(d) = dest {
            let result = builder.inst_results(call)[0];
            self.def_value(builder, d, result);
        }
        Ok(())
    }

    /// Call a runtime entry point with its declared signature
    fn call_runtime(
        &self,
        builder: &mut FunctionBuilder<'_>,
        f: RuntimeFn,
        args: &[ir::Value],
    ) -> Result<Option<ir::Value>, LowerError> {
        let signature = f.signature();
        let mut sig = ir::Signature::new(self.call_conv);
        for p in &signature.params {
            if let Some(ty) = cl_type(*p, self.pointer_type) {
                sig.params.push(AbiParam::new(ty));
            }
        }
        if let Some(ty) = cl_type(signature.ret, self.pointer_type) {
            sig.returns.push(AbiParam::new(ty));
        }
        let target = self.resolved(builder, self.resolver.resolve_runtime(f), || f.symbol())?;
        let sig_ref = builder.import_signature(sig);
        let call = builder.ins().call_indirect(sig_ref, target, args);
        Ok(builder.inst_results(call).first().copied())
    }

    fn lower_terminator(&self, term: &Terminator, builder: &mut FunctionBuilder<'_>) -> Result<(), LowerError> {
        match term {
            Terminator::Jump(target) => {
                builder.ins().jump(self.block_map[target], &[]);
            }
            Terminator::Branch { cond, then_block, else_block } => {
                let c = self.use_value(builder, *cond);
                builder.ins().brif(c, self.block_map[then_block], &[], self.block_map[else_block], &[]);
            }
            Terminator::Return(Some(v)) => {
                let val = self.use_value(builder, *v);
                builder.ins().return_(&[val]);
            }
            Terminator::Return(None) => {
                builder.ins().return_(&[]);
            }
            Terminator::Unreachable => {
                let code = ir::TrapCode::user(UNREACHABLE_TRAP)
                    .ok_or_else(|| LowerError::CraneliftError(format!("invalid trap code {}", UNREACHABLE_TRAP)))?;
                builder.ins().trap(code);
            }
            Terminator::Invoke { .. } => crate::ice!("invoke lowered as a plain terminator in {}", self.func.name),
            Terminator::None => crate::ice!("unterminated block in {}", self.func.name),
        }
        Ok(())
    }
}

fn int_cc(cond: CmpCond) -> condcodes::IntCC {
    match cond {
        CmpCond::Eq => condcodes::IntCC::Equal,
        CmpCond::Ne => condcodes::IntCC::NotEqual,
        CmpCond::Lt => condcodes::IntCC::SignedLessThan,
        CmpCond::Le => condcodes::IntCC::SignedLessThanOrEqual,
        CmpCond::Gt => condcodes::IntCC::SignedGreaterThan,
        CmpCond::Ge => condcodes::IntCC::SignedGreaterThanOrEqual,
    }
}

/// `Ne` is unordered-or-not-equal, the rest are ordered
fn float_cc(cond: CmpCond) -> condcodes::FloatCC {
    match cond {
        CmpCond::Eq => condcodes::FloatCC::Equal,
        CmpCond::Ne => condcodes::FloatCC::NotEqual,
        CmpCond::Lt => condcodes::FloatCC::LessThan,
        CmpCond::Le => condcodes::FloatCC::LessThanOrEqual,
        CmpCond::Gt => condcodes::FloatCC::GreaterThan,
        CmpCond::Ge => condcodes::FloatCC::GreaterThanOrEqual,
    }
}
