//! IR builder
//!
//! Convenience API for appending instructions to a block of an `IrFunction`.

use super::instr::*;
use super::types::IrType;

/// Builder that appends to one block at a time
pub struct IrBuilder<'a> {
    func: &'a mut IrFunction,
    block: BlockId,
}

impl<'a> IrBuilder<'a> {
    /// Create a builder positioned at `block`
    pub fn new(func: &'a mut IrFunction, block: BlockId) -> Self {
        IrBuilder { func, block }
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.block = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.block
    }

    pub fn create_block(&mut self) -> BlockId {
        self.func.add_block()
    }

    pub fn emit(&mut self, instr: Instr) {
        self.func.block_mut(self.block).instrs.push(instr);
    }

    pub fn terminate(&mut self, term: Terminator) {
        if self.is_terminated() {
            crate::ice!("{} terminated twice in {}", self.block, self.func.name);
        }
        self.func.block_mut(self.block).terminator = term;
    }

    pub fn is_terminated(&self) -> bool {
        !self.func.block(self.block).terminator.is_none()
    }

    fn def(&mut self, ty: IrType, make: impl FnOnce(Value) -> Instr) -> Value {
        let dest = self.func.new_value(ty);
        self.emit(make(dest));
        dest
    }

    pub fn const_int(&mut self, value: i64) -> Value {
        self.def(IrType::I64, |dest| Instr::ConstInt { dest, value })
    }

    pub fn const_float(&mut self, value: f64) -> Value {
        self.def(IrType::F64, |dest| Instr::ConstFloat { dest, value })
    }

    pub fn const_bool(&mut self, value: bool) -> Value {
        self.def(IrType::I1, |dest| Instr::ConstBool { dest, value })
    }

    pub fn null(&mut self, ty: IrType) -> Value {
        self.def(ty, |dest| Instr::Null { dest })
    }

    pub fn undef(&mut self, ty: IrType) -> Value {
        self.def(ty, |dest| Instr::Undef { dest })
    }

    pub fn int_binary(&mut self, op: IntBinOp, lhs: Value, rhs: Value) -> Value {
        self.def(IrType::I64, |dest| Instr::IntBinary { dest, op, lhs, rhs })
    }

    pub fn float_binary(&mut self, op: FloatBinOp, lhs: Value, rhs: Value) -> Value {
        self.def(IrType::F64, |dest| Instr::FloatBinary { dest, op, lhs, rhs })
    }

    pub fn int_overflows(&mut self, op: IntBinOp, lhs: Value, rhs: Value) -> Value {
        self.def(IrType::I1, |dest| Instr::IntOverflows { dest, op, lhs, rhs })
    }

    pub fn float_neg(&mut self, src: Value) -> Value {
        self.def(IrType::F64, |dest| Instr::FloatNeg { dest, src })
    }

    pub fn int_cmp(&mut self, cond: CmpCond, lhs: Value, rhs: Value) -> Value {
        self.def(IrType::I1, |dest| Instr::IntCmp { dest, cond, lhs, rhs })
    }

    pub fn float_cmp(&mut self, cond: CmpCond, lhs: Value, rhs: Value) -> Value {
        self.def(IrType::I1, |dest| Instr::FloatCmp { dest, cond, lhs, rhs })
    }

    pub fn int_to_float(&mut self, src: Value) -> Value {
        self.def(IrType::F64, |dest| Instr::IntToFloat { dest, src })
    }

    pub fn not(&mut self, src: Value) -> Value {
        self.def(IrType::I1, |dest| Instr::Not { dest, src })
    }

    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let ty = self.func.value_type(if_true);
        self.def(ty, |dest| Instr::Select { dest, cond, if_true, if_false })
    }

    pub fn bitcast(&mut self, src: Value) -> Value {
        self.def(IrType::I64, |dest| Instr::Bitcast { dest, src })
    }

    pub fn load(&mut self, ty: IrType, base: Value, offset: i32) -> Value {
        self.def(ty, |dest| Instr::Load { dest, base, offset })
    }

    pub fn store(&mut self, value: Value, base: Value, offset: i32) {
        self.emit(Instr::Store { value, base, offset });
    }

    pub fn stack_array(&mut self, elems: Vec<Value>) -> Value {
        self.def(IrType::RawPtr, |dest| Instr::StackArray { dest, elems })
    }

    /// Emit a call; returns the result unless `ret` is `Void`
    pub fn call(
        &mut self,
        callee: Callee,
        args: Vec<Value>,
        consumed: Vec<Value>,
        ret: IrType,
    ) -> Option<Value> {
        let dest = (ret != IrType::Void).then(|| self.func.new_value(ret));
        self.emit(Instr::Call { dest, callee, args, consumed });
        dest
    }

    pub fn landing_pad(&mut self) -> Value {
        self.def(IrType::Obj, |dest| Instr::LandingPad { dest })
    }

    /// Append an empty phi after the existing phis of the current block
    pub fn phi(&mut self, ty: IrType) -> Value {
        let dest = self.func.new_value(ty);
        let block = self.func.block_mut(self.block);
        let at = block.phi_count();
        block.instrs.insert(at, Instr::Phi { dest, incoming: Vec::new() });
        dest
    }

    pub fn func(&self) -> &IrFunction {
        self.func
    }

    pub fn func_mut(&mut self) -> &mut IrFunction {
        self.func
    }
}

/// Add an incoming edge to the phi defining `phi` in `block`
pub fn add_phi_incoming(func: &mut IrFunction, block: BlockId, phi: Value, from: BlockId, value: Value) {
    for instr in &mut func.block_mut(block).instrs {
        match instr {
            Instr::Phi { dest, incoming } if *dest == phi => {
                incoming.push((from, value));
                return;
            }
            Instr::Phi { .. } => {}
            _ => break,
        }
    }
    crate::ice!("no phi {} in {}", phi, block);
}
