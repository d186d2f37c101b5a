//! Expansion of refcount pseudo-instructions
//!
//! An incref becomes a load, add and store of the reference count. A
//! decref subtracts and, on reaching zero, loads the destructor from the
//! object's class and calls it. Nullable values get a null check around
//! either sequence.

use crate::ir::{BlockId, Callee, CmpCond, Instr, IntBinOp, IrBuilder, IrFunction, IrType, Terminator, Value};
use crate::runtime::object::{CLASS_OFFSET, REFCOUNT_OFFSET, TP_DEALLOC_OFFSET};

/// Expand every pseudo-instruction; returns how many blocks were added
pub(super) fn materialize(func: &mut IrFunction) -> usize {
    let before = func.blocks.len();
    // split tails are appended, so they are visited later in this loop
    let mut b = 0;
    while b < func.blocks.len() {
        expand_block(func, BlockId(b as u32));
        b += 1;
    }
    func.blocks.len() - before
}

fn expand_block(func: &mut IrFunction, b: BlockId) {
    loop {
        let Some(at) = func.block(b).instrs.iter().position(Instr::is_refcount_op) else { return };
        let op = func.block_mut(b).instrs.remove(at);
        match op {
            Instr::Incref { value, amount, nullable: false } => {
                let seq = incref_sequence(func, value, amount);
                func.block_mut(b).instrs.splice(at..at, seq);
            }
            Instr::Incref { value, amount, nullable: true } => {
                let cont = func.split_block(b, at);
                let mut builder = IrBuilder::new(func, b);
                let bump = builder.create_block();
                null_check(&mut builder, value, cont, bump);
                builder.switch_to_block(bump);
                for instr in incref_sequence(builder.func_mut(), value, amount) {
                    builder.emit(instr);
                }
                builder.terminate(Terminator::Jump(cont));
                return;
            }
            Instr::Decref { value, amount, nullable } => {
                let cont = func.split_block(b, at);
                let mut builder = IrBuilder::new(func, b);
                if nullable {
                    let dec = builder.create_block();
                    null_check(&mut builder, value, cont, dec);
                    builder.switch_to_block(dec);
                }
                decref_sequence(&mut builder, value, amount, cont);
                return;
            }
            other => crate::ice!("{} is not a refcount operation", other),
        }
    }
}

/// Branch to `if_null` when `value` is null, else to `if_set`
fn null_check(builder: &mut IrBuilder<'_>, value: Value, if_null: BlockId, if_set: BlockId) {
    let null = builder.null(IrType::Obj);
    let is_null = builder.int_cmp(CmpCond::Eq, value, null);
    builder.terminate(Terminator::Branch { cond: is_null, then_block: if_null, else_block: if_set });
}

fn incref_sequence(func: &mut IrFunction, value: Value, amount: u32) -> Vec<Instr> {
    let count = func.new_value(IrType::I64);
    let delta = func.new_value(IrType::I64);
    let updated = func.new_value(IrType::I64);
    vec![
        Instr::Load { dest: count, base: value, offset: REFCOUNT_OFFSET },
        Instr::ConstInt { dest: delta, value: i64::from(amount) },
        Instr::IntBinary { dest: updated, op: IntBinOp::Add, lhs: count, rhs: delta },
        Instr::Store { value: updated, base: value, offset: REFCOUNT_OFFSET },
    ]
}

/// Subtract `amount` in the current block and deallocate on zero; every
/// path ends up in `cont`
fn decref_sequence(builder: &mut IrBuilder<'_>, value: Value, amount: u32, cont: BlockId) {
    let count = builder.load(IrType::I64, value, REFCOUNT_OFFSET);
    let delta = builder.const_int(i64::from(amount));
    let updated = builder.int_binary(IntBinOp::Sub, count, delta);
    builder.store(updated, value, REFCOUNT_OFFSET);
    let zero = builder.const_int(0);
    let dead = builder.int_cmp(CmpCond::Eq, updated, zero);
    let dealloc = builder.create_block();
    builder.terminate(Terminator::Branch { cond: dead, then_block: dealloc, else_block: cont });

    builder.switch_to_block(dealloc);
    let class = builder.load(IrType::RawPtr, value, CLASS_OFFSET);
    let dtor = builder.load(IrType::RawPtr, class, TP_DEALLOC_OFFSET);
    builder.call(Callee::Indirect(dtor), vec![value], vec![], IrType::Void);
    builder.terminate(Terminator::Jump(cont));
}
