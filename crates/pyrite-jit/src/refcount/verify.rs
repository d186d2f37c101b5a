//! Debug scan for ref-type tags

use crate::ir::{IrFunction, RefType, Value};

/// Every heap-object value the function mentions (parameter, result,
/// operand or global) must carry a decided ref-type tag
pub fn verify_ref_tags(func: &IrFunction) {
    let check = |v: Value| {
        if !func.value_type(v).is_object() {
            return;
        }
        match func.ref_info(v) {
            None => crate::ice!("heap value {} in {} has no ref-type tag", v, func.name),
            Some(info) if info.ref_type == RefType::Unknown => {
                crate::ice!("heap value {} in {} has an undecided ref type", v, func.name)
            }
            Some(_) => {}
        }
    };

    func.params.iter().copied().for_each(check);
    for block in &func.blocks {
        for instr in &block.instrs {
            if instr.is_refcount_op() {
                crate::ice!("{} in {} already holds refcount operations", block.id, func.name);
            }
            instr.dest().into_iter().chain(instr.operands()).for_each(check);
        }
        block.terminator.dest().into_iter().chain(block.terminator.operands()).for_each(check);
    }
    (0..func.num_values())
        .map(|i| Value(i as u32))
        .filter(|v| func.global_of(*v).is_some())
        .for_each(check);
}
