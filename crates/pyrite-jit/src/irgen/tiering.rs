//! Tier-up hooks emitted into unoptimized code

use super::generator::SymbolTable;
use super::IrEmitter;
use crate::ir::{Callee, CmpCond, IntBinOp, IrType, Terminator, Value};
use crate::runtime::{CodeRef, GlobalRef, RuntimeFn};

/// Increment the counter at `counter` and test it against `threshold`.
/// The update is a plain load and store; a lost increment only delays the
/// tier-up.
fn bump_counter(em: &mut IrEmitter<'_>, counter: GlobalRef, threshold: i64) -> Value {
    let counter = em.global(counter);
    let mut b = em.builder();
    let count = b.load(IrType::I64, counter, 0);
    let one = b.const_int(1);
    let count = b.int_binary(IntBinOp::Add, count, one);
    b.store(count, counter, 0);
    let limit = b.const_int(threshold);
    b.int_cmp(CmpCond::Gt, count, limit)
}

/// Count the call; once hot, ask the runtime for a better version and
/// tail-call it with the same arguments if one comes back. Emission
/// continues on the fall-through path.
pub(super) fn emit_reopt_prologue(em: &mut IrEmitter<'_>, code_ref: CodeRef, threshold: i64, params: Vec<Value>) {
    let hot = bump_counter(em, GlobalRef::CallCounter(code_ref), threshold);
    let reopt = em.create_block();
    let cont = em.create_block();
    em.branch(hot, reopt, cont);

    em.switch_to(reopt);
    let record = em.global(GlobalRef::CompiledFunction(code_ref));
    let entry = em.call_runtime_value(RuntimeFn::Reoptimize, vec![record]);
    let null = em.builder().null(IrType::RawPtr);
    let declined = em.builder().int_cmp(CmpCond::Eq, entry, null);
    let forward = em.create_block();
    em.branch(declined, cont, forward);

    em.switch_to(forward);
    let style = em.style();
    match em.emit_call(Callee::Indirect(entry), Some(style), false, params, vec![], IrType::Obj) {
        Some(r) => em.terminate(Terminator::Return(Some(r))),
        None => crate::ice!("reoptimized entry returned no value"),
    }
    em.switch_to(cont);
}

/// Count the back-edge; once hot, spill `live` to a frame and hand it to
/// the runtime's OSR service, returning whatever the new version returns
pub(super) fn emit_osr_exit(
    em: &mut IrEmitter<'_>,
    code_ref: CodeRef,
    index: u32,
    threshold: i64,
    live: &SymbolTable,
) {
    let hot = bump_counter(em, GlobalRef::BackedgeCounter(code_ref, index), threshold);
    let exit = em.create_block();
    let cont = em.create_block();
    em.branch(hot, exit, cont);

    em.switch_to(exit);
    let mut slots = Vec::new();
    for var in live.values() {
        var.serialize_to_frame(em, &mut slots);
    }
    let frame = em.builder().stack_array(slots);
    let descriptor = em.global(GlobalRef::OsrDescriptor(code_ref, index));
    let r = em.call_runtime_value(RuntimeFn::OnStackReplace, vec![descriptor, frame]);
    em.terminate(Terminator::Return(Some(r)));
    em.switch_to(cont);
}
