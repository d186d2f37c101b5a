//! Pretty-printing for IR
//!
//! Display implementations for debugging and dump output.

use std::fmt;

use super::instr::{Callee, CmpCond, FloatBinOp, Instr, IntBinOp, IrBlock, IrFunction, Terminator, Value};

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function @{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", p, self.value_type(*p))?;
            if let Some(info) = self.ref_info(*p) {
                write!(f, " [{}]", info)?;
            }
        }
        writeln!(f, ") -> {} {{", self.ret)?;
        for block in &self.blocks {
            write!(f, "{}", BlockWithTypes { func: self, block })?;
        }
        writeln!(f, "}}")
    }
}

struct BlockWithTypes<'a> {
    func: &'a IrFunction,
    block: &'a IrBlock,
}

impl fmt::Display for BlockWithTypes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  {}:", self.block.id)?;
        for instr in &self.block.instrs {
            write!(f, "    {}", instr)?;
            if let Some(dest) = instr.dest() {
                write!(f, "  ; {}", self.func.value_type(dest))?;
                if let Some(info) = self.func.ref_info(dest) {
                    write!(f, " [{}]", info)?;
                }
            }
            writeln!(f)?;
        }
        writeln!(f, "    {}", self.block.terminator)
    }
}

impl fmt::Display for IntBinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntBinOp::Add => "iadd",
            IntBinOp::Sub => "isub",
            IntBinOp::Mul => "imul",
            IntBinOp::And => "and",
            IntBinOp::Or => "or",
            IntBinOp::Xor => "xor",
        };
        f.write_str(s)
    }
}

impl fmt::Display for FloatBinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FloatBinOp::Add => "fadd",
            FloatBinOp::Sub => "fsub",
            FloatBinOp::Mul => "fmul",
        };
        f.write_str(s)
    }
}

impl fmt::Display for CmpCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpCond::Eq => "eq",
            CmpCond::Ne => "ne",
            CmpCond::Lt => "lt",
            CmpCond::Le => "le",
            CmpCond::Gt => "gt",
            CmpCond::Ge => "ge",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Runtime(rt) => write!(f, "@{}", rt.symbol()),
            Callee::Direct(code) => write!(f, "@{}", code),
            Callee::Indirect(v) => write!(f, "*{}", v),
        }
    }
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[Value]) -> fmt::Result {
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", v)?;
    }
    Ok(())
}

fn write_call(
    f: &mut fmt::Formatter<'_>,
    dest: &Option<Value>,
    callee: &Callee,
    args: &[Value],
    consumed: &[Value],
) -> fmt::Result {
    if let Some(d) = dest {
        write!(f, "{} = ", d)?;
    }
    write!(f, "call {}(", callee)?;
    write_values(f, args)?;
    write!(f, ")")?;
    if !consumed.is_empty() {
        write!(f, " consumes [")?;
        write_values(f, consumed)?;
        write!(f, "]")?;
    }
    Ok(())
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::ConstInt { dest, value } => write!(f, "{} = const {}", dest, value),
            Instr::ConstFloat { dest, value } => write!(f, "{} = const {:?}", dest, value),
            Instr::ConstBool { dest, value } => write!(f, "{} = const {}", dest, value),
            Instr::Null { dest } => write!(f, "{} = null", dest),
            Instr::Undef { dest } => write!(f, "{} = undef", dest),
            Instr::IntBinary { dest, op, lhs, rhs } => write!(f, "{} = {} {}, {}", dest, op, lhs, rhs),
            Instr::FloatBinary { dest, op, lhs, rhs } => write!(f, "{} = {} {}, {}", dest, op, lhs, rhs),
            Instr::IntOverflows { dest, op, lhs, rhs } => write!(f, "{} = {}.overflows {}, {}", dest, op, lhs, rhs),
            Instr::FloatNeg { dest, src } => write!(f, "{} = fneg {}", dest, src),
            Instr::IntCmp { dest, cond, lhs, rhs } => write!(f, "{} = icmp {} {}, {}", dest, cond, lhs, rhs),
            Instr::FloatCmp { dest, cond, lhs, rhs } => write!(f, "{} = fcmp {} {}, {}", dest, cond, lhs, rhs),
            Instr::IntToFloat { dest, src } => write!(f, "{} = sitofp {}", dest, src),
            Instr::Not { dest, src } => write!(f, "{} = not {}", dest, src),
            Instr::Select { dest, cond, if_true, if_false } => {
                write!(f, "{} = select {}, {}, {}", dest, cond, if_true, if_false)
            }
            Instr::Bitcast { dest, src } => write!(f, "{} = bitcast {}", dest, src),
            Instr::Load { dest, base, offset } => write!(f, "{} = load [{} + {}]", dest, base, offset),
            Instr::Store { value, base, offset } => write!(f, "store {}, [{} + {}]", value, base, offset),
            Instr::StackArray { dest, elems } => {
                write!(f, "{} = stack_array [", dest)?;
                write_values(f, elems)?;
                write!(f, "]")
            }
            Instr::Call { dest, callee, args, consumed } => write_call(f, dest, callee, args, consumed),
            Instr::LandingPad { dest } => write!(f, "{} = landingpad", dest),
            Instr::Phi { dest, incoming } => {
                write!(f, "{} = phi ", dest)?;
                for (i, (block, value)) in incoming.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[{}: {}]", block, value)?;
                }
                Ok(())
            }
            Instr::Incref { value, amount, nullable } => {
                write!(f, "incref{} {}, {}", if *nullable { "?" } else { "" }, value, amount)
            }
            Instr::Decref { value, amount, nullable } => {
                write!(f, "decref{} {}, {}", if *nullable { "?" } else { "" }, value, amount)
            }
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(target) => write!(f, "jump {}", target),
            Terminator::Branch { cond, then_block, else_block } => {
                write!(f, "branch {}, {}, {}", cond, then_block, else_block)
            }
            Terminator::Invoke { dest, callee, args, consumed, normal, unwind } => {
                write!(f, "invoke ")?;
                write_call(f, dest, callee, args, consumed)?;
                write!(f, " to {} unwind {}", normal, unwind)
            }
            Terminator::Return(Some(v)) => write!(f, "return {}", v),
            Terminator::Return(None) => write!(f, "return"),
            Terminator::Unreachable => write!(f, "unreachable"),
            Terminator::None => write!(f, "<unterminated>"),
        }
    }
}
