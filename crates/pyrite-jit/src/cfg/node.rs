//! Statement and expression nodes of the input CFG

use std::sync::Arc;

use super::{CfgBlockId, Name};

/// Binary operator. `code()` is the operator number passed to the generic
/// `binop` runtime entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

impl BinOpKind {
    pub fn code(self) -> i64 {
        match self {
            BinOpKind::Add => 0,
            BinOpKind::Sub => 1,
            BinOpKind::Mul => 2,
            BinOpKind::Div => 3,
            BinOpKind::FloorDiv => 4,
            BinOpKind::Mod => 5,
            BinOpKind::Pow => 6,
            BinOpKind::LShift => 7,
            BinOpKind::RShift => 8,
            BinOpKind::BitAnd => 9,
            BinOpKind::BitOr => 10,
            BinOpKind::BitXor => 11,
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    Is,
    IsNot,
    In,
    NotIn,
}

impl CompareOp {
    pub fn code(self) -> i64 {
        match self {
            CompareOp::Eq => 20,
            CompareOp::NotEq => 21,
            CompareOp::Lt => 22,
            CompareOp::LtE => 23,
            CompareOp::Gt => 24,
            CompareOp::GtE => 25,
            CompareOp::Is => 26,
            CompareOp::IsNot => 27,
            CompareOp::In => 28,
            CompareOp::NotIn => 29,
        }
    }

    /// Whether the result is the negation of another operator's
    pub fn is_negated(self) -> bool {
        matches!(self, CompareOp::IsNot | CompareOp::NotIn)
    }
}

/// Unary operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOpKind {
    Neg,
    Pos,
    Not,
    Invert,
}

impl UnaryOpKind {
    pub fn code(self) -> i64 {
        match self {
            UnaryOpKind::Neg => 40,
            UnaryOpKind::Pos => 41,
            UnaryOpKind::Not => 42,
            UnaryOpKind::Invert => 43,
        }
    }
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Local variable load
    Name(Name),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
    Str(Arc<str>),
    Tuple(Vec<Expr>),
    Attribute { value: Box<Expr>, attr: Name },
    Call { func: Box<Expr>, args: Vec<Expr> },
    /// Method call `value.attr(args)` without materializing the bound method
    CallAttr { value: Box<Expr>, attr: Name, args: Vec<Expr> },
    BinOp { op: BinOpKind, left: Box<Expr>, right: Box<Expr> },
    Compare { op: CompareOp, left: Box<Expr>, right: Box<Expr> },
    UnaryOp { op: UnaryOpKind, operand: Box<Expr> },
    Subscript { value: Box<Expr>, index: Box<Expr> },
    GetIter(Box<Expr>),
    HasNext(Box<Expr>),
    Nonzero(Box<Expr>),
    /// The exception being handled; only valid in an exception successor
    LandingPad,
    /// Module-level global lookup
    Global(Name),
}

impl Expr {
    pub fn name(n: &str) -> Expr {
        Expr::Name(Name::from(n))
    }

    pub fn attr(value: Expr, attr: &str) -> Expr {
        Expr::Attribute { value: Box::new(value), attr: Name::from(attr) }
    }

    pub fn call(func: Expr, args: Vec<Expr>) -> Expr {
        Expr::Call { func: Box::new(func), args }
    }

    pub fn call_attr(value: Expr, attr: &str, args: Vec<Expr>) -> Expr {
        Expr::CallAttr { value: Box::new(value), attr: Name::from(attr), args }
    }

    pub fn binop(op: BinOpKind, left: Expr, right: Expr) -> Expr {
        Expr::BinOp { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Expr {
        Expr::Compare { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn unary(op: UnaryOpKind, operand: Expr) -> Expr {
        Expr::UnaryOp { op, operand: Box::new(operand) }
    }

    pub fn subscript(value: Expr, index: Expr) -> Expr {
        Expr::Subscript { value: Box::new(value), index: Box::new(index) }
    }

    /// Names read by this expression, in evaluation order
    pub fn reads(&self, out: &mut Vec<Name>) {
        match self {
            Expr::Name(n) => out.push(n.clone()),
            Expr::Int(_)
            | Expr::Float(_)
            | Expr::Bool(_)
            | Expr::None
            | Expr::Str(_)
            | Expr::LandingPad
            | Expr::Global(_) => {}
            Expr::Tuple(elts) => elts.iter().for_each(|e| e.reads(out)),
            Expr::Attribute { value, .. } => value.reads(out),
            Expr::Call { func, args } => {
                func.reads(out);
                args.iter().for_each(|e| e.reads(out));
            }
            Expr::CallAttr { value, args, .. } => {
                value.reads(out);
                args.iter().for_each(|e| e.reads(out));
            }
            Expr::BinOp { left, right, .. } | Expr::Compare { left, right, .. } => {
                left.reads(out);
                right.reads(out);
            }
            Expr::Subscript { value, index } => {
                value.reads(out);
                index.reads(out);
            }
            Expr::UnaryOp { operand: e, .. }
            | Expr::GetIter(e)
            | Expr::HasNext(e)
            | Expr::Nonzero(e) => e.reads(out),
        }
    }
}

/// Statement node. The last statement of every block is a terminator
/// (`Jump`, `Branch`, `Invoke`, `Return` or `Raise`) and no other is.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { target: Name, value: Expr },
    SetAttr { target: Expr, attr: Name, value: Expr },
    Expr(Expr),
    Jump(CfgBlockId),
    Branch { test: Expr, then_block: CfgBlockId, else_block: CfgBlockId },
    /// Run `stmt`; continue at `normal`, or at `exc` if it raises.
    /// `stmt` is an `Assign`, `SetAttr` or `Expr`.
    Invoke { stmt: Box<Stmt>, normal: CfgBlockId, exc: CfgBlockId },
    Return(Option<Expr>),
    Raise(Expr),
}

impl Stmt {
    pub fn assign(target: &str, value: Expr) -> Stmt {
        Stmt::Assign { target: Name::from(target), value }
    }

    pub fn invoke(stmt: Stmt, normal: CfgBlockId, exc: CfgBlockId) -> Stmt {
        Stmt::Invoke { stmt: Box::new(stmt), normal, exc }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Stmt::Jump(_) | Stmt::Branch { .. } | Stmt::Invoke { .. } | Stmt::Return(_) | Stmt::Raise(_)
        )
    }

    /// Successors in edge order
    pub fn successors(&self) -> Vec<CfgBlockId> {
        match self {
            Stmt::Jump(t) => vec![*t],
            Stmt::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            Stmt::Invoke { normal, exc, .. } => vec![*normal, *exc],
            _ => vec![],
        }
    }

    pub(crate) fn map_targets(&mut self, f: &mut impl FnMut(CfgBlockId) -> CfgBlockId) {
        match self {
            Stmt::Jump(t) => *t = f(*t),
            Stmt::Branch { then_block, else_block, .. } => {
                *then_block = f(*then_block);
                *else_block = f(*else_block);
            }
            Stmt::Invoke { normal, exc, .. } => {
                *normal = f(*normal);
                *exc = f(*exc);
            }
            _ => {}
        }
    }

    /// The name this statement binds, if any
    pub fn target(&self) -> Option<&Name> {
        match self {
            Stmt::Assign { target, .. } => Some(target),
            Stmt::Invoke { stmt, .. } => stmt.target(),
            _ => None,
        }
    }

    /// Names read by this statement, in evaluation order
    pub fn reads(&self) -> Vec<Name> {
        let mut out = Vec::new();
        match self {
            Stmt::Assign { value, .. } | Stmt::Expr(value) | Stmt::Raise(value) => value.reads(&mut out),
            Stmt::SetAttr { target, value, .. } => {
                value.reads(&mut out);
                target.reads(&mut out);
            }
            Stmt::Branch { test, .. } => test.reads(&mut out),
            Stmt::Invoke { stmt, .. } => out = stmt.reads(),
            Stmt::Return(Some(value)) => value.reads(&mut out),
            Stmt::Return(None) | Stmt::Jump(_) => {}
        }
        out
    }
}
