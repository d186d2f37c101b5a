//! Statement and expression lowering within one block
//!
//! A `BlockGenerator` walks the straight-line statements of a CFG block
//! against the symbol table the driver seeded it with. Terminators are the
//! driver's business; everything else lands here.

use std::collections::BTreeMap;

use super::IrEmitter;
use crate::cfg::{Expr, Name, Stmt};
use crate::compvars::{CallattrFlags, UnboxedVal, VarRef, VarValue};
use crate::runtime::{GlobalRef, RuntimeFn};

/// Variables bound at a program point, by name
pub(crate) type SymbolTable = BTreeMap<Name, VarRef>;

const SHADOW_PREFIX: &str = "!is_defined_";

/// Name of the bool variable recording whether `name` is bound
pub(crate) fn shadow_name(name: &str) -> Name {
    Name::from(format!("{}{}", SHADOW_PREFIX, name))
}

pub(crate) fn is_shadow(name: &str) -> bool {
    name.starts_with(SHADOW_PREFIX)
}

pub(crate) struct BlockGenerator<'g, 'a> {
    em: &'g mut IrEmitter<'a>,
    table: &'g mut SymbolTable,
}

impl<'g, 'a> BlockGenerator<'g, 'a> {
    pub fn new(em: &'g mut IrEmitter<'a>, table: &'g mut SymbolTable) -> Self {
        BlockGenerator { em, table }
    }

    /// Lower an assignment, attribute store or expression statement
    pub fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { target, value } => {
                let v = self.expr(value);
                self.table.remove(&shadow_name(target));
                self.table.insert(target.clone(), v);
            }
            Stmt::SetAttr { target, attr, value } => {
                let v = self.expr(value);
                let obj = self.expr(target);
                obj.setattr(self.em, attr, &v);
            }
            Stmt::Expr(e) => {
                self.expr(e);
            }
            other => crate::ice!("{:?} is not a simple statement", other),
        }
    }

    pub fn expr(&mut self, expr: &Expr) -> VarRef {
        let types = self.em.types();
        match expr {
            Expr::Name(name) => self.load_name(name),
            Expr::Int(n) => {
                let v = self.em.builder().const_int(*n);
                VarRef::new(types.int(), VarValue::Unboxed(UnboxedVal::new(v, Some(*n))))
            }
            Expr::Float(x) => {
                let v = self.em.builder().const_float(*x);
                VarRef::ir(types.float(), v)
            }
            Expr::Bool(b) => {
                let v = self.em.builder().const_bool(*b);
                VarRef::ir(types.bool_(), v)
            }
            Expr::None => {
                let v = self.em.global(GlobalRef::None);
                VarRef::ir(types.none(), v)
            }
            Expr::Str(s) => VarRef::new(types.str_constant(), VarValue::StrConstant(s.clone())),
            Expr::Tuple(elts) => {
                let vars: Vec<VarRef> = elts.iter().map(|e| self.expr(e)).collect();
                let ty = types.tuple(vars.iter().map(|v| v.ty().clone()).collect());
                VarRef::new(ty, VarValue::Tuple(vars))
            }
            Expr::Attribute { value, attr } => {
                let obj = self.expr(value);
                obj.getattr(self.em, attr)
            }
            Expr::Call { func, args } => {
                let f = self.expr(func);
                let args = self.exprs(args);
                f.call(self.em, &args)
            }
            Expr::CallAttr { value, attr, args } => {
                let obj = self.expr(value);
                let args = self.exprs(args);
                match obj.callattr(self.em, attr, &args, CallattrFlags::default()) {
                    Some(r) => r,
                    None => crate::ice!("callattr .{} produced no value", attr),
                }
            }
            Expr::BinOp { op, left, right } => {
                let l = self.expr(left);
                let r = self.expr(right);
                l.binexp(self.em, *op, &r)
            }
            Expr::Compare { op, left, right } => {
                let l = self.expr(left);
                let r = self.expr(right);
                l.compare(self.em, *op, &r)
            }
            Expr::UnaryOp { op, operand } => {
                let v = self.expr(operand);
                v.unaryop(self.em, *op)
            }
            Expr::Subscript { value, index } => {
                let obj = self.expr(value);
                let idx = self.expr(index);
                obj.getitem(self.em, &idx)
            }
            Expr::GetIter(e) => {
                let v = self.expr(e);
                v.get_pyston_iter(self.em)
            }
            Expr::HasNext(e) => {
                let v = self.expr(e);
                v.hasnext(self.em)
            }
            Expr::Nonzero(e) => {
                let v = self.expr(e);
                v.nonzero(self.em)
            }
            Expr::LandingPad => {
                let v = self.em.builder().landing_pad();
                self.em.tag_owned(v);
                VarRef::ir(types.unknown(), v)
            }
            Expr::Global(name) => {
                let key = self.em.str_const(name);
                let style = self.em.preferred_style();
                let v = self.em.call_runtime_value(RuntimeFn::GetGlobal(style), vec![key]);
                VarRef::ir(types.unknown(), v)
            }
        }
    }

    fn exprs(&mut self, exprs: &[Expr]) -> Vec<VarRef> {
        exprs.iter().map(|e| self.expr(e)).collect()
    }

    /// Read a local. A conditionally bound name is checked against its
    /// shadow first; an unbound one raises.
    fn load_name(&mut self, name: &Name) -> VarRef {
        if let Some(defined) = self.table.remove(&shadow_name(name)) {
            let bound = self.em.create_block();
            let unbound = self.em.create_block();
            self.em.branch(defined.ir_value(), bound, unbound);
            self.em.switch_to(unbound);
            self.raise_unbound(name);
            self.em.switch_to(bound);
        }
        match self.table.get(name) {
            Some(v) => v.clone(),
            None => {
                self.raise_unbound(name);
                VarRef::new(self.em.types().undef(), VarValue::Undef)
            }
        }
    }

    fn raise_unbound(&mut self, name: &str) {
        let s = self.em.str_const(name);
        self.em.call_runtime(RuntimeFn::RaiseUnboundLocal, vec![s], vec![]);
    }
}

