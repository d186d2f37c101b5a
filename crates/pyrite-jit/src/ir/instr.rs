//! IR instructions, blocks, and functions
//!
//! Values are defined once: by an instruction, as a function parameter, or as
//! a reference to a process-wide global. Blocks end in an explicit
//! terminator; `Invoke` is the only terminator with an exceptional edge.

use rustc_hash::FxHashMap;

use super::types::{IrType, RefInfo, RefType};
use crate::runtime::compiled::CodeRef;
use crate::runtime::entry_points::RuntimeFn;
use crate::runtime::object::GlobalRef;

/// SSA value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Basic block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Integer binary operation (wrapping, 64-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntBinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

/// Float binary operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatBinOp {
    Add,
    Sub,
    Mul,
}

/// Comparison condition. Integer comparisons are signed; float comparisons
/// are ordered except `Ne`, which is true for unordered operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Call target
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    /// Runtime entry point with a fixed signature
    Runtime(RuntimeFn),
    /// Entry point of another compiled function
    Direct(CodeRef),
    /// Code address held in a value
    Indirect(Value),
}

/// IR instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    ConstInt { dest: Value, value: i64 },
    ConstFloat { dest: Value, value: f64 },
    ConstBool { dest: Value, value: bool },
    /// Null pointer of the destination's type
    Null { dest: Value },
    /// Unspecified bit pattern of the destination's type
    Undef { dest: Value },

    IntBinary { dest: Value, op: IntBinOp, lhs: Value, rhs: Value },
    /// Whether `lhs op rhs` leaves the signed 64-bit range
    IntOverflows { dest: Value, op: IntBinOp, lhs: Value, rhs: Value },
    FloatBinary { dest: Value, op: FloatBinOp, lhs: Value, rhs: Value },
    FloatNeg { dest: Value, src: Value },
    IntCmp { dest: Value, cond: CmpCond, lhs: Value, rhs: Value },
    FloatCmp { dest: Value, cond: CmpCond, lhs: Value, rhs: Value },
    IntToFloat { dest: Value, src: Value },
    Not { dest: Value, src: Value },
    Select { dest: Value, cond: Value, if_true: Value, if_false: Value },
    /// Reinterpret any scalar as a 64-bit frame slot
    Bitcast { dest: Value, src: Value },

    Load { dest: Value, base: Value, offset: i32 },
    Store { value: Value, base: Value, offset: i32 },
    /// Stack-allocated array of 8-byte slots holding `elems`
    StackArray { dest: Value, elems: Vec<Value> },

    /// Call that cannot unwind into this function. `consumed` lists values
    /// whose reference the callee takes over.
    Call { dest: Option<Value>, callee: Callee, args: Vec<Value>, consumed: Vec<Value> },
    /// The exception in flight on entry to an unwind destination
    LandingPad { dest: Value },
    Phi { dest: Value, incoming: Vec<(BlockId, Value)> },

    /// Refcount pseudo-instructions, expanded by the refcount pass
    Incref { value: Value, amount: u32, nullable: bool },
    Decref { value: Value, amount: u32, nullable: bool },
}

impl Instr {
    /// The value defined by this instruction, if any
    pub fn dest(&self) -> Option<Value> {
        match self {
            Instr::ConstInt { dest, .. }
            | Instr::ConstFloat { dest, .. }
            | Instr::ConstBool { dest, .. }
            | Instr::Null { dest }
            | Instr::Undef { dest }
            | Instr::IntBinary { dest, .. }
            | Instr::IntOverflows { dest, .. }
            | Instr::FloatBinary { dest, .. }
            | Instr::FloatNeg { dest, .. }
            | Instr::IntCmp { dest, .. }
            | Instr::FloatCmp { dest, .. }
            | Instr::IntToFloat { dest, .. }
            | Instr::Not { dest, .. }
            | Instr::Select { dest, .. }
            | Instr::Bitcast { dest, .. }
            | Instr::Load { dest, .. }
            | Instr::StackArray { dest, .. }
            | Instr::LandingPad { dest }
            | Instr::Phi { dest, .. } => Some(*dest),
            Instr::Call { dest, .. } => *dest,
            Instr::Store { .. } | Instr::Incref { .. } | Instr::Decref { .. } => None,
        }
    }

    /// Every value this instruction reads, in operand order
    pub fn operands(&self) -> Vec<Value> {
        match self {
            Instr::ConstInt { .. }
            | Instr::ConstFloat { .. }
            | Instr::ConstBool { .. }
            | Instr::Null { .. }
            | Instr::Undef { .. }
            | Instr::LandingPad { .. } => vec![],
            Instr::IntBinary { lhs, rhs, .. }
            | Instr::IntOverflows { lhs, rhs, .. }
            | Instr::FloatBinary { lhs, rhs, .. }
            | Instr::IntCmp { lhs, rhs, .. }
            | Instr::FloatCmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Instr::FloatNeg { src, .. }
            | Instr::IntToFloat { src, .. }
            | Instr::Not { src, .. }
            | Instr::Bitcast { src, .. } => vec![*src],
            Instr::Select { cond, if_true, if_false, .. } => vec![*cond, *if_true, *if_false],
            Instr::Load { base, .. } => vec![*base],
            Instr::Store { value, base, .. } => vec![*value, *base],
            Instr::StackArray { elems, .. } => elems.clone(),
            Instr::Call { callee, args, .. } => call_operands(callee, args),
            Instr::Phi { incoming, .. } => incoming.iter().map(|(_, v)| *v).collect(),
            Instr::Incref { value, .. } | Instr::Decref { value, .. } => vec![*value],
        }
    }

    /// Values whose reference this instruction takes over
    pub fn consumed(&self) -> &[Value] {
        match self {
            Instr::Call { consumed, .. } => consumed,
            _ => &[],
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Instr::Phi { .. })
    }

    pub fn is_refcount_op(&self) -> bool {
        matches!(self, Instr::Incref { .. } | Instr::Decref { .. })
    }

    /// Whether this instruction has effects beyond defining its result
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Instr::Store { .. }
                | Instr::Call { .. }
                | Instr::LandingPad { .. }
                | Instr::Incref { .. }
                | Instr::Decref { .. }
        )
    }
}

fn call_operands(callee: &Callee, args: &[Value]) -> Vec<Value> {
    let mut ops = Vec::with_capacity(args.len() + 1);
    if let Callee::Indirect(target) = callee {
        ops.push(*target);
    }
    ops.extend_from_slice(args);
    ops
}

/// Block terminator
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump(BlockId),
    Branch { cond: Value, then_block: BlockId, else_block: BlockId },
    /// Call that continues at `normal`, or at `unwind` if the callee raises.
    /// `dest` is only defined along the normal edge.
    Invoke {
        dest: Option<Value>,
        callee: Callee,
        args: Vec<Value>,
        consumed: Vec<Value>,
        normal: BlockId,
        unwind: BlockId,
    },
    /// Return; a returned heap object hands one reference to the caller
    Return(Option<Value>),
    Unreachable,
    /// Not yet terminated (only valid during construction)
    None,
}

impl Terminator {
    /// Successor blocks in edge order (may contain duplicates)
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(target) => vec![*target],
            Terminator::Branch { then_block, else_block, .. } => vec![*then_block, *else_block],
            Terminator::Invoke { normal, unwind, .. } => vec![*normal, *unwind],
            Terminator::Return(_) | Terminator::Unreachable | Terminator::None => vec![],
        }
    }

    /// Every value this terminator reads
    pub fn operands(&self) -> Vec<Value> {
        match self {
            Terminator::Branch { cond, .. } => vec![*cond],
            Terminator::Invoke { callee, args, .. } => call_operands(callee, args),
            Terminator::Return(Some(v)) => vec![*v],
            _ => vec![],
        }
    }

    /// Values whose reference this terminator takes over
    pub fn consumed(&self) -> Vec<Value> {
        match self {
            Terminator::Invoke { consumed, .. } => consumed.clone(),
            Terminator::Return(Some(v)) => vec![*v],
            _ => vec![],
        }
    }

    /// The value an invoke defines on its normal edge
    pub fn dest(&self) -> Option<Value> {
        match self {
            Terminator::Invoke { dest, .. } => *dest,
            _ => None,
        }
    }

    /// Redirect every edge to `old` so it targets `new`
    pub fn retarget(&mut self, old: BlockId, new: BlockId) {
        self.map_targets(|b| if b == old { new } else { b });
    }

    /// Rewrite every successor through `f`
    pub fn map_targets(&mut self, f: impl Fn(BlockId) -> BlockId) {
        match self {
            Terminator::Jump(target) => *target = f(*target),
            Terminator::Branch { then_block, else_block, .. } => {
                *then_block = f(*then_block);
                *else_block = f(*else_block);
            }
            Terminator::Invoke { normal, unwind, .. } => {
                *normal = f(*normal);
                *unwind = f(*unwind);
            }
            Terminator::Return(_) | Terminator::Unreachable | Terminator::None => {}
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Terminator::None)
    }
}

/// Basic block
#[derive(Debug, Clone)]
pub struct IrBlock {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
    pub terminator: Terminator,
}

impl IrBlock {
    fn new(id: BlockId) -> Self {
        IrBlock { id, instrs: Vec::new(), terminator: Terminator::None }
    }

    /// Number of leading phi instructions
    pub fn phi_count(&self) -> usize {
        self.instrs.iter().take_while(|i| i.is_phi()).count()
    }
}

/// Where a value comes from
#[derive(Debug, Clone, PartialEq)]
pub enum ValueOrigin {
    /// Defined by an instruction or an invoke terminator
    Instr,
    /// Function parameter
    Param(u32),
    /// Process-wide constant or global
    Global(GlobalRef),
}

#[derive(Debug, Clone)]
struct ValueInfo {
    ty: IrType,
    origin: ValueOrigin,
}

/// A function in IR form
#[derive(Debug, Clone)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<Value>,
    pub ret: IrType,
    pub blocks: Vec<IrBlock>,
    pub entry: BlockId,
    values: Vec<ValueInfo>,
    globals: FxHashMap<GlobalRef, Value>,
    refs: FxHashMap<Value, RefInfo>,
}

impl IrFunction {
    /// Create a function with an empty entry block
    pub fn new(name: impl Into<String>, param_types: &[IrType], ret: IrType) -> Self {
        let mut func = IrFunction {
            name: name.into(),
            params: Vec::with_capacity(param_types.len()),
            ret,
            blocks: Vec::new(),
            entry: BlockId(0),
            values: Vec::new(),
            globals: FxHashMap::default(),
            refs: FxHashMap::default(),
        };
        for (i, ty) in param_types.iter().enumerate() {
            let v = func.push_value(*ty, ValueOrigin::Param(i as u32));
            func.params.push(v);
        }
        func.entry = func.add_block();
        func
    }

    fn push_value(&mut self, ty: IrType, origin: ValueOrigin) -> Value {
        let v = Value(self.values.len() as u32);
        self.values.push(ValueInfo { ty, origin });
        v
    }

    /// Allocate a value to be defined by an instruction
    pub fn new_value(&mut self, ty: IrType) -> Value {
        self.push_value(ty, ValueOrigin::Instr)
    }

    pub fn value_type(&self, v: Value) -> IrType {
        self.values[v.0 as usize].ty
    }

    pub fn value_origin(&self, v: Value) -> &ValueOrigin {
        &self.values[v.0 as usize].origin
    }

    /// The global a value refers to, if it is one
    pub fn global_of(&self, v: Value) -> Option<&GlobalRef> {
        match self.value_origin(v) {
            ValueOrigin::Global(g) => Some(g),
            _ => None,
        }
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    pub fn param(&self, index: usize) -> Value {
        self.params[index]
    }

    /// The value standing for a global. Heap-object globals are borrowed.
    pub fn global(&mut self, global: GlobalRef) -> Value {
        if let Some(v) = self.globals.get(&global) {
            return *v;
        }
        let ty = global.ir_type();
        let v = self.push_value(ty, ValueOrigin::Global(global.clone()));
        if ty.is_object() {
            self.refs.insert(v, RefInfo::borrowed());
        }
        self.globals.insert(global, v);
        v
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(IrBlock::new(id));
        id
    }

    pub fn block(&self, id: BlockId) -> &IrBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut IrBlock {
        &mut self.blocks[id.index()]
    }

    /// Tag a heap-object value. Every such value is tagged exactly once.
    pub fn set_ref_type(&mut self, v: Value, ref_type: RefType, nullable: bool) {
        if !self.value_type(v).is_object() {
            crate::ice!("ref type set on non-object value {} ({})", v, self.value_type(v));
        }
        if let Some(prev) = self.refs.get(&v) {
            crate::ice!("value {} already tagged {}", v, prev);
        }
        self.refs.insert(v, RefInfo { ref_type, nullable });
    }

    pub fn ref_info(&self, v: Value) -> Option<RefInfo> {
        self.refs.get(&v).copied()
    }

    /// Successors of a block in edge order (may repeat)
    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        self.block(b).terminator.successors()
    }

    /// Distinct predecessors of every block, indexed by block
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds: Vec<Vec<BlockId>> = vec![Vec::new(); self.blocks.len()];
        for block in &self.blocks {
            for succ in block.terminator.successors() {
                let list = &mut preds[succ.index()];
                if !list.contains(&block.id) {
                    list.push(block.id);
                }
            }
        }
        preds
    }

    /// Which blocks can be reached from the entry
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.blocks.len()];
        let mut stack = vec![self.entry];
        while let Some(b) = stack.pop() {
            if std::mem::replace(&mut seen[b.index()], true) {
                continue;
            }
            stack.extend(self.successors(b));
        }
        seen
    }

    /// Move the instructions of `b` from `at` onward, together with its
    /// terminator, into a new block. `b` is left unterminated.
    pub fn split_block(&mut self, b: BlockId, at: usize) -> BlockId {
        let tail_id = self.add_block();
        let tail = self.block_mut(b).instrs.split_off(at);
        let terminator = std::mem::replace(&mut self.block_mut(b).terminator, Terminator::None);
        let tail_block = self.block_mut(tail_id);
        tail_block.instrs = tail;
        tail_block.terminator = terminator;
        let mut succs = self.successors(tail_id);
        succs.dedup();
        for succ in succs {
            self.replace_phi_source(succ, b, tail_id);
        }
        tail_id
    }

    /// Insert an empty block on the edge `from -> to`
    pub fn break_edge(&mut self, from: BlockId, to: BlockId) -> BlockId {
        let mid = self.add_block();
        self.block_mut(mid).terminator = Terminator::Jump(to);
        self.block_mut(from).terminator.retarget(to, mid);
        self.replace_phi_source(to, from, mid);
        mid
    }

    fn replace_phi_source(&mut self, block: BlockId, old: BlockId, new: BlockId) {
        for instr in &mut self.block_mut(block).instrs {
            match instr {
                Instr::Phi { incoming, .. } => {
                    for (src, _) in incoming.iter_mut() {
                        if *src == old {
                            *src = new;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    /// Drop blocks not reachable from the entry and renumber the rest.
    /// Returns how many blocks were removed.
    pub fn remove_unreachable_blocks(&mut self) -> usize {
        let reachable = self.reachable();
        let removed = reachable.iter().filter(|r| !**r).count();
        if removed == 0 {
            return 0;
        }

        let mut remap: Vec<Option<BlockId>> = vec![None; self.blocks.len()];
        let mut next = 0u32;
        for (i, live) in reachable.iter().enumerate() {
            if *live {
                remap[i] = Some(BlockId(next));
                next += 1;
            }
        }
        let map = |b: BlockId| remap[b.index()];

        let old_blocks = std::mem::take(&mut self.blocks);
        for mut block in old_blocks {
            let Some(new_id) = map(block.id) else { continue };
            block.id = new_id;
            // successors of a reachable block are reachable
            block.terminator.map_targets(|succ| map(succ).unwrap_or(succ));
            for instr in &mut block.instrs {
                if let Instr::Phi { incoming, .. } = instr {
                    incoming.retain(|(src, _)| map(*src).is_some());
                    for (src, _) in incoming.iter_mut() {
                        if let Some(new_src) = map(*src) {
                            *src = new_src;
                        }
                    }
                }
            }
            self.blocks.push(block);
        }
        if let Some(entry) = map(self.entry) {
            self.entry = entry;
        }
        removed
    }

    /// Total number of instructions, not counting terminators
    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }
}
