//! Arena-based SSA IR
//!
//! Values, instructions and blocks are `u32` handles into per-function arenas.
//! Erasing an instruction marks its slot dead and unlinks it from its block;
//! handles are never reused, so a stale handle can always be detected.

pub mod builder;
pub mod display;
pub mod dom;
pub mod eval;
pub mod verify;

use std::collections::{HashMap, HashSet};
use std::fmt;

pub use builder::{Builder, InsertPoint};

/// Reference to a value (argument, instruction result or constant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub(crate) u32);

impl Value {
    /// Raw index into the value arena.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Reference to an instruction in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(pub(crate) u32);

impl Inst {
    /// Raw index into the instruction arena.
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Reference to a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(pub(crate) u32);

impl Block {
    /// Raw index into the block arena.
    pub fn index(self) -> u32 {
        self.0
    }
}

// ============================================================================
// Types
// ============================================================================

/// Lane type of a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Elem {
    Int(u32),
    Float(u32),
}

impl Elem {
    pub fn width(self) -> u32 {
        match self {
            Elem::Int(w) | Elem::Float(w) => w,
        }
    }

    pub fn ty(self) -> Type {
        match self {
            Elem::Int(w) => Type::Int(w),
            Elem::Float(w) => Type::Float(w),
        }
    }
}

/// Semantic type of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Int(u32),
    Float(u32),
    Vector(Elem, u32),
    Ptr,
    Void,
}

impl Type {
    pub const I1: Type = Type::Int(1);
    pub const I32: Type = Type::Int(32);
    pub const I64: Type = Type::Int(64);

    /// Build a vector type from a scalar lane type. Returns `None` for
    /// lane types that cannot live in a vector.
    pub fn vector(elem: Type, lanes: u32) -> Option<Type> {
        match elem {
            Type::Int(w) => Some(Type::Vector(Elem::Int(w), lanes)),
            Type::Float(w) => Some(Type::Vector(Elem::Float(w), lanes)),
            _ => None,
        }
    }

    pub fn is_int(self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_vector(self) -> bool {
        matches!(self, Type::Vector(..))
    }

    pub fn is_void(self) -> bool {
        matches!(self, Type::Void)
    }

    /// Width of a scalar integer type.
    pub fn int_width(self) -> Option<u32> {
        match self {
            Type::Int(w) => Some(w),
            _ => None,
        }
    }

    /// Lane width of an integer or integer-vector type.
    pub fn int_elem_width(self) -> Option<u32> {
        match self {
            Type::Int(w) | Type::Vector(Elem::Int(w), _) => Some(w),
            _ => None,
        }
    }

    /// Number of lanes; scalars have one.
    pub fn lanes(self) -> u32 {
        match self {
            Type::Vector(_, n) => n,
            _ => 1,
        }
    }

    /// Lane type for vectors, the type itself otherwise.
    pub fn scalar(self) -> Type {
        match self {
            Type::Vector(e, _) => e.ty(),
            t => t,
        }
    }

    /// Total number of bits in the value.
    pub fn bit_width(self) -> u32 {
        match self {
            Type::Int(w) | Type::Float(w) => w,
            Type::Vector(e, n) => e.width() * n,
            Type::Ptr => 64,
            Type::Void => 0,
        }
    }

    /// Same shape with integer lanes of `width`.
    pub fn with_int_width(self, width: u32) -> Type {
        match self {
            Type::Int(_) => Type::Int(width),
            Type::Vector(Elem::Int(_), n) => Type::Vector(Elem::Int(width), n),
            t => t,
        }
    }

    /// The boolean type with the same shape (for compare results).
    pub fn bool_shape(self) -> Type {
        match self {
            Type::Vector(_, n) => Type::Vector(Elem::Int(1), n),
            _ => Type::I1,
        }
    }
}

impl fmt::Display for Elem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.ty().fmt(f)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int(w) => write!(f, "i{w}"),
            Type::Float(w) => write!(f, "f{w}"),
            Type::Vector(e, n) => write!(f, "<{n} x {e}>"),
            Type::Ptr => write!(f, "ptr"),
            Type::Void => write!(f, "void"),
        }
    }
}

/// All-ones mask for the low `width` bits.
pub fn mask(width: u32) -> u128 {
    if width >= 128 { u128::MAX } else { (1u128 << width) - 1 }
}

/// Interpret the low `width` bits of `bits` as a signed integer.
pub fn sign_extend(bits: u128, width: u32) -> i128 {
    if width == 0 || width >= 128 {
        return bits as i128;
    }
    let shift = 128 - width;
    ((bits << shift) as i128) >> shift
}

// ============================================================================
// Values
// ============================================================================

/// Compile-time constant payload. Integer bits are stored zero-extended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    Int(u128),
    Vector(Vec<u128>),
    Zero,
    Undef,
    /// An opaque constant expression that earlier passes should have folded.
    Expr(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueDef {
    Arg(u32),
    Inst(Inst),
    Const(Constant),
}

#[derive(Debug, Clone)]
pub struct ValueData {
    pub ty: Type,
    pub def: ValueDef,
    pub name: Option<String>,
}

// ============================================================================
// Instructions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 13] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::SDiv,
        BinaryOp::UDiv,
        BinaryOp::SRem,
        BinaryOp::URem,
        BinaryOp::And,
        BinaryOp::Or,
        BinaryOp::Xor,
        BinaryOp::Shl,
        BinaryOp::LShr,
        BinaryOp::AShr,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::SDiv => "sdiv",
            BinaryOp::UDiv => "udiv",
            BinaryOp::SRem => "srem",
            BinaryOp::URem => "urem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::LShr => "lshr",
            BinaryOp::AShr => "ashr",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.mnemonic() == s)
    }

    /// Bitwise ops act on every bit independently.
    pub fn is_bitwise(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl IntPredicate {
    pub const ALL: [IntPredicate; 10] = [
        IntPredicate::Eq,
        IntPredicate::Ne,
        IntPredicate::Slt,
        IntPredicate::Sle,
        IntPredicate::Sgt,
        IntPredicate::Sge,
        IntPredicate::Ult,
        IntPredicate::Ule,
        IntPredicate::Ugt,
        IntPredicate::Uge,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            IntPredicate::Eq => "eq",
            IntPredicate::Ne => "ne",
            IntPredicate::Slt => "slt",
            IntPredicate::Sle => "sle",
            IntPredicate::Sgt => "sgt",
            IntPredicate::Sge => "sge",
            IntPredicate::Ult => "ult",
            IntPredicate::Ule => "ule",
            IntPredicate::Ugt => "ugt",
            IntPredicate::Uge => "uge",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.mnemonic() == s)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            IntPredicate::Ult | IntPredicate::Ule | IntPredicate::Ugt | IntPredicate::Uge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    Bitcast,
    FpToSi,
    FpToUi,
    SiToFp,
    UiToFp,
    PtrToInt,
    IntToPtr,
}

impl CastOp {
    pub const ALL: [CastOp; 10] = [
        CastOp::Trunc,
        CastOp::ZExt,
        CastOp::SExt,
        CastOp::Bitcast,
        CastOp::FpToSi,
        CastOp::FpToUi,
        CastOp::SiToFp,
        CastOp::UiToFp,
        CastOp::PtrToInt,
        CastOp::IntToPtr,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            CastOp::Trunc => "trunc",
            CastOp::ZExt => "zext",
            CastOp::SExt => "sext",
            CastOp::Bitcast => "bitcast",
            CastOp::FpToSi => "fptosi",
            CastOp::FpToUi => "fptoui",
            CastOp::SiToFp => "sitofp",
            CastOp::UiToFp => "uitofp",
            CastOp::PtrToInt => "ptrtoint",
            CastOp::IntToPtr => "inttoptr",
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.mnemonic() == s)
    }
}

/// Memory attributes carried by loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemAttrs {
    pub align: u32,
    pub volatile: bool,
}

/// Combining operation of a subgroup reduction or scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupOp {
    Add,
    Mul,
    IMin,
    IMax,
    UMin,
    UMax,
    And,
    Or,
    Xor,
}

impl GroupOp {
    pub const ALL: [GroupOp; 9] = [
        GroupOp::Add,
        GroupOp::Mul,
        GroupOp::IMin,
        GroupOp::IMax,
        GroupOp::UMin,
        GroupOp::UMax,
        GroupOp::And,
        GroupOp::Or,
        GroupOp::Xor,
    ];

    pub fn mnemonic(self) -> &'static str {
        match self {
            GroupOp::Add => "add",
            GroupOp::Mul => "mul",
            GroupOp::IMin => "imin",
            GroupOp::IMax => "imax",
            GroupOp::UMin => "umin",
            GroupOp::UMax => "umax",
            GroupOp::And => "and",
            GroupOp::Or => "or",
            GroupOp::Xor => "xor",
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, GroupOp::UMin | GroupOp::UMax)
    }
}

/// Cross-lane subgroup intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubgroupOp {
    Reduce(GroupOp),
    InclusiveScan(GroupOp),
    ExclusiveScan(GroupOp),
    /// Read `x` from the lane given by the second operand.
    Shuffle,
    /// Read `x` from the lane given by the second operand, uniform result.
    Broadcast,
}

impl SubgroupOp {
    pub fn mnemonic(self) -> String {
        match self {
            SubgroupOp::Reduce(op) => format!("subgroup.reduce.{}", op.mnemonic()),
            SubgroupOp::InclusiveScan(op) => format!("subgroup.scan.inclusive.{}", op.mnemonic()),
            SubgroupOp::ExclusiveScan(op) => format!("subgroup.scan.exclusive.{}", op.mnemonic()),
            SubgroupOp::Shuffle => "subgroup.shuffle".to_string(),
            SubgroupOp::Broadcast => "subgroup.broadcast".to_string(),
        }
    }

    pub fn from_mnemonic(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("subgroup.")?;
        match rest {
            "shuffle" => return Some(SubgroupOp::Shuffle),
            "broadcast" => return Some(SubgroupOp::Broadcast),
            _ => {}
        }
        let (kind, op) = rest.rsplit_once('.')?;
        let op = GroupOp::ALL.into_iter().find(|g| g.mnemonic() == op)?;
        match kind {
            "reduce" => Some(SubgroupOp::Reduce(op)),
            "scan.inclusive" => Some(SubgroupOp::InclusiveScan(op)),
            "scan.exclusive" => Some(SubgroupOp::ExclusiveScan(op)),
            _ => None,
        }
    }

    /// Lane moves read a lane index as their second operand.
    pub fn is_lane_move(self) -> bool {
        matches!(self, SubgroupOp::Shuffle | SubgroupOp::Broadcast)
    }

    pub fn group_op(self) -> Option<GroupOp> {
        match self {
            SubgroupOp::Reduce(op) | SubgroupOp::InclusiveScan(op) | SubgroupOp::ExclusiveScan(op) => {
                Some(op)
            }
            SubgroupOp::Shuffle | SubgroupOp::Broadcast => None,
        }
    }
}

/// Instruction opcode. Operand layout per opcode:
///
/// - `Binary`, `ICmp`: `[lhs, rhs]`
/// - `Select`: `[cond, if_true, if_false]`
/// - `Phi(blocks)`: one incoming value per block, in the same order
/// - `Cast`, `Freeze`: `[x]`
/// - `ExtractElement`: `[vector, index]`
/// - `InsertElement`: `[vector, element, index]`
/// - `ShuffleVector(mask)`: `[a, b]`
/// - `Load`: `[ptr]`, `Store`: `[value, ptr]`, `PtrAdd`: `[ptr, offset]`
/// - `Call`: arguments, `Subgroup`: `[x]` or `[x, lane]`
/// - `CondBr`: `[cond]`, `Ret`: `[]` or `[value]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opcode {
    Binary(BinaryOp),
    ICmp(IntPredicate),
    Select,
    Phi(Vec<Block>),
    Cast(CastOp),
    ExtractElement,
    InsertElement,
    ShuffleVector(Vec<u32>),
    Load(MemAttrs),
    Store(MemAttrs),
    PtrAdd,
    Call(String),
    Subgroup(SubgroupOp),
    Freeze,
    Br(Block),
    CondBr(Block, Block),
    Ret,
}

impl Opcode {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Opcode::Br(_) | Opcode::CondBr(..) | Opcode::Ret)
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Opcode::Phi(_))
    }

    /// Short opcode name used in diagnostics.
    pub fn name(&self) -> String {
        match self {
            Opcode::Binary(op) => op.mnemonic().to_string(),
            Opcode::ICmp(_) => "icmp".to_string(),
            Opcode::Select => "select".to_string(),
            Opcode::Phi(_) => "phi".to_string(),
            Opcode::Cast(op) => op.mnemonic().to_string(),
            Opcode::ExtractElement => "extractelement".to_string(),
            Opcode::InsertElement => "insertelement".to_string(),
            Opcode::ShuffleVector(_) => "shufflevector".to_string(),
            Opcode::Load(_) => "load".to_string(),
            Opcode::Store(_) => "store".to_string(),
            Opcode::PtrAdd => "ptradd".to_string(),
            Opcode::Call(_) => "call".to_string(),
            Opcode::Subgroup(op) => op.mnemonic(),
            Opcode::Freeze => "freeze".to_string(),
            Opcode::Br(_) => "br".to_string(),
            Opcode::CondBr(..) => "condbr".to_string(),
            Opcode::Ret => "ret".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstData {
    pub op: Opcode,
    pub args: Vec<Value>,
    pub result: Option<Value>,
    pub block: Block,
    pub erased: bool,
}

#[derive(Debug, Clone)]
pub struct BlockData {
    pub name: String,
    pub insts: Vec<Inst>,
}

// ============================================================================
// Function
// ============================================================================

/// A function: parameters, a block layout and the value/instruction arenas.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Value>,
    pub ret_ty: Type,
    values: Vec<ValueData>,
    insts: Vec<InstData>,
    blocks: Vec<BlockData>,
    taken_names: HashSet<String>,
}

impl Function {
    pub fn new(name: impl Into<String>, ret_ty: Type) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret_ty,
            values: Vec::new(),
            insts: Vec::new(),
            blocks: Vec::new(),
            taken_names: HashSet::new(),
        }
    }

    // ---- values ----

    pub(crate) fn new_value(&mut self, ty: Type, def: ValueDef, name: Option<String>) -> Value {
        if let Some(n) = &name {
            self.taken_names.insert(n.clone());
        }
        let v = Value(self.values.len() as u32);
        self.values.push(ValueData { ty, def, name });
        v
    }

    pub fn add_param(&mut self, ty: Type, name: impl Into<String>) -> Value {
        let index = self.params.len() as u32;
        let name = self.fresh_name(&name.into());
        let v = self.new_value(ty, ValueDef::Arg(index), Some(name));
        self.params.push(v);
        v
    }

    pub fn value(&self, v: Value) -> &ValueData {
        &self.values[v.0 as usize]
    }

    pub fn value_type(&self, v: Value) -> Type {
        self.values[v.0 as usize].ty
    }

    pub fn value_name(&self, v: Value) -> Option<&str> {
        self.values[v.0 as usize].name.as_deref()
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Name for a new value derived from `base`, unique within the function.
    pub fn fresh_name(&mut self, base: &str) -> String {
        let base = if base.is_empty() { "v" } else { base };
        if !self.taken_names.contains(base) {
            return base.to_string();
        }
        let mut n = 1u32;
        loop {
            let candidate = format!("{base}.{n}");
            if !self.taken_names.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn constant(&self, v: Value) -> Option<&Constant> {
        match &self.value(v).def {
            ValueDef::Const(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_constant(&self, v: Value) -> bool {
        self.constant(v).is_some()
    }

    pub fn defining_inst(&self, v: Value) -> Option<Inst> {
        match self.value(v).def {
            ValueDef::Inst(i) => Some(i),
            _ => None,
        }
    }

    pub fn is_arg(&self, v: Value) -> bool {
        matches!(self.value(v).def, ValueDef::Arg(_))
    }

    /// Integer constant of type `ty` (scalar); `bits` is truncated to the width.
    pub fn const_int(&mut self, ty: Type, bits: u128) -> Value {
        let width = ty.int_width().unwrap_or(128);
        self.new_value(ty, ValueDef::Const(Constant::Int(bits & mask(width))), None)
    }

    /// Integer vector constant; each lane is truncated to the lane width.
    pub fn const_vector(&mut self, ty: Type, lanes: Vec<u128>) -> Value {
        let width = ty.int_elem_width().unwrap_or(128);
        let lanes = lanes.into_iter().map(|b| b & mask(width)).collect();
        self.new_value(ty, ValueDef::Const(Constant::Vector(lanes)), None)
    }

    pub fn zero(&mut self, ty: Type) -> Value {
        self.new_value(ty, ValueDef::Const(Constant::Zero), None)
    }

    pub fn undef(&mut self, ty: Type) -> Value {
        self.new_value(ty, ValueDef::Const(Constant::Undef), None)
    }

    pub fn const_expr(&mut self, ty: Type, text: impl Into<String>) -> Value {
        self.new_value(ty, ValueDef::Const(Constant::Expr(text.into())), None)
    }

    /// Integer payload of a scalar constant (`zeroinitializer` reads as 0).
    pub fn const_int_value(&self, v: Value) -> Option<u128> {
        match self.constant(v)? {
            Constant::Int(bits) => Some(*bits),
            Constant::Zero => Some(0),
            _ => None,
        }
    }

    // ---- blocks ----

    pub fn add_block(&mut self, name: impl Into<String>) -> Block {
        let b = Block(self.blocks.len() as u32);
        self.blocks.push(BlockData {
            name: name.into(),
            insts: Vec::new(),
        });
        b
    }

    /// Blocks in layout order; the first one is the entry.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        (0..self.blocks.len() as u32).map(Block)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn entry(&self) -> Option<Block> {
        if self.blocks.is_empty() { None } else { Some(Block(0)) }
    }

    pub fn block_name(&self, b: Block) -> &str {
        &self.blocks[b.0 as usize].name
    }

    pub fn block_insts(&self, b: Block) -> &[Inst] {
        &self.blocks[b.0 as usize].insts
    }

    pub fn terminator(&self, b: Block) -> Option<Inst> {
        let last = *self.block_insts(b).last()?;
        self.inst(last).op.is_terminator().then_some(last)
    }

    /// First instruction of `b` that is not a PHI.
    pub fn first_non_phi(&self, b: Block) -> Option<Inst> {
        self.block_insts(b).iter().copied().find(|&i| !self.inst(i).op.is_phi())
    }

    pub fn successors(&self, b: Block) -> Vec<Block> {
        match self.terminator(b).map(|t| &self.inst(t).op) {
            Some(Opcode::Br(target)) => vec![*target],
            Some(Opcode::CondBr(t, f)) if t == f => vec![*t],
            Some(Opcode::CondBr(t, f)) => vec![*t, *f],
            _ => Vec::new(),
        }
    }

    pub fn predecessors(&self) -> HashMap<Block, Vec<Block>> {
        let mut preds: HashMap<Block, Vec<Block>> = HashMap::new();
        for b in self.blocks() {
            for s in self.successors(b) {
                preds.entry(s).or_default().push(b);
            }
        }
        preds
    }

    // ---- instructions ----

    pub fn inst(&self, i: Inst) -> &InstData {
        &self.insts[i.0 as usize]
    }

    pub fn result(&self, i: Inst) -> Option<Value> {
        self.inst(i).result
    }

    pub fn args(&self, i: Inst) -> &[Value] {
        &self.inst(i).args
    }

    pub fn is_erased(&self, i: Inst) -> bool {
        self.inst(i).erased
    }

    /// Number of instruction slots ever allocated (live or erased).
    pub fn inst_arena_len(&self) -> usize {
        self.insts.len()
    }

    /// Live instructions in layout order.
    pub fn live_insts(&self) -> Vec<Inst> {
        self.blocks.iter().flat_map(|b| b.insts.iter().copied()).collect()
    }

    pub fn live_inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    /// Position of a live instruction inside its block.
    pub fn position(&self, i: Inst) -> Option<usize> {
        let block = self.inst(i).block;
        self.block_insts(block).iter().position(|&x| x == i)
    }

    /// Create an instruction at `at`. A result value is allocated unless
    /// `ty` is void; `name` seeds its (uniqued) name.
    pub fn insert_inst(
        &mut self,
        at: InsertPoint,
        op: Opcode,
        args: Vec<Value>,
        ty: Type,
        name: &str,
    ) -> Inst {
        let block = match at {
            InsertPoint::Before(anchor) => self.inst(anchor).block,
            InsertPoint::End(b) => b,
        };
        let inst = Inst(self.insts.len() as u32);
        let result = if ty.is_void() {
            None
        } else {
            let name = self.fresh_name(name);
            Some(self.new_value(ty, ValueDef::Inst(inst), Some(name)))
        };
        self.insts.push(InstData {
            op,
            args,
            result,
            block,
            erased: false,
        });
        let pos = match at {
            InsertPoint::Before(anchor) => self.position(anchor).unwrap_or(self.block_insts(block).len()),
            InsertPoint::End(_) => self.block_insts(block).len(),
        };
        self.blocks[block.0 as usize].insts.insert(pos, inst);
        inst
    }

    /// Append an instruction whose result value already exists (used by the
    /// parser to resolve forward references).
    pub(crate) fn append_with_result(&mut self, block: Block, op: Opcode, args: Vec<Value>, result: Option<Value>) -> Inst {
        let inst = Inst(self.insts.len() as u32);
        if let Some(r) = result {
            self.values[r.0 as usize].def = ValueDef::Inst(inst);
        }
        self.insts.push(InstData {
            op,
            args,
            result,
            block,
            erased: false,
        });
        self.blocks[block.0 as usize].insts.push(inst);
        inst
    }

    pub fn set_arg(&mut self, i: Inst, index: usize, v: Value) {
        self.insts[i.0 as usize].args[index] = v;
    }

    pub fn add_phi_incoming(&mut self, phi: Inst, v: Value, from: Block) {
        let data = &mut self.insts[phi.0 as usize];
        if let Opcode::Phi(blocks) = &mut data.op {
            blocks.push(from);
            data.args.push(v);
        }
    }

    /// Operand slots referring to `v`, over live instructions.
    pub fn uses(&self, v: Value) -> Vec<(Inst, usize)> {
        let mut out = Vec::new();
        for i in self.live_insts() {
            for (k, &a) in self.args(i).iter().enumerate() {
                if a == v {
                    out.push((i, k));
                }
            }
        }
        out
    }

    /// Number of operand slots referring to each value, counting only the
    /// live instructions `include` accepts.
    pub fn use_counts(&self, include: impl Fn(Inst) -> bool) -> HashMap<Value, usize> {
        let mut counts = HashMap::new();
        for i in self.live_insts().into_iter().filter(|&i| include(i)) {
            for &a in self.args(i) {
                *counts.entry(a).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Retarget every operand slot referring to `old`. Returns the number of
    /// slots rewritten.
    pub fn replace_all_uses(&mut self, old: Value, new: Value) -> usize {
        let mut n = 0;
        for b in 0..self.blocks.len() {
            for k in 0..self.blocks[b].insts.len() {
                let i = self.blocks[b].insts[k];
                for a in self.insts[i.0 as usize].args.iter_mut() {
                    if *a == old {
                        *a = new;
                        n += 1;
                    }
                }
            }
        }
        n
    }

    /// Unlink an instruction from its block and mark its slot dead.
    pub fn erase_inst(&mut self, i: Inst) {
        let block = self.inst(i).block;
        self.blocks[block.0 as usize].insts.retain(|&x| x != i);
        self.insts[i.0 as usize].erased = true;
    }
}

/// A compilation unit.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_function() -> Function {
        let mut f = Function::new("f", Type::Int(8));
        let a = f.add_param(Type::Int(8), "a");
        let b = f.add_param(Type::Int(8), "b");
        let entry = f.add_block("entry");
        let at = InsertPoint::End(entry);
        let add = f.insert_inst(at, Opcode::Binary(BinaryOp::Add), vec![a, b], Type::Int(8), "s");
        let s = f.result(add).unwrap();
        f.insert_inst(at, Opcode::Ret, vec![s], Type::Void, "");
        f
    }

    #[test]
    fn test_type_helpers() {
        let v = Type::Vector(Elem::Int(8), 4);
        assert_eq!(v.bit_width(), 32);
        assert_eq!(v.lanes(), 4);
        assert_eq!(v.scalar(), Type::Int(8));
        assert_eq!(v.with_int_width(16), Type::Vector(Elem::Int(16), 4));
        assert_eq!(v.bool_shape(), Type::Vector(Elem::Int(1), 4));
        assert_eq!(format!("{v}"), "<4 x i8>");
        assert_eq!(Type::vector(Type::Float(16), 3), Some(Type::Vector(Elem::Float(16), 3)));
        assert_eq!(Type::vector(Type::Ptr, 3), None);
    }

    #[test]
    fn test_mask_and_sign_extend() {
        assert_eq!(mask(8), 0xFF);
        assert_eq!(mask(128), u128::MAX);
        assert_eq!(sign_extend(0x80, 8), -128);
        assert_eq!(sign_extend(0x7F, 8), 127);
        assert_eq!(sign_extend(0xFFFF, 16), -1);
    }

    #[test]
    fn test_fresh_names_are_unique() {
        let mut f = make_test_function();
        assert_eq!(f.fresh_name("t"), "t");
        assert_eq!(f.fresh_name("s"), "s.1");
        let entry = f.entry().unwrap();
        let first = f.block_insts(entry)[0];
        let a = f.params[0];
        f.insert_inst(InsertPoint::Before(first), Opcode::Freeze, vec![a], Type::Int(8), "s");
        assert_eq!(f.fresh_name("s"), "s.2");
    }

    #[test]
    fn test_insert_before_keeps_order() {
        let mut f = make_test_function();
        let entry = f.entry().unwrap();
        let ret = f.terminator(entry).unwrap();
        let a = f.params[0];
        let x = f.insert_inst(InsertPoint::Before(ret), Opcode::Freeze, vec![a], Type::Int(8), "x");
        let y = f.insert_inst(InsertPoint::Before(ret), Opcode::Freeze, vec![a], Type::Int(8), "y");
        let insts = f.block_insts(entry);
        assert_eq!(insts.len(), 4);
        assert_eq!(insts[1], x);
        assert_eq!(insts[2], y);
        assert_eq!(insts[3], ret);
    }

    #[test]
    fn test_replace_all_uses_and_erase() {
        let mut f = make_test_function();
        let entry = f.entry().unwrap();
        let add = f.block_insts(entry)[0];
        let s = f.result(add).unwrap();
        let a = f.params[0];
        assert_eq!(f.uses(s).len(), 1);
        assert_eq!(f.replace_all_uses(s, a), 1);
        f.erase_inst(add);
        assert!(f.is_erased(add));
        assert_eq!(f.live_inst_count(), 1);
        assert!(f.uses(s).is_empty());
        assert_eq!(f.use_counts(|_| true).get(&a), Some(&1));
    }

    #[test]
    fn test_use_counts_skip_filtered_insts() {
        let f = make_test_function();
        let entry = f.entry().unwrap();
        let add = f.block_insts(entry)[0];
        let s = f.result(add).unwrap();
        let a = f.params[0];
        let all = f.use_counts(|_| true);
        assert_eq!(all.get(&a), Some(&1));
        assert_eq!(all.get(&s), Some(&1));
        let without_add = f.use_counts(|i| i != add);
        assert_eq!(without_add.get(&a), None);
        assert_eq!(without_add.get(&s), Some(&1));
    }

    #[test]
    fn test_constants_are_masked() {
        let mut f = Function::new("c", Type::Void);
        let c = f.const_int(Type::Int(8), 0x1FF);
        assert_eq!(f.const_int_value(c), Some(0xFF));
        let v = f.const_vector(Type::Vector(Elem::Int(8), 2), vec![0x100, 0x7F]);
        assert_eq!(f.constant(v), Some(&Constant::Vector(vec![0, 0x7F])));
        assert!(f.is_constant(v));
    }

    #[test]
    fn test_subgroup_mnemonics() {
        let ops = [
            SubgroupOp::Reduce(GroupOp::Add),
            SubgroupOp::InclusiveScan(GroupOp::UMax),
            SubgroupOp::ExclusiveScan(GroupOp::IMin),
            SubgroupOp::Shuffle,
            SubgroupOp::Broadcast,
        ];
        for op in ops {
            assert_eq!(SubgroupOp::from_mnemonic(&op.mnemonic()), Some(op));
        }
        assert_eq!(SubgroupOp::from_mnemonic("subgroup.scan.sideways.add"), None);
    }
}
