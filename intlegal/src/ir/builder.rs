//! Positioned instruction builder

use super::{BinaryOp, Block, CastOp, Function, Inst, IntPredicate, MemAttrs, Opcode, SubgroupOp, Type, Value};

/// Where new instructions go. Repeated inserts at `Before(x)` land in
/// creation order, all ahead of `x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertPoint {
    Before(Inst),
    End(Block),
}

impl InsertPoint {
    /// Insert right after `inst`: before its successor in the block, or at
    /// the block end when `inst` is last.
    pub fn after(func: &Function, inst: Inst) -> InsertPoint {
        let block = func.inst(inst).block;
        let insts = func.block_insts(block);
        match func.position(inst) {
            Some(pos) if pos + 1 < insts.len() => InsertPoint::Before(insts[pos + 1]),
            _ => InsertPoint::End(block),
        }
    }

    /// Insert at the first non-PHI slot of `block`.
    pub fn block_start(func: &Function, block: Block) -> InsertPoint {
        match func.first_non_phi(block) {
            Some(i) => InsertPoint::Before(i),
            None => InsertPoint::End(block),
        }
    }

    /// Insert before the terminator of `block`.
    pub fn before_terminator(func: &Function, block: Block) -> InsertPoint {
        match func.terminator(block) {
            Some(t) => InsertPoint::Before(t),
            None => InsertPoint::End(block),
        }
    }
}

/// Builds instructions at a fixed insertion point.
pub struct Builder<'f> {
    func: &'f mut Function,
    at: InsertPoint,
}

impl<'f> Builder<'f> {
    pub fn new(func: &'f mut Function, at: InsertPoint) -> Self {
        Self { func, at }
    }

    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    fn emit(&mut self, op: Opcode, args: Vec<Value>, ty: Type, name: &str) -> Value {
        let inst = self.func.insert_inst(self.at, op, args, ty, name);
        // Non-void by construction of every caller below.
        self.func.result(inst).unwrap_or_else(|| self.func.undef(ty))
    }

    pub fn value_type(&self, v: Value) -> Type {
        self.func.value_type(v)
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value, name: &str) -> Value {
        let ty = self.func.value_type(lhs);
        self.emit(Opcode::Binary(op), vec![lhs, rhs], ty, name)
    }

    pub fn icmp(&mut self, pred: IntPredicate, lhs: Value, rhs: Value, name: &str) -> Value {
        let ty = self.func.value_type(lhs).bool_shape();
        self.emit(Opcode::ICmp(pred), vec![lhs, rhs], ty, name)
    }

    pub fn select(&mut self, cond: Value, t: Value, f: Value, name: &str) -> Value {
        let ty = self.func.value_type(t);
        self.emit(Opcode::Select, vec![cond, t, f], ty, name)
    }

    pub fn cast(&mut self, op: CastOp, x: Value, ty: Type, name: &str) -> Value {
        self.emit(Opcode::Cast(op), vec![x], ty, name)
    }

    pub fn trunc(&mut self, x: Value, ty: Type, name: &str) -> Value {
        self.cast(CastOp::Trunc, x, ty, name)
    }

    pub fn zext(&mut self, x: Value, ty: Type, name: &str) -> Value {
        self.cast(CastOp::ZExt, x, ty, name)
    }

    pub fn sext(&mut self, x: Value, ty: Type, name: &str) -> Value {
        self.cast(CastOp::SExt, x, ty, name)
    }

    /// Change the integer width of `x` to that of `ty`, keeping the low bits.
    /// Wider targets are filled by `signed` extension.
    pub fn resize(&mut self, x: Value, ty: Type, signed: bool, name: &str) -> Value {
        let from = self.func.value_type(x).bit_width();
        let to = ty.bit_width();
        if from == to {
            x
        } else if from > to {
            self.trunc(x, ty, name)
        } else if signed {
            self.sext(x, ty, name)
        } else {
            self.zext(x, ty, name)
        }
    }

    pub fn freeze(&mut self, x: Value, name: &str) -> Value {
        let ty = self.func.value_type(x);
        self.emit(Opcode::Freeze, vec![x], ty, name)
    }

    pub fn extract_element(&mut self, vector: Value, index: Value, name: &str) -> Value {
        let ty = self.func.value_type(vector).scalar();
        self.emit(Opcode::ExtractElement, vec![vector, index], ty, name)
    }

    pub fn insert_element(&mut self, vector: Value, element: Value, index: Value, name: &str) -> Value {
        let ty = self.func.value_type(vector);
        self.emit(Opcode::InsertElement, vec![vector, element, index], ty, name)
    }

    pub fn shuffle(&mut self, a: Value, b: Value, lanes: Vec<u32>, name: &str) -> Value {
        let elem = self.func.value_type(a).scalar();
        let n = lanes.len() as u32;
        let ty = Type::vector(elem, n).unwrap_or(elem);
        self.emit(Opcode::ShuffleVector(lanes), vec![a, b], ty, name)
    }

    pub fn load(&mut self, ty: Type, ptr: Value, attrs: MemAttrs, name: &str) -> Value {
        self.emit(Opcode::Load(attrs), vec![ptr], ty, name)
    }

    pub fn store(&mut self, value: Value, ptr: Value, attrs: MemAttrs) -> Inst {
        self.func.insert_inst(self.at, Opcode::Store(attrs), vec![value, ptr], Type::Void, "")
    }

    pub fn ptr_add(&mut self, ptr: Value, offset: Value, name: &str) -> Value {
        self.emit(Opcode::PtrAdd, vec![ptr, offset], Type::Ptr, name)
    }

    pub fn subgroup(&mut self, op: SubgroupOp, args: Vec<Value>, ty: Type, name: &str) -> Value {
        self.emit(Opcode::Subgroup(op), args, ty, name)
    }

    /// An empty PHI, to be completed with `Function::add_phi_incoming`.
    pub fn phi(&mut self, ty: Type, name: &str) -> Inst {
        self.func.insert_inst(self.at, Opcode::Phi(Vec::new()), Vec::new(), ty, name)
    }

    pub fn const_int(&mut self, ty: Type, bits: u128) -> Value {
        self.func.const_int(ty, bits)
    }

    /// Constant of `ty`; vectors get `bits` in every lane.
    pub fn splat(&mut self, ty: Type, bits: u128) -> Value {
        if ty.is_vector() {
            self.func.const_vector(ty, vec![bits; ty.lanes() as usize])
        } else {
            self.func.const_int(ty, bits)
        }
    }
}
