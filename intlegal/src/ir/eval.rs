//! Reference interpreter
//!
//! Executes one function over byte-addressable little-endian memory with
//! wrapping integer semantics. Calls are recorded and return zero; subgroup
//! intrinsics run as a single-lane subgroup. Used to compare a function
//! before and after legalization.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use super::{
    mask, sign_extend, BinaryOp, Block, CastOp, Constant, Elem, Function, GroupOp, Inst, IntPredicate, Opcode,
    SubgroupOp, Type, Value, ValueDef,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Val {
    Int(u128),
    Lanes(Vec<u128>),
    Float(f64),
    Ptr(u64),
}

impl Val {
    pub fn as_int(&self) -> Option<u128> {
        match self {
            Val::Int(b) => Some(*b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub callee: String,
    pub args: Vec<Val>,
}

#[derive(Debug, Error, PartialEq)]
pub enum EvalError {
    #[error("value {0} used before it was computed")]
    UndefinedValue(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("lane index {index} out of range for {lanes} lanes")]
    LaneOutOfRange { index: u128, lanes: u32 },
    #[error("step limit of {0} exceeded")]
    StepLimit(usize),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub ret: Option<Val>,
    pub calls: Vec<CallRecord>,
    pub memory: BTreeMap<u64, u8>,
}

pub struct Interpreter<'f> {
    func: &'f Function,
    env: HashMap<Value, Val>,
    memory: BTreeMap<u64, u8>,
    calls: Vec<CallRecord>,
    step_limit: usize,
}

impl<'f> Interpreter<'f> {
    pub fn new(func: &'f Function) -> Self {
        Self {
            func,
            env: HashMap::new(),
            memory: BTreeMap::new(),
            calls: Vec::new(),
            step_limit: 100_000,
        }
    }

    pub fn with_memory(mut self, memory: BTreeMap<u64, u8>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn run(mut self, args: &[Val]) -> Result<Execution, EvalError> {
        let func = self.func;
        for (&p, a) in func.params.iter().zip(args) {
            self.env.insert(p, a.clone());
        }
        let Some(mut block) = func.entry() else {
            return Err(EvalError::Unsupported("function has no blocks".to_string()));
        };
        let mut prev: Option<Block> = None;
        let mut steps = 0usize;
        loop {
            self.enter_block(block, prev)?;
            let mut next = None;
            for &i in func.block_insts(block) {
                steps += 1;
                if steps > self.step_limit {
                    return Err(EvalError::StepLimit(self.step_limit));
                }
                match &func.inst(i).op {
                    Opcode::Phi(_) => continue,
                    Opcode::Br(target) => {
                        next = Some(*target);
                        break;
                    }
                    Opcode::CondBr(t, f) => {
                        let c = self.int(func.args(i)[0])?;
                        next = Some(if c & 1 == 1 { *t } else { *f });
                        break;
                    }
                    Opcode::Ret => {
                        let ret = match func.args(i).first() {
                            Some(&v) => Some(self.get(v)?),
                            None => None,
                        };
                        return Ok(Execution {
                            ret,
                            calls: self.calls,
                            memory: self.memory,
                        });
                    }
                    _ => self.step(i)?,
                }
            }
            match next {
                Some(n) => {
                    prev = Some(block);
                    block = n;
                }
                None => return Err(EvalError::Unsupported("block without terminator".to_string())),
            }
        }
    }

    fn enter_block(&mut self, block: Block, prev: Option<Block>) -> Result<(), EvalError> {
        let Some(prev) = prev else { return Ok(()) };
        let func = self.func;
        let mut updates = Vec::new();
        for &i in func.block_insts(block) {
            let data = func.inst(i);
            let Opcode::Phi(blocks) = &data.op else { break };
            let Some(k) = blocks.iter().position(|&b| b == prev) else {
                return Err(EvalError::Unsupported(format!(
                    "phi without incoming value for %{}",
                    func.block_name(prev)
                )));
            };
            let v = self.get(data.args[k])?;
            if let Some(r) = data.result {
                updates.push((r, v));
            }
        }
        self.env.extend(updates);
        Ok(())
    }

    fn get(&self, v: Value) -> Result<Val, EvalError> {
        let data = self.func.value(v);
        match &data.def {
            ValueDef::Const(c) => const_val(c, data.ty),
            _ => self.env.get(&v).cloned().ok_or_else(|| {
                EvalError::UndefinedValue(data.name.clone().unwrap_or_else(|| format!("v{}", v.index())))
            }),
        }
    }

    fn int(&self, v: Value) -> Result<u128, EvalError> {
        match self.get(v)? {
            Val::Int(b) => Ok(b),
            Val::Ptr(p) => Ok(p as u128),
            other => Err(EvalError::Unsupported(format!("expected integer, found {other:?}"))),
        }
    }

    fn lanes(&self, v: Value) -> Result<Vec<u128>, EvalError> {
        match self.get(v)? {
            Val::Lanes(l) => Ok(l),
            Val::Int(b) => Ok(vec![b]),
            other => Err(EvalError::Unsupported(format!("expected integer lanes, found {other:?}"))),
        }
    }

    fn step(&mut self, i: Inst) -> Result<(), EvalError> {
        let func = self.func;
        let data = func.inst(i);
        let args = &data.args;
        let ty = data.result.map(|r| self.func.value_type(r)).unwrap_or(Type::Void);
        let result = match &data.op {
            Opcode::Binary(op) => {
                let w = ty.int_elem_width().unwrap_or(0);
                let a = self.lanes(args[0])?;
                let b = self.lanes(args[1])?;
                let out = a
                    .iter()
                    .zip(&b)
                    .map(|(&x, &y)| binary(*op, x, y, w))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(shape(out, ty))
            }
            Opcode::ICmp(pred) => {
                let w = self.func.value_type(args[0]).int_elem_width().unwrap_or(64);
                let a = self.lanes(args[0])?;
                let b = self.lanes(args[1])?;
                let out = a.iter().zip(&b).map(|(&x, &y)| compare(*pred, x, y, w) as u128).collect();
                Some(shape(out, ty))
            }
            Opcode::Select => {
                let cond = self.get(args[0])?;
                let t = self.get(args[1])?;
                let f = self.get(args[2])?;
                Some(match cond {
                    Val::Lanes(c) => {
                        let (Val::Lanes(t), Val::Lanes(f)) = (t, f) else {
                            return Err(EvalError::Unsupported("vector select of scalars".to_string()));
                        };
                        Val::Lanes(c.iter().enumerate().map(|(k, &c)| if c & 1 == 1 { t[k] } else { f[k] }).collect())
                    }
                    Val::Int(c) => {
                        if c & 1 == 1 {
                            t
                        } else {
                            f
                        }
                    }
                    other => return Err(EvalError::Unsupported(format!("select on {other:?}"))),
                })
            }
            Opcode::Cast(op) => Some(self.cast(*op, args[0], ty)?),
            Opcode::ExtractElement => {
                let v = self.lanes(args[0])?;
                let idx = self.int(args[1])?;
                let lane = v
                    .get(idx as usize)
                    .copied()
                    .ok_or(EvalError::LaneOutOfRange { index: idx, lanes: v.len() as u32 })?;
                Some(Val::Int(lane))
            }
            Opcode::InsertElement => {
                let mut v = self.lanes(args[0])?;
                let e = self.int(args[1])?;
                let idx = self.int(args[2])?;
                let lanes = v.len() as u32;
                let slot = v.get_mut(idx as usize).ok_or(EvalError::LaneOutOfRange { index: idx, lanes })?;
                *slot = e;
                Some(Val::Lanes(v))
            }
            Opcode::ShuffleVector(sel) => {
                let mut all = self.lanes(args[0])?;
                all.extend(self.lanes(args[1])?);
                let out = sel
                    .iter()
                    .map(|&k| {
                        all.get(k as usize)
                            .copied()
                            .ok_or(EvalError::LaneOutOfRange { index: k as u128, lanes: all.len() as u32 })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Some(Val::Lanes(out))
            }
            Opcode::Load(_) => {
                let ptr = self.int(args[0])? as u64;
                let bytes = ty.bit_width().div_ceil(8) as u64;
                let mut bits = 0u128;
                for k in 0..bytes {
                    let byte = self.memory.get(&(ptr + k)).copied().unwrap_or(0);
                    bits |= (byte as u128) << (8 * k);
                }
                Some(from_bits(bits, ty)?)
            }
            Opcode::Store(_) => {
                let vty = self.func.value_type(args[0]);
                let bits = to_bits(&self.get(args[0])?, vty)?;
                let ptr = self.int(args[1])? as u64;
                let bytes = vty.bit_width().div_ceil(8) as u64;
                for k in 0..bytes {
                    self.memory.insert(ptr + k, (bits >> (8 * k)) as u8);
                }
                None
            }
            Opcode::PtrAdd => {
                let ptr = self.int(args[0])?;
                let w = self.func.value_type(args[1]).int_width().unwrap_or(64);
                let off = sign_extend(self.int(args[1])?, w);
                Some(Val::Ptr((ptr as i128).wrapping_add(off) as u64))
            }
            Opcode::Call(callee) => {
                let args = args.iter().map(|&a| self.get(a)).collect::<Result<Vec<_>, _>>()?;
                self.calls.push(CallRecord {
                    callee: callee.clone(),
                    args,
                });
                if ty.is_void() { None } else { Some(zero_of(ty)) }
            }
            Opcode::Subgroup(op) => {
                let x = self.int(args[0])?;
                let w = ty.int_width().unwrap_or(64);
                Some(Val::Int(match op {
                    SubgroupOp::ExclusiveScan(g) => identity(*g, w),
                    _ => x,
                }))
            }
            Opcode::Freeze => Some(self.get(args[0])?),
            Opcode::Phi(_) | Opcode::Br(_) | Opcode::CondBr(..) | Opcode::Ret => None,
        };
        if let (Some(r), Some(v)) = (data.result, result) {
            self.env.insert(r, v);
        }
        Ok(())
    }

    fn cast(&self, op: CastOp, x: Value, to: Type) -> Result<Val, EvalError> {
        let from = self.func.value_type(x);
        let sw = from.int_elem_width().unwrap_or(64);
        let dw = to.int_elem_width().unwrap_or(64);
        match op {
            CastOp::Trunc | CastOp::ZExt | CastOp::SExt => {
                let lanes = self.lanes(x)?;
                let out = lanes
                    .into_iter()
                    .map(|b| match op {
                        CastOp::SExt => (sign_extend(b, sw) as u128) & mask(dw),
                        _ => b & mask(dw),
                    })
                    .collect();
                Ok(shape(out, to))
            }
            CastOp::Bitcast => {
                if matches!(from, Type::Float(_) | Type::Vector(Elem::Float(_), _))
                    || matches!(to, Type::Float(_) | Type::Vector(Elem::Float(_), _))
                {
                    return Err(EvalError::Unsupported("floating-point bitcast".to_string()));
                }
                from_bits(to_bits(&self.get(x)?, from)?, to)
            }
            CastOp::FpToSi | CastOp::FpToUi => match self.get(x)? {
                Val::Float(f) => Ok(Val::Int((f as i128 as u128) & mask(dw))),
                other => Err(EvalError::Unsupported(format!("fptoint of {other:?}"))),
            },
            CastOp::SiToFp => Ok(Val::Float(sign_extend(self.int(x)?, sw) as f64)),
            CastOp::UiToFp => Ok(Val::Float(self.int(x)? as f64)),
            CastOp::PtrToInt => Ok(Val::Int(self.int(x)? & mask(dw))),
            CastOp::IntToPtr => Ok(Val::Ptr(self.int(x)? as u64)),
        }
    }
}

fn shape(lanes: Vec<u128>, ty: Type) -> Val {
    if ty.is_vector() {
        Val::Lanes(lanes)
    } else {
        Val::Int(lanes.first().copied().unwrap_or(0))
    }
}

fn zero_of(ty: Type) -> Val {
    match ty {
        Type::Vector(_, n) => Val::Lanes(vec![0; n as usize]),
        Type::Float(_) => Val::Float(0.0),
        Type::Ptr => Val::Ptr(0),
        _ => Val::Int(0),
    }
}

fn const_val(c: &Constant, ty: Type) -> Result<Val, EvalError> {
    match c {
        Constant::Int(b) => Ok(if ty == Type::Ptr { Val::Ptr(*b as u64) } else { Val::Int(*b) }),
        Constant::Vector(l) => Ok(Val::Lanes(l.clone())),
        Constant::Zero | Constant::Undef => Ok(zero_of(ty)),
        Constant::Expr(e) => Err(EvalError::Unsupported(format!("constant expression {e}"))),
    }
}

/// Pack a value into its little-endian bit image (lane 0 in the low bits).
fn to_bits(v: &Val, ty: Type) -> Result<u128, EvalError> {
    if ty.bit_width() > 128 {
        return Err(EvalError::Unsupported(format!("{ty} is wider than 128 bits")));
    }
    match v {
        Val::Int(b) => Ok(*b & mask(ty.bit_width())),
        Val::Ptr(p) => Ok(*p as u128),
        Val::Lanes(lanes) => {
            let w = ty.int_elem_width().unwrap_or(0);
            Ok(lanes.iter().enumerate().fold(0u128, |acc, (k, &l)| acc | ((l & mask(w)) << (k as u32 * w))))
        }
        Val::Float(_) => Err(EvalError::Unsupported("float in memory".to_string())),
    }
}

fn from_bits(bits: u128, ty: Type) -> Result<Val, EvalError> {
    match ty {
        Type::Int(w) => Ok(Val::Int(bits & mask(w))),
        Type::Ptr => Ok(Val::Ptr(bits as u64)),
        Type::Vector(Elem::Int(w), n) => Ok(Val::Lanes((0..n).map(|k| (bits >> (k * w)) & mask(w)).collect())),
        other => Err(EvalError::Unsupported(format!("memory image of {other}"))),
    }
}

fn binary(op: BinaryOp, a: u128, b: u128, w: u32) -> Result<u128, EvalError> {
    let m = mask(w);
    let (a, b) = (a & m, b & m);
    let sa = sign_extend(a, w);
    let sb = sign_extend(b, w);
    let r = match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::SDiv | BinaryOp::SRem if sb == 0 => return Err(EvalError::DivisionByZero),
        BinaryOp::UDiv | BinaryOp::URem if b == 0 => return Err(EvalError::DivisionByZero),
        BinaryOp::SDiv => sa.wrapping_div(sb) as u128,
        BinaryOp::SRem => sa.wrapping_rem(sb) as u128,
        BinaryOp::UDiv => a / b,
        BinaryOp::URem => a % b,
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::Shl => {
            if b >= w as u128 {
                0
            } else {
                a << b
            }
        }
        BinaryOp::LShr => {
            if b >= w as u128 {
                0
            } else {
                a >> b
            }
        }
        BinaryOp::AShr => {
            let amt = if b >= w as u128 { w - 1 } else { b as u32 };
            (sa >> amt) as u128
        }
    };
    Ok(r & m)
}

fn compare(pred: IntPredicate, a: u128, b: u128, w: u32) -> bool {
    let (sa, sb) = (sign_extend(a, w), sign_extend(b, w));
    let (a, b) = (a & mask(w), b & mask(w));
    match pred {
        IntPredicate::Eq => a == b,
        IntPredicate::Ne => a != b,
        IntPredicate::Slt => sa < sb,
        IntPredicate::Sle => sa <= sb,
        IntPredicate::Sgt => sa > sb,
        IntPredicate::Sge => sa >= sb,
        IntPredicate::Ult => a < b,
        IntPredicate::Ule => a <= b,
        IntPredicate::Ugt => a > b,
        IntPredicate::Uge => a >= b,
    }
}

/// Identity element of a subgroup combining operation at width `w`.
pub fn identity(op: GroupOp, w: u32) -> u128 {
    let m = mask(w);
    let sign = 1u128 << (w - 1);
    match op {
        GroupOp::Add | GroupOp::Or | GroupOp::Xor | GroupOp::UMax => 0,
        GroupOp::Mul => 1,
        GroupOp::And | GroupOp::UMin => m,
        GroupOp::IMin => m >> 1,
        GroupOp::IMax => sign,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{InsertPoint, MemAttrs};

    #[test]
    fn test_binary_wraps_at_width() {
        assert_eq!(binary(BinaryOp::Add, 0x7F, 1, 8), Ok(0x80));
        assert_eq!(binary(BinaryOp::Mul, 0x10, 0x10, 8), Ok(0));
        assert_eq!(binary(BinaryOp::SDiv, 0x80, 0xFF, 8), Ok(0x80));
        assert_eq!(binary(BinaryOp::AShr, 0x80, 7, 8), Ok(0xFF));
        assert_eq!(binary(BinaryOp::LShr, 0x80, 7, 8), Ok(1));
        assert_eq!(binary(BinaryOp::URem, 7, 0, 8), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn test_identity_values() {
        assert_eq!(identity(GroupOp::IMin, 8), 0x7F);
        assert_eq!(identity(GroupOp::IMax, 8), 0x80);
        assert_eq!(identity(GroupOp::IMax, 16), 0x8000);
        assert_eq!(identity(GroupOp::UMin, 8), 0xFF);
    }

    #[test]
    fn test_store_then_load_little_endian() {
        let mut f = Function::new("m", Type::Int(16));
        let p = f.add_param(Type::Ptr, "p");
        let entry = f.add_block("entry");
        let at = InsertPoint::End(entry);
        let attrs = MemAttrs { align: 4, volatile: false };
        let c = f.const_int(Type::Int(32), 0x1122_3344);
        f.insert_inst(at, Opcode::Store(attrs), vec![c, p], Type::Void, "");
        let one = f.const_int(Type::I64, 1);
        let q = f.insert_inst(at, Opcode::PtrAdd, vec![p, one], Type::Ptr, "q");
        let q = f.result(q).unwrap();
        let l = f.insert_inst(at, Opcode::Load(attrs), vec![q], Type::Int(16), "l");
        let l = f.result(l).unwrap();
        f.insert_inst(at, Opcode::Ret, vec![l], Type::Void, "");
        let out = Interpreter::new(&f).run(&[Val::Ptr(0x100)]).unwrap();
        assert_eq!(out.ret, Some(Val::Int(0x2233)));
        assert_eq!(out.memory.get(&0x100), Some(&0x44));
    }
}
