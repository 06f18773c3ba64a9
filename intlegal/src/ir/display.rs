//! Textual form of the IR
//!
//! Every operand is printed with its type, so the output parses back into
//! an identical function.

use std::fmt;

use super::{sign_extend, Constant, Function, Inst, Module, Opcode, Type, Value, ValueDef};

fn constant_text(c: &Constant, ty: Type) -> String {
    let width = ty.int_elem_width().unwrap_or(128);
    let lane = |bits: u128| -> String {
        if width == 1 {
            format!("{}", bits & 1)
        } else {
            format!("{}", sign_extend(bits, width))
        }
    };
    match c {
        Constant::Int(bits) => lane(*bits),
        Constant::Vector(lanes) => {
            let parts: Vec<String> = lanes.iter().map(|&b| lane(b)).collect();
            format!("<{}>", parts.join(", "))
        }
        Constant::Zero => "zeroinitializer".to_string(),
        Constant::Undef => "undef".to_string(),
        Constant::Expr(text) => format!("constexpr \"{text}\""),
    }
}

/// The bare reference to a value: `%name` or a constant literal.
pub fn value_ref(func: &Function, v: Value) -> String {
    let data = func.value(v);
    match &data.def {
        ValueDef::Const(c) => constant_text(c, data.ty),
        _ => match &data.name {
            Some(name) => format!("%{name}"),
            None => format!("%v{}", v.index()),
        },
    }
}

/// A typed operand: `i8 %a`.
pub fn operand(func: &Function, v: Value) -> String {
    format!("{} {}", func.value_type(v), value_ref(func, v))
}

fn operands(func: &Function, args: &[Value]) -> String {
    args.iter().map(|&a| operand(func, a)).collect::<Vec<_>>().join(", ")
}

/// One instruction, without indentation.
pub fn inst_to_string(func: &Function, i: Inst) -> String {
    let data = func.inst(i);
    let args = &data.args;
    let lhs = match data.result {
        Some(r) => format!("{} = ", value_ref(func, r)),
        None => String::new(),
    };
    let ty = data.result.map(|r| func.value_type(r)).unwrap_or(Type::Void);
    let block = |b: super::Block| format!("%{}", func.block_name(b));
    let body = match &data.op {
        Opcode::Binary(op) => format!("{} {}", op.mnemonic(), operands(func, args)),
        Opcode::ICmp(pred) => format!("icmp {} {}", pred.mnemonic(), operands(func, args)),
        Opcode::Select => format!("select {}", operands(func, args)),
        Opcode::Phi(blocks) => {
            let incoming: Vec<String> = args
                .iter()
                .zip(blocks)
                .map(|(&v, &b)| format!("[{}, {}]", operand(func, v), block(b)))
                .collect();
            if incoming.is_empty() {
                format!("phi {ty}")
            } else {
                format!("phi {ty} {}", incoming.join(", "))
            }
        }
        Opcode::Cast(op) => format!("{} {} to {ty}", op.mnemonic(), operands(func, args)),
        Opcode::ExtractElement => format!("extractelement {}", operands(func, args)),
        Opcode::InsertElement => format!("insertelement {}", operands(func, args)),
        Opcode::ShuffleVector(mask) => {
            let lanes: Vec<String> = mask.iter().map(|l| l.to_string()).collect();
            format!("shufflevector {}, [{}]", operands(func, args), lanes.join(", "))
        }
        Opcode::Load(attrs) => {
            let volatile = if attrs.volatile { "volatile " } else { "" };
            format!("load {volatile}{ty}, {}, align {}", operands(func, args), attrs.align)
        }
        Opcode::Store(attrs) => {
            let volatile = if attrs.volatile { "volatile " } else { "" };
            format!("store {volatile}{}, align {}", operands(func, args), attrs.align)
        }
        Opcode::PtrAdd => format!("ptradd {}", operands(func, args)),
        Opcode::Call(callee) => format!("call {ty} @{callee}({})", operands(func, args)),
        Opcode::Subgroup(op) => format!("{} {}", op.mnemonic(), operands(func, args)),
        Opcode::Freeze => format!("freeze {}", operands(func, args)),
        Opcode::Br(target) => format!("br {}", block(*target)),
        Opcode::CondBr(t, f) => format!("condbr {}, {}, {}", operands(func, args), block(*t), block(*f)),
        Opcode::Ret => {
            if args.is_empty() {
                "ret void".to_string()
            } else {
                format!("ret {}", operands(func, args))
            }
        }
    };
    format!("{lhs}{body}")
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|&p| operand(self, p)).collect();
        writeln!(f, "fn @{}({}) -> {} {{", self.name, params.join(", "), self.ret_ty)?;
        for b in self.blocks() {
            writeln!(f, "{}:", self.block_name(b))?;
            for &i in self.block_insts(b) {
                writeln!(f, "  {}", inst_to_string(self, i))?;
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, func) in self.functions.iter().enumerate() {
            if k > 0 {
                writeln!(f)?;
            }
            write!(f, "{func}")?;
        }
        Ok(())
    }
}
