//! Split-class values
//!
//! Integers wider than the widest ALU width are carried as a list of parts,
//! low bits first. Each part is typed at the smallest ALU width holding its
//! chunk and keeps the chunk zero-extended. The pass runs before the
//! decision engine and supersedes everything it replaces, so later phases
//! never see a split type.

use log::{debug, trace};

use super::info::{ExtKind, Replacement, ValueInfoStore};
use super::memory;
use super::table::{LegalityTable, LegalizeAction, MemoryChunk};
use super::LegalizeError;
use crate::ir::display::value_ref;
use crate::ir::{mask, BinaryOp, Builder, CastOp, Constant, Function, InsertPoint, Inst, Opcode, Type, Value};

/// One part of a split value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Part {
    chunk: MemoryChunk,
    ty: Type,
}

/// Part layout of `ty`, or `None` when it is not split.
fn layout(table: &LegalityTable, ty: Type) -> Result<Option<Vec<Part>>, LegalizeError> {
    let LegalizeAction::Split(chunk_types) = table.classify(ty)? else {
        return Ok(None);
    };
    let parts = LegalityTable::split_chunks(&chunk_types)
        .into_iter()
        .map(|chunk| {
            let width = chunk.ty.bit_width();
            let ty = Type::Int(table.alu_width(width).unwrap_or(width));
            Part { chunk, ty }
        })
        .collect();
    Ok(Some(parts))
}

/// Resize `x` to the part type and clear the bits above the chunk.
fn fit(b: &mut Builder, x: Value, part: Part, signed: bool, name: &str) -> Value {
    let v = b.resize(x, part.ty, signed, name);
    let chunk_width = part.chunk.ty.bit_width();
    if chunk_width >= part.ty.bit_width() {
        return v;
    }
    let m = b.const_int(part.ty, mask(chunk_width));
    b.binary(BinaryOp::And, v, m, name)
}

/// Replace every split value in `func` by its parts. Returns the number of
/// split values.
pub fn split_values(func: &mut Function, table: &LegalityTable, store: &mut ValueInfoStore) -> Result<usize, LegalizeError> {
    for &p in &func.params {
        if layout(table, func.value_type(p))?.is_some() {
            return Err(LegalizeError::SplitArgument {
                function: func.name.clone(),
                value: value_ref(func, p),
            });
        }
    }

    let mut work = Vec::new();
    for i in func.live_insts() {
        let data = func.inst(i);
        let mut touches = false;
        for &v in data.result.iter().chain(&data.args) {
            touches |= layout(table, func.value_type(v))?.is_some();
        }
        if touches {
            work.push(i);
        }
    }
    if work.is_empty() {
        return Ok(0);
    }

    let mut splitter = Splitter { func, table, store, values: 0 };
    splitter.run(work)?;
    debug!("@{}: {} split value(s)", splitter.func.name, splitter.values);
    Ok(splitter.values)
}

struct Splitter<'a> {
    func: &'a mut Function,
    table: &'a LegalityTable,
    store: &'a mut ValueInfoStore,
    values: usize,
}

impl Splitter<'_> {
    fn run(&mut self, work: Vec<Inst>) -> Result<(), LegalizeError> {
        let mut phis = Vec::new();
        let mut pending = Vec::new();
        for i in work {
            if self.func.inst(i).op.is_phi() {
                phis.push(self.open_phi(i)?);
            } else {
                pending.push(i);
            }
        }

        while !pending.is_empty() {
            let before = pending.len();
            let mut blocked = Vec::new();
            for i in pending {
                if self.ready(i) {
                    self.split(i)?;
                    self.store.supersede(i);
                } else {
                    blocked.push(i);
                }
            }
            if blocked.len() == before {
                return Err(LegalizeError::NonConvergent {
                    function: self.func.name.clone(),
                    remaining: blocked.len(),
                });
            }
            pending = blocked;
        }

        for (orig, parts) in phis {
            self.close_phi(orig, &parts)?;
            self.store.supersede(orig);
        }
        Ok(())
    }

    fn layout_of(&self, v: Value) -> Result<Option<Vec<Part>>, LegalizeError> {
        layout(self.table, self.func.value_type(v))
    }

    fn ready(&self, i: Inst) -> bool {
        self.func.args(i).iter().all(|&a| {
            self.func.is_constant(a)
                || !matches!(self.table.classify(self.func.value_type(a)), Ok(LegalizeAction::Split(_)))
                || self.store.get(a).is_some_and(|info| info.parts().is_some())
        })
    }

    fn record(&mut self, v: Value, parts: Vec<Value>) -> Result<(), LegalizeError> {
        self.store.get_or_create(self.func, self.table, v)?;
        self.store.set_replacement(v, Replacement::Parts(parts), Some(ExtKind::Zero));
        self.store.mark_dead(v);
        self.values += 1;
        Ok(())
    }

    /// Parts of a split operand; constants are cut up in place.
    fn parts_of(&mut self, v: Value) -> Result<Vec<Value>, LegalizeError> {
        let Some(layout) = self.layout_of(v)? else {
            return Err(LegalizeError::MalformedInstruction {
                function: self.func.name.clone(),
                message: format!("{} is not split", value_ref(self.func, v)),
            });
        };
        if let Some(c) = self.func.constant(v).cloned() {
            return layout
                .iter()
                .map(|part| match &c {
                    Constant::Int(bits) => {
                        let chunk_bits = (bits >> (part.chunk.offset * 8)) & mask(part.chunk.ty.bit_width());
                        Ok(self.func.const_int(part.ty, chunk_bits))
                    }
                    Constant::Zero => Ok(self.func.zero(part.ty)),
                    Constant::Undef => Ok(self.func.undef(part.ty)),
                    Constant::Vector(_) | Constant::Expr(_) => Err(LegalizeError::NonCanonicalConstant {
                        function: self.func.name.clone(),
                        value: value_ref(self.func, v),
                    }),
                })
                .collect();
        }
        match self.store.get(v).and_then(|info| info.parts()) {
            Some(parts) => Ok(parts.to_vec()),
            None => Err(LegalizeError::MalformedInstruction {
                function: self.func.name.clone(),
                message: format!("{} has no parts", value_ref(self.func, v)),
            }),
        }
    }

    fn open_phi(&mut self, i: Inst) -> Result<(Inst, Vec<Inst>), LegalizeError> {
        let Some(r) = self.func.result(i) else {
            return Err(LegalizeError::unhandled(self.func, i));
        };
        let Some(layout) = self.layout_of(r)? else {
            return Err(LegalizeError::unhandled(self.func, i));
        };
        let name = format!("{}.part", self.func.value_name(r).unwrap_or("v"));
        let mut b = Builder::new(self.func, InsertPoint::Before(i));
        let phis: Vec<Inst> = layout.iter().map(|part| b.phi(part.ty, &name)).collect();
        let parts = phis.iter().filter_map(|&p| self.func.result(p)).collect();
        self.record(r, parts)?;
        Ok((i, phis))
    }

    fn close_phi(&mut self, orig: Inst, phis: &[Inst]) -> Result<(), LegalizeError> {
        let Opcode::Phi(blocks) = self.func.inst(orig).op.clone() else { return Ok(()) };
        let incoming = self.func.args(orig).to_vec();
        for (v, from) in incoming.into_iter().zip(blocks) {
            let parts = self.parts_of(v)?;
            for (&phi, part) in phis.iter().zip(parts) {
                self.func.add_phi_incoming(phi, part, from);
            }
        }
        Ok(())
    }

    fn split(&mut self, i: Inst) -> Result<(), LegalizeError> {
        let data = self.func.inst(i).clone();
        let at = InsertPoint::Before(i);
        let args = &data.args;
        let result_layout = match data.result {
            Some(r) => self.layout_of(r)?.map(|layout| (r, layout)),
            None => None,
        };
        let name = match data.result {
            Some(r) => format!("{}.part", self.func.value_name(r).unwrap_or("v")),
            None => "part".to_string(),
        };

        match (&data.op, result_layout) {
            (Opcode::Load(attrs), Some((r, layout))) => {
                let mut b = Builder::new(self.func, at);
                let parts = layout
                    .iter()
                    .map(|part| memory::load_chunk(&mut b, args[0], *attrs, part.chunk, part.ty, &name))
                    .collect();
                self.record(r, parts)?;
            }
            (Opcode::Store(attrs), None) => {
                let Some(layout) = self.layout_of(args[0])? else {
                    return Err(LegalizeError::unhandled(self.func, i));
                };
                let parts = self.parts_of(args[0])?;
                let mut b = Builder::new(self.func, at);
                for (part, value) in layout.iter().zip(parts) {
                    memory::store_chunk(&mut b, value, args[1], *attrs, part.chunk, &name);
                }
            }
            (Opcode::Select, Some((r, _))) => {
                let t = self.parts_of(args[1])?;
                let f = self.parts_of(args[2])?;
                let mut b = Builder::new(self.func, at);
                let parts = t.into_iter().zip(f).map(|(t, f)| b.select(args[0], t, f, &name)).collect();
                self.record(r, parts)?;
            }
            (Opcode::Binary(op), Some((r, _))) if op.is_bitwise() => {
                let lhs = self.parts_of(args[0])?;
                let rhs = self.parts_of(args[1])?;
                let mut b = Builder::new(self.func, at);
                let parts = lhs.into_iter().zip(rhs).map(|(x, y)| b.binary(*op, x, y, &name)).collect();
                self.record(r, parts)?;
            }
            (Opcode::Cast(CastOp::Trunc), None) => {
                let (Some(r), Some(layout)) = (data.result, self.layout_of(args[0])?) else {
                    return Err(LegalizeError::unhandled(self.func, i));
                };
                let ty = self.func.value_type(r);
                if ty.bit_width() > layout[0].chunk.ty.bit_width() {
                    return Err(LegalizeError::unhandled(self.func, i));
                }
                let low = self.parts_of(args[0])?[0];
                let narrow = Builder::new(self.func, at).resize(low, ty, false, &name);
                self.func.replace_all_uses(r, narrow);
            }
            (Opcode::Cast(op @ (CastOp::ZExt | CastOp::SExt)), Some((r, layout))) => {
                let src = args[0];
                if self.layout_of(src)?.is_some() || self.func.value_type(src).bit_width() > layout[0].chunk.ty.bit_width() {
                    return Err(LegalizeError::unhandled(self.func, i));
                }
                let signed = *op == CastOp::SExt;
                let mut b = Builder::new(self.func, at);
                let low = b.resize(src, layout[0].ty, signed, &name);
                let fill = if signed {
                    let top = b.const_int(layout[0].ty, (layout[0].ty.bit_width() - 1) as u128);
                    Some(b.binary(BinaryOp::AShr, low, top, &name))
                } else {
                    None
                };
                let mut parts = vec![fit(&mut b, low, layout[0], signed, &name)];
                for &part in &layout[1..] {
                    parts.push(match fill {
                        Some(fill) => fit(&mut b, fill, part, true, &name),
                        None => b.func().zero(part.ty),
                    });
                }
                self.record(r, parts)?;
            }
            _ => return Err(LegalizeError::unhandled(self.func, i)),
        }
        trace!("@{}: split {}", self.func.name, crate::ir::display::inst_to_string(self.func, i));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::PlatformConfig;
    use crate::ir::eval::{Interpreter, Val};
    use crate::ir::verify::verify_function;
    use crate::legalize::sweep;
    use crate::parser::parse_str;

    fn split_src(src: &str) -> Result<(Function, Function, usize), LegalizeError> {
        let module = parse_str("t.ir", src).unwrap();
        let before = module.functions.into_iter().next().unwrap();
        let table = LegalityTable::new(PlatformConfig::default()).unwrap();
        let mut after = before.clone();
        let mut store = ValueInfoStore::new();
        let n = split_values(&mut after, &table, &mut store)?;
        sweep::sweep(&mut after, &store);
        Ok((before, after, n))
    }

    fn has_type(f: &Function, ty: Type) -> bool {
        f.live_insts()
            .into_iter()
            .any(|i| f.result(i).is_some_and(|r| f.value_type(r) == ty) || f.args(i).iter().any(|&a| f.value_type(a) == ty))
    }

    #[test]
    fn test_copy_through_memory() {
        let src = "fn @f(ptr %p, ptr %q) -> void {\nentry:\n  %x = load i72, ptr %p, align 8\n  %m = xor i72 %x, i72 -1\n  store i72 %m, ptr %q, align 8\n  ret void\n}\n";
        let (before, after, n) = split_src(src).unwrap();
        assert_eq!(n, 2);
        assert_eq!(verify_function(&after), Ok(()));
        assert!(!has_type(&after, Type::Int(72)));

        let memory: BTreeMap<u64, u8> = (0..9).map(|k| (0x100 + k, (k as u8) * 0x11)).collect();
        let args = [Val::Ptr(0x100), Val::Ptr(0x200)];
        let expect = Interpreter::new(&before).with_memory(memory.clone()).run(&args).unwrap();
        let got = Interpreter::new(&after).with_memory(memory).run(&args).unwrap();
        assert_eq!(got.memory, expect.memory);
    }

    #[test]
    fn test_sext_then_trunc() {
        let src = "fn @f(i32 %a, i1 %c) -> i32 {\nentry:\n  %w = sext i32 %a to i128\n  %z = zext i32 %a to i128\n  %s = select i1 %c, i128 %w, i128 %z\n  %t = trunc i128 %s to i32\n  ret i32 %t\n}\n";
        let (before, after, n) = split_src(src).unwrap();
        assert_eq!(n, 3);
        assert!(!has_type(&after, Type::Int(128)));
        for a in [0u128, 5, 0x8000_0000, 0xFFFF_FFFF] {
            for c in [0u128, 1] {
                let args = [Val::Int(a), Val::Int(c)];
                let expect = Interpreter::new(&before).run(&args).unwrap();
                let got = Interpreter::new(&after).run(&args).unwrap();
                assert_eq!(got.ret, expect.ret);
            }
        }
    }

    #[test]
    fn test_phi_parts() {
        let src = "fn @f(ptr %p, i1 %c) -> void {\nentry:\n  %x = load i128, ptr %p, align 8\n  condbr i1 %c, %then, %join\nthen:\n  br %join\njoin:\n  %y = phi i128 [i128 %x, %entry], [i128 0, %then]\n  store i128 %y, ptr %p, align 8\n  ret void\n}\n";
        let (_, after, n) = split_src(src).unwrap();
        assert_eq!(n, 2);
        assert_eq!(verify_function(&after), Ok(()));
        let phis = after.live_insts().into_iter().filter(|&i| after.inst(i).op.is_phi()).count();
        assert_eq!(phis, 2);
    }

    #[test]
    fn test_unsupported_use_is_fatal() {
        let src = "fn @f(ptr %p) -> void {\nentry:\n  %x = load i128, ptr %p, align 8\n  %y = add i128 %x, i128 1\n  ret void\n}\n";
        assert!(matches!(split_src(src), Err(LegalizeError::UnhandledOpcode { .. })));
    }

    #[test]
    fn test_split_argument_is_fatal() {
        let src = "fn @f(i128 %x) -> void {\nentry:\n  ret void\n}\n";
        assert!(matches!(split_src(src), Err(LegalizeError::SplitArgument { .. })));
    }

    #[test]
    fn test_constant_expression_is_fatal() {
        let src = "fn @f(ptr %p) -> void {\nentry:\n  store i128 constexpr \"ptrtoint @g\", ptr %p, align 8\n  ret void\n}\n";
        assert!(matches!(split_src(src), Err(LegalizeError::NonCanonicalConstant { .. })));
    }

    #[test]
    fn test_nothing_to_split() {
        let src = "fn @f(i8 %a) -> i8 {\nentry:\n  ret i8 %a\n}\n";
        let (before, after, n) = split_src(src).unwrap();
        assert_eq!(n, 0);
        assert_eq!(before.to_string(), after.to_string());
    }
}
