//! Load and store splitting
//!
//! An access of an illegal width becomes one access per chunk at its byte
//! offset. Loaded chunks are zero-extended, shifted into place and OR-ed
//! together, which reproduces the little-endian layout of the original.

use super::table::{min_align, MemoryChunk};
use crate::ir::{BinaryOp, Builder, MemAttrs, Type, Value};

fn chunk_address(b: &mut Builder, ptr: Value, offset: u32, name: &str) -> Value {
    if offset == 0 {
        return ptr;
    }
    let off = b.const_int(Type::I64, offset as u128);
    b.ptr_add(ptr, off, name)
}

fn chunk_attrs(attrs: MemAttrs, offset: u32) -> MemAttrs {
    MemAttrs {
        align: min_align(attrs.align, offset),
        volatile: attrs.volatile,
    }
}

/// Load one chunk and zero-extend it to `to`, leaving it in the low bits.
pub fn load_chunk(b: &mut Builder, ptr: Value, attrs: MemAttrs, chunk: MemoryChunk, to: Type, name: &str) -> Value {
    let addr = chunk_address(b, ptr, chunk.offset, name);
    let part = b.load(chunk.ty, addr, chunk_attrs(attrs, chunk.offset), name);
    b.resize(part, to, false, name)
}

/// Store the low `chunk.ty` bits of `bits` at the chunk's offset.
pub fn store_chunk(b: &mut Builder, bits: Value, ptr: Value, attrs: MemAttrs, chunk: MemoryChunk, name: &str) {
    let part = b.resize(bits, chunk.ty, false, name);
    let addr = chunk_address(b, ptr, chunk.offset, name);
    b.store(part, addr, chunk_attrs(attrs, chunk.offset));
}

/// Load the chunks and assemble them into a value of type `to`. The bits
/// above the chunks' total width are zero.
pub fn split_load(b: &mut Builder, ptr: Value, attrs: MemAttrs, chunks: &[MemoryChunk], to: Type, name: &str) -> Value {
    let mut acc: Option<Value> = None;
    for &chunk in chunks {
        let mut part = load_chunk(b, ptr, attrs, chunk, to, name);
        if chunk.offset > 0 {
            let amount = b.const_int(to, (chunk.offset * 8) as u128);
            part = b.binary(BinaryOp::Shl, part, amount, name);
        }
        acc = Some(match acc {
            Some(a) => b.binary(BinaryOp::Or, a, part, name),
            None => part,
        });
    }
    acc.unwrap_or_else(|| b.func().zero(to))
}

/// Store the low bits of `value`, chunk by chunk.
pub fn split_store(b: &mut Builder, value: Value, ptr: Value, attrs: MemAttrs, chunks: &[MemoryChunk], name: &str) {
    let ty = b.value_type(value);
    for &chunk in chunks {
        let mut bits = value;
        if chunk.offset > 0 {
            let amount = b.const_int(ty, (chunk.offset * 8) as u128);
            bits = b.binary(BinaryOp::LShr, bits, amount, name);
        }
        store_chunk(b, bits, ptr, attrs, chunk, name);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::ir::eval::{Interpreter, Val};
    use crate::ir::{Function, InsertPoint, Opcode};

    fn i56_chunks() -> Vec<MemoryChunk> {
        vec![
            MemoryChunk { ty: Type::I32, offset: 0 },
            MemoryChunk { ty: Type::Int(16), offset: 4 },
            MemoryChunk { ty: Type::Int(8), offset: 6 },
        ]
    }

    #[test]
    fn test_split_load_reassembles() {
        let mut f = Function::new("f", Type::I64);
        let p = f.add_param(Type::Ptr, "p");
        let entry = f.add_block("entry");
        let attrs = MemAttrs { align: 4, volatile: true };
        let mut b = Builder::new(&mut f, InsertPoint::End(entry));
        let v = split_load(&mut b, p, attrs, &i56_chunks(), Type::I64, "l");
        f.insert_inst(InsertPoint::End(entry), Opcode::Ret, vec![v], Type::Void, "");

        let loads: Vec<MemAttrs> = f
            .live_insts()
            .into_iter()
            .filter_map(|i| match f.inst(i).op {
                Opcode::Load(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(loads.iter().map(|a| a.align).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert!(loads.iter().all(|a| a.volatile));

        let memory: BTreeMap<u64, u8> = (0..8).map(|k| (0x40 + k, 0x11 * (k as u8 + 1))).collect();
        let out = Interpreter::new(&f).with_memory(memory).run(&[Val::Ptr(0x40)]).unwrap();
        assert_eq!(out.ret, Some(Val::Int(0x0077_6655_4433_2211)));
    }

    #[test]
    fn test_split_store_writes_each_chunk() {
        let mut f = Function::new("f", Type::Void);
        let p = f.add_param(Type::Ptr, "p");
        let x = f.add_param(Type::I64, "x");
        let entry = f.add_block("entry");
        let attrs = MemAttrs { align: 4, volatile: false };
        let mut b = Builder::new(&mut f, InsertPoint::End(entry));
        split_store(&mut b, x, p, attrs, &i56_chunks(), "s");
        f.insert_inst(InsertPoint::End(entry), Opcode::Ret, vec![], Type::Void, "");

        let out = Interpreter::new(&f)
            .run(&[Val::Ptr(0x80), Val::Int(0xAA77_6655_4433_2211)])
            .unwrap();
        let bytes: Vec<u8> = (0x80..0x88).map(|a| out.memory.get(&a).copied().unwrap_or(0)).collect();
        assert_eq!(bytes, vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x00]);
    }
}
