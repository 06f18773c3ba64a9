//! Lane-by-lane conversion between a narrow vector and its promoted form

use super::info::ExtKind;
use crate::ir::{mask, BinaryOp, Builder, Type, Value};

fn lane_index(b: &mut Builder, k: u32) -> Value {
    b.const_int(Type::I32, k as u128)
}

/// `<n x iE>` to `<n x iP>`, extending each lane.
pub fn widen(b: &mut Builder, v: Value, to: Type, kind: ExtKind, name: &str) -> Value {
    let lane_ty = to.scalar();
    let mut acc = b.func().undef(to);
    for k in 0..to.lanes() {
        let idx = lane_index(b, k);
        let x = b.extract_element(v, idx, name);
        let y = b.resize(x, lane_ty, kind.is_signed(), name);
        acc = b.insert_element(acc, y, idx, name);
    }
    acc
}

/// `<n x iP>` back to `<n x iE>`, truncating each lane.
pub fn narrow(b: &mut Builder, wide: Value, to: Type, name: &str) -> Value {
    let lane_ty = to.scalar();
    let mut acc = b.func().undef(to);
    for k in 0..to.lanes() {
        let idx = lane_index(b, k);
        let x = b.extract_element(wide, idx, name);
        let y = b.resize(x, lane_ty, false, name);
        acc = b.insert_element(acc, y, idx, name);
    }
    acc
}

/// `<n x iE>` into one integer with lane `k` at bits `[k*E, (k+1)*E)`.
pub fn pack(b: &mut Builder, v: Value, to: Type, name: &str) -> Value {
    let e = b.value_type(v).int_elem_width().unwrap_or(0);
    let lanes = b.value_type(v).lanes();
    let mut acc: Option<Value> = None;
    for k in 0..lanes {
        let idx = lane_index(b, k);
        let x = b.extract_element(v, idx, name);
        let mut y = b.resize(x, to, false, name);
        if k > 0 {
            let amount = b.const_int(to, (k * e) as u128);
            y = b.binary(BinaryOp::Shl, y, amount, name);
        }
        acc = Some(match acc {
            Some(a) => b.binary(BinaryOp::Or, a, y, name),
            None => y,
        });
    }
    acc.unwrap_or_else(|| b.func().zero(to))
}

/// Rebuild `<n x iE>` from its packed integer.
pub fn unpack(b: &mut Builder, packed: Value, to: Type, name: &str) -> Value {
    let e = to.int_elem_width().unwrap_or(0);
    let lane_ty = to.scalar();
    let packed_ty = b.value_type(packed);
    let mut acc = b.func().undef(to);
    for k in 0..to.lanes() {
        let mut x = packed;
        if k > 0 {
            let amount = b.const_int(packed_ty, (k * e) as u128);
            x = b.binary(BinaryOp::LShr, x, amount, name);
        }
        let y = b.resize(x, lane_ty, false, name);
        let idx = lane_index(b, k);
        acc = b.insert_element(acc, y, idx, name);
    }
    acc
}

/// Lane `k` of a packed integer as an `elem_width`-bit value extended to
/// `lane_ty`.
pub fn extract_packed(
    b: &mut Builder,
    packed: Value,
    k: u32,
    elem_width: u32,
    lane_ty: Type,
    kind: ExtKind,
    name: &str,
) -> Value {
    let packed_ty = b.value_type(packed);
    let mut x = packed;
    if k > 0 {
        let amount = b.const_int(packed_ty, (k * elem_width) as u128);
        x = b.binary(BinaryOp::LShr, x, amount, name);
    }
    let low = b.resize(x, lane_ty, false, name);
    if kind.is_signed() {
        let spare = b.const_int(lane_ty, (lane_ty.bit_width() - elem_width) as u128);
        let high = b.binary(BinaryOp::Shl, low, spare, name);
        b.binary(BinaryOp::AShr, high, spare, name)
    } else {
        let m = b.const_int(lane_ty, mask(elem_width));
        b.binary(BinaryOp::And, low, m, name)
    }
}

/// Put the low `elem_width` bits of `lane` at lane `k` of a packed integer,
/// or-ing into `acc` when there is one.
pub fn place_packed(
    b: &mut Builder,
    acc: Option<Value>,
    lane: Value,
    k: u32,
    elem_width: u32,
    packed_ty: Type,
    name: &str,
) -> Value {
    let x = b.resize(lane, packed_ty, false, name);
    let m = b.const_int(packed_ty, mask(elem_width));
    let mut field = b.binary(BinaryOp::And, x, m, name);
    if k > 0 {
        let amount = b.const_int(packed_ty, (k * elem_width) as u128);
        field = b.binary(BinaryOp::Shl, field, amount, name);
    }
    match acc {
        Some(a) => b.binary(BinaryOp::Or, a, field, name),
        None => field,
    }
}

/// Bits of a packed constant vector.
pub fn pack_constant(lanes: &[u128], elem_width: u32) -> u128 {
    lanes
        .iter()
        .enumerate()
        .fold(0, |acc, (k, &bits)| acc | ((bits & mask(elem_width)) << (k as u32 * elem_width)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::eval::{Interpreter, Val};
    use crate::ir::{Elem, Function, InsertPoint, Opcode};

    fn harness(build: impl FnOnce(&mut Builder, Value) -> Value, ret: Type) -> Function {
        let mut f = Function::new("f", ret);
        let v = f.add_param(Type::Vector(Elem::Int(8), 4), "v");
        let entry = f.add_block("entry");
        let mut b = Builder::new(&mut f, InsertPoint::End(entry));
        let out = build(&mut b, v);
        f.insert_inst(InsertPoint::End(entry), Opcode::Ret, vec![out], Type::Void, "");
        f
    }

    fn run(f: &Function) -> Val {
        let arg = Val::Lanes(vec![0x01, 0x80, 0x7F, 0xFF]);
        Interpreter::new(f).run(&[arg]).unwrap().ret.unwrap()
    }

    #[test]
    fn test_widen_sign_and_zero() {
        let to = Type::Vector(Elem::Int(16), 4);
        let f = harness(|b, v| widen(b, v, to, ExtKind::Sign, "w"), to);
        assert_eq!(run(&f), Val::Lanes(vec![0x0001, 0xFF80, 0x007F, 0xFFFF]));
        let f = harness(|b, v| widen(b, v, to, ExtKind::Zero, "w"), to);
        assert_eq!(run(&f), Val::Lanes(vec![0x01, 0x80, 0x7F, 0xFF]));
    }

    #[test]
    fn test_pack_then_unpack() {
        let v4 = Type::Vector(Elem::Int(8), 4);
        let f = harness(|b, v| pack(b, v, Type::I32, "p"), Type::I32);
        assert_eq!(run(&f), Val::Int(0xFF7F_8001));
        let f = harness(
            |b, v| {
                let p = pack(b, v, Type::I32, "p");
                unpack(b, p, v4, "u")
            },
            v4,
        );
        assert_eq!(run(&f), Val::Lanes(vec![0x01, 0x80, 0x7F, 0xFF]));
    }

    #[test]
    fn test_widen_then_narrow() {
        let v4 = Type::Vector(Elem::Int(8), 4);
        let to = Type::Vector(Elem::Int(16), 4);
        let f = harness(
            |b, v| {
                let w = widen(b, v, to, ExtKind::Sign, "w");
                narrow(b, w, v4, "n")
            },
            v4,
        );
        assert_eq!(run(&f), Val::Lanes(vec![0x01, 0x80, 0x7F, 0xFF]));
    }

    #[test]
    fn test_packed_lane_access() {
        // Swap lanes 0 and 3 through the packed form, reading lane 3 signed.
        let f = harness(
            |b, v| {
                let p = pack(b, v, Type::I32, "p");
                let first = extract_packed(b, p, 0, 8, Type::Int(16), ExtKind::Zero, "x");
                let last = extract_packed(b, p, 3, 8, Type::Int(16), ExtKind::Sign, "x");
                let acc = place_packed(b, None, last, 0, 8, Type::I32, "y");
                let mid = extract_packed(b, p, 1, 8, Type::Int(16), ExtKind::Zero, "x");
                let acc = place_packed(b, Some(acc), mid, 1, 8, Type::I32, "y");
                place_packed(b, Some(acc), first, 3, 8, Type::I32, "y")
            },
            Type::I32,
        );
        assert_eq!(run(&f), Val::Int(0x0100_80FF));

        let f = harness(
            |b, v| {
                let p = pack(b, v, Type::I32, "p");
                extract_packed(b, p, 1, 8, Type::Int(16), ExtKind::Sign, "x")
            },
            Type::Int(16),
        );
        assert_eq!(run(&f), Val::Int(0xFF80));
    }

    #[test]
    fn test_pack_constant() {
        assert_eq!(pack_constant(&[0x01, 0x80, 0x7F, 0xFF], 8), 0xFF7F_8001);
        assert_eq!(pack_constant(&[0x1FF, 0x1], 8), 0x01FF);
    }
}
