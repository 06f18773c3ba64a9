//! Subgroup intrinsic promotion
//!
//! Cross-lane operations on an illegal scalar are re-issued at the promoted
//! width before any other phase runs. The result is truncated back, so the
//! rest of the pipeline sees an ordinary truncation it can fold.

use log::debug;

use super::table::{LegalityTable, LegalizeAction};
use super::LegalizeError;
use crate::ir::{
    mask, sign_extend, Builder, Constant, Function, GroupOp, InsertPoint, Inst, IntPredicate, Opcode, SubgroupOp,
    Type, Value,
};

/// Promote every subgroup intrinsic with an illegal scalar result. Returns
/// the number rewritten.
pub fn promote_subgroup_ops(func: &mut Function, table: &LegalityTable) -> Result<usize, LegalizeError> {
    let mut promoted = 0;
    for inst in func.live_insts() {
        let Opcode::Subgroup(op) = func.inst(inst).op else { continue };
        let Some(r) = func.result(inst) else { continue };
        let ty = func.value_type(r);
        if !ty.is_int() {
            continue;
        }
        let LegalizeAction::Promote(wide_ty) = table.classify(ty)? else { continue };
        if op.is_lane_move() && func.is_constant(func.args(inst)[1]) {
            continue;
        }
        promote(func, inst, op, r, wide_ty);
        promoted += 1;
    }
    if promoted > 0 {
        debug!("@{}: promoted {promoted} subgroup op(s)", func.name);
    }
    Ok(promoted)
}

fn promote(func: &mut Function, inst: Inst, op: SubgroupOp, r: Value, wide_ty: Type) {
    let ty = func.value_type(r);
    let width = ty.bit_width();
    let signed = !op.group_op().is_some_and(GroupOp::is_unsigned);
    let args = func.args(inst).to_vec();
    let base = func.value_name(r).unwrap_or("sg").to_string();

    let mut b = Builder::new(func, InsertPoint::Before(inst));
    let x = match b.func().constant(args[0]).cloned() {
        Some(Constant::Int(bits)) => {
            let bits = if signed { sign_extend(bits, width) as u128 } else { bits };
            b.const_int(wide_ty, bits)
        }
        _ => b.resize(args[0], wide_ty, signed, &format!("{base}.wide")),
    };
    let mut wide_args = vec![x];
    wide_args.extend(args.get(1).copied());
    let mut wide = b.subgroup(op, wide_args, wide_ty, &format!("{base}.wide"));

    // An exclusive scan hands the first lane the identity of the wide type.
    let fixup = match op {
        SubgroupOp::ExclusiveScan(GroupOp::IMin) => Some((mask(wide_ty.bit_width()) >> 1, mask(width) >> 1)),
        SubgroupOp::ExclusiveScan(GroupOp::IMax) => Some((
            1u128 << (wide_ty.bit_width() - 1),
            sign_extend(1u128 << (width - 1), width) as u128,
        )),
        _ => None,
    };
    if let Some((wide_identity, narrow_identity)) = fixup {
        let name = format!("{base}.fix");
        let wide_identity = b.const_int(wide_ty, wide_identity);
        let narrow_identity = b.const_int(wide_ty, narrow_identity);
        let hit = b.icmp(IntPredicate::Eq, wide, wide_identity, &name);
        wide = b.select(hit, narrow_identity, wide, &name);
    }

    let narrow = b.trunc(wide, ty, &format!("{base}.trunc"));
    func.replace_all_uses(r, narrow);
    func.erase_inst(inst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::ir::eval::{identity, Interpreter, Val};
    use crate::ir::verify::verify_function;
    use crate::parser::parse_str;

    fn promote_src(src: &str) -> (Function, Function, usize) {
        let before = parse_str("t.ir", src).unwrap().functions.remove(0);
        let table = LegalityTable::new(PlatformConfig::default()).unwrap();
        let mut after = before.clone();
        let n = promote_subgroup_ops(&mut after, &table).unwrap();
        assert_eq!(verify_function(&after), Ok(()));
        (before, after, n)
    }

    fn scan(op: &str) -> String {
        format!("fn @f(i8 %x) -> i8 {{\nentry:\n  %s = subgroup.scan.exclusive.{op} i8 %x\n  ret i8 %s\n}}\n")
    }

    #[test]
    fn test_exclusive_scan_keeps_narrow_identity() {
        for g in GroupOp::ALL {
            let (before, after, n) = promote_src(&scan(g.mnemonic()));
            assert_eq!(n, 1);
            let expect = Interpreter::new(&before).run(&[Val::Int(5)]).unwrap().ret;
            let got = Interpreter::new(&after).run(&[Val::Int(5)]).unwrap().ret;
            assert_eq!(got, expect, "{}", g.mnemonic());
            assert_eq!(got, Some(Val::Int(identity(g, 8))), "{}", g.mnemonic());
        }
    }

    #[test]
    fn test_unsigned_ops_zero_extend() {
        let src = "fn @f(i8 %x) -> i8 {\nentry:\n  %r = subgroup.reduce.umax i8 %x\n  ret i8 %r\n}\n";
        let (_, after, _) = promote_src(src);
        let text = after.to_string();
        assert!(text.contains("zext i8 %x to i16"), "{text}");
        assert!(text.contains("subgroup.reduce.umax i16"), "{text}");
    }

    #[test]
    fn test_lane_moves() {
        let src = "fn @f(i8 %x, i32 %lane) -> void {\nentry:\n  %a = subgroup.shuffle i8 %x, i32 %lane\n  %b = subgroup.broadcast i8 %x, i32 0\n  call void @use(i8 %a, i8 %b)\n  ret void\n}\n";
        let (_, after, n) = promote_src(src);
        // Only the shuffle with a variable lane is promoted.
        assert_eq!(n, 1);
        assert!(after.to_string().contains("subgroup.broadcast i8 %x"));
    }

    #[test]
    fn test_legal_width_untouched() {
        let src = "fn @f(i32 %x) -> i32 {\nentry:\n  %r = subgroup.reduce.add i32 %x\n  ret i32 %r\n}\n";
        let (before, after, n) = promote_src(src);
        assert_eq!(n, 0);
        assert_eq!(before.to_string(), after.to_string());
    }
}
