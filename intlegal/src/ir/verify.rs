//! Structural verifier
//!
//! Checks block shape, operand typing, SSA dominance and dangling uses.
//! Returns every problem found rather than stopping at the first one.

use super::dom::{DomTree, Dominance};
use super::display::{inst_to_string, value_ref};
use super::{CastOp, Elem, Function, Inst, Opcode, Type, Value, ValueDef};

/// Verify `func`, returning a list of human-readable problems.
pub fn verify_function(func: &Function) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let dom = DomTree::compute(func);
    let preds = func.predecessors();

    for b in func.blocks() {
        let insts = func.block_insts(b);
        let name = func.block_name(b);
        match insts.last() {
            Some(&last) if func.inst(last).op.is_terminator() => {}
            _ => errors.push(format!("block %{name} does not end with a terminator")),
        }
        let mut seen_non_phi = false;
        for (k, &i) in insts.iter().enumerate() {
            let op = &func.inst(i).op;
            if op.is_terminator() && k + 1 != insts.len() {
                errors.push(format!("terminator in the middle of block %{name}"));
            }
            if op.is_phi() {
                if seen_non_phi {
                    errors.push(format!("phi after non-phi in block %{name}: {}", inst_to_string(func, i)));
                }
                if let Opcode::Phi(blocks) = op {
                    let block_preds = preds.get(&b).cloned().unwrap_or_default();
                    for p in &block_preds {
                        if !blocks.contains(p) {
                            errors.push(format!(
                                "phi {} has no incoming value for predecessor %{}",
                                inst_to_string(func, i),
                                func.block_name(*p)
                            ));
                        }
                    }
                    for from in blocks {
                        if !block_preds.contains(from) {
                            errors.push(format!(
                                "phi {} names %{} which is not a predecessor",
                                inst_to_string(func, i),
                                func.block_name(*from)
                            ));
                        }
                    }
                }
            } else {
                seen_non_phi = true;
            }
            check_operands(func, &dom, i, &mut errors);
            if let Err(e) = check_types(func, i) {
                errors.push(format!("{e}: {}", inst_to_string(func, i)));
            }
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_operands(func: &Function, dom: &DomTree, user: Inst, errors: &mut Vec<String>) {
    let data = func.inst(user);
    for (k, &v) in data.args.iter().enumerate() {
        let ValueDef::Inst(def) = func.value(v).def else { continue };
        if func.is_erased(def) {
            errors.push(format!(
                "use of erased value {} in {}",
                value_ref(func, v),
                inst_to_string(func, user)
            ));
            continue;
        }
        let def_block = func.inst(def).block;
        if !dom.is_reachable(data.block) {
            continue;
        }
        let ok = match &data.op {
            Opcode::Phi(blocks) => {
                let from = blocks[k];
                !dom.is_reachable(from) || dom.block_dominates(def_block, from)
            }
            _ => def != user && dom.dominates(func, def, user),
        };
        if !ok {
            errors.push(format!(
                "{} does not dominate its use in {}",
                value_ref(func, v),
                inst_to_string(func, user)
            ));
        }
    }
}

fn same(func: &Function, a: Value, b: Value) -> bool {
    func.value_type(a) == func.value_type(b)
}

fn check_types(func: &Function, i: Inst) -> Result<(), String> {
    let data = func.inst(i);
    let args = &data.args;
    let ty = data.result.map(|r| func.value_type(r)).unwrap_or(Type::Void);
    let arity = |n: usize| {
        if args.len() == n { Ok(()) } else { Err(format!("expected {n} operands, found {}", args.len())) }
    };
    let t = |k: usize| func.value_type(args[k]);
    match &data.op {
        Opcode::Binary(_) => {
            arity(2)?;
            if !same(func, args[0], args[1]) || t(0) != ty || ty.int_elem_width().is_none() {
                return Err("binary operand types do not match".to_string());
            }
        }
        Opcode::ICmp(_) => {
            arity(2)?;
            if !same(func, args[0], args[1]) || ty != t(0).bool_shape() {
                return Err("compare operand types do not match".to_string());
            }
        }
        Opcode::Select => {
            arity(3)?;
            let c = t(0);
            if c != Type::I1 && c != ty.bool_shape() {
                return Err("select condition is not boolean".to_string());
            }
            if t(1) != ty || t(2) != ty {
                return Err("select arm types do not match".to_string());
            }
        }
        Opcode::Phi(blocks) => {
            if blocks.len() != args.len() {
                return Err("phi block/value count mismatch".to_string());
            }
            if args.iter().any(|&a| func.value_type(a) != ty) {
                return Err("phi incoming type mismatch".to_string());
            }
        }
        Opcode::Cast(op) => {
            arity(1)?;
            check_cast(*op, t(0), ty)?;
        }
        Opcode::ExtractElement => {
            arity(2)?;
            if !t(0).is_vector() || t(0).scalar() != ty || !t(1).is_int() {
                return Err("malformed extractelement".to_string());
            }
        }
        Opcode::InsertElement => {
            arity(3)?;
            if !t(0).is_vector() || t(0) != ty || t(1) != ty.scalar() || !t(2).is_int() {
                return Err("malformed insertelement".to_string());
            }
        }
        Opcode::ShuffleVector(mask) => {
            arity(2)?;
            let n = t(0).lanes() * 2;
            if !t(0).is_vector() || t(0) != t(1) || mask.iter().any(|&m| m >= n) || ty.lanes() as usize != mask.len() {
                return Err("malformed shufflevector".to_string());
            }
        }
        Opcode::Load(_) => {
            arity(1)?;
            if t(0) != Type::Ptr {
                return Err("load address is not a pointer".to_string());
            }
        }
        Opcode::Store(_) => {
            arity(2)?;
            if t(1) != Type::Ptr {
                return Err("store address is not a pointer".to_string());
            }
        }
        Opcode::PtrAdd => {
            arity(2)?;
            if t(0) != Type::Ptr || !t(1).is_int() {
                return Err("malformed ptradd".to_string());
            }
        }
        Opcode::Subgroup(op) => {
            arity(if op.is_lane_move() { 2 } else { 1 })?;
            if t(0) != ty {
                return Err("subgroup operand type mismatch".to_string());
            }
        }
        Opcode::Freeze => {
            arity(1)?;
            if t(0) != ty {
                return Err("freeze type mismatch".to_string());
            }
        }
        Opcode::CondBr(..) => {
            arity(1)?;
            if t(0) != Type::I1 {
                return Err("branch condition is not i1".to_string());
            }
        }
        Opcode::Ret => {
            let actual = args.first().map(|&a| func.value_type(a)).unwrap_or(Type::Void);
            if actual != func.ret_ty {
                return Err(format!("returns {actual}, function returns {}", func.ret_ty));
            }
        }
        Opcode::Call(_) | Opcode::Br(_) => {}
    }
    Ok(())
}

fn check_cast(op: CastOp, from: Type, to: Type) -> Result<(), String> {
    let is_int_like = |t: Type| matches!(t, Type::Int(_) | Type::Vector(Elem::Int(_), _));
    let is_fp_like = |t: Type| matches!(t, Type::Float(_) | Type::Vector(Elem::Float(_), _));
    let ok = match op {
        CastOp::Trunc | CastOp::ZExt | CastOp::SExt => {
            let (Some(fw), Some(tw)) = (from.int_elem_width(), to.int_elem_width()) else {
                return Err("integer cast of non-integer".to_string());
            };
            from.lanes() == to.lanes()
                && match op {
                    CastOp::Trunc => tw < fw,
                    _ => tw > fw,
                }
        }
        CastOp::Bitcast => from.bit_width() == to.bit_width(),
        CastOp::FpToSi | CastOp::FpToUi => is_fp_like(from) && is_int_like(to),
        CastOp::SiToFp | CastOp::UiToFp => is_int_like(from) && is_fp_like(to),
        CastOp::PtrToInt => from == Type::Ptr && to.is_int(),
        CastOp::IntToPtr => from.is_int() && to == Type::Ptr,
    };
    if ok { Ok(()) } else { Err(format!("invalid {} from {from} to {to}", op.mnemonic())) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, InsertPoint};

    #[test]
    fn test_verify_accepts_simple_function() {
        let mut f = Function::new("f", Type::Int(8));
        let a = f.add_param(Type::Int(8), "a");
        let entry = f.add_block("entry");
        let at = InsertPoint::End(entry);
        let s = f.insert_inst(at, Opcode::Binary(BinaryOp::Add), vec![a, a], Type::Int(8), "s");
        let s = f.result(s).unwrap();
        f.insert_inst(at, Opcode::Ret, vec![s], Type::Void, "");
        assert_eq!(verify_function(&f), Ok(()));
    }

    #[test]
    fn test_verify_reports_dangling_use() {
        let mut f = Function::new("f", Type::Int(8));
        let a = f.add_param(Type::Int(8), "a");
        let entry = f.add_block("entry");
        let at = InsertPoint::End(entry);
        let add = f.insert_inst(at, Opcode::Binary(BinaryOp::Add), vec![a, a], Type::Int(8), "s");
        let s = f.result(add).unwrap();
        f.insert_inst(at, Opcode::Ret, vec![s], Type::Void, "");
        f.erase_inst(add);
        let errors = verify_function(&f).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("use of erased value %s")));
    }

    #[test]
    fn test_verify_reports_use_before_def() {
        let mut f = Function::new("f", Type::Int(8));
        let a = f.add_param(Type::Int(8), "a");
        let entry = f.add_block("entry");
        let ret = f.insert_inst(InsertPoint::End(entry), Opcode::Ret, vec![a], Type::Void, "");
        let x = f.insert_inst(InsertPoint::Before(ret), Opcode::Freeze, vec![a], Type::Int(8), "x");
        let x = f.result(x).unwrap();
        let y = f.insert_inst(InsertPoint::Before(ret), Opcode::Freeze, vec![a], Type::Int(8), "y");
        // Make x use y, which comes after it.
        let first = f.block_insts(entry)[0];
        f.set_arg(first, 0, f.result(y).unwrap());
        let errors = verify_function(&f).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("does not dominate")), "{errors:?}");
        let _ = x;
    }

    #[test]
    fn test_verify_reports_bad_cast() {
        let mut f = Function::new("f", Type::Void);
        let a = f.add_param(Type::Int(8), "a");
        let entry = f.add_block("entry");
        let at = InsertPoint::End(entry);
        f.insert_inst(at, Opcode::Cast(CastOp::Trunc), vec![a], Type::Int(16), "t");
        f.insert_inst(at, Opcode::Ret, vec![], Type::Void, "");
        let errors = verify_function(&f).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("invalid trunc")));
    }
}
