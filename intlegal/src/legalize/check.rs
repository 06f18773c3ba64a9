//! Legality postcondition
//!
//! After legalization, instructions that compute on integers see only legal
//! types, lane indices are legal, and every load or store moves a width
//! memory accepts. Instructions that only move bits (calls, casts, lane
//! moves, returns) may still carry an illegal narrow value; split types may
//! not appear anywhere.

use super::table::{LegalityTable, LegalizeAction};
use crate::ir::display::inst_to_string;
use crate::ir::{Function, Opcode, SubgroupOp, Value};

/// Report every instruction that breaks the postcondition.
pub fn check_legality(func: &Function, table: &LegalityTable) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let legal = |v: Value| table.is_legal(func.value_type(v));
    let split = |v: Value| matches!(table.classify(func.value_type(v)), Ok(LegalizeAction::Split(_)));

    for inst in func.live_insts() {
        let data = func.inst(inst);
        let mut report = |what: String| errors.push(format!("@{}: {what} in `{}`", func.name, inst_to_string(func, inst)));

        for v in data.result.iter().chain(&data.args) {
            if split(*v) {
                report(format!("split type {}", func.value_type(*v)));
            }
        }

        match &data.op {
            Opcode::Binary(_)
            | Opcode::ICmp(_)
            | Opcode::Select
            | Opcode::Phi(_)
            | Opcode::Freeze
            | Opcode::PtrAdd
            | Opcode::Subgroup(SubgroupOp::Reduce(_) | SubgroupOp::InclusiveScan(_) | SubgroupOp::ExclusiveScan(_)) => {
                for v in data.result.iter().chain(&data.args) {
                    if !legal(*v) {
                        report(format!("illegal type {}", func.value_type(*v)));
                    }
                }
            }
            Opcode::ExtractElement | Opcode::InsertElement => {
                if let Some(&index) = data.args.last() {
                    if !func.is_constant(index) && !legal(index) {
                        report(format!("illegal index type {}", func.value_type(index)));
                    }
                }
            }
            Opcode::Load(_) | Opcode::Store(_) => {
                let moved = match data.result {
                    Some(r) => r,
                    None => data.args[0],
                };
                let ty = func.value_type(moved);
                if !matches!(table.memory_chunks(ty), Ok(None)) {
                    report(format!("memory access of {ty}"));
                }
            }
            _ => {}
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::parser::parse_str;

    fn check(src: &str) -> Result<(), Vec<String>> {
        let func = parse_str("t.ir", src).unwrap().functions.remove(0);
        let table = LegalityTable::new(PlatformConfig::default()).unwrap();
        check_legality(&func, &table)
    }

    #[test]
    fn test_narrow_arithmetic_is_reported() {
        let errors = check("fn @f(i8 %a) -> i8 {\nentry:\n  %s = add i8 %a, i8 1\n  ret i8 %s\n}\n").unwrap_err();
        // Result and both operands.
        assert_eq!(errors.len(), 3);
        assert!(errors[0].contains("add i8 %a, i8 1"));
    }

    #[test]
    fn test_moves_may_stay_narrow() {
        let src = "fn @f(i16 %a, ptr %p) -> void {\nentry:\n  %t = trunc i16 %a to i8\n  store i8 %t, ptr %p, align 1\n  call void @use(i8 %t)\n  ret void\n}\n";
        assert_eq!(check(src), Ok(()));
    }

    #[test]
    fn test_memory_width() {
        let errors = check("fn @f(ptr %p) -> void {\nentry:\n  %l = load i24, ptr %p, align 1\n  call void @use(i24 %l)\n  ret void\n}\n").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("memory access of i24"));
    }
}
