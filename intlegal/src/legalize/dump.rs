//! Decision dump
//!
//! Renders what the decision engine concluded for one function: one line
//! per tracked parameter, and for every instruction touching a tracked
//! value, its result and each illegal operand.
//!
//! ```text
//! function @f
//!   param i8 %a: promoted-at-def -> i16
//!   %s = add i8 %a, i8 %b
//!     result: promoted-at-def -> i16
//!     operand 0 i8 %a: promoted-at-def
//! ```

use std::fmt::Write;

use super::decide::{forces_promotion_at_def, forcing_operands};
use super::info::{Decision, ValueInfoStore};
use super::table::{LegalityTable, LegalizeAction};
use super::LegalizeError;
use crate::ir::display::{inst_to_string, operand};
use crate::ir::{Function, Value};

fn target(store: &ValueInfoStore, v: Value) -> String {
    match store.get(v).map(|info| &info.action) {
        Some(LegalizeAction::Promote(ty)) => format!(" -> {ty}"),
        Some(LegalizeAction::Split(parts)) => {
            let parts: Vec<String> = parts.iter().map(|t| t.to_string()).collect();
            format!(" -> {{{}}}", parts.join(", "))
        }
        _ => String::new(),
    }
}

fn label(decision: Decision) -> &'static str {
    match decision {
        Decision::Untracked => "legal",
        Decision::PromoteAtDef => "promoted-at-def",
        Decision::PromoteAtUse => "promote-at-use",
        Decision::Split => "split",
    }
}

/// Render the decisions recorded in `store` for `func`.
pub fn render(func: &Function, table: &LegalityTable, store: &ValueInfoStore) -> Result<String, LegalizeError> {
    let mut out = String::new();
    let _ = writeln!(out, "function @{}", func.name);
    for &p in &func.params {
        if store.is_tracked(p) {
            let _ = writeln!(out, "  param {}: {}{}", operand(func, p), label(store.decision(p)), target(store, p));
        }
    }

    for inst in func.live_insts() {
        if store.is_superseded(inst) {
            continue;
        }
        let data = func.inst(inst);
        let result = data.result.filter(|&r| store.is_tracked(r));
        let tracked_args: Vec<usize> = (0..data.args.len()).filter(|&k| store.is_tracked(data.args[k])).collect();
        if result.is_none() && tracked_args.is_empty() {
            continue;
        }

        let _ = writeln!(out, "  {}", inst_to_string(func, inst));
        let forcing = match result {
            Some(r) => {
                let _ = writeln!(out, "    result: {}{}", label(store.decision(r)), target(store, r));
                if forces_promotion_at_def(func, table, inst)? {
                    (0..data.args.len()).collect()
                } else {
                    Vec::new()
                }
            }
            None => {
                if data.result.is_some() {
                    let _ = writeln!(out, "    result: legal");
                }
                forcing_operands(func, table, inst)?
            }
        };
        for k in tracked_args {
            let a = data.args[k];
            let how = match store.decision(a) {
                Decision::PromoteAtUse if forcing.contains(&k) => "promote-here",
                Decision::PromoteAtUse => "use-narrow",
                other => label(other),
            };
            let _ = writeln!(out, "    operand {k} {}: {how}", operand(func, a));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::legalize::decide::decide;
    use crate::parser::parse_str;

    #[test]
    fn test_render_labels() {
        let src = "fn @f(i8 %a, ptr %p) -> i1 {\nentry:\n  %s = add i8 %a, i8 1\n  %l = load i8, ptr %p, align 1\n  call void @use(i8 %l, i8 %s)\n  %c = icmp ult i8 %l, i8 %s\n  call void @use(i8 %l)\n  ret i1 %c\n}\n";
        let func = parse_str("t.ir", src).unwrap().functions.remove(0);
        let table = LegalityTable::new(PlatformConfig::default()).unwrap();
        let mut store = ValueInfoStore::new();
        decide(&func, &table, &mut store).unwrap();
        let text = render(&func, &table, &store).unwrap();
        let expected = "\
function @f
  param i8 %a: promoted-at-def -> i16
  %s = add i8 %a, i8 1
    result: promoted-at-def -> i16
    operand 0 i8 %a: promoted-at-def
  %l = load i8, ptr %p, align 1
    result: promote-at-use -> i16
  call void @use(i8 %l, i8 %s)
    operand 0 i8 %l: use-narrow
    operand 1 i8 %s: promoted-at-def
  %c = icmp ult i8 %l, i8 %s
    result: legal
    operand 0 i8 %l: promote-here
    operand 1 i8 %s: promoted-at-def
  call void @use(i8 %l)
    operand 0 i8 %l: use-narrow
";
        assert_eq!(text, expected);
    }
}
