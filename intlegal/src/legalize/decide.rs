//! Promotion decision engine
//!
//! Three passes, run to completion before any rewriting:
//!
//! 1. seed: ALU-class producers of illegal values are promoted at their
//!    definition; each illegal operand they (or a forcing consumer) read
//!    counts one promoted use;
//! 2. majority: a value whose promoted uses are more than half of all its
//!    uses is promoted at its definition too;
//! 3. chain: insert/extract element edges are driven to a fixpoint where
//!    both ends share one decision.

use log::debug;

use super::info::{Decision, ValueInfoStore};
use super::table::LegalityTable;
use super::LegalizeError;
use crate::ir::{Function, Inst, Opcode, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecideSummary {
    pub tracked: usize,
    pub at_def: usize,
    pub at_use: usize,
    pub split: usize,
    pub chain_iterations: usize,
}

/// Does an illegal result of `inst` have to be promoted where it is defined?
pub fn forces_promotion_at_def(func: &Function, table: &LegalityTable, inst: Inst) -> Result<bool, LegalizeError> {
    let data = func.inst(inst);
    Ok(match &data.op {
        Opcode::Binary(_) | Opcode::Select | Opcode::Phi(_) | Opcode::Freeze => true,
        Opcode::ExtractElement => !func.is_constant(data.args[1]),
        Opcode::InsertElement => !func.is_constant(data.args[2]),
        Opcode::Load(_) => match data.result {
            Some(r) => table.memory_chunks(func.value_type(r))?.is_some(),
            None => false,
        },
        _ => false,
    })
}

/// Operand slots of a legal-result instruction that need a promoted value.
pub fn forcing_operands(func: &Function, table: &LegalityTable, inst: Inst) -> Result<Vec<usize>, LegalizeError> {
    let data = func.inst(inst);
    Ok(match &data.op {
        Opcode::ICmp(_) => vec![0, 1],
        Opcode::PtrAdd => vec![1],
        Opcode::ExtractElement if !func.is_constant(data.args[1]) => vec![1],
        Opcode::InsertElement if !func.is_constant(data.args[2]) => vec![2],
        Opcode::Store(_) => {
            if table.memory_chunks(func.value_type(data.args[0]))?.is_some() {
                vec![0]
            } else {
                Vec::new()
            }
        }
        _ => Vec::new(),
    })
}

/// Run all three passes and leave the decisions in `store`.
pub fn decide(func: &Function, table: &LegalityTable, store: &mut ValueInfoStore) -> Result<DecideSummary, LegalizeError> {
    seed(func, table, store)?;
    majority(func, store);
    let chain_iterations = chain(func, store)?;

    let mut summary = DecideSummary {
        tracked: store.len(),
        chain_iterations,
        ..Default::default()
    };
    for v in store.values() {
        match store.decision(v) {
            Decision::PromoteAtDef => summary.at_def += 1,
            Decision::PromoteAtUse => summary.at_use += 1,
            Decision::Split => summary.split += 1,
            Decision::Untracked => {}
        }
    }
    debug!(
        "@{}: {} tracked, {} promoted at def, {} at use, {} chain iteration(s)",
        func.name, summary.tracked, summary.at_def, summary.at_use, summary.chain_iterations
    );
    Ok(summary)
}

fn seed(func: &Function, table: &LegalityTable, store: &mut ValueInfoStore) -> Result<(), LegalizeError> {
    for &p in &func.params {
        store.get_or_create(func, table, p)?;
    }
    for inst in func.live_insts() {
        if store.is_superseded(inst) {
            continue;
        }
        let data = func.inst(inst);
        for &a in &data.args {
            let split = store.get_or_create(func, table, a)?.is_some_and(|info| info.is_split());
            if split {
                return Err(LegalizeError::unhandled(func, inst));
            }
        }

        let tracked_result = match data.result {
            Some(r) if store.get_or_create(func, table, r)?.is_some() => Some(r),
            _ => None,
        };
        if let Some(r) = tracked_result {
            if store.get(r).is_some_and(|info| info.is_split()) {
                return Err(LegalizeError::unhandled(func, inst));
            }
            if forces_promotion_at_def(func, table, inst)? {
                if let Some(info) = store.get_mut(r) {
                    info.need_promote_at_def = true;
                }
                for &a in &data.args {
                    if let Some(info) = store.get_mut(a) {
                        info.promoted_uses += 1;
                    }
                }
            }
            continue;
        }

        let slots = forcing_operands(func, table, inst)?;
        let mut forced = false;
        for k in slots {
            if let Some(info) = store.get_mut(data.args[k]) {
                info.promoted_uses += 1;
                forced = true;
            }
        }
        if forced {
            store.add_consumer(inst);
        }
    }
    Ok(())
}

fn majority(func: &Function, store: &mut ValueInfoStore) {
    let uses = func.use_counts(|inst| !store.is_superseded(inst));
    for v in store.values() {
        let total = uses.get(&v).copied().unwrap_or(0) as u32;
        let Some(info) = store.get_mut(v) else { continue };
        if info.is_split() || info.need_promote_at_def {
            continue;
        }
        if info.promoted_uses > 0 && 2 * info.promoted_uses > total {
            info.need_promote_at_def = true;
        }
    }
}

enum Edge {
    /// Both ends already agree on promotion at definition.
    Settled,
    /// Decisions were changed to agree.
    Forced,
    Pending,
}

fn chain(func: &Function, store: &mut ValueInfoStore) -> Result<usize, LegalizeError> {
    let mut work: Vec<Inst> = func
        .live_insts()
        .into_iter()
        .filter(|&i| !store.is_superseded(i))
        .filter(|&i| matches!(func.inst(i).op, Opcode::ExtractElement | Opcode::InsertElement))
        .filter(|&i| {
            let data = func.inst(i);
            let res = data.result.is_some_and(|r| store.is_tracked(r));
            res && store.is_tracked(data.args[0])
        })
        .collect();

    let mut iterations = 0;
    loop {
        iterations += 1;
        let before = work.len();
        let mut changed = false;
        work.retain(|&i| match resolve(func, store, i) {
            Edge::Settled => false,
            Edge::Forced => {
                changed = true;
                false
            }
            Edge::Pending => true,
        });
        if !changed {
            break;
        }
        if work.len() >= before {
            return Err(LegalizeError::NonConvergent {
                function: func.name.clone(),
                remaining: work.len(),
            });
        }
    }
    Ok(iterations)
}

fn resolve(func: &Function, store: &mut ValueInfoStore, inst: Inst) -> Edge {
    let data = func.inst(inst);
    let (Some(res), vec) = (data.result, data.args[0]) else {
        return Edge::Settled;
    };
    let res_def = store.is_at_def(res);
    let vec_def = store.is_at_def(vec);
    let mut force = |v: Value| {
        if let Some(info) = store.get_mut(v) {
            info.need_promote_at_def = true;
        }
    };
    match (res_def, vec_def) {
        (true, true) => Edge::Settled,
        (false, false) => Edge::Pending,
        _ => {
            force(res);
            force(vec);
            Edge::Forced
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::parser::parse_str;

    fn decide_on(src: &str) -> (Function, ValueInfoStore, DecideSummary) {
        let module = parse_str("t.ir", src).unwrap();
        let func = module.functions.into_iter().next().unwrap();
        let table = LegalityTable::new(PlatformConfig::default()).unwrap();
        let mut store = ValueInfoStore::new();
        let summary = decide(&func, &table, &mut store).unwrap();
        (func, store, summary)
    }

    fn value(func: &Function, name: &str) -> Value {
        (0..func.value_count() as u32)
            .map(Value)
            .find(|&v| func.value_name(v) == Some(name))
            .unwrap()
    }

    #[test]
    fn test_seed_promotes_alu_results() {
        let (f, store, _) = decide_on(
            "fn @f(i8 %a, i8 %b) -> i8 {\nentry:\n  %s = add i8 %a, i8 %b\n  %t = mul i8 %s, i8 %s\n  ret i8 %t\n}\n",
        );
        assert_eq!(store.decision(value(&f, "s")), Decision::PromoteAtDef);
        assert_eq!(store.decision(value(&f, "t")), Decision::PromoteAtDef);
        assert_eq!(store.get(value(&f, "a")).unwrap().promoted_uses, 1);
        assert_eq!(store.get(value(&f, "s")).unwrap().promoted_uses, 2);
    }

    #[test]
    fn test_majority_rule() {
        let src = "fn @f(ptr %p) -> void {\nentry:\n  %l = load i8, ptr %p, align 1\n  %m = load i8, ptr %p, align 1\n  %x = add i8 %l, i8 1\n  %y = add i8 %l, i8 2\n  call void @use(i8 %l)\n  %z = add i8 %m, i8 1\n  call void @use(i8 %m)\n  call void @use(i8 %m)\n  ret void\n}\n";
        let (f, store, _) = decide_on(src);
        // Two promoted uses out of three.
        assert_eq!(store.decision(value(&f, "l")), Decision::PromoteAtDef);
        // One promoted use out of three.
        assert_eq!(store.decision(value(&f, "m")), Decision::PromoteAtUse);
    }

    #[test]
    fn test_exactly_half_stays_at_use() {
        let src = "fn @f(ptr %p) -> void {\nentry:\n  %l = load i8, ptr %p, align 1\n  %x = add i8 %l, i8 1\n  call void @use(i8 %l)\n  ret void\n}\n";
        let (f, store, _) = decide_on(src);
        assert_eq!(store.decision(value(&f, "l")), Decision::PromoteAtUse);
    }

    #[test]
    fn test_compare_counts_promoted_uses() {
        let src = "fn @f(i8 %a) -> i1 {\nentry:\n  %c = icmp ult i8 %a, i8 3\n  ret i1 %c\n}\n";
        let (f, store, _) = decide_on(src);
        assert_eq!(store.decision(value(&f, "a")), Decision::PromoteAtDef);
        assert_eq!(store.consumers().len(), 1);
    }

    #[test]
    fn test_chain_forces_both_ends() {
        let src = "fn @f(<4 x i8> %v, i8 %x, ptr %p) -> void {\nentry:\n  %w = insertelement <4 x i8> %v, i8 %x, i32 1\n  %e = extractelement <4 x i8> %w, i32 2\n  %s = add i8 %e, i8 1\n  %l = load <4 x i8>, ptr %p, align 4\n  %k = extractelement <4 x i8> %l, i32 0\n  call void @use(i8 %k)\n  ret void\n}\n";
        let (f, store, summary) = decide_on(src);
        // %e feeds an add only; majority promotes it, the chain drags %w and %v.
        for name in ["e", "w", "v"] {
            assert_eq!(store.decision(value(&f, name)), Decision::PromoteAtDef, "%{name}");
        }
        // The unrelated chain stays unpromoted.
        assert_eq!(store.decision(value(&f, "l")), Decision::PromoteAtUse);
        assert_eq!(store.decision(value(&f, "k")), Decision::PromoteAtUse);
        assert!(summary.chain_iterations >= 2);
    }

    #[test]
    fn test_dynamic_index_extract_is_seeded() {
        let src = "fn @f(<4 x i8> %v, i32 %i) -> void {\nentry:\n  %e = extractelement <4 x i8> %v, i32 %i\n  call void @use(i8 %e)\n  ret void\n}\n";
        let (f, store, _) = decide_on(src);
        assert_eq!(store.decision(value(&f, "e")), Decision::PromoteAtDef);
        assert_eq!(store.decision(value(&f, "v")), Decision::PromoteAtDef);
    }
}
