//! Dead value sweeper

use log::debug;

use super::info::ValueInfoStore;
use crate::ir::Function;

/// Erase every original made dead by rewriting, then every superseded
/// instruction. Remaining uses of a dead value become `undef` first, so
/// erasure order never leaves a dangling operand. Returns the number of
/// instructions erased.
pub fn sweep(func: &mut Function, store: &ValueInfoStore) -> usize {
    let mut erased = 0;
    for info in store.iter().filter(|info| info.dead) {
        let v = info.original;
        let undef = func.undef(func.value_type(v));
        func.replace_all_uses(v, undef);
        if func.is_arg(v) {
            continue;
        }
        if let Some(def) = func.defining_inst(v) {
            if !func.is_erased(def) {
                func.erase_inst(def);
                erased += 1;
            }
        }
    }
    for &inst in store.superseded() {
        if !func.is_erased(inst) {
            func.erase_inst(inst);
            erased += 1;
        }
    }
    if erased > 0 {
        debug!("@{}: swept {erased} instruction(s)", func.name);
    }
    erased
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::ir::verify::verify_function;
    use crate::ir::Value;
    use crate::legalize::table::LegalityTable;
    use crate::parser::parse_str;

    #[test]
    fn test_sweep_dead_chain() {
        let src = "fn @f(i8 %a) -> void {\nentry:\n  %x = add i8 %a, i8 1\n  %y = mul i8 %x, i8 %x\n  call void @use(i8 %y)\n  ret void\n}\n";
        let mut f = parse_str("t.ir", src).unwrap().functions.remove(0);
        let table = LegalityTable::new(PlatformConfig::default()).unwrap();
        let mut store = ValueInfoStore::new();
        let named = |f: &Function, name: &str| {
            (0..f.value_count() as u32).map(Value).find(|&v| f.value_name(v) == Some(name)).unwrap()
        };
        let (x, y) = (named(&f, "x"), named(&f, "y"));
        let call = f.live_insts()[2];
        for v in [x, y] {
            store.get_or_create(&f, &table, v).unwrap();
            store.mark_dead(v);
        }
        store.supersede(call);

        // The add is erased before the mul that reads it.
        assert_eq!(sweep(&mut f, &store), 3);
        assert_eq!(f.live_inst_count(), 1);
        assert_eq!(verify_function(&f), Ok(()));
        assert_eq!(sweep(&mut f, &store), 0);
    }
}
