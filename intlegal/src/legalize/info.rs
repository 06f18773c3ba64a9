//! Value info store
//!
//! One record per illegal value, created the first time the value is seen
//! as a definition or an operand. Iteration follows first-observed order so
//! rewriting is deterministic.

use std::collections::{HashMap, HashSet};

use super::table::{LegalityTable, LegalizeAction};
use super::LegalizeError;
use crate::ir::{Function, Inst, Value};

/// How the bits above the original width of a promoted value are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtKind {
    Sign,
    Zero,
}

impl ExtKind {
    pub fn is_signed(self) -> bool {
        self == ExtKind::Sign
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    Single(Value),
    /// One value per part of a split, low bits first.
    Parts(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Legal type, constant, or never observed.
    Untracked,
    PromoteAtDef,
    PromoteAtUse,
    Split,
}

#[derive(Debug, Clone)]
pub struct ValueInfo {
    pub original: Value,
    pub action: LegalizeAction,
    pub replacement: Option<Replacement>,
    /// Set when the replacement is an exact sign or zero extension. A
    /// promoted value without it has correct low bits only.
    pub replacement_ext: Option<ExtKind>,
    pub need_promote_at_def: bool,
    pub promoted_uses: u32,
    pub dead: bool,
}

impl ValueInfo {
    pub fn is_split(&self) -> bool {
        matches!(self.action, LegalizeAction::Split(_))
    }

    pub fn single(&self) -> Option<Value> {
        match &self.replacement {
            Some(Replacement::Single(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn parts(&self) -> Option<&[Value]> {
        match &self.replacement {
            Some(Replacement::Parts(p)) => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ValueInfoStore {
    index: HashMap<Value, usize>,
    infos: Vec<ValueInfo>,
    /// Legal-result instructions whose illegal operands force a rewrite.
    consumers: Vec<Inst>,
    consumer_set: HashSet<Inst>,
    /// Instructions replaced wholesale; erased by the sweeper.
    superseded: Vec<Inst>,
    superseded_set: HashSet<Inst>,
}

impl ValueInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record for `v`, created on first sight. Constants and legal values
    /// are never tracked.
    pub fn get_or_create(
        &mut self,
        func: &Function,
        table: &LegalityTable,
        v: Value,
    ) -> Result<Option<&mut ValueInfo>, LegalizeError> {
        if let Some(&k) = self.index.get(&v) {
            return Ok(Some(&mut self.infos[k]));
        }
        if func.is_constant(v) {
            return Ok(None);
        }
        let action = table.classify(func.value_type(v))?;
        if action == LegalizeAction::Legal {
            return Ok(None);
        }
        let k = self.infos.len();
        self.infos.push(ValueInfo {
            original: v,
            action,
            replacement: None,
            replacement_ext: None,
            need_promote_at_def: false,
            promoted_uses: 0,
            dead: false,
        });
        self.index.insert(v, k);
        Ok(Some(&mut self.infos[k]))
    }

    pub fn get(&self, v: Value) -> Option<&ValueInfo> {
        self.index.get(&v).map(|&k| &self.infos[k])
    }

    pub fn get_mut(&mut self, v: Value) -> Option<&mut ValueInfo> {
        self.index.get(&v).map(|&k| &mut self.infos[k])
    }

    pub fn is_tracked(&self, v: Value) -> bool {
        self.index.contains_key(&v)
    }

    pub fn decision(&self, v: Value) -> Decision {
        match self.get(v) {
            None => Decision::Untracked,
            Some(info) if info.is_split() => Decision::Split,
            Some(info) if info.need_promote_at_def => Decision::PromoteAtDef,
            Some(_) => Decision::PromoteAtUse,
        }
    }

    pub fn is_at_def(&self, v: Value) -> bool {
        self.decision(v) == Decision::PromoteAtDef
    }

    /// Records in first-observed order.
    pub fn iter(&self) -> impl Iterator<Item = &ValueInfo> {
        self.infos.iter()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Values in first-observed order.
    pub fn values(&self) -> Vec<Value> {
        self.infos.iter().map(|i| i.original).collect()
    }

    /// Set the replacement of `v`. The first write wins; later writes are
    /// ignored and reported as `false`.
    pub fn set_replacement(&mut self, v: Value, replacement: Replacement, ext: Option<ExtKind>) -> bool {
        let Some(info) = self.get_mut(v) else { return false };
        debug_assert!(info.replacement.is_none(), "replacement of %{} written twice", v.index());
        if info.replacement.is_some() {
            return false;
        }
        info.replacement = Some(replacement);
        info.replacement_ext = ext;
        true
    }

    pub fn mark_dead(&mut self, v: Value) {
        if let Some(info) = self.get_mut(v) {
            info.dead = true;
        }
    }

    pub fn add_consumer(&mut self, inst: Inst) {
        if self.consumer_set.insert(inst) {
            self.consumers.push(inst);
        }
    }

    pub fn consumers(&self) -> &[Inst] {
        &self.consumers
    }

    pub fn supersede(&mut self, inst: Inst) {
        if self.superseded_set.insert(inst) {
            self.superseded.push(inst);
        }
    }

    pub fn is_superseded(&self, inst: Inst) -> bool {
        self.superseded_set.contains(&inst)
    }

    pub fn superseded(&self) -> &[Inst] {
        &self.superseded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::ir::{InsertPoint, Opcode, Type};

    fn setup() -> (Function, LegalityTable) {
        let mut f = Function::new("f", Type::Void);
        f.add_param(Type::Int(8), "a");
        f.add_param(Type::I32, "b");
        f.add_param(Type::Int(24), "c");
        let entry = f.add_block("entry");
        f.insert_inst(InsertPoint::End(entry), Opcode::Ret, vec![], Type::Void, "");
        let table = LegalityTable::new(PlatformConfig::default()).unwrap();
        (f, table)
    }

    #[test]
    fn test_only_illegal_values_are_tracked() {
        let (mut f, table) = setup();
        let (a, b) = (f.params[0], f.params[1]);
        let k = f.const_int(Type::Int(8), 7);
        let mut store = ValueInfoStore::new();
        assert!(store.get_or_create(&f, &table, a).unwrap().is_some());
        assert!(store.get_or_create(&f, &table, b).unwrap().is_none());
        assert!(store.get_or_create(&f, &table, k).unwrap().is_none());
        assert_eq!(store.len(), 1);
        assert_eq!(store.decision(a), Decision::PromoteAtUse);
        assert_eq!(store.decision(b), Decision::Untracked);
    }

    #[test]
    fn test_iteration_follows_first_observation() {
        let (f, table) = setup();
        let (a, c) = (f.params[0], f.params[2]);
        let mut store = ValueInfoStore::new();
        store.get_or_create(&f, &table, c).unwrap();
        store.get_or_create(&f, &table, a).unwrap();
        store.get_or_create(&f, &table, c).unwrap();
        assert_eq!(store.values(), vec![c, a]);
    }

    #[test]
    fn test_get_or_create_returns_same_record() {
        let (f, table) = setup();
        let a = f.params[0];
        let mut store = ValueInfoStore::new();
        if let Some(info) = store.get_or_create(&f, &table, a).unwrap() {
            info.promoted_uses += 2;
        }
        let info = store.get_or_create(&f, &table, a).unwrap().unwrap();
        assert_eq!(info.promoted_uses, 2);
        assert_eq!(info.action, LegalizeAction::Promote(Type::Int(16)));
    }

    #[test]
    fn test_consumers_and_superseded_are_deduplicated() {
        let (f, _) = setup();
        let ret = f.block_insts(f.entry().unwrap())[0];
        let mut store = ValueInfoStore::new();
        store.add_consumer(ret);
        store.add_consumer(ret);
        store.supersede(ret);
        store.supersede(ret);
        assert_eq!(store.consumers(), &[ret]);
        assert_eq!(store.superseded(), &[ret]);
        assert!(store.is_superseded(ret));
    }
}
