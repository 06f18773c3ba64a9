//! Integer type legalization
//!
//! Rewrites every function so that arithmetic, compares, lane indices and
//! memory accesses only use integer widths the platform supports. A
//! function goes through five phases:
//!
//! 1. subgroup intrinsics on illegal scalars are re-issued wide;
//! 2. values wider than any ALU width are split into parts;
//! 3. each remaining illegal value is promoted at its definition or at its
//!    uses (`decide`);
//! 4. instructions are rewritten according to those decisions (`rewrite`);
//! 5. superseded originals are erased (`sweep`).

pub mod check;
pub mod decide;
pub mod dump;
pub mod info;
pub mod lanes;
pub mod memory;
pub mod rewrite;
pub mod split;
pub mod subgroup;
pub mod sweep;
pub mod table;

use log::debug;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;

use crate::ir::display::inst_to_string;
use crate::ir::{Function, Inst, Module};
pub use info::{Decision, ExtKind, ValueInfoStore};
pub use table::{LegalityTable, LegalizeAction};

/// A broken compiler invariant. The function that raised it is left in an
/// unspecified state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LegalizeError {
    #[error("@{function}: no legalization rule for `{inst}`")]
    UnhandledOpcode { function: String, inst: String },

    #[error("i{width} cannot be decomposed into supported widths")]
    UnsplittableWidth { width: u32 },

    #[error("@{function}: constant {value} must be canonicalized before it can be split")]
    NonCanonicalConstant { function: String, value: String },

    #[error("vector element type of {ty} is not covered by the platform table")]
    UncoveredVectorElement { ty: String },

    #[error("@{function}: no progress with {remaining} item(s) left")]
    NonConvergent { function: String, remaining: usize },

    #[error("@{function}: {message}")]
    MalformedInstruction { function: String, message: String },

    #[error("@{function}: argument {value} has a type that must be split")]
    SplitArgument { function: String, value: String },
}

impl LegalizeError {
    pub fn unhandled(func: &Function, inst: Inst) -> Self {
        LegalizeError::UnhandledOpcode {
            function: func.name.clone(),
            inst: inst_to_string(func, inst),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics from legalizing one or more functions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LegalizeStats {
    pub functions: usize,
    pub tracked_values: usize,
    pub promoted_at_def: usize,
    pub promoted_at_use: usize,
    pub split_values: usize,
    pub subgroup_ops: usize,
    /// Instructions added to the function, including ones later erased.
    pub insts_created: usize,
    pub insts_erased: usize,
    pub chain_iterations: usize,
    pub operands_rewritten: usize,
    /// Functions that were modified.
    pub changed: usize,
}

impl LegalizeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: &LegalizeStats) {
        self.functions += other.functions;
        self.tracked_values += other.tracked_values;
        self.promoted_at_def += other.promoted_at_def;
        self.promoted_at_use += other.promoted_at_use;
        self.split_values += other.split_values;
        self.subgroup_ops += other.subgroup_ops;
        self.insts_created += other.insts_created;
        self.insts_erased += other.insts_erased;
        self.chain_iterations += other.chain_iterations;
        self.operands_rewritten += other.operands_rewritten;
        self.changed += other.changed;
    }
}

// ============================================================================
// Pass driver
// ============================================================================

/// A transformation run on one function at a time.
pub trait FunctionPass: Sync {
    fn name(&self) -> &'static str;

    fn run_on_function(&self, func: &mut Function) -> Result<LegalizeStats, LegalizeError>;
}

/// The legalization pass. Holds only the shared table; every run owns its
/// own value info store.
pub struct IntegerLegalizer<'t> {
    table: &'t LegalityTable,
}

impl<'t> IntegerLegalizer<'t> {
    pub fn new(table: &'t LegalityTable) -> Self {
        Self { table }
    }
}

impl FunctionPass for IntegerLegalizer<'_> {
    fn name(&self) -> &'static str {
        "integer-legalization"
    }

    fn run_on_function(&self, func: &mut Function) -> Result<LegalizeStats, LegalizeError> {
        let arena_before = func.inst_arena_len();
        let mut store = ValueInfoStore::new();

        let subgroup_ops = subgroup::promote_subgroup_ops(func, self.table)?;
        let split_values = split::split_values(func, self.table, &mut store)?;
        let decided = decide::decide(func, self.table, &mut store)?;
        let rewritten = rewrite::rewrite(func, self.table, &mut store)?;
        let swept = sweep::sweep(func, &store);

        let insts_created = func.inst_arena_len() - arena_before;
        let insts_erased = swept + subgroup_ops;
        let stats = LegalizeStats {
            functions: 1,
            tracked_values: decided.tracked,
            promoted_at_def: decided.at_def,
            promoted_at_use: decided.at_use,
            split_values,
            subgroup_ops,
            insts_created,
            insts_erased,
            chain_iterations: decided.chain_iterations,
            operands_rewritten: rewritten.operands_rewritten,
            changed: usize::from(insts_created > 0 || insts_erased > 0 || rewritten.operands_rewritten > 0),
        };
        debug!("@{}: {stats:?}", func.name);
        Ok(stats)
    }
}

/// Legalize every function of `module`. With `parallel`, functions run on
/// the rayon pool; either way the first error in function order is
/// returned.
pub fn legalize_module(module: &mut Module, table: &LegalityTable, parallel: bool) -> Result<LegalizeStats, LegalizeError> {
    let pass = IntegerLegalizer::new(table);
    let results: Vec<Result<LegalizeStats, LegalizeError>> = if parallel {
        module.functions.par_iter_mut().map(|f| pass.run_on_function(f)).collect()
    } else {
        let mut results = Vec::with_capacity(module.functions.len());
        for f in &mut module.functions {
            let result = pass.run_on_function(f);
            let failed = result.is_err();
            results.push(result);
            if failed {
                break;
            }
        }
        results
    };

    let mut stats = LegalizeStats::new();
    for result in results {
        stats.merge(&result?);
    }
    debug!("{}: {} function(s), {} changed", pass.name(), stats.functions, stats.changed);
    Ok(stats)
}

/// Run the phases up to the decision engine on a copy of `func` and render
/// the decisions.
pub fn analyze(func: &Function, table: &LegalityTable) -> Result<String, LegalizeError> {
    let mut func = func.clone();
    let mut store = ValueInfoStore::new();
    subgroup::promote_subgroup_ops(&mut func, table)?;
    split::split_values(&mut func, table, &mut store)?;
    decide::decide(&func, table, &mut store)?;
    dump::render(&func, table, &store)
}
