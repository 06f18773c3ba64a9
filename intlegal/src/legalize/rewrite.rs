//! Instruction rewrite visitor
//!
//! Runs once the decisions are final. Every value promoted at its
//! definition gets a wide replacement built next to the original; values
//! promoted at use are extended lazily, once per dominating use point.
//! Consumers that keep a narrow type get the narrow value back through a
//! truncation placed right before them.
//!
//! A wide value always has the original bits in its low part. Whether the
//! bits above are a sign or zero extension is recorded in
//! `ValueInfo::replacement_ext`; operations whose result depends on those
//! bits (division, right shifts, compares) re-extend when it is unknown.

use std::collections::HashMap;

use log::trace;

use super::info::{Decision, ExtKind, Replacement, ValueInfoStore};
use super::lanes;
use super::memory;
use super::table::{LegalityTable, LegalizeAction};
use super::LegalizeError;
use crate::ir::display::{inst_to_string, value_ref};
use crate::ir::dom::{DomTree, Dominance};
use crate::ir::{
    mask, sign_extend, BinaryOp, Builder, CastOp, Constant, Elem, Function, InsertPoint, Inst, IntPredicate, Opcode,
    Type, Value,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    /// Definitions given a wide replacement.
    pub rewritten_defs: usize,
    /// Operand slots retargeted in place.
    pub operands_rewritten: usize,
}

/// Rewrite `func` according to the decisions in `store`.
pub fn rewrite(
    func: &mut Function,
    table: &LegalityTable,
    store: &mut ValueInfoStore,
) -> Result<RewriteSummary, LegalizeError> {
    let dom = DomTree::compute(func);
    let mut rewriter = Rewriter {
        func,
        table,
        store,
        dom,
        narrow_memo: HashMap::new(),
        clean_memo: HashMap::new(),
        use_ext_memo: HashMap::new(),
        summary: RewriteSummary::default(),
    };
    rewriter.run()?;
    Ok(rewriter.summary)
}

#[derive(Debug, Clone, Copy)]
enum LaneIndex {
    Const(u32),
    /// Zero-extended to a legal width.
    Dynamic(Value),
}

struct Rewriter<'a> {
    func: &'a mut Function,
    table: &'a LegalityTable,
    store: &'a mut ValueInfoStore,
    dom: DomTree,
    narrow_memo: HashMap<(InsertPoint, Value), Value>,
    clean_memo: HashMap<(InsertPoint, Value, ExtKind), Value>,
    /// Use-site extensions of values promoted at use, with their defining
    /// instruction so later uses can check dominance.
    use_ext_memo: HashMap<(Value, ExtKind), Vec<(Inst, Value)>>,
    summary: RewriteSummary,
}

impl Rewriter<'_> {
    fn run(&mut self) -> Result<(), LegalizeError> {
        let originals: Vec<Inst> = self
            .func
            .live_insts()
            .into_iter()
            .filter(|&i| !self.store.is_superseded(i))
            .collect();

        self.promote_params()?;
        let phis = self.open_phis(&originals)?;

        let mut pending: Vec<Inst> = originals
            .iter()
            .copied()
            .filter(|&i| {
                let data = self.func.inst(i);
                !data.op.is_phi() && data.result.is_some_and(|r| self.store.is_at_def(r))
            })
            .collect();
        while !pending.is_empty() {
            let before = pending.len();
            let mut blocked = Vec::new();
            for i in pending {
                if self.ready(i) {
                    self.rewrite_def(i)?;
                } else {
                    blocked.push(i);
                }
            }
            if blocked.len() == before {
                return Err(LegalizeError::NonConvergent {
                    function: self.func.name.clone(),
                    remaining: blocked.len(),
                });
            }
            pending = blocked;
        }

        self.close_phis(&phis)?;
        for &i in &originals {
            self.rewrite_consumer(i)?;
        }
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn promoted(&self, ty: Type) -> Result<Type, LegalizeError> {
        match self.table.classify(ty)? {
            LegalizeAction::Legal => Ok(ty),
            LegalizeAction::Promote(wide) => Ok(wide),
            LegalizeAction::Split(_) => Err(LegalizeError::MalformedInstruction {
                function: self.func.name.clone(),
                message: format!("{ty} reached promotion but is split"),
            }),
        }
    }

    fn derived_name(&self, v: Value, suffix: &str) -> String {
        format!("{}.{suffix}", self.func.value_name(v).unwrap_or("v"))
    }

    fn missing(&self, v: Value) -> LegalizeError {
        LegalizeError::MalformedInstruction {
            function: self.func.name.clone(),
            message: format!("{} has no promoted replacement", value_ref(self.func, v)),
        }
    }

    fn is_dead(&self, v: Value) -> bool {
        self.store.get(v).is_some_and(|info| info.dead)
    }

    fn is_illegal(&self, v: Value) -> bool {
        !self.table.is_legal(self.func.value_type(v))
    }

    /// Is the value defined by `def` usable at `at`?
    fn available(&self, def: Inst, at: InsertPoint) -> bool {
        match at {
            InsertPoint::Before(user) => def != user && self.dom.dominates(self.func, def, user),
            InsertPoint::End(block) => self.dom.block_dominates(self.func.inst(def).block, block),
        }
    }

    /// Extend the narrow value `x` to its promoted type at `at`.
    fn extend(
        &mut self,
        x: Value,
        kind: ExtKind,
        at: InsertPoint,
        name: &str,
    ) -> Result<(Value, Option<ExtKind>), LegalizeError> {
        let ty = self.func.value_type(x);
        let wide_ty = self.promoted(ty)?;
        let mut b = Builder::new(self.func, at);
        Ok(if ty.is_vector() && !wide_ty.is_vector() {
            (lanes::pack(&mut b, x, wide_ty, name), None)
        } else if ty.is_vector() {
            (lanes::widen(&mut b, x, wide_ty, kind, name), Some(kind))
        } else {
            (b.resize(x, wide_ty, kind.is_signed(), name), Some(kind))
        })
    }

    fn ext_name(&self, v: Value, kind: ExtKind) -> String {
        self.derived_name(v, if kind.is_signed() { "sext" } else { "zext" })
    }

    /// Promoted copy of an illegal constant.
    fn extend_constant(&mut self, v: Value, kind: ExtKind) -> Result<Value, LegalizeError> {
        let ty = self.func.value_type(v);
        let wide_ty = self.promoted(ty)?;
        let width = ty.int_elem_width().unwrap_or(0);
        let ext = |bits: u128| if kind.is_signed() { sign_extend(bits, width) as u128 } else { bits };
        match self.func.constant(v).cloned() {
            Some(Constant::Int(bits)) => Ok(self.func.const_int(wide_ty, ext(bits))),
            Some(Constant::Vector(elems)) if wide_ty.is_vector() => {
                Ok(self.func.const_vector(wide_ty, elems.into_iter().map(ext).collect()))
            }
            Some(Constant::Vector(elems)) => Ok(self.func.const_int(wide_ty, lanes::pack_constant(&elems, width))),
            Some(Constant::Zero) => Ok(self.func.zero(wide_ty)),
            Some(Constant::Undef) => Ok(self.func.undef(wide_ty)),
            Some(Constant::Expr(_)) | None => Err(LegalizeError::NonCanonicalConstant {
                function: self.func.name.clone(),
                value: value_ref(self.func, v),
            }),
        }
    }

    /// Promoted form of `v` with correct low bits, usable at `at`.
    fn wide_any(&mut self, v: Value, hint: ExtKind, at: InsertPoint) -> Result<Value, LegalizeError> {
        if self.func.is_constant(v) {
            return if self.is_illegal(v) { self.extend_constant(v, hint) } else { Ok(v) };
        }
        let Some(info) = self.store.get(v) else { return Ok(v) };
        if let Some(wide) = info.single() {
            return Ok(wide);
        }
        if info.need_promote_at_def {
            return Err(self.missing(v));
        }
        self.extend_at_use(v, hint, at)
    }

    /// Promoted form of `v` whose high bits are an exact `kind` extension.
    fn clean(&mut self, v: Value, kind: ExtKind, at: InsertPoint) -> Result<Value, LegalizeError> {
        if self.func.is_constant(v) {
            return if self.is_illegal(v) { self.extend_constant(v, kind) } else { Ok(v) };
        }
        let (single, ext, at_def) = match self.store.get(v) {
            Some(info) => (info.single(), info.replacement_ext, info.need_promote_at_def),
            None => return Ok(v),
        };
        match (single, ext) {
            (Some(wide), Some(ext)) if ext == kind => Ok(wide),
            (Some(_), _) => {
                if let Some(&done) = self.clean_memo.get(&(at, v, kind)) {
                    return Ok(done);
                }
                let narrow = self.narrow(v, at)?;
                let name = self.ext_name(v, kind);
                let (wide, _) = self.extend(narrow, kind, at, &name)?;
                self.clean_memo.insert((at, v, kind), wide);
                Ok(wide)
            }
            (None, _) if at_def => Err(self.missing(v)),
            (None, _) => self.extend_at_use(v, kind, at),
        }
    }

    fn extend_at_use(&mut self, v: Value, kind: ExtKind, at: InsertPoint) -> Result<Value, LegalizeError> {
        let reuse = self
            .use_ext_memo
            .get(&(v, kind))
            .and_then(|seen| seen.iter().find(|&&(def, _)| self.available(def, at)))
            .map(|&(_, wide)| wide);
        if let Some(wide) = reuse {
            return Ok(wide);
        }
        let name = self.ext_name(v, kind);
        let (wide, _) = self.extend(v, kind, at, &name)?;
        if let Some(def) = self.func.defining_inst(wide) {
            self.use_ext_memo.entry((v, kind)).or_default().push((def, wide));
        }
        trace!("@{}: extended {} at use", self.func.name, value_ref(self.func, v));
        Ok(wide)
    }

    /// The original-width value of `v` at `at`. Only values whose original
    /// definition is going away need a new truncation.
    fn narrow(&mut self, v: Value, at: InsertPoint) -> Result<Value, LegalizeError> {
        let Some(info) = self.store.get(v) else { return Ok(v) };
        if !info.dead {
            return Ok(v);
        }
        let Some(wide) = info.single() else { return Err(self.missing(v)) };
        if let Some(&n) = self.narrow_memo.get(&(at, v)) {
            return Ok(n);
        }
        let ty = self.func.value_type(v);
        let name = self.derived_name(v, "trunc");
        let mut b = Builder::new(self.func, at);
        let n = match (ty.is_vector(), b.value_type(wide).is_vector()) {
            (true, false) => lanes::unpack(&mut b, wide, ty, &name),
            (true, true) => lanes::narrow(&mut b, wide, ty, &name),
            _ => b.resize(wide, ty, false, &name),
        };
        self.narrow_memo.insert((at, v), n);
        Ok(n)
    }

    fn lane_index(&mut self, index: Value, at: InsertPoint) -> Result<LaneIndex, LegalizeError> {
        match self.func.const_int_value(index) {
            Some(k) => Ok(LaneIndex::Const(k as u32)),
            None => Ok(LaneIndex::Dynamic(self.clean(index, ExtKind::Zero, at)?)),
        }
    }

    fn replace_operand(&mut self, i: Inst, k: usize, kind: ExtKind, at: InsertPoint) -> Result<(), LegalizeError> {
        let v = self.func.args(i)[k];
        let clean = self.clean(v, kind, at)?;
        if clean != v {
            self.func.set_arg(i, k, clean);
            self.summary.operands_rewritten += 1;
        }
        Ok(())
    }

    fn ready(&self, i: Inst) -> bool {
        self.func.args(i).iter().all(|&a| {
            !self.store.is_at_def(a) || self.store.get(a).is_some_and(|info| info.replacement.is_some())
        })
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Arguments keep their narrow type; the wide copy is built at the top
    /// of the entry block.
    fn promote_params(&mut self) -> Result<(), LegalizeError> {
        let Some(entry) = self.func.entry() else { return Ok(()) };
        for p in self.func.params.clone() {
            if !self.store.is_at_def(p) {
                continue;
            }
            let at = InsertPoint::block_start(self.func, entry);
            let name = self.ext_name(p, ExtKind::Sign);
            let (wide, ext) = self.extend(p, ExtKind::Sign, at, &name)?;
            self.store.set_replacement(p, Replacement::Single(wide), ext);
            self.summary.rewritten_defs += 1;
        }
        Ok(())
    }

    /// Create an empty wide PHI for every PHI promoted at its definition, so
    /// loop-carried operands can refer to it before it is filled.
    fn open_phis(&mut self, originals: &[Inst]) -> Result<Vec<(Inst, Inst)>, LegalizeError> {
        let mut opened = Vec::new();
        for &i in originals {
            let data = self.func.inst(i);
            let (true, Some(r)) = (data.op.is_phi(), data.result) else { continue };
            if !self.store.is_at_def(r) {
                continue;
            }
            let wide_ty = self.promoted(self.func.value_type(r))?;
            let name = self.derived_name(r, "wide");
            let phi = Builder::new(self.func, InsertPoint::Before(i)).phi(wide_ty, &name);
            let Some(wide) = self.func.result(phi) else { continue };
            self.store.set_replacement(r, Replacement::Single(wide), None);
            self.store.mark_dead(r);
            self.summary.rewritten_defs += 1;
            opened.push((i, phi));
        }
        Ok(opened)
    }

    fn close_phis(&mut self, phis: &[(Inst, Inst)]) -> Result<(), LegalizeError> {
        for &(orig, wide) in phis {
            let Opcode::Phi(blocks) = self.func.inst(orig).op.clone() else { continue };
            let incoming = self.func.args(orig).to_vec();
            for (v, from) in incoming.into_iter().zip(blocks) {
                let at = InsertPoint::before_terminator(self.func, from);
                let w = self.wide_any(v, ExtKind::Sign, at)?;
                self.func.add_phi_incoming(wide, w, from);
            }
            trace!("@{}: {}", self.func.name, inst_to_string(self.func, wide));
        }
        Ok(())
    }

    fn rewrite_def(&mut self, i: Inst) -> Result<(), LegalizeError> {
        let data = self.func.inst(i).clone();
        let Some(r) = data.result else { return Ok(()) };
        let ty = self.func.value_type(r);
        let wide_ty = self.promoted(ty)?;
        let packed = ty.is_vector() && !wide_ty.is_vector();
        let at = InsertPoint::Before(i);
        let name = self.derived_name(r, "wide");
        let args = &data.args;

        let rebuilt = match &data.op {
            Opcode::Binary(op) => Some(self.rewrite_binary(i, *op, args, packed, at, &name)?),
            Opcode::Select if packed && self.func.value_type(args[0]).is_vector() => {
                Some(self.rewrite_packed_select(ty, args, at, &name)?)
            }
            Opcode::Select => {
                let t = self.wide_any(args[1], ExtKind::Sign, at)?;
                let f = self.wide_any(args[2], ExtKind::Sign, at)?;
                Some((Builder::new(self.func, at).select(args[0], t, f, &name), None))
            }
            Opcode::Freeze => {
                let x = self.wide_any(args[0], ExtKind::Sign, at)?;
                Some((Builder::new(self.func, at).freeze(x, &name), None))
            }
            Opcode::ExtractElement => self.rewrite_extract(i, r, args, at, &name)?,
            Opcode::InsertElement => Some(self.rewrite_insert(args, wide_ty, at, &name)?),
            Opcode::Load(attrs) => match self.table.memory_chunks(ty)? {
                Some(chunks) => {
                    let mut b = Builder::new(self.func, at);
                    let wide = memory::split_load(&mut b, args[0], *attrs, &chunks, wide_ty, &name);
                    Some((wide, Some(ExtKind::Zero)))
                }
                None => None,
            },
            Opcode::Cast(op) if !packed => self.rewrite_cast(*op, args[0], ty, wide_ty, at, &name)?,
            Opcode::Cast(_) | Opcode::Call(_) | Opcode::ShuffleVector(_) => None,
            Opcode::Subgroup(op) if op.is_lane_move() => None,
            _ => return Err(LegalizeError::unhandled(self.func, i)),
        };

        match rebuilt {
            Some((wide, ext)) => {
                self.store.set_replacement(r, Replacement::Single(wide), ext);
                self.store.mark_dead(r);
                trace!("@{}: {} -> {}", self.func.name, inst_to_string(self.func, i), value_ref(self.func, wide));
            }
            None => {
                // The original stays; its wide copy is built right after it.
                let after = InsertPoint::after(self.func, i);
                let name = self.ext_name(r, ExtKind::Sign);
                let (wide, ext) = self.extend(r, ExtKind::Sign, after, &name)?;
                self.store.set_replacement(r, Replacement::Single(wide), ext);
                trace!("@{}: {} extended after its definition", self.func.name, value_ref(self.func, r));
            }
        }
        self.summary.rewritten_defs += 1;
        Ok(())
    }

    fn rewrite_binary(
        &mut self,
        i: Inst,
        op: BinaryOp,
        args: &[Value],
        packed: bool,
        at: InsertPoint,
        name: &str,
    ) -> Result<(Value, Option<ExtKind>), LegalizeError> {
        if packed && !op.is_bitwise() {
            return self.rewrite_packed_binary(i, op, args, at, name);
        }
        let (a, b) = (args[0], args[1]);
        let (lhs, rhs, ext) = match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                (self.wide_any(a, ExtKind::Sign, at)?, self.wide_any(b, ExtKind::Sign, at)?, None)
            }
            BinaryOp::SDiv | BinaryOp::SRem => {
                (self.clean(a, ExtKind::Sign, at)?, self.clean(b, ExtKind::Sign, at)?, None)
            }
            BinaryOp::UDiv | BinaryOp::URem => (
                self.clean(a, ExtKind::Zero, at)?,
                self.clean(b, ExtKind::Zero, at)?,
                Some(ExtKind::Zero),
            ),
            BinaryOp::Shl => (self.wide_any(a, ExtKind::Sign, at)?, self.clean(b, ExtKind::Zero, at)?, None),
            BinaryOp::LShr => (
                self.clean(a, ExtKind::Zero, at)?,
                self.clean(b, ExtKind::Zero, at)?,
                Some(ExtKind::Zero),
            ),
            BinaryOp::AShr => (
                self.clean(a, ExtKind::Sign, at)?,
                self.clean(b, ExtKind::Zero, at)?,
                Some(ExtKind::Sign),
            ),
        };
        let wide = Builder::new(self.func, at).binary(op, lhs, rhs, name);
        Ok((wide, ext))
    }

    /// Lane type and width of a vector whose lanes are packed into one
    /// integer.
    fn packed_lanes(&self, vector_ty: Type) -> Result<(Type, u32), LegalizeError> {
        let elem_width = vector_ty.int_elem_width().unwrap_or(0);
        Ok((self.promoted(vector_ty.scalar())?, elem_width))
    }

    /// Packed operands have no lane-wise arithmetic: every lane is pulled
    /// out at its promoted width, combined, and put back.
    fn rewrite_packed_binary(
        &mut self,
        i: Inst,
        op: BinaryOp,
        args: &[Value],
        at: InsertPoint,
        name: &str,
    ) -> Result<(Value, Option<ExtKind>), LegalizeError> {
        let (lhs_kind, rhs_kind) = match op {
            BinaryOp::SDiv | BinaryOp::SRem => (ExtKind::Sign, ExtKind::Sign),
            BinaryOp::AShr => (ExtKind::Sign, ExtKind::Zero),
            _ => (ExtKind::Zero, ExtKind::Zero),
        };
        let vector_ty = self.func.value_type(args[0]);
        let (lane_ty, elem_width) = self.packed_lanes(vector_ty)?;
        let lhs = self.wide_any(args[0], ExtKind::Zero, at)?;
        let rhs = self.wide_any(args[1], ExtKind::Zero, at)?;
        let mut b = Builder::new(self.func, at);
        let packed_ty = b.value_type(lhs);
        let mut acc = None;
        for k in 0..vector_ty.lanes() {
            let x = lanes::extract_packed(&mut b, lhs, k, elem_width, lane_ty, lhs_kind, name);
            let y = lanes::extract_packed(&mut b, rhs, k, elem_width, lane_ty, rhs_kind, name);
            let z = b.binary(op, x, y, name);
            acc = Some(lanes::place_packed(&mut b, acc, z, k, elem_width, packed_ty, name));
        }
        match acc {
            Some(wide) => Ok((wide, None)),
            None => Err(LegalizeError::unhandled(self.func, i)),
        }
    }

    fn rewrite_packed_select(
        &mut self,
        ty: Type,
        args: &[Value],
        at: InsertPoint,
        name: &str,
    ) -> Result<(Value, Option<ExtKind>), LegalizeError> {
        let (lane_ty, elem_width) = self.packed_lanes(ty)?;
        let t = self.wide_any(args[1], ExtKind::Zero, at)?;
        let f = self.wide_any(args[2], ExtKind::Zero, at)?;
        let mut b = Builder::new(self.func, at);
        let packed_ty = b.value_type(t);
        let mut acc = None;
        for k in 0..ty.lanes() {
            let idx = b.const_int(Type::I32, k as u128);
            let c = b.extract_element(args[0], idx, name);
            let x = lanes::extract_packed(&mut b, t, k, elem_width, lane_ty, ExtKind::Zero, name);
            let y = lanes::extract_packed(&mut b, f, k, elem_width, lane_ty, ExtKind::Zero, name);
            let z = b.select(c, x, y, name);
            acc = Some(lanes::place_packed(&mut b, acc, z, k, elem_width, packed_ty, name));
        }
        Ok((acc.unwrap_or_else(|| b.func().zero(packed_ty)), None))
    }

    fn rewrite_extract(
        &mut self,
        i: Inst,
        r: Value,
        args: &[Value],
        at: InsertPoint,
        name: &str,
    ) -> Result<Option<(Value, Option<ExtKind>)>, LegalizeError> {
        let (vector, index) = (args[0], args[1]);

        // Narrow source: extract as before and extend the element after.
        if self.store.decision(vector) == Decision::PromoteAtUse {
            if !self.func.is_constant(index) && self.is_illegal(index) {
                self.replace_operand(i, 1, ExtKind::Zero, at)?;
            }
            return Ok(None);
        }

        let vector_ty = self.func.value_type(vector);
        let elem_width = vector_ty.int_elem_width().unwrap_or(0);
        let source = self.wide_any(vector, ExtKind::Sign, at)?;
        if self.func.value_type(source).is_vector() {
            let index = self.clean(index, ExtKind::Zero, at)?;
            let wide = Builder::new(self.func, at).extract_element(source, index, name);
            return Ok(Some((wide, None)));
        }

        // Packed lanes: shift the field down, then move its sign bit to the
        // top of the result and back.
        let wide_ty = self.promoted(self.func.value_type(r))?;
        let index = self.lane_index(index, at)?;
        let mut b = Builder::new(self.func, at);
        let packed_ty = b.value_type(source);
        let shifted = match index {
            LaneIndex::Const(0) => source,
            LaneIndex::Const(k) => {
                let amount = b.const_int(packed_ty, (k * elem_width) as u128);
                b.binary(BinaryOp::LShr, source, amount, name)
            }
            LaneIndex::Dynamic(k) => {
                let amount = bit_offset(&mut b, k, packed_ty, elem_width, name);
                b.binary(BinaryOp::LShr, source, amount, name)
            }
        };
        let field = b.resize(shifted, wide_ty, false, name);
        let spare = b.const_int(wide_ty, (wide_ty.bit_width() - elem_width) as u128);
        let high = b.binary(BinaryOp::Shl, field, spare, name);
        let wide = b.binary(BinaryOp::AShr, high, spare, name);
        Ok(Some((wide, Some(ExtKind::Sign))))
    }

    fn rewrite_insert(
        &mut self,
        args: &[Value],
        wide_ty: Type,
        at: InsertPoint,
        name: &str,
    ) -> Result<(Value, Option<ExtKind>), LegalizeError> {
        let (vector, element, index) = (args[0], args[1], args[2]);
        if wide_ty.is_vector() {
            let dest = self.wide_any(vector, ExtKind::Sign, at)?;
            let elem = self.wide_any(element, ExtKind::Sign, at)?;
            let index = self.clean(index, ExtKind::Zero, at)?;
            let wide = Builder::new(self.func, at).insert_element(dest, elem, index, name);
            return Ok((wide, None));
        }

        let elem_width = self.func.value_type(vector).int_elem_width().unwrap_or(0);
        let fresh = matches!(self.func.constant(vector), Some(Constant::Zero | Constant::Undef));
        let dest = if fresh { None } else { Some(self.wide_any(vector, ExtKind::Sign, at)?) };
        let elem = self.wide_any(element, ExtKind::Sign, at)?;
        let index = self.lane_index(index, at)?;

        let mut b = Builder::new(self.func, at);
        let elem = b.resize(elem, wide_ty, false, name);
        let lane_mask = b.const_int(wide_ty, mask(elem_width));
        let field = b.binary(BinaryOp::And, elem, lane_mask, name);
        let (shift, amount) = match index {
            LaneIndex::Const(k) => (k * elem_width, None),
            LaneIndex::Dynamic(k) => (0, Some(bit_offset(&mut b, k, wide_ty, elem_width, name))),
        };
        let placed = match amount {
            Some(amount) => b.binary(BinaryOp::Shl, field, amount, name),
            None if shift == 0 => field,
            None => {
                let amount = b.const_int(wide_ty, shift as u128);
                b.binary(BinaryOp::Shl, field, amount, name)
            }
        };
        let Some(dest) = dest else { return Ok((placed, None)) };
        let keep = match amount {
            Some(amount) => {
                let lane = b.binary(BinaryOp::Shl, lane_mask, amount, name);
                let ones = b.const_int(wide_ty, u128::MAX);
                b.binary(BinaryOp::Xor, lane, ones, name)
            }
            None => b.const_int(wide_ty, !(mask(elem_width) << shift)),
        };
        let cleared = b.binary(BinaryOp::And, dest, keep, name);
        Ok((b.binary(BinaryOp::Or, cleared, placed, name), None))
    }

    fn rewrite_cast(
        &mut self,
        op: CastOp,
        src: Value,
        ty: Type,
        wide_ty: Type,
        at: InsertPoint,
        name: &str,
    ) -> Result<Option<(Value, Option<ExtKind>)>, LegalizeError> {
        let src_ty = self.func.value_type(src);
        match op {
            CastOp::Trunc => {
                let source = self.wide_any(src, ExtKind::Sign, at)?;
                let width = ty.int_elem_width().unwrap_or(0);
                let mut b = Builder::new(self.func, at);
                let low = b.resize(source, wide_ty, false, name);
                let m = b.splat(wide_ty, mask(width));
                Ok(Some((b.binary(BinaryOp::And, low, m, name), Some(ExtKind::Zero))))
            }
            CastOp::ZExt | CastOp::SExt => {
                let kind = if op == CastOp::SExt { ExtKind::Sign } else { ExtKind::Zero };
                if src_ty.int_elem_width() == Some(1) {
                    let mut b = Builder::new(self.func, at);
                    let set = b.splat(wide_ty, if kind.is_signed() { u128::MAX } else { 1 });
                    let clear = b.splat(wide_ty, 0);
                    return Ok(Some((b.select(src, set, clear, name), Some(kind))));
                }
                let source = self.clean(src, kind, at)?;
                let wide = Builder::new(self.func, at).resize(source, wide_ty, kind.is_signed(), name);
                Ok(Some((wide, Some(kind))))
            }
            CastOp::Bitcast => {
                let (Type::Vector(Elem::Int(e), n), Type::Int(_)) = (src_ty, ty) else { return Ok(None) };
                let p = wide_ty.bit_width();
                if !self.table.is_legal(src_ty) || p % e != 0 {
                    return Ok(None);
                }
                // Pad with zero lanes up to the promoted width, then reinterpret.
                let lanes: Vec<u32> = (0..p / e).map(|k| k.min(n)).collect();
                let mut b = Builder::new(self.func, at);
                let zero = b.func().zero(src_ty);
                let spread = b.shuffle(src, zero, lanes, name);
                Ok(Some((b.cast(CastOp::Bitcast, spread, wide_ty, name), Some(ExtKind::Zero))))
            }
            _ => Ok(None),
        }
    }

    // ========================================================================
    // Consumers
    // ========================================================================

    fn rewrite_consumer(&mut self, i: Inst) -> Result<(), LegalizeError> {
        if self.store.is_superseded(i) || self.func.is_erased(i) {
            return Ok(());
        }
        let data = self.func.inst(i).clone();
        if data.result.is_some_and(|r| self.is_dead(r)) {
            return Ok(());
        }
        let at = InsertPoint::Before(i);
        match &data.op {
            Opcode::ICmp(pred) => {
                let ty = self.func.value_type(data.args[0]);
                if !self.table.is_legal(ty) {
                    if ty.is_vector() && !self.promoted(ty)?.is_vector() {
                        let Some(r) = data.result else { return Err(LegalizeError::unhandled(self.func, i)) };
                        let lanes = self.packed_compare(*pred, r, &data.args, at)?;
                        self.func.replace_all_uses(r, lanes);
                        self.store.supersede(i);
                        return Ok(());
                    }
                    let kind = compare_kind(*pred);
                    self.replace_operand(i, 0, kind, at)?;
                    self.replace_operand(i, 1, kind, at)?;
                }
            }
            Opcode::PtrAdd => {
                if self.is_illegal(data.args[1]) {
                    self.replace_operand(i, 1, ExtKind::Sign, at)?;
                }
            }
            Opcode::ExtractElement | Opcode::InsertElement => {
                let slot = data.args.len() - 1;
                let index = data.args[slot];
                if !self.func.is_constant(index) && self.is_illegal(index) {
                    self.replace_operand(i, slot, ExtKind::Zero, at)?;
                }
            }
            Opcode::Store(attrs) => {
                let value = data.args[0];
                if let Some(chunks) = self.table.memory_chunks(self.func.value_type(value))? {
                    let wide = self.wide_any(value, ExtKind::Sign, at)?;
                    let name = self.derived_name(value, "part");
                    let mut b = Builder::new(self.func, at);
                    memory::split_store(&mut b, wide, data.args[1], *attrs, &chunks, &name);
                    self.store.supersede(i);
                    trace!("@{}: split store of {}", self.func.name, value_ref(self.func, value));
                    return Ok(());
                }
            }
            Opcode::Load(attrs) => {
                if let Some(r) = data.result.filter(|&r| !self.store.is_tracked(r)) {
                    let ty = self.func.value_type(r);
                    if let Some(chunks) = self.table.memory_chunks(ty)? {
                        let name = self.derived_name(r, "part");
                        let mut b = Builder::new(self.func, at);
                        let whole = memory::split_load(&mut b, data.args[0], *attrs, &chunks, ty, &name);
                        self.func.replace_all_uses(r, whole);
                        self.store.supersede(i);
                        return Ok(());
                    }
                }
            }
            Opcode::Cast(op) => {
                let src = data.args[0];
                if let Some(r) = data.result.filter(|&r| !self.store.is_tracked(r) && self.is_dead(src)) {
                    if let Some(folded) = self.fold_cast(*op, src, r, at)? {
                        self.func.replace_all_uses(r, folded);
                        self.store.supersede(i);
                        return Ok(());
                    }
                }
            }
            _ => {}
        }
        self.narrow_operands(i)
    }

    /// Compare packed operands lane by lane into the `<n x i1>` result.
    fn packed_compare(&mut self, pred: IntPredicate, r: Value, args: &[Value], at: InsertPoint) -> Result<Value, LegalizeError> {
        let kind = compare_kind(pred);
        let vector_ty = self.func.value_type(args[0]);
        let (lane_ty, elem_width) = self.packed_lanes(vector_ty)?;
        let lhs = self.wide_any(args[0], kind, at)?;
        let rhs = self.wide_any(args[1], kind, at)?;
        let result_ty = self.func.value_type(r);
        let name = self.derived_name(r, "wide");
        let mut b = Builder::new(self.func, at);
        let mut acc = b.func().undef(result_ty);
        for k in 0..vector_ty.lanes() {
            let x = lanes::extract_packed(&mut b, lhs, k, elem_width, lane_ty, kind, &name);
            let y = lanes::extract_packed(&mut b, rhs, k, elem_width, lane_ty, kind, &name);
            let c = b.icmp(pred, x, y, &name);
            let idx = b.const_int(Type::I32, k as u128);
            acc = b.insert_element(acc, c, idx, &name);
        }
        trace!("@{}: packed compare of {}", self.func.name, value_ref(self.func, args[0]));
        Ok(acc)
    }

    /// A legal-result cast of a value whose narrow definition is gone reads
    /// the wide value directly.
    fn fold_cast(&mut self, op: CastOp, src: Value, r: Value, at: InsertPoint) -> Result<Option<Value>, LegalizeError> {
        let src_ty = self.func.value_type(src);
        let res_ty = self.func.value_type(r);
        if src_ty.is_vector() && !self.promoted(src_ty)?.is_vector() {
            return Ok(None);
        }
        let name = self.derived_name(r, "wide");
        match op {
            CastOp::ZExt | CastOp::SExt => {
                let kind = if op == CastOp::SExt { ExtKind::Sign } else { ExtKind::Zero };
                let source = self.clean(src, kind, at)?;
                Ok(Some(Builder::new(self.func, at).resize(source, res_ty, kind.is_signed(), &name)))
            }
            CastOp::Trunc => {
                let source = self.wide_any(src, ExtKind::Sign, at)?;
                Ok(Some(Builder::new(self.func, at).resize(source, res_ty, false, &name)))
            }
            CastOp::Bitcast => {
                let Type::Vector(Elem::Int(e), n) = res_ty else { return Ok(None) };
                let p = self.promoted(src_ty)?.bit_width();
                if src_ty.is_vector() || p % e != 0 {
                    return Ok(None);
                }
                let source = self.wide_any(src, ExtKind::Sign, at)?;
                let dense = Type::Vector(Elem::Int(e), p / e);
                let mut b = Builder::new(self.func, at);
                let cast = b.cast(CastOp::Bitcast, source, dense, &name);
                let undef = b.func().undef(dense);
                Ok(Some(b.shuffle(cast, undef, (0..n).collect(), &name)))
            }
            _ => Ok(None),
        }
    }

    /// Give every operand whose definition is going away its narrow value.
    fn narrow_operands(&mut self, i: Inst) -> Result<(), LegalizeError> {
        let data = self.func.inst(i);
        let blocks = match &data.op {
            Opcode::Phi(blocks) => Some(blocks.clone()),
            _ => None,
        };
        let args = data.args.clone();
        for (k, a) in args.into_iter().enumerate() {
            if !self.is_dead(a) {
                continue;
            }
            let at = match &blocks {
                Some(blocks) => InsertPoint::before_terminator(self.func, blocks[k]),
                None => InsertPoint::Before(i),
            };
            let n = self.narrow(a, at)?;
            if n != a {
                self.func.set_arg(i, k, n);
                self.summary.operands_rewritten += 1;
            }
        }
        Ok(())
    }
}

/// Equality holds under either extension; signed compares need sign bits.
fn compare_kind(pred: IntPredicate) -> ExtKind {
    if pred.is_unsigned() { ExtKind::Zero } else { ExtKind::Sign }
}

/// `index * elem_width` at type `ty`.
fn bit_offset(b: &mut Builder, index: Value, ty: Type, elem_width: u32, name: &str) -> Value {
    let index = b.resize(index, ty, false, name);
    let width = b.const_int(ty, elem_width as u128);
    b.binary(BinaryOp::Mul, index, width, name)
}
