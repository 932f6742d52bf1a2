//! Local rewrites
//!
//! Guards that are already known to hold are removed and guards known to
//! fail abort the run. Redundant guards on the same pointer are fused into
//! the earliest one. Arithmetic identities, pointer comparisons and boolean
//! inverse/reflex pairs are folded, and the call flavours the backend does
//! not know about are turned into plain calls.

use super::core::{Chain, OptContext, Pass};
use super::value::ValueId;
use crate::error::{OptError, Result};
use crate::ir::{BoxKind, Const, Op, Opcode, Operand, CONST_0, CONST_1};
use rustc_hash::FxHashMap as HashMap;
use tracing::debug;

pub struct OptRewrite {
    /// Results of `call_loopinvariant`, by function address
    loop_invariant_results: HashMap<i64, Operand>,
    /// The previous operation was a call that got removed
    removed_call: bool,
}

impl Default for OptRewrite {
    fn default() -> Self {
        Self::new()
    }
}

fn always_fails(op: &Op) -> OptError {
    OptError::invalid_loop(format!("{} was proven to always fail", op))
}

impl OptRewrite {
    pub fn new() -> Self {
        Self {
            loop_invariant_results: HashMap::default(),
            removed_call: false,
        }
    }

    /// Emit a guard and remember its output position on `id`
    fn emit_guard_on(&mut self, op: Op, chain: &mut Chain<'_>, id: ValueId) -> Result<()> {
        let before = chain.ctx.output.len();
        chain.emit(op)?;
        let len = chain.ctx.output.len();
        if len > before && chain.ctx.output[len - 1].is_guard() {
            chain.ctx.value_mut(id).last_guard = Some(len - 1);
        }
        Ok(())
    }

    /// Replace the guard at `index` in place, keeping its resume state
    fn replace_guard(ctx: &mut OptContext, index: usize, opcode: Opcode, args: Vec<Operand>) {
        if let Some(old) = ctx.output.get_mut(index) {
            debug!(old = %old, replacement = %opcode, "strengthening earlier guard");
            old.opcode = opcode;
            old.args = args;
        }
    }

    // ==================== Guards ====================

    fn optimize_guard_bool(&mut self, op: Op, chain: &mut Chain<'_>, want: bool) -> Result<()> {
        let id = chain.value(op.arg(0));
        let value = chain.ctx.value(id);
        if let Some(c) = value.get_constant() {
            if c.nonnull() == want {
                return Ok(());
            }
            return Err(always_fails(&op));
        }
        if value.is_nonnull() {
            if want {
                return Ok(());
            }
            return Err(always_fails(&op));
        }
        let bool_like = chain.ctx.is_bool(id)
            || (value.intbound.known_nonnegative() && value.intbound.has_upper && value.intbound.upper <= 1);
        chain.emit(op)?;
        if !want {
            chain.ctx.make_constant(id, CONST_0)?;
        } else if bool_like {
            chain.ctx.make_constant(id, CONST_1)?;
        }
        Ok(())
    }

    fn optimize_guard_value(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        if chain.ctx.is_virtual(id) {
            return Err(OptError::invalid_loop(format!(
                "promote of a virtual ({}) never makes sense",
                op.arg(0)
            )));
        }
        let Some(expected) = op.arg(1).as_const() else {
            return chain.emit(op);
        };
        let value = chain.ctx.value(id);
        if let Some(c) = value.get_constant() {
            if c.same_constant(&expected) {
                return Ok(());
            }
            return Err(always_fails(&op));
        }
        let impossible = match expected {
            Const::Int(v) => value.kind() == BoxKind::Int && !value.intbound.contains(v),
            Const::Ptr(_) => !expected.nonnull() && value.is_nonnull(),
            Const::Float(_) => false,
        };
        if impossible {
            return Err(always_fails(&op));
        }
        if let Some(index) = value.last_guard {
            let subject = value.operand;
            Self::replace_guard(chain.ctx, index, Opcode::GuardValue, vec![subject, op.arg(1)]);
            chain.ctx.value_mut(id).last_guard = None;
        } else {
            chain.emit(op)?;
        }
        chain.ctx.make_constant(id, expected)
    }

    fn optimize_guard_nonnull(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let value = chain.ctx.value(id);
        if value.is_nonnull() {
            return Ok(());
        }
        if value.is_null() {
            return Err(always_fails(&op));
        }
        self.emit_guard_on(op, chain, id)?;
        chain.ctx.value_mut(id).make_nonnull();
        Ok(())
    }

    fn optimize_guard_isnull(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let value = chain.ctx.value(id);
        if value.is_null() {
            return Ok(());
        }
        if value.is_nonnull() {
            return Err(always_fails(&op));
        }
        let null = value.kind().default_const();
        chain.emit(op)?;
        chain.ctx.make_constant(id, null)
    }

    fn optimize_guard_class(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let Some(expected) = op.arg(1).const_int() else {
            return chain.emit(op);
        };
        let value = chain.ctx.value(id);
        if op.opcode == Opcode::GuardNonnullClass && value.is_null() {
            return Err(always_fails(&op));
        }
        if let Some(known) = value.get_constant_class() {
            if known == expected {
                return Ok(());
            }
            return Err(always_fails(&op));
        }
        let previous = value.last_guard;
        let subject = value.operand;
        let fused = previous.filter(|&index| {
            chain
                .ctx
                .output
                .get(index)
                .map(|g| g.opcode == Opcode::GuardNonnull)
                .unwrap_or(false)
        });
        match fused {
            Some(index) => {
                Self::replace_guard(chain.ctx, index, Opcode::GuardNonnullClass, vec![subject, op.arg(1)]);
            }
            None => self.emit_guard_on(op, chain, id)?,
        }
        chain.ctx.value_mut(id).make_constant_class(expected);
        Ok(())
    }

    fn optimize_record_known_class(&mut self, op: &Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        if let Some(class) = op.arg(1).const_int() {
            let value = chain.ctx.value_mut(id);
            if !value.is_constant() && value.get_constant_class().is_none() {
                value.make_constant_class(class);
            }
        }
        Ok(())
    }

    // ==================== Arithmetic ====================

    /// Rewrites of the form `op(a, b) == a` or `== constant`
    fn optimize_int_binop(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        let (a, b) = (op.arg(0), op.arg(1));
        let ca = chain.ctx.get_constant_int(a);
        let cb = chain.ctx.get_constant_int(b);
        let same = chain.ctx.resolve(a) == chain.ctx.resolve(b);
        let forward: Option<Operand> = match op.opcode {
            Opcode::IntAdd | Opcode::IntOr | Opcode::IntXor if cb == Some(0) => Some(a),
            Opcode::IntAdd | Opcode::IntOr | Opcode::IntXor if ca == Some(0) => Some(b),
            Opcode::IntSub if cb == Some(0) => Some(a),
            Opcode::IntSub | Opcode::IntXor if same => Some(Operand::int(0)),
            Opcode::IntAnd | Opcode::IntOr if same => Some(a),
            Opcode::IntAnd if ca == Some(0) || cb == Some(0) => Some(Operand::int(0)),
            Opcode::IntAnd if cb == Some(-1) => Some(a),
            Opcode::IntAnd if ca == Some(-1) => Some(b),
            Opcode::IntOr if ca == Some(-1) || cb == Some(-1) => Some(Operand::int(-1)),
            Opcode::IntMul if cb == Some(1) => Some(a),
            Opcode::IntMul if ca == Some(1) => Some(b),
            Opcode::IntMul if ca == Some(0) || cb == Some(0) => Some(Operand::int(0)),
            Opcode::IntFloordiv | Opcode::UintFloordiv if cb == Some(1) => Some(a),
            Opcode::IntLshift | Opcode::IntRshift | Opcode::UintRshift if cb == Some(0) => Some(a),
            Opcode::IntLshift | Opcode::IntRshift | Opcode::UintRshift if ca == Some(0) => {
                Some(Operand::int(0))
            }
            _ => None,
        };
        if let Some(forward) = forward {
            debug!(op = %op, to = %forward, "algebraic identity");
            return chain.ctx.make_equal_to(result, forward);
        }
        if op.opcode == Opcode::IntMul {
            let power = |c: Option<i64>| c.filter(|&v| v > 1 && v & (v - 1) == 0).map(|v| v.trailing_zeros());
            let shifted = match (power(ca), power(cb)) {
                (_, Some(k)) => Some((a, k)),
                (Some(k), None) => Some((b, k)),
                _ => None,
            };
            if let Some((other, k)) = shifted {
                let op = op.copy_and_change(Opcode::IntLshift, vec![other, Operand::int(k as i64)]);
                return chain.emit(op);
            }
        }
        if op.opcode.returns_bool_result() && self.try_bool_reuse(&op, chain)? {
            return Ok(());
        }
        chain.emit(op)
    }

    /// Reuse a known comparison through its inverse or reflex
    ///
    /// `int_lt(a, b)` already computed answers `int_gt(b, a)` directly, and
    /// `int_ge(a, b)` once its truth is known.
    fn try_bool_reuse(&mut self, op: &Op, chain: &mut Chain<'_>) -> Result<bool> {
        let Some(result) = op.result else {
            return Ok(false);
        };
        let (a, b) = (op.arg(0), op.arg(1));
        let reflex = op.opcode.bool_reflex();
        let inverse = op.opcode.bool_inverse();
        let inverse_reflex = reflex.and_then(|r| r.bool_inverse());
        let candidates = [(reflex, [b, a], false), (inverse, [a, b], true), (inverse_reflex, [b, a], true)];
        for (opcode, args, negate) in candidates {
            let Some(opcode) = opcode else { continue };
            let key = chain.ctx.pure_key(opcode, &args, None);
            let Some(hit) = chain.ctx.get_pure(&key) else {
                continue;
            };
            if !negate {
                chain.ctx.make_equal(result, hit)?;
                return Ok(true);
            }
            if let Some(v) = chain.ctx.value(hit).get_constant_int() {
                chain.ctx.make_constant_int(result, 1 - v)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn optimize_float_mul(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        for (c, other) in [(op.arg(0), op.arg(1)), (op.arg(1), op.arg(0))] {
            match chain.ctx.get_constant(c).and_then(|c| c.as_float()) {
                Some(v) if v == 1.0 => return chain.ctx.make_equal_to(result, other),
                Some(v) if v == -1.0 => {
                    let neg = op.copy_and_change(Opcode::FloatNeg, vec![other]);
                    return chain.emit(neg);
                }
                _ => {}
            }
        }
        chain.emit(op)
    }

    fn optimize_nullness(&mut self, op: Op, chain: &mut Chain<'_>, expect_nonnull: bool) -> Result<()> {
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        let id = chain.value(op.arg(0));
        let value = chain.ctx.value(id);
        if value.is_nonnull() {
            return chain.ctx.make_constant_int(result, expect_nonnull as i64);
        }
        if value.is_null() {
            return chain.ctx.make_constant_int(result, !expect_nonnull as i64);
        }
        if expect_nonnull && op.opcode == Opcode::IntIsTrue && chain.ctx.is_bool(id) {
            return chain.ctx.make_equal(result, id);
        }
        chain.emit(op)
    }

    fn optimize_ptr_eq(&mut self, op: Op, chain: &mut Chain<'_>, expect_ne: bool) -> Result<()> {
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        let instance = matches!(op.opcode, Opcode::InstancePtrEq | Opcode::InstancePtrNe);
        let (a, b) = (chain.value(op.arg(0)), chain.value(op.arg(1)));
        let ctx = &*chain.ctx;
        let (va, vb) = (ctx.value(a), ctx.value(b));
        let same = a == b
            || matches!((va.get_constant(), vb.get_constant()), (Some(x), Some(y)) if x.same_constant(&y));
        let equal: Option<bool> = if same {
            Some(true)
        } else if ctx.is_virtual(a) || ctx.is_virtual(b) {
            Some(false)
        } else if (va.is_null() && vb.is_nonnull()) || (vb.is_null() && va.is_nonnull()) {
            Some(false)
        } else if ctx.known_distinct(a, b) {
            Some(false)
        } else if instance {
            match (va.get_constant_class(), vb.get_constant_class()) {
                (Some(x), Some(y)) if x != y => Some(false),
                _ => None,
            }
        } else {
            None
        };
        match equal {
            Some(eq) => chain.ctx.make_constant_int(result, (eq != expect_ne) as i64),
            None => chain.emit(op),
        }
    }

    // ==================== Calls ====================

    fn optimize_call_pure(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let Some(result) = op.result else {
            let call = op.copy_and_change(Opcode::Call, op.args.clone());
            return chain.emit(call);
        };
        let consts: Option<Vec<Const>> = op.args.iter().map(|a| chain.ctx.get_constant(*a)).collect();
        if let Some(known) = consts.and_then(|c| chain.ctx.call_pure_results.get(&c).copied()) {
            debug!(op = %op, result = %known, "call_pure folded to recorded result");
            self.removed_call = true;
            return chain.ctx.make_constant_box(result, known);
        }
        let key = chain.ctx.op_key(&op);
        if let Some(hit) = chain.ctx.get_pure(&key) {
            debug!(op = %op, "call_pure reused");
            self.removed_call = true;
            return chain.ctx.make_equal(result, hit);
        }
        let call = op.copy_and_change(Opcode::Call, op.args.clone());
        chain.emit(call)?;
        let id = chain.value(Operand::Box(result));
        chain.ctx.register_pure(key, id);
        Ok(())
    }

    fn optimize_call_loopinvariant(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let call = op.copy_and_change(Opcode::Call, op.args.clone());
        let Some(func) = chain.ctx.get_constant_int(op.arg(0)) else {
            return chain.emit(call);
        };
        if let Some(&known) = self.loop_invariant_results.get(&func) {
            self.removed_call = true;
            return match op.result {
                Some(result) => chain.ctx.make_equal_to(result, known),
                None => Ok(()),
            };
        }
        chain.emit(call)?;
        let known = match op.result {
            Some(result) => chain.ctx.resolve(Operand::Box(result)),
            None => Operand::int(0),
        };
        self.loop_invariant_results.insert(func, known);
        Ok(())
    }

    fn optimize_cond_call(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        match chain.ctx.get_constant(op.arg(0)) {
            Some(c) if !c.nonnull() => {
                self.removed_call = true;
                Ok(())
            }
            Some(_) => {
                let call = op.copy_and_change(Opcode::Call, op.args[1..].to_vec());
                chain.emit(call)
            }
            None => chain.emit(op),
        }
    }
}

impl Pass for OptRewrite {
    fn name(&self) -> &'static str {
        "rewrite"
    }

    fn propagate(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let removed_before = std::mem::replace(&mut self.removed_call, false);
        match op.opcode {
            Opcode::GuardTrue => self.optimize_guard_bool(op, chain, true),
            Opcode::GuardFalse => self.optimize_guard_bool(op, chain, false),
            Opcode::GuardValue => self.optimize_guard_value(op, chain),
            Opcode::GuardNonnull => self.optimize_guard_nonnull(op, chain),
            Opcode::GuardIsnull => self.optimize_guard_isnull(op, chain),
            Opcode::GuardClass | Opcode::GuardNonnullClass => self.optimize_guard_class(op, chain),
            Opcode::GuardNoException if removed_before => Ok(()),
            Opcode::RecordKnownClass => self.optimize_record_known_class(&op, chain),
            Opcode::IntAdd
            | Opcode::IntSub
            | Opcode::IntMul
            | Opcode::IntFloordiv
            | Opcode::UintFloordiv
            | Opcode::IntAnd
            | Opcode::IntOr
            | Opcode::IntXor
            | Opcode::IntLshift
            | Opcode::IntRshift
            | Opcode::UintRshift
            | Opcode::IntLt
            | Opcode::IntLe
            | Opcode::IntGt
            | Opcode::IntGe
            | Opcode::IntEq
            | Opcode::IntNe
            | Opcode::UintLt
            | Opcode::UintLe
            | Opcode::UintGt
            | Opcode::UintGe
            | Opcode::FloatLt
            | Opcode::FloatLe
            | Opcode::FloatGt
            | Opcode::FloatGe
            | Opcode::FloatEq
            | Opcode::FloatNe => self.optimize_int_binop(op, chain),
            Opcode::FloatMul => self.optimize_float_mul(op, chain),
            Opcode::IntIsTrue => self.optimize_nullness(op, chain, true),
            Opcode::IntIsZero => self.optimize_nullness(op, chain, false),
            Opcode::PtrEq | Opcode::InstancePtrEq => self.optimize_ptr_eq(op, chain, false),
            Opcode::PtrNe | Opcode::InstancePtrNe => self.optimize_ptr_eq(op, chain, true),
            Opcode::CallPure => self.optimize_call_pure(op, chain),
            Opcode::CallLoopinvariant => self.optimize_call_loopinvariant(op, chain),
            Opcode::CondCall => self.optimize_cond_call(op, chain),
            Opcode::SameAs => match op.result {
                Some(result) => chain.ctx.make_equal_to(result, op.arg(0)),
                None => Ok(()),
            },
            _ => chain.emit(op),
        }
    }
}
