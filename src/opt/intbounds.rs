//! Integer interval propagation
//!
//! Results of integer operations get the interval computed from their
//! arguments. Comparisons whose outcome the intervals decide are folded to
//! boolean constants. After a guard has fixed the truth of a comparison, the
//! operand intervals are narrowed backwards through the operations that
//! produced them.

use super::core::{Chain, OptContext, Pass};
use super::intutils::IntBound;
use super::value::{LenMode, ValueId};
use crate::error::{OptError, Result};
use crate::ir::{BoxKind, BoxRef, Const, Op, Opcode, Operand};
use rustc_hash::FxHashMap as HashMap;
use tracing::debug;

pub struct OptIntBounds {
    /// The previous operation was an overflow-checked op proven not to overflow
    downgraded_ovf: bool,
    /// Length results, pointing back at the array or string they measure
    lengths: HashMap<ValueId, ValueId>,
}

impl Default for OptIntBounds {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a signed comparison, if the intervals decide it
fn decide(opcode: Opcode, a: &IntBound, b: &IntBound) -> Option<bool> {
    match opcode {
        Opcode::IntLt => {
            if a.known_lt(b) {
                Some(true)
            } else if a.known_ge(b) {
                Some(false)
            } else {
                None
            }
        }
        Opcode::IntLe => {
            if a.known_le(b) {
                Some(true)
            } else if a.known_gt(b) {
                Some(false)
            } else {
                None
            }
        }
        Opcode::IntGt => decide(Opcode::IntLt, b, a),
        Opcode::IntGe => decide(Opcode::IntLe, b, a),
        Opcode::IntEq => {
            if a.known_ne(b) {
                Some(false)
            } else if a.is_constant() && a == b {
                Some(true)
            } else {
                None
            }
        }
        Opcode::IntNe => decide(Opcode::IntEq, a, b).map(|v| !v),
        _ => None,
    }
}

/// The signed counterpart of an unsigned comparison
fn signed_version(opcode: Opcode) -> Opcode {
    match opcode {
        Opcode::UintLt => Opcode::IntLt,
        Opcode::UintLe => Opcode::IntLe,
        Opcode::UintGt => Opcode::IntGt,
        Opcode::UintGe => Opcode::IntGe,
        other => other,
    }
}

/// Outcome of comparing a value with itself
fn reflexive_outcome(opcode: Opcode) -> Option<bool> {
    match opcode {
        Opcode::IntLt | Opcode::IntGt | Opcode::IntNe | Opcode::UintLt | Opcode::UintGt => Some(false),
        Opcode::IntLe | Opcode::IntGe | Opcode::IntEq | Opcode::UintLe | Opcode::UintGe => Some(true),
        _ => None,
    }
}

/// Interval of a wrapping `int_add`, `int_sub` or `int_neg`
///
/// An open end means the computation may have wrapped around, so a
/// one-sided interval says nothing about the result.
fn wrapping(bound: IntBound) -> IntBound {
    if bound.bounded() {
        bound
    } else {
        IntBound::unbounded()
    }
}

/// Range of a value sign-extended from `bytes` bytes
fn signext_range(bytes: i64) -> Option<IntBound> {
    match bytes {
        1 | 2 | 4 => {
            let bits = bytes * 8;
            Some(IntBound::new(-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1))
        }
        8 => Some(IntBound::unbounded()),
        _ => None,
    }
}

impl OptIntBounds {
    pub fn new() -> Self {
        Self {
            downgraded_ovf: false,
            lengths: HashMap::default(),
        }
    }

    /// Intersect the interval of `operand` with `bound`
    ///
    /// Returns whether anything changed. An interval that shrinks to one
    /// value turns its box into that constant.
    fn narrow(&mut self, ctx: &mut OptContext, operand: Operand, bound: &IntBound) -> Result<bool> {
        let b = match operand {
            Operand::Box(b) if b.kind == BoxKind::Int => b,
            Operand::Const(Const::Int(v)) => {
                if bound.contains(v) {
                    return Ok(false);
                }
                return Err(OptError::invalid_loop(format!(
                    "constant {} outside bound {}",
                    v, bound
                )));
            }
            _ => return Ok(false),
        };
        let id = ctx.value_of(Operand::Box(b));
        if ctx.value(id).is_constant() {
            let mut own = ctx.value(id).intbound;
            own.intersect(bound)?;
            return Ok(false);
        }
        let changed = ctx.value_mut(id).intbound.intersect(bound)?;
        if !changed {
            return Ok(false);
        }
        let narrowed = ctx.value(id).intbound;
        if let Some(v) = narrowed.get_constant() {
            debug!(target_box = %b, value = v, "interval collapsed to a constant");
            ctx.make_constant(id, Const::Int(v))?;
        }
        if let Some(&container) = self.lengths.get(&id) {
            if let Some(lb) = ctx.value_mut(container).lenbound.as_mut() {
                lb.bound.intersect(&narrowed)?;
            }
        }
        Ok(true)
    }

    fn narrow_result(&mut self, ctx: &mut OptContext, op: &Op, bound: &IntBound) -> Result<()> {
        if let Some(result) = op.result {
            if bound.has_lower || bound.has_upper {
                self.narrow(ctx, Operand::Box(result), bound)?;
            }
        }
        Ok(())
    }

    // ==================== Forward ====================

    fn optimize_arith(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let a = chain.ctx.intbound_of(op.arg(0));
        let b = if op.num_args() > 1 {
            chain.ctx.intbound_of(op.arg(1))
        } else {
            IntBound::unbounded()
        };
        let bound = match op.opcode {
            Opcode::IntAdd => wrapping(a.add_bound(&b)),
            Opcode::IntSub => wrapping(a.sub_bound(&b)),
            Opcode::IntMul => a.mul_bound(&b),
            Opcode::IntFloordiv => a.div_bound(&b),
            Opcode::UintFloordiv if a.known_nonnegative() && b.known_nonnegative() => a.div_bound(&b),
            Opcode::IntAnd => a.and_bound(&b),
            Opcode::IntOr | Opcode::IntXor => a.or_bound(&b),
            Opcode::IntLshift => a.lshift_bound(&b),
            Opcode::IntRshift => a.rshift_bound(&b),
            Opcode::UintRshift => a.urshift_bound(&b),
            Opcode::IntNeg => wrapping(a.neg_bound()),
            Opcode::IntInvert => a.invert_bound(),
            Opcode::IntForceGeZero => {
                if a.has_upper {
                    IntBound::new(0, a.upper.max(0))
                } else {
                    IntBound::nonnegative()
                }
            }
            _ => IntBound::unbounded(),
        };
        chain.emit(op.clone())?;
        self.narrow_result(chain.ctx, &op, &bound)
    }

    fn optimize_int_mod(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let a = chain.ctx.intbound_of(op.arg(0));
        let b = chain.ctx.intbound_of(op.arg(1));
        if let Some(m) = b.get_constant() {
            if m > 0 && m & (m - 1) == 0 && a.known_nonnegative() {
                debug!(modulus = m, "int_mod by a power of two becomes int_and");
                let op = op.copy_and_change(Opcode::IntAnd, vec![op.arg(0), Operand::int(m - 1)]);
                chain.emit(op.clone())?;
                return self.narrow_result(chain.ctx, &op, &IntBound::new(0, m - 1));
            }
        }
        chain.emit(op.clone())?;
        self.narrow_result(chain.ctx, &op, &a.mod_bound(&b))
    }

    fn optimize_signext(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let a = chain.ctx.intbound_of(op.arg(0));
        let range = op.arg(1).const_int().and_then(signext_range);
        if let (Some(range), Some(result)) = (range, op.result) {
            if range.contains_bound(&a) {
                return chain.ctx.make_equal_to(result, op.arg(0));
            }
            chain.emit(op.clone())?;
            return self.narrow_result(chain.ctx, &op, &range);
        }
        chain.emit(op)
    }

    fn optimize_comparison(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        let (x, y) = (op.arg(0), op.arg(1));
        let a = chain.ctx.intbound_of(x);
        let b = chain.ctx.intbound_of(y);
        let outcome = if chain.ctx.resolve(x) == chain.ctx.resolve(y) {
            reflexive_outcome(op.opcode)
        } else {
            match op.opcode {
                Opcode::UintLt | Opcode::UintLe | Opcode::UintGt | Opcode::UintGe => {
                    if a.known_nonnegative() && b.known_nonnegative() {
                        decide(signed_version(op.opcode), &a, &b)
                    } else {
                        None
                    }
                }
                opcode => decide(opcode, &a, &b),
            }
        };
        if let Some(outcome) = outcome {
            debug!(op = %op, outcome, "comparison decided by intervals");
            return chain.ctx.make_constant_int(result, outcome as i64);
        }
        chain.emit(op.clone())?;
        self.narrow_result(chain.ctx, &op, &IntBound::new(0, 1))
    }

    fn optimize_ovf(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let a = chain.ctx.intbound_of(op.arg(0));
        let b = chain.ctx.intbound_of(op.arg(1));
        let (safe, bound) = match op.opcode {
            Opcode::IntAddOvf => (a.add_bound_cannot_overflow(&b), a.add_bound(&b)),
            Opcode::IntSubOvf => (a.sub_bound_cannot_overflow(&b), a.sub_bound(&b)),
            _ => (a.mul_bound_cannot_overflow(&b), a.mul_bound(&b)),
        };
        let op = if safe {
            debug!(op = %op, "overflow check proven unnecessary");
            self.downgraded_ovf = true;
            op.copy_and_change(op.opcode.without_ovf(), op.args.clone())
        } else {
            op
        };
        chain.emit(op.clone())?;
        self.narrow_result(chain.ctx, &op, &bound)
    }

    fn optimize_length(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let mode = if op.opcode == Opcode::Strlen {
            LenMode::Str
        } else {
            LenMode::Array
        };
        let container = op.arg(0);
        let descr = op.descr.clone();
        chain.emit(op.clone())?;
        let Some(result) = op.result else {
            return Ok(());
        };
        let ctx = &mut *chain.ctx;
        let cid = ctx.value_of(container);
        let rid = ctx.value_of(Operand::Box(result));
        if ctx.value(rid).is_constant() {
            return Ok(());
        }
        if ctx.value(cid).lenbound.is_none() {
            ctx.value_mut(cid).make_len_gt(mode, descr, -1)?;
        }
        let bound = ctx
            .value(cid)
            .lenbound
            .as_ref()
            .map(|lb| lb.bound)
            .unwrap_or_else(IntBound::nonnegative);
        self.lengths.insert(rid, cid);
        self.narrow(ctx, Operand::Box(result), &bound)?;
        Ok(())
    }

    fn optimize_item_read(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let (container, index) = (op.arg(0), op.arg(1));
        let descr = op.descr.clone();
        let is_str = op.opcode == Opcode::Strgetitem;
        chain.emit(op.clone())?;
        if let Some(i) = chain.ctx.get_constant_int(index) {
            let cid = chain.ctx.value_of(container);
            if !chain.ctx.value(cid).is_constant() {
                if is_str {
                    chain.ctx.value_mut(cid).make_len_gt(LenMode::Str, None, i)?;
                } else {
                    chain.ctx.value_mut(cid).make_len_gt(LenMode::Array, descr, i)?;
                }
            }
        }
        if is_str {
            self.narrow_result(chain.ctx, &op, &IntBound::new(0, 255))?;
        }
        Ok(())
    }

    fn optimize_guard(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let subject = op.arg(0);
        let expected = match op.opcode {
            Opcode::GuardFalse => Some(0),
            Opcode::GuardValue => op.arg(1).const_int(),
            _ => None,
        };
        let opcode = op.opcode;
        chain.emit(op)?;
        let Operand::Box(b) = subject else {
            return Ok(());
        };
        if b.kind != BoxKind::Int {
            return Ok(());
        }
        let id = chain.ctx.value_of(subject);
        let bound = match (opcode, expected) {
            (_, Some(v)) => IntBound::from_constant(v),
            (Opcode::GuardTrue, None) => {
                let mut current = chain.ctx.value(id).intbound;
                if chain.ctx.is_bool(id) || (current.known_nonnegative() && current.has_upper && current.upper <= 1) {
                    IntBound::from_constant(1)
                } else {
                    current.make_ne_const(0)?;
                    current
                }
            }
            _ => return Ok(()),
        };
        self.narrow(chain.ctx, subject, &bound)?;
        self.propagate_bounds_backward(chain.ctx, b)
    }

    // ==================== Backward ====================

    /// Push a newly learned interval of `start` into the operations it came from
    fn propagate_bounds_backward(&mut self, ctx: &mut OptContext, start: BoxRef) -> Result<()> {
        let mut work = vec![start];
        while let Some(b) = work.pop() {
            let Some(op) = ctx.producer(b).cloned() else {
                continue;
            };
            for changed in self.backward_step(ctx, &op)? {
                if let Operand::Box(x) = changed {
                    work.push(x);
                }
            }
        }
        Ok(())
    }

    /// Narrow the arguments of `op` from the interval of its result
    fn backward_step(&mut self, ctx: &mut OptContext, op: &Op) -> Result<Vec<Operand>> {
        let Some(result) = op.result else {
            return Ok(Vec::new());
        };
        if result.kind != BoxKind::Int || op.args.is_empty() {
            return Ok(Vec::new());
        }
        let r = ctx.intbound_of(Operand::Box(result));
        let mut updates: Vec<(Operand, IntBound)> = Vec::new();

        if op.opcode.returns_bool_result() {
            let truth = match r.get_constant() {
                Some(0) => false,
                Some(1) => true,
                _ => return Ok(Vec::new()),
            };
            if matches!(op.opcode, Opcode::IntIsTrue | Opcode::IntIsZero) {
                let x = op.arg(0);
                let nonzero = truth == (op.opcode == Opcode::IntIsTrue);
                let mut bx = ctx.intbound_of(x);
                if nonzero {
                    bx.make_ne_const(0)?;
                } else {
                    bx = IntBound::from_constant(0);
                }
                updates.push((x, bx));
            } else if op.num_args() == 2 && op.arg(0).kind() == BoxKind::Int {
                let opcode = if truth {
                    Some(op.opcode)
                } else {
                    op.opcode.bool_inverse()
                };
                if let Some(opcode) = opcode {
                    updates.extend(self.compare_facts(ctx, opcode, op.arg(0), op.arg(1))?);
                }
            }
        } else if op.num_args() == 2 {
            let (x, y) = (op.arg(0), op.arg(1));
            let (a, b) = (ctx.intbound_of(x), ctx.intbound_of(y));
            match op.opcode {
                Opcode::IntAdd => {
                    updates.push((x, wrapping(r.sub_bound(&b))));
                    updates.push((y, wrapping(r.sub_bound(&a))));
                }
                Opcode::IntSub => {
                    updates.push((x, wrapping(r.add_bound(&b))));
                    updates.push((y, wrapping(a.sub_bound(&r))));
                }
                Opcode::IntMul if a.mul_bound_cannot_overflow(&b) => {
                    if !b.contains(0) {
                        updates.push((x, r.div_bound(&b)));
                    }
                    if !a.contains(0) {
                        updates.push((y, r.div_bound(&a)));
                    }
                }
                Opcode::IntLshift if a.lshift_bound_cannot_overflow(&b) && b.is_constant() => {
                    updates.push((x, r.rshift_bound(&b)));
                }
                _ => {}
            }
        }

        let mut changed = Vec::new();
        for (operand, bound) in updates {
            if self.narrow(ctx, operand, &bound)? {
                changed.push(operand);
            }
        }
        Ok(changed)
    }

    /// What `opcode(x, y) == 1` says about `x` and `y`
    fn compare_facts(
        &self,
        ctx: &OptContext,
        opcode: Opcode,
        x: Operand,
        y: Operand,
    ) -> Result<Vec<(Operand, IntBound)>> {
        let (a, b) = (ctx.intbound_of(x), ctx.intbound_of(y));
        let (mut na, mut nb) = (a, b);
        match opcode {
            Opcode::IntLt => {
                na.make_lt(&b)?;
                nb.make_gt(&a)?;
            }
            Opcode::IntLe => {
                na.make_le(&b)?;
                nb.make_ge(&a)?;
            }
            Opcode::IntGt => {
                na.make_gt(&b)?;
                nb.make_lt(&a)?;
            }
            Opcode::IntGe => {
                na.make_ge(&b)?;
                nb.make_le(&a)?;
            }
            Opcode::IntEq => {
                na.intersect(&b)?;
                nb.intersect(&a)?;
            }
            Opcode::IntNe => {
                if let Some(c) = b.get_constant() {
                    na.make_ne_const(c)?;
                }
                if let Some(c) = a.get_constant() {
                    nb.make_ne_const(c)?;
                }
            }
            Opcode::UintLt | Opcode::UintLe if b.known_nonnegative() => {
                na.make_ge_const(0)?;
                if opcode == Opcode::UintLt {
                    na.make_lt(&b)?;
                } else {
                    na.make_le(&b)?;
                }
            }
            Opcode::UintGt | Opcode::UintGe if a.known_nonnegative() => {
                nb.make_ge_const(0)?;
                if opcode == Opcode::UintGt {
                    nb.make_lt(&a)?;
                } else {
                    nb.make_le(&a)?;
                }
            }
            _ => {}
        }
        Ok(vec![(x, na), (y, nb)])
    }
}

impl Pass for OptIntBounds {
    fn name(&self) -> &'static str {
        "intbounds"
    }

    fn propagate(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let downgraded = std::mem::replace(&mut self.downgraded_ovf, false);
        match op.opcode {
            Opcode::GuardNoOverflow if downgraded => Ok(()),
            Opcode::GuardOverflow if downgraded => Err(OptError::invalid_loop(
                "guard_overflow after an operation that cannot overflow",
            )),
            Opcode::GuardTrue | Opcode::GuardFalse | Opcode::GuardValue => self.optimize_guard(op, chain),
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
            | Opcode::IntNeg
            | Opcode::IntInvert
            | Opcode::IntForceGeZero => self.optimize_arith(op, chain),
            Opcode::IntMod => self.optimize_int_mod(op, chain),
            Opcode::IntSignext => self.optimize_signext(op, chain),
            Opcode::IntLt
            | Opcode::IntLe
            | Opcode::IntGt
            | Opcode::IntGe
            | Opcode::IntEq
            | Opcode::IntNe
            | Opcode::UintLt
            | Opcode::UintLe
            | Opcode::UintGt
            | Opcode::UintGe => self.optimize_comparison(op, chain),
            Opcode::IntIsTrue | Opcode::IntIsZero => {
                chain.emit(op.clone())?;
                self.narrow_result(chain.ctx, &op, &IntBound::new(0, 1))
            }
            Opcode::IntAddOvf | Opcode::IntSubOvf | Opcode::IntMulOvf => self.optimize_ovf(op, chain),
            Opcode::ArraylenGc | Opcode::Strlen => self.optimize_length(op, chain),
            Opcode::Strgetitem | Opcode::GetarrayitemGc | Opcode::GetarrayitemGcPure => {
                self.optimize_item_read(op, chain)
            }
            _ => chain.emit(op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::ir::{parse, BoxAllocator, Trace};
    use crate::opt::core::Optimizer;

    fn run(text: &str) -> (Trace, Optimizer) {
        let (trace, _) = parse(text).unwrap();
        let ctx = OptContext::new(Policy::default(), BoxAllocator::after(trace.max_box_id()));
        let mut opt = Optimizer::new(ctx, vec![Box::new(OptIntBounds::new())]);
        opt.ctx.setup_inputargs(&trace.inputargs);
        opt.send_all(trace.ops.clone()).unwrap();
        let ops = opt.take_output();
        (Trace::new(trace.inputargs, ops), opt)
    }

    fn opcodes(trace: &Trace) -> Vec<Opcode> {
        trace.ops.iter().map(|op| op.opcode).collect()
    }

    #[test]
    fn test_comparison_folded_after_guard() {
        let (out, _) = run(
            "[i0]
            i1 = int_lt(i0, 10)
            guard_true(i1) []
            i2 = int_lt(i0, 20)
            guard_true(i2) []
            jump(i0)",
        );
        assert_eq!(opcodes(&out), vec![Opcode::IntLt, Opcode::GuardTrue, Opcode::GuardTrue, Opcode::Jump]);
        // the folded comparison left a constant behind
        assert_eq!(out.ops[2].args[0], Operand::int(1));
    }

    #[test]
    fn test_backward_through_add() {
        let (_, opt) = run(
            "[i0]
            i1 = int_ge(i0, 0)
            guard_true(i1) []
            i4 = int_lt(i0, 100)
            guard_true(i4) []
            i2 = int_add(i0, 5)
            i3 = int_lt(i2, 10)
            guard_true(i3) []
            jump(i0)",
        );
        let b = opt.ctx.intbound_of(BoxRef::int(0).into());
        assert_eq!(b, IntBound::new(0, 4));
    }

    #[test]
    fn test_wrapping_add_keeps_guard() {
        // i0 + 1 wraps to i64::MIN when i0 is i64::MAX
        let (out, _) = run(
            "[i0]
            i1 = int_ge(i0, 0)
            guard_true(i1) []
            i2 = int_add(i0, 1)
            i3 = int_gt(i2, 0)
            guard_true(i3) []
            finish(i2)",
        );
        assert_eq!(
            opcodes(&out),
            vec![Opcode::IntGe, Opcode::GuardTrue, Opcode::IntAdd, Opcode::IntGt, Opcode::GuardTrue, Opcode::Finish]
        );
    }

    #[test]
    fn test_one_sided_backward_through_add_is_ignored() {
        let (_, opt) = run(
            "[i0]
            i1 = int_ge(i0, 0)
            guard_true(i1) []
            i2 = int_add(i0, 5)
            i3 = int_lt(i2, 10)
            guard_true(i3) []
            jump(i0)",
        );
        let b = opt.ctx.intbound_of(BoxRef::int(0).into());
        assert_eq!(b, IntBound::nonnegative());
    }

    #[test]
    fn test_bounded_add_still_narrows() {
        let (out, _) = run(
            "[i0]
            i1 = int_and(i0, 255)
            i2 = int_add(i1, 1)
            i3 = int_gt(i2, 0)
            guard_true(i3) []
            jump(i2)",
        );
        assert_eq!(opcodes(&out), vec![Opcode::IntAnd, Opcode::IntAdd, Opcode::GuardTrue, Opcode::Jump]);
        assert_eq!(out.ops[2].args[0], Operand::int(1));
    }

    #[test]
    fn test_ovf_downgrade_drops_guard() {
        let (out, _) = run(
            "[i0]
            i1 = int_and(i0, 255)
            i2 = int_add_ovf(i1, 1)
            guard_no_overflow() []
            jump(i2)",
        );
        assert_eq!(opcodes(&out), vec![Opcode::IntAnd, Opcode::IntAdd, Opcode::Jump]);
    }

    #[test]
    fn test_guard_overflow_after_downgrade_is_invalid() {
        let (trace, _) = parse(
            "[i0]
            i1 = int_and(i0, 255)
            i2 = int_add_ovf(i1, 1)
            guard_overflow() []
            jump(i2)",
        )
        .unwrap();
        let ctx = OptContext::new(Policy::default(), BoxAllocator::after(trace.max_box_id()));
        let mut opt = Optimizer::new(ctx, vec![Box::new(OptIntBounds::new())]);
        let err = opt.send_all(trace.ops).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidLoop);
    }

    #[test]
    fn test_mod_power_of_two_becomes_and() {
        let (out, _) = run(
            "[i0]
            i1 = int_and(i0, 1023)
            i2 = int_mod(i1, 8)
            jump(i2)",
        );
        assert_eq!(out.ops[1].opcode, Opcode::IntAnd);
        assert_eq!(out.ops[1].args[1], Operand::int(7));
    }

    #[test]
    fn test_interval_collapses_to_constant() {
        let (out, _) = run(
            "[i0]
            i1 = int_ge(i0, 3)
            guard_true(i1) []
            i2 = int_le(i0, 3)
            guard_true(i2) []
            i3 = int_add(i0, 1)
            jump(i3)",
        );
        let add = out.ops.iter().find(|op| op.opcode == Opcode::IntAdd).unwrap();
        assert_eq!(add.args[0], Operand::int(3));
    }

    #[test]
    fn test_length_feeds_array_bound() {
        let (_, mut opt) = run(
            "[p0]
            i1 = arraylen_gc(p0)
            i2 = int_gt(i1, 5)
            guard_true(i2) []
            jump(p0)",
        );
        let pid = opt.ctx.value_of(BoxRef::ptr(0).into());
        let lb = opt.ctx.value(pid).lenbound.clone().unwrap();
        assert_eq!(lb.bound, IntBound::lower_bounded(6));
    }

    #[test]
    fn test_signext_in_range_is_removed() {
        let (out, _) = run(
            "[i0]
            i1 = int_and(i0, 127)
            i2 = int_signext(i1, 1)
            jump(i2)",
        );
        assert_eq!(opcodes(&out), vec![Opcode::IntAnd, Opcode::Jump]);
    }
}
