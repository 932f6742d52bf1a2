//! Common subexpression elimination for side-effect free operations

use super::core::{Chain, OptContext, Pass};
use crate::error::Result;
use crate::ir::eval::{eval_ovf, eval_pure};
use crate::ir::{BoxRef, Const, Op, Opcode, Operand};
use tracing::debug;

pub struct OptPure {
    /// Results of the pure operations that reached the output
    emitted: Vec<BoxRef>,
    /// The last overflow-checked op was folded or reused
    skip_overflow_guard: bool,
}

impl Default for OptPure {
    fn default() -> Self {
        Self::new()
    }
}

impl OptPure {
    pub fn new() -> Self {
        Self {
            emitted: Vec::new(),
            skip_overflow_guard: false,
        }
    }

    fn constant_args(op: &Op, chain: &Chain<'_>) -> Option<Vec<Const>> {
        op.args.iter().map(|a| chain.ctx.get_constant(*a)).collect()
    }

    fn optimize_pure(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        if let Some(args) = Self::constant_args(&op, chain) {
            if let Some(c) = eval_pure(op.opcode, &args) {
                debug!(op = %op, value = %c, "constant folded");
                return chain.ctx.make_constant_box(result, c);
            }
        }
        self.reuse_or_emit(op, result, chain)
    }

    fn optimize_ovf(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        let a = chain.ctx.get_constant_int(op.arg(0));
        let b = chain.ctx.get_constant_int(op.arg(1));
        if let (Some(a), Some(b)) = (a, b) {
            if let Some(v) = eval_ovf(op.opcode, a, b) {
                self.skip_overflow_guard = true;
                return chain.ctx.make_constant_int(result, v);
            }
        }
        let key = chain.ctx.op_key(&op);
        if let Some(hit) = chain.ctx.get_pure(&key) {
            self.skip_overflow_guard = true;
            return chain.ctx.make_equal(result, hit);
        }
        chain.emit(op)?;
        let id = chain.value(Operand::Box(result));
        chain.ctx.register_pure(key, id);
        if chain.ctx.producer(result).is_some() {
            self.emitted.push(result);
        }
        Ok(())
    }

    fn reuse_or_emit(&mut self, op: Op, result: BoxRef, chain: &mut Chain<'_>) -> Result<()> {
        let key = chain.ctx.op_key(&op);
        if let Some(hit) = chain.ctx.get_pure(&key) {
            debug!(op = %op, "reused earlier result");
            return chain.ctx.make_equal(result, hit);
        }
        let reverse = op.clone();
        chain.emit(op)?;
        let id = chain.value(Operand::Box(result));
        chain.ctx.register_pure(key, id);
        chain.ctx.pure_reverse(&reverse);
        if chain.ctx.producer(result).is_some() {
            self.emitted.push(result);
        }
        Ok(())
    }
}

impl Pass for OptPure {
    fn name(&self) -> &'static str {
        "pure"
    }

    fn propagate(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let skip_guard = std::mem::replace(&mut self.skip_overflow_guard, false);
        match op.opcode {
            Opcode::GuardNoOverflow if skip_guard => Ok(()),
            opcode if opcode.is_ovf() => self.optimize_ovf(op, chain),
            opcode if opcode.is_always_pure() => self.optimize_pure(op, chain),
            Opcode::CallPure => match op.result {
                Some(result) => self.reuse_or_emit(op, result, chain),
                None => chain.emit(op),
            },
            _ => chain.emit(op),
        }
    }

    fn produce_potential_short_preamble_ops(&self, ctx: &OptContext, out: &mut Vec<Op>) {
        out.extend(self.emitted.iter().filter_map(|b| ctx.producer(*b)).cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::ir::{parse, BoxAllocator};
    use crate::opt::core::Optimizer;

    fn run(text: &str) -> (Vec<Op>, Optimizer) {
        let (trace, _) = parse(text).unwrap();
        let ctx = OptContext::new(Policy::default(), BoxAllocator::after(trace.max_box_id()));
        let mut opt = Optimizer::new(ctx, vec![Box::new(OptPure::new())]);
        opt.ctx.setup_inputargs(&trace.inputargs);
        opt.send_all(trace.ops).unwrap();
        (opt.take_output(), opt)
    }

    #[test]
    fn test_repeated_expression_is_shared() {
        let (ops, _) = run(
            "[i0, i1]
            i2 = int_add(i0, i1)
            i3 = int_add(i0, i1)
            i4 = int_mul(i2, i3)
            jump(i4)",
        );
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[1].args[0], ops[1].args[1]);
    }

    #[test]
    fn test_constant_folding() {
        let (ops, _) = run(
            "[i0]
            i1 = int_add(3, 4)
            i2 = int_mul(i1, 2)
            jump(i2)",
        );
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].args[0], Operand::int(14));
    }

    #[test]
    fn test_subtraction_undoes_addition() {
        let (ops, _) = run(
            "[i0, i1]
            i2 = int_add(i0, i1)
            i3 = int_sub(i2, i1)
            jump(i3)",
        );
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].args[0], Operand::Box(BoxRef::int(0)));
    }

    #[test]
    fn test_repeated_ovf_op_drops_guard() {
        let (ops, _) = run(
            "[i0, i1]
            i2 = int_add_ovf(i0, i1)
            guard_no_overflow() []
            i3 = int_add_ovf(i0, i1)
            guard_no_overflow() []
            jump(i2, i3)",
        );
        let opcodes: Vec<Opcode> = ops.iter().map(|op| op.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::IntAddOvf, Opcode::GuardNoOverflow, Opcode::Jump]);
    }

    #[test]
    fn test_emitted_results_are_short_preamble_candidates() {
        let (_, opt) = run(
            "[i0]
            i1 = int_lshift(i0, 2)
            jump(i1)",
        );
        let candidates = opt.short_preamble_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].opcode, Opcode::IntLshift);
    }
}
