//! Loop tokens and short preambles
//!
//! A compiled loop publishes a [`LoopToken`]. Each of its short preambles is
//! a cheap way into the peeled loop: it recomputes, from the loop's entry
//! state alone, the extra values the loop carries around. A bridge ending in
//! a jump to the loop inlines one whose state fits its live values.
//! Otherwise it enters through the full preamble or asks for the loop to be
//! retraced.
//!
//! Tokens are shared between compilations. Everything on them is immutable
//! once published except the retrace bookkeeping, which sits behind a lock.

use super::core::{Chain, Pass};
use super::value::ValueId;
use super::virtualstate::VirtualState;
use crate::config::Policy;
use crate::error::{OptError, Result};
use crate::ir::{BoxRef, Descr, Op, Opcode, Operand, Trace};
use rustc_hash::FxHashMap as HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ShortPreamble {
    /// One box per input of `virtual_state`
    pub inputargs: Vec<BoxRef>,
    /// Entry guards, then the operations recomputing the carried values
    pub ops: Vec<Op>,
    /// Arguments of the jump into the peeled loop
    pub jump_args: Vec<Operand>,
    pub virtual_state: VirtualState,
    pub target: Descr,
}

impl ShortPreamble {
    /// The short preamble as a trace of its own, ending in its jump
    pub fn to_trace(&self) -> Trace {
        let mut ops = self.ops.clone();
        ops.push(Op::new(Opcode::Jump, self.jump_args.clone(), None).with_descr(self.target.clone()));
        Trace::new(self.inputargs.clone(), ops)
    }
}

#[derive(Debug, Default)]
struct RetraceState {
    count: usize,
    failed_states: Vec<VirtualState>,
}

#[derive(Debug)]
pub struct LoopToken {
    pub name: String,
    /// Label of the peeled loop
    pub target: Descr,
    /// Start of the preamble, which takes the loop's original inputs
    pub preamble_target: Descr,
    /// Guards in the peeled loop
    pub loop_guards: usize,
    pub short_preambles: Vec<Arc<ShortPreamble>>,
    retrace: Mutex<RetraceState>,
}

impl LoopToken {
    pub fn new(
        name: impl Into<String>,
        target: Descr,
        preamble_target: Descr,
        loop_guards: usize,
        short_preambles: Vec<Arc<ShortPreamble>>,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            preamble_target,
            loop_guards,
            short_preambles,
            retrace: Mutex::new(RetraceState::default()),
        }
    }

    fn retrace_state(&self) -> MutexGuard<'_, RetraceState> {
        match self.retrace.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// How many retraces bridges have asked for so far
    pub fn retrace_count(&self) -> usize {
        self.retrace_state().count
    }

    pub fn num_failed_states(&self) -> usize {
        self.retrace_state().failed_states.len()
    }

    /// A bridge with entry state `state` fits no short preamble
    ///
    /// Returns `true` if it should enter through the preamble, `false` if
    /// the loop should be retraced for it.
    fn settle_mismatch(&self, state: &VirtualState, policy: &Policy) -> bool {
        let mut retrace = self.retrace_state();
        let known = retrace.failed_states.iter().any(|s| s.generalization_of(state));
        if known || retrace.count >= policy.retrace_limit || self.loop_guards > policy.max_retrace_guards {
            if !known {
                retrace.failed_states.push(state.clone());
            }
            return true;
        }
        retrace.count += 1;
        false
    }
}

/// First link of a bridge's chain: routes the final jump into the loop
pub struct OptInlineShortPreamble {
    token: Arc<LoopToken>,
}

impl OptInlineShortPreamble {
    pub fn new(token: Arc<LoopToken>) -> Self {
        Self { token }
    }

    fn inline(
        &self,
        sp: &ShortPreamble,
        guards: Vec<Op>,
        jump: &Op,
        values: &[ValueId],
        chain: &mut Chain<'_>,
    ) -> Result<()> {
        let leaves = sp.virtual_state.make_inputargs(chain.ctx, values)?;
        let mut map: HashMap<BoxRef, Operand> = HashMap::default();
        for (b, id) in sp.inputargs.iter().zip(&leaves) {
            map.insert(*b, chain.ctx.value(*id).operand);
        }
        debug!(
            token = %self.token.name,
            guards = guards.len(),
            ops = sp.ops.len(),
            "inlining short preamble"
        );
        for mut guard in guards {
            if guard.is_guard() {
                guard.fail_args = Some(jump.args.clone());
            }
            chain.emit(guard)?;
        }
        for op in &sp.ops {
            let mut op = op.clone();
            for arg in op.args.iter_mut() {
                *arg = remap(*arg, &map);
            }
            if let Some(result) = op.result {
                let fresh = chain.ctx.fresh_box(result.kind);
                map.insert(result, Operand::Box(fresh));
                op.result = Some(fresh);
            }
            if op.is_guard() {
                op.fail_args = Some(jump.args.clone());
            }
            chain.emit(op)?;
        }
        let args = sp.jump_args.iter().map(|a| remap(*a, &map)).collect();
        chain.emit(Op::new(Opcode::Jump, args, None).with_descr(sp.target.clone()))
    }
}

fn remap(operand: Operand, map: &HashMap<BoxRef, Operand>) -> Operand {
    match operand {
        Operand::Box(b) => map.get(&b).copied().unwrap_or(operand),
        Operand::Const(_) => operand,
    }
}

impl Pass for OptInlineShortPreamble {
    fn name(&self) -> &'static str {
        "inline_short_preamble"
    }

    fn propagate(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        if op.opcode != Opcode::Jump {
            return chain.emit(op);
        }
        let values: Vec<ValueId> = op.args.iter().map(|a| chain.value(*a)).collect();
        for sp in &self.token.short_preambles {
            for id in sp.virtual_state.virtuals_to_force(chain.ctx, &values) {
                chain.force(id)?;
            }
            let state = VirtualState::capture(chain.ctx, &values);
            let guards = if sp.virtual_state.generalization_of(&state) {
                Vec::new()
            } else {
                match sp.virtual_state.generate_guards(&state, &values, chain.ctx) {
                    Some(guards) => guards,
                    None => continue,
                }
            };
            return self.inline(sp, guards, &op, &values, chain);
        }

        let state = VirtualState::capture(chain.ctx, &values);
        if !self.token.short_preambles.is_empty() && !self.token.settle_mismatch(&state, &chain.ctx.policy) {
            warn!(token = %self.token.name, state = %state, "bridge fits no entry state of its loop");
            return Err(OptError::RetraceLoop);
        }
        debug!(token = %self.token.name, "bridge enters through the preamble");
        chain.emit(op.with_descr(self.token.preamble_target.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BoxAllocator, BoxKind};
    use crate::opt::core::OptContext;
    use crate::opt::intutils::IntBound;

    fn state_of(bound: IntBound) -> VirtualState {
        let mut ctx = OptContext::new(Policy::default(), BoxAllocator::after(10));
        let v = ctx.value_of(Operand::Box(BoxRef::int(1)));
        ctx.value_mut(v).intbound = bound;
        VirtualState::capture(&ctx, &[v])
    }

    fn token(loop_guards: usize) -> LoopToken {
        let target = Descr::target("loop");
        let sp = ShortPreamble {
            inputargs: vec![BoxRef::int(1)],
            ops: Vec::new(),
            jump_args: vec![Operand::Box(BoxRef::int(1))],
            virtual_state: state_of(IntBound::new(0, 10)),
            target: target.clone(),
        };
        LoopToken::new("loop", target, Descr::target("loop_preamble"), loop_guards, vec![Arc::new(sp)])
    }

    #[test]
    fn test_retraces_until_limit_then_remembers_state() {
        let policy = Policy {
            retrace_limit: 2,
            ..Policy::default()
        };
        let token = token(1);
        let wide = state_of(IntBound::unbounded());
        assert!(!token.settle_mismatch(&wide, &policy));
        assert!(!token.settle_mismatch(&wide, &policy));
        assert_eq!(token.retrace_count(), 2);
        assert!(token.settle_mismatch(&wide, &policy));
        assert_eq!(token.num_failed_states(), 1);
        // a state already given up on is not recorded again
        assert!(token.settle_mismatch(&wide, &policy));
        assert_eq!(token.num_failed_states(), 1);
        assert_eq!(token.retrace_count(), 2);
    }

    #[test]
    fn test_guard_heavy_loop_is_not_retraced() {
        let policy = Policy::default();
        let token = token(policy.max_retrace_guards + 1);
        assert!(token.settle_mismatch(&state_of(IntBound::unbounded()), &policy));
        assert_eq!(token.retrace_count(), 0);
    }

    #[test]
    fn test_short_preamble_as_trace() {
        let token = token(0);
        let trace = token.short_preambles[0].to_trace();
        assert_eq!(trace.inputargs, vec![BoxRef::new(1, BoxKind::Int)]);
        let jump = trace.final_op().unwrap();
        assert_eq!(jump.opcode, Opcode::Jump);
        assert!(jump.descr.as_ref().unwrap().is_target());
    }
}
