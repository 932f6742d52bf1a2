//! Loop peeling
//!
//! The body is optimized twice. The first run yields the preamble, which
//! ends in a jump carrying the inputs of the entry state plus a few values
//! the preamble already computed (short boxes). The second run starts from
//! that state, rebuilt on the label's boxes, and yields the steady-state
//! loop. The operations that recompute the short boxes from the entry
//! state's inputs become the short preamble, through which bridges enter the
//! loop directly.

use super::build_chain;
use super::core::{OptContext, Optimizer};
use super::shortpreamble::ShortPreamble;
use super::value::ValueId;
use super::virtualstate::VirtualState;
use crate::config::OptimizerConfig;
use crate::error::{OptError, Result};
use crate::ir::{BoxAllocator, BoxRef, Descr, Op, Opcode, Operand, Trace};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use tracing::{debug, debug_span};

/// Result of peeling one loop
#[derive(Debug)]
pub struct Peeled {
    /// The first iteration, ending in a jump to the label
    pub preamble: Vec<Op>,
    /// Boxes of the label, the steady-state loop's inputs
    pub label_args: Vec<BoxRef>,
    /// The steady-state loop, starting with its label
    pub body: Vec<Op>,
    pub short_preamble: Option<ShortPreamble>,
    pub quasi_immutable_deps: Vec<Descr>,
}

impl Peeled {
    pub fn loop_guards(&self) -> usize {
        self.body.iter().filter(|op| op.is_guard()).count()
    }
}

/// Original boxes to the boxes of the second run
#[derive(Default)]
struct Renaming {
    boxes: HashMap<BoxRef, BoxRef>,
}

impl Renaming {
    fn fresh(&mut self, b: BoxRef, ctx: &mut OptContext) -> BoxRef {
        let renamed = ctx.fresh_box(b.kind);
        self.boxes.insert(b, renamed);
        renamed
    }

    fn operand(&self, operand: Operand) -> Operand {
        match operand {
            Operand::Box(b) => Operand::Box(self.boxes.get(&b).copied().unwrap_or(b)),
            Operand::Const(_) => operand,
        }
    }

    fn op(&mut self, op: &Op, ctx: &mut OptContext) -> Op {
        let mut op = op.clone();
        for arg in op.args.iter_mut() {
            *arg = self.operand(*arg);
        }
        if let Some(fail_args) = op.fail_args.as_mut() {
            for arg in fail_args.iter_mut() {
                *arg = self.operand(*arg);
            }
        }
        op.resume = None;
        op.result = op.result.map(|r| self.fresh(r, ctx));
        op
    }
}

fn remap(operand: Operand, map: &HashMap<BoxRef, Operand>) -> Operand {
    match operand {
        Operand::Box(b) => map.get(&b).copied().unwrap_or(operand),
        Operand::Const(_) => operand,
    }
}

/// `op` with its arguments translated and a new result box
fn translate(op: &Op, map: &HashMap<BoxRef, Operand>, result: BoxRef) -> Op {
    let mut op = op.clone();
    for arg in op.args.iter_mut() {
        *arg = remap(*arg, map);
    }
    op.result = Some(result);
    op
}

/// Send a short operation, followed by its overflow guard if it has one
fn send_short(opt: &mut Optimizer, op: Op) -> Result<()> {
    let ovf = op.opcode.is_ovf();
    opt.send(op)?;
    if ovf {
        opt.send(Op::new(Opcode::GuardNoOverflow, Vec::new(), None))?;
    }
    Ok(())
}

/// Operations of the preamble whose results the loop can receive as inputs
///
/// An operation qualifies once all its arguments are constants, inputs of
/// the entry state or results of operations that already qualified, so the
/// selection is in dependency order.
fn select_short_ops(opt: &Optimizer, inputs: &[Operand], limit: usize) -> Vec<Op> {
    let ctx = &opt.ctx;
    let mut available: HashSet<BoxRef> = inputs.iter().filter_map(|o| o.as_box()).collect();
    let mut candidates = opt.short_preamble_candidates();
    let mut selected = Vec::new();
    loop {
        let before = selected.len();
        candidates.retain(|op| {
            let Some(result) = op.result.and_then(|r| ctx.resolve(Operand::Box(r)).as_box()) else {
                return false;
            };
            if available.contains(&result) || ctx.is_virtual_operand(Operand::Box(result)) {
                return false;
            }
            let args: Vec<Operand> = op.args.iter().map(|a| ctx.resolve(*a)).collect();
            if args.iter().any(|a| ctx.is_virtual_operand(*a)) {
                return false;
            }
            if !args.iter().all(|a| a.as_box().map_or(true, |b| available.contains(&b))) {
                return true;
            }
            let mut short = op.clone();
            short.args = args;
            short.result = Some(result);
            available.insert(result);
            selected.push(short);
            false
        });
        if selected.len() == before {
            break;
        }
    }
    if selected.len() > limit {
        debug!(count = selected.len(), limit, "too many short boxes, none kept");
        selected.clear();
    }
    selected
}

/// Peel `trace`, a loop whose final jump goes back to its own start
///
/// Returns `Ok(None)` when the state at the end of the peeled iteration
/// does not fit the state it was entered with. The caller then optimizes
/// the loop without peeling.
pub fn unroll(trace: &Trace, config: &OptimizerConfig, target: &Descr) -> Result<Option<Peeled>> {
    let jump = trace
        .final_op()
        .filter(|op| op.opcode == Opcode::Jump)
        .cloned()
        .ok_or_else(|| OptError::internal("peeling needs a trace ending in a jump"))?;
    if jump.num_args() != trace.inputargs.len() {
        return Err(OptError::internal(format!(
            "jump passes {} values to a loop with {} inputs",
            jump.num_args(),
            trace.inputargs.len()
        )));
    }
    let body = &trace.ops[..trace.ops.len() - 1];
    let policy = config.policy;

    // ==================== Preamble ====================

    let preamble_span = debug_span!("preamble").entered();
    let mut ctx = OptContext::new(policy, BoxAllocator::after(trace.max_box_id()));
    ctx.call_pure_results = trace.call_pure_results.clone();
    let mut first = Optimizer::new(ctx, build_chain(config, None));
    first.ctx.setup_inputargs(&trace.inputargs);
    first.send_all(body.iter().cloned())?;
    first.flush()?;
    first.ctx.kill_huge_bounds(policy.huge_bound_divisor);

    let exit_values: Vec<ValueId> = jump.args.iter().map(|a| first.ctx.value_of(*a)).collect();
    let state = VirtualState::capture(&first.ctx, &exit_values);
    let leaves: Vec<Operand> = state
        .make_inputargs(&first.ctx, &exit_values)?
        .into_iter()
        .map(|id| first.ctx.value(id).operand)
        .collect();
    let short_ops = select_short_ops(&first, &leaves, policy.max_short_preamble_ops);
    let short_results: Vec<BoxRef> = short_ops.iter().filter_map(|op| op.result).collect();
    debug!(
        inputs = leaves.len(),
        short_boxes = short_results.len(),
        virtuals = state.has_virtuals(),
        "entry state captured"
    );

    let mut preamble_jump = leaves.clone();
    preamble_jump.extend(short_results.iter().map(|b| Operand::Box(*b)));
    first.with_sink(|chain| chain.emit(Op::new(Opcode::Jump, preamble_jump, None).with_descr(target.clone())))?;
    let preamble = first.take_output();
    drop(preamble_span);

    // ==================== Peeled loop ====================

    let peeled_span = debug_span!("peeled_loop").entered();
    let mut ctx = OptContext::new(policy, first.ctx.boxes);
    ctx.call_pure_results = trace.call_pure_results.clone();
    let label_args: Vec<BoxRef> = state
        .leaf_kinds()
        .into_iter()
        .chain(short_results.iter().map(|b| b.kind))
        .map(|kind| ctx.fresh_box(kind))
        .collect();
    let mut second = Optimizer::new(ctx, build_chain(config, None));
    second.ctx.setup_inputargs(&label_args);
    let (leaf_boxes, short_boxes) = label_args.split_at(leaves.len());

    let entry = state.import(&mut second.ctx, leaf_boxes)?;
    let mut renaming = Renaming::default();
    for (input, id) in trace.inputargs.iter().zip(&entry) {
        let renamed = renaming.fresh(*input, &mut second.ctx);
        second.ctx.make_equal(renamed, *id)?;
    }

    // the short boxes arrive through the label: replay their operations
    // so the passes know what they hold
    let mut outer: HashMap<BoxRef, Operand> = HashMap::default();
    for (leaf, b) in leaves.iter().zip(leaf_boxes) {
        if let Some(leaf) = leaf.as_box() {
            outer.insert(leaf, Operand::Box(*b));
        }
    }
    for (result, b) in short_results.iter().zip(short_boxes) {
        outer.insert(*result, Operand::Box(*b));
    }
    second.ctx.emitting_disabled = true;
    for (op, b) in short_ops.iter().zip(short_boxes) {
        send_short(&mut second, translate(op, &outer, *b))?;
    }
    second.ctx.emitting_disabled = false;

    for op in body {
        let op = renaming.op(op, &mut second.ctx);
        second.send(op)?;
    }
    second.flush()?;

    let end_values: Vec<ValueId> = jump
        .args
        .iter()
        .map(|a| second.ctx.value_of(renaming.operand(*a)))
        .collect();
    let to_force = state.virtuals_to_force(&second.ctx, &end_values);
    second.with_sink(|chain| {
        for id in to_force {
            chain.force(id)?;
        }
        Ok(())
    })?;
    let end_state = VirtualState::capture(&second.ctx, &end_values);
    if !state.generalization_of(&end_state) {
        debug!(entry = %state, end = %end_state, "loop does not return to its entry state");
        return Ok(None);
    }

    let mut inner: HashMap<BoxRef, Operand> = HashMap::default();
    let mut loop_jump = Vec::with_capacity(label_args.len());
    for (leaf, id) in leaves.iter().zip(state.make_inputargs(&second.ctx, &end_values)?) {
        let value = second.ctx.value(id).operand;
        if let Some(leaf) = leaf.as_box() {
            inner.insert(leaf, value);
        }
        loop_jump.push(value);
    }
    for op in &short_ops {
        let Some(old) = op.result else {
            continue;
        };
        let fresh = second.ctx.fresh_box(old.kind);
        send_short(&mut second, translate(op, &inner, fresh))?;
        let value = second.ctx.resolve(Operand::Box(fresh));
        inner.insert(old, value);
        loop_jump.push(value);
    }
    second.send(Op::new(Opcode::Jump, loop_jump, None).with_descr(target.clone()))?;

    let label = Op::new(Opcode::Label, label_args.iter().map(|b| Operand::Box(*b)).collect(), None)
        .with_descr(target.clone());
    let mut loop_ops = vec![label];
    loop_ops.extend(second.take_output());
    drop(peeled_span);

    // ==================== Short preamble ====================

    let _span = debug_span!("short_preamble").entered();
    let inputargs: Vec<BoxRef> = state
        .leaf_kinds()
        .into_iter()
        .map(|kind| second.ctx.fresh_box(kind))
        .collect();
    let inputs: Vec<Operand> = inputargs.iter().map(|b| Operand::Box(*b)).collect();
    let mut ops = state.entry_guards(&mut second.ctx, &inputs);
    let mut map: HashMap<BoxRef, Operand> = HashMap::default();
    for (leaf, input) in leaves.iter().zip(&inputs) {
        if let Some(leaf) = leaf.as_box() {
            map.insert(leaf, *input);
        }
    }
    let mut jump_args = inputs.clone();
    for op in &short_ops {
        let Some(old) = op.result else {
            continue;
        };
        let fresh = second.ctx.fresh_box(old.kind);
        let short = translate(op, &map, fresh);
        let ovf = short.opcode.is_ovf();
        ops.push(short);
        if ovf {
            ops.push(Op::new(Opcode::GuardNoOverflow, Vec::new(), None));
        }
        map.insert(old, Operand::Box(fresh));
        jump_args.push(Operand::Box(fresh));
    }
    let short_preamble = if ops.len() > policy.max_short_preamble_ops {
        debug!(ops = ops.len(), "short preamble too long, dropped");
        None
    } else {
        debug!(ops = ops.len(), "short preamble built");
        Some(ShortPreamble {
            inputargs,
            ops,
            jump_args,
            virtual_state: state,
            target: target.clone(),
        })
    };

    let mut quasi_immutable_deps = std::mem::take(&mut first.ctx.quasi_immutable_deps);
    for descr in std::mem::take(&mut second.ctx.quasi_immutable_deps) {
        if !quasi_immutable_deps.contains(&descr) {
            quasi_immutable_deps.push(descr);
        }
    }

    Ok(Some(Peeled {
        preamble,
        label_args,
        body: loop_ops,
        short_preamble,
        quasi_immutable_deps,
    }))
}
