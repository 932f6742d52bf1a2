//! Optimizer core
//!
//! [`OptContext`] owns everything the passes share: the box → value map,
//! the value and virtual arenas, the pure-operation memo and the output
//! list. Passes are chained: [`deliver`] hands an operation to pass `i`,
//! which forwards (possibly rewritten) operations to pass `i + 1` through
//! its [`Chain`]. Past the last pass sits the final sink, which forces any
//! remaining virtual arguments, freezes guard resume data and appends to
//! the output.
//!
//! While a pass is running it is taken out of its slot, so a pass can only
//! ever emit downstream. Forcing a virtual emits the allocation downstream
//! of whoever forced it, which keeps the chain free of re-entry.

use super::intutils::IntBound;
use super::resume;
use super::value::{OptValue, ValueId};
use super::virtuals::{Materialization, VirtualId, VirtualInfo, VirtualKind};
use crate::config::Policy;
use crate::error::{OptError, Result};
use crate::ir::{BoxAllocator, BoxKind, BoxRef, Const, Descr, Op, Opcode, Operand};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use tracing::trace;

/// Key of the pure-operation memo
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PureKey {
    pub opcode: Opcode,
    pub descr: Option<Descr>,
    pub args: Vec<Operand>,
}

/// State shared by every pass of one optimizer run
pub struct OptContext {
    pub policy: Policy,
    pub boxes: BoxAllocator,
    values: Vec<OptValue>,
    /// Emission sequence number at which each value was created
    value_seq: Vec<u64>,
    box_values: HashMap<BoxRef, ValueId>,
    const_values: HashMap<Const, ValueId>,
    virtuals: Vec<VirtualInfo>,
    pure_ops: HashMap<PureKey, ValueId>,
    producers: HashMap<BoxRef, Op>,
    bool_values: HashSet<ValueId>,
    /// Allocations emitted by this run, with their emission sequence number
    fresh: HashMap<ValueId, u64>,
    distinct: HashSet<(ValueId, ValueId)>,
    seq: u64,
    pub output: Vec<Op>,
    /// Replay mode: operations update the value map but are not output
    pub emitting_disabled: bool,
    /// Lazy stores of virtuals into non-virtuals, handed to the next guard
    pub pending_fields: Vec<Op>,
    pub quasi_immutable_deps: Vec<Descr>,
    pub emitted_guards: usize,
    /// Results of `call_pure` recorded by the tracer, keyed by constant args
    pub call_pure_results: HashMap<Vec<Const>, Const>,
}

impl OptContext {
    pub fn new(policy: Policy, boxes: BoxAllocator) -> Self {
        Self {
            policy,
            boxes,
            values: Vec::new(),
            value_seq: Vec::new(),
            box_values: HashMap::default(),
            const_values: HashMap::default(),
            virtuals: Vec::new(),
            pure_ops: HashMap::default(),
            producers: HashMap::default(),
            bool_values: HashSet::default(),
            fresh: HashMap::default(),
            distinct: HashSet::default(),
            seq: 1,
            output: Vec::new(),
            emitting_disabled: false,
            pending_fields: Vec::new(),
            quasi_immutable_deps: Vec::new(),
            emitted_guards: 0,
            call_pure_results: HashMap::default(),
        }
    }

    // ==================== Values ====================

    fn push_value(&mut self, value: OptValue, seq: u64) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(value);
        self.value_seq.push(seq);
        id
    }

    /// Value of an operand, created as `Unknown` on first reference
    pub fn value_of(&mut self, operand: Operand) -> ValueId {
        match operand {
            Operand::Box(b) => {
                if let Some(&id) = self.box_values.get(&b) {
                    return id;
                }
                let id = self.push_value(OptValue::new(operand), self.seq);
                self.box_values.insert(b, id);
                id
            }
            Operand::Const(c) => {
                if let Some(&id) = self.const_values.get(&c) {
                    return id;
                }
                let id = self.push_value(OptValue::new(operand), 0);
                self.const_values.insert(c, id);
                id
            }
        }
    }

    /// Register the trace inputs as values that exist before any operation
    pub fn setup_inputargs(&mut self, inputargs: &[BoxRef]) {
        for b in inputargs {
            if !self.box_values.contains_key(b) {
                let id = self.push_value(OptValue::new(Operand::Box(*b)), 0);
                self.box_values.insert(*b, id);
            }
        }
    }

    pub fn lookup(&self, b: BoxRef) -> Option<ValueId> {
        self.box_values.get(&b).copied()
    }

    pub fn value(&self, id: ValueId) -> &OptValue {
        &self.values[id.index()]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut OptValue {
        &mut self.values[id.index()]
    }

    /// Every value id allocated so far
    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> {
        (0..self.values.len() as u32).map(ValueId)
    }

    /// Bind `b` to an existing value
    ///
    /// A box is bound once per run. During replay the binding may be
    /// overwritten, since replayed boxes already carry imported values.
    pub fn make_equal(&mut self, b: BoxRef, id: ValueId) -> Result<()> {
        match self.box_values.get(&b) {
            Some(&old) if old == id => Ok(()),
            Some(_) if !self.emitting_disabled => {
                Err(OptError::internal(format!("box {} bound twice", b)))
            }
            _ => {
                self.box_values.insert(b, id);
                Ok(())
            }
        }
    }

    /// Bind `b` to whatever `operand` currently denotes
    pub fn make_equal_to(&mut self, b: BoxRef, operand: Operand) -> Result<()> {
        let id = self.value_of(operand);
        self.make_equal(b, id)
    }

    pub fn make_constant(&mut self, id: ValueId, c: Const) -> Result<()> {
        self.values[id.index()].make_constant(c)
    }

    pub fn make_constant_box(&mut self, b: BoxRef, c: Const) -> Result<()> {
        let id = self.value_of(Operand::Box(b));
        self.make_constant(id, c)
    }

    pub fn make_constant_int(&mut self, b: BoxRef, v: i64) -> Result<()> {
        self.make_constant_box(b, Const::Int(v))
    }

    /// Current representative of an operand, without creating a value
    pub fn resolve(&self, operand: Operand) -> Operand {
        match operand {
            Operand::Box(b) => match self.lookup(b) {
                Some(id) => self.value(id).operand,
                None => operand,
            },
            Operand::Const(_) => operand,
        }
    }

    pub fn get_constant(&self, operand: Operand) -> Option<Const> {
        match operand {
            Operand::Const(c) => Some(c),
            Operand::Box(b) => self.lookup(b).and_then(|id| self.value(id).get_constant()),
        }
    }

    pub fn get_constant_int(&self, operand: Operand) -> Option<i64> {
        self.get_constant(operand).and_then(|c| c.as_int())
    }

    /// Interval of an integer operand
    pub fn intbound_of(&self, operand: Operand) -> IntBound {
        match operand {
            Operand::Const(Const::Int(v)) => IntBound::from_constant(v),
            Operand::Const(_) => IntBound::unbounded(),
            Operand::Box(b) => match self.lookup(b) {
                Some(id) => self.value(id).intbound,
                None => IntBound::unbounded(),
            },
        }
    }

    pub fn fresh_box(&mut self, kind: BoxKind) -> BoxRef {
        self.boxes.fresh(kind)
    }

    /// Forget interval ends beyond `i64::MAX / divisor`
    pub fn kill_huge_bounds(&mut self, divisor: i64) {
        let limit = i64::MAX / divisor.max(1);
        for value in &mut self.values {
            if !value.is_constant() {
                value.intbound.kill_huge(limit);
            }
        }
    }

    // ==================== Virtuals ====================

    /// Turn the value of `keybox` into a virtual of the given shape
    pub fn new_virtual(&mut self, keybox: BoxRef, source: Op, kind: VirtualKind) -> ValueId {
        let id = self.value_of(Operand::Box(keybox));
        let virt = VirtualId(self.virtuals.len() as u32);
        let class = kind.known_class();
        self.virtuals.push(VirtualInfo {
            keybox,
            source,
            kind,
            state: Materialization::Virtual,
        });
        let value = self.value_mut(id);
        value.virt = Some(virt);
        value.make_nonnull();
        if let Some(class) = class {
            value.make_constant_class(class);
        }
        id
    }

    /// The virtual behind `id`, if it is still unmaterialized
    pub fn pending_virtual(&self, id: ValueId) -> Option<VirtualId> {
        let virt = self.value(id).virt?;
        if self.virtuals[virt.index()].is_virtual() {
            Some(virt)
        } else {
            None
        }
    }

    pub fn is_virtual(&self, id: ValueId) -> bool {
        self.pending_virtual(id).is_some()
    }

    pub fn is_virtual_operand(&self, operand: Operand) -> bool {
        match operand {
            Operand::Box(b) => self.lookup(b).map(|id| self.is_virtual(id)).unwrap_or(false),
            Operand::Const(_) => false,
        }
    }

    pub fn virtual_info(&self, virt: VirtualId) -> &VirtualInfo {
        &self.virtuals[virt.index()]
    }

    pub fn virtual_info_mut(&mut self, virt: VirtualId) -> &mut VirtualInfo {
        &mut self.virtuals[virt.index()]
    }

    /// Shape of the pending virtual behind `id`
    pub fn virtual_kind(&self, id: ValueId) -> Option<&VirtualKind> {
        self.pending_virtual(id).map(|v| &self.virtuals[v.index()].kind)
    }

    pub fn virtual_kind_mut(&mut self, id: ValueId) -> Option<&mut VirtualKind> {
        let virt = self.pending_virtual(id)?;
        Some(&mut self.virtuals[virt.index()].kind)
    }

    /// Shape recorded for a virtual that has since been forced
    pub fn forced_kind(&self, id: ValueId) -> Option<&VirtualKind> {
        let virt = self.value(id).virt?;
        let info = &self.virtuals[virt.index()];
        if info.is_virtual() {
            None
        } else {
            Some(&info.kind)
        }
    }

    // ==================== Pure Memo ====================

    pub fn pure_key(&self, opcode: Opcode, args: &[Operand], descr: Option<Descr>) -> PureKey {
        PureKey {
            opcode,
            descr,
            args: args.iter().map(|a| self.resolve(*a)).collect(),
        }
    }

    pub fn op_key(&self, op: &Op) -> PureKey {
        self.pure_key(op.opcode, &op.args, op.descr.clone())
    }

    pub fn get_pure(&self, key: &PureKey) -> Option<ValueId> {
        self.pure_ops.get(key).copied()
    }

    pub fn register_pure(&mut self, key: PureKey, result: ValueId) {
        self.pure_ops.entry(key).or_insert(result);
    }

    /// Record the synthesized fact `opcode(args) == result`
    pub fn pure(&mut self, opcode: Opcode, args: &[Operand], result: Operand) {
        let key = self.pure_key(opcode, args, None);
        let id = self.value_of(result);
        self.register_pure(key, id);
    }

    /// Record the facts implied by an emitted arithmetic operation
    pub fn pure_reverse(&mut self, op: &Op) {
        let Some(result) = op.result.map(Operand::Box) else {
            return;
        };
        match op.opcode {
            Opcode::IntAdd => {
                let (a, b) = (op.arg(0), op.arg(1));
                self.pure(Opcode::IntAdd, &[b, a], result);
                self.pure(Opcode::IntSub, &[result, b], a);
                self.pure(Opcode::IntSub, &[result, a], b);
            }
            Opcode::IntSub => {
                let (a, b) = (op.arg(0), op.arg(1));
                self.pure(Opcode::IntAdd, &[result, b], a);
                self.pure(Opcode::IntSub, &[a, result], b);
            }
            Opcode::FloatMul => {
                self.pure(Opcode::FloatMul, &[op.arg(1), op.arg(0)], result);
            }
            Opcode::FloatNeg => {
                self.pure(Opcode::FloatNeg, &[result], op.arg(0));
            }
            _ => {}
        }
    }

    // ==================== Facts ====================

    pub fn is_bool(&self, id: ValueId) -> bool {
        self.bool_values.contains(&id)
    }

    /// The emitted operation that defined `b`
    pub fn producer(&self, b: BoxRef) -> Option<&Op> {
        self.producers.get(&b)
    }

    pub fn record_distinct(&mut self, a: ValueId, b: ValueId) {
        if a != b {
            self.distinct.insert((a.min(b), a.max(b)));
        }
    }

    /// The two values can never be the same object at runtime
    ///
    /// True after a disequality guard, between two allocations of this
    /// run, and between an allocation and anything that existed before that
    /// allocation happened.
    pub fn known_distinct(&self, a: ValueId, b: ValueId) -> bool {
        if a == b {
            return false;
        }
        if self.distinct.contains(&(a.min(b), a.max(b))) {
            return true;
        }
        let (va, vb) = (self.value(a), self.value(b));
        if let (Some(ca), Some(cb)) = (va.get_constant(), vb.get_constant()) {
            return ca != cb;
        }
        match (self.fresh.get(&a), self.fresh.get(&b)) {
            (Some(_), Some(_)) => true,
            (Some(&sa), None) => vb.is_constant() || self.value_seq[b.index()] < sa,
            (None, Some(&sb)) => va.is_constant() || self.value_seq[a.index()] < sb,
            (None, None) => false,
        }
    }

    pub fn record_quasi_immutable_dep(&mut self, descr: Descr) {
        if !self.quasi_immutable_deps.contains(&descr) {
            self.quasi_immutable_deps.push(descr);
        }
    }
}

/// One link of the optimization chain
pub trait Pass {
    fn name(&self) -> &'static str;

    /// Handle one operation, forwarding whatever should survive
    fn propagate(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()>;

    /// End of the trace: emit anything still held back
    fn flush(&mut self, _chain: &mut Chain<'_>) -> Result<()> {
        Ok(())
    }

    /// Operations whose results this pass could hand to a peeled iteration
    fn produce_potential_short_preamble_ops(&self, _ctx: &OptContext, _out: &mut Vec<Op>) {}
}

/// The downstream half of the chain, as seen by one pass
pub struct Chain<'a> {
    pub ctx: &'a mut OptContext,
    passes: &'a mut [Option<Box<dyn Pass>>],
    next: usize,
}

impl<'a> Chain<'a> {
    /// Forward an operation to the next link
    pub fn emit(&mut self, op: Op) -> Result<()> {
        deliver(&mut *self.ctx, &mut *self.passes, self.next, op)
    }

    /// Emit `opcode(args)` into a fresh result box
    pub fn emit_new(
        &mut self,
        opcode: Opcode,
        args: Vec<Operand>,
        descr: Option<Descr>,
        kind: BoxKind,
    ) -> Result<Operand> {
        let result = self.ctx.fresh_box(kind);
        let mut op = Op::new(opcode, args, Some(result));
        op.descr = descr;
        self.emit(op)?;
        Ok(Operand::Box(result))
    }

    pub fn value(&mut self, operand: Operand) -> ValueId {
        self.ctx.value_of(operand)
    }
}

/// Hand `op` to pass `index`, or to the final sink past the last pass
pub(crate) fn deliver(
    ctx: &mut OptContext,
    passes: &mut [Option<Box<dyn Pass>>],
    index: usize,
    op: Op,
) -> Result<()> {
    if index >= passes.len() {
        return finalize(ctx, passes, op);
    }
    let mut pass = passes[index]
        .take()
        .ok_or_else(|| OptError::internal(format!("pass {} re-entered", index)))?;
    let result = {
        let mut chain = Chain {
            ctx: &mut *ctx,
            passes: &mut *passes,
            next: index + 1,
        };
        pass.propagate(op, &mut chain)
    };
    passes[index] = Some(pass);
    result
}

/// The end of the chain
fn finalize(ctx: &mut OptContext, passes: &mut [Option<Box<dyn Pass>>], mut op: Op) -> Result<()> {
    let end = passes.len();
    for i in 0..op.args.len() {
        let id = ctx.value_of(op.args[i]);
        if ctx.is_virtual(id) {
            let mut chain = Chain {
                ctx: &mut *ctx,
                passes: &mut *passes,
                next: end,
            };
            chain.force(id)?;
        }
        op.args[i] = ctx.value(id).operand;
    }
    ctx.seq += 1;

    if op.is_guard() {
        if op.opcode == Opcode::GuardValue && op.num_args() == 2 {
            let id = ctx.value_of(op.arg(0));
            if ctx.is_bool(id) {
                match op.arg(1).const_int() {
                    Some(0) => op.opcode = Opcode::GuardFalse,
                    Some(1) => op.opcode = Opcode::GuardTrue,
                    _ => {}
                }
                if op.opcode != Opcode::GuardValue {
                    op.args.truncate(1);
                }
            }
        }
        let pending = std::mem::take(&mut ctx.pending_fields);
        resume::store_final_boxes_in_guard(ctx, &mut op, &pending)?;
        ctx.emitted_guards += 1;
    }

    if let Some(result) = op.result {
        let id = ctx.value_of(Operand::Box(result));
        if op.opcode.returns_bool_result() {
            ctx.bool_values.insert(id);
        }
        if op.opcode.is_malloc() && !ctx.emitting_disabled {
            ctx.fresh.insert(id, ctx.seq);
        }
        ctx.producers.insert(result, op.clone());
    }

    if ctx.emitting_disabled {
        trace!(op = %op, "replayed");
        return Ok(());
    }
    trace!(op = %op, "emit");
    ctx.output.push(op);
    Ok(())
}

/// A concrete chain of passes over one shared context
pub struct Optimizer {
    pub ctx: OptContext,
    passes: Vec<Option<Box<dyn Pass>>>,
}

impl Optimizer {
    pub fn new(ctx: OptContext, passes: Vec<Box<dyn Pass>>) -> Self {
        Self {
            ctx,
            passes: passes.into_iter().map(Some).collect(),
        }
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().flatten().map(|p| p.name()).collect()
    }

    /// Push one operation through the whole chain
    pub fn send(&mut self, op: Op) -> Result<()> {
        deliver(&mut self.ctx, &mut self.passes, 0, op)
    }

    pub fn send_all(&mut self, ops: impl IntoIterator<Item = Op>) -> Result<()> {
        for op in ops {
            self.send(op)?;
        }
        Ok(())
    }

    /// Let every pass emit what it still holds, front to back
    pub fn flush(&mut self) -> Result<()> {
        for index in 0..self.passes.len() {
            let mut pass = self.passes[index]
                .take()
                .ok_or_else(|| OptError::internal(format!("pass {} re-entered", index)))?;
            let result = {
                let mut chain = Chain {
                    ctx: &mut self.ctx,
                    passes: self.passes.as_mut_slice(),
                    next: index + 1,
                };
                pass.flush(&mut chain)
            };
            self.passes[index] = Some(pass);
            result?;
        }
        Ok(())
    }

    /// Run `f` with a chain that emits straight into the final sink
    pub fn with_sink<R>(&mut self, f: impl FnOnce(&mut Chain<'_>) -> Result<R>) -> Result<R> {
        let end = self.passes.len();
        let mut chain = Chain {
            ctx: &mut self.ctx,
            passes: self.passes.as_mut_slice(),
            next: end,
        };
        f(&mut chain)
    }

    /// Collect the operations every pass offers for hoisting
    pub fn short_preamble_candidates(&self) -> Vec<Op> {
        let mut out = Vec::new();
        for pass in self.passes.iter().flatten() {
            pass.produce_potential_short_preamble_ops(&self.ctx, &mut out);
        }
        out
    }

    pub fn take_output(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.ctx.output)
    }
}
