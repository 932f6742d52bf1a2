//! Entry shapes of compiled loops
//!
//! A `VirtualState` describes the values live at a jump: for each one
//! either what is known about it (constant, class, non-null, interval,
//! length) or, for a virtual, its shape and the states of its contents.
//! The loop compiled for a state can be entered from any jump whose state
//! it generalizes. The non-virtual, non-constant leaves of the state are
//! the loop's actual inputs.

use super::core::OptContext;
use super::intutils::IntBound;
use super::value::{LenBound, Level, OptValue, ValueId};
use super::virtuals::{VirtualKind, VirtualShape};
use crate::error::{OptError, Result};
use crate::ir::{BoxKind, BoxRef, Const, Descr, Op, Opcode, Operand};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::BTreeMap;
use std::fmt;

/// What is known about one non-virtual value
#[derive(Debug, Clone, PartialEq)]
pub struct ValueFacts {
    pub kind: BoxKind,
    pub level: Level,
    pub known_class: Option<i64>,
    pub constant: Option<Const>,
    pub intbound: IntBound,
    pub lenbound: Option<LenBound>,
    /// Position among the state's inputs; `None` for constants
    pub leaf: Option<usize>,
}

impl ValueFacts {
    fn of(value: &OptValue, leaf: Option<usize>) -> Self {
        Self {
            kind: value.kind(),
            level: value.level,
            known_class: value.get_constant_class(),
            constant: value.get_constant(),
            intbound: value.intbound,
            lenbound: value.lenbound.clone(),
            leaf,
        }
    }

    fn class(&self) -> Option<i64> {
        if self.level >= Level::KnownClass {
            self.known_class
        } else {
            None
        }
    }

    fn is_nonnull(&self) -> bool {
        match self.constant {
            Some(c) => c.nonnull(),
            None => {
                self.level >= Level::NonNull || (self.kind == BoxKind::Int && !self.intbound.contains(0))
            }
        }
    }

    fn lenbound_generalizes(&self, other: &ValueFacts) -> bool {
        match (&self.lenbound, &other.lenbound) {
            (None, _) => true,
            (Some(mine), Some(theirs)) => mine.mode == theirs.mode && mine.bound.contains_bound(&theirs.bound),
            (Some(_), None) => false,
        }
    }

    /// Every value described by `other` is also described by `self`
    fn generalizes(&self, other: &ValueFacts) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if let Some(c) = self.constant {
            return other.constant.map(|o| o.same_constant(&c)).unwrap_or(false);
        }
        if self.level >= Level::KnownClass && other.class() != self.known_class {
            return false;
        }
        if self.level >= Level::NonNull && !other.is_nonnull() {
            return false;
        }
        if self.kind == BoxKind::Int && !self.intbound.contains_bound(&other.intbound) {
            return false;
        }
        self.lenbound_generalizes(other)
    }

    /// Guards that narrow a value described by `other` down to `self`
    fn narrowing_guards(
        &self,
        other: &ValueFacts,
        subject: Operand,
        ctx: &mut OptContext,
        out: &mut Vec<Op>,
    ) -> bool {
        if self.kind != other.kind || !self.lenbound_generalizes(other) {
            return false;
        }
        if let Some(c) = self.constant {
            return match other.constant {
                Some(o) => o.same_constant(&c),
                None => {
                    let possible = match c {
                        Const::Int(v) => other.intbound.contains(v),
                        _ => c.nonnull() || !other.is_nonnull(),
                    };
                    if possible {
                        out.push(Op::new(Opcode::GuardValue, vec![subject, Operand::Const(c)], None));
                    }
                    possible
                }
            };
        }
        if let Some(class) = self.class() {
            match other.class() {
                Some(known) if known == class => {}
                Some(_) => return false,
                None => {
                    let opcode = if other.is_nonnull() {
                        Opcode::GuardClass
                    } else {
                        Opcode::GuardNonnullClass
                    };
                    out.push(Op::new(opcode, vec![subject, Operand::int(class)], None));
                }
            }
        } else if self.level >= Level::NonNull && !other.is_nonnull() {
            out.push(Op::new(Opcode::GuardNonnull, vec![subject], None));
        }
        if self.kind == BoxKind::Int && !self.intbound.contains_bound(&other.intbound) {
            let mut meet = other.intbound;
            if meet.intersect(&self.intbound).is_err() {
                return false;
            }
            let wanted = &self.intbound;
            if wanted.has_lower && (!other.intbound.has_lower || other.intbound.lower < wanted.lower) {
                push_bound_guard(ctx, out, Opcode::IntGe, subject, wanted.lower);
            }
            if wanted.has_upper && (!other.intbound.has_upper || other.intbound.upper > wanted.upper) {
                push_bound_guard(ctx, out, Opcode::IntLe, subject, wanted.upper);
            }
        }
        true
    }

    /// Apply these facts to a fresh value standing for the same runtime value
    fn apply(&self, value: &mut OptValue) -> Result<()> {
        if let Some(c) = self.constant {
            return value.make_constant(c);
        }
        if self.level >= Level::NonNull {
            value.make_nonnull();
        }
        if let Some(class) = self.class() {
            value.make_constant_class(class);
        }
        if self.kind == BoxKind::Int {
            value.intbound.intersect(&self.intbound)?;
        }
        if value.lenbound.is_none() {
            value.lenbound = self.lenbound.clone();
        }
        Ok(())
    }
}

fn push_bound_guard(ctx: &mut OptContext, out: &mut Vec<Op>, opcode: Opcode, subject: Operand, limit: i64) {
    let cond = ctx.fresh_box(BoxKind::Int);
    out.push(Op::new(opcode, vec![subject, Operand::int(limit)], Some(cond)));
    out.push(Op::new(Opcode::GuardTrue, vec![Operand::Box(cond)], None));
}

/// Where a child of a virtual is stored
#[derive(Debug, Clone, PartialEq)]
pub struct Child {
    pub descr: Option<Descr>,
    pub index: Option<usize>,
    /// `None` holds the default value
    pub node: Option<usize>,
}

#[derive(Debug, Clone)]
pub enum StateNode {
    NotVirtual(ValueFacts),
    Virtual {
        shape: VirtualShape,
        /// Allocation to replay when the virtual is rebuilt elsewhere
        source: Op,
        children: Vec<Child>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct VirtualState {
    nodes: Vec<StateNode>,
    roots: Vec<usize>,
    num_leaves: usize,
}

struct Capture<'c> {
    ctx: &'c OptContext,
    nodes: Vec<StateNode>,
    seen: HashMap<ValueId, usize>,
    leaves: usize,
}

impl<'c> Capture<'c> {
    fn node(&mut self, id: ValueId) -> usize {
        let ctx = self.ctx;
        if let Some(&index) = self.seen.get(&id) {
            return index;
        }
        let index = self.nodes.len();
        self.seen.insert(id, index);
        let Some(virt) = ctx.pending_virtual(id) else {
            let value = ctx.value(id);
            let leaf = if value.is_constant() {
                None
            } else {
                self.leaves += 1;
                Some(self.leaves - 1)
            };
            self.nodes.push(StateNode::NotVirtual(ValueFacts::of(value, leaf)));
            return index;
        };
        let info = ctx.virtual_info(virt);
        let (shape, source, entries) = (info.kind.shape(), info.source.clone(), info.kind.children());
        self.nodes.push(StateNode::Virtual {
            shape,
            source,
            children: Vec::new(),
        });
        let children: Vec<Child> = entries
            .into_iter()
            .map(|(descr, index, value)| Child {
                descr,
                index,
                node: value.map(|v| self.node(v)),
            })
            .collect();
        if let StateNode::Virtual { children: slot, .. } = &mut self.nodes[index] {
            *slot = children;
        }
        index
    }
}

/// Keeps a node of the general state bound to one node of the other side
#[derive(Default)]
struct Pairing {
    seen: HashSet<(usize, usize)>,
    partner: HashMap<usize, usize>,
}

impl Pairing {
    /// Returns `None` if the pair was already checked, `Some(false)` on a
    /// sharing conflict
    fn visit(&mut self, general: usize, specific: usize, shared_ok: bool) -> Option<bool> {
        if !self.seen.insert((general, specific)) {
            return None;
        }
        match self.partner.insert(general, specific) {
            Some(previous) if previous != specific && !shared_ok => Some(false),
            _ => Some(true),
        }
    }
}

fn children_match(mine: &[Child], theirs: &[Child]) -> bool {
    mine.len() == theirs.len()
        && mine
            .iter()
            .zip(theirs)
            .all(|(a, b)| a.descr == b.descr && a.index == b.index && a.node.is_some() == b.node.is_some())
}

impl VirtualState {
    /// Describe the values `values` as they stand in `ctx`
    pub fn capture(ctx: &OptContext, values: &[ValueId]) -> Self {
        let mut capture = Capture {
            ctx,
            nodes: Vec::new(),
            seen: HashMap::default(),
            leaves: 0,
        };
        let roots = values.iter().map(|v| capture.node(*v)).collect();
        Self {
            nodes: capture.nodes,
            roots,
            num_leaves: capture.leaves,
        }
    }

    pub fn num_roots(&self) -> usize {
        self.roots.len()
    }

    pub fn num_leaves(&self) -> usize {
        self.num_leaves
    }

    /// Kind of each input, in input order
    pub fn leaf_kinds(&self) -> Vec<BoxKind> {
        let mut kinds = vec![BoxKind::Int; self.num_leaves];
        for node in &self.nodes {
            if let StateNode::NotVirtual(facts) = node {
                if let Some(leaf) = facts.leaf {
                    kinds[leaf] = facts.kind;
                }
            }
        }
        kinds
    }

    /// Facts recorded for each input, in input order
    pub fn leaf_facts(&self) -> Vec<&ValueFacts> {
        let mut facts: Vec<(usize, &ValueFacts)> = self
            .nodes
            .iter()
            .filter_map(|node| match node {
                StateNode::NotVirtual(f) => f.leaf.map(|l| (l, f)),
                StateNode::Virtual { .. } => None,
            })
            .collect();
        facts.sort_by_key(|(l, _)| *l);
        facts.into_iter().map(|(_, f)| f).collect()
    }

    pub fn has_virtuals(&self) -> bool {
        self.nodes.iter().any(|n| matches!(n, StateNode::Virtual { .. }))
    }

    /// A loop compiled for `self` accepts every entry described by `other`
    pub fn generalization_of(&self, other: &VirtualState) -> bool {
        if self.roots.len() != other.roots.len() {
            return false;
        }
        let mut pairing = Pairing::default();
        self.roots
            .iter()
            .zip(&other.roots)
            .all(|(&a, &b)| self.node_generalizes(a, other, b, &mut pairing))
    }

    fn node_generalizes(&self, a: usize, other: &VirtualState, b: usize, pairing: &mut Pairing) -> bool {
        let constant = matches!(&self.nodes[a], StateNode::NotVirtual(f) if f.constant.is_some());
        match pairing.visit(a, b, constant) {
            None => return true,
            Some(false) => return false,
            Some(true) => {}
        }
        match (&self.nodes[a], &other.nodes[b]) {
            (StateNode::NotVirtual(fa), StateNode::NotVirtual(fb)) => fa.generalizes(fb),
            (
                StateNode::Virtual {
                    shape: sa,
                    children: ca,
                    ..
                },
                StateNode::Virtual {
                    shape: sb,
                    children: cb,
                    ..
                },
            ) => {
                sa == sb
                    && children_match(ca, cb)
                    && ca.iter().zip(cb).all(|(x, y)| match (x.node, y.node) {
                        (Some(x), Some(y)) => self.node_generalizes(x, other, y, pairing),
                        _ => true,
                    })
            }
            _ => false,
        }
    }

    /// Guards that, once they pass, make `other` an instance of `self`
    ///
    /// `values` are the live values `other` was captured from. Returns
    /// `None` when no guards can bridge the difference.
    pub fn generate_guards(&self, other: &VirtualState, values: &[ValueId], ctx: &mut OptContext) -> Option<Vec<Op>> {
        if self.roots.len() != other.roots.len() || values.len() != self.roots.len() {
            return None;
        }
        let mut pairing = Pairing::default();
        let mut guards = Vec::new();
        for ((&a, &b), &value) in self.roots.iter().zip(&other.roots).zip(values) {
            if !self.node_guards(a, other, b, value, ctx, &mut pairing, &mut guards) {
                return None;
            }
        }
        Some(guards)
    }

    #[allow(clippy::too_many_arguments)]
    fn node_guards(
        &self,
        a: usize,
        other: &VirtualState,
        b: usize,
        value: ValueId,
        ctx: &mut OptContext,
        pairing: &mut Pairing,
        guards: &mut Vec<Op>,
    ) -> bool {
        let constant = matches!(&self.nodes[a], StateNode::NotVirtual(f) if f.constant.is_some());
        match pairing.visit(a, b, constant) {
            None => return true,
            Some(false) => return false,
            Some(true) => {}
        }
        match (&self.nodes[a], &other.nodes[b]) {
            (StateNode::NotVirtual(fa), StateNode::NotVirtual(fb)) => {
                let subject = ctx.value(value).operand;
                fa.narrowing_guards(fb, subject, ctx, guards)
            }
            (
                StateNode::Virtual {
                    shape: sa,
                    children: ca,
                    ..
                },
                StateNode::Virtual {
                    shape: sb,
                    children: cb,
                    ..
                },
            ) => {
                if sa != sb || !children_match(ca, cb) {
                    return false;
                }
                let Some(kind) = ctx.virtual_kind(value) else {
                    return false;
                };
                let actual: Vec<Option<ValueId>> = kind.children().into_iter().map(|(_, _, v)| v).collect();
                if actual.len() != ca.len() {
                    return false;
                }
                for ((x, y), v) in ca.iter().zip(cb).zip(actual) {
                    if let (Some(x), Some(y), Some(v)) = (x.node, y.node, v) {
                        if !self.node_guards(x, other, y, v, ctx, pairing, guards) {
                            return false;
                        }
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Values still virtual in `values` where this state expects a
    /// concrete object
    pub fn virtuals_to_force(&self, ctx: &OptContext, values: &[ValueId]) -> Vec<ValueId> {
        let mut out = Vec::new();
        let mut seen = HashSet::default();
        for (&root, &value) in self.roots.iter().zip(values) {
            self.collect_forced(root, value, ctx, &mut seen, &mut out);
        }
        out
    }

    fn collect_forced(
        &self,
        node: usize,
        value: ValueId,
        ctx: &OptContext,
        seen: &mut HashSet<(usize, ValueId)>,
        out: &mut Vec<ValueId>,
    ) {
        if !seen.insert((node, value)) {
            return;
        }
        let Some(kind) = ctx.virtual_kind(value) else {
            return;
        };
        match &self.nodes[node] {
            StateNode::NotVirtual(_) => out.push(value),
            StateNode::Virtual { children, .. } => {
                let actual = kind.children();
                if actual.len() != children.len() {
                    return;
                }
                for (child, (_, _, v)) in children.iter().zip(actual) {
                    if let (Some(n), Some(v)) = (child.node, v) {
                        self.collect_forced(n, v, ctx, seen, out);
                    }
                }
            }
        }
    }

    /// Guards checking that `inputs` carry the facts recorded for this
    /// state's inputs
    pub fn entry_guards(&self, ctx: &mut OptContext, inputs: &[Operand]) -> Vec<Op> {
        let mut guards = Vec::new();
        for (facts, &input) in self.leaf_facts().into_iter().zip(inputs) {
            let unknown = ValueFacts {
                kind: facts.kind,
                level: Level::Unknown,
                known_class: None,
                constant: None,
                intbound: IntBound::unbounded(),
                lenbound: facts.lenbound.clone(),
                leaf: facts.leaf,
            };
            facts.narrowing_guards(&unknown, input, ctx, &mut guards);
        }
        guards
    }

    /// The values in `values` that feed this state's inputs, in input order
    ///
    /// `values` must be described by a state this one generalizes.
    pub fn make_inputargs(&self, ctx: &OptContext, values: &[ValueId]) -> Result<Vec<ValueId>> {
        if values.len() != self.roots.len() {
            return Err(OptError::internal(format!(
                "state has {} entries, jump has {}",
                self.roots.len(),
                values.len()
            )));
        }
        let mut leaves: Vec<Option<ValueId>> = vec![None; self.num_leaves];
        let mut seen = HashSet::default();
        for (&root, &value) in self.roots.iter().zip(values) {
            self.collect_leaves(root, value, ctx, &mut seen, &mut leaves)?;
        }
        leaves
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| OptError::internal(format!("input {} of the state left unbound", i))))
            .collect()
    }

    fn collect_leaves(
        &self,
        node: usize,
        value: ValueId,
        ctx: &OptContext,
        seen: &mut HashSet<(usize, ValueId)>,
        leaves: &mut [Option<ValueId>],
    ) -> Result<()> {
        if !seen.insert((node, value)) {
            return Ok(());
        }
        match &self.nodes[node] {
            StateNode::NotVirtual(facts) => {
                if let Some(leaf) = facts.leaf {
                    match leaves[leaf] {
                        Some(bound) if bound != value => {
                            return Err(OptError::internal(format!("input {} bound to two values", leaf)));
                        }
                        _ => leaves[leaf] = Some(value),
                    }
                }
                Ok(())
            }
            StateNode::Virtual { children, .. } => {
                let kind = ctx
                    .virtual_kind(value)
                    .ok_or_else(|| OptError::internal("state expects a virtual"))?;
                let actual = kind.children();
                if actual.len() != children.len() {
                    return Err(OptError::internal("virtual changed shape"));
                }
                for (child, (_, _, v)) in children.iter().zip(actual) {
                    if let (Some(n), Some(v)) = (child.node, v) {
                        self.collect_leaves(n, v, ctx, seen, leaves)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Rebuild the described values in another run
    ///
    /// Each input becomes the value of the matching box in `inputs`, with the
    /// recorded facts; virtuals are recreated around them. Returns the value
    /// of each entry.
    pub fn import(&self, ctx: &mut OptContext, inputs: &[BoxRef]) -> Result<Vec<ValueId>> {
        if inputs.len() != self.num_leaves {
            return Err(OptError::internal(format!(
                "state has {} inputs, got {} boxes",
                self.num_leaves,
                inputs.len()
            )));
        }
        // first give every node a value, so virtuals can refer to each other
        let mut ids = Vec::with_capacity(self.nodes.len());
        let mut keyboxes = HashMap::default();
        for (index, node) in self.nodes.iter().enumerate() {
            let id = match node {
                StateNode::NotVirtual(facts) => match (facts.constant, facts.leaf) {
                    (Some(c), _) => ctx.value_of(Operand::Const(c)),
                    (None, Some(leaf)) => {
                        let id = ctx.value_of(Operand::Box(inputs[leaf]));
                        facts.apply(ctx.value_mut(id))?;
                        id
                    }
                    (None, None) => return Err(OptError::internal("non-constant state node without input")),
                },
                StateNode::Virtual { .. } => {
                    let keybox = ctx.fresh_box(BoxKind::Ptr);
                    keyboxes.insert(index, keybox);
                    ctx.value_of(Operand::Box(keybox))
                }
            };
            ids.push(id);
        }
        for (index, node) in self.nodes.iter().enumerate() {
            let StateNode::Virtual {
                shape,
                source,
                children,
            } = node
            else {
                continue;
            };
            let keybox = keyboxes
                .get(&index)
                .copied()
                .ok_or_else(|| OptError::internal("virtual without keybox"))?;
            let kind = rebuild_kind(shape, children, &ids)?;
            let mut source = source.clone();
            source.result = Some(keybox);
            ctx.new_virtual(keybox, source, kind);
        }
        Ok(self.roots.iter().map(|&r| ids[r]).collect())
    }
}

fn rebuild_kind(shape: &VirtualShape, children: &[Child], ids: &[ValueId]) -> Result<VirtualKind> {
    let child = |i: usize| -> Result<ValueId> {
        children
            .get(i)
            .and_then(|c| c.node)
            .map(|n| ids[n])
            .ok_or_else(|| OptError::internal(format!("{} is missing part {}", shape, i)))
    };
    let named = || -> Result<BTreeMap<Descr, ValueId>> {
        let mut fields = BTreeMap::new();
        for c in children {
            let descr = c
                .descr
                .clone()
                .ok_or_else(|| OptError::internal("field without descr"))?;
            if let Some(n) = c.node {
                fields.insert(descr, ids[n]);
            }
        }
        Ok(fields)
    };
    let kind = match shape {
        VirtualShape::Instance { class, size } => VirtualKind::Instance {
            class: *class,
            size: size.clone(),
            fields: named()?,
        },
        VirtualShape::Struct { size } => VirtualKind::Struct {
            size: size.clone(),
            fields: named()?,
        },
        VirtualShape::Array { descr, length } => {
            let mut items = vec![None; *length];
            for c in children {
                if let Some(i) = c.index.filter(|&i| i < *length) {
                    items[i] = c.node.map(|n| ids[n]);
                }
            }
            VirtualKind::Array {
                descr: descr.clone(),
                items,
            }
        }
        VirtualShape::ArrayStruct { descr, length } => {
            let mut items = vec![BTreeMap::new(); *length];
            for c in children {
                if let (Some(i), Some(d), Some(n)) = (c.index, c.descr.clone(), c.node) {
                    if let Some(fields) = items.get_mut(i) {
                        fields.insert(d, ids[n]);
                    }
                }
            }
            VirtualKind::ArrayStruct {
                descr: descr.clone(),
                items,
            }
        }
        VirtualShape::StrPlain { length } => {
            let mut chars = vec![None; *length];
            for c in children {
                if let Some(i) = c.index.filter(|&i| i < *length) {
                    chars[i] = c.node.map(|n| ids[n]);
                }
            }
            VirtualKind::StrPlain { chars }
        }
        VirtualShape::StrConcat => VirtualKind::StrConcat {
            left: child(0)?,
            right: child(1)?,
            length: None,
        },
        VirtualShape::StrSlice => VirtualKind::StrSlice {
            base: child(0)?,
            start: child(1)?,
            length: child(2)?,
        },
    };
    Ok(kind)
}

impl fmt::Display for VirtualState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, root) in self.roots.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "#{}", root)?;
        }
        writeln!(f)?;
        for (index, node) in self.nodes.iter().enumerate() {
            write!(f, "  #{}: ", index)?;
            match node {
                StateNode::NotVirtual(facts) => {
                    match (facts.constant, facts.leaf) {
                        (Some(c), _) => write!(f, "const {}", c)?,
                        (None, Some(leaf)) => write!(f, "input {} {:?}", leaf, facts.level)?,
                        (None, None) => write!(f, "{:?}", facts.level)?,
                    }
                    if let Some(class) = facts.class() {
                        write!(f, " class 0x{:x}", class)?;
                    }
                    if facts.kind == BoxKind::Int && facts.constant.is_none() && facts.intbound.bounded() {
                        write!(f, " {}", facts.intbound)?;
                    }
                }
                StateNode::Virtual { shape, children, .. } => {
                    write!(f, "{} {{", shape)?;
                    for (i, c) in children.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        match (&c.descr, c.index) {
                            (Some(d), Some(i)) => write!(f, " [{}].{}", i, d)?,
                            (Some(d), None) => write!(f, " {}", d)?,
                            (None, Some(i)) => write!(f, " [{}]", i)?,
                            (None, None) => {}
                        }
                        match c.node {
                            Some(n) => write!(f, ": #{}", n)?,
                            None => write!(f, ": default")?,
                        }
                    }
                    write!(f, " }}")?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
