//! Guard resume data
//!
//! When a guard is emitted its fail-arguments are frozen into a compact
//! description: live boxes, constants, and for values that are still
//! virtual a recursive recipe to rebuild them on bailout. Virtuals reached
//! from a fail-argument are not forced. Constants are dropped from the live
//! box list since the recipe carries them inline.

use super::core::OptContext;
use super::value::ValueId;
use super::virtuals::{VirtualId, VirtualShape};
use crate::error::{OptError, Result};
use crate::ir::{Const, Descr, Op, Opcode, Operand};
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::fmt;

/// Where one rebuilt value comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ResumeSlot {
    /// Index into the guard's live boxes
    Box(usize),
    Const(Const),
    /// Index into `ResumeData::virtuals`
    Virtual(usize),
}

/// One field or element of a virtual to rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeField {
    #[serde(serialize_with = "serialize_descr")]
    pub descr: Option<Descr>,
    pub index: Option<usize>,
    pub slot: ResumeSlot,
}

/// Recipe for one virtual
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualDescription {
    #[serde(serialize_with = "serialize_shape")]
    pub shape: VirtualShape,
    pub fields: Vec<ResumeField>,
}

/// A store of a virtual into a non-virtual, delayed past the guard
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingField {
    #[serde(serialize_with = "serialize_descr_required")]
    pub descr: Descr,
    pub target: ResumeSlot,
    pub index: Option<i64>,
    pub value: ResumeSlot,
}

/// Everything the resume mechanism needs for one guard
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ResumeData {
    /// One slot per original fail-argument
    pub slots: Vec<ResumeSlot>,
    pub virtuals: Vec<VirtualDescription>,
    pub pending_fields: Vec<PendingField>,
}

fn serialize_descr<S: serde::Serializer>(d: &Option<Descr>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(d.name()),
        None => s.serialize_none(),
    }
}

fn serialize_descr_required<S: serde::Serializer>(d: &Descr, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(d.name())
}

fn serialize_shape<S: serde::Serializer>(shape: &VirtualShape, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&shape.to_string())
}

impl fmt::Display for ResumeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeSlot::Box(i) => write!(f, "b{}", i),
            ResumeSlot::Const(c) => write!(f, "{}", c),
            ResumeSlot::Virtual(i) => write!(f, "v{}", i),
        }
    }
}

impl fmt::Display for ResumeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots: Vec<String> = self.slots.iter().map(|s| s.to_string()).collect();
        write!(f, "[{}]", slots.join(", "))?;
        for (i, v) in self.virtuals.iter().enumerate() {
            let fields: Vec<String> = v
                .fields
                .iter()
                .map(|field| match (&field.descr, field.index) {
                    (Some(d), Some(i)) => format!("{}[{}]={}", d, i, field.slot),
                    (Some(d), None) => format!("{}={}", d, field.slot),
                    (None, Some(i)) => format!("[{}]={}", i, field.slot),
                    (None, None) => field.slot.to_string(),
                })
                .collect();
            write!(f, " v{}={}{{{}}}", i, v.shape, fields.join(", "))?;
        }
        for p in &self.pending_fields {
            match p.index {
                Some(i) => write!(f, " pending {}[{}].{}={}", p.target, i, p.descr, p.value)?,
                None => write!(f, " pending {}.{}={}", p.target, p.descr, p.value)?,
            }
        }
        Ok(())
    }
}

struct ResumeBuilder<'c> {
    ctx: &'c OptContext,
    live: Vec<Operand>,
    live_index: HashMap<Operand, usize>,
    seen: HashMap<VirtualId, usize>,
    virtuals: Vec<VirtualDescription>,
}

impl<'c> ResumeBuilder<'c> {
    fn new(ctx: &'c OptContext) -> Self {
        Self {
            ctx,
            live: Vec::new(),
            live_index: HashMap::default(),
            seen: HashMap::default(),
            virtuals: Vec::new(),
        }
    }

    fn slot(&mut self, id: ValueId) -> Result<ResumeSlot> {
        if let Some(virt) = self.ctx.pending_virtual(id) {
            return self.virtual_slot(virt);
        }
        let value = self.ctx.value(id);
        match value.operand {
            Operand::Const(c) => Ok(ResumeSlot::Const(c)),
            operand @ Operand::Box(_) => {
                let next = self.live.len();
                let index = *self.live_index.entry(operand).or_insert(next);
                if index == next {
                    self.live.push(operand);
                }
                Ok(ResumeSlot::Box(index))
            }
        }
    }

    fn virtual_slot(&mut self, virt: VirtualId) -> Result<ResumeSlot> {
        if let Some(&index) = self.seen.get(&virt) {
            return Ok(ResumeSlot::Virtual(index));
        }
        let info = self.ctx.virtual_info(virt);
        let index = self.virtuals.len();
        self.seen.insert(virt, index);
        self.virtuals.push(VirtualDescription {
            shape: info.kind.shape(),
            fields: Vec::new(),
        });
        let mut fields = Vec::new();
        for (descr, elem, child) in info.kind.children() {
            let Some(child) = child else { continue };
            fields.push(ResumeField {
                descr,
                index: elem,
                slot: self.slot(child)?,
            });
        }
        self.virtuals[index].fields = fields;
        Ok(ResumeSlot::Virtual(index))
    }
}

/// Freeze the fail-arguments of `op` and attach its resume data
pub fn store_final_boxes_in_guard(ctx: &mut OptContext, op: &mut Op, pending: &[Op]) -> Result<()> {
    let fail_args = op.fail_args.take().unwrap_or_default();
    let ids: Vec<ValueId> = fail_args.iter().map(|a| ctx.value_of(*a)).collect();

    let mut pending_ids = Vec::with_capacity(pending.len());
    for store in pending {
        let descr = store
            .descr
            .clone()
            .ok_or_else(|| OptError::internal(format!("pending {} without descr", store.opcode)))?;
        let (index, value) = match store.opcode {
            Opcode::SetfieldGc => (None, store.arg(1)),
            Opcode::SetarrayitemGc => {
                let index = ctx.get_constant_int(store.arg(1)).ok_or_else(|| {
                    OptError::internal("pending array store with a variable index")
                })?;
                (Some(index), store.arg(2))
            }
            other => return Err(OptError::internal(format!("cannot delay {}", other))),
        };
        let target = ctx.value_of(store.arg(0));
        let value = ctx.value_of(value);
        pending_ids.push((descr, target, index, value));
    }

    let mut builder = ResumeBuilder::new(ctx);
    let slots = ids
        .iter()
        .map(|id| builder.slot(*id))
        .collect::<Result<Vec<_>>>()?;
    let mut pending_fields = Vec::with_capacity(pending_ids.len());
    for (descr, target, index, value) in pending_ids {
        pending_fields.push(PendingField {
            descr,
            target: builder.slot(target)?,
            index,
            value: builder.slot(value)?,
        });
    }

    op.fail_args = Some(builder.live);
    op.resume = Some(Box::new(ResumeData {
        slots,
        virtuals: builder.virtuals,
        pending_fields,
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::ir::{BoxAllocator, BoxKind, BoxRef};
    use crate::opt::virtuals::VirtualKind;
    use std::collections::BTreeMap;

    fn ctx() -> OptContext {
        OptContext::new(Policy::default(), BoxAllocator::after(100))
    }

    #[test]
    fn test_constants_are_dropped_from_fail_args() {
        let mut ctx = ctx();
        ctx.make_constant_int(BoxRef::int(1), 3).unwrap();
        let mut guard = Op::new(Opcode::GuardTrue, vec![BoxRef::int(2).into()], None)
            .with_fail_args(vec![BoxRef::int(1).into(), BoxRef::int(2).into(), BoxRef::int(2).into()]);
        store_final_boxes_in_guard(&mut ctx, &mut guard, &[]).unwrap();
        assert_eq!(guard.fail_args, Some(vec![BoxRef::int(2).into()]));
        let resume = guard.resume.unwrap();
        assert_eq!(
            resume.slots,
            vec![ResumeSlot::Const(Const::Int(3)), ResumeSlot::Box(0), ResumeSlot::Box(0)]
        );
    }

    #[test]
    fn test_virtual_fail_arg_is_described_not_forced() {
        let mut ctx = ctx();
        let size = Descr::size("node", Some(0x40));
        let next = Descr::field("next", "node", BoxKind::Ptr);
        let value = Descr::field("value", "node", BoxKind::Int);
        let p1 = BoxRef::ptr(1);
        let source = Op::new(Opcode::NewWithVtable, vec![], Some(p1)).with_descr(size.clone());
        let vid = ctx.new_virtual(
            p1,
            source,
            VirtualKind::Instance {
                class: 0x40,
                size,
                fields: BTreeMap::new(),
            },
        );
        let i2 = ctx.value_of(BoxRef::int(2).into());
        if let Some(fields) = ctx.virtual_kind_mut(vid).and_then(|k| k.fields_mut()) {
            fields.insert(next, vid);
            fields.insert(value, i2);
        }
        let mut guard = Op::new(Opcode::GuardTrue, vec![BoxRef::int(3).into()], None)
            .with_fail_args(vec![p1.into()]);
        store_final_boxes_in_guard(&mut ctx, &mut guard, &[]).unwrap();
        assert!(ctx.is_virtual(vid));
        assert_eq!(guard.fail_args, Some(vec![BoxRef::int(2).into()]));
        let resume = guard.resume.unwrap();
        assert_eq!(resume.slots, vec![ResumeSlot::Virtual(0)]);
        assert_eq!(resume.virtuals.len(), 1);
        let slots: Vec<_> = resume.virtuals[0].fields.iter().map(|f| f.slot.clone()).collect();
        assert_eq!(slots, vec![ResumeSlot::Virtual(0), ResumeSlot::Box(0)]);
    }
}
