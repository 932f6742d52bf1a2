//! Virtual allocations
//!
//! A virtual is an allocation the optimizer has not emitted yet. Its fields
//! live in the arena entry below, and reads and writes against it never reach
//! the output. Forcing emits the allocation plus one store per non-default
//! field and flips the entry to `Forced`, which is permanent.

use super::core::Chain;
use super::value::ValueId;
use crate::error::Result;
use crate::ir::{BoxRef, Descr, Op, Opcode, Operand};
use std::collections::BTreeMap;
use tracing::debug;

/// Index of a virtual in the optimizer's virtual arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualId(pub(crate) u32);

impl VirtualId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Whether a virtual has been materialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialization {
    Virtual,
    Forced(BoxRef),
}

/// Fields and elements of an unmaterialized allocation
///
/// Missing fields and `None` elements hold the default (zero) value.
#[derive(Debug, Clone, PartialEq)]
pub enum VirtualKind {
    Instance {
        class: i64,
        size: Descr,
        fields: BTreeMap<Descr, ValueId>,
    },
    Struct {
        size: Descr,
        fields: BTreeMap<Descr, ValueId>,
    },
    Array {
        descr: Descr,
        items: Vec<Option<ValueId>>,
    },
    ArrayStruct {
        descr: Descr,
        items: Vec<BTreeMap<Descr, ValueId>>,
    },
    StrPlain {
        chars: Vec<Option<ValueId>>,
    },
    StrConcat {
        left: ValueId,
        right: ValueId,
        /// Cached length once computed
        length: Option<Operand>,
    },
    StrSlice {
        base: ValueId,
        start: ValueId,
        length: ValueId,
    },
}

/// Structural tag of a virtual, without its contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualShape {
    Instance { class: i64, size: Descr },
    Struct { size: Descr },
    Array { descr: Descr, length: usize },
    ArrayStruct { descr: Descr, length: usize },
    StrPlain { length: usize },
    StrConcat,
    StrSlice,
}

impl std::fmt::Display for VirtualShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VirtualShape::Instance { size, .. } => write!(f, "Instance({})", size),
            VirtualShape::Struct { size } => write!(f, "Struct({})", size),
            VirtualShape::Array { descr, length } => write!(f, "Array({}, {})", descr, length),
            VirtualShape::ArrayStruct { descr, length } => {
                write!(f, "ArrayStruct({}, {})", descr, length)
            }
            VirtualShape::StrPlain { length } => write!(f, "StrPlain({})", length),
            VirtualShape::StrConcat => write!(f, "StrConcat"),
            VirtualShape::StrSlice => write!(f, "StrSlice"),
        }
    }
}

impl VirtualKind {
    pub fn known_class(&self) -> Option<i64> {
        match self {
            VirtualKind::Instance { class, .. } => Some(*class),
            _ => None,
        }
    }

    pub fn shape(&self) -> VirtualShape {
        match self {
            VirtualKind::Instance { class, size, .. } => VirtualShape::Instance {
                class: *class,
                size: size.clone(),
            },
            VirtualKind::Struct { size, .. } => VirtualShape::Struct { size: size.clone() },
            VirtualKind::Array { descr, items } => VirtualShape::Array {
                descr: descr.clone(),
                length: items.len(),
            },
            VirtualKind::ArrayStruct { descr, items } => VirtualShape::ArrayStruct {
                descr: descr.clone(),
                length: items.len(),
            },
            VirtualKind::StrPlain { chars } => VirtualShape::StrPlain {
                length: chars.len(),
            },
            VirtualKind::StrConcat { .. } => VirtualShape::StrConcat,
            VirtualKind::StrSlice { .. } => VirtualShape::StrSlice,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(
            self,
            VirtualKind::StrPlain { .. } | VirtualKind::StrConcat { .. } | VirtualKind::StrSlice { .. }
        )
    }

    pub fn fields(&self) -> Option<&BTreeMap<Descr, ValueId>> {
        match self {
            VirtualKind::Instance { fields, .. } | VirtualKind::Struct { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn fields_mut(&mut self) -> Option<&mut BTreeMap<Descr, ValueId>> {
        match self {
            VirtualKind::Instance { fields, .. } | VirtualKind::Struct { fields, .. } => Some(fields),
            _ => None,
        }
    }

    /// Number of elements of an array-like virtual
    pub fn array_len(&self) -> Option<usize> {
        match self {
            VirtualKind::Array { items, .. } => Some(items.len()),
            VirtualKind::ArrayStruct { items, .. } => Some(items.len()),
            _ => None,
        }
    }

    /// Every value this virtual refers to, in a stable order
    ///
    /// Each entry carries the descr and element index it is stored under.
    pub fn children(&self) -> Vec<(Option<Descr>, Option<usize>, Option<ValueId>)> {
        match self {
            VirtualKind::Instance { fields, .. } | VirtualKind::Struct { fields, .. } => fields
                .iter()
                .map(|(d, v)| (Some(d.clone()), None, Some(*v)))
                .collect(),
            VirtualKind::Array { items, .. } => items
                .iter()
                .enumerate()
                .map(|(i, v)| (None, Some(i), *v))
                .collect(),
            VirtualKind::ArrayStruct { items, .. } => items
                .iter()
                .enumerate()
                .flat_map(|(i, fields)| {
                    fields.iter().map(move |(d, v)| (Some(d.clone()), Some(i), Some(*v)))
                })
                .collect(),
            VirtualKind::StrPlain { chars } => chars
                .iter()
                .enumerate()
                .map(|(i, v)| (None, Some(i), *v))
                .collect(),
            VirtualKind::StrConcat { left, right, .. } => {
                vec![(None, Some(0), Some(*left)), (None, Some(1), Some(*right))]
            }
            VirtualKind::StrSlice {
                base,
                start,
                length,
            } => vec![
                (None, Some(0), Some(*base)),
                (None, Some(1), Some(*start)),
                (None, Some(2), Some(*length)),
            ],
        }
    }
}

/// One arena entry
#[derive(Debug, Clone)]
pub struct VirtualInfo {
    /// The box that will hold the allocation once forced
    pub keybox: BoxRef,
    /// Allocation to emit when forced
    pub source: Op,
    pub kind: VirtualKind,
    pub state: Materialization,
}

impl VirtualInfo {
    pub fn is_virtual(&self) -> bool {
        self.state == Materialization::Virtual
    }
}

impl<'a> Chain<'a> {
    /// Make sure `id` is materialized and return its representative
    pub fn force(&mut self, id: ValueId) -> Result<Operand> {
        if let Some(virt) = self.ctx.pending_virtual(id) {
            self.force_virtual(virt)?;
        }
        Ok(self.ctx.value(id).operand)
    }

    pub fn force_operand(&mut self, operand: Operand) -> Result<Operand> {
        let id = self.ctx.value_of(operand);
        self.force(id)
    }

    fn force_virtual(&mut self, virt: VirtualId) -> Result<()> {
        let info = self.ctx.virtual_info(virt).clone();
        // mark first: a self-referencing field must see the box, not recurse
        self.ctx.virtual_info_mut(virt).state = Materialization::Forced(info.keybox);
        debug!(keybox = %info.keybox, shape = %info.kind.shape(), "forcing virtual");

        let key = Operand::Box(info.keybox);
        match info.kind {
            VirtualKind::Instance { fields, .. } | VirtualKind::Struct { fields, .. } => {
                self.emit(info.source)?;
                for (descr, field) in fields {
                    if self.ctx.value(field).is_null() {
                        continue;
                    }
                    let value = self.force(field)?;
                    self.emit(Op::new(Opcode::SetfieldGc, vec![key, value], None).with_descr(descr))?;
                }
            }
            VirtualKind::Array { descr, items } => {
                self.emit(info.source)?;
                for (index, item) in items.into_iter().enumerate() {
                    let Some(item) = item else { continue };
                    if self.ctx.value(item).is_null() {
                        continue;
                    }
                    let value = self.force(item)?;
                    self.emit(
                        Op::new(
                            Opcode::SetarrayitemGc,
                            vec![key, Operand::int(index as i64), value],
                            None,
                        )
                        .with_descr(descr.clone()),
                    )?;
                }
            }
            VirtualKind::ArrayStruct { items, .. } => {
                self.emit(info.source)?;
                for (index, fields) in items.into_iter().enumerate() {
                    for (descr, field) in fields {
                        if self.ctx.value(field).is_null() {
                            continue;
                        }
                        let value = self.force(field)?;
                        self.emit(
                            Op::new(
                                Opcode::SetinteriorfieldGc,
                                vec![key, Operand::int(index as i64), value],
                                None,
                            )
                            .with_descr(descr),
                        )?;
                    }
                }
            }
            kind => self.force_string(virt, info.keybox, kind)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::ir::{BoxAllocator, BoxKind, Const};
    use crate::opt::core::{OptContext, Optimizer};

    fn optimizer() -> Optimizer {
        Optimizer::new(OptContext::new(Policy::default(), BoxAllocator::after(50)), vec![])
    }

    #[test]
    fn test_force_struct_skips_default_fields() {
        let mut opt = optimizer();
        let size = Descr::size("node", None);
        let a = Descr::field("a", "node", BoxKind::Int);
        let b = Descr::field("b", "node", BoxKind::Int);
        let p1 = BoxRef::ptr(1);
        let source = Op::new(Opcode::New, vec![], Some(p1)).with_descr(size.clone());
        let mut fields = BTreeMap::new();
        fields.insert(a.clone(), opt.ctx.value_of(Operand::int(0)));
        fields.insert(b.clone(), opt.ctx.value_of(BoxRef::int(2).into()));
        let vid = opt.ctx.new_virtual(p1, source, VirtualKind::Struct { size, fields });
        assert!(opt.ctx.is_virtual(vid));

        let forced = opt.with_sink(|chain| chain.force(vid)).unwrap();
        assert_eq!(forced, Operand::Box(p1));
        assert!(!opt.ctx.is_virtual(vid));
        let out = opt.take_output();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].opcode, Opcode::New);
        assert_eq!(out[1].opcode, Opcode::SetfieldGc);
        assert_eq!(out[1].descr, Some(b));
    }

    #[test]
    fn test_force_is_monotonic() {
        let mut opt = optimizer();
        let descr = Descr::array("arr", BoxKind::Int, false);
        let p1 = BoxRef::ptr(1);
        let source = Op::new(Opcode::NewArray, vec![Operand::int(2)], Some(p1)).with_descr(descr.clone());
        let seven = opt.ctx.value_of(Operand::Const(Const::Int(7)));
        let vid = opt.ctx.new_virtual(
            p1,
            source,
            VirtualKind::Array {
                descr,
                items: vec![None, Some(seven)],
            },
        );
        opt.with_sink(|chain| chain.force(vid)).unwrap();
        opt.with_sink(|chain| chain.force(vid)).unwrap();
        let out = opt.take_output();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].args, vec![Operand::Box(p1), Operand::int(1), Operand::int(7)]);
    }

    #[test]
    fn test_self_reference_terminates() {
        let mut opt = optimizer();
        let size = Descr::size("node", None);
        let next = Descr::field("next", "node", BoxKind::Ptr);
        let p1 = BoxRef::ptr(1);
        let source = Op::new(Opcode::New, vec![], Some(p1)).with_descr(size.clone());
        let vid = opt.ctx.new_virtual(
            p1,
            source,
            VirtualKind::Struct {
                size,
                fields: BTreeMap::new(),
            },
        );
        if let Some(fields) = opt.ctx.virtual_kind_mut(vid).and_then(|k| k.fields_mut()) {
            fields.insert(next, vid);
        }
        opt.with_sink(|chain| chain.force(vid)).unwrap();
        let out = opt.take_output();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].args, vec![Operand::Box(p1), Operand::Box(p1)]);
    }
}
