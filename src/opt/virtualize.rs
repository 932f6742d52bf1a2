//! Allocation removal
//!
//! Allocations whose shape is known become virtuals. Field and element
//! accesses against a virtual are answered from its contents and never
//! reach the output. A virtual escapes when it is passed to anything else,
//! and the sink then forces it.

use super::core::{Chain, Pass};
use super::value::ValueId;
use super::virtuals::VirtualKind;
use crate::error::Result;
use crate::ir::{BoxKind, Descr, Op, Opcode, Operand};
use std::collections::BTreeMap;
use tracing::debug;

/// Longest array literal that is kept virtual
pub const MAX_VIRTUAL_ARRAY_LEN: usize = 1024;

#[derive(Default)]
pub struct OptVirtualize;

impl OptVirtualize {
    pub fn new() -> Self {
        Self
    }

    fn default_for(descr: Option<&Descr>) -> Operand {
        let kind = descr.and_then(|d| d.value_kind()).unwrap_or(BoxKind::Int);
        Operand::Const(kind.default_const())
    }

    /// Bind `op`'s result to `value`
    fn answer(op: &Op, chain: &mut Chain<'_>, value: Option<ValueId>) -> Result<()> {
        let Some(result) = op.result else {
            return Ok(());
        };
        match value {
            Some(id) => chain.ctx.make_equal(result, id),
            None => chain.ctx.make_equal_to(result, Self::default_for(op.descr.as_ref())),
        }
    }

    fn constant_index(op: &Op, chain: &Chain<'_>) -> Option<usize> {
        chain
            .ctx
            .get_constant_int(op.arg(1))
            .filter(|&i| i >= 0)
            .map(|i| i as usize)
    }

    // ==================== Allocation ====================

    fn optimize_new(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let (Some(result), Some(size)) = (op.result, op.descr.clone()) else {
            return chain.emit(op);
        };
        let kind = match op.opcode {
            Opcode::NewWithVtable => {
                let class = size
                    .known_class()
                    .or_else(|| op.args.first().and_then(|a| a.const_int()));
                match class {
                    Some(class) => VirtualKind::Instance {
                        class,
                        size,
                        fields: BTreeMap::new(),
                    },
                    None => return chain.emit(op),
                }
            }
            _ => VirtualKind::Struct {
                size,
                fields: BTreeMap::new(),
            },
        };
        debug!(result = %result, "allocation made virtual");
        chain.ctx.new_virtual(result, op, kind);
        Ok(())
    }

    fn optimize_new_array(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let (Some(result), Some(descr)) = (op.result, op.descr.clone()) else {
            return chain.emit(op);
        };
        let length = chain
            .ctx
            .get_constant_int(op.arg(0))
            .filter(|&n| (0..=MAX_VIRTUAL_ARRAY_LEN as i64).contains(&n));
        let Some(length) = length else {
            return chain.emit(op);
        };
        let kind = VirtualKind::Array {
            descr,
            items: vec![None; length as usize],
        };
        chain.ctx.new_virtual(result, op, kind);
        Ok(())
    }

    // ==================== Fields ====================

    fn optimize_getfield(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let Some(descr) = op.descr.clone() else {
            return chain.emit(op);
        };
        if let Some(fields) = chain.ctx.virtual_kind(id).and_then(|k| k.fields()) {
            let field = fields.get(&descr).copied();
            return Self::answer(&op, chain, field);
        }
        if descr.is_always_pure() {
            if let Some(fields) = chain.ctx.forced_kind(id).and_then(|k| k.fields()) {
                let field = fields.get(&descr).copied();
                return Self::answer(&op, chain, field);
            }
        }
        chain.emit(op)
    }

    fn optimize_setfield(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let (Some(descr), true) = (op.descr.clone(), chain.ctx.is_virtual(id)) else {
            return chain.emit(op);
        };
        let value = chain.value(op.arg(1));
        if let Some(fields) = chain.ctx.virtual_kind_mut(id).and_then(|k| k.fields_mut()) {
            fields.insert(descr, value);
            return Ok(());
        }
        chain.emit(op)
    }

    // ==================== Arrays ====================

    fn optimize_arraylen(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        match (op.result, chain.ctx.virtual_kind(id).and_then(|k| k.array_len())) {
            (Some(result), Some(len)) => chain.ctx.make_constant_int(result, len as i64),
            _ => chain.emit(op),
        }
    }

    fn optimize_getarrayitem(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        if let Some(index) = Self::constant_index(&op, chain) {
            if let Some(VirtualKind::Array { items, .. }) = chain.ctx.virtual_kind(id) {
                if let Some(item) = items.get(index).copied() {
                    return Self::answer(&op, chain, item);
                }
            }
        }
        chain.emit(op)
    }

    fn optimize_setarrayitem(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        if let Some(index) = Self::constant_index(&op, chain) {
            let value = chain.value(op.arg(2));
            if let Some(VirtualKind::Array { items, .. }) = chain.ctx.virtual_kind_mut(id) {
                if let Some(slot) = items.get_mut(index) {
                    *slot = Some(value);
                    return Ok(());
                }
            }
        }
        chain.emit(op)
    }

    /// An array of structs is only recognised on its first interior store
    fn as_array_struct(chain: &mut Chain<'_>, id: ValueId) -> bool {
        let Some(kind) = chain.ctx.virtual_kind_mut(id) else {
            return false;
        };
        let converted = match kind {
            VirtualKind::Array { descr, items } if items.iter().all(Option::is_none) => {
                Some(VirtualKind::ArrayStruct {
                    descr: descr.clone(),
                    items: vec![BTreeMap::new(); items.len()],
                })
            }
            _ => None,
        };
        if let Some(converted) = converted {
            *kind = converted;
        }
        matches!(kind, VirtualKind::ArrayStruct { .. })
    }

    fn optimize_setinteriorfield(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let (Some(index), Some(descr)) = (Self::constant_index(&op, chain), op.descr.clone()) else {
            return chain.emit(op);
        };
        if !Self::as_array_struct(chain, id) {
            return chain.emit(op);
        }
        let value = chain.value(op.arg(2));
        if let Some(VirtualKind::ArrayStruct { items, .. }) = chain.ctx.virtual_kind_mut(id) {
            if let Some(fields) = items.get_mut(index) {
                fields.insert(descr, value);
                return Ok(());
            }
        }
        chain.emit(op)
    }

    fn optimize_getinteriorfield(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let (Some(index), Some(descr)) = (Self::constant_index(&op, chain), op.descr.clone()) else {
            return chain.emit(op);
        };
        let item = match chain.ctx.virtual_kind(id) {
            Some(VirtualKind::ArrayStruct { items, .. }) => items.get(index).map(|f| f.get(&descr).copied()),
            // nothing stored yet, every element reads as zero
            Some(VirtualKind::Array { items, .. }) if items.iter().all(Option::is_none) => {
                (index < items.len()).then_some(None)
            }
            _ => None,
        };
        match item {
            Some(field) => Self::answer(&op, chain, field),
            None => chain.emit(op),
        }
    }
}

impl Pass for OptVirtualize {
    fn name(&self) -> &'static str {
        "virtualize"
    }

    fn propagate(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        match op.opcode {
            Opcode::New | Opcode::NewWithVtable => self.optimize_new(op, chain),
            Opcode::NewArray => self.optimize_new_array(op, chain),
            Opcode::GetfieldGc | Opcode::GetfieldGcPure => self.optimize_getfield(op, chain),
            Opcode::SetfieldGc => self.optimize_setfield(op, chain),
            Opcode::ArraylenGc => self.optimize_arraylen(op, chain),
            Opcode::GetarrayitemGc | Opcode::GetarrayitemGcPure => self.optimize_getarrayitem(op, chain),
            Opcode::SetarrayitemGc => self.optimize_setarrayitem(op, chain),
            Opcode::GetinteriorfieldGc => self.optimize_getinteriorfield(op, chain),
            Opcode::SetinteriorfieldGc => self.optimize_setinteriorfield(op, chain),
            Opcode::VirtualRef => match op.result {
                Some(result) => chain.ctx.make_equal_to(result, op.arg(0)),
                None => Ok(()),
            },
            Opcode::VirtualRefFinish => Ok(()),
            _ => chain.emit(op),
        }
    }
}
