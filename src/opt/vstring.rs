//! Virtual strings
//!
//! Strings get their own little rope lattice on top of the virtual arena:
//! `StrPlain` (known characters), `StrConcat` and `StrSlice`. Lengths and
//! single characters are answered symbolically whenever possible. Forcing
//! allocates the full string and copies the pieces in, character by
//! character for short constant lengths and with `copystrcontent` otherwise.

use super::core::{Chain, OptContext, Pass};
use super::value::ValueId;
use super::virtuals::{VirtualId, VirtualKind};
use crate::error::Result;
use crate::ir::{BoxKind, BoxRef, Const, Descr, Op, Opcode, OopSpec, Operand};
use tracing::debug;

/// Longest `newstr` with a constant length that is kept virtual
const MAX_CONST_LEN: i64 = 100;

/// Length of a string value, if known without emitting anything
pub fn known_strlen(ctx: &OptContext, id: ValueId) -> Option<Operand> {
    match ctx.virtual_kind(id) {
        Some(VirtualKind::StrPlain { chars }) => Some(Operand::int(chars.len() as i64)),
        Some(VirtualKind::StrConcat { length, .. }) => *length,
        Some(VirtualKind::StrSlice { length, .. }) => Some(ctx.value(*length).operand),
        _ => {
            let lb = ctx.value(id).lenbound.as_ref()?;
            lb.bound.get_constant().map(Operand::int)
        }
    }
}

/// Characters of a string whose contents are all known constants
pub fn constant_chars(ctx: &OptContext, id: ValueId) -> Option<Vec<i64>> {
    match ctx.virtual_kind(id)? {
        VirtualKind::StrPlain { chars } => chars
            .iter()
            .map(|c| c.and_then(|c| ctx.value(c).get_constant_int()))
            .collect(),
        VirtualKind::StrConcat { left, right, .. } => {
            let mut chars = constant_chars(ctx, *left)?;
            chars.extend(constant_chars(ctx, *right)?);
            Some(chars)
        }
        VirtualKind::StrSlice {
            base,
            start,
            length,
        } => {
            let chars = constant_chars(ctx, *base)?;
            let start = usize::try_from(ctx.value(*start).get_constant_int()?).ok()?;
            let length = usize::try_from(ctx.value(*length).get_constant_int()?).ok()?;
            chars.get(start..start.checked_add(length)?).map(|s| s.to_vec())
        }
        _ => None,
    }
}

impl<'a> Chain<'a> {
    /// Constant-folding `int_add` for index arithmetic
    pub(crate) fn int_add(&mut self, a: Operand, b: Operand) -> Result<Operand> {
        match (self.ctx.get_constant_int(a), self.ctx.get_constant_int(b)) {
            (Some(x), Some(y)) => Ok(Operand::int(x.wrapping_add(y))),
            (Some(0), _) => Ok(b),
            (_, Some(0)) => Ok(a),
            _ => self.emit_new(Opcode::IntAdd, vec![a, b], None, BoxKind::Int),
        }
    }

    pub(crate) fn int_sub(&mut self, a: Operand, b: Operand) -> Result<Operand> {
        match (self.ctx.get_constant_int(a), self.ctx.get_constant_int(b)) {
            (_, Some(0)) => Ok(a),
            (Some(x), Some(y)) => Ok(Operand::int(x.wrapping_sub(y))),
            _ => self.emit_new(Opcode::IntSub, vec![a, b], None, BoxKind::Int),
        }
    }

    /// Length of a string value, emitting `strlen` when it is not known
    pub fn strlen_of(&mut self, id: ValueId) -> Result<Operand> {
        if let Some(virt) = self.ctx.pending_virtual(id) {
            let kind = self.ctx.virtual_info(virt).kind.clone();
            return self.kind_strlen(virt, &kind);
        }
        if let Some(len) = known_strlen(self.ctx, id) {
            return Ok(len);
        }
        let s = self.ctx.value(id).operand;
        let key = self.ctx.pure_key(Opcode::Strlen, &[s], None);
        if let Some(hit) = self.ctx.get_pure(&key) {
            return Ok(self.ctx.value(hit).operand);
        }
        let len = self.emit_new(Opcode::Strlen, vec![s], None, BoxKind::Int)?;
        self.ctx.value_mut(id).make_nonnull();
        self.ctx.pure(Opcode::Strlen, &[s], len);
        Ok(len)
    }

    fn kind_strlen(&mut self, virt: VirtualId, kind: &VirtualKind) -> Result<Operand> {
        match kind {
            VirtualKind::StrPlain { chars } => Ok(Operand::int(chars.len() as i64)),
            VirtualKind::StrConcat {
                length: Some(length),
                ..
            } => Ok(*length),
            VirtualKind::StrConcat { left, right, .. } => {
                let l1 = self.strlen_of(*left)?;
                let l2 = self.strlen_of(*right)?;
                let length = self.int_add(l1, l2)?;
                if let VirtualKind::StrConcat { length: cached, .. } =
                    &mut self.ctx.virtual_info_mut(virt).kind
                {
                    *cached = Some(length);
                }
                Ok(length)
            }
            VirtualKind::StrSlice { length, .. } => Ok(self.ctx.value(*length).operand),
            _ => Ok(Operand::int(0)),
        }
    }

    /// Materialize a string virtual into `keybox`
    pub(crate) fn force_string(
        &mut self,
        virt: VirtualId,
        keybox: BoxRef,
        kind: VirtualKind,
    ) -> Result<()> {
        let length = self.kind_strlen(virt, &kind)?;
        self.emit(Op::new(Opcode::Newstr, vec![length], Some(keybox)))?;
        self.copy_kind_parts(&kind, Operand::Box(keybox), Operand::int(0))?;
        Ok(())
    }

    /// Copy string `id` into `target` at `offset`; returns the end offset
    fn copy_parts(&mut self, id: ValueId, target: Operand, offset: Operand) -> Result<Operand> {
        if let Some(virt) = self.ctx.pending_virtual(id) {
            let kind = self.ctx.virtual_info(virt).kind.clone();
            return self.copy_kind_parts(&kind, target, offset);
        }
        let length = self.strlen_of(id)?;
        let src = self.force(id)?;
        self.copy_str_content(src, target, Operand::int(0), offset, length)
    }

    fn copy_kind_parts(
        &mut self,
        kind: &VirtualKind,
        target: Operand,
        mut offset: Operand,
    ) -> Result<Operand> {
        match kind {
            VirtualKind::StrPlain { chars } => {
                for ch in chars {
                    if let Some(ch) = ch {
                        let ch = self.ctx.value(*ch).operand;
                        if ch.const_int() != Some(0) {
                            self.emit(Op::new(Opcode::Strsetitem, vec![target, offset, ch], None))?;
                        }
                    }
                    offset = self.int_add(offset, Operand::int(1))?;
                }
                Ok(offset)
            }
            VirtualKind::StrConcat { left, right, .. } => {
                let offset = self.copy_parts(*left, target, offset)?;
                self.copy_parts(*right, target, offset)
            }
            VirtualKind::StrSlice {
                base,
                start,
                length,
            } => {
                let length = self.ctx.value(*length).operand;
                let start = self.ctx.value(*start).operand;
                let src = self.force(*base)?;
                self.copy_str_content(src, target, start, offset, length)
            }
            _ => Ok(offset),
        }
    }

    /// Copy `length` characters; returns the offset past the copied range
    fn copy_str_content(
        &mut self,
        src: Operand,
        dst: Operand,
        mut srcstart: Operand,
        mut dststart: Operand,
        length: Operand,
    ) -> Result<Operand> {
        let max_inline = if matches!(src, Operand::Const(Const::Ptr(_))) && srcstart.is_const() {
            self.ctx.policy.inline_copy_const_source
        } else {
            self.ctx.policy.inline_copy_limit
        };
        match self.ctx.get_constant_int(length) {
            Some(n) if n >= 0 && n as u64 <= max_inline as u64 => {
                let src_id = self.ctx.value_of(src);
                for _ in 0..n {
                    let ch = self.strgetitem_of(src_id, srcstart)?;
                    srcstart = self.int_add(srcstart, Operand::int(1))?;
                    self.emit(Op::new(Opcode::Strsetitem, vec![dst, dststart, ch], None))?;
                    dststart = self.int_add(dststart, Operand::int(1))?;
                }
                Ok(dststart)
            }
            _ => {
                let next = self.int_add(dststart, length)?;
                self.emit(Op::new(
                    Opcode::Copystrcontent,
                    vec![src, dst, srcstart, dststart, length],
                    None,
                ))?;
                Ok(next)
            }
        }
    }

    /// Character `index` of string `id`, resolved through the rope if possible
    pub fn strgetitem_of(&mut self, id: ValueId, index: Operand) -> Result<Operand> {
        let index = self.ctx.resolve(index);
        match self.ctx.virtual_kind(id).cloned() {
            Some(VirtualKind::StrPlain { chars }) => {
                if let Some(i) = self.ctx.get_constant_int(index) {
                    if let Some(Some(ch)) = usize::try_from(i).ok().and_then(|i| chars.get(i)) {
                        return Ok(self.ctx.value(*ch).operand);
                    }
                }
            }
            Some(VirtualKind::StrConcat { left, right, .. }) => {
                if let Some(i) = self.ctx.get_constant_int(index) {
                    let len1 = self.strlen_of(left)?;
                    if let Some(len1) = self.ctx.get_constant_int(len1) {
                        return if i < len1 {
                            self.strgetitem_of(left, Operand::int(i))
                        } else {
                            self.strgetitem_of(right, Operand::int(i - len1))
                        };
                    }
                }
            }
            Some(VirtualKind::StrSlice { base, start, .. }) => {
                let start = self.ctx.value(start).operand;
                let full = self.int_add(start, index)?;
                return self.strgetitem_of(base, full);
            }
            _ => {}
        }
        let s = self.force(id)?;
        self.ctx.value_mut(id).make_nonnull();
        self.emit_new(Opcode::Strgetitem, vec![s, index], None, BoxKind::Int)
    }
}

/// The string pass
#[derive(Default)]
pub struct OptString {
    /// The previous operation was a call this pass removed
    last_removed: bool,
}

impl OptString {
    pub fn new() -> Self {
        Self::default()
    }

    fn optimize_newstr(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        match chain.ctx.get_constant_int(op.arg(0)) {
            Some(n) if (0..=MAX_CONST_LEN).contains(&n) => {
                let source = op.copy_and_change(Opcode::Newstr, vec![Operand::int(n)]);
                chain.ctx.new_virtual(
                    result,
                    source,
                    VirtualKind::StrPlain {
                        chars: vec![None; n as usize],
                    },
                );
                Ok(())
            }
            _ => {
                let length = op.arg(0);
                let id = chain.value(Operand::Box(result));
                chain.ctx.value_mut(id).make_nonnull();
                chain.emit(op)?;
                chain.ctx.pure(Opcode::Strlen, &[Operand::Box(result)], length);
                Ok(())
            }
        }
    }

    fn optimize_strsetitem(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let index = chain.ctx.get_constant_int(op.arg(1));
        let ch = chain.value(op.arg(2));
        if let (Some(index), Some(VirtualKind::StrPlain { chars })) =
            (index, chain.ctx.virtual_kind_mut(id))
        {
            if let Some(slot) = usize::try_from(index).ok().and_then(|i| chars.get_mut(i)) {
                *slot = Some(ch);
                return Ok(());
            }
        }
        chain.ctx.value_mut(id).make_nonnull();
        chain.emit(op)
    }

    fn optimize_strgetitem(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        if !chain.ctx.is_virtual(id) {
            chain.ctx.value_mut(id).make_nonnull();
            return chain.emit(op);
        }
        let ch = chain.strgetitem_of(id, op.arg(1))?;
        chain.ctx.make_equal_to(result, ch)
    }

    fn optimize_strlen(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let id = chain.value(op.arg(0));
        let Some(result) = op.result else {
            return chain.emit(op);
        };
        if !chain.ctx.is_virtual(id) {
            return chain.emit(op);
        }
        let length = chain.strlen_of(id)?;
        chain.ctx.make_equal_to(result, length)
    }

    fn optimize_copystrcontent(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        // src dst srcstart dststart length
        let src = chain.value(op.arg(0));
        let dst = chain.value(op.arg(1));
        let length = chain.ctx.get_constant_int(op.arg(4));
        if length == Some(0) {
            return Ok(());
        }
        let dst_plain = matches!(chain.ctx.virtual_kind(dst), Some(VirtualKind::StrPlain { .. }));
        let starts = (
            chain.ctx.get_constant_int(op.arg(2)),
            chain.ctx.get_constant_int(op.arg(3)),
        );
        if let (true, (Some(src_start), Some(dst_start)), Some(length)) =
            (chain.ctx.is_virtual(src), starts, length)
        {
            if length < 20 || dst_plain {
                for index in 0..length {
                    let ch = chain.strgetitem_of(src, Operand::int(src_start + index))?;
                    let target = dst_start + index;
                    let ch_id = chain.value(ch);
                    if let Some(VirtualKind::StrPlain { chars }) = chain.ctx.virtual_kind_mut(dst) {
                        if let Some(slot) = usize::try_from(target).ok().and_then(|i| chars.get_mut(i)) {
                            *slot = Some(ch_id);
                            continue;
                        }
                    }
                    let dst_box = chain.force(dst)?;
                    chain.emit(Op::new(
                        Opcode::Strsetitem,
                        vec![dst_box, Operand::int(target), ch],
                        None,
                    ))?;
                }
                return Ok(());
            }
        }
        let src_box = chain.force(src)?;
        let dst_box = chain.force(dst)?;
        chain.copy_str_content(src_box, dst_box, op.arg(2), op.arg(3), op.arg(4))?;
        Ok(())
    }

    /// Returns true when the call was replaced
    fn optimize_call(&mut self, op: &Op, chain: &mut Chain<'_>) -> Result<bool> {
        let oopspec = op
            .descr
            .as_ref()
            .and_then(|d| d.effect_info())
            .map(|e| e.oopspec)
            .unwrap_or_default();
        let Some(result) = op.result else {
            return Ok(false);
        };
        match oopspec {
            OopSpec::StrConcat if op.num_args() == 3 => {
                let left = chain.value(op.arg(1));
                let right = chain.value(op.arg(2));
                chain.ctx.value_mut(left).make_nonnull();
                chain.ctx.value_mut(right).make_nonnull();
                debug!(result = %result, "virtual string concat");
                chain.ctx.new_virtual(
                    result,
                    op.clone(),
                    VirtualKind::StrConcat {
                        left,
                        right,
                        length: None,
                    },
                );
                Ok(true)
            }
            OopSpec::StrSlice if op.num_args() == 4 => self.optimize_str_slice(op, result, chain),
            OopSpec::StrEqual if op.num_args() == 3 => self.optimize_str_equal(op, result, chain),
            _ => Ok(false),
        }
    }

    fn optimize_str_slice(&mut self, op: &Op, result: BoxRef, chain: &mut Chain<'_>) -> Result<bool> {
        let vstr = chain.value(op.arg(1));
        let start = chain.ctx.resolve(op.arg(2));
        let stop = chain.ctx.resolve(op.arg(3));

        let bounds = (chain.ctx.get_constant_int(start), chain.ctx.get_constant_int(stop));
        if let (Some(VirtualKind::StrPlain { chars }), (Some(a), Some(b))) =
            (chain.ctx.virtual_kind(vstr), bounds)
        {
            if 0 <= a && a <= b && b as usize <= chars.len() {
                let chars = chars[a as usize..b as usize].to_vec();
                chain.ctx.new_virtual(result, op.clone(), VirtualKind::StrPlain { chars });
                return Ok(true);
            }
        }

        chain.ctx.value_mut(vstr).make_nonnull();
        let length = chain.int_sub(stop, start)?;
        let (base, start) = match chain.ctx.virtual_kind(vstr) {
            Some(VirtualKind::StrSlice { base, start: inner, .. }) => {
                let (base, inner) = (*base, chain.ctx.value(*inner).operand);
                (base, chain.int_add(inner, start)?)
            }
            _ => (vstr, start),
        };
        let start = chain.value(start);
        let length = chain.value(length);
        chain.ctx.new_virtual(
            result,
            op.clone(),
            VirtualKind::StrSlice {
                base,
                start,
                length,
            },
        );
        Ok(true)
    }

    fn optimize_str_equal(&mut self, op: &Op, result: BoxRef, chain: &mut Chain<'_>) -> Result<bool> {
        let v1 = chain.value(op.arg(1));
        let v2 = chain.value(op.arg(2));
        let l1 = known_strlen(chain.ctx, v1);
        let l2 = known_strlen(chain.ctx, v2);
        let const_len = |l: Option<Operand>| l.and_then(|l| l.const_int());
        if let (Some(a), Some(b)) = (const_len(l1), const_len(l2)) {
            if a != b {
                chain.ctx.make_constant_int(result, 0)?;
                return Ok(true);
            }
        }
        if let (Some(c1), Some(c2)) = (constant_chars(chain.ctx, v1), constant_chars(chain.ctx, v2)) {
            chain.ctx.make_constant_int(result, (c1 == c2) as i64)?;
            return Ok(true);
        }

        if self.str_equal_level1(v1, v2, result, chain)?
            || self.str_equal_level1(v2, v1, result, chain)?
            || self.str_equal_level2(v1, v2, result, chain)?
            || self.str_equal_level2(v2, v1, result, chain)?
        {
            return Ok(true);
        }

        if chain.ctx.value(v1).is_nonnull() && chain.ctx.value(v2).is_nonnull() {
            let helper = match (l1, l2) {
                (Some(a), Some(b)) if a == b => OopSpec::StreqLengthok,
                _ => OopSpec::StreqNonnull,
            };
            let a = chain.force(v1)?;
            let b = chain.force(v2)?;
            self.generate_modified_call(helper, vec![a, b], result, chain)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn str_equal_level1(
        &mut self,
        v1: ValueId,
        v2: ValueId,
        result: BoxRef,
        chain: &mut Chain<'_>,
    ) -> Result<bool> {
        match known_strlen(chain.ctx, v2).and_then(|l| l.const_int()) {
            Some(0) => {
                let length = chain.strlen_of(v1)?;
                chain.emit(Op::new(Opcode::IntEq, vec![length, Operand::int(0)], Some(result)))?;
                return Ok(true);
            }
            Some(1) => {
                if known_strlen(chain.ctx, v1).and_then(|l| l.const_int()) == Some(1) {
                    let c1 = chain.strgetitem_of(v1, Operand::int(0))?;
                    let c2 = chain.strgetitem_of(v2, Operand::int(0))?;
                    chain.emit(Op::new(Opcode::IntEq, vec![c1, c2], Some(result)))?;
                    return Ok(true);
                }
                if let Some(VirtualKind::StrSlice {
                    base,
                    start,
                    length,
                }) = chain.ctx.virtual_kind(v1).cloned()
                {
                    let ch = chain.strgetitem_of(v2, Operand::int(0))?;
                    let base = chain.force(base)?;
                    let args = vec![
                        base,
                        chain.ctx.value(start).operand,
                        chain.ctx.value(length).operand,
                        ch,
                    ];
                    self.generate_modified_call(OopSpec::StreqSliceChar, args, result, chain)?;
                    return Ok(true);
                }
            }
            _ => {}
        }
        if chain.ctx.value(v2).is_null() {
            if chain.ctx.value(v1).is_nonnull() {
                chain.ctx.make_constant_int(result, 0)?;
            } else if chain.ctx.value(v1).is_null() {
                chain.ctx.make_constant_int(result, 1)?;
            } else {
                let s = chain.force(v1)?;
                chain.emit(Op::new(
                    Opcode::PtrEq,
                    vec![s, Operand::Const(Const::NULL)],
                    Some(result),
                ))?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn str_equal_level2(
        &mut self,
        v1: ValueId,
        v2: ValueId,
        result: BoxRef,
        chain: &mut Chain<'_>,
    ) -> Result<bool> {
        if known_strlen(chain.ctx, v2).and_then(|l| l.const_int()) == Some(1) {
            let ch = chain.strgetitem_of(v2, Operand::int(0))?;
            let helper = if chain.ctx.value(v1).is_nonnull() {
                OopSpec::StreqNonnullChar
            } else {
                OopSpec::StreqChecknullChar
            };
            let s = chain.force(v1)?;
            self.generate_modified_call(helper, vec![s, ch], result, chain)?;
            return Ok(true);
        }
        if let Some(VirtualKind::StrSlice {
            base,
            start,
            length,
        }) = chain.ctx.virtual_kind(v1).cloned()
        {
            let helper = if chain.ctx.value(v2).is_nonnull() {
                OopSpec::StreqSliceNonnull
            } else {
                OopSpec::StreqSliceChecknull
            };
            let base = chain.force(base)?;
            let other = chain.force(v2)?;
            let args = vec![
                base,
                chain.ctx.value(start).operand,
                chain.ctx.value(length).operand,
                other,
            ];
            self.generate_modified_call(helper, args, result, chain)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn generate_modified_call(
        &mut self,
        helper: OopSpec,
        args: Vec<Operand>,
        result: BoxRef,
        chain: &mut Chain<'_>,
    ) -> Result<()> {
        debug!(helper = helper.name(), "lowering string equality");
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(Operand::int(helper.func_addr()));
        call_args.extend(args);
        chain.emit(Op::new(Opcode::Call, call_args, Some(result)).with_descr(Descr::helper(helper)))
    }
}

impl Pass for OptString {
    fn name(&self) -> &'static str {
        "string"
    }

    fn propagate(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let removed_before = std::mem::replace(&mut self.last_removed, false);
        match op.opcode {
            Opcode::Newstr => self.optimize_newstr(op, chain),
            Opcode::Strsetitem => self.optimize_strsetitem(op, chain),
            Opcode::Strgetitem => self.optimize_strgetitem(op, chain),
            Opcode::Strlen => self.optimize_strlen(op, chain),
            Opcode::Copystrcontent => self.optimize_copystrcontent(op, chain),
            Opcode::Call | Opcode::CallPure => {
                if self.optimize_call(&op, chain)? {
                    self.last_removed = true;
                    Ok(())
                } else {
                    chain.emit(op)
                }
            }
            Opcode::GuardNoException if removed_before => Ok(()),
            _ => chain.emit(op),
        }
    }
}
