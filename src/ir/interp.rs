//! Reference interpreter for traces
//!
//! Executes a trace on concrete values so tests can compare what an
//! optimized trace computes with what the original computed. Runtime values
//! are plain [`Const`]s; heap objects live in an arena addressed by
//! `Const::Ptr(index + 1)`, so `NULL` never names an object.
//!
//! A guard failure rebuilds the fail-arguments the way the resume mechanism
//! would: virtuals described in the guard's resume data are allocated and
//! filled, and pending field stores are replayed.

use super::descr::{Descr, OopSpec};
use super::eval::{eval_ovf, eval_pure};
use super::opcode::Opcode;
use super::operation::{BoxKind, BoxRef, Const, Op, Operand};
use super::Trace;
use crate::error::{OptError, Result};
use crate::opt::resume::{ResumeData, ResumeSlot};
use crate::opt::virtuals::VirtualShape;
use rustc_hash::FxHashMap as HashMap;

/// A heap object
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Struct {
        class: Option<i64>,
        fields: HashMap<Descr, Const>,
    },
    Array {
        items: Vec<Const>,
        /// Per-element fields for arrays of structs
        interior: Vec<HashMap<Descr, Const>>,
    },
    Str(Vec<i64>),
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Finished(Vec<Const>),
    /// A guard failed; the values are the rebuilt fail-arguments
    GuardFailed {
        guard: Opcode,
        values: Vec<Const>,
    },
    /// The iteration budget ran out at a jump with these arguments
    Jumped(Vec<Const>),
}

/// One call made by the trace
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub func: Const,
    pub args: Vec<Const>,
}

#[derive(Debug, Default)]
pub struct Interpreter {
    pub heap: Vec<Object>,
    pub calls: Vec<CallRecord>,
    /// Result of opaque calls, by function address
    pub call_results: HashMap<i64, Const>,
    env: HashMap<BoxRef, Const>,
    overflowed: bool,
}

fn internal(message: impl Into<String>) -> OptError {
    OptError::internal(format!("interpreter: {}", message.into()))
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Heap ====================

    pub fn alloc(&mut self, object: Object) -> Const {
        self.heap.push(object);
        Const::Ptr(self.heap.len() as u64)
    }

    /// Allocate a string with the given contents
    pub fn alloc_str(&mut self, s: &str) -> Const {
        self.alloc(Object::Str(s.bytes().map(i64::from).collect()))
    }

    pub fn object(&self, ptr: Const) -> Result<&Object> {
        match ptr {
            Const::Ptr(addr) if addr > 0 => self
                .heap
                .get(addr as usize - 1)
                .ok_or_else(|| internal(format!("dangling pointer {}", ptr))),
            _ => Err(internal(format!("dereferenced {}", ptr))),
        }
    }

    fn object_mut(&mut self, ptr: Const) -> Result<&mut Object> {
        match ptr {
            Const::Ptr(addr) if addr > 0 => self
                .heap
                .get_mut(addr as usize - 1)
                .ok_or_else(|| internal(format!("dangling pointer {}", ptr))),
            _ => Err(internal(format!("dereferenced {}", ptr))),
        }
    }

    /// Field of a struct, the default value when never written
    pub fn field(&self, ptr: Const, descr: &Descr) -> Result<Const> {
        match self.object(ptr)? {
            Object::Struct { fields, .. } => Ok(fields.get(descr).copied().unwrap_or_else(|| default_of(descr))),
            _ => Err(internal(format!("{} is not a struct", ptr))),
        }
    }

    fn set_field(&mut self, ptr: Const, descr: &Descr, value: Const) -> Result<()> {
        match self.object_mut(ptr)? {
            Object::Struct { fields, .. } => {
                fields.insert(descr.clone(), value);
                Ok(())
            }
            _ => Err(internal(format!("{} is not a struct", ptr))),
        }
    }

    fn array_items(&mut self, ptr: Const) -> Result<(&mut Vec<Const>, &mut Vec<HashMap<Descr, Const>>)> {
        match self.object_mut(ptr)? {
            Object::Array { items, interior } => Ok((items, interior)),
            _ => Err(internal(format!("{} is not an array", ptr))),
        }
    }

    /// Characters of a string object
    pub fn chars(&self, ptr: Const) -> Result<&[i64]> {
        match self.object(ptr)? {
            Object::Str(chars) => Ok(chars),
            _ => Err(internal(format!("{} is not a string", ptr))),
        }
    }

    /// Contents of a string object as text
    pub fn string(&self, ptr: Const) -> Result<String> {
        Ok(self.chars(ptr)?.iter().map(|c| (*c as u8) as char).collect())
    }

    // ==================== Execution ====================

    fn get(&self, operand: &Operand) -> Result<Const> {
        match operand {
            Operand::Const(c) => Ok(*c),
            Operand::Box(b) => self
                .env
                .get(b)
                .copied()
                .ok_or_else(|| internal(format!("{} read before definition", b))),
        }
    }

    fn args(&self, op: &Op) -> Result<Vec<Const>> {
        op.args.iter().map(|a| self.get(a)).collect()
    }

    fn int(&self, operand: &Operand) -> Result<i64> {
        self.get(operand)?
            .as_int()
            .ok_or_else(|| internal(format!("{} is not an integer", operand)))
    }

    fn index(&self, operand: &Operand) -> Result<usize> {
        usize::try_from(self.int(operand)?).map_err(|_| internal("negative index"))
    }

    fn descr<'o>(op: &'o Op) -> Result<&'o Descr> {
        op.descr
            .as_ref()
            .ok_or_else(|| internal(format!("{} needs a descr", op.opcode)))
    }

    /// Run `trace` from `inputs`, following at most `iterations` jumps
    ///
    /// A trace with a preamble runs the preamble first and then enters the
    /// loop body at its label.
    pub fn run(&mut self, trace: &Trace, inputs: &[Const], iterations: usize) -> Result<Outcome> {
        self.env.clear();
        let mut remaining = iterations;
        let body_inputs = match &trace.preamble {
            Some(preamble) => {
                bind(&mut self.env, &preamble.inputargs, inputs)?;
                match self.run_ops(&preamble.ops, trace.call_pure_results_for(preamble))? {
                    Step::Jump(values) => {
                        if remaining == 0 {
                            return Ok(Outcome::Jumped(values));
                        }
                        remaining -= 1;
                        values
                    }
                    Step::Done(outcome) => return Ok(outcome),
                }
            }
            None => inputs.to_vec(),
        };

        let label = trace.ops.iter().position(|op| op.opcode == Opcode::Label);
        let (header, start) = match label {
            Some(i) => (
                trace.ops[i]
                    .args
                    .iter()
                    .map(|a| a.as_box().ok_or_else(|| internal("constant label argument")))
                    .collect::<Result<Vec<_>>>()?,
                i + 1,
            ),
            None => (trace.inputargs.clone(), 0),
        };
        if label.is_some() && trace.preamble.is_none() {
            bind(&mut self.env, &trace.inputargs, &body_inputs)?;
        }
        let mut values = body_inputs;
        loop {
            bind(&mut self.env, &header, &values)?;
            match self.run_ops(&trace.ops[start..], &trace.call_pure_results)? {
                Step::Jump(next) => {
                    if remaining == 0 {
                        return Ok(Outcome::Jumped(next));
                    }
                    remaining -= 1;
                    values = next;
                }
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    fn run_ops(&mut self, ops: &[Op], pure_results: &HashMap<Vec<Const>, Const>) -> Result<Step> {
        for op in ops {
            if op.is_guard() {
                if !self.guard_holds(op)? {
                    let values = self.rebuild(op)?;
                    return Ok(Step::Done(Outcome::GuardFailed {
                        guard: op.opcode,
                        values,
                    }));
                }
                continue;
            }
            match op.opcode {
                Opcode::Jump => return Ok(Step::Jump(self.args(op)?)),
                Opcode::Finish => return Ok(Step::Done(Outcome::Finished(self.args(op)?))),
                _ => {}
            }
            let result = self.execute(op, pure_results)?;
            if let (Some(b), Some(v)) = (op.result, result) {
                self.env.insert(b, v);
            }
        }
        Err(internal("trace ended without jump or finish"))
    }

    fn guard_holds(&self, op: &Op) -> Result<bool> {
        let holds = match op.opcode {
            Opcode::GuardTrue => self.get(&op.arg(0))?.nonnull(),
            Opcode::GuardFalse => !self.get(&op.arg(0))?.nonnull(),
            Opcode::GuardValue => self.get(&op.arg(0))?.same_constant(&self.get(&op.arg(1))?),
            Opcode::GuardNonnull => self.get(&op.arg(0))?.nonnull(),
            Opcode::GuardIsnull => !self.get(&op.arg(0))?.nonnull(),
            Opcode::GuardClass => self.class_of(self.get(&op.arg(0))?)? == self.get(&op.arg(1))?.as_int(),
            Opcode::GuardNonnullClass => {
                let p = self.get(&op.arg(0))?;
                p.nonnull() && self.class_of(p)? == self.get(&op.arg(1))?.as_int()
            }
            Opcode::GuardNoOverflow => !self.overflowed,
            Opcode::GuardOverflow => self.overflowed,
            Opcode::GuardException => false,
            Opcode::GuardNoException | Opcode::GuardNotForced | Opcode::GuardNotInvalidated => true,
            other => return Err(internal(format!("{} is not a guard", other))),
        };
        Ok(holds)
    }

    fn class_of(&self, p: Const) -> Result<Option<i64>> {
        match self.object(p)? {
            Object::Struct { class, .. } => Ok(*class),
            _ => Ok(None),
        }
    }

    fn execute(&mut self, op: &Op, pure_results: &HashMap<Vec<Const>, Const>) -> Result<Option<Const>> {
        if op.opcode.is_ovf() {
            let (a, b) = (self.int(&op.arg(0))?, self.int(&op.arg(1))?);
            let value = match eval_ovf(op.opcode, a, b) {
                Some(v) => {
                    self.overflowed = false;
                    v
                }
                None => {
                    self.overflowed = true;
                    eval_pure(op.opcode.without_ovf(), &[Const::Int(a), Const::Int(b)])
                        .and_then(|c| c.as_int())
                        .unwrap_or(0)
                }
            };
            return Ok(Some(Const::Int(value)));
        }
        let value = match op.opcode {
            Opcode::Label
            | Opcode::DebugMergePoint
            | Opcode::RecordKnownClass
            | Opcode::QuasiimmutField
            | Opcode::VirtualRefFinish => None,
            Opcode::GetfieldGc | Opcode::GetfieldGcPure | Opcode::GetfieldRaw => {
                let p = self.get(&op.arg(0))?;
                Some(self.field(p, Self::descr(op)?)?)
            }
            Opcode::SetfieldGc | Opcode::SetfieldRaw => {
                let p = self.get(&op.arg(0))?;
                let v = self.get(&op.arg(1))?;
                self.set_field(p, Self::descr(op)?, v)?;
                None
            }
            Opcode::New | Opcode::NewWithVtable => {
                let descr = Self::descr(op)?;
                let class = descr
                    .known_class()
                    .or_else(|| op.args.first().and_then(|a| a.const_int()));
                Some(self.alloc(Object::Struct {
                    class,
                    fields: HashMap::default(),
                }))
            }
            Opcode::NewArray => {
                let len = self.index(&op.arg(0))?;
                let default = Self::descr(op)?.value_kind().unwrap_or(BoxKind::Int).default_const();
                Some(self.alloc(Object::Array {
                    items: vec![default; len],
                    interior: vec![HashMap::default(); len],
                }))
            }
            Opcode::GetarrayitemGc | Opcode::GetarrayitemGcPure => {
                let p = self.get(&op.arg(0))?;
                let i = self.index(&op.arg(1))?;
                let (items, _) = self.array_items(p)?;
                Some(*items.get(i).ok_or_else(|| internal("array index out of range"))?)
            }
            Opcode::SetarrayitemGc => {
                let p = self.get(&op.arg(0))?;
                let i = self.index(&op.arg(1))?;
                let v = self.get(&op.arg(2))?;
                let (items, _) = self.array_items(p)?;
                *items.get_mut(i).ok_or_else(|| internal("array index out of range"))? = v;
                None
            }
            Opcode::GetinteriorfieldGc => {
                let p = self.get(&op.arg(0))?;
                let i = self.index(&op.arg(1))?;
                let descr = Self::descr(op)?.clone();
                let (_, interior) = self.array_items(p)?;
                let fields = interior.get(i).ok_or_else(|| internal("array index out of range"))?;
                Some(fields.get(&descr).copied().unwrap_or_else(|| default_of(&descr)))
            }
            Opcode::SetinteriorfieldGc => {
                let p = self.get(&op.arg(0))?;
                let i = self.index(&op.arg(1))?;
                let v = self.get(&op.arg(2))?;
                let descr = Self::descr(op)?.clone();
                let (_, interior) = self.array_items(p)?;
                interior
                    .get_mut(i)
                    .ok_or_else(|| internal("array index out of range"))?
                    .insert(descr, v);
                None
            }
            Opcode::ArraylenGc => {
                let p = self.get(&op.arg(0))?;
                let (items, _) = self.array_items(p)?;
                Some(Const::Int(items.len() as i64))
            }
            Opcode::Newstr => {
                let len = self.index(&op.arg(0))?;
                Some(self.alloc(Object::Str(vec![0; len])))
            }
            Opcode::Strlen => {
                let p = self.get(&op.arg(0))?;
                Some(Const::Int(self.chars(p)?.len() as i64))
            }
            Opcode::Strgetitem => {
                let p = self.get(&op.arg(0))?;
                let i = self.index(&op.arg(1))?;
                let ch = self.chars(p)?.get(i).copied();
                Some(Const::Int(ch.ok_or_else(|| internal("string index out of range"))?))
            }
            Opcode::Strsetitem => {
                let p = self.get(&op.arg(0))?;
                let i = self.index(&op.arg(1))?;
                let ch = self.int(&op.arg(2))?;
                match self.object_mut(p)? {
                    Object::Str(chars) => {
                        *chars.get_mut(i).ok_or_else(|| internal("string index out of range"))? = ch;
                    }
                    _ => return Err(internal("strsetitem on a non-string")),
                }
                None
            }
            Opcode::Copystrcontent => {
                let src = self.get(&op.arg(0))?;
                let dst = self.get(&op.arg(1))?;
                let (s0, d0, n) = (
                    self.index(&op.arg(2))?,
                    self.index(&op.arg(3))?,
                    self.index(&op.arg(4))?,
                );
                let piece = self
                    .chars(src)?
                    .get(s0..s0 + n)
                    .ok_or_else(|| internal("copy source out of range"))?
                    .to_vec();
                match self.object_mut(dst)? {
                    Object::Str(chars) => chars
                        .get_mut(d0..d0 + n)
                        .ok_or_else(|| internal("copy target out of range"))?
                        .copy_from_slice(&piece),
                    _ => return Err(internal("copystrcontent into a non-string")),
                }
                None
            }
            Opcode::Call | Opcode::CallMayForce | Opcode::CallLoopinvariant | Opcode::CallPure => {
                let args = self.args(op)?;
                if op.opcode == Opcode::CallPure {
                    if let Some(v) = pure_results.get(&args) {
                        return Ok(Some(*v));
                    }
                }
                self.call(op, args)?
            }
            Opcode::CondCall => {
                let args = self.args(op)?;
                if args.first().map(|c| c.nonnull()).unwrap_or(false) {
                    self.call(op, args[1..].to_vec())?;
                }
                None
            }
            Opcode::Escape => {
                let args = self.args(op)?;
                self.calls.push(CallRecord {
                    func: Const::Int(-1),
                    args,
                });
                None
            }
            Opcode::VirtualRef | Opcode::SameAs => Some(self.get(&op.arg(0))?),
            Opcode::ForceToken => Some(Const::Ptr(u64::MAX)),
            _ => {
                let args = self.args(op)?;
                let value = eval_pure(op.opcode, &args)
                    .ok_or_else(|| internal(format!("cannot evaluate {}", op)))?;
                Some(value)
            }
        };
        Ok(value)
    }

    /// A call; `args[0]` is the function
    fn call(&mut self, op: &Op, args: Vec<Const>) -> Result<Option<Const>> {
        let oopspec = op
            .descr
            .as_ref()
            .and_then(|d| d.effect_info())
            .map(|e| e.oopspec)
            .unwrap_or_default();
        let func = *args.first().ok_or_else(|| internal("call without function"))?;
        let a = &args[1..];
        let value = match oopspec {
            OopSpec::None => {
                let result = op.descr.as_ref().and_then(|d| d.value_kind());
                self.calls.push(CallRecord {
                    func,
                    args: a.to_vec(),
                });
                let ret = func
                    .as_int()
                    .and_then(|f| self.call_results.get(&f).copied())
                    .or_else(|| result.map(|k| k.default_const()));
                return Ok(ret);
            }
            OopSpec::StrConcat => {
                let mut chars = self.chars(a[0])?.to_vec();
                chars.extend_from_slice(self.chars(a[1])?);
                self.alloc(Object::Str(chars))
            }
            OopSpec::StrSlice => {
                let (start, stop) = (int_of(a[1])?, int_of(a[2])?);
                let chars = self
                    .chars(a[0])?
                    .get(start..stop)
                    .ok_or_else(|| internal("slice out of range"))?
                    .to_vec();
                self.alloc(Object::Str(chars))
            }
            OopSpec::StrEqual => {
                let eq = match (a[0].nonnull(), a[1].nonnull()) {
                    (false, false) => true,
                    (true, true) => self.chars(a[0])? == self.chars(a[1])?,
                    _ => false,
                };
                Const::Int(eq as i64)
            }
            OopSpec::StreqSliceChar => {
                let (start, len, ch) = (int_of(a[1])?, int_of(a[2])?, a[3].as_int());
                let s = self.chars(a[0])?;
                Const::Int((len == 1 && s.get(start).copied() == ch) as i64)
            }
            OopSpec::StreqNonnullChar | OopSpec::StreqChecknullChar => {
                if !a[0].nonnull() {
                    Const::Int(0)
                } else {
                    let s = self.chars(a[0])?;
                    Const::Int((s.len() == 1 && Some(s[0]) == a[1].as_int()) as i64)
                }
            }
            OopSpec::StreqSliceNonnull | OopSpec::StreqSliceChecknull => {
                if !a[3].nonnull() {
                    Const::Int(0)
                } else {
                    let (start, len) = (int_of(a[1])?, int_of(a[2])?);
                    let slice = self
                        .chars(a[0])?
                        .get(start..start + len)
                        .ok_or_else(|| internal("slice out of range"))?;
                    Const::Int((slice == self.chars(a[3])?) as i64)
                }
            }
            OopSpec::StreqLengthok | OopSpec::StreqNonnull => {
                Const::Int((self.chars(a[0])? == self.chars(a[1])?) as i64)
            }
        };
        Ok(Some(value))
    }

    // ==================== Resume ====================

    fn rebuild(&mut self, guard: &Op) -> Result<Vec<Const>> {
        let live: Vec<Const> = match &guard.fail_args {
            Some(args) => args.iter().map(|a| self.get(a)).collect::<Result<_>>()?,
            None => Vec::new(),
        };
        match &guard.resume {
            Some(resume) => self.rebuild_from(resume, &live),
            None => Ok(live),
        }
    }

    fn rebuild_from(&mut self, resume: &ResumeData, live: &[Const]) -> Result<Vec<Const>> {
        // allocate every virtual first so cyclic references resolve
        let mut addrs = Vec::with_capacity(resume.virtuals.len());
        for v in &resume.virtuals {
            let object = match &v.shape {
                VirtualShape::Instance { class, .. } => Object::Struct {
                    class: Some(*class),
                    fields: HashMap::default(),
                },
                VirtualShape::Struct { .. } => Object::Struct {
                    class: None,
                    fields: HashMap::default(),
                },
                VirtualShape::Array { descr, length } => Object::Array {
                    items: vec![default_of(descr); *length],
                    interior: vec![HashMap::default(); *length],
                },
                VirtualShape::ArrayStruct { length, .. } => Object::Array {
                    items: vec![Const::Int(0); *length],
                    interior: vec![HashMap::default(); *length],
                },
                VirtualShape::StrPlain { length } => Object::Str(vec![0; *length]),
                VirtualShape::StrConcat | VirtualShape::StrSlice => Object::Str(Vec::new()),
            };
            addrs.push(self.alloc(object));
        }
        let slot = |s: &ResumeSlot| -> Result<Const> {
            match s {
                ResumeSlot::Box(i) => live.get(*i).copied().ok_or_else(|| internal("bad live index")),
                ResumeSlot::Const(c) => Ok(*c),
                ResumeSlot::Virtual(i) => addrs.get(*i).copied().ok_or_else(|| internal("bad virtual index")),
            }
        };
        // children are numbered after their parents, so fill back to front
        for (v, addr) in resume.virtuals.iter().zip(&addrs).rev() {
            let values: Vec<Const> = v.fields.iter().map(|f| slot(&f.slot)).collect::<Result<_>>()?;
            match &v.shape {
                VirtualShape::StrConcat => {
                    let mut chars = self.chars(values[0])?.to_vec();
                    chars.extend_from_slice(self.chars(values[1])?);
                    *self.object_mut(*addr)? = Object::Str(chars);
                }
                VirtualShape::StrSlice => {
                    let (start, len) = (int_of(values[1])?, int_of(values[2])?);
                    let chars = self
                        .chars(values[0])?
                        .get(start..start + len)
                        .ok_or_else(|| internal("slice out of range"))?
                        .to_vec();
                    *self.object_mut(*addr)? = Object::Str(chars);
                }
                _ => {
                    for (field, value) in v.fields.iter().zip(values) {
                        self.store_rebuilt(*addr, field.descr.as_ref(), field.index, value)?;
                    }
                }
            }
        }
        for p in &resume.pending_fields {
            let target = slot(&p.target)?;
            let value = slot(&p.value)?;
            match p.index {
                Some(i) => {
                    let i = usize::try_from(i).map_err(|_| internal("negative index"))?;
                    let (items, _) = self.array_items(target)?;
                    *items.get_mut(i).ok_or_else(|| internal("array index out of range"))? = value;
                }
                None => self.set_field(target, &p.descr, value)?,
            }
        }
        resume.slots.iter().map(slot).collect()
    }

    fn store_rebuilt(&mut self, addr: Const, descr: Option<&Descr>, index: Option<usize>, value: Const) -> Result<()> {
        match (self.object_mut(addr)?, descr, index) {
            (Object::Struct { fields, .. }, Some(d), None) => {
                fields.insert(d.clone(), value);
            }
            (Object::Array { interior, .. }, Some(d), Some(i)) => {
                if let Some(fields) = interior.get_mut(i) {
                    fields.insert(d.clone(), value);
                }
            }
            (Object::Array { items, .. }, None, Some(i)) => {
                if let Some(item) = items.get_mut(i) {
                    *item = value;
                }
            }
            (Object::Str(chars), None, Some(i)) => {
                if let (Some(ch), Some(v)) = (chars.get_mut(i), value.as_int()) {
                    *ch = v;
                }
            }
            _ => return Err(internal("resume field does not fit its virtual")),
        }
        Ok(())
    }
}

enum Step {
    Jump(Vec<Const>),
    Done(Outcome),
}

fn default_of(descr: &Descr) -> Const {
    descr.value_kind().unwrap_or(BoxKind::Int).default_const()
}

fn int_of(c: Const) -> Result<usize> {
    c.as_int()
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| internal(format!("{} is not an index", c)))
}

fn bind(env: &mut HashMap<BoxRef, Const>, boxes: &[BoxRef], values: &[Const]) -> Result<()> {
    if boxes.len() != values.len() {
        return Err(internal(format!(
            "{} values for {} inputs",
            values.len(),
            boxes.len()
        )));
    }
    for (b, v) in boxes.iter().zip(values) {
        env.insert(*b, *v);
    }
    Ok(())
}

impl Trace {
    fn call_pure_results_for<'t>(&'t self, part: &'t Trace) -> &'t HashMap<Vec<Const>, Const> {
        if part.call_pure_results.is_empty() {
            &self.call_pure_results
        } else {
            &part.call_pure_results
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse;

    #[test]
    fn test_counting_loop_runs_until_guard_fails() {
        let (trace, _) = parse(
            "[i0]
             i1 = int_add(i0, 1)
             i2 = int_lt(i1, 5)
             guard_true(i2) [i1]
             jump(i1)",
        )
        .unwrap();
        let mut interp = Interpreter::new();
        let outcome = interp.run(&trace, &[Const::Int(0)], 100).unwrap();
        assert_eq!(
            outcome,
            Outcome::GuardFailed {
                guard: Opcode::GuardTrue,
                values: vec![Const::Int(5)]
            }
        );
        let outcome = interp.run(&trace, &[Const::Int(0)], 2).unwrap();
        assert_eq!(outcome, Outcome::Jumped(vec![Const::Int(3)]));
    }

    #[test]
    fn test_heap_and_strings() {
        let (trace, _) = parse(
            "descr valuedescr = field(node, int)
             descr nodesize = size()
             [i0]
             p1 = new(descr=nodesize)
             setfield_gc(p1, i0, descr=valuedescr)
             i2 = getfield_gc(p1, descr=valuedescr)
             p3 = newstr(2)
             strsetitem(p3, 0, 104)
             strsetitem(p3, 1, i2)
             i4 = strlen(p3)
             finish(i2, i4, p3)",
        )
        .unwrap();
        let mut interp = Interpreter::new();
        let Outcome::Finished(values) = interp.run(&trace, &[Const::Int(105)], 0).unwrap() else {
            panic!("expected finish");
        };
        assert_eq!(values[0], Const::Int(105));
        assert_eq!(values[1], Const::Int(2));
        assert_eq!(interp.string(values[2]).unwrap(), "hi");
    }

    #[test]
    fn test_overflow_guard() {
        let (trace, _) = parse(
            "[i0]
             i1 = int_add_ovf(i0, 1)
             guard_no_overflow() [i0]
             finish(i1)",
        )
        .unwrap();
        let mut interp = Interpreter::new();
        assert_eq!(
            interp.run(&trace, &[Const::Int(1)], 0).unwrap(),
            Outcome::Finished(vec![Const::Int(2)])
        );
        assert!(matches!(
            interp.run(&trace, &[Const::Int(i64::MAX)], 0).unwrap(),
            Outcome::GuardFailed { .. }
        ));
    }

    #[test]
    fn test_opaque_calls_are_logged() {
        let (trace, _) = parse(
            "descr c = call(int)
             [i0]
             i1 = call(7, i0, descr=c)
             finish(i1)",
        )
        .unwrap();
        let mut interp = Interpreter::new();
        interp.call_results.insert(7, Const::Int(42));
        let outcome = interp.run(&trace, &[Const::Int(3)], 0).unwrap();
        assert_eq!(outcome, Outcome::Finished(vec![Const::Int(42)]));
        assert_eq!(
            interp.calls,
            vec![CallRecord {
                func: Const::Int(7),
                args: vec![Const::Int(3)]
            }]
        );
    }
}
