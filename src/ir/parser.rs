//! Parser for the textual trace format
//!
//! ```text
//! # comments start with '#'
//! class node = 0x40
//! descr nodesize = size(class=node)
//! descr valuedescr = field(node, int)
//! descr nextdescr = field(node, ptr)
//! descr loop = target()
//! [i0, p1]
//! i2 = getfield_gc(p1, descr=valuedescr)
//! i3 = int_add(i2, i0)
//! guard_true(i3) [i0, p1]
//! jump(i3, p1, descr=loop)
//! ```
//!
//! Box names carry their kind in the prefix (`i`, `p`, `f`). Constants are
//! integers, floats (with a `.`), `NULL`, `ConstPtr(n)` and `ConstClass(name)`.
//! A `call_pure_result(args) = value` line records a `call_pure` result seen
//! while tracing.

use super::descr::{Descr, EffectInfo, ExtraEffect, FieldInfo, OopSpec, SizeInfo};
use super::opcode::Opcode;
use super::operation::{BoxKind, BoxRef, Const, Op, Operand};
use super::Trace;
use crate::error::{OptError, Result};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

/// Descrs and classes declared so far
///
/// Parsing an expected trace with the namespace of the input trace makes
/// their descrs identical, which is what equivalence checks compare.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    descrs: HashMap<String, Descr>,
    classes: HashMap<String, i64>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descr(&self, name: &str) -> Option<Descr> {
        self.descrs.get(name).cloned()
    }

    pub fn class(&self, name: &str) -> Option<i64> {
        self.classes.get(name).copied()
    }

    pub fn insert_descr(&mut self, name: impl Into<String>, descr: Descr) {
        self.descrs.insert(name.into(), descr);
    }

    pub fn insert_class(&mut self, name: impl Into<String>, addr: i64) {
        self.classes.insert(name.into(), addr);
    }
}

/// Parse a trace into a fresh namespace
pub fn parse(text: &str) -> Result<(Trace, Namespace)> {
    let mut ns = Namespace::new();
    let trace = parse_with(text, &mut ns)?;
    Ok((trace, ns))
}

/// Parse a trace, resolving and extending `ns`
pub fn parse_with(text: &str, ns: &mut Namespace) -> Result<Trace> {
    let mut parser = Parser {
        ns,
        line: 0,
        defined: HashSet::default(),
    };
    let mut trace = Trace::default();
    let mut saw_inputs = false;
    for (index, raw) in text.lines().enumerate() {
        parser.line = index + 1;
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("descr ") {
            parser.parse_descr_decl(rest)?;
        } else if let Some(rest) = line.strip_prefix("class ") {
            parser.parse_class_decl(rest)?;
        } else if line.starts_with('[') && !saw_inputs && trace.ops.is_empty() {
            let inner = line
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
                .ok_or_else(|| parser.error("unterminated input list"))?;
            for name in split_top_level(inner) {
                let b = parser.parse_box(name)?;
                parser.defined.insert(b);
                trace.inputargs.push(b);
            }
            saw_inputs = true;
        } else if let Some(rest) = line.strip_prefix("call_pure_result(") {
            let (args, value) = parser.parse_call_pure_result(rest)?;
            trace.call_pure_results.insert(args, value);
        } else {
            let op = parser.parse_op(line)?;
            trace.ops.push(op);
        }
    }
    Ok(trace)
}

struct Parser<'n> {
    ns: &'n mut Namespace,
    line: usize,
    defined: HashSet<BoxRef>,
}

/// Split on commas that are not nested in parentheses or brackets
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

/// Byte index of the parenthesis closing the one at `open`
fn matching_paren(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in s[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = match body.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => body.parse::<i64>().ok()?,
    };
    Some(if neg { -value } else { value })
}

impl<'n> Parser<'n> {
    fn error(&self, message: impl Into<String>) -> OptError {
        OptError::parse(self.line, message)
    }

    fn parse_kind(&self, s: &str) -> Result<Option<BoxKind>> {
        match s.trim() {
            "int" => Ok(Some(BoxKind::Int)),
            "ptr" => Ok(Some(BoxKind::Ptr)),
            "float" => Ok(Some(BoxKind::Float)),
            "void" => Ok(None),
            other => Err(self.error(format!("unknown value kind '{}'", other))),
        }
    }

    fn parse_box(&self, s: &str) -> Result<BoxRef> {
        let s = s.trim();
        let mut chars = s.chars();
        let kind = chars
            .next()
            .and_then(BoxKind::from_prefix)
            .ok_or_else(|| self.error(format!("bad box name '{}'", s)))?;
        let id = chars
            .as_str()
            .parse::<u32>()
            .map_err(|_| self.error(format!("bad box name '{}'", s)))?;
        Ok(BoxRef::new(id, kind))
    }

    fn lookup_descr(&self, name: &str) -> Result<Descr> {
        self.ns
            .descr(name.trim())
            .ok_or_else(|| self.error(format!("unknown descr '{}'", name.trim())))
    }

    fn parse_class_ref(&self, s: &str) -> Result<i64> {
        let s = s.trim();
        if let Some(v) = parse_int(s) {
            return Ok(v);
        }
        self.ns
            .class(s)
            .ok_or_else(|| self.error(format!("unknown class '{}'", s)))
    }

    fn parse_class_decl(&mut self, rest: &str) -> Result<()> {
        let (name, value) = rest
            .split_once('=')
            .ok_or_else(|| self.error("expected 'class NAME = ADDRESS'"))?;
        let addr = parse_int(value).ok_or_else(|| self.error("bad class address"))?;
        self.ns.insert_class(name.trim(), addr);
        Ok(())
    }

    fn parse_descr_decl(&mut self, rest: &str) -> Result<()> {
        let (name, body) = rest
            .split_once('=')
            .ok_or_else(|| self.error("expected 'descr NAME = kind(...)'"))?;
        let name = name.trim().to_string();
        let body = body.trim();
        let open = body.find('(').ok_or_else(|| self.error("expected '('"))?;
        let close = matching_paren(body, open).ok_or_else(|| self.error("unbalanced parentheses"))?;
        let kind = body[..open].trim();
        let args = split_top_level(&body[open + 1..close]);
        let (positional, keywords): (Vec<&str>, Vec<&str>) =
            args.into_iter().partition(|a| !a.contains('='));
        let keyword = |key: &str| {
            keywords
                .iter()
                .find_map(|k| k.split_once('=').filter(|(k, _)| k.trim() == key).map(|(_, v)| v.trim()))
        };
        let flag = |f: &str| positional.iter().any(|p| *p == f);

        let descr = match kind {
            "field" => {
                let owner = positional.first().ok_or_else(|| self.error("field needs an owner"))?;
                let value = positional.get(1).ok_or_else(|| self.error("field needs a kind"))?;
                let value = self
                    .parse_kind(value)?
                    .ok_or_else(|| self.error("field cannot be void"))?;
                Descr::field_with(
                    name.clone(),
                    FieldInfo {
                        owner: owner.to_string(),
                        value,
                        immutable: flag("immutable"),
                        quasi_immutable: flag("quasi"),
                    },
                )
            }
            "array" => {
                let item = positional.first().ok_or_else(|| self.error("array needs a kind"))?;
                let item = self
                    .parse_kind(item)?
                    .ok_or_else(|| self.error("array cannot be void"))?;
                Descr::array(name.clone(), item, flag("immutable"))
            }
            "interior" => {
                let array = positional.first().ok_or_else(|| self.error("interior needs an array"))?;
                let field = positional.get(1).ok_or_else(|| self.error("interior needs a field"))?;
                let array = self.lookup_descr(array)?;
                let field = self.lookup_descr(field)?;
                Descr::interior_field(name.clone(), array, field)
            }
            "size" => {
                let class = keyword("class").map(|c| self.parse_class_ref(c)).transpose()?;
                Descr::size_with(
                    name.clone(),
                    SizeInfo {
                        class,
                        immutable: flag("immutable"),
                    },
                )
            }
            "call" => {
                let result = match positional.first() {
                    Some(k) => self.parse_kind(k)?,
                    None => None,
                };
                let mut effect = EffectInfo::default();
                if let Some(e) = keyword("effect") {
                    effect.extra = match e {
                        "elidable" => ExtraEffect::ElidableCannotRaise,
                        "elidable_can_raise" => ExtraEffect::ElidableCanRaise,
                        "loopinvariant" => ExtraEffect::LoopInvariant,
                        "cannot_raise" => ExtraEffect::CannotRaise,
                        "can_raise" => ExtraEffect::CanRaise,
                        "forces_virtual" => ExtraEffect::ForcesVirtual,
                        "random" => ExtraEffect::RandomEffects,
                        other => return Err(self.error(format!("unknown effect '{}'", other))),
                    };
                }
                if let Some(o) = keyword("oopspec") {
                    effect.oopspec =
                        OopSpec::from_name(o).ok_or_else(|| self.error(format!("unknown oopspec '{}'", o)))?;
                }
                for (key, set) in [
                    ("reads", &mut effect.readonly_fields),
                    ("writes", &mut effect.write_fields),
                    ("readarrays", &mut effect.readonly_arrays),
                    ("writearrays", &mut effect.write_arrays),
                ] {
                    if let Some(list) = keyword(key) {
                        for d in list.split('|').map(str::trim).filter(|d| !d.is_empty()) {
                            set.insert(self.lookup_descr(d)?);
                        }
                    }
                }
                Descr::call(name.clone(), result, effect)
            }
            "target" => Descr::target(name.clone()),
            "resume" => Descr::resume(name.clone()),
            other => return Err(self.error(format!("unknown descr kind '{}'", other))),
        };
        self.ns.insert_descr(name, descr);
        Ok(())
    }

    fn parse_const(&self, s: &str) -> Result<Option<Const>> {
        let s = s.trim();
        if s == "NULL" {
            return Ok(Some(Const::NULL));
        }
        if let Some(inner) = s.strip_prefix("ConstPtr(").and_then(|r| r.strip_suffix(')')) {
            let addr = parse_int(inner).ok_or_else(|| self.error("bad ConstPtr"))?;
            return Ok(Some(Const::Ptr(addr as u64)));
        }
        if let Some(inner) = s.strip_prefix("ConstClass(").and_then(|r| r.strip_suffix(')')) {
            return Ok(Some(Const::Int(self.parse_class_ref(inner)?)));
        }
        if let Some(v) = parse_int(s) {
            return Ok(Some(Const::Int(v)));
        }
        if s.contains('.') || s.contains("inf") || s.contains("nan") {
            if let Ok(f) = s.parse::<f64>() {
                return Ok(Some(Const::float(f)));
            }
        }
        Ok(None)
    }

    fn parse_operand(&self, s: &str) -> Result<Operand> {
        if let Some(c) = self.parse_const(s)? {
            return Ok(Operand::Const(c));
        }
        let b = self.parse_box(s)?;
        if !self.defined.contains(&b) {
            return Err(self.error(format!("box {} used before definition", b)));
        }
        Ok(Operand::Box(b))
    }

    fn parse_call_pure_result(&self, rest: &str) -> Result<(Vec<Const>, Const)> {
        let close = matching_paren(&format!("({}", rest), 0)
            .map(|i| i - 1)
            .ok_or_else(|| self.error("unbalanced parentheses"))?;
        let mut args = Vec::new();
        for a in split_top_level(&rest[..close]) {
            args.push(
                self.parse_const(a)?
                    .ok_or_else(|| self.error("call_pure_result takes constants"))?,
            );
        }
        let value = rest[close + 1..]
            .trim()
            .strip_prefix('=')
            .ok_or_else(|| self.error("expected '= value'"))?;
        let value = self
            .parse_const(value)?
            .ok_or_else(|| self.error("call_pure_result value must be a constant"))?;
        Ok((args, value))
    }

    fn parse_op(&mut self, line: &str) -> Result<Op> {
        let (result, body) = match line.split_once('=') {
            Some((lhs, rhs)) if !lhs.contains('(') => (Some(self.parse_box(lhs)?), rhs.trim()),
            _ => (None, line),
        };
        let open = body.find('(').ok_or_else(|| self.error("expected '('"))?;
        let name = body[..open].trim();
        let opcode =
            Opcode::from_name(name).ok_or_else(|| self.error(format!("unknown opcode '{}'", name)))?;
        let close = matching_paren(body, open).ok_or_else(|| self.error("unbalanced parentheses"))?;

        let mut args = Vec::new();
        let mut descr = None;
        for part in split_top_level(&body[open + 1..close]) {
            if let Some(d) = part.strip_prefix("descr=") {
                descr = Some(self.lookup_descr(d)?);
            } else {
                args.push(self.parse_operand(part)?);
            }
        }

        let arity = opcode.arity();
        if !arity.accepts(args.len()) {
            return Err(self.error(format!("{} takes {}, got {}", opcode, arity, args.len())));
        }

        let mut op = Op::new(opcode, args, result);
        op.descr = descr;

        let tail = body[close + 1..].trim();
        if !tail.is_empty() {
            let inner = tail
                .strip_prefix('[')
                .and_then(|t| t.strip_suffix(']'))
                .ok_or_else(|| self.error(format!("unexpected '{}'", tail)))?;
            if !opcode.is_guard() {
                return Err(self.error(format!("{} takes no fail arguments", opcode)));
            }
            let fail_args = split_top_level(inner)
                .into_iter()
                .map(|a| self.parse_operand(a))
                .collect::<Result<Vec<_>>>()?;
            op.fail_args = Some(fail_args);
        }

        if let Some(result) = result {
            if !self.defined.insert(result) {
                return Err(self.error(format!("box {} defined twice", result)));
            }
        }
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "
        class node = 0x40
        descr nodesize = size(class=node)
        descr valuedescr = field(node, int)
        descr loop = target()
        [i0, p1]
        i2 = getfield_gc(p1, descr=valuedescr)  # load
        i3 = int_add(i2, -1)
        guard_true(i3) [i0, p1]
        p4 = new_with_vtable(ConstClass(node), descr=nodesize)
        jump(i3, p4, descr=loop)
    ";

    #[test]
    fn test_parse_trace() {
        let (trace, ns) = parse(TRACE).unwrap();
        assert_eq!(trace.inputargs, vec![BoxRef::int(0), BoxRef::ptr(1)]);
        assert_eq!(trace.ops.len(), 5);
        assert_eq!(trace.ops[0].descr, ns.descr("valuedescr"));
        assert_eq!(trace.ops[1].args[1], Operand::int(-1));
        assert_eq!(
            trace.ops[2].fail_args,
            Some(vec![BoxRef::int(0).into(), BoxRef::ptr(1).into()])
        );
        assert_eq!(trace.ops[3].args, vec![Operand::int(0x40)]);
        assert_eq!(ns.descr("nodesize").and_then(|d| d.known_class()), Some(0x40));
        assert!(trace.ops[4].descr.as_ref().map(|d| d.is_target()).unwrap_or(false));
    }

    #[test]
    fn test_shared_namespace() {
        let (_, mut ns) = parse(TRACE).unwrap();
        let expected = parse_with("[p1]\ni2 = getfield_gc(p1, descr=valuedescr)", &mut ns).unwrap();
        assert_eq!(expected.ops[0].descr, ns.descr("valuedescr"));
    }

    #[test]
    fn test_call_pure_result_and_effects() {
        let text = "
            descr d = field(s, int)
            descr c = call(int, effect=can_raise, reads=d, writes=d)
            call_pure_result(1, 2) = 3
            [i0]
            i1 = call(1, i0, descr=c)
        ";
        let (trace, ns) = parse(text).unwrap();
        assert_eq!(trace.call_pure_results.get(&vec![Const::Int(1), Const::Int(2)]), Some(&Const::Int(3)));
        let effect = ns.descr("c").and_then(|d| d.effect_info().cloned()).unwrap();
        assert_eq!(effect.extra, ExtraEffect::CanRaise);
        assert!(effect.write_fields.contains(&ns.descr("d").unwrap()));
    }

    #[test]
    fn test_errors_carry_line_numbers() {
        let err = parse("[i0]\ni1 = int_frob(i0)").unwrap_err();
        assert_eq!(err, OptError::parse(2, "unknown opcode 'int_frob'"));
        let err = parse("[i0]\ni1 = int_add(i0, i9)").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Parse);
        let err = parse("[i0]\ni0 = int_add(i0, 1)").unwrap_err();
        assert_eq!(err, OptError::parse(2, "box i0 defined twice"));
    }

    #[test]
    fn test_argument_count_is_checked() {
        let err = parse("[i0]\ni1 = int_add(i0)").unwrap_err();
        assert_eq!(err, OptError::parse(2, "int_add takes 2 arguments, got 1"));
        let text = "descr f = field(node, int)\n[p0]\ni1 = getfield_gc(descr=f)";
        let err = parse(text).unwrap_err();
        assert_eq!(err, OptError::parse(3, "getfield_gc takes 1 argument, got 0"));
        let err = parse("descr c = call(void, effect=random)\n[i0]\ncall(descr=c)").unwrap_err();
        assert_eq!(err, OptError::parse(3, "call takes at least 1 arguments, got 0"));
    }
}
