//! Trace equivalence under box renaming
//!
//! Two traces are equivalent when they perform the same operations in the
//! same order, with a one-to-one correspondence between their boxes.
//! Descrs compare by identity. An expected trace may leave out details it
//! does not care about: jump and label descrs, and guard fail-arguments
//! (an empty list matches anything).

use super::opcode::Opcode;
use super::operation::{BoxRef, Op, Operand};
use super::Trace;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use thiserror::Error;

/// First point where two traces diverge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation {index}: {message}")]
pub struct Mismatch {
    pub index: usize,
    pub message: String,
}

#[derive(Default)]
struct Renaming {
    forward: HashMap<BoxRef, BoxRef>,
    backward: HashMap<BoxRef, BoxRef>,
}

impl Renaming {
    fn bind(&mut self, expected: BoxRef, actual: BoxRef) -> Result<(), String> {
        if expected.kind != actual.kind {
            return Err(format!("{} and {} have different kinds", expected, actual));
        }
        match (self.forward.get(&expected), self.backward.get(&actual)) {
            (Some(&a), _) if a != actual => Err(format!("{} is {}, not {}", expected, a, actual)),
            (_, Some(&e)) if e != expected => Err(format!("{} already stands for {}", actual, e)),
            _ => {
                self.forward.insert(expected, actual);
                self.backward.insert(actual, expected);
                Ok(())
            }
        }
    }

    fn operand(&mut self, expected: &Operand, actual: &Operand) -> Result<(), String> {
        match (expected, actual) {
            (Operand::Box(e), Operand::Box(a)) => self.bind(*e, *a),
            (Operand::Const(e), Operand::Const(a)) if e.same_constant(a) => Ok(()),
            _ => Err(format!("expected {}, got {}", expected, actual)),
        }
    }

    fn as_actual(&self, expected: &Operand) -> Operand {
        match expected {
            Operand::Box(b) => self.forward.get(b).map(|a| Operand::Box(*a)).unwrap_or(*expected),
            Operand::Const(_) => *expected,
        }
    }
}

fn compare_op(names: &mut Renaming, expected: &Op, actual: &Op) -> Result<(), String> {
    if expected.opcode != actual.opcode {
        return Err(format!("expected {}, got {}", expected, actual));
    }
    if expected.args.len() != actual.args.len() {
        return Err(format!("expected {}, got {}", expected, actual));
    }
    for (e, a) in expected.args.iter().zip(&actual.args) {
        names
            .operand(e, a)
            .map_err(|m| format!("{} in {}", m, actual))?;
    }
    let loose_descr = matches!(expected.opcode, Opcode::Jump | Opcode::Label) && expected.descr.is_none();
    if !loose_descr && expected.descr != actual.descr {
        return Err(format!("descr mismatch: expected {}, got {}", expected, actual));
    }
    match (expected.result, actual.result) {
        (Some(e), Some(a)) => names.bind(e, a).map_err(|m| format!("{} in {}", m, actual))?,
        (None, None) => {}
        _ => return Err(format!("result mismatch: expected {}, got {}", expected, actual)),
    }
    if let (Some(e_fail), Some(a_fail)) = (&expected.fail_args, &actual.fail_args) {
        if !e_fail.is_empty() {
            let want: HashSet<Operand> = e_fail.iter().map(|f| names.as_actual(f)).collect();
            let got: HashSet<Operand> = a_fail.iter().copied().collect();
            if want != got {
                return Err(format!("fail arguments differ: expected {}, got {}", expected, actual));
            }
        }
    }
    Ok(())
}

/// Check that `actual` is `expected` up to box renaming
pub fn equivalent(expected: &Trace, actual: &Trace) -> Result<(), Mismatch> {
    let mut names = Renaming::default();
    if expected.inputargs.len() != actual.inputargs.len() {
        return Err(Mismatch {
            index: 0,
            message: format!(
                "expected {} inputs, got {}",
                expected.inputargs.len(),
                actual.inputargs.len()
            ),
        });
    }
    for (e, a) in expected.inputargs.iter().zip(&actual.inputargs) {
        names.bind(*e, *a).map_err(|message| Mismatch { index: 0, message })?;
    }
    for (index, (e, a)) in expected.ops.iter().zip(&actual.ops).enumerate() {
        compare_op(&mut names, e, a).map_err(|message| Mismatch { index, message })?;
    }
    if expected.ops.len() != actual.ops.len() {
        let index = expected.ops.len().min(actual.ops.len());
        let message = match actual.ops.get(index) {
            Some(extra) => format!("unexpected {}", extra),
            None => format!("missing {}", expected.ops[index]),
        };
        return Err(Mismatch { index, message });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse;

    #[test]
    fn test_renaming_is_allowed() {
        let (a, _) = parse("[i0]\ni1 = int_add(i0, 1)\njump(i1)").unwrap();
        let (b, _) = parse("[i5]\ni9 = int_add(i5, 1)\njump(i9)").unwrap();
        assert!(equivalent(&a, &b).is_ok());
    }

    #[test]
    fn test_renaming_must_be_bijective() {
        let (a, _) = parse("[i0, i1]\ni2 = int_add(i0, i1)\njump(i2)").unwrap();
        let (b, _) = parse("[i0, i1]\ni2 = int_add(i0, i0)\njump(i2)").unwrap();
        let err = equivalent(&a, &b).unwrap_err();
        assert_eq!(err.index, 0);
    }

    #[test]
    fn test_opcode_difference() {
        let (a, _) = parse("[i0]\ni1 = int_add(i0, 1)\ni2 = int_add(i1, 1)\njump(i1)").unwrap();
        let (b, _) = parse("[i0]\ni1 = int_add(i0, 1)\ni2 = int_sub(i1, 1)\njump(i1)").unwrap();
        assert_eq!(equivalent(&a, &b).unwrap_err().index, 1);
    }

    #[test]
    fn test_fail_args_compare_as_sets() {
        let (a, _) = parse("[i0, i1]\nguard_true(i0) [i0, i1]\njump(i0, i1)").unwrap();
        let (b, _) = parse("[i0, i1]\nguard_true(i0) [i1, i0]\njump(i0, i1)").unwrap();
        let (c, _) = parse("[i0, i1]\nguard_true(i0) [i0]\njump(i0, i1)").unwrap();
        let (loose, _) = parse("[i0, i1]\nguard_true(i0)\njump(i0, i1)").unwrap();
        assert!(equivalent(&a, &b).is_ok());
        assert!(equivalent(&a, &c).is_err());
        assert!(equivalent(&loose, &c).is_ok());
    }

    #[test]
    fn test_length_difference() {
        let (a, _) = parse("[i0]\njump(i0)").unwrap();
        let (b, _) = parse("[i0]\ni1 = int_add(i0, 1)\njump(i0)").unwrap();
        let err = equivalent(&a, &b).unwrap_err();
        assert_eq!(err.index, 0);
    }
}
