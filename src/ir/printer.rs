//! Textual form of operations and traces
//!
//! The output parses back with [`super::parser`] given the same namespace.

use super::operation::{BoxRef, Op};
use std::fmt;

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{} = ", result)?;
        }
        write!(f, "{}(", self.opcode)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        if let Some(descr) = &self.descr {
            if !self.args.is_empty() {
                f.write_str(", ")?;
            }
            write!(f, "descr={}", descr)?;
        }
        f.write_str(")")?;
        if let Some(fail_args) = &self.fail_args {
            if self.is_guard() {
                let fail: Vec<String> = fail_args.iter().map(|a| a.to_string()).collect();
                write!(f, " [{}]", fail.join(", "))?;
            }
        }
        Ok(())
    }
}

/// Render a trace: the input list, then one operation per line
pub fn print_trace(inputargs: &[BoxRef], ops: &[Op]) -> String {
    let mut out = String::new();
    let inputs: Vec<String> = inputargs.iter().map(|b| b.to_string()).collect();
    out.push('[');
    out.push_str(&inputs.join(", "));
    out.push_str("]\n");
    for op in ops {
        out.push_str(&op.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BoxKind, Descr, Opcode, Operand};

    #[test]
    fn test_print_op() {
        let descr = Descr::field("valuedescr", "node", BoxKind::Int);
        let op = Op::new(
            Opcode::SetfieldGc,
            vec![BoxRef::ptr(1).into(), Operand::int(3)],
            None,
        )
        .with_descr(descr);
        assert_eq!(op.to_string(), "setfield_gc(p1, 3, descr=valuedescr)");

        let guard = Op::new(Opcode::GuardTrue, vec![BoxRef::int(2).into()], None)
            .with_fail_args(vec![BoxRef::int(0).into()]);
        assert_eq!(guard.to_string(), "guard_true(i2) [i0]");

        let add = Op::new(
            Opcode::IntAdd,
            vec![BoxRef::int(0).into(), Operand::int(1)],
            Some(BoxRef::int(1)),
        );
        assert_eq!(add.to_string(), "i1 = int_add(i0, 1)");
    }

    #[test]
    fn test_print_trace() {
        let ops = vec![Op::new(Opcode::Jump, vec![BoxRef::int(0).into()], None)];
        assert_eq!(print_trace(&[BoxRef::int(0)], &ops), "[i0]\njump(i0)\n");
    }
}
