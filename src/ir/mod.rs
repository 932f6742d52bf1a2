//! Trace intermediate representation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`opcode`] | The operation set and its properties |
//! | [`operation`] | Boxes, constants, operands and operations |
//! | [`descr`] | Identity-compared field/array/call tokens |
//! | [`eval`] | Concrete semantics of pure operations |
//! | [`parser`] / [`printer`] | The textual trace format |
//! | [`compare`] | Equivalence of traces under box renaming |
//! | [`interp`] | A reference interpreter for traces |

pub mod compare;
pub mod descr;
pub mod eval;
pub mod interp;
pub mod opcode;
pub mod operation;
pub mod parser;
pub mod printer;

pub use compare::{equivalent, Mismatch};
pub use descr::{Descr, DescrKind, EffectInfo, ExtraEffect, OopSpec};
pub use opcode::Opcode;
pub use operation::{BoxAllocator, BoxKind, BoxRef, Const, Op, Operand, CONST_0, CONST_1};
pub use parser::{parse, parse_with, Namespace};

use crate::opt::LoopToken;
use rustc_hash::FxHashMap as HashMap;
use std::sync::Arc;

/// A loop or bridge as handed over by the tracer
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub inputargs: Vec<BoxRef>,
    pub ops: Vec<Op>,
    /// Peeled first iteration, set by loop optimization
    pub preamble: Option<Box<Trace>>,
    /// Token of the loop this trace compiled into
    pub token: Option<Arc<LoopToken>>,
    /// For bridges: the loop the final jump enters
    pub target: Option<Arc<LoopToken>>,
    pub quasi_immutable_deps: Vec<Descr>,
    /// Results of `call_pure` observed while tracing, by constant arguments
    pub call_pure_results: HashMap<Vec<Const>, Const>,
}

impl Trace {
    pub fn new(inputargs: Vec<BoxRef>, ops: Vec<Op>) -> Self {
        Self {
            inputargs,
            ops,
            ..Self::default()
        }
    }

    /// Largest box id mentioned anywhere, including the preamble
    pub fn max_box_id(&self) -> u32 {
        let mut max = self.inputargs.iter().map(|b| b.id).max().unwrap_or(0);
        for op in &self.ops {
            for b in op.used_boxes().chain(op.result) {
                max = max.max(b.id);
            }
        }
        if let Some(preamble) = &self.preamble {
            max = max.max(preamble.max_box_id());
        }
        max
    }

    /// The final operation, if it ends the trace
    pub fn final_op(&self) -> Option<&Op> {
        self.ops.last().filter(|op| op.opcode.is_final())
    }

    pub fn num_guards(&self) -> usize {
        self.ops.iter().filter(|op| op.is_guard()).count()
    }
}

impl std::fmt::Display for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&printer::print_trace(&self.inputargs, &self.ops))
    }
}
