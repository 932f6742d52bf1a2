//! Lowering of hint operations the backend cannot execute
//!
//! With the full chain these are consumed by the passes that understand
//! them. When some of those passes are turned off, `OptSimplify` sits at
//! the end so the output still contains only executable operations.

use super::core::{Chain, Pass};
use crate::error::Result;
use crate::ir::{Op, Opcode};

#[derive(Default)]
pub struct OptSimplify;

impl OptSimplify {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for OptSimplify {
    fn name(&self) -> &'static str {
        "simplify"
    }

    fn propagate(&mut self, op: Op, chain: &mut Chain<'_>) -> Result<()> {
        match op.opcode {
            Opcode::CallPure | Opcode::CallLoopinvariant => {
                let call = op.copy_and_change(Opcode::Call, op.args.clone());
                chain.emit(call)
            }
            Opcode::VirtualRef => {
                let same = op.copy_and_change(Opcode::SameAs, vec![op.arg(0)]);
                chain.emit(same)
            }
            Opcode::RecordKnownClass | Opcode::QuasiimmutField | Opcode::VirtualRefFinish => Ok(()),
            _ => chain.emit(op),
        }
    }
}

/// Forces virtual arguments before they reach passes that cannot hold them
///
/// The value of a store stays virtual: storing it into a non-virtual is
/// kept lazy by the heap pass. The object of a store that got this far is
/// forced.
#[derive(Default)]
pub struct OptEarlyForce;

impl OptEarlyForce {
    pub fn new() -> Self {
        Self
    }
}

impl Pass for OptEarlyForce {
    fn name(&self) -> &'static str {
        "earlyforce"
    }

    fn propagate(&mut self, mut op: Op, chain: &mut Chain<'_>) -> Result<()> {
        let forced = match op.opcode {
            Opcode::SetfieldGc | Opcode::SetarrayitemGc | Opcode::SetinteriorfieldGc => 1,
            Opcode::SameAs => 0,
            _ if op.is_guard() || op.opcode.is_final() => 0,
            _ => op.args.len(),
        };
        for arg in op.args.iter_mut().take(forced) {
            if chain.ctx.is_virtual_operand(*arg) {
                *arg = chain.force_operand(*arg)?;
            }
        }
        chain.emit(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::ir::{parse, BoxAllocator};
    use crate::opt::core::{OptContext, Optimizer};
    use crate::opt::virtualize::OptVirtualize;

    fn run(text: &str, passes: Vec<Box<dyn Pass>>) -> Vec<Op> {
        let (trace, _) = parse(text).unwrap();
        let ctx = OptContext::new(Policy::default(), BoxAllocator::after(trace.max_box_id()));
        let mut opt = Optimizer::new(ctx, passes);
        opt.ctx.setup_inputargs(&trace.inputargs);
        opt.send_all(trace.ops).unwrap();
        opt.take_output()
    }

    #[test]
    fn test_hints_are_lowered() {
        let ops = run(
            "class node = 0x10
            descr f = call(int, effect=elidable)
            [p0, i1]
            record_known_class(p0, ConstClass(node))
            i2 = call_pure(5, i1, descr=f)
            p3 = virtual_ref(p0, i1)
            virtual_ref_finish(p3, NULL)
            jump(p0, i2)",
            vec![Box::new(OptSimplify::new())],
        );
        let opcodes: Vec<Opcode> = ops.iter().map(|op| op.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::Call, Opcode::SameAs, Opcode::Jump]);
        assert_eq!(ops[1].args.len(), 1);
    }

    #[test]
    fn test_early_force_before_escape() {
        let ops = run(
            "descr nodesize = size()
            descr valuedescr = field(node, int)
            descr escape = call(void, effect=random)
            [i0]
            p1 = new(descr=nodesize)
            setfield_gc(p1, i0, descr=valuedescr)
            call(1, p1, descr=escape)
            jump(i0)",
            vec![Box::new(OptVirtualize::new()), Box::new(OptEarlyForce::new())],
        );
        let opcodes: Vec<Opcode> = ops.iter().map(|op| op.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::New, Opcode::SetfieldGc, Opcode::Call, Opcode::Jump]);
    }

    #[test]
    fn test_store_object_is_forced_but_value_stays_virtual() {
        let ops = run(
            "descr nodesize = size()
            descr arraydescr = array(ptr)
            [p0, i1]
            p2 = new_array(3, descr=arraydescr)
            p3 = new(descr=nodesize)
            setarrayitem_gc(p2, i1, p3, descr=arraydescr)
            jump(p0, i1)",
            vec![Box::new(OptVirtualize::new()), Box::new(OptEarlyForce::new())],
        );
        let opcodes: Vec<Opcode> = ops.iter().map(|op| op.opcode).collect();
        // the stored struct is only forced by the final sink, after the array
        assert_eq!(opcodes, vec![Opcode::NewArray, Opcode::New, Opcode::SetarrayitemGc, Opcode::Jump]);
    }
}
