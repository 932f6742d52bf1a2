//! Shared test helpers for integration tests

use pretty_assertions::assert_eq;
use tracejit::ir::interp::{Interpreter, Outcome};
use tracejit::ir::{Const, Op, Opcode};
use tracejit::{equivalent, optimize_bridge, optimize_loop, parse, parse_with, Namespace, OptimizerConfig, Trace};

/// Every pass except loop peeling, so loops come out in one piece
#[allow(dead_code)]
pub const LINEAR: &str = "intbounds:rewrite:virtualize:string:pure:heap";

/// Parse and optimize a loop with the given pass list
#[allow(dead_code)]
pub fn optimize(text: &str, passes: &str) -> (Trace, Namespace) {
    let (mut trace, ns) = parse(text).unwrap();
    optimize_loop(&mut trace, &OptimizerConfig::with_passes(passes)).unwrap();
    (trace, ns)
}

/// Optimize a bridge that jumps into `looped`, sharing its declarations
#[allow(dead_code)]
pub fn optimize_bridge_into(
    looped: &Trace,
    ns: &mut Namespace,
    text: &str,
    config: &OptimizerConfig,
) -> tracejit::Result<Trace> {
    let mut bridge = parse_with(text, ns).unwrap();
    bridge.target = looped.token.clone();
    optimize_bridge(&mut bridge, config)?;
    Ok(bridge)
}

/// Assert that `actual` matches the trace `expected` up to box renaming
#[allow(dead_code)]
pub fn assert_equiv(actual: &Trace, ns: &mut Namespace, expected: &str) {
    let want = parse_with(expected, ns).unwrap();
    if let Err(mismatch) = equivalent(&want, actual) {
        // show both traces side by side before failing
        assert_eq!(want.to_string(), actual.to_string(), "{}", mismatch);
        panic!("traces differ: {}", mismatch);
    }
}

/// Optimize `input` with `passes` and check the result against `expected`
#[allow(dead_code)]
pub fn assert_optimized(input: &str, passes: &str, expected: &str) {
    let (trace, mut ns) = optimize(input, passes);
    assert_equiv(&trace, &mut ns, expected);
}

#[allow(dead_code)]
pub fn opcodes(ops: &[Op]) -> Vec<Opcode> {
    ops.iter().map(|op| op.opcode).collect()
}

#[allow(dead_code)]
pub fn count(ops: &[Op], opcode: Opcode) -> usize {
    ops.iter().filter(|op| op.opcode == opcode).count()
}

/// Run a trace on integer inputs
#[allow(dead_code)]
pub fn run_ints(trace: &Trace, inputs: &[i64], iterations: usize) -> Outcome {
    let inputs: Vec<Const> = inputs.iter().map(|&v| Const::Int(v)).collect();
    Interpreter::new().run(trace, &inputs, iterations).unwrap()
}
