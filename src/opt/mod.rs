//! Trace optimization
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`core`] | Shared context, the pass trait and the chain driver |
//! | [`value`] / [`intutils`] | What is known about a value; integer intervals |
//! | [`intbounds`] | Interval propagation |
//! | [`rewrite`] | Guard strengthening, algebraic identities, call rewriting |
//! | [`virtualize`] / [`virtuals`] | Escape analysis over objects and arrays |
//! | [`vstring`] | Virtual strings: plain, concatenations and slices |
//! | [`pure`] | Constant folding and common subexpressions |
//! | [`heap`] | Field and array caching with lazy stores |
//! | [`simplify`] | Lowering of hints; forcing before opaque passes |
//! | [`resume`] | Fail arguments and rebuild descriptions for guards |
//! | [`virtualstate`] | Entry states of compiled loops |
//! | [`shortpreamble`] | Loop tokens and bridge entry |
//!
//! [`optimize_loop`] peels a loop when `unroll` is enabled; [`optimize_bridge`]
//! optimizes a trace that leaves a guard of some loop.

pub mod core;
pub mod heap;
pub mod intbounds;
pub mod intutils;
pub mod pure;
pub mod resume;
pub mod rewrite;
pub mod shortpreamble;
pub mod simplify;
mod unroll;
pub mod value;
pub mod virtualize;
pub mod virtuals;
pub mod virtualstate;
pub mod vstring;

pub use self::core::{Chain, OptContext, Optimizer, Pass};
pub use shortpreamble::{LoopToken, OptInlineShortPreamble, ShortPreamble};
pub use virtualstate::VirtualState;

use crate::config::{OptimizerConfig, PassSet};
use crate::error::Result;
use crate::ir::{BoxAllocator, Descr, Op, Opcode, Trace};
use heap::OptHeap;
use intbounds::OptIntBounds;
use pure::OptPure;
use rewrite::OptRewrite;
use simplify::{OptEarlyForce, OptSimplify};
use std::sync::Arc;
use tracing::{debug, debug_span, info};
use virtualize::OptVirtualize;
use vstring::OptString;

/// Instantiate the chain `config` asks for
///
/// With a `target`, the chain starts with the link that routes the final
/// jump into that loop.
pub fn build_chain(config: &OptimizerConfig, target: Option<Arc<LoopToken>>) -> Vec<Box<dyn Pass>> {
    if config.passes.contains(PassSet::FFI) {
        debug!("ffi pass is not available on this platform, skipped");
    }
    let mut passes: Vec<Box<dyn Pass>> = Vec::new();
    for name in config.chain_names(target.is_some()) {
        let pass: Box<dyn Pass> = match name {
            "inline_short_preamble" => match &target {
                Some(token) => Box::new(OptInlineShortPreamble::new(Arc::clone(token))),
                None => continue,
            },
            "intbounds" => Box::new(OptIntBounds::new()),
            "rewrite" => Box::new(OptRewrite::new()),
            "virtualize" => Box::new(OptVirtualize::new()),
            "string" => Box::new(OptString::new()),
            "earlyforce" => Box::new(OptEarlyForce::new()),
            "pure" => Box::new(OptPure::new()),
            "heap" => Box::new(OptHeap::new()),
            "simplify" => Box::new(OptSimplify::new()),
            other => {
                debug!(pass = other, "no implementation, skipped");
                continue;
            }
        };
        passes.push(pass);
    }
    passes
}

/// One run of the chain over the whole trace
fn optimize_linear(
    trace: &Trace,
    config: &OptimizerConfig,
    target: Option<Arc<LoopToken>>,
) -> Result<(Vec<Op>, Vec<Descr>)> {
    let mut ctx = OptContext::new(config.policy, BoxAllocator::after(trace.max_box_id()));
    ctx.call_pure_results = trace.call_pure_results.clone();
    let mut opt = Optimizer::new(ctx, build_chain(config, target));
    opt.ctx.setup_inputargs(&trace.inputargs);
    opt.send_all(trace.ops.iter().cloned())?;
    opt.flush()?;
    let deps = std::mem::take(&mut opt.ctx.quasi_immutable_deps);
    Ok((opt.take_output(), deps))
}

fn ends_in_jump(trace: &Trace) -> bool {
    trace.final_op().map(|op| op.opcode == Opcode::Jump).unwrap_or(false)
}

/// The loop's label: the final jump's target if it names one
fn loop_target(trace: &Trace) -> Descr {
    trace
        .final_op()
        .and_then(|op| op.descr.clone())
        .filter(|d| d.is_target())
        .unwrap_or_else(|| Descr::target("loop"))
}

/// Optimize a loop in place
///
/// With `unroll` enabled and a trace ending in a jump, the first iteration
/// is peeled into `trace.preamble` and `trace.ops` becomes the steady-state
/// loop, starting with its label. Otherwise the trace is optimized in one
/// run. Either way `trace.token` receives the loop's token. On error the
/// trace is left untouched.
pub fn optimize_loop(trace: &mut Trace, config: &OptimizerConfig) -> Result<()> {
    let _span = debug_span!("optimize_loop").entered();
    let ops_in = trace.ops.len();
    let target = loop_target(trace);
    let name = target.name().to_string();

    let peeled = if config.passes.contains(PassSet::UNROLL) && ends_in_jump(trace) {
        unroll::unroll(trace, config, &target)?
    } else {
        None
    };

    match peeled {
        Some(peeled) => {
            let loop_guards = peeled.loop_guards();
            let has_short_preamble = peeled.short_preamble.is_some();
            let preamble_target = Descr::target(format!("{}_preamble", name));
            let short_preambles = peeled.short_preamble.map(Arc::new).into_iter().collect();
            let token = LoopToken::new(name, target, preamble_target, loop_guards, short_preambles);

            let mut preamble = Trace::new(std::mem::take(&mut trace.inputargs), peeled.preamble);
            preamble.call_pure_results = trace.call_pure_results.clone();
            info!(
                ops_in,
                preamble = preamble.ops.len(),
                body = peeled.body.len(),
                guards = loop_guards,
                short_preamble = has_short_preamble,
                "loop peeled"
            );
            trace.preamble = Some(Box::new(preamble));
            trace.inputargs = peeled.label_args;
            trace.ops = peeled.body;
            trace.quasi_immutable_deps = peeled.quasi_immutable_deps;
            trace.token = Some(Arc::new(token));
        }
        None => {
            let (ops, deps) = optimize_linear(trace, config, None)?;
            let guards = ops.iter().filter(|op| op.is_guard()).count();
            info!(ops_in, ops_out = ops.len(), guards, "loop optimized");
            let token = LoopToken::new(name, target.clone(), target, guards, Vec::new());
            trace.ops = ops;
            trace.quasi_immutable_deps = deps;
            trace.token = Some(Arc::new(token));
        }
    }
    Ok(())
}

/// Optimize a bridge in place
///
/// Never peeled. When `trace.target` names the loop the final jump enters,
/// the jump goes through one of its short preambles, through its preamble,
/// or fails with `RetraceLoop`.
pub fn optimize_bridge(trace: &mut Trace, config: &OptimizerConfig) -> Result<()> {
    let _span = debug_span!("optimize_bridge").entered();
    let mut config = config.clone();
    config.passes.remove(PassSet::UNROLL);
    let target = trace.target.clone().filter(|_| ends_in_jump(trace));
    let (ops, deps) = optimize_linear(trace, &config, target)?;
    info!(
        ops_in = trace.ops.len(),
        ops_out = ops.len(),
        guards = ops.iter().filter(|op| op.is_guard()).count(),
        "bridge optimized"
    );
    trace.ops = ops;
    trace.quasi_immutable_deps = deps;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse;

    #[test]
    fn test_build_chain_order() {
        let chain = build_chain(&OptimizerConfig::default(), None);
        let names: Vec<&str> = chain.iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec!["intbounds", "rewrite", "virtualize", "string", "earlyforce", "pure", "heap"]
        );
        let config = OptimizerConfig::with_passes("intbounds:ffi");
        let names: Vec<&str> = build_chain(&config, None).iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["intbounds", "simplify"]);
    }

    #[test]
    fn test_loop_without_unroll_is_linear() {
        let (mut trace, _) = parse(
            "[i0]
            i1 = int_add(i0, 1)
            jump(i1)",
        )
        .unwrap();
        optimize_loop(&mut trace, &OptimizerConfig::with_passes("intbounds:rewrite:pure")).unwrap();
        assert!(trace.preamble.is_none());
        assert_eq!(trace.ops.len(), 2);
        let token = trace.token.as_ref().unwrap();
        assert!(token.short_preambles.is_empty());
    }

    #[test]
    fn test_peeled_loop_starts_with_label() {
        let (mut trace, _) = parse(
            "[i0, i1]
            i2 = int_mul(i1, 3)
            i3 = int_add(i0, i2)
            jump(i3, i1)",
        )
        .unwrap();
        optimize_loop(&mut trace, &OptimizerConfig::default()).unwrap();
        let preamble = trace.preamble.as_ref().unwrap();
        assert_eq!(preamble.ops.last().unwrap().opcode, Opcode::Jump);
        assert_eq!(trace.ops[0].opcode, Opcode::Label);
        // the invariant product is carried as a third input
        assert_eq!(trace.inputargs.len(), 3);
        let opcodes: Vec<Opcode> = trace.ops.iter().map(|op| op.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::Label, Opcode::IntAdd, Opcode::Jump]);
    }

    #[test]
    fn test_failed_run_leaves_trace_alone() {
        let (mut trace, _) = parse(
            "[i0]
            guard_true(0) []
            jump(i0)",
        )
        .unwrap();
        let before = trace.clone();
        let err = optimize_loop(&mut trace, &OptimizerConfig::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidLoop);
        assert_eq!(trace.ops, before.ops);
        assert!(trace.preamble.is_none());
    }
}
