//! Tracejit: the trace optimizer of a tracing JIT compiler
//!
//! A tracer records the operations one loop iteration (or one bridge out of
//! a failing guard) actually executed. This crate rewrites that linear
//! operation list into a cheaper one with the same observable behaviour:
//! constants are folded, guards that cannot fail are dropped, allocations
//! that never escape are removed, heap reads are cached and loops are
//! peeled so that invariant work moves out of the steady state.
//!
//! # Quick Start
//!
//! ```no_run
//! use tracejit::{optimize_loop, parse, OptimizerConfig};
//!
//! fn main() -> tracejit::Result<()> {
//!     let (mut trace, _names) = parse(
//!         "[i0, i1]
//!          i2 = int_mul(i1, 4)
//!          i3 = int_add(i0, i2)
//!          jump(i3, i1)",
//!     )?;
//!     optimize_loop(&mut trace, &OptimizerConfig::default())?;
//!     println!("{}", trace);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Operations flow: tracer → [`ir`] → chain of [`opt`] passes → code generator
//!
//! | Category | Modules |
//! |----------|---------|
//! | **IR** | [`ir`] (operations, descrs, text format, reference interpreter) |
//! | **Optimizer** | [`opt`] (passes, virtual states, loop tokens) |
//! | **Support** | [`config`], [`error`](OptError) |
// Clippy configuration for the optimizer.
//
// - too_many_arguments: virtual state walks thread the context and both states
// - new_without_default: passes are constructed by name in the chain builder
// - enum_variant_names: opcode names follow the trace format
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]
#![allow(clippy::enum_variant_names)]

pub mod config;
pub mod ir;
pub mod opt;

mod error;

pub use config::{OptimizerConfig, PassSet, Policy};
pub use error::{ErrorKind, OptError, Result};
pub use ir::{equivalent, parse, parse_with, Namespace, Trace};
pub use opt::{build_chain, optimize_bridge, optimize_loop, LoopToken};

/// Tracejit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
