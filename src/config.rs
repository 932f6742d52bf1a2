//! Optimizer configuration
//!
//! Which passes run, and the tuning constants they use. The constants are
//! empirical policy, not semantics: changing them changes how much code is
//! produced, never what it computes.

use crate::error::{OptError, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::warn;

bitflags! {
    /// Set of enabled optimization passes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PassSet: u16 {
        const INTBOUNDS = 0x0001;
        const REWRITE = 0x0002;
        const VIRTUALIZE = 0x0004;
        const STRING = 0x0008;
        const HEAP = 0x0010;
        const UNROLL = 0x0020;
        const PURE = 0x0040;
        /// Platform-specific foreign call pass, not available here
        const FFI = 0x0080;
    }
}

/// Pass names in the order they appear in a chain
pub const PASS_NAMES: &[(&str, PassSet)] = &[
    ("intbounds", PassSet::INTBOUNDS),
    ("rewrite", PassSet::REWRITE),
    ("virtualize", PassSet::VIRTUALIZE),
    ("string", PassSet::STRING),
    ("pure", PassSet::PURE),
    ("heap", PassSet::HEAP),
    ("ffi", PassSet::FFI),
    ("unroll", PassSet::UNROLL),
];

impl PassSet {
    /// Parse the colon-separated form, e.g. `intbounds:rewrite:heap`
    ///
    /// Unknown names are skipped with a warning. `all` enables everything.
    /// The bitflags text form (`INTBOUNDS | HEAP`) is accepted as well.
    pub fn parse(spec: &str) -> PassSet {
        let mut set = PassSet::empty();
        for name in spec
            .split([':', '|'])
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
        {
            let name = name.as_str();
            if name == "all" {
                set |= PassSet::all();
                continue;
            }
            match PASS_NAMES.iter().find(|(n, _)| *n == name) {
                Some((_, flag)) => set |= *flag,
                None => warn!(pass = name, "unknown optimization pass ignored"),
            }
        }
        set
    }

    /// The colon-separated form of this set
    pub fn to_spec(&self) -> String {
        PASS_NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl Default for PassSet {
    /// Everything the JIT enables by default
    fn default() -> Self {
        PassSet::INTBOUNDS
            | PassSet::REWRITE
            | PassSet::VIRTUALIZE
            | PassSet::STRING
            | PassSet::PURE
            | PassSet::HEAP
            | PassSet::UNROLL
    }
}

/// Tuning constants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Longest string copy done inline from a constant source
    pub inline_copy_const_source: usize,
    /// Longest string copy done inline otherwise
    pub inline_copy_limit: usize,
    /// How many times a bridge may ask for its target loop to be retraced
    pub retrace_limit: usize,
    /// A peeled loop with more guards than this accepts no retrace
    pub max_retrace_guards: usize,
    /// Largest short preamble that is kept
    pub max_short_preamble_ops: usize,
    /// Interval ends beyond `i64::MAX / huge_bound_divisor` are forgotten
    /// at the end of the preamble
    pub huge_bound_divisor: i64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            inline_copy_const_source: 5,
            inline_copy_limit: 2,
            retrace_limit: 5,
            max_retrace_guards: 15,
            max_short_preamble_ops: 200,
            huge_bound_divisor: 2,
        }
    }
}

/// Complete optimizer configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub passes: PassSet,
    pub policy: Policy,
}

impl OptimizerConfig {
    /// Default policy with the given pass string
    pub fn with_passes(spec: &str) -> Self {
        Self {
            passes: PassSet::parse(spec),
            policy: Policy::default(),
        }
    }

    /// Load from JSON; missing keys take their defaults
    ///
    /// `passes` may be given either as a pass string or as raw bits.
    pub fn from_json_str(json: &str) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Passes {
            Spec(String),
            Bits(u16),
        }

        #[derive(Deserialize)]
        struct Raw {
            passes: Option<Passes>,
            #[serde(default)]
            policy: Policy,
        }

        let raw: Raw = serde_json::from_str(json).map_err(|e| OptError::config(e.to_string()))?;
        let passes = match raw.passes {
            Some(Passes::Spec(spec)) => PassSet::parse(&spec),
            Some(Passes::Bits(bits)) => PassSet::from_bits_truncate(bits),
            None => PassSet::default(),
        };
        if raw.policy.huge_bound_divisor <= 0 {
            return Err(OptError::config("huge_bound_divisor must be positive"));
        }
        Ok(Self {
            passes,
            policy: raw.policy,
        })
    }

    /// Names of the passes a chain is built from, first to last
    ///
    /// Mirrors the chain builder: `earlyforce` follows `virtualize`, the
    /// `ffi` pass has no implementation here, and `simplify` closes the chain
    /// whenever one of `rewrite`, `virtualize` or `heap` is missing.
    pub fn chain_names(&self, bridge_into_loop: bool) -> Vec<&'static str> {
        let p = self.passes;
        let mut names = Vec::new();
        if bridge_into_loop {
            names.push("inline_short_preamble");
        }
        let order: [(&'static str, PassSet); 5] = [
            ("intbounds", PassSet::INTBOUNDS),
            ("rewrite", PassSet::REWRITE),
            ("virtualize", PassSet::VIRTUALIZE),
            ("string", PassSet::STRING),
            ("pure", PassSet::PURE),
        ];
        for (name, flag) in order {
            if p.contains(flag) {
                names.push(name);
            }
            if flag == PassSet::STRING && p.contains(PassSet::VIRTUALIZE) {
                names.push("earlyforce");
            }
        }
        if p.contains(PassSet::HEAP) {
            names.push("heap");
        }
        if !p.contains(PassSet::REWRITE | PassSet::VIRTUALIZE | PassSet::HEAP) {
            names.push("simplify");
        }
        names
    }
}
