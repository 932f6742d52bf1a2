//! Tracejit CLI
//!
//! Optimize, compare and run textual traces.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracejit::ir::interp::Interpreter;
use tracejit::ir::printer::print_trace;
use tracejit::ir::{Const, Op};
use tracejit::opt::resume::ResumeData;
use tracejit::{
    build_chain, equivalent, optimize_bridge, optimize_loop, parse, parse_with, Namespace, OptimizerConfig, PassSet,
    Trace, VERSION,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tracejit")]
#[command(author, version = VERSION, about = "Trace optimizer for a tracing JIT", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize a trace and print the result
    Optimize {
        /// The trace file
        file: PathBuf,

        /// Colon-separated pass list, e.g. intbounds:rewrite:heap
        #[arg(short, long)]
        passes: Option<String>,

        /// Optimize as a bridge instead of a loop
        #[arg(long)]
        bridge: bool,

        /// Loop the bridge jumps into; declarations are shared with it
        #[arg(long, value_name = "LOOP", requires = "bridge")]
        into: Option<PathBuf>,

        /// JSON optimizer configuration
        #[arg(short, long, value_name = "CFG")]
        config: Option<PathBuf>,

        /// Print a JSON report instead of the trace text
        #[arg(long)]
        json: bool,
    },

    /// List the passes and the chain a pass list builds
    Passes {
        /// Colon-separated pass list
        #[arg(short, long)]
        passes: Option<String>,
    },

    /// Check that two traces are equal up to box renaming
    Check {
        /// The trace to check
        file: PathBuf,
        /// The trace it should match
        expected: PathBuf,
    },

    /// Execute a trace with the reference interpreter
    Run {
        /// The trace file
        file: PathBuf,

        /// Integer inputs, comma-separated
        #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true)]
        inputs: Vec<i64>,

        /// Jumps to follow before stopping
        #[arg(short = 'n', long, default_value_t = 100)]
        iterations: usize,

        /// Optimize as a loop before running
        #[arg(long)]
        optimize: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Optimize {
            file,
            passes,
            bridge,
            into,
            config,
            json,
        } => {
            let config = load_config(config.as_deref(), passes.as_deref())?;
            optimize_file(&file, bridge, into.as_deref(), &config, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Passes { passes } => {
            show_passes(passes.as_deref());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { file, expected } => check_files(&file, &expected),
        Commands::Run {
            file,
            inputs,
            iterations,
            optimize,
        } => {
            run_file(&file, &inputs, iterations, optimize)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn read(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))
}

fn load_config(path: Option<&Path>, passes: Option<&str>) -> anyhow::Result<OptimizerConfig> {
    let mut config = match path {
        Some(path) => OptimizerConfig::from_json_str(&read(path)?)
            .with_context(|| format!("loading configuration '{}'", path.display()))?,
        None => OptimizerConfig::default(),
    };
    if let Some(passes) = passes {
        config.passes = PassSet::parse(passes);
    }
    Ok(config)
}

fn parse_file(path: &Path, ns: &mut Namespace) -> anyhow::Result<Trace> {
    let text = read(path)?;
    parse_with(&text, ns).with_context(|| format!("parsing '{}'", path.display()))
}

fn optimize_file(
    file: &Path,
    bridge: bool,
    into: Option<&Path>,
    config: &OptimizerConfig,
    json: bool,
) -> anyhow::Result<()> {
    let mut ns = Namespace::new();
    let target = match into {
        Some(loop_file) => {
            let mut looped = parse_file(loop_file, &mut ns)?;
            optimize_loop(&mut looped, config).with_context(|| format!("optimizing loop '{}'", loop_file.display()))?;
            looped.token
        }
        None => None,
    };
    let mut trace = parse_file(file, &mut ns)?;
    let result = if bridge {
        trace.target = target;
        optimize_bridge(&mut trace, config)
    } else {
        optimize_loop(&mut trace, config)
    };
    result.with_context(|| format!("optimizing '{}'", file.display()))?;

    if json {
        let report = Report::new(&trace, bridge, config);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if let Some(preamble) = &trace.preamble {
        println!("# preamble");
        print!("{}", preamble);
        println!("# loop");
    }
    print!("{}", trace);
    if let Some(token) = &trace.token {
        for sp in &token.short_preambles {
            println!("# short preamble");
            print!("{}", sp.to_trace());
        }
    }
    Ok(())
}

fn show_passes(passes: Option<&str>) {
    println!("Recognized passes:");
    for (name, _) in tracejit::config::PASS_NAMES {
        println!("  {}", name);
    }
    let config = match passes {
        Some(passes) => OptimizerConfig::with_passes(passes),
        None => OptimizerConfig::default(),
    };
    let chain: Vec<&str> = build_chain(&config, None).iter().map(|p| p.name()).collect();
    println!();
    println!("Enabled: {}", config.passes.to_spec());
    println!("Loop chain: {}", chain.join(" -> "));
    println!("Bridge chain: {}", config.chain_names(true).join(" -> "));
}

fn check_files(file: &Path, expected: &Path) -> anyhow::Result<ExitCode> {
    let mut ns = Namespace::new();
    let want = parse_file(expected, &mut ns)?;
    let got = parse_file(file, &mut ns)?;
    match equivalent(&want, &got) {
        Ok(()) => {
            println!("equivalent");
            Ok(ExitCode::SUCCESS)
        }
        Err(mismatch) => {
            println!("not equivalent: {}", mismatch);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn run_file(file: &Path, inputs: &[i64], iterations: usize, optimize: bool) -> anyhow::Result<()> {
    let text = read(file)?;
    let (mut trace, _) = parse(&text).with_context(|| format!("parsing '{}'", file.display()))?;
    if inputs.len() != trace.inputargs.len() {
        bail!("trace takes {} inputs, {} given", trace.inputargs.len(), inputs.len());
    }
    if optimize {
        optimize_loop(&mut trace, &OptimizerConfig::default())?;
    }
    let inputs: Vec<Const> = inputs.iter().map(|&v| Const::Int(v)).collect();
    let mut interp = Interpreter::new();
    let outcome = interp.run(&trace, &inputs, iterations)?;
    println!("{:?}", outcome);
    Ok(())
}

#[derive(Serialize)]
struct GuardReport<'a> {
    index: usize,
    op: String,
    fail_args: Vec<String>,
    resume: Option<&'a ResumeData>,
}

#[derive(Serialize)]
struct Report<'a> {
    kind: &'static str,
    passes: String,
    inputargs: Vec<String>,
    ops: Vec<String>,
    preamble: Option<Vec<String>>,
    short_preambles: Vec<Vec<String>>,
    guards: Vec<GuardReport<'a>>,
    quasi_immutable_deps: Vec<String>,
}

fn op_lines(ops: &[Op]) -> Vec<String> {
    ops.iter().map(|op| op.to_string()).collect()
}

impl<'a> Report<'a> {
    fn new(trace: &'a Trace, bridge: bool, config: &OptimizerConfig) -> Self {
        let guards = trace
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.is_guard())
            .map(|(index, op)| GuardReport {
                index,
                op: op.to_string(),
                fail_args: op.fail_args.iter().flatten().map(|a| a.to_string()).collect(),
                resume: op.resume.as_deref(),
            })
            .collect();
        let short_preambles = trace
            .token
            .iter()
            .flat_map(|t| t.short_preambles.iter())
            .map(|sp| {
                let sp = sp.to_trace();
                print_trace(&sp.inputargs, &sp.ops).lines().map(str::to_string).collect()
            })
            .collect();
        Self {
            kind: if bridge { "bridge" } else { "loop" },
            passes: config.passes.to_spec(),
            inputargs: trace.inputargs.iter().map(|b| b.to_string()).collect(),
            ops: op_lines(&trace.ops),
            preamble: trace.preamble.as_ref().map(|p| op_lines(&p.ops)),
            short_preambles,
            guards,
            quasi_immutable_deps: trace.quasi_immutable_deps.iter().map(|d| d.name().to_string()).collect(),
        }
    }
}
