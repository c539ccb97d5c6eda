use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use mcg::pipeline::{compile, CompileError, CompileOptions};

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Resolved call graph as JSON
    Graph,
    /// Input hash, graph fingerprint and tool version
    BuildInfo,
    /// Graph fingerprint only
    Fingerprint,
}

#[derive(Parser, Debug)]
#[command(
    name = "mcg",
    version,
    about = "Mapped call graph resolver: resolves .mro pipeline calls into fork-aware call graphs"
)]
struct Cli {
    /// Input AST document (JSON)
    input: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Prefix for every fully-qualified id
    #[arg(long, default_value = "")]
    prefix: String,

    /// Wrap a top-level stage call in a pipeline
    #[arg(long)]
    wrap: bool,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Graph)]
    emit: EmitStage,

    /// Single-line graph JSON
    #[arg(long)]
    compact: bool,

    /// Log resolution phases and timing
    #[arg(long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "mcg=debug" } else { "mcg=warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    debug!(input = %cli.input.display(), emit = ?cli.emit, "starting");

    // ── Read input ──
    let input = match std::fs::read(&cli.input) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("mcg: error: {}: {}", cli.input.display(), e);
            std::process::exit(2);
        }
    };

    // ── Resolve ──
    let options = CompileOptions {
        prefix: cli.prefix.clone(),
        wrap: cli.wrap,
    };
    let compiled = match compile(&input, &options) {
        Ok(c) => c,
        Err(CompileError::Parse(e)) => {
            eprintln!("mcg: error: {}: {}", cli.input.display(), e);
            std::process::exit(2);
        }
        Err(e) => {
            for diag in e.diagnostics() {
                eprintln!("mcg: {}", diag);
            }
            if let CompileError::Resolve { graph, .. } = &e {
                debug!("partial graph:\n{}", graph);
            }
            error!(nodes_failed = e.diagnostics().len(), "resolution failed");
            std::process::exit(1);
        }
    };

    // ── Emit ──
    let text = match cli.emit {
        EmitStage::Graph => match compiled.render(!cli.compact) {
            Ok(mut s) => {
                s.push('\n');
                s
            }
            Err(e) => {
                eprintln!("mcg: error: {}", e);
                std::process::exit(2);
            }
        },
        EmitStage::BuildInfo => compiled.provenance.to_json(),
        EmitStage::Fingerprint => format!("{}\n", compiled.provenance.graph_fingerprint_hex()),
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                eprintln!("mcg: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{}", text),
    }
}
