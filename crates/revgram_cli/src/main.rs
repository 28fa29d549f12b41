//! REVGRAM CLI
//!
//! Command-line front end of the grammar reverser.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use revgram_engine::{ReverserConfig, run_or_fallback};
use revgram_grammar::{
    Catalogue, Document, GrammarCompiler, SurfaceCompiler, TypeDescriptor, parse_document,
};
use revgram_infer::BlobDecoder;
use revgram_trace::{ArityTable, TraceDecoder};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "revgram")]
#[command(about = "REVGRAM - harness input grammar reverser", long_about = None)]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reverse the input grammar of a harness
    Reverse(ReverseArgs),
    /// Dump a binary trace log
    Inspect {
        /// Trace log
        trace: PathBuf,
        /// Use this argument count for every opcode instead of the
        /// x86-64 table
        #[arg(long)]
        arity: Option<usize>,
    },
    /// Compile a grammar document and list its operations
    Compile {
        /// Grammar document
        doc: PathBuf,
        /// Base catalogue documents
        #[arg(short, long)]
        base: Vec<PathBuf>,
    },
    /// Decode a blob against the input type of an operation
    Decode {
        /// Grammar document
        doc: PathBuf,
        /// Blob file
        blob: PathBuf,
        /// Operation whose first argument points at the input type
        #[arg(short, long)]
        call: String,
        /// Base catalogue documents
        #[arg(short, long)]
        base: Vec<PathBuf>,
    },
    /// Parse a field specification and print its lowered document
    Fieldspec {
        /// Field specification
        spec: PathBuf,
        /// Harness id used as name prefix
        #[arg(long, default_value = "harness")]
        id: String,
        /// Print the normalized specification instead
        #[arg(long)]
        normalize: bool,
    },
}

#[derive(Args)]
struct ReverseArgs {
    /// JSON configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Harness id
    #[arg(long)]
    id: Option<String>,
    /// Field specification
    #[arg(long)]
    fieldspec: Option<PathBuf>,
    /// Base catalogue documents
    #[arg(short, long)]
    base: Vec<PathBuf>,
    /// Work directory
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Output grammar path
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,
    /// Iteration budget
    #[arg(long)]
    max_iterations: Option<usize>,
    /// Iterations without progress before giving up
    #[arg(long)]
    max_stale: Option<usize>,
    /// Repair rounds per compile failure
    #[arg(long)]
    repair_rounds: Option<usize>,
    /// Tracer executable
    #[arg(long)]
    tracer: Option<PathBuf>,
    /// Kernel directory for the tracer
    #[arg(long)]
    kernel: Option<PathBuf>,
    /// Harness file for the tracer
    #[arg(long)]
    harness: Option<PathBuf>,
    /// Per-trace timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl ReverseArgs {
    fn into_config(self) -> Result<ReverserConfig> {
        let mut config = match &self.config {
            Some(path) => ReverserConfig::from_json_file(path)?,
            None => ReverserConfig::default(),
        };
        if let Some(id) = self.id {
            config.harness_id = id;
        }
        if self.fieldspec.is_some() {
            config.fieldspec = self.fieldspec;
        }
        config.base.extend(self.base);
        if let Some(dir) = self.work_dir {
            config.work_dir = dir;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(n) = self.max_iterations {
            config.max_iterations = n;
        }
        if let Some(n) = self.max_stale {
            config.max_stale_iterations = n;
        }
        if let Some(n) = self.repair_rounds {
            config.repair_rounds = n;
        }
        if let Some(program) = self.tracer {
            config.tracer.program = program;
        }
        if let Some(kernel) = self.kernel {
            config.tracer.kernel = kernel;
        }
        if let Some(harness) = self.harness {
            config.tracer.harness = harness;
        }
        if let Some(secs) = self.timeout {
            config.tracer.timeout_secs = secs;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::Reverse(args) => reverse(args),
        Commands::Inspect { trace, arity } => {
            let table = arity.map_or_else(ArityTable::linux_x86_64, ArityTable::uniform);
            let trace = TraceDecoder::new(table)
                .decode_file(&trace)
                .wrap_err_with(|| format!("cannot decode {}", trace.display()))?;
            print!("{trace}");
            Ok(())
        }
        Commands::Compile { doc, base } => {
            let cat = compile(&doc, &base)?;
            for sig in cat.signatures() {
                match sig.opcode {
                    Some(op) => println!("{} @{op} ({} args)", sig.name, sig.args.len()),
                    None => println!("{} ({} args)", sig.name, sig.args.len()),
                }
            }
            info!(types = cat.type_count(), signatures = cat.signatures().len(), "compiled");
            Ok(())
        }
        Commands::Decode {
            doc,
            blob,
            call,
            base,
        } => {
            let cat = compile(&doc, &base)?;
            let ty = cat
                .signature_by_name(&call)
                .and_then(|(_, sig)| sig.args.first())
                .and_then(|arg| match cat.get(arg.ty) {
                    Some(TypeDescriptor::Pointer { elem, .. }) => Some(*elem),
                    _ => None,
                })
                .ok_or_else(|| eyre!("{call} does not take a pointer as first argument"))?;
            let bytes = std::fs::read(&blob)
                .wrap_err_with(|| format!("cannot read {}", blob.display()))?;
            let decoded = BlobDecoder::new(&cat).decode(ty, &bytes)?;
            print!("{decoded}");
            Ok(())
        }
        Commands::Fieldspec {
            spec,
            id,
            normalize,
        } => {
            let parsed = revgram_fieldspec::parse_file(&spec)?;
            if normalize {
                print!("{parsed}");
            } else {
                print!("{}", revgram_fieldspec::lower(&parsed, &id)?);
            }
            Ok(())
        }
    }
}

fn reverse(args: ReverseArgs) -> Result<()> {
    let config = args.into_config()?;
    let result = run_or_fallback(&config.harness_id, &config.output, || {
        revgram_engine::reverse(&config)
    });
    match result {
        Ok(outcome) => {
            println!("{}: {outcome}", config.harness_id);
            Ok(())
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn load(path: &Path) -> Result<Document> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("cannot read {}", path.display()))?;
    let prefix = path
        .file_stem()
        .map_or_else(|| "doc".to_string(), |s| s.to_string_lossy().into_owned());
    Ok(parse_document(&text, &prefix)?)
}

fn compile(doc: &Path, base: &[PathBuf]) -> Result<Catalogue> {
    let base = base.iter().map(|p| load(p)).collect::<Result<Vec<_>>>()?;
    let doc = load(doc)?;
    Ok(SurfaceCompiler::new().compile(&base, &doc)?)
}
