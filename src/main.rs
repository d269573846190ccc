use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::anyhow;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod error;
mod grammar;
mod job;
mod merge;
mod messages;
mod pipeline;
mod runner;
mod tools;

use error::PrunResult;
use job::{FAN_OUT, JobSpec};
use merge::{BuiltinMerge, MergeInvoker, MergerKind, MeshCat};
use pipeline::{FailurePolicy, LaunchConfig};
use tools::ExternalCompute;

/// Computes a mesh in 8x parallel, one sub-job per octree child, and stitches
/// the pieces together.
#[derive(Debug, Parser)]
#[command(name = "prun", version)]
struct Args {
    /// Compute binary each sub-job runs
    #[arg(long, env = "PRUN_RUN_BIN", default_value = "./bin/run")]
    run_bin: PathBuf,

    /// How the per-job meshes are stitched together
    #[arg(long, env = "PRUN_MERGER", value_enum, default_value_t = MergerKind::MeshCat)]
    merger: MergerKind,

    /// mesh_cat executable, looked up on PATH when given as a bare name
    #[arg(long, env = "PRUN_MESH_CAT", default_value = "mesh_cat")]
    mesh_cat: PathBuf,

    /// What to do when a sub-job fails
    #[arg(long, value_enum, default_value_t = FailurePolicy::FailFast)]
    on_failure: FailurePolicy,

    /// Maximum number of sub-jobs running at once
    #[arg(long, default_value_t = FAN_OUT, value_parser = parse_concurrency)]
    concurrency: usize,

    /// Print the commands that would run and exit
    #[arg(long)]
    dry_run: bool,

    /// [KEEP] [SUB <label>] followed by the compute binary's parameters
    #[arg(value_name = "JOB", trailing_var_arg = true, allow_hyphen_values = true)]
    job: Vec<String>,
}

fn parse_concurrency(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|e| format!("{e}"))?;
    if (1..=FAN_OUT).contains(&n) {
        Ok(n)
    } else {
        Err(format!("must be between 1 and {FAN_OUT}"))
    }
}

fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!(e))
}

fn build_merger(args: &Args) -> PrunResult<Box<dyn MergeInvoker>> {
    Ok(match args.merger {
        MergerKind::MeshCat if args.dry_run => Box::new(MeshCat::new(&args.mesh_cat)),
        MergerKind::MeshCat => Box::new(MeshCat::resolve(&args.mesh_cat)?),
        MergerKind::Builtin => Box::new(BuiltinMerge),
    })
}

fn print_plan(job: &JobSpec, compute: &ExternalCompute, merger: &dyn MergeInvoker) {
    for sub in job.expand() {
        println!("{}", compute.command_line(&sub));
    }
    let parts: Vec<PathBuf> = job.intermediates().collect();
    println!("{}", merger.describe(&parts, &job.output_path));
    if job.keep_intermediates {
        println!("# keeping intermediates");
    } else {
        println!("# removing intermediates");
    }
}

fn run(args: Args) -> PrunResult<()> {
    let job = grammar::parse_job(&args.job)?;

    if args.dry_run {
        let merger = build_merger(&args)?;
        print_plan(&job, &ExternalCompute::new(&args.run_bin), merger.as_ref());
        return Ok(());
    }

    let compute = ExternalCompute::resolve(&args.run_bin)?;
    let merger = build_merger(&args)?;
    let config = LaunchConfig {
        concurrency: args.concurrency,
        policy: args.on_failure,
    };

    let summary = pipeline::run_job(&job, Arc::new(compute), merger.as_ref(), &config)?;
    info!(
        compute = ?summary.compute_elapsed,
        merge = ?summary.merge_elapsed,
        parts = summary.merged.len(),
        failed = summary.reports.iter().filter(|r| !r.succeeded()).count(),
        removed = summary.removed,
        "Done in {:.2?}",
        summary.total_elapsed
    );
    Ok(())
}

fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("Failed to set up logging: {e:#}");
    }

    let args = Args::parse();
    info!("Running with args: {:?}", args.job);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_usage() {
                eprintln!("{e}\n");
                eprint!("{}", grammar::usage("prun"));
            } else {
                error!("{e}");
            }
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
