//! Isolated Compile CLI
//!
//! Entry point for the `isolated-compile` command-line tool.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use isolated_compile::config::CONFIG_FILENAME;
use isolated_compile::logging::init_logging;
use isolated_compile::{BuildPipeline, CommandCompiler, CompileConfig, StrategyError, TargetGraph};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

#[derive(Parser)]
#[command(name = "isolated-compile")]
#[command(about = "Per-target incremental compilation with isolated classpaths", version)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct PlanArgs {
    /// Build plan (JSON list of targets)
    #[arg(long)]
    plan: PathBuf,

    /// Config file (default: <buildroot>/isolated-compile.toml)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile every invalid target of a build plan
    Build {
        #[command(flatten)]
        plan: PlanArgs,

        /// Parallel compile jobs
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Capture each target's compiler output under the workdir
        #[arg(long)]
        capture_log: bool,

        /// Print the build summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the jobs a build would run, without compiling
    Plan {
        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Print archived classes grouped by source, as JSON
    ClassesBySource {
        #[command(flatten)]
        plan: PlanArgs,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match cli.command {
        Commands::Build {
            plan,
            jobs,
            capture_log,
            json,
        } => run_build(&plan, jobs, capture_log, json),
        Commands::Plan { plan } => run_plan(&plan),
        Commands::ClassesBySource { plan } => run_classes_by_source(&plan),
    };
    process::exit(code);
}

fn cli_overrides(jobs: Option<usize>, capture_log: bool) -> Option<Value> {
    let mut compile = Map::new();
    if let Some(n) = jobs {
        compile.insert("worker_count".to_string(), json!(n));
    }
    if capture_log {
        compile.insert("capture_log".to_string(), json!(true));
    }
    if compile.is_empty() {
        None
    } else {
        Some(json!({ "compile": compile }))
    }
}

fn load_pipeline(args: &PlanArgs, overrides: Option<Value>) -> Result<BuildPipeline, StrategyError> {
    let graph = TargetGraph::load(&args.plan)?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| graph.buildroot().join(CONFIG_FILENAME));
    let (config, sources) = CompileConfig::load(Some(&config_path), overrides)?;
    for source in &sources {
        debug!(origin = ?source.origin, path = ?source.path, digest = ?source.digest, "config layer");
    }

    let compiler = CommandCompiler::from_config(&config.compiler).with_working_dir(graph.buildroot());
    Ok(BuildPipeline::new(graph, config, Arc::new(compiler)))
}

fn print_json<T: Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            1
        }
    }
}

fn report(e: &StrategyError) -> i32 {
    eprintln!("Error: {}", e);
    if let StrategyError::Compilation(failure) = e {
        for key in failure.keys() {
            eprintln!("  {}", key);
        }
    }
    e.exit_code()
}

fn run_build(args: &PlanArgs, jobs: Option<usize>, capture_log: bool, json_output: bool) -> i32 {
    let pipeline = match load_pipeline(args, cli_overrides(jobs, capture_log)) {
        Ok(p) => p,
        Err(e) => return report(&e),
    };

    match pipeline.build() {
        Ok(summary) if json_output => print_json(&summary),
        Ok(summary) => {
            println!(
                "{} targets: {} compiled, {} restored from cache, {} already valid ({} ms)",
                summary.targets,
                summary.compiled.len(),
                summary.restored.len(),
                summary.valid.len(),
                summary.duration_ms
            );
            if summary.cache_failures > 0 {
                println!("{} cache uploads failed", summary.cache_failures);
            }
            0
        }
        Err(e) => report(&e),
    }
}

fn run_plan(args: &PlanArgs) -> i32 {
    let pipeline = match load_pipeline(args, None) {
        Ok(p) => p,
        Err(e) => return report(&e),
    };
    match pipeline.plan() {
        Ok(jobs) if jobs.is_empty() => {
            println!("All targets are valid; nothing to compile.");
            0
        }
        Ok(jobs) => {
            for job in &jobs {
                if job.dependency_keys.is_empty() {
                    println!("{}", job.key);
                } else {
                    println!("{} <- {}", job.key, job.dependency_keys.join(", "));
                }
            }
            0
        }
        Err(e) => report(&e),
    }
}

fn run_classes_by_source(args: &PlanArgs) -> i32 {
    let pipeline = match load_pipeline(args, None) {
        Ok(p) => p,
        Err(e) => return report(&e),
    };
    match pipeline.classes_by_source() {
        Ok(mapping) => print_json(&mapping),
        Err(e) => report(&e),
    }
}
