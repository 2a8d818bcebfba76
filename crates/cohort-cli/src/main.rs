use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use cohort_core::{
    atomic_write_json_pretty, load_run_config, status_counts, DataSource, ExecutionResult,
    RunConfig, RunInputs, RunMode,
};
use cohort_runner::{plan_run, BuilderRegistry, Dispatcher, RunOutcome, RunPlan, Submission};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cohort",
    version = "0.3.0",
    about = "Bundled per-subject pipeline runs on a local pool, a cluster or cloud-staged data"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SourceArgs {
    /// Pipeline configuration YAML.
    #[arg(long)]
    config: PathBuf,
    /// Participant manifest for locally stored data.
    #[arg(long, conflicts_with = "cloud_index")]
    manifest: Option<PathBuf>,
    /// Cloud index listing remote locators per unit.
    #[arg(long)]
    cloud_index: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every bundle, one bundle, or one unit; or submit an array job.
    Run {
        #[command(flatten)]
        source: SourceArgs,
        /// Execute only this 1-based bundle here.
        #[arg(long, conflicts_with = "unit_idx")]
        bundle_idx: Option<usize>,
        /// Execute only this 1-based unit here.
        #[arg(long)]
        unit_idx: Option<usize>,
        /// Write the summary reports after the run.
        #[arg(long)]
        with_reports: bool,
        /// Write the result of the selected bundle to this JSON file. Used by
        /// the worker processes of a pooled run.
        #[arg(long)]
        result_file: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print how the data source splits into bundles.
    Describe {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload.get("ok") == Some(&Value::Bool(false)) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            source,
            bundle_idx,
            unit_idx,
            with_reports,
            result_file,
            json,
        } => {
            let mut config = load_run_config(&source.config)?;
            if with_reports {
                config.write_report = true;
            }
            if result_file.is_some() {
                if bundle_idx.is_none() && unit_idx.is_none() {
                    bail!("--result-file needs --bundle-idx or --unit-idx");
                }
                // the pooled parent reports and uploads once for the whole run
                config.write_report = false;
                config.upload_results = false;
            }
            let mode = RunMode::resolve(
                RunInputs {
                    manifest: source.manifest,
                    cloud_index: source.cloud_index,
                    bundle_index: bundle_idx,
                    unit_index: unit_idx,
                },
                config.platform,
            )?;
            let mode_name = mode.as_str();
            let registry = BuilderRegistry::from_config(&config)?;
            if registry.is_empty() {
                tracing::warn!("no builders configured; only existing outputs will be reconciled");
            }
            let outcome = Dispatcher::new(config, registry).run(mode)?;
            match outcome {
                RunOutcome::Executed(results) => {
                    if let (Some(path), Some(result)) = (&result_file, results.first()) {
                        atomic_write_json_pretty(path, &serde_json::to_value(result)?)?;
                    }
                    let failed = results.iter().filter(|r| r.is_failed()).count();
                    if json {
                        return Ok(Some(json!({
                            "ok": failed == 0,
                            "command": "run",
                            "mode": mode_name,
                            "status_counts": counts_to_json(&results),
                            "results": results,
                        })));
                    }
                    print_results(mode_name, &results);
                    if failed > 0 {
                        bail!("{} of {} bundles failed", failed, results.len());
                    }
                }
                RunOutcome::Submitted(submission) => {
                    if json {
                        return Ok(Some(json!({
                            "ok": true,
                            "command": "run",
                            "mode": mode_name,
                            "submission": submission,
                        })));
                    }
                    print_submission(&submission);
                }
            }
        }
        Commands::Describe { source, json } => {
            let config = load_run_config(&source.config)?;
            let data_source = match (source.manifest, source.cloud_index) {
                (Some(path), None) => DataSource::Manifest(path),
                (None, Some(path)) => DataSource::CloudIndex(path),
                _ => bail!("provide exactly one of --manifest or --cloud-index"),
            };
            let plan = plan_run(&config, &data_source)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "config": config_to_json(&config),
                    "plan": plan,
                })));
            }
            print_plan(&config, &plan);
        }
    }
    Ok(None)
}

fn counts_to_json(results: &[ExecutionResult]) -> Value {
    status_counts(results)
        .into_iter()
        .map(|(status, n)| (status.to_string(), json!(n)))
        .collect::<serde_json::Map<String, Value>>()
        .into()
}

fn config_to_json(config: &RunConfig) -> Value {
    json!({
        "run_name": config.run_name,
        "num_processors": config.num_processors,
        "memory_gb": config.memory_gb,
        "units_per_bundle": config.units_per_bundle,
        "bundles_at_once": config.bundles_at_once,
        "output_directory": config.output_directory,
        "working_directory": config.working_directory,
        "platform": config.platform,
        "builders": config.builders.keys().collect::<Vec<_>>(),
    })
}

fn print_results(mode: &str, results: &[ExecutionResult]) {
    println!("mode: {}", mode);
    for result in results {
        println!(
            "bundle {}: {} ({} units, {:.1}s)",
            result.bundle_index,
            result.status,
            result.units.len(),
            result.elapsed_secs
        );
        if let Some(message) = &result.message {
            println!("  {}", message);
        }
    }
    let counts = status_counts(results)
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .map(|(status, n)| format!("{}={}", status, n))
        .collect::<Vec<_>>();
    println!("totals: {}", counts.join(" "));
}

fn print_submission(submission: &Submission) {
    println!("platform: {}", submission.platform);
    println!("job_id: {}", submission.job_id);
    println!("tasks: {}", submission.task_count);
    println!("script: {}", submission.script_path.display());
    println!("pid_file: {}", submission.pid_path.display());
}

fn print_plan(config: &RunConfig, plan: &RunPlan) {
    println!("run_name: {}", config.run_name);
    println!(
        "platform: {}",
        config
            .platform
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("units: {}", plan.units);
    println!("units_per_bundle: {}", plan.units_per_bundle);
    println!("bundles: {}", plan.bundles.len());
    for bundle in &plan.bundles {
        println!("  {}: {}", bundle.index, bundle.units.join(", "));
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
    }
}
