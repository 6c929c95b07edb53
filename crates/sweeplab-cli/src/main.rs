use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use sweeplab_analysis::discover_logs;
use sweeplab_core::registry::load_workloads;
use sweeplab_runner::{describe_suite, report_axis, resolver_for, SuiteConfig, SweepRunner};

#[derive(Parser)]
#[command(name = "sweeplab", version = "0.1.0", about = "Architectural sweep runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the suite: workloads, axes, variant counts.
    Describe {
        suite: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Run one axis's (workload, variant) pairs under the worker pool.
    Run {
        suite: PathBuf,
        #[arg(long)]
        axis: String,
        /// Report per-workload batch wall-clock time.
        #[arg(long)]
        time: bool,
        #[arg(long)]
        json: bool,
    },
    /// Parse one axis's captured logs into ordered metric tables.
    Report {
        suite: PathBuf,
        #[arg(long)]
        axis: String,
        /// Write the tables to a file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List captured logs present under the results root.
    Status {
        suite: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json!({
                    "ok": false,
                    "error": "command_failed",
                    "message": err.to_string(),
                }));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Run { json, .. }
        | Commands::Report { json, .. }
        | Commands::Status { json, .. } => *json,
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe { suite, json } => {
            let suite = SuiteConfig::load(&suite)?;
            let summary = describe_suite(&suite)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": serde_json::to_value(&summary)?,
                })));
            }
            println!("workloads: {}", summary.workloads.join(" "));
            println!("workers: {}", summary.workers);
            for axis in &summary.axes {
                println!(
                    "axis {}: {} variants ({:?})",
                    axis.name, axis.variants, axis.kind
                );
            }
        }
        Commands::Run {
            suite,
            axis,
            time,
            json,
        } => {
            let suite = SuiteConfig::load(&suite)?;
            let axis = suite.axis(&axis)?;
            let workloads = load_workloads(&suite.benchmarks)?;
            let resolver = resolver_for(&suite)?;
            let runner = SweepRunner::new(&suite);
            let report = runner.run_axis(axis, &workloads, &resolver, time)?;
            let failed: Vec<Value> = report
                .failures()
                .map(|f| {
                    json!({
                        "workload": f.workload.clone(),
                        "variant": f.variant.clone(),
                        "output": f.output_path.display().to_string(),
                    })
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "axis": report.axis.clone(),
                    "completed": report.completed(),
                    "total": report.outcomes.len(),
                    "failed": failed,
                })));
            }
            println!(
                "axis {}: {}/{} runs completed",
                report.axis,
                report.completed(),
                report.outcomes.len()
            );
            for failure in report.failures() {
                println!("failed: {} [{}]", failure.workload, failure.variant);
            }
        }
        Commands::Report {
            suite,
            axis,
            out,
            json,
        } => {
            let suite = SuiteConfig::load(&suite)?;
            let axis = suite.axis(&axis)?;
            let workloads = load_workloads(&suite.benchmarks)?;
            let tables = report_axis(&suite, axis, &workloads)?;
            let payload = serde_json::to_value(&tables)?;
            if let Some(out) = out {
                fs::write(&out, serde_json::to_vec_pretty(&payload)?)?;
                println!("wrote {}", out.display());
                return Ok(None);
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "report",
                    "axis": axis.name.clone(),
                    "tables": payload,
                })));
            }
            for table in &tables {
                println!("{} / {}", table.workload, table.axis);
                for row in &table.rows {
                    let ipc = row
                        .ipc
                        .map(|v| format!("{:.4}", v))
                        .unwrap_or_else(|| "-".to_string());
                    let mpki: Vec<String> = row
                        .mpki
                        .iter()
                        .map(|(k, v)| format!("{}={:.4}", k, v))
                        .collect();
                    println!(
                        "  {:<24} ipc={} {}",
                        row.label.replace('\n', "/"),
                        ipc,
                        mpki.join(" ")
                    );
                }
            }
        }
        Commands::Status { suite, json } => {
            let suite = SuiteConfig::load(&suite)?;
            let logs = discover_logs(&suite.results_root);
            if json {
                let paths: Vec<String> =
                    logs.iter().map(|p| p.display().to_string()).collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "results_root": suite.results_root.display().to_string(),
                    "logs": paths,
                })));
            }
            println!("{} logs under {}", logs.len(), suite.results_root.display());
            for log in &logs {
                println!("  {}", log.display());
            }
        }
    }
    Ok(None)
}

fn emit_json(payload: &Value) {
    match serde_json::to_string_pretty(payload) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", payload),
    }
}
