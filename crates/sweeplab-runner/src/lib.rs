//! Sweep execution: suite configuration, invocation expansion, and
//! bounded-concurrency dispatch of external harness processes.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sweeplab_analysis::{
    collect_intervals, collect_predictors, collect_sweep, ExtractionProfile, HeaderRule,
    MetricTable,
};
use sweeplab_core::catalog::{LabelTemplate, SweepCatalog};
use sweeplab_core::error::{Error, Result};
use sweeplab_core::fsutil::{ensure_dir, run_output_path, sha256_file};
use sweeplab_core::registry::{load_workloads, BenchmarkDescriptor, CommandRegistry, Resolver};
use tracing::{info, warn};

/// Immutable suite description loaded from `suite.yaml`. Threaded by
/// reference into every component that needs it; nothing is stored in
/// process-global state.
#[derive(Debug, Clone, Deserialize)]
pub struct SuiteConfig {
    /// Instrumentation harness executable.
    pub harness: PathBuf,
    /// Analysis tool the harness loads (passed via `-t`).
    pub tool: PathBuf,
    /// Directory the workload processes run in.
    pub work_root: PathBuf,
    /// When set, each workload runs in `<work_root>/<workload>`.
    #[serde(default)]
    pub per_workload_dirs: bool,
    /// Prepended to the child's `LD_LIBRARY_PATH` for the harness's
    /// runtime dependencies.
    #[serde(default)]
    pub lib_path: Option<PathBuf>,
    pub results_root: PathBuf,
    /// Workload list file, one identifier per line.
    pub benchmarks: PathBuf,
    /// Command registry file.
    pub registry: PathBuf,
    /// Workload name to driver token fallbacks, for workloads installed
    /// separately from their execution driver.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// Worker pool size; 0 means host parallelism.
    #[serde(default)]
    pub workers: usize,
    /// Per-run wall-clock limit; 0 means none.
    #[serde(default)]
    pub timeout_seconds: u64,
    /// Additional attempts for a failed run; 0 means none.
    #[serde(default)]
    pub retries: u32,
    pub axes: Vec<AxisConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    Sweep,
    Intervals,
    Predictors,
}

/// One configuration axis: a named family of sweeps plus the anchors
/// needed to read its logs back.
#[derive(Debug, Clone, Deserialize)]
pub struct AxisConfig {
    pub name: String,
    pub kind: AxisKind,
    /// Sweep specification (CSV), for `sweep` and `intervals` axes.
    #[serde(default)]
    pub sweep: Option<PathBuf>,
    /// Variant label template, `{}` placeholders in column order.
    #[serde(default)]
    pub label: Option<String>,
    /// Structural header anchor for label extraction.
    #[serde(default)]
    pub header: Option<String>,
    /// Line offsets after the header holding the label values, in
    /// template order.
    #[serde(default)]
    pub offsets: Option<Vec<usize>>,
    /// Token index inside the header line, for inline-parameter axes.
    #[serde(default)]
    pub inline_token: Option<usize>,
    /// Miss-count anchor, e.g. `L1-Total-Misses`.
    #[serde(default)]
    pub misses: Option<String>,
    /// Fixed output file name, for interval axes.
    #[serde(default)]
    pub output_name: Option<String>,
    /// Subsystems read from interval logs.
    #[serde(default)]
    pub subsystems: Option<Vec<String>>,
    /// Predictor line count under the section header.
    #[serde(default)]
    pub predictors: Option<usize>,
}

impl SuiteConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read suite file {}: {}", path.display(), e))
        })?;
        let mut suite: SuiteConfig = serde_yaml::from_str(&raw).map_err(|e| {
            Error::Config(format!("malformed suite file {}: {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or(Path::new("."));
        suite.rebase(base);
        suite.validate()?;
        Ok(suite)
    }

    fn rebase(&mut self, base: &Path) {
        for field in [
            &mut self.harness,
            &mut self.tool,
            &mut self.work_root,
            &mut self.results_root,
            &mut self.benchmarks,
            &mut self.registry,
        ] {
            rebase_path(base, field);
        }
        if let Some(lib) = &mut self.lib_path {
            rebase_path(base, lib);
        }
        for axis in &mut self.axes {
            if let Some(sweep) = &mut axis.sweep {
                rebase_path(base, sweep);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.axes.is_empty() {
            return Err(Error::Config("suite declares no axes".to_string()));
        }
        for axis in &self.axes {
            axis.validate()?;
        }
        Ok(())
    }

    pub fn axis(&self, name: &str) -> Result<&AxisConfig> {
        self.axes
            .iter()
            .find(|axis| axis.name == name)
            .ok_or_else(|| Error::Config(format!("suite declares no axis named {}", name)))
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .clamp(1, 16)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }
}

impl AxisConfig {
    fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        match self.kind {
            AxisKind::Sweep => {
                if self.sweep.is_none() {
                    missing.push("sweep");
                }
                if self.label.is_none() {
                    missing.push("label");
                }
                if self.header.is_none() {
                    missing.push("header");
                }
                if self.misses.is_none() {
                    missing.push("misses");
                }
                if self.offsets.is_none() && self.inline_token.is_none() {
                    missing.push("offsets or inline_token");
                }
            }
            AxisKind::Intervals => {
                if self.sweep.is_none() {
                    missing.push("sweep");
                }
                if self.output_name.is_none() {
                    missing.push("output_name");
                }
                if self.subsystems.is_none() {
                    missing.push("subsystems");
                }
            }
            AxisKind::Predictors => {
                if self.predictors.is_none() {
                    missing.push("predictors");
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "axis {} is missing: {}",
                self.name,
                missing.join(", ")
            )))
        }
    }

    /// Anchors for reading this axis's logs back. Only sweep axes carry
    /// an extraction profile.
    pub fn extraction_profile(&self) -> Result<ExtractionProfile> {
        let header = self
            .header
            .clone()
            .ok_or_else(|| Error::Config(format!("axis {} has no header anchor", self.name)))?;
        let misses = self
            .misses
            .clone()
            .ok_or_else(|| Error::Config(format!("axis {} has no miss anchor", self.name)))?;
        let label = LabelTemplate::new(self.label.clone().unwrap_or_else(|| "{}".to_string()));
        let rule = if let Some(index) = self.inline_token {
            HeaderRule::InlineToken(index)
        } else if let Some(offsets) = &self.offsets {
            HeaderRule::Offsets(offsets.clone())
        } else {
            return Err(Error::Config(format!(
                "axis {} has neither offsets nor inline_token",
                self.name
            )));
        };
        Ok(ExtractionProfile {
            header,
            rule,
            misses,
            label,
        })
    }

    /// Variant output file stems in catalog row order, paired with the
    /// flag vectors to pass to the harness.
    fn expand_variants(&self) -> Result<Vec<(String, Vec<String>)>> {
        match self.kind {
            AxisKind::Predictors => Ok(vec![(String::new(), Vec::new())]),
            AxisKind::Sweep | AxisKind::Intervals => {
                let sweep = self.sweep.as_ref().ok_or_else(|| {
                    Error::Config(format!("axis {} has no sweep spec", self.name))
                })?;
                let catalog = SweepCatalog::load(sweep)?;
                if self.output_name.is_some() && catalog.len() > 1 {
                    return Err(Error::Config(format!(
                        "axis {} uses a fixed output name but its sweep spec has {} rows",
                        self.name,
                        catalog.len()
                    )));
                }
                let template =
                    LabelTemplate::new(self.label.clone().unwrap_or_else(|| "{}".to_string()));
                Ok(catalog
                    .rows()
                    .iter()
                    .map(|row| (row.label(&template), row.flag_args()))
                    .collect())
            }
        }
    }

    fn output_file(&self, workload: &str, stem: &str) -> String {
        match self.kind {
            AxisKind::Predictors => format!("{}.out", workload),
            AxisKind::Sweep | AxisKind::Intervals => self
                .output_name
                .clone()
                .unwrap_or_else(|| format!("{}.txt", stem)),
        }
    }
}

/// Concrete external invocation for one (workload, variant) pair.
/// Invocations are independent and share no mutable state; each owns a
/// distinct output path.
#[derive(Debug, Clone)]
pub struct RunInvocation {
    pub workload: String,
    pub variant: String,
    pub output_path: PathBuf,
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// Terminal status of one external run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Exited(i32),
    Signaled,
    TimedOut,
    SpawnFailed(String),
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Completed)
    }

    fn describe(&self) -> String {
        match self {
            RunStatus::Completed => "completed".to_string(),
            RunStatus::Exited(code) => format!("exited with status {}", code),
            RunStatus::Signaled => "killed by signal".to_string(),
            RunStatus::TimedOut => "timed out".to_string(),
            RunStatus::SpawnFailed(reason) => format!("failed to spawn: {}", reason),
        }
    }
}

/// Outcome of one (workload, variant) run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub workload: String,
    pub variant: String,
    pub output_path: PathBuf,
    pub status: RunStatus,
    pub elapsed: Duration,
}

impl RunOutcome {
    /// The `RunFailed` condition for a non-success outcome.
    pub fn as_error(&self) -> Option<Error> {
        if self.status.is_success() {
            return None;
        }
        Some(Error::RunFailed {
            workload: self.workload.clone(),
            variant: self.variant.clone(),
            reason: self.status.describe(),
        })
    }
}

/// Aggregate outcome of one axis batch. Failures are collected, never
/// escalated mid-batch: independent runs always continue.
#[derive(Debug)]
pub struct RunReport {
    pub axis: String,
    pub outcomes: Vec<RunOutcome>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &RunOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_success())
    }

    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_success()).count()
    }
}

/// Expands one axis into invocations, workload-major, in catalog row
/// order within each workload.
pub fn plan_axis(
    suite: &SuiteConfig,
    axis: &AxisConfig,
    workloads: &[String],
    resolver: &Resolver,
) -> Result<Vec<RunInvocation>> {
    let variants = axis.expand_variants()?;
    let mut invocations = Vec::with_capacity(workloads.len() * variants.len());
    for workload in workloads {
        let descriptor = resolver.resolve(workload)?;
        for (stem, flags) in &variants {
            invocations.push(build_invocation(suite, axis, &descriptor, stem, flags));
        }
    }
    Ok(invocations)
}

fn build_invocation(
    suite: &SuiteConfig,
    axis: &AxisConfig,
    descriptor: &BenchmarkDescriptor,
    stem: &str,
    flags: &[String],
) -> RunInvocation {
    let output_path = run_output_path(
        &suite.results_root,
        &descriptor.workload,
        &axis.name,
        &axis.output_file(&descriptor.workload, stem),
    );
    let mut argv = vec![
        suite.harness.display().to_string(),
        "-t".to_string(),
        suite.tool.display().to_string(),
        "-o".to_string(),
        output_path.display().to_string(),
    ];
    argv.extend(flags.iter().cloned());
    argv.push("--".to_string());
    argv.extend(descriptor.argv.iter().cloned());
    RunInvocation {
        workload: descriptor.workload.clone(),
        variant: if stem.is_empty() {
            descriptor.workload.clone()
        } else {
            stem.to_string()
        },
        output_path,
        argv,
        workdir: descriptor.workdir.clone(),
        stdout: descriptor.stdout.clone(),
        stderr: descriptor.stderr.clone(),
    }
}

/// Executes sweep axes against a fixed workload suite.
pub struct SweepRunner<'a> {
    suite: &'a SuiteConfig,
}

impl<'a> SweepRunner<'a> {
    pub fn new(suite: &'a SuiteConfig) -> Self {
        Self { suite }
    }

    /// Runs every (workload, variant) pair of one axis. Sweep axes run
    /// each workload's variant batch under the worker pool, bracketed
    /// by a per-workload timer; predictor axes pool across workloads.
    /// Failures are collected into the report and logged at batch end.
    pub fn run_axis(
        &self,
        axis: &AxisConfig,
        workloads: &[String],
        resolver: &Resolver,
        time_batches: bool,
    ) -> Result<RunReport> {
        let variants = axis.expand_variants()?;
        let mut outcomes = Vec::new();
        match axis.kind {
            AxisKind::Predictors => {
                let invocations = plan_axis(self.suite, axis, workloads, resolver)?;
                outcomes.extend(self.execute_batch(&invocations)?);
                if time_batches {
                    for outcome in &outcomes {
                        info!(
                            "workload {} finished in {:.4} seconds",
                            outcome.workload,
                            outcome.elapsed.as_secs_f64()
                        );
                    }
                }
            }
            AxisKind::Sweep | AxisKind::Intervals => {
                for workload in workloads {
                    let descriptor = resolver.resolve(workload)?;
                    let invocations: Vec<RunInvocation> = variants
                        .iter()
                        .map(|(stem, flags)| {
                            build_invocation(self.suite, axis, &descriptor, stem, flags)
                        })
                        .collect();
                    let start = Instant::now();
                    outcomes.extend(self.execute_batch(&invocations)?);
                    if time_batches {
                        info!(
                            "workload {} finished in {:.4} seconds",
                            workload,
                            start.elapsed().as_secs_f64()
                        );
                    }
                }
            }
        }
        self.write_manifest(axis, workloads, variants.len());
        let report = RunReport {
            axis: axis.name.clone(),
            outcomes,
        };
        for failure in report.failures() {
            warn!(
                "run failed: {} [{}] {}",
                failure.workload,
                failure.variant,
                failure.status.describe()
            );
        }
        Ok(report)
    }

    /// Bounded worker pool: workers claim pending invocations through an
    /// atomic counter and run each external process to completion. The
    /// filesystem is the only shared resource and every invocation
    /// writes a distinct path, so no locking is needed.
    fn execute_batch(&self, invocations: &[RunInvocation]) -> Result<Vec<RunOutcome>> {
        for invocation in invocations {
            if let Some(parent) = invocation.output_path.parent() {
                ensure_dir(parent)?;
            }
        }
        let workers = self.suite.worker_count().min(invocations.len().max(1));
        let next = AtomicUsize::new(0);
        let outcomes: Mutex<Vec<(usize, RunOutcome)>> =
            Mutex::new(Vec::with_capacity(invocations.len()));
        thread::scope(|scope| {
            for _ in 0..workers {
                let next = &next;
                let outcomes = &outcomes;
                scope.spawn(move || loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    if index >= invocations.len() {
                        break;
                    }
                    let outcome = self.execute_one(&invocations[index]);
                    outcomes
                        .lock()
                        .expect("outcome collector poisoned")
                        .push((index, outcome));
                });
            }
        });
        let mut outcomes = outcomes
            .into_inner()
            .expect("outcome collector poisoned");
        outcomes.sort_by_key(|(index, _)| *index);
        Ok(outcomes.into_iter().map(|(_, outcome)| outcome).collect())
    }

    fn execute_one(&self, invocation: &RunInvocation) -> RunOutcome {
        let attempts = self.suite.retries + 1;
        let start = Instant::now();
        let mut status = RunStatus::SpawnFailed("not attempted".to_string());
        for attempt in 1..=attempts {
            status = self.spawn_and_wait(invocation);
            if status.is_success() {
                break;
            }
            if attempt < attempts {
                warn!(
                    "retrying {} [{}] after attempt {}: {}",
                    invocation.workload,
                    invocation.variant,
                    attempt,
                    status.describe()
                );
            }
        }
        RunOutcome {
            workload: invocation.workload.clone(),
            variant: invocation.variant.clone(),
            output_path: invocation.output_path.clone(),
            status,
            elapsed: start.elapsed(),
        }
    }

    fn spawn_and_wait(&self, invocation: &RunInvocation) -> RunStatus {
        let mut cmd = Command::new(&invocation.argv[0]);
        cmd.args(&invocation.argv[1..]);
        cmd.current_dir(&invocation.workdir);
        cmd.stdin(Stdio::null());
        match capture_target(&invocation.stdout) {
            Ok(stdout) => cmd.stdout(stdout),
            Err(e) => return RunStatus::SpawnFailed(e.to_string()),
        };
        match capture_target(&invocation.stderr) {
            Ok(stderr) => cmd.stderr(stderr),
            Err(e) => return RunStatus::SpawnFailed(e.to_string()),
        };
        if let Some(lib) = &self.suite.lib_path {
            cmd.env("LD_LIBRARY_PATH", extended_library_path(lib));
        }
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return RunStatus::SpawnFailed(e.to_string()),
        };
        match self.suite.timeout() {
            None => match child.wait() {
                Ok(exit) => status_from(exit),
                Err(e) => RunStatus::SpawnFailed(e.to_string()),
            },
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    match child.try_wait() {
                        Ok(Some(exit)) => return status_from(exit),
                        Ok(None) => {
                            if Instant::now() >= deadline {
                                let _ = child.kill();
                                let _ = child.wait();
                                return RunStatus::TimedOut;
                            }
                            thread::sleep(Duration::from_millis(200));
                        }
                        Err(e) => return RunStatus::SpawnFailed(e.to_string()),
                    }
                }
            }
        }
    }

    /// Best-effort provenance record for the axis batch; never fatal.
    fn write_manifest(&self, axis: &AxisConfig, workloads: &[String], variant_count: usize) {
        let run_id = format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let harness_digest = sha256_file(&self.suite.harness)
            .unwrap_or_else(|_| "unavailable".to_string());
        let manifest = json!({
            "schema_version": "sweep_manifest_v1",
            "run_id": run_id,
            "axis": axis.name.clone(),
            "workloads": workloads,
            "variants": variant_count,
            "harness_digest": harness_digest,
            "created_at": Utc::now().to_rfc3339(),
        });
        let path = self
            .suite
            .results_root
            .join(format!("{}.manifest.json", axis.name));
        let bytes = match serde_json::to_vec_pretty(&manifest) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("skipping manifest for axis {}: {}", axis.name, e);
                return;
            }
        };
        if let Err(e) = atomic_write_bytes(&path, &bytes) {
            warn!("skipping manifest for axis {}: {}", axis.name, e);
        }
    }
}

fn rebase_path(base: &Path, field: &mut PathBuf) {
    if field.is_relative() {
        *field = base.join(field.as_path());
    }
}

fn status_from(exit: ExitStatus) -> RunStatus {
    if exit.success() {
        RunStatus::Completed
    } else if let Some(code) = exit.code() {
        RunStatus::Exited(code)
    } else {
        RunStatus::Signaled
    }
}

fn capture_target(path: &Option<PathBuf>) -> std::io::Result<Stdio> {
    Ok(match path {
        Some(path) => Stdio::from(File::create(path)?),
        None => Stdio::null(),
    })
}

fn extended_library_path(lib: &Path) -> OsString {
    let mut paths = vec![lib.to_path_buf()];
    if let Some(existing) = env::var_os("LD_LIBRARY_PATH") {
        paths.extend(env::split_paths(&existing));
    }
    env::join_paths(paths).unwrap_or_else(|_| lib.as_os_str().to_os_string())
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Parses every captured log of one axis into ordered metric tables,
/// one per workload. Per-variant parse failures are non-fatal.
pub fn report_axis(
    suite: &SuiteConfig,
    axis: &AxisConfig,
    workloads: &[String],
) -> Result<Vec<MetricTable>> {
    let mut tables = Vec::with_capacity(workloads.len());
    match axis.kind {
        AxisKind::Sweep => {
            let profile = axis.extraction_profile()?;
            let stems: Vec<String> = axis
                .expand_variants()?
                .into_iter()
                .map(|(stem, _)| stem)
                .collect();
            for workload in workloads {
                tables.push(collect_sweep(
                    &suite.results_root,
                    workload,
                    &axis.name,
                    &stems,
                    &profile,
                ));
            }
        }
        AxisKind::Intervals => {
            let file_name = axis.output_name.clone().ok_or_else(|| {
                Error::Config(format!("axis {} has no output name", axis.name))
            })?;
            let subsystems = axis.subsystems.clone().unwrap_or_default();
            for workload in workloads {
                tables.push(collect_intervals(
                    &suite.results_root,
                    workload,
                    &axis.name,
                    &file_name,
                    &subsystems,
                ));
            }
        }
        AxisKind::Predictors => {
            let count = axis.predictors.ok_or_else(|| {
                Error::Config(format!("axis {} has no predictor count", axis.name))
            })?;
            for workload in workloads {
                tables.push(collect_predictors(
                    &suite.results_root,
                    workload,
                    &axis.name,
                    count,
                ));
            }
        }
    }
    Ok(tables)
}

/// Suite overview for the `describe` surface.
#[derive(Debug, Serialize)]
pub struct SuiteSummary {
    pub workloads: Vec<String>,
    pub axes: Vec<AxisSummary>,
    pub workers: usize,
}

#[derive(Debug, Serialize)]
pub struct AxisSummary {
    pub name: String,
    pub kind: AxisKind,
    pub variants: usize,
}

pub fn describe_suite(suite: &SuiteConfig) -> Result<SuiteSummary> {
    let workloads = load_workloads(&suite.benchmarks)?;
    let mut axes = Vec::with_capacity(suite.axes.len());
    for axis in &suite.axes {
        axes.push(AxisSummary {
            name: axis.name.clone(),
            kind: axis.kind,
            variants: axis.expand_variants()?.len(),
        });
    }
    Ok(SuiteSummary {
        workloads,
        axes,
        workers: suite.worker_count(),
    })
}

/// Builds the resolver for a suite from its registry and alias table.
pub fn resolver_for(suite: &SuiteConfig) -> Result<Resolver> {
    let registry = CommandRegistry::load(&suite.registry)?;
    Ok(Resolver::new(
        registry,
        suite.aliases.clone(),
        suite.work_root.clone(),
        suite.per_workload_dirs,
    ))
}
