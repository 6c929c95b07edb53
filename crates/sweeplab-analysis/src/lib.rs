//! Log extraction and metric aggregation.
//!
//! The harness emits free-form text logs. Certain lines are anchors,
//! identified by a fixed literal prefix; scanning is sequential and
//! prefix-based, and a required anchor that is absent past the current
//! scan position is an [`Error::Parse`], never a silent default.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sweeplab_core::catalog::LabelTemplate;
use sweeplab_core::error::{Error, Result};
use sweeplab_core::fsutil::run_output_path;
use tracing::warn;

pub const INSTRUCTIONS_PREFIX: &str = "Total Instructions";
pub const IPC_PREFIX: &str = "IPC";
pub const PREDICTORS_PREFIX: &str = "Branch Predictors";

/// Misses per thousand instructions. The miss and instruction counts
/// must come from the same log block.
pub fn mpki(misses: u64, instructions: u64) -> f64 {
    misses as f64 / (instructions as f64 / 1000.0)
}

/// How a structural header line yields the variant's configuration
/// values.
#[derive(Debug, Clone)]
pub enum HeaderRule {
    /// The values sit on the lines following the header, one per line,
    /// at these offsets (in label-template argument order).
    Offsets(Vec<usize>),
    /// The value is embedded in the header line itself at a fixed
    /// whitespace-token index, with a trailing `)` stripped.
    InlineToken(usize),
}

/// Anchors and label recipe for one sweep axis's logs.
#[derive(Debug, Clone)]
pub struct ExtractionProfile {
    pub header: String,
    pub rule: HeaderRule,
    pub misses: String,
    pub label: LabelTemplate,
}

impl ExtractionProfile {
    /// Subsystem name for the miss anchor: `L1` for `L1-Total-Misses`.
    pub fn subsystem(&self) -> &str {
        self.misses.split('-').next().unwrap_or(&self.misses)
    }
}

/// Metrics extracted from one single-shot log.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantMetrics {
    pub label: String,
    pub ipc: f64,
    pub mpki: f64,
}

/// Metrics for one periodic block of an interval-dump log.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalMetrics {
    pub instructions: u64,
    pub ipc: f64,
    pub mpki: BTreeMap<String, f64>,
}

/// One predictor's share of a comparison log.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorMetric {
    pub name: String,
    pub label: String,
    pub mpki: f64,
}

fn next_with_prefix(lines: &[&str], from: usize, prefix: &str) -> Result<usize> {
    lines[from..]
        .iter()
        .position(|l| l.starts_with(prefix))
        .map(|offset| from + offset)
        .ok_or_else(|| {
            Error::Parse(format!(
                "no line starting with `{}` at or after line {}",
                prefix,
                from + 1
            ))
        })
}

fn colon_field<'a>(line: &'a str) -> Result<&'a str> {
    line.split_once(':')
        .map(|(_, rest)| rest.trim())
        .ok_or_else(|| Error::Parse(format!("expected `:` in line `{}`", line)))
}

fn first_token<'a>(field: &'a str, line: &str) -> Result<&'a str> {
    field
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::Parse(format!("no value in line `{}`", line)))
}

fn count_at(lines: &[&str], idx: usize) -> Result<u64> {
    let token = first_token(colon_field(lines[idx])?, lines[idx])?;
    token
        .parse()
        .map_err(|_| Error::Parse(format!("bad count `{}` in line `{}`", token, lines[idx])))
}

fn float_at(lines: &[&str], idx: usize) -> Result<f64> {
    let token = first_token(colon_field(lines[idx])?, lines[idx])?;
    token
        .parse()
        .map_err(|_| Error::Parse(format!("bad value `{}` in line `{}`", token, lines[idx])))
}

fn trimmed_lines(content: &str) -> Vec<&str> {
    content.lines().map(str::trim).collect()
}

/// Single-shot extraction: one instruction-count anchor, one IPC
/// anchor, one miss anchor, one structural header for the label.
pub fn extract_variant(content: &str, profile: &ExtractionProfile) -> Result<VariantMetrics> {
    let lines = trimmed_lines(content);
    let instructions = count_at(&lines, next_with_prefix(&lines, 0, INSTRUCTIONS_PREFIX)?)?;
    let ipc = float_at(&lines, next_with_prefix(&lines, 0, IPC_PREFIX)?)?;
    let misses = count_at(&lines, next_with_prefix(&lines, 0, &profile.misses)?)?;
    let label = extract_label(&lines, profile)?;
    Ok(VariantMetrics {
        label,
        ipc,
        mpki: mpki(misses, instructions),
    })
}

fn extract_label(lines: &[&str], profile: &ExtractionProfile) -> Result<String> {
    let at = next_with_prefix(lines, 0, &profile.header)?;
    match &profile.rule {
        HeaderRule::Offsets(offsets) => {
            let mut values = Vec::with_capacity(offsets.len());
            for &offset in offsets {
                let line = lines.get(at + offset).ok_or_else(|| {
                    Error::Parse(format!(
                        "log ends {} lines after `{}` header",
                        offset, profile.header
                    ))
                })?;
                values.push(first_token(colon_field(line)?, line)?.to_string());
            }
            Ok(profile.label.render(values.iter().map(String::as_str)))
        }
        HeaderRule::InlineToken(index) => {
            let token = lines[at].split_whitespace().nth(*index).ok_or_else(|| {
                Error::Parse(format!(
                    "header `{}` has no token at index {}",
                    lines[at], index
                ))
            })?;
            Ok(profile.label.render([token.trim_end_matches(')')]))
        }
    }
}

/// Repeated-block extraction for interval-dump logs.
///
/// The log holds N periodic blocks plus one trailing cumulative block
/// of the same shape. Exactly the first N blocks yield metrics; the
/// summary block is discarded; it is not a sweep variant. Each
/// subsystem's miss count divides by its own block's instruction count.
pub fn extract_intervals(content: &str, subsystems: &[String]) -> Result<Vec<IntervalMetrics>> {
    let lines = trimmed_lines(content);
    let totals = collect_counts(&lines, INSTRUCTIONS_PREFIX)?;
    let ipcs = collect_floats(&lines, IPC_PREFIX)?;
    if ipcs.len() != totals.len() {
        return Err(Error::Parse(format!(
            "{} `{}` blocks but {} `{}` blocks",
            totals.len(),
            INSTRUCTIONS_PREFIX,
            ipcs.len(),
            IPC_PREFIX
        )));
    }
    let block_count = totals.len() - 1;
    let mut misses_by_subsystem = Vec::with_capacity(subsystems.len());
    for subsystem in subsystems {
        let prefix = format!("{}-Total-Misses", subsystem);
        let misses = collect_counts(&lines, &prefix)?;
        if misses.len() != totals.len() {
            return Err(Error::Parse(format!(
                "{} `{}` blocks but {} instruction blocks",
                misses.len(),
                prefix,
                totals.len()
            )));
        }
        misses_by_subsystem.push((subsystem.clone(), misses));
    }
    let mut records = Vec::with_capacity(block_count);
    for block in 0..block_count {
        let mut per_subsystem = BTreeMap::new();
        for (subsystem, misses) in &misses_by_subsystem {
            per_subsystem.insert(subsystem.clone(), mpki(misses[block], totals[block]));
        }
        records.push(IntervalMetrics {
            instructions: totals[block],
            ipc: ipcs[block],
            mpki: per_subsystem,
        });
    }
    Ok(records)
}

fn collect_counts(lines: &[&str], prefix: &str) -> Result<Vec<u64>> {
    let mut values = Vec::new();
    for line in lines.iter().filter(|l| l.starts_with(prefix)) {
        let token = first_token(colon_field(line)?, line)?;
        values.push(token.parse().map_err(|_| {
            Error::Parse(format!("bad count `{}` in line `{}`", token, line))
        })?);
    }
    if values.is_empty() {
        return Err(Error::Parse(format!("no line starting with `{}`", prefix)));
    }
    Ok(values)
}

fn collect_floats(lines: &[&str], prefix: &str) -> Result<Vec<f64>> {
    let mut values = Vec::new();
    for line in lines.iter().filter(|l| l.starts_with(prefix)) {
        let token = first_token(colon_field(line)?, line)?;
        values.push(token.parse().map_err(|_| {
            Error::Parse(format!("bad value `{}` in line `{}`", token, line))
        })?);
    }
    if values.is_empty() {
        return Err(Error::Parse(format!("no line starting with `{}`", prefix)));
    }
    Ok(values)
}

/// Predictor-comparison extraction: a labeled section header followed
/// by exactly `count` fixed-format result lines, in declaration order.
/// Metric per predictor: `incorrect / total_instructions / 1000`.
pub fn extract_predictors(content: &str, count: usize) -> Result<Vec<PredictorMetric>> {
    let lines = trimmed_lines(content);
    let total = count_at(&lines, next_with_prefix(&lines, 0, INSTRUCTIONS_PREFIX)?)?;
    let at = next_with_prefix(&lines, 0, PREDICTORS_PREFIX)?;
    let mut out = Vec::with_capacity(count);
    for entry in 1..=count {
        let line = lines
            .get(at + entry)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| {
                Error::Parse(format!(
                    "predictor section ends after {} of {} entries",
                    entry - 1,
                    count
                ))
            })?;
        let (name, rest) = line
            .split_once(':')
            .ok_or_else(|| Error::Parse(format!("expected `:` in line `{}`", line)))?;
        let incorrect: u64 = rest
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| Error::Parse(format!("no incorrect count in line `{}`", line)))?
            .parse()
            .map_err(|_| Error::Parse(format!("bad incorrect count in line `{}`", line)))?;
        out.push(PredictorMetric {
            name: name.to_string(),
            label: predictor_label(name),
            mpki: incorrect as f64 / total as f64 / 1000.0,
        });
    }
    Ok(out)
}

/// Compound predictor names decompose into multi-line display labels:
/// `Local-*` and `Global-*` split once into two segments, `Tournament-*`
/// into three (family, first three sub-tokens, remainder).
pub fn predictor_label(name: &str) -> String {
    if let Some(rest) = name.strip_prefix("Tournament-") {
        let parts: Vec<&str> = rest.split('-').collect();
        if parts.len() > 3 {
            return format!("Tournament\n{}\n{}", parts[..3].join("-"), parts[3..].join("-"));
        }
        return format!("Tournament\n{}", rest);
    }
    if name.starts_with("Local") || name.starts_with("Global") {
        if let Some((family, rest)) = name.split_once('-') {
            return format!("{}\n{}", family, rest);
        }
    }
    name.to_string()
}

/// One row of the final metric table.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub workload: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipc: Option<f64>,
    pub mpki: BTreeMap<String, f64>,
}

/// Ordered metric rows for one (workload, axis). Row order equals the
/// sweep catalog's row order (predictor tables: declaration order in
/// the log). Exposed read-only to the reporting collaborator; no
/// rendering happens here.
#[derive(Debug, Clone, Serialize)]
pub struct MetricTable {
    pub workload: String,
    pub axis: String,
    pub rows: Vec<MetricRecord>,
}

/// Joins single-shot logs for all of one workload's variants, in
/// catalog order. `variant_stems` are the output file stems in catalog
/// row order. A variant whose log is missing or unparsable is warned
/// about and skipped; it never aborts the batch.
pub fn collect_sweep(
    results_root: &Path,
    workload: &str,
    axis: &str,
    variant_stems: &[String],
    profile: &ExtractionProfile,
) -> MetricTable {
    let subsystem = profile.subsystem().to_string();
    let mut rows = Vec::with_capacity(variant_stems.len());
    for stem in variant_stems {
        let path = run_output_path(results_root, workload, axis, &format!("{}.txt", stem));
        match read_and(&path, |content| extract_variant(content, profile)) {
            Ok(metrics) => rows.push(MetricRecord {
                workload: workload.to_string(),
                label: metrics.label,
                ipc: Some(metrics.ipc),
                mpki: BTreeMap::from([(subsystem.clone(), metrics.mpki)]),
            }),
            Err(err) => warn!("skipping variant log {}: {}", path.display(), err),
        }
    }
    MetricTable {
        workload: workload.to_string(),
        axis: axis.to_string(),
        rows,
    }
}

/// Joins one workload's interval-dump log into a table with one row per
/// periodic block, labeled by the block's instruction count.
pub fn collect_intervals(
    results_root: &Path,
    workload: &str,
    axis: &str,
    file_name: &str,
    subsystems: &[String],
) -> MetricTable {
    let path = run_output_path(results_root, workload, axis, file_name);
    let rows = match read_and(&path, |content| extract_intervals(content, subsystems)) {
        Ok(blocks) => blocks
            .into_iter()
            .map(|block| MetricRecord {
                workload: workload.to_string(),
                label: block.instructions.to_string(),
                ipc: Some(block.ipc),
                mpki: block.mpki,
            })
            .collect(),
        Err(err) => {
            warn!("skipping interval log {}: {}", path.display(), err);
            Vec::new()
        }
    };
    MetricTable {
        workload: workload.to_string(),
        axis: axis.to_string(),
        rows,
    }
}

/// Joins one workload's predictor-comparison log into a table with one
/// row per predictor, in declaration order.
pub fn collect_predictors(
    results_root: &Path,
    workload: &str,
    axis: &str,
    count: usize,
) -> MetricTable {
    let path = run_output_path(results_root, workload, axis, &format!("{}.out", workload));
    let rows = match read_and(&path, |content| extract_predictors(content, count)) {
        Ok(predictors) => predictors
            .into_iter()
            .map(|p| MetricRecord {
                workload: workload.to_string(),
                label: p.label,
                ipc: None,
                mpki: BTreeMap::from([("Branch".to_string(), p.mpki)]),
            })
            .collect(),
        Err(err) => {
            warn!("skipping predictor log {}: {}", path.display(), err);
            Vec::new()
        }
    };
    MetricTable {
        workload: workload.to_string(),
        axis: axis.to_string(),
        rows,
    }
}

fn read_and<T>(path: &Path, extract: impl FnOnce(&str) -> Result<T>) -> Result<T> {
    let content = fs::read_to_string(path)?;
    extract(&content)
}

/// Captured logs present under a results root, sorted by path.
pub fn discover_logs(results_root: &Path) -> Vec<PathBuf> {
    let mut logs: Vec<PathBuf> = walkdir::WalkDir::new(results_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("txt") | Some("out")
            )
        })
        .collect();
    logs.sort();
    logs
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweeplab_core::fsutil::ensure_dir;

    const CACHE_LOG: &str = "\
--------
Total Statistics
--------
Total Instructions: 1000000000
Total Cycles: 666666666
IPC: 1.5

--------
L1 Cache
--------
  L1-Data Cache:
    Size(KB):          32
    Block Size(B):     64
    Associativity:      8

L1 Cache Stats:
  L1-Total-Hits:       999500000   99.95%
  L1-Total-Misses:        500000    0.05%
  L1-Total-Accesses:  1000000000  100.00%
";

    fn cache_profile() -> ExtractionProfile {
        ExtractionProfile {
            header: "L1-Data Cache".to_string(),
            rule: HeaderRule::Offsets(vec![1, 3, 2]),
            misses: "L1-Total-Misses".to_string(),
            label: LabelTemplate::new("{}K-{}-{}B"),
        }
    }

    #[test]
    fn extracts_ipc_mpki_and_label_from_a_cache_log() {
        let metrics = extract_variant(CACHE_LOG, &cache_profile()).expect("extract");
        assert_eq!(metrics.label, "32K-8-64B");
        assert!((metrics.ipc - 1.5).abs() < f64::EPSILON);
        assert!((metrics.mpki - 0.5).abs() < 1e-12);
    }

    #[test]
    fn inline_header_token_builds_the_prefetch_label() {
        let log = "\
Total Instructions: 2000000000
IPC: 0.9
  L2_prefetching (prefetch depth: 4)
  L2-Total-Misses:      1000000    0.10%
";
        let profile = ExtractionProfile {
            header: "L2_prefetching".to_string(),
            rule: HeaderRule::InlineToken(3),
            misses: "L2-Total-Misses".to_string(),
            label: LabelTemplate::new("{}"),
        };
        let metrics = extract_variant(log, &profile).expect("extract");
        assert_eq!(metrics.label, "4");
        assert!((metrics.mpki - 0.5).abs() < 1e-12);
    }

    #[test]
    fn missing_anchor_is_a_parse_error_not_a_fault() {
        let log = "Total Instructions: 1000\nIPC: 1.0\n";
        let err = extract_variant(log, &cache_profile()).expect_err("must fail");
        assert!(matches!(err, Error::Parse(_)), "unexpected: {}", err);
        assert!(err.to_string().contains("L1-Total-Misses"), "{}", err);
    }

    fn interval_block(instructions: u64, misses: u64) -> String {
        format!(
            "Total Instructions: {}\nIPC: 1.2\n  L1-Total-Misses: {}  0.1%\n  L2-Total-Misses: {}  0.1%\n  Tlb-Total-Misses: {}  0.1%\n\n",
            instructions, misses, misses, misses
        )
    }

    #[test]
    fn interval_extraction_returns_n_blocks_and_drops_the_summary() {
        let subsystems = vec!["L1".to_string(), "L2".to_string(), "Tlb".to_string()];
        let mut log = String::new();
        log.push_str(&interval_block(10_000_000, 5_000));
        log.push_str(&interval_block(10_000_000, 7_000));
        log.push_str(&interval_block(10_000_000, 9_000));
        // Trailing cumulative block, same shape: must contribute nothing.
        log.push_str(&interval_block(30_000_000, 21_000));
        let records = extract_intervals(&log, &subsystems).expect("extract");
        assert_eq!(records.len(), 3);
        assert!((records[0].mpki["L1"] - 0.5).abs() < 1e-12);
        assert!((records[2].mpki["Tlb"] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn interval_misses_pair_with_their_own_block_not_the_total() {
        let subsystems = vec!["L1".to_string()];
        let mut log = String::new();
        log.push_str("Total Instructions: 1000000\nIPC: 1.0\nL1-Total-Misses: 1000\n\n");
        log.push_str("Total Instructions: 2000000\nIPC: 1.0\nL1-Total-Misses: 1000\n\n");
        log.push_str("Total Instructions: 3000000\nIPC: 1.0\nL1-Total-Misses: 2000\n\n");
        let records = extract_intervals(&log, &subsystems).expect("extract");
        assert_eq!(records.len(), 2);
        assert!((records[0].mpki["L1"] - 1.0).abs() < 1e-12);
        assert!((records[1].mpki["L1"] - 0.5).abs() < 1e-12);
    }

    const PREDICTOR_LOG: &str = "\
Total Instructions: 1000000000

RAS: (Correct - Incorrect)
  RAS-32: 900 100

Branch Predictors: (Name - Correct - Incorrect)
  Nbit-1: 900000000 100000000
  Local-2048-2: 940000000 60000000
  Global-8192-2: 950000000 50000000
  Tournament-BTB-2K-1-Local-16K: 960000000 40000000
";

    #[test]
    fn predictor_section_yields_declaration_order_metrics() {
        let predictors = extract_predictors(PREDICTOR_LOG, 4).expect("extract");
        assert_eq!(predictors.len(), 4);
        assert_eq!(predictors[0].name, "Nbit-1");
        assert!((predictors[0].mpki - 100000000.0 / 1000000000.0 / 1000.0).abs() < 1e-15);
        assert_eq!(predictors[1].label, "Local\n2048-2");
        assert_eq!(predictors[2].label, "Global\n8192-2");
        assert_eq!(predictors[3].label, "Tournament\nBTB-2K-1\nLocal-16K");
    }

    #[test]
    fn short_predictor_section_is_a_parse_error() {
        let err = extract_predictors(PREDICTOR_LOG, 9).expect_err("must fail");
        assert!(matches!(err, Error::Parse(_)), "unexpected: {}", err);
    }

    fn cache_log(size: &str) -> String {
        CACHE_LOG.replace(
            "Size(KB):          32",
            &format!("Size(KB):          {}", size),
        )
    }

    #[test]
    fn sweep_table_preserves_catalog_row_order() {
        let root = std::env::temp_dir().join(format!(
            "sweeplab_analysis_e2e_{}",
            std::process::id()
        ));
        let axis_dir = root.join("blackscholes").join("L1");
        ensure_dir(&axis_dir).expect("axis dir");
        for size in ["32", "64", "128"] {
            let stem = format!("{}K-8-64B", size);
            fs::write(axis_dir.join(format!("{}.txt", stem)), cache_log(size)).expect("log");
        }
        let stems: Vec<String> = ["32", "64", "128"]
            .iter()
            .map(|s| format!("{}K-8-64B", s))
            .collect();
        let table = collect_sweep(&root, "blackscholes", "L1", &stems, &cache_profile());
        assert_eq!(table.rows.len(), 3);
        let labels: Vec<&str> = table.rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["32K-8-64B", "64K-8-64B", "128K-8-64B"]);
        for row in &table.rows {
            assert!((row.ipc.expect("ipc") - 1.5).abs() < f64::EPSILON);
            assert!((row.mpki["L1"] - 0.5).abs() < 1e-12);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unparsable_variant_is_skipped_without_aborting_the_table() {
        let root = std::env::temp_dir().join(format!(
            "sweeplab_analysis_partial_{}",
            std::process::id()
        ));
        let axis_dir = root.join("canneal").join("L1");
        ensure_dir(&axis_dir).expect("axis dir");
        fs::write(axis_dir.join("32K-8-64B.txt"), cache_log("32")).expect("log");
        fs::write(axis_dir.join("64K-8-64B.txt"), "truncated\n").expect("log");
        let stems = vec!["32K-8-64B".to_string(), "64K-8-64B".to_string()];
        let table = collect_sweep(&root, "canneal", "L1", &stems, &cache_profile());
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].label, "32K-8-64B");
        let _ = fs::remove_dir_all(root);
    }
}
