//! Workload command registry and name resolution.
//!
//! The registry is a newline-delimited text file, one record per
//! workload or driver. Two record shapes occur in the wild:
//!
//! - `-o <stdout> -e <stderr> <argv...>`: redirection fields at fixed
//!   token positions, argument vector from token four onward;
//! - `<argv...>`: no redirection fields; the run discards the child's
//!   stdout/stderr (the harness writes its numeric results itself).
//!
//! A record's identifying token is the leading argv element.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One parsed registry line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub argv: Vec<String>,
}

impl CommandRecord {
    fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(Error::Config("empty command record".to_string()));
        }
        if tokens[0] == "-o" {
            if tokens.len() < 5 || tokens[2] != "-e" {
                return Err(Error::Config(format!(
                    "malformed command record: `{}`",
                    line.trim()
                )));
            }
            Ok(Self {
                stdout: Some(tokens[1].to_string()),
                stderr: Some(tokens[3].to_string()),
                argv: tokens[4..].iter().map(|t| t.to_string()).collect(),
            })
        } else {
            Ok(Self {
                stdout: None,
                stderr: None,
                argv: tokens.iter().map(|t| t.to_string()).collect(),
            })
        }
    }

    /// Leading argv token, matched against workload names.
    pub fn identifying_token(&self) -> &str {
        &self.argv[0]
    }
}

/// All known workload/driver commands, in declaration order.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    records: Vec<CommandRecord>,
}

impl CommandRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read command registry {}: {}", path.display(), e))
        })?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            records.push(CommandRecord::parse(line)?);
        }
        if records.is_empty() {
            return Err(Error::Config(format!(
                "command registry {} is empty",
                path.display()
            )));
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[CommandRecord] {
        &self.records
    }
}

/// Fully resolved invocation context for one workload.
#[derive(Debug, Clone)]
pub struct BenchmarkDescriptor {
    pub workload: String,
    pub workdir: PathBuf,
    pub argv: Vec<String>,
    /// Capture paths for the child's own stdout/stderr channels,
    /// resolved against the working directory. `None` means discard.
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

/// Maps workload names to runnable descriptors.
///
/// Resolution takes the first record in registry declaration order
/// whose identifying token contains the workload name. Unmatched
/// workloads fall back through the alias table (workload name to driver
/// token), again first-match in declaration order; some workloads are
/// installed separately from the driver binary that actually executes
/// them. Neither match is [`Error::NotFound`].
#[derive(Debug, Clone)]
pub struct Resolver {
    registry: CommandRegistry,
    aliases: BTreeMap<String, String>,
    work_root: PathBuf,
    per_workload_dirs: bool,
}

impl Resolver {
    pub fn new(
        registry: CommandRegistry,
        aliases: BTreeMap<String, String>,
        work_root: PathBuf,
        per_workload_dirs: bool,
    ) -> Self {
        Self {
            registry,
            aliases,
            work_root,
            per_workload_dirs,
        }
    }

    pub fn resolve(&self, workload: &str) -> Result<BenchmarkDescriptor> {
        let record = self
            .find_containing(workload)
            .or_else(|| {
                self.aliases
                    .get(workload)
                    .and_then(|token| self.find_containing(token))
            })
            .ok_or_else(|| Error::NotFound(workload.to_string()))?;
        let workdir = if self.per_workload_dirs {
            self.work_root.join(workload)
        } else {
            self.work_root.clone()
        };
        Ok(BenchmarkDescriptor {
            workload: workload.to_string(),
            argv: record.argv.clone(),
            stdout: record.stdout.as_ref().map(|p| workdir.join(p)),
            stderr: record.stderr.as_ref().map(|p| workdir.join(p)),
            workdir,
        })
    }

    fn find_containing(&self, needle: &str) -> Option<&CommandRecord> {
        self.registry
            .records
            .iter()
            .find(|r| r.identifying_token().contains(needle))
    }
}

/// Workload list: newline-delimited identifiers, blanks skipped.
pub fn load_workloads(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read workload list {}: {}", path.display(), e))
    })?;
    let workloads: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if workloads.is_empty() {
        return Err(Error::Config(format!(
            "workload list {} is empty",
            path.display()
        )));
    }
    Ok(workloads)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_from(lines: &[&str]) -> CommandRegistry {
        CommandRegistry {
            records: lines
                .iter()
                .map(|l| CommandRecord::parse(l).expect("record"))
                .collect(),
        }
    }

    fn resolver(lines: &[&str], aliases: &[(&str, &str)]) -> Resolver {
        Resolver::new(
            registry_from(lines),
            aliases
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            PathBuf::from("/work"),
            false,
        )
    }

    #[test]
    fn record_with_redirection_fields_parses_positionally() {
        let record =
            CommandRecord::parse("-o bench.out -e bench.err ./bench_base --size ref").expect("record");
        assert_eq!(record.stdout.as_deref(), Some("bench.out"));
        assert_eq!(record.stderr.as_deref(), Some("bench.err"));
        assert_eq!(record.argv, ["./bench_base", "--size", "ref"]);
    }

    #[test]
    fn bare_record_discards_redirection() {
        let record = CommandRecord::parse("pkgs/apps/ferret/inst/bin/ferret corel lsh").expect("record");
        assert_eq!(record.stdout, None);
        assert_eq!(record.stderr, None);
        assert_eq!(record.identifying_token(), "pkgs/apps/ferret/inst/bin/ferret");
    }

    #[test]
    fn truncated_redirection_record_is_a_config_error() {
        let err = CommandRecord::parse("-o bench.out -e").expect_err("must fail");
        assert!(matches!(err, Error::Config(_)), "unexpected: {}", err);
    }

    #[test]
    fn exact_match_wins_even_when_a_fallback_entry_exists() {
        let r = resolver(
            &["bin/rtview scene.obj", "bin/ferret corel lsh"],
            &[("raytrace", "rtview")],
        );
        let descriptor = r.resolve("ferret").expect("resolve");
        assert_eq!(descriptor.argv[0], "bin/ferret");
    }

    #[test]
    fn unmatched_workload_falls_back_through_the_alias_table() {
        let r = resolver(
            &["bin/ferret corel lsh", "bin/rtview scene.obj"],
            &[("raytrace", "rtview")],
        );
        let descriptor = r.resolve("raytrace").expect("resolve");
        assert_eq!(descriptor.argv[0], "bin/rtview");
        assert_eq!(descriptor.workload, "raytrace");
    }

    #[test]
    fn unmatched_workload_without_alias_is_not_found() {
        let r = resolver(&["bin/ferret corel lsh"], &[("raytrace", "rtview")]);
        let err = r.resolve("vips").expect_err("must not resolve");
        assert!(matches!(err, Error::NotFound(_)), "unexpected: {}", err);
    }

    #[test]
    fn fallback_is_first_match_in_declaration_order() {
        let r = resolver(
            &["bin/rtview-a scene.obj", "bin/rtview-b scene.obj"],
            &[("raytrace", "rtview")],
        );
        let descriptor = r.resolve("raytrace").expect("resolve");
        assert_eq!(descriptor.argv[0], "bin/rtview-a");
    }

    #[test]
    fn capture_paths_resolve_against_the_working_directory() {
        let registry = registry_from(&["-o bench.out -e bench.err ./bench_base ref"]);
        let r = Resolver::new(
            registry,
            BTreeMap::new(),
            PathBuf::from("/work/inputs"),
            true,
        );
        let descriptor = r.resolve("bench").expect("resolve");
        assert_eq!(descriptor.workdir, PathBuf::from("/work/inputs/bench"));
        assert_eq!(
            descriptor.stdout.as_deref(),
            Some(Path::new("/work/inputs/bench/bench.out"))
        );
        assert_eq!(
            descriptor.stderr.as_deref(),
            Some(Path::new("/work/inputs/bench/bench.err"))
        );
    }
}
