//! Error taxonomy for the sweep pipeline.

/// Errors produced while expanding, executing, or extracting a sweep.
///
/// Configuration and resolution errors abort before any process is
/// launched. Parse errors are scoped to a single captured log. Run
/// failures are collected per (workload, variant) pair and reported at
/// batch end without halting the remaining independent runs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The sweep specification or suite file is missing, empty, or
    /// malformed.
    #[error("config error: {0}")]
    Config(String),

    /// A workload name resolved to no registry command, even after the
    /// alias fallback.
    #[error("no command found for workload: {0}")]
    NotFound(String),

    /// A required anchor line is absent from a captured log, or a field
    /// at an expected position does not parse. Signals a run that did
    /// not complete or a harness output format change.
    #[error("parse error: {0}")]
    Parse(String),

    /// An external harness invocation exited abnormally.
    #[error("run failed: {workload} [{variant}] {reason}")]
    RunFailed {
        workload: String,
        variant: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
