//! Filesystem and digest helpers shared across the workspace.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::Result;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    Ok(sha256_bytes(&fs::read(path)?))
}

/// Output path for one run, as a pure function of its identity. Every
/// (workload, axis, file name) triple owns a distinct path, so workers
/// never contend for the same file; re-running a pair overwrites it.
pub fn run_output_path(results_root: &Path, workload: &str, axis: &str, file_name: &str) -> PathBuf {
    results_root.join(workload).join(axis).join(file_name)
}
