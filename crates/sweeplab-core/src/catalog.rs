//! Sweep catalog: ordered parameter sets loaded from a tabular sweep
//! specification.
//!
//! The specification is CSV: one header row of flag names, one data row
//! per configuration variant. Row order is authoritative and is
//! preserved all the way into the final metric table.

use std::fs::File;
use std::path::Path;

use crate::error::{Error, Result};

/// One sweep row: an ordered flag-name/value mapping. Immutable once
/// constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSet {
    columns: Vec<(String, String)>,
}

impl ParameterSet {
    /// Harness flag tokens in column order: `-<flag> <value>` pairs.
    pub fn flag_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.columns.len() * 2);
        for (flag, value) in &self.columns {
            args.push(format!("-{}", flag));
            args.push(value.clone());
        }
        args
    }

    /// Row values in source-table column order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(_, v)| v.as_str())
    }

    /// Display label for this variant, rendered from the row's values in
    /// column order.
    pub fn label(&self, template: &LabelTemplate) -> String {
        template.render(self.values())
    }

    pub fn columns(&self) -> &[(String, String)] {
        &self.columns
    }
}

/// Ordered sequence of parameter sets for one sweep axis.
#[derive(Debug, Clone)]
pub struct SweepCatalog {
    rows: Vec<ParameterSet>,
}

impl SweepCatalog {
    /// Loads a sweep specification. Fails with [`Error::Config`] if the
    /// file is missing, has no header, has no data rows, or contains a
    /// row whose field count differs from the header.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Config(format!("cannot open sweep spec {}: {}", path.display(), e))
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(file);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
            .iter()
            .map(str::to_string)
            .collect();
        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Err(Error::Config(format!(
                "sweep spec {} has no header row",
                path.display()
            )));
        }
        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| {
                Error::Config(format!("sweep spec {} row {}: {}", path.display(), idx + 2, e))
            })?;
            if record.len() != headers.len() {
                return Err(Error::Config(format!(
                    "sweep spec {} row {} has {} fields, expected {}",
                    path.display(),
                    idx + 2,
                    record.len(),
                    headers.len()
                )));
            }
            let columns = headers
                .iter()
                .cloned()
                .zip(record.iter().map(str::to_string))
                .collect();
            rows.push(ParameterSet { columns });
        }
        if rows.is_empty() {
            return Err(Error::Config(format!(
                "sweep spec {} has no variant rows",
                path.display()
            )));
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[ParameterSet] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Label template: literal text with `{}` placeholders substituted in
/// order, e.g. `{}K-{}-{}B` over `["32", "8", "64"]` gives `32K-8-64B`.
#[derive(Debug, Clone)]
pub struct LabelTemplate {
    text: String,
}

impl LabelTemplate {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn render<'a, I>(&self, values: I) -> String
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = String::new();
        let mut values = values.into_iter();
        let mut parts = self.text.split("{}").peekable();
        while let Some(part) = parts.next() {
            out.push_str(part);
            if parts.peek().is_some() {
                if let Some(value) = values.next() {
                    out.push_str(value);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sweeplab_catalog_test_{}_{}",
            std::process::id(),
            name
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        let path = dir.join("sweep.csv");
        fs::write(&path, contents).expect("write sweep spec");
        path
    }

    #[test]
    fn yields_one_parameter_set_per_row_in_row_order() {
        let path = scratch_file(
            "rows",
            "L1_size,L1_assoc,L1_bsize\n32,8,64\n64,8,64\n128,8,64\n",
        );
        let catalog = SweepCatalog::load(&path).expect("load");
        assert_eq!(catalog.len(), 3);
        let sizes: Vec<&str> = catalog
            .rows()
            .iter()
            .map(|row| row.values().next().expect("first value"))
            .collect();
        assert_eq!(sizes, ["32", "64", "128"]);
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn flag_args_are_dash_name_value_pairs_in_column_order() {
        let path = scratch_file("flags", "L1_size,L1_assoc\n32,8\n");
        let catalog = SweepCatalog::load(&path).expect("load");
        assert_eq!(
            catalog.rows()[0].flag_args(),
            ["-L1_size", "32", "-L1_assoc", "8"]
        );
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn empty_spec_is_a_config_error() {
        let path = scratch_file("empty", "");
        let err = SweepCatalog::load(&path).expect_err("empty spec must fail");
        assert!(matches!(err, Error::Config(_)), "unexpected: {}", err);
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn header_only_spec_is_a_config_error() {
        let path = scratch_file("headeronly", "L1_size,L1_assoc\n");
        let err = SweepCatalog::load(&path).expect_err("no rows must fail");
        assert!(err.to_string().contains("no variant rows"), "{}", err);
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn short_row_is_a_config_error() {
        let path = scratch_file("short", "L1_size,L1_assoc,L1_bsize\n32,8\n");
        let err = SweepCatalog::load(&path).expect_err("short row must fail");
        assert!(matches!(err, Error::Config(_)), "unexpected: {}", err);
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn label_renders_values_in_column_order() {
        let path = scratch_file("label", "size,assoc,block\n32,8,64\n");
        let catalog = SweepCatalog::load(&path).expect("load");
        let template = LabelTemplate::new("{}K-{}-{}B");
        assert_eq!(catalog.rows()[0].label(&template), "32K-8-64B");
        let _ = fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn template_ignores_surplus_values_and_placeholders() {
        let template = LabelTemplate::new("{}E-{}");
        assert_eq!(template.render(["64", "4", "extra"]), "64E-4");
        assert_eq!(template.render(["64"]), "64E-");
    }
}
