use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use fmripost_bids::{split_extension, BidsFile};
use glob::Pattern;
use serde_json::json;

pub const BIDS_VERSION: &str = "1.9.0";
const TEDANA_REPORT: &str = "tedana_report.html";

/// Writes `dataset_description.json` unless one already exists.
pub fn ensure_dataset_description(output_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join("dataset_description.json");
    if path.exists() {
        return Ok(path);
    }
    let description = json!({
        "Name": "fMRIPost-tedana output",
        "BIDSVersion": BIDS_VERSION,
        "DatasetType": "derivative",
        "GeneratedBy": [{
            "Name": env!("CARGO_PKG_NAME"),
            "Version": env!("CARGO_PKG_VERSION"),
        }],
    });
    fs::write(&path, serde_json::to_string_pretty(&description)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Filename entities identifying the run: the first echo's name without its
/// echo and desc entities, suffix and extension.
pub fn run_prefix(first_echo: &BidsFile) -> String {
    let (stem, _) = split_extension(first_echo.filename());
    let tokens: Vec<&str> = stem.split('_').collect();
    let entity_tokens = match tokens.split_last() {
        Some((last, rest)) if !last.contains('-') => rest,
        _ => &tokens[..],
    };
    entity_tokens
        .iter()
        .filter(|token| !token.starts_with("echo-") && !token.starts_with("desc-"))
        .copied()
        .collect::<Vec<_>>()
        .join("_")
}

/// Per-run destination directories inside the derivatives tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutputDirs {
    pub func: PathBuf,
    pub figures: PathBuf,
}

impl RunOutputDirs {
    pub fn for_run(output_dir: &Path, first_echo: &BidsFile) -> Result<Self> {
        let subject = first_echo
            .entity("subject")
            .ok_or_else(|| anyhow!("{} has no subject entity", first_echo.path().display()))?;
        let subject_dir = output_dir.join(format!("sub-{subject}"));
        let func = match first_echo.entity("session") {
            Some(session) => subject_dir.join(format!("ses-{session}")).join("func"),
            None => subject_dir.join("func"),
        };
        Ok(Self {
            func,
            figures: subject_dir.join("figures"),
        })
    }
}

/// Copies tedana's outputs for `prefix` into the derivatives tree.
pub fn collect_outputs(tedana_dir: &Path, prefix: &str, dirs: &RunOutputDirs) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(&dirs.func)?;
    let pattern = format!(
        "{}/{}_*",
        Pattern::escape(&tedana_dir.to_string_lossy()),
        Pattern::escape(prefix)
    );
    let mut written = Vec::new();
    for entry in glob::glob(&pattern).map_err(|e| anyhow!(e.msg))? {
        let source = entry?;
        if !source.is_file() {
            continue;
        }
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = dirs.func.join(name);
        fs::copy(&source, &target)
            .with_context(|| format!("failed to copy {}", source.display()))?;
        written.push(target);
    }

    let report = tedana_dir.join(TEDANA_REPORT);
    if report.is_file() {
        fs::create_dir_all(&dirs.figures)?;
        let target = dirs
            .figures
            .join(format!("{prefix}_desc-tedana_report.html"));
        fs::copy(&report, &target)
            .with_context(|| format!("failed to copy {}", report.display()))?;
        written.push(target);
    }
    written.sort();
    Ok(written)
}

pub fn metrics_path(func_dir: &Path, prefix: &str) -> PathBuf {
    func_dir.join(format!("{prefix}_desc-tedana_metrics.tsv"))
}

/// Number of components per `classification` in a tedana metrics table.
pub fn summarize_metrics(path: &Path) -> Result<BTreeMap<String, usize>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let column = reader
        .headers()?
        .iter()
        .position(|h| h == "classification")
        .ok_or_else(|| anyhow!("{} has no classification column", path.display()))?;
    let mut counts = BTreeMap::new();
    for record in reader.records() {
        let record = record?;
        if let Some(label) = record.get(column) {
            *counts.entry(label.to_string()).or_insert(0) += 1;
        }
    }
    Ok(counts)
}
