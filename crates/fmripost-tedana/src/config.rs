//! Process-wide configuration.
//!
//! [`Settings`] is resolved once from the command line, an optional TOML
//! config file and built-in defaults (in that order of precedence).
//! [`Context::init`] then prepares the directories, indexes the dataset and
//! loads the BIDS filters. The resulting [`Context`] is read-only and is
//! passed by reference to every workflow step until the process exits.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{anyhow, bail, Context as _, Result};
use fmripost_bids::BidsLayout;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cli::Cli;
use crate::filters::FilterOverrides;
use crate::logging::CLI;
use crate::tedana::{CombMode, FitType, GsControl, TedPca, TedanaOptions};

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub tedana: TedanaSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecutionSection {
    pub participant_label: Option<Vec<String>>,
    pub task_id: Option<String>,
    pub bids_filter_file: Option<PathBuf>,
    pub derivatives: Option<Vec<PathBuf>>,
    pub work_dir: Option<PathBuf>,
    pub nprocs: Option<usize>,
    pub skip_bids_validation: Option<bool>,
    pub stop_on_first_crash: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TedanaSection {
    pub executable: Option<PathBuf>,
    pub fittype: Option<FitType>,
    pub combmode: Option<CombMode>,
    pub tedpca: Option<TedPca>,
    pub tree: Option<String>,
    pub maxit: Option<u32>,
    pub maxrestart: Option<u32>,
    pub tedort: Option<bool>,
    pub gscontrol: Option<Vec<GsControl>>,
    pub png_cmap: Option<String>,
    pub low_mem: Option<bool>,
    pub seed: Option<u32>,
    pub omp_nthreads: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSettings {
    pub bids_dir: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub log_dir: PathBuf,
    pub derivatives: Vec<PathBuf>,
    pub participant_label: Vec<String>,
    pub task_id: Option<String>,
    pub bids_filter_file: Option<PathBuf>,
    pub nprocs: usize,
    pub skip_bids_validation: bool,
    pub clean_workdir: bool,
    pub stop_on_first_crash: bool,
}

impl ExecutionSettings {
    pub fn new(bids_dir: PathBuf, output_dir: PathBuf) -> Self {
        let log_dir = output_dir.join("logs");
        Self {
            work_dir: PathBuf::from("work"),
            bids_dir,
            output_dir,
            log_dir,
            derivatives: Vec::new(),
            participant_label: Vec::new(),
            task_id: None,
            bids_filter_file: None,
            nprocs: default_nprocs(),
            skip_bids_validation: false,
            clean_workdir: false,
            stop_on_first_crash: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub execution: ExecutionSettings,
    pub tedana: TedanaOptions,
}

impl Settings {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let file = match &cli.config_file {
            Some(path) => {
                let file = FileConfig::load(path)?;
                info!(target: CLI, "Loaded previous configuration file {}", path.display());
                file
            }
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    fn resolve(cli: Cli, file: FileConfig) -> Result<Self> {
        if !cli.bids_dir.exists() {
            bail!("Path does not exist: <{}>.", cli.bids_dir.display());
        }
        let bids_dir = absolute(&cli.bids_dir)?;
        let output_dir = absolute(&cli.output_dir)?;
        let work_dir = match cli.work_dir.or(file.execution.work_dir) {
            Some(dir) => absolute(&dir)?,
            None => env::current_dir()?.join("work"),
        };

        if output_dir == bids_dir {
            bail!(
                "The selected output folder is the same as the input BIDS folder. \
                 Please modify the output path (suggestion: {}).",
                bids_dir.join("derivatives").join("fmripost_tedana").display()
            );
        }
        if work_dir.starts_with(&bids_dir) {
            bail!(
                "The selected working directory is a subdirectory of the input BIDS folder. \
                 Please modify the output path."
            );
        }

        let participant_label = if cli.participant_label.is_empty() {
            file.execution.participant_label.unwrap_or_default()
        } else {
            cli.participant_label
        };
        let derivatives = if cli.derivatives.is_empty() {
            file.execution.derivatives.unwrap_or_default()
        } else {
            cli.derivatives
        };
        let derivatives = derivatives
            .iter()
            .map(|path| absolute(path))
            .collect::<Result<Vec<_>>>()?;

        let mut execution = ExecutionSettings::new(bids_dir, output_dir);
        execution.work_dir = work_dir;
        execution.derivatives = derivatives;
        execution.participant_label = participant_label;
        execution.task_id = cli.task_id.or(file.execution.task_id);
        execution.bids_filter_file = cli.bids_filter_file.or(file.execution.bids_filter_file);
        execution.nprocs = cli
            .nprocs
            .or(file.execution.nprocs)
            .unwrap_or(execution.nprocs);
        execution.skip_bids_validation =
            cli.skip_bids_validation || file.execution.skip_bids_validation.unwrap_or(false);
        execution.clean_workdir = cli.clean_workdir;
        execution.stop_on_first_crash =
            cli.stop_on_first_crash || file.execution.stop_on_first_crash.unwrap_or(false);

        let defaults = TedanaOptions::default();
        let args = cli.tedana;
        let section = file.tedana;
        let tedana = TedanaOptions {
            executable: args
                .tedana_bin
                .or(section.executable)
                .unwrap_or(defaults.executable),
            fittype: args.fittype.or(section.fittype).unwrap_or(defaults.fittype),
            combmode: args.combmode.or(section.combmode).unwrap_or(defaults.combmode),
            tedpca: args.tedpca.or(section.tedpca).unwrap_or(defaults.tedpca),
            tree: args.tree.or(section.tree).unwrap_or(defaults.tree),
            maxit: args.maxit.or(section.maxit).unwrap_or(defaults.maxit),
            maxrestart: args
                .maxrestart
                .or(section.maxrestart)
                .unwrap_or(defaults.maxrestart),
            tedort: args.tedort || section.tedort.unwrap_or(defaults.tedort),
            gscontrol: if args.gscontrol.is_empty() {
                section.gscontrol.unwrap_or(defaults.gscontrol)
            } else {
                args.gscontrol
            },
            png_cmap: args.png_cmap.or(section.png_cmap).unwrap_or(defaults.png_cmap),
            low_mem: cli.low_mem || section.low_mem.unwrap_or(defaults.low_mem),
            seed: cli.random_seed.or(section.seed),
            omp_nthreads: cli.omp_nthreads.or(section.omp_nthreads),
        };

        if let Some(omp) = tedana.omp_nthreads {
            if 1 < execution.nprocs && execution.nprocs < omp {
                warn!(
                    target: CLI,
                    "Per-process threads (--omp-nthreads={omp}) exceed total threads (--nprocs={})",
                    execution.nprocs
                );
            }
        }

        Ok(Self { execution, tedana })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let rendered = toml::to_string_pretty(self).context("failed to render configuration")?;
        fs::write(path, rendered)
            .with_context(|| format!("failed to write configuration to {}", path.display()))
    }
}

/// Everything a workflow step needs: settings, the dataset index and the BIDS filters.
pub struct Context {
    pub settings: Settings,
    pub layout: BidsLayout,
    pub filters: FilterOverrides,
}

impl Context {
    pub fn init(mut settings: Settings) -> Result<Self> {
        let execution = &settings.execution;
        if execution.clean_workdir && execution.work_dir.exists() {
            info!(
                target: CLI,
                "Clearing previous working directory: {}",
                execution.work_dir.display()
            );
            if let Err(err) = clean_directory(&execution.work_dir) {
                warn!(
                    target: CLI,
                    "Could not clear all contents of working directory {}: {err}",
                    execution.work_dir.display()
                );
            }
        }

        if !execution.skip_bids_validation {
            info!(target: CLI, "Making sure the input data is BIDS compliant");
            validate_input_dir(&execution.bids_dir)?;
        }

        fs::create_dir_all(&execution.log_dir)
            .with_context(|| format!("failed to create {}", execution.log_dir.display()))?;
        fs::create_dir_all(&execution.work_dir)
            .with_context(|| format!("failed to create {}", execution.work_dir.display()))?;

        let filters = match &execution.bids_filter_file {
            Some(path) => FilterOverrides::load(path)?,
            None => FilterOverrides::default(),
        };
        let layout = BidsLayout::with_derivatives(&execution.bids_dir, &execution.derivatives)
            .context("failed to index BIDS dataset")?;

        let participants = resolve_participants(&layout, &execution.participant_label)?;
        settings.execution.participant_label = participants;
        settings.write(&settings.execution.log_dir.join(CONFIG_FILE_NAME))?;

        Ok(Self {
            settings,
            layout,
            filters,
        })
    }
}

/// Requested labels, or every subject when none were requested. Sorted and deduplicated.
fn resolve_participants(layout: &BidsLayout, requested: &[String]) -> Result<Vec<String>> {
    let all_subjects = layout.get_subjects();
    if requested.is_empty() {
        return Ok(all_subjects);
    }
    let mut labels = requested.to_vec();
    labels.sort();
    labels.dedup();
    let missing: Vec<&str> = labels
        .iter()
        .filter(|label| !all_subjects.contains(label))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(anyhow!(
            "One or more participant labels were not found in the BIDS directory: {}.",
            missing.join(", ")
        ));
    }
    Ok(labels)
}

fn validate_input_dir(bids_dir: &Path) -> Result<()> {
    let description = bids_dir.join("dataset_description.json");
    if !description.is_file() {
        bail!(
            "{} is not a BIDS dataset: dataset_description.json is missing \
             (use --skip-bids-validation to bypass this check)",
            bids_dir.display()
        );
    }
    let raw = fs::read_to_string(&description)?;
    serde_json::from_str::<serde_json::Value>(&raw)
        .with_context(|| format!("invalid {}", description.display()))?;
    Ok(())
}

fn clean_directory(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

fn default_nprocs() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
