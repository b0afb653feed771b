use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context as _, Result};
use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::collect::{collect_first_echoes, collect_run_data};
use crate::config::Context;
use crate::derivatives::{
    collect_outputs, ensure_dataset_description, metrics_path, run_prefix, summarize_metrics,
    RunOutputDirs,
};
use crate::logging::WORKFLOW;
use crate::tedana::TedanaInvocation;

#[derive(Debug, Default)]
pub struct RunReport {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub skipped: Vec<PathBuf>,
}

impl RunReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }
}

enum Outcome {
    Done,
    Failed(String),
    Skipped,
}

pub fn run(ctx: &Context) -> Result<()> {
    let report = run_with(ctx, |invocation| {
        invocation.execute().map_err(anyhow::Error::from)
    })?;
    if !report.failed.is_empty() {
        return Err(anyhow!(
            "{} of {} runs failed",
            report.failed.len(),
            report.total()
        ));
    }
    Ok(())
}

/// Denoises every first echo found for the requested participants, with
/// `execute` standing in for the external tedana process.
pub fn run_with<F>(ctx: &Context, execute: F) -> Result<RunReport>
where
    F: Fn(&TedanaInvocation) -> Result<()> + Sync,
{
    let execution = &ctx.settings.execution;
    ensure_dataset_description(&execution.output_dir)?;
    let first_echoes = collect_first_echoes(ctx);
    if first_echoes.is_empty() {
        warn!(
            target: WORKFLOW,
            "no multi-echo runs found for participant(s) {}",
            execution.participant_label.join(", ")
        );
        return Ok(RunReport::default());
    }
    info!(
        target: WORKFLOW,
        "found {} run(s) to denoise with {} worker(s)",
        first_echoes.len(),
        execution.nprocs
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(execution.nprocs)
        .build()
        .context("failed to start worker pool")?;
    let crashed = AtomicBool::new(false);
    let outcomes: Vec<(PathBuf, Outcome)> = pool.install(|| {
        first_echoes
            .par_iter()
            .map(|first_echo| {
                if execution.stop_on_first_crash && crashed.load(Ordering::SeqCst) {
                    return (first_echo.clone(), Outcome::Skipped);
                }
                match denoise_run(ctx, first_echo, &execute) {
                    Ok(written) => {
                        info!(
                            target: WORKFLOW,
                            "finished {} ({} outputs)",
                            first_echo.display(),
                            written.len()
                        );
                        (first_echo.clone(), Outcome::Done)
                    }
                    Err(err) => {
                        crashed.store(true, Ordering::SeqCst);
                        error!(target: WORKFLOW, "run {} failed: {err:#}", first_echo.display());
                        (first_echo.clone(), Outcome::Failed(format!("{err:#}")))
                    }
                }
            })
            .collect()
    });

    let mut report = RunReport::default();
    for (first_echo, outcome) in outcomes {
        match outcome {
            Outcome::Done => report.succeeded.push(first_echo),
            Outcome::Failed(reason) => report.failed.push((first_echo, reason)),
            Outcome::Skipped => report.skipped.push(first_echo),
        }
    }
    Ok(report)
}

fn denoise_run<F>(ctx: &Context, first_echo: &Path, execute: &F) -> Result<Vec<PathBuf>>
where
    F: Fn(&TedanaInvocation) -> Result<()>,
{
    let execution = &ctx.settings.execution;
    let reference = ctx.layout.get_file(first_echo)?;
    let prefix = run_prefix(reference);
    let run_data = collect_run_data(ctx, first_echo)?;
    if run_data.echo_files.len() < 2 {
        warn!(
            target: WORKFLOW,
            "{} has a single echo; tedana expects multi-echo data",
            first_echo.display()
        );
    }

    let tedana_dir = execution.work_dir.join(&prefix).join("tedana");
    fs::create_dir_all(&tedana_dir)
        .with_context(|| format!("failed to create {}", tedana_dir.display()))?;
    let invocation = TedanaInvocation::new(&run_data, &prefix, &tedana_dir, &ctx.settings.tedana);
    info!(target: WORKFLOW, "running tedana for {prefix}");
    execute(&invocation).with_context(|| format!("tedana failed for {prefix}"))?;

    let dirs = RunOutputDirs::for_run(&execution.output_dir, reference)?;
    let written = collect_outputs(&tedana_dir, &prefix, &dirs)?;
    let metrics = metrics_path(&dirs.func, &prefix);
    if metrics.is_file() {
        let counts = summarize_metrics(&metrics)?;
        info!(target: WORKFLOW, "{prefix} component classification: {counts:?}");
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionSettings, Settings};
    use crate::filters::FilterOverrides;
    use fmripost_bids::BidsLayout;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn dataset() -> TempDir {
        let dir = tempdir().unwrap();
        let bids = dir.path().join("bids");
        for subject in ["01", "02"] {
            for (echo, te) in [(1, 0.0142), (2, 0.0385), (3, 0.0625)] {
                let stem = format!("sub-{subject}/func/sub-{subject}_task-rest_echo-{echo}_bold");
                write(&bids, &format!("{stem}.nii.gz"), "");
                write(&bids, &format!("{stem}.json"), &format!(r#"{{"EchoTime": {te}}}"#));
            }
        }
        dir
    }

    fn context(dir: &Path, stop_on_first_crash: bool) -> Context {
        let bids = dir.join("bids");
        let mut execution = ExecutionSettings::new(bids.clone(), dir.join("out"));
        execution.work_dir = dir.join("work");
        execution.nprocs = 1;
        execution.stop_on_first_crash = stop_on_first_crash;
        Context {
            settings: Settings {
                execution,
                tedana: Default::default(),
            },
            layout: BidsLayout::new(&bids).unwrap(),
            filters: FilterOverrides::default(),
        }
    }

    /// Pretends to be tedana by writing a few outputs into the out dir.
    fn fake_tedana(invocation: &TedanaInvocation) -> Result<()> {
        let args: Vec<String> = invocation
            .args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let prefix_at = args.iter().position(|a| a == "--prefix").unwrap();
        let prefix = &args[prefix_at + 1];
        let out = invocation.out_dir();
        fs::write(out.join(format!("{prefix}_desc-denoised_bold.nii.gz")), "")?;
        fs::write(
            out.join(format!("{prefix}_desc-tedana_metrics.tsv")),
            "Component\tclassification\nICA_00\taccepted\n",
        )?;
        fs::write(out.join("tedana_report.html"), "<html/>")?;
        Ok(())
    }

    #[test]
    fn denoises_every_run_into_derivatives() {
        let dir = dataset();
        let ctx = context(dir.path(), false);
        let seen = Mutex::new(Vec::new());
        let report = run_with(&ctx, |invocation| {
            seen.lock().unwrap().push(invocation.args().len());
            fake_tedana(invocation)
        })
        .unwrap();
        assert_eq!(report.succeeded.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 2);

        let out = dir.path().join("out");
        assert!(out.join("dataset_description.json").is_file());
        assert!(out
            .join("sub-01/func/sub-01_task-rest_desc-denoised_bold.nii.gz")
            .is_file());
        assert!(out
            .join("sub-02/figures/sub-02_task-rest_desc-tedana_report.html")
            .is_file());
        assert!(dir.path().join("work/sub-01_task-rest/tedana").is_dir());
    }

    #[test]
    fn failures_are_reported_without_stopping_other_runs() {
        let dir = dataset();
        let ctx = context(dir.path(), false);
        let report = run_with(&ctx, |invocation| {
            if invocation.out_dir().to_string_lossy().contains("sub-01") {
                Err(anyhow!("boom"))
            } else {
                fake_tedana(invocation)
            }
        })
        .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("boom"));
        assert_eq!(report.succeeded.len(), 1);
    }

    #[test]
    fn stop_on_first_crash_skips_remaining_runs() {
        let dir = dataset();
        let ctx = context(dir.path(), true);
        let report = run_with(&ctx, |_| Err(anyhow!("boom"))).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.total(), 2);
    }

    #[test]
    fn no_runs_is_not_an_error() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bids")).unwrap();
        let ctx = context(dir.path(), false);
        let report = run_with(&ctx, |_| unreachable!()).unwrap();
        assert_eq!(report.total(), 0);
    }
}
