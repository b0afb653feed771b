use std::path::{Path, PathBuf};

use fmripost_bids::{EntityFilter, LayoutError, NearestOptions, Query};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Context;
use crate::filters::QueryKind;
use crate::logging::WORKFLOW;

pub const NIFTI_EXTENSIONS: [&str; 2] = [".nii", ".nii.gz"];

#[derive(Error, Debug)]
pub enum CollectError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("no echo files found for {0:?}")]
    NoEchoFiles(PathBuf),
}

/// Inputs for one tedana run. `echo_times[i]` is the echo time of `echo_files[i]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunData {
    pub echo_files: Vec<PathBuf>,
    pub mask: Option<PathBuf>,
    pub confounds: Option<PathBuf>,
    #[serde(rename = "EchoTimes")]
    pub echo_times: Vec<f64>,
}

fn nifti() -> EntityFilter {
    EntityFilter::one_of(NIFTI_EXTENSIONS)
}

pub fn default_query(kind: QueryKind) -> Query {
    match kind {
        QueryKind::EchoFiles => Query::new()
            .with("echo", EntityFilter::Any)
            .with("extension", nifti()),
        QueryKind::Mask => Query::new()
            .with("echo", EntityFilter::Absent)
            .with("desc", "brain")
            .with("suffix", "mask")
            .with("extension", nifti()),
        QueryKind::Confounds => Query::new()
            .with("echo", EntityFilter::Absent)
            .with("desc", "confounds")
            .with("suffix", "timeseries")
            .with("extension", ".tsv"),
    }
}

/// Query selecting the first echo of every eligible run.
///
/// The user's `echo_files` override applies here too, except that `echo`
/// always stays pinned to the first echo.
pub fn first_echo_query(ctx: &Context) -> Query {
    let base = Query::new()
        .with(
            "space",
            EntityFilter::OneOf(vec![EntityFilter::value("boldref"), EntityFilter::Absent]),
        )
        .with("suffix", "bold")
        .with("extension", nifti());
    let mut query = ctx.filters.apply(QueryKind::EchoFiles, base);
    query.set("echo", "1");
    let execution = &ctx.settings.execution;
    if !execution.participant_label.is_empty() {
        query.set(
            "subject",
            EntityFilter::one_of(execution.participant_label.iter().cloned()),
        );
    }
    if let Some(task) = &execution.task_id {
        query.set("task", task.as_str());
    }
    query
}

pub fn collect_first_echoes(ctx: &Context) -> Vec<PathBuf> {
    ctx.layout
        .get(&first_echo_query(ctx))
        .into_iter()
        .map(|file| file.path().to_path_buf())
        .collect()
}

pub fn collect_run_data(ctx: &Context, first_echo: &Path) -> Result<RunData, CollectError> {
    let layout = &ctx.layout;
    let reference = layout.get_file(first_echo)?;

    let echo_query = ctx
        .filters
        .apply(QueryKind::EchoFiles, default_query(QueryKind::EchoFiles));
    let mut echoes = layout.get_nearest(
        reference.path(),
        &echo_query,
        NearestOptions::same_acquisition(),
    )?;
    if echoes.is_empty() {
        return Err(CollectError::NoEchoFiles(first_echo.to_path_buf()));
    }
    echoes.sort_by_key(|file| {
        file.entity("echo")
            .and_then(|echo| echo.parse::<u32>().ok())
            .unwrap_or(u32::MAX)
    });
    let echo_files: Vec<PathBuf> = echoes.iter().map(|f| f.path().to_path_buf()).collect();

    let nearest = |kind: QueryKind| -> Result<Option<PathBuf>, CollectError> {
        let query = ctx.filters.apply(kind, default_query(kind));
        let found = layout.get_nearest(reference.path(), &query, NearestOptions::strict())?;
        Ok(found.first().map(|file| file.path().to_path_buf()))
    };
    let mask = nearest(QueryKind::Mask)?;
    let confounds = nearest(QueryKind::Confounds)?;

    let echo_times = echo_files
        .iter()
        .map(|file| layout.get_echo_time(file))
        .collect::<Result<Vec<f64>, LayoutError>>()?;

    let run_data = RunData {
        echo_files,
        mask,
        confounds,
        echo_times,
    };
    match serde_yaml::to_string(&run_data) {
        Ok(dump) => info!(
            target: WORKFLOW,
            "Collected run data for {}:\n{}",
            first_echo.display(),
            dump
        ),
        Err(err) => warn!(target: WORKFLOW, "could not render run data: {err}"),
    }
    Ok(run_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionSettings, Settings};
    use crate::filters::FilterOverrides;
    use fmripost_bids::BidsLayout;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    fn write(root: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    /// Two-echo run with a brain mask and no confounds.
    fn dataset() -> TempDir {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(root, "dataset_description.json", r#"{"Name": "t", "BIDSVersion": "1.9.0"}"#);
        write(root, "sub-01/func/sub-01_task-rest_echo-1_bold.nii.gz", "");
        write(root, "sub-01/func/sub-01_task-rest_echo-2_bold.nii.gz", "");
        write(root, "sub-01/func/sub-01_task-rest_echo-1_bold.json", r#"{"EchoTime": 0.015}"#);
        write(root, "sub-01/func/sub-01_task-rest_echo-2_bold.json", r#"{"EchoTime": 0.039}"#);
        write(root, "sub-01/func/sub-01_task-rest_desc-brain_mask.nii.gz", "");
        write(root, "sub-02/func/sub-02_task-rest_echo-1_bold.nii.gz", "");
        dir
    }

    fn context(root: &Path, participants: &[&str], filters: FilterOverrides) -> Context {
        let mut execution = ExecutionSettings::new(root.to_path_buf(), root.join("out"));
        execution.participant_label = participants.iter().map(|p| p.to_string()).collect();
        Context {
            settings: Settings {
                execution,
                tedana: Default::default(),
            },
            layout: BidsLayout::new(root).unwrap(),
            filters,
        }
    }

    #[test]
    fn first_echoes_respect_participant_label() {
        let dir = dataset();
        let ctx = context(dir.path(), &["01"], FilterOverrides::default());
        let firsts = collect_first_echoes(&ctx);
        assert_eq!(
            firsts,
            vec![dir.path().join("sub-01/func/sub-01_task-rest_echo-1_bold.nii.gz")]
        );
    }

    #[test]
    fn first_echoes_skip_standard_spaces() {
        let dir = dataset();
        let root = dir.path();
        write(root, "sub-01/func/sub-01_task-rest_space-boldref_echo-1_bold.nii.gz", "");
        write(root, "sub-01/func/sub-01_task-rest_space-MNI152NLin6Asym_echo-1_bold.nii.gz", "");
        let ctx = context(root, &["01"], FilterOverrides::default());
        let firsts = collect_first_echoes(&ctx);
        assert_eq!(
            firsts,
            vec![
                root.join("sub-01/func/sub-01_task-rest_echo-1_bold.nii.gz"),
                root.join("sub-01/func/sub-01_task-rest_space-boldref_echo-1_bold.nii.gz"),
            ]
        );
    }

    #[test]
    fn first_echo_query_keeps_echo_pinned() {
        let dir = dataset();
        let mut filters = FilterOverrides::default();
        filters.insert(
            QueryKind::EchoFiles,
            Query::new().with("echo", EntityFilter::Any).with("task", "rest"),
        );
        let ctx = context(dir.path(), &[], filters);
        let query = first_echo_query(&ctx);
        assert_eq!(query.get("echo"), Some(&EntityFilter::value("1")));
        assert_eq!(query.get("task"), Some(&EntityFilter::value("rest")));
        assert_eq!(collect_first_echoes(&ctx).len(), 2);
    }

    #[test]
    fn collects_two_echo_run_without_confounds() {
        let dir = dataset();
        let ctx = context(dir.path(), &["01"], FilterOverrides::default());
        let first = dir.path().join("sub-01/func/sub-01_task-rest_echo-1_bold.nii.gz");
        let run = collect_run_data(&ctx, &first).unwrap();
        assert_eq!(
            run.echo_files,
            vec![
                first.clone(),
                dir.path().join("sub-01/func/sub-01_task-rest_echo-2_bold.nii.gz"),
            ]
        );
        assert_eq!(run.echo_times, vec![0.015, 0.039]);
        assert_eq!(
            run.mask,
            Some(dir.path().join("sub-01/func/sub-01_task-rest_desc-brain_mask.nii.gz"))
        );
        assert_eq!(run.confounds, None);

        let again = collect_run_data(&ctx, &first).unwrap();
        assert_eq!(run, again);
    }

    #[test]
    fn echoes_stay_within_space_and_run() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for space in ["", "space-boldref_"] {
            for run in [1, 2] {
                for (echo, te) in [(1, 0.012), (2, 0.035)] {
                    let stem =
                        format!("sub-01/func/sub-01_task-rest_run-{run}_{space}echo-{echo}_bold");
                    write(root, &format!("{stem}.nii.gz"), "");
                    write(root, &format!("{stem}.json"), &format!(r#"{{"EchoTime": {te}}}"#));
                }
            }
        }
        let ctx = context(root, &[], FilterOverrides::default());
        assert_eq!(collect_first_echoes(&ctx).len(), 4);

        let first = root.join("sub-01/func/sub-01_task-rest_run-1_echo-1_bold.nii.gz");
        let run = collect_run_data(&ctx, &first).unwrap();
        assert_eq!(
            run.echo_files,
            vec![
                first.clone(),
                root.join("sub-01/func/sub-01_task-rest_run-1_echo-2_bold.nii.gz"),
            ]
        );
        assert_eq!(run.echo_times, vec![0.012, 0.035]);

        let spaced = root.join("sub-01/func/sub-01_task-rest_run-2_space-boldref_echo-1_bold.nii.gz");
        let run = collect_run_data(&ctx, &spaced).unwrap();
        assert_eq!(
            run.echo_files,
            vec![
                spaced.clone(),
                root.join("sub-01/func/sub-01_task-rest_run-2_space-boldref_echo-2_bold.nii.gz"),
            ]
        );
    }

    #[test]
    fn echo_times_follow_echo_order() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for (echo, te) in [(3, 0.06), (1, 0.012), (2, 0.035)] {
            let stem = format!("sub-01/func/sub-01_task-rest_echo-{echo}_bold");
            write(root, &format!("{stem}.nii.gz"), "");
            write(root, &format!("{stem}.json"), &format!(r#"{{"EchoTime": {te}}}"#));
        }
        let ctx = context(root, &[], FilterOverrides::default());
        let first = root.join("sub-01/func/sub-01_task-rest_echo-1_bold.nii.gz");
        let run = collect_run_data(&ctx, &first).unwrap();
        assert_eq!(run.echo_files.len(), run.echo_times.len());
        assert_eq!(run.echo_times, vec![0.012, 0.035, 0.06]);
        for (file, te) in run.echo_files.iter().zip(&run.echo_times) {
            assert_eq!(ctx.layout.get_echo_time(file).unwrap(), *te);
        }
    }

    #[test]
    fn mask_override_replaces_only_description() {
        let dir = dataset();
        write(
            dir.path(),
            "sub-01/func/sub-01_task-rest_desc-custom_mask.nii.gz",
            "",
        );
        let mut filters = FilterOverrides::default();
        filters.insert(QueryKind::Mask, Query::new().with("desc", "custom"));
        let ctx = context(dir.path(), &["01"], filters);
        let query = ctx.filters.apply(QueryKind::Mask, default_query(QueryKind::Mask));
        assert_eq!(query.get("desc"), Some(&EntityFilter::value("custom")));
        assert_eq!(query.get("echo"), Some(&EntityFilter::Absent));
        assert_eq!(query.get("suffix"), Some(&EntityFilter::value("mask")));

        let first = dir.path().join("sub-01/func/sub-01_task-rest_echo-1_bold.nii.gz");
        let run = collect_run_data(&ctx, &first).unwrap();
        assert_eq!(
            run.mask,
            Some(dir.path().join("sub-01/func/sub-01_task-rest_desc-custom_mask.nii.gz"))
        );
    }

    #[test]
    fn confounds_are_found_next_to_preprocessed_echoes() {
        let dir = dataset();
        let confounds = write(
            dir.path(),
            "sub-01/func/sub-01_task-rest_desc-confounds_timeseries.tsv",
            "a\tb\n",
        );
        let ctx = context(dir.path(), &["01"], FilterOverrides::default());
        let first = dir.path().join("sub-01/func/sub-01_task-rest_echo-1_bold.nii.gz");
        let run = collect_run_data(&ctx, &first).unwrap();
        assert_eq!(run.confounds, Some(confounds));
    }

    #[test]
    fn unknown_reference_is_a_lookup_failure() {
        let dir = dataset();
        let ctx = context(dir.path(), &[], FilterOverrides::default());
        let missing = dir.path().join("sub-09/func/sub-09_task-rest_echo-1_bold.nii.gz");
        let err = collect_run_data(&ctx, &missing).unwrap_err();
        assert!(matches!(
            err,
            CollectError::Layout(LayoutError::FileNotIndexed(_))
        ));
    }

    #[test]
    fn missing_echo_time_fails_the_run() {
        let dir = dataset();
        let ctx = context(dir.path(), &["02"], FilterOverrides::default());
        let first = dir.path().join("sub-02/func/sub-02_task-rest_echo-1_bold.nii.gz");
        let err = collect_run_data(&ctx, &first).unwrap_err();
        assert!(matches!(
            err,
            CollectError::Layout(LayoutError::MissingMetadata { .. })
        ));
    }
}
