use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, ValueEnum};

use crate::tedana::{CombMode, FitType, GsControl, TedPca};

#[derive(Parser, Debug)]
#[command(
    name = "fmripost-tedana",
    version,
    about = "fMRIPost-tedana: fMRI POSTprocessing tedana workflow"
)]
pub struct Cli {
    /// The root folder of a BIDS valid dataset (sub-XXXXX folders should be
    /// found at the top level in this folder).
    pub bids_dir: PathBuf,
    /// The output path for the outcomes of postprocessing and visual reports.
    pub output_dir: PathBuf,
    /// Processing stage to be run, only "participant" is supported.
    #[arg(value_enum)]
    pub analysis_level: AnalysisLevel,

    /// A space delimited list of participant identifiers or a single
    /// identifier (the sub- prefix can be removed).
    #[arg(
        long = "participant-label",
        visible_alias = "participant_label",
        num_args = 1..,
        value_parser = parse_participant_label
    )]
    pub participant_label: Vec<String>,
    /// Select a specific task to be processed.
    #[arg(short = 't', long = "task-id")]
    pub task_id: Option<String>,
    /// A JSON file describing custom BIDS input filters.
    #[arg(long = "bids-filter-file", value_name = "FILE")]
    pub bids_filter_file: Option<PathBuf>,
    /// Search PATH(s) for pre-computed derivatives.
    #[arg(short = 'd', long, value_name = "PATH", num_args = 0..)]
    pub derivatives: Vec<PathBuf>,
    /// Assume the input dataset is BIDS compliant and skip the validation.
    #[arg(
        long = "skip-bids-validation",
        visible_alias = "skip_bids_validation",
        action = ArgAction::SetTrue
    )]
    pub skip_bids_validation: bool,

    /// Maximum number of runs processed concurrently.
    #[arg(long, visible_aliases = ["nthreads", "n-cpus", "n_cpus"], value_parser = parse_positive)]
    pub nprocs: Option<usize>,
    /// Maximum number of threads per tedana process.
    #[arg(long = "omp-nthreads", value_parser = parse_positive)]
    pub omp_nthreads: Option<usize>,
    /// Attempt to reduce memory usage.
    #[arg(long = "low-mem", action = ArgAction::SetTrue)]
    pub low_mem: bool,
    /// Initialize the random seed for the workflow.
    #[arg(long = "random-seed")]
    pub random_seed: Option<u32>,

    #[command(flatten)]
    pub tedana: TedanaArgs,

    /// Increases log verbosity for each occurrence, debug level is -vv.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
    /// Path where intermediate results should be stored.
    #[arg(short = 'w', long = "work-dir")]
    pub work_dir: Option<PathBuf>,
    /// Clears working directory of contents.
    #[arg(long = "clean-workdir", action = ArgAction::SetTrue)]
    pub clean_workdir: bool,
    /// Use pre-generated configuration file. Values in file will be
    /// overridden by command-line arguments.
    #[arg(long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,
    /// Force stopping on first crash.
    #[arg(long = "stop-on-first-crash", action = ArgAction::SetTrue)]
    pub stop_on_first_crash: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum AnalysisLevel {
    Participant,
}

#[derive(Args, Debug, Default)]
pub struct TedanaArgs {
    /// Desired T2*/S0 fitting method.
    #[arg(long, value_enum)]
    pub fittype: Option<FitType>,
    /// Combination scheme for TEs.
    #[arg(long, value_enum)]
    pub combmode: Option<CombMode>,
    /// Method with which to select components in TEDPCA: mdl, kic, aic,
    /// kundu, kundu-stabilize, a variance fraction in (0, 1) or a component
    /// count.
    #[arg(long, value_parser = parse_tedpca)]
    pub tedpca: Option<TedPca>,
    /// Decision tree to use: a packaged tree (kundu, minimal) or a JSON file.
    #[arg(long)]
    pub tree: Option<String>,
    /// Maximum number of iterations for ICA.
    #[arg(long, value_name = "INT")]
    pub maxit: Option<u32>,
    /// Maximum number of attempts for ICA.
    #[arg(long, value_name = "INT")]
    pub maxrestart: Option<u32>,
    /// Orthogonalize rejected components w.r.t. accepted components prior to denoising.
    #[arg(long, action = ArgAction::SetTrue)]
    pub tedort: bool,
    /// Perform additional denoising to remove spatially diffuse noise.
    #[arg(long, value_enum, num_args = 1..)]
    pub gscontrol: Vec<GsControl>,
    /// Colormap for figures.
    #[arg(long = "png-cmap")]
    pub png_cmap: Option<String>,
    /// tedana executable to run.
    #[arg(long = "tedana-bin", value_name = "PATH")]
    pub tedana_bin: Option<PathBuf>,
}

fn parse_participant_label(raw: &str) -> Result<String, String> {
    Ok(raw.strip_prefix("sub-").unwrap_or(raw).to_string())
}

fn parse_positive(raw: &str) -> Result<usize, String> {
    let value: usize = raw.parse().map_err(|_| format!("invalid integer: {raw}"))?;
    if value < 1 {
        return Err("Argument can't be less than one.".to_string());
    }
    Ok(value)
}

fn parse_tedpca(raw: &str) -> Result<TedPca, String> {
    raw.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Result<Cli, clap::Error> {
        let mut args = vec!["fmripost-tedana", "/data/bids", "/data/out", "participant"];
        args.extend_from_slice(extra);
        Cli::try_parse_from(args)
    }

    #[test]
    fn strips_sub_prefix_from_labels() {
        let cli = parse(&["--participant-label", "sub-01", "02"]).unwrap();
        assert_eq!(cli.participant_label, vec!["01", "02"]);
    }

    #[test]
    fn rejects_unknown_analysis_level() {
        let err = Cli::try_parse_from(["fmripost-tedana", "/b", "/o", "group"]);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_zero_threads() {
        assert!(parse(&["--nprocs", "0"]).is_err());
        assert_eq!(parse(&["--nthreads", "4"]).unwrap().nprocs, Some(4));
    }

    #[test]
    fn parses_tedana_options() {
        let cli = parse(&[
            "--fittype",
            "curvefit",
            "--tedpca",
            "0.9",
            "--gscontrol",
            "mir",
            "gsr",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.tedana.fittype, Some(FitType::Curvefit));
        assert_eq!(cli.tedana.tedpca, Some(TedPca::VarianceExplained(0.9)));
        assert_eq!(cli.tedana.gscontrol, vec![GsControl::Mir, GsControl::Gsr]);
        assert_eq!(cli.verbose, 2);
        assert!(parse(&["--tedpca", "banana"]).is_err());
    }

    #[test]
    fn random_seed_fits_tedana_integer() {
        assert_eq!(
            parse(&["--random-seed", "4294967295"]).unwrap().random_seed,
            Some(u32::MAX)
        );
        assert!(parse(&["--random-seed", "18446744073709551615"]).is_err());
        assert!(parse(&["--random-seed", "-1"]).is_err());
    }
}
