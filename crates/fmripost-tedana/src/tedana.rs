use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::collect::RunData;
use crate::logging::WORKFLOW;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitType {
    /// Linear model fit to the log of the data.
    #[default]
    Loglin,
    /// Monoexponential model fit to the raw data.
    Curvefit,
}

impl FitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FitType::Loglin => "loglin",
            FitType::Curvefit => "curvefit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombMode {
    /// T2*-weighted combination (Posse 1999).
    #[default]
    T2s,
}

impl CombMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CombMode::T2s => "t2s",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GsControl {
    Mir,
    Gsr,
}

impl GsControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            GsControl::Mir => "mir",
            GsControl::Gsr => "gsr",
        }
    }
}

/// Component selection for TEDPCA.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TedPca {
    #[default]
    Aic,
    Kic,
    Mdl,
    Kundu,
    KunduStabilize,
    /// Keep components up to this fraction of cumulative variance.
    VarianceExplained(f64),
    /// Keep exactly this many components.
    Components(u32),
}

impl FromStr for TedPca {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "aic" => return Ok(TedPca::Aic),
            "kic" => return Ok(TedPca::Kic),
            "mdl" => return Ok(TedPca::Mdl),
            "kundu" => return Ok(TedPca::Kundu),
            "kundu-stabilize" => return Ok(TedPca::KunduStabilize),
            _ => {}
        }
        let value: f64 = raw.trim().parse().map_err(|_| {
            "argument to tedpca must be either a number, or one of: mdl, aic, kic, kundu, kundu-stabilize"
                .to_string()
        })?;
        if value.fract() != 0.0 {
            if !(0.0..=1.0).contains(&value) {
                return Err("floating-point argument to tedpca must be between 0 and 1".to_string());
            }
            Ok(TedPca::VarianceExplained(value))
        } else if value < 1.0 || value > f64::from(u32::MAX) {
            Err("integer argument to tedpca must be positive".to_string())
        } else {
            Ok(TedPca::Components(value as u32))
        }
    }
}

impl fmt::Display for TedPca {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TedPca::Aic => f.write_str("aic"),
            TedPca::Kic => f.write_str("kic"),
            TedPca::Mdl => f.write_str("mdl"),
            TedPca::Kundu => f.write_str("kundu"),
            TedPca::KunduStabilize => f.write_str("kundu-stabilize"),
            TedPca::VarianceExplained(v) => write!(f, "{v}"),
            TedPca::Components(n) => write!(f, "{n}"),
        }
    }
}

impl TryFrom<String> for TedPca {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TedPca> for String {
    fn from(value: TedPca) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TedanaOptions {
    pub executable: PathBuf,
    pub fittype: FitType,
    pub combmode: CombMode,
    pub tedpca: TedPca,
    pub tree: String,
    pub maxit: u32,
    pub maxrestart: u32,
    pub tedort: bool,
    pub gscontrol: Vec<GsControl>,
    pub png_cmap: String,
    pub low_mem: bool,
    pub seed: Option<u32>,
    pub omp_nthreads: Option<usize>,
}

impl Default for TedanaOptions {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("tedana"),
            fittype: FitType::default(),
            combmode: CombMode::default(),
            tedpca: TedPca::default(),
            tree: "kundu".to_string(),
            maxit: 500,
            maxrestart: 10,
            tedort: false,
            gscontrol: Vec::new(),
            png_cmap: "coolwarm".to_string(),
            low_mem: false,
            seed: None,
            omp_nthreads: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum TedanaError {
    #[error("failed to launch {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tedana exited with {status}:\n{stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

/// A fully resolved tedana command line for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TedanaInvocation {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    out_dir: PathBuf,
}

impl TedanaInvocation {
    pub fn new(run: &RunData, prefix: &str, out_dir: &Path, opts: &TedanaOptions) -> Self {
        let mut args: Vec<OsString> = Vec::new();
        args.push("-d".into());
        args.extend(run.echo_files.iter().map(|p| p.as_os_str().to_owned()));
        args.push("-e".into());
        args.extend(run.echo_times.iter().map(|te| seconds_to_ms(*te).to_string().into()));
        args.push("--out-dir".into());
        args.push(out_dir.as_os_str().to_owned());
        args.push("--prefix".into());
        args.push(prefix.into());
        args.push("--convention".into());
        args.push("bids".into());
        if let Some(mask) = &run.mask {
            args.push("--mask".into());
            args.push(mask.as_os_str().to_owned());
        }
        for (flag, value) in [
            ("--fittype", opts.fittype.as_str().to_string()),
            ("--combmode", opts.combmode.as_str().to_string()),
            ("--tedpca", opts.tedpca.to_string()),
            ("--tree", opts.tree.clone()),
            ("--maxit", opts.maxit.to_string()),
            ("--maxrestart", opts.maxrestart.to_string()),
            ("--png-cmap", opts.png_cmap.clone()),
        ] {
            args.push(flag.into());
            args.push(value.into());
        }
        if opts.tedort {
            args.push("--tedort".into());
        }
        if !opts.gscontrol.is_empty() {
            args.push("--gscontrol".into());
            args.extend(opts.gscontrol.iter().map(|g| g.as_str().into()));
        }
        if opts.low_mem {
            args.push("--lowmem".into());
        }
        if let Some(seed) = opts.seed {
            args.push("--seed".into());
            args.push(seed.to_string().into());
        }

        let envs = opts
            .omp_nthreads
            .map(|n| vec![("OMP_NUM_THREADS".to_string(), n.to_string())])
            .unwrap_or_default();

        Self {
            program: opts.executable.clone(),
            args,
            envs,
            out_dir: out_dir.to_path_buf(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    pub fn execute(&self) -> Result<(), TedanaError> {
        debug!(
            target: WORKFLOW,
            program = %self.program().display(),
            out_dir = %self.out_dir().display(),
            "running tedana with {:?}",
            self.args()
        );
        let output = self
            .command()
            .output()
            .map_err(|source| TedanaError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        debug!(target: WORKFLOW, "{}", String::from_utf8_lossy(&output.stdout));
        if !output.status.success() {
            return Err(TedanaError::Failed {
                status: output.status,
                stderr: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES),
            });
        }
        Ok(())
    }
}

/// BIDS stores echo times in seconds; tedana expects milliseconds.
fn seconds_to_ms(seconds: f64) -> f64 {
    (seconds * 1000.0 * 1e6).round() / 1e6
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
