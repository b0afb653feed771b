use std::env;

use tracing_subscriber::EnvFilter;

/// Target for command-line and configuration messages.
pub const CLI: &str = "cli";
/// Target for per-run workflow messages.
pub const WORKFLOW: &str = "workflow";

pub fn init(verbose_count: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose_count)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn default_directive(verbose_count: u8) -> &'static str {
    match verbose_count {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// `FMRIPOST_TEDANA_VERBOSE=1` behaves like a single `-v`.
pub fn env_verbosity() -> u8 {
    env::var("FMRIPOST_TEDANA_VERBOSE")
        .map(|value| u8::from(parse_bool(&value)))
        .unwrap_or(0)
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
