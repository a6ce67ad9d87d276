//! Tracing subscriber initialization for the `lrag` binary.
//!
//! Diagnostics go to stderr; stdout carries command results only.
//!
//! # Priority (highest to lowest)
//!
//! 1. `LOCALRAG_LOG` env var (per-target directives, e.g. `localrag=debug,warn`)
//! 2. `RUST_LOG` env var
//! 3. CLI flags (`-v` → debug, `-q` → error)
//! 4. `[logging] level` from the config file

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Verbosity level derived from CLI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    /// Neither flag given; the config level applies.
    Normal,
    Verbose,
}

impl Verbosity {
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init(verbosity: Verbosity, config_level: &str) {
    let filter = build_env_filter(verbosity, config_level);
    let stderr_is_tty = atty::is(atty::Stream::Stderr);

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(stderr_is_tty)
        .with_target(verbosity == Verbosity::Verbose);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer.without_time().compact())
        .try_init();
}

fn build_env_filter(verbosity: Verbosity, config_level: &str) -> EnvFilter {
    if let Ok(directives) = std::env::var("LOCALRAG_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::try_new(directive_for(verbosity, config_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn directive_for(verbosity: Verbosity, config_level: &str) -> String {
    match verbosity {
        Verbosity::Verbose => "info,localrag=debug,localrag_core=debug".to_string(),
        Verbosity::Quiet => "error".to_string(),
        Verbosity::Normal => config_level.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_verbosity() {
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(true, false), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
    }

    #[test]
    fn flags_override_config_level() {
        assert_eq!(directive_for(Verbosity::Normal, "warn"), "warn");
        assert_eq!(directive_for(Verbosity::Quiet, "debug"), "error");
        assert!(directive_for(Verbosity::Verbose, "warn").contains("localrag=debug"));
    }
}
