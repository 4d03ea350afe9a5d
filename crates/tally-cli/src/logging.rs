//! Process-wide tracing setup.

use std::io::IsTerminal;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CRATES: [&str; 6] = [
    "tally_cli",
    "tally_core",
    "tally_storage",
    "tally_adapters",
    "tally_sync",
    "tally_web",
];

/// Installs the global subscriber. `RUST_LOG` wins over `-v` / `--quiet`.
/// With `log_file`, every event is also written there as JSON lines.
pub fn init_logging(verbosity: u8, quiet: bool, log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter(verbosity, quiet)))?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity > 0)
        .with_ansi(std::io::stderr().is_terminal());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer);

    if let Some(path) = log_file {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        let file_layer = fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .json();
        tracing::subscriber::set_global_default(subscriber.with(file_layer))?;
    } else {
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

fn default_filter(verbosity: u8, quiet: bool) -> String {
    if quiet {
        return "error".to_string();
    }
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut directives: Vec<String> = CRATES.iter().map(|c| format!("{c}={level}")).collect();
    directives.insert(0, "warn".to_string());
    if verbosity >= 2 {
        directives.push("sqlx=debug".to_string());
        directives.push("reqwest=debug".to_string());
    }
    directives.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_overrides_verbosity() {
        assert_eq!(default_filter(3, true), "error");
    }

    #[test]
    fn verbosity_raises_our_crates_only_until_very_verbose() {
        let normal = default_filter(0, false);
        assert!(normal.starts_with("warn,"));
        assert!(normal.contains("tally_storage=info"));
        assert!(!normal.contains("sqlx"));

        let loud = default_filter(2, false);
        assert!(loud.contains("tally_sync=trace"));
        assert!(loud.contains("sqlx=debug"));
    }

    #[test]
    fn every_filter_parses() {
        for verbosity in 0..4 {
            assert!(EnvFilter::try_new(default_filter(verbosity, false)).is_ok());
        }
    }
}
