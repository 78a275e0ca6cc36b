//! Tracing subscriber setup for the proxy and its workers.
//!
//! `RUST_LOG` overrides the default directives.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// Builds the filter: `RUST_LOG` first, then our crates at info (debug
/// when verbose).
pub fn env_filter(verbose: bool) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    let level = if verbose { "debug" } else { "info" };
    Ok(EnvFilter::from_default_env()
        .add_directive(format!("logproxy={level}").parse()?)
        .add_directive(format!("logproxyd={level}").parse()?)
        .add_directive(format!("logproxy_core={level}").parse()?)
        .add_directive(format!("logproxy_protocol={level}").parse()?))
}

/// Logs to stdout. Used by the proxy process.
pub fn init_stdout(verbose: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose)?)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

/// Logs to `path`, creating parent directories. Used by workers.
pub fn init_file(path: &Path, verbose: bool) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose)?)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_levels() {
        let quiet = env_filter(false).unwrap().to_string();
        assert!(quiet.contains("logproxyd=info"));

        let verbose = env_filter(true).unwrap().to_string();
        assert!(verbose.contains("logproxyd=debug"));
    }
}
