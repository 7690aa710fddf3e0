//! Tracing setup for the dispatchq binary.
//!
//! The log target follows the CLI convention: `0`/`off` disables output,
//! `1`/`stdout` and `2`/`stderr` select a stream, anything else is treated
//! as a file path opened in append mode. Filtering honors `DISPATCHQ_LOG`
//! (then `RUST_LOG`), falling back to `info`, or `debug` with `--verbose`.

use anyhow::Result;
use std::fs::OpenOptions;
use tracing_subscriber::EnvFilter;

pub fn init(target: &str, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("DISPATCHQ_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    match target {
        "0" | "off" => {
            // No logging
        }
        "1" | "stdout" => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stdout)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        "2" | "stderr" => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        filename => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)?;
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file)
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}
