//! CLI definitions for the dispatchq binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Task scheduling and queue engine for multi-phase agent workflows.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the queue engine and HTTP API (default if no subcommand given)
    Serve,

    /// Print queue and executor status from an existing database
    Status,

    /// Parse and validate the configuration, then print the effective tuning
    CheckConfig,
}
