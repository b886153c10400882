// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Cryo CLI
//!
//! Command-line interface for checkpointing and restoring processes with CRIU.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod metrics;

/// Cryo - checkpoint/restore orchestrator on top of CRIU
#[derive(Parser)]
#[command(name = "cryo")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path. Built-in defaults are used when omitted.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Serve Prometheus metrics on this port while the command runs
    #[arg(long)]
    pub metrics_port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Checkpoint a running process
    Dump(DumpArgs),

    /// Restore a process from a checkpoint
    Restore(RestoreArgs),

    /// Start a managed process
    Run(RunArgs),

    /// Show the CRIU version and supported features
    Check,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: PathBuf,
    },
}

#[derive(Args)]
pub struct DumpArgs {
    /// PID of the process to checkpoint
    pub pid: u32,

    /// Directory to write the checkpoint into
    #[arg(short, long)]
    pub dir: Option<String>,

    /// Name of the checkpoint inside the directory
    #[arg(short, long)]
    pub name: Option<String>,

    /// Compression: none, tar, gzip, zlib or zstd
    #[arg(long)]
    pub compression: Option<String>,

    /// Number of parallel image streams; 0 disables streaming
    #[arg(long, default_value_t = 0)]
    pub streams: i32,

    /// Keep the process running after the dump
    #[arg(long)]
    pub leave_running: bool,

    /// Take an incremental memory snapshot instead of a full dump
    #[arg(long)]
    pub pre_dump: bool,

    /// Images of an earlier pre-dump to build on
    #[arg(long)]
    pub parent: Option<String>,

    /// Checkpoint established TCP connections
    #[arg(long)]
    pub tcp_established: bool,
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Checkpoint directory or tarball
    pub path: String,

    /// File receiving the restored process's output
    #[arg(short, long)]
    pub log: Option<PathBuf>,

    /// Write the restored PID to this file
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Number of image streams of a streamed checkpoint
    #[arg(long, default_value_t = 0)]
    pub streams: i32,

    /// Job the restored process belongs to, needed for GPU restores
    #[arg(long)]
    pub jid: Option<String>,

    /// Stay attached until the restored process exits
    #[arg(short, long)]
    pub wait: bool,
}

#[derive(Args)]
pub struct RunArgs {
    /// Program to run
    pub path: PathBuf,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Job ID; generated when omitted
    #[arg(long)]
    pub jid: Option<String>,

    /// Environment entries as KEY=VALUE. Replaces the inherited environment.
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Working directory of the program
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// File receiving the program's output
    #[arg(short, long)]
    pub log: Option<PathBuf>,

    /// Attach a GPU controller to the job
    #[arg(long)]
    pub gpu: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(port) = cli.metrics_port {
        metrics::start_metrics_server(port);
    }

    match cli.command {
        Commands::Dump(args) => commands::dump::execute(cli.config.as_deref(), args).await,
        Commands::Restore(args) => commands::restore::execute(cli.config.as_deref(), args).await,
        Commands::Run(args) => commands::run::execute(cli.config.as_deref(), args).await,
        Commands::Check => commands::check::execute(cli.config.as_deref()).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
