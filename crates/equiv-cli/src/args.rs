use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "equiv",
    version,
    about = "Characterization testing for refactors — golden capture, comparison, and verdict reports"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Full pipeline: capture, compare, emit, execute, report
    Run(RunArgs),
    /// Golden capture only; writes golden_snapshot.json
    Capture(CaptureArgs),
    /// Compare a refactored tree against a saved golden snapshot
    Compare(CompareArgs),
    /// Verify that a source tree builds for one ecosystem
    CheckBuild(CheckBuildArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run configuration (YAML)
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Artifact root directory (default: ./artifacts)
    #[arg(long)]
    pub artifacts: Option<PathBuf>,

    /// Override the refactored tree from the config
    #[arg(long)]
    pub refactored: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct CaptureArgs {
    /// Run configuration (YAML)
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Artifact root directory (default: ./artifacts)
    #[arg(long)]
    pub artifacts: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct CompareArgs {
    /// Run configuration (YAML); refactored_repo_dir must be set
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Saved golden snapshot to compare against
    #[arg(long)]
    pub snapshot: PathBuf,

    /// Artifact root directory (default: ./artifacts)
    #[arg(long)]
    pub artifacts: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct CheckBuildArgs {
    /// Source tree to check
    #[arg(long)]
    pub repo: PathBuf,

    /// Ecosystem identifier (python, rust, go)
    #[arg(long)]
    pub ecosystem: String,

    /// Timeout in seconds
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,
}
