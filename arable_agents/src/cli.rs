//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Arable agent orchestration CLI
#[derive(Parser)]
#[command(name = "arable-cli")]
#[command(about = "Run agents and dependency-ordered agent workflows")]
#[command(version)]
pub struct Cli {
    /// Settings file used instead of ./arable.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List discovered agents
    Agents,
    /// Run a single task against one agent
    Run {
        /// Registered agent name
        #[arg(short, long)]
        agent: String,

        /// Task input as a JSON object
        #[arg(short, long, default_value = "{}")]
        input: String,
    },
    /// Load a workflow definition (TOML or JSON) and execute it
    Workflow {
        /// Path to the workflow file
        #[arg(short, long)]
        file: PathBuf,
    },
}
