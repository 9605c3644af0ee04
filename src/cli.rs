//! CLI surface (§10.N): `clap`-derived subcommands dispatching into the
//! daemon lifecycle, configuration loader, and Main Loop.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rasen", author, version, about = "Autonomous coding-agent orchestrator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Project directory to orchestrate. Defaults to the current directory.
    #[arg(long, global = true, default_value = ".")]
    pub project_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize a new task: runs the initializer session to produce a plan.
    Init {
        #[arg(long, short)]
        task: String,
    },

    /// Run the orchestration loop to completion.
    Run {
        #[arg(long)]
        background: bool,
        /// Skip the Coder <-> Reviewer sub-loop.
        #[arg(long)]
        skip_review: bool,
        /// Skip the Coder <-> QA sub-loop.
        #[arg(long)]
        skip_qa: bool,
    },

    /// Resume an interrupted orchestration from durable state.
    Resume {
        #[arg(long)]
        background: bool,
    },

    /// Print the current status summary.
    Status,

    /// View orchestrator logs.
    Logs {
        #[arg(long, short)]
        follow: bool,
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
    },

    /// Stop a background orchestrator.
    Stop {
        /// Send SIGKILL immediately instead of waiting for graceful shutdown.
        #[arg(long)]
        force: bool,
    },

    /// Re-initialize a task, optionally discarding existing progress.
    Reinit {
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        keep_progress: bool,
        #[arg(long)]
        force: bool,
    },

    /// Merge a completed worktree back into the main branch.
    Merge,
}
