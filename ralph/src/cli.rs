//! Command-line surface (§0.4): the CLI is a thin dispatcher over
//! `LoopManager` — every subcommand maps to one manager call, with output
//! formatting (and `colored` status highlighting) the only logic that
//! lives here.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Ralph - Ralph Wiggum loop orchestrator
#[derive(Parser)]
#[command(
    name = "ralph",
    about = "Runs AI coding loops isolated in git worktrees",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create and start a new loop
    Start {
        /// Display name for the loop
        name: String,

        /// The task prompt given to the agent
        prompt: String,

        /// Repository directory the loop operates in (defaults to cwd)
        #[arg(short, long)]
        directory: Option<PathBuf>,

        /// Maximum iterations (0 or omitted means unbounded)
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Start in plan mode instead of running the task directly
        #[arg(long)]
        plan: bool,

        /// Run in chat mode instead of the default loop mode
        #[arg(long)]
        chat: bool,
    },

    /// Stop a running loop
    Stop {
        loop_id: String,

        /// Reason recorded on the `loop.stopped` event
        #[arg(long, default_value = "stopped by user")]
        reason: String,
    },

    /// Send a follow-up prompt or model override into a loop
    Inject {
        loop_id: String,

        /// New message to inject as the next iteration's user input
        #[arg(long)]
        message: Option<String>,

        /// Override the provider id (requires --model-id)
        #[arg(long, requires = "model_id")]
        provider_id: Option<String>,

        /// Override the model id (requires --provider-id)
        #[arg(long, requires = "provider_id")]
        model_id: Option<String>,
    },

    /// Accept a loop's plan and resume execution out of plan mode
    AcceptPlan { loop_id: String },

    /// Sync with the base branch and push the loop's branch
    Push { loop_id: String },

    /// Delete a loop
    Delete { loop_id: String },

    /// List every known loop
    List,

    /// Show one loop's full state
    Show { loop_id: String },

    /// Stream a loop's log entries
    Logs {
        loop_id: String,

        /// Keep streaming new entries as they arrive
        #[arg(short, long)]
        follow: bool,
    },
}
