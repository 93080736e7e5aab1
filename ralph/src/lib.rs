//! Ralph: a Ralph-Wiggum-loop orchestrator for concurrent AI coding
//! workflows, each one isolated in its own git worktree.
//!
//! # Core concepts
//!
//! - **Fresh context every iteration**: each iteration opens a new AI
//!   session; cross-iteration state lives in `LoopState` and in git, not in
//!   conversation history.
//! - **Worktree isolation**: every loop gets its own `.ralph-worktrees/<id>`
//!   working tree off a branch under `config.git.branch-prefix`.
//! - **One typed event bus**: every status change, log line, and tool call
//!   is published as a `LoopEvent` that an SSE projection or a CLI `logs
//!   --follow` can subscribe to.
//!
//! # Modules
//!
//! - [`domain`] — the `Loop`/`LoopConfig`/`LoopState` entity and its value types
//! - [`state_machine`] — the authoritative `LoopStatus` transition table
//! - [`events`] — the process-wide `EventBus` and its SSE framing
//! - [`git`] — worktree lifecycle and branch-guarded git operations
//! - [`command`] — the shell/filesystem seam git and the planning folder run through
//! - [`agent`] — the AI backend trait and the Anthropic implementation
//! - [`stop_pattern`] — the user-configurable completion-marker detector
//! - [`loop_engine`] — the per-loop iteration driver and the manager owning all of them
//! - [`persistence`] — snapshotting `Loop` state through `ralph_store`
//! - [`config`] — ambient configuration and its fallback chain
//! - [`cli`] — the command-line surface

pub mod agent;
pub mod cli;
pub mod command;
pub mod config;
pub mod domain;
pub mod events;
pub mod git;
pub mod loop_engine;
pub mod persistence;
pub mod state_machine;
pub mod stop_pattern;

pub use agent::{AgentBackend, AgentEvent, AnthropicBackend, MockAgentBackend};
pub use config::Config;
pub use domain::{Loop, LoopConfig, LoopState};
pub use events::{EventBus, LoopEvent, LoopEventKind};
pub use git::GitService;
pub use loop_engine::{LoopEngine, LoopEngineError, LoopManager, LoopManagerConfig, LoopManagerError};
pub use persistence::{LoopSnapshot, Persistence};
pub use state_machine::LoopStatus;
