//! Ralph - Ralph Wiggum Loop Orchestrator
//!
//! CLI entry point: wires the concrete backends (local shell, Anthropic,
//! the `ralph_store`-backed persistence) into a `LoopManager` and dispatches
//! one subcommand to it.

use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::info;

use ralph::agent::{AgentBackend, AnthropicBackend};
use ralph::cli::{Cli, Command};
use ralph::command::LocalCommandExecutor;
use ralph::config::Config;
use ralph::domain::{GitConfig, LoopConfig, Mode, ModelConfig};
use ralph::events::{EventBus, LoopEventKind};
use ralph::git::GitService;
use ralph::loop_engine::{LoopManager, LoopManagerConfig};
use ralph::persistence::Persistence;
use ralph::state_machine::LoopStatus;

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();
}

fn status_colored(status: LoopStatus) -> String {
    let text = status.as_str();
    match status {
        LoopStatus::Running | LoopStatus::Starting | LoopStatus::Waiting => text.cyan().to_string(),
        LoopStatus::Completed | LoopStatus::Merged | LoopStatus::Pushed => text.green().to_string(),
        LoopStatus::Failed => text.red().to_string(),
        LoopStatus::ResolvingConflicts | LoopStatus::MaxIterations => text.yellow().to_string(),
        LoopStatus::Stopped | LoopStatus::Deleted => text.dimmed().to_string(),
        LoopStatus::Idle | LoopStatus::Draft | LoopStatus::Planning => text.normal().to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref());
    info!(provider = %config.agent.provider_id, model = %config.agent.model_id, "ralph starting");

    let executor = Arc::new(LocalCommandExecutor::new());
    let git = Arc::new(GitService::new(executor.clone()));
    let backend: Arc<dyn AgentBackend> = Arc::new(AnthropicBackend::new(config.agent.model_id.clone()));
    let bus = Arc::new(EventBus::with_default_capacity());
    let persistence =
        Arc::new(Persistence::open(&config.persistence.store_path).context("failed to open loop store")?);

    let manager = Arc::new(LoopManager::new(
        LoopManagerConfig { max_concurrent_loops: config.concurrency.max_loops as usize },
        git,
        executor,
        backend,
        bus,
        persistence,
    ));
    manager.restore().await.context("failed to restore loops from persistence")?;

    match cli.command {
        Command::Start { name, prompt, directory, max_iterations, plan, chat } => {
            let directory = directory.map(Ok).unwrap_or_else(std::env::current_dir).context("resolving working directory")?;
            let loop_config = LoopConfig {
                id: uuid::Uuid::now_v7().to_string(),
                name,
                workspace_id: directory.display().to_string(),
                directory,
                prompt,
                model: ModelConfig {
                    provider_id: config.agent.provider_id.clone(),
                    model_id: config.agent.model_id.clone(),
                    variant: None,
                },
                stop_pattern: config.git.stop_pattern.clone(),
                git: GitConfig {
                    branch_prefix: config.git.branch_prefix.clone(),
                    commit_prefix: config.git.commit_prefix.clone(),
                    base_branch: None,
                },
                max_iterations,
                max_consecutive_errors: Some(config.concurrency.max_consecutive_errors),
                activity_timeout_seconds: config.git.activity_timeout_seconds,
                clear_planning_folder: false,
                plan_mode: plan,
                mode: if chat { Mode::Chat } else { Mode::Loop },
            };
            let loop_id = manager.create_loop(loop_config).await;
            manager.start(&loop_id).await?;
            println!("{} {}", "started".green(), loop_id);
        }
        Command::Stop { loop_id, reason } => {
            manager.stop(&loop_id, reason).await?;
            println!("{} {}", "stopped".yellow(), loop_id);
        }
        Command::Inject { loop_id, message, provider_id, model_id } => {
            let model = match (provider_id, model_id) {
                (Some(provider_id), Some(model_id)) => Some(ModelConfig { provider_id, model_id, variant: None }),
                _ => None,
            };
            manager.inject(&loop_id, message, model).await?;
            println!("{} {}", "injected".cyan(), loop_id);
        }
        Command::AcceptPlan { loop_id } => {
            manager.accept_plan(&loop_id).await?;
            println!("{} {}", "plan accepted".green(), loop_id);
        }
        Command::Push { loop_id } => {
            manager.push(&loop_id).await?;
            println!("{} {}", "sync started".cyan(), loop_id);
        }
        Command::Delete { loop_id } => {
            manager.delete(&loop_id).await?;
            println!("{} {}", "deleted".dimmed(), loop_id);
        }
        Command::List => {
            let loops = manager.list().await;
            if loops.is_empty() {
                println!("no loops");
            }
            for data in loops {
                println!("{}  {:<12}  {}", data.config.id, status_colored(data.state.status), data.config.name);
            }
        }
        Command::Show { loop_id } => {
            let data = manager.show(&loop_id).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Logs { loop_id, follow } => {
            print_logs(&manager, &loop_id, follow).await?;
        }
    }

    Ok(())
}

async fn print_logs(manager: &LoopManager, loop_id: &str, follow: bool) -> Result<()> {
    let data = manager.show(loop_id).await?;
    for entry in data.state.logs.iter() {
        println!("[{:?}] {}", entry.kind, entry.content);
    }

    if !follow {
        return Ok(());
    }

    let mut rx = manager.bus().subscribe();
    loop {
        match rx.recv().await {
            Ok(event) if event.loop_id == loop_id => match event.kind {
                LoopEventKind::Log { kind, content } => println!("[{kind:?}] {content}"),
                LoopEventKind::Message { role, content } => println!("[{role}] {content}"),
                LoopEventKind::Stopped { .. } | LoopEventKind::Completed | LoopEventKind::Error { .. } => {
                    println!("{}", "-- loop finished --".dimmed());
                    break;
                }
                _ => {}
            },
            Ok(_) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}
