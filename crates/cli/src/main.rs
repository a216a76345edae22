//! conductor: control surface for the task-orchestration service.
//!
//! `run` hosts the control plane until SIGINT/SIGTERM. The inspection
//! commands (status, graph, order, resources, …) work offline against the
//! same config and state directory. Real executors are registered through
//! the library API; the binary ships a `noop` executor so a deployment can
//! be exercised before wiring its own task types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use conductor_core::{load_dotenv, loader, Config, TaskDefinition, TaskResult};
use conductor_executor::{
    Executor, ExecutorFactory, ExecutorRegistry, ExecutorServices, RunContext,
};
use conductor_manager::TaskManager;
use conductor_notify::{Dispatcher, LogNotifier};

#[derive(Parser)]
#[command(name = "conductor", about = "Autonomous task orchestration service")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, env = "CONDUCTOR_CONFIG", default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service until interrupted.
    Run,
    /// Validate the config and every task definition, then exit.
    Validate,
    /// Run one task immediately and wait for it to settle.
    Submit {
        task_id: String,
    },
    /// Show one task's status (state, graph node, scheduler jobs).
    Status {
        task_id: String,
    },
    /// List every task's status summary.
    List,
    /// Dump the dependency graph snapshot as JSON.
    Graph,
    /// Print the layered execution order.
    Order,
    /// Check the dependency graph for cycles.
    CheckCycles,
    /// Show resource pool status.
    Resources,
    /// Show archive totals and the retention policy.
    ArchiveInfo,
    /// Run a retention sweep now.
    Prune,
}

// ── Built-in executor ───────────────────────────────────────────────

/// Placeholder executor: logs and succeeds. Deployments register real task
/// types via `ExecutorRegistry` before constructing the manager.
struct NoopExecutor {
    task_id: String,
}

#[async_trait::async_trait]
impl Executor for NoopExecutor {
    async fn run(&self, ctx: &RunContext) -> TaskResult {
        info!(task_id = %self.task_id, "noop executor invoked");
        ctx.report_progress(1.0, None);
        TaskResult::ok()
    }
}

struct NoopFactory;

impl ExecutorFactory for NoopFactory {
    fn task_type(&self) -> &str {
        "noop"
    }

    fn create(
        &self,
        task_id: &str,
        _params: &HashMap<String, serde_json::Value>,
        _services: &ExecutorServices,
    ) -> conductor_core::Result<Box<dyn Executor>> {
        Ok(Box::new(NoopExecutor {
            task_id: task_id.to_string(),
        }))
    }
}

// ── Entry point ─────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("failed to load config {}", cli.config.display()))?
    } else {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };

    match cli.command {
        Command::Run => run_service(config).await,
        Command::Validate => validate(config),
        Command::Submit { task_id } => submit(config, &task_id).await,
        Command::Status { task_id } => {
            let manager = build_manager(&config).await?;
            let report = manager.status(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::List => {
            let manager = build_manager(&config).await?;
            let reports = manager.list_statuses().await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
            Ok(())
        }
        Command::Graph => {
            let manager = build_manager(&config).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&manager.dep_graph_snapshot())?
            );
            Ok(())
        }
        Command::Order => {
            let manager = build_manager(&config).await?;
            for (depth, layer) in manager.execution_order()?.iter().enumerate() {
                println!("layer {}: {}", depth, layer.join(", "));
            }
            Ok(())
        }
        Command::CheckCycles => {
            let manager = build_manager(&config).await?;
            let cycles = manager.check_cycles();
            if cycles.is_empty() {
                println!("no cycles");
            } else {
                for cycle in cycles {
                    println!("cycle: {}", cycle.join(" -> "));
                }
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Resources => {
            let manager = build_manager(&config).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&manager.resource_status())?
            );
            Ok(())
        }
        Command::ArchiveInfo => {
            let manager = build_manager(&config).await?;
            println!("{}", serde_json::to_string_pretty(&manager.archive_info())?);
            Ok(())
        }
        Command::Prune => {
            let manager = build_manager(&config).await?;
            let processed = manager.prune_now().await?;
            println!("processed {} record(s)", processed);
            Ok(())
        }
    }
}

fn registry() -> Arc<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(NoopFactory));
    Arc::new(registry)
}

fn load_definitions(config: &Config) -> Result<Vec<TaskDefinition>> {
    loader::load_definitions(&config.definitions_dir)
        .with_context(|| {
            format!(
                "failed to load task definitions from {}",
                config.definitions_dir.display()
            )
        })
}

async fn build_manager(config: &Config) -> Result<TaskManager> {
    let dispatcher = Arc::new(Dispatcher::new(vec![Box::new(LogNotifier)]));
    let manager = TaskManager::with_defaults(config.clone(), registry(), dispatcher)?;
    let definitions = load_definitions(config)?;
    manager.register_tasks(definitions).await?;
    Ok(manager)
}

fn validate(config: Config) -> Result<()> {
    config.log_summary();
    let definitions = load_definitions(&config)?;
    let registry = registry();

    let mut failures = 0;
    for definition in &definitions {
        let errors = registry.validate_definition(definition);
        if errors.is_empty() {
            println!("ok    {}", definition.task_id);
        } else {
            failures += 1;
            for error in errors {
                println!("error {}: {}", definition.task_id, error);
            }
        }
    }
    println!("{} definition(s), {} invalid", definitions.len(), failures);
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_service(config: Config) -> Result<()> {
    config.log_summary();
    let manager = build_manager(&config).await?;
    manager.start().await?;
    info!("service running, press ctrl-c to stop");

    wait_for_shutdown_signal().await;
    manager.stop().await;
    Ok(())
}

async fn submit(config: Config, task_id: &str) -> Result<()> {
    let manager = build_manager(&config).await?;
    manager.start().await?;

    if !manager.submit_now(task_id).await? {
        manager.stop().await;
        anyhow::bail!("task '{}' was not started (see audit trail)", task_id);
    }

    // Wait until the task settles.
    loop {
        let report = manager.status(task_id).await?;
        if report.state.status.is_terminal() && !report.is_running {
            println!("{}", serde_json::to_string_pretty(&report)?);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    manager.stop().await;
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl_c");
    }
}
