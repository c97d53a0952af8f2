//! # CareWatch — Recurring Healthcare Task Orchestrator
//!
//! Installs the clinic task catalog into the shared registry and runs the
//! scheduler that fires it.
//!
//! Usage:
//!   carewatch                          # List installed tasks
//!   carewatch install                  # Reconcile the catalog into the registry
//!   carewatch install --force          # Reinstall from scratch (drops run history)
//!   carewatch run                      # Reconcile, then schedule until Ctrl+C
//!   carewatch --init-config            # Write a default config file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use carewatch_core::CareConfig;
use carewatch_scheduler::{
    ActionRegistry, Catalog, Clock, FailureLog, FanoutSink, Scheduler, SqliteRegistry,
    SystemClock, TaskLifecycleManager, TaskOverview, TracingSink,
};

#[derive(Parser)]
#[command(
    name = "carewatch",
    version,
    about = "🩺 CareWatch — recurring healthcare task orchestrator"
)]
struct Cli {
    /// Path to TOML configuration file (default: ~/.carewatch/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Task catalog file (default: built-in healthcare catalog)
    #[arg(long)]
    catalog: Option<String>,

    /// Registry database path
    #[arg(long)]
    db: Option<String>,

    /// Write a default config file and exit
    #[arg(long)]
    init_config: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Show installed tasks and their state
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Install the catalog into the registry
    Install {
        /// Delete every task in the catalog namespace first, discarding run history
        #[arg(long)]
        force: bool,
    },
    /// Zero every task's run counter
    Reset,
    /// Resume scheduling a task
    Enable { name: String },
    /// Pause a task without removing it
    Disable { name: String },
    /// Delete a task and its history
    Remove { name: String },
    /// Install the catalog, then run the scheduler until Ctrl+C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "carewatch=debug,carewatch_scheduler=debug"
    } else {
        "carewatch=info,carewatch_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli.config.unwrap_or_else(CareConfig::default_path);

    // --init-config: write defaults and exit
    if cli.init_config {
        return init_config(&config_path);
    }

    let mut config = if config_path.exists() {
        CareConfig::load_from(&config_path)?
    } else {
        CareConfig::default()
    };
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    if let Some(catalog) = cli.catalog {
        config.catalog_path = Some(catalog);
    }

    let registry = Arc::new(
        SqliteRegistry::open(&config.storage.db_path(), config.storage.busy_timeout())
            .context("opening task registry")?,
    );
    let actions = Arc::new(builtin_actions());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let manager = TaskLifecycleManager::new(registry.clone(), actions.clone(), clock.clone());

    match cli.command.unwrap_or(Command::List { json: false }) {
        Command::List { json } => list_tasks(&manager, json),
        Command::Install { force } => {
            let catalog = load_catalog(&config)?;
            let report = manager.reconcile(&catalog, force)?;
            println!(
                "✅ Catalog '{}' installed: {} created, {} updated, {} deleted",
                catalog.namespace, report.created, report.updated, report.deleted
            );
            Ok(())
        }
        Command::Reset => {
            let count = manager.reset_all()?;
            println!("🔄 Reset run counters on {count} task(s)");
            Ok(())
        }
        Command::Enable { name } => {
            manager.set_enabled(&name, true)?;
            println!("▶️  {name} enabled");
            Ok(())
        }
        Command::Disable { name } => {
            manager.set_enabled(&name, false)?;
            println!("⏸️  {name} disabled");
            Ok(())
        }
        Command::Remove { name } => {
            if manager.remove(&name)? {
                println!("🗑️  {name} removed");
            } else {
                println!("⚠️  {name} is not installed");
            }
            Ok(())
        }
        Command::Run => {
            let catalog = load_catalog(&config)?;
            manager.reconcile(&catalog, false)?;

            let failures = Arc::new(FailureLog::new());
            let sink = FanoutSink::new()
                .with(Arc::new(TracingSink))
                .with(failures.clone());
            let scheduler = Arc::new(Scheduler::new(
                registry,
                actions,
                clock,
                Arc::new(sink),
                &config.scheduler,
            ));
            scheduler.ensure_actions()?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let workers = scheduler.spawn(shutdown_rx);

            tokio::signal::ctrl_c().await?;
            tracing::info!("received Ctrl+C, shutting down...");
            shutdown_tx.send(true).ok();
            for worker in workers {
                if let Err(e) = worker.await {
                    tracing::warn!("scheduler worker ended abnormally: {e}");
                }
            }

            if !failures.is_empty() {
                println!("⚠️  {} failed run(s) this session:", failures.len());
                for notice in failures.history() {
                    println!("   {}  {}  {}", fmt_time(Some(notice.at)), notice.task_name, notice.error);
                }
            }
            Ok(())
        }
    }
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        println!("⚠️  Config already exists at {}", path.display());
        return Ok(());
    }
    CareConfig::default().save_to(path)?;
    println!("✅ Default config written to {}", path.display());
    Ok(())
}

fn load_catalog(config: &CareConfig) -> Result<Catalog> {
    match config.catalog_path() {
        Some(path) => Catalog::load_from(&path)
            .with_context(|| format!("loading catalog {}", path.display())),
        None => Ok(Catalog::builtin()),
    }
}

fn list_tasks(manager: &TaskLifecycleManager, json: bool) -> Result<()> {
    let tasks = manager.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks installed. Run `carewatch install` first.");
        return Ok(());
    }

    println!(
        "{:<40} {:<9} {:>6}  {:<17} {:<17} TRIGGER",
        "NAME", "STATE", "RUNS", "LAST RUN", "NEXT DUE"
    );
    for TaskOverview {
        record,
        state,
        next_due_at,
    } in &tasks
    {
        println!(
            "{:<40} {:<9} {:>6}  {:<17} {:<17} {}",
            record.name,
            state.to_string(),
            record.total_run_count,
            fmt_time(record.last_run_at),
            fmt_time(*next_due_at),
            record.trigger
        );
    }
    Ok(())
}

fn fmt_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into())
}

/// Actions this binary knows how to run.
/// Integrations with the clinic systems hook in here; the built-ins only log.
fn builtin_actions() -> ActionRegistry {
    let mut actions = ActionRegistry::new();
    actions.register_fn("send_reminders", |ctx| async move {
        tracing::info!(task = %ctx.task_name, run = ctx.previous_runs + 1, "💊 sending medication reminders");
        Ok(())
    });
    actions.register_fn("check_stock_levels", |ctx| async move {
        tracing::info!(task = %ctx.task_name, run = ctx.previous_runs + 1, "📦 checking stock levels");
        Ok(())
    });
    actions.register_fn("cleanup_expired_data", |ctx| async move {
        tracing::info!(task = %ctx.task_name, run = ctx.previous_runs + 1, "🧹 purging expired data");
        Ok(())
    });
    actions
}
