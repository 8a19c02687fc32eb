use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use codefleet::config::FleetConfig;
use codefleet::fleet::model::{Complexity, DEFAULT_PRIORITY, Task};
use codefleet::fleet::state::TaskStatus;
use codefleet::fleet::{FleetController, LocalSpawner, unblock_channel};
use codefleet::ops::{FleetOps, FleetStatus};
use codefleet::store::{LibSqlBackend, Store};
use codefleet::worker::{Executor, ShellExecutor};

#[derive(Parser)]
#[command(name = "codefleet", version, about = "CodeFleet — schedule tasks across a fleet of coding workers")]
struct Cli {
    /// Path to the fleet database (overrides CODEFLEET_DB_PATH)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, health monitor, conflict detector and workers
    Run {
        /// Upper bound on concurrent workers (overrides CODEFLEET_MAX_RUNNERS)
        #[arg(long)]
        max_workers: Option<usize>,
        /// Command each worker runs per task (overrides CODEFLEET_EXEC_CMD)
        #[arg(long)]
        exec: Option<String>,
    },
    /// Submit a task
    AddTask {
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// 1 (lowest) to 5 (highest)
        #[arg(short, long, default_value_t = DEFAULT_PRIORITY)]
        priority: i32,
        /// Comma-separated ids of tasks that must complete first
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<Uuid>,
        /// Comma-separated paths the task will modify
        #[arg(long, value_delimiter = ',')]
        scope: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
        /// Comma-separated capability tags a worker must carry
        #[arg(long, value_delimiter = ',')]
        requires: Vec<String>,
        #[arg(long, default_value = "medium")]
        complexity: Complexity,
    },
    /// List tasks, most urgent first
    ListTasks {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Show worker, task and conflict counts
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Cancel a task
    Cancel { id: Uuid },
    /// Mark a conflict resolved
    ResolveConflict {
        id: Uuid,
        #[arg(long)]
        note: Option<String>,
    },
    /// Escalate a conflict for review
    EscalateConflict {
        id: Uuid,
        #[arg(long)]
        note: Option<String>,
    },
    /// Drop failed or unknown dependencies of a blocked task
    Unblock { id: Uuid },
    /// Requeue a failed task
    Retry { id: Uuid },
    /// Requeue assigned, in-progress and failed tasks; take all workers offline
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_from_env("CODEFLEET_LOG"))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = FleetConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Commands::Run { max_workers, exec } = &cli.command {
        if let Some(n) = max_workers {
            config.scheduler.max_workers = *n;
        }
        if let Some(cmd) = exec {
            config.worker.exec_command = Some(cmd.clone());
        }
    }
    config.validate()?;

    let store: Arc<dyn Store> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    let ops = FleetOps::new(Arc::clone(&store));

    match cli.command {
        Commands::Run { .. } => run(store, config).await?,
        Commands::AddTask {
            title,
            description,
            priority,
            depends_on,
            scope,
            labels,
            requires,
            complexity,
        } => {
            let task = Task::new(title)
                .with_description(description)
                .with_priority(priority)
                .with_depends_on(depends_on)
                .with_file_scope(scope)
                .with_labels(labels)
                .with_required_capabilities(requires)
                .with_complexity(complexity);
            let id = ops.add_task(task).await?;
            let task = ops.get_task(id).await?;
            println!("{id} {}", task.status);
        }
        Commands::ListTasks {
            status,
            limit,
            json,
        } => {
            let tasks = ops.list_tasks(status, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                for t in &tasks {
                    let worker = t
                        .assigned_to
                        .map(|w| w.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{}  {:<11}  p{}  {:<36}  {}",
                        t.id,
                        t.status.as_str(),
                        t.priority,
                        worker,
                        t.title
                    );
                }
                if tasks.is_empty() {
                    eprintln!("No tasks.");
                }
            }
        }
        Commands::Status { json } => {
            let status = ops.fleet_status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Cancel { id } => {
            let task = ops.cancel_task(id).await?;
            println!("{} {}", task.id, task.status);
        }
        Commands::ResolveConflict { id, note } => {
            let conflict = ops.resolve_conflict(id, note).await?;
            println!("{} {}", conflict.id, conflict.status);
        }
        Commands::EscalateConflict { id, note } => {
            let conflict = ops.escalate_conflict(id, note).await?;
            println!("{} {}", conflict.id, conflict.status);
        }
        Commands::Unblock { id } => {
            let task = ops.unblock_task(id).await?;
            println!("{} {}", task.id, task.status);
        }
        Commands::Retry { id } => {
            let task = ops.retry_task(id).await?;
            println!("{} {}", task.id, task.status);
        }
        Commands::Reset => {
            let report = ops.reset().await?;
            println!(
                "Requeued {} tasks, took {} workers offline",
                report.tasks_requeued, report.workers_offline
            );
        }
    }

    Ok(())
}

async fn run(store: Arc<dyn Store>, config: FleetConfig) -> anyhow::Result<()> {
    let exec_command = config.require_exec_command()?.to_string();

    eprintln!("🚢 CodeFleet v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Max workers: {}", config.scheduler.max_workers);
    eprintln!("   Workdir: {}", config.worker.workdir.display());
    eprintln!("   Exec: {}", exec_command);
    eprintln!("   Failure policy: {}", config.completion.failure_policy);
    eprintln!("   Press Ctrl-C to stop.\n");

    let executor: Arc<dyn Executor> = Arc::new(ShellExecutor::new(
        exec_command,
        config.worker.workdir.clone(),
    ));
    let (unblock_tx, unblock_rx) = unblock_channel();
    let spawner = Arc::new(LocalSpawner::new(
        Arc::clone(&store),
        config.worker.clone(),
        executor,
        unblock_tx,
    ));

    let controller = FleetController::new(store, config, spawner).with_unblock_queue(unblock_rx);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Error: Failed to listen for Ctrl-C: {}", e);
        }
    };

    if let Err(e) = controller.run(shutdown).await {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }
    Ok(())
}

fn print_status(status: &FleetStatus) {
    println!("Health: {}", status.health);
    let workers: Vec<String> = status
        .workers
        .iter()
        .map(|(s, n)| format!("{s}={n}"))
        .collect();
    println!(
        "Workers: {}",
        if workers.is_empty() { "none".to_string() } else { workers.join(" ") }
    );
    let tasks: Vec<String> = status
        .tasks
        .iter()
        .map(|(s, n)| format!("{s}={n}"))
        .collect();
    println!(
        "Tasks: {}",
        if tasks.is_empty() { "none".to_string() } else { tasks.join(" ") }
    );
    println!("Unresolved conflicts: {}", status.unresolved_conflicts);
    for err in &status.dependency_errors {
        println!("  ! {err}");
    }
    for report in &status.loops {
        println!(
            "  {} {} ({} consecutive failures)",
            report.name, report.state, report.consecutive_failures
        );
    }
}
