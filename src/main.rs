// Standard and third-party imports
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use clap::{Parser, Subcommand};
use dagrunner::dag;
use dagrunner::node::Status;
use dagrunner::scheduler::{RunStatus, Scheduler, SchedulerConfig};
use tokio::sync::mpsc;
use tracing::info;

/// CLI entrypoint using `clap` to define subcommands
#[derive(Parser)]
#[command(name = "dagrunner", version, about = "Concurrent scheduler for DAGs of shell steps")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands
#[derive(Subcommand)]
enum Commands {
    /// Load and run a YAML-based DAG definition
    Run {
        /// Path to the DAG YAML file
        config: PathBuf,

        /// Caps how many steps may run concurrently (0 = unlimited)
        #[arg(long)]
        max_active_steps: Option<usize>,

        /// Overall wall-clock deadline for the run, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Directory step logs are written under
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

/// Async entrypoint with Tokio runtime
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set up structured logging using the `tracing` crate.
    // Logs go to stderr so they don't interleave with the run summary on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "dagrunner=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            max_active_steps,
            timeout,
            log_dir,
        } => run(config, max_active_steps, timeout, log_dir).await,
    }
}

async fn run(
    config_path: PathBuf,
    max_active_steps: Option<usize>,
    timeout: Option<u64>,
    log_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("📄 Loading dag from {:?}", config_path);
    let (loaded, execution_graph) = dag::load_from_yaml(&config_path).await?;

    println!("✅ Loaded dag '{}'", loaded.name);
    println!("🔢 Total steps: {}\n", execution_graph.len());

    let mut scheduler_config = SchedulerConfig::default();
    if let Some(n) = max_active_steps {
        scheduler_config.max_active_steps = n;
    }
    if let Some(secs) = timeout {
        scheduler_config.timeout = Duration::from_secs(secs);
    }
    if let Some(dir) = log_dir {
        scheduler_config.log_dir = dir;
    }

    let scheduler = Scheduler::new(scheduler_config);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(async move {
        while let Some(node) = rx.recv().await {
            tracing::debug!(step = node.name(), status = ?node.status(), "progress");
        }
    });

    let execution_graph = Arc::new(execution_graph);
    let report = scheduler.schedule(execution_graph.clone(), Some(tx)).await?;
    let _ = progress.await;

    println!("🎯 Final status: {:?}", report.status);
    println!(
        "   completed={} failed={} skipped={} canceled={} total={}",
        report.metrics.completed_nodes,
        report.metrics.failed_nodes,
        report.metrics.skipped_nodes,
        report.metrics.canceled_nodes,
        report.metrics.total_nodes,
    );
    println!("\n📋 Step results:");
    for node in execution_graph.nodes() {
        match node.status() {
            Status::Success => println!("✅ {} → exit {}", node.name(), node.exit_code()),
            Status::Skipped => println!("⏭️  {} → skipped", node.name()),
            Status::Canceled => println!("🚫 {} → canceled", node.name()),
            status => println!("❌ {} → {:?}: {}", node.name(), status, node.error().map(|e| e.to_string()).unwrap_or_default()),
        }
    }

    if !matches!(report.status, RunStatus::Success | RunStatus::PartialSuccess) {
        std::process::exit(1);
    }
    Ok(())
}
