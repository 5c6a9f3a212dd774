//! `notiflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`: start the API server.
//! - `worker`: start execution workers and the lease reaper.
//! - `migrate`: run pending database migrations.
//! - `validate`: validate a workflow definition JSON file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use channels::log::LogChannel;
use channels::ChannelAdapter;
use engine::postgres::PgStore;
use engine::{
    channel_registry, EngineConfig, ExecutionScheduler, Reaper, TriggerInstanceManager, Worker,
    WorkflowDefinition,
};

#[derive(Parser)]
#[command(
    name = "notiflow",
    about = "Notification workflow execution engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long, env = "NOTIFLOW_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Start workers that execute due trigger instances.
    Worker {
        /// Number of concurrent worker loops in this process.
        #[arg(long, env = "NOTIFLOW_WORKERS", default_value_t = 4)]
        workers: usize,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run pending database migrations.
    Migrate {
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow definition JSON file.
        path: PathBuf,
    },
}

#[derive(Args)]
struct DatabaseArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    #[arg(long, env = "NOTIFLOW_DB_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
}

impl DatabaseArgs {
    async fn connect(&self) -> Result<db::DbPool> {
        db::pool::create_pool(&self.database_url, self.max_connections)
            .await
            .context("failed to connect to database")
    }
}

#[derive(Args)]
struct EngineArgs {
    /// Dispatch attempts per node before the instance fails.
    #[arg(long, env = "NOTIFLOW_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
    #[arg(long, env = "NOTIFLOW_RETRY_BASE_MS", default_value_t = 1_000)]
    retry_base_ms: u64,
    #[arg(long, env = "NOTIFLOW_RETRY_MAX_SECS", default_value_t = 300)]
    retry_max_secs: u64,
    #[arg(long, env = "NOTIFLOW_LEASE_SECS", default_value_t = 30)]
    lease_secs: u64,
    #[arg(long, env = "NOTIFLOW_POLL_MS", default_value_t = 500)]
    poll_ms: u64,
    #[arg(long, env = "NOTIFLOW_REAP_SECS", default_value_t = 5)]
    reap_secs: u64,
    #[arg(long, env = "NOTIFLOW_CLAIM_BATCH", default_value_t = 8)]
    claim_batch: usize,
}

impl From<&EngineArgs> for EngineConfig {
    fn from(args: &EngineArgs) -> Self {
        Self {
            max_retries: args.max_retries,
            retry_base_delay: Duration::from_millis(args.retry_base_ms),
            retry_max_delay: Duration::from_secs(args.retry_max_secs),
            lease: Duration::from_secs(args.lease_secs),
            poll_interval: Duration::from_millis(args.poll_ms),
            reap_interval: Duration::from_secs(args.reap_secs),
            claim_batch: args.claim_batch,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            bind,
            database,
            engine,
        } => {
            let store = Arc::new(PgStore::new(database.connect().await?));
            let manager = TriggerInstanceManager::new(store.clone(), store.clone(), (&engine).into());
            let state = api::AppState {
                manager: Arc::new(manager),
                workflows: store,
            };

            info!("Starting API server on {bind}");
            api::serve(&bind, state).await.context("API server failed")?;
        }

        Command::Worker {
            workers,
            database,
            engine,
        } => run_workers(workers, database, engine).await?,

        Command::Migrate { database } => {
            info!("Running migrations");
            let pool = database.connect().await?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            info!("Migrations applied successfully");
        }

        Command::Validate { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("cannot read file {}", path.display()))?;
            let definition: WorkflowDefinition =
                serde_json::from_str(&content).context("invalid workflow definition JSON")?;

            match engine::validate_definition(&definition) {
                Ok(graph) => {
                    println!("✅ Workflow is valid. Visit order: {:?}", graph.visit_order);
                    println!("   Terminal nodes: {:?}", graph.terminal_nodes);
                }
                Err(e) => bail!("❌ Validation failed: {e}"),
            }
        }
    }

    Ok(())
}

async fn run_workers(count: usize, database: DatabaseArgs, engine: EngineArgs) -> Result<()> {
    let config = EngineConfig::from(&engine);
    let store = Arc::new(PgStore::new(database.connect().await?));

    let adapters: Vec<Arc<dyn ChannelAdapter>> =
        vec![Arc::new(LogChannel::email()), Arc::new(LogChannel::sms())];
    let scheduler = Arc::new(ExecutionScheduler::new(
        store.clone(),
        store.clone(),
        channel_registry(adapters),
        config.clone(),
    ));
    let manager = Arc::new(TriggerInstanceManager::new(
        store.clone(),
        store,
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::with_capacity(count + 1);
    for i in 0..count {
        let id = format!("worker-{}-{i}", std::process::id());
        tasks.push(tokio::spawn(
            Worker::new(id, scheduler.clone()).run(shutdown_rx.clone()),
        ));
    }
    tasks.push(tokio::spawn(
        Reaper::new(manager, config.reap_interval).run(shutdown_rx),
    ));

    info!(workers = count, "Workers running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    shutdown_tx.send_replace(true);
    for task in tasks {
        task.await.context("worker task panicked")?;
    }
    Ok(())
}
