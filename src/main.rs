#![allow(clippy::uninlined_format_args)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use asr_orchestrator::{
    config::Config,
    pool::{worker_loop::run_worker, FileBasedPool, WorkerCommand},
    schedule::TaskEvent,
    utils::logger,
    AppContext,
};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "asr-orchestrator", version, about = "Speech transcription service")]
struct Cli {
    /// JSON configuration file; defaults apply when it does not exist
    #[arg(long, global = true, env = "ASR_CONFIG", default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the WebSocket server with its worker pool
    Serve,
    /// Run one worker process; started by the pool, not by hand
    Worker {
        #[arg(long)]
        slot: usize,
        #[arg(long)]
        task_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(serve(config, cli.config))
        }
        Commands::Worker { slot, task_dir } => {
            logger::init_stderr(&config.logging.level)?;
            run_worker(slot, &task_dir, &config)
        }
    }
}

async fn serve(config: Config, config_path: PathBuf) -> Result<()> {
    let _guard = logger::init(config.logging.dir.clone(), &config.logging.level)?;
    info!("Starting ASR service {} ({})...", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));

    for dir in [&config.transcription.upload_dir, &config.transcription.temp_dir] {
        std::fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }

    let program = match &config.pool.worker_program {
        Some(program) => program.clone(),
        None => std::env::current_exe()?,
    };
    let config_arg = config_path.exists().then(|| absolute(&config_path));
    info!("Initializing worker pool ({} slots)...", config.pool.size);
    let pool = Arc::new(FileBasedPool::new(
        config.pool.clone(),
        WorkerCommand::new(program, config_arg),
    ));
    pool.initialize().await?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;

    let ctx = Arc::new(AppContext::new(config, pool.clone()).await?);
    let scheduler = Arc::new(ctx.scheduler());
    scheduler.spawn_workers(ctx.task_manager.concurrency()).await;
    let scheduler_task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                error!("Scheduler stopped with error: {}", e);
            }
        })
    };

    let mut events = ctx.events.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TaskEvent::Completed { task_id, result }) => {
                    info!("Task {} delivered as {}", task_id, result.format())
                }
                Ok(TaskEvent::Failed { task_id, error }) => warn!("Task {} failed: {}", task_id, error),
                Ok(TaskEvent::Progress { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let shutdown = ctx.task_manager.shutdown_token();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
        }
        signal_token.cancel();
    });

    info!("Starting server at ws://{}/ws", addr);
    let served = asr_orchestrator::web::start_server(ctx.clone(), addr, shutdown).await;
    match &served {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => error!("Server error: {}", e),
    }

    info!("Shutting down...");
    ctx.task_manager.shutdown().await?;
    if let Err(e) = scheduler_task.await {
        error!("Scheduler task panicked: {}", e);
    }
    served
}

fn absolute(path: &Path) -> PathBuf {
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
