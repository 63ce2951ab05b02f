use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use homematch_core::WorkRequest;
use homematch_storage::{PgStore, Stores};
use homematch_worker::{work_queue, SearchWorker, WorkQueue, WorkRequestSink, WorkerConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "homematch")]
#[command(about = "Homematch listing search worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one search pass and exit. Without a user this is the full cron sweep.
    Run {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long, requires = "user_id")]
        profile_id: Option<String>,
        /// Raw `{"userId": .., "profileId": ..}` trigger payload.
        #[arg(long, conflicts_with_all = ["user_id", "profile_id"])]
        payload: Option<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the daily sweep on schedule and accept JSON work requests on stdin.
    Daemon,
}

fn work_request(
    user_id: Option<String>,
    profile_id: Option<String>,
    payload: Option<String>,
) -> Result<WorkRequest> {
    if let Some(payload) = payload {
        return serde_json::from_str(&payload).context("parsing --payload as a work request");
    }
    Ok(WorkRequest {
        user_id,
        profile_id,
    })
}

async fn connect(config: &WorkerConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url).await
}

async fn build_worker(config: WorkerConfig) -> Result<SearchWorker> {
    let store = connect(&config).await?;
    SearchWorker::from_config(config, Stores::from_backend(Arc::new(store)))
}

/// Forward newline-delimited JSON work requests from stdin until EOF.
async fn read_requests(queue: WorkQueue) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkRequest>(line) {
            Ok(request) => queue.submit(request).await?,
            Err(err) => warn!(error = %err, "ignoring malformed work request"),
        }
    }
    info!("stdin closed; only scheduled runs remain");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        user_id: None,
        profile_id: None,
        payload: None,
    }) {
        Commands::Run {
            user_id,
            profile_id,
            payload,
        } => {
            let request = work_request(user_id, profile_id, payload)?;
            let worker = build_worker(config).await?;
            let summary = worker.run(request).await?;
            println!(
                "search {}: run_id={} users={} profiles={} new_matches={} notifications={}",
                summary.terminal_state(),
                summary.run_id,
                summary.users_processed,
                summary.profiles.len(),
                summary.new_matches(),
                summary.notifications_sent()
            );
        }
        Commands::Migrate => {
            connect(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Daemon => {
            let worker = build_worker(config).await?;
            let mut sched = worker.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %worker.config().search_cron, "daemon started");

            let (queue, rx) = work_queue(64);
            let serving = tokio::spawn(worker.clone().serve(rx));
            let reader = tokio::spawn(read_requests(queue));

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
            sched.shutdown().await.context("stopping scheduler")?;
            reader.abort();
            if let Ok(Err(err)) = reader.await {
                warn!(error = %format!("{err:#}"), "work request reader stopped with an error");
            }
            serving.await.context("joining work queue")?;
        }
    }

    Ok(())
}
