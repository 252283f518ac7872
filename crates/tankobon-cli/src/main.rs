//! tankobon - タスクキューの起動とデモ
//!
//! - `run`: 設定ファイルから App を起動し、Ctrl-C まで動かす
//! - `demo`: remote worker を模したクライアントで upscale を 1 件流す

mod demo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tankobon_core::app::{App, AppBuilder, open_store};
use tankobon_core::{ExecutionMode, QueueConfig, TaskKind, TaskPayload};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tankobon")]
#[command(about = "Persistent upscale task queue with remote worker coordination")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML config file; defaults apply when omitted
    #[arg(short, long, env = "TANKOBON_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the queue with demo handlers until Ctrl-C
    Run,

    /// Push one upscale through a simulated remote worker and print the record
    Demo {
        #[arg(long, default_value_t = 7)]
        chapter: i64,

        #[arg(long, default_value_t = 1)]
        profile: i64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 埋め込み側が先に subscriber を入れていることがある
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn load_config(path: Option<&PathBuf>) -> Result<QueueConfig> {
    match path {
        Some(path) => QueueConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => {
            let mut config = QueueConfig::default();
            config.apply_env(|key| std::env::var(key).ok())?;
            Ok(config)
        }
    }
}

async fn build_app(config: QueueConfig) -> Result<App> {
    let store = open_store(&config).await.context("opening task store")?;
    let builder = TaskKind::ALL
        .into_iter()
        .try_fold(AppBuilder::new(config), |b, kind| {
            b.register(kind, demo::SimulatedHandler::new(kind))
        })?;
    let app = builder
        .store(store)
        .inspector(Arc::new(demo::AlwaysNeeded))
        .repair_analyzer(Arc::new(demo::ScratchRepairAnalyzer))
        .chapter_notifier(Arc::new(demo::LoggingChapterNotifier))
        .build()?;
    Ok(app)
}

async fn run(config: QueueConfig) -> Result<()> {
    let mode = config.execution_mode;
    let mut app = build_app(config).await?;
    app.start().await?;

    let shutdown = CancellationToken::new();
    let wait = app.config().fetch_timeout();
    let worker = match (mode, app.coordinator()) {
        (ExecutionMode::Distributed, Some(coordinator)) => Some(tokio::spawn(
            demo::remote_worker(coordinator.clone(), wait, shutdown.clone()),
        )),
        _ => None,
    };

    info!("running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    shutdown.cancel();
    if let Some(worker) = worker {
        let _ = worker.await;
    }
    app.shutdown().await;
    Ok(())
}

async fn run_demo(mut config: QueueConfig, chapter: i64, profile: i64) -> Result<()> {
    config.execution_mode = ExecutionMode::Distributed;
    config.store_path = None;
    let mut app = build_app(config).await?;
    app.start().await?;

    let mut events = app.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("event: {line}");
            }
        }
    });

    let task = app
        .queue()
        .enqueue(TaskPayload::upscale(chapter, profile))
        .await?;
    info!(task_id = %task.id, chapter, "enqueued upscale");

    let coordinator = app
        .coordinator()
        .context("demo needs distributed mode")?
        .clone();
    let fetched = coordinator
        .fetch(app.config().fetch_timeout())
        .await?
        .context("no task was handed out")?;
    demo::simulate_remote_upscale(&coordinator, &fetched, Duration::from_millis(200)).await?;

    let record = app.queue().get(task.id).await?.context("record vanished")?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    app.shutdown().await;
    printer.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Demo { chapter, profile } => run_demo(config, chapter, profile).await,
    }
}
