use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sns_adapters::HttpFeedClient;
use sns_core::{AppConfig, LogFormat, LoggerConfig, StoreBackend, StoreConfig};
use sns_storage::{ArticleStore, MemoryArticleStore, PgArticleStore, QueryService, RetentionManager};
use sns_sync::{spawn_ingestion_loop, IngestionCycle};
use sns_web::AppState;
use tokio::net::TcpListener;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "sns-cli")]
#[command(about = "Sports news storage: feed ingestion and article API", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the API server with the background ingestion loop (default).
    Serve,
    /// Run one fetch and upsert cycle now, then exit.
    Sync,
    /// Declare the article table, unique key and expiry index, then exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load().context("loading configuration")?;
    init_tracing(&config.logger);

    let root = info_span!(
        "sns",
        app = %config.app.name,
        version = %config.app.version,
        env = %config.app.environment
    );
    async move {
        match cli.command.unwrap_or(Commands::Serve) {
            Commands::Serve => serve(config).await,
            Commands::Sync => sync_once(config).await,
            Commands::Migrate => migrate(config).await,
        }
    }
    .instrument(root)
    .await
}

fn init_tracing(logger: &LoggerConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logger.level));
    let registry = tracing_subscriber::registry().with(filter);
    match logger.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ArticleStore>> {
    match config.backend {
        StoreBackend::Postgres => {
            let store = PgArticleStore::connect(config)
                .await
                .with_context(|| format!("connecting to {}:{}/{}", config.host, config.port, config.database))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("using in-memory article store; articles are lost on exit");
            Ok(Arc::new(MemoryArticleStore::new()))
        }
    }
}

async fn migrate(config: AppConfig) -> Result<()> {
    let store = open_store(&config.store).await?;
    let retention = RetentionManager::new(
        store.clone(),
        config.store.retention(),
        config.scheduler.sweep_interval(),
    );
    retention.declare().await.context("declaring article schema")?;
    println!(
        "schema ready: table={} expire_after_seconds={}",
        config.store.collection,
        retention.policy().ttl_secs()
    );
    store.close().await;
    Ok(())
}

async fn sync_once(config: AppConfig) -> Result<()> {
    let store = open_store(&config.store).await?;
    RetentionManager::new(
        store.clone(),
        config.store.retention(),
        config.scheduler.sweep_interval(),
    )
    .declare()
    .await
    .context("declaring article schema")?;

    let feed = HttpFeedClient::new(&config.feed).context("building feed client")?;
    let cycle = IngestionCycle::new(Arc::new(feed), store.clone(), config.feed.page_size);
    let report = cycle.run_once().await;
    let run_id = report.run_id;
    let fetched = report.fetched;
    let result = report.into_result();
    store.close().await;

    let written = result.context("ingestion cycle failed")?;
    println!(
        "sync complete: run_id={} fetched={} inserted={} upserted={}",
        run_id, fetched, written.inserted_count, written.upserted_count
    );
    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let store = open_store(&config.store).await?;
    let policy = config.store.retention();

    let retention = RetentionManager::new(store.clone(), policy, config.scheduler.sweep_interval());
    retention.declare().await.context("declaring retention policy")?;
    let mut sweeper = retention.start_sweeper().await?;

    let ingestion = if config.scheduler.enabled {
        let feed = HttpFeedClient::new(&config.feed).context("building feed client")?;
        let cycle = IngestionCycle::new(Arc::new(feed), store.clone(), config.feed.page_size);
        Some(spawn_ingestion_loop(
            Arc::new(cycle),
            config.scheduler.fetch_interval(),
        ))
    } else {
        info!("ingestion loop disabled");
        None
    };

    let state = AppState::new(
        QueryService::new(store.clone(), policy),
        config.app.name.clone(),
        config.app.version.clone(),
    );
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    let served = sns_web::serve(
        listener,
        sns_web::app(state),
        shutdown_signal(),
        config.server.shutdown_grace(),
    )
    .await;

    if let Some(handle) = ingestion {
        handle.abort();
    }
    if let Err(err) = sweeper.shutdown().await {
        warn!(error = %err, "retention sweeper did not stop cleanly");
    }
    store.close().await;
    info!("shutdown complete");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
