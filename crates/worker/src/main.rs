//! CLI entry point for the time-series ingestion worker: connect to every
//! backend collaborator, open the broker, then run the consumer loop until
//! SIGTERM.
use std::sync::Arc;

use cache::{
    Cache,
    MemcacheClient,
};
use clap::Parser;
use common::errors::MainError;
use errors::ErrorMetadata;
use ingest::IngestContext;
use lock::{
    DistributedLock,
    RedisLock,
};
use runtime::prod::ProdRuntime;
use store::{
    MongoStore,
    Store,
};
use worker::{
    broker::BrokerClient,
    config::WorkerConfig,
    consumer::{
        self,
        ShutdownFlag,
    },
};

fn main() -> Result<(), MainError> {
    let config = WorkerConfig::parse();
    if std::env::var_os("LOG_FORMAT").is_none() {
        std::env::set_var("LOG_FORMAT", &config.log_format);
    }
    if let Some(ref level) = config.log_level {
        if std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var("RUST_LOG", level);
        }
    }
    let _tracing_guard = cmd_util::env::config_service();
    tracing::info!("starting ts-ingest-worker");

    let sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.as_deref().and_then(|dsn| dsn.parse().ok()),
        release: Some(format!("ts-ingest-worker@{}", env!("CARGO_PKG_VERSION")).into()),
        ..Default::default()
    });
    if sentry.is_enabled() {
        tracing::info!("Sentry is enabled");
    } else {
        tracing::info!("Sentry is not enabled; set --sentry-dsn to report errors");
    }
    if config.metrics_bind_address.is_some() {
        tracing::info!(
            "metrics-bind-address is accepted but this worker does not itself serve a scrape \
             endpoint; point an external exporter at the process if you need one"
        );
    }

    let tokio_rt = ProdRuntime::init_tokio()?;
    let runtime = ProdRuntime::new(&tokio_rt);
    runtime.block_on(run(config))?;

    Ok(())
}

/// Watch for SIGTERM/SIGHUP and flip `shutdown` on SIGTERM. Runs for the
/// life of the process; the consumer loop observes the flag at its next
/// iteration boundary rather than being torn down out from under an
/// in-flight batch.
async fn watch_signals(shutdown: ShutdownFlag) -> anyhow::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down after the in-flight batch");
                shutdown.trigger();
                return Ok(());
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, ignoring");
            }
        }
    }
}

/// Connect every backend collaborator, load the data-type registry, and run
/// the consumer loop until SIGTERM.
async fn run(config: WorkerConfig) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(
        MongoStore::connect(&config.mongo_uri())
            .await
            .map_err(|e| {
                anyhow::Error::new(ErrorMetadata::operational_internal_server_error()).context(e)
            })?,
    );
    let cache: Arc<dyn Cache> = Arc::new(MemcacheClient::connect(&config.memcache_url())?);
    let lock: Arc<dyn DistributedLock> = Arc::new(RedisLock::connect(&config.redis_url()).await?);

    let ctx = IngestContext::new(store.clone(), cache, lock, config.ignore_databases.clone());
    ctx.registry.refresh(store.as_ref()).await?;

    let mut broker = BrokerClient::connect(&config, *common::knobs::QUEUE_PREFETCH_COUNT).await?;
    let shutdown = ShutdownFlag::new();
    let signal_handle = tokio::spawn(watch_signals(shutdown.clone()));

    consumer::run(&ctx, &mut broker, &shutdown).await;

    signal_handle.abort();
    Ok(())
}
