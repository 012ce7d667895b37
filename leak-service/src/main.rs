use anyhow::Result;
use leak_service::{
    config::AppConfig,
    cursor::{CursorWorker, Shard, WorkerSettings},
    detection::LeakDetector,
    ingest::{self, ReadingIngest},
    metrics_server,
    observability,
    store::{SqliteStore, Stores},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Configuration errors are the only fatal ones.
    let cfg = AppConfig::load()?;
    let detector = LeakDetector::new(&cfg.detection)?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store = Arc::new(SqliteStore::connect(&cfg.database.url, cfg.database.max_connections).await?);
    let stores = Stores::shared(store.clone());

    if let Some(ingest_cfg) = &cfg.ingest {
        ingest::http::serve(&ingest_cfg.http_bind_addr, ReadingIngest::new(store.clone())).await?;
    }

    let shutdown = CancellationToken::new();
    let settings = WorkerSettings::from(&cfg.cursor);
    let mut workers = Vec::new();
    for index in cfg.cursor.assigned_shards() {
        let shard = Shard::new(index, cfg.cursor.shard_count)
            .ok_or_else(|| anyhow::anyhow!("shard {index} outside 0..{}", cfg.cursor.shard_count))?;
        let worker = CursorWorker::new(shard, detector.clone(), stores.clone(), settings.clone());
        workers.push(tokio::spawn(worker.run(shutdown.clone())));
    }
    tracing::info!(workers = workers.len(), shard_count = cfg.cursor.shard_count, "leak detection running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, stopping workers between batches");
    shutdown.cancel();

    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "cursor worker task failed");
        }
    }

    Ok(())
}
