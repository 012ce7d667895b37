use std::net::SocketAddr;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

pub const READINGS_INGESTED: &str = "leak_readings_ingested_total";
pub const READINGS_REJECTED: &str = "leak_readings_rejected_total";
pub const HTTP_INGEST_REQUESTS: &str = "leak_http_ingest_requests_total";
pub const HTTP_INGEST_FAILED: &str = "leak_http_ingest_failed_total";
pub const READINGS_PROCESSED: &str = "leak_readings_processed_total";
pub const ALERTS_EMITTED: &str = "leak_alerts_emitted_total";
pub const CAS_CONFLICTS: &str = "leak_state_cas_conflicts_total";
pub const STUCK_BATCHES: &str = "leak_stuck_batches_total";
pub const BATCH_FAILURES: &str = "leak_batch_failures_total";
pub const BATCH_DURATION: &str = "leak_batch_duration_seconds";

pub fn init(bind_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid metrics bind address: {e}"))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus metrics recorder: {e}"))?;

    // Only the first recorder can be installed, so a second set is unreachable.
    let _ = PROM_HANDLE.set(handle);

    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics_handler));

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind metrics listener");
            }
        }
    });

    Ok(())
}

async fn metrics_handler() -> String {
    PROM_HANDLE.get().map(|h| h.render()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_share_the_service_prefix() {
        let names = [
            READINGS_INGESTED,
            READINGS_REJECTED,
            HTTP_INGEST_REQUESTS,
            HTTP_INGEST_FAILED,
            READINGS_PROCESSED,
            ALERTS_EMITTED,
            CAS_CONFLICTS,
            STUCK_BATCHES,
            BATCH_FAILURES,
            BATCH_DURATION,
        ];
        for name in names {
            assert!(name.starts_with("leak_"), "{name}");
        }
        let mut unique = names.to_vec();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }
}
