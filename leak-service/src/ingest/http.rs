use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{parse_timestamp, validate_reading, ReadingIngest};
use crate::metrics_server::{HTTP_INGEST_FAILED, HTTP_INGEST_REQUESTS, READINGS_REJECTED};

#[derive(Debug, Deserialize)]
pub struct IncomingReading {
    pub meter_id: String,
    /// RFC3339.
    pub timestamp: String,
    pub cumulative_volume: f64,
}

#[derive(Debug, Serialize)]
struct Accepted {
    sequence_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct Rejected {
    index: usize,
    error: String,
}

pub fn router(ingest: ReadingIngest) -> Router {
    Router::new()
        .route("/readings", post(ingest_readings))
        .with_state(ingest)
}

pub async fn serve(bind_addr: &str, ingest: ReadingIngest) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid ingest bind addr: {e}"))?;
    let app = router(ingest);

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "reading ingest listening");
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "reading ingest server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind reading ingest listener");
            }
        }
    });

    Ok(())
}

/// Accepts a JSON array of readings.
///
/// The whole request is validated before anything is stored: any malformed
/// entry yields 422 with per-index errors. On a store failure the ids stored
/// so far are returned with 503.
async fn ingest_readings(State(ingest): State<ReadingIngest>, Json(payload): Json<Vec<IncomingReading>>) -> Response {
    metrics::counter!(HTTP_INGEST_REQUESTS).increment(1);

    let mut parsed = Vec::with_capacity(payload.len());
    let mut errors = Vec::new();
    for (index, incoming) in payload.into_iter().enumerate() {
        let checked = parse_timestamp(&incoming.timestamp)
            .and_then(|ts| validate_reading(&incoming.meter_id, ts, incoming.cumulative_volume).map(|()| ts));
        match checked {
            Ok(ts) => parsed.push((incoming.meter_id, ts, incoming.cumulative_volume)),
            Err(e) => errors.push(Rejected {
                index,
                error: e.to_string(),
            }),
        }
    }

    if !errors.is_empty() {
        metrics::counter!(READINGS_REJECTED).increment(errors.len() as u64);
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "errors": errors })),
        )
            .into_response();
    }

    let mut sequence_ids = Vec::with_capacity(parsed.len());
    for (meter_id, ts, volume) in parsed {
        match ingest.submit_reading(&meter_id, ts, volume).await {
            Ok(id) => sequence_ids.push(id),
            Err(e) => {
                tracing::error!(error = %e, stored = sequence_ids.len(), "reading ingest failed");
                metrics::counter!(HTTP_INGEST_FAILED).increment(1);
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "error": e.to_string(), "sequence_ids": sequence_ids })),
                )
                    .into_response();
            }
        }
    }

    Json(Accepted { sequence_ids }).into_response()
}
