//! `submit_reading`: the only write path into the reading store.
//!
//! Malformed readings are rejected here and never stored. Readings that are
//! merely out of order are accepted; the detector neutralises them later.

pub mod http;

use std::sync::Arc;

use time::{format_description::well_known::Rfc3339, macros::datetime, OffsetDateTime};

use crate::metrics_server::{READINGS_INGESTED, READINGS_REJECTED};
use crate::store::{ReadingStore, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("invalid reading: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parse an RFC3339 timestamp as sent by meters.
pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime, IngestError> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339)
        .map_err(|e| IngestError::Invalid(format!("invalid timestamp '{raw}': {e}")))
}

/// Pure validation of one reading.
///
/// Rules:
/// - meter id must be non-empty.
/// - cumulative volume must be finite and non-negative.
/// - ts must be within a broad sanity window [2000-01-01, 2100-01-01].
pub fn validate_reading(meter_id: &str, ts: OffsetDateTime, cumulative_volume: f64) -> Result<(), IngestError> {
    if meter_id.trim().is_empty() {
        return Err(IngestError::Invalid("meter_id must not be empty".to_string()));
    }

    if !cumulative_volume.is_finite() {
        return Err(IngestError::Invalid("cumulative_volume must be finite".to_string()));
    }
    if cumulative_volume < 0.0 {
        return Err(IngestError::Invalid("cumulative_volume must be non-negative".to_string()));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);

    if ts < min_ts || ts > max_ts {
        return Err(IngestError::Invalid("timestamp out of allowed range".to_string()));
    }

    Ok(())
}

#[derive(Clone)]
pub struct ReadingIngest {
    store: Arc<dyn ReadingStore>,
}

impl ReadingIngest {
    pub fn new(store: Arc<dyn ReadingStore>) -> Self {
        Self { store }
    }

    /// Validate and store one reading, returning its sequence id.
    pub async fn submit_reading(
        &self,
        meter_id: &str,
        ts: OffsetDateTime,
        cumulative_volume: f64,
    ) -> Result<i64, IngestError> {
        if let Err(e) = validate_reading(meter_id, ts, cumulative_volume) {
            metrics::counter!(READINGS_REJECTED).increment(1);
            tracing::debug!(meter_id, error = %e, "reading rejected");
            return Err(e);
        }

        let sequence_id = self.store.append_reading(meter_id.trim(), ts, cumulative_volume).await?;
        metrics::counter!(READINGS_INGESTED).increment(1);
        Ok(sequence_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn rejects_non_finite_and_negative_volume() {
        let ts = datetime!(2026-01-29 12:00:00 UTC);
        for v in [f64::NAN, f64::INFINITY, -0.5] {
            assert!(matches!(validate_reading("M1", ts, v), Err(IngestError::Invalid(_))), "{v}");
        }
        assert!(validate_reading("M1", ts, 0.0).is_ok());
    }

    #[test]
    fn rejects_empty_meter_and_out_of_range_ts() {
        let ts = datetime!(2026-01-29 12:00:00 UTC);
        assert!(validate_reading("  ", ts, 1.0).is_err());
        assert!(validate_reading("M1", datetime!(1800-01-01 00:00:00 UTC), 1.0).is_err());
    }

    #[test]
    fn parses_rfc3339_and_rejects_garbage() {
        let ts = parse_timestamp("2026-01-29T03:15:00+01:00").unwrap();
        assert_eq!(ts, datetime!(2026-01-29 02:15:00 UTC));
        assert!(matches!(parse_timestamp("yesterday"), Err(IngestError::Invalid(_))));
    }

    #[tokio::test]
    async fn invalid_reading_never_reaches_the_store() {
        let store = Arc::new(InMemoryStore::new());
        let ingest = ReadingIngest::new(store.clone());
        let ts = datetime!(2026-01-29 12:00:00 UTC);

        assert!(ingest.submit_reading("M1", ts, f64::NAN).await.is_err());
        assert_eq!(ingest.submit_reading("M1", ts, 10.0).await.unwrap(), 1);
        assert_eq!(ingest.submit_reading("M1", ts - time::Duration::hours(1), 9.0).await.unwrap(), 2);
        assert_eq!(store.readings().unwrap().len(), 2);
    }
}
