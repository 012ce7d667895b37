use time::OffsetDateTime;

/// Running detector state for a single meter.
///
/// `last_processed_sequence_id` is the sequence id of the most recent reading
/// folded into this row and doubles as the compare-and-swap version.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MeterState {
    pub meter_id: String,
    pub last_volume: Option<f64>,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub last_ts: Option<OffsetDateTime>,
    pub continuous_flow_hours: f64,
    pub night_flow_accumulated: f64,
    pub last_processed_sequence_id: i64,
}

impl MeterState {
    /// State for a meter whose first reading has just been seen.
    pub fn first_reading(meter_id: &str, sequence_id: i64, ts: OffsetDateTime, volume: f64) -> Self {
        Self {
            meter_id: meter_id.to_string(),
            last_volume: Some(volume),
            last_ts: Some(ts),
            continuous_flow_hours: 0.0,
            night_flow_accumulated: 0.0,
            last_processed_sequence_id: sequence_id,
        }
    }
}

/// Read-only view of a meter state row, as served to dashboards.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MeterSnapshot {
    #[sqlx(flatten)]
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub state: MeterState,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub updated_at: OffsetDateTime,
}
