use time::OffsetDateTime;

/// One stored cumulative-volume reading.
///
/// `sequence_id` is assigned by the reading store at insert time and is the
/// only ordering the cursor loop relies on.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Reading {
    pub sequence_id: i64,
    pub meter_id: String,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    pub cumulative_volume: f64,
}
