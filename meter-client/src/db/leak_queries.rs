//! Read-only views over the leak monitoring tables.
//!
//! Nothing here writes; the detection service owns every mutation.

use std::collections::BTreeMap;

use anyhow::Result;
use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::db::sql_timestamp;
use crate::domain::{Alert, MeterSnapshot, Reading};

/// Readings with `ts >= since`, ordered by meter then time.
///
/// Relies on `ts` being written with [`sql_timestamp`].
pub async fn recent_readings(pool: &SqlitePool, since: OffsetDateTime, limit: u32) -> Result<Vec<Reading>> {
    let rows = sqlx::query_as::<_, Reading>(
        r#"
        SELECT sequence_id, meter_id, ts, cumulative_volume
        FROM meter_readings
        WHERE ts >= ?
        ORDER BY meter_id, ts
        LIMIT ?
        "#,
    )
    .bind(sql_timestamp(since)?)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Group a reading window per meter, keeping each meter's time order.
pub fn readings_by_meter(readings: Vec<Reading>) -> BTreeMap<String, Vec<Reading>> {
    let mut grouped: BTreeMap<String, Vec<Reading>> = BTreeMap::new();
    for r in readings {
        grouped.entry(r.meter_id.clone()).or_default().push(r);
    }
    grouped
}

/// Most recent alerts, newest first.
pub async fn recent_alerts(pool: &SqlitePool, limit: u32) -> Result<Vec<Alert>> {
    let rows = sqlx::query_as::<_, Alert>(
        r#"
        SELECT meter_id, alert_type, volume_liters, ts, created_at
        FROM leak_alerts
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Current state of every known meter, ordered by meter id.
pub async fn meter_snapshots(pool: &SqlitePool) -> Result<Vec<MeterSnapshot>> {
    let rows = sqlx::query_as::<_, MeterSnapshot>(
        r#"
        SELECT
            meter_id,
            last_volume,
            last_ts,
            continuous_flow_hours,
            night_flow_accumulated,
            last_processed_sequence_id,
            updated_at
        FROM meter_state
        ORDER BY meter_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn meter_snapshot(pool: &SqlitePool, meter_id: &str) -> Result<Option<MeterSnapshot>> {
    let row = sqlx::query_as::<_, MeterSnapshot>(
        r#"
        SELECT
            meter_id,
            last_volume,
            last_ts,
            continuous_flow_hours,
            night_flow_accumulated,
            last_processed_sequence_id,
            updated_at
        FROM meter_state
        WHERE meter_id = ?
        "#,
    )
    .bind(meter_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}
