use std::str::FromStr;

use async_trait::async_trait;
use meter_client::{db::sql_timestamp, Alert, MeterState, Reading};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use time::OffsetDateTime;

use super::{AlertStore, CasOutcome, CursorStore, MeterStateStore, ReadingStore, StoreError, StoreResult};

/// SQLite-backed implementation of every store contract.
///
/// Every time column is written with [`sql_timestamp`], so text comparison
/// on it matches time order.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if needed.
    ///
    /// In-memory URLs must use a single connection; each connection would
    /// otherwise see its own empty database.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid sqlite url '{url}': {e}")))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect sqlite: {e}")))?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        meter_client::db::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ReadingStore for SqliteStore {
    async fn append_reading(&self, meter_id: &str, ts: OffsetDateTime, cumulative_volume: f64) -> StoreResult<i64> {
        let result = sqlx::query("INSERT INTO meter_readings (meter_id, ts, cumulative_volume) VALUES (?, ?, ?)")
            .bind(meter_id)
            .bind(sql_timestamp(ts)?)
            .bind(cumulative_volume)
            .execute(&self.pool)
            .await?;

        Ok(result.last_insert_rowid())
    }

    async fn fetch_since(&self, after: i64, limit: usize) -> StoreResult<Vec<Reading>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, Reading>(
            r#"
            SELECT sequence_id, meter_id, ts, cumulative_volume
            FROM meter_readings
            WHERE sequence_id > ?
            ORDER BY sequence_id ASC
            LIMIT ?
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl MeterStateStore for SqliteStore {
    async fn load(&self, meter_id: &str) -> StoreResult<Option<MeterState>> {
        let row = sqlx::query_as::<_, MeterState>(
            r#"
            SELECT
                meter_id,
                last_volume,
                last_ts,
                continuous_flow_hours,
                night_flow_accumulated,
                last_processed_sequence_id
            FROM meter_state
            WHERE meter_id = ?
            "#,
        )
        .bind(meter_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn compare_and_swap(&self, expected: Option<i64>, new_state: &MeterState) -> StoreResult<CasOutcome> {
        let now = sql_timestamp(OffsetDateTime::now_utc())?;
        let last_ts = new_state.last_ts.map(sql_timestamp).transpose()?;

        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO meter_state (
                        meter_id,
                        last_volume,
                        last_ts,
                        continuous_flow_hours,
                        night_flow_accumulated,
                        last_processed_sequence_id,
                        updated_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(meter_id) DO NOTHING
                    "#,
                )
                .bind(&new_state.meter_id)
                .bind(new_state.last_volume)
                .bind(last_ts)
                .bind(new_state.continuous_flow_hours)
                .bind(new_state.night_flow_accumulated)
                .bind(new_state.last_processed_sequence_id)
                .bind(&now)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE meter_state
                    SET last_volume = ?,
                        last_ts = ?,
                        continuous_flow_hours = ?,
                        night_flow_accumulated = ?,
                        last_processed_sequence_id = ?,
                        updated_at = ?
                    WHERE meter_id = ?
                      AND last_processed_sequence_id = ?
                    "#,
                )
                .bind(new_state.last_volume)
                .bind(last_ts)
                .bind(new_state.continuous_flow_hours)
                .bind(new_state.night_flow_accumulated)
                .bind(new_state.last_processed_sequence_id)
                .bind(&now)
                .bind(&new_state.meter_id)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 1 {
            Ok(CasOutcome::Swapped)
        } else {
            Ok(CasOutcome::Conflict)
        }
    }
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn append_alert(&self, alert: &Alert) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO leak_alerts (meter_id, alert_type, volume_liters, ts, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.meter_id)
        .bind(alert.alert_type.as_str())
        .bind(alert.volume_liters)
        .bind(sql_timestamp(alert.ts)?)
        .bind(sql_timestamp(alert.created_at)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CursorStore for SqliteStore {
    async fn load_cursor(&self, worker: &str) -> StoreResult<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT sequence_id FROM cursor_checkpoints WHERE worker = ?")
            .bind(worker)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn save_cursor(&self, worker: &str, sequence_id: i64) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cursor_checkpoints (worker, sequence_id, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(worker) DO UPDATE
            SET sequence_id = excluded.sequence_id,
                updated_at = excluded.updated_at
            WHERE excluded.sequence_id > cursor_checkpoints.sequence_id
            "#,
        )
        .bind(worker)
        .bind(sequence_id)
        .bind(sql_timestamp(OffsetDateTime::now_utc())?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
