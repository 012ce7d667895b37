use sqlx::SqlitePool;

/// DDL for the leak monitoring tables. Every statement is idempotent.
///
/// - `meter_readings`: append-only; `sequence_id` is the cursor key. No
///   uniqueness on `(meter_id, ts)` so duplicates and out-of-order readings are
///   kept for audit.
/// - `meter_state`: one row per meter, versioned by `last_processed_sequence_id`.
/// - `leak_alerts`: append-only.
/// - `cursor_checkpoints`: last committed sequence id per worker.
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS meter_readings (
        sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
        meter_id TEXT NOT NULL,
        ts TEXT NOT NULL,
        cumulative_volume REAL NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS meter_state (
        meter_id TEXT PRIMARY KEY,
        last_volume REAL,
        last_ts TEXT,
        continuous_flow_hours REAL NOT NULL DEFAULT 0,
        night_flow_accumulated REAL NOT NULL DEFAULT 0,
        last_processed_sequence_id INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS leak_alerts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        meter_id TEXT NOT NULL,
        alert_type TEXT NOT NULL,
        volume_liters REAL NOT NULL,
        ts TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cursor_checkpoints (
        worker TEXT PRIMARY KEY,
        sequence_id INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_meter_readings_meter_ts ON meter_readings(meter_id, ts)",
    "CREATE INDEX IF NOT EXISTS idx_meter_readings_ts ON meter_readings(ts)",
    "CREATE INDEX IF NOT EXISTS idx_leak_alerts_meter_id ON leak_alerts(meter_id)",
    "CREATE INDEX IF NOT EXISTS idx_leak_alerts_created_at ON leak_alerts(created_at)",
];

pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for stmt in SCHEMA {
        sqlx::query(stmt).execute(pool).await?;
    }
    Ok(())
}
