use anyhow::Result;
use leak_service::{config::AppConfig, observability, store::SqliteStore};
use meter_client::db;
use std::env;
use time::{Duration, OffsetDateTime};

/// Print recent alerts and the current meter states.
///
/// usage: leak_report [--json] [alert_limit] [reading_window_hours]
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let json = match args.first() {
        Some(flag) if flag == "--json" => {
            args.remove(0);
            true
        }
        _ => false,
    };
    let alert_limit: u32 = args.first().map(|s| s.parse()).transpose()?.unwrap_or(50);
    let window_hours: i64 = args.get(1).map(|s| s.parse()).transpose()?.unwrap_or(2);

    let cfg = AppConfig::load()?;
    let store = SqliteStore::connect(&cfg.database.url, 1).await?;
    let pool = store.pool();

    let alerts = db::recent_alerts(pool, alert_limit).await?;
    let since = OffsetDateTime::now_utc() - Duration::hours(window_hours);
    let readings = db::readings_by_meter(db::recent_readings(pool, since, 10_000).await?);
    let meters = db::meter_snapshots(pool).await?;

    if json {
        let report = serde_json::json!({
            "alerts": alerts,
            "meters": meters,
            "readings": readings,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("recent alerts (newest first):");
    for alert in &alerts {
        println!(
            "  {}  {:<12} {:<22} {:>10.3} L  (reading at {})",
            alert.created_at, alert.meter_id, alert.alert_type, alert.volume_liters, alert.ts
        );
    }

    println!("meters:");
    for snapshot in &meters {
        let s = &snapshot.state;
        let recent = readings.get(&s.meter_id).map_or(0, Vec::len);
        println!(
            "  {:<12} volume={:<12} continuous_h={:<8.3} night_l={:<8.3} seq={} recent_readings={} updated={}",
            s.meter_id,
            s.last_volume.map_or_else(|| "-".to_string(), |v| format!("{v:.3}")),
            s.continuous_flow_hours,
            s.night_flow_accumulated,
            s.last_processed_sequence_id,
            recent,
            snapshot.updated_at
        );
    }

    Ok(())
}
