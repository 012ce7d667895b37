pub mod leak_queries;
pub mod schema;
pub mod timestamp;

pub use leak_queries::{meter_snapshot, meter_snapshots, readings_by_meter, recent_alerts, recent_readings};
pub use schema::init_schema;
pub use timestamp::sql_timestamp;
