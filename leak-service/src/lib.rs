pub mod config;
pub mod cursor;
pub mod detection;
pub mod ingest;
pub mod metrics_server;
pub mod observability;
pub mod store;

pub use cursor::{CursorWorker, Shard};
pub use detection::LeakDetector;
