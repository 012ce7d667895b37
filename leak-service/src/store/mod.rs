//! Persistence contracts used by the cursor loop.
//!
//! - [`ReadingStore`]: append-only readings, keyed by an increasing sequence id.
//! - [`MeterStateStore`]: one row per meter, mutated only by compare-and-swap
//!   on the previously observed `last_processed_sequence_id`.
//! - [`AlertStore`]: append-only leak alerts.
//! - [`CursorStore`]: last committed sequence id per worker.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use meter_client::{Alert, MeterState, Reading};
use time::OffsetDateTime;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
                Self::Corrupt(e.to_string())
            }
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<time::error::Format> for StoreError {
    fn from(e: time::error::Format) -> Self {
        Self::Corrupt(format!("unencodable timestamp: {e}"))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// The stored version no longer matches the expected one.
    Conflict,
}

#[async_trait::async_trait]
pub trait ReadingStore: Send + Sync {
    /// Store a reading and return its sequence id.
    async fn append_reading(&self, meter_id: &str, ts: OffsetDateTime, cumulative_volume: f64) -> StoreResult<i64>;

    /// Up to `limit` readings with `sequence_id > after`, ascending.
    async fn fetch_since(&self, after: i64, limit: usize) -> StoreResult<Vec<Reading>>;
}

#[async_trait::async_trait]
pub trait MeterStateStore: Send + Sync {
    async fn load(&self, meter_id: &str) -> StoreResult<Option<MeterState>>;

    /// Replace the row for `new_state.meter_id` only if its current
    /// `last_processed_sequence_id` equals `expected`. `None` expects no row.
    async fn compare_and_swap(&self, expected: Option<i64>, new_state: &MeterState) -> StoreResult<CasOutcome>;
}

#[async_trait::async_trait]
pub trait AlertStore: Send + Sync {
    async fn append_alert(&self, alert: &Alert) -> StoreResult<()>;
}

#[async_trait::async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(&self, worker: &str) -> StoreResult<Option<i64>>;

    /// Advance the worker's cursor. A value not above the stored one is ignored.
    async fn save_cursor(&self, worker: &str, sequence_id: i64) -> StoreResult<()>;
}

/// The four stores a cursor worker writes through.
#[derive(Clone)]
pub struct Stores {
    pub readings: Arc<dyn ReadingStore>,
    pub states: Arc<dyn MeterStateStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub cursors: Arc<dyn CursorStore>,
}

impl Stores {
    /// Use one backend for every contract.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ReadingStore + MeterStateStore + AlertStore + CursorStore + 'static,
    {
        Self {
            readings: store.clone(),
            states: store.clone(),
            alerts: store.clone(),
            cursors: store,
        }
    }
}
