//! In-memory implementation of every store contract.
//!
//! Deterministic and test-friendly; state is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use meter_client::{Alert, MeterState, Reading};
use time::{OffsetDateTime, UtcOffset};

use super::{AlertStore, CasOutcome, CursorStore, MeterStateStore, ReadingStore, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    next_sequence_id: i64,
    readings: BTreeMap<i64, Reading>,
    states: HashMap<String, MeterState>,
    alerts: Vec<Alert>,
    cursors: HashMap<String, i64>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".to_string()))
    }

    pub fn alerts(&self) -> StoreResult<Vec<Alert>> {
        Ok(self.lock()?.alerts.clone())
    }

    pub fn readings(&self) -> StoreResult<Vec<Reading>> {
        Ok(self.lock()?.readings.values().cloned().collect())
    }

    /// Drop readings below `sequence_id`, as a retention job would.
    pub fn delete_readings_before(&self, sequence_id: i64) -> StoreResult<usize> {
        let mut guard = self.lock()?;
        let kept = guard.readings.split_off(&sequence_id);
        let removed = guard.readings.len();
        guard.readings = kept;
        Ok(removed)
    }
}

#[async_trait]
impl ReadingStore for InMemoryStore {
    async fn append_reading(&self, meter_id: &str, ts: OffsetDateTime, cumulative_volume: f64) -> StoreResult<i64> {
        let mut guard = self.lock()?;
        guard.next_sequence_id += 1;
        let sequence_id = guard.next_sequence_id;
        guard.readings.insert(
            sequence_id,
            Reading {
                sequence_id,
                meter_id: meter_id.to_string(),
                ts: ts.to_offset(UtcOffset::UTC),
                cumulative_volume,
            },
        );
        Ok(sequence_id)
    }

    async fn fetch_since(&self, after: i64, limit: usize) -> StoreResult<Vec<Reading>> {
        let guard = self.lock()?;
        Ok(guard
            .readings
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[async_trait]
impl MeterStateStore for InMemoryStore {
    async fn load(&self, meter_id: &str) -> StoreResult<Option<MeterState>> {
        Ok(self.lock()?.states.get(meter_id).cloned())
    }

    async fn compare_and_swap(&self, expected: Option<i64>, new_state: &MeterState) -> StoreResult<CasOutcome> {
        let mut guard = self.lock()?;
        let current = guard
            .states
            .get(&new_state.meter_id)
            .map(|s| s.last_processed_sequence_id);

        if current != expected {
            return Ok(CasOutcome::Conflict);
        }

        guard.states.insert(new_state.meter_id.clone(), new_state.clone());
        Ok(CasOutcome::Swapped)
    }
}

#[async_trait]
impl AlertStore for InMemoryStore {
    async fn append_alert(&self, alert: &Alert) -> StoreResult<()> {
        self.lock()?.alerts.push(alert.clone());
        Ok(())
    }
}

#[async_trait]
impl CursorStore for InMemoryStore {
    async fn load_cursor(&self, worker: &str) -> StoreResult<Option<i64>> {
        Ok(self.lock()?.cursors.get(worker).copied())
    }

    async fn save_cursor(&self, worker: &str, sequence_id: i64) -> StoreResult<()> {
        let mut guard = self.lock()?;
        let entry = guard.cursors.entry(worker.to_string()).or_insert(sequence_id);
        if sequence_id > *entry {
            *entry = sequence_id;
        }
        Ok(())
    }
}
