//! Ingestion cursor loop.
//!
//! A [`CursorWorker`] owns one shard of the meter-id space and cycles
//! `Idle -> Fetching -> ProcessingBatch -> Idle` until shut down. Each batch
//! is fetched after the worker's cursor, readings of other shards are skipped,
//! and every owned reading goes through load, detect and compare-and-swap.
//! The cursor is checkpointed only once the whole batch has been applied, so a
//! failed batch is fetched again from the same position.

pub mod shard;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use meter_client::{Alert, Reading};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::config::CursorConfig;
use crate::detection::{LeakDetector, LeakEvent, Outcome};
use crate::metrics_server::{
    ALERTS_EMITTED, BATCH_DURATION, BATCH_FAILURES, CAS_CONFLICTS, READINGS_PROCESSED, STUCK_BATCHES,
};
use crate::store::{CasOutcome, StoreError, Stores};

pub use shard::{shard_of, Shard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Fetching,
    ProcessingBatch,
}

#[derive(thiserror::Error, Debug)]
pub enum LoopError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("reading {sequence_id} of meter {meter_id} still conflicting after {attempts} attempts")]
    StuckBatch {
        meter_id: String,
        sequence_id: i64,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub fetched: usize,
    /// Readings that initialized or advanced meter state.
    pub applied: usize,
    pub out_of_order: usize,
    pub already_applied: usize,
    /// Readings owned by other shards.
    pub skipped: usize,
    pub alerts: usize,
    pub cas_conflicts: usize,
    /// Cursor after the batch was committed.
    pub cursor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Empty,
    Processed(BatchSummary),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_cas_attempts: u32,
    pub alert_max_retries: u32,
    pub alert_retry_backoff: Duration,
}

impl From<&CursorConfig> for WorkerSettings {
    fn from(cfg: &CursorConfig) -> Self {
        Self {
            batch_size: cfg.batch_size,
            poll_interval: cfg.poll_interval(),
            max_cas_attempts: cfg.max_cas_attempts,
            alert_max_retries: cfg.alert_max_retries,
            alert_retry_backoff: Duration::from_millis(cfg.alert_retry_backoff_ms),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&CursorConfig::default())
    }
}

pub struct CursorWorker {
    name: String,
    shard: Shard,
    detector: LeakDetector,
    stores: Stores,
    settings: WorkerSettings,
    cursor: i64,
    state: LoopState,
    resumed: bool,
}

impl CursorWorker {
    pub fn new(shard: Shard, detector: LeakDetector, stores: Stores, settings: WorkerSettings) -> Self {
        Self {
            name: shard.worker_name(),
            shard,
            detector,
            stores,
            settings,
            cursor: 0,
            state: LoopState::Idle,
            resumed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Restore the cursor from its last checkpoint.
    pub async fn resume(&mut self) -> Result<i64, StoreError> {
        let stored = self.stores.cursors.load_cursor(&self.name).await?;
        self.cursor = self.cursor.max(stored.unwrap_or(0));
        self.resumed = true;
        tracing::info!(worker = %self.name, cursor = self.cursor, "cursor resumed");
        Ok(self.cursor)
    }

    /// Loop until `shutdown` is cancelled. Stops only between batches.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            worker = %self.name,
            batch_size = self.settings.batch_size,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "cursor worker starting"
        );

        while !shutdown.is_cancelled() {
            if !self.step().await {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        tracing::info!(worker = %self.name, cursor = self.cursor, "cursor worker stopped");
    }

    /// One cycle of the loop. Returns whether to sleep before the next one.
    async fn step(&mut self) -> bool {
        match self.run_once().await {
            Ok(BatchOutcome::Empty) => true,
            Ok(BatchOutcome::Processed(summary)) => {
                tracing::debug!(worker = %self.name, ?summary, "batch committed");
                false
            }
            Err(e @ LoopError::StuckBatch { .. }) => {
                metrics::counter!(STUCK_BATCHES, "worker" => self.name.clone()).increment(1);
                tracing::error!(worker = %self.name, cursor = self.cursor, error = %e, "stuck batch, cursor held");
                true
            }
            Err(LoopError::Store(e)) => {
                metrics::counter!(BATCH_FAILURES, "worker" => self.name.clone()).increment(1);
                tracing::warn!(worker = %self.name, cursor = self.cursor, error = %e, "batch aborted, retrying after poll interval");
                true
            }
        }
    }

    /// Fetch and apply one batch after the cursor.
    ///
    /// On error nothing past the cursor is committed and the cursor is unchanged.
    pub async fn run_once(&mut self) -> Result<BatchOutcome, LoopError> {
        let result = self.fetch_and_process().await;
        self.state = LoopState::Idle;
        result
    }

    async fn fetch_and_process(&mut self) -> Result<BatchOutcome, LoopError> {
        if !self.resumed {
            self.resume().await?;
        }

        self.state = LoopState::Fetching;
        let batch = self
            .stores
            .readings
            .fetch_since(self.cursor, self.settings.batch_size)
            .await?;

        let Some(max_sequence_id) = batch.iter().map(|r| r.sequence_id).max() else {
            return Ok(BatchOutcome::Empty);
        };

        self.state = LoopState::ProcessingBatch;
        let started = Instant::now();
        let mut summary = BatchSummary {
            fetched: batch.len(),
            ..BatchSummary::default()
        };

        let (owned, skipped) = group_by_meter(batch, &self.shard);
        summary.skipped = skipped;

        for (_meter_id, readings) in owned {
            for reading in &readings {
                self.apply_reading(reading, &mut summary).await?;
            }
        }

        self.stores.cursors.save_cursor(&self.name, max_sequence_id).await?;
        self.cursor = max_sequence_id;
        summary.cursor = max_sequence_id;

        metrics::histogram!(BATCH_DURATION).record(started.elapsed().as_secs_f64());
        Ok(BatchOutcome::Processed(summary))
    }

    /// Load, detect and commit one reading.
    ///
    /// Alerts are appended before the state swap: once the swap commits, a
    /// replay sees the reading as already applied and would not emit them again.
    /// A conflict after the alerts were written may therefore duplicate an alert
    /// produced by a concurrent worker, never lose one.
    async fn apply_reading(&self, reading: &Reading, summary: &mut BatchSummary) -> Result<(), LoopError> {
        let attempts = self.settings.max_cas_attempts;
        let mut persisted: Vec<LeakEvent> = Vec::new();

        for attempt in 1..=attempts {
            let prior = self.stores.states.load(&reading.meter_id).await?;
            let transition = self.detector.apply(prior.as_ref(), reading);

            if !transition.needs_write() {
                summary.already_applied += 1;
                metrics::counter!(READINGS_PROCESSED, "outcome" => transition.outcome.as_str()).increment(1);
                tracing::debug!(
                    meter_id = %reading.meter_id,
                    sequence_id = reading.sequence_id,
                    "reading already applied"
                );
                return Ok(());
            }

            let created_at = OffsetDateTime::now_utc();
            for event in &transition.events {
                if persisted.contains(event) {
                    continue;
                }
                let alert = event.clone().into_alert(&reading.meter_id, created_at);
                self.persist_alert(&alert).await?;
                persisted.push(event.clone());
                summary.alerts += 1;
                metrics::counter!(ALERTS_EMITTED, "type" => alert.alert_type.as_str()).increment(1);
                tracing::info!(
                    meter_id = %alert.meter_id,
                    alert_type = %alert.alert_type,
                    volume_liters = alert.volume_liters,
                    ts = %alert.ts,
                    "leak detected"
                );
            }

            let expected = prior.as_ref().map(|s| s.last_processed_sequence_id);
            match self.stores.states.compare_and_swap(expected, &transition.state).await? {
                CasOutcome::Swapped => {}
                CasOutcome::Conflict => {
                    summary.cas_conflicts += 1;
                    metrics::counter!(CAS_CONFLICTS).increment(1);
                    tracing::warn!(
                        meter_id = %reading.meter_id,
                        sequence_id = reading.sequence_id,
                        attempt,
                        "meter state changed concurrently, reloading"
                    );
                    continue;
                }
            }

            metrics::counter!(READINGS_PROCESSED, "outcome" => transition.outcome.as_str()).increment(1);
            match transition.outcome {
                Outcome::OutOfOrder => {
                    summary.out_of_order += 1;
                    tracing::warn!(
                        meter_id = %reading.meter_id,
                        sequence_id = reading.sequence_id,
                        ts = %reading.ts,
                        "reading not after last timestamp, state left unchanged"
                    );
                }
                _ => summary.applied += 1,
            }
            return Ok(());
        }

        Err(LoopError::StuckBatch {
            meter_id: reading.meter_id.clone(),
            sequence_id: reading.sequence_id,
            attempts,
        })
    }

    async fn persist_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        let mut attempt: u32 = 0;
        loop {
            match self.stores.alerts.append_alert(alert).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.settings.alert_max_retries => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, meter_id = %alert.meter_id, "alert append failed, retrying with backoff");
                    tokio::time::sleep(self.settings.alert_retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        meter_id = %alert.meter_id,
                        alert_type = %alert.alert_type,
                        volume_liters = alert.volume_liters,
                        ts = %alert.ts,
                        "alert append failed, giving up"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Split a batch into per-meter runs for `shard`, keeping each meter's order.
/// Returns the runs in order of first appearance and the number of skipped readings.
fn group_by_meter(batch: Vec<Reading>, shard: &Shard) -> (Vec<(String, Vec<Reading>)>, usize) {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<Reading>)> = Vec::new();
    let mut skipped = 0;

    for reading in batch {
        if !shard.owns(&reading.meter_id) {
            skipped += 1;
            continue;
        }
        match index.get(&reading.meter_id) {
            Some(&i) => groups[i].1.push(reading),
            None => {
                index.insert(reading.meter_id.clone(), groups.len());
                groups.push((reading.meter_id.clone(), vec![reading]));
            }
        }
    }

    (groups, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CursorStore, InMemoryStore, MeterStateStore, ReadingStore};
    use meter_client::AlertType;
    use std::sync::Arc;
    use time::macros::datetime;

    fn worker(store: &Arc<InMemoryStore>, batch_size: usize) -> CursorWorker {
        CursorWorker::new(
            Shard::ALL,
            LeakDetector::default(),
            Stores::shared(store.clone()),
            WorkerSettings {
                batch_size,
                ..WorkerSettings::default()
            },
        )
    }

    fn summary(outcome: BatchOutcome) -> BatchSummary {
        match outcome {
            BatchOutcome::Processed(s) => s,
            BatchOutcome::Empty => panic!("expected a processed batch"),
        }
    }

    #[test]
    fn grouping_keeps_per_meter_order() {
        let ts = datetime!(2026-01-29 12:00:00 UTC);
        let batch: Vec<Reading> = [("A", 1), ("B", 2), ("A", 3), ("C", 4), ("B", 5)]
            .into_iter()
            .map(|(m, seq)| Reading {
                sequence_id: seq,
                meter_id: m.to_string(),
                ts,
                cumulative_volume: 0.0,
            })
            .collect();

        let (groups, skipped) = group_by_meter(batch, &Shard::ALL);

        assert_eq!(skipped, 0);
        let shape: Vec<(String, Vec<i64>)> = groups
            .into_iter()
            .map(|(m, rs)| (m, rs.iter().map(|r| r.sequence_id).collect()))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("A".to_string(), vec![1, 3]),
                ("B".to_string(), vec![2, 5]),
                ("C".to_string(), vec![4]),
            ]
        );
    }

    #[tokio::test]
    async fn empty_store_yields_empty_batch() {
        let store = Arc::new(InMemoryStore::new());
        let mut w = worker(&store, 10);

        assert_eq!(w.run_once().await.unwrap(), BatchOutcome::Empty);
        assert_eq!(w.cursor(), 0);
        assert_eq!(w.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn night_scenario_emits_one_alert_and_advances_cursor() {
        let store = Arc::new(InMemoryStore::new());
        for (ts, v) in [
            (datetime!(2026-01-29 03:00:00 UTC), 1000.0),
            (datetime!(2026-01-29 03:15:00 UTC), 1001.2),
            (datetime!(2026-01-29 03:30:00 UTC), 1002.5),
        ] {
            store.append_reading("NIGHT-001", ts, v).await.unwrap();
        }
        let mut w = worker(&store, 10);

        let s = summary(w.run_once().await.unwrap());

        assert_eq!(s.fetched, 3);
        assert_eq!(s.applied, 3);
        assert_eq!(s.alerts, 1);
        assert_eq!(s.cursor, 3);
        let alerts = store.alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::NightFlowLeak);
        assert!((alerts[0].volume_liters - 2.5).abs() < 1e-9);
        assert_eq!(store.load_cursor("shard-0-of-1").await.unwrap(), Some(3));
        assert_eq!(w.run_once().await.unwrap(), BatchOutcome::Empty);
    }

    #[tokio::test]
    async fn batches_page_through_backlog_with_monotonic_cursor() {
        let store = Arc::new(InMemoryStore::new());
        let t0 = datetime!(2026-01-29 12:00:00 UTC);
        for i in 0..7i64 {
            store
                .append_reading("M1", t0 + time::Duration::hours(i), 10.0 + i as f64)
                .await
                .unwrap();
        }
        let mut w = worker(&store, 3);

        let mut cursors = Vec::new();
        while let BatchOutcome::Processed(s) = w.run_once().await.unwrap() {
            cursors.push(s.cursor);
        }

        assert_eq!(cursors, vec![3, 6, 7]);
        let state = store.load("M1").await.unwrap().unwrap();
        assert_eq!(state.last_processed_sequence_id, 7);
        assert_eq!(state.continuous_flow_hours, 6.0);
    }

    #[tokio::test]
    async fn restart_reapplies_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let t0 = datetime!(2026-01-29 03:00:00 UTC);
        store.append_reading("M1", t0, 1000.0).await.unwrap();
        store
            .append_reading("M1", t0 + time::Duration::minutes(15), 1003.0)
            .await
            .unwrap();

        let mut first = worker(&store, 10);
        summary(first.run_once().await.unwrap());
        let state_before = store.load("M1").await.unwrap();

        // A replacement worker that lost its checkpoint replays the log.
        let mut replay = CursorWorker::new(
            Shard::ALL,
            LeakDetector::default(),
            Stores::shared(store.clone()),
            WorkerSettings::default(),
        );
        replay.cursor = 0;
        replay.resumed = true;
        let s = summary(replay.run_once().await.unwrap());

        assert_eq!(s.already_applied, 2);
        assert_eq!(s.alerts, 0);
        assert_eq!(store.alerts().unwrap().len(), 1);
        assert_eq!(store.load("M1").await.unwrap(), state_before);
    }

    #[tokio::test]
    async fn out_of_order_reading_is_recorded_and_passed() {
        let store = Arc::new(InMemoryStore::new());
        store
            .append_reading("M1", datetime!(2026-01-29 12:00:00 UTC), 100.0)
            .await
            .unwrap();
        store
            .append_reading("M1", datetime!(2026-01-29 11:00:00 UTC), 150.0)
            .await
            .unwrap();
        let mut w = worker(&store, 10);

        let s = summary(w.run_once().await.unwrap());

        assert_eq!(s.out_of_order, 1);
        assert_eq!(s.cursor, 2);
        assert_eq!(store.readings().unwrap().len(), 2);
        let state = store.load("M1").await.unwrap().unwrap();
        assert_eq!(state.last_volume, Some(100.0));
        assert_eq!(state.last_processed_sequence_id, 2);
    }

    #[tokio::test]
    async fn foreign_shard_readings_are_skipped_but_passed() {
        let store = Arc::new(InMemoryStore::new());
        let ts = datetime!(2026-01-29 12:00:00 UTC);
        let meters: Vec<String> = (0..20).map(|n| format!("MTR-{n:03}")).collect();
        for m in &meters {
            store.append_reading(m, ts, 1.0).await.unwrap();
        }

        let shard = Shard::new(1, 2).unwrap();
        let mut w = CursorWorker::new(shard, LeakDetector::default(), Stores::shared(store.clone()), WorkerSettings::default());
        let s = summary(w.run_once().await.unwrap());

        let owned = meters.iter().filter(|m| shard.owns(m)).count();
        assert_eq!(s.applied, owned);
        assert_eq!(s.skipped, meters.len() - owned);
        assert_eq!(s.cursor, meters.len() as i64);
        for m in &meters {
            assert_eq!(store.load(m).await.unwrap().is_some(), shard.owns(m), "{m}");
        }
        assert_eq!(w.name(), "shard-1-of-2");
    }
}
