//! Per-meter leak detection.
//!
//! [`LeakDetector::apply`] is a pure transition from the prior meter state and
//! one reading to the next state plus zero or more leak events. It performs no
//! I/O and holds no mutable state, so a single detector can be shared across
//! workers.
//!
//! Two heuristics run on every accepted reading:
//! - continuous flow: hours of consecutive readings whose delta exceeds the
//!   minimum flow threshold; fires once the streak reaches the hour threshold,
//!   then restarts the streak.
//! - night flow: volume accumulated by readings whose local hour falls in the
//!   night window; fires once the accumulated volume reaches the threshold,
//!   then restarts the accumulator. Readings outside the window leave it as is.

use meter_client::{Alert, AlertType, MeterState, Reading};
use time::{OffsetDateTime, UtcOffset};

use crate::config::{ConfigError, DetectionConfig};

/// Absorbs float error from summing many fractional hours.
const ACCUMULATION_EPSILON: f64 = 1e-9;

/// How a reading was folded into meter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// First reading for the meter; state created, no heuristics ran.
    Initialized,
    /// Heuristics ran and state advanced.
    Applied,
    /// Timestamp not after the stored one. Only the sequence id advances.
    OutOfOrder,
    /// Sequence id already incorporated; state returned unchanged.
    AlreadyApplied,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Applied => "applied",
            Self::OutOfOrder => "out_of_order",
            Self::AlreadyApplied => "already_applied",
        }
    }
}

/// A leak detected on one reading, not yet stamped for storage.
#[derive(Debug, Clone, PartialEq)]
pub struct LeakEvent {
    pub alert_type: AlertType,
    pub volume_liters: f64,
    pub ts: OffsetDateTime,
}

impl LeakEvent {
    pub fn into_alert(self, meter_id: &str, created_at: OffsetDateTime) -> Alert {
        Alert {
            meter_id: meter_id.to_string(),
            alert_type: self.alert_type,
            volume_liters: self.volume_liters,
            ts: self.ts,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: MeterState,
    /// Continuous-flow first, then night-flow, when both fire.
    pub events: Vec<LeakEvent>,
    pub outcome: Outcome,
}

impl Transition {
    /// Whether `state` differs from the prior state and must be persisted.
    pub fn needs_write(&self) -> bool {
        self.outcome != Outcome::AlreadyApplied
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeakDetector {
    min_flow_threshold: f64,
    continuous_hours_threshold: f64,
    night_start_hour: u8,
    night_end_hour: u8,
    night_threshold: f64,
    local_offset: UtcOffset,
}

impl LeakDetector {
    pub fn new(cfg: &DetectionConfig) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let local_offset = UtcOffset::from_whole_seconds(cfg.utc_offset_minutes * 60)
            .map_err(|_| ConfigError::InvalidUtcOffset(cfg.utc_offset_minutes))?;

        Ok(Self {
            min_flow_threshold: cfg.min_flow_threshold,
            continuous_hours_threshold: cfg.continuous_hours_threshold,
            night_start_hour: cfg.night_start_hour,
            night_end_hour: cfg.night_end_hour,
            night_threshold: cfg.night_threshold,
            local_offset,
        })
    }

    /// Whether `ts` falls in the half-open local night window.
    pub fn is_night(&self, ts: OffsetDateTime) -> bool {
        let hour = ts.to_offset(self.local_offset).hour();
        (self.night_start_hour..self.night_end_hour).contains(&hour)
    }

    pub fn apply(&self, prior: Option<&MeterState>, reading: &Reading) -> Transition {
        debug_assert!(prior.map_or(true, |s| s.meter_id == reading.meter_id));

        let Some(prior) = prior else {
            return self.initialize(reading);
        };

        if reading.sequence_id <= prior.last_processed_sequence_id {
            return Transition {
                state: prior.clone(),
                events: Vec::new(),
                outcome: Outcome::AlreadyApplied,
            };
        }

        // A row without a baseline (e.g. reset by an operator) restarts like a first reading.
        let (Some(last_volume), Some(last_ts)) = (prior.last_volume, prior.last_ts) else {
            return self.initialize(reading);
        };

        let hours = (reading.ts - last_ts).as_seconds_f64() / 3600.0;
        if hours <= 0.0 {
            return Transition {
                state: MeterState {
                    last_processed_sequence_id: reading.sequence_id,
                    ..prior.clone()
                },
                events: Vec::new(),
                outcome: Outcome::OutOfOrder,
            };
        }

        // Negative only after a meter reset or replacement.
        let delta = (reading.cumulative_volume - last_volume).max(0.0);

        let mut next = prior.clone();
        let mut events = Vec::with_capacity(2);

        if delta > self.min_flow_threshold {
            next.continuous_flow_hours += hours;
        } else {
            next.continuous_flow_hours = 0.0;
        }
        if next.continuous_flow_hours > 0.0
            && next.continuous_flow_hours + ACCUMULATION_EPSILON >= self.continuous_hours_threshold
        {
            events.push(LeakEvent {
                alert_type: AlertType::ContinuousFlowLeak,
                volume_liters: delta,
                ts: reading.ts,
            });
            next.continuous_flow_hours = 0.0;
        }

        if self.is_night(reading.ts) {
            next.night_flow_accumulated += delta;
        }
        if next.night_flow_accumulated + ACCUMULATION_EPSILON >= self.night_threshold
            && next.night_flow_accumulated > 0.0
        {
            events.push(LeakEvent {
                alert_type: AlertType::NightFlowLeak,
                volume_liters: next.night_flow_accumulated,
                ts: reading.ts,
            });
            next.night_flow_accumulated = 0.0;
        }

        next.last_volume = Some(reading.cumulative_volume);
        next.last_ts = Some(reading.ts);
        next.last_processed_sequence_id = reading.sequence_id;

        Transition {
            state: next,
            events,
            outcome: Outcome::Applied,
        }
    }

    fn initialize(&self, reading: &Reading) -> Transition {
        Transition {
            state: MeterState::first_reading(
                &reading.meter_id,
                reading.sequence_id,
                reading.ts,
                reading.cumulative_volume,
            ),
            events: Vec::new(),
            outcome: Outcome::Initialized,
        }
    }
}

impl Default for LeakDetector {
    fn default() -> Self {
        Self {
            min_flow_threshold: 0.1,
            continuous_hours_threshold: 24.0,
            night_start_hour: 2,
            night_end_hour: 5,
            night_threshold: 2.0,
            local_offset: UtcOffset::UTC,
        }
    }
}
