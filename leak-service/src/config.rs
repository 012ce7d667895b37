use serde::Deserialize;
use std::fs;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("detection.{field} must be a finite, non-negative number (got {value})")]
    InvalidThreshold { field: &'static str, value: f64 },
    #[error("night window [{start}, {end}) must satisfy 0 <= start < end <= 24")]
    InvalidNightWindow { start: u8, end: u8 },
    #[error("detection.utc_offset_minutes must be within ±1440 (got {0})")]
    InvalidUtcOffset(i32),
    #[error("cursor.{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("cursor.poll_interval_seconds must be a finite, positive number (got {0})")]
    InvalidPollInterval(f64),
    #[error("cursor.shards contains {shard}, outside 0..{shard_count}")]
    ShardOutOfRange { shard: u32, shard_count: u32 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Thresholds consumed by the detection engine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum per-reading volume delta that counts as flow.
    pub min_flow_threshold: f64,
    pub continuous_hours_threshold: f64,
    /// Night window is `[night_start_hour, night_end_hour)` in local time.
    pub night_start_hour: u8,
    pub night_end_hour: u8,
    pub night_threshold: f64,
    /// Fixed offset applied to UTC timestamps to get the local hour of day.
    pub utc_offset_minutes: i32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_flow_threshold: 0.1,
            continuous_hours_threshold: 24.0,
            night_start_hour: 2,
            night_end_hour: 5,
            night_threshold: 2.0,
            utc_offset_minutes: 0,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("min_flow_threshold", self.min_flow_threshold),
            ("continuous_hours_threshold", self.continuous_hours_threshold),
            ("night_threshold", self.night_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidThreshold { field, value });
            }
        }

        if self.night_start_hour >= self.night_end_hour || self.night_end_hour > 24 {
            return Err(ConfigError::InvalidNightWindow {
                start: self.night_start_hour,
                end: self.night_end_hour,
            });
        }

        if self.utc_offset_minutes.abs() > 24 * 60 {
            return Err(ConfigError::InvalidUtcOffset(self.utc_offset_minutes));
        }

        Ok(())
    }
}

/// Cursor loop settings shared by every worker in this process.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CursorConfig {
    pub poll_interval_seconds: f64,
    pub batch_size: usize,
    pub shard_count: u32,
    /// Shards run by this process. Empty means all of `0..shard_count`.
    pub shards: Vec<u32>,
    pub max_cas_attempts: u32,
    pub alert_max_retries: u32,
    pub alert_retry_backoff_ms: u64,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5.0,
            batch_size: 500,
            shard_count: 1,
            shards: Vec::new(),
            max_cas_attempts: 3,
            alert_max_retries: 3,
            alert_retry_backoff_ms: 100,
        }
    }
}

impl CursorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.poll_interval_seconds.is_finite() || self.poll_interval_seconds <= 0.0 {
            return Err(ConfigError::InvalidPollInterval(self.poll_interval_seconds));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero { field: "batch_size" });
        }
        if self.shard_count == 0 {
            return Err(ConfigError::Zero { field: "shard_count" });
        }
        if self.max_cas_attempts == 0 {
            return Err(ConfigError::Zero { field: "max_cas_attempts" });
        }
        if let Some(&shard) = self.shards.iter().find(|&&s| s >= self.shard_count) {
            return Err(ConfigError::ShardOutOfRange {
                shard,
                shard_count: self.shard_count,
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.poll_interval_seconds)
    }

    pub fn assigned_shards(&self) -> Vec<u32> {
        if self.shards.is_empty() {
            (0..self.shard_count).collect()
        } else {
            let mut shards = self.shards.clone();
            shards.sort_unstable();
            shards.dedup();
            shards
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub http_bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub cursor: CursorConfig,
    pub ingest: Option<IngestConfig>,
    pub metrics: Option<MetricsConfig>,
}

fn default_max_connections() -> u32 {
    5
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("LEAK_SERVICE_CONFIG").unwrap_or_else(|_| "leak-service.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detection.validate()?;
        self.cursor.validate()
    }
}
