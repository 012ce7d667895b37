use std::{fmt, str::FromStr};

use sqlx::{sqlite::SqliteRow, FromRow, Row};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum AlertType {
    ContinuousFlowLeak,
    NightFlowLeak,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContinuousFlowLeak => "CONTINUOUS_FLOW_LEAK",
            Self::NightFlowLeak => "NIGHT_FLOW_LEAK",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("unknown alert type '{0}'")]
pub struct ParseAlertTypeError(pub String);

impl FromStr for AlertType {
    type Err = ParseAlertTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONTINUOUS_FLOW_LEAK" => Ok(Self::ContinuousFlowLeak),
            "NIGHT_FLOW_LEAK" => Ok(Self::NightFlowLeak),
            other => Err(ParseAlertTypeError(other.to_string())),
        }
    }
}

/// An emitted leak event. Append-only; never deduplicated.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Alert {
    pub meter_id: String,
    pub alert_type: AlertType,
    pub volume_liters: f64,
    /// Timestamp of the reading that triggered the alert.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub ts: OffsetDateTime,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub created_at: OffsetDateTime,
}

impl<'r> FromRow<'r, SqliteRow> for Alert {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let raw_type: String = row.try_get("alert_type")?;
        let alert_type = raw_type.parse::<AlertType>().map_err(|e: ParseAlertTypeError| sqlx::Error::ColumnDecode {
            index: "alert_type".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            meter_id: row.try_get("meter_id")?,
            alert_type,
            volume_liters: row.try_get("volume_liters")?,
            ts: row.try_get("ts")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
