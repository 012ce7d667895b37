//! Text encoding for every time column.
//!
//! Always UTC with nine fractional digits, so SQLite's text comparison on these
//! columns matches time order. The result is still RFC3339 and decodes back
//! into `OffsetDateTime` through sqlx.

use time::{macros::format_description, OffsetDateTime, UtcOffset};

pub fn sql_timestamp(ts: OffsetDateTime) -> Result<String, time::error::Format> {
    ts.to_offset(UtcOffset::UTC)
        .format(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"))
}
