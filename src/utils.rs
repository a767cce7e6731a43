//! Utility functions for formatting and parsing
use std::time::Duration;
use time::{format_description, OffsetDateTime};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format.
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]") {
        Ok(format) => dt.format(&format).unwrap_or_else(|_| dt.to_string()),
        Err(_) => dt.to_string(),
    }
}

/// Parse a duration such as `500ms`, `30s`, `5m` or `1h`
///
/// A bare number is interpreted as seconds.
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // `ms` must be checked before `m` and `s`
    let (number, scale_ms) = if let Some(num) = src.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3_600_000)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1_000)
    } else {
        (src, 1_000)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {}", src))?;

    value
        .checked_mul(scale_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("duration out of range: {}", src))
}
