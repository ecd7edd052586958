use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{ProcessingError, Result};
use crate::utils::constants::{DAYTIME_END_HOUR, DAYTIME_START_HOUR};

/// Truncate a timestamp to the start of its UTC hour
pub fn floor_to_hour(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let secs = timestamp.timestamp();
    let floored = secs - secs.rem_euclid(3600);
    Utc.timestamp_opt(floored, 0)
        .single()
        .unwrap_or(timestamp)
}

/// Parse RFC 3339 timestamps, falling back to naive "YYYY-MM-DD HH:MM:SS" as UTC
pub fn parse_utc(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(ProcessingError::InvalidFormat(format!(
        "Unrecognised timestamp: '{}'",
        raw
    )))
}

/// Parse a date bound from the command line as midnight UTC
pub fn parse_date_bound(raw: &str) -> Result<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")?;
    Ok(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default()))
}

/// Calendar features derived from an hour stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeFeatures {
    pub hour_of_day: u32,
    /// Monday = 0
    pub day_of_week: u32,
    pub month: u32,
    pub is_weekend: bool,
    pub is_daytime: bool,
}

impl TimeFeatures {
    pub fn from_hour(hour: DateTime<Utc>) -> Self {
        let day_of_week = hour.weekday().num_days_from_monday();
        let hour_of_day = hour.hour();
        Self {
            hour_of_day,
            day_of_week,
            month: hour.month(),
            is_weekend: day_of_week >= 5,
            is_daytime: (DAYTIME_START_HOUR..=DAYTIME_END_HOUR).contains(&hour_of_day),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_to_hour() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, 45, 59).unwrap();
        assert_eq!(
            floor_to_hour(ts),
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );

        let before_epoch = Utc.with_ymd_and_hms(1969, 12, 31, 23, 30, 0).unwrap();
        assert_eq!(
            floor_to_hour(before_epoch),
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_utc_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        assert_eq!(parse_utc("2024-05-01T03:00:00Z").unwrap(), expected);
        assert_eq!(parse_utc("2024-05-01T12:00:00+09:00").unwrap(), expected);
        assert_eq!(parse_utc("2024-05-01 03:00:00").unwrap(), expected);
        assert!(parse_utc("yesterday").is_err());
    }

    #[test]
    fn test_time_features() {
        // Saturday
        let sat = Utc.with_ymd_and_hms(2024, 6, 8, 7, 0, 0).unwrap();
        let features = TimeFeatures::from_hour(sat);
        assert_eq!(features.day_of_week, 5);
        assert!(features.is_weekend);
        assert!(features.is_daytime);
        assert_eq!(features.month, 6);

        let night = Utc.with_ymd_and_hms(2024, 6, 10, 23, 0, 0).unwrap();
        let features = TimeFeatures::from_hour(night);
        assert!(!features.is_weekend);
        assert!(!features.is_daytime);
    }
}
