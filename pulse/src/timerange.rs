//! Time ranges for dashboard queries.
//!
//! Every read endpoint that accepts `?range=` parses one of the canned
//! tokens below. A range is a half-open interval `[from, to)` ending now,
//! with a bucket resolution chosen so a chart stays legible regardless of
//! span.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Hard cap on the number of buckets a single series may produce.
pub const MAX_BUCKETS: usize = 10_000;

/// Supported dashboard time ranges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[default]
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "24h")]
    TwentyFourHours,
    #[serde(rename = "7d")]
    SevenDays,
}

impl TimeRange {
    pub const fn to_duration(self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::minutes(5),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::OneHour => Duration::hours(1),
            Self::SixHours => Duration::hours(6),
            Self::TwentyFourHours => Duration::hours(24),
            Self::SevenDays => Duration::days(7),
        }
    }

    /// Bucket width for time-series rollups over this range.
    pub const fn resolution(self) -> Duration {
        match self {
            Self::FiveMinutes => Duration::seconds(5),
            Self::FifteenMinutes => Duration::seconds(10),
            Self::OneHour => Duration::seconds(30),
            Self::SixHours => Duration::minutes(1),
            Self::TwentyFourHours => Duration::minutes(5),
            Self::SevenDays => Duration::hours(1),
        }
    }

    /// Number of buckets this range produces, capped at [`MAX_BUCKETS`].
    pub fn bucket_count(self) -> usize {
        let span = self.to_duration().num_seconds();
        let step = self.resolution().num_seconds().max(1);
        usize::try_from(span / step).unwrap_or(MAX_BUCKETS).min(MAX_BUCKETS)
    }

    /// Compute `(from, to)` bounds ending now.
    pub fn bounds(self) -> (DateTime<Utc>, DateTime<Utc>) {
        let to = Utc::now();
        (to - self.to_duration(), to)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::FifteenMinutes => "15m",
            Self::OneHour => "1h",
            Self::SixHours => "6h",
            Self::TwentyFourHours => "24h",
            Self::SevenDays => "7d",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_range_tokens() {
        let range: TimeRange = serde_json::from_str(r#""15m""#).unwrap();
        assert_eq!(range, TimeRange::FifteenMinutes);
        assert!(serde_json::from_str::<TimeRange>(r#""3w""#).is_err());
    }

    #[test]
    fn default_is_one_hour() {
        assert_eq!(TimeRange::default(), TimeRange::OneHour);
    }

    #[test]
    fn resolution_scales_with_span() {
        assert_eq!(TimeRange::FiveMinutes.resolution(), Duration::seconds(5));
        assert_eq!(TimeRange::SevenDays.resolution(), Duration::hours(1));
    }

    #[test]
    fn bucket_counts_stay_bounded() {
        for range in [
            TimeRange::FiveMinutes,
            TimeRange::FifteenMinutes,
            TimeRange::OneHour,
            TimeRange::SixHours,
            TimeRange::TwentyFourHours,
            TimeRange::SevenDays,
        ] {
            let count = range.bucket_count();
            assert!(count > 0 && count <= MAX_BUCKETS, "{range:?} -> {count}");
        }
    }

    #[test]
    fn bounds_are_sane() {
        let (from, to) = TimeRange::OneHour.bounds();
        let diff = to - from;
        assert!((diff.num_minutes() - 60).abs() <= 1);
    }
}
