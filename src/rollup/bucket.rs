use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Width of a rollup bucket, which also determines its key format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn all() -> [Granularity; 4] {
        [
            Granularity::Hour,
            Granularity::Day,
            Granularity::Week,
            Granularity::Month,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "week" => Ok(Granularity::Week),
            "month" => Ok(Granularity::Month),
            other => Err(format!("unknown granularity: {}", other)),
        }
    }
}

/// Bucket key for the period containing `t`.
/// Hour `YYYYMMDDHH`, day `YYYYMMDD`, week `YYYY"W"WW` (ISO week), month `YYYYMM`.
pub fn bucket_key(granularity: Granularity, t: DateTime<Utc>) -> String {
    match granularity {
        Granularity::Hour => t.format("%Y%m%d%H").to_string(),
        Granularity::Day => t.format("%Y%m%d").to_string(),
        Granularity::Week => {
            let iso = t.iso_week();
            format!("{}W{:02}", iso.year(), iso.week())
        }
        Granularity::Month => t.format("%Y%m").to_string(),
    }
}

/// Start of the period containing `t`, rounded down.
/// Weeks start on Monday; months on day 1.
pub fn period_start(granularity: Granularity, t: DateTime<Utc>) -> DateTime<Utc> {
    match granularity {
        Granularity::Hour => Utc
            .with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
            .unwrap(),
        Granularity::Day => Utc
            .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
            .unwrap(),
        Granularity::Week => {
            let date = t.date_naive() - Duration::days(t.weekday().num_days_from_monday() as i64);
            date.and_hms_opt(0, 0, 0).unwrap().and_utc()
        }
        Granularity::Month => Utc
            .with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
            .unwrap(),
    }
}

/// Start of the period immediately before the one containing `t`.
pub fn previous_period_start(granularity: Granularity, t: DateTime<Utc>) -> DateTime<Utc> {
    let start = period_start(granularity, t);
    match granularity {
        Granularity::Hour => start - Duration::hours(1),
        Granularity::Day => start - Duration::days(1),
        Granularity::Week => start - Duration::weeks(1),
        Granularity::Month => {
            let (year, month) = if start.month() == 1 {
                (start.year() - 1, 12)
            } else {
                (start.year(), start.month() - 1)
            };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
        }
    }
}

/// Start of the period immediately after the one containing `t`.
pub fn next_period_start(granularity: Granularity, t: DateTime<Utc>) -> DateTime<Utc> {
    let start = period_start(granularity, t);
    match granularity {
        Granularity::Hour => start + Duration::hours(1),
        Granularity::Day => start + Duration::days(1),
        Granularity::Week => start + Duration::weeks(1),
        Granularity::Month => {
            let (year, month) = if start.month() == 12 {
                (start.year() + 1, 1)
            } else {
                (start.year(), start.month() + 1)
            };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).unwrap()
        }
    }
}

/// One aggregation pass targets a half-open time range and a single bucket.
#[derive(Debug, Clone)]
pub struct AggregationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: String,
}

/// Currently open period: start of period to "now".
pub fn open_window(granularity: Granularity, now: DateTime<Utc>) -> AggregationWindow {
    let start = period_start(granularity, now);
    AggregationWindow {
        start,
        end: now,
        bucket: bucket_key(granularity, start),
    }
}

/// The just-closed full period before the one containing `now`.
pub fn previous_closed_window(granularity: Granularity, now: DateTime<Utc>) -> AggregationWindow {
    let start = previous_period_start(granularity, now);
    let end = period_start(granularity, now);
    AggregationWindow {
        start,
        end,
        bucket: bucket_key(granularity, start),
    }
}

/// Period containing `at`, with the end capped at `now` for the open period.
pub fn window_containing(
    granularity: Granularity,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> AggregationWindow {
    let start = period_start(granularity, at);
    let end = next_period_start(granularity, at).min(now);
    AggregationWindow {
        start,
        end,
        bucket: bucket_key(granularity, start),
    }
}

/// Next hourly fire time at a fixed minute offset past the hour,
/// strictly after `now`.
pub fn next_hourly_fire(now: DateTime<Utc>, offset_minutes: u32) -> DateTime<Utc> {
    let candidate = period_start(Granularity::Hour, now) + Duration::minutes(offset_minutes as i64);
    if candidate > now {
        candidate
    } else {
        candidate + Duration::hours(1)
    }
}
