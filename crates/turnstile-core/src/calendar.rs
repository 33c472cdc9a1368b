//! Local calendar days and business-day counting.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeDelta, Utc, Weekday};

/// Local calendar day of `ts` in the reference timezone.
pub fn local_day(ts: DateTime<Utc>, tz: &FixedOffset) -> NaiveDate {
    ts.with_timezone(tz).date_naive()
}

/// Half-open UTC interval `[start, end)` covering one local calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub day: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DayWindow {
    pub fn for_day(day: NaiveDate, tz: &FixedOffset) -> Self {
        let local_midnight = day.and_time(NaiveTime::MIN).and_utc();
        let start = local_midnight - TimeDelta::seconds(i64::from(tz.local_minus_utc()));
        Self {
            day,
            start,
            end: start + TimeDelta::days(1),
        }
    }

    /// Window of the local day containing `ts`.
    pub fn containing(ts: DateTime<Utc>, tz: &FixedOffset) -> Self {
        Self::for_day(local_day(ts, tz), tz)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

pub fn is_business_day(day: NaiveDate) -> bool {
    !matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Count Monday–Friday days in `[start, end]`; zero when `start > end`.
pub fn business_days(start: NaiveDate, end: NaiveDate) -> u32 {
    if start > end {
        return 0;
    }
    let total = (end - start).num_days() + 1;
    let full_weeks = total / 7;
    let mut count = full_weeks * 5;

    let mut day = start + TimeDelta::days(full_weeks * 7);
    while day <= end {
        if is_business_day(day) {
            count += 1;
        }
        day += TimeDelta::days(1);
    }
    u32::try_from(count).unwrap_or(u32::MAX)
}
