//! Business-day attendance statistics over persisted log entries.

use crate::calendar::business_days;
use crate::types::{AttendanceLogEntry, AttendanceStatistics};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("no attendance records found for {0}")]
    NoRecordsFound(String),
    #[error("no attendance records found")]
    NoRecords,
}

/// Statistics for one subject as of `as_of` (inclusive).
pub fn compute(
    subject_id: &str,
    entries: &[AttendanceLogEntry],
    as_of: NaiveDate,
) -> Result<AttendanceStatistics, StatsError> {
    summarize(subject_id, entries.iter(), as_of)
        .ok_or_else(|| StatsError::NoRecordsFound(subject_id.to_string()))
}

/// Per-subject statistics for every subject in `entries`, ordered by subject id.
pub fn compute_all(
    entries: &[AttendanceLogEntry],
    as_of: NaiveDate,
) -> Result<Vec<AttendanceStatistics>, StatsError> {
    let mut by_subject: BTreeMap<&str, Vec<&AttendanceLogEntry>> = BTreeMap::new();
    for entry in entries {
        by_subject
            .entry(entry.subject_id.as_str())
            .or_default()
            .push(entry);
    }
    if by_subject.is_empty() {
        return Err(StatsError::NoRecords);
    }

    Ok(by_subject
        .into_iter()
        .filter_map(|(subject_id, group)| summarize(subject_id, group.into_iter(), as_of))
        .collect())
}

fn summarize<'a>(
    subject_id: &str,
    entries: impl Iterator<Item = &'a AttendanceLogEntry>,
    as_of: NaiveDate,
) -> Option<AttendanceStatistics> {
    let mut present: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut first: Option<&AttendanceLogEntry> = None;

    for entry in entries {
        present.insert(entry.day);
        if first.map_or(true, |f| entry.entry_time < f.entry_time) {
            first = Some(entry);
        }
    }
    let earliest_day = first?.day;

    let present_days = u32::try_from(present.len()).unwrap_or(u32::MAX);
    let total_business_days = business_days(earliest_day, as_of);
    let absent_days = i64::from(total_business_days) - i64::from(present_days);

    if absent_days < 0 {
        tracing::warn!(
            subject = subject_id,
            present_days,
            total_business_days,
            "more present days than business days; log contains weekend or future-dated entries"
        );
    }

    Some(AttendanceStatistics {
        subject_id: subject_id.to_string(),
        present_days,
        total_business_days,
        absent_days,
        attendance_percentage: format_percentage(present_days, total_business_days),
    })
}

fn format_percentage(present: u32, total: u32) -> String {
    if total == 0 {
        return "0.00".to_string();
    }
    let pct = f64::from(present) / f64::from(total) * 100.0;
    format!("{:.2}", (pct * 100.0).round() / 100.0)
}
