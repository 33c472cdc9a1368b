//! Per-subject, per-day entry/exit state machine.
//!
//! `NoEntry -> CheckedIn -> CheckedOut`. The last state is terminal for the
//! day: a subject gets at most one arrival/departure pair per calendar day.
//! Storage applies these transitions atomically per `(subject, day)` key.

use crate::types::{AttendanceLogEntry, Direction, RejectReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayState {
    NoEntry,
    CheckedIn,
    CheckedOut,
}

impl DayState {
    /// State implied by the day's log entry, if any.
    pub fn of(entry: Option<&AttendanceLogEntry>) -> Self {
        match entry {
            None => DayState::NoEntry,
            Some(e) if e.exit_time.is_none() => DayState::CheckedIn,
            Some(_) => DayState::CheckedOut,
        }
    }

    /// Apply one verified, live scan.
    pub fn on_accepted_scan(self) -> Result<(DayState, Direction), RejectReason> {
        match self {
            DayState::NoEntry => Ok((DayState::CheckedIn, Direction::Arrival)),
            DayState::CheckedIn => Ok((DayState::CheckedOut, Direction::Departure)),
            DayState::CheckedOut => Err(RejectReason::AlreadyCheckedOut),
        }
    }
}
