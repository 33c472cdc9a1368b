//! turnstile-core — Attendance verification and logging rules.
//!
//! Embedding matching, liveness gating, the optional geofence, the daily
//! arrival/departure state machine and business-day statistics. Pure logic
//! with no I/O; persistence and transport live in `turnstiled`.

pub mod attendance;
pub mod calendar;
pub mod geofence;
pub mod liveness;
pub mod matcher;
pub mod stats;
pub mod types;

pub use attendance::DayState;
pub use calendar::{business_days, local_day, DayWindow};
pub use geofence::Geofence;
pub use liveness::{LivenessDecision, LivenessFailure, LivenessGate, SpoofAlert, Verdict};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use stats::StatsError;
pub use types::{
    AttendanceLogEntry, AttendanceStatistics, Direction, Embedding, EnrolledIdentity,
    EnrollmentError, GeoPoint, LivenessSignals, RejectReason, ScanEvent, ScanOutcome,
};
