use crate::alerts::AlertSink;
use crate::config::Supervisor;
use crate::engine::{Engine, EngineError};
use chrono::NaiveDate;
use serde::Serialize;
use std::time::Instant;
use turnstile_core::{Embedding, ScanEvent, SpoofAlert};
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.turnstile.Attendance1";
pub const OBJECT_PATH: &str = "/org/turnstile/Attendance1";

/// D-Bus interface for the attendance checkpoint daemon.
///
/// Bus name: org.turnstile.Attendance1
/// Object path: /org/turnstile/Attendance1
///
/// The `subject` argument is the identity established by the session
/// gateway, the only trusted caller; scan payloads never carry one.
pub struct AttendanceService {
    engine: Engine,
    started: Instant,
}

impl AttendanceService {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            started: Instant::now(),
        }
    }
}

#[interface(name = "org.turnstile.Attendance1")]
impl AttendanceService {
    /// Verify a scan for an authenticated subject and log the arrival or departure.
    async fn verify_and_log(&self, subject: &str, scan: &str) -> fdo::Result<String> {
        let subject = required_subject(subject)?;
        let scan: ScanEvent = serde_json::from_str(scan)
            .map_err(|e| fdo::Error::InvalidArgs(format!("scan: {e}")))?;
        let outcome = self
            .engine
            .verify_and_log(subject, &scan)
            .await
            .map_err(to_fdo_error)?;
        to_json(&outcome)
    }

    /// Attendance statistics; an empty subject means every subject.
    async fn get_statistics(&self, subject: &str, as_of: &str) -> fdo::Result<String> {
        tracing::info!(subject, as_of, "statistics requested");
        let as_of = parse_optional_day(as_of)?;
        let report = self
            .engine
            .statistics(optional(subject), as_of)
            .await
            .map_err(to_fdo_error)?;
        to_json(&report)
    }

    /// Replace a subject's enrolled embeddings (a JSON array of 1-10 vectors).
    async fn enroll(&self, subject: &str, embeddings: &str) -> fdo::Result<u32> {
        let subject = required_subject(subject)?;
        let embeddings: Vec<Embedding> = serde_json::from_str(embeddings)
            .map_err(|e| fdo::Error::InvalidArgs(format!("embeddings: {e}")))?;
        let count = self
            .engine
            .enroll(subject, embeddings)
            .await
            .map_err(to_fdo_error)?;
        Ok(count as u32)
    }

    /// Log entries for a day (empty = today), optionally for one subject.
    async fn list_logs(&self, subject: &str, day: &str) -> fdo::Result<String> {
        tracing::info!(subject, day, "list_logs requested");
        let day = parse_optional_day(day)?;
        let entries = self
            .engine
            .logs(optional(subject), day)
            .await
            .map_err(to_fdo_error)?;
        to_json(&entries)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let settings = self.engine.settings();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "today": self.engine.today().to_string(),
            "utc_offset_secs": settings.timezone.local_minus_utc(),
            "match_threshold": settings.match_threshold,
            "min_liveness_confidence": settings.min_liveness_confidence,
            "persist_timeout_ms": settings.persist_timeout.as_millis() as u64,
            "geofence": settings.geofence.is_some(),
        })
        .to_string())
    }

    /// Raised once per supervisor for every spoof-flagged scan.
    #[zbus(signal)]
    async fn spoof_detected(
        emitter: &SignalEmitter<'_>,
        supervisor: &str,
        alert: &str,
    ) -> zbus::Result<()>;
}

/// Delivers spoof alerts as `SpoofDetected` signals for the external notifier.
pub struct DbusAlertSink {
    conn: zbus::Connection,
}

impl DbusAlertSink {
    pub fn new(conn: zbus::Connection) -> Self {
        Self { conn }
    }
}

impl AlertSink for DbusAlertSink {
    async fn deliver(&self, supervisor: &Supervisor, alert: &SpoofAlert) -> anyhow::Result<()> {
        let emitter = SignalEmitter::new(&self.conn, OBJECT_PATH)?;
        let payload = serde_json::to_string(alert)?;
        AttendanceService::spoof_detected(&emitter, &supervisor.contact, &payload).await?;
        tracing::debug!(supervisor = %supervisor.name, "spoof alert signalled");
        Ok(())
    }
}

fn optional(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn required_subject(subject: &str) -> fdo::Result<&str> {
    optional(subject).ok_or_else(|| fdo::Error::InvalidArgs("subject is required".into()))
}

fn parse_optional_day(s: &str) -> fdo::Result<Option<NaiveDate>> {
    optional(s)
        .map(|d| {
            d.parse::<NaiveDate>()
                .map_err(|e| fdo::Error::InvalidArgs(format!("date {d:?}: {e}")))
        })
        .transpose()
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn to_fdo_error(err: EngineError) -> fdo::Error {
    let msg = err.to_string();
    tracing::debug!(retryable = err.is_retryable(), error = %msg, "request failed");
    match err {
        EngineError::InvalidScan(_) | EngineError::InvalidEnrollment(_) => {
            fdo::Error::InvalidArgs(msg)
        }
        EngineError::PersistenceTimeout => fdo::Error::TimedOut(msg),
        EngineError::UnknownSubject(_) | EngineError::NoRecordsFound(_) => {
            fdo::Error::FileNotFound(msg)
        }
        EngineError::Store(ref e) => {
            tracing::error!(error = %e, "log store failure");
            fdo::Error::Failed(msg)
        }
    }
}
