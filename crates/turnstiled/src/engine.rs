use crate::alerts::AlertDispatcher;
use crate::store::{CommitGuard, LogStore, StoreError};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use turnstile_core::stats::{self, StatsError};
use turnstile_core::{
    local_day, AttendanceLogEntry, AttendanceStatistics, DayWindow, Embedding, EnrolledIdentity,
    EnrollmentError, EuclideanMatcher, Geofence, LivenessGate, Matcher, RejectReason, ScanEvent,
    ScanOutcome,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid scan: {0}")]
    InvalidScan(String),
    #[error("invalid enrollment: {0}")]
    InvalidEnrollment(#[from] EnrollmentError),
    #[error("subject {0} has no enrolled face")]
    UnknownSubject(String),
    #[error("{0}")]
    NoRecordsFound(#[from] StatsError),
    #[error("log store did not respond in time; retry the scan")]
    PersistenceTimeout,
    #[error("log store: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Transient failures the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::PersistenceTimeout)
    }
}

/// Tunables for scan verification.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub match_threshold: f32,
    pub min_liveness_confidence: f32,
    pub persist_timeout: Duration,
    pub timezone: FixedOffset,
    pub geofence: Option<Geofence>,
}

/// Subject-scoped or organization-wide statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatisticsReport {
    Subject(AttendanceStatistics),
    Organization(Vec<AttendanceStatistics>),
}

/// Clone-safe handle to the verification and logging engine.
#[derive(Clone)]
pub struct Engine {
    store: LogStore,
    alerts: Arc<dyn AlertDispatcher>,
    gate: LivenessGate,
    settings: Arc<EngineSettings>,
}

impl Engine {
    pub fn new(
        store: LogStore,
        alerts: Arc<dyn AlertDispatcher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            alerts,
            gate: LivenessGate::new(settings.min_liveness_confidence),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Today's calendar day in the reference timezone.
    pub fn today(&self) -> NaiveDate {
        local_day(Utc::now(), &self.settings.timezone)
    }

    /// Match, gate and log one scan for an authenticated subject.
    pub async fn verify_and_log(
        &self,
        subject_id: &str,
        scan: &ScanEvent,
    ) -> Result<ScanOutcome, EngineError> {
        self.verify_and_log_at(subject_id, scan, Utc::now()).await
    }

    pub async fn verify_and_log_at(
        &self,
        subject_id: &str,
        scan: &ScanEvent,
        now: DateTime<Utc>,
    ) -> Result<ScanOutcome, EngineError> {
        validate_scan(scan)?;

        let identity = self
            .persist("load identity", self.store.identity(subject_id))
            .await?
            .ok_or_else(|| EngineError::UnknownSubject(subject_id.to_string()))?;

        let result = EuclideanMatcher.compare(
            &scan.embedding,
            identity.embeddings(),
            self.settings.match_threshold,
        );
        if !result.matched {
            tracing::info!(
                subject = subject_id,
                distance = ?result.distance,
                "scan rejected: face mismatch"
            );
            return Ok(rejected(RejectReason::FaceMismatch));
        }
        tracing::debug!(subject = subject_id, distance = ?result.distance, "face matched");

        if let Some(fence) = &self.settings.geofence {
            if !fence.contains(scan.location) {
                tracing::info!(
                    subject = subject_id,
                    location = ?scan.location,
                    "scan rejected: outside premises"
                );
                return Ok(rejected(RejectReason::OutsidePremises));
            }
        }

        let decision = self.gate.evaluate(&scan.liveness);
        if let Some(alert) =
            decision.spoof_alert(subject_id, scan.device_id.as_deref(), scan.location, now)
        {
            if let Err(err) = self.alerts.dispatch(alert) {
                tracing::warn!(subject = subject_id, error = %err, "spoof alert not dispatched");
            }
        }
        if !decision.passed() {
            tracing::info!(
                subject = subject_id,
                failures = ?decision.failures,
                "scan rejected: liveness failed"
            );
            return Ok(rejected(RejectReason::LivenessFailed));
        }

        let window = DayWindow::containing(now, &self.settings.timezone);
        let guard = CommitGuard::new();
        let transition = self
            .persist_guarded(
                "record scan",
                self.store.record_scan(subject_id, scan, window, now, &guard),
                &guard,
            )
            .await?;

        match transition {
            Ok((direction, entry)) => {
                tracing::info!(subject = subject_id, day = %window.day, "{direction}");
                Ok(ScanOutcome::Accepted { direction, entry })
            }
            Err(reason) => {
                tracing::info!(subject = subject_id, day = %window.day, "scan rejected: {reason}");
                Ok(rejected(reason))
            }
        }
    }

    /// Attendance statistics for one subject, or per subject for everyone.
    ///
    /// `as_of` defaults to today in the reference timezone.
    pub async fn statistics(
        &self,
        subject_id: Option<&str>,
        as_of: Option<NaiveDate>,
    ) -> Result<StatisticsReport, EngineError> {
        let as_of = as_of.unwrap_or_else(|| self.today());
        match subject_id {
            Some(subject) => {
                let entries = self
                    .persist("load subject entries", self.store.entries_for(subject))
                    .await?;
                Ok(StatisticsReport::Subject(stats::compute(
                    subject, &entries, as_of,
                )?))
            }
            None => {
                let entries = self
                    .persist("load all entries", self.store.all_entries())
                    .await?;
                Ok(StatisticsReport::Organization(stats::compute_all(
                    &entries, as_of,
                )?))
            }
        }
    }

    /// Replace a subject's enrolled embeddings. Returns how many were stored.
    pub async fn enroll(
        &self,
        subject_id: &str,
        embeddings: Vec<Embedding>,
    ) -> Result<usize, EngineError> {
        let identity = EnrolledIdentity::new(subject_id, embeddings)?;
        let count = identity.embeddings().len();
        self.persist("enroll", self.store.upsert_identity(&identity, Utc::now()))
            .await?;
        tracing::info!(subject = subject_id, count, "enrollment updated");
        Ok(count)
    }

    /// Log entries for a calendar day (default today), newest first.
    pub async fn logs(
        &self,
        subject_id: Option<&str>,
        day: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceLogEntry>, EngineError> {
        let day = day.unwrap_or_else(|| self.today());
        let window = DayWindow::for_day(day, &self.settings.timezone);
        self.persist("list logs", self.store.entries_on(subject_id, window))
            .await
    }

    async fn persist<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.settings.persist_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(self.timed_out(op)),
        }
    }

    /// Like [`persist`](Self::persist) for a write that must not commit once
    /// the caller has been told it timed out.
    ///
    /// If the write claimed `guard` before the deadline it is already
    /// committing, so its result is awaited instead.
    async fn persist_guarded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
        guard: &CommitGuard,
    ) -> Result<T, EngineError> {
        tokio::pin!(fut);
        match tokio::time::timeout(self.settings.persist_timeout, &mut fut).await {
            Ok(result) => Ok(result?),
            Err(_) if guard.abandon() => Err(self.timed_out(op)),
            Err(_) => {
                tracing::debug!(op, "deadline passed during commit; awaiting result");
                Ok(fut.await?)
            }
        }
    }

    fn timed_out(&self, op: &'static str) -> EngineError {
        tracing::warn!(
            op,
            timeout_ms = self.settings.persist_timeout.as_millis() as u64,
            "log store timed out"
        );
        EngineError::PersistenceTimeout
    }
}

fn rejected(reason: RejectReason) -> ScanOutcome {
    ScanOutcome::Rejected { reason }
}

fn validate_scan(scan: &ScanEvent) -> Result<(), EngineError> {
    if scan.embedding.values.is_empty() {
        return Err(EngineError::InvalidScan("embedding is empty".into()));
    }
    if scan.embedding.values.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::InvalidScan(
            "embedding contains non-finite values".into(),
        ));
    }
    let confidence = scan.liveness.liveness_confidence;
    if !(0.0..=1.0).contains(&confidence) {
        return Err(EngineError::InvalidScan(format!(
            "liveness confidence {confidence} outside [0, 1]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertError;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use turnstile_core::{Direction, GeoPoint, LivenessSignals, SpoofAlert};

    #[derive(Default)]
    struct RecordingDispatcher {
        alerts: Mutex<Vec<SpoofAlert>>,
    }

    impl AlertDispatcher for RecordingDispatcher {
        fn dispatch(&self, alert: SpoofAlert) -> Result<(), AlertError> {
            self.alerts.lock().unwrap().push(alert);
            Ok(())
        }
    }

    struct FailingDispatcher;

    impl AlertDispatcher for FailingDispatcher {
        fn dispatch(&self, _alert: SpoofAlert) -> Result<(), AlertError> {
            Err(AlertError::Closed)
        }
    }

    fn recording() -> Arc<dyn AlertDispatcher> {
        Arc::new(RecordingDispatcher::default())
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            match_threshold: 1.0,
            min_liveness_confidence: 0.7,
            persist_timeout: Duration::from_secs(2),
            timezone: FixedOffset::east_opt(0).unwrap(),
            geofence: None,
        }
    }

    async fn engine_with(
        alerts: Arc<dyn AlertDispatcher>,
        settings: EngineSettings,
    ) -> (Engine, LogStore) {
        let store = LogStore::open_in_memory().await.unwrap();
        engine_on(store, alerts, settings).await
    }

    async fn engine_on(
        store: LogStore,
        alerts: Arc<dyn AlertDispatcher>,
        settings: EngineSettings,
    ) -> (Engine, LogStore) {
        let engine = Engine::new(store.clone(), alerts, settings);
        engine
            .enroll("E1", vec![Embedding::new(vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        (engine, store)
    }

    fn live_scan(embedding: &[f32]) -> ScanEvent {
        ScanEvent {
            embedding: Embedding::new(embedding.to_vec()),
            liveness: LivenessSignals {
                is_live: true,
                liveness_confidence: 0.9,
                phone_detected: false,
                spoof_attempt: false,
            },
            device_id: Some("gate-1".into()),
            location: Some(GeoPoint {
                latitude: 12.9716,
                longitude: 77.5946,
            }),
        }
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_day() {
        let (engine, store) = engine_with(recording(), settings()).await;
        let scan = live_scan(&[0.9, 0.1, 0.0]);

        let first = engine.verify_and_log_at("E1", &scan, at(2, 9)).await.unwrap();
        assert_eq!(first.direction(), Some(Direction::Arrival));
        let ScanOutcome::Accepted { entry, .. } = &first else {
            panic!("expected acceptance");
        };
        assert_eq!(entry.entry_time, at(2, 9));
        assert!(entry.exit_time.is_none());

        let second = engine.verify_and_log_at("E1", &scan, at(2, 17)).await.unwrap();
        assert_eq!(second.direction(), Some(Direction::Departure));

        let third = engine.verify_and_log_at("E1", &scan, at(2, 18)).await.unwrap();
        assert_eq!(third.reject_reason(), Some(RejectReason::AlreadyCheckedOut));

        let entries = store.entries_for("E1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_time, at(2, 9));
        assert_eq!(entries[0].exit_time, Some(at(2, 17)));
    }

    #[tokio::test]
    async fn test_face_mismatch_leaves_day_untouched() {
        let (engine, store) = engine_with(recording(), settings()).await;
        let stranger = live_scan(&[-1.0, 0.2, 0.0]);

        let outcome = engine.verify_and_log_at("E1", &stranger, at(2, 9)).await.unwrap();
        assert_eq!(outcome.reject_reason(), Some(RejectReason::FaceMismatch));
        assert!(store.entries_for("E1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spoof_scan_emits_exactly_one_alert() {
        let alerts = Arc::new(RecordingDispatcher::default());
        let (engine, store) = engine_with(alerts.clone(), settings()).await;

        let mut scan = live_scan(&[1.0, 0.0, 0.0]);
        scan.liveness.spoof_attempt = true;
        scan.liveness.phone_detected = true;

        let outcome = engine.verify_and_log_at("E1", &scan, at(2, 9)).await.unwrap();
        assert_eq!(outcome.reject_reason(), Some(RejectReason::LivenessFailed));

        let sent = alerts.alerts.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject_id, "E1");
        assert_eq!(sent[0].device_id.as_deref(), Some("gate-1"));
        assert_eq!(sent[0].detected_at, at(2, 9));
        drop(sent);

        assert!(store.entries_for("E1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_low_confidence_rejected_without_alert() {
        let alerts = Arc::new(RecordingDispatcher::default());
        let (engine, _store) = engine_with(alerts.clone(), settings()).await;

        let mut scan = live_scan(&[1.0, 0.0, 0.0]);
        scan.liveness.liveness_confidence = 0.69;

        let outcome = engine.verify_and_log_at("E1", &scan, at(2, 9)).await.unwrap();
        assert_eq!(outcome.reject_reason(), Some(RejectReason::LivenessFailed));
        assert!(alerts.alerts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alert_failure_does_not_change_outcome() {
        let (engine, _store) = engine_with(Arc::new(FailingDispatcher), settings()).await;
        let mut scan = live_scan(&[1.0, 0.0, 0.0]);
        scan.liveness.spoof_attempt = true;

        let outcome = engine.verify_and_log_at("E1", &scan, at(2, 9)).await.unwrap();
        assert_eq!(outcome.reject_reason(), Some(RejectReason::LivenessFailed));
    }

    #[tokio::test]
    async fn test_geofence_rejects_outside_and_missing_location() {
        let mut s = settings();
        s.geofence = Some(Geofence {
            latitude: 12.9716,
            longitude: 77.5946,
            radius_m: 100.0,
        });
        let (engine, _store) = engine_with(recording(), s).await;

        let mut far = live_scan(&[1.0, 0.0, 0.0]);
        far.location = Some(GeoPoint {
            latitude: 13.0827,
            longitude: 80.2707,
        });
        let outcome = engine.verify_and_log_at("E1", &far, at(2, 9)).await.unwrap();
        assert_eq!(outcome.reject_reason(), Some(RejectReason::OutsidePremises));

        let mut nowhere = live_scan(&[1.0, 0.0, 0.0]);
        nowhere.location = None;
        let outcome = engine.verify_and_log_at("E1", &nowhere, at(2, 9)).await.unwrap();
        assert_eq!(outcome.reject_reason(), Some(RejectReason::OutsidePremises));

        let inside = live_scan(&[1.0, 0.0, 0.0]);
        let outcome = engine.verify_and_log_at("E1", &inside, at(2, 9)).await.unwrap();
        assert_eq!(outcome.direction(), Some(Direction::Arrival));
    }

    #[tokio::test]
    async fn test_unknown_subject_and_invalid_scan() {
        let (engine, _store) = engine_with(recording(), settings()).await;

        let err = engine
            .verify_and_log_at("E404", &live_scan(&[1.0, 0.0, 0.0]), at(2, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSubject(s) if s == "E404"));

        let err = engine
            .verify_and_log_at("E1", &live_scan(&[]), at(2, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidScan(_)));

        let mut bad_confidence = live_scan(&[1.0, 0.0, 0.0]);
        bad_confidence.liveness.liveness_confidence = 1.5;
        let err = engine
            .verify_and_log_at("E1", &bad_confidence, at(2, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidScan(_)));
    }

    #[tokio::test]
    async fn test_enroll_validates() {
        let (engine, _store) = engine_with(recording(), settings()).await;
        let err = engine.enroll("E2", vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidEnrollment(EnrollmentError::Empty)
        ));
        assert_eq!(
            engine
                .enroll("E2", vec![Embedding::new(vec![0.0, 1.0, 0.0]); 3])
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_statistics_subject_and_organization() {
        let (engine, _store) = engine_with(recording(), settings()).await;
        engine
            .enroll("E2", vec![Embedding::new(vec![0.0, 1.0, 0.0])])
            .await
            .unwrap();

        // E1 present Mon 1st and Wed 3rd; E2 present Thu 4th.
        for (subject, embedding, d) in [
            ("E1", [1.0f32, 0.0, 0.0], 1),
            ("E1", [1.0, 0.0, 0.0], 3),
            ("E2", [0.0, 1.0, 0.0], 4),
        ] {
            let outcome = engine
                .verify_and_log_at(subject, &live_scan(&embedding), at(d, 9))
                .await
                .unwrap();
            assert_eq!(outcome.direction(), Some(Direction::Arrival));
        }

        let as_of = NaiveDate::from_ymd_opt(2024, 1, 7);
        let StatisticsReport::Subject(e1) = engine.statistics(Some("E1"), as_of).await.unwrap()
        else {
            panic!("expected subject report");
        };
        assert_eq!(e1.present_days, 2);
        assert_eq!(e1.total_business_days, 5);
        assert_eq!(e1.absent_days, 3);
        assert_eq!(e1.attendance_percentage, "40.00");

        let StatisticsReport::Organization(all) = engine.statistics(None, as_of).await.unwrap()
        else {
            panic!("expected organization report");
        };
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].subject_id, "E2");
        assert_eq!(all[1].total_business_days, 2);

        let err = engine.statistics(Some("E9"), as_of).await.unwrap_err();
        assert!(matches!(err, EngineError::NoRecordsFound(_)));
    }

    #[tokio::test]
    async fn test_logs_for_day() {
        let (engine, _store) = engine_with(recording(), settings()).await;
        engine
            .verify_and_log_at("E1", &live_scan(&[1.0, 0.0, 0.0]), at(2, 9))
            .await
            .unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 1, 2);
        assert_eq!(engine.logs(Some("E1"), day).await.unwrap().len(), 1);
        assert!(engine
            .logs(None, NaiveDate::from_ymd_opt(2024, 1, 3))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_stalled_store_surfaces_retryable_timeout() {
        let mut s = settings();
        s.persist_timeout = Duration::from_millis(50);
        let (engine, store) = engine_with(recording(), s).await;

        let staller = tokio::spawn(async move { store.stall(Duration::from_millis(500)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = engine
            .verify_and_log_at("E1", &live_scan(&[1.0, 0.0, 0.0]), at(2, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PersistenceTimeout));
        assert!(err.is_retryable());
        staller.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_write_timeout_never_commits_and_retry_is_arrival() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.db", uuid::Uuid::new_v4()));
        let store = LogStore::open(&path).await.unwrap();
        let mut s = settings();
        s.persist_timeout = Duration::from_millis(50);
        let (engine, store) = engine_on(store, recording(), s).await;

        // A second connection holds the write lock. WAL still serves the
        // identity read, so the scan stalls inside its own transaction.
        let blocker = rusqlite::Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let scan = live_scan(&[1.0, 0.0, 0.0]);
        let err = engine
            .verify_and_log_at("E1", &scan, at(2, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PersistenceTimeout));
        assert!(err.is_retryable());

        // Release the lock; the stalled write runs to its commit point and
        // rolls back. Reads queue behind it on the connection thread.
        blocker.execute_batch("COMMIT").unwrap();
        drop(blocker);
        assert!(store.entries_for("E1").await.unwrap().is_empty());

        let retry = engine.verify_and_log_at("E1", &scan, at(2, 9)).await.unwrap();
        assert_eq!(retry.direction(), Some(Direction::Arrival));
        let departure = engine.verify_and_log_at("E1", &scan, at(2, 17)).await.unwrap();
        assert_eq!(departure.direction(), Some(Direction::Departure));

        drop((engine, store));
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }
}
