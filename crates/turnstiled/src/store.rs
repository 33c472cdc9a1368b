//! SQLite-backed attendance log and enrollment store.
//!
//! All access goes through one `tokio-rusqlite` connection thread. Each scan
//! is recorded by a single closure running an `IMMEDIATE` transaction, so the
//! lookup and the write for a `(subject, day)` key can never interleave with
//! another scan's. `UNIQUE(subject_id, day)` backs this up at the schema level.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_rusqlite::Connection;
use turnstile_core::{
    AttendanceLogEntry, DayState, DayWindow, Direction, Embedding, EnrolledIdentity,
    EnrollmentError, GeoPoint, LivenessSignals, RejectReason, ScanEvent,
};
use uuid::Uuid;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    CREATE TABLE IF NOT EXISTS identities (
        subject_id    TEXT PRIMARY KEY,
        embeddings    TEXT NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS attendance_log (
        id                  TEXT PRIMARY KEY,
        subject_id          TEXT NOT NULL,
        day                 TEXT NOT NULL,
        entry_time_ms       INTEGER NOT NULL,
        exit_time_ms        INTEGER,
        device_id           TEXT,
        exit_device_id      TEXT,
        latitude            REAL,
        longitude           REAL,
        is_live             INTEGER NOT NULL,
        liveness_confidence REAL NOT NULL,
        phone_detected      INTEGER NOT NULL,
        spoof_attempt       INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_log_subject_day
        ON attendance_log (subject_id, day);
    CREATE INDEX IF NOT EXISTS idx_log_subject_entry
        ON attendance_log (subject_id, entry_time_ms);
";

const ENTRY_COLUMNS: &str = "id, subject_id, day, entry_time_ms, exit_time_ms, device_id, \
     exit_device_id, latitude, longitude, is_live, liveness_confidence, phone_detected, \
     spoof_attempt";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("data directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored embeddings for {subject} are unreadable: {reason}")]
    CorruptIdentity { subject: String, reason: String },
    #[error("embeddings encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("write abandoned by its caller and rolled back")]
    Abandoned,
}

/// Result of applying one accepted scan to the day's entry.
pub type Transition = Result<(Direction, AttendanceLogEntry), RejectReason>;

const PENDING: u8 = 0;
const COMMITTING: u8 = 1;
const ABANDONED: u8 = 2;

/// Decides, exactly once, whether a queued write commits or is abandoned.
///
/// The connection thread claims the guard immediately before committing; a
/// caller that gives up claims it first and the transaction rolls back.
#[derive(Debug, Clone, Default)]
pub struct CommitGuard(Arc<AtomicU8>);

impl CommitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_commit(&self) -> bool {
        self.0
            .compare_exchange(PENDING, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give up on the write. Returns `false` if it is already committing.
    pub fn abandon(&self) -> bool {
        self.0
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Clone)]
pub struct LogStore {
    conn: Connection,
}

impl LogStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path).await?;
        tracing::info!(path = %path.display(), "opened attendance database");
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|c| {
            c.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Replace a subject's enrolled embeddings.
    pub async fn upsert_identity(
        &self,
        identity: &EnrolledIdentity,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let subject = identity.subject_id().to_string();
        let embeddings = serde_json::to_string(identity.embeddings())?;
        let now_ms = now.timestamp_millis();
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO identities (subject_id, embeddings, updated_at_ms)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(subject_id) DO UPDATE SET
                         embeddings = excluded.embeddings,
                         updated_at_ms = excluded.updated_at_ms",
                    params![subject, embeddings, now_ms],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn identity(&self, subject_id: &str) -> Result<Option<EnrolledIdentity>, StoreError> {
        let subject = subject_id.to_string();
        let raw: Option<String> = self
            .conn
            .call(move |c| {
                let raw = c
                    .query_row(
                        "SELECT embeddings FROM identities WHERE subject_id = ?1",
                        params![subject],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(raw)
            })
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let corrupt = |reason: String| StoreError::CorruptIdentity {
            subject: subject_id.to_string(),
            reason,
        };
        let embeddings: Vec<Embedding> =
            serde_json::from_str(&raw).map_err(|e| corrupt(e.to_string()))?;
        EnrolledIdentity::new(subject_id, embeddings)
            .map(Some)
            .map_err(|e: EnrollmentError| corrupt(e.to_string()))
    }

    /// Apply an accepted scan to the subject's entry for `window`.
    ///
    /// Creates the entry (arrival), sets its exit time (departure), or leaves
    /// it untouched (already checked out). Nothing is written if `guard` was
    /// abandoned before the transaction reached its commit.
    pub async fn record_scan(
        &self,
        subject_id: &str,
        scan: &ScanEvent,
        window: DayWindow,
        now: DateTime<Utc>,
        guard: &CommitGuard,
    ) -> Result<Transition, StoreError> {
        let subject = subject_id.to_string();
        let device_id = scan.device_id.clone();
        let location = scan.location;
        let liveness = scan.liveness;
        // Stored at millisecond precision; keep the returned entry identical.
        let now = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        let new_id = Uuid::new_v4().to_string();
        let guard = guard.clone();

        let transition = self
            .conn
            .call(move |c| {
                let tx = c.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let existing = tx
                    .query_row(
                        &format!(
                            "SELECT {ENTRY_COLUMNS} FROM attendance_log
                             WHERE subject_id = ?1 AND entry_time_ms >= ?2 AND entry_time_ms < ?3
                             ORDER BY entry_time_ms LIMIT 1"
                        ),
                        params![
                            subject,
                            window.start.timestamp_millis(),
                            window.end.timestamp_millis()
                        ],
                        row_to_entry,
                    )
                    .optional()?;

                let state = DayState::of(existing.as_ref());
                let transition = match (state.on_accepted_scan(), existing) {
                    (Err(reason), _) => Err(reason),
                    (Ok((_, direction)), Some(mut entry)) => {
                        let changed = tx.execute(
                            "UPDATE attendance_log SET exit_time_ms = ?1, exit_device_id = ?2
                             WHERE id = ?3 AND exit_time_ms IS NULL",
                            params![now.timestamp_millis(), device_id, entry.id],
                        )?;
                        if changed == 1 {
                            entry.exit_time = Some(now);
                            entry.exit_device_id = device_id;
                            Ok((direction, entry))
                        } else {
                            Err(RejectReason::AlreadyCheckedOut)
                        }
                    }
                    (Ok((_, direction)), None) => {
                        let entry = AttendanceLogEntry {
                            id: new_id,
                            subject_id: subject,
                            day: window.day,
                            entry_time: now,
                            exit_time: None,
                            device_id,
                            exit_device_id: None,
                            location,
                            liveness,
                        };
                        insert_entry(&tx, &entry)?;
                        Ok((direction, entry))
                    }
                };

                if !guard.try_commit() {
                    // Dropping the transaction rolls it back.
                    return Ok(None);
                }
                tx.commit()?;
                Ok(Some(transition))
            })
            .await?;
        transition.ok_or(StoreError::Abandoned)
    }

    /// All entries for one subject, oldest first.
    pub async fn entries_for(
        &self,
        subject_id: &str,
    ) -> Result<Vec<AttendanceLogEntry>, StoreError> {
        let subject = subject_id.to_string();
        let entries = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM attendance_log
                     WHERE subject_id = ?1 ORDER BY entry_time_ms"
                ))?;
                let rows = stmt.query_map(params![subject], row_to_entry)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(entries)
    }

    /// Every entry in the log, oldest first.
    pub async fn all_entries(&self) -> Result<Vec<AttendanceLogEntry>, StoreError> {
        let entries = self
            .conn
            .call(|c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM attendance_log ORDER BY subject_id, entry_time_ms"
                ))?;
                let rows = stmt.query_map([], row_to_entry)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(entries)
    }

    /// Entries whose arrival falls in `window`, newest first.
    pub async fn entries_on(
        &self,
        subject_id: Option<&str>,
        window: DayWindow,
    ) -> Result<Vec<AttendanceLogEntry>, StoreError> {
        let subject = subject_id.map(str::to_string);
        let entries = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM attendance_log
                     WHERE (?1 IS NULL OR subject_id = ?1)
                       AND entry_time_ms >= ?2 AND entry_time_ms < ?3
                     ORDER BY entry_time_ms DESC"
                ))?;
                let rows = stmt.query_map(
                    params![
                        subject,
                        window.start.timestamp_millis(),
                        window.end.timestamp_millis()
                    ],
                    row_to_entry,
                )?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await?;
        Ok(entries)
    }
}

#[cfg(test)]
impl LogStore {
    /// Occupy the connection thread, delaying every call queued behind it.
    pub async fn stall(&self, duration: std::time::Duration) -> Result<(), StoreError> {
        self.conn
            .call(move |_| {
                std::thread::sleep(duration);
                Ok(())
            })
            .await?;
        Ok(())
    }
}

fn insert_entry(conn: &rusqlite::Connection, entry: &AttendanceLogEntry) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO attendance_log ({ENTRY_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            entry.id,
            entry.subject_id,
            entry.day,
            entry.entry_time.timestamp_millis(),
            entry.exit_time.map(|t| t.timestamp_millis()),
            entry.device_id,
            entry.exit_device_id,
            entry.location.map(|p| p.latitude),
            entry.location.map(|p| p.longitude),
            entry.liveness.is_live,
            f64::from(entry.liveness.liveness_confidence),
            entry.liveness.phone_detected,
            entry.liveness.spoof_attempt,
        ],
    )?;
    Ok(())
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<AttendanceLogEntry> {
    let day: NaiveDate = row.get(2)?;
    let entry_ms: i64 = row.get(3)?;
    let exit_ms: Option<i64> = row.get(4)?;
    let latitude: Option<f64> = row.get(7)?;
    let longitude: Option<f64> = row.get(8)?;
    let confidence: f64 = row.get(10)?;

    Ok(AttendanceLogEntry {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        day,
        entry_time: utc_from_millis(3, entry_ms)?,
        exit_time: exit_ms.map(|ms| utc_from_millis(4, ms)).transpose()?,
        device_id: row.get(5)?,
        exit_device_id: row.get(6)?,
        location: latitude
            .zip(longitude)
            .map(|(latitude, longitude)| GeoPoint {
                latitude,
                longitude,
            }),
        liveness: LivenessSignals {
            is_live: row.get(9)?,
            liveness_confidence: confidence as f32,
            phone_detected: row.get(11)?,
            spoof_attempt: row.get(12)?,
        },
    })
}

fn utc_from_millis(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}
